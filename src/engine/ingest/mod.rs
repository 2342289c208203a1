// Tahlil Engine — Ingestion Pipeline
//
// Drives an upload from raw bytes to a completed workspace:
//   detect type → parse (tabular | statement | vision) → persist parsed
//   records → embed + index evidence docs → summary metadata → completed.
//
// Runs as a background task; the UI polls the upload status. Any failure
// marks the upload `failed` with a short reason in summary_metadata.

pub mod detect;
pub mod statement;
pub mod tabular;
pub mod vision;

use crate::atoms::error::{EngineError, EngineResult};
use crate::atoms::types::*;
use crate::engine::embedding::EmbeddingClient;
use crate::engine::index::VectorIndex;
use crate::engine::store::WorkspaceStore;
use chrono::NaiveDate;
use log::{error, info};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde_json::{json, Map, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use vision::{VisionOutcome, VisionProcessor};

pub struct IngestService {
    store: Arc<WorkspaceStore>,
    index: Arc<VectorIndex>,
    embedder: Arc<EmbeddingClient>,
    vision: Arc<VisionProcessor>,
}

/// What a parse produced, before persistence.
enum ParsedDocument {
    Transactions { transactions: Vec<Transaction>, rows_dropped: usize, confidence: Option<f64> },
    Statement { statement: FinancialStatement, confidence: Option<f64> },
}

impl IngestService {
    pub fn new(
        store: Arc<WorkspaceStore>,
        index: Arc<VectorIndex>,
        embedder: Arc<EmbeddingClient>,
        vision: Arc<VisionProcessor>,
    ) -> Self {
        IngestService { store, index, embedder, vision }
    }

    /// Full pipeline for one stored upload. Status transitions and failure
    /// recording happen here; callers just observe the upload row.
    pub async fn ingest(
        &self,
        user_id: &str,
        upload_id: &str,
        stored_path: &Path,
        original_filename: &str,
    ) -> EngineResult<()> {
        self.store.set_status(upload_id, UploadStatus::Processing)?;

        match self.run_pipeline(user_id, upload_id, stored_path, original_filename).await {
            Ok(()) => {
                self.store.set_status(upload_id, UploadStatus::Completed)?;
                info!("[ingest] upload {} completed", upload_id);
                Ok(())
            }
            Err(e) => {
                error!("[ingest] upload {} failed: {}", upload_id, e);
                let mut summary = Map::new();
                summary.insert("error".into(), Value::String(e.to_string()));
                self.store.set_summary_metadata(upload_id, &summary).ok();
                self.store.set_status(upload_id, UploadStatus::Failed)?;
                Err(e)
            }
        }
    }

    async fn run_pipeline(
        &self,
        user_id: &str,
        upload_id: &str,
        path: &Path,
        filename: &str,
    ) -> EngineResult<()> {
        let detection = detect::detect(path, filename)?;
        let doc_type = detection.document_type;
        self.store.set_document_type(upload_id, doc_type)?;

        let parsed = self.parse(path, filename, doc_type).await?;

        match parsed {
            ParsedDocument::Transactions { transactions, rows_dropped, confidence } => {
                self.store.insert_transactions(upload_id, &transactions)?;

                let docs = self
                    .embed_docs(transaction_docs(upload_id, user_id, &transactions))
                    .await?;
                self.index.insert(&docs)?;

                let summary =
                    transaction_summary(&transactions, rows_dropped, confidence);
                self.store.set_summary_metadata(upload_id, &summary)?;
            }
            ParsedDocument::Statement { statement, confidence } => {
                self.store.put_statement(upload_id, &statement)?;

                let docs = self
                    .embed_docs(statement_docs(upload_id, user_id, &statement))
                    .await?;
                self.index.insert(&docs)?;

                let summary = statement_summary(&statement, confidence);
                self.store.set_summary_metadata(upload_id, &summary)?;
            }
        }

        Ok(())
    }

    async fn parse(
        &self,
        path: &Path,
        filename: &str,
        doc_type: DocumentType,
    ) -> EngineResult<ParsedDocument> {
        let lower = filename.to_lowercase();
        let is_pdf = lower.ends_with(".pdf");
        let is_sheet = lower.ends_with(".xls") || lower.ends_with(".xlsx");

        match (doc_type, is_pdf) {
            (DocumentType::Transactions, true) => {
                let result = self.vision.process(path, doc_type).await?;
                match result.outcome {
                    VisionOutcome::Transactions(transactions) => Ok(ParsedDocument::Transactions {
                        transactions,
                        rows_dropped: 0,
                        confidence: Some(result.confidence),
                    }),
                    VisionOutcome::Statement(_) => Err(EngineError::IngestionParseFailed(
                        "vision output did not match the detected document type".into(),
                    )),
                }
            }
            (DocumentType::Transactions, false) => {
                let parsed = if is_sheet {
                    tabular::parse_excel(path)?
                } else {
                    tabular::parse_csv_bytes(&std::fs::read(path)?)?
                };
                Ok(ParsedDocument::Transactions {
                    transactions: parsed.transactions,
                    rows_dropped: parsed.rows_dropped,
                    confidence: None,
                })
            }
            (DocumentType::FinancialStatement, true) => {
                let result = self.vision.process(path, doc_type).await?;
                match result.outcome {
                    VisionOutcome::Statement(statement) => Ok(ParsedDocument::Statement {
                        statement,
                        confidence: Some(result.confidence),
                    }),
                    VisionOutcome::Transactions(_) => Err(EngineError::IngestionParseFailed(
                        "vision output did not match the detected document type".into(),
                    )),
                }
            }
            (DocumentType::FinancialStatement, false) => {
                let statement = if is_sheet {
                    statement::parse_excel_statement(path)?
                } else {
                    // CSV exports of statements go through the same
                    // positional row pipeline as Excel.
                    let text = String::from_utf8_lossy(&std::fs::read(path)?).into_owned();
                    let rows: Vec<Vec<String>> = text
                        .lines()
                        .map(|l| l.split(',').map(|c| c.trim().to_string()).collect())
                        .collect();
                    statement::parse_report_rows(&rows)?
                };
                Ok(ParsedDocument::Statement { statement, confidence: None })
            }
        }
    }

    /// Embed every doc's text. The content-hash cache makes re-ingestion
    /// of previously seen rows free.
    async fn embed_docs(&self, mut docs: Vec<VectorDoc>) -> EngineResult<Vec<VectorDoc>> {
        for doc in &mut docs {
            doc.embedding = self.embedder.embed(&doc.text).await?;
        }
        Ok(docs)
    }
}

// ── Evidence rendering ─────────────────────────────────────────────────────

pub(crate) fn date_to_ts(date: NaiveDate) -> i64 {
    date.and_hms_opt(0, 0, 0)
        .map(|dt| dt.and_utc().timestamp())
        .unwrap_or_default()
}

/// Semantic tags derived from a transaction description; the fee hunter
/// and investigator agents filter on these.
pub(crate) fn semantic_tags(description: &str) -> Vec<String> {
    let lower = description.to_lowercase();
    let mut tags = Vec::new();
    let checks: [(&str, &[&str]); 5] = [
        ("fee", &["fee", "charge", "commission", "penalty", "vat", "رسوم", "عمولة"]),
        ("salary", &["salary", "payroll", "wages", "راتب"]),
        ("atm", &["atm", "cash withdrawal", "صراف"]),
        ("transfer", &["transfer", "iban", "sarie", "تحويل"]),
        ("pos", &["pos", "purchase", "mada", "نقاط البيع"]),
    ];
    for (tag, tokens) in checks {
        if tokens.iter().any(|t| lower.contains(t)) {
            tags.push(tag.to_string());
        }
    }
    tags
}

fn transaction_docs(upload_id: &str, user_id: &str, txns: &[Transaction]) -> Vec<VectorDoc> {
    txns.iter()
        .enumerate()
        .map(|(seq, t)| {
            let mut text = format!(
                "{} | {} | {} {}",
                t.date.format("%Y-%m-%d"),
                t.description,
                t.kind.as_str(),
                t.amount
            );
            if let Some(balance) = t.balance {
                text.push_str(&format!(" | balance {}", balance));
            }
            VectorDoc {
                id: format!("{}-txn-{}", upload_id, seq),
                text,
                embedding: Vec::new(),
                meta: DocMeta {
                    upload_id: upload_id.to_string(),
                    user_id: user_id.to_string(),
                    kind: t.kind.as_str().to_string(),
                    date_ts: Some(date_to_ts(t.date)),
                    amount: t.amount.to_f64(),
                    category: t.category.clone(),
                    tags: semantic_tags(&t.description),
                },
            }
        })
        .collect()
}

fn line_item_text(item: &LineItem) -> String {
    let fmt = |v: Option<Decimal>| v.map(|d| d.to_string()).unwrap_or_else(|| "n/a".into());
    format!("current {}, prior {}", fmt(item.current), fmt(item.prior))
}

fn statement_docs(upload_id: &str, user_id: &str, stmt: &FinancialStatement) -> Vec<VectorDoc> {
    let bs = &stmt.balance_sheet;
    let is = &stmt.income_statement;
    let cf = &stmt.cash_flow_statement;

    let lines: [(&str, &str, &LineItem); 20] = [
        ("balance_sheet", "cash and cash equivalents", &bs.assets.cash),
        ("balance_sheet", "receivables", &bs.assets.receivables),
        ("balance_sheet", "inventory", &bs.assets.inventory),
        ("balance_sheet", "current assets", &bs.assets.current),
        ("balance_sheet", "non-current assets", &bs.assets.non_current),
        ("balance_sheet", "total assets", &bs.assets.total),
        ("balance_sheet", "current liabilities", &bs.liabilities.current),
        ("balance_sheet", "non-current liabilities", &bs.liabilities.non_current),
        ("balance_sheet", "total liabilities", &bs.liabilities.total),
        ("balance_sheet", "total equity", &bs.equity.total),
        ("income_statement", "revenue", &is.revenue),
        ("income_statement", "cost of revenue", &is.cost_of_revenue),
        ("income_statement", "gross profit", &is.gross_profit),
        ("income_statement", "operating expenses", &is.operating_expenses),
        ("income_statement", "operating income", &is.operating_income),
        ("income_statement", "net income", &is.net_income),
        ("cash_flow", "operating activities", &cf.operating),
        ("cash_flow", "investing activities", &cf.investing),
        ("cash_flow", "financing activities", &cf.financing),
        ("cash_flow", "net change in cash", &cf.net_change),
    ];

    let mut docs: Vec<VectorDoc> = lines
        .iter()
        .filter(|(_, _, item)| !item.is_empty())
        .enumerate()
        .map(|(i, (section, label, item))| VectorDoc {
            id: format!("{}-fs-{}", upload_id, i),
            text: format!("{} {}: {}", section, label, line_item_text(item)),
            embedding: Vec::new(),
            meta: DocMeta {
                upload_id: upload_id.to_string(),
                user_id: user_id.to_string(),
                kind: "financial_statement".to_string(),
                date_ts: None,
                amount: item.current.and_then(|d| d.to_f64()),
                category: Some(section.to_string()),
                tags: vec![label.split_whitespace().next().unwrap_or("").to_string()],
            },
        })
        .collect();

    // Ratios ride along as one evidence doc per figure.
    let r = &stmt.ratios;
    let ratio_lines: [(&str, &RatioItem); 8] = [
        ("current_ratio", &r.current_ratio),
        ("quick_ratio", &r.quick_ratio),
        ("debt_to_equity", &r.debt_to_equity),
        ("gross_margin", &r.gross_margin),
        ("net_margin", &r.net_margin),
        ("roa", &r.roa),
        ("roe", &r.roe),
        ("asset_turnover", &r.asset_turnover),
    ];
    for (label, item) in ratio_lines {
        let (Some(current), prior) = (item.current, item.prior) else {
            continue;
        };
        let prior_txt = prior.map(|p| format!("{:.4}", p)).unwrap_or_else(|| "n/a".into());
        docs.push(VectorDoc {
            id: format!("{}-ratio-{}", upload_id, label),
            text: format!("ratios {}: current {:.4}, prior {}", label, current, prior_txt),
            embedding: Vec::new(),
            meta: DocMeta {
                upload_id: upload_id.to_string(),
                user_id: user_id.to_string(),
                kind: "financial_statement".to_string(),
                date_ts: None,
                amount: Some(current),
                category: Some("ratios".to_string()),
                tags: vec![label.to_string()],
            },
        });
    }

    docs
}

// ── Summary metadata ───────────────────────────────────────────────────────

fn transaction_summary(
    txns: &[Transaction],
    rows_dropped: usize,
    confidence: Option<f64>,
) -> Map<String, Value> {
    let mut total_debit = Decimal::ZERO;
    let mut total_credit = Decimal::ZERO;
    for t in txns {
        match t.kind {
            TxnKind::Debit => total_debit += t.amount,
            TxnKind::Credit => total_credit += t.amount,
            TxnKind::Unknown => {}
        }
    }
    let from = txns.iter().map(|t| t.date).min();
    let to = txns.iter().map(|t| t.date).max();

    let mut summary = Map::new();
    summary.insert("rows".into(), json!(txns.len()));
    summary.insert("total_debit".into(), json!(total_debit.to_string()));
    summary.insert("total_credit".into(), json!(total_credit.to_string()));
    if let (Some(from), Some(to)) = (from, to) {
        summary.insert(
            "date_range".into(),
            json!({
                "from": from.format("%Y-%m-%d").to_string(),
                "to": to.format("%Y-%m-%d").to_string(),
            }),
        );
    }
    if rows_dropped > 0 {
        summary.insert("rows_dropped".into(), json!(rows_dropped));
        summary.insert(
            "warnings".into(),
            json!([format!("{} rows could not be parsed and were skipped", rows_dropped)]),
        );
    }
    if let Some(c) = confidence {
        summary.insert("confidence".into(), json!(c));
    }
    summary
}

fn statement_summary(stmt: &FinancialStatement, confidence: Option<f64>) -> Map<String, Value> {
    let mut summary = Map::new();
    if let Some(name) = &stmt.company_info.name {
        summary.insert("company".into(), json!(name));
    }
    let periods: Vec<&String> = [&stmt.company_info.period_current, &stmt.company_info.period_prior]
        .into_iter()
        .flatten()
        .collect();
    if !periods.is_empty() {
        summary.insert("periods".into(), json!(periods));
    }
    let ratio_count = {
        let r = &stmt.ratios;
        [
            r.current_ratio, r.quick_ratio, r.debt_to_equity, r.gross_margin,
            r.net_margin, r.roa, r.roe, r.asset_turnover,
        ]
        .iter()
        .filter(|ri| ri.current.is_some())
        .count()
    };
    summary.insert("ratios".into(), json!(ratio_count));
    if let Some(c) = confidence {
        summary.insert("confidence".into(), json!(c));
    }
    summary
}

/// Where an upload's original file lives on disk. Kept as a free function
/// so the delete cascade can locate artefacts without an IngestService.
pub fn stored_file_path(uploads_dir: &Path, upload_id: &str, original_filename: &str) -> PathBuf {
    let ext = Path::new(original_filename)
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("bin");
    uploads_dir.join(format!("{}.{}", upload_id, ext))
}

/// Remove every stored artefact tagged with this upload id. Idempotent.
pub fn remove_stored_files(uploads_dir: &Path, upload_id: &str) -> std::io::Result<()> {
    let Ok(entries) = std::fs::read_dir(uploads_dir) else {
        return Ok(());
    };
    for entry in entries.filter_map(|e| e.ok()) {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name.starts_with(upload_id) {
            std::fs::remove_file(entry.path())?;
        }
    }
    Ok(())
}

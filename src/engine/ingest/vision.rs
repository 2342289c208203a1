// Tahlil Engine — Vision PDF Processor
//
// Scanned and digital PDFs take this path: pages are rasterised with
// poppler's pdftoppm, each relevant page goes to the multimodal model with
// a document-type-specific JSON-only prompt, defective JSON is repaired,
// and per-page structures are merged into one document. A page that still
// fails to parse gets exactly one retry with an aggressively minimised
// prompt.
//
// Per-field confidence never leaves this module; callers see one overall
// document confidence.

use crate::atoms::constants::{INSIGHTS_TIMEOUT_SECS, VISION_MAX_PAGES, VISION_PDF_DPI};
use crate::atoms::error::{EngineError, EngineResult};
use crate::atoms::types::{DocumentType, FinancialStatement, Transaction, TxnKind};
use crate::engine::ingest::statement;
use crate::engine::ingest::tabular::parse_date;
use crate::engine::llm::{GenerateRequest, LlmGateway};
use base64::Engine as _;
use log::{info, warn};
use rust_decimal::Decimal;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

// ── Prompts ────────────────────────────────────────────────────────────────

const TRANSACTIONS_PROMPT: &str = "You are reading one page of a bank account statement. \
Extract every transaction row visible on this page.\n\
Respond with JSON ONLY, no prose, exactly this shape:\n\
{\"transactions\": [{\"date\": \"YYYY-MM-DD\", \"description\": \"...\", \
\"amount\": 123.45, \"kind\": \"debit\"|\"credit\", \"balance\": 123.45}], \
\"confidence\": 0.0}\n\
Rules: amounts are positive numbers; use \"kind\" for direction; \
use null for any missing value — never a bare hyphen; \
confidence is your 0..1 estimate for this page.";

const STATEMENT_PROMPT: &str = "You are reading one page of a corporate financial statement. \
Extract every figure visible on this page into JSON ONLY, no prose:\n\
{\"company_info\": {\"name\": null, \"period_current\": null, \"period_prior\": null},\n\
 \"balance_sheet\": {\"assets\": {\"cash\": {\"current\": null, \"prior\": null}, \
\"receivables\": {}, \"inventory\": {}, \"current\": {}, \"non_current\": {}, \"total\": {}},\n\
  \"liabilities\": {\"current\": {}, \"non_current\": {}, \"total\": {}}, \"equity\": {\"total\": {}}},\n\
 \"income_statement\": {\"revenue\": {}, \"cost_of_revenue\": {}, \"gross_profit\": {}, \
\"operating_expenses\": {}, \"operating_income\": {}, \"net_income\": {}},\n\
 \"cash_flow_statement\": {\"operating\": {}, \"investing\": {}, \"financing\": {}, \"net_change\": {}},\n\
 \"confidence\": 0.0}\n\
Every leaf is {\"current\": number|null, \"prior\": number|null}. \
Use null for anything not on this page — never a bare hyphen, never 0 for missing. \
Omit nothing you can read.";

const RETRY_PROMPT: &str = "Extract the figures from this page. Output valid JSON only. \
Missing values are null.";

// ── JSON repair ────────────────────────────────────────────────────────────

/// Fix the defects small vision models habitually produce: code fences,
/// smart quotes, bare hyphens for missing values, trailing commas.
pub(crate) fn repair_json(raw: &str) -> String {
    let mut s = raw.trim().to_string();

    if let Some(stripped) = s.strip_prefix("```json") {
        s = stripped.trim_start().to_string();
    } else if let Some(stripped) = s.strip_prefix("```") {
        s = stripped.trim_start().to_string();
    }
    if let Some(stripped) = s.strip_suffix("```") {
        s = stripped.trim_end().to_string();
    }

    s = s
        .replace(['\u{201C}', '\u{201D}'], "\"")
        .replace(['\u{2018}', '\u{2019}'], "'");

    // ": -" (a bare hyphen standing in for a missing value) → ": null"
    let bare_hyphen = regex::Regex::new(r#":\s*-\s*([,}\]])"#).expect("static regex");
    s = bare_hyphen.replace_all(&s, ": null$1").into_owned();
    let quoted_hyphen = regex::Regex::new(r#":\s*"-"\s*"#).expect("static regex");
    s = quoted_hyphen.replace_all(&s, ": null").into_owned();

    // Trailing commas before a closing brace/bracket.
    let trailing_comma = regex::Regex::new(r#",\s*([}\]])"#).expect("static regex");
    s = trailing_comma.replace_all(&s, "$1").into_owned();

    s
}

/// The JSON body of a possibly chatty reply: first '{' through last '}'.
pub(crate) fn extract_json(raw: &str) -> Option<&str> {
    let start = raw.find('{')?;
    let end = raw.rfind('}')?;
    if end > start {
        Some(&raw[start..=end])
    } else {
        None
    }
}

fn parse_page_json(raw: &str) -> Option<Value> {
    let repaired = repair_json(raw);
    let body = extract_json(&repaired)?;
    serde_json::from_str(body).ok()
}

/// Deep merge of per-page objects: later pages fill nulls and new keys,
/// arrays concatenate, scalar conflicts keep the first-seen value.
pub(crate) fn merge_pages(into: &mut Value, page: Value) {
    match (into, page) {
        (Value::Object(a), Value::Object(b)) => {
            for (k, v) in b {
                match a.get_mut(&k) {
                    Some(slot) if slot.is_null() => {
                        *slot = v;
                    }
                    Some(slot) => merge_pages(slot, v),
                    None => {
                        a.insert(k, v);
                    }
                }
            }
        }
        (Value::Array(a), Value::Array(b)) => {
            a.extend(b);
        }
        _ => {}
    }
}

// ── Rasterisation ──────────────────────────────────────────────────────────

/// Render PDF pages to PNGs under a scratch directory via pdftoppm.
fn rasterise_pages(pdf: &Path, scratch: &Path) -> EngineResult<Vec<PathBuf>> {
    std::fs::create_dir_all(scratch)?;
    let prefix = scratch.join("page");

    let output = std::process::Command::new("pdftoppm")
        .arg("-png")
        .arg("-r")
        .arg(VISION_PDF_DPI.to_string())
        .arg(pdf)
        .arg(&prefix)
        .output()
        .map_err(|e| {
            EngineError::Config(format!("pdftoppm (poppler-utils) not available: {}", e))
        })?;

    if !output.status.success() {
        return Err(EngineError::IngestionParseFailed(format!(
            "pdftoppm failed: {}",
            String::from_utf8_lossy(&output.stderr)
        )));
    }

    let mut pages: Vec<PathBuf> = std::fs::read_dir(scratch)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.extension().is_some_and(|ext| ext == "png"))
        .collect();
    pages.sort();
    if pages.len() > VISION_MAX_PAGES {
        warn!("[ingest] PDF has {} pages — truncating to {}", pages.len(), VISION_MAX_PAGES);
        pages.truncate(VISION_MAX_PAGES);
    }
    if pages.is_empty() {
        return Err(EngineError::IngestionParseFailed("PDF produced no pages".into()));
    }
    Ok(pages)
}

// ── Processor ──────────────────────────────────────────────────────────────

#[derive(Debug)]
pub enum VisionOutcome {
    Transactions(Vec<Transaction>),
    Statement(FinancialStatement),
}

#[derive(Debug)]
pub struct VisionResult {
    pub outcome: VisionOutcome,
    /// Mean of per-page confidences; per-field detail stays internal.
    pub confidence: f64,
}

pub struct VisionProcessor {
    gateway: Arc<LlmGateway>,
    model: String,
}

impl VisionProcessor {
    pub fn new(gateway: Arc<LlmGateway>, model: impl Into<String>) -> Self {
        VisionProcessor { gateway, model: model.into() }
    }

    pub async fn process(&self, pdf: &Path, doc_type: DocumentType) -> EngineResult<VisionResult> {
        let scratch = std::env::temp_dir().join(format!("tahlil-vision-{}", uuid::Uuid::new_v4()));
        let result = self.process_inner(pdf, doc_type, &scratch).await;
        let _ = std::fs::remove_dir_all(&scratch);
        result
    }

    async fn process_inner(
        &self,
        pdf: &Path,
        doc_type: DocumentType,
        scratch: &Path,
    ) -> EngineResult<VisionResult> {
        let pages = rasterise_pages(pdf, scratch)?;
        info!("[ingest] vision-processing {} pages of {:?}", pages.len(), pdf.file_name());

        let prompt = match doc_type {
            DocumentType::Transactions => TRANSACTIONS_PROMPT,
            DocumentType::FinancialStatement => STATEMENT_PROMPT,
        };

        let mut merged = Value::Object(serde_json::Map::new());
        let mut confidences = Vec::new();

        for page in &pages {
            let image = base64::engine::general_purpose::STANDARD.encode(std::fs::read(page)?);

            let Some(mut page_json) = self.call_page(prompt, &image).await? else {
                warn!("[ingest] page {:?} unparsable after retry — skipping", page.file_name());
                continue;
            };

            if let Some(c) = page_json.get("confidence").and_then(Value::as_f64) {
                confidences.push(c.clamp(0.0, 1.0));
            }
            if let Some(obj) = page_json.as_object_mut() {
                obj.remove("confidence");
            }
            merge_pages(&mut merged, page_json);
        }

        let confidence = if confidences.is_empty() {
            0.0
        } else {
            confidences.iter().sum::<f64>() / confidences.len() as f64
        };

        let outcome = match doc_type {
            DocumentType::FinancialStatement => {
                VisionOutcome::Statement(statement::from_vision_json(&merged)?)
            }
            DocumentType::Transactions => {
                VisionOutcome::Transactions(transactions_from_json(&merged)?)
            }
        };

        Ok(VisionResult { outcome, confidence })
    }

    /// One page, two attempts: the full prompt, then the minimised one.
    async fn call_page(&self, prompt: &str, image_b64: &str) -> EngineResult<Option<Value>> {
        let mut req = GenerateRequest::new(self.model.clone(), prompt);
        req.images = vec![image_b64.to_string()];
        req.timeout_secs = INSIGHTS_TIMEOUT_SECS;

        let raw = self.gateway.generate(req).await?;
        if let Some(v) = parse_page_json(&raw) {
            return Ok(Some(v));
        }

        warn!("[ingest] page JSON unparsable — re-prompting with minimised prompt");
        let mut retry = GenerateRequest::new(self.model.clone(), RETRY_PROMPT);
        retry.images = vec![image_b64.to_string()];
        retry.timeout_secs = INSIGHTS_TIMEOUT_SECS;

        let raw = self.gateway.generate(retry).await?;
        Ok(parse_page_json(&raw))
    }
}

fn transactions_from_json(root: &Value) -> EngineResult<Vec<Transaction>> {
    let rows = root["transactions"]
        .as_array()
        .ok_or_else(|| EngineError::IngestionParseFailed("no transactions array".into()))?;

    let mut out = Vec::new();
    for row in rows {
        let Some(date) = row["date"].as_str().and_then(parse_date) else {
            continue;
        };
        let amount = match &row["amount"] {
            Value::Number(n) => Decimal::from_str(&n.to_string()).ok(),
            Value::String(s) => Decimal::from_str(s.trim()).ok(),
            _ => None,
        };
        let Some(amount) = amount.map(|a| a.abs()) else {
            continue;
        };
        let kind = match row["kind"].as_str() {
            Some("debit") => TxnKind::Debit,
            Some("credit") => TxnKind::Credit,
            _ => TxnKind::Unknown,
        };
        out.push(Transaction {
            date,
            description: row["description"].as_str().unwrap_or("").to_string(),
            amount,
            kind,
            balance: row["balance"].as_f64().and_then(|b| Decimal::try_from(b).ok()),
            reference: row["reference"].as_str().map(str::to_string),
            category: None,
            metadata: serde_json::Map::new(),
        });
    }

    if out.is_empty() {
        return Err(EngineError::IngestionParseFailed("no usable transaction rows".into()));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repair_strips_code_fences() {
        let raw = "```json\n{\"a\": 1}\n```";
        assert_eq!(repair_json(raw), "{\"a\": 1}");
    }

    #[test]
    fn test_repair_bare_hyphen_to_null() {
        let raw = r#"{"cash": {"current": -, "prior": 5}}"#;
        let fixed = repair_json(raw);
        let v: Value = serde_json::from_str(&fixed).unwrap();
        assert!(v["cash"]["current"].is_null());
    }

    #[test]
    fn test_repair_quoted_hyphen_and_trailing_comma() {
        let raw = r#"{"a": "-", "b": [1, 2,],}"#;
        let fixed = repair_json(raw);
        let v: Value = serde_json::from_str(&fixed).unwrap();
        assert!(v["a"].is_null());
        assert_eq!(v["b"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn test_repair_smart_quotes() {
        let raw = "{\u{201C}a\u{201D}: 1}";
        let v: Value = serde_json::from_str(&repair_json(raw)).unwrap();
        assert_eq!(v["a"], 1);
    }

    #[test]
    fn test_extract_json_from_chatty_reply() {
        let raw = "Sure! Here is the data: {\"x\": 2} Hope that helps.";
        assert_eq!(extract_json(raw), Some("{\"x\": 2}"));
        assert_eq!(extract_json("no json here"), None);
    }

    #[test]
    fn test_merge_pages_fills_nulls_keeps_first_scalar() {
        let mut a = serde_json::json!({"x": null, "y": 1, "nested": {"k": null}});
        let b = serde_json::json!({"x": 2, "y": 99, "nested": {"k": 3}, "z": 4});
        merge_pages(&mut a, b);
        assert_eq!(a["x"], 2);
        assert_eq!(a["y"], 1);
        assert_eq!(a["nested"]["k"], 3);
        assert_eq!(a["z"], 4);
    }

    #[test]
    fn test_merge_pages_concatenates_arrays() {
        let mut a = serde_json::json!({"transactions": [{"d": 1}]});
        let b = serde_json::json!({"transactions": [{"d": 2}]});
        merge_pages(&mut a, b);
        assert_eq!(a["transactions"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn test_transactions_from_json() {
        let v = serde_json::json!({
            "transactions": [
                {"date": "2025-01-05", "description": "POS PURCHASE", "amount": 99.5, "kind": "debit", "balance": null},
                {"date": "junk", "description": "DROPPED", "amount": 1, "kind": "debit"},
                {"date": "2025-01-06", "description": "SALARY", "amount": "3000", "kind": "credit"}
            ]
        });
        let txns = transactions_from_json(&v).unwrap();
        assert_eq!(txns.len(), 2);
        assert_eq!(txns[0].kind, TxnKind::Debit);
        assert_eq!(txns[1].amount, Decimal::from_str("3000").unwrap());
    }
}

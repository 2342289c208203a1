// ── Tahlil Atoms: Pure Data Types ──────────────────────────────────────────
// All plain struct/enum definitions that flow through the entire engine.
// They are independent of any storage or transport concern; serde derives
// define the one wire shape used by both the database JSON columns and the
// HTTP boundary.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// ── Transactions ───────────────────────────────────────────────────────────

/// Direction of an account movement. Amounts are always non-negative;
/// the kind encodes the sign.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TxnKind {
    Debit,
    Credit,
    Unknown,
}

impl TxnKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TxnKind::Debit => "debit",
            TxnKind::Credit => "credit",
            TxnKind::Unknown => "unknown",
        }
    }
}

/// An atomic bank-account movement. Immutable once parsed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub date: NaiveDate,
    pub description: String,
    /// Always ≥ 0; `kind` carries the sign.
    pub amount: Decimal,
    pub kind: TxnKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub balance: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
}

// ── Financial statements ───────────────────────────────────────────────────

/// One reported figure across the two statement periods.
/// Missing data is `None`, never zero.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct LineItem {
    pub current: Option<Decimal>,
    pub prior: Option<Decimal>,
}

impl LineItem {
    pub fn new(current: Option<Decimal>, prior: Option<Decimal>) -> Self {
        LineItem { current, prior }
    }

    pub fn is_empty(&self) -> bool {
        self.current.is_none() && self.prior.is_none()
    }
}

/// A derived or extracted ratio across the two periods.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct RatioItem {
    pub current: Option<f64>,
    pub prior: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompanyInfo {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Label of the reporting period, e.g. "FY2024" or "31 Dec 2024".
    #[serde(skip_serializing_if = "Option::is_none")]
    pub period_current: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub period_prior: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AssetSection {
    pub cash: LineItem,
    pub receivables: LineItem,
    pub inventory: LineItem,
    pub current: LineItem,
    pub non_current: LineItem,
    pub total: LineItem,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LiabilitySection {
    pub current: LineItem,
    pub non_current: LineItem,
    pub total: LineItem,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EquitySection {
    pub total: LineItem,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BalanceSheet {
    pub assets: AssetSection,
    pub liabilities: LiabilitySection,
    pub equity: EquitySection,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IncomeStatement {
    pub revenue: LineItem,
    pub cost_of_revenue: LineItem,
    pub gross_profit: LineItem,
    pub operating_expenses: LineItem,
    pub operating_income: LineItem,
    pub net_income: LineItem,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CashFlowStatement {
    pub operating: LineItem,
    pub investing: LineItem,
    pub financing: LineItem,
    pub net_change: LineItem,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Ratios {
    pub current_ratio: RatioItem,
    pub quick_ratio: RatioItem,
    pub debt_to_equity: RatioItem,
    pub gross_margin: RatioItem,
    pub net_margin: RatioItem,
    pub roa: RatioItem,
    pub roe: RatioItem,
    pub asset_turnover: RatioItem,
}

/// A complete snapshot of a company's books. Immutable once parsed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FinancialStatement {
    pub company_info: CompanyInfo,
    pub balance_sheet: BalanceSheet,
    pub income_statement: IncomeStatement,
    pub cash_flow_statement: CashFlowStatement,
    pub ratios: Ratios,
}

// ── Workspaces (uploads) ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentType {
    Transactions,
    FinancialStatement,
}

impl DocumentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentType::Transactions => "transactions",
            DocumentType::FinancialStatement => "financial_statement",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "transactions" => Some(DocumentType::Transactions),
            "financial_statement" => Some(DocumentType::FinancialStatement),
            _ => None,
        }
    }
}

/// Ingestion status. Advances monotonically; `failed` and `completed`
/// are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadStatus {
    Uploading,
    Processing,
    Completed,
    Failed,
}

impl UploadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            UploadStatus::Uploading => "uploading",
            UploadStatus::Processing => "processing",
            UploadStatus::Completed => "completed",
            UploadStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "uploading" => Some(UploadStatus::Uploading),
            "processing" => Some(UploadStatus::Processing),
            "completed" => Some(UploadStatus::Completed),
            "failed" => Some(UploadStatus::Failed),
            _ => None,
        }
    }
}

/// The root aggregate: one ingested document and all its derived state.
/// Unit of isolation and of deletion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Upload {
    pub upload_id: String,
    pub user_id: String,
    pub filename: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub document_type: Option<DocumentType>,
    pub status: UploadStatus,
    pub created_at: DateTime<Utc>,
    /// Counts, date range, parse warnings. Populated at `completed`.
    #[serde(default)]
    pub summary_metadata: Map<String, Value>,
}

// ── Chat ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    User,
    Assistant,
}

impl ChatRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChatRole::User => "user",
            ChatRole::Assistant => "assistant",
        }
    }
}

/// One turn of a conversation bound to an upload. Ordering within an
/// upload is by `created_at`, strictly monotonic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: i64,
    pub upload_id: String,
    pub user_id: String,
    pub role: ChatRole,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_name: Option<String>,
    pub created_at: DateTime<Utc>,
}

// ── Analysis results ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnalysisStatus {
    Completed,
    Failed,
}

/// The user-visible output of one agent's insights run. The hidden
/// reasoning trace is never part of this type: `summary` has all
/// `<think>…</think>` segments stripped before construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub status: AnalysisStatus,
    /// User-facing markdown.
    pub summary: String,
    /// Agent-specific key facts, keyed per the agent's findings contract.
    #[serde(default)]
    pub findings: Map<String, Value>,
}

impl AnalysisResult {
    /// Placeholder for an agent that could not complete its run. The run
    /// as a whole still succeeds.
    pub fn failed(reason: impl Into<String>) -> Self {
        AnalysisResult {
            status: AnalysisStatus::Failed,
            summary: reason.into(),
            findings: Map::new(),
        }
    }
}

/// A durable `analysis_results` row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredAnalysis {
    pub upload_id: String,
    pub user_id: String,
    pub agent_name: String,
    pub result: AnalysisResult,
    pub created_at: DateTime<Utc>,
    pub mode: String,
}

// ── Vector documents ───────────────────────────────────────────────────────

/// Structured metadata attached to every indexed document. Every doc
/// carries a non-empty `upload_id`; all retrieval is filtered by it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DocMeta {
    pub upload_id: String,
    pub user_id: String,
    /// "debit" | "credit" | "unknown" for transactions, section name for
    /// statement lines.
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub date_ts: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub amount: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

/// An indexed piece of evidence: natural-language rendition of a record
/// plus its embedding and structured metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorDoc {
    pub id: String,
    pub text: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub embedding: Vec<f32>,
    pub meta: DocMeta,
}

// ── Utility ────────────────────────────────────────────────────────────────

/// UTF-8–safe string truncation. Returns a `&str` of at most `max_bytes`
/// bytes, backing up to the previous char boundary if `max_bytes` falls
/// inside a multi-byte character.
///
/// Use this instead of `&s[..s.len().min(N)]` which panics on non-ASCII.
pub fn truncate_utf8(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_utf8_ascii() {
        assert_eq!(truncate_utf8("hello world", 5), "hello");
        assert_eq!(truncate_utf8("hi", 10), "hi");
    }

    #[test]
    fn test_truncate_utf8_multibyte_boundary() {
        // "ر.س" — Arabic riyal symbol; 2-byte chars must not be split.
        let s = "ر.س 500";
        let t = truncate_utf8(s, 3);
        assert!(s.starts_with(t));
        assert!(t.len() <= 3);
    }

    #[test]
    fn test_document_type_round_trip() {
        for dt in [DocumentType::Transactions, DocumentType::FinancialStatement] {
            assert_eq!(DocumentType::parse(dt.as_str()), Some(dt));
        }
        assert_eq!(DocumentType::parse("invoice"), None);
    }

    #[test]
    fn test_upload_status_round_trip() {
        for st in [
            UploadStatus::Uploading,
            UploadStatus::Processing,
            UploadStatus::Completed,
            UploadStatus::Failed,
        ] {
            assert_eq!(UploadStatus::parse(st.as_str()), Some(st));
        }
    }

    #[test]
    fn test_line_item_missing_is_none_not_zero() {
        let li = LineItem::default();
        assert!(li.is_empty());
        let json = serde_json::to_value(&li).unwrap();
        assert_eq!(json["current"], serde_json::Value::Null);
    }
}

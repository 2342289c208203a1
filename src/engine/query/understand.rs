// Tahlil Engine — Query Understander
//
// One small-model call produces a structured intent: metadata filters, an
// enhanced retrieval query, and an optional agent hint. A deterministic
// layer parses fuzzy time expressions and amount qualifiers regardless,
// both to fill gaps and to survive model failure. The worst case is
// always {original query, no filters}.

use crate::atoms::types::TxnKind;
use crate::engine::index::filter::{Field, Filter};
use crate::engine::ingest::vision::{extract_json, repair_json};
use crate::engine::llm::{GenerateRequest, LlmGateway};
use chrono::{Datelike, NaiveDate};
use log::warn;
use regex::Regex;
use std::sync::{Arc, OnceLock};

// ── Intent ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq)]
pub struct IntentFilters {
    pub date_from: Option<NaiveDate>,
    pub date_to: Option<NaiveDate>,
    pub kind: Option<TxnKind>,
    pub amount_min: Option<f64>,
    pub amount_max: Option<f64>,
    pub category: Option<String>,
    /// "large transactions" and similar, resolved against the workspace's
    /// own distribution (top decile) by the caller, not here.
    pub wants_large: bool,
}

impl IntentFilters {
    /// Render as an index filter. `large_threshold` is the workspace's
    /// resolved top-decile amount, if the caller computed one.
    pub fn to_filter(&self, large_threshold: Option<f64>) -> Filter {
        let mut f = Filter::new();
        if let Some(kind) = self.kind {
            f = f.eq(Field::Kind, kind.as_str());
        }
        if let Some(category) = &self.category {
            f = f.eq(Field::Category, category.clone());
        }
        f = f.date_between(
            self.date_from.map(crate::engine::ingest::date_to_ts),
            self.date_to.map(crate::engine::ingest::date_to_ts),
        );
        let amount_min = self
            .amount_min
            .or(if self.wants_large { large_threshold } else { None });
        f.amount_between(amount_min, self.amount_max)
    }

    pub fn is_empty(&self) -> bool {
        *self == IntentFilters::default()
    }
}

#[derive(Debug, Clone)]
pub struct QueryIntent {
    pub filters: IntentFilters,
    pub enhanced_query: String,
    pub agent_hint: Option<String>,
}

// ── Understander ───────────────────────────────────────────────────────────

const INTENT_PROMPT: &str = "You turn a user's question about their financial data into a \
retrieval intent. Today is {today}. Respond with JSON ONLY:\n\
{\"date_range\": {\"from\": \"YYYY-MM-DD\"|null, \"to\": \"YYYY-MM-DD\"|null},\n \
\"type\": \"debit\"|\"credit\"|null,\n \
\"amount_range\": {\"min\": number|null, \"max\": number|null},\n \
\"category\": string|null,\n \
\"enhanced_query\": \"expanded search phrasing of the question\",\n \
\"agent_hint\": string|null}\n\
Question: {query}";

pub struct QueryUnderstander {
    gateway: Arc<LlmGateway>,
    model: String,
}

impl QueryUnderstander {
    pub fn new(gateway: Arc<LlmGateway>, model: impl Into<String>) -> Self {
        QueryUnderstander { gateway, model: model.into() }
    }

    /// Structured intent for a query. Never fails: model trouble degrades
    /// to the deterministic layer, then to the bare query.
    pub async fn understand(&self, query: &str, today: NaiveDate) -> QueryIntent {
        let mut intent = QueryIntent {
            filters: parse_fuzzy_filters(query, today),
            enhanced_query: query.to_string(),
            agent_hint: None,
        };

        let prompt = INTENT_PROMPT
            .replace("{today}", &today.format("%Y-%m-%d").to_string())
            .replace("{query}", query);

        // Small model: think stays false (the gateway clamps it anyway).
        let req = GenerateRequest::new(self.model.clone(), prompt);
        match self.gateway.generate(req).await {
            Ok(raw) => {
                if let Some(parsed) = parse_intent_json(&raw) {
                    merge_model_intent(&mut intent, parsed);
                } else {
                    warn!("[query] intent JSON unparsable — using deterministic filters only");
                }
            }
            Err(e) => {
                warn!("[query] understander call failed ({}) — using deterministic filters", e);
            }
        }

        intent
    }
}

struct ModelIntent {
    date_from: Option<NaiveDate>,
    date_to: Option<NaiveDate>,
    kind: Option<TxnKind>,
    amount_min: Option<f64>,
    amount_max: Option<f64>,
    category: Option<String>,
    enhanced_query: Option<String>,
    agent_hint: Option<String>,
}

fn parse_intent_json(raw: &str) -> Option<ModelIntent> {
    let repaired = repair_json(raw);
    let body = extract_json(&repaired)?;
    let v: serde_json::Value = serde_json::from_str(body).ok()?;

    let date = |key: &str| {
        v["date_range"][key]
            .as_str()
            .and_then(|s| NaiveDate::parse_from_str(s, "%Y-%m-%d").ok())
    };
    Some(ModelIntent {
        date_from: date("from"),
        date_to: date("to"),
        kind: match v["type"].as_str() {
            Some("debit") => Some(TxnKind::Debit),
            Some("credit") => Some(TxnKind::Credit),
            _ => None,
        },
        amount_min: v["amount_range"]["min"].as_f64(),
        amount_max: v["amount_range"]["max"].as_f64(),
        category: v["category"].as_str().map(str::to_string).filter(|s| !s.is_empty()),
        enhanced_query: v["enhanced_query"].as_str().map(str::to_string).filter(|s| !s.is_empty()),
        agent_hint: v["agent_hint"].as_str().map(str::to_string).filter(|s| !s.is_empty()),
    })
}

/// Model output fills what the deterministic layer left open; it never
/// overrides a deterministic hit.
fn merge_model_intent(intent: &mut QueryIntent, model: ModelIntent) {
    let f = &mut intent.filters;
    f.date_from = f.date_from.or(model.date_from);
    f.date_to = f.date_to.or(model.date_to);
    f.kind = f.kind.or(model.kind);
    f.amount_min = f.amount_min.or(model.amount_min);
    f.amount_max = f.amount_max.or(model.amount_max);
    if f.category.is_none() {
        f.category = model.category;
    }
    if let Some(q) = model.enhanced_query {
        intent.enhanced_query = q;
    }
    intent.agent_hint = model.agent_hint;
}

// ── Deterministic fuzzy parsing ────────────────────────────────────────────

const MONTHS: [&str; 12] = [
    "january", "february", "march", "april", "may", "june",
    "july", "august", "september", "october", "november", "december",
];

fn month_range(year: i32, month: u32) -> (NaiveDate, NaiveDate) {
    let from = NaiveDate::from_ymd_opt(year, month, 1).expect("valid month start");
    let to = if month == 12 {
        NaiveDate::from_ymd_opt(year + 1, 1, 1)
    } else {
        NaiveDate::from_ymd_opt(year, month + 1, 1)
    }
    .expect("valid next month")
    .pred_opt()
    .expect("valid month end");
    (from, to)
}

/// Parse fuzzy time expressions, amount qualifiers and type cues from the
/// raw query. Pure and total.
pub(crate) fn parse_fuzzy_filters(query: &str, today: NaiveDate) -> IntentFilters {
    let lower = query.to_lowercase();
    let mut f = IntentFilters::default();

    // ── Time expressions ──
    if lower.contains("last month") {
        let (y, m) = if today.month() == 1 {
            (today.year() - 1, 12)
        } else {
            (today.year(), today.month() - 1)
        };
        let (from, to) = month_range(y, m);
        f.date_from = Some(from);
        f.date_to = Some(to);
    } else if lower.contains("this month") {
        let (from, to) = month_range(today.year(), today.month());
        f.date_from = Some(from);
        f.date_to = Some(to);
    } else if lower.contains("this year") {
        f.date_from = NaiveDate::from_ymd_opt(today.year(), 1, 1);
        f.date_to = NaiveDate::from_ymd_opt(today.year(), 12, 31);
    } else if let Some(q) = quarter_of(&lower) {
        let start_month = (q - 1) * 3 + 1;
        let (from, _) = month_range(today.year(), start_month);
        let (_, to) = month_range(today.year(), start_month + 2);
        f.date_from = Some(from);
        f.date_to = Some(to);
    } else if let Some(m) = MONTHS.iter().position(|m| lower.contains(m)) {
        let (from, to) = month_range(today.year(), m as u32 + 1);
        f.date_from = Some(from);
        f.date_to = Some(to);
    }

    // ── Amount qualifiers ──
    static BETWEEN: OnceLock<Regex> = OnceLock::new();
    static OVER: OnceLock<Regex> = OnceLock::new();
    static UNDER: OnceLock<Regex> = OnceLock::new();
    let between = BETWEEN.get_or_init(|| {
        Regex::new(r"between\s+(\d+(?:\.\d+)?)\s+and\s+(\d+(?:\.\d+)?)").expect("static regex")
    });
    let over = OVER.get_or_init(|| {
        Regex::new(r"(?:over|above|more than|at least|>=?)\s*(\d+(?:\.\d+)?)").expect("static regex")
    });
    let under = UNDER.get_or_init(|| {
        Regex::new(r"(?:under|below|less than|at most|<=?)\s*(\d+(?:\.\d+)?)").expect("static regex")
    });

    if let Some(caps) = between.captures(&lower) {
        f.amount_min = caps[1].parse().ok();
        f.amount_max = caps[2].parse().ok();
    } else {
        if let Some(caps) = over.captures(&lower) {
            f.amount_min = caps[1].parse().ok();
        }
        if let Some(caps) = under.captures(&lower) {
            f.amount_max = caps[1].parse().ok();
        }
    }
    if lower.contains("large") || lower.contains("big") || lower.contains("biggest")
        || lower.contains("largest")
    {
        f.wants_large = true;
    }

    // ── Type cues ──
    let credit_cues = ["income", "salary", "deposit", "earned", "credited", "received"];
    let debit_cues = ["spend", "spent", "expense", "paid", "payment", "withdrawal", "purchase", "bought"];
    if credit_cues.iter().any(|c| lower.contains(c)) {
        f.kind = Some(TxnKind::Credit);
    } else if debit_cues.iter().any(|c| lower.contains(c)) {
        f.kind = Some(TxnKind::Debit);
    }

    f
}

fn quarter_of(lower: &str) -> Option<u32> {
    for (token, q) in [("q1", 1u32), ("q2", 2), ("q3", 3), ("q4", 4)] {
        // Avoid matching inside words ("q2" in "sq2x" is noise we accept;
        // quarters in queries are written standalone).
        if lower.split_whitespace().any(|w| w.trim_matches(|c: char| !c.is_alphanumeric()) == token) {
            return Some(q);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 3, 15).unwrap()
    }

    #[test]
    fn test_last_month_range() {
        let f = parse_fuzzy_filters("how much did I spend last month", today());
        assert_eq!(f.date_from, NaiveDate::from_ymd_opt(2025, 2, 1));
        assert_eq!(f.date_to, NaiveDate::from_ymd_opt(2025, 2, 28));
        assert_eq!(f.kind, Some(TxnKind::Debit));
    }

    #[test]
    fn test_last_month_across_year_boundary() {
        let jan = NaiveDate::from_ymd_opt(2025, 1, 10).unwrap();
        let f = parse_fuzzy_filters("expenses last month", jan);
        assert_eq!(f.date_from, NaiveDate::from_ymd_opt(2024, 12, 1));
        assert_eq!(f.date_to, NaiveDate::from_ymd_opt(2024, 12, 31));
    }

    #[test]
    fn test_quarter_range() {
        let f = parse_fuzzy_filters("show me Q2 income", today());
        assert_eq!(f.date_from, NaiveDate::from_ymd_opt(2025, 4, 1));
        assert_eq!(f.date_to, NaiveDate::from_ymd_opt(2025, 6, 30));
        assert_eq!(f.kind, Some(TxnKind::Credit));
    }

    #[test]
    fn test_month_name() {
        let f = parse_fuzzy_filters("what happened in january", today());
        assert_eq!(f.date_from, NaiveDate::from_ymd_opt(2025, 1, 1));
        assert_eq!(f.date_to, NaiveDate::from_ymd_opt(2025, 1, 31));
    }

    #[test]
    fn test_amount_ranges() {
        let f = parse_fuzzy_filters("payments over 500", today());
        assert_eq!(f.amount_min, Some(500.0));

        let f = parse_fuzzy_filters("transactions between 100 and 250.50", today());
        assert_eq!(f.amount_min, Some(100.0));
        assert_eq!(f.amount_max, Some(250.5));

        let f = parse_fuzzy_filters("anything under 50", today());
        assert_eq!(f.amount_max, Some(50.0));
    }

    #[test]
    fn test_large_qualifier() {
        let f = parse_fuzzy_filters("what was my largest expense", today());
        assert!(f.wants_large);
        assert_eq!(f.kind, Some(TxnKind::Debit));
    }

    #[test]
    fn test_no_signals_is_empty() {
        let f = parse_fuzzy_filters("tell me about my account", today());
        assert!(f.is_empty());
    }

    #[test]
    fn test_to_filter_resolves_large_threshold() {
        let f = IntentFilters { wants_large: true, ..Default::default() };
        let (sql, _) = f.to_filter(Some(400.0)).to_sql();
        assert!(sql.contains("amount >="));

        // Without a threshold the qualifier stays advisory.
        let (sql, _) = f.to_filter(None).to_sql();
        assert_eq!(sql, "1=1");
    }

    #[test]
    fn test_model_intent_merge_prefers_deterministic() {
        let mut intent = QueryIntent {
            filters: IntentFilters { amount_min: Some(100.0), ..Default::default() },
            enhanced_query: "orig".into(),
            agent_hint: None,
        };
        merge_model_intent(
            &mut intent,
            ModelIntent {
                date_from: None,
                date_to: None,
                kind: Some(TxnKind::Debit),
                amount_min: Some(999.0),
                amount_max: None,
                category: Some("groceries".into()),
                enhanced_query: Some("grocery store spending".into()),
                agent_hint: Some("expense".into()),
            },
        );
        assert_eq!(intent.filters.amount_min, Some(100.0)); // deterministic wins
        assert_eq!(intent.filters.kind, Some(TxnKind::Debit)); // gap filled
        assert_eq!(intent.enhanced_query, "grocery store spending");
        assert_eq!(intent.agent_hint.as_deref(), Some("expense"));
    }

    #[test]
    fn test_parse_intent_json_tolerates_fences() {
        let raw = "```json\n{\"type\": \"debit\", \"enhanced_query\": \"x\", \
                   \"date_range\": {\"from\": \"2025-01-01\", \"to\": null}}\n```";
        let m = parse_intent_json(raw).unwrap();
        assert_eq!(m.kind, Some(TxnKind::Debit));
        assert_eq!(m.date_from, NaiveDate::from_ymd_opt(2025, 1, 1));
        assert!(parse_intent_json("not json at all").is_none());
    }
}

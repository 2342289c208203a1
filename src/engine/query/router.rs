// Tahlil Engine — Agent Router
//
// Maps each chat query to exactly one agent name. Stage 1 is a
// deterministic keyword table: cheap, predictable, and where the vast
// majority of queries resolve. Stage 2 asks the small router model to
// disambiguate, think=false, and distrusts anything that is not a known
// agent name. The fallback is the document type's generalist.

use crate::atoms::types::DocumentType;
use crate::engine::llm::{ChatRequest, ChatTurn, LlmGateway};
use log::{debug, warn};
use regex::Regex;
use std::sync::{Arc, OnceLock};

// ── Agent rosters ──────────────────────────────────────────────────────────

pub const TXN_AGENTS: [&str; 6] = [
    "expense",
    "income",
    "fee_hunter",
    "budget_advisor",
    "trend_analyst",
    "transaction_investigator",
];

pub const FIN_AGENTS: [&str; 6] = [
    "ratio_analyst",
    "profitability",
    "liquidity",
    "fin_trend",
    "risk",
    "efficiency",
];

pub fn agents_for(doc_type: DocumentType) -> &'static [&'static str] {
    match doc_type {
        DocumentType::Transactions => &TXN_AGENTS,
        DocumentType::FinancialStatement => &FIN_AGENTS,
    }
}

/// The generalist that answers when nothing more specific matches.
pub fn fallback_agent(doc_type: DocumentType) -> &'static str {
    match doc_type {
        DocumentType::Transactions => "budget_advisor",
        DocumentType::FinancialStatement => "ratio_analyst",
    }
}

// ── Stage 1: keyword table ─────────────────────────────────────────────────

/// Ordered: the first matching row wins, so the specific outranks the
/// generic (fee before expense, liquidity before ratio).
fn keyword_table() -> &'static Vec<(Regex, &'static str, DocumentType)> {
    static TABLE: OnceLock<Vec<(Regex, &'static str, DocumentType)>> = OnceLock::new();
    TABLE.get_or_init(|| {
        let t = DocumentType::Transactions;
        let f = DocumentType::FinancialStatement;
        let rows: [(&str, &str, DocumentType); 12] = [
            (r"fee|charge|penalt|commission|رسوم", "fee_hunter", t),
            (r"duplicate|anomal|suspicious|investigate|find .*transaction|search", "transaction_investigator", t),
            (r"income|salary|deposit|earn|راتب", "income", t),
            (r"trend|pattern|weekday|seasonal|over time", "trend_analyst", t),
            (r"budget|save|saving|runway|health|afford", "budget_advisor", t),
            (r"spend|spent|expense|purchase|bought|cost|grocer|largest", "expense", t),
            (r"liquidity|working capital|quick ratio|current ratio|cash conversion", "liquidity", f),
            (r"profit|margin|ebitda", "profitability", f),
            (r"growth|year.over.year|yoy|seasonal", "fin_trend", f),
            (r"risk|covenant|exposure|solvency", "risk", f),
            (r"efficienc|turnover|dso|inventory", "efficiency", f),
            (r"ratio|leverage|debt.to.equity", "ratio_analyst", f),
        ];
        rows.iter()
            .map(|(pattern, agent, dt)| {
                (Regex::new(pattern).expect("static regex"), *agent, *dt)
            })
            .collect()
    })
}

pub(crate) fn keyword_route(query: &str, doc_type: DocumentType) -> Option<&'static str> {
    let lower = query.to_lowercase();
    keyword_table()
        .iter()
        .find(|(re, _, dt)| *dt == doc_type && re.is_match(&lower))
        .map(|(_, agent, _)| *agent)
}

/// The user explicitly asked for the whole panel; the orchestrator may
/// override routing entirely.
pub fn wants_full_panel(query: &str) -> bool {
    let lower = query.to_lowercase();
    ["full analysis", "complete analysis", "all agents", "run insights", "analyze everything", "analyse everything"]
        .iter()
        .any(|p| lower.contains(p))
}

// ── Stage 2: small-model disambiguation ────────────────────────────────────

pub struct Router {
    gateway: Arc<LlmGateway>,
    model: String,
}

impl Router {
    pub fn new(gateway: Arc<LlmGateway>, model: impl Into<String>) -> Self {
        Router { gateway, model: model.into() }
    }

    /// Resolve a query to an agent name from the document type's roster.
    /// Never fails; the generalist absorbs every error path.
    pub async fn route(&self, query: &str, doc_type: DocumentType, hint: Option<&str>) -> String {
        let roster = agents_for(doc_type);

        // An understander hint that names a real agent is as good as a
        // keyword hit.
        if let Some(hint) = hint {
            if roster.contains(&hint) {
                return hint.to_string();
            }
        }

        if let Some(agent) = keyword_route(query, doc_type) {
            debug!("[query] keyword-routed to {}", agent);
            return agent.to_string();
        }

        // Ambiguous: one small-model classification, think=false. The
        // router model does not support extended thinking and must never
        // be asked for it.
        let system = format!(
            "You route a user's question to exactly one analyst. \
             Answer with ONLY one name from this list, nothing else: {}",
            roster.join(", ")
        );
        let req = ChatRequest::new(
            self.model.clone(),
            vec![ChatTurn::system(system), ChatTurn::user(query)],
        );

        match self.gateway.chat(req).await {
            Ok(raw) => {
                let name = raw.trim().trim_matches(|c: char| !c.is_ascii_alphanumeric() && c != '_');
                let name = name.to_lowercase();
                if let Some(agent) = roster.iter().find(|a| **a == name) {
                    return agent.to_string();
                }
                // Tolerate prose around the name.
                if let Some(agent) = roster.iter().find(|a| raw.to_lowercase().contains(**a)) {
                    return agent.to_string();
                }
                warn!("[query] router model returned unknown agent — using fallback");
                fallback_agent(doc_type).to_string()
            }
            Err(e) => {
                warn!("[query] router model call failed ({}) — using fallback", e);
                fallback_agent(doc_type).to_string()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fee_outranks_expense() {
        let agent = keyword_route("why did I pay this card fee", DocumentType::Transactions);
        assert_eq!(agent, Some("fee_hunter"));
    }

    #[test]
    fn test_expense_keywords() {
        assert_eq!(
            keyword_route("what did I spend on groceries?", DocumentType::Transactions),
            Some("expense")
        );
        assert_eq!(
            keyword_route("largest expense", DocumentType::Transactions),
            Some("expense")
        );
    }

    #[test]
    fn test_income_keywords() {
        assert_eq!(
            keyword_route("how stable is my salary", DocumentType::Transactions),
            Some("income")
        );
    }

    #[test]
    fn test_liquidity_outranks_ratio() {
        assert_eq!(
            keyword_route("what is our quick ratio", DocumentType::FinancialStatement),
            Some("liquidity")
        );
        assert_eq!(
            keyword_route("debt to equity ratio please", DocumentType::FinancialStatement),
            Some("ratio_analyst")
        );
    }

    #[test]
    fn test_doc_type_partitions_table() {
        // Transaction keywords do not leak into financial workspaces.
        assert_eq!(keyword_route("what did I spend", DocumentType::FinancialStatement), None);
    }

    #[test]
    fn test_ambiguous_query_has_no_keyword_route() {
        assert_eq!(keyword_route("tell me something interesting", DocumentType::Transactions), None);
    }

    #[test]
    fn test_full_panel_detection() {
        assert!(wants_full_panel("please run a full analysis"));
        assert!(!wants_full_panel("what did I spend on fuel"));
    }

    #[test]
    fn test_fallbacks() {
        assert_eq!(fallback_agent(DocumentType::Transactions), "budget_advisor");
        assert_eq!(fallback_agent(DocumentType::FinancialStatement), "ratio_analyst");
    }

    #[test]
    fn test_rosters_are_disjoint_and_complete() {
        assert_eq!(TXN_AGENTS.len(), 6);
        assert_eq!(FIN_AGENTS.len(), 6);
        for a in TXN_AGENTS {
            assert!(!FIN_AGENTS.contains(&a));
        }
    }
}

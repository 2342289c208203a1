// Tahlil Engine — Agent Base
//
// The common contract behind all twelve analysts: a domain filter for
// evidence, prompt hooks, and deterministic findings extraction. The two
// protocol drivers live here as free functions: insights mode (think
// call, then answer call) and chat mode (single call over cached
// insights). No agent can deviate from the protocol or leak a reasoning
// trace.
//
// Dependency rule (one-way): agents know the retriever, the gateway, and
// the atoms. They never see the store, the cache, or the HTTP layer; the
// orchestrator owns those.

pub mod financial;
pub mod findings;
pub mod prompts;
pub mod transaction;

use crate::atoms::constants::*;
use crate::atoms::error::{EngineError, EngineResult};
use crate::atoms::types::*;
use crate::engine::index::filter::Filter;
use crate::engine::index::retriever::WorkspaceRetriever;
use crate::engine::llm::{GenerateRequest, LlmGateway};
use findings::AgentFindings;
use log::{info, warn};
use std::sync::Arc;

// ── Agent classes ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentClass {
    Transaction,
    Financial,
}

impl AgentClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentClass::Transaction => "transaction",
            AgentClass::Financial => "financial",
        }
    }

    pub fn for_document(doc_type: DocumentType) -> Self {
        match doc_type {
            DocumentType::Transactions => AgentClass::Transaction,
            DocumentType::FinancialStatement => AgentClass::Financial,
        }
    }
}

// ── Context ────────────────────────────────────────────────────────────────

/// Everything an agent may touch during a run. Built per request by the
/// orchestrator; the retriever inside is already bound to the workspace,
/// so there is no ambient "current workspace" anywhere.
pub struct WorkspaceContext {
    pub upload: Upload,
    pub retriever: WorkspaceRetriever,
    pub gateway: Arc<LlmGateway>,
    pub primary_model: String,
    /// Present for financial workspaces; findings extractors read it.
    pub statement: Option<FinancialStatement>,
}

/// Inputs to deterministic findings extraction.
pub struct FindingsInput<'a> {
    pub evidence: &'a [VectorDoc],
    pub statement: Option<&'a FinancialStatement>,
}

// ── The agent trait ────────────────────────────────────────────────────────

pub trait Agent: Send + Sync {
    fn name(&self) -> &'static str;
    fn class(&self) -> AgentClass;
    /// Persona line opening every prompt.
    fn persona(&self) -> &'static str;
    /// Mission brief: what the insights report must cover.
    fn mission(&self) -> &'static str;
    /// Domain filter for evidence retrieval. Workspace scope is injected
    /// by the retriever, never here.
    fn evidence_filter(&self) -> Filter;
    fn evidence_limit(&self) -> usize {
        EVIDENCE_DEFAULT_K
    }
    /// Deterministic key facts from evidence and parsed data.
    fn findings(&self, input: &FindingsInput<'_>) -> AgentFindings;
}

// ── Reasoning-trace hygiene ────────────────────────────────────────────────

/// Remove every `<think>…</think>` block, and anything after an unclosed
/// `<think>`. No reasoning trace may survive past this function; it is
/// called on every model answer before persistence or display.
pub fn strip_think(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    loop {
        match rest.find("<think>") {
            None => {
                out.push_str(rest);
                break;
            }
            Some(start) => {
                out.push_str(&rest[..start]);
                match rest[start..].find("</think>") {
                    Some(end_rel) => {
                        rest = &rest[start + end_rel + "</think>".len()..];
                    }
                    None => break, // unclosed: drop the tail
                }
            }
        }
    }
    out.trim().to_string()
}

/// Render evidence docs as the numbered context block prompts embed.
pub fn render_evidence(evidence: &[VectorDoc]) -> String {
    evidence
        .iter()
        .enumerate()
        .map(|(i, doc)| format!("{}. {}", i + 1, doc.text))
        .collect::<Vec<_>>()
        .join("\n")
}

// ── Insights protocol (two calls) ──────────────────────────────────────────

/// Run one agent's insights pass. Never returns Err: every failure mode
/// becomes a `failed` placeholder so the panel as a whole still succeeds.
pub async fn run_insights(agent: &dyn Agent, ctx: &WorkspaceContext) -> AnalysisResult {
    // Evidence first; an agent with nothing to look at does not call the
    // model at all.
    let evidence = match ctx.retriever.structured(agent.evidence_filter(), agent.evidence_limit())
    {
        Ok(evidence) => evidence,
        Err(e) => {
            warn!("[agents] {} retrieval failed: {}", agent.name(), e);
            return AnalysisResult::failed(format!("evidence retrieval failed: {}", e));
        }
    };
    if evidence.is_empty() {
        return AnalysisResult::failed(
            "insufficient evidence: no matching records in this workspace",
        );
    }

    let rendered = render_evidence(&evidence);

    // ── Call 1: private reasoning ──
    let think_req = GenerateRequest::insights(
        ctx.primary_model.clone(),
        prompts::think_prompt(agent.persona(), agent.mission(), &rendered),
    );
    let trace = match ctx.gateway.generate(think_req).await {
        Ok(raw) => raw,
        Err(e) => {
            warn!("[agents] {} think call failed: {}", agent.name(), e);
            return AnalysisResult::failed(format!("analysis failed: {}", e));
        }
    };
    // The trace lives only in this stack frame; strip any tag wrapper and
    // hand the content to the answer call.
    let trace = strip_think_wrapper(&trace);

    // ── Call 2: user-facing answer ──
    let mut answer_req = GenerateRequest::insights(
        ctx.primary_model.clone(),
        prompts::answer_prompt(agent.persona(), agent.mission(), &trace, &rendered),
    );
    answer_req.temperature = ANSWER_TEMPERATURE;

    let answer = match ctx.gateway.generate(answer_req).await {
        Ok(raw) => raw,
        Err(EngineError::LlmBadResponse(reason)) => {
            // One retry with a minimised prompt before giving up.
            warn!("[agents] {} answer unusable ({}) — retrying simplified", agent.name(), reason);
            let retry = GenerateRequest::insights(
                ctx.primary_model.clone(),
                format!(
                    "{}\nSummarise the key findings in this data as markdown:\n{}",
                    agent.persona(),
                    rendered
                ),
            );
            match ctx.gateway.generate(retry).await {
                Ok(raw) => raw,
                Err(e) => {
                    warn!("[agents] {} retry failed: {}", agent.name(), e);
                    return AnalysisResult::failed(format!("analysis failed: {}", e));
                }
            }
        }
        Err(e) => {
            warn!("[agents] {} answer call failed: {}", agent.name(), e);
            return AnalysisResult::failed(format!("analysis failed: {}", e));
        }
    };

    let input = FindingsInput { evidence: &evidence, statement: ctx.statement.as_ref() };
    let findings = agent.findings(&input).into_map();

    info!("[agents] {} insights complete ({} evidence docs)", agent.name(), evidence.len());
    AnalysisResult {
        status: AnalysisStatus::Completed,
        summary: strip_think(&answer),
        findings,
    }
}

/// The think call's own output may arrive wrapped in tags; unwrap without
/// discarding the reasoning content itself.
fn strip_think_wrapper(trace: &str) -> String {
    let trimmed = trace.trim();
    if let Some(inner) = trimmed.strip_prefix("<think>") {
        let inner = inner.strip_suffix("</think>").unwrap_or(inner);
        return inner.trim().to_string();
    }
    trimmed.to_string()
}

// ── Chat protocol (single call) ────────────────────────────────────────────

/// A chat answer plus the evidence ids it drew on, for UI source display.
pub struct ChatOutput {
    pub answer: String,
    pub sources: Vec<String>,
}

/// Chat-mode evidence: domain filter AND the understander's intent
/// filter; if the combination is too narrow to match anything, fall back
/// to the domain alone rather than answering from nothing.
async fn chat_evidence(
    agent: &dyn Agent,
    ctx: &WorkspaceContext,
    retrieval_query: &str,
    intent_filter: Filter,
) -> EngineResult<Vec<VectorDoc>> {
    let k = EVIDENCE_DEFAULT_K.min(20);
    let combined = agent.evidence_filter().and(intent_filter);
    let mut evidence = ctx.retriever.semantic(retrieval_query, k, combined).await?;
    if evidence.is_empty() {
        evidence = ctx.retriever.semantic(retrieval_query, k, agent.evidence_filter()).await?;
    }
    Ok(evidence.into_iter().map(|(doc, _)| doc).collect())
}

fn chat_request(agent: &dyn Agent, ctx: &WorkspaceContext, cached: &AnalysisResult, docs: &[VectorDoc], query: &str) -> GenerateRequest {
    let mut req = GenerateRequest::new(
        ctx.primary_model.clone(),
        prompts::chat_prompt(agent.persona(), &cached.summary, &render_evidence(docs), query),
    );
    req.max_tokens = CHAT_MAX_TOKENS;
    req.temperature = CHAT_TEMPERATURE;
    req.think = false;
    req.timeout_secs = CHAT_TIMEOUT_SECS;
    req
}

/// Answer a chat query with cached insights as context. The caller has
/// already established that `cached` exists: chat without cache is the
/// orchestrator's NEEDS_INSIGHTS path and never reaches here.
pub async fn run_chat(
    agent: &dyn Agent,
    ctx: &WorkspaceContext,
    query: &str,
    retrieval_query: &str,
    intent_filter: Filter,
    cached: &AnalysisResult,
) -> EngineResult<ChatOutput> {
    let docs = chat_evidence(agent, ctx, retrieval_query, intent_filter).await?;
    let req = chat_request(agent, ctx, cached, &docs, query);
    let raw = ctx.gateway.generate(req).await?;
    Ok(ChatOutput {
        answer: strip_think(&raw),
        sources: docs.into_iter().map(|d| d.id).collect(),
    })
}

/// Streaming variant for the WebSocket path: deltas are forwarded as they
/// arrive; the caller joins them into the persisted transcript.
pub async fn run_chat_stream(
    agent: &dyn Agent,
    ctx: &WorkspaceContext,
    query: &str,
    retrieval_query: &str,
    intent_filter: Filter,
    cached: &AnalysisResult,
) -> EngineResult<(tokio::sync::mpsc::Receiver<EngineResult<String>>, Vec<String>)> {
    let docs = chat_evidence(agent, ctx, retrieval_query, intent_filter).await?;
    let req = chat_request(agent, ctx, cached, &docs, query);
    let rx = ctx.gateway.generate_stream(req).await?;
    Ok((rx, docs.into_iter().map(|d| d.id).collect()))
}

// ── Registry ───────────────────────────────────────────────────────────────

/// Every agent in the panel, in run order.
pub fn all_agents() -> Vec<Box<dyn Agent>> {
    vec![
        Box::new(transaction::ExpenseAgent),
        Box::new(transaction::IncomeAgent),
        Box::new(transaction::FeeHunterAgent),
        Box::new(transaction::BudgetAdvisorAgent),
        Box::new(transaction::TrendAnalystAgent),
        Box::new(transaction::TransactionInvestigatorAgent),
        Box::new(financial::RatioAnalystAgent),
        Box::new(financial::ProfitabilityAgent),
        Box::new(financial::LiquidityAgent),
        Box::new(financial::FinTrendAgent),
        Box::new(financial::RiskAgent),
        Box::new(financial::EfficiencyAgent),
    ]
}

pub fn agents_of_class(class: AgentClass) -> Vec<Box<dyn Agent>> {
    all_agents().into_iter().filter(|a| a.class() == class).collect()
}

pub fn agent_by_name(name: &str) -> Option<Box<dyn Agent>> {
    all_agents().into_iter().find(|a| a.name() == name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_think_removes_blocks() {
        let s = "<think>secret reasoning</think>The answer is 42.";
        assert_eq!(strip_think(s), "The answer is 42.");
    }

    #[test]
    fn test_strip_think_multiple_blocks() {
        let s = "a<think>x</think>b<think>y</think>c";
        assert_eq!(strip_think(s), "abc");
    }

    #[test]
    fn test_strip_think_unclosed_drops_tail() {
        let s = "visible<think>never closed, must not leak";
        assert_eq!(strip_think(s), "visible");
    }

    #[test]
    fn test_strip_think_no_tags_is_identity() {
        assert_eq!(strip_think("  plain answer  "), "plain answer");
    }

    #[test]
    fn test_strip_think_wrapper_keeps_content() {
        assert_eq!(strip_think_wrapper("<think>the reasoning</think>"), "the reasoning");
        assert_eq!(strip_think_wrapper("bare trace"), "bare trace");
    }

    #[test]
    fn test_registry_has_twelve_agents_six_per_class() {
        let all = all_agents();
        assert_eq!(all.len(), 12);
        assert_eq!(agents_of_class(AgentClass::Transaction).len(), 6);
        assert_eq!(agents_of_class(AgentClass::Financial).len(), 6);
    }

    #[test]
    fn test_registry_names_match_router_rosters() {
        use crate::engine::query::router::{FIN_AGENTS, TXN_AGENTS};
        for name in TXN_AGENTS.iter().chain(FIN_AGENTS.iter()) {
            let agent = agent_by_name(name).unwrap_or_else(|| panic!("missing agent {}", name));
            assert_eq!(agent.name(), *name);
        }
    }

    #[test]
    fn test_render_evidence_numbers_lines() {
        let docs = vec![
            VectorDoc {
                id: "a".into(),
                text: "first".into(),
                embedding: vec![],
                meta: DocMeta::default(),
            },
            VectorDoc {
                id: "b".into(),
                text: "second".into(),
                embedding: vec![],
                meta: DocMeta::default(),
            },
        ];
        assert_eq!(render_evidence(&docs), "1. first\n2. second");
    }
}

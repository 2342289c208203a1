// Tahlil Engine — Orchestrator
//
// Top-level entry points for the two modes:
//   run_full_insights — the expensive panel run: every agent of the
//     workspace's class, sequential, each result durable before the next
//     agent starts (a cancelled run keeps everything completed so far);
//   answer_chat — the cheap path: understand → route → cached context
//     (memory, then database) → one model call → persisted chat turn.
//
// The orchestrator is also where workspace isolation is enforced: it
// builds the WorkspaceRetriever bound to (user_id, upload_id) and hands
// agents nothing else. There is no ambient current-workspace state.

use crate::atoms::constants::{EVIDENCE_MAX_K, NEEDS_INSIGHTS};
use crate::atoms::error::{EngineError, EngineResult};
use crate::atoms::types::*;
use crate::engine::agents::{
    self, agent_by_name, agents_of_class, Agent, AgentClass, WorkspaceContext,
};
use crate::engine::config::EngineConfig;
use crate::engine::index::filter::{Field, Filter};
use crate::engine::index::retriever::{Retriever, WorkspaceRetriever};
use crate::engine::index::VectorIndex;
use crate::engine::ingest;
use crate::engine::llm::LlmGateway;
use crate::engine::query::router::{fallback_agent, wants_full_panel, Router};
use crate::engine::query::understand::QueryUnderstander;
use crate::engine::store::cache::{cache_key, InsightsCache};
use crate::engine::store::WorkspaceStore;
use chrono::Utc;
use log::{info, warn};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;

pub struct Orchestrator {
    store: Arc<WorkspaceStore>,
    index: Arc<VectorIndex>,
    retriever: Arc<Retriever>,
    gateway: Arc<LlmGateway>,
    cache: Arc<InsightsCache>,
    understander: QueryUnderstander,
    router: Router,
    primary_model: String,
    uploads_dir: PathBuf,
}

/// One answered chat turn.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ChatAnswer {
    pub answer: String,
    pub agent_used: String,
    pub sources: Vec<String>,
}

/// Everything a chat turn needs, resolved up front so the blocking and
/// the streaming paths share one preparation step.
pub struct PreparedChat {
    pub agent: Box<dyn Agent>,
    pub ctx: WorkspaceContext,
    pub cached: AnalysisResult,
    pub retrieval_query: String,
    pub intent_filter: Filter,
}

pub enum ChatPlan {
    /// No cached insights for the routed agent: answer with the sentinel
    /// hint and make zero primary-model calls.
    NeedsInsights { agent_name: String },
    Ready(Box<PreparedChat>),
}

impl Orchestrator {
    pub fn new(
        config: &EngineConfig,
        store: Arc<WorkspaceStore>,
        index: Arc<VectorIndex>,
        retriever: Arc<Retriever>,
        gateway: Arc<LlmGateway>,
        cache: Arc<InsightsCache>,
    ) -> Self {
        Orchestrator {
            understander: QueryUnderstander::new(gateway.clone(), config.router_model.clone()),
            router: Router::new(gateway.clone(), config.router_model.clone()),
            primary_model: config.primary_model.clone(),
            uploads_dir: config.uploads_dir(),
            store,
            index,
            retriever,
            gateway,
            cache,
        }
    }

    // ── Workspace resolution ───────────────────────────────────────────────

    fn resolve(&self, user_id: &str, upload_id: &str) -> EngineResult<Upload> {
        self.store
            .get_upload(user_id, upload_id)?
            .ok_or_else(|| EngineError::WorkspaceNotFound(upload_id.to_string()))
    }

    fn resolve_completed(&self, user_id: &str, upload_id: &str) -> EngineResult<Upload> {
        let upload = self.resolve(user_id, upload_id)?;
        match upload.status {
            UploadStatus::Completed => Ok(upload),
            UploadStatus::Failed => Err(EngineError::IngestionParseFailed(
                "this workspace failed to ingest — re-upload the document".into(),
            )),
            _ => Err(EngineError::WorkspaceBusy(upload_id.to_string())),
        }
    }

    /// Build the per-request context. The retriever wrapper is the
    /// isolation boundary: every query an agent makes from here on is
    /// filtered to this workspace.
    fn context_for(&self, upload: Upload) -> EngineResult<WorkspaceContext> {
        let retriever = WorkspaceRetriever::new(
            self.retriever.clone(),
            upload.upload_id.clone(),
            upload.user_id.clone(),
        );
        let statement = match upload.document_type {
            Some(DocumentType::FinancialStatement) => self.store.get_statement(&upload.upload_id)?,
            _ => None,
        };
        Ok(WorkspaceContext {
            upload,
            retriever,
            gateway: self.gateway.clone(),
            primary_model: self.primary_model.clone(),
            statement,
        })
    }

    fn document_type(upload: &Upload) -> EngineResult<DocumentType> {
        upload
            .document_type
            .ok_or_else(|| EngineError::WorkspaceBusy(upload.upload_id.clone()))
    }

    // ── Insights mode ──────────────────────────────────────────────────────

    /// Run the full panel for a workspace. Agents run sequentially: the
    /// local runtime serves one or two completions at a time, so fanning
    /// out buys nothing. Each result is persisted before the next agent
    /// starts, so a partial run is recoverable and visible to pollers.
    pub async fn run_full_insights(
        &self,
        user_id: &str,
        upload_id: &str,
    ) -> EngineResult<BTreeMap<String, AnalysisResult>> {
        let upload = self.resolve_completed(user_id, upload_id)?;
        let doc_type = Self::document_type(&upload)?;
        let class = AgentClass::for_document(doc_type);
        let ctx = self.context_for(upload)?;

        info!("[orchestrator] full insights run for {} ({})", upload_id, class.as_str());

        let mut results = BTreeMap::new();
        for agent in agents_of_class(class) {
            let result = agents::run_insights(agent.as_ref(), &ctx).await;

            self.store.insert_analysis(&StoredAnalysis {
                upload_id: upload_id.to_string(),
                user_id: user_id.to_string(),
                agent_name: agent.name().to_string(),
                result: result.clone(),
                created_at: Utc::now(),
                mode: "insights".into(),
            })?;

            results.insert(agent.name().to_string(), result);
        }

        // Refresh the bundle cache for chat mode.
        let bundle: HashMap<String, AnalysisResult> =
            results.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        self.cache.put(cache_key(user_id, upload_id, class.as_str()), bundle);

        Ok(results)
    }

    /// Latest persisted results, cache-then-database.
    pub fn saved_results(
        &self,
        user_id: &str,
        upload_id: &str,
    ) -> EngineResult<HashMap<String, AnalysisResult>> {
        let upload = self.resolve(user_id, upload_id)?;
        let class = match upload.document_type {
            Some(dt) => AgentClass::for_document(dt),
            None => return Ok(HashMap::new()),
        };
        self.fetch_bundle(user_id, upload_id, class)
    }

    // ── Chat mode ──────────────────────────────────────────────────────────

    /// Resolve everything a chat turn needs, without touching the primary
    /// model. Shared front half of the blocking and streaming paths.
    pub async fn prepare_chat(
        &self,
        user_id: &str,
        upload_id: &str,
        query: &str,
    ) -> EngineResult<ChatPlan> {
        let upload = self.resolve_completed(user_id, upload_id)?;
        let doc_type = Self::document_type(&upload)?;
        let class = AgentClass::for_document(doc_type);

        // (d, hoisted) cached context: memory first, database as the
        // authority. A workspace with no insights at all short-circuits
        // before any model is consulted: chat-before-insights must not
        // cost a single model call.
        let bundle = self.fetch_bundle(user_id, upload_id, class)?;
        if bundle.is_empty() {
            let agent_name = crate::engine::query::router::keyword_route(query, doc_type)
                .unwrap_or_else(|| fallback_agent(doc_type))
                .to_string();
            return Ok(ChatPlan::NeedsInsights { agent_name });
        }

        // (b) understand, (c) route. Both on the small model, think=false.
        let intent = self.understander.understand(query, Utc::now().date_naive()).await;
        let agent_name = if wants_full_panel(query) {
            fallback_agent(doc_type).to_string()
        } else {
            self.router.route(query, doc_type, intent.agent_hint.as_deref()).await
        };

        let cached = bundle
            .get(&agent_name)
            .filter(|r| r.status == AnalysisStatus::Completed)
            .cloned();

        let Some(cached) = cached else {
            // (e) no context: sentinel, no primary-model call.
            return Ok(ChatPlan::NeedsInsights { agent_name });
        };

        let agent = agent_by_name(&agent_name)
            .ok_or_else(|| EngineError::Other(format!("unknown agent {}", agent_name)))?;

        let large_threshold = if intent.filters.wants_large {
            self.top_decile_amount(user_id, upload_id)
        } else {
            None
        };
        let intent_filter = intent.filters.to_filter(large_threshold);

        let ctx = self.context_for(upload)?;
        Ok(ChatPlan::Ready(Box::new(PreparedChat {
            agent,
            ctx,
            cached,
            retrieval_query: intent.enhanced_query,
            intent_filter,
        })))
    }

    /// One-shot chat: prepare, answer, persist both turns.
    pub async fn answer_chat(
        &self,
        user_id: &str,
        upload_id: &str,
        query: &str,
    ) -> EngineResult<ChatAnswer> {
        match self.prepare_chat(user_id, upload_id, query).await? {
            ChatPlan::NeedsInsights { agent_name } => {
                let hint = needs_insights_hint();
                self.record_chat_turn(user_id, upload_id, query, &hint, &agent_name)?;
                Ok(ChatAnswer { answer: hint, agent_used: agent_name, sources: Vec::new() })
            }
            ChatPlan::Ready(prepared) => {
                let output = agents::run_chat(
                    prepared.agent.as_ref(),
                    &prepared.ctx,
                    query,
                    &prepared.retrieval_query,
                    prepared.intent_filter.clone(),
                    &prepared.cached,
                )
                .await?;

                let agent_name = prepared.agent.name().to_string();
                self.record_chat_turn(user_id, upload_id, query, &output.answer, &agent_name)?;
                Ok(ChatAnswer {
                    answer: output.answer,
                    agent_used: agent_name,
                    sources: output.sources,
                })
            }
        }
    }

    /// (g) both turns of the conversation, in order.
    pub fn record_chat_turn(
        &self,
        user_id: &str,
        upload_id: &str,
        query: &str,
        answer: &str,
        agent_name: &str,
    ) -> EngineResult<()> {
        self.store
            .append_chat_message(upload_id, user_id, ChatRole::User, query, None)?;
        self.store.append_chat_message(
            upload_id,
            user_id,
            ChatRole::Assistant,
            answer,
            Some(agent_name),
        )?;
        Ok(())
    }

    /// Cache-then-database context fetch. The cache key uses the
    /// upload_id verbatim; the database is authoritative on a miss.
    fn fetch_bundle(
        &self,
        user_id: &str,
        upload_id: &str,
        class: AgentClass,
    ) -> EngineResult<HashMap<String, AnalysisResult>> {
        let key = cache_key(user_id, upload_id, class.as_str());
        if let Some(bundle) = self.cache.get(&key) {
            return Ok(bundle);
        }

        let bundle = self.store.latest_analyses(upload_id)?;
        if !bundle.is_empty() {
            self.cache.put(key, bundle.clone());
        }
        Ok(bundle)
    }

    /// Resolve "large" against this workspace's own distribution: the
    /// amount at the top decile of indexed movements.
    fn top_decile_amount(&self, user_id: &str, upload_id: &str) -> Option<f64> {
        let scope = Filter::upload(upload_id).eq(Field::UserId, user_id);
        let docs = self.retriever.structured(&scope, EVIDENCE_MAX_K).ok()?;
        let mut amounts: Vec<f64> = docs.iter().filter_map(|d| d.meta.amount).collect();
        if amounts.is_empty() {
            return None;
        }
        amounts.sort_by(|a, b| b.partial_cmp(a).unwrap_or(std::cmp::Ordering::Equal));
        let idx = (amounts.len() / 10).min(amounts.len() - 1);
        Some(amounts[idx])
    }

    // ── Deletion ───────────────────────────────────────────────────────────

    /// Cascading workspace delete: file artefacts, vector docs, cache
    /// entries, then the relational rows with the uploads row last.
    /// Idempotent and tolerant of partial prior cleanup.
    pub fn delete_workspace(&self, user_id: &str, upload_id: &str) -> EngineResult<()> {
        // 404 only when this user never had such a workspace.
        self.resolve(user_id, upload_id)?;

        if let Err(e) = ingest::remove_stored_files(&self.uploads_dir, upload_id) {
            warn!("[orchestrator] file cleanup for {} incomplete: {}", upload_id, e);
        }
        self.index.delete(&Filter::upload(upload_id))?;
        self.cache.purge_upload(upload_id);
        self.store.delete_workspace_rows(upload_id)?;

        info!("[orchestrator] workspace {} deleted", upload_id);
        Ok(())
    }
}

/// The user-visible hint for chat-before-insights. Contains the sentinel
/// token as a stable contract for clients.
pub fn needs_insights_hint() -> String {
    format!(
        "{}: no analysis exists for this workspace yet. \
         Run the full analysis first, then ask again.",
        NEEDS_INSIGHTS
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_needs_insights_hint_contains_sentinel() {
        assert!(needs_insights_hint().contains(NEEDS_INSIGHTS));
    }
}

// engine/state.rs — Shared engine state and wiring.
//
// One EngineState owns every long-lived component behind Arcs and is
// itself shared across request handlers. Built once at startup from the
// EngineConfig; tests build it with an injected backend double and a
// temp data directory.

use crate::atoms::error::EngineResult;
use crate::engine::config::EngineConfig;
use crate::engine::embedding::EmbeddingClient;
use crate::engine::index::retriever::Retriever;
use crate::engine::index::VectorIndex;
use crate::engine::ingest::vision::VisionProcessor;
use crate::engine::ingest::IngestService;
use crate::engine::llm::{LlmBackend, LlmGateway, OllamaBackend};
use crate::engine::orchestrator::Orchestrator;
use crate::engine::store::cache::InsightsCache;
use crate::engine::store::WorkspaceStore;
use log::info;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

pub struct EngineState {
    pub config: EngineConfig,
    pub store: Arc<WorkspaceStore>,
    pub index: Arc<VectorIndex>,
    pub backend: Arc<dyn LlmBackend>,
    pub gateway: Arc<LlmGateway>,
    pub cache: Arc<InsightsCache>,
    pub ingest: Arc<IngestService>,
    pub orchestrator: Orchestrator,
}

impl EngineState {
    /// Production wiring: Ollama backend at the configured URL.
    pub fn new(config: EngineConfig) -> EngineResult<Self> {
        let backend: Arc<dyn LlmBackend> = Arc::new(OllamaBackend::new(config.llm_base_url.clone()));
        Self::with_backend(config, backend)
    }

    /// Full wiring with a caller-supplied backend. This is the seam the
    /// integration tests use to script model behaviour.
    pub fn with_backend(config: EngineConfig, backend: Arc<dyn LlmBackend>) -> EngineResult<Self> {
        std::fs::create_dir_all(&config.data_dir)?;
        std::fs::create_dir_all(config.uploads_dir())?;

        let store = Arc::new(WorkspaceStore::open(&config.engine_db_path())?);
        let index = Arc::new(VectorIndex::open(&config.index_db_path())?);

        // The router and vision models do not support extended thinking;
        // the gateway clamps think=false for them unconditionally.
        let no_think: HashSet<String> =
            [config.router_model.clone(), config.vision_model.clone()].into_iter().collect();
        let gateway = Arc::new(LlmGateway::new(backend.clone(), no_think));

        let embedder = Arc::new(EmbeddingClient::new(
            backend.clone(),
            config.embedding_model.clone(),
            config.embed_cache_dir(),
        ));
        let retriever = Arc::new(Retriever::new(index.clone(), embedder.clone()));
        let cache = Arc::new(InsightsCache::new(Duration::from_secs(
            config.cache_ttl_hours * 3600,
        )));

        let vision = Arc::new(VisionProcessor::new(gateway.clone(), config.vision_model.clone()));
        let ingest = Arc::new(IngestService::new(
            store.clone(),
            index.clone(),
            embedder.clone(),
            vision,
        ));

        let orchestrator = Orchestrator::new(
            &config,
            store.clone(),
            index.clone(),
            retriever,
            gateway.clone(),
            cache.clone(),
        );

        info!("[engine] state initialised (data dir {:?})", config.data_dir);
        Ok(EngineState { config, store, index, backend, gateway, cache, ingest, orchestrator })
    }
}

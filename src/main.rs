// Tahlil — server entry point.
//
// Wiring order: logging, config from env, engine state, a background
// runtime-readiness probe (reachability, model pulls, test embedding —
// non-fatal, requests just fail with 503 until the runtime is up), then
// the axum listener.

use log::{info, warn};
use std::sync::Arc;
use tahlil::api;
use tahlil::engine::config::EngineConfig;
use tahlil::engine::llm::lifecycle::ensure_runtime_ready;
use tahlil::engine::state::EngineState;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = EngineConfig::from_env();
    let addr = format!("{}:{}", config.bind_address, config.port);

    let state = Arc::new(EngineState::new(config)?);

    // Model availability is verified (and missing models pulled) in the
    // background so startup stays fast on a warm machine.
    {
        let config = state.config.clone();
        let backend = state.backend.clone();
        tokio::spawn(async move {
            let status = ensure_runtime_ready(&config, backend).await;
            match &status.error {
                None => info!(
                    "[main] runtime ready (embedding dims {}, pulled {:?})",
                    status.embedding_dims, status.pulled_models
                ),
                Some(e) => warn!("[main] runtime not fully ready: {}", e),
            }
        });
    }

    let router = api::build_router(state);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("[main] listening on http://{}", addr);
    axum::serve(listener, router).await?;

    Ok(())
}

// Tahlil Engine — Runtime Lifecycle Management
//
// Auto-start, model discovery, and model pulling for the local Ollama
// instance. Called at startup by `ensure_runtime_ready()` to guarantee the
// models the engine needs are available before requests arrive.

use super::{model_matches, LlmBackend};
use crate::engine::config::EngineConfig;
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Status returned by ensure_runtime_ready.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeReadyStatus {
    pub runtime_running: bool,
    pub was_auto_started: bool,
    pub missing_models: Vec<String>,
    pub pulled_models: Vec<String>,
    pub embedding_dims: usize,
    pub error: Option<String>,
}

impl RuntimeReadyStatus {
    fn unavailable(error: String) -> Self {
        RuntimeReadyStatus {
            runtime_running: false,
            was_auto_started: false,
            missing_models: Vec::new(),
            pulled_models: Vec::new(),
            embedding_dims: 0,
            error: Some(error),
        }
    }
}

/// Ensure the runtime is running and every configured model is available.
/// This is the "just works" function: call it at startup and it handles
/// everything:
/// 1. Checks if the runtime is reachable at the configured URL
/// 2. If not, tries to start `ollama serve` as a background process
/// 3. Checks which of the configured models are missing
/// 4. Pulls missing models
/// 5. Does a test embedding to learn the vector dimension
pub async fn ensure_runtime_ready(
    config: &EngineConfig,
    backend: Arc<dyn LlmBackend>,
) -> RuntimeReadyStatus {
    let base_url = config.llm_base_url.trim_end_matches('/');
    let is_local = base_url.contains("localhost") || base_url.contains("127.0.0.1");

    // ── Step 1: Is the runtime reachable? ──
    let mut status = RuntimeReadyStatus {
        runtime_running: false,
        was_auto_started: false,
        missing_models: Vec::new(),
        pulled_models: Vec::new(),
        embedding_dims: 0,
        error: None,
    };

    let mut installed = match backend.list_models().await {
        Ok(models) => {
            info!("[llm] runtime already running at {}", base_url);
            status.runtime_running = true;
            models
        }
        Err(_) if is_local => {
            // ── Step 2: Try to start it ──
            info!("[llm] runtime not reachable at {} — attempting to start", base_url);
            if let Err(e) = start_runtime_process() {
                let msg = format!(
                    "runtime not running and auto-start failed: {}. Install Ollama from https://ollama.ai",
                    e
                );
                warn!("[llm] {}", msg);
                return RuntimeReadyStatus::unavailable(msg);
            }

            // Wait for it to become reachable (up to 15 seconds).
            let mut models = None;
            for i in 0..30 {
                tokio::time::sleep(std::time::Duration::from_millis(500)).await;
                if let Ok(m) = backend.list_models().await {
                    info!("[llm] runtime started after {}ms", (i + 1) * 500);
                    models = Some(m);
                    break;
                }
            }
            match models {
                Some(m) => {
                    status.runtime_running = true;
                    status.was_auto_started = true;
                    m
                }
                None => {
                    let msg =
                        "started runtime process but it did not become reachable within 15 seconds"
                            .to_string();
                    warn!("[llm] {}", msg);
                    return RuntimeReadyStatus::unavailable(msg);
                }
            }
        }
        Err(e) => {
            let msg = format!("runtime not reachable at {} (remote — cannot auto-start): {}", base_url, e);
            warn!("[llm] {}", msg);
            return RuntimeReadyStatus::unavailable(msg);
        }
    };

    // ── Step 3 + 4: Check and pull the configured models ──
    let wanted = [
        &config.primary_model,
        &config.router_model,
        &config.vision_model,
        &config.embedding_model,
    ];
    for model in wanted {
        if installed.iter().any(|m| model_matches(m, model)) {
            continue;
        }
        info!("[llm] model '{}' not found, pulling", model);
        match backend.pull_model(model).await {
            Ok(()) => {
                status.pulled_models.push(model.clone());
                installed.push(model.clone());
            }
            Err(e) => {
                error!("[llm] failed to pull '{}': {}", model, e);
                status.missing_models.push(model.clone());
            }
        }
    }
    if !status.missing_models.is_empty() {
        status.error = Some(format!("models unavailable: {}", status.missing_models.join(", ")));
    }

    // ── Step 5: Test embedding to learn the dimension ──
    match backend.embed(&config.embedding_model, "test").await {
        Ok(vec) => {
            info!("[llm] embedding test passed — {} dimensions", vec.len());
            status.embedding_dims = vec.len();
        }
        Err(e) => {
            let msg = format!("runtime ready, but test embedding failed: {}", e);
            warn!("[llm] {}", msg);
            if status.error.is_none() {
                status.error = Some(msg);
            }
        }
    }

    status
}

/// Try to start the runtime by spawning `ollama serve` as a detached
/// background process.
fn start_runtime_process() -> std::io::Result<()> {
    let path = which_runtime().ok_or_else(|| {
        std::io::Error::other("ollama binary not found in PATH")
    })?;

    info!("[llm] starting ollama serve from: {}", path);

    use std::process::{Command, Stdio};
    Command::new(&path)
        .arg("serve")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()?;
    Ok(())
}

/// Find the `ollama` binary in PATH or the usual install locations.
fn which_runtime() -> Option<String> {
    let mut candidates = vec![
        "ollama".to_string(),
        "/usr/local/bin/ollama".to_string(),
        "/usr/bin/ollama".to_string(),
    ];
    if let Ok(home) = std::env::var("HOME") {
        candidates.push(format!("{}/.local/bin/ollama", home));
        candidates.push(format!("{}/bin/ollama", home));
    }

    for candidate in &candidates {
        if let Ok(output) = std::process::Command::new(candidate).arg("--version").output() {
            if output.status.success() {
                return Some(candidate.clone());
            }
        }
    }

    if let Ok(output) = std::process::Command::new("which").arg("ollama").output() {
        if output.status.success() {
            let path = String::from_utf8_lossy(&output.stdout).trim().to_string();
            if !path.is_empty() {
                return Some(path);
            }
        }
    }

    None
}

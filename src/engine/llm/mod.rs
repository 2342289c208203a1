// Tahlil Engine — LLM Gateway
//
// Uniform call interface to the local model runtime (Ollama wire format):
// generate (with think flag, system prompt, images), chat, streaming,
// embeddings, model listing and pulling.
//
// `LlmBackend` is the seam: everything above this module holds an
// `Arc<dyn LlmBackend>` and never knows whether it is talking to the real
// runtime or a scripted test double. Adding a new runtime never requires
// touching callers; just implement the trait.

pub mod lifecycle;

use crate::atoms::constants::*;
use crate::atoms::error::{EngineError, EngineResult};
use async_trait::async_trait;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

// ── Request / response types ───────────────────────────────────────────────

/// One text-completion call.
#[derive(Debug, Clone)]
pub struct GenerateRequest {
    pub model: String,
    pub prompt: String,
    pub system: Option<String>,
    pub temperature: f32,
    pub max_tokens: u32,
    /// Request hidden reasoning. The gateway clamps this to false for
    /// models that do not support it.
    pub think: bool,
    /// Base64-encoded images for multimodal calls.
    pub images: Vec<String>,
    pub timeout_secs: u64,
}

impl GenerateRequest {
    pub fn new(model: impl Into<String>, prompt: impl Into<String>) -> Self {
        GenerateRequest {
            model: model.into(),
            prompt: prompt.into(),
            system: None,
            temperature: CHAT_TEMPERATURE,
            max_tokens: CHAT_MAX_TOKENS,
            think: false,
            images: Vec::new(),
            timeout_secs: CHAT_TIMEOUT_SECS,
        }
    }

    /// Budget preset for the think call and answer call of an insights run.
    pub fn insights(model: impl Into<String>, prompt: impl Into<String>) -> Self {
        GenerateRequest {
            temperature: INSIGHTS_TEMPERATURE,
            max_tokens: INSIGHTS_MAX_TOKENS,
            think: true,
            timeout_secs: INSIGHTS_TIMEOUT_SECS,
            ..GenerateRequest::new(model, prompt)
        }
    }
}

/// One turn of a chat-completion conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatTurn {
    pub role: String,
    pub content: String,
}

impl ChatTurn {
    pub fn system(content: impl Into<String>) -> Self {
        ChatTurn { role: "system".into(), content: content.into() }
    }
    pub fn user(content: impl Into<String>) -> Self {
        ChatTurn { role: "user".into(), content: content.into() }
    }
}

#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatTurn>,
    pub temperature: f32,
    pub think: bool,
    pub timeout_secs: u64,
}

impl ChatRequest {
    pub fn new(model: impl Into<String>, messages: Vec<ChatTurn>) -> Self {
        ChatRequest {
            model: model.into(),
            messages,
            temperature: CHAT_TEMPERATURE,
            think: false,
            timeout_secs: CHAT_TIMEOUT_SECS,
        }
    }
}

// ── Backend trait ──────────────────────────────────────────────────────────

/// The runtime seam. Implementations must be cheap to clone behind an Arc
/// and safe to call concurrently.
#[async_trait]
pub trait LlmBackend: Send + Sync {
    /// Text completion. Hidden reasoning, when produced, is folded into the
    /// returned text as a leading `<think>…</think>` block.
    async fn generate(&self, req: &GenerateRequest) -> EngineResult<String>;

    /// Streaming text completion: answer deltas on the channel, in order.
    /// The channel closes when the completion ends or errors.
    async fn generate_stream(
        &self,
        req: &GenerateRequest,
    ) -> EngineResult<mpsc::Receiver<EngineResult<String>>>;

    /// Chat completion over a message list.
    async fn chat(&self, req: &ChatRequest) -> EngineResult<String>;

    /// Embedding vector for a text. Dimension is a fixed property of the
    /// model.
    async fn embed(&self, model: &str, text: &str) -> EngineResult<Vec<f32>>;

    /// Names of the models available in the runtime.
    async fn list_models(&self) -> EngineResult<Vec<String>>;

    /// Pull a model into the runtime. Blocks until download completes.
    async fn pull_model(&self, model: &str) -> EngineResult<()>;
}

// ── Gateway ────────────────────────────────────────────────────────────────

/// Thin policy layer over the backend: clamps the `think` flag for models
/// without hidden-reasoning support and is the single place callers obtain
/// completions from.
pub struct LlmGateway {
    backend: Arc<dyn LlmBackend>,
    /// Models that must never receive think=true: the router and vision
    /// models do not support extended thinking.
    no_think_models: HashSet<String>,
}

impl LlmGateway {
    pub fn new(backend: Arc<dyn LlmBackend>, no_think_models: HashSet<String>) -> Self {
        LlmGateway { backend, no_think_models }
    }

    pub fn backend(&self) -> Arc<dyn LlmBackend> {
        self.backend.clone()
    }

    pub async fn generate(&self, mut req: GenerateRequest) -> EngineResult<String> {
        if req.think && self.no_think_models.contains(&req.model) {
            debug!("[llm] clamping think=false for model without reasoning support");
            req.think = false;
        }
        self.backend.generate(&req).await
    }

    pub async fn generate_stream(
        &self,
        mut req: GenerateRequest,
    ) -> EngineResult<mpsc::Receiver<EngineResult<String>>> {
        if req.think && self.no_think_models.contains(&req.model) {
            req.think = false;
        }
        self.backend.generate_stream(&req).await
    }

    pub async fn chat(&self, mut req: ChatRequest) -> EngineResult<String> {
        if req.think && self.no_think_models.contains(&req.model) {
            req.think = false;
        }
        self.backend.chat(&req).await
    }
}

// ── Ollama backend ─────────────────────────────────────────────────────────

/// Production backend speaking the Ollama HTTP API.
pub struct OllamaBackend {
    client: reqwest::Client,
    base_url: String,
}

#[derive(Serialize)]
struct OllamaGenerateBody<'a> {
    model: &'a str,
    prompt: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<&'a str>,
    stream: bool,
    think: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    images: Option<&'a [String]>,
    options: OllamaOptions,
}

#[derive(Serialize)]
struct OllamaOptions {
    temperature: f32,
    num_predict: u32,
}

#[derive(Deserialize)]
struct OllamaGenerateReply {
    #[serde(default)]
    response: String,
    #[serde(default)]
    thinking: Option<String>,
    #[serde(default)]
    done: bool,
}

#[derive(Serialize)]
struct OllamaChatBody<'a> {
    model: &'a str,
    messages: &'a [ChatTurn],
    stream: bool,
    think: bool,
    options: OllamaOptions,
}

#[derive(Deserialize)]
struct OllamaChatReply {
    message: Option<ChatTurn>,
}

impl OllamaBackend {
    pub fn new(base_url: impl Into<String>) -> Self {
        OllamaBackend {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }

    /// Map a transport error onto the gateway taxonomy.
    fn classify(e: reqwest::Error, timeout_secs: u64) -> EngineError {
        if e.is_timeout() {
            EngineError::LlmTimeout { seconds: timeout_secs }
        } else if e.is_connect() {
            EngineError::LlmUnavailable(format!("runtime not reachable: {}", e))
        } else {
            EngineError::Network(e)
        }
    }
}

#[async_trait]
impl LlmBackend for OllamaBackend {
    async fn generate(&self, req: &GenerateRequest) -> EngineResult<String> {
        let body = OllamaGenerateBody {
            model: &req.model,
            prompt: &req.prompt,
            system: req.system.as_deref(),
            stream: false,
            think: req.think,
            images: if req.images.is_empty() { None } else { Some(&req.images) },
            options: OllamaOptions { temperature: req.temperature, num_predict: req.max_tokens },
        };

        let resp = self
            .client
            .post(self.url("/api/generate"))
            .json(&body)
            .timeout(Duration::from_secs(req.timeout_secs))
            .send()
            .await
            .map_err(|e| Self::classify(e, req.timeout_secs))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            if status.as_u16() == 404 || text.contains("not found") {
                return Err(EngineError::LlmUnavailable(format!("model missing: {}", text)));
            }
            return Err(EngineError::LlmBadResponse(format!("generate {} — {}", status, text)));
        }

        let reply: OllamaGenerateReply = resp
            .json()
            .await
            .map_err(|e| EngineError::LlmBadResponse(format!("generate body: {}", e)))?;

        if reply.response.is_empty() && reply.thinking.as_deref().unwrap_or("").is_empty() {
            return Err(EngineError::LlmBadResponse("empty completion".into()));
        }

        // Fold a separately-reported reasoning trace into the inline form so
        // downstream stripping has one shape to handle.
        match reply.thinking {
            Some(t) if !t.is_empty() => Ok(format!("<think>{}</think>{}", t, reply.response)),
            _ => Ok(reply.response),
        }
    }

    async fn generate_stream(
        &self,
        req: &GenerateRequest,
    ) -> EngineResult<mpsc::Receiver<EngineResult<String>>> {
        use futures::StreamExt;

        let body = OllamaGenerateBody {
            model: &req.model,
            prompt: &req.prompt,
            system: req.system.as_deref(),
            stream: true,
            think: req.think,
            images: if req.images.is_empty() { None } else { Some(&req.images) },
            options: OllamaOptions { temperature: req.temperature, num_predict: req.max_tokens },
        };

        let resp = self
            .client
            .post(self.url("/api/generate"))
            .json(&body)
            .timeout(Duration::from_secs(req.timeout_secs))
            .send()
            .await
            .map_err(|e| Self::classify(e, req.timeout_secs))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(EngineError::LlmBadResponse(format!("generate {} — {}", status, text)));
        }

        let (tx, rx) = mpsc::channel(32);
        tokio::spawn(async move {
            let mut stream = resp.bytes_stream();
            let mut buf = Vec::new();
            while let Some(chunk) = stream.next().await {
                let chunk = match chunk {
                    Ok(c) => c,
                    Err(e) => {
                        let _ = tx.send(Err(EngineError::LlmBadResponse(e.to_string()))).await;
                        return;
                    }
                };
                buf.extend_from_slice(&chunk);
                // NDJSON framing: one JSON object per line.
                while let Some(pos) = buf.iter().position(|b| *b == b'\n') {
                    let line: Vec<u8> = buf.drain(..=pos).collect();
                    let line = String::from_utf8_lossy(&line);
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<OllamaGenerateReply>(line) {
                        Ok(reply) => {
                            if !reply.response.is_empty()
                                && tx.send(Ok(reply.response)).await.is_err()
                            {
                                return;
                            }
                            if reply.done {
                                return;
                            }
                        }
                        Err(e) => {
                            warn!("[llm] unparsable stream line: {}", e);
                        }
                    }
                }
            }
        });

        Ok(rx)
    }

    async fn chat(&self, req: &ChatRequest) -> EngineResult<String> {
        let body = OllamaChatBody {
            model: &req.model,
            messages: &req.messages,
            stream: false,
            think: req.think,
            options: OllamaOptions { temperature: req.temperature, num_predict: CHAT_MAX_TOKENS },
        };

        let resp = self
            .client
            .post(self.url("/api/chat"))
            .json(&body)
            .timeout(Duration::from_secs(req.timeout_secs))
            .send()
            .await
            .map_err(|e| Self::classify(e, req.timeout_secs))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(EngineError::LlmBadResponse(format!("chat {} — {}", status, text)));
        }

        let reply: OllamaChatReply = resp
            .json()
            .await
            .map_err(|e| EngineError::LlmBadResponse(format!("chat body: {}", e)))?;

        reply
            .message
            .map(|m| m.content)
            .filter(|c| !c.is_empty())
            .ok_or_else(|| EngineError::LlmBadResponse("empty chat completion".into()))
    }

    async fn embed(&self, model: &str, text: &str) -> EngineResult<Vec<f32>> {
        // Current endpoint first (Ollama 0.4+), then the legacy one.
        let body = serde_json::json!({ "model": model, "input": text });
        let resp = self
            .client
            .post(self.url("/api/embed"))
            .json(&body)
            .timeout(Duration::from_secs(EMBED_TIMEOUT_SECS))
            .send()
            .await
            .map_err(|e| Self::classify(e, EMBED_TIMEOUT_SECS))?;

        if resp.status().is_success() {
            let v: serde_json::Value = resp
                .json()
                .await
                .map_err(|e| EngineError::LlmBadResponse(format!("embed body: {}", e)))?;
            if let Some(vec) = parse_embedding(&v) {
                return Ok(vec);
            }
        }

        // Legacy /api/embeddings { model, prompt } → { embedding: [...] }
        let body = serde_json::json!({ "model": model, "prompt": text });
        let resp = self
            .client
            .post(self.url("/api/embeddings"))
            .json(&body)
            .timeout(Duration::from_secs(EMBED_TIMEOUT_SECS))
            .send()
            .await
            .map_err(|e| Self::classify(e, EMBED_TIMEOUT_SECS))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(EngineError::LlmBadResponse(format!("embed {} — {}", status, text)));
        }

        let v: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| EngineError::LlmBadResponse(format!("embed body: {}", e)))?;
        parse_embedding(&v)
            .ok_or_else(|| EngineError::LlmBadResponse("no embedding in response".into()))
    }

    async fn list_models(&self) -> EngineResult<Vec<String>> {
        let resp = self
            .client
            .get(self.url("/api/tags"))
            .timeout(Duration::from_secs(5))
            .send()
            .await
            .map_err(|e| Self::classify(e, 5))?;

        if !resp.status().is_success() {
            return Err(EngineError::LlmUnavailable("runtime returned an error".into()));
        }

        let v: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| EngineError::LlmBadResponse(format!("tags body: {}", e)))?;

        let mut names = Vec::new();
        if let Some(models) = v["models"].as_array() {
            for m in models {
                for key in &["name", "model"] {
                    if let Some(name) = m[*key].as_str() {
                        names.push(name.to_string());
                    }
                }
            }
        }
        names.dedup();
        Ok(names)
    }

    async fn pull_model(&self, model: &str) -> EngineResult<()> {
        info!("[llm] pulling model '{}' (may take a few minutes on first download)", model);

        let body = serde_json::json!({ "name": model, "stream": false });
        let resp = self
            .client
            .post(self.url("/api/pull"))
            .json(&body)
            .timeout(Duration::from_secs(MODEL_PULL_TIMEOUT_SECS))
            .send()
            .await
            .map_err(|e| Self::classify(e, MODEL_PULL_TIMEOUT_SECS))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(EngineError::LlmUnavailable(format!("pull failed {} — {}", status, text)));
        }

        info!("[llm] model '{}' pull complete", model);
        Ok(())
    }
}

/// Extract the vector from either embed-endpoint reply shape:
/// `{ embeddings: [[f32…]] }` or `{ embedding: [f32…] }`.
fn parse_embedding(v: &serde_json::Value) -> Option<Vec<f32>> {
    let arr = v["embeddings"]
        .as_array()
        .and_then(|e| e.first())
        .and_then(|e| e.as_array())
        .or_else(|| v["embedding"].as_array())?;
    let vec: Vec<f32> = arr.iter().filter_map(|x| x.as_f64().map(|f| f as f32)).collect();
    if vec.is_empty() {
        None
    } else {
        Some(vec)
    }
}

/// Model names match loosely: tag suffixes (":latest") are ignored, the
/// way the runtime itself resolves bare names.
pub fn model_matches(installed: &str, wanted: &str) -> bool {
    if installed == wanted {
        return true;
    }
    let installed_base = installed.split(':').next().unwrap_or(installed);
    let wanted_base = wanted.split(':').next().unwrap_or(wanted);
    installed_base == wanted_base
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_embedding_new_shape() {
        let v = serde_json::json!({ "embeddings": [[0.1, 0.2, 0.3]] });
        assert_eq!(parse_embedding(&v), Some(vec![0.1, 0.2, 0.3]));
    }

    #[test]
    fn test_parse_embedding_legacy_shape() {
        let v = serde_json::json!({ "embedding": [1.0, -1.0] });
        assert_eq!(parse_embedding(&v), Some(vec![1.0, -1.0]));
    }

    #[test]
    fn test_parse_embedding_empty_is_none() {
        assert_eq!(parse_embedding(&serde_json::json!({ "embeddings": [[]] })), None);
        assert_eq!(parse_embedding(&serde_json::json!({})), None);
    }

    #[test]
    fn test_model_matches_ignores_tag() {
        assert!(model_matches("qwen3:8b", "qwen3"));
        assert!(model_matches("nomic-embed-text:latest", "nomic-embed-text"));
        assert!(!model_matches("qwen3:8b", "llama3"));
    }

    #[test]
    fn test_insights_preset_budgets() {
        let req = GenerateRequest::insights("m", "p");
        assert!(req.think);
        assert_eq!(req.max_tokens, INSIGHTS_MAX_TOKENS);
        assert_eq!(req.timeout_secs, INSIGHTS_TIMEOUT_SECS);
    }
}

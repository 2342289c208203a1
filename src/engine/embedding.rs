// Tahlil Engine — Embedding Service
//
// Produces vector representations of text through the LLM backend, with a
// content-addressed on-disk cache: one file per SHA-256(text) holding the
// raw little-endian f32 bytes. Cache hits never touch the model, which
// makes re-ingestion of a previously seen document nearly free.
//
// Also home to the vector math helpers shared with the index.

use crate::atoms::error::EngineResult;
use crate::engine::llm::LlmBackend;
use log::{debug, warn};
use sha2::{Digest, Sha256};
use std::path::PathBuf;
use std::sync::Arc;

// ── Vector math utilities ──────────────────────────────────────────────────

/// Convert a byte slice (from an SQLite BLOB or cache file) to a Vec<f32>.
pub(crate) fn bytes_to_f32_vec(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Convert a Vec<f32> to bytes for BLOB / cache-file storage.
pub(crate) fn f32_vec_to_bytes(vec: &[f32]) -> Vec<u8> {
    vec.iter().flat_map(|f| f.to_le_bytes()).collect()
}

/// Cosine similarity between two vectors. Returns 0.0 if either is
/// zero-length or the dimensions disagree.
pub(crate) fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (x, y) in a.iter().zip(b.iter()) {
        let x = *x as f64;
        let y = *y as f64;
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < 1e-12 {
        0.0
    } else {
        dot / denom
    }
}

// ── Embedding client ───────────────────────────────────────────────────────

pub struct EmbeddingClient {
    backend: Arc<dyn LlmBackend>,
    model: String,
    cache_dir: PathBuf,
}

impl EmbeddingClient {
    pub fn new(backend: Arc<dyn LlmBackend>, model: impl Into<String>, cache_dir: PathBuf) -> Self {
        EmbeddingClient { backend, model: model.into(), cache_dir }
    }

    /// Get the embedding vector for a text. Pure function of the input:
    /// identical text always yields the identical vector, which is what
    /// makes the content-hash cache sound.
    pub async fn embed(&self, text: &str) -> EngineResult<Vec<f32>> {
        let key = cache_key(&self.model, text);
        let path = self.cache_dir.join(&key);

        match tokio::fs::read(&path).await {
            Ok(bytes) if !bytes.is_empty() && bytes.len() % 4 == 0 => {
                debug!("[embed] cache hit {}", key);
                return Ok(bytes_to_f32_vec(&bytes));
            }
            Ok(_) => {
                // Odd-length or empty file: treat as a miss and rewrite.
                warn!("[embed] corrupt cache entry {} — recomputing", key);
            }
            Err(_) => {}
        }

        let vec = self.backend.embed(&self.model, text).await?;

        if let Err(e) = self.write_cache(&path, &vec).await {
            // Cache is a latency optimisation only; failure to persist is
            // not failure to embed.
            warn!("[embed] could not write cache entry {}: {}", key, e);
        }

        Ok(vec)
    }

    async fn write_cache(&self, path: &PathBuf, vec: &[f32]) -> std::io::Result<()> {
        tokio::fs::create_dir_all(&self.cache_dir).await?;
        tokio::fs::write(path, f32_vec_to_bytes(vec)).await
    }
}

/// Cache entries are keyed on model + content so switching the embedding
/// model can never serve stale vectors of the wrong dimension.
fn cache_key(model: &str, text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(model.as_bytes());
    hasher.update([0u8]);
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

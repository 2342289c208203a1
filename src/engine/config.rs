// Tahlil Engine — Configuration
//
// One EngineConfig built from environment variables with local-first
// defaults. Everything the engine touches on disk lives under `data_dir`:
//   engine.db     — relational workspace store
//   index.db      — vector collection (overridable via VECTOR_PERSIST_DIR)
//   embed-cache/  — hash-keyed embedding vectors
//   uploads/      — original uploaded files

use crate::atoms::constants::{CACHE_TTL_HOURS_DEFAULT, MAX_FILE_SIZE_MB_DEFAULT};
use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Base URL of the local model runtime, e.g. "http://localhost:11434".
    pub llm_base_url: String,
    /// Large model for the two-call insights protocol and chat answers.
    pub primary_model: String,
    /// Small fast model for routing and query understanding. Does not
    /// support extended thinking; always called with think=false.
    pub router_model: String,
    /// Multimodal model for PDF page extraction.
    pub vision_model: String,
    /// Embedding model; its dimension is a fixed property.
    pub embedding_model: String,
    pub data_dir: PathBuf,
    pub vector_persist_dir: PathBuf,
    pub max_file_size_mb: u64,
    pub cache_ttl_hours: u64,
    pub bind_address: String,
    pub port: u16,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let data_dir = dirs::home_dir().unwrap_or_default().join(".tahlil");
        EngineConfig {
            llm_base_url: "http://localhost:11434".into(),
            primary_model: "qwen3:8b".into(),
            router_model: "qwen3:0.6b".into(),
            vision_model: "qwen2.5vl:7b".into(),
            embedding_model: "nomic-embed-text".into(),
            vector_persist_dir: data_dir.join("index"),
            data_dir,
            max_file_size_mb: MAX_FILE_SIZE_MB_DEFAULT,
            cache_ttl_hours: CACHE_TTL_HOURS_DEFAULT,
            bind_address: "127.0.0.1".into(),
            port: 8420,
        }
    }
}

impl EngineConfig {
    /// Build the configuration from environment variables, falling back to
    /// the defaults above for anything unset or unparsable.
    pub fn from_env() -> Self {
        let mut cfg = EngineConfig::default();

        let host = env_str("LLM_HOST");
        let port = env_str("LLM_PORT");
        match (host, port) {
            (Some(h), Some(p)) => cfg.llm_base_url = format!("http://{}:{}", h, p),
            (Some(h), None) => cfg.llm_base_url = format!("http://{}:11434", h),
            _ => {}
        }

        if let Some(m) = env_str("PRIMARY_MODEL") {
            cfg.primary_model = m;
        }
        if let Some(m) = env_str("ROUTER_MODEL") {
            cfg.router_model = m;
        }
        if let Some(m) = env_str("VISION_MODEL") {
            cfg.vision_model = m;
        }
        if let Some(m) = env_str("EMBEDDING_MODEL") {
            cfg.embedding_model = m;
        }
        if let Some(d) = env_str("DATA_DIR") {
            cfg.data_dir = PathBuf::from(d);
            cfg.vector_persist_dir = cfg.data_dir.join("index");
        }
        if let Some(d) = env_str("VECTOR_PERSIST_DIR") {
            cfg.vector_persist_dir = PathBuf::from(d);
        }
        if let Some(n) = env_str("MAX_FILE_SIZE_MB").and_then(|v| v.parse().ok()) {
            cfg.max_file_size_mb = n;
        }
        if let Some(n) = env_str("CACHE_TTL_HOURS").and_then(|v| v.parse().ok()) {
            cfg.cache_ttl_hours = n;
        }
        if let Some(a) = env_str("BIND_ADDRESS") {
            cfg.bind_address = a;
        }
        if let Some(p) = env_str("PORT").and_then(|v| v.parse().ok()) {
            cfg.port = p;
        }

        cfg
    }

    pub fn engine_db_path(&self) -> PathBuf {
        self.data_dir.join("engine.db")
    }

    pub fn index_db_path(&self) -> PathBuf {
        self.vector_persist_dir.join("index.db")
    }

    pub fn embed_cache_dir(&self) -> PathBuf {
        self.data_dir.join("embed-cache")
    }

    pub fn uploads_dir(&self) -> PathBuf {
        self.data_dir.join("uploads")
    }

    pub fn max_file_size_bytes(&self) -> u64 {
        self.max_file_size_mb * 1024 * 1024
    }
}

fn env_str(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_local() {
        let cfg = EngineConfig::default();
        assert!(cfg.llm_base_url.contains("localhost"));
        assert_eq!(cfg.max_file_size_mb, 50);
        assert_eq!(cfg.cache_ttl_hours, 24);
    }

    #[test]
    fn test_data_paths_derive_from_data_dir() {
        let mut cfg = EngineConfig::default();
        cfg.data_dir = PathBuf::from("/tmp/tahlil-test");
        assert_eq!(cfg.engine_db_path(), PathBuf::from("/tmp/tahlil-test/engine.db"));
        assert_eq!(cfg.embed_cache_dir(), PathBuf::from("/tmp/tahlil-test/embed-cache"));
        assert_eq!(cfg.uploads_dir(), PathBuf::from("/tmp/tahlil-test/uploads"));
    }
}

// ── Tahlil Atoms: Error Types ──────────────────────────────────────────────
// Single canonical error enum for the engine, built with `thiserror`.
//
// Design rules:
//   • Variants are coarse-grained by domain (I/O, DB, LLM, Ingestion…).
//   • The `#[from]` attribute wires std/external error conversions automatically.
//   • The HTTP boundary maps variants to status codes in api/mod.rs; user-facing
//     messages stay short and actionable.
//   • No variant carries model names or internal identifiers beyond upload_id
//     in its message.

use thiserror::Error;

// ── Primary error enum ─────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum EngineError {
    /// Filesystem or OS-level I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization / deserialization failure.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// HTTP / network failure (reqwest layer).
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    /// SQLite / rusqlite database failure.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// The model runtime is not reachable or the model is missing.
    #[error("Model runtime unavailable: {0}")]
    LlmUnavailable(String),

    /// A model call exceeded its per-call deadline.
    #[error("Model call timed out after {seconds}s")]
    LlmTimeout { seconds: u64 },

    /// The model answered, but the payload was unusable (empty, bad JSON…).
    #[error("Unusable model response: {0}")]
    LlmBadResponse(String),

    /// The uploaded document produced zero usable records.
    #[error("Could not parse the uploaded document: {0}")]
    IngestionParseFailed(String),

    /// An agent's evidence query matched nothing in this workspace.
    #[error("No matching evidence in this workspace")]
    RetrievalEmpty,

    /// The (user_id, upload_id) pair does not name a known workspace.
    #[error("Workspace not found: {0}")]
    WorkspaceNotFound(String),

    /// The workspace exists but is still ingesting.
    #[error("Workspace is still processing: {0}")]
    WorkspaceBusy(String),

    /// Chat was requested before any insights run cached context.
    #[error("Run a full analysis first to enable chat for this workspace")]
    NeedsInsights,

    /// Engine configuration is invalid or missing.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Malformed caller input (bad query parameter, oversized file…).
    #[error("Invalid request: {0}")]
    BadRequest(String),

    /// Catch-all for errors that do not yet have a dedicated variant.
    /// Prefer adding a specific variant over using this in new code.
    #[error("{0}")]
    Other(String),
}

// ── Migration bridge: String → EngineError ─────────────────────────────────
// Allows `?` on helpers that report plain strings inside functions
// that return `EngineResult<T>`.

impl From<String> for EngineError {
    fn from(s: String) -> Self {
        EngineError::Other(s)
    }
}

impl From<&str> for EngineError {
    fn from(s: &str) -> Self {
        EngineError::Other(s.to_string())
    }
}

// ── Convenience alias ──────────────────────────────────────────────────────

/// All engine operations should return this type.
pub type EngineResult<T> = Result<T, EngineError>;

// ── Conversion: EngineError → String ───────────────────────────────────────
// Lets boundary code call `.map_err(EngineError::into)` directly.

impl From<EngineError> for String {
    fn from(e: EngineError) -> Self {
        e.to_string()
    }
}

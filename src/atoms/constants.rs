// ── Tahlil Atoms: Constants ────────────────────────────────────────────────
// All named constants for the crate live here.
// Rationale: collecting constants in one place eliminates magic strings,
// makes auditing easier, and keeps every layer's code self-documenting.

// ── LLM call budgets ───────────────────────────────────────────────────────
// Insights runs are long-form deep analysis; chat reuses cached context and
// must stay interactive. Timeouts are per call, not per run.
pub const INSIGHTS_TIMEOUT_SECS: u64 = 180;
pub const CHAT_TIMEOUT_SECS: u64 = 30;
pub const EMBED_TIMEOUT_SECS: u64 = 60;
pub const MODEL_PULL_TIMEOUT_SECS: u64 = 600;

/// Token ceiling for the think call and the answer call of an insights run.
pub const INSIGHTS_MAX_TOKENS: u32 = 32_000;
/// Token ceiling for a cached-context chat reply.
pub const CHAT_MAX_TOKENS: u32 = 8_000;

/// Temperature is low but nonzero: determinism is a non-goal, repeatability
/// under retry is not.
pub const INSIGHTS_TEMPERATURE: f32 = 0.1;
pub const ANSWER_TEMPERATURE: f32 = 0.2;
pub const CHAT_TEMPERATURE: f32 = 0.1;

// ── Retrieval ──────────────────────────────────────────────────────────────
/// Evidence window per agent call. Agents retrieve between the floor and
/// the cap depending on their domain filter.
pub const EVIDENCE_DEFAULT_K: usize = 50;
pub const EVIDENCE_MAX_K: usize = 100;

/// Vector-index insert batch size. One SQLite transaction per batch.
pub const INDEX_INSERT_BATCH: usize = 100;

// ── Workspace cache ────────────────────────────────────────────────────────
/// Default TTL for the in-memory insights bundle cache. Tunable via
/// CACHE_TTL_HOURS; correctness never depends on it (database fallback).
pub const CACHE_TTL_HOURS_DEFAULT: u64 = 24;

// ── Chat protocol sentinel ─────────────────────────────────────────────────
/// Returned (and surfaced to the user) when chat is requested before any
/// insights run has produced cached context for the routed agent.
/// Stable contract: the UI matches on this exact token.
pub const NEEDS_INSIGHTS: &str = "NEEDS_INSIGHTS";

// ── Ingestion limits ───────────────────────────────────────────────────────
pub const MAX_FILE_SIZE_MB_DEFAULT: u64 = 50;
/// Header row must appear within this many leading lines of a tabular file.
pub const HEADER_SCAN_LINES: usize = 20;
/// Encoding sniff window.
pub const ENCODING_SNIFF_BYTES: usize = 1024;

// ── Vision processing ──────────────────────────────────────────────────────
/// Rasterisation density for PDF pages. 150 DPI keeps statement tables
/// legible to the vision model without exploding image payloads.
pub const VISION_PDF_DPI: u32 = 150;
/// Hard page cap per document; statements beyond this are truncated.
pub const VISION_MAX_PAGES: usize = 20;

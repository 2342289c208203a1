// Tahlil — privacy-preserving multi-agent financial analysis engine.
// Library root: module declarations only. The server binary lives in
// main.rs; everything else is reachable for integration tests.

// ── Atoms (constants, error types, domain types) ───────────────────────────
pub mod atoms;

// ── Engine (all business logic) ────────────────────────────────────────────
pub mod engine;

// ── API (HTTP/WS boundary) ─────────────────────────────────────────────────
pub mod api;

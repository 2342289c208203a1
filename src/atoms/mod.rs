// ── Tahlil Atoms Layer ─────────────────────────────────────────────────────
// Pure constants, error types, and domain data types — zero side effects.
// Dependency rule: atoms may only depend on std and external pure crates.
// Nothing here may import from engine/, api/, or main.rs.

pub mod constants;
pub mod error;
pub mod types;

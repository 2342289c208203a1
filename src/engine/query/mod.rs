// Tahlil Engine — Query Understanding & Routing
//
// Small-model, think=false territory: one call turns a natural-language
// question into a structured intent (understand.rs), another picks the
// agent that should answer (router.rs). Both degrade deterministically
// when the model misbehaves; a chat query must never fail because a
// 0.6B model emitted bad JSON.

pub mod router;
pub mod understand;

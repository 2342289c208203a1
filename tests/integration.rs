// Tahlil — end-to-end integration tests.
//
// Single test binary over the full engine stack: real SQLite stores and
// vector index in a temp directory, with the model runtime replaced by a
// scripted double behind the LlmBackend seam. The double records every
// call (model, think flag, prompt) so the tests can assert not just what
// the engine answered but what it asked for — and what it never asked
// for.

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use tempfile::TempDir;
use tokio::sync::mpsc;

use tahlil::atoms::constants::NEEDS_INSIGHTS;
use tahlil::atoms::error::{EngineError, EngineResult};
use tahlil::atoms::types::*;
use tahlil::engine::config::EngineConfig;
use tahlil::engine::index::filter::Filter;
use tahlil::engine::ingest;
use tahlil::engine::llm::{ChatRequest, GenerateRequest, LlmBackend};
use tahlil::engine::state::EngineState;

// ── Scripted model double ──────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct RecordedCall {
    kind: &'static str, // "generate" | "chat" | "embed"
    model: String,
    think: bool,
}

#[derive(Default)]
struct ScriptedLlm {
    calls: Mutex<Vec<RecordedCall>>,
}

impl ScriptedLlm {
    fn new() -> Arc<Self> {
        Arc::new(ScriptedLlm::default())
    }

    fn count(&self, kind: &str) -> usize {
        self.calls.lock().iter().filter(|c| c.kind == kind).count()
    }

    fn model_calls(&self) -> usize {
        self.count("generate") + self.count("chat")
    }

    fn calls_for_model(&self, model: &str) -> Vec<RecordedCall> {
        self.calls.lock().iter().filter(|c| c.model == model).cloned().collect()
    }
}

#[async_trait]
impl LlmBackend for ScriptedLlm {
    async fn generate(&self, req: &GenerateRequest) -> EngineResult<String> {
        self.calls.lock().push(RecordedCall {
            kind: "generate",
            model: req.model.clone(),
            think: req.think,
        });
        // Echo the prompt: answers then provably contain exactly the
        // evidence the engine supplied, nothing else.
        if req.think {
            Ok(format!("<think>scripted private reasoning</think>SCRIPTED ANALYSIS:\n{}", req.prompt))
        } else {
            Ok(format!("SCRIPTED ANSWER:\n{}", req.prompt))
        }
    }

    async fn generate_stream(
        &self,
        req: &GenerateRequest,
    ) -> EngineResult<mpsc::Receiver<EngineResult<String>>> {
        self.calls.lock().push(RecordedCall {
            kind: "generate",
            model: req.model.clone(),
            think: req.think,
        });
        let (tx, rx) = mpsc::channel(4);
        let prompt = req.prompt.clone();
        tokio::spawn(async move {
            let _ = tx.send(Ok("SCRIPTED ".to_string())).await;
            let _ = tx.send(Ok(format!("STREAM:\n{}", prompt))).await;
        });
        Ok(rx)
    }

    async fn chat(&self, req: &ChatRequest) -> EngineResult<String> {
        self.calls.lock().push(RecordedCall {
            kind: "chat",
            model: req.model.clone(),
            think: req.think,
        });
        Ok("budget_advisor".to_string())
    }

    async fn embed(&self, model: &str, text: &str) -> EngineResult<Vec<f32>> {
        self.calls.lock().push(RecordedCall {
            kind: "embed",
            model: model.to_string(),
            think: false,
        });
        // Deterministic 8-dim pseudo-embedding from the text bytes.
        let mut acc: [u32; 8] = [7; 8];
        for (i, b) in text.bytes().enumerate() {
            acc[i % 8] = acc[i % 8].wrapping_mul(31).wrapping_add(b as u32);
        }
        Ok(acc.iter().map(|x| (*x % 1000) as f32 / 1000.0).collect())
    }

    async fn list_models(&self) -> EngineResult<Vec<String>> {
        Ok(vec!["primary-test".into(), "router-test".into()])
    }

    async fn pull_model(&self, _model: &str) -> EngineResult<()> {
        Ok(())
    }
}

// ── Harness ────────────────────────────────────────────────────────────────

const PRIMARY: &str = "primary-test";
const ROUTER: &str = "router-test";

fn test_state(backend: Arc<ScriptedLlm>) -> (Arc<EngineState>, TempDir) {
    let dir = TempDir::new().expect("temp dir");
    let config = EngineConfig {
        llm_base_url: "http://localhost:0".into(),
        primary_model: PRIMARY.into(),
        router_model: ROUTER.into(),
        vision_model: "vision-test".into(),
        embedding_model: "embed-test".into(),
        data_dir: dir.path().join("data"),
        vector_persist_dir: dir.path().join("index"),
        max_file_size_mb: 50,
        cache_ttl_hours: 24,
        bind_address: "127.0.0.1".into(),
        port: 0,
    };
    let state = EngineState::with_backend(config, backend).expect("engine state");
    (Arc::new(state), dir)
}

/// Upload + ingest a file the way the API does: row first, bytes on
/// disk, then the background pipeline (awaited here).
async fn ingest_file(
    state: &EngineState,
    user_id: &str,
    upload_id: &str,
    filename: &str,
    content: &str,
) -> EngineResult<()> {
    state.store.create_upload(&Upload {
        upload_id: upload_id.to_string(),
        user_id: user_id.to_string(),
        filename: filename.to_string(),
        document_type: None,
        status: UploadStatus::Uploading,
        created_at: Utc::now(),
        summary_metadata: serde_json::Map::new(),
    })?;
    let path = ingest::stored_file_path(&state.config.uploads_dir(), upload_id, filename);
    std::fs::write(&path, content)?;
    state.ingest.ingest(user_id, upload_id, &path, filename).await
}

const S1_CSV: &str = "Date,Description,Debit,Credit,Balance\n\
    2025-01-05,WALMART GROCERY,150.00,,4850.00\n\
    2025-01-06,SALARY,,3000.00,7850.00\n\
    2025-01-10,ELECTRIC BILL,125.00,,7725.00\n";

const FINANCIAL_CSV: &str = "Statement of Financial Position,,\n\
    Total current assets,500000,450000\n\
    Total non-current assets,1500000,1350000\n\
    Total assets,2000000,1800000\n\
    Total current liabilities,250000,240000\n\
    Total liabilities,1200000,1100000\n\
    Total equity,800000,700000\n\
    Revenue,1000000,900000\n\
    Net income,150000,120000\n";

fn dec(s: &str) -> Decimal {
    Decimal::from_str(s).unwrap()
}

fn finding_decimal(result: &AnalysisResult, key: &str) -> Decimal {
    dec(result.findings[key].as_str().unwrap_or_else(|| panic!("finding {} missing", key)))
}

// ── Scenario 1: CSV ingest + insights + expense chat ───────────────────────

#[tokio::test]
async fn scenario1_csv_ingest_insights_and_chat() {
    let llm = ScriptedLlm::new();
    let (state, _dir) = test_state(llm.clone());

    ingest_file(&state, "u1", "upload_s1", "s1.csv", S1_CSV).await.unwrap();

    let upload = state.store.get_upload("u1", "upload_s1").unwrap().unwrap();
    assert_eq!(upload.status, UploadStatus::Completed);
    assert_eq!(upload.document_type, Some(DocumentType::Transactions));
    assert_eq!(upload.summary_metadata["rows"], serde_json::json!(3));

    let results = state.orchestrator.run_full_insights("u1", "upload_s1").await.unwrap();
    assert_eq!(results.len(), 6, "all six transaction agents ran");
    for (name, result) in &results {
        assert_eq!(result.status, AnalysisStatus::Completed, "{} failed", name);
        assert!(!result.summary.is_empty());
        assert!(
            !result.summary.contains("<think>"),
            "{} leaked a reasoning trace",
            name
        );
    }

    assert_eq!(finding_decimal(&results["expense"], "monthly_total"), dec("275.00"));
    assert_eq!(finding_decimal(&results["income"], "total"), dec("3000.00"));

    let answer = state
        .orchestrator
        .answer_chat("u1", "upload_s1", "what did I spend on groceries?")
        .await
        .unwrap();
    assert_eq!(answer.agent_used, "expense");
    assert!(answer.answer.contains("WALMART GROCERY"));
    assert!(answer.answer.contains("150.00"));
    assert!(!answer.sources.is_empty());

    let history = state.store.chat_history("upload_s1", 10, None).unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].role, ChatRole::User);
    assert_eq!(history[1].role, ChatRole::Assistant);
    assert_eq!(history[1].agent_name.as_deref(), Some("expense"));
}

// ── Scenario 2: workspace isolation ────────────────────────────────────────

#[tokio::test]
async fn scenario2_workspace_isolation() {
    let llm = ScriptedLlm::new();
    let (state, _dir) = test_state(llm.clone());

    let u2 = "Date,Description,Debit\n2025-02-01,ATM,500.00\n";
    let u3 = "Date,Description,Debit\n2025-02-02,SUPERMARKET,50.00\n";
    ingest_file(&state, "u1", "upload_u2", "a.csv", u2).await.unwrap();
    ingest_file(&state, "u1", "upload_u3", "b.csv", u3).await.unwrap();

    state.orchestrator.run_full_insights("u1", "upload_u2").await.unwrap();
    state.orchestrator.run_full_insights("u1", "upload_u3").await.unwrap();

    let a2 = state
        .orchestrator
        .answer_chat("u1", "upload_u2", "what was my largest expense?")
        .await
        .unwrap();
    assert!(a2.answer.contains("ATM"));
    assert!(a2.answer.contains("500"));
    assert!(
        !a2.answer.contains("SUPERMARKET"),
        "workspace u2 must never see u3's data"
    );

    let a3 = state
        .orchestrator
        .answer_chat("u1", "upload_u3", "what was my largest expense?")
        .await
        .unwrap();
    assert!(a3.answer.contains("SUPERMARKET"));
    assert!(a3.answer.contains("50"));
    assert!(!a3.answer.contains("ATM"), "workspace u3 must never see u2's data");

    // The same holds at the index layer: structured reads are disjoint.
    let d2 = state.index.query_structured(&Filter::upload("upload_u2"), 100).unwrap();
    let d3 = state.index.query_structured(&Filter::upload("upload_u3"), 100).unwrap();
    assert!(!d2.is_empty() && !d3.is_empty());
    for doc in &d2 {
        assert_eq!(doc.meta.upload_id, "upload_u2");
    }
    for doc in &d3 {
        assert_eq!(doc.meta.upload_id, "upload_u3");
    }
}

// ── Scenario 3: chat before insights ───────────────────────────────────────

#[tokio::test]
async fn scenario3_chat_without_insights_makes_no_model_calls() {
    let llm = ScriptedLlm::new();
    let (state, _dir) = test_state(llm.clone());

    ingest_file(&state, "u1", "upload_u4", "s.csv", S1_CSV).await.unwrap();
    assert_eq!(llm.model_calls(), 0, "ingestion embeds, it does not generate");

    let answer = state
        .orchestrator
        .answer_chat("u1", "upload_u4", "what did I spend?")
        .await
        .unwrap();
    assert!(answer.answer.contains(NEEDS_INSIGHTS));
    assert_eq!(llm.model_calls(), 0, "chat without insights must not touch the model");

    // The sentinel turn is still a recorded conversation.
    let history = state.store.chat_history("upload_u4", 10, None).unwrap();
    assert_eq!(history.len(), 2);
}

// ── Scenario 4: cache fallback ─────────────────────────────────────────────

#[tokio::test]
async fn scenario4_chat_survives_cache_purge() {
    let llm = ScriptedLlm::new();
    let (state, _dir) = test_state(llm.clone());

    ingest_file(&state, "u1", "upload_u5", "s.csv", S1_CSV).await.unwrap();
    state.orchestrator.run_full_insights("u1", "upload_u5").await.unwrap();

    let with_cache = state
        .orchestrator
        .answer_chat("u1", "upload_u5", "how much salary income came in?")
        .await
        .unwrap();

    state.cache.clear();

    let without_cache = state
        .orchestrator
        .answer_chat("u1", "upload_u5", "how much salary income came in?")
        .await
        .unwrap();

    assert!(!without_cache.answer.is_empty());
    // Cache transparency: same agent, same evidence, with or without cache.
    assert_eq!(with_cache.agent_used, without_cache.agent_used);
    assert_eq!(with_cache.sources, without_cache.sources);
}

// ── Scenario 5: delete cascade ─────────────────────────────────────────────

#[tokio::test]
async fn scenario5_delete_cascade_is_complete() {
    let llm = ScriptedLlm::new();
    let (state, _dir) = test_state(llm.clone());

    ingest_file(&state, "u1", "upload_u6", "s.csv", S1_CSV).await.unwrap();
    state.orchestrator.run_full_insights("u1", "upload_u6").await.unwrap();
    state.orchestrator.answer_chat("u1", "upload_u6", "fees?").await.unwrap();

    state.orchestrator.delete_workspace("u1", "upload_u6").unwrap();

    assert!(state.store.get_upload("u1", "upload_u6").unwrap().is_none());
    assert!(state.store.list_uploads("u1").unwrap().is_empty());
    assert!(state.store.chat_history("upload_u6", 10, None).unwrap().is_empty());
    assert!(state.store.latest_analyses("upload_u6").unwrap().is_empty());
    assert!(state
        .index
        .query_structured(&Filter::upload("upload_u6"), 1)
        .unwrap()
        .is_empty());
    assert!(!state.cache.contains_upload("upload_u6"));

    let leftover: Vec<PathBuf> = std::fs::read_dir(state.config.uploads_dir())
        .unwrap()
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.to_string_lossy().contains("upload_u6"))
        .collect();
    assert!(leftover.is_empty(), "upload artefacts must be removed: {:?}", leftover);

    // Unknown afterwards: the endpoint contract is 404.
    assert!(matches!(
        state.orchestrator.delete_workspace("u1", "upload_u6"),
        Err(EngineError::WorkspaceNotFound(_))
    ));
}

// ── Scenario 6: financial statement ratios ─────────────────────────────────

#[tokio::test]
async fn scenario6_financial_statement_ratios() {
    let llm = ScriptedLlm::new();
    let (state, _dir) = test_state(llm.clone());

    ingest_file(&state, "u1", "upload_fs", "annual_report.csv", FINANCIAL_CSV).await.unwrap();

    let upload = state.store.get_upload("u1", "upload_fs").unwrap().unwrap();
    assert_eq!(upload.document_type, Some(DocumentType::FinancialStatement));
    assert_eq!(upload.status, UploadStatus::Completed);

    let statement = state.store.get_statement("upload_fs").unwrap().unwrap();
    let r = &statement.ratios;
    assert!((r.net_margin.current.unwrap() - 0.15).abs() < 1e-6);
    assert!((r.roa.current.unwrap() - 0.075).abs() < 1e-6);
    assert!((r.roe.current.unwrap() - 0.1875).abs() < 1e-6);

    let results = state.orchestrator.run_full_insights("u1", "upload_fs").await.unwrap();
    assert_eq!(results.len(), 6, "all six financial agents ran");
    let ratio = &results["ratio_analyst"];
    assert_eq!(ratio.status, AnalysisStatus::Completed);
    assert!(
        (ratio.findings["profitability_block"]["net_margin"].as_f64().unwrap() - 0.15).abs()
            < 1e-6
    );
}

// ── Property: chat ordering across requests ────────────────────────────────

#[tokio::test]
async fn chat_messages_keep_wall_clock_order() {
    let llm = ScriptedLlm::new();
    let (state, _dir) = test_state(llm.clone());

    ingest_file(&state, "u1", "upload_ord", "s.csv", S1_CSV).await.unwrap();
    state.orchestrator.run_full_insights("u1", "upload_ord").await.unwrap();

    state.orchestrator.answer_chat("u1", "upload_ord", "first question").await.unwrap();
    state.orchestrator.answer_chat("u1", "upload_ord", "second question").await.unwrap();

    let history = state.store.chat_history("upload_ord", 10, None).unwrap();
    assert_eq!(history.len(), 4);
    for pair in history.windows(2) {
        assert!(pair[0].created_at < pair[1].created_at);
    }
    assert_eq!(history[0].content, "first question");
    assert_eq!(history[2].content, "second question");
}

// ── Property: insights durability across restarts ──────────────────────────

#[tokio::test]
async fn insights_survive_engine_restart() {
    let llm = ScriptedLlm::new();
    let (state, dir) = test_state(llm.clone());
    let config = state.config.clone();

    ingest_file(&state, "u1", "upload_dur", "s.csv", S1_CSV).await.unwrap();
    state.orchestrator.run_full_insights("u1", "upload_dur").await.unwrap();
    drop(state);

    // Same data directory, fresh process state, empty cache.
    let reopened = EngineState::with_backend(config, ScriptedLlm::new()).unwrap();
    let results = reopened.orchestrator.saved_results("u1", "upload_dur").unwrap();
    assert_eq!(results.len(), 6);
    assert!(results.values().all(|r| r.status == AnalysisStatus::Completed));

    let answer = reopened
        .orchestrator
        .answer_chat("u1", "upload_dur", "what did I spend?")
        .await
        .unwrap();
    assert!(!answer.answer.contains(NEEDS_INSIGHTS));

    drop(dir);
}

// ── Property: small models never receive think=true ────────────────────────

#[tokio::test]
async fn router_model_is_always_called_without_thinking() {
    let llm = ScriptedLlm::new();
    let (state, _dir) = test_state(llm.clone());

    ingest_file(&state, "u1", "upload_tf", "s.csv", S1_CSV).await.unwrap();
    state.orchestrator.run_full_insights("u1", "upload_tf").await.unwrap();

    // An ambiguous query exercises both the understander and the
    // stage-2 router disambiguation.
    state
        .orchestrator
        .answer_chat("u1", "upload_tf", "tell me something interesting about this data")
        .await
        .unwrap();

    let router_calls = llm.calls_for_model(ROUTER);
    assert!(!router_calls.is_empty(), "the small model was consulted");
    for call in &router_calls {
        assert!(!call.think, "small models must always be called with think=false");
    }

    // And the insights protocol did use extended thinking on the primary.
    let primary_calls = llm.calls_for_model(PRIMARY);
    assert!(primary_calls.iter().any(|c| c.think), "insights calls request thinking");
}

// ── Failure path: unparsable upload ────────────────────────────────────────

#[tokio::test]
async fn unparsable_upload_is_marked_failed() {
    let llm = ScriptedLlm::new();
    let (state, _dir) = test_state(llm.clone());

    let junk = "Date,Description,Amount\nnot-a-date,JUNK,abc\n";
    let result = ingest_file(&state, "u1", "upload_bad", "bad.csv", junk).await;
    assert!(matches!(result, Err(EngineError::IngestionParseFailed(_))));

    let upload = state.store.get_upload("u1", "upload_bad").unwrap().unwrap();
    assert_eq!(upload.status, UploadStatus::Failed);
    assert!(upload.summary_metadata.contains_key("error"));

    // A failed workspace rejects analysis and chat instead of running on
    // empty data.
    assert!(state.orchestrator.run_full_insights("u1", "upload_bad").await.is_err());
}

// ── Boundary: single transaction still yields a full panel ─────────────────

#[tokio::test]
async fn single_transaction_panel_has_no_empty_summaries() {
    let llm = ScriptedLlm::new();
    let (state, _dir) = test_state(llm.clone());

    let single = "Date,Description,Debit\n2025-03-01,COFFEE,12.50\n";
    ingest_file(&state, "u1", "upload_one", "one.csv", single).await.unwrap();

    let results = state.orchestrator.run_full_insights("u1", "upload_one").await.unwrap();
    assert_eq!(results.len(), 6);
    for (name, result) in &results {
        assert!(!result.summary.is_empty(), "{} produced an empty summary", name);
    }
    // The debit-only workspace still completes the expense agent…
    assert_eq!(results["expense"].status, AnalysisStatus::Completed);
    // …while the income agent honestly reports the evidence gap.
    assert_eq!(results["income"].status, AnalysisStatus::Failed);
    assert!(results["income"].summary.contains("insufficient evidence"));
}

// ── Embedding cache: re-ingestion skips the model ──────────────────────────

#[tokio::test]
async fn embedding_cache_short_circuits_repeat_texts() {
    let llm = ScriptedLlm::new();
    let (state, _dir) = test_state(llm.clone());

    ingest_file(&state, "u1", "upload_e1", "s.csv", S1_CSV).await.unwrap();
    let first = llm.count("embed");
    assert!(first > 0);

    // Same rows, different workspace: every text is already cached.
    ingest_file(&state, "u1", "upload_e2", "s.csv", S1_CSV).await.unwrap();
    assert_eq!(llm.count("embed"), first, "cached embeddings must not call the model");

    // Both workspaces are fully indexed regardless.
    assert_eq!(state.index.query_structured(&Filter::upload("upload_e1"), 10).unwrap().len(), 3);
    assert_eq!(state.index.query_structured(&Filter::upload("upload_e2"), 10).unwrap().len(), 3);
}

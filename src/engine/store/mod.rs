// Tahlil Engine — Workspace Store
//
// Durable record of every workspace: uploads, parsed rows, chat turns, and
// per-agent analysis results, in SQLite via rusqlite. The database is
// authoritative; the in-memory cache (store::cache) is a latency
// optimisation layered on top.
//
// Every write is one short transaction. All DDL is idempotent
// (CREATE TABLE IF NOT EXISTS) so opening an existing database migrates
// for free. WAL keeps concurrent readers cheap.

pub mod cache;

use crate::atoms::error::EngineResult;
use crate::atoms::types::*;
use chrono::{DateTime, Utc};
use log::info;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;

/// Fixed-width UTC timestamp format: lexicographic order equals
/// chronological order, which the chat-ordering invariant relies on.
const TS_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6fZ";

fn ts_to_string(ts: DateTime<Utc>) -> String {
    ts.format(TS_FORMAT).to_string()
}

fn ts_from_string(s: &str) -> DateTime<Utc> {
    // The fixed-width format above is valid RFC 3339.
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_default()
}

const STORE_SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS uploads (
        upload_id TEXT PRIMARY KEY,
        user_id TEXT NOT NULL,
        filename TEXT NOT NULL,
        document_type TEXT,
        status TEXT NOT NULL DEFAULT 'uploading',
        created_at TEXT NOT NULL,
        summary_metadata TEXT NOT NULL DEFAULT '{}'
    );
    CREATE INDEX IF NOT EXISTS idx_uploads_user ON uploads(user_id);

    CREATE TABLE IF NOT EXISTS transactions (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        upload_id TEXT NOT NULL,
        seq INTEGER NOT NULL,
        date TEXT NOT NULL,
        description TEXT NOT NULL DEFAULT '',
        amount TEXT NOT NULL,
        kind TEXT NOT NULL,
        balance TEXT,
        reference TEXT,
        category TEXT
    );
    CREATE INDEX IF NOT EXISTS idx_txn_upload ON transactions(upload_id, seq);

    CREATE TABLE IF NOT EXISTS statements (
        upload_id TEXT PRIMARY KEY,
        statement_json TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS chat_messages (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        upload_id TEXT NOT NULL,
        user_id TEXT NOT NULL,
        role TEXT NOT NULL,
        content TEXT NOT NULL DEFAULT '',
        agent_name TEXT,
        created_at TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_chat_upload ON chat_messages(upload_id, created_at);

    CREATE TABLE IF NOT EXISTS analysis_results (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        upload_id TEXT NOT NULL,
        user_id TEXT NOT NULL,
        agent_name TEXT NOT NULL,
        result TEXT NOT NULL,
        created_at TEXT NOT NULL,
        mode TEXT NOT NULL DEFAULT 'insights'
    );
    CREATE INDEX IF NOT EXISTS idx_analysis_upload ON analysis_results(upload_id, agent_name, id);
";

/// Thread-safe database wrapper.
pub struct WorkspaceStore {
    conn: Mutex<Connection>,
}

impl WorkspaceStore {
    /// Open (or create) the store and initialise tables.
    pub fn open(path: &Path) -> EngineResult<Self> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        info!("[store] opening workspace store at {:?}", path);
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;").ok();
        conn.execute_batch(STORE_SCHEMA)?;
        Ok(WorkspaceStore { conn: Mutex::new(conn) })
    }

    /// In-memory store for tests.
    pub fn open_in_memory() -> EngineResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(STORE_SCHEMA)?;
        Ok(WorkspaceStore { conn: Mutex::new(conn) })
    }

    // ── Uploads ────────────────────────────────────────────────────────────

    pub fn create_upload(&self, upload: &Upload) -> EngineResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO uploads (upload_id, user_id, filename, document_type, status, created_at, summary_metadata)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                upload.upload_id,
                upload.user_id,
                upload.filename,
                upload.document_type.map(|d| d.as_str()),
                upload.status.as_str(),
                ts_to_string(upload.created_at),
                serde_json::to_string(&upload.summary_metadata)?,
            ],
        )?;
        Ok(())
    }

    pub fn get_upload(&self, user_id: &str, upload_id: &str) -> EngineResult<Option<Upload>> {
        let conn = self.conn.lock();
        let upload = conn
            .query_row(
                "SELECT upload_id, user_id, filename, document_type, status, created_at, summary_metadata
                 FROM uploads WHERE upload_id = ?1 AND user_id = ?2",
                params![upload_id, user_id],
                upload_from_row,
            )
            .optional()?;
        Ok(upload)
    }

    pub fn list_uploads(&self, user_id: &str) -> EngineResult<Vec<Upload>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT upload_id, user_id, filename, document_type, status, created_at, summary_metadata
             FROM uploads WHERE user_id = ?1 ORDER BY created_at DESC",
        )?;
        let uploads = stmt
            .query_map(params![user_id], upload_from_row)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(uploads)
    }

    pub fn set_status(&self, upload_id: &str, status: UploadStatus) -> EngineResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE uploads SET status = ?2 WHERE upload_id = ?1",
            params![upload_id, status.as_str()],
        )?;
        Ok(())
    }

    pub fn set_document_type(&self, upload_id: &str, doc_type: DocumentType) -> EngineResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE uploads SET document_type = ?2 WHERE upload_id = ?1",
            params![upload_id, doc_type.as_str()],
        )?;
        Ok(())
    }

    pub fn set_summary_metadata(
        &self,
        upload_id: &str,
        summary: &serde_json::Map<String, serde_json::Value>,
    ) -> EngineResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE uploads SET summary_metadata = ?2 WHERE upload_id = ?1",
            params![upload_id, serde_json::to_string(summary)?],
        )?;
        Ok(())
    }

    // ── Parsed transactions ────────────────────────────────────────────────

    pub fn insert_transactions(&self, upload_id: &str, txns: &[Transaction]) -> EngineResult<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO transactions (upload_id, seq, date, description, amount, kind, balance, reference, category)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            )?;
            for (seq, t) in txns.iter().enumerate() {
                stmt.execute(params![
                    upload_id,
                    seq as i64,
                    t.date.format("%Y-%m-%d").to_string(),
                    t.description,
                    t.amount.to_string(),
                    t.kind.as_str(),
                    t.balance.map(|b| b.to_string()),
                    t.reference,
                    t.category,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// One page of parsed transactions plus the workspace total.
    pub fn get_transactions(
        &self,
        upload_id: &str,
        page: usize,
        limit: usize,
    ) -> EngineResult<(Vec<Transaction>, usize)> {
        let conn = self.conn.lock();
        let total: i64 = conn.query_row(
            "SELECT COUNT(*) FROM transactions WHERE upload_id = ?1",
            params![upload_id],
            |row| row.get(0),
        )?;

        let mut stmt = conn.prepare_cached(
            "SELECT date, description, amount, kind, balance, reference, category
             FROM transactions WHERE upload_id = ?1
             ORDER BY seq LIMIT ?2 OFFSET ?3",
        )?;
        let txns = stmt
            .query_map(params![upload_id, limit as i64, (page * limit) as i64], txn_from_row)?
            .filter_map(|r| r.ok())
            .collect();
        Ok((txns, total as usize))
    }

    // ── Parsed statements ──────────────────────────────────────────────────

    pub fn put_statement(&self, upload_id: &str, stmt: &FinancialStatement) -> EngineResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO statements (upload_id, statement_json) VALUES (?1, ?2)
             ON CONFLICT(upload_id) DO UPDATE SET statement_json = excluded.statement_json",
            params![upload_id, serde_json::to_string(stmt)?],
        )?;
        Ok(())
    }

    pub fn get_statement(&self, upload_id: &str) -> EngineResult<Option<FinancialStatement>> {
        let conn = self.conn.lock();
        let json: Option<String> = conn
            .query_row(
                "SELECT statement_json FROM statements WHERE upload_id = ?1",
                params![upload_id],
                |row| row.get(0),
            )
            .optional()?;
        match json {
            Some(j) => Ok(Some(serde_json::from_str(&j)?)),
            None => Ok(None),
        }
    }

    // ── Chat messages ──────────────────────────────────────────────────────

    /// Append one turn. Timestamps within an upload are strictly
    /// monotonic: a same-microsecond append is nudged past the previous
    /// message.
    pub fn append_chat_message(
        &self,
        upload_id: &str,
        user_id: &str,
        role: ChatRole,
        content: &str,
        agent_name: Option<&str>,
    ) -> EngineResult<ChatMessage> {
        let conn = self.conn.lock();

        let last: Option<String> = conn
            .query_row(
                "SELECT MAX(created_at) FROM chat_messages WHERE upload_id = ?1",
                params![upload_id],
                |row| row.get(0),
            )
            .optional()?
            .flatten();

        let mut now = Utc::now();
        if let Some(last) = last {
            let last_ts = ts_from_string(&last);
            if now <= last_ts {
                now = last_ts + chrono::Duration::microseconds(1);
            }
        }
        let now_str = ts_to_string(now);

        conn.execute(
            "INSERT INTO chat_messages (upload_id, user_id, role, content, agent_name, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![upload_id, user_id, role.as_str(), content, agent_name, now_str],
        )?;
        let id = conn.last_insert_rowid();

        Ok(ChatMessage {
            id,
            upload_id: upload_id.to_string(),
            user_id: user_id.to_string(),
            role,
            content: content.to_string(),
            agent_name: agent_name.map(str::to_string),
            created_at: now,
        })
    }

    /// Messages for an upload, oldest first. `before` paginates backwards
    /// by message id.
    pub fn chat_history(
        &self,
        upload_id: &str,
        limit: usize,
        before: Option<i64>,
    ) -> EngineResult<Vec<ChatMessage>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT id, upload_id, user_id, role, content, agent_name, created_at
             FROM chat_messages
             WHERE upload_id = ?1 AND (?2 IS NULL OR id < ?2)
             ORDER BY created_at DESC, id DESC
             LIMIT ?3",
        )?;
        let mut messages: Vec<ChatMessage> = stmt
            .query_map(params![upload_id, before, limit as i64], message_from_row)?
            .filter_map(|r| r.ok())
            .collect();
        messages.reverse();
        Ok(messages)
    }

    // ── Analysis results ───────────────────────────────────────────────────

    /// Append-only: prior rows are retained, readers take the latest.
    pub fn insert_analysis(&self, analysis: &StoredAnalysis) -> EngineResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO analysis_results (upload_id, user_id, agent_name, result, created_at, mode)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                analysis.upload_id,
                analysis.user_id,
                analysis.agent_name,
                serde_json::to_string(&analysis.result)?,
                ts_to_string(analysis.created_at),
                analysis.mode,
            ],
        )?;
        Ok(())
    }

    /// The latest result per agent for this upload.
    pub fn latest_analyses(&self, upload_id: &str) -> EngineResult<HashMap<String, AnalysisResult>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT agent_name, result FROM analysis_results
             WHERE upload_id = ?1
             ORDER BY id ASC",
        )?;
        let rows: Vec<(String, String)> = stmt
            .query_map(params![upload_id], |row| Ok((row.get(0)?, row.get(1)?)))?
            .filter_map(|r| r.ok())
            .collect();

        // Ascending scan: later rows overwrite, leaving the latest per agent.
        let mut latest = HashMap::new();
        for (agent, json) in rows {
            if let Ok(result) = serde_json::from_str(&json) {
                latest.insert(agent, result);
            }
        }
        Ok(latest)
    }

    pub fn has_analyses(&self, upload_id: &str) -> EngineResult<bool> {
        let conn = self.conn.lock();
        let n: i64 = conn.query_row(
            "SELECT COUNT(*) FROM analysis_results WHERE upload_id = ?1",
            params![upload_id],
            |row| row.get(0),
        )?;
        Ok(n > 0)
    }

    // ── Deletion ───────────────────────────────────────────────────────────

    /// Remove every row referencing the upload, the uploads row last.
    /// Idempotent: running against an already-deleted workspace is a no-op.
    pub fn delete_workspace_rows(&self, upload_id: &str) -> EngineResult<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM chat_messages WHERE upload_id = ?1", params![upload_id])?;
        tx.execute("DELETE FROM analysis_results WHERE upload_id = ?1", params![upload_id])?;
        tx.execute("DELETE FROM transactions WHERE upload_id = ?1", params![upload_id])?;
        tx.execute("DELETE FROM statements WHERE upload_id = ?1", params![upload_id])?;
        tx.execute("DELETE FROM uploads WHERE upload_id = ?1", params![upload_id])?;
        tx.commit()?;
        info!("[store] deleted workspace rows for {}", upload_id);
        Ok(())
    }
}

// ── Row mappers ────────────────────────────────────────────────────────────

fn upload_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Upload> {
    let doc_type: Option<String> = row.get(3)?;
    let status: String = row.get(4)?;
    let created_at: String = row.get(5)?;
    let summary: String = row.get(6)?;
    Ok(Upload {
        upload_id: row.get(0)?,
        user_id: row.get(1)?,
        filename: row.get(2)?,
        document_type: doc_type.as_deref().and_then(DocumentType::parse),
        status: UploadStatus::parse(&status).unwrap_or(UploadStatus::Failed),
        created_at: ts_from_string(&created_at),
        summary_metadata: serde_json::from_str(&summary).unwrap_or_default(),
    })
}

fn txn_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Transaction> {
    let date: String = row.get(0)?;
    let amount: String = row.get(2)?;
    let kind: String = row.get(3)?;
    let balance: Option<String> = row.get(4)?;
    Ok(Transaction {
        date: chrono::NaiveDate::parse_from_str(&date, "%Y-%m-%d").unwrap_or_default(),
        description: row.get(1)?,
        amount: Decimal::from_str(&amount).unwrap_or_default(),
        kind: match kind.as_str() {
            "debit" => TxnKind::Debit,
            "credit" => TxnKind::Credit,
            _ => TxnKind::Unknown,
        },
        balance: balance.and_then(|b| Decimal::from_str(&b).ok()),
        reference: row.get(5)?,
        category: row.get(6)?,
        metadata: serde_json::Map::new(),
    })
}

fn message_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ChatMessage> {
    let role: String = row.get(3)?;
    let created_at: String = row.get(6)?;
    Ok(ChatMessage {
        id: row.get(0)?,
        upload_id: row.get(1)?,
        user_id: row.get(2)?,
        role: if role == "assistant" { ChatRole::Assistant } else { ChatRole::User },
        content: row.get(4)?,
        agent_name: row.get(5)?,
        created_at: ts_from_string(&created_at),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Map;

    fn upload(id: &str, user: &str) -> Upload {
        Upload {
            upload_id: id.into(),
            user_id: user.into(),
            filename: "s.csv".into(),
            document_type: None,
            status: UploadStatus::Uploading,
            created_at: Utc::now(),
            summary_metadata: Map::new(),
        }
    }

    #[test]
    fn test_upload_lifecycle() {
        let store = WorkspaceStore::open_in_memory().unwrap();
        store.create_upload(&upload("up1", "u1")).unwrap();

        store.set_status("up1", UploadStatus::Processing).unwrap();
        store.set_document_type("up1", DocumentType::Transactions).unwrap();
        store.set_status("up1", UploadStatus::Completed).unwrap();

        let got = store.get_upload("u1", "up1").unwrap().unwrap();
        assert_eq!(got.status, UploadStatus::Completed);
        assert_eq!(got.document_type, Some(DocumentType::Transactions));

        // Scoped by user: another user cannot see it.
        assert!(store.get_upload("u2", "up1").unwrap().is_none());
    }

    #[test]
    fn test_transactions_round_trip_and_paging() {
        let store = WorkspaceStore::open_in_memory().unwrap();
        store.create_upload(&upload("up1", "u1")).unwrap();

        let txns: Vec<Transaction> = (0..5)
            .map(|i| Transaction {
                date: chrono::NaiveDate::from_ymd_opt(2025, 1, i + 1).unwrap(),
                description: format!("txn {}", i),
                amount: Decimal::from_str("10.50").unwrap(),
                kind: TxnKind::Debit,
                balance: None,
                reference: None,
                category: None,
                metadata: Map::new(),
            })
            .collect();
        store.insert_transactions("up1", &txns).unwrap();

        let (page, total) = store.get_transactions("up1", 0, 3).unwrap();
        assert_eq!(total, 5);
        assert_eq!(page.len(), 3);
        assert_eq!(page[0].description, "txn 0");
        assert_eq!(page[0].amount, Decimal::from_str("10.50").unwrap());

        let (page2, _) = store.get_transactions("up1", 1, 3).unwrap();
        assert_eq!(page2.len(), 2);
        assert_eq!(page2[0].description, "txn 3");
    }

    #[test]
    fn test_chat_ordering_is_strictly_monotonic() {
        let store = WorkspaceStore::open_in_memory().unwrap();
        store.create_upload(&upload("up1", "u1")).unwrap();

        let mut timestamps = Vec::new();
        for i in 0..10 {
            let m = store
                .append_chat_message("up1", "u1", ChatRole::User, &format!("q{}", i), None)
                .unwrap();
            timestamps.push(m.created_at);
        }
        for pair in timestamps.windows(2) {
            assert!(pair[0] < pair[1], "timestamps must be strictly increasing");
        }

        let history = store.chat_history("up1", 100, None).unwrap();
        assert_eq!(history.len(), 10);
        assert_eq!(history[0].content, "q0");
        assert_eq!(history[9].content, "q9");
    }

    #[test]
    fn test_latest_analysis_wins() {
        let store = WorkspaceStore::open_in_memory().unwrap();
        store.create_upload(&upload("up1", "u1")).unwrap();

        for (i, summary) in ["old", "new"].iter().enumerate() {
            store
                .insert_analysis(&StoredAnalysis {
                    upload_id: "up1".into(),
                    user_id: "u1".into(),
                    agent_name: "expense".into(),
                    result: AnalysisResult {
                        status: AnalysisStatus::Completed,
                        summary: summary.to_string(),
                        findings: Map::new(),
                    },
                    created_at: Utc::now() + chrono::Duration::seconds(i as i64),
                    mode: "insights".into(),
                })
                .unwrap();
        }

        let latest = store.latest_analyses("up1").unwrap();
        assert_eq!(latest.len(), 1);
        assert_eq!(latest["expense"].summary, "new");
        assert!(store.has_analyses("up1").unwrap());
    }

    #[test]
    fn test_delete_workspace_rows_is_idempotent_and_complete() {
        let store = WorkspaceStore::open_in_memory().unwrap();
        store.create_upload(&upload("up1", "u1")).unwrap();
        store.append_chat_message("up1", "u1", ChatRole::User, "hi", None).unwrap();
        store
            .insert_analysis(&StoredAnalysis {
                upload_id: "up1".into(),
                user_id: "u1".into(),
                agent_name: "expense".into(),
                result: AnalysisResult::failed("x"),
                created_at: Utc::now(),
                mode: "insights".into(),
            })
            .unwrap();

        store.delete_workspace_rows("up1").unwrap();
        assert!(store.get_upload("u1", "up1").unwrap().is_none());
        assert!(store.chat_history("up1", 10, None).unwrap().is_empty());
        assert!(store.latest_analyses("up1").unwrap().is_empty());

        // Second delete is a no-op, not an error.
        store.delete_workspace_rows("up1").unwrap();
    }

    #[test]
    fn test_statement_round_trip() {
        let store = WorkspaceStore::open_in_memory().unwrap();
        store.create_upload(&upload("up1", "u1")).unwrap();

        let mut stmt = FinancialStatement::default();
        stmt.company_info.name = Some("Test Co".into());
        stmt.income_statement.revenue =
            LineItem::new(Some(Decimal::from_str("1000").unwrap()), None);
        store.put_statement("up1", &stmt).unwrap();

        let got = store.get_statement("up1").unwrap().unwrap();
        assert_eq!(got, stmt);
        assert!(store.get_statement("up2").unwrap().is_none());
    }
}

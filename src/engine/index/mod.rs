// Tahlil Engine — Vector Index
//
// Semantic + structured retrieval over the workspace evidence collection.
// Embeddings live as little-endian f32 BLOBs next to their metadata columns
// in a dedicated SQLite file; semantic queries scan the structured-filtered
// candidate set and rank by cosine similarity in process. At workspace
// scale (thousands of documents, always filtered by upload_id) the scan is
// far below a millisecond and needs no ANN structure.
//
// All statements are idempotent (CREATE IF NOT EXISTS); WAL keeps
// concurrent reads cheap while ingestion batches writes.

pub mod filter;
pub mod retriever;

use crate::atoms::constants::INDEX_INSERT_BATCH;
use crate::atoms::error::EngineResult;
use crate::atoms::types::{DocMeta, VectorDoc};
use crate::engine::embedding::{bytes_to_f32_vec, cosine_similarity, f32_vec_to_bytes};
use filter::Filter;
use log::info;
use parking_lot::Mutex;
use rusqlite::{params_from_iter, Connection};
use std::path::Path;

const INDEX_SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS vector_docs (
        id TEXT PRIMARY KEY,
        upload_id TEXT NOT NULL,
        user_id TEXT NOT NULL,
        kind TEXT NOT NULL DEFAULT '',
        date_ts INTEGER,
        amount REAL,
        category TEXT,
        tags TEXT NOT NULL DEFAULT '[]',
        text TEXT NOT NULL,
        embedding BLOB
    );

    CREATE INDEX IF NOT EXISTS idx_docs_upload ON vector_docs(upload_id);
    CREATE INDEX IF NOT EXISTS idx_docs_upload_kind ON vector_docs(upload_id, kind);
    CREATE INDEX IF NOT EXISTS idx_docs_date ON vector_docs(date_ts);
";

/// Thread-safe handle over the vector collection.
pub struct VectorIndex {
    conn: Mutex<Connection>,
}

impl VectorIndex {
    /// Open (or create) the collection at `path` and initialise the schema.
    pub fn open(path: &Path) -> EngineResult<Self> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        info!("[index] opening vector collection at {:?}", path);
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;").ok();
        conn.execute_batch(INDEX_SCHEMA)?;
        Ok(VectorIndex { conn: Mutex::new(conn) })
    }

    /// In-memory collection for tests.
    pub fn open_in_memory() -> EngineResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(INDEX_SCHEMA)?;
        Ok(VectorIndex { conn: Mutex::new(conn) })
    }

    /// Insert documents, upserting by id. Batched into one transaction per
    /// INDEX_INSERT_BATCH rows to keep lock scope small.
    pub fn insert(&self, docs: &[VectorDoc]) -> EngineResult<usize> {
        let mut conn = self.conn.lock();
        let mut written = 0;

        for batch in docs.chunks(INDEX_INSERT_BATCH) {
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare_cached(
                    "INSERT INTO vector_docs
                        (id, upload_id, user_id, kind, date_ts, amount, category, tags, text, embedding)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                     ON CONFLICT(id) DO UPDATE SET
                        upload_id = excluded.upload_id,
                        user_id = excluded.user_id,
                        kind = excluded.kind,
                        date_ts = excluded.date_ts,
                        amount = excluded.amount,
                        category = excluded.category,
                        tags = excluded.tags,
                        text = excluded.text,
                        embedding = excluded.embedding",
                )?;
                for doc in batch {
                    let tags = serde_json::to_string(&doc.meta.tags)?;
                    let embedding = if doc.embedding.is_empty() {
                        None
                    } else {
                        Some(f32_vec_to_bytes(&doc.embedding))
                    };
                    stmt.execute(rusqlite::params![
                        doc.id,
                        doc.meta.upload_id,
                        doc.meta.user_id,
                        doc.meta.kind,
                        doc.meta.date_ts,
                        doc.meta.amount,
                        doc.meta.category,
                        tags,
                        doc.text,
                        embedding,
                    ])?;
                    written += 1;
                }
            }
            tx.commit()?;
        }

        Ok(written)
    }

    /// Semantic retrieval: scan the filtered candidate set, rank by cosine
    /// similarity against `query_embedding`, normalise scores to [0,1].
    pub fn query_semantic(
        &self,
        query_embedding: &[f32],
        k: usize,
        filter: &Filter,
    ) -> EngineResult<Vec<(VectorDoc, f64)>> {
        let conn = self.conn.lock();
        let (where_sql, params) = filter.to_sql();

        let sql = format!(
            "SELECT id, upload_id, user_id, kind, date_ts, amount, category, tags, text, embedding
             FROM vector_docs
             WHERE {} AND embedding IS NOT NULL",
            where_sql
        );
        let mut stmt = conn.prepare_cached(&sql)?;

        let mut scored: Vec<(VectorDoc, f64)> = stmt
            .query_map(params_from_iter(params), doc_from_row)?
            .filter_map(|r| r.ok())
            .map(|doc| {
                let sim = cosine_similarity(&doc.embedding, query_embedding);
                // Cosine lands in [-1,1]; surface scores in [0,1].
                (doc, ((sim + 1.0) / 2.0).clamp(0.0, 1.0))
            })
            .collect();

        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(k);
        Ok(scored)
    }

    /// Pure metadata retrieval, newest first.
    pub fn query_structured(&self, filter: &Filter, limit: usize) -> EngineResult<Vec<VectorDoc>> {
        let conn = self.conn.lock();
        let (where_sql, params) = filter.to_sql();

        let sql = format!(
            "SELECT id, upload_id, user_id, kind, date_ts, amount, category, tags, text, embedding
             FROM vector_docs
             WHERE {}
             ORDER BY date_ts DESC
             LIMIT {}",
            where_sql, limit as i64
        );
        let mut stmt = conn.prepare_cached(&sql)?;

        let docs = stmt
            .query_map(params_from_iter(params), doc_from_row)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(docs)
    }

    /// Delete every document matching the filter. Returns the row count.
    pub fn delete(&self, filter: &Filter) -> EngineResult<usize> {
        let conn = self.conn.lock();
        let (where_sql, params) = filter.to_sql();
        let sql = format!("DELETE FROM vector_docs WHERE {}", where_sql);
        let n = conn.execute(&sql, params_from_iter(params))?;
        Ok(n)
    }
}

fn doc_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<VectorDoc> {
    let tags_json: String = row.get(7)?;
    let embedding: Option<Vec<u8>> = row.get(9)?;
    Ok(VectorDoc {
        id: row.get(0)?,
        text: row.get(8)?,
        embedding: embedding.map(|b| bytes_to_f32_vec(&b)).unwrap_or_default(),
        meta: DocMeta {
            upload_id: row.get(1)?,
            user_id: row.get(2)?,
            kind: row.get(3)?,
            date_ts: row.get(4)?,
            amount: row.get(5)?,
            category: row.get(6)?,
            tags: serde_json::from_str(&tags_json).unwrap_or_default(),
        },
    })
}

#[cfg(test)]
mod tests {
    use super::filter::Field;
    use super::*;

    fn doc(id: &str, upload: &str, kind: &str, date_ts: i64, amount: f64, emb: Vec<f32>) -> VectorDoc {
        VectorDoc {
            id: id.into(),
            text: format!("doc {}", id),
            embedding: emb,
            meta: DocMeta {
                upload_id: upload.into(),
                user_id: "u".into(),
                kind: kind.into(),
                date_ts: Some(date_ts),
                amount: Some(amount),
                category: None,
                tags: vec![],
            },
        }
    }

    #[test]
    fn test_insert_is_idempotent_by_id() {
        let index = VectorIndex::open_in_memory().unwrap();
        let d = doc("a", "up1", "debit", 10, 5.0, vec![1.0, 0.0]);
        index.insert(&[d.clone()]).unwrap();
        index.insert(&[d]).unwrap();
        let all = index.query_structured(&Filter::upload("up1"), 10).unwrap();
        assert_eq!(all.len(), 1);
    }

    #[test]
    fn test_structured_query_orders_by_date_desc() {
        let index = VectorIndex::open_in_memory().unwrap();
        index
            .insert(&[
                doc("a", "up1", "debit", 10, 1.0, vec![1.0]),
                doc("b", "up1", "debit", 30, 2.0, vec![1.0]),
                doc("c", "up1", "debit", 20, 3.0, vec![1.0]),
            ])
            .unwrap();
        let all = index.query_structured(&Filter::upload("up1"), 10).unwrap();
        let ids: Vec<&str> = all.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "c", "a"]);
    }

    #[test]
    fn test_semantic_ranks_by_similarity_and_normalises() {
        let index = VectorIndex::open_in_memory().unwrap();
        index
            .insert(&[
                doc("close", "up1", "debit", 1, 1.0, vec![1.0, 0.0]),
                doc("far", "up1", "debit", 2, 1.0, vec![-1.0, 0.0]),
            ])
            .unwrap();
        let hits = index
            .query_semantic(&[1.0, 0.0], 10, &Filter::upload("up1"))
            .unwrap();
        assert_eq!(hits[0].0.id, "close");
        assert!((hits[0].1 - 1.0).abs() < 1e-9);
        assert!(hits[1].1.abs() < 1e-9);
        for (_, score) in &hits {
            assert!((0.0..=1.0).contains(score));
        }
    }

    #[test]
    fn test_upload_filter_partitions_results() {
        let index = VectorIndex::open_in_memory().unwrap();
        index
            .insert(&[
                doc("a", "up1", "debit", 1, 500.0, vec![1.0, 0.0]),
                doc("b", "up2", "debit", 2, 50.0, vec![1.0, 0.0]),
            ])
            .unwrap();
        let hits = index
            .query_semantic(&[1.0, 0.0], 10, &Filter::upload("up1"))
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].0.meta.upload_id, "up1");
    }

    #[test]
    fn test_delete_by_upload() {
        let index = VectorIndex::open_in_memory().unwrap();
        index
            .insert(&[
                doc("a", "up1", "debit", 1, 1.0, vec![1.0]),
                doc("b", "up2", "credit", 2, 2.0, vec![1.0]),
            ])
            .unwrap();
        let n = index.delete(&Filter::upload("up1")).unwrap();
        assert_eq!(n, 1);
        assert!(index.query_structured(&Filter::upload("up1"), 1).unwrap().is_empty());
        assert_eq!(index.query_structured(&Filter::upload("up2"), 1).unwrap().len(), 1);
    }

    #[test]
    fn test_amount_range_filter() {
        let index = VectorIndex::open_in_memory().unwrap();
        index
            .insert(&[
                doc("small", "up1", "debit", 1, 10.0, vec![1.0]),
                doc("large", "up1", "debit", 2, 900.0, vec![1.0]),
            ])
            .unwrap();
        let f = Filter::upload("up1").gte(Field::Amount, 100.0);
        let hits = index.query_structured(&f, 10).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, "large");
    }
}

// Tahlil Engine — Evidence Retrievers
//
// `Retriever` pairs the embedding client with the vector index so callers
// ask in text, not vectors. `WorkspaceRetriever` is the isolation boundary:
// it is the only retrieval handle agents ever receive, and it rewrites
// every filter so the workspace's upload_id clause is present and
// authoritative. Agents cannot bypass it.

use crate::atoms::error::EngineResult;
use crate::atoms::types::VectorDoc;
use crate::engine::embedding::EmbeddingClient;
use crate::engine::index::filter::{Field, Filter};
use crate::engine::index::VectorIndex;
use std::sync::Arc;

pub struct Retriever {
    index: Arc<VectorIndex>,
    embedder: Arc<EmbeddingClient>,
}

impl Retriever {
    pub fn new(index: Arc<VectorIndex>, embedder: Arc<EmbeddingClient>) -> Self {
        Retriever { index, embedder }
    }

    /// Query by text: embed, then rank the filtered candidates.
    pub async fn semantic(
        &self,
        text: &str,
        k: usize,
        filter: &Filter,
    ) -> EngineResult<Vec<(VectorDoc, f64)>> {
        let embedding = self.embedder.embed(text).await?;
        self.index.query_semantic(&embedding, k, filter)
    }

    pub fn structured(&self, filter: &Filter, limit: usize) -> EngineResult<Vec<VectorDoc>> {
        self.index.query_structured(filter, limit)
    }
}

/// Retrieval handle bound to one workspace. Every query, semantic or
/// structured, carries `upload_id = <workspace>` and
/// `user_id = <owner>`, with any caller-supplied clause on those fields
/// discarded first.
#[derive(Clone)]
pub struct WorkspaceRetriever {
    inner: Arc<Retriever>,
    upload_id: String,
    user_id: String,
}

impl WorkspaceRetriever {
    pub fn new(inner: Arc<Retriever>, upload_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        WorkspaceRetriever { inner, upload_id: upload_id.into(), user_id: user_id.into() }
    }

    pub fn upload_id(&self) -> &str {
        &self.upload_id
    }

    /// Rewrite a domain filter into its workspace-scoped form.
    fn scoped(&self, filter: Filter) -> Filter {
        filter
            .without(Field::UploadId)
            .without(Field::UserId)
            .eq(Field::UploadId, self.upload_id.clone())
            .eq(Field::UserId, self.user_id.clone())
    }

    pub async fn semantic(
        &self,
        text: &str,
        k: usize,
        filter: Filter,
    ) -> EngineResult<Vec<(VectorDoc, f64)>> {
        self.inner.semantic(text, k, &self.scoped(filter)).await
    }

    pub fn structured(&self, filter: Filter, limit: usize) -> EngineResult<Vec<VectorDoc>> {
        self.inner.structured(&self.scoped(filter), limit)
    }
}

use std::sync::Arc;

use crate::embeddings::Embedder;
use crate::error::{RagError, Result};
use crate::models::{Candidate, Filters};
use crate::store::VectorStore;

/// Embeds the query and delegates ranking to the similarity store.
#[derive(Clone)]
pub struct Retriever {
    embedder: Arc<dyn Embedder>,
    store: Arc<dyn VectorStore>,
}

impl Retriever {
    pub fn new(embedder: Arc<dyn Embedder>, store: Arc<dyn VectorStore>) -> Self {
        Self { embedder, store }
    }

    pub fn embedder(&self) -> &Arc<dyn Embedder> {
        &self.embedder
    }

    pub fn store(&self) -> &Arc<dyn VectorStore> {
        &self.store
    }

    pub async fn retrieve(
        &self,
        query: &str,
        top_k: usize,
        filters: &Filters,
    ) -> Result<Vec<Candidate>> {
        let query_vector = self
            .embedder
            .embed_query(query)
            .await
            .map_err(RagError::Embedding)?;

        let candidates = self.store.search(&query_vector, top_k, filters);
        tracing::debug!(
            "Retrieved {} candidates (top_k={}, filters={})",
            candidates.len(),
            top_k,
            filters.len()
        );
        Ok(candidates)
    }
}

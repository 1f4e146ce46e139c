use std::cmp::Ordering;
use std::sync::Arc;

use super::similarity::cosine_similarity;
use super::store::MemoryStore;
use super::types::{SemanticSearchResult, TextEmbedding};
use crate::error::{MemoryError, Result};
use crate::types::Message;

/// Threshold used when the caller does not supply one.
pub const DEFAULT_SIMILARITY_THRESHOLD: f32 = 0.7;

/// Similarity-ranked retrieval over every resident embedding.
///
/// A linear scan: each query is compared against the whole index. An
/// approximate index could replace the scan behind `search` without
/// changing callers.
#[derive(Clone)]
pub struct SemanticSearch {
    store: Arc<MemoryStore>,
    default_threshold: f32,
}

impl SemanticSearch {
    pub fn new(store: Arc<MemoryStore>) -> Self {
        Self::with_threshold(store, DEFAULT_SIMILARITY_THRESHOLD)
    }

    pub fn with_threshold(store: Arc<MemoryStore>, default_threshold: f32) -> Self {
        Self {
            store,
            default_threshold,
        }
    }

    pub fn default_threshold(&self) -> f32 {
        self.default_threshold
    }

    /// Rank embeddings by cosine similarity to `query`.
    ///
    /// Results are at or above the effective threshold, sorted by similarity
    /// descending with the newest embedding first on equal scores, and capped
    /// at `limit`. No matches is an empty list, not an error.
    pub async fn search(
        &self,
        query: &str,
        limit: usize,
        min_similarity: Option<f32>,
    ) -> Result<Vec<SemanticSearchResult>> {
        let threshold = min_similarity.unwrap_or(self.default_threshold);
        if limit == 0 {
            return Ok(Vec::new());
        }

        let query_vector = self
            .store
            .embedder()
            .embed(query)
            .await
            .map_err(|e| MemoryError::EmbeddingGenerationFailed(e.to_string()))?;

        let state = self.store.read_state().await;
        let mut scored: Vec<(&TextEmbedding, f32)> = state
            .embeddings
            .values()
            .filter(|e| e.vector.len() == query_vector.len())
            .map(|e| (e, cosine_similarity(&query_vector, &e.vector)))
            .filter(|(_, similarity)| *similarity >= threshold)
            .collect();

        scored.sort_by(|a, b| rank(a, b));
        scored.truncate(limit);

        Ok(scored
            .into_iter()
            .map(|(embedding, similarity)| SemanticSearchResult {
                embedding_id: embedding.id.clone(),
                text: embedding.text.clone(),
                similarity,
                kind: embedding.kind.clone(),
            })
            .collect())
    }

    /// Messages most relevant to `query` across all conversations, in rank
    /// order. Hits that are not stored messages (user facts) are skipped.
    pub async fn relevant_context(&self, query: &str, max_messages: usize) -> Result<Vec<Message>> {
        let results = self.search(query, max_messages, None).await?;
        let ids: Vec<String> = results.into_iter().map(|r| r.embedding_id).collect();
        Ok(self.store.messages_for_embeddings(&ids).await)
    }
}

/// Similarity descending, then newest first, then id for a total order.
fn rank(a: &(&TextEmbedding, f32), b: &(&TextEmbedding, f32)) -> Ordering {
    b.1.total_cmp(&a.1)
        .then_with(|| b.0.created_at.cmp(&a.0.created_at))
        .then_with(|| a.0.id.cmp(&b.0.id))
}

//! Query-time retrieval: embed the query, search the index, filter by score.
//!
//! The retriever never treats "nothing relevant" as a failure. An empty
//! index, a query that is blank after normalisation, no hit above the
//! minimum score, or a search filter the index rejects all produce an empty
//! [`RetrievalResult`]. Embedding backend and storage errors propagate so
//! the answer orchestrator can decide between retrying and surfacing them.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::embedding::Embedder;
use crate::error::{RagError, Result};
use crate::models::RetrievalResult;
use crate::store::{SearchFilters, VectorIndex};

/// Normalise a user query for embedding: trim and lower-case.
pub fn normalize_query(query: &str) -> String {
    query.trim().to_lowercase()
}

/// Turns a query into a ranked set of chunks via an [`Embedder`] and a [`VectorIndex`].
#[derive(Clone)]
pub struct Retriever {
    embedder: Arc<dyn Embedder>,
    index: Arc<dyn VectorIndex>,
    min_score: f32,
}

impl Retriever {
    pub fn new(embedder: Arc<dyn Embedder>, index: Arc<dyn VectorIndex>) -> Self {
        Self {
            embedder,
            index,
            min_score: f32::NEG_INFINITY,
        }
    }

    /// Drop hits scoring below `min_score`.
    pub fn with_min_score(mut self, min_score: f32) -> Self {
        self.min_score = min_score;
        self
    }

    /// Retrieve up to `top_k` chunks from `collection`, most relevant first.
    ///
    /// # Errors
    ///
    /// Embedding backend errors and index failures other than
    /// [`RagError::InvalidFilter`] are returned to the caller.
    pub async fn retrieve(
        &self,
        collection: &str,
        query: &str,
        top_k: usize,
        filters: &SearchFilters,
    ) -> Result<RetrievalResult> {
        let normalized = normalize_query(query);
        if normalized.is_empty() || top_k == 0 {
            return Ok(RetrievalResult::empty());
        }
        if let Err(e) = filters.validate() {
            warn!(error = %e, "ignoring search with invalid filter");
            return Ok(RetrievalResult::empty());
        }

        let query_vec = self.embedder.embed(&normalized).await?;

        let hits = match self.index.search(collection, &query_vec, top_k, filters).await {
            Ok(hits) => hits,
            Err(RagError::InvalidFilter(msg)) => {
                warn!(collection, error = %msg, "index rejected search filter");
                return Ok(RetrievalResult::empty());
            }
            Err(e) => return Err(e),
        };

        let found = hits.len();
        let hits: Vec<_> = hits
            .into_iter()
            .filter(|h| h.score >= self.min_score)
            .collect();
        debug!(
            collection,
            found,
            kept = hits.len(),
            min_score = self.min_score,
            "retrieval complete"
        );
        Ok(RetrievalResult { hits })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::HashingEmbedder;
    use crate::models::{Document, Embedding, IndexEntry};
    use crate::segment::segment;
    use crate::store::memory::InMemoryIndex;

    async fn index_docs(embedder: &HashingEmbedder, index: &InMemoryIndex, docs: &[Document]) {
        for doc in docs {
            let entries: Vec<IndexEntry> = segment(doc, 50, 10)
                .unwrap()
                .into_iter()
                .map(|chunk| IndexEntry {
                    embedding: Embedding::new(embedder.embed_sync(&chunk.text), embedder.model_name()),
                    chunk,
                })
                .collect();
            index.upsert("catalog", &entries).await.unwrap();
        }
    }

    fn retriever() -> (Arc<HashingEmbedder>, Arc<InMemoryIndex>, Retriever) {
        let embedder = Arc::new(HashingEmbedder::new(256));
        let index = Arc::new(InMemoryIndex::new());
        let r = Retriever::new(embedder.clone(), index.clone());
        (embedder, index, r)
    }

    #[tokio::test]
    async fn test_empty_index_yields_empty_result() {
        let (_, _, r) = retriever();
        let result = r
            .retrieve("catalog", "anything", 3, &SearchFilters::none())
            .await
            .unwrap();
        assert!(result.is_empty());
    }

    #[tokio::test]
    async fn test_prerequisite_query_ranks_course_first() {
        let (embedder, index, r) = retriever();
        index_docs(
            &embedder,
            &index,
            &[
                Document::new("art210", "t", "Baroque painting seminar, studio fee applies"),
                Document::new("cs101", "t", "Intro to Systems — prereq: Math 101"),
                Document::new("bio120", "t", "Cell biology lab with weekly field trips"),
            ],
        )
        .await;
        let result = r
            .retrieve(
                "catalog",
                "What is the prerequisite for Intro to Systems?",
                3,
                &SearchFilters::none(),
            )
            .await
            .unwrap();
        let top = result.top().unwrap();
        assert_eq!(top.chunk.document_id, "cs101");
        assert!(top.chunk.text.contains("prereq: Math 101"));
    }

    #[tokio::test]
    async fn test_query_is_case_insensitive() {
        let (embedder, index, r) = retriever();
        index_docs(&embedder, &index, &[Document::new("cs101", "t", "Intro to Systems")]).await;
        let a = r
            .retrieve("catalog", "INTRO TO SYSTEMS", 3, &SearchFilters::none())
            .await
            .unwrap();
        let b = r
            .retrieve("catalog", "  intro to systems ", 3, &SearchFilters::none())
            .await
            .unwrap();
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn test_min_score_filters_everything() {
        let (embedder, index, r) = retriever();
        index_docs(&embedder, &index, &[Document::new("cs101", "t", "Intro to Systems")]).await;
        let r = r.with_min_score(1.5);
        let result = r
            .retrieve("catalog", "intro to systems", 3, &SearchFilters::none())
            .await
            .unwrap();
        assert!(result.is_empty());
    }

    #[tokio::test]
    async fn test_invalid_filter_degrades_to_empty() {
        let (embedder, index, r) = retriever();
        index_docs(&embedder, &index, &[Document::new("cs101", "t", "Intro to Systems")]).await;
        let filters = SearchFilters {
            category: Some(String::new()),
            ..Default::default()
        };
        let result = r
            .retrieve("catalog", "intro", 3, &filters)
            .await
            .unwrap();
        assert!(result.is_empty());
    }

    #[tokio::test]
    async fn test_blank_query_and_zero_top_k() {
        let (embedder, index, r) = retriever();
        index_docs(&embedder, &index, &[Document::new("cs101", "t", "Intro to Systems")]).await;
        assert!(r
            .retrieve("catalog", "   ", 3, &SearchFilters::none())
            .await
            .unwrap()
            .is_empty());
        assert!(r
            .retrieve("catalog", "intro", 0, &SearchFilters::none())
            .await
            .unwrap()
            .is_empty());
    }
}

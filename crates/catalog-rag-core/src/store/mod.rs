//! Vector index abstraction.
//!
//! The [`VectorIndex`] trait defines every storage operation the build and
//! query pipelines need, enabling pluggable backends (SQLite in the app
//! crate, [`memory::InMemoryIndex`] for tests and ephemeral catalogs).
//!
//! Every operation takes an explicit collection name; there is no
//! process-wide default collection. Implementations must be `Send + Sync`
//! and must make each entry visible atomically: a concurrent search sees an
//! entry either entirely before or entirely after an upsert, never half
//! written.

pub mod memory;

use std::collections::BTreeSet;

use async_trait::async_trait;
use serde::Serialize;

use crate::error::{RagError, Result};
use crate::models::{Chunk, ChunkKind, IndexEntry, ScoredChunk};

/// Optional restrictions applied during [`VectorIndex::search`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SearchFilters {
    /// Only chunks of this document.
    pub document_id: Option<String>,
    /// Only chunks whose `category` metadata equals this value.
    pub category: Option<String>,
    /// Only chunks of this structural kind.
    pub kind: Option<ChunkKind>,
}

impl SearchFilters {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.document_id.is_none() && self.category.is_none() && self.kind.is_none()
    }

    /// Reject filters that can never be satisfied meaningfully.
    ///
    /// # Errors
    ///
    /// Returns [`RagError::InvalidFilter`] for blank string filters.
    pub fn validate(&self) -> Result<()> {
        if matches!(&self.document_id, Some(d) if d.trim().is_empty()) {
            return Err(RagError::InvalidFilter("document_id filter is blank".to_string()));
        }
        if matches!(&self.category, Some(c) if c.trim().is_empty()) {
            return Err(RagError::InvalidFilter("category filter is blank".to_string()));
        }
        Ok(())
    }

    /// Whether a chunk passes every set filter.
    pub fn matches(&self, chunk: &Chunk) -> bool {
        if let Some(doc) = &self.document_id {
            if &chunk.document_id != doc {
                return false;
            }
        }
        if let Some(cat) = &self.category {
            if chunk.category() != Some(cat.as_str()) {
                return false;
            }
        }
        if let Some(kind) = self.kind {
            if chunk.kind != kind {
                return false;
            }
        }
        true
    }
}

/// Summary counts for a collection.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CollectionStats {
    pub documents: usize,
    pub chunks: usize,
    /// Distinct embedding models present, sorted.
    pub models: Vec<String>,
}

impl CollectionStats {
    /// Compute stats from a full entry listing.
    pub fn from_entries(entries: &[IndexEntry]) -> Self {
        let documents: BTreeSet<&str> = entries.iter().map(|e| e.chunk.document_id.as_str()).collect();
        let models: BTreeSet<&str> = entries.iter().map(|e| e.embedding.model.as_str()).collect();
        Self {
            documents: documents.len(),
            chunks: entries.len(),
            models: models.into_iter().map(str::to_string).collect(),
        }
    }
}

/// Durable (or ephemeral) store of chunk embeddings with similarity search.
///
/// # Operations
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`upsert`](VectorIndex::upsert) | Insert or replace entries by chunk id |
/// | [`search`](VectorIndex::search) | Cosine-similarity nearest neighbours |
/// | [`delete`](VectorIndex::delete) | Remove every chunk of a document |
/// | [`replace_document`](VectorIndex::replace_document) | Atomically swap a document's chunks |
/// | [`document_entries`](VectorIndex::document_entries) | Stored entries of one document (embedding cache) |
/// | [`entries`](VectorIndex::entries) | Every entry in insertion order (export) |
/// | [`stats`](VectorIndex::stats) | Document / chunk / model counts |
#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Insert entries, replacing any existing entry with the same chunk id.
    ///
    /// A replaced entry keeps its original insertion position.
    async fn upsert(&self, collection: &str, entries: &[IndexEntry]) -> Result<()>;

    /// Return up to `top_k` chunks ordered by descending cosine similarity.
    ///
    /// Ties keep insertion order. An empty or missing collection yields an
    /// empty result.
    async fn search(
        &self,
        collection: &str,
        query_vec: &[f32],
        top_k: usize,
        filters: &SearchFilters,
    ) -> Result<Vec<ScoredChunk>>;

    /// Remove all chunks belonging to `document_id`, returning how many were removed.
    async fn delete(&self, collection: &str, document_id: &str) -> Result<u64>;

    /// Replace every chunk of a document with `entries`.
    ///
    /// The default implementation deletes then upserts; backends with
    /// transactions should override it to make the swap atomic.
    async fn replace_document(
        &self,
        collection: &str,
        document_id: &str,
        entries: &[IndexEntry],
    ) -> Result<()> {
        self.delete(collection, document_id).await?;
        self.upsert(collection, entries).await
    }

    /// Stored entries of one document, in chunk order.
    async fn document_entries(&self, collection: &str, document_id: &str) -> Result<Vec<IndexEntry>>;

    /// Every entry of a collection, in insertion order.
    async fn entries(&self, collection: &str) -> Result<Vec<IndexEntry>>;

    /// Summary counts for a collection.
    async fn stats(&self, collection: &str) -> Result<CollectionStats> {
        let entries = self.entries(collection).await?;
        Ok(CollectionStats::from_entries(&entries))
    }
}

/// Sort candidates by descending score and keep the first `top_k`.
///
/// Candidates must arrive in insertion order; the sort is stable, so tied
/// scores keep that order. NaN scores compare equal.
pub fn rank(mut candidates: Vec<ScoredChunk>, top_k: usize) -> Vec<ScoredChunk> {
    candidates.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    candidates.truncate(top_k);
    candidates
}

/// Check that every entry carries a vector of the same, non-zero dimension.
///
/// # Errors
///
/// Returns [`RagError::Config`] if an entry's dimension differs from
/// `expected` (or from the first entry when `expected` is `None`).
pub fn check_entry_dims(backend: &str, expected: Option<usize>, entries: &[IndexEntry]) -> Result<()> {
    let mut dims = expected;
    for entry in entries {
        let d = entry.embedding.dims();
        if d == 0 {
            return Err(RagError::index(
                backend,
                format!("chunk '{}' has an empty embedding", entry.chunk.id),
            ));
        }
        match dims {
            Some(expected) if expected != d => {
                return Err(RagError::Config(format!(
                    "chunk '{}' has {} dimensions but the collection holds {}-dimensional vectors; \
                     rebuild the collection to change embedding models",
                    entry.chunk.id, d, expected
                )));
            }
            Some(_) => {}
            None => dims = Some(d),
        }
    }
    Ok(())
}

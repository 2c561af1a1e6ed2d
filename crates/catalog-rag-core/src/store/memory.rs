//! In-memory [`VectorIndex`] implementation for tests and ephemeral catalogs.
//!
//! Entries live behind a single `std::sync::RwLock`, so an upsert batch is
//! applied under one write guard and searches always observe whole entries.
//! Vector search is brute-force cosine similarity over the collection.

use std::collections::{BTreeMap, HashMap};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;

use crate::embedding::cosine_similarity;
use crate::error::{RagError, Result};
use crate::models::{IndexEntry, ScoredChunk};

use super::{check_entry_dims, rank, SearchFilters, VectorIndex};

const BACKEND: &str = "memory";

#[derive(Default)]
struct Collection {
    /// Insertion sequence → entry. Iteration order is insertion order.
    entries: BTreeMap<u64, IndexEntry>,
    /// Chunk id → insertion sequence.
    positions: HashMap<String, u64>,
    next_seq: u64,
    dims: Option<usize>,
}

impl Collection {
    fn put(&mut self, entry: IndexEntry) {
        let seq = match self.positions.get(&entry.chunk.id) {
            Some(seq) => *seq,
            None => {
                let seq = self.next_seq;
                self.next_seq += 1;
                self.positions.insert(entry.chunk.id.clone(), seq);
                seq
            }
        };
        self.dims.get_or_insert(entry.embedding.dims());
        self.entries.insert(seq, entry);
    }

    fn remove_document(&mut self, document_id: &str) -> u64 {
        let doomed: Vec<u64> = self
            .entries
            .iter()
            .filter(|(_, e)| e.chunk.document_id == document_id)
            .map(|(seq, _)| *seq)
            .collect();
        for seq in &doomed {
            if let Some(entry) = self.entries.remove(seq) {
                self.positions.remove(&entry.chunk.id);
            }
        }
        if self.entries.is_empty() {
            self.dims = None;
        }
        doomed.len() as u64
    }
}

/// In-memory vector index keyed by collection name.
#[derive(Default)]
pub struct InMemoryIndex {
    collections: RwLock<HashMap<String, Collection>>,
}

impl InMemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, HashMap<String, Collection>>> {
        self.collections
            .read()
            .map_err(|_| RagError::index(BACKEND, "lock poisoned"))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, HashMap<String, Collection>>> {
        self.collections
            .write()
            .map_err(|_| RagError::index(BACKEND, "lock poisoned"))
    }
}

#[async_trait]
impl VectorIndex for InMemoryIndex {
    async fn upsert(&self, collection: &str, entries: &[IndexEntry]) -> Result<()> {
        let mut guard = self.write()?;
        let coll = guard.entry(collection.to_string()).or_default();
        check_entry_dims(BACKEND, coll.dims, entries)?;
        for entry in entries {
            coll.put(entry.clone());
        }
        Ok(())
    }

    async fn search(
        &self,
        collection: &str,
        query_vec: &[f32],
        top_k: usize,
        filters: &SearchFilters,
    ) -> Result<Vec<ScoredChunk>> {
        filters.validate()?;
        let guard = self.read()?;
        let coll = match guard.get(collection) {
            Some(c) if !c.entries.is_empty() => c,
            _ => return Ok(Vec::new()),
        };
        if let Some(dims) = coll.dims {
            if dims != query_vec.len() {
                return Err(RagError::IndexCorruption(format!(
                    "collection '{}' holds {}-dimensional vectors but the query has {}",
                    collection,
                    dims,
                    query_vec.len()
                )));
            }
        }

        let candidates: Vec<ScoredChunk> = coll
            .entries
            .values()
            .filter(|e| filters.matches(&e.chunk))
            .map(|e| ScoredChunk {
                chunk: e.chunk.clone(),
                score: cosine_similarity(query_vec, &e.embedding.vector),
            })
            .collect();
        Ok(rank(candidates, top_k))
    }

    async fn delete(&self, collection: &str, document_id: &str) -> Result<u64> {
        let mut guard = self.write()?;
        Ok(guard
            .get_mut(collection)
            .map(|c| c.remove_document(document_id))
            .unwrap_or(0))
    }

    async fn replace_document(
        &self,
        collection: &str,
        document_id: &str,
        entries: &[IndexEntry],
    ) -> Result<()> {
        let mut guard = self.write()?;
        let coll = guard.entry(collection.to_string()).or_default();
        let only_this_document = coll
            .entries
            .values()
            .all(|e| e.chunk.document_id == document_id);
        let remaining_dims = if only_this_document { None } else { coll.dims };
        check_entry_dims(BACKEND, remaining_dims, entries)?;
        coll.remove_document(document_id);
        for entry in entries {
            coll.put(entry.clone());
        }
        Ok(())
    }

    async fn document_entries(&self, collection: &str, document_id: &str) -> Result<Vec<IndexEntry>> {
        let guard = self.read()?;
        let mut out: Vec<IndexEntry> = guard
            .get(collection)
            .map(|c| {
                c.entries
                    .values()
                    .filter(|e| e.chunk.document_id == document_id)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        out.sort_by_key(|e| e.chunk.chunk_index);
        Ok(out)
    }

    async fn entries(&self, collection: &str) -> Result<Vec<IndexEntry>> {
        let guard = self.read()?;
        Ok(guard
            .get(collection)
            .map(|c| c.entries.values().cloned().collect())
            .unwrap_or_default())
    }
}

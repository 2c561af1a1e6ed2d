//! Index build orchestration.
//!
//! Coordinates the build flow: catalog → segmentation → embedding →
//! vector index. Documents are processed in parallel, bounded by
//! `embedding.concurrency`; each document's entries replace its previous
//! entries in one atomic [`VectorIndex::replace_document`] call, so a
//! failed document leaves its old entries intact.
//!
//! Embeddings are cached: a chunk whose id, text hash, and model match the
//! stored entry reuses the stored vector instead of calling the backend.
//! Any embedding failure (after retries) aborts the build; no chunk is ever
//! stored without its vector.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use anyhow::Result;
use futures::stream::{self, StreamExt, TryStreamExt};
use tracing::{debug, info};

use catalog_rag_core::embedding::{check_batch, Embedder};
use catalog_rag_core::models::{Document, Embedding, IndexEntry};
use catalog_rag_core::segment::segment;
use catalog_rag_core::store::VectorIndex;

use crate::catalog::load_catalog;
use crate::config::Config;
use crate::embedding::create_embedder;
use crate::retry::{with_retry, RetryPolicy};
use crate::sqlite_store::SqliteIndex;

/// Outcome of indexing one document.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DocumentReport {
    pub chunks: usize,
    pub reused: usize,
    pub computed: usize,
}

/// Outcome of a whole build.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexReport {
    pub documents: usize,
    pub chunks: usize,
    pub reused: usize,
    pub computed: usize,
    /// Documents no longer in the catalog whose entries were removed.
    pub removed: usize,
}

/// Segments, embeds, and stores documents into one collection.
#[derive(Clone)]
pub struct IndexBuilder {
    embedder: Arc<dyn Embedder>,
    index: Arc<dyn VectorIndex>,
    collection: String,
    chunk_size: usize,
    overlap: usize,
    batch_size: usize,
    concurrency: usize,
    retry: RetryPolicy,
}

impl IndexBuilder {
    pub fn new(
        config: &Config,
        embedder: Arc<dyn Embedder>,
        index: Arc<dyn VectorIndex>,
    ) -> Self {
        Self {
            embedder,
            index,
            collection: config.index.collection.clone(),
            chunk_size: config.chunking.chunk_size,
            overlap: config.chunking.overlap,
            batch_size: config.embedding.batch_size.max(1),
            concurrency: config.embedding.concurrency.max(1),
            retry: config.embedding.retry_policy(),
        }
    }

    /// Index a single document, replacing its previous entries.
    pub async fn index_document(&self, doc: &Document) -> catalog_rag_core::Result<DocumentReport> {
        let chunks = segment(doc, self.chunk_size, self.overlap)?;

        let cached: HashMap<String, IndexEntry> = self
            .index
            .document_entries(&self.collection, &doc.id)
            .await?
            .into_iter()
            .map(|e| (e.chunk.id.clone(), e))
            .collect();

        let model = self.embedder.model_name().to_string();
        let dims = self.embedder.dims();
        let mut vectors: Vec<Option<Vec<f32>>> = chunks
            .iter()
            .map(|chunk| {
                cached
                    .get(&chunk.id)
                    .filter(|e| {
                        e.chunk.hash == chunk.hash
                            && e.embedding.model == model
                            && e.embedding.dims() == dims
                    })
                    .map(|e| e.embedding.vector.clone())
            })
            .collect();
        let reused = vectors.iter().filter(|v| v.is_some()).count();

        let pending: Vec<usize> = (0..chunks.len()).filter(|i| vectors[*i].is_none()).collect();
        for batch in pending.chunks(self.batch_size) {
            let texts: Vec<String> = batch.iter().map(|i| chunks[*i].text.clone()).collect();
            let embedded = with_retry(&self.retry, "embed", || self.embedder.embed_batch(&texts)).await?;
            check_batch(&model, texts.len(), dims, &embedded)?;
            for (i, vector) in batch.iter().zip(embedded) {
                vectors[*i] = Some(vector);
            }
        }

        let entries: Vec<IndexEntry> = chunks
            .into_iter()
            .zip(vectors)
            .filter_map(|(chunk, vector)| {
                vector.map(|v| IndexEntry {
                    chunk,
                    embedding: Embedding::new(v, model.clone()),
                })
            })
            .collect();

        self.index
            .replace_document(&self.collection, &doc.id, &entries)
            .await?;

        let report = DocumentReport {
            chunks: entries.len(),
            reused,
            computed: entries.len() - reused,
        };
        debug!(
            document = %doc.id,
            chunks = report.chunks,
            reused = report.reused,
            computed = report.computed,
            "document indexed"
        );
        Ok(report)
    }

    /// Index every document, then drop entries of documents not in `docs`.
    pub async fn index_documents(&self, docs: &[Document]) -> catalog_rag_core::Result<IndexReport> {
        let reports: Vec<DocumentReport> = stream::iter(docs.iter())
            .map(|doc| self.index_document(doc))
            .buffer_unordered(self.concurrency)
            .try_collect()
            .await?;

        let mut report = IndexReport {
            documents: reports.len(),
            ..Default::default()
        };
        for r in &reports {
            report.chunks += r.chunks;
            report.reused += r.reused;
            report.computed += r.computed;
        }

        let current: HashSet<&str> = docs.iter().map(|d| d.id.as_str()).collect();
        let stale: HashSet<String> = self
            .index
            .entries(&self.collection)
            .await?
            .into_iter()
            .map(|e| e.chunk.document_id)
            .filter(|id| !current.contains(id.as_str()))
            .collect();
        for doc_id in &stale {
            self.index.delete(&self.collection, doc_id).await?;
        }
        report.removed = stale.len();

        info!(
            collection = %self.collection,
            documents = report.documents,
            chunks = report.chunks,
            reused = report.reused,
            computed = report.computed,
            removed = report.removed,
            "index build complete"
        );
        Ok(report)
    }
}

/// `catalog index`: load the catalog and (re)build the collection.
pub async fn run_index(config: &Config, dry_run: bool) -> Result<()> {
    let docs = load_catalog(&config.catalog)?;

    if dry_run {
        let mut chunks = 0usize;
        for doc in &docs {
            chunks += segment(doc, config.chunking.chunk_size, config.chunking.overlap)?.len();
        }
        println!("index {} (dry-run)", config.index.collection);
        println!("  documents found: {}", docs.len());
        println!("  estimated chunks: {}", chunks);
        return Ok(());
    }

    let embedder = create_embedder(&config.embedding)?;
    let index = SqliteIndex::open(config).await?;
    let builder = IndexBuilder::new(config, embedder, Arc::new(index.clone()));
    let report = builder.index_documents(&docs).await?;

    println!("index {}", config.index.collection);
    println!("  documents indexed: {}", report.documents);
    println!("  chunks written: {}", report.chunks);
    println!("  embeddings reused: {}", report.reused);
    println!("  embeddings computed: {}", report.computed);
    println!("  documents removed: {}", report.removed);
    println!("ok");

    index.pool().close().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse_config;
    use async_trait::async_trait;
    use catalog_rag_core::embedding::HashingEmbedder;
    use catalog_rag_core::store::memory::InMemoryIndex;
    use catalog_rag_core::RagError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Counts texts sent to the backend.
    struct CountingEmbedder {
        inner: HashingEmbedder,
        calls: AtomicUsize,
        texts: AtomicUsize,
    }

    #[async_trait]
    impl Embedder for CountingEmbedder {
        fn model_name(&self) -> &str {
            self.inner.model_name()
        }
        fn dims(&self) -> usize {
            self.inner.dims()
        }
        async fn embed_batch(&self, texts: &[String]) -> catalog_rag_core::Result<Vec<Vec<f32>>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.texts.fetch_add(texts.len(), Ordering::SeqCst);
            self.inner.embed_batch(texts).await
        }
    }

    struct FailingEmbedder;

    #[async_trait]
    impl Embedder for FailingEmbedder {
        fn model_name(&self) -> &str {
            "failing"
        }
        fn dims(&self) -> usize {
            8
        }
        async fn embed_batch(&self, _texts: &[String]) -> catalog_rag_core::Result<Vec<Vec<f32>>> {
            Err(RagError::EmbeddingBackend {
                provider: "failing".into(),
                status: Some(400),
                message: "bad request".into(),
            })
        }
    }

    fn config() -> Config {
        parse_config(
            "[db]\npath = \"unused.sqlite\"\n[chunking]\nchunk_size = 50\noverlap = 10\n[embedding]\nbatch_size = 2\n",
        )
        .unwrap()
    }

    fn counting() -> Arc<CountingEmbedder> {
        Arc::new(CountingEmbedder {
            inner: HashingEmbedder::new(64),
            calls: AtomicUsize::new(0),
            texts: AtomicUsize::new(0),
        })
    }

    #[tokio::test]
    async fn test_build_and_reuse_cache() {
        let embedder = counting();
        let index = Arc::new(InMemoryIndex::new());
        let builder = IndexBuilder::new(&config(), embedder.clone(), index.clone());
        let docs = vec![
            Document::new("cs101", "t", "Intro to Systems — prereq: Math 101"),
            Document::new("long", "t", "word ".repeat(40)),
        ];

        let first = builder.index_documents(&docs).await.unwrap();
        assert_eq!(first.documents, 2);
        assert_eq!(first.reused, 0);
        assert_eq!(first.computed, first.chunks);
        assert_eq!(embedder.texts.load(Ordering::SeqCst), first.chunks);

        let second = builder.index_documents(&docs).await.unwrap();
        assert_eq!(second.reused, first.chunks);
        assert_eq!(second.computed, 0);
        assert_eq!(embedder.texts.load(Ordering::SeqCst), first.chunks);
        assert_eq!(index.entries("catalog").await.unwrap().len(), first.chunks);
    }

    #[tokio::test]
    async fn test_changed_document_replaces_stale_chunks() {
        let embedder = counting();
        let index = Arc::new(InMemoryIndex::new());
        let builder = IndexBuilder::new(&config(), embedder, index.clone());

        builder
            .index_document(&Document::new("d", "t", "x".repeat(200)))
            .await
            .unwrap();
        let before = index.document_entries("catalog", "d").await.unwrap().len();
        assert!(before > 1);

        let report = builder
            .index_document(&Document::new("d", "t", "short now"))
            .await
            .unwrap();
        assert_eq!(report.chunks, 1);
        assert_eq!(report.computed, 1);
        let after = index.document_entries("catalog", "d").await.unwrap();
        assert_eq!(after.len(), 1);
        assert_eq!(after[0].chunk.text, "short now");
    }

    #[tokio::test]
    async fn test_removed_documents_pruned() {
        let index = Arc::new(InMemoryIndex::new());
        let builder = IndexBuilder::new(&config(), counting(), index.clone());
        builder
            .index_documents(&[Document::new("a", "t", "alpha"), Document::new("b", "t", "beta")])
            .await
            .unwrap();
        let report = builder
            .index_documents(&[Document::new("a", "t", "alpha")])
            .await
            .unwrap();
        assert_eq!(report.removed, 1);
        assert!(index.document_entries("catalog", "b").await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_embedding_failure_aborts_and_keeps_old_entries() {
        let index = Arc::new(InMemoryIndex::new());
        let good = IndexBuilder::new(&config(), Arc::new(HashingEmbedder::new(8)), index.clone());
        good.index_document(&Document::new("a", "t", "alpha"))
            .await
            .unwrap();

        let bad = IndexBuilder::new(&config(), Arc::new(FailingEmbedder), index.clone());
        let err = bad
            .index_document(&Document::new("a", "t", "alpha changed"))
            .await
            .unwrap_err();
        assert!(matches!(err, RagError::EmbeddingBackend { .. }));
        let stored = index.document_entries("catalog", "a").await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].chunk.text, "alpha");
    }

    #[tokio::test]
    async fn test_table_document_single_entry() {
        let index = Arc::new(InMemoryIndex::new());
        let builder = IndexBuilder::new(&config(), counting(), index.clone());
        let table = Document::new("cs_table_0", "t", "| a | b |\n| --- | --- |\n".repeat(10))
            .with_kind(catalog_rag_core::models::ChunkKind::Table);
        let report = builder.index_document(&table).await.unwrap();
        assert_eq!(report.chunks, 1);
    }
}

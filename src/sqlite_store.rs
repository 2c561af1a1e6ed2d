//! SQLite-backed [`VectorIndex`] implementation.
//!
//! All entries of all collections live in the `entries` table (see
//! [`crate::migrate`]). Every write runs in one transaction, so under WAL a
//! concurrent search observes either all or none of an upsert batch. Writers
//! sharing one `SqliteIndex` (and its clones) take a write gate first: a
//! deferred transaction that reads before writing cannot wait out another
//! writer's lock, so SQLite would answer "database is locked". Search
//! is brute-force cosine similarity over the collection's stored vectors,
//! read in rowid (insertion) order so that the stable ranking keeps ties in
//! insertion order.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, Sqlite, SqlitePool, Transaction};
use tokio::sync::Mutex;

use catalog_rag_core::embedding::{blob_to_vec, cosine_similarity, vec_to_blob};
use catalog_rag_core::models::{Chunk, ChunkKind, Embedding, IndexEntry, ScoredChunk};
use catalog_rag_core::store::{check_entry_dims, rank, SearchFilters, VectorIndex};
use catalog_rag_core::{RagError, Result};

use crate::config::Config;
use crate::{db, migrate};

const BACKEND: &str = "sqlite";

const SELECT_ENTRY: &str = "SELECT chunk_id, document_id, chunk_index, start_offset, end_offset, \
     kind, text, hash, metadata_json, embedding, model, dims FROM entries";

/// SQLite implementation of the [`VectorIndex`] trait.
#[derive(Clone)]
pub struct SqliteIndex {
    pool: SqlitePool,
    write_gate: Arc<Mutex<()>>,
}

impl SqliteIndex {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            write_gate: Arc::new(Mutex::new(())),
        }
    }

    /// Connect to the configured database, creating the schema if needed.
    pub async fn open(config: &Config) -> anyhow::Result<Self> {
        let pool = db::connect(config).await?;
        migrate::migrate(&pool).await?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Names of all collections with at least one entry.
    pub async fn collections(&self) -> Result<Vec<String>> {
        sqlx::query_scalar("SELECT DISTINCT collection FROM entries ORDER BY collection")
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)
    }
}

fn db_err(e: sqlx::Error) -> RagError {
    RagError::index(BACKEND, e.to_string())
}

fn row_to_entry(row: &SqliteRow) -> Result<IndexEntry> {
    let chunk_id: String = row.try_get("chunk_id").map_err(db_err)?;
    let kind: String = row.try_get("kind").map_err(db_err)?;
    let kind: ChunkKind = kind.parse().map_err(|_| {
        RagError::IndexCorruption(format!("chunk '{}' has unknown kind '{}'", chunk_id, kind))
    })?;
    let metadata_json: String = row.try_get("metadata_json").map_err(db_err)?;
    let metadata: BTreeMap<String, String> = serde_json::from_str(&metadata_json).map_err(|e| {
        RagError::IndexCorruption(format!("chunk '{}' has invalid metadata: {}", chunk_id, e))
    })?;
    let blob: Vec<u8> = row.try_get("embedding").map_err(db_err)?;
    let dims: i64 = row.try_get("dims").map_err(db_err)?;
    let vector = blob_to_vec(&blob)?;
    if vector.len() as i64 != dims {
        return Err(RagError::IndexCorruption(format!(
            "chunk '{}' records {} dimensions but stores {}",
            chunk_id,
            dims,
            vector.len()
        )));
    }
    let start: i64 = row.try_get("start_offset").map_err(db_err)?;
    let end: i64 = row.try_get("end_offset").map_err(db_err)?;

    Ok(IndexEntry {
        chunk: Chunk {
            id: chunk_id,
            document_id: row.try_get("document_id").map_err(db_err)?,
            chunk_index: row.try_get("chunk_index").map_err(db_err)?,
            start: start as usize,
            end: end as usize,
            text: row.try_get("text").map_err(db_err)?,
            hash: row.try_get("hash").map_err(db_err)?,
            kind,
            metadata,
        },
        embedding: Embedding::new(vector, row.try_get::<String, _>("model").map_err(db_err)?),
    })
}

async fn collection_dims(
    tx: &mut Transaction<'_, Sqlite>,
    collection: &str,
    excluding_document: Option<&str>,
) -> Result<Option<usize>> {
    let dims: Option<i64> = sqlx::query_scalar(
        "SELECT dims FROM entries WHERE collection = ? AND (? IS NULL OR document_id != ?) LIMIT 1",
    )
    .bind(collection)
    .bind(excluding_document)
    .bind(excluding_document)
    .fetch_optional(&mut **tx)
    .await
    .map_err(db_err)?;
    Ok(dims.map(|d| d as usize))
}

async fn write_entries(
    tx: &mut Transaction<'_, Sqlite>,
    collection: &str,
    entries: &[IndexEntry],
) -> Result<()> {
    let now = chrono::Utc::now().timestamp();
    for entry in entries {
        let chunk = &entry.chunk;
        let metadata_json = serde_json::to_string(&chunk.metadata)
            .map_err(|e| RagError::index(BACKEND, e.to_string()))?;
        sqlx::query(
            r#"
            INSERT INTO entries (collection, chunk_id, document_id, chunk_index, start_offset,
                                 end_offset, kind, text, hash, metadata_json, embedding,
                                 model, dims, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(collection, chunk_id) DO UPDATE SET
                document_id = excluded.document_id,
                chunk_index = excluded.chunk_index,
                start_offset = excluded.start_offset,
                end_offset = excluded.end_offset,
                kind = excluded.kind,
                text = excluded.text,
                hash = excluded.hash,
                metadata_json = excluded.metadata_json,
                embedding = excluded.embedding,
                model = excluded.model,
                dims = excluded.dims,
                created_at = excluded.created_at
            "#,
        )
        .bind(collection)
        .bind(&chunk.id)
        .bind(&chunk.document_id)
        .bind(chunk.chunk_index)
        .bind(chunk.start as i64)
        .bind(chunk.end as i64)
        .bind(chunk.kind.as_str())
        .bind(&chunk.text)
        .bind(&chunk.hash)
        .bind(&metadata_json)
        .bind(vec_to_blob(&entry.embedding.vector))
        .bind(&entry.embedding.model)
        .bind(entry.embedding.dims() as i64)
        .bind(now)
        .execute(&mut **tx)
        .await
        .map_err(db_err)?;
    }
    Ok(())
}

#[async_trait]
impl VectorIndex for SqliteIndex {
    async fn upsert(&self, collection: &str, entries: &[IndexEntry]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let _writer = self.write_gate.lock().await;
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let dims = collection_dims(&mut tx, collection, None).await?;
        check_entry_dims(BACKEND, dims, entries)?;
        write_entries(&mut tx, collection, entries).await?;
        tx.commit().await.map_err(db_err)?;
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
        if top_k == 0 {
            return Ok(Vec::new());
        }

        let sql = format!(
            "{} WHERE collection = ? AND (? IS NULL OR document_id = ?) ORDER BY rowid",
            SELECT_ENTRY
        );
        let rows = sqlx::query(&sql)
            .bind(collection)
            .bind(filters.document_id.as_deref())
            .bind(filters.document_id.as_deref())
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;

        let mut candidates = Vec::with_capacity(rows.len());
        for row in &rows {
            let entry = row_to_entry(row)?;
            if entry.embedding.dims() != query_vec.len() {
                return Err(RagError::IndexCorruption(format!(
                    "collection '{}' holds {}-dimensional vectors but the query has {}",
                    collection,
                    entry.embedding.dims(),
                    query_vec.len()
                )));
            }
            if !filters.matches(&entry.chunk) {
                continue;
            }
            let score = cosine_similarity(query_vec, &entry.embedding.vector);
            candidates.push(ScoredChunk {
                chunk: entry.chunk,
                score,
            });
        }

        Ok(rank(candidates, top_k))
    }

    async fn delete(&self, collection: &str, document_id: &str) -> Result<u64> {
        let _writer = self.write_gate.lock().await;
        let result = sqlx::query("DELETE FROM entries WHERE collection = ? AND document_id = ?")
            .bind(collection)
            .bind(document_id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(result.rows_affected())
    }

    async fn replace_document(
        &self,
        collection: &str,
        document_id: &str,
        entries: &[IndexEntry],
    ) -> Result<()> {
        let _writer = self.write_gate.lock().await;
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let dims = collection_dims(&mut tx, collection, Some(document_id)).await?;
        check_entry_dims(BACKEND, dims, entries)?;

        sqlx::query("DELETE FROM entries WHERE collection = ? AND document_id = ?")
            .bind(collection)
            .bind(document_id)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        write_entries(&mut tx, collection, entries).await?;

        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    async fn document_entries(&self, collection: &str, document_id: &str) -> Result<Vec<IndexEntry>> {
        let sql = format!(
            "{} WHERE collection = ? AND document_id = ? ORDER BY chunk_index",
            SELECT_ENTRY
        );
        let rows = sqlx::query(&sql)
            .bind(collection)
            .bind(document_id)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
        rows.iter().map(row_to_entry).collect()
    }

    async fn entries(&self, collection: &str) -> Result<Vec<IndexEntry>> {
        let sql = format!("{} WHERE collection = ? ORDER BY rowid", SELECT_ENTRY);
        let rows = sqlx::query(&sql)
            .bind(collection)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
        rows.iter().map(row_to_entry).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use catalog_rag_core::models::Document;
    use catalog_rag_core::segment::segment;
    use tempfile::TempDir;

    async fn open(tmp: &TempDir) -> SqliteIndex {
        let pool = crate::db::connect_path(&tmp.path().join("index.sqlite"))
            .await
            .unwrap();
        crate::migrate::migrate(&pool).await.unwrap();
        SqliteIndex::new(pool)
    }

    fn entry(doc_id: &str, text: &str, vector: Vec<f32>) -> IndexEntry {
        let doc = Document::new(doc_id, "test", text).with_category("cs");
        IndexEntry {
            chunk: segment(&doc, 1000, 0).unwrap().remove(0),
            embedding: Embedding::new(vector, "test-model"),
        }
    }

    #[tokio::test]
    async fn test_upsert_search_delete() {
        let tmp = TempDir::new().unwrap();
        let index = open(&tmp).await;
        index
            .upsert(
                "catalog",
                &[
                    entry("a", "alpha", vec![1.0, 0.0]),
                    entry("b", "beta", vec![0.0, 1.0]),
                ],
            )
            .await
            .unwrap();

        let hits = index
            .search("catalog", &[1.0, 0.1], 5, &SearchFilters::none())
            .await
            .unwrap();
        assert_eq!(hits[0].chunk.document_id, "a");
        assert_eq!(hits[0].chunk.category(), Some("cs"));
        assert_eq!(hits.len(), 2);

        assert_eq!(index.delete("catalog", "a").await.unwrap(), 1);
        let hits = index
            .search("catalog", &[1.0, 0.1], 5, &SearchFilters::none())
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].chunk.document_id, "b");
    }

    #[tokio::test]
    async fn test_reupsert_keeps_rowid_order() {
        let tmp = TempDir::new().unwrap();
        let index = open(&tmp).await;
        index
            .upsert(
                "catalog",
                &[
                    entry("a", "alpha", vec![1.0, 0.0]),
                    entry("b", "beta", vec![1.0, 0.0]),
                ],
            )
            .await
            .unwrap();
        index
            .upsert("catalog", &[entry("a", "alpha", vec![1.0, 0.0])])
            .await
            .unwrap();
        let ids: Vec<String> = index
            .entries("catalog")
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.chunk.document_id)
            .collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_corrupt_blob_detected() {
        let tmp = TempDir::new().unwrap();
        let index = open(&tmp).await;
        index
            .upsert("catalog", &[entry("a", "alpha", vec![1.0, 0.0])])
            .await
            .unwrap();
        sqlx::query("UPDATE entries SET embedding = x'000000'")
            .execute(index.pool())
            .await
            .unwrap();
        let err = index
            .search("catalog", &[1.0, 0.0], 3, &SearchFilters::none())
            .await
            .unwrap_err();
        assert!(matches!(err, RagError::IndexCorruption(_)));
    }

    #[tokio::test]
    async fn test_query_dimension_mismatch_is_corruption() {
        let tmp = TempDir::new().unwrap();
        let index = open(&tmp).await;
        index
            .upsert("catalog", &[entry("a", "alpha", vec![1.0, 0.0])])
            .await
            .unwrap();
        let err = index
            .search("catalog", &[1.0, 0.0, 0.0], 3, &SearchFilters::none())
            .await
            .unwrap_err();
        assert!(matches!(err, RagError::IndexCorruption(_)));
    }

    #[tokio::test]
    async fn test_replace_document_is_atomic_on_bad_dims() {
        let tmp = TempDir::new().unwrap();
        let index = open(&tmp).await;
        index
            .upsert(
                "catalog",
                &[
                    entry("a", "alpha", vec![1.0, 0.0]),
                    entry("b", "beta", vec![0.0, 1.0]),
                ],
            )
            .await
            .unwrap();
        let err = index
            .replace_document("catalog", "a", &[entry("a", "alpha", vec![1.0, 0.0, 0.0])])
            .await
            .unwrap_err();
        assert!(matches!(err, RagError::Config(_)));
        assert_eq!(index.document_entries("catalog", "a").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_filters_by_document() {
        let tmp = TempDir::new().unwrap();
        let index = open(&tmp).await;
        index
            .upsert(
                "catalog",
                &[
                    entry("a", "alpha", vec![1.0, 0.0]),
                    entry("b", "beta", vec![0.9, 0.1]),
                ],
            )
            .await
            .unwrap();
        let filters = SearchFilters {
            document_id: Some("b".into()),
            ..Default::default()
        };
        let hits = index.search("catalog", &[1.0, 0.0], 5, &filters).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].chunk.document_id, "b");
        assert_eq!(index.collections().await.unwrap(), vec!["catalog".to_string()]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_writers_do_not_lock_out() {
        let tmp = TempDir::new().unwrap();
        let index = open(&tmp).await;
        index
            .upsert("catalog", &[entry("seed", "seed", vec![1.0, 0.0])])
            .await
            .unwrap();

        let mut tasks = Vec::new();
        for i in 0..16 {
            let index = index.clone();
            tasks.push(tokio::spawn(async move {
                let id = format!("doc-{}", i);
                for round in 0..5 {
                    let text = format!("{} round {}", id, round);
                    index
                        .replace_document("catalog", &id, &[entry(&id, &text, vec![0.5, 0.5])])
                        .await?;
                }
                index.delete("catalog", "seed").await.map(|_| ())
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        let stats = index.stats("catalog").await.unwrap();
        assert_eq!(stats.documents, 16);
        assert_eq!(stats.chunks, 16);
    }
}

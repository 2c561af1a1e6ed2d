//! Export a collection as a JSON backup.
//!
//! The backup lists every chunk in insertion order as parallel arrays:
//!
//! ```json
//! { "collection": "catalog", "count": 2,
//!   "ids": ["cs101#0", "cs101#1"],
//!   "documents": ["...", "..."],
//!   "metadatas": [{"document_id": "cs101", "title": "...", ...}, ...] }
//! ```
//!
//! Vectors are not exported; they are rebuilt by `catalog index`.

use anyhow::Result;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;

use catalog_rag_core::store::VectorIndex;

use crate::config::Config;
use crate::sqlite_store::SqliteIndex;

#[derive(Debug, Serialize)]
pub struct Backup {
    pub collection: String,
    pub count: usize,
    pub ids: Vec<String>,
    pub documents: Vec<String>,
    pub metadatas: Vec<BTreeMap<String, String>>,
}

/// Snapshot `collection` from any index.
pub async fn export_collection(index: &dyn VectorIndex, collection: &str) -> Result<Backup> {
    let entries = index.entries(collection).await?;

    let mut backup = Backup {
        collection: collection.to_string(),
        count: entries.len(),
        ids: Vec::with_capacity(entries.len()),
        documents: Vec::with_capacity(entries.len()),
        metadatas: Vec::with_capacity(entries.len()),
    };
    for entry in entries {
        let chunk = entry.chunk;
        let mut metadata = chunk.metadata;
        metadata.insert("document_id".to_string(), chunk.document_id);
        metadata.insert("chunk_index".to_string(), chunk.chunk_index.to_string());
        metadata.insert("kind".to_string(), chunk.kind.to_string());
        metadata.insert("model".to_string(), entry.embedding.model);

        backup.ids.push(chunk.id);
        backup.documents.push(chunk.text);
        backup.metadatas.push(metadata);
    }
    Ok(backup)
}

/// `catalog export`: write the backup to `output`, or stdout when `None`.
pub async fn run_export(config: &Config, output: Option<&Path>) -> Result<()> {
    let index = SqliteIndex::open(config).await?;
    let backup = export_collection(&index, &config.index.collection).await?;
    let json = serde_json::to_string_pretty(&backup)?;

    match output {
        Some(path) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(path, &json)?;
            eprintln!(
                "Exported {} chunks from '{}' to {}",
                backup.count,
                backup.collection,
                path.display()
            );
        }
        None => {
            println!("{}", json);
        }
    }

    index.pool().close().await;
    Ok(())
}

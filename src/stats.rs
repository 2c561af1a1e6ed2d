//! `catalog stats` and `catalog delete`: inspect and prune a collection.

use anyhow::Result;

use catalog_rag_core::store::VectorIndex;

use crate::config::Config;
use crate::sqlite_store::SqliteIndex;

pub async fn run_stats(config: &Config) -> Result<()> {
    let index = SqliteIndex::open(config).await?;
    let collection = &config.index.collection;
    let stats = index.stats(collection).await?;

    let db_size = std::fs::metadata(&config.db.path)
        .map(|m| m.len())
        .unwrap_or(0);

    println!("Catalog index stats");
    println!("===================");
    println!();
    println!("  Database:    {}", config.db.path.display());
    println!("  Size:        {}", format_bytes(db_size));
    println!("  Collection:  {}", collection);
    println!();
    println!("  Documents:   {}", stats.documents);
    println!("  Chunks:      {}", stats.chunks);
    if stats.models.is_empty() {
        println!("  Models:      (none)");
    } else {
        println!("  Models:      {}", stats.models.join(", "));
    }

    let others: Vec<String> = index
        .collections()
        .await?
        .into_iter()
        .filter(|c| c != collection)
        .collect();
    if !others.is_empty() {
        println!();
        println!("  Other collections: {}", others.join(", "));
    }
    println!();

    index.pool().close().await;
    Ok(())
}

pub async fn run_delete(config: &Config, document_id: &str) -> Result<()> {
    let index = SqliteIndex::open(config).await?;
    let removed = index.delete(&config.index.collection, document_id).await?;
    if removed == 0 {
        println!("No entries for document '{}'.", document_id);
    } else {
        println!("Deleted {} chunks of '{}'.", removed, document_id);
    }
    index.pool().close().await;
    Ok(())
}

fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

//! `catalog search`: rank catalog chunks against a query without generating an answer.
//!
//! Useful for checking what the answer pipeline would see as context for a
//! question. Scores are cosine similarities in `[-1, 1]`.

use anyhow::Result;
use std::sync::Arc;

use catalog_rag_core::models::RetrievalResult;
use catalog_rag_core::retrieve::Retriever;
use catalog_rag_core::store::SearchFilters;

use crate::config::Config;
use crate::embedding::create_embedder;
use crate::retry::with_retry;
use crate::sqlite_store::SqliteIndex;

/// Retrieve up to `limit` chunks (default `retrieval.top_k`) for `query`.
pub async fn search(
    config: &Config,
    retriever: &Retriever,
    query: &str,
    limit: Option<usize>,
    category: Option<String>,
) -> catalog_rag_core::Result<RetrievalResult> {
    let top_k = limit.unwrap_or(config.retrieval.top_k);
    let filters = SearchFilters {
        category,
        ..SearchFilters::none()
    };
    with_retry(&config.embedding.retry_policy(), "embed", || {
        retriever.retrieve(&config.index.collection, query, top_k, &filters)
    })
    .await
}

pub async fn run_search(
    config: &Config,
    query: &str,
    limit: Option<usize>,
    category: Option<String>,
) -> Result<()> {
    let embedder = create_embedder(&config.embedding)?;
    let index = SqliteIndex::open(config).await?;
    let retriever = Retriever::new(embedder, Arc::new(index.clone()))
        .with_min_score(config.retrieval.min_score);

    let result = search(config, &retriever, query, limit, category).await?;

    if result.is_empty() {
        println!("No results.");
        index.pool().close().await;
        return Ok(());
    }

    for (i, hit) in result.iter().enumerate() {
        let chunk = &hit.chunk;
        println!(
            "{}. [{:.3}] {} / {}",
            i + 1,
            hit.score,
            chunk.document_id,
            chunk.title().unwrap_or("(untitled)")
        );
        if let Some(category) = chunk.category() {
            println!("    category: {}", category);
        }
        println!("    kind: {}", chunk.kind);
        println!("    excerpt: \"{}\"", excerpt(&chunk.text, 240));
        println!("    id: {}", chunk.id);
        println!();
    }

    index.pool().close().await;
    Ok(())
}

/// First `max_chars` characters of `text` on one line.
fn excerpt(text: &str, max_chars: usize) -> String {
    let flat = text.replace('\n', " ");
    let flat = flat.trim();
    match flat.char_indices().nth(max_chars) {
        Some((cut, _)) => format!("{}...", &flat[..cut]),
        None => flat.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_excerpt_flattens_and_cuts_on_char_boundary() {
        assert_eq!(excerpt("a\nb", 10), "a b");
        assert_eq!(excerpt("héllo world", 4), "héll...");
    }
}

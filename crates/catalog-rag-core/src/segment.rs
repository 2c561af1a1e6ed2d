//! Sliding-window text segmenter.
//!
//! Splits a [`Document`]'s text into overlapping [`Chunk`]s of a fixed
//! target length. Lengths are measured in Unicode scalar values
//! (characters), so multi-byte text never splits inside a character.
//!
//! # Algorithm
//!
//! 1. Validate `chunk_size > 0` and `overlap < chunk_size`.
//! 2. Emit the window `[start, start + chunk_size)` clamped to the text length.
//! 3. Stop once a window reaches the end of the text; otherwise advance
//!    `start` by `chunk_size - overlap` and repeat.
//!
//! For a text of `L` characters with `L > chunk_size` this yields
//! `ceil((L - overlap) / (chunk_size - overlap))` chunks; a text no longer
//! than `chunk_size` yields exactly one chunk and an empty text yields none.
//!
//! Table documents ([`ChunkKind::Table`]) are never split: a table is
//! emitted as a single chunk whatever its length.
//!
//! Chunk ids are `{document_id}#{index}`, so re-segmenting the same document
//! with the same parameters reproduces the same ids, text and hashes.
//!
//! # Example
//!
//! ```rust
//! use catalog_rag_core::models::Document;
//! use catalog_rag_core::segment::segment;
//!
//! let doc = Document::new("cs101", "catalog/cs101.txt", "Intro to Systems — prereq: Math 101");
//! let chunks = segment(&doc, 50, 10).unwrap();
//! assert_eq!(chunks.len(), 1);
//! assert!(chunks[0].text.contains("prereq: Math 101"));
//! ```

use std::collections::BTreeMap;

use sha2::{Digest, Sha256};

use crate::error::{RagError, Result};
use crate::models::{Chunk, ChunkKind, Document};

/// Check segmentation parameters.
///
/// # Errors
///
/// Returns [`RagError::Config`] if `chunk_size == 0` or
/// `overlap >= chunk_size`.
pub fn validate_params(chunk_size: usize, overlap: usize) -> Result<()> {
    if chunk_size == 0 {
        return Err(RagError::Config("chunk_size must be > 0".to_string()));
    }
    if overlap >= chunk_size {
        return Err(RagError::Config(format!(
            "overlap ({}) must be less than chunk_size ({})",
            overlap, chunk_size
        )));
    }
    Ok(())
}

/// Split a document into overlapping chunks.
///
/// Pure and deterministic: the same document and parameters always produce
/// a byte-identical chunk sequence.
///
/// # Errors
///
/// Returns [`RagError::Config`] for invalid parameters, see [`validate_params`].
pub fn segment(document: &Document, chunk_size: usize, overlap: usize) -> Result<Vec<Chunk>> {
    validate_params(chunk_size, overlap)?;

    let text = document.text.as_str();
    if text.is_empty() {
        return Ok(Vec::new());
    }

    let metadata = chunk_metadata(document);

    if document.kind == ChunkKind::Table {
        return Ok(vec![make_chunk(document, &metadata, 0, 0, text.len())]);
    }

    // Byte offset of every character boundary, including the end of text.
    let bounds: Vec<usize> = text
        .char_indices()
        .map(|(i, _)| i)
        .chain(std::iter::once(text.len()))
        .collect();
    let char_len = bounds.len() - 1;
    let step = chunk_size - overlap;

    let mut chunks = Vec::new();
    let mut start = 0usize;
    let mut index: i64 = 0;

    loop {
        let end = (start + chunk_size).min(char_len);
        chunks.push(make_chunk(
            document,
            &metadata,
            index,
            bounds[start],
            bounds[end],
        ));
        if end == char_len {
            break;
        }
        start += step;
        index += 1;
    }

    Ok(chunks)
}

/// Number of chunks [`segment`] produces for a prose text of `len` characters.
pub fn expected_chunk_count(len: usize, chunk_size: usize, overlap: usize) -> usize {
    if len == 0 {
        0
    } else if len <= chunk_size {
        1
    } else {
        let step = chunk_size - overlap;
        (len - overlap).div_ceil(step)
    }
}

/// SHA-256 hex digest of a chunk's text.
pub fn text_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn chunk_metadata(document: &Document) -> BTreeMap<String, String> {
    let mut metadata = document.metadata.clone();
    metadata.insert("source".to_string(), document.source.clone());
    if let Some(title) = &document.title {
        metadata.insert("title".to_string(), title.clone());
    }
    if let Some(category) = &document.category {
        metadata.insert("category".to_string(), category.clone());
    }
    metadata
}

fn make_chunk(
    document: &Document,
    metadata: &BTreeMap<String, String>,
    index: i64,
    start: usize,
    end: usize,
) -> Chunk {
    let text = &document.text[start..end];
    Chunk {
        id: format!("{}#{}", document.id, index),
        document_id: document.id.clone(),
        chunk_index: index,
        start,
        end,
        text: text.to_string(),
        hash: text_hash(text),
        kind: document.kind,
        metadata: metadata.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(text: &str) -> Document {
        Document::new("doc1", "test", text)
    }

    #[test]
    fn test_empty_document_yields_no_chunks() {
        let chunks = segment(&doc(""), 50, 10).unwrap();
        assert!(chunks.is_empty());
    }

    #[test]
    fn test_short_document_single_chunk() {
        let chunks = segment(&doc("Hello, world!"), 50, 10).unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].text, "Hello, world!");
        assert_eq!(chunks[0].start, 0);
        assert_eq!(chunks[0].end, 13);
    }

    #[test]
    fn test_exact_length_single_chunk() {
        let text = "a".repeat(50);
        let chunks = segment(&doc(&text), 50, 10).unwrap();
        assert_eq!(chunks.len(), 1);
    }

    #[test]
    fn test_count_formula_boundaries() {
        // (L, C, O) around window boundaries.
        let cases = [
            (51, 50, 10),
            (89, 50, 10),
            (90, 50, 10),
            (91, 50, 10),
            (130, 50, 10),
            (131, 50, 10),
            (11, 10, 0),
            (20, 10, 0),
            (21, 10, 9),
        ];
        for (len, size, overlap) in cases {
            let text = "x".repeat(len);
            let chunks = segment(&doc(&text), size, overlap).unwrap();
            let expected = (len - overlap).div_ceil(size - overlap);
            assert_eq!(
                chunks.len(),
                expected,
                "L={} C={} O={}",
                len,
                size,
                overlap
            );
            assert_eq!(expected_chunk_count(len, size, overlap), expected);
        }
    }

    #[test]
    fn test_adjacent_chunks_overlap() {
        let text: String = ('a'..='z').cycle().take(120).collect();
        let chunks = segment(&doc(&text), 50, 10).unwrap();
        for pair in chunks.windows(2) {
            let prev = &pair[0].text;
            let tail = &prev[prev.len() - 10..];
            assert!(pair[1].text.starts_with(tail));
            assert!(pair[0].start < pair[1].start);
        }
        assert_eq!(chunks.last().unwrap().end, text.len());
    }

    #[test]
    fn test_last_chunk_may_be_shorter() {
        let text = "y".repeat(95);
        let chunks = segment(&doc(&text), 50, 10).unwrap();
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[2].text.len(), 15);
    }

    #[test]
    fn test_invalid_params() {
        assert!(matches!(segment(&doc("abc"), 0, 0), Err(RagError::Config(_))));
        assert!(matches!(segment(&doc("abc"), 10, 10), Err(RagError::Config(_))));
        assert!(matches!(segment(&doc("abc"), 10, 12), Err(RagError::Config(_))));
        // Parameters are validated even when the text is empty.
        assert!(matches!(segment(&doc(""), 10, 10), Err(RagError::Config(_))));
    }

    #[test]
    fn test_multibyte_text_splits_on_char_boundaries() {
        let text = "┌──────────────────┐ Systems — prereq: Math 101 é ü".repeat(3);
        let chunks = segment(&doc(&text), 7, 2).unwrap();
        for c in &chunks {
            assert!(c.text.chars().count() <= 7);
            assert_eq!(&text[c.start..c.end], c.text);
        }
    }

    #[test]
    fn test_deterministic() {
        let text = "Alpha beta gamma delta epsilon zeta eta theta iota kappa lambda mu";
        let a = segment(&doc(text), 16, 4).unwrap();
        let b = segment(&doc(text), 16, 4).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_ids_and_indices_contiguous() {
        let text = "z".repeat(200);
        let chunks = segment(&doc(&text), 30, 5).unwrap();
        for (i, c) in chunks.iter().enumerate() {
            assert_eq!(c.chunk_index, i as i64);
            assert_eq!(c.id, format!("doc1#{}", i));
            assert_eq!(c.document_id, "doc1");
        }
    }

    #[test]
    fn test_table_document_is_atomic() {
        let table = "| Course | Prereq |\n| --- | --- |\n".to_string() + &"| CS 200 | CS 101 |\n".repeat(20);
        let d = Document::new("cs_table_0", "catalog/cs.json", table.clone()).with_kind(ChunkKind::Table);
        let chunks = segment(&d, 50, 10).unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].text, table);
        assert_eq!(chunks[0].kind, ChunkKind::Table);
    }

    #[test]
    fn test_metadata_inherited() {
        let d = Document::new("cs101", "catalog/cs/cs101.md", "Intro to Systems")
            .with_title("Intro to Systems")
            .with_category("cs");
        let chunks = segment(&d, 50, 10).unwrap();
        assert_eq!(chunks[0].title(), Some("Intro to Systems"));
        assert_eq!(chunks[0].category(), Some("cs"));
        assert_eq!(
            chunks[0].metadata.get("source").map(String::as_str),
            Some("catalog/cs/cs101.md")
        );
    }

    #[test]
    fn test_prerequisite_phrase_survives_segmentation() {
        let d = doc("Intro to Systems — prereq: Math 101");
        let chunks = segment(&d, 50, 10).unwrap();
        assert!(!chunks.is_empty());
        assert!(chunks.iter().any(|c| c.text.contains("prereq: Math 101")));
    }
}

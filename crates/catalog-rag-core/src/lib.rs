//! # Catalog RAG Core
//!
//! Backend-agnostic logic for Catalog RAG: data models, typed errors,
//! segmentation, the embedder and generator capabilities, the vector index
//! abstraction, retrieval, and conversation context assembly.
//!
//! This crate contains no tokio runtime, sqlx, filesystem I/O, or network
//! clients. Concrete backends (SQLite index, OpenAI/Ollama embedders and
//! chat models) live in the `catalog-rag` app crate and plug in through the
//! traits defined here.
//!
//! ## Pipeline
//!
//! ```text
//! build:  Document ──▶ segment ──▶ Embedder ──▶ VectorIndex::upsert
//! query:  text ──▶ Embedder ──▶ VectorIndex::search ──▶ Retriever
//!              ──▶ ContextManager::build_prompt ──▶ Generator
//! ```

pub mod context;
pub mod embedding;
pub mod error;
pub mod llm;
pub mod models;
pub mod retrieve;
pub mod segment;
pub mod store;

pub use error::{RagError, Result};

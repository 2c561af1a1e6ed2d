//! # Catalog RAG
//!
//! Retrieval-augmented question answering over a course catalog.
//!
//! Catalog files are segmented into overlapping chunks, embedded, and stored
//! in a SQLite-backed vector index. Questions are embedded the same way, the
//! nearest chunks are merged with the session's recent history into a
//! prompt, and a language model answers from that context.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌──────────────┐   ┌──────────┐
//! │ Catalog  │──▶│ Segment+Embed│──▶│  SQLite  │
//! │ txt/json │   │  (ingest)    │   │ entries  │
//! └──────────┘   └──────────────┘   └────┬─────┘
//!                                        │ search
//!                ┌──────────┐      ┌─────┴─────┐     ┌─────┐
//!  question ────▶│ Retriever│─────▶│  Context  │────▶│ LLM │──▶ answer
//!                └──────────┘      │  Manager  │     └─────┘
//!                                  └───────────┘
//! ```
//!
//! The pipeline primitives (segmenter, embedder trait, index trait,
//! retriever, context manager) live in `catalog-rag-core`; this crate wires
//! them to concrete backends, configuration, and the CLI/HTTP surfaces.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing and validation |
//! | [`catalog`] | Catalog loading (text, Markdown, JSON, YAML) |
//! | [`embedding`] | Embedding backends |
//! | [`llm`] | Language model backends |
//! | [`retry`] | Timeout and backoff for backend calls |
//! | [`sqlite_store`] | Durable vector index |
//! | [`ingest`] | Index build |
//! | [`answer`] | Answer orchestration and sessions |
//! | [`search`] | Retrieval-only queries |
//! | [`stats`] | Collection summary and deletes |
//! | [`export`] | JSON backup |
//! | [`server`] | HTTP API |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod answer;
pub mod catalog;
pub mod config;
pub mod db;
pub mod embedding;
pub mod export;
pub mod ingest;
pub mod llm;
pub mod migrate;
pub mod retry;
pub mod search;
pub mod server;
pub mod sqlite_store;
pub mod stats;

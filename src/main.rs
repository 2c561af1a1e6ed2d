//! # Catalog CLI (`catalog`)
//!
//! Build a vector index over a course catalog and answer questions about it.
//!
//! ## Usage
//!
//! ```bash
//! catalog --config ./config/catalog.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `catalog init` | Create the SQLite database and schema |
//! | `catalog index` | Load, segment, embed, and store the catalog |
//! | `catalog search "<q>"` | Rank catalog chunks against a query |
//! | `catalog ask "<q>"` | Answer one question |
//! | `catalog chat` | Interactive question loop in one session |
//! | `catalog delete <id>` | Remove a document's entries |
//! | `catalog stats` | Collection summary |
//! | `catalog export` | JSON backup of the collection |
//! | `catalog serve` | HTTP API for chat front ends |
//!
//! Logs go to stderr; set `RUST_LOG=catalog_rag=debug` for pipeline detail.

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use catalog_rag::answer::AnswerOrchestrator;
use catalog_rag::config::{self, Config};
use catalog_rag::embedding::create_embedder;
use catalog_rag::llm::create_generator;
use catalog_rag::sqlite_store::SqliteIndex;
use catalog_rag::{export, ingest, migrate, search, server, stats};
use catalog_rag_core::store::SearchFilters;
use catalog_rag_core::RagError;

/// Course catalog question answering over a local vector index.
///
/// All commands read a TOML configuration file given by `--config`.
#[derive(Parser)]
#[command(
    name = "catalog",
    about = "Retrieval-augmented question answering over course catalogs",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/catalog.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Idempotent: running it on an existing database is safe.
    Init,

    /// Load the catalog and (re)build the collection.
    ///
    /// Unchanged chunks reuse their stored embeddings; documents no longer
    /// in the catalog are removed.
    Index {
        /// Show document and chunk counts without embedding or writing.
        #[arg(long)]
        dry_run: bool,
    },

    /// Rank catalog chunks against a query (no answer generation).
    Search {
        query: String,

        /// Maximum number of results (defaults to `retrieval.top_k`).
        #[arg(long)]
        limit: Option<usize>,

        /// Only chunks from this category.
        #[arg(long)]
        category: Option<String>,
    },

    /// Answer one question.
    Ask {
        question: String,

        /// Session to continue.
        #[arg(long, default_value = "cli")]
        session: String,

        /// Only use context from this category.
        #[arg(long)]
        category: Option<String>,
    },

    /// Ask questions interactively until `exit` or `quit`.
    Chat {
        #[arg(long, default_value = "cli")]
        session: String,

        #[arg(long)]
        category: Option<String>,
    },

    /// Remove every chunk of a document.
    Delete { document_id: String },

    /// Show documents, chunks, and models in the collection.
    Stats,

    /// Write the collection as JSON.
    Export {
        /// Output file (stdout when omitted).
        #[arg(long)]
        output: Option<PathBuf>,
    },

    /// Start the HTTP API.
    Serve,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Index { dry_run } => {
            ingest::run_index(&cfg, dry_run).await?;
        }
        Commands::Search {
            query,
            limit,
            category,
        } => {
            search::run_search(&cfg, &query, limit, category).await?;
        }
        Commands::Ask {
            question,
            session,
            category,
        } => {
            run_ask(&cfg, &question, &session, category).await?;
        }
        Commands::Chat { session, category } => {
            run_chat(&cfg, &session, category).await?;
        }
        Commands::Delete { document_id } => {
            stats::run_delete(&cfg, &document_id).await?;
        }
        Commands::Stats => {
            stats::run_stats(&cfg).await?;
        }
        Commands::Export { output } => {
            export::run_export(&cfg, output.as_deref()).await?;
        }
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
    }

    Ok(())
}

async fn orchestrator(
    cfg: &Config,
    category: Option<String>,
) -> Result<(AnswerOrchestrator, SqliteIndex)> {
    let embedder = create_embedder(&cfg.embedding)?;
    let generator = create_generator(&cfg.llm)?;
    let index = SqliteIndex::open(cfg).await?;
    let filters = SearchFilters {
        category,
        ..SearchFilters::none()
    };
    filters.validate()?;
    let orchestrator = AnswerOrchestrator::new(cfg, embedder, Arc::new(index.clone()), generator)
        .with_filters(filters);
    Ok((orchestrator, index))
}

async fn run_ask(
    cfg: &Config,
    question: &str,
    session: &str,
    category: Option<String>,
) -> Result<()> {
    let (orchestrator, index) = orchestrator(cfg, category).await?;
    let answer = orchestrator
        .ask(question, session)
        .await
        .map_err(|e| anyhow::anyhow!(failure_message(&e)))?;

    println!("{}", answer.text);
    if !answer.context_found {
        eprintln!("(no relevant catalog context found)");
    }

    index.pool().close().await;
    Ok(())
}

/// Tell "backend unavailable" apart from other failures for the user.
fn failure_message(err: &RagError) -> String {
    match err {
        RagError::BackendTimeout { .. } => format!("could not answer: backend timed out ({})", err),
        e if e.is_backend_failure() => format!("could not answer: backend unavailable ({})", e),
        e => format!("could not answer: {}", e),
    }
}

async fn run_chat(cfg: &Config, session: &str, category: Option<String>) -> Result<()> {
    let (orchestrator, index) = orchestrator(cfg, category).await?;
    let stdin = std::io::stdin();
    let mut stdout = std::io::stdout();

    eprintln!("Ask about the course catalog. Type 'exit' to quit.");
    loop {
        write!(stdout, "> ")?;
        stdout.flush()?;

        let mut line = String::new();
        if stdin.lock().read_line(&mut line)? == 0 {
            break;
        }
        let question = line.trim();
        if question.is_empty() {
            continue;
        }
        if matches!(question.to_lowercase().as_str(), "exit" | "quit") {
            break;
        }

        match orchestrator.ask(question, session).await {
            Ok(answer) => println!("{}\n", answer.text),
            // The session is unchanged on failure; keep the loop going.
            Err(e) => eprintln!("{}\n", failure_message(&e)),
        }
    }

    index.pool().close().await;
    Ok(())
}

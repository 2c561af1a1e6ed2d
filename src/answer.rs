//! Answer orchestration: retrieval → prompt assembly → generation.
//!
//! Each call to [`AnswerOrchestrator::ask`] walks one session through
//!
//! ```text
//! Idle ──▶ Retrieving ──▶ ContextBuilding ──▶ Generating ──▶ Idle
//!              │                │                 │
//!              └────────────────┴─────────────────┴──▶ Failed
//! ```
//!
//! Backend calls run under [`with_retry`]: transient embedding and LLM
//! errors are retried with backoff, timeouts and permanent errors surface
//! immediately. The session's history is replaced only after generation
//! succeeds, so a failure at any stage leaves it exactly as it was.
//!
//! Sessions are independent: each has its own lock, held for the duration
//! of its own query only. The session table is bounded; the least recently
//! used session is dropped when it is full.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, error, info, trace};

use catalog_rag_core::context::{ContextManager, ConversationState};
use catalog_rag_core::embedding::Embedder;
use catalog_rag_core::llm::Generator;
use catalog_rag_core::models::{Role, Turn};
use catalog_rag_core::retrieve::Retriever;
use catalog_rag_core::store::{SearchFilters, VectorIndex};
use catalog_rag_core::{RagError, Result};

use crate::config::Config;
use crate::retry::{with_retry, RetryPolicy};

/// Reply used when retrieval finds nothing and generation is disabled for that case.
pub const NO_CONTEXT_ANSWER: &str =
    "I could not find anything in the course catalog about that. Try rephrasing the question \
     or asking about a specific course.";

/// Where a session is in the answer state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Idle,
    Retrieving,
    ContextBuilding,
    Generating,
    Failed,
}

/// A chunk that informed an answer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Source {
    pub document_id: String,
    pub chunk_id: String,
    pub title: Option<String>,
    pub score: f32,
}

/// The result of one orchestrated question.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Answer {
    pub session_id: String,
    pub text: String,
    /// False when retrieval found nothing relevant.
    pub context_found: bool,
    pub sources: Vec<Source>,
}

struct Session {
    state: ConversationState,
    phase: Phase,
}

struct SessionSlot {
    session: Arc<AsyncMutex<Session>>,
    last_used: u64,
}

/// Bounded table of per-session conversation state.
pub struct SessionStore {
    slots: Mutex<(HashMap<String, SessionSlot>, u64)>,
    max_sessions: usize,
    context: ContextManager,
}

impl SessionStore {
    pub fn new(max_sessions: usize, context: ContextManager) -> Self {
        Self {
            slots: Mutex::new((HashMap::new(), 0)),
            max_sessions: max_sessions.max(1),
            context,
        }
    }

    fn get(&self, session_id: &str) -> Result<Arc<AsyncMutex<Session>>> {
        let mut guard = self
            .slots
            .lock()
            .map_err(|_| RagError::index("sessions", "session table lock poisoned"))?;
        let (slots, clock) = &mut *guard;
        *clock += 1;
        let now = *clock;

        if let Some(slot) = slots.get_mut(session_id) {
            slot.last_used = now;
            return Ok(Arc::clone(&slot.session));
        }

        if slots.len() >= self.max_sessions {
            let oldest = slots
                .iter()
                .min_by_key(|(_, s)| s.last_used)
                .map(|(id, _)| id.clone());
            if let Some(id) = oldest {
                debug!(session = %id, "evicting least recently used session");
                slots.remove(&id);
            }
        }

        let session = Arc::new(AsyncMutex::new(Session {
            state: self.context.new_state(),
            phase: Phase::Idle,
        }));
        slots.insert(
            session_id.to_string(),
            SessionSlot {
                session: Arc::clone(&session),
                last_used: now,
            },
        );
        Ok(session)
    }

    fn peek(&self, session_id: &str) -> Option<Arc<AsyncMutex<Session>>> {
        self.slots
            .lock()
            .ok()
            .and_then(|g| g.0.get(session_id).map(|slot| Arc::clone(&slot.session)))
    }

    pub fn len(&self) -> usize {
        self.slots.lock().map(|g| g.0.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, session_id: &str) -> bool {
        self.slots
            .lock()
            .map(|g| g.0.contains_key(session_id))
            .unwrap_or(false)
    }

    pub fn remove(&self, session_id: &str) -> bool {
        self.slots
            .lock()
            .map(|mut g| g.0.remove(session_id).is_some())
            .unwrap_or(false)
    }
}

/// Sequences retrieval, prompt assembly, and generation for chat sessions.
pub struct AnswerOrchestrator {
    retriever: Retriever,
    context: ContextManager,
    generator: Arc<dyn Generator>,
    sessions: SessionStore,
    collection: String,
    top_k: usize,
    filters: SearchFilters,
    embed_retry: RetryPolicy,
    llm_retry: RetryPolicy,
    generate_without_context: bool,
}

impl AnswerOrchestrator {
    pub fn new(
        config: &Config,
        embedder: Arc<dyn Embedder>,
        index: Arc<dyn VectorIndex>,
        generator: Arc<dyn Generator>,
    ) -> Self {
        let context = ContextManager::new(config.conversation.limits());
        Self {
            retriever: Retriever::new(embedder, index).with_min_score(config.retrieval.min_score),
            sessions: SessionStore::new(config.conversation.max_sessions, context.clone()),
            context,
            generator,
            collection: config.index.collection.clone(),
            top_k: config.retrieval.top_k,
            filters: SearchFilters::none(),
            embed_retry: config.embedding.retry_policy(),
            llm_retry: config.llm.retry_policy(),
            generate_without_context: config.answer.generate_without_context,
        }
    }

    /// Restrict retrieval for every question (e.g. to one category).
    pub fn with_filters(mut self, filters: SearchFilters) -> Self {
        self.filters = filters;
        self
    }

    pub fn retriever(&self) -> &Retriever {
        &self.retriever
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    /// Answer `query` within `session_id`, updating that session's history on success.
    ///
    /// # Errors
    ///
    /// Backend failures (after retries), timeouts, and index errors. On
    /// error the session's history is unchanged and its phase is `Failed`.
    pub async fn ask(&self, query: &str, session_id: &str) -> Result<Answer> {
        let session = self.sessions.get(session_id)?;
        let mut session = session.lock().await;

        match self.run(query, session_id, &mut session).await {
            Ok((answer, next_state)) => {
                session.state = next_state;
                session.phase = Phase::Idle;
                info!(
                    session = session_id,
                    context_found = answer.context_found,
                    sources = answer.sources.len(),
                    "answered"
                );
                Ok(answer)
            }
            Err(e) => {
                error!(session = session_id, phase = ?session.phase, error = %e, "answer failed");
                session.phase = Phase::Failed;
                Err(e)
            }
        }
    }

    async fn run(
        &self,
        query: &str,
        session_id: &str,
        session: &mut Session,
    ) -> Result<(Answer, ConversationState)> {
        session.phase = Phase::Retrieving;
        let retrieval = with_retry(&self.embed_retry, "embed", || {
            self.retriever
                .retrieve(&self.collection, query, self.top_k, &self.filters)
        })
        .await?;
        debug!(session = session_id, hits = retrieval.len(), "retrieved");

        session.phase = Phase::ContextBuilding;
        let prompt = self.context.build_prompt(query, &retrieval, &session.state);
        let context_found = !prompt.context.is_empty();
        trace!(session = session_id, prompt = %prompt.render(), "prompt assembled");

        let text = if context_found || self.generate_without_context {
            session.phase = Phase::Generating;
            with_retry(&self.llm_retry, "generate", || self.generator.generate(&prompt)).await?
        } else {
            NO_CONTEXT_ANSWER.to_string()
        };

        let next = self.context.append_turn(&session.state, Role::User, query);
        let next = self.context.append_turn(&next, Role::Assistant, &text);

        let sources = prompt
            .context
            .iter()
            .map(|hit| Source {
                document_id: hit.chunk.document_id.clone(),
                chunk_id: hit.chunk.id.clone(),
                title: hit.chunk.title().map(str::to_string),
                score: hit.score,
            })
            .collect();

        Ok((
            Answer {
                session_id: session_id.to_string(),
                text,
                context_found,
                sources,
            },
            next,
        ))
    }

    /// A copy of a session's history, oldest first. Unknown sessions are empty.
    pub async fn history(&self, session_id: &str) -> Result<Vec<Turn>> {
        let Some(session) = self.sessions.peek(session_id) else {
            return Ok(Vec::new());
        };
        let session = session.lock().await;
        let turns = session.state.turns().cloned().collect();
        Ok(turns)
    }

    /// Where a session currently is in the state machine.
    pub async fn phase(&self, session_id: &str) -> Result<Phase> {
        let Some(session) = self.sessions.peek(session_id) else {
            return Ok(Phase::Idle);
        };
        let phase = session.lock().await.phase;
        Ok(phase)
    }

    /// Forget a session's history.
    pub fn reset(&self, session_id: &str) -> bool {
        self.sessions.remove(session_id)
    }
}

//! Conversation history and prompt assembly.
//!
//! [`ConversationState`] is a fixed-capacity ring buffer of [`Turn`]s: once
//! it holds `max_turns` turns, appending evicts the oldest. The
//! [`ContextManager`] merges a retrieval result and the most recent turns
//! with the new query into a [`Prompt`], trimming to a character budget.
//!
//! # Prompt layout
//!
//! ```text
//! system:    preamble, guidelines, COURSE CATALOG CONTEXT (Source 1..n)
//! user/assistant: last N history turns, oldest first
//! user:      the new question
//! ```
//!
//! # Truncation
//!
//! When the assembled prompt exceeds `max_prompt_chars`, the lowest
//! relevance chunk is dropped first, repeatedly; once no chunks remain the
//! oldest history turn is dropped. The preamble and the query are never
//! truncated, so a prompt may still exceed the budget when those alone do.

use std::collections::{HashSet, VecDeque};
use std::fmt::Write as _;

use serde::Serialize;

use crate::error::{RagError, Result};
use crate::models::{RetrievalResult, Role, ScoredChunk, Turn};

/// Bounded, ordered dialogue history of one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationState {
    turns: VecDeque<Turn>,
    max_turns: usize,
}

impl ConversationState {
    pub fn new(max_turns: usize) -> Self {
        Self {
            turns: VecDeque::with_capacity(max_turns.min(64)),
            max_turns,
        }
    }

    pub fn max_turns(&self) -> usize {
        self.max_turns
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    /// Turns from oldest to newest.
    pub fn turns(&self) -> impl Iterator<Item = &Turn> {
        self.turns.iter()
    }

    /// The most recent `n` turns, oldest first.
    pub fn recent(&self, n: usize) -> Vec<&Turn> {
        let skip = self.turns.len().saturating_sub(n);
        self.turns.iter().skip(skip).collect()
    }

    /// Append a turn, evicting the oldest turns beyond `max_turns`.
    pub fn push(&mut self, turn: Turn) {
        self.turns.push_back(turn);
        while self.turns.len() > self.max_turns {
            self.turns.pop_front();
        }
    }

    /// A copy of this state with `turn` appended.
    pub fn appended(&self, turn: Turn) -> Self {
        let mut next = self.clone();
        next.push(turn);
        next
    }
}

/// Limits applied when assembling prompts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextLimits {
    /// Capacity of each session's history ring buffer.
    pub max_turns: usize,
    /// How many recent turns are offered to the prompt.
    pub history_turns: usize,
    /// Character budget for the whole prompt.
    pub max_prompt_chars: usize,
}

impl Default for ContextLimits {
    fn default() -> Self {
        Self {
            max_turns: 20,
            history_turns: 6,
            max_prompt_chars: 12_000,
        }
    }
}

impl ContextLimits {
    /// # Errors
    ///
    /// Returns [`RagError::Config`] if any limit is zero.
    pub fn validate(&self) -> Result<()> {
        if self.max_turns == 0 {
            return Err(RagError::Config("conversation.max_turns must be > 0".to_string()));
        }
        if self.max_prompt_chars == 0 {
            return Err(RagError::Config(
                "conversation.max_prompt_chars must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// One message of a structured prompt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

/// A prompt ready for a generator, built fresh per query.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Prompt {
    pub messages: Vec<Message>,
    /// Chunks that made it into the prompt, most relevant first.
    #[serde(skip)]
    pub context: Vec<ScoredChunk>,
    /// History turns that made it into the prompt.
    pub history_used: usize,
    /// Whether the prompt was trimmed to fit the budget.
    pub truncated: bool,
}

impl Prompt {
    /// Total characters across all message contents.
    pub fn char_len(&self) -> usize {
        self.messages.iter().map(|m| m.content.chars().count()).sum()
    }

    /// The final user message.
    pub fn query(&self) -> Option<&str> {
        self.messages
            .last()
            .filter(|m| m.role == Role::User)
            .map(|m| m.content.as_str())
    }

    /// Flatten into a single text, for generators that take one string.
    pub fn render(&self) -> String {
        let mut out = String::new();
        let mut history = String::new();
        let body = &self.messages[..self.messages.len().saturating_sub(1)];
        for m in body {
            if m.role == Role::System {
                out.push_str(&m.content);
                out.push_str("\n\n");
            } else {
                let _ = writeln!(history, "{}: {}", m.role, m.content);
            }
        }
        out.push_str("CHAT HISTORY:\n");
        if history.is_empty() {
            out.push_str("(no chat history available)\n");
        } else {
            out.push_str(&history);
        }
        out.push_str("\nSTUDENT QUESTION:\n");
        out.push_str(self.query().unwrap_or_default());
        out.push('\n');
        out
    }
}

const PREAMBLE: &str = "You are a knowledgeable and friendly university assistant. \
Use the following course catalog information and any relevant reasoning to answer the student's question.";

const HISTORY_PRIORITY: &str = "IMPORTANT: If the chat history contains information that conflicts \
with the retrieved catalog context, prefer the chat history and act accordingly.";

const GUIDELINES: &str = "GUIDELINES:
- Only give answers relevant to the question, based on the catalog context and chat history.
- Never mention the source of the information in the answer.
- Do not open with greetings or pleasantries unless the student does first.
- Be clear, helpful, and concise.
- When possible, include course names, prerequisites, and details.
- If the answer cannot be found in the catalog or history, say so naturally.";

const NO_CONTEXT: &str = "(no retrieved documents)";

/// Merges retrieved chunks and history into prompts, and advances history.
#[derive(Debug, Clone, Default)]
pub struct ContextManager {
    limits: ContextLimits,
}

impl ContextManager {
    pub fn new(limits: ContextLimits) -> Self {
        Self { limits }
    }

    pub fn limits(&self) -> &ContextLimits {
        &self.limits
    }

    /// A fresh, empty history sized for these limits.
    pub fn new_state(&self) -> ConversationState {
        ConversationState::new(self.limits.max_turns)
    }

    /// Return `state` with one more turn appended.
    pub fn append_turn(&self, state: &ConversationState, role: Role, text: &str) -> ConversationState {
        state.appended(Turn::new(role, text))
    }

    /// Assemble the prompt for `query`.
    pub fn build_prompt(
        &self,
        query: &str,
        retrieval: &RetrievalResult,
        state: &ConversationState,
    ) -> Prompt {
        let mut seen = HashSet::new();
        let mut chunks: Vec<&ScoredChunk> = retrieval
            .iter()
            .filter(|h| seen.insert(h.chunk.id.as_str()))
            .collect();
        let mut history: Vec<&Turn> = state
            .recent(self.limits.history_turns)
            .into_iter()
            .filter(|t| t.role != Role::System)
            .collect();

        let mut truncated = false;
        let mut prompt = assemble(query, &chunks, &history, truncated);
        while prompt.char_len() > self.limits.max_prompt_chars {
            if chunks.pop().is_none() {
                if history.is_empty() {
                    break;
                }
                history.remove(0);
            }
            truncated = true;
            prompt = assemble(query, &chunks, &history, truncated);
        }
        prompt
    }
}

fn assemble(query: &str, chunks: &[&ScoredChunk], history: &[&Turn], truncated: bool) -> Prompt {
    let mut system = String::from(PREAMBLE);
    if !history.is_empty() {
        system.push('\n');
        system.push_str(HISTORY_PRIORITY);
    }
    system.push_str("\n\n");
    system.push_str(GUIDELINES);
    system.push_str("\n\nCOURSE CATALOG CONTEXT:\n");
    if chunks.is_empty() {
        system.push_str(NO_CONTEXT);
    } else {
        for (i, hit) in chunks.iter().enumerate() {
            if i > 0 {
                system.push_str("\n\n");
            }
            let title = hit
                .chunk
                .title()
                .map(str::to_string)
                .unwrap_or_else(|| format!("Doc {}", i + 1));
            let _ = write!(system, "Source {}: {}\n{}", i + 1, title, hit.chunk.text);
        }
    }

    let mut messages = Vec::with_capacity(history.len() + 2);
    messages.push(Message {
        role: Role::System,
        content: system,
    });
    messages.extend(history.iter().map(|t| Message {
        role: t.role,
        content: t.text.clone(),
    }));
    messages.push(Message {
        role: Role::User,
        content: query.to_string(),
    });

    Prompt {
        messages,
        context: chunks.iter().map(|h| (*h).clone()).collect(),
        history_used: history.len(),
        truncated,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ChunkKind, Document};
    use crate::segment::segment;

    fn hit(doc_id: &str, text: &str, score: f32) -> ScoredChunk {
        let doc = Document::new(doc_id, "t", text).with_title(format!("Title {}", doc_id));
        ScoredChunk {
            chunk: segment(&doc, 10_000, 0).unwrap().remove(0),
            score,
        }
    }

    fn manager(max_prompt_chars: usize) -> ContextManager {
        ContextManager::new(ContextLimits {
            max_turns: 10,
            history_turns: 4,
            max_prompt_chars,
        })
    }

    #[test]
    fn test_history_is_bounded_fifo() {
        let mut state = ConversationState::new(3);
        for i in 0..5 {
            state.push(Turn::user(format!("q{}", i)));
        }
        assert_eq!(state.len(), 3);
        let texts: Vec<&str> = state.turns().map(|t| t.text.as_str()).collect();
        assert_eq!(texts, vec!["q2", "q3", "q4"]);
    }

    #[test]
    fn test_appended_leaves_original_untouched() {
        let state = ConversationState::new(4);
        let next = state.appended(Turn::user("hi"));
        assert!(state.is_empty());
        assert_eq!(next.len(), 1);
    }

    #[test]
    fn test_prompt_layout() {
        let cm = manager(100_000);
        let retrieval = RetrievalResult {
            hits: vec![hit("cs101", "Intro to Systems — prereq: Math 101", 0.9)],
        };
        let state = cm
            .new_state()
            .appended(Turn::user("Is CS 101 offered in fall?"))
            .appended(Turn::assistant("Yes."));
        let prompt = cm.build_prompt("What is the prerequisite?", &retrieval, &state);

        assert_eq!(prompt.messages.len(), 4);
        assert_eq!(prompt.messages[0].role, Role::System);
        assert!(prompt.messages[0].content.contains("Source 1: Title cs101"));
        assert!(prompt.messages[0].content.contains("prereq: Math 101"));
        assert!(prompt.messages[0].content.contains("prefer the chat history"));
        assert_eq!(prompt.messages[1].role, Role::User);
        assert_eq!(prompt.messages[2].role, Role::Assistant);
        assert_eq!(prompt.query(), Some("What is the prerequisite?"));
        assert!(!prompt.truncated);
    }

    #[test]
    fn test_empty_retrieval_marker() {
        let cm = manager(100_000);
        let prompt = cm.build_prompt("hi", &RetrievalResult::empty(), &cm.new_state());
        assert!(prompt.messages[0].content.contains(NO_CONTEXT));
        assert!(!prompt.messages[0].content.contains("prefer the chat history"));
        assert!(prompt.context.is_empty());
        assert!(prompt.render().contains("(no chat history available)"));
    }

    #[test]
    fn test_chunks_deduplicated_in_relevance_order() {
        let cm = manager(100_000);
        let a = hit("a", "alpha", 0.9);
        let b = hit("b", "beta", 0.8);
        let retrieval = RetrievalResult {
            hits: vec![a.clone(), b, a],
        };
        let prompt = cm.build_prompt("q", &retrieval, &cm.new_state());
        let ids: Vec<&str> = prompt.context.iter().map(|h| h.chunk.document_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[test]
    fn test_only_recent_turns_offered() {
        let cm = manager(100_000);
        let mut state = cm.new_state();
        for i in 0..8 {
            state.push(Turn::user(format!("turn {}", i)));
        }
        let prompt = cm.build_prompt("q", &RetrievalResult::empty(), &state);
        assert_eq!(prompt.history_used, 4);
        assert_eq!(prompt.messages[1].content, "turn 4");
    }

    #[test]
    fn test_truncation_drops_low_relevance_chunks_first() {
        let long = "x".repeat(400);
        let retrieval = RetrievalResult {
            hits: vec![hit("high", &long, 0.9), hit("low", &long, 0.1)],
        };
        let cm0 = manager(100_000);
        let state = cm0.new_state().appended(Turn::user("earlier question"));
        let full = cm0.build_prompt("q", &retrieval, &state).char_len();

        // Budget that fits everything except one chunk.
        let cm = manager(full - 100);
        let prompt = cm.build_prompt("q", &retrieval, &state);
        assert!(prompt.truncated);
        assert_eq!(prompt.context.len(), 1);
        assert_eq!(prompt.context[0].chunk.document_id, "high");
        assert_eq!(prompt.history_used, 1);
    }

    #[test]
    fn test_truncation_then_drops_oldest_turns_never_query() {
        let retrieval = RetrievalResult {
            hits: vec![hit("a", &"y".repeat(300), 0.5)],
        };
        let cm = manager(10);
        let state = cm
            .new_state()
            .appended(Turn::user("old"))
            .appended(Turn::assistant("older answer"));
        let query = "a fairly long question that alone exceeds the budget";
        let prompt = cm.build_prompt(query, &retrieval, &state);
        assert!(prompt.context.is_empty());
        assert_eq!(prompt.history_used, 0);
        assert_eq!(prompt.query(), Some(query));
    }

    #[test]
    fn test_table_chunk_rendered_verbatim() {
        let doc = Document::new("cs_table_0", "t", "| a | b |\n| --- | --- |\n| 1 | 2 |")
            .with_kind(ChunkKind::Table);
        let chunk = segment(&doc, 5, 1).unwrap().remove(0);
        let cm = manager(100_000);
        let prompt = cm.build_prompt(
            "q",
            &RetrievalResult {
                hits: vec![ScoredChunk { chunk, score: 0.4 }],
            },
            &cm.new_state(),
        );
        assert!(prompt.messages[0].content.contains("Source 1: Doc 1\n| a | b |"));
    }

    #[test]
    fn test_limits_validate() {
        assert!(ContextLimits::default().validate().is_ok());
        let bad = ContextLimits {
            max_turns: 0,
            ..Default::default()
        };
        assert!(matches!(bad.validate(), Err(RagError::Config(_))));
    }
}

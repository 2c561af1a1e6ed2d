//! Generator capability: the language model behind the answer orchestrator.
//!
//! The core's contract with a model is purely [`Prompt`] → text. Concrete
//! backends (OpenAI-compatible chat completions, Ollama) live in the app
//! crate and are selected from configuration at startup.

use async_trait::async_trait;

use crate::context::Prompt;
use crate::error::Result;

/// A backend that produces an answer for a prompt.
#[async_trait]
pub trait Generator: Send + Sync {
    /// Identifier used in logs and errors (e.g. `"openai:mistral-7b"`).
    fn name(&self) -> &str;

    /// Generate a reply. A failure must leave no side effects.
    async fn generate(&self, prompt: &Prompt) -> Result<String>;
}

/// Generator that answers with the retrieved context itself.
///
/// Used when no model backend is configured: the reply lists the most
/// relevant passages verbatim so the catalog stays searchable offline.
#[derive(Debug, Clone, Default)]
pub struct ExtractiveGenerator;

#[async_trait]
impl Generator for ExtractiveGenerator {
    fn name(&self) -> &str {
        "extractive"
    }

    async fn generate(&self, prompt: &Prompt) -> Result<String> {
        if prompt.context.is_empty() {
            return Ok("I could not find anything in the course catalog about that.".to_string());
        }
        let passages: Vec<String> = prompt
            .context
            .iter()
            .map(|hit| match hit.chunk.title() {
                Some(title) => format!("{}: {}", title, hit.chunk.text.trim()),
                None => hit.chunk.text.trim().to_string(),
            })
            .collect();
        Ok(format!(
            "From the course catalog:\n\n{}",
            passages.join("\n\n")
        ))
    }
}

//! Concrete language model backends.
//!
//! | `llm.provider` | Generator |
//! |----------------|-----------|
//! | `"openai"` | [`OpenAiChat`], OpenAI-compatible `POST {base}/chat/completions` |
//! | `"ollama"` | [`OllamaChat`], local `POST {url}/api/chat` |
//! | `"disabled"` | [`ExtractiveGenerator`], quotes the retrieved passages |
//!
//! Like the embedding backends, each call makes a single request and
//! reports failures as [`RagError::LlmBackend`] with the HTTP status; retry
//! and timeout are applied by the answer orchestrator.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde_json::{json, Value};

use catalog_rag_core::context::Prompt;
use catalog_rag_core::llm::{ExtractiveGenerator, Generator};
use catalog_rag_core::RagError;

use crate::config::LlmConfig;

/// OpenRouter serves the default model; any OpenAI-compatible host works.
const OPENAI_DEFAULT_BASE: &str = "https://openrouter.ai/api/v1";
const OPENAI_DEFAULT_MODEL: &str = "mistralai/mistral-7b-instruct:free";
const OLLAMA_DEFAULT_URL: &str = "http://localhost:11434";

/// Build the generator named by `config.provider`.
pub fn create_generator(config: &LlmConfig) -> Result<Arc<dyn Generator>> {
    match config.provider.as_str() {
        "openai" => Ok(Arc::new(OpenAiChat::new(config)?)),
        "ollama" => Ok(Arc::new(OllamaChat::new(config)?)),
        "disabled" => Ok(Arc::new(ExtractiveGenerator)),
        other => bail!("Unknown llm provider: {}", other),
    }
}

fn http_client(config: &LlmConfig) -> Result<reqwest::Client> {
    Ok(reqwest::Client::builder()
        .timeout(Duration::from_secs(config.timeout_secs))
        .build()?)
}

fn messages_json(prompt: &Prompt) -> Vec<Value> {
    prompt
        .messages
        .iter()
        .map(|m| json!({ "role": m.role.as_str(), "content": m.content }))
        .collect()
}

async fn status_error(provider: &str, response: reqwest::Response) -> RagError {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    RagError::LlmBackend {
        provider: provider.to_string(),
        status: Some(status.as_u16()),
        message: format!("API error {}: {}", status, body),
    }
}

// ============ OpenAI-compatible ============

/// Chat completions on an OpenAI-compatible host.
///
/// The base URL is `llm.url`, else `OPENAI_API_BASE`, else OpenRouter.
/// Requires `OPENAI_API_KEY`.
pub struct OpenAiChat {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    temperature: f32,
    name: String,
}

impl OpenAiChat {
    pub fn new(config: &LlmConfig) -> Result<Self> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| anyhow::anyhow!("OPENAI_API_KEY environment variable not set"))?;
        let base_url = config
            .url
            .clone()
            .or_else(|| std::env::var("OPENAI_API_BASE").ok())
            .unwrap_or_else(|| OPENAI_DEFAULT_BASE.to_string());
        let model = config
            .model
            .clone()
            .unwrap_or_else(|| OPENAI_DEFAULT_MODEL.to_string());

        Ok(Self {
            client: http_client(config)?,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            name: format!("openai:{}", model),
            model,
            temperature: config.temperature,
        })
    }
}

#[async_trait]
impl Generator for OpenAiChat {
    fn name(&self) -> &str {
        &self.name
    }

    async fn generate(&self, prompt: &Prompt) -> catalog_rag_core::Result<String> {
        let body = json!({
            "model": self.model,
            "messages": messages_json(prompt),
            "temperature": self.temperature,
        });

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| RagError::llm("openai", e.to_string()))?;

        if !response.status().is_success() {
            return Err(status_error("openai", response).await);
        }

        let json: Value = response
            .json()
            .await
            .map_err(|e| RagError::llm("openai", e.to_string()))?;
        parse_openai_reply(&json)
    }
}

fn parse_openai_reply(json: &Value) -> catalog_rag_core::Result<String> {
    json.pointer("/choices/0/message/content")
        .and_then(Value::as_str)
        .map(|s| s.trim().to_string())
        .ok_or_else(|| RagError::llm("openai", "invalid response: missing choices[0].message.content"))
}

// ============ Ollama ============

/// Chat on a local Ollama instance (`ollama pull mistral`).
pub struct OllamaChat {
    client: reqwest::Client,
    url: String,
    model: String,
    temperature: f32,
    name: String,
}

impl OllamaChat {
    pub fn new(config: &LlmConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("llm.model required for Ollama provider"))?;
        let url = config
            .url
            .clone()
            .unwrap_or_else(|| OLLAMA_DEFAULT_URL.to_string());

        Ok(Self {
            client: http_client(config)?,
            url: url.trim_end_matches('/').to_string(),
            name: format!("ollama:{}", model),
            model,
            temperature: config.temperature,
        })
    }
}

#[async_trait]
impl Generator for OllamaChat {
    fn name(&self) -> &str {
        &self.name
    }

    async fn generate(&self, prompt: &Prompt) -> catalog_rag_core::Result<String> {
        let body = json!({
            "model": self.model,
            "messages": messages_json(prompt),
            "stream": false,
            "options": { "temperature": self.temperature },
        });

        let response = self
            .client
            .post(format!("{}/api/chat", self.url))
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                RagError::llm(
                    "ollama",
                    format!("connection error (is Ollama running at {}?): {}", self.url, e),
                )
            })?;

        if !response.status().is_success() {
            return Err(status_error("ollama", response).await);
        }

        let json: Value = response
            .json()
            .await
            .map_err(|e| RagError::llm("ollama", e.to_string()))?;
        json.pointer("/message/content")
            .and_then(Value::as_str)
            .map(|s| s.trim().to_string())
            .ok_or_else(|| RagError::llm("ollama", "invalid response: missing message.content"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use catalog_rag_core::context::ContextManager;
    use catalog_rag_core::models::RetrievalResult;

    #[test]
    fn test_parse_openai_reply() {
        let json = json!({"choices": [{"message": {"role": "assistant", "content": " Math 101. "}}]});
        assert_eq!(parse_openai_reply(&json).unwrap(), "Math 101.");
        assert!(parse_openai_reply(&json!({"choices": []})).is_err());
    }

    #[test]
    fn test_messages_json_roles() {
        let cm = ContextManager::default();
        let prompt = cm.build_prompt("hello", &RetrievalResult::empty(), &cm.new_state());
        let msgs = messages_json(&prompt);
        assert_eq!(msgs.first().unwrap()["role"], "system");
        assert_eq!(msgs.last().unwrap()["role"], "user");
        assert_eq!(msgs.last().unwrap()["content"], "hello");
    }

    #[test]
    fn test_disabled_is_extractive() {
        let generator = create_generator(&LlmConfig::default()).unwrap();
        assert_eq!(generator.name(), "extractive");
    }

    #[test]
    fn test_ollama_requires_model() {
        let config = LlmConfig {
            provider: "ollama".into(),
            ..Default::default()
        };
        assert!(create_generator(&config).is_err());
    }
}

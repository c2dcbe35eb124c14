//! Text generation over an OpenAI-compatible chat API with model fallback.
//!
//! # Architecture
//!
//! - [`TextGenerator`]: core trait for one chat completion against one model
//! - [`OpenRouterClient`]: the OpenRouter implementation
//! - [`ModelCascade`]: decorator that walks an ordered model list, moving on
//!   whenever a model fails
//!
//! # Cascade Strategy
//!
//! - Primary model first, then the fallback list in order, duplicates removed
//! - Every failed attempt is logged with its elapsed time and the next model tried
//! - Exhausting the list returns [`CascadeExhausted`] naming every model tried

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::{error, info, instrument, warn};

use crate::utils::truncate_for_log;

const OPENROUTER_API_URL: &str = "https://openrouter.ai/api/v1";

pub const DEFAULT_MODEL: &str = "qwen/qwen-2-7b-instruct:free";

/// Tried in order after the primary model.
pub const FALLBACK_MODELS: &[&str] = &[
    "google/gemma-7b-it:free",
    "mistralai/mistral-7b-instruct:free",
    "meta-llama/llama-3.1-8b-instruct",
];

const MAX_TOKENS: u32 = 300;
const TEMPERATURE: f32 = 0.8;
const STOP_SEQUENCES: &[&str] = &[
    "</s>",
    "[/s]",
    "[/INST]",
    "[/B_INST]",
    "[B_Assitant]",
    "<|im_end|>",
    "\n\n\n",
];

#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("{status} - {message}")]
    Upstream { status: u16, message: String },
}

/// Every model in the cascade failed.
#[derive(Debug, Error)]
#[error("all models failed ({}); last error: {last_error}", tried.join(", "))]
pub struct CascadeExhausted {
    pub tried: Vec<String>,
    pub last_error: String,
}

/// One chat completion against a named model.
#[async_trait]
pub trait TextGenerator: Send + Sync {
    async fn complete(&self, model: &str, system: &str, prompt: &str)
    -> Result<String, GenerationError>;
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    max_tokens: u32,
    temperature: f32,
    stop: &'a [&'a str],
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: Option<String>,
}

/// Pull `error.message` out of an error body, if it has one.
fn upstream_message(body: &str) -> String {
    serde_json::from_str::<ErrorEnvelope>(body)
        .ok()
        .and_then(|e| e.error.message)
        .unwrap_or_else(|| "Unknown error".to_string())
}

pub struct OpenRouterClient {
    http: reqwest::Client,
    api_key: String,
}

impl fmt::Debug for OpenRouterClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpenRouterClient").finish_non_exhaustive()
    }
}

impl OpenRouterClient {
    pub fn new(http: reqwest::Client, api_key: &str) -> Self {
        Self {
            http,
            api_key: api_key.to_string(),
        }
    }
}

#[async_trait]
impl TextGenerator for OpenRouterClient {
    async fn complete(
        &self,
        model: &str,
        system: &str,
        prompt: &str,
    ) -> Result<String, GenerationError> {
        let request = ChatRequest {
            model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: system,
                },
                ChatMessage {
                    role: "user",
                    content: prompt,
                },
            ],
            max_tokens: MAX_TOKENS,
            temperature: TEMPERATURE,
            stop: STOP_SEQUENCES,
        };

        let resp = self
            .http
            .post(format!("{OPENROUTER_API_URL}/chat/completions"))
            .bearer_auth(&self.api_key)
            .header("HTTP-Referer", "http://localhost:8000")
            .header("X-Title", "Earth's Pulse - City Sentiment Analysis")
            .json(&request)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(GenerationError::Upstream {
                status: status.as_u16(),
                message: upstream_message(&body),
            });
        }

        let chat: ChatResponse = resp.json().await?;
        Ok(chat
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .unwrap_or_default())
    }
}

/// Decorator that tries each model in order until one succeeds.
pub struct ModelCascade {
    inner: Arc<dyn TextGenerator>,
    models: Vec<String>,
}

impl fmt::Debug for ModelCascade {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelCascade")
            .field("models", &self.models)
            .finish()
    }
}

impl ModelCascade {
    /// `primary` first, then `fallbacks` minus anything already listed.
    pub fn new(inner: Arc<dyn TextGenerator>, primary: &str, fallbacks: &[&str]) -> Self {
        let mut models = vec![primary.to_string()];
        for m in fallbacks {
            if !models.iter().any(|existing| existing == m) {
                models.push(m.to_string());
            }
        }
        Self { inner, models }
    }

    pub fn models(&self) -> &[String] {
        &self.models
    }

    #[instrument(level = "info", skip_all)]
    pub async fn complete(&self, system: &str, prompt: &str) -> Result<String, CascadeExhausted> {
        let total_t0 = Instant::now();
        let mut last_error = String::new();

        for model in &self.models {
            let attempt_t0 = Instant::now();
            match self.inner.complete(model, system, prompt).await {
                Ok(text) => {
                    info!(
                        %model,
                        elapsed_ms = attempt_t0.elapsed().as_millis() as u64,
                        response_preview = %truncate_for_log(&text, 120),
                        "Generated text"
                    );
                    return Ok(text);
                }
                Err(e) => {
                    last_error = format!("Model {model} failed: {e}");
                    warn!(
                        %model,
                        elapsed_ms = attempt_t0.elapsed().as_millis() as u64,
                        error = %e,
                        "Model attempt failed; trying next"
                    );
                }
            }
        }

        error!(
            tried = self.models.len(),
            elapsed_ms_total = total_t0.elapsed().as_millis() as u64,
            %last_error,
            "All models failed"
        );
        Err(CascadeExhausted {
            tried: self.models.clone(),
            last_error,
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Generator that fails for the listed models and records every call.
    pub(crate) struct ScriptedGenerator {
        pub failing: Vec<String>,
        pub reply: String,
        pub calls: Mutex<Vec<String>>,
    }

    impl ScriptedGenerator {
        pub(crate) fn new(failing: &[&str], reply: &str) -> Self {
            Self {
                failing: failing.iter().map(|s| s.to_string()).collect(),
                reply: reply.to_string(),
                calls: Mutex::new(Vec::new()),
            }
        }

        pub(crate) fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl TextGenerator for ScriptedGenerator {
        async fn complete(
            &self,
            model: &str,
            _system: &str,
            _prompt: &str,
        ) -> Result<String, GenerationError> {
            self.calls.lock().unwrap().push(model.to_string());
            if self.failing.iter().any(|m| m == model) {
                return Err(GenerationError::Upstream {
                    status: 429,
                    message: "rate limited".to_string(),
                });
            }
            Ok(self.reply.clone())
        }
    }

    #[test]
    fn test_cascade_dedups_models() {
        let generator = Arc::new(ScriptedGenerator::new(&[], "ok"));
        let cascade = ModelCascade::new(generator, "google/gemma-7b-it:free", FALLBACK_MODELS);
        assert_eq!(cascade.models().len(), 3);
        assert_eq!(cascade.models()[0], "google/gemma-7b-it:free");
    }

    #[tokio::test]
    async fn test_cascade_falls_through_to_next_model() {
        let generator = Arc::new(ScriptedGenerator::new(&[DEFAULT_MODEL], "calm skies"));
        let cascade = ModelCascade::new(generator.clone(), DEFAULT_MODEL, FALLBACK_MODELS);
        let text = cascade.complete("sys", "prompt").await.unwrap();
        assert_eq!(text, "calm skies");
        assert_eq!(generator.calls(), vec![DEFAULT_MODEL, FALLBACK_MODELS[0]]);
    }

    #[tokio::test]
    async fn test_cascade_exhausted_lists_models() {
        let all: Vec<&str> = std::iter::once(DEFAULT_MODEL)
            .chain(FALLBACK_MODELS.iter().copied())
            .collect();
        let generator = Arc::new(ScriptedGenerator::new(&all, ""));
        let cascade = ModelCascade::new(generator, DEFAULT_MODEL, FALLBACK_MODELS);
        let err = cascade.complete("sys", "prompt").await.unwrap_err();
        assert_eq!(err.tried.len(), 4);
        assert!(err.last_error.contains("meta-llama/llama-3.1-8b-instruct"));
        assert!(err.last_error.contains("429"));
    }

    #[test]
    fn test_upstream_message() {
        assert_eq!(
            upstream_message(r#"{"error":{"message":"No endpoints found"}}"#),
            "No endpoints found"
        );
        assert_eq!(upstream_message("<html>"), "Unknown error");
    }
}

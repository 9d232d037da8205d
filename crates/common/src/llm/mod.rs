//! Chat-completion provider abstraction
//!
//! Provides:
//! - [`LlmClient`], one raw completion call
//! - [`GuardedLlm`], the client paired with the outbound guard so every call
//!   honours its kind's timeout / retry / token contract
//! - [`OpenAIChatClient`] for OpenAI-compatible endpoints
//! - [`ScriptedLlm`], a programmable client for tests and local runs

use crate::config::{CallPolicy, LlmConfig};
use crate::errors::{AppError, Result};
use crate::resilience::{CallKind, OutboundGuard};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};

/// One generation request
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionRequest {
    pub kind: CallKind,
    pub system: String,
    pub prompt: String,
    pub max_tokens: usize,
    pub temperature: f32,
    pub top_p: f32,
}

impl CompletionRequest {
    /// Deterministic request (temperature 0)
    pub fn new(kind: CallKind, system: impl Into<String>, prompt: impl Into<String>, max_tokens: usize) -> Self {
        Self {
            kind,
            system: system.into(),
            prompt: prompt.into(),
            max_tokens,
            temperature: 0.0,
            top_p: 1.0,
        }
    }

    pub fn with_sampling(mut self, temperature: f32, top_p: f32) -> Self {
        self.temperature = temperature;
        self.top_p = top_p;
        self
    }
}

/// Generated text plus usage counts
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Completion {
    pub text: String,
    pub prompt_tokens: usize,
    pub completion_tokens: usize,
}

/// Trait for chat completion
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Single attempt, no retries
    async fn complete(&self, request: &CompletionRequest) -> Result<Completion>;

    /// Get the model name
    fn model_name(&self) -> &str;
}

/// LLM client behind the outbound guard
#[derive(Clone)]
pub struct GuardedLlm {
    client: Arc<dyn LlmClient>,
    guard: OutboundGuard,
}

impl GuardedLlm {
    pub fn new(client: Arc<dyn LlmClient>, guard: OutboundGuard) -> Self {
        Self { client, guard }
    }

    /// Complete under `policy`. The policy's token ceiling caps the request.
    pub async fn complete(&self, policy: &CallPolicy, mut request: CompletionRequest) -> Result<Completion> {
        if policy.max_tokens > 0 {
            request.max_tokens = request.max_tokens.min(policy.max_tokens).max(1);
        }
        let client = &self.client;
        let request = &request;
        self.guard
            .call(request.kind, policy, || client.complete(request))
            .await
    }

    pub fn model_name(&self) -> &str {
        self.client.model_name()
    }
}

// =============================================================================
// OpenAI-compatible chat client
// =============================================================================

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    max_tokens: usize,
    temperature: f32,
    top_p: f32,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessageResponse,
}

#[derive(Deserialize)]
struct ChatMessageResponse {
    content: Option<String>,
}

#[derive(Deserialize, Default)]
struct ChatUsage {
    prompt_tokens: usize,
    completion_tokens: usize,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<ChatUsage>,
}

/// OpenAI chat completions client
pub struct OpenAIChatClient {
    client: reqwest::Client,
    api_key: String,
    model: String,
    endpoint: String,
}

impl OpenAIChatClient {
    pub fn new(config: &LlmConfig) -> Result<Self> {
        let api_key = config.api_key.clone().ok_or_else(|| AppError::Configuration {
            message: "llm.api_key is required for the openai provider".to_string(),
        })?;
        let base = config
            .api_base
            .clone()
            .unwrap_or_else(|| "https://api.openai.com/v1".to_string());

        Ok(Self {
            client: reqwest::Client::builder().build()?,
            api_key,
            model: config.model.clone(),
            endpoint: format!("{}/chat/completions", base.trim_end_matches('/')),
        })
    }
}

#[async_trait]
impl LlmClient for OpenAIChatClient {
    async fn complete(&self, request: &CompletionRequest) -> Result<Completion> {
        let body = ChatRequest {
            model: &self.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: &request.system,
                },
                ChatMessage {
                    role: "user",
                    content: &request.prompt,
                },
            ],
            max_tokens: request.max_tokens,
            temperature: request.temperature,
            top_p: request.top_p,
        };

        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(AppError::Upstream {
                status: status.as_u16(),
                message,
            });
        }

        let parsed: ChatResponse = response.json().await?;
        let usage = parsed.usage.unwrap_or_default();
        let text = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| AppError::Upstream {
                status: status.as_u16(),
                message: "completion contained no choices".to_string(),
            })?;

        Ok(Completion {
            text,
            prompt_tokens: usage.prompt_tokens,
            completion_tokens: usage.completion_tokens,
        })
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

// =============================================================================
// Scripted client
// =============================================================================

type Responder = dyn Fn(&CompletionRequest) -> Result<String> + Send + Sync;

/// Client answering from a closure; records every request it sees
pub struct ScriptedLlm {
    responder: Box<Responder>,
    requests: Mutex<Vec<CompletionRequest>>,
}

impl ScriptedLlm {
    pub fn new<F>(responder: F) -> Self
    where
        F: Fn(&CompletionRequest) -> Result<String> + Send + Sync + 'static,
    {
        Self {
            responder: Box::new(responder),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Requests received so far
    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }

    /// Number of requests of one kind
    pub fn calls(&self, kind: CallKind) -> usize {
        self.requests().iter().filter(|r| r.kind == kind).count()
    }
}

#[async_trait]
impl LlmClient for ScriptedLlm {
    async fn complete(&self, request: &CompletionRequest) -> Result<Completion> {
        if let Ok(mut seen) = self.requests.lock() {
            seen.push(request.clone());
        }
        let text = (self.responder)(request)?;
        Ok(Completion {
            prompt_tokens: crate::text::estimate_tokens(&request.prompt),
            completion_tokens: crate::text::estimate_tokens(&text),
            text,
        })
    }

    fn model_name(&self) -> &str {
        "scripted"
    }
}

/// Create an LLM client based on configuration
pub fn create_llm_client(config: &LlmConfig) -> Result<Arc<dyn LlmClient>> {
    match config.provider.as_str() {
        "openai" => Ok(Arc::new(OpenAIChatClient::new(config)?)),
        other => Err(AppError::Configuration {
            message: format!("unknown llm provider: {}", other),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_guarded_call_caps_tokens_and_records() {
        let scripted = Arc::new(ScriptedLlm::new(|req| Ok(format!("tokens={}", req.max_tokens))));
        let llm = GuardedLlm::new(scripted.clone(), OutboundGuard::unlimited());
        let policy = CallPolicy::new(1_000, 0, 16);

        let completion = llm
            .complete(
                &policy,
                CompletionRequest::new(CallKind::Classification, "sys", "route this", 500),
            )
            .await
            .unwrap();

        assert_eq!(completion.text, "tokens=16");
        assert_eq!(scripted.calls(CallKind::Classification), 1);
        assert_eq!(scripted.calls(CallKind::Synthesis), 0);
    }

    #[tokio::test]
    async fn test_scripted_errors_propagate() {
        let scripted = ScriptedLlm::new(|_| {
            Err(AppError::Upstream {
                status: 400,
                message: "rejected".into(),
            })
        });
        let request = CompletionRequest::new(CallKind::Synthesis, "sys", "prompt", 10);
        assert!(scripted.complete(&request).await.is_err());
    }

    #[test]
    fn test_unknown_provider_rejected() {
        for provider in ["carrier-pigeon", "scripted"] {
            let config = LlmConfig {
                provider: provider.to_string(),
                ..LlmConfig::default()
            };
            assert!(create_llm_client(&config).is_err(), "{provider}");
        }
    }
}

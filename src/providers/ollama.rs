//! Local inference through an Ollama server's `/api/chat` endpoint.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::error::AiError;
use crate::providers::{AiProvider, AiRequest};

const PROVIDER: &str = "ollama";

pub struct OllamaProvider {
    base_url: String,
    model: String,
    temperature: f64,
    max_tokens: u64,
    client: Client,
}

// ─── Request Structures ───────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    stream: bool,
    options: Options,
}

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Serialize)]
struct Options {
    temperature: f64,
    num_predict: u64,
}

// ─── Response Structures ──────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct ApiChatResponse {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: String,
}

// ─── Implementation ───────────────────────────────────────────────────────────

impl OllamaProvider {
    pub fn new(base_url: Option<&str>, model: &str, temperature: f64, max_tokens: u64) -> Self {
        Self {
            base_url: base_url
                .unwrap_or("http://localhost:11434")
                .trim_end_matches('/')
                .to_string(),
            model: model.to_string(),
            temperature,
            max_tokens,
            client: Client::builder()
                .connect_timeout(std::time::Duration::from_secs(10))
                .build()
                .unwrap_or_else(|_| Client::new()),
        }
    }

    fn build_request(&self, request: &AiRequest) -> ChatRequest {
        let mut messages = Vec::with_capacity(request.transcript.len() + 1);
        if let Some(system) = &request.system {
            messages.push(ChatMessage {
                role: "system".into(),
                content: system.clone(),
            });
        }
        messages.extend(request.transcript.iter().map(|m| ChatMessage {
            role: m.role.as_str().into(),
            content: m.content.clone(),
        }));
        ChatRequest {
            model: self.model.clone(),
            messages,
            stream: false,
            options: Options {
                temperature: self.temperature,
                num_predict: self.max_tokens,
            },
        }
    }
}

fn status_error(status: u16, body: &str) -> AiError {
    let reason = format!("HTTP {status}: {}", body.chars().take(200).collect::<String>());
    match status {
        429 => AiError::Quota {
            provider: PROVIDER.into(),
            reason,
        },
        400 | 404 | 422 => AiError::InvalidRequest {
            provider: PROVIDER.into(),
            reason,
        },
        _ => AiError::RequestFailed {
            provider: PROVIDER.into(),
            reason,
        },
    }
}

#[async_trait]
impl AiProvider for OllamaProvider {
    fn name(&self) -> &str {
        PROVIDER
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    async fn generate_reply(&self, request: &AiRequest) -> Result<String, AiError> {
        let body = self.build_request(request);
        let url = format!("{}/api/chat", self.base_url);

        tracing::debug!(
            url = %url,
            model = %self.model,
            message_count = body.messages.len(),
            "Ollama request"
        );

        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| AiError::RequestFailed {
                provider: PROVIDER.into(),
                reason: format!("request failed: {e}. Is Ollama running?"),
            })?;

        let status = response.status();
        let bytes = response.bytes().await.map_err(|e| AiError::RequestFailed {
            provider: PROVIDER.into(),
            reason: format!("failed to read response: {e}"),
        })?;

        if !status.is_success() {
            let raw = String::from_utf8_lossy(&bytes);
            tracing::error!(status = status.as_u16(), "Ollama error response");
            return Err(status_error(status.as_u16(), &raw));
        }

        let chat: ApiChatResponse =
            serde_json::from_slice(&bytes).map_err(|e| AiError::RequestFailed {
                provider: PROVIDER.into(),
                reason: format!("failed to parse response: {e}"),
            })?;
        Ok(chat.message.content)
    }
}

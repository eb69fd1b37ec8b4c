//! Provider interfaces for the messaging channel and the AI backend.
//!
//! Supports:
//! - **Twilio**: WhatsApp/SMS delivery through the Messages REST API
//! - **Log**: writes outbound text to the log (development default)
//! - **Anthropic** / **OpenAI**: hosted completion via rig-core
//! - **Ollama**: local inference over `/api/chat`
//!
//! The pipeline only sees the `MessagingProvider` and `AiProvider` traits;
//! concrete adapters are picked by name at startup.

pub mod log_sink;
pub mod ollama;
mod rig_adapter;
pub mod twilio;

pub use log_sink::LogSink;
pub use ollama::OllamaProvider;
pub use rig_adapter::RigAdapter;
pub use twilio::TwilioProvider;

use std::sync::Arc;

use async_trait::async_trait;
use rig::client::CompletionClient;
use secrecy::ExposeSecret;
use serde::Serialize;

use crate::config::{AiBackend, AiConfig, MessagingConfig};
use crate::error::{AiError, ConfigError, MessagingError, ValidationError};
use crate::pipeline::types::{InboundEvent, RawPayload, parse_timestamp, payload_first};

// ── AI ──────────────────────────────────────────────────────────────

/// Speaker of a transcript entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// The customer.
    User,
    /// Us: AI, fallback or operator replies.
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

/// One role-tagged transcript entry.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TranscriptMessage {
    pub role: Role,
    pub content: String,
}

impl TranscriptMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// A provider-agnostic reply request: system instruction plus ordered transcript.
#[derive(Debug, Clone, Default)]
pub struct AiRequest {
    pub system: Option<String>,
    /// Oldest first; the last entry is normally the message being answered.
    pub transcript: Vec<TranscriptMessage>,
}

/// Text generation backend.
#[async_trait]
pub trait AiProvider: Send + Sync {
    /// Short provider name for logs and errors.
    fn name(&self) -> &str;

    /// Model identifier.
    fn model_name(&self) -> &str;

    /// Generate one reply. Timeouts are applied by the caller.
    async fn generate_reply(&self, request: &AiRequest) -> Result<String, AiError>;
}

/// Classify a transport error message into the AI error taxonomy.
pub(crate) fn classify_ai_error(provider: &str, message: &str) -> AiError {
    let lowered = message.to_lowercase();
    if lowered.contains("429")
        || lowered.contains("rate limit")
        || lowered.contains("rate_limit")
        || lowered.contains("quota")
        || lowered.contains("insufficient")
    {
        AiError::Quota {
            provider: provider.to_string(),
            reason: message.to_string(),
        }
    } else if lowered.contains("400")
        || lowered.contains("invalid_request")
        || lowered.contains("invalid request")
        || lowered.contains("401")
        || lowered.contains("unauthorized")
    {
        AiError::InvalidRequest {
            provider: provider.to_string(),
            reason: message.to_string(),
        }
    } else {
        AiError::RequestFailed {
            provider: provider.to_string(),
            reason: message.to_string(),
        }
    }
}

/// Create the configured AI provider.
pub fn create_ai_provider(config: &AiConfig) -> Result<Arc<dyn AiProvider>, ConfigError> {
    match config.backend {
        AiBackend::Anthropic => create_anthropic_provider(config),
        AiBackend::OpenAi => create_openai_provider(config),
        AiBackend::Ollama => {
            tracing::info!("Using Ollama (model: {})", config.model);
            Ok(Arc::new(OllamaProvider::new(
                config.base_url.as_deref(),
                &config.model,
                config.temperature,
                config.max_tokens,
            )))
        }
    }
}

fn required_key<'a>(config: &'a AiConfig) -> Result<&'a str, ConfigError> {
    config
        .api_key
        .as_ref()
        .map(|k| k.expose_secret())
        .ok_or_else(|| ConfigError::MissingEnvVar("AUTOREPLY_AI_API_KEY".into()))
}

fn create_anthropic_provider(config: &AiConfig) -> Result<Arc<dyn AiProvider>, ConfigError> {
    use rig::providers::anthropic;

    let client: rig::client::Client<anthropic::client::AnthropicExt> =
        anthropic::Client::new(required_key(config)?).map_err(|e| ConfigError::InvalidValue {
            key: "AUTOREPLY_AI_API_KEY".into(),
            message: format!("Failed to create Anthropic client: {e}"),
        })?;

    let model = client.completion_model(&config.model);
    tracing::info!("Using Anthropic (model: {})", config.model);
    Ok(Arc::new(RigAdapter::new(
        model,
        "anthropic",
        &config.model,
        config.max_tokens,
        config.temperature,
    )))
}

fn create_openai_provider(config: &AiConfig) -> Result<Arc<dyn AiProvider>, ConfigError> {
    use rig::providers::openai;

    let client: rig::client::Client<openai::client::OpenAIResponsesExt> =
        openai::Client::new(required_key(config)?).map_err(|e| ConfigError::InvalidValue {
            key: "AUTOREPLY_AI_API_KEY".into(),
            message: format!("Failed to create OpenAI client: {e}"),
        })?;

    let model = client.completion_model(&config.model);
    tracing::info!("Using OpenAI (model: {})", config.model);
    Ok(Arc::new(RigAdapter::new(
        model,
        "openai",
        &config.model,
        config.max_tokens,
        config.temperature,
    )))
}

// ── Messaging ───────────────────────────────────────────────────────

/// Outbound channel plus the vendor-specific webhook format.
#[async_trait]
pub trait MessagingProvider: Send + Sync {
    fn name(&self) -> &str;

    /// Send one text message. Returns the provider-assigned message id.
    /// Timeouts are applied by the caller.
    async fn send_text(&self, to: &str, body: &str) -> Result<String, MessagingError>;

    /// Translate a webhook body into a canonical event.
    ///
    /// The default accepts generic field names (`from`, `body`, `message_id`, ...).
    fn parse_inbound(&self, payload: &RawPayload) -> Result<InboundEvent, ValidationError> {
        parse_generic_inbound(payload)
    }
}

/// Parse a payload using generic field names, falling back to Twilio's names.
pub fn parse_generic_inbound(payload: &RawPayload) -> Result<InboundEvent, ValidationError> {
    if payload.is_empty() {
        return Err(ValidationError::Malformed("empty payload".into()));
    }

    let sender = payload_first(payload, &["from", "sender", "address", "From"]);
    let body = payload_first(payload, &["body", "text", "message", "Body"]);
    let media = payload_first(payload, &["media_url", "MediaUrl0"]);

    let mut event = InboundEvent::from_parts(sender.as_deref(), body.as_deref(), media.as_deref())?
        .with_external_id(
            payload_first(payload, &["message_id", "external_id", "id", "MessageSid"]).as_deref(),
        )
        .with_recipient(payload_first(payload, &["to", "recipient", "To"]).as_deref())
        .with_profile_name(payload_first(payload, &["profile_name", "name", "ProfileName"]).as_deref());

    if let Some(at) = payload_first(payload, &["timestamp", "received_at"])
        .as_deref()
        .and_then(parse_timestamp)
    {
        event = event.with_received_at(at);
    }
    Ok(event)
}

/// Create the configured messaging provider.
pub fn create_messaging_provider(
    config: &MessagingConfig,
) -> Result<Arc<dyn MessagingProvider>, ConfigError> {
    match config {
        MessagingConfig::Log => {
            tracing::info!("Using log messaging sink (nothing is delivered)");
            Ok(Arc::new(LogSink::new()))
        }
        MessagingConfig::Twilio(twilio) => {
            tracing::info!(from = %twilio.from_number, whatsapp = twilio.whatsapp, "Using Twilio messaging");
            Ok(Arc::new(TwilioProvider::new(twilio.clone())))
        }
    }
}

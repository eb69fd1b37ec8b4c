//! Configuration types, built once at startup from environment variables.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;
use crate::pipeline::retry::RetryPolicy;
use crate::pipeline::rules::TagRules;

/// System instruction used when `AUTOREPLY_SYSTEM_PROMPT` is not set.
pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a professional sales assistant for a construction company. \
Answer customer questions about services, prices and scheduling in a friendly, concise way. \
Keep replies short enough for a chat message, reply in the customer's language, \
and offer to connect the customer with a human advisor when you cannot help.";

/// Reply sent when the AI provider cannot produce one.
pub const DEFAULT_FALLBACK_REPLY: &str = "Thanks for your message! We're unable to reply automatically right now, \
but one of our advisors will get back to you shortly.";

/// Whole-process configuration.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub messaging: MessagingConfig,
    pub ai: AiConfig,
    pub reply: ReplyConfig,
    pub dispatch: DispatchConfig,
    pub tag_rules: TagRules,
}

/// HTTP host and storage settings.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: SocketAddr,
    pub db_path: PathBuf,
    /// Organization for webhooks posted without one in the path.
    pub default_organization: String,
    /// Bearer token guarding the operator endpoints. Open when unset.
    pub operator_token: Option<SecretString>,
    /// Daily-rolling log file directory.
    pub log_dir: Option<PathBuf>,
    /// Time bucket for hash-based dedup keys.
    pub dedup_bucket: Duration,
}

/// Which messaging provider delivers replies.
#[derive(Debug, Clone)]
pub enum MessagingConfig {
    Log,
    Twilio(TwilioConfig),
}

#[derive(Debug, Clone)]
pub struct TwilioConfig {
    pub account_sid: String,
    pub auth_token: SecretString,
    pub from_number: String,
    pub api_base: String,
    /// Address numbers with the `whatsapp:` channel prefix.
    pub whatsapp: bool,
}

/// Supported AI backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AiBackend {
    Anthropic,
    OpenAi,
    Ollama,
}

impl AiBackend {
    fn default_model(&self) -> &'static str {
        match self {
            Self::Anthropic => "claude-3-5-haiku-latest",
            Self::OpenAi => "gpt-4o-mini",
            Self::Ollama => "llama3.2",
        }
    }
}

impl FromStr for AiBackend {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "anthropic" => Ok(Self::Anthropic),
            "openai" => Ok(Self::OpenAi),
            "ollama" => Ok(Self::Ollama),
            other => Err(ConfigError::UnknownProvider {
                kind: "AI".into(),
                name: other.into(),
            }),
        }
    }
}

/// Configuration for creating an AI provider.
#[derive(Debug, Clone)]
pub struct AiConfig {
    pub backend: AiBackend,
    pub api_key: Option<SecretString>,
    pub model: String,
    pub base_url: Option<String>,
    pub max_tokens: u64,
    pub temperature: f64,
}

/// When the webhook acknowledges relative to the reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyMode {
    /// Acknowledge once the inbound message is stored; reply on a spawned task.
    Background,
    /// Run the whole reply before acknowledging.
    Inline,
}

impl FromStr for ReplyMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "background" => Ok(Self::Background),
            "inline" => Ok(Self::Inline),
            other => Err(ConfigError::InvalidValue {
                key: "AUTOREPLY_REPLY_MODE".into(),
                message: format!("expected 'background' or 'inline', got '{other}'"),
            }),
        }
    }
}

/// Auto-reply orchestration settings.
#[derive(Debug, Clone)]
pub struct ReplyConfig {
    pub system_prompt: String,
    pub fallback_reply: String,
    /// Messages of history sent to the AI, including the one being answered.
    pub context_window: usize,
    /// Per-attempt AI deadline.
    pub ai_timeout: Duration,
    pub ai_retry: RetryPolicy,
    pub mode: ReplyMode,
}

impl Default for ReplyConfig {
    fn default() -> Self {
        Self {
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            fallback_reply: DEFAULT_FALLBACK_REPLY.to_string(),
            context_window: 10,
            ai_timeout: Duration::from_secs(30),
            ai_retry: RetryPolicy::new(3, Duration::from_millis(500), Duration::from_secs(8)),
            mode: ReplyMode::Background,
        }
    }
}

/// Outbound delivery settings.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Per-attempt send deadline.
    pub send_timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            send_timeout: Duration::from_secs(15),
            retry: RetryPolicy::new(4, Duration::from_millis(500), Duration::from_secs(8)),
        }
    }
}

impl AppConfig {
    /// Build config from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build config from any key lookup (environment, map in tests).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env(&lookup);

        let server = ServerConfig {
            bind: env.parsed("AUTOREPLY_BIND", SocketAddr::from(([0, 0, 0, 0], 8080)))?,
            db_path: PathBuf::from(env.string_or("AUTOREPLY_DB_PATH", "./data/autoreply.db")),
            default_organization: env.string_or("AUTOREPLY_DEFAULT_ORG", "default"),
            operator_token: env.string("AUTOREPLY_OPERATOR_TOKEN").map(SecretString::from),
            log_dir: env.string("AUTOREPLY_LOG_DIR").map(PathBuf::from),
            dedup_bucket: Duration::from_secs(env.parsed("AUTOREPLY_DEDUP_BUCKET_SECS", 60u64)?),
        };

        let messaging = match env
            .string_or("AUTOREPLY_MESSAGING_PROVIDER", "log")
            .to_lowercase()
            .as_str()
        {
            "log" => MessagingConfig::Log,
            "twilio" => MessagingConfig::Twilio(TwilioConfig {
                account_sid: env.required("TWILIO_ACCOUNT_SID")?,
                auth_token: SecretString::from(env.required("TWILIO_AUTH_TOKEN")?),
                from_number: env.required("TWILIO_FROM_NUMBER")?,
                api_base: env.string_or("TWILIO_API_BASE", "https://api.twilio.com"),
                whatsapp: env.parsed("TWILIO_WHATSAPP", true)?,
            }),
            other => {
                return Err(ConfigError::UnknownProvider {
                    kind: "messaging".into(),
                    name: other.into(),
                });
            }
        };

        let backend: AiBackend = env.string_or("AUTOREPLY_AI_PROVIDER", "ollama").parse()?;
        let ai = AiConfig {
            backend,
            api_key: env.string("AUTOREPLY_AI_API_KEY").map(SecretString::from),
            model: env.string_or("AUTOREPLY_AI_MODEL", backend.default_model()),
            base_url: env.string("AUTOREPLY_AI_BASE_URL"),
            max_tokens: env.parsed("AUTOREPLY_AI_MAX_TOKENS", 300u64)?,
            temperature: env.parsed("AUTOREPLY_AI_TEMPERATURE", 0.7f64)?,
        };

        let max_backoff = Duration::from_millis(env.parsed("AUTOREPLY_MAX_BACKOFF_MS", 8000u64)?);
        let reply = ReplyConfig {
            system_prompt: env.string_or("AUTOREPLY_SYSTEM_PROMPT", DEFAULT_SYSTEM_PROMPT),
            fallback_reply: env.string_or("AUTOREPLY_FALLBACK_REPLY", DEFAULT_FALLBACK_REPLY),
            context_window: env.parsed("AUTOREPLY_CONTEXT_WINDOW", 10usize)?.max(1),
            ai_timeout: Duration::from_secs(env.parsed("AUTOREPLY_AI_TIMEOUT_SECS", 30u64)?),
            ai_retry: RetryPolicy::new(
                env.parsed("AUTOREPLY_AI_MAX_ATTEMPTS", 3u32)?,
                Duration::from_millis(env.parsed("AUTOREPLY_AI_BACKOFF_MS", 500u64)?),
                max_backoff,
            ),
            mode: env.string_or("AUTOREPLY_REPLY_MODE", "background").parse()?,
        };

        let dispatch = DispatchConfig {
            send_timeout: Duration::from_secs(env.parsed("AUTOREPLY_SEND_TIMEOUT_SECS", 15u64)?),
            retry: RetryPolicy::new(
                env.parsed("AUTOREPLY_SEND_MAX_ATTEMPTS", 4u32)?,
                Duration::from_millis(env.parsed("AUTOREPLY_SEND_BACKOFF_MS", 500u64)?),
                max_backoff,
            ),
        };

        let tag_rules = match (
            env.string("AUTOREPLY_TAG_RULES"),
            env.string("AUTOREPLY_TAG_RULES_FILE"),
        ) {
            (Some(json), _) => TagRules::from_json(&json)?,
            (None, Some(path)) => TagRules::from_json(&std::fs::read_to_string(path)?)?,
            (None, None) => TagRules::default_rules(),
        };

        Ok(Self {
            server,
            messaging,
            ai,
            reply,
            dispatch,
            tag_rules,
        })
    }
}

/// Typed accessors over a key lookup. Blank values count as unset.
struct Env<'a, F: Fn(&str) -> Option<String>>(&'a F);

impl<F: Fn(&str) -> Option<String>> Env<'_, F> {
    fn string(&self, key: &str) -> Option<String> {
        (self.0)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn string_or(&self, key: &str, default: &str) -> String {
        self.string(key).unwrap_or_else(|| default.to_string())
    }

    fn required(&self, key: &str) -> Result<String, ConfigError> {
        self.string(key)
            .ok_or_else(|| ConfigError::MissingEnvVar(key.to_string()))
    }

    fn parsed<T>(&self, key: &str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.string(key) {
            Some(raw) => raw.parse().map_err(|e: T::Err| ConfigError::InvalidValue {
                key: key.to_string(),
                message: format!("'{raw}': {e}"),
            }),
            None => Ok(default),
        }
    }
}

//! Twilio messaging provider (WhatsApp or SMS) over the Messages REST API.

use std::time::Duration;

use async_trait::async_trait;
use secrecy::ExposeSecret;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::config::TwilioConfig;
use crate::error::{MessagingError, ValidationError};
use crate::pipeline::types::{InboundEvent, RawPayload, payload_first};
use crate::providers::MessagingProvider;

const PROVIDER: &str = "twilio";
const WHATSAPP_PREFIX: &str = "whatsapp:";

/// Twilio error codes for a malformed or unreachable destination.
const INVALID_ADDRESS_CODES: &[i64] = &[21211, 21614];
/// Recipient opted out / blocked us.
const BLOCKED_CODES: &[i64] = &[21610];

#[derive(Debug, Deserialize)]
struct MessageResource {
    sid: String,
}

#[derive(Debug, Default, Deserialize)]
struct ErrorBody {
    code: Option<i64>,
    #[serde(default)]
    message: String,
}

/// Sends through `POST /2010-04-01/Accounts/{sid}/Messages.json`.
pub struct TwilioProvider {
    config: TwilioConfig,
    client: reqwest::Client,
}

impl TwilioProvider {
    pub fn new(config: TwilioConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::builder()
                .connect_timeout(Duration::from_secs(10))
                .build()
                .unwrap_or_else(|_| reqwest::Client::new()),
        }
    }

    fn messages_url(&self) -> String {
        format!(
            "{}/2010-04-01/Accounts/{}/Messages.json",
            self.config.api_base.trim_end_matches('/'),
            self.config.account_sid
        )
    }

    /// Add the channel prefix Twilio expects for WhatsApp addresses.
    fn channel_address(&self, address: &str) -> String {
        let bare = address.strip_prefix(WHATSAPP_PREFIX).unwrap_or(address);
        if self.config.whatsapp {
            format!("{WHATSAPP_PREFIX}{bare}")
        } else {
            bare.to_string()
        }
    }
}

/// Map a failed Twilio response to the messaging error taxonomy.
fn classify_failure(
    status: u16,
    body: &ErrorBody,
    to: &str,
    retry_after: Option<Duration>,
) -> MessagingError {
    let reason = if body.message.is_empty() {
        format!("HTTP {status}")
    } else {
        format!("HTTP {status}: {}", body.message)
    };

    if let Some(code) = body.code {
        if INVALID_ADDRESS_CODES.contains(&code) {
            return MessagingError::InvalidAddress {
                provider: PROVIDER.into(),
                address: to.into(),
                reason: format!("code {code}: {reason}"),
            };
        }
        if BLOCKED_CODES.contains(&code) {
            return MessagingError::Blocked {
                provider: PROVIDER.into(),
                address: to.into(),
                reason: format!("code {code}: {reason}"),
            };
        }
    }

    match status {
        429 => MessagingError::RateLimited {
            provider: PROVIDER.into(),
            retry_after,
        },
        408 | 500..=599 => MessagingError::Transient {
            provider: PROVIDER.into(),
            reason,
        },
        _ => MessagingError::Rejected {
            provider: PROVIDER.into(),
            reason,
        },
    }
}

fn parse_retry_after(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    headers
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

#[async_trait]
impl MessagingProvider for TwilioProvider {
    fn name(&self) -> &str {
        PROVIDER
    }

    async fn send_text(&self, to: &str, body: &str) -> Result<String, MessagingError> {
        let to_addr = self.channel_address(to);
        let from_addr = self.channel_address(&self.config.from_number);
        let form = [
            ("To", to_addr.as_str()),
            ("From", from_addr.as_str()),
            ("Body", body),
        ];

        let resp = self
            .client
            .post(self.messages_url())
            .basic_auth(
                &self.config.account_sid,
                Some(self.config.auth_token.expose_secret()),
            )
            .form(&form)
            .send()
            .await
            .map_err(|e| MessagingError::Transient {
                provider: PROVIDER.into(),
                reason: format!("request failed: {e}"),
            })?;

        let status = resp.status();
        if status.is_success() {
            let resource: MessageResource =
                resp.json().await.map_err(|e| MessagingError::Transient {
                    provider: PROVIDER.into(),
                    reason: format!("unreadable response: {e}"),
                })?;
            debug!(to, sid = %resource.sid, "Twilio accepted message");
            return Ok(resource.sid);
        }

        let retry_after = parse_retry_after(resp.headers());
        let error_body: ErrorBody = resp.json().await.unwrap_or_default();
        let err = classify_failure(status.as_u16(), &error_body, to, retry_after);
        warn!(to, status = status.as_u16(), code = ?error_body.code, error = %err, "Twilio send failed");
        Err(err)
    }

    /// Twilio posts `From`, `To`, `Body`, `MessageSid`, `ProfileName` and
    /// `MediaUrl0` as form fields.
    fn parse_inbound(&self, payload: &RawPayload) -> Result<InboundEvent, ValidationError> {
        if payload.is_empty() {
            return Err(ValidationError::Malformed("empty payload".into()));
        }
        let media = payload_first(payload, &["MediaUrl0"]);
        let event = InboundEvent::from_parts(
            payload_first(payload, &["From"]).as_deref(),
            payload_first(payload, &["Body"]).as_deref(),
            media.as_deref(),
        )?;
        Ok(event
            .with_external_id(payload_first(payload, &["MessageSid", "SmsMessageSid"]).as_deref())
            .with_recipient(payload_first(payload, &["To"]).as_deref())
            .with_profile_name(payload_first(payload, &["ProfileName"]).as_deref()))
    }
}

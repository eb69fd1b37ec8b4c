//! Shared types for the auto-reply pipeline.

use std::sync::LazyLock;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use regex::Regex;
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::error::ValidationError;
use crate::store::DeliveryStatus;

/// Provider-shaped webhook body, flattened to a JSON object.
///
/// Form-encoded callbacks are converted to string values before they get here.
pub type RawPayload = serde_json::Map<String, serde_json::Value>;

static ADDRESS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\+?[0-9]{3,20}$").expect("address regex is valid"));

// ── Inbound event ───────────────────────────────────────────────────

/// Canonical inbound message, independent of the messaging vendor.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundEvent {
    /// Normalized sender address.
    pub sender: String,
    /// Our own address the message was sent to, when the provider reports it.
    pub recipient: Option<String>,
    /// Message text. May be empty for media-only messages.
    pub body: String,
    /// Provider-assigned message id, used for dedup.
    pub external_id: Option<String>,
    /// Media reference attached to the message.
    pub media_url: Option<String>,
    /// Sender's display name, when the provider reports one.
    pub profile_name: Option<String>,
    /// Provider timestamp, or the time we received the callback.
    pub received_at: DateTime<Utc>,
}

impl InboundEvent {
    /// Validate the pieces every provider must supply and build an event.
    pub fn from_parts(
        sender: Option<&str>,
        body: Option<&str>,
        media_url: Option<&str>,
    ) -> Result<Self, ValidationError> {
        let sender = non_blank(sender).ok_or(ValidationError::MissingSender)?;
        let sender = normalize_address(sender)?;
        let media_url = non_blank(media_url).map(str::to_string);
        let body = match non_blank(body) {
            Some(text) => text.trim().to_string(),
            None if media_url.is_some() => String::new(),
            None => return Err(ValidationError::MissingBody),
        };

        Ok(Self {
            sender,
            recipient: None,
            body,
            external_id: None,
            media_url,
            profile_name: None,
            received_at: Utc::now(),
        })
    }

    pub fn with_external_id(mut self, id: Option<&str>) -> Self {
        self.external_id = non_blank(id).map(|s| s.trim().to_string());
        self
    }

    pub fn with_recipient(mut self, recipient: Option<&str>) -> Self {
        self.recipient = non_blank(recipient).and_then(|r| normalize_address(r).ok());
        self
    }

    pub fn with_profile_name(mut self, name: Option<&str>) -> Self {
        self.profile_name = non_blank(name).map(|s| s.trim().to_string());
        self
    }

    pub fn with_received_at(mut self, at: DateTime<Utc>) -> Self {
        self.received_at = at;
        self
    }

    /// Dedup key for this event within an organization.
    ///
    /// Uses the provider id when there is one. Otherwise hashes the sender, body
    /// and a coarse time bucket, so a redelivery inside the same bucket
    /// collapses onto the first delivery.
    pub fn dedup_key(&self, organization_id: &str, bucket: Duration) -> String {
        if let Some(ref id) = self.external_id {
            return format!("ext:{organization_id}:{id}");
        }
        let bucket_secs = bucket.as_secs().max(1) as i64;
        let slot = self.received_at.timestamp().div_euclid(bucket_secs);

        let mut hasher = Sha256::new();
        hasher.update(organization_id.as_bytes());
        hasher.update([0u8]);
        hasher.update(self.sender.as_bytes());
        hasher.update([0u8]);
        hasher.update(self.body.as_bytes());
        hasher.update([0u8]);
        hasher.update(slot.to_be_bytes());
        format!("hash:{}", hex::encode(hasher.finalize()))
    }
}

fn non_blank(s: Option<&str>) -> Option<&str> {
    s.filter(|s| !s.trim().is_empty())
}

/// Normalize a phone-number-like address.
///
/// Strips a `whatsapp:` prefix and common separators, then requires an
/// optional leading `+` followed by 3 to 20 digits.
pub fn normalize_address(raw: &str) -> Result<String, ValidationError> {
    let trimmed = raw.trim();
    let without_prefix = trimmed
        .strip_prefix("whatsapp:")
        .unwrap_or(trimmed)
        .trim();
    let normalized: String = without_prefix
        .chars()
        .filter(|c| !matches!(c, ' ' | '-' | '.' | '(' | ')'))
        .collect();

    if normalized.is_empty() {
        return Err(ValidationError::MissingSender);
    }
    if !ADDRESS_RE.is_match(&normalized) {
        return Err(ValidationError::InvalidSender(trimmed.to_string()));
    }
    Ok(normalized)
}

/// Read a string field from a payload, accepting numbers as well.
pub fn payload_str<'a>(payload: &'a RawPayload, key: &str) -> Option<std::borrow::Cow<'a, str>> {
    match payload.get(key)? {
        serde_json::Value::String(s) => Some(std::borrow::Cow::Borrowed(s.as_str())),
        serde_json::Value::Number(n) => Some(std::borrow::Cow::Owned(n.to_string())),
        _ => None,
    }
}

/// First present string field among `keys`.
pub fn payload_first<'a>(
    payload: &'a RawPayload,
    keys: &[&str],
) -> Option<std::borrow::Cow<'a, str>> {
    keys.iter().find_map(|k| payload_str(payload, k))
}

/// Parse a provider timestamp: RFC 3339 or unix seconds.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    raw.parse::<i64>()
        .ok()
        .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
}

// ── Outcomes ────────────────────────────────────────────────────────

/// Acknowledgment returned by the webhook receiver.
#[derive(Debug, Clone)]
pub enum WebhookOutcome {
    /// Persisted; the reply runs (or ran, in inline mode) afterwards.
    Accepted {
        client_id: String,
        message_id: String,
        /// Present only when the orchestrator ran inline.
        reply: Option<ReplyReport>,
    },
    /// Already seen this dedup key. Nothing was done.
    Duplicate { dedup_key: String },
    /// Payload failed validation. Nothing was persisted.
    Rejected(ValidationError),
}

impl WebhookOutcome {
    /// Short label for logging and responses.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Accepted { .. } => "accepted",
            Self::Duplicate { .. } => "duplicate",
            Self::Rejected(_) => "rejected",
        }
    }
}

/// Final classification of an orchestrator run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplyOutcome {
    ReplySent,
    ReplyFailed,
}

/// Everything the orchestrator did for one inbound message.
#[derive(Debug, Clone, Serialize)]
pub struct ReplyReport {
    /// Outbound message row, if it could be persisted.
    pub outbound_message_id: Option<String>,
    /// Text handed to the dispatcher (AI reply or fallback).
    pub body: String,
    /// True when the AI provider failed every attempt and the fallback was used.
    pub used_fallback: bool,
    /// AI attempts made.
    pub ai_attempts: u32,
    /// Tags newly added to the client by this message.
    pub tags_added: Vec<String>,
    /// What the dispatcher reported.
    pub delivery: DispatchOutcome,
}

impl ReplyReport {
    /// `ReplyFailed` when the fallback was used or delivery failed.
    pub fn outcome(&self) -> ReplyOutcome {
        if self.used_fallback || !self.delivery.is_sent() {
            ReplyOutcome::ReplyFailed
        } else {
            ReplyOutcome::ReplySent
        }
    }
}

/// Result of a dispatcher send.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DispatchOutcome {
    Sent {
        provider_message_id: String,
        attempts: u32,
    },
    Failed {
        reason: String,
        attempts: u32,
        /// False when the provider classified the error as permanent.
        retriable: bool,
    },
}

impl DispatchOutcome {
    pub fn is_sent(&self) -> bool {
        matches!(self, Self::Sent { .. })
    }

    pub fn attempts(&self) -> u32 {
        match self {
            Self::Sent { attempts, .. } | Self::Failed { attempts, .. } => *attempts,
        }
    }

    /// Delivery status this outcome maps to.
    pub fn status(&self) -> DeliveryStatus {
        match self {
            Self::Sent { .. } => DeliveryStatus::Sent,
            Self::Failed { .. } => DeliveryStatus::Failed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(sender: &str, body: &str) -> InboundEvent {
        InboundEvent::from_parts(Some(sender), Some(body), None).unwrap()
    }

    #[test]
    fn normalizes_whatsapp_prefix_and_separators() {
        assert_eq!(
            normalize_address("whatsapp:+1 (555) 010-0200").unwrap(),
            "+15550100200"
        );
        assert_eq!(normalize_address("  +1555 ").unwrap(), "+1555");
    }

    #[test]
    fn rejects_non_numeric_address() {
        let err = normalize_address("alice@example.com").unwrap_err();
        assert_eq!(err.code(), "invalid_sender");
        assert_eq!(normalize_address("  ").unwrap_err(), ValidationError::MissingSender);
    }

    #[test]
    fn missing_sender_and_body() {
        assert_eq!(
            InboundEvent::from_parts(None, Some("hi"), None).unwrap_err(),
            ValidationError::MissingSender
        );
        assert_eq!(
            InboundEvent::from_parts(Some("+1555"), Some("   "), None).unwrap_err(),
            ValidationError::MissingBody
        );
    }

    #[test]
    fn media_only_message_is_accepted() {
        let ev = InboundEvent::from_parts(
            Some("+1555"),
            None,
            Some("https://media.example/1.jpg"),
        )
        .unwrap();
        assert!(ev.body.is_empty());
        assert_eq!(ev.media_url.as_deref(), Some("https://media.example/1.jpg"));
    }

    #[test]
    fn dedup_key_prefers_external_id() {
        let ev = event("+1555", "hi").with_external_id(Some("SM123"));
        assert_eq!(ev.dedup_key("org1", Duration::from_secs(60)), "ext:org1:SM123");
        assert_eq!(ev.dedup_key("org2", Duration::from_secs(60)), "ext:org2:SM123");
    }

    #[test]
    fn hashed_dedup_key_is_stable_within_bucket() {
        let t0 = Utc.timestamp_opt(1_700_000_040, 0).unwrap();
        let a = event("+1555", "hi").with_received_at(t0);
        let b = event("+1555", "hi").with_received_at(t0 + chrono::Duration::seconds(10));
        let c = event("+1555", "hi").with_received_at(t0 + chrono::Duration::seconds(60));
        let bucket = Duration::from_secs(60);

        let ka = a.dedup_key("org", bucket);
        assert!(ka.starts_with("hash:"));
        assert_eq!(ka, b.dedup_key("org", bucket));
        // t0 sits on a bucket boundary, so t0 + 60s is the next bucket
        assert_ne!(ka, c.dedup_key("org", bucket));
    }

    #[test]
    fn hashed_dedup_key_depends_on_body_and_sender() {
        let t0 = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let bucket = Duration::from_secs(60);
        let base = event("+1555", "hi").with_received_at(t0).dedup_key("o", bucket);
        let other_body = event("+1555", "hello").with_received_at(t0).dedup_key("o", bucket);
        let other_sender = event("+1556", "hi").with_received_at(t0).dedup_key("o", bucket);
        assert_ne!(base, other_body);
        assert_ne!(base, other_sender);
    }

    #[test]
    fn blank_external_id_is_ignored() {
        let ev = event("+1555", "hi").with_external_id(Some("  "));
        assert!(ev.external_id.is_none());
    }

    #[test]
    fn parses_timestamps() {
        let rfc = parse_timestamp("2026-01-02T03:04:05Z").unwrap();
        assert_eq!(rfc.timestamp(), 1_767_323_045);
        let unix = parse_timestamp("1700000000").unwrap();
        assert_eq!(unix.timestamp(), 1_700_000_000);
        assert!(parse_timestamp("yesterday").is_none());
    }

    #[test]
    fn payload_helpers_accept_numbers() {
        let payload: RawPayload =
            serde_json::from_value(serde_json::json!({"id": 42, "body": "hi"})).unwrap();
        assert_eq!(payload_str(&payload, "id").unwrap(), "42");
        assert_eq!(payload_first(&payload, &["text", "body"]).unwrap(), "hi");
        assert!(payload_first(&payload, &["missing"]).is_none());
    }

    #[test]
    fn dispatch_outcome_helpers() {
        let sent = DispatchOutcome::Sent {
            provider_message_id: "SM1".into(),
            attempts: 2,
        };
        assert!(sent.is_sent());
        assert_eq!(sent.attempts(), 2);
        assert_eq!(sent.status(), DeliveryStatus::Sent);

        let failed = DispatchOutcome::Failed {
            reason: "blocked".into(),
            attempts: 1,
            retriable: false,
        };
        assert_eq!(failed.status(), DeliveryStatus::Failed);
        let json = serde_json::to_value(&failed).unwrap();
        assert_eq!(json["status"], "failed");
    }
}

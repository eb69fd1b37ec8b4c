//! Persisted client and message records.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// A customer reachable on the messaging channel.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Client {
    pub id: String,
    pub organization_id: String,
    /// Normalized channel address, unique per organization.
    pub address: String,
    pub display_name: Option<String>,
    /// Normalized (trimmed, lowercase) tags.
    pub tags: BTreeSet<String>,
    pub last_contact: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Which way a message travelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Inbound,
    Outbound,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Inbound => "inbound",
            Self::Outbound => "outbound",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "outbound" => Self::Outbound,
            _ => Self::Inbound,
        }
    }
}

/// Delivery state of an outbound message.
///
/// `Pending` moves to exactly one of the terminal states and never leaves it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Pending,
    Sent,
    Failed,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Sent => "sent",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "sent" => Some(Self::Sent),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

/// An immutable message row. Only the delivery fields of outbound rows change.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredMessage {
    pub id: String,
    pub client_id: String,
    /// Per-client position, strictly increasing in insertion order.
    pub seq: i64,
    pub direction: Direction,
    pub body: String,
    pub external_id: Option<String>,
    pub dedup_key: Option<String>,
    pub media_url: Option<String>,
    /// True for AI or fallback replies.
    pub automated: bool,
    /// Outbound only.
    pub delivery_status: Option<DeliveryStatus>,
    pub provider_message_id: Option<String>,
    pub delivery_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fields for a new inbound row.
#[derive(Debug, Clone)]
pub struct NewInboundMessage<'a> {
    pub client_id: &'a str,
    pub body: &'a str,
    pub external_id: Option<&'a str>,
    pub dedup_key: &'a str,
    pub media_url: Option<&'a str>,
    pub received_at: DateTime<Utc>,
}

/// Fields for a new outbound row (always inserted as `pending`).
#[derive(Debug, Clone)]
pub struct NewOutboundMessage<'a> {
    pub client_id: &'a str,
    pub body: &'a str,
    pub automated: bool,
}

/// Result of inserting an inbound message.
#[derive(Debug, Clone)]
pub enum InsertOutcome {
    Inserted(StoredMessage),
    /// A message with the same dedup key already exists.
    Duplicate,
}

/// Trim and lowercase a tag. Returns `None` for blank tags.
pub fn normalize_tag(tag: &str) -> Option<String> {
    let tag = tag.trim().to_lowercase();
    if tag.is_empty() { None } else { Some(tag) }
}

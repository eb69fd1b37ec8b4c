//! `ConversationStore` trait: the single async interface for client and message persistence.

use std::collections::BTreeSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::DatabaseError;
use crate::store::model::{
    Client, DeliveryStatus, InsertOutcome, NewInboundMessage, NewOutboundMessage, StoredMessage,
};

/// Backend-agnostic store for clients, tags and messages.
///
/// Implementations must keep three guarantees under concurrent callers:
/// per-client `seq` values are allocated atomically with the insert, tag
/// updates are additive set unions, and delivery status only moves out of
/// `pending`.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// Run all pending schema migrations.
    async fn init_schema(&self) -> Result<(), DatabaseError>;

    // ── Clients ─────────────────────────────────────────────────────

    /// Find the client for `(organization_id, address)` or create it.
    ///
    /// Refreshes `last_contact` and fills a missing display name.
    async fn upsert_client(
        &self,
        organization_id: &str,
        address: &str,
        display_name: Option<&str>,
        seen_at: DateTime<Utc>,
    ) -> Result<Client, DatabaseError>;

    async fn get_client(&self, id: &str) -> Result<Option<Client>, DatabaseError>;

    async fn find_client_by_address(
        &self,
        organization_id: &str,
        address: &str,
    ) -> Result<Option<Client>, DatabaseError>;

    /// Add tags to a client. Returns the full tag set afterwards.
    async fn add_client_tags(
        &self,
        client_id: &str,
        tags: &[String],
    ) -> Result<BTreeSet<String>, DatabaseError>;

    async fn client_tags(&self, client_id: &str) -> Result<BTreeSet<String>, DatabaseError>;

    // ── Messages ────────────────────────────────────────────────────

    /// Insert an inbound message unless its dedup key was already stored.
    async fn insert_inbound(
        &self,
        message: &NewInboundMessage<'_>,
    ) -> Result<InsertOutcome, DatabaseError>;

    /// Insert an outbound message with status `pending`.
    async fn insert_outbound(
        &self,
        message: &NewOutboundMessage<'_>,
    ) -> Result<StoredMessage, DatabaseError>;

    async fn get_message(&self, id: &str) -> Result<Option<StoredMessage>, DatabaseError>;

    async fn find_by_dedup_key(
        &self,
        dedup_key: &str,
    ) -> Result<Option<StoredMessage>, DatabaseError>;

    /// The last `limit` messages of a client, oldest first.
    ///
    /// With `up_to_seq`, messages after that position are excluded.
    async fn recent_messages(
        &self,
        client_id: &str,
        up_to_seq: Option<i64>,
        limit: usize,
    ) -> Result<Vec<StoredMessage>, DatabaseError>;

    /// Message history page, newest first.
    async fn list_messages(
        &self,
        client_id: &str,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<StoredMessage>, DatabaseError>;

    /// Move a `pending` outbound message to a terminal status.
    ///
    /// Returns `false` (and changes nothing) when the message is not pending.
    async fn mark_delivery(
        &self,
        id: &str,
        status: DeliveryStatus,
        provider_message_id: Option<&str>,
        error: Option<&str>,
    ) -> Result<bool, DatabaseError>;

    /// Outbound messages in a given delivery status, newest first.
    async fn messages_with_status(
        &self,
        status: DeliveryStatus,
        limit: usize,
    ) -> Result<Vec<StoredMessage>, DatabaseError>;
}

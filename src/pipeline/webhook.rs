//! Webhook receiver: validate, dedup, persist, then hand off to the orchestrator.
//!
//! The inbound row is written before anything else happens, so dedup and
//! per-client ordering hold even if the reply never runs. A storage failure
//! here is returned to the caller so the provider redelivers.
//!
//! Replies always run on a tracked task. Dropping the webhook future (caller
//! gone, request timeout) never cancels a reply, and `drain()` lets shutdown
//! wait for the ones still in flight.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::config::ReplyMode;
use crate::error::{DatabaseError, ValidationError};
use crate::pipeline::orchestrator::AutoReplyOrchestrator;
use crate::pipeline::types::{RawPayload, ReplyReport, WebhookOutcome};
use crate::providers::MessagingProvider;
use crate::store::{Client, ConversationStore, InsertOutcome, NewInboundMessage, StoredMessage};

pub struct WebhookReceiver {
    store: Arc<dyn ConversationStore>,
    messaging: Arc<dyn MessagingProvider>,
    orchestrator: Arc<AutoReplyOrchestrator>,
    dedup_bucket: Duration,
    mode: ReplyMode,
    replies: TaskTracker,
}

impl WebhookReceiver {
    pub fn new(
        store: Arc<dyn ConversationStore>,
        messaging: Arc<dyn MessagingProvider>,
        orchestrator: Arc<AutoReplyOrchestrator>,
        dedup_bucket: Duration,
        mode: ReplyMode,
    ) -> Self {
        Self {
            store,
            messaging,
            orchestrator,
            dedup_bucket,
            mode,
            replies: TaskTracker::new(),
        }
    }

    pub fn mode(&self) -> ReplyMode {
        self.mode
    }

    /// Reply tasks that have not finished yet.
    pub fn in_flight(&self) -> usize {
        self.replies.len()
    }

    /// Wait for every reply task spawned so far. Called once the HTTP server
    /// has stopped accepting webhooks.
    pub async fn drain(&self) {
        self.replies.close();
        let pending = self.replies.len();
        if pending > 0 {
            info!(pending, "Waiting for in-flight replies");
        }
        self.replies.wait().await;
    }

    /// Process one webhook delivery for `organization_id`.
    ///
    /// Validation problems come back as `WebhookOutcome::Rejected`; only
    /// storage failures on the inbound write path are errors.
    pub async fn handle(
        &self,
        organization_id: &str,
        payload: &RawPayload,
    ) -> Result<WebhookOutcome, DatabaseError> {
        let organization_id = organization_id.trim();
        if organization_id.is_empty() {
            return Ok(WebhookOutcome::Rejected(ValidationError::Malformed(
                "missing organization".into(),
            )));
        }

        let event = match self.messaging.parse_inbound(payload) {
            Ok(event) => event,
            Err(e) => {
                warn!(organization_id, reason = e.code(), error = %e, "Webhook rejected");
                return Ok(WebhookOutcome::Rejected(e));
            }
        };

        let dedup_key = event.dedup_key(organization_id, self.dedup_bucket);
        if self.store.find_by_dedup_key(&dedup_key).await?.is_some() {
            info!(organization_id, dedup_key = %dedup_key, "Duplicate webhook ignored");
            return Ok(WebhookOutcome::Duplicate { dedup_key });
        }

        // Contact details are only refreshed once this delivery wins the
        // insert, so a racing redelivery leaves the client untouched.
        let (client, created) = match self
            .store
            .find_client_by_address(organization_id, &event.sender)
            .await?
        {
            Some(client) => (client, false),
            None => {
                let client = self
                    .store
                    .upsert_client(
                        organization_id,
                        &event.sender,
                        event.profile_name.as_deref(),
                        event.received_at,
                    )
                    .await?;
                (client, true)
            }
        };

        let inserted = self
            .store
            .insert_inbound(&NewInboundMessage {
                client_id: &client.id,
                body: &event.body,
                external_id: event.external_id.as_deref(),
                dedup_key: &dedup_key,
                media_url: event.media_url.as_deref(),
                received_at: event.received_at,
            })
            .await?;

        let message = match inserted {
            InsertOutcome::Inserted(message) => message,
            // Lost a race with a concurrent redelivery of the same event
            InsertOutcome::Duplicate => {
                info!(organization_id, dedup_key = %dedup_key, "Duplicate webhook ignored");
                return Ok(WebhookOutcome::Duplicate { dedup_key });
            }
        };

        let client = if created {
            client
        } else {
            match self
                .store
                .upsert_client(
                    organization_id,
                    &event.sender,
                    event.profile_name.as_deref(),
                    event.received_at,
                )
                .await
            {
                Ok(refreshed) => refreshed,
                Err(e) => {
                    warn!(client_id = %client.id, error = %e, "Failed to refresh client contact");
                    client
                }
            }
        };

        info!(
            organization_id,
            client_id = %client.id,
            message_id = %message.id,
            seq = message.seq,
            "Inbound message accepted"
        );
        debug!(
            message_id = %message.id,
            preview = %event.body.chars().take(40).collect::<String>(),
            "Inbound preview"
        );

        let client_id = client.id.clone();
        let message_id = message.id.clone();
        let task = self.spawn_reply(client, message);
        let reply = match self.mode {
            ReplyMode::Inline => match task.await {
                Ok(report) => Some(report),
                Err(e) => {
                    error!(message_id = %message_id, error = %e, "Reply task failed");
                    None
                }
            },
            ReplyMode::Background => None,
        };

        Ok(WebhookOutcome::Accepted {
            client_id,
            message_id,
            reply,
        })
    }

    fn spawn_reply(&self, client: Client, message: StoredMessage) -> JoinHandle<ReplyReport> {
        let orchestrator = Arc::clone(&self.orchestrator);
        self.replies
            .spawn(async move { orchestrator.process(&client, &message).await })
    }
}

//! Outbound dispatcher: bounded-retry delivery plus the delivery-status record.
//!
//! Every send attempt runs under a deadline. Retriable failures (timeouts,
//! transient errors, rate limits) back off and retry up to the policy ceiling;
//! permanent failures stop immediately. The final result moves the stored
//! message from `pending` to exactly one terminal status.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::config::DispatchConfig;
use crate::error::{DatabaseError, Error, MessagingError, ValidationError};
use crate::pipeline::retry::RetryPolicy;
use crate::pipeline::types::DispatchOutcome;
use crate::providers::MessagingProvider;
use crate::store::{Client, ConversationStore, DeliveryStatus, NewOutboundMessage, StoredMessage};

pub struct OutboundDispatcher {
    provider: Arc<dyn MessagingProvider>,
    store: Arc<dyn ConversationStore>,
    policy: RetryPolicy,
    send_timeout: Duration,
}

impl OutboundDispatcher {
    pub fn new(
        provider: Arc<dyn MessagingProvider>,
        store: Arc<dyn ConversationStore>,
        config: &DispatchConfig,
    ) -> Self {
        Self {
            provider,
            store,
            policy: config.retry.clone(),
            send_timeout: config.send_timeout,
        }
    }

    pub fn provider_name(&self) -> &str {
        self.provider.name()
    }

    /// Deliver `body` to `address`, recording the result on `message_id` when given.
    ///
    /// Never fails: delivery problems come back as `DispatchOutcome::Failed`,
    /// and a status write that cannot be stored is logged.
    pub async fn deliver(
        &self,
        address: &str,
        body: &str,
        message_id: Option<&str>,
    ) -> DispatchOutcome {
        let outcome = self.send_with_retry(address, body, message_id).await;
        if let Some(id) = message_id {
            self.record(id, &outcome).await;
        }
        outcome
    }

    async fn send_with_retry(
        &self,
        address: &str,
        body: &str,
        message_id: Option<&str>,
    ) -> DispatchOutcome {
        let provider = self.provider.name().to_string();
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            let result =
                match tokio::time::timeout(self.send_timeout, self.provider.send_text(address, body))
                    .await
                {
                    Ok(result) => result,
                    Err(_) => Err(MessagingError::Timeout {
                        provider: provider.clone(),
                        timeout: self.send_timeout,
                    }),
                };

            match result {
                Ok(provider_message_id) => {
                    info!(
                        to = address,
                        message_id = ?message_id,
                        provider_message_id = %provider_message_id,
                        attempt,
                        "Message delivered"
                    );
                    return DispatchOutcome::Sent {
                        provider_message_id,
                        attempts: attempt,
                    };
                }
                Err(e) if e.is_retriable() && self.policy.should_retry(attempt) => {
                    let delay = self.policy.backoff(attempt, e.retry_after());
                    warn!(
                        to = address,
                        message_id = ?message_id,
                        attempt,
                        max_attempts = self.policy.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Delivery attempt failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    error!(
                        to = address,
                        message_id = ?message_id,
                        attempt,
                        retriable = e.is_retriable(),
                        error = %e,
                        "Delivery failed"
                    );
                    return DispatchOutcome::Failed {
                        reason: e.to_string(),
                        attempts: attempt,
                        retriable: e.is_retriable(),
                    };
                }
            }
        }
    }

    async fn record(&self, message_id: &str, outcome: &DispatchOutcome) {
        let (provider_id, reason) = match outcome {
            DispatchOutcome::Sent {
                provider_message_id,
                ..
            } => (Some(provider_message_id.as_str()), None),
            DispatchOutcome::Failed { reason, .. } => (None, Some(reason.as_str())),
        };

        match self
            .store
            .mark_delivery(message_id, outcome.status(), provider_id, reason)
            .await
        {
            Ok(true) => debug!(message_id, status = outcome.status().as_str(), "Delivery status recorded"),
            Ok(false) => warn!(message_id, "Delivery status already terminal, update ignored"),
            Err(e) => error!(message_id, error = %e, "Failed to record delivery status"),
        }
    }

    /// Deliver outbound messages a previous run left `pending`, oldest first.
    ///
    /// Only safe before the process accepts traffic, when nothing is in flight.
    /// Returns how many messages were attempted.
    pub async fn resume_pending(&self, limit: usize) -> Result<usize, DatabaseError> {
        let mut stale = self
            .store
            .messages_with_status(DeliveryStatus::Pending, limit)
            .await?;
        stale.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.seq.cmp(&b.seq)));

        let mut attempted = 0;
        for message in &stale {
            let client = match self.store.get_client(&message.client_id).await? {
                Some(client) => client,
                None => {
                    warn!(message_id = %message.id, "Pending message has no client, skipping");
                    continue;
                }
            };
            info!(message_id = %message.id, client_id = %client.id, "Resuming pending delivery");
            self.deliver(&client.address, &message.body, Some(&message.id))
                .await;
            attempted += 1;
        }
        Ok(attempted)
    }

    /// Operator-initiated send: persist a non-automated outbound message, then deliver it.
    ///
    /// Returns the stored message as it stands after delivery.
    pub async fn send_manual(
        &self,
        client: &Client,
        body: &str,
    ) -> Result<(StoredMessage, DispatchOutcome), Error> {
        let body = body.trim();
        if body.is_empty() {
            return Err(ValidationError::MissingBody.into());
        }

        let stored = self
            .store
            .insert_outbound(&NewOutboundMessage {
                client_id: &client.id,
                body,
                automated: false,
            })
            .await?;
        info!(client_id = %client.id, message_id = %stored.id, "Manual message queued");

        let outcome = self.deliver(&client.address, body, Some(&stored.id)).await;
        let refreshed = self.store.get_message(&stored.id).await?.unwrap_or(stored);
        Ok((refreshed, outcome))
    }
}

//! Auto-reply orchestrator: tag, generate, persist, dispatch.
//!
//! Runs once per accepted inbound message, after the receiver has stored it.
//! Holds no per-conversation state; everything is read back from the store.
//! Only the AI call and the delivery call suspend for long, and both carry
//! deadlines.

use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::config::ReplyConfig;
use crate::error::AiError;
use crate::pipeline::dispatcher::OutboundDispatcher;
use crate::pipeline::rules::{self, TagRules};
use crate::pipeline::types::{ReplyOutcome, ReplyReport};
use crate::providers::{AiProvider, AiRequest, TranscriptMessage};
use crate::store::{
    Client, ConversationStore, DeliveryStatus, Direction, NewOutboundMessage, StoredMessage,
};

/// Transcript text for an inbound message that only carries media.
const MEDIA_PLACEHOLDER: &str = "[media attachment]";

pub struct AutoReplyOrchestrator {
    store: Arc<dyn ConversationStore>,
    ai: Arc<dyn AiProvider>,
    dispatcher: Arc<OutboundDispatcher>,
    rules: Arc<TagRules>,
    config: ReplyConfig,
}

impl AutoReplyOrchestrator {
    pub fn new(
        store: Arc<dyn ConversationStore>,
        ai: Arc<dyn AiProvider>,
        dispatcher: Arc<OutboundDispatcher>,
        rules: Arc<TagRules>,
        config: ReplyConfig,
    ) -> Self {
        Self {
            store,
            ai,
            dispatcher,
            rules,
            config,
        }
    }

    pub fn config(&self) -> &ReplyConfig {
        &self.config
    }

    /// Handle one stored inbound message end to end.
    ///
    /// Never fails: AI problems fall back to the configured reply, and
    /// delivery problems end up in the report and the message status.
    pub async fn process(&self, client: &Client, inbound: &StoredMessage) -> ReplyReport {
        let transcript = self.load_transcript(client, inbound).await;
        let (current_tags, tags_added) = self.apply_tags(client, inbound).await;

        let system = self.system_instruction(client, &current_tags);
        let request = AiRequest {
            system: Some(system),
            transcript,
        };
        let (body, used_fallback, ai_attempts) = self.generate(client, &request).await;

        // Persist before sending so a crash mid-send still leaves an audit row.
        let outbound = match self
            .store
            .insert_outbound(&NewOutboundMessage {
                client_id: &client.id,
                body: &body,
                automated: true,
            })
            .await
        {
            Ok(message) => Some(message),
            Err(e) => {
                error!(
                    client_id = %client.id,
                    error = %e,
                    "Failed to persist outbound reply, delivering untracked"
                );
                None
            }
        };

        let outbound_id = outbound.map(|m| m.id);
        let delivery = self
            .dispatcher
            .deliver(&client.address, &body, outbound_id.as_deref())
            .await;

        let report = ReplyReport {
            outbound_message_id: outbound_id,
            body,
            used_fallback,
            ai_attempts,
            tags_added,
            delivery,
        };

        match report.outcome() {
            ReplyOutcome::ReplySent => info!(
                client_id = %client.id,
                inbound_id = %inbound.id,
                ai_attempts,
                "Reply sent"
            ),
            ReplyOutcome::ReplyFailed => warn!(
                client_id = %client.id,
                inbound_id = %inbound.id,
                used_fallback = report.used_fallback,
                delivered = report.delivery.is_sent(),
                "Reply failed"
            ),
        }
        report
    }

    /// Recent history up to and including `inbound`, oldest first.
    ///
    /// Replies whose delivery failed never reached the customer and are left out.
    async fn load_transcript(
        &self,
        client: &Client,
        inbound: &StoredMessage,
    ) -> Vec<TranscriptMessage> {
        let history = match self
            .store
            .recent_messages(&client.id, Some(inbound.seq), self.config.context_window)
            .await
        {
            Ok(history) => history,
            Err(e) => {
                warn!(client_id = %client.id, error = %e, "Failed to load conversation window");
                vec![inbound.clone()]
            }
        };

        history
            .iter()
            .filter(|m| m.delivery_status != Some(DeliveryStatus::Failed))
            .map(|m| {
                let content = if m.body.is_empty() {
                    MEDIA_PLACEHOLDER.to_string()
                } else {
                    m.body.clone()
                };
                match m.direction {
                    Direction::Inbound => TranscriptMessage::user(content),
                    Direction::Outbound => TranscriptMessage::assistant(content),
                }
            })
            .collect()
    }

    /// Evaluate tag rules and persist any new tags. Best-effort.
    ///
    /// Returns the tag set to show the AI and the tags this message added.
    async fn apply_tags(
        &self,
        client: &Client,
        inbound: &StoredMessage,
    ) -> (BTreeSet<String>, Vec<String>) {
        let existing = match self.store.client_tags(&client.id).await {
            Ok(tags) => tags,
            Err(e) => {
                warn!(client_id = %client.id, error = %e, "Failed to load client tags");
                client.tags.clone()
            }
        };

        let updated = rules::evaluate(&existing, &inbound.body, &self.rules);
        let added: Vec<String> = updated.difference(&existing).cloned().collect();
        if added.is_empty() {
            return (updated, added);
        }

        match self.store.add_client_tags(&client.id, &added).await {
            Ok(stored) => {
                info!(client_id = %client.id, tags = ?added, "Client tagged");
                (stored, added)
            }
            Err(e) => {
                warn!(client_id = %client.id, tags = ?added, error = %e, "Failed to persist client tags");
                (updated, added)
            }
        }
    }

    fn system_instruction(&self, client: &Client, tags: &BTreeSet<String>) -> String {
        let who = match &client.display_name {
            Some(name) => format!("{name} ({})", client.address),
            None => client.address.clone(),
        };
        let tags = if tags.is_empty() {
            "none".to_string()
        } else {
            tags.iter().cloned().collect::<Vec<_>>().join(", ")
        };
        format!(
            "{}\n\nCustomer: {who}. Customer tags: {tags}.",
            self.config.system_prompt
        )
    }

    /// Ask the AI for a reply with per-attempt timeout and bounded retry.
    ///
    /// Returns `(text, used_fallback, attempts)`.
    async fn generate(&self, client: &Client, request: &AiRequest) -> (String, bool, u32) {
        let policy = &self.config.ai_retry;
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            let result =
                match tokio::time::timeout(self.config.ai_timeout, self.ai.generate_reply(request))
                    .await
                {
                    Ok(Ok(text)) if text.trim().is_empty() => Err(AiError::EmptyResponse {
                        provider: self.ai.name().to_string(),
                    }),
                    Ok(result) => result,
                    Err(_) => Err(AiError::Timeout {
                        provider: self.ai.name().to_string(),
                        timeout: self.config.ai_timeout,
                    }),
                };

            match result {
                Ok(text) => {
                    debug!(client_id = %client.id, attempt, chars = text.chars().count(), "AI reply generated");
                    return (text.trim().to_string(), false, attempt);
                }
                Err(e) if e.is_retriable() && policy.should_retry(attempt) => {
                    let delay = policy.backoff(attempt, None);
                    warn!(
                        client_id = %client.id,
                        attempt,
                        max_attempts = policy.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "AI attempt failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    error!(
                        client_id = %client.id,
                        attempt,
                        error = %e,
                        "AI reply failed, using fallback"
                    );
                    return (self.config.fallback_reply.clone(), true, attempt);
                }
            }
        }
    }
}

//! Inbound message automation pipeline.
//!
//! Every webhook delivery flows through:
//! 1. `WebhookReceiver::handle()`: validate, dedup, persist the inbound message
//! 2. `rules::evaluate()`: keyword/pattern tagging (no LLM)
//! 3. `AutoReplyOrchestrator::process()`: AI reply with retry and fallback
//! 4. `OutboundDispatcher::deliver()`: send with retry, record delivery status

pub mod dispatcher;
pub mod orchestrator;
pub mod retry;
pub mod rules;
pub mod types;
pub mod webhook;

#[cfg(test)]
pub(crate) mod testing;

pub use dispatcher::OutboundDispatcher;
pub use orchestrator::AutoReplyOrchestrator;
pub use rules::{TagRule, TagRules};
pub use types::{DispatchOutcome, InboundEvent, RawPayload, ReplyOutcome, ReplyReport, WebhookOutcome};
pub use webhook::WebhookReceiver;

//! Log-only messaging sink for development: nothing leaves the process.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tracing::info;

use crate::error::MessagingError;
use crate::providers::MessagingProvider;

/// Writes outbound messages to the log and returns a synthetic id.
#[derive(Debug, Default)]
pub struct LogSink {
    sent: AtomicU64,
}

impl LogSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Messages "sent" so far.
    pub fn sent_count(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl MessagingProvider for LogSink {
    fn name(&self) -> &str {
        "log"
    }

    async fn send_text(&self, to: &str, body: &str) -> Result<String, MessagingError> {
        let n = self.sent.fetch_add(1, Ordering::Relaxed) + 1;
        let id = format!("log-{}", uuid::Uuid::new_v4());
        info!(to, id = %id, n, chars = body.chars().count(), "Outbound message (log sink)");
        Ok(id)
    }
}

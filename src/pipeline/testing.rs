//! Scripted providers and a fault-injecting store for pipeline unit tests.

use std::collections::{BTreeSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::{AiError, DatabaseError, MessagingError};
use crate::providers::{AiProvider, AiRequest, MessagingProvider};
use crate::store::{
    Client, ConversationStore, DeliveryStatus, InsertOutcome, LibSqlBackend, NewInboundMessage,
    NewOutboundMessage, StoredMessage,
};

/// Messaging provider that replays queued results, then succeeds.
#[derive(Default)]
pub struct ScriptedMessaging {
    script: Mutex<VecDeque<Result<String, MessagingError>>>,
    pub sent: Mutex<Vec<(String, String)>>,
    calls: AtomicU32,
    delay: Option<Duration>,
}

impl ScriptedMessaging {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_script(results: Vec<Result<String, MessagingError>>) -> Self {
        Self {
            script: Mutex::new(results.into()),
            ..Self::default()
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MessagingProvider for ScriptedMessaging {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn send_text(&self, to: &str, body: &str) -> Result<String, MessagingError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let next = self.script.lock().unwrap().pop_front();
        let result = next.unwrap_or_else(|| Ok(format!("SM{n}")));
        if result.is_ok() {
            self.sent
                .lock()
                .unwrap()
                .push((to.to_string(), body.to_string()));
        }
        result
    }
}

pub fn transient() -> MessagingError {
    MessagingError::Transient {
        provider: "scripted".into(),
        reason: "503".into(),
    }
}

pub fn invalid_address() -> MessagingError {
    MessagingError::InvalidAddress {
        provider: "scripted".into(),
        address: "+1555".into(),
        reason: "unreachable".into(),
    }
}

/// AI provider that replays queued results, then answers with a fixed reply.
pub struct ScriptedAi {
    script: Mutex<VecDeque<Result<String, AiError>>>,
    pub requests: Mutex<Vec<AiRequest>>,
    calls: AtomicU32,
    delay: Option<Duration>,
    default_reply: String,
}

impl ScriptedAi {
    pub fn replying(reply: &str) -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
            calls: AtomicU32::new(0),
            delay: None,
            default_reply: reply.to_string(),
        }
    }

    pub fn with_script(mut self, results: Vec<Result<String, AiError>>) -> Self {
        self.script = Mutex::new(results.into());
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AiProvider for ScriptedAi {
    fn name(&self) -> &str {
        "scripted"
    }

    fn model_name(&self) -> &str {
        "scripted-model"
    }

    async fn generate_reply(&self, request: &AiRequest) -> Result<String, AiError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push(request.clone());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let next = self.script.lock().unwrap().pop_front();
        next.unwrap_or_else(|| Ok(self.default_reply.clone()))
    }
}

pub fn ai_unavailable() -> AiError {
    AiError::RequestFailed {
        provider: "scripted".into(),
        reason: "503 Service Unavailable".into(),
    }
}

/// Store operations `FaultyStore` can be told to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    UpsertClient,
    InsertInbound,
    InsertOutbound,
    AddTags,
    MarkDelivery,
    /// Not a failure: dedup lookups find nothing, as when a redelivery races
    /// past the pre-check.
    MissDedupLookup,
}

/// `ConversationStore` over an in-memory libSQL backend with injectable failures.
pub struct FaultyStore {
    pub inner: Arc<LibSqlBackend>,
    faults: Mutex<Vec<Fault>>,
}

impl FaultyStore {
    pub async fn new(faults: &[Fault]) -> Self {
        Self {
            inner: Arc::new(LibSqlBackend::new_memory().await.unwrap()),
            faults: Mutex::new(faults.to_vec()),
        }
    }

    pub fn set_faults(&self, faults: &[Fault]) {
        *self.faults.lock().unwrap() = faults.to_vec();
    }

    fn check(&self, fault: Fault) -> Result<(), DatabaseError> {
        if self.faults.lock().unwrap().contains(&fault) {
            return Err(DatabaseError::Query(format!("injected {fault:?} failure")));
        }
        Ok(())
    }
}

#[async_trait]
impl ConversationStore for FaultyStore {
    async fn init_schema(&self) -> Result<(), DatabaseError> {
        self.inner.init_schema().await
    }

    async fn upsert_client(
        &self,
        organization_id: &str,
        address: &str,
        display_name: Option<&str>,
        seen_at: DateTime<Utc>,
    ) -> Result<Client, DatabaseError> {
        self.check(Fault::UpsertClient)?;
        self.inner
            .upsert_client(organization_id, address, display_name, seen_at)
            .await
    }

    async fn get_client(&self, id: &str) -> Result<Option<Client>, DatabaseError> {
        self.inner.get_client(id).await
    }

    async fn find_client_by_address(
        &self,
        organization_id: &str,
        address: &str,
    ) -> Result<Option<Client>, DatabaseError> {
        self.inner.find_client_by_address(organization_id, address).await
    }

    async fn add_client_tags(
        &self,
        client_id: &str,
        tags: &[String],
    ) -> Result<BTreeSet<String>, DatabaseError> {
        self.check(Fault::AddTags)?;
        self.inner.add_client_tags(client_id, tags).await
    }

    async fn client_tags(&self, client_id: &str) -> Result<BTreeSet<String>, DatabaseError> {
        self.inner.client_tags(client_id).await
    }

    async fn insert_inbound(
        &self,
        message: &NewInboundMessage<'_>,
    ) -> Result<InsertOutcome, DatabaseError> {
        self.check(Fault::InsertInbound)?;
        self.inner.insert_inbound(message).await
    }

    async fn insert_outbound(
        &self,
        message: &NewOutboundMessage<'_>,
    ) -> Result<StoredMessage, DatabaseError> {
        self.check(Fault::InsertOutbound)?;
        self.inner.insert_outbound(message).await
    }

    async fn get_message(&self, id: &str) -> Result<Option<StoredMessage>, DatabaseError> {
        self.inner.get_message(id).await
    }

    async fn find_by_dedup_key(
        &self,
        dedup_key: &str,
    ) -> Result<Option<StoredMessage>, DatabaseError> {
        if self.faults.lock().unwrap().contains(&Fault::MissDedupLookup) {
            return Ok(None);
        }
        self.inner.find_by_dedup_key(dedup_key).await
    }

    async fn recent_messages(
        &self,
        client_id: &str,
        up_to_seq: Option<i64>,
        limit: usize,
    ) -> Result<Vec<StoredMessage>, DatabaseError> {
        self.inner.recent_messages(client_id, up_to_seq, limit).await
    }

    async fn list_messages(
        &self,
        client_id: &str,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<StoredMessage>, DatabaseError> {
        self.inner.list_messages(client_id, offset, limit).await
    }

    async fn mark_delivery(
        &self,
        id: &str,
        status: DeliveryStatus,
        provider_message_id: Option<&str>,
        error: Option<&str>,
    ) -> Result<bool, DatabaseError> {
        self.check(Fault::MarkDelivery)?;
        self.inner
            .mark_delivery(id, status, provider_message_id, error)
            .await
    }

    async fn messages_with_status(
        &self,
        status: DeliveryStatus,
        limit: usize,
    ) -> Result<Vec<StoredMessage>, DatabaseError> {
        self.inner.messages_with_status(status, limit).await
    }
}

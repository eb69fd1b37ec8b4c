//! libSQL backend: async `ConversationStore` implementation.
//!
//! Supports local file and in-memory databases. Every write that has to be
//! atomic (sequence allocation, dedup, terminal status) is a single SQL
//! statement, so the shared connection never needs an explicit transaction.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, Rows, params};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::store::migrations;
use crate::store::model::{
    Client, DeliveryStatus, Direction, InsertOutcome, NewInboundMessage, NewOutboundMessage,
    StoredMessage, normalize_tag,
};
use crate::store::traits::ConversationStore;

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.init_schema().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.init_schema().await?;
        Ok(backend)
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }

    async fn query_one_message(
        &self,
        sql: &str,
        arg: &str,
        ctx: &str,
    ) -> Result<Option<StoredMessage>, DatabaseError> {
        let rows = self
            .conn()
            .query(sql, params![arg])
            .await
            .map_err(|e| DatabaseError::Query(format!("{ctx}: {e}")))?;
        Ok(collect_messages(rows, ctx).await?.into_iter().next())
    }

    async fn query_one_client(
        &self,
        sql: &str,
        args: Vec<libsql::Value>,
        ctx: &str,
    ) -> Result<Option<Client>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(sql, args)
            .await
            .map_err(|e| DatabaseError::Query(format!("{ctx}: {e}")))?;

        let row = match rows.next().await {
            Ok(Some(row)) => row,
            Ok(None) => return Ok(None),
            Err(e) => return Err(DatabaseError::Query(format!("{ctx}: {e}"))),
        };
        let mut client =
            row_to_client(&row).map_err(|e| DatabaseError::Query(format!("row parse: {e}")))?;
        client.tags = self.client_tags(&client.id).await?;
        Ok(Some(client))
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Canonical timestamp format: fixed-width microseconds in UTC, so string
/// comparison in SQL matches chronological order.
fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn parse_optional_datetime(s: &Option<String>) -> Option<DateTime<Utc>> {
    s.as_ref().map(|s| parse_datetime(s))
}

/// Convert `Option<&str>` to libsql Value.
fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

const CLIENT_COLUMNS: &str = "id, organization_id, address, display_name, last_contact, created_at";

const MESSAGE_COLUMNS: &str = "id, client_id, seq, direction, body, external_id, dedup_key, media_url, automated, delivery_status, provider_message_id, delivery_error, created_at, updated_at";

/// Map a libsql Row to a Client (tags are loaded separately).
fn row_to_client(row: &libsql::Row) -> Result<Client, libsql::Error> {
    let last_contact: Option<String> = row.get(4).ok();
    let created_str: String = row.get(5)?;
    Ok(Client {
        id: row.get(0)?,
        organization_id: row.get(1)?,
        address: row.get(2)?,
        display_name: row.get(3).ok(),
        tags: BTreeSet::new(),
        last_contact: parse_optional_datetime(&last_contact),
        created_at: parse_datetime(&created_str),
    })
}

/// Map a libsql Row to a StoredMessage. Column order matches MESSAGE_COLUMNS.
fn row_to_message(row: &libsql::Row) -> Result<StoredMessage, libsql::Error> {
    let direction_str: String = row.get(3)?;
    let automated: i64 = row.get(8)?;
    let status_str: Option<String> = row.get(9).ok();
    let created_str: String = row.get(12)?;
    let updated_str: String = row.get(13)?;

    Ok(StoredMessage {
        id: row.get(0)?,
        client_id: row.get(1)?,
        seq: row.get(2)?,
        direction: Direction::parse(&direction_str),
        body: row.get(4)?,
        external_id: row.get(5).ok(),
        dedup_key: row.get(6).ok(),
        media_url: row.get(7).ok(),
        automated: automated != 0,
        delivery_status: status_str.as_deref().and_then(DeliveryStatus::parse),
        provider_message_id: row.get(10).ok(),
        delivery_error: row.get(11).ok(),
        created_at: parse_datetime(&created_str),
        updated_at: parse_datetime(&updated_str),
    })
}

async fn collect_messages(mut rows: Rows, ctx: &str) -> Result<Vec<StoredMessage>, DatabaseError> {
    let mut messages = Vec::new();
    loop {
        match rows.next().await {
            Ok(Some(row)) => {
                let msg = row_to_message(&row)
                    .map_err(|e| DatabaseError::Query(format!("{ctx}: row parse: {e}")))?;
                messages.push(msg);
            }
            Ok(None) => break,
            Err(e) => return Err(DatabaseError::Query(format!("{ctx}: {e}"))),
        }
    }
    Ok(messages)
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl ConversationStore for LibSqlBackend {
    async fn init_schema(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(self.conn()).await
    }

    // ── Clients ─────────────────────────────────────────────────────

    async fn upsert_client(
        &self,
        organization_id: &str,
        address: &str,
        display_name: Option<&str>,
        seen_at: DateTime<Utc>,
    ) -> Result<Client, DatabaseError> {
        let id = Uuid::new_v4().to_string();
        let now = ts(Utc::now());
        self.conn()
            .execute(
                "INSERT INTO clients (id, organization_id, address, display_name,
                    last_contact, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)
                 ON CONFLICT (organization_id, address) DO UPDATE SET
                    display_name = COALESCE(clients.display_name, excluded.display_name),
                    last_contact = CASE
                        WHEN clients.last_contact IS NULL
                          OR excluded.last_contact > clients.last_contact
                        THEN excluded.last_contact
                        ELSE clients.last_contact
                    END,
                    updated_at = excluded.updated_at",
                params![
                    id,
                    organization_id,
                    address,
                    opt_text(display_name),
                    ts(seen_at),
                    now,
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("upsert_client: {e}")))?;

        self.find_client_by_address(organization_id, address)
            .await?
            .ok_or_else(|| DatabaseError::NotFound {
                entity: "client".into(),
                id: format!("{organization_id}/{address}"),
            })
    }

    async fn get_client(&self, id: &str) -> Result<Option<Client>, DatabaseError> {
        self.query_one_client(
            &format!("SELECT {CLIENT_COLUMNS} FROM clients WHERE id = ?1"),
            vec![libsql::Value::Text(id.to_string())],
            "get_client",
        )
        .await
    }

    async fn find_client_by_address(
        &self,
        organization_id: &str,
        address: &str,
    ) -> Result<Option<Client>, DatabaseError> {
        self.query_one_client(
            &format!(
                "SELECT {CLIENT_COLUMNS} FROM clients WHERE organization_id = ?1 AND address = ?2"
            ),
            vec![
                libsql::Value::Text(organization_id.to_string()),
                libsql::Value::Text(address.to_string()),
            ],
            "find_client_by_address",
        )
        .await
    }

    async fn add_client_tags(
        &self,
        client_id: &str,
        tags: &[String],
    ) -> Result<BTreeSet<String>, DatabaseError> {
        let conn = self.conn();
        for tag in tags.iter().filter_map(|t| normalize_tag(t)) {
            // Row-level union: concurrent writers can only add, never overwrite.
            conn.execute(
                "INSERT OR IGNORE INTO client_tags (client_id, tag)
                 SELECT ?1, ?2 WHERE EXISTS (SELECT 1 FROM clients WHERE id = ?1)",
                params![client_id, tag],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("add_client_tags: {e}")))?;
        }
        debug!(client_id, count = tags.len(), "Client tags merged");
        self.client_tags(client_id).await
    }

    async fn client_tags(&self, client_id: &str) -> Result<BTreeSet<String>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT tag FROM client_tags WHERE client_id = ?1 ORDER BY tag",
                params![client_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("client_tags: {e}")))?;

        let mut tags = BTreeSet::new();
        loop {
            match rows.next().await {
                Ok(Some(row)) => {
                    let tag: String = row
                        .get(0)
                        .map_err(|e| DatabaseError::Query(format!("client_tags: {e}")))?;
                    tags.insert(tag);
                }
                Ok(None) => break,
                Err(e) => return Err(DatabaseError::Query(format!("client_tags: {e}"))),
            }
        }
        Ok(tags)
    }

    // ── Messages ────────────────────────────────────────────────────

    async fn insert_inbound(
        &self,
        message: &NewInboundMessage<'_>,
    ) -> Result<InsertOutcome, DatabaseError> {
        let id = Uuid::new_v4().to_string();
        let now = ts(Utc::now());

        // seq is allocated inside the INSERT so allocation and write are one step.
        let changed = self
            .conn()
            .execute(
                "INSERT OR IGNORE INTO messages (id, client_id, seq, direction, body,
                    external_id, dedup_key, media_url, automated, delivery_status,
                    created_at, updated_at)
                 SELECT ?1, ?2, COALESCE(MAX(seq), 0) + 1, 'inbound', ?3, ?4, ?5, ?6, 0, NULL, ?7, ?8
                 FROM messages WHERE client_id = ?2",
                params![
                    id.clone(),
                    message.client_id,
                    message.body,
                    opt_text(message.external_id),
                    message.dedup_key,
                    opt_text(message.media_url),
                    ts(message.received_at),
                    now,
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_inbound: {e}")))?;

        if changed == 0 {
            return match self.find_by_dedup_key(message.dedup_key).await? {
                Some(_) => {
                    debug!(dedup_key = message.dedup_key, "Inbound message already stored");
                    Ok(InsertOutcome::Duplicate)
                }
                None => Err(DatabaseError::Constraint(format!(
                    "insert_inbound ignored for client {} without a dedup match",
                    message.client_id
                ))),
            };
        }

        let stored = self.get_message(&id).await?.ok_or_else(|| DatabaseError::NotFound {
            entity: "message".into(),
            id: id.clone(),
        })?;
        debug!(id = %id, client_id = message.client_id, seq = stored.seq, "Inbound message stored");
        Ok(InsertOutcome::Inserted(stored))
    }

    async fn insert_outbound(
        &self,
        message: &NewOutboundMessage<'_>,
    ) -> Result<StoredMessage, DatabaseError> {
        let id = Uuid::new_v4().to_string();
        let now = ts(Utc::now());

        self.conn()
            .execute(
                "INSERT INTO messages (id, client_id, seq, direction, body,
                    automated, delivery_status, created_at, updated_at)
                 SELECT ?1, ?2, COALESCE(MAX(seq), 0) + 1, 'outbound', ?3, ?4, 'pending', ?5, ?5
                 FROM messages WHERE client_id = ?2",
                params![
                    id.clone(),
                    message.client_id,
                    message.body,
                    i64::from(message.automated),
                    now,
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_outbound: {e}")))?;

        let stored = self.get_message(&id).await?.ok_or_else(|| DatabaseError::NotFound {
            entity: "message".into(),
            id: id.clone(),
        })?;
        debug!(id = %id, client_id = message.client_id, seq = stored.seq, "Outbound message stored");
        Ok(stored)
    }

    async fn get_message(&self, id: &str) -> Result<Option<StoredMessage>, DatabaseError> {
        self.query_one_message(
            &format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?1"),
            id,
            "get_message",
        )
        .await
    }

    async fn find_by_dedup_key(
        &self,
        dedup_key: &str,
    ) -> Result<Option<StoredMessage>, DatabaseError> {
        self.query_one_message(
            &format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE dedup_key = ?1"),
            dedup_key,
            "find_by_dedup_key",
        )
        .await
    }

    async fn recent_messages(
        &self,
        client_id: &str,
        up_to_seq: Option<i64>,
        limit: usize,
    ) -> Result<Vec<StoredMessage>, DatabaseError> {
        let rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {MESSAGE_COLUMNS} FROM (
                        SELECT {MESSAGE_COLUMNS} FROM messages
                        WHERE client_id = ?1 AND seq <= ?2
                        ORDER BY seq DESC LIMIT ?3
                     ) ORDER BY seq ASC"
                ),
                params![client_id, up_to_seq.unwrap_or(i64::MAX), limit as i64],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("recent_messages: {e}")))?;
        collect_messages(rows, "recent_messages").await
    }

    async fn list_messages(
        &self,
        client_id: &str,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<StoredMessage>, DatabaseError> {
        let rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {MESSAGE_COLUMNS} FROM messages WHERE client_id = ?1
                     ORDER BY seq DESC LIMIT ?2 OFFSET ?3"
                ),
                params![client_id, limit as i64, offset as i64],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_messages: {e}")))?;
        collect_messages(rows, "list_messages").await
    }

    async fn mark_delivery(
        &self,
        id: &str,
        status: DeliveryStatus,
        provider_message_id: Option<&str>,
        error: Option<&str>,
    ) -> Result<bool, DatabaseError> {
        if !status.is_terminal() {
            return Err(DatabaseError::Constraint(format!(
                "cannot move message {id} back to {}",
                status.as_str()
            )));
        }
        let changed = self
            .conn()
            .execute(
                "UPDATE messages
                 SET delivery_status = ?1, provider_message_id = ?2, delivery_error = ?3,
                     updated_at = ?4
                 WHERE id = ?5 AND direction = 'outbound' AND delivery_status = 'pending'",
                params![
                    status.as_str(),
                    opt_text(provider_message_id),
                    opt_text(error),
                    ts(Utc::now()),
                    id,
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("mark_delivery: {e}")))?;

        debug!(id, status = status.as_str(), applied = changed > 0, "Delivery status update");
        Ok(changed > 0)
    }

    async fn messages_with_status(
        &self,
        status: DeliveryStatus,
        limit: usize,
    ) -> Result<Vec<StoredMessage>, DatabaseError> {
        let rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {MESSAGE_COLUMNS} FROM messages
                     WHERE direction = 'outbound' AND delivery_status = ?1
                     ORDER BY updated_at DESC LIMIT ?2"
                ),
                params![status.as_str(), limit as i64],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("messages_with_status: {e}")))?;
        collect_messages(rows, "messages_with_status").await
    }
}

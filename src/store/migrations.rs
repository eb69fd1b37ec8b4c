//! Version-tracked database migrations for the libSQL backend.
//!
//! Steps are recorded in `_migrations`; `run_migrations()` applies the
//! ones the database has not seen yet, in order.

use libsql::Connection;

use crate::error::DatabaseError;

struct Migration {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

/// Append only. Never edit a released step.
static MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "initial_schema",
        sql: r#"
            CREATE TABLE IF NOT EXISTS clients (
                id TEXT PRIMARY KEY,
                organization_id TEXT NOT NULL,
                address TEXT NOT NULL,
                display_name TEXT,
                last_contact TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                UNIQUE (organization_id, address)
            );
            CREATE INDEX IF NOT EXISTS idx_clients_org ON clients(organization_id);

            CREATE TABLE IF NOT EXISTS client_tags (
                client_id TEXT NOT NULL REFERENCES clients(id) ON DELETE CASCADE,
                tag TEXT NOT NULL,
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                PRIMARY KEY (client_id, tag)
            );

            CREATE TABLE IF NOT EXISTS messages (
                id TEXT PRIMARY KEY,
                client_id TEXT NOT NULL REFERENCES clients(id) ON DELETE CASCADE,
                seq INTEGER NOT NULL,
                direction TEXT NOT NULL,
                body TEXT NOT NULL,
                external_id TEXT,
                dedup_key TEXT UNIQUE,
                media_url TEXT,
                automated INTEGER NOT NULL DEFAULT 0,
                delivery_status TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                UNIQUE (client_id, seq)
            );
            CREATE INDEX IF NOT EXISTS idx_messages_client ON messages(client_id, seq);
        "#,
    },
    Migration {
        version: 2,
        name: "delivery_tracking",
        sql: r#"
            ALTER TABLE messages ADD COLUMN provider_message_id TEXT;
            ALTER TABLE messages ADD COLUMN delivery_error TEXT;
            CREATE INDEX IF NOT EXISTS idx_messages_delivery_status
                ON messages(delivery_status);
        "#,
    },
];

/// Apply every migration newer than the recorded schema version.
///
/// Each step runs in its own transaction together with its ledger row, so a
/// failed step leaves the schema at the previous version.
pub async fn run_migrations(conn: &Connection) -> Result<(), DatabaseError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );",
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("create _migrations: {e}")))?;

    let applied = schema_version(conn).await?;
    let pending: Vec<&Migration> = MIGRATIONS.iter().filter(|m| m.version > applied).collect();
    if pending.is_empty() {
        tracing::debug!(version = applied, "Schema up to date");
        return Ok(());
    }

    for step in pending {
        tracing::info!(version = step.version, name = step.name, "Applying migration");
        let batch = format!(
            "BEGIN;\n{}\nINSERT INTO _migrations (version, name) VALUES ({}, '{}');\nCOMMIT;",
            step.sql, step.version, step.name
        );
        if let Err(e) = conn.execute_batch(&batch).await {
            let _ = conn.execute("ROLLBACK", ()).await;
            return Err(DatabaseError::Migration(format!(
                "V{} {}: {e}",
                step.version, step.name
            )));
        }
    }
    Ok(())
}

/// Highest applied version, 0 on a fresh database.
async fn schema_version(conn: &Connection) -> Result<i64, DatabaseError> {
    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM _migrations", ())
        .await
        .map_err(|e| DatabaseError::Migration(format!("read schema version: {e}")))?;
    match rows.next().await {
        Ok(Some(row)) => row
            .get::<i64>(0)
            .map_err(|e| DatabaseError::Migration(format!("parse schema version: {e}"))),
        Ok(None) => Ok(0),
        Err(e) => Err(DatabaseError::Migration(format!("read schema version: {e}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_conn() -> Connection {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .unwrap();
        db.connect().unwrap()
    }

    #[tokio::test]
    async fn migrations_create_all_tables() {
        let conn = test_conn().await;
        run_migrations(&conn).await.unwrap();

        for table in &["clients", "client_tags", "messages", "_migrations"] {
            let mut rows = conn
                .query(
                    "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name=?1",
                    libsql::params![*table],
                )
                .await
                .unwrap();
            let row = rows.next().await.unwrap().unwrap();
            let count: i64 = row.get(0).unwrap();
            assert_eq!(count, 1, "Table '{}' should exist", table);
        }
    }

    #[tokio::test]
    async fn rerun_is_a_no_op() {
        let conn = test_conn().await;
        run_migrations(&conn).await.unwrap();
        run_migrations(&conn).await.unwrap();

        assert_eq!(schema_version(&conn).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn ledger_records_each_step() {
        let conn = test_conn().await;
        run_migrations(&conn).await.unwrap();

        let mut rows = conn
            .query("SELECT version, name FROM _migrations ORDER BY version", ())
            .await
            .unwrap();
        let mut steps = Vec::new();
        while let Some(row) = rows.next().await.unwrap() {
            steps.push((row.get::<i64>(0).unwrap(), row.get::<String>(1).unwrap()));
        }
        assert_eq!(
            steps,
            vec![
                (1, "initial_schema".to_string()),
                (2, "delivery_tracking".to_string())
            ]
        );
    }

    #[tokio::test]
    async fn delivery_columns_exist() {
        let conn = test_conn().await;
        run_migrations(&conn).await.unwrap();

        conn.execute(
            "INSERT INTO messages (id, client_id, seq, direction, body, created_at, updated_at,
                provider_message_id, delivery_error)
             VALUES ('m1', 'c1', 1, 'outbound', 'hi', '2026-01-01', '2026-01-01', 'SM1', NULL)",
            (),
        )
        .await
        .unwrap();
    }
}

//! Version-tracked database migrations for the libSQL backend.
//!
//! Each migration has a version number and SQL. `run_migrations()` checks
//! the current version and applies only the new ones sequentially.

use libsql::Connection;

use crate::error::DatabaseError;

/// A single migration step.
struct Migration {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

/// All migrations in order. Add new versions to the end.
static MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "initial_schema",
        sql: r#"
            CREATE TABLE IF NOT EXISTS recipients (
                email TEXT PRIMARY KEY,
                opted_in INTEGER NOT NULL DEFAULT 1,
                opt_in_changed_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS emails (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                recipient TEXT NOT NULL REFERENCES recipients(email),
                template_id TEXT NOT NULL,
                created_at TEXT NOT NULL,
                delivery_id TEXT,
                sent_at TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_emails_recipient ON emails(recipient);

            CREATE TABLE IF NOT EXISTS unsubscribe_events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                recipient TEXT NOT NULL REFERENCES recipients(email),
                email_id INTEGER NOT NULL,
                occurred_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_unsubscribe_events_recipient
                ON unsubscribe_events(recipient);
        "#,
    },
    Migration {
        version: 2,
        name: "series",
        sql: r#"
            CREATE TABLE IF NOT EXISTS enrollments (
                recipient TEXT NOT NULL REFERENCES recipients(email),
                series TEXT NOT NULL,
                next_step_id TEXT,
                next_step_at TEXT,
                started_at TEXT NOT NULL,
                PRIMARY KEY (recipient, series)
            );
            CREATE INDEX IF NOT EXISTS idx_enrollments_due ON enrollments(next_step_at);

            CREATE TABLE IF NOT EXISTS step_executions (
                recipient TEXT NOT NULL,
                series TEXT NOT NULL,
                step_id TEXT NOT NULL,
                email_id INTEGER NOT NULL,
                executed_at TEXT NOT NULL,
                PRIMARY KEY (recipient, series, step_id)
            );
        "#,
    },
];

/// Run all pending migrations against the given connection.
///
/// Creates the `_migrations` table if it doesn't exist.
pub async fn run_migrations(conn: &Connection) -> Result<(), DatabaseError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        (),
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("Failed to create _migrations table: {e}")))?;

    let current_version = get_current_version(conn).await?;

    for migration in MIGRATIONS {
        if migration.version > current_version {
            tracing::info!(
                version = migration.version,
                name = migration.name,
                "Applying migration"
            );
            conn.execute_batch(migration.sql).await.map_err(|e| {
                DatabaseError::Migration(format!(
                    "Migration V{} ({}) failed: {e}",
                    migration.version, migration.name
                ))
            })?;
            seed_version(conn, migration.version, migration.name).await?;
        }
    }

    let version = get_current_version(conn).await?;
    tracing::info!(version, "Database migrations complete");
    Ok(())
}

/// Get the highest applied migration version, or 0 if none.
async fn get_current_version(conn: &Connection) -> Result<i64, DatabaseError> {
    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM _migrations", ())
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to query migration version: {e}")))?;

    let row = rows
        .next()
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to read migration version: {e}")))?;

    match row {
        Some(row) => row.get::<i64>(0).map_err(|e| {
            DatabaseError::Migration(format!("Failed to parse migration version: {e}"))
        }),
        None => Ok(0),
    }
}

/// Insert a version record into `_migrations`.
async fn seed_version(conn: &Connection, version: i64, name: &str) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT OR IGNORE INTO _migrations (version, name) VALUES (?1, ?2)",
        libsql::params![version, name],
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("Failed to record migration V{version}: {e}")))?;
    Ok(())
}

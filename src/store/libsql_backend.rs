//! libSQL backend — async `Database` trait implementation.
//!
//! Supports local file and in-memory databases. Timestamps are stored as
//! RFC 3339 text with fixed microsecond precision and a `Z` suffix, so string
//! comparison in SQL orders them correctly.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info};

use crate::error::DatabaseError;
use crate::store::migrations;
use crate::store::traits::{
    Database, DueEnrollment, EmailRecord, Enrollment, NextStep, Recipient, StepExecution,
    UnsubscribeEvent,
};

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
}

// ── Helper functions ────────────────────────────────────────────────

/// Canonical timestamp encoding for every column we write.
fn fmt_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn parse_optional_datetime(s: Option<String>) -> Option<DateTime<Utc>> {
    s.as_deref().map(parse_datetime)
}

fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

/// Drain a result set through `map`, skipping rows that fail to parse.
async fn collect_rows<T>(
    mut rows: libsql::Rows,
    what: &str,
    map: impl Fn(&libsql::Row) -> Result<T, libsql::Error>,
) -> Vec<T> {
    let mut out = Vec::new();
    while let Ok(Some(row)) = rows.next().await {
        match map(&row) {
            Ok(item) => out.push(item),
            Err(e) => tracing::warn!("Skipping {what} row: {e}"),
        }
    }
    out
}

/// Read the first row of a result set through `map`.
async fn first_row<T>(
    mut rows: libsql::Rows,
    what: &str,
    map: impl Fn(&libsql::Row) -> Result<T, libsql::Error>,
) -> Result<Option<T>, DatabaseError> {
    match rows.next().await {
        Ok(Some(row)) => map(&row)
            .map(Some)
            .map_err(|e| DatabaseError::Query(format!("{what}: row parse: {e}"))),
        Ok(None) => Ok(None),
        Err(e) => Err(DatabaseError::Query(format!("{what}: {e}"))),
    }
}

const EMAIL_COLUMNS: &str = "id, recipient, template_id, created_at, delivery_id, sent_at";

fn row_to_email(row: &libsql::Row) -> Result<EmailRecord, libsql::Error> {
    Ok(EmailRecord {
        id: row.get(0)?,
        recipient: row.get(1)?,
        template_id: row.get(2)?,
        created_at: parse_datetime(&row.get::<String>(3)?),
        delivery_id: row.get::<String>(4).ok(),
        sent_at: parse_optional_datetime(row.get::<String>(5).ok()),
    })
}

const ENROLLMENT_COLUMNS: &str = "recipient, series, next_step_id, next_step_at, started_at";

fn row_to_enrollment(row: &libsql::Row) -> Result<Enrollment, libsql::Error> {
    Ok(Enrollment {
        recipient: row.get(0)?,
        series: row.get(1)?,
        next_step_id: row.get::<String>(2).ok(),
        next_step_at: parse_optional_datetime(row.get::<String>(3).ok()),
        started_at: parse_datetime(&row.get::<String>(4)?),
    })
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl Database for LibSqlBackend {
    async fn init_schema(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(self.conn()).await
    }

    // ── Recipients ──────────────────────────────────────────────────

    async fn ensure_recipient(&self, email: &str) -> Result<(), DatabaseError> {
        let now = fmt_ts(Utc::now());
        self.conn()
            .execute(
                "INSERT INTO recipients (email, opted_in, opt_in_changed_at)
                 VALUES (?1, 1, ?2)
                 ON CONFLICT (email) DO NOTHING",
                params![email, now],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("ensure_recipient: {e}")))?;
        Ok(())
    }

    async fn get_recipient(&self, email: &str) -> Result<Option<Recipient>, DatabaseError> {
        let rows = self
            .conn()
            .query(
                "SELECT email, opted_in, opt_in_changed_at FROM recipients WHERE email = ?1",
                params![email],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_recipient: {e}")))?;

        first_row(rows, "get_recipient", |row| {
            Ok(Recipient {
                email: row.get(0)?,
                opted_in: row.get::<i64>(1)? != 0,
                opt_in_changed_at: parse_datetime(&row.get::<String>(2)?),
            })
        })
        .await
    }

    async fn opt_out(&self, email: &str) -> Result<bool, DatabaseError> {
        let now = fmt_ts(Utc::now());
        let changed = self
            .conn()
            .execute(
                "UPDATE recipients SET opted_in = 0, opt_in_changed_at = ?2
                 WHERE email = ?1 AND opted_in = 1",
                params![email, now],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("opt_out: {e}")))?;

        debug!(recipient = email, changed, "Recipient opt-out applied");
        Ok(changed > 0)
    }

    async fn insert_unsubscribe_event(
        &self,
        email: &str,
        email_id: i64,
    ) -> Result<(), DatabaseError> {
        let now = fmt_ts(Utc::now());
        self.conn()
            .execute(
                "INSERT INTO unsubscribe_events (recipient, email_id, occurred_at)
                 VALUES (?1, ?2, ?3)",
                params![email, email_id, now],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_unsubscribe_event: {e}")))?;
        Ok(())
    }

    async fn list_unsubscribe_events(
        &self,
        email: &str,
    ) -> Result<Vec<UnsubscribeEvent>, DatabaseError> {
        let rows = self
            .conn()
            .query(
                "SELECT id, recipient, email_id, occurred_at FROM unsubscribe_events
                 WHERE recipient = ?1 ORDER BY id ASC",
                params![email],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_unsubscribe_events: {e}")))?;

        Ok(collect_rows(rows, "unsubscribe event", |row| {
            Ok(UnsubscribeEvent {
                id: row.get(0)?,
                recipient: row.get(1)?,
                email_id: row.get(2)?,
                occurred_at: parse_datetime(&row.get::<String>(3)?),
            })
        })
        .await)
    }

    // ── Emails ──────────────────────────────────────────────────────

    async fn insert_email(&self, recipient: &str, template_id: &str) -> Result<i64, DatabaseError> {
        let now = fmt_ts(Utc::now());
        let rows = self
            .conn()
            .query(
                "INSERT INTO emails (recipient, template_id, created_at)
                 VALUES (?1, ?2, ?3)
                 RETURNING id",
                params![recipient, template_id, now],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_email: {e}")))?;

        let id = first_row(rows, "insert_email", |row| row.get::<i64>(0))
            .await?
            .ok_or_else(|| DatabaseError::Query("insert_email: no id returned".to_string()))?;

        debug!(email_id = id, recipient, template_id, "Email row inserted");
        Ok(id)
    }

    async fn mark_email_sent(&self, id: i64, delivery_id: &str) -> Result<(), DatabaseError> {
        let now = fmt_ts(Utc::now());
        let changed = self
            .conn()
            .execute(
                "UPDATE emails SET delivery_id = ?2, sent_at = ?3 WHERE id = ?1",
                params![id, delivery_id, now],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("mark_email_sent: {e}")))?;

        if changed == 0 {
            return Err(DatabaseError::NotFound {
                entity: "email".to_string(),
                id: id.to_string(),
            });
        }
        Ok(())
    }

    async fn get_email(&self, id: i64) -> Result<Option<EmailRecord>, DatabaseError> {
        let rows = self
            .conn()
            .query(
                &format!("SELECT {EMAIL_COLUMNS} FROM emails WHERE id = ?1"),
                params![id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_email: {e}")))?;

        first_row(rows, "get_email", row_to_email).await
    }

    async fn list_emails(&self, recipient: &str) -> Result<Vec<EmailRecord>, DatabaseError> {
        let rows = self
            .conn()
            .query(
                &format!("SELECT {EMAIL_COLUMNS} FROM emails WHERE recipient = ?1 ORDER BY id ASC"),
                params![recipient],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_emails: {e}")))?;

        Ok(collect_rows(rows, "email", row_to_email).await)
    }

    // ── Enrollments ─────────────────────────────────────────────────

    async fn insert_enrollment(
        &self,
        recipient: &str,
        series: &str,
        first_step_id: &str,
        due_at: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let now = fmt_ts(Utc::now());
        let inserted = self
            .conn()
            .execute(
                "INSERT INTO enrollments (recipient, series, next_step_id, next_step_at, started_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT (recipient, series) DO NOTHING",
                params![recipient, series, first_step_id, fmt_ts(due_at), now],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_enrollment: {e}")))?;

        Ok(inserted > 0)
    }

    async fn get_enrollment(
        &self,
        recipient: &str,
        series: &str,
    ) -> Result<Option<Enrollment>, DatabaseError> {
        let rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {ENROLLMENT_COLUMNS} FROM enrollments WHERE recipient = ?1 AND series = ?2"
                ),
                params![recipient, series],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_enrollment: {e}")))?;

        first_row(rows, "get_enrollment", row_to_enrollment).await
    }

    async fn due_enrollments(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<DueEnrollment>, DatabaseError> {
        let rows = self
            .conn()
            .query(
                "SELECT e.recipient, e.series, e.next_step_id
                 FROM enrollments e
                 INNER JOIN recipients r ON r.email = e.recipient
                 WHERE e.next_step_id IS NOT NULL
                   AND e.next_step_at <= ?1
                   AND r.opted_in = 1
                 ORDER BY e.next_step_at ASC
                 LIMIT ?2",
                params![fmt_ts(now), limit as i64],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("due_enrollments: {e}")))?;

        Ok(collect_rows(rows, "enrollment", |row| {
            Ok(DueEnrollment {
                recipient: row.get(0)?,
                series: row.get(1)?,
                step_id: row.get(2)?,
            })
        })
        .await)
    }

    async fn advance_enrollment(
        &self,
        recipient: &str,
        series: &str,
        next: Option<&NextStep>,
    ) -> Result<(), DatabaseError> {
        let (step_id, due_at) = match next {
            Some(next) => (Some(next.step_id.as_str()), Some(fmt_ts(next.due_at))),
            None => (None, None),
        };
        self.conn()
            .execute(
                "UPDATE enrollments SET next_step_id = ?3, next_step_at = ?4
                 WHERE recipient = ?1 AND series = ?2",
                params![
                    recipient,
                    series,
                    opt_text(step_id),
                    opt_text(due_at.as_deref()),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("advance_enrollment: {e}")))?;

        debug!(recipient, series, next_step = ?step_id, "Enrollment advanced");
        Ok(())
    }

    // ── Step executions ─────────────────────────────────────────────

    async fn upsert_step_execution(
        &self,
        recipient: &str,
        series: &str,
        step_id: &str,
        email_id: i64,
    ) -> Result<(), DatabaseError> {
        let now = fmt_ts(Utc::now());
        self.conn()
            .execute(
                "INSERT INTO step_executions (recipient, series, step_id, email_id, executed_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT (recipient, series, step_id) DO UPDATE SET email_id = excluded.email_id",
                params![recipient, series, step_id, email_id, now],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("upsert_step_execution: {e}")))?;
        Ok(())
    }

    async fn list_step_executions(
        &self,
        recipient: &str,
        series: &str,
    ) -> Result<Vec<StepExecution>, DatabaseError> {
        let rows = self
            .conn()
            .query(
                "SELECT recipient, series, step_id, email_id, executed_at FROM step_executions
                 WHERE recipient = ?1 AND series = ?2 ORDER BY executed_at ASC",
                params![recipient, series],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_step_executions: {e}")))?;

        Ok(collect_rows(rows, "step execution", |row| {
            Ok(StepExecution {
                recipient: row.get(0)?,
                series: row.get(1)?,
                step_id: row.get(2)?,
                email_id: row.get(3)?,
                executed_at: parse_datetime(&row.get::<String>(4)?),
            })
        })
        .await)
    }
}

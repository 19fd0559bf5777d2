//! `Database` trait — single async interface for all persistence.
//!
//! Every method is one auto-committing statement. Idempotence and concurrent
//! duplicate handling come from unique constraints plus `ON CONFLICT`, never
//! from application-level locks.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::DatabaseError;

/// A subscriber and their consent state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Recipient {
    pub email: String,
    pub opted_in: bool,
    pub opt_in_changed_at: DateTime<Utc>,
}

/// One outbound message attempt.
///
/// `delivery_id` and `sent_at` stay `None` while the row is pending, and
/// forever if the provider rejected the message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EmailRecord {
    pub id: i64,
    pub recipient: String,
    pub template_id: String,
    pub created_at: DateTime<Utc>,
    pub delivery_id: Option<String>,
    pub sent_at: Option<DateTime<Utc>>,
}

impl EmailRecord {
    pub fn is_pending(&self) -> bool {
        self.delivery_id.is_none()
    }
}

/// A recipient's progress through one campaign.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Enrollment {
    pub recipient: String,
    pub series: String,
    /// `None` once the campaign is complete.
    pub next_step_id: Option<String>,
    pub next_step_at: Option<DateTime<Utc>>,
    pub started_at: DateTime<Utc>,
}

impl Enrollment {
    pub fn is_completed(&self) -> bool {
        self.next_step_id.is_none()
    }
}

/// A due enrollment as returned by [`Database::due_enrollments`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DueEnrollment {
    pub recipient: String,
    pub series: String,
    pub step_id: String,
}

/// The step an enrollment moves to after a successful send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NextStep {
    pub step_id: String,
    pub due_at: DateTime<Utc>,
}

/// Audit and idempotency record of a completed step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StepExecution {
    pub recipient: String,
    pub series: String,
    pub step_id: String,
    pub email_id: i64,
    pub executed_at: DateTime<Utc>,
}

/// Audit entry written when an unsubscribe flips consent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnsubscribeEvent {
    pub id: i64,
    pub recipient: String,
    pub email_id: i64,
    pub occurred_at: DateTime<Utc>,
}

/// Backend-agnostic database trait.
#[async_trait]
pub trait Database: Send + Sync {
    /// Run all pending schema migrations.
    async fn init_schema(&self) -> Result<(), DatabaseError>;

    // ── Recipients ──────────────────────────────────────────────────

    /// Insert the recipient as opted in. No-op if it already exists.
    async fn ensure_recipient(&self, email: &str) -> Result<(), DatabaseError>;

    async fn get_recipient(&self, email: &str) -> Result<Option<Recipient>, DatabaseError>;

    /// Flip consent to false if it is currently true.
    /// Returns whether a row changed.
    async fn opt_out(&self, email: &str) -> Result<bool, DatabaseError>;

    async fn insert_unsubscribe_event(
        &self,
        email: &str,
        email_id: i64,
    ) -> Result<(), DatabaseError>;

    async fn list_unsubscribe_events(
        &self,
        email: &str,
    ) -> Result<Vec<UnsubscribeEvent>, DatabaseError>;

    // ── Emails ──────────────────────────────────────────────────────

    /// Insert a pending email row. Returns the generated id.
    async fn insert_email(&self, recipient: &str, template_id: &str) -> Result<i64, DatabaseError>;

    /// Record the provider's delivery id and the send time.
    async fn mark_email_sent(&self, id: i64, delivery_id: &str) -> Result<(), DatabaseError>;

    async fn get_email(&self, id: i64) -> Result<Option<EmailRecord>, DatabaseError>;

    /// All emails for a recipient, oldest first.
    async fn list_emails(&self, recipient: &str) -> Result<Vec<EmailRecord>, DatabaseError>;

    // ── Enrollments ─────────────────────────────────────────────────

    /// Insert an enrollment unless one exists for (recipient, series).
    /// Returns whether a row was inserted.
    async fn insert_enrollment(
        &self,
        recipient: &str,
        series: &str,
        first_step_id: &str,
        due_at: DateTime<Utc>,
    ) -> Result<bool, DatabaseError>;

    async fn get_enrollment(
        &self,
        recipient: &str,
        series: &str,
    ) -> Result<Option<Enrollment>, DatabaseError>;

    /// Up to `limit` enrollments due at `now` whose recipient is opted in.
    async fn due_enrollments(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<DueEnrollment>, DatabaseError>;

    /// Point the enrollment at `next`, or mark it complete when `None`.
    async fn advance_enrollment(
        &self,
        recipient: &str,
        series: &str,
        next: Option<&NextStep>,
    ) -> Result<(), DatabaseError>;

    // ── Step executions ─────────────────────────────────────────────

    /// Insert the execution record, or refresh its email id if the step
    /// already ran.
    async fn upsert_step_execution(
        &self,
        recipient: &str,
        series: &str,
        step_id: &str,
        email_id: i64,
    ) -> Result<(), DatabaseError>;

    async fn list_step_executions(
        &self,
        recipient: &str,
        series: &str,
    ) -> Result<Vec<StepExecution>, DatabaseError>;
}

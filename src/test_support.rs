//! Stub collaborators shared by unit tests.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::campaign::{Campaign, CampaignSource, Step, Template};
use crate::error::{CampaignError, DatabaseError, TransportError};
use crate::store::{
    Database, DueEnrollment, EmailRecord, Enrollment, NextStep, Recipient, StepExecution,
    UnsubscribeEvent,
};
use crate::transport::{OutgoingMessage, Transport};

/// What a [`RecordingTransport`] saw.
#[derive(Debug, Clone)]
pub struct SentMessage {
    pub recipient: String,
    pub subject: String,
    pub text: String,
    pub html: String,
    pub inline: Vec<String>,
}

/// Transport that records every message and can be told to fail or stall.
#[derive(Default)]
pub struct RecordingTransport {
    sent: Mutex<Vec<SentMessage>>,
    failing: Mutex<HashSet<String>>,
    delay: Mutex<Option<Duration>>,
    counter: AtomicUsize,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_for(&self, recipient: &str) {
        self.failing.lock().unwrap().insert(recipient.to_string());
    }

    pub fn recover(&self, recipient: &str) {
        self.failing.lock().unwrap().remove(recipient);
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }

    pub fn sent(&self) -> Vec<SentMessage> {
        self.sent.lock().unwrap().clone()
    }

    pub fn sent_to(&self, recipient: &str) -> Vec<SentMessage> {
        self.sent()
            .into_iter()
            .filter(|m| m.recipient == recipient)
            .collect()
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    fn name(&self) -> &str {
        "recording"
    }

    async fn send(&self, message: OutgoingMessage) -> Result<String, TransportError> {
        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.failing.lock().unwrap().contains(&message.recipient) {
            return Err(TransportError::Rejected {
                provider: "recording".into(),
                status: 550,
                body: "mailbox unavailable".into(),
            });
        }
        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        self.sent.lock().unwrap().push(SentMessage {
            recipient: message.recipient.clone(),
            subject: message.subject.clone(),
            text: message.text.clone(),
            html: message.html.clone(),
            inline: message.inline.iter().map(|a| a.name().to_string()).collect(),
        });
        Ok(format!("<delivery-{n}@test>"))
    }
}

/// In-memory campaign source that counts lookups.
#[derive(Default)]
pub struct StaticCampaigns {
    campaigns: Mutex<HashMap<String, Campaign>>,
    failing: Mutex<HashSet<String>>,
    calls: AtomicUsize,
}

impl StaticCampaigns {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(self, name: &str, campaign: Campaign) -> Self {
        self.insert(name, campaign);
        self
    }

    pub fn insert(&self, name: &str, campaign: Campaign) {
        self.campaigns
            .lock()
            .unwrap()
            .insert(name.to_string(), campaign);
    }

    pub fn fail(&self, name: &str) {
        self.failing.lock().unwrap().insert(name.to_string());
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CampaignSource for StaticCampaigns {
    async fn campaign(&self, name: &str) -> Result<Campaign, CampaignError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.lock().unwrap().contains(name) {
            return Err(CampaignError::Request(format!("{name}: unavailable")));
        }
        self.campaigns
            .lock()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| CampaignError::UnknownCampaign {
                name: name.to_string(),
            })
    }
}

pub fn template(id: &str) -> Template {
    Template {
        id: id.into(),
        subject: format!("Subject {id}"),
        sender: "team@example.com".into(),
        html_body: format!("# {id}\n\n[Unsubscribe](https://example.com/u/{{{{Token}}}})"),
        text_body: format!("{id} unsubscribe: https://example.com/u/{{{{Token}}}}"),
        images: vec![],
    }
}

/// Campaign with one step per `(id, delay_seconds)`, each using template `t-<id>`.
pub fn campaign(steps: &[(&str, i64)]) -> Campaign {
    Campaign {
        id: "c1".into(),
        steps: steps
            .iter()
            .map(|(id, delay)| Step {
                id: id.to_string(),
                delay_seconds: *delay,
                template: template(&format!("t-{id}")),
            })
            .collect(),
    }
}

/// Store that delegates to a real backend but can be told to fail marking
/// emails sent, or to panic while recording a step execution.
pub struct FaultyStore {
    inner: Arc<dyn Database>,
    fail_mark_sent: AtomicBool,
    panic_on_execution: AtomicBool,
}

impl FaultyStore {
    pub fn new(inner: Arc<dyn Database>) -> Self {
        Self {
            inner,
            fail_mark_sent: AtomicBool::new(false),
            panic_on_execution: AtomicBool::new(false),
        }
    }

    pub fn fail_mark_sent(&self) {
        self.fail_mark_sent.store(true, Ordering::SeqCst);
    }

    pub fn panic_on_execution(&self) {
        self.panic_on_execution.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl Database for FaultyStore {
    async fn init_schema(&self) -> Result<(), DatabaseError> {
        self.inner.init_schema().await
    }

    async fn ensure_recipient(&self, email: &str) -> Result<(), DatabaseError> {
        self.inner.ensure_recipient(email).await
    }

    async fn get_recipient(&self, email: &str) -> Result<Option<Recipient>, DatabaseError> {
        self.inner.get_recipient(email).await
    }

    async fn opt_out(&self, email: &str) -> Result<bool, DatabaseError> {
        self.inner.opt_out(email).await
    }

    async fn insert_unsubscribe_event(
        &self,
        email: &str,
        email_id: i64,
    ) -> Result<(), DatabaseError> {
        self.inner.insert_unsubscribe_event(email, email_id).await
    }

    async fn list_unsubscribe_events(
        &self,
        email: &str,
    ) -> Result<Vec<UnsubscribeEvent>, DatabaseError> {
        self.inner.list_unsubscribe_events(email).await
    }

    async fn insert_email(&self, recipient: &str, template_id: &str) -> Result<i64, DatabaseError> {
        self.inner.insert_email(recipient, template_id).await
    }

    async fn mark_email_sent(&self, id: i64, delivery_id: &str) -> Result<(), DatabaseError> {
        if self.fail_mark_sent.load(Ordering::SeqCst) {
            return Err(DatabaseError::Query("database is locked".into()));
        }
        self.inner.mark_email_sent(id, delivery_id).await
    }

    async fn get_email(&self, id: i64) -> Result<Option<EmailRecord>, DatabaseError> {
        self.inner.get_email(id).await
    }

    async fn list_emails(&self, recipient: &str) -> Result<Vec<EmailRecord>, DatabaseError> {
        self.inner.list_emails(recipient).await
    }

    async fn insert_enrollment(
        &self,
        recipient: &str,
        series: &str,
        first_step_id: &str,
        due_at: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        self.inner
            .insert_enrollment(recipient, series, first_step_id, due_at)
            .await
    }

    async fn get_enrollment(
        &self,
        recipient: &str,
        series: &str,
    ) -> Result<Option<Enrollment>, DatabaseError> {
        self.inner.get_enrollment(recipient, series).await
    }

    async fn due_enrollments(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<DueEnrollment>, DatabaseError> {
        self.inner.due_enrollments(now, limit).await
    }

    async fn advance_enrollment(
        &self,
        recipient: &str,
        series: &str,
        next: Option<&NextStep>,
    ) -> Result<(), DatabaseError> {
        self.inner.advance_enrollment(recipient, series, next).await
    }

    async fn upsert_step_execution(
        &self,
        recipient: &str,
        series: &str,
        step_id: &str,
        email_id: i64,
    ) -> Result<(), DatabaseError> {
        if self.panic_on_execution.load(Ordering::SeqCst) {
            panic!("step execution write for {recipient} crashed");
        }
        self.inner
            .upsert_step_execution(recipient, series, step_id, email_id)
            .await
    }

    async fn list_step_executions(
        &self,
        recipient: &str,
        series: &str,
    ) -> Result<Vec<StepExecution>, DatabaseError> {
        self.inner.list_step_executions(recipient, series).await
    }
}

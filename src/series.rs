//! Series engine. Moves recipients through multi-step drip campaigns.
//!
//! Each enrollment is a small state machine: scheduled → due → (advanced |
//! completed). A trigger cycle picks up a bounded batch of due enrollments,
//! sends the current step through the [`SendPipeline`] and advances only the
//! enrollments whose send produced an email. Anything else stays due and is
//! retried on the next cycle.
//!
//! Sends and the per-enrollment bookkeeping run in detached tasks, so a
//! caller that gives up on [`SeriesEngine::trigger_due`] cannot leave a
//! delivered step unrecorded.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::try_join_all;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::campaign::{Campaign, CampaignSource, Step};
use crate::config::SeriesConfig;
use crate::error::SeriesError;
use crate::pipeline::SendPipeline;
use crate::store::{Database, DueEnrollment, NextStep};

/// Per-cycle counts returned by [`SeriesEngine::trigger_due`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TriggerReport {
    /// Enrollments returned by the due query.
    pub due: usize,
    /// Moved on to a following step.
    pub advanced: usize,
    /// Finished their last step.
    pub completed: usize,
    /// Consent turned the send into a no-op; left due.
    pub suppressed: usize,
    /// Send or bookkeeping failed, or no result before the batch deadline.
    pub failed: usize,
    /// Current step missing from the campaign definition.
    pub skipped: usize,
}

/// One unit of fan-out work.
struct StepJob {
    enrollment: DueEnrollment,
    step: Step,
    next: Option<Step>,
}

enum StepOutcome {
    Advanced,
    Completed,
    Suppressed,
    Failed,
}

pub struct SeriesEngine {
    store: Arc<dyn Database>,
    campaigns: Arc<dyn CampaignSource>,
    pipeline: SendPipeline,
    config: SeriesConfig,
}

impl SeriesEngine {
    pub fn new(
        store: Arc<dyn Database>,
        campaigns: Arc<dyn CampaignSource>,
        pipeline: SendPipeline,
        config: SeriesConfig,
    ) -> Self {
        Self {
            store,
            campaigns,
            pipeline,
            config,
        }
    }

    /// Enroll `recipient` in the named campaign.
    ///
    /// Returns `false` when the recipient was already enrolled; the existing
    /// enrollment is left untouched.
    pub async fn begin_series(&self, recipient: &str, name: &str) -> Result<bool, SeriesError> {
        self.store.ensure_recipient(recipient).await?;

        let campaign = self.campaigns.campaign(name).await?;
        let first = campaign
            .first_step()
            .ok_or_else(|| SeriesError::EmptyCampaign {
                name: name.to_string(),
            })?;

        let due_at = first
            .due_after(Utc::now())
            .ok_or_else(|| invalid_delay(name, first))?;
        let inserted = self
            .store
            .insert_enrollment(recipient, name, &first.id, due_at)
            .await?;

        if inserted {
            info!(recipient, series = name, step = %first.id, %due_at, "Series started");
        } else {
            debug!(recipient, series = name, "Already enrolled, start ignored");
        }
        Ok(inserted)
    }

    /// Run one trigger cycle.
    ///
    /// Fails only if the due query or a campaign lookup fails; per-enrollment
    /// problems are logged and counted in the report.
    pub async fn trigger_due(&self) -> Result<TriggerReport, SeriesError> {
        let due = self
            .store
            .due_enrollments(Utc::now(), self.config.batch_size)
            .await?;

        let mut report = TriggerReport {
            due: due.len(),
            ..Default::default()
        };
        if due.is_empty() {
            debug!("No due emails to send");
            return Ok(report);
        }
        info!(count = due.len(), "Sending due emails");

        let campaigns = self.resolve_campaigns(&due).await?;

        let mut jobs = Vec::with_capacity(due.len());
        for enrollment in due {
            let Some(campaign) = campaigns.get(&enrollment.series) else {
                continue;
            };
            match campaign.locate(&enrollment.step_id) {
                Some((step, next)) => jobs.push(StepJob {
                    step: step.clone(),
                    next: next.cloned(),
                    enrollment,
                }),
                None => {
                    let err = SeriesError::UnknownStep {
                        series: enrollment.series.clone(),
                        step: enrollment.step_id.clone(),
                    };
                    warn!(recipient = %enrollment.recipient, error = %err, "Skipping enrollment");
                    report.skipped += 1;
                }
            }
        }

        let handle = tokio::spawn(run_batch(
            jobs,
            self.pipeline.clone(),
            Arc::clone(&self.store),
            self.config.batch_timeout,
        ));
        let batch = handle
            .await
            .map_err(|e| SeriesError::Aborted(e.to_string()))?;

        report.advanced = batch.advanced;
        report.completed = batch.completed;
        report.suppressed = batch.suppressed;
        report.failed = batch.failed;

        info!(
            due = report.due,
            advanced = report.advanced,
            completed = report.completed,
            suppressed = report.suppressed,
            failed = report.failed,
            skipped = report.skipped,
            "Trigger cycle finished"
        );
        Ok(report)
    }

    /// Look up every distinct campaign once, concurrently. The first failure
    /// drops the remaining lookups.
    async fn resolve_campaigns(
        &self,
        due: &[DueEnrollment],
    ) -> Result<HashMap<String, Campaign>, SeriesError> {
        let names: BTreeSet<&str> = due.iter().map(|d| d.series.as_str()).collect();
        let lookups = names.into_iter().map(|name| async move {
            let campaign = self.campaigns.campaign(name).await?;
            Ok::<_, SeriesError>((name.to_string(), campaign))
        });
        Ok(try_join_all(lookups).await?.into_iter().collect())
    }
}

/// Fan out one task per job and collect outcomes until all report or the
/// deadline passes.
async fn run_batch(
    jobs: Vec<StepJob>,
    pipeline: SendPipeline,
    store: Arc<dyn Database>,
    batch_timeout: Duration,
) -> TriggerReport {
    let deadline = tokio::time::Instant::now() + batch_timeout;
    let total = jobs.len();
    let (tx, mut rx) = mpsc::channel(total.max(1));

    for job in jobs {
        let tx = tx.clone();
        let pipeline = pipeline.clone();
        let store = Arc::clone(&store);
        tokio::spawn(async move {
            let outcome = run_step(&pipeline, store.as_ref(), &job).await;
            // Receiver gone means the batch deadline already passed.
            let _ = tx.send(outcome).await;
        });
    }
    drop(tx);

    let mut report = TriggerReport::default();
    let mut received = 0;
    loop {
        match tokio::time::timeout_at(deadline, rx.recv()).await {
            Ok(Some(outcome)) => {
                received += 1;
                match outcome {
                    StepOutcome::Advanced => report.advanced += 1,
                    StepOutcome::Completed => report.completed += 1,
                    StepOutcome::Suppressed => report.suppressed += 1,
                    StepOutcome::Failed => report.failed += 1,
                }
            }
            Ok(None) => {
                // Every sender is gone; any shortfall is a task that panicked.
                let lost = total - received;
                if lost > 0 {
                    error!(lost, "Send tasks ended without reporting");
                    report.failed += lost;
                }
                break;
            }
            Err(_) => {
                let pending = total - received;
                warn!(pending, "Batch deadline reached, unfinished sends continue unreported");
                report.failed += pending;
                break;
            }
        }
    }
    report
}

async fn run_step(pipeline: &SendPipeline, store: &dyn Database, job: &StepJob) -> StepOutcome {
    let DueEnrollment {
        recipient,
        series,
        step_id,
    } = &job.enrollment;

    // The successor must be schedulable before this step goes out.
    let next = match &job.next {
        Some(step) => match step.due_after(Utc::now()) {
            Some(due_at) => Some(NextStep {
                step_id: step.id.clone(),
                due_at,
            }),
            None => {
                let err = invalid_delay(series, step);
                error!(recipient = %recipient, step = %step_id, error = %err, "Step not sent");
                return StepOutcome::Failed;
            }
        },
        None => None,
    };

    let outcome = match pipeline.send(&job.step.template, recipient).await {
        Ok(outcome) => outcome,
        Err(e) => {
            error!(recipient = %recipient, series = %series, step = %step_id, error = %e, "Step send failed");
            return StepOutcome::Failed;
        }
    };
    let Some(email_id) = outcome.email_id.filter(|_| outcome.sent) else {
        info!(recipient = %recipient, series = %series, step = %step_id, "Send suppressed, step not advanced");
        return StepOutcome::Suppressed;
    };

    if let Err(e) = store
        .upsert_step_execution(recipient, series, step_id, email_id)
        .await
    {
        error!(recipient = %recipient, series = %series, step = %step_id, error = %e, "Failed to record step execution");
        return StepOutcome::Failed;
    }

    if let Err(e) = store
        .advance_enrollment(recipient, series, next.as_ref())
        .await
    {
        error!(recipient = %recipient, series = %series, step = %step_id, error = %e, "Failed to advance enrollment");
        return StepOutcome::Failed;
    }

    match next {
        Some(next) => {
            debug!(recipient = %recipient, series = %series, next_step = %next.step_id, due_at = %next.due_at, "Step complete");
            StepOutcome::Advanced
        }
        None => {
            info!(recipient = %recipient, series = %series, "Series completed");
            StepOutcome::Completed
        }
    }
}

fn invalid_delay(series: &str, step: &Step) -> SeriesError {
    SeriesError::InvalidDelay {
        series: series.to_string(),
        step: step.id.clone(),
        delay_seconds: step.delay_seconds,
    }
}

/// Spawn the background task that runs a trigger cycle every `interval`.
pub fn spawn_trigger_ticker(
    engine: Arc<SeriesEngine>,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // Skip immediate first tick
        ticker.tick().await;

        loop {
            ticker.tick().await;
            if let Err(e) = engine.trigger_due().await {
                error!(error = %e, "Trigger cycle failed");
            }
        }
    })
}

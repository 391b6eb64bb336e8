//! Action scheduler: the clock loop that runs due actions.
//!
//! Every `poll_interval` the scheduler lists active enrollments whose
//! `next_run_at` has passed and processes them concurrently, up to
//! `worker_concurrency` at a time. Each one is leased first, so two workers
//! (or two sweeps) never run the same enrollment at once, and the lease is
//! always released afterwards.
//!
//! Delivery is at-least-once: an enrollment only advances after its channel
//! reported success, so a crash in between repeats the action.

use std::sync::Arc;

use cadence_core::clock::Clock;
use cadence_core::dispatch::{
    CrmChannel, DispatchContext, DispatchError, DispatchRequest, EmailChannel, SmsChannel,
};
use cadence_core::enrollment::{Enrollment, EnrollmentStatus};
use cadence_core::error::CoreError;
use cadence_core::template::{render_value, RenderContext};
use cadence_core::types::{Attributes, DbId, Timestamp};
use cadence_core::workflow::{Action, ActionKind, WorkflowDefinition, WorkflowStatus};
use chrono::{Datelike, DateTime, Duration, NaiveDate, Utc};
use futures::stream::{self, StreamExt};
use rand::Rng;
use serde_json::{json, Map, Value};
use tokio_util::sync::CancellationToken;

use crate::config::EngineConfig;
use crate::error::EngineResult;
use crate::manager::EnrollmentManager;
use crate::store::{EnrollmentStore, Stores, SubjectDirectory, WorkflowStore};

/// Attribute read for `hours_remaining` / `days_remaining` when the action
/// config does not name one in `expires_field`.
pub const DEFAULT_EXPIRES_FIELD: &str = "offer_ends_at";

// ---------------------------------------------------------------------------
// Channels
// ---------------------------------------------------------------------------

/// The channel implementations the scheduler dispatches through. A channel
/// left unset fails its actions permanently.
#[derive(Clone, Default)]
pub struct Channels {
    email: Option<Arc<dyn EmailChannel>>,
    sms: Option<Arc<dyn SmsChannel>>,
    crm: Option<Arc<dyn CrmChannel>>,
}

impl Channels {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_email(mut self, channel: Arc<dyn EmailChannel>) -> Self {
        self.email = Some(channel);
        self
    }

    pub fn with_sms(mut self, channel: Arc<dyn SmsChannel>) -> Self {
        self.sms = Some(channel);
        self
    }

    pub fn with_crm(mut self, channel: Arc<dyn CrmChannel>) -> Self {
        self.crm = Some(channel);
        self
    }

    /// Names of the configured channels, for startup logging.
    pub fn configured(&self) -> Vec<&'static str> {
        [
            self.email.as_ref().map(|_| "email"),
            self.sms.as_ref().map(|_| "sms"),
            self.crm.as_ref().map(|_| "crm"),
        ]
        .into_iter()
        .flatten()
        .collect()
    }

    async fn dispatch(
        &self,
        ctx: &DispatchContext,
        request: &DispatchRequest,
    ) -> Result<(), DispatchError> {
        match request {
            DispatchRequest::Email(message) => {
                let email = self.email.as_ref().ok_or_else(|| unconfigured("email"))?;
                email.send_email(ctx, message).await
            }
            DispatchRequest::Sms(message) => {
                let sms = self.sms.as_ref().ok_or_else(|| unconfigured("sms"))?;
                sms.send_sms(ctx, message).await
            }
            DispatchRequest::Deal(deal) => {
                let crm = self.crm.as_ref().ok_or_else(|| unconfigured("crm"))?;
                crm.create_deal(ctx, deal).await
            }
            DispatchRequest::Task(task) => {
                let crm = self.crm.as_ref().ok_or_else(|| unconfigured("crm"))?;
                crm.create_task(ctx, task).await
            }
        }
    }
}

fn unconfigured(channel: &str) -> DispatchError {
    DispatchError::Permanent(format!("No {channel} channel is configured"))
}

// ---------------------------------------------------------------------------
// SweepReport
// ---------------------------------------------------------------------------

/// Tally of one sweep.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    /// Enrollments listed as due.
    pub due: usize,
    /// Actions delivered through a channel.
    pub dispatched: usize,
    /// `WAIT_DELAY` steps passed.
    pub waited: usize,
    /// Enrollments that finished their last action in this sweep.
    pub completed: usize,
    pub retried: usize,
    pub failed: usize,
    /// Leased elsewhere, no longer due, paused, or hit a store error.
    pub skipped: usize,
    /// Cancelled while this sweep's action was in flight.
    pub cancelled_in_flight: usize,
}

impl SweepReport {
    fn record(&mut self, outcome: StepOutcome) {
        match outcome {
            StepOutcome::Dispatched { completed } => {
                self.dispatched += 1;
                self.completed += usize::from(completed);
            }
            StepOutcome::Waited { completed } => {
                self.waited += 1;
                self.completed += usize::from(completed);
            }
            StepOutcome::Retried => self.retried += 1,
            StepOutcome::Failed => self.failed += 1,
            StepOutcome::Skipped => self.skipped += 1,
            StepOutcome::CancelledInFlight => self.cancelled_in_flight += 1,
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StepOutcome {
    Dispatched { completed: bool },
    Waited { completed: bool },
    Retried,
    Failed,
    Skipped,
    CancelledInFlight,
}

// ---------------------------------------------------------------------------
// ActionScheduler
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct ActionScheduler {
    workflows: Arc<dyn WorkflowStore>,
    enrollments: Arc<dyn EnrollmentStore>,
    subjects: Arc<dyn SubjectDirectory>,
    manager: EnrollmentManager,
    channels: Channels,
    clock: Arc<dyn Clock>,
    config: EngineConfig,
}

impl ActionScheduler {
    pub fn new(
        stores: &Stores,
        manager: EnrollmentManager,
        channels: Channels,
        clock: Arc<dyn Clock>,
        config: EngineConfig,
    ) -> Self {
        Self {
            workflows: stores.workflows.clone(),
            enrollments: stores.enrollments.clone(),
            subjects: stores.subjects.clone(),
            manager,
            channels,
            clock,
            config,
        }
    }

    /// Run the sweep loop until the cancellation token is triggered.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.poll_interval);
        tracing::info!(
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            batch_size = self.config.batch_size,
            worker_concurrency = self.config.worker_concurrency,
            worker_id = %self.config.worker_id,
            channels = ?self.channels.configured(),
            "Action scheduler started",
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("Action scheduler shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.sweep().await {
                        tracing::error!(error = %e, "Sweep failed");
                    }
                }
            }
        }
    }

    /// Process every enrollment due now, oldest first, up to `batch_size`.
    pub async fn sweep(&self) -> EngineResult<SweepReport> {
        let now = self.clock.now();
        let due = self.enrollments.list_due(now, self.config.batch_size).await?;
        let mut report = SweepReport {
            due: due.len(),
            ..Default::default()
        };
        if due.is_empty() {
            tracing::debug!("No due enrollments");
            return Ok(report);
        }

        let outcomes: Vec<StepOutcome> = stream::iter(due)
            .map(|enrollment| self.process(enrollment))
            .buffer_unordered(self.config.worker_concurrency)
            .collect()
            .await;
        for outcome in outcomes {
            report.record(outcome);
        }

        tracing::info!(
            due = report.due,
            dispatched = report.dispatched,
            waited = report.waited,
            completed = report.completed,
            retried = report.retried,
            failed = report.failed,
            skipped = report.skipped,
            cancelled_in_flight = report.cancelled_in_flight,
            "Sweep finished"
        );
        Ok(report)
    }

    /// Lease, execute, release.
    async fn process(&self, candidate: Enrollment) -> StepOutcome {
        let owner = self.config.worker_id.as_str();
        let now = self.clock.now();
        let leased = match self
            .enrollments
            .try_lease(candidate.id, owner, now, now + self.config.lease_duration)
            .await
        {
            Ok(Some(leased)) => leased,
            Ok(None) => {
                tracing::debug!(
                    enrollment_id = candidate.id,
                    error = %CoreError::LeaseConflict(candidate.id),
                    "Skipping enrollment"
                );
                return StepOutcome::Skipped;
            }
            Err(e) => {
                tracing::error!(
                    enrollment_id = candidate.id,
                    error = %e,
                    "Failed to lease enrollment"
                );
                return StepOutcome::Skipped;
            }
        };

        let outcome = match self.execute(&leased).await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::error!(
                    enrollment_id = leased.id,
                    action_index = leased.current_action_index,
                    error = %e,
                    "Failed to process enrollment"
                );
                StepOutcome::Skipped
            }
        };

        if let Err(e) = self.enrollments.release(leased.id, owner).await {
            tracing::warn!(
                enrollment_id = leased.id,
                error = %e,
                "Failed to release enrollment lease"
            );
        }
        outcome
    }

    /// Run the current action of a leased enrollment and record the result.
    async fn execute(&self, e: &Enrollment) -> EngineResult<StepOutcome> {
        let now = self.clock.now();
        if !e.is_due(now) {
            return Ok(StepOutcome::Skipped);
        }

        let Some(def) = self
            .workflows
            .get_version(e.workflow_id, e.workflow_version)
            .await?
        else {
            let error = format!(
                "Workflow {} v{} no longer exists",
                e.workflow_id, e.workflow_version
            );
            return self
                .settle(e.id, self.manager.fail(e.id, &error).await, StepOutcome::Failed)
                .await;
        };

        match def.status {
            WorkflowStatus::Active => {}
            WorkflowStatus::Paused => {
                // Step aside so paused enrollments do not crowd the batch.
                let at = now + poll_delay(&self.config);
                self.manager.postpone(e.id, at).await?;
                tracing::debug!(
                    enrollment_id = e.id,
                    workflow_id = def.id,
                    "Workflow paused, action postponed"
                );
                return Ok(StepOutcome::Skipped);
            }
            WorkflowStatus::Archived => {
                self.manager.cancel(e.id, "Workflow archived").await?;
                return Ok(StepOutcome::Skipped);
            }
        }

        let index = e.current_action_index;
        let Some(action) = def.action(index) else {
            let error = format!(
                "Action {index} is missing from workflow {} v{}",
                def.id, def.version
            );
            return self
                .settle(e.id, self.manager.fail(e.id, &error).await, StepOutcome::Failed)
                .await;
        };

        if action.kind == ActionKind::WaitDelay {
            let result = self.manager.advance_from(e.id, index, now).await;
            return match result {
                Ok(next) => Ok(StepOutcome::Waited {
                    completed: next.status == EnrollmentStatus::Completed,
                }),
                Err(err) => self.settle(e.id, Err(err), StepOutcome::Skipped).await,
            };
        }

        let Some(attrs) = self.subjects.attributes(e.tenant_id, e.subject_id).await? else {
            let error = format!("Subject {} no longer exists", e.subject_id);
            return self
                .settle(e.id, self.manager.fail(e.id, &error).await, StepOutcome::Failed)
                .await;
        };

        let ctx = DispatchContext {
            tenant_id: e.tenant_id,
            workflow_id: e.workflow_id,
            enrollment_id: e.id,
            subject_id: e.subject_id,
            action_index: index,
        };
        let context = build_render_context(&attrs, e, &def, action, now);
        let config = render_value(&action.config, &context);
        let request = match DispatchRequest::from_rendered(action.kind, &config, &attrs) {
            Ok(Some(request)) => request,
            Ok(None) => {
                return Err(CoreError::Internal(format!(
                    "{} produced no request",
                    action.kind.as_str()
                ))
                .into())
            }
            Err(err) => return self.on_dispatch_error(e, err).await,
        };

        let result = tokio::time::timeout(
            self.config.dispatch_timeout,
            self.channels.dispatch(&ctx, &request),
        )
        .await
            .unwrap_or_else(|_| {
                Err(DispatchError::Transient(format!(
                    "{} timed out after {}s",
                    action.kind.as_str(),
                    self.config.dispatch_timeout.as_secs()
                )))
            });

        match result {
            Ok(()) => {
                let completed_at = self.clock.now();
                tracing::info!(
                    enrollment_id = e.id,
                    action_index = index,
                    kind = action.kind.as_str(),
                    "Action dispatched"
                );
                match self.manager.advance_from(e.id, index, completed_at).await {
                    Ok(next) => Ok(StepOutcome::Dispatched {
                        completed: next.status == EnrollmentStatus::Completed,
                    }),
                    Err(err) => self.settle(e.id, Err(err), StepOutcome::Skipped).await,
                }
            }
            Err(err) => self.on_dispatch_error(e, err).await,
        }
    }

    /// Retry a transient failure with backoff until the attempt cap, fail a
    /// permanent one.
    async fn on_dispatch_error(
        &self,
        e: &Enrollment,
        err: DispatchError,
    ) -> EngineResult<StepOutcome> {
        let policy = &self.config.retry;
        let attempts = e.attempts + 1;
        match err {
            DispatchError::Transient(msg) if policy.should_retry(attempts) => {
                let at = self.clock.now() + with_jitter(policy.backoff(attempts));
                tracing::warn!(
                    enrollment_id = e.id,
                    action_index = e.current_action_index,
                    attempts,
                    retry_at = %at,
                    error = %msg,
                    "Transient dispatch failure, retrying later"
                );
                let result = self.manager.retry_later(e.id, &msg, at).await;
                self.settle(e.id, result, StepOutcome::Retried).await
            }
            DispatchError::Transient(msg) => {
                let error = format!("Gave up after {attempts} attempts: {msg}");
                let result = self.manager.fail(e.id, &error).await;
                self.settle(e.id, result, StepOutcome::Failed).await
            }
            DispatchError::Permanent(msg) => {
                let result = self.manager.fail(e.id, &msg).await;
                self.settle(e.id, result, StepOutcome::Failed).await
            }
        }
    }

    /// Map the result of a manager call to an outcome. A call that lost to
    /// a concurrent cancel is reported as `CancelledInFlight`; the cancel
    /// stands and the action's effect is not recorded.
    async fn settle(
        &self,
        id: DbId,
        result: EngineResult<Enrollment>,
        on_success: StepOutcome,
    ) -> EngineResult<StepOutcome> {
        let err = match result {
            Ok(_) => return Ok(on_success),
            Err(err) => err,
        };
        match self.enrollments.get(id).await? {
            Some(current) if current.status == EnrollmentStatus::Cancelled => {
                tracing::info!(
                    enrollment_id = id,
                    action_index = current.current_action_index,
                    "Enrollment cancelled while its action was in flight"
                );
                Ok(StepOutcome::CancelledInFlight)
            }
            _ => Err(err),
        }
    }
}

fn poll_delay(config: &EngineConfig) -> Duration {
    Duration::from_std(config.poll_interval).unwrap_or_else(|_| Duration::seconds(60))
}

/// Add up to 10% random extra delay so retries of a failed batch spread out.
fn with_jitter(delay: Duration) -> Duration {
    let millis = delay.num_milliseconds();
    if millis <= 0 {
        return delay;
    }
    let extra = rand::rng().random_range(0..=millis / 10);
    delay + Duration::milliseconds(extra)
}

// ---------------------------------------------------------------------------
// Render context
// ---------------------------------------------------------------------------

/// Values a template sees: the subject's attributes plus what the scheduler
/// computes at dispatch time.
///
/// `subject_id`, `enrollment_id`, `workflow_name`, `today` (`YYYY-MM-DD`)
/// and `year` are always set. `hours_remaining` and `days_remaining` count
/// down to the date in the attribute named by the action's `expires_field`
/// (default [`DEFAULT_EXPIRES_FIELD`]), unless the subject carries those
/// names itself.
pub fn build_render_context(
    attrs: &Attributes,
    enrollment: &Enrollment,
    def: &WorkflowDefinition,
    action: &Action,
    now: Timestamp,
) -> RenderContext {
    let mut context = match attrs {
        Value::Object(map) => map.clone(),
        _ => Map::new(),
    };

    let expires_field = action
        .config
        .get("expires_field")
        .and_then(Value::as_str)
        .unwrap_or(DEFAULT_EXPIRES_FIELD);
    if let Some(expires_at) = context.get(expires_field).and_then(parse_instant) {
        let hours = (expires_at - now).num_hours().max(0);
        context.entry("hours_remaining").or_insert(json!(hours));
        context.entry("days_remaining").or_insert(json!(hours / 24));
    }

    context.insert("subject_id".into(), json!(enrollment.subject_id));
    context.insert("enrollment_id".into(), json!(enrollment.id));
    context.insert("workflow_name".into(), json!(def.name));
    context.insert("today".into(), json!(now.format("%Y-%m-%d").to_string()));
    context.insert("year".into(), json!(now.year()));
    context
}

/// An RFC3339 timestamp, or a `YYYY-MM-DD` date taken as its UTC midnight.
fn parse_instant(value: &Value) -> Option<Timestamp> {
    let text = value.as_str()?.trim();
    if let Ok(at) = DateTime::parse_from_rfc3339(text) {
        return Some(at.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

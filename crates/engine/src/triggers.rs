//! Trigger evaluation: turns domain events and the passage of time into
//! enrollments.
//!
//! Every candidate goes through the same steps: conditions, then the firing
//! ledger, then the enrollment manager. The ledger key
//! `(workflow_id, subject_id, occurrence_key)` makes each occurrence enroll
//! at most once, however often it is evaluated.

use std::collections::HashMap;
use std::sync::Arc;

use cadence_core::clock::Clock;
use cadence_core::condition;
use cadence_core::error::CoreError;
use cadence_core::trigger::{
    event_occurrence_key, filters_match, recurring_occurrence, recurring_occurrence_key,
    scheduled_occurrence_key,
};
use cadence_core::types::{Attributes, DbId};
use cadence_core::workflow::{Trigger, WorkflowDefinition};
use cadence_events::DomainEvent;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::manager::EnrollmentManager;
use crate::store::{FiringLedger, Stores, SubjectDirectory, SubjectRecord, WorkflowStore};

/// Ledger subject id marking that a scheduled trigger has been fanned out
/// to its whole audience. Real subject ids start at 1.
pub const AUDIENCE_MARKER_SUBJECT: DbId = 0;

// ---------------------------------------------------------------------------
// TriggerReport
// ---------------------------------------------------------------------------

/// Tally of one evaluation pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TriggerReport {
    /// Candidates whose trigger matched.
    pub fired: usize,
    pub enrolled: usize,
    pub already_enrolled: usize,
    /// Occurrences already in the ledger.
    pub duplicate_occurrence: usize,
    pub conditions_failed: usize,
    pub errors: usize,
}

impl TriggerReport {
    pub fn merge(&mut self, other: TriggerReport) {
        self.fired += other.fired;
        self.enrolled += other.enrolled;
        self.already_enrolled += other.already_enrolled;
        self.duplicate_occurrence += other.duplicate_occurrence;
        self.conditions_failed += other.conditions_failed;
        self.errors += other.errors;
    }

    fn tally(
        &mut self,
        def: &WorkflowDefinition,
        subject_id: DbId,
        outcome: EngineResult<Outcome>,
    ) {
        match outcome {
            Ok(Outcome::Enrolled) => self.enrolled += 1,
            Ok(Outcome::AlreadyEnrolled) => self.already_enrolled += 1,
            Ok(Outcome::DuplicateOccurrence) => self.duplicate_occurrence += 1,
            Ok(Outcome::ConditionsFailed) => self.conditions_failed += 1,
            Err(e) => {
                self.errors += 1;
                tracing::warn!(
                    workflow_id = def.id,
                    subject_id,
                    error = %e,
                    "Trigger evaluation failed for subject"
                );
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Enrolled,
    AlreadyEnrolled,
    DuplicateOccurrence,
    ConditionsFailed,
}

// ---------------------------------------------------------------------------
// TriggerEvaluator
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct TriggerEvaluator {
    workflows: Arc<dyn WorkflowStore>,
    ledger: Arc<dyn FiringLedger>,
    subjects: Arc<dyn SubjectDirectory>,
    manager: EnrollmentManager,
    clock: Arc<dyn Clock>,
    config: EngineConfig,
}

impl TriggerEvaluator {
    pub fn new(
        stores: &Stores,
        manager: EnrollmentManager,
        clock: Arc<dyn Clock>,
        config: EngineConfig,
    ) -> Self {
        Self {
            workflows: stores.workflows.clone(),
            ledger: stores.ledger.clone(),
            subjects: stores.subjects.clone(),
            manager,
            clock,
            config,
        }
    }

    /// Evaluate the event triggers of the tenant's active workflows against
    /// one event.
    ///
    /// Conditions see the subject's attributes overlaid with the event
    /// payload, so a `purchase_completed` payload's `amount` can be tested
    /// directly.
    pub async fn handle_event(&self, event: &DomainEvent) -> EngineResult<TriggerReport> {
        let mut report = TriggerReport::default();
        let Some(subject_id) = event.subject_id else {
            tracing::debug!(
                event_id = %event.id,
                event = %event.name,
                "Event has no subject, nothing to enroll"
            );
            return Ok(report);
        };

        let candidates: Vec<WorkflowDefinition> = self
            .workflows
            .list_active(event.tenant_id)
            .await?
            .into_iter()
            .filter(|def| {
                def.event_triggers(&event.name)
                    .any(|filters| filters_match(filters, &event.payload))
            })
            .collect();
        if candidates.is_empty() {
            return Ok(report);
        }
        report.fired = candidates.len();

        let Some(attrs) = self.subjects.attributes(event.tenant_id, subject_id).await? else {
            tracing::warn!(
                event_id = %event.id,
                tenant_id = event.tenant_id,
                subject_id,
                "Event names an unknown subject"
            );
            report.errors = candidates.len();
            return Ok(report);
        };
        let context = overlay(attrs, &event.payload);
        let key = event_occurrence_key(&event.id);

        for def in &candidates {
            let outcome = self.consider(def, subject_id, &context, &key).await;
            report.tally(def, subject_id, outcome);
        }

        tracing::info!(
            event_id = %event.id,
            event = %event.name,
            subject_id,
            fired = report.fired,
            enrolled = report.enrolled,
            "Event triggers evaluated"
        );
        Ok(report)
    }

    /// Evaluate every recurring trigger for every subject of its tenant.
    /// Safe to run any number of times a day.
    pub async fn evaluate_recurring(&self) -> EngineResult<TriggerReport> {
        let today = self.clock.today();
        let mut report = TriggerReport::default();
        let mut audiences: HashMap<DbId, Vec<SubjectRecord>> = HashMap::new();

        for def in self.workflows.list_all_active().await? {
            let rules: Vec<_> = def
                .triggers
                .iter()
                .filter_map(|t| match t {
                    Trigger::Recurring { rule } => Some(rule),
                    _ => None,
                })
                .collect();
            if rules.is_empty() {
                continue;
            }

            let audience = self.audience(&mut audiences, def.tenant_id).await?;
            for subject in audience {
                for rule in &rules {
                    let occurrence = match recurring_occurrence(rule, &subject.attributes, today) {
                        Ok(Some(occurrence)) => occurrence,
                        Ok(None) => continue,
                        Err(e) => {
                            report.tally(&def, subject.id, Err(e.into()));
                            continue;
                        }
                    };
                    report.fired += 1;
                    let key = recurring_occurrence_key(occurrence);
                    let outcome = self.consider(&def, subject.id, &subject.attributes, &key).await;
                    report.tally(&def, subject.id, outcome);
                }
            }
        }

        tracing::info!(
            %today,
            fired = report.fired,
            enrolled = report.enrolled,
            duplicates = report.duplicate_occurrence,
            errors = report.errors,
            "Recurring triggers evaluated"
        );
        Ok(report)
    }

    /// Fan out every scheduled trigger whose instant has passed to its
    /// tenant's audience. Once a fan-out finishes without errors the trigger
    /// is marked done and subjects added later are not enrolled; after a
    /// partial fan-out the next tick resumes it.
    pub async fn evaluate_scheduled(&self) -> EngineResult<TriggerReport> {
        let now = self.clock.now();
        let mut report = TriggerReport::default();
        let mut audiences: HashMap<DbId, Vec<SubjectRecord>> = HashMap::new();

        for def in self.workflows.list_all_active().await? {
            for trigger in &def.triggers {
                let Trigger::Scheduled { at } = trigger else {
                    continue;
                };
                if *at > now {
                    continue;
                }
                let key = scheduled_occurrence_key(*at);
                if self.ledger.contains(def.id, AUDIENCE_MARKER_SUBJECT, &key).await? {
                    continue;
                }

                let mut pass = TriggerReport::default();
                let audience = self.audience(&mut audiences, def.tenant_id).await?;
                for subject in audience {
                    pass.fired += 1;
                    let outcome = self.consider(&def, subject.id, &subject.attributes, &key).await;
                    pass.tally(&def, subject.id, outcome);
                }

                if pass.errors == 0 {
                    self.ledger.record(def.id, AUDIENCE_MARKER_SUBJECT, &key, now).await?;
                }
                tracing::info!(
                    workflow_id = def.id,
                    at = %at,
                    enrolled = pass.enrolled,
                    errors = pass.errors,
                    "Scheduled trigger fired"
                );
                report.merge(pass);
            }
        }
        Ok(report)
    }

    /// Conditions, ledger, enrollment.
    async fn consider(
        &self,
        def: &WorkflowDefinition,
        subject_id: DbId,
        attrs: &Attributes,
        occurrence_key: &str,
    ) -> EngineResult<Outcome> {
        if !condition::matches(attrs, &def.conditions, self.clock.today()) {
            return Ok(Outcome::ConditionsFailed);
        }

        let now = self.clock.now();
        if !self.ledger.record(def.id, subject_id, occurrence_key, now).await? {
            return Ok(Outcome::DuplicateOccurrence);
        }

        match self.manager.create_for(def, subject_id).await {
            Ok(enrollment) => {
                self.ledger
                    .attach(def.id, subject_id, occurrence_key, enrollment.id)
                    .await?;
                Ok(Outcome::Enrolled)
            }
            // The occurrence is consumed: the subject is still running the
            // workflow from an earlier one.
            Err(EngineError::Core(CoreError::AlreadyEnrolled { .. })) => {
                Ok(Outcome::AlreadyEnrolled)
            }
            Err(e) => {
                if let Err(forget) = self.ledger.forget(def.id, subject_id, occurrence_key).await {
                    tracing::error!(
                        workflow_id = def.id,
                        subject_id,
                        occurrence_key,
                        error = %forget,
                        "Failed to release firing after enrollment error"
                    );
                }
                Err(e)
            }
        }
    }

    async fn audience<'a>(
        &self,
        cache: &'a mut HashMap<DbId, Vec<SubjectRecord>>,
        tenant_id: DbId,
    ) -> EngineResult<&'a [SubjectRecord]> {
        if !cache.contains_key(&tenant_id) {
            let subjects = self.subjects.audience(tenant_id).await?;
            cache.insert(tenant_id, subjects);
        }
        Ok(cache.get(&tenant_id).map(Vec::as_slice).unwrap_or_default())
    }

    // -----------------------------------------------------------------------
    // Background loops
    // -----------------------------------------------------------------------

    /// Evaluate every event received from the bus until cancelled or the
    /// bus is dropped.
    pub async fn run_event_listener(
        &self,
        mut receiver: broadcast::Receiver<DomainEvent>,
        cancel: CancellationToken,
    ) {
        tracing::info!("Event trigger listener started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("Event trigger listener shutting down");
                    break;
                }
                received = receiver.recv() => match received {
                    Ok(event) => {
                        if let Err(e) = self.handle_event(&event).await {
                            tracing::error!(
                                event_id = %event.id,
                                event = %event.name,
                                error = %e,
                                "Event trigger evaluation failed"
                            );
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!(
                            skipped = n,
                            "Event trigger listener lagged, some events were not evaluated"
                        );
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        tracing::info!("Event bus closed, trigger listener shutting down");
                        break;
                    }
                },
            }
        }
    }

    /// Evaluate scheduled triggers every poll interval and recurring
    /// triggers every recurring interval, both once at startup.
    pub async fn run_clock_triggers(&self, cancel: CancellationToken) {
        let mut scheduled_ticker = tokio::time::interval(self.config.poll_interval);
        let mut recurring_ticker = tokio::time::interval(self.config.recurring_interval);
        tracing::info!(
            recurring_interval_secs = self.config.recurring_interval.as_secs(),
            "Clock trigger loop started"
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("Clock trigger loop shutting down");
                    break;
                }
                _ = scheduled_ticker.tick() => {
                    if let Err(e) = self.evaluate_scheduled().await {
                        tracing::error!(error = %e, "Scheduled trigger evaluation failed");
                    }
                }
                _ = recurring_ticker.tick() => {
                    if let Err(e) = self.evaluate_recurring().await {
                        tracing::error!(error = %e, "Recurring trigger evaluation failed");
                    }
                }
            }
        }
    }
}

/// Subject attributes with the event payload's top-level keys laid over
/// them.
fn overlay(attrs: Attributes, payload: &Value) -> Attributes {
    match (attrs, payload) {
        (Value::Object(mut merged), Value::Object(extra)) => {
            for (key, value) in extra {
                merged.insert(key.clone(), value.clone());
            }
            Value::Object(merged)
        }
        (attrs @ Value::Object(_), _) => attrs,
        (_, payload) => payload.clone(),
    }
}

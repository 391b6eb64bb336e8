//! The engine facade: one value wiring stores, clock, channels and the
//! event bus into the manager, the trigger evaluator and the scheduler.

use std::sync::Arc;

use cadence_core::clock::{Clock, SystemClock};
use cadence_core::enrollment::{Enrollment, EnrollmentSnapshot};
use cadence_core::types::DbId;
use cadence_events::{DomainEvent, EventBus};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::EngineConfig;
use crate::error::EngineResult;
use crate::manager::EnrollmentManager;
use crate::scheduler::{ActionScheduler, Channels, SweepReport};
use crate::store::Stores;
use crate::triggers::{TriggerEvaluator, TriggerReport};

pub struct Engine {
    manager: EnrollmentManager,
    triggers: TriggerEvaluator,
    scheduler: ActionScheduler,
    bus: Arc<EventBus>,
}

impl Engine {
    /// Build an engine on the wall clock.
    pub fn new(stores: Stores, channels: Channels, config: EngineConfig) -> EngineResult<Self> {
        Self::with_clock(stores, channels, config, Arc::new(SystemClock))
    }

    pub fn with_clock(
        stores: Stores,
        channels: Channels,
        config: EngineConfig,
        clock: Arc<dyn Clock>,
    ) -> EngineResult<Self> {
        config.validate()?;
        let manager = EnrollmentManager::new(&stores, clock.clone());
        let triggers =
            TriggerEvaluator::new(&stores, manager.clone(), clock.clone(), config.clone());
        let scheduler = ActionScheduler::new(&stores, manager.clone(), channels, clock, config);
        Ok(Self {
            manager,
            triggers,
            scheduler,
            bus: Arc::new(EventBus::default()),
        })
    }

    /// Enroll a subject directly, bypassing triggers and conditions.
    pub async fn enroll(&self, workflow_id: DbId, subject_id: DbId) -> EngineResult<Enrollment> {
        self.manager.create(workflow_id, subject_id).await
    }

    pub async fn cancel(&self, enrollment_id: DbId, reason: &str) -> EngineResult<Enrollment> {
        self.manager.cancel(enrollment_id, reason).await
    }

    pub async fn get_status(&self, enrollment_id: DbId) -> EngineResult<EnrollmentSnapshot> {
        self.manager.get_status(enrollment_id).await
    }

    /// Hand an event to the bus. The listener started by [`run`](Self::run)
    /// evaluates it; returns how many subscribers received it.
    pub fn publish_event(&self, event: DomainEvent) -> usize {
        self.bus.publish(event)
    }

    /// Evaluate an event's triggers in the caller's task.
    pub async fn handle_event(&self, event: &DomainEvent) -> EngineResult<TriggerReport> {
        self.triggers.handle_event(event).await
    }

    /// Run one scheduler sweep now.
    pub async fn sweep_once(&self) -> EngineResult<SweepReport> {
        self.scheduler.sweep().await
    }

    pub fn bus(&self) -> Arc<EventBus> {
        self.bus.clone()
    }

    pub fn manager(&self) -> &EnrollmentManager {
        &self.manager
    }

    pub fn triggers(&self) -> &TriggerEvaluator {
        &self.triggers
    }

    /// Spawn the scheduler sweep, the event listener and the clock trigger
    /// loop. Each stops when `cancel` fires.
    pub fn spawn(&self, cancel: CancellationToken) -> Vec<JoinHandle<()>> {
        let scheduler = self.scheduler.clone();
        let scheduler_cancel = cancel.clone();
        let listener = self.triggers.clone();
        let receiver = self.bus.subscribe();
        let listener_cancel = cancel.clone();
        let clock_triggers = self.triggers.clone();

        vec![
            tokio::spawn(async move { scheduler.run(scheduler_cancel).await }),
            tokio::spawn(async move {
                listener
                    .run_event_listener(receiver, listener_cancel)
                    .await
            }),
            tokio::spawn(async move { clock_triggers.run_clock_triggers(cancel).await }),
        ]
    }

    /// [`spawn`](Self::spawn) and wait for every service to stop.
    pub async fn run(&self, cancel: CancellationToken) {
        for handle in self.spawn(cancel) {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "Engine service task panicked");
            }
        }
        tracing::info!("Engine stopped");
    }
}

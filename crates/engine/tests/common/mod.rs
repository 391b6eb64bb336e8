//! Shared fixtures for the engine integration tests: an in-memory store, a
//! manual clock and a scripted fake channel behind a real [`Engine`].

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use cadence_core::clock::ManualClock;
use cadence_core::dispatch::{
    CrmChannel, DealRequest, DispatchContext, DispatchError, DispatchRequest, EmailChannel,
    EmailMessage, SmsChannel, SmsMessage, TaskRequest,
};
use cadence_core::schedule::RetryPolicy;
use cadence_core::types::{Attributes, DbId, Timestamp};
use cadence_core::workflow::{
    Action, ActionKind, Condition, EventFilters, Trigger, WorkflowDefinition, WorkflowStatus,
};
use cadence_engine::memory::InMemoryStore;
use cadence_engine::{Channels, Engine, EngineConfig, Stores};
use chrono::{Duration, TimeZone, Utc};
use serde_json::json;
use tokio::sync::Notify;

pub const TENANT: DbId = 1;

pub fn t0() -> Timestamp {
    Utc.with_ymd_and_hms(2025, 3, 1, 9, 0, 0).unwrap()
}

pub fn test_config() -> EngineConfig {
    EngineConfig {
        poll_interval: StdDuration::from_secs(60),
        batch_size: 50,
        worker_concurrency: 4,
        lease_duration: Duration::minutes(5),
        dispatch_timeout: StdDuration::from_secs(5),
        retry: RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::seconds(60),
            max_delay: Duration::seconds(3600),
        },
        recurring_interval: StdDuration::from_secs(86_400),
        worker_id: "test-worker".to_string(),
    }
}

// ---------------------------------------------------------------------------
// FakeChannel
// ---------------------------------------------------------------------------

/// One recorded channel call.
#[derive(Debug, Clone)]
pub struct Call {
    pub ctx: DispatchContext,
    pub request: DispatchRequest,
}

/// Implements every channel. Outcomes are popped from a script (success
/// once it runs dry); every call is recorded. When gated, a call signals
/// `entered` and blocks until `release` is notified.
#[derive(Default)]
pub struct FakeChannel {
    script: Mutex<VecDeque<Result<(), DispatchError>>>,
    calls: Mutex<Vec<Call>>,
    gated: AtomicBool,
    pub entered: Notify,
    pub release: Notify,
}

impl FakeChannel {
    pub fn script(&self, outcomes: impl IntoIterator<Item = Result<(), DispatchError>>) {
        self.script.lock().unwrap().extend(outcomes);
    }

    pub fn gate(&self) {
        self.gated.store(true, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    async fn call(
        &self,
        ctx: &DispatchContext,
        request: DispatchRequest,
    ) -> Result<(), DispatchError> {
        self.calls.lock().unwrap().push(Call {
            ctx: ctx.clone(),
            request,
        });
        if self.gated.load(Ordering::SeqCst) {
            self.entered.notify_one();
            self.release.notified().await;
        }
        self.script.lock().unwrap().pop_front().unwrap_or(Ok(()))
    }
}

#[async_trait]
impl EmailChannel for FakeChannel {
    async fn send_email(
        &self,
        ctx: &DispatchContext,
        message: &EmailMessage,
    ) -> Result<(), DispatchError> {
        self.call(ctx, DispatchRequest::Email(message.clone())).await
    }
}

#[async_trait]
impl SmsChannel for FakeChannel {
    async fn send_sms(
        &self,
        ctx: &DispatchContext,
        message: &SmsMessage,
    ) -> Result<(), DispatchError> {
        self.call(ctx, DispatchRequest::Sms(message.clone())).await
    }
}

#[async_trait]
impl CrmChannel for FakeChannel {
    async fn create_deal(
        &self,
        ctx: &DispatchContext,
        deal: &DealRequest,
    ) -> Result<(), DispatchError> {
        self.call(ctx, DispatchRequest::Deal(deal.clone())).await
    }

    async fn create_task(
        &self,
        ctx: &DispatchContext,
        task: &TaskRequest,
    ) -> Result<(), DispatchError> {
        self.call(ctx, DispatchRequest::Task(task.clone())).await
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

pub struct Harness {
    pub store: Arc<InMemoryStore>,
    pub clock: Arc<ManualClock>,
    pub channel: Arc<FakeChannel>,
    pub engine: Engine,
}

impl Harness {
    pub fn new() -> Self {
        Self::build(test_config(), true)
    }

    pub fn with_config(config: EngineConfig) -> Self {
        Self::build(config, true)
    }

    /// A harness whose engine has no channels configured.
    pub fn without_channels() -> Self {
        Self::build(test_config(), false)
    }

    fn build(config: EngineConfig, with_channels: bool) -> Self {
        let store = Arc::new(InMemoryStore::new());
        let clock = Arc::new(ManualClock::new(t0()));
        let channel = Arc::new(FakeChannel::default());
        let channels = if with_channels {
            Channels::new()
                .with_email(channel.clone())
                .with_sms(channel.clone())
                .with_crm(channel.clone())
        } else {
            Channels::new()
        };
        let engine = Engine::with_clock(
            Stores::from_single(store.clone()),
            channels,
            config,
            clock.clone(),
        )
        .expect("valid test config");
        Self {
            store,
            clock,
            channel,
            engine,
        }
    }

    pub fn advance(&self, minutes: i64) {
        self.clock.advance(Duration::minutes(minutes));
    }

    pub fn subject(&self, attributes: Attributes) -> DbId {
        self.store.upsert_subject(TENANT, None, attributes)
    }

    /// Save an active workflow triggered by `contact_created`.
    pub fn workflow(&self, actions: Vec<Action>) -> WorkflowDefinition {
        self.workflow_with(
            vec![Trigger::Event {
                event_name: "contact_created".into(),
                filters: EventFilters::default(),
            }],
            vec![],
            actions,
        )
    }

    pub fn workflow_with(
        &self,
        triggers: Vec<Trigger>,
        conditions: Vec<Condition>,
        actions: Vec<Action>,
    ) -> WorkflowDefinition {
        self.store
            .insert_workflow(WorkflowDefinition {
                id: 0,
                tenant_id: TENANT,
                name: "Test campaign".into(),
                status: WorkflowStatus::Active,
                version: 1,
                triggers,
                conditions,
                actions,
                variables: vec![],
            })
            .expect("valid test workflow")
    }
}

// ---------------------------------------------------------------------------
// Action builders
// ---------------------------------------------------------------------------

pub fn email(index: u32, delay_minutes: u32) -> Action {
    Action::new(
        index,
        ActionKind::SendEmail,
        delay_minutes,
        json!({"subject": "Hi {{firstName}}", "body": "Step {{enrollment_id}}"}),
    )
}

pub fn sms(index: u32, delay_minutes: u32) -> Action {
    Action::new(index, ActionKind::SendSms, delay_minutes, json!({"message": "Hey {{firstName}}"}))
}

pub fn wait(index: u32, delay_minutes: u32) -> Action {
    Action::new(index, ActionKind::WaitDelay, delay_minutes, json!({}))
}

pub fn task(index: u32, delay_minutes: u32) -> Action {
    Action::new(
        index,
        ActionKind::CreateTask,
        delay_minutes,
        json!({"title": "Call {{firstName}}"}),
    )
}

pub fn contact() -> Attributes {
    json!({"firstName": "Marie", "email": "marie@example.com", "phone": "+33612345678"})
}

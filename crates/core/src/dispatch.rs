//! Channel capabilities and the typed requests the scheduler sends them.
//!
//! An action's rendered `config` is turned into a [`DispatchRequest`] here,
//! so delivery adapters receive checked, typed messages and never see raw
//! JSON. Each channel is a separate async trait; an adapter implements only
//! what it can deliver.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::condition::{as_number, lookup};
use crate::types::DbId;
use crate::workflow::ActionKind;

/// Subject attribute used as the email recipient when config has no `to`.
pub const EMAIL_ATTRIBUTE: &str = "email";

/// Subject attribute used as the SMS recipient when config has no `to`.
pub const PHONE_ATTRIBUTE: &str = "phone";

// ---------------------------------------------------------------------------
// DispatchError
// ---------------------------------------------------------------------------

/// Outcome of a failed delivery, as seen by the scheduler.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    /// Worth retrying later: timeouts, rate limits, 5xx, connection errors.
    #[error("Transient dispatch failure: {0}")]
    Transient(String),

    /// Retrying cannot help: bad payload, invalid recipient, 4xx.
    #[error("Permanent dispatch failure: {0}")]
    Permanent(String),
}

impl DispatchError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

// ---------------------------------------------------------------------------
// Context
// ---------------------------------------------------------------------------

/// Who a dispatch is for. Passed to every channel call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DispatchContext {
    pub tenant_id: DbId,
    pub workflow_id: DbId,
    pub enrollment_id: DbId,
    pub subject_id: DbId,
    pub action_index: u32,
}

impl DispatchContext {
    /// Stable per (enrollment, action). Downstream systems can use it to
    /// drop the duplicate produced by an at-least-once redelivery.
    pub fn idempotency_key(&self) -> String {
        format!("enr-{}-act-{}", self.enrollment_id, self.action_index)
    }
}

// ---------------------------------------------------------------------------
// Typed requests
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmailMessage {
    pub to: String,
    pub subject: String,
    pub body: String,
    /// Optional named template on the email provider's side.
    pub template: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SmsMessage {
    pub to: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DealRequest {
    pub title: String,
    pub stage: Option<String>,
    pub value: Option<f64>,
    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRequest {
    pub title: String,
    pub description: Option<String>,
    pub due_in_days: Option<u32>,
    pub priority: Option<String>,
}

/// A rendered action, ready for its channel.
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchRequest {
    Email(EmailMessage),
    Sms(SmsMessage),
    Deal(DealRequest),
    Task(TaskRequest),
}

impl DispatchRequest {
    /// Build the typed request for `kind` from a rendered config. `attrs`
    /// supplies the recipient when the config does not name one.
    ///
    /// Returns `Ok(None)` for `WAIT_DELAY`. Missing fields are a
    /// [`DispatchError::Permanent`]: the definition or the subject is
    /// broken and retrying will not fix it.
    pub fn from_rendered(
        kind: ActionKind,
        config: &Value,
        attrs: &Value,
    ) -> Result<Option<Self>, DispatchError> {
        let request = match kind {
            ActionKind::WaitDelay => return Ok(None),
            ActionKind::SendEmail => Self::Email(EmailMessage {
                to: recipient(config, attrs, EMAIL_ATTRIBUTE)?,
                subject: required_str(config, "subject")?,
                body: required_str(config, "body")?,
                template: optional_str(config, "template"),
            }),
            ActionKind::SendSms => Self::Sms(SmsMessage {
                to: recipient(config, attrs, PHONE_ATTRIBUTE)?,
                message: required_str(config, "message")?,
            }),
            ActionKind::CreateDeal => {
                let stage = optional_str(config, "stage");
                let title = optional_str(config, "title")
                    .or_else(|| stage.clone())
                    .ok_or_else(|| missing("title"))?;
                Self::Deal(DealRequest {
                    title,
                    stage,
                    value: config.get("value").and_then(as_number),
                    tags: string_list(config.get("tags")),
                })
            }
            ActionKind::CreateTask => Self::Task(TaskRequest {
                title: required_str(config, "title")?,
                description: optional_str(config, "description"),
                due_in_days: config
                    .get("due_in_days")
                    .and_then(as_number)
                    .filter(|d| *d >= 0.0)
                    .map(|d| d as u32),
                priority: optional_str(config, "priority"),
            }),
        };
        Ok(Some(request))
    }
}

fn missing(key: &str) -> DispatchError {
    DispatchError::Permanent(format!("Action config is missing '{key}'"))
}

fn required_str(config: &Value, key: &str) -> Result<String, DispatchError> {
    optional_str(config, key).ok_or_else(|| missing(key))
}

fn optional_str(config: &Value, key: &str) -> Option<String> {
    config
        .get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn recipient(config: &Value, attrs: &Value, attribute: &str) -> Result<String, DispatchError> {
    optional_str(config, "to")
        .or_else(|| {
            lookup(attrs, attribute)
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        })
        .ok_or_else(|| {
            DispatchError::Permanent(format!("Subject has no '{attribute}' to deliver to"))
        })
}

fn string_list(value: Option<&Value>) -> Vec<String> {
    match value {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect(),
        Some(Value::String(s)) => s
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect(),
        _ => Vec::new(),
    }
}

// ---------------------------------------------------------------------------
// Channel capabilities
// ---------------------------------------------------------------------------

#[async_trait]
pub trait EmailChannel: Send + Sync {
    async fn send_email(
        &self,
        ctx: &DispatchContext,
        message: &EmailMessage,
    ) -> Result<(), DispatchError>;
}

#[async_trait]
pub trait SmsChannel: Send + Sync {
    async fn send_sms(&self, ctx: &DispatchContext, message: &SmsMessage)
        -> Result<(), DispatchError>;
}

/// CRM mutations: deals and follow-up tasks.
#[async_trait]
pub trait CrmChannel: Send + Sync {
    async fn create_deal(
        &self,
        ctx: &DispatchContext,
        deal: &DealRequest,
    ) -> Result<(), DispatchError>;

    async fn create_task(
        &self,
        ctx: &DispatchContext,
        task: &TaskRequest,
    ) -> Result<(), DispatchError>;
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

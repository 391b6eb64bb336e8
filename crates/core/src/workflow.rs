//! Workflow definitions: triggers, conditions, actions, and validation.
//!
//! A [`WorkflowDefinition`] is read-only while enrollments execute it. Edits
//! produce a new `version`; enrollments pin the version they started on.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::types::{DbId, Timestamp};

// ---------------------------------------------------------------------------
// Limits
// ---------------------------------------------------------------------------

/// Maximum length of a workflow name.
pub const MAX_WORKFLOW_NAME_LENGTH: usize = 200;

/// Maximum number of actions in a single workflow.
pub const MAX_ACTIONS: usize = 50;

/// Maximum delay between two consecutive actions (one year).
pub const MAX_DELAY_MINUTES: u32 = 365 * 24 * 60;

/// Maximum lead time for recurring rules, in days.
pub const MAX_RECURRENCE_DAYS: u32 = 366;

// ---------------------------------------------------------------------------
// WorkflowStatus
// ---------------------------------------------------------------------------

/// Lifecycle state of a definition. Only `Active` workflows enroll or run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkflowStatus {
    Active,
    Paused,
    Archived,
}

impl WorkflowStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "ACTIVE",
            Self::Paused => "PAUSED",
            Self::Archived => "ARCHIVED",
        }
    }

    pub fn parse(s: &str) -> Result<Self, CoreError> {
        match s.to_ascii_uppercase().as_str() {
            "ACTIVE" => Ok(Self::Active),
            "PAUSED" => Ok(Self::Paused),
            "ARCHIVED" => Ok(Self::Archived),
            other => Err(CoreError::Validation(format!(
                "Unknown workflow status '{other}'"
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// Triggers
// ---------------------------------------------------------------------------

/// Payload filters for an event trigger. All present filters must pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventFilters {
    /// Payload field -> expected value (loose equality).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub equals: BTreeMap<String, serde_json::Value>,

    /// At least one keyword must appear (case-insensitive) in `keywords_field`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub keywords: Vec<String>,

    /// Payload field searched for keywords. Defaults to `message`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keywords_field: Option<String>,

    /// Allowed values of the payload's `channel_type` (case-insensitive).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub channel_types: Vec<String>,
}

/// How a recurring trigger decides that today is an occurrence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RecurrenceRule {
    /// Yearly anniversary of a date attribute, `days_before` days early
    /// (birthdays, signup anniversaries).
    AnniversaryOf {
        field: String,
        #[serde(default)]
        days_before: u32,
    },
    /// Fires once the date attribute is at least `days` old, or once a
    /// numeric "days since" attribute reaches `days`.
    Inactivity { field: String, days: u32 },
}

/// The condition under which a subject becomes a candidate for enrollment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Trigger {
    Event {
        event_name: String,
        #[serde(default)]
        filters: EventFilters,
    },
    Scheduled {
        at: Timestamp,
    },
    Recurring {
        rule: RecurrenceRule,
    },
}

impl Trigger {
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Event { .. } => "EVENT",
            Self::Scheduled { .. } => "SCHEDULED",
            Self::Recurring { .. } => "RECURRING",
        }
    }
}

// ---------------------------------------------------------------------------
// Conditions
// ---------------------------------------------------------------------------

/// A single predicate over subject attributes. The operator stays a string
/// so unknown operators can be stored and then fail closed at match time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    pub field: String,
    pub operator: String,
    #[serde(default)]
    pub value: serde_json::Value,
}

impl Condition {
    pub fn new(
        field: impl Into<String>,
        operator: impl Into<String>,
        value: serde_json::Value,
    ) -> Self {
        Self {
            field: field.into(),
            operator: operator.into(),
            value,
        }
    }
}

// ---------------------------------------------------------------------------
// Actions
// ---------------------------------------------------------------------------

/// Delivery channel an action is routed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Email,
    Sms,
    Crm,
    None,
}

impl Channel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Email => "email",
            Self::Sms => "sms",
            Self::Crm => "crm",
            Self::None => "none",
        }
    }
}

/// What a workflow step does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionKind {
    SendEmail,
    SendSms,
    CreateDeal,
    CreateTask,
    /// Pure time gap; advances the cursor without touching a channel.
    WaitDelay,
}

impl ActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SendEmail => "SEND_EMAIL",
            Self::SendSms => "SEND_SMS",
            Self::CreateDeal => "CREATE_DEAL",
            Self::CreateTask => "CREATE_TASK",
            Self::WaitDelay => "WAIT_DELAY",
        }
    }

    /// The channel this kind is always delivered through.
    pub fn channel(&self) -> Channel {
        match self {
            Self::SendEmail => Channel::Email,
            Self::SendSms => Channel::Sms,
            Self::CreateDeal | Self::CreateTask => Channel::Crm,
            Self::WaitDelay => Channel::None,
        }
    }

    /// Config keys that must be present for this kind.
    fn required_config_keys(&self) -> &'static [&'static [&'static str]] {
        match self {
            Self::SendEmail => &[&["subject"], &["body"]],
            Self::SendSms => &[&["message"]],
            Self::CreateDeal => &[&["title", "stage"]],
            Self::CreateTask => &[&["title"]],
            Self::WaitDelay => &[],
        }
    }
}

/// One step in a workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    pub index: u32,
    #[serde(rename = "type")]
    pub kind: ActionKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<Channel>,
    /// Minutes after the previous action completed (or after enrollment,
    /// for index 0).
    #[serde(default)]
    pub delay_minutes: u32,
    #[serde(default = "empty_object")]
    pub config: serde_json::Value,
}

fn empty_object() -> serde_json::Value {
    serde_json::Value::Object(Default::default())
}

impl Action {
    pub fn new(
        index: u32,
        kind: ActionKind,
        delay_minutes: u32,
        config: serde_json::Value,
    ) -> Self {
        Self {
            index,
            kind,
            channel: None,
            delay_minutes,
            config,
        }
    }

    /// Effective channel: the declared one, or the kind's default.
    pub fn channel(&self) -> Channel {
        self.channel.unwrap_or_else(|| self.kind.channel())
    }

    pub fn delay(&self) -> chrono::Duration {
        chrono::Duration::minutes(i64::from(self.delay_minutes))
    }
}

// ---------------------------------------------------------------------------
// WorkflowDefinition
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub id: DbId,
    pub tenant_id: DbId,
    pub name: String,
    pub status: WorkflowStatus,
    #[serde(default = "first_version")]
    pub version: i32,
    pub triggers: Vec<Trigger>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    pub actions: Vec<Action>,
    /// Documented placeholder names. Advisory only.
    #[serde(default)]
    pub variables: Vec<String>,
}

fn first_version() -> i32 {
    1
}

impl WorkflowDefinition {
    pub fn is_active(&self) -> bool {
        self.status == WorkflowStatus::Active
    }

    pub fn action(&self, index: u32) -> Option<&Action> {
        self.actions.get(index as usize)
    }

    pub fn action_count(&self) -> u32 {
        self.actions.len() as u32
    }

    /// Event triggers listening for `event_name`.
    pub fn event_triggers<'a>(
        &'a self,
        event_name: &'a str,
    ) -> impl Iterator<Item = &'a EventFilters> + 'a {
        self.triggers.iter().filter_map(move |t| match t {
            Trigger::Event {
                event_name: name,
                filters,
            } if name == event_name => Some(filters),
            _ => None,
        })
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Validate a definition before it is saved.
///
/// Checks the name, trigger list, action ordering, delays, channel/kind
/// consistency, and the config keys each action kind needs.
pub fn validate_definition(def: &WorkflowDefinition) -> Result<(), CoreError> {
    let name = def.name.trim();
    if name.is_empty() {
        return Err(CoreError::Validation(
            "Workflow name must not be empty".to_string(),
        ));
    }
    if name.len() > MAX_WORKFLOW_NAME_LENGTH {
        return Err(CoreError::Validation(format!(
            "Workflow name must not exceed {MAX_WORKFLOW_NAME_LENGTH} characters"
        )));
    }

    if def.triggers.is_empty() {
        return Err(CoreError::Validation(
            "Workflow must have at least one trigger".to_string(),
        ));
    }
    for (i, trigger) in def.triggers.iter().enumerate() {
        validate_trigger(i, trigger)?;
    }

    if def.actions.is_empty() {
        return Err(CoreError::Validation(
            "Workflow must have at least one action".to_string(),
        ));
    }
    if def.actions.len() > MAX_ACTIONS {
        return Err(CoreError::Validation(format!(
            "Workflow may have at most {MAX_ACTIONS} actions"
        )));
    }
    for (position, action) in def.actions.iter().enumerate() {
        validate_action(position, action)?;
    }

    for (i, condition) in def.conditions.iter().enumerate() {
        if condition.field.trim().is_empty() {
            return Err(CoreError::Validation(format!(
                "Condition at index {i} has an empty field"
            )));
        }
    }

    Ok(())
}

fn validate_trigger(i: usize, trigger: &Trigger) -> Result<(), CoreError> {
    match trigger {
        Trigger::Event { event_name, .. } if event_name.trim().is_empty() => Err(
            CoreError::Validation(format!("Event trigger at index {i} has no event name")),
        ),
        Trigger::Recurring { rule } => {
            let (field, days) = match rule {
                RecurrenceRule::AnniversaryOf { field, days_before } => (field, *days_before),
                RecurrenceRule::Inactivity { field, days } => (field, *days),
            };
            if field.trim().is_empty() {
                return Err(CoreError::Validation(format!(
                    "Recurring trigger at index {i} has no field"
                )));
            }
            if days > MAX_RECURRENCE_DAYS {
                return Err(CoreError::Validation(format!(
                    "Recurring trigger at index {i} exceeds {MAX_RECURRENCE_DAYS} days"
                )));
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

fn validate_action(position: usize, action: &Action) -> Result<(), CoreError> {
    if action.index as usize != position {
        return Err(CoreError::Validation(format!(
            "Action at position {position} has index {} (indices must be contiguous from 0)",
            action.index
        )));
    }
    if action.delay_minutes > MAX_DELAY_MINUTES {
        return Err(CoreError::Validation(format!(
            "Action {position} delay exceeds {MAX_DELAY_MINUTES} minutes"
        )));
    }
    if let Some(channel) = action.channel {
        if channel != action.kind.channel() {
            return Err(CoreError::Validation(format!(
                "Action {position} of type {} cannot use channel '{}'",
                action.kind.as_str(),
                channel.as_str()
            )));
        }
    }
    let config = action.config.as_object().ok_or_else(|| {
        CoreError::Validation(format!("Action {position} config must be a JSON object"))
    })?;
    for alternatives in action.kind.required_config_keys() {
        if !alternatives.iter().any(|key| config.contains_key(*key)) {
            return Err(CoreError::Validation(format!(
                "Action {position} ({}) requires config key '{}'",
                action.kind.as_str(),
                alternatives.join("' or '")
            )));
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

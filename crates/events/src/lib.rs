//! Cadence event bus and delivery channels.
//!
//! - [`EventBus`]: in-process publish/subscribe hub backed by
//!   `tokio::sync::broadcast`, carrying [`DomainEvent`]s from the CRM to the
//!   trigger evaluator.
//! - [`delivery`]: the channel adapters the scheduler dispatches through
//!   (SMTP email, HTTP SMS gateway, CRM mutation webhook).

pub mod bus;
pub mod delivery;

pub use bus::{DomainEvent, EventBus};
pub use delivery::crm::{CrmConfig, CrmWebhook};
pub use delivery::email::{EmailConfig, EmailDelivery};
pub use delivery::sms::{SmsConfig, SmsGateway};

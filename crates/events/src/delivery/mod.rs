//! Channel adapters the scheduler dispatches actions through.
//!
//! Each adapter implements one `cadence_core::dispatch` capability trait and
//! maps its own error type onto [`DispatchError`]'s transient/permanent
//! split.

use cadence_core::dispatch::DispatchError;

pub mod crm;
pub mod email;
pub mod sms;

/// Header carrying the per-action idempotency key on HTTP deliveries.
pub const IDEMPOTENCY_HEADER: &str = "Idempotency-Key";

/// Classify a non-2xx HTTP status: request timeout, rate limiting and server
/// errors are worth retrying, every other client error is not.
pub fn classify_status(status: u16, body: &str) -> DispatchError {
    let message = if body.is_empty() {
        format!("HTTP {status}")
    } else {
        format!("HTTP {status}: {}", truncate(body, 200))
    };
    match status {
        408 | 425 | 429 => DispatchError::Transient(message),
        s if s >= 500 => DispatchError::Transient(message),
        _ => DispatchError::Permanent(message),
    }
}

/// Classify a transport-level reqwest failure.
pub fn classify_request_error(err: &reqwest::Error) -> DispatchError {
    if err.is_builder() {
        DispatchError::Permanent(err.to_string())
    } else {
        DispatchError::Transient(err.to_string())
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((i, _)) => &s[..i],
        None => s,
    }
}

//! SMS delivery through an HTTP gateway.
//!
//! [`SmsGateway`] POSTs a JSON message to `SMS_GATEWAY_URL` with a bearer
//! token and implements [`SmsChannel`]. Retrying is the scheduler's job:
//! each call makes exactly one attempt and reports whether it is worth
//! repeating.

use std::time::Duration;

use async_trait::async_trait;
use cadence_core::dispatch::{DispatchContext, DispatchError, SmsChannel, SmsMessage};

use super::{classify_request_error, classify_status, IDEMPOTENCY_HEADER};

/// HTTP request timeout for a single delivery attempt.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Gateway message length limit (concatenated SMS).
pub const MAX_SMS_LENGTH: usize = 1600;

// ---------------------------------------------------------------------------
// SmsConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct SmsConfig {
    pub gateway_url: String,
    pub api_token: Option<String>,
    pub from_number: Option<String>,
}

impl SmsConfig {
    /// Load configuration from environment variables. `None` when
    /// `SMS_GATEWAY_URL` is unset.
    ///
    /// | Variable            | Required | Default |
    /// |---------------------|----------|---------|
    /// | `SMS_GATEWAY_URL`   | yes      |         |
    /// | `SMS_GATEWAY_TOKEN` | no       |         |
    /// | `SMS_FROM_NUMBER`   | no       |         |
    pub fn from_env() -> Option<Self> {
        let gateway_url = std::env::var("SMS_GATEWAY_URL").ok()?;
        Some(Self {
            gateway_url,
            api_token: std::env::var("SMS_GATEWAY_TOKEN").ok(),
            from_number: std::env::var("SMS_FROM_NUMBER").ok(),
        })
    }
}

// ---------------------------------------------------------------------------
// SmsGateway
// ---------------------------------------------------------------------------

pub struct SmsGateway {
    config: SmsConfig,
    client: reqwest::Client,
}

impl SmsGateway {
    pub fn new(config: SmsConfig) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self { config, client })
    }
}

/// Loose E.164 check: optional `+`, then 7 to 15 digits once spaces,
/// dashes, dots and parentheses are removed.
pub fn is_plausible_phone(number: &str) -> bool {
    let digits: String = number
        .trim()
        .trim_start_matches('+')
        .chars()
        .filter(|c| !matches!(c, ' ' | '-' | '.' | '(' | ')'))
        .collect();
    (7..=15).contains(&digits.len()) && digits.chars().all(|c| c.is_ascii_digit())
}

#[async_trait]
impl SmsChannel for SmsGateway {
    async fn send_sms(
        &self,
        ctx: &DispatchContext,
        message: &SmsMessage,
    ) -> Result<(), DispatchError> {
        if !is_plausible_phone(&message.to) {
            return Err(DispatchError::Permanent(format!(
                "Invalid phone number '{}'",
                message.to
            )));
        }
        if message.message.chars().count() > MAX_SMS_LENGTH {
            return Err(DispatchError::Permanent(format!(
                "SMS exceeds {MAX_SMS_LENGTH} characters"
            )));
        }

        let body = serde_json::json!({
            "to": message.to,
            "from": self.config.from_number,
            "message": message.message,
            "reference": ctx.idempotency_key(),
        });

        let mut request = self
            .client
            .post(&self.config.gateway_url)
            .header(IDEMPOTENCY_HEADER, ctx.idempotency_key())
            .json(&body);
        if let Some(token) = &self.config.api_token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| classify_request_error(&e))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let err = classify_status(status.as_u16(), &text);
            tracing::warn!(
                enrollment_id = ctx.enrollment_id,
                action_index = ctx.action_index,
                status = status.as_u16(),
                error = %err,
                "SMS gateway rejected message"
            );
            return Err(err);
        }

        tracing::info!(
            enrollment_id = ctx.enrollment_id,
            action_index = ctx.action_index,
            "Campaign SMS sent"
        );
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn ctx() -> DispatchContext {
        DispatchContext {
            tenant_id: 1,
            workflow_id: 2,
            enrollment_id: 3,
            subject_id: 4,
            action_index: 0,
        }
    }

    fn gateway(server: &MockServer) -> SmsGateway {
        SmsGateway::new(SmsConfig {
            gateway_url: format!("{}/messages", server.uri()),
            api_token: Some("test-token".to_string()),
            from_number: Some("+15550000000".to_string()),
        })
        .unwrap()
    }

    fn sms(to: &str) -> SmsMessage {
        SmsMessage {
            to: to.to_string(),
            message: "Your cart expires soon".to_string(),
        }
    }

    #[test]
    fn phone_plausibility() {
        assert!(is_plausible_phone("+33 6 12 34 56 78"));
        assert!(is_plausible_phone("(555) 123-4567"));
        assert!(!is_plausible_phone("call me"));
        assert!(!is_plausible_phone("123"));
    }

    #[tokio::test]
    async fn success_sends_auth_and_idempotency_key() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/messages"))
            .and(header("Authorization", "Bearer test-token"))
            .and(header(IDEMPOTENCY_HEADER, "enr-3-act-0"))
            .respond_with(ResponseTemplate::new(202))
            .expect(1)
            .mount(&server)
            .await;

        gateway(&server)
            .send_sms(&ctx(), &sms("+15551234567"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn rate_limit_is_transient() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429).set_body_string("slow down"))
            .mount(&server)
            .await;

        let err = gateway(&server)
            .send_sms(&ctx(), &sms("+15551234567"))
            .await
            .unwrap_err();
        assert_matches!(err, DispatchError::Transient(msg) if msg.contains("slow down"));
    }

    #[tokio::test]
    async fn rejected_number_is_permanent() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400))
            .mount(&server)
            .await;

        let err = gateway(&server)
            .send_sms(&ctx(), &sms("+15551234567"))
            .await
            .unwrap_err();
        assert_matches!(err, DispatchError::Permanent(_));
    }

    #[tokio::test]
    async fn malformed_number_never_reaches_gateway() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let err = gateway(&server)
            .send_sms(&ctx(), &sms("not a phone"))
            .await
            .unwrap_err();
        assert_matches!(err, DispatchError::Permanent(_));
    }
}

//! CRM mutations (deals, follow-up tasks) delivered as signed webhooks.
//!
//! [`CrmWebhook`] POSTs `{"type": ..., "data": ...}` to `CRM_WEBHOOK_URL`.
//! When a secret is configured, the raw body is signed with HMAC-SHA256 and
//! sent hex-encoded in [`SIGNATURE_HEADER`] so the CRM can verify origin.

use std::time::Duration;

use async_trait::async_trait;
use cadence_core::dispatch::{CrmChannel, DealRequest, DispatchContext, DispatchError, TaskRequest};
use hmac::{Hmac, Mac};
use serde::Serialize;
use sha2::Sha256;

use super::{classify_request_error, classify_status, IDEMPOTENCY_HEADER};

type HmacSha256 = Hmac<Sha256>;

/// HTTP request timeout for a single delivery attempt.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Header carrying the hex HMAC-SHA256 of the request body.
pub const SIGNATURE_HEADER: &str = "X-Cadence-Signature";

// ---------------------------------------------------------------------------
// CrmConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct CrmConfig {
    pub webhook_url: String,
    pub secret: Option<String>,
}

impl CrmConfig {
    /// Load configuration from environment variables. `None` when
    /// `CRM_WEBHOOK_URL` is unset.
    ///
    /// | Variable             | Required | Default |
    /// |----------------------|----------|---------|
    /// | `CRM_WEBHOOK_URL`    | yes      |         |
    /// | `CRM_WEBHOOK_SECRET` | no       |         |
    pub fn from_env() -> Option<Self> {
        let webhook_url = std::env::var("CRM_WEBHOOK_URL").ok()?;
        Some(Self {
            webhook_url,
            secret: std::env::var("CRM_WEBHOOK_SECRET").ok(),
        })
    }
}

// ---------------------------------------------------------------------------
// Signing
// ---------------------------------------------------------------------------

/// Compute an HMAC-SHA256 signature for a webhook payload.
pub fn compute_signature(secret: &str, payload: &[u8]) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(payload);
    hex_encode(&mac.finalize().into_bytes())
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

// ---------------------------------------------------------------------------
// CrmWebhook
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct Envelope<'a, T: Serialize> {
    #[serde(rename = "type")]
    kind: &'a str,
    idempotency_key: String,
    tenant_id: i64,
    subject_id: i64,
    workflow_id: i64,
    data: &'a T,
}

pub struct CrmWebhook {
    config: CrmConfig,
    client: reqwest::Client,
}

impl CrmWebhook {
    pub fn new(config: CrmConfig) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self { config, client })
    }

    async fn post<T: Serialize + Sync>(
        &self,
        ctx: &DispatchContext,
        kind: &str,
        data: &T,
    ) -> Result<(), DispatchError> {
        let envelope = Envelope {
            kind,
            idempotency_key: ctx.idempotency_key(),
            tenant_id: ctx.tenant_id,
            subject_id: ctx.subject_id,
            workflow_id: ctx.workflow_id,
            data,
        };
        let body = serde_json::to_vec(&envelope)
            .map_err(|e| DispatchError::Permanent(format!("Unserializable CRM payload: {e}")))?;

        let mut request = self
            .client
            .post(&self.config.webhook_url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .header(IDEMPOTENCY_HEADER, ctx.idempotency_key());
        if let Some(secret) = &self.config.secret {
            request = request.header(SIGNATURE_HEADER, compute_signature(secret, &body));
        }

        let response = request
            .body(body)
            .send()
            .await
            .map_err(|e| classify_request_error(&e))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let err = classify_status(status.as_u16(), &text);
            tracing::warn!(
                enrollment_id = ctx.enrollment_id,
                kind,
                status = status.as_u16(),
                error = %err,
                "CRM webhook rejected mutation"
            );
            return Err(err);
        }

        tracing::info!(enrollment_id = ctx.enrollment_id, kind, "CRM mutation delivered");
        Ok(())
    }
}

#[async_trait]
impl CrmChannel for CrmWebhook {
    async fn create_deal(
        &self,
        ctx: &DispatchContext,
        deal: &DealRequest,
    ) -> Result<(), DispatchError> {
        self.post(ctx, "deal.create", deal).await
    }

    async fn create_task(
        &self,
        ctx: &DispatchContext,
        task: &TaskRequest,
    ) -> Result<(), DispatchError> {
        self.post(ctx, "task.create", task).await
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

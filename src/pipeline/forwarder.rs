//! Webhook forwarder — POSTs decoded mail to recipient endpoints.
//!
//! HTTP calls run on a dedicated, fixed-size worker pool so a slow endpoint
//! never stalls the intake runtime. A message task awaits the pool's join
//! handle and nothing else.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::runtime::{Handle, Runtime};
use tracing::debug;

use crate::error::ForwardError;
use crate::pipeline::router::Delivery;
use crate::pipeline::types::{DecodedMessage, ForwardOutcome, ForwardResult};

/// Body POSTed to a webhook.
///
/// `from` carries the matching recipient address, not the envelope sender,
/// so the receiving endpoint learns which of its addresses was hit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookPayload {
    pub from: String,
    pub subject: String,
    pub content: String,
}

impl WebhookPayload {
    pub fn new(recipient: &str, decoded: &DecodedMessage) -> Self {
        Self {
            from: recipient.to_string(),
            subject: decoded.subject.clone(),
            content: decoded.content.clone(),
        }
    }
}

// ── Client seam ─────────────────────────────────────────────────────

/// Transport used to deliver a payload. Returns the response status code.
#[async_trait]
pub trait WebhookClient: Send + Sync {
    async fn post(&self, endpoint: &str, payload: &WebhookPayload) -> Result<u16, ForwardError>;
}

// ── Worker pool ─────────────────────────────────────────────────────

/// Fixed-size pool of threads running outbound HTTP.
pub struct ForwardPool {
    runtime: Option<Runtime>,
}

impl ForwardPool {
    pub fn new(workers: usize) -> std::io::Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(workers.max(1))
            .thread_name("webhook-worker")
            .enable_all()
            .build()?;
        Ok(Self {
            runtime: Some(runtime),
        })
    }

    fn handle(&self) -> Result<&Handle, ForwardError> {
        self.runtime
            .as_ref()
            .map(Runtime::handle)
            .ok_or_else(|| ForwardError::Pool("pool is shut down".into()))
    }

    /// Run `task` on the pool and wait for its output.
    pub async fn run<F>(&self, task: F) -> Result<F::Output, ForwardError>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.handle()?
            .spawn(task)
            .await
            .map_err(|e| ForwardError::Pool(e.to_string()))
    }
}

impl Drop for ForwardPool {
    fn drop(&mut self) {
        // A plain drop would block, which panics inside an async context.
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

// ── HTTP client ─────────────────────────────────────────────────────

/// reqwest-backed [`WebhookClient`] executing on a [`ForwardPool`].
pub struct HttpWebhookClient {
    client: reqwest::Client,
    pool: Arc<ForwardPool>,
}

impl HttpWebhookClient {
    pub fn new(pool: Arc<ForwardPool>) -> Result<Self, ForwardError> {
        let client = reqwest::Client::builder()
            .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ForwardError::Pool(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client, pool })
    }
}

#[async_trait]
impl WebhookClient for HttpWebhookClient {
    async fn post(&self, endpoint: &str, payload: &WebhookPayload) -> Result<u16, ForwardError> {
        let request = self.client.post(endpoint).json(payload);

        let response = self
            .pool
            .run(async move { request.send().await })
            .await?
            .map_err(|e| ForwardError::Request {
                endpoint: endpoint.to_string(),
                reason: e.to_string(),
            })?;

        Ok(response.status().as_u16())
    }
}

// ── Forwarder ───────────────────────────────────────────────────────

/// Delivers a decoded message to one recipient's webhook.
#[derive(Clone)]
pub struct Forwarder {
    client: Arc<dyn WebhookClient>,
}

impl Forwarder {
    pub fn new(client: Arc<dyn WebhookClient>) -> Self {
        Self { client }
    }

    /// Single attempt, never retried. Failures become a `Failed` outcome.
    pub async fn forward(&self, delivery: &Delivery, decoded: &DecodedMessage) -> ForwardResult {
        let payload = WebhookPayload::new(&delivery.recipient, decoded);
        debug!(recipient = %delivery.recipient, endpoint = %delivery.endpoint, "Forwarding to webhook");

        let outcome = match self.client.post(&delivery.endpoint, &payload).await {
            Ok(status) => ForwardOutcome::Delivered { status },
            Err(e) => ForwardOutcome::Failed {
                reason: e.to_string(),
            },
        };

        ForwardResult {
            recipient: delivery.recipient.clone(),
            endpoint: delivery.endpoint.clone(),
            outcome,
        }
    }
}

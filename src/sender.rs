//! Batch delivery to the collector webhook.
//!
//! This module serializes a batch into its canonical JSON payload, signs the
//! exact bytes, and posts them through a [`Transport`] with bounded retries.
//! Batches are sent one at a time by the single batcher task.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Serialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::batcher::Batch;
use crate::config::Config;
use crate::entry::LogEntry;
use crate::retry::{retry_until, RetryPolicy};
use crate::signer;
use crate::stats::PipelineStats;

/// Status codes the collector uses to accept a batch.
pub const SUCCESS_CODES: [u16; 3] = [200, 201, 202];

/// User agent sent with every request.
pub const USER_AGENT: &str = concat!("log-shipper/", env!("CARGO_PKG_VERSION"));

/// Longest slice of an error response body that gets logged.
const MAX_LOGGED_BODY: usize = 200;

/// Errors from a single transport attempt.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("request timed out")]
    Timeout,

    #[error("connection failed: {0}")]
    Connect(String),

    #[error("request failed: {0}")]
    Request(String),

    #[error("client configuration error: {0}")]
    Build(String),
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            TransportError::Timeout
        } else if err.is_connect() {
            TransportError::Connect(err.to_string())
        } else {
            TransportError::Request(err.to_string())
        }
    }
}

/// Why one delivery attempt did not succeed.
#[derive(Debug, Error)]
pub enum SendError {
    #[error("webhook returned {code}: {body}")]
    Status { code: u16, body: String },

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// A fully built, signed request. Retries resend it unchanged.
#[derive(Debug, Clone, PartialEq)]
pub struct DeliveryRequest {
    pub body: Vec<u8>,
    pub headers: Vec<(&'static str, String)>,
}

impl DeliveryRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

/// What the collector answered.
#[derive(Debug, Clone, PartialEq)]
pub struct DeliveryResponse {
    pub status: u16,
    pub body: String,
}

/// Network seam: posts one request and reports the response status.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn post(&self, request: &DeliveryRequest) -> Result<DeliveryResponse, TransportError>;
}

#[async_trait]
impl<T: Transport + ?Sized> Transport for Arc<T> {
    async fn post(&self, request: &DeliveryRequest) -> Result<DeliveryResponse, TransportError> {
        (**self).post(request).await
    }
}

/// Transport posting to the webhook URL with reqwest.
///
/// The underlying client is reused, so connections are pooled across batches.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
    url: String,
    timeout: Duration,
}

impl HttpTransport {
    /// Create a transport for `url` with a per-attempt `timeout`.
    ///
    /// # Errors
    ///
    /// Returns `TransportError::Build` if the HTTP client cannot be built.
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, TransportError> {
        let client = Client::builder()
            .timeout(timeout)
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            .build()
            .map_err(|e| TransportError::Build(e.to_string()))?;

        Ok(Self {
            client,
            url: url.into(),
            timeout,
        })
    }

    pub fn from_config(config: &Config) -> Result<Self, TransportError> {
        Self::new(config.webhook_url.clone(), config.request_timeout)
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn post(&self, request: &DeliveryRequest) -> Result<DeliveryResponse, TransportError> {
        let mut builder = self
            .client
            .post(&self.url)
            .timeout(self.timeout)
            .body(request.body.clone());
        for (name, value) in &request.headers {
            builder = builder.header(*name, value);
        }

        let response = builder.send().await?;
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();

        Ok(DeliveryResponse { status, body })
    }
}

/// Wire format of one batch.
#[derive(Debug, Serialize)]
pub struct Payload<'a> {
    pub source: &'a str,
    #[serde(serialize_with = "crate::entry::iso8601::serialize")]
    pub timestamp: DateTime<Utc>,
    pub host: &'a str,
    pub count: usize,
    pub logs: &'a [LogEntry],
}

impl Payload<'_> {
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

/// Signs and sends batches, retrying each one as a whole.
pub struct BatchSender<T> {
    transport: T,
    source_name: String,
    secret: Vec<u8>,
    api_key: Option<String>,
    host: String,
    policy: RetryPolicy,
    stats: Arc<PipelineStats>,
    stop_retrying: CancellationToken,
}

impl<T: Transport> BatchSender<T> {
    pub fn new(transport: T, config: &Config, stats: Arc<PipelineStats>) -> Self {
        Self {
            transport,
            source_name: config.source_name.clone(),
            secret: config.webhook_secret.as_bytes().to_vec(),
            api_key: config.api_key.clone(),
            host: crate::config::local_hostname(),
            policy: RetryPolicy::new(config.retry_count, config.retry_delay),
            stats,
            stop_retrying: CancellationToken::new(),
        }
    }

    /// Stop retrying once `token` fires. The attempt in flight still completes.
    pub fn with_stop(mut self, token: CancellationToken) -> Self {
        self.stop_retrying = token;
        self
    }

    pub fn stats(&self) -> &Arc<PipelineStats> {
        &self.stats
    }

    /// Serialize, sign and attach headers.
    pub fn build_request(&self, batch: &Batch) -> Result<DeliveryRequest, serde_json::Error> {
        let payload = Payload {
            source: &self.source_name,
            timestamp: Utc::now(),
            host: &self.host,
            count: batch.len(),
            logs: &batch.entries,
        };
        let body = payload.to_bytes()?;
        let signature = signer::sign(&body, &self.secret);

        let mut headers = vec![
            ("Content-Type", "application/json".to_string()),
            ("X-Signature", signature),
            ("X-Source", self.source_name.clone()),
            ("User-Agent", USER_AGENT.to_string()),
        ];
        if let Some(key) = &self.api_key {
            headers.push(("X-API-Key", key.clone()));
        }

        Ok(DeliveryRequest { body, headers })
    }

    /// Deliver one batch. Returns `true` once the collector accepted it.
    ///
    /// On success `logs_sent` grows by the batch size and `batches_sent` by
    /// one; after the last failed attempt `logs_failed` grows by the batch
    /// size instead. Never both, and never more than once.
    pub async fn send(&self, batch: &Batch) -> bool {
        if batch.is_empty() {
            return true;
        }
        let count = batch.len();

        let request = match self.build_request(batch) {
            Ok(request) => request,
            Err(e) => {
                error!(error = %e, batch_id = %batch.id, "Failed to serialize batch");
                self.stats.record_failed(count);
                return false;
            }
        };

        debug!(
            batch_id = %batch.id,
            batch_size = count,
            bytes = request.body.len(),
            "Sending log batch"
        );

        let outcome = retry_until(self.policy, &self.stop_retrying, |attempt| {
            let request = &request;
            async move { self.attempt(request, attempt).await }
        })
        .await;

        match outcome {
            Ok(((), attempt)) => {
                self.stats.record_sent(count);
                info!(
                    batch_id = %batch.id,
                    batch_size = count,
                    attempt = attempt,
                    "Sent batch of {} logs (attempt {})",
                    count,
                    attempt
                );
                true
            }
            Err(e) => {
                self.stats.record_failed(count);
                error!(
                    batch_id = %batch.id,
                    batch_size = count,
                    attempts = e.attempts,
                    error = %e.last,
                    "Dropping batch after exhausting retries"
                );
                false
            }
        }
    }

    async fn attempt(&self, request: &DeliveryRequest, attempt: u32) -> Result<(), SendError> {
        match self.transport.post(request).await {
            Ok(response) if SUCCESS_CODES.contains(&response.status) => Ok(()),
            Ok(response) => {
                let body: String = response.body.chars().take(MAX_LOGGED_BODY).collect();
                warn!(
                    status = response.status,
                    attempt = attempt,
                    body = %body,
                    "Webhook returned non-success status"
                );
                Err(SendError::Status {
                    code: response.status,
                    body,
                })
            }
            Err(e) => {
                error!(error = %e, attempt = attempt, "Request failed");
                Err(SendError::Transport(e))
            }
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }
}

/// Scripted in-memory transport for tests.
#[cfg(test)]
pub(crate) mod fake {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Answers with queued outcomes (then 200 forever) and records requests.
    #[derive(Default)]
    pub struct ScriptedTransport {
        script: Mutex<VecDeque<Result<u16, ()>>>,
        requests: Mutex<Vec<DeliveryRequest>>,
        latency: Duration,
    }

    impl ScriptedTransport {
        pub fn new(script: impl IntoIterator<Item = Result<u16, ()>>) -> Self {
            Self {
                script: Mutex::new(script.into_iter().collect()),
                requests: Mutex::new(Vec::new()),
                latency: Duration::ZERO,
            }
        }

        /// Answer every request only after `latency`.
        pub fn with_latency(mut self, latency: Duration) -> Self {
            self.latency = latency;
            self
        }

        pub fn requests(&self) -> Vec<DeliveryRequest> {
            self.requests.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn post(&self, request: &DeliveryRequest) -> Result<DeliveryResponse, TransportError> {
            self.requests.lock().unwrap().push(request.clone());
            let next = self.script.lock().unwrap().pop_front().unwrap_or(Ok(200));
            if !self.latency.is_zero() {
                tokio::time::sleep(self.latency).await;
            }
            match next {
                Ok(status) => Ok(DeliveryResponse {
                    status,
                    body: format!("status {}", status),
                }),
                Err(()) => Err(TransportError::Connect("connection refused".to_string())),
            }
        }
    }
}

use crate::events::{BatchRequest, TrackingEvent};
use anyhow::{Context, Result};
use chrono::Utc;
use log::{error, info, warn};
use std::sync::RwLock;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Outcome taxonomy for a batch POST. Everything except `Auth` and
/// `BadRequest` is worth retrying from the durable queue.
#[derive(Debug, Error)]
pub enum SendError {
    #[error("cannot send empty batch")]
    EmptyBatch,
    #[error("authentication failed: backend returned status {status}: {body}")]
    Auth { status: u16, body: String },
    #[error("rate limited: backend returned status {status}")]
    RateLimit { status: u16 },
    #[error("invalid request: backend returned status {status}: {body}")]
    BadRequest { status: u16, body: String },
    #[error("backend error: {message}")]
    Backend { message: String },
}

impl SendError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, SendError::RateLimit { .. } | SendError::Backend { .. })
    }
}

/// Sends batches to another process; lets tests observe delivery without a
/// live backend.
pub trait EventTransport: Send + Sync {
    fn send_batch(&self, device_id: &str, events: &[TrackingEvent]) -> Result<(), SendError>;
}

/// Stateless HTTP client for the workbeat backend, except for credentials.
/// The device token is preferred over the API key once it is known.
pub struct ApiClient {
    base_url: String,
    api_key: String,
    device_token: RwLock<Option<String>>,
    http: reqwest::blocking::Client,
}

impl ApiClient {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>, timeout: Duration) -> Result<Self> {
        let http = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            device_token: RwLock::new(None),
            http,
        })
    }

    pub fn set_device_token(&self, token: impl Into<String>) {
        *self
            .device_token
            .write()
            .expect("device token lock poisoned") = Some(token.into());
    }

    fn bearer(&self) -> Option<String> {
        let token = self
            .device_token
            .read()
            .expect("device token lock poisoned")
            .clone();
        token.or_else(|| {
            if self.api_key.is_empty() {
                None
            } else {
                Some(self.api_key.clone())
            }
        })
    }

    pub fn health_check(&self) -> Result<()> {
        let url = format!("{}/health", self.base_url);
        let response = self.http.get(&url).send().context("health check failed")?;
        if !response.status().is_success() {
            anyhow::bail!("health check returned status {}", response.status().as_u16());
        }
        Ok(())
    }
}

impl EventTransport for ApiClient {
    fn send_batch(&self, device_id: &str, events: &[TrackingEvent]) -> Result<(), SendError> {
        if events.is_empty() {
            return Err(SendError::EmptyBatch);
        }

        let batch = BatchRequest {
            events,
            device_id,
            batch_timestamp: Utc::now().timestamp_millis(),
        };

        let url = format!("{}/api/v1/events/batch", self.base_url);
        let mut request = self.http.post(&url).json(&batch);
        if let Some(bearer) = self.bearer() {
            request = request.bearer_auth(bearer);
        }

        let started = Instant::now();
        let response = request.send().map_err(|e| {
            error!(
                "Failed to send batch: event_count={} duration={:?} error={e}",
                events.len(),
                started.elapsed()
            );
            SendError::Backend {
                message: format!("request failed: {e}"),
            }
        })?;

        let status = response.status().as_u16();
        if (200..300).contains(&status) {
            info!(
                "Batch sent successfully: event_count={} status_code={status} duration={:?}",
                events.len(),
                started.elapsed()
            );
            return Ok(());
        }

        let body = response.text().unwrap_or_default();
        let err = classify_status(status, body);
        match &err {
            SendError::RateLimit { .. } => warn!("Rate limited: status_code={status}"),
            _ => error!("Batch rejected: status_code={status} error={err}"),
        }
        Err(err)
    }
}

fn classify_status(status: u16, body: String) -> SendError {
    match status {
        401 | 403 => SendError::Auth { status, body },
        429 => SendError::RateLimit { status },
        400 => SendError::BadRequest { status, body },
        _ => SendError::Backend {
            message: format!("backend returned status {status}: {body}"),
        },
    }
}

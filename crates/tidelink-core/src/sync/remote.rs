//! Remote endpoint abstraction and the HTTP implementation
//!
//! The sync manager only needs a three-way answer per event: acknowledged,
//! permanently rejected, or "try again later".

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Result, TidelinkError};
use crate::outbox::SyncEvent;
use crate::types::{EventId, Millis};

/// Result of pushing one event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushOutcome {
    /// Stored remotely; safe to delete locally
    Ack,
    /// Refused for good (validation, conflict); retrying will not help
    Reject(String),
    /// Could not be delivered right now
    Transient(String),
}

/// Destination of outbox events
#[async_trait]
pub trait RemoteEndpoint: Send + Sync + 'static {
    /// Deliver one event
    async fn push(&self, event: &SyncEvent) -> PushOutcome;
}

/// JSON body POSTed for each event
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct EventBody<'a> {
    id: &'a EventId,
    #[serde(rename = "type")]
    event_type: String,
    entity_id: &'a str,
    payload: serde_json::Value,
    created_at: Millis,
    sync_attempts: u32,
}

impl<'a> EventBody<'a> {
    fn from_event(event: &'a SyncEvent) -> Self {
        // Payloads are JSON in practice; anything else travels as text.
        let payload = serde_json::from_slice(&event.payload).unwrap_or_else(|_| {
            serde_json::Value::String(String::from_utf8_lossy(&event.payload).into_owned())
        });
        Self {
            id: &event.id,
            event_type: event.event_type.to_string(),
            entity_id: &event.entity_id,
            payload,
            created_at: event.created_at,
            sync_attempts: event.sync_attempts,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    message: Option<String>,
    error: Option<String>,
}

/// Map an HTTP response to a push outcome.
///
/// 2xx acknowledges; 400/409/410/422 are permanent rejections; everything
/// else (429, 5xx, unexpected codes) is worth retrying.
pub fn classify_response(status: StatusCode, body: &str) -> PushOutcome {
    if status.is_success() {
        return PushOutcome::Ack;
    }
    let message = error_message(status, body);
    match status.as_u16() {
        400 | 409 | 410 | 422 => PushOutcome::Reject(message),
        _ => PushOutcome::Transient(message),
    }
}

fn error_message(status: StatusCode, body: &str) -> String {
    if let Ok(parsed) = serde_json::from_str::<ErrorBody>(body) {
        if let Some(message) = parsed.message.or(parsed.error) {
            return message.trim().to_string();
        }
    }
    let trimmed = body.trim();
    if trimmed.is_empty() {
        format!("HTTP {}", status.as_u16())
    } else {
        trimmed.to_string()
    }
}

/// Pushes events to `{base_url}/events` as JSON
#[derive(Clone)]
pub struct HttpRemote {
    events_url: String,
    client: reqwest::Client,
}

impl HttpRemote {
    /// Create a client for the given base URL (must be http:// or https://)
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let base_url = base_url.into();
        let base_url = base_url.trim();
        if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
            return Err(TidelinkError::Config(format!(
                "endpoint must include http:// or https://: {}",
                base_url
            )));
        }
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TidelinkError::Remote(e.to_string()))?;
        Ok(Self {
            events_url: format!("{}/events", base_url.trim_end_matches('/')),
            client,
        })
    }

    /// Full URL events are posted to
    pub fn events_url(&self) -> &str {
        &self.events_url
    }
}

#[async_trait]
impl RemoteEndpoint for HttpRemote {
    async fn push(&self, event: &SyncEvent) -> PushOutcome {
        let response = self
            .client
            .post(&self.events_url)
            .header("Accept", "application/json")
            .header("Idempotency-Key", event.id.as_str())
            .json(&EventBody::from_event(event))
            .send()
            .await;

        let response = match response {
            Ok(response) => response,
            Err(e) => {
                debug!(event_id = %event.id, error = %e, "Push request failed");
                return PushOutcome::Transient(e.to_string());
            }
        };
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        classify_response(status, &body)
    }
}

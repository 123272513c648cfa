//! Delivery of bundled event payloads.
//!
//! Payloads POST to `/bulk` as a JSON array. The response's `Date:` header
//! feeds the processor's server clock, which gates debug events. Retry
//! policy: one retry on a 5xx or transport failure, permanent drop on other
//! 4xx, and 401/403 are fatal because the credential will never recover.

use crate::events::{EventProcessor, OutputEvent};
use chrono::DateTime;
use std::time::Duration;
use tracing::{debug, warn};

/// default URL for delivering events
const DEFAULT_EVENTS_URL: &str = "https://events.launchdarkly.com/bulk";

#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("Events URL is invalid: {0}")]
    Uri(#[from] http::uri::InvalidUri),

    #[error("Failed to serialize events: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Failed to build events request: {0}")]
    Request(#[from] http::Error),

    #[error("Event delivery failed after retry: {0}")]
    Transport(hyper::Error),

    #[error("Event delivery rejected with status {0}")]
    Rejected(http::StatusCode),

    #[error("Credential rejected with status {0}, giving up on events")]
    Unauthorized(http::StatusCode),
}

/// Sends event payloads produced by an [EventProcessor].
pub struct EventSender {
    client: hyper::Client<hyper_rustls::HttpsConnector<hyper::client::HttpConnector>>,
    uri: http::Uri,
    token: String,
}

impl EventSender {
    pub fn new<T: Into<String>>(token: T) -> Result<Self, SendError> {
        Self::for_url(DEFAULT_EVENTS_URL, token)
    }

    pub fn for_url<T: Into<String>>(url: &str, token: T) -> Result<Self, SendError> {
        let https = hyper_rustls::HttpsConnector::with_native_roots();
        Ok(Self {
            client: hyper::Client::builder().build(https),
            uri: url.parse()?,
            token: token.into(),
        })
    }

    /// Drain the processor and deliver whatever it held.
    pub async fn flush(&self, processor: &EventProcessor) -> Result<(), SendError> {
        let payload = match processor.bundle() {
            Some(payload) => payload,
            None => return Ok(()),
        };
        self.deliver(&payload, processor).await
    }

    async fn deliver(
        &self,
        payload: &[OutputEvent],
        processor: &EventProcessor,
    ) -> Result<(), SendError> {
        let body = serde_json::to_vec(payload)?;

        let mut last_transport_error = None;
        for attempt in 0..2 {
            if attempt > 0 {
                tokio::time::sleep(Duration::from_secs(1)).await;
            }

            let request = http::Request::post(self.uri.clone())
                .header(http::header::AUTHORIZATION, self.token.as_str())
                .header(http::header::CONTENT_TYPE, "application/json")
                .header(
                    http::header::USER_AGENT,
                    crate::source::default_user_agent(),
                )
                .body(hyper::Body::from(body.clone()))?;

            let response = match self.client.request(request).await {
                Ok(response) => response,
                Err(error) => {
                    warn!(%error, "event delivery transport failure");
                    last_transport_error = Some(error);
                    continue;
                }
            };

            let status = response.status();
            if status.is_success() {
                if let Some(server_time) = parse_server_date(&response) {
                    processor.set_server_time(server_time);
                }
                debug!(events = payload.len(), "delivered event payload");
                return Ok(());
            }

            if status == http::StatusCode::UNAUTHORIZED
                || status == http::StatusCode::FORBIDDEN
            {
                return Err(SendError::Unauthorized(status));
            }
            if status.is_client_error() {
                // the payload will never be accepted; drop it for good
                warn!(%status, "event payload rejected, dropping");
                return Err(SendError::Rejected(status));
            }
            warn!(%status, "event delivery failed, will retry once");
        }

        match last_transport_error {
            Some(error) => Err(SendError::Transport(error)),
            None => Err(SendError::Rejected(http::StatusCode::INTERNAL_SERVER_ERROR)),
        }
    }
}

/// Read the RFC-822 `Date:` response header as unix milliseconds.
fn parse_server_date<B>(response: &http::Response<B>) -> Option<f64> {
    let header = response.headers().get(http::header::DATE)?.to_str().ok()?;
    match DateTime::parse_from_rfc2822(header) {
        Ok(date) => Some(date.timestamp_millis() as f64),
        Err(error) => {
            warn!(%header, %error, "could not parse Date response header");
            None
        }
    }
}

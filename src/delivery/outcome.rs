use std::borrow::Cow;
use std::time::Duration;

use reqwest::StatusCode;
use thiserror::Error;
use tracing::{debug, error, info, warn};
use url::Url;

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("HTTP request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("no pooled connection became free within {0:?}")]
    PoolExhausted(Duration),
}

/// How one delivery ended. Nothing here is retried.
#[derive(Debug)]
pub enum Outcome {
    Delivered { records: usize },
    Rejected { status: StatusCode, body: String },
    Failed(DeliveryError),
    Cancelled,
}

/// What a sink gets to see about a finished delivery.
pub struct Completion<'a> {
    pub url: &'a Url,
    pub records: usize,
    pub payload: &'a [u8],
    pub outcome: Outcome,
}

impl Completion<'_> {
    pub fn payload_text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(self.payload)
    }
}

/// Receives every delivery outcome, on the delivery runtime.
///
/// Implementations must not block; they run on the same worker threads that
/// drive the HTTP connections.
pub trait OutcomeSink: Send + Sync + 'static {
    fn record(&self, completion: &Completion<'_>);
}

/// Default sink: every outcome becomes a log event.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl OutcomeSink for TracingSink {
    fn record(&self, completion: &Completion<'_>) {
        let url = completion.url.as_str();
        match &completion.outcome {
            Outcome::Delivered { records } => {
                info!(records, "{records} metrics written");
                debug!(payload = %completion.payload_text(), "sent metrics payload");
            }
            Outcome::Rejected { status, body } => {
                error!(
                    url,
                    status = status.as_u16(),
                    body = body.as_str(),
                    "ingest endpoint rejected metrics"
                );
                info!(payload = %completion.payload_text(), "rejected metrics payload");
            }
            Outcome::Failed(e) => {
                error!(url, records = completion.records, error = %e, "failed to send metrics");
            }
            Outcome::Cancelled => {
                warn!(url, records = completion.records, "metrics request was cancelled");
            }
        }
    }
}

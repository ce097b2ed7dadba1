//! Posting snapshots to the collection endpoint.
//!
//! The payload goes out as one form-encoded POST. Failed attempts are retried
//! after a fixed pause, except when the server says the API key is invalid.
//! HTTP and sleeping sit behind [`Transport`] and [`Sleeper`] so the retry
//! policy is tested without a network or a clock.

use std::io;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use thiserror::Error;
use tracing::{debug, warn};

use crate::snapshot::Snapshot;
use crate::{COLLECTOR_NAME, COLLECTOR_VERSION};

/// Response body the endpoint returns for an unknown API key.
pub const INVALID_API_KEY_MESSAGE: &str = "Invalid API key";

/// Request timeout for one attempt.
const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

const ZSTD_LEVEL: i32 = 3;

/// Value of the `data_compressor` field when the payload is compressed.
pub const DATA_COMPRESSOR: &str = "zstd";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub attempts: u32,
    /// Pause between attempts.
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("rejected by server: invalid API key")]
    InvalidApiKey,

    #[error("rejected by server after {attempts} attempt(s): {body}")]
    Rejected {
        attempts: u32,
        /// `None` when the last attempt failed below HTTP.
        status: Option<u16>,
        body: String,
    },

    #[error("failed to serialize snapshot: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("failed to compress snapshot: {0}")]
    Compress(#[source] io::Error),

    #[error("failed to create HTTP client: {0}")]
    Client(String),
}

/// What the endpoint answered to an accepted submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitResponse {
    pub status: u16,
    pub body: String,
    pub attempts: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
}

/// A request that produced no HTTP response.
#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct TransportError(pub String);

/// Sends one form-encoded POST.
pub trait Transport {
    fn post_form(
        &self,
        url: &str,
        fields: &[(&'static str, String)],
    ) -> Result<HttpResponse, TransportError>;
}

/// Blocking `reqwest` client with rustls.
pub struct HttpTransport {
    client: reqwest::blocking::Client,
}

impl HttpTransport {
    pub fn new() -> Result<Self, SubmitError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .user_agent(format!("{}/{}", COLLECTOR_NAME, COLLECTOR_VERSION))
            .build()
            .map_err(|e| SubmitError::Client(e.to_string()))?;
        Ok(Self { client })
    }
}

impl Transport for HttpTransport {
    fn post_form(
        &self,
        url: &str,
        fields: &[(&'static str, String)],
    ) -> Result<HttpResponse, TransportError> {
        let response = self
            .client
            .post(url)
            .form(fields)
            .send()
            .map_err(|e| TransportError(format!("HTTP request failed: {}", e)))?;

        let status = response.status().as_u16();
        let body = response
            .text()
            .map_err(|e| TransportError(format!("failed to read response: {}", e)))?;
        Ok(HttpResponse { status, body })
    }
}

pub trait Sleeper {
    fn sleep(&self, duration: Duration);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Posts snapshots with bounded retry.
pub struct Submitter<T, S> {
    transport: T,
    sleeper: S,
    url: String,
    policy: RetryPolicy,
    compress: bool,
}

impl<T: Transport, S: Sleeper> Submitter<T, S> {
    pub fn new(transport: T, sleeper: S, url: impl Into<String>, policy: RetryPolicy) -> Self {
        Self {
            transport,
            sleeper,
            url: url.into(),
            policy,
            compress: false,
        }
    }

    /// Sends `data` zstd compressed and base64 encoded.
    pub fn with_compression(mut self, compress: bool) -> Self {
        self.compress = compress;
        self
    }

    /// Posts `snapshot` until it is accepted or the attempts run out.
    ///
    /// Only status 200 counts as accepted.
    pub fn submit(&self, snapshot: &Snapshot) -> Result<SubmitResponse, SubmitError> {
        let fields = form_fields(snapshot, self.compress)?;
        let attempts = self.policy.attempts.max(1);

        let mut last_status = None;
        let mut last_body = String::new();

        for attempt in 1..=attempts {
            match self.transport.post_form(&self.url, &fields) {
                Ok(response) if response.status == 200 => {
                    debug!(attempt, "snapshot accepted");
                    return Ok(SubmitResponse {
                        status: response.status,
                        body: response.body,
                        attempts: attempt,
                    });
                }
                Ok(response) if response.body.trim() == INVALID_API_KEY_MESSAGE => {
                    return Err(SubmitError::InvalidApiKey);
                }
                Ok(response) => {
                    debug!(
                        attempt,
                        status = response.status,
                        "Got {} while posting data: {}",
                        response.status,
                        response.body
                    );
                    last_status = Some(response.status);
                    last_body = response.body;
                }
                Err(e) => {
                    debug!(attempt, "Exception while posting data: {}", e);
                    last_status = None;
                    last_body = e.0;
                }
            }

            if attempt < attempts {
                warn!(
                    "Submission attempt {}/{} failed, retrying in {}s",
                    attempt,
                    attempts,
                    self.policy.backoff.as_secs()
                );
                self.sleeper.sleep(self.policy.backoff);
            }
        }

        Err(SubmitError::Rejected {
            attempts,
            status: last_status,
            body: last_body,
        })
    }
}

/// Form fields of one submission.
pub fn form_fields(
    snapshot: &Snapshot,
    compress: bool,
) -> Result<Vec<(&'static str, String)>, SubmitError> {
    let features = snapshot.features();
    let data = snapshot.data_json()?;

    let mut fields = Vec::with_capacity(9);
    if compress {
        let compressed =
            zstd::encode_all(data.as_bytes(), ZSTD_LEVEL).map_err(SubmitError::Compress)?;
        debug!(
            raw = data.len(),
            compressed = compressed.len(),
            "payload compressed"
        );
        fields.push(("data", STANDARD.encode(compressed)));
        fields.push(("data_compressor", DATA_COMPRESSOR.to_string()));
    } else {
        fields.push(("data", data));
    }
    fields.push(("api_key", snapshot.api_key().to_string()));
    fields.push(("collected_at", snapshot.collected_at().to_string()));
    fields.push(("submitter", snapshot.submitter()));
    fields.push(("query_parameters", features.query_parameters.to_string()));
    fields.push(("system_information", features.system_information.to_string()));
    if let Some(source) = features.query_source {
        fields.push(("query_source", source.name().to_string()));
    }
    fields.push(("no_reset", (!features.reset).to_string()));
    Ok(fields)
}

//! HTTP calls to the ingestion and feature-flag endpoints.
//!
//! One [`Transport`] wraps a pooled `ureq` agent over a vendored TLS
//! connector. Responses are classified for the retry logic: 5xx and network
//! failures are transient everywhere, a 429 is transient for batch uploads
//! but a rejection for the decide/definition reads (which are never
//! retried), and other 4xx are permanent and carry the response body back
//! to the caller.

use std::collections::HashMap;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use chrono::{SecondsFormat, Utc};
use flate2::{Compression, write::GzEncoder};
use serde_json::json;
use thiserror::Error;
use ureq::{Agent, AgentBuilder};

use crate::event::{Event, Properties};
use crate::flags::{DecideResponse, LocalEvaluationResponse};
use crate::version::VERSION;

/// Failures raised by HTTP operations.
#[non_exhaustive]
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Connection-level failure; the request may never have reached the
    /// server.
    #[error("network error: {0}")]
    Network(String),
    /// The server signalled a transient condition (5xx, or 429 on uploads).
    #[error("server returned retryable status {status}")]
    Server { status: u16, body: String },
    /// The server rejected the request (4xx); not worth retrying.
    #[error("request rejected with status {status}: {body}")]
    Rejected { status: u16, body: String },
    /// A request or response body could not be encoded or decoded.
    #[error("payload encoding failed: {0}")]
    Payload(String),
}

impl TransportError {
    /// Whether a retry with backoff could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TransportError::Network(_) | TransportError::Server { .. }
        )
    }

    /// HTTP status carried by the error, when the server answered at all.
    pub fn status(&self) -> Option<u16> {
        match self {
            TransportError::Server { status, .. } | TransportError::Rejected { status, .. } => {
                Some(*status)
            }
            _ => None,
        }
    }
}

/// Classification of an HTTP status for retry decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ResponseClass {
    /// 2xx responses.
    Success,
    /// 5xx or network errors; 429 too when the endpoint retries on it.
    Retryable,
    /// 4xx otherwise.
    Permanent,
}

/// Rate limiting is transient for batch uploads, which retry with backoff,
/// but a plain rejection for the single-shot read endpoints.
pub(crate) fn classify_status(status: u16, retry_rate_limited: bool) -> ResponseClass {
    match status {
        200..=299 => ResponseClass::Success,
        429 if retry_rate_limited => ResponseClass::Retryable,
        500..=599 => ResponseClass::Retryable,
        _ => ResponseClass::Permanent,
    }
}

/// HTTP client for one endpoint base. Cheap to clone; the underlying agent
/// shares its connection pool.
#[derive(Clone)]
pub struct Transport {
    agent: Agent,
    host: String,
}

impl Transport {
    pub(crate) fn new(host: &str, timeout: Duration) -> Result<Self, TransportError> {
        let connector = native_tls::TlsConnector::new()
            .map_err(|err| TransportError::Network(format!("tls initialisation failed: {err}")))?;
        let agent = AgentBuilder::new()
            .tls_connector(Arc::new(connector))
            .timeout(timeout)
            .user_agent(&format!("posthog-rust/{VERSION}"))
            .build();
        Ok(Self {
            agent,
            host: host.trim_end_matches('/').to_owned(),
        })
    }

    /// POST a batch envelope to `/batch/`, optionally gzip-compressed.
    pub(crate) fn batch_post(
        &self,
        api_key: &str,
        batch: &[Event],
        gzip: bool,
    ) -> Result<(), TransportError> {
        let envelope = json!({
            "api_key": api_key,
            "batch": batch,
            "sent_at": Utc::now().to_rfc3339_opts(SecondsFormat::AutoSi, false),
        });
        let body = serde_json::to_vec(&envelope)
            .map_err(|err| TransportError::Payload(err.to_string()))?;
        let url = format!("{}/batch/", self.host);
        let mut request = self
            .agent
            .post(&url)
            .set("Content-Type", "application/json");
        let result = if gzip {
            request = request.set("Content-Encoding", "gzip");
            let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
            encoder
                .write_all(&body)
                .map_err(|err| TransportError::Payload(err.to_string()))?;
            let compressed = encoder
                .finish()
                .map_err(|err| TransportError::Payload(err.to_string()))?;
            request.send_bytes(&compressed)
        } else {
            request.send_bytes(&body)
        };
        finish(result, true).map(|_| ())
    }

    /// Remote flag evaluation via `/decide/?v=2`.
    pub(crate) fn decide(
        &self,
        api_key: &str,
        distinct_id: &str,
        groups: &HashMap<String, String>,
        person_properties: &Properties,
        group_properties: &HashMap<String, Properties>,
    ) -> Result<DecideResponse, TransportError> {
        let body = json!({
            "api_key": api_key,
            "distinct_id": distinct_id,
            "groups": groups,
            "person_properties": person_properties,
            "group_properties": group_properties,
        });
        let url = format!("{}/decide/?v=2", self.host);
        let response = finish(
            self.agent
                .post(&url)
                .set("Content-Type", "application/json")
                .send_string(&body.to_string()),
            false,
        )?;
        parse_body(response)
    }

    /// Fetch the flag-definition document for local evaluation.
    pub(crate) fn local_evaluation(
        &self,
        project_api_key: &str,
        personal_api_key: &str,
    ) -> Result<LocalEvaluationResponse, TransportError> {
        let url = format!(
            "{}/api/feature_flag/local_evaluation?token={project_api_key}",
            self.host
        );
        let response = finish(
            self.agent
                .get(&url)
                .set("Authorization", &format!("Bearer {personal_api_key}"))
                .call(),
            false,
        )?;
        parse_body(response)
    }
}

fn finish(
    result: Result<ureq::Response, ureq::Error>,
    retry_rate_limited: bool,
) -> Result<ureq::Response, TransportError> {
    match result {
        Ok(response) => Ok(response),
        Err(ureq::Error::Status(status, response)) => {
            let body = response.into_string().unwrap_or_default();
            Err(match classify_status(status, retry_rate_limited) {
                ResponseClass::Retryable => TransportError::Server { status, body },
                _ => TransportError::Rejected { status, body },
            })
        }
        Err(ureq::Error::Transport(err)) => Err(TransportError::Network(err.to_string())),
    }
}

fn parse_body<T: serde::de::DeserializeOwned>(
    response: ureq::Response,
) -> Result<T, TransportError> {
    let text = response
        .into_string()
        .map_err(|err| TransportError::Network(err.to_string()))?;
    serde_json::from_str(&text).map_err(|err| TransportError::Payload(err.to_string()))
}

//! Rendezvous handshake
//!
//! Asks the rendezvous server for a public endpoint. The server answers
//! `GET {base}/{subdomain}` (or `GET {base}/?new`) with
//! `{"id", "url", "port", "max_conn_count"}` on success or `{"error"}` on failure.

use crate::config::{remote_host_of, DEFAULT_REQUEST_TIMEOUT, NEW_SUBDOMAIN};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

/// Largest pool size accepted from the server
pub const MAX_CONNECTION_COUNT: usize = 1024;

/// Assignment handshake errors
#[derive(Debug, Error)]
pub enum AssignmentError {
    #[error("Invalid server url: {0}")]
    InvalidUrl(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Malformed assignment: {0}")]
    Format(String),

    #[error("Server refused assignment: {0}")]
    Assignment(String),
}

/// Public endpoint granted by the rendezvous server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssignmentRecord {
    #[serde(rename = "id")]
    pub assigned_id: String,
    /// Externally reachable url
    pub url: String,
    /// Port on the rendezvous server that relay connections dial
    #[serde(rename = "port")]
    pub remote_port: u16,
    /// Number of parallel relay connections the server accepts
    #[serde(rename = "max_conn_count")]
    pub max_connection_count: usize,
}

impl fmt::Display for AssignmentRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "AssignmentRecord(id={}, url={}, port={}, max_conn_count={})",
            self.assigned_id, self.url, self.remote_port, self.max_connection_count
        )
    }
}

/// Build the handshake url for a requested subdomain
pub fn assignment_url(
    base_url: &str,
    requested_subdomain: Option<&str>,
) -> Result<String, AssignmentError> {
    remote_host_of(base_url).map_err(|e| AssignmentError::InvalidUrl(e.to_string()))?;

    let subdomain = requested_subdomain
        .filter(|s| !s.is_empty())
        .unwrap_or(NEW_SUBDOMAIN);

    Ok(format!("{}/{}", base_url.trim_end_matches('/'), subdomain))
}

/// Parse a handshake response body.
///
/// A server-side `error` field takes precedence over field validation.
pub fn parse_assignment(body: &str) -> Result<AssignmentRecord, AssignmentError> {
    let value: serde_json::Value =
        serde_json::from_str(body).map_err(|e| AssignmentError::Format(e.to_string()))?;

    if !value.is_object() {
        return Err(AssignmentError::Format(format!(
            "expected a JSON object, got: {}",
            value
        )));
    }

    if let Some(error) = value.get("error") {
        let message = match error.as_str() {
            Some(s) => s.to_string(),
            None => error.to_string(),
        };
        return Err(AssignmentError::Assignment(message));
    }

    let record: AssignmentRecord =
        serde_json::from_value(value).map_err(|e| AssignmentError::Format(e.to_string()))?;

    if record.max_connection_count == 0 {
        return Err(AssignmentError::Format(
            "max_conn_count must be at least 1".to_string(),
        ));
    }

    if record.max_connection_count > MAX_CONNECTION_COUNT {
        return Err(AssignmentError::Format(format!(
            "max_conn_count {} exceeds the limit of {}",
            record.max_connection_count, MAX_CONNECTION_COUNT
        )));
    }

    Ok(record)
}

/// HTTP client for the rendezvous handshake
#[derive(Clone)]
pub struct AssignmentClient {
    http: reqwest::Client,
}

impl AssignmentClient {
    /// Create a client whose requests time out after `timeout`
    pub fn new(timeout: Duration) -> Result<Self, AssignmentError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AssignmentError::Transport(e.to_string()))?;

        Ok(Self { http })
    }

    /// Request an assignment for `requested_subdomain`, or any free one if `None`
    pub async fn resolve_assignment(
        &self,
        requested_subdomain: Option<&str>,
        base_url: &str,
    ) -> Result<AssignmentRecord, AssignmentError> {
        let url = assignment_url(base_url, requested_subdomain)?;
        debug!("Requesting assignment from {}", url);

        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| AssignmentError::Transport(format!("request to {} failed: {}", url, e)))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| AssignmentError::Transport(format!("failed to read body: {}", e)))?;

        if !status.is_success() {
            return Err(AssignmentError::Transport(format!(
                "server returned {}: {}",
                status,
                body.trim()
            )));
        }

        let record = parse_assignment(&body)?;
        info!("Assigned {}", record);
        Ok(record)
    }
}

/// One-shot handshake with the default request timeout
pub async fn resolve_assignment(
    requested_subdomain: Option<&str>,
    base_url: &str,
) -> Result<AssignmentRecord, AssignmentError> {
    AssignmentClient::new(DEFAULT_REQUEST_TIMEOUT)?
        .resolve_assignment(requested_subdomain, base_url)
        .await
}

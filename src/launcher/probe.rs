//! HTTP readiness probe
//!
//! A probe is a single `GET` against a runtime's health or listing endpoint,
//! reduced to "unreachable", "responding but not ready", or "ready".

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// How a successful HTTP response is judged
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ReadinessCheck {
    /// Any 2xx response means ready
    Status2xx,
    /// A 2xx response whose JSON body has `field` (optionally equal to `equals`)
    JsonField {
        /// Top-level field that must be present
        field: String,
        /// Required value of the field, if any
        equals: Option<serde_json::Value>,
    },
}

impl ReadinessCheck {
    /// Check that a top-level JSON field is present
    pub fn json_field(field: impl Into<String>) -> Self {
        ReadinessCheck::JsonField {
            field: field.into(),
            equals: None,
        }
    }

    /// Check that a top-level JSON field has a specific value
    pub fn json_field_equals(field: impl Into<String>, value: serde_json::Value) -> Self {
        ReadinessCheck::JsonField {
            field: field.into(),
            equals: Some(value),
        }
    }
}

/// Result of one probe
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeResult {
    /// Application-level readiness confirmed
    Ready,
    /// The endpoint answered but is not ready (e.g. still loading a model)
    NotReady(String),
    /// Connection refused, DNS failure, or request timeout
    Unreachable(String),
}

impl ProbeResult {
    /// Whether anything answered on the endpoint
    pub fn is_responding(&self) -> bool {
        !matches!(self, ProbeResult::Unreachable(_))
    }
}

/// Readiness probe bound to one URL
#[derive(Debug, Clone)]
pub struct HttpProbe {
    client: reqwest::Client,
    url: String,
    check: ReadinessCheck,
}

impl HttpProbe {
    /// Create a probe for `url` judged by `check`
    pub fn new(url: impl Into<String>, check: ReadinessCheck) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
            check,
        }
    }

    /// Probed URL
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Perform one probe with a per-request timeout
    pub async fn check(&self, timeout: Duration) -> ProbeResult {
        let response = match self.client.get(&self.url).timeout(timeout).send().await {
            Ok(response) => response,
            Err(e) => {
                debug!(url = %self.url, error = %e, "Probe could not reach endpoint");
                return ProbeResult::Unreachable(e.to_string());
            }
        };

        let status = response.status();
        if !status.is_success() {
            return ProbeResult::NotReady(format!("HTTP {}", status.as_u16()));
        }

        match &self.check {
            ReadinessCheck::Status2xx => ProbeResult::Ready,
            ReadinessCheck::JsonField { field, equals } => {
                let body: serde_json::Value = match response.json().await {
                    Ok(body) => body,
                    Err(e) => return ProbeResult::NotReady(format!("Invalid JSON body: {}", e)),
                };
                match (body.get(field), equals) {
                    (None, _) => ProbeResult::NotReady(format!("Missing field '{}'", field)),
                    (Some(actual), Some(expected)) if actual != expected => ProbeResult::NotReady(
                        format!("Field '{}' is {} (expected {})", field, actual, expected),
                    ),
                    _ => ProbeResult::Ready,
                }
            }
        }
    }
}

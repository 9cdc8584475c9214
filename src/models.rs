use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use url::Url;

use crate::error::DefinitionError;
use crate::utils::parse_duration;

/// Identifier assigned by the store on insert
pub type RecordId = i64;

/// A load test definition as registered by API callers
///
/// Stored verbatim as a JSON document. Nothing here is validated until the
/// definition is about to run, see [`TestDefinition::validate`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestDefinition {
    /// Display name, also the index cache key
    pub name: String,
    /// Fully-qualified target URL
    #[serde(alias = "target")]
    pub url: String,
    /// HTTP method token
    #[serde(default = "default_method")]
    pub method: String,
    /// Requests per second
    #[serde(alias = "tps")]
    pub rate: i64,
    /// Run length, e.g. "30s" or "1m30s"
    pub duration: String,
}

fn default_method() -> String {
    "GET".to_string()
}

impl TestDefinition {
    /// Check the definition and turn it into something the attacker can run
    pub fn validate(&self) -> Result<Attack, DefinitionError> {
        if self.rate <= 0 {
            return Err(DefinitionError::InvalidRate(self.rate));
        }
        let rate = u32::try_from(self.rate).map_err(|_| DefinitionError::InvalidRate(self.rate))?;

        let duration = parse_duration(&self.duration)
            .map_err(|e| DefinitionError::InvalidDuration(self.duration.clone(), format!("{e:#}")))?;

        let url = Url::parse(&self.url)
            .map_err(|e| DefinitionError::InvalidUrl(self.url.clone(), e.to_string()))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(DefinitionError::InvalidUrl(
                self.url.clone(),
                format!("unsupported scheme `{}`", url.scheme()),
            ));
        }

        let method = self.method.trim().to_ascii_uppercase();
        if method.is_empty() || reqwest::Method::from_bytes(method.as_bytes()).is_err() {
            return Err(DefinitionError::InvalidMethod(self.method.clone()));
        }

        Ok(Attack {
            name: self.name.clone(),
            target: Target { method, url },
            rate,
            duration,
        })
    }
}

/// A row in one of the store's collections
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub id: RecordId,
    pub name: String,
    pub data: serde_json::Value,
}

impl Record {
    /// Decode the payload as a test definition
    pub fn definition(&self) -> Result<TestDefinition, DefinitionError> {
        serde_json::from_value(self.data.clone())
            .map_err(|e| DefinitionError::Malformed(self.id, e.to_string()))
    }
}

/// Represents a target for the load test
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    /// The HTTP method (GET, POST, etc.)
    pub method: String,
    /// The URL to request
    pub url: Url,
}

/// A validated definition, ready to be run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attack {
    pub name: String,
    pub target: Target,
    /// Requests per second, always > 0 once validated
    pub rate: u32,
    pub duration: Duration,
}

/// Outcome of a single request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Hit {
    /// When the request was started
    pub timestamp: DateTime<Utc>,
    /// How long the request took, including reading the body
    pub latency: Duration,
    /// HTTP status code, 0 when no response was received
    pub status_code: u16,
    /// Transport error, if the request never completed
    pub error: Option<String>,
    /// Size of the response body in bytes
    pub bytes_in: u64,
    /// Size of the request body in bytes
    pub bytes_out: u64,
}

impl Hit {
    pub fn is_success(&self) -> bool {
        self.error.is_none() && (200..300).contains(&self.status_code)
    }
}

/// Latency distribution over completed requests
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LatencyMetrics {
    pub total: Duration,
    pub mean: Duration,
    #[serde(rename = "50th")]
    pub p50: Duration,
    #[serde(rename = "90th")]
    pub p90: Duration,
    #[serde(rename = "95th")]
    pub p95: Duration,
    #[serde(rename = "99th")]
    pub p99: Duration,
    pub min: Duration,
    pub max: Duration,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ByteMetrics {
    pub total: u64,
    pub mean: f64,
}

/// A request that did not succeed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HitError {
    pub timestamp: DateTime<Utc>,
    /// Set when a response was received with a non-2xx status
    pub status_code: Option<u16>,
    pub message: String,
}

/// Aggregated metrics of one attacker run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub name: String,
    pub method: String,
    pub target: String,
    /// Total requests issued
    pub requests: u64,
    /// Requests answered with a 2xx status
    pub success: u64,
    pub success_ratio: f64,
    /// Status code histogram over completed requests
    pub status_codes: BTreeMap<u16, u64>,
    pub latencies: LatencyMetrics,
    pub bytes_in: ByteMetrics,
    pub bytes_out: ByteMetrics,
    /// Earliest request start
    pub earliest: Option<DateTime<Utc>>,
    /// Latest request start
    pub latest: Option<DateTime<Utc>>,
    /// Latest request completion
    pub end: Option<DateTime<Utc>>,
    /// Time between earliest and latest request start
    pub duration: Duration,
    /// Time between latest request start and end
    pub wait: Duration,
    /// Issued requests per second
    pub rate: f64,
    /// Successful requests per second
    pub throughput: f64,
    pub errors: Vec<HitError>,
    /// Set when the run was interrupted before its duration elapsed
    pub cancelled: bool,
}

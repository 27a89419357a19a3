//! Upstream provider contracts and the merging ingestion client.

use std::collections::BTreeMap;
use std::path::PathBuf;

use async_trait::async_trait;
use chrono::NaiveDate;
use drawcap_core::{is_non_empty_prize, MAX_PRIZE_POSITIONS};
use drawcap_storage::{FetchError, RetryDisposition, Retryable};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::fs;

pub mod http;
pub mod ingest;

pub use http::HttpUpstream;
pub use ingest::{IngestionClient, MergedFetch};

pub const CRATE_NAME: &str = "drawcap-adapters";

/// Source identifier used when the provider does not name one.
pub const DEFAULT_SOURCE: &str = "default";

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("transient upstream failure: {0}")]
    Transient(String),
    #[error("upstream returned status {status} for {url}")]
    Status { status: u16, url: String },
    #[error("malformed upstream payload: {0}")]
    Malformed(String),
    #[error("invalid request: {0}")]
    Validation(String),
}

impl IngestError {
    /// Stable reason code recorded in schedule state.
    pub fn reason_code(&self) -> &'static str {
        match self {
            IngestError::Transient(_) => "upstream_transient",
            IngestError::Status { .. } => "upstream_error",
            IngestError::Malformed(_) => "malformed_payload",
            IngestError::Validation(_) => "validation_error",
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, IngestError::Transient(_))
    }
}

impl From<FetchError> for IngestError {
    fn from(err: FetchError) -> Self {
        match (err.disposition(), &err) {
            (RetryDisposition::Retryable, _) => IngestError::Transient(err.to_string()),
            (_, FetchError::HttpStatus { status, url }) => IngestError::Status {
                status: *status,
                url: url.clone(),
            },
            (_, FetchError::Request(_)) => IngestError::Transient(err.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchRequest {
    pub lottery_key: String,
    pub date: NaiveDate,
    pub source_id: Option<String>,
}

/// One provider draw record: a date, a raw close hour and up to fifteen
/// `prize_N` fields (absent, null or placeholder when not drawn yet).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawDrawRecord {
    pub date: String,
    pub close_hour: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_id: Option<String>,
    #[serde(flatten)]
    pub fields: BTreeMap<String, JsonValue>,
}

impl RawDrawRecord {
    /// `(position, raw value)` for every present prize field, in position order.
    pub fn prize_fields(&self) -> Vec<(u8, String)> {
        (1..=MAX_PRIZE_POSITIONS)
            .filter_map(|position| {
                let value = self.fields.get(&format!("prize_{position}"))?;
                let text = match value {
                    JsonValue::String(s) => s.clone(),
                    JsonValue::Number(n) => n.to_string(),
                    _ => return None,
                };
                Some((position, text))
            })
            .collect()
    }

    pub fn non_empty_prize_count(&self) -> usize {
        self.prize_fields()
            .iter()
            .filter(|(_, raw)| is_non_empty_prize(raw))
            .count()
    }

    pub fn source_or(&self, fallback: &str) -> String {
        self.source_id
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .unwrap_or(fallback)
            .to_string()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UpstreamPayload {
    #[serde(default)]
    pub records: Vec<RawDrawRecord>,
    /// Provider's explicit "no draw for this date" signal.
    #[serde(default)]
    pub no_draw: bool,
    #[serde(default)]
    pub message: Option<String>,
}

impl UpstreamPayload {
    pub fn parse(bytes: &[u8]) -> Result<Self, IngestError> {
        serde_json::from_slice(bytes).map_err(|e| IngestError::Malformed(e.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DayStatus {
    Open,
    Closed { reason: String },
    Unknown,
}

#[async_trait]
pub trait UpstreamProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn fetch(&self, request: &FetchRequest) -> Result<UpstreamPayload, IngestError>;

    /// External "is there a draw today at all" signal. Providers without
    /// one answer `Unknown`.
    async fn day_status(
        &self,
        _lottery_key: &str,
        _date: NaiveDate,
    ) -> Result<DayStatus, IngestError> {
        Ok(DayStatus::Unknown)
    }
}

/// Serves payloads from `<root>/<lottery>/<date>[.<source>].json`. A missing
/// file is an empty payload.
#[derive(Debug, Clone)]
pub struct FixtureUpstream {
    root: PathBuf,
}

impl FixtureUpstream {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, request: &FetchRequest) -> PathBuf {
        let file = match &request.source_id {
            Some(source) => format!("{}.{}.json", request.date, source),
            None => format!("{}.json", request.date),
        };
        self.root.join(&request.lottery_key).join(file)
    }
}

#[async_trait]
impl UpstreamProvider for FixtureUpstream {
    fn name(&self) -> &str {
        "fixture"
    }

    async fn fetch(&self, request: &FetchRequest) -> Result<UpstreamPayload, IngestError> {
        let path = self.path_for(request);
        match fs::read(&path).await {
            Ok(bytes) => UpstreamPayload::parse(&bytes),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Ok(UpstreamPayload::default())
            }
            Err(err) => Err(IngestError::Transient(format!("reading {}: {err}", path.display()))),
        }
    }

    async fn day_status(
        &self,
        lottery_key: &str,
        date: NaiveDate,
    ) -> Result<DayStatus, IngestError> {
        let path = self.root.join(lottery_key).join(format!("{date}.status.json"));
        match fs::read(&path).await {
            Ok(bytes) => {
                serde_json::from_slice(&bytes).map_err(|e| IngestError::Malformed(e.to_string()))
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(DayStatus::Unknown),
            Err(err) => Err(IngestError::Transient(format!("reading {}: {err}", path.display()))),
        }
    }
}

//! Durable stores, upstream HTTP fetch and the raw payload archive.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, Instrument};
use uuid::Uuid;

pub mod draws;
pub mod lock;
pub mod postgres;
pub mod retry;
pub mod state;

pub use draws::{
    load_prizes_bounded, DrawStore, FileDrawStore, MemoryDrawStore, PrizeMerge,
    DEFAULT_PRIZE_LOAD_CONCURRENCY,
};
pub use lock::{LockRecord, RunLock};
pub use postgres::PgDrawStore;
pub use retry::{classify_reqwest_error, classify_status, RetryDisposition, RetryPolicy, Retryable};
pub use state::{FileStateStore, MemoryStateStore, StateStore};

pub const CRATE_NAME: &str = "drawcap-storage";

/// Writes `bytes` to `path` through a sibling temp file and a rename, so
/// readers never observe a half-written document.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("{} has no parent directory", path.display()))?;
    fs::create_dir_all(parent)
        .await
        .with_context(|| format!("creating directory {}", parent.display()))?;

    let temp_path = parent.join(format!(".{}.tmp", Uuid::new_v4()));
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .with_context(|| format!("opening temp file {}", temp_path.display()))?;
    file.write_all(bytes)
        .await
        .with_context(|| format!("writing temp file {}", temp_path.display()))?;
    file.flush()
        .await
        .with_context(|| format!("flushing temp file {}", temp_path.display()))?;
    drop(file);

    if let Err(err) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err).with_context(|| {
            format!(
                "atomically renaming {} -> {}",
                temp_path.display(),
                path.display()
            )
        });
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct StoredPayload {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    pub deduplicated: bool,
}

/// Immutable, hash-addressed archive of raw upstream responses.
#[derive(Debug, Clone)]
pub struct PayloadArchive {
    root: PathBuf,
}

impl PayloadArchive {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    pub fn payload_relative_path(
        &self,
        fetched_at: DateTime<Utc>,
        lottery_key: &str,
        content_hash: &str,
    ) -> PathBuf {
        PathBuf::from(fetched_at.format("%Y%m%d").to_string())
            .join(lottery_key)
            .join(format!("{content_hash}.json"))
    }

    /// Identical bodies land on the same path and are only written once.
    pub async fn store(
        &self,
        fetched_at: DateTime<Utc>,
        lottery_key: &str,
        bytes: &[u8],
    ) -> anyhow::Result<StoredPayload> {
        let content_hash = Self::sha256_hex(bytes);
        let relative_path = self.payload_relative_path(fetched_at, lottery_key, &content_hash);
        let absolute_path = self.root.join(&relative_path);

        let exists = fs::try_exists(&absolute_path)
            .await
            .with_context(|| format!("checking payload path {}", absolute_path.display()))?;
        if !exists {
            write_atomic(&absolute_path, bytes).await?;
        }

        Ok(StoredPayload {
            content_hash,
            relative_path,
            absolute_path,
            byte_size: bytes.len(),
            deduplicated: exists,
        })
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    pub per_lottery_concurrency: usize,
    pub retry: RetryPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            global_concurrency: 6,
            per_lottery_concurrency: 2,
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
    pub attempts: usize,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

impl FetchError {
    pub fn status(&self) -> Option<u16> {
        match self {
            FetchError::HttpStatus { status, .. } => Some(*status),
            FetchError::Request(err) => err.status().map(|s| s.as_u16()),
        }
    }
}

impl Retryable for FetchError {
    fn disposition(&self) -> RetryDisposition {
        match self {
            FetchError::Request(err) => classify_reqwest_error(err),
            FetchError::HttpStatus { status, .. } => StatusCode::from_u16(*status)
                .map(classify_status)
                .unwrap_or(RetryDisposition::NonRetryable),
        }
    }
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    per_lottery_limit: usize,
    per_lottery: Mutex<HashMap<String, Arc<Semaphore>>>,
    retry: RetryPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;

        Ok(Self {
            client,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            per_lottery_limit: config.per_lottery_concurrency.max(1),
            per_lottery: Mutex::new(HashMap::new()),
            retry: config.retry,
        })
    }

    async fn per_lottery_semaphore(&self, lottery_key: &str) -> Arc<Semaphore> {
        let mut map = self.per_lottery.lock().await;
        map.entry(lottery_key.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_lottery_limit)))
            .clone()
    }

    /// GETs `url`, retrying timeouts, resets, 429 and 5xx per the policy.
    pub async fn fetch_bytes(
        &self,
        run_id: Uuid,
        lottery_key: &str,
        url: &str,
    ) -> Result<FetchedResponse, FetchError> {
        // Semaphores are never closed, acquisition only fails after close().
        let _global = self.global_limit.clone().acquire_owned().await.ok();
        let per_lottery = self.per_lottery_semaphore(lottery_key).await;
        let _lottery = per_lottery.acquire_owned().await.ok();

        let span = tracing::info_span!("http_fetch", %run_id, lottery = lottery_key, url);
        self.retry
            .run(url, |attempt| async move {
                debug!(attempt = attempt + 1, "sending upstream request");
                let resp = self.client.get(url).send().await?;
                let status = resp.status();
                let final_url = resp.url().to_string();
                if !status.is_success() {
                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                let body = resp.bytes().await?.to_vec();
                Ok(FetchedResponse {
                    status,
                    final_url,
                    body,
                    attempts: attempt + 1,
                })
            })
            .instrument(span)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn payload_hashing_is_stable() {
        let hash = PayloadArchive::sha256_hex(b"hello world");
        assert_eq!(
            hash,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[tokio::test]
    async fn identical_payloads_are_archived_once() {
        let dir = tempdir().expect("tempdir");
        let archive = PayloadArchive::new(dir.path());
        let fetched_at = DateTime::parse_from_rfc3339("2025-12-29T14:30:00Z")
            .expect("ts")
            .with_timezone(&Utc);

        let first = archive
            .store(fetched_at, "L", br#"{"records":[]}"#)
            .await
            .expect("first store");
        let second = archive
            .store(fetched_at, "L", br#"{"records":[]}"#)
            .await
            .expect("second store");

        assert!(!first.deduplicated);
        assert!(second.deduplicated);
        assert_eq!(first.relative_path, second.relative_path);
        assert!(first.relative_path.starts_with("20251229/L"));
        assert!(first.absolute_path.exists());
    }

    #[test]
    fn status_errors_know_their_retry_disposition() {
        let throttled = FetchError::HttpStatus {
            status: 429,
            url: "u".into(),
        };
        let missing = FetchError::HttpStatus {
            status: 404,
            url: "u".into(),
        };
        let broken = FetchError::HttpStatus {
            status: 503,
            url: "u".into(),
        };
        assert_eq!(throttled.disposition(), RetryDisposition::Retryable);
        assert_eq!(broken.disposition(), RetryDisposition::Retryable);
        assert_eq!(missing.disposition(), RetryDisposition::NonRetryable);
        assert_eq!(missing.status(), Some(404));
    }
}

//! Key/value state persistence (schedule state, calendar tables, run locks).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tokio::time::sleep;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::write_atomic;

#[async_trait]
pub trait StateStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn set(&self, key: &str, value: &str) -> Result<()>;

    /// Replaces the value only when the current value equals `expected`
    /// (`None` meaning absent). `new = None` deletes. Returns whether the
    /// swap happened.
    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        new: Option<&str>,
    ) -> Result<bool>;
}

pub async fn load_json<T: DeserializeOwned>(
    store: &dyn StateStore,
    key: &str,
) -> Result<Option<T>> {
    match store.get(key).await? {
        Some(text) => serde_json::from_str(&text)
            .map(Some)
            .with_context(|| format!("parsing state {key}")),
        None => Ok(None),
    }
}

pub async fn save_json<T: Serialize + Sync>(
    store: &dyn StateStore,
    key: &str,
    value: &T,
) -> Result<()> {
    let text = serde_json::to_string_pretty(value)
        .with_context(|| format!("serializing state {key}"))?;
    store.set(key, &text).await
}

fn validate_key(key: &str) -> Result<()> {
    let ok_chars = key
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '/'));
    if key.is_empty() || !ok_chars || key.split('/').any(|part| part.is_empty() || part == "..") {
        bail!("invalid state key {key:?}");
    }
    Ok(())
}

/// How long a swap guard may sit on disk before it is treated as left
/// behind by a crashed process.
const SWAP_GUARD_STALE: Duration = Duration::from_secs(30);
const SWAP_GUARD_ATTEMPTS: u32 = 50;
const SWAP_GUARD_BACKOFF: Duration = Duration::from_millis(10);

/// Exclusive `<key>.json.swap` marker held while a value is read, compared
/// and replaced. Removed on drop.
struct SwapGuard {
    path: PathBuf,
}

impl SwapGuard {
    /// `None` when another holder kept the guard for every attempt.
    async fn acquire(target: &Path) -> Result<Option<SwapGuard>> {
        let path = target.with_extension("json.swap");
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        for _ in 0..SWAP_GUARD_ATTEMPTS {
            match fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
                .await
            {
                Ok(_) => return Ok(Some(SwapGuard { path })),
                Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                    Self::break_if_stale(&path).await;
                    sleep(SWAP_GUARD_BACKOFF).await;
                }
                Err(err) => return Err(err).with_context(|| format!("creating {}", path.display())),
            }
        }
        Ok(None)
    }

    async fn break_if_stale(path: &Path) {
        let Ok(meta) = fs::metadata(path).await else {
            return;
        };
        let age = meta
            .modified()
            .ok()
            .and_then(|at| SystemTime::now().duration_since(at).ok());
        if age.is_some_and(|age| age > SWAP_GUARD_STALE) {
            // Rename first so two breakers cannot both delete a fresh guard.
            let tombstone = path.with_extension(format!("swap.{}", Uuid::new_v4()));
            if fs::rename(path, &tombstone).await.is_ok() {
                warn!(guard = %path.display(), "removed abandoned swap guard");
                let _ = fs::remove_file(&tombstone).await;
            }
        }
    }
}

impl Drop for SwapGuard {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// One JSON file per key under `root`. Creation is atomic across
/// processes (temp file + hard link). Replacing or deleting an existing
/// value happens under an exclusive swap guard file, so concurrent
/// processes sharing `root` see at most one successful swap per value.
#[derive(Debug)]
pub struct FileStateStore {
    root: PathBuf,
    swap_lock: Mutex<()>,
}

impl FileStateStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            swap_lock: Mutex::new(()),
        }
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        validate_key(key)?;
        Ok(self.root.join(format!("{key}.json")))
    }

    async fn read(path: &PathBuf) -> Result<Option<String>> {
        match fs::read_to_string(path).await {
            Ok(text) => Ok(Some(text)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err).with_context(|| format!("reading {}", path.display())),
        }
    }

    async fn create_exclusive(path: &PathBuf, value: &str) -> Result<bool> {
        let parent = path
            .parent()
            .with_context(|| format!("{} has no parent directory", path.display()))?;
        fs::create_dir_all(parent)
            .await
            .with_context(|| format!("creating {}", parent.display()))?;
        let temp = parent.join(format!(".{}.tmp", Uuid::new_v4()));
        let mut file = fs::File::create(&temp)
            .await
            .with_context(|| format!("creating {}", temp.display()))?;
        file.write_all(value.as_bytes()).await?;
        file.flush().await?;
        drop(file);

        let linked = fs::hard_link(&temp, path).await;
        let _ = fs::remove_file(&temp).await;
        match linked {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => Ok(false),
            Err(err) => Err(err).with_context(|| format!("linking {}", path.display())),
        }
    }
}

#[async_trait]
impl StateStore for FileStateStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Self::read(&self.path_for(key)?).await
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        let path = self.path_for(key)?;
        let _guard = self.swap_lock.lock().await;
        write_atomic(&path, value.as_bytes()).await
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        new: Option<&str>,
    ) -> Result<bool> {
        let path = self.path_for(key)?;
        let _guard = self.swap_lock.lock().await;

        if expected.is_none() {
            return match new {
                Some(value) => Self::create_exclusive(&path, value).await,
                None => Ok(Self::read(&path).await?.is_none()),
            };
        }

        let Some(_swap) = SwapGuard::acquire(&path).await? else {
            debug!(key, "swap guard busy; compare-and-swap lost");
            return Ok(false);
        };
        let current = Self::read(&path).await?;
        if current.as_deref() != expected {
            return Ok(false);
        }
        match new {
            Some(value) => write_atomic(&path, value.as_bytes()).await?,
            None => match fs::remove_file(&path).await {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(false),
                Err(err) => return Err(err).with_context(|| format!("removing {}", path.display())),
            },
        }
        Ok(true)
    }
}

#[derive(Debug, Default)]
pub struct MemoryStateStore {
    values: Mutex<HashMap<String, String>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        validate_key(key)?;
        Ok(self.values.lock().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        validate_key(key)?;
        self.values
            .lock()
            .await
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        new: Option<&str>,
    ) -> Result<bool> {
        validate_key(key)?;
        let mut values = self.values.lock().await;
        if values.get(key).map(String::as_str) != expected {
            return Ok(false);
        }
        match new {
            Some(value) => {
                values.insert(key.to_string(), value.to_string());
            }
            None => {
                values.remove(key);
            }
        }
        Ok(true)
    }
}

//! Draw + prize persistence. All writes are additive merges keyed by the
//! deterministic draw id; nothing on this path deletes.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::NaiveDate;
use drawcap_core::{Draw, Prize};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use uuid::Uuid;

use crate::write_atomic;

/// Default worker count for bulk prize reads.
pub const DEFAULT_PRIZE_LOAD_CONCURRENCY: usize = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrizeMerge {
    Inserted,
    Updated,
    Unchanged,
    /// Incoming value was empty; the stored prize (if any) was left alone.
    KeptExisting,
}

#[async_trait]
pub trait DrawStore: Send + Sync {
    async fn get_draw(&self, id: Uuid) -> Result<Option<Draw>>;

    /// Inserts the draw or merges metadata into the stored one. The stored
    /// `prize_count` and `imported_at` are preserved on merge.
    async fn upsert_draw(&self, draw: &Draw) -> Result<()>;

    /// The draw must already exist.
    async fn upsert_prize(&self, draw_id: Uuid, prize: &Prize) -> Result<PrizeMerge>;

    async fn list_prizes(&self, draw_id: Uuid) -> Result<Vec<Prize>>;

    async fn list_draws(&self, lottery_key: &str) -> Result<Vec<Draw>>;

    async fn draws_for_date(&self, lottery_key: &str, date: NaiveDate) -> Result<Vec<Draw>> {
        Ok(self
            .list_draws(lottery_key)
            .await?
            .into_iter()
            .filter(|d| d.date == date)
            .collect())
    }

    async fn prize_count(&self, draw_id: Uuid) -> Result<usize> {
        Ok(self.list_prizes(draw_id).await?.len())
    }
}

/// Loads prize lists for many draws with at most `limit` reads in flight.
/// Results come back in the order of `draw_ids`.
pub async fn load_prizes_bounded(
    store: Arc<dyn DrawStore>,
    draw_ids: &[Uuid],
    limit: usize,
) -> Result<Vec<(Uuid, Vec<Prize>)>> {
    let permits = Arc::new(Semaphore::new(limit.max(1)));
    let mut tasks = JoinSet::new();

    for (index, id) in draw_ids.iter().copied().enumerate() {
        let store = Arc::clone(&store);
        let permits = Arc::clone(&permits);
        tasks.spawn(async move {
            let _permit = permits
                .acquire_owned()
                .await
                .context("prize loader semaphore closed")?;
            let prizes = store.list_prizes(id).await?;
            anyhow::Ok((index, id, prizes))
        });
    }

    let mut out: Vec<Option<(Uuid, Vec<Prize>)>> = vec![None; draw_ids.len()];
    while let Some(joined) = tasks.join_next().await {
        let (index, id, prizes) = joined.context("prize loader task panicked")??;
        out[index] = Some((id, prizes));
    }
    Ok(out.into_iter().flatten().collect())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct DrawDocument {
    draw: Draw,
    #[serde(default)]
    prizes: BTreeMap<u8, Prize>,
}

fn merge_draw(existing: &mut Draw, incoming: &Draw) {
    if incoming.hour_bucket_raw.is_some() {
        existing.hour_bucket_raw = incoming.hour_bucket_raw.clone();
    }
    if !incoming.source.is_empty() {
        existing.source = incoming.source.clone();
    }
}

fn merge_prize(prizes: &mut BTreeMap<u8, Prize>, prize: &Prize) -> PrizeMerge {
    if prize.raw_value.trim().is_empty() {
        return PrizeMerge::KeptExisting;
    }
    match prizes.get(&prize.position) {
        Some(current) if current == prize => PrizeMerge::Unchanged,
        Some(_) => {
            prizes.insert(prize.position, prize.clone());
            PrizeMerge::Updated
        }
        None => {
            prizes.insert(prize.position, prize.clone());
            PrizeMerge::Inserted
        }
    }
}

/// JSON document per draw under `<root>/<lottery>/<date>/<id>.json`.
/// Paths are remembered by id once written or listed, so lookups by id
/// only walk the tree on a cold miss.
#[derive(Debug)]
pub struct FileDrawStore {
    root: PathBuf,
    write_lock: Mutex<()>,
    paths: Mutex<HashMap<Uuid, PathBuf>>,
}

fn id_from_path(path: &Path) -> Option<Uuid> {
    path.file_stem()
        .and_then(|stem| stem.to_str())
        .and_then(|stem| Uuid::parse_str(stem).ok())
}

impl FileDrawStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            write_lock: Mutex::new(()),
            paths: Mutex::new(HashMap::new()),
        }
    }

    async fn remember(&self, found: &[PathBuf]) {
        let mut paths = self.paths.lock().await;
        for path in found {
            if let Some(id) = id_from_path(path) {
                paths.insert(id, path.clone());
            }
        }
    }

    #[cfg(test)]
    async fn indexed(&self) -> usize {
        self.paths.lock().await.len()
    }

    fn document_path(&self, draw: &Draw) -> PathBuf {
        self.root
            .join(&draw.lottery_key)
            .join(draw.date.to_string())
            .join(format!("{}.json", draw.id))
    }

    async fn read_document(path: &PathBuf) -> Result<Option<DrawDocument>> {
        match fs::read(path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .with_context(|| format!("parsing {}", path.display())),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err).with_context(|| format!("reading {}", path.display())),
        }
    }

    async fn write_document(&self, doc: &DrawDocument) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(doc).context("serializing draw document")?;
        let path = self.document_path(&doc.draw);
        write_atomic(&path, &bytes).await?;
        self.paths.lock().await.insert(doc.draw.id, path);
        Ok(())
    }

    async fn document_paths(&self, lottery_key: &str) -> Result<Vec<PathBuf>> {
        let lottery_dir = self.root.join(lottery_key);
        let mut paths = Vec::new();
        let mut dates = match fs::read_dir(&lottery_dir).await {
            Ok(rd) => rd,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(paths),
            Err(err) => {
                return Err(err).with_context(|| format!("listing {}", lottery_dir.display()))
            }
        };
        while let Some(date_dir) = dates.next_entry().await? {
            if !date_dir.file_type().await?.is_dir() {
                continue;
            }
            let mut files = fs::read_dir(date_dir.path()).await?;
            while let Some(file) = files.next_entry().await? {
                let path = file.path();
                if path.extension().is_some_and(|ext| ext == "json") {
                    paths.push(path);
                }
            }
        }
        paths.sort();
        Ok(paths)
    }

    async fn find_document(&self, id: Uuid) -> Result<Option<(PathBuf, DrawDocument)>> {
        let known = self.paths.lock().await.get(&id).cloned();
        if let Some(path) = known {
            if let Some(doc) = Self::read_document(&path).await? {
                return Ok(Some((path, doc)));
            }
            self.paths.lock().await.remove(&id);
        }

        let mut lotteries = match fs::read_dir(&self.root).await {
            Ok(rd) => rd,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err).with_context(|| format!("listing {}", self.root.display())),
        };
        let mut found = None;
        while let Some(lottery) = lotteries.next_entry().await? {
            if !lottery.file_type().await?.is_dir() {
                continue;
            }
            let lottery_key = lottery.file_name().to_string_lossy().to_string();
            let paths = self.document_paths(&lottery_key).await?;
            self.remember(&paths).await;
            if let Some(path) = paths.into_iter().find(|p| id_from_path(p) == Some(id)) {
                found = Some(path);
                break;
            }
        }
        match found {
            Some(path) => Ok(Self::read_document(&path).await?.map(|doc| (path, doc))),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl DrawStore for FileDrawStore {
    async fn get_draw(&self, id: Uuid) -> Result<Option<Draw>> {
        Ok(self.find_document(id).await?.map(|(_, doc)| doc.draw))
    }

    async fn upsert_draw(&self, draw: &Draw) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let path = self.document_path(draw);
        let doc = match Self::read_document(&path).await? {
            Some(mut doc) => {
                merge_draw(&mut doc.draw, draw);
                doc
            }
            None => DrawDocument {
                draw: Draw {
                    prize_count: 0,
                    ..draw.clone()
                },
                prizes: BTreeMap::new(),
            },
        };
        self.write_document(&doc).await
    }

    async fn upsert_prize(&self, draw_id: Uuid, prize: &Prize) -> Result<PrizeMerge> {
        let _guard = self.write_lock.lock().await;
        let (_, mut doc) = self
            .find_document(draw_id)
            .await?
            .with_context(|| format!("draw {draw_id} not found"))?;
        let merge = merge_prize(&mut doc.prizes, prize);
        if matches!(merge, PrizeMerge::Inserted | PrizeMerge::Updated) {
            doc.draw.prize_count = doc.prizes.len() as u32;
            self.write_document(&doc).await?;
        }
        Ok(merge)
    }

    async fn list_prizes(&self, draw_id: Uuid) -> Result<Vec<Prize>> {
        Ok(self
            .find_document(draw_id)
            .await?
            .map(|(_, doc)| doc.prizes.into_values().collect())
            .unwrap_or_default())
    }

    async fn list_draws(&self, lottery_key: &str) -> Result<Vec<Draw>> {
        let paths = self.document_paths(lottery_key).await?;
        self.remember(&paths).await;
        let mut draws = Vec::new();
        for path in paths {
            if let Some(doc) = Self::read_document(&path).await? {
                draws.push(doc.draw);
            }
        }
        Ok(draws)
    }

    async fn draws_for_date(&self, lottery_key: &str, date: NaiveDate) -> Result<Vec<Draw>> {
        let dir = self.root.join(lottery_key).join(date.to_string());
        let mut rd = match fs::read_dir(&dir).await {
            Ok(rd) => rd,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err).with_context(|| format!("listing {}", dir.display())),
        };
        let mut draws = Vec::new();
        while let Some(entry) = rd.next_entry().await? {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                if let Some(doc) = Self::read_document(&path).await? {
                    draws.push(doc.draw);
                }
            }
        }
        draws.sort_by(|a, b| a.composite_key.cmp(&b.composite_key));
        Ok(draws)
    }
}

#[derive(Debug, Default)]
pub struct MemoryDrawStore {
    docs: Mutex<HashMap<Uuid, DrawDocument>>,
}

impl MemoryDrawStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn draw_count(&self) -> usize {
        self.docs.lock().await.len()
    }
}

#[async_trait]
impl DrawStore for MemoryDrawStore {
    async fn get_draw(&self, id: Uuid) -> Result<Option<Draw>> {
        Ok(self.docs.lock().await.get(&id).map(|doc| doc.draw.clone()))
    }

    async fn upsert_draw(&self, draw: &Draw) -> Result<()> {
        let mut docs = self.docs.lock().await;
        docs.entry(draw.id)
            .and_modify(|doc| merge_draw(&mut doc.draw, draw))
            .or_insert_with(|| DrawDocument {
                draw: Draw {
                    prize_count: 0,
                    ..draw.clone()
                },
                prizes: BTreeMap::new(),
            });
        Ok(())
    }

    async fn upsert_prize(&self, draw_id: Uuid, prize: &Prize) -> Result<PrizeMerge> {
        let mut docs = self.docs.lock().await;
        let doc = docs
            .get_mut(&draw_id)
            .with_context(|| format!("draw {draw_id} not found"))?;
        let merge = merge_prize(&mut doc.prizes, prize);
        doc.draw.prize_count = doc.prizes.len() as u32;
        Ok(merge)
    }

    async fn list_prizes(&self, draw_id: Uuid) -> Result<Vec<Prize>> {
        Ok(self
            .docs
            .lock()
            .await
            .get(&draw_id)
            .map(|doc| doc.prizes.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn list_draws(&self, lottery_key: &str) -> Result<Vec<Draw>> {
        let mut draws: Vec<Draw> = self
            .docs
            .lock()
            .await
            .values()
            .filter(|doc| doc.draw.lottery_key == lottery_key)
            .map(|doc| doc.draw.clone())
            .collect();
        draws.sort_by(|a, b| a.composite_key.cmp(&b.composite_key));
        Ok(draws)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use drawcap_core::{deterministic_draw_id, draw_composite_key, HourBucket};
    use tempfile::tempdir;

    fn sample_draw(hour: &str, source: &str) -> Draw {
        let date = NaiveDate::from_ymd_opt(2025, 12, 29).unwrap();
        let bucket: HourBucket = hour.parse().unwrap();
        Draw {
            id: deterministic_draw_id("L", date, bucket, source),
            composite_key: draw_composite_key("L", date, bucket, source),
            lottery_key: "L".into(),
            date,
            hour_bucket: bucket,
            hour_bucket_raw: None,
            prize_count: 5,
            source: source.into(),
            imported_at: Utc.with_ymd_and_hms(2025, 12, 29, 14, 30, 0).unwrap(),
        }
    }

    async fn exercise_merge_semantics(store: &dyn DrawStore) {
        let draw = sample_draw("11:00", "primary");
        store.upsert_draw(&draw).await.unwrap();
        assert_eq!(store.get_draw(draw.id).await.unwrap().unwrap().prize_count, 0);

        let first = Prize::derive(1, "4321").unwrap();
        assert_eq!(store.upsert_prize(draw.id, &first).await.unwrap(), PrizeMerge::Inserted);
        assert_eq!(store.upsert_prize(draw.id, &first).await.unwrap(), PrizeMerge::Unchanged);

        let blank = Prize {
            raw_value: String::new(),
            ..first.clone()
        };
        assert_eq!(
            store.upsert_prize(draw.id, &blank).await.unwrap(),
            PrizeMerge::KeptExisting
        );
        let prizes = store.list_prizes(draw.id).await.unwrap();
        assert_eq!(prizes.len(), 1);
        assert_eq!(prizes[0].raw_value, "4321");

        let second = Prize::derive(2, "0057").unwrap();
        store.upsert_prize(draw.id, &second).await.unwrap();
        store.upsert_draw(&draw).await.unwrap();
        let stored = store.get_draw(draw.id).await.unwrap().unwrap();
        assert_eq!(stored.prize_count, 2);
        assert_eq!(store.prize_count(draw.id).await.unwrap(), 2);
        assert_eq!(store.list_draws("L").await.unwrap().len(), 1);
        assert!(store.list_draws("other").await.unwrap().is_empty());
        assert_eq!(
            store
                .draws_for_date("L", draw.date)
                .await
                .unwrap()
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn memory_store_merges_without_overwriting_with_empty() {
        exercise_merge_semantics(&MemoryDrawStore::new()).await;
    }

    #[tokio::test]
    async fn file_store_merges_without_overwriting_with_empty() {
        let dir = tempdir().expect("tempdir");
        exercise_merge_semantics(&FileDrawStore::new(dir.path())).await;
    }

    #[tokio::test]
    async fn file_store_resolves_ids_without_rescanning() {
        let dir = tempdir().expect("tempdir");
        let writer = FileDrawStore::new(dir.path());
        let draws = [sample_draw("09:00", "primary"), sample_draw("11:00", "mirror")];
        for draw in &draws {
            writer.upsert_draw(draw).await.unwrap();
        }
        assert_eq!(writer.indexed().await, 2);

        // A cold instance fills its index from one listing.
        let reader = FileDrawStore::new(dir.path());
        assert_eq!(reader.indexed().await, 0);
        assert_eq!(reader.list_draws("L").await.unwrap().len(), 2);
        assert_eq!(reader.indexed().await, 2);
        let found = reader.get_draw(draws[1].id).await.unwrap().unwrap();
        assert_eq!(found.source, "mirror");

        // A cold lookup by id also works and remembers what it walked past.
        let cold = FileDrawStore::new(dir.path());
        assert!(cold.get_draw(draws[0].id).await.unwrap().is_some());
        assert!(cold.indexed().await >= 1);
        assert!(cold.get_draw(Uuid::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn upsert_prize_requires_existing_draw() {
        let store = MemoryDrawStore::new();
        let prize = Prize::derive(1, "1234").unwrap();
        assert!(store.upsert_prize(Uuid::new_v4(), &prize).await.is_err());
    }

    #[tokio::test]
    async fn bounded_loader_preserves_input_order() {
        let store = Arc::new(MemoryDrawStore::new());
        let mut ids = Vec::new();
        for (hour, value) in [("09:00", "1111"), ("11:00", "2222"), ("14:00", "3333")] {
            let draw = sample_draw(hour, "primary");
            store.upsert_draw(&draw).await.unwrap();
            store
                .upsert_prize(draw.id, &Prize::derive(1, value).unwrap())
                .await
                .unwrap();
            ids.push(draw.id);
        }
        ids.reverse();

        let loaded = load_prizes_bounded(store, &ids, 2).await.unwrap();
        let values: Vec<_> = loaded
            .iter()
            .map(|(_, prizes)| prizes[0].raw_value.as_str())
            .collect();
        assert_eq!(values, vec!["3333", "2222", "1111"]);
    }

    #[tokio::test]
    async fn default_pool_width_loads_more_draws_than_it_runs_at_once() {
        let store = Arc::new(MemoryDrawStore::new());
        let mut ids = Vec::new();
        for h in 0..crate::DEFAULT_PRIZE_LOAD_CONCURRENCY + 2 {
            let draw = sample_draw(&format!("{h:02}:00"), "primary");
            store.upsert_draw(&draw).await.unwrap();
            let value = format!("{h:04}");
            store
                .upsert_prize(draw.id, &Prize::derive(1, &value).unwrap())
                .await
                .unwrap();
            ids.push(draw.id);
        }

        let loaded = crate::load_prizes_bounded(store, &ids, crate::DEFAULT_PRIZE_LOAD_CONCURRENCY)
            .await
            .unwrap();
        assert_eq!(loaded.len(), ids.len());
        assert!(loaded.iter().all(|(_, prizes)| prizes.len() == 1));
    }
}

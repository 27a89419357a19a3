//! Core domain model for scheduled draw capture.

use std::sync::RwLock;

use chrono::{DateTime, FixedOffset, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod hour;
pub mod prize;

pub use hour::{CloseTime, HourBucket, HourError};
pub use prize::{animal_label, group_for_ending, is_non_empty_prize, Prize, MAX_PRIZE_POSITIONS};

pub const CRATE_NAME: &str = "drawcap-core";

/// Expected moment a draw occurs. Not persisted on its own.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DrawSlot {
    pub lottery_key: String,
    pub date: NaiveDate,
    pub hour: HourBucket,
}

impl std::fmt::Display for DrawSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{} {}", self.lottery_key, self.date, self.hour)
    }
}

/// Persisted draw metadata. Prizes live in a child collection keyed by `id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Draw {
    pub id: Uuid,
    pub composite_key: String,
    pub lottery_key: String,
    pub date: NaiveDate,
    pub hour_bucket: HourBucket,
    pub hour_bucket_raw: Option<String>,
    pub prize_count: u32,
    pub source: String,
    pub imported_at: DateTime<Utc>,
}

pub fn draw_composite_key(
    lottery_key: &str,
    date: NaiveDate,
    hour_bucket: HourBucket,
    source_identifier: &str,
) -> String {
    format!("{lottery_key}:{date}:{hour_bucket}:{source_identifier}")
}

/// Deterministic draw id, stable across runs and hosts.
pub fn deterministic_draw_id(
    lottery_key: &str,
    date: NaiveDate,
    hour_bucket: HourBucket,
    source_identifier: &str,
) -> Uuid {
    let key = draw_composite_key(lottery_key, date, hour_bucket, source_identifier);
    Uuid::new_v5(&Uuid::NAMESPACE_OID, key.as_bytes())
}

/// Time source for everything that compares against "now" or "today".
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<FixedOffset>;

    fn today(&self) -> NaiveDate {
        self.now().date_naive()
    }

    fn offset(&self) -> FixedOffset {
        *self.now().offset()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    offset: FixedOffset,
}

impl SystemClock {
    pub fn new(offset: FixedOffset) -> Self {
        Self { offset }
    }

    pub fn from_offset_minutes(minutes: i32) -> Option<Self> {
        FixedOffset::east_opt(minutes.checked_mul(60)?).map(Self::new)
    }
}

impl Clock for SystemClock {
    fn now(&self) -> DateTime<FixedOffset> {
        Utc::now().with_timezone(&self.offset)
    }

    fn offset(&self) -> FixedOffset {
        self.offset
    }
}

/// Manually driven clock for tests and replays.
#[derive(Debug)]
pub struct FixedClock {
    at: RwLock<DateTime<FixedOffset>>,
}

impl FixedClock {
    pub fn new(at: DateTime<FixedOffset>) -> Self {
        Self { at: RwLock::new(at) }
    }

    pub fn set(&self, at: DateTime<FixedOffset>) {
        *self.at.write().unwrap_or_else(|e| e.into_inner()) = at;
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<FixedOffset> {
        *self.at.read().unwrap_or_else(|e| e.into_inner())
    }
}

//! Durable per-day capture progress, one record per slot hour.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, NaiveDate, Utc};
use drawcap_core::HourBucket;
use drawcap_storage::state::{load_json, save_json};
use drawcap_storage::StateStore;
use serde::{Deserialize, Serialize};

use crate::classifier::Tier;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasonCode {
    Captured,
    AlreadyComplete,
    NoDrawSignal,
    NotApplicableRare,
    NotApplicableAbsent,
    DayClosed,
    NoMatchingRecord,
    UpstreamTransient,
    UpstreamError,
    MalformedPayload,
    ValidationError,
    OneShotFinal,
}

impl ReasonCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReasonCode::Captured => "captured",
            ReasonCode::AlreadyComplete => "already_complete",
            ReasonCode::NoDrawSignal => "no_draw_signal",
            ReasonCode::NotApplicableRare => "not_applicable_rare",
            ReasonCode::NotApplicableAbsent => "not_applicable_absent",
            ReasonCode::DayClosed => "day_closed",
            ReasonCode::NoMatchingRecord => "no_matching_record",
            ReasonCode::UpstreamTransient => "upstream_transient",
            ReasonCode::UpstreamError => "upstream_error",
            ReasonCode::MalformedPayload => "malformed_payload",
            ReasonCode::ValidationError => "validation_error",
            ReasonCode::OneShotFinal => "one_shot_final",
        }
    }

    /// Maps an ingestion error code back onto the recorded vocabulary.
    pub fn from_error_code(code: &str) -> Self {
        match code {
            "upstream_transient" => ReasonCode::UpstreamTransient,
            "malformed_payload" => ReasonCode::MalformedPayload,
            "validation_error" => ReasonCode::ValidationError,
            _ => ReasonCode::UpstreamError,
        }
    }
}

impl fmt::Display for ReasonCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotResult {
    pub reason: ReasonCode,
    pub detail: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotState {
    pub done: bool,
    pub tries: u32,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub last_result: Option<SlotResult>,
    pub not_applicable: bool,
    pub not_applicable_reason: Option<ReasonCode>,
    #[serde(default)]
    pub last_tried_variants: Vec<String>,
    #[serde(default)]
    pub tier: Option<Tier>,
}

impl SlotState {
    pub fn is_pending(&self) -> bool {
        !self.done
    }

    /// Closes the slot without an attempt. No-op once the slot is done.
    pub fn mark_not_applicable(&mut self, reason: ReasonCode, detail: impl Into<String>) -> bool {
        if self.done {
            return false;
        }
        self.done = true;
        self.not_applicable = true;
        self.not_applicable_reason = Some(reason);
        self.last_result = Some(SlotResult {
            reason,
            detail: detail.into(),
        });
        true
    }

    /// Closes the slot as satisfied without counting an attempt, e.g. when
    /// the store already holds its prizes.
    pub fn close(&mut self, reason: ReasonCode, detail: impl Into<String>) -> bool {
        if self.done {
            return false;
        }
        self.done = true;
        self.last_result = Some(SlotResult {
            reason,
            detail: detail.into(),
        });
        true
    }

    /// Records one attempt. `terminal` closes the slot; a slot already done
    /// is never reopened or counted again.
    pub fn record_attempt(
        &mut self,
        at: DateTime<Utc>,
        variants: Vec<String>,
        reason: ReasonCode,
        detail: impl Into<String>,
        terminal: bool,
    ) -> bool {
        if self.done {
            return false;
        }
        self.tries += 1;
        self.last_attempt_at = Some(at);
        self.last_tried_variants = variants;
        self.last_result = Some(SlotResult {
            reason,
            detail: detail.into(),
        });
        if terminal {
            self.done = true;
            if reason == ReasonCode::NoDrawSignal {
                self.not_applicable = true;
                self.not_applicable_reason = Some(reason);
            }
        }
        true
    }

    pub fn last_reason(&self) -> Option<ReasonCode> {
        self.last_result.as_ref().map(|r| r.reason)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DayState {
    pub lottery_key: String,
    pub date: NaiveDate,
    pub updated_at: Option<DateTime<Utc>>,
    pub slots: BTreeMap<HourBucket, SlotState>,
}

impl DayState {
    pub fn new(lottery_key: &str, date: NaiveDate) -> Self {
        Self {
            lottery_key: lottery_key.to_string(),
            date,
            updated_at: None,
            slots: BTreeMap::new(),
        }
    }

    pub fn key_for(lottery_key: &str, date: NaiveDate) -> String {
        format!("state/{lottery_key}/{date}")
    }

    pub fn slot(&self, hour: HourBucket) -> Option<&SlotState> {
        self.slots.get(&hour)
    }

    pub fn slot_mut(&mut self, hour: HourBucket) -> &mut SlotState {
        self.slots.entry(hour).or_default()
    }

    pub fn ensure_slots(&mut self, hours: &[HourBucket]) {
        for hour in hours {
            self.slots.entry(*hour).or_default();
        }
    }

    pub fn pending_count(&self) -> usize {
        self.slots.values().filter(|s| s.is_pending()).count()
    }
}

/// Loads and saves [`DayState`] records through a [`StateStore`].
#[derive(Clone)]
pub struct ScheduleStateRepo {
    store: Arc<dyn StateStore>,
}

impl ScheduleStateRepo {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }

    /// Existing state for the day, or a fresh empty record.
    pub async fn load(&self, lottery_key: &str, date: NaiveDate) -> Result<DayState> {
        let key = DayState::key_for(lottery_key, date);
        Ok(load_json(self.store.as_ref(), &key)
            .await?
            .unwrap_or_else(|| DayState::new(lottery_key, date)))
    }

    pub async fn save(&self, state: &mut DayState, now: DateTime<Utc>) -> Result<()> {
        state.updated_at = Some(now);
        let key = DayState::key_for(&state.lottery_key, state.date);
        save_json(self.store.as_ref(), &key, state).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use drawcap_storage::FileStateStore;

    fn hour(text: &str) -> HourBucket {
        text.parse().unwrap()
    }

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 12, 29, h, m, 0).unwrap()
    }

    #[test]
    fn done_is_terminal() {
        let mut slot = SlotState::default();
        assert!(slot.record_attempt(
            at(14, 30),
            vec!["11:00".into()],
            ReasonCode::UpstreamTransient,
            "timeout",
            false
        ));
        assert!(slot.is_pending());
        assert!(slot.record_attempt(at(14, 35), vec![], ReasonCode::Captured, "1 draw", true));
        assert!(!slot.record_attempt(at(14, 40), vec![], ReasonCode::UpstreamError, "late", false));
        assert!(!slot.mark_not_applicable(ReasonCode::DayClosed, "holiday"));
        assert_eq!(slot.tries, 2);
        assert_eq!(slot.last_reason(), Some(ReasonCode::Captured));
        assert!(!slot.not_applicable);
    }

    #[test]
    fn no_draw_signal_closes_as_not_applicable() {
        let mut slot = SlotState::default();
        slot.record_attempt(at(14, 30), vec![], ReasonCode::NoDrawSignal, "no draw", true);
        assert!(slot.done && slot.not_applicable);
        assert_eq!(slot.not_applicable_reason, Some(ReasonCode::NoDrawSignal));
    }

    #[test]
    fn reason_codes_serialize_as_snake_case() {
        let text = serde_json::to_string(&ReasonCode::NotApplicableRare).unwrap();
        assert_eq!(text, "\"not_applicable_rare\"");
        assert_eq!(ReasonCode::OneShotFinal.to_string(), "one_shot_final");
        assert_eq!(ReasonCode::from_error_code("malformed_payload"), ReasonCode::MalformedPayload);
    }

    #[tokio::test]
    async fn repo_persists_day_state() {
        let dir = tempfile::tempdir().expect("tempdir");
        let repo = ScheduleStateRepo::new(Arc::new(FileStateStore::new(dir.path())));
        let date = NaiveDate::from_ymd_opt(2025, 12, 29).unwrap();

        let mut day = repo.load("L", date).await.unwrap();
        assert!(day.slots.is_empty());
        day.ensure_slots(&[hour("09:00"), hour("11:00")]);
        day.slot_mut(hour("09:00"))
            .mark_not_applicable(ReasonCode::NotApplicableRare, "rare on Mon");
        repo.save(&mut day, at(15, 0)).await.unwrap();

        let reloaded = repo.load("L", date).await.unwrap();
        assert_eq!(reloaded, day);
        assert_eq!(reloaded.pending_count(), 1);
        assert!(dir.path().join("state/L/2025-12-29.json").exists());
    }
}

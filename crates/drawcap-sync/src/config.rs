//! Environment settings and the typed per-lottery schedule file.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{NaiveDate, NaiveTime, Weekday};
use drawcap_core::HourBucket;
use serde::{Deserialize, Serialize};

use crate::PipelineError;

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub workspace_root: PathBuf,
    pub schedule_path: PathBuf,
    pub state_dir: PathBuf,
    pub data_dir: PathBuf,
    pub artifacts_dir: PathBuf,
    pub reports_dir: PathBuf,
    pub fixtures_dir: PathBuf,
    pub provider_url: Option<String>,
    pub database_url: Option<String>,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub tz_offset_minutes: i32,
    pub watch_cron: String,
}

fn env_path(name: &str, root: &Path, default: &str) -> PathBuf {
    std::env::var(name)
        .map(PathBuf::from)
        .unwrap_or_else(|_| root.join(default))
}

impl SyncConfig {
    pub fn from_env() -> Self {
        let workspace_root = std::env::var("DRAWCAP_WORKSPACE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("."));
        Self {
            schedule_path: env_path("DRAWCAP_SCHEDULE", &workspace_root, "schedule.yaml"),
            state_dir: env_path("DRAWCAP_STATE_DIR", &workspace_root, "state"),
            data_dir: env_path("DRAWCAP_DATA_DIR", &workspace_root, "data"),
            artifacts_dir: env_path("DRAWCAP_ARTIFACTS_DIR", &workspace_root, "artifacts"),
            reports_dir: env_path("DRAWCAP_REPORTS_DIR", &workspace_root, "reports"),
            fixtures_dir: env_path("DRAWCAP_FIXTURES_DIR", &workspace_root, "fixtures"),
            provider_url: std::env::var("DRAWCAP_PROVIDER_URL")
                .ok()
                .filter(|v| !v.trim().is_empty()),
            database_url: std::env::var("DATABASE_URL")
                .ok()
                .filter(|v| !v.trim().is_empty()),
            user_agent: std::env::var("DRAWCAP_USER_AGENT")
                .unwrap_or_else(|_| "drawcap/0.1".to_string()),
            http_timeout_secs: std::env::var("DRAWCAP_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
            tz_offset_minutes: std::env::var("DRAWCAP_TZ_OFFSET_MINUTES")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(-180),
            watch_cron: std::env::var("DRAWCAP_WATCH_CRON")
                .unwrap_or_else(|_| "0 */5 * * * *".to_string()),
            workspace_root,
        }
    }
}

mod hhmm {
    use chrono::NaiveTime;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(time: &NaiveTime, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(&time.format("%H:%M"))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<NaiveTime, D::Error> {
        let text = String::deserialize(deserializer)?;
        NaiveTime::parse_from_str(text.trim(), "%H:%M").map_err(serde::de::Error::custom)
    }
}

/// One scheduled draw hour and its capture window on the draw date.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotConfig {
    pub hour: HourBucket,
    #[serde(with = "hhmm")]
    pub window_start: NaiveTime,
    #[serde(with = "hhmm")]
    pub release: NaiveTime,
    #[serde(with = "hhmm")]
    pub window_end: NaiveTime,
}

/// Slot that gets exactly one attempt at `hour + offset_minutes`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OneShotRule {
    pub hour: HourBucket,
    /// Empty means every weekday.
    #[serde(default)]
    pub weekdays: Vec<Weekday>,
    pub offset_minutes: i64,
    #[serde(default)]
    pub tolerance_minutes: i64,
}

/// Hour that only counts on `weekdays` from `active_from` onwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConditionalHour {
    pub hour: HourBucket,
    #[serde(default)]
    pub weekdays: Vec<Weekday>,
    pub active_from: NaiveDate,
}

impl ConditionalHour {
    pub fn applies_to(&self, weekday: Weekday) -> bool {
        self.weekdays.is_empty() || self.weekdays.contains(&weekday)
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LotteryConfig {
    pub display_name: String,
    #[serde(default)]
    pub source_ids: Vec<String>,
    #[serde(default)]
    pub minute_jitter_tolerance: u8,
    pub slots: Vec<SlotConfig>,
    #[serde(default)]
    pub one_shot: Vec<OneShotRule>,
    #[serde(default)]
    pub conditional_hours: Vec<ConditionalHour>,
    #[serde(default)]
    pub closed_dates: Vec<NaiveDate>,
    #[serde(default = "default_true")]
    pub avoid_rewrites: bool,
}

impl LotteryConfig {
    pub fn candidate_hours(&self) -> Vec<HourBucket> {
        self.slots.iter().map(|s| s.hour).collect()
    }

    pub fn slot(&self, hour: HourBucket) -> Option<&SlotConfig> {
        self.slots.iter().find(|s| s.hour == hour)
    }

    pub fn one_shot_for(&self, hour: HourBucket, weekday: Weekday) -> Option<&OneShotRule> {
        self.one_shot
            .iter()
            .find(|r| r.hour == hour && (r.weekdays.is_empty() || r.weekdays.contains(&weekday)))
    }

    pub fn conditional_for(&self, hour: HourBucket, weekday: Weekday) -> Option<&ConditionalHour> {
        self.conditional_hours
            .iter()
            .find(|c| c.hour == hour && c.applies_to(weekday))
    }

    fn validate(&self, key: &str) -> Result<(), PipelineError> {
        if self.slots.is_empty() {
            return Err(PipelineError::Validation(format!("lottery {key} has no slots")));
        }
        if self.minute_jitter_tolerance > 29 {
            return Err(PipelineError::Validation(format!(
                "lottery {key}: minute_jitter_tolerance must be below 30"
            )));
        }
        let mut seen = BTreeSet::new();
        for slot in &self.slots {
            if !seen.insert(slot.hour) {
                return Err(PipelineError::Validation(format!(
                    "lottery {key}: duplicate slot {}",
                    slot.hour
                )));
            }
            if !(slot.window_start <= slot.release && slot.release <= slot.window_end) {
                return Err(PipelineError::Validation(format!(
                    "lottery {key}: slot {} needs window_start <= release <= window_end",
                    slot.hour
                )));
            }
        }
        for rule in &self.one_shot {
            if !seen.contains(&rule.hour) {
                return Err(PipelineError::Validation(format!(
                    "lottery {key}: one-shot rule for unscheduled hour {}",
                    rule.hour
                )));
            }
            if rule.tolerance_minutes < 0 {
                return Err(PipelineError::Validation(format!(
                    "lottery {key}: negative one-shot tolerance for {}",
                    rule.hour
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleFile {
    pub lotteries: BTreeMap<String, LotteryConfig>,
}

impl ScheduleFile {
    pub fn from_yaml(text: &str) -> Result<Self, PipelineError> {
        let file: ScheduleFile = serde_yaml::from_str(text)
            .map_err(|e| PipelineError::Validation(format!("schedule file: {e}")))?;
        file.validate()?;
        Ok(file)
    }

    pub fn load(path: &Path) -> Result<Self, PipelineError> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml(&text)
    }

    pub fn validate(&self) -> Result<(), PipelineError> {
        for (key, lottery) in &self.lotteries {
            if key.trim().is_empty() || key.contains('/') {
                return Err(PipelineError::Validation(format!("bad lottery key {key:?}")));
            }
            lottery.validate(key)?;
        }
        Ok(())
    }

    pub fn lottery(&self, key: &str) -> Result<&LotteryConfig, PipelineError> {
        self.lotteries
            .get(key)
            .ok_or_else(|| PipelineError::UnknownLottery(key.to_string()))
    }

    /// Keys selected by an optional `--lottery` filter.
    pub fn select(&self, filter: Option<&str>) -> Result<Vec<String>, PipelineError> {
        match filter {
            Some(key) => self.lottery(key).map(|_| vec![key.to_string()]),
            None => Ok(self.lotteries.keys().cloned().collect()),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) const SAMPLE: &str = r#"
lotteries:
  L:
    display_name: Sample
    source_ids: [primary]
    minute_jitter_tolerance: 2
    slots:
      - { hour: "09:00", window_start: "09:05", release: "09:29", window_end: "09:31" }
      - { hour: "11:00", window_start: "11:05", release: "11:29", window_end: "11:31" }
      - { hour: "21:00", window_start: "21:05", release: "21:29", window_end: "21:31" }
    one_shot:
      - { hour: "21:00", weekdays: [Wed, Sat], offset_minutes: 20, tolerance_minutes: 5 }
    conditional_hours:
      - { hour: "09:00", weekdays: [Mon], active_from: "2025-06-02" }
    closed_dates: ["2025-12-25"]
"#;

    #[test]
    fn parses_sample_schedule() {
        let file = ScheduleFile::from_yaml(SAMPLE).unwrap();
        let lottery = file.lottery("L").unwrap();
        assert_eq!(lottery.slots.len(), 3);
        assert!(lottery.avoid_rewrites);
        assert_eq!(
            lottery.slots[1].release,
            NaiveTime::from_hms_opt(11, 29, 0).unwrap()
        );
        let hour: HourBucket = "21:00".parse().unwrap();
        assert!(lottery.one_shot_for(hour, Weekday::Wed).is_some());
        assert!(lottery.one_shot_for(hour, Weekday::Mon).is_none());
        assert!(matches!(
            file.lottery("nope"),
            Err(PipelineError::UnknownLottery(_))
        ));
        assert_eq!(file.select(None).unwrap(), vec!["L".to_string()]);
    }

    #[test]
    fn bundled_schedule_is_valid() {
        let file = ScheduleFile::from_yaml(include_str!("../../../schedule.yaml")).unwrap();
        let demo = file.lottery("demo").unwrap();
        assert_eq!(demo.source_ids, vec!["primary", "mirror"]);
        assert!(demo.conditional_for("09:00".parse().unwrap(), Weekday::Mon).is_some());
    }

    #[test]
    fn rejects_inverted_windows() {
        let bad = SAMPLE.replace(
            r#"window_start: "11:05", release: "11:29""#,
            r#"window_start: "11:35", release: "11:29""#,
        );
        assert!(matches!(
            ScheduleFile::from_yaml(&bad),
            Err(PipelineError::Validation(_))
        ));
    }

    #[test]
    fn rejects_one_shot_for_unscheduled_hour() {
        let bad = SAMPLE.replace(
            r#"- { hour: "21:00", weekdays"#,
            r#"- { hour: "22:00", weekdays"#,
        );
        assert!(ScheduleFile::from_yaml(&bad).is_err());
    }

    #[test]
    fn rejects_malformed_hours() {
        let bad = SAMPLE.replace(r#"hour: "11:00""#, r#"hour: "11:30""#);
        assert!(matches!(
            ScheduleFile::from_yaml(&bad),
            Err(PipelineError::Validation(_))
        ));
    }
}

//! Missed-capture audit over the day's schedule state.

use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use drawcap_core::HourBucket;
use drawcap_storage::write_atomic;
use serde::{Deserialize, Serialize};

use crate::classifier::Tier;
use crate::config::LotteryConfig;
use crate::state::{DayState, ReasonCode};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuditThresholds {
    pub warning_minutes: i64,
    pub critical_minutes: i64,
}

impl Default for AuditThresholds {
    fn default() -> Self {
        Self {
            warning_minutes: 20,
            critical_minutes: 60,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditStatus {
    Ok,
    Warning,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SlotFinding {
    pub hour: HourBucket,
    pub release: String,
    pub elapsed_minutes: i64,
    pub tier: Option<Tier>,
    pub tries: u32,
    pub last_result: Option<ReasonCode>,
    pub detail: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditReport {
    pub lottery: String,
    pub date: NaiveDate,
    pub generated_at: DateTime<Utc>,
    pub status: AuditStatus,
    pub critical_count: usize,
    pub warning_count: usize,
    pub critical: Vec<SlotFinding>,
    pub warning: Vec<SlotFinding>,
}

impl AuditReport {
    pub fn is_critical(&self) -> bool {
        self.status == AuditStatus::Critical
    }
}

/// Classifies every applicable, unfinished slot past its release by the
/// minutes elapsed since release. OPTIONAL slots never escalate past
/// warning. Slots missing from the state count as pending.
pub fn audit_day(
    lottery_key: &str,
    lottery: &LotteryConfig,
    state: &DayState,
    now_local: NaiveDateTime,
    generated_at: DateTime<Utc>,
    thresholds: AuditThresholds,
) -> AuditReport {
    let mut critical = Vec::new();
    let mut warning = Vec::new();

    for slot in &lottery.slots {
        let entry = state.slot(slot.hour);
        if entry.is_some_and(|s| s.done) {
            continue;
        }
        let release = state.date.and_time(slot.release);
        if now_local <= release {
            continue;
        }
        let elapsed = (now_local - release).num_minutes();
        let tier = entry.and_then(|s| s.tier);
        let finding = SlotFinding {
            hour: slot.hour,
            release: slot.release.format("%H:%M").to_string(),
            elapsed_minutes: elapsed,
            tier,
            tries: entry.map_or(0, |s| s.tries),
            last_result: entry.and_then(|s| s.last_reason()),
            detail: entry
                .and_then(|s| s.last_result.as_ref())
                .map(|r| r.detail.clone()),
        };

        let severity = if elapsed >= thresholds.critical_minutes {
            AuditStatus::Critical
        } else if elapsed >= thresholds.warning_minutes {
            AuditStatus::Warning
        } else {
            AuditStatus::Ok
        };
        let severity = if tier == Some(Tier::Optional) {
            severity.min(AuditStatus::Warning)
        } else {
            severity
        };
        match severity {
            AuditStatus::Critical => critical.push(finding),
            AuditStatus::Warning => warning.push(finding),
            AuditStatus::Ok => {}
        }
    }

    let status = if !critical.is_empty() {
        AuditStatus::Critical
    } else if !warning.is_empty() {
        AuditStatus::Warning
    } else {
        AuditStatus::Ok
    };
    AuditReport {
        lottery: lottery_key.to_string(),
        date: state.date,
        generated_at,
        status,
        critical_count: critical.len(),
        warning_count: warning.len(),
        critical,
        warning,
    }
}

pub fn report_path(reports_dir: &Path, report: &AuditReport) -> PathBuf {
    reports_dir
        .join(report.date.to_string())
        .join(format!("audit-{}.json", report.lottery))
}

/// Writes `<reports_dir>/<date>/audit-<lottery>.json` through a temp file
/// and rename, replacing any earlier report for the same day.
pub async fn write_report(reports_dir: &Path, report: &AuditReport) -> anyhow::Result<PathBuf> {
    let path = report_path(reports_dir, report);
    let body = serde_json::to_vec_pretty(report).context("serializing audit report")?;
    write_atomic(&path, &body)
        .await
        .with_context(|| format!("writing audit report {}", path.display()))?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::SAMPLE;
    use crate::config::ScheduleFile;
    use chrono::{NaiveTime, TimeZone};

    fn hour(text: &str) -> HourBucket {
        text.parse().unwrap()
    }

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 12, 29).unwrap()
    }

    fn now(h: u32, m: u32) -> NaiveDateTime {
        date().and_time(NaiveTime::from_hms_opt(h, m, 0).unwrap())
    }

    fn generated() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 12, 29, 15, 0, 0).unwrap()
    }

    fn state() -> DayState {
        let mut state = DayState::new("L", date());
        state
            .slot_mut(hour("09:00"))
            .mark_not_applicable(ReasonCode::NotApplicableRare, "rare");
        state
    }

    #[test]
    fn ok_before_release_and_warning_then_critical_after() {
        let file = ScheduleFile::from_yaml(SAMPLE).unwrap();
        let lottery = file.lottery("L").unwrap();
        let thresholds = AuditThresholds::default();

        let early = audit_day("L", lottery, &state(), now(11, 20), generated(), thresholds);
        assert_eq!(early.status, AuditStatus::Ok);

        let warn = audit_day("L", lottery, &state(), now(11, 55), generated(), thresholds);
        assert_eq!(warn.status, AuditStatus::Warning);
        assert_eq!(warn.warning_count, 1);
        assert_eq!(warn.warning[0].hour, hour("11:00"));
        assert_eq!(warn.warning[0].elapsed_minutes, 26);

        let late = audit_day("L", lottery, &state(), now(12, 30), generated(), thresholds);
        assert_eq!(late.status, AuditStatus::Critical);
        assert_eq!(late.critical_count, 1);
        assert!(late.is_critical());
    }

    #[test]
    fn done_slots_are_never_reported_and_optional_caps_at_warning() {
        let file = ScheduleFile::from_yaml(SAMPLE).unwrap();
        let lottery = file.lottery("L").unwrap();
        let thresholds = AuditThresholds::default();
        let mut state = state();
        state.slot_mut(hour("11:00")).tier = Some(Tier::Optional);

        let report = audit_day("L", lottery, &state, now(23, 59), generated(), thresholds);
        assert_eq!(report.warning.len(), 1);
        assert_eq!(report.warning[0].hour, hour("11:00"));
        assert_eq!(report.critical.len(), 1);
        assert_eq!(report.critical[0].hour, hour("21:00"));

        state.slot_mut(hour("21:00")).close(ReasonCode::Captured, "done");
        let report = audit_day("L", lottery, &state, now(23, 59), generated(), thresholds);
        assert_eq!(report.status, AuditStatus::Warning);
    }

    #[tokio::test]
    async fn report_lands_under_date_directory_in_camel_case() {
        let file = ScheduleFile::from_yaml(SAMPLE).unwrap();
        let lottery = file.lottery("L").unwrap();
        let thresholds = AuditThresholds::default();
        let report = audit_day("L", lottery, &state(), now(12, 30), generated(), thresholds);
        let dir = tempfile::tempdir().expect("tempdir");
        let path = write_report(dir.path(), &report).await.unwrap();
        assert!(path.ends_with("2025-12-29/audit-L.json"));
        let bytes = std::fs::read(&path).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["status"], "critical");
        assert_eq!(value["criticalCount"], 1);
        assert_eq!(value["critical"][0]["hour"], "11:00");
    }

    #[tokio::test]
    async fn rewriting_a_report_replaces_it_without_leftovers() {
        let file = ScheduleFile::from_yaml(SAMPLE).unwrap();
        let lottery = file.lottery("L").unwrap();
        let thresholds = AuditThresholds::default();
        let dir = tempfile::tempdir().expect("tempdir");

        let late = audit_day("L", lottery, &state(), now(12, 30), generated(), thresholds);
        write_report(dir.path(), &late).await.unwrap();
        let early = audit_day("L", lottery, &state(), now(11, 20), generated(), thresholds);
        let path = write_report(dir.path(), &early).await.unwrap();

        let bytes = std::fs::read(&path).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["status"], "ok");
        let entries = std::fs::read_dir(path.parent().unwrap()).unwrap().count();
        assert_eq!(entries, 1);
    }
}

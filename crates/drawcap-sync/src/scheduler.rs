//! One capture run for one lottery and date: tier filtering, day-status
//! close-out, window/catch-up/one-shot planning, and state updates.

use std::sync::Arc;

use chrono::{
    DateTime, Datelike, Duration, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime, Utc,
};
use drawcap_adapters::{DayStatus, IngestionClient, MergedFetch, UpstreamProvider};
use drawcap_core::{Clock, HourBucket};
use drawcap_storage::state::{load_json, save_json};
use drawcap_storage::{
    load_prizes_bounded, DrawStore, RunLock, StateStore, DEFAULT_PRIZE_LOAD_CONCURRENCY,
};
use serde::Serialize;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::classifier::{CalendarClassifier, CalendarRule, CalendarTable, Tier};
use crate::config::{LotteryConfig, OneShotRule, ScheduleFile, SlotConfig};
use crate::importer::{ImportOptions, ImportVerdict, Importer};
use crate::state::{DayState, ReasonCode, ScheduleStateRepo};
use crate::PipelineError;

pub const DEFAULT_LOCK_TTL_SECS: i64 = 600;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunRequest {
    pub lottery_key: String,
    /// Defaults to today in the clock's timezone.
    pub date: Option<NaiveDate>,
    pub lock_ttl: Duration,
}

impl RunRequest {
    pub fn new(lottery_key: impl Into<String>) -> Self {
        Self {
            lottery_key: lottery_key.into(),
            date: None,
            lock_ttl: Duration::seconds(DEFAULT_LOCK_TTL_SECS),
        }
    }

    pub fn for_date(mut self, date: NaiveDate) -> Self {
        self.date = Some(date);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Completed,
    /// Another run holds the lottery's lock; nothing was touched.
    LockContended,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub lottery: String,
    pub date: NaiveDate,
    pub attempted: usize,
    pub captured: usize,
    pub not_applicable: usize,
    pub pending: usize,
    pub outcome: RunOutcome,
}

/// What a pending slot should do right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotPlan {
    NotYet,
    Window,
    CatchUp,
    OneShot,
}

impl SlotPlan {
    pub fn is_due(&self) -> bool {
        !matches!(self, SlotPlan::NotYet)
    }
}

/// Local wall-clock instant of `time` on `date`.
fn at(date: NaiveDate, time: NaiveTime) -> NaiveDateTime {
    date.and_time(time)
}

/// Decides whether a slot is attempted at `now` (local time). One-shot
/// slots ignore the window and fire once `hour + offset - tolerance` has
/// passed. Regular slots fire inside the window, or as catch-up once the
/// window has closed.
pub fn plan_slot(
    slot: &SlotConfig,
    one_shot: Option<&OneShotRule>,
    date: NaiveDate,
    now: NaiveDateTime,
) -> SlotPlan {
    if let Some(rule) = one_shot {
        let hour_start =
            at(date, NaiveTime::default()) + Duration::hours(i64::from(slot.hour.hour()));
        let due = hour_start + Duration::minutes(rule.offset_minutes - rule.tolerance_minutes);
        return if now >= due {
            SlotPlan::OneShot
        } else {
            SlotPlan::NotYet
        };
    }
    let start = at(date, slot.window_start);
    let end = at(date, slot.window_end);
    if now >= start && now <= end {
        SlotPlan::Window
    } else if now > end && now > at(date, slot.release) {
        SlotPlan::CatchUp
    } else {
        SlotPlan::NotYet
    }
}

type CachedFetch = Result<MergedFetch, (ReasonCode, String)>;

pub struct Scheduler {
    schedule: Arc<ScheduleFile>,
    store: Arc<dyn DrawStore>,
    states: ScheduleStateRepo,
    provider: Arc<dyn UpstreamProvider>,
    clock: Arc<dyn Clock>,
    classifier: CalendarClassifier,
}

impl Scheduler {
    pub fn new(
        schedule: Arc<ScheduleFile>,
        store: Arc<dyn DrawStore>,
        state_store: Arc<dyn StateStore>,
        provider: Arc<dyn UpstreamProvider>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            schedule,
            store,
            states: ScheduleStateRepo::new(state_store),
            provider,
            clock,
            classifier: CalendarClassifier::default(),
        }
    }

    pub fn with_classifier(mut self, classifier: CalendarClassifier) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn schedule(&self) -> &ScheduleFile {
        &self.schedule
    }

    pub fn states(&self) -> &ScheduleStateRepo {
        &self.states
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Rejects dates after today before any I/O happens.
    fn guard_date(&self, requested: Option<NaiveDate>) -> Result<NaiveDate, PipelineError> {
        let today = self.clock.today();
        let date = requested.unwrap_or(today);
        if date > today {
            return Err(PipelineError::FutureDate {
                requested: date,
                today,
            });
        }
        Ok(date)
    }

    async fn acquire_lock(
        &self,
        lottery_key: &str,
        ttl: Duration,
    ) -> Result<Option<RunLock>, PipelineError> {
        let now = self.clock.now().with_timezone(&Utc);
        Ok(RunLock::acquire(Arc::clone(self.states.store()), lottery_key, ttl, now).await?)
    }

    async fn release_lock(lock: RunLock) {
        if let Err(err) = lock.release().await {
            warn!(error = %err, "failed to release run lock");
        }
    }

    pub async fn run(&self, request: &RunRequest) -> Result<RunSummary, PipelineError> {
        let date = self.guard_date(request.date)?;
        let lottery = self.schedule.lottery(&request.lottery_key)?;
        let run_id = Uuid::new_v4();

        let Some(lock) = self.acquire_lock(&request.lottery_key, request.lock_ttl).await? else {
            info!(lottery = %request.lottery_key, %date, "another run holds the lock; skipping");
            return Ok(RunSummary {
                run_id,
                lottery: request.lottery_key.clone(),
                date,
                attempted: 0,
                captured: 0,
                not_applicable: 0,
                pending: 0,
                outcome: RunOutcome::LockContended,
            });
        };

        let span = info_span!("run", %run_id, lottery = %request.lottery_key, %date);
        let result = self
            .run_locked(run_id, &request.lottery_key, lottery, date)
            .instrument(span)
            .await;
        Self::release_lock(lock).await;
        result
    }

    async fn run_locked(
        &self,
        run_id: Uuid,
        lottery_key: &str,
        lottery: &LotteryConfig,
        date: NaiveDate,
    ) -> Result<RunSummary, PipelineError> {
        let calendar = self.load_calendar(lottery_key, lottery).await?;
        let hours = lottery.candidate_hours();
        let rule = calendar
            .rule_for(date)
            .unwrap_or_else(|| CalendarRule::fallback(lottery_key, date, &hours));
        let weekday = date.weekday();

        let mut state = self.states.load(lottery_key, date).await?;
        state.ensure_slots(&hours);
        let mut summary = RunSummary {
            run_id,
            lottery: lottery_key.to_string(),
            date,
            attempted: 0,
            captured: 0,
            not_applicable: 0,
            pending: 0,
            outcome: RunOutcome::Completed,
        };

        // Tier filtering: no network for RARE or unknown hours.
        let mut changed = false;
        for slot in &lottery.slots {
            let entry = state.slot_mut(slot.hour);
            if entry.done {
                continue;
            }
            let tier = rule.tier(slot.hour);
            entry.tier = tier;
            let before_cutover = lottery
                .conditional_for(slot.hour, weekday)
                .filter(|c| date < c.active_from);
            let closed = match (tier, before_cutover) {
                (_, Some(c)) => entry.mark_not_applicable(
                    ReasonCode::NotApplicableAbsent,
                    format!("hour only counts from {}", c.active_from),
                ),
                (Some(Tier::Rare), None) => entry.mark_not_applicable(
                    ReasonCode::NotApplicableRare,
                    format!("rare on {weekday} ({:?})", rule.provenance),
                ),
                (None, None) => entry.mark_not_applicable(
                    ReasonCode::NotApplicableAbsent,
                    format!("not in the {weekday} calendar"),
                ),
                _ => false,
            };
            if closed {
                debug!(hour = %slot.hour, "slot not applicable");
                changed = true;
            }
        }
        if changed {
            self.save_state(&mut state).await?;
        }

        let now = self.clock.now().naive_local();
        let plans: Vec<(&SlotConfig, SlotPlan)> = lottery
            .slots
            .iter()
            .filter(|slot| state.slot(slot.hour).is_some_and(|s| s.is_pending()))
            .map(|slot| {
                let rule = lottery.one_shot_for(slot.hour, weekday);
                (slot, plan_slot(slot, rule, date, now))
            })
            .collect();

        if plans.iter().any(|(_, plan)| plan.is_due()) {
            if let Some(reason) = self.day_closed(lottery_key, lottery, date).await {
                info!(%reason, "day closed; closing pending slots");
                for (slot, _) in &plans {
                    state
                        .slot_mut(slot.hour)
                        .mark_not_applicable(ReasonCode::DayClosed, reason.clone());
                }
                self.save_state(&mut state).await?;
                return Ok(self.finish(summary, &state));
            }
        }

        let client =
            IngestionClient::new(Arc::clone(&self.provider), lottery.minute_jitter_tolerance);
        let importer = Importer::new(Arc::clone(&self.store), Arc::clone(&self.clock));
        let mut cache: Option<CachedFetch> = None;

        for (slot, plan) in plans {
            if !plan.is_due() {
                continue;
            }
            if self.already_captured(lottery_key, date, slot.hour).await? {
                state
                    .slot_mut(slot.hour)
                    .close(ReasonCode::AlreadyComplete, "store already holds prizes");
                self.save_state(&mut state).await?;
                info!(hour = %slot.hour, outcome = "already_complete", "slot satisfied from store");
                continue;
            }

            summary.attempted += 1;
            let candidates = slot.hour.candidates(lottery.minute_jitter_tolerance);
            let fetched = match &cache {
                Some(cached) => cached.clone(),
                None => {
                    let fresh = client
                        .fetch_merged(lottery_key, date, &lottery.source_ids)
                        .await
                        .map_err(|e| (ReasonCode::from_error_code(e.reason_code()), e.to_string()));
                    cache = Some(fresh.clone());
                    fresh
                }
            };

            let attempt = match fetched {
                Ok(merged) => {
                    let options = ImportOptions {
                        avoid_rewrites: lottery.avoid_rewrites,
                        jitter_tolerance: lottery.minute_jitter_tolerance,
                    };
                    match importer
                        .import_slot(lottery_key, date, slot.hour, &candidates, &merged, options)
                        .await
                    {
                        Ok(verdict) => Ok(verdict),
                        Err(PipelineError::Store(err)) => {
                            self.save_state(&mut state).await?;
                            return Err(PipelineError::Store(err));
                        }
                        Err(err) => Err((ReasonCode::ValidationError, err.to_string())),
                    }
                }
                Err(failure) => Err(failure),
            };

            let outcome = match attempt {
                Ok(verdict) => classify_verdict(&verdict),
                Err((reason, detail)) => (reason, detail, false),
            };
            let (reason, detail, terminal) = finalize_for_plan(plan, outcome);

            if reason == ReasonCode::Captured {
                summary.captured += 1;
            }
            let attempted_at = self.clock.now().with_timezone(&Utc);
            state
                .slot_mut(slot.hour)
                .record_attempt(attempted_at, candidates, reason, detail.clone(), terminal);
            self.save_state(&mut state).await?;

            if terminal {
                info!(hour = %slot.hour, ?plan, outcome = %reason, "slot done");
            } else {
                warn!(hour = %slot.hour, ?plan, outcome = %reason, %detail, "slot still pending");
            }
        }

        Ok(self.finish(summary, &state))
    }

    fn finish(&self, mut summary: RunSummary, state: &DayState) -> RunSummary {
        summary.not_applicable = state.slots.values().filter(|s| s.not_applicable).count();
        summary.pending = state.pending_count();
        info!(
            attempted = summary.attempted,
            captured = summary.captured,
            not_applicable = summary.not_applicable,
            pending = summary.pending,
            "run finished"
        );
        summary
    }

    async fn save_state(&self, state: &mut DayState) -> Result<(), PipelineError> {
        let now = self.clock.now().with_timezone(&Utc);
        Ok(self.states.save(state, now).await?)
    }

    async fn already_captured(
        &self,
        lottery_key: &str,
        date: NaiveDate,
        hour: HourBucket,
    ) -> Result<bool, PipelineError> {
        Ok(self
            .store
            .draws_for_date(lottery_key, date)
            .await?
            .iter()
            .any(|d| d.hour_bucket == hour && d.prize_count > 0))
    }

    /// Reason text when the day has no draws at all. Provider failures are
    /// logged and treated as "no signal".
    async fn day_closed(
        &self,
        lottery_key: &str,
        lottery: &LotteryConfig,
        date: NaiveDate,
    ) -> Option<String> {
        if lottery.closed_dates.contains(&date) {
            return Some("configured closed date".to_string());
        }
        match self.provider.day_status(lottery_key, date).await {
            Ok(DayStatus::Closed { reason }) => Some(reason),
            Ok(_) => None,
            Err(err) => {
                warn!(error = %err, "day status unavailable");
                None
            }
        }
    }

    /// Reuses the stored calendar while it is from today and holds rules;
    /// otherwise recomputes it, so new history and year rollovers are
    /// picked up by the first run of each day.
    async fn load_calendar(
        &self,
        lottery_key: &str,
        lottery: &LotteryConfig,
    ) -> Result<CalendarTable, PipelineError> {
        let key = CalendarTable::state_key(lottery_key);
        let stored = load_json::<CalendarTable>(self.states.store().as_ref(), &key).await?;
        let now = self.clock.now();
        match stored {
            Some(table) if calendar_is_fresh(&table, now) => Ok(table),
            Some(table) => {
                debug!(
                    lottery = lottery_key,
                    generated_at = %table.generated_at,
                    "stored calendar is stale"
                );
                self.refresh_calendar(lottery_key, lottery).await
            }
            None => self.refresh_calendar(lottery_key, lottery).await,
        }
    }

    /// Recomputes the calendar from stored draws and persists it. Occurrence
    /// counts use the prizes actually stored for each draw.
    pub async fn refresh_calendar(
        &self,
        lottery_key: &str,
        lottery: &LotteryConfig,
    ) -> Result<CalendarTable, PipelineError> {
        let mut draws = self.store.list_draws(lottery_key).await?;
        let ids: Vec<Uuid> = draws.iter().map(|d| d.id).collect();
        let prizes =
            load_prizes_bounded(Arc::clone(&self.store), &ids, DEFAULT_PRIZE_LOAD_CONCURRENCY)
                .await?;
        for (draw, (_, loaded)) in draws.iter_mut().zip(prizes) {
            draw.prize_count = loaded.len() as u32;
        }

        let now = self.clock.now();
        let table = self.classifier.classify(
            lottery_key,
            &lottery.candidate_hours(),
            &lottery.conditional_hours,
            &draws,
            now.year(),
            now.with_timezone(&Utc),
        );
        let key = CalendarTable::state_key(lottery_key);
        save_json(self.states.store().as_ref(), &key, &table).await?;
        info!(
            lottery = lottery_key,
            draws = draws.len(),
            rules = table.rules.len(),
            "calendar refreshed"
        );
        Ok(table)
    }

    /// Fetches and imports a single slot outside the normal planning. Still
    /// guarded by the future-date rule and the run lock; the slot's state is
    /// updated when the import captures it.
    pub async fn import_one(
        &self,
        lottery_key: &str,
        date: NaiveDate,
        hour: HourBucket,
        lock_ttl: Duration,
    ) -> Result<Option<ImportVerdict>, PipelineError> {
        let date = self.guard_date(Some(date))?;
        let lottery = self.schedule.lottery(lottery_key)?;
        if lottery.slot(hour).is_none() {
            return Err(PipelineError::Validation(format!(
                "{hour} is not a scheduled hour for {lottery_key}"
            )));
        }
        let Some(lock) = self.acquire_lock(lottery_key, lock_ttl).await? else {
            return Ok(None);
        };

        let result = async {
            let client =
                IngestionClient::new(Arc::clone(&self.provider), lottery.minute_jitter_tolerance);
            let merged = client.fetch_merged(lottery_key, date, &lottery.source_ids).await?;
            let candidates = hour.candidates(lottery.minute_jitter_tolerance);
            let options = ImportOptions {
                avoid_rewrites: lottery.avoid_rewrites,
                jitter_tolerance: lottery.minute_jitter_tolerance,
            };
            let importer = Importer::new(Arc::clone(&self.store), Arc::clone(&self.clock));
            let verdict = importer
                .import_slot(lottery_key, date, hour, &candidates, &merged, options)
                .await?;

            if verdict.captured {
                let mut state = self.states.load(lottery_key, date).await?;
                let attempted_at = self.clock.now().with_timezone(&Utc);
                let reason = if verdict.already_complete {
                    ReasonCode::AlreadyComplete
                } else {
                    ReasonCode::Captured
                };
                state
                    .slot_mut(hour)
                    .record_attempt(attempted_at, candidates, reason, "manual import", true);
                self.save_state(&mut state).await?;
            }
            Ok::<_, PipelineError>(verdict)
        }
        .instrument(info_span!("import", lottery = lottery_key, %date, %hour))
        .await;

        Self::release_lock(lock).await;
        result.map(Some)
    }
}

/// A stored calendar is reused only within the local day it was built,
/// for the same year, and when it holds at least one rule.
fn calendar_is_fresh(table: &CalendarTable, now: DateTime<FixedOffset>) -> bool {
    let built_on = table.generated_at.with_timezone(now.offset()).date_naive();
    table.current_year == now.year() && built_on == now.date_naive() && !table.rules.is_empty()
}

/// One-shot slots are always terminal after their attempt. Outcomes that
/// already hold the draw keep their reason; anything else becomes
/// `one_shot_final` with the original reason kept in the detail.
fn finalize_for_plan(
    plan: SlotPlan,
    (reason, detail, terminal): (ReasonCode, String, bool),
) -> (ReasonCode, String, bool) {
    let holds_draw = matches!(reason, ReasonCode::Captured | ReasonCode::AlreadyComplete);
    if plan == SlotPlan::OneShot && !holds_draw {
        (ReasonCode::OneShotFinal, format!("{reason}: {detail}"), true)
    } else {
        (reason, detail, terminal)
    }
}

/// Maps an importer verdict onto the recorded reason and terminality.
fn classify_verdict(verdict: &ImportVerdict) -> (ReasonCode, String, bool) {
    if verdict.already_complete && verdict.records_written == 0 {
        (ReasonCode::AlreadyComplete, "draw already had prizes".into(), true)
    } else if verdict.captured {
        (
            ReasonCode::Captured,
            format!(
                "{} record(s), {} prize(s) via {}",
                verdict.records_written,
                verdict.prizes_written,
                verdict.matched_candidate.as_deref().unwrap_or("-")
            ),
            true,
        )
    } else if verdict.no_draw_signal {
        (
            ReasonCode::NoDrawSignal,
            verdict
                .message
                .clone()
                .unwrap_or_else(|| "provider reports no draw".into()),
            true,
        )
    } else {
        let mut detail = "no record for candidates".to_string();
        if verdict.skipped_empty > 0 || verdict.invalid > 0 {
            detail.push_str(&format!(
                " ({} empty, {} invalid)",
                verdict.skipped_empty, verdict.invalid
            ));
        }
        (ReasonCode::NoMatchingRecord, detail, false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    fn slot() -> SlotConfig {
        SlotConfig {
            hour: "11:00".parse().unwrap(),
            window_start: t(11, 5),
            release: t(11, 29),
            window_end: t(11, 31),
        }
    }

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 12, 29).unwrap()
    }

    fn plan_at(one_shot: Option<&OneShotRule>, day: NaiveDate, h: u32, m: u32) -> SlotPlan {
        plan_slot(&slot(), one_shot, date(), at(day, t(h, m)))
    }

    #[test]
    fn window_catch_up_and_waiting() {
        assert_eq!(plan_at(None, date(), 11, 0), SlotPlan::NotYet);
        assert_eq!(plan_at(None, date(), 11, 5), SlotPlan::Window);
        assert_eq!(plan_at(None, date(), 11, 30), SlotPlan::Window);
        assert_eq!(plan_at(None, date(), 11, 31), SlotPlan::Window);
        assert_eq!(plan_at(None, date(), 11, 40), SlotPlan::CatchUp);
        let next_day = date().succ_opt().unwrap();
        assert_eq!(plan_at(None, next_day, 0, 10), SlotPlan::CatchUp);
    }

    #[test]
    fn one_shot_fires_from_offset_minus_tolerance() {
        let rule = OneShotRule {
            hour: slot().hour,
            weekdays: vec![],
            offset_minutes: 20,
            tolerance_minutes: 5,
        };
        assert_eq!(plan_at(Some(&rule), date(), 11, 14), SlotPlan::NotYet);
        assert_eq!(plan_at(Some(&rule), date(), 11, 15), SlotPlan::OneShot);
        assert_eq!(plan_at(Some(&rule), date(), 13, 0), SlotPlan::OneShot);
    }

    #[test]
    fn one_shot_keeps_outcomes_that_hold_the_draw() {
        let complete = (ReasonCode::AlreadyComplete, "draw already had prizes".into(), true);
        let kept = finalize_for_plan(SlotPlan::OneShot, complete.clone());
        assert_eq!(kept, complete);

        let captured = (ReasonCode::Captured, "1 record(s)".into(), true);
        assert_eq!(finalize_for_plan(SlotPlan::OneShot, captured.clone()), captured);

        let missed = (ReasonCode::NoMatchingRecord, "no record".into(), false);
        let (reason, detail, terminal) = finalize_for_plan(SlotPlan::OneShot, missed.clone());
        assert_eq!(reason, ReasonCode::OneShotFinal);
        assert_eq!(detail, "no_matching_record: no record");
        assert!(terminal);

        assert_eq!(finalize_for_plan(SlotPlan::CatchUp, missed.clone()), missed);
    }

    #[test]
    fn stored_calendar_is_reused_only_on_the_day_it_was_built() {
        let offset = FixedOffset::west_opt(3 * 3600).unwrap();
        let built = offset.with_ymd_and_hms(2025, 12, 29, 8, 0, 0).unwrap();
        let hours: [HourBucket; 1] = ["11:00".parse().unwrap()];
        let table = CalendarTable {
            lottery_key: "L".into(),
            generated_at: built.with_timezone(&Utc),
            current_year: 2025,
            rules: vec![CalendarRule::fallback("L", date(), &hours)],
        };

        let later = offset.with_ymd_and_hms(2025, 12, 29, 23, 30, 0).unwrap();
        assert!(calendar_is_fresh(&table, later));
        let next_day = offset.with_ymd_and_hms(2025, 12, 30, 0, 5, 0).unwrap();
        assert!(!calendar_is_fresh(&table, next_day));
        let new_year = CalendarTable {
            current_year: 2024,
            ..table.clone()
        };
        assert!(!calendar_is_fresh(&new_year, later));
        let empty = CalendarTable {
            rules: vec![],
            ..table
        };
        assert!(!calendar_is_fresh(&empty, later));
    }

    #[test]
    fn verdicts_map_to_reasons() {
        let captured = ImportVerdict {
            captured: true,
            records_written: 1,
            prizes_written: 5,
            matched_candidate: Some("11:00".into()),
            ..Default::default()
        };
        assert_eq!(classify_verdict(&captured).0, ReasonCode::Captured);
        assert!(classify_verdict(&captured).2);

        let complete = ImportVerdict {
            captured: true,
            already_complete: true,
            ..Default::default()
        };
        assert_eq!(classify_verdict(&complete).0, ReasonCode::AlreadyComplete);

        let no_draw = ImportVerdict {
            no_draw_signal: true,
            ..Default::default()
        };
        let expected = (ReasonCode::NoDrawSignal, "provider reports no draw".into(), true);
        assert_eq!(classify_verdict(&no_draw), expected);

        let (reason, _, terminal) = classify_verdict(&ImportVerdict::default());
        assert_eq!(reason, ReasonCode::NoMatchingRecord);
        assert!(!terminal);
    }
}

//! Idempotent persistence of merged upstream records for one slot.

use std::sync::Arc;

use chrono::{NaiveDate, Utc};
use drawcap_adapters::{MergedFetch, RawDrawRecord, DEFAULT_SOURCE};
use drawcap_core::{
    deterministic_draw_id, draw_composite_key, Clock, CloseTime, Draw, HourBucket, Prize,
};
use drawcap_storage::{DrawStore, PrizeMerge};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::PipelineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImportOptions {
    /// Leave draws that already carry prizes untouched.
    pub avoid_rewrites: bool,
    pub jitter_tolerance: u8,
}

impl Default for ImportOptions {
    fn default() -> Self {
        Self {
            avoid_rewrites: true,
            jitter_tolerance: 0,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ImportVerdict {
    pub captured: bool,
    pub already_complete: bool,
    pub records_written: usize,
    pub prizes_written: usize,
    /// Provider said there is no draw for the date and nothing matched.
    pub no_draw_signal: bool,
    pub matched_candidate: Option<String>,
    pub skipped_empty: usize,
    pub invalid: usize,
    pub message: Option<String>,
}

/// A record that passed date/hour validation.
struct Candidate<'a> {
    record: &'a RawDrawRecord,
    close: CloseTime,
}

pub struct Importer {
    store: Arc<dyn DrawStore>,
    clock: Arc<dyn Clock>,
}

impl Importer {
    pub fn new(store: Arc<dyn DrawStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Persists the merged records that fall in `slot_hour`. A record
    /// belongs to the slot when its close time maps onto it under the
    /// jitter tolerance, the same rule the merge keys records by.
    /// `candidates` (close-hour strings, nearest first; empty means the
    /// slot's own jitter candidates) rank the matches: the best-ranked
    /// close time carrying prizes wins, and close times outside the list
    /// rank after it by distance from the hour.
    /// Everything is written under `slot_hour`, whatever minute the provider
    /// used.
    pub async fn import_slot(
        &self,
        lottery_key: &str,
        date: NaiveDate,
        slot_hour: HourBucket,
        candidates: &[String],
        fetched: &MergedFetch,
        options: ImportOptions,
    ) -> Result<ImportVerdict, PipelineError> {
        if lottery_key.trim().is_empty() {
            return Err(PipelineError::Validation("empty lottery key".into()));
        }
        let candidates = if candidates.is_empty() {
            slot_hour.candidates(options.jitter_tolerance)
        } else {
            candidates.to_vec()
        };
        let wanted: Vec<CloseTime> = candidates
            .iter()
            .map(|c| CloseTime::parse(c))
            .collect::<Result<_, _>>()
            .map_err(|e| PipelineError::Validation(format!("candidate hour: {e}")))?;

        let mut verdict = ImportVerdict {
            message: fetched.message.clone(),
            ..ImportVerdict::default()
        };

        let mut matching: Vec<Candidate> = Vec::new();
        for record in &fetched.records {
            match validate_record(record, date) {
                Ok(Some(close)) if close.bucket(options.jitter_tolerance) == slot_hour => {
                    if record.non_empty_prize_count() == 0 {
                        verdict.skipped_empty += 1;
                    } else {
                        matching.push(Candidate { record, close });
                    }
                }
                Ok(_) => {}
                Err(reason) => {
                    verdict.invalid += 1;
                    warn!(
                        lottery = lottery_key,
                        %date,
                        close_hour = %record.close_hour,
                        %reason,
                        "skipping invalid record"
                    );
                }
            }
        }

        let rank = |close: &CloseTime| match wanted.iter().position(|w| w == close) {
            Some(index) => (0, index as u32),
            None => (1, close.distance_to(slot_hour)),
        };
        if let Some(best) = matching.iter().map(|c| c.close).min_by_key(|close| rank(close)) {
            verdict.matched_candidate = Some(best.to_string());
            for candidate in matching.iter().filter(|c| c.close == best) {
                self.persist(lottery_key, date, slot_hour, candidate, options, &mut verdict)
                    .await?;
            }
        }

        verdict.captured = verdict.records_written > 0 || verdict.already_complete;
        if verdict.matched_candidate.is_none() && fetched.no_draw {
            verdict.no_draw_signal = true;
        }
        info!(
            lottery = lottery_key,
            %date,
            hour = %slot_hour,
            captured = verdict.captured,
            already_complete = verdict.already_complete,
            records = verdict.records_written,
            prizes = verdict.prizes_written,
            "slot import finished"
        );
        Ok(verdict)
    }

    async fn persist(
        &self,
        lottery_key: &str,
        date: NaiveDate,
        slot_hour: HourBucket,
        candidate: &Candidate<'_>,
        options: ImportOptions,
        verdict: &mut ImportVerdict,
    ) -> Result<(), PipelineError> {
        let source = candidate.record.source_or(DEFAULT_SOURCE);
        let id = deterministic_draw_id(lottery_key, date, slot_hour, &source);

        if let Some(existing) = self.store.get_draw(id).await? {
            if existing.prize_count > 0 && options.avoid_rewrites {
                debug!(
                    lottery = lottery_key,
                    %date,
                    hour = %slot_hour,
                    %source,
                    "draw already complete"
                );
                verdict.already_complete = true;
                return Ok(());
            }
        }

        let raw_hour = (candidate.close.minute != 0 || candidate.close.hour != slot_hour.hour())
            .then(|| candidate.close.to_string());
        let prizes: Vec<Prize> = candidate
            .record
            .prize_fields()
            .into_iter()
            .filter_map(|(position, raw)| Prize::derive(position, &raw))
            .collect();

        let draw = Draw {
            id,
            composite_key: draw_composite_key(lottery_key, date, slot_hour, &source),
            lottery_key: lottery_key.to_string(),
            date,
            hour_bucket: slot_hour,
            hour_bucket_raw: raw_hour,
            prize_count: prizes.len() as u32,
            source,
            imported_at: self.clock.now().with_timezone(&Utc),
        };
        self.store.upsert_draw(&draw).await?;

        let mut written = 0;
        for prize in &prizes {
            if matches!(
                self.store.upsert_prize(id, prize).await?,
                PrizeMerge::Inserted | PrizeMerge::Updated
            ) {
                written += 1;
            }
        }
        verdict.records_written += 1;
        verdict.prizes_written += written;
        Ok(())
    }
}

/// `Ok(None)` when the record belongs to another date.
fn validate_record(record: &RawDrawRecord, date: NaiveDate) -> Result<Option<CloseTime>, String> {
    let record_date = NaiveDate::parse_from_str(record.date.trim(), "%Y-%m-%d")
        .map_err(|e| format!("bad date {:?}: {e}", record.date))?;
    let close = CloseTime::parse(&record.close_hour).map_err(|e| e.to_string())?;
    Ok((record_date == date).then_some(close))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::{FixedOffset, TimeZone};
    use drawcap_adapters::{
        FetchRequest, IngestError, IngestionClient, UpstreamPayload, UpstreamProvider,
    };
    use drawcap_core::FixedClock;
    use drawcap_storage::MemoryDrawStore;
    use std::collections::BTreeMap;

    fn record(
        date: &str,
        close_hour: &str,
        source: Option<&str>,
        prizes: &[&str],
    ) -> RawDrawRecord {
        let mut fields = BTreeMap::new();
        for (i, value) in prizes.iter().enumerate() {
            fields.insert(format!("prize_{}", i + 1), serde_json::json!(value));
        }
        RawDrawRecord {
            date: date.into(),
            close_hour: close_hour.into(),
            source_id: source.map(str::to_string),
            fields,
        }
    }

    fn fetched(records: Vec<RawDrawRecord>) -> MergedFetch {
        MergedFetch {
            records,
            requests: 1,
            ..MergedFetch::default()
        }
    }

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 12, 29).unwrap()
    }

    fn eleven() -> HourBucket {
        "11:00".parse().unwrap()
    }

    fn importer() -> (Importer, Arc<MemoryDrawStore>) {
        let store = Arc::new(MemoryDrawStore::new());
        let clock = FixedClock::new(
            FixedOffset::west_opt(3 * 3600)
                .unwrap()
                .with_ymd_and_hms(2025, 12, 29, 11, 30, 0)
                .unwrap(),
        );
        (Importer::new(store.clone(), Arc::new(clock)), store)
    }

    const FIVE: [&str; 5] = ["4321", "0057", "1200", "9876", "5555"];

    fn opts() -> ImportOptions {
        ImportOptions {
            avoid_rewrites: true,
            jitter_tolerance: 2,
        }
    }

    async fn import(
        importer: &Importer,
        batch: &MergedFetch,
        options: ImportOptions,
    ) -> ImportVerdict {
        importer
            .import_slot("L", date(), eleven(), &eleven().candidates(2), batch, options)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn writes_one_draw_with_its_prizes() {
        let (importer, store) = importer();
        let batch = fetched(vec![record("2025-12-29", "11:00", Some("primary"), &FIVE)]);
        let verdict = import(&importer, &batch, opts()).await;
        assert!(verdict.captured);
        assert_eq!(verdict.records_written, 1);
        assert_eq!(verdict.prizes_written, 5);
        assert_eq!(verdict.matched_candidate.as_deref(), Some("11:00"));

        let id = deterministic_draw_id("L", date(), eleven(), "primary");
        let draw = store.get_draw(id).await.unwrap().unwrap();
        assert_eq!(draw.prize_count, 5);
        assert_eq!(draw.hour_bucket_raw, None);
        let prizes = store.list_prizes(id).await.unwrap();
        assert_eq!(prizes[1].last4, "0057");
        assert_eq!(prizes[1].group_index, 15);
    }

    #[tokio::test]
    async fn second_import_is_already_complete_and_writes_nothing() {
        let (importer, store) = importer();
        let batch = fetched(vec![record("2025-12-29", "11:00", Some("primary"), &FIVE)]);
        import(&importer, &batch, opts()).await;
        let again = import(&importer, &batch, opts()).await;
        assert!(again.captured && again.already_complete);
        assert_eq!(again.records_written, 0);
        assert_eq!(store.draw_count().await, 1);
    }

    #[tokio::test]
    async fn rewrite_merges_without_losing_prizes() {
        let (importer, store) = importer();
        let full = fetched(vec![record("2025-12-29", "11:00", Some("primary"), &FIVE)]);
        import(&importer, &full, opts()).await;

        let partial = fetched(vec![record(
            "2025-12-29",
            "11:00",
            Some("primary"),
            &["4321", "", "---"],
        )]);
        let options = ImportOptions {
            avoid_rewrites: false,
            ..opts()
        };
        let verdict = import(&importer, &partial, options).await;
        assert_eq!(verdict.records_written, 1);
        assert_eq!(verdict.prizes_written, 0);
        let id = deterministic_draw_id("L", date(), eleven(), "primary");
        assert_eq!(store.list_prizes(id).await.unwrap().len(), 5);
    }

    #[tokio::test]
    async fn jittered_minute_lands_in_slot_and_keeps_raw_text() {
        let (importer, store) = importer();
        let batch = fetched(vec![
            record("2025-12-29", "10:59", Some("primary"), &FIVE),
            record("2025-12-29", "12:00", Some("primary"), &FIVE),
        ]);
        let verdict = import(&importer, &batch, opts()).await;
        assert_eq!(verdict.matched_candidate.as_deref(), Some("10:59"));
        let id = deterministic_draw_id("L", date(), eleven(), "primary");
        let draw = store.get_draw(id).await.unwrap().unwrap();
        assert_eq!(draw.hour_bucket_raw.as_deref(), Some("10:59"));
        assert_eq!(store.draw_count().await, 1);
    }

    struct OneSource(UpstreamPayload);

    #[async_trait]
    impl UpstreamProvider for OneSource {
        fn name(&self) -> &str {
            "one-source"
        }

        async fn fetch(&self, _request: &FetchRequest) -> Result<UpstreamPayload, IngestError> {
            Ok(self.0.clone())
        }
    }

    #[tokio::test]
    async fn merged_minute_variant_is_captured_for_its_hour() {
        let provider = OneSource(UpstreamPayload {
            records: vec![
                record("2025-12-29", "11:00", Some("primary"), &FIVE[..3]),
                record("2025-12-29", "11:05", Some("primary"), &FIVE),
            ],
            ..Default::default()
        });
        let client = IngestionClient::new(Arc::new(provider), 2);
        let merged = client
            .fetch_merged("L", date(), &["primary".to_string()])
            .await
            .unwrap();
        assert_eq!(merged.records.len(), 1);
        assert_eq!(merged.records[0].close_hour, "11:05");

        let (importer, store) = importer();
        let verdict = import(&importer, &merged, opts()).await;
        assert!(verdict.captured);
        assert_eq!(verdict.records_written, 1);
        assert_eq!(verdict.prizes_written, 5);
        assert_eq!(verdict.matched_candidate.as_deref(), Some("11:05"));
        let id = deterministic_draw_id("L", date(), eleven(), "primary");
        let draw = store.get_draw(id).await.unwrap().unwrap();
        assert_eq!(draw.hour_bucket, eleven());
        assert_eq!(draw.hour_bucket_raw.as_deref(), Some("11:05"));
    }

    #[tokio::test]
    async fn listed_candidates_outrank_other_minutes_in_the_hour() {
        let (importer, store) = importer();
        let batch = fetched(vec![
            record("2025-12-29", "11:20", Some("primary"), &FIVE),
            record("2025-12-29", "11:01", Some("mirror"), &FIVE),
            record("2025-12-29", "10:30", Some("primary"), &FIVE),
        ]);
        let verdict = import(&importer, &batch, opts()).await;
        assert_eq!(verdict.matched_candidate.as_deref(), Some("11:01"));
        assert_eq!(verdict.records_written, 1);
        assert_eq!(store.draw_count().await, 1);
    }

    #[tokio::test]
    async fn empty_and_invalid_records_are_skipped() {
        let (importer, store) = importer();
        let batch = fetched(vec![
            record("2025-12-29", "11:00", None, &["", "-", ""]),
            record("29/12/2025", "11:00", None, &FIVE),
            record("2025-12-29", "eleven", None, &FIVE),
        ]);
        let verdict = import(&importer, &batch, opts()).await;
        assert!(!verdict.captured);
        assert_eq!(verdict.skipped_empty, 1);
        assert_eq!(verdict.invalid, 2);
        assert_eq!(store.draw_count().await, 0);
    }

    #[tokio::test]
    async fn no_draw_signal_is_reported_when_nothing_matches() {
        let (importer, _) = importer();
        let batch = MergedFetch {
            no_draw: true,
            message: Some("no draw today".into()),
            requests: 1,
            ..MergedFetch::default()
        };
        let verdict = import(&importer, &batch, opts()).await;
        assert!(verdict.no_draw_signal);
        assert!(!verdict.captured);
    }

    #[tokio::test]
    async fn rejects_malformed_candidates() {
        let (importer, _) = importer();
        let candidates = ["25:99".to_string()];
        let err = importer
            .import_slot("L", date(), eleven(), &candidates, &fetched(vec![]), opts())
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Validation(_)));
    }
}

use std::collections::HashMap;
use std::sync::Arc;

use chrono::NaiveDate;
use drawcap_core::HourBucket;
use tracing::{debug, info, warn};

use crate::{
    DayStatus, FetchRequest, IngestError, RawDrawRecord, UpstreamProvider, DEFAULT_SOURCE,
};

/// Deduplicated result of one or more upstream requests for a date.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MergedFetch {
    pub records: Vec<RawDrawRecord>,
    /// True only when every source answered with the no-draw signal and no
    /// response carried records.
    pub no_draw: bool,
    pub message: Option<String>,
    pub requests: usize,
    pub duplicates_dropped: usize,
    /// Sources whose request failed while another source answered.
    pub failed_sources: Vec<String>,
}

/// Identity of a record after canonicalisation. Records whose close hour
/// cannot be parsed keep their raw text so they still reach validation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum MergeKey {
    Canonical(String, HourBucket, String),
    Raw(String, String, String),
}

fn merge_key(record: &RawDrawRecord, source: &str, tolerance: u8) -> MergeKey {
    let date = record.date.trim().to_string();
    match HourBucket::from_raw(&record.close_hour, tolerance) {
        Ok((bucket, _)) => MergeKey::Canonical(date, bucket, source.to_string()),
        Err(_) => MergeKey::Raw(date, record.close_hour.trim().to_string(), source.to_string()),
    }
}

pub struct IngestionClient {
    provider: Arc<dyn UpstreamProvider>,
    jitter_tolerance: u8,
}

impl IngestionClient {
    pub fn new(provider: Arc<dyn UpstreamProvider>, jitter_tolerance: u8) -> Self {
        Self {
            provider,
            jitter_tolerance,
        }
    }

    pub fn provider(&self) -> &Arc<dyn UpstreamProvider> {
        &self.provider
    }

    /// Issues one request per source identifier (or a single unscoped one)
    /// and merges the answers. On a `(date, bucket, source)` conflict the
    /// variant with more non-empty prizes wins; ties keep the first seen.
    /// A failing source is skipped as long as another one answers; the
    /// first failure is returned only when every source failed.
    pub async fn fetch_merged(
        &self,
        lottery_key: &str,
        date: NaiveDate,
        source_ids: &[String],
    ) -> Result<MergedFetch, IngestError> {
        if lottery_key.trim().is_empty() {
            return Err(IngestError::Validation("empty lottery key".into()));
        }
        let scopes: Vec<Option<String>> = if source_ids.is_empty() {
            vec![None]
        } else {
            source_ids.iter().cloned().map(Some).collect()
        };

        let mut merged = MergedFetch {
            no_draw: true,
            ..MergedFetch::default()
        };
        let mut index: HashMap<MergeKey, usize> = HashMap::new();
        let mut first_failure: Option<IngestError> = None;
        let mut answered = 0;

        for scope in scopes {
            let request = FetchRequest {
                lottery_key: lottery_key.to_string(),
                date,
                source_id: scope.clone(),
            };
            merged.requests += 1;
            let payload = match self.provider.fetch(&request).await {
                Ok(payload) => payload,
                Err(err) => {
                    let source = scope.as_deref().unwrap_or(DEFAULT_SOURCE).to_string();
                    warn!(
                        lottery = lottery_key,
                        %date,
                        %source,
                        reason = err.reason_code(),
                        error = %err,
                        "source failed; continuing with the others"
                    );
                    merged.failed_sources.push(source);
                    first_failure.get_or_insert(err);
                    continue;
                }
            };
            answered += 1;
            if !payload.no_draw || !payload.records.is_empty() {
                merged.no_draw = false;
            }
            if merged.message.is_none() {
                merged.message = payload.message;
            }

            let fallback_source = scope.as_deref().unwrap_or(DEFAULT_SOURCE);
            for mut record in payload.records {
                let source = record.source_or(fallback_source);
                record.source_id = Some(source.clone());
                let key = merge_key(&record, &source, self.jitter_tolerance);
                match index.get(&key) {
                    Some(&pos) => {
                        merged.duplicates_dropped += 1;
                        let current = &merged.records[pos];
                        if record.non_empty_prize_count() > current.non_empty_prize_count() {
                            debug!(
                                lottery = lottery_key,
                                close_hour = %record.close_hour,
                                source = %source,
                                "richer variant replaces earlier record"
                            );
                            merged.records[pos] = record;
                        }
                    }
                    None => {
                        index.insert(key, merged.records.len());
                        merged.records.push(record);
                    }
                }
            }
        }

        if answered == 0 {
            if let Some(err) = first_failure {
                return Err(err);
            }
        }
        // A source that never answered cannot confirm there is no draw.
        if !merged.failed_sources.is_empty() {
            merged.no_draw = false;
        }

        info!(
            lottery = lottery_key,
            %date,
            requests = merged.requests,
            failed = merged.failed_sources.len(),
            records = merged.records.len(),
            duplicates = merged.duplicates_dropped,
            no_draw = merged.no_draw,
            "upstream fetch merged"
        );
        Ok(merged)
    }

    pub async fn day_status(
        &self,
        lottery_key: &str,
        date: NaiveDate,
    ) -> Result<DayStatus, IngestError> {
        self.provider.day_status(lottery_key, date).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::UpstreamPayload;
    use async_trait::async_trait;
    use std::collections::BTreeMap;

    struct ScriptedUpstream {
        by_source: HashMap<Option<String>, UpstreamPayload>,
    }

    #[async_trait]
    impl UpstreamProvider for ScriptedUpstream {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn fetch(&self, request: &FetchRequest) -> Result<UpstreamPayload, IngestError> {
            if request.source_id.as_deref().is_some_and(|s| s.starts_with("down")) {
                return Err(IngestError::Transient("connection reset".into()));
            }
            Ok(self
                .by_source
                .get(&request.source_id)
                .cloned()
                .unwrap_or_default())
        }
    }

    fn record(close_hour: &str, source: Option<&str>, prizes: &[&str]) -> RawDrawRecord {
        let mut fields = BTreeMap::new();
        for (i, value) in prizes.iter().enumerate() {
            fields.insert(format!("prize_{}", i + 1), serde_json::json!(value));
        }
        RawDrawRecord {
            date: "2025-12-29".into(),
            close_hour: close_hour.into(),
            source_id: source.map(str::to_string),
            fields,
        }
    }

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 12, 29).unwrap()
    }

    #[tokio::test]
    async fn richer_variant_wins_regardless_of_order() {
        let sparse = record("11:00", Some("primary"), &["1234", "", ""]);
        let rich = record("11:01", Some("primary"), &["1234", "5678", "9012"]);

        for (first, second) in [(sparse.clone(), rich.clone()), (rich.clone(), sparse.clone())] {
            let mut by_source = HashMap::new();
            by_source.insert(
                Some("a".to_string()),
                UpstreamPayload {
                    records: vec![first],
                    ..Default::default()
                },
            );
            by_source.insert(
                Some("b".to_string()),
                UpstreamPayload {
                    records: vec![second],
                    ..Default::default()
                },
            );
            let client = IngestionClient::new(Arc::new(ScriptedUpstream { by_source }), 2);
            let merged = client
                .fetch_merged("L", date(), &["a".into(), "b".into()])
                .await
                .unwrap();
            assert_eq!(merged.records.len(), 1);
            assert_eq!(merged.records[0].non_empty_prize_count(), 3);
            assert_eq!(merged.duplicates_dropped, 1);
            assert_eq!(merged.requests, 2);
        }
    }

    #[tokio::test]
    async fn distinct_sources_are_kept_apart() {
        let mut by_source = HashMap::new();
        by_source.insert(
            Some("a".to_string()),
            UpstreamPayload {
                records: vec![record("11:00", None, &["1234"])],
                ..Default::default()
            },
        );
        by_source.insert(
            Some("b".to_string()),
            UpstreamPayload {
                records: vec![record("11:00", None, &["1234"])],
                ..Default::default()
            },
        );
        let client = IngestionClient::new(Arc::new(ScriptedUpstream { by_source }), 2);
        let merged = client
            .fetch_merged("L", date(), &["a".into(), "b".into()])
            .await
            .unwrap();
        let sources: Vec<_> = merged
            .records
            .iter()
            .map(|r| r.source_id.clone().unwrap())
            .collect();
        assert_eq!(sources, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn failing_secondary_source_keeps_primary_records() {
        let mut by_source = HashMap::new();
        by_source.insert(
            Some("primary".to_string()),
            UpstreamPayload {
                records: vec![record("11:00", None, &["1234", "5678"])],
                ..Default::default()
            },
        );
        let client = IngestionClient::new(Arc::new(ScriptedUpstream { by_source }), 2);
        let merged = client
            .fetch_merged("L", date(), &["primary".into(), "down-mirror".into()])
            .await
            .unwrap();
        assert_eq!(merged.records.len(), 1);
        assert_eq!(merged.records[0].source_id.as_deref(), Some("primary"));
        assert_eq!(merged.requests, 2);
        assert_eq!(merged.failed_sources, vec!["down-mirror"]);
    }

    #[tokio::test]
    async fn every_source_failing_surfaces_the_first_error() {
        let client = IngestionClient::new(
            Arc::new(ScriptedUpstream {
                by_source: HashMap::new(),
            }),
            2,
        );
        let err = client
            .fetch_merged("L", date(), &["down-a".into(), "down-b".into()])
            .await
            .unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn no_draw_signal_requires_every_response_to_agree() {
        let mut by_source = HashMap::new();
        by_source.insert(
            None,
            UpstreamPayload {
                no_draw: true,
                message: Some("no draw on holiday".into()),
                ..Default::default()
            },
        );
        let client = IngestionClient::new(Arc::new(ScriptedUpstream { by_source }), 2);
        let merged = client.fetch_merged("L", date(), &[]).await.unwrap();
        assert!(merged.no_draw);
        assert_eq!(merged.message.as_deref(), Some("no draw on holiday"));

        let empty = IngestionClient::new(
            Arc::new(ScriptedUpstream {
                by_source: HashMap::new(),
            }),
            2,
        );
        let merged = empty.fetch_merged("L", date(), &[]).await.unwrap();
        assert!(!merged.no_draw);
        assert!(merged.records.is_empty());
    }

    #[tokio::test]
    async fn rejects_blank_lottery() {
        let client = IngestionClient::new(
            Arc::new(ScriptedUpstream {
                by_source: HashMap::new(),
            }),
            2,
        );
        let err = client.fetch_merged(" ", date(), &[]).await.unwrap_err();
        assert!(matches!(err, IngestError::Validation(_)));
    }
}

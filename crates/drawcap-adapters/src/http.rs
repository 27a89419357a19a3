use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use drawcap_storage::{FetchError, HttpFetcher, PayloadArchive};
use reqwest::Url;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{DayStatus, FetchRequest, IngestError, UpstreamPayload, UpstreamProvider};

/// JSON-over-HTTP provider:
/// `GET {base}/results?date=YYYY-MM-DD&lottery=KEY[&source=ID]` and
/// `GET {base}/day-status?date=YYYY-MM-DD&lottery=KEY`.
#[derive(Debug)]
pub struct HttpUpstream {
    base_url: String,
    fetcher: HttpFetcher,
    archive: Option<PayloadArchive>,
    run_id: Uuid,
}

impl HttpUpstream {
    pub fn new(base_url: impl Into<String>, fetcher: HttpFetcher) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            fetcher,
            archive: None,
            run_id: Uuid::new_v4(),
        }
    }

    pub fn with_archive(mut self, archive: PayloadArchive) -> Self {
        self.archive = Some(archive);
        self
    }

    pub fn with_run_id(mut self, run_id: Uuid) -> Self {
        self.run_id = run_id;
        self
    }

    fn url(&self, endpoint: &str, params: &[(&str, String)]) -> Result<Url, IngestError> {
        Url::parse_with_params(&format!("{}/{endpoint}", self.base_url), params)
            .map_err(|e| IngestError::Validation(format!("bad provider url: {e}")))
    }
}

#[async_trait]
impl UpstreamProvider for HttpUpstream {
    fn name(&self) -> &str {
        "http"
    }

    async fn fetch(&self, request: &FetchRequest) -> Result<UpstreamPayload, IngestError> {
        let mut params = vec![
            ("date", request.date.to_string()),
            ("lottery", request.lottery_key.clone()),
        ];
        if let Some(source) = &request.source_id {
            params.push(("source", source.clone()));
        }
        let url = self.url("results", &params)?;

        let response = self
            .fetcher
            .fetch_bytes(self.run_id, &request.lottery_key, url.as_str())
            .await?;
        debug!(
            lottery = %request.lottery_key,
            date = %request.date,
            attempts = response.attempts,
            bytes = response.body.len(),
            "upstream response received"
        );

        if let Some(archive) = &self.archive {
            if let Err(err) = archive
                .store(Utc::now(), &request.lottery_key, &response.body)
                .await
            {
                warn!(error = %err, "could not archive upstream payload");
            }
        }

        UpstreamPayload::parse(&response.body)
    }

    async fn day_status(
        &self,
        lottery_key: &str,
        date: NaiveDate,
    ) -> Result<DayStatus, IngestError> {
        let url = self.url(
            "day-status",
            &[("date", date.to_string()), ("lottery", lottery_key.to_string())],
        )?;
        match self.fetcher.fetch_bytes(self.run_id, lottery_key, url.as_str()).await {
            Ok(response) => serde_json::from_slice(&response.body)
                .map_err(|e| IngestError::Malformed(e.to_string())),
            Err(FetchError::HttpStatus { status: 404, .. }) => Ok(DayStatus::Unknown),
            Err(err) => Err(err.into()),
        }
    }
}

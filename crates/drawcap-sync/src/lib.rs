//! Scheduled capture pipeline: calendar classification, per-slot
//! scheduling, idempotent import and missed-capture audit.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use anyhow::{Context, Result};
use chrono::{Duration, NaiveDate, Utc};
use drawcap_adapters::{FixtureUpstream, HttpUpstream, UpstreamProvider};
use drawcap_core::{HourBucket, SystemClock};
use drawcap_storage::{
    DrawStore, FileDrawStore, FileStateStore, HttpClientConfig, HttpFetcher, PayloadArchive,
    PgDrawStore, StateStore,
};
use serde::Serialize;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

pub mod audit;
pub mod classifier;
pub mod config;
pub mod error;
pub mod importer;
pub mod scheduler;
pub mod state;

pub use audit::{audit_day, write_report, AuditReport, AuditStatus, AuditThresholds, SlotFinding};
pub use classifier::{
    CalendarClassifier, CalendarRule, CalendarTable, ClassifierConfig, Provenance, Tier,
};
pub use config::{LotteryConfig, ScheduleFile, SyncConfig};
pub use error::PipelineError;
pub use importer::{ImportOptions, ImportVerdict, Importer};
pub use scheduler::{plan_slot, RunOutcome, RunRequest, RunSummary, Scheduler, SlotPlan};
pub use state::{DayState, ReasonCode, ScheduleStateRepo, SlotState};

pub const CRATE_NAME: &str = "drawcap-sync";

/// Caller-facing knobs shared by `run`, `audit` and `watch`.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub lottery: Option<String>,
    pub date: Option<NaiveDate>,
    pub thresholds: AuditThresholds,
    pub lock_ttl: Duration,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            lottery: None,
            date: None,
            thresholds: AuditThresholds::default(),
            lock_ttl: Duration::seconds(scheduler::DEFAULT_LOCK_TTL_SECS),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LotteryRun {
    pub summary: RunSummary,
    /// Absent when the run lost the lock.
    pub audit: Option<AuditReport>,
    pub report_path: Option<String>,
}

impl LotteryRun {
    pub fn is_critical(&self) -> bool {
        self.audit.as_ref().is_some_and(AuditReport::is_critical)
    }
}

pub struct SyncPipeline {
    config: SyncConfig,
    scheduler: Scheduler,
}

impl SyncPipeline {
    /// Wires stores, provider and clock from the environment config.
    /// `DATABASE_URL` selects Postgres for draws; a provider URL selects
    /// the HTTP upstream, otherwise fixtures are served from disk.
    pub async fn from_config(config: SyncConfig) -> Result<Self> {
        let schedule = ScheduleFile::load(&config.schedule_path)?;
        let clock = SystemClock::from_offset_minutes(config.tz_offset_minutes)
            .with_context(|| {
                format!("invalid timezone offset {} minutes", config.tz_offset_minutes)
            })?;

        let store: Arc<dyn DrawStore> = match &config.database_url {
            Some(url) => Arc::new(PgDrawStore::connect(url).await?),
            None => Arc::new(FileDrawStore::new(config.data_dir.clone())),
        };
        let state_store: Arc<dyn StateStore> =
            Arc::new(FileStateStore::new(config.state_dir.clone()));

        let provider: Arc<dyn UpstreamProvider> = match &config.provider_url {
            Some(url) => {
                let fetcher = HttpFetcher::new(HttpClientConfig {
                    timeout: StdDuration::from_secs(config.http_timeout_secs),
                    user_agent: Some(config.user_agent.clone()),
                    ..Default::default()
                })?;
                Arc::new(
                    HttpUpstream::new(url.clone(), fetcher)
                        .with_archive(PayloadArchive::new(config.artifacts_dir.clone())),
                )
            }
            None => Arc::new(FixtureUpstream::new(config.fixtures_dir.clone())),
        };

        info!(
            store = if config.database_url.is_some() { "postgres" } else { "file" },
            provider = provider.name(),
            lotteries = schedule.lotteries.len(),
            "pipeline configured"
        );
        let scheduler = Scheduler::new(
            Arc::new(schedule),
            store,
            state_store,
            provider,
            Arc::new(clock),
        );
        Ok(Self { config, scheduler })
    }

    pub fn from_parts(config: SyncConfig, scheduler: Scheduler) -> Self {
        Self { config, scheduler }
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    fn reports_dir(&self) -> &PathBuf {
        &self.config.reports_dir
    }

    /// One scheduler pass per selected lottery followed by its audit. A
    /// future date aborts before anything is touched.
    pub async fn run_once(&self, options: &RunOptions) -> Result<Vec<LotteryRun>, PipelineError> {
        let keys = self.scheduler.schedule().select(options.lottery.as_deref())?;
        let mut runs = Vec::with_capacity(keys.len());
        for key in keys {
            let request = RunRequest {
                lottery_key: key.clone(),
                date: options.date,
                lock_ttl: options.lock_ttl,
            };
            let summary = self.scheduler.run(&request).await?;
            if summary.outcome == RunOutcome::LockContended {
                runs.push(LotteryRun {
                    summary,
                    audit: None,
                    report_path: None,
                });
                continue;
            }
            let report = self.audit_lottery(&key, summary.date, options.thresholds).await?;
            let path = write_report(self.reports_dir(), &report).await?;
            runs.push(LotteryRun {
                summary,
                audit: Some(report),
                report_path: Some(path.display().to_string()),
            });
        }
        Ok(runs)
    }

    async fn audit_lottery(
        &self,
        key: &str,
        date: NaiveDate,
        thresholds: AuditThresholds,
    ) -> Result<AuditReport, PipelineError> {
        let lottery = self.scheduler.schedule().lottery(key)?;
        let state = self.scheduler.states().load(key, date).await?;
        let now = self.scheduler.clock().now();
        Ok(audit_day(
            key,
            lottery,
            &state,
            now.naive_local(),
            now.with_timezone(&Utc),
            thresholds,
        ))
    }

    /// Audit only; no scheduling and no network.
    pub async fn audit(
        &self,
        options: &RunOptions,
    ) -> Result<Vec<(AuditReport, PathBuf)>, PipelineError> {
        let date = options.date.unwrap_or_else(|| self.scheduler.clock().today());
        let mut out = Vec::new();
        for key in self.scheduler.schedule().select(options.lottery.as_deref())? {
            let report = self.audit_lottery(&key, date, options.thresholds).await?;
            let path = write_report(self.reports_dir(), &report).await?;
            out.push((report, path));
        }
        Ok(out)
    }

    /// Recomputes and stores the calendar for each selected lottery.
    pub async fn classify(
        &self,
        lottery: Option<&str>,
    ) -> Result<Vec<CalendarTable>, PipelineError> {
        let schedule = self.scheduler.schedule();
        let mut tables = Vec::new();
        for key in schedule.select(lottery)? {
            let config = schedule.lottery(&key)?;
            tables.push(self.scheduler.refresh_calendar(&key, config).await?);
        }
        Ok(tables)
    }

    /// `None` when another run holds the lock.
    pub async fn import_slot(
        &self,
        lottery: &str,
        date: NaiveDate,
        hour: HourBucket,
        lock_ttl: Duration,
    ) -> Result<Option<ImportVerdict>, PipelineError> {
        self.scheduler.import_one(lottery, date, hour, lock_ttl).await
    }

    /// Re-runs `run_once` for today on the configured cron expression until
    /// Ctrl-C. Every tick is an independent locked run.
    pub async fn watch(self: Arc<Self>, options: RunOptions) -> Result<()> {
        let cron = self.config.watch_cron.clone();
        let mut sched = JobScheduler::new().await.context("creating scheduler")?;
        let pipeline = Arc::clone(&self);
        let job = Job::new_async(cron.as_str(), move |_uuid, _lock| {
            let pipeline = Arc::clone(&pipeline);
            let options = RunOptions {
                date: None,
                ..options.clone()
            };
            Box::pin(async move {
                match pipeline.run_once(&options).await {
                    Ok(runs) => {
                        for run in runs.iter().filter(|r| r.is_critical()) {
                            warn!(lottery = %run.summary.lottery, "audit critical");
                        }
                    }
                    Err(err) => {
                        error!(reason = err.reason_code(), error = %err, "scheduled run failed")
                    }
                }
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        sched.add(job).await.context("adding scheduler job")?;
        sched.start().await.context("starting scheduler")?;
        info!(%cron, "watching; press Ctrl-C to stop");

        tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
        sched.shutdown().await.context("stopping scheduler")?;
        Ok(())
    }
}

/// Applies pending migrations to the configured Postgres database.
pub async fn migrate(config: &SyncConfig) -> Result<()> {
    let url = config
        .database_url
        .as_deref()
        .context("DATABASE_URL is required for migrate")?;
    let store = PgDrawStore::connect(url).await?;
    store.migrate().await?;
    info!("migrations applied");
    Ok(())
}

pub async fn pipeline_from_env() -> Result<SyncPipeline> {
    SyncPipeline::from_config(SyncConfig::from_env()).await
}

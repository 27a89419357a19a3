use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Result;
use chrono::{Duration, FixedOffset, NaiveDate, Offset, Utc};
use clap::{Args, Parser, Subcommand, ValueEnum};
use drawcap_core::HourBucket;
use drawcap_sync::{AuditThresholds, PipelineError, RunOptions, SyncConfig, SyncPipeline};
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::time::FormatTime;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "drawcap", version, about = "Scheduled draw capture and audit")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[arg(long, global = true, value_enum, default_value = "pretty")]
    log_format: LogFormat,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Pretty,
    Json,
}

#[derive(Debug, Clone, Args)]
struct Selection {
    /// Capture date (defaults to today in the operating timezone)
    #[arg(long)]
    date: Option<NaiveDate>,

    /// Restrict to one lottery key
    #[arg(long)]
    lottery: Option<String>,
}

#[derive(Debug, Clone, Args)]
struct AuditArgs {
    #[arg(long, default_value_t = 20)]
    warning_minutes: i64,

    #[arg(long, default_value_t = 60)]
    critical_minutes: i64,

    /// Exit with status 2 when any audit is critical
    #[arg(long)]
    fail_on_critical: bool,
}

impl AuditArgs {
    fn thresholds(&self) -> AuditThresholds {
        AuditThresholds {
            warning_minutes: self.warning_minutes,
            critical_minutes: self.critical_minutes,
        }
    }
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the scheduler once, then audit
    Run {
        #[command(flatten)]
        selection: Selection,
        #[command(flatten)]
        audit: AuditArgs,
        #[arg(long, default_value_t = 600)]
        lock_ttl_secs: i64,
    },
    /// Audit schedule state without fetching
    Audit {
        #[command(flatten)]
        selection: Selection,
        #[command(flatten)]
        audit: AuditArgs,
    },
    /// Recompute the draw-hour calendar from stored draws
    Classify {
        #[arg(long)]
        lottery: Option<String>,
    },
    /// Fetch and import a single slot
    Import {
        #[arg(long)]
        date: NaiveDate,
        #[arg(long)]
        lottery: String,
        #[arg(long)]
        hour: HourBucket,
        #[arg(long, default_value_t = 600)]
        lock_ttl_secs: i64,
    },
    /// Apply database migrations
    Migrate,
    /// Run on the DRAWCAP_WATCH_CRON schedule until interrupted
    Watch {
        #[arg(long)]
        lottery: Option<String>,
        #[command(flatten)]
        audit: AuditArgs,
        #[arg(long, default_value_t = 600)]
        lock_ttl_secs: i64,
    },
}

/// Event timestamps in the operating timezone.
struct OffsetTime(FixedOffset);

impl FormatTime for OffsetTime {
    fn format_time(&self, w: &mut Writer<'_>) -> std::fmt::Result {
        write!(
            w,
            "{}",
            Utc::now()
                .with_timezone(&self.0)
                .format("%Y-%m-%dT%H:%M:%S%.3f%:z")
        )
    }
}

fn setup_tracing(format: LogFormat, verbose: bool, offset: FixedOffset) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if verbose {
            tracing_subscriber::EnvFilter::new("drawcap=debug,info")
        } else {
            tracing_subscriber::EnvFilter::new("drawcap=info,warn")
        }
    });

    match format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_writer(std::io::stderr)
                        .with_timer(OffsetTime(offset)),
                )
                .init();
        }
        LogFormat::Pretty => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(std::io::stderr)
                        .with_timer(OffsetTime(offset)),
                )
                .init();
        }
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn run_options(selection: Selection, audit: &AuditArgs, lock_ttl_secs: i64) -> RunOptions {
    RunOptions {
        lottery: selection.lottery,
        date: selection.date,
        thresholds: audit.thresholds(),
        lock_ttl: Duration::seconds(lock_ttl_secs),
    }
}

fn gate(any_critical: bool, audit: &AuditArgs) -> ExitCode {
    if any_critical && audit.fail_on_critical {
        ExitCode::from(2)
    } else {
        ExitCode::SUCCESS
    }
}

async fn dispatch(command: Commands, config: SyncConfig) -> Result<ExitCode> {
    match command {
        Commands::Run {
            selection,
            audit,
            lock_ttl_secs,
        } => {
            let pipeline = SyncPipeline::from_config(config).await?;
            let runs = pipeline
                .run_once(&run_options(selection, &audit, lock_ttl_secs))
                .await?;
            print_json(&runs)?;
            Ok(gate(runs.iter().any(|r| r.is_critical()), &audit))
        }
        Commands::Audit { selection, audit } => {
            let pipeline = SyncPipeline::from_config(config).await?;
            let reports = pipeline.audit(&run_options(selection, &audit, 0)).await?;
            let any_critical = reports.iter().any(|(r, _)| r.is_critical());
            let reports: Vec<_> = reports.into_iter().map(|(report, _)| report).collect();
            print_json(&reports)?;
            Ok(gate(any_critical, &audit))
        }
        Commands::Classify { lottery } => {
            let pipeline = SyncPipeline::from_config(config).await?;
            let tables = pipeline.classify(lottery.as_deref()).await?;
            print_json(&tables)?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Import {
            date,
            lottery,
            hour,
            lock_ttl_secs,
        } => {
            let pipeline = SyncPipeline::from_config(config).await?;
            match pipeline
                .import_slot(&lottery, date, hour, Duration::seconds(lock_ttl_secs))
                .await?
            {
                Some(verdict) => print_json(&verdict)?,
                None => eprintln!("lock held by another run for {lottery}; nothing imported"),
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Migrate => {
            drawcap_sync::migrate(&config).await?;
            println!("migrations applied");
            Ok(ExitCode::SUCCESS)
        }
        Commands::Watch {
            lottery,
            audit,
            lock_ttl_secs,
        } => {
            let pipeline = Arc::new(SyncPipeline::from_config(config).await?);
            let selection = Selection {
                date: None,
                lottery,
            };
            pipeline
                .watch(run_options(selection, &audit, lock_ttl_secs))
                .await?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let config = SyncConfig::from_env();
    let offset = FixedOffset::east_opt(config.tz_offset_minutes.saturating_mul(60))
        .unwrap_or_else(|| Utc.fix());
    setup_tracing(cli.log_format, cli.verbose, offset);

    let command = cli.command.unwrap_or(Commands::Run {
        selection: Selection {
            date: None,
            lottery: None,
        },
        audit: AuditArgs {
            warning_minutes: 20,
            critical_minutes: 60,
            fail_on_critical: false,
        },
        lock_ttl_secs: 600,
    });

    match dispatch(command, config).await {
        Ok(code) => code,
        Err(err) => {
            let reason = err
                .downcast_ref::<PipelineError>()
                .map(PipelineError::reason_code)
                .unwrap_or("error");
            tracing::error!(reason, error = %format!("{err:#}"), "drawcap failed");
            eprintln!(
                "{}",
                serde_json::json!({ "error": reason, "message": format!("{err:#}") })
            );
            ExitCode::FAILURE
        }
    }
}

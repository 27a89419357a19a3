use chrono::NaiveDate;
use drawcap_adapters::IngestError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("unknown lottery {0:?}")]
    UnknownLottery(String),
    #[error("refusing to ingest future date {requested} (today is {today})")]
    FutureDate { requested: NaiveDate, today: NaiveDate },
    #[error(transparent)]
    Ingest(#[from] IngestError),
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

impl PipelineError {
    /// Stable reason code for structured output.
    pub fn reason_code(&self) -> &'static str {
        match self {
            PipelineError::Validation(_) => "validation_error",
            PipelineError::UnknownLottery(_) => "unknown_lottery",
            PipelineError::FutureDate { .. } => "future_date",
            PipelineError::Ingest(err) => err.reason_code(),
            PipelineError::Store(_) => "store_error",
        }
    }
}

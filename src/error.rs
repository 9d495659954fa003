use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FrequencyError {
    #[error("unrecognised update frequency {0:?} (expected minutes, hourly, daily, monthly or an hour count)")]
    Unrecognised(String),
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("invalid browser configuration: {0}")]
    Config(String),

    #[error("browser launch failed: {0}")]
    Launch(String),
}

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error(transparent)]
    Frequency(#[from] FrequencyError),

    #[error("schedule store error: {0:#}")]
    Store(#[from] anyhow::Error),
}

/// Failures surfaced by the orchestrator. Each maps to one class of the
/// pipeline's error taxonomy so callers can tell scrape failures from
/// storage failures.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("browser session could not be acquired: {0}")]
    Acquisition(#[from] SessionError),

    #[error("navigation to {url} failed: {reason}")]
    Navigation { url: String, reason: String },

    #[error("{stage} timed out after {after:?}")]
    Timeout { stage: &'static str, after: Duration },

    #[error(transparent)]
    InvalidFrequency(#[from] FrequencyError),

    #[error("invalid url {url:?}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("monitored item {0} not found")]
    ItemNotFound(i64),

    #[error("record store error: {0:#}")]
    Store(#[from] anyhow::Error),

    #[error("schedule update failed: {0:#}")]
    Schedule(#[source] anyhow::Error),

    #[error("worker pool is shut down")]
    Shutdown,
}

impl From<ReconcileError> for RunError {
    fn from(e: ReconcileError) -> Self {
        match e {
            ReconcileError::Frequency(f) => RunError::InvalidFrequency(f),
            ReconcileError::Store(e) => RunError::Schedule(e),
        }
    }
}

impl RunError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, RunError::Timeout { .. })
    }
}

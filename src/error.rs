use std::time::Duration;

use thiserror::Error;

/// Errors surfaced by the scheduler and its submission API.
#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("Analysis provider failed: {0}")]
    Provider(#[from] ProviderError),

    #[error("Journal update failed: {0}")]
    Journal(String),

    #[error("Entry is already queued or being analyzed: {0}")]
    Duplicate(String),

    #[error("Queue is full")]
    QueueFull,

    #[error("Task was evicted to make room for newer work")]
    Evicted,

    #[error("Task was cancelled")]
    Cancelled,

    #[error("Analysis failed after {attempts} attempts: {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },

    #[error("Scheduler is busy, try again")]
    Busy,

    #[error("Scheduler has shut down")]
    ShutDown,

    #[error("{0}")]
    Other(String),
}

impl From<anyhow::Error> for SchedulerError {
    fn from(err: anyhow::Error) -> Self {
        SchedulerError::Other(format!("{:#}", err))
    }
}

/// Failures reported by an [`AnalysisProvider`](crate::AnalysisProvider).
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProviderError {
    #[error("network error: {0}")]
    Network(String),

    #[error("request timed out")]
    Timeout,

    #[error("rate limited")]
    RateLimited { retry_after: Option<Duration> },

    #[error("malformed response: {0}")]
    MalformedResponse(String),

    #[error("{0}")]
    Other(String),
}

impl ProviderError {
    /// Whether a retry has a chance of succeeding.
    ///
    /// `Other` covers configuration problems such as a rejected API key,
    /// which no amount of backoff fixes.
    pub fn is_transient(&self) -> bool {
        !matches!(self, ProviderError::Other(_))
    }
}

impl SchedulerError {
    /// Whether a failed execution should go back through retry.
    ///
    /// Journal write failures are retried along with transient provider
    /// failures; submission errors never reach the retry path.
    pub fn is_retryable(&self) -> bool {
        match self {
            SchedulerError::Provider(e) => e.is_transient(),
            SchedulerError::Journal(_) => true,
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, SchedulerError>;

//! # Journal Analysis Queue
//!
//! Asynchronous AI analysis scheduler for journaling applications.
//!
//! ## Features
//!
//! - Priority-based scheduling (High, Normal, Low) with per-entry deduplication
//! - Bounded queue that evicts the oldest Low task under pressure
//! - Concurrency cap and pause/resume
//! - Exponential-backoff retries that never hold a dispatch slot
//! - Deferred path: entries collected for a nightly (or forced) flush,
//!   sent in chunks of up to 10 per provider call and reconciled by position
//! - SQLite persistence with crash recovery and corruption-tolerant loads
//! - Token and cost estimates with running usage totals
//! - Progress and result events over a broadcast stream
//!
//! ## Quick Start
//!
//! 1. Implement [`AnalysisProvider`] for your AI backend and [`JournalStore`]
//!    for wherever analyses are written back
//! 2. Open a [`KeyValueStore`] such as [`SqliteStore`]
//! 3. Call [`Scheduler::start()`] with a [`SchedulerConfig`]
//! 4. Submit with [`Scheduler::queue_entry_analysis()`] and friends, then
//!    [`TaskHandle::wait()`] or watch [`Scheduler::subscribe()`]
//! 5. Call [`Scheduler::dispose()`] on shutdown

pub mod batch;
pub mod config;
pub mod cost;
pub mod db;
pub mod error;
pub mod events;
mod executor;
pub mod persistence;
pub mod queue;
pub mod retry;
pub mod scheduler;
pub mod types;

pub use config::{BatchConfig, CostConfig, SchedulerConfig, SchedulerConfigBuilder};
pub use cost::{CostEstimate, CostEstimator, UsageMetrics};
#[cfg(feature = "sqlite")]
pub use db::SqliteStore;
pub use db::{KeyValueStore, MemoryStore};
pub use error::{ProviderError, SchedulerError};
pub use events::{ProcessingProgress, ProgressPublisher, SchedulerEvent};
pub use retry::RetryPolicy;
pub use scheduler::{Scheduler, TaskHandle};
pub use types::{
    AnalysisPriority, AnalysisResult, AnalysisTask, BatchItemResult, BatchQueueItem, BatchResult,
    JournalEntry, QueueStatus, TaskKind, TaskOutput, TaskPayload,
};

use std::future::Future;

/// The AI backend that turns entries into analyses.
///
/// Errors should be classified honestly: everything except
/// [`ProviderError::Other`] is retried.
///
/// # Example
///
/// ```ignore
/// use journal_analysis_queue::*;
///
/// struct Claude { client: reqwest::Client }
///
/// impl AnalysisProvider for Claude {
///     async fn analyze_entry(
///         &self,
///         entry: &JournalEntry,
///     ) -> Result<AnalysisResult, ProviderError> {
///         // Call the model...
///         Ok(AnalysisResult::new(serde_json::json!({ "mood": "calm" })))
///     }
///     // ...
/// }
/// ```
pub trait AnalysisProvider: Send + Sync + 'static {
    /// Analyse a single entry.
    fn analyze_entry(
        &self,
        entry: &JournalEntry,
    ) -> impl Future<Output = Result<AnalysisResult, ProviderError>> + Send;

    /// Analyse several entries in one request.
    ///
    /// Results must come back in input order. A shorter response is
    /// tolerated; the unmatched entries are failed and retried.
    fn analyze_batch(
        &self,
        entries: &[JournalEntry],
    ) -> impl Future<Output = Result<Vec<AnalysisResult>, ProviderError>> + Send;

    /// Fold a new entry into the user's evolving core state.
    fn update_core(
        &self,
        entry: &JournalEntry,
        current_state: &serde_json::Value,
    ) -> impl Future<Output = Result<serde_json::Value, ProviderError>> + Send;
}

/// Where successful analyses are written back.
pub trait JournalStore: Send + Sync + 'static {
    /// Called once per successfully analysed entry.
    fn update_entry_with_analysis(
        &self,
        entry_id: &str,
        result: &AnalysisResult,
    ) -> impl Future<Output = anyhow::Result<()>> + Send;
}

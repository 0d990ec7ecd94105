use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use chrono::Utc;
use futures::FutureExt;
use tokio::sync::mpsc;

use crate::batch::{self, ChunkReport, ItemOutcome};
use crate::cost::CostEstimator;
use crate::error::{ProviderError, SchedulerError};
use crate::events::ProgressPublisher;
use crate::types::{
    AnalysisResult, AnalysisTask, BatchQueueItem, JournalEntry, TaskOutput, TaskPayload,
};
use crate::{AnalysisProvider, JournalStore};

/// Shared handles every execution needs.
pub(crate) struct ExecutionContext<P, J> {
    pub provider: Arc<P>,
    pub journal: Arc<J>,
    pub cost: Arc<CostEstimator>,
    pub publisher: ProgressPublisher,
}

impl<P, J> Clone for ExecutionContext<P, J> {
    fn clone(&self) -> Self {
        Self {
            provider: Arc::clone(&self.provider),
            journal: Arc::clone(&self.journal),
            cost: Arc::clone(&self.cost),
            publisher: self.publisher.clone(),
        }
    }
}

/// Result of one interactive execution, returned to the scheduling task.
#[derive(Debug)]
pub(crate) struct ExecutionReport {
    pub task: AnalysisTask,
    pub result: Result<TaskOutput, SchedulerError>,
}

/// Messages a running flush sends back to the scheduling task.
#[derive(Debug)]
pub(crate) enum FlushMessage {
    Chunk(ChunkReport),
    Finished { flush_id: String },
}

/// Run one interactive task to completion.
///
/// Never panics outward: a panicking provider or journal is reported as a
/// non-retryable failure of this task.
pub(crate) async fn execute_task<P, J>(
    ctx: ExecutionContext<P, J>,
    task: AnalysisTask,
) -> ExecutionReport
where
    P: AnalysisProvider,
    J: JournalStore,
{
    let result = AssertUnwindSafe(run_task(&ctx, &task))
        .catch_unwind()
        .await
        .unwrap_or_else(|_| {
            tracing::error!(task_id = %task.id, "analysis panicked");
            Err(SchedulerError::Provider(ProviderError::Other(
                "analysis panicked".to_string(),
            )))
        });
    ExecutionReport { task, result }
}

async fn run_task<P, J>(
    ctx: &ExecutionContext<P, J>,
    task: &AnalysisTask,
) -> Result<TaskOutput, SchedulerError>
where
    P: AnalysisProvider,
    J: JournalStore,
{
    let publisher = &ctx.publisher;
    publisher.progress(&task.id, 0.0);

    match &task.payload {
        TaskPayload::Entry { entry } => {
            let estimate = ctx.cost.estimate(entry.content.chars().count());
            let result = ctx.provider.analyze_entry(entry).await?;
            ctx.cost.record(&estimate);
            if result.is_empty() {
                return Err(ProviderError::MalformedResponse(format!(
                    "empty analysis for entry {}",
                    entry.id
                ))
                .into());
            }
            publisher.progress(&task.id, 50.0);

            write_back(ctx, &entry.id, &result).await?;
            publisher.progress(&task.id, 100.0);
            Ok(TaskOutput::Entry(result))
        }
        TaskPayload::Entries { entries } => {
            let chars = entries.iter().map(|e| e.content.chars().count()).sum();
            let estimate = ctx.cost.estimate_request(chars, entries.len());
            let results = ctx.provider.analyze_batch(entries).await?;
            ctx.cost.record(&estimate);
            if results.len() != entries.len() || results.iter().any(AnalysisResult::is_empty) {
                return Err(ProviderError::MalformedResponse(format!(
                    "expected {} analyses, got {} usable",
                    entries.len(),
                    results.iter().filter(|r| !r.is_empty()).count()
                ))
                .into());
            }
            publisher.progress(&task.id, 50.0);

            let total = entries.len() as f64;
            for (done, (entry, result)) in entries.iter().zip(&results).enumerate() {
                write_back(ctx, &entry.id, result).await?;
                publisher.progress(&task.id, 50.0 + 50.0 * (done + 1) as f64 / total);
            }
            Ok(TaskOutput::Batch(results))
        }
        TaskPayload::CoreUpdate {
            entry,
            current_state,
        } => {
            let chars = entry.content.chars().count() + current_state.to_string().chars().count();
            let estimate = ctx.cost.estimate(chars);
            let state = ctx.provider.update_core(entry, current_state).await?;
            ctx.cost.record(&estimate);
            publisher.progress(&task.id, 50.0);
            publisher.progress(&task.id, 100.0);
            Ok(TaskOutput::CoreState(state))
        }
    }
}

async fn write_back<P, J>(
    ctx: &ExecutionContext<P, J>,
    entry_id: &str,
    result: &AnalysisResult,
) -> Result<(), SchedulerError>
where
    J: JournalStore,
{
    ctx.journal
        .update_entry_with_analysis(entry_id, result)
        .await
        .map_err(|e| SchedulerError::Journal(format!("{}: {:#}", entry_id, e)))
}

/// Tracks per-item progress across all chunks of one flush.
///
/// Item `i` (1-based) reports `i / total * 100` once it lands, except the
/// last: the flush's closing 100% event stands in for it.
struct FlushProgress<'a> {
    publisher: &'a ProgressPublisher,
    flush_id: &'a str,
    done: usize,
    total: usize,
}

impl FlushProgress<'_> {
    fn advance(&mut self) {
        self.done += 1;
        if self.done < self.total {
            let pct = self.done as f64 / self.total as f64 * 100.0;
            self.publisher.progress(self.flush_id, pct);
        }
    }
}

/// Process every chunk of a flush in order, reporting each as it lands.
///
/// Always ends with [`FlushMessage::Finished`], even when a chunk panics,
/// so the scheduling task never waits on a dead flush.
pub(crate) async fn run_flush<P, J>(
    ctx: ExecutionContext<P, J>,
    flush_id: String,
    chunks: Vec<Vec<BatchQueueItem>>,
    reports: mpsc::UnboundedSender<FlushMessage>,
) where
    P: AnalysisProvider,
    J: JournalStore,
{
    let total = chunks.iter().map(Vec::len).sum();
    let mut progress = FlushProgress {
        publisher: &ctx.publisher,
        flush_id: &flush_id,
        done: 0,
        total,
    };
    progress.publisher.progress(&flush_id, 0.0);

    for chunk in chunks {
        let size = chunk.len();
        let fallback = chunk.clone();
        let report = match AssertUnwindSafe(process_chunk(&ctx, chunk, &mut progress))
            .catch_unwind()
            .await
        {
            Ok(report) => report,
            Err(_) => {
                tracing::error!(flush_id = %flush_id, size, "batch chunk panicked");
                panicked_chunk(fallback)
            }
        };
        if reports.send(FlushMessage::Chunk(report)).is_err() {
            tracing::warn!(flush_id = %flush_id, "scheduler gone, abandoning flush");
            return;
        }
    }

    ctx.publisher.progress(&flush_id, 100.0);
    ctx.publisher.forget(&flush_id);
    let _ = reports.send(FlushMessage::Finished { flush_id });
}

async fn process_chunk<P, J>(
    ctx: &ExecutionContext<P, J>,
    chunk: Vec<BatchQueueItem>,
    progress: &mut FlushProgress<'_>,
) -> ChunkReport
where
    P: AnalysisProvider,
    J: JournalStore,
{
    let batch_id = uuid::Uuid::new_v4().to_string();
    let entries: Vec<JournalEntry> = chunk.iter().map(|i| i.entry.clone()).collect();
    let chars = entries.iter().map(|e| e.content.chars().count()).sum();
    let estimate = ctx.cost.estimate_request(chars, entries.len());

    tracing::debug!(batch_id = %batch_id, items = entries.len(), "sending batch request");
    let response = ctx.provider.analyze_batch(&entries).await;
    if response.is_ok() {
        ctx.cost.record(&estimate);
    }
    let (mut outcomes, error) = batch::reconcile(&chunk, response);
    if let Some(error) = &error {
        tracing::warn!(batch_id = %batch_id, "batch request failed: {}", error);
    }

    for (item, outcome) in chunk.iter().zip(outcomes.iter_mut()) {
        if let Ok(result) = &outcome.result {
            if let Err(e) = write_back(ctx, &item.entry.id, result).await {
                *outcome = ItemOutcome::failure(e.to_string(), true);
            }
        }
        progress.advance();
    }

    ChunkReport {
        batch_id,
        processed_at: Utc::now(),
        items: chunk,
        outcomes,
        estimated_cost: estimate.estimated_cost,
        error,
    }
}

fn panicked_chunk(chunk: Vec<BatchQueueItem>) -> ChunkReport {
    let outcomes = chunk
        .iter()
        .map(|_| ItemOutcome::failure("batch processing panicked", false))
        .collect();
    ChunkReport {
        batch_id: uuid::Uuid::new_v4().to_string(),
        processed_at: Utc::now(),
        items: chunk,
        outcomes,
        estimated_cost: 0.0,
        error: Some("batch processing panicked".to_string()),
    }
}

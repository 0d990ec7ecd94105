use std::collections::{HashMap, HashSet, VecDeque};

use chrono::{DateTime, NaiveTime, TimeZone, Utc};

use crate::config::BatchConfig;
use crate::error::ProviderError;
use crate::persistence::PersistenceStore;
use crate::retry::{RetryDecision, RetryPolicy};
use crate::types::{
    AnalysisPriority, AnalysisResult, BatchItemResult, BatchQueueItem, BatchResult, JournalEntry,
};

/// Outcome of one item inside a provider batch call.
#[derive(Debug, Clone, PartialEq)]
pub struct ItemOutcome {
    pub result: Result<AnalysisResult, String>,
    /// Whether a failed item may be attempted again.
    pub retryable: bool,
}

impl ItemOutcome {
    pub fn success(result: AnalysisResult) -> Self {
        Self {
            result: Ok(result),
            retryable: false,
        }
    }

    pub fn failure(error: impl Into<String>, retryable: bool) -> Self {
        Self {
            result: Err(error.into()),
            retryable,
        }
    }
}

/// Everything a flush learned from one chunk, handed back to the collector.
#[derive(Debug, Clone)]
pub struct ChunkReport {
    pub batch_id: String,
    pub processed_at: DateTime<Utc>,
    /// The chunk as it was sent, in request order.
    pub items: Vec<BatchQueueItem>,
    /// One outcome per item, positionally aligned with `items`.
    pub outcomes: Vec<ItemOutcome>,
    pub estimated_cost: f64,
    /// Set when the provider call as a whole failed.
    pub error: Option<String>,
}

/// A deferred item that failed during a flush.
#[derive(Debug, Clone, PartialEq)]
pub struct DeferredFailure {
    pub item: BatchQueueItem,
    pub error: String,
    /// Failed attempts so far, including this one.
    pub attempts: u32,
    /// The item was dropped and will not be attempted again.
    pub terminal: bool,
}

/// What applying a [`ChunkReport`] changed.
#[derive(Debug, Clone)]
pub struct AppliedChunk {
    pub result: BatchResult,
    pub failures: Vec<DeferredFailure>,
    /// Entry ids that left the deferred list and can be released for dedup.
    pub released: Vec<String>,
}

/// A deferred item taken off the list by a cancel or clear.
#[derive(Debug, Clone, PartialEq)]
pub struct Withdrawn {
    pub item: BatchQueueItem,
    /// A running flush holds the item. Its entry stays claimed until the
    /// flush reports on it, and a failure there is not retried.
    pub in_flush: bool,
}

/// Match a provider batch response to the chunk it answers.
///
/// Results are matched by position. A response shorter than the chunk fails
/// the unmatched tail with a "missing response" error, and a `null` slot
/// counts as a malformed answer for that item. A failed call fails every
/// item with the provider's error.
pub fn reconcile(
    chunk: &[BatchQueueItem],
    response: Result<Vec<AnalysisResult>, ProviderError>,
) -> (Vec<ItemOutcome>, Option<String>) {
    let results = match response {
        Ok(results) => results,
        Err(e) => {
            let message = e.to_string();
            let retryable = e.is_transient();
            let outcomes = chunk
                .iter()
                .map(|_| ItemOutcome::failure(message.clone(), retryable))
                .collect();
            return (outcomes, Some(message));
        }
    };

    if results.len() > chunk.len() {
        tracing::warn!(
            expected = chunk.len(),
            received = results.len(),
            "provider returned more results than requested, ignoring the extra"
        );
    }

    let mut results = results.into_iter();
    let outcomes = chunk
        .iter()
        .map(|item| match results.next() {
            Some(result) if result.is_empty() => ItemOutcome::failure(
                format!("malformed response: empty analysis for entry {}", item.entry.id),
                true,
            ),
            Some(result) => ItemOutcome::success(result),
            None => ItemOutcome::failure(
                format!("missing response for entry {}", item.entry.id),
                true,
            ),
        })
        .collect();
    (outcomes, None)
}

/// The first occurrence of `at` strictly after `now`, in `now`'s timezone.
pub fn next_flush_after<Tz: TimeZone>(now: &DateTime<Tz>, at: NaiveTime) -> DateTime<Tz> {
    let today = now.date_naive().and_time(at);
    let candidate = if today > now.naive_local() {
        today
    } else {
        today + chrono::Duration::days(1)
    };
    // A local time swallowed by a DST gap falls back to 24h from now.
    now.timezone()
        .from_local_datetime(&candidate)
        .earliest()
        .unwrap_or_else(|| now.clone() + chrono::Duration::days(1))
}

/// Collects entries for the deferred path and applies flush outcomes.
///
/// The pending list is ordered by priority, then by insertion. Every
/// mutation writes a fresh snapshot, so the list survives a restart.
/// Items that belong to a running flush are marked. Withdrawing one takes it
/// off the list at once, but the flush still reports on it.
pub struct BatchCollector {
    config: BatchConfig,
    retry: RetryPolicy,
    pending: Vec<BatchQueueItem>,
    history: VecDeque<BatchResult>,
    /// Item ids snapshotted by the running flush.
    flushing: HashSet<String>,
    /// Flushing items withdrawn since, mapped to their entry ids.
    withdrawn: HashMap<String, String>,
    persistence: PersistenceStore,
}

impl BatchCollector {
    pub fn new(config: BatchConfig, persistence: PersistenceStore) -> Self {
        Self {
            retry: config.retry_policy(),
            config,
            pending: Vec::new(),
            history: VecDeque::new(),
            flushing: HashSet::new(),
            withdrawn: HashMap::new(),
            persistence,
        }
    }

    /// Load the persisted list and history, keeping only items `accept`
    /// agrees to. Returns the number of items restored.
    pub fn restore<F>(&mut self, mut accept: F) -> usize
    where
        F: FnMut(&BatchQueueItem) -> bool,
    {
        let loaded = self.persistence.load_pending();
        let total = loaded.len();
        for item in loaded {
            if accept(&item) {
                self.insert(item);
            } else {
                tracing::warn!(
                    entry_id = %item.entry.id,
                    "dropping duplicate deferred item on restore"
                );
            }
        }

        let mut history: VecDeque<BatchResult> = self.persistence.load_results().into();
        while history.len() > self.config.history_limit {
            history.pop_front();
        }
        self.history = history;

        if self.pending.len() != total {
            self.persist_pending();
        }
        self.pending.len()
    }

    /// Append an entry to the deferred list.
    pub fn add(&mut self, entry: JournalEntry, priority: AnalysisPriority) -> BatchQueueItem {
        let item = BatchQueueItem::new(entry, priority);
        self.insert(item.clone());
        self.persist_pending();
        item
    }

    pub fn pending(&self) -> &[BatchQueueItem] {
        &self.pending
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Completed batch results, oldest first.
    pub fn history(&self) -> Vec<BatchResult> {
        self.history.iter().cloned().collect()
    }

    /// Items eligible for a flush started at `now`.
    pub fn due_count(&self, now: DateTime<Utc>) -> usize {
        self.pending
            .iter()
            .filter(|i| !self.flushing.contains(&i.id) && i.is_due(now))
            .count()
    }

    pub fn should_auto_flush(&self, now: DateTime<Utc>) -> bool {
        self.config
            .auto_flush_threshold
            .is_some_and(|threshold| self.due_count(now) >= threshold)
    }

    /// Snapshot the due items into chunks of at most `max_batch_size` and
    /// mark them as flushing. Each item appears in at most one chunk.
    pub fn begin_flush(&mut self, now: DateTime<Utc>) -> Vec<Vec<BatchQueueItem>> {
        let due: Vec<BatchQueueItem> = self
            .pending
            .iter()
            .filter(|i| !self.flushing.contains(&i.id) && i.is_due(now))
            .cloned()
            .collect();
        self.flushing.extend(due.iter().map(|i| i.id.clone()));
        due.chunks(self.config.max_batch_size.max(1))
            .map(<[BatchQueueItem]>::to_vec)
            .collect()
    }

    /// Fold one chunk's outcomes into the list and history.
    ///
    /// Successful items leave the list. Failed items are re-queued behind
    /// their priority peers with an incremented retry count and a backoff,
    /// or dropped once the attempt budget is spent. Items withdrawn during
    /// the flush are only recorded and released.
    pub fn apply_report(&mut self, report: ChunkReport, now: DateTime<Utc>) -> AppliedChunk {
        let mut results = Vec::with_capacity(report.items.len());
        let mut failures = Vec::new();
        let mut released = Vec::new();

        for (item, outcome) in report.items.into_iter().zip(report.outcomes) {
            self.flushing.remove(&item.id);
            let was_withdrawn = self.withdrawn.remove(&item.id).is_some();
            let position = self.pending.iter().position(|p| p.id == item.id);

            let error = match outcome.result {
                Ok(result) => {
                    if let Some(idx) = position {
                        self.pending.remove(idx);
                    }
                    released.push(item.entry.id.clone());
                    results.push(BatchItemResult {
                        item_id: item.id,
                        entry_id: item.entry.id,
                        success: true,
                        result: Some(result),
                        error: None,
                    });
                    continue;
                }
                Err(error) => error,
            };

            results.push(BatchItemResult {
                item_id: item.id.clone(),
                entry_id: item.entry.id.clone(),
                success: false,
                result: None,
                error: Some(error.clone()),
            });

            let Some(idx) = position else {
                if was_withdrawn {
                    tracing::debug!(
                        entry_id = %item.entry.id,
                        "withdrawn item failed, not retrying"
                    );
                }
                released.push(item.entry.id);
                continue;
            };
            let mut current = self.pending.remove(idx);
            let attempts = current.retry_count + 1;
            current.last_error = Some(error.clone());

            let decision = if outcome.retryable {
                self.retry.decide(current.retry_count)
            } else {
                RetryDecision::Exhausted
            };

            match decision {
                RetryDecision::Retry { retry_count, delay } => {
                    let wait = chrono::Duration::from_std(delay)
                        .unwrap_or_else(|_| chrono::Duration::days(1));
                    current.retry_count = retry_count;
                    current.next_attempt_at =
                        Some(now.checked_add_signed(wait).unwrap_or(DateTime::<Utc>::MAX_UTC));
                    self.insert(current.clone());
                    failures.push(DeferredFailure {
                        item: current,
                        error,
                        attempts,
                        terminal: false,
                    });
                }
                RetryDecision::Exhausted => {
                    released.push(current.entry.id.clone());
                    failures.push(DeferredFailure {
                        item: current,
                        error,
                        attempts,
                        terminal: true,
                    });
                }
            }
        }

        let success_count = results.iter().filter(|r| r.success).count();
        let result = BatchResult {
            batch_id: report.batch_id,
            processed_at: report.processed_at,
            item_count: results.len(),
            success_count,
            failure_count: results.len() - success_count,
            results,
            total_estimated_cost: report.estimated_cost,
            error: report.error,
        };

        self.history.push_back(result.clone());
        while self.history.len() > self.config.history_limit {
            self.history.pop_front();
        }

        self.persist_pending();
        self.persistence.save_results(self.history.iter());

        AppliedChunk {
            result,
            failures,
            released,
        }
    }

    /// Unmark anything a finished flush did not report on.
    ///
    /// Returns the entry ids of withdrawn items the flush never reported,
    /// whose claims are now free.
    pub fn finish_flush(&mut self) -> Vec<String> {
        if !self.flushing.is_empty() {
            tracing::warn!(
                unreported = self.flushing.len(),
                "flush finished without reporting on every item"
            );
            self.flushing.clear();
        }
        self.withdrawn.drain().map(|(_, entry_id)| entry_id).collect()
    }

    /// Take the pending item for `entry_id` off the list.
    pub fn remove_entry(&mut self, entry_id: &str) -> Option<Withdrawn> {
        let idx = self.pending.iter().position(|i| i.entry.id == entry_id)?;
        let item = self.pending.remove(idx);
        self.persist_pending();
        Some(self.withdraw(item))
    }

    /// Take every item off the list.
    pub fn clear(&mut self) -> Vec<Withdrawn> {
        let items: Vec<BatchQueueItem> = self.pending.drain(..).collect();
        if !items.is_empty() {
            self.persist_pending();
        }
        items.into_iter().map(|item| self.withdraw(item)).collect()
    }

    /// Write the current list and history.
    pub fn persist(&self) {
        self.persist_pending();
        self.persistence.save_results(self.history.iter());
    }

    fn withdraw(&mut self, item: BatchQueueItem) -> Withdrawn {
        let in_flush = self.flushing.contains(&item.id);
        if in_flush {
            self.withdrawn.insert(item.id.clone(), item.entry.id.clone());
        }
        Withdrawn { item, in_flush }
    }

    fn persist_pending(&self) {
        self.persistence.save_pending(&self.pending);
    }

    /// Insert after every item of the same or higher priority.
    fn insert(&mut self, item: BatchQueueItem) {
        let tier = item.priority.tier();
        let idx = self
            .pending
            .iter()
            .position(|p| p.priority.tier() > tier)
            .unwrap_or(self.pending.len());
        self.pending.insert(idx, item);
    }
}

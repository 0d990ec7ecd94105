#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use journal_analysis_queue::*;
use serde_json::{json, Value};
use tokio::sync::broadcast;

/// Scriptable provider that records every call.
#[derive(Default)]
pub struct MockProvider {
    /// Entry ids of every call, in call order.
    calls: Mutex<Vec<Vec<String>>>,
    failing: Mutex<HashSet<String>>,
    fatal: Mutex<HashSet<String>>,
    short_by: Mutex<usize>,
    delay: Mutex<Duration>,
}

impl MockProvider {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Fail every request touching `entry_id` with a transient error. In a
    /// batch request only that entry's slot comes back empty.
    pub fn fail_entry(&self, entry_id: &str) {
        self.failing.lock().unwrap().insert(entry_id.to_string());
    }

    /// Stop failing requests for `entry_id`.
    pub fn recover_entry(&self, entry_id: &str) {
        self.failing.lock().unwrap().remove(entry_id);
    }

    /// Fail single-entry requests for `entry_id` with a non-transient error.
    pub fn reject_entry(&self, entry_id: &str) {
        self.fatal.lock().unwrap().insert(entry_id.to_string());
    }

    /// Drop the last `n` results from every batch response.
    pub fn truncate_batches_by(&self, n: usize) {
        *self.short_by.lock().unwrap() = n;
    }

    /// Make every call take `delay` (on the tokio clock).
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }

    pub fn calls(&self) -> Vec<Vec<String>> {
        self.calls.lock().unwrap().clone()
    }

    /// Entry ids in the order they were first sent.
    pub fn call_order(&self) -> Vec<String> {
        self.calls().into_iter().flatten().collect()
    }

    pub fn calls_for(&self, entry_id: &str) -> usize {
        self.calls()
            .iter()
            .filter(|ids| ids.iter().any(|id| id == entry_id))
            .count()
    }

    fn record(&self, ids: Vec<String>) {
        self.calls.lock().unwrap().push(ids);
    }

    async fn pause(&self) {
        let delay = *self.delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }

    fn analysis(entry: &JournalEntry) -> AnalysisResult {
        AnalysisResult::new(json!({ "entryId": entry.id, "mood": "reflective" }))
    }
}

impl AnalysisProvider for MockProvider {
    async fn analyze_entry(
        &self,
        entry: &JournalEntry,
    ) -> Result<AnalysisResult, ProviderError> {
        self.record(vec![entry.id.clone()]);
        self.pause().await;
        if self.fatal.lock().unwrap().contains(&entry.id) {
            return Err(ProviderError::Other("invalid api key".into()));
        }
        if self.failing.lock().unwrap().contains(&entry.id) {
            return Err(ProviderError::Network("connection reset".into()));
        }
        Ok(Self::analysis(entry))
    }

    async fn analyze_batch(
        &self,
        entries: &[JournalEntry],
    ) -> Result<Vec<AnalysisResult>, ProviderError> {
        self.record(entries.iter().map(|e| e.id.clone()).collect());
        self.pause().await;
        let failing = self.failing.lock().unwrap().clone();
        let mut results: Vec<AnalysisResult> = entries
            .iter()
            .map(|e| {
                if failing.contains(&e.id) {
                    AnalysisResult::new(Value::Null)
                } else {
                    Self::analysis(e)
                }
            })
            .collect();
        let short_by = *self.short_by.lock().unwrap();
        results.truncate(results.len().saturating_sub(short_by));
        Ok(results)
    }

    async fn update_core(
        &self,
        entry: &JournalEntry,
        current_state: &Value,
    ) -> Result<Value, ProviderError> {
        self.record(vec![entry.id.clone()]);
        self.pause().await;
        let seen = current_state["entries"].as_u64().unwrap_or(0);
        Ok(json!({ "entries": seen + 1, "last": entry.id }))
    }
}

/// Journal that remembers every write-back.
#[derive(Default)]
pub struct MockJournal {
    updates: Mutex<Vec<(String, AnalysisResult)>>,
}

impl MockJournal {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn updated_ids(&self) -> Vec<String> {
        self.updates
            .lock()
            .unwrap()
            .iter()
            .map(|(id, _)| id.clone())
            .collect()
    }
}

impl JournalStore for MockJournal {
    async fn update_entry_with_analysis(
        &self,
        entry_id: &str,
        result: &AnalysisResult,
    ) -> anyhow::Result<()> {
        self.updates
            .lock()
            .unwrap()
            .push((entry_id.to_string(), result.clone()));
        Ok(())
    }
}

pub fn entry(id: &str) -> JournalEntry {
    JournalEntry::new(id, format!("Dear diary, today was {}.", id))
}

/// Defaults with the nightly timer disarmed so paused-clock tests stay
/// deterministic.
pub fn test_config() -> SchedulerConfigBuilder {
    SchedulerConfig::builder().with_scheduled_flush(false)
}

pub fn start(
    config: SchedulerConfig,
    provider: &Arc<MockProvider>,
    journal: &Arc<MockJournal>,
) -> Scheduler {
    start_with_store(config, provider, journal, Arc::new(MemoryStore::new()))
}

pub fn start_with_store(
    config: SchedulerConfig,
    provider: &Arc<MockProvider>,
    journal: &Arc<MockJournal>,
    store: Arc<dyn KeyValueStore>,
) -> Scheduler {
    Scheduler::start(config, Arc::clone(provider), Arc::clone(journal), store).unwrap()
}

/// Every event currently buffered for `rx`.
pub fn drain(rx: &mut broadcast::Receiver<SchedulerEvent>) -> Vec<SchedulerEvent> {
    std::iter::from_fn(|| rx.try_recv().ok()).collect()
}

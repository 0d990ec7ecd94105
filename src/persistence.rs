use std::sync::Arc;

use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;

use crate::db::KeyValueStore;
use crate::types::{AnalysisTask, BatchQueueItem, BatchResult};

pub const TASKS_KEY: &str = "analysis_tasks";
pub const BATCH_QUEUE_KEY: &str = "analysis_batch_queue";
pub const BATCH_RESULTS_KEY: &str = "analysis_batch_results";

/// Typed snapshots of scheduler state over a [`KeyValueStore`].
///
/// Each snapshot is a JSON array stored under a fixed key. Writes are
/// best-effort: a failed write is logged and the in-memory state stays
/// authoritative. Loads decode record by record so one corrupted record
/// costs only itself.
#[derive(Clone)]
pub struct PersistenceStore {
    store: Arc<dyn KeyValueStore>,
}

impl PersistenceStore {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    pub fn save_tasks<'a>(&self, tasks: impl IntoIterator<Item = &'a AnalysisTask>) {
        self.save(TASKS_KEY, tasks.into_iter().collect::<Vec<_>>());
    }

    pub fn load_tasks(&self) -> Vec<AnalysisTask> {
        self.load(TASKS_KEY)
    }

    pub fn save_pending(&self, items: &[BatchQueueItem]) {
        self.save(BATCH_QUEUE_KEY, items);
    }

    pub fn load_pending(&self) -> Vec<BatchQueueItem> {
        self.load(BATCH_QUEUE_KEY)
    }

    pub fn save_results<'a>(&self, results: impl IntoIterator<Item = &'a BatchResult>) {
        self.save(BATCH_RESULTS_KEY, results.into_iter().collect::<Vec<_>>());
    }

    pub fn load_results(&self) -> Vec<BatchResult> {
        self.load(BATCH_RESULTS_KEY)
    }

    fn save<T: Serialize>(&self, key: &str, records: T) {
        let json = match serde_json::to_string(&records) {
            Ok(json) => json,
            Err(e) => {
                tracing::error!(key, "failed to serialize snapshot: {}", e);
                return;
            }
        };
        if let Err(e) = self.store.set(key, &json) {
            tracing::error!(key, "failed to persist snapshot: {:#}", e);
        }
    }

    fn load<T: DeserializeOwned>(&self, key: &str) -> Vec<T> {
        let raw = match self.store.get(key) {
            Ok(Some(raw)) => raw,
            Ok(None) => return Vec::new(),
            Err(e) => {
                tracing::error!(key, "failed to read snapshot: {:#}", e);
                return Vec::new();
            }
        };

        let records: Vec<Value> = match serde_json::from_str(&raw) {
            Ok(records) => records,
            Err(e) => {
                tracing::warn!(key, "discarding unreadable snapshot: {}", e);
                return Vec::new();
            }
        };

        let total = records.len();
        let decoded: Vec<T> = records
            .into_iter()
            .enumerate()
            .filter_map(|(index, record)| match serde_json::from_value(record) {
                Ok(item) => Some(item),
                Err(e) => {
                    tracing::warn!(key, index, "skipping corrupted record: {}", e);
                    None
                }
            })
            .collect();

        if decoded.len() < total {
            tracing::warn!(
                key,
                skipped = total - decoded.len(),
                loaded = decoded.len(),
                "snapshot contained corrupted records"
            );
        }
        decoded
    }
}

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A unit of user-authored content submitted for analysis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JournalEntry {
    pub id: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

impl JournalEntry {
    /// Create an entry stamped with the current time.
    pub fn new(id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            content: content.into(),
            created_at: Utc::now(),
        }
    }
}

/// Structured analysis returned by the provider for one entry.
///
/// The scheduler never looks inside; the JSON shape belongs to the provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AnalysisResult(pub serde_json::Value);

impl AnalysisResult {
    pub fn new(value: serde_json::Value) -> Self {
        Self(value)
    }

    /// A `null` slot in a batch response carries no analysis.
    pub fn is_empty(&self) -> bool {
        self.0.is_null()
    }
}

/// Priority levels for analysis work.
///
/// High dequeues before Normal, Normal before Low. Within the same
/// priority, work is processed in FIFO order.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AnalysisPriority {
    Low,
    #[default]
    Normal,
    High,
}

impl AnalysisPriority {
    /// Queue tier index: 0 for High, 1 for Normal, 2 for Low.
    pub fn tier(&self) -> usize {
        match self {
            AnalysisPriority::High => 0,
            AnalysisPriority::Normal => 1,
            AnalysisPriority::Low => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TaskKind {
    SingleEntry,
    BatchOfEntries,
    CoreUpdate,
}

/// What an interactive task carries to the provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum TaskPayload {
    Entry {
        entry: JournalEntry,
    },
    Entries {
        entries: Vec<JournalEntry>,
    },
    #[serde(rename_all = "camelCase")]
    CoreUpdate {
        entry: JournalEntry,
        current_state: serde_json::Value,
    },
}

/// One queued unit of interactive work.
///
/// The task itself is plain data so it can be snapshotted for crash
/// recovery; the result channel for the submitter is held by the scheduler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisTask {
    pub id: String,
    pub priority: AnalysisPriority,
    pub payload: TaskPayload,
    pub created_at: DateTime<Utc>,
    pub retry_count: u32,
    /// Wall-clock time a task waiting out a retry backoff becomes due.
    /// Survives a restart so the backoff is not cut short.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_attempt_at: Option<DateTime<Utc>>,
}

impl AnalysisTask {
    /// Create a new task with a generated UUID and Normal priority.
    pub fn new(payload: TaskPayload) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            priority: AnalysisPriority::Normal,
            payload,
            created_at: Utc::now(),
            retry_count: 0,
            next_attempt_at: None,
        }
    }

    /// Set the priority for this task (builder pattern).
    pub fn with_priority(mut self, priority: AnalysisPriority) -> Self {
        self.priority = priority;
        self
    }

    /// Set a custom ID for this task (builder pattern).
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn kind(&self) -> TaskKind {
        match self.payload {
            TaskPayload::Entry { .. } => TaskKind::SingleEntry,
            TaskPayload::Entries { .. } => TaskKind::BatchOfEntries,
            TaskPayload::CoreUpdate { .. } => TaskKind::CoreUpdate,
        }
    }

    /// Entries carried by this task, in submission order.
    pub fn entries(&self) -> Vec<&JournalEntry> {
        match &self.payload {
            TaskPayload::Entry { entry } | TaskPayload::CoreUpdate { entry, .. } => vec![entry],
            TaskPayload::Entries { entries } => entries.iter().collect(),
        }
    }

    /// Identities this task occupies in the in-flight set.
    ///
    /// Core updates use a separate namespace so that an analysis and a core
    /// update for the same entry do not block each other.
    pub fn dedup_keys(&self) -> Vec<String> {
        match &self.payload {
            TaskPayload::Entry { entry } => vec![entry.id.clone()],
            TaskPayload::Entries { entries } => entries.iter().map(|e| e.id.clone()).collect(),
            TaskPayload::CoreUpdate { entry, .. } => vec![core_update_key(&entry.id)],
        }
    }

    /// Whether this task carries the given entry.
    pub fn involves_entry(&self, entry_id: &str) -> bool {
        self.entries().iter().any(|e| e.id == entry_id)
    }
}

/// In-flight key for a core update of `entry_id`.
pub fn core_update_key(entry_id: &str) -> String {
    format!("core-update:{}", entry_id)
}

/// Successful outcome of an interactive task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "camelCase")]
pub enum TaskOutput {
    Entry(AnalysisResult),
    Batch(Vec<AnalysisResult>),
    CoreState(serde_json::Value),
}

/// One entry awaiting deferred processing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchQueueItem {
    pub id: String,
    pub entry: JournalEntry,
    pub enqueued_at: DateTime<Utc>,
    pub priority: AnalysisPriority,
    pub retry_count: u32,
    /// Earliest time a failed item may be picked up again.
    #[serde(default)]
    pub next_attempt_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_error: Option<String>,
}

impl BatchQueueItem {
    pub fn new(entry: JournalEntry, priority: AnalysisPriority) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            entry,
            enqueued_at: Utc::now(),
            priority,
            retry_count: 0,
            next_attempt_at: None,
            last_error: None,
        }
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.next_attempt_at.map_or(true, |at| at <= now)
    }
}

/// Per-item outcome inside a [`BatchResult`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchItemResult {
    pub item_id: String,
    pub entry_id: String,
    pub success: bool,
    pub result: Option<AnalysisResult>,
    pub error: Option<String>,
}

/// Outcome of one deferred provider call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchResult {
    pub batch_id: String,
    pub processed_at: DateTime<Utc>,
    pub item_count: usize,
    pub success_count: usize,
    pub failure_count: usize,
    pub results: Vec<BatchItemResult>,
    pub total_estimated_cost: f64,
    /// Set when the provider call itself failed.
    pub error: Option<String>,
}

/// Point-in-time view of the scheduler.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStatus {
    /// Interactive tasks waiting in the queue.
    pub pending_count: usize,
    /// Interactive tasks waiting out a retry backoff.
    pub retry_waiting_count: usize,
    /// Entries waiting for the deferred flush.
    pub deferred_count: usize,
    /// Interactive tasks currently executing.
    pub active_count: usize,
    pub next_scheduled_flush_time: Option<DateTime<Utc>>,
    /// True while anything is executing or a flush is running.
    pub is_processing: bool,
    pub is_paused: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_kind_follows_payload() {
        let entry = JournalEntry::new("e1", "today was fine");
        let single = AnalysisTask::new(TaskPayload::Entry {
            entry: entry.clone(),
        });
        assert_eq!(single.kind(), TaskKind::SingleEntry);
        assert_eq!(single.priority, AnalysisPriority::Normal);

        let core = AnalysisTask::new(TaskPayload::CoreUpdate {
            entry,
            current_state: serde_json::json!({}),
        });
        assert_eq!(core.kind(), TaskKind::CoreUpdate);
    }

    #[test]
    fn test_dedup_keys() {
        let batch = AnalysisTask::new(TaskPayload::Entries {
            entries: vec![JournalEntry::new("a", "x"), JournalEntry::new("b", "y")],
        });
        assert_eq!(batch.dedup_keys(), vec!["a".to_string(), "b".to_string()]);
        assert!(batch.involves_entry("b"));
        assert!(!batch.involves_entry("c"));

        let core = AnalysisTask::new(TaskPayload::CoreUpdate {
            entry: JournalEntry::new("a", "x"),
            current_state: serde_json::Value::Null,
        });
        assert_eq!(core.dedup_keys(), vec!["core-update:a".to_string()]);
        assert!(core.involves_entry("a"));
    }

    #[test]
    fn test_task_without_due_time_still_loads() {
        let task = AnalysisTask::new(TaskPayload::Entry {
            entry: JournalEntry::new("e1", "x"),
        });
        let mut json = serde_json::to_value(&task).unwrap();
        assert!(json.get("nextAttemptAt").is_none());

        json["nextAttemptAt"] = serde_json::json!("2024-01-01T00:00:05Z");
        let parked: AnalysisTask = serde_json::from_value(json).unwrap();
        assert_eq!(
            parked.next_attempt_at.map(|at| at.to_rfc3339()),
            Some("2024-01-01T00:00:05+00:00".to_string())
        );
    }

    #[test]
    fn test_batch_item_due() {
        let mut item = BatchQueueItem::new(JournalEntry::new("e1", "x"), AnalysisPriority::Low);
        let now = Utc::now();
        assert!(item.is_due(now));

        item.next_attempt_at = Some(now + chrono::Duration::minutes(5));
        assert!(!item.is_due(now));
        assert!(item.is_due(now + chrono::Duration::minutes(5)));
    }

    #[test]
    fn test_batch_item_tolerates_missing_optional_fields() {
        let json = serde_json::json!({
            "id": "i1",
            "entry": {"id": "e1", "content": "x", "createdAt": "2024-01-01T00:00:00Z"},
            "enqueuedAt": "2024-01-01T00:00:00Z",
            "priority": "high",
            "retryCount": 2
        });
        let item: BatchQueueItem = serde_json::from_value(json).unwrap();
        assert_eq!(item.retry_count, 2);
        assert_eq!(item.priority, AnalysisPriority::High);
        assert!(item.next_attempt_at.is_none());
    }
}

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::types::BatchResult;

/// Progress of one task or flush, 0 to 100.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessingProgress {
    pub task_id: String,
    pub progress: f64,
    pub timestamp: DateTime<Utc>,
}

/// Everything the scheduler tells its observers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SchedulerEvent {
    /// Emitted at execution checkpoints and per item during a flush.
    Progress(ProcessingProgress),

    /// Emitted when an interactive task finished successfully.
    #[serde(rename_all = "camelCase")]
    TaskCompleted {
        task_id: String,
        entry_ids: Vec<String>,
    },

    /// Emitted when a failed task is parked for a later retry.
    #[serde(rename_all = "camelCase")]
    TaskRetrying {
        task_id: String,
        retry_count: u32,
        delay_ms: u64,
        error: String,
    },

    /// Emitted once when a task fails terminally.
    #[serde(rename_all = "camelCase")]
    TaskFailed {
        task_id: String,
        entry_ids: Vec<String>,
        error: String,
    },

    #[serde(rename_all = "camelCase")]
    TaskCancelled { task_id: String },

    /// Emitted when a Low task is pushed out by capacity pressure.
    #[serde(rename_all = "camelCase")]
    TaskEvicted { task_id: String },

    /// Emitted once per chunk processed by a flush.
    BatchCompleted(BatchResult),

    /// Emitted when a deferred item fails; `terminal` items are dropped.
    #[serde(rename_all = "camelCase")]
    DeferredItemFailed {
        item_id: String,
        entry_id: String,
        /// Failed attempts so far, including this one.
        attempts: u32,
        error: String,
        terminal: bool,
    },
}

impl SchedulerEvent {
    /// The task this event concerns, if any.
    pub fn task_id(&self) -> Option<&str> {
        match self {
            SchedulerEvent::Progress(p) => Some(&p.task_id),
            SchedulerEvent::TaskCompleted { task_id, .. }
            | SchedulerEvent::TaskRetrying { task_id, .. }
            | SchedulerEvent::TaskFailed { task_id, .. }
            | SchedulerEvent::TaskCancelled { task_id }
            | SchedulerEvent::TaskEvicted { task_id } => Some(task_id),
            SchedulerEvent::BatchCompleted(_) | SchedulerEvent::DeferredItemFailed { .. } => None,
        }
    }

    /// Whether no further events will follow for this task.
    pub fn is_terminal_for_task(&self) -> bool {
        matches!(
            self,
            SchedulerEvent::TaskCompleted { .. }
                | SchedulerEvent::TaskFailed { .. }
                | SchedulerEvent::TaskCancelled { .. }
                | SchedulerEvent::TaskEvicted { .. }
        )
    }
}

/// Broadcasts [`SchedulerEvent`]s to any number of subscribers.
///
/// Publishing never blocks and never fails: with no subscribers the event
/// is dropped, and a slow subscriber only lags itself.
///
/// The publisher remembers the last progress value per task and drops
/// checkpoints that would not move it forward, so a retried task never
/// reports going backwards.
#[derive(Debug, Clone)]
pub struct ProgressPublisher {
    sender: broadcast::Sender<SchedulerEvent>,
    last_progress: Arc<Mutex<HashMap<String, f64>>>,
}

impl ProgressPublisher {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            last_progress: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SchedulerEvent> {
        self.sender.subscribe()
    }

    pub fn publish(&self, event: SchedulerEvent) {
        let _ = self.sender.send(event);
    }

    /// Publish a progress checkpoint, clamped to 0..=100.
    ///
    /// Returns false when the checkpoint was dropped for not exceeding the
    /// task's previous progress.
    pub fn progress(&self, task_id: &str, progress: f64) -> bool {
        let progress = progress.clamp(0.0, 100.0);
        if let Ok(mut last) = self.last_progress.lock() {
            match last.get(task_id) {
                Some(previous) if *previous >= progress => return false,
                _ => {
                    last.insert(task_id.to_string(), progress);
                }
            }
        }
        self.publish(SchedulerEvent::Progress(ProcessingProgress {
            task_id: task_id.to_string(),
            progress,
            timestamp: Utc::now(),
        }));
        true
    }

    /// Drop the progress record of a finished task.
    pub fn forget(&self, task_id: &str) {
        if let Ok(mut last) = self.last_progress.lock() {
            last.remove(task_id);
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_without_subscribers_is_noop() {
        let publisher = ProgressPublisher::new(8);
        publisher.progress("t1", 50.0);
        assert_eq!(publisher.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_independent_subscribers() {
        let publisher = ProgressPublisher::new(8);
        let mut a = publisher.subscribe();
        let mut b = publisher.subscribe();

        publisher.progress("t1", 0.0);
        publisher.progress("t1", 100.0);

        for rx in [&mut a, &mut b] {
            match rx.recv().await.unwrap() {
                SchedulerEvent::Progress(p) => assert_eq!(p.progress, 0.0),
                other => panic!("unexpected event {:?}", other),
            }
        }
        // Draining `a` does not consume from `b`.
        for rx in [&mut a, &mut b] {
            assert!(matches!(
                rx.recv().await.unwrap(),
                SchedulerEvent::Progress(p) if p.progress == 100.0
            ));
        }
    }

    #[test]
    fn test_progress_is_clamped() {
        let publisher = ProgressPublisher::new(8);
        let mut rx = publisher.subscribe();
        publisher.progress("t1", 140.0);
        match rx.try_recv().unwrap() {
            SchedulerEvent::Progress(p) => assert_eq!(p.progress, 100.0),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_progress_never_goes_backwards() {
        let publisher = ProgressPublisher::new(8);
        let mut rx = publisher.subscribe();

        assert!(publisher.progress("t1", 0.0));
        assert!(publisher.progress("t1", 50.0));
        // A retry starting over is swallowed until it passes the old mark.
        assert!(!publisher.progress("t1", 0.0));
        assert!(!publisher.progress("t1", 50.0));
        assert!(publisher.progress("t1", 100.0));

        let seen: Vec<f64> = std::iter::from_fn(|| rx.try_recv().ok())
            .filter_map(|e| match e {
                SchedulerEvent::Progress(p) => Some(p.progress),
                _ => None,
            })
            .collect();
        assert_eq!(seen, vec![0.0, 50.0, 100.0]);

        publisher.forget("t1");
        assert!(publisher.progress("t1", 0.0));
    }

    #[test]
    fn test_event_serializes_with_type_tag() {
        let event = SchedulerEvent::TaskCancelled {
            task_id: "t1".into(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "taskCancelled");
        assert_eq!(json["taskId"], "t1");
        assert!(event.is_terminal_for_task());
        assert_eq!(event.task_id(), Some("t1"));
    }
}

use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::Instant;

use crate::types::AnalysisTask;

/// Exponential backoff with an optional cap.
///
/// `delay = base * 2^(retry_count - 1)`, so the first retry waits `base`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries allowed after the first failure.
    pub max_retries: u32,
    pub base_delay: Duration,
    /// `None` leaves the backoff uncapped.
    pub max_delay: Option<Duration>,
}

/// What to do with a task that just failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    Retry { retry_count: u32, delay: Duration },
    Exhausted,
}

impl RetryPolicy {
    /// Interactive defaults: 3 retries, 1 s base, uncapped.
    pub fn interactive() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: None,
        }
    }

    /// Backoff before retry number `retry_count` (1-based).
    pub fn delay_for(&self, retry_count: u32) -> Duration {
        let exponent = retry_count.saturating_sub(1).min(31);
        let delay = self.base_delay.saturating_mul(1u32 << exponent);
        match self.max_delay {
            Some(cap) => delay.min(cap),
            None => delay,
        }
    }

    /// Decide the fate of a task that has been retried `retry_count` times
    /// and just failed again.
    pub fn decide(&self, retry_count: u32) -> RetryDecision {
        if retry_count < self.max_retries {
            let next = retry_count + 1;
            RetryDecision::Retry {
                retry_count: next,
                delay: self.delay_for(next),
            }
        } else {
            RetryDecision::Exhausted
        }
    }
}

/// Result of handing a failed task to the [`RetryManager`].
#[derive(Debug)]
pub enum RetryOutcome {
    /// The task is parked and will be handed back after `delay`.
    Scheduled { retry_count: u32, delay: Duration },
    /// The retry budget is spent; the task is returned to the caller.
    Exhausted(AnalysisTask),
}

#[derive(Debug)]
struct ParkedTask {
    task: AnalysisTask,
    due: Instant,
}

/// Parks failed interactive tasks until their backoff elapses.
///
/// Parking never holds a dispatch slot: the scheduler collects due tasks on
/// its tick and re-enqueues them as a separate event. Parked tasks can be
/// withdrawn, which is how a cancelled entry's pending retry is suppressed.
///
/// Due times are kept on the tokio clock and mirrored as a wall-clock
/// `next_attempt_at` on the task, which is what snapshots carry.
#[derive(Debug)]
pub struct RetryManager {
    policy: RetryPolicy,
    parked: Vec<ParkedTask>,
}

impl RetryManager {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            parked: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.parked.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parked.is_empty()
    }

    /// Handle a failure. Transient failures within budget are parked with
    /// an incremented retry count; everything else comes back as exhausted.
    pub fn on_failure(&mut self, mut task: AnalysisTask, transient: bool) -> RetryOutcome {
        if !transient {
            return RetryOutcome::Exhausted(task);
        }
        match self.policy.decide(task.retry_count) {
            RetryDecision::Retry { retry_count, delay } => {
                task.retry_count = retry_count;
                self.park(task, delay, Utc::now());
                RetryOutcome::Scheduled { retry_count, delay }
            }
            RetryDecision::Exhausted => RetryOutcome::Exhausted(task),
        }
    }

    /// Park a restored task until its persisted `next_attempt_at`.
    ///
    /// Returns the task untouched when it carries no due time or the due
    /// time has already passed; it can go straight back into the queue.
    pub fn resume_parked(
        &mut self,
        task: AnalysisTask,
        now: DateTime<Utc>,
    ) -> Option<AnalysisTask> {
        let remaining = match task.next_attempt_at {
            Some(at) if at > now => (at - now).to_std().unwrap_or_default(),
            _ => return Some(task),
        };
        tracing::debug!(
            task_id = %task.id,
            remaining_ms = remaining.as_millis() as u64,
            "restored task still waiting out its backoff"
        );
        self.parked.push(ParkedTask {
            task,
            due: Instant::now() + remaining,
        });
        None
    }

    /// Take every parked task whose backoff has elapsed, oldest due first.
    pub fn take_due(&mut self, now: Instant) -> Vec<AnalysisTask> {
        let (mut due, waiting): (Vec<_>, Vec<_>) =
            self.parked.drain(..).partition(|p| p.due <= now);
        self.parked = waiting;
        due.sort_by_key(|p| p.due);
        due.into_iter()
            .map(|p| {
                let mut task = p.task;
                task.next_attempt_at = None;
                task
            })
            .collect()
    }

    /// Withdraw parked tasks matching `predicate`.
    pub fn withdraw<F>(&mut self, mut predicate: F) -> Vec<AnalysisTask>
    where
        F: FnMut(&AnalysisTask) -> bool,
    {
        let (withdrawn, kept): (Vec<_>, Vec<_>) =
            self.parked.drain(..).partition(|p| predicate(&p.task));
        self.parked = kept;
        withdrawn.into_iter().map(|p| p.task).collect()
    }

    /// Parked tasks, for snapshots.
    pub fn iter(&self) -> impl Iterator<Item = &AnalysisTask> {
        self.parked.iter().map(|p| &p.task)
    }

    fn park(&mut self, mut task: AnalysisTask, delay: Duration, now: DateTime<Utc>) {
        let wait =
            chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::days(1));
        task.next_attempt_at =
            Some(now.checked_add_signed(wait).unwrap_or(DateTime::<Utc>::MAX_UTC));
        self.parked.push(ParkedTask {
            task,
            due: Instant::now() + delay,
        });
    }
}

use std::collections::{HashSet, VecDeque};

use crate::error::SchedulerError;
use crate::types::{AnalysisPriority, AnalysisTask};

/// In-memory priority queue of pending interactive tasks.
///
/// Three FIFO tiers (High, Normal, Low) give priority-then-insertion
/// ordering. The queue also owns the in-flight set: an entry identity is
/// claimed when its task is accepted and stays claimed while the task is
/// queued, dispatched or waiting out a retry. Deferred submissions claim
/// from the same set so both paths share one dedup view.
///
/// Capacity policy: when full, the oldest Low task is evicted to make room
/// for any new submission. With no Low task to evict, the new submission is
/// rejected with [`SchedulerError::QueueFull`].
#[derive(Debug)]
pub struct TaskQueue {
    tiers: [VecDeque<AnalysisTask>; 3],
    in_flight: HashSet<String>,
    capacity: usize,
}

impl TaskQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            tiers: Default::default(),
            in_flight: HashSet::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.tiers.iter().map(VecDeque::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.tiers.iter().all(VecDeque::is_empty)
    }

    pub fn is_in_flight(&self, key: &str) -> bool {
        self.in_flight.contains(key)
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    /// Claim all `keys`, or none of them if any is already claimed.
    pub fn claim(&mut self, keys: &[String]) -> bool {
        if keys.iter().any(|k| self.in_flight.contains(k)) {
            return false;
        }
        self.in_flight.extend(keys.iter().cloned());
        true
    }

    pub fn release(&mut self, keys: &[String]) {
        for key in keys {
            self.in_flight.remove(key);
        }
    }

    /// Accept a new submission.
    ///
    /// Returns the task evicted to make room, if any. A task whose entries
    /// are already in flight is rejected with [`SchedulerError::Duplicate`]
    /// and leaves the queue untouched.
    pub fn enqueue(
        &mut self,
        task: AnalysisTask,
    ) -> Result<Option<AnalysisTask>, SchedulerError> {
        let keys = task.dedup_keys();
        if let Some(dup) = keys.iter().find(|k| self.in_flight.contains(*k)) {
            return Err(SchedulerError::Duplicate(dup.clone()));
        }
        let evicted = self.make_room()?;
        self.in_flight.extend(keys);
        self.push(task);
        Ok(evicted)
    }

    /// Re-insert a task that already holds its in-flight claims (a retry
    /// whose backoff elapsed, or a task restored after restart).
    ///
    /// On rejection the claims are left in place; the caller decides
    /// whether to release them.
    pub fn requeue(
        &mut self,
        task: AnalysisTask,
    ) -> Result<Option<AnalysisTask>, (AnalysisTask, SchedulerError)> {
        match self.make_room() {
            Ok(evicted) => {
                self.push(task);
                Ok(evicted)
            }
            Err(e) => Err((task, e)),
        }
    }

    /// Remove and return the highest-priority, earliest-inserted task.
    ///
    /// The task keeps its in-flight claims; they are released when the task
    /// reaches a terminal state.
    pub fn dequeue(&mut self) -> Option<AnalysisTask> {
        self.tiers.iter_mut().find_map(VecDeque::pop_front)
    }

    /// Remove every task matching `predicate`, releasing its claims.
    pub fn remove<F>(&mut self, mut predicate: F) -> Vec<AnalysisTask>
    where
        F: FnMut(&AnalysisTask) -> bool,
    {
        let mut removed = Vec::new();
        for tier in &mut self.tiers {
            let mut kept = VecDeque::with_capacity(tier.len());
            for task in tier.drain(..) {
                if predicate(&task) {
                    removed.push(task);
                } else {
                    kept.push_back(task);
                }
            }
            *tier = kept;
        }
        for task in &removed {
            for key in task.dedup_keys() {
                self.in_flight.remove(&key);
            }
        }
        removed
    }

    /// Tasks in dequeue order.
    pub fn iter(&self) -> impl Iterator<Item = &AnalysisTask> {
        self.tiers.iter().flat_map(|tier| tier.iter())
    }

    fn push(&mut self, task: AnalysisTask) {
        self.tiers[task.priority.tier()].push_back(task);
    }

    fn make_room(&mut self) -> Result<Option<AnalysisTask>, SchedulerError> {
        if self.len() < self.capacity {
            return Ok(None);
        }
        match self.tiers[AnalysisPriority::Low.tier()].pop_front() {
            Some(evicted) => {
                for key in evicted.dedup_keys() {
                    self.in_flight.remove(&key);
                }
                Ok(Some(evicted))
            }
            None => Err(SchedulerError::QueueFull),
        }
    }
}

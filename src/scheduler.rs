use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Local, Utc};
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::{Id as ExecutionId, JoinError, JoinHandle, JoinSet};
use tokio::time::{Instant, MissedTickBehavior};

use crate::batch::{self, BatchCollector, Withdrawn};
use crate::config::SchedulerConfig;
use crate::cost::{CostEstimator, UsageMetrics};
use crate::db::KeyValueStore;
use crate::error::{Result, SchedulerError};
use crate::events::{ProcessingProgress, ProgressPublisher, SchedulerEvent};
use crate::executor::{self, ExecutionContext, ExecutionReport, FlushMessage};
use crate::persistence::PersistenceStore;
use crate::queue::TaskQueue;
use crate::retry::{RetryManager, RetryOutcome};
use crate::types::{
    AnalysisPriority, AnalysisTask, BatchQueueItem, BatchResult, JournalEntry, QueueStatus,
    TaskOutput, TaskPayload,
};
use crate::{AnalysisProvider, JournalStore};

type TaskOutcome = Result<TaskOutput>;
type FlushWaiter = oneshot::Sender<Result<Vec<BatchResult>>>;

enum Command {
    Submit {
        task: AnalysisTask,
        outcome: oneshot::Sender<TaskOutcome>,
        ack: oneshot::Sender<Result<()>>,
    },
    SubmitDeferred {
        entry: JournalEntry,
        priority: AnalysisPriority,
        ack: oneshot::Sender<Result<BatchQueueItem>>,
    },
    Cancel {
        entry_id: String,
        ack: oneshot::Sender<usize>,
    },
    Clear {
        ack: oneshot::Sender<usize>,
    },
    Flush {
        ack: FlushWaiter,
    },
    History {
        ack: oneshot::Sender<Vec<BatchResult>>,
    },
    Shutdown {
        ack: oneshot::Sender<()>,
    },
}

/// Handle to a submitted interactive task.
///
/// Holds the task's result channel and its own event subscription, which is
/// opened before the task is submitted so no progress is missed.
pub struct TaskHandle {
    task_id: String,
    outcome: oneshot::Receiver<TaskOutcome>,
    events: broadcast::Receiver<SchedulerEvent>,
    finished: bool,
}

impl TaskHandle {
    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    /// Next progress checkpoint for this task, or `None` once the task has
    /// reached a terminal state.
    pub async fn next_progress(&mut self) -> Option<ProcessingProgress> {
        while !self.finished {
            match self.events.recv().await {
                Ok(SchedulerEvent::Progress(p)) if p.task_id == self.task_id => return Some(p),
                Ok(event) => {
                    if event.is_terminal_for_task()
                        && event.task_id() == Some(self.task_id.as_str())
                    {
                        self.finished = true;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::debug!(task_id = %self.task_id, skipped, "progress subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => self.finished = true,
            }
        }
        None
    }

    /// Wait for the task's final outcome.
    pub async fn wait(self) -> Result<TaskOutput> {
        self.outcome.await.map_err(|_| SchedulerError::ShutDown)?
    }
}

/// The analysis scheduler.
///
/// A single background task owns all mutable scheduling state: the
/// interactive queue, parked retries, the deferred list and the in-flight
/// set. This handle talks to it over a bounded command channel, reads the
/// latest [`QueueStatus`] from a watch channel and hands out event
/// subscriptions. It is cheap to share behind an `Arc`.
pub struct Scheduler {
    commands: mpsc::Sender<Command>,
    publisher: ProgressPublisher,
    status: watch::Receiver<QueueStatus>,
    paused: Arc<AtomicBool>,
    cost: Arc<CostEstimator>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Scheduler {
    /// Restore persisted state and start the scheduling loop.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start<P, J>(
        config: SchedulerConfig,
        provider: Arc<P>,
        journal: Arc<J>,
        store: Arc<dyn KeyValueStore>,
    ) -> Result<Self>
    where
        P: AnalysisProvider,
        J: JournalStore,
    {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| SchedulerError::Other(format!("no tokio runtime: {}", e)))?;

        let (command_tx, command_rx) = mpsc::channel(config.command_buffer.max(1));
        let mut worker = Worker::new(config, provider, journal, store, command_rx);
        worker.restore();
        let first_flush = worker.schedule_next_flush();
        worker.publish_status();

        let publisher = worker.ctx.publisher.clone();
        let status = worker.status.subscribe();
        let paused = Arc::clone(&worker.paused);
        let cost = Arc::clone(&worker.ctx.cost);

        let handle = runtime.spawn(worker.run(first_flush));
        tracing::info!("analysis scheduler started");

        Ok(Self {
            commands: command_tx,
            publisher,
            status,
            paused,
            cost,
            worker: Mutex::new(Some(handle)),
        })
    }

    /// Queue one entry for immediate analysis.
    pub async fn queue_entry_analysis(
        &self,
        entry: JournalEntry,
        priority: AnalysisPriority,
    ) -> Result<TaskHandle> {
        let task = AnalysisTask::new(TaskPayload::Entry { entry }).with_priority(priority);
        self.submit(task).await
    }

    /// Queue several entries to be analysed in one provider call.
    pub async fn queue_batch_analysis(
        &self,
        entries: Vec<JournalEntry>,
        priority: AnalysisPriority,
    ) -> Result<TaskHandle> {
        if entries.is_empty() {
            return Err(SchedulerError::Other(
                "batch analysis needs at least one entry".to_string(),
            ));
        }
        let task = AnalysisTask::new(TaskPayload::Entries { entries }).with_priority(priority);
        self.submit(task).await
    }

    /// Queue an update of the user's core state from a new entry.
    pub async fn queue_core_updates(
        &self,
        entry: JournalEntry,
        current_state: Value,
    ) -> Result<TaskHandle> {
        let task = AnalysisTask::new(TaskPayload::CoreUpdate {
            entry,
            current_state,
        });
        self.submit(task).await
    }

    /// Add an entry to the deferred list for the next flush.
    pub async fn queue_deferred_analysis(
        &self,
        entry: JournalEntry,
        priority: AnalysisPriority,
    ) -> Result<BatchQueueItem> {
        let (ack, rx) = oneshot::channel();
        self.send(Command::SubmitDeferred {
            entry,
            priority,
            ack,
        })?;
        rx.await.map_err(|_| SchedulerError::ShutDown)?
    }

    /// Cancel all queued, retry-waiting and deferred work for an entry.
    ///
    /// Work that is already executing runs to completion but is not retried
    /// if it fails. Returns the number of tasks and deferred items removed.
    pub async fn cancel_entry_processing(&self, entry_id: &str) -> Result<usize> {
        let (ack, rx) = oneshot::channel();
        self.send(Command::Cancel {
            entry_id: entry_id.to_string(),
            ack,
        })?;
        rx.await.map_err(|_| SchedulerError::ShutDown)
    }

    /// Drop all queued, retry-waiting and deferred work.
    pub async fn clear_queue(&self) -> Result<usize> {
        let (ack, rx) = oneshot::channel();
        self.send(Command::Clear { ack })?;
        rx.await.map_err(|_| SchedulerError::ShutDown)
    }

    /// Flush the deferred list now and wait for every chunk's result.
    pub async fn force_flush(&self) -> Result<Vec<BatchResult>> {
        let (ack, rx) = oneshot::channel();
        self.send(Command::Flush { ack })?;
        rx.await.map_err(|_| SchedulerError::ShutDown)?
    }

    /// Recent batch results, oldest first.
    pub async fn batch_history(&self) -> Result<Vec<BatchResult>> {
        let (ack, rx) = oneshot::channel();
        self.send(Command::History { ack })?;
        rx.await.map_err(|_| SchedulerError::ShutDown)
    }

    /// Stop dispatching new work. Executions already running finish.
    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
        tracing::info!("scheduler paused");
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
        tracing::info!("scheduler resumed");
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub fn queue_status(&self) -> QueueStatus {
        let mut status = self.status.borrow().clone();
        status.is_paused = self.is_paused();
        status
    }

    /// Subscribe to every event the scheduler publishes.
    pub fn subscribe(&self) -> broadcast::Receiver<SchedulerEvent> {
        self.publisher.subscribe()
    }

    pub fn cost_metrics(&self) -> UsageMetrics {
        self.cost.metrics()
    }

    pub fn reset_cost_metrics(&self) {
        self.cost.reset();
    }

    /// Stop the scheduler.
    ///
    /// Waits for running executions and any running flush, persists the
    /// remaining state and fails outstanding handles with
    /// [`SchedulerError::ShutDown`]. Calling it again is a no-op.
    pub async fn dispose(&self) -> Result<()> {
        let (ack, rx) = oneshot::channel();
        if self.commands.send(Command::Shutdown { ack }).await.is_ok() {
            let _ = rx.await;
        }

        let handle = self
            .worker
            .lock()
            .map_err(|e| SchedulerError::Other(e.to_string()))?
            .take();
        if let Some(handle) = handle {
            handle
                .await
                .map_err(|e| SchedulerError::Other(format!("scheduler task failed: {}", e)))?;
        }
        Ok(())
    }

    async fn submit(&self, task: AnalysisTask) -> Result<TaskHandle> {
        let events = self.publisher.subscribe();
        let task_id = task.id.clone();
        let (outcome_tx, outcome_rx) = oneshot::channel();
        let (ack, rx) = oneshot::channel();
        self.send(Command::Submit {
            task,
            outcome: outcome_tx,
            ack,
        })?;
        rx.await.map_err(|_| SchedulerError::ShutDown)??;

        Ok(TaskHandle {
            task_id,
            outcome: outcome_rx,
            events,
            finished: false,
        })
    }

    fn send(&self, command: Command) -> Result<()> {
        self.commands.try_send(command).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SchedulerError::Busy,
            mpsc::error::TrySendError::Closed(_) => SchedulerError::ShutDown,
        })
    }
}

struct FlushRun {
    id: String,
    results: Vec<BatchResult>,
    waiters: Vec<FlushWaiter>,
}

/// The scheduling task. Sole owner of every piece of mutable state.
struct Worker<P, J> {
    config: SchedulerConfig,
    ctx: ExecutionContext<P, J>,
    persistence: PersistenceStore,
    queue: TaskQueue,
    retries: RetryManager,
    collector: BatchCollector,
    /// Result channels of accepted tasks, keyed by task id.
    outcomes: HashMap<String, oneshot::Sender<TaskOutcome>>,
    /// Tasks currently executing, kept for snapshots.
    dispatched: HashMap<String, AnalysisTask>,
    /// Executing tasks whose entry was cancelled; they are not retried.
    cancelled_running: HashSet<String>,
    running: JoinSet<ExecutionReport>,
    /// Task id behind each spawned execution, so an aborted one can be
    /// cleaned up.
    running_ids: HashMap<ExecutionId, String>,
    commands: mpsc::Receiver<Command>,
    commands_closed: bool,
    flush_tx: mpsc::UnboundedSender<FlushMessage>,
    flush_rx: mpsc::UnboundedReceiver<FlushMessage>,
    flush: Option<FlushRun>,
    /// Set when a flush was requested while another was running.
    rerun_waiters: Option<Vec<FlushWaiter>>,
    next_flush_at: Option<DateTime<Utc>>,
    paused: Arc<AtomicBool>,
    status: watch::Sender<QueueStatus>,
    shutting_down: bool,
    shutdown_waiters: Vec<oneshot::Sender<()>>,
}

impl<P, J> Worker<P, J>
where
    P: AnalysisProvider,
    J: JournalStore,
{
    fn new(
        config: SchedulerConfig,
        provider: Arc<P>,
        journal: Arc<J>,
        store: Arc<dyn KeyValueStore>,
        commands: mpsc::Receiver<Command>,
    ) -> Self {
        let (flush_tx, flush_rx) = mpsc::unbounded_channel();
        let (status, _) = watch::channel(QueueStatus::default());
        let persistence = PersistenceStore::new(store);

        Self {
            ctx: ExecutionContext {
                provider,
                journal,
                cost: Arc::new(CostEstimator::new(config.cost.clone())),
                publisher: ProgressPublisher::new(config.event_buffer),
            },
            queue: TaskQueue::new(config.queue_capacity),
            retries: RetryManager::new(config.retry.clone()),
            collector: BatchCollector::new(config.batch.clone(), persistence.clone()),
            persistence,
            outcomes: HashMap::new(),
            dispatched: HashMap::new(),
            cancelled_running: HashSet::new(),
            running: JoinSet::new(),
            running_ids: HashMap::new(),
            commands,
            commands_closed: false,
            flush_tx,
            flush_rx,
            flush: None,
            rerun_waiters: None,
            next_flush_at: None,
            paused: Arc::new(AtomicBool::new(false)),
            status,
            shutting_down: false,
            shutdown_waiters: Vec::new(),
            config,
        }
    }

    async fn run(mut self, first_flush: Instant) {
        let mut tick = tokio::time::interval(self.config.tick_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let flush_timer = tokio::time::sleep_until(first_flush);
        tokio::pin!(flush_timer);

        loop {
            tokio::select! {
                command = self.commands.recv(), if !self.commands_closed => match command {
                    Some(command) => self.handle_command(command),
                    None => {
                        // Every handle is gone.
                        self.commands_closed = true;
                        self.begin_shutdown(None);
                    }
                },
                Some(joined) = self.running.join_next_with_id(), if !self.running.is_empty() => {
                    self.on_execution_finished(joined);
                }
                Some(message) = self.flush_rx.recv() => self.on_flush_message(message),
                _ = tick.tick() => self.on_tick(),
                () = &mut flush_timer, if self.flush_timer_armed() => {
                    tracing::info!("scheduled flush time reached");
                    self.request_flush(Vec::new());
                    flush_timer.as_mut().reset(self.schedule_next_flush());
                }
            }

            self.publish_status();

            if self.shutting_down && self.running.is_empty() && self.flush.is_none() {
                self.finish_shutdown();
                break;
            }
        }
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            // Status is published before acking so a caller that reads it
            // right after the ack sees its own change.
            Command::Submit { task, outcome, ack } => {
                let result = self.submit(task, outcome);
                self.publish_status();
                let _ = ack.send(result);
            }
            Command::SubmitDeferred {
                entry,
                priority,
                ack,
            } => {
                let result = self.submit_deferred(entry, priority);
                self.publish_status();
                let _ = ack.send(result);
            }
            Command::Cancel { entry_id, ack } => {
                let removed = self.cancel_entry(&entry_id);
                self.publish_status();
                let _ = ack.send(removed);
            }
            Command::Clear { ack } => {
                let removed = self.clear();
                self.publish_status();
                let _ = ack.send(removed);
            }
            Command::Flush { ack } => {
                if self.shutting_down {
                    let _ = ack.send(Err(SchedulerError::ShutDown));
                } else {
                    self.request_flush(vec![ack]);
                }
            }
            Command::History { ack } => {
                let _ = ack.send(self.collector.history());
            }
            Command::Shutdown { ack } => self.begin_shutdown(Some(ack)),
        }
    }

    fn submit(&mut self, task: AnalysisTask, outcome: oneshot::Sender<TaskOutcome>) -> Result<()> {
        if self.shutting_down {
            return Err(SchedulerError::ShutDown);
        }
        let task_id = task.id.clone();
        let priority = task.priority;
        let kind = task.kind();

        let evicted = self.queue.enqueue(task)?;
        tracing::debug!(task_id = %task_id, ?priority, ?kind, "task queued");
        self.outcomes.insert(task_id, outcome);
        if let Some(evicted) = evicted {
            self.on_evicted(evicted);
        }
        self.persist_tasks();
        Ok(())
    }

    fn submit_deferred(
        &mut self,
        entry: JournalEntry,
        priority: AnalysisPriority,
    ) -> Result<BatchQueueItem> {
        if self.shutting_down {
            return Err(SchedulerError::ShutDown);
        }
        if !self.queue.claim(std::slice::from_ref(&entry.id)) {
            return Err(SchedulerError::Duplicate(entry.id));
        }
        let item = self.collector.add(entry, priority);
        tracing::debug!(entry_id = %item.entry.id, ?priority, "entry deferred");
        Ok(item)
    }

    fn cancel_entry(&mut self, entry_id: &str) -> usize {
        let mut cancelled = self.queue.remove(|t| t.involves_entry(entry_id));
        let withdrawn = self.retries.withdraw(|t| t.involves_entry(entry_id));
        for task in &withdrawn {
            self.queue.release(&task.dedup_keys());
        }
        cancelled.extend(withdrawn);

        for task in self.dispatched.values().filter(|t| t.involves_entry(entry_id)) {
            self.cancelled_running.insert(task.id.clone());
        }

        let mut count = cancelled.len();
        for task in cancelled {
            self.finish_cancelled(task);
        }
        if let Some(withdrawn) = self.collector.remove_entry(entry_id) {
            self.release_withdrawn(&withdrawn);
            count += 1;
        }

        if count > 0 {
            tracing::info!(entry_id, removed = count, "entry processing cancelled");
            self.persist_tasks();
        }
        count
    }

    fn clear(&mut self) -> usize {
        let mut cancelled = self.queue.remove(|_| true);
        let withdrawn = self.retries.withdraw(|_| true);
        for task in &withdrawn {
            self.queue.release(&task.dedup_keys());
        }
        cancelled.extend(withdrawn);
        self.cancelled_running.extend(self.dispatched.keys().cloned());

        let mut count = cancelled.len();
        for task in cancelled {
            self.finish_cancelled(task);
        }
        for withdrawn in self.collector.clear() {
            self.release_withdrawn(&withdrawn);
            count += 1;
        }

        tracing::info!(removed = count, "queue cleared");
        self.persist_tasks();
        count
    }

    /// A withdrawn deferred item keeps its claim while a flush holds it;
    /// the flush releases it when it reports.
    fn release_withdrawn(&mut self, withdrawn: &Withdrawn) {
        if !withdrawn.in_flush {
            self.queue.release(std::slice::from_ref(&withdrawn.item.entry.id));
        }
    }

    fn on_tick(&mut self) {
        let due = self.retries.take_due(Instant::now());
        let requeued = !due.is_empty();
        for task in due {
            self.requeue_retry(task);
        }

        if !self.shutting_down && !self.paused.load(Ordering::SeqCst) {
            if self.running.len() < self.config.max_concurrent {
                if let Some(task) = self.queue.dequeue() {
                    self.dispatch(task);
                }
            }
            if self.flush.is_none() && self.collector.should_auto_flush(Utc::now()) {
                tracing::info!("deferred list reached the auto-flush threshold");
                self.request_flush(Vec::new());
            }
        }

        if requeued {
            self.persist_tasks();
        }
    }

    fn dispatch(&mut self, task: AnalysisTask) {
        tracing::debug!(
            task_id = %task.id,
            kind = ?task.kind(),
            retry_count = task.retry_count,
            "dispatching task"
        );
        self.dispatched.insert(task.id.clone(), task.clone());
        let task_id = task.id.clone();
        let handle = self.running.spawn(executor::execute_task(self.ctx.clone(), task));
        self.running_ids.insert(handle.id(), task_id);
    }

    fn requeue_retry(&mut self, task: AnalysisTask) {
        match self.queue.requeue(task) {
            Ok(evicted) => {
                if let Some(evicted) = evicted {
                    self.on_evicted(evicted);
                }
            }
            Err((task, e)) => {
                tracing::warn!(task_id = %task.id, "retry could not be re-queued: {}", e);
                self.fail_task(task, e);
            }
        }
    }

    fn on_execution_finished(
        &mut self,
        joined: std::result::Result<(ExecutionId, ExecutionReport), JoinError>,
    ) {
        let ExecutionReport { task, result } = match joined {
            Ok((id, report)) => {
                self.running_ids.remove(&id);
                report
            }
            Err(e) => {
                self.on_execution_aborted(e);
                return;
            }
        };
        self.dispatched.remove(&task.id);
        let was_cancelled = self.cancelled_running.remove(&task.id);

        match result {
            Ok(output) => {
                tracing::info!(task_id = %task.id, kind = ?task.kind(), "task completed");
                self.queue.release(&task.dedup_keys());
                self.ctx.publisher.forget(&task.id);
                self.ctx.publisher.publish(SchedulerEvent::TaskCompleted {
                    task_id: task.id.clone(),
                    entry_ids: entry_ids(&task),
                });
                if let Some(outcome) = self.outcomes.remove(&task.id) {
                    let _ = outcome.send(Ok(output));
                }
            }
            Err(e) if was_cancelled => {
                tracing::debug!(task_id = %task.id, "cancelled task failed, not retrying: {}", e);
                self.queue.release(&task.dedup_keys());
                self.finish_cancelled(task);
            }
            Err(e) => self.on_execution_failed(task, e),
        }
        self.persist_tasks();
    }

    /// The execution future itself died, so no report came back. Fail the
    /// task without retrying.
    fn on_execution_aborted(&mut self, error: JoinError) {
        tracing::error!("analysis execution aborted: {}", error);
        let Some(task) = self
            .running_ids
            .remove(&error.id())
            .and_then(|task_id| self.dispatched.remove(&task_id))
        else {
            return;
        };
        self.cancelled_running.remove(&task.id);
        self.fail_task(
            task,
            SchedulerError::Other(format!("analysis execution aborted: {}", error)),
        );
        self.persist_tasks();
    }

    fn on_execution_failed(&mut self, task: AnalysisTask, error: SchedulerError) {
        let task_id = task.id.clone();
        let message = error.to_string();
        match self.retries.on_failure(task, error.is_retryable()) {
            RetryOutcome::Scheduled { retry_count, delay } => {
                tracing::warn!(
                    task_id = %task_id,
                    retry_count,
                    delay_ms = delay.as_millis() as u64,
                    "task failed, retrying: {}",
                    message
                );
                self.ctx.publisher.publish(SchedulerEvent::TaskRetrying {
                    task_id,
                    retry_count,
                    delay_ms: delay.as_millis() as u64,
                    error: message,
                });
            }
            RetryOutcome::Exhausted(task) => {
                let error = if error.is_retryable() {
                    SchedulerError::RetriesExhausted {
                        attempts: task.retry_count + 1,
                        last_error: message,
                    }
                } else {
                    error
                };
                self.fail_task(task, error);
            }
        }
    }

    /// Terminal failure: release the claims and notify the submitter.
    fn fail_task(&mut self, task: AnalysisTask, error: SchedulerError) {
        tracing::error!(task_id = %task.id, kind = ?task.kind(), "task failed: {}", error);
        self.queue.release(&task.dedup_keys());
        self.ctx.publisher.forget(&task.id);
        self.ctx.publisher.publish(SchedulerEvent::TaskFailed {
            task_id: task.id.clone(),
            entry_ids: entry_ids(&task),
            error: error.to_string(),
        });
        if let Some(outcome) = self.outcomes.remove(&task.id) {
            let _ = outcome.send(Err(error));
        }
    }

    fn finish_cancelled(&mut self, task: AnalysisTask) {
        tracing::debug!(task_id = %task.id, "task cancelled");
        self.ctx.publisher.forget(&task.id);
        self.ctx.publisher.publish(SchedulerEvent::TaskCancelled {
            task_id: task.id.clone(),
        });
        if let Some(outcome) = self.outcomes.remove(&task.id) {
            let _ = outcome.send(Err(SchedulerError::Cancelled));
        }
    }

    fn on_evicted(&mut self, task: AnalysisTask) {
        tracing::warn!(task_id = %task.id, "low priority task evicted, queue at capacity");
        self.ctx.publisher.forget(&task.id);
        self.ctx.publisher.publish(SchedulerEvent::TaskEvicted {
            task_id: task.id.clone(),
        });
        if let Some(outcome) = self.outcomes.remove(&task.id) {
            let _ = outcome.send(Err(SchedulerError::Evicted));
        }
    }

    /// Start a flush, or queue a rerun if one is already going.
    fn request_flush(&mut self, waiters: Vec<FlushWaiter>) {
        if self.flush.is_some() {
            self.rerun_waiters.get_or_insert_with(Vec::new).extend(waiters);
            return;
        }

        let chunks = self.collector.begin_flush(Utc::now());
        if chunks.is_empty() {
            tracing::debug!("nothing due for flush");
            for waiter in waiters {
                let _ = waiter.send(Ok(Vec::new()));
            }
            return;
        }

        let flush_id = format!("flush-{}", uuid::Uuid::new_v4());
        tracing::info!(
            flush_id = %flush_id,
            items = chunks.iter().map(Vec::len).sum::<usize>(),
            chunks = chunks.len(),
            "starting deferred flush"
        );
        self.flush = Some(FlushRun {
            id: flush_id.clone(),
            results: Vec::new(),
            waiters,
        });
        tokio::spawn(executor::run_flush(
            self.ctx.clone(),
            flush_id,
            chunks,
            self.flush_tx.clone(),
        ));
    }

    fn on_flush_message(&mut self, message: FlushMessage) {
        match message {
            FlushMessage::Chunk(report) => {
                let applied = self.collector.apply_report(report, Utc::now());
                self.queue.release(&applied.released);

                for failure in applied.failures {
                    if failure.terminal {
                        tracing::error!(
                            entry_id = %failure.item.entry.id,
                            attempts = failure.attempts,
                            "deferred analysis gave up: {}",
                            failure.error
                        );
                    } else {
                        tracing::warn!(
                            entry_id = %failure.item.entry.id,
                            attempts = failure.attempts,
                            "deferred analysis failed, will retry: {}",
                            failure.error
                        );
                    }
                    self.ctx.publisher.publish(SchedulerEvent::DeferredItemFailed {
                        item_id: failure.item.id,
                        entry_id: failure.item.entry.id,
                        attempts: failure.attempts,
                        error: failure.error,
                        terminal: failure.terminal,
                    });
                }

                tracing::info!(
                    batch_id = %applied.result.batch_id,
                    succeeded = applied.result.success_count,
                    failed = applied.result.failure_count,
                    "batch processed"
                );
                self.ctx
                    .publisher
                    .publish(SchedulerEvent::BatchCompleted(applied.result.clone()));
                if let Some(run) = self.flush.as_mut() {
                    run.results.push(applied.result);
                }
            }
            FlushMessage::Finished { flush_id } => {
                let unreported = self.collector.finish_flush();
                self.queue.release(&unreported);
                if let Some(run) = self.flush.take() {
                    tracing::info!(
                        flush_id = %run.id,
                        batches = run.results.len(),
                        "flush finished"
                    );
                    for waiter in run.waiters {
                        let _ = waiter.send(Ok(run.results.clone()));
                    }
                } else {
                    tracing::warn!(flush_id = %flush_id, "finish for unknown flush");
                }

                if let Some(waiters) = self.rerun_waiters.take() {
                    if self.shutting_down {
                        for waiter in waiters {
                            let _ = waiter.send(Err(SchedulerError::ShutDown));
                        }
                    } else {
                        self.request_flush(waiters);
                    }
                }
            }
        }
    }

    fn flush_timer_armed(&self) -> bool {
        self.config.batch.scheduled_flush && !self.shutting_down
    }

    /// Compute the next scheduled flush and return when it falls on the
    /// tokio clock.
    fn schedule_next_flush(&mut self) -> Instant {
        if !self.config.batch.scheduled_flush {
            self.next_flush_at = None;
            return Instant::now() + std::time::Duration::from_secs(24 * 60 * 60);
        }
        let now = Local::now();
        let next = batch::next_flush_after(&now, self.config.batch.flush_time);
        let wait = (next - now).to_std().unwrap_or_default();
        self.next_flush_at = Some(next.with_timezone(&Utc));
        tracing::debug!(next_flush = %next, "scheduled next deferred flush");
        Instant::now() + wait
    }

    fn restore(&mut self) {
        let tasks = self.persistence.load_tasks();
        let now = Utc::now();
        let mut restored = 0;
        for task in tasks {
            if !self.queue.claim(&task.dedup_keys()) {
                tracing::warn!(task_id = %task.id, "dropping duplicate task on restore");
                continue;
            }
            // Retries still inside their backoff go back to waiting.
            let Some(mut task) = self.retries.resume_parked(task, now) else {
                restored += 1;
                continue;
            };
            task.next_attempt_at = None;
            match self.queue.requeue(task) {
                Ok(evicted) => {
                    restored += 1;
                    if let Some(evicted) = evicted {
                        self.on_evicted(evicted);
                    }
                }
                Err((task, e)) => {
                    tracing::warn!(task_id = %task.id, "could not restore task: {}", e);
                    self.queue.release(&task.dedup_keys());
                }
            }
        }

        let queue = &mut self.queue;
        let deferred = self
            .collector
            .restore(|item| queue.claim(std::slice::from_ref(&item.entry.id)));

        if restored > 0 || deferred > 0 {
            tracing::info!(tasks = restored, deferred, "restored persisted work");
        }
        self.persist_tasks();
    }

    /// Snapshot every interactive task that has not reached a terminal
    /// state: executing first, then queued, then retry-waiting.
    fn persist_tasks(&self) {
        self.persistence.save_tasks(
            self.dispatched
                .values()
                .chain(self.queue.iter())
                .chain(self.retries.iter()),
        );
    }

    fn publish_status(&self) {
        self.status.send_replace(QueueStatus {
            pending_count: self.queue.len(),
            retry_waiting_count: self.retries.len(),
            deferred_count: self.collector.len(),
            active_count: self.running.len(),
            next_scheduled_flush_time: self.next_flush_at,
            is_processing: !self.running.is_empty() || self.flush.is_some(),
            is_paused: self.paused.load(Ordering::SeqCst),
        });
    }

    fn begin_shutdown(&mut self, ack: Option<oneshot::Sender<()>>) {
        self.shutdown_waiters.extend(ack);
        if self.shutting_down {
            return;
        }
        self.shutting_down = true;
        tracing::info!(
            active = self.running.len(),
            flushing = self.flush.is_some(),
            "scheduler shutting down"
        );
    }

    fn finish_shutdown(&mut self) {
        self.persist_tasks();
        self.collector.persist();

        for (_, outcome) in self.outcomes.drain() {
            let _ = outcome.send(Err(SchedulerError::ShutDown));
        }
        for waiter in self.rerun_waiters.take().unwrap_or_default() {
            let _ = waiter.send(Err(SchedulerError::ShutDown));
        }

        tracing::info!(
            queued = self.queue.len(),
            retry_waiting = self.retries.len(),
            deferred = self.collector.len(),
            "scheduler stopped"
        );
        for waiter in self.shutdown_waiters.drain(..) {
            let _ = waiter.send(());
        }
    }
}

fn entry_ids(task: &AnalysisTask) -> Vec<String> {
    task.entries().iter().map(|e| e.id.clone()).collect()
}

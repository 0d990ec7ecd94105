use std::time::Duration;

use chrono::NaiveTime;

use crate::retry::RetryPolicy;

/// Configuration for the scheduler.
///
/// Use [`SchedulerConfig::builder()`] for ergonomic construction, or
/// [`SchedulerConfig::default()`] for the production defaults (500 ms tick,
/// 3 concurrent dispatches, capacity 100, nightly deferred flush).
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// How often the scheduling loop checks for dispatchable work.
    pub tick_interval: Duration,

    /// Maximum number of interactive tasks executing at once.
    pub max_concurrent: usize,

    /// Hard capacity of the interactive task queue.
    pub queue_capacity: usize,

    /// Retry policy for interactive tasks.
    pub retry: RetryPolicy,

    /// Capacity of the producer command channel.
    pub command_buffer: usize,

    /// Capacity of the broadcast event channel.
    pub event_buffer: usize,

    /// Deferred batch path settings.
    pub batch: BatchConfig,

    /// Token and cost estimation settings.
    pub cost: CostConfig,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_millis(500),
            max_concurrent: 3,
            queue_capacity: 100,
            retry: RetryPolicy::interactive(),
            command_buffer: 256,
            event_buffer: 1024,
            batch: BatchConfig::default(),
            cost: CostConfig::default(),
        }
    }
}

impl SchedulerConfig {
    /// Start building a config with the builder pattern.
    pub fn builder() -> SchedulerConfigBuilder {
        SchedulerConfigBuilder::default()
    }
}

/// Settings for the deferred batch path.
#[derive(Debug, Clone)]
pub struct BatchConfig {
    /// Maximum number of entries combined into one provider call.
    pub max_batch_size: usize,

    /// Total failed attempts before a deferred item is dropped.
    pub max_retry_attempts: u32,

    /// Backoff base for deferred retries.
    pub retry_base_delay: Duration,

    /// Backoff cap for deferred retries.
    pub retry_max_delay: Duration,

    /// Local time of day at which the scheduled flush fires.
    pub flush_time: NaiveTime,

    /// Whether the daily flush timer is armed at all.
    pub scheduled_flush: bool,

    /// Number of batch results kept in history.
    pub history_limit: usize,

    /// Flush as soon as this many items are due (`None` = only on schedule or on demand).
    pub auto_flush_threshold: Option<usize>,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 10,
            max_retry_attempts: 3,
            retry_base_delay: Duration::from_secs(5 * 60),
            retry_max_delay: Duration::from_secs(2 * 60 * 60),
            flush_time: NaiveTime::MIN,
            scheduled_flush: true,
            history_limit: 50,
            auto_flush_threshold: None,
        }
    }
}

impl BatchConfig {
    /// The retry policy implied by these settings.
    ///
    /// `max_retry_attempts` counts failed attempts, so the item is retried
    /// one time fewer than that.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retry_attempts.saturating_sub(1),
            base_delay: self.retry_base_delay,
            max_delay: Some(self.retry_max_delay),
        }
    }
}

/// Rates used to turn entry sizes into token and cost estimates.
#[derive(Debug, Clone, PartialEq)]
pub struct CostConfig {
    pub chars_per_token: f64,
    /// Expected completion size of one analysis.
    pub output_tokens_per_request: u64,
    /// USD per million input tokens.
    pub input_cost_per_million: f64,
    /// USD per million output tokens.
    pub output_cost_per_million: f64,
}

impl Default for CostConfig {
    fn default() -> Self {
        Self {
            chars_per_token: 4.0,
            output_tokens_per_request: 800,
            input_cost_per_million: 3.0,
            output_cost_per_million: 15.0,
        }
    }
}

/// Builder for [`SchedulerConfig`].
#[derive(Default)]
pub struct SchedulerConfigBuilder {
    config: SchedulerConfig,
}

impl SchedulerConfigBuilder {
    /// Set the scheduling tick interval.
    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.config.tick_interval = interval;
        self
    }

    /// Set the maximum number of concurrent interactive executions.
    pub fn with_max_concurrent(mut self, max: usize) -> Self {
        self.config.max_concurrent = max.max(1);
        self
    }

    /// Set the interactive queue capacity.
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.config.queue_capacity = capacity.max(1);
        self
    }

    /// Set the interactive retry policy.
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.config.retry = policy;
        self
    }

    /// Set the producer command channel size.
    pub fn with_command_buffer(mut self, size: usize) -> Self {
        self.config.command_buffer = size.max(1);
        self
    }

    /// Set the broadcast event channel size.
    pub fn with_event_buffer(mut self, size: usize) -> Self {
        self.config.event_buffer = size.max(1);
        self
    }

    /// Replace the deferred batch settings.
    pub fn with_batch_config(mut self, batch: BatchConfig) -> Self {
        self.config.batch = batch;
        self
    }

    /// Set the maximum deferred chunk size.
    pub fn with_max_batch_size(mut self, size: usize) -> Self {
        self.config.batch.max_batch_size = size.max(1);
        self
    }

    /// Set the local time of day for the scheduled flush.
    pub fn with_flush_time(mut self, at: NaiveTime) -> Self {
        self.config.batch.flush_time = at;
        self
    }

    /// Arm or disarm the daily flush timer.
    pub fn with_scheduled_flush(mut self, enabled: bool) -> Self {
        self.config.batch.scheduled_flush = enabled;
        self
    }

    /// Flush as soon as `threshold` deferred items are due.
    pub fn with_auto_flush_threshold(mut self, threshold: Option<usize>) -> Self {
        self.config.batch.auto_flush_threshold = threshold.map(|n| n.max(1));
        self
    }

    /// Replace the cost estimation rates.
    pub fn with_cost_config(mut self, cost: CostConfig) -> Self {
        self.config.cost = cost;
        self
    }

    /// Build the final [`SchedulerConfig`].
    pub fn build(self) -> SchedulerConfig {
        self.config
    }
}

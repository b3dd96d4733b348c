//! Configuration for query splitting and adaptive shard batching
//!
//! All policy values are injected per call through these structs; the
//! engine keeps no process-wide mutable configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// One day in milliseconds, the default splitting chunk duration
pub const ONE_DAY_MS: i64 = 24 * 60 * 60 * 1000;

/// Configuration for time-range splitting and grouped execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SplitConfig {
    /// Ideal wall-clock duration of one sub-request chunk in milliseconds.
    /// Default: 1 day. Overridable per request.
    pub chunk_duration_ms: i64,

    /// Upper bound on the number of step-sized points a metric request may
    /// span; the effective step is raised until the requested range fits.
    /// Default: 11000.
    pub max_step_points: i64,

    /// Stop issuing further sub-requests once any sub-response reports an
    /// error, finishing the stream early as `Done` with the errors
    /// recorded. Default: false (record and continue).
    pub stop_on_response_errors: bool,

    /// Buffer size of the emitted response channel. Default: 16.
    pub channel_buffer_size: usize,
}

impl Default for SplitConfig {
    fn default() -> Self {
        Self {
            chunk_duration_ms: ONE_DAY_MS,
            max_step_points: 11_000,
            stop_on_response_errors: false,
            channel_buffer_size: 16,
        }
    }
}

impl SplitConfig {
    /// Set the chunk duration
    pub fn with_chunk_duration_ms(mut self, duration_ms: i64) -> Self {
        self.chunk_duration_ms = duration_ms;
        self
    }

    /// Stop the run early when a sub-response reports errors
    pub fn stopping_on_response_errors(mut self) -> Self {
        self.stop_on_response_errors = true;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.chunk_duration_ms <= 0 {
            return Err("chunk_duration_ms must be positive".to_string());
        }
        if self.max_step_points <= 0 {
            return Err("max_step_points must be positive".to_string());
        }
        if self.channel_buffer_size == 0 {
            return Err("channel_buffer_size must be at least 1".to_string());
        }
        Ok(())
    }
}

/// Configuration for adaptive shard-batch sizing
///
/// The runner compares each batch's reported execution time against a
/// target latency window and grows or shrinks the next batch accordingly:
///
/// ```text
///     0s ──────── fast ─────── low ════ window ════ high ─────── max ───▶
///        grow 50%     grow 10%      keep size        shrink 10%…50%
/// ```
///
/// The thresholds and factors are policy values calibrated against the
/// backend; override them rather than relying on the defaults generalizing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdaptiveSizeConfig {
    /// Size of the first shard batch. Default: 1.
    pub initial_batch_size: usize,

    /// Execution time (seconds) below which the batch size grows by
    /// `grow_fast_factor`. Default: 1.0.
    pub fast_secs: f64,

    /// Lower edge of the target window; below it the batch size grows by
    /// `grow_factor`. Default: 6.0.
    pub low_secs: f64,

    /// Upper edge of the target window; above it the batch size shrinks.
    /// Default: 10.0.
    pub high_secs: f64,

    /// Execution time at which the shrink reaches its maximum.
    /// Default: 20.0.
    pub max_secs: f64,

    /// Growth multiplier for very fast batches. Default: 1.5.
    pub grow_fast_factor: f64,

    /// Growth multiplier for moderately fast batches. Default: 1.1.
    pub grow_factor: f64,

    /// Minimum shrink fraction just above the window. Default: 0.1.
    pub shrink_min: f64,

    /// Maximum shrink fraction at or beyond `max_secs`. Default: 0.5.
    pub shrink_max: f64,

    /// Adjusted sizes are capped at this fraction of the not-yet-processed
    /// shard count. Default: 0.5.
    pub max_pending_fraction: f64,

    /// Delay before retrying a batch that failed with a transient error.
    /// Default: 1.5s.
    pub retry_backoff: Duration,

    /// Lowercase substrings identifying transient sub-response errors
    /// eligible for one retry. Default: "timeout", "timed out".
    pub retriable_patterns: Vec<String>,
}

impl Default for AdaptiveSizeConfig {
    fn default() -> Self {
        Self {
            initial_batch_size: 1,
            fast_secs: 1.0,
            low_secs: 6.0,
            high_secs: 10.0,
            max_secs: 20.0,
            grow_fast_factor: 1.5,
            grow_factor: 1.1,
            shrink_min: 0.1,
            shrink_max: 0.5,
            max_pending_fraction: 0.5,
            retry_backoff: Duration::from_millis(1500),
            retriable_patterns: vec!["timeout".to_string(), "timed out".to_string()],
        }
    }
}

impl AdaptiveSizeConfig {
    /// Set the initial batch size
    pub fn with_initial_batch_size(mut self, size: usize) -> Self {
        self.initial_batch_size = size.max(1);
        self
    }

    /// Set the retry backoff
    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    /// Replace the transient-error substrings
    pub fn with_retriable_patterns(mut self, patterns: Vec<String>) -> Self {
        self.retriable_patterns = patterns;
        self
    }

    /// Whether an error message matches a transient-condition signature
    pub fn is_retriable_message(&self, message: &str) -> bool {
        let lowered = message.to_lowercase();
        self.retriable_patterns
            .iter()
            .any(|pattern| lowered.contains(pattern))
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.initial_batch_size == 0 {
            return Err("initial_batch_size must be at least 1".to_string());
        }
        if self.fast_secs > self.low_secs {
            return Err("fast_secs must be <= low_secs".to_string());
        }
        if self.low_secs > self.high_secs {
            return Err("low_secs must be <= high_secs".to_string());
        }
        if self.high_secs >= self.max_secs {
            return Err("high_secs must be < max_secs".to_string());
        }
        if self.grow_fast_factor < 1.0 || self.grow_factor < 1.0 {
            return Err("growth factors must be >= 1.0".to_string());
        }
        if !(0.0..=1.0).contains(&self.shrink_min)
            || !(0.0..=1.0).contains(&self.shrink_max)
            || self.shrink_min > self.shrink_max
        {
            return Err("shrink fractions must satisfy 0 <= shrink_min <= shrink_max <= 1".to_string());
        }
        if !(0.0..=1.0).contains(&self.max_pending_fraction) {
            return Err("max_pending_fraction must be between 0.0 and 1.0".to_string());
        }
        Ok(())
    }
}

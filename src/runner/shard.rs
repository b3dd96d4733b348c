//! Shard-batch execution with adaptive batch sizing
//!
//! Specializes execution for targets whose stream selector is split by the
//! backend's shard label. Before anything is sent, the shard values are
//! resolved for the target's selector and time range; batches of shards
//! are then executed most-populated-first over the full range, one
//! sub-request at a time.
//!
//! The size of each batch is a feedback loop on the previous batch's
//! reported execution time: fast batches grow the next one, slow batches
//! shrink it, and a batch failing with a transient error is retried once
//! at `floor(sqrt(size))`. The trailing unsharded bucket always runs alone.

use crate::config::AdaptiveSizeConfig;
use crate::executor::{ShardValueSource, SubqueryExecutor};
use crate::merge::{combine_into, mark_failed, EXEC_TIME_STAT};
use crate::partition::{interpolate_shard_selector, next_shard_batch, sort_shard_values, SHARD_LABEL};
use crate::runner::stream::{CancelHandle, QueryStream};
use crate::telemetry::{ExecutedGroup, ExecutedPartitions, TrackEvent, TrackingSink};
use crate::types::{
    LoadingState, MergedResponse, QueryRequest, QueryResponse, ShardBatch, SubQuery, SubRequest,
};
use chrono::Utc;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

/// Per-run mutable sizing state, destroyed when the run completes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdaptiveSizeState {
    /// Size of the next batch to slice off the shard list
    pub current_batch_size: usize,

    /// Consecutive failed batches, reset on the first success
    pub consecutive_errors: u32,
}

impl AdaptiveSizeState {
    /// Initial state for a run
    pub fn new(initial_batch_size: usize) -> Self {
        Self {
            current_batch_size: initial_batch_size.max(1),
            consecutive_errors: 0,
        }
    }
}

/// Runner for shard-split targets
pub struct AdaptiveShardRunner<E: SubqueryExecutor, S: ShardValueSource> {
    executor: Arc<E>,
    shard_source: Arc<S>,
    adaptive: AdaptiveSizeConfig,
    channel_buffer_size: usize,
    tracker: Arc<dyn TrackingSink>,
}

impl<E: SubqueryExecutor, S: ShardValueSource> AdaptiveShardRunner<E, S> {
    /// Create a runner with a no-op tracking sink
    pub fn new(executor: Arc<E>, shard_source: Arc<S>, adaptive: AdaptiveSizeConfig) -> Self {
        Self {
            executor,
            shard_source,
            adaptive,
            channel_buffer_size: 16,
            tracker: Arc::new(crate::telemetry::NoopSink),
        }
    }

    /// Attach a tracking sink
    pub fn with_tracker(mut self, tracker: Arc<dyn TrackingSink>) -> Self {
        self.tracker = tracker;
        self
    }

    /// Set the emission channel capacity
    pub fn with_channel_buffer_size(mut self, size: usize) -> Self {
        self.channel_buffer_size = size.max(1);
        self
    }

    /// Execute the request's targets shard by shard
    pub fn run(&self, request: QueryRequest) -> QueryStream {
        let (stream, sender, cancel) = QueryStream::channel(self.channel_buffer_size);
        let executor = Arc::clone(&self.executor);
        let shard_source = Arc::clone(&self.shard_source);
        let tracker = Arc::clone(&self.tracker);
        let adaptive = self.adaptive.clone();

        tokio::spawn(async move {
            run_sharded(executor, shard_source, adaptive, tracker, request, sender, cancel).await;
        });

        stream
    }
}

enum GroupOutcome {
    Completed(Vec<ShardBatch>),
    Fatal(String),
    Cancelled,
}

async fn run_sharded<E: SubqueryExecutor, S: ShardValueSource>(
    executor: Arc<E>,
    shard_source: Arc<S>,
    adaptive: AdaptiveSizeConfig,
    tracker: Arc<dyn TrackingSink>,
    request: QueryRequest,
    sender: mpsc::Sender<MergedResponse>,
    cancel: CancelHandle,
) {
    let started_at = Utc::now();
    let mut merged = MergedResponse::new();
    let mut executed: Vec<ExecutedGroup> = Vec::with_capacity(request.targets.len());

    let targets = request.targets.clone();
    let mut fatal: Option<String> = None;

    for target in &targets {
        if cancel.is_cancelled() {
            return;
        }

        let shards = resolve_shards(&shard_source, target, &request, &cancel).await;
        let shards = match shards {
            ShardResolution::Resolved(list) => Some(list),
            ShardResolution::Unsharded => None,
            ShardResolution::Cancelled => return,
        };

        let outcome = run_group_batches(
            &executor,
            &adaptive,
            &request,
            target,
            shards,
            &mut merged,
            &sender,
            &cancel,
        )
        .await;

        match outcome {
            GroupOutcome::Completed(batches) => executed.push(ExecutedGroup {
                ref_ids: vec![target.ref_id.clone()],
                partitions: ExecutedPartitions::ShardBatches(batches),
            }),
            GroupOutcome::Fatal(message) => {
                fatal = Some(message);
                break;
            },
            GroupOutcome::Cancelled => return,
        }
    }

    match fatal {
        Some(message) => {
            error!(key = %merged.key, error = %message, "shard run failed");
            mark_failed(&mut merged, message);
        },
        None => merged.state = LoadingState::Done,
    }
    let _ = sender.send(merged.clone()).await;
    tracker.track(TrackEvent {
        response: &merged,
        groups: &executed,
        request: &request,
        started_at,
    });
}

enum ShardResolution {
    Resolved(Vec<String>),
    Unsharded,
    Cancelled,
}

/// Fetch and order the shard values for one target
///
/// The placeholder is stripped from the selector before the fetch; the
/// label-values endpoint sees the plain stream selector. A failed fetch
/// degrades to a single unsharded sub-request instead of failing the run.
async fn resolve_shards<S: ShardValueSource>(
    shard_source: &Arc<S>,
    target: &SubQuery,
    request: &QueryRequest,
    cancel: &CancelHandle,
) -> ShardResolution {
    let selector = interpolate_shard_selector(&target.expr, None);
    let fetched = tokio::select! {
        _ = cancel.cancelled() => return ShardResolution::Cancelled,
        fetched = shard_source.fetch_shard_values(SHARD_LABEL, &selector, request.range) => fetched,
    };

    match fetched {
        Ok(values) => {
            let sorted = sort_shard_values(values);
            // Only the unsharded bucket left means the backend does not
            // shard this selector; run the query as-is.
            if sorted.len() <= 1 {
                debug!(ref_id = %target.ref_id, "no shard values resolved, running unsharded");
                ShardResolution::Unsharded
            } else {
                debug!(
                    ref_id = %target.ref_id,
                    shards = sorted.len() - 1,
                    "resolved stream shards"
                );
                ShardResolution::Resolved(sorted)
            }
        },
        Err(err) => {
            warn!(
                ref_id = %target.ref_id,
                error = %err,
                "shard value fetch failed, running unsharded"
            );
            ShardResolution::Unsharded
        },
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_group_batches<E: SubqueryExecutor>(
    executor: &Arc<E>,
    adaptive: &AdaptiveSizeConfig,
    request: &QueryRequest,
    target: &SubQuery,
    shards: Option<Vec<String>>,
    merged: &mut MergedResponse,
    sender: &mpsc::Sender<MergedResponse>,
    cancel: &CancelHandle,
) -> GroupOutcome {
    let mut state = AdaptiveSizeState::new(adaptive.initial_batch_size);
    let mut cursor = 0usize;
    let mut retried = false;
    let mut batches: Vec<ShardBatch> = Vec::new();

    loop {
        if cancel.is_cancelled() {
            return GroupOutcome::Cancelled;
        }

        let batch = match &shards {
            Some(list) => match next_shard_batch(list, cursor, state.current_batch_size) {
                Some(batch) => Some(batch),
                None => break,
            },
            None => None,
        };

        let sub_request = SubRequest {
            range: request.range,
            interval_ms: request.interval_ms,
            targets: vec![SubQuery {
                expr: interpolate_shard_selector(&target.expr, batch.as_ref()),
                ..target.clone()
            }],
            request_id: request
                .request_id
                .as_ref()
                .map(|id| format!("{id}_shard_{cursor}")),
        };

        let result = tokio::select! {
            _ = cancel.cancelled() => return GroupOutcome::Cancelled,
            result = executor.run_subquery(sub_request) => result,
        };
        let response = match result {
            Ok(response) => response,
            Err(err) => return GroupOutcome::Fatal(err.to_string()),
        };

        if response.has_errors() {
            let retriable = response
                .error_messages()
                .iter()
                .any(|message| adaptive.is_retriable_message(message));
            let can_retry = batch.as_ref().is_some_and(|b| !b.is_unsharded());

            if retriable && !retried && can_retry {
                retried = true;
                state.consecutive_errors += 1;
                let shrunk = (state.current_batch_size as f64).sqrt().floor() as usize;
                state.current_batch_size = shrunk.max(1);
                warn!(
                    key = %merged.key,
                    retry_size = state.current_batch_size,
                    "transient sub-response error, retrying batch with shrunk size"
                );
                tokio::select! {
                    _ = cancel.cancelled() => return GroupOutcome::Cancelled,
                    _ = tokio::time::sleep(adaptive.retry_backoff) => {},
                }
                continue;
            }

            // Terminal for this batch: surface the errors and move on
            state.consecutive_errors += 1;
            warn!(
                key = %merged.key,
                consecutive_errors = state.consecutive_errors,
                "sub-response error surfaced without retry"
            );
        } else {
            state.consecutive_errors = 0;
        }
        retried = false;

        let succeeded = !response.has_errors();
        combine_into(merged, &response);
        if sender.send(merged.clone()).await.is_err() {
            return GroupOutcome::Cancelled;
        }

        match batch {
            None => {
                // Single unsharded sub-request covered the whole target
                batches.push(ShardBatch(Vec::new()));
                break;
            },
            Some(batch) => {
                cursor += batch.len();
                if succeeded && !batch.is_unsharded() {
                    let remaining = remaining_shards(shards.as_deref().unwrap_or(&[]), cursor);
                    let next = next_batch_size(adaptive, state.current_batch_size, &response, remaining);
                    if next != state.current_batch_size {
                        debug!(
                            previous = state.current_batch_size,
                            next,
                            remaining,
                            "adjusted shard batch size"
                        );
                    }
                    state.current_batch_size = next;
                }
                batches.push(batch);
            },
        }
    }

    GroupOutcome::Completed(batches)
}

/// Numeric shards not yet processed
fn remaining_shards(shards: &[String], cursor: usize) -> usize {
    shards
        .get(cursor..)
        .map(|rest| rest.iter().filter(|s| !s.is_empty()).count())
        .unwrap_or(0)
}

/// Reported backend execution time of a sub-response, in seconds
fn exec_time_secs(response: &QueryResponse) -> Option<f64> {
    response
        .data
        .first()?
        .meta
        .stats
        .iter()
        .find(|stat| stat.display_name == EXEC_TIME_STAT)
        .map(|stat| stat.value)
}

/// Derive the next batch size from the previous batch's outcome
///
/// Execution time inside the target window keeps the size; below it the
/// size grows, above it the shrink scales with how far past the window the
/// batch ran. Adjusted sizes are capped at the configured fraction of the
/// unprocessed shard count. An empty response grows the size by one; a
/// response without the exec-time stat keeps the size unchanged.
fn next_batch_size(
    config: &AdaptiveSizeConfig,
    current: usize,
    response: &QueryResponse,
    remaining: usize,
) -> usize {
    // Growth always gains at least one shard, so small sizes cannot get
    // stuck below a factor's rounding threshold.
    let grown = |factor: f64| ((current as f64 * factor).round() as usize).max(current + 1);

    let adjusted = if response.data.is_empty() {
        current + 1
    } else {
        match exec_time_secs(response) {
            None => return current,
            Some(t) if t <= config.fast_secs => grown(config.grow_fast_factor),
            Some(t) if t < config.low_secs => grown(config.grow_factor),
            Some(t) if t <= config.high_secs => return current,
            Some(t) => {
                let over = ((t - config.high_secs) / (config.max_secs - config.high_secs))
                    .clamp(0.0, 1.0);
                let shrink = config.shrink_min + (config.shrink_max - config.shrink_min) * over;
                (current as f64 * (1.0 - shrink)).round() as usize
            },
        }
    };

    let cap = ((remaining as f64) * config.max_pending_fraction).floor() as usize;
    adjusted.clamp(1, cap.max(1))
}

// ============================================================================
// Tests
// ============================================================================

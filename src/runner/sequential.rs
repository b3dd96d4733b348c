//! Sequential execution of grouped sub-requests
//!
//! Drives one or more [`QueryGroup`]s — logs, metrics, instant — through
//! the executor, one sub-request at a time, newest partition first.
//! Groups are interleaved round-robin at the same depth-from-the-end so
//! queries that belong together (a logs group and a metrics group covering
//! the same wall-clock slice) are dispatched in close succession, while
//! every group still finishes with its oldest slice.

use crate::config::SplitConfig;
use crate::executor::SubqueryExecutor;
use crate::merge::{combine_into, mark_failed};
use crate::runner::stream::{CancelHandle, QueryStream};
use crate::telemetry::{ExecutedGroup, ExecutedPartitions, TrackEvent, TrackingSink};
use crate::types::{LoadingState, MergedResponse, QueryGroup, QueryRequest, SubQuery, SubRequest};
use chrono::Utc;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

/// Runner for range-partitioned query groups
pub struct SequentialGroupRunner<E: SubqueryExecutor> {
    executor: Arc<E>,
    config: SplitConfig,
    tracker: Arc<dyn TrackingSink>,
}

impl<E: SubqueryExecutor> SequentialGroupRunner<E> {
    /// Create a runner with a no-op tracking sink
    pub fn new(executor: Arc<E>, config: SplitConfig) -> Self {
        Self {
            executor,
            config,
            tracker: Arc::new(crate::telemetry::NoopSink),
        }
    }

    /// Attach a tracking sink
    pub fn with_tracker(mut self, tracker: Arc<dyn TrackingSink>) -> Self {
        self.tracker = tracker;
        self
    }

    /// Execute the groups, returning a cancelable stream of snapshots
    ///
    /// The stream yields the merged response after every sub-request and
    /// completes once the terminal snapshot (`Done` or `Error`) has been
    /// emitted.
    pub fn run(&self, request: QueryRequest, groups: Vec<QueryGroup>) -> QueryStream {
        let (stream, sender, cancel) = QueryStream::channel(self.config.channel_buffer_size);
        let executor = Arc::clone(&self.executor);
        let tracker = Arc::clone(&self.tracker);
        let config = self.config.clone();

        tokio::spawn(async move {
            run_groups(executor, config, tracker, request, groups, sender, cancel).await;
        });

        stream
    }
}

async fn run_groups<E: SubqueryExecutor>(
    executor: Arc<E>,
    config: SplitConfig,
    tracker: Arc<dyn TrackingSink>,
    request: QueryRequest,
    groups: Vec<QueryGroup>,
    sender: mpsc::Sender<MergedResponse>,
    cancel: CancelHandle,
) {
    let started_at = Utc::now();
    let mut merged = MergedResponse::new();

    let executed: Vec<ExecutedGroup> = groups
        .iter()
        .map(|group| ExecutedGroup {
            ref_ids: group.targets.iter().map(|t| t.ref_id.clone()).collect(),
            partitions: ExecutedPartitions::TimeRanges(group.partition.clone()),
        })
        .collect();

    let track = |response: &MergedResponse| {
        tracker.track(TrackEvent {
            response,
            groups: &executed,
            request: &request,
            started_at,
        });
    };

    let total = groups.iter().map(|g| g.partition.len()).max().unwrap_or(0);
    if total == 0 {
        merged.state = LoadingState::Done;
        let _ = sender.send(merged.clone()).await;
        track(&merged);
        return;
    }

    let mut request_n = total;
    let mut group_idx = groups
        .iter()
        .position(|g| g.partition.len() == total)
        .unwrap_or(0);

    loop {
        if cancel.is_cancelled() {
            debug!(key = %merged.key, "run cancelled, stopping before next sub-request");
            return;
        }

        let group = &groups[group_idx];
        let targets = adjust_targets(&group.targets, &merged);

        if targets.is_empty() {
            debug!(
                group = group_idx,
                "all targets exhausted their line limits, skipping group"
            );
        } else {
            let sub_request = SubRequest {
                range: group.partition[request_n - 1],
                interval_ms: request.interval_ms,
                targets,
                request_id: request
                    .request_id
                    .as_ref()
                    .map(|id| format!("{id}_{request_n}")),
            };

            let result = tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(key = %merged.key, "run cancelled, aborting in-flight sub-request");
                    return;
                },
                result = executor.run_subquery(sub_request) => result,
            };

            let response = match result {
                Ok(response) => response,
                Err(err) => {
                    error!(key = %merged.key, error = %err, "sub-request transport failure");
                    mark_failed(&mut merged, err.to_string());
                    let _ = sender.send(merged.clone()).await;
                    track(&merged);
                    return;
                },
            };

            let had_errors = response.has_errors();
            if had_errors {
                warn!(
                    key = %merged.key,
                    group = group_idx,
                    "sub-response reported errors"
                );
            }
            combine_into(&mut merged, &response);
            if sender.send(merged.clone()).await.is_err() {
                return;
            }
            if had_errors && config.stop_on_response_errors {
                break;
            }
        }

        match next_request_pointers(&groups, group_idx, request_n) {
            Some((next_group, next_n)) => {
                group_idx = next_group;
                request_n = next_n;
            },
            None => break,
        }
    }

    merged.state = LoadingState::Done;
    let _ = sender.send(merged.clone()).await;
    track(&merged);
}

/// Advance the execution cursor across groups and depths
///
/// Prefers a later group holding a partition at the current depth before
/// stepping one partition older and wrapping to the first group deep
/// enough. Returns `None` once every group is exhausted.
pub fn next_request_pointers(
    groups: &[QueryGroup],
    group_idx: usize,
    request_n: usize,
) -> Option<(usize, usize)> {
    for idx in group_idx + 1..groups.len() {
        if groups[idx].partition.len() >= request_n {
            return Some((idx, request_n));
        }
    }
    if request_n <= 1 {
        return None;
    }
    let next_n = request_n - 1;
    groups
        .iter()
        .position(|group| group.partition.len() >= next_n)
        .map(|idx| (idx, next_n))
}

/// Shrink per-target line limits by what has already been received
///
/// Logs targets whose remaining limit reaches zero are dropped from the
/// sub-request entirely. Non-logs targets and targets without a limit
/// pass through unchanged.
pub fn adjust_targets(targets: &[SubQuery], merged: &MergedResponse) -> Vec<SubQuery> {
    targets
        .iter()
        .filter_map(|target| {
            let max_lines = match target.max_lines {
                Some(max) if target.is_logs() => max,
                _ => return Some(target.clone()),
            };
            let received = merged.lines_for_ref_id(&target.ref_id);
            let remaining = max_lines.saturating_sub(received);
            if remaining == 0 {
                debug!(ref_id = %target.ref_id, "target reached its line limit");
                return None;
            }
            Some(SubQuery {
                max_lines: Some(remaining),
                ..target.clone()
            })
        })
        .collect()
}

// ============================================================================
// Tests
// ============================================================================

//! Integration tests for shard-adaptive execution
//!
//! These tests drive the shard runner through mock executor and shard
//! sources, verifying batch construction, selector interpolation, the
//! latency feedback loop, the bounded retry policy and terminal tracking.

use parking_lot::Mutex;
use querysplit::config::AdaptiveSizeConfig;
use querysplit::error::{Result, SplitError};
use querysplit::merge::EXEC_TIME_STAT;
use querysplit::runner::AdaptiveShardRunner;
use querysplit::telemetry::RecordingSink;
use querysplit::types::{
    Field, FieldValues, Frame, FrameMeta, FrameType, LoadingState, QueryKind, QueryRequest,
    QueryResponse, ResponseError, StatItem, SubQuery, SubRequest, TimeRange,
};
use querysplit::{ShardValueSource, SubqueryExecutor};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

// =============================================================================
// Helpers
// =============================================================================

struct MockExecutor {
    requests: Mutex<Vec<SubRequest>>,
    responses: Mutex<VecDeque<Result<QueryResponse>>>,
    delay: Option<Duration>,
}

impl MockExecutor {
    fn new() -> Self {
        Self {
            requests: Mutex::new(Vec::new()),
            responses: Mutex::new(VecDeque::new()),
            delay: None,
        }
    }

    fn with_responses(responses: Vec<Result<QueryResponse>>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            ..Self::new()
        }
    }

    fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    fn exprs(&self) -> Vec<String> {
        self.requests
            .lock()
            .iter()
            .map(|r| r.targets[0].expr.clone())
            .collect()
    }

    fn call_count(&self) -> usize {
        self.requests.lock().len()
    }
}

#[async_trait::async_trait]
impl SubqueryExecutor for MockExecutor {
    async fn run_subquery(&self, request: SubRequest) -> Result<QueryResponse> {
        self.requests.lock().push(request);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.responses
            .lock()
            .pop_front()
            .unwrap_or_else(|| Ok(plain_response()))
    }
}

/// Shard source replaying a fixed value list; `None` simulates a failure
struct MockShardSource {
    values: Option<Vec<String>>,
    seen_selectors: Mutex<Vec<String>>,
}

impl MockShardSource {
    fn with_values(values: &[&str]) -> Self {
        Self {
            values: Some(values.iter().map(|v| v.to_string()).collect()),
            seen_selectors: Mutex::new(Vec::new()),
        }
    }

    fn failing() -> Self {
        Self {
            values: None,
            seen_selectors: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait::async_trait]
impl ShardValueSource for MockShardSource {
    async fn fetch_shard_values(
        &self,
        _label: &str,
        selector: &str,
        _range: TimeRange,
    ) -> Result<Vec<String>> {
        self.seen_selectors.lock().push(selector.to_string());
        match &self.values {
            Some(values) => Ok(values.clone()),
            None => Err(SplitError::Shard("label values unavailable".to_string())),
        }
    }
}

/// Response with one single-row frame and no stats
fn plain_response() -> QueryResponse {
    QueryResponse::with_frames(vec![Frame::new(
        "A",
        vec![Field::new(
            "Time",
            FieldValues::Time {
                ms: vec![1],
                nanos: None,
            },
        )],
        FrameMeta::of_type(FrameType::Logs),
    )])
}

/// Response whose frame reports the given execution time
fn timed_response(secs: f64) -> QueryResponse {
    let mut response = plain_response();
    response.data[0].meta.stats = vec![StatItem::new(EXEC_TIME_STAT, secs)];
    response
}

/// Response carrying a retriable timeout error
fn timeout_response() -> QueryResponse {
    let mut response = QueryResponse::with_frames(Vec::new());
    response.errors = vec![ResponseError::new("query timed out").with_ref_id("A")];
    response
}

fn sharded_target() -> SubQuery {
    SubQuery::new(
        "A",
        r#"{job="app", __stream_shard__=~"__shard_value__"} |= "error""#,
        QueryKind::Logs,
    )
}

fn request() -> QueryRequest {
    QueryRequest::new(
        TimeRange::new(0, 3_600_000).unwrap(),
        60_000,
        vec![sharded_target()],
    )
    .with_request_id("req")
}

fn config(initial: usize) -> AdaptiveSizeConfig {
    AdaptiveSizeConfig::default()
        .with_initial_batch_size(initial)
        .with_retry_backoff(Duration::from_millis(5))
}

fn runner(
    executor: &Arc<MockExecutor>,
    source: &Arc<MockShardSource>,
    adaptive: AdaptiveSizeConfig,
) -> AdaptiveShardRunner<MockExecutor, MockShardSource> {
    AdaptiveShardRunner::new(Arc::clone(executor), Arc::clone(source), adaptive)
}

// =============================================================================
// Batch Construction
// =============================================================================

#[tokio::test]
async fn test_five_shards_initial_size_two_yields_four_batches() {
    let executor = Arc::new(MockExecutor::with_responses(vec![
        Ok(plain_response()),
        Ok(plain_response()),
        Ok(plain_response()),
        Ok(plain_response()),
    ]));
    let source = Arc::new(MockShardSource::with_values(&["1", "2", "3", "4", "5"]));

    let terminal = runner(&executor, &source, config(2))
        .run(request())
        .final_response()
        .await
        .unwrap();

    assert_eq!(terminal.state, LoadingState::Done);
    assert_eq!(
        executor.exprs(),
        vec![
            r#"{job="app", __stream_shard__=~"5|4"} |= "error""#,
            r#"{job="app", __stream_shard__=~"3|2"} |= "error""#,
            r#"{job="app", __stream_shard__="1"} |= "error""#,
            r#"{job="app", __stream_shard__=""} |= "error""#,
        ]
    );
}

#[tokio::test]
async fn test_shard_fetch_sees_plain_selector() {
    let executor = Arc::new(MockExecutor::new());
    let source = Arc::new(MockShardSource::with_values(&["1"]));

    runner(&executor, &source, config(1))
        .run(request())
        .final_response()
        .await;

    let selectors = source.seen_selectors.lock().clone();
    assert_eq!(selectors, vec![r#"{job="app"} |= "error""#.to_string()]);
}

#[tokio::test]
async fn test_failed_shard_fetch_degrades_to_unsharded_run() {
    let executor = Arc::new(MockExecutor::new());
    let source = Arc::new(MockShardSource::failing());

    let terminal = runner(&executor, &source, config(1))
        .run(request())
        .final_response()
        .await
        .unwrap();

    assert_eq!(terminal.state, LoadingState::Done);
    assert_eq!(executor.exprs(), vec![r#"{job="app"} |= "error""#.to_string()]);
}

#[tokio::test]
async fn test_no_shard_values_runs_unsharded() {
    let executor = Arc::new(MockExecutor::new());
    let source = Arc::new(MockShardSource::with_values(&[]));

    runner(&executor, &source, config(1))
        .run(request())
        .final_response()
        .await;

    assert_eq!(executor.exprs(), vec![r#"{job="app"} |= "error""#.to_string()]);
}

// =============================================================================
// Adaptive Sizing
// =============================================================================

#[tokio::test]
async fn test_fast_batches_grow_until_capped_by_remaining() {
    let executor = Arc::new(MockExecutor::with_responses(
        (0..6).map(|_| Ok(timed_response(0.5))).collect(),
    ));
    let source = Arc::new(MockShardSource::with_values(&[
        "1", "2", "3", "4", "5", "6", "7",
    ]));

    let terminal = runner(&executor, &source, config(1))
        .run(request())
        .final_response()
        .await
        .unwrap();

    assert_eq!(terminal.state, LoadingState::Done);
    assert_eq!(
        executor.exprs(),
        vec![
            r#"{job="app", __stream_shard__="7"} |= "error""#,
            r#"{job="app", __stream_shard__=~"6|5"} |= "error""#,
            r#"{job="app", __stream_shard__=~"4|3"} |= "error""#,
            r#"{job="app", __stream_shard__="2"} |= "error""#,
            r#"{job="app", __stream_shard__="1"} |= "error""#,
            r#"{job="app", __stream_shard__=""} |= "error""#,
        ]
    );
}

#[tokio::test]
async fn test_in_window_latency_keeps_batch_size() {
    let executor = Arc::new(MockExecutor::with_responses(
        (0..3).map(|_| Ok(timed_response(8.0))).collect(),
    ));
    let source = Arc::new(MockShardSource::with_values(&["1", "2", "3", "4"]));

    runner(&executor, &source, config(2))
        .run(request())
        .final_response()
        .await;

    assert_eq!(
        executor.exprs(),
        vec![
            r#"{job="app", __stream_shard__=~"4|3"} |= "error""#,
            r#"{job="app", __stream_shard__=~"2|1"} |= "error""#,
            r#"{job="app", __stream_shard__=""} |= "error""#,
        ]
    );
}

// =============================================================================
// Retry Policy
// =============================================================================

#[tokio::test]
async fn test_retriable_error_retries_once_with_sqrt_size() {
    let executor = Arc::new(MockExecutor::with_responses(vec![
        Ok(timeout_response()),
        Ok(plain_response()),
    ]));
    let source = Arc::new(MockShardSource::with_values(&["3", "4", "5"]));

    let terminal = runner(&executor, &source, config(2))
        .run(request())
        .final_response()
        .await
        .unwrap();

    assert_eq!(terminal.state, LoadingState::Done);
    let exprs = executor.exprs();
    // Failed batch of 2, retried once at floor(sqrt(2)) = 1
    assert_eq!(exprs[0], r#"{job="app", __stream_shard__=~"5|4"} |= "error""#);
    assert_eq!(exprs[1], r#"{job="app", __stream_shard__="5"} |= "error""#);
    // The failed attempt's error is not merged into the result
    assert!(terminal.errors.is_empty());
}

#[tokio::test]
async fn test_second_consecutive_failure_is_surfaced_not_retried() {
    let executor = Arc::new(MockExecutor::with_responses(vec![
        Ok(timeout_response()),
        Ok(timeout_response()),
    ]));
    let source = Arc::new(MockShardSource::with_values(&["4", "5"]));

    let terminal = runner(&executor, &source, config(2))
        .run(request())
        .final_response()
        .await
        .unwrap();

    assert_eq!(terminal.state, LoadingState::Done);
    let exprs = executor.exprs();
    assert_eq!(exprs[0], r#"{job="app", __stream_shard__=~"5|4"} |= "error""#);
    assert_eq!(exprs[1], r#"{job="app", __stream_shard__="5"} |= "error""#);
    // After the surfaced failure the run moves on to the next shard
    assert_eq!(exprs[2], r#"{job="app", __stream_shard__="4"} |= "error""#);
    assert_eq!(terminal.errors.len(), 1);
}

#[tokio::test]
async fn test_non_retriable_error_surfaced_without_retry() {
    let mut errored = QueryResponse::with_frames(Vec::new());
    errored.errors = vec![ResponseError::new("parse error at line 1")];

    let executor = Arc::new(MockExecutor::with_responses(vec![Ok(errored)]));
    let source = Arc::new(MockShardSource::with_values(&["4", "5"]));

    let terminal = runner(&executor, &source, config(2))
        .run(request())
        .final_response()
        .await
        .unwrap();

    assert_eq!(terminal.state, LoadingState::Done);
    assert_eq!(terminal.errors.len(), 1);
    // No retry for the first batch, straight on to the unsharded bucket
    assert_eq!(executor.call_count(), 2);
}

#[tokio::test]
async fn test_transport_error_is_fatal_for_the_run() {
    let executor = Arc::new(MockExecutor::with_responses(vec![
        Ok(plain_response()),
        Err(SplitError::Transport("connection reset".to_string())),
    ]));
    let source = Arc::new(MockShardSource::with_values(&["3", "4", "5"]));

    let terminal = runner(&executor, &source, config(1))
        .run(request())
        .final_response()
        .await
        .unwrap();

    assert_eq!(terminal.state, LoadingState::Error);
    assert!(terminal
        .error
        .as_ref()
        .unwrap()
        .message
        .contains("connection reset"));
    assert_eq!(executor.call_count(), 2);
}

// =============================================================================
// Cancellation and Tracking
// =============================================================================

#[tokio::test]
async fn test_cancel_aborts_in_flight_batch() {
    let executor = Arc::new(MockExecutor::new().with_delay(Duration::from_secs(30)));
    let source = Arc::new(MockShardSource::with_values(&["1", "2", "3"]));

    let mut stream = runner(&executor, &source, config(1)).run(request());
    tokio::time::sleep(Duration::from_millis(50)).await;

    stream.cancel();

    assert!(stream.recv().await.is_none());
    assert_eq!(executor.call_count(), 1);
}

#[tokio::test]
async fn test_tracker_records_executed_batches() {
    let executor = Arc::new(MockExecutor::with_responses(vec![
        Ok(plain_response()),
        Ok(plain_response()),
        Ok(plain_response()),
        Ok(plain_response()),
    ]));
    let source = Arc::new(MockShardSource::with_values(&["1", "2", "3", "4", "5"]));
    let sink = Arc::new(RecordingSink::new());

    AdaptiveShardRunner::new(Arc::clone(&executor), Arc::clone(&source), config(2))
        .with_tracker(Arc::clone(&sink) as Arc<dyn querysplit::TrackingSink>)
        .run(request())
        .final_response()
        .await;

    assert_eq!(sink.len(), 1);
    let run = &sink.runs()[0];
    assert_eq!(run.state, LoadingState::Done);
    assert_eq!(run.group_count, 1);
    assert_eq!(run.sub_request_count, 4);
}

//! Terminal-state tracking
//!
//! When a run reaches its terminal state the runner invokes the tracking
//! sink exactly once with the final merged response and a summary of what
//! was actually executed. The sink is fire-and-forget: it must not block
//! and its failures are invisible to the caller.

use crate::types::{LoadingState, MergedResponse, QueryRequest, ShardBatch, TimeRange};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tracing::info;

/// The partitions one group actually executed
#[derive(Debug, Clone)]
pub enum ExecutedPartitions {
    /// Time sub-ranges of a range-split group
    TimeRanges(Vec<TimeRange>),
    /// Shard batches of a shard-split group
    ShardBatches(Vec<ShardBatch>),
}

impl ExecutedPartitions {
    /// Number of executed partitions
    pub fn len(&self) -> usize {
        match self {
            ExecutedPartitions::TimeRanges(ranges) => ranges.len(),
            ExecutedPartitions::ShardBatches(batches) => batches.len(),
        }
    }

    /// Whether nothing was executed
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Execution summary of one query group
#[derive(Debug, Clone)]
pub struct ExecutedGroup {
    /// Reference ids of the group's targets
    pub ref_ids: Vec<String>,

    /// Partitions dispatched for this group
    pub partitions: ExecutedPartitions,
}

/// Everything handed to the sink at terminal state
#[derive(Debug, Clone, Copy)]
pub struct TrackEvent<'a> {
    /// The final merged response
    pub response: &'a MergedResponse,

    /// Groups and partitions actually executed
    pub groups: &'a [ExecutedGroup],

    /// The original logical request
    pub request: &'a QueryRequest,

    /// Wall-clock time the run started
    pub started_at: DateTime<Utc>,
}

/// Fire-and-forget telemetry sink, invoked once per run
pub trait TrackingSink: Send + Sync {
    /// Record a finished run
    fn track(&self, event: TrackEvent<'_>);
}

/// Sink that discards everything
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopSink;

impl TrackingSink for NoopSink {
    fn track(&self, _event: TrackEvent<'_>) {}
}

/// Sink that emits one structured log line per finished run
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl TrackingSink for TracingSink {
    fn track(&self, event: TrackEvent<'_>) {
        let sub_requests: usize = event.groups.iter().map(|g| g.partitions.len()).sum();
        info!(
            key = %event.response.key,
            state = ?event.response.state,
            groups = event.groups.len(),
            sub_requests,
            errors = event.response.errors.len(),
            duration_ms = (Utc::now() - event.started_at).num_milliseconds(),
            predefined_operations = event.request.predefined_operations.as_deref(),
            "split query finished"
        );
    }
}

/// Owned snapshot of a tracked run, kept by [`RecordingSink`]
#[derive(Debug, Clone)]
pub struct RecordedRun {
    /// Response stream key
    pub key: String,

    /// Terminal state
    pub state: LoadingState,

    /// Number of executed groups
    pub group_count: usize,

    /// Total sub-requests across all groups
    pub sub_request_count: usize,

    /// Accumulated error count
    pub error_count: usize,

    /// Annotation from the original request
    pub predefined_operations: Option<String>,

    /// Run start time
    pub started_at: DateTime<Utc>,
}

/// Sink that records runs in memory, for tests and diagnostics
#[derive(Debug, Default)]
pub struct RecordingSink {
    runs: RwLock<Vec<RecordedRun>>,
}

impl RecordingSink {
    /// Create an empty sink
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all recorded runs
    pub fn runs(&self) -> Vec<RecordedRun> {
        self.runs.read().clone()
    }

    /// Number of recorded runs
    pub fn len(&self) -> usize {
        self.runs.read().len()
    }

    /// Whether no run was recorded yet
    pub fn is_empty(&self) -> bool {
        self.runs.read().is_empty()
    }
}

impl TrackingSink for RecordingSink {
    fn track(&self, event: TrackEvent<'_>) {
        self.runs.write().push(RecordedRun {
            key: event.response.key.clone(),
            state: event.response.state,
            group_count: event.groups.len(),
            sub_request_count: event.groups.iter().map(|g| g.partitions.len()).sum(),
            error_count: event.response.errors.len(),
            predefined_operations: event.request.predefined_operations.clone(),
            started_at: event.started_at,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{SubQuery, QueryKind};

    #[test]
    fn test_recording_sink_snapshots() {
        let sink = RecordingSink::new();
        let response = MergedResponse::new();
        let request = QueryRequest::new(
            TimeRange::new(0, 1000).unwrap(),
            1000,
            vec![SubQuery::new("A", "{}", QueryKind::Logs)],
        );
        let groups = vec![ExecutedGroup {
            ref_ids: vec!["A".to_string()],
            partitions: ExecutedPartitions::TimeRanges(vec![TimeRange::new(0, 1000).unwrap()]),
        }];

        sink.track(TrackEvent {
            response: &response,
            groups: &groups,
            request: &request,
            started_at: Utc::now(),
        });

        assert_eq!(sink.len(), 1);
        let run = &sink.runs()[0];
        assert_eq!(run.key, response.key);
        assert_eq!(run.sub_request_count, 1);
    }
}

//! Core data types used throughout the query-splitting engine
//!
//! This module defines the fundamental data structures used across the system:
//!
//! # Key Types
//!
//! - **`TimeRange`**: Time window covered by one sub-request (from, to)
//! - **`SubQuery`**: One pre-classified query target (logs, metric or instant)
//! - **`QueryRequest`**: The logical request that gets decomposed
//! - **`Frame`** / **`Field`**: Typed columnar result data returned by the backend
//! - **`QueryResponse`**: One sub-request's response
//! - **`MergedResponse`**: The growing accumulator emitted to the caller
//! - **`ShardBatch`**: An ordered slice of stream-shard identifiers
//!
//! # Example
//!
//! ```rust
//! use querysplit::types::{QueryKind, SubQuery, TimeRange};
//!
//! let range = TimeRange::new(1000, 2000).unwrap();
//! assert_eq!(range.duration_ms(), 1000);
//!
//! let target = SubQuery::new("A", "{job=\"app\"}", QueryKind::Logs);
//! assert!(target.is_logs());
//! ```

use crate::error::{Result, SplitError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

// ============================================================================
// Time Ranges
// ============================================================================

/// Time window for one sub-request
///
/// Both bounds are Unix timestamps in milliseconds. By convention one
/// endpoint is inclusive and the other exclusive on the backend side;
/// consecutive partitions produced by the range partitioner share exactly
/// one endpoint value, and the shared boundary sample is deduplicated
/// during response merging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    /// Range start in milliseconds since epoch
    pub from: i64,

    /// Range end in milliseconds since epoch
    pub to: i64,
}

impl TimeRange {
    /// Create a validated time range
    ///
    /// # Returns
    ///
    /// - `Ok(TimeRange)` if `from <= to`
    /// - `Err(SplitError::InvalidTimeRange)` otherwise
    pub fn new(from: i64, to: i64) -> Result<Self> {
        if from > to {
            return Err(SplitError::InvalidTimeRange { from, to });
        }
        Ok(Self { from, to })
    }

    /// Width of the range in milliseconds
    pub fn duration_ms(&self) -> i64 {
        self.to - self.from
    }

    /// Check whether a timestamp falls inside `[from, to)`
    pub fn contains(&self, timestamp_ms: i64) -> bool {
        timestamp_ms >= self.from && timestamp_ms < self.to
    }
}

impl fmt::Display for TimeRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.from, self.to)
    }
}

// ============================================================================
// Query Targets and Requests
// ============================================================================

/// Classification of a query target
///
/// Classification is performed by the query-language layer before a request
/// reaches this engine; the engine only routes on the result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueryKind {
    /// Log-line query, chunked by wall-clock duration
    Logs,
    /// Step-sampled metric query, chunked on step-aligned boundaries
    Metric,
    /// Instant query, executed once over the full range
    Instant,
}

/// One query target inside a logical request
///
/// Targets arrive pre-classified and (for the shard path) pre-interpolated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubQuery {
    /// Caller-assigned frame reference id
    pub ref_id: String,

    /// Query expression, opaque to this engine
    pub expr: String,

    /// Pre-computed classification of the expression
    pub kind: QueryKind,

    /// Maximum number of log lines still wanted for this target.
    /// Decremented by the runner as lines arrive; `Some(0)` drops the
    /// target from subsequent sub-requests. Only meaningful for logs.
    pub max_lines: Option<usize>,

    /// Per-target resolution factor applied to the request interval
    pub resolution: Option<i64>,
}

impl SubQuery {
    /// Create a new target with no line limit and default resolution
    pub fn new(ref_id: impl Into<String>, expr: impl Into<String>, kind: QueryKind) -> Self {
        Self {
            ref_id: ref_id.into(),
            expr: expr.into(),
            kind,
            max_lines: None,
            resolution: None,
        }
    }

    /// Set the maximum number of log lines for this target
    pub fn with_max_lines(mut self, max_lines: usize) -> Self {
        self.max_lines = Some(max_lines);
        self
    }

    /// Set the resolution factor for this target
    pub fn with_resolution(mut self, resolution: i64) -> Self {
        self.resolution = Some(resolution);
        self
    }

    /// Whether this target is a logs query
    pub fn is_logs(&self) -> bool {
        self.kind == QueryKind::Logs
    }
}

/// The single logical request that is decomposed into sub-requests
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryRequest {
    /// Requested time range
    pub range: TimeRange,

    /// Dashboard/caller interval in milliseconds, input to the metric step
    pub interval_ms: i64,

    /// Query targets, pre-classified
    pub targets: Vec<SubQuery>,

    /// Caller request id; sub-requests get a suffixed copy
    pub request_id: Option<String>,

    /// Per-request override of the splitting chunk duration
    pub split_duration_ms: Option<i64>,

    /// Free-form annotation forwarded to the telemetry sink
    pub predefined_operations: Option<String>,
}

impl QueryRequest {
    /// Create a request over a range with the given targets
    pub fn new(range: TimeRange, interval_ms: i64, targets: Vec<SubQuery>) -> Self {
        Self {
            range,
            interval_ms,
            targets,
            request_id: None,
            split_duration_ms: None,
            predefined_operations: None,
        }
    }

    /// Set the caller request id
    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    /// Override the splitting chunk duration for this request
    pub fn with_split_duration_ms(mut self, duration_ms: i64) -> Self {
        self.split_duration_ms = Some(duration_ms);
        self
    }
}

/// One bounded-scope sub-request handed to the executor
///
/// Covers exactly one time partition (or one shard batch, encoded in the
/// targets' interpolated selectors).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubRequest {
    /// Time range of this sub-request
    pub range: TimeRange,

    /// Caller interval, passed through for step computation downstream
    pub interval_ms: i64,

    /// Live targets for this sub-request
    pub targets: Vec<SubQuery>,

    /// Request id suffixed with the partition counter
    pub request_id: Option<String>,
}

// ============================================================================
// Frames
// ============================================================================

/// Type discriminator carried in frame metadata
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FrameType {
    /// Log-line frame with per-row `id` values
    Logs,
    /// Multi-series metric frame, one value field per label set
    TimeSeriesMulti,
    /// Anything else; merged by ref id and name only
    Unknown,
}

/// One named summary statistic attached to frame metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatItem {
    /// Display name, e.g. "Summary: exec time"
    pub display_name: String,

    /// Numeric value
    pub value: f64,

    /// Optional unit
    pub unit: Option<String>,
}

impl StatItem {
    /// Create a stat with no unit
    pub fn new(display_name: impl Into<String>, value: f64) -> Self {
        Self {
            display_name: display_name.into(),
            value,
            unit: None,
        }
    }
}

/// Frame metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameMeta {
    /// Frame type discriminator
    pub frame_type: FrameType,

    /// Summary statistics reported by the backend
    pub stats: Vec<StatItem>,
}

impl FrameMeta {
    /// Metadata with the given type and no stats
    pub fn of_type(frame_type: FrameType) -> Self {
        Self {
            frame_type,
            stats: Vec::new(),
        }
    }
}

impl Default for FrameMeta {
    fn default() -> Self {
        Self::of_type(FrameType::Unknown)
    }
}

/// Typed column storage for one field
///
/// Values are kept in per-type vectors so sample insertion is an explicit
/// index operation instead of untyped array splicing. Number, String and
/// Other columns are nullable; the time column is dense with an optional
/// nanosecond-remainder companion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FieldValues {
    /// Timestamps in milliseconds with optional sub-millisecond remainders
    Time {
        /// Millisecond values
        ms: Vec<i64>,
        /// Nanosecond remainders, same length as `ms` when present
        nanos: Option<Vec<i64>>,
    },
    /// Numeric samples; summed when a duplicate sample is merged
    Number(Vec<Option<f64>>),
    /// String values; replaced when a duplicate sample is merged
    String(Vec<Option<String>>),
    /// Structured values such as label maps; shallow-merged on duplicates
    Other(Vec<Option<serde_json::Value>>),
}

impl FieldValues {
    /// Number of rows in this column
    pub fn len(&self) -> usize {
        match self {
            FieldValues::Time { ms, .. } => ms.len(),
            FieldValues::Number(v) => v.len(),
            FieldValues::String(v) => v.len(),
            FieldValues::Other(v) => v.len(),
        }
    }

    /// Whether the column has no rows
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether this is the time column
    pub fn is_time(&self) -> bool {
        matches!(self, FieldValues::Time { .. })
    }
}

/// One field (column) of a frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Field {
    /// Field name; used to match fields across frames during merging
    pub name: String,

    /// Label set identifying the series for multi-series metric frames
    pub labels: Option<BTreeMap<String, String>>,

    /// Column data
    pub values: FieldValues,
}

impl Field {
    /// Create an unlabeled field
    pub fn new(name: impl Into<String>, values: FieldValues) -> Self {
        Self {
            name: name.into(),
            labels: None,
            values,
        }
    }

    /// Attach a label set
    pub fn with_labels(mut self, labels: BTreeMap<String, String>) -> Self {
        self.labels = Some(labels);
        self
    }
}

/// A typed columnar result set returned by the backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    /// Reference id linking the frame to its originating target
    pub ref_id: String,

    /// Optional frame name
    pub name: Option<String>,

    /// Columns
    pub fields: Vec<Field>,

    /// Row count; recomputed from the time column after merges
    pub length: usize,

    /// Metadata
    pub meta: FrameMeta,
}

impl Frame {
    /// Create a frame, deriving `length` from the first field
    pub fn new(ref_id: impl Into<String>, fields: Vec<Field>, meta: FrameMeta) -> Self {
        let length = fields.first().map(|f| f.values.len()).unwrap_or(0);
        Self {
            ref_id: ref_id.into(),
            name: None,
            fields,
            length,
            meta,
        }
    }

    /// Set the frame name
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Index of the first time field, if any
    pub fn time_field_index(&self) -> Option<usize> {
        self.fields.iter().position(|f| f.values.is_time())
    }

    /// Index of the first string field named `id`, if any
    ///
    /// Log frames carry a per-row entry id used for exact-duplicate
    /// detection during merging.
    pub fn id_field_index(&self) -> Option<usize> {
        self.fields
            .iter()
            .position(|f| f.name == "id" && matches!(f.values, FieldValues::String(_)))
    }

    /// Labels of the first numeric field
    ///
    /// Multi-series metric frames are matched for merging by the label set
    /// of their value field.
    pub fn value_field_labels(&self) -> Option<&BTreeMap<String, String>> {
        self.fields
            .iter()
            .find(|f| matches!(f.values, FieldValues::Number(_)))
            .and_then(|f| f.labels.as_ref())
    }

    /// Recompute `length` from the time column (first column as fallback)
    pub fn recompute_length(&mut self) {
        self.length = match self.time_field_index() {
            Some(idx) => self.fields[idx].values.len(),
            None => self.fields.first().map(|f| f.values.len()).unwrap_or(0),
        };
    }
}

// ============================================================================
// Responses
// ============================================================================

/// Lifecycle state of a response stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LoadingState {
    /// Partial results are still arriving
    Streaming,
    /// All sub-requests completed
    Done,
    /// A fatal error ended the run
    Error,
}

/// An error reported inside a response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseError {
    /// Human-readable message
    pub message: String,

    /// Target the error belongs to, when the backend attributes it
    pub ref_id: Option<String>,
}

impl ResponseError {
    /// Create an unattributed error
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ref_id: None,
        }
    }

    /// Attribute the error to a target
    pub fn with_ref_id(mut self, ref_id: impl Into<String>) -> Self {
        self.ref_id = Some(ref_id.into());
        self
    }
}

/// Response to exactly one sub-request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryResponse {
    /// Result frames
    pub data: Vec<Frame>,

    /// Stream state reported by the executor
    pub state: LoadingState,

    /// Primary error, when the whole sub-request failed
    pub error: Option<ResponseError>,

    /// Per-target errors
    pub errors: Vec<ResponseError>,

    /// Backend trace ids
    pub trace_ids: Vec<String>,
}

impl QueryResponse {
    /// Successful response carrying the given frames
    pub fn with_frames(data: Vec<Frame>) -> Self {
        Self {
            data,
            state: LoadingState::Done,
            error: None,
            errors: Vec::new(),
            trace_ids: Vec::new(),
        }
    }

    /// Whether the response carries any error
    pub fn has_errors(&self) -> bool {
        self.error.is_some() || !self.errors.is_empty()
    }

    /// Messages of all carried errors, `error` first
    pub fn error_messages(&self) -> Vec<&str> {
        self.error
            .iter()
            .chain(self.errors.iter())
            .map(|e| e.message.as_str())
            .collect()
    }
}

/// The single growing accumulator for one logical request
///
/// Created empty when a run starts, mutated in place on every sub-response
/// arrival and emitted to the caller after each merge. Terminal once
/// `state` is `Done` or `Error`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergedResponse {
    /// Merged result frames
    pub data: Vec<Frame>,

    /// Stream state; exactly one transition out of `Streaming`
    pub state: LoadingState,

    /// First fatal or carried-over error
    pub error: Option<ResponseError>,

    /// Accumulated per-target errors
    pub errors: Vec<ResponseError>,

    /// Accumulated backend trace ids
    pub trace_ids: Vec<String>,

    /// Unique key identifying this logical response stream
    pub key: String,
}

impl MergedResponse {
    /// Create an empty streaming response with a fresh key
    pub fn new() -> Self {
        Self {
            data: Vec::new(),
            state: LoadingState::Streaming,
            error: None,
            errors: Vec::new(),
            trace_ids: Vec::new(),
            key: uuid::Uuid::new_v4().to_string(),
        }
    }

    /// Number of merged rows for a given target, 0 when absent
    pub fn lines_for_ref_id(&self, ref_id: &str) -> usize {
        self.data
            .iter()
            .find(|frame| frame.ref_id == ref_id)
            .map(|frame| frame.length)
            .unwrap_or(0)
    }
}

impl Default for MergedResponse {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Shard Batches and Query Groups
// ============================================================================

/// An ordered list of shard identifiers OR-matched in one sub-request
///
/// The empty string denotes the unsharded bucket and is never mixed with
/// numeric shard ids.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardBatch(pub Vec<String>);

impl ShardBatch {
    /// Number of shards in the batch
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the batch has no shards
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Whether this is the unsharded bucket
    pub fn is_unsharded(&self) -> bool {
        self.0.len() == 1 && self.0[0].is_empty()
    }
}

/// One group of homogeneous sub-requests over a shared partition list
///
/// Computed once at run start; read-only thereafter. Owned exclusively by
/// one execution run.
#[derive(Debug, Clone)]
pub struct QueryGroup {
    /// Targets executed together in every sub-request of this group
    pub targets: Vec<SubQuery>,

    /// Ascending time partitions; the runner consumes from the tail
    pub partition: Vec<TimeRange>,
}

impl QueryGroup {
    /// Create a group
    pub fn new(targets: Vec<SubQuery>, partition: Vec<TimeRange>) -> Self {
        Self { targets, partition }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_time_range_validation() {
        assert!(TimeRange::new(1000, 2000).is_ok());
        assert!(TimeRange::new(2000, 2000).is_ok());
        assert!(TimeRange::new(2001, 2000).is_err());
    }

    #[test]
    fn test_time_range_contains() {
        let range = TimeRange::new(1000, 2000).unwrap();
        assert!(range.contains(1000));
        assert!(range.contains(1999));
        assert!(!range.contains(2000));
        assert!(!range.contains(999));
    }

    #[test]
    fn test_sub_query_builder() {
        let q = SubQuery::new("A", "{job=\"app\"}", QueryKind::Logs)
            .with_max_lines(500)
            .with_resolution(2);
        assert_eq!(q.max_lines, Some(500));
        assert_eq!(q.resolution, Some(2));
        assert!(q.is_logs());
    }

    #[test]
    fn test_frame_length_from_fields() {
        let frame = Frame::new(
            "A",
            vec![Field::new(
                "Time",
                FieldValues::Time {
                    ms: vec![1, 2, 3],
                    nanos: None,
                },
            )],
            FrameMeta::of_type(FrameType::Logs),
        );
        assert_eq!(frame.length, 3);
        assert_eq!(frame.time_field_index(), Some(0));
    }

    #[test]
    fn test_frame_id_field_lookup() {
        let frame = Frame::new(
            "A",
            vec![
                Field::new(
                    "Time",
                    FieldValues::Time {
                        ms: vec![1],
                        nanos: None,
                    },
                ),
                Field::new("id", FieldValues::String(vec![Some("1_abc".into())])),
            ],
            FrameMeta::of_type(FrameType::Logs),
        );
        assert_eq!(frame.id_field_index(), Some(1));
    }

    #[test]
    fn test_merged_response_fresh_keys() {
        let a = MergedResponse::new();
        let b = MergedResponse::new();
        assert_ne!(a.key, b.key);
        assert_eq!(a.state, LoadingState::Streaming);
        assert!(a.data.is_empty());
    }

    #[test]
    fn test_shard_batch_unsharded() {
        assert!(ShardBatch(vec![String::new()]).is_unsharded());
        assert!(!ShardBatch(vec!["13".to_string()]).is_unsharded());
        assert!(!ShardBatch(vec!["13".to_string(), String::new()]).is_unsharded());
    }

    #[test]
    fn test_response_error_messages_order() {
        let response = QueryResponse {
            data: Vec::new(),
            state: LoadingState::Done,
            error: Some(ResponseError::new("primary")),
            errors: vec![ResponseError::new("secondary").with_ref_id("A")],
            trace_ids: Vec::new(),
        };
        assert_eq!(response.error_messages(), vec!["primary", "secondary"]);
    }
}

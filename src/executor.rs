//! External capabilities consumed by the engine
//!
//! The engine never talks to a backend directly; everything it needs from
//! the outside world enters through these traits. The transport that
//! executes one sub-request, the label-values endpoint used to resolve
//! stream shards and the template-variable layer are all collaborators
//! owned by the embedding datasource.

use crate::error::Result;
use crate::types::{QueryResponse, SubQuery, SubRequest, TimeRange};
use async_trait::async_trait;

/// Executes exactly one sub-request against the backend
///
/// Implementations return `Ok` with a well-formed [`QueryResponse`] even
/// when the backend reports query errors; `Err` is reserved for
/// transport-level failures and is fatal for the whole run.
#[async_trait]
pub trait SubqueryExecutor: Send + Sync + 'static {
    /// Run one sub-request to completion
    async fn run_subquery(&self, request: SubRequest) -> Result<QueryResponse>;
}

/// Resolves the distinct values of a label for a stream selector
///
/// Used by the shard runner to discover the stream-shard ids present in
/// the queried time range.
#[async_trait]
pub trait ShardValueSource: Send + Sync + 'static {
    /// Fetch the label's distinct values, scoped to selector and range
    async fn fetch_shard_values(
        &self,
        label: &str,
        selector: &str,
        range: TimeRange,
    ) -> Result<Vec<String>>;
}

/// Template/variable substitution, applied once before partitioning
pub trait VariableInterpolator: Send + Sync {
    /// Return the targets with variables substituted
    fn interpolate(&self, targets: &[SubQuery]) -> Vec<SubQuery>;
}

/// Interpolator for callers whose targets carry no variables
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopInterpolator;

impl VariableInterpolator for NoopInterpolator {
    fn interpolate(&self, targets: &[SubQuery]) -> Vec<SubQuery> {
        targets.to_vec()
    }
}

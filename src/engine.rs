//! Split-query engine facade
//!
//! The entry point a datasource embeds: takes one logical
//! [`QueryRequest`], groups its pre-classified targets, picks the right
//! runner and returns the cancelable response stream.
//!
//! ```rust,ignore
//! use querysplit::engine::SplitQueryEngine;
//!
//! let engine = SplitQueryEngine::new(executor)
//!     .with_config(SplitConfig::default())
//!     .with_tracker(Arc::new(TracingSink));
//!
//! let mut stream = engine.run(request);
//! while let Some(snapshot) = stream.recv().await {
//!     render(&snapshot);
//! }
//! ```

use crate::config::{AdaptiveSizeConfig, SplitConfig};
use crate::executor::{NoopInterpolator, ShardValueSource, SubqueryExecutor, VariableInterpolator};
use crate::partition::partition_time_range;
use crate::runner::{AdaptiveShardRunner, QueryStream, SequentialGroupRunner};
use crate::telemetry::TrackingSink;
use crate::types::{QueryGroup, QueryKind, QueryRequest, SubQuery};
use std::sync::Arc;
use tracing::debug;

/// Engine decomposing logical requests into sub-request runs
pub struct SplitQueryEngine<E: SubqueryExecutor> {
    executor: Arc<E>,
    config: SplitConfig,
    adaptive: AdaptiveSizeConfig,
    interpolator: Arc<dyn VariableInterpolator>,
    tracker: Arc<dyn TrackingSink>,
}

impl<E: SubqueryExecutor> SplitQueryEngine<E> {
    /// Create an engine with default configuration
    pub fn new(executor: Arc<E>) -> Self {
        Self {
            executor,
            config: SplitConfig::default(),
            adaptive: AdaptiveSizeConfig::default(),
            interpolator: Arc::new(NoopInterpolator),
            tracker: Arc::new(crate::telemetry::NoopSink),
        }
    }

    /// Replace the splitting configuration
    pub fn with_config(mut self, config: SplitConfig) -> Self {
        self.config = config;
        self
    }

    /// Replace the adaptive shard-sizing configuration
    pub fn with_adaptive_config(mut self, adaptive: AdaptiveSizeConfig) -> Self {
        self.adaptive = adaptive;
        self
    }

    /// Attach a variable interpolator
    pub fn with_interpolator(mut self, interpolator: Arc<dyn VariableInterpolator>) -> Self {
        self.interpolator = interpolator;
        self
    }

    /// Attach a tracking sink
    pub fn with_tracker(mut self, tracker: Arc<dyn TrackingSink>) -> Self {
        self.tracker = tracker;
        self
    }

    /// Group targets by kind and attach their partitions
    ///
    /// Logs targets chunk by wall-clock duration, metric targets by
    /// step-aligned duration, instant targets execute once over the full
    /// range. Kinds absent from the request produce no group.
    pub fn build_groups(&self, request: &QueryRequest, targets: &[SubQuery]) -> Vec<QueryGroup> {
        let duration = request
            .split_duration_ms
            .unwrap_or(self.config.chunk_duration_ms);

        let logs: Vec<SubQuery> = targets.iter().filter(|t| t.kind == QueryKind::Logs).cloned().collect();
        let metric: Vec<SubQuery> = targets.iter().filter(|t| t.kind == QueryKind::Metric).cloned().collect();
        let instant: Vec<SubQuery> = targets.iter().filter(|t| t.kind == QueryKind::Instant).cloned().collect();

        let mut groups = Vec::new();
        if !logs.is_empty() {
            let partition = partition_time_range(
                true,
                request.range,
                request.interval_ms,
                1,
                duration,
                self.config.max_step_points,
            );
            groups.push(QueryGroup::new(logs, partition));
        }
        if !metric.is_empty() {
            let resolution = metric.iter().filter_map(|t| t.resolution).max().unwrap_or(1);
            let partition = partition_time_range(
                false,
                request.range,
                request.interval_ms,
                resolution,
                duration,
                self.config.max_step_points,
            );
            groups.push(QueryGroup::new(metric, partition));
        }
        if !instant.is_empty() {
            groups.push(QueryGroup::new(instant, vec![request.range]));
        }

        debug!(
            groups = groups.len(),
            sub_requests = groups.iter().map(|g| g.partition.len()).sum::<usize>(),
            "built query groups"
        );
        groups
    }

    /// Run a range-split request
    pub fn run(&self, request: QueryRequest) -> QueryStream {
        let targets = self.interpolator.interpolate(&request.targets);
        let groups = self.build_groups(&request, &targets);
        SequentialGroupRunner::new(Arc::clone(&self.executor), self.config.clone())
            .with_tracker(Arc::clone(&self.tracker))
            .run(request, groups)
    }

    /// Run a shard-split request
    ///
    /// Targets must carry the placeholder shard selector; variables are
    /// interpolated before shard values are resolved.
    pub fn run_sharded<S: ShardValueSource>(
        &self,
        shard_source: Arc<S>,
        request: QueryRequest,
    ) -> QueryStream {
        let mut request = request;
        request.targets = self.interpolator.interpolate(&request.targets);
        AdaptiveShardRunner::new(
            Arc::clone(&self.executor),
            shard_source,
            self.adaptive.clone(),
        )
        .with_channel_buffer_size(self.config.channel_buffer_size)
        .with_tracker(Arc::clone(&self.tracker))
        .run(request)
    }
}

// ============================================================================
// Tests
// ============================================================================

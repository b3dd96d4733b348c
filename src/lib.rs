//! querysplit - Adaptive query-splitting and response-merging engine
//!
//! Executes a single logical log/metric query against a backend that
//! enforces limits on time-range size, cardinality and per-request cost.
//! The request is decomposed into a bounded sequence of sub-requests,
//! executed strictly sequentially, and the partial results are merged into
//! one growing, deduplicated result stream while the sub-request
//! granularity adapts to observed latency and errors.
//!
//! # Architecture
//!
//! ```text
//! QueryRequest
//!      │ classify (external) + group
//!      ▼
//! ┌──────────────┐   time chunks    ┌───────────────────────┐
//! │ partition::  │─────────────────▶│ runner::sequential     │
//! │ range/shard  │   shard batches  │ runner::shard          │
//! └──────────────┘─────────────────▶└───────────┬───────────┘
//!                                               │ one sub-request
//!                                               ▼     at a time
//!                                      SubqueryExecutor
//!                                               │
//!                                               ▼
//!                                       ┌──────────────┐
//!                                       │ merge::      │  dedup + reorder
//!                                       │ combine_into │  + stat rollup
//!                                       └──────┬───────┘
//!                                              ▼
//!                                        QueryStream ──▶ caller
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use querysplit::{QueryKind, QueryRequest, SplitQueryEngine, SubQuery, TimeRange};
//!
//! let engine = SplitQueryEngine::new(executor);
//! let request = QueryRequest::new(
//!     TimeRange::new(from_ms, to_ms)?,
//!     60_000,
//!     vec![SubQuery::new("A", "{job=\"app\"}", QueryKind::Logs)],
//! );
//!
//! let mut stream = engine.run(request);
//! while let Some(snapshot) = stream.recv().await {
//!     // snapshot grows backward in time with every sub-request
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod engine;
pub mod error;
pub mod executor;
pub mod merge;
pub mod partition;
pub mod runner;
pub mod telemetry;
pub mod types;

// Re-export main types
pub use config::{AdaptiveSizeConfig, SplitConfig};
pub use engine::SplitQueryEngine;
pub use error::{Result, SplitError};
pub use executor::{ShardValueSource, SubqueryExecutor, VariableInterpolator};
pub use runner::{AdaptiveShardRunner, QueryStream, SequentialGroupRunner};
pub use telemetry::{TrackEvent, TrackingSink};
pub use types::{
    LoadingState, MergedResponse, QueryKind, QueryRequest, QueryResponse, SubQuery, TimeRange,
};

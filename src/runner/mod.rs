//! Sub-request execution runners
//!
//! Runners drive the sequential execution of the sub-requests produced by
//! the partitioners and feed every partial response through the merger,
//! emitting the growing [`MergedResponse`](crate::types::MergedResponse)
//! over a channel after each completion.
//!
//! # Architecture
//!
//! ```text
//! QueryRequest
//!      │
//!      ▼
//! ┌──────────────────────┐   one sub-request in flight at a time
//! │ SequentialGroupRunner │──────────────┐
//! │ AdaptiveShardRunner   │              ▼
//! └──────────┬───────────┘      SubqueryExecutor
//!            │ combine_into              │
//!            ▼                           │ QueryResponse
//! ┌──────────────────────┐              │
//! │    MergedResponse    │◀─────────────┘
//! └──────────┬───────────┘
//!            │ emit after every completion
//!            ▼
//!       QueryStream ──── cancel() ───▶ aborts in-flight sub-request
//! ```
//!
//! Sub-requests are issued strictly sequentially per logical run: the
//! adaptive sizing feedback needs each batch's outcome before choosing the
//! next size, and a single in-flight request bounds backend load.
//! Independent runs share no mutable state.

pub mod sequential;
pub mod shard;
pub mod stream;

pub use sequential::SequentialGroupRunner;
pub use shard::{AdaptiveShardRunner, AdaptiveSizeState};
pub use stream::{CancelHandle, QueryStream};

//! Partitioning of one logical request into bounded sub-request scopes
//!
//! Two independent partitioners live here:
//!
//! - [`range`] splits the requested time range into an ordered list of
//!   contiguous sub-ranges, step-aligned for metric queries.
//! - [`shard`] groups resolved stream-shard label values into batches of
//!   adaptive size and interpolates them into target selectors.
//!
//! Both produce their output once at run start; execution order (most
//! recent partition first, most populated shard first) is the runners'
//! concern.

pub mod range;
pub mod shard;

pub use range::{effective_step_ms, partition_time_range};
pub use shard::{
    add_shard_placeholder, interpolate_shard_selector, next_shard_batch, sort_shard_values,
    SHARD_LABEL, SHARD_PLACEHOLDER,
};

//! Stream-shard partitioning and selector interpolation
//!
//! High-cardinality stream selectors are split across sub-requests by the
//! backend-assigned shard label. The resolved shard values are ordered
//! most-populated-first (descending numeric order) and consumed in
//! contiguous batches whose size the shard runner adapts between requests.
//! An empty-string "unsharded" bucket is always appended and always
//! queried on its own as the final batch.
//!
//! Target expressions carry a placeholder shard selector which gets
//! rewritten per batch:
//!
//! ```text
//! {job="app", __stream_shard__=~"__shard_value__"}
//!     batch ["7","5"]  →  __stream_shard__=~"7|5"
//!     batch ["3"]      →  __stream_shard__="3"
//!     batch [""]       →  __stream_shard__=""
//!     no shards at all →  selector removed, query runs unsharded
//! ```

use crate::types::ShardBatch;
use regex::Regex;
use std::sync::OnceLock;
use tracing::warn;

/// Label under which the backend exposes stream shards
pub const SHARD_LABEL: &str = "__stream_shard__";

/// Placeholder value replaced with the batch's shard ids
pub const SHARD_PLACEHOLDER: &str = "__shard_value__";

fn placeholder_selector() -> String {
    format!("{SHARD_LABEL}=~\"{SHARD_PLACEHOLDER}\"")
}

fn placeholder_removal_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(&format!(
            r#",?\s*{SHARD_LABEL}=~"{SHARD_PLACEHOLDER}""#
        ))
        .expect("static regex must compile")
    })
}

/// Order resolved shard values for execution
///
/// Numeric shard ids are sorted descending (most populated and most
/// recently written shards carry the highest ids) and the unsharded bucket
/// is appended last. Non-numeric values are dropped with a warning; the
/// label is backend-managed and only ever numeric.
pub fn sort_shard_values(values: Vec<String>) -> Vec<String> {
    let mut ids: Vec<i64> = Vec::with_capacity(values.len());
    for value in values {
        if value.is_empty() {
            continue;
        }
        match value.parse::<i64>() {
            Ok(id) => ids.push(id),
            Err(_) => warn!(value = %value, "ignoring non-numeric shard value"),
        }
    }
    ids.sort_unstable_by(|a, b| b.cmp(a));
    ids.dedup();

    let mut shards: Vec<String> = ids.into_iter().map(|id| id.to_string()).collect();
    shards.push(String::new());
    shards
}

/// Slice the next batch off the ordered shard list
///
/// Takes up to `size` shards starting at `cursor`, never crossing into the
/// unsharded bucket; the unsharded bucket itself is always returned as a
/// batch of exactly one. Returns `None` once the cursor is exhausted.
pub fn next_shard_batch(shards: &[String], cursor: usize, size: usize) -> Option<ShardBatch> {
    if cursor >= shards.len() {
        return None;
    }
    if shards[cursor].is_empty() {
        return Some(ShardBatch(vec![String::new()]));
    }

    let limit = (cursor + size.max(1)).min(shards.len());
    let batch: Vec<String> = shards[cursor..limit]
        .iter()
        .take_while(|shard| !shard.is_empty())
        .cloned()
        .collect();
    Some(ShardBatch(batch))
}

/// Rewrite the placeholder shard selector of an expression for one batch
///
/// `None` means no shard values could be resolved; the placeholder is
/// removed so the query runs over all streams in a single sub-request.
pub fn interpolate_shard_selector(expr: &str, batch: Option<&ShardBatch>) -> String {
    let placeholder = placeholder_selector();
    match batch {
        None => placeholder_removal_regex().replace_all(expr, "").into_owned(),
        Some(batch) if batch.is_unsharded() => {
            expr.replace(&placeholder, &format!("{SHARD_LABEL}=\"\""))
        },
        Some(batch) if batch.len() == 1 => {
            expr.replace(&placeholder, &format!("{SHARD_LABEL}=\"{}\"", batch.0[0]))
        },
        Some(batch) => expr.replace(
            &placeholder,
            &format!("{SHARD_LABEL}=~\"{}\"", batch.0.join("|")),
        ),
    }
}

/// Insert the placeholder shard selector into the first stream selector
///
/// Callers whose expressions do not yet carry the placeholder can add it
/// before shard-split execution. Expressions without a `{...}` selector
/// are returned unchanged.
pub fn add_shard_placeholder(expr: &str) -> String {
    if expr.contains(&placeholder_selector()) {
        return expr.to_string();
    }
    match expr.find('}') {
        Some(pos) => {
            let mut out = String::with_capacity(expr.len() + 48);
            out.push_str(&expr[..pos]);
            out.push_str(", ");
            out.push_str(&placeholder_selector());
            out.push_str(&expr[pos..]);
            out
        },
        None => expr.to_string(),
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn shards(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    #[test]
    fn test_sort_shard_values_descending_with_unsharded_bucket() {
        let sorted = sort_shard_values(shards(&["3", "17", "5", "1"]));
        assert_eq!(sorted, shards(&["17", "5", "3", "1", ""]));
    }

    #[test]
    fn test_sort_shard_values_drops_non_numeric() {
        let sorted = sort_shard_values(shards(&["2", "bogus", "9"]));
        assert_eq!(sorted, shards(&["9", "2", ""]));
    }

    #[test]
    fn test_sort_shard_values_empty_input_keeps_unsharded_bucket() {
        assert_eq!(sort_shard_values(Vec::new()), shards(&[""]));
    }

    #[test]
    fn test_next_batch_respects_size() {
        let list = shards(&["9", "7", "5", "3", "1", ""]);
        let batch = next_shard_batch(&list, 0, 2).unwrap();
        assert_eq!(batch.0, shards(&["9", "7"]));
        let batch = next_shard_batch(&list, 2, 2).unwrap();
        assert_eq!(batch.0, shards(&["5", "3"]));
    }

    #[test]
    fn test_next_batch_never_crosses_into_unsharded_bucket() {
        let list = shards(&["9", "7", ""]);
        let batch = next_shard_batch(&list, 0, 5).unwrap();
        assert_eq!(batch.0, shards(&["9", "7"]));
        let batch = next_shard_batch(&list, 2, 5).unwrap();
        assert!(batch.is_unsharded());
        assert_eq!(batch.len(), 1);
    }

    #[test]
    fn test_next_batch_exhausted_cursor() {
        let list = shards(&["9", ""]);
        assert!(next_shard_batch(&list, 2, 1).is_none());
    }

    #[test]
    fn test_interpolate_multi_shard_batch() {
        let expr = r#"{job="app", __stream_shard__=~"__shard_value__"} |= "error""#;
        let batch = ShardBatch(shards(&["7", "5"]));
        assert_eq!(
            interpolate_shard_selector(expr, Some(&batch)),
            r#"{job="app", __stream_shard__=~"7|5"} |= "error""#
        );
    }

    #[test]
    fn test_interpolate_single_shard_uses_equality() {
        let expr = r#"{job="app", __stream_shard__=~"__shard_value__"}"#;
        let batch = ShardBatch(shards(&["3"]));
        assert_eq!(
            interpolate_shard_selector(expr, Some(&batch)),
            r#"{job="app", __stream_shard__="3"}"#
        );
    }

    #[test]
    fn test_interpolate_unsharded_bucket_uses_empty_equality() {
        let expr = r#"{job="app", __stream_shard__=~"__shard_value__"}"#;
        let batch = ShardBatch(vec![String::new()]);
        assert_eq!(
            interpolate_shard_selector(expr, Some(&batch)),
            r#"{job="app", __stream_shard__=""}"#
        );
    }

    #[test]
    fn test_interpolate_without_shards_removes_selector() {
        let expr = r#"{job="app", __stream_shard__=~"__shard_value__"} |= "error""#;
        assert_eq!(
            interpolate_shard_selector(expr, None),
            r#"{job="app"} |= "error""#
        );
    }

    #[test]
    fn test_add_placeholder_into_stream_selector() {
        let expr = r#"sum(rate({job="app"}[5m]))"#;
        assert_eq!(
            add_shard_placeholder(expr),
            r#"sum(rate({job="app", __stream_shard__=~"__shard_value__"}[5m]))"#
        );
    }

    #[test]
    fn test_add_placeholder_is_idempotent() {
        let expr = r#"{job="app", __stream_shard__=~"__shard_value__"}"#;
        assert_eq!(add_shard_placeholder(expr), expr);
    }

    #[test]
    fn test_add_placeholder_without_selector_is_noop() {
        assert_eq!(add_shard_placeholder("vector(1)"), "vector(1)");
    }
}

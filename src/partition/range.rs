//! Time-range partitioning
//!
//! Splits one requested time range into an ascending list of contiguous
//! sub-ranges. Consecutive sub-ranges share exactly one endpoint value, so
//! the shared boundary sample can never be dropped; the response merger
//! deduplicates it by exact timestamp identity if the backend reports it
//! twice.
//!
//! Metric queries are chunked on step-aligned boundaries so every
//! sub-request evaluates the same sample grid as the unsplit query would.
//! Logs queries are chunked by plain wall-clock duration.
//!
//! The runners consume partition lists from the tail, executing the most
//! recent sub-range first.

use crate::types::TimeRange;
use tracing::debug;

/// Align a timestamp down to a multiple of `step`
fn align_down(value: i64, step: i64) -> i64 {
    value - value.rem_euclid(step)
}

/// Align a timestamp up to a multiple of `step`
fn align_up(value: i64, step: i64) -> i64 {
    let rem = value.rem_euclid(step);
    if rem == 0 {
        value
    } else {
        value - rem + step
    }
}

/// Effective sampling step for a metric query
///
/// The caller-provided interval is scaled by the target resolution factor
/// and then raised, if necessary, so the requested range spans at most
/// `max_step_points` samples. This caps the cost of a single sub-request
/// regardless of how wide the range is.
pub fn effective_step_ms(
    range: TimeRange,
    interval_ms: i64,
    resolution: i64,
    max_step_points: i64,
) -> i64 {
    let scaled = interval_ms.max(1) * resolution.max(1);
    let span = range.duration_ms();
    // ceil(span / max_step_points)
    let safe_step = (span + max_step_points - 1) / max_step_points;
    scaled.max(safe_step)
}

/// Chunk a logs range by wall-clock duration
///
/// Walks backward from `to` in `duration_ms` steps, clamping the earliest
/// chunk at `from`, then reverses to ascending order. Returns `None` when
/// no split is possible or needed, in which case the caller falls back to
/// the original range.
fn logs_range_chunks(from: i64, to: i64, duration_ms: i64) -> Option<Vec<TimeRange>> {
    if duration_ms <= 0 || to - from <= duration_ms {
        return None;
    }

    let mut chunks = Vec::new();
    let mut chunk_end = to;
    while chunk_end > from {
        let chunk_start = (chunk_end - duration_ms).max(from);
        chunks.push(TimeRange {
            from: chunk_start,
            to: chunk_end,
        });
        chunk_end = chunk_start;
    }

    chunks.reverse();
    Some(chunks)
}

/// Chunk a metric range on step-aligned boundaries
///
/// The range is widened to step multiples (start down, end up) and the
/// chunk duration truncated to a step multiple, so every chunk boundary
/// lands on the sample grid. Walks backward from the aligned end so the
/// potentially smaller chunk sits at the oldest end of the range.
fn metric_range_chunks(from: i64, to: i64, step_ms: i64, duration_ms: i64) -> Option<Vec<TimeRange>> {
    if step_ms <= 0 {
        return None;
    }

    let aligned_from = align_down(from, step_ms);
    let aligned_to = align_up(to, step_ms);
    let aligned_duration = (duration_ms / step_ms) * step_ms;

    if aligned_duration < step_ms || aligned_to - aligned_from <= aligned_duration {
        return None;
    }

    let mut chunks = Vec::new();
    let mut chunk_end = aligned_to;
    while chunk_end > aligned_from {
        let chunk_start = (chunk_end - aligned_duration).max(aligned_from);
        chunks.push(TimeRange {
            from: chunk_start,
            to: chunk_end,
        });
        chunk_end = chunk_start;
    }

    chunks.reverse();
    Some(chunks)
}

/// Partition a requested time range into ordered sub-ranges
///
/// Returns an ascending list of contiguous [`TimeRange`]s covering the
/// request. When the range is too small to split (or, for metrics, the
/// chunk duration is below the effective step) the original range is
/// returned unchanged as a single-element list.
///
/// # Arguments
///
/// * `is_logs_query` - classification of the group's targets
/// * `range` - the requested range
/// * `interval_ms` - caller interval, input to the metric step
/// * `resolution` - per-target resolution factor (1 when unset)
/// * `ideal_duration_ms` - ideal chunk duration from config or request
/// * `max_step_points` - sample-count cap raising the effective step
pub fn partition_time_range(
    is_logs_query: bool,
    range: TimeRange,
    interval_ms: i64,
    resolution: i64,
    ideal_duration_ms: i64,
    max_step_points: i64,
) -> Vec<TimeRange> {
    let chunks = if is_logs_query {
        logs_range_chunks(range.from, range.to, ideal_duration_ms)
    } else {
        let step = effective_step_ms(range, interval_ms, resolution, max_step_points);
        metric_range_chunks(range.from, range.to, step, ideal_duration_ms)
    };

    match chunks {
        Some(chunks) => chunks,
        None => {
            debug!(
                from = range.from,
                to = range.to,
                duration_ms = ideal_duration_ms,
                "range not splittable, using original range"
            );
            vec![range]
        },
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    const HOUR_MS: i64 = 60 * 60 * 1000;
    const DAY_MS: i64 = 24 * HOUR_MS;

    fn ts(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> i64 {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, s)
            .unwrap()
            .timestamp_millis()
    }

    fn assert_contiguous(chunks: &[TimeRange]) {
        for pair in chunks.windows(2) {
            assert_eq!(pair[0].to, pair[1].from, "gap between {} and {}", pair[0], pair[1]);
        }
    }

    // ------------------------------------------------------------------
    // Logs path
    // ------------------------------------------------------------------

    #[test]
    fn test_logs_three_day_range_in_day_chunks() {
        let from = ts(2023, 2, 8, 6, 0, 0);
        let to = from + 3 * DAY_MS;
        let range = TimeRange { from, to };

        let chunks = partition_time_range(true, range, 60_000, 1, DAY_MS, 11_000);

        assert_eq!(chunks.len(), 3);
        assert_contiguous(&chunks);
        assert_eq!(chunks[0].from, from);
        assert_eq!(chunks[2].to, to);
        for chunk in &chunks {
            assert_eq!(chunk.duration_ms(), DAY_MS);
        }
    }

    #[test]
    fn test_logs_partial_chunk_is_oldest() {
        let from = ts(2022, 2, 6, 14, 10, 3);
        let to = ts(2022, 2, 8, 14, 11, 3);
        let range = TimeRange { from, to };

        let chunks = partition_time_range(true, range, 60_000, 1, DAY_MS, 11_000);

        // 2 days and 1 minute: two full days plus a 1-minute remainder,
        // clamped at the oldest end.
        assert_eq!(chunks.len(), 3);
        assert_contiguous(&chunks);
        assert_eq!(chunks[0].duration_ms(), 60_000);
        assert_eq!(chunks[1].duration_ms(), DAY_MS);
        assert_eq!(chunks[2].duration_ms(), DAY_MS);
        assert_eq!(chunks[2].to, to);
    }

    #[test]
    fn test_logs_range_smaller_than_duration_is_unsplit() {
        let range = TimeRange { from: 0, to: DAY_MS - 1 };
        let chunks = partition_time_range(true, range, 60_000, 1, DAY_MS, 11_000);
        assert_eq!(chunks, vec![range]);
    }

    #[test]
    fn test_logs_range_equal_to_duration_is_unsplit() {
        let range = TimeRange { from: 0, to: DAY_MS };
        let chunks = partition_time_range(true, range, 60_000, 1, DAY_MS, 11_000);
        assert_eq!(chunks, vec![range]);
    }

    #[test]
    fn test_logs_cover_original_range_exactly() {
        let range = TimeRange {
            from: 171,
            to: 171 + 10 * HOUR_MS + 13,
        };
        let chunks = partition_time_range(true, range, 1000, 1, HOUR_MS, 11_000);
        assert_contiguous(&chunks);
        assert_eq!(chunks.first().unwrap().from, range.from);
        assert_eq!(chunks.last().unwrap().to, range.to);
    }

    // ------------------------------------------------------------------
    // Metric path
    // ------------------------------------------------------------------

    #[test]
    fn test_metric_two_day_range_step_aligned() {
        let from = ts(2022, 2, 6, 14, 10, 3);
        let to = ts(2022, 2, 8, 14, 11, 3);
        let range = TimeRange { from, to };

        let chunks = partition_time_range(false, range, HOUR_MS, 1, DAY_MS, 11_000);

        // Aligned span is 49h: two full-day chunks of 24 one-hour steps
        // plus one partial chunk, clamped at the aligned start.
        assert_eq!(chunks.len(), 3);
        assert_contiguous(&chunks);
        assert_eq!(chunks[0].from, ts(2022, 2, 6, 14, 0, 0));
        assert_eq!(chunks[0].to, ts(2022, 2, 6, 15, 0, 0));
        assert_eq!(chunks[1].duration_ms(), DAY_MS);
        assert_eq!(chunks[2].duration_ms(), DAY_MS);
        assert_eq!(chunks[2].to, ts(2022, 2, 8, 15, 0, 0));
        for chunk in &chunks {
            assert_eq!(chunk.from % HOUR_MS, 0);
            assert_eq!(chunk.to % HOUR_MS, 0);
        }
    }

    #[test]
    fn test_metric_duration_truncated_to_step_multiple() {
        let range = TimeRange { from: 0, to: 10 * HOUR_MS };
        // 2.5h duration truncates to 2h chunks
        let chunks = partition_time_range(false, range, HOUR_MS, 1, 2 * HOUR_MS + 30 * 60 * 1000, 11_000);
        assert_eq!(chunks.len(), 5);
        assert_contiguous(&chunks);
        for chunk in &chunks {
            assert_eq!(chunk.duration_ms(), 2 * HOUR_MS);
        }
    }

    #[test]
    fn test_metric_duration_below_step_is_unsplit() {
        let range = TimeRange { from: 0, to: 10 * HOUR_MS };
        let chunks = partition_time_range(false, range, HOUR_MS, 1, HOUR_MS - 1, 11_000);
        assert_eq!(chunks, vec![range]);
    }

    #[test]
    fn test_metric_aligned_span_within_duration_is_unsplit() {
        let range = TimeRange { from: 0, to: DAY_MS };
        let chunks = partition_time_range(false, range, HOUR_MS, 1, DAY_MS, 11_000);
        assert_eq!(chunks, vec![range]);
    }

    #[test]
    fn test_metric_resolution_scales_step() {
        let range = TimeRange { from: 0, to: 10 * HOUR_MS };
        // resolution 5 raises the step to 5h, above the 2h duration
        let chunks = partition_time_range(false, range, HOUR_MS, 5, 2 * HOUR_MS, 11_000);
        assert_eq!(chunks, vec![range]);
    }

    #[test]
    fn test_metric_contiguity_property() {
        for (from, to, step, duration) in [
            (0_i64, 7 * DAY_MS, HOUR_MS, DAY_MS),
            (1234, 3 * DAY_MS + 7, 60_000, 6 * HOUR_MS),
            (999, DAY_MS + 999, 1000, HOUR_MS),
        ] {
            let range = TimeRange { from, to };
            let chunks = partition_time_range(false, range, step, 1, duration, 11_000);
            assert_contiguous(&chunks);
            assert!(chunks.first().unwrap().from <= from);
            assert!(chunks.last().unwrap().to >= to);
        }
    }

    // ------------------------------------------------------------------
    // Effective step
    // ------------------------------------------------------------------

    #[test]
    fn test_effective_step_uses_scaled_interval() {
        let range = TimeRange { from: 0, to: HOUR_MS };
        assert_eq!(effective_step_ms(range, 30_000, 2, 11_000), 60_000);
    }

    #[test]
    fn test_effective_step_caps_point_count() {
        // One year at a 1s interval would be millions of points; the safe
        // step raises the interval until at most 11000 points remain.
        let year_ms = 365 * DAY_MS;
        let range = TimeRange { from: 0, to: year_ms };
        let step = effective_step_ms(range, 1000, 1, 11_000);
        assert!(step >= year_ms / 11_000);
        assert!(year_ms / step <= 11_000);
    }
}

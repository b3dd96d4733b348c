//! Response merging
//!
//! Merges the responses of consecutive sub-requests into one coherent,
//! deduplicated, time-ordered result. Frames are matched by reference id,
//! name and frame type (plus value-field label set for multi-series
//! metrics); matched frames are merged sample by sample, everything else
//! is appended.
//!
//! Sample identity is the exact `(time, nanos)` pair, extended with the
//! per-row `id` value for log frames. A sample that already exists is
//! never duplicated: numeric fields are summed, structured fields are
//! shallow-merged and remaining fields replaced. New samples are inserted
//! at their sorted position, so partial results arriving out of temporal
//! order still produce an ascending result.
//!
//! Merging identical data twice yields identical samples, which is what
//! makes the contiguous-partition boundary sample safe: both neighboring
//! sub-requests may report it, only one copy survives.

use crate::types::{
    Field, FieldValues, Frame, FrameType, LoadingState, MergedResponse, QueryResponse, StatItem,
};
use std::collections::BTreeMap;
use tracing::warn;

/// Stat accumulated across sub-responses: bytes processed by the backend
pub const TOTAL_BYTES_STAT: &str = "Summary: total bytes processed";

/// Stat accumulated across sub-responses: backend execution time (seconds)
pub const EXEC_TIME_STAT: &str = "Summary: exec time";

// ============================================================================
// Response combination
// ============================================================================

/// Combine a sub-response into the accumulated merged response
///
/// With `dest == None` (first sub-response) the incoming response is
/// deep-cloned into a fresh [`MergedResponse`]. Each incoming response must
/// be fed exactly once; the dedup contract does not protect against the
/// caller re-merging the same response object.
pub fn combine_responses(dest: Option<MergedResponse>, incoming: &QueryResponse) -> MergedResponse {
    match dest {
        None => clone_into_merged(incoming),
        Some(mut merged) => {
            combine_into(&mut merged, incoming);
            merged
        },
    }
}

/// Merge a sub-response into an existing accumulator in place
pub fn combine_into(dest: &mut MergedResponse, incoming: &QueryResponse) {
    for frame in &incoming.data {
        match dest.data.iter_mut().find(|d| should_combine(d, frame)) {
            Some(existing) => merge_frames(existing, frame),
            None => dest.data.push(frame.clone()),
        }
    }

    accumulate_errors(dest, incoming);
    dest.trace_ids.extend(incoming.trace_ids.iter().cloned());
}

fn clone_into_merged(incoming: &QueryResponse) -> MergedResponse {
    let mut merged = MergedResponse::new();
    merged.data = incoming.data.clone();
    merged.state = incoming.state;
    merged.error = incoming.error.clone();
    merged.trace_ids = incoming.trace_ids.clone();
    merged.errors = incoming.errors.clone();
    if merged.errors.is_empty() {
        if let Some(error) = &incoming.error {
            merged.errors.push(error.clone());
        }
    }
    merged
}

/// Record the incoming response's errors without stopping accumulation
///
/// A response carrying only the legacy single `error` still lands in the
/// accumulated list exactly once; a response carrying both is not counted
/// twice. The first error seen is kept as the primary one.
fn accumulate_errors(dest: &mut MergedResponse, incoming: &QueryResponse) {
    if incoming.errors.is_empty() {
        if let Some(error) = &incoming.error {
            dest.errors.push(error.clone());
        }
    } else {
        dest.errors.extend(incoming.errors.iter().cloned());
    }
    if dest.error.is_none() {
        dest.error = incoming.error.clone();
    }
}

/// Whether two frames represent the same logical result set
fn should_combine(a: &Frame, b: &Frame) -> bool {
    if a.ref_id != b.ref_id || a.name != b.name {
        return false;
    }
    if a.meta.frame_type != b.meta.frame_type {
        return false;
    }
    if a.meta.frame_type == FrameType::TimeSeriesMulti {
        // Multi-series frames share refId and name; the value field's
        // label set is the series identity.
        let empty = BTreeMap::new();
        let labels_a = a.value_field_labels().unwrap_or(&empty);
        let labels_b = b.value_field_labels().unwrap_or(&empty);
        return labels_a == labels_b;
    }
    true
}

// ============================================================================
// Frame merging
// ============================================================================

/// Merge the source frame's samples into the destination frame
///
/// Destination rows stay sorted by `(time, nanos)`; source rows are
/// assumed sorted the same way, as returned by the backend.
pub fn merge_frames(dest: &mut Frame, source: &Frame) {
    let (dest_time, source_time) = match (dest.time_field_index(), source.time_field_index()) {
        (Some(d), Some(s)) => (d, s),
        _ => {
            warn!(ref_id = %source.ref_id, "time fields not found, skipping frame merge");
            return;
        },
    };
    let dest_id = dest.id_field_index();
    let source_id = source.id_field_index();

    let source_len = source.fields[source_time].values.len();
    for row in 0..source_len {
        let (ms, nanos) = time_at(&source.fields[source_time].values, row);
        let row_id = source_id.and_then(|idx| string_at(&source.fields[idx].values, row));

        let insert_at = lower_bound(&dest.fields[dest_time].values, ms, nanos);
        let existing = find_duplicate(
            &dest.fields[dest_time].values,
            dest_id.map(|idx| &dest.fields[idx].values),
            insert_at,
            ms,
            nanos,
            row_id.as_deref(),
        );

        match existing {
            Some(dest_row) => merge_existing_row(dest, source, dest_row, row),
            None => insert_row(dest, source, dest_time, insert_at, row, ms, nanos),
        }
    }

    dest.recompute_length();
    dest.meta.stats = combine_stats(&dest.meta.stats, &source.meta.stats);
}

/// Accumulate a source row into an existing destination row
fn merge_existing_row(dest: &mut Frame, source: &Frame, dest_row: usize, source_row: usize) {
    for field_idx in 0..dest.fields.len() {
        if dest.fields[field_idx].values.is_time() {
            // Identical by definition of a duplicate, leave untouched
            continue;
        }
        let source_field = match find_source_field(&dest.fields[field_idx], &source.fields, field_idx)
        {
            Some(idx) => &source.fields[idx],
            None => continue,
        };

        match (&mut dest.fields[field_idx].values, &source_field.values) {
            (FieldValues::Number(dest_vals), FieldValues::Number(source_vals)) => {
                if let Some(Some(value)) = source_vals.get(source_row) {
                    let current = dest_vals[dest_row].unwrap_or(0.0);
                    dest_vals[dest_row] = Some(current + value);
                }
            },
            (FieldValues::Other(dest_vals), FieldValues::Other(source_vals)) => {
                if let Some(Some(value)) = source_vals.get(source_row) {
                    dest_vals[dest_row] = Some(shallow_merge(dest_vals[dest_row].take(), value));
                }
            },
            (FieldValues::String(dest_vals), FieldValues::String(source_vals)) => {
                if let Some(value) = source_vals.get(source_row) {
                    dest_vals[dest_row] = value.clone();
                }
            },
            _ => {},
        }
    }
}

/// Insert a source row into every destination column at the given index
fn insert_row(
    dest: &mut Frame,
    source: &Frame,
    dest_time: usize,
    insert_at: usize,
    source_row: usize,
    ms: i64,
    nanos: i64,
) {
    for field_idx in 0..dest.fields.len() {
        if field_idx == dest_time {
            insert_time(&mut dest.fields[field_idx].values, insert_at, ms, nanos);
            continue;
        }
        let source_field = find_source_field(&dest.fields[field_idx], &source.fields, field_idx);
        match source_field {
            Some(idx) => insert_from_source(
                &mut dest.fields[field_idx].values,
                insert_at,
                &source.fields[idx].values,
                source_row,
            ),
            // Keep columns aligned even when the source frame lacks the field
            None => insert_null(&mut dest.fields[field_idx].values, insert_at),
        }
    }
}

/// Resolve the source field corresponding to a destination field
///
/// Matched by name; several same-named candidates are disambiguated by
/// label set, with the positional index as a last resort.
fn find_source_field(dest_field: &Field, source_fields: &[Field], fallback_idx: usize) -> Option<usize> {
    let candidates: Vec<usize> = source_fields
        .iter()
        .enumerate()
        .filter(|(_, f)| f.name == dest_field.name)
        .map(|(i, _)| i)
        .collect();

    match candidates.len() {
        0 => None,
        1 => Some(candidates[0]),
        _ => candidates
            .iter()
            .copied()
            .find(|&i| source_fields[i].labels == dest_field.labels)
            .or_else(|| {
                (fallback_idx < source_fields.len()).then_some(fallback_idx)
            }),
    }
}

/// Shallow-merge a structured value; incoming keys win on conflict
fn shallow_merge(
    existing: Option<serde_json::Value>,
    incoming: &serde_json::Value,
) -> serde_json::Value {
    match (existing, incoming) {
        (Some(serde_json::Value::Object(mut dest_map)), serde_json::Value::Object(source_map)) => {
            for (key, value) in source_map {
                dest_map.insert(key.clone(), value.clone());
            }
            serde_json::Value::Object(dest_map)
        },
        _ => incoming.clone(),
    }
}

// ============================================================================
// Column primitives
// ============================================================================

fn time_at(values: &FieldValues, idx: usize) -> (i64, i64) {
    match values {
        FieldValues::Time { ms, nanos } => (
            ms[idx],
            nanos.as_ref().map(|n| n[idx]).unwrap_or(0),
        ),
        _ => (0, 0),
    }
}

fn string_at(values: &FieldValues, idx: usize) -> Option<String> {
    match values {
        FieldValues::String(v) => v.get(idx).cloned().flatten(),
        _ => None,
    }
}

/// First index whose `(ms, nanos)` is not below the probe
///
/// Binary search over the time column; equal millisecond values are
/// ordered by their nanosecond remainder, smaller first.
fn lower_bound(values: &FieldValues, ms: i64, nanos: i64) -> usize {
    let (dest_ms, dest_nanos) = match values {
        FieldValues::Time { ms, nanos } => (ms, nanos),
        _ => return 0,
    };
    let mut lo = 0usize;
    let mut hi = dest_ms.len();
    while lo < hi {
        let mid = (lo + hi) / 2;
        let mid_nanos = dest_nanos.as_ref().map(|n| n[mid]).unwrap_or(0);
        if (dest_ms[mid], mid_nanos) < (ms, nanos) {
            lo = mid + 1;
        } else {
            hi = mid;
        }
    }
    lo
}

/// Scan the run of equal `(ms, nanos)` rows for an exact duplicate
///
/// Log frames additionally require the per-row id to match; several log
/// lines may legitimately share one timestamp.
fn find_duplicate(
    time_values: &FieldValues,
    id_values: Option<&FieldValues>,
    start: usize,
    ms: i64,
    nanos: i64,
    row_id: Option<&str>,
) -> Option<usize> {
    let len = time_values.len();
    let mut idx = start;
    while idx < len {
        let (candidate_ms, candidate_nanos) = time_at(time_values, idx);
        if (candidate_ms, candidate_nanos) != (ms, nanos) {
            return None;
        }
        let candidate_id = id_values.and_then(|v| string_at(v, idx));
        if candidate_id.as_deref() == row_id {
            return Some(idx);
        }
        idx += 1;
    }
    None
}

fn insert_time(values: &mut FieldValues, idx: usize, ms_value: i64, nanos_value: i64) {
    if let FieldValues::Time { ms, nanos } = values {
        ms.insert(idx, ms_value);
        match nanos {
            Some(nanos) => nanos.insert(idx, nanos_value),
            None if nanos_value != 0 => {
                // Materialize the companion column, defaulting existing
                // rows to a zero remainder.
                let mut materialized = vec![0; ms.len() - 1];
                materialized.insert(idx, nanos_value);
                *nanos = Some(materialized);
            },
            None => {},
        }
    }
}

fn insert_from_source(dest: &mut FieldValues, idx: usize, source: &FieldValues, source_row: usize) {
    match (dest, source) {
        (FieldValues::Number(dest_vals), FieldValues::Number(source_vals)) => {
            dest_vals.insert(idx, source_vals.get(source_row).cloned().flatten());
        },
        (FieldValues::String(dest_vals), FieldValues::String(source_vals)) => {
            dest_vals.insert(idx, source_vals.get(source_row).cloned().flatten());
        },
        (FieldValues::Other(dest_vals), FieldValues::Other(source_vals)) => {
            dest_vals.insert(idx, source_vals.get(source_row).cloned().flatten());
        },
        (dest, _) => insert_null(dest, idx),
    }
}

fn insert_null(dest: &mut FieldValues, idx: usize) {
    match dest {
        FieldValues::Time { ms, nanos } => {
            ms.insert(idx, 0);
            if let Some(nanos) = nanos {
                nanos.insert(idx, 0);
            }
        },
        FieldValues::Number(v) => v.insert(idx, None),
        FieldValues::String(v) => v.insert(idx, None),
        FieldValues::Other(v) => v.insert(idx, None),
    }
}

// ============================================================================
// Stats
// ============================================================================

/// Combine frame metadata stats across two sub-responses
///
/// Only the two well-known summary statistics are accumulated; a stat
/// present on one side only passes through unchanged.
pub fn combine_stats(dest: &[StatItem], source: &[StatItem]) -> Vec<StatItem> {
    let mut combined = Vec::new();
    for name in [TOTAL_BYTES_STAT, EXEC_TIME_STAT] {
        let dest_stat = dest.iter().find(|s| s.display_name == name);
        let source_stat = source.iter().find(|s| s.display_name == name);
        match (dest_stat, source_stat) {
            (Some(d), Some(s)) => combined.push(StatItem {
                display_name: name.to_string(),
                value: d.value + s.value,
                unit: d.unit.clone(),
            }),
            (Some(d), None) => combined.push(d.clone()),
            (None, Some(s)) => combined.push(s.clone()),
            (None, None) => {},
        }
    }
    combined
}

/// Mark a merged response as terminally failed
pub fn mark_failed(dest: &mut MergedResponse, message: impl Into<String>) {
    let error = crate::types::ResponseError::new(message);
    if dest.error.is_none() {
        dest.error = Some(error.clone());
    }
    dest.errors.push(error);
    dest.state = LoadingState::Error;
}

// ============================================================================
// Tests
// ============================================================================

//! Per-shard search-limit law and cross-shard result merge (SPEC_FULL.md §4.7 `SearchPoints`
//! steps 1-2 and 5), split out from `actions` so the arithmetic is directly unit-testable.

use shard_engine::{SearchResult, SortSpec};
use std::cmp::Ordering;
use std::collections::HashMap;

/// `target = floor(L * (1/n) * 1.42 + 10)`, clamped above by `min(maxSearchLimit, L)`.
pub fn per_shard_limit(requested_limit: usize, shard_count: usize, max_search_limit: usize) -> usize {
    if shard_count == 0 {
        return requested_limit;
    }
    let l = requested_limit as f64;
    let n = shard_count as f64;
    let approx = (l * (1.0 / n) * 1.42 + 10.0).floor() as usize;
    approx.min(max_search_limit).min(requested_limit)
}

/// Divides `offset` across shards when it splits evenly; otherwise leaves it as-is and relies
/// on the final trim for correctness (documented in SPEC_FULL.md as "eventual correctness,
/// variable efficiency").
pub fn per_shard_offset(offset: usize, shard_count: usize) -> usize {
    if shard_count > 1 && offset % shard_count == 0 {
        offset / shard_count
    } else {
        offset
    }
}

/// Stable-sorts merged per-shard results and trims to `limit`.
///
/// With no `sort` spec, ascending `distance` (missing distance treated as 0). With a `sort`
/// spec, multi-level order over each result's `decodedData`, using the asymmetric
/// missing-value rule from §4.7 step 5: an element missing the property sorts after one that
/// has it, regardless of which side of the comparison it's on.
pub fn merge_results(mut results: Vec<SearchResult>, sort: &[SortSpec], limit: usize) -> Vec<SearchResult> {
    if sort.is_empty() {
        results.sort_by(|a, b| {
            let da = a.distance.unwrap_or(0.0);
            let db = b.distance.unwrap_or(0.0);
            da.partial_cmp(&db).unwrap_or(Ordering::Equal)
        });
    } else {
        results.sort_by(|a, b| compare_by_sort_spec(a, b, sort));
    }
    results.truncate(limit);
    results
}

fn compare_by_sort_spec(a: &SearchResult, b: &SearchResult, sort: &[SortSpec]) -> Ordering {
    let mut cache: HashMap<(bool, &str), Option<serde_json::Value>> = HashMap::new();
    for spec in sort {
        let av = property_of(a, &spec.property, true, &mut cache);
        let bv = property_of(b, &spec.property, false, &mut cache);

        let ordering = match (av, bv) {
            (Some(av), Some(bv)) => compare_json(av, bv),
            (None, Some(_)) => Ordering::Greater,
            (Some(_), None) => Ordering::Less,
            (None, None) => Ordering::Equal,
        };
        let ordering = if spec.descending { ordering.reverse() } else { ordering };
        if ordering != Ordering::Equal {
            return ordering;
        }
    }
    Ordering::Equal
}

fn property_of<'a>(
    result: &'a SearchResult,
    property: &'a str,
    _is_left: bool,
    cache: &mut HashMap<(bool, &'a str), Option<serde_json::Value>>,
) -> Option<serde_json::Value> {
    cache
        .entry((_is_left, property))
        .or_insert_with(|| result.decoded_data.as_ref().and_then(|m| m.get(property).cloned()))
        .clone()
}

fn compare_json(a: serde_json::Value, b: serde_json::Value) -> Ordering {
    match (a.as_f64(), b.as_f64()) {
        (Some(a), Some(b)) => a.partial_cmp(&b).unwrap_or(Ordering::Equal),
        _ => a.to_string().cmp(&b.to_string()),
    }
}

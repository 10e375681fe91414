//! Pure point-to-shard distribution policy (SPEC_FULL.md §4.7 step 4), split out from
//! `actions::insert_points` so the packing logic is testable without spinning up RPCs.

use std::ops::Range;

use collection::ShardId;

/// A shard's current fill level, as reported by `GetShardsInfo`.
#[derive(Debug, Clone, Copy)]
pub struct ShardFill {
    pub size: u64,
    pub point_count: u64,
}

/// Where a contiguous range of (already-sorted) points should land: an existing shard, or the
/// `n`th shard this plan asks the caller to create (0-indexed, in creation order).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    Existing(ShardId),
    New(usize),
}

#[derive(Debug, Clone)]
pub struct PlannedRange {
    pub target: Target,
    pub range: Range<usize>,
}

/// Fills existing shards up to `max_shard_point_count`/`max_shard_size`, in order, creating new
/// shards on demand once every existing one is full (or none exist yet). `point_sizes[i]` is the
/// byte size of `points[i]`'s `data`, used to approximate size-based capacity.
pub fn plan_point_ranges(
    existing: &[(ShardId, ShardFill)],
    point_sizes: &[usize],
    max_shard_size: u64,
    max_shard_point_count: u64,
) -> Vec<PlannedRange> {
    let mut plans = Vec::new();
    if point_sizes.is_empty() {
        return plans;
    }
    // A zero cap would make the inner `while` below never advance `cursor`, spinning the outer
    // `loop` forever. Clamp to 1 so every freshly-created `ShardFill` admits at least one point.
    let max_shard_size = max_shard_size.max(1);
    let max_shard_point_count = max_shard_point_count.max(1);

    let mut fills: Vec<ShardFill> = existing.iter().map(|(_, fill)| *fill).collect();
    let mut new_shard_count = 0usize;
    let mut cursor = 0usize;
    let mut shard_index = 0usize;

    loop {
        let fill = if shard_index < fills.len() {
            &mut fills[shard_index]
        } else {
            fills.push(ShardFill { size: 0, point_count: 0 });
            new_shard_count += 1;
            fills.last_mut().unwrap()
        };

        let target = if shard_index < existing.len() {
            Target::Existing(existing[shard_index].0)
        } else {
            Target::New(shard_index - existing.len())
        };

        let range_start = cursor;
        while cursor < point_sizes.len()
            && fill.point_count < max_shard_point_count
            && fill.size < max_shard_size
        {
            fill.point_count += 1;
            fill.size += point_sizes[cursor] as u64;
            cursor += 1;
        }

        if cursor > range_start {
            plans.push(PlannedRange { target, range: range_start..cursor });
        }

        if cursor >= point_sizes.len() {
            break;
        }
        shard_index += 1;
    }

    let _ = new_shard_count;
    plans
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn fills_existing_shard_before_creating_new_ones() {
        let shard = Uuid::new_v4();
        let existing = vec![(shard, ShardFill { size: 0, point_count: 0 })];
        let sizes = vec![10, 10, 10];

        let plan = plan_point_ranges(&existing, &sizes, 1_000_000, 2);

        assert_eq!(plan.len(), 2);
        assert_eq!(plan[0].target, Target::Existing(shard));
        assert_eq!(plan[0].range, 0..2);
        assert_eq!(plan[1].target, Target::New(0));
        assert_eq!(plan[1].range, 2..3);
    }

    #[test]
    fn covers_every_point_with_disjoint_contiguous_ranges() {
        let sizes = vec![1; 10];
        let plan = plan_point_ranges(&[], &sizes, 1_000_000, 3);

        let mut covered = 0usize;
        for (i, p) in plan.iter().enumerate() {
            assert_eq!(p.range.start, covered);
            covered = p.range.end;
            if i == 0 {
                assert_eq!(p.target, Target::New(0));
            }
        }
        assert_eq!(covered, 10);
        // ceil(10/3) = 4 shards total, so 4 "New" targets when starting empty.
        assert_eq!(plan.len(), 4);
    }

    #[test]
    fn starts_first_shard_on_demand_when_empty() {
        let sizes = vec![5];
        let plan = plan_point_ranges(&[], &sizes, 1_000_000, 10);
        assert_eq!(plan.len(), 1);
        assert_eq!(plan[0].target, Target::New(0));
        assert_eq!(plan[0].range, 0..1);
    }

    #[test]
    fn respects_size_cap_as_well_as_count_cap() {
        let sizes = vec![40, 40, 40];
        let plan = plan_point_ranges(&[], &sizes, 50, 100);
        // the cap is checked before each addition, so a shard may overshoot by the last point
        // added (40 -> 80 both exceed, so the first shard still only takes two 40-byte points
        // before the next check sees 80 >= 50 and rolls over).
        assert_eq!(plan.len(), 2);
        assert_eq!(plan[0].range, 0..2);
        assert_eq!(plan[1].range, 2..3);
    }
}

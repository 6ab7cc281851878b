// usage.rs — Loop and array grouping for sparse usage functions
//
// Every loop "group function" is called once per key (e.g. per Jacobian
// column) and writes a few compressed entries. For each group this pass
// decides how those entries reach the final sparse array:
//
//   * direct: every key is ordered and the start of its block follows a
//     closed-form pattern, so the call writes straight into
//     `&result[start(it)]`;
//   * compressed: the call writes into a scratch buffer and each element
//     is added back either through a (compressed ← it, result ← it) pattern
//     pair or, when no such pair exists, through linear sections guarded by
//     an if/else chain.
//
// Calls are bucketed by number of participating keys, then loop, then group.
//
// Preconditions: every key of every group has recorded element locations
//                and an order flag.
// Postconditions: in the compressed strategy every (key, element) pair is
//                 covered by exactly one copy rule.
// Failure modes: missing/ambiguous locations, inconsistent order flags,
//                empty groups → `GenError`.
// Side effects: none.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::error::{fmt_keys, GenError, Result};
use crate::id::LoopId;
use crate::pattern::{IndexPattern, PatternDetector};

// ── Usage description ───────────────────────────────────────────────────────

/// key → compressed element positions written by one group call.
pub type KeyCompressed = BTreeMap<usize, BTreeSet<usize>>;
/// loop → group → key → compressed positions.
pub type LoopGroups = BTreeMap<LoopId, BTreeMap<usize, KeyCompressed>>;
/// key → for each compressed element, its positions in the final array.
pub type ElementLocations = BTreeMap<usize, Vec<BTreeSet<usize>>>;

/// Which sparse entries each function contributes and where they land.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SparsityUsage {
    /// Dispatch row → positions of the row in the sparse result.
    #[serde(default)]
    pub elements: BTreeMap<usize, Vec<usize>>,
    #[serde(default)]
    pub loop_groups: LoopGroups,
    /// Row → compressed elements provided by the row's non-loop function.
    #[serde(default)]
    pub non_loop_elements: BTreeMap<usize, BTreeSet<usize>>,
    pub user_el_location: ElementLocations,
    /// Whether a key's elements are stored contiguously in order.
    pub ordered: BTreeMap<usize, bool>,
    /// Number of non-zeros of the sparse result.
    pub nnz: usize,
}

// ── Grouping result ─────────────────────────────────────────────────────────

/// A run of local iterations over which one element follows single
/// compressed and result patterns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElementSection {
    pub keys: BTreeSet<usize>,
    pub result_pattern: IndexPattern,
    pub compressed_pattern: IndexPattern,
}

/// How one compressed element is copied to the final array.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArrayElementCopyPattern {
    pub result_pattern: Option<IndexPattern>,
    pub compressed_pattern: Option<IndexPattern>,
    /// Fallback when either pattern is missing; empty otherwise.
    pub sections: Vec<ElementSection>,
}

impl ArrayElementCopyPattern {
    /// Both directions have a closed form over the whole bucket.
    pub fn direct(&self) -> Option<(&IndexPattern, &IndexPattern)> {
        self.result_pattern.as_ref().zip(self.compressed_pattern.as_ref())
    }

    /// Branch shape of the sectioned fallback: first key → section keys.
    pub fn section_shape(&self) -> BTreeMap<usize, BTreeSet<usize>> {
        self.sections
            .iter()
            .filter_map(|s| s.keys.first().map(|&first| (first, s.keys.clone())))
            .collect()
    }
}

/// Keys of a group providing the same number of elements.
#[derive(Debug, Clone)]
pub struct ArrayElementGroup {
    pub keys: BTreeSet<usize>,
    pub elements: Vec<ArrayElementCopyPattern>,
}

/// Access strategy for one group function.
#[derive(Debug, Clone)]
pub struct ArrayGroup {
    /// Local iteration → key.
    pub keys: Vec<usize>,
    /// Closed form of `keys`, when one exists.
    pub pattern: Option<IndexPattern>,
    /// Start of each call's output block; set only for the direct strategy.
    pub start_loc_pattern: Option<IndexPattern>,
    /// Element count → elements, for the compressed strategy.
    pub el_count_to_elements: BTreeMap<usize, ArrayElementGroup>,
}

/// Iteration count → loop → group → strategy.
pub type LoopCalls = BTreeMap<usize, BTreeMap<LoopId, BTreeMap<usize, ArrayGroup>>>;

// ── Pattern determination ───────────────────────────────────────────────────

/// Decide the access strategy of every loop group.
pub fn determine_for_rev_usage_patterns(
    loop_groups: &LoopGroups,
    user_el_location: &ElementLocations,
    ordered: &BTreeMap<usize, bool>,
    detector: &dyn PatternDetector,
) -> Result<LoopCalls> {
    let mut loop_calls = LoopCalls::new();

    for (&loop_id, groups) in loop_groups {
        for (&group, key_compressed) in groups {
            if key_compressed.is_empty() {
                return Err(GenError::EmptyGroup { loop_id, group });
            }

            let keys: Vec<usize> = key_compressed.keys().copied().collect();
            let pattern = detector.detect(&keys);

            let mut all_ordered = true;
            for key in &keys {
                let flag = ordered
                    .get(key)
                    .copied()
                    .ok_or(GenError::MissingOrderFlag { key: *key })?;
                all_ordered &= flag;
            }

            let start_loc_pattern = if all_ordered {
                let starts = key_compressed
                    .iter()
                    .map(|(&key, compressed)| ordered_start(key, compressed, user_el_location))
                    .collect::<Result<Vec<usize>>>()?;
                detector.detect(&starts)
            } else {
                None
            };

            let el_count_to_elements = if start_loc_pattern.is_some() {
                BTreeMap::new()
            } else {
                compressed_element_groups(key_compressed, user_el_location, detector)?
            };

            debug!(
                loop_id = %loop_id,
                group,
                keys = keys.len(),
                direct = start_loc_pattern.is_some(),
                buckets = el_count_to_elements.len(),
                "grouped loop calls"
            );

            loop_calls
                .entry(keys.len())
                .or_default()
                .entry(loop_id)
                .or_default()
                .insert(
                    group,
                    ArrayGroup {
                        keys,
                        pattern,
                        start_loc_pattern,
                        el_count_to_elements,
                    },
                );
        }
    }

    Ok(loop_calls)
}

/// First final-array position of an ordered key, verifying that every
/// element `c` it provides is stored at `start + c`.
pub(crate) fn ordered_start(
    key: usize,
    compressed: &BTreeSet<usize>,
    user_el_location: &ElementLocations,
) -> Result<usize> {
    let location = user_el_location
        .get(&key)
        .ok_or(GenError::MissingLocation { key })?;
    let start = match location.first() {
        Some(first) if first.len() == 1 => first.iter().next().copied(),
        Some(_) => return Err(GenError::UnorderedArray { key, element: 0 }),
        None => None,
    }
    .ok_or(GenError::MissingLocation { key })?;

    for &c in compressed {
        let stored = location.get(c).filter(|l| l.len() == 1).and_then(|l| l.first());
        if stored != Some(&(start + c)) {
            return Err(GenError::UnorderedArray { key, element: c });
        }
    }
    Ok(start)
}

/// Bucket the group's keys by element count and detect copy rules for
/// every element of every bucket.
fn compressed_element_groups(
    key_compressed: &KeyCompressed,
    user_el_location: &ElementLocations,
    detector: &dyn PatternDetector,
) -> Result<BTreeMap<usize, ArrayElementGroup>> {
    let mut el_count_to_local: BTreeMap<usize, BTreeMap<usize, (usize, &BTreeSet<usize>)>> =
        BTreeMap::new();
    for (local_it, (&key, compressed)) in key_compressed.iter().enumerate() {
        el_count_to_local
            .entry(compressed.len())
            .or_default()
            .insert(local_it, (key, compressed));
    }

    let mut groups = BTreeMap::new();
    for (el_count, local_to_key) in el_count_to_local {
        let mut compress_pos = vec![BTreeMap::new(); el_count];
        let mut result_pos = vec![BTreeMap::new(); el_count];

        for (&local_it, &(key, compressed)) in &local_to_key {
            let orig_pos = user_el_location
                .get(&key)
                .ok_or(GenError::MissingLocation { key })?;
            for (e, &c) in compressed.iter().enumerate() {
                let location = orig_pos.get(c).map(|l| (l.len(), l.first()));
                let Some((1, Some(&pos))) = location else {
                    return Err(GenError::AmbiguousLocation {
                        key,
                        element: c,
                        count: location.map_or(0, |(n, _)| n),
                    });
                };
                result_pos[e].insert(local_it, pos);
                compress_pos[e].insert(local_it, c);
            }
        }

        let local_to_key: BTreeMap<usize, usize> =
            local_to_key.into_iter().map(|(l, (key, _))| (l, key)).collect();
        let keys: BTreeSet<usize> = local_to_key.values().copied().collect();
        let elements = result_pos
            .iter()
            .zip(&compress_pos)
            .map(|(result, compressed)| copy_pattern(result, compressed, &local_to_key, detector))
            .collect::<Vec<_>>();

        trace!(
            el_count,
            keys = %fmt_keys(&keys),
            sectioned = elements.iter().filter(|e| e.direct().is_none()).count(),
            "element bucket"
        );
        groups.insert(el_count, ArrayElementGroup { keys, elements });
    }

    Ok(groups)
}

fn copy_pattern(
    result: &BTreeMap<usize, usize>,
    compressed: &BTreeMap<usize, usize>,
    local_to_key: &BTreeMap<usize, usize>,
    detector: &dyn PatternDetector,
) -> ArrayElementCopyPattern {
    let result_pattern = detector.detect_map(result);
    let compressed_pattern = detector.detect_map(compressed);
    let sections = if result_pattern.is_some() && compressed_pattern.is_some() {
        Vec::new()
    } else {
        split_sections(result, compressed, local_to_key, detector)
    };
    ArrayElementCopyPattern {
        result_pattern,
        compressed_pattern,
        sections,
    }
}

/// Split an element into consecutive runs of local iterations over which
/// both directions keep a single pattern.
fn split_sections(
    result: &BTreeMap<usize, usize>,
    compressed: &BTreeMap<usize, usize>,
    local_to_key: &BTreeMap<usize, usize>,
    detector: &dyn PatternDetector,
) -> Vec<ElementSection> {
    let mut sections = Vec::new();
    let mut cur = SectionBuilder::default();

    let points = local_to_key.iter().zip(result.values()).zip(compressed.values());
    for ((&local_it, &key), (&r, &c)) in points.map(|((a, r), c)| (a, (r, c))) {
        cur.result.insert(local_it, r);
        cur.compressed.insert(local_it, c);
        if cur.result.len() > 1
            && (detector.detect_map(&cur.result).is_none()
                || detector.detect_map(&cur.compressed).is_none())
        {
            cur.result.remove(&local_it);
            cur.compressed.remove(&local_it);
            sections.push(std::mem::take(&mut cur).finish(detector));
            cur.result.insert(local_it, r);
            cur.compressed.insert(local_it, c);
        }
        cur.keys.insert(key);
    }
    if !cur.keys.is_empty() {
        sections.push(cur.finish(detector));
    }
    sections
}

#[derive(Default)]
struct SectionBuilder {
    keys: BTreeSet<usize>,
    result: BTreeMap<usize, usize>,
    compressed: BTreeMap<usize, usize>,
}

impl SectionBuilder {
    fn finish(self, detector: &dyn PatternDetector) -> ElementSection {
        let pattern_of = |points: &BTreeMap<usize, usize>| {
            detector.detect_map(points).unwrap_or_else(|| {
                IndexPattern::constant(points.values().next().copied().unwrap_or_default())
            })
        };
        ElementSection {
            result_pattern: pattern_of(&self.result),
            compressed_pattern: pattern_of(&self.compressed),
            keys: self.keys,
        }
    }
}

// ── Jacobian row bookkeeping ────────────────────────────────────────────────

/// Where the contributions to one sparse row come from.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JacobianWithLoopsRowInfo {
    /// Tape column → location at each iteration.
    pub indexed_positions: BTreeMap<usize, Vec<usize>>,
    /// Original column → location at each iteration.
    pub non_indexed_positions: BTreeMap<usize, Vec<usize>>,
    /// Original columns evaluated once, outside the loop.
    pub non_indexed_evals: BTreeSet<usize>,
    /// Original column → temporaries it depends on.
    pub tmp_evals: BTreeMap<usize, BTreeSet<usize>>,
}

impl JacobianWithLoopsRowInfo {
    pub fn record_indexed(&mut self, tape_column: usize, iteration: usize, location: usize) {
        record_at(
            self.indexed_positions.entry(tape_column).or_default(),
            iteration,
            location,
        );
    }

    pub fn record_non_indexed(&mut self, column: usize, iteration: usize, location: usize) {
        record_at(
            self.non_indexed_positions.entry(column).or_default(),
            iteration,
            location,
        );
        self.non_indexed_evals.insert(column);
    }

    pub fn record_temporary(&mut self, column: usize, k: usize) {
        self.tmp_evals.entry(column).or_default().insert(k);
    }

    pub fn is_empty(&self) -> bool {
        self.indexed_positions.is_empty()
            && self.non_indexed_positions.is_empty()
            && self.non_indexed_evals.is_empty()
            && self.tmp_evals.is_empty()
    }
}

/// Locations not yet known are `usize::MAX`.
fn record_at(locations: &mut Vec<usize>, iteration: usize, location: usize) {
    if locations.len() <= iteration {
        locations.resize(iteration + 1, usize::MAX);
    }
    locations[iteration] = location;
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pattern::AffineDetector;

    fn set(v: &[usize]) -> BTreeSet<usize> {
        v.iter().copied().collect()
    }

    fn single_locations(per_key: &[(usize, &[usize])]) -> ElementLocations {
        per_key
            .iter()
            .map(|&(key, locs)| (key, locs.iter().map(|&l| set(&[l])).collect()))
            .collect()
    }

    fn one_group(keys: &[(usize, &[usize])]) -> LoopGroups {
        let kc: KeyCompressed = keys.iter().map(|&(k, c)| (k, set(c))).collect();
        [(LoopId(0), [(0, kc)].into_iter().collect())]
            .into_iter()
            .collect()
    }

    fn group_of(calls: &LoopCalls, count: usize) -> &ArrayGroup {
        &calls[&count][&LoopId(0)][&0]
    }

    #[test]
    fn diagonal_is_direct() {
        let groups = one_group(&[(0, &[0]), (1, &[0]), (2, &[0]), (3, &[0])]);
        let loc = single_locations(&[(0, &[0]), (1, &[1]), (2, &[2]), (3, &[3])]);
        let ordered = (0..4).map(|k| (k, true)).collect();
        let calls = determine_for_rev_usage_patterns(&groups, &loc, &ordered, &AffineDetector).unwrap();
        let g = group_of(&calls, 4);
        assert_eq!(
            g.start_loc_pattern,
            Some(IndexPattern::Linear {
                slope: 1,
                offset: 0
            })
        );
        assert_eq!(
            g.pattern,
            Some(IndexPattern::Linear {
                slope: 1,
                offset: 0
            })
        );
        assert!(g.el_count_to_elements.is_empty());
    }

    #[test]
    fn unordered_uses_compressed_patterns() {
        // each key writes element 1 of its row, rows are 3 wide
        let groups = one_group(&[(0, &[1]), (1, &[1]), (2, &[1])]);
        let loc = single_locations(&[(0, &[0, 1, 2]), (1, &[3, 4, 5]), (2, &[6, 7, 8])]);
        let ordered = (0..3).map(|k| (k, false)).collect();
        let calls = determine_for_rev_usage_patterns(&groups, &loc, &ordered, &AffineDetector).unwrap();
        let g = group_of(&calls, 3);
        assert!(g.start_loc_pattern.is_none());
        let bucket = &g.el_count_to_elements[&1];
        assert_eq!(bucket.keys, set(&[0, 1, 2]));
        let el = &bucket.elements[0];
        assert_eq!(
            el.direct(),
            Some((
                &IndexPattern::Linear {
                    slope: 3,
                    offset: 1
                },
                &IndexPattern::constant(1)
            ))
        );
        assert!(el.sections.is_empty());
    }

    #[test]
    fn ordered_without_start_pattern_falls_back() {
        let groups = one_group(&[(0, &[0]), (1, &[0]), (2, &[0])]);
        let loc = single_locations(&[(0, &[0]), (1, &[1]), (2, &[5])]);
        let ordered = (0..3).map(|k| (k, true)).collect();
        let calls = determine_for_rev_usage_patterns(&groups, &loc, &ordered, &AffineDetector).unwrap();
        let g = group_of(&calls, 3);
        assert!(g.start_loc_pattern.is_none());
        assert_eq!(g.el_count_to_elements.len(), 1);
    }

    #[test]
    fn irregular_element_is_sectioned() {
        let groups = one_group(&[(0, &[0]), (1, &[0]), (2, &[0]), (3, &[0]), (4, &[0])]);
        let loc = single_locations(&[(0, &[0]), (1, &[1]), (2, &[2]), (3, &[10]), (4, &[11])]);
        let ordered = (0..5).map(|k| (k, false)).collect();
        let calls = determine_for_rev_usage_patterns(&groups, &loc, &ordered, &AffineDetector).unwrap();
        let el = &group_of(&calls, 5).el_count_to_elements[&1].elements[0];
        assert!(el.direct().is_none());
        assert_eq!(el.sections.len(), 2);
        assert_eq!(el.sections[0].keys, set(&[0, 1, 2]));
        assert_eq!(el.sections[1].keys, set(&[3, 4]));
        assert_eq!(
            el.sections[1].result_pattern,
            IndexPattern::Linear {
                slope: 1,
                offset: 7
            }
        );
        let shape = el.section_shape();
        assert_eq!(shape.keys().copied().collect::<Vec<_>>(), vec![0, 3]);
    }

    #[test]
    fn buckets_follow_element_count() {
        let groups = one_group(&[(0, &[0]), (1, &[0, 1]), (2, &[0]), (3, &[0, 1])]);
        let loc = single_locations(&[(0, &[0]), (1, &[1, 2]), (2, &[3]), (3, &[4, 5])]);
        let ordered = (0..4).map(|k| (k, false)).collect();
        let calls = determine_for_rev_usage_patterns(&groups, &loc, &ordered, &AffineDetector).unwrap();
        let g = group_of(&calls, 4);
        assert_eq!(g.el_count_to_elements[&1].keys, set(&[0, 2]));
        assert_eq!(g.el_count_to_elements[&2].keys, set(&[1, 3]));
        assert_eq!(g.el_count_to_elements[&2].elements.len(), 2);
    }

    #[test]
    fn bucketed_by_iteration_count() {
        let mut groups = one_group(&[(0, &[0]), (1, &[0])]);
        groups
            .entry(LoopId(1))
            .or_default()
            .insert(3, [(5, set(&[0]))].into_iter().collect());
        let loc = single_locations(&[(0, &[0]), (1, &[1]), (5, &[7])]);
        let ordered = [(0, true), (1, true), (5, true)].into_iter().collect();
        let calls = determine_for_rev_usage_patterns(&groups, &loc, &ordered, &AffineDetector).unwrap();
        assert_eq!(calls.keys().copied().collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(calls[&1][&LoopId(1)][&3].keys, vec![5]);
        assert_eq!(
            calls[&1][&LoopId(1)][&3].start_loc_pattern,
            Some(IndexPattern::constant(7))
        );
    }

    #[test]
    fn inconsistent_order_flag_is_rejected() {
        let groups = one_group(&[(0, &[0, 1])]);
        let loc = single_locations(&[(0, &[4, 9])]);
        let ordered = [(0, true)].into_iter().collect();
        assert!(matches!(
            determine_for_rev_usage_patterns(&groups, &loc, &ordered, &AffineDetector),
            Err(GenError::UnorderedArray { key: 0, element: 1 })
        ));
    }

    #[test]
    fn missing_order_flag_is_rejected() {
        let groups = one_group(&[(0, &[0])]);
        let loc = single_locations(&[(0, &[0])]);
        assert!(matches!(
            determine_for_rev_usage_patterns(&groups, &loc, &BTreeMap::new(), &AffineDetector),
            Err(GenError::MissingOrderFlag { key: 0 })
        ));
    }

    #[test]
    fn shared_location_is_ambiguous() {
        let groups = one_group(&[(0, &[0])]);
        let loc: ElementLocations = [(0, vec![set(&[1, 2])])].into_iter().collect();
        let ordered = [(0, false)].into_iter().collect();
        assert!(matches!(
            determine_for_rev_usage_patterns(&groups, &loc, &ordered, &AffineDetector),
            Err(GenError::AmbiguousLocation { count: 2, .. })
        ));
    }

    #[test]
    fn empty_group_is_rejected() {
        let groups: LoopGroups = [(LoopId(2), [(1, KeyCompressed::new())].into_iter().collect())]
            .into_iter()
            .collect();
        assert!(matches!(
            determine_for_rev_usage_patterns(
                &groups,
                &ElementLocations::new(),
                &BTreeMap::new(),
                &AffineDetector
            ),
            Err(GenError::EmptyGroup { group: 1, .. })
        ));
    }

    #[test]
    fn row_info_records_by_iteration() {
        let mut row = JacobianWithLoopsRowInfo::default();
        assert!(row.is_empty());
        row.record_indexed(2, 1, 40);
        row.record_non_indexed(7, 0, 12);
        row.record_temporary(7, 3);
        assert_eq!(row.indexed_positions[&2], vec![usize::MAX, 40]);
        assert_eq!(row.non_indexed_positions[&7], vec![12]);
        assert!(row.non_indexed_evals.contains(&7));
        assert_eq!(row.tmp_evals[&7], set(&[3]));
        assert!(!row.is_empty());
    }
}

// interval.rs — Compression of iteration sets into range guards
//
// Turns "the iterations for which a branch applies" into the shortest list
// of closed ranges whose disjunction selects exactly those iterations among
// the ones that can still reach the guard. Iterations listed as relevant are
// don't-cares (never occur, or already taken by an earlier branch), so a
// range may freely extend over them.
//
// Preconditions: the active set is non-empty.
// Postconditions: flattened `(low, high)` pairs in increasing order; a high
//                 bound of `ITER_INFINITY` means "no upper bound".
// Failure modes: empty active set → `GenError::EmptyActiveIterations`.
// Side effects: `create_index_condition_node` adds one node to the graph.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as _;

use crate::error::{GenError, Result};
use crate::graph::{Arg, OpGraph, OpKind};
use crate::id::NodeId;

/// Upper bound sentinel meaning "every iteration from the low bound on".
pub const ITER_INFINITY: usize = usize::MAX;

/// Compress `iterations` into a flattened list of inclusive ranges.
///
/// The active and don't-care iterations are merged and split into blocks of
/// consecutive integers. Each block holding at least one active iteration
/// yields one range spanning its first to last active iteration; the range
/// starts at 0 when the block does, and is unbounded above when the block
/// ends at `max_iter`. A single active iteration yields a degenerate range.
pub fn create_index_condition_expression(
    iterations: &BTreeSet<usize>,
    used_iter: &BTreeSet<usize>,
    max_iter: usize,
) -> Result<Vec<usize>> {
    if iterations.is_empty() {
        return Err(GenError::EmptyActiveIterations);
    }

    let mut all_iters: BTreeMap<usize, bool> = used_iter.iter().map(|&i| (i, false)).collect();
    for &i in iterations {
        all_iters.insert(i, true);
    }

    let mut info = Vec::with_capacity(iterations.len() / 2 + 2);
    let mut it = all_iters.iter().peekable();
    while let Some((&min, &active)) = it.next() {
        let mut max = min;
        let mut active_bounds = active.then_some((min, min));

        while let Some(&(&next, &next_active)) = it.peek() {
            if next != max + 1 {
                break;
            }
            it.next();
            max = next;
            if next_active {
                active_bounds = Some(match active_bounds {
                    Some((lo, _)) => (lo, next),
                    None => (next, next),
                });
            }
        }

        let Some((min_new, max_new)) = active_bounds else {
            continue;
        };
        if min_new == max_new {
            info.push(min_new);
            info.push(max_new);
        } else {
            info.push(if min == 0 { 0 } else { min_new });
            info.push(if max == max_iter { ITER_INFINITY } else { max_new });
        }
    }

    Ok(info)
}

/// Create an index condition node guarding `iterations` on `index_op`.
pub fn create_index_condition_node(
    graph: &mut OpGraph,
    iterations: &BTreeSet<usize>,
    used_iter: &BTreeSet<usize>,
    max_iter: usize,
    index_op: NodeId,
) -> Result<NodeId> {
    let info = create_index_condition_expression(iterations, used_iter, max_iter)?;
    graph.node(index_op)?;
    Ok(graph.add(OpKind::IndexCondExpr, info, vec![Arg::Node(index_op)]))
}

/// Print a range list as a C boolean expression over `var`.
pub fn render_index_condition(info: &[usize], var: &str) -> String {
    let multiple = info.len() > 2;
    let mut out = String::new();
    for (i, pair) in info.chunks(2).enumerate() {
        if i > 0 {
            out.push_str(" || ");
        }
        let (low, high) = (pair[0], pair.get(1).copied().unwrap_or(pair[0]));
        if low == high {
            write!(out, "{} == {}", var, low).unwrap();
        } else if low == 0 && high == ITER_INFINITY {
            out.push('1');
        } else if low == 0 {
            write!(out, "{} <= {}", var, high).unwrap();
        } else if high == ITER_INFINITY {
            write!(out, "{} >= {}", var, low).unwrap();
        } else if multiple {
            write!(out, "({} >= {} && {} <= {})", var, low, var, high).unwrap();
        } else {
            write!(out, "{} >= {} && {} <= {}", var, low, var, high).unwrap();
        }
    }
    out
}

/// Whether `iteration` satisfies the range list.
pub fn matches_index_condition(info: &[usize], iteration: usize) -> bool {
    info.chunks(2)
        .any(|pair| pair[0] <= iteration && iteration <= pair.get(1).copied().unwrap_or(pair[0]))
}

// ── Tests ───────────────────────────────────────────────────────────────────

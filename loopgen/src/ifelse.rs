// ifelse.rs — If/else skeletons and their reuse
//
// A skeleton is an ordered set of branches, each active on a set of
// iterations and keyed by the first of them. Equations (or array elements)
// that activate on exactly the same iteration sets share one skeleton, so
// the generated branching logic is emitted once and every participant adds
// its guarded work to the existing branches.
//
// Preconditions: branch iteration sets within one skeleton are disjoint.
// Postconditions: a matched skeleton has the same branch count and equal
//                 iteration sets, branch by branch, in first-iteration order.
// Failure modes: asking for a branch that is not in the skeleton →
//                `GenError::BranchShapeMismatch`.
// Side effects: graph skeleton creation adds condition and branch nodes.

use std::collections::{BTreeMap, BTreeSet};

use tracing::trace;

use crate::error::{fmt_keys, GenError, Result};
use crate::graph::{Arg, OpGraph, OpKind};
use crate::id::NodeId;
use crate::interval::create_index_condition_node;

/// Candidate skeleton shape: first iteration → iterations of the branch.
pub type BranchShape = BTreeMap<usize, BTreeSet<usize>>;

/// One branch of a skeleton and the work guarded by it.
#[derive(Debug, Clone)]
pub struct IfBranchInfo<T> {
    pub iterations: BTreeSet<usize>,
    pub node: T,
}

/// An if/else skeleton under construction.
#[derive(Debug, Clone)]
pub struct IfElseInfo<T> {
    pub first_it_to_branch: BTreeMap<usize, IfBranchInfo<T>>,
    pub end_if: Option<NodeId>,
}

impl<T> Default for IfElseInfo<T> {
    fn default() -> Self {
        Self {
            first_it_to_branch: BTreeMap::new(),
            end_if: None,
        }
    }
}

impl<T> IfElseInfo<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a skeleton with one branch per shape entry, creating each
    /// branch's payload with `make`.
    pub fn from_shape(
        shape: &BranchShape,
        mut make: impl FnMut(usize, &BTreeSet<usize>) -> Result<T>,
    ) -> Result<Self> {
        let mut info = Self::new();
        for (&first, iterations) in shape {
            let node = make(first, iterations)?;
            info.first_it_to_branch.insert(
                first,
                IfBranchInfo {
                    iterations: iterations.clone(),
                    node,
                },
            );
        }
        Ok(info)
    }

    /// Same branch count and pairwise equal iteration sets, in order.
    pub fn matches(&self, shape: &BranchShape) -> bool {
        self.first_it_to_branch.len() == shape.len()
            && self
                .first_it_to_branch
                .values()
                .zip(shape.values())
                .all(|(branch, iterations)| branch.iterations == *iterations)
    }

    pub fn branch_mut(&mut self, first: usize) -> Result<&mut IfBranchInfo<T>> {
        self.first_it_to_branch
            .get_mut(&first)
            .ok_or(GenError::BranchShapeMismatch { first })
    }

    pub fn branches(&self) -> impl Iterator<Item = &IfBranchInfo<T>> {
        self.first_it_to_branch.values()
    }
}

/// Find a skeleton with exactly the candidate's shape.
pub fn find_existing_if_else<T>(if_elses: &[IfElseInfo<T>], shape: &BranchShape) -> Option<usize> {
    if_elses.iter().position(|info| info.matches(shape))
}

// ── Graph skeletons ─────────────────────────────────────────────────────────

/// Reuse a skeleton with the same shape or create a new one in the graph.
///
/// Each new branch gets an index condition over `index_op` built with every
/// earlier branch's iterations as don't-cares, and a `StartIf` (first) or
/// `ElseIf` (chained to the previous branch) node.
pub fn find_or_create_if_else(
    graph: &mut OpGraph,
    if_elses: &mut Vec<IfElseInfo<NodeId>>,
    shape: &BranchShape,
    index_op: NodeId,
    max_iter: usize,
) -> Result<usize> {
    if let Some(existing) = find_existing_if_else(if_elses, shape) {
        trace!(skeleton = existing, branches = shape.len(), "reusing if/else skeleton");
        return Ok(existing);
    }

    let mut used = BTreeSet::new();
    let mut prev: Option<NodeId> = None;
    let info = IfElseInfo::from_shape(shape, |first, iterations| {
        let cond = create_index_condition_node(graph, iterations, &used, max_iter, index_op)?;
        let node = match prev {
            None => graph.add(OpKind::StartIf, Vec::new(), vec![Arg::Node(cond)]),
            Some(p) => graph.add(OpKind::ElseIf, Vec::new(), vec![Arg::Node(p), Arg::Node(cond)]),
        };
        trace!(first, iterations = %fmt_keys(iterations), %node, "created branch");
        used.extend(iterations.iter().copied());
        prev = Some(node);
        Ok(node)
    })?;

    if_elses.push(info);
    Ok(if_elses.len() - 1)
}

/// Terminate a graph skeleton with its `EndIf` node (created once).
pub fn close_if_else(graph: &mut OpGraph, info: &mut IfElseInfo<NodeId>) -> NodeId {
    if let Some(end) = info.end_if {
        return end;
    }
    let args = info.branches().map(|b| Arg::Node(b.node)).collect();
    let end = graph.add(OpKind::EndIf, Vec::new(), args);
    info.end_if = Some(end);
    end
}

// ── Tests ───────────────────────────────────────────────────────────────────

// loop_model.rs — Loop descriptions and loop insertion into the graph
//
// A loop model describes one repeated computation: which tape independents
// change with the iteration (indexed), which stay fixed (non-indexed), which
// are loop-local temporaries promoted to independents, and where each
// dependent lands as a function of the iteration. The helpers below build
// the loop-start/loop-end scaffolding and the indexed references around a
// loop body.
//
// Preconditions: patterns are already detected for every indexed slot and
//                dependent.
// Postconditions: every created node is owned by the graph; pattern
//                 locations stored in node info refer to patterns
//                 registered with the same graph.
// Failure modes: out-of-range `original` slots → `GenError::SlotOutOfRange`.
// Side effects: adds nodes and patterns to the graph.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{GenError, Result};
use crate::graph::{Arg, OpGraph, OpKind};
use crate::id::{LoopId, NodeId};
use crate::pattern::IndexPattern;

/// Indexed independent reference of order zero.
const INFO_INDEPENDENT: usize = 0;
/// Indexed reference to a dependent slot.
const INFO_DEPENDENT: usize = 2;

/// Position of a variable in the loop tape and in the original model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoopPosition {
    pub tape: usize,
    pub original: usize,
}

/// Whether a loop result overwrites or accumulates into its target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssignOrAdd {
    Assign = 0,
    Add = 1,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopModel {
    pub id: LoopId,
    pub iteration_count: usize,
    /// Per indexed tape independent, its original position at each iteration.
    pub indexed_indep_indexes: Vec<Vec<LoopPosition>>,
    pub non_indexed_indep_indexes: Vec<LoopPosition>,
    pub temporary_independents: Vec<LoopPosition>,
    /// One pattern per indexed independent.
    pub independent_patterns: Vec<IndexPattern>,
    /// One pattern per loop dependent.
    pub dependent_patterns: Vec<IndexPattern>,
}

impl LoopModel {
    pub fn tape_independent_count(&self) -> usize {
        self.indexed_indep_indexes.len()
            + self.non_indexed_indep_indexes.len()
            + self.temporary_independents.len()
    }
}

/// Create one indexed independent reference per indexed slot of `lp`.
pub fn create_indexed_independents(
    graph: &mut OpGraph,
    lp: &LoopModel,
    iteration_index_op: NodeId,
) -> Result<Vec<NodeId>> {
    let n_indexed = lp.indexed_indep_indexes.len();
    if lp.independent_patterns.len() < n_indexed {
        return Err(GenError::SlotOutOfRange {
            what: "independent pattern",
            original: n_indexed - 1,
            len: lp.independent_patterns.len(),
        });
    }

    let x = lp.independent_patterns[..n_indexed]
        .iter()
        .enumerate()
        .map(|(j, pattern)| {
            let location = graph.add_loop_independent_index_pattern(pattern.clone(), j);
            graph.add(
                OpKind::LoopIndexedIndep,
                vec![INFO_INDEPENDENT, location],
                vec![Arg::Node(iteration_index_op)],
            )
        })
        .collect();
    Ok(x)
}

/// Assemble the loop tape's independent vector: indexed slots, then the
/// non-indexed values, then the temporaries, both looked up by their
/// original position.
pub fn create_loop_independent_vector(
    lp: &LoopModel,
    indexed: &[NodeId],
    non_indexed: &[NodeId],
    temporaries: &[NodeId],
) -> Result<Vec<NodeId>> {
    let n_indexed = lp.indexed_indep_indexes.len();
    if indexed.len() < n_indexed {
        return Err(GenError::SlotOutOfRange {
            what: "indexed independent",
            original: n_indexed - 1,
            len: indexed.len(),
        });
    }

    let mut x = Vec::with_capacity(lp.tape_independent_count());
    x.extend_from_slice(&indexed[..n_indexed]);

    for pos in &lp.non_indexed_indep_indexes {
        let node = non_indexed.get(pos.original).ok_or(GenError::SlotOutOfRange {
            what: "non-indexed independent",
            original: pos.original,
            len: non_indexed.len(),
        })?;
        x.push(*node);
    }

    for pos in &lp.temporary_independents {
        let node = temporaries.get(pos.original).ok_or(GenError::SlotOutOfRange {
            what: "temporary",
            original: pos.original,
            len: temporaries.len(),
        })?;
        x.push(*node);
    }

    Ok(x)
}

/// Create one indexed reference per loop dependent; their pattern slots
/// follow the tape independents.
pub fn create_loop_dependent_vector(
    graph: &mut OpGraph,
    lp: &LoopModel,
    iteration_index_op: NodeId,
) -> Vec<NodeId> {
    let x_size = lp.tape_independent_count();
    lp.dependent_patterns
        .iter()
        .enumerate()
        .map(|(i, pattern)| {
            let location = graph.add_loop_independent_index_pattern(pattern.clone(), x_size + i);
            graph.add(
                OpKind::LoopIndexedIndep,
                vec![INFO_DEPENDENT, location],
                vec![Arg::Node(iteration_index_op)],
            )
        })
        .collect()
}

/// Open a loop over `index_declaration` running `iterations` times.
pub fn create_loop_start(graph: &mut OpGraph, index_declaration: NodeId, iterations: usize) -> NodeId {
    graph.add(
        OpKind::LoopStart,
        vec![iterations],
        vec![Arg::Node(index_declaration)],
    )
}

/// Close a loop. Results carrying a pattern are wrapped in an indexed
/// dependent that also depends on every index operation of the loop body;
/// the rest are passed through as-is.
pub fn create_loop_end(
    graph: &mut OpGraph,
    loop_start: NodeId,
    results: &[(NodeId, Option<IndexPattern>)],
    index_ops: &BTreeSet<NodeId>,
    assign_or_add: AssignOrAdd,
) -> Result<NodeId> {
    if graph.node(loop_start)?.kind != OpKind::LoopStart {
        return Err(GenError::NotALoopStart(loop_start));
    }

    let mut end_args = Vec::with_capacity(results.len());
    for (expr, pattern) in results {
        graph.node(*expr)?;
        match pattern {
            Some(pattern) => {
                let mut args = Vec::with_capacity(1 + index_ops.len());
                args.push(Arg::Node(*expr));
                args.extend(index_ops.iter().map(|&op| Arg::Node(op)));
                let location = graph.add_loop_dependent_index_pattern(pattern.clone());
                let indexed = graph.add(
                    OpKind::LoopIndexedDep,
                    vec![location, assign_or_add as usize],
                    args,
                );
                end_args.push(Arg::Node(indexed));
            }
            None => end_args.push(Arg::Node(*expr)),
        }
    }

    let end = graph.add(OpKind::LoopEnd, vec![loop_start.index()], end_args);
    debug!(%loop_start, loop_end = %end, results = results.len(), "closed loop");
    Ok(end)
}

// ── Tests ───────────────────────────────────────────────────────────────────

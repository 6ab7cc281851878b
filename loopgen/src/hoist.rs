// hoist.rs — Loop-invariant classification and hoisting
//
// Colors every node reachable from a loop's results as either invariant
// (does not depend on the loop index) or indexed, and collects the
// invariant sub-expressions that feed indexed nodes. Those are computed once
// before the loop and passed in as extra loop-start arguments.
//
// Preconditions: the graph is acyclic along data edges; the loop start's
//                first argument is its index declaration.
// Postconditions: every visited node has a color; the hoist set holds only
//                 invariant, non-trivial nodes.
// Failure modes: dangling arguments or a missing index declaration →
//                `GenError`.
// Side effects: appends hoisted nodes to the loop start's arguments.

use std::collections::BTreeSet;

use tracing::{debug, trace};

use crate::error::{GenError, Result};
use crate::graph::{Arg, OpGraph, OpKind};
use crate::id::NodeId;

// ── Color table ─────────────────────────────────────────────────────────────

/// Traversal state of a node during one hoisting pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Color {
    #[default]
    Unvisited,
    /// Proven loop-invariant.
    Invariant,
    /// Proven to depend on the loop index.
    Indexed,
}

/// Per-pass colors keyed by node id. Kept outside the graph so that two
/// passes over the same nodes never observe each other's state.
#[derive(Debug, Default)]
pub struct ColorTable {
    colors: Vec<Color>,
}

impl ColorTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: NodeId) -> Color {
        self.colors.get(id.index()).copied().unwrap_or_default()
    }

    pub fn set(&mut self, id: NodeId, color: Color) {
        if self.colors.len() <= id.index() {
            self.colors.resize(id.index() + 1, Color::Unvisited);
        }
        self.colors[id.index()] = color;
    }

    pub fn reset(&mut self) {
        self.colors.clear();
    }
}

// ── Classification ──────────────────────────────────────────────────────────

/// Classify `node` relative to `loop_index` and collect hoistable arguments.
///
/// Returns `true` when the node is loop-invariant. Nodes are visited once:
/// a colored node returns its stored classification regardless of how many
/// parents reach it.
pub fn find_non_indexed_nodes(
    graph: &OpGraph,
    colors: &mut ColorTable,
    node: NodeId,
    hoist: &mut BTreeSet<NodeId>,
    loop_index: NodeId,
) -> Result<bool> {
    match colors.get(node) {
        Color::Invariant => return Ok(true),
        Color::Indexed => return Ok(false),
        Color::Unvisited => {}
    }

    let op = graph.node(node)?;
    if op.kind == OpKind::IndexDeclaration && node == loop_index {
        colors.set(node, Color::Indexed);
        return Ok(false);
    }

    let mut indexed_path = false;
    let mut invariant_args = false;
    for a in 0..op.args.len() {
        if let Some(arg) = graph.arg_node(node, a)? {
            let invariant = find_non_indexed_nodes(graph, colors, arg, hoist, loop_index)?;
            invariant_args |= invariant;
            indexed_path |= !invariant;
        }
    }

    colors.set(
        node,
        if indexed_path {
            Color::Indexed
        } else {
            Color::Invariant
        },
    );

    // array writes and atomic calls must run once per iteration
    if matches!(
        op.kind,
        OpKind::ArrayElement | OpKind::AtomicForward | OpKind::AtomicReverse
    ) {
        return Ok(!indexed_path);
    }

    if indexed_path && invariant_args {
        for arg in op.args.iter().filter_map(Arg::node) {
            if colors.get(arg) == Color::Invariant && graph.node(arg)?.kind != OpKind::Inv {
                if hoist.insert(arg) {
                    trace!(%arg, parent = %node, "hoisting invariant argument");
                }
            }
        }
    }

    Ok(!indexed_path)
}

/// Move every invariant sub-expression feeding the loop's results outside
/// the loop. Returns the hoisted nodes in id order, which is also the order
/// they are appended to the loop start's arguments.
pub fn move_non_indexed_outside_loop(
    graph: &mut OpGraph,
    colors: &mut ColorTable,
    loop_start: NodeId,
    loop_end: NodeId,
) -> Result<Vec<NodeId>> {
    let loop_index = graph.loop_index(loop_start)?;

    let mut hoist = BTreeSet::new();
    let end_args = graph.node(loop_end)?.args.len();
    for a in 0..end_args {
        let result = graph
            .arg_node(loop_end, a)?
            .ok_or(GenError::DanglingArgument { node: loop_end, arg: a })?;
        find_non_indexed_nodes(graph, colors, result, &mut hoist, loop_index)?;
    }

    let hoisted: Vec<NodeId> = hoist.into_iter().collect();
    graph
        .node_mut(loop_start)?
        .args
        .extend(hoisted.iter().map(|&n| Arg::Node(n)));

    debug!(
        loop_start = %loop_start,
        hoisted = hoisted.len(),
        "moved loop-invariant expressions outside the loop"
    );
    Ok(hoisted)
}

// ── Tests ───────────────────────────────────────────────────────────────────

// graph.rs — Operation graph arena
//
// The recorded computation is a DAG of operation nodes owned by a single
// arena and addressed by `NodeId`. Nodes may be shared by many parents
// (fan-in) but data edges never form a cycle. The generator only ever adds
// nodes; per-pass traversal state lives outside the arena (see
// `hoist::ColorTable`).
//
// Preconditions: arguments refer to nodes already present in the arena.
// Postconditions: every node created here is owned by the arena for the rest
//                 of the generation process.
// Failure modes: lookups of unknown ids → `GenError::UnknownNode`.
// Side effects: none.

use std::fmt;

use crate::error::{GenError, Result};
use crate::id::NodeId;
use crate::pattern::IndexPattern;

// ── Operators ───────────────────────────────────────────────────────────────

/// Operator of an operation node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpKind {
    /// Independent variable reference.
    Inv,
    Alias,
    Add,
    Sub,
    Mul,
    Div,
    UnMinus,
    Pow,
    Exp,
    Log,
    Sin,
    Cos,
    Sqrt,
    ArrayCreation,
    /// Read or write of one element of an array.
    ArrayElement,
    AtomicForward,
    AtomicReverse,
    /// Declaration of an index variable. Carries a name.
    IndexDeclaration,
    /// Use of an index declaration.
    Index,
    /// info: `[iteration count]`, args: `[index declaration, hoisted...]`.
    LoopStart,
    /// info: `[loop start node]`, args: loop results.
    LoopEnd,
    /// info: `[kind, pattern location]`, args: `[index operation]`.
    LoopIndexedIndep,
    /// info: `[dependent pattern location, assign-or-add]`.
    LoopIndexedDep,
    /// info: flattened range list, args: `[index operation]`.
    IndexCondExpr,
    StartIf,
    ElseIf,
    Else,
    EndIf,
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// One argument of an operation: a constant or another node.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Arg {
    Param(f64),
    Node(NodeId),
}

impl Arg {
    pub fn node(&self) -> Option<NodeId> {
        match self {
            Arg::Node(id) => Some(*id),
            Arg::Param(_) => None,
        }
    }
}

/// A node of the operation graph.
#[derive(Debug, Clone)]
pub struct OpNode {
    pub kind: OpKind,
    pub info: Vec<usize>,
    pub args: Vec<Arg>,
    pub name: Option<String>,
}

// ── Arena ───────────────────────────────────────────────────────────────────

/// Owner of every operation node and of the index patterns referenced by
/// loop-indexed nodes.
#[derive(Debug, Default)]
pub struct OpGraph {
    nodes: Vec<OpNode>,
    loop_independent_patterns: Vec<(usize, IndexPattern)>,
    loop_dependent_patterns: Vec<IndexPattern>,
}

impl OpGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Create a node and hand it to the arena.
    pub fn add(&mut self, kind: OpKind, info: Vec<usize>, args: Vec<Arg>) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(OpNode {
            kind,
            info,
            args,
            name: None,
        });
        id
    }

    /// Independent variable reference `x[index]`.
    pub fn independent(&mut self, index: usize) -> NodeId {
        self.add(OpKind::Inv, vec![index], Vec::new())
    }

    /// Binary or unary operation over nodes.
    pub fn op(&mut self, kind: OpKind, operands: &[NodeId]) -> NodeId {
        let args = operands.iter().map(|&n| Arg::Node(n)).collect();
        self.add(kind, Vec::new(), args)
    }

    /// Declare a named index variable.
    pub fn declare_index(&mut self, name: impl Into<String>) -> NodeId {
        let id = self.add(OpKind::IndexDeclaration, Vec::new(), Vec::new());
        self.nodes[id.index()].name = Some(name.into());
        id
    }

    /// Create a use of an index declaration.
    pub fn index_op(&mut self, declaration: NodeId) -> NodeId {
        self.add(OpKind::Index, Vec::new(), vec![Arg::Node(declaration)])
    }

    pub fn node(&self, id: NodeId) -> Result<&OpNode> {
        self.nodes.get(id.index()).ok_or(GenError::UnknownNode(id))
    }

    pub fn node_mut(&mut self, id: NodeId) -> Result<&mut OpNode> {
        self.nodes.get_mut(id.index()).ok_or(GenError::UnknownNode(id))
    }

    /// Resolve argument `arg` of `node` to the node it references, if any.
    /// A reference to a node outside the arena is a contract violation.
    pub fn arg_node(&self, node: NodeId, arg: usize) -> Result<Option<NodeId>> {
        let n = self.node(node)?;
        let Some(a) = n.args.get(arg) else {
            return Err(GenError::DanglingArgument { node, arg });
        };
        match a.node() {
            Some(target) if target.index() < self.nodes.len() => Ok(Some(target)),
            Some(_) => Err(GenError::DanglingArgument { node, arg }),
            None => Ok(None),
        }
    }

    /// Index declaration driving a loop start.
    pub fn loop_index(&self, loop_start: NodeId) -> Result<NodeId> {
        let start = self.node(loop_start)?;
        if start.kind != OpKind::LoopStart {
            return Err(GenError::NotALoopStart(loop_start));
        }
        let decl = match self.arg_node(loop_start, 0) {
            Ok(Some(decl)) => decl,
            _ => return Err(GenError::MissingLoopIndex(loop_start)),
        };
        if self.node(decl)?.kind != OpKind::IndexDeclaration {
            return Err(GenError::MissingLoopIndex(loop_start));
        }
        Ok(decl)
    }

    /// Register the pattern of an indexed independent slot; returns its
    /// location for use in node info.
    pub fn add_loop_independent_index_pattern(&mut self, pattern: IndexPattern, slot: usize) -> usize {
        self.loop_independent_patterns.push((slot, pattern));
        self.loop_independent_patterns.len() - 1
    }

    /// Register the pattern of a loop dependent; returns its location.
    pub fn add_loop_dependent_index_pattern(&mut self, pattern: IndexPattern) -> usize {
        self.loop_dependent_patterns.push(pattern);
        self.loop_dependent_patterns.len() - 1
    }

    pub fn loop_independent_pattern(&self, location: usize) -> Option<&(usize, IndexPattern)> {
        self.loop_independent_patterns.get(location)
    }

    pub fn loop_dependent_pattern(&self, location: usize) -> Option<&IndexPattern> {
        self.loop_dependent_patterns.get(location)
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_follow_creation_order() {
        let mut g = OpGraph::new();
        let a = g.independent(0);
        let b = g.independent(1);
        let c = g.op(OpKind::Add, &[a, b]);
        assert_eq!((a, b, c), (NodeId(0), NodeId(1), NodeId(2)));
        assert_eq!(g.len(), 3);
        assert_eq!(g.node(c).unwrap().args, vec![Arg::Node(a), Arg::Node(b)]);
    }

    #[test]
    fn dangling_argument_is_reported() {
        let mut g = OpGraph::new();
        let bad = g.add(OpKind::Exp, Vec::new(), vec![Arg::Node(NodeId(99))]);
        assert!(matches!(
            g.arg_node(bad, 0),
            Err(GenError::DanglingArgument { arg: 0, .. })
        ));
        assert!(matches!(
            g.arg_node(bad, 1),
            Err(GenError::DanglingArgument { arg: 1, .. })
        ));
    }

    #[test]
    fn constant_argument_has_no_node() {
        let mut g = OpGraph::new();
        let n = g.add(OpKind::Mul, Vec::new(), vec![Arg::Param(2.0)]);
        assert_eq!(g.arg_node(n, 0).unwrap(), None);
    }

    #[test]
    fn loop_index_requires_declaration() {
        let mut g = OpGraph::new();
        let decl = g.declare_index("it");
        let start = g.add(OpKind::LoopStart, vec![4], vec![Arg::Node(decl)]);
        assert_eq!(g.loop_index(start).unwrap(), decl);
        assert_eq!(g.node(decl).unwrap().name.as_deref(), Some("it"));

        let x = g.independent(0);
        let broken = g.add(OpKind::LoopStart, vec![4], vec![Arg::Node(x)]);
        assert!(matches!(
            g.loop_index(broken),
            Err(GenError::MissingLoopIndex(_))
        ));
        assert!(matches!(g.loop_index(x), Err(GenError::NotALoopStart(_))));
    }

    #[test]
    fn pattern_locations_are_sequential() {
        let mut g = OpGraph::new();
        assert_eq!(g.add_loop_dependent_index_pattern(IndexPattern::constant(1)), 0);
        assert_eq!(g.add_loop_dependent_index_pattern(IndexPattern::constant(2)), 1);
        assert_eq!(
            g.add_loop_independent_index_pattern(IndexPattern::constant(3), 5),
            0
        );
        assert_eq!(g.loop_independent_pattern(0).unwrap().0, 5);
        assert_eq!(
            g.loop_dependent_pattern(1),
            Some(&IndexPattern::constant(2))
        );
    }
}

// error.rs — Contract violations raised during a generation pass
//
// A generation pass is deterministic: given the same graph and usage
// description it fails the same way every time. Every variant therefore
// describes an upstream construction bug, and the pass that hits one stops
// immediately by propagating it with `?`.
//
// Codes are stable once assigned:
//   E01xx operation graph / loop insertion
//   E02xx interval compressor / branch matcher
//   E03xx loop and array grouping
//   E04xx emitter / driver

use std::collections::BTreeSet;

use thiserror::Error;

use crate::id::{LoopId, NodeId};

/// Result type used throughout the generator.
pub type Result<T> = std::result::Result<T, GenError>;

#[derive(Debug, Error)]
pub enum GenError {
    #[error("unknown operation node {0}")]
    UnknownNode(NodeId),

    #[error("argument {arg} of node {node} refers to a missing node")]
    DanglingArgument { node: NodeId, arg: usize },

    #[error("loop start {0} has no index declaration as its first argument")]
    MissingLoopIndex(NodeId),

    #[error("node {0} is not a loop start")]
    NotALoopStart(NodeId),

    #[error("{what} slot {original} out of range ({len} values provided)")]
    SlotOutOfRange {
        what: &'static str,
        original: usize,
        len: usize,
    },

    #[error("index condition requested for an empty iteration set")]
    EmptyActiveIterations,

    #[error("if/else skeleton has no branch starting at iteration {first}")]
    BranchShapeMismatch { first: usize },

    #[error("no element location recorded for key {key}")]
    MissingLocation { key: usize },

    #[error("element {element} of key {key} has {count} locations, expected exactly one")]
    AmbiguousLocation {
        key: usize,
        element: usize,
        count: usize,
    },

    #[error("no order flag recorded for key {key}")]
    MissingOrderFlag { key: usize },

    #[error("key {key} is flagged ordered but element {element} is not stored at start + {element}")]
    UnorderedArray { key: usize, element: usize },

    #[error("group {group} of loop {loop_id} provides no keys")]
    EmptyGroup { loop_id: LoopId, group: usize },

    #[error("usage refers to loop {0}, which has no loop model")]
    UnknownLoop(LoopId),

    #[error("name `{0}` collides with the generator's element counter `e`")]
    ReservedName(String),

    #[error("invalid generation request: {0}")]
    InvalidRequest(#[from] serde_json::Error),
}

impl GenError {
    /// Stable diagnostic code for this error.
    pub fn code(&self) -> &'static str {
        match self {
            GenError::UnknownNode(_) => "E0101",
            GenError::DanglingArgument { .. } => "E0102",
            GenError::MissingLoopIndex(_) => "E0103",
            GenError::NotALoopStart(_) => "E0104",
            GenError::SlotOutOfRange { .. } => "E0105",
            GenError::EmptyActiveIterations => "E0201",
            GenError::BranchShapeMismatch { .. } => "E0202",
            GenError::MissingLocation { .. } => "E0301",
            GenError::AmbiguousLocation { .. } => "E0302",
            GenError::MissingOrderFlag { .. } => "E0303",
            GenError::UnorderedArray { .. } => "E0304",
            GenError::EmptyGroup { .. } => "E0305",
            GenError::UnknownLoop(_) => "E0306",
            GenError::ReservedName(_) => "E0401",
            GenError::InvalidRequest(_) => "E0402",
        }
    }
}

/// Render a key set compactly for log lines.
pub(crate) fn fmt_keys(keys: &BTreeSet<usize>) -> String {
    let parts: Vec<String> = keys.iter().map(|k| k.to_string()).collect();
    format!("{{{}}}", parts.join(","))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_context() {
        let e = GenError::AmbiguousLocation {
            key: 3,
            element: 1,
            count: 2,
        };
        assert_eq!(
            e.to_string(),
            "element 1 of key 3 has 2 locations, expected exactly one"
        );
        assert_eq!(e.code(), "E0302");
    }

    #[test]
    fn codes_are_unique() {
        let all = [
            GenError::UnknownNode(NodeId(0)),
            GenError::DanglingArgument {
                node: NodeId(0),
                arg: 0,
            },
            GenError::MissingLoopIndex(NodeId(0)),
            GenError::NotALoopStart(NodeId(0)),
            GenError::SlotOutOfRange {
                what: "x",
                original: 0,
                len: 0,
            },
            GenError::EmptyActiveIterations,
            GenError::BranchShapeMismatch { first: 0 },
            GenError::MissingLocation { key: 0 },
            GenError::AmbiguousLocation {
                key: 0,
                element: 0,
                count: 0,
            },
            GenError::MissingOrderFlag { key: 0 },
            GenError::UnorderedArray { key: 0, element: 0 },
            GenError::EmptyGroup {
                loop_id: LoopId(0),
                group: 0,
            },
            GenError::UnknownLoop(LoopId(0)),
            GenError::ReservedName("e".into()),
        ];
        let codes: BTreeSet<&str> = all.iter().map(|e| e.code()).collect();
        assert_eq!(codes.len(), all.len());
    }

    #[test]
    fn key_set_formatting() {
        let keys: BTreeSet<usize> = [1, 3, 5].into_iter().collect();
        assert_eq!(fmt_keys(&keys), "{1,3,5}");
    }
}

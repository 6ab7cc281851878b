// id.rs — Stable identifiers for operation nodes and loop models
//
// Node identifiers address the operation-graph arena; loop identifiers name
// a loop model independently of where it is stored. Both are allocated in
// creation order so that every ordered map keyed by them iterates
// deterministically, which keeps the generated C byte-identical across runs.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Stable identifier for a node in the operation graph arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub u32);

impl NodeId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "n{}", self.0)
    }
}

/// Stable identifier for a loop model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LoopId(pub u32);

impl fmt::Display for LoopId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Allocator for loop identifiers. Produces monotonically increasing IDs in
/// allocation order.
#[derive(Debug, Default)]
pub struct IdAllocator {
    next_loop: u32,
}

impl IdAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alloc_loop(&mut self) -> LoopId {
        let id = LoopId(self.next_loop);
        self.next_loop += 1;
        id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loop_ids_are_sequential() {
        let mut ids = IdAllocator::new();
        assert_eq!(ids.alloc_loop(), LoopId(0));
        assert_eq!(ids.alloc_loop(), LoopId(1));
        assert_eq!(ids.alloc_loop(), LoopId(2));
    }

    #[test]
    fn loop_id_serializes_as_plain_integer() {
        let json = serde_json::to_string(&LoopId(7)).unwrap();
        assert_eq!(json, "7");
        let back: LoopId = serde_json::from_str("7").unwrap();
        assert_eq!(back, LoopId(7));
    }
}

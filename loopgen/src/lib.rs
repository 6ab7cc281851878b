// loopgen — Loop-aware C generation for sparse derivative evaluation
//
// Library root. Passes, in the order a generation run uses them:
// graph construction and loop insertion (graph, loop_model, hoist), guard
// construction (interval, ifelse), grouping (usage) and C emission
// (clang, emit), driven by pipeline.

pub mod clang;
pub mod emit;
pub mod error;
pub mod graph;
pub mod hoist;
pub mod id;
pub mod ifelse;
pub mod interval;
pub mod loop_model;
pub mod pattern;
pub mod pipeline;
pub mod usage;

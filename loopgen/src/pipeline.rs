// pipeline.rs — Generation requests and pass orchestration
//
// Runs the grouper, then the dispatch and usage emitters, over one
// `GenRequest`. Also hosts loop insertion, which strings the loop-model
// helpers and the hoisting pass together around a caller-built body.
//
// Preconditions: the request's usage description is internally consistent.
// Postconditions: generated text is a pure function of the request.
// Failure modes: any pass error is returned unchanged.
// Side effects: none besides `tracing` events.

use std::collections::BTreeSet;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::emit::{generate_dispatch_function, generate_usage_function, DefaultNaming, LocalFunctionNaming};
use crate::error::{GenError, Result};
use crate::graph::OpGraph;
use crate::hoist::{move_non_indexed_outside_loop, ColorTable};
use crate::id::{LoopId, NodeId};
use crate::loop_model::{
    create_indexed_independents, create_loop_end, create_loop_independent_vector, create_loop_start,
    AssignOrAdd, LoopModel,
};
use crate::pattern::{AffineDetector, PatternDetector};
use crate::usage::{determine_for_rev_usage_patterns, SparsityUsage};

// ── Configuration ───────────────────────────────────────────────────────────

/// Names and sizes baked into the generated C.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenOptions {
    pub model_name: String,
    pub dispatch_function: String,
    pub usage_function: String,
    /// Prefix of the per-row non-loop functions.
    pub local_function: String,
    pub suffix: String,
    pub base_type: String,
    pub result_name: String,
    pub key_index_name: String,
    pub iteration_index_name: String,
    /// Number of input arrays handed to local functions (with the constant one).
    pub in_local_size: usize,
}

impl Default for GenOptions {
    fn default() -> Self {
        Self {
            model_name: "model".into(),
            dispatch_function: "model_sparse_reverse_one".into(),
            usage_function: "model_sparse_jacobian".into(),
            local_function: "model_reverse_one".into(),
            suffix: "indep".into(),
            base_type: "double".into(),
            result_name: "jac".into(),
            key_index_name: "j".into(),
            iteration_index_name: "it".into(),
            in_local_size: 3,
        }
    }
}

/// Everything one generation run needs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenRequest {
    #[serde(default)]
    pub options: GenOptions,
    pub usage: SparsityUsage,
    /// Loop models referenced by `usage`; unchecked when empty.
    #[serde(default)]
    pub loops: Vec<LoopModel>,
}

impl GenRequest {
    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// Compact JSON with every map in key order.
    pub fn canonical_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    fn check_loops(&self) -> Result<()> {
        if self.loops.is_empty() {
            return Ok(());
        }
        let known: BTreeSet<LoopId> = self.loops.iter().map(|lp| lp.id).collect();
        match self.usage.loop_groups.keys().find(|id| !known.contains(id)) {
            Some(&missing) => Err(GenError::UnknownLoop(missing)),
            None => Ok(()),
        }
    }
}

// ── Generation ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedSource {
    /// Declarations and the row dispatcher.
    pub dispatch: String,
    /// The whole-result usage function.
    pub usage: String,
}

impl GeneratedSource {
    /// Both functions as one translation unit.
    pub fn to_c(&self) -> String {
        format!("{}\n{}", self.dispatch, self.usage)
    }
}

/// Generate with the default naming scheme and affine pattern detection.
pub fn generate(request: &GenRequest) -> Result<GeneratedSource> {
    let naming = DefaultNaming {
        suffix: &request.options.suffix,
    };
    generate_with(request, &naming, &AffineDetector)
}

pub fn generate_with(
    request: &GenRequest,
    naming: &dyn LocalFunctionNaming,
    detector: &dyn PatternDetector,
) -> Result<GeneratedSource> {
    let start = Instant::now();
    let opts = &request.options;
    let usage = &request.usage;
    info!(
        model = %opts.model_name,
        rows = usage.elements.len(),
        loops = usage.loop_groups.len(),
        "generating sparse usage functions"
    );

    request.check_loops()?;
    let loop_calls = determine_for_rev_usage_patterns(
        &usage.loop_groups,
        &usage.user_el_location,
        &usage.ordered,
        detector,
    )?;
    let dispatch = generate_dispatch_function(opts, usage, naming);
    let usage_fn = generate_usage_function(opts, usage, &loop_calls, naming)?;

    info!(
        bytes = dispatch.len() + usage_fn.len(),
        elapsed_us = start.elapsed().as_micros() as u64,
        "generation complete"
    );
    Ok(GeneratedSource {
        dispatch,
        usage: usage_fn,
    })
}

// ── Loop insertion ──────────────────────────────────────────────────────────

/// Nodes created by `insert_loop`.
#[derive(Debug, Clone)]
pub struct InsertedLoop {
    pub index_declaration: NodeId,
    pub index_op: NodeId,
    pub start: NodeId,
    pub end: NodeId,
    /// Tape independents seen by the body.
    pub independents: Vec<NodeId>,
    pub hoisted: Vec<NodeId>,
}

/// Wrap a loop body built by `body` in loop start/end nodes and hoist its
/// loop-invariant sub-expressions.
///
/// `body` receives the tape independents and the iteration index operation
/// and returns the loop results; result `i` is written through the loop's
/// `i`-th dependent pattern when one exists.
pub fn insert_loop(
    graph: &mut OpGraph,
    lp: &LoopModel,
    index_name: &str,
    non_indexed: &[NodeId],
    temporaries: &[NodeId],
    body: impl FnOnce(&mut OpGraph, &[NodeId], NodeId) -> Result<Vec<NodeId>>,
) -> Result<InsertedLoop> {
    let index_declaration = graph.declare_index(index_name);
    let index_op = graph.index_op(index_declaration);
    let start = create_loop_start(graph, index_declaration, lp.iteration_count);

    let indexed = create_indexed_independents(graph, lp, index_op)?;
    let independents = create_loop_independent_vector(lp, &indexed, non_indexed, temporaries)?;
    let results = body(graph, &independents, index_op)?;

    let patterned: Vec<_> = results
        .iter()
        .enumerate()
        .map(|(i, &node)| (node, lp.dependent_patterns.get(i).cloned()))
        .collect();
    let index_ops: BTreeSet<NodeId> = [index_op].into_iter().collect();
    let end = create_loop_end(graph, start, &patterned, &index_ops, AssignOrAdd::Assign)?;

    let mut colors = ColorTable::new();
    let hoisted = move_non_indexed_outside_loop(graph, &mut colors, start, end)?;

    Ok(InsertedLoop {
        index_declaration,
        index_op,
        start,
        end,
        independents,
        hoisted,
    })
}

// ── Provenance ──────────────────────────────────────────────────────────────

/// Hashes identifying one generation run, for `--emit build-info`.
#[derive(Debug, Clone)]
pub struct Provenance {
    pub request_hash: [u8; 32],
    pub output_hash: [u8; 32],
    pub generator_version: &'static str,
}

#[derive(Serialize)]
struct ProvenanceJson<'a> {
    request_hash: String,
    output_hash: String,
    generator_version: &'a str,
}

impl Provenance {
    pub fn request_hash_hex(&self) -> String {
        bytes_to_hex(&self.request_hash)
    }

    pub fn output_hash_hex(&self) -> String {
        bytes_to_hex(&self.output_hash)
    }

    pub fn to_json(&self) -> Result<String> {
        let doc = ProvenanceJson {
            request_hash: self.request_hash_hex(),
            output_hash: self.output_hash_hex(),
            generator_version: self.generator_version,
        };
        Ok(serde_json::to_string_pretty(&doc)? + "\n")
    }
}

fn sha256(bytes: &[u8]) -> [u8; 32] {
    use sha2::{Digest, Sha256};

    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let mut hash = [0u8; 32];
    hash.copy_from_slice(&hasher.finalize());
    hash
}

fn bytes_to_hex(bytes: &[u8; 32]) -> String {
    use std::fmt::Write;

    let mut s = String::with_capacity(64);
    for b in bytes {
        let _ = write!(s, "{:02x}", b);
    }
    s
}

pub fn compute_provenance(request: &GenRequest, source: &GeneratedSource) -> Result<Provenance> {
    Ok(Provenance {
        request_hash: sha256(request.canonical_json()?.as_bytes()),
        output_hash: sha256(source.to_c().as_bytes()),
        generator_version: env!("CARGO_PKG_VERSION"),
    })
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::OpKind;
    use crate::loop_model::LoopPosition;
    use crate::pattern::IndexPattern;

    const DIAGONAL: &str = r#"{
        "usage": {
            "elements": {"0": [0], "1": [1]},
            "loop_groups": {"0": {"0": {"0": [0], "1": [0]}}},
            "user_el_location": {"0": [[0]], "1": [[1]]},
            "ordered": {"0": true, "1": true},
            "nnz": 2
        }
    }"#;

    #[test]
    fn options_default_when_omitted() {
        let req = GenRequest::from_json(DIAGONAL).unwrap();
        assert_eq!(req.options, GenOptions::default());
        assert!(req.loops.is_empty());
    }

    #[test]
    fn partial_options_keep_other_defaults() {
        let opts: GenOptions = serde_json::from_str(r#"{"base_type": "float"}"#).unwrap();
        assert_eq!(opts.base_type, "float");
        assert_eq!(opts.key_index_name, "j");
    }

    #[test]
    fn malformed_request_is_invalid() {
        let err = GenRequest::from_json("{\"usage\": 3}").unwrap_err();
        assert_eq!(err.code(), "E0402");
    }

    #[test]
    fn generate_diagonal() {
        let req = GenRequest::from_json(DIAGONAL).unwrap();
        let src = generate(&req).unwrap();
        assert!(src.dispatch.contains("int model_sparse_reverse_one(unsigned long pos"));
        assert!(src.usage.contains("      outLocal[0] = &jac[it];\n      j = it;\n"));
        assert!(src.to_c().contains("void model_sparse_jacobian("));
    }

    #[test]
    fn usage_must_name_known_loops() {
        let mut req = GenRequest::from_json(DIAGONAL).unwrap();
        req.loops.push(LoopModel {
            id: LoopId(4),
            iteration_count: 2,
            indexed_indep_indexes: Vec::new(),
            non_indexed_indep_indexes: Vec::new(),
            temporary_independents: Vec::new(),
            independent_patterns: Vec::new(),
            dependent_patterns: Vec::new(),
        });
        assert!(matches!(generate(&req), Err(GenError::UnknownLoop(LoopId(0)))));
    }

    #[test]
    fn provenance_is_stable() {
        let req = GenRequest::from_json(DIAGONAL).unwrap();
        let a = compute_provenance(&req, &generate(&req).unwrap()).unwrap();
        let b = compute_provenance(&req, &generate(&req).unwrap()).unwrap();
        assert_eq!(a.request_hash, b.request_hash);
        assert_eq!(a.output_hash, b.output_hash);
        assert_eq!(a.output_hash_hex().len(), 64);
        let json = a.to_json().unwrap();
        assert!(json.contains("\"generator_version\""));
    }

    #[test]
    fn insert_loop_hoists_shared_parameters() {
        // y[i] = x[i] * (a + b)
        let lp = LoopModel {
            id: LoopId(0),
            iteration_count: 4,
            indexed_indep_indexes: vec![(0..4)
                .map(|i| LoopPosition {
                    tape: 0,
                    original: i,
                })
                .collect()],
            non_indexed_indep_indexes: Vec::new(),
            temporary_independents: Vec::new(),
            independent_patterns: vec![IndexPattern::Linear {
                slope: 1,
                offset: 0,
            }],
            dependent_patterns: vec![IndexPattern::Linear {
                slope: 1,
                offset: 0,
            }],
        };
        let mut g = OpGraph::new();
        let a = g.independent(4);
        let b = g.independent(5);

        let mut sum = None;
        let inserted = insert_loop(&mut g, &lp, "it", &[], &[], |g, x, _| {
            let s = g.op(OpKind::Add, &[a, b]);
            sum = Some(s);
            Ok(vec![g.op(OpKind::Mul, &[x[0], s])])
        })
        .unwrap();

        assert_eq!(inserted.hoisted, vec![sum.unwrap()]);
        assert_eq!(g.node(inserted.end).unwrap().kind, OpKind::LoopEnd);
        assert_eq!(g.loop_index(inserted.start).unwrap(), inserted.index_declaration);
    }
}

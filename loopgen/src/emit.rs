// emit.rs — C text for the sparse usage and dispatch functions
//
// The usage function evaluates a whole sparse Jacobian (or Hessian) by
// calling the non-loop row functions first, then every loop group function
// once per key, grouped by iteration count. Groups with a start-location
// pattern write in place; the rest go through the `compressed` scratch
// buffer and are scattered back by pattern, by if/else sections, or by
// element-count buckets. The dispatch function evaluates a single row.
//
// Preconditions: `loop_calls` was produced from the same `SparsityUsage`.
// Postconditions: output is a pure function of the inputs; every map is
//                 ordered so the text is byte-identical across runs.
// Failure modes: reserved variable names, missing locations or flags →
//                `GenError`.
// Side effects: none.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as _;

use tracing::{debug, trace};

use crate::clang::{CLanguage, ATOMIC_STRUCT_DEFINITION};
use crate::error::{GenError, Result};
use crate::id::LoopId;
use crate::ifelse::{find_existing_if_else, IfElseInfo};
use crate::interval::{create_index_condition_expression, render_index_condition};
use crate::pattern::IndexPattern;
use crate::pipeline::GenOptions;
use crate::usage::{ordered_start, ArrayElementGroup, ArrayGroup, LoopCalls, SparsityUsage};

/// Generated scratch-loop counter; no user index may shadow it.
const ELEMENT_COUNTER: &str = "e";

// ── Naming ──────────────────────────────────────────────────────────────────

/// Names the function evaluating one loop group.
pub trait LocalFunctionNaming {
    fn local_function_name(&self, model: &str, loop_id: LoopId, group: usize) -> String;
}

impl<F> LocalFunctionNaming for F
where
    F: Fn(&str, LoopId, usize) -> String,
{
    fn local_function_name(&self, model: &str, loop_id: LoopId, group: usize) -> String {
        self(model, loop_id, group)
    }
}

/// `<model>_<suffix>_loop<L>_g<G>`.
#[derive(Debug, Clone)]
pub struct DefaultNaming<'a> {
    pub suffix: &'a str,
}

impl LocalFunctionNaming for DefaultNaming<'_> {
    fn local_function_name(&self, model: &str, loop_id: LoopId, group: usize) -> String {
        format!("{}_{}_loop{}_g{}", model, self.suffix, loop_id, group)
    }
}

fn key_table_name(loop_id: LoopId, group: usize) -> String {
    format!("keys_l{}_g{}", loop_id, group)
}

// ── Usage function ──────────────────────────────────────────────────────────

/// Size of the `compressed` buffer: the widest array that reaches the
/// result through it. Zero when every contribution is written in place.
pub fn compressed_size(usage: &SparsityUsage, loop_calls: &LoopCalls) -> Result<usize> {
    let row_width = |key: usize| {
        usage
            .user_el_location
            .get(&key)
            .map(Vec::len)
            .ok_or(GenError::MissingLocation { key })
    };

    let mut size = 0;
    for &row in usage.non_loop_elements.keys() {
        let ordered = usage
            .ordered
            .get(&row)
            .copied()
            .ok_or(GenError::MissingOrderFlag { key: row })?;
        if !ordered {
            size = size.max(row_width(row)?);
        }
    }

    let groups = loop_calls
        .values()
        .flat_map(BTreeMap::values)
        .flat_map(BTreeMap::values);
    for group in groups.filter(|g| g.start_loc_pattern.is_none()) {
        for &key in &group.keys {
            size = size.max(row_width(key)?);
        }
    }
    Ok(size)
}

/// Generate the function evaluating every row of the sparse result.
pub fn generate_usage_function(
    opts: &GenOptions,
    usage: &SparsityUsage,
    loop_calls: &LoopCalls,
    naming: &dyn LocalFunctionNaming,
) -> Result<String> {
    let it = opts.iteration_index_name.as_str();
    let j = opts.key_index_name.as_str();
    for name in [it, j] {
        if name == ELEMENT_COUNTER {
            return Err(GenError::ReservedName(name.to_string()));
        }
    }

    let t = opts.base_type.as_str();
    let res = opts.result_name.as_str();
    let lang = CLanguage::new(t);
    let args_local = lang.with_io("inLocal", "outLocal").args();
    let max_compressed = compressed_size(usage, loop_calls)?;

    let mut out = String::new();

    // ── declarations
    writeln!(out, "void {}({}) {{", opts.usage_function, lang.args_dcl()).unwrap();
    writeln!(out, "   {} const * inLocal[{}];", t, opts.in_local_size).unwrap();
    writeln!(out, "   {} inLocal1 = 1;", t).unwrap();
    writeln!(out, "   {} * outLocal[1];", t).unwrap();
    writeln!(out, "   unsigned long {};", it).unwrap();
    writeln!(out, "   unsigned long {};", j).unwrap();
    writeln!(out, "   unsigned long {};", ELEMENT_COUNTER).unwrap();
    if max_compressed > 0 {
        writeln!(out, "   {} compressed[{}];", t, max_compressed).unwrap();
    }
    write_key_tables(&mut out, loop_calls);
    writeln!(out, "   {} * {} = out[0];", t, res).unwrap();
    out.push('\n');

    writeln!(out, "   inLocal[0] = in[0];").unwrap();
    writeln!(out, "   inLocal[1] = &inLocal1;").unwrap();
    for k in 2..opts.in_local_size {
        writeln!(out, "   inLocal[{}] = in[{}];", k, k - 1).unwrap();
    }
    out.push('\n');

    writeln!(out, "   for(e = 0; e < {}; e++) {}[e] = 0;", usage.nnz, res).unwrap();
    out.push('\n');

    // ── contributions outside loops come first: loops add onto them
    let mut last_compressed = false;
    for (&row, el_pos) in &usage.non_loop_elements {
        let location = usage
            .user_el_location
            .get(&row)
            .ok_or(GenError::MissingLocation { key: row })?;
        let ordered = usage
            .ordered
            .get(&row)
            .copied()
            .ok_or(GenError::MissingOrderFlag { key: row })?;

        out.push('\n');
        if ordered {
            let start = ordered_start(row, el_pos, &usage.user_el_location)?;
            writeln!(out, "   outLocal[0] = &{}[{}];", res, start).unwrap();
        } else if !last_compressed {
            writeln!(out, "   outLocal[0] = compressed;").unwrap();
        }
        writeln!(
            out,
            "   {}_noloop_{}{}({});",
            opts.local_function, opts.suffix, row, args_local
        )
        .unwrap();
        if !ordered {
            for &e in el_pos {
                let targets = location.get(e).ok_or(GenError::AmbiguousLocation {
                    key: row,
                    element: e,
                    count: 0,
                })?;
                for l in targets {
                    writeln!(out, "   {}[{}] += compressed[{}];", res, l, e).unwrap();
                }
            }
        }
        last_compressed = !ordered;
    }
    if !usage.non_loop_elements.is_empty() {
        out.push('\n');
    }

    // ── loop contributions, one counted loop per iteration count
    for (&it_count, loops) in loop_calls {
        let unrolled = it_count == 1;
        let ident = if unrolled { "   " } else { "      " };
        if !unrolled {
            last_compressed = false;
            writeln!(out, "   for({it} = 0; {it} < {}; {it}++) {{", it_count, it = it).unwrap();
        }

        for (&loop_id, groups) in loops {
            for (&g, group) in groups {
                let name = naming.local_function_name(&opts.model_name, loop_id, g);
                let index = |p: &IndexPattern| index_expr(p, unrolled, it);

                match &group.start_loc_pattern {
                    Some(start) => {
                        writeln!(out, "{}outLocal[0] = &{}[{}];", ident, res, index(start)).unwrap();
                    }
                    None => {
                        if !last_compressed {
                            writeln!(out, "{}outLocal[0] = compressed;", ident).unwrap();
                        }
                        writeln!(
                            out,
                            "{}for(e = 0; e < {}; e++)  compressed[e] = 0;",
                            ident, max_compressed
                        )
                        .unwrap();
                    }
                }

                if unrolled {
                    let key = group
                        .keys
                        .first()
                        .ok_or(GenError::EmptyGroup { loop_id, group: g })?;
                    writeln!(out, "{}{}({}, {});", ident, name, key, args_local).unwrap();
                } else {
                    let key_expr = match &group.pattern {
                        Some(p) => p.to_c(it),
                        None => format!("{}[{}]", key_table_name(loop_id, g), it),
                    };
                    writeln!(out, "{}{} = {};", ident, j, key_expr).unwrap();
                    writeln!(out, "{}{}({}, {});", ident, name, j, args_local).unwrap();
                }

                if group.start_loc_pattern.is_none() {
                    write_copy_back(&mut out, opts, group, ident, unrolled)?;
                }
                out.push('\n');

                last_compressed = group.start_loc_pattern.is_none();
            }
        }

        if !unrolled {
            writeln!(out, "   }}").unwrap();
        }
    }

    out.push_str("\n}\n");

    debug!(
        function = %opts.usage_function,
        compressed = max_compressed,
        non_loop = usage.non_loop_elements.len(),
        buckets = loop_calls.len(),
        "emitted usage function"
    );
    Ok(out)
}

/// Pattern at the current iteration; literal when the call is unrolled.
fn index_expr(pattern: &IndexPattern, unrolled: bool, it: &str) -> String {
    if unrolled {
        pattern.evaluate(0).to_string()
    } else {
        pattern.to_c(it)
    }
}

fn write_key_tables(out: &mut String, loop_calls: &LoopCalls) {
    let multi = loop_calls.iter().filter(|(count, _)| **count > 1);
    for (&count, loops) in multi {
        for (&loop_id, groups) in loops {
            for (&g, group) in groups.iter().filter(|(_, group)| group.pattern.is_none()) {
                let keys: Vec<String> = group.keys.iter().map(|k| k.to_string()).collect();
                writeln!(
                    out,
                    "   static const unsigned long {}[{}] = {{{}}};",
                    key_table_name(loop_id, g),
                    count,
                    keys.join(", ")
                )
                .unwrap();
            }
        }
    }
}

/// Scatter the compressed buffer of one group call into the result.
///
/// Element-count buckets become an if/else chain on the key; the last
/// bucket is the plain `else`. Keys below the largest key that the group
/// never visits, and keys of earlier buckets, are don't-cares for the
/// bucket conditions.
fn write_copy_back(
    out: &mut String,
    opts: &GenOptions,
    group: &ArrayGroup,
    ident: &str,
    unrolled: bool,
) -> Result<()> {
    let Some(&max_key) = group.keys.last() else {
        return Ok(());
    };
    let visited: BTreeSet<usize> = group.keys.iter().copied().collect();
    let mut used_iter: BTreeSet<usize> = (0..max_key).filter(|k| !visited.contains(k)).collect();

    let with_ifs = group.el_count_to_elements.len() > 1;
    let last_count = group.el_count_to_elements.keys().next_back().copied();

    for (i, (&count, eg)) in group.el_count_to_elements.iter().enumerate() {
        let mut ident2 = ident.to_string();
        if with_ifs {
            out.push_str(ident);
            if i > 0 {
                out.push_str("} else ");
            }
            if Some(count) != last_count {
                let info = create_index_condition_expression(&eg.keys, &used_iter, max_key)?;
                write!(out, "if({}) ", render_index_condition(&info, &opts.key_index_name)).unwrap();
                used_iter.extend(eg.keys.iter().copied());
            }
            out.push_str("{\n");
            ident2.push_str("   ");
        }
        write_element_group(out, opts, eg, max_key, &ident2, unrolled)?;
    }

    if with_ifs {
        writeln!(out, "{}}}", ident).unwrap();
    }
    Ok(())
}

/// Copy statements of one element-count bucket. Elements without a single
/// pattern pair are grouped by section shape; each distinct shape becomes
/// one if/else chain shared by all its elements.
fn write_element_group(
    out: &mut String,
    opts: &GenOptions,
    eg: &ArrayElementGroup,
    max_key: usize,
    ident: &str,
    unrolled: bool,
) -> Result<()> {
    let res = opts.result_name.as_str();
    let it = opts.iteration_index_name.as_str();
    let copy = |result: &IndexPattern, compressed: &IndexPattern| {
        format!(
            "{}[{}] += compressed[{}];",
            res,
            index_expr(result, unrolled, it),
            index_expr(compressed, unrolled, it)
        )
    };

    let mut skeletons: Vec<IfElseInfo<Vec<String>>> = Vec::new();
    for element in &eg.elements {
        if let Some((result, compressed)) = element.direct() {
            writeln!(out, "{}{}", ident, copy(result, compressed)).unwrap();
            continue;
        }

        let shape = element.section_shape();
        let s = match find_existing_if_else(&skeletons, &shape) {
            Some(s) => s,
            None => {
                skeletons.push(IfElseInfo::from_shape(&shape, |_, _| Ok(Vec::new()))?);
                skeletons.len() - 1
            }
        };
        for section in &element.sections {
            if let Some(&first) = section.keys.first() {
                let stmt = copy(&section.result_pattern, &section.compressed_pattern);
                skeletons[s].branch_mut(first)?.node.push(stmt);
            }
        }
    }

    if skeletons.is_empty() {
        return Ok(());
    }
    trace!(
        el_count = eg.elements.len(),
        skeletons = skeletons.len(),
        "sectioned copy-back"
    );

    // inside this bucket only its own keys can occur
    let outside: BTreeSet<usize> = (0..=max_key).filter(|k| !eg.keys.contains(k)).collect();
    for skeleton in &skeletons {
        write_skeleton(out, skeleton, &outside, max_key, ident, &opts.key_index_name)?;
    }
    Ok(())
}

fn write_skeleton(
    out: &mut String,
    skeleton: &IfElseInfo<Vec<String>>,
    dont_care: &BTreeSet<usize>,
    max_key: usize,
    ident: &str,
    key_name: &str,
) -> Result<()> {
    let branches: Vec<_> = skeleton.branches().collect();
    if let [only] = branches.as_slice() {
        for stmt in &only.node {
            writeln!(out, "{}{}", ident, stmt).unwrap();
        }
        return Ok(());
    }

    let mut used_iter = dont_care.clone();
    for (i, branch) in branches.iter().enumerate() {
        out.push_str(ident);
        if i > 0 {
            out.push_str("} else ");
        }
        if i + 1 < branches.len() {
            let info = create_index_condition_expression(&branch.iterations, &used_iter, max_key)?;
            write!(out, "if({}) ", render_index_condition(&info, key_name)).unwrap();
            used_iter.extend(branch.iterations.iter().copied());
        }
        out.push_str("{\n");
        for stmt in &branch.node {
            writeln!(out, "{}   {}", ident, stmt).unwrap();
        }
    }
    writeln!(out, "{}}}", ident).unwrap();
    Ok(())
}

// ── Dispatch function ───────────────────────────────────────────────────────

/// Generate the row dispatcher together with the declarations of every
/// function it and the usage function call.
pub fn generate_dispatch_function(
    opts: &GenOptions,
    usage: &SparsityUsage,
    naming: &dyn LocalFunctionNaming,
) -> String {
    let lang = CLanguage::new(&opts.base_type);
    let args_dcl = lang.args_dcl();
    let args = lang.args();
    let noloop = format!("{}_noloop_{}", opts.local_function, opts.suffix);

    // row → loop → groups evaluating part of the row
    let mut functions: BTreeMap<usize, BTreeMap<LoopId, BTreeSet<usize>>> = BTreeMap::new();
    for (&loop_id, groups) in &usage.loop_groups {
        for (&g, keys) in groups {
            for &row in keys.keys() {
                functions
                    .entry(row)
                    .or_default()
                    .entry(loop_id)
                    .or_default()
                    .insert(g);
            }
        }
    }

    let mut out = String::new();
    out.push_str(ATOMIC_STRUCT_DEFINITION);
    out.push_str("\n\n");

    for row in usage.non_loop_elements.keys() {
        writeln!(out, "void {}{}({});", noloop, row, args_dcl).unwrap();
    }
    let loop_dcl = lang.loop_args_dcl(&opts.key_index_name);
    for (&loop_id, groups) in &usage.loop_groups {
        for &g in groups.keys() {
            let name = naming.local_function_name(&opts.model_name, loop_id, g);
            writeln!(out, "void {}({});", name, loop_dcl).unwrap();
        }
    }
    out.push('\n');

    writeln!(out, "int {}(unsigned long pos, {}) {{", opts.dispatch_function, args_dcl).unwrap();
    writeln!(out, "   switch(pos) {{").unwrap();
    for &row in usage.elements.keys() {
        writeln!(out, "      case {}:", row).unwrap();
        if usage.non_loop_elements.contains_key(&row) {
            writeln!(out, "         {}{}({});", noloop, row, args).unwrap();
        }
        for (&loop_id, groups) in functions.get(&row).into_iter().flatten() {
            for &g in groups {
                let name = naming.local_function_name(&opts.model_name, loop_id, g);
                writeln!(out, "         {}({}, {});", name, row, args).unwrap();
            }
        }
        writeln!(out, "         return 0; // done").unwrap();
    }
    writeln!(out, "      default:").unwrap();
    writeln!(out, "         return 1; // error").unwrap();
    writeln!(out, "   }};").unwrap();
    writeln!(out, "}}").unwrap();

    debug!(
        function = %opts.dispatch_function,
        rows = usage.elements.len(),
        "emitted dispatch function"
    );
    out
}

// ── Tests ───────────────────────────────────────────────────────────────────

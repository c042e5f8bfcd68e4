// SPDX-License-Identifier: BSD-3-Clause
use std::collections::BTreeSet;

use rustc_hash::{FxHashMap, FxHashSet};
use tracing::trace_span;

use crate::alloc::{Alloc, LocId, Locations};
use crate::bitset::BitSet;
use crate::ir::instruction::Opcode;
use crate::ir::{FunctionName, LocalName, Module, Site};
use crate::signatures::Signatures;

use super::callgraph;
use super::solver::{AnalysisState, Context, InstanceId, NodeId, NodeKey, Target};
use super::{Diagnostic, Error};

// TODO: Metrics for memset of too-small allocations
//
/// Metrics about the precision of the points-to analysis. Lower is better.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Metrics {
    /// Number of callgraph edges, that is, edges from a call site to possible
    /// callee functions. A more precise analysis will resolve indirect calls
    /// more accurately, leading to a smaller callgraph.
    pub callgraph_size: usize,
    /// Non-heap (stack, global, function) allocations passed to `free`. This
    /// is undefined behavior, so it must reflect an imprecision in the
    /// analysis.
    pub free_non_heap: usize,
    /// Calls to non-function pointers. As this can never happen in a
    /// well-defined program, it must reflect an imprecision in the analysis.
    pub invalid_calls: usize,
    /// Pointers that are nullable or point to functions, but are loaded from.
    /// As this can never happen in a well-defined program (it would cause a
    /// segfault or invalid read, respectively), it must reflect an imprecision
    /// in the analysis.
    pub invalid_loads: usize,
    /// `memcpy` destinations that are not storable (e.g., null or const). As
    /// this can never happen in a well-defined program (it would cause a
    /// segfault), it must reflect an imprecision in the analysis.
    pub invalid_memcpy_dsts: usize,
    /// `memcpy` sources that are not loadable (e.g., null). As this can never
    /// happen in a well-defined program (it would cause a segfault), it must
    /// reflect an imprecision in the analysis.
    pub invalid_memcpy_srcs: usize,
    /// Pointers that are nullable, point to constant globals, or point to
    /// functions, but are stored to. As this can never happen in a
    /// well-defined program (it would cause a segfault), it must reflect an
    /// imprecision in the analysis.
    pub invalid_stores: usize,
    /// Values that point to `Unknown`. `Unknown` is used to model external
    /// code and unsupported features; more precise models should be
    /// preferred.
    pub points_to_top: usize,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Options {
    pub check_assertions: bool,
    pub check_strict: bool,
    /// Length of call strings; 0 is context-insensitive
    pub contexts: u8,
    pub debug: bool,
    /// Name of the function the program starts at
    pub entry: String,
    pub max_fields: usize,
    pub max_locations: usize,
    pub max_nodes: usize,
    pub metrics: bool,
    pub unification: bool,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            check_assertions: false,
            check_strict: false,
            contexts: 0,
            debug: false,
            entry: "main".to_string(),
            max_fields: 64,
            max_locations: 1 << 20,
            max_nodes: 1 << 22,
            metrics: false,
            unification: false,
        }
    }
}

/// The result of the analysis. Immutable, and safe to share between
/// threads.
#[derive(Clone, Debug)]
pub struct Solution {
    pub(crate) locations: Locations,
    pub(crate) pts: Vec<BitSet>,
    pub(crate) index: FxHashMap<NodeKey, NodeId>,
    pub(crate) instances: Vec<(Context, FunctionName)>,
    pub(crate) by_function: FxHashMap<FunctionName, Vec<InstanceId>>,
    pub reachable: BTreeSet<FunctionName>,
    /// Resolved call-graph edges
    pub calls: BTreeSet<(Site, FunctionName)>,
    pub needs_signature: BTreeSet<FunctionName>,
    pub diagnostics: Vec<Diagnostic>,
    pub metrics: Option<Metrics>,
}

impl Solution {
    pub fn locations(&self) -> &Locations {
        &self.locations
    }

    /// Reachable instructions producing pointers that point to nothing, see
    /// [`Options::check_strict`].
    pub fn strict_violations(&self) -> impl Iterator<Item = &Site> {
        self.diagnostics.iter().filter_map(|d| match d {
            Diagnostic::PointsToNothing { site } => Some(site),
            _ => None,
        })
    }

    /// Points-to facts for every SSA value in every context, sorted.
    pub fn operand_points_to(&self) -> Vec<(&Context, &FunctionName, &LocalName, LocId)> {
        let mut out: Vec<_> = self
            .index
            .iter()
            .filter_map(|(k, n)| match k {
                NodeKey::Value(i, l) => Some((i, l, n)),
                _ => None,
            })
            .flat_map(|(i, l, n)| {
                let (ctx, f) = &self.instances[i.index()];
                self.pts[n.index()]
                    .iter()
                    .map(move |loc| (ctx, f, l, LocId::from_index(loc)))
            })
            .collect();
        out.sort();
        out
    }

    /// What each location holds, sorted.
    pub fn alloc_points_to(&self) -> Vec<(LocId, LocId)> {
        let mut out: Vec<_> = self
            .index
            .iter()
            .filter_map(|(k, n)| match k {
                NodeKey::Cell(c) => Some((*c, n)),
                _ => None,
            })
            .flat_map(|(c, n)| {
                self.pts[n.index()]
                    .iter()
                    .map(move |l| (c, LocId::from_index(l)))
            })
            .collect();
        out.sort();
        out
    }
}

fn metrics(state: &AnalysisState<'_>) -> Metrics {
    let locs = &state.locations;
    let count = |nodes: &mut dyn Iterator<Item = NodeId>, bad: &dyn Fn(LocId) -> bool| {
        let mut seen = FxHashSet::default();
        for n in nodes {
            for l in state.points_to(n).iter().map(LocId::from_index) {
                if bad(l) {
                    seen.insert((n, l));
                }
            }
        }
        seen.len()
    };
    let callees = state.calls.iter().filter_map(|c| match c.target {
        Target::Indirect(n) => Some(n),
        Target::Direct(_) | Target::Asm => None,
    });
    Metrics {
        callgraph_size: state.callgraph.len(),
        free_non_heap: count(&mut state.freed.iter().copied(), &|l| {
            !locs.object(l).freeable()
        }),
        invalid_calls: count(&mut callees.into_iter(), &|l| {
            !matches!(locs.object(l).alloc, Alloc::Function(_) | Alloc::Unknown)
        }),
        invalid_loads: count(&mut state.loaded.iter().copied(), &|l| {
            !locs.object(l).loadable()
        }),
        invalid_memcpy_dsts: count(&mut state.memcpys.iter().map(|m| m.dst), &|l| {
            !locs.object(l).storable()
        }),
        invalid_memcpy_srcs: count(&mut state.memcpys.iter().map(|m| m.src), &|l| {
            !locs.object(l).loadable()
        }),
        invalid_stores: count(&mut state.stored.iter().copied(), &|l| {
            !locs.object(l).storable()
        }),
        points_to_top: state
            .keys()
            .filter(|(n, k)| {
                matches!(k, NodeKey::Value(..))
                    && state.points_to(*n).contains(LocId::UNKNOWN.index())
            })
            .count(),
    }
}

/// Every reachable instruction with a pointer-typed result must point to
/// something, in at least one context. Casts, address arithmetic and field
/// addressing pass through whatever their operand points to, so only the
/// instruction their operand came from is checked.
fn check_strict(state: &mut AnalysisState<'_>, reachable: &BTreeSet<FunctionName>) {
    let module = state.module;
    for f in module.functions.iter().filter(|f| reachable.contains(&f.name)) {
        let instances: Vec<InstanceId> = state
            .instances
            .iter()
            .enumerate()
            .filter(|(_, (_, g))| *g == f.name)
            .map(|(i, _)| InstanceId(i as u32))
            .collect();
        for (site, instr) in f.instructions() {
            let Some(r) = &instr.result else { continue };
            if !instr.pointer
                || matches!(
                    instr.opcode,
                    Opcode::Cast(_) | Opcode::GetElementPtr(_) | Opcode::Binary(_)
                )
            {
                continue;
            }
            let empty = instances.iter().all(|i| {
                state
                    .lookup(&NodeKey::Value(*i, r.clone()))
                    .map_or(true, |n| state.points_to(n).is_empty())
            });
            if empty {
                state.diagnose(Diagnostic::PointsToNothing { site });
            }
        }
    }
}

/// Pointer analysis
///
/// Sources of unsoundness:
///
/// - Signatures not expressive enough to model external functions (e.g.,
///   `getline`)
/// - Integers cast to pointers, other than constants
pub fn analysis(
    module: &Module,
    signatures: &Signatures,
    opts: &Options,
) -> Result<Solution, Error> {
    // Modules built in code rather than loaded haven't been checked yet.
    module.validate()?;
    let mut state = AnalysisState::new(module, signatures, opts);
    state.seed()?;
    state.run()?;

    let entry = FunctionName::from(opts.entry.as_str());
    let reachable = callgraph::reachable(
        state.functions.contains_key(&entry).then_some(&entry),
        &state.callgraph,
    );

    let _span = trace_span!("query").entered();
    let metrics = opts.metrics.then(|| metrics(&state));
    if opts.check_assertions && opts.check_strict && state.needs_signature.is_empty() {
        check_strict(&mut state, &reachable);
    }
    if opts.debug {
        eprintln!(
            "{} instances, {} nodes, {} locations, {} call edges",
            state.instances.len(),
            state.num_nodes(),
            state.locations.len(),
            state.callgraph.len()
        );
    }

    let calls = state.callgraph.iter().cloned().collect();
    let parts = state.into_parts();
    let mut by_function: FxHashMap<FunctionName, Vec<InstanceId>> = FxHashMap::default();
    for (i, (_, f)) in parts.instances.iter().enumerate() {
        by_function
            .entry(f.clone())
            .or_default()
            .push(InstanceId(i as u32));
    }
    Ok(Solution {
        locations: parts.locations,
        pts: parts.pts,
        index: parts.index,
        instances: parts.instances,
        by_function,
        reachable,
        calls,
        needs_signature: parts.needs_signature,
        diagnostics: parts.diagnostics,
        metrics,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn is_send_sync<T: Send + Sync>() {}

    #[test]
    fn solution_is_shareable() {
        is_send_sync::<Solution>();
    }

    #[test]
    fn duplicate_functions() {
        let mut module = Module::from_json(
            r#"{"functions": [{"name": "main", "body": [{"opcode": {"ret": {}}}]}]}"#,
        )
        .unwrap();
        module.functions.push(module.functions[0].clone());
        let out = analysis(&module, &Signatures::default(), &Options::default());
        assert!(matches!(
            out,
            Err(Error::Malformed(crate::ir::Error::Duplicate(f))) if f == "main"
        ));
    }

    #[test]
    fn empty_module() {
        let module = Module::default();
        let out = analysis(
            &module,
            &Signatures::default(),
            &Options {
                metrics: true,
                ..Options::default()
            },
        )
        .unwrap();
        assert!(out.reachable.is_empty());
        assert_eq!(Some(Metrics::default()), out.metrics);
        assert!(out
            .diagnostics
            .contains(&Diagnostic::NoEntry { function: "main".into() }));
    }

    #[test]
    fn strict_mode() {
        let module = Module::from_json(
            r#"{
                "functions": [{
                    "name": "main",
                    "parameters": ["argc", "argv"],
                    "body": [
                        {"result": "p", "pointer": true, "opcode": {"cast": {"value": {"local": "argc"}}}},
                        {"result": "q", "pointer": true, "opcode": {"phi": {"incoming": [{"local": "p"}]}}},
                        {"result": "s", "pointer": true, "opcode": {"load": {"pointer": {"local": "argv"}}}}
                    ]
                }]
            }"#,
        )
        .unwrap();
        let opts = Options {
            check_assertions: true,
            check_strict: true,
            ..Options::default()
        };
        let out = analysis(&module, &Signatures::default(), &opts).unwrap();
        let sites: Vec<_> = out.strict_violations().collect();
        assert_eq!(vec![&Site::new("main".into(), 1)], sites);
    }

    #[test]
    fn metrics_count_invalid_accesses() {
        let module = Module::from_json(
            r#"{
                "declarations": [{"name": "free", "parameters": 1, "takes_pointer": true}],
                "functions": [{
                    "name": "main",
                    "body": [
                        {"result": "p", "pointer": true, "opcode": {"alloca": {}}},
                        {"opcode": {"call": {"callee": {"direct": "free"}, "args": [{"local": "p"}]}}},
                        {"result": "x", "opcode": {"load": {"pointer": {"constant": "null"}}}},
                        {"opcode": {"store": {"pointer": {"constant": {"function": "main"}}, "value": {"local": "p"}}}},
                        {"opcode": {"call": {"callee": {"indirect": {"local": "p"}}}}}
                    ]
                }]
            }"#,
        )
        .unwrap();
        let opts = Options {
            metrics: true,
            ..Options::default()
        };
        let out = analysis(&module, &Signatures::default(), &opts).unwrap();
        let m = out.metrics.unwrap();
        assert_eq!(1, m.free_non_heap);
        assert_eq!(1, m.invalid_loads);
        assert_eq!(1, m.invalid_stores);
        assert_eq!(1, m.invalid_calls);
        assert_eq!(1, m.callgraph_size);
        assert_eq!(0, m.points_to_top);
    }
}

// SPDX-License-Identifier: BSD-3-Clause
//! Call-graph resolution, on the fly.
//!
//! Direct calls are connected while their caller's body is built. Indirect
//! calls are connected whenever a new location reaches the callee operand:
//!
//! - A function location connects the call to that function.
//! - `Unknown` connects it to every function that takes at most as many
//!   parameters as the call has arguments (calling a function with extra
//!   arguments is generally OK in practice).
//! - Anything else is an invalid call, and is only counted.
//!
//! Calls to assembly are treated as possibly calling any function.
//!
//! TODO: Only add indirect call targets for functions that have their address
//! taken.

use std::collections::BTreeSet;

#[cfg(not(feature = "par"))]
use ascent::ascent_run;
#[cfg(feature = "par")]
use ascent::ascent_run_par as ascent_run;
use rustc_hash::FxHashSet;
use tracing::trace_span;

use crate::alloc::{Alloc, LocId};
use crate::ir::instruction::{Call, Callee};
use crate::ir::{Constant, Declaration, Function, FunctionName, GlobalName, Operand, Site};
use crate::signatures::{AllocType, Signature};

use super::solver::{AnalysisState, CallSite, InstanceId, NodeId, NodeKey, Target};
use super::{Diagnostic, Error};

impl<'m> AnalysisState<'m> {
    pub(crate) fn build_call(
        &mut self,
        i: InstanceId,
        site: Site,
        c: &'m Call,
        result: Option<NodeId>,
    ) -> Result<(), Error> {
        let args = c
            .args
            .iter()
            .map(|a| self.operand(i, a))
            .collect::<Result<Vec<_>, _>>()?;
        let target = match &c.callee {
            Callee::Direct(f) => Target::Direct(f.clone()),
            Callee::Indirect(op) => Target::Indirect(self.operand(i, op)?),
            Callee::Asm => Target::Asm,
        };
        let call = self.calls.len();
        self.calls.push(CallSite {
            caller: i,
            site,
            target: target.clone(),
            args,
            consts: c.args.iter().map(Operand::constant_int).collect(),
            result,
            resolved: FxHashSet::default(),
        });
        match target {
            Target::Direct(f) => self.connect(call, &f),
            Target::Indirect(n) => self.add_indirect_call(n, call),
            Target::Asm => {
                if let Some(r) = result {
                    self.add_token(LocId::UNKNOWN, r);
                }
                let module = self.module;
                for f in module.indirect_call_targets(usize::MAX) {
                    self.connect(call, f)?;
                }
                Ok(())
            }
        }
    }

    /// A new location reached the callee operand of an indirect call.
    pub(crate) fn resolve_call(&mut self, call: usize, loc: LocId) -> Result<(), Error> {
        match &self.locations.object(loc).alloc {
            Alloc::Function(f) => {
                let f = f.clone();
                self.connect(call, &f)
            }
            Alloc::Unknown => {
                let module = self.module;
                let nargs = self.calls[call].args.len();
                for f in module.indirect_call_targets(nargs) {
                    self.connect(call, f)?;
                }
                Ok(())
            }
            // No `_` pattern to ensure this is updated if the type changes
            Alloc::External(_) => Ok(()),
            Alloc::Global(_) => Ok(()),
            Alloc::Heap(_) => Ok(()),
            Alloc::Null => Ok(()),
            Alloc::Stack(_) => Ok(()),
            Alloc::VarArgs(_) => Ok(()),
        }
    }

    /// Connect a call site to one of its callees. Idempotent.
    pub(crate) fn connect(&mut self, call: usize, callee: &FunctionName) -> Result<(), Error> {
        if !self.calls[call].resolved.insert(callee.clone()) {
            return Ok(());
        }
        let site = self.calls[call].site.clone();
        let _span = trace_span!("resolve").entered();
        self.callgraph.insert((site, callee.clone()));
        match self.functions.get(callee).copied() {
            Some(f) => self.connect_defined(call, f),
            None => self.connect_external(call, callee),
        }
    }

    fn connect_defined(&mut self, call: usize, f: &'m Function) -> Result<(), Error> {
        let ctx = {
            let CallSite { caller, site, .. } = &self.calls[call];
            self.instance(*caller).0.pushed(site.clone())
        };
        let ci = self.instantiate(ctx, &f.name);
        let args = self.calls[call].args.clone();
        let nparams = f.parameters.len();
        for (k, a) in args.into_iter().enumerate() {
            match f.parameters.get(k) {
                Some(p) => {
                    let n = self.node(NodeKey::Value(ci, p.clone()))?;
                    self.add_edge(a, n);
                }
                None if f.variadic => {
                    let v = self.node(NodeKey::VarArg(ci, k - nparams))?;
                    self.add_edge(a, v);
                    let va = self.locations.new_varargs(f.name.clone())?;
                    let c = self.cell(va)?;
                    self.add_edge(a, c);
                }
                None => (),
            }
        }
        if let Some(r) = self.calls[call].result {
            let ret = self.node(NodeKey::Return(ci))?;
            self.add_edge(ret, r);
        }
        Ok(())
    }

    fn connect_external(&mut self, call: usize, name: &FunctionName) -> Result<(), Error> {
        let decl = self.declarations.get(name).copied();
        if *name == "free" {
            if let Some(a) = self.calls[call].args.first() {
                self.freed.push(*a);
            }
        }
        match self.signatures.signatures_for(name.get()) {
            Some(sigs) => {
                for sig in &sigs {
                    self.apply(call, sig)?;
                }
            }
            None => {
                if decl.map_or(true, Declaration::mentions_pointers) {
                    if self.needs_signature.insert(name.clone()) {
                        self.diagnose(Diagnostic::NeedsSignature {
                            function: name.clone(),
                        });
                    }
                    self.escape(call, decl.map_or(true, |d| d.returns_pointer))?;
                }
            }
        }
        Ok(())
    }

    /// A call to code nothing is known about: the result may point anywhere,
    /// the pointers passed to it are exposed, and anything may be stored
    /// through them.
    fn escape(&mut self, call: usize, returns_pointer: bool) -> Result<(), Error> {
        if returns_pointer {
            if let Some(r) = self.calls[call].result {
                self.add_token(LocId::UNKNOWN, r);
            }
        }
        let unknown = self.cell(LocId::UNKNOWN)?;
        let top = self.node(NodeKey::Constant(Constant::Other))?;
        for a in self.calls[call].args.clone() {
            self.add_edge(a, unknown);
            self.add_store(a, top, None)?;
        }
        Ok(())
    }

    fn arg(&self, call: usize, k: usize) -> Option<NodeId> {
        self.calls[call].args.get(k).copied()
    }

    fn const_arg(&self, call: usize, k: Option<usize>) -> Option<u64> {
        let i = self.calls[call].consts.get(k?).copied().flatten()?;
        u64::try_from(i).ok()
    }

    fn apply(&mut self, call: usize, sig: &Signature) -> Result<(), Error> {
        let CallSite {
            caller,
            ref site,
            result,
            ..
        } = self.calls[call];
        let site = site.clone();
        match sig {
            Signature::ReturnAlloc { r#type, size_arg } => {
                if let Some(r) = result {
                    let loc = match r#type {
                        AllocType::Heap => {
                            let size = self.const_arg(call, *size_arg);
                            self.locations.new_heap_object(site, size)?
                        }
                        AllocType::Stack => self.locations.new_stack_slot(site, None)?,
                        AllocType::Top => LocId::UNKNOWN,
                    };
                    self.add_token(loc, r);
                }
            }
            Signature::ReturnRealloc { arg, size_arg } => {
                if let Some(r) = result {
                    let size = self.const_arg(call, *size_arg);
                    let fresh = self.locations.new_heap_object(site.clone(), size)?;
                    self.add_token(fresh, r);
                    if let Some(a) = self.arg(call, *arg) {
                        self.add_edge(a, r);
                        let t = self.node(NodeKey::Temp(caller, site.index))?;
                        self.add_token(fresh, t);
                        self.add_memcpy(site, t, a, None)?;
                    }
                }
            }
            Signature::ReturnAliasesArg { arg } => {
                if let (Some(r), Some(a)) = (result, self.arg(call, *arg)) {
                    self.add_edge(a, r);
                }
            }
            Signature::ReturnPointsToGlobal { global } => {
                if let Some(r) = result {
                    let name = GlobalName::from(global.as_str());
                    let loc = match self.locations.get(&Alloc::Global(name.clone())) {
                        Some(l) => l,
                        None => self.locations.new_global(name, false, None)?,
                    };
                    self.add_token(loc, r);
                }
            }
            Signature::ArgMemcpyArg { dst, src, size_arg } => {
                if dst != src {
                    if let (Some(d), Some(s)) = (self.arg(call, *dst), self.arg(call, *src)) {
                        let size = self.const_arg(call, *size_arg);
                        self.add_memcpy(site, d, s, size)?;
                    }
                }
            }
            Signature::CallsArg { arg, args } => {
                if let Some(f) = self.arg(call, *arg) {
                    let passed = args.iter().filter_map(|k| self.arg(call, *k)).collect();
                    let consts = args
                        .iter()
                        .map(|k| self.calls[call].consts.get(*k).copied().flatten())
                        .collect();
                    let callback = self.calls.len();
                    self.calls.push(CallSite {
                        caller,
                        site,
                        target: Target::Indirect(f),
                        args: passed,
                        consts,
                        result: None,
                        resolved: FxHashSet::default(),
                    });
                    self.add_indirect_call(f, callback)?;
                }
            }
            Signature::Throw { arg } => {
                if let Some(a) = self.arg(call, *arg) {
                    let e = self.node(NodeKey::Exception)?;
                    self.add_edge(a, e);
                }
            }
            Signature::NoEffect => (),
        }
        Ok(())
    }
}

/// Functions transitively callable from `entry`, given the resolved call
/// sites.
pub fn reachable(
    entry: Option<&FunctionName>,
    callgraph: &FxHashSet<(Site, FunctionName)>,
) -> BTreeSet<FunctionName> {
    let _span = trace_span!("reachable").entered();
    let edges: Vec<(FunctionName, FunctionName)> = callgraph
        .iter()
        .map(|(site, callee)| (site.function.clone(), callee.clone()))
        .collect();
    let entries: Vec<FunctionName> = entry.into_iter().cloned().collect();
    let outs = ascent_run! {
        relation edge(FunctionName, FunctionName);
        relation reachable(FunctionName);

        edge(caller.clone(), callee.clone()) <-- for (caller, callee) in edges.iter();

        reachable(f.clone()) <-- for f in entries.iter();

        reachable(g.clone()) <--
          reachable(f),
          edge(f, g);
    };
    outs.reachable.into_iter().map(|(f,)| f).collect()
}

#[cfg(test)]
mod tests {
    use rustc_hash::FxHashSet;

    use super::reachable;
    use crate::alloc::LocId;
    use crate::analysis::pointer::Options;
    use crate::analysis::solver::{AnalysisState, NodeKey};
    use crate::ir::{FunctionName, LocalName, Module, Site};
    use crate::signatures::Signatures;

    #[test]
    fn reachability() {
        let f = |s: &str| FunctionName::from(s);
        let cg = FxHashSet::from_iter([
            (Site::new(f("main"), 0), f("a")),
            (Site::new(f("a"), 3), f("b")),
            (Site::new(f("b"), 1), f("a")),
            (Site::new(f("c"), 0), f("d")),
        ]);
        let r = reachable(Some(&f("main")), &cg);
        assert_eq!(vec![f("a"), f("b"), f("main")], r.into_iter().collect::<Vec<_>>());
        assert!(reachable(None, &cg).is_empty());
    }

    const TWO_CALLS: &str = r#"{
        "functions": [
            {
                "name": "id",
                "parameters": ["p"],
                "body": [{"opcode": {"ret": {"value": {"local": "p"}}}}]
            },
            {
                "name": "main",
                "body": [
                    {"result": "u", "pointer": true, "opcode": {"alloca": {}}},
                    {"result": "v", "pointer": true, "opcode": {"alloca": {}}},
                    {"result": "x", "pointer": true, "opcode": {"call": {"callee": {"direct": "id"}, "args": [{"local": "u"}]}}},
                    {"result": "y", "pointer": true, "opcode": {"call": {"callee": {"indirect": {"constant": {"function": "id"}}}, "args": [{"local": "v"}]}}}
                ]
            }
        ]
    }"#;

    fn pts(state: &AnalysisState<'_>, local: &str) -> usize {
        let main = state
            .instances
            .iter()
            .position(|(ctx, f)| ctx.is_empty() && *f == "main")
            .unwrap();
        let n = state
            .lookup(&NodeKey::Value(
                crate::analysis::solver::InstanceId(main as u32),
                LocalName::from(local),
            ))
            .unwrap();
        state.points_to(n).len()
    }

    #[test]
    fn contexts_separate_callers() {
        let module = Module::from_json(TWO_CALLS).unwrap();
        let sigs = Signatures::empty();
        for (contexts, expected) in [(0, 2), (1, 1)] {
            let opts = Options {
                contexts,
                ..Options::default()
            };
            let mut state = AnalysisState::new(&module, &sigs, &opts);
            state.seed().unwrap();
            state.run().unwrap();
            assert_eq!(expected, pts(&state, "x"));
            assert_eq!(expected, pts(&state, "y"));
            assert_eq!(2, state.callgraph.len());
        }
    }

    fn locs(state: &AnalysisState<'_>, function: &str, local: &str) -> Vec<usize> {
        let i = state
            .instances
            .iter()
            .position(|(ctx, f)| ctx.is_empty() && *f == function)
            .unwrap();
        let n = state
            .lookup(&NodeKey::Value(
                crate::analysis::solver::InstanceId(i as u32),
                LocalName::from(local),
            ))
            .unwrap();
        state.points_to(n).iter().collect()
    }

    #[test]
    fn positional_varargs() {
        let module = Module::from_json(
            r#"{
                "functions": [
                    {
                        "name": "f",
                        "parameters": ["count"],
                        "variadic": true,
                        "body": [
                            {"result": "ap", "pointer": true, "opcode": {"alloca": {"layout": {"scalar": 24}}}},
                            {"opcode": {"va_start": {"list": {"local": "ap"}}}},
                            {"result": "a", "pointer": true, "opcode": {"va_arg": {"list": {"local": "ap"}, "index": 0}}},
                            {"result": "b", "pointer": true, "opcode": {"va_arg": {"list": {"local": "ap"}, "index": 1}}},
                            {"result": "c", "pointer": true, "opcode": {"va_arg": {"list": {"local": "ap"}}}}
                        ]
                    },
                    {
                        "name": "main",
                        "body": [
                            {"result": "y", "pointer": true, "opcode": {"alloca": {"layout": {"scalar": 4}}}},
                            {"result": "z", "pointer": true, "opcode": {"alloca": {"layout": {"scalar": 4}}}},
                            {"opcode": {"call": {"callee": {"direct": "f"}, "args": [{"constant": {"int": 2}}, {"local": "y"}, {"local": "z"}]}}}
                        ]
                    }
                ]
            }"#,
        )
        .unwrap();
        let sigs = Signatures::empty();
        let opts = Options::default();
        let mut state = AnalysisState::new(&module, &sigs, &opts);
        state.seed().unwrap();
        state.run().unwrap();
        let (y, z) = (locs(&state, "main", "y"), locs(&state, "main", "z"));
        assert_eq!(1, y.len());
        assert_ne!(y, z);
        assert_eq!(y, locs(&state, "f", "a"));
        assert_eq!(z, locs(&state, "f", "b"));
        // Without a position, any of them.
        let mut any = [y, z].concat();
        any.sort();
        assert_eq!(any, locs(&state, "f", "c"));
    }

    #[test]
    fn external_calls_escape() {
        let module = Module::from_json(
            r#"{
                "declarations": [{"name": "mystery", "parameters": 1, "takes_pointer": true, "returns_pointer": true}],
                "functions": [{
                    "name": "main",
                    "body": [
                        {"result": "p", "pointer": true, "opcode": {"alloca": {}}},
                        {"result": "r", "pointer": true, "opcode": {"call": {"callee": {"direct": "mystery"}, "args": [{"local": "p"}]}}},
                        {"result": "q", "pointer": true, "opcode": {"load": {"pointer": {"local": "p"}}}}
                    ]
                }]
            }"#,
        )
        .unwrap();
        let sigs = Signatures::empty();
        let opts = Options::default();
        let mut state = AnalysisState::new(&module, &sigs, &opts);
        state.seed().unwrap();
        state.run().unwrap();
        assert!(pts(&state, "r") >= 1);
        let q = state
            .lookup(&NodeKey::Value(
                crate::analysis::solver::InstanceId(0),
                LocalName::from("q"),
            ))
            .unwrap();
        assert!(state.points_to(q).contains(LocId::UNKNOWN.index()));
        assert!(state.needs_signature.contains(&FunctionName::from("mystery")));
    }
}

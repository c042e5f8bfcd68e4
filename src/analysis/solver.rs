// SPDX-License-Identifier: BSD-3-Clause
//! Worklist solver for inclusion constraints.
//!
//! The constraint graph has a node per SSA value per calling context, a node
//! per abstract location (standing for the contents of that location), and a
//! few special nodes for return values, variadic arguments and exceptions.
//! Copy edges are plain inclusions `pts(a) ⊆ pts(b)`. Everything else
//! (loads, stores, field addressing, copies of memory, indirect calls) is a
//! *complex* constraint attached to the node holding the pointer, and is
//! evaluated once for each location that reaches that node.
//!
//! The worklist holds `(location, node)` tokens, each meaning "this location
//! was just added to the points-to set of this node". A token is processed
//! exactly once, so the solver terminates: there are finitely many of them.

use std::collections::BTreeSet;

use rustc_hash::{FxHashMap, FxHashSet};
use tracing::{debug, trace_span};

use crate::alloc::{Alloc, LocId, Locations, ObjectId, Resolution};
use crate::bitset::BitSet;
use crate::ir::layout::Overflow;
use crate::ir::{Constant, Declaration, Function, FunctionName, LocalName, Module, Site};
use crate::klimited::KLimited;
use crate::signatures::Signatures;

use super::pointer::Options;
use super::{Diagnostic, Error, Resource};

pub type Context = KLimited<Site>;

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct NodeId(pub(crate) u32);

impl NodeId {
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// A function analyzed in one calling context.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct InstanceId(pub(crate) u32);

impl InstanceId {
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub enum NodeKey {
    /// An SSA value or parameter
    Value(InstanceId, LocalName),
    /// Intermediate pointer of a multi-step instruction at the given index
    Temp(InstanceId, usize),
    /// Contents of a location
    Cell(LocId),
    /// A constant operand; seeded with its referents on creation
    Constant(Constant),
    Return(InstanceId),
    /// The n-th variadic argument of an instance
    VarArg(InstanceId, usize),
    /// Whatever is currently being thrown
    Exception,
}

#[derive(Clone, Debug)]
pub(crate) struct Gep {
    pub(crate) dst: NodeId,
    pub(crate) offset: i64,
    pub(crate) strides: Vec<u64>,
}

#[derive(Clone, Debug)]
pub(crate) struct Memcpy {
    pub(crate) site: Site,
    pub(crate) dst: NodeId,
    pub(crate) src: NodeId,
    pub(crate) size: Option<u64>,
}

#[derive(Clone, Debug)]
pub(crate) enum Target {
    Direct(FunctionName),
    Indirect(NodeId),
    Asm,
}

#[derive(Clone, Debug)]
pub(crate) struct CallSite {
    pub(crate) caller: InstanceId,
    pub(crate) site: Site,
    pub(crate) target: Target,
    pub(crate) args: Vec<NodeId>,
    /// Arguments that are integer constants
    pub(crate) consts: Vec<Option<i64>>,
    pub(crate) result: Option<NodeId>,
    /// Callees connected so far
    pub(crate) resolved: FxHashSet<FunctionName>,
}

#[derive(Clone, Debug, Default)]
struct Node {
    pts: BitSet,
    copies: Vec<NodeId>,
    loads: Vec<(NodeId, Option<u64>)>,
    stores: Vec<(NodeId, Option<u64>)>,
    geps: Vec<usize>,
    memcpys: Vec<usize>,
    calls: Vec<usize>,
}

pub struct AnalysisState<'m> {
    pub(crate) module: &'m Module,
    pub(crate) functions: FxHashMap<&'m FunctionName, &'m Function>,
    pub(crate) declarations: FxHashMap<&'m FunctionName, &'m Declaration>,
    pub(crate) signatures: &'m Signatures,
    pub(crate) opts: &'m Options,
    pub(crate) locations: Locations,
    nodes: Vec<Node>,
    keys: Vec<NodeKey>,
    index: FxHashMap<NodeKey, NodeId>,
    edges: FxHashSet<(NodeId, NodeId)>,
    worklist: Vec<(LocId, NodeId)>,
    pub(crate) instances: Vec<(Context, FunctionName)>,
    instance_index: FxHashMap<(Context, FunctionName), InstanceId>,
    /// Instances whose bodies haven't been turned into constraints yet
    pub(crate) pending: Vec<InstanceId>,
    pub(crate) geps: Vec<Gep>,
    pub(crate) memcpys: Vec<Memcpy>,
    pub(crate) calls: Vec<CallSite>,
    /// Pointer operands of loads and stores, and arguments of `free`
    pub(crate) loaded: Vec<NodeId>,
    pub(crate) stored: Vec<NodeId>,
    pub(crate) freed: Vec<NodeId>,
    pub(crate) callgraph: FxHashSet<(Site, FunctionName)>,
    pub(crate) needs_signature: BTreeSet<FunctionName>,
    diagnostics: Vec<Diagnostic>,
    diagnosed: FxHashSet<Diagnostic>,
}

impl<'m> AnalysisState<'m> {
    pub fn new(module: &'m Module, signatures: &'m Signatures, opts: &'m Options) -> Self {
        AnalysisState {
            module,
            functions: module.functions.iter().map(|f| (&f.name, f)).collect(),
            declarations: module.declarations.iter().map(|d| (&d.name, d)).collect(),
            signatures,
            opts,
            locations: Locations::new(opts.max_locations, opts.max_fields),
            nodes: Vec::new(),
            keys: Vec::new(),
            index: FxHashMap::default(),
            edges: FxHashSet::default(),
            worklist: Vec::new(),
            instances: Vec::new(),
            instance_index: FxHashMap::default(),
            pending: Vec::new(),
            geps: Vec::new(),
            memcpys: Vec::new(),
            calls: Vec::new(),
            loaded: Vec::new(),
            stored: Vec::new(),
            freed: Vec::new(),
            callgraph: FxHashSet::default(),
            needs_signature: BTreeSet::new(),
            diagnostics: Vec::new(),
            diagnosed: FxHashSet::default(),
        }
    }

    // ------------------------------------------------------------------
    // Nodes

    pub fn node(&mut self, key: NodeKey) -> Result<NodeId, Error> {
        if let Some(n) = self.index.get(&key) {
            return Ok(*n);
        }
        if self.nodes.len() >= self.opts.max_nodes {
            return Err(Error::Incomplete {
                resource: Resource::Nodes,
                limit: self.opts.max_nodes,
            });
        }
        let n = NodeId(self.nodes.len() as u32);
        self.nodes.push(Node::default());
        self.keys.push(key.clone());
        self.index.insert(key.clone(), n);
        if let NodeKey::Constant(c) = &key {
            self.seed_constant(n, c)?;
        }
        Ok(n)
    }

    #[inline]
    pub fn cell(&mut self, loc: LocId) -> Result<NodeId, Error> {
        self.node(NodeKey::Cell(loc))
    }

    pub fn lookup(&self, key: &NodeKey) -> Option<NodeId> {
        self.index.get(key).copied()
    }

    #[inline]
    pub fn points_to(&self, n: NodeId) -> &BitSet {
        &self.nodes[n.index()].pts
    }

    pub fn key(&self, n: NodeId) -> &NodeKey {
        &self.keys[n.index()]
    }

    pub fn num_nodes(&self) -> usize {
        self.nodes.len()
    }

    pub(crate) fn keys(&self) -> impl Iterator<Item = (NodeId, &NodeKey)> {
        self.keys
            .iter()
            .enumerate()
            .map(|(i, k)| (NodeId(i as u32), k))
    }

    // ------------------------------------------------------------------
    // Instances

    /// The instance of `function` in `ctx`, creating it (and scheduling its
    /// body for constraint generation) if it doesn't exist yet.
    pub(crate) fn instantiate(&mut self, ctx: Context, function: &FunctionName) -> InstanceId {
        let key = (ctx, function.clone());
        if let Some(i) = self.instance_index.get(&key) {
            return *i;
        }
        let i = InstanceId(self.instances.len() as u32);
        self.instances.push(key.clone());
        self.instance_index.insert(key, i);
        self.pending.push(i);
        i
    }

    pub(crate) fn instance(&self, i: InstanceId) -> &(Context, FunctionName) {
        &self.instances[i.index()]
    }

    // ------------------------------------------------------------------
    // Constraints

    /// Record that `loc` is in the points-to set of `n`.
    pub(crate) fn add_token(&mut self, loc: LocId, n: NodeId) {
        if self.nodes[n.index()].pts.insert(loc.index()) {
            self.worklist.push((loc, n));
        }
    }

    /// `pts(src) ⊆ pts(dst)`
    pub(crate) fn add_edge(&mut self, src: NodeId, dst: NodeId) {
        if src == dst || !self.edges.insert((src, dst)) {
            return;
        }
        self.nodes[src.index()].copies.push(dst);
        let locs: Vec<usize> = self.nodes[src.index()].pts.iter().collect();
        for l in locs {
            self.add_token(LocId::from_index(l), dst);
        }
    }

    fn current(&self, n: NodeId) -> Vec<LocId> {
        self.nodes[n.index()]
            .pts
            .iter()
            .map(LocId::from_index)
            .collect()
    }

    /// `dst = *ptr`, reading `width` bytes
    pub(crate) fn add_load(
        &mut self,
        ptr: NodeId,
        dst: NodeId,
        width: Option<u64>,
    ) -> Result<(), Error> {
        self.nodes[ptr.index()].loads.push((dst, width));
        for loc in self.current(ptr) {
            self.load(loc, dst, width)?;
        }
        Ok(())
    }

    /// `*ptr = src`, writing `width` bytes
    pub(crate) fn add_store(
        &mut self,
        ptr: NodeId,
        src: NodeId,
        width: Option<u64>,
    ) -> Result<(), Error> {
        self.nodes[ptr.index()].stores.push((src, width));
        for loc in self.current(ptr) {
            self.store(loc, src, width)?;
        }
        Ok(())
    }

    /// `dst = ptr + offset + sum(i_k * strides[k])`
    pub(crate) fn add_gep(
        &mut self,
        ptr: NodeId,
        dst: NodeId,
        offset: i64,
        strides: Vec<u64>,
    ) -> Result<(), Error> {
        let g = self.geps.len();
        self.geps.push(Gep {
            dst,
            offset,
            strides,
        });
        self.nodes[ptr.index()].geps.push(g);
        for loc in self.current(ptr) {
            self.gep(loc, g)?;
        }
        Ok(())
    }

    /// Copy `size` bytes (all of them, if `None`) from `*src` to `*dst`.
    pub(crate) fn add_memcpy(
        &mut self,
        site: Site,
        dst: NodeId,
        src: NodeId,
        size: Option<u64>,
    ) -> Result<(), Error> {
        let m = self.memcpys.len();
        self.memcpys.push(Memcpy {
            site,
            dst,
            src,
            size,
        });
        self.nodes[dst.index()].memcpys.push(m);
        if src != dst {
            self.nodes[src.index()].memcpys.push(m);
        }
        for d in self.current(dst) {
            for s in self.current(src) {
                self.copy(m, d, s)?;
            }
        }
        Ok(())
    }

    /// Call whatever `callee` points to.
    pub(crate) fn add_indirect_call(&mut self, callee: NodeId, call: usize) -> Result<(), Error> {
        self.nodes[callee.index()].calls.push(call);
        for loc in self.current(callee) {
            self.resolve_call(call, loc)?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Complex constraints, for one location

    fn load(&mut self, loc: LocId, dst: NodeId, width: Option<u64>) -> Result<(), Error> {
        if !self.locations.object(loc).loadable() {
            return Ok(());
        }
        for c in self.locations.cells_in_range(loc, width) {
            let src = self.cell(c)?;
            self.add_edge(src, dst);
        }
        Ok(())
    }

    fn store(&mut self, loc: LocId, src: NodeId, width: Option<u64>) -> Result<(), Error> {
        if !self.locations.object(loc).storable() {
            return Ok(());
        }
        for c in self.locations.cells_in_range(loc, width) {
            let dst = self.cell(c)?;
            self.add_edge(src, dst);
        }
        Ok(())
    }

    fn gep(&mut self, loc: LocId, g: usize) -> Result<(), Error> {
        let resolved = {
            let gep = &self.geps[g];
            self.locations.resolve(loc, gep.offset, &gep.strides)
        };
        let dst = self.geps[g].dst;
        match resolved {
            Resolution::Field(l) => self.add_token(l, dst),
            Resolution::Collapse(obj) => {
                self.collapse(obj)?;
                let base = self.locations.object_by_id(obj).base();
                self.add_token(base, dst);
            }
        }
        Ok(())
    }

    fn copy(&mut self, m: usize, dst: LocId, src: LocId) -> Result<(), Error> {
        let size = self.memcpys[m].size;
        match self.locations.copy_pairs(dst, src, size) {
            Some(pairs) => {
                for (d, s) in pairs {
                    let (dn, sn) = (self.cell(d)?, self.cell(s)?);
                    self.add_edge(sn, dn);
                }
            }
            None => {
                let site = self.memcpys[m].site.clone();
                self.diagnose(Diagnostic::InvalidMemcpy { site });
            }
        }
        Ok(())
    }

    /// Give up on the fields of an object: its cells all stand for the same
    /// memory from now on.
    pub(crate) fn collapse(&mut self, obj: ObjectId) -> Result<(), Error> {
        let cells = self.locations.collapse(obj);
        if cells.is_empty() {
            return Ok(());
        }
        let base = self.locations.object_by_id(obj).base();
        self.diagnose(Diagnostic::Collapsed {
            object: self.locations.name(base),
        });
        let b = self.cell(base)?;
        for c in cells {
            let n = self.cell(c)?;
            self.add_edge(b, n);
            self.add_edge(n, b);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Propagation

    fn process(&mut self, loc: LocId, n: NodeId) -> Result<(), Error> {
        // Indices rather than iterators: processing may add constraints to
        // this very node.
        let mut i = 0;
        while i < self.nodes[n.index()].copies.len() {
            let dst = self.nodes[n.index()].copies[i];
            self.add_token(loc, dst);
            i += 1;
        }
        let mut i = 0;
        while i < self.nodes[n.index()].loads.len() {
            let (dst, width) = self.nodes[n.index()].loads[i];
            self.load(loc, dst, width)?;
            i += 1;
        }
        let mut i = 0;
        while i < self.nodes[n.index()].stores.len() {
            let (src, width) = self.nodes[n.index()].stores[i];
            self.store(loc, src, width)?;
            i += 1;
        }
        let mut i = 0;
        while i < self.nodes[n.index()].geps.len() {
            let g = self.nodes[n.index()].geps[i];
            self.gep(loc, g)?;
            i += 1;
        }
        let mut i = 0;
        while i < self.nodes[n.index()].memcpys.len() {
            let m = self.nodes[n.index()].memcpys[i];
            let Memcpy { dst, src, .. } = self.memcpys[m];
            if n == dst {
                for s in self.current(src) {
                    self.copy(m, loc, s)?;
                }
            }
            if n == src {
                for d in self.current(dst) {
                    if n == dst && d == loc {
                        continue;
                    }
                    self.copy(m, d, loc)?;
                }
            }
            i += 1;
        }
        let mut i = 0;
        while i < self.nodes[n.index()].calls.len() {
            let c = self.nodes[n.index()].calls[i];
            self.resolve_call(c, loc)?;
            i += 1;
        }
        Ok(())
    }

    /// Do one unit of work: generate the constraints of one pending
    /// instance, or process one token. Returns `false` once there's nothing
    /// left to do.
    pub fn step(&mut self) -> Result<bool, Error> {
        if let Some(i) = self.pending.pop() {
            self.build_instance(i)?;
            self.drain_overflows();
            return Ok(true);
        }
        if let Some((loc, n)) = self.worklist.pop() {
            self.process(loc, n)?;
            self.drain_overflows();
            return Ok(true);
        }
        Ok(false)
    }

    pub fn propagate(&mut self) -> Result<(), Error> {
        while self.step()? {}
        Ok(())
    }

    /// Merge the objects that flow to the same values, where allowed (see
    /// [`Locations::mergeable`]). Returns true if anything was merged, in
    /// which case more propagation may be needed.
    pub(crate) fn unify(&mut self) -> Result<bool, Error> {
        let mut merges = Vec::new();
        for (i, key) in self.keys.iter().enumerate() {
            if !matches!(key, NodeKey::Value(..)) {
                continue;
            }
            let mut reps: Vec<LocId> = Vec::new();
            for l in self.nodes[i].pts.iter() {
                let l = self.locations.find(LocId::from_index(l));
                if reps.contains(&l) {
                    continue;
                }
                match reps.iter().find(|r| self.locations.mergeable(**r, l)) {
                    Some(r) => merges.push((*r, l)),
                    None => reps.push(l),
                }
            }
        }
        let mut merged = false;
        for (a, b) in merges {
            let (oa, ob) = (self.locations.object_id(a), self.locations.object_id(b));
            self.collapse(oa)?;
            self.collapse(ob)?;
            let ba = self.locations.object_by_id(oa).base();
            let bb = self.locations.object_by_id(ob).base();
            if self.locations.union(ba, bb) {
                let (na, nb) = (self.cell(ba)?, self.cell(bb)?);
                self.add_edge(na, nb);
                self.add_edge(nb, na);
                merged = true;
            }
        }
        Ok(merged)
    }

    /// Run to a fixed point, alternating propagation and (if enabled)
    /// unification.
    pub fn run(&mut self) -> Result<(), Error> {
        loop {
            {
                let _span = trace_span!("solve").entered();
                self.propagate()?;
            }
            if !self.opts.unification {
                return Ok(());
            }
            let _span = trace_span!("unify").entered();
            if !self.unify()? {
                return Ok(());
            }
        }
    }

    // ------------------------------------------------------------------
    // Diagnostics

    pub(crate) fn diagnose(&mut self, d: Diagnostic) {
        if self.diagnosed.insert(d.clone()) {
            debug!("{}", d);
            self.diagnostics.push(d);
        }
    }

    fn drain_overflows(&mut self) {
        for (obj, overflow) in self.locations.take_overflows() {
            let base = self.locations.object_by_id(obj).base();
            let reason = match overflow {
                Overflow::Depth => "layout nested too deeply".to_string(),
                Overflow::Fields(n) => format!("{} fields", n),
            };
            self.diagnose(Diagnostic::FieldCap {
                object: self.locations.name(base),
                reason,
            });
        }
    }

    pub(crate) fn into_parts(self) -> Parts {
        Parts {
            locations: self.locations,
            pts: self.nodes.into_iter().map(|n| n.pts).collect(),
            index: self.index,
            instances: self.instances,
            needs_signature: self.needs_signature,
            diagnostics: self.diagnostics,
        }
    }

    pub(crate) fn is_unknown(&self, loc: LocId) -> bool {
        self.locations.object(loc).alloc == Alloc::Unknown
    }
}

/// What's left of the state once solving is done.
pub(crate) struct Parts {
    pub(crate) locations: Locations,
    pub(crate) pts: Vec<BitSet>,
    pub(crate) index: FxHashMap<NodeKey, NodeId>,
    pub(crate) instances: Vec<(Context, FunctionName)>,
    pub(crate) needs_signature: BTreeSet<FunctionName>,
    pub(crate) diagnostics: Vec<Diagnostic>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::pointer::Options;
    use crate::ir::Module;

    const SWAP: &str = r#"{
        "functions": [{
            "name": "main",
            "body": [
                {"result": "a", "pointer": true, "opcode": {"alloca": {"layout": {"scalar": 8}}}},
                {"result": "b", "pointer": true, "opcode": {"alloca": {"layout": {"scalar": 8}}}},
                {"result": "p", "pointer": true, "opcode": {"alloca": {"layout": {"scalar": 8}}}},
                {"opcode": {"store": {"pointer": {"local": "p"}, "value": {"local": "a"}}}},
                {"result": "q", "pointer": true, "opcode": {"load": {"pointer": {"local": "p"}}}},
                {"opcode": {"store": {"pointer": {"local": "q"}, "value": {"local": "b"}}}},
                {"result": "r", "pointer": true, "opcode": {"load": {"pointer": {"local": "a"}}}}
            ]
        }]
    }"#;

    #[test]
    fn monotone() {
        let module = Module::from_json(SWAP).unwrap();
        let sigs = Signatures::empty();
        let opts = Options::default();
        let mut state = AnalysisState::new(&module, &sigs, &opts);
        state.seed().unwrap();
        let mut before: Vec<BitSet> = Vec::new();
        while state.step().unwrap() {
            let after: Vec<BitSet> = state.nodes.iter().map(|n| n.pts.clone()).collect();
            for (b, a) in before.iter().zip(after.iter()) {
                assert!(b.is_subset(a));
            }
            before = after;
        }
        let main = state.instances[0].clone();
        assert_eq!(Context::new(0, Vec::new()), main.0);
        let r = state
            .lookup(&NodeKey::Value(InstanceId(0), LocalName::from("r")))
            .unwrap();
        let b = state
            .lookup(&NodeKey::Value(InstanceId(0), LocalName::from("b")))
            .unwrap();
        assert_eq!(
            state.points_to(b).iter().collect::<Vec<_>>(),
            state.points_to(r).iter().collect::<Vec<_>>()
        );
        assert_eq!(1, state.points_to(r).len());
    }

    #[test]
    fn node_budget() {
        let module = Module::from_json(SWAP).unwrap();
        let sigs = Signatures::empty();
        let opts = Options {
            max_nodes: 4,
            ..Options::default()
        };
        let mut state = AnalysisState::new(&module, &sigs, &opts);
        let res = state.seed().and_then(|_| state.run());
        assert!(matches!(
            res,
            Err(Error::Incomplete {
                resource: Resource::Nodes,
                limit: 4
            })
        ));
    }

    #[test]
    fn edges_propagate_existing_tokens() {
        let module = Module::default();
        let sigs = Signatures::empty();
        let opts = Options::default();
        let mut state = AnalysisState::new(&module, &sigs, &opts);
        let a = state.node(NodeKey::Exception).unwrap();
        let b = state.cell(LocId::NULL).unwrap();
        state.add_token(LocId::UNKNOWN, a);
        state.propagate().unwrap();
        state.add_edge(a, b);
        state.propagate().unwrap();
        assert!(state.points_to(b).contains(LocId::UNKNOWN.index()));
        assert!(state.is_unknown(LocId::UNKNOWN));
    }
}

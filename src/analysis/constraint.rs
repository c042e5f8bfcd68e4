// SPDX-License-Identifier: BSD-3-Clause
//! Constraint generation.
//!
//! Seeding creates the locations of globals and functions, the contents of
//! initialized globals, and the instances of every defined function in the
//! root context. Each instance's body is then turned into constraints when
//! the solver gets to it, see [`AnalysisState::build_instance`].

use tracing::trace_span;

use crate::alloc::{Alloc, LocId, Resolution};
use crate::ir::instruction::{Instruction, Opcode};
use crate::ir::{Constant, Function, FunctionName, Global, Operand, Referent};

use super::solver::{AnalysisState, Context, InstanceId, NodeId, NodeKey};
use super::{Diagnostic, Error};

/// Aggregate initializers with more scalars than this are not split into
/// fields.
const MAX_INITIALIZER_LEAVES: usize = 1 << 16;

impl<'m> AnalysisState<'m> {
    /// Create the locations of all globals and functions, and the instances
    /// of all defined functions in the root context.
    pub fn seed(&mut self) -> Result<(), Error> {
        let _span = trace_span!("build").entered();
        let module = self.module;

        let unknown = self.cell(LocId::UNKNOWN)?;
        self.add_token(LocId::UNKNOWN, unknown);

        for f in &module.functions {
            self.locations.new_function(f.name.clone())?;
        }
        for d in &module.declarations {
            self.locations.new_function(d.name.clone())?;
        }
        let mut bases = Vec::with_capacity(module.globals.len());
        for g in &module.globals {
            bases.push(
                self.locations
                    .new_global(g.name.clone(), g.constant, g.layout.as_ref())?,
            );
        }
        for (g, base) in module.globals.iter().zip(bases) {
            self.seed_global(g, base)?;
        }

        let root = Context::new(self.opts.contexts.into(), Vec::new());
        for f in &module.functions {
            self.instantiate(root.clone(), &f.name);
        }

        let entry = FunctionName::from(self.opts.entry.as_str());
        match self.functions.get(&entry).copied() {
            Some(main) => {
                let i = self.instantiate(root, &main.name);
                if let Some(argv) = main.parameters.get(1) {
                    let args = self.locations.new_external("argv")?;
                    let strings = self.locations.new_external("argv[*]")?;
                    let n = self.node(NodeKey::Value(i, argv.clone()))?;
                    self.add_token(args, n);
                    let c = self.cell(args)?;
                    self.add_token(strings, c);
                }
            }
            None => self.diagnose(Diagnostic::NoEntry { function: entry }),
        }
        Ok(())
    }

    fn seed_global(&mut self, g: &'m Global, base: LocId) -> Result<(), Error> {
        let Some(init) = &g.initializer else {
            // Defined elsewhere; points to memory the environment owns.
            let ext = self.locations.new_external(&g.name.to_string())?;
            let c = self.cell(base)?;
            self.add_token(ext, c);
            let e = self.cell(ext)?;
            self.add_token(LocId::UNKNOWN, e);
            return Ok(());
        };
        let leaves = g
            .layout
            .as_ref()
            .and_then(|l| l.leaves(MAX_INITIALIZER_LEAVES));
        for (leaf, r) in init.pointers() {
            let target = self.referent_loc(&r)?;
            let offset = match &leaves {
                Some(ls) => ls.get(leaf).map(|o| *o as i64),
                None if leaf == 0 => Some(0),
                // Doesn't match the layout; resolved below by collapsing
                None => None,
            };
            let cell = match offset.map(|o| self.locations.resolve(base, o, &[])) {
                Some(Resolution::Field(c)) => c,
                Some(Resolution::Collapse(obj)) => {
                    self.collapse(obj)?;
                    base
                }
                None => {
                    let obj = self.locations.object_id(base);
                    self.collapse(obj)?;
                    base
                }
            };
            let n = self.cell(cell)?;
            self.add_token(target, n);
        }
        Ok(())
    }

    /// The location a constant pointer refers to.
    fn referent_loc(&mut self, r: &Referent<'_>) -> Result<LocId, Error> {
        match r {
            Referent::Function(name) => self.locations.new_function((*name).clone()),
            Referent::Global(name, offset) => {
                let base = match self.locations.get(&Alloc::Global((*name).clone())) {
                    Some(b) => b,
                    None => self.locations.new_global((*name).clone(), false, None)?,
                };
                match self.locations.resolve(base, *offset, &[]) {
                    Resolution::Field(l) => Ok(l),
                    Resolution::Collapse(obj) => {
                        self.collapse(obj)?;
                        Ok(base)
                    }
                }
            }
            Referent::Null => Ok(LocId::NULL),
            Referent::Unknown => Ok(LocId::UNKNOWN),
        }
    }

    pub(crate) fn seed_constant(&mut self, n: NodeId, c: &Constant) -> Result<(), Error> {
        for (_, r) in c.pointers() {
            let l = self.referent_loc(&r)?;
            self.add_token(l, n);
        }
        Ok(())
    }

    pub(crate) fn operand(&mut self, i: InstanceId, op: &Operand) -> Result<NodeId, Error> {
        match op {
            Operand::Local(l) => self.node(NodeKey::Value(i, l.clone())),
            Operand::Constant(c) => self.node(NodeKey::Constant(c.clone())),
        }
    }

    /// `pts(op) ⊆ pts(result)`
    fn flow(&mut self, i: InstanceId, op: &Operand, result: Option<NodeId>) -> Result<(), Error> {
        if let Some(r) = result {
            let n = self.operand(i, op)?;
            self.add_edge(n, r);
        }
        Ok(())
    }

    /// Generate the constraints for the body of one instance.
    pub(crate) fn build_instance(&mut self, i: InstanceId) -> Result<(), Error> {
        let name = self.instance(i).1.clone();
        let Some(f) = self.functions.get(&name).copied() else {
            return Ok(());
        };
        for (index, instr) in f.body.iter().enumerate() {
            self.build_instruction(i, f, index, instr)?;
        }
        Ok(())
    }

    fn build_instruction(
        &mut self,
        i: InstanceId,
        f: &'m Function,
        index: usize,
        instr: &'m Instruction,
    ) -> Result<(), Error> {
        let site = f.site(index);
        let result = match &instr.result {
            Some(r) => Some(self.node(NodeKey::Value(i, r.clone()))?),
            None => None,
        };
        match &instr.opcode {
            Opcode::Alloca(a) => {
                if let Some(r) = result {
                    let loc = self.locations.new_stack_slot(site, a.layout.as_ref())?;
                    self.add_token(loc, r);
                }
            }
            Opcode::Load(l) => {
                let p = self.operand(i, &l.pointer)?;
                self.loaded.push(p);
                if let Some(r) = result {
                    self.add_load(p, r, l.width)?;
                }
            }
            Opcode::Store(s) => {
                let p = self.operand(i, &s.pointer)?;
                let v = self.operand(i, &s.value)?;
                self.stored.push(p);
                self.add_store(p, v, s.width)?;
            }
            Opcode::GetElementPtr(g) => {
                if let Some(r) = result {
                    let p = self.operand(i, &g.pointer)?;
                    self.add_gep(p, r, g.offset, g.strides.clone())?;
                }
            }
            Opcode::Cast(c) => self.flow(i, &c.value, result)?,
            Opcode::Binary(b) => {
                if let Some(r) = result {
                    // Arithmetic on addresses, through integers or not, is
                    // field addressing.
                    for (op, offset) in b.pointer_operands() {
                        let n = self.operand(i, op)?;
                        match offset {
                            Some(k) => self.add_gep(n, r, k, Vec::new())?,
                            // Anywhere in the object
                            None => self.add_gep(n, r, 0, vec![1])?,
                        }
                    }
                }
            }
            Opcode::Compare(_) => (),
            Opcode::Phi(p) => {
                for op in &p.incoming {
                    self.flow(i, op, result)?;
                }
            }
            Opcode::Select(s) => {
                self.flow(i, &s.true_value, result)?;
                self.flow(i, &s.false_value, result)?;
            }
            Opcode::ExtractValue(e) => self.flow(i, &e.aggregate, result)?,
            Opcode::InsertValue(v) => {
                self.flow(i, &v.aggregate, result)?;
                self.flow(i, &v.value, result)?;
            }
            Opcode::Call(c) => self.build_call(i, site, c, result)?,
            Opcode::Ret(r) => {
                if let Some(v) = &r.value {
                    let v = self.operand(i, v)?;
                    let ret = self.node(NodeKey::Return(i))?;
                    self.add_edge(v, ret);
                }
            }
            Opcode::LandingPad(_) => {
                if let Some(r) = result {
                    let e = self.node(NodeKey::Exception)?;
                    self.add_edge(e, r);
                }
            }
            Opcode::VaStart(v) => {
                let list = self.operand(i, &v.list)?;
                let args = self.locations.new_varargs(f.name.clone())?;
                let t = self.node(NodeKey::Temp(i, index))?;
                self.add_token(args, t);
                self.add_store(list, t, None)?;
            }
            Opcode::VaArg(v) => {
                if let Some(r) = result {
                    match v.index {
                        Some(k) => {
                            let a = self.node(NodeKey::VarArg(i, k))?;
                            self.add_edge(a, r);
                        }
                        None => {
                            // The list points to the arguments, which point
                            // to whatever was passed.
                            let list = self.operand(i, &v.list)?;
                            let t = self.node(NodeKey::Temp(i, index))?;
                            self.add_load(list, t, None)?;
                            self.add_load(t, r, None)?;
                        }
                    }
                }
            }
            Opcode::VaCopy(v) => {
                let dst = self.operand(i, &v.dst)?;
                let src = self.operand(i, &v.src)?;
                let t = self.node(NodeKey::Temp(i, index))?;
                self.add_load(src, t, None)?;
                self.add_store(dst, t, None)?;
            }
            Opcode::Other(o) => {
                if let Some(r) = result {
                    self.add_token(LocId::UNKNOWN, r);
                }
                let unknown = self.cell(LocId::UNKNOWN)?;
                for op in &o.operands {
                    let n = self.operand(i, op)?;
                    self.add_edge(n, unknown);
                }
                self.diagnose(Diagnostic::Unmodeled {
                    site,
                    mnemonic: o.mnemonic.clone(),
                });
            }
        }
        Ok(())
    }
}

// SPDX-License-Identifier: BSD-3-Clause
//! Queries over a [`Solution`], and checking of the `assert_*` directives
//! test programs use to state what they expect of the analysis.
//!
//! Points-to sets are canonicalized before being compared: locations that
//! were merged (collapsed fields, unified objects) count as one.

use either::Either;
use tracing::trace_span;

use crate::alloc::LocId;
use crate::bitset::BitSet;
use crate::ir::instruction::{Call, Callee, Opcode};
use crate::ir::{FunctionName, Module, Operand, Site};

use super::pointer::Solution;
use super::solver::NodeKey;
use super::Diagnostic;

impl Solution {
    /// Locations `op` may point to in `function`, in any context.
    pub fn points_to(&self, function: &FunctionName, op: &Operand) -> BitSet {
        let nodes = match op {
            Operand::Local(l) => Either::Left(
                self.by_function
                    .get(function)
                    .into_iter()
                    .flatten()
                    .filter_map(move |i| self.index.get(&NodeKey::Value(*i, l.clone()))),
            ),
            Operand::Constant(c) => {
                Either::Right(self.index.get(&NodeKey::Constant(c.clone())).into_iter())
            }
        };
        nodes
            .flat_map(|n| self.pts[n.index()].iter())
            .map(|l| self.locations.find(LocId::from_index(l)).index())
            .collect()
    }

    /// Whether `op` may point to something other than null.
    pub fn points_to_something(&self, function: &FunctionName, op: &Operand) -> bool {
        self.points_to(function, op)
            .iter()
            .any(|l| l != LocId::NULL.index())
    }

    /// Whether `op` points to nothing, or at most to null.
    pub fn points_to_nothing(&self, function: &FunctionName, op: &Operand) -> bool {
        !self.points_to_something(function, op)
    }

    /// Whether `a` and `b` may point to the same memory. Null never aliases
    /// anything; unknown memory aliases everything.
    pub fn may_alias(&self, function: &FunctionName, a: &Operand, b: &Operand) -> bool {
        let (pa, pb) = (self.points_to(function, a), self.points_to(function, b));
        let unknown = LocId::UNKNOWN.index();
        if pa.contains(unknown) || pb.contains(unknown) {
            return true;
        }
        let shared = pa
            .iter()
            .any(|l| l != LocId::NULL.index() && pb.contains(l));
        shared
    }

    pub fn is_reachable(&self, function: &FunctionName) -> bool {
        self.reachable.contains(function)
    }
}

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub enum DirectiveKind {
    PointsToSomething,
    PointsToNothing,
    MayAlias,
    Disjoint,
    Reachable,
    Unreachable,
}

impl DirectiveKind {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "assert_points_to_something" => Some(DirectiveKind::PointsToSomething),
            "assert_points_to_nothing" => Some(DirectiveKind::PointsToNothing),
            "assert_may_alias" => Some(DirectiveKind::MayAlias),
            "assert_disjoint" => Some(DirectiveKind::Disjoint),
            "assert_reachable" => Some(DirectiveKind::Reachable),
            "assert_unreachable" => Some(DirectiveKind::Unreachable),
            _ => None,
        }
    }
}

/// One `assert_*` call, and whether it holds.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Directive {
    pub site: Site,
    pub kind: DirectiveKind,
    pub args: Vec<Operand>,
    pub holds: bool,
}

impl Solution {
    fn check(&self, site: &Site, kind: DirectiveKind, args: &[Operand]) -> bool {
        let f = &site.function;
        match kind {
            DirectiveKind::PointsToSomething => {
                args.iter().all(|a| self.points_to_something(f, a))
            }
            DirectiveKind::PointsToNothing => args.iter().all(|a| self.points_to_nothing(f, a)),
            DirectiveKind::MayAlias => match args {
                [a, b] => self.may_alias(f, a, b),
                _ => false,
            },
            DirectiveKind::Disjoint => match args {
                [a, b] => !self.may_alias(f, a, b),
                _ => false,
            },
            DirectiveKind::Reachable => self.is_reachable(f),
            DirectiveKind::Unreachable => !self.is_reachable(f),
        }
    }
}

/// Check every directive in the module. Calls to `assert_*` functions that
/// aren't directives are reported rather than checked.
pub fn check_directives(module: &Module, solution: &Solution) -> (Vec<Directive>, Vec<Diagnostic>) {
    let _span = trace_span!("directives").entered();
    let mut calls: Vec<(Site, DirectiveKind, &Call)> = Vec::new();
    let mut unknown = Vec::new();
    for f in &module.functions {
        for (site, instr) in f.instructions() {
            let Opcode::Call(c) = &instr.opcode else {
                continue;
            };
            let Callee::Direct(name) = &c.callee else {
                continue;
            };
            match DirectiveKind::from_name(name.get()) {
                Some(kind) => calls.push((site, kind, c)),
                None if name.starts_with("assert_") => unknown.push(Diagnostic::UnknownDirective {
                    site,
                    function: name.clone(),
                }),
                None => (),
            }
        }
    }
    (check_all(solution, &calls), unknown)
}

fn check_one(solution: &Solution, (site, kind, call): &(Site, DirectiveKind, &Call)) -> Directive {
    Directive {
        site: site.clone(),
        kind: *kind,
        args: call.args.clone(),
        holds: solution.check(site, *kind, &call.args),
    }
}

#[cfg(not(feature = "par"))]
fn check_all(solution: &Solution, calls: &[(Site, DirectiveKind, &Call)]) -> Vec<Directive> {
    calls.iter().map(|c| check_one(solution, c)).collect()
}

#[cfg(feature = "par")]
fn check_all(solution: &Solution, calls: &[(Site, DirectiveKind, &Call)]) -> Vec<Directive> {
    let threads = std::thread::available_parallelism().map_or(1, usize::from);
    let chunk = calls.len().div_ceil(threads).max(1);
    std::thread::scope(|s| {
        let handles: Vec<_> = calls
            .chunks(chunk)
            .map(|cs| {
                s.spawn(move || {
                    cs.iter()
                        .map(|c| check_one(solution, c))
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        handles
            .into_iter()
            .flat_map(|h| h.join().unwrap_or_else(|e| std::panic::resume_unwind(e)))
            .collect()
    })
}

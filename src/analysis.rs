// SPDX-License-Identifier: BSD-3-Clause
//! Points-to analysis: constraint generation, solving, call-graph
//! resolution, and queries over the result.
//!
//! The phases share one [`solver::AnalysisState`]. Constraint generation
//! ([`constraint`]) adds nodes, edges and complex constraints for each
//! function instance; the solver propagates locations along them; the
//! call-graph resolver ([`callgraph`]) connects call sites to their callees as
//! targets become known, which in turn instantiates callee bodies. Once
//! nothing changes the state is frozen into a [`pointer::Solution`], which
//! answers the queries in [`query`].

use std::fmt::Display;

use crate::ir::{FunctionName, Site};

pub mod callgraph;
pub mod constraint;
mod error;
pub use error::*;
pub mod pointer;
pub mod query;
pub mod solver;

/// A problem the analysis recovered from. The result is still sound, but may
/// be less precise than it would otherwise be.
#[derive(Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub enum Diagnostic {
    /// A field-sensitive object lost its fields.
    Collapsed { object: String },
    /// A layout was too big or too deep to split into fields.
    FieldCap { object: String, reason: String },
    /// An instruction the analysis doesn't understand; its result points to
    /// unknown memory and its operands escape.
    Unmodeled { site: Site, mnemonic: String },
    /// A copy that can't happen in a well-defined program, e.g. one bigger
    /// than its destination.
    InvalidMemcpy { site: Site },
    /// A call to a function with neither a body nor a signature.
    NeedsSignature { function: FunctionName },
    /// A call to an `assert_*` function this crate doesn't know.
    UnknownDirective { site: Site, function: FunctionName },
    /// The entry function isn't defined in the module.
    NoEntry { function: FunctionName },
    /// A reachable instruction producing a pointer that points to nothing.
    PointsToNothing { site: Site },
}

impl Display for Diagnostic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Diagnostic::Collapsed { object } => write!(f, "collapsed fields of {}", object),
            Diagnostic::FieldCap { object, reason } => {
                write!(f, "{} is field-insensitive: {}", object, reason)
            }
            Diagnostic::Unmodeled { site, mnemonic } => {
                write!(f, "{}: unmodeled instruction {}", site, mnemonic)
            }
            Diagnostic::InvalidMemcpy { site } => write!(f, "{}: invalid memcpy", site),
            Diagnostic::NeedsSignature { function } => {
                write!(f, "{} needs a signature", function)
            }
            Diagnostic::UnknownDirective { site, function } => {
                write!(f, "{}: unknown assertion {}", site, function)
            }
            Diagnostic::NoEntry { function } => {
                write!(f, "entry function {} is not defined", function)
            }
            Diagnostic::PointsToNothing { site } => {
                write!(f, "{}: pointer points to nothing", site)
            }
        }
    }
}

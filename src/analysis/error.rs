// SPDX-License-Identifier: BSD-3-Clause
use std::fmt::Display;

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub enum Resource {
    Locations,
    Nodes,
}

impl Display for Resource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Resource::Locations => write!(f, "abstract locations"),
            Resource::Nodes => write!(f, "constraint nodes"),
        }
    }
}

/// Conditions that keep the analysis from producing a sound answer. Anything
/// else is recovered from, see [`super::Diagnostic`].
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Analysis incomplete: exceeded the budget of {limit} {resource}")]
    Incomplete { resource: Resource, limit: usize },
    #[error(transparent)]
    Malformed(#[from] crate::ir::Error),
}

// SPDX-License-Identifier: BSD-3-Clause
use std::fmt::Display;

#[derive(
    Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, serde::Deserialize, serde::Serialize,
)]
#[serde(transparent)]
pub struct GlobalName(String);

impl GlobalName {
    pub(crate) fn get(&self) -> &str {
        &self.0
    }
}

impl From<&str> for GlobalName {
    fn from(s: &str) -> Self {
        GlobalName(s.to_string())
    }
}

impl From<String> for GlobalName {
    fn from(s: String) -> Self {
        GlobalName(s)
    }
}

impl Display for GlobalName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "@{}", self.0)
    }
}

#[derive(
    Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, serde::Deserialize, serde::Serialize,
)]
#[serde(transparent)]
pub struct FunctionName(String);

impl From<&str> for FunctionName {
    fn from(s: &str) -> Self {
        FunctionName(s.to_string())
    }
}

impl From<String> for FunctionName {
    fn from(s: String) -> Self {
        FunctionName(s)
    }
}

impl<T> PartialEq<T> for FunctionName
where
    T: AsRef<str>,
{
    fn eq(&self, other: &T) -> bool {
        self.0.as_str().eq(other.as_ref())
    }
}

impl FunctionName {
    pub(crate) fn starts_with(&self, s: &str) -> bool {
        self.0.starts_with(s)
    }

    pub fn get(&self) -> &str {
        &self.0
    }
}

impl Display for FunctionName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "@{}", self.0)
    }
}

/// Name of an SSA value (parameter or instruction result), unique within its
/// function.
#[derive(
    Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, serde::Deserialize, serde::Serialize,
)]
#[serde(transparent)]
pub struct LocalName(String);

impl From<&str> for LocalName {
    fn from(s: &str) -> Self {
        LocalName(s.to_string())
    }
}

impl Display for LocalName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "%{}", self.0)
    }
}

/// Static program point: an instruction, identified by its function and its
/// position in the function body. Allocation sites and call sites are
/// `Site`s.
#[derive(Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct Site {
    pub function: FunctionName,
    pub index: usize,
}

impl Site {
    pub fn new(function: FunctionName, index: usize) -> Self {
        Site { function, index }
    }
}

impl Display for Site {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.function, self.index)
    }
}

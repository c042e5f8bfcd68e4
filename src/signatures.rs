// SPDX-License-Identifier: BSD-3-Clause
//! Models of external functions.
//!
//! Signatures are keyed by regular expressions over function names, and are
//! read from JSON:
//!
//! ```json
//! {
//!   "^xmalloc$": [{"return-alloc": {"type": "heap", "size-arg": 0}}],
//!   "^getenv$": [{"return-points-to-global": {"global": "environ"}}]
//! }
//! ```
//!
//! User-provided signatures take precedence over the builtin ones: if any
//! user regex matches a name, the builtins are not consulted for it.

use std::collections::HashMap;

use dashmap::DashMap;
use regex::RegexSet;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Couldn't deserialize points-to signatures: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Bad points-to signature regex: {0}")]
    Regex(#[from] regex::Error),
}

#[derive(Clone, Debug, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum AllocType {
    Heap,
    Stack,
    Top,
}

// TODO: Something for `getline` &co.
#[allow(clippy::enum_variant_names)]
#[derive(Clone, Debug, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Signature {
    /// The function calls its `arg`-th argument, passing it the listed
    /// arguments.
    CallsArg {
        arg: usize,
        #[serde(default)]
        args: Vec<usize>,
    },
    ReturnAlloc {
        r#type: AllocType,
        #[serde(default, rename = "size-arg")]
        size_arg: Option<usize>,
    },
    /// Returns either its `arg`-th argument, or a fresh heap allocation
    /// holding a copy of what it points to.
    ReturnRealloc {
        arg: usize,
        #[serde(default, rename = "size-arg")]
        size_arg: Option<usize>,
    },
    ReturnAliasesArg {
        arg: usize,
    },
    ReturnPointsToGlobal {
        global: String,
    },
    ArgMemcpyArg {
        dst: usize,
        src: usize,
        #[serde(default, rename = "size-arg")]
        size_arg: Option<usize>,
    },
    /// Throws its `arg`-th argument as an exception.
    Throw {
        arg: usize,
    },
    /// The function has no effect on the points-to graph.
    NoEffect,
}

/// Signatures of common C and C++ runtime functions.
fn builtins() -> HashMap<String, Vec<Signature>> {
    let heap = |size_arg| Signature::ReturnAlloc {
        r#type: AllocType::Heap,
        size_arg,
    };
    let memcpy = vec![
        Signature::ArgMemcpyArg {
            dst: 0,
            src: 1,
            size_arg: Some(2),
        },
        Signature::ReturnAliasesArg { arg: 0 },
    ];
    let mut sigs: HashMap<String, Vec<Signature>> = HashMap::from([
        ("^malloc$".to_string(), vec![heap(Some(0))]),
        ("^calloc$".to_string(), vec![heap(None)]),
        ("^_Zna?m$".to_string(), vec![heap(Some(0))]),
        ("^strn?dup$".to_string(), vec![heap(None)]),
        ("^__cxa_allocate_exception$".to_string(), vec![heap(Some(0))]),
        (
            "^alloca$".to_string(),
            vec![Signature::ReturnAlloc {
                r#type: AllocType::Stack,
                size_arg: Some(0),
            }],
        ),
        (
            "^realloc$".to_string(),
            vec![Signature::ReturnRealloc {
                arg: 0,
                size_arg: Some(1),
            }],
        ),
        (
            "^reallocarray$".to_string(),
            vec![Signature::ReturnRealloc {
                arg: 0,
                size_arg: None,
            }],
        ),
        ("^__cxa_throw$".to_string(), vec![Signature::Throw { arg: 0 }]),
        (
            "^__cxa_begin_catch$".to_string(),
            vec![Signature::ReturnAliasesArg { arg: 0 }],
        ),
        (
            "^(memcpy|memmove|__memcpy_chk|llvm\\.memcpy\\..*|llvm\\.memmove\\..*)$".to_string(),
            memcpy,
        ),
    ]);
    for no_effect in [
        "^assert_.*$",
        "^free$",
        "^strto(l|ll|ul|ull|d)$",
        "^__cxa_end_catch$",
        "^(printf|puts|putchar|strlen|strcmp|strncmp|abs|rand|exit|abort)$",
        "^llvm\\.(va_end|lifetime\\..*|dbg\\..*)$",
    ] {
        sigs.insert(no_effect.to_string(), vec![Signature::NoEffect]);
    }
    sigs
}

#[derive(Debug)]
struct Table {
    sigs: HashMap<String, Vec<Signature>>,
    regexes: Vec<String>,
    set: RegexSet,
}

impl Table {
    fn new(sigs: HashMap<String, Vec<Signature>>) -> Result<Self, regex::Error> {
        let regexes: Vec<String> = sigs.keys().map(|s| s.to_string()).collect();
        let set = RegexSet::new(&regexes)?;
        Ok(Table { sigs, regexes, set })
    }

    fn signatures_for(&self, func: &str) -> Option<Vec<Signature>> {
        let mut matched = false;
        let mut sigs = Vec::new();
        for m in self.set.matches(func) {
            matched = true;
            sigs.extend(self.sigs[&self.regexes[m]].iter().cloned());
        }
        if matched {
            Some(sigs)
        } else {
            None
        }
    }
}

#[derive(Debug)]
pub struct Signatures {
    user: Table,
    builtin: Option<Table>,
    cache: DashMap<String, Option<Vec<Signature>>>,
}

impl Default for Signatures {
    /// The builtin signatures only.
    fn default() -> Self {
        Self::new(HashMap::new()).unwrap_or_else(|_| Self::empty())
    }
}

impl Signatures {
    /// User signatures, falling back to the builtin ones.
    pub fn new(sigs: HashMap<String, Vec<Signature>>) -> Result<Self, regex::Error> {
        Ok(Signatures {
            user: Table::new(sigs)?,
            builtin: Some(Table::new(builtins())?),
            cache: DashMap::new(),
        })
    }

    /// No signatures at all, not even builtin ones.
    pub fn empty() -> Self {
        Signatures {
            user: Table {
                sigs: HashMap::new(),
                regexes: Vec::new(),
                set: RegexSet::empty(),
            },
            builtin: None,
            cache: DashMap::new(),
        }
    }

    pub fn from_json(json: &str) -> Result<Self, Error> {
        Ok(Self::new(serde_json::from_str(json)?)?)
    }

    pub fn has_signatures_for(&self, func: &str) -> bool {
        self.signatures_for(func).is_some()
    }

    pub fn signatures_for(&self, func: &str) -> Option<Vec<Signature>> {
        if let Some(hit) = self.cache.get(func) {
            return hit.value().clone();
        }
        let sigs = self
            .user
            .signatures_for(func)
            .or_else(|| self.builtin.as_ref().and_then(|b| b.signatures_for(func)));
        self.cache.insert(func.to_string(), sigs.clone());
        sigs
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::{AllocType, Signature, Signatures};

    #[test]
    fn it_works() {
        let sigs = Signatures::empty();
        assert_eq!(None, sigs.signatures_for("f"));
        assert_eq!(None, sigs.signatures_for("malloc"));
    }

    #[test]
    fn builtins() {
        let sigs = Signatures::default();
        assert_eq!(
            Some(vec![Signature::ReturnAlloc {
                r#type: AllocType::Heap,
                size_arg: Some(0)
            }]),
            sigs.signatures_for("malloc")
        );
        assert!(sigs.has_signatures_for("llvm.memcpy.p0i8.p0i8.i64"));
        assert!(sigs.has_signatures_for("assert_points_to_something"));
        assert!(!sigs.has_signatures_for("xmalloc"));
        // Anchored
        assert!(!sigs.has_signatures_for("my_malloc"));
    }

    #[test]
    fn user_overrides_builtin() {
        let sigs = Signatures::new(HashMap::from([(
            "^malloc$".to_string(),
            vec![Signature::ReturnAlloc {
                r#type: AllocType::Top,
                size_arg: None,
            }],
        )]))
        .unwrap();
        assert_eq!(
            Some(vec![Signature::ReturnAlloc {
                r#type: AllocType::Top,
                size_arg: None
            }]),
            sigs.signatures_for("malloc")
        );
        // Cached
        assert_eq!(
            sigs.signatures_for("malloc"),
            sigs.signatures_for("malloc")
        );
    }

    #[test]
    fn from_json() {
        let sigs = Signatures::from_json(
            r#"{
                "^xmalloc$": [{"return-alloc": {"type": "heap", "size-arg": 0}}],
                "^__errno_location$": [{"return-points-to-global": {"global": "errno"}}],
                "^qsort$": [{"calls-arg": {"arg": 3, "args": [0, 0]}}],
                "^noop$": ["no-effect"]
            }"#,
        )
        .unwrap();
        assert_eq!(
            Some(vec![Signature::ReturnAlloc {
                r#type: AllocType::Heap,
                size_arg: Some(0)
            }]),
            sigs.signatures_for("xmalloc")
        );
        assert_eq!(
            Some(vec![Signature::CallsArg {
                arg: 3,
                args: vec![0, 0]
            }]),
            sigs.signatures_for("qsort")
        );
        assert_eq!(Some(vec![Signature::NoEffect]), sigs.signatures_for("noop"));
        assert!(Signatures::from_json(r#"{"(": []}"#).is_err());
    }
}

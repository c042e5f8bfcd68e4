// SPDX-License-Identifier: BSD-3-Clause
//! The instruction stream the analysis consumes: an SSA-like, already
//! lowered program, deserialized from JSON.
//!
//! A front end is responsible for lowering. The only things the analysis
//! needs from it are, per function, the ordered instructions, their operands,
//! and static metadata (type layouts for field resolution, symbol names).
//! The position of an instruction in its function's body is its static site.

use std::collections::HashSet;

mod error;
pub use error::*;
pub mod instruction;
pub mod layout;
mod name;
pub use name::*;
mod operand;
pub use operand::*;

use self::instruction::Instruction;
use self::layout::Layout;

#[derive(Clone, Debug, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
pub struct Global {
    pub name: GlobalName,
    #[serde(default)]
    pub layout: Option<Layout>,
    #[serde(default)]
    pub constant: bool,
    /// `None` for globals defined in another module.
    #[serde(default)]
    pub initializer: Option<Constant>,
}

impl Global {
    pub fn is_external(&self) -> bool {
        self.initializer.is_none()
    }
}

/// An external function.
#[derive(Clone, Debug, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
pub struct Declaration {
    pub name: FunctionName,
    #[serde(default)]
    pub parameters: usize,
    #[serde(default)]
    pub variadic: bool,
    #[serde(default)]
    pub returns_pointer: bool,
    #[serde(default)]
    pub takes_pointer: bool,
}

impl Declaration {
    /// Whether the declaration's type mentions pointers at all, i.e. whether
    /// calling it may matter to the analysis.
    pub fn mentions_pointers(&self) -> bool {
        self.returns_pointer || self.takes_pointer || self.variadic
    }
}

#[derive(Clone, Debug, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
pub struct Function {
    pub name: FunctionName,
    #[serde(default)]
    pub parameters: Vec<LocalName>,
    #[serde(default)]
    pub variadic: bool,
    #[serde(default)]
    pub body: Vec<Instruction>,
}

impl Function {
    pub fn site(&self, index: usize) -> Site {
        Site::new(self.name.clone(), index)
    }

    /// Instructions paired with their sites.
    pub fn instructions(&self) -> impl Iterator<Item = (Site, &Instruction)> {
        self.body
            .iter()
            .enumerate()
            .map(|(i, instr)| (self.site(i), instr))
    }

    fn validate(&self) -> Result<(), Error> {
        let mut defined = HashSet::new();
        for p in &self.parameters {
            if !defined.insert(p) {
                return Err(Error::Duplicate(format!("{} in {}", p, self.name)));
            }
        }
        for instr in &self.body {
            if let Some(r) = &instr.result {
                if !defined.insert(r) {
                    return Err(Error::Duplicate(format!("{} in {}", r, self.name)));
                }
            }
        }
        for instr in &self.body {
            for op in instr.opcode.operands() {
                if let Some(l) = op.as_local() {
                    if !defined.contains(l) {
                        return Err(Error::UndefinedLocal {
                            function: self.name.to_string(),
                            local: l.to_string(),
                        });
                    }
                }
            }
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
pub struct Module {
    #[serde(default)]
    pub globals: Vec<Global>,
    #[serde(default)]
    pub declarations: Vec<Declaration>,
    #[serde(default)]
    pub functions: Vec<Function>,
}

impl Module {
    pub fn from_json(json: &str) -> Result<Self, Error> {
        let module: Module = serde_json::from_str(json)?;
        module.validate()?;
        Ok(module)
    }

    pub fn validate(&self) -> Result<(), Error> {
        let mut globals = HashSet::new();
        for g in &self.globals {
            if !globals.insert(&g.name) {
                return Err(Error::Duplicate(g.name.to_string()));
            }
        }
        let mut functions = HashSet::new();
        for f in self.functions.iter().map(|f| &f.name) {
            if !functions.insert(f) {
                return Err(Error::Duplicate(f.to_string()));
            }
        }
        for d in self.declarations.iter().map(|d| &d.name) {
            if !functions.insert(d) {
                return Err(Error::Duplicate(d.to_string()));
            }
        }
        for f in &self.functions {
            f.validate()?;
        }
        Ok(())
    }

    pub fn function(&self, name: &FunctionName) -> Option<&Function> {
        self.functions.iter().find(|f| &f.name == name)
    }

    /// Number of instructions across all functions
    pub fn size(&self) -> usize {
        self.functions.iter().map(|f| f.body.len()).sum()
    }

    /// Functions that might be the target of an indirect call with the given
    /// number of arguments.
    pub fn indirect_call_targets(&self, nargs: usize) -> impl Iterator<Item = &FunctionName> {
        self.functions
            .iter()
            .filter(move |f| nargs >= f.parameters.len())
            .map(|f| &f.name)
            .chain(
                self.declarations
                    .iter()
                    .filter(move |d| nargs >= d.parameters)
                    .map(|d| &d.name),
            )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn undefined_local() {
        let json = r#"{
            "functions": [{
                "name": "main",
                "body": [{"result": "x", "opcode": {"load": {"pointer": {"local": "p"}}}}]
            }]
        }"#;
        assert!(matches!(
            Module::from_json(json),
            Err(Error::UndefinedLocal { .. })
        ));
    }

    #[test]
    fn duplicate_function() {
        let json = r#"{
            "functions": [{"name": "f"}],
            "declarations": [{"name": "f"}]
        }"#;
        assert!(matches!(Module::from_json(json), Err(Error::Duplicate(_))));
    }

    #[test]
    fn not_json() {
        assert!(matches!(Module::from_json("{"), Err(Error::Json(_))));
    }

    #[test]
    fn minimal() {
        let json = r#"{
            "globals": [{"name": "stderr"}],
            "functions": [{
                "name": "main",
                "parameters": ["argc", "argv"],
                "body": [
                    {"result": "x", "opcode": {"alloca": {"layout": {"scalar": 4}}}},
                    {"opcode": {"ret": {"value": {"constant": {"int": 0}}}}}
                ]
            }]
        }"#;
        let m = Module::from_json(json).unwrap();
        assert!(m.globals[0].is_external());
        assert_eq!(2, m.size());
        let main = m.function(&FunctionName::from("main")).unwrap();
        assert_eq!(2, main.parameters.len());
        assert_eq!(vec![&FunctionName::from("main")], m.indirect_call_targets(2).collect::<Vec<_>>());
        assert!(m.indirect_call_targets(1).next().is_none());
    }
}

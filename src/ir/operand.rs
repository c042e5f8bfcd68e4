// SPDX-License-Identifier: BSD-3-Clause
use std::fmt::Display;

use super::name::{FunctionName, GlobalName, LocalName};

#[derive(Clone, Debug, Hash, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Operand {
    Local(LocalName),
    Constant(Constant),
}

impl Display for Operand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Operand::Local(l) => write!(f, "{}", l),
            Operand::Constant(c) => write!(f, "{}", c),
        }
    }
}

impl Operand {
    pub fn local(name: &str) -> Self {
        Operand::Local(LocalName::from(name))
    }

    pub(crate) fn constant_int(&self) -> Option<i64> {
        match self {
            Operand::Constant(Constant::Int(i)) => Some(*i),
            _ => None,
        }
    }

    pub(crate) fn as_local(&self) -> Option<&LocalName> {
        match self {
            Operand::Local(l) => Some(l),
            Operand::Constant(_) => None,
        }
    }
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Constant {
    Function(FunctionName),
    Global(GlobalName),
    Int(i64),
    Null,
    Undef,
    BitCast(Box<Constant>),
    GetElementPtr {
        pointer: Box<Constant>,
        #[serde(default)]
        offset: i64,
    },
    PtrToInt(Box<Constant>),
    IntToPtr(Box<Constant>),
    Struct(Vec<Constant>),
    Array(Vec<Constant>),
    Other,
}

impl Display for Constant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Constant::Function(n) => write!(f, "{}", n),
            Constant::Global(n) => write!(f, "{}", n),
            Constant::Int(i) => write!(f, "{}", i),
            Constant::Null => write!(f, "null"),
            Constant::Undef => write!(f, "undef"),
            Constant::BitCast(c) => write!(f, "bitcast ({})", c),
            Constant::GetElementPtr { pointer, offset } => {
                write!(f, "getelementptr ({}, {})", pointer, offset)
            }
            Constant::PtrToInt(c) => write!(f, "ptrtoint ({})", c),
            Constant::IntToPtr(c) => write!(f, "inttoptr ({})", c),
            Constant::Struct(cs) | Constant::Array(cs) => {
                write!(f, "{{")?;
                for (i, c) in cs.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", c)?;
                }
                write!(f, "}}")
            }
            Constant::Other => write!(f, "<constant>"),
        }
    }
}

/// What a constant pointer refers to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Referent<'a> {
    Function(&'a FunctionName),
    Global(&'a GlobalName, i64),
    Null,
    Unknown,
}

impl Constant {
    /// The pointer-valued leaves of this constant, with the index of the
    /// leaf among all the scalar leaves of the (flattened) constant. See
    /// [`super::layout::Layout::leaves`] for the matching offsets.
    pub fn pointers(&self) -> Vec<(usize, Referent<'_>)> {
        let mut out = Vec::new();
        let mut leaf = 0;
        self.collect_pointers(&mut leaf, &mut out);
        out
    }

    fn collect_pointers<'a>(&'a self, leaf: &mut usize, out: &mut Vec<(usize, Referent<'a>)>) {
        match self {
            Constant::Struct(cs) | Constant::Array(cs) => {
                for c in cs {
                    c.collect_pointers(leaf, out);
                }
            }
            _ => {
                if let Some(r) = self.referent() {
                    out.push((*leaf, r));
                }
                *leaf += 1;
            }
        }
    }

    /// The referent of a scalar constant, if it may be a pointer. Integers
    /// and undef refer to nothing; pointer arithmetic keeps the referent.
    pub fn referent(&self) -> Option<Referent<'_>> {
        match self {
            Constant::Function(n) => Some(Referent::Function(n)),
            Constant::Global(n) => Some(Referent::Global(n, 0)),
            Constant::Null => Some(Referent::Null),
            Constant::Int(_) | Constant::Undef => None,
            Constant::BitCast(c) | Constant::PtrToInt(c) => c.referent(),
            Constant::GetElementPtr { pointer, offset } => match pointer.referent()? {
                Referent::Global(n, o) => Some(Referent::Global(n, o + offset)),
                r => Some(r),
            },
            Constant::IntToPtr(c) => match &**c {
                Constant::Int(0) => Some(Referent::Null),
                c => c.referent(),
            },
            Constant::Struct(_) | Constant::Array(_) => None,
            Constant::Other => Some(Referent::Unknown),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn referents() {
        let g = Constant::GetElementPtr {
            pointer: Box::new(Constant::BitCast(Box::new(Constant::Global("g".into())))),
            offset: 8,
        };
        assert_eq!(
            Some(Referent::Global(&GlobalName::from("g"), 8)),
            g.referent()
        );
        assert_eq!(None, Constant::Int(3).referent());
        assert_eq!(None, Constant::IntToPtr(Box::new(Constant::Int(3))).referent());
        assert_eq!(Some(Referent::Unknown), Constant::Other.referent());
    }

    #[test]
    fn aggregate_pointers() {
        let table = Constant::Array(vec![
            Constant::Function("foo".into()),
            Constant::Null,
            Constant::Int(7),
            Constant::Function("bar".into()),
        ]);
        let ps = table.pointers();
        assert_eq!(3, ps.len());
        assert_eq!(0, ps[0].0);
        assert_eq!(Referent::Null, ps[1].1);
        assert_eq!(3, ps[2].0);
    }

    #[test]
    fn deserialize() {
        let op: Operand = serde_json::from_str(r#"{"constant": {"global": "x"}}"#).unwrap();
        assert_eq!(Operand::Constant(Constant::Global("x".into())), op);
        let op: Operand = serde_json::from_str(r#"{"local": "p"}"#).unwrap();
        assert_eq!(Operand::local("p"), op);
        let c: Constant = serde_json::from_str(r#""null""#).unwrap();
        assert_eq!(Constant::Null, c);
    }
}

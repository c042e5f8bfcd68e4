// SPDX-License-Identifier: BSD-3-Clause
use super::layout::Layout;
use super::name::{FunctionName, LocalName};
use super::operand::Operand;

#[derive(Clone, Debug, Hash, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
pub struct Alloca {
    /// `None` when the allocated type is unknown or unsized; such slots are
    /// field-insensitive.
    #[serde(default)]
    pub layout: Option<Layout>,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
pub struct Load {
    pub pointer: Operand,
    /// In bytes. Loads of aggregates read every cell in range.
    #[serde(default)]
    pub width: Option<u64>,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
pub struct Store {
    pub pointer: Operand,
    pub value: Operand,
    /// In bytes
    #[serde(default)]
    pub width: Option<u64>,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
pub struct GetElementPtr {
    pub pointer: Operand,
    /// Constant part of the offset, in bytes
    #[serde(default)]
    pub offset: i64,
    /// Byte strides of the non-constant indices
    #[serde(default)]
    pub strides: Vec<u64>,
    /// The non-constant indices themselves
    #[serde(default)]
    pub indices: Vec<Operand>,
}

/// Bitcast, pointer-to-integer, integer-to-pointer, truncation, extension
/// and friends.
#[derive(Clone, Debug, Hash, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
pub struct Cast {
    pub value: Operand,
}

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    And,
    Or,
    Xor,
    Shl,
    Shr,
    Div,
    Rem,
    #[serde(other)]
    Other,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
pub struct Binary {
    pub op: BinOp,
    pub lhs: Operand,
    pub rhs: Operand,
}

impl Binary {
    /// Operands whose pointers survive the operation, each with the byte
    /// offset the operation moves it by, if that is a known constant. The
    /// difference of two pointers is an integer, but a pointer minus an
    /// integer is still a pointer into the same object.
    pub(crate) fn pointer_operands(&self) -> Vec<(&Operand, Option<i64>)> {
        let (l, r) = (self.lhs.constant_int(), self.rhs.constant_int());
        match self.op {
            BinOp::Add => vec![(&self.lhs, r), (&self.rhs, l)],
            BinOp::Sub => vec![(&self.lhs, r.and_then(i64::checked_neg))],
            _ => vec![(&self.lhs, None), (&self.rhs, None)],
        }
    }
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
pub struct Compare {
    pub lhs: Operand,
    pub rhs: Operand,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
pub struct Phi {
    pub incoming: Vec<Operand>,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
pub struct Select {
    pub condition: Operand,
    pub true_value: Operand,
    pub false_value: Operand,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
pub struct ExtractValue {
    pub aggregate: Operand,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
pub struct InsertValue {
    pub aggregate: Operand,
    pub value: Operand,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Callee {
    Direct(FunctionName),
    Indirect(Operand),
    Asm,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
pub struct Call {
    pub callee: Callee,
    #[serde(default)]
    pub args: Vec<Operand>,
    /// `invoke` rather than `call`: may unwind to a landing pad.
    #[serde(default)]
    pub invoke: bool,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
pub struct Ret {
    #[serde(default)]
    pub value: Option<Operand>,
}

#[derive(Clone, Debug, Default, Hash, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
pub struct LandingPad {}

#[derive(Clone, Debug, Hash, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
pub struct VaStart {
    pub list: Operand,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
pub struct VaArg {
    pub list: Operand,
    /// Position among the variadic arguments, when the front end knows it.
    #[serde(default)]
    pub index: Option<usize>,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
pub struct VaCopy {
    pub dst: Operand,
    pub src: Operand,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
pub struct Other {
    pub mnemonic: String,
    #[serde(default)]
    pub operands: Vec<Operand>,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Opcode {
    Alloca(Alloca),
    Binary(Binary),
    Call(Call),
    Cast(Cast),
    Compare(Compare),
    ExtractValue(ExtractValue),
    GetElementPtr(GetElementPtr),
    InsertValue(InsertValue),
    LandingPad(LandingPad),
    Load(Load),
    Phi(Phi),
    Ret(Ret),
    Select(Select),
    Store(Store),
    VaArg(VaArg),
    VaCopy(VaCopy),
    VaStart(VaStart),
    //
    Other(Other),
}

impl Opcode {
    pub(crate) fn operands(&self) -> Vec<&Operand> {
        match self {
            Opcode::Alloca(_) | Opcode::LandingPad(_) => vec![],
            Opcode::Binary(b) => vec![&b.lhs, &b.rhs],
            Opcode::Call(c) => {
                let mut ops = match &c.callee {
                    Callee::Indirect(op) => vec![op],
                    Callee::Direct(_) | Callee::Asm => vec![],
                };
                ops.extend(c.args.iter());
                ops
            }
            Opcode::Cast(c) => vec![&c.value],
            Opcode::Compare(c) => vec![&c.lhs, &c.rhs],
            Opcode::ExtractValue(e) => vec![&e.aggregate],
            Opcode::GetElementPtr(g) => {
                let mut ops = vec![&g.pointer];
                ops.extend(g.indices.iter());
                ops
            }
            Opcode::InsertValue(i) => vec![&i.aggregate, &i.value],
            Opcode::Load(l) => vec![&l.pointer],
            Opcode::Phi(p) => p.incoming.iter().collect(),
            Opcode::Ret(r) => r.value.iter().collect(),
            Opcode::Select(s) => vec![&s.condition, &s.true_value, &s.false_value],
            Opcode::Store(s) => vec![&s.pointer, &s.value],
            Opcode::VaArg(v) => vec![&v.list],
            Opcode::VaCopy(v) => vec![&v.dst, &v.src],
            Opcode::VaStart(v) => vec![&v.list],
            Opcode::Other(o) => o.operands.iter().collect(),
        }
    }
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
pub struct Instruction {
    #[serde(default)]
    pub result: Option<LocalName>,
    /// The result has pointer type.
    #[serde(default)]
    pub pointer: bool,
    pub opcode: Opcode,
}

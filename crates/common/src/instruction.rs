//! Decoded instructions: an opcode with its inline operand, or a
//! pseudo-instruction marking a label or an exception-handling region.

use std::fmt;
use std::sync::Arc;

use crate::constant::MemberToken;
use crate::opcode::{Opcode, OperandKind};
use crate::types::{FieldId, MethodId, TypeId};

/// Branch target inside one method body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LabelId(pub u32);

impl fmt::Display for LabelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "L{}", self.0)
    }
}

/// Inline operand of an instruction.
#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    None,
    Int32(i32),
    Int64(i64),
    Float32(f32),
    Float64(f64),
    String(Arc<str>),
    Label(LabelId),
    Labels(Vec<LabelId>),
    Index(u16),
    Type(TypeId),
    Field(FieldId),
    Method(MethodId),
    Token(MemberToken),
}

impl Operand {
    pub fn kind(&self) -> OperandKind {
        match self {
            Operand::None => OperandKind::None,
            Operand::Int32(_) => OperandKind::Int32,
            Operand::Int64(_) => OperandKind::Int64,
            Operand::Float32(_) => OperandKind::Float32,
            Operand::Float64(_) => OperandKind::Float64,
            Operand::String(_) => OperandKind::String,
            Operand::Label(_) => OperandKind::Label,
            Operand::Labels(_) => OperandKind::Labels,
            Operand::Index(_) => OperandKind::Index,
            Operand::Type(_) => OperandKind::Type,
            Operand::Field(_) => OperandKind::Field,
            Operand::Method(_) => OperandKind::Method,
            Operand::Token(_) => OperandKind::Token,
        }
    }
}

/// Protected-region boundaries. The interpreter treats try and finally
/// bodies as straight-line code and skips catch/fault handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Region {
    TryStart,
    TryEnd,
    /// Start of a catch handler; `None` catches everything.
    CatchStart(Option<TypeId>),
    CatchEnd,
    FinallyStart,
    FinallyEnd,
    FaultStart,
    FaultEnd,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Instruction {
    Op { opcode: Opcode, operand: Operand },
    Label(LabelId),
    Region(Region),
}

impl Instruction {
    /// An instruction without an inline operand.
    pub fn op(opcode: Opcode) -> Self {
        Instruction::Op {
            opcode,
            operand: Operand::None,
        }
    }

    pub fn with(opcode: Opcode, operand: Operand) -> Self {
        Instruction::Op { opcode, operand }
    }

    pub fn opcode(&self) -> Option<Opcode> {
        match self {
            Instruction::Op { opcode, .. } => Some(*opcode),
            _ => None,
        }
    }

    /// Labels this instruction may transfer control to.
    pub fn targets(&self) -> Vec<LabelId> {
        match self {
            Instruction::Op {
                operand: Operand::Label(l),
                ..
            } => vec![*l],
            Instruction::Op {
                operand: Operand::Labels(ls),
                ..
            } => ls.clone(),
            _ => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operand_kind_matches_variant() {
        assert_eq!(Operand::Int32(3).kind(), OperandKind::Int32);
        assert_eq!(Operand::Labels(vec![]).kind(), OperandKind::Labels);
        assert_eq!(Operand::Index(1).kind(), OperandKind::Index);
    }

    #[test]
    fn branch_targets() {
        let br = Instruction::with(Opcode::Br, Operand::Label(LabelId(4)));
        assert_eq!(br.targets(), vec![LabelId(4)]);
        let sw = Instruction::with(Opcode::Switch, Operand::Labels(vec![LabelId(1), LabelId(2)]));
        assert_eq!(sw.targets(), vec![LabelId(1), LabelId(2)]);
        assert!(Instruction::op(Opcode::Add).targets().is_empty());
        assert!(Instruction::Label(LabelId(0)).targets().is_empty());
    }

    #[test]
    fn pseudo_instructions_have_no_opcode() {
        assert_eq!(Instruction::Label(LabelId(0)).opcode(), None);
        assert_eq!(Instruction::Region(Region::TryStart).opcode(), None);
        assert_eq!(Instruction::op(Opcode::Ret).opcode(), Some(Opcode::Ret));
    }
}

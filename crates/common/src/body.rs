//! Method bodies: typed locals plus a linear instruction stream.

use rustc_hash::FxHashMap;

use crate::error::MetadataError;
use crate::instruction::{Instruction, LabelId, Operand, Region};
use crate::opcode::Opcode;
use crate::types::TypeId;

/// A decoded method body.
#[derive(Debug, Clone, PartialEq)]
pub struct MethodBody {
    /// Declared local variable types, indexed by `ldloc`/`stloc` slot.
    pub locals: Vec<TypeId>,
    pub instructions: Vec<Instruction>,
    /// Source names for labels, used only when rendering.
    pub label_names: FxHashMap<LabelId, String>,
}

impl MethodBody {
    /// Number of instructions, pseudo-instructions included.
    pub fn len(&self) -> usize {
        self.instructions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }

    /// Maps every label to the index of its marker instruction.
    pub fn label_positions(&self) -> FxHashMap<LabelId, usize> {
        self.instructions
            .iter()
            .enumerate()
            .filter_map(|(i, instr)| match instr {
                Instruction::Label(l) => Some((*l, i)),
                _ => None,
            })
            .collect()
    }

    pub fn label_name(&self, label: LabelId) -> String {
        self.label_names
            .get(&label)
            .cloned()
            .unwrap_or_else(|| label.to_string())
    }

    /// Checks that operands agree with their opcodes, that every branch
    /// target is marked exactly once and that local slots exist.
    pub fn validate(&self) -> Result<(), MetadataError> {
        let mut marked = FxHashMap::default();
        for (i, instr) in self.instructions.iter().enumerate() {
            if let Instruction::Label(l) = instr {
                if marked.insert(*l, i).is_some() {
                    return Err(MetadataError::DuplicateLabel(self.label_name(*l)));
                }
            }
        }
        for (i, instr) in self.instructions.iter().enumerate() {
            let Instruction::Op { opcode, operand } = instr else {
                continue;
            };
            if operand.kind() != opcode.operand_kind() {
                return Err(MetadataError::OperandMismatch {
                    at: i,
                    opcode: opcode.mnemonic(),
                    expected: opcode.operand_kind(),
                    found: operand.kind(),
                });
            }
            for target in instr.targets() {
                if !marked.contains_key(&target) {
                    return Err(MetadataError::UndefinedLabel(self.label_name(target)));
                }
            }
            if let (Opcode::Ldloc | Opcode::Ldloca | Opcode::Stloc, Operand::Index(n)) =
                (opcode, operand)
            {
                if *n as usize >= self.locals.len() {
                    return Err(MetadataError::LocalOutOfRange {
                        at: i,
                        index: *n,
                        count: self.locals.len(),
                    });
                }
            }
        }
        Ok(())
    }
}

/// Incremental construction of a [`MethodBody`].
#[derive(Debug, Default)]
pub struct BodyBuilder {
    locals: Vec<TypeId>,
    instructions: Vec<Instruction>,
    label_names: FxHashMap<LabelId, String>,
    by_name: FxHashMap<String, LabelId>,
    next_label: u32,
}

impl BodyBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declares a local and returns its slot.
    pub fn local(&mut self, ty: TypeId) -> u16 {
        self.locals.push(ty);
        (self.locals.len() - 1) as u16
    }

    /// Allocates an anonymous label.
    pub fn label(&mut self) -> LabelId {
        let l = LabelId(self.next_label);
        self.next_label += 1;
        l
    }

    /// Returns the label with this source name, allocating it on first use.
    pub fn named_label(&mut self, name: &str) -> LabelId {
        if let Some(l) = self.by_name.get(name) {
            return *l;
        }
        let l = self.label();
        self.by_name.insert(name.to_string(), l);
        self.label_names.insert(l, name.to_string());
        l
    }

    /// Places `label` at the current position.
    pub fn mark(&mut self, label: LabelId) -> &mut Self {
        self.instructions.push(Instruction::Label(label));
        self
    }

    pub fn op(&mut self, opcode: Opcode) -> &mut Self {
        self.instructions.push(Instruction::op(opcode));
        self
    }

    pub fn emit(&mut self, opcode: Opcode, operand: Operand) -> &mut Self {
        self.instructions.push(Instruction::with(opcode, operand));
        self
    }

    pub fn region(&mut self, region: Region) -> &mut Self {
        self.instructions.push(Instruction::Region(region));
        self
    }

    pub fn build(self) -> Result<MethodBody, MetadataError> {
        let body = MethodBody {
            locals: self.locals,
            instructions: self.instructions,
            label_names: self.label_names,
        };
        body.validate()?;
        Ok(body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_branching_body() {
        let mut b = BodyBuilder::new();
        let tmp = b.local(TypeId::I32);
        let end = b.named_label("END");
        b.emit(Opcode::Ldarg, Operand::Index(0))
            .emit(Opcode::Stloc, Operand::Index(tmp))
            .emit(Opcode::Br, Operand::Label(end))
            .mark(end)
            .emit(Opcode::Ldloc, Operand::Index(tmp))
            .op(Opcode::Ret);
        let body = b.build().unwrap();
        assert_eq!(body.len(), 6);
        assert_eq!(body.label_positions()[&end], 3);
        assert_eq!(body.label_name(end), "END");
    }

    #[test]
    fn rejects_undefined_label() {
        let mut b = BodyBuilder::new();
        let l = b.named_label("NOWHERE");
        b.emit(Opcode::Br, Operand::Label(l));
        assert_eq!(
            b.build(),
            Err(MetadataError::UndefinedLabel("NOWHERE".to_string()))
        );
    }

    #[test]
    fn rejects_duplicate_label() {
        let mut b = BodyBuilder::new();
        let l = b.named_label("TWICE");
        b.mark(l).mark(l).op(Opcode::Ret);
        assert_eq!(
            b.build(),
            Err(MetadataError::DuplicateLabel("TWICE".to_string()))
        );
    }

    #[test]
    fn rejects_operand_mismatch() {
        let mut b = BodyBuilder::new();
        b.emit(Opcode::Add, Operand::Int32(1));
        assert!(matches!(
            b.build(),
            Err(MetadataError::OperandMismatch { at: 0, .. })
        ));
    }

    #[test]
    fn rejects_missing_local() {
        let mut b = BodyBuilder::new();
        b.emit(Opcode::Ldloc, Operand::Index(2)).op(Opcode::Ret);
        assert!(matches!(
            b.build(),
            Err(MetadataError::LocalOutOfRange { index: 2, count: 0, .. })
        ));
    }
}

//! Errors raised while building metadata and method bodies.

use thiserror::Error;

use crate::opcode::OperandKind;

/// Errors that occur while assembling the metadata model.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum MetadataError {
    #[error("duplicate type: {0}")]
    DuplicateType(String),

    #[error("unknown type: {0}")]
    UnknownType(String),

    #[error("unknown member: {0}")]
    UnknownMember(String),

    #[error("ambiguous member: {0}")]
    AmbiguousMember(String),

    #[error("type {name} expects {expected} generic arguments, got {found}")]
    GenericArity {
        name: String,
        expected: usize,
        found: usize,
    },

    #[error("instruction {at}: {opcode} expects a {expected:?} operand, found {found:?}")]
    OperandMismatch {
        at: usize,
        opcode: &'static str,
        expected: OperandKind,
        found: OperandKind,
    },

    #[error("undefined label: {0}")]
    UndefinedLabel(String),

    #[error("label defined twice: {0}")]
    DuplicateLabel(String),

    #[error("instruction {at}: local {index} out of range ({count} declared)")]
    LocalOutOfRange { at: usize, index: u16, count: usize },
}

/// Failure of a host-evaluated pure method on constant arguments.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct HostError(pub String);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_generic_arity() {
        let e = MetadataError::GenericArity {
            name: "Dictionary".to_string(),
            expected: 2,
            found: 1,
        };
        assert_eq!(
            e.to_string(),
            "type Dictionary expects 2 generic arguments, got 1"
        );
    }

    #[test]
    fn display_operand_mismatch() {
        let e = MetadataError::OperandMismatch {
            at: 3,
            opcode: "add",
            expected: OperandKind::None,
            found: OperandKind::Int32,
        };
        assert_eq!(
            e.to_string(),
            "instruction 3: add expects a None operand, found Int32"
        );
    }

    #[test]
    fn display_host_error() {
        assert_eq!(HostError("bad".to_string()).to_string(), "bad");
    }
}

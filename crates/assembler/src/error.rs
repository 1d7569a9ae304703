//! Error types for the symil assembler.

use symil_common::{MetadataError, OperandKind};
use thiserror::Error;

/// Errors produced while assembling text into metadata.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AsmError {
    /// An unrecognized opcode mnemonic was encountered.
    #[error("line {line}: unknown opcode '{token}'")]
    UnknownOpcode { line: usize, token: String },

    #[error("line {line}: unknown directive '{token}'")]
    UnknownDirective { line: usize, token: String },

    /// A type name that is neither built in nor declared.
    #[error("line {line}: unknown type '{name}'")]
    UnknownType { line: usize, name: String },

    /// A field, method, parameter or local that cannot be found.
    #[error("line {line}: unknown member '{name}'")]
    UnknownMember { line: usize, name: String },

    /// An opcode did not have its operand.
    #[error("line {line}: {opcode} expects a {expected:?} operand")]
    MissingOperand {
        line: usize,
        opcode: &'static str,
        expected: OperandKind,
    },

    /// A numeric literal could not be parsed or is out of range.
    #[error("line {line}: invalid number '{token}'")]
    InvalidNumber { line: usize, token: String },

    #[error("line {line}: unterminated string literal")]
    UnterminatedString { line: usize },

    /// A token appeared where it was not expected.
    #[error("line {line}: unexpected token '{token}'")]
    UnexpectedToken { line: usize, token: String },

    /// A declaration or body that is never closed with `.end`.
    #[error("line {line}: {what} is not closed")]
    Unclosed { line: usize, what: &'static str },

    /// The metadata model rejected a declaration or body.
    #[error("line {line}: {source}")]
    Metadata {
        line: usize,
        #[source]
        source: MetadataError,
    },
}

impl AsmError {
    pub fn line(&self) -> usize {
        match self {
            AsmError::UnknownOpcode { line, .. }
            | AsmError::UnknownDirective { line, .. }
            | AsmError::UnknownType { line, .. }
            | AsmError::UnknownMember { line, .. }
            | AsmError::MissingOperand { line, .. }
            | AsmError::InvalidNumber { line, .. }
            | AsmError::UnterminatedString { line }
            | AsmError::UnexpectedToken { line, .. }
            | AsmError::Unclosed { line, .. }
            | AsmError::Metadata { line, .. } => *line,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_unknown_opcode() {
        let e = AsmError::UnknownOpcode {
            line: 3,
            token: "foo".to_string(),
        };
        assert_eq!(e.to_string(), "line 3: unknown opcode 'foo'");
    }

    #[test]
    fn error_display_missing_operand() {
        let e = AsmError::MissingOperand {
            line: 7,
            opcode: "ldarg",
            expected: OperandKind::Index,
        };
        assert_eq!(e.to_string(), "line 7: ldarg expects a Index operand");
    }

    #[test]
    fn error_display_unclosed() {
        let e = AsmError::Unclosed {
            line: 4,
            what: "method body",
        };
        assert_eq!(e.to_string(), "line 4: method body is not closed");
        assert_eq!(e.line(), 4);
    }

    #[test]
    fn error_display_metadata() {
        let e = AsmError::Metadata {
            line: 9,
            source: MetadataError::DuplicateType("Point".to_string()),
        };
        assert_eq!(e.to_string(), "line 9: duplicate type: Point");
    }
}

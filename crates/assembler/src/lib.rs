//! symil assembler: text ↔ metadata.
//!
//! The text format declares types with their fields and methods, and
//! method bodies as one instruction per line. Short and macro forms of
//! opcodes (`ldarg.0`, `br.s`, `ldc.i4.m1`, `ldind.i4`) are accepted and
//! folded into the canonical instruction set.
//!
//! # Usage
//!
//! ```
//! use symil_assembler::{assemble, disassemble, lookup_method};
//!
//! let text = "\
//! .class M
//!   .method static i32 Abs(i32 x)
//!     ldarg x
//!     ldc.i4.0
//!     bge done
//!     ldarg.0
//!     neg
//!     ret
//!   done:
//!     ldarg.0
//!     ret
//!   .end
//! .end
//! ";
//! let meta = assemble(text).unwrap();
//! assert!(lookup_method(&meta, "M::Abs").is_some());
//! assert!(disassemble(&meta).starts_with(".class M\n"));
//! ```
//!
//! # Roundtrip Guarantee
//!
//! The disassembler outputs canonical text, and canonical text is a fixed
//! point: `disassemble(&assemble(&disassemble(m))?) == disassemble(m)`.
//! Parameter and local names used as operands are printed as slot numbers.

pub mod error;

mod builder;
mod disassembler;
mod lexer;
mod parser;

pub use error::AsmError;

use symil_common::{Metadata, MethodBody, MethodId};

use lexer::tokenize_line;
use parser::{parse_module, Line};

/// Assemble text into metadata, with the core library installed.
///
/// Returns the first error encountered.
pub fn assemble(text: &str) -> Result<Metadata, AsmError> {
    let mut lines = Vec::new();
    let mut last = 0;
    for (idx, line) in text.lines().enumerate() {
        last = idx + 1;
        let tokens = tokenize_line(line, last)?;
        if !tokens.is_empty() {
            lines.push(Line { num: last, tokens });
        }
    }
    let decls = parse_module(&lines)?;
    builder::build(&decls, last)
}

/// Disassemble every user-declared type into canonical assembly text.
pub fn disassemble(meta: &Metadata) -> String {
    disassembler::disassemble(meta)
}

/// Canonical text of a single method body.
pub fn disassemble_body(meta: &Metadata, body: &MethodBody) -> String {
    let mut out = String::new();
    disassembler::method_body(meta, body, &mut out);
    out
}

/// Finds a method by its `Type::Name` path. Overloads resolve to `None`.
pub fn lookup_method(meta: &Metadata, path: &str) -> Option<MethodId> {
    let (owner, name) = path.rsplit_once("::")?;
    let ty = meta.type_by_name(owner)?;
    meta.find_method(ty, name, None).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use symil_common::{Instruction, MethodImpl, Opcode, Operand, TypeId};

    const POINT: &str = "\
.struct Point
  .field i32 x
  .field i32 y
  .method void .ctor(i32 x, i32 y)
    ldarg.0
    ldarg x
    stfld Point::x
    ldarg.0
    ldarg.2
    stfld Point::y
    ret
  .end
.end
";

    fn body(meta: &Metadata, path: &str) -> std::sync::Arc<MethodBody> {
        let m = lookup_method(meta, path).unwrap();
        match &meta.method(m).implementation {
            MethodImpl::Il(body) => body.clone(),
            other => panic!("expected IL body, got {other:?}"),
        }
    }

    #[test]
    fn assemble_struct_with_constructor() {
        let meta = assemble(POINT).unwrap();
        let point = meta.type_by_name("Point").unwrap();
        assert!(meta.is_value_type(point));
        assert_eq!(meta.instance_fields(point).len(), 2);
        let ctor = body(&meta, "Point::.ctor");
        assert_eq!(
            ctor.instructions[1],
            Instruction::with(Opcode::Ldarg, Operand::Index(1))
        );
        assert_eq!(
            ctor.instructions[2],
            Instruction::with(
                Opcode::Stfld,
                Operand::Field(meta.find_field(point, "x").unwrap())
            )
        );
    }

    #[test]
    fn canonical_text_is_a_fixed_point() {
        let first = disassemble(&assemble(POINT).unwrap());
        let second = disassemble(&assemble(&first).unwrap());
        assert_eq!(first, second);
        assert!(first.contains("    ldarg 1\n"));
    }

    #[test]
    fn comments_and_blank_lines() {
        let text = "\
; a comment

.class C ; trailing
  .method static void M()   // another
    ret
  .end
.end
";
        let meta = assemble(text).unwrap();
        assert_eq!(body(&meta, "C::M").instructions.len(), 1);
    }

    #[test]
    fn newarr_declares_the_array_type() {
        let meta = assemble(
            ".class C\n.method static object M()\nldc.i4.3\nnewarr string\nret\n.end\n.end\n",
        )
        .unwrap();
        assert!(meta.array_of(TypeId::STRING).is_some());
    }

    #[test]
    fn error_unknown_opcode() {
        let err = assemble(".class C\n.method static void M()\nfrobnicate\n.end\n.end\n").unwrap_err();
        assert!(matches!(err, AsmError::UnknownOpcode { line: 3, .. }));
    }

    #[test]
    fn error_missing_operand() {
        let err = assemble(".class C\n.method static void M()\nldarg\n.end\n.end\n").unwrap_err();
        assert!(matches!(err, AsmError::MissingOperand { line: 3, .. }));
    }

    #[test]
    fn error_undefined_label() {
        let err = assemble(".class C\n.method static void M()\nbr nowhere\n.end\n.end\n").unwrap_err();
        assert!(matches!(err, AsmError::Metadata { line: 2, .. }));
    }

    #[test]
    fn lookup_method_paths() {
        let meta = assemble(POINT).unwrap();
        assert!(lookup_method(&meta, "Point::.ctor").is_some());
        assert!(lookup_method(&meta, "Point::Nope").is_none());
        assert!(lookup_method(&meta, "Nope").is_none());
    }
}

//! Integration tests for the symil assembler.
//!
//! Tests cover:
//! - Declarations: classes, structs, interfaces, enums, delegates, literals
//! - Name resolution: generic instantiations, arrays, overloads, tokens
//! - Control flow: labels, switch tables, protected regions
//! - Roundtrip: canonical text is a fixed point of assemble → disassemble
//! - Error cases with line numbers

use pretty_assertions::assert_eq;
use symil_assembler::{assemble, disassemble, disassemble_body, lookup_method, AsmError};
use symil_common::{
    Constant, Instruction, MemberToken, Metadata, MethodBody, MethodImpl, Opcode, Operand, Region,
    TypeId, TypeKind,
};

fn body(meta: &Metadata, path: &str) -> MethodBody {
    let m = lookup_method(meta, path).unwrap_or_else(|| panic!("no method {path}"));
    match &meta.method(m).implementation {
        MethodImpl::Il(body) => (**body).clone(),
        other => panic!("{path}: expected IL body, got {other:?}"),
    }
}

fn ops(body: &MethodBody) -> Vec<Opcode> {
    body.instructions.iter().filter_map(Instruction::opcode).collect()
}

fn assert_fixed_point(text: &str) {
    let first = disassemble(&assemble(text).unwrap());
    let second = disassemble(&assemble(&first).unwrap());
    assert_eq!(first, second);
}

// ---- Sample programs ----

const SHAPES: &str = "\
.interface IShape
  .method i32 Area()
  .end
.end

.class Shape abstract implements IShape
  .field i32 sides
  .method virtual abstract i32 Area()
  .end
  .method i32 Sides()
    ldarg.0
    ldfld Shape::sides
    ret
  .end
.end

.class Square extends Shape sealed
  .field i32 side
  .method override i32 Area()
    ldarg.0
    ldfld Square::side
    dup
    mul
    ret
  .end
.end
";

const LOOKUP: &str = "\
.enum Color u8
  .field static literal Color Red = 0
  .field static literal Color Green = 1
.end

.delegate i32 Transform(i32 x)

.class Lookup
  .field static literal string Greeting = \"hi \\\"there\\\"\"
  .field static literal f64 Ratio = 0.5
  .method static string Get(Dictionary<string,string> d, string key)
    .locals (string value)
    ldarg d
    ldarg key
    ldloca value
    callvirt IDictionary<string,string>::TryGetValue(string, string&)
    brfalse.s missing
    ldloc value
    ret
  missing:
    ldstr \"none\"
    ret
  .end
  .method static i32 Pick(i32 i)
    ldarg.0
    switch (zero, one)
    ldc.i4.m1
    ret
  zero:
    ldc.i4.s 10
    ret
  one:
    ldc.i4 0x14
    ret
  .end
  .method static object Handle()
    ldtoken type Color
    ret
  .end
.end
";

#[test]
fn shapes_declarations() {
    let meta = assemble(SHAPES).unwrap();
    let iface = meta.type_by_name("IShape").unwrap();
    let shape = meta.type_by_name("Shape").unwrap();
    let square = meta.type_by_name("Square").unwrap();

    assert!(meta.is_interface(iface));
    assert!(meta.ty(shape).is_abstract);
    assert!(meta.is_sealed(square));
    assert_eq!(meta.ty(square).base, Some(shape));
    assert!(meta.is_assignable(square, iface));

    let base_area = lookup_method(&meta, "Shape::Area").unwrap();
    let square_area = lookup_method(&meta, "Square::Area").unwrap();
    assert_eq!(meta.method(square_area).overrides, Some(base_area));
    assert_eq!(meta.resolve_virtual(base_area, square), Some(square_area));
    assert!(matches!(meta.method(base_area).implementation, MethodImpl::Abstract));

    assert_eq!(
        ops(&body(&meta, "Square::Area")),
        vec![Opcode::Ldarg, Opcode::Ldfld, Opcode::Dup, Opcode::Mul, Opcode::Ret]
    );
}

#[test]
fn lookup_declarations() {
    let meta = assemble(LOOKUP).unwrap();
    let color = meta.type_by_name("Color").unwrap();
    assert_eq!(meta.ty(color).kind, TypeKind::Enum(symil_common::Primitive::U8));
    let green = meta.find_field(color, "Green").unwrap();
    assert_eq!(meta.field(green).literal, Some(Constant::U8(1)));

    let lookup = meta.type_by_name("Lookup").unwrap();
    let greeting = meta.find_field(lookup, "Greeting").unwrap();
    assert_eq!(meta.field(greeting).literal, Some(Constant::str("hi \"there\"")));
    let ratio = meta.find_field(lookup, "Ratio").unwrap();
    assert_eq!(meta.field(ratio).literal, Some(Constant::F64(0.5)));

    let transform = meta.type_by_name("Transform").unwrap();
    assert!(meta.is_delegate(transform));
    let invoke = meta.delegate_invoke(transform).unwrap();
    assert_eq!(meta.method(invoke).ret, TypeId::I32);
}

#[test]
fn generic_members_and_by_ref_overloads() {
    let meta = assemble(LOOKUP).unwrap();
    let get = body(&meta, "Lookup::Get");
    assert_eq!(get.locals, vec![TypeId::STRING]);
    let Instruction::Op {
        operand: Operand::Method(m),
        ..
    } = &get.instructions[3]
    else {
        panic!("expected a method operand");
    };
    assert_eq!(
        meta.method_name(*m),
        "IDictionary<string,string>::TryGetValue"
    );
    assert_eq!(meta.method(*m).params[1].ty, TypeId::STRING.by_ref());
}

#[test]
fn switch_and_short_constants() {
    let meta = assemble(LOOKUP).unwrap();
    let pick = body(&meta, "Lookup::Pick");
    let Instruction::Op {
        opcode: Opcode::Switch,
        operand: Operand::Labels(labels),
    } = &pick.instructions[1]
    else {
        panic!("expected switch");
    };
    assert_eq!(labels.len(), 2);
    assert_eq!(pick.label_name(labels[0]), "zero");
    assert!(pick
        .instructions
        .contains(&Instruction::with(Opcode::LdcI4, Operand::Int32(-1))));
    assert!(pick
        .instructions
        .contains(&Instruction::with(Opcode::LdcI4, Operand::Int32(20))));
}

#[test]
fn tokens_resolve() {
    let meta = assemble(LOOKUP).unwrap();
    let color = meta.type_by_name("Color").unwrap();
    assert_eq!(
        body(&meta, "Lookup::Handle").instructions[0],
        Instruction::with(Opcode::Ldtoken, Operand::Token(MemberToken::Type(color)))
    );
}

#[test]
fn protected_regions() {
    let text = "\
.class C
  .method static i32 M(i32 x)
    .locals (i32 r)
    .try
      ldarg x
      stloc r
      leave done
    .endtry
    .finally
      endfinally
    .endfinally
    .catch Exception
      pop
      leave done
    .endcatch
  done:
    ldloc r
    ret
  .end
.end
";
    let meta = assemble(text).unwrap();
    let m = body(&meta, "C::M");
    let exception = meta.type_by_name("Exception").unwrap();
    assert_eq!(m.instructions[0], Instruction::Region(Region::TryStart));
    assert!(m
        .instructions
        .contains(&Instruction::Region(Region::CatchStart(Some(exception)))));
    assert_fixed_point(text);
}

#[test]
fn roundtrip_fixed_points() {
    assert_fixed_point(SHAPES);
    assert_fixed_point(LOOKUP);
}

#[test]
fn canonical_shapes_text() {
    let text = disassemble(&assemble(SHAPES).unwrap());
    assert!(text.starts_with(".interface IShape\n  .method i32 Area()\n  .end\n.end\n"));
    assert!(text.contains(".class Shape implements IShape abstract\n"));
    assert!(text.contains(".class Square extends Shape sealed\n"));
    assert!(text.contains("  .method override i32 Area()\n    ldarg 0\n"));
}

#[test]
fn body_rendering() {
    let meta = assemble(LOOKUP).unwrap();
    let text = disassemble_body(&meta, &body(&meta, "Lookup::Pick"));
    assert_eq!(
        text,
        "    ldarg 0\n    switch (zero, one)\n    ldc.i4 -1\n    ret\n  zero:\n    ldc.i4 10\n    ret\n  one:\n    ldc.i4 20\n    ret\n"
    );
}

// ---- Errors ----

#[test]
fn error_unknown_type() {
    let err = assemble(".class C\n  .field Nope x\n.end\n").unwrap_err();
    assert_eq!(
        err,
        AsmError::UnknownType {
            line: 2,
            name: "Nope".to_string()
        }
    );
}

#[test]
fn error_unknown_member() {
    let err = assemble(".class C\n.method static void M()\nldsfld C::missing\nret\n.end\n.end\n").unwrap_err();
    assert!(matches!(err, AsmError::UnknownMember { line: 3, .. }));
}

#[test]
fn error_unknown_local_name() {
    let err = assemble(".class C\n.method static void M()\nldloc tmp\nret\n.end\n.end\n").unwrap_err();
    assert!(matches!(err, AsmError::UnknownMember { line: 3, .. }));
}

#[test]
fn error_duplicate_type() {
    let err = assemble(".class C\n.end\n.class C\n.end\n").unwrap_err();
    assert!(matches!(err, AsmError::Metadata { line: 3, .. }));
}

#[test]
fn error_abstract_with_body() {
    let err = assemble(".class C abstract\n.method abstract void M()\nret\n.end\n.end\n").unwrap_err();
    assert!(matches!(err, AsmError::UnexpectedToken { line: 3, .. }));
}

#[test]
fn error_trailing_tokens() {
    let err = assemble(".class C\n.method static void M()\nret 1\n.end\n.end\n").unwrap_err();
    assert!(matches!(err, AsmError::UnexpectedToken { line: 3, .. }));
}

#[test]
fn error_unclosed_type() {
    let err = assemble("\n.class C\n").unwrap_err();
    assert_eq!(
        err,
        AsmError::Unclosed {
            line: 2,
            what: "type declaration"
        }
    );
}

#[test]
fn error_index_out_of_range() {
    let err = assemble(".class C\n.method static void M()\nldarg 70000\n.end\n.end\n").unwrap_err();
    assert!(matches!(err, AsmError::InvalidNumber { line: 3, .. }));
}

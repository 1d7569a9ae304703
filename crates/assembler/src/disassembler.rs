//! Disassembler: metadata → canonical assembly text.
//!
//! Only user-declared types are rendered; the core library, generic
//! instantiations and array types are implied by the names that use them.
//! Members are printed with indentation, operands fully qualified and
//! method references always carry their parameter types.

use std::fmt::Write;

use symil_common::{
    Constant, FieldDef, Instruction, MemberToken, Metadata, MetadataBuilder, MethodBody, MethodDef,
    MethodId, MethodImpl, Operand, Region, TypeId, TypeKind,
};

pub fn disassemble(meta: &Metadata) -> String {
    let first_user = MetadataBuilder::new().metadata().type_count();
    let mut out = String::new();
    for ty in meta.type_ids().skip(first_user) {
        let def = meta.ty(ty);
        if def.generic_definition.is_some() || matches!(def.kind, TypeKind::Array(_) | TypeKind::GenericParam(_)) {
            continue;
        }
        type_decl(meta, ty, &mut out);
    }
    out
}

fn type_decl(meta: &Metadata, ty: TypeId, out: &mut String) {
    let def = meta.ty(ty);
    let header = match def.kind {
        TypeKind::Delegate => {
            if let Some(invoke) = meta.delegate_invoke(ty) {
                let m = meta.method(invoke);
                let _ = writeln!(out, ".delegate {} {}({})", meta.type_name(m.ret), def.name, params(meta, m));
            }
            return;
        }
        TypeKind::Class => ".class",
        TypeKind::Struct => ".struct",
        TypeKind::Interface => ".interface",
        TypeKind::Enum(_) => ".enum",
        _ => return,
    };
    let _ = write!(out, "{header} {}", def.name);
    if let TypeKind::Enum(p) = def.kind {
        let _ = write!(out, " {}", p.name());
    }
    let default_base = match def.kind {
        TypeKind::Class => Some(TypeId::OBJECT),
        TypeKind::Struct => Some(TypeId::VALUE_TYPE),
        TypeKind::Enum(_) => Some(TypeId::ENUM),
        _ => None,
    };
    let interfaces = names(meta, &def.interfaces);
    if def.kind == TypeKind::Interface {
        if !interfaces.is_empty() {
            let _ = write!(out, " extends {interfaces}");
        }
    } else {
        if let Some(base) = def.base.filter(|b| Some(*b) != default_base) {
            let _ = write!(out, " extends {}", meta.type_name(base));
        }
        if !interfaces.is_empty() {
            let _ = write!(out, " implements {interfaces}");
        }
    }
    if def.kind == TypeKind::Class && def.sealed {
        out.push_str(" sealed");
    }
    if def.is_abstract {
        out.push_str(" abstract");
    }
    out.push('\n');

    for &f in &def.fields {
        field_decl(meta, meta.field(f), out);
    }
    for &m in &def.methods {
        method_decl(meta, m, def.kind == TypeKind::Interface, out);
    }
    out.push_str(".end\n");
}

fn names(meta: &Metadata, types: &[TypeId]) -> String {
    types
        .iter()
        .map(|t| meta.type_name(*t))
        .collect::<Vec<_>>()
        .join(", ")
}

fn params(meta: &Metadata, m: &MethodDef) -> String {
    m.params
        .iter()
        .map(|p| format!("{} {}", meta.type_name(p.ty), p.name))
        .collect::<Vec<_>>()
        .join(", ")
}

fn field_decl(meta: &Metadata, f: &FieldDef, out: &mut String) {
    out.push_str("  .field ");
    if f.is_static {
        out.push_str("static ");
    }
    match &f.literal {
        Some(value) => {
            let _ = writeln!(out, "literal {} {} = {}", meta.type_name(f.ty), f.name, literal(value));
        }
        None => {
            let _ = writeln!(out, "{} {}", meta.type_name(f.ty), f.name);
        }
    }
}

fn literal(value: &Constant) -> String {
    match value {
        Constant::Null => "null".to_string(),
        Constant::Bool(b) => b.to_string(),
        Constant::F32(v) => format!("{v:?}"),
        Constant::F64(v) => format!("{v:?}"),
        Constant::Str(s) => quoted(s),
        other => other.as_i64().map(|v| v.to_string()).unwrap_or_else(|| other.to_string()),
    }
}

fn quoted(s: &str) -> String {
    let mut q = String::with_capacity(s.len() + 2);
    q.push('"');
    for c in s.chars() {
        match c {
            '\n' => q.push_str("\\n"),
            '\t' => q.push_str("\\t"),
            '\r' => q.push_str("\\r"),
            '\0' => q.push_str("\\0"),
            '\\' => q.push_str("\\\\"),
            '"' => q.push_str("\\\""),
            c => q.push(c),
        }
    }
    q.push('"');
    q
}

fn method_decl(meta: &Metadata, id: MethodId, in_interface: bool, out: &mut String) {
    let m = meta.method(id);
    out.push_str("  .method ");
    if m.is_static {
        out.push_str("static ");
    }
    if !in_interface {
        if m.is_virtual && m.is_newslot {
            out.push_str("virtual ");
        } else if m.is_virtual {
            out.push_str("override ");
            if let Some(base) = m.overrides.filter(|b| meta.method(*b).name != m.name) {
                let _ = write!(out, "{} ", meta.method_name(base));
            }
        }
        if m.is_final {
            out.push_str("final ");
        }
        match m.implementation {
            MethodImpl::Abstract => out.push_str("abstract "),
            MethodImpl::Native => out.push_str("native "),
            _ => {}
        }
    }
    if m.pure {
        out.push_str("pure ");
    }
    let _ = writeln!(out, "{} {}({})", meta.type_name(m.ret), m.name, params(meta, m));
    if let MethodImpl::Il(body) = &m.implementation {
        method_body(meta, body, out);
    }
    out.push_str("  .end\n");
}

/// Renders locals and instructions, one per line.
pub fn method_body(meta: &Metadata, body: &MethodBody, out: &mut String) {
    if !body.locals.is_empty() {
        let _ = writeln!(out, "    .locals ({})", names(meta, &body.locals));
    }
    for instr in &body.instructions {
        match instr {
            Instruction::Label(l) => {
                let _ = writeln!(out, "  {}:", body.label_name(*l));
            }
            Instruction::Region(r) => {
                let _ = writeln!(out, "    {}", region(meta, r));
            }
            Instruction::Op { opcode, operand } => {
                let text = operand_text(meta, body, operand);
                if text.is_empty() {
                    let _ = writeln!(out, "    {}", opcode.mnemonic());
                } else {
                    let _ = writeln!(out, "    {} {text}", opcode.mnemonic());
                }
            }
        }
    }
}

fn region(meta: &Metadata, r: &Region) -> String {
    match r {
        Region::TryStart => ".try".to_string(),
        Region::TryEnd => ".endtry".to_string(),
        Region::CatchStart(None) => ".catch".to_string(),
        Region::CatchStart(Some(ty)) => format!(".catch {}", meta.type_name(*ty)),
        Region::CatchEnd => ".endcatch".to_string(),
        Region::FinallyStart => ".finally".to_string(),
        Region::FinallyEnd => ".endfinally".to_string(),
        Region::FaultStart => ".fault".to_string(),
        Region::FaultEnd => ".endfault".to_string(),
    }
}

fn method_ref(meta: &Metadata, id: MethodId) -> String {
    let m = meta.method(id);
    let types: Vec<String> = m.params.iter().map(|p| meta.type_name(p.ty)).collect();
    format!("{}({})", meta.method_name(id), types.join(", "))
}

fn operand_text(meta: &Metadata, body: &MethodBody, operand: &Operand) -> String {
    match operand {
        Operand::None => String::new(),
        Operand::Int32(v) => v.to_string(),
        Operand::Int64(v) => v.to_string(),
        Operand::Float32(v) => format!("{v:?}"),
        Operand::Float64(v) => format!("{v:?}"),
        Operand::String(s) => quoted(s),
        Operand::Label(l) => body.label_name(*l),
        Operand::Labels(ls) => {
            let names: Vec<String> = ls.iter().map(|l| body.label_name(*l)).collect();
            format!("({})", names.join(", "))
        }
        Operand::Index(n) => n.to_string(),
        Operand::Type(t) => meta.type_name(*t),
        Operand::Field(f) => meta.field_name(*f),
        Operand::Method(m) => method_ref(meta, *m),
        Operand::Token(MemberToken::Type(t)) => format!("type {}", meta.type_name(*t)),
        Operand::Token(MemberToken::Field(f)) => format!("field {}", meta.field_name(*f)),
        Operand::Token(MemberToken::Method(m)) => format!("method {}", method_ref(meta, *m)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quotes_escapes() {
        assert_eq!(quoted("a\"b\n"), r#""a\"b\n""#);
    }

    #[test]
    fn literal_text() {
        assert_eq!(literal(&Constant::U64(u64::MAX)), "-1");
        assert_eq!(literal(&Constant::F64(1.0)), "1.0");
        assert_eq!(literal(&Constant::Bool(true)), "true");
        assert_eq!(literal(&Constant::Null), "null");
    }

    #[test]
    fn core_library_is_not_rendered() {
        let meta = MetadataBuilder::new().finish().unwrap();
        assert_eq!(disassemble(&meta), "");
    }
}

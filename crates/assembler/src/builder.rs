//! Declarations → metadata.
//!
//! Definitions are installed in passes so that any declaration can refer to
//! any other regardless of source order: types first (delegates last, since
//! their signatures name other types), then bases and interfaces, then
//! fields and method signatures, and finally method bodies.

use std::sync::Arc;

use rustc_hash::FxHashMap;
use symil_common::{
    BodyBuilder, Constant, FieldId, MemberToken, Metadata, MetadataBuilder, MetadataError,
    MethodBody, MethodId, MethodImpl, MethodSig, Opcode, Operand, OperandKind, Param, Region,
    TypeId, TypeKind,
};

use crate::error::AsmError;
use crate::lexer::Token;
use crate::parser::{DeclKind, Line, MethodDecl, Tokens, TypeDecl};

pub(crate) fn build(decls: &[TypeDecl], last_line: usize) -> Result<Metadata, AsmError> {
    let mut b = MetadataBuilder::new();
    let mut ids = vec![TypeId::VOID; decls.len()];

    for (slot, d) in ids.iter_mut().zip(decls) {
        let kind = match d.kind {
            DeclKind::Class => TypeKind::Class,
            DeclKind::Struct => TypeKind::Struct,
            DeclKind::Interface => TypeKind::Interface,
            DeclKind::Enum(p) => TypeKind::Enum(p),
            DeclKind::Delegate => continue,
        };
        *slot = b
            .define_type(&d.name, kind, None)
            .map_err(|source| AsmError::Metadata { line: d.line, source })?;
    }
    for (slot, d) in ids.iter_mut().zip(decls) {
        let Some(sig) = d.signature.as_ref().filter(|_| d.kind == DeclKind::Delegate) else {
            continue;
        };
        let params = params(&mut b, &sig.params, d.line)?;
        let ret = resolve_type(&mut b, &sig.ret, d.line)?;
        *slot = b
            .define_delegate(&d.name, params, ret)
            .map_err(|source| AsmError::Metadata { line: d.line, source })?;
    }

    for (d, &ty) in decls.iter().zip(&ids) {
        for name in &d.extends {
            let base = resolve_type(&mut b, name, d.line)?;
            if d.kind == DeclKind::Interface {
                b.add_interface(ty, base);
            } else {
                b.type_mut(ty).base = Some(base);
            }
        }
        for name in &d.implements {
            let iface = resolve_type(&mut b, name, d.line)?;
            b.add_interface(ty, iface);
        }
        let def = b.type_mut(ty);
        def.sealed |= d.sealed;
        def.is_abstract |= d.is_abstract;
    }

    let mut bodies: Vec<(MethodId, &MethodDecl)> = Vec::new();
    for (d, &ty) in decls.iter().zip(&ids) {
        for f in &d.fields {
            let field_ty = resolve_type(&mut b, &f.ty, f.line)?;
            let id = b.define_field(ty, &f.name, field_ty, f.is_static);
            if let Some(token) = &f.literal {
                let value = literal(b.metadata(), token, field_ty, f.line)?;
                b.set_literal(id, value);
            }
        }
        for m in &d.methods {
            let (id, has_body) = define_method(&mut b, ty, d.kind, m)?;
            if has_body {
                bodies.push((id, m));
            } else if let Some(first) = m.body.first() {
                return Err(AsmError::UnexpectedToken {
                    line: first.num,
                    token: first.tokens.first().map(Token::text).unwrap_or_default(),
                });
            }
        }
    }

    for (id, m) in bodies {
        let body = method_body(&mut b, m)?;
        b.set_implementation(id, MethodImpl::Il(Arc::new(body)));
    }

    b.finish()
        .map_err(|source| AsmError::Metadata { line: last_line, source })
}

fn params(b: &mut MetadataBuilder, decl: &[(String, String)], line: usize) -> Result<Vec<Param>, AsmError> {
    decl.iter()
        .map(|(ty, name)| Ok(Param::new(name, resolve_type(b, ty, line)?)))
        .collect()
}

/// Defines the signature; the flag says whether an IL body follows.
fn define_method(
    b: &mut MetadataBuilder,
    ty: TypeId,
    kind: DeclKind,
    m: &MethodDecl,
) -> Result<(MethodId, bool), AsmError> {
    let sig = &m.signature;
    let mods = &m.modifiers;
    let params = params(b, &sig.params, m.line)?;
    let param_types: Vec<TypeId> = params.iter().map(|p| p.ty).collect();
    let ret = resolve_type(b, &sig.ret, m.line)?;

    let mut method = if sig.name == ".ctor" {
        MethodSig::ctor(params)
    } else {
        MethodSig::new(&sig.name, params, ret)
    };
    let interface = kind == DeclKind::Interface;
    if mods.is_static {
        method = method.as_static();
    }
    if mods.is_override {
        method = method.as_virtual();
    } else if mods.is_virtual || mods.is_abstract || interface {
        method = method.as_virtual().as_newslot();
    }
    if mods.is_final {
        method = method.as_final();
    }
    if mods.is_pure {
        method = method.as_pure();
    }
    if let Some(target) = &mods.overrides {
        let base = resolve_method(b, target, Some(&param_types), m.line)?;
        method = method.overriding(base);
    }
    let (implementation, has_body) = if interface || mods.is_abstract {
        (MethodImpl::Abstract, false)
    } else if mods.is_native {
        (MethodImpl::Native, false)
    } else {
        (MethodImpl::Abstract, true)
    };
    Ok((b.define_method(ty, method.with_impl(implementation)), has_body))
}

/// Resolves a type name: primitives, declared and core types, `T[]`,
/// `T&` and generic instantiations `G<A,B>`.
pub(crate) fn resolve_type(b: &mut MetadataBuilder, text: &str, line: usize) -> Result<TypeId, AsmError> {
    let unknown = || AsmError::UnknownType {
        line,
        name: text.to_string(),
    };
    if let Some(inner) = text.strip_suffix('&') {
        return Ok(resolve_type(b, inner, line)?.by_ref());
    }
    if let Some(inner) = text.strip_suffix("[]") {
        let elem = resolve_type(b, inner, line)?;
        return Ok(b.array_of(elem));
    }
    if let Some(id) = b.metadata().type_by_name(text) {
        return Ok(id);
    }
    let Some((name, args)) = text.strip_suffix('>').and_then(|t| t.split_once('<')) else {
        return Err(unknown());
    };
    let def = b.metadata().type_by_name(name).ok_or_else(unknown)?;
    let args = split_args(args)
        .into_iter()
        .map(|a| resolve_type(b, a, line))
        .collect::<Result<Vec<_>, _>>()?;
    b.instantiate(def, &args)
        .map_err(|source| AsmError::Metadata { line, source })
}

/// Splits `A,B<C,D>` at top-level commas.
fn split_args(text: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut start = 0;
    for (i, c) in text.char_indices() {
        match c {
            '<' => depth += 1,
            '>' => depth = depth.saturating_sub(1),
            ',' if depth == 0 => {
                parts.push(&text[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(&text[start..]);
    parts
}

fn split_member(text: &str, line: usize) -> Result<(&str, &str), AsmError> {
    text.rsplit_once("::").ok_or_else(|| AsmError::UnknownMember {
        line,
        name: text.to_string(),
    })
}

fn member_error(source: MetadataError, line: usize, name: &str) -> AsmError {
    match source {
        MetadataError::UnknownMember(_) => AsmError::UnknownMember {
            line,
            name: name.to_string(),
        },
        source => AsmError::Metadata { line, source },
    }
}

fn resolve_field(b: &mut MetadataBuilder, text: &str, line: usize) -> Result<FieldId, AsmError> {
    let (owner, name) = split_member(text, line)?;
    let ty = resolve_type(b, owner, line)?;
    b.metadata()
        .find_field(ty, name)
        .map_err(|e| member_error(e, line, text))
}

fn resolve_method(
    b: &mut MetadataBuilder,
    text: &str,
    params: Option<&[TypeId]>,
    line: usize,
) -> Result<MethodId, AsmError> {
    let (owner, name) = split_member(text, line)?;
    let ty = resolve_type(b, owner, line)?;
    b.metadata()
        .find_method(ty, name, params)
        .map_err(|e| member_error(e, line, text))
}

/// The value of a literal field of type `ty`.
fn literal(meta: &Metadata, token: &Token, ty: TypeId, line: usize) -> Result<Constant, AsmError> {
    let prim = match meta.ty(ty).kind {
        TypeKind::Primitive(p) | TypeKind::Enum(p) => Some(p),
        _ => None,
    };
    let value = match (token, prim) {
        (Token::Ident(w), _) if w == "null" && prim.is_none() => Constant::Null,
        (Token::Ident(w), Some(p)) if w == "true" || w == "false" => Constant::from_i64(p, i64::from(w == "true")),
        (Token::Str(s), None) if ty == TypeId::STRING => Constant::str(s),
        (Token::Int(v), Some(p)) => Constant::from_i64(p, *v),
        (Token::Float(v), Some(p)) if p.is_float() => Constant::from_f64(p, *v),
        (other, _) => {
            return Err(AsmError::UnexpectedToken {
                line,
                token: other.text(),
            })
        }
    };
    Ok(value)
}

/// Parameter and local names usable as `Index` operands.
struct Slots {
    args: FxHashMap<String, u16>,
    locals: FxHashMap<String, u16>,
}

fn method_body(b: &mut MetadataBuilder, m: &MethodDecl) -> Result<MethodBody, AsmError> {
    let mut body = BodyBuilder::new();
    let mut slots = Slots {
        args: FxHashMap::default(),
        locals: FxHashMap::default(),
    };
    let offset = u16::from(!m.modifiers.is_static);
    if offset == 1 {
        slots.args.insert("this".to_string(), 0);
    }
    for (i, (_, name)) in m.signature.params.iter().enumerate() {
        slots.args.insert(name.clone(), i as u16 + offset);
    }
    for (ty, name) in &m.locals {
        let ty = resolve_type(b, ty, m.line)?;
        let slot = body.local(ty);
        if let Some(name) = name {
            slots.locals.insert(name.clone(), slot);
        }
    }
    for line in &m.body {
        body_line(b, &mut body, &slots, line)?;
    }
    body.build()
        .map_err(|source| AsmError::Metadata { line: m.line, source })
}

fn body_line(b: &mut MetadataBuilder, body: &mut BodyBuilder, slots: &Slots, line: &Line) -> Result<(), AsmError> {
    let mut t = Tokens::new(line);
    while let (Some(Token::Ident(name)), Some(Token::Punct(':'))) = (t.peek(), t.peek_at(1)) {
        let label = body.named_label(name);
        body.mark(label);
        t.advance(2);
    }
    if t.is_done() {
        return Ok(());
    }
    let head = t.ident()?;
    if head.starts_with('.') {
        let region = region(b, head, &mut t)?;
        t.end()?;
        body.region(region);
        return Ok(());
    }
    let (opcode, preset) = lookup_opcode(head).ok_or_else(|| AsmError::UnknownOpcode {
        line: line.num,
        token: head.to_string(),
    })?;
    let operand = match preset {
        Some(operand) => operand,
        None => operand(b, body, slots, &mut t, opcode)?,
    };
    t.end()?;
    if let (Opcode::Newarr, Operand::Type(elem)) = (opcode, &operand) {
        b.array_of(*elem);
    }
    body.emit(opcode, operand);
    Ok(())
}

fn region(b: &mut MetadataBuilder, directive: &str, t: &mut Tokens<'_>) -> Result<Region, AsmError> {
    Ok(match directive {
        ".try" => Region::TryStart,
        ".endtry" => Region::TryEnd,
        ".catch" => {
            let caught = match t.peek() {
                Some(Token::Ident(name)) => {
                    t.advance(1);
                    Some(resolve_type(b, name, t.line)?)
                }
                _ => None,
            };
            Region::CatchStart(caught)
        }
        ".endcatch" => Region::CatchEnd,
        ".finally" => Region::FinallyStart,
        ".endfinally" => Region::FinallyEnd,
        ".fault" => Region::FaultStart,
        ".endfault" => Region::FaultEnd,
        other => {
            return Err(AsmError::UnknownDirective {
                line: t.line,
                token: other.to_string(),
            })
        }
    })
}

/// Maps a mnemonic to its opcode. Short and macro forms (`ldarg.0`,
/// `br.s`, `ldc.i4.m1`, `ldind.i4`, `stelem.ref`, ...) fold to the
/// canonical opcode with their implied operand.
pub(crate) fn lookup_opcode(mnemonic: &str) -> Option<(Opcode, Option<Operand>)> {
    let m = mnemonic.to_ascii_lowercase();
    if let Some(op) = Opcode::from_mnemonic(&m) {
        return Some((op, None));
    }
    if let Some(base) = m.strip_suffix(".s") {
        return Opcode::from_mnemonic(base).map(|op| (op, None));
    }
    let (base, suffix) = m.rsplit_once('.')?;
    match base {
        "ldarg" | "ldloc" | "stloc" => {
            let n: u16 = suffix.parse().ok()?;
            Some((Opcode::from_mnemonic(base)?, Some(Operand::Index(n))))
        }
        "ldc.i4" => {
            let n = if suffix == "m1" { -1 } else { suffix.parse().ok()? };
            Some((Opcode::LdcI4, Some(Operand::Int32(n))))
        }
        "ldind" | "stind" | "ldelem" | "stelem" => {
            let ty = match suffix {
                "i1" => TypeId::I8,
                "u1" => TypeId::U8,
                "i2" => TypeId::I16,
                "u2" => TypeId::U16,
                "i4" => TypeId::I32,
                "u4" => TypeId::U32,
                "i8" => TypeId::I64,
                "u8" => TypeId::U64,
                "r4" => TypeId::F32,
                "r8" => TypeId::F64,
                "i" => TypeId::NATIVE_INT,
                "ref" => TypeId::OBJECT,
                _ => return None,
            };
            Some((Opcode::from_mnemonic(base)?, Some(Operand::Type(ty))))
        }
        _ => None,
    }
}

fn operand(
    b: &mut MetadataBuilder,
    body: &mut BodyBuilder,
    slots: &Slots,
    t: &mut Tokens<'_>,
    opcode: Opcode,
) -> Result<Operand, AsmError> {
    let line = t.line;
    let kind = opcode.operand_kind();
    if kind == OperandKind::None {
        return Ok(Operand::None);
    }
    let Some(token) = t.next() else {
        return Err(AsmError::MissingOperand {
            line,
            opcode: opcode.mnemonic(),
            expected: kind,
        });
    };
    let invalid = |v: &i64| AsmError::InvalidNumber {
        line,
        token: v.to_string(),
    };
    let operand = match (kind, token) {
        (OperandKind::Int32, Token::Int(v)) => Operand::Int32(match i32::try_from(*v) {
            Ok(n) => n,
            Err(_) => u32::try_from(*v).map_err(|_| invalid(v))? as i32,
        }),
        (OperandKind::Int64, Token::Int(v)) => Operand::Int64(*v),
        (OperandKind::Float32, Token::Float(v)) => Operand::Float32(*v as f32),
        (OperandKind::Float32, Token::Int(v)) => Operand::Float32(*v as f32),
        (OperandKind::Float64, Token::Float(v)) => Operand::Float64(*v),
        (OperandKind::Float64, Token::Int(v)) => Operand::Float64(*v as f64),
        (OperandKind::String, Token::Str(s)) => Operand::String(Arc::from(s.as_str())),
        (OperandKind::Label, Token::Ident(name)) => Operand::Label(body.named_label(name)),
        (OperandKind::Labels, Token::Punct('(')) => {
            let mut labels = Vec::new();
            if !t.eat_punct(')') {
                loop {
                    labels.push(body.named_label(t.ident()?));
                    if t.eat_punct(')') {
                        break;
                    }
                    t.punct(',')?;
                }
            }
            Operand::Labels(labels)
        }
        (OperandKind::Index, Token::Int(v)) => Operand::Index(u16::try_from(*v).map_err(|_| invalid(v))?),
        (OperandKind::Index, Token::Ident(name)) => {
            let names = match opcode {
                Opcode::Ldarg | Opcode::Ldarga | Opcode::Starg => &slots.args,
                _ => &slots.locals,
            };
            let slot = names.get(name).ok_or_else(|| AsmError::UnknownMember {
                line,
                name: name.clone(),
            })?;
            Operand::Index(*slot)
        }
        (OperandKind::Type, Token::Ident(name)) => Operand::Type(resolve_type(b, name, line)?),
        (OperandKind::Field, Token::Ident(name)) => Operand::Field(resolve_field(b, name, line)?),
        (OperandKind::Method, Token::Ident(name)) => Operand::Method(method_ref(b, t, name)?),
        (OperandKind::Token, Token::Ident(which)) => {
            let name = t.ident()?;
            Operand::Token(match which.as_str() {
                "type" => MemberToken::Type(resolve_type(b, name, line)?),
                "field" => MemberToken::Field(resolve_field(b, name, line)?),
                "method" => MemberToken::Method(method_ref(b, t, name)?),
                _ => return Err(t.unexpected(token)),
            })
        }
        (_, other) => return Err(t.unexpected(other)),
    };
    Ok(operand)
}

/// `Type::Name`, optionally followed by a parameter type list that selects
/// among overloads.
fn method_ref(b: &mut MetadataBuilder, t: &mut Tokens<'_>, name: &str) -> Result<MethodId, AsmError> {
    let params = if t.peek() == Some(&Token::Punct('(')) {
        let types = t
            .ident_list()?
            .iter()
            .map(|ty| resolve_type(b, ty, t.line))
            .collect::<Result<Vec<_>, _>>()?;
        Some(types)
    } else {
        None
    };
    resolve_method(b, name, params.as_deref(), t.line)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn short_forms_fold() {
        assert_eq!(lookup_opcode("ldarg.1"), Some((Opcode::Ldarg, Some(Operand::Index(1)))));
        assert_eq!(lookup_opcode("ldc.i4.m1"), Some((Opcode::LdcI4, Some(Operand::Int32(-1)))));
        assert_eq!(lookup_opcode("ldc.i4.s"), Some((Opcode::LdcI4, None)));
        assert_eq!(lookup_opcode("br.s"), Some((Opcode::Br, None)));
        assert_eq!(lookup_opcode("BLT.S"), Some((Opcode::Blt, None)));
        assert_eq!(
            lookup_opcode("stelem.ref"),
            Some((Opcode::Stelem, Some(Operand::Type(TypeId::OBJECT))))
        );
        assert_eq!(
            lookup_opcode("ldind.i4"),
            Some((Opcode::Ldind, Some(Operand::Type(TypeId::I32))))
        );
        assert_eq!(lookup_opcode("conv.ovf.i4.un"), Some((Opcode::ConvOvfI4Un, None)));
        assert_eq!(lookup_opcode("ldarg.x"), None);
        assert_eq!(lookup_opcode("frob.1"), None);
    }

    #[test]
    fn resolves_composite_type_names() {
        let mut b = MetadataBuilder::new();
        let i32_array = resolve_type(&mut b, "i32[]", 1).unwrap();
        assert_eq!(b.metadata().element_type(i32_array), Some(TypeId::I32));
        let by_ref = resolve_type(&mut b, "string&", 1).unwrap();
        assert_eq!(by_ref, TypeId::STRING.by_ref());
        let dict = resolve_type(&mut b, "Dictionary<string,i32>", 1).unwrap();
        assert_eq!(b.metadata().type_name(dict), "Dictionary<string,i32>");
        assert_eq!(resolve_type(&mut b, "Dictionary<string,i32>", 1).unwrap(), dict);
        assert_eq!(
            resolve_type(&mut b, "Nope", 4).unwrap_err(),
            AsmError::UnknownType {
                line: 4,
                name: "Nope".to_string()
            }
        );
    }

    #[test]
    fn splits_nested_arguments() {
        assert_eq!(split_args("string,Dictionary<i32,bool>"), vec!["string", "Dictionary<i32,bool>"]);
    }
}

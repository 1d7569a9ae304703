//! Conversions between evaluation-stack values and declared types.
//!
//! Stack operands keep the static type of whatever produced them. Before an
//! operator runs, small integers widen to `i32`, enums decay to their
//! underlying primitive and mixed widths are unified; before a store or a
//! call, values are converted to the declared type.

use symil_common::{Constant, Metadata, Primitive, TypeId, TypeKind};

use crate::expr::{BinaryOp, Expr, ExprKind, UnaryOp};

/// The primitive representation of a primitive or enum type.
pub fn underlying(meta: &Metadata, ty: TypeId) -> Option<Primitive> {
    if ty.is_by_ref() {
        return None;
    }
    match meta.ty(ty).kind {
        TypeKind::Primitive(p) | TypeKind::Enum(p) => Some(p),
        _ => None,
    }
}

/// Reference types: classes, interfaces, delegates, arrays and strings.
pub fn is_reference(meta: &Metadata, ty: TypeId) -> bool {
    !ty.is_by_ref() && ty != TypeId::VOID && !meta.is_value_type(ty)
}

/// `&x` becomes `x`; everything else is returned unchanged.
pub fn unwrap_address_of(e: &Expr) -> Expr {
    match e.kind() {
        ExprKind::AddressOf(inner) => inner.clone(),
        _ => e.clone(),
    }
}

fn convert_to(e: &Expr, ty: TypeId) -> Expr {
    if e.ty() == ty {
        e.clone()
    } else {
        Expr::convert(e.clone(), ty)
    }
}

/// Widens small integers to `i32` and decays enums. Non-numeric values
/// yield `None`.
pub fn to_numeric(meta: &Metadata, e: &Expr) -> Option<Expr> {
    let p = underlying(meta, e.ty())?;
    Some(match p {
        Primitive::Bool
        | Primitive::Char
        | Primitive::I8
        | Primitive::U8
        | Primitive::I16
        | Primitive::U16 => convert_to(e, TypeId::I32),
        Primitive::NativeInt => return None,
        _ => convert_to(e, p.type_id()),
    })
}

/// Reinterprets an unsigned operand as its signed counterpart.
pub fn to_signed(e: &Expr) -> Expr {
    match e.ty().primitive() {
        Some(p) if p.is_integer() && !p.is_signed() => match p.flip_sign() {
            Some(s) => convert_to(e, s.type_id()),
            None => e.clone(),
        },
        _ => e.clone(),
    }
}

/// Reinterprets a signed operand as its unsigned counterpart.
pub fn to_unsigned(e: &Expr) -> Expr {
    match e.ty().primitive() {
        Some(p) if p.is_integer() && p.is_signed() => match p.flip_sign() {
            Some(u) => convert_to(e, u.type_id()),
            None => e.clone(),
        },
        _ => e.clone(),
    }
}

/// Brings two numeric operands to a common type: the wider width, signed
/// unless both are unsigned, `f64` if either side is `f64`. Mixing integers
/// with floats is rejected.
pub fn unify(meta: &Metadata, a: &Expr, b: &Expr) -> Option<(Expr, Expr)> {
    let a = to_numeric(meta, a)?;
    let b = to_numeric(meta, b)?;
    let (pa, pb) = (a.ty().primitive()?, b.ty().primitive()?);
    if pa == pb {
        return Some((a, b));
    }
    let target = match (pa.is_float(), pb.is_float()) {
        (true, true) => Primitive::F64,
        (false, false) => {
            let bits = pa.bits().max(pb.bits());
            let signed = pa.is_signed() || pb.is_signed();
            match (bits, signed) {
                (64, true) => Primitive::I64,
                (64, false) => Primitive::U64,
                (_, true) => Primitive::I32,
                (_, false) => Primitive::U32,
            }
        }
        _ => return None,
    };
    let t = target.type_id();
    Some((convert_to(&a, t), convert_to(&b, t)))
}

/// Truth value of a stack operand: integers and floats compare against
/// zero, references against `null`.
pub fn to_bool(meta: &Metadata, e: &Expr) -> Option<Expr> {
    if e.ty() == TypeId::BOOL {
        return Some(e.clone());
    }
    if let Some(n) = to_numeric(meta, e) {
        let p = n.ty().primitive()?;
        let zero = Expr::constant(Constant::zero(p));
        return Some(Expr::not(Expr::eq(n, zero)));
    }
    if is_reference(meta, e.ty()) {
        return Some(Expr::not(Expr::eq(e.clone(), Expr::null(e.ty()))));
    }
    None
}

/// Converts a value to a declared type the way an implicit assignment
/// would. Returns `None` when no implicit conversion exists.
pub fn implicit_convert(meta: &Metadata, e: &Expr, to: TypeId) -> Option<Expr> {
    let from = e.ty();
    if from == to {
        return Some(e.clone());
    }
    if to == TypeId::BOOL {
        return to_bool(meta, e);
    }
    if to.is_by_ref() || from.is_by_ref() {
        // Managed pointers pass through; the callee dereferences them.
        return Some(e.clone());
    }
    if underlying(meta, from).is_some() && underlying(meta, to).is_some() {
        return Some(Expr::convert(e.clone(), to));
    }
    if is_reference(meta, to) {
        let is_null = e.is_null_constant()
            || (matches!(e.kind(), ExprKind::Default) && is_reference(meta, from));
        if is_null {
            return Some(Expr::null(to));
        }
        if meta.is_value_type(from) {
            return Some(Expr::convert(e.clone(), to));
        }
        if meta.is_assignable(from, to) {
            return Some(e.clone());
        }
        if let ExprKind::Unary {
            op: UnaryOp::Convert,
            operand,
        } = e.kind()
        {
            if is_reference(meta, operand.ty()) && meta.is_assignable(operand.ty(), to) {
                return Some(operand.clone());
            }
        }
        return None;
    }
    if is_reference(meta, from) && meta.is_value_type(to) {
        return Some(Expr::convert(e.clone(), to));
    }
    None
}

/// Like [`implicit_convert`], but falls back to an explicit conversion
/// node.
pub fn force_convert(meta: &Metadata, e: &Expr, to: TypeId) -> Expr {
    implicit_convert(meta, e, to).unwrap_or_else(|| convert_to(e, to))
}

/// Operands of an equality test: numeric values are unified, references
/// compare as they are.
pub fn equality_operands(meta: &Metadata, a: &Expr, b: &Expr) -> Option<(Expr, Expr)> {
    if let Some(pair) = unify(meta, a, b) {
        return Some(pair);
    }
    let refs = |e: &Expr| is_reference(meta, e.ty()) || e.ty().is_by_ref();
    if refs(a) && refs(b) {
        return Some((a.clone(), b.clone()));
    }
    None
}

/// Comparison node over unified operands; `unsigned` reinterprets integers
/// as unsigned first.
pub fn compare(meta: &Metadata, op: BinaryOp, a: &Expr, b: &Expr, unsigned: bool) -> Option<Expr> {
    if op == BinaryOp::Equal || op == BinaryOp::NotEqual {
        let (a, b) = equality_operands(meta, a, b)?;
        return Some(Expr::binary(op, a, b));
    }
    let (a, b) = unify(meta, a, b)?;
    let (a, b) = if unsigned {
        (to_unsigned(&a), to_unsigned(&b))
    } else {
        (to_signed(&a), to_signed(&b))
    };
    Some(Expr::binary(op, a, b))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simplify::simplify;
    use symil_common::MetadataBuilder;

    fn meta() -> Metadata {
        MetadataBuilder::new().finish().unwrap()
    }

    #[test]
    fn small_integers_widen() {
        let m = meta();
        let b = Expr::root(TypeId::U8, "b");
        let n = to_numeric(&m, &b).unwrap();
        assert_eq!(n.ty(), TypeId::I32);
    }

    #[test]
    fn unify_picks_wider_signed() {
        let m = meta();
        let a = Expr::root(TypeId::I32, "a");
        let b = Expr::root(TypeId::U64, "b");
        let (a, b) = unify(&m, &a, &b).unwrap();
        assert_eq!(a.ty(), TypeId::I64);
        assert_eq!(b.ty(), TypeId::I64);
        let f = Expr::root(TypeId::F64, "f");
        assert!(unify(&m, &a, &f).is_none());
    }

    #[test]
    fn truthiness() {
        let m = meta();
        let i = Expr::root(TypeId::I32, "i");
        assert_eq!(
            to_bool(&m, &i).unwrap(),
            Expr::not(Expr::eq(i.clone(), Expr::i32(0)))
        );
        let s = Expr::root(TypeId::STRING, "s");
        assert_eq!(
            to_bool(&m, &s).unwrap(),
            Expr::not(Expr::eq(s.clone(), Expr::null(TypeId::STRING)))
        );
        assert_eq!(
            simplify(&to_bool(&m, &Expr::i32(3)).unwrap(), &m),
            Expr::bool(true)
        );
    }

    #[test]
    fn implicit_conversions() {
        let m = meta();
        let s = Expr::root(TypeId::STRING, "s");
        assert_eq!(implicit_convert(&m, &s, TypeId::OBJECT), Some(s.clone()));
        assert_eq!(
            implicit_convert(&m, &Expr::null(TypeId::OBJECT), TypeId::STRING),
            Some(Expr::null(TypeId::STRING))
        );
        let narrowed = implicit_convert(&m, &Expr::i32(300), TypeId::U8).unwrap();
        assert_eq!(
            simplify(&narrowed, &m),
            Expr::constant(Constant::U8(44))
        );
        let o = Expr::root(TypeId::OBJECT, "o");
        assert_eq!(implicit_convert(&m, &o, TypeId::STRING), None);
        assert_eq!(
            force_convert(&m, &o, TypeId::STRING),
            Expr::convert(o, TypeId::STRING)
        );
    }

    #[test]
    fn signed_comparison_reinterprets_unsigned() {
        let m = meta();
        let u = Expr::root(TypeId::U32, "u");
        let cmp = compare(&m, BinaryOp::LessThan, &u, &Expr::i32(0), false).unwrap();
        assert_eq!(
            cmp,
            Expr::binary(
                BinaryOp::LessThan,
                Expr::convert(u.clone(), TypeId::I32),
                Expr::i32(0)
            )
        );
    }
}

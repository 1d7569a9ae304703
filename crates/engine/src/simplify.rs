//! Algebraic simplification.
//!
//! Rewrites run bottom-up: children are simplified first, then the rules
//! for the node itself, and any node a rule builds is rewritten again. A
//! full pass is repeated until nothing changes, so `simplify` is idempotent.
//!
//! The rules are local: constant folding, boolean identities, conditional
//! folding, distribution of unary operators and equality over conditional
//! arms, comparisons decided by placeholder tags, and evaluation of pure
//! host methods on constant arguments.

use rustc_hash::FxHashMap;
use symil_common::{Constant, Metadata, MethodId, MethodImpl, Primitive, TypeId, TypeKind};
use tracing::debug;

use crate::convert::underlying;
use crate::expr::{BinaryOp, Expr, ExprKind, UnaryOp};

const MAX_PASSES: usize = 16;

pub fn simplify(e: &Expr, meta: &Metadata) -> Expr {
    fixpoint(e, meta, MAX_PASSES).unwrap_or_else(|last| {
        debug!(
            passes = MAX_PASSES,
            expr = %last.render(meta),
            "simplification did not settle"
        );
        last
    })
}

/// Repeats full passes until one changes nothing. `Err` carries the last
/// value when `max_passes` runs out first.
fn fixpoint(e: &Expr, meta: &Metadata, max_passes: usize) -> Result<Expr, Expr> {
    let mut current = e.clone();
    for _ in 0..max_passes {
        let next = Simplifier::new(meta).pass(&current);
        if next == current {
            return Ok(next);
        }
        current = next;
    }
    Err(current)
}

/// Whether calls to `method` have no side effects.
pub(crate) fn is_pure(meta: &Metadata, method: MethodId) -> bool {
    let def = meta.method(method);
    def.pure || meta.ty(def.declaring).pure
}

/// Zero value of a primitive, enum or reference type. Structs, `void` and
/// managed pointers have none.
pub(crate) fn default_value(meta: &Metadata, ty: TypeId) -> Option<Expr> {
    if ty.is_by_ref() || ty == TypeId::VOID {
        return None;
    }
    match meta.ty(ty).kind {
        TypeKind::Primitive(p) | TypeKind::Enum(p) => {
            Some(Expr::typed_constant(Constant::zero(p), ty))
        }
        TypeKind::Struct | TypeKind::Void | TypeKind::GenericParam(_) => None,
        TypeKind::Class | TypeKind::Interface | TypeKind::Delegate | TypeKind::Array(_) => {
            Some(Expr::null(ty))
        }
    }
}

/// The run-time type of `e` when it is evident from the expression alone.
pub(crate) fn evident_type(meta: &Metadata, e: &Expr) -> Option<TypeId> {
    match e.kind() {
        ExprKind::New { .. } | ExprKind::NewArrayBounds(_) | ExprKind::NewArrayInit(_) => {
            Some(e.ty())
        }
        ExprKind::Constant(c) if !c.is_null() => Some(c.type_id()),
        ExprKind::Placeholder(p) if p.is_exact_type() => Some(e.ty()),
        _ if meta.is_sealed(e.ty()) && !meta.is_interface(e.ty()) => Some(e.ty()),
        _ => None,
    }
}

fn range(p: Primitive) -> (i128, i128) {
    let bits = p.bits();
    if p.is_signed() {
        (-(1i128 << (bits - 1)), (1i128 << (bits - 1)) - 1)
    } else {
        (0, (1i128 << bits) - 1)
    }
}

fn wide(c: &Constant, signed: bool) -> Option<i128> {
    if signed {
        c.as_i64().map(i128::from)
    } else {
        c.as_u64().map(i128::from)
    }
}

fn fold_not(c: &Constant) -> Option<Constant> {
    if let Some(b) = c.as_bool() {
        return Some(Constant::Bool(!b));
    }
    let p = c.primitive().filter(|p| p.is_integer())?;
    Some(Constant::from_i64(p, !c.as_i64()?))
}

fn fold_negate(c: &Constant, checked: bool) -> Option<Constant> {
    let p = c.primitive()?;
    if let Some(f) = c.as_f64() {
        return Some(Constant::from_f64(p, -f));
    }
    if !p.is_integer() {
        return None;
    }
    let v = -wide(c, p.is_signed())?;
    let (lo, hi) = range(p);
    if checked && !(lo..=hi).contains(&v) {
        return None;
    }
    Some(Constant::from_i64(p, v as i64))
}

fn const_equal(a: &Constant, b: &Constant) -> Option<bool> {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => return Some(x == y),
        (None, None) => {}
        _ => return None,
    }
    match (a.primitive(), b.primitive()) {
        (Some(pa), Some(pb)) if pa != pb => None,
        _ => Some(a == b),
    }
}

fn fold_binary(op: BinaryOp, a: &Constant, b: &Constant) -> Option<Constant> {
    match op {
        BinaryOp::Equal => return const_equal(a, b).map(Constant::Bool),
        BinaryOp::NotEqual => return const_equal(a, b).map(|v| Constant::Bool(!v)),
        _ => {}
    }
    let p = a.primitive()?;
    let pb = b.primitive()?;
    if pb != p && !op.is_shift() {
        return None;
    }
    if p == Primitive::Bool {
        let (x, y) = (a.as_bool()?, b.as_bool()?);
        return match op {
            BinaryOp::And => Some(Constant::Bool(x & y)),
            BinaryOp::Or => Some(Constant::Bool(x | y)),
            BinaryOp::Xor => Some(Constant::Bool(x ^ y)),
            _ => None,
        };
    }
    if p.is_float() {
        let (x, y) = (a.as_f64()?, b.as_f64()?);
        return Some(match op {
            BinaryOp::Add | BinaryOp::AddChecked => Constant::from_f64(p, x + y),
            BinaryOp::Sub | BinaryOp::SubChecked => Constant::from_f64(p, x - y),
            BinaryOp::Mul | BinaryOp::MulChecked => Constant::from_f64(p, x * y),
            BinaryOp::Div => Constant::from_f64(p, x / y),
            BinaryOp::Rem => Constant::from_f64(p, x % y),
            BinaryOp::LessThan => Constant::Bool(x < y),
            BinaryOp::LessThanOrEqual => Constant::Bool(x <= y),
            BinaryOp::GreaterThan => Constant::Bool(x > y),
            BinaryOp::GreaterThanOrEqual => Constant::Bool(x >= y),
            _ => return None,
        });
    }
    if !p.is_integer() {
        return None;
    }
    let signed = p.is_signed();
    let x = wide(a, signed)?;
    let y = wide(b, signed)?;
    let (lo, hi) = range(p);
    let in_range = |v: i128| (lo..=hi).contains(&v);
    let wrap = |v: i128| Some(Constant::from_i64(p, v as i64));
    let checked = |v: i128| if in_range(v) { wrap(v) } else { None };
    let bits = |c: &Constant| c.as_u64();
    match op {
        BinaryOp::Add => wrap(x + y),
        BinaryOp::Sub => wrap(x - y),
        BinaryOp::Mul => wrap(x.wrapping_mul(y)),
        BinaryOp::AddChecked => checked(x + y),
        BinaryOp::SubChecked => checked(x - y),
        BinaryOp::MulChecked => checked(x.checked_mul(y)?),
        BinaryOp::Div if y == 0 => None,
        BinaryOp::Div => checked(x / y),
        BinaryOp::Rem if y == 0 || (signed && x == lo && y == -1) => None,
        BinaryOp::Rem => wrap(x % y),
        BinaryOp::And => wrap(i128::from(bits(a)? & bits(b)?)),
        BinaryOp::Or => wrap(i128::from(bits(a)? | bits(b)?)),
        BinaryOp::Xor => wrap(i128::from(bits(a)? ^ bits(b)?)),
        BinaryOp::Shl | BinaryOp::Shr => {
            let width = if p.bits() == 64 { 64 } else { 32 };
            let amount = (b.as_i64()? & (width - 1)) as u32;
            let v = match (op, signed) {
                (BinaryOp::Shl, _) => (bits(a)? << amount) as i64,
                (_, true) => a.as_i64()? >> amount,
                (_, false) => (bits(a)? >> amount) as i64,
            };
            Some(Constant::from_i64(p, v))
        }
        BinaryOp::LessThan => Some(Constant::Bool(x < y)),
        BinaryOp::LessThanOrEqual => Some(Constant::Bool(x <= y)),
        BinaryOp::GreaterThan => Some(Constant::Bool(x > y)),
        BinaryOp::GreaterThanOrEqual => Some(Constant::Bool(x >= y)),
        BinaryOp::Equal | BinaryOp::NotEqual => None,
    }
}

fn is_int_const(e: &Expr, v: i64) -> bool {
    e.as_constant()
        .filter(|c| c.primitive().is_some_and(Primitive::is_integer))
        .and_then(Constant::as_i64)
        == Some(v)
}

fn is_float_type(ty: TypeId) -> bool {
    ty.primitive().is_some_and(Primitive::is_float)
}

/// Whether `a` is the negation of `b` or vice versa.
fn complementary(a: &Expr, b: &Expr) -> bool {
    let negates = |x: &Expr, y: &Expr| {
        matches!(x.kind(), ExprKind::Unary { op: UnaryOp::Not, operand } if operand == y)
    };
    negates(a, b) || negates(b, a)
}

/// Integer widening, boxing and reference conversions lose no information.
fn lossless(meta: &Metadata, from: TypeId, to: TypeId) -> bool {
    if from == to || !meta.is_value_type(to) {
        return true;
    }
    match (underlying(meta, from), underlying(meta, to)) {
        (Some(f), Some(t)) if f == t => true,
        (Some(Primitive::Bool), Some(t)) => t.is_integer(),
        (Some(f), Some(t)) if f.is_integer() && t.is_integer() => {
            t.bits() > f.bits() && (t.is_signed() || !f.is_signed())
        }
        _ => false,
    }
}

struct Simplifier<'m> {
    meta: &'m Metadata,
    memo: FxHashMap<Expr, Expr>,
}

impl<'m> Simplifier<'m> {
    fn new(meta: &'m Metadata) -> Self {
        Self {
            meta,
            memo: FxHashMap::default(),
        }
    }

    fn pass(&mut self, e: &Expr) -> Expr {
        if let Some(done) = self.memo.get(e) {
            return done.clone();
        }
        let rebuilt = e.map_children(|c| self.pass(c));
        let out = self.rewrite(&rebuilt);
        self.memo.insert(e.clone(), out.clone());
        out
    }

    /// Applies the node rules to `e`, whose children are already simplified.
    fn rewrite(&mut self, e: &Expr) -> Expr {
        match e.kind() {
            ExprKind::Default => default_value(self.meta, e.ty()).unwrap_or_else(|| e.clone()),
            ExprKind::Unary { op, operand } => self.unary(e, *op, operand),
            ExprKind::Binary { op, left, right } => self.binary(e, *op, left, right),
            ExprKind::Conditional {
                test,
                if_true,
                if_false,
            } => self.conditional(e, test, if_true, if_false),
            ExprKind::Field {
                target: Some(target),
                field,
            } => match target.kind() {
                ExprKind::Conditional {
                    test,
                    if_true,
                    if_false,
                } => {
                    let a = self.rewrite(&Expr::field(Some(if_true.clone()), *field, e.ty()));
                    let b = self.rewrite(&Expr::field(Some(if_false.clone()), *field, e.ty()));
                    self.rewrite(&Expr::conditional(test.clone(), a, b))
                }
                ExprKind::Default => self.rewrite(&Expr::default_of(e.ty())),
                _ => e.clone(),
            },
            ExprKind::Index { target, index } => match (target.kind(), index.as_constant()) {
                (ExprKind::NewArrayInit(items), Some(c)) => c
                    .as_i64()
                    .and_then(|i| usize::try_from(i).ok())
                    .and_then(|i| items.get(i).cloned())
                    .unwrap_or_else(|| e.clone()),
                _ => e.clone(),
            },
            ExprKind::Call {
                method,
                target,
                args,
            } => self
                .host_call(*method, target.as_ref(), args, e.ty())
                .unwrap_or_else(|| e.clone()),
            _ => e.clone(),
        }
    }

    fn host_call(
        &mut self,
        method: MethodId,
        target: Option<&Expr>,
        args: &[Expr],
        ty: TypeId,
    ) -> Option<Expr> {
        if !is_pure(self.meta, method) {
            return None;
        }
        let MethodImpl::Host(f) = &self.meta.method(method).implementation else {
            return None;
        };
        let consts: Vec<Constant> = target
            .into_iter()
            .chain(args)
            .map(|a| a.as_constant().cloned())
            .collect::<Option<_>>()?;
        f(&consts).ok().map(|c| Expr::typed_constant(c, ty))
    }

    // ---- unary ----

    fn unary(&mut self, e: &Expr, op: UnaryOp, x: &Expr) -> Expr {
        if let Some(r) = self.unary_direct(op, x, e.ty()) {
            return r;
        }
        if matches!(x.kind(), ExprKind::Conditional { .. }) {
            if let Some(r) = self.distribute_unary(op, x, e.ty()) {
                return r;
            }
        }
        e.clone()
    }

    /// Pushes `op` into every arm of a conditional, provided every leaf
    /// reduces.
    fn distribute_unary(&mut self, op: UnaryOp, x: &Expr, ty: TypeId) -> Option<Expr> {
        let ExprKind::Conditional {
            test,
            if_true,
            if_false,
        } = x.kind()
        else {
            return self.unary_direct(op, x, ty);
        };
        let a = self.distribute_unary(op, if_true, ty)?;
        let b = self.distribute_unary(op, if_false, ty)?;
        Some(self.rewrite(&Expr::conditional(test.clone(), a, b)))
    }

    fn unary_direct(&mut self, op: UnaryOp, x: &Expr, ty: TypeId) -> Option<Expr> {
        match op {
            UnaryOp::Not => {
                if let Some(c) = x.as_constant() {
                    return fold_not(c).map(|c| Expr::typed_constant(c, ty));
                }
                match x.kind() {
                    ExprKind::Unary {
                        op: UnaryOp::Not,
                        operand,
                    } => Some(operand.clone()),
                    _ => None,
                }
            }
            UnaryOp::Negate | UnaryOp::NegateChecked => {
                if let Some(c) = x.as_constant() {
                    return fold_negate(c, op == UnaryOp::NegateChecked)
                        .map(|c| Expr::typed_constant(c, ty));
                }
                match x.kind() {
                    ExprKind::Unary {
                        op: UnaryOp::Negate,
                        operand,
                    } if op == UnaryOp::Negate => Some(operand.clone()),
                    _ => None,
                }
            }
            UnaryOp::Convert | UnaryOp::ConvertChecked => {
                self.convert(x, ty, op == UnaryOp::ConvertChecked)
            }
            UnaryOp::TypeAs => self.type_as(x, ty),
            UnaryOp::ArrayLength => match x.kind() {
                ExprKind::NewArrayInit(items) => Some(Expr::i32(items.len() as i32)),
                ExprKind::NewArrayBounds(n) if n.ty() == TypeId::I32 => Some(n.clone()),
                ExprKind::NewArrayBounds(n) => {
                    Some(self.rewrite(&Expr::convert(n.clone(), TypeId::I32)))
                }
                _ => None,
            },
        }
    }

    fn convert(&mut self, x: &Expr, ty: TypeId, checked: bool) -> Option<Expr> {
        if x.ty() == ty {
            return Some(x.clone());
        }
        if let Some(c) = x.as_constant() {
            if let Some(target) = underlying(self.meta, ty) {
                if c.is_null() {
                    return None;
                }
                return c
                    .convert(target, checked)
                    .map(|v| Expr::typed_constant(v, ty));
            }
            if !self.meta.is_value_type(ty) && !ty.is_by_ref() {
                if c.is_null() {
                    return Some(Expr::null(ty));
                }
                if self.meta.is_assignable(c.type_id(), ty) {
                    return Some(Expr::typed_constant(c.clone(), ty));
                }
            }
            return None;
        }
        match x.kind() {
            ExprKind::Unary {
                op: UnaryOp::Convert,
                operand,
            } if operand.ty() == ty && lossless(self.meta, operand.ty(), x.ty()) => {
                Some(operand.clone())
            }
            _ => None,
        }
    }

    fn type_as(&mut self, x: &Expr, ty: TypeId) -> Option<Expr> {
        if x.ty() == ty {
            return Some(x.clone());
        }
        if x.is_null_constant() {
            return Some(Expr::null(ty));
        }
        let runtime = evident_type(self.meta, x)?;
        if self.meta.is_assignable(runtime, ty) {
            Some(self.rewrite(&Expr::convert(x.clone(), ty)))
        } else {
            Some(Expr::null(ty))
        }
    }

    // ---- binary ----

    fn binary(&mut self, e: &Expr, op: BinaryOp, l: &Expr, r: &Expr) -> Expr {
        let negated = match op {
            BinaryOp::NotEqual => Some(BinaryOp::Equal),
            BinaryOp::GreaterThanOrEqual => Some(BinaryOp::LessThan),
            BinaryOp::LessThanOrEqual => Some(BinaryOp::GreaterThan),
            _ => None,
        };
        if let Some(inner) = negated {
            let inner = self.rewrite(&Expr::binary(inner, l.clone(), r.clone()));
            return self.rewrite(&Expr::not(inner));
        }
        if let (Some(a), Some(b)) = (l.as_constant(), r.as_constant()) {
            if let Some(c) = fold_binary(op, a, b) {
                return Expr::typed_constant(c, e.ty());
            }
        }
        match op {
            BinaryOp::And | BinaryOp::Or | BinaryOp::Xor if e.ty() == TypeId::BOOL => {
                self.logical(e, op, l, r)
            }
            BinaryOp::Equal => self.equal(e, l, r),
            BinaryOp::Add
            | BinaryOp::AddChecked
            | BinaryOp::Sub
            | BinaryOp::SubChecked
            | BinaryOp::Mul
            | BinaryOp::MulChecked
                if e.ty().primitive().is_some_and(Primitive::is_integer) =>
            {
                self.arithmetic(e, op, l, r)
            }
            _ => e.clone(),
        }
    }

    fn logical(&mut self, e: &Expr, op: BinaryOp, l: &Expr, r: &Expr) -> Expr {
        let (lb, rb) = (l.as_bool(), r.as_bool());
        match op {
            BinaryOp::And => {
                if lb == Some(false) || rb == Some(false) || complementary(l, r) {
                    Expr::bool(false)
                } else if lb == Some(true) || l == r {
                    r.clone()
                } else if rb == Some(true) {
                    l.clone()
                } else {
                    e.clone()
                }
            }
            BinaryOp::Or => {
                if lb == Some(true) || rb == Some(true) || complementary(l, r) {
                    Expr::bool(true)
                } else if lb == Some(false) || l == r {
                    r.clone()
                } else if rb == Some(false) {
                    l.clone()
                } else {
                    e.clone()
                }
            }
            _ => match (lb, rb) {
                (Some(false), _) => r.clone(),
                (_, Some(false)) => l.clone(),
                (Some(true), _) => self.rewrite(&Expr::not(r.clone())),
                (_, Some(true)) => self.rewrite(&Expr::not(l.clone())),
                _ if l == r => Expr::bool(false),
                _ => e.clone(),
            },
        }
    }

    fn equal(&mut self, e: &Expr, l: &Expr, r: &Expr) -> Expr {
        if l == r && !is_float_type(l.ty()) {
            return Expr::bool(true);
        }
        if l.ty() == TypeId::BOOL && r.ty() == TypeId::BOOL {
            for (x, y) in [(l, r), (r, l)] {
                match y.as_bool() {
                    Some(true) => return x.clone(),
                    Some(false) => return self.rewrite(&Expr::not(x.clone())),
                    None => {}
                }
            }
        }
        for (x, y) in [(l, r), (r, l)] {
            if let Some(c) = y.as_constant() {
                if self.cannot_equal(x, c) {
                    return Expr::bool(false);
                }
            }
        }
        for (x, y) in [(l, r), (r, l)] {
            if matches!(x.kind(), ExprKind::Conditional { .. }) {
                if let Some(d) = self.distribute_equal(x, y) {
                    return d;
                }
            }
        }
        e.clone()
    }

    /// `(c ? a : b) == y` becomes `(c && a == y) || (!c && b == y)` when at
    /// least one arm comparison folds to a constant.
    fn distribute_equal(&mut self, cond: &Expr, other: &Expr) -> Option<Expr> {
        let mut reduced = false;
        let mut terms = Vec::new();
        for (guard, leaf) in cond.branches() {
            let cmp = self.rewrite(&Expr::eq(leaf, other.clone()));
            match cmp.as_bool() {
                Some(false) => reduced = true,
                Some(true) => {
                    reduced = true;
                    terms.push(self.pass(&guard));
                }
                None => {
                    let guard = self.pass(&guard);
                    terms.push(self.rewrite(&Expr::and(guard, cmp)));
                }
            }
        }
        if !reduced {
            return None;
        }
        let mut acc: Option<Expr> = None;
        for term in terms {
            acc = Some(match acc {
                None => term,
                Some(prev) => self.rewrite(&Expr::or(prev, term)),
            });
        }
        Some(acc.unwrap_or_else(|| Expr::bool(false)))
    }

    /// Tags on roots and freshly allocated objects rule out some equalities.
    fn cannot_equal(&self, x: &Expr, c: &Constant) -> bool {
        match x.kind() {
            ExprKind::Placeholder(p) if p.is_root() => {
                (p.is_not_null() && c.is_null())
                    || (p.is_exact_type()
                        && !c.is_null()
                        && !self.meta.is_value_type(x.ty())
                        && c.type_id() != x.ty())
            }
            ExprKind::New { .. } | ExprKind::NewArrayBounds(_) | ExprKind::NewArrayInit(_) => {
                c.is_null()
            }
            ExprKind::Unary {
                op: UnaryOp::Convert,
                operand,
            } if !self.meta.is_value_type(x.ty()) && !self.meta.is_value_type(operand.ty()) => {
                self.cannot_equal(operand, c)
            }
            _ => false,
        }
    }

    fn arithmetic(&mut self, e: &Expr, op: BinaryOp, l: &Expr, r: &Expr) -> Expr {
        match op {
            BinaryOp::Add | BinaryOp::AddChecked => {
                if is_int_const(r, 0) {
                    return l.clone();
                }
                if is_int_const(l, 0) {
                    return r.clone();
                }
                if op == BinaryOp::Add {
                    if let (
                        ExprKind::Binary {
                            op: BinaryOp::Add,
                            left: x,
                            right: c1,
                        },
                        Some(c2),
                    ) = (l.kind(), r.as_constant())
                    {
                        if let Some(sum) = c1
                            .as_constant()
                            .and_then(|c1| fold_binary(BinaryOp::Add, c1, c2))
                        {
                            let folded = Expr::typed_constant(sum, e.ty());
                            return self.rewrite(&Expr::binary(BinaryOp::Add, x.clone(), folded));
                        }
                    }
                }
                e.clone()
            }
            BinaryOp::Sub | BinaryOp::SubChecked if is_int_const(r, 0) => l.clone(),
            BinaryOp::Mul | BinaryOp::MulChecked => {
                if is_int_const(r, 1) {
                    l.clone()
                } else if is_int_const(l, 1) {
                    r.clone()
                } else if op == BinaryOp::Mul && (is_int_const(l, 0) || is_int_const(r, 0)) {
                    default_value(self.meta, e.ty()).unwrap_or_else(|| e.clone())
                } else {
                    e.clone()
                }
            }
            _ => e.clone(),
        }
    }

    // ---- conditional ----

    fn conditional(&mut self, e: &Expr, test: &Expr, a: &Expr, b: &Expr) -> Expr {
        if let Some(v) = test.as_bool() {
            return if v { a.clone() } else { b.clone() };
        }
        if let ExprKind::Unary {
            op: UnaryOp::Not,
            operand,
        } = test.kind()
        {
            return self.rewrite(&Expr::conditional(operand.clone(), b.clone(), a.clone()));
        }
        let a2 = collapse(a, test, true);
        let b2 = collapse(b, test, false);
        if a2 == b2 {
            return a2;
        }
        if e.ty() == TypeId::BOOL {
            match (a2.as_bool(), b2.as_bool()) {
                (Some(true), Some(false)) => return test.clone(),
                (Some(false), Some(true)) => return self.rewrite(&Expr::not(test.clone())),
                _ => {}
            }
        }
        if a2.ptr_eq(a) && b2.ptr_eq(b) {
            e.clone()
        } else {
            Expr::conditional(test.clone(), a2, b2)
        }
    }
}

/// Inside an arm where `test` is known to be `holds`, a nested conditional
/// on the same test (or its negation) reduces to one of its arms.
fn collapse(arm: &Expr, test: &Expr, holds: bool) -> Expr {
    let mut arm = arm.clone();
    loop {
        let next = match arm.kind() {
            ExprKind::Conditional {
                test: inner,
                if_true,
                if_false,
            } => {
                if inner == test {
                    if holds { if_true } else { if_false }.clone()
                } else if complementary(inner, test) {
                    if holds { if_false } else { if_true }.clone()
                } else {
                    return arm;
                }
            }
            _ => return arm,
        };
        arm = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;
    use symil_common::MetadataBuilder;

    fn meta() -> Metadata {
        MetadataBuilder::new().finish().unwrap()
    }

    #[test]
    fn pass_cap_reports_an_unsettled_result() {
        let m = meta();
        let sum = Expr::binary(BinaryOp::Add, Expr::i32(1), Expr::i32(2));
        assert_eq!(fixpoint(&sum, &m, 1), Err(Expr::i32(3)));
        assert_eq!(fixpoint(&sum, &m, 2), Ok(Expr::i32(3)));
        assert_eq!(simplify(&sum, &m), Expr::i32(3));
    }

    fn lt(a: Expr, b: Expr) -> Expr {
        Expr::binary(BinaryOp::LessThan, a, b)
    }

    #[test]
    fn folds_constant_arithmetic() {
        let m = meta();
        let e = Expr::binary(BinaryOp::Add, Expr::i32(2), Expr::i32(3));
        assert_eq!(simplify(&e, &m), Expr::i32(5));
        let wrap = Expr::binary(BinaryOp::Add, Expr::i32(i32::MAX), Expr::i32(1));
        assert_eq!(simplify(&wrap, &m), Expr::i32(i32::MIN));
        let ovf = Expr::binary(BinaryOp::AddChecked, Expr::i32(i32::MAX), Expr::i32(1));
        assert_eq!(simplify(&ovf, &m), ovf);
        let div0 = Expr::binary(BinaryOp::Div, Expr::i32(1), Expr::i32(0));
        assert_eq!(simplify(&div0, &m), div0);
    }

    #[test]
    fn unsigned_comparison_and_shift() {
        let m = meta();
        let big = Expr::constant(Constant::U32(u32::MAX));
        let e = lt(Expr::constant(Constant::U32(1)), big.clone());
        assert_eq!(simplify(&e, &m), Expr::bool(true));
        let shr = Expr::binary(BinaryOp::Shr, big, Expr::i32(28));
        assert_eq!(simplify(&shr, &m), Expr::constant(Constant::U32(15)));
        let sar = Expr::binary(BinaryOp::Shr, Expr::i32(-16), Expr::i32(2));
        assert_eq!(simplify(&sar, &m), Expr::i32(-4));
    }

    #[test]
    fn normalizes_comparisons() {
        let m = meta();
        let p = Expr::root(TypeId::I32, "p");
        let ge = Expr::binary(BinaryOp::GreaterThanOrEqual, p.clone(), Expr::i32(0));
        assert_eq!(simplify(&ge, &m), Expr::not(lt(p.clone(), Expr::i32(0))));
        let ne = Expr::binary(BinaryOp::NotEqual, p.clone(), Expr::i32(0));
        assert_eq!(simplify(&ne, &m), Expr::not(Expr::eq(p, Expr::i32(0))));
    }

    #[test]
    fn conditional_rules() {
        let m = meta();
        let p = Expr::root(TypeId::I32, "p");
        let c = lt(p.clone(), Expr::i32(0));
        let swapped = Expr::conditional(Expr::not(c.clone()), p.clone(), Expr::negate(p.clone()));
        assert_eq!(
            simplify(&swapped, &m),
            Expr::conditional(c.clone(), Expr::negate(p.clone()), p.clone())
        );
        let same = Expr::conditional(c.clone(), p.clone(), p.clone());
        assert_eq!(simplify(&same, &m), p);
        let nested = Expr::conditional(
            c.clone(),
            Expr::conditional(c.clone(), Expr::i32(1), Expr::i32(2)),
            Expr::i32(3),
        );
        assert_eq!(
            simplify(&nested, &m),
            Expr::conditional(c.clone(), Expr::i32(1), Expr::i32(3))
        );
        let as_bool = Expr::conditional(c.clone(), Expr::bool(false), Expr::bool(true));
        assert_eq!(simplify(&as_bool, &m), Expr::not(c));
    }

    #[test]
    fn boolean_identities() {
        let m = meta();
        let b = Expr::root(TypeId::BOOL, "b");
        assert_eq!(simplify(&Expr::and(Expr::bool(true), b.clone()), &m), b);
        assert_eq!(
            simplify(&Expr::or(b.clone(), Expr::not(b.clone())), &m),
            Expr::bool(true)
        );
        assert_eq!(
            simplify(&Expr::eq(b.clone(), Expr::bool(false)), &m),
            Expr::not(b.clone())
        );
        assert_eq!(simplify(&Expr::not(Expr::not(b.clone())), &m), b);
    }

    #[test]
    fn equality_distributes_over_conditionals() {
        let m = meta();
        let c = Expr::root(TypeId::BOOL, "c");
        let e = Expr::eq(
            Expr::conditional(c.clone(), Expr::i32(1), Expr::i32(2)),
            Expr::i32(1),
        );
        assert_eq!(simplify(&e, &m), c);
    }

    #[test]
    fn tags_decide_null_tests() {
        let m = meta();
        let obj = Expr::root_tagged(TypeId::OBJECT, "__this1", true, true);
        let e = Expr::eq(obj.clone(), Expr::null(TypeId::OBJECT));
        assert_eq!(simplify(&e, &m), Expr::bool(false));
        let s = Expr::eq(obj, Expr::constant(Constant::str("x")));
        assert_eq!(simplify(&s, &m), Expr::bool(false));
        let plain = Expr::root(TypeId::OBJECT, "o");
        let e = Expr::eq(plain, Expr::null(TypeId::OBJECT));
        assert_eq!(simplify(&e, &m), e);
    }

    #[test]
    fn unary_distributes_when_every_arm_reduces() {
        let m = meta();
        let c = Expr::root(TypeId::BOOL, "c");
        let e = Expr::negate(Expr::conditional(c.clone(), Expr::i32(1), Expr::i32(2)));
        assert_eq!(
            simplify(&e, &m),
            Expr::conditional(c.clone(), Expr::i32(-1), Expr::i32(-2))
        );
        let p = Expr::root(TypeId::I32, "p");
        let partial = Expr::negate(Expr::conditional(c, Expr::i32(1), p));
        assert_eq!(simplify(&partial, &m), partial);
    }

    #[test]
    fn defaults_materialize() {
        let m = meta();
        assert_eq!(simplify(&Expr::default_of(TypeId::I64), &m), Expr::constant(Constant::I64(0)));
        assert_eq!(
            simplify(&Expr::default_of(TypeId::STRING), &m),
            Expr::null(TypeId::STRING)
        );
        let pair = m.corlib().key_value_pair;
        assert_eq!(simplify(&Expr::default_of(pair), &m), Expr::default_of(pair));
    }

    #[test]
    fn converts_fold_and_strip() {
        let m = meta();
        let p = Expr::root(TypeId::I32, "p");
        let widened = Expr::convert(Expr::convert(p.clone(), TypeId::I64), TypeId::I32);
        assert_eq!(simplify(&widened, &m), p);
        let narrowed = Expr::convert(Expr::convert(p.clone(), TypeId::I8), TypeId::I32);
        assert_eq!(simplify(&narrowed, &m), narrowed);
        let checked = Expr::unary(UnaryOp::ConvertChecked, Expr::i32(300), TypeId::U8);
        assert_eq!(simplify(&checked, &m), checked);
    }

    #[test]
    fn array_shapes() {
        let mut b = MetadataBuilder::new();
        let ints = b.array_of(TypeId::I32);
        let m = b.finish().unwrap();
        let init = Expr::new_array_init(ints, vec![Expr::i32(7), Expr::i32(8)]);
        let len = Expr::unary(UnaryOp::ArrayLength, init.clone(), TypeId::I32);
        assert_eq!(simplify(&len, &m), Expr::i32(2));
        let elem = Expr::index(init, Expr::i32(1), TypeId::I32);
        assert_eq!(simplify(&elem, &m), Expr::i32(8));
    }

    #[test]
    fn pure_host_calls_evaluate() {
        let m = meta();
        let abs = m
            .find_method(m.corlib().math, "Abs", Some(&[TypeId::I32]))
            .unwrap();
        let call = Expr::call(abs, None, vec![Expr::i32(-5)], TypeId::I32);
        assert_eq!(simplify(&call, &m), Expr::i32(5));
        let p = Expr::root(TypeId::I32, "p");
        let open = Expr::call(abs, None, vec![p], TypeId::I32);
        assert_eq!(simplify(&open, &m), open);
    }

    #[test]
    fn reassociates_constant_additions() {
        let m = meta();
        let p = Expr::root(TypeId::I32, "p");
        let e = Expr::binary(
            BinaryOp::Add,
            Expr::binary(BinaryOp::Add, p.clone(), Expr::i32(1)),
            Expr::i32(2),
        );
        assert_eq!(
            simplify(&e, &m),
            Expr::binary(BinaryOp::Add, p, Expr::i32(3))
        );
    }

    fn arb_int(roots: Vec<Expr>) -> impl Strategy<Value = Expr> + Clone {
        let leaf = prop_oneof![
            (-3i32..4).prop_map(Expr::i32),
            prop::sample::select(roots),
        ];
        leaf.prop_recursive(4, 24, 3, |inner| {
            prop_oneof![
                (inner.clone(), inner.clone()).prop_map(|(a, b)| Expr::binary(BinaryOp::Add, a, b)),
                (inner.clone(), inner.clone()).prop_map(|(a, b)| Expr::binary(BinaryOp::Mul, a, b)),
                inner.clone().prop_map(Expr::negate),
                (inner.clone(), inner.clone(), inner.clone(), inner.clone()).prop_map(
                    |(a, b, t, f)| Expr::conditional(
                        Expr::binary(BinaryOp::LessThan, a, b),
                        t,
                        f
                    )
                ),
                (inner.clone(), inner).prop_map(|(t, f)| Expr::conditional(
                    Expr::eq(t.clone(), Expr::i32(0)),
                    t,
                    f
                )),
            ]
        })
    }

    fn arb_bool(roots: Vec<Expr>) -> impl Strategy<Value = Expr> {
        let ints = arb_int(roots);
        (ints.clone(), ints, 0u8..4).prop_map(|(a, b, k)| match k {
            0 => Expr::eq(a, b),
            1 => Expr::not(Expr::binary(BinaryOp::LessThan, a, b)),
            2 => Expr::binary(BinaryOp::GreaterThanOrEqual, a, b),
            _ => Expr::and(Expr::eq(a, Expr::i32(1)), Expr::not(Expr::eq(b, Expr::i32(1)))),
        })
    }

    fn roots() -> Vec<Expr> {
        vec![Expr::root(TypeId::I32, "p"), Expr::root(TypeId::I32, "q")]
    }

    proptest! {
        #[test]
        fn simplify_is_idempotent(e in arb_int(roots()), b in arb_bool(roots())) {
            let m = meta();
            let once = simplify(&e, &m);
            prop_assert_eq!(simplify(&once, &m), once);
            let once = simplify(&b, &m);
            prop_assert_eq!(simplify(&once, &m), once);
        }

        #[test]
        fn equal_expressions_hash_equal(a in arb_int(roots()), b in arb_int(roots())) {
            use std::hash::{BuildHasher, BuildHasherDefault};
            let m = meta();
            let build = BuildHasherDefault::<rustc_hash::FxHasher>::default();
            let (a, b) = (simplify(&a, &m), simplify(&b, &m));
            if a == b {
                prop_assert_eq!(build.hash_one(&a), build.hash_one(&b));
            }
            let copy = a.map_children(|c| c.map_children(Expr::clone));
            prop_assert_eq!(&copy, &a);
            prop_assert_eq!(build.hash_one(&copy), build.hash_one(&a));
        }
    }
}

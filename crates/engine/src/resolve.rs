//! Substitution of stored values into expressions.
//!
//! Locations (placeholders, field and element accesses) are looked up in
//! the execution state. How eagerly a stored value replaces its location
//! depends on the [`ResolveMode`]: the default mode only inlines values that
//! keep expressions small and object identities intact, the full mode
//! inlines everything it can reach.

use rustc_hash::FxHashMap;
use symil_common::{Metadata, TypeId, TypeKind};

use crate::convert::is_reference;
use crate::expr::{Expr, ExprKind, UnaryOp};
use crate::simplify::{evident_type, simplify};
use crate::state::ExecutionState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolveMode {
    /// Local placeholders are always substituted; roots and heap locations
    /// only when their value is trivial.
    Default,
    /// Every bound location is substituted.
    Full,
    /// Like `Default`, except the top-level node is kept as a location.
    /// Used for the target of a store.
    ParamOnly,
}

/// Resolves `e` against `state` and simplifies the result.
pub fn resolve(e: &Expr, state: &ExecutionState, meta: &Metadata, mode: ResolveMode) -> Expr {
    let mut r = Resolver::new(state, meta, mode == ResolveMode::Full);
    let out = match mode {
        ResolveMode::ParamOnly => r.location(e),
        _ => r.value(e),
    };
    simplify(&out, meta)
}

/// Resolves every operand-stack entry in the default mode.
pub fn resolve_stack(state: ExecutionState, meta: &Metadata) -> ExecutionState {
    let mut r = Resolver::new(&state, meta, false);
    let stack: Vec<Expr> = state
        .stack()
        .iter()
        .map(|e| simplify(&r.value(e), meta))
        .collect();
    state.with_stack(stack)
}

/// The run-time type of `e`, when the state pins it down: an exact-type
/// tag, a constructed object or literal, or conditional arms that agree.
pub fn prove_type(e: &Expr, state: &ExecutionState, meta: &Metadata) -> Option<TypeId> {
    let v = resolve(e, state, meta, ResolveMode::Full);
    proven(&v, meta)
}

fn proven(v: &Expr, meta: &Metadata) -> Option<TypeId> {
    if let Some(t) = evident_type(meta, v) {
        return Some(t);
    }
    match v.kind() {
        ExprKind::Conditional {
            if_true, if_false, ..
        } => {
            let a = proven(if_true, meta)?;
            let b = proven(if_false, meta)?;
            (a == b).then_some(a)
        }
        ExprKind::Unary {
            op: UnaryOp::Convert,
            operand,
        } if is_reference(meta, v.ty()) => proven(operand, meta),
        _ => None,
    }
}

/// Values cheap enough to inline in the default mode.
pub(crate) fn is_trivial(e: &Expr, meta: &Metadata) -> bool {
    match e.kind() {
        ExprKind::Constant(_) | ExprKind::Placeholder(_) | ExprKind::FunctionPointer { .. } => true,
        ExprKind::Default => {
            !e.ty().is_by_ref()
                && !matches!(
                    meta.ty(e.ty()).kind,
                    TypeKind::Struct | TypeKind::GenericParam(_)
                )
        }
        ExprKind::AddressOf(inner) => is_trivial(inner, meta),
        ExprKind::Field { target, .. } => target.as_ref().is_none_or(|t| is_trivial(t, meta)),
        ExprKind::Index { target, index } => is_trivial(target, meta) && is_trivial(index, meta),
        ExprKind::Unary {
            op: UnaryOp::Convert,
            operand,
        } => is_trivial(operand, meta),
        _ => false,
    }
}

struct Resolver<'a> {
    state: &'a ExecutionState,
    meta: &'a Metadata,
    full: bool,
    /// Locations being expanded; guards against self-referential bindings.
    active: Vec<Expr>,
    memo: [FxHashMap<Expr, Expr>; 2],
}

impl<'a> Resolver<'a> {
    fn new(state: &'a ExecutionState, meta: &'a Metadata, full: bool) -> Self {
        Self {
            state,
            meta,
            full,
            active: Vec::new(),
            memo: Default::default(),
        }
    }

    fn value(&mut self, e: &Expr) -> Expr {
        let slot = usize::from(self.full);
        if let Some(done) = self.memo[slot].get(e) {
            return done.clone();
        }
        let cacheable = self.active.is_empty();
        let out = match e.kind() {
            ExprKind::Constant(_) | ExprKind::Default => return e.clone(),
            ExprKind::Placeholder(p) => self.placeholder(e, p.is_root()),
            ExprKind::Field { .. } | ExprKind::Index { .. } => {
                let key = self.location(e);
                self.read(&key)
            }
            ExprKind::AddressOf(inner) => Expr::address_of(self.location(inner)),
            _ => e.map_children(|c| self.value(c)),
        };
        if cacheable {
            self.memo[slot].insert(e.clone(), out.clone());
        }
        out
    }

    fn placeholder(&mut self, e: &Expr, root: bool) -> Expr {
        let Some(bound) = self.state.read(e) else {
            return e.clone();
        };
        if root && !self.full && !is_trivial(bound, self.meta) {
            return e.clone();
        }
        self.expand(e, bound.clone())
    }

    fn expand(&mut self, key: &Expr, bound: Expr) -> Expr {
        if self.active.contains(key) {
            return key.clone();
        }
        self.active.push(key.clone());
        let out = self.value(&bound);
        self.active.pop();
        out
    }

    /// Default-mode value of a location's base or index.
    fn base(&mut self, e: &Expr) -> Expr {
        let saved = std::mem::replace(&mut self.full, false);
        let out = self.value(e);
        self.full = saved;
        simplify(&out, self.meta)
    }

    /// The canonical store key for a location. A conditional base yields a
    /// conditional over keys.
    fn location(&mut self, e: &Expr) -> Expr {
        match e.kind() {
            ExprKind::Field {
                target: Some(t),
                field,
            } => {
                let base = self.base(t);
                distribute(&base, &|b| Expr::field(Some(b), *field, e.ty()))
            }
            ExprKind::Index { target, index } => {
                let base = self.base(target);
                let index = self.base(index);
                distribute(&base, &|b| Expr::index(b, index.clone(), e.ty()))
            }
            ExprKind::Placeholder(_) | ExprKind::Field { target: None, .. } => e.clone(),
            _ => self.value(e),
        }
    }

    fn read(&mut self, key: &Expr) -> Expr {
        if let ExprKind::Conditional {
            test,
            if_true,
            if_false,
        } = key.kind()
        {
            let a = self.read(if_true);
            let b = self.read(if_false);
            return Expr::conditional(test.clone(), a, b);
        }
        match self.state.read(key) {
            Some(v) if self.full || is_trivial(v, self.meta) => self.expand(key, v.clone()),
            Some(_) => key.clone(),
            None if self.full => self.miss(key),
            None => key.clone(),
        }
    }

    /// Full-mode read of an unbound location: rebuild it over the fully
    /// resolved base so the simplifier can see through constructed values.
    fn miss(&mut self, key: &Expr) -> Expr {
        match key.kind() {
            ExprKind::Field {
                target: Some(t),
                field,
            } => {
                let base = self.value(t);
                Expr::field(Some(base), *field, key.ty())
            }
            ExprKind::Index { target, index } => {
                let base = self.value(target);
                let i = self.value(index);
                match base.kind() {
                    ExprKind::NewArrayBounds(_) if i.is_constant() => Expr::default_of(key.ty()),
                    ExprKind::NewArrayBounds(_) => self.element_of(target, &i, key.ty()),
                    _ => Expr::index(base, i, key.ty()),
                }
            }
            _ => key.clone(),
        }
    }

    /// A symbolic-index read of an array whose stored elements all sit at
    /// constant indices.
    fn element_of(&mut self, array: &Expr, index: &Expr, elem: TypeId) -> Expr {
        let stored: Vec<(Expr, Expr)> = self
            .state
            .locations()
            .into_iter()
            .filter_map(|loc| match loc.kind() {
                ExprKind::Index { target, index: i }
                    if target == array && i.is_constant() && i.ty() == index.ty() =>
                {
                    Some((i.clone(), loc.clone()))
                }
                _ => None,
            })
            .collect();
        let mut out = Expr::default_of(elem);
        for (i, loc) in stored {
            let v = self.read(&loc);
            out = Expr::conditional(Expr::eq(index.clone(), i), v, out);
        }
        out
    }
}

fn distribute(base: &Expr, build: &dyn Fn(Expr) -> Expr) -> Expr {
    match base.kind() {
        ExprKind::Conditional {
            test,
            if_true,
            if_false,
        } => Expr::conditional(
            test.clone(),
            distribute(if_true, build),
            distribute(if_false, build),
        ),
        _ => build(base.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::BinaryOp;
    use pretty_assertions::assert_eq;
    use symil_common::{Constant, MetadataBuilder};

    fn meta() -> Metadata {
        MetadataBuilder::new().finish().unwrap()
    }

    #[test]
    fn locals_are_always_substituted() {
        let m = meta();
        let p = Expr::root(TypeId::I32, "p");
        let x = Expr::local(TypeId::I32, "local_0__1");
        let sum = Expr::binary(BinaryOp::Add, p.clone(), Expr::i32(1));
        let s = ExecutionState::new().write(x.clone(), sum.clone());
        assert_eq!(resolve(&x, &s, &m, ResolveMode::Default), sum);
        assert_eq!(resolve(&x, &s, &m, ResolveMode::ParamOnly), x);
    }

    #[test]
    fn roots_keep_identity_unless_full() {
        let m = meta();
        let p = Expr::root(TypeId::I32, "p");
        let tmp = Expr::root(TypeId::I32, "__setPar1");
        let sum = Expr::binary(BinaryOp::Add, p, Expr::i32(1));
        let s = ExecutionState::new().write(tmp.clone(), sum.clone());
        assert_eq!(resolve(&tmp, &s, &m, ResolveMode::Default), tmp);
        assert_eq!(resolve(&tmp, &s, &m, ResolveMode::Full), sum);
        let lit = Expr::root(TypeId::I32, "__setPar2");
        let s = s.write(lit.clone(), Expr::i32(4));
        assert_eq!(resolve(&lit, &s, &m, ResolveMode::Default), Expr::i32(4));
    }

    #[test]
    fn field_keys_use_resolved_base() {
        let m = meta();
        let lib = m.corlib();
        let obj = Expr::root_tagged(lib.exception, "__this1", true, true);
        let this = Expr::local(lib.exception, "param_this__2");
        let msg = |t: Expr| Expr::field(Some(t), lib.exception_message, TypeId::STRING);
        let s = ExecutionState::new()
            .write(this.clone(), obj.clone())
            .write(msg(obj), Expr::constant(Constant::str("boom")));
        assert_eq!(
            resolve(&msg(this), &s, &m, ResolveMode::Default),
            Expr::constant(Constant::str("boom"))
        );
    }

    #[test]
    fn field_over_conditional_base_distributes() {
        let m = meta();
        let lib = m.corlib();
        let c = Expr::root(TypeId::BOOL, "c");
        let a = Expr::root_tagged(lib.exception, "__this1", true, true);
        let b = Expr::root_tagged(lib.exception, "__this2", true, true);
        let x = Expr::local(lib.exception, "local_0__3");
        let msg = |t: Expr| Expr::field(Some(t), lib.exception_message, TypeId::STRING);
        let s = ExecutionState::new()
            .write(x.clone(), Expr::conditional(c.clone(), a.clone(), b.clone()))
            .write(msg(a), Expr::constant(Constant::str("a")))
            .write(msg(b), Expr::constant(Constant::str("b")));
        assert_eq!(
            resolve(&msg(x), &s, &m, ResolveMode::Default),
            Expr::conditional(
                c,
                Expr::constant(Constant::str("a")),
                Expr::constant(Constant::str("b"))
            )
        );
    }

    #[test]
    fn self_reference_does_not_loop() {
        let m = meta();
        let x = Expr::local(TypeId::I32, "local_0__1");
        let s = ExecutionState::new().write(
            x.clone(),
            Expr::binary(BinaryOp::Add, x.clone(), Expr::i32(1)),
        );
        let out = resolve(&x, &s, &m, ResolveMode::Full);
        assert_eq!(out, Expr::binary(BinaryOp::Add, x, Expr::i32(1)));
    }

    #[test]
    fn unwritten_array_elements_default() {
        let mut b = MetadataBuilder::new();
        let ints = b.array_of(TypeId::I32);
        let m = b.finish().unwrap();
        let arr = Expr::root_tagged(ints, "__arr1", true, true);
        let s = ExecutionState::new()
            .write(arr.clone(), Expr::new_array(ints, Expr::i32(3)))
            .write(Expr::index(arr.clone(), Expr::i32(0), TypeId::I32), Expr::i32(9));
        let at = |i: Expr| Expr::index(arr.clone(), i, TypeId::I32);
        assert_eq!(resolve(&at(Expr::i32(0)), &s, &m, ResolveMode::Full), Expr::i32(9));
        assert_eq!(resolve(&at(Expr::i32(2)), &s, &m, ResolveMode::Full), Expr::i32(0));
        let i = Expr::root(TypeId::I32, "i");
        assert_eq!(
            resolve(&at(i.clone()), &s, &m, ResolveMode::Full),
            Expr::conditional(Expr::eq(i, Expr::i32(0)), Expr::i32(9), Expr::i32(0))
        );
    }

    #[test]
    fn proves_types() {
        let m = meta();
        let lib = m.corlib();
        let exact = Expr::root_tagged(lib.exception, "__this1", true, true);
        let s = ExecutionState::new();
        assert_eq!(prove_type(&exact, &s, &m), Some(lib.exception));
        let open = Expr::root(lib.exception, "e");
        assert_eq!(prove_type(&open, &s, &m), None);
        let boxed = Expr::convert(Expr::i32(1), TypeId::OBJECT);
        assert_eq!(prove_type(&boxed, &s, &m), Some(TypeId::I32));
        let c = Expr::root(TypeId::BOOL, "c");
        let other = Expr::root_tagged(lib.exception, "__this2", true, true);
        let both = Expr::conditional(c, exact, other);
        assert_eq!(prove_type(&both, &s, &m), Some(lib.exception));
    }

    #[test]
    fn stack_entries_resolve_in_place() {
        let m = meta();
        let x = Expr::local(TypeId::I32, "local_0__1");
        let s = ExecutionState::with_args(vec![x.clone(), Expr::i32(2)]).write(x, Expr::i32(7));
        let s = resolve_stack(s, &m);
        assert_eq!(s.stack(), &[Expr::i32(7), Expr::i32(2)]);
    }
}

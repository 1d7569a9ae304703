//! Joining the two arms of an undecided branch.

use indexmap::IndexSet;
use rustc_hash::FxBuildHasher;
use symil_common::Metadata;
use thiserror::Error;
use tracing::trace;

use crate::error::EngineError;
use crate::executor::Executor;
use crate::expr::Expr;
use crate::simplify::{default_value, simplify};
use crate::state::{ExecutionState, SideEffect};

/// The arms left different numbers of values on the operand stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("operand stacks of depth {taken} and {other} meet at a merge")]
pub struct StackMismatch {
    pub taken: usize,
    pub other: usize,
}

/// Merges the arms forked from `base` on `condition`: `taken` ran under
/// `condition`, `other` under its negation.
///
/// Every location written by either arm becomes `condition ? t : f`,
/// where a side that did not write it contributes what it reads through its
/// ancestors, or the zero value of the location's type. Engine temporaries
/// that only one arm introduced keep that arm's value. Side effects are
/// re-guarded by the arm's condition. An arm that raised still merges its
/// writes; the operand stack comes from the arm that did not.
pub fn merge_branches(
    base: &ExecutionState,
    condition: &Expr,
    taken: ExecutionState,
    other: ExecutionState,
    meta: &Metadata,
) -> Result<ExecutionState, StackMismatch> {
    let negated = simplify(&Expr::not(condition.clone()), meta);
    let effects: Vec<SideEffect> = guarded(&taken, condition, meta)
        .chain(guarded(&other, &negated, meta))
        .collect();
    let merged = base.clone().extend_side_effects(effects);

    let stack = match (taken.is_thrown(), other.is_thrown()) {
        (true, true) => return Ok(merged.clear_stack().set_thrown(true)),
        (true, false) => other.stack().to_vec(),
        (false, true) => taken.stack().to_vec(),
        (false, false) => {
            if taken.stack().len() != other.stack().len() {
                return Err(StackMismatch {
                    taken: taken.stack().len(),
                    other: other.stack().len(),
                });
            }
            taken
                .stack()
                .iter()
                .zip(other.stack())
                .map(|(t, f)| pick(condition, t, f, meta))
                .collect()
        }
    };

    let mut locations: IndexSet<&Expr, FxBuildHasher> = IndexSet::default();
    locations.extend(taken.local_store().keys());
    locations.extend(other.local_store().keys());

    let mut bindings = Vec::with_capacity(locations.len());
    for location in locations {
        let t = taken.read(location);
        let f = other.read(location);
        let value = match (t, f) {
            (Some(t), Some(f)) => pick(condition, t, f, meta),
            (Some(v), None) | (None, Some(v)) if location.is_synthetic_placeholder() => v.clone(),
            (Some(t), None) => pick(condition, t, &zero(location, meta), meta),
            (None, Some(f)) => pick(condition, &zero(location, meta), f, meta),
            (None, None) => continue,
        };
        bindings.push((location.clone(), value));
    }
    Ok(merged.write_all(bindings).with_stack(stack))
}

fn pick(condition: &Expr, t: &Expr, f: &Expr, meta: &Metadata) -> Expr {
    if t == f {
        return t.clone();
    }
    simplify(&Expr::conditional(condition.clone(), t.clone(), f.clone()), meta)
}

fn zero(location: &Expr, meta: &Metadata) -> Expr {
    default_value(meta, location.ty()).unwrap_or_else(|| Expr::default_of(location.ty()))
}

fn guarded<'a>(
    arm: &'a ExecutionState,
    condition: &'a Expr,
    meta: &'a Metadata,
) -> impl Iterator<Item = SideEffect> + 'a {
    arm.side_effects().iter().map(move |s| SideEffect {
        guard: Some(match &s.guard {
            None => condition.clone(),
            Some(g) => simplify(&Expr::and(condition.clone(), g.clone()), meta),
        }),
        effect: s.effect.clone(),
    })
}

impl Executor<'_> {
    pub(crate) fn merge(
        &mut self,
        base: &ExecutionState,
        condition: &Expr,
        taken: ExecutionState,
        other: ExecutionState,
    ) -> Result<ExecutionState, EngineError> {
        trace!(
            condition = %condition.render(self.meta()),
            taken_thrown = taken.is_thrown(),
            other_thrown = other.is_thrown(),
            "merge"
        );
        let merged = merge_branches(base, condition, taken, other, self.meta())
            .map_err(|e| self.invalid(e.to_string()))?;
        if self.interner().is_none() {
            return Ok(merged);
        }
        let stack: Vec<Expr> = merged.stack().iter().map(|e| self.intern(e.clone())).collect();
        Ok(merged.with_stack(stack))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use symil_common::{MetadataBuilder, TypeId};

    fn meta() -> Metadata {
        MetadataBuilder::new().finish().unwrap()
    }

    #[test]
    fn partial_writes_merge_against_ancestors_and_defaults() {
        let m = meta();
        let c = Expr::root(TypeId::BOOL, "c");
        let x = Expr::local(TypeId::I32, "local_0__0");
        let y = Expr::local(TypeId::I32, "local_1__0");
        let base = ExecutionState::new().write(x.clone(), Expr::i32(1));
        let t = base.fork(c.clone()).write(x.clone(), Expr::i32(2));
        let f = base.fork(Expr::not(c.clone())).write(y.clone(), Expr::i32(5));

        let merged = merge_branches(&base, &c, t, f, &m).unwrap();
        assert_eq!(
            merged.read(&x),
            Some(&Expr::conditional(c.clone(), Expr::i32(2), Expr::i32(1)))
        );
        assert_eq!(
            merged.read(&y),
            Some(&Expr::conditional(c, Expr::i32(0), Expr::i32(5)))
        );
    }

    #[test]
    fn synthetic_roots_keep_their_only_value() {
        let m = meta();
        let c = Expr::root(TypeId::BOOL, "c");
        let tmp = Expr::root(TypeId::I32, "__setPar0");
        let base = ExecutionState::new();
        let t = base.fork(c.clone()).write(tmp.clone(), Expr::i32(9));
        let f = base.fork(Expr::not(c.clone()));
        let merged = merge_branches(&base, &c, t, f, &m).unwrap();
        assert_eq!(merged.read(&tmp), Some(&Expr::i32(9)));
    }

    #[test]
    fn stacks_merge_positionally() {
        let m = meta();
        let c = Expr::root(TypeId::BOOL, "c");
        let p = Expr::root(TypeId::I32, "p");
        let base = ExecutionState::new();
        let t = base.fork(c.clone()).push(Expr::negate(p.clone()));
        let f = base.fork(Expr::not(c.clone())).push(p.clone());
        let merged = merge_branches(&base, &c, t, f, &m).unwrap();
        assert_eq!(
            merged.stack(),
            &[Expr::conditional(c.clone(), Expr::negate(p.clone()), p.clone())]
        );

        let t = base.fork(c.clone()).push(Expr::i32(1));
        let f = base.fork(Expr::not(c.clone()));
        assert_eq!(
            merge_branches(&base, &c, t, f, &m).unwrap_err(),
            StackMismatch { taken: 1, other: 0 }
        );
    }

    #[test]
    fn throwing_arm_keeps_its_writes_but_not_its_stack() {
        let m = meta();
        let c = Expr::root(TypeId::BOOL, "c");
        let x = Expr::local(TypeId::I32, "local_0__0");
        let e = Expr::root(TypeId::OBJECT, "e");
        let base = ExecutionState::new().write(x.clone(), Expr::i32(1));
        let t = base
            .fork(c.clone())
            .write(x.clone(), Expr::i32(2))
            .with_exception(e.clone());
        let f = base.fork(Expr::not(c.clone())).push(Expr::i32(3));

        let merged = merge_branches(&base, &c, t, f, &m).unwrap();
        assert!(!merged.is_thrown());
        assert_eq!(
            merged.read(&x),
            Some(&Expr::conditional(c.clone(), Expr::i32(2), Expr::i32(1)))
        );
        assert_eq!(merged.stack(), &[Expr::i32(3)]);
        assert_eq!(
            merged.side_effects(),
            &[SideEffect {
                guard: Some(c),
                effect: Expr::throw(e),
            }]
        );
    }

    #[test]
    fn nested_guards_conjoin() {
        let m = meta();
        let c = Expr::root(TypeId::BOOL, "c");
        let g = Expr::root(TypeId::BOOL, "g");
        let effect = Expr::root(TypeId::I32, "effect");
        let base = ExecutionState::new();
        let t = base
            .fork(c.clone())
            .add_side_effect(Some(g.clone()), effect.clone());
        let f = base.fork(Expr::not(c.clone())).add_side_effect(None, effect.clone());
        let merged = merge_branches(&base, &c, t, f, &m).unwrap();
        assert_eq!(merged.side_effects()[0].guard, Some(Expr::and(c.clone(), g)));
        assert_eq!(merged.side_effects()[1].guard, Some(Expr::not(c.clone())));

        let both = merge_branches(
            &base,
            &c,
            base.fork(c.clone()).with_exception(effect.clone()),
            base.fork(Expr::not(c.clone())).with_exception(effect),
            &m,
        )
        .unwrap();
        assert!(both.is_thrown());
        assert!(both.stack().is_empty());
    }
}

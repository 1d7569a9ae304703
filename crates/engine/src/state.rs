//! Persistent execution state.
//!
//! A state is a node in a chain: it owns a local store of `location ->
//! value` bindings plus path conditions, and reads fall back to the parent.
//! Forking creates a child with an empty local store, so a fork shares its
//! ancestors instead of copying them. All collections sit behind `Arc` and
//! are copied on first write.

use std::sync::Arc;

use indexmap::IndexMap;
use rustc_hash::{FxBuildHasher, FxHashSet};

use crate::expr::{Expr, ExprKind, UnaryOp};

/// Insertion-ordered `location -> value` bindings.
pub type Store = IndexMap<Expr, Expr, FxBuildHasher>;

/// An observable action, optionally guarded by the condition under which
/// it happens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SideEffect {
    pub guard: Option<Expr>,
    pub effect: Expr,
}

#[derive(Debug, Clone, Default)]
pub struct ExecutionState {
    store: Arc<Store>,
    conditions: Arc<Vec<Expr>>,
    parent: Option<Arc<ExecutionState>>,
    side_effects: Arc<Vec<SideEffect>>,
    stack: Arc<Vec<Expr>>,
    thrown: bool,
}

impl ExecutionState {
    pub fn new() -> Self {
        Self::default()
    }

    /// A root state whose stack holds call arguments.
    pub fn with_args(args: Vec<Expr>) -> Self {
        Self::new().with_stack(args)
    }

    // ---- store ----

    /// The value bound to `location` here or in an ancestor.
    pub fn read(&self, location: &Expr) -> Option<&Expr> {
        self.store
            .get(location)
            .or_else(|| self.parent.as_deref().and_then(|p| p.read(location)))
    }

    /// Bindings made in this state, excluding ancestors.
    pub fn local_store(&self) -> &Store {
        &self.store
    }

    /// Every bound location in the chain, outermost ancestor first, each
    /// listed once at its first binding.
    pub fn locations(&self) -> Vec<&Expr> {
        let mut chain: Vec<&ExecutionState> = std::iter::successors(Some(self), |s| s.parent())
            .collect();
        chain.reverse();
        let mut seen: FxHashSet<&Expr> = FxHashSet::default();
        let mut out = Vec::new();
        for state in chain {
            for location in state.store.keys() {
                if seen.insert(location) {
                    out.push(location);
                }
            }
        }
        out
    }

    pub fn write(mut self, location: Expr, value: Expr) -> Self {
        Arc::make_mut(&mut self.store).insert(location, value);
        self
    }

    pub fn write_all(mut self, bindings: impl IntoIterator<Item = (Expr, Expr)>) -> Self {
        let store = Arc::make_mut(&mut self.store);
        for (location, value) in bindings {
            store.insert(location, value);
        }
        self
    }

    // ---- evaluation stack ----

    pub fn stack(&self) -> &[Expr] {
        &self.stack
    }

    pub fn with_stack(mut self, stack: Vec<Expr>) -> Self {
        self.stack = Arc::new(stack);
        self
    }

    pub fn push(mut self, value: Expr) -> Self {
        Arc::make_mut(&mut self.stack).push(value);
        self
    }

    /// The top `n` entries, bottom-most first.
    pub fn peek(&self, n: usize) -> Option<&[Expr]> {
        let len = self.stack.len();
        len.checked_sub(n).map(|start| &self.stack[start..])
    }

    /// Replaces the top `n` entries with `values`. The caller checks depth
    /// with [`peek`](Self::peek) first.
    pub fn replace_top(mut self, n: usize, values: impl IntoIterator<Item = Expr>) -> Self {
        let stack = Arc::make_mut(&mut self.stack);
        let keep = stack.len().saturating_sub(n);
        stack.truncate(keep);
        stack.extend(values);
        self
    }

    pub fn clear_stack(mut self) -> Self {
        if !self.stack.is_empty() {
            self.stack = Arc::default();
        }
        self
    }

    // ---- side effects ----

    pub fn side_effects(&self) -> &[SideEffect] {
        &self.side_effects
    }

    pub fn add_side_effect(mut self, guard: Option<Expr>, effect: Expr) -> Self {
        Arc::make_mut(&mut self.side_effects).push(SideEffect { guard, effect });
        self
    }

    pub fn extend_side_effects(mut self, effects: impl IntoIterator<Item = SideEffect>) -> Self {
        Arc::make_mut(&mut self.side_effects).extend(effects);
        self
    }

    /// Terminates the path with an unconditional raise of `exception`.
    pub fn with_exception(self, exception: Expr) -> Self {
        let mut state = self
            .clear_stack()
            .add_side_effect(None, Expr::throw(exception));
        state.thrown = true;
        state
    }

    /// Whether every path reaching this state raised.
    pub fn is_thrown(&self) -> bool {
        self.thrown
    }

    pub(crate) fn set_thrown(mut self, thrown: bool) -> Self {
        self.thrown = thrown;
        self
    }

    // ---- forking ----

    /// A child state assuming `condition`: same stack, empty local store and
    /// no side effects of its own.
    pub fn fork(&self, condition: Expr) -> Self {
        Self {
            store: Arc::default(),
            conditions: Arc::new(vec![condition]),
            parent: Some(Arc::new(self.clone())),
            side_effects: Arc::default(),
            stack: Arc::clone(&self.stack),
            thrown: false,
        }
    }

    pub fn parent(&self) -> Option<&ExecutionState> {
        self.parent.as_deref()
    }

    /// Path conditions of this state and its ancestors, innermost first.
    pub fn conditions(&self) -> impl Iterator<Item = &Expr> + '_ {
        std::iter::successors(Some(self), |s| s.parent()).flat_map(|s| s.conditions.iter())
    }

    /// Whether the path conditions already decide `test`.
    pub fn implied(&self, test: &Expr) -> Option<bool> {
        let negated = match test.kind() {
            ExprKind::Unary {
                op: UnaryOp::Not,
                operand,
            } => Some(operand),
            _ => None,
        };
        for c in self.conditions() {
            if c == test {
                return Some(true);
            }
            if negated == Some(c) {
                return Some(false);
            }
            if let ExprKind::Unary {
                op: UnaryOp::Not,
                operand,
            } = c.kind()
            {
                if operand == test {
                    return Some(false);
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use symil_common::TypeId;

    fn local(name: &str) -> Expr {
        Expr::local(TypeId::I32, name)
    }

    #[test]
    fn reads_fall_back_to_ancestors() {
        let x = local("x");
        let root = ExecutionState::new().write(x.clone(), Expr::i32(1));
        let cond = Expr::root(TypeId::BOOL, "c");
        let child = root.fork(cond);
        assert_eq!(child.read(&x), Some(&Expr::i32(1)));
        assert!(child.local_store().is_empty());
        let child = child.write(x.clone(), Expr::i32(2));
        assert_eq!(child.read(&x), Some(&Expr::i32(2)));
        assert_eq!(root.read(&x), Some(&Expr::i32(1)));
    }

    #[test]
    fn writes_do_not_leak_into_clones() {
        let x = local("x");
        let a = ExecutionState::new().write(x.clone(), Expr::i32(1));
        let b = a.clone().write(x.clone(), Expr::i32(2));
        assert_eq!(a.read(&x), Some(&Expr::i32(1)));
        assert_eq!(b.read(&x), Some(&Expr::i32(2)));
    }

    #[test]
    fn stack_operations() {
        let s = ExecutionState::with_args(vec![Expr::i32(1), Expr::i32(2), Expr::i32(3)]);
        assert_eq!(s.peek(2), Some(&[Expr::i32(2), Expr::i32(3)][..]));
        assert_eq!(s.peek(4), None);
        let s = s.replace_top(2, [Expr::i32(5)]);
        assert_eq!(s.stack(), &[Expr::i32(1), Expr::i32(5)]);
        assert!(s.clear_stack().stack().is_empty());
    }

    #[test]
    fn exception_clears_stack_and_marks_thrown() {
        let s = ExecutionState::with_args(vec![Expr::i32(1)]);
        let ex = Expr::root(TypeId::OBJECT, "e");
        let s = s.with_exception(ex.clone());
        assert!(s.is_thrown());
        assert!(s.stack().is_empty());
        assert_eq!(
            s.side_effects(),
            &[SideEffect {
                guard: None,
                effect: Expr::throw(ex)
            }]
        );
    }

    #[test]
    fn conditions_decide_tests() {
        let c = Expr::root(TypeId::BOOL, "c");
        let d = Expr::root(TypeId::BOOL, "d");
        let inner = ExecutionState::new()
            .fork(c.clone())
            .fork(Expr::not(d.clone()));
        assert_eq!(inner.implied(&c), Some(true));
        assert_eq!(inner.implied(&Expr::not(c)), Some(false));
        assert_eq!(inner.implied(&d), Some(false));
        assert_eq!(inner.conditions().count(), 2);
    }

    #[test]
    fn locations_list_outermost_first() {
        let (x, y) = (local("x"), local("y"));
        let root = ExecutionState::new()
            .write(x.clone(), Expr::i32(1))
            .write(y.clone(), Expr::i32(2));
        let child = root
            .fork(Expr::bool(true))
            .write(y.clone(), Expr::i32(3))
            .write(local("z"), Expr::i32(4));
        let names: Vec<String> = child.locations().iter().map(|l| l.to_string()).collect();
        assert_eq!(names, vec!["x", "y", "z"]);
    }
}

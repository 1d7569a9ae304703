//! Per-call executor: counters, guards, error sites and store updates.
//!
//! An [`Executor`] lives for one top-level call. It owns everything that
//! changes while a method runs except the execution state itself, which is
//! threaded through every operation by value.

use symil_common::{Metadata, MethodId, TypeId, TypeKind};
use tracing::{trace, warn};

use crate::config::Config;
use crate::convert::force_convert;
use crate::error::EngineError;
use crate::expr::{Expr, ExprKind};
use crate::intern::InternTable;
use crate::registry::Registry;
use crate::resolve::{prove_type, resolve, resolve_stack, ResolveMode};
use crate::simplify::{default_value, simplify};
use crate::state::ExecutionState;
use crate::Engine;

/// Method and instruction index errors are attributed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Site {
    pub method: MethodId,
    pub at: usize,
}

pub struct Executor<'e> {
    engine: &'e Engine,
    /// Source of per-call names; restarts at zero for every executor.
    counter: u64,
    call_depth: usize,
    fork_depth: usize,
    paths: usize,
    steps: usize,
    site: Site,
    interner: Option<InternTable>,
}

impl<'e> Executor<'e> {
    pub(crate) fn new(engine: &'e Engine, entry: MethodId) -> Self {
        Self {
            engine,
            counter: 0,
            call_depth: 0,
            fork_depth: 0,
            paths: 0,
            steps: 0,
            site: Site {
                method: entry,
                at: 0,
            },
            interner: engine.config().intern.then(InternTable::new),
        }
    }

    pub fn meta(&self) -> &'e Metadata {
        self.engine.meta()
    }

    pub fn registry(&self) -> &'e Registry {
        self.engine.registry()
    }

    pub fn config(&self) -> &'e Config {
        self.engine.config()
    }

    pub(crate) fn engine(&self) -> &'e Engine {
        self.engine
    }

    /// Instructions executed so far, across all paths.
    pub fn steps(&self) -> usize {
        self.steps
    }

    /// Forks taken so far.
    pub fn paths(&self) -> usize {
        self.paths
    }

    pub fn interner(&self) -> Option<&InternTable> {
        self.interner.as_ref()
    }

    pub(crate) fn site(&self) -> Site {
        self.site
    }

    pub(crate) fn set_site(&mut self, site: Site) {
        self.site = site;
    }

    pub(crate) fn set_pc(&mut self, at: usize) {
        self.site.at = at;
    }

    // ---- errors ----

    fn method_label(&self) -> String {
        self.meta().method_name(self.site.method)
    }

    pub fn unsupported(&self, what: impl Into<String>) -> EngineError {
        EngineError::Unsupported {
            method: self.method_label(),
            at: self.site.at,
            what: what.into(),
        }
    }

    pub fn unprovable(&self, what: impl Into<String>) -> EngineError {
        EngineError::Unprovable {
            method: self.method_label(),
            at: self.site.at,
            what: what.into(),
        }
    }

    pub fn invalid(&self, reason: impl Into<String>) -> EngineError {
        EngineError::InvalidProgram {
            method: self.method_label(),
            at: self.site.at,
            reason: reason.into(),
        }
    }

    pub(crate) fn missing_body(&self, callee: MethodId) -> EngineError {
        EngineError::MissingBody {
            method: self.method_label(),
            at: self.site.at,
            callee: self.meta().method_name(callee),
        }
    }

    pub(crate) fn host_error(&self, callee: MethodId, message: String) -> EngineError {
        EngineError::Host {
            method: self.method_label(),
            at: self.site.at,
            callee: self.meta().method_name(callee),
            message,
        }
    }

    // ---- guards ----

    pub(crate) fn tick(&mut self) -> Result<(), EngineError> {
        self.steps += 1;
        let limit = self.config().max_steps;
        if self.steps > limit {
            warn!(method = %self.method_label(), limit, "step limit exceeded");
            return Err(EngineError::StepLimitExceeded {
                method: self.method_label(),
                at: self.site.at,
                limit,
            });
        }
        Ok(())
    }

    pub(crate) fn enter_fork(&mut self) -> Result<(), EngineError> {
        self.paths += 1;
        let config = self.config();
        if self.paths > config.max_paths {
            warn!(method = %self.method_label(), limit = config.max_paths, "path limit exceeded");
            return Err(EngineError::PathLimitExceeded {
                method: self.method_label(),
                at: self.site.at,
                limit: config.max_paths,
            });
        }
        if self.fork_depth >= config.max_fork_depth {
            warn!(method = %self.method_label(), limit = config.max_fork_depth, "fork depth exceeded");
            return Err(EngineError::ForkLimitExceeded {
                method: self.method_label(),
                at: self.site.at,
                limit: config.max_fork_depth,
            });
        }
        self.fork_depth += 1;
        Ok(())
    }

    pub(crate) fn leave_fork(&mut self) {
        self.fork_depth = self.fork_depth.saturating_sub(1);
    }

    pub(crate) fn enter_call(&mut self) -> Result<(), EngineError> {
        let limit = self.config().max_call_depth;
        if self.call_depth >= limit {
            warn!(method = %self.method_label(), limit, "call depth exceeded");
            return Err(EngineError::CallDepthExceeded {
                method: self.method_label(),
                at: self.site.at,
                limit,
            });
        }
        self.call_depth += 1;
        Ok(())
    }

    pub(crate) fn leave_call(&mut self) {
        self.call_depth = self.call_depth.saturating_sub(1);
    }

    pub(crate) fn call_depth(&self) -> usize {
        self.call_depth
    }

    // ---- expressions ----

    pub(crate) fn next_id(&mut self) -> u64 {
        let n = self.counter;
        self.counter += 1;
        n
    }

    /// A fresh synthetic root named `__{prefix}{n}`.
    pub fn fresh_root(&mut self, ty: TypeId, prefix: &str) -> Expr {
        let n = self.next_id();
        Expr::root(ty, &format!("__{prefix}{n}"))
    }

    /// Identity of a newly allocated object: not null, exact type.
    pub fn fresh_object(&mut self, ty: TypeId) -> Expr {
        let n = self.next_id();
        Expr::root_tagged(ty, &format!("__this{n}"), true, true)
    }

    pub fn resolve(&self, e: &Expr, state: &ExecutionState, mode: ResolveMode) -> Expr {
        resolve(e, state, self.meta(), mode)
    }

    pub fn prove_type(&self, e: &Expr, state: &ExecutionState) -> Option<TypeId> {
        prove_type(e, state, self.meta())
    }

    pub fn simplify(&self, e: &Expr) -> Expr {
        simplify(e, self.meta())
    }

    pub(crate) fn intern(&mut self, e: Expr) -> Expr {
        match self.interner.as_mut() {
            Some(table) => table.intern(&e),
            None => e,
        }
    }

    /// The zero value of `ty`. Structs get a fresh identity whose fields
    /// are all zero.
    pub(crate) fn zero_value(&mut self, state: ExecutionState, ty: TypeId) -> (ExecutionState, Expr) {
        let meta = self.meta();
        if ty.is_by_ref() || meta.ty(ty).kind != TypeKind::Struct {
            let v = default_value(meta, ty).unwrap_or_else(|| Expr::default_of(ty));
            return (state, v);
        }
        let root = self.fresh_root(ty, "struct");
        let state = self.default_fields(state.write(root.clone(), Expr::default_of(ty)), &root);
        (state, root)
    }

    /// Binds every instance field of `object` to its zero value.
    pub(crate) fn default_fields(&self, state: ExecutionState, object: &Expr) -> ExecutionState {
        let meta = self.meta();
        let fields = meta.instance_fields(object.ty()).into_iter().map(|f| {
            let ty = meta.field(f).ty;
            let zero = default_value(meta, ty).unwrap_or_else(|| Expr::default_of(ty));
            (Expr::field(Some(object.clone()), f, ty), zero)
        });
        state.write_all(fields)
    }

    // ---- stores ----

    /// Resolves the operand stack and replaces heap reads in it by their
    /// current values, so that a following store cannot change what the
    /// stack already holds.
    pub fn snapshot_stack(&mut self, state: ExecutionState) -> ExecutionState {
        let mut state = resolve_stack(state, self.meta());
        let mut reads = Vec::new();
        for entry in state.stack() {
            collect_heap_reads(entry, &mut reads);
        }
        if reads.is_empty() {
            return state;
        }
        let mut stack = state.stack().to_vec();
        for read in reads {
            let (next, value) = self.current_value(state, &read);
            state = next;
            for entry in &mut stack {
                *entry = entry.replace(&read, &value);
            }
        }
        state.with_stack(stack)
    }

    /// The value a heap location holds right now. Unbound input locations
    /// are captured into a fresh root through a recorded read.
    fn current_value(&mut self, state: ExecutionState, location: &Expr) -> (ExecutionState, Expr) {
        let full = self.resolve(location, &state, ResolveMode::Full);
        if !full.is_heap_read() {
            return (state, full);
        }
        let root = self.fresh_root(full.ty(), "envPar");
        trace!(location = %full.render(self.meta()), "snapshot heap read");
        let state = state.add_side_effect(None, Expr::assign(root.clone(), full));
        (state, root)
    }

    /// Stores `right` into the location `left`.
    pub fn set_var(
        &mut self,
        state: ExecutionState,
        left: &Expr,
        right: &Expr,
    ) -> Result<ExecutionState, EngineError> {
        let mut right = self.resolve(right, &state, ResolveMode::Default);
        let left = self.resolve(left, &state, ResolveMode::ParamOnly);
        let mut state = self.snapshot_stack(state);

        if left.is_heap_read() && right.contains(&left) {
            let (next, current) = self.current_value(state, &left);
            state = next;
            right = self.simplify(&right.replace(&left, &current));
        }

        match left.kind() {
            ExprKind::Placeholder(_) | ExprKind::Field { .. } | ExprKind::Index { .. } => {
                Ok(self.set_var_core(state, left, right))
            }
            ExprKind::Conditional { .. } => {
                for (guard, leaf) in left.branches() {
                    if !matches!(
                        leaf.kind(),
                        ExprKind::Placeholder(_) | ExprKind::Field { .. } | ExprKind::Index { .. }
                    ) {
                        return Err(self.unsupported(format!(
                            "store through {}",
                            leaf.render(self.meta())
                        )));
                    }
                    let guard = self.simplify(&guard);
                    let (next, old) = if state.read(&leaf).is_some() {
                        let v = self.resolve(&leaf, &state, ResolveMode::Default);
                        (state, v)
                    } else if leaf.is_heap_read() {
                        self.current_value(state, &leaf)
                    } else {
                        (state, Expr::default_of(leaf.ty()))
                    };
                    let value = force_convert(self.meta(), &right, leaf.ty());
                    let merged = self.simplify(&Expr::conditional(guard, value, old));
                    state = self.set_var_core(next, leaf, merged);
                }
                Ok(state)
            }
            _ => Err(self.unsupported(format!("store to {}", left.render(self.meta())))),
        }
    }

    /// Binds `value` to `location`. Anything but a constant or placeholder
    /// is bound to a fresh root first, and the location to that root.
    pub(crate) fn set_var_core(&mut self, state: ExecutionState, location: Expr, value: Expr) -> ExecutionState {
        let value = self.simplify(&force_convert(self.meta(), &value, location.ty()));
        let value = self.intern(value);
        let direct = matches!(
            value.kind(),
            ExprKind::Constant(_) | ExprKind::Placeholder(_) | ExprKind::Default
        );
        if direct {
            return state.write(location, value);
        }
        let root = self.fresh_root(value.ty(), "setPar");
        state.write(root.clone(), value).write(location, root)
    }

    /// Raises a new exception built by the parameterless constructor `ctor`.
    pub fn throw_new(&mut self, state: ExecutionState, ctor: MethodId) -> Result<ExecutionState, EngineError> {
        let stack = state.stack().to_vec();
        let built = self.call_constructor(state.clear_stack(), ctor)?;
        if built.is_thrown() {
            return Ok(built);
        }
        let exception = built
            .stack()
            .last()
            .cloned()
            .ok_or_else(|| self.invalid("exception constructor produced no instance"))?;
        trace!(exception = %self.meta().type_name(exception.ty()), "guest throw");
        Ok(built.with_stack(stack).with_exception(exception))
    }
}

/// Outermost field and element reads in `e`, skipping addresses.
fn collect_heap_reads(e: &Expr, out: &mut Vec<Expr>) {
    match e.kind() {
        ExprKind::Field { .. } | ExprKind::Index { .. } => {
            if !out.contains(e) {
                out.push(e.clone());
            }
        }
        ExprKind::AddressOf(_) => {}
        _ => {
            for c in e.children() {
                collect_heap_reads(c, out);
            }
        }
    }
}

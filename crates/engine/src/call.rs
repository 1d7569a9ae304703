//! Call resolution.
//!
//! A call is resolved in a fixed order: interface-level executors and
//! opaque interfaces, the null-receiver check, `constrained.` and delegate
//! dispatch, virtual dispatch on the proven receiver type, alternate
//! implementations, special executors, pure methods, opaque boundaries and
//! finally interpretation of the callee's body.

use symil_common::{HostFn, MethodId, MethodImpl, TypeId};
use tracing::{debug, trace};

use crate::convert::{force_convert, unwrap_address_of};
use crate::error::EngineError;
use crate::executor::{Executor, Site};
use crate::expr::{Expr, ExprKind};
use crate::registry::CallSite;
use crate::resolve::ResolveMode;
use crate::simplify::is_pure;
use crate::state::ExecutionState;

impl Executor<'_> {
    /// Calls `method` with the receiver and arguments on top of the stack.
    /// The return value, if any, is pushed on the resulting state.
    pub fn call_method(
        &mut self,
        state: ExecutionState,
        method: MethodId,
        virtual_site: bool,
    ) -> Result<ExecutionState, EngineError> {
        self.dispatch(state, method, virtual_site, None)
    }

    pub(crate) fn dispatch(
        &mut self,
        state: ExecutionState,
        method: MethodId,
        virtual_site: bool,
        constrained: Option<TypeId>,
    ) -> Result<ExecutionState, EngineError> {
        let meta = self.meta();
        let def = meta.method(method);
        let arity = def.params.len() + usize::from(!def.is_static);
        let popped = state
            .peek(arity)
            .ok_or_else(|| {
                self.invalid(format!(
                    "stack underflow calling {}: need {arity}, have {}",
                    meta.method_name(method),
                    state.stack().len()
                ))
            })?
            .to_vec();
        let state = state.replace_top(arity, std::iter::empty());

        let mut popped = popped.into_iter();
        let this = if def.is_static {
            None
        } else {
            popped
                .next()
                .map(|r| self.resolve(&unwrap_address_of(&r), &state, ResolveMode::Default))
        };
        let args = self.convert_args(&state, popped, method);
        self.resolve_call(state, method, this, args, virtual_site, constrained)
    }

    fn convert_args(
        &self,
        state: &ExecutionState,
        args: impl Iterator<Item = Expr>,
        method: MethodId,
    ) -> Vec<Expr> {
        let meta = self.meta();
        args.zip(&meta.method(method).params)
            .map(|(a, p)| {
                let a = self.resolve(&a, state, ResolveMode::Default);
                self.simplify(&force_convert(meta, &a, p.ty))
            })
            .collect()
    }

    fn resolve_call(
        &mut self,
        state: ExecutionState,
        mut method: MethodId,
        this: Option<Expr>,
        args: Vec<Expr>,
        mut virtual_site: bool,
        constrained: Option<TypeId>,
    ) -> Result<ExecutionState, EngineError> {
        let meta = self.meta();
        trace!(callee = %meta.method_name(method), virtual_site, "call");

        if meta.is_interface(meta.method(method).declaring) {
            if let Some(alternate) = self.registry().replacement(meta, method) {
                return self.call_alternate(state, alternate, this, args);
            }
            if let Some(done) = self.run_executor(&state, method, this.as_ref(), &args)? {
                return Ok(done);
            }
            if self.registry().is_opaque_interface_method(meta, method) {
                return Ok(self.record_opaque(state, method, this, args));
            }
        }

        if let Some(receiver) = &this {
            if self.resolve(receiver, &state, ResolveMode::Full).is_null_constant() {
                let ctor = meta.corlib().null_reference_ctor;
                return self.throw_new(state, ctor);
            }
        }

        if let Some(ty) = constrained {
            if let Some(target) = meta.resolve_virtual(method, ty) {
                method = target;
                virtual_site = false;
            }
        }

        if let Some(receiver) = &this {
            if let Some(done) = self.invoke_delegate(&state, method, receiver, &args)? {
                return Ok(done);
            }
        }

        if virtual_site && meta.method(method).is_overridable() {
            let receiver = this
                .as_ref()
                .ok_or_else(|| self.invalid("virtual call without a receiver"))?;
            method = self.devirtualize(&state, method, receiver)?;
        }

        if let Some(alternate) = self.registry().replacement(meta, method) {
            return self.call_alternate(state, alternate, this, args);
        }
        if let Some(done) = self.run_executor(&state, method, this.as_ref(), &args)? {
            return Ok(done);
        }

        let def = meta.method(method);
        if is_pure(meta, method) {
            let values = self.constant_args(&state, this.as_ref(), &args);
            match (&def.implementation, values) {
                (MethodImpl::Host(f), Some(values)) => {
                    let result = self.evaluate_host(method, *f, &values, def.ret)?;
                    return Ok(self.push_result(state, result));
                }
                (MethodImpl::Il(_), Some(_)) => return self.interpret(state, method, this, args),
                _ => return Ok(self.push_call(state, method, this, args)),
            }
        }

        if self.registry().is_opaque(meta, method) {
            return Ok(self.record_opaque(state, method, this, args));
        }

        match &def.implementation {
            MethodImpl::Il(_) => self.interpret(state, method, this, args),
            MethodImpl::Host(f) => match self.constant_args(&state, this.as_ref(), &args) {
                Some(values) => {
                    let result = self.evaluate_host(method, *f, &values, def.ret)?;
                    Ok(self.push_result(state, result))
                }
                None => Ok(self.push_call(state, method, this, args)),
            },
            MethodImpl::Native | MethodImpl::Runtime => Ok(self.record_opaque(state, method, this, args)),
            MethodImpl::Abstract => Err(self.missing_body(method)),
        }
    }

    /// The implementation a virtual call on `receiver` reaches.
    pub(crate) fn devirtualize(
        &self,
        state: &ExecutionState,
        method: MethodId,
        receiver: &Expr,
    ) -> Result<MethodId, EngineError> {
        let meta = self.meta();
        let declared = receiver.ty();
        let runtime = if meta.is_sealed(declared) && !meta.is_interface(declared) {
            Some(declared)
        } else {
            self.prove_type(receiver, state)
        };
        let runtime = runtime.ok_or_else(|| {
            self.unprovable(format!(
                "receiver type of {} for {}",
                receiver.render(meta),
                meta.method_name(method)
            ))
        })?;
        meta.resolve_virtual(method, runtime).ok_or_else(|| {
            self.invalid(format!(
                "{} does not implement {}",
                meta.type_name(runtime),
                meta.method_name(method)
            ))
        })
    }

    /// Calls through a delegate whose target and method are known.
    fn invoke_delegate(
        &mut self,
        state: &ExecutionState,
        method: MethodId,
        receiver: &Expr,
        args: &[Expr],
    ) -> Result<Option<ExecutionState>, EngineError> {
        let meta = self.meta();
        let def = meta.method(method);
        if !meta.is_delegate(def.declaring) || def.name != "Invoke" {
            return Ok(None);
        }
        let delegate = self.resolve(receiver, state, ResolveMode::Full);
        let ExprKind::New { args: bound, .. } = delegate.kind() else {
            return Ok(None);
        };
        let [target, pointer] = bound.as_slice() else {
            return Ok(None);
        };
        let ExprKind::FunctionPointer { method: callee, .. } = pointer.kind() else {
            return Ok(None);
        };
        let callee = *callee;
        debug!(
            delegate = %meta.type_name(delegate.ty()),
            callee = %meta.method_name(callee),
            "delegate invoke"
        );
        let this = (!meta.method(callee).is_static).then(|| target.clone());
        let virtual_site = meta.method(callee).is_overridable();
        self.resolve_call(state.clone(), callee, this, args.to_vec(), virtual_site, None)
            .map(Some)
    }

    /// Interprets `alternate` with the receiver passed as its first argument.
    fn call_alternate(
        &mut self,
        state: ExecutionState,
        alternate: MethodId,
        this: Option<Expr>,
        args: Vec<Expr>,
    ) -> Result<ExecutionState, EngineError> {
        debug!(alternate = %self.meta().method_name(alternate), "alternate implementation");
        let args: Vec<Expr> = this.into_iter().chain(args).collect();
        self.resolve_call(state, alternate, None, args, false, None)
    }

    fn run_executor(
        &mut self,
        state: &ExecutionState,
        method: MethodId,
        this: Option<&Expr>,
        args: &[Expr],
    ) -> Result<Option<ExecutionState>, EngineError> {
        let Some(executor) = self.registry().executor_for(self.meta(), method) else {
            return Ok(None);
        };
        let call = CallSite { method, this, args };
        let done = executor.execute(self, state.clone(), &call)?;
        if done.is_none() {
            trace!(callee = %self.meta().method_name(method), "executor declined");
        }
        Ok(done)
    }

    /// Fully resolved receiver and arguments, when all of them are constant.
    fn constant_args(&self, state: &ExecutionState, this: Option<&Expr>, args: &[Expr]) -> Option<Vec<Expr>> {
        this.into_iter()
            .chain(args)
            .map(|a| {
                let v = self.resolve(a, state, ResolveMode::Full);
                v.is_constant().then_some(v)
            })
            .collect()
    }

    fn evaluate_host(
        &self,
        method: MethodId,
        f: HostFn,
        values: &[Expr],
        ty: TypeId,
    ) -> Result<Expr, EngineError> {
        let constants: Vec<_> = values.iter().filter_map(|v| v.as_constant().cloned()).collect();
        let result = f(&constants).map_err(|e| self.host_error(method, e.0))?;
        trace!(callee = %self.meta().method_name(method), result = %result, "host evaluation");
        if result.type_id() == ty {
            Ok(Expr::constant(result))
        } else {
            Ok(Expr::typed_constant(result, ty))
        }
    }

    fn push_result(&self, state: ExecutionState, result: Expr) -> ExecutionState {
        if result.ty() == TypeId::VOID {
            state
        } else {
            state.push(result)
        }
    }

    /// Pushes the call itself as the value of a side-effect-free call.
    fn push_call(&self, state: ExecutionState, method: MethodId, this: Option<Expr>, args: Vec<Expr>) -> ExecutionState {
        let ret = self.meta().method(method).ret;
        if ret == TypeId::VOID {
            return state;
        }
        state.push(Expr::call(method, this, args, ret))
    }

    /// Records a call the engine does not look into. A returned value is
    /// captured in a fresh root.
    fn record_opaque(
        &mut self,
        state: ExecutionState,
        method: MethodId,
        this: Option<Expr>,
        args: Vec<Expr>,
    ) -> ExecutionState {
        let meta = self.meta();
        let ret = meta.method(method).ret;
        debug!(callee = %meta.method_name(method), "opaque call");
        let call = Expr::call(method, this, args, ret);
        if ret == TypeId::VOID {
            return state.add_side_effect(None, call);
        }
        let root = self.fresh_root(ret, "sideEffectParam_");
        state
            .add_side_effect(None, Expr::assign(root.clone(), call))
            .push(root)
    }

    /// Interprets the body of `method` on a fresh frame and pushes its
    /// return value onto the caller's stack.
    pub(crate) fn interpret(
        &mut self,
        state: ExecutionState,
        method: MethodId,
        this: Option<Expr>,
        args: Vec<Expr>,
    ) -> Result<ExecutionState, EngineError> {
        let body = self
            .engine()
            .decoded(method)
            .map_err(|e| self.invalid(e.to_string()))?
            .ok_or_else(|| self.missing_body(method))?;
        self.enter_call()?;
        debug!(
            method = %self.meta().method_name(method),
            depth = self.call_depth(),
            "interpret"
        );

        let state = self.snapshot_stack(state);
        let caller_stack = state.stack().to_vec();
        let caller_site = self.site();
        let (frame, entry) = self.bind_frame(state.clear_stack(), method, body, this, args);
        self.set_site(Site { method, at: 0 });
        let outcome = self.run(&frame, entry);
        self.set_site(caller_site);
        self.leave_call();

        let done = outcome?;
        if done.is_thrown() {
            return Ok(done);
        }
        let mut stack = caller_stack;
        stack.extend(done.stack().iter().cloned());
        Ok(done.with_stack(stack))
    }

    /// Allocates an object of the constructor's type, runs the constructor
    /// on it and pushes the new instance.
    pub fn call_constructor(&mut self, state: ExecutionState, ctor: MethodId) -> Result<ExecutionState, EngineError> {
        let meta = self.meta();
        let def = meta.method(ctor);
        let ty = def.declaring;
        let arity = def.params.len();
        let popped = state
            .peek(arity)
            .ok_or_else(|| {
                self.invalid(format!(
                    "stack underflow constructing {}: need {arity}, have {}",
                    meta.type_name(ty),
                    state.stack().len()
                ))
            })?
            .to_vec();
        let state = state.replace_top(arity, std::iter::empty());
        let args = self.convert_args(&state, popped.into_iter(), ctor);
        trace!(ctor = %meta.method_name(ctor), "construct");

        if meta.is_delegate(ty) {
            return Ok(state.push(Expr::new_object(ctor, args, ty)));
        }
        if let (true, MethodImpl::Host(f)) = (is_pure(meta, ctor), &def.implementation) {
            if let Some(values) = self.constant_args(&state, None, &args) {
                let value = self.evaluate_host(ctor, *f, &values, ty)?;
                return Ok(state.push(value));
            }
        }

        let this = self.fresh_object(ty);
        let state = state.write(this.clone(), Expr::new_object(ctor, args.clone(), ty));
        let state = self.default_fields(state, &this);
        let state = match self.run_executor(&state, ctor, Some(&this), &args)? {
            Some(done) => done,
            None => match &def.implementation {
                MethodImpl::Il(_) => self.interpret(state, ctor, Some(this.clone()), args)?,
                MethodImpl::Abstract => return Err(self.missing_body(ctor)),
                MethodImpl::Host(_) | MethodImpl::Native | MethodImpl::Runtime => {
                    self.record_opaque(state, ctor, Some(this.clone()), args)
                }
            },
        };
        if state.is_thrown() {
            return Ok(state);
        }
        Ok(state.push(this))
    }
}

//! Method execution contexts.

use std::sync::Arc;

use symil_common::MethodId;

use crate::convert::force_convert;
use crate::disassembly::DecodedBody;
use crate::executor::Executor;
use crate::expr::Expr;
use crate::state::ExecutionState;

/// A decoded body bound to freshly named slots for `this`, parameters and
/// locals. One per interpreted call.
#[derive(Debug)]
pub(crate) struct Frame {
    pub method: MethodId,
    pub body: Arc<DecodedBody>,
    this: Option<Expr>,
    params: Vec<Expr>,
    locals: Vec<Expr>,
}

impl Frame {
    /// Argument slot `index`; `0` is `this` for instance methods.
    pub fn arg(&self, index: u16) -> Option<&Expr> {
        let index = usize::from(index);
        match &self.this {
            Some(this) if index == 0 => Some(this),
            Some(_) => self.params.get(index - 1),
            None => self.params.get(index),
        }
    }

    pub fn local(&self, index: u16) -> Option<&Expr> {
        self.locals.get(usize::from(index))
    }
}

impl Executor<'_> {
    /// Creates the frame for `method` and binds its slots: arguments
    /// converted to the parameter types, locals to their zero values.
    pub(crate) fn bind_frame(
        &mut self,
        state: ExecutionState,
        method: MethodId,
        body: Arc<DecodedBody>,
        this: Option<Expr>,
        args: Vec<Expr>,
    ) -> (Frame, ExecutionState) {
        let meta = self.meta();
        let def = meta.method(method);
        let n = self.next_id();
        let mut bindings = Vec::with_capacity(args.len() + 1);

        let this_slot = this.map(|value| {
            let slot = Expr::local(value.ty(), &format!("param_this__{n}"));
            bindings.push((slot.clone(), value));
            slot
        });
        let params: Vec<Expr> = def
            .params
            .iter()
            .zip(args)
            .map(|(p, arg)| {
                let slot = Expr::local(p.ty, &format!("param_{}__{n}", p.name));
                let value = self.simplify(&force_convert(meta, &arg, p.ty));
                bindings.push((slot.clone(), value));
                slot
            })
            .collect();
        let mut state = state.write_all(bindings);

        let mut locals = Vec::with_capacity(body.body.locals.len());
        for (i, ty) in body.body.locals.iter().enumerate() {
            let slot = Expr::local(*ty, &format!("local_{i}__{n}"));
            let (next, zero) = self.zero_value(state, *ty);
            state = next.write(slot.clone(), zero);
            locals.push(slot);
        }

        let frame = Frame {
            method,
            body,
            this: this_slot,
            params,
            locals,
        };
        (frame, state)
    }
}

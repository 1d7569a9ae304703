//! Built-in special executors: the associative-container domain.
//!
//! Dictionaries constructed by interpreted code are *tracked*: their
//! constructor sets the `_tracked` field, and every entry lives in the
//! store under two locations keyed by the constant key:
//!
//! - presence: `dict.ContainsKey(key)`, a `bool`
//! - value: `dict[key]`
//!
//! Because both are ordinary store entries, merging two paths yields
//! guarded membership. Dictionaries that arrive as inputs are not tracked;
//! their executors decline and the calls become opaque boundaries.

use symil_common::{Metadata, MethodId, TypeId};

use crate::convert::unwrap_address_of;
use crate::error::EngineError;
use crate::executor::Executor;
use crate::expr::{BinaryOp, Expr, ExprKind};
use crate::registry::{CallSite, RegistryBuilder};
use crate::resolve::ResolveMode;
use crate::state::ExecutionState;

type Outcome = Result<Option<ExecutionState>, EngineError>;

pub(crate) fn install(builder: RegistryBuilder, meta: &Metadata) -> RegistryBuilder {
    let lib = meta.corlib();
    let mut b = builder
        .mark_opaque_interface(lib.idictionary, None)
        .register_executor(lib.dictionary_ctor, construct)
        .register_executor(lib.dictionary_get_enumerator, get_enumerator)
        .register_executor(lib.key_value_pair_key, pair_key)
        .register_executor(lib.key_value_pair_value, pair_value);
    for m in [lib.idictionary_methods, lib.dictionary_methods] {
        b = b
            .register_executor(m.add, add)
            .register_executor(m.set_item, set_item)
            .register_executor(m.get_item, get_item)
            .register_executor(m.contains_key, contains_key)
            .register_executor(m.try_get_value, try_get_value)
            .register_executor(m.remove, remove)
            .register_executor(m.get_count, count);
    }
    b
}

/// A tracked dictionary instance.
struct Dict {
    this: Expr,
    contains_key: MethodId,
    value_ty: TypeId,
}

enum Presence {
    Present,
    Absent,
    /// Present exactly when the expression holds.
    Maybe(Expr),
}

impl Presence {
    fn as_expr(&self) -> Expr {
        match self {
            Presence::Present => Expr::bool(true),
            Presence::Absent => Expr::bool(false),
            Presence::Maybe(c) => c.clone(),
        }
    }
}

impl Dict {
    /// The receiver, if it is a dictionary created by interpreted code.
    fn tracked(exec: &Executor<'_>, state: &ExecutionState, call: &CallSite<'_>) -> Option<Dict> {
        let meta = exec.meta();
        let this = exec.resolve(call.this?, state, ResolveMode::Default);
        this.as_placeholder()?;
        let flag = meta.find_field(this.ty(), "_tracked").ok()?;
        let tracked = exec.resolve(
            &Expr::field(Some(this.clone()), flag, TypeId::BOOL),
            state,
            ResolveMode::Full,
        );
        if tracked.as_bool() != Some(true) {
            return None;
        }
        let contains_key = meta.find_method(this.ty(), "ContainsKey", None).ok()?;
        let get_item = meta.find_method(this.ty(), "get_Item", None).ok()?;
        Some(Dict {
            this,
            contains_key,
            value_ty: meta.method(get_item).ret,
        })
    }

    fn presence_location(&self, key: &Expr) -> Expr {
        Expr::call(
            self.contains_key,
            Some(self.this.clone()),
            vec![key.clone()],
            TypeId::BOOL,
        )
    }

    fn value_location(&self, key: &Expr) -> Expr {
        Expr::index(self.this.clone(), key.clone(), self.value_ty)
    }

    fn presence(&self, exec: &Executor<'_>, state: &ExecutionState, key: &Expr) -> Presence {
        let Some(stored) = state.read(&self.presence_location(key)) else {
            return Presence::Absent;
        };
        let v = exec.resolve(stored, state, ResolveMode::Full);
        match v.as_bool() {
            Some(true) => Presence::Present,
            Some(false) => Presence::Absent,
            None => Presence::Maybe(v),
        }
    }

    /// Keys bound in this dictionary, in first-insertion order.
    fn keys(&self, state: &ExecutionState) -> Vec<Expr> {
        state
            .locations()
            .into_iter()
            .filter_map(|loc| match loc.kind() {
                ExprKind::Call {
                    method,
                    target: Some(t),
                    args,
                } if *method == self.contains_key && *t == self.this => args.first().cloned(),
                _ => None,
            })
            .collect()
    }

    fn store(&self, state: ExecutionState, key: &Expr, value: Expr) -> ExecutionState {
        state
            .write(self.presence_location(key), Expr::bool(true))
            .write(self.value_location(key), value)
    }
}

fn constant_key(exec: &Executor<'_>, state: &ExecutionState, call: &CallSite<'_>) -> Result<Expr, EngineError> {
    let raw = call
        .args
        .first()
        .ok_or_else(|| exec.invalid("dictionary call without a key"))?;
    let key = exec.resolve(raw, state, ResolveMode::Full);
    if key.is_constant() {
        Ok(key)
    } else {
        Err(exec.unsupported(format!(
            "symbolic key {} on a tracked dictionary",
            key.render(exec.meta())
        )))
    }
}

fn exception(exec: &Executor<'_>, ctor: MethodId) -> Expr {
    Expr::new_object(ctor, Vec::new(), exec.meta().method(ctor).declaring)
}

fn construct(exec: &mut Executor<'_>, state: ExecutionState, call: &CallSite<'_>) -> Outcome {
    let Some(this) = call.this else {
        return Ok(None);
    };
    let flag = exec
        .meta()
        .find_field(this.ty(), "_tracked")
        .map_err(|e| exec.invalid(e.to_string()))?;
    let location = Expr::field(Some(this.clone()), flag, TypeId::BOOL);
    Ok(Some(state.write(location, Expr::bool(true))))
}

fn add(exec: &mut Executor<'_>, state: ExecutionState, call: &CallSite<'_>) -> Outcome {
    let Some(dict) = Dict::tracked(exec, &state, call) else {
        return Ok(None);
    };
    let key = constant_key(exec, &state, call)?;
    let value = value_arg(exec, &state, call)?;
    let argument = exec.meta().corlib().argument_exception_ctor;
    let (state, value) = match dict.presence(exec, &state, &key) {
        Presence::Present => return exec.throw_new(state, argument).map(Some),
        Presence::Absent => (state, value),
        Presence::Maybe(c) => {
            // an existing entry is left alone on the path that throws
            let old = exec.resolve(&dict.value_location(&key), &state, ResolveMode::Default);
            let kept = exec.simplify(&Expr::conditional(c.clone(), old, value));
            let state = state.add_side_effect(Some(c), Expr::throw(exception(exec, argument)));
            (state, kept)
        }
    };
    let state = exec.snapshot_stack(state);
    Ok(Some(dict.store(state, &key, value)))
}

fn value_arg(exec: &Executor<'_>, state: &ExecutionState, call: &CallSite<'_>) -> Result<Expr, EngineError> {
    let raw = call
        .args
        .get(1)
        .ok_or_else(|| exec.invalid("dictionary store without a value"))?;
    Ok(exec.resolve(raw, state, ResolveMode::Default))
}

fn set_item(exec: &mut Executor<'_>, state: ExecutionState, call: &CallSite<'_>) -> Outcome {
    let Some(dict) = Dict::tracked(exec, &state, call) else {
        return Ok(None);
    };
    let key = constant_key(exec, &state, call)?;
    let value = value_arg(exec, &state, call)?;
    let state = exec.snapshot_stack(state);
    Ok(Some(dict.store(state, &key, value)))
}

fn get_item(exec: &mut Executor<'_>, state: ExecutionState, call: &CallSite<'_>) -> Outcome {
    let Some(dict) = Dict::tracked(exec, &state, call) else {
        return Ok(None);
    };
    let key = constant_key(exec, &state, call)?;
    let missing = exec.meta().corlib().key_not_found_ctor;
    let state = match dict.presence(exec, &state, &key) {
        Presence::Present => state,
        Presence::Absent => return exec.throw_new(state, missing).map(Some),
        Presence::Maybe(c) => {
            let absent = exec.simplify(&Expr::not(c));
            state.add_side_effect(Some(absent), Expr::throw(exception(exec, missing)))
        }
    };
    let value = exec.resolve(&dict.value_location(&key), &state, ResolveMode::Default);
    Ok(Some(state.push(value)))
}

fn contains_key(exec: &mut Executor<'_>, state: ExecutionState, call: &CallSite<'_>) -> Outcome {
    let Some(dict) = Dict::tracked(exec, &state, call) else {
        return Ok(None);
    };
    let key = constant_key(exec, &state, call)?;
    let present = dict.presence(exec, &state, &key).as_expr();
    Ok(Some(state.push(present)))
}

fn try_get_value(exec: &mut Executor<'_>, state: ExecutionState, call: &CallSite<'_>) -> Outcome {
    let Some(dict) = Dict::tracked(exec, &state, call) else {
        return Ok(None);
    };
    let key = constant_key(exec, &state, call)?;
    let out = call
        .args
        .get(1)
        .map(unwrap_address_of)
        .ok_or_else(|| exec.invalid("TryGetValue without an out argument"))?;
    let stored = || exec.resolve(&dict.value_location(&key), &state, ResolveMode::Default);
    let zero = Expr::default_of(dict.value_ty);
    let presence = dict.presence(exec, &state, &key);
    let written = match &presence {
        Presence::Present => stored(),
        Presence::Absent => zero,
        Presence::Maybe(c) => Expr::conditional(c.clone(), stored(), zero),
    };
    let state = exec.set_var(state, &out, &written)?;
    Ok(Some(state.push(presence.as_expr())))
}

fn remove(exec: &mut Executor<'_>, state: ExecutionState, call: &CallSite<'_>) -> Outcome {
    let Some(dict) = Dict::tracked(exec, &state, call) else {
        return Ok(None);
    };
    let key = constant_key(exec, &state, call)?;
    let was_present = dict.presence(exec, &state, &key).as_expr();
    let state = exec
        .snapshot_stack(state)
        .write(dict.presence_location(&key), Expr::bool(false));
    Ok(Some(state.push(was_present)))
}

fn count(exec: &mut Executor<'_>, state: ExecutionState, call: &CallSite<'_>) -> Outcome {
    let Some(dict) = Dict::tracked(exec, &state, call) else {
        return Ok(None);
    };
    let mut total = Expr::i32(0);
    for key in dict.keys(&state) {
        let one = Expr::conditional(
            dict.presence(exec, &state, &key).as_expr(),
            Expr::i32(1),
            Expr::i32(0),
        );
        total = Expr::binary(BinaryOp::Add, total, one);
    }
    let total = exec.simplify(&total);
    Ok(Some(state.push(total)))
}

/// Materializes the present entries into a pair array and constructs the
/// interpreted array enumerator over it.
fn get_enumerator(exec: &mut Executor<'_>, state: ExecutionState, call: &CallSite<'_>) -> Outcome {
    let Some(dict) = Dict::tracked(exec, &state, call) else {
        return Ok(None);
    };
    let meta = exec.meta();
    let enumerator = meta.method(call.method).ret;
    let shape = || -> Option<(MethodId, TypeId, TypeId, MethodId)> {
        let items = meta.find_field(enumerator, "items").ok()?;
        let array = meta.field(items).ty;
        let pair = meta.element_type(array)?;
        let pair_ctor = meta.find_method(pair, ".ctor", None).ok()?;
        let enum_ctor = meta.find_method(enumerator, ".ctor", None).ok()?;
        Some((pair_ctor, pair, array, enum_ctor))
    };
    let (pair_ctor, pair, array, enum_ctor) =
        shape().ok_or_else(|| exec.invalid("malformed dictionary enumerator type"))?;

    let mut items = Vec::new();
    for key in dict.keys(&state) {
        match dict.presence(exec, &state, &key) {
            Presence::Present => {
                let value = exec.resolve(&dict.value_location(&key), &state, ResolveMode::Full);
                items.push(Expr::new_object(pair_ctor, vec![key, value], pair));
            }
            Presence::Absent => {}
            Presence::Maybe(_) => {
                return Err(exec.unsupported(format!(
                    "enumeration of conditionally present key {}",
                    key.render(meta)
                )))
            }
        }
    }
    let state = state.push(Expr::new_array_init(array, items));
    exec.call_constructor(state, enum_ctor).map(Some)
}

/// Component `index` of a pair built by its constructor.
fn pair_component(exec: &Executor<'_>, state: &ExecutionState, call: &CallSite<'_>, index: usize) -> Option<Expr> {
    let pair = exec.resolve(call.this?, state, ResolveMode::Full);
    let ExprKind::New { ctor, args } = pair.kind() else {
        return None;
    };
    let lib = exec.meta().corlib();
    let def = exec.meta().method(*ctor);
    let is_pair_ctor = *ctor == lib.key_value_pair_ctor
        || def.generic_definition == Some(lib.key_value_pair_ctor);
    if !is_pair_ctor {
        return None;
    }
    args.get(index).cloned()
}

fn pair_key(exec: &mut Executor<'_>, state: ExecutionState, call: &CallSite<'_>) -> Outcome {
    Ok(pair_component(exec, &state, call, 0).map(|k| state.push(k)))
}

fn pair_value(exec: &mut Executor<'_>, state: ExecutionState, call: &CallSite<'_>) -> Outcome {
    Ok(pair_component(exec, &state, call, 1).map(|v| state.push(v)))
}

//! Special executors, opaque boundaries and alternate implementations.
//!
//! A [`Registry`] is assembled once with a [`RegistryBuilder`] and then
//! shared read-only by every execution. Lookups fall back from a method to
//! the interface methods it implements and to its generic definition, so
//! registering the open member of a generic type covers every
//! instantiation.

use std::fmt;
use std::sync::Arc;

use rustc_hash::FxHashMap;
use symil_common::{Metadata, MethodDef, MethodId, MethodImpl, TypeId};

use crate::error::EngineError;
use crate::executor::Executor;
use crate::expr::Expr;
use crate::state::ExecutionState;

/// Receiver and converted arguments of a call being dispatched.
#[derive(Debug, Clone, Copy)]
pub struct CallSite<'a> {
    pub method: MethodId,
    pub this: Option<&'a Expr>,
    pub args: &'a [Expr],
}

/// A hand-written state transition replacing the interpretation of a
/// method.
///
/// Returning `Ok(None)` declines the call; resolution then continues as if
/// no executor were registered. A result state must carry the return value
/// (if any) pushed on top of the caller's stack.
pub trait SpecialExecutor: Send + Sync {
    fn execute(
        &self,
        exec: &mut Executor<'_>,
        state: ExecutionState,
        call: &CallSite<'_>,
    ) -> Result<Option<ExecutionState>, EngineError>;
}

impl<F> SpecialExecutor for F
where
    F: Fn(&mut Executor<'_>, ExecutionState, &CallSite<'_>) -> Result<Option<ExecutionState>, EngineError>
        + Send
        + Sync,
{
    fn execute(
        &self,
        exec: &mut Executor<'_>,
        state: ExecutionState,
        call: &CallSite<'_>,
    ) -> Result<Option<ExecutionState>, EngineError> {
        self(exec, state, call)
    }
}

/// Restricts an opaque interface to some of its methods.
pub type MethodFilter = Arc<dyn Fn(&MethodDef) -> bool + Send + Sync>;

#[derive(Clone, Default)]
pub struct Registry {
    executors: FxHashMap<MethodId, Arc<dyn SpecialExecutor>>,
    opaque: FxHashMap<TypeId, Option<MethodFilter>>,
    replacements: FxHashMap<MethodId, MethodId>,
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("executors", &self.executors.len())
            .field("opaque", &self.opaque.len())
            .field("replacements", &self.replacements)
            .finish()
    }
}

impl Registry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::new()
    }

    /// The executor for `method`: registered on the method itself, on an
    /// interface method it implements, or on its generic definition.
    pub fn executor_for(&self, meta: &Metadata, method: MethodId) -> Option<Arc<dyn SpecialExecutor>> {
        let direct = |m: MethodId| {
            self.executors.get(&m).or_else(|| {
                meta.method(m)
                    .generic_definition
                    .and_then(|open| self.executors.get(&open))
            })
        };
        direct(method)
            .or_else(|| {
                meta.implemented_interface_methods(method)
                    .into_iter()
                    .find_map(direct)
            })
            .cloned()
    }

    /// Whether calls to `method` are recorded instead of executed: methods
    /// of a registered interface (subject to its filter) and methods
    /// implemented outside managed code.
    pub fn is_opaque(&self, meta: &Metadata, method: MethodId) -> bool {
        let def = meta.method(method);
        if matches!(def.implementation, MethodImpl::Native | MethodImpl::Runtime) {
            return true;
        }
        self.is_opaque_interface_method(meta, method)
    }

    pub fn is_opaque_interface_method(&self, meta: &Metadata, method: MethodId) -> bool {
        let def = meta.method(method);
        let declaring = meta.ty(def.declaring);
        [Some(def.declaring), declaring.generic_definition]
            .into_iter()
            .flatten()
            .filter_map(|t| self.opaque.get(&t))
            .any(|filter| filter.as_ref().is_none_or(|f| f(def)))
    }

    /// The alternate implementation registered for `method` or its generic
    /// definition.
    pub fn replacement(&self, meta: &Metadata, method: MethodId) -> Option<MethodId> {
        self.replacements.get(&method).copied().or_else(|| {
            meta.method(method)
                .generic_definition
                .and_then(|open| self.replacements.get(&open).copied())
        })
    }
}

#[derive(Default)]
pub struct RegistryBuilder {
    registry: Registry,
}

impl RegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Treats calls to methods of `interface` as opaque boundaries. With a
    /// filter, only the methods it accepts are opaque.
    pub fn mark_opaque_interface(mut self, interface: TypeId, filter: Option<MethodFilter>) -> Self {
        self.registry.opaque.insert(interface, filter);
        self
    }

    pub fn register_executor<F>(self, method: MethodId, executor: F) -> Self
    where
        F: Fn(&mut Executor<'_>, ExecutionState, &CallSite<'_>) -> Result<Option<ExecutionState>, EngineError>
            + Send
            + Sync
            + 'static,
    {
        self.register(method, Arc::new(executor))
    }

    pub fn register(mut self, method: MethodId, executor: Arc<dyn SpecialExecutor>) -> Self {
        self.registry.executors.insert(method, executor);
        self
    }

    /// Redirects calls of `original` to `alternate`, a static method taking
    /// the receiver (if any) as its first parameter.
    pub fn replace_implementation(mut self, original: MethodId, alternate: MethodId) -> Self {
        self.registry.replacements.insert(original, alternate);
        self
    }

    /// Installs the associative-container domain for the core library's
    /// dictionary types.
    pub fn with_builtin_executors(self, meta: &Metadata) -> Self {
        crate::special::install(self, meta)
    }

    pub fn build(self) -> Registry {
        self.registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use symil_common::MetadataBuilder;

    fn decline(
        _: &mut Executor<'_>,
        _: ExecutionState,
        _: &CallSite<'_>,
    ) -> Result<Option<ExecutionState>, EngineError> {
        Ok(None)
    }

    #[test]
    fn executors_cover_instantiations() {
        let mut b = MetadataBuilder::new();
        let lib = b.metadata().corlib().clone();
        let d = b
            .instantiate(lib.dictionary, &[TypeId::STRING, TypeId::I32])
            .unwrap();
        let meta = b.finish().unwrap();
        let registry = Registry::builder()
            .register_executor(lib.dictionary_methods.add, decline)
            .build();
        let add = meta.find_method(d, "Add", None).unwrap();
        assert!(registry.executor_for(&meta, add).is_some());
        let remove = meta.find_method(d, "Remove", None).unwrap();
        assert!(registry.executor_for(&meta, remove).is_none());
    }

    #[test]
    fn interface_registration_reaches_implementations() {
        let mut b = MetadataBuilder::new();
        let lib = b.metadata().corlib().clone();
        let d = b
            .instantiate(lib.dictionary, &[TypeId::STRING, TypeId::I32])
            .unwrap();
        let meta = b.finish().unwrap();
        let registry = Registry::builder()
            .register_executor(lib.idictionary_methods.contains_key, decline)
            .build();
        let contains = meta.find_method(d, "ContainsKey", None).unwrap();
        assert!(registry.executor_for(&meta, contains).is_some());
    }

    #[test]
    fn opaque_interfaces_and_filters() {
        let mut b = MetadataBuilder::new();
        let lib = b.metadata().corlib().clone();
        let idict = b
            .instantiate(lib.idictionary, &[TypeId::STRING, TypeId::I32])
            .unwrap();
        let meta = b.finish().unwrap();
        let add = meta.find_method(idict, "Add", None).unwrap();
        let count = meta.find_method(idict, "get_Count", None).unwrap();

        let all = Registry::builder()
            .mark_opaque_interface(lib.idictionary, None)
            .build();
        assert!(all.is_opaque(&meta, add));

        let filtered = Registry::builder()
            .mark_opaque_interface(lib.idictionary, Some(Arc::new(|m: &MethodDef| m.name == "Add")))
            .build();
        assert!(filtered.is_opaque(&meta, add));
        assert!(!filtered.is_opaque(&meta, count));

        assert!(Registry::default().is_opaque(&meta, lib.dictionary_ctor));
        assert!(!Registry::default().is_opaque(&meta, lib.object_ctor));
    }

    #[test]
    fn replacements_follow_generic_definitions() {
        let mut b = MetadataBuilder::new();
        let lib = b.metadata().corlib().clone();
        let d = b
            .instantiate(lib.dictionary, &[TypeId::STRING, TypeId::I32])
            .unwrap();
        let meta = b.finish().unwrap();
        let registry = Registry::builder()
            .replace_implementation(lib.dictionary_methods.get_count, lib.object_ctor)
            .build();
        let count = meta.find_method(d, "get_Count", None).unwrap();
        assert_eq!(registry.replacement(&meta, count), Some(lib.object_ctor));
    }
}

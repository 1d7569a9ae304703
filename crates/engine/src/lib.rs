//! symil engine: symbolic execution of stack-machine method bodies.
//!
//! The engine runs a method over symbolic inputs and reduces it to
//! expression trees: the return value, the final values of every location
//! it wrote, and the guarded side effects it performed. It has:
//! - An [`ExecutionState`] threaded through every instruction by value
//! - A resolver that substitutes known values into expressions
//! - A simplifier that folds constants and normalizes logic
//! - A branch explorer that forks on undecided conditions and merges arms
//!   into conditional expressions
//! - A [`Registry`] of special executors and opaque boundaries
//!
//! # Usage
//!
//! ```
//! use std::sync::Arc;
//! use symil_common::{MetadataBuilder, TypeId};
//! use symil_engine::{Engine, Expr};
//!
//! let meta = Arc::new(MetadataBuilder::new().finish().unwrap());
//! let abs = meta
//!     .find_method(meta.corlib().math, "Abs", Some(&[TypeId::I32]))
//!     .unwrap();
//!
//! let engine = Engine::new(meta);
//! let done = engine.invoke(abs, vec![Expr::i32(-5)]).unwrap();
//! assert_eq!(engine.result(&done), Some(Expr::i32(5)));
//! ```

pub mod call;
pub mod config;
pub mod convert;
pub mod disassembly;
pub mod display;
pub mod error;
pub mod executor;
pub mod expr;
pub mod intern;
pub mod merge;
pub mod registry;
pub mod resolve;
pub mod simplify;
pub mod state;

mod frame;
mod interpreter;
mod special;

pub use config::Config;
pub use disassembly::{DecodeError, DecodedBody, DisassemblyCache};
pub use error::{EngineError, ErrorClass};
pub use executor::Executor;
pub use expr::{BinaryOp, Expr, ExprKind, Placeholder, UnaryOp};
pub use merge::{merge_branches, StackMismatch};
pub use registry::{CallSite, Registry, RegistryBuilder, SpecialExecutor};
pub use resolve::ResolveMode;
pub use state::{ExecutionState, SideEffect};

use std::sync::Arc;

use symil_common::{BodySource, Metadata, MethodId};
use tracing::debug_span;

/// Shared, read-only context for symbolic execution: metadata, body source,
/// registry, limits and the decoded-body cache.
///
/// An engine can serve many calls; each call gets its own [`Executor`].
pub struct Engine {
    meta: Arc<Metadata>,
    bodies: Arc<dyn BodySource>,
    registry: Arc<Registry>,
    config: Config,
    cache: DisassemblyCache,
}

impl Engine {
    /// An engine with the built-in executors and default limits, reading
    /// bodies from the metadata itself.
    pub fn new(meta: Arc<Metadata>) -> Self {
        let registry = Registry::builder().with_builtin_executors(&meta).build();
        Self {
            bodies: Arc::clone(&meta) as Arc<dyn BodySource>,
            meta,
            registry: Arc::new(registry),
            config: Config::default(),
            cache: DisassemblyCache::new(),
        }
    }

    pub fn with_registry(mut self, registry: Registry) -> Self {
        self.registry = Arc::new(registry);
        self
    }

    pub fn with_config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Reads method bodies from `bodies` instead of the metadata.
    pub fn with_body_source(mut self, bodies: Arc<dyn BodySource>) -> Self {
        self.bodies = bodies;
        self.cache = DisassemblyCache::new();
        self
    }

    pub fn meta(&self) -> &Metadata {
        &self.meta
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// A fresh executor for a top-level call into `entry`.
    pub fn executor(&self, entry: MethodId) -> Executor<'_> {
        Executor::new(self, entry)
    }

    /// The decoded body of `method`, cached across calls.
    pub fn decoded(&self, method: MethodId) -> Result<Option<Arc<DecodedBody>>, DecodeError> {
        self.cache.get(&*self.bodies, method)
    }

    /// Calls `method` with its receiver and arguments on top of `state`'s
    /// stack.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError`] when the method uses something the engine
    /// does not model, depends on an unprovable dispatch, is malformed, or
    /// trips one of the configured limits.
    pub fn call_method(
        &self,
        method: MethodId,
        state: ExecutionState,
        virtual_site: bool,
    ) -> Result<ExecutionState, EngineError> {
        let span = debug_span!("call_method", method = %self.meta.method_name(method));
        let _guard = span.enter();
        self.executor(method).call_method(state, method, virtual_site)
    }

    /// Allocates an instance and runs `ctor` with the arguments on top of
    /// `state`'s stack. The new instance is pushed on the result.
    pub fn call_constructor(&self, ctor: MethodId, state: ExecutionState) -> Result<ExecutionState, EngineError> {
        let span = debug_span!("call_constructor", ctor = %self.meta.method_name(ctor));
        let _guard = span.enter();
        self.executor(ctor).call_constructor(state, ctor)
    }

    /// Calls `method` with `args` (receiver first for instance methods) on
    /// an empty state.
    pub fn invoke(&self, method: MethodId, args: Vec<Expr>) -> Result<ExecutionState, EngineError> {
        self.call_method(method, ExecutionState::with_args(args), false)
    }

    /// The fully resolved value on top of a finished call's stack.
    pub fn result(&self, state: &ExecutionState) -> Option<Expr> {
        let top = state.stack().last()?;
        Some(resolve::resolve(top, state, &self.meta, ResolveMode::Full))
    }
}

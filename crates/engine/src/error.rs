//! Errors raised while symbolically executing a method.
//!
//! Guest exceptions are not errors: they are recorded in the execution
//! state as `throw` side effects. An [`EngineError`] aborts the top-level
//! call. Every variant names the method being executed and the instruction
//! index (`at`) where the problem was detected.

use thiserror::Error;

/// Coarse classification of an [`EngineError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Unsupported,
    Unprovable,
    InvalidProgram,
    MissingBody,
    /// One of the configured resource limits tripped.
    Limit,
    Host,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    /// An instruction or construct the engine does not model.
    #[error("unsupported {what} in {method} at instruction {at}")]
    Unsupported {
        method: String,
        at: usize,
        what: String,
    },

    /// A dispatch target or switch value that depends on unknown inputs.
    #[error("cannot prove {what} in {method} at instruction {at}")]
    Unprovable {
        method: String,
        at: usize,
        what: String,
    },

    /// The instruction stream is malformed (stack underflow, bad operand,
    /// control falling off the end).
    #[error("invalid program in {method} at instruction {at}: {reason}")]
    InvalidProgram {
        method: String,
        at: usize,
        reason: String,
    },

    /// An interpreted call reached a method without an instruction body.
    #[error("no body for {callee} called from {method} at instruction {at}")]
    MissingBody {
        method: String,
        at: usize,
        callee: String,
    },

    #[error("call depth exceeded limit {limit} in {method} at instruction {at}")]
    CallDepthExceeded {
        method: String,
        at: usize,
        limit: usize,
    },

    #[error("fork depth exceeded limit {limit} in {method} at instruction {at}")]
    ForkLimitExceeded {
        method: String,
        at: usize,
        limit: usize,
    },

    #[error("path count exceeded limit {limit} in {method} at instruction {at}")]
    PathLimitExceeded {
        method: String,
        at: usize,
        limit: usize,
    },

    #[error("step count exceeded limit {limit} in {method} at instruction {at}")]
    StepLimitExceeded {
        method: String,
        at: usize,
        limit: usize,
    },

    /// A host implementation failed on constant arguments.
    #[error("host evaluation of {callee} failed in {method} at instruction {at}: {message}")]
    Host {
        method: String,
        at: usize,
        callee: String,
        message: String,
    },
}

impl EngineError {
    pub fn class(&self) -> ErrorClass {
        match self {
            EngineError::Unsupported { .. } => ErrorClass::Unsupported,
            EngineError::Unprovable { .. } => ErrorClass::Unprovable,
            EngineError::InvalidProgram { .. } => ErrorClass::InvalidProgram,
            EngineError::MissingBody { .. } => ErrorClass::MissingBody,
            EngineError::CallDepthExceeded { .. }
            | EngineError::ForkLimitExceeded { .. }
            | EngineError::PathLimitExceeded { .. }
            | EngineError::StepLimitExceeded { .. } => ErrorClass::Limit,
            EngineError::Host { .. } => ErrorClass::Host,
        }
    }

    /// Whether retrying cannot help: the method uses something the engine
    /// will never model for these inputs. Limit and host failures may
    /// succeed with a larger budget or different arguments.
    pub fn is_fatal_class(&self) -> bool {
        matches!(
            self.class(),
            ErrorClass::Unsupported
                | ErrorClass::Unprovable
                | ErrorClass::InvalidProgram
                | ErrorClass::MissingBody
        )
    }

    /// The method executing when the error was raised.
    pub fn method(&self) -> &str {
        match self {
            EngineError::Unsupported { method, .. }
            | EngineError::Unprovable { method, .. }
            | EngineError::InvalidProgram { method, .. }
            | EngineError::MissingBody { method, .. }
            | EngineError::CallDepthExceeded { method, .. }
            | EngineError::ForkLimitExceeded { method, .. }
            | EngineError::PathLimitExceeded { method, .. }
            | EngineError::StepLimitExceeded { method, .. }
            | EngineError::Host { method, .. } => method,
        }
    }

    pub fn at(&self) -> usize {
        match self {
            EngineError::Unsupported { at, .. }
            | EngineError::Unprovable { at, .. }
            | EngineError::InvalidProgram { at, .. }
            | EngineError::MissingBody { at, .. }
            | EngineError::CallDepthExceeded { at, .. }
            | EngineError::ForkLimitExceeded { at, .. }
            | EngineError::PathLimitExceeded { at, .. }
            | EngineError::StepLimitExceeded { at, .. }
            | EngineError::Host { at, .. } => *at,
        }
    }
}

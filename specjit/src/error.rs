//! Error types for specialization and compilation.
//!
//! Every failure aborts the whole `compile` call. Nothing is retried: the
//! transformation is deterministic, so the same input fails the same way.

use inkwell::builder::BuilderError;
use thiserror::Error;

use crate::argument::ArgumentKind;

/// Errors raised while specializing or compiling a function.
#[derive(Debug, Error)]
pub enum JitError {
    #[error("Unresolved function: no tracked definition for address {0:#x}")]
    UnresolvedFunction(usize),

    #[error("Unknown symbol `{0}` in its defining module")]
    UnknownSymbol(String),

    #[error("Arity mismatch: `{function}` takes {expected} parameters but the context binds {found}")]
    ArityMismatch {
        function: String,
        expected: usize,
        found: usize,
    },

    #[error("Parameter {index} of `{function}`: {kind} argument cannot bind a value of type {ty}")]
    ArgumentType {
        function: String,
        index: usize,
        kind: ArgumentKind,
        ty: String,
    },

    #[error("Parameter {index} of `{function}`: struct argument has {found} bytes but {ty} needs {expected}")]
    StructSize {
        function: String,
        index: usize,
        ty: String,
        expected: u64,
        found: usize,
    },

    #[error("Relinked symbol `{0}` is neither a global variable nor a function")]
    UnexpectedSymbol(String),

    #[error("Module `{0}` has no specialization entry")]
    MissingEntry(String),

    #[error("Failed to load module `{name}`: {message}")]
    Bitcode { name: String, message: String },

    #[error("Link error: {0}")]
    Link(String),

    #[error("IR verification failed: {0}")]
    Verify(String),

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("IR builder error: {0}")]
    Builder(#[from] BuilderError),
}

/// Errors raised while loading [`JitConfig`](crate::config::JitConfig).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("Invalid value `{value}` for {key}")]
    InvalidValue { key: &'static str, value: String },
}

/// Result alias used throughout the crate.
pub type JitResult<T> = Result<T, JitError>;

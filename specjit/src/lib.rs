//! # specjit
//!
//! Runtime specialization of compiled functions.
//!
//! Given a function whose LLVM IR was registered at load time and a binding
//! for each of its parameters, specjit builds a new function with the bound
//! parameters baked in as constants, relinked globals, or other specialized
//! functions, and compiles it just in time.
//!
//! ## Pipeline
//!
//! ```text
//! fn pointer + Context -> AddressTracker -> module copy -> Specializer
//!                      -> optimization -> MCJIT -> CompiledFunction
//! ```
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use specjit::{AddressTracker, Argument, Context, Jit};
//!
//! // `add` was registered with the tracker when its module was loaded.
//! let jit = Jit::new(&tracker);
//! let context = Context::from_args(vec![Argument::Forward(0), Argument::Int(1)]);
//! let inc = jit.compile(add as *const _, &context)?;
//!
//! let inc_fn: extern "C" fn(i32) -> i32 = unsafe { inc.as_fn() };
//! assert_eq!(inc_fn(4), 5);
//! ```
//!
//! ## Module Overview
//!
//! - [`argument`] - per-parameter rewrite rules
//! - [`tracker`] - runtime address to IR definition registry
//! - [`pass`] - the specialization pass, entry tagging, and linking
//! - [`pipeline`] - end-to-end compilation
//! - [`function`] - compiled function handles
//! - [`config`] - optimization and diagnostics settings
//! - [`ffi_exports`] - C entry points

#![warn(rust_2018_idioms)]

pub mod argument;
pub mod config;
pub mod error;
pub mod ffi_exports;
pub mod function;
pub mod pass;
pub mod pipeline;
pub mod tracker;

pub use argument::{Argument, ArgumentKind, Context};
pub use config::{JitConfig, JitConfigBuilder, OptLevel};
pub use error::{ConfigError, JitError, JitResult};
pub use function::CompiledFunction;
pub use pipeline::Jit;
pub use tracker::{AddressTracker, ModuleBlob, TrackedSymbol};

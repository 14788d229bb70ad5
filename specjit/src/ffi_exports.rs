//! # FFI Exports
//!
//! C-compatible entry points for specializing functions without Rust type
//! information.
//!
//! ## Usage
//!
//! ```c
//! static void register_add_args(struct specjit_context *c, void *user) {
//!     // bind (_1, 1)
//!     specjit_context_set_parameter_index(c, 0);
//!     specjit_context_set_parameter_int(c, *(int *)user);
//! }
//!
//! int one = 1;
//! struct specjit_function *inc = specjit_jit(add, register_add_args, &one, 2);
//! int (*inc_fn)(int) = specjit_get_function(inc);
//! specjit_free(inc);
//! ```
//!
//! Stable Rust cannot receive a `va_list`, so the registration callback gets
//! an opaque `user_data` pointer instead. The callback must call exactly one
//! setter per parameter of the target, in parameter order.
//!
//! Failures are logged and reported as a null handle.

use std::ffi::{c_char, c_int, c_uint, c_void, CStr};
use std::sync::Arc;

use tracing::{error, warn};

use crate::argument::Context;
use crate::config::JitConfig;
use crate::function::CompiledFunction;
use crate::pipeline::Jit;
use crate::tracker::{AddressTracker, ModuleBlob};

/// Argument list under construction, opaque to C.
pub struct SpecjitContext {
    args: Context<'static>,
}

/// Compiled function handle, opaque to C.
pub struct SpecjitFunction {
    function: CompiledFunction,
}

/// Callback filling a context with one setter call per parameter.
pub type RegisterParams = unsafe extern "C" fn(*mut SpecjitContext, *mut c_void);

/// Specialize `fun_ptr` and compile it.
///
/// # Safety
///
/// `fun_ptr` must be a function registered with the global tracker, and
/// `register_params` must only call the `specjit_context_*` setters on the
/// context it receives.
#[no_mangle]
pub unsafe extern "C" fn specjit_jit(
    fun_ptr: *const c_void,
    register_params: Option<RegisterParams>,
    user_data: *mut c_void,
    nargs: c_int,
) -> *mut SpecjitFunction {
    let Some(register_params) = register_params else {
        error!("specjit_jit called without a parameter callback");
        return std::ptr::null_mut();
    };
    let Ok(nargs) = usize::try_from(nargs) else {
        error!(nargs, "negative argument count");
        return std::ptr::null_mut();
    };

    let mut context = SpecjitContext {
        args: Context::with_capacity(nargs),
    };
    register_params(&mut context, user_data);

    if context.args.len() != nargs {
        error!(expected = nargs, found = context.args.len(), "wrong number of parameter setters");
        return std::ptr::null_mut();
    }

    let config = JitConfig::from_env().unwrap_or_else(|e| {
        warn!(error = %e, "ignoring invalid configuration");
        JitConfig::default()
    });

    match Jit::with_config(AddressTracker::global(), config).compile(fun_ptr, &context.args) {
        Ok(function) => Box::into_raw(Box::new(SpecjitFunction { function })),
        Err(e) => {
            error!(error = %e, "specialization failed");
            std::ptr::null_mut()
        }
    }
}

/// Raw entry pointer of a compiled function, or null for a null handle.
///
/// # Safety
///
/// `function` must be null or a live handle from [`specjit_jit`].
#[no_mangle]
pub unsafe extern "C" fn specjit_get_function(function: *const SpecjitFunction) -> *const c_void {
    match function.as_ref() {
        Some(handle) => handle.function.as_ptr(),
        None => std::ptr::null(),
    }
}

/// Release a compiled function. Its raw pointer becomes invalid.
///
/// # Safety
///
/// `function` must be null or a handle from [`specjit_jit`] not yet freed.
#[no_mangle]
pub unsafe extern "C" fn specjit_free(function: *mut SpecjitFunction) {
    if !function.is_null() {
        drop(Box::from_raw(function));
    }
}

/// Forward the current parameter to position `index` of the new signature.
///
/// # Safety
///
/// `context` must be the context passed to the registration callback.
#[no_mangle]
pub unsafe extern "C" fn specjit_context_set_parameter_index(context: *mut SpecjitContext, index: c_uint) {
    if let Some(context) = context.as_mut() {
        context.args.set_parameter_index(index as usize);
    }
}

/// Bind the current parameter to an integer constant.
///
/// # Safety
///
/// `context` must be the context passed to the registration callback.
#[no_mangle]
pub unsafe extern "C" fn specjit_context_set_parameter_int(context: *mut SpecjitContext, value: i64) {
    if let Some(context) = context.as_mut() {
        context.args.set_parameter_int(value);
    }
}

/// Bind the current parameter to a floating-point constant.
///
/// # Safety
///
/// `context` must be the context passed to the registration callback.
#[no_mangle]
pub unsafe extern "C" fn specjit_context_set_parameter_float(context: *mut SpecjitContext, value: f64) {
    if let Some(context) = context.as_mut() {
        context.args.set_parameter_float(value);
    }
}

/// Bind the current parameter to a constant address.
///
/// # Safety
///
/// `context` must be the context passed to the registration callback.
#[no_mangle]
pub unsafe extern "C" fn specjit_context_set_parameter_pointer(context: *mut SpecjitContext, ptr: *const c_void) {
    if let Some(context) = context.as_mut() {
        context.args.set_parameter_ptr(ptr);
    }
}

/// Bind the current parameter to the `size` bytes at `ptr`.
///
/// # Safety
///
/// `context` must be the context passed to the registration callback and
/// `ptr` must be readable for `size` bytes.
#[no_mangle]
pub unsafe extern "C" fn specjit_context_set_parameter_struct(
    context: *mut SpecjitContext,
    ptr: *const c_char,
    size: usize,
) {
    let Some(context) = context.as_mut() else {
        return;
    };
    let bytes = if ptr.is_null() || size == 0 {
        Vec::new()
    } else {
        std::slice::from_raw_parts(ptr as *const u8, size).to_vec()
    };
    context.args.set_parameter_struct(bytes);
}

/// Register `address` as symbol `name` defined by the given module bitcode.
///
/// Returns 1 when a new entry was added, 0 when the address was already
/// registered, and -1 on invalid input.
///
/// # Safety
///
/// `name` must be a valid null-terminated string and `bitcode` readable for
/// `len` bytes.
#[no_mangle]
pub unsafe extern "C" fn specjit_register(
    address: *const c_void,
    name: *const c_char,
    bitcode: *const u8,
    len: usize,
) -> c_int {
    if name.is_null() || bitcode.is_null() {
        return -1;
    }
    let Ok(name) = CStr::from_ptr(name).to_str() else {
        return -1;
    };
    let blob = ModuleBlob::new(name, std::slice::from_raw_parts(bitcode, len));
    c_int::from(AddressTracker::global().register(address, name, Arc::new(blob)))
}

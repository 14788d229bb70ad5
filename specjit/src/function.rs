//! Compiled-function handle.

use std::ffi::c_void;
use std::fmt;

use inkwell::context::Context as LlvmContext;
use inkwell::execution_engine::ExecutionEngine;
use inkwell::module::Module;

use crate::error::JitResult;
use crate::tracker::ModuleBlob;

/// Owner of one specialized, JIT-compiled function.
///
/// The raw pointer returned by [`as_ptr`](Self::as_ptr) is valid until the
/// handle is dropped. The handle also keeps the bitcode of the specialized
/// module so other specializations can link it in directly.
pub struct CompiledFunction {
    // Declared before `_context`: fields drop in order and the engine borrows the context.
    _engine: ExecutionEngine<'static>,
    _context: Box<LlvmContext>,
    address: usize,
    entry_name: String,
    module: ModuleBlob,
    bindings: Vec<(String, usize)>,
}

impl CompiledFunction {
    /// # Safety
    ///
    /// `engine` must have been created from a module owned by `context`, and
    /// nothing else may borrow `context`.
    pub(crate) unsafe fn from_parts(
        engine: ExecutionEngine<'static>,
        context: Box<LlvmContext>,
        address: usize,
        entry_name: String,
        module: ModuleBlob,
        bindings: Vec<(String, usize)>,
    ) -> Self {
        Self {
            _engine: engine,
            _context: context,
            address,
            entry_name,
            module,
            bindings,
        }
    }

    /// Entry address of the specialized function.
    pub fn as_ptr(&self) -> *const c_void {
        self.address as *const c_void
    }

    /// Reinterpret the entry address as a function pointer type.
    ///
    /// # Safety
    ///
    /// `F` must be a function pointer type matching the specialized
    /// signature, and the result must not be called after `self` is dropped.
    pub unsafe fn as_fn<F: Copy>(&self) -> F {
        assert_eq!(
            std::mem::size_of::<F>(),
            std::mem::size_of::<usize>(),
            "`F` must be a function pointer"
        );
        std::mem::transmute_copy(&self.address)
    }

    /// Symbol name of the entry, the name of the function that was specialized.
    pub fn entry_name(&self) -> &str {
        &self.entry_name
    }

    /// Bitcode of the specialized module.
    pub fn bitcode(&self) -> &[u8] {
        self.module.bitcode()
    }

    /// Declarations in the specialized module that were bound to explicit
    /// addresses rather than looked up by name.
    pub fn bindings(&self) -> &[(String, usize)] {
        &self.bindings
    }

    /// Copy of the specialized module bound to `context`, ready to be linked
    /// into another module.
    pub fn materialize<'ctx>(&self, context: &'ctx LlvmContext) -> JitResult<Module<'ctx>> {
        self.module.materialize(context)
    }
}

impl fmt::Debug for CompiledFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompiledFunction")
            .field("entry", &self.entry_name)
            .field("address", &format_args!("{:#x}", self.address))
            .field("module", &self.module)
            .finish()
    }
}

//! Address tracker.
//!
//! Maps the runtime address of a global variable or function back to its
//! symbol name and the bitcode of the module that defined it, so a
//! specialization can relink the real definition instead of treating the
//! address as an opaque constant.
//!
//! ## Lifecycle
//!
//! The registry is populated at load time and only read afterwards. Reads
//! (`resolve`, `materialize_module`) are safe from any number of threads;
//! registration takes the write lock. Entries are never removed.

use std::collections::HashMap;
use std::ffi::{c_void, CString};
use std::fmt;
use std::sync::{Arc, OnceLock};

use inkwell::context::Context as LlvmContext;
use inkwell::execution_engine::ExecutionEngine;
use inkwell::memory_buffer::MemoryBuffer;
use inkwell::module::Module;
use llvm_sys::execution_engine::LLVMGetGlobalValueAddress;
use parking_lot::RwLock;
use tracing::{debug, trace};

use crate::error::{JitError, JitResult};

/// Serialized module a tracked symbol was defined in.
pub struct ModuleBlob {
    name: String,
    bitcode: Box<[u8]>,
}

impl ModuleBlob {
    pub fn new(name: impl Into<String>, bitcode: impl Into<Box<[u8]>>) -> Self {
        Self {
            name: name.into(),
            bitcode: bitcode.into(),
        }
    }

    /// Serialize `module` to bitcode.
    pub fn from_module(module: &Module<'_>) -> Self {
        let buffer = module.write_bitcode_to_memory();
        let name = module.get_name().to_string_lossy().into_owned();
        Self::new(name, buffer.as_slice())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn bitcode(&self) -> &[u8] {
        &self.bitcode
    }

    /// Parse a fresh copy of the module owned by `context`.
    pub fn materialize<'ctx>(&self, context: &'ctx LlvmContext) -> JitResult<Module<'ctx>> {
        let buffer = MemoryBuffer::create_from_memory_range_copy(&self.bitcode, &self.name);
        Module::parse_bitcode_from_buffer(&buffer, context).map_err(|e| JitError::Bitcode {
            name: self.name.clone(),
            message: e.to_string(),
        })
    }
}

impl fmt::Debug for ModuleBlob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleBlob")
            .field("name", &self.name)
            .field("bytes", &self.bitcode.len())
            .finish()
    }
}

/// A registered symbol: its name and defining module.
#[derive(Debug, Clone)]
pub struct TrackedSymbol {
    pub name: String,
    pub module: Arc<ModuleBlob>,
}

#[derive(Default)]
struct Registry {
    by_address: HashMap<usize, TrackedSymbol>,
    by_name: HashMap<String, usize>,
}

/// Registry of runtime addresses whose defining module is available.
#[derive(Default)]
pub struct AddressTracker {
    registry: RwLock<Registry>,
}

static GLOBAL_TRACKER: OnceLock<AddressTracker> = OnceLock::new();

impl AddressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide tracker, used by the C entry points.
    pub fn global() -> &'static AddressTracker {
        GLOBAL_TRACKER.get_or_init(AddressTracker::new)
    }

    /// Register `address` as the definition of `name` in `module`.
    ///
    /// Idempotent: an address that is already registered keeps its first
    /// mapping. Returns whether a new entry was added.
    pub fn register(
        &self,
        address: *const c_void,
        name: impl Into<String>,
        module: Arc<ModuleBlob>,
    ) -> bool {
        let address = address as usize;
        let name = name.into();
        let mut registry = self.registry.write();
        if registry.by_address.contains_key(&address) {
            return false;
        }
        registry.by_name.entry(name.clone()).or_insert(address);
        trace!(address = format_args!("{address:#x}"), %name, module = module.name(), "registered symbol");
        registry
            .by_address
            .insert(address, TrackedSymbol { name, module });
        true
    }

    /// Register every function and global variable defined by `module`,
    /// which has been loaded into `engine`. Returns the number of new entries.
    pub fn register_module(&self, module: &Module<'_>, engine: &ExecutionEngine<'_>) -> usize {
        let blob = Arc::new(ModuleBlob::from_module(module));
        let mut added = 0;
        for function in module.get_functions() {
            if function.count_basic_blocks() == 0 {
                continue;
            }
            let name = function.get_name().to_string_lossy().into_owned();
            match engine.get_function_address(&name) {
                Ok(address) => {
                    if self.register(address as *const c_void, name, Arc::clone(&blob)) {
                        added += 1;
                    }
                }
                Err(e) => debug!(%name, error = %e, "function has no address, skipped"),
            }
        }
        for global in module.get_globals() {
            if global.is_declaration() {
                continue;
            }
            let name = global.get_name().to_string_lossy().into_owned();
            if name.starts_with("llvm.") {
                continue;
            }
            let Ok(c_name) = CString::new(name.as_str()) else {
                continue;
            };
            let address = unsafe { LLVMGetGlobalValueAddress(engine.as_mut_ptr(), c_name.as_ptr()) };
            if address == 0 {
                debug!(%name, "global has no address, skipped");
                continue;
            }
            if self.register(address as usize as *const c_void, name, Arc::clone(&blob)) {
                added += 1;
            }
        }
        debug!(module = blob.name(), added, "registered module");
        added
    }

    pub fn has_mapping(&self, address: *const c_void) -> bool {
        self.registry.read().by_address.contains_key(&(address as usize))
    }

    pub fn resolve(&self, address: *const c_void) -> Option<TrackedSymbol> {
        self.registry.read().by_address.get(&(address as usize)).cloned()
    }

    /// Registered address of the symbol called `name`, if any.
    pub fn address_of(&self, name: &str) -> Option<usize> {
        self.registry.read().by_name.get(name).copied()
    }

    /// Copy of the module defining `address`, bound to `context`, together
    /// with the symbol name. `Ok(None)` when the address is not tracked.
    pub fn materialize_module<'ctx>(
        &self,
        address: *const c_void,
        context: &'ctx LlvmContext,
    ) -> JitResult<Option<(String, Module<'ctx>)>> {
        let Some(symbol) = self.resolve(address) else {
            return Ok(None);
        };
        let module = symbol.module.materialize(context)?;
        Ok(Some((symbol.name, module)))
    }

    pub fn len(&self) -> usize {
        self.registry.read().by_address.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for AddressTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AddressTracker")
            .field("entries", &self.len())
            .finish()
    }
}

//! Compile pipeline.
//!
//! ```text
//! fn pointer -> AddressTracker -> fresh context + module copy
//!            -> Specializer -> internalize -> globaldce -> default<On>
//!            -> MCJIT -> CompiledFunction
//! ```
//!
//! Every compilation gets its own LLVM context, so concurrent compilations
//! share nothing but the (read-only) address tracker.
//!
//! Tracked global variables are never copied into the specialized module.
//! They are declared and bound to their live addresses, so the compiled
//! code reads and writes the same storage as the rest of the process.

use std::collections::HashMap;
use std::ffi::c_void;
use std::sync::OnceLock;

use inkwell::context::Context as LlvmContext;
use inkwell::execution_engine::ExecutionEngine;
use inkwell::module::{Linkage, Module};
use inkwell::passes::PassBuilderOptions;
use inkwell::targets::{CodeModel, InitializationConfig, RelocMode, Target, TargetMachine};
use inkwell::values::FunctionValue;
use tracing::{debug, info_span, trace};

use crate::argument::Context;
use crate::config::{JitConfig, OptLevel};
use crate::error::{JitError, JitResult};
use crate::function::CompiledFunction;
use crate::pass::link::declare_tracked_globals;
use crate::pass::Specializer;
use crate::tracker::{AddressTracker, ModuleBlob};

static NATIVE_TARGET: OnceLock<Result<(), String>> = OnceLock::new();

/// Initialize the native target and MCJIT once per process.
fn initialize_native() -> JitResult<()> {
    NATIVE_TARGET
        .get_or_init(|| {
            Target::initialize_native(&InitializationConfig::default())
                .map_err(|e| format!("Failed to initialize native target: {}", e))?;
            ExecutionEngine::link_in_mc_jit();
            Ok(())
        })
        .clone()
        .map_err(JitError::Backend)
}

/// Get a target machine for the native platform.
fn native_target_machine(level: OptLevel) -> JitResult<TargetMachine> {
    let triple = TargetMachine::get_default_triple();
    let target = Target::from_triple(&triple)
        .map_err(|e| JitError::Backend(format!("Failed to get target: {}", e)))?;

    let cpu = TargetMachine::get_host_cpu_name();
    let features = TargetMachine::get_host_cpu_features();

    target
        .create_target_machine(
            &triple,
            cpu.to_str().unwrap_or("generic"),
            features.to_str().unwrap_or(""),
            level.into(),
            RelocMode::Default,
            CodeModel::JITDefault,
        )
        .ok_or_else(|| JitError::Backend("Failed to create target machine".to_string()))
}

/// Make every definition except `entry` local so unused code can be dropped.
fn internalize(module: &Module<'_>, entry: FunctionValue<'_>) {
    for function in module.get_functions() {
        if function != entry && function.count_basic_blocks() > 0 {
            function.set_linkage(Linkage::Internal);
        }
    }
    for global in module.get_globals() {
        let is_intrinsic = global.get_name().to_bytes().starts_with(b"llvm.");
        if !global.is_declaration() && !is_intrinsic {
            global.set_linkage(Linkage::Internal);
        }
    }
}

/// Specializes tracked functions and compiles them just in time.
#[derive(Debug, Clone)]
pub struct Jit<'t> {
    tracker: &'t AddressTracker,
    config: JitConfig,
}

impl<'t> Jit<'t> {
    pub fn new(tracker: &'t AddressTracker) -> Self {
        Self::with_config(tracker, JitConfig::default())
    }

    pub fn with_config(tracker: &'t AddressTracker, config: JitConfig) -> Self {
        Self { tracker, config }
    }

    pub fn config(&self) -> &JitConfig {
        &self.config
    }

    pub fn tracker(&self) -> &'t AddressTracker {
        self.tracker
    }

    /// Specialize the function at `function` with `args` and compile it.
    ///
    /// The function must have been registered with the tracker. All or
    /// nothing: on error no handle exists and nothing has been published.
    pub fn compile(&self, function: *const c_void, args: &Context<'_>) -> JitResult<CompiledFunction> {
        let symbol = self
            .tracker
            .resolve(function)
            .ok_or(JitError::UnresolvedFunction(function as usize))?;

        let span = info_span!("compile", function = %symbol.name, params = args.len());
        let _guard = span.enter();

        initialize_native()?;

        let context = Box::new(LlvmContext::create());
        // SAFETY: the box keeps the context at a stable address, and the
        // engine, the only value that outlives this function with this
        // lifetime, is dropped by `CompiledFunction` before the box.
        let llvm: &'static LlvmContext = unsafe { &*(context.as_ref() as *const LlvmContext) };

        let module = symbol.module.materialize(llvm)?;
        let machine = native_target_machine(self.config.opt_level)?;
        let target_data = machine.get_target_data();
        module.set_triple(&machine.get_triple());
        module.set_data_layout(&target_data.get_data_layout());

        let declared = declare_tracked_globals(&module, self.tracker);
        trace!(declared, "declared tracked globals");

        let specializer = Specializer::new(llvm, &module, self.tracker, &target_data);
        let entry = specializer.run(&symbol.name, args)?;
        let bindings = specializer.into_bindings();
        internalize(&module, entry);

        if self.config.verify {
            module.verify().map_err(|e| JitError::Verify(e.to_string()))?;
        }

        self.optimize(&module, &machine)?;

        if self.config.dump_ir {
            debug!(ir = %module.print_to_string().to_string(), "specialized module");
        }

        let blob = ModuleBlob::from_module(&module);
        let engine = module
            .create_jit_execution_engine(self.config.opt_level.into())
            .map_err(|e| JitError::Backend(e.to_string()))?;
        self.map_declarations(&module, &engine, &bindings);

        let address = engine
            .get_function_address(&symbol.name)
            .map_err(|e| JitError::Backend(format!("`{}`: {}", symbol.name, e)))?;

        debug!(address = format_args!("{address:#x}"), "compiled");
        // SAFETY: `engine` was created from `module`, which `context` owns.
        Ok(unsafe { CompiledFunction::from_parts(engine, context, address, symbol.name, blob, bindings) })
    }

    fn optimize(&self, module: &Module<'_>, machine: &TargetMachine) -> JitResult<()> {
        let pipeline = self.config.opt_level.pass_pipeline();
        for passes in ["globaldce", pipeline.as_str()] {
            module
                .run_passes(passes, machine, PassBuilderOptions::create())
                .map_err(|e| JitError::Backend(format!("{passes}: {e}")))?;
        }
        Ok(())
    }

    /// Point declarations at their runtime addresses: explicit bindings
    /// first, then whatever the tracker knows by name.
    fn map_declarations(&self, module: &Module<'_>, engine: &ExecutionEngine<'_>, bindings: &[(String, usize)]) {
        let bound: HashMap<&str, usize> = bindings
            .iter()
            .map(|(name, address)| (name.as_str(), *address))
            .collect();
        let lookup = |name: &str| bound.get(name).copied().or_else(|| self.tracker.address_of(name));

        for function in module.get_functions() {
            if function.count_basic_blocks() > 0 {
                continue;
            }
            let name = function.get_name().to_string_lossy();
            if let Some(address) = lookup(name.as_ref()) {
                trace!(symbol = %name, "mapped function declaration");
                engine.add_global_mapping(&function, address);
            }
        }
        for global in module.get_globals() {
            if !global.is_declaration() {
                continue;
            }
            let name = global.get_name().to_string_lossy();
            if let Some(address) = lookup(name.as_ref()) {
                trace!(symbol = %name, "mapped global declaration");
                engine.add_global_mapping(&global, address);
            }
        }
    }
}

//! Shared test infrastructure: loading IR programs the way a host would at
//! load time, and registering them with a tracker.

#![allow(dead_code)]

use std::ffi::c_void;
use std::sync::{Arc, Once};

use inkwell::context::Context as LlvmContext;
use inkwell::execution_engine::ExecutionEngine;
use inkwell::memory_buffer::MemoryBuffer;
use inkwell::module::Module;
use inkwell::targets::{InitializationConfig, Target};
use inkwell::OptimizationLevel;
use specjit::{AddressTracker, ModuleBlob};

static INIT: Once = Once::new();

/// Initialize the native target and test logging.
pub fn init() {
    INIT.call_once(|| {
        Target::initialize_native(&InitializationConfig::default())
            .expect("Failed to initialize native target");
        ExecutionEngine::link_in_mc_jit();
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

pub fn parse<'ctx>(context: &'ctx LlvmContext, name: &str, ir: &str) -> Module<'ctx> {
    let buffer = MemoryBuffer::create_from_memory_range_copy(ir.as_bytes(), name);
    context
        .create_module_from_ir(buffer)
        .unwrap_or_else(|e| panic!("invalid test IR in `{}`: {}", name, e))
}

/// A program module compiled by its own engine, standing in for code that
/// was loaded with its IR embedded.
pub struct Program<'ctx> {
    pub module: Module<'ctx>,
    pub engine: ExecutionEngine<'ctx>,
}

impl<'ctx> Program<'ctx> {
    /// Load `ir` without registering it.
    pub fn load_untracked(context: &'ctx LlvmContext, name: &str, ir: &str) -> Self {
        init();
        let module = parse(context, name, ir);
        let engine = module
            .create_jit_execution_engine(OptimizationLevel::None)
            .expect("Failed to create execution engine");
        Self { module, engine }
    }

    /// Load `ir` and register every function it defines with `tracker`.
    pub fn load(context: &'ctx LlvmContext, name: &str, ir: &str, tracker: &AddressTracker) -> Self {
        let program = Self::load_untracked(context, name, ir);
        program.register(tracker);
        program
    }

    pub fn register(&self, tracker: &AddressTracker) -> usize {
        tracker.register_module(&self.module, &self.engine)
    }

    pub fn address(&self, name: &str) -> *const c_void {
        self.engine
            .get_function_address(name)
            .unwrap_or_else(|e| panic!("no function `{}`: {}", name, e)) as *const c_void
    }

    /// # Safety
    ///
    /// `F` must be the function pointer type of `name`.
    pub unsafe fn function<F: Copy>(&self, name: &str) -> F {
        let address = self.address(name) as usize;
        std::mem::transmute_copy(&address)
    }
}

/// Bitcode blob for a module given as IR text.
pub fn blob(name: &str, ir: &str) -> Arc<ModuleBlob> {
    let context = LlvmContext::create();
    let module = parse(&context, name, ir);
    Arc::new(ModuleBlob::from_module(&module))
}

pub const PROGRAM_IR: &str = r#"
%struct.Big = type { i64, i64, i64, i64 }

define i32 @add(i32 %a, i32 %b) {
entry:
  %r = add i32 %a, %b
  ret i32 %r
}

define i32 @sub(i32 %a, i32 %b) {
entry:
  %r = sub i32 %a, %b
  ret i32 %r
}

define double @affine(double %x, i32 %k, double %b) {
entry:
  %kf = sitofp i32 %k to double
  %m = fmul double %x, %kf
  %r = fadd double %m, %b
  ret double %r
}

define i8 @id8(i8 %x) {
entry:
  ret i8 %x
}

define float @halve(float %x) {
entry:
  %r = fmul float %x, 5.000000e-01
  ret float %r
}

define i32 @pair_dot({ i32, i32 } %p, i32 %k) {
entry:
  %a = extractvalue { i32, i32 } %p, 0
  %b = extractvalue { i32, i32 } %p, 1
  %s = add i32 %a, %b
  %r = mul i32 %s, %k
  ret i32 %r
}

define i64 @big_sum(%struct.Big* byval(%struct.Big) align 8 %v, i64 %scale) {
entry:
  %p0 = getelementptr inbounds %struct.Big, %struct.Big* %v, i32 0, i32 0
  %p1 = getelementptr inbounds %struct.Big, %struct.Big* %v, i32 0, i32 1
  %p2 = getelementptr inbounds %struct.Big, %struct.Big* %v, i32 0, i32 2
  %p3 = getelementptr inbounds %struct.Big, %struct.Big* %v, i32 0, i32 3
  %a = load i64, i64* %p0
  %b = load i64, i64* %p1
  %c = load i64, i64* %p2
  %d = load i64, i64* %p3
  %ab = add i64 %a, %b
  %cd = add i64 %c, %d
  %s = add i64 %ab, %cd
  %r = mul i64 %s, %scale
  ret i64 %r
}

define i32 @sum_table(i32* %t, i32 %n) {
entry:
  br label %loop

loop:
  %i = phi i32 [ 0, %entry ], [ %i.next, %body ]
  %acc = phi i32 [ 0, %entry ], [ %acc.next, %body ]
  %done = icmp sge i32 %i, %n
  br i1 %done, label %exit, label %body

body:
  %idx = sext i32 %i to i64
  %p = getelementptr inbounds i32, i32* %t, i64 %idx
  %v = load i32, i32* %p
  %acc.next = add i32 %acc, %v
  %i.next = add i32 %i, 1
  br label %loop

exit:
  ret i32 %acc
}

define i32 @twice(i32 %x) {
entry:
  %r = shl i32 %x, 1
  ret i32 %r
}

define i32 @apply(i32 (i32)* %f, i32 %x) {
entry:
  %r = call i32 %f(i32 %x)
  ret i32 %r
}

define void @store(i32* %p, i32 %v) {
entry:
  store i32 %v, i32* %p
  ret void
}
"#;

/// Module defining the global registered for `TABLE` in the tests.
pub const TABLE_IR: &str = r#"
@table = global [4 x i32] [i32 1, i32 2, i32 3, i32 4]
"#;

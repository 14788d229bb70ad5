//! Linking module fragments into the module under specialization.
//!
//! Fragments come from the address tracker or from other compiled
//! functions, so they routinely define the same external symbols as the
//! destination. The destination keeps its definition; the fragment's copy is
//! demoted to `available_externally` before the link so the linker does not
//! report a duplicate.
//!
//! Global variables the tracker knows about are never copied. Their
//! definitions become external declarations, which the pipeline binds to the
//! live storage of the running process.

use std::ffi::c_char;

use inkwell::module::{Linkage, Module};
use inkwell::values::{AsValueRef, GlobalValue};
use inkwell::types::BasicTypeEnum;
use llvm_sys::core::LLVMSetValueName2;
use tracing::trace;

use crate::error::{JitError, JitResult};
use crate::tracker::AddressTracker;

/// Set the name of a global value. LLVM makes the name unique on collision.
pub fn set_value_name(value: &impl AsValueRef, name: &str) {
    unsafe {
        LLVMSetValueName2(value.as_value_ref(), name.as_ptr() as *const c_char, name.len());
    }
}

/// A name starting with `base` that no global value in `module` uses.
pub fn unused_name(module: &Module<'_>, base: &str) -> String {
    let taken = |name: &str| module.get_function(name).is_some() || module.get_global(name).is_some();
    if !taken(base) {
        return base.to_string();
    }
    (1..)
        .map(|n| format!("{base}.{n}"))
        .find(|candidate| !taken(candidate))
        .unwrap_or_else(|| base.to_string())
}

fn is_local(linkage: Linkage) -> bool {
    matches!(linkage, Linkage::Private | Linkage::Internal)
}

/// Replace every global variable `module` defines that `tracker` knows by
/// name with an external declaration of the same name and type. Returns how
/// many were replaced.
pub fn declare_tracked_globals(module: &Module<'_>, tracker: &AddressTracker) -> usize {
    let tracked: Vec<_> = module
        .get_globals()
        .filter(|global| !global.is_declaration() && !global.is_thread_local())
        .filter(|global| {
            let name = global.get_name().to_string_lossy();
            !name.starts_with("llvm.") && tracker.address_of(&name).is_some()
        })
        .collect();

    let mut declared = 0;
    for global in tracked {
        let name = global.get_name().to_string_lossy().into_owned();
        let pointer = global.as_pointer_value();
        let Ok(value_type) = BasicTypeEnum::try_from(pointer.get_type().get_element_type()) else {
            continue;
        };

        set_value_name(&global, "");
        let declaration = module.add_global(value_type, None, &name);
        declaration.set_alignment(global.get_alignment());
        declaration.set_constant(global.is_constant());
        if declaration.as_pointer_value().get_type() != pointer.get_type() {
            // Address space differs; keep the definition.
            unsafe { declaration.delete() };
            set_value_name(&global, &name);
            continue;
        }

        pointer.replace_all_uses_with(declaration.as_pointer_value());
        unsafe { global.delete() };
        trace!(symbol = %name, "declared tracked global");
        declared += 1;
    }
    declared
}

/// Give a local symbol of a fragment external linkage under a name `dest`
/// does not use, so the linker keeps it even when nothing references it.
/// Returns the symbol's name after the change.
pub fn expose_local(dest: &Module<'_>, symbol: GlobalValue<'_>) -> String {
    let name = symbol.get_name().to_string_lossy().into_owned();
    if !is_local(symbol.get_linkage()) {
        return name;
    }
    set_value_name(&symbol, &unused_name(dest, &name));
    symbol.set_linkage(Linkage::External);
    let exposed = symbol.get_name().to_string_lossy().into_owned();
    trace!(symbol = %name, exposed = %exposed, "exposed local symbol");
    exposed
}

/// Demote definitions in `fragment` that `dest` already defines.
fn demote_duplicates(dest: &Module<'_>, fragment: &Module<'_>) -> usize {
    let mut demoted = 0;

    for function in fragment.get_functions() {
        if function.count_basic_blocks() == 0 || is_local(function.get_linkage()) {
            continue;
        }
        let name = function.get_name().to_string_lossy();
        let defined = dest
            .get_function(&name)
            .is_some_and(|existing| existing.count_basic_blocks() > 0);
        if defined {
            trace!(symbol = %name, "keeping destination definition");
            function.set_linkage(Linkage::AvailableExternally);
            demoted += 1;
        }
    }

    for global in fragment.get_globals() {
        if global.is_declaration() || is_local(global.get_linkage()) {
            continue;
        }
        let name = global.get_name().to_string_lossy();
        if name.starts_with("llvm.") {
            continue;
        }
        let defined = dest
            .get_global(&name)
            .is_some_and(|existing| !existing.is_declaration());
        if defined {
            trace!(symbol = %name, "keeping destination definition");
            global.set_linkage(Linkage::AvailableExternally);
            demoted += 1;
        }
    }

    demoted
}

/// Link `fragment` into `dest`. The fragment is consumed.
pub fn link_fragment<'ctx>(dest: &Module<'ctx>, fragment: Module<'ctx>) -> JitResult<()> {
    fragment.set_triple(&dest.get_triple());
    fragment.set_data_layout(&dest.get_data_layout());

    let demoted = demote_duplicates(dest, &fragment);
    trace!(
        fragment = %fragment.get_name().to_string_lossy(),
        demoted,
        "linking fragment"
    );

    dest.link_in_module(fragment)
        .map_err(|e| JitError::Link(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use inkwell::context::Context;
    use inkwell::memory_buffer::MemoryBuffer;

    fn parse<'ctx>(context: &'ctx Context, name: &str, ir: &str) -> Module<'ctx> {
        let buffer = MemoryBuffer::create_from_memory_range_copy(ir.as_bytes(), name);
        context.create_module_from_ir(buffer).unwrap()
    }

    const DEST_IR: &str = r#"
define i32 @shared(i32 %x) {
  %r = add i32 %x, 1
  ret i32 %r
}
"#;

    const FRAGMENT_IR: &str = r#"
@counter = global i32 5

define i32 @shared(i32 %x) {
  %r = add i32 %x, 1
  ret i32 %r
}

define i32 @only_in_fragment() {
  %v = load i32, i32* @counter
  %r = call i32 @shared(i32 %v)
  ret i32 %r
}
"#;

    #[test]
    fn test_duplicate_definitions_keep_destination() {
        let context = Context::create();
        let dest = parse(&context, "dest", DEST_IR);
        let fragment = parse(&context, "fragment", FRAGMENT_IR);

        link_fragment(&dest, fragment).unwrap();

        let shared = dest.get_function("shared").unwrap();
        assert!(shared.count_basic_blocks() > 0);
        assert!(dest.get_function("only_in_fragment").is_some());
        assert!(dest.get_global("counter").is_some());
        assert!(dest.verify().is_ok());
    }

    #[test]
    fn test_tracked_globals_become_declarations() {
        let context = Context::create();
        let fragment = parse(&context, "fragment", FRAGMENT_IR);
        let tracker = AddressTracker::new();
        tracker.register(
            0x4000 as *const std::ffi::c_void,
            "counter",
            std::sync::Arc::new(crate::tracker::ModuleBlob::from_module(&fragment)),
        );

        assert_eq!(declare_tracked_globals(&fragment, &tracker), 1);
        let counter = fragment.get_global("counter").unwrap();
        assert!(counter.is_declaration());
        assert_eq!(counter.get_linkage(), Linkage::External);
        assert!(fragment.verify().is_ok());

        assert_eq!(declare_tracked_globals(&fragment, &tracker), 0);
    }

    #[test]
    fn test_untracked_globals_keep_definitions() {
        let context = Context::create();
        let fragment = parse(&context, "fragment", FRAGMENT_IR);
        assert_eq!(declare_tracked_globals(&fragment, &AddressTracker::new()), 0);
        assert!(!fragment.get_global("counter").unwrap().is_declaration());
    }

    #[test]
    fn test_exposed_local_survives_link() {
        let context = Context::create();
        let dest = parse(&context, "dest", DEST_IR);
        let fragment = parse(
            &context,
            "fragment",
            "define internal i32 @shared(i32 %x) {\n  ret i32 %x\n}\n",
        );

        let function = fragment.get_function("shared").unwrap();
        let exposed = expose_local(&dest, function.as_global_value());
        assert_eq!(exposed, "shared.1");

        link_fragment(&dest, fragment).unwrap();
        assert!(dest.get_function("shared.1").is_some());
        assert!(dest.get_function("shared").unwrap().count_basic_blocks() > 0);
    }

    #[test]
    fn test_unused_name() {
        let context = Context::create();
        let dest = parse(&context, "dest", DEST_IR);
        assert_eq!(unused_name(&dest, "fresh"), "fresh");
        assert_eq!(unused_name(&dest, "shared"), "shared.1");
    }

    #[test]
    fn test_set_value_name() {
        let context = Context::create();
        let dest = parse(&context, "dest", DEST_IR);
        let shared = dest.get_function("shared").unwrap();
        set_value_name(&shared, "renamed");
        assert!(dest.get_function("shared").is_none());
        assert!(dest.get_function("renamed").is_some());
    }
}

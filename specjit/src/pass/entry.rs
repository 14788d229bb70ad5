//! Entry marking.
//!
//! The specialized entry function carries a `specjit.entry` metadata
//! attachment. Composition looks the entry up through the attachment, so it
//! keeps working after the entry has been renamed.

use std::ffi::c_char;

use inkwell::module::Module;
use inkwell::values::{AsValueRef, FunctionValue};
use llvm_sys::core::{
    LLVMDisposeValueMetadataEntries, LLVMGetMDKindIDInContext, LLVMGetModuleContext,
    LLVMGlobalCopyAllMetadata, LLVMGlobalEraseMetadata, LLVMGlobalSetMetadata,
    LLVMMDNodeInContext2, LLVMValueMetadataEntriesGetKind,
};
use llvm_sys::prelude::{LLVMContextRef, LLVMValueRef};

/// Metadata kind naming the specialization entry point.
pub const ENTRY_METADATA: &str = "specjit.entry";

fn entry_kind(module: &Module<'_>) -> (LLVMContextRef, u32) {
    unsafe {
        let context = LLVMGetModuleContext(module.as_mut_ptr());
        let kind = LLVMGetMDKindIDInContext(
            context,
            ENTRY_METADATA.as_ptr() as *const c_char,
            ENTRY_METADATA.len() as u32,
        );
        (context, kind)
    }
}

fn has_attachment(value: LLVMValueRef, kind: u32) -> bool {
    unsafe {
        let mut count: usize = 0;
        let entries = LLVMGlobalCopyAllMetadata(value, &mut count);
        if entries.is_null() {
            return false;
        }
        let found = (0..count).any(|i| LLVMValueMetadataEntriesGetKind(entries, i as u32) == kind);
        LLVMDisposeValueMetadataEntries(entries);
        found
    }
}

/// Tag `function` as the specialization entry of `module`.
pub fn mark_entry(module: &Module<'_>, function: FunctionValue<'_>) {
    let (context, kind) = entry_kind(module);
    unsafe {
        let node = LLVMMDNodeInContext2(context, std::ptr::null_mut(), 0);
        LLVMGlobalSetMetadata(function.as_value_ref(), kind, node);
    }
}

pub fn is_entry(module: &Module<'_>, function: FunctionValue<'_>) -> bool {
    let (_, kind) = entry_kind(module);
    has_attachment(function.as_value_ref(), kind)
}

/// The function tagged as entry, if any.
pub fn find_entry<'ctx>(module: &Module<'ctx>) -> Option<FunctionValue<'ctx>> {
    let (_, kind) = entry_kind(module);
    module
        .get_functions()
        .find(|function| has_attachment(function.as_value_ref(), kind))
}

/// Remove every entry tag from `module`.
pub fn unmark_entry(module: &Module<'_>) {
    let (_, kind) = entry_kind(module);
    for function in module.get_functions() {
        let value = function.as_value_ref();
        if has_attachment(value, kind) {
            unsafe { LLVMGlobalEraseMetadata(value, kind) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use inkwell::context::Context;

    #[test]
    fn test_mark_find_unmark() {
        let context = Context::create();
        let module = context.create_module("entry_test");
        let fn_type = context.i32_type().fn_type(&[], false);
        let first = module.add_function("first", fn_type, None);
        let second = module.add_function("second", fn_type, None);
        for function in [first, second] {
            let block = context.append_basic_block(function, "entry");
            let builder = context.create_builder();
            builder.position_at_end(block);
            builder
                .build_return(Some(&context.i32_type().const_zero()))
                .unwrap();
        }

        assert!(find_entry(&module).is_none());

        mark_entry(&module, second);
        assert!(is_entry(&module, second));
        assert!(!is_entry(&module, first));
        assert_eq!(find_entry(&module), Some(second));

        unmark_entry(&module);
        assert!(find_entry(&module).is_none());
    }

    #[test]
    fn test_mark_survives_bitcode() {
        let context = Context::create();
        let module = context.create_module("entry_bitcode");
        let fn_type = context.void_type().fn_type(&[], false);
        let function = module.add_function("entry_fn", fn_type, None);
        let builder = context.create_builder();
        builder.position_at_end(context.append_basic_block(function, "entry"));
        builder.build_return(None).unwrap();
        mark_entry(&module, function);

        let buffer = module.write_bitcode_to_memory();
        let other = Context::create();
        let reloaded = Module::parse_bitcode_from_buffer(&buffer, &other).unwrap();
        let entry = find_entry(&reloaded).unwrap();
        assert_eq!(entry.get_name().to_str().unwrap(), "entry_fn");
    }
}

//! The specialization pass.
//!
//! Rewrites a module so that its target function is replaced, under the
//! same public name, by a wrapper with the reduced signature described by a
//! [`Context`]. The wrapper materializes every bound argument and calls the
//! original, which is demoted to private linkage.
//!
//! # Argument rules
//!
//! | argument | value passed to the original |
//! |---|---|
//! | `Forward(i)` | wrapper parameter `i` |
//! | `Int(v)` | integer constant of the parameter's width |
//! | `Float(v)` | float constant of the parameter's precision |
//! | `Ptr(addr)` | tracked global bound to `addr`, relinked tracked function, or `inttoptr` of the raw address |
//! | `Struct(bytes)` | aggregate reinterpreted from `bytes`, by value or through a stack slot |
//! | `Module(f)` | private copy of another compiled entry, linked in |

use std::cell::RefCell;

use inkwell::attributes::{Attribute, AttributeLoc};
use inkwell::builder::Builder;
use inkwell::context::Context as LlvmContext;
use inkwell::module::{Linkage, Module};
use inkwell::targets::TargetData;
use inkwell::types::{AnyTypeEnum, AsTypeRef, BasicMetadataTypeEnum, BasicType, BasicTypeEnum, FunctionType, PointerType};
use inkwell::values::{BasicMetadataValueEnum, BasicValueEnum, FunctionValue, GlobalValue, IntValue, PointerValue};
use inkwell::AddressSpace;
use tracing::{debug, trace, warn};

use super::entry;
use super::link::{declare_tracked_globals, expose_local, link_fragment, set_value_name, unused_name};
use crate::argument::{Argument, ArgumentKind, Context};
use crate::error::{JitError, JitResult};
use crate::function::CompiledFunction;
use crate::tracker::AddressTracker;

/// Suffix given to the original function once the wrapper takes its name.
const ORIGINAL_SUFFIX: &str = ".original";

/// State for specializing one function in one module.
pub struct Specializer<'ctx, 'a> {
    context: &'ctx LlvmContext,
    module: &'a Module<'ctx>,
    tracker: &'a AddressTracker,
    target_data: &'a TargetData,
    bindings: RefCell<Vec<(String, usize)>>,
}

impl<'ctx, 'a> Specializer<'ctx, 'a> {
    pub fn new(
        context: &'ctx LlvmContext,
        module: &'a Module<'ctx>,
        tracker: &'a AddressTracker,
        target_data: &'a TargetData,
    ) -> Self {
        Self {
            context,
            module,
            tracker,
            target_data,
            bindings: RefCell::new(Vec::new()),
        }
    }

    /// Declarations the pass created for tracked globals, with the address
    /// each must be bound to.
    pub fn into_bindings(self) -> Vec<(String, usize)> {
        self.bindings.into_inner()
    }

    /// Specialize `target_name` according to `args`.
    ///
    /// On return the wrapper owns `target_name`, the original's calling
    /// convention and function attributes, and the entry tag. The original is
    /// private and renamed.
    pub fn run(&self, target_name: &str, args: &Context<'_>) -> JitResult<FunctionValue<'ctx>> {
        let target = self
            .module
            .get_function(target_name)
            .ok_or_else(|| JitError::UnknownSymbol(target_name.to_string()))?;

        let expected = target.count_params() as usize;
        if expected != args.len() {
            return Err(JitError::ArityMismatch {
                function: target_name.to_string(),
                expected,
                found: args.len(),
            });
        }

        let param_types: Vec<BasicTypeEnum<'ctx>> =
            target.get_params().iter().map(|param| param.get_type()).collect();

        let wrapper_type = self.wrapper_type(target, &param_types, args);
        let wrapper = self.module.add_function("", wrapper_type, Some(Linkage::External));

        let builder = self.context.create_builder();
        let entry_block = self.context.append_basic_block(wrapper, "entry");
        builder.position_at_end(entry_block);

        let call_args = self.inline_args(target_name, target, &param_types, args, wrapper, &builder)?;

        // Linking fragments may have replaced declarations; look the target up again.
        let target = self
            .module
            .get_function(target_name)
            .ok_or_else(|| JitError::UnknownSymbol(target_name.to_string()))?;

        let returns_value = target.get_type().get_return_type().is_some();
        let call = builder.build_call(target, &call_args, if returns_value { "result" } else { "" })?;
        call.set_call_convention(target.get_call_conventions());

        match call.try_as_basic_value().left() {
            Some(value) => builder.build_return(Some(&value))?,
            None => builder.build_return(None)?,
        };

        target.set_linkage(Linkage::Private);
        set_value_name(&target, &format!("{target_name}{ORIGINAL_SUFFIX}"));
        set_value_name(&wrapper, target_name);
        wrapper.set_call_conventions(target.get_call_conventions());
        for attribute in target.attributes(AttributeLoc::Function) {
            wrapper.add_attribute(AttributeLoc::Function, attribute);
        }

        entry::mark_entry(self.module, wrapper);

        debug!(
            function = target_name,
            params = expected,
            new_params = wrapper.count_params(),
            "specialized function"
        );
        Ok(wrapper)
    }

    /// Signature of the wrapper: the original return type, and for each new
    /// slot the type of the first original parameter forwarded to it.
    fn wrapper_type(
        &self,
        target: FunctionValue<'ctx>,
        param_types: &[BasicTypeEnum<'ctx>],
        args: &Context<'_>,
    ) -> FunctionType<'ctx> {
        let fn_type = target.get_type();
        let params: Vec<BasicMetadataTypeEnum<'ctx>> = args
            .forward_sources()
            .into_iter()
            .enumerate()
            .map(|(slot, source)| match source {
                Some(position) => param_types[position].into(),
                None => {
                    warn!(slot, "no parameter forwards to this slot, it is ignored");
                    self.context.i64_type().into()
                }
            })
            .collect();

        match fn_type.get_return_type() {
            Some(ret) => ret.fn_type(&params, fn_type.is_var_arg()),
            None => self.context.void_type().fn_type(&params, fn_type.is_var_arg()),
        }
    }

    /// The argument list for the call to the original, one value per
    /// original parameter in order.
    fn inline_args(
        &self,
        function: &str,
        target: FunctionValue<'ctx>,
        param_types: &[BasicTypeEnum<'ctx>],
        args: &Context<'_>,
        wrapper: FunctionValue<'ctx>,
        builder: &Builder<'ctx>,
    ) -> JitResult<Vec<BasicMetadataValueEnum<'ctx>>> {
        let mut call_args = Vec::with_capacity(args.len());

        for (index, (arg, &param_type)) in args.iter().zip(param_types).enumerate() {
            let mismatch = || JitError::ArgumentType {
                function: function.to_string(),
                index,
                kind: arg.kind(),
                ty: type_name(param_type),
            };

            let value: BasicValueEnum<'ctx> = match arg {
                Argument::Forward(slot) => wrapper
                    .get_nth_param(*slot as u32)
                    .ok_or_else(mismatch)?,

                Argument::Int(value) => match param_type {
                    BasicTypeEnum::IntType(int_type) => int_type.const_int(*value as u64, true).into(),
                    _ => return Err(mismatch()),
                },

                Argument::Float(value) => match param_type {
                    BasicTypeEnum::FloatType(float_type) => float_type.const_float(*value).into(),
                    _ => return Err(mismatch()),
                },

                Argument::Ptr(address) => match param_type {
                    BasicTypeEnum::PointerType(ptr_type) => {
                        self.pointer_arg(*address as usize, ptr_type)?.into()
                    }
                    _ => return Err(mismatch()),
                },

                Argument::Struct(bytes) => {
                    self.struct_arg(function, index, target, param_type, bytes, builder)?
                }

                Argument::Module(compiled) => match param_type {
                    BasicTypeEnum::PointerType(ptr_type) => self.module_arg(compiled, ptr_type)?.into(),
                    _ => return Err(mismatch()),
                },
            };

            trace!(index, kind = %arg.kind(), "bound parameter");
            call_args.push(value.into());
        }

        Ok(call_args)
    }

    /// Reference the symbol at `address`. A tracked global variable becomes a
    /// declaration bound to `address`, a tracked function is relinked, and
    /// anything else is encoded as a constant.
    fn pointer_arg(&self, address: usize, ptr_type: PointerType<'ctx>) -> JitResult<PointerValue<'ctx>> {
        let Some((name, fragment)) = self
            .tracker
            .materialize_module(address as *const _, self.context)?
        else {
            trace!(address = format_args!("{address:#x}"), "untracked address, passing as constant");
            return Ok(self
                .context
                .i64_type()
                .const_int(address as u64, false)
                .const_to_pointer(ptr_type));
        };

        if let Some(global) = fragment.get_global(&name) {
            let declaration = self.declare_global(&name, address, global)?;
            debug!(symbol = %name, "bound tracked global");
            return Ok(cast_pointer(declaration.as_pointer_value(), ptr_type));
        }

        let Some(function) = fragment.get_function(&name) else {
            return Err(JitError::UnexpectedSymbol(name));
        };
        let linked_name = expose_local(self.module, function.as_global_value());
        self.link(fragment)?;

        let function = self
            .module
            .get_function(&linked_name)
            .ok_or_else(|| JitError::Link(format!("`{linked_name}` missing after link")))?;
        function.set_linkage(Linkage::Private);

        debug!(symbol = %name, linked = %linked_name, "relinked tracked function");
        Ok(cast_pointer(function.as_global_value().as_pointer_value(), ptr_type))
    }

    /// External declaration standing for the tracked global `name` at
    /// `address`, typed like its definition in the source module.
    fn declare_global(
        &self,
        name: &str,
        address: usize,
        source: GlobalValue<'ctx>,
    ) -> JitResult<GlobalValue<'ctx>> {
        let value_type = BasicTypeEnum::try_from(source.as_pointer_value().get_type().get_element_type())
            .map_err(|_| JitError::UnexpectedSymbol(name.to_string()))?;

        let reusable = self
            .module
            .get_global(name)
            .filter(|existing| existing.is_declaration() && self.tracker.address_of(name) == Some(address));
        let declaration = match reusable {
            Some(existing) => existing,
            None => self.module.add_global(value_type, None, &unused_name(self.module, name)),
        };

        let declared_name = declaration.get_name().to_string_lossy().into_owned();
        self.bindings.borrow_mut().push((declared_name, address));
        Ok(declaration)
    }

    /// Link `fragment` after replacing its tracked globals with declarations.
    fn link(&self, fragment: Module<'ctx>) -> JitResult<()> {
        declare_tracked_globals(&fragment, self.tracker);
        link_fragment(self.module, fragment)
    }

    /// Reinterpret `bytes` as the parameter's aggregate.
    ///
    /// Aggregates passed by implicit pointer get a stack slot in the wrapper
    /// and the slot's address is passed. By-value parameters are loaded back
    /// out of the slot with the parameter's type.
    fn struct_arg(
        &self,
        function: &str,
        index: usize,
        target: FunctionValue<'ctx>,
        param_type: BasicTypeEnum<'ctx>,
        bytes: &[u8],
        builder: &Builder<'ctx>,
    ) -> JitResult<BasicValueEnum<'ctx>> {
        let (aggregate, by_pointer) = match param_type {
            BasicTypeEnum::PointerType(ptr_type) => {
                let pointee = by_pointer_type(target, index, ptr_type).ok_or_else(|| JitError::ArgumentType {
                    function: function.to_string(),
                    index,
                    kind: ArgumentKind::Struct,
                    ty: type_name(param_type),
                })?;
                (pointee, true)
            }
            other => (other, false),
        };

        let expected = self.target_data.get_abi_size(&aggregate);
        if expected != bytes.len() as u64 {
            return Err(JitError::StructSize {
                function: function.to_string(),
                index,
                ty: type_name(aggregate),
                expected,
                found: bytes.len(),
            });
        }

        let slot = builder.build_alloca(aggregate, "param_alloc")?;
        let raw = self.byte_array(bytes);
        let raw_slot = builder.build_pointer_cast(
            slot,
            raw.get_type().ptr_type(AddressSpace::default()),
            "param_bytes",
        )?;
        builder.build_store(raw_slot, raw)?;

        if by_pointer {
            let BasicTypeEnum::PointerType(ptr_type) = param_type else {
                unreachable!("by-pointer aggregates have pointer parameters");
            };
            Ok(cast_pointer_in(builder, slot, ptr_type)?.into())
        } else {
            Ok(builder.build_load(slot, "param_value")?)
        }
    }

    fn byte_array(&self, bytes: &[u8]) -> inkwell::values::ArrayValue<'ctx> {
        let i8_type = self.context.i8_type();
        let values: Vec<IntValue<'ctx>> = bytes
            .iter()
            .map(|byte| i8_type.const_int(u64::from(*byte), false))
            .collect();
        i8_type.const_array(&values)
    }

    /// Link a private copy of another compiled function and reference its entry.
    fn module_arg(
        &self,
        compiled: &CompiledFunction,
        ptr_type: PointerType<'ctx>,
    ) -> JitResult<PointerValue<'ctx>> {
        let fragment = compiled.materialize(self.context)?;
        let fragment_name = fragment.get_name().to_string_lossy().into_owned();
        let entry_fn = entry::find_entry(&fragment).ok_or_else(|| JitError::MissingEntry(fragment_name))?;

        let linked_name = unused_name(self.module, &format!("{}.specialized", compiled.entry_name()));
        set_value_name(&entry_fn, &linked_name);
        entry::unmark_entry(&fragment);

        self.bindings.borrow_mut().extend(compiled.bindings().iter().cloned());
        self.link(fragment)?;

        let linked = self
            .module
            .get_function(&linked_name)
            .ok_or_else(|| JitError::Link(format!("`{linked_name}` missing after link")))?;
        linked.set_linkage(Linkage::Private);

        debug!(function = compiled.entry_name(), linked = %linked_name, "linked compiled function");
        Ok(cast_pointer(linked.as_global_value().as_pointer_value(), ptr_type))
    }
}

/// The aggregate behind a by-pointer parameter: its `byval` type when
/// present, otherwise the pointee.
fn by_pointer_type<'ctx>(
    target: FunctionValue<'ctx>,
    index: usize,
    ptr_type: PointerType<'ctx>,
) -> Option<BasicTypeEnum<'ctx>> {
    let byval = Attribute::get_named_enum_kind_id("byval");
    let declared: AnyTypeEnum<'ctx> = match target.get_enum_attribute(AttributeLoc::Param(index as u32), byval) {
        // SAFETY: the attribute's type belongs to the target's context.
        Some(attribute) if attribute.is_type() => unsafe { AnyTypeEnum::new(attribute.get_type_value().as_type_ref()) },
        _ => ptr_type.get_element_type(),
    };
    BasicTypeEnum::try_from(declared).ok()
}

fn cast_pointer<'ctx>(value: PointerValue<'ctx>, ptr_type: PointerType<'ctx>) -> PointerValue<'ctx> {
    if value.get_type() == ptr_type {
        value
    } else {
        value.const_cast(ptr_type)
    }
}

fn cast_pointer_in<'ctx>(
    builder: &Builder<'ctx>,
    value: PointerValue<'ctx>,
    ptr_type: PointerType<'ctx>,
) -> JitResult<PointerValue<'ctx>> {
    if value.get_type() == ptr_type {
        Ok(value)
    } else {
        Ok(builder.build_pointer_cast(value, ptr_type, "param_ptr")?)
    }
}

fn type_name(ty: BasicTypeEnum<'_>) -> String {
    ty.print_to_string().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use inkwell::memory_buffer::MemoryBuffer;
    use inkwell::targets::{InitializationConfig, Target, TargetMachine};

    const IR: &str = r#"
%struct.Big = type { i64, i64, i64, i64 }

define i32 @add(i32 %a, i32 %b) #0 {
  %r = add i32 %a, %b
  ret i32 %r
}

define void @sink(i32 %a) {
  ret void
}

define i64 @sum_big(%struct.Big* byval(%struct.Big) align 8 %b) {
  %p = getelementptr %struct.Big, %struct.Big* %b, i32 0, i32 3
  %v = load i64, i64* %p
  ret i64 %v
}

attributes #0 = { noinline }
"#;

    fn parse(context: &LlvmContext) -> Module<'_> {
        let buffer = MemoryBuffer::create_from_memory_range_copy(IR.as_bytes(), "specialize_test");
        context.create_module_from_ir(buffer).unwrap()
    }

    fn target_data() -> TargetData {
        Target::initialize_native(&InitializationConfig::default()).unwrap();
        let triple = TargetMachine::get_default_triple();
        let target = Target::from_triple(&triple).unwrap();
        let machine = target
            .create_target_machine(
                &triple,
                "generic",
                "",
                inkwell::OptimizationLevel::None,
                inkwell::targets::RelocMode::Default,
                inkwell::targets::CodeModel::Default,
            )
            .unwrap();
        machine.get_target_data()
    }

    #[test]
    fn test_wrapper_takes_name_and_signature() {
        let context = LlvmContext::create();
        let module = parse(&context);
        let tracker = AddressTracker::new();
        let data = target_data();
        let args = Context::from_args(vec![Argument::Forward(0), Argument::Int(1)]);

        let wrapper = Specializer::new(&context, &module, &tracker, &data)
            .run("add", &args)
            .unwrap();

        let public = module.get_function("add").unwrap();
        assert_eq!(public, wrapper);
        assert_eq!(wrapper.count_params(), 1);
        assert_eq!(wrapper.get_linkage(), Linkage::External);
        assert!(entry::is_entry(&module, wrapper));

        let original = module.get_function("add.original").unwrap();
        assert_eq!(original.get_linkage(), Linkage::Private);
        assert!(!entry::is_entry(&module, original));

        let noinline = Attribute::get_named_enum_kind_id("noinline");
        assert!(wrapper.get_enum_attribute(AttributeLoc::Function, noinline).is_some());
        assert!(module.verify().is_ok());
    }

    #[test]
    fn test_void_target() {
        let context = LlvmContext::create();
        let module = parse(&context);
        let tracker = AddressTracker::new();
        let data = target_data();
        let args = Context::from_args(vec![Argument::Int(3)]);

        let wrapper = Specializer::new(&context, &module, &tracker, &data)
            .run("sink", &args)
            .unwrap();
        assert_eq!(wrapper.count_params(), 0);
        assert!(wrapper.get_type().get_return_type().is_none());
        assert!(module.verify().is_ok());
    }

    #[test]
    fn test_arity_mismatch() {
        let context = LlvmContext::create();
        let module = parse(&context);
        let tracker = AddressTracker::new();
        let data = target_data();
        let args = Context::from_args(vec![Argument::Forward(0)]);

        let err = Specializer::new(&context, &module, &tracker, &data)
            .run("add", &args)
            .unwrap_err();
        assert!(matches!(err, JitError::ArityMismatch { expected: 2, found: 1, .. }));
    }

    #[test]
    fn test_unknown_symbol() {
        let context = LlvmContext::create();
        let module = parse(&context);
        let tracker = AddressTracker::new();
        let data = target_data();

        let err = Specializer::new(&context, &module, &tracker, &data)
            .run("missing", &Context::new())
            .unwrap_err();
        assert!(matches!(err, JitError::UnknownSymbol(name) if name == "missing"));
    }

    #[test]
    fn test_kind_mismatch() {
        let context = LlvmContext::create();
        let module = parse(&context);
        let tracker = AddressTracker::new();
        let data = target_data();
        let args = Context::from_args(vec![Argument::Float(1.0), Argument::Forward(0)]);

        let err = Specializer::new(&context, &module, &tracker, &data)
            .run("add", &args)
            .unwrap_err();
        assert!(matches!(
            err,
            JitError::ArgumentType { index: 0, kind: ArgumentKind::Float, .. }
        ));
    }

    #[test]
    fn test_struct_size_is_checked() {
        let context = LlvmContext::create();
        let module = parse(&context);
        let tracker = AddressTracker::new();
        let data = target_data();
        let args = Context::from_args(vec![Argument::Struct(vec![0; 8])]);

        let err = Specializer::new(&context, &module, &tracker, &data)
            .run("sum_big", &args)
            .unwrap_err();
        assert!(matches!(err, JitError::StructSize { expected: 32, found: 8, .. }));
    }

    #[test]
    fn test_byval_struct_uses_stack_slot() {
        let context = LlvmContext::create();
        let module = parse(&context);
        let tracker = AddressTracker::new();
        let data = target_data();
        let args = Context::from_args(vec![Argument::Struct(vec![7; 32])]);

        let wrapper = Specializer::new(&context, &module, &tracker, &data)
            .run("sum_big", &args)
            .unwrap();
        assert_eq!(wrapper.count_params(), 0);
        let text = module.print_to_string().to_string();
        assert!(text.contains("param_alloc"));
        assert!(module.verify().is_ok());
    }

    #[test]
    fn test_forward_gap_gets_placeholder() {
        let context = LlvmContext::create();
        let module = parse(&context);
        let tracker = AddressTracker::new();
        let data = target_data();
        let args = Context::from_args(vec![Argument::Forward(2), Argument::Forward(0)]);

        let wrapper = Specializer::new(&context, &module, &tracker, &data)
            .run("add", &args)
            .unwrap();
        assert_eq!(wrapper.count_params(), 3);
        let slot = wrapper.get_nth_param(1).unwrap();
        assert_eq!(slot.get_type(), BasicTypeEnum::from(context.i64_type()));
        assert!(module.verify().is_ok());
    }
}

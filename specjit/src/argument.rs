//! Argument model.
//!
//! A [`Context`] holds one [`Argument`] per parameter of the function being
//! specialized, in parameter order. Each argument says how that parameter is
//! rewritten in the specialized function: forwarded from the new signature,
//! replaced by a constant, relinked to a tracked symbol, or bound to another
//! compiled function.
//!
//! ```rust,ignore
//! use specjit::{Argument, Context};
//!
//! // inc(x) = add(x, 1)
//! let context = Context::from_args(vec![Argument::Forward(0), Argument::Int(1)]);
//! assert_eq!(context.new_arity(), 1);
//! ```

use std::ffi::c_void;
use std::fmt;

use crate::function::CompiledFunction;

/// Classification of an [`Argument`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArgumentKind {
    Forward,
    Int,
    Float,
    Ptr,
    Struct,
    Module,
}

impl ArgumentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArgumentKind::Forward => "forward",
            ArgumentKind::Int => "int",
            ArgumentKind::Float => "float",
            ArgumentKind::Ptr => "pointer",
            ArgumentKind::Struct => "struct",
            ArgumentKind::Module => "module",
        }
    }
}

impl fmt::Display for ArgumentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How one parameter of the original function is rewritten.
///
/// The lifetime ties `Module` arguments to the compiled function they
/// reference; that function must outlive the compilation that links it.
#[derive(Clone)]
pub enum Argument<'f> {
    /// Left unbound; becomes parameter `n` of the specialized function.
    Forward(usize),
    /// Integer constant, truncated or extended to the parameter's width.
    Int(i64),
    /// Floating-point constant, converted to the parameter's precision.
    Float(f64),
    /// Constant address. Relinked as the real symbol when the address is tracked.
    Ptr(*const c_void),
    /// Constant aggregate in the target's native memory layout.
    Struct(Vec<u8>),
    /// Direct reference to another specialized function.
    Module(&'f CompiledFunction),
}

impl<'f> Argument<'f> {
    pub fn kind(&self) -> ArgumentKind {
        match self {
            Argument::Forward(_) => ArgumentKind::Forward,
            Argument::Int(_) => ArgumentKind::Int,
            Argument::Float(_) => ArgumentKind::Float,
            Argument::Ptr(_) => ArgumentKind::Ptr,
            Argument::Struct(_) => ArgumentKind::Struct,
            Argument::Module(_) => ArgumentKind::Module,
        }
    }

    pub fn as_forward(&self) -> Option<usize> {
        match self {
            Argument::Forward(index) => Some(*index),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Argument::Int(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Argument::Float(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_ptr(&self) -> Option<*const c_void> {
        match self {
            Argument::Ptr(address) => Some(*address),
            _ => None,
        }
    }

    pub fn as_struct(&self) -> Option<&[u8]> {
        match self {
            Argument::Struct(bytes) => Some(bytes),
            _ => None,
        }
    }

    pub fn as_module(&self) -> Option<&'f CompiledFunction> {
        match self {
            Argument::Module(function) => Some(*function),
            _ => None,
        }
    }

    /// Build a `Struct` argument from the in-memory bytes of `value`.
    ///
    /// # Safety
    ///
    /// `T` must contain no uninitialized bytes (including padding), and its
    /// layout must match the parameter's aggregate type on the target.
    pub unsafe fn from_value<T: Copy>(value: &T) -> Self {
        let bytes = std::slice::from_raw_parts(
            value as *const T as *const u8,
            std::mem::size_of::<T>(),
        );
        Argument::Struct(bytes.to_vec())
    }
}

impl fmt::Debug for Argument<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Argument::Forward(index) => write!(f, "Forward({index})"),
            Argument::Int(value) => write!(f, "Int({value})"),
            Argument::Float(value) => write!(f, "Float({value})"),
            Argument::Ptr(address) => write!(f, "Ptr({address:p})"),
            Argument::Struct(bytes) => write!(f, "Struct({} bytes)", bytes.len()),
            Argument::Module(function) => write!(f, "Module({})", function.entry_name()),
        }
    }
}

/// Ordered per-parameter rewrite rules for one specialization request.
///
/// The setters append in parameter order, so a context is built by calling
/// exactly one setter per parameter of the target function.
#[derive(Debug, Clone, Default)]
pub struct Context<'f> {
    args: Vec<Argument<'f>>,
}

impl<'f> Context<'f> {
    pub fn new() -> Self {
        Self { args: Vec::new() }
    }

    pub fn with_capacity(params: usize) -> Self {
        Self {
            args: Vec::with_capacity(params),
        }
    }

    pub fn from_args(args: Vec<Argument<'f>>) -> Self {
        Self { args }
    }

    pub fn push(&mut self, arg: Argument<'f>) -> &mut Self {
        self.args.push(arg);
        self
    }

    pub fn set_parameter_index(&mut self, new_index: usize) -> &mut Self {
        self.push(Argument::Forward(new_index))
    }

    pub fn set_parameter_int(&mut self, value: i64) -> &mut Self {
        self.push(Argument::Int(value))
    }

    pub fn set_parameter_float(&mut self, value: f64) -> &mut Self {
        self.push(Argument::Float(value))
    }

    pub fn set_parameter_ptr(&mut self, address: *const c_void) -> &mut Self {
        self.push(Argument::Ptr(address))
    }

    pub fn set_parameter_struct(&mut self, bytes: impl Into<Vec<u8>>) -> &mut Self {
        self.push(Argument::Struct(bytes.into()))
    }

    pub fn set_parameter_module(&mut self, function: &'f CompiledFunction) -> &mut Self {
        self.push(Argument::Module(function))
    }

    /// Number of bound parameters. Must equal the target's parameter count.
    pub fn len(&self) -> usize {
        self.args.len()
    }

    pub fn is_empty(&self) -> bool {
        self.args.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Argument<'f>> {
        self.args.get(index)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Argument<'f>> {
        self.args.iter()
    }

    /// Parameter count of the specialized function: one past the largest
    /// forward index, or zero when nothing is forwarded.
    pub fn new_arity(&self) -> usize {
        self.args
            .iter()
            .filter_map(Argument::as_forward)
            .map(|index| index + 1)
            .max()
            .unwrap_or(0)
    }

    /// For each slot of the specialized signature, the first original
    /// parameter forwarded to it. `None` marks a slot nothing forwards to.
    pub fn forward_sources(&self) -> Vec<Option<usize>> {
        let mut sources = vec![None; self.new_arity()];
        for (position, arg) in self.args.iter().enumerate() {
            if let Some(index) = arg.as_forward() {
                sources[index].get_or_insert(position);
            }
        }
        sources
    }
}

impl<'a, 'f> IntoIterator for &'a Context<'f> {
    type Item = &'a Argument<'f>;
    type IntoIter = std::slice::Iter<'a, Argument<'f>>;

    fn into_iter(self) -> Self::IntoIter {
        self.args.iter()
    }
}

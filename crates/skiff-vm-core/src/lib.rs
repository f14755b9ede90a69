//! # Skiff VM Core
//!
//! The execution core of the Skiff scripting language: NaN-boxed values, the
//! heap object family, the tracing mark-and-sweep garbage collector, the call
//! frame stack and the bytecode interpreter, plus the host-facing embedding
//! surface (API stack, handles, configuration callbacks).
//!
//! A [`Vm`] is single-threaded and owns its heap, value stack, call stack and
//! handle list exclusively. Multiple VMs in one process share nothing.

#![warn(clippy::all)]

pub mod error;
pub mod format;
mod gc;
pub mod heap;
mod interpreter;
pub mod object;
pub mod symbol;
pub mod value;
pub mod vm;

pub use error::{ErrorKind, VmError};
pub use format::{display_value, type_name};
pub use heap::{Heap, Mark, ObjRef};
pub use object::{
    ClassBind, ClassFinalizer, MethodBind, NativeFn, ObjClass, ObjData, ObjFunction, ObjInstance,
    ObjKind, ObjModule, ObjNativeFn, ObjReference, ObjString, ObjWeakRef, SymbolSlot,
};
pub use symbol::{SymbolId, SymbolTable};
pub use value::Value;
pub use vm::{ErrorFn, Handle, ModuleFn, PrintFn, ValueType, Vm, VmParams};

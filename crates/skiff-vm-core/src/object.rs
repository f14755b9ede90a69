//! The heap object family
//!
//! Every garbage-collected object is one [`ObjData`] variant living in a heap
//! slot behind a common header (see [`crate::heap`]). Classes reference their
//! owning module (back edge, not ownership); a base-class edge is traced by
//! the GC but never owned. The root set is external, so these cycles are
//! safe.

use std::rc::Rc;

use skiff_vm_bytecode::Instruction;

use crate::error::VmError;
use crate::heap::ObjRef;
use crate::symbol::SymbolId;
use crate::value::Value;
use crate::vm::Vm;

/// Host-native function: receives the VM and the argument count; its stack
/// view starts at the first argument and slot 0 receives the return value.
pub type NativeFn = fn(&mut Vm, i32) -> Result<(), VmError>;

/// Host finalizer callback run on an instance's or reference's inline extra
/// data when the object is collected.
pub type ClassFinalizer = Rc<dyn Fn(&mut Vm, &mut [u8])>;

/// One named value slot in a class or module symbol array.
///
/// Slots created as gap filler when a symbol id beyond the current length is
/// stored carry no name and a null value; lookups treat them as absent.
#[derive(Debug, Clone, Copy)]
pub struct SymbolSlot {
    /// The interned name, or `None` for a gap slot.
    pub name: Option<SymbolId>,
    /// The stored value.
    pub value: Value,
}

/// Object kind discriminant, used for type queries and error messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjKind {
    /// Owned byte string with a precomputed hash.
    String,
    /// Top-level namespace with named variable slots and an initializer.
    Module,
    /// Class: methods, statics, field initializers, optional base.
    Class,
    /// Class instance with a field map and inline extra data.
    Instance,
    /// Compiled script function.
    Function,
    /// Host-native function.
    NativeFn,
    /// Class-tagged opaque host object (owned, participates in dispatch).
    Reference,
    /// Class-tagged raw host pointer (not owned, not finalized).
    WeakRef,
}

impl ObjKind {
    /// Human-readable kind name for diagnostics.
    pub const fn name(self) -> &'static str {
        match self {
            ObjKind::String => "String",
            ObjKind::Module => "Module",
            ObjKind::Class => "Class",
            ObjKind::Instance => "Instance",
            ObjKind::Function => "Function",
            ObjKind::NativeFn => "NativeFunction",
            ObjKind::Reference => "Reference",
            ObjKind::WeakRef => "WeakRef",
        }
    }
}

/// Heap string: owned text plus a precomputed 32-bit FNV-1a hash used to
/// short-circuit equality.
#[derive(Debug, Clone)]
pub struct ObjString {
    /// The text.
    pub text: String,
    /// FNV-1a hash of `text`.
    pub hash: u32,
}

impl ObjString {
    /// Build a string object, precomputing its hash.
    pub fn new(text: String) -> Self {
        let hash = fnv1a(text.as_bytes());
        Self { text, hash }
    }
}

/// 32-bit FNV-1a.
pub(crate) fn fnv1a(bytes: &[u8]) -> u32 {
    let mut hash: u32 = 0x811C_9DC5;
    for &b in bytes {
        hash ^= b as u32;
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash
}

/// A top-level namespace populated by executing a source file once.
#[derive(Debug)]
pub struct ObjModule {
    /// Module name.
    pub name: String,
    /// Named variable slots, indexed by symbol id (sparse; gaps are nameless
    /// null slots).
    pub variables: Vec<SymbolSlot>,
    /// The compiled top-level body, set by the compiler.
    pub init: Option<ObjRef>,
}

/// A class: symbol slots (methods and statics, indexed by symbol id), field
/// initializers applied to new instances, an optional base class and an
/// optional host finalizer.
pub struct ObjClass {
    /// Class name.
    pub name: String,
    /// Base class, observed by the GC but not owned.
    pub base: Option<ObjRef>,
    /// Owning module (back edge).
    pub module: ObjRef,
    /// Methods and static variables, indexed by symbol id.
    pub symbols: Vec<SymbolSlot>,
    /// Field initializers applied to each new instance, in declaration order.
    pub field_initializers: Vec<SymbolSlot>,
    /// Size of the inline extra-data buffer given to each instance.
    pub extra_data_size: usize,
    /// Host finalizer run on collected instances/references of this class.
    pub finalizer: Option<ClassFinalizer>,
}

impl std::fmt::Debug for ObjClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjClass")
            .field("name", &self.name)
            .field("base", &self.base)
            .field("symbols", &self.symbols.len())
            .field("has_finalizer", &self.finalizer.is_some())
            .finish()
    }
}

/// A class instance: field map keyed by interned symbol id plus an inline
/// extra-data buffer sized by the class.
#[derive(Debug)]
pub struct ObjInstance {
    /// The instance's class.
    pub class: ObjRef,
    /// Field values keyed by symbol id.
    pub fields: rustc_hash::FxHashMap<SymbolId, Value>,
    /// Host extra data, `class.extra_data_size` bytes.
    pub extra: Vec<u8>,
}

/// A compiled script function.
///
/// Code, constants and the line sidecar are shared (`Rc`) with executing call
/// frames so the dispatch loop never re-borrows the heap per instruction.
#[derive(Debug)]
pub struct ObjFunction {
    /// Function name (the module name for initializer bodies).
    pub name: String,
    /// Declared positional parameter count; -1 means variadic.
    pub arity: i32,
    /// Instruction sequence.
    pub code: Rc<[Instruction]>,
    /// Constant pool.
    pub constants: Rc<[Value]>,
    /// Source line for each instruction (parallel to `code`).
    pub lines: Rc<[u16]>,
    /// Upper bound of frame slots this function touches.
    pub needed_stack_space: usize,
    /// Owning module.
    pub module: ObjRef,
}

/// A host-native function with inline static value slots and extra data.
pub struct ObjNativeFn {
    /// The host entry point.
    pub func: NativeFn,
    /// Declared arity; -1 means variadic.
    pub arity: i32,
    /// Static value slots readable/writable through the API.
    pub statics: Vec<Value>,
    /// Inline host data.
    pub extra: Vec<u8>,
}

impl std::fmt::Debug for ObjNativeFn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjNativeFn")
            .field("arity", &self.arity)
            .field("statics", &self.statics.len())
            .finish()
    }
}

/// A class-tagged opaque host object. Participates in GC and method dispatch;
/// only its class chain is consulted for symbols.
#[derive(Debug)]
pub struct ObjReference {
    /// Dispatch class, if bound.
    pub class: Option<ObjRef>,
    /// Inline host data.
    pub extra: Vec<u8>,
}

/// A class-tagged raw host pointer. Traced through its class only; the
/// pointee is never followed, never owned, and not nullified when the VM
/// outlives it — the host owns that lifetime.
#[derive(Debug)]
pub struct ObjWeakRef {
    /// Dispatch class, if bound.
    pub class: Option<ObjRef>,
    /// Opaque host pointer value.
    pub data: usize,
}

/// The discriminated heap object record.
#[derive(Debug)]
pub enum ObjData {
    /// See [`ObjString`].
    String(ObjString),
    /// See [`ObjModule`].
    Module(ObjModule),
    /// See [`ObjClass`].
    Class(ObjClass),
    /// See [`ObjInstance`].
    Instance(ObjInstance),
    /// See [`ObjFunction`].
    Function(ObjFunction),
    /// See [`ObjNativeFn`].
    NativeFn(ObjNativeFn),
    /// See [`ObjReference`].
    Reference(ObjReference),
    /// See [`ObjWeakRef`].
    WeakRef(ObjWeakRef),
}

impl ObjData {
    /// Kind discriminant.
    pub const fn kind(&self) -> ObjKind {
        match self {
            ObjData::String(_) => ObjKind::String,
            ObjData::Module(_) => ObjKind::Module,
            ObjData::Class(_) => ObjKind::Class,
            ObjData::Instance(_) => ObjKind::Instance,
            ObjData::Function(_) => ObjKind::Function,
            ObjData::NativeFn(_) => ObjKind::NativeFn,
            ObjData::Reference(_) => ObjKind::Reference,
            ObjData::WeakRef(_) => ObjKind::WeakRef,
        }
    }

    /// Is this a script or native function?
    pub const fn is_function(&self) -> bool {
        matches!(self, ObjData::Function(_) | ObjData::NativeFn(_))
    }

    /// Approximate allocation size charged against the heap budget.
    pub fn accounted_size(&self) -> usize {
        let payload = match self {
            ObjData::String(s) => s.text.capacity(),
            ObjData::Module(m) => {
                m.name.len() + m.variables.capacity() * std::mem::size_of::<SymbolSlot>()
            }
            ObjData::Class(c) => {
                c.name.len()
                    + (c.symbols.capacity() + c.field_initializers.capacity())
                        * std::mem::size_of::<SymbolSlot>()
            }
            ObjData::Instance(i) => {
                i.extra.capacity()
                    + i.fields.len() * (std::mem::size_of::<SymbolId>() + std::mem::size_of::<Value>())
            }
            ObjData::Function(f) => {
                f.name.len()
                    + f.code.len() * std::mem::size_of::<Instruction>()
                    + f.constants.len() * std::mem::size_of::<Value>()
                    + f.lines.len() * std::mem::size_of::<u16>()
            }
            ObjData::NativeFn(n) => {
                n.statics.capacity() * std::mem::size_of::<Value>() + n.extra.capacity()
            }
            ObjData::Reference(r) => r.extra.capacity(),
            ObjData::WeakRef(_) => 0,
        };
        std::mem::size_of::<ObjData>() + payload
    }
}

/// Definition of one native method inside a [`ClassBind`].
#[derive(Clone, Copy)]
pub struct MethodBind<'a> {
    /// Method name installed into the class symbol table.
    pub name: &'a str,
    /// The native entry point.
    pub func: NativeFn,
    /// Declared arity; -1 means variadic.
    pub arity: i32,
    /// Number of inline static value slots.
    pub num_statics: u32,
    /// Inline extra-data bytes for the native function object.
    pub extra_data_size: u16,
}

impl<'a> MethodBind<'a> {
    /// Shorthand for a method with no statics and no extra data.
    pub fn new(name: &'a str, func: NativeFn, arity: i32) -> Self {
        Self { name, func, arity, num_statics: 0, extra_data_size: 0 }
    }
}

/// Host-side class installation: name, per-instance extra-data size, native
/// method table and optional finalizer.
pub struct ClassBind<'a> {
    /// Class name installed into the target module.
    pub name: &'a str,
    /// Inline extra-data bytes given to each instance/reference.
    pub extra_data_size: usize,
    /// Native methods.
    pub methods: &'a [MethodBind<'a>],
    /// Optional finalizer run when instances/references are collected.
    pub finalizer: Option<ClassFinalizer>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_string_hash_is_content_based() {
        let a = ObjString::new("hello".to_string());
        let b = ObjString::new("hello".to_string());
        let c = ObjString::new("world".to_string());
        assert_eq!(a.hash, b.hash);
        assert_ne!(a.hash, c.hash);
    }

    #[test]
    fn test_kind_names() {
        let s = ObjData::String(ObjString::new(String::new()));
        assert_eq!(s.kind(), ObjKind::String);
        assert_eq!(s.kind().name(), "String");
        assert!(!s.is_function());
    }
}

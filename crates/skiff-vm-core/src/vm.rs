//! The VM instance: heap, API value stack, call frames, handles, module
//! registry, configuration callbacks and the embedding surface.
//!
//! Host code exchanges values with scripts through an indexed stack view:
//! slot `i` of the view is `stack[stack_top + i]`. Inside a native callback
//! the view starts at the callback's first argument; the callback writes its
//! return value into slot 0.

use std::rc::Rc;

use rustc_hash::FxHashMap;
use skiff_vm_bytecode::Instruction;

use crate::error::{ErrorKind, VmError};
use crate::format::display_value;
use crate::heap::{Heap, ObjRef};
use crate::object::{
    ClassBind, NativeFn, ObjClass, ObjData, ObjFunction, ObjInstance, ObjKind, ObjModule,
    ObjNativeFn, ObjReference, ObjString, ObjWeakRef, SymbolSlot,
};
use crate::symbol::{SymbolId, SymbolTable};
use crate::value::Value;

/// Error/diagnostic callback: `(kind, line, message)`. Line is -1 when no
/// source position applies.
pub type ErrorFn = Box<dyn FnMut(ErrorKind, i32, &str)>;
/// Script print callback.
pub type PrintFn = Box<dyn FnMut(&str)>;
/// Module resolver: `(importing_module, name) -> source`.
pub type ModuleFn = Box<dyn FnMut(&str, &str) -> Option<String>>;

/// VM construction parameters.
pub struct VmParams {
    /// Heap budget floor.
    pub min_heap_size: usize,
    /// Initial collection trigger.
    pub initial_heap_size: usize,
    /// Additive budget growth after each cycle (0.5 = grow to 1.5x live).
    pub heap_growth_factor: f64,
    /// Diagnostic callback.
    pub error_fn: Option<ErrorFn>,
    /// Script print callback.
    pub print_fn: Option<PrintFn>,
    /// Module resolver callback.
    pub module_fn: Option<ModuleFn>,
}

impl Default for VmParams {
    fn default() -> Self {
        Self {
            min_heap_size: 1_000_000,
            initial_heap_size: 5_242_880,
            heap_growth_factor: 0.5,
            error_fn: None,
            print_fn: None,
            module_fn: None,
        }
    }
}

/// Coarse value type reported by the stack API.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueType {
    /// The null singleton.
    Nil,
    /// A boolean singleton.
    Bool,
    /// A double.
    Number,
    /// A heap string.
    String,
    /// An instance, reference or weak reference.
    Object,
    /// A script or native function.
    Function,
    /// A module.
    Module,
}

/// A host-held pinning reference to a value; acts as a GC root until
/// destroyed. Nodes are recycled through a free list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Handle(u32);

enum HandleSlot {
    Used(Value),
    Free(Option<u32>),
}

/// One call frame. Code, constants and the line sidecar are `Rc`-shared with
/// the function object so the dispatch loop touches the heap only for actual
/// object operations.
pub(crate) struct Frame {
    pub(crate) fn_ref: Option<ObjRef>,
    pub(crate) code: Rc<[Instruction]>,
    pub(crate) constants: Rc<[Value]>,
    pub(crate) lines: Rc<[u16]>,
    pub(crate) module: Option<ObjRef>,
    pub(crate) ip: usize,
    pub(crate) base: usize,
    pub(crate) old_top: usize,
}

/// GC roots contributed by one in-flight compilation: the module under
/// construction, the class body being parsed, and every function builder's
/// constant pool.
pub(crate) struct CompileRoots {
    pub(crate) module: ObjRef,
    pub(crate) class: Option<ObjRef>,
    pub(crate) pools: Vec<Vec<Value>>,
}

const MAX_TEMP_ROOTS: usize = 8;

/// A Skiff virtual machine. Single-threaded; owns its heap, stacks and
/// handles exclusively.
pub struct Vm {
    pub(crate) heap: Heap,
    pub(crate) stack: Vec<Value>,
    pub(crate) stack_top: usize,
    pub(crate) frames: Vec<Frame>,
    pub(crate) modules: FxHashMap<String, ObjRef>,
    pub(crate) symbols: SymbolTable,
    ctor_symbol: SymbolId,
    dtor_symbol: SymbolId,
    call_symbol: SymbolId,
    handles: Vec<HandleSlot>,
    free_handle: Option<u32>,
    pub(crate) compile_roots: Vec<CompileRoots>,
    pub(crate) temp_roots: Vec<ObjRef>,
    pub(crate) current_native: Option<ObjRef>,
    pub(crate) last_error: String,
    error_fn: Option<ErrorFn>,
    print_fn: Option<PrintFn>,
    module_fn: Option<ModuleFn>,
}

impl Vm {
    /// Create a VM with the given configuration.
    pub fn new(params: VmParams) -> Self {
        let mut symbols = SymbolTable::new();
        let ctor_symbol = symbols.intern("ctor");
        let dtor_symbol = symbols.intern("dtor");
        let call_symbol = symbols.intern("call");
        Self {
            heap: Heap::new(
                params.min_heap_size,
                params.initial_heap_size,
                params.heap_growth_factor,
            ),
            stack: Vec::with_capacity(16),
            stack_top: 0,
            frames: Vec::with_capacity(12),
            modules: FxHashMap::default(),
            symbols,
            ctor_symbol,
            dtor_symbol,
            call_symbol,
            handles: Vec::new(),
            free_handle: None,
            compile_roots: Vec::new(),
            temp_roots: Vec::with_capacity(MAX_TEMP_ROOTS),
            current_native: None,
            last_error: String::new(),
            error_fn: params.error_fn,
            print_fn: params.print_fn,
            module_fn: params.module_fn,
        }
    }

    /// Read-only heap access.
    #[inline]
    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    /// Bytes currently charged against the heap budget.
    pub fn bytes_allocated(&self) -> usize {
        self.heap.bytes_allocated()
    }

    /// The most recent formatted diagnostic.
    pub fn error_string(&self) -> &str {
        &self.last_error
    }

    // ==================== Symbols ====================

    /// Intern a name, returning its stable symbol id.
    pub fn intern_symbol(&mut self, name: &str) -> SymbolId {
        self.symbols.intern(name)
    }

    /// The interned spelling of `id`.
    pub fn symbol_name(&self, id: SymbolId) -> &str {
        self.symbols.name(id)
    }

    /// The cached `ctor` symbol.
    #[inline]
    pub fn ctor_symbol(&self) -> SymbolId {
        self.ctor_symbol
    }

    /// The cached `dtor` symbol.
    #[inline]
    pub fn dtor_symbol(&self) -> SymbolId {
        self.dtor_symbol
    }

    /// The cached `call` symbol.
    #[inline]
    pub fn call_symbol(&self) -> SymbolId {
        self.call_symbol
    }

    // ==================== Allocation ====================

    /// The single object allocation entry point: may run a collection before
    /// the slot is created. Callers must have installed any intermediate
    /// references as roots (stack slots, temp roots, compile roots).
    pub(crate) fn alloc(&mut self, data: ObjData) -> ObjRef {
        if self.heap.should_collect(data.accounted_size()) {
            self.collect();
        }
        self.heap.insert(data)
    }

    /// Allocate a heap string. The text is stored as given; escape
    /// interpretation happens in the compiler for literal tokens.
    pub fn new_string(&mut self, text: &str) -> ObjRef {
        self.alloc(ObjData::String(ObjString::new(text.to_string())))
    }

    /// Allocate an empty module.
    pub fn new_module(&mut self, name: &str) -> ObjRef {
        self.alloc(ObjData::Module(ObjModule {
            name: name.to_string(),
            variables: Vec::new(),
            init: None,
        }))
    }

    /// Allocate a class.
    pub fn new_class(
        &mut self,
        module: ObjRef,
        name: &str,
        base: Option<ObjRef>,
        extra_data_size: usize,
    ) -> ObjRef {
        self.alloc(ObjData::Class(ObjClass {
            name: name.to_string(),
            base,
            module,
            symbols: Vec::new(),
            field_initializers: Vec::new(),
            extra_data_size,
            finalizer: None,
        }))
    }

    /// Allocate an instance of `class`, applying its field initializers.
    pub fn new_instance(&mut self, class: ObjRef) -> ObjRef {
        let extra_size = self.heap.class(class).extra_data_size;
        let r = self.alloc(ObjData::Instance(ObjInstance {
            class,
            fields: FxHashMap::default(),
            extra: vec![0; extra_size],
        }));
        let initializers = self.heap.class(class).field_initializers.clone();
        let instance = self.heap.instance_mut(r);
        for init in initializers {
            if let Some(name) = init.name {
                instance.fields.insert(name, init.value);
            }
        }
        r
    }

    /// Allocate an empty function shell owned by `module`; the compiler fills
    /// it with [`Vm::function_fill`] once emission finishes.
    pub fn new_function_shell(&mut self, module: ObjRef) -> ObjRef {
        self.alloc(ObjData::Function(ObjFunction {
            name: String::new(),
            arity: 0,
            code: Rc::from(&[][..]),
            constants: Rc::from(&[][..]),
            lines: Rc::from(&[][..]),
            needed_stack_space: 1,
            module,
        }))
    }

    /// Fill a function shell with its compiled body.
    #[allow(clippy::too_many_arguments)]
    pub fn function_fill(
        &mut self,
        fn_ref: ObjRef,
        name: &str,
        arity: i32,
        code: Vec<Instruction>,
        constants: Vec<Value>,
        lines: Vec<u16>,
        needed_stack_space: usize,
    ) {
        let f = self.heap.function_mut(fn_ref);
        f.name = name.to_string();
        f.arity = arity;
        f.code = code.into();
        f.constants = constants.into();
        f.lines = lines.into();
        f.needed_stack_space = needed_stack_space;
    }

    /// Allocate a native function object.
    pub fn new_native_fn(
        &mut self,
        func: NativeFn,
        arity: i32,
        num_statics: u32,
        extra_data_size: u16,
    ) -> ObjRef {
        self.alloc(ObjData::NativeFn(ObjNativeFn {
            func,
            arity,
            statics: vec![Value::NULL; num_statics as usize],
            extra: vec![0; extra_data_size as usize],
        }))
    }

    /// Allocate a reference object with `extra_data_size` zeroed bytes.
    pub fn new_reference(&mut self, extra_data_size: usize) -> ObjRef {
        self.alloc(ObjData::Reference(ObjReference {
            class: None,
            extra: vec![0; extra_data_size],
        }))
    }

    /// Allocate a weak reference wrapping an opaque host pointer value.
    pub fn new_weak_ref(&mut self, data: usize) -> ObjRef {
        self.alloc(ObjData::WeakRef(ObjWeakRef { class: None, data }))
    }

    // ==================== Temp roots ====================

    /// Pin an object across a possibly-collecting operation. At most 8 may
    /// be live at once.
    pub fn push_temp_root(&mut self, r: ObjRef) {
        assert!(self.temp_roots.len() < MAX_TEMP_ROOTS, "too many temp roots");
        self.temp_roots.push(r);
    }

    /// Pop the most recent temp root.
    pub fn pop_temp_root(&mut self) {
        self.temp_roots.pop().expect("temp root underflow");
    }

    // ==================== Modules ====================

    /// Find a registered module by name.
    pub fn find_module(&self, name: &str) -> Option<ObjRef> {
        self.modules.get(name).copied()
    }

    /// Register a module under a name. Overwrites silently; callers check
    /// for collisions first.
    pub fn register_module(&mut self, name: &str, module: ObjRef) {
        self.modules.insert(name.to_string(), module);
    }

    /// Create a module. `None` makes an anonymous, unregistered module; a
    /// name collides with an existing registration as
    /// [`VmError::ModuleAlreadyDefined`].
    pub fn module_make(&mut self, name: Option<&str>) -> Result<ObjRef, VmError> {
        match name {
            None => Ok(self.new_module("__anon_module__")),
            Some(name) => {
                if self.find_module(name).is_some() {
                    let msg = format!("module '{name}' is already defined");
                    self.report_error(ErrorKind::ModuleAlreadyDefined, -1, &msg);
                    return Err(VmError::ModuleAlreadyDefined(name.to_string()));
                }
                let module = self.new_module(name);
                self.register_module(name, module);
                Ok(module)
            }
        }
    }

    /// Create a module and leave it in view slot `idx`.
    pub fn stack_make_module(&mut self, idx: usize, name: Option<&str>) -> Result<(), VmError> {
        let module = self.module_make(name)?;
        self.set_view_slot(idx, Value::from_obj(module));
        Ok(())
    }

    /// Load a registered module into view slot `idx`.
    pub fn module_load(&mut self, idx: usize, name: &str) -> Result<(), VmError> {
        match self.find_module(name) {
            Some(module) => {
                self.set_view_slot(idx, Value::from_obj(module));
                Ok(())
            }
            None => Err(VmError::ModuleNotFound(name.to_string())),
        }
    }

    /// Drop a module registration. The object itself is collected once
    /// unreachable.
    pub fn module_unload(&mut self, name: &str) {
        self.modules.remove(name);
    }

    /// Drop every module registration.
    pub fn module_unload_all(&mut self) {
        self.modules.clear();
    }

    /// Set a module/class symbol-array slot by interned id, growing the array
    /// and null-filling gaps. Returns the id truncated to an operand width.
    pub fn module_set_variable(&mut self, module: ObjRef, name: SymbolId, value: Value) -> u16 {
        let m = self.heap.module_mut(module);
        set_symbol_slot(&mut m.variables, name, value)
    }

    /// Attach a compiled top-level body to a module.
    pub fn module_set_init(&mut self, module: ObjRef, init: ObjRef) {
        self.heap.module_mut(module).init = Some(init);
    }

    /// Read a module's top-level binding by name; null when absent.
    pub fn module_find_variable(&self, module: ObjRef, name: &str) -> Value {
        let m = self.heap.module(module);
        for slot in &m.variables {
            if let Some(sym) = slot.name {
                if self.symbols.name(sym) == name {
                    return slot.value;
                }
            }
        }
        Value::NULL
    }

    // ==================== Classes ====================

    /// Set a class symbol slot (method or static) by interned id.
    pub fn class_set_symbol(&mut self, class: ObjRef, name: SymbolId, value: Value) -> u16 {
        let c = self.heap.class_mut(class);
        set_symbol_slot(&mut c.symbols, name, value)
    }

    /// Append a field initializer applied to new instances of `class`.
    pub fn class_add_field_initializer(&mut self, class: ObjRef, name: SymbolId, value: Value) {
        let c = self.heap.class_mut(class);
        c.field_initializers.push(SymbolSlot { name: Some(name), value });
    }

    /// Install a host class binding onto the module owning the value in view
    /// slot `target_idx` (a module, class or instance).
    pub fn stack_store_class(&mut self, target_idx: usize, bind: &ClassBind) -> Result<(), VmError> {
        let target = self.view_slot(target_idx);
        self.create_class_binding(target, bind).map(|_| ())
    }

    /// Create a reference with a freshly installed class binding and leave it
    /// in view slot `dst_idx`.
    pub fn stack_make_reference_clz(
        &mut self,
        module_idx: usize,
        bind: &ClassBind,
        dst_idx: usize,
    ) -> Result<(), VmError> {
        let r = self.new_reference(bind.extra_data_size);
        self.set_view_slot(dst_idx, Value::from_obj(r));
        let target = self.view_slot(module_idx);
        let class = self.create_class_binding(target, bind)?;
        self.heap.reference_mut(r).class = Some(class);
        Ok(())
    }

    fn create_class_binding(&mut self, target: Value, bind: &ClassBind) -> Result<ObjRef, VmError> {
        let module = self
            .owning_module(target)
            .ok_or_else(|| VmError::InvalidOpOnType("class bindings need a module target".into()))?;
        let class = self.new_class(module, bind.name, None, bind.extra_data_size);
        self.heap.class_mut(class).finalizer = bind.finalizer.clone();

        self.push_temp_root(class);
        let name_sym = self.intern_symbol(bind.name);
        self.module_set_variable(module, name_sym, Value::from_obj(class));
        for method in bind.methods {
            let f = self.new_native_fn(method.func, method.arity, method.num_statics, method.extra_data_size);
            let method_sym = self.intern_symbol(method.name);
            self.class_set_symbol(class, method_sym, Value::from_obj(f));
        }
        self.pop_temp_root();
        Ok(class)
    }

    fn owning_module(&self, value: Value) -> Option<ObjRef> {
        let r = value.as_obj()?;
        match self.heap.data(r) {
            ObjData::Module(_) => Some(r),
            ObjData::Class(c) => Some(c.module),
            ObjData::Instance(i) => Some(self.heap.class(i.class).module),
            _ => None,
        }
    }

    /// Rebind a reference's dispatch class from two view slots.
    pub fn reference_set_class(&mut self, idx: usize, clz_idx: usize) {
        let (Some(r), Some(c)) = (self.view_slot(idx).as_obj(), self.view_slot(clz_idx).as_obj())
        else {
            return;
        };
        if self.heap.kind(r) == ObjKind::Reference && self.heap.kind(c) == ObjKind::Class {
            self.heap.reference_mut(r).class = Some(c);
        }
    }

    /// Rebind a class's base class from two view slots.
    pub fn class_set_base_class(&mut self, idx: usize, clz_idx: usize) {
        let (Some(r), Some(c)) = (self.view_slot(idx).as_obj(), self.view_slot(clz_idx).as_obj())
        else {
            return;
        };
        if self.heap.kind(r) == ObjKind::Class && self.heap.kind(c) == ObjKind::Class {
            self.heap.class_mut(r).base = Some(c);
        }
    }

    // ==================== Field load/store (shared with interpreter) ====================

    /// Store `value` into `sym` of a module, class or instance value.
    pub(crate) fn store_field(
        &mut self,
        target: Value,
        sym: SymbolId,
        value: Value,
    ) -> Result<(), VmError> {
        let Some(r) = target.as_obj() else {
            return Err(VmError::InvalidOpOnType(
                "cannot store a field into a non-object".into(),
            ));
        };
        match self.heap.data_mut(r) {
            ObjData::Instance(inst) => {
                inst.fields.insert(sym, value);
                Ok(())
            }
            ObjData::Class(c) => {
                set_symbol_slot(&mut c.symbols, sym, value);
                Ok(())
            }
            ObjData::Module(m) => {
                set_symbol_slot(&mut m.variables, sym, value);
                Ok(())
            }
            other => Err(VmError::InvalidOpOnType(format!(
                "cannot store a field on a {}",
                other.kind().name()
            ))),
        }
    }

    // ==================== API value stack ====================

    /// Number of readable slots in the current view.
    pub fn stack_size(&self) -> usize {
        self.stack.len().saturating_sub(self.stack_top)
    }

    /// Ensure the current view has at least `size` slots.
    pub fn stack_resize(&mut self, size: usize) {
        let needed = self.stack_top + size;
        if self.stack.len() < needed {
            self.stack.resize(needed, Value::NULL);
        }
    }

    #[inline]
    pub(crate) fn view_slot(&self, idx: usize) -> Value {
        self.stack[self.stack_top + idx]
    }

    #[inline]
    pub(crate) fn set_view_slot(&mut self, idx: usize, value: Value) {
        let at = self.stack_top + idx;
        self.stack[at] = value;
    }

    /// Store a string into view slot `idx`.
    pub fn stack_set_string(&mut self, idx: usize, text: &str) {
        let s = self.new_string(text);
        self.set_view_slot(idx, Value::from_obj(s));
    }

    /// Store a number into view slot `idx`.
    pub fn stack_set_number(&mut self, idx: usize, value: f64) {
        self.set_view_slot(idx, Value::from_number(value));
    }

    /// Store a boolean into view slot `idx`.
    pub fn stack_set_bool(&mut self, idx: usize, value: bool) {
        self.set_view_slot(idx, Value::from_bool(value));
    }

    /// Store null into view slot `idx`.
    pub fn stack_set_nil(&mut self, idx: usize) {
        self.set_view_slot(idx, Value::NULL);
    }

    /// Store a weak reference to an opaque host pointer into view slot `idx`.
    pub fn stack_set_weak_ref(&mut self, idx: usize, data: usize) {
        let w = self.new_weak_ref(data);
        self.set_view_slot(idx, Value::from_obj(w));
    }

    /// Read a raw value from the view (for hosts that keep their own roots).
    pub fn stack_value(&self, idx: usize) -> Value {
        self.view_slot(idx)
    }

    /// Store a raw value into view slot `idx`.
    pub fn stack_set_value(&mut self, idx: usize, value: Value) {
        self.set_view_slot(idx, value);
    }

    /// Read view slot `idx` as a string.
    pub fn stack_read_string(&self, idx: usize) -> Option<&str> {
        let r = self.view_slot(idx).as_obj()?;
        match self.heap.data(r) {
            ObjData::String(s) => Some(&s.text),
            _ => None,
        }
    }

    /// Read view slot `idx` as a number.
    pub fn stack_read_number(&self, idx: usize) -> Option<f64> {
        let v = self.view_slot(idx);
        v.is_number().then(|| v.as_number())
    }

    /// Read view slot `idx` as a boolean.
    pub fn stack_read_bool(&self, idx: usize) -> Option<bool> {
        let v = self.view_slot(idx);
        v.is_bool().then(|| v.is_true())
    }

    /// Borrow the extra-data bytes of the instance/reference in view slot
    /// `idx` (a weak ref yields no buffer).
    pub fn stack_read_instance_data(&mut self, idx: usize) -> Option<&mut [u8]> {
        let r = self.view_slot(idx).as_obj()?;
        match self.heap.data_mut(r) {
            ObjData::Instance(i) => Some(&mut i.extra),
            ObjData::Reference(x) => Some(&mut x.extra),
            _ => None,
        }
    }

    /// Read the raw host pointer value of the weak ref in view slot `idx`.
    pub fn stack_read_weak_ref(&self, idx: usize) -> Option<usize> {
        let r = self.view_slot(idx).as_obj()?;
        match self.heap.data(r) {
            ObjData::WeakRef(w) => Some(w.data),
            _ => None,
        }
    }

    /// Coarse type of view slot `idx`.
    pub fn stack_get_type(&self, idx: usize) -> ValueType {
        self.value_type(self.view_slot(idx))
    }

    pub(crate) fn value_type(&self, v: Value) -> ValueType {
        if v.is_bool() {
            ValueType::Bool
        } else if v.is_number() {
            ValueType::Number
        } else if let Some(r) = v.as_obj() {
            match self.heap.kind(r) {
                ObjKind::String => ValueType::String,
                ObjKind::Instance | ObjKind::Reference | ObjKind::WeakRef => ValueType::Object,
                ObjKind::Function | ObjKind::NativeFn => ValueType::Function,
                ObjKind::Module | ObjKind::Class => ValueType::Module,
            }
        } else {
            ValueType::Nil
        }
    }

    /// Declared arity of the function in view slot `idx`.
    pub fn stack_get_arity(&self, idx: usize) -> Option<i32> {
        self.value_arity(self.view_slot(idx))
    }

    fn value_arity(&self, v: Value) -> Option<i32> {
        let r = v.as_obj()?;
        match self.heap.data(r) {
            ObjData::Function(f) => Some(f.arity),
            ObjData::NativeFn(f) => Some(f.arity),
            _ => None,
        }
    }

    /// Create an instance of the class in view slot `clz_idx` into `dst_idx`.
    pub fn stack_make_instance(&mut self, clz_idx: usize, dst_idx: usize) -> Result<(), VmError> {
        let clz = self.view_slot(clz_idx);
        match clz.as_obj() {
            Some(r) if self.heap.kind(r) == ObjKind::Class => {
                let instance = self.new_instance(r);
                self.set_view_slot(dst_idx, Value::from_obj(instance));
                Ok(())
            }
            _ => Err(VmError::InvalidOpOnType("new requires a class".into())),
        }
    }

    /// Create a bare reference with `extra_data_size` bytes into slot `idx`.
    pub fn stack_make_reference(&mut self, idx: usize, extra_data_size: usize) {
        let r = self.new_reference(extra_data_size);
        self.set_view_slot(idx, Value::from_obj(r));
    }

    /// Read a field of the module/class/instance in `target_idx` into
    /// `dst_idx` (null when absent; instance misses fall back to the class).
    pub fn stack_load_variable(&mut self, dst_idx: usize, target_idx: usize, field: &str) {
        let sym = self.intern_symbol(field);
        let target = self.view_slot(target_idx);
        let value = self.load_field_shallow(target, sym, field);
        self.set_view_slot(dst_idx, value);
    }

    fn load_field_shallow(&self, target: Value, sym: SymbolId, field: &str) -> Value {
        let Some(r) = target.as_obj() else { return Value::NULL };
        match self.heap.data(r) {
            ObjData::Instance(inst) => {
                if let Some(&v) = inst.fields.get(&sym) {
                    return v;
                }
                self.class_symbol_lookup(inst.class, sym)
            }
            ObjData::Class(_) => self.class_symbol_lookup(r, sym),
            ObjData::Module(_) => self.module_find_variable(r, field),
            _ => Value::NULL,
        }
    }

    /// Walk the base-class chain for a non-null symbol slot.
    pub(crate) fn class_symbol_lookup(&self, class: ObjRef, sym: SymbolId) -> Value {
        let mut cursor = Some(class);
        while let Some(c) = cursor {
            let class = self.heap.class(c);
            if let Some(slot) = class.symbols.get(sym.index()) {
                if !slot.value.is_null() {
                    return slot.value;
                }
            }
            cursor = class.base;
        }
        Value::NULL
    }

    /// Store view slot `value_idx` into a named field of the value in
    /// `target_idx`.
    pub fn stack_store_variable(
        &mut self,
        target_idx: usize,
        field: &str,
        value_idx: usize,
    ) -> Result<(), VmError> {
        let sym = self.intern_symbol(field);
        let target = self.view_slot(target_idx);
        let value = self.view_slot(value_idx);
        self.store_field(target, sym, value)
    }

    /// Install a native function as a named field of the value in
    /// `target_idx`.
    pub fn stack_store_native_fn(
        &mut self,
        target_idx: usize,
        field: &str,
        func: NativeFn,
        arity: i32,
    ) -> Result<(), VmError> {
        self.stack_store_closure(target_idx, field, func, arity, 0, 0)
    }

    /// Install a native function with static slots and extra data.
    pub fn stack_store_closure(
        &mut self,
        target_idx: usize,
        field: &str,
        func: NativeFn,
        arity: i32,
        num_statics: u32,
        extra_data_size: u16,
    ) -> Result<(), VmError> {
        let f = self.new_native_fn(func, arity, num_statics, extra_data_size);
        let sym = self.intern_symbol(field);
        let target = self.view_slot(target_idx);
        self.store_field(target, sym, Value::from_obj(f))
    }

    /// Read a static slot of the currently executing native function.
    pub fn closure_get_static(&mut self, dst_idx: usize, static_idx: usize) -> Result<(), VmError> {
        let Some(native) = self.current_native else {
            return Err(VmError::InvalidArgument("no native function is executing".into()));
        };
        let statics = &self.heap.native_fn(native).statics;
        let Some(&v) = statics.get(static_idx) else {
            return Err(VmError::InvalidArgument(format!("no static slot {static_idx}")));
        };
        self.set_view_slot(dst_idx, v);
        Ok(())
    }

    /// Write a static slot of the native function in view slot `closure_idx`.
    pub fn closure_set_static(
        &mut self,
        closure_idx: usize,
        static_idx: usize,
        value_idx: usize,
    ) -> Result<(), VmError> {
        let value = self.view_slot(value_idx);
        let Some(r) = self.view_slot(closure_idx).as_obj() else {
            return Err(VmError::InvalidOpOnType("not a native function".into()));
        };
        let ObjData::NativeFn(f) = self.heap.data_mut(r) else {
            return Err(VmError::InvalidOpOnType("not a native function".into()));
        };
        let Some(slot) = f.statics.get_mut(static_idx) else {
            return Err(VmError::InvalidArgument(format!("no static slot {static_idx}")));
        };
        *slot = value;
        Ok(())
    }

    /// Borrow the extra data of the currently executing native function.
    pub fn closure_extra_data(&mut self) -> Option<&mut [u8]> {
        let native = self.current_native?;
        Some(&mut self.heap.native_fn_mut(native).extra)
    }

    // ==================== Handles ====================

    /// Pin the value in view slot `idx` behind a handle.
    pub fn stack_make_handle(&mut self, idx: usize) -> Handle {
        let value = self.view_slot(idx);
        match self.free_handle {
            Some(free) => {
                let HandleSlot::Free(next) = self.handles[free as usize] else {
                    unreachable!("free-list corruption");
                };
                self.free_handle = next;
                self.handles[free as usize] = HandleSlot::Used(value);
                Handle(free)
            }
            None => {
                let id = self.handles.len() as u32;
                self.handles.push(HandleSlot::Used(value));
                Handle(id)
            }
        }
    }

    /// Copy a handle's value into view slot `dst_idx`.
    pub fn stack_load_handle(&mut self, dst_idx: usize, handle: Handle) {
        let value = self.handle_value(handle);
        self.set_view_slot(dst_idx, value);
    }

    /// The pinned value.
    pub fn handle_value(&self, handle: Handle) -> Value {
        match self.handles[handle.0 as usize] {
            HandleSlot::Used(v) => v,
            HandleSlot::Free(_) => panic!("handle used after destroy"),
        }
    }

    /// Coarse type of a handle's value.
    pub fn handle_get_type(&self, handle: Handle) -> ValueType {
        self.value_type(self.handle_value(handle))
    }

    /// Declared arity of a handle's function value.
    pub fn handle_get_arity(&self, handle: Handle) -> Option<i32> {
        self.value_arity(self.handle_value(handle))
    }

    /// Release a handle; its node is recycled.
    pub fn stack_destroy_handle(&mut self, handle: Handle) {
        debug_assert!(matches!(self.handles[handle.0 as usize], HandleSlot::Used(_)));
        self.handles[handle.0 as usize] = HandleSlot::Free(self.free_handle);
        self.free_handle = Some(handle.0);
    }

    /// Number of live handles (diagnostics).
    pub fn handle_count(&self) -> usize {
        self.handles
            .iter()
            .filter(|h| matches!(h, HandleSlot::Used(_)))
            .count()
    }

    pub(crate) fn live_handle_values(&self) -> impl Iterator<Item = Value> + '_ {
        self.handles.iter().filter_map(|h| match h {
            HandleSlot::Used(v) => Some(*v),
            HandleSlot::Free(_) => None,
        })
    }

    // ==================== Compile roots ====================

    /// Push a compilation root frame for a module being compiled.
    pub fn compile_roots_push(&mut self, module: ObjRef) {
        self.compile_roots.push(CompileRoots { module, class: None, pools: Vec::new() });
    }

    /// Pop the innermost compilation root frame.
    pub fn compile_roots_pop(&mut self) {
        self.compile_roots.pop().expect("compile root underflow");
    }

    /// Record the class body currently being parsed (GC root).
    pub fn compile_set_class(&mut self, class: Option<ObjRef>) {
        self.compile_roots.last_mut().expect("no compile roots").class = class;
    }

    /// Open a constant pool for a function under construction; returns its
    /// pool index within the innermost root frame.
    pub fn compile_pool_push(&mut self) -> usize {
        let roots = self.compile_roots.last_mut().expect("no compile roots");
        roots.pools.push(Vec::new());
        roots.pools.len() - 1
    }

    /// Close the innermost constant pool, taking its contents.
    pub fn compile_pool_pop(&mut self) -> Vec<Value> {
        let roots = self.compile_roots.last_mut().expect("no compile roots");
        roots.pools.pop().expect("constant pool underflow")
    }

    /// Add a constant to a pool, deduplicated by exact value equality;
    /// returns its index.
    pub fn compile_pool_add(&mut self, pool: usize, value: Value) -> u32 {
        let roots = self.compile_roots.last_mut().expect("no compile roots");
        let pool = &mut roots.pools[pool];
        if let Some(at) = pool.iter().position(|v| *v == value) {
            return at as u32;
        }
        pool.push(value);
        (pool.len() - 1) as u32
    }

    // ==================== Host callbacks ====================

    /// Cache and report a diagnostic through the error callback.
    pub fn report_error(&mut self, kind: ErrorKind, line: i32, message: &str) {
        self.last_error.clear();
        self.last_error.push_str(message);
        self.emit_diagnostic(kind, line, message);
    }

    /// Invoke the error callback without touching the cached message (used
    /// for stack-trace framing).
    pub(crate) fn emit_diagnostic(&mut self, kind: ErrorKind, line: i32, message: &str) {
        if let Some(mut error_fn) = self.error_fn.take() {
            error_fn(kind, line, message);
            self.error_fn = Some(error_fn);
        }
    }

    /// Forward a message to the host print callback.
    pub fn host_print(&mut self, message: &str) {
        if let Some(mut print_fn) = self.print_fn.take() {
            print_fn(message);
            self.print_fn = Some(print_fn);
        }
    }

    /// Ask the host module resolver for a module's source.
    pub fn resolve_module_source(&mut self, from: &str, name: &str) -> Option<String> {
        let mut module_fn = self.module_fn.take()?;
        let source = module_fn(from, name);
        self.module_fn = Some(module_fn);
        source
    }

    /// Render a value for host display.
    pub fn display(&self, value: Value) -> String {
        display_value(&self.heap, value)
    }
}

/// Grow a symbol-indexed slot array to cover `sym`, filling gaps with
/// nameless null slots, and set the slot.
fn set_symbol_slot(slots: &mut Vec<SymbolSlot>, sym: SymbolId, value: Value) -> u16 {
    let idx = sym.index();
    if idx >= slots.len() {
        slots.resize(idx + 1, SymbolSlot { name: None, value: Value::NULL });
    }
    slots[idx] = SymbolSlot { name: Some(sym), value };
    (sym.0 & 0xFFFF) as u16
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_vm() -> Vm {
        Vm::new(VmParams::default())
    }

    #[test]
    fn test_stack_primitives_round_trip() {
        let mut vm = test_vm();
        vm.stack_resize(4);
        vm.stack_set_number(0, 4.25);
        vm.stack_set_bool(1, true);
        vm.stack_set_nil(2);
        vm.stack_set_string(3, "hello");
        assert_eq!(vm.stack_read_number(0), Some(4.25));
        assert_eq!(vm.stack_read_bool(1), Some(true));
        assert_eq!(vm.stack_get_type(2), ValueType::Nil);
        assert_eq!(vm.stack_read_string(3), Some("hello"));
        assert_eq!(vm.stack_get_type(3), ValueType::String);
    }

    #[test]
    fn test_module_collision() {
        let mut vm = test_vm();
        vm.module_make(Some("m")).unwrap();
        let err = vm.module_make(Some("m")).unwrap_err();
        assert_eq!(err, VmError::ModuleAlreadyDefined("m".into()));
        // the first registration is unaffected
        assert!(vm.find_module("m").is_some());
    }

    #[test]
    fn test_module_variables_sparse_growth() {
        let mut vm = test_vm();
        let module = vm.new_module("m");
        // burn a few ids so the variable lands past the start
        for name in ["a", "b", "c"] {
            vm.intern_symbol(name);
        }
        let sym = vm.intern_symbol("target");
        vm.module_set_variable(module, sym, Value::from_number(7.0));
        assert_eq!(vm.module_find_variable(module, "target").as_number(), 7.0);
        // gap slots are invisible by name
        assert!(vm.module_find_variable(module, "missing").is_null());
    }

    #[test]
    fn test_handle_recycling() {
        let mut vm = test_vm();
        vm.stack_resize(1);
        vm.stack_set_number(0, 1.0);
        let a = vm.stack_make_handle(0);
        vm.stack_destroy_handle(a);
        let b = vm.stack_make_handle(0);
        assert_eq!(a.0, b.0, "destroyed node was not recycled");
        vm.stack_destroy_handle(b);
        assert_eq!(vm.handle_count(), 0);
    }

    #[test]
    fn test_class_symbol_lookup_walks_base_chain() {
        let mut vm = test_vm();
        let module = vm.new_module("m");
        let base = vm.new_class(module, "Base", None, 0);
        let derived = vm.new_class(module, "Derived", Some(base), 0);
        let sym = vm.intern_symbol("speak");
        vm.class_set_symbol(base, sym, Value::from_number(1.0));
        let found = vm.class_symbol_lookup(derived, sym);
        assert_eq!(found.as_number(), 1.0);
    }

    #[test]
    fn test_instance_fields_from_initializers() {
        let mut vm = test_vm();
        let module = vm.new_module("m");
        let class = vm.new_class(module, "P", None, 0);
        let x = vm.intern_symbol("x");
        vm.class_add_field_initializer(class, x, Value::from_number(41.0));
        let inst = vm.new_instance(class);
        assert_eq!(
            vm.heap().instance(inst).fields.get(&x).unwrap().as_number(),
            41.0
        );
    }

    #[test]
    fn test_constant_pool_dedup() {
        let mut vm = test_vm();
        let module = vm.new_module("m");
        vm.compile_roots_push(module);
        let pool = vm.compile_pool_push();
        let a = vm.compile_pool_add(pool, Value::from_number(1.0));
        let b = vm.compile_pool_add(pool, Value::from_number(2.0));
        let c = vm.compile_pool_add(pool, Value::from_number(1.0));
        assert_eq!(a, 0);
        assert_eq!(b, 1);
        assert_eq!(c, 0);
        assert_eq!(vm.compile_pool_pop().len(), 2);
        vm.compile_roots_pop();
    }
}

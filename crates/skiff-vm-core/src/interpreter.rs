//! The bytecode interpreter
//!
//! One dispatch loop over the current frame's instruction pointer. Script
//! calls push a frame and continue in the same loop; native calls push an
//! I/O-only frame, invoke the host function, and pop it on return. Runtime
//! errors unwind every frame above the entry frame, emitting a stack trace
//! through the error callback, and leave the value stack restored to the
//! entry frame's saved top.

use skiff_vm_bytecode::{Opcode, basic};

use crate::error::{ErrorKind, VmError};
use crate::format::{display_value, type_name};
use crate::heap::ObjRef;
use crate::object::ObjData;
use crate::symbol::SymbolId;
use crate::value::Value;
use crate::vm::{Frame, Vm};

/// Frame-stack depth bound; crossing it is a runtime error rather than
/// unbounded memory growth.
const MAX_CALL_DEPTH: usize = 4096;

impl Vm {
    /// Run a registered module's top-level initializer.
    pub fn run_module_init(&mut self, module: ObjRef) -> Result<(), VmError> {
        let Some(init) = self.heap.module(module).init else {
            return Ok(());
        };
        self.exec_top_frame(init, self.stack_top)
    }

    /// Invoke the function in view slot `idx` with `num_args` arguments laid
    /// out from view slot `args_start`. The return value replaces the first
    /// argument slot. An arity mismatch is reported without unwinding.
    pub fn call(&mut self, idx: usize, args_start: usize, num_args: i32) -> Result<(), VmError> {
        let value = self.view_slot(idx);
        let Some(r) = value.as_obj() else {
            return Err(VmError::InvalidOpOnType("call target is not a function".into()));
        };
        let new_base = self.stack_top + args_start;
        let (is_script, arity, name) = match self.heap.data(r) {
            ObjData::Function(f) => (true, f.arity, f.name.clone()),
            ObjData::NativeFn(f) => (false, f.arity, String::from("<native>")),
            _ => {
                return Err(VmError::InvalidOpOnType("call target is not a function".into()));
            }
        };
        if arity >= 0 && arity != num_args {
            let msg = format!(
                "function '{name}' called with {num_args} argument(s) but requires {arity}"
            );
            self.report_error(ErrorKind::ArityMismatch, -1, &msg);
            return Err(VmError::ArityMismatch(msg));
        }
        if is_script {
            self.exec_top_frame(r, new_base)
        } else {
            self.invoke_native(r, new_base, num_args)
        }
    }

    /// Push a script frame and run the dispatch loop until it returns.
    pub(crate) fn exec_top_frame(&mut self, fn_ref: ObjRef, base: usize) -> Result<(), VmError> {
        let entry_depth = self.frames.len();
        if let Err(message) = self.push_script_frame(fn_ref, base) {
            self.report_error(ErrorKind::Runtime, -1, &message);
            return Err(VmError::Runtime(message));
        }
        match self.dispatch(entry_depth) {
            Ok(()) => Ok(()),
            Err(message) => {
                self.unwind(entry_depth, &message);
                Err(VmError::Runtime(message))
            }
        }
    }

    fn push_script_frame(&mut self, fn_ref: ObjRef, base: usize) -> Result<(), String> {
        if self.frames.len() >= MAX_CALL_DEPTH {
            return Err("call stack depth exceeded".to_string());
        }
        let f = self.heap.function(fn_ref);
        let (code, constants, lines, module, needed) = (
            f.code.clone(),
            f.constants.clone(),
            f.lines.clone(),
            f.module,
            f.needed_stack_space,
        );
        let extent = base + needed;
        if self.stack.len() < extent {
            self.stack.resize(extent, Value::NULL);
        }
        let old_top = self.stack_top;
        self.stack_top = extent;
        self.frames.push(Frame {
            fn_ref: Some(fn_ref),
            code,
            constants,
            lines,
            module: Some(module),
            ip: 0,
            base,
            old_top,
        });
        Ok(())
    }

    fn pop_frame(&mut self) {
        let frame = self.frames.pop().expect("frame underflow");
        self.stack_top = frame.old_top;
        self.clear_stack_from(frame.base + 1);
    }

    /// Null out dead slots so stale copies don't retain garbage.
    fn clear_stack_from(&mut self, from: usize) {
        for slot in self.stack.iter_mut().skip(from) {
            *slot = Value::NULL;
        }
    }

    fn invoke_native(&mut self, fn_ref: ObjRef, base: usize, num_args: i32) -> Result<(), VmError> {
        let func = self.heap.native_fn(fn_ref).func;
        let old_top = self.stack_top;
        if self.stack.len() < base + num_args.max(1) as usize {
            self.stack.resize(base + num_args.max(1) as usize, Value::NULL);
        }
        self.frames.push(Frame {
            fn_ref: None,
            code: Vec::new().into(),
            constants: Vec::new().into(),
            lines: Vec::new().into(),
            module: None,
            ip: 0,
            base,
            old_top,
        });
        self.stack_top = base;
        let prev_native = self.current_native.replace(fn_ref);
        let result = func(self, num_args);
        self.current_native = prev_native;
        self.pop_frame();
        result
    }

    // ==================== Dispatch loop ====================

    fn dispatch(&mut self, entry_depth: usize) -> Result<(), String> {
        'frames: loop {
            let frame = self.frames.last().expect("dispatch without a frame");
            let code = frame.code.clone();
            let constants = frame.constants.clone();
            let module = frame.module;
            let base = frame.base;
            let mut ip = frame.ip;

            macro_rules! bail {
                ($($arg:tt)*) => {{
                    self.frames.last_mut().expect("frame").ip = ip;
                    return Err(format!($($arg)*));
                }};
            }

            loop {
                let inst = code[ip];
                let Ok(op) = inst.op() else {
                    bail!("invalid instruction word {:#010X}", inst.0);
                };

                match op {
                    Opcode::Return => {
                        let result = self.stack[base + inst.bx() as usize];
                        self.stack[base] = result;
                        self.pop_frame();
                        if self.frames.len() == entry_depth {
                            return Ok(());
                        }
                        continue 'frames;
                    }

                    Opcode::LoadBasic => {
                        let a = base + inst.a() as usize;
                        let action = inst.bx();
                        self.stack[a] = match action {
                            basic::TRUE => Value::TRUE,
                            basic::FALSE => Value::FALSE,
                            basic::NULL => Value::NULL,
                            basic::CURRENT_MODULE => {
                                Value::from_obj(module.expect("script frame has a module"))
                            }
                            _ => constants[(action - basic::CONSTANT_BASE) as usize],
                        };
                    }

                    Opcode::StoreMove => {
                        let value = self.stack[base + inst.bx() as usize];
                        self.stack[base + inst.a() as usize] = value;
                    }

                    Opcode::LoadSymbol => {
                        let target = self.stack[base + inst.b() as usize];
                        let sym = SymbolId(inst.c());
                        match self.load_symbol(target, sym) {
                            Ok(value) => self.stack[base + inst.a() as usize] = value,
                            Err(message) => bail!("{message}"),
                        }
                    }

                    Opcode::StoreSymbol => {
                        let target = self.stack[base + inst.a() as usize];
                        let sym = SymbolId(inst.b());
                        let value = self.stack[base + inst.c() as usize];
                        if let Err(e) = self.store_field(target, sym, value) {
                            bail!("{e}");
                        }
                    }

                    Opcode::NewInstance => {
                        let class_value = self.stack[base + inst.bx() as usize];
                        let class = class_value.as_obj().filter(|&r| {
                            matches!(self.heap.data(r), ObjData::Class(_))
                        });
                        let Some(class) = class else {
                            bail!(
                                "called 'new' on a non class type ({})",
                                type_name(&self.heap, class_value)
                            );
                        };
                        let instance = self.new_instance(class);
                        self.stack[base + inst.a() as usize] = Value::from_obj(instance);
                    }

                    Opcode::Add => {
                        let lhs = self.stack[base + inst.b() as usize];
                        let rhs = self.stack[base + inst.c() as usize];
                        let result = if lhs.is_number() && rhs.is_number() {
                            Value::from_number(lhs.as_number() + rhs.as_number())
                        } else if self.is_string_value(lhs) || self.is_string_value(rhs) {
                            let mut text = display_value(&self.heap, lhs);
                            text.push_str(&display_value(&self.heap, rhs));
                            Value::from_obj(self.new_string(&text))
                        } else {
                            bail!(
                                "'+' operator of two incompatible types ({} + {})",
                                type_name(&self.heap, lhs),
                                type_name(&self.heap, rhs)
                            );
                        };
                        self.stack[base + inst.a() as usize] = result;
                    }

                    Opcode::Sub | Opcode::Mul | Opcode::Div => {
                        let lhs = self.stack[base + inst.b() as usize];
                        let rhs = self.stack[base + inst.c() as usize];
                        if !lhs.is_number() || !rhs.is_number() {
                            bail!(
                                "'{}' is not allowed on non number values ({} and {})",
                                match op {
                                    Opcode::Sub => "-",
                                    Opcode::Mul => "*",
                                    _ => "/",
                                },
                                type_name(&self.heap, lhs),
                                type_name(&self.heap, rhs)
                            );
                        }
                        let (l, r) = (lhs.as_number(), rhs.as_number());
                        let n = match op {
                            Opcode::Sub => l - r,
                            Opcode::Mul => l * r,
                            _ => l / r,
                        };
                        self.stack[base + inst.a() as usize] = Value::from_number(n);
                    }

                    Opcode::Eq | Opcode::Ne => {
                        let lhs = self.stack[base + inst.b() as usize];
                        let rhs = self.stack[base + inst.c() as usize];
                        let eq = self.value_eq(lhs, rhs);
                        self.stack[base + inst.a() as usize] =
                            Value::from_bool(if op == Opcode::Eq { eq } else { !eq });
                    }

                    Opcode::Lt | Opcode::Le | Opcode::Gt | Opcode::Ge => {
                        let lhs = self.stack[base + inst.b() as usize];
                        let rhs = self.stack[base + inst.c() as usize];
                        let result = if lhs.is_number() && rhs.is_number() {
                            let (l, r) = (lhs.as_number(), rhs.as_number());
                            match op {
                                Opcode::Lt => l < r,
                                Opcode::Le => l <= r,
                                Opcode::Gt => l > r,
                                _ => l >= r,
                            }
                        } else {
                            // non-number ordering falls back to identity bits
                            let (l, r) = (lhs.bits(), rhs.bits());
                            match op {
                                Opcode::Lt => l < r,
                                Opcode::Le => l <= r,
                                Opcode::Gt => l > r,
                                _ => l >= r,
                            }
                        };
                        self.stack[base + inst.a() as usize] = Value::from_bool(result);
                    }

                    Opcode::And => {
                        let lhs = self.stack[base + inst.b() as usize];
                        let rhs = self.stack[base + inst.c() as usize];
                        self.stack[base + inst.a() as usize] =
                            Value::from_bool(lhs.is_truthy() && rhs.is_truthy());
                    }

                    Opcode::Or => {
                        let lhs = self.stack[base + inst.b() as usize];
                        let rhs = self.stack[base + inst.c() as usize];
                        self.stack[base + inst.a() as usize] =
                            Value::from_bool(lhs.is_truthy() || rhs.is_truthy());
                    }

                    Opcode::Not => {
                        let value = self.stack[base + inst.bx() as usize];
                        self.stack[base + inst.a() as usize] = Value::from_bool(!value.is_truthy());
                    }

                    Opcode::Jump => {
                        ip = (ip as i64 + inst.sbx() as i64) as usize;
                        continue;
                    }

                    Opcode::JumpIf => {
                        if self.stack[base + inst.a() as usize].is_truthy() {
                            ip = (ip as i64 + inst.sbx() as i64) as usize;
                            continue;
                        }
                    }

                    Opcode::JumpIfNot => {
                        if !self.stack[base + inst.a() as usize].is_truthy() {
                            ip = (ip as i64 + inst.sbx() as i64) as usize;
                            continue;
                        }
                    }

                    Opcode::Call => {
                        let mut argc = inst.c() as usize;
                        let new_base = base + inst.a() as usize;
                        let callee_value = self.stack[base + inst.b() as usize];
                        let Some(mut callee) = callee_value.as_obj() else {
                            bail!(
                                "cannot call a non function value ({})",
                                type_name(&self.heap, callee_value)
                            );
                        };

                        // Callable dispatch: instances, references and weak
                        // references route through their class's 'call'
                        // symbol with the receiver prepended; so does a
                        // class called directly.
                        let dispatch_class = match self.heap.data(callee) {
                            ObjData::Instance(_) | ObjData::Reference(_) | ObjData::WeakRef(_) => {
                                self.heap.instance_class(callee)
                            }
                            ObjData::Class(_) => Some(callee),
                            _ => None,
                        };
                        if let Some(class) = dispatch_class {
                            let call_sym = self.call_symbol();
                            let class_name = self.heap.class(class).name.clone();
                            let call_value = self
                                .heap
                                .class(class)
                                .symbols
                                .get(call_sym.index())
                                .map(|slot| slot.value)
                                .unwrap_or(Value::NULL);
                            let call_fn = call_value
                                .as_obj()
                                .filter(|&f| self.heap.data(f).is_function());
                            let Some(call_fn) = call_fn else {
                                bail!("'{class_name}::call' must be defined as a function to use the value as a function");
                            };
                            let needed = new_base + argc + 1;
                            if self.stack.len() < needed {
                                self.stack.resize(needed, Value::NULL);
                            }
                            self.stack.copy_within(new_base..new_base + argc, new_base + 1);
                            self.stack[new_base] = callee_value;
                            argc += 1;
                            callee = call_fn;
                        }

                        let (is_script, arity, fn_name) = match self.heap.data(callee) {
                            ObjData::Function(f) => (true, f.arity, f.name.clone()),
                            ObjData::NativeFn(f) => (false, f.arity, String::from("<native>")),
                            _ => bail!(
                                "cannot call a non function value ({})",
                                type_name(&self.heap, callee_value)
                            ),
                        };
                        if arity >= 0 && argc != arity as usize {
                            bail!(
                                "function '{fn_name}' called with {argc} argument(s) but requires {arity}"
                            );
                        }
                        if is_script {
                            self.frames.last_mut().expect("frame").ip = ip + 1;
                            if let Err(message) = self.push_script_frame(callee, new_base) {
                                return Err(message);
                            }
                            continue 'frames;
                        } else if let Err(e) = self.invoke_native(callee, new_base, argc as i32) {
                            bail!("{e}");
                        }
                    }
                }

                ip += 1;
            }
        }
    }

    // ==================== Operator helpers ====================

    fn is_string_value(&self, v: Value) -> bool {
        v.as_obj()
            .is_some_and(|r| matches!(self.heap.data(r), ObjData::String(_)))
    }

    /// Script `==`: numeric on two numbers, hash-then-bytes on two strings,
    /// raw bit identity otherwise.
    pub(crate) fn value_eq(&self, lhs: Value, rhs: Value) -> bool {
        if lhs.is_number() && rhs.is_number() {
            return lhs.as_number() == rhs.as_number();
        }
        if let (Some(l), Some(r)) = (lhs.as_obj(), rhs.as_obj()) {
            if let (ObjData::String(ls), ObjData::String(rs)) = (self.heap.data(l), self.heap.data(r))
            {
                return ls.hash == rs.hash && ls.text == rs.text;
            }
        }
        lhs.bits() == rhs.bits()
    }

    /// `LOAD_SYMBOL` resolution. Instances check their field map first and
    /// fall back to the class; references and weak references consult only
    /// the class chain; modules use a linear name scan.
    fn load_symbol(&self, target: Value, sym: SymbolId) -> Result<Value, String> {
        let sym_name = self.symbols.name(sym);
        let Some(r) = target.as_obj() else {
            return Err(format!(
                "cannot load symbol '{}' from non object {}",
                sym_name,
                display_value(&self.heap, target)
            ));
        };

        let class = match self.heap.data(r) {
            ObjData::Instance(inst) => {
                if let Some(&value) = inst.fields.get(&sym) {
                    return Ok(value);
                }
                Some(inst.class)
            }
            ObjData::Reference(x) => x.class,
            ObjData::WeakRef(w) => w.class,
            ObjData::Class(_) => Some(r),
            ObjData::Module(_) => {
                return Ok(self.module_find_variable(r, sym_name));
            }
            other => {
                return Err(format!(
                    "cannot load symbol '{}' on a {} value",
                    sym_name,
                    other.kind().name()
                ));
            }
        };

        let Some(class) = class else {
            return Err(format!("cannot load symbol '{sym_name}' from a classless object"));
        };

        let mut cursor = Some(class);
        while let Some(c) = cursor {
            let class_obj = self.heap.class(c);
            if let Some(slot) = class_obj.symbols.get(sym.index()) {
                if !slot.value.is_null() {
                    return Ok(slot.value);
                }
            }
            cursor = class_obj.base;
        }
        Err(format!(
            "'{}::{}' is not defined (also not found in any base class)",
            self.heap.class(class).name,
            sym_name
        ))
    }

    // ==================== Unwinding ====================

    /// Walk frames top-down emitting a stack trace, then restore the value
    /// stack to the entry frame's saved top. No frame is left partially
    /// executed.
    fn unwind(&mut self, entry_depth: usize, message: &str) {
        self.last_error.clear();
        self.last_error.push_str(message);

        let top_line = self
            .frames
            .last()
            .map(|f| f.lines.get(f.ip).copied().map(i32::from).unwrap_or(-1))
            .unwrap_or(-1);

        let mut trace: Vec<(i32, String)> = Vec::new();
        for i in entry_depth..self.frames.len() {
            let frame = &self.frames[i];
            let (line, name) = match frame.fn_ref {
                Some(f) => (
                    frame
                        .lines
                        .get(frame.ip.min(frame.lines.len().saturating_sub(1)))
                        .copied()
                        .map(i32::from)
                        .unwrap_or(-1),
                    self.heap.function(f).name.clone(),
                ),
                None => (-1, "<native>".to_string()),
            };
            let depth = i - entry_depth;
            trace.push((line, format!("[{depth}] {name} (line {line})")));
        }

        self.emit_diagnostic(ErrorKind::StackTraceBegin, -1, "");
        let message = message.to_string();
        self.emit_diagnostic(ErrorKind::StackTrace, top_line, &message);
        for (line, text) in &trace {
            self.emit_diagnostic(ErrorKind::StackTrace, *line, text);
        }
        self.emit_diagnostic(ErrorKind::StackTraceEnd, -1, "");

        let entry = &self.frames[entry_depth];
        self.stack_top = entry.old_top;
        self.frames.truncate(entry_depth);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::{ValueType, VmParams};
    use skiff_vm_bytecode::Instruction;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn test_vm() -> Vm {
        Vm::new(VmParams::default())
    }

    /// Hand-assemble a function: code + constants, arity 0 unless given.
    fn make_fn(
        vm: &mut Vm,
        module: ObjRef,
        arity: i32,
        code: Vec<Instruction>,
        constants: Vec<Value>,
        needed: usize,
    ) -> ObjRef {
        let lines = vec![1u16; code.len()];
        let f = vm.new_function_shell(module);
        vm.function_fill(f, "test_fn", arity, code, constants, lines, needed);
        f
    }

    #[test]
    fn test_return_constant() {
        let mut vm = test_vm();
        let module = vm.module_make(Some("m")).unwrap();
        let f = make_fn(
            &mut vm,
            module,
            0,
            vec![
                Instruction::abx(Opcode::LoadBasic, 0, basic::CONSTANT_BASE),
                Instruction::abx(Opcode::Return, 0, 0),
            ],
            vec![Value::from_number(42.0)],
            2,
        );
        vm.stack_resize(2);
        vm.set_view_slot(0, Value::from_obj(f));
        vm.call(0, 1, 0).unwrap();
        assert_eq!(vm.stack_read_number(1), Some(42.0));
    }

    #[test]
    fn test_add_numbers_and_strings() {
        let mut vm = test_vm();
        let module = vm.module_make(Some("m")).unwrap();
        let s = vm.new_string("x=");
        let f = make_fn(
            &mut vm,
            module,
            0,
            vec![
                Instruction::abx(Opcode::LoadBasic, 0, basic::CONSTANT_BASE),
                Instruction::abx(Opcode::LoadBasic, 1, basic::CONSTANT_BASE + 1),
                Instruction::abc(Opcode::Add, 0, 0, 1),
                Instruction::abx(Opcode::Return, 0, 0),
            ],
            vec![Value::from_obj(s), Value::from_number(3.0)],
            3,
        );
        vm.stack_resize(2);
        vm.set_view_slot(0, Value::from_obj(f));
        vm.call(0, 1, 0).unwrap();
        assert_eq!(vm.stack_read_string(1), Some("x=3"));
    }

    #[test]
    fn test_arity_mismatch_does_not_unwind() {
        let mut vm = test_vm();
        let module = vm.module_make(Some("m")).unwrap();
        let f = make_fn(
            &mut vm,
            module,
            2,
            vec![Instruction::abx(Opcode::Return, 0, 0)],
            vec![],
            4,
        );
        vm.stack_resize(2);
        vm.set_view_slot(0, Value::from_obj(f));
        let err = vm.call(0, 1, 1).unwrap_err();
        assert!(matches!(err, VmError::ArityMismatch(_)));
        // the function value is still where the host left it
        assert_eq!(vm.stack_get_type(0), ValueType::Function);
    }

    #[test]
    fn test_runtime_error_emits_trace_framing() {
        let events: Rc<RefCell<Vec<(ErrorKind, i32)>>> = Rc::new(RefCell::new(Vec::new()));
        let sink = events.clone();
        let mut vm = Vm::new(VmParams {
            error_fn: Some(Box::new(move |kind, line, _msg| {
                sink.borrow_mut().push((kind, line));
            })),
            ..VmParams::default()
        });
        let module = vm.module_make(Some("m")).unwrap();
        // call a number: runtime error
        let f = make_fn(
            &mut vm,
            module,
            0,
            vec![
                Instruction::abx(Opcode::LoadBasic, 0, basic::CONSTANT_BASE),
                Instruction::abc(Opcode::Call, 1, 0, 0),
                Instruction::abx(Opcode::Return, 0, 0),
            ],
            vec![Value::from_number(9.0)],
            3,
        );
        vm.stack_resize(2);
        vm.set_view_slot(0, Value::from_obj(f));
        let err = vm.call(0, 1, 0).unwrap_err();
        assert!(matches!(err, VmError::Runtime(_)));

        let kinds: Vec<ErrorKind> = events.borrow().iter().map(|e| e.0).collect();
        assert_eq!(kinds.first(), Some(&ErrorKind::StackTraceBegin));
        assert_eq!(kinds.last(), Some(&ErrorKind::StackTraceEnd));
        assert!(kinds.iter().filter(|k| **k == ErrorKind::StackTrace).count() >= 2);
        assert!(!vm.error_string().is_empty());
    }

    #[test]
    fn test_native_call_from_script() {
        fn double(vm: &mut Vm, _argc: i32) -> Result<(), VmError> {
            let n = vm.stack_read_number(0).unwrap_or(0.0);
            vm.stack_set_number(0, n * 2.0);
            Ok(())
        }
        let mut vm = test_vm();
        let module = vm.module_make(Some("m")).unwrap();
        let native = vm.new_native_fn(double, 1, 0, 0);
        let f = make_fn(
            &mut vm,
            module,
            0,
            vec![
                // r0 = native, r1 = 21, call r0(r1), return r1
                Instruction::abx(Opcode::LoadBasic, 0, basic::CONSTANT_BASE),
                Instruction::abx(Opcode::LoadBasic, 1, basic::CONSTANT_BASE + 1),
                Instruction::abc(Opcode::Call, 1, 0, 1),
                Instruction::abx(Opcode::Return, 0, 1),
            ],
            vec![Value::from_obj(native), Value::from_number(21.0)],
            3,
        );
        vm.stack_resize(2);
        vm.set_view_slot(0, Value::from_obj(f));
        vm.call(0, 1, 0).unwrap();
        assert_eq!(vm.stack_read_number(1), Some(42.0));
    }

    #[test]
    fn test_jump_if_not_skips() {
        let mut vm = test_vm();
        let module = vm.module_make(Some("m")).unwrap();
        // r0 = false; if (!r0) skip the load of 1.0; return r1 (null or 1.0)
        let f = make_fn(
            &mut vm,
            module,
            0,
            vec![
                Instruction::abx(Opcode::LoadBasic, 0, basic::FALSE),
                Instruction::asbx(Opcode::JumpIfNot, 0, 2),
                Instruction::abx(Opcode::LoadBasic, 1, basic::CONSTANT_BASE),
                Instruction::abx(Opcode::Return, 0, 1),
            ],
            vec![Value::from_number(1.0)],
            3,
        );
        vm.stack_resize(2);
        vm.set_view_slot(0, Value::from_obj(f));
        vm.call(0, 1, 0).unwrap();
        assert_eq!(vm.stack_get_type(1), ValueType::Nil);
    }

    #[test]
    fn test_value_eq_strings_by_content() {
        let mut vm = test_vm();
        let a = Value::from_obj(vm.new_string("same"));
        let b = Value::from_obj(vm.new_string("same"));
        let c = Value::from_obj(vm.new_string("other"));
        assert!(vm.value_eq(a, b));
        assert!(!vm.value_eq(a, c));
        // reflexive and symmetric
        assert!(vm.value_eq(a, a));
        assert!(vm.value_eq(b, a));
    }
}

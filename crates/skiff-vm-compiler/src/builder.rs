//! The function builder
//!
//! Emit-time state for one function body: instruction sequence, code-to-line
//! sidecar, lexical scopes over a flat local-variable table, a temp-slot
//! stack for expression evaluation, and the frame-slot high-water mark that
//! becomes the function's needed stack space.
//!
//! Constants live in a pool registered with the VM (a GC root while the
//! function is under construction); the builder only holds its pool index.

use skiff_vm_bytecode::{Instruction, Opcode};
use skiff_vm_core::{Value, Vm};

/// Completed output of a builder, ready to fill a function object.
pub struct FunctionParts {
    /// Function name.
    pub name: String,
    /// Emitted instruction sequence.
    pub code: Vec<Instruction>,
    /// Source line per instruction.
    pub lines: Vec<u16>,
    /// Constant pool, taken back from the VM's compile roots.
    pub constants: Vec<Value>,
    /// Frame slots this function needs.
    pub needed_stack_space: usize,
}

/// Emit-time state for one function under construction.
pub struct FunctionBuilder<'src> {
    name: String,
    pool: usize,
    instructions: Vec<Instruction>,
    lines: Vec<u16>,
    /// Flat slot table: named locals and anonymous temps (`None`).
    locals: Vec<Option<&'src str>>,
    /// Locals declared per open scope.
    scope_counts: Vec<usize>,
    max_slots: usize,
}

impl<'src> FunctionBuilder<'src> {
    /// Open a builder; registers a fresh constant pool with the VM.
    pub fn new(vm: &mut Vm, name: &str) -> Self {
        let pool = vm.compile_pool_push();
        let mut builder = Self {
            name: name.to_string(),
            pool,
            instructions: Vec::new(),
            lines: Vec::new(),
            locals: Vec::new(),
            scope_counts: Vec::new(),
            max_slots: 0,
        };
        builder.push_scope();
        builder
    }

    /// The function name under construction.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Open a lexical block.
    pub fn push_scope(&mut self) {
        self.scope_counts.push(0);
    }

    /// Close a lexical block, releasing its locals' slots.
    pub fn pop_scope(&mut self) {
        let count = self.scope_counts.pop().expect("scope underflow");
        let new_len = self.locals.len() - count;
        self.locals.truncate(new_len);
    }

    fn note_high_water(&mut self) {
        if self.locals.len() > self.max_slots {
            self.max_slots = self.locals.len();
        }
    }

    /// Declare a named local in the current scope. Returns its slot and
    /// whether this was a same-scope redeclaration (a compile error the
    /// parser reports; the original slot is reused).
    pub fn declare_local(&mut self, name: &'src str) -> (u16, bool) {
        let scope_len = *self.scope_counts.last().expect("no open scope");
        let scope_start = self.locals.len() - scope_len;
        for (i, local) in self.locals[scope_start..].iter().enumerate() {
            if *local == Some(name) {
                return ((scope_start + i) as u16, true);
            }
        }
        let slot = self.locals.len() as u16;
        self.locals.push(Some(name));
        *self.scope_counts.last_mut().expect("no open scope") += 1;
        self.note_high_water();
        (slot, false)
    }

    /// Scan declared locals inner-to-outer.
    pub fn get_variable(&self, name: &str) -> Option<u16> {
        self.locals
            .iter()
            .rposition(|local| *local == Some(name))
            .map(|at| at as u16)
    }

    /// Reserve `count` contiguous unnamed slots; returns the first.
    pub fn push_temp(&mut self, count: u16) -> u16 {
        let first = self.locals.len() as u16;
        for _ in 0..count {
            self.locals.push(None);
        }
        self.note_high_water();
        first
    }

    /// Release temps back down to slot `start` (stack discipline).
    pub fn pop_temp(&mut self, start: u16) {
        debug_assert!(start as usize <= self.locals.len(), "temp pop out of order");
        self.locals.truncate(start as usize);
    }

    /// Add a constant (deduplicated by exact value equality); returns its
    /// pool index.
    pub fn add_constant(&self, vm: &mut Vm, value: Value) -> u32 {
        vm.compile_pool_add(self.pool, value)
    }

    /// Number of instructions emitted so far (jump bookkeeping).
    pub fn len(&self) -> usize {
        self.instructions.len()
    }

    /// Whether nothing has been emitted yet.
    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }

    /// Read an emitted instruction (for subscript-store patching).
    pub fn instruction(&self, at: usize) -> Instruction {
        self.instructions[at]
    }

    /// Overwrite an emitted instruction (jump and break patching).
    pub fn patch(&mut self, at: usize, instruction: Instruction) {
        self.instructions[at] = instruction;
    }

    fn push_instruction(&mut self, instruction: Instruction, line: u32) {
        self.instructions.push(instruction);
        self.lines.push(line as u16);
    }

    /// Emit an `op rA, rB, rC` instruction.
    pub fn emit_abc(&mut self, op: Opcode, a: u16, b: u16, c: u16, line: u32) {
        self.push_instruction(Instruction::abc(op, a, b, c), line);
    }

    /// Emit an `op rA, Bx` instruction.
    pub fn emit_abx(&mut self, op: Opcode, a: u16, bx: u32, line: u32) {
        self.push_instruction(Instruction::abx(op, a, bx), line);
    }

    /// Emit an `op rA, sBx` instruction.
    pub fn emit_asbx(&mut self, op: Opcode, a: u16, sbx: i32, line: u32) {
        self.push_instruction(Instruction::asbx(op, a, sbx), line);
    }

    /// Emit a `break` placeholder; the enclosing loop patches it into a
    /// forward jump when it closes.
    pub fn emit_break_placeholder(&mut self, line: u32) {
        self.push_instruction(Instruction::INVALID, line);
    }

    /// Finish the body: append the implicit return of slot 0, close the
    /// function scope and take the constants back from the VM.
    pub fn end(mut self, vm: &mut Vm, line: u32) -> FunctionParts {
        self.emit_abx(Opcode::Return, 0, 0, line);
        self.pop_scope();
        let constants = vm.compile_pool_pop();
        FunctionParts {
            name: self.name,
            code: self.instructions,
            lines: self.lines,
            constants,
            needed_stack_space: self.max_slots + 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use skiff_vm_core::VmParams;

    fn builder_vm() -> (Vm, skiff_vm_core::ObjRef) {
        let mut vm = Vm::new(VmParams::default());
        let module = vm.new_module("test");
        vm.compile_roots_push(module);
        (vm, module)
    }

    #[test]
    fn test_scopes_release_slots() {
        let (mut vm, _) = builder_vm();
        let mut b = FunctionBuilder::new(&mut vm, "f");
        let (a, _) = b.declare_local("a");
        b.push_scope();
        let (inner, _) = b.declare_local("inner");
        assert_eq!(b.get_variable("inner"), Some(inner));
        b.pop_scope();
        assert_eq!(b.get_variable("inner"), None);
        assert_eq!(b.get_variable("a"), Some(a));
        vm.compile_pool_pop();
        vm.compile_roots_pop();
    }

    #[test]
    fn test_same_scope_redeclare_flags() {
        let (mut vm, _) = builder_vm();
        let mut b = FunctionBuilder::new(&mut vm, "f");
        let (first, redeclared) = b.declare_local("x");
        assert!(!redeclared);
        let (again, redeclared) = b.declare_local("x");
        assert!(redeclared);
        assert_eq!(first, again);
        // shadowing in an inner scope is fine
        b.push_scope();
        let (_, redeclared) = b.declare_local("x");
        assert!(!redeclared);
        vm.compile_pool_pop();
        vm.compile_roots_pop();
    }

    #[test]
    fn test_temps_and_high_water() {
        let (mut vm, _) = builder_vm();
        let mut b = FunctionBuilder::new(&mut vm, "f");
        b.declare_local("a");
        let t = b.push_temp(3);
        assert_eq!(t, 1);
        b.pop_temp(t);
        let t2 = b.push_temp(1);
        assert_eq!(t2, 1);
        b.emit_abx(Opcode::LoadBasic, 0, 0, 1);
        let parts = b.end(&mut vm, 2);
        // high water was a + 3 temps = 4 slots, plus the result slot
        assert_eq!(parts.needed_stack_space, 5);
        // implicit return appended with the end line
        assert_eq!(parts.code.len(), 2);
        assert_eq!(parts.lines, vec![1, 2]);
        vm.compile_roots_pop();
    }

    #[test]
    fn test_empty_function_is_single_return() {
        let (mut vm, _) = builder_vm();
        let b = FunctionBuilder::new(&mut vm, "empty");
        let parts = b.end(&mut vm, 1);
        assert_eq!(parts.code.len(), 1);
        assert_eq!(parts.code[0].op().unwrap(), Opcode::Return);
        assert_eq!(parts.code[0].bx(), 0);
        assert_eq!(parts.needed_stack_space, 1);
        vm.compile_roots_pop();
    }
}

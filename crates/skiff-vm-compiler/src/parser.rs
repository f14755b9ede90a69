//! The parser
//!
//! Single-pass, single-lookahead. Statements and declarations are parsed by
//! a recursive-descent layer; expressions by a Pratt loop over per-token
//! prefix/infix rules. Every expression is compiled to write its result into
//! a destination register reserved on the builder's temp stack; assignable
//! expressions additionally carry an lvalue (local slot or module symbol) so
//! `=` can emit the matching store.
//!
//! On any error a structured message goes to the host error callback and the
//! parser synchronises to the next `;` (or end of input) and continues, so
//! one compile can report several errors. Compile errors keep the module
//! from executing.

use skiff_vm_bytecode::{Instruction, Opcode, basic};
use skiff_vm_core::{ErrorKind, ObjData, ObjRef, Value, Vm, VmError};

use crate::builder::FunctionBuilder;
use crate::lexer::{Lexer, unescape};
use crate::token::{Token, TokenKind};

/// Slot value meaning "no location".
const INVALID_SLOT: u16 = 0x7FFF;

/// Where a resolved variable lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum VarKind {
    /// A frame slot.
    Local,
    /// A module symbol id, loaded/stored through the current module.
    Module,
}

#[derive(Debug, Clone, Copy)]
struct VarInfo {
    kind: VarKind,
    location: u16,
}

impl VarInfo {
    fn temp(location: u16) -> Self {
        Self { kind: VarKind::Local, location }
    }

    fn none() -> Self {
        Self::temp(INVALID_SLOT)
    }

    fn is_valid(self) -> bool {
        self.location != INVALID_SLOT
    }
}

/// A compiled (or in-progress) expression: the register its value is written
/// to, plus the lvalue it names, if any.
#[derive(Debug, Clone, Copy)]
struct ExprInfo {
    write_loc: u16,
    var: VarInfo,
}

impl ExprInfo {
    fn temp(write_loc: u16) -> Self {
        Self { write_loc, var: VarInfo::none() }
    }
}

/// Infix binding strength, low to high.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Prec {
    None,
    Assign,
    Or,
    And,
    Equality,
    Comparison,
    Term,
    Factor,
    Unary,
    Call,
}

fn precedence(kind: TokenKind) -> Prec {
    match kind {
        TokenKind::Equals | TokenKind::PlusEquals | TokenKind::MinusEquals => Prec::Assign,
        TokenKind::PipePipe => Prec::Or,
        TokenKind::AmpAmp => Prec::And,
        TokenKind::EqualEqual | TokenKind::BangEqual => Prec::Equality,
        TokenKind::Less | TokenKind::LessEqual | TokenKind::Greater | TokenKind::GreaterEqual => {
            Prec::Comparison
        }
        TokenKind::Plus | TokenKind::Minus => Prec::Term,
        TokenKind::Star | TokenKind::Slash => Prec::Factor,
        TokenKind::LParen | TokenKind::LBracket | TokenKind::Colon | TokenKind::Dot => Prec::Call,
        _ => Prec::None,
    }
}

/// The precedence floor used for right-associative continuation under `prec`.
fn one_below(prec: Prec) -> Prec {
    match prec {
        Prec::Call => Prec::Unary,
        Prec::Assign => Prec::None,
        other => other,
    }
}

struct Parser<'src, 'vm> {
    vm: &'vm mut Vm,
    lexer: Lexer<'src>,
    current: Token<'src>,
    builders: Vec<FunctionBuilder<'src>>,
    module: ObjRef,
    module_name: String,
    current_class: Option<ObjRef>,
    loop_starts: Vec<usize>,
    had_error: bool,
}

/// Compile `source` into `module`'s initializer, reporting every error
/// through the VM's error callback. The module does not run here.
pub fn compile_into_module(vm: &mut Vm, module: ObjRef, source: &str) -> Result<(), VmError> {
    let module_name = vm.heap().module(module).name.clone();
    vm.compile_roots_push(module);

    let mut lexer = Lexer::new(source);
    let current = lexer.next_token();
    let mut parser = Parser {
        vm,
        lexer,
        current,
        builders: Vec::new(),
        module,
        module_name: module_name.clone(),
        current_class: None,
        loop_starts: Vec::new(),
        had_error: false,
    };
    parser.drain_lexer_diagnostics();
    parser.push_builder(&module_name);

    while parser.parse_statement() {}

    let init = parser.finish_function(0);
    let had_error = parser.had_error;
    let message = parser.vm.error_string().to_string();
    parser.vm.module_set_init(module, init);
    parser.vm.compile_roots_pop();

    if had_error { Err(VmError::Compile(message)) } else { Ok(()) }
}

/// Resolve and install a module for `import`. An already-registered module
/// (including a cyclic import of a module mid-initialization) is returned
/// as-is; otherwise the host resolver supplies source which is compiled and
/// run exactly once. The registration is withdrawn if either step fails.
pub fn import_module(vm: &mut Vm, from: &str, name: &str) -> Option<ObjRef> {
    if let Some(module) = vm.find_module(name) {
        return Some(module);
    }
    let Some(source) = vm.resolve_module_source(from, name) else {
        let message = format!("failed to find module '{name}'");
        vm.report_error(ErrorKind::ModuleNotFound, -1, &message);
        return None;
    };
    let module = vm.new_module(name);
    vm.push_temp_root(module);
    vm.register_module(name, module);
    let ok = compile_into_module(vm, module, &source).is_ok() && vm.run_module_init(module).is_ok();
    vm.pop_temp_root();
    if ok {
        Some(module)
    } else {
        vm.module_unload(name);
        None
    }
}

impl<'src, 'vm> Parser<'src, 'vm> {
    // ==================== Token plumbing ====================

    fn advance(&mut self) {
        self.current = self.lexer.next_token();
        self.drain_lexer_diagnostics();
    }

    fn drain_lexer_diagnostics(&mut self) {
        for diag in self.lexer.take_diagnostics() {
            self.vm.report_error(ErrorKind::Lexer, diag.line as i32, &diag.message);
            self.had_error = true;
        }
    }

    fn error(&mut self, message: &str) {
        let line = self.current.line as i32;
        self.vm.report_error(ErrorKind::Compile, line, message);
        self.had_error = true;
    }

    /// Consume `kind` or report `message` and synchronise to the next `;`.
    fn eat(&mut self, kind: TokenKind, message: &str) -> bool {
        if self.current.kind == kind {
            self.advance();
            return true;
        }
        self.error(message);
        while self.current.kind != TokenKind::Semicolon && self.current.kind != TokenKind::Eof {
            self.advance();
        }
        false
    }

    /// Consume `kind` if present.
    fn match_tok(&mut self, kind: TokenKind) -> bool {
        if self.current.kind == kind {
            self.advance();
            true
        } else {
            false
        }
    }

    /// Current token is `kind` (end of input matches everything, so loops
    /// over malformed input always terminate).
    fn is(&self, kind: TokenKind) -> bool {
        self.current.kind == kind || self.current.kind == TokenKind::Eof
    }

    fn line(&self) -> u32 {
        self.current.line
    }

    // ==================== Builder plumbing ====================

    fn push_builder(&mut self, name: &str) {
        let builder = FunctionBuilder::new(self.vm, name);
        self.builders.push(builder);
    }

    fn builder(&self) -> &FunctionBuilder<'src> {
        self.builders.last().expect("no function builder")
    }

    fn builder_mut(&mut self) -> &mut FunctionBuilder<'src> {
        self.builders.last_mut().expect("no function builder")
    }

    /// Close the innermost builder into a filled function object.
    fn finish_function(&mut self, arity: i32) -> ObjRef {
        let shell = self.vm.new_function_shell(self.module);
        let builder = self.builders.pop().expect("no function builder");
        let line = self.line();
        let parts = builder.end(self.vm, line);
        let name = if parts.name.is_empty() { "<anonymous>".to_string() } else { parts.name };
        self.vm.function_fill(
            shell,
            &name,
            arity,
            parts.code,
            parts.constants,
            parts.lines,
            parts.needed_stack_space,
        );
        shell
    }

    fn emit_abc(&mut self, op: Opcode, a: u16, b: u16, c: u16) {
        let line = self.line();
        self.builders.last_mut().expect("builder").emit_abc(op, a, b, c, line);
    }

    fn emit_abx(&mut self, op: Opcode, a: u16, bx: u32) {
        let line = self.line();
        self.builders.last_mut().expect("builder").emit_abx(op, a, bx, line);
    }

    fn add_constant(&mut self, value: Value) -> u32 {
        self.builders.last().expect("builder").add_constant(self.vm, value)
    }

    fn push_temp(&mut self, count: u16) -> u16 {
        self.builder_mut().push_temp(count)
    }

    fn pop_temp(&mut self, start: u16) {
        self.builder_mut().pop_temp(start);
    }

    fn declare_local(&mut self, name: &'src str) -> VarInfo {
        let (slot, redeclared) = self.builder_mut().declare_local(name);
        if redeclared {
            self.error(&format!("'{name}' is already declared in this scope"));
        }
        VarInfo { kind: VarKind::Local, location: slot }
    }

    /// Resolve a name: innermost local, else a module symbol.
    fn local_or_symbol(&mut self, name: &str) -> VarInfo {
        if let Some(slot) = self.builder().get_variable(name) {
            return VarInfo { kind: VarKind::Local, location: slot };
        }
        let sym = self.vm.intern_symbol(name);
        VarInfo { kind: VarKind::Module, location: (sym.0 & 0xFFFF) as u16 }
    }

    // ==================== Jump helpers ====================

    fn make_jump(&mut self) -> usize {
        let at = self.builder().len();
        let line = self.line();
        self.builders.last_mut().expect("builder").emit_asbx(Opcode::Jump, 0, 0, line);
        at
    }

    fn mark(&self) -> usize {
        self.builder().len()
    }

    fn jump_word(cond_var: u16, amount: i32, if_not: bool) -> Instruction {
        if cond_var == INVALID_SLOT {
            Instruction::asbx(Opcode::Jump, 0, amount)
        } else if if_not {
            Instruction::asbx(Opcode::JumpIfNot, cond_var, amount)
        } else {
            Instruction::asbx(Opcode::JumpIf, cond_var, amount)
        }
    }

    /// Point the placeholder at `jump_idx` to the current position.
    fn patch_jump(&mut self, jump_idx: usize, cond_var: u16, if_not: bool) {
        let amount = self.builder().len() as i32 - jump_idx as i32;
        self.builder_mut().patch(jump_idx, Self::jump_word(cond_var, amount, if_not));
    }

    /// Emit a jump back to an earlier mark.
    fn emit_jump_back(&mut self, target_idx: usize) {
        let amount = target_idx as i32 - self.builder().len() as i32;
        let line = self.line();
        let word = Self::jump_word(INVALID_SLOT, amount, false);
        let at = self.builder().len();
        self.builders.last_mut().expect("builder").emit_asbx(Opcode::Jump, 0, 0, line);
        self.builder_mut().patch(at, word);
    }

    // ==================== Loops ====================

    fn loop_push(&mut self) {
        self.loop_starts.push(self.builder().len());
    }

    /// Patch every `break` placeholder in the closed loop to jump past it.
    fn loop_pop(&mut self) {
        let start = self.loop_starts.pop().expect("loop underflow");
        let end = self.builder().len();
        for at in start..end {
            if self.builder().instruction(at) == Instruction::INVALID {
                let amount = (end - at) as i32;
                self.builder_mut().patch(at, Self::jump_word(INVALID_SLOT, amount, false));
            }
        }
    }

    // ==================== Variable load/store ====================

    fn variable_load(&mut self, var: VarInfo, write_loc: u16) {
        match var.kind {
            VarKind::Local => {
                // redundant store elimination
                if var.location != write_loc {
                    self.emit_abx(Opcode::StoreMove, write_loc, var.location as u32);
                }
            }
            VarKind::Module => {
                let module_loc = self.push_temp(1);
                self.emit_abx(Opcode::LoadBasic, module_loc, basic::CURRENT_MODULE);
                self.emit_abc(Opcode::LoadSymbol, write_loc, module_loc, var.location);
                self.pop_temp(module_loc);
            }
        }
    }

    fn variable_store(&mut self, var: VarInfo, read_loc: u16) {
        match var.kind {
            VarKind::Local => {
                self.emit_abx(Opcode::StoreMove, var.location, read_loc as u32);
            }
            VarKind::Module => {
                let module_loc = self.push_temp(1);
                self.emit_abx(Opcode::LoadBasic, module_loc, basic::CURRENT_MODULE);
                self.emit_abc(Opcode::StoreSymbol, module_loc, var.location, read_loc);
                self.pop_temp(module_loc);
            }
        }
    }

    // ==================== Expressions ====================

    fn parse_expr(&mut self, expr: &mut ExprInfo, min_prec: Prec) {
        let token = self.current;
        if !self.parse_prefix(expr, token) {
            return;
        }
        while min_prec < precedence(self.current.kind) {
            let token = self.current;
            self.advance();
            self.parse_infix(expr, token);
        }
    }

    /// Dispatch the prefix rule for `token`; consumes it. Returns false when
    /// the token has no prefix rule.
    fn parse_prefix(&mut self, expr: &mut ExprInfo, token: Token<'src>) -> bool {
        match token.kind {
            TokenKind::LParen => {
                self.advance();
                self.expr_group(expr);
            }
            TokenKind::Identifier => {
                self.advance();
                self.expr_variable(expr, token);
            }
            TokenKind::Number
            | TokenKind::Str
            | TokenKind::True
            | TokenKind::False
            | TokenKind::Nil => {
                self.advance();
                self.expr_literal(expr, token);
            }
            TokenKind::Func => {
                self.advance();
                self.expr_function(expr);
            }
            TokenKind::New => {
                self.advance();
                self.expr_new(expr);
            }
            TokenKind::Super => {
                self.advance();
                self.expr_super(expr);
            }
            TokenKind::Bang => {
                self.advance();
                self.expr_unary_not(expr);
            }
            TokenKind::Minus => {
                self.advance();
                self.expr_unary_negate(expr);
            }
            _ => {
                self.error(&format!("expected an expression, found '{}'", token.text));
                self.advance();
                return false;
            }
        }
        true
    }

    fn parse_infix(&mut self, expr: &mut ExprInfo, token: Token<'src>) {
        match token.kind {
            TokenKind::LParen => self.expr_call(expr),
            TokenKind::LBracket => self.expr_subscript(expr),
            TokenKind::Colon => self.expr_method_call(expr),
            TokenKind::Dot => self.expr_dot(expr),
            TokenKind::Equals | TokenKind::PlusEquals | TokenKind::MinusEquals => {
                self.expr_assign(expr, token.kind)
            }
            _ => self.expr_binop(expr, token),
        }
    }

    fn expr_group(&mut self, expr: &mut ExprInfo) {
        self.parse_expr(expr, Prec::None);
        self.eat(TokenKind::RParen, "missing closing parenthesis for a group expression");
    }

    fn load_constant(&mut self, write_loc: u16, value: Value) {
        let at = self.add_constant(value);
        self.emit_abx(Opcode::LoadBasic, write_loc, at + basic::CONSTANT_BASE);
    }

    fn expr_literal(&mut self, expr: &mut ExprInfo, token: Token<'src>) {
        match token.kind {
            TokenKind::True => self.emit_abx(Opcode::LoadBasic, expr.write_loc, basic::TRUE),
            TokenKind::False => self.emit_abx(Opcode::LoadBasic, expr.write_loc, basic::FALSE),
            TokenKind::Nil => self.emit_abx(Opcode::LoadBasic, expr.write_loc, basic::NULL),
            TokenKind::Number => {
                self.load_constant(expr.write_loc, Value::from_number(token.number));
            }
            _ => {
                let text = unescape(token.text);
                let s = self.vm.new_string(&text);
                self.load_constant(expr.write_loc, Value::from_obj(s));
            }
        }
    }

    fn expr_variable(&mut self, expr: &mut ExprInfo, token: Token<'src>) {
        let mut var = expr.var;
        if !var.is_valid() {
            var = self.local_or_symbol(token.text);
        }
        self.variable_load(var, expr.write_loc);
        expr.var = var;
    }

    fn expr_unary_not(&mut self, expr: &mut ExprInfo) {
        let operand = self.push_temp(1);
        let mut inner = ExprInfo::temp(operand);
        self.parse_expr(&mut inner, Prec::Unary);
        self.emit_abx(Opcode::Not, expr.write_loc, operand as u32);
        self.pop_temp(operand);
        expr.var = VarInfo::none();
    }

    fn expr_unary_negate(&mut self, expr: &mut ExprInfo) {
        let zero = self.push_temp(2);
        let operand = zero + 1;
        let mut inner = ExprInfo::temp(operand);
        self.parse_expr(&mut inner, Prec::Unary);
        self.load_constant(zero, Value::from_number(0.0));
        self.emit_abc(Opcode::Sub, expr.write_loc, zero, operand);
        self.pop_temp(zero);
        expr.var = VarInfo::none();
    }

    fn expr_binop(&mut self, expr: &mut ExprInfo, token: Token<'src>) {
        let op = match token.kind {
            TokenKind::Plus => Opcode::Add,
            TokenKind::Minus => Opcode::Sub,
            TokenKind::Star => Opcode::Mul,
            TokenKind::Slash => Opcode::Div,
            TokenKind::EqualEqual => Opcode::Eq,
            TokenKind::BangEqual => Opcode::Ne,
            TokenKind::Less => Opcode::Lt,
            TokenKind::LessEqual => Opcode::Le,
            TokenKind::Greater => Opcode::Gt,
            TokenKind::GreaterEqual => Opcode::Ge,
            TokenKind::AmpAmp => Opcode::And,
            TokenKind::PipePipe => Opcode::Or,
            _ => {
                self.error(&format!("invalid binary operator '{}'", token.text));
                return;
            }
        };

        let short_circuit = matches!(op, Opcode::And | Opcode::Or);
        let rhs_loc = self.push_temp(1);
        // `a && b` skips evaluating b when a is falsy; `||` symmetrically
        let skip = if short_circuit { Some(self.make_jump()) } else { None };

        let mut rhs = ExprInfo::temp(rhs_loc);
        self.parse_expr(&mut rhs, precedence(token.kind));
        self.emit_abc(op, expr.write_loc, expr.write_loc, rhs_loc);

        if let Some(skip) = skip {
            self.patch_jump(skip, expr.write_loc, op == Opcode::And);
        }
        self.pop_temp(rhs_loc);
        expr.var = VarInfo::none();
    }

    fn expr_assign(&mut self, expr: &mut ExprInfo, kind: TokenKind) {
        let target = expr.var;
        if !target.is_valid() {
            self.error("invalid assignment target");
        }
        let rhs_loc = self.push_temp(1);
        let mut rhs = ExprInfo::temp(rhs_loc);
        self.parse_expr(&mut rhs, one_below(Prec::Assign));
        match kind {
            TokenKind::PlusEquals => self.emit_abc(Opcode::Add, rhs_loc, expr.write_loc, rhs_loc),
            TokenKind::MinusEquals => self.emit_abc(Opcode::Sub, rhs_loc, expr.write_loc, rhs_loc),
            _ => {}
        }
        if target.is_valid() {
            self.variable_store(target, rhs_loc);
        }
        // the assignment expression's value is the stored value
        if expr.write_loc != rhs_loc {
            self.emit_abx(Opcode::StoreMove, expr.write_loc, rhs_loc as u32);
        }
        self.pop_temp(rhs_loc);
    }

    /// `lhs.field`, and `lhs.field = expr` when an `=` follows the chain.
    fn expr_dot(&mut self, expr: &mut ExprInfo) {
        if self.current.kind != TokenKind::Identifier {
            self.error("the dot operator needs a field name");
            return;
        }
        let field = self.current;
        let sym = self.vm.intern_symbol(field.text);
        self.emit_abc(Opcode::LoadSymbol, expr.write_loc, expr.write_loc, (sym.0 & 0x1FF) as u16);

        let object_var = expr.var;
        // The field value now lives in write_loc; continue parsing from the
        // field identifier itself, which resolves as a no-op variable load.
        expr.var = VarInfo::temp(expr.write_loc);
        self.parse_expr(expr, one_below(Prec::Call));

        if self.match_tok(TokenKind::Equals) {
            if !object_var.is_valid() {
                self.error("cannot assign through a field of a temporary value");
                return;
            }
            let rhs_loc = self.push_temp(2);
            let object_loc = rhs_loc + 1;
            let mut rhs = ExprInfo::temp(rhs_loc);
            self.parse_expr(&mut rhs, Prec::Assign);
            self.variable_load(object_var, object_loc);
            self.emit_abc(Opcode::StoreSymbol, object_loc, (sym.0 & 0x1FF) as u16, rhs_loc);
            self.pop_temp(rhs_loc);
        }
    }

    /// Parse comma-separated call arguments into consecutive temps starting
    /// at `temp_first`.
    fn parse_call_args(&mut self, temp_first: u16, mut num_args: u16, end: TokenKind) -> u16 {
        if !self.is(end) {
            loop {
                let arg_loc = if num_args == 0 { temp_first } else { self.push_temp(1) };
                let mut arg = ExprInfo::temp(arg_loc);
                self.parse_expr(&mut arg, Prec::None);
                num_args += 1;
                if !self.match_tok(TokenKind::Comma) {
                    break;
                }
            }
        }
        num_args
    }

    /// Emit the argument window and the call. `zero_slot` preloads argument
    /// 0 (a receiver); `return_var` receives the call result.
    fn finish_call(&mut self, function_loc: u16, return_var: Option<VarInfo>, zero_slot: Option<u16>) {
        let temp_first = self.push_temp(1);
        let mut num_args = 0;
        if let Some(zero) = zero_slot {
            self.emit_abx(Opcode::StoreMove, temp_first, zero as u32);
            num_args = 1;
        }
        num_args = self.parse_call_args(temp_first, num_args, TokenKind::RParen);
        self.eat(TokenKind::RParen, "function call must end with a closing parenthesis");
        self.emit_abc(Opcode::Call, temp_first, function_loc, num_args);
        if let Some(ret) = return_var {
            if ret.is_valid() {
                self.variable_store(ret, temp_first);
            }
        }
        self.pop_temp(temp_first);
    }

    /// The register currently holding an expression's callee value.
    fn callee_loc(&mut self, expr: &ExprInfo, scratch: u16) -> u16 {
        match expr.var.kind {
            VarKind::Local if expr.var.is_valid() => expr.var.location,
            VarKind::Local => expr.write_loc,
            VarKind::Module => {
                self.variable_load(expr.var, scratch);
                scratch
            }
        }
    }

    fn expr_call(&mut self, expr: &mut ExprInfo) {
        let function_loc = self.push_temp(1);
        let real_function_loc = self.callee_loc(expr, function_loc);
        self.finish_call(real_function_loc, Some(VarInfo::temp(expr.write_loc)), None);
        self.pop_temp(function_loc);
    }

    /// `lhs:method(args)` — load the method through the receiver and call it
    /// with the receiver prepended.
    fn expr_method_call(&mut self, expr: &mut ExprInfo) {
        let method = self.current;
        if !self.eat(TokenKind::Identifier, "a method call needs a method name") {
            return;
        }
        let sym = self.vm.intern_symbol(method.text);

        let function_loc = self.push_temp(2);
        let receiver_scratch = function_loc + 1;
        let receiver_loc = self.callee_loc(expr, receiver_scratch);
        self.emit_abc(Opcode::LoadSymbol, function_loc, receiver_loc, (sym.0 & 0x1FF) as u16);

        self.eat(TokenKind::LParen, "a method call must start with an open parenthesis");
        self.finish_call(function_loc, Some(VarInfo::temp(expr.write_loc)), Some(receiver_loc));
        self.pop_temp(function_loc);
    }

    /// `lhs[args]` calls the `[]` protocol; `lhs[args] = v` patches the
    /// symbol load over to `[]=` and appends the value argument.
    fn expr_subscript(&mut self, expr: &mut ExprInfo) {
        let op_loc = self.push_temp(3);
        let self_loc = op_loc + 1;
        let temp_first = op_loc + 2;
        let index_sym = self.vm.intern_symbol("[]");

        if expr.var.is_valid() || expr.var.kind == VarKind::Module {
            self.variable_load(expr.var, self_loc);
        } else {
            self.emit_abx(Opcode::StoreMove, self_loc, expr.write_loc as u32);
        }

        let load_sym_at = self.mark();
        self.emit_abc(Opcode::LoadSymbol, op_loc, self_loc, (index_sym.0 & 0x1FF) as u16);
        self.emit_abx(Opcode::StoreMove, temp_first, self_loc as u32);

        let mut num_args = self.parse_call_args(temp_first, 1, TokenKind::RBracket);
        self.eat(TokenKind::RBracket, "a subscript must end with a closing square bracket");

        if self.match_tok(TokenKind::Equals) {
            let assign_sym = self.vm.intern_symbol("[]=");
            let mut patched = self.builder().instruction(load_sym_at);
            patched.patch_c((assign_sym.0 & 0x1FF) as u16);
            self.builder_mut().patch(load_sym_at, patched);

            let value_loc = self.push_temp(1);
            let mut value = ExprInfo::temp(value_loc);
            self.parse_expr(&mut value, Prec::None);
            num_args += 1;
        }

        self.emit_abc(Opcode::Call, temp_first, op_loc, num_args);
        self.emit_abx(Opcode::StoreMove, expr.write_loc, temp_first as u32);
        self.pop_temp(op_loc);
        expr.var = VarInfo::none();
    }

    /// `new Class`, `new Class(ctor args)`, `new Class.named_ctor(args)`.
    fn expr_new(&mut self, expr: &mut ExprInfo) {
        let class_name = self.current;
        if !self.eat(TokenKind::Identifier, "'new' must name a class") {
            return;
        }
        let class_var = self.local_or_symbol(class_name.text);
        let class_loc = self.push_temp(1);
        self.variable_load(class_var, class_loc);
        self.emit_abx(Opcode::NewInstance, expr.write_loc, class_loc as u32);

        let mut ctor_name = "ctor";
        if self.match_tok(TokenKind::Dot) {
            if self.current.kind == TokenKind::Identifier {
                ctor_name = self.current.text;
            }
            self.eat(TokenKind::Identifier, "expected the name of the constructor to call");
        }

        if self.match_tok(TokenKind::LParen) {
            let ctor_sym = self.vm.intern_symbol(ctor_name);
            self.emit_abc(Opcode::LoadSymbol, class_loc, class_loc, (ctor_sym.0 & 0x1FF) as u16);
            self.finish_call(class_loc, None, Some(expr.write_loc));
        }
        self.pop_temp(class_loc);
        expr.var = VarInfo::none();
    }

    fn expr_super(&mut self, expr: &mut ExprInfo) {
        let Some(class) = self.current_class else {
            self.error("'super' can only be used in class methods");
            return;
        };
        let Some(base) = self.vm.heap().class(class).base else {
            self.error("'super' can only be used in classes with a base class");
            return;
        };
        self.load_constant(expr.write_loc, Value::from_obj(base));
        expr.var = VarInfo::temp(expr.write_loc);
    }

    fn expr_function(&mut self, expr: &mut ExprInfo) {
        self.begin_function(false);
        let arity = self.parse_function_params_and_body(false);
        let f = self.finish_function(arity);
        self.load_constant(expr.write_loc, Value::from_obj(f));
        expr.var = VarInfo::none();
    }

    // ==================== Functions ====================

    /// Consume a function's name (`name`, `[]`, `[]=`, or nothing when
    /// anonymous functions are allowed) and open its builder.
    fn begin_function(&mut self, require_name: bool) -> &'src str {
        let name: &'src str = if self.current.kind == TokenKind::Identifier {
            let name = self.current.text;
            self.advance();
            name
        } else if self.current.kind == TokenKind::LBracket {
            self.advance();
            self.eat(TokenKind::RBracket, "expected ']' after '[' in an operator function name");
            if self.match_tok(TokenKind::Equals) { "[]=" } else { "[]" }
        } else if !require_name {
            ""
        } else {
            self.error("an identifier, \"[]\" or \"[]=\" is expected after 'func'");
            ""
        };
        self.push_builder(name);
        name
    }

    /// Parse `(params) { body }`. For methods, `self` is declared as the
    /// receiver slot first unless the source spells it as the first
    /// parameter. Returns the declared arity.
    fn parse_function_params_and_body(&mut self, implicit_self: bool) -> i32 {
        let mut arity: i32 = 0;
        self.eat(TokenKind::LParen, "expected a parameter list after the function name");

        if implicit_self
            && !(self.current.kind == TokenKind::Identifier && self.current.text == "self")
        {
            self.declare_local("self");
            arity += 1;
        }

        while !self.is(TokenKind::RParen) {
            if self.current.kind == TokenKind::Identifier {
                let name = self.current.text;
                self.declare_local(name);
                arity += 1;
            }
            if !self.eat(TokenKind::Identifier, "parameter names must be identifiers") {
                break;
            }
            // trailing comma is allowed
            self.match_tok(TokenKind::Comma);
        }
        self.eat(TokenKind::RParen, "a function must have a body");
        self.parse_block();
        self.match_tok(TokenKind::Semicolon);
        arity
    }

    fn parse_function_decl(&mut self) {
        self.match_tok(TokenKind::Func);
        let is_local = self.builders.len() != 1;
        let name = self.begin_function(true);
        let arity = self.parse_function_params_and_body(false);
        let f = self.finish_function(arity);

        self.vm.push_temp_root(f);
        if is_local {
            // a nested function lands in a local slot
            let var = self.declare_local(name);
            let at = self.add_constant(Value::from_obj(f));
            self.emit_abx(Opcode::LoadBasic, var.location, at + basic::CONSTANT_BASE);
        } else {
            let sym = self.vm.intern_symbol(name);
            self.vm.module_set_variable(self.module, sym, Value::from_obj(f));
        }
        self.vm.pop_temp_root();
    }

    // ==================== Statements ====================

    fn parse_block(&mut self) {
        self.eat(TokenKind::LBrace, "a block must start with an opening brace");
        self.builder_mut().push_scope();
        while !self.is(TokenKind::RBrace) {
            if !self.parse_statement() {
                break;
            }
        }
        self.builder_mut().pop_scope();
        self.eat(TokenKind::RBrace, "a block must end with a closing brace");
    }

    fn parse_var_decl(&mut self, is_static: bool) {
        self.match_tok(TokenKind::Var);
        let name = self.current;
        if !self.eat(TokenKind::Identifier, "expected an identifier after 'var'") {
            return;
        }

        if is_static {
            let sym = self.vm.intern_symbol(name.text);
            let location = self.vm.module_set_variable(self.module, sym, Value::NULL);
            if self.match_tok(TokenKind::Equals) {
                let var = VarInfo { kind: VarKind::Module, location };
                let expr_loc = self.push_temp(1);
                let mut expr = ExprInfo::temp(expr_loc);
                self.parse_expr(&mut expr, Prec::None);
                self.variable_store(var, expr_loc);
                self.pop_temp(expr_loc);
            }
        } else {
            let var = self.declare_local(name.text);
            if self.match_tok(TokenKind::Equals) {
                let mut expr = ExprInfo::temp(var.location);
                self.parse_expr(&mut expr, Prec::None);
            }
        }
        self.eat(TokenKind::Semicolon, "expected a semicolon after the variable declaration");
    }

    fn parse_if(&mut self) {
        self.match_tok(TokenKind::If);
        self.eat(TokenKind::LParen, "'if' needs a parenthesised condition");
        let expr_loc = self.push_temp(1);
        let mut expr = ExprInfo::temp(expr_loc);
        self.parse_expr(&mut expr, Prec::None);
        self.eat(TokenKind::RParen, "the 'if' condition must end with ')'");

        let if_jump = self.make_jump();
        self.pop_temp(expr_loc);
        self.parse_block();

        if self.match_tok(TokenKind::Else) {
            let else_jump = self.make_jump();
            self.patch_jump(if_jump, expr_loc, true);
            self.parse_statement();
            self.patch_jump(else_jump, INVALID_SLOT, false);
        } else {
            self.patch_jump(if_jump, expr_loc, true);
        }
    }

    fn parse_while(&mut self) {
        self.match_tok(TokenKind::While);
        let expr_loc = self.push_temp(1);
        let loop_start = self.mark();

        self.eat(TokenKind::LParen, "'while' needs a parenthesised condition");
        let mut expr = ExprInfo::temp(expr_loc);
        self.parse_expr(&mut expr, Prec::None);
        self.eat(TokenKind::RParen, "the 'while' condition must end with ')'");

        let skip_jump = self.make_jump();
        self.loop_push();
        self.parse_statement();
        self.emit_jump_back(loop_start);
        self.patch_jump(skip_jump, expr_loc, true);
        self.pop_temp(expr_loc);
        self.loop_pop();
    }

    /// `for (init; cond; increment) { body }`, lowered to the classical
    /// cond / jump / increment / body layout.
    fn parse_for(&mut self) {
        self.eat(TokenKind::LParen, "expected '(' after 'for'");
        self.builder_mut().push_scope();

        if !self.match_tok(TokenKind::Semicolon) {
            self.parse_statement();
        }

        let cond_start = self.mark();
        let cond_loc = self.push_temp(1);
        if !self.is(TokenKind::Semicolon) {
            let mut cond = ExprInfo::temp(cond_loc);
            self.parse_expr(&mut cond, Prec::None);
        } else {
            self.emit_abx(Opcode::LoadBasic, cond_loc, basic::TRUE);
        }
        let cond_to_body = self.make_jump();
        let cond_to_end = self.make_jump();
        self.pop_temp(cond_loc);
        self.match_tok(TokenKind::Semicolon);

        let increment_start = self.mark();
        if !self.match_tok(TokenKind::RParen) {
            self.parse_statement();
            self.eat(TokenKind::RParen, "the 'for' header must end with ')'");
        }
        self.emit_jump_back(cond_start);

        self.patch_jump(cond_to_body, cond_loc, false);
        self.loop_push();
        self.parse_block();
        self.emit_jump_back(increment_start);

        self.patch_jump(cond_to_end, cond_loc, true);
        self.loop_pop();

        self.builder_mut().pop_scope();
        self.match_tok(TokenKind::Semicolon);
    }

    // ==================== Classes ====================

    fn parse_class_decl(&mut self) {
        self.match_tok(TokenKind::Class);
        let name = self.current;
        if !self.eat(TokenKind::Identifier, "a class name is expected after 'class'") {
            return;
        }

        let mut base: Option<ObjRef> = None;
        if self.match_tok(TokenKind::Colon) {
            let base_name = self.current;
            if self.eat(TokenKind::Identifier, "a base class name is expected after ':'") {
                let base_value = self.vm.module_find_variable(self.module, base_name.text);
                match base_value.as_obj() {
                    Some(r) if matches!(self.vm.heap().data(r), ObjData::Class(_)) => {
                        base = Some(r);
                    }
                    _ => self.error(&format!(
                        "'{}' cannot be used as a base class for '{}'",
                        base_name.text, name.text
                    )),
                }
            }
        }

        self.eat(TokenKind::LBrace, "a class definition must start with '{'");

        let class = self.vm.new_class(self.module, name.text, base, 0);
        let sym = self.vm.intern_symbol(name.text);
        self.vm.module_set_variable(self.module, sym, Value::from_obj(class));

        self.current_class = Some(class);
        self.vm.compile_set_class(Some(class));
        while !self.is(TokenKind::RBrace) {
            if self.match_tok(TokenKind::Var) {
                self.parse_class_var(class, false);
            } else if self.match_tok(TokenKind::Func) {
                self.parse_class_func(class, false);
            } else if self.match_tok(TokenKind::Static) {
                if self.match_tok(TokenKind::Func) {
                    self.parse_class_func(class, true);
                } else if self.match_tok(TokenKind::Var) {
                    self.parse_class_var(class, true);
                } else {
                    self.error("'static' must be followed by a function or variable declaration");
                }
            } else {
                self.error("only 'var' and 'func' declarations are allowed in a class body");
                self.parse_statement();
            }
        }
        self.current_class = None;
        self.vm.compile_set_class(None);

        self.eat(TokenKind::RBrace, "a class definition must end with '}'");
        self.eat(TokenKind::Semicolon, "a class definition must end with a semicolon");
    }

    fn constexpr_value(&mut self, token: Token<'src>) -> Value {
        match token.kind {
            TokenKind::Number => Value::from_number(token.number),
            TokenKind::True => Value::TRUE,
            TokenKind::False => Value::FALSE,
            TokenKind::Nil => Value::NULL,
            _ => {
                let text = unescape(token.text);
                Value::from_obj(self.vm.new_string(&text))
            }
        }
    }

    fn parse_class_var(&mut self, class: ObjRef, is_static: bool) {
        let name = self.current;
        if !self.eat(TokenKind::Identifier, "expected a field name after 'var'") {
            return;
        }

        let mut initial = Value::NULL;
        if self.match_tok(TokenKind::Equals) {
            match self.current.kind {
                TokenKind::Number
                | TokenKind::Str
                | TokenKind::True
                | TokenKind::False
                | TokenKind::Nil => {
                    let token = self.current;
                    initial = self.constexpr_value(token);
                    self.advance();
                }
                _ => self.error("a field initializer must be a constant expression"),
            }
        }

        let sym = self.vm.intern_symbol(name.text);
        if is_static {
            self.vm.class_set_symbol(class, sym, initial);
        } else {
            self.vm.class_add_field_initializer(class, sym, initial);
        }
        self.eat(TokenKind::Semicolon, "expected a semicolon after the field declaration");
    }

    fn parse_class_func(&mut self, class: ObjRef, is_static: bool) {
        let name = self.begin_function(true);
        let arity = self.parse_function_params_and_body(!is_static);
        let f = self.finish_function(arity);
        let sym = self.vm.intern_symbol(name);
        self.vm.class_set_symbol(class, sym, Value::from_obj(f));
    }

    // ==================== Imports ====================

    fn parse_import(&mut self) {
        self.match_tok(TokenKind::Import);
        let name_token = self.current;
        if !self.eat(TokenKind::Str, "'import' must be followed by a module name string") {
            return;
        }
        let name = name_token.text;

        let from = self.module_name.clone();
        let imported = import_module(self.vm, &from, name);
        if imported.is_none() {
            self.error(&format!("failed to import module '{name}'"));
        }

        if self.match_tok(TokenKind::For) {
            loop {
                let source_name = self.current;
                if !self.eat(TokenKind::Identifier, "an imported binding must be an identifier") {
                    break;
                }
                let mut target_name = source_name;
                if self.match_tok(TokenKind::Equals) || self.match_tok(TokenKind::As) {
                    target_name = self.current;
                    self.eat(TokenKind::Identifier, "an import alias must be an identifier");
                }
                if let Some(imported) = imported {
                    let value = self.vm.module_find_variable(imported, source_name.text);
                    let sym = self.vm.intern_symbol(target_name.text);
                    self.vm.module_set_variable(self.module, sym, value);
                }
                if !self.match_tok(TokenKind::Comma) {
                    break;
                }
            }
        } else if let Some(imported) = imported {
            // copy every named, non-null top-level binding
            let bindings: Vec<_> = self
                .vm
                .heap()
                .module(imported)
                .variables
                .iter()
                .filter_map(|slot| slot.name.map(|name| (name, slot.value)))
                .filter(|(_, value)| !value.is_null())
                .collect();
            for (sym, value) in bindings {
                self.vm.module_set_variable(self.module, sym, value);
            }
        }

        self.eat(TokenKind::Semicolon, "an import must end with a semicolon");
    }

    // ==================== Statement dispatch ====================

    /// Parse one statement; false ends the enclosing statement sequence.
    fn parse_statement(&mut self) -> bool {
        match self.current.kind {
            TokenKind::Eof => return false,
            TokenKind::Semicolon => {
                self.advance();
            }
            TokenKind::Break => {
                if self.loop_starts.is_empty() {
                    self.error("'break' cannot be used outside of a loop");
                } else {
                    let line = self.line();
                    self.builder_mut().emit_break_placeholder(line);
                }
                self.advance();
                self.eat(TokenKind::Semicolon, "nothing may follow a 'break' statement");
                // nothing after a break in this block is reachable
                return false;
            }
            TokenKind::Return => {
                self.advance();
                let expr_loc = self.push_temp(1);
                if !self.is(TokenKind::Semicolon) {
                    let mut expr = ExprInfo::temp(expr_loc);
                    self.parse_expr(&mut expr, Prec::None);
                } else {
                    self.emit_abx(Opcode::LoadBasic, expr_loc, basic::NULL);
                }
                self.emit_abx(Opcode::Return, 0, expr_loc as u32);
                self.pop_temp(expr_loc);
                self.match_tok(TokenKind::Semicolon);
                // skip unreachable code up to the end of the block
                while !self.is(TokenKind::RBrace) {
                    self.advance();
                }
                return false;
            }
            TokenKind::Class => self.parse_class_decl(),
            TokenKind::If => self.parse_if(),
            TokenKind::While => self.parse_while(),
            TokenKind::Static | TokenKind::Var => {
                let is_static = self.match_tok(TokenKind::Static);
                self.parse_var_decl(is_static);
            }
            TokenKind::Func => self.parse_function_decl(),
            TokenKind::Import => self.parse_import(),
            TokenKind::For => {
                self.advance();
                self.parse_for();
            }
            TokenKind::Identifier => {
                let working_loc = self.push_temp(1);
                let mut expr = ExprInfo::temp(working_loc);
                self.parse_expr(&mut expr, Prec::None);
                self.match_tok(TokenKind::Semicolon);
                self.pop_temp(working_loc);
            }
            TokenKind::LBrace => self.parse_block(),
            TokenKind::New | TokenKind::Super => {
                let expr_loc = self.push_temp(1);
                let mut expr = ExprInfo { write_loc: expr_loc, var: VarInfo::temp(expr_loc) };
                self.parse_expr(&mut expr, Prec::None);
                self.match_tok(TokenKind::Semicolon);
                self.pop_temp(expr_loc);
            }
            _ => {
                self.error(&format!("unexpected token '{}'", self.current.text));
                self.advance();
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use skiff_vm_core::VmParams;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn compile(source: &str) -> (Vm, Result<(), VmError>, ObjRef) {
        let mut vm = Vm::new(VmParams::default());
        let module = vm.module_make(Some("test")).unwrap();
        let result = compile_into_module(&mut vm, module, source);
        (vm, result, module)
    }

    fn init_code(vm: &Vm, module: ObjRef) -> Vec<Instruction> {
        let init = vm.heap().module(module).init.unwrap();
        vm.heap().function(init).code.to_vec()
    }

    #[test]
    fn test_empty_module_is_single_return() {
        let (vm, result, module) = compile("");
        result.unwrap();
        let code = init_code(&vm, module);
        assert_eq!(code.len(), 1);
        assert_eq!(code[0].op().unwrap(), Opcode::Return);
    }

    #[test]
    fn test_zero_byte_source_compiles_cleanly() {
        let (_, result, _) = compile("");
        assert!(result.is_ok());
    }

    #[test]
    fn test_var_decl_emits_constant_load() {
        let (vm, result, module) = compile("var x = 5;");
        result.unwrap();
        let code = init_code(&vm, module);
        assert_eq!(code[0].op().unwrap(), Opcode::LoadBasic);
        assert_eq!(code[0].bx(), basic::CONSTANT_BASE);
        let init = vm.heap().module(module).init.unwrap();
        assert_eq!(vm.heap().function(init).constants.len(), 1);
    }

    #[test]
    fn test_break_outside_loop_is_compile_error() {
        let (_, result, _) = compile("break;");
        assert!(matches!(result, Err(VmError::Compile(_))));
    }

    #[test]
    fn test_redeclaration_is_compile_error() {
        let (_, result, _) = compile("var x = 1; var x = 2;");
        assert!(matches!(result, Err(VmError::Compile(_))));
    }

    #[test]
    fn test_multiple_errors_reported() {
        let errors: Rc<RefCell<Vec<String>>> = Rc::new(RefCell::new(Vec::new()));
        let sink = errors.clone();
        let mut vm = Vm::new(VmParams {
            error_fn: Some(Box::new(move |kind, _line, message| {
                if kind == ErrorKind::Compile {
                    sink.borrow_mut().push(message.to_string());
                }
            })),
            ..VmParams::default()
        });
        let module = vm.module_make(Some("test")).unwrap();
        let result = compile_into_module(&mut vm, module, "var 1;\nvar 2;\n");
        assert!(result.is_err());
        assert!(errors.borrow().len() >= 2, "expected both errors to be reported");
    }

    #[test]
    fn test_class_decl_installs_module_variable() {
        let (vm, result, module) = compile("class Point { var x = 0; func ping() {} };");
        result.unwrap();
        let value = vm.module_find_variable(module, "Point");
        let class = value.as_obj().expect("class value");
        let c = vm.heap().class(class);
        assert_eq!(c.name, "Point");
        assert_eq!(c.field_initializers.len(), 1);
    }

    #[test]
    fn test_class_method_gets_implicit_receiver() {
        fn arity_of(vm: &mut Vm, class: ObjRef, name: &str) -> i32 {
            let sym = vm.intern_symbol(name);
            let f = vm.heap().class(class).symbols[sym.index()].value.as_obj().unwrap();
            vm.heap().function(f).arity
        }
        let (mut vm, result, module) = compile(
            "class A { func implicit() {} func spelled(self) {} func two(self, x) {} };",
        );
        result.unwrap();
        let class = vm.module_find_variable(module, "A").as_obj().unwrap();
        assert_eq!(arity_of(&mut vm, class, "implicit"), 1);
        assert_eq!(arity_of(&mut vm, class, "spelled"), 1);
        assert_eq!(arity_of(&mut vm, class, "two"), 2);
    }

    #[test]
    fn test_top_level_func_is_module_binding() {
        let (vm, result, module) = compile("func fib(n) { return n; }");
        result.unwrap();
        let f = vm.module_find_variable(module, "fib").as_obj().unwrap();
        assert_eq!(vm.heap().function(f).arity, 1);
        assert_eq!(vm.heap().function(f).name, "fib");
    }

    #[test]
    fn test_short_circuit_emits_conditional_jump() {
        let (vm, result, module) = compile("var a = true; var b = a && a;");
        result.unwrap();
        let code = init_code(&vm, module);
        assert!(
            code.iter().any(|i| i.op().unwrap() == Opcode::JumpIfNot),
            "expected a JumpIfNot for '&&'"
        );
        assert!(code.iter().any(|i| i.op().unwrap() == Opcode::And));
    }

    #[test]
    fn test_loop_patches_break_placeholder() {
        let (vm, result, module) = compile("while (true) { break; }");
        result.unwrap();
        let code = init_code(&vm, module);
        assert!(
            !code.contains(&Instruction::INVALID),
            "an unpatched break placeholder survived"
        );
        assert!(code.iter().any(|i| i.op().unwrap() == Opcode::Jump));
    }

    #[test]
    fn test_super_outside_class_is_error() {
        let (_, result, _) = compile("super;");
        assert!(matches!(result, Err(VmError::Compile(_))));
    }
}

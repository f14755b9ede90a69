//! End-to-end scenarios: compile real source, run it, observe results
//! through the embedding API.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use skiff_vm_runtime::{
    ClassBind, ErrorKind, ValueType, Vm, VmError, VmParams, compile_into_module, exec_in_module,
};

type Prints = Rc<RefCell<Vec<String>>>;
type Diags = Rc<RefCell<Vec<(ErrorKind, i32, String)>>>;

fn capture_vm() -> (Vm, Prints, Diags) {
    let prints: Prints = Rc::new(RefCell::new(Vec::new()));
    let diags: Diags = Rc::new(RefCell::new(Vec::new()));
    let print_sink = prints.clone();
    let diag_sink = diags.clone();
    let vm = Vm::new(VmParams {
        print_fn: Some(Box::new(move |message| {
            print_sink.borrow_mut().push(message.to_string());
        })),
        error_fn: Some(Box::new(move |kind, line, message| {
            diag_sink.borrow_mut().push((kind, line, message.to_string()));
        })),
        ..VmParams::default()
    });
    (vm, prints, diags)
}

fn module_number(vm: &Vm, module_name: &str, var: &str) -> f64 {
    let module = vm.find_module(module_name).expect("module registered");
    let value = vm.module_find_variable(module, var);
    assert!(value.is_number(), "{var} is not a number");
    value.as_number()
}

fn module_string(vm: &Vm, module_name: &str, var: &str) -> String {
    let module = vm.find_module(module_name).expect("module registered");
    let value = vm.module_find_variable(module, var);
    let r = value.as_obj().expect("string object");
    vm.heap().string(r).text.clone()
}

#[test]
fn fibonacci() {
    let (mut vm, _, _) = capture_vm();
    let source = "func fib(n) { if (n < 2) { return n; } return fib(n-1) + fib(n-2); }";
    exec_in_module(&mut vm, Some("m"), source).unwrap();

    vm.stack_resize(3);
    vm.stack_load_variable(1, 0, "fib");
    assert_eq!(vm.stack_get_type(1), ValueType::Function);
    assert_eq!(vm.stack_get_arity(1), Some(1));
    vm.stack_set_number(2, 10.0);
    vm.call(1, 2, 1).unwrap();
    assert_eq!(vm.stack_read_number(2), Some(55.0));
}

#[test]
fn class_with_fields_and_method() {
    let (mut vm, _, _) = capture_vm();
    let source = "class P { var x = 1; var y = 2; func sum(self) { return self.x + self.y; } };";
    exec_in_module(&mut vm, Some("m"), source).unwrap();

    vm.stack_resize(5);
    vm.stack_load_variable(1, 0, "P");
    vm.stack_make_instance(1, 2).unwrap();
    vm.stack_load_variable(3, 2, "sum");
    let instance = vm.stack_value(2);
    vm.stack_set_value(4, instance);
    vm.call(3, 4, 1).unwrap();
    assert_eq!(vm.stack_read_number(4), Some(3.0));
}

#[test]
fn inheritance_and_super() {
    let (mut vm, _, _) = capture_vm();
    let source = "\
class A { func v(self) { return 1; } };\n\
class B : A { func v(self) { return super.v(self) + 10; } };\n";
    exec_in_module(&mut vm, Some("m"), source).unwrap();

    vm.stack_resize(5);
    vm.stack_load_variable(1, 0, "B");
    vm.stack_make_instance(1, 2).unwrap();
    vm.stack_load_variable(3, 2, "v");
    let instance = vm.stack_value(2);
    vm.stack_set_value(4, instance);
    vm.call(3, 4, 1).unwrap();
    assert_eq!(vm.stack_read_number(4), Some(11.0));
}

#[test]
fn method_call_operator_passes_receiver() {
    let (mut vm, _, _) = capture_vm();
    let source = "\
class P { var x = 20; func double(self) { return self.x + self.x; } };\n\
static var result = 0;\n\
func run() { var p = new P; result = p:double(); }\n\
run();\n";
    exec_in_module(&mut vm, Some("m"), source).unwrap();
    assert_eq!(module_number(&vm, "m", "result"), 40.0);
}

#[test]
fn short_circuit_skips_side_effects() {
    let (mut vm, _, _) = capture_vm();
    let source = "\
static var k = 0;\n\
func side() { k = k + 1; return true; }\n\
static var r = false && side();\n\
static var r2 = true || side();\n";
    exec_in_module(&mut vm, Some("m"), source).unwrap();
    assert_eq!(module_number(&vm, "m", "k"), 0.0);

    let module = vm.find_module("m").unwrap();
    assert!(vm.module_find_variable(module, "r").is_false());
    assert!(vm.module_find_variable(module, "r2").is_true());
}

#[test]
fn and_or_evaluate_rhs_when_needed() {
    let (mut vm, _, _) = capture_vm();
    let source = "\
static var k = 0;\n\
func side() { k = k + 1; return true; }\n\
static var r = true && side();\n\
static var r2 = false || side();\n";
    exec_in_module(&mut vm, Some("m"), source).unwrap();
    assert_eq!(module_number(&vm, "m", "k"), 2.0);
}

#[test]
fn string_concatenation_stringifies_both_sides() {
    let (mut vm, _, _) = capture_vm();
    let source = r#"static var s = "x=" + 3 + ", y=" + true;"#;
    exec_in_module(&mut vm, Some("m"), source).unwrap();
    assert_eq!(module_string(&vm, "m", "s"), "x=3, y=true");
}

#[test]
fn gc_finalizer_runs_for_every_dropped_instance() {
    let (mut vm, _, _) = capture_vm();
    let count = Rc::new(Cell::new(0u32));
    let in_finalizer = count.clone();

    vm.stack_resize(1);
    vm.stack_make_module(0, Some("app")).unwrap();
    let bind = ClassBind {
        name: "Res",
        extra_data_size: 8,
        methods: &[],
        finalizer: Some(Rc::new(move |_vm, _data| in_finalizer.set(in_finalizer.get() + 1))),
    };
    vm.stack_store_class(0, &bind).unwrap();

    let module = vm.find_module("app").unwrap();
    let source = "\
for (var i = 0; i < 1000; i = i + 1) {\n\
    var t = new Res;\n\
    t = nil;\n\
}\n";
    compile_into_module(&mut vm, module, source).unwrap();
    vm.run_module_init(module).unwrap();

    vm.collect_garbage();
    vm.collect_garbage();
    assert_eq!(count.get(), 1000);
}

#[test]
fn scripted_dtor_runs_once_per_instance() {
    let (mut vm, _, _) = capture_vm();
    let source = "\
static var hits = 0;\n\
class D { func dtor(self) { hits = hits + 1; } };\n\
func churn() {\n\
    for (var i = 0; i < 10; i = i + 1) {\n\
        var t = new D;\n\
        t = nil;\n\
    }\n\
}\n\
churn();\n";
    exec_in_module(&mut vm, Some("m"), source).unwrap();

    vm.collect_garbage();
    assert_eq!(module_number(&vm, "m", "hits"), 10.0);
    vm.collect_garbage();
    assert_eq!(module_number(&vm, "m", "hits"), 10.0);
}

#[test]
fn import_with_alias_binds_only_the_alias() {
    let mut vm = Vm::new(VmParams {
        module_fn: Some(Box::new(|_from, name| {
            (name == "M").then(|| "static var e = 7;".to_string())
        })),
        ..VmParams::default()
    });
    let source = "import \"M\" for e as f;\nstatic var copied = f;\n";
    exec_in_module(&mut vm, Some("consumer"), source).unwrap();

    let consumer = vm.find_module("consumer").unwrap();
    assert_eq!(vm.module_find_variable(consumer, "f").as_number(), 7.0);
    assert!(vm.module_find_variable(consumer, "e").is_null(), "'e' must not be bound");
    assert_eq!(module_number(&vm, "consumer", "copied"), 7.0);
}

#[test]
fn import_without_list_copies_all_bindings() {
    let mut vm = Vm::new(VmParams {
        module_fn: Some(Box::new(|_from, name| {
            (name == "M").then(|| "static var a = 1; static var b = 2;".to_string())
        })),
        ..VmParams::default()
    });
    exec_in_module(&mut vm, Some("consumer"), "import \"M\";").unwrap();
    assert_eq!(module_number(&vm, "consumer", "a"), 1.0);
    assert_eq!(module_number(&vm, "consumer", "b"), 2.0);
}

#[test]
fn missing_module_is_a_compile_error_with_not_found_diag() {
    let (mut vm, _, diags) = capture_vm();
    let err = exec_in_module(&mut vm, Some("m"), "import \"nowhere\";").unwrap_err();
    assert!(matches!(err, VmError::Compile(_)));
    assert!(
        diags.borrow().iter().any(|(kind, _, _)| *kind == ErrorKind::ModuleNotFound),
        "expected a module-not-found diagnostic"
    );
}

#[test]
fn runtime_error_reports_a_full_stack_trace() {
    let (mut vm, _, diags) = capture_vm();
    let source = "\
func boom() {\n\
    var x = 3;\n\
    x:foo();\n\
}\n\
boom();\n";
    let err = exec_in_module(&mut vm, Some("m"), source).unwrap_err();
    assert!(matches!(err, VmError::Runtime(_)));

    let diags = diags.borrow();
    let kinds: Vec<ErrorKind> = diags.iter().map(|d| d.0).collect();
    let begin = kinds.iter().position(|k| *k == ErrorKind::StackTraceBegin).unwrap();
    let end = kinds.iter().position(|k| *k == ErrorKind::StackTraceEnd).unwrap();
    assert!(begin < end);
    let trace_lines: Vec<i32> = diags
        .iter()
        .filter(|d| d.0 == ErrorKind::StackTrace)
        .map(|d| d.1)
        .collect();
    assert!(!trace_lines.is_empty());
    assert!(trace_lines.contains(&3), "trace should name the offending line, got {trace_lines:?}");
}

#[test]
fn wrong_argc_from_host_leaves_stack_intact() {
    let (mut vm, _, _) = capture_vm();
    exec_in_module(&mut vm, Some("m"), "func two(a, b) { return a + b; }").unwrap();
    vm.stack_resize(3);
    vm.stack_load_variable(1, 0, "two");
    vm.stack_set_number(2, 1.0);
    let err = vm.call(1, 2, 1).unwrap_err();
    assert!(matches!(err, VmError::ArityMismatch(_)));
    assert_eq!(vm.stack_read_number(2), Some(1.0));
}

#[test]
fn subscript_protocol_dispatches_to_index_methods() {
    let (mut vm, _, _) = capture_vm();
    let source = "\
class Store {\n\
    var data = 0;\n\
    func [](self, key) { return self.data + key; }\n\
    func []=(self, key, value) { self.data = value; }\n\
};\n\
static var out = 0;\n\
func run() {\n\
    var s = new Store;\n\
    s[1] = 41;\n\
    out = s[1];\n\
}\n\
run();\n";
    exec_in_module(&mut vm, Some("m"), source).unwrap();
    assert_eq!(module_number(&vm, "m", "out"), 42.0);
}

#[test]
fn callable_instances_dispatch_through_call_symbol() {
    let (mut vm, _, _) = capture_vm();
    let source = "\
class Adder {\n\
    var base = 100;\n\
    func call(self, n) { return self.base + n; }\n\
};\n\
static var out = 0;\n\
func run() { var a = new Adder; out = a(7); }\n\
run();\n";
    exec_in_module(&mut vm, Some("m"), source).unwrap();
    assert_eq!(module_number(&vm, "m", "out"), 107.0);
}

#[test]
fn while_loop_with_break() {
    let (mut vm, _, _) = capture_vm();
    let source = "\
static var n = 0;\n\
func run() {\n\
    while (true) {\n\
        n = n + 1;\n\
        if (n >= 5) { break; }\n\
    }\n\
}\n\
run();\n";
    exec_in_module(&mut vm, Some("m"), source).unwrap();
    assert_eq!(module_number(&vm, "m", "n"), 5.0);
}

#[test]
fn compound_assignment_operators() {
    let (mut vm, _, _) = capture_vm();
    let source = "\
static var a = 10;\n\
func run() { a += 5; a -= 3; }\n\
run();\n";
    exec_in_module(&mut vm, Some("m"), source).unwrap();
    assert_eq!(module_number(&vm, "m", "a"), 12.0);
}

#[test]
fn print_through_std_io() {
    let (mut vm, prints, _) = capture_vm();
    vm.stack_resize(1);
    skiff_vm_runtime::load_std_io(&mut vm, 0).unwrap();
    let source = "\
import \"std:io\" for print;\n\
print(\"value: \", 40 + 2);\n";
    exec_in_module(&mut vm, Some("m"), source).unwrap();
    assert_eq!(prints.borrow().as_slice(), &["value: 42".to_string()]);
}

#[test]
fn deterministic_reruns_match() {
    fn run_once() -> (Vec<String>, Option<VmError>) {
        let (mut vm, prints, _) = capture_vm();
        vm.stack_resize(1);
        skiff_vm_runtime::load_std_io(&mut vm, 0).unwrap();
        let source = "\
import \"std:io\" for print;\n\
func fib(n) { if (n < 2) { return n; } return fib(n-1) + fib(n-2); }\n\
static var i = 0;\n\
func run() {\n\
    for (i = 0; i < 8; i = i + 1) { print(fib(i)); }\n\
}\n\
run();\n";
        let err = exec_in_module(&mut vm, Some("m"), source).err();
        (prints.borrow().clone(), err)
    }
    let (first_out, first_err) = run_once();
    let (second_out, second_err) = run_once();
    assert_eq!(first_out, second_out);
    assert_eq!(first_err, second_err);
    assert_eq!(first_out, ["0", "1", "1", "2", "3", "5", "8", "13"]);
}

#[test]
fn undefined_method_error_names_the_leaf_class() {
    let (mut vm, _, _) = capture_vm();
    let source = "\
class Base { };\n\
class Leaf : Base { };\n\
func run() { var x = new Leaf; x:nope(); }\n\
run();\n";
    let err = exec_in_module(&mut vm, Some("m"), source).unwrap_err();
    assert!(matches!(err, VmError::Runtime(_)));
    assert!(
        vm.error_string().contains("Leaf"),
        "error should name the originating class: {}",
        vm.error_string()
    );
}

#[test]
fn file_backed_module_resolver() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("shapes.sk"), "static var sides = 4;").unwrap();

    let root = dir.path().to_path_buf();
    let mut vm = Vm::new(VmParams {
        module_fn: Some(Box::new(move |_from, name| {
            std::fs::read_to_string(root.join(format!("{name}.sk"))).ok()
        })),
        ..VmParams::default()
    });
    exec_in_module(&mut vm, Some("main"), "import \"shapes\" for sides;").unwrap();
    assert_eq!(module_number(&vm, "main", "sides"), 4.0);
}

#[test]
fn zero_byte_source_produces_empty_initializer() {
    let (mut vm, _, _) = capture_vm();
    exec_in_module(&mut vm, Some("m"), "").unwrap();
    assert_eq!(vm.stack_get_type(0), ValueType::Module);
}

#[test]
fn weak_refs_are_not_kept_alive_by_the_vm() {
    let (mut vm, _, _) = capture_vm();
    let token = 0xDEAD_BEEFusize;
    vm.stack_resize(1);
    vm.stack_set_weak_ref(0, token);
    vm.collect_garbage();
    assert_eq!(vm.stack_read_weak_ref(0), Some(token));
}

//! # Skiff VM Runtime
//!
//! The embedding facade: compile-and-run source into named modules, the
//! standard module set, and re-exports of the whole host surface so an
//! embedder depends on this crate alone.
//!
//! ```no_run
//! use skiff_vm_runtime::{Vm, VmParams, exec_in_module};
//!
//! let mut vm = Vm::new(VmParams::default());
//! exec_in_module(&mut vm, Some("main"), "static var greeting = 1;").unwrap();
//! ```

#![warn(clippy::all)]

pub use skiff_vm_bytecode::{Instruction, Opcode, disassemble};
pub use skiff_vm_compiler::{compile_into_module, import_module};
pub use skiff_vm_core::{
    ClassBind, ClassFinalizer, ErrorKind, Handle, MethodBind, NativeFn, ObjKind, ObjRef, SymbolId,
    Value, ValueType, Vm, VmError, VmParams, display_value,
};

use skiff_vm_core::Value as CoreValue;

/// Compile `source` into a module named `module_name` (or an anonymous,
/// unregistered module) and run its top-level body once.
///
/// On return — success or failure — the module object occupies view slot 0.
/// A name collision fails with [`VmError::ModuleAlreadyDefined`] before
/// anything is compiled; compile errors leave the module body unexecuted.
pub fn exec_in_module(vm: &mut Vm, module_name: Option<&str>, source: &str) -> Result<(), VmError> {
    let module = vm.module_make(module_name)?;
    vm.push_temp_root(module);
    let result =
        compile_into_module(vm, module, source).and_then(|_| vm.run_module_init(module));
    vm.stack_resize(1);
    vm.stack_set_value(0, CoreValue::from_obj(module));
    vm.pop_temp_root();
    result
}

/// Install the `std:io` module and leave it in view slot `idx`.
///
/// It exposes one variadic native, `print`, which stringifies and
/// concatenates its arguments and forwards the message to the host print
/// callback.
pub fn load_std_io(vm: &mut Vm, idx: usize) -> Result<(), VmError> {
    vm.stack_make_module(idx, Some("std:io"))?;
    vm.stack_store_native_fn(idx, "print", io_print, -1)
}

fn io_print(vm: &mut Vm, num_args: i32) -> Result<(), VmError> {
    let mut message = String::new();
    for i in 0..num_args.max(0) as usize {
        message.push_str(&vm.display(vm.stack_value(i)));
    }
    vm.host_print(&message);
    vm.stack_resize(1);
    vm.stack_set_nil(0);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn test_exec_leaves_module_on_stack() {
        let mut vm = Vm::new(VmParams::default());
        exec_in_module(&mut vm, Some("m"), "static var x = 3;").unwrap();
        assert_eq!(vm.stack_get_type(0), ValueType::Module);
    }

    #[test]
    fn test_module_collision_is_reported_once() {
        let mut vm = Vm::new(VmParams::default());
        exec_in_module(&mut vm, Some("m"), "static var x = 3;").unwrap();
        let err = exec_in_module(&mut vm, Some("m"), "static var x = 4;").unwrap_err();
        assert!(matches!(err, VmError::ModuleAlreadyDefined(_)));
        // the first module is unaffected
        let module = vm.find_module("m").unwrap();
        assert_eq!(vm.module_find_variable(module, "x").as_number(), 3.0);
    }

    #[test]
    fn test_std_io_print_zero_args() {
        let printed: Rc<RefCell<Vec<String>>> = Rc::new(RefCell::new(Vec::new()));
        let sink = printed.clone();
        let mut vm = Vm::new(VmParams {
            print_fn: Some(Box::new(move |message| sink.borrow_mut().push(message.to_string()))),
            ..VmParams::default()
        });
        vm.stack_resize(2);
        load_std_io(&mut vm, 0).unwrap();
        vm.stack_load_variable(1, 0, "print");
        vm.call(1, 2, 0).unwrap();
        assert_eq!(printed.borrow().as_slice(), &[String::new()]);
    }
}

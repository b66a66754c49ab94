//! Module records, windows and execution.

mod common;

use common::*;
use orus_vm::prelude::*;

/// A module whose body computes `6 * 7` into its window slot 0
/// (register 240) and exports it as `answer`.
fn answer_module(name: &str) -> ModuleRecord {
    let mut asm = Asm::new();
    asm.load_i32(0, 6);
    asm.load_i32(1, 7);
    asm.abc(Opcode::MulI32, 240, 0, 1);

    let mut record = ModuleRecord::new(name, asm.finish());
    record.exports.insert("answer".into(), 0);
    record
}

#[test]
fn module_bodies_execute_once_and_populate_exports() {
    let (mut vm, _) = default_vm();
    vm.register_module(answer_module("math")).unwrap();

    assert_eq!(vm.interpret_module("math"), InterpretResult::Ok);
    assert_eq!(vm.module_export("math", "answer"), Some(Value::I32(42)));

    // Idempotent: the executed flag short-circuits a second run.
    assert_eq!(vm.interpret_module("math"), InterpretResult::Ok);
}

#[test]
fn unknown_modules_fail_resolution() {
    let (mut vm, _) = default_vm();
    assert_eq!(vm.interpret_module("nope"), InterpretResult::RuntimeError);
    assert!(matches!(vm.take_failure(), Some(VmError::ModuleNotFound(name)) if name == "nope"));
}

#[test]
fn module_windows_are_isolated_per_module() {
    let (mut vm, _) = default_vm();
    vm.register_module(answer_module("a")).unwrap();

    let mut asm = Asm::new();
    asm.load_i32(0, 5);
    asm.load_i32(1, 5);
    asm.abc(Opcode::AddI32, 240, 0, 1); // window slot 0 = 10
    let mut b = ModuleRecord::new("b", asm.finish());
    b.exports.insert("ten".into(), 0);
    vm.register_module(b).unwrap();

    assert_eq!(vm.interpret_module("a"), InterpretResult::Ok);
    assert_eq!(vm.interpret_module("b"), InterpretResult::Ok);

    assert_eq!(vm.module_export("a", "answer"), Some(Value::I32(42)));
    assert_eq!(vm.module_export("b", "ten"), Some(Value::I32(10)));
}

#[test]
fn script_module_window_is_untouched_by_module_runs() {
    let (mut vm, _) = default_vm();
    vm.register_module(answer_module("math")).unwrap();

    // The script writes its own module-window register first.
    let mut asm = Asm::new();
    asm.load_i32(240, 1234);
    assert_eq!(vm.interpret(asm.finish()), InterpretResult::Ok);

    assert_eq!(vm.interpret_module("math"), InterpretResult::Ok);

    // Back in script context the slot still holds the script's value.
    assert_eq!(vm.register(240), Some(Value::I32(1234)));
}

#[test]
fn missing_exports_resolve_to_none() {
    let (mut vm, _) = default_vm();
    vm.register_module(answer_module("math")).unwrap();
    assert_eq!(vm.interpret_module("math"), InterpretResult::Ok);
    assert_eq!(vm.module_export("math", "no-such"), None);
}

//! String opcodes: concatenation, rendering, interning.

mod common;

use common::*;
use orus_vm::prelude::*;

#[test]
fn concat_then_print() {
    let (mut vm, out) = default_vm();
    let hello = vm.alloc_string_value("Hello, ");
    let world = vm.alloc_string_value("world!");

    let mut asm = Asm::new();
    asm.load_const(0, hello);
    asm.load_const(1, world);
    asm.abc(Opcode::Concat, 2, 0, 1);
    asm.print(2);

    assert_eq!(vm.interpret(asm.finish()), InterpretResult::Ok);
    assert_eq!(out.contents(), "Hello, world!\n");
}

#[test]
fn long_concats_build_ropes_that_print_correctly() {
    let (mut vm, out) = default_vm();
    let left = vm.alloc_string_value(&"x".repeat(100));
    let right = vm.alloc_string_value(&"y".repeat(100));

    let mut asm = Asm::new();
    asm.load_const(0, left);
    asm.load_const(1, right);
    asm.abc(Opcode::Concat, 2, 0, 1);
    asm.abc(Opcode::Concat, 3, 2, 2); // rope of ropes
    asm.print(3);

    assert_eq!(vm.interpret(asm.finish()), InterpretResult::Ok);
    let expected = format!("{}{}", "x".repeat(100), "y".repeat(100)).repeat(2);
    assert_eq!(out.contents(), format!("{expected}\n"));
}

#[test]
fn concat_of_a_non_string_is_a_type_error() {
    let (mut vm, _) = default_vm();
    let s = vm.alloc_string_value("s");

    let mut asm = Asm::new();
    asm.load_const(0, s);
    asm.load_i32(1, 3);
    asm.abc(Opcode::Concat, 2, 0, 1);

    expect_error_kind(&mut vm, asm.finish(), ErrorKind::Type);
}

#[test]
fn to_string_renders_like_print() {
    let (mut vm, out) = default_vm();

    let mut asm = Asm::new();
    asm.load_i32(0, -17);
    asm.op(Opcode::ToString).r(1).r(0);
    asm.print(1);
    asm.load_f64(2, 2.5);
    asm.op(Opcode::ToString).r(3).r(2);
    asm.print(3);

    assert_eq!(vm.interpret(asm.finish()), InterpretResult::Ok);
    assert_eq!(out.lines(), ["-17", "2.5"]);
}

#[test]
fn string_equality_is_content_based() {
    let (mut vm, out) = default_vm();
    let a = vm.alloc_string_value("same-content");
    let b = vm.alloc_string_value("same-content"); // interned: same handle
    let long_a = vm.alloc_string_value(&"z".repeat(90));
    let suffix = vm.alloc_string_value("!");

    let mut asm = Asm::new();
    asm.load_const(0, a);
    asm.load_const(1, b);
    asm.abc(Opcode::Eq, 2, 0, 1);
    asm.print(2);

    // A rope and a flat string with identical bytes.
    asm.load_const(3, long_a);
    asm.load_const(4, suffix);
    asm.abc(Opcode::Concat, 5, 3, 4);
    let flat = vm.alloc_string_value(&format!("{}!", "z".repeat(90)));
    asm.load_const(6, flat);
    asm.abc(Opcode::Eq, 7, 5, 6);
    asm.print(7);

    assert_eq!(vm.interpret(asm.finish()), InterpretResult::Ok);
    assert_eq!(out.lines(), ["true", "true"]);
}

#[test]
fn arrays_of_strings_render_nested() {
    let (mut vm, out) = default_vm();
    let a = vm.alloc_string_value("a");
    let b = vm.alloc_string_value("b");

    let mut asm = Asm::new();
    asm.load_const(0, a);
    asm.load_const(1, b);
    asm.abc(Opcode::MakeArray, 2, 0, 2);
    asm.print(2);

    assert_eq!(vm.interpret(asm.finish()), InterpretResult::Ok);
    assert_eq!(out.contents(), "[a, b]\n");
}

//! Closures and upvalue capture semantics.

mod common;

use common::*;
use orus_vm::prelude::*;

/// `fn read() { return upvalue#0 }`
fn reader_function(vm: &mut Interpreter) -> ObjHandle {
    let mut body = Asm::new();
    body.op(Opcode::GetUpvalue).r(64).b(0);
    body.op(Opcode::Return).r(64);
    vm.register_function(0, 1, body.finish(), Some("read"))
}

/// `fn write(v) { upvalue#0 = v }`
fn writer_function(vm: &mut Interpreter) -> ObjHandle {
    let mut body = Asm::new();
    body.op(Opcode::SetUpvalue).b(0).r(64);
    body.op(Opcode::ReturnVoid);
    vm.register_function(1, 1, body.finish(), Some("write"))
}

#[test]
fn closed_upvalue_keeps_the_captured_value() {
    let (mut vm, out) = default_vm();
    let read = reader_function(&mut vm);

    let mut asm = Asm::new();
    asm.load_i32(70, 42);
    let k = asm.k(Value::Obj(read));
    asm.op(Opcode::Closure).r(0).u16(k).b(1).b(1).b(70);
    asm.op(Opcode::CloseUpvalue).r(70);
    asm.load_i32(70, 7); // overwrite the slot after the close
    asm.op(Opcode::Call).r(0).r(1).b(0).r(2);
    asm.print(2);

    assert_eq!(vm.interpret(asm.finish()), InterpretResult::Ok);
    assert_eq!(out.contents(), "42\n");
}

#[test]
fn close_then_get_returns_the_last_write_through_the_upvalue() {
    let (mut vm, out) = default_vm();
    let read = reader_function(&mut vm);
    let write = writer_function(&mut vm);

    // Both closures capture the same slot, so they share one upvalue.
    let mut asm = Asm::new();
    asm.load_i32(70, 1);
    let rk = asm.k(Value::Obj(read));
    let wk = asm.k(Value::Obj(write));
    asm.op(Opcode::Closure).r(0).u16(rk).b(1).b(1).b(70);
    asm.op(Opcode::Closure).r(1).u16(wk).b(1).b(1).b(70);

    // write(99) through the shared upvalue, then read it back.
    asm.load_i32(2, 99);
    asm.op(Opcode::Call).r(1).r(2).b(1).r(3);
    asm.op(Opcode::CloseUpvalue).r(70);
    asm.op(Opcode::Call).r(0).r(4).b(0).r(5);
    asm.print(5);

    assert_eq!(vm.interpret(asm.finish()), InterpretResult::Ok);
    assert_eq!(out.contents(), "99\n");
}

#[test]
fn sibling_closures_observe_writes_after_closing() {
    let (mut vm, out) = default_vm();
    let read = reader_function(&mut vm);
    let write = writer_function(&mut vm);

    let mut asm = Asm::new();
    asm.load_i32(71, 5);
    let rk = asm.k(Value::Obj(read));
    let wk = asm.k(Value::Obj(write));
    asm.op(Opcode::Closure).r(0).u16(rk).b(1).b(1).b(71);
    asm.op(Opcode::Closure).r(1).u16(wk).b(1).b(1).b(71);
    asm.op(Opcode::CloseUpvalue).r(71);

    // The closed upvalue is shared: a write through one closure is seen
    // by the other.
    asm.load_i32(2, -8);
    asm.op(Opcode::Call).r(1).r(2).b(1).r(3);
    asm.op(Opcode::Call).r(0).r(4).b(0).r(5);
    asm.print(5);

    assert_eq!(vm.interpret(asm.finish()), InterpretResult::Ok);
    assert_eq!(out.contents(), "-8\n");
}

#[test]
fn upvalue_access_outside_a_closure_is_an_error() {
    let (mut vm, _) = default_vm();
    let mut asm = Asm::new();
    asm.op(Opcode::GetUpvalue).r(0).b(0);

    expect_error_kind(&mut vm, asm.finish(), ErrorKind::Runtime);
}

#[test]
fn closures_render_with_their_function_name() {
    let (mut vm, out) = default_vm();
    let read = reader_function(&mut vm);

    let mut asm = Asm::new();
    asm.load_i32(70, 0);
    let k = asm.k(Value::Obj(read));
    asm.op(Opcode::Closure).r(0).u16(k).b(1).b(1).b(70);
    asm.print(0);

    assert_eq!(vm.interpret(asm.finish()), InterpretResult::Ok);
    assert_eq!(out.contents(), "<fn read>\n");
}

//! Control flow: jumps, loops, calls and iterators.

mod common;

use common::*;
use orus_vm::prelude::*;

#[test]
fn forward_jump_skips_instructions() {
    let (mut vm, out) = default_vm();
    let mut asm = Asm::new();
    asm.load_i32(0, 1);
    asm.op(Opcode::Jump);
    let skip = asm.placeholder();
    asm.print(0); // skipped
    let target = asm.pos();
    asm.patch_forward(skip, target);
    asm.load_i32(1, 2);
    asm.print(1);

    assert_eq!(vm.interpret(asm.finish()), InterpretResult::Ok);
    assert_eq!(out.lines(), ["2"]);
}

#[test]
fn short_jumps_take_a_one_byte_offset() {
    let (mut vm, out) = default_vm();
    let mut asm = Asm::new();
    asm.load_i32(0, 7);
    // Skip the 2-byte print that follows.
    asm.op(Opcode::JumpShort).b(2);
    asm.print(0);
    asm.load_i32(1, 8);
    asm.print(1);

    assert_eq!(vm.interpret(asm.finish()), InterpretResult::Ok);
    assert_eq!(out.lines(), ["8"]);
}

#[test]
fn out_of_bounds_jump_is_ignored_not_fatal() {
    let (mut vm, out) = default_vm();
    let mut asm = Asm::new();
    asm.load_i32(0, 3);
    asm.op(Opcode::Jump).u16(0x7fff); // far past the end
    asm.print(0);

    assert_eq!(vm.interpret(asm.finish()), InterpretResult::Ok);
    assert_eq!(out.lines(), ["3"], "execution continues past the bad jump");
}

#[test]
fn non_boolean_condition_raises() {
    let (mut vm, _) = default_vm();
    let mut asm = Asm::new();
    asm.load_i32(0, 1);
    asm.op(Opcode::JumpIfFalse).r(0);
    asm.placeholder();

    expect_error_kind(&mut vm, asm.finish(), ErrorKind::Value);
}

#[test]
fn dec_cmp_jmp_counts_down() {
    let (mut vm, out) = default_vm();
    let mut asm = Asm::new();
    asm.load_i32(0, 5); // counter
    asm.load_i32(1, 0); // floor
    asm.load_i32(2, 0); // sum of visits
    asm.load_i32(3, 1);
    let header = asm.pos();
    asm.abc(Opcode::AddI32, 2, 2, 3);
    asm.op(Opcode::DecCmpJmp).r(0).r(1);
    let off = u16::try_from(asm.pos() + 2 - header).unwrap();
    asm.u16(off);
    asm.print(2);

    assert_eq!(vm.interpret(asm.finish()), InterpretResult::Ok);
    assert_eq!(out.contents(), "5\n");
}

fn add_function(vm: &mut Interpreter) -> ObjHandle {
    // fn add(a, b) { return a + b }; parameters land at r64/r65.
    let mut body = Asm::new();
    body.abc(Opcode::AddI32, 66, 64, 65);
    body.op(Opcode::Return).r(66);
    vm.register_function(2, 0, body.finish(), Some("add"))
}

#[test]
fn calls_pass_arguments_and_return_values() {
    let (mut vm, out) = default_vm();
    let add = add_function(&mut vm);

    let mut asm = Asm::new();
    asm.load_const(0, Value::Obj(add));
    asm.load_i32(1, 30);
    asm.load_i32(2, 12);
    asm.op(Opcode::Call).r(0).r(1).b(2).r(3);
    asm.print(3);

    assert_eq!(vm.interpret(asm.finish()), InterpretResult::Ok);
    assert_eq!(out.contents(), "42\n");
}

#[test]
fn caller_frame_registers_survive_the_call() {
    let (mut vm, _) = default_vm();
    let add = add_function(&mut vm);

    let mut asm = Asm::new();
    asm.load_i32(70, 777); // caller frame-bank local
    asm.load_const(0, Value::Obj(add));
    asm.load_i32(1, 1);
    asm.load_i32(2, 2);
    asm.op(Opcode::Call).r(0).r(1).b(2).r(3);

    assert_eq!(vm.interpret(asm.finish()), InterpretResult::Ok);
    assert_eq!(vm.register(3), Some(Value::I32(3)));
    assert_eq!(vm.register(70), Some(Value::I32(777)));
}

#[test]
fn arity_mismatch_is_an_argument_error() {
    let (mut vm, _) = default_vm();
    let add = add_function(&mut vm);

    let mut asm = Asm::new();
    asm.load_const(0, Value::Obj(add));
    asm.load_i32(1, 30);
    asm.op(Opcode::Call).r(0).r(1).b(1).r(3);

    expect_error_kind(&mut vm, asm.finish(), ErrorKind::Argument);
}

#[test]
fn calling_a_non_callable_is_a_type_error() {
    let (mut vm, _) = default_vm();
    let mut asm = Asm::new();
    asm.load_i32(0, 9);
    asm.op(Opcode::Call).r(0).r(1).b(0).r(3);

    expect_error_kind(&mut vm, asm.finish(), ErrorKind::Type);
}

#[test]
fn unbounded_recursion_hits_the_frame_limit() {
    let params = VmParameters {
        max_call_depth: 8,
        ..Default::default()
    };
    let (mut vm, _) = capture_vm(params);

    // fn f(self) { self(self) }
    let mut body = Asm::new();
    body.op(Opcode::Call).r(64).r(64).b(1).r(65);
    body.op(Opcode::ReturnVoid);
    let f = vm.register_function(1, 0, body.finish(), Some("f"));

    let mut asm = Asm::new();
    asm.load_const(0, Value::Obj(f));
    asm.op(Opcode::Call).r(0).r(0).b(1).r(1);

    expect_error_kind(&mut vm, asm.finish(), ErrorKind::Recursion);
}

#[test]
fn tail_calls_reuse_the_frame() {
    let params = VmParameters {
        max_call_depth: 8,
        ..Default::default()
    };
    let (mut vm, out) = capture_vm(params);

    // fn g(n, self) { if n <= 0 { return n } else { g(n - 1, self) } }
    let mut body = Asm::new();
    body.load_i32(66, 0);
    body.abc(Opcode::LeI32, 67, 64, 66);
    body.op(Opcode::JumpIfTrue).r(67);
    let done = body.placeholder();
    body.load_i32(68, 1);
    body.abc(Opcode::SubI32, 70, 64, 68);
    body.op(Opcode::Move).r(71).r(65);
    body.op(Opcode::TailCall).r(65).r(70).b(2);
    let done_target = body.pos();
    body.patch_forward(done, done_target);
    body.op(Opcode::Return).r(64);
    let g = vm.register_function(2, 0, body.finish(), Some("g"));

    // A depth of 100 overflows real frames but not tail calls.
    let mut asm = Asm::new();
    asm.load_const(0, Value::Obj(g));
    asm.load_i32(1, 100);
    asm.op(Opcode::Move).r(2).r(0);
    asm.op(Opcode::Call).r(0).r(1).b(2).r(3);
    asm.print(3);

    assert_eq!(vm.interpret(asm.finish()), InterpretResult::Ok);
    assert_eq!(out.contents(), "0\n");
}

#[test]
fn native_calls_check_arity_and_return_values() {
    let (mut vm, out) = default_vm();
    let len = vm.native_index("len").expect("len native");

    let mut asm = Asm::new();
    let hello = vm.alloc_string_value("hello");
    asm.load_const(0, hello);
    asm.op(Opcode::CallNative).b(len).r(0).b(1).r(1);
    asm.print(1);

    assert_eq!(vm.interpret(asm.finish()), InterpretResult::Ok);
    assert_eq!(out.contents(), "5\n");

    // Wrong arity.
    let mut asm = Asm::new();
    let hello = vm.alloc_string_value("hello");
    asm.load_const(0, hello);
    asm.op(Opcode::CallNative).b(len).r(0).b(2).r(1);
    expect_error_kind(&mut vm, asm.finish(), ErrorKind::Argument);
}

#[test]
fn range_iteration_sums_like_the_loop() {
    let (mut vm, out) = default_vm();

    // for v in 0..5 { sum += v }; print sum
    let mut asm = Asm::new();
    asm.load_i32(0, 0); // sum
    asm.load_i32(1, 0);
    asm.load_i32(2, 5);
    asm.abc(Opcode::MakeRange, 3, 1, 2);
    asm.op(Opcode::GetIter).r(4).r(3);
    let header = asm.pos();
    asm.op(Opcode::IterNext).r(5).r(4);
    let exhausted = asm.placeholder();
    asm.abc(Opcode::AddI32, 0, 0, 5);
    asm.loop_to(header);
    let after = asm.pos();
    asm.patch_forward(exhausted, after);
    asm.print(0);

    assert_eq!(vm.interpret(asm.finish()), InterpretResult::Ok);
    assert_eq!(out.contents(), "10\n");
}

#[test]
fn array_iteration_visits_every_element() {
    let (mut vm, out) = default_vm();

    let mut asm = Asm::new();
    asm.load_i32(0, 0); // sum
    asm.load_i32(1, 2);
    asm.load_i32(2, 4);
    asm.load_i32(3, 6);
    asm.abc(Opcode::MakeArray, 4, 1, 3); // [2, 4, 6]
    asm.op(Opcode::GetIter).r(5).r(4);
    let header = asm.pos();
    asm.op(Opcode::IterNext).r(6).r(5);
    let exhausted = asm.placeholder();
    asm.abc(Opcode::AddI32, 0, 0, 6);
    asm.loop_to(header);
    let after = asm.pos();
    asm.patch_forward(exhausted, after);
    asm.print(0);

    assert_eq!(vm.interpret(asm.finish()), InterpretResult::Ok);
    assert_eq!(out.contents(), "12\n");
}

#[test]
fn array_index_errors_carry_the_index_kind() {
    let (mut vm, _) = default_vm();

    let mut asm = Asm::new();
    asm.load_i32(0, 1);
    asm.abc(Opcode::MakeArray, 1, 0, 1); // [1]
    asm.load_i32(2, 5);
    asm.abc(Opcode::ArrayGet, 3, 1, 2);

    expect_error_kind(&mut vm, asm.finish(), ErrorKind::Index);
}

#[test]
fn spill_transfer_round_trip() {
    let (mut vm, out) = default_vm();

    let mut asm = Asm::new();
    asm.load_i32(0, 31);
    asm.op(Opcode::SpillStore);
    asm.chunk.write_u24(400, 1, 1);
    asm.r(0);
    asm.load_i32(0, 0); // clobber the register
    asm.op(Opcode::SpillLoad).r(1);
    asm.chunk.write_u24(400, 1, 1);
    asm.print(1);

    assert_eq!(vm.interpret(asm.finish()), InterpretResult::Ok);
    assert_eq!(out.contents(), "31\n");
}

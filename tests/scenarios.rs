//! End-to-end programs run through the public interpreter API.

mod common;

use common::*;
use orus_vm::prelude::*;

#[test]
fn addition_prints_the_sum() {
    let (mut vm, out) = default_vm();

    let mut asm = Asm::new();
    asm.load_i32(0, 15);
    asm.load_i32(1, 25);
    asm.abc(Opcode::AddI32, 2, 0, 1);
    asm.print(2);

    assert_eq!(vm.interpret(asm.finish()), InterpretResult::Ok);
    assert_eq!(out.contents(), "40\n");
}

#[test]
fn nested_arithmetic_expression() {
    let (mut vm, out) = default_vm();

    // (10 + 20) * (30 - 5)
    let mut asm = Asm::new();
    asm.load_i32(0, 10);
    asm.load_i32(1, 20);
    asm.load_i32(2, 30);
    asm.load_i32(3, 5);
    asm.abc(Opcode::AddI32, 4, 0, 1);
    asm.abc(Opcode::SubI32, 5, 2, 3);
    asm.abc(Opcode::MulI32, 6, 4, 5);
    asm.print(6);

    assert_eq!(vm.interpret(asm.finish()), InterpretResult::Ok);
    assert_eq!(out.contents(), "750\n");
}

#[test]
fn while_loop_accumulates() {
    let (mut vm, out) = default_vm();

    // sum = 0; i = 0; while i < 5 { sum += i; i += 1 }; print sum
    let mut asm = Asm::new();
    asm.load_i32(0, 0); // sum
    asm.load_i32(1, 0); // i
    asm.load_i32(2, 5); // limit
    asm.load_i32(3, 1); // step

    counted_loop(&mut asm, 1, 2, 4, |asm| {
        asm.abc(Opcode::AddI32, 0, 0, 1);
        asm.abc(Opcode::AddI32, 1, 1, 3);
    });

    asm.print(0);

    assert_eq!(vm.interpret(asm.finish()), InterpretResult::Ok);
    assert_eq!(out.contents(), "10\n");
}

#[test]
fn i32_overflow_is_a_value_error() {
    let (mut vm, _) = default_vm();

    let mut asm = Asm::new();
    asm.load_i32(0, i32::MAX);
    asm.load_i32(1, 1);
    asm.abc(Opcode::AddI32, 2, 0, 1);

    expect_error_kind(&mut vm, asm.finish(), ErrorKind::Value);
}

#[test]
fn overflow_leaves_the_destination_unchanged() {
    let (mut vm, _) = default_vm();

    let mut asm = Asm::new();
    asm.load_i32(2, 99); // destination pre-set
    asm.load_i32(0, i32::MAX);
    asm.load_i32(1, 1);
    asm.abc(Opcode::AddI32, 2, 0, 1);

    assert_eq!(vm.interpret(asm.finish()), InterpretResult::RuntimeError);
    assert_eq!(vm.register(2), Some(Value::I32(99)));
}

#[test]
fn integer_division_by_zero() {
    let (mut vm, _) = default_vm();

    let mut asm = Asm::new();
    asm.load_i32(0, 7);
    asm.load_i32(1, 0);
    asm.abc(Opcode::DivI32, 2, 0, 1);

    let result = vm.interpret(asm.finish());
    assert_eq!(result, InterpretResult::RuntimeError);
    match vm.take_failure() {
        Some(VmError::Runtime(err)) => {
            assert_eq!(err.kind, ErrorKind::Value);
            assert!(err.message.contains("Division by zero"), "{}", err.message);
            assert!(err.location.is_some(), "errors carry a source location");
        }
        other => panic!("expected a runtime error, got {other:?}"),
    }
}

#[test]
fn float_division_by_zero() {
    let (mut vm, _) = default_vm();

    let mut asm = Asm::new();
    asm.load_f64(0, 1.0);
    asm.load_f64(1, 0.0);
    asm.abc(Opcode::DivF64, 2, 0, 1);

    expect_error_kind(&mut vm, asm.finish(), ErrorKind::Value);
}

#[test]
fn signed_min_divided_by_minus_one_overflows() {
    let (mut vm, _) = default_vm();

    let mut asm = Asm::new();
    asm.load_i32(0, i32::MIN);
    asm.load_i32(1, -1);
    asm.abc(Opcode::DivI32, 2, 0, 1);

    expect_error_kind(&mut vm, asm.finish(), ErrorKind::Value);
}

#[test]
fn signed_min_modulo_minus_one_yields_zero() {
    let (mut vm, out) = default_vm();

    let mut asm = Asm::new();
    asm.load_i32(0, i32::MIN);
    asm.load_i32(1, -1);
    asm.abc(Opcode::ModI32, 2, 0, 1);
    asm.print(2);

    assert_eq!(vm.interpret(asm.finish()), InterpretResult::Ok);
    assert_eq!(out.contents(), "0\n");
}

fn unbounded_count_chunk(iterations: i32) -> Chunk<Value> {
    let mut asm = Asm::new();
    asm.load_i32(0, 0);
    asm.load_i32(1, iterations);
    let header = asm.pos();
    asm.op(Opcode::IncCmpJmp).r(0).r(1);
    let off = u16::try_from(asm.pos() + 2 - header).unwrap();
    asm.u16(off);
    asm.print(0);
    asm.finish()
}

#[test]
fn loop_guard_raises_at_the_configured_ceiling() {
    let params = VmParameters {
        loop_guard_stride: 10,
        loop_warn_at: 50,
        max_iterations: 100,
        jit_stage: JitRolloutStage::Off,
        ..Default::default()
    };
    let (mut vm, _) = capture_vm(params);

    let result = vm.interpret(unbounded_count_chunk(1_000));
    assert_eq!(result, InterpretResult::RuntimeError);
    match vm.take_failure() {
        Some(VmError::Runtime(err)) => {
            assert_eq!(err.kind, ErrorKind::Runtime);
            assert!(err.message.contains("100"), "{}", err.message);
        }
        other => panic!("expected the iteration-limit error, got {other:?}"),
    }
}

#[test]
fn disabled_loop_guard_lets_long_loops_finish() {
    let params = VmParameters {
        loop_guard_stride: 10,
        loop_warn_at: 50,
        max_iterations: 0,
        jit_stage: JitRolloutStage::Off,
        ..Default::default()
    };
    let (mut vm, out) = capture_vm(params);

    assert_eq!(vm.interpret(unbounded_count_chunk(1_000)), InterpretResult::Ok);
    assert_eq!(out.contents(), "1000\n");
}

#[test]
#[ignore = "ten-million-iteration guard run with default thresholds"]
fn loop_guard_default_thresholds_end_to_end() {
    let params = VmParameters {
        jit_stage: JitRolloutStage::Off,
        ..Default::default()
    };
    let (mut vm, _) = capture_vm(params);

    let result = vm.interpret(unbounded_count_chunk(10_000_001));
    assert_eq!(result, InterpretResult::RuntimeError);
    match vm.take_failure() {
        Some(VmError::Runtime(err)) => assert!(err.message.contains("10000000"), "{}", err.message),
        other => panic!("expected the iteration-limit error, got {other:?}"),
    }
}

#[test]
fn halt_stops_execution_and_is_not_catchable() {
    let (mut vm, out) = default_vm();

    let mut asm = Asm::new();
    // try { halt } except -> r5; the handler must never run.
    asm.op(Opcode::SetupExcept).r(5);
    let handler = asm.placeholder();
    asm.halt();
    let handler_target = asm.pos();
    asm.patch_forward(handler, handler_target);
    asm.load_i32(6, 1);
    asm.print(6);

    let state = vm.run_script(asm.finish()).expect("halt is a clean stop");
    assert_eq!(state, ProgramState::Halted);
    assert_eq!(out.contents(), "", "no instruction after halt may run");
}

//! Arithmetic, comparison and conversion behavior.

mod common;

use common::*;
use orus_vm::prelude::*;
use quickcheck_macros::quickcheck;

fn binary_i32(op: Opcode, a: i32, b: i32) -> Result<Value, ErrorKind> {
    let (mut vm, _) = default_vm();
    let mut asm = Asm::new();
    asm.load_i32(0, a);
    asm.load_i32(1, b);
    asm.abc(op, 2, 0, 1);

    match vm.interpret(asm.finish()) {
        InterpretResult::Ok => Ok(vm.register(2).unwrap()),
        _ => match vm.take_failure() {
            Some(VmError::Runtime(err)) => Err(err.kind),
            other => panic!("unexpected failure {other:?}"),
        },
    }
}

#[test]
fn typed_i32_arithmetic() {
    assert_eq!(binary_i32(Opcode::AddI32, 2, 3), Ok(Value::I32(5)));
    assert_eq!(binary_i32(Opcode::SubI32, 2, 3), Ok(Value::I32(-1)));
    assert_eq!(binary_i32(Opcode::MulI32, -4, 3), Ok(Value::I32(-12)));
    assert_eq!(binary_i32(Opcode::DivI32, 7, 2), Ok(Value::I32(3)));
    assert_eq!(binary_i32(Opcode::ModI32, 7, 2), Ok(Value::I32(1)));
}

#[test]
fn typed_i32_faults() {
    assert_eq!(binary_i32(Opcode::AddI32, i32::MAX, 1), Err(ErrorKind::Value));
    assert_eq!(binary_i32(Opcode::SubI32, i32::MIN, 1), Err(ErrorKind::Value));
    assert_eq!(binary_i32(Opcode::MulI32, i32::MAX, 2), Err(ErrorKind::Value));
    assert_eq!(binary_i32(Opcode::DivI32, 1, 0), Err(ErrorKind::Value));
    assert_eq!(binary_i32(Opcode::ModI32, 1, 0), Err(ErrorKind::Value));
}

#[quickcheck]
fn qc_add_i32_matches_checked_semantics(a: i32, b: i32) -> bool {
    match (binary_i32(Opcode::AddI32, a, b), a.checked_add(b)) {
        (Ok(Value::I32(got)), Some(want)) => got == want,
        (Err(ErrorKind::Value), None) => true,
        _ => false,
    }
}

#[quickcheck]
fn qc_mod_i64_never_raises_on_min(a: i64) -> bool {
    let (mut vm, _) = default_vm();
    let mut asm = Asm::new();
    asm.load_i64(0, a);
    asm.load_i64(1, -1);
    asm.abc(Opcode::ModI64, 2, 0, 1);

    vm.interpret(asm.finish()) == InterpretResult::Ok && vm.register(2) == Some(Value::I64(0))
}

#[test]
fn randomized_i64_loads_round_trip() {
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    let mut rng = StdRng::seed_from_u64(2322u64);
    let (mut vm, _) = default_vm();

    let values: Vec<i64> = (0..32).map(|_| rng.gen()).collect();
    let mut asm = Asm::new();
    for (i, &v) in values.iter().enumerate() {
        asm.load_i64(64 + i as u8, v);
    }

    assert_eq!(vm.interpret(asm.finish()), InterpretResult::Ok);
    for (i, &v) in values.iter().enumerate() {
        assert_eq!(vm.register(64 + i as u32), Some(Value::I64(v)));
    }
}

#[test]
fn i64_and_u64_round_trips_are_bit_exact() {
    let (mut vm, _) = default_vm();
    let mut asm = Asm::new();
    asm.load_i64(0, i64::MIN);
    let k = asm.k(Value::U64(u64::MAX));
    asm.op(Opcode::LoadU64Const).r(1).u16(k);
    asm.load_f64(2, f64::MIN_POSITIVE);

    assert_eq!(vm.interpret(asm.finish()), InterpretResult::Ok);
    assert_eq!(vm.register(0), Some(Value::I64(i64::MIN)));
    assert_eq!(vm.register(1), Some(Value::U64(u64::MAX)));
    let f = vm.register(2).and_then(|v| v.as_f64()).unwrap();
    assert_eq!(f.to_bits(), f64::MIN_POSITIVE.to_bits());
}

#[test]
fn generic_arithmetic_rejects_mixed_sign() {
    let (mut vm, _) = default_vm();
    let mut asm = Asm::new();
    asm.load_i32(0, 1);
    asm.load_u32(1, 2);
    asm.abc(Opcode::AddNumeric, 2, 0, 1);

    assert_eq!(vm.interpret(asm.finish()), InterpretResult::RuntimeError);
    match vm.take_failure() {
        Some(VmError::Runtime(err)) => {
            assert_eq!(err.kind, ErrorKind::Value);
            assert!(err.message.contains("signed/unsigned"), "{}", err.message);
        }
        other => panic!("unexpected failure {other:?}"),
    }
}

#[test]
fn generic_arithmetic_rejects_int_float_mixes() {
    let (mut vm, _) = default_vm();
    let mut asm = Asm::new();
    asm.load_i32(0, 1);
    asm.load_f64(1, 2.0);
    asm.abc(Opcode::MulNumeric, 2, 0, 1);

    expect_error_kind(&mut vm, asm.finish(), ErrorKind::Value);
}

#[test]
fn generic_i32_overflow_promotes_to_i64() {
    let (mut vm, _) = default_vm();
    let mut asm = Asm::new();
    asm.load_i32(0, i32::MAX);
    asm.load_i32(1, 1);
    asm.abc(Opcode::AddNumeric, 2, 0, 1);

    assert_eq!(vm.interpret(asm.finish()), InterpretResult::Ok);
    assert_eq!(vm.register(2), Some(Value::I64(i32::MAX as i64 + 1)));
}

#[test]
fn generic_u32_overflow_promotes_to_u64() {
    let (mut vm, _) = default_vm();
    let mut asm = Asm::new();
    asm.load_u32(0, u32::MAX);
    asm.load_u32(1, u32::MAX);
    asm.abc(Opcode::MulNumeric, 2, 0, 1);

    assert_eq!(vm.interpret(asm.finish()), InterpretResult::Ok);
    assert_eq!(vm.register(2), Some(Value::U64(u32::MAX as u64 * u32::MAX as u64)));
}

#[test]
fn float_non_finite_results_raise() {
    let (mut vm, _) = default_vm();
    let mut asm = Asm::new();
    asm.load_f64(0, f64::MAX);
    asm.load_f64(1, f64::MAX);
    asm.abc(Opcode::MulF64, 2, 0, 1);

    expect_error_kind(&mut vm, asm.finish(), ErrorKind::Value);
}

#[test]
fn typed_comparison_with_wrong_kind_is_a_type_error() {
    let (mut vm, _) = default_vm();
    let mut asm = Asm::new();
    asm.load_i32(0, 1);
    asm.load_i64(1, 2);
    asm.abc(Opcode::LtI32, 2, 0, 1);

    assert_eq!(vm.interpret(asm.finish()), InterpretResult::RuntimeError);
    match vm.take_failure() {
        Some(VmError::Runtime(err)) => {
            assert_eq!(err.kind, ErrorKind::Type);
            assert!(err.message.contains("Operands must be i32"), "{}", err.message);
        }
        other => panic!("unexpected failure {other:?}"),
    }
}

#[test]
fn comparisons_and_boolean_not() {
    let (mut vm, out) = default_vm();
    let mut asm = Asm::new();
    asm.load_i32(0, 3);
    asm.load_i32(1, 5);
    asm.abc(Opcode::LtI32, 2, 0, 1);
    asm.print(2);
    asm.op(Opcode::Not).r(3).r(2);
    asm.print(3);
    asm.abc(Opcode::GeI32, 4, 0, 1);
    asm.print(4);

    assert_eq!(vm.interpret(asm.finish()), InterpretResult::Ok);
    assert_eq!(out.lines(), ["true", "false", "false"]);
}

#[test]
fn equality_is_structural_and_never_raises_across_kinds() {
    let (mut vm, out) = default_vm();
    let mut asm = Asm::new();
    asm.load_i32(0, 1);
    asm.load_i64(1, 1);
    asm.abc(Opcode::Eq, 2, 0, 1); // distinct kinds are unequal
    asm.print(2);
    asm.load_i32(3, 1);
    asm.abc(Opcode::Eq, 4, 0, 3);
    asm.print(4);
    asm.abc(Opcode::Ne, 5, 0, 3);
    asm.print(5);

    assert_eq!(vm.interpret(asm.finish()), InterpretResult::Ok);
    assert_eq!(out.lines(), ["false", "true", "false"]);
}

#[test]
fn conversions_are_checked() {
    let (mut vm, _) = default_vm();

    // i64 -> i32 within range
    let mut asm = Asm::new();
    asm.load_i64(0, 1234);
    asm.op(Opcode::Convert).r(1).r(0).b(ValueKind::I32 as u8);
    assert_eq!(vm.interpret(asm.finish()), InterpretResult::Ok);
    assert_eq!(vm.register(1), Some(Value::I32(1234)));

    // i64 -> i32 out of range
    let mut asm = Asm::new();
    asm.load_i64(0, i64::MAX);
    asm.op(Opcode::Convert).r(1).r(0).b(ValueKind::I32 as u8);
    expect_error_kind(&mut vm, asm.finish(), ErrorKind::Value);

    // negative -> unsigned
    let mut asm = Asm::new();
    asm.load_i32(0, -1);
    asm.op(Opcode::Convert).r(1).r(0).b(ValueKind::U32 as u8);
    expect_error_kind(&mut vm, asm.finish(), ErrorKind::Value);

    // int -> f64 always succeeds
    let mut asm = Asm::new();
    asm.load_i32(0, -3);
    asm.op(Opcode::Convert).r(1).r(0).b(ValueKind::F64 as u8);
    assert_eq!(vm.interpret(asm.finish()), InterpretResult::Ok);
    assert_eq!(vm.register(1), Some(Value::F64(-3.0)));
}

#[test]
fn negate_checks_the_overflow_edge() {
    let (mut vm, _) = default_vm();
    let mut asm = Asm::new();
    asm.load_i32(0, i32::MIN);
    asm.op(Opcode::Negate).r(1).r(0);
    expect_error_kind(&mut vm, asm.finish(), ErrorKind::Value);

    let mut asm = Asm::new();
    asm.load_i32(0, 5);
    asm.op(Opcode::Negate).r(1).r(0);
    assert_eq!(vm.interpret(asm.finish()), InterpretResult::Ok);
    assert_eq!(vm.register(1), Some(Value::I32(-5)));
}

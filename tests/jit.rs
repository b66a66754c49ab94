//! Tiered execution: translation gating, entry cache and compiled-loop
//! behavior.

mod common;

use common::*;
use orus_vm::jit::{compile_loop, TranslationFailure};
use orus_vm::prelude::*;

#[test]
fn unsupported_opcodes_fail_translation() {
    let (chunk, header) = {
        let mut asm = Asm::new();
        asm.load_i32(0, 0);
        asm.load_i32(1, 100);
        let header = asm.pos();
        asm.print(0); // not translatable
        asm.op(Opcode::IncCmpJmp).r(0).r(1);
        let off = u16::try_from(asm.pos() + 2 - header).unwrap();
        asm.u16(off);
        (asm.finish(), header)
    };

    let failure = compile_loop(&chunk, header, JitRolloutStage::Full).unwrap_err();
    assert!(matches!(failure, TranslationFailure::UnsupportedOpcode(Opcode::Print)));
}

#[test]
fn nested_loops_are_control_flow_complexity() {
    let mut asm = Asm::new();
    asm.load_i32(0, 0);
    asm.load_i32(1, 10);
    let outer = asm.pos();
    asm.abc(Opcode::AddI32, 0, 0, 1);
    let inner = asm.pos();
    asm.abc(Opcode::AddI32, 0, 0, 1);
    asm.loop_to(inner);
    asm.loop_to(outer);
    let chunk = asm.finish();

    // Scanning from `outer` first meets the inner loop's back-edge.
    let failure = compile_loop(&chunk, outer, JitRolloutStage::Full).unwrap_err();
    assert!(matches!(failure, TranslationFailure::ControlFlowComplexity));
}

#[test]
fn rollout_stage_gates_value_kinds() {
    let mut asm = Asm::new();
    asm.load_i64(0, 0);
    asm.load_i64(1, 100);
    asm.load_i64(2, 1);
    let header = asm.pos();
    asm.abc(Opcode::AddI64, 0, 0, 2);
    asm.op(Opcode::IncCmpJmp).r(0).r(1);
    let off = u16::try_from(asm.pos() + 2 - header).unwrap();
    asm.u16(off);
    let chunk = asm.finish();

    let failure = compile_loop(&chunk, header, JitRolloutStage::I32Only).unwrap_err();
    assert!(matches!(failure, TranslationFailure::UnsupportedValueKind));
}

#[cfg(all(unix, any(target_arch = "x86_64", target_arch = "aarch64", target_arch = "riscv64")))]
mod native {
    use super::*;

    /// `sum = 0; i = 0; while i < limit { sum += i; i += 1 }` in
    /// registers 0..=4, returning (chunk, header offset).
    fn sum_loop(limit: i32) -> (Chunk<Value>, usize) {
        let mut asm = Asm::new();
        asm.load_i32(0, 0);
        asm.load_i32(1, 0);
        asm.load_i32(2, limit);
        asm.load_i32(3, 1);
        let header = asm.pos();
        counted_loop_at(&mut asm, header);
        asm.print(0);
        (asm.finish(), header)
    }

    fn counted_loop_at(asm: &mut Asm, header: usize) {
        asm.abc(Opcode::LtI32, 4, 1, 2);
        asm.op(Opcode::JumpIfFalse).r(4);
        let exit = asm.placeholder();
        asm.abc(Opcode::AddI32, 0, 0, 1);
        asm.abc(Opcode::AddI32, 1, 1, 3);
        asm.loop_to(header);
        let after = asm.pos();
        asm.patch_forward(exit, after);
    }

    #[test]
    fn hot_loops_compile_and_produce_interpreter_results() {
        let params = VmParameters {
            hot_loop_threshold: 64,
            ..Default::default()
        };
        let (mut vm, out) = capture_vm(params);

        let (chunk, _) = sum_loop(10_000);
        assert_eq!(vm.interpret(chunk), InterpretResult::Ok);
        assert_eq!(out.contents(), format!("{}\n", (0i64..10_000).sum::<i64>()));
        assert!(
            vm.jit().entry_count() >= 1,
            "the hot loop must be in the entry cache"
        );
    }

    #[test]
    fn fused_loops_compile_too() {
        let params = VmParameters {
            hot_loop_threshold: 64,
            ..Default::default()
        };
        let (mut vm, out) = capture_vm(params);

        let mut asm = Asm::new();
        asm.load_i32(0, 0);
        asm.load_i32(1, 50_000);
        let header = asm.pos();
        asm.op(Opcode::IncCmpJmp).r(0).r(1);
        let off = u16::try_from(asm.pos() + 2 - header).unwrap();
        asm.u16(off);
        asm.print(0);

        assert_eq!(vm.interpret(asm.finish()), InterpretResult::Ok);
        assert_eq!(out.contents(), "50000\n");
        assert!(vm.jit().entry_count() >= 1);
    }

    #[test]
    fn arithmetic_faults_deoptimize_and_raise_through_the_interpreter() {
        let params = VmParameters {
            hot_loop_threshold: 16,
            ..Default::default()
        };
        let (mut vm, _) = capture_vm(params);

        // sum starts near the edge and overflows long after the loop went
        // native.
        let mut asm = Asm::new();
        asm.load_i32(0, i32::MAX - 100_000);
        asm.load_i32(1, 0);
        asm.load_i32(2, 10_000);
        asm.load_i32(3, 1);
        let header = asm.pos();
        asm.abc(Opcode::LtI32, 4, 1, 2);
        asm.op(Opcode::JumpIfFalse).r(4);
        let exit = asm.placeholder();
        asm.load_i32(5, 50);
        asm.abc(Opcode::AddI32, 0, 0, 5);
        asm.abc(Opcode::AddI32, 1, 1, 3);
        asm.loop_to(header);
        let after = asm.pos();
        asm.patch_forward(exit, after);

        assert_eq!(vm.interpret(asm.finish()), InterpretResult::RuntimeError);
        match vm.take_failure() {
            Some(VmError::Runtime(err)) => assert_eq!(err.kind, ErrorKind::Value),
            other => panic!("expected the overflow error, got {other:?}"),
        }
        assert_eq!(vm.jit().entry_count(), 0, "the faulting entry was invalidated");
    }

    #[test]
    fn the_loop_guard_still_fires_inside_compiled_loops() {
        let params = VmParameters {
            hot_loop_threshold: 32,
            loop_guard_stride: 64,
            loop_warn_at: 100,
            max_iterations: 500,
            ..Default::default()
        };
        let (mut vm, _) = capture_vm(params);

        let (chunk, _) = sum_loop(1_000_000);
        assert_eq!(vm.interpret(chunk), InterpretResult::RuntimeError);
        match vm.take_failure() {
            Some(VmError::Runtime(err)) => {
                assert_eq!(err.kind, ErrorKind::Runtime);
                assert!(err.message.contains("iteration"), "{}", err.message);
            }
            other => panic!("expected the iteration-limit error, got {other:?}"),
        }
    }

    #[test]
    fn type_changing_stores_invalidate_entries_mid_run() {
        let params = VmParameters {
            hot_loop_threshold: 64,
            ..Default::default()
        };
        let (mut vm, out) = capture_vm(params);

        // Three outer passes over a hot inner loop; between passes the
        // counter register is retagged to f64 and back, bumping its
        // branch-cache generation so the compiled entry cannot be
        // re-entered.
        let mut asm = Asm::new();
        asm.load_i32(0, 0); // total
        asm.load_i32(2, 5_000); // inner limit
        asm.load_i32(3, 1);
        asm.load_i32(6, 0); // outer counter
        asm.load_i32(7, 3); // outer limit
        let outer = asm.pos();
        asm.load_i32(1, 0); // reset inner counter
        let inner = asm.pos();
        asm.abc(Opcode::LtI32, 4, 1, 2);
        asm.op(Opcode::JumpIfFalse).r(4);
        let exit = asm.placeholder();
        asm.abc(Opcode::AddI32, 0, 0, 3);
        asm.abc(Opcode::AddI32, 1, 1, 3);
        asm.loop_to(inner);
        let after = asm.pos();
        asm.patch_forward(exit, after);
        asm.load_f64(1, 0.5); // retag the counter slot
        asm.op(Opcode::IncCmpJmp).r(6).r(7);
        let off = u16::try_from(asm.pos() + 2 - outer).unwrap();
        asm.u16(off);
        asm.print(0);

        assert_eq!(vm.interpret(asm.finish()), InterpretResult::Ok);
        assert_eq!(out.contents(), "15000\n");
        assert_eq!(
            vm.jit().entry_count(),
            0,
            "the retag invalidated the inner-loop entry"
        );
    }
}

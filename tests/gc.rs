//! Collector behavior observed through running programs.

mod common;

use common::*;
use orus_vm::prelude::*;

/// A loop that concatenates two long strings per iteration, producing
/// garbage ropes nothing keeps alive.
fn garbage_churn_chunk(vm: &mut Interpreter, iterations: i32) -> Chunk<Value> {
    let left = vm.alloc_string_value(&"a".repeat(80));
    let right = vm.alloc_string_value(&"b".repeat(80));

    let mut asm = Asm::new();
    asm.load_const(0, left);
    asm.load_const(1, right);
    asm.load_i32(2, 0);
    asm.load_i32(3, iterations);
    asm.load_i32(4, 1);

    counted_loop(&mut asm, 2, 3, 5, |asm| {
        asm.abc(Opcode::Concat, 6, 0, 1);
        asm.abc(Opcode::AddI32, 2, 2, 4);
    });

    asm.finish()
}

#[test]
fn garbage_is_collected_under_a_small_threshold() {
    let params = VmParameters {
        gc_threshold: 8 * 1024,
        ..Default::default()
    };
    let (mut vm, _) = capture_vm(params);

    let chunk = garbage_churn_chunk(&mut vm, 2_000);
    assert_eq!(vm.interpret(chunk), InterpretResult::Ok);

    // 2000 dead ropes were produced; the heap must have stayed bounded.
    assert!(
        vm.heap().live_count() < 100,
        "heap retained {} objects",
        vm.heap().live_count()
    );
}

#[test]
fn rooted_values_survive_collection_cycles() {
    let params = VmParameters {
        gc_threshold: 4 * 1024,
        ..Default::default()
    };
    let (mut vm, out) = capture_vm(params);

    let mut asm = Asm::new();
    let keep = vm.alloc_string_value("keep-me");
    let left = vm.alloc_string_value(&"x".repeat(80));
    let right = vm.alloc_string_value(&"y".repeat(80));
    asm.load_const(7, keep);
    asm.load_const(0, left);
    asm.load_const(1, right);
    asm.load_i32(2, 0);
    asm.load_i32(3, 500);
    asm.load_i32(4, 1);
    counted_loop(&mut asm, 2, 3, 5, |asm| {
        asm.abc(Opcode::Concat, 6, 0, 1);
        asm.abc(Opcode::AddI32, 2, 2, 4);
    });
    asm.print(7);

    assert_eq!(vm.interpret(asm.finish()), InterpretResult::Ok);
    assert_eq!(out.contents(), "keep-me\n");
}

#[test]
fn gc_pause_and_resume_opcodes_bracket_collection() {
    let params = VmParameters {
        gc_threshold: 1024,
        ..Default::default()
    };
    let (mut vm, _) = capture_vm(params);

    let left = vm.alloc_string_value(&"p".repeat(80));
    let right = vm.alloc_string_value(&"q".repeat(80));

    let mut asm = Asm::new();
    asm.op(Opcode::GcPause);
    asm.load_const(0, left);
    asm.load_const(1, right);
    asm.load_i32(2, 0);
    asm.load_i32(3, 200);
    asm.load_i32(4, 1);
    counted_loop(&mut asm, 2, 3, 5, |asm| {
        asm.abc(Opcode::Concat, 6, 0, 1);
        asm.abc(Opcode::AddI32, 2, 2, 4);
    });
    asm.op(Opcode::GcResume);

    assert_eq!(vm.interpret(asm.finish()), InterpretResult::Ok);
    // While paused, every rope survived.
    assert!(
        vm.heap().live_count() >= 200,
        "paused GC must not collect, found {}",
        vm.heap().live_count()
    );

    vm.collect_garbage();
    assert!(
        vm.heap().live_count() < 100,
        "after resume + collect the garbage is gone, found {}",
        vm.heap().live_count()
    );
}

#[test]
fn explicit_collection_keeps_reachable_graphs() {
    let (mut vm, out) = default_vm();

    let mut asm = Asm::new();
    asm.load_i32(0, 1);
    asm.load_i32(1, 2);
    asm.abc(Opcode::MakeArray, 2, 0, 2); // [1, 2]
    asm.abc(Opcode::MakeArray, 3, 2, 1); // [[1, 2]]

    assert_eq!(vm.interpret(asm.finish()), InterpretResult::Ok);

    vm.collect_garbage();
    vm.collect_garbage();

    // The nested structure is still addressable afterwards.
    let rendered = {
        let outer = vm.register(3).unwrap();
        vm.render(outer)
    };
    assert_eq!(rendered, "[[1, 2]]");
    let _ = out;
}

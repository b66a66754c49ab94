#![allow(dead_code)]

use orus_vm::prelude::*;

use std::io::{self, Write};
use std::sync::{Arc, Mutex};

/// Output sink shared between the VM and the test.
#[derive(Clone, Default)]
pub struct CapturedOutput(Arc<Mutex<Vec<u8>>>);

impl CapturedOutput {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contents(&self) -> String {
        String::from_utf8(self.0.lock().unwrap().clone()).expect("printed output is UTF-8")
    }

    pub fn lines(&self) -> Vec<String> {
        self.contents().lines().map(str::to_owned).collect()
    }
}

impl Write for CapturedOutput {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// A VM wired to a captured output sink.
pub fn capture_vm(params: VmParameters) -> (Interpreter, CapturedOutput) {
    let sink = CapturedOutput::new();
    let vm = Interpreter::with_output(params, Box::new(sink.clone()));
    (vm, sink)
}

pub fn default_vm() -> (Interpreter, CapturedOutput) {
    capture_vm(VmParameters::default())
}

/// Small assembler over [`Chunk`] so tests read like listings.
pub struct Asm {
    pub chunk: Chunk<Value>,
    line: u32,
}

impl Asm {
    pub fn new() -> Self {
        Self {
            chunk: Chunk::new(),
            line: 1,
        }
    }

    /// Advance the recorded source line; purely cosmetic for locations.
    pub fn line(&mut self) -> &mut Self {
        self.line += 1;
        self
    }

    pub fn pos(&self) -> usize {
        self.chunk.len()
    }

    pub fn op(&mut self, op: Opcode) -> &mut Self {
        self.chunk.write_op(op, self.line, 1);
        self
    }

    pub fn r(&mut self, reg: u8) -> &mut Self {
        self.chunk.write_u8(reg, self.line, 1);
        self
    }

    pub fn b(&mut self, byte: u8) -> &mut Self {
        self.chunk.write_u8(byte, self.line, 1);
        self
    }

    pub fn k(&mut self, value: Value) -> u16 {
        self.chunk.add_constant(value).expect("constant pool")
    }

    pub fn u16(&mut self, v: u16) -> &mut Self {
        self.chunk.write_u16(v, self.line, 1);
        self
    }

    /// Emit a 16-bit placeholder, returning its offset for patching.
    pub fn placeholder(&mut self) -> usize {
        let at = self.pos();
        self.chunk.write_u16(0xffff, self.line, 1);
        at
    }

    /// Patch a forward jump operand to land on `target`.
    pub fn patch_forward(&mut self, operand_at: usize, target: usize) {
        let base = operand_at + 2;
        let off = u16::try_from(target - base).expect("forward offset fits");
        self.chunk.patch_u16(operand_at, off).expect("patch in range");
    }

    /// Emit a `Loop` back to `header`.
    pub fn loop_to(&mut self, header: usize) -> &mut Self {
        let off = u16::try_from(self.pos() + 3 - header).expect("backward offset fits");
        self.op(Opcode::Loop);
        self.u16(off)
    }

    /* frequent idioms */

    pub fn load_i32(&mut self, dst: u8, v: i32) -> &mut Self {
        let k = self.k(Value::I32(v));
        self.op(Opcode::LoadI32Const).r(dst).u16(k)
    }

    pub fn load_i64(&mut self, dst: u8, v: i64) -> &mut Self {
        let k = self.k(Value::I64(v));
        self.op(Opcode::LoadI64Const).r(dst).u16(k)
    }

    pub fn load_u32(&mut self, dst: u8, v: u32) -> &mut Self {
        let k = self.k(Value::U32(v));
        self.op(Opcode::LoadU32Const).r(dst).u16(k)
    }

    pub fn load_f64(&mut self, dst: u8, v: f64) -> &mut Self {
        let k = self.k(Value::F64(v));
        self.op(Opcode::LoadF64Const).r(dst).u16(k)
    }

    pub fn load_const(&mut self, dst: u8, v: Value) -> &mut Self {
        let k = self.k(v);
        self.op(Opcode::LoadConst).r(dst).u16(k)
    }

    pub fn abc(&mut self, op: Opcode, dst: u8, a: u8, b: u8) -> &mut Self {
        self.op(op).r(dst).r(a).r(b)
    }

    pub fn print(&mut self, src: u8) -> &mut Self {
        self.op(Opcode::Print).r(src)
    }

    pub fn halt(&mut self) -> &mut Self {
        self.op(Opcode::Halt)
    }

    pub fn finish(&mut self) -> Chunk<Value> {
        std::mem::take(&mut self.chunk)
    }
}

/// The `while i < limit { body; i += 1 }` shape used by several suites:
/// counter in `counter`, bound in `limit`, scratch bool in `cond`.
pub fn counted_loop(asm: &mut Asm, counter: u8, limit: u8, cond: u8, body: impl FnOnce(&mut Asm)) {
    let header = asm.pos();
    asm.abc(Opcode::LtI32, cond, counter, limit);
    asm.op(Opcode::JumpIfFalse).r(cond);
    let exit = asm.placeholder();

    body(asm);

    asm.loop_to(header);
    let after = asm.pos();
    asm.patch_forward(exit, after);
}

/// Expect a runtime failure of a specific kind.
pub fn expect_error_kind(vm: &mut Interpreter, chunk: Chunk<Value>, kind: ErrorKind) {
    let result = vm.interpret(chunk);
    assert_eq!(result, InterpretResult::RuntimeError);
    match vm.take_failure() {
        Some(VmError::Runtime(err)) => assert_eq!(err.kind, kind, "unexpected error: {err}"),
        other => panic!("expected a runtime error of kind {kind}, got {other:?}"),
    }
}

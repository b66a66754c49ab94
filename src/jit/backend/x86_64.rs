//! x86-64 (SysV) backend
//!
//! Register conventions: `rdi` holds the `JitState` pointer for the whole
//! function, `r10`/`r11` hold bank base pointers per operation, and
//! `rax`/`rcx`/`rdx` plus `xmm0`-`xmm2` are scratch. Every guard branches
//! to a per-origin deopt stub that restores the bytecode offset.

use std::collections::HashMap;

use crate::jit::exec::ExecutableCode;
use crate::jit::ir::{IrBinOp, IrCmpOp, IrKind, IrLoop, IrOp};
use crate::jit::state_layout as layout;
use crate::jit::{
    CompiledLoop, TranslationFailure, DEOPT_ARITHMETIC, JIT_EXIT_COMPLETED, JIT_EXIT_DEOPT, JIT_EXIT_YIELD,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum FixTarget {
    Label(usize),
    Deopt(usize),
    /// The budget-counting back-edge thunk.
    BackEdge,
}

struct Asm {
    code: Vec<u8>,
    labels: HashMap<usize, usize>,
    fixups: Vec<(usize, FixTarget)>,
}

impl Asm {
    fn new() -> Self {
        Self {
            code: Vec::with_capacity(256),
            labels: HashMap::new(),
            fixups: Vec::new(),
        }
    }

    fn bytes(&mut self, bytes: &[u8]) {
        self.code.extend_from_slice(bytes);
    }

    fn imm32(&mut self, v: i32) {
        self.code.extend_from_slice(&v.to_le_bytes());
    }

    fn imm64(&mut self, v: u64) {
        self.code.extend_from_slice(&v.to_le_bytes());
    }

    fn label(&mut self, offset: usize) {
        self.labels.entry(offset).or_insert(self.code.len());
    }

    /// Emit a rel32 to be patched later.
    fn rel32(&mut self, target: FixTarget) {
        self.fixups.push((self.code.len(), target));
        self.imm32(0);
    }

    /* state and bank addressing */

    fn load_bank_r10(&mut self, field: i32) {
        self.bytes(&[0x4c, 0x8b, 0x97]);
        self.imm32(field);
    }

    fn load_bank_r11(&mut self, field: i32) {
        self.bytes(&[0x4c, 0x8b, 0x9f]);
        self.imm32(field);
    }

    fn bank_field(kind: IrKind) -> i32 {
        match kind {
            IrKind::I32 => layout::I32S,
            IrKind::I64 => layout::I64S,
            IrKind::U32 => layout::U32S,
            IrKind::U64 => layout::U64S,
            IrKind::F64 => layout::F64S,
            IrKind::Bool => layout::BOOLS,
        }
    }

    fn slot_disp(kind: IrKind, slot: u16) -> i32 {
        let width = match kind {
            IrKind::I32 | IrKind::U32 => 4,
            IrKind::I64 | IrKind::U64 | IrKind::F64 => 8,
            IrKind::Bool => 1,
        };
        slot as i32 * width
    }

    fn wide(kind: IrKind) -> bool {
        matches!(kind, IrKind::I64 | IrKind::U64)
    }

    /* loads and stores through r10 */

    fn mov_ax_slot(&mut self, kind: IrKind, slot: u16) {
        let rex = if Self::wide(kind) { 0x49 } else { 0x41 };
        self.bytes(&[rex, 0x8b, 0x82]);
        self.imm32(Self::slot_disp(kind, slot));
    }

    fn mov_cx_slot(&mut self, kind: IrKind, slot: u16) {
        let rex = if Self::wide(kind) { 0x49 } else { 0x41 };
        self.bytes(&[rex, 0x8b, 0x8a]);
        self.imm32(Self::slot_disp(kind, slot));
    }

    fn mov_slot_ax(&mut self, kind: IrKind, slot: u16) {
        let rex = if Self::wide(kind) { 0x49 } else { 0x41 };
        self.bytes(&[rex, 0x89, 0x82]);
        self.imm32(Self::slot_disp(kind, slot));
    }

    fn mov_slot_dx(&mut self, kind: IrKind, slot: u16) {
        let rex = if Self::wide(kind) { 0x49 } else { 0x41 };
        self.bytes(&[rex, 0x89, 0x92]);
        self.imm32(Self::slot_disp(kind, slot));
    }

    fn movsd_xmm0_slot(&mut self, slot: u16) {
        self.bytes(&[0xf2, 0x41, 0x0f, 0x10, 0x82]);
        self.imm32(Self::slot_disp(IrKind::F64, slot));
    }

    fn movsd_xmm1_slot(&mut self, slot: u16) {
        self.bytes(&[0xf2, 0x41, 0x0f, 0x10, 0x8a]);
        self.imm32(Self::slot_disp(IrKind::F64, slot));
    }

    fn movsd_slot_xmm0(&mut self, slot: u16) {
        self.bytes(&[0xf2, 0x41, 0x0f, 0x11, 0x82]);
        self.imm32(Self::slot_disp(IrKind::F64, slot));
    }

    /* guards */

    fn jo_deopt(&mut self, origin: usize) {
        self.bytes(&[0x0f, 0x80]);
        self.rel32(FixTarget::Deopt(origin));
    }

    fn jb_deopt(&mut self, origin: usize) {
        self.bytes(&[0x0f, 0x82]);
        self.rel32(FixTarget::Deopt(origin));
    }

    fn je_deopt(&mut self, origin: usize) {
        self.bytes(&[0x0f, 0x84]);
        self.rel32(FixTarget::Deopt(origin));
    }

    fn jp_deopt(&mut self, origin: usize) {
        self.bytes(&[0x0f, 0x8a]);
        self.rel32(FixTarget::Deopt(origin));
    }

    /// Non-finite guard over `xmm0`: exponent all ones means Inf or NaN.
    fn finite_guard(&mut self, origin: usize) {
        self.bytes(&[0x66, 0x48, 0x0f, 0x7e, 0xc0]); // movq rax, xmm0
        self.bytes(&[0x48, 0xb9]); // mov rcx, exponent mask
        self.imm64(0x7ff0_0000_0000_0000);
        self.bytes(&[0x48, 0x21, 0xc8]); // and rax, rcx
        self.bytes(&[0x48, 0x39, 0xc8]); // cmp rax, rcx
        self.je_deopt(origin);
    }
}

pub(in crate::jit) fn emit(ir: &IrLoop) -> Result<CompiledLoop, TranslationFailure> {
    let mut asm = Asm::new();

    for &(offset, op) in &ir.ops {
        asm.label(offset);
        emit_op(&mut asm, offset, op);
    }

    // Completion exit: every path leaving the loop lands here.
    asm.label(ir.end);
    asm.bytes(&[0x48, 0xc7, 0x87]); // mov qword [rdi+IP], end
    asm.imm32(layout::IP);
    asm.imm32(ir.end as i32);
    asm.bytes(&[0xc7, 0x87]); // mov dword [rdi+EXIT], COMPLETED
    asm.imm32(layout::EXIT);
    asm.imm32(JIT_EXIT_COMPLETED as i32);
    asm.bytes(&[0xc3]);

    // Back-edge thunk: count the iteration against the budget, yield to
    // the interpreter when it runs out, otherwise continue at the header.
    let thunk = asm.code.len();
    asm.bytes(&[0x48, 0x8b, 0x87]); // mov rax, [rdi+BUDGET]
    asm.imm32(layout::BUDGET);
    asm.bytes(&[0x48, 0x83, 0xe8, 0x01]); // sub rax, 1
    asm.bytes(&[0x48, 0x89, 0x87]); // mov [rdi+BUDGET], rax
    asm.imm32(layout::BUDGET);
    asm.bytes(&[0x74, 0x05]); // jz yield (over the jmp)
    asm.bytes(&[0xe9]); // jmp header
    asm.rel32(FixTarget::Label(ir.entry));
    asm.bytes(&[0x48, 0xc7, 0x87]); // yield: mov qword [rdi+IP], header
    asm.imm32(layout::IP);
    asm.imm32(ir.entry as i32);
    asm.bytes(&[0xc7, 0x87]); // mov dword [rdi+EXIT], YIELD
    asm.imm32(layout::EXIT);
    asm.imm32(JIT_EXIT_YIELD as i32);
    asm.bytes(&[0xc3]);

    // Deopt stubs, one per faulting origin.
    let mut stubs: HashMap<usize, usize> = HashMap::new();
    let origins: Vec<usize> = asm
        .fixups
        .iter()
        .filter_map(|&(_, t)| match t {
            FixTarget::Deopt(origin) => Some(origin),
            FixTarget::Label(_) | FixTarget::BackEdge => None,
        })
        .collect();
    for origin in origins {
        if stubs.contains_key(&origin) {
            continue;
        }
        stubs.insert(origin, asm.code.len());
        asm.bytes(&[0x48, 0xc7, 0x87]); // mov qword [rdi+IP], origin
        asm.imm32(layout::IP);
        asm.imm32(origin as i32);
        asm.bytes(&[0xc7, 0x87]); // mov dword [rdi+EXIT], DEOPT
        asm.imm32(layout::EXIT);
        asm.imm32(JIT_EXIT_DEOPT as i32);
        asm.bytes(&[0xc7, 0x87]); // mov dword [rdi+DEOPT_REASON], reason
        asm.imm32(layout::DEOPT_REASON);
        asm.imm32(DEOPT_ARITHMETIC as i32);
        asm.bytes(&[0xc3]);
    }

    // Patch rel32 fixups.
    for &(pos, target) in &asm.fixups {
        let dest = match target {
            FixTarget::Label(offset) => *asm
                .labels
                .get(&offset)
                .ok_or(TranslationFailure::ControlFlowComplexity)?,
            FixTarget::Deopt(origin) => stubs[&origin],
            FixTarget::BackEdge => thunk,
        };
        let rel = dest as i64 - (pos as i64 + 4);
        let rel = i32::try_from(rel).map_err(|_| TranslationFailure::ControlFlowComplexity)?;
        asm.code[pos..pos + 4].copy_from_slice(&rel.to_le_bytes());
    }

    let code = ExecutableCode::new(&asm.code).ok_or(TranslationFailure::AllocatorExhaustion)?;
    Ok(CompiledLoop {
        code,
        kinds: ir.kinds.clone(),
        written: ir.written.clone(),
        debug_name: format!("loop@{}..{}", ir.entry, ir.end),
    })
}

fn emit_op(asm: &mut Asm, origin: usize, op: IrOp) {
    match op {
        IrOp::Safepoint => {}

        IrOp::Move { kind, dst, src } => {
            asm.load_bank_r10(Asm::bank_field(kind));
            if kind == IrKind::F64 {
                asm.movsd_xmm0_slot(src);
                asm.movsd_slot_xmm0(dst);
            } else {
                asm.mov_ax_slot(kind, src);
                asm.mov_slot_ax(kind, dst);
            }
        }

        IrOp::LoadConst { kind, dst, bits } => {
            asm.load_bank_r10(Asm::bank_field(kind));
            match kind {
                IrKind::I32 | IrKind::U32 => {
                    asm.bytes(&[0x41, 0xc7, 0x82]); // mov dword [r10+disp], imm32
                    asm.imm32(Asm::slot_disp(kind, dst));
                    asm.imm32(bits as u32 as i32);
                }
                _ => {
                    asm.bytes(&[0x48, 0xb8]); // mov rax, imm64
                    asm.imm64(bits);
                    // 8-byte stride and a REX.W store for all wide banks.
                    asm.mov_slot_ax(IrKind::U64, dst);
                }
            }
        }

        IrOp::Binary { kind, op, dst, a, b } => {
            asm.load_bank_r10(Asm::bank_field(kind));
            if kind == IrKind::F64 {
                emit_f64_binary(asm, origin, op, dst, a, b);
            } else {
                emit_int_binary(asm, origin, kind, op, dst, a, b);
            }
        }

        IrOp::Compare { kind, op, dst, a, b } => {
            asm.load_bank_r10(Asm::bank_field(kind));
            if kind == IrKind::F64 {
                asm.movsd_xmm0_slot(a);
                asm.movsd_xmm1_slot(b);
                asm.bytes(&[0x66, 0x0f, 0x2e, 0xc1]); // ucomisd xmm0, xmm1
                asm.jp_deopt(origin);
                let setcc = match op {
                    IrCmpOp::Lt => 0x92, // setb
                    IrCmpOp::Le => 0x96, // setbe
                    IrCmpOp::Gt => 0x97, // seta
                    IrCmpOp::Ge => 0x93, // setae
                };
                asm.bytes(&[0x0f, setcc, 0xc0]);
            } else {
                asm.mov_ax_slot(kind, a);
                asm.mov_cx_slot(kind, b);
                let rex = if Asm::wide(kind) { 0x48 } else { 0x00 };
                if rex != 0 {
                    asm.bytes(&[rex]);
                }
                asm.bytes(&[0x39, 0xc8]); // cmp eax, ecx
                let signed = matches!(kind, IrKind::I32 | IrKind::I64);
                let setcc = match (op, signed) {
                    (IrCmpOp::Lt, true) => 0x9c,
                    (IrCmpOp::Le, true) => 0x9e,
                    (IrCmpOp::Gt, true) => 0x9f,
                    (IrCmpOp::Ge, true) => 0x9d,
                    (IrCmpOp::Lt, false) => 0x92,
                    (IrCmpOp::Le, false) => 0x96,
                    (IrCmpOp::Gt, false) => 0x97,
                    (IrCmpOp::Ge, false) => 0x93,
                };
                asm.bytes(&[0x0f, setcc, 0xc0]);
            }
            asm.load_bank_r11(layout::BOOLS);
            asm.bytes(&[0x41, 0x88, 0x83]); // mov [r11+disp], al
            asm.imm32(Asm::slot_disp(IrKind::Bool, dst));
        }

        IrOp::Branch { cond, when, target } => {
            asm.load_bank_r11(layout::BOOLS);
            asm.bytes(&[0x41, 0x80, 0xbb]); // cmp byte [r11+disp], 0
            asm.imm32(Asm::slot_disp(IrKind::Bool, cond));
            asm.bytes(&[0x00]);
            // Branch when the flag matches `when`.
            asm.bytes(&[0x0f, if when { 0x85 } else { 0x84 }]); // jne / je
            asm.rel32(FixTarget::Label(target));
        }

        IrOp::Jump { target } => {
            asm.bytes(&[0xe9]);
            asm.rel32(FixTarget::Label(target));
        }

        IrOp::LoopBack { target: _ } => {
            asm.bytes(&[0xe9]);
            asm.rel32(FixTarget::BackEdge);
        }

        IrOp::IncCmpJmp {
            kind,
            counter,
            limit,
            target: _,
        } => {
            asm.load_bank_r10(Asm::bank_field(kind));
            asm.mov_ax_slot(kind, counter);
            if Asm::wide(kind) {
                asm.bytes(&[0x48, 0x83, 0xc0, 0x01]); // add rax, 1
            } else {
                asm.bytes(&[0x83, 0xc0, 0x01]); // add eax, 1
            }
            asm.jo_deopt(origin);
            asm.mov_slot_ax(kind, counter);
            asm.mov_cx_slot(kind, limit);
            if Asm::wide(kind) {
                asm.bytes(&[0x48, 0x39, 0xc8]);
            } else {
                asm.bytes(&[0x39, 0xc8]);
            }
            asm.bytes(&[0x0f, 0x8c]); // jl back, through the budget thunk
            asm.rel32(FixTarget::BackEdge);
        }

        IrOp::DecCmpJmp {
            kind,
            counter,
            floor,
            target: _,
        } => {
            asm.load_bank_r10(Asm::bank_field(kind));
            asm.mov_ax_slot(kind, counter);
            if Asm::wide(kind) {
                asm.bytes(&[0x48, 0x83, 0xe8, 0x01]); // sub rax, 1
            } else {
                asm.bytes(&[0x83, 0xe8, 0x01]); // sub eax, 1
            }
            asm.jo_deopt(origin);
            asm.mov_slot_ax(kind, counter);
            asm.mov_cx_slot(kind, floor);
            if Asm::wide(kind) {
                asm.bytes(&[0x48, 0x39, 0xc8]);
            } else {
                asm.bytes(&[0x39, 0xc8]);
            }
            asm.bytes(&[0x0f, 0x8f]); // jg back, through the budget thunk
            asm.rel32(FixTarget::BackEdge);
        }
    }
}

fn emit_int_binary(asm: &mut Asm, origin: usize, kind: IrKind, op: IrBinOp, dst: u16, a: u16, b: u16) {
    let signed = matches!(kind, IrKind::I32 | IrKind::I64);
    let wide = matches!(kind, IrKind::I64 | IrKind::U64);
    let rex: &[u8] = if wide { &[0x48] } else { &[] };

    match op {
        IrBinOp::Add => {
            asm.mov_ax_slot(kind, a);
            asm.mov_cx_slot(kind, b);
            asm.bytes(rex);
            asm.bytes(&[0x01, 0xc8]); // add eax, ecx
            if signed {
                asm.jo_deopt(origin);
            } else {
                asm.jb_deopt(origin);
            }
            asm.mov_slot_ax(kind, dst);
        }
        IrBinOp::Sub => {
            asm.mov_ax_slot(kind, a);
            asm.mov_cx_slot(kind, b);
            asm.bytes(rex);
            asm.bytes(&[0x29, 0xc8]); // sub eax, ecx
            if signed {
                asm.jo_deopt(origin);
            } else {
                asm.jb_deopt(origin);
            }
            asm.mov_slot_ax(kind, dst);
        }
        IrBinOp::Mul => {
            asm.mov_ax_slot(kind, a);
            asm.mov_cx_slot(kind, b);
            if signed {
                asm.bytes(rex);
                asm.bytes(&[0x0f, 0xaf, 0xc1]); // imul eax, ecx
                asm.jo_deopt(origin);
            } else {
                asm.bytes(rex);
                asm.bytes(&[0xf7, 0xe1]); // mul ecx
                asm.jb_deopt(origin);
            }
            asm.mov_slot_ax(kind, dst);
        }
        IrBinOp::Div | IrBinOp::Mod => {
            asm.mov_ax_slot(kind, a);
            asm.mov_cx_slot(kind, b);

            // Divisor zero.
            asm.bytes(rex);
            asm.bytes(&[0x85, 0xc9]); // test ecx, ecx
            asm.je_deopt(origin);

            if signed {
                // MIN / -1 overflows; deopt and let the interpreter decide
                // (division raises, remainder yields zero).
                if wide {
                    asm.bytes(&[0x48, 0xba]); // mov rdx, INT64_MIN
                    asm.imm64(i64::MIN as u64);
                    asm.bytes(&[0x48, 0x39, 0xd0]); // cmp rax, rdx
                    asm.bytes(&[0x75, 0x0a]); // jne past the -1 check
                    asm.bytes(&[0x48, 0x83, 0xf9, 0xff]); // cmp rcx, -1
                } else {
                    asm.bytes(&[0x3d]); // cmp eax, INT32_MIN
                    asm.imm32(i32::MIN);
                    asm.bytes(&[0x75, 0x09]); // jne past the -1 check
                    asm.bytes(&[0x83, 0xf9, 0xff]); // cmp ecx, -1
                }
                asm.je_deopt(origin);

                if wide {
                    asm.bytes(&[0x48, 0x99, 0x48, 0xf7, 0xf9]); // cqo; idiv rcx
                } else {
                    asm.bytes(&[0x99, 0xf7, 0xf9]); // cdq; idiv ecx
                }
            } else {
                asm.bytes(&[0x31, 0xd2]); // xor edx, edx
                asm.bytes(rex);
                asm.bytes(&[0xf7, 0xf1]); // div ecx
            }

            if op == IrBinOp::Div {
                asm.mov_slot_ax(kind, dst);
            } else {
                asm.mov_slot_dx(kind, dst);
            }
        }
    }
}

fn emit_f64_binary(asm: &mut Asm, origin: usize, op: IrBinOp, dst: u16, a: u16, b: u16) {
    asm.movsd_xmm0_slot(a);
    asm.movsd_xmm1_slot(b);

    if op == IrBinOp::Div {
        // Zero or NaN divisor deopts; the interpreter raises the
        // structured error.
        asm.bytes(&[0x0f, 0x57, 0xd2]); // xorps xmm2, xmm2
        asm.bytes(&[0x66, 0x0f, 0x2e, 0xca]); // ucomisd xmm1, xmm2
        asm.je_deopt(origin);
    }

    let opcode = match op {
        IrBinOp::Add => 0x58,
        IrBinOp::Sub => 0x5c,
        IrBinOp::Mul => 0x59,
        IrBinOp::Div => 0x5e,
        IrBinOp::Mod => unreachable!("f64 remainder is rejected at translation"),
    };
    asm.bytes(&[0xf2, 0x0f, opcode, 0xc1]); // opsd xmm0, xmm1

    asm.finite_guard(origin);
    asm.movsd_slot_xmm0(dst);
}

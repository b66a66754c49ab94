//! aarch64 (AAPCS64) backend
//!
//! Register conventions: `x0` holds the `JitState` pointer, `x9` the bank
//! base per operation, `x10`-`x14` and `d0`-`d2` are scratch. Deopt guards
//! use the condition-flag branches; fixups patch `imm19`/`imm26` fields
//! after emission.

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

#[derive(Debug, Clone, Copy)]
enum FixKind {
    /// Conditional branch / compare-branch, 19-bit immediate.
    Imm19,
    /// Unconditional branch, 26-bit immediate.
    Imm26,
}

struct Asm {
    words: Vec<u32>,
    labels: HashMap<usize, usize>,
    fixups: Vec<(usize, FixKind, FixTarget)>,
}

const COND_EQ: u32 = 0;
const COND_NE: u32 = 1;
const COND_HS: u32 = 2;
const COND_LO: u32 = 3;
const COND_VS: u32 = 6;
const COND_HI: u32 = 8;
const COND_LS: u32 = 9;
const COND_GE: u32 = 10;
const COND_LT: u32 = 11;
const COND_GT: u32 = 12;
const COND_LE: u32 = 13;

impl Asm {
    fn new() -> Self {
        Self {
            words: Vec::with_capacity(64),
            labels: HashMap::new(),
            fixups: Vec::new(),
        }
    }

    fn word(&mut self, w: u32) {
        self.words.push(w);
    }

    fn label(&mut self, offset: usize) {
        self.labels.entry(offset).or_insert(self.words.len());
    }

    fn branch_cond(&mut self, cond: u32, target: FixTarget) {
        self.fixups.push((self.words.len(), FixKind::Imm19, target));
        self.word(0x5400_0000 | cond);
    }

    fn cbz(&mut self, wide: bool, rt: u32, target: FixTarget) {
        self.fixups.push((self.words.len(), FixKind::Imm19, target));
        self.word(if wide { 0xb400_0000 } else { 0x3400_0000 } | rt);
    }

    fn cbnz(&mut self, wide: bool, rt: u32, target: FixTarget) {
        self.fixups.push((self.words.len(), FixKind::Imm19, target));
        self.word(if wide { 0xb500_0000 } else { 0x3500_0000 } | rt);
    }

    fn b(&mut self, target: FixTarget) {
        self.fixups.push((self.words.len(), FixKind::Imm26, target));
        self.word(0x1400_0000);
    }

    fn ret(&mut self) {
        self.word(0xd65f_03c0);
    }

    /* addressing */

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

    /// `ldr x9, [x0, #field]`
    fn load_bank(&mut self, field: i32) {
        self.word(0xf940_0000 | ((field as u32 / 8) << 10) | 9);
    }

    /// Load a slot into `rt`.
    fn load_slot(&mut self, kind: IrKind, rt: u32, slot: u16) {
        let slot = slot as u32;
        match kind {
            IrKind::I32 | IrKind::U32 => self.word(0xb940_0000 | (slot << 10) | (9 << 5) | rt),
            IrKind::I64 | IrKind::U64 => self.word(0xf940_0000 | (slot << 10) | (9 << 5) | rt),
            IrKind::Bool => self.word(0x3940_0000 | (slot << 10) | (9 << 5) | rt),
            IrKind::F64 => self.word(0xfd40_0000 | (slot << 10) | (9 << 5) | rt),
        }
    }

    /// Store `rt` into a slot.
    fn store_slot(&mut self, kind: IrKind, rt: u32, slot: u16) {
        let slot = slot as u32;
        match kind {
            IrKind::I32 | IrKind::U32 => self.word(0xb900_0000 | (slot << 10) | (9 << 5) | rt),
            IrKind::I64 | IrKind::U64 => self.word(0xf900_0000 | (slot << 10) | (9 << 5) | rt),
            IrKind::Bool => self.word(0x3900_0000 | (slot << 10) | (9 << 5) | rt),
            IrKind::F64 => self.word(0xfd00_0000 | (slot << 10) | (9 << 5) | rt),
        }
    }

    /// Materialize a 64-bit constant into `rd` with `movz`/`movk`.
    fn load_imm64(&mut self, rd: u32, value: u64) {
        self.word(0xd280_0000 | (((value & 0xffff) as u32) << 5) | rd);
        for hw in 1..4u32 {
            let part = ((value >> (16 * hw)) & 0xffff) as u32;
            if part != 0 {
                self.word(0xf280_0000 | (hw << 21) | (part << 5) | rd);
            }
        }
    }

    /// `cset w(rd), cond`
    fn cset(&mut self, rd: u32, cond: u32) {
        self.word(0x1a9f_07e0 | ((cond ^ 1) << 12) | rd);
    }

    /// Non-finite guard over `d0`: exponent all ones means Inf or NaN.
    fn finite_guard(&mut self, origin: usize) {
        self.word(0x9e66_000a); // fmov x10, d0
        self.load_imm64(11, 0x7ff0_0000_0000_0000);
        self.word(0x8a0b_014a); // and x10, x10, x11
        self.word(0xeb0b_015f); // cmp x10, x11
        self.branch_cond(COND_EQ, FixTarget::Deopt(origin));
    }
}

pub(in crate::jit) fn emit(ir: &IrLoop) -> Result<CompiledLoop, TranslationFailure> {
    let mut asm = Asm::new();

    for &(offset, op) in &ir.ops {
        asm.label(offset);
        emit_op(&mut asm, offset, op);
    }

    // Completion exit.
    asm.label(ir.end);
    asm.load_imm64(10, ir.end as u64);
    asm.word(0xf900_0000 | ((layout::IP as u32 / 8) << 10) | 10); // str x10, [x0, #IP]
    asm.word(0xb900_0000 | ((layout::EXIT as u32 / 4) << 10) | 31); // str wzr, [x0, #EXIT]
    debug_assert_eq!(JIT_EXIT_COMPLETED, 0);
    asm.ret();

    // Back-edge thunk: count the iteration against the budget, yield to
    // the interpreter when it runs out, otherwise continue at the header.
    let thunk = asm.words.len();
    asm.word(0xf940_0000 | ((layout::BUDGET as u32 / 8) << 10) | 10); // ldr x10, [x0, #BUDGET]
    asm.word(0xf100_054a); // subs x10, x10, #1
    asm.word(0xf900_0000 | ((layout::BUDGET as u32 / 8) << 10) | 10); // str x10, [x0, #BUDGET]
    asm.word(0x5400_0040 | COND_EQ); // b.eq yield (two instructions ahead)
    asm.b(FixTarget::Label(ir.entry));
    asm.load_imm64(10, ir.entry as u64); // yield:
    asm.word(0xf900_0000 | ((layout::IP as u32 / 8) << 10) | 10);
    asm.load_imm64(11, JIT_EXIT_YIELD as u64);
    asm.word(0xb900_0000 | ((layout::EXIT as u32 / 4) << 10) | 11);
    asm.ret();

    // Deopt stubs.
    let mut stubs: HashMap<usize, usize> = HashMap::new();
    let origins: Vec<usize> = asm
        .fixups
        .iter()
        .filter_map(|&(_, _, t)| match t {
            FixTarget::Deopt(origin) => Some(origin),
            FixTarget::Label(_) | FixTarget::BackEdge => None,
        })
        .collect();
    for origin in origins {
        if stubs.contains_key(&origin) {
            continue;
        }
        stubs.insert(origin, asm.words.len());
        asm.load_imm64(10, origin as u64);
        asm.word(0xf900_0000 | ((layout::IP as u32 / 8) << 10) | 10);
        asm.load_imm64(11, JIT_EXIT_DEOPT as u64);
        asm.word(0xb900_0000 | ((layout::EXIT as u32 / 4) << 10) | 11);
        asm.load_imm64(12, DEOPT_ARITHMETIC as u64);
        asm.word(0xb900_0000 | ((layout::DEOPT_REASON as u32 / 4) << 10) | 12);
        asm.ret();
    }

    // Patch branches.
    for &(pos, kind, target) in &asm.fixups {
        let dest = match target {
            FixTarget::Label(offset) => *asm
                .labels
                .get(&offset)
                .ok_or(TranslationFailure::ControlFlowComplexity)?,
            FixTarget::Deopt(origin) => stubs[&origin],
            FixTarget::BackEdge => thunk,
        };
        let delta = dest as i64 - pos as i64;
        match kind {
            FixKind::Imm19 => {
                let imm = i32::try_from(delta).map_err(|_| TranslationFailure::ControlFlowComplexity)?;
                if !(-(1 << 18)..(1 << 18)).contains(&imm) {
                    return Err(TranslationFailure::ControlFlowComplexity);
                }
                asm.words[pos] |= ((imm as u32) & 0x7ffff) << 5;
            }
            FixKind::Imm26 => {
                let imm = i32::try_from(delta).map_err(|_| TranslationFailure::ControlFlowComplexity)?;
                if !(-(1 << 25)..(1 << 25)).contains(&imm) {
                    return Err(TranslationFailure::ControlFlowComplexity);
                }
                asm.words[pos] |= (imm as u32) & 0x03ff_ffff;
            }
        }
    }

    let bytes: Vec<u8> = asm.words.iter().flat_map(|w| w.to_le_bytes()).collect();
    let code = ExecutableCode::new(&bytes).ok_or(TranslationFailure::AllocatorExhaustion)?;
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
            asm.load_bank(Asm::bank_field(kind));
            let rt = if kind == IrKind::F64 { 0 } else { 10 };
            asm.load_slot(kind, rt, src);
            asm.store_slot(kind, rt, dst);
        }

        IrOp::LoadConst { kind, dst, bits } => {
            asm.load_bank(Asm::bank_field(kind));
            asm.load_imm64(10, bits);
            if kind == IrKind::F64 {
                asm.word(0x9e67_0140); // fmov d0, x10
                asm.store_slot(IrKind::F64, 0, dst);
            } else {
                asm.store_slot(kind, 10, dst);
            }
        }

        IrOp::Binary { kind, op, dst, a, b } => {
            asm.load_bank(Asm::bank_field(kind));
            if kind == IrKind::F64 {
                emit_f64_binary(asm, origin, op, dst, a, b);
            } else {
                emit_int_binary(asm, origin, kind, op, dst, a, b);
            }
        }

        IrOp::Compare { kind, op, dst, a, b } => {
            asm.load_bank(Asm::bank_field(kind));
            let cond = if kind == IrKind::F64 {
                asm.load_slot(IrKind::F64, 0, a);
                asm.load_slot(IrKind::F64, 1, b);
                asm.word(0x1e61_2000); // fcmp d0, d1
                // FCMP leaves unordered results outside every ordered
                // condition below, matching the interpreter's NaN
                // comparisons.
                match op {
                    IrCmpOp::Lt => COND_LO,
                    IrCmpOp::Le => COND_LS,
                    IrCmpOp::Gt => COND_GT,
                    IrCmpOp::Ge => COND_GE,
                }
            } else {
                let wide = matches!(kind, IrKind::I64 | IrKind::U64);
                asm.load_slot(kind, 10, a);
                asm.load_slot(kind, 11, b);
                asm.word(if wide { 0xeb0b_015f } else { 0x6b0b_015f }); // cmp r10, r11
                let signed = matches!(kind, IrKind::I32 | IrKind::I64);
                match (op, signed) {
                    (IrCmpOp::Lt, true) => COND_LT,
                    (IrCmpOp::Le, true) => COND_LE,
                    (IrCmpOp::Gt, true) => COND_GT,
                    (IrCmpOp::Ge, true) => COND_GE,
                    (IrCmpOp::Lt, false) => COND_LO,
                    (IrCmpOp::Le, false) => COND_LS,
                    (IrCmpOp::Gt, false) => COND_HI,
                    (IrCmpOp::Ge, false) => COND_HS,
                }
            };
            asm.cset(12, cond);
            asm.load_bank(layout::BOOLS);
            asm.store_slot(IrKind::Bool, 12, dst);
        }

        IrOp::Branch { cond, when, target } => {
            asm.load_bank(layout::BOOLS);
            asm.load_slot(IrKind::Bool, 10, cond);
            if when {
                asm.cbnz(false, 10, FixTarget::Label(target));
            } else {
                asm.cbz(false, 10, FixTarget::Label(target));
            }
        }

        IrOp::Jump { target } => {
            asm.b(FixTarget::Label(target));
        }

        IrOp::LoopBack { target: _ } => {
            asm.b(FixTarget::BackEdge);
        }

        IrOp::IncCmpJmp {
            kind,
            counter,
            limit,
            target: _,
        } => {
            let wide = kind == IrKind::I64;
            asm.load_bank(Asm::bank_field(kind));
            asm.load_slot(kind, 10, counter);
            // adds r10, r10, #1
            asm.word(if wide { 0xb100_054a } else { 0x3100_054a });
            asm.branch_cond(COND_VS, FixTarget::Deopt(origin));
            asm.store_slot(kind, 10, counter);
            asm.load_slot(kind, 11, limit);
            asm.word(if wide { 0xeb0b_015f } else { 0x6b0b_015f }); // cmp
            asm.branch_cond(COND_LT, FixTarget::BackEdge);
        }

        IrOp::DecCmpJmp {
            kind,
            counter,
            floor,
            target: _,
        } => {
            let wide = kind == IrKind::I64;
            asm.load_bank(Asm::bank_field(kind));
            asm.load_slot(kind, 10, counter);
            // subs r10, r10, #1
            asm.word(if wide { 0xf100_054a } else { 0x7100_054a });
            asm.branch_cond(COND_VS, FixTarget::Deopt(origin));
            asm.store_slot(kind, 10, counter);
            asm.load_slot(kind, 11, floor);
            asm.word(if wide { 0xeb0b_015f } else { 0x6b0b_015f });
            asm.branch_cond(COND_GT, FixTarget::BackEdge);
        }
    }
}

fn emit_int_binary(asm: &mut Asm, origin: usize, kind: IrKind, op: IrBinOp, dst: u16, a: u16, b: u16) {
    let signed = matches!(kind, IrKind::I32 | IrKind::I64);
    let wide = matches!(kind, IrKind::I64 | IrKind::U64);

    asm.load_slot(kind, 10, a);
    asm.load_slot(kind, 11, b);

    match op {
        IrBinOp::Add => {
            // adds r12, r10, r11
            asm.word(if wide { 0xab0b_014c } else { 0x2b0b_014c });
            asm.branch_cond(if signed { COND_VS } else { COND_HS }, FixTarget::Deopt(origin));
            asm.store_slot(kind, 12, dst);
        }
        IrBinOp::Sub => {
            // subs r12, r10, r11
            asm.word(if wide { 0xeb0b_014c } else { 0x6b0b_014c });
            asm.branch_cond(if signed { COND_VS } else { COND_LO }, FixTarget::Deopt(origin));
            asm.store_slot(kind, 12, dst);
        }
        IrBinOp::Mul => {
            match (wide, signed) {
                (false, true) => {
                    asm.word(0x9b2b_7d4c); // smull x12, w10, w11
                    asm.word(0x9340_7d8d); // sxtw x13, w12
                    asm.word(0xeb0d_019f); // cmp x12, x13
                    asm.branch_cond(COND_NE, FixTarget::Deopt(origin));
                }
                (false, false) => {
                    asm.word(0x9bab_7d4c); // umull x12, w10, w11
                    asm.word(0xd360_fd8d); // lsr x13, x12, #32
                    asm.cbnz(true, 13, FixTarget::Deopt(origin));
                }
                (true, true) => {
                    asm.word(0x9b0b_7d4c); // mul x12, x10, x11
                    asm.word(0x9b4b_7d4d); // smulh x13, x10, x11
                    asm.word(0xeb8c_fdbf); // cmp x13, x12, asr #63
                    asm.branch_cond(COND_NE, FixTarget::Deopt(origin));
                }
                (true, false) => {
                    asm.word(0x9b0b_7d4c); // mul x12, x10, x11
                    asm.word(0x9bcb_7d4d); // umulh x13, x10, x11
                    asm.cbnz(true, 13, FixTarget::Deopt(origin));
                }
            }
            asm.store_slot(kind, 12, dst);
        }
        IrBinOp::Div | IrBinOp::Mod => {
            asm.cbz(wide, 11, FixTarget::Deopt(origin));

            if signed {
                // MIN / -1 deopts; the interpreter raises or yields zero.
                if wide {
                    asm.load_imm64(13, i64::MIN as u64);
                    asm.word(0xeb0d_015f); // cmp x10, x13
                } else {
                    asm.load_imm64(13, 0x8000_0000);
                    asm.word(0x6b0d_015f); // cmp w10, w13
                }
                asm.word(0x5400_0061); // b.ne past the -1 check
                // cmn r11, #1
                asm.word(if wide { 0xb100_057f } else { 0x3100_057f });
                asm.branch_cond(COND_EQ, FixTarget::Deopt(origin));
            }

            // sdiv/udiv r12, r10, r11
            let div = match (wide, signed) {
                (false, true) => 0x1acb_0d4c,
                (false, false) => 0x1acb_094c,
                (true, true) => 0x9acb_0d4c,
                (true, false) => 0x9acb_094c,
            };
            asm.word(div);

            if op == IrBinOp::Mod {
                // msub r12, r12, r11, r10
                asm.word(if wide { 0x9b0b_a98c } else { 0x1b0b_a98c });
            }
            asm.store_slot(kind, 12, dst);
        }
    }
}

fn emit_f64_binary(asm: &mut Asm, origin: usize, op: IrBinOp, dst: u16, a: u16, b: u16) {
    asm.load_slot(IrKind::F64, 0, a);
    asm.load_slot(IrKind::F64, 1, b);

    if op == IrBinOp::Div {
        asm.word(0x1e60_2028); // fcmp d1, #0.0
        asm.branch_cond(COND_EQ, FixTarget::Deopt(origin));
    }

    let word = match op {
        IrBinOp::Add => 0x1e61_2800, // fadd d0, d0, d1
        IrBinOp::Sub => 0x1e61_3800,
        IrBinOp::Mul => 0x1e61_0800,
        IrBinOp::Div => 0x1e61_1800,
        IrBinOp::Mod => unreachable!("f64 remainder is rejected at translation"),
    };
    asm.word(word);

    asm.finite_guard(origin);
    asm.store_slot(IrKind::F64, 0, dst);
}

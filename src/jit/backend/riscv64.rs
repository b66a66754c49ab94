//! riscv64 (LP64D) backend
//!
//! Register conventions: `a0` holds the `JitState` pointer, `t0` the bank
//! base per operation, `t1`-`t6` and `ft0`-`ft2` are scratch. Conditional
//! transfers use the inverted-branch-over-`jal` pattern so targets reach
//! the full ±1MB range; `jal` immediates are patched after emission.

use std::collections::HashMap;

use crate::jit::exec::ExecutableCode;
use crate::jit::ir::{IrBinOp, IrCmpOp, IrKind, IrLoop, IrOp};
use crate::jit::state_layout as layout;
use crate::jit::{CompiledLoop, TranslationFailure, DEOPT_ARITHMETIC, JIT_EXIT_DEOPT, JIT_EXIT_YIELD};

const A0: u32 = 10;
const T0: u32 = 5;
const T1: u32 = 6;
const T2: u32 = 7;
const T3: u32 = 28;
const T4: u32 = 29;
const T5: u32 = 30;
const T6: u32 = 31;
const ZERO: u32 = 0;

const FT0: u32 = 0;
const FT1: u32 = 1;
const FT2: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum FixTarget {
    Label(usize),
    Deopt(usize),
    /// The budget-counting back-edge thunk.
    BackEdge,
    /// The budget-exhausted yield exit.
    Yield,
}

struct Asm {
    words: Vec<u32>,
    labels: HashMap<usize, usize>,
    fixups: Vec<(usize, FixTarget)>,
}

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

    fn r_type(&mut self, f7: u32, rs2: u32, rs1: u32, f3: u32, rd: u32, op: u32) {
        self.word((f7 << 25) | (rs2 << 20) | (rs1 << 15) | (f3 << 12) | (rd << 7) | op);
    }

    fn i_type(&mut self, imm: i32, rs1: u32, f3: u32, rd: u32, op: u32) {
        self.word(((imm as u32 & 0xfff) << 20) | (rs1 << 15) | (f3 << 12) | (rd << 7) | op);
    }

    fn s_type(&mut self, imm: i32, rs2: u32, rs1: u32, f3: u32, op: u32) {
        let imm = imm as u32 & 0xfff;
        self.word(((imm >> 5) << 25) | (rs2 << 20) | (rs1 << 15) | (f3 << 12) | ((imm & 0x1f) << 7) | op);
    }

    /// B-type with a small positive literal offset (skip patterns).
    fn b_type(&mut self, f3: u32, rs1: u32, rs2: u32, offset: u32) {
        debug_assert!(offset % 2 == 0 && offset < 4096);
        let imm11 = (offset >> 11) & 1;
        let imm4_1 = (offset >> 1) & 0xf;
        let imm10_5 = (offset >> 5) & 0x3f;
        let imm12 = (offset >> 12) & 1;
        self.word(
            (imm12 << 31) | (imm10_5 << 25) | (rs2 << 20) | (rs1 << 15) | (f3 << 12) | (imm4_1 << 8) | (imm11 << 7)
                | 0x63,
        );
    }

    /// `jal x0, target`, patched later.
    fn jal(&mut self, target: FixTarget) {
        self.fixups.push((self.words.len(), target));
        self.word(0x0000_006f);
    }

    /// Transfer to `target` when `rs1 <f3-cond> rs2` holds: inverted
    /// branch over an absolute-range `jal`.
    fn branch_if(&mut self, f3: u32, rs1: u32, rs2: u32, target: FixTarget) {
        // Condition inversion flips the low bit of funct3.
        self.b_type(f3 ^ 1, rs1, rs2, 8);
        self.jal(target);
    }

    fn ret(&mut self) {
        self.word(0x0000_8067); // jalr x0, 0(ra)
    }

    /* constants */

    fn li32(&mut self, rd: u32, v: i32) {
        if (-2048..=2047).contains(&v) {
            self.i_type(v, ZERO, 0b000, rd, 0x13); // addi rd, x0, v
            return;
        }
        let hi = (v.wrapping_add(0x800)) >> 12;
        let lo = v.wrapping_sub(hi << 12);
        self.word((((hi as u32) & 0xfffff) << 12) | (rd << 7) | 0x37); // lui
        self.i_type(lo, rd, 0b000, rd, 0x1b); // addiw
    }

    fn li64(&mut self, rd: u32, v: u64) {
        if let Ok(small) = i32::try_from(v as i64) {
            self.li32(rd, small);
            return;
        }
        self.li32(rd, (v >> 32) as i32);
        self.i_type(32, rd, 0b001, rd, 0x13); // slli rd, rd, 32
        self.li32(T6, v as u32 as i32);
        self.i_type(32, T6, 0b001, T6, 0x13); // slli t6, t6, 32
        self.i_type(32, T6, 0b101, T6, 0x13); // srli t6, t6, 32
        self.r_type(0, T6, rd, 0b110, rd, 0x33); // or rd, rd, t6
    }

    /* bank addressing */

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

    /// `ld t0, field(a0)`
    fn load_bank(&mut self, field: i32) {
        self.i_type(field, A0, 0b011, T0, 0x03);
    }

    fn load_slot(&mut self, kind: IrKind, rd: u32, slot: u16) {
        let off = slot_off(kind, slot);
        match kind {
            IrKind::I32 => self.i_type(off, T0, 0b010, rd, 0x03), // lw
            IrKind::U32 => self.i_type(off, T0, 0b110, rd, 0x03), // lwu
            IrKind::I64 | IrKind::U64 => self.i_type(off, T0, 0b011, rd, 0x03), // ld
            IrKind::Bool => self.i_type(off, T0, 0b100, rd, 0x03), // lbu
            IrKind::F64 => self.i_type(off, T0, 0b011, rd, 0x07), // fld
        }
    }

    fn store_slot(&mut self, kind: IrKind, rs: u32, slot: u16) {
        let off = slot_off(kind, slot);
        match kind {
            IrKind::I32 | IrKind::U32 => self.s_type(off, rs, T0, 0b010, 0x23), // sw
            IrKind::I64 | IrKind::U64 => self.s_type(off, rs, T0, 0b011, 0x23), // sd
            IrKind::Bool => self.s_type(off, rs, T0, 0b000, 0x23),              // sb
            IrKind::F64 => self.s_type(off, rs, T0, 0b011, 0x27),               // fsd
        }
    }
}

fn slot_off(kind: IrKind, slot: u16) -> i32 {
    let width = match kind {
        IrKind::I32 | IrKind::U32 => 4,
        IrKind::I64 | IrKind::U64 | IrKind::F64 => 8,
        IrKind::Bool => 1,
    };
    slot as i32 * width
}

pub(in crate::jit) fn emit(ir: &IrLoop) -> Result<CompiledLoop, TranslationFailure> {
    let mut asm = Asm::new();

    for &(offset, op) in &ir.ops {
        asm.label(offset);
        emit_op(&mut asm, offset, op);
    }

    // Completion exit.
    asm.label(ir.end);
    asm.li32(T1, ir.end as i32);
    asm.s_type(layout::IP, T1, A0, 0b011, 0x23); // sd t1, IP(a0)
    asm.s_type(layout::EXIT, ZERO, A0, 0b010, 0x23); // sw x0, EXIT(a0)
    asm.ret();

    // Back-edge thunk: count the iteration against the budget, yield to
    // the interpreter when it runs out, otherwise continue at the header.
    let thunk = asm.words.len();
    asm.i_type(layout::BUDGET, A0, 0b011, T1, 0x03); // ld t1, BUDGET(a0)
    asm.i_type(-1, T1, 0b000, T1, 0x13); // addi t1, t1, -1
    asm.s_type(layout::BUDGET, T1, A0, 0b011, 0x23); // sd t1, BUDGET(a0)
    asm.b_type(BNE, T1, ZERO, 8); // skip the yield exit while budget remains
    asm.jal(FixTarget::Yield);
    asm.jal(FixTarget::Label(ir.entry));

    // Yield exit: resume interpretation at the header.
    let yield_stub = asm.words.len();
    asm.li32(T1, ir.entry as i32);
    asm.s_type(layout::IP, T1, A0, 0b011, 0x23);
    asm.li32(T2, JIT_EXIT_YIELD as i32);
    asm.s_type(layout::EXIT, T2, A0, 0b010, 0x23);
    asm.ret();

    // Deopt stubs.
    let mut stubs: HashMap<usize, usize> = HashMap::new();
    let origins: Vec<usize> = asm
        .fixups
        .iter()
        .filter_map(|&(_, t)| match t {
            FixTarget::Deopt(origin) => Some(origin),
            _ => None,
        })
        .collect();
    for origin in origins {
        if stubs.contains_key(&origin) {
            continue;
        }
        stubs.insert(origin, asm.words.len());
        asm.li32(T1, origin as i32);
        asm.s_type(layout::IP, T1, A0, 0b011, 0x23);
        asm.li32(T2, JIT_EXIT_DEOPT as i32);
        asm.s_type(layout::EXIT, T2, A0, 0b010, 0x23);
        asm.li32(T3, DEOPT_ARITHMETIC as i32);
        asm.s_type(layout::DEOPT_REASON, T3, A0, 0b010, 0x23);
        asm.ret();
    }

    // Patch jal immediates.
    for &(pos, target) in &asm.fixups {
        let dest = match target {
            FixTarget::Label(offset) => *asm
                .labels
                .get(&offset)
                .ok_or(TranslationFailure::ControlFlowComplexity)?,
            FixTarget::Deopt(origin) => stubs[&origin],
            FixTarget::BackEdge => thunk,
            FixTarget::Yield => yield_stub,
        };
        let delta = (dest as i64 - pos as i64) * 4;
        if !(-(1 << 20)..(1 << 20)).contains(&delta) {
            return Err(TranslationFailure::ControlFlowComplexity);
        }
        let imm = delta as u32;
        let encoded = ((imm >> 20) & 1) << 31
            | ((imm >> 1) & 0x3ff) << 21
            | ((imm >> 11) & 1) << 20
            | ((imm >> 12) & 0xff) << 12;
        asm.words[pos] |= encoded;
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

const BEQ: u32 = 0b000;
const BNE: u32 = 0b001;
const BLT: u32 = 0b100;
const BLTU: u32 = 0b110;

fn emit_op(asm: &mut Asm, origin: usize, op: IrOp) {
    match op {
        IrOp::Safepoint => {}

        IrOp::Move { kind, dst, src } => {
            asm.load_bank(Asm::bank_field(kind));
            let r = if kind == IrKind::F64 { FT0 } else { T1 };
            asm.load_slot(kind, r, src);
            asm.store_slot(kind, r, dst);
        }

        IrOp::LoadConst { kind, dst, bits } => {
            asm.load_bank(Asm::bank_field(kind));
            match kind {
                IrKind::I32 | IrKind::U32 => {
                    asm.li32(T1, bits as u32 as i32);
                    asm.store_slot(kind, T1, dst);
                }
                _ => {
                    asm.li64(T1, bits);
                    // Wide banks share the 8-byte stride; an integer store
                    // fills the f64 bank as well.
                    asm.s_type(slot_off(IrKind::U64, dst), T1, T0, 0b011, 0x23);
                }
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
            if kind == IrKind::F64 {
                asm.load_slot(IrKind::F64, FT0, a);
                asm.load_slot(IrKind::F64, FT1, b);
                // flt/fle yield 0 on NaN, matching the interpreter.
                match op {
                    IrCmpOp::Lt => asm.r_type(0b1010001, FT1, FT0, 0b001, T3, 0x53),
                    IrCmpOp::Le => asm.r_type(0b1010001, FT1, FT0, 0b000, T3, 0x53),
                    IrCmpOp::Gt => asm.r_type(0b1010001, FT0, FT1, 0b001, T3, 0x53),
                    IrCmpOp::Ge => asm.r_type(0b1010001, FT0, FT1, 0b000, T3, 0x53),
                }
            } else {
                asm.load_slot(kind, T1, a);
                asm.load_slot(kind, T2, b);
                let f3 = if matches!(kind, IrKind::I32 | IrKind::I64) {
                    0b010 // slt
                } else {
                    0b011 // sltu
                };
                match op {
                    IrCmpOp::Lt => asm.r_type(0, T2, T1, f3, T3, 0x33),
                    IrCmpOp::Gt => asm.r_type(0, T1, T2, f3, T3, 0x33),
                    IrCmpOp::Le => {
                        asm.r_type(0, T1, T2, f3, T3, 0x33);
                        asm.i_type(1, T3, 0b100, T3, 0x13); // xori t3, t3, 1
                    }
                    IrCmpOp::Ge => {
                        asm.r_type(0, T2, T1, f3, T3, 0x33);
                        asm.i_type(1, T3, 0b100, T3, 0x13);
                    }
                }
            }
            asm.load_bank(layout::BOOLS);
            asm.store_slot(IrKind::Bool, T3, dst);
        }

        IrOp::Branch { cond, when, target } => {
            asm.load_bank(layout::BOOLS);
            asm.load_slot(IrKind::Bool, T1, cond);
            let f3 = if when { BNE } else { BEQ };
            asm.branch_if(f3, T1, ZERO, FixTarget::Label(target));
        }

        IrOp::Jump { target } => {
            asm.jal(FixTarget::Label(target));
        }

        IrOp::LoopBack { target: _ } => {
            asm.jal(FixTarget::BackEdge);
        }

        IrOp::IncCmpJmp {
            kind,
            counter,
            limit,
            target: _,
        } => {
            asm.load_bank(Asm::bank_field(kind));
            asm.load_slot(kind, T1, counter);
            if kind == IrKind::I32 {
                asm.i_type(1, T1, 0b000, T3, 0x13); // addi t3, t1, 1
                asm.i_type(1, T1, 0b000, T2, 0x1b); // addiw t2, t1, 1
                asm.branch_if(BNE, T3, T2, FixTarget::Deopt(origin));
            } else {
                asm.i_type(1, T1, 0b000, T2, 0x13); // addi t2, t1, 1
                // Wrap past MAX makes the sum smaller than the operand.
                asm.branch_if(BLT, T2, T1, FixTarget::Deopt(origin));
            }
            asm.store_slot(kind, T2, counter);
            asm.load_slot(kind, T4, limit);
            asm.branch_if(BLT, T2, T4, FixTarget::BackEdge);
        }

        IrOp::DecCmpJmp {
            kind,
            counter,
            floor,
            target: _,
        } => {
            asm.load_bank(Asm::bank_field(kind));
            asm.load_slot(kind, T1, counter);
            if kind == IrKind::I32 {
                asm.i_type(-1, T1, 0b000, T3, 0x13); // addi t3, t1, -1
                asm.i_type(-1, T1, 0b000, T2, 0x1b); // addiw t2, t1, -1
                asm.branch_if(BNE, T3, T2, FixTarget::Deopt(origin));
            } else {
                asm.i_type(-1, T1, 0b000, T2, 0x13);
                // Wrap past MIN makes the result larger than the operand.
                asm.branch_if(BLT, T1, T2, FixTarget::Deopt(origin));
            }
            asm.store_slot(kind, T2, counter);
            asm.load_slot(kind, T4, floor);
            asm.branch_if(BLT, T4, T2, FixTarget::BackEdge);
        }
    }
}

fn emit_int_binary(asm: &mut Asm, origin: usize, kind: IrKind, op: IrBinOp, dst: u16, a: u16, b: u16) {
    let signed = matches!(kind, IrKind::I32 | IrKind::I64);
    let narrow = matches!(kind, IrKind::I32 | IrKind::U32);

    asm.load_slot(kind, T1, a);
    asm.load_slot(kind, T2, b);

    match (op, kind) {
        (IrBinOp::Add, IrKind::I32) => {
            asm.r_type(0, T2, T1, 0b000, T3, 0x33); // add t3 (64-bit)
            asm.r_type(0, T2, T1, 0b000, T4, 0x3b); // addw t4
            asm.branch_if(BNE, T3, T4, FixTarget::Deopt(origin));
            asm.store_slot(kind, T4, dst);
        }
        (IrBinOp::Add, IrKind::U32) => {
            asm.r_type(0, T2, T1, 0b000, T3, 0x33);
            asm.i_type(32, T3, 0b101, T4, 0x13); // srli t4, t3, 32
            asm.branch_if(BNE, T4, ZERO, FixTarget::Deopt(origin));
            asm.store_slot(kind, T3, dst);
        }
        (IrBinOp::Add, IrKind::I64) => {
            asm.r_type(0, T2, T1, 0b000, T3, 0x33);
            asm.r_type(0, T1, T3, 0b100, T4, 0x33); // xor t4, t3, t1
            asm.r_type(0, T2, T3, 0b100, T5, 0x33); // xor t5, t3, t2
            asm.r_type(0, T5, T4, 0b111, T4, 0x33); // and t4, t4, t5
            asm.branch_if(BLT, T4, ZERO, FixTarget::Deopt(origin));
            asm.store_slot(kind, T3, dst);
        }
        (IrBinOp::Add, IrKind::U64) => {
            asm.r_type(0, T2, T1, 0b000, T3, 0x33);
            asm.branch_if(BLTU, T3, T1, FixTarget::Deopt(origin));
            asm.store_slot(kind, T3, dst);
        }

        (IrBinOp::Sub, IrKind::I32) => {
            asm.r_type(0x20, T2, T1, 0b000, T3, 0x33); // sub
            asm.r_type(0x20, T2, T1, 0b000, T4, 0x3b); // subw
            asm.branch_if(BNE, T3, T4, FixTarget::Deopt(origin));
            asm.store_slot(kind, T4, dst);
        }
        (IrBinOp::Sub, IrKind::U32 | IrKind::U64) => {
            asm.branch_if(BLTU, T1, T2, FixTarget::Deopt(origin));
            asm.r_type(0x20, T2, T1, 0b000, T3, 0x33);
            asm.store_slot(kind, T3, dst);
        }
        (IrBinOp::Sub, IrKind::I64) => {
            asm.r_type(0x20, T2, T1, 0b000, T3, 0x33);
            asm.r_type(0, T2, T1, 0b100, T4, 0x33); // xor t4, t1, t2
            asm.r_type(0, T1, T3, 0b100, T5, 0x33); // xor t5, t3, t1
            asm.r_type(0, T5, T4, 0b111, T4, 0x33);
            asm.branch_if(BLT, T4, ZERO, FixTarget::Deopt(origin));
            asm.store_slot(kind, T3, dst);
        }

        (IrBinOp::Mul, IrKind::I32) => {
            asm.r_type(1, T2, T1, 0b000, T3, 0x33); // mul t3
            asm.i_type(0, T3, 0b000, T4, 0x1b); // sext.w t4, t3
            asm.branch_if(BNE, T3, T4, FixTarget::Deopt(origin));
            asm.store_slot(kind, T3, dst);
        }
        (IrBinOp::Mul, IrKind::U32) => {
            asm.r_type(1, T2, T1, 0b000, T3, 0x33);
            asm.i_type(32, T3, 0b101, T4, 0x13);
            asm.branch_if(BNE, T4, ZERO, FixTarget::Deopt(origin));
            asm.store_slot(kind, T3, dst);
        }
        (IrBinOp::Mul, IrKind::I64) => {
            asm.r_type(1, T2, T1, 0b000, T3, 0x33); // mul
            asm.r_type(1, T2, T1, 0b001, T4, 0x33); // mulh
            asm.i_type(63 | 0x400, T3, 0b101, T5, 0x13); // srai t5, t3, 63
            asm.branch_if(BNE, T4, T5, FixTarget::Deopt(origin));
            asm.store_slot(kind, T3, dst);
        }
        (IrBinOp::Mul, IrKind::U64) => {
            asm.r_type(1, T2, T1, 0b011, T4, 0x33); // mulhu
            asm.branch_if(BNE, T4, ZERO, FixTarget::Deopt(origin));
            asm.r_type(1, T2, T1, 0b000, T3, 0x33); // mul
            asm.store_slot(kind, T3, dst);
        }

        (IrBinOp::Div | IrBinOp::Mod, _) => {
            asm.branch_if(BEQ, T2, ZERO, FixTarget::Deopt(origin));

            if signed {
                // MIN / -1 deopts; the interpreter raises or yields zero.
                if narrow {
                    asm.word((0x80000 << 12) | (T4 << 7) | 0x37); // lui t4, 0x80000
                } else {
                    asm.li64(T4, i64::MIN as u64);
                }
                asm.b_type(BNE, T1, T4, 16); // skip the -1 check
                asm.i_type(-1, ZERO, 0b000, T5, 0x13); // addi t5, x0, -1
                asm.branch_if(BEQ, T2, T5, FixTarget::Deopt(origin));
            }

            let (f3, opc) = match (op, signed) {
                (IrBinOp::Div, true) => (0b100, if narrow { 0x3b } else { 0x33 }),
                (IrBinOp::Div, false) => (0b101, if narrow { 0x3b } else { 0x33 }),
                (IrBinOp::Mod, true) => (0b110, if narrow { 0x3b } else { 0x33 }),
                (IrBinOp::Mod, false) => (0b111, if narrow { 0x3b } else { 0x33 }),
                _ => unreachable!(),
            };
            asm.r_type(1, T2, T1, f3, T3, opc);
            asm.store_slot(kind, T3, dst);
        }

        _ => unreachable!("integer emitter called with a float kind"),
    }
}

fn emit_f64_binary(asm: &mut Asm, origin: usize, op: IrBinOp, dst: u16, a: u16, b: u16) {
    asm.load_slot(IrKind::F64, FT0, a);
    asm.load_slot(IrKind::F64, FT1, b);

    if op == IrBinOp::Div {
        asm.r_type(0b1110001, 0, FT1, 0b000, T1, 0x53); // fmv.x.d t1, ft1
        asm.i_type(1, T1, 0b001, T2, 0x13); // slli t2, t1, 1
        asm.branch_if(BEQ, T2, ZERO, FixTarget::Deopt(origin));
    }

    let f7 = match op {
        IrBinOp::Add => 0b0000001,
        IrBinOp::Sub => 0b0000101,
        IrBinOp::Mul => 0b0001001,
        IrBinOp::Div => 0b0001101,
        IrBinOp::Mod => unreachable!("f64 remainder is rejected at translation"),
    };
    asm.r_type(f7, FT1, FT0, 0b111, FT2, 0x53); // f<op>.d ft2, ft0, ft1

    // Inf or NaN results deopt; fclass bits 0/7 are the infinities and
    // 8/9 the NaNs.
    asm.r_type(0b1110001, 0, FT2, 0b001, T3, 0x53); // fclass.d t3, ft2
    asm.i_type(0x381, T3, 0b111, T4, 0x13); // andi t4, t3, 0x381
    asm.branch_if(BNE, T4, ZERO, FixTarget::Deopt(origin));

    asm.store_slot(IrKind::F64, FT2, dst);
}

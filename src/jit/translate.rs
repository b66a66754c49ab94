//! Bytecode-to-IR lifting
//!
//! Lifts the linear byte range of a hot loop into [`IrLoop`]. The block
//! must be join-free: one back-edge targeting the header, forward branches
//! landing on block-internal boundaries or on the loop exit, and no calls,
//! allocation or exception traffic.

use orus_asm::{Chunk, Opcode};

use std::collections::{BTreeMap, BTreeSet};

use crate::consts::{JIT_MAX_BLOCK_OPS, JIT_MAX_GUARDS};
use crate::params::JitRolloutStage;
use crate::value::Value;

use super::ir::{IrBinOp, IrCmpOp, IrKind, IrLoop, IrOp};
use super::TranslationFailure;

fn kind_allowed(stage: JitRolloutStage, kind: IrKind) -> bool {
    match kind {
        IrKind::I32 => stage >= JitRolloutStage::I32Only,
        IrKind::I64 | IrKind::U32 | IrKind::U64 => stage >= JitRolloutStage::Integers,
        IrKind::F64 => stage >= JitRolloutStage::Floats,
        IrKind::Bool => stage >= JitRolloutStage::Full,
    }
}

struct Lifter<'c> {
    chunk: &'c Chunk<Value>,
    stage: JitRolloutStage,
    entry: usize,
    end: usize,
    boundaries: BTreeSet<usize>,
    ops: Vec<(usize, IrOp)>,
    kinds: BTreeMap<u16, IrKind>,
    written: BTreeSet<u16>,
    guards: usize,
}

/// Lift the loop starting at `header` into IR.
pub(super) fn lift(
    chunk: &Chunk<Value>,
    header: usize,
    stage: JitRolloutStage,
) -> Result<IrLoop, TranslationFailure> {
    let (end, boundaries) = scan_extent(chunk, header)?;

    let mut lifter = Lifter {
        chunk,
        stage,
        entry: header,
        end,
        boundaries,
        ops: Vec::new(),
        kinds: BTreeMap::new(),
        written: BTreeSet::new(),
        guards: 0,
    };

    let mut offset = header;
    while offset < end {
        lifter.lift_instruction(offset)?;
        offset = chunk
            .next_offset(offset)
            .map_err(|_| TranslationFailure::ControlFlowComplexity)?;
    }

    if lifter.guards > JIT_MAX_GUARDS {
        return Err(TranslationFailure::GuardLimit);
    }

    Ok(IrLoop {
        entry: header,
        end,
        ops: lifter.ops,
        kinds: lifter.kinds.into_iter().collect(),
        written: lifter.written.into_iter().collect(),
        guards: lifter.guards,
    })
}

/// First pass: find the back-edge that closes the loop and collect the
/// instruction boundaries of the block.
fn scan_extent(chunk: &Chunk<Value>, header: usize) -> Result<(usize, BTreeSet<usize>), TranslationFailure> {
    let mut boundaries = BTreeSet::new();
    let mut offset = header;

    for _ in 0..JIT_MAX_BLOCK_OPS {
        if offset >= chunk.len() {
            return Err(TranslationFailure::ControlFlowComplexity);
        }
        boundaries.insert(offset);

        let op = chunk
            .opcode_at(offset)
            .map_err(|_| TranslationFailure::ControlFlowComplexity)?;
        let next = chunk
            .next_offset(offset)
            .map_err(|_| TranslationFailure::ControlFlowComplexity)?;

        if op.is_back_edge() {
            let back = match op {
                Opcode::Loop => chunk.read_u16(offset + 1),
                Opcode::IncCmpJmp | Opcode::DecCmpJmp => chunk.read_u16(offset + 3),
                _ => unreachable!("is_back_edge covers exactly these opcodes"),
            }
            .map_err(|_| TranslationFailure::ControlFlowComplexity)? as usize;

            let target = next
                .checked_sub(back)
                .ok_or(TranslationFailure::ControlFlowComplexity)?;
            if target == header {
                boundaries.insert(next);
                return Ok((next, boundaries));
            }
            // A back-edge to a different header is a nested loop.
            return Err(TranslationFailure::ControlFlowComplexity);
        }

        offset = next;
    }

    Err(TranslationFailure::ControlFlowComplexity)
}

impl Lifter<'_> {
    fn lift_instruction(&mut self, offset: usize) -> Result<(), TranslationFailure> {
        use Opcode::*;

        let op = self
            .chunk
            .opcode_at(offset)
            .map_err(|_| TranslationFailure::ControlFlowComplexity)?;

        match op {
            Nop => {}

            LoadI32Const => self.lift_const(offset, IrKind::I32)?,
            LoadI64Const => self.lift_const(offset, IrKind::I64)?,
            LoadU32Const => self.lift_const(offset, IrKind::U32)?,
            LoadU64Const => self.lift_const(offset, IrKind::U64)?,
            LoadF64Const => self.lift_const(offset, IrKind::F64)?,

            MoveI32 => self.lift_move(offset, IrKind::I32)?,
            MoveI64 => self.lift_move(offset, IrKind::I64)?,
            MoveU32 => self.lift_move(offset, IrKind::U32)?,
            MoveU64 => self.lift_move(offset, IrKind::U64)?,
            MoveF64 => self.lift_move(offset, IrKind::F64)?,

            AddI32 | SubI32 | MulI32 | DivI32 | ModI32 => self.lift_binary(offset, IrKind::I32, op)?,
            AddI64 | SubI64 | MulI64 | DivI64 | ModI64 => self.lift_binary(offset, IrKind::I64, op)?,
            AddU32 | SubU32 | MulU32 | DivU32 | ModU32 => self.lift_binary(offset, IrKind::U32, op)?,
            AddU64 | SubU64 | MulU64 | DivU64 | ModU64 => self.lift_binary(offset, IrKind::U64, op)?,
            AddF64 | SubF64 | MulF64 | DivF64 | ModF64 => self.lift_binary(offset, IrKind::F64, op)?,

            LtI32 | LeI32 | GtI32 | GeI32 => self.lift_compare(offset, IrKind::I32, op)?,
            LtI64 | LeI64 | GtI64 | GeI64 => self.lift_compare(offset, IrKind::I64, op)?,
            LtU32 | LeU32 | GtU32 | GeU32 => self.lift_compare(offset, IrKind::U32, op)?,
            LtU64 | LeU64 | GtU64 | GeU64 => self.lift_compare(offset, IrKind::U64, op)?,
            LtF64 | LeF64 | GtF64 | GeF64 => self.lift_compare(offset, IrKind::F64, op)?,

            JumpIfFalse => self.lift_branch(offset, false, 2)?,
            JumpIfFalseShort => self.lift_branch(offset, false, 1)?,
            JumpIfTrue => self.lift_branch(offset, true, 2)?,
            Jump => self.lift_jump(offset, 2)?,
            JumpShort => self.lift_jump(offset, 1)?,

            Loop => {
                self.ops.push((offset, IrOp::Safepoint));
                self.ops.push((offset, IrOp::LoopBack { target: self.entry }));
            }
            IncCmpJmp => self.lift_fused(offset, true)?,
            DecCmpJmp => self.lift_fused(offset, false)?,

            other => return Err(TranslationFailure::UnsupportedOpcode(other)),
        }

        Ok(())
    }

    fn read_reg(&self, offset: usize) -> Result<u16, TranslationFailure> {
        self.chunk
            .read_u8(offset)
            .map(u16::from)
            .map_err(|_| TranslationFailure::ControlFlowComplexity)
    }

    fn require_kind(&mut self, slot: u16, kind: IrKind) -> Result<(), TranslationFailure> {
        if !kind_allowed(self.stage, kind) {
            return Err(TranslationFailure::UnsupportedValueKind);
        }
        match self.kinds.get(&slot) {
            Some(&known) if known != kind => Err(TranslationFailure::UnsupportedValueKind),
            _ => {
                self.kinds.insert(slot, kind);
                Ok(())
            }
        }
    }

    fn write_slot(&mut self, slot: u16, kind: IrKind) -> Result<(), TranslationFailure> {
        self.require_kind(slot, kind)?;
        self.written.insert(slot);
        Ok(())
    }

    fn check_target(&self, target: usize) -> Result<(), TranslationFailure> {
        if target == self.end || self.boundaries.contains(&target) {
            Ok(())
        } else {
            Err(TranslationFailure::ControlFlowComplexity)
        }
    }

    fn lift_const(&mut self, offset: usize, kind: IrKind) -> Result<(), TranslationFailure> {
        let dst = self.read_reg(offset + 1)?;
        let index = self
            .chunk
            .read_u16(offset + 2)
            .map_err(|_| TranslationFailure::ControlFlowComplexity)? as usize;
        let value = self
            .chunk
            .constant(index)
            .map_err(|_| TranslationFailure::ControlFlowComplexity)?;

        let bits = match (kind, value) {
            (IrKind::I32, Value::I32(v)) => *v as u32 as u64,
            (IrKind::I64, Value::I64(v)) => *v as u64,
            (IrKind::U32, Value::U32(v)) => *v as u64,
            (IrKind::U64, Value::U64(v)) => *v,
            (IrKind::F64, Value::F64(v)) => v.to_bits(),
            _ => return Err(TranslationFailure::UnsupportedValueKind),
        };

        self.write_slot(dst, kind)?;
        self.ops.push((offset, IrOp::LoadConst { kind, dst, bits }));
        Ok(())
    }

    fn lift_move(&mut self, offset: usize, kind: IrKind) -> Result<(), TranslationFailure> {
        let dst = self.read_reg(offset + 1)?;
        let src = self.read_reg(offset + 2)?;
        self.require_kind(src, kind)?;
        self.write_slot(dst, kind)?;
        self.ops.push((offset, IrOp::Move { kind, dst, src }));
        Ok(())
    }

    fn lift_binary(&mut self, offset: usize, kind: IrKind, op: Opcode) -> Result<(), TranslationFailure> {
        let dst = self.read_reg(offset + 1)?;
        let a = self.read_reg(offset + 2)?;
        let b = self.read_reg(offset + 3)?;

        let bin = match op.mnemonic().split('.').next() {
            Some("add") => IrBinOp::Add,
            Some("sub") => IrBinOp::Sub,
            Some("mul") => IrBinOp::Mul,
            Some("div") => IrBinOp::Div,
            Some("mod") => IrBinOp::Mod,
            _ => return Err(TranslationFailure::UnsupportedOpcode(op)),
        };

        // No host backend carries a float remainder sequence.
        if kind == IrKind::F64 && bin == IrBinOp::Mod {
            return Err(TranslationFailure::UnsupportedOpcode(op));
        }

        self.require_kind(a, kind)?;
        self.require_kind(b, kind)?;
        self.write_slot(dst, kind)?;

        if bin.needs_guard(kind) {
            self.guards += 1;
        }
        self.ops.push((
            offset,
            IrOp::Binary {
                kind,
                op: bin,
                dst,
                a,
                b,
            },
        ));
        Ok(())
    }

    fn lift_compare(&mut self, offset: usize, kind: IrKind, op: Opcode) -> Result<(), TranslationFailure> {
        let dst = self.read_reg(offset + 1)?;
        let a = self.read_reg(offset + 2)?;
        let b = self.read_reg(offset + 3)?;

        let cmp = match op.mnemonic().split('.').next() {
            Some("lt") => IrCmpOp::Lt,
            Some("le") => IrCmpOp::Le,
            Some("gt") => IrCmpOp::Gt,
            Some("ge") => IrCmpOp::Ge,
            _ => return Err(TranslationFailure::UnsupportedOpcode(op)),
        };

        self.require_kind(a, kind)?;
        self.require_kind(b, kind)?;
        self.write_slot(dst, IrKind::Bool)?;

        self.ops.push((
            offset,
            IrOp::Compare {
                kind,
                op: cmp,
                dst,
                a,
                b,
            },
        ));
        Ok(())
    }

    fn lift_branch(&mut self, offset: usize, when: bool, width: usize) -> Result<(), TranslationFailure> {
        let cond = self.read_reg(offset + 1)?;
        let delta = if width == 2 {
            self.chunk
                .read_u16(offset + 2)
                .map_err(|_| TranslationFailure::ControlFlowComplexity)? as usize
        } else {
            self.chunk
                .read_u8(offset + 2)
                .map_err(|_| TranslationFailure::ControlFlowComplexity)? as usize
        };

        let next = offset + 2 + width;
        let target = next + delta;
        self.check_target(target)?;
        self.require_kind(cond, IrKind::Bool)?;

        self.ops.push((offset, IrOp::Branch { cond, when, target }));
        Ok(())
    }

    fn lift_jump(&mut self, offset: usize, width: usize) -> Result<(), TranslationFailure> {
        let delta = if width == 2 {
            self.chunk
                .read_u16(offset + 1)
                .map_err(|_| TranslationFailure::ControlFlowComplexity)? as usize
        } else {
            self.chunk
                .read_u8(offset + 1)
                .map_err(|_| TranslationFailure::ControlFlowComplexity)? as usize
        };

        let next = offset + 1 + width;
        let target = next + delta;
        self.check_target(target)?;
        self.ops.push((offset, IrOp::Jump { target }));
        Ok(())
    }

    fn lift_fused(&mut self, offset: usize, increment: bool) -> Result<(), TranslationFailure> {
        let counter = self.read_reg(offset + 1)?;
        let other = self.read_reg(offset + 2)?;

        // Fused counters default to i32 when the block establishes no
        // kind; the install-time tag check keeps the assumption honest.
        let kind = self.kinds.get(&counter).copied().unwrap_or(IrKind::I32);
        if !matches!(kind, IrKind::I32 | IrKind::I64) {
            return Err(TranslationFailure::UnsupportedValueKind);
        }

        self.require_kind(counter, kind)?;
        self.require_kind(other, kind)?;
        self.written.insert(counter);
        self.guards += 1;

        self.ops.push((offset, IrOp::Safepoint));
        if increment {
            self.ops.push((
                offset,
                IrOp::IncCmpJmp {
                    kind,
                    counter,
                    limit: other,
                    target: self.entry,
                },
            ));
        } else {
            self.ops.push((
                offset,
                IrOp::DecCmpJmp {
                    kind,
                    counter,
                    floor: other,
                    target: self.entry,
                },
            ));
        }
        Ok(())
    }
}

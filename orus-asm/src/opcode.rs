use core::fmt;

/// Operand shape of an instruction, as laid out in the code stream.
///
/// Register operands are 1 byte, constant-pool indices and jump offsets are
/// 2 bytes big-endian, short jump offsets are 1 byte and spill ids are
/// 3 bytes big-endian. Backward jumps use the dedicated `Loop`-family
/// opcodes; offsets are always unsigned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperandLayout {
    /// No operands.
    None,
    /// `dst`
    Reg,
    /// `dst, src`
    RegReg,
    /// `dst, a, b`
    RegRegReg,
    /// `dst, k16`
    RegConst,
    /// `off16`
    Off16,
    /// `off8`
    Off8,
    /// `cond, off16`
    RegOff16,
    /// `cond, off8`
    RegOff8,
    /// `a, b, off16`
    RegRegOff16,
    /// `dst, spill24`
    RegSpill,
    /// `spill24, src`
    SpillReg,
    /// `dst, src, imm8`
    RegRegImm8,
    /// `imm8`
    Imm8,
    /// `func, first_arg, argc8, result`
    Call,
    /// `native8, first_arg, argc8, result`
    CallNative,
    /// `func, first_arg, argc8`
    TailCall,
    /// `dst, type_k16, variant_k16, variant_idx8, payload_first, payload_count8`
    MakeEnum,
    /// `dst, func_k16, upvalue_count8` followed by `(is_local8, index8)` pairs.
    Closure,
}

impl OperandLayout {
    /// Encoded operand length in bytes; `None` for variable-length layouts.
    pub const fn len(&self) -> Option<usize> {
        match self {
            Self::None => Some(0),
            Self::Reg | Self::Off8 | Self::Imm8 => Some(1),
            Self::RegReg | Self::RegOff8 => Some(2),
            Self::RegRegReg | Self::RegConst | Self::RegOff16 | Self::RegRegImm8 | Self::TailCall => Some(3),
            Self::Off16 => Some(2),
            Self::RegRegOff16 | Self::RegSpill | Self::SpillReg | Self::Call | Self::CallNative => Some(4),
            Self::MakeEnum => Some(8),
            Self::Closure => None,
        }
    }

    /// Returns `true` if the layout carries no operand bytes.
    pub const fn is_empty(&self) -> bool {
        matches!(self, Self::None)
    }
}

/// Opcode enumeration of the Orus VM.
///
/// The numbering is stable within a build; unknown bytes decode to
/// [`Opcode::Invalid`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::EnumIter)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[repr(u8)]
#[non_exhaustive]
pub enum Opcode {
    /// No operation.
    Nop = 0x00,
    /// Copy `constants[k]` into `dst`.
    LoadConst = 0x01,
    /// Load an `i32` constant straight into the typed bank.
    LoadI32Const = 0x02,
    /// Load an `i64` constant straight into the typed bank.
    LoadI64Const = 0x03,
    /// Load a `u32` constant straight into the typed bank.
    LoadU32Const = 0x04,
    /// Load a `u64` constant straight into the typed bank.
    LoadU64Const = 0x05,
    /// Load an `f64` constant straight into the typed bank.
    LoadF64Const = 0x06,
    /// Load `true` into `dst`.
    LoadTrue = 0x07,
    /// Load `false` into `dst`.
    LoadFalse = 0x08,
    /// Copy the boxed value of `src` into `dst`.
    Move = 0x09,
    /// Copy within the `i32` typed bank.
    MoveI32 = 0x0a,
    /// Copy within the `i64` typed bank.
    MoveI64 = 0x0b,
    /// Copy within the `u32` typed bank.
    MoveU32 = 0x0c,
    /// Copy within the `u64` typed bank.
    MoveU64 = 0x0d,
    /// Copy within the `f64` typed bank.
    MoveF64 = 0x0e,
    /// Copy a spilled value into a primary register.
    SpillLoad = 0x0f,
    /// Copy a primary register into spill storage.
    SpillStore = 0x10,

    /// Checked `i32` addition.
    AddI32 = 0x11,
    /// Checked `i32` subtraction.
    SubI32 = 0x12,
    /// Checked `i32` multiplication.
    MulI32 = 0x13,
    /// Checked `i32` division.
    DivI32 = 0x14,
    /// `i32` remainder; `INT32_MIN % -1` yields zero.
    ModI32 = 0x15,
    /// Checked `i64` addition.
    AddI64 = 0x16,
    /// Checked `i64` subtraction.
    SubI64 = 0x17,
    /// Checked `i64` multiplication.
    MulI64 = 0x18,
    /// Checked `i64` division.
    DivI64 = 0x19,
    /// `i64` remainder; `INT64_MIN % -1` yields zero.
    ModI64 = 0x1a,
    /// Checked `u32` addition.
    AddU32 = 0x1b,
    /// Checked `u32` subtraction.
    SubU32 = 0x1c,
    /// Checked `u32` multiplication.
    MulU32 = 0x1d,
    /// Checked `u32` division.
    DivU32 = 0x1e,
    /// `u32` remainder.
    ModU32 = 0x1f,
    /// Checked `u64` addition.
    AddU64 = 0x20,
    /// Checked `u64` subtraction.
    SubU64 = 0x21,
    /// Checked `u64` multiplication.
    MulU64 = 0x22,
    /// Checked `u64` division.
    DivU64 = 0x23,
    /// `u64` remainder.
    ModU64 = 0x24,
    /// `f64` addition; non-finite results raise.
    AddF64 = 0x25,
    /// `f64` subtraction; non-finite results raise.
    SubF64 = 0x26,
    /// `f64` multiplication; non-finite results raise.
    MulF64 = 0x27,
    /// `f64` division; division by zero raises.
    DivF64 = 0x28,
    /// `f64` remainder.
    ModF64 = 0x29,

    /// Type-dispatched addition over the boxed operands.
    AddNumeric = 0x2a,
    /// Type-dispatched subtraction over the boxed operands.
    SubNumeric = 0x2b,
    /// Type-dispatched multiplication over the boxed operands.
    MulNumeric = 0x2c,
    /// Type-dispatched division over the boxed operands.
    DivNumeric = 0x2d,
    /// Type-dispatched remainder over the boxed operands.
    ModNumeric = 0x2e,
    /// Arithmetic negation.
    Negate = 0x2f,

    /// `i32` less-than.
    LtI32 = 0x30,
    /// `i32` less-or-equal.
    LeI32 = 0x31,
    /// `i32` greater-than.
    GtI32 = 0x32,
    /// `i32` greater-or-equal.
    GeI32 = 0x33,
    /// `i64` less-than.
    LtI64 = 0x34,
    /// `i64` less-or-equal.
    LeI64 = 0x35,
    /// `i64` greater-than.
    GtI64 = 0x36,
    /// `i64` greater-or-equal.
    GeI64 = 0x37,
    /// `u32` less-than.
    LtU32 = 0x38,
    /// `u32` less-or-equal.
    LeU32 = 0x39,
    /// `u32` greater-than.
    GtU32 = 0x3a,
    /// `u32` greater-or-equal.
    GeU32 = 0x3b,
    /// `u64` less-than.
    LtU64 = 0x3c,
    /// `u64` less-or-equal.
    LeU64 = 0x3d,
    /// `u64` greater-than.
    GtU64 = 0x3e,
    /// `u64` greater-or-equal.
    GeU64 = 0x3f,
    /// `f64` less-than.
    LtF64 = 0x40,
    /// `f64` less-or-equal.
    LeF64 = 0x41,
    /// `f64` greater-than.
    GtF64 = 0x42,
    /// `f64` greater-or-equal.
    GeF64 = 0x43,
    /// Structural equality over any pair of values.
    Eq = 0x44,
    /// Structural inequality over any pair of values.
    Ne = 0x45,
    /// Boolean negation.
    Not = 0x46,
    /// Numeric conversion; the third operand names the target kind.
    Convert = 0x47,

    /// Unconditional forward jump, 16-bit offset.
    Jump = 0x48,
    /// Unconditional forward jump, 8-bit offset.
    JumpShort = 0x49,
    /// Forward jump when the condition register holds `false`.
    JumpIfFalse = 0x4a,
    /// Short forward jump when the condition register holds `false`.
    JumpIfFalseShort = 0x4b,
    /// Forward jump when the condition register holds `true`.
    JumpIfTrue = 0x4c,
    /// Backward jump; the offset is subtracted from the instruction pointer.
    Loop = 0x4d,
    /// Fused increment-compare-branch in the typed bank.
    IncCmpJmp = 0x4e,
    /// Fused decrement-compare-branch in the typed bank.
    DecCmpJmp = 0x4f,

    /// Call the function or closure held in a register.
    Call = 0x50,
    /// Call a native function by table index.
    CallNative = 0x51,
    /// Call reusing the current frame.
    TailCall = 0x52,
    /// Return a register to the caller.
    Return = 0x53,
    /// Return without a value.
    ReturnVoid = 0x54,

    /// Bundle a function with captured upvalues.
    Closure = 0x55,
    /// Read through a closure upvalue.
    GetUpvalue = 0x56,
    /// Write through a closure upvalue.
    SetUpvalue = 0x57,
    /// Promote the open upvalue at a register slot to closed.
    CloseUpvalue = 0x58,

    /// Push a try frame.
    SetupExcept = 0x59,
    /// Pop the topmost try frame.
    PopExcept = 0x5a,
    /// Raise the error value held in a register.
    Raise = 0x5b,

    /// Increment the GC pause counter.
    GcPause = 0x5c,
    /// Decrement the GC pause counter.
    GcResume = 0x5d,

    /// String concatenation; builds a rope above the flattening threshold.
    Concat = 0x5e,
    /// Render any value to a string.
    ToString = 0x5f,

    /// Gather a register window into a fresh array.
    MakeArray = 0x60,
    /// Bounds-checked array read.
    ArrayGet = 0x61,
    /// Bounds-checked array write.
    ArraySet = 0x62,
    /// Array length.
    ArrayLen = 0x63,
    /// Append to an array.
    ArrayPush = 0x64,

    /// Construct a range value.
    MakeRange = 0x65,
    /// Produce an iterator over an array or range.
    GetIter = 0x66,
    /// Advance an iterator, jumping past the loop on exhaustion.
    IterNext = 0x67,

    /// Construct an enum instance with a payload register window.
    MakeEnum = 0x68,
    /// Variant index of an enum instance.
    EnumTag = 0x69,
    /// Payload element of an enum instance.
    EnumPayload = 0x6a,

    /// Select the active module register window.
    SelectModule = 0x6b,

    /// Print a register through the VM output sink.
    Print = 0x6c,
    /// Stop the VM. Not catchable by try frames.
    Halt = 0x6d,

    /// The byte can't be mapped to any known opcode.
    Invalid = 0xff,
}

impl Opcode {
    /// Operand layout of this opcode.
    pub const fn layout(&self) -> OperandLayout {
        use Opcode::*;

        match self {
            Nop | ReturnVoid | PopExcept | GcPause | GcResume | Halt | Invalid => OperandLayout::None,

            LoadTrue | LoadFalse => OperandLayout::Reg,
            Return | Raise | CloseUpvalue | Print => OperandLayout::Reg,
            SelectModule => OperandLayout::Imm8,

            Move | MoveI32 | MoveI64 | MoveU32 | MoveU64 | MoveF64 => OperandLayout::RegReg,
            Negate | Not | ToString | GetIter | ArrayLen | EnumTag | GetUpvalue | SetUpvalue | ArrayPush => {
                OperandLayout::RegReg
            }

            LoadConst | LoadI32Const | LoadI64Const | LoadU32Const | LoadU64Const | LoadF64Const => {
                OperandLayout::RegConst
            }

            AddI32 | SubI32 | MulI32 | DivI32 | ModI32 | AddI64 | SubI64 | MulI64 | DivI64 | ModI64 | AddU32
            | SubU32 | MulU32 | DivU32 | ModU32 | AddU64 | SubU64 | MulU64 | DivU64 | ModU64 | AddF64 | SubF64
            | MulF64 | DivF64 | ModF64 | AddNumeric | SubNumeric | MulNumeric | DivNumeric | ModNumeric => {
                OperandLayout::RegRegReg
            }

            LtI32 | LeI32 | GtI32 | GeI32 | LtI64 | LeI64 | GtI64 | GeI64 | LtU32 | LeU32 | GtU32 | GeU32
            | LtU64 | LeU64 | GtU64 | GeU64 | LtF64 | LeF64 | GtF64 | GeF64 | Eq | Ne => OperandLayout::RegRegReg,

            Concat | MakeArray | ArrayGet | ArraySet | MakeRange | EnumPayload => OperandLayout::RegRegReg,

            Convert => OperandLayout::RegRegImm8,

            Jump | Loop => OperandLayout::Off16,
            JumpShort => OperandLayout::Off8,
            JumpIfFalse | JumpIfTrue | SetupExcept => OperandLayout::RegOff16,
            JumpIfFalseShort => OperandLayout::RegOff8,
            IncCmpJmp | DecCmpJmp | IterNext => OperandLayout::RegRegOff16,

            SpillLoad => OperandLayout::RegSpill,
            SpillStore => OperandLayout::SpillReg,

            Call => OperandLayout::Call,
            CallNative => OperandLayout::CallNative,
            TailCall => OperandLayout::TailCall,
            MakeEnum => OperandLayout::MakeEnum,
            Closure => OperandLayout::Closure,
        }
    }

    /// Mnemonic used by the disassembler and trace output.
    pub const fn mnemonic(&self) -> &'static str {
        use Opcode::*;

        match self {
            Nop => "nop",
            LoadConst => "load.const",
            LoadI32Const => "load.i32",
            LoadI64Const => "load.i64",
            LoadU32Const => "load.u32",
            LoadU64Const => "load.u64",
            LoadF64Const => "load.f64",
            LoadTrue => "load.true",
            LoadFalse => "load.false",
            Move => "move",
            MoveI32 => "move.i32",
            MoveI64 => "move.i64",
            MoveU32 => "move.u32",
            MoveU64 => "move.u64",
            MoveF64 => "move.f64",
            SpillLoad => "spill.load",
            SpillStore => "spill.store",
            AddI32 => "add.i32",
            SubI32 => "sub.i32",
            MulI32 => "mul.i32",
            DivI32 => "div.i32",
            ModI32 => "mod.i32",
            AddI64 => "add.i64",
            SubI64 => "sub.i64",
            MulI64 => "mul.i64",
            DivI64 => "div.i64",
            ModI64 => "mod.i64",
            AddU32 => "add.u32",
            SubU32 => "sub.u32",
            MulU32 => "mul.u32",
            DivU32 => "div.u32",
            ModU32 => "mod.u32",
            AddU64 => "add.u64",
            SubU64 => "sub.u64",
            MulU64 => "mul.u64",
            DivU64 => "div.u64",
            ModU64 => "mod.u64",
            AddF64 => "add.f64",
            SubF64 => "sub.f64",
            MulF64 => "mul.f64",
            DivF64 => "div.f64",
            ModF64 => "mod.f64",
            AddNumeric => "add",
            SubNumeric => "sub",
            MulNumeric => "mul",
            DivNumeric => "div",
            ModNumeric => "mod",
            Negate => "neg",
            LtI32 => "lt.i32",
            LeI32 => "le.i32",
            GtI32 => "gt.i32",
            GeI32 => "ge.i32",
            LtI64 => "lt.i64",
            LeI64 => "le.i64",
            GtI64 => "gt.i64",
            GeI64 => "ge.i64",
            LtU32 => "lt.u32",
            LeU32 => "le.u32",
            GtU32 => "gt.u32",
            GeU32 => "ge.u32",
            LtU64 => "lt.u64",
            LeU64 => "le.u64",
            GtU64 => "gt.u64",
            GeU64 => "ge.u64",
            LtF64 => "lt.f64",
            LeF64 => "le.f64",
            GtF64 => "gt.f64",
            GeF64 => "ge.f64",
            Eq => "eq",
            Ne => "ne",
            Not => "not",
            Convert => "conv",
            Jump => "jmp",
            JumpShort => "jmp.s",
            JumpIfFalse => "jf",
            JumpIfFalseShort => "jf.s",
            JumpIfTrue => "jt",
            Loop => "loop",
            IncCmpJmp => "inc.cmp.jmp",
            DecCmpJmp => "dec.cmp.jmp",
            Call => "call",
            CallNative => "call.native",
            TailCall => "tail.call",
            Return => "ret",
            ReturnVoid => "ret.void",
            Closure => "closure",
            GetUpvalue => "upval.get",
            SetUpvalue => "upval.set",
            CloseUpvalue => "upval.close",
            SetupExcept => "try.push",
            PopExcept => "try.pop",
            Raise => "raise",
            GcPause => "gc.pause",
            GcResume => "gc.resume",
            Concat => "concat",
            ToString => "str",
            MakeArray => "arr.make",
            ArrayGet => "arr.get",
            ArraySet => "arr.set",
            ArrayLen => "arr.len",
            ArrayPush => "arr.push",
            MakeRange => "range",
            GetIter => "iter",
            IterNext => "iter.next",
            MakeEnum => "enum.make",
            EnumTag => "enum.tag",
            EnumPayload => "enum.payload",
            SelectModule => "module",
            Print => "print",
            Halt => "halt",
            Invalid => "invalid",
        }
    }

    /// Returns `true` for the opcodes that transfer control backwards.
    ///
    /// These are the loop back-edges: the dispatch loop treats them as
    /// safepoints and consults the JIT entry cache when executing them.
    pub const fn is_back_edge(&self) -> bool {
        matches!(self, Self::Loop | Self::IncCmpJmp | Self::DecCmpJmp)
    }

    /// Returns `true` for opcodes that may allocate on the heap.
    pub const fn may_allocate(&self) -> bool {
        matches!(
            self,
            Self::Concat
                | Self::ToString
                | Self::MakeArray
                | Self::ArrayPush
                | Self::MakeRange
                | Self::GetIter
                | Self::MakeEnum
                | Self::Closure
                | Self::CloseUpvalue
                | Self::AddNumeric
                | Self::Raise
        )
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.mnemonic())
    }
}

impl From<u8> for Opcode {
    fn from(b: u8) -> Self {
        use Opcode::*;
        match b {
            0x00 => Nop,
            0x01 => LoadConst,
            0x02 => LoadI32Const,
            0x03 => LoadI64Const,
            0x04 => LoadU32Const,
            0x05 => LoadU64Const,
            0x06 => LoadF64Const,
            0x07 => LoadTrue,
            0x08 => LoadFalse,
            0x09 => Move,
            0x0a => MoveI32,
            0x0b => MoveI64,
            0x0c => MoveU32,
            0x0d => MoveU64,
            0x0e => MoveF64,
            0x0f => SpillLoad,
            0x10 => SpillStore,
            0x11 => AddI32,
            0x12 => SubI32,
            0x13 => MulI32,
            0x14 => DivI32,
            0x15 => ModI32,
            0x16 => AddI64,
            0x17 => SubI64,
            0x18 => MulI64,
            0x19 => DivI64,
            0x1a => ModI64,
            0x1b => AddU32,
            0x1c => SubU32,
            0x1d => MulU32,
            0x1e => DivU32,
            0x1f => ModU32,
            0x20 => AddU64,
            0x21 => SubU64,
            0x22 => MulU64,
            0x23 => DivU64,
            0x24 => ModU64,
            0x25 => AddF64,
            0x26 => SubF64,
            0x27 => MulF64,
            0x28 => DivF64,
            0x29 => ModF64,
            0x2a => AddNumeric,
            0x2b => SubNumeric,
            0x2c => MulNumeric,
            0x2d => DivNumeric,
            0x2e => ModNumeric,
            0x2f => Negate,
            0x30 => LtI32,
            0x31 => LeI32,
            0x32 => GtI32,
            0x33 => GeI32,
            0x34 => LtI64,
            0x35 => LeI64,
            0x36 => GtI64,
            0x37 => GeI64,
            0x38 => LtU32,
            0x39 => LeU32,
            0x3a => GtU32,
            0x3b => GeU32,
            0x3c => LtU64,
            0x3d => LeU64,
            0x3e => GtU64,
            0x3f => GeU64,
            0x40 => LtF64,
            0x41 => LeF64,
            0x42 => GtF64,
            0x43 => GeF64,
            0x44 => Eq,
            0x45 => Ne,
            0x46 => Not,
            0x47 => Convert,
            0x48 => Jump,
            0x49 => JumpShort,
            0x4a => JumpIfFalse,
            0x4b => JumpIfFalseShort,
            0x4c => JumpIfTrue,
            0x4d => Loop,
            0x4e => IncCmpJmp,
            0x4f => DecCmpJmp,
            0x50 => Call,
            0x51 => CallNative,
            0x52 => TailCall,
            0x53 => Return,
            0x54 => ReturnVoid,
            0x55 => Closure,
            0x56 => GetUpvalue,
            0x57 => SetUpvalue,
            0x58 => CloseUpvalue,
            0x59 => SetupExcept,
            0x5a => PopExcept,
            0x5b => Raise,
            0x5c => GcPause,
            0x5d => GcResume,
            0x5e => Concat,
            0x5f => ToString,
            0x60 => MakeArray,
            0x61 => ArrayGet,
            0x62 => ArraySet,
            0x63 => ArrayLen,
            0x64 => ArrayPush,
            0x65 => MakeRange,
            0x66 => GetIter,
            0x67 => IterNext,
            0x68 => MakeEnum,
            0x69 => EnumTag,
            0x6a => EnumPayload,
            0x6b => SelectModule,
            0x6c => Print,
            0x6d => Halt,
            _ => Invalid,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strum::IntoEnumIterator;

    #[test]
    fn opcode_byte_round_trip() {
        for op in Opcode::iter() {
            if op == Opcode::Invalid {
                continue;
            }
            let b = op as u8;
            assert_eq!(Opcode::from(b), op, "byte 0x{b:02x} must decode to {op:?}");
        }
    }

    #[test]
    fn unknown_bytes_decode_to_invalid() {
        for b in 0x6eu8..0xff {
            assert_eq!(Opcode::from(b), Opcode::Invalid);
        }
    }

    #[test]
    fn fixed_layouts_have_length() {
        for op in Opcode::iter() {
            if op == Opcode::Closure {
                assert!(op.layout().len().is_none());
            } else {
                assert!(op.layout().len().is_some(), "{op:?} must have a fixed layout");
            }
        }
    }
}

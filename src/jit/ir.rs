//! Typed three-address IR for linear hot loops
//!
//! Every op carries the bytecode offset it was lifted from so deopt exits
//! can restore the interpreter ip exactly. Branch targets are bytecode
//! offsets; the backends map them to code labels.

/// Value kind of an IR operand slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IrKind {
    /// 32-bit signed integer.
    I32,
    /// 64-bit signed integer.
    I64,
    /// 32-bit unsigned integer.
    U32,
    /// 64-bit unsigned integer.
    U64,
    /// IEEE-754 double.
    F64,
    /// Boolean, one byte per slot.
    Bool,
}

/// Arithmetic selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IrBinOp {
    /// Checked addition.
    Add,
    /// Checked subtraction.
    Sub,
    /// Checked multiplication.
    Mul,
    /// Checked division.
    Div,
    /// Checked remainder.
    Mod,
}

impl IrBinOp {
    /// Whether this op needs a deopt guard for the given kind.
    pub const fn needs_guard(&self, kind: IrKind) -> bool {
        match kind {
            IrKind::F64 => true,
            IrKind::Bool => false,
            _ => true,
        }
    }
}

/// Comparison selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IrCmpOp {
    /// Less-than.
    Lt,
    /// Less-or-equal.
    Le,
    /// Greater-than.
    Gt,
    /// Greater-or-equal.
    Ge,
}

/// One IR operation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum IrOp {
    /// Copy within a typed bank.
    Move {
        /// Operand kind.
        kind: IrKind,
        /// Destination slot.
        dst: u16,
        /// Source slot.
        src: u16,
    },
    /// Materialize a constant into a typed slot; `bits` is the raw
    /// payload.
    LoadConst {
        /// Operand kind.
        kind: IrKind,
        /// Destination slot.
        dst: u16,
        /// Raw constant bits.
        bits: u64,
    },
    /// Checked arithmetic; faults deoptimize.
    Binary {
        /// Operand kind.
        kind: IrKind,
        /// Operation.
        op: IrBinOp,
        /// Destination slot.
        dst: u16,
        /// Left operand slot.
        a: u16,
        /// Right operand slot.
        b: u16,
    },
    /// Comparison into a boolean slot.
    Compare {
        /// Operand kind.
        kind: IrKind,
        /// Operation.
        op: IrCmpOp,
        /// Boolean destination slot.
        dst: u16,
        /// Left operand slot.
        a: u16,
        /// Right operand slot.
        b: u16,
    },
    /// Conditional forward branch on a boolean slot.
    Branch {
        /// Boolean condition slot.
        cond: u16,
        /// Branch when the condition equals this.
        when: bool,
        /// Bytecode target offset.
        target: usize,
    },
    /// Unconditional forward jump.
    Jump {
        /// Bytecode target offset.
        target: usize,
    },
    /// Fused increment-compare-branch; branches back while
    /// `counter < limit`.
    IncCmpJmp {
        /// Operand kind (integer).
        kind: IrKind,
        /// Counter slot.
        counter: u16,
        /// Limit slot.
        limit: u16,
        /// Back-edge bytecode target.
        target: usize,
    },
    /// Fused decrement-compare-branch; branches back while
    /// `counter > floor`.
    DecCmpJmp {
        /// Operand kind (integer).
        kind: IrKind,
        /// Counter slot.
        counter: u16,
        /// Floor slot.
        floor: u16,
        /// Back-edge bytecode target.
        target: usize,
    },
    /// Logical safepoint marker; compiled blocks cannot allocate, so the
    /// backends emit nothing for it.
    Safepoint,
    /// Unconditional loop back-edge.
    LoopBack {
        /// Bytecode target offset, always the loop entry.
        target: usize,
    },
}

/// A lifted linear loop.
#[derive(Debug, Clone)]
pub struct IrLoop {
    /// Loop header bytecode offset.
    pub entry: usize,
    /// First bytecode offset past the back-edge instruction; the
    /// completion exit resumes here.
    pub end: usize,
    /// Ops paired with their originating bytecode offsets.
    pub ops: Vec<(usize, IrOp)>,
    /// Every referenced slot with the kind the code assumes for it;
    /// verified against the typed tags at install time.
    pub kinds: Vec<(u16, IrKind)>,
    /// Slots the compiled code writes.
    pub written: Vec<u16>,
    /// Number of deopt guards.
    pub guards: usize,
}

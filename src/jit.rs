//! Tiered execution pipeline
//!
//! Hot loops detected by the profiler are lifted into a small typed IR,
//! compiled by the host-architecture backend into an executable page and
//! cached per `(function id, loop header)`. Compiled code exits either
//! past the loop or through the deoptimization protocol, which restores
//! the interpreter ip and invalidates the entry.

use orus_asm::{Chunk, Opcode};

use std::collections::HashMap;
use std::fmt;

use crate::consts::JIT_COOLDOWN_TRIGGERS;
use crate::params::JitRolloutStage;
use crate::value::Value;

mod backend;
mod exec;
mod ir;
mod translate;

pub use exec::ExecutableCode;
pub use ir::{IrBinOp, IrCmpOp, IrKind, IrLoop, IrOp};

/// Exit code written by native code: the loop completed.
pub const JIT_EXIT_COMPLETED: u32 = 0;
/// Exit code written by native code: deoptimize and resume interpretation.
pub const JIT_EXIT_DEOPT: u32 = 1;
/// Exit code written by native code: the iteration budget ran out; the
/// interpreter resumes at the loop header, runs its back-edge accounting
/// (loop-safety guard, profiler) and may re-enter.
pub const JIT_EXIT_YIELD: u32 = 2;

/// Deopt reason: checked arithmetic would fault; the interpreter re-runs
/// the instruction to raise the structured error.
pub const DEOPT_ARITHMETIC: u32 = 1;

/// VM state view passed to compiled code.
///
/// Layout is load-bearing: backends bake the field offsets below into
/// generated code, and the static assertions pin them at build time.
#[repr(C)]
#[derive(Debug)]
pub struct JitState {
    /// Base of the `i32` typed bank.
    pub i32s: *mut i32,
    /// Base of the `i64` typed bank.
    pub i64s: *mut i64,
    /// Base of the `u32` typed bank.
    pub u32s: *mut u32,
    /// Base of the `u64` typed bank.
    pub u64s: *mut u64,
    /// Base of the `f64` typed bank.
    pub f64s: *mut f64,
    /// Base of the boolean typed bank, one byte per slot.
    pub bools: *mut u8,
    /// In: loop header offset. Out: resume offset.
    pub ip: u64,
    /// [`JIT_EXIT_COMPLETED`], [`JIT_EXIT_DEOPT`] or [`JIT_EXIT_YIELD`].
    pub exit: u32,
    /// Deopt reason code; 0 on completion.
    pub deopt_reason: u32,
    /// In: back-edge iteration budget. Decremented per back-edge taken;
    /// native code yields at zero so the interpreter's progressive loop
    /// guard keeps observing iteration counts.
    pub budget: u64,
}

/// Byte offsets of [`JitState`] fields, shared with the backends.
pub(crate) mod state_layout {
    pub const I32S: i32 = 0;
    pub const I64S: i32 = 8;
    pub const U32S: i32 = 16;
    pub const U64S: i32 = 24;
    pub const F64S: i32 = 32;
    pub const BOOLS: i32 = 40;
    pub const IP: i32 = 48;
    pub const EXIT: i32 = 56;
    pub const DEOPT_REASON: i32 = 60;
    pub const BUDGET: i32 = 64;
}

static_assertions::const_assert_eq!(core::mem::offset_of!(JitState, i32s), state_layout::I32S as usize);
static_assertions::const_assert_eq!(core::mem::offset_of!(JitState, i64s), state_layout::I64S as usize);
static_assertions::const_assert_eq!(core::mem::offset_of!(JitState, u32s), state_layout::U32S as usize);
static_assertions::const_assert_eq!(core::mem::offset_of!(JitState, u64s), state_layout::U64S as usize);
static_assertions::const_assert_eq!(core::mem::offset_of!(JitState, f64s), state_layout::F64S as usize);
static_assertions::const_assert_eq!(core::mem::offset_of!(JitState, bools), state_layout::BOOLS as usize);
static_assertions::const_assert_eq!(core::mem::offset_of!(JitState, ip), state_layout::IP as usize);
static_assertions::const_assert_eq!(core::mem::offset_of!(JitState, exit), state_layout::EXIT as usize);
static_assertions::const_assert_eq!(
    core::mem::offset_of!(JitState, deopt_reason),
    state_layout::DEOPT_REASON as usize
);
static_assertions::const_assert_eq!(core::mem::offset_of!(JitState, budget), state_layout::BUDGET as usize);

/// Signature of a compiled loop entry point.
pub type JitEntryFn = unsafe extern "C" fn(*mut JitState);

/// Why a loop failed to translate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum TranslationFailure {
    /// The block contains an opcode outside the translatable subset.
    UnsupportedOpcode(Opcode),
    /// A value kind is gated out by the rollout stage or cannot be typed.
    UnsupportedValueKind,
    /// Joins, nested loops or block-size limits.
    ControlFlowComplexity,
    /// More deopt guards than the configured ceiling.
    GuardLimit,
    /// The executable-page allocator failed.
    AllocatorExhaustion,
}

impl fmt::Display for TranslationFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnsupportedOpcode(op) => write!(f, "unsupported opcode `{op}`"),
            Self::UnsupportedValueKind => f.write_str("unsupported value kind"),
            Self::ControlFlowComplexity => f.write_str("control-flow complexity"),
            Self::GuardLimit => f.write_str("guard limit"),
            Self::AllocatorExhaustion => f.write_str("allocator exhaustion"),
        }
    }
}

/// One recorded translation failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailureRecord {
    /// Function the loop belongs to.
    pub function: u32,
    /// Loop header offset.
    pub loop_header: u32,
    /// Failure category.
    pub failure: TranslationFailure,
}

/// Output of the backend for one loop.
#[derive(Debug)]
pub struct CompiledLoop {
    pub(crate) code: ExecutableCode,
    /// Every typed slot the code touches, with the kind baked into the
    /// generated code. Verified against the live typed tags at install.
    pub kinds: Vec<(u16, IrKind)>,
    /// Slots the code writes; marked dirty after each native run.
    pub written: Vec<u16>,
    /// Symbolic name for trace output.
    pub debug_name: String,
}

/// A live entry of the cache.
pub struct JitEntry {
    code: ExecutableCode,
    generation: u32,
    debug_name: String,
    guard_slots: Vec<(u16, u32)>,
    written_slots: Vec<u16>,
}

impl JitEntry {
    /// Monotonic generation this entry was installed with.
    pub fn generation(&self) -> u32 {
        self.generation
    }

    /// Raw entry point. The caller must uphold the [`JitState`] contract.
    pub fn entry_fn(&self) -> JitEntryFn {
        self.code.entry_fn()
    }

    /// Typed slots with the branch-cache generations captured at install.
    pub fn guard_slots(&self) -> &[(u16, u32)] {
        &self.guard_slots
    }

    /// Slots native code writes.
    pub fn written_slots(&self) -> &[u16] {
        &self.written_slots
    }

    /// Code size in bytes.
    pub fn code_size(&self) -> usize {
        self.code.len()
    }

    /// Symbolic name for trace output.
    pub fn debug_name(&self) -> &str {
        &self.debug_name
    }
}

impl fmt::Debug for JitEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "JitEntry({}, gen={}, {} bytes)",
            self.debug_name,
            self.generation,
            self.code.len()
        )
    }
}

/// Entry cache and translation bookkeeping.
#[derive(Debug, Default)]
pub struct JitEngine {
    entries: HashMap<(u32, u32), JitEntry>,
    cooldown: HashMap<(u32, u32), u32>,
    failures: Vec<FailureRecord>,
    next_generation: u32,
    stage: JitRolloutStage,
}

impl JitEngine {
    /// Engine for the given rollout stage.
    pub fn new(stage: JitRolloutStage) -> Self {
        Self {
            stage,
            ..Self::default()
        }
    }

    /// Rollout stage gating the IR value kinds.
    pub fn stage(&self) -> JitRolloutStage {
        self.stage
    }

    /// Returns `true` when this build and configuration can compile.
    pub fn enabled(&self) -> bool {
        backend::HOST_SUPPORTED && self.stage != JitRolloutStage::Off
    }

    /// Live entry for `(function, loop header)`.
    pub fn entry(&self, function: u32, loop_header: u32) -> Option<&JitEntry> {
        self.entries.get(&(function, loop_header))
    }

    /// Number of live entries.
    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    /// Gate a translation attempt: false while an entry exists or the
    /// loop is cooling down after a failure.
    pub fn begin_translation(&mut self, function: u32, loop_header: u32) -> bool {
        let key = (function, loop_header);
        if self.entries.contains_key(&key) {
            return false;
        }
        match self.cooldown.get_mut(&key) {
            Some(0) | None => true,
            Some(n) => {
                *n -= 1;
                false
            }
        }
    }

    /// Install compiled code, returning its generation.
    pub fn install(
        &mut self,
        function: u32,
        loop_header: u32,
        compiled: CompiledLoop,
        guard_slots: Vec<(u16, u32)>,
    ) -> u32 {
        self.next_generation = self.next_generation.wrapping_add(1);
        let generation = self.next_generation;

        self.cooldown.remove(&(function, loop_header));
        self.entries.insert(
            (function, loop_header),
            JitEntry {
                code: compiled.code,
                generation,
                debug_name: compiled.debug_name,
                guard_slots,
                written_slots: compiled.written,
            },
        );
        generation
    }

    /// Log a failure and cool the loop down.
    pub fn record_failure(&mut self, function: u32, loop_header: u32, failure: TranslationFailure) {
        self.failures.push(FailureRecord {
            function,
            loop_header,
            failure,
        });
        self.cooldown.insert((function, loop_header), JIT_COOLDOWN_TRIGGERS);
    }

    /// Drop an entry when the trigger's generation matches it.
    ///
    /// A stale trigger (older generation) leaves a newer entry alone.
    pub fn invalidate(&mut self, function: u32, loop_header: u32, generation: u32) {
        let key = (function, loop_header);
        if self.entries.get(&key).map(JitEntry::generation) == Some(generation) {
            self.entries.remove(&key);
        }
    }

    /// Drop every entry belonging to a function; used on bytecode edits.
    pub fn invalidate_function(&mut self, function: u32) {
        self.entries.retain(|&(f, _), _| f != function);
        self.cooldown.retain(|&(f, _), _| f != function);
    }

    /// Drop everything; used at VM shutdown.
    pub fn flush(&mut self) {
        self.entries.clear();
        self.cooldown.clear();
    }

    /// The translation failure log.
    pub fn failures(&self) -> &[FailureRecord] {
        &self.failures
    }
}

/// Lift and compile a hot loop starting at `header`.
pub fn compile_loop(
    chunk: &Chunk<Value>,
    header: usize,
    stage: JitRolloutStage,
) -> Result<CompiledLoop, TranslationFailure> {
    let ir = translate::lift(chunk, header, stage)?;
    backend::emit(&ir)
}

#[cfg(all(
    test,
    unix,
    any(target_arch = "x86_64", target_arch = "aarch64", target_arch = "riscv64")
))]
mod tests {
    use super::*;

    fn fake_compiled() -> CompiledLoop {
        // A single `ret` is enough to own an executable page in tests.
        let code = ExecutableCode::new(&backend::RETURN_STUB).expect("exec page");
        CompiledLoop {
            code,
            kinds: vec![(64, IrKind::I32)],
            written: vec![64],
            debug_name: "test-loop".into(),
        }
    }

    #[test]
    fn install_lookup_invalidate_round_trip() {
        let mut engine = JitEngine::new(JitRolloutStage::Full);
        let generation = engine.install(1, 8, fake_compiled(), vec![(64, 0)]);

        assert!(engine.entry(1, 8).is_some());
        assert_eq!(engine.entry(1, 8).unwrap().generation(), generation);

        // Stale trigger: no effect.
        engine.invalidate(1, 8, generation.wrapping_sub(1));
        assert!(engine.entry(1, 8).is_some());

        engine.invalidate(1, 8, generation);
        assert!(engine.entry(1, 8).is_none());
    }

    #[test]
    fn generations_increase_across_installs() {
        let mut engine = JitEngine::new(JitRolloutStage::Full);
        let g1 = engine.install(1, 8, fake_compiled(), vec![]);
        engine.invalidate(1, 8, g1);
        let g2 = engine.install(1, 8, fake_compiled(), vec![]);
        assert!(g2 > g1);
    }

    #[test]
    fn failures_cool_the_loop_down() {
        let mut engine = JitEngine::new(JitRolloutStage::Full);
        assert!(engine.begin_translation(2, 16));

        engine.record_failure(2, 16, TranslationFailure::ControlFlowComplexity);
        for _ in 0..JIT_COOLDOWN_TRIGGERS {
            assert!(!engine.begin_translation(2, 16));
        }
        assert!(engine.begin_translation(2, 16));
        assert_eq!(engine.failures().len(), 1);
    }

    #[test]
    fn flush_drops_all_entries() {
        let mut engine = JitEngine::new(JitRolloutStage::Full);
        engine.install(1, 8, fake_compiled(), vec![]);
        engine.install(2, 4, fake_compiled(), vec![]);
        engine.flush();
        assert_eq!(engine.entry_count(), 0);
    }
}

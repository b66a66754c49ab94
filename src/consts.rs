//! VM parameters and register-file layout
//!
//! The primary register window is 256 slots split into four banks with
//! disjoint id ranges; everything above it is served by the spill manager.

pub use orus_asm::SPILL_REG_START;

/* REGISTER BANKS */

/// Number of process-wide global registers.
pub const GLOBAL_REGISTERS: usize = 64;

/// First register id of the per-frame bank.
pub const FRAME_REG_START: usize = 64;

/// Number of registers in the per-frame bank.
pub const FRAME_REGISTERS: usize = 128;

/// First register id of the expression-scratch bank.
pub const TEMP_REG_START: usize = 192;

/// Number of registers in the expression-scratch bank.
pub const TEMP_REGISTERS: usize = 48;

/// First register id of the per-module window.
pub const MODULE_REG_START: usize = 240;

/// Number of registers in the per-module window.
pub const MODULE_REGISTERS: usize = 16;

/// Total size of the primary register window.
pub const PRIMARY_REGISTERS: usize = 256;

/// Slots saved and restored around a call: the frame and temp banks.
pub const FRAME_WINDOW: usize = FRAME_REGISTERS + TEMP_REGISTERS;

/* LIMITS */

/// Maximum call-frame depth before a Recursion error is raised.
pub const VM_MAX_CALL_DEPTH: usize = 1024;

/// Maximum consecutive hot opcodes tracked by the fusion window.
pub const VM_MAX_FUSION_WINDOW: usize = 8;

/// Soft capacity of the spill manager before eviction candidates surface.
pub const SPILL_SOFT_CAPACITY: usize = 512;

/* STRINGS */

/// Concatenations at or below this byte length are flattened eagerly;
/// longer results become ropes.
pub const ROPE_THRESHOLD: usize = 64;

/// Strings up to this byte length participate in interning.
pub const INTERN_MAX_LEN: usize = 64;

/* GC */

/// Initial allocation threshold that triggers a collection.
pub const DEFAULT_GC_THRESHOLD: usize = 1024 * 1024;

/// Threshold growth factor after a collection.
pub const GC_GROWTH_FACTOR: usize = 2;

/* TIERING */

/// Cumulative instruction count that declares a code path hot.
pub const DEFAULT_HOT_INSTRUCTION_THRESHOLD: u64 = 1_000;

/// Cumulative loop iterations that declare a loop hot.
pub const DEFAULT_HOT_LOOP_THRESHOLD: u64 = 10_000;

/* LOOP SAFETY */

/// Sampling stride of the progressive loop guard.
pub const DEFAULT_LOOP_GUARD_STRIDE: u64 = 100_000;

/// Iteration count at which the progressive guard warns once.
pub const DEFAULT_LOOP_WARN_AT: u64 = 1_000_000;

/// Iteration count at which the progressive guard raises; 0 disables the
/// guard entirely.
pub const DEFAULT_MAX_ITERATIONS: u64 = 10_000_000;

/* JIT */

/// Maximum bytecode instructions lifted into one IR block.
pub const JIT_MAX_BLOCK_OPS: usize = 128;

/// Maximum guards (deopt exits) allowed in one compiled block.
pub const JIT_MAX_GUARDS: usize = 16;

/// Translation attempts after a failure are suppressed for this many
/// additional hot-loop triggers.
pub const JIT_COOLDOWN_TRIGGERS: u32 = 8;

//! VM configuration
//!
//! A [`VmParameters`] value is threaded into the interpreter constructor;
//! nothing here is global state. [`VmParameters::from_env`] layers the
//! environment overrides of the embedding contract on top of the defaults.

use bitflags::bitflags;
use std::env;

use crate::consts::*;

bitflags! {
    /// Profiling feature flags.
    #[derive(Default)]
    pub struct ProfilingFlags: u8 {
        /// Per-opcode instruction counters.
        const INSTRUCTIONS = 0x01;
        /// Hot-path detection.
        const HOT_PATHS = 0x02;
        /// Branch outcome sampling.
        const BRANCH_PREDICTION = 0x04;
        /// Function call counters.
        const FUNCTION_CALLS = 0x08;
        /// Register bank usage sampling.
        const REGISTER_USAGE = 0x10;
        /// Memory access sampling.
        const MEMORY_ACCESS = 0x20;
    }
}

impl ProfilingFlags {
    fn parse_list(list: &str) -> Self {
        list.split(',')
            .map(str::trim)
            .fold(Self::empty(), |flags, name| match name {
                "instructions" => flags | Self::INSTRUCTIONS,
                "hot-paths" => flags | Self::HOT_PATHS,
                "branch-prediction" => flags | Self::BRANCH_PREDICTION,
                "function-calls" => flags | Self::FUNCTION_CALLS,
                "register-usage" => flags | Self::REGISTER_USAGE,
                "memory-access" => flags | Self::MEMORY_ACCESS,
                _ => flags,
            })
    }
}

/// JIT rollout stage, gating the value kinds admitted into the IR.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[repr(u8)]
pub enum JitRolloutStage {
    /// JIT disabled.
    Off = 0,
    /// `i32` loops only.
    I32Only = 1,
    /// All integer kinds.
    Integers = 2,
    /// Integers and `f64`.
    Floats = 3,
    /// Everything the translator supports, including booleans.
    Full = 4,
}

impl JitRolloutStage {
    /// Parse a numeric stage, saturating at the highest stage.
    pub fn from_index(index: u8) -> Self {
        match index {
            0 => Self::Off,
            1 => Self::I32Only,
            2 => Self::Integers,
            3 => Self::Floats,
            _ => Self::Full,
        }
    }
}

impl Default for JitRolloutStage {
    fn default() -> Self {
        Self::Full
    }
}

/// Garbage collection strategy. Only mark-sweep is implemented.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum GcStrategy {
    /// Non-moving mark-sweep.
    #[default]
    MarkSweep,
}

/// Tunable parameters of one VM instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmParameters {
    /// Initial allocation threshold that triggers a collection.
    pub gc_threshold: usize,
    /// Collection strategy.
    pub gc_strategy: GcStrategy,
    /// Sampling stride of the progressive loop guard.
    pub loop_guard_stride: u64,
    /// Iteration count at which the loop guard warns once.
    pub loop_warn_at: u64,
    /// Iteration ceiling; 0 disables the guard.
    pub max_iterations: u64,
    /// Cumulative instruction count declaring a path hot.
    pub hot_instruction_threshold: u64,
    /// Cumulative loop iterations declaring a loop hot.
    pub hot_loop_threshold: u64,
    /// Maximum call-frame depth.
    pub max_call_depth: usize,
    /// JIT rollout stage.
    pub jit_stage: JitRolloutStage,
    /// Profiling feature flags.
    pub profiling: ProfilingFlags,
}

impl Default for VmParameters {
    fn default() -> Self {
        Self {
            gc_threshold: DEFAULT_GC_THRESHOLD,
            gc_strategy: GcStrategy::MarkSweep,
            loop_guard_stride: DEFAULT_LOOP_GUARD_STRIDE,
            loop_warn_at: DEFAULT_LOOP_WARN_AT,
            max_iterations: DEFAULT_MAX_ITERATIONS,
            hot_instruction_threshold: DEFAULT_HOT_INSTRUCTION_THRESHOLD,
            hot_loop_threshold: DEFAULT_HOT_LOOP_THRESHOLD,
            max_call_depth: VM_MAX_CALL_DEPTH,
            jit_stage: JitRolloutStage::default(),
            profiling: ProfilingFlags::HOT_PATHS,
        }
    }
}

impl VmParameters {
    /// Defaults with the recognized environment overrides applied.
    ///
    /// Unparseable values fall back to the default silently; an absent
    /// variable changes nothing.
    pub fn from_env() -> Self {
        let mut params = Self::default();

        if let Some(v) = read_env("ORUS_GC_THRESHOLD") {
            params.gc_threshold = v;
        }
        if let Ok(strategy) = env::var("ORUS_GC_STRATEGY") {
            // Only mark-sweep exists; anything else keeps the default.
            if strategy == "mark-sweep" {
                params.gc_strategy = GcStrategy::MarkSweep;
            }
        }
        if let Some(v) = read_env("ORUS_LOOP_GUARD") {
            params.loop_guard_stride = v;
        }
        if let Some(v) = read_env("ORUS_MAX_ITERATIONS") {
            params.max_iterations = v;
        }
        if let Some(v) = read_env::<u8>("ORUS_JIT_STAGE") {
            params.jit_stage = JitRolloutStage::from_index(v);
        }
        if let Ok(list) = env::var("ORUS_PROFILING") {
            params.profiling = ProfilingFlags::parse_list(&list);
        }

        params
    }

    /// Returns `true` when the loop guard is active.
    pub const fn loop_guard_enabled(&self) -> bool {
        self.max_iterations != 0
    }
}

fn read_env<T: std::str::FromStr>(name: &str) -> Option<T> {
    env::var(name).ok()?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_documented_thresholds() {
        let params = VmParameters::default();
        assert_eq!(params.loop_guard_stride, 100_000);
        assert_eq!(params.loop_warn_at, 1_000_000);
        assert_eq!(params.max_iterations, 10_000_000);
        assert_eq!(params.hot_instruction_threshold, 1_000);
        assert_eq!(params.hot_loop_threshold, 10_000);
    }

    #[test]
    fn zero_max_iterations_disables_the_guard() {
        let params = VmParameters {
            max_iterations: 0,
            ..Default::default()
        };
        assert!(!params.loop_guard_enabled());
    }

    #[test]
    fn profiling_flag_lists_parse() {
        let flags = ProfilingFlags::parse_list("instructions, hot-paths,unknown");
        assert!(flags.contains(ProfilingFlags::INSTRUCTIONS));
        assert!(flags.contains(ProfilingFlags::HOT_PATHS));
        assert!(!flags.contains(ProfilingFlags::MEMORY_ACCESS));
    }

    #[test]
    fn rollout_stage_saturates() {
        assert_eq!(JitRolloutStage::from_index(0), JitRolloutStage::Off);
        assert_eq!(JitRolloutStage::from_index(2), JitRolloutStage::Integers);
        assert_eq!(JitRolloutStage::from_index(9), JitRolloutStage::Full);
    }
}

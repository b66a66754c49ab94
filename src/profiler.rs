//! Profiler, hot-path sampling and the fusion window
//!
//! Sampling counters are keyed per instruction location. The tiering layer
//! reads them at loop back-edges: a loop whose cumulative iteration count
//! crosses the configured threshold is submitted to the JIT translator, and
//! the fusion window watches for contiguous hot sequences that can be
//! replaced by a single specialized handler.

use orus_asm::Opcode;

use itertools::Itertools;
use std::cmp::Reverse;
use std::collections::{hash_map, HashMap};
use std::fmt;

use crate::consts::VM_MAX_FUSION_WINDOW;
use crate::params::{ProfilingFlags, VmParameters};

/// Location of an instruction collected during runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct InstructionLocation {
    /// Function id; 0 is the top-level script.
    function: u32,
    /// Bytecode offset within the function's chunk.
    offset: u32,
}

impl InstructionLocation {
    /// New location from function id and bytecode offset.
    pub const fn new(function: u32, offset: u32) -> Self {
        Self { function, offset }
    }

    /// Function id.
    pub const fn function(&self) -> u32 {
        self.function
    }

    /// Bytecode offset.
    pub const fn offset(&self) -> u32 {
        self.offset
    }
}

impl fmt::Display for InstructionLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Location(fn={}, offset={})", self.function, self.offset)
    }
}

/// Mapping from an instruction location to a concrete counter.
pub type PerLocation<T> = HashMap<InstructionLocation, T>;

/// Iterates through location (key, value) pairs.
pub struct PerLocationIter<'a, T>(hash_map::Iter<'a, InstructionLocation, T>);

impl<'a, T> Iterator for PerLocationIter<'a, T> {
    type Item = (&'a InstructionLocation, &'a T);

    fn next(&mut self) -> Option<Self::Item> {
        self.0.next()
    }
}

/// Branch outcome counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct BranchStats {
    /// Times the branch was taken.
    pub taken: u64,
    /// Times the branch fell through.
    pub not_taken: u64,
}

/// A contiguous run of hot opcodes, bounded by
/// [`VM_MAX_FUSION_WINDOW`].
#[derive(Debug, Default)]
pub struct FusionWindow {
    entries: Vec<(Opcode, u32)>,
    expected_next: u32,
}

impl FusionWindow {
    /// Extend the window with the next executed opcode.
    ///
    /// A non-contiguous offset restarts the window; the window slides once
    /// it reaches capacity.
    pub fn push(&mut self, op: Opcode, offset: u32, next_offset: u32) {
        if !self.entries.is_empty() && offset != self.expected_next {
            self.entries.clear();
        }

        self.entries.push((op, offset));
        self.expected_next = next_offset;

        if self.entries.len() > VM_MAX_FUSION_WINDOW {
            self.entries.remove(0);
        }
    }

    /// Current window contents, oldest first.
    pub fn window(&self) -> &[(Opcode, u32)] {
        &self.entries
    }

    /// Drop the window, e.g. after a fusion rewrite.
    pub fn reset(&mut self) {
        self.entries.clear();
        self.expected_next = 0;
    }
}

/// Profiling data collected during execution, exportable after a run.
#[derive(Debug, Clone, Default)]
pub struct ProfilingData {
    /// Per-location executed instruction counters.
    pub instructions: PerLocation<u64>,
    /// Per-loop-header iteration counters.
    pub loops: PerLocation<u64>,
    /// Per-call-site invocation counters.
    pub calls: PerLocation<u64>,
    /// Per-branch outcome counters.
    pub branches: PerLocation<BranchStats>,
}

/// Profiler
#[derive(Debug, Default)]
pub struct Profiler {
    flags: ProfilingFlags,
    hot_instruction_threshold: u64,
    hot_loop_threshold: u64,
    data: ProfilingData,
    fusion: FusionWindow,
}

impl Profiler {
    /// Build a profiler from the VM parameters.
    pub fn new(params: &VmParameters) -> Self {
        Self {
            flags: params.profiling,
            hot_instruction_threshold: params.hot_instruction_threshold,
            hot_loop_threshold: params.hot_loop_threshold,
            data: ProfilingData::default(),
            fusion: FusionWindow::default(),
        }
    }

    /// Count an executed instruction; returns `true` at the exact crossing
    /// of the hot-instruction threshold.
    pub fn record_instruction(&mut self, location: InstructionLocation) -> bool {
        if !self.flags.contains(ProfilingFlags::INSTRUCTIONS) {
            return false;
        }
        let count = self.data.instructions.entry(location).or_insert(0);
        *count += 1;
        *count == self.hot_instruction_threshold
    }

    /// Count one loop iteration at a back-edge; returns the cumulative
    /// count for the loop header.
    pub fn record_loop_iteration(&mut self, header: InstructionLocation) -> u64 {
        if !self.flags.contains(ProfilingFlags::HOT_PATHS) {
            return 0;
        }
        let count = self.data.loops.entry(header).or_insert(0);
        *count += 1;
        *count
    }

    /// Credit iterations a loop ran outside the dispatch loop, e.g. in
    /// compiled code.
    pub fn credit_loop_iterations(&mut self, header: InstructionLocation, n: u64) {
        if n > 0 && self.flags.contains(ProfilingFlags::HOT_PATHS) {
            *self.data.loops.entry(header).or_insert(0) += n;
        }
    }

    /// Returns `true` once a loop's iteration count declares it hot.
    pub const fn is_loop_hot(&self, iterations: u64) -> bool {
        iterations >= self.hot_loop_threshold
    }

    /// Returns `true` exactly when this iteration count crosses the
    /// hot-loop threshold; the tiering layer submits to the JIT then.
    pub const fn loop_just_became_hot(&self, iterations: u64) -> bool {
        iterations == self.hot_loop_threshold
    }

    /// Count a function call.
    pub fn record_call(&mut self, site: InstructionLocation) {
        if self.flags.contains(ProfilingFlags::FUNCTION_CALLS) {
            *self.data.calls.entry(site).or_insert(0) += 1;
        }
    }

    /// Count a branch outcome.
    pub fn record_branch(&mut self, site: InstructionLocation, taken: bool) {
        if self.flags.contains(ProfilingFlags::BRANCH_PREDICTION) {
            let stats = self.data.branches.entry(site).or_default();
            if taken {
                stats.taken += 1;
            } else {
                stats.not_taken += 1;
            }
        }
    }

    /// The fusion window.
    pub fn fusion(&self) -> &FusionWindow {
        &self.fusion
    }

    /// Mutable fusion window, fed by the dispatch loop in hot functions.
    pub fn fusion_mut(&mut self) -> &mut FusionWindow {
        &mut self.fusion
    }

    /// Read-only access to the collected data.
    pub fn data(&self) -> &ProfilingData {
        &self.data
    }

    /// The `n` hottest loop headers, hottest first; the export surface the
    /// tiering layer and profiling reporters read.
    pub fn hottest_loops(&self, n: usize) -> Vec<(InstructionLocation, u64)> {
        self.data
            .loops
            .iter()
            .map(|(&loc, &count)| (loc, count))
            .sorted_by_key(|&(_, count)| Reverse(count))
            .take(n)
            .collect()
    }

    /// Iterate loop counters.
    pub fn loops(&self) -> PerLocationIter<'_, u64> {
        PerLocationIter(self.data.loops.iter())
    }
}

impl FusionWindow {
    /// Detect the increment-loop tail pattern in the window: `AddI32`
    /// directly followed by `Loop`. Returns the offset of the `AddI32`;
    /// operand decoding happens at the rewrite site.
    pub fn inc_loop_candidate(&self) -> Option<u32> {
        match self.window() {
            [.., (Opcode::AddI32, add_offset), (Opcode::Loop, _)] => Some(*add_offset),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profiler() -> Profiler {
        Profiler::new(&VmParameters {
            profiling: ProfilingFlags::all(),
            hot_instruction_threshold: 3,
            hot_loop_threshold: 5,
            ..Default::default()
        })
    }

    #[test]
    fn instruction_threshold_crossing_fires_once() {
        let mut p = profiler();
        let loc = InstructionLocation::new(1, 8);

        assert!(!p.record_instruction(loc));
        assert!(!p.record_instruction(loc));
        assert!(p.record_instruction(loc));
        assert!(!p.record_instruction(loc));
    }

    #[test]
    fn loop_heat_crossing() {
        let mut p = profiler();
        let header = InstructionLocation::new(0, 2);

        for i in 1..=4u64 {
            assert_eq!(p.record_loop_iteration(header), i);
            assert!(!p.loop_just_became_hot(i));
        }
        let count = p.record_loop_iteration(header);
        assert!(p.loop_just_became_hot(count));
        let count = p.record_loop_iteration(header);
        assert!(p.is_loop_hot(count));
    }

    #[test]
    fn disabled_flags_record_nothing() {
        let mut p = Profiler::new(&VmParameters {
            profiling: ProfilingFlags::empty(),
            ..Default::default()
        });

        let loc = InstructionLocation::new(0, 0);
        assert!(!p.record_instruction(loc));
        assert_eq!(p.record_loop_iteration(loc), 0);
        p.record_call(loc);
        p.record_branch(loc, true);
        assert!(p.data().calls.is_empty());
        assert!(p.data().branches.is_empty());
    }

    #[test]
    fn fusion_window_tracks_contiguous_runs() {
        let mut w = FusionWindow::default();
        w.push(Opcode::AddI32, 0, 4);
        w.push(Opcode::AddI32, 4, 8);
        assert_eq!(w.window().len(), 2);

        // Gap restarts the window.
        w.push(Opcode::Loop, 20, 23);
        assert_eq!(w.window().len(), 1);

        for i in 0..(VM_MAX_FUSION_WINDOW as u32 + 4) {
            w.push(Opcode::Nop, 100 + i, 100 + i + 1);
        }
        assert!(w.window().len() <= VM_MAX_FUSION_WINDOW);
    }

    #[test]
    fn inc_loop_candidate_matches_the_tail() {
        let mut w = FusionWindow::default();
        w.push(Opcode::LtI32, 0, 4);
        w.push(Opcode::AddI32, 4, 8);
        w.push(Opcode::Loop, 8, 11);

        assert!(w.inc_loop_candidate().is_some());

        w.reset();
        w.push(Opcode::AddI32, 4, 8);
        w.push(Opcode::Nop, 8, 9);
        assert!(w.inc_loop_candidate().is_none());
    }
}

//! Runtime state representation for the VM

use crate::value::Value;

/// Resulting state of a single instruction execution.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ExecuteState {
    /// The VM should proceed normally with the execution.
    Proceed,
    /// The current frame returned a value.
    Return(Value),
    /// The current frame returned without a value.
    ReturnVoid,
    /// A `Halt` instruction was reached. Not catchable.
    Halt,
}

impl ExecuteState {
    /// Return `true` if the VM execution should continue.
    pub const fn should_continue(&self) -> bool {
        matches!(self, Self::Proceed)
    }
}

impl Default for ExecuteState {
    fn default() -> Self {
        Self::Proceed
    }
}

/// Resulting state of a program execution.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ProgramState {
    /// Top-level code ran to completion.
    Completed,
    /// Top-level code returned a value.
    Return(Value),
    /// Execution stopped at a `Halt` instruction.
    Halted,
}

/// Result code of a VM entry point, as surfaced to embedders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum InterpretResult {
    /// Execution completed.
    Ok,
    /// The compiler collaborator rejected the source.
    CompileError,
    /// A runtime error escaped every try frame.
    RuntimeError,
}

impl InterpretResult {
    /// Returns `true` for [`InterpretResult::Ok`].
    pub const fn is_ok(&self) -> bool {
        matches!(self, Self::Ok)
    }
}

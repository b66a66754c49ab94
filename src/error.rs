//! Runtime interpreter error implementation

use orus_asm::{ChunkError, SourcePos};

use core::fmt;
use std::io;
use thiserror::Error;

use crate::value::ValueKind;

/// Closed taxonomy of catchable runtime error kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::EnumIter)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[repr(u8)]
#[non_exhaustive]
pub enum ErrorKind {
    /// Generic runtime fault.
    Runtime = 0x00,
    /// Operand or operation type mismatch.
    Type = 0x01,
    /// Undefined name.
    Name = 0x02,
    /// Sequence index out of bounds.
    Index = 0x03,
    /// Missing key.
    Key = 0x04,
    /// Invalid value for an otherwise well-typed operation, e.g. division
    /// by zero or integer overflow.
    Value = 0x05,
    /// Bad argument count or argument kind.
    Argument = 0x06,
    /// Module import failure.
    Import = 0x07,
    /// Missing attribute or payload element.
    Attribute = 0x08,
    /// Operation not implemented.
    Unimplemented = 0x09,
    /// Syntax error surfaced by the compiler collaborator.
    Syntax = 0x0a,
    /// Indentation error surfaced by the compiler collaborator.
    Indent = 0x0b,
    /// Tab/space mixing error surfaced by the compiler collaborator.
    Tab = 0x0c,
    /// Call depth limit exceeded.
    Recursion = 0x0d,
    /// I/O failure.
    Io = 0x0e,
    /// Operating system failure.
    Os = 0x0f,
    /// Unexpected end of input.
    Eof = 0x10,
}

impl ErrorKind {
    /// Canonical kind name, as rendered in error messages.
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Runtime => "RuntimeError",
            Self::Type => "TypeError",
            Self::Name => "NameError",
            Self::Index => "IndexError",
            Self::Key => "KeyError",
            Self::Value => "ValueError",
            Self::Argument => "ArgumentError",
            Self::Import => "ImportError",
            Self::Attribute => "AttributeError",
            Self::Unimplemented => "UnimplementedError",
            Self::Syntax => "SyntaxError",
            Self::Indent => "IndentError",
            Self::Tab => "TabError",
            Self::Recursion => "RecursionError",
            Self::Io => "IOError",
            Self::Os => "OSError",
            Self::Eof => "EOFError",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A catchable runtime error.
///
/// Raised by opcode handlers, carried through the dispatcher as a `Result`
/// and either written into the catch slot of the nearest try frame or
/// surfaced as [`VmError::Runtime`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RuntimeError {
    /// Error kind from the closed taxonomy.
    pub kind: ErrorKind,
    /// Structured message distinguishing the cause.
    pub message: String,
    /// Source location resolved from the chunk line table.
    pub location: Option<SourcePos>,
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.location {
            Some(pos) => write!(f, "{} at {pos}: {}", self.kind, self.message),
            None => write!(f, "{}: {}", self.kind, self.message),
        }
    }
}

impl RuntimeError {
    /// Create an error with no source location; the dispatcher attaches one
    /// from the line table before unwinding.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            location: None,
        }
    }

    /// Attach a source location, keeping an already-present one.
    pub fn with_location(mut self, location: Option<SourcePos>) -> Self {
        if self.location.is_none() {
            self.location = location;
        }
        self
    }

    /// Integer or float division by zero.
    pub fn division_by_zero() -> Self {
        Self::new(ErrorKind::Value, "Division by zero")
    }

    /// Checked integer arithmetic overflowed.
    pub fn integer_overflow(kind: ValueKind) -> Self {
        Self::new(ErrorKind::Value, format!("Integer overflow in {kind} arithmetic"))
    }

    /// A float operation over finite operands produced NaN or infinity.
    pub fn non_finite_float() -> Self {
        Self::new(ErrorKind::Value, "Float operation produced a non-finite result")
    }

    /// Mixed signed/unsigned or integer/float arithmetic.
    pub fn mixed_arithmetic(lhs: ValueKind, rhs: ValueKind) -> Self {
        if lhs.is_signed_int() && rhs.is_unsigned_int() || lhs.is_unsigned_int() && rhs.is_signed_int() {
            Self::new(
                ErrorKind::Value,
                "Cannot mix signed/unsigned integers; use explicit conversion",
            )
        } else {
            Self::new(
                ErrorKind::Value,
                format!("Cannot mix {lhs} and {rhs} operands; use explicit conversion"),
            )
        }
    }

    /// Typed comparison or arithmetic got the wrong operand kind.
    pub fn operands_must_be(kind: ValueKind) -> Self {
        Self::new(ErrorKind::Type, format!("Operands must be {kind}"))
    }

    /// A jump or loop condition register held a non-boolean.
    pub fn non_boolean_condition(found: ValueKind) -> Self {
        Self::new(ErrorKind::Value, format!("Condition must be bool, found {found}"))
    }

    /// Sequence index out of bounds.
    pub fn index_out_of_bounds(index: i64, len: usize) -> Self {
        Self::new(
            ErrorKind::Index,
            format!("Index {index} out of bounds for length {len}"),
        )
    }

    /// Call-frame limit exceeded.
    pub fn stack_overflow(limit: usize) -> Self {
        Self::new(ErrorKind::Recursion, format!("Exceeded call depth limit of {limit}"))
    }

    /// Progressive loop guard hit the configured iteration ceiling.
    pub fn loop_iteration_limit(count: u64) -> Self {
        Self::new(
            ErrorKind::Runtime,
            format!("Loop exceeded the iteration limit after {count} iterations"),
        )
    }

    /// Generic type mismatch with both sides named.
    pub fn type_mismatch(expected: &str, found: ValueKind) -> Self {
        Self::new(ErrorKind::Type, format!("Expected {expected}, found {found}"))
    }
}

/// Top-level VM error.
///
/// Everything that escapes the try-frame machinery: uncaught runtime
/// errors, malformed bytecode and host failures.
#[derive(Debug, Error)]
pub enum VmError {
    /// An uncaught runtime error terminated execution.
    #[error("{0}")]
    Runtime(#[from] RuntimeError),
    /// The bytecode stream was malformed.
    #[error("malformed bytecode: {0}")]
    Chunk(#[from] ChunkError),
    /// The module manager capacity was exhausted.
    #[error("module limit of {limit} exceeded while loading `{name}`")]
    ModuleLimit {
        /// Module that failed to load.
        name: String,
        /// Configured module capacity.
        limit: usize,
    },
    /// A module name did not resolve.
    #[error("module `{0}` is not loaded")]
    ModuleNotFound(String),
    /// Unrecoverable host I/O failure.
    #[error("unrecoverable error: {0}")]
    Io(#[from] io::Error),
    /// The VM was used after `free()`.
    #[error("the VM is shutting down")]
    ShuttingDown,
}

impl VmError {
    /// The runtime error, if this is a catchable fault that escaped.
    pub const fn runtime(&self) -> Option<&RuntimeError> {
        match self {
            Self::Runtime(e) => Some(e),
            _ => None,
        }
    }

    /// The error kind, if applicable.
    pub const fn kind(&self) -> Option<ErrorKind> {
        match self {
            Self::Runtime(e) => Some(e.kind),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_distinguish_cause() {
        let err = RuntimeError::mixed_arithmetic(ValueKind::I32, ValueKind::U32);
        assert!(err.message.contains("signed/unsigned"), "{}", err.message);

        let err = RuntimeError::mixed_arithmetic(ValueKind::I32, ValueKind::F64);
        assert!(err.message.contains("i32"), "{}", err.message);
        assert!(err.message.contains("f64"), "{}", err.message);
    }

    #[test]
    fn location_is_attached_once() {
        let pos = SourcePos { line: 3, column: 4 };
        let other = SourcePos { line: 9, column: 9 };

        let err = RuntimeError::division_by_zero()
            .with_location(Some(pos))
            .with_location(Some(other));
        assert_eq!(err.location, Some(pos));
    }

    #[test]
    fn display_carries_kind_and_location() {
        let err = RuntimeError::division_by_zero().with_location(Some(SourcePos { line: 1, column: 2 }));
        let rendered = err.to_string();
        assert!(rendered.contains("ValueError"), "{rendered}");
        assert!(rendered.contains("1:2"), "{rendered}");
    }
}

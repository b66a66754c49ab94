//! Instruction set and bytecode primitives of the Orus VM.
//!
//! This crate owns the parts of the system that both the bytecode compiler
//! and the virtual machine agree on: the closed opcode enumeration, the
//! operand encoding rules, the [`Chunk`] bytecode container and its
//! run-length encoded source-location table.

#![warn(missing_docs)]

mod chunk;
mod lines;
mod opcode;

pub use chunk::{Chunk, ChunkError};
pub use lines::{LineTable, SourcePos};
pub use opcode::{OperandLayout, Opcode};

/// Logical register identifier.
///
/// Ids below [`SPILL_REG_START`] address the primary register window; ids at
/// or above it are served by the spill manager.
pub type RegisterId = u16;

/// First register id handled by the spill manager.
///
/// The primary window covers `[0, 256)`: globals, frame, temp and module
/// banks. Everything past it overflows into spill storage and is encoded
/// with 3-byte operands.
pub const SPILL_REG_START: u32 = 256;

/// Number of distinct modules addressable by a 1-byte module id.
pub const UINT8_COUNT: usize = 256;

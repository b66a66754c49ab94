//! Native code generation for the host architecture
//!
//! Each backend lowers [`IrLoop`](super::ir::IrLoop) into machine code
//! against the [`JitState`](super::JitState) layout. Arithmetic faults are
//! not materialized in native code: every guard exits through a deopt stub
//! and the interpreter re-executes the faulting instruction to raise the
//! structured error.

#[cfg(all(unix, target_arch = "x86_64"))]
mod x86_64;

#[cfg(all(unix, target_arch = "aarch64"))]
mod aarch64;

#[cfg(all(unix, target_arch = "riscv64"))]
mod riscv64;

use super::ir::IrLoop;
use super::{CompiledLoop, TranslationFailure};

/// Whether this build can emit and run native code.
pub(super) const HOST_SUPPORTED: bool = cfg!(all(
    unix,
    any(target_arch = "x86_64", target_arch = "aarch64", target_arch = "riscv64")
));

/// A bare return instruction; tests use it to own an executable page.
#[cfg(all(test, target_arch = "x86_64"))]
pub(super) const RETURN_STUB: [u8; 1] = [0xc3];
#[cfg(all(test, target_arch = "aarch64"))]
pub(super) const RETURN_STUB: [u8; 4] = [0xc0, 0x03, 0x5f, 0xd6];
#[cfg(all(test, target_arch = "riscv64"))]
pub(super) const RETURN_STUB: [u8; 4] = [0x67, 0x80, 0x00, 0x00];

/// Emit native code for a lifted loop.
pub(super) fn emit(ir: &IrLoop) -> Result<CompiledLoop, TranslationFailure> {
    #[cfg(all(unix, target_arch = "x86_64"))]
    {
        return x86_64::emit(ir);
    }
    #[cfg(all(unix, target_arch = "aarch64"))]
    {
        return aarch64::emit(ir);
    }
    #[cfg(all(unix, target_arch = "riscv64"))]
    {
        return riscv64::emit(ir);
    }

    #[allow(unreachable_code)]
    {
        let _ = ir;
        Err(TranslationFailure::AllocatorExhaustion)
    }
}

//! Call frame representation
//!
//! A frame owns the frame+temp sub-window of the primary register file for
//! the duration of one activation, carrying saved copies of the parent's
//! slots for restoration on return.

use orus_asm::Chunk;

use smallvec::SmallVec;
use std::rc::Rc;

use crate::value::{ObjHandle, Value};

/// One function activation.
#[derive(Debug, Clone)]
pub struct CallFrame {
    /// Parent's frame+temp window contents, restored on return.
    pub(crate) saved: Box<[Value]>,
    /// Chunk to resume in the caller.
    pub(crate) return_chunk: Rc<Chunk<Value>>,
    /// Instruction pointer to resume at.
    pub(crate) return_ip: usize,
    /// Caller register receiving the return value.
    pub(crate) result_reg: u16,
    /// The called function or closure; kept alive as a GC root.
    pub(crate) callee: ObjHandle,
    /// Function id of the callee, keying profiler and JIT lookups.
    pub(crate) function_id: u32,
    /// Spill ids holding parameters past the frame bank capacity, paired
    /// with the caller's displaced values for restoration.
    pub(crate) spilled_params: SmallVec<[(u32, Option<Value>); 4]>,
}

impl CallFrame {
    /// The called function or closure object.
    pub const fn callee(&self) -> ObjHandle {
        self.callee
    }

    /// Function id of the callee.
    pub const fn function_id(&self) -> u32 {
        self.function_id
    }

    /// Saved parent window, scanned as GC roots.
    pub fn saved_window(&self) -> &[Value] {
        &self.saved
    }
}

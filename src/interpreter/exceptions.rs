use super::Interpreter;
use crate::context::Context;
use crate::error::{ErrorKind, RuntimeError, VmError};
use crate::object::{ObjData, ObjError};
use crate::value::Value;

/// One entry of the try-frame stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TryFrame {
    /// Absolute handler address within the frame's chunk.
    pub handler: usize,
    /// Register receiving the caught error object.
    pub catch_reg: u16,
    /// Call depth at `SetupExcept`; unwinding pops frames back to it.
    pub frame_depth: usize,
}

impl Interpreter {
    /// `SetupExcept catch_var, handler`: push a try frame.
    pub(crate) fn setup_except(&mut self) -> Result<(), RuntimeError> {
        let catch_reg = self.fetch_u8()? as u16;
        let offset = self.fetch_u16()? as usize;

        self.try_frames.push(TryFrame {
            handler: self.ip + offset,
            catch_reg,
            frame_depth: self.registers.frame_depth(),
        });
        Ok(())
    }

    /// `PopExcept`: pop the topmost try frame.
    pub(crate) fn pop_except(&mut self) -> Result<(), RuntimeError> {
        self.try_frames
            .pop()
            .map(|_| ())
            .ok_or_else(|| RuntimeError::new(ErrorKind::Runtime, "try frame underflow"))
    }

    /// `Raise src`: re-raise an error value through the unwind path.
    ///
    /// The original error object is preserved into the catch slot instead
    /// of being rebuilt, so a caught-and-reraised error keeps its
    /// identity.
    pub(crate) fn raise(&mut self) -> Result<(), RuntimeError> {
        let src = self.fetch_reg()?;
        let value = self.reg(src)?;

        let handle = value
            .as_obj()
            .ok_or_else(|| RuntimeError::type_mismatch("error value", value.kind()))?;

        let raised = match self.heap.get(handle) {
            Some(ObjData::Error(e)) => Some(RuntimeError {
                kind: e.kind,
                message: e.message.clone(),
                location: e.location,
            }),
            Some(ObjData::Str(_)) => None,
            _ => return Err(RuntimeError::type_mismatch("error value", value.kind())),
        };

        match raised {
            Some(err) => {
                self.last_error = Some(handle);
                Err(err)
            }
            None => {
                self.heap.flatten(handle);
                let message = self.heap.flat_str(handle).unwrap_or_default().to_owned();
                Err(RuntimeError::new(ErrorKind::Runtime, message))
            }
        }
    }

    /// Unwind a raised error to the nearest try frame.
    ///
    /// Pops call frames down to the try frame's depth, writes the error
    /// object to the catch slot and resumes at the handler. Without a try
    /// frame the error escapes as [`VmError::Runtime`].
    pub(crate) fn unwind(&mut self, err: RuntimeError) -> Result<(), VmError> {
        let err = err.with_location(self.current_location());

        let Some(frame) = self.try_frames.pop() else {
            self.last_error = None;
            return Err(VmError::Runtime(err));
        };

        while self.registers.frame_depth() > frame.frame_depth {
            self.close_upvalues_in_window();
            if let Some(popped) = self.registers.deallocate_frame() {
                self.chunk = popped.return_chunk;
                self.ip = popped.return_ip;
            }
        }

        self.current_function = self
            .registers
            .current_frame()
            .map(|f| f.function_id())
            .unwrap_or(self.base_function);
        self.context = if self.registers.frame_depth() == 0 {
            match self.active_module {
                Some(id) => Context::Module { id },
                None => Context::Script,
            }
        } else {
            Context::Call
        };

        let handle = match self.last_error.take() {
            Some(h) => h,
            None => self.heap.alloc(ObjData::Error(ObjError {
                kind: err.kind,
                message: err.message.clone(),
                location: err.location,
            })),
        };

        self.registers.set(frame.catch_reg as u32, Value::Obj(handle));
        self.ip = frame.handler;
        self.loop_header = None;

        tracing::debug!(kind = %err.kind, handler = frame.handler, "recovered runtime error in try frame");
        Ok(())
    }
}

use smallvec::SmallVec;
use std::rc::Rc;

use super::Interpreter;
use crate::consts::{FRAME_REGISTERS, FRAME_REG_START, MODULE_REG_START, SPILL_REG_START};
use crate::context::Context;
use crate::error::{ErrorKind, RuntimeError};
use crate::native::NativeCtx;
use crate::object::ObjData;
use crate::profiler::InstructionLocation;
use crate::state::ExecuteState;
use crate::value::Value;

impl Interpreter {
    /// `Call func, first_arg, argc, result`: allocate a frame, copy the
    /// arguments to the parameter base and jump to the callee.
    pub(crate) fn call(&mut self) -> Result<(), RuntimeError> {
        let func_reg = self.fetch_reg()?;
        let first_arg = self.fetch_reg()?;
        let argc = self.fetch_u8()?;
        let result_reg = self.fetch_u8()? as u16;

        let callee_value = self.reg(func_reg)?;
        let (callee, function) = self.resolve_callable(callee_value)?;
        let (arity, function_id, callee_chunk) = match self.obj_data(function)? {
            ObjData::Function(f) => (f.arity, f.id, Rc::clone(&f.chunk)),
            _ => return Err(RuntimeError::new(ErrorKind::Runtime, "callable resolved to a non-function")),
        };

        if argc != arity {
            return Err(RuntimeError::new(
                ErrorKind::Argument,
                format!("Expected {arity} arguments, got {argc}"),
            ));
        }

        let mut args: SmallVec<[Value; 8]> = SmallVec::with_capacity(argc as usize);
        for i in 0..argc as u32 {
            args.push(self.reg(first_arg + i)?);
        }

        self.profiler
            .record_call(InstructionLocation::new(self.current_function, self.op_start as u32));

        // Function entry is a safepoint.
        self.safepoint();
        self.close_upvalues_in_window();

        // Parameters past the frame bank overflow into deterministic spill
        // ids; the caller's displaced spill values travel with the frame.
        let mut spilled: SmallVec<[(u32, Option<Value>); 4]> = SmallVec::new();
        for i in FRAME_REGISTERS..argc as usize {
            let id = SPILL_REG_START + (i - FRAME_REGISTERS) as u32;
            let displaced = self.registers.spill_manager_mut().unspill(id);
            spilled.push((id, displaced));
        }

        self.registers.allocate_frame(
            Rc::clone(&self.chunk),
            self.ip,
            result_reg,
            callee,
            function_id,
            spilled,
            self.params.max_call_depth,
        )?;

        for (i, value) in args.into_iter().enumerate() {
            if i < FRAME_REGISTERS {
                self.registers.set((FRAME_REG_START + i) as u32, value);
            } else {
                let id = SPILL_REG_START + (i - FRAME_REGISTERS) as u32;
                self.registers.spill_manager_mut().spill(id, value);
            }
        }

        self.chunk = callee_chunk;
        self.ip = 0;
        self.current_function = function_id;
        self.context = Context::Call;
        self.loop_header = None;

        Ok(())
    }

    /// `TailCall func, first_arg, argc`: reuse the current frame.
    pub(crate) fn tail_call(&mut self) -> Result<(), RuntimeError> {
        let func_reg = self.fetch_reg()?;
        let first_arg = self.fetch_reg()?;
        let argc = self.fetch_u8()?;

        let callee_value = self.reg(func_reg)?;
        let (callee, function) = self.resolve_callable(callee_value)?;
        let (arity, function_id, callee_chunk) = match self.obj_data(function)? {
            ObjData::Function(f) => (f.arity, f.id, Rc::clone(&f.chunk)),
            _ => return Err(RuntimeError::new(ErrorKind::Runtime, "callable resolved to a non-function")),
        };

        if argc != arity {
            return Err(RuntimeError::new(
                ErrorKind::Argument,
                format!("Expected {arity} arguments, got {argc}"),
            ));
        }
        if argc as usize > FRAME_REGISTERS {
            return Err(RuntimeError::new(
                ErrorKind::Argument,
                "tail calls do not support spilled parameters",
            ));
        }

        let mut args: SmallVec<[Value; 8]> = SmallVec::with_capacity(argc as usize);
        for i in 0..argc as u32 {
            args.push(self.reg(first_arg + i)?);
        }

        self.safepoint();
        self.close_upvalues_in_window();

        // The window is reused in place: clear it, then lay the new
        // parameters at the base.
        for slot in FRAME_REG_START..MODULE_REG_START {
            self.registers.set(slot as u32, Value::default());
        }
        for (i, value) in args.into_iter().enumerate() {
            self.registers.set((FRAME_REG_START + i) as u32, value);
        }

        if let Some(frame) = self.registers.current_frame_mut() {
            frame.callee = callee;
            frame.function_id = function_id;
        }

        self.chunk = callee_chunk;
        self.ip = 0;
        self.current_function = function_id;
        self.loop_header = None;

        Ok(())
    }

    /// `CallNative native, first_arg, argc, result`: invoke a table native
    /// with a read-only view of the argument registers.
    pub(crate) fn call_native(&mut self) -> Result<(), RuntimeError> {
        let native_idx = self.fetch_u8()?;
        let first_arg = self.fetch_reg()?;
        let argc = self.fetch_u8()?;
        let result_reg = self.fetch_reg()?;

        let native = self
            .natives
            .get(native_idx as usize)
            .copied()
            .ok_or_else(|| RuntimeError::new(ErrorKind::Name, format!("unknown native #{native_idx}")))?;

        if let Some(arity) = native.arity {
            if arity != argc {
                return Err(RuntimeError::new(
                    ErrorKind::Argument,
                    format!("{} expects {arity} arguments, got {argc}", native.name),
                ));
            }
        }

        let mut args: SmallVec<[Value; 8]> = SmallVec::with_capacity(argc as usize);
        for i in 0..argc as u32 {
            args.push(self.reg(first_arg + i)?);
        }

        // Natives may allocate; this is their safepoint.
        self.safepoint();

        let mut ctx = NativeCtx {
            heap: &mut self.heap,
            output: &mut *self.output,
        };
        let value = (native.func)(&mut ctx, &args)?;

        self.registers.set(result_reg, value);
        Ok(())
    }

    /// Tear down the current frame; a `None` value models `ReturnVoid`.
    ///
    /// At the bottom of the frame stack the return escapes to the caller
    /// of the dispatch loop.
    pub(crate) fn do_return(&mut self, value: Option<Value>) -> Result<ExecuteState, RuntimeError> {
        self.close_upvalues_in_window();

        match self.registers.deallocate_frame() {
            Some(frame) => {
                self.chunk = frame.return_chunk;
                self.ip = frame.return_ip;
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

                if let Some(v) = value {
                    self.registers.set(frame.result_reg as u32, v);
                }
                self.loop_header = None;
                Ok(ExecuteState::Proceed)
            }
            None => Ok(match value {
                Some(v) => ExecuteState::Return(v),
                None => ExecuteState::ReturnVoid,
            }),
        }
    }
}

use orus_asm::Chunk;

use std::rc::Rc;

use crate::context::Context;
use crate::error::{ErrorKind, RuntimeError, VmError};
use crate::interpreter::Interpreter;
use crate::state::{ExecuteState, InterpretResult, ProgramState};
use crate::value::Value;

impl Interpreter {
    /// Execute a compiled top-level chunk.
    ///
    /// The embedder-facing entry point: maps the detailed outcome onto the
    /// result codes and stashes the structured failure for the
    /// error-reporting collaborator.
    pub fn interpret(&mut self, chunk: Chunk<Value>) -> InterpretResult {
        match self.run_script(chunk) {
            Ok(_) => InterpretResult::Ok,
            Err(err) => {
                tracing::debug!(%err, "top-level execution failed");
                self.last_failure = Some(err);
                InterpretResult::RuntimeError
            }
        }
    }

    /// Execute a compiled top-level chunk, returning the detailed state.
    pub fn run_script(&mut self, chunk: Chunk<Value>) -> Result<ProgramState, VmError> {
        if self.is_shutting_down {
            return Err(VmError::ShuttingDown);
        }

        self.select_script_window();
        // A fresh top-level chunk is a bytecode edit for function id 0;
        // stale compiled loops must not survive it.
        self.jit.invalidate_function(0);
        self.chunk = Rc::new(chunk);
        self.ip = 0;
        self.op_start = 0;
        self.context = Context::Script;
        self.current_function = 0;
        self.base_function = 0;
        self.loop_header = None;

        let state = self.run_program()?;
        self.profiler_summary();
        Ok(state)
    }

    /// Execute an already-loaded module by name.
    ///
    /// Running a module a second time is a no-op; the executed flag makes
    /// imports idempotent.
    pub fn interpret_module(&mut self, name: &str) -> InterpretResult {
        match self.run_module(name) {
            Ok(_) => InterpretResult::Ok,
            Err(err) => {
                tracing::debug!(%err, module = name, "module execution failed");
                self.last_failure = Some(err);
                InterpretResult::RuntimeError
            }
        }
    }

    /// Execute an already-loaded module by name, returning the detailed
    /// state.
    pub fn run_module(&mut self, name: &str) -> Result<ProgramState, VmError> {
        if self.is_shutting_down {
            return Err(VmError::ShuttingDown);
        }

        let id = self
            .modules
            .resolve(name)
            .ok_or_else(|| VmError::ModuleNotFound(name.to_owned()))?;

        let record = self.modules.get(id).expect("resolved module id");
        if record.executed {
            return Ok(ProgramState::Completed);
        }
        let module_chunk = Rc::clone(&record.chunk);

        // Save the caller's execution state; module bodies can be entered
        // from a running script through import resolution.
        let saved_chunk = Rc::clone(&self.chunk);
        let saved_ip = self.ip;
        let saved_context = self.context;
        let saved_function = self.current_function;
        let saved_base = self.base_function;
        let saved_active = self.active_module;

        self.select_module(id).map_err(VmError::Runtime)?;
        self.chunk = module_chunk;
        self.ip = 0;
        self.op_start = 0;
        self.context = Context::Module { id };
        self.current_function = 0;
        self.base_function = 0;
        self.loop_header = None;

        let result = self.run_program();

        if let Some(record) = self.modules.get_mut(id) {
            record.executed = true;
        }

        // Restore the caller, stashing the module window back.
        match saved_active {
            Some(prev) => {
                let _ = self.select_module(prev);
            }
            None => self.select_script_window(),
        }
        self.chunk = saved_chunk;
        self.ip = saved_ip;
        self.context = saved_context;
        self.current_function = saved_function;
        self.base_function = saved_base;
        self.loop_header = None;

        result
    }

    /// The dispatch loop: decode, execute, observe errors, advance.
    pub(crate) fn run_program(&mut self) -> Result<ProgramState, VmError> {
        loop {
            if self.is_shutting_down {
                return Ok(ProgramState::Halted);
            }

            if self.ip >= self.chunk.len() {
                if self.registers.frame_depth() == 0 {
                    return Ok(ProgramState::Completed);
                }
                // A function body fell off the end; well-formed compilers
                // always emit a return.
                self.unwind(RuntimeError::new(
                    ErrorKind::Runtime,
                    "function body ended without a return",
                ))?;
                continue;
            }

            match self.execute() {
                Ok(ExecuteState::Proceed) => {}
                Ok(ExecuteState::Return(value)) => return Ok(ProgramState::Return(value)),
                Ok(ExecuteState::ReturnVoid) => return Ok(ProgramState::Completed),
                Ok(ExecuteState::Halt) => {
                    // Halt is uncatchable: try frames are bypassed.
                    return Ok(ProgramState::Halted);
                }
                Err(err) => self.unwind(err)?,
            }
        }
    }

    /// Structured failure of the last `interpret`/`interpret_module` call.
    pub fn last_failure(&self) -> Option<&VmError> {
        self.last_failure.as_ref()
    }

    /// Take the structured failure of the last top-level call.
    pub fn take_failure(&mut self) -> Option<VmError> {
        self.last_failure.take()
    }

    /// Put the active window back to the script's stash.
    pub(crate) fn select_script_window(&mut self) {
        if let Some(prev) = self.active_module.take() {
            let mut stash = [Value::default(); crate::consts::MODULE_REGISTERS];
            self.registers.save_module_window(&mut stash);
            if let Some(window) = self.modules.window_mut(prev) {
                *window = stash;
            }
            let script = self.script_window;
            self.registers.load_module_window(&script);
        }
    }

    fn profiler_summary(&self) {
        let data = self.profiler.data();
        tracing::trace!(
            instruction_sites = data.instructions.len(),
            loops = data.loops.len(),
            call_sites = data.calls.len(),
            jit_entries = self.jit.entry_count(),
            "run finished"
        );
    }
}

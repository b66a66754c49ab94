use orus_asm::Chunk;

use std::io::{self, Write};
use std::rc::Rc;

use super::Interpreter;
use crate::context::Context;
use crate::heap::Heap;
use crate::jit::JitEngine;
use crate::modules::ModuleManager;
use crate::native::default_natives;
use crate::object::{ObjData, ObjFunction};
use crate::params::VmParameters;
use crate::profiler::Profiler;
use crate::registers::RegisterFile;
use crate::value::{ObjHandle, Value};

impl Interpreter {
    /// Set up a VM with default parameters, writing to stdout.
    pub fn new() -> Self {
        Self::with_params(VmParameters::default())
    }

    /// Set up a VM with explicit parameters.
    pub fn with_params(params: VmParameters) -> Self {
        Self::with_output(params, Box::new(io::stdout()))
    }

    /// Set up a VM with an injected output sink; tests capture prints
    /// through it.
    pub fn with_output(params: VmParameters, output: Box<dyn Write>) -> Self {
        let heap = Heap::with_threshold(params.gc_threshold);
        let profiler = Profiler::new(&params);
        let jit = JitEngine::new(params.jit_stage);

        Self {
            registers: RegisterFile::default(),
            heap,
            chunk: Rc::new(Chunk::new()),
            ip: 0,
            op_start: 0,
            open_upvalues: Vec::new(),
            try_frames: Vec::new(),
            last_error: None,
            modules: ModuleManager::default(),
            active_module: None,
            script_window: [Value::default(); crate::consts::MODULE_REGISTERS],
            natives: default_natives(),
            functions: Vec::new(),
            next_function_id: 1,
            current_function: 0,
            base_function: 0,
            profiler,
            jit,
            params,
            context: Context::NotInitialized,
            output,
            is_shutting_down: false,
            loop_header: None,
            loop_iterations: 0,
            loop_warned: false,
            last_failure: None,
        }
    }

    /// Register a compiled function, assigning its stable id.
    ///
    /// The returned handle is what `Closure` constants and `Call` operands
    /// refer to; the table keeps every registered function alive.
    pub fn register_function(
        &mut self,
        arity: u8,
        upvalue_count: u8,
        chunk: Chunk<Value>,
        name: Option<&str>,
    ) -> ObjHandle {
        let id = self.next_function_id;
        self.next_function_id += 1;

        let handle = self.heap.alloc(ObjData::Function(ObjFunction {
            arity,
            upvalue_count,
            chunk: Rc::new(chunk),
            name: name.map(str::to_owned),
            id,
        }));
        self.functions.push(handle);
        handle
    }

    /// Look up a native-function table index by name.
    pub fn native_index(&self, name: &str) -> Option<u8> {
        self.natives
            .iter()
            .position(|n| n.name == name)
            .and_then(|i| u8::try_from(i).ok())
    }

    /// Allocate a string on the VM heap; a convenience for embedders
    /// assembling constant pools.
    pub fn alloc_string_value(&mut self, text: &str) -> Value {
        Value::Obj(self.heap.alloc_string(text))
    }

    /// Tear down the VM.
    ///
    /// Marks the instance as shutting down so stray jumps become no-ops,
    /// flushes the JIT entry cache and drops per-run state in reverse
    /// construction order. The instance stays safe to drop afterwards.
    pub fn free(&mut self) {
        self.is_shutting_down = true;

        self.jit.flush();
        self.try_frames.clear();
        self.open_upvalues.clear();
        self.last_error = None;

        while self.registers.deallocate_frame().is_some() {}
    }

}

impl Default for Interpreter {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Interpreter {
    fn drop(&mut self) {
        if !self.is_shutting_down {
            self.free();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn function_registration_assigns_increasing_ids() {
        let mut vm = Interpreter::new();
        let a = vm.register_function(0, 0, Chunk::new(), Some("a"));
        let b = vm.register_function(2, 0, Chunk::new(), None);

        let id_of = |vm: &Interpreter, h| match vm.heap.get(h) {
            Some(ObjData::Function(f)) => f.id,
            _ => panic!("not a function"),
        };
        assert_eq!(id_of(&vm, a), 1);
        assert_eq!(id_of(&vm, b), 2);
    }

    #[test]
    fn natives_are_installed_at_startup() {
        let vm = Interpreter::new();
        assert!(vm.native_index("print").is_some());
        assert!(vm.native_index("timestamp").is_some());
        assert!(vm.native_index("no_such_native").is_none());
    }

    #[test]
    fn free_is_idempotent_and_drop_safe() {
        let mut vm = Interpreter::new();
        vm.free();
        vm.free();
        assert!(vm.is_shutting_down());
    }
}

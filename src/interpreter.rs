//! [`Interpreter`] implementation

use orus_asm::Chunk;

use std::io::Write;
use std::rc::Rc;

use crate::context::Context;
use crate::heap::Heap;
use crate::jit::JitEngine;
use crate::modules::ModuleManager;
use crate::native::NativeFunction;
use crate::params::VmParameters;
use crate::profiler::Profiler;
use crate::registers::RegisterFile;
use crate::value::{ObjHandle, Value};

mod alu;
mod collections;
mod exceptions;
mod executors;
mod flow;
mod frame;
mod initialization;
mod internal;
mod upvalue;

pub use exceptions::TryFrame;

use crate::consts::MODULE_REGISTERS;

/// VM interpreter.
///
/// All mutable state of one VM instance lives here; there is no global
/// state. The intended usage is to construct an interpreter, register the
/// function and native tables produced by the compiler collaborator and
/// feed it chunks through [`Interpreter::interpret`].
pub struct Interpreter {
    pub(crate) registers: RegisterFile,
    pub(crate) heap: Heap,
    pub(crate) chunk: Rc<Chunk<Value>>,
    pub(crate) ip: usize,
    /// Offset of the opcode currently executing; error locations resolve
    /// through it.
    pub(crate) op_start: usize,
    pub(crate) open_upvalues: Vec<ObjHandle>,
    pub(crate) try_frames: Vec<TryFrame>,
    pub(crate) last_error: Option<ObjHandle>,
    pub(crate) modules: ModuleManager,
    pub(crate) active_module: Option<u8>,
    pub(crate) script_window: [Value; MODULE_REGISTERS],
    pub(crate) natives: Vec<NativeFunction>,
    pub(crate) functions: Vec<ObjHandle>,
    pub(crate) next_function_id: u32,
    /// Function id of the code currently executing; 0 is the script.
    pub(crate) current_function: u32,
    /// Function id to fall back to when the frame stack empties.
    pub(crate) base_function: u32,
    pub(crate) profiler: Profiler,
    pub(crate) jit: JitEngine,
    pub(crate) params: VmParameters,
    pub(crate) context: Context,
    pub(crate) output: Box<dyn Write>,
    pub(crate) is_shutting_down: bool,
    pub(crate) loop_header: Option<usize>,
    pub(crate) loop_iterations: u64,
    pub(crate) loop_warned: bool,
    pub(crate) last_failure: Option<crate::error::VmError>,
}

impl Interpreter {
    /// Returns the current state of the register file.
    pub const fn registers(&self) -> &RegisterFile {
        &self.registers
    }

    /// The VM heap.
    pub const fn heap(&self) -> &Heap {
        &self.heap
    }

    /// Current execution context.
    pub const fn context(&self) -> Context {
        self.context
    }

    /// Configured parameters.
    pub const fn params(&self) -> &VmParameters {
        &self.params
    }

    /// Reference to the underlying profiler.
    pub const fn profiler(&self) -> &Profiler {
        &self.profiler
    }

    /// The JIT engine, including its entry cache and failure log.
    pub const fn jit(&self) -> &JitEngine {
        &self.jit
    }

    /// The module manager.
    pub const fn modules(&self) -> &ModuleManager {
        &self.modules
    }

    /// Current instruction pointer.
    pub const fn ip(&self) -> usize {
        self.ip
    }

    /// Read a register by logical id, reconciling the typed cache first.
    pub fn register(&mut self, id: u32) -> Option<Value> {
        self.registers.get(id)
    }

    /// Register an already-resolved module record, assigning its id.
    pub fn register_module(&mut self, record: crate::modules::ModuleRecord) -> Result<u8, crate::error::VmError> {
        self.modules.register(record)
    }

    /// Value exported by a loaded module under `export`.
    pub fn module_export(&mut self, name: &str, export: &str) -> Option<Value> {
        let id = self.modules.resolve(name)?;

        // A currently-active module keeps its window in the primary file;
        // stash it so the read observes the live values.
        if self.active_module == Some(id) {
            let mut stash = [Value::default(); MODULE_REGISTERS];
            self.registers.save_module_window(&mut stash);
            if let Some(window) = self.modules.window_mut(id) {
                *window = stash;
            }
        }

        self.modules.export_value(id, export)
    }

    /// Render a value the way `Print` would.
    pub fn render(&mut self, value: Value) -> String {
        self.heap.render_value(value)
    }

    /// Returns `true` once [`Interpreter::free`] ran.
    pub const fn is_shutting_down(&self) -> bool {
        self.is_shutting_down
    }
}

impl core::fmt::Debug for Interpreter {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Interpreter")
            .field("ip", &self.ip)
            .field("context", &self.context)
            .field("frames", &self.registers.frame_depth())
            .field("heap_bytes", &self.heap.bytes_allocated())
            .field("modules", &self.modules.len())
            .field("shutting_down", &self.is_shutting_down)
            .finish_non_exhaustive()
    }
}

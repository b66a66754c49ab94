//! Heap object representations
//!
//! Every heap object is an [`ObjData`] stored behind a header carrying the
//! mark bit and the allocation-chain link (see [`crate::heap`]).

use orus_asm::{Chunk, SourcePos};

use std::fs::File;
use std::mem;
use std::rc::Rc;

use crate::error::ErrorKind;
use crate::value::{ObjHandle, Value};

/// Type tag of a heap object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjKind {
    /// UTF-8 string, flat or rope.
    Str,
    /// Growable value array.
    Array,
    /// Raw byte buffer.
    Bytes,
    /// First-class runtime error.
    Error,
    /// Enum instance.
    Enum,
    /// Open file handle.
    File,
    /// Compiled function.
    Function,
    /// Function bundled with captured upvalues.
    Closure,
    /// Captured variable reference.
    Upvalue,
    /// Iterator over an integer range.
    RangeIter,
    /// Iterator over an array.
    ArrayIter,
}

/// String payload: flat bytes or a rope of two sub-strings.
///
/// Ropes are flattened lazily the first time an observer needs contiguous
/// bytes.
#[derive(Debug, Clone)]
pub enum StrRepr {
    /// Contiguous UTF-8.
    Flat(Box<str>),
    /// Concatenation node; `len` is the combined byte length.
    Rope {
        /// Left sub-string.
        left: ObjHandle,
        /// Right sub-string.
        right: ObjHandle,
        /// Combined byte length of both sides.
        len: usize,
    },
}

/// Heap string.
#[derive(Debug, Clone)]
pub struct ObjString {
    /// Flat or rope payload.
    pub repr: StrRepr,
    /// Whether this string is registered in the intern table.
    pub interned: bool,
}

impl ObjString {
    /// Byte length without flattening.
    pub fn len(&self) -> usize {
        match &self.repr {
            StrRepr::Flat(s) => s.len(),
            StrRepr::Rope { len, .. } => *len,
        }
    }

    /// Returns `true` for the empty string.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Growable array of values.
#[derive(Debug, Clone, Default)]
pub struct ObjArray {
    /// Element storage.
    pub items: Vec<Value>,
}

/// Raw byte buffer.
#[derive(Debug, Clone, Default)]
pub struct ObjBytes {
    /// Buffer contents.
    pub data: Vec<u8>,
}

/// First-class runtime error object, as stored in catch slots.
#[derive(Debug, Clone)]
pub struct ObjError {
    /// Kind from the closed taxonomy.
    pub kind: ErrorKind,
    /// Structured message.
    pub message: String,
    /// Source location the error was raised at.
    pub location: Option<SourcePos>,
}

/// Enum instance.
#[derive(Debug, Clone)]
pub struct ObjEnum {
    /// Enum type name.
    pub type_name: ObjHandle,
    /// Variant name.
    pub variant_name: ObjHandle,
    /// Variant index within the enum declaration.
    pub variant_index: u8,
    /// Optional payload array.
    pub payload: Option<ObjHandle>,
}

/// Open file, at the boundary the stdlib collaborator sees.
#[derive(Debug)]
pub struct ObjFile {
    /// Native handle; `None` once closed.
    pub handle: Option<File>,
    /// Path the file was opened from.
    pub path: String,
    /// Whether dropping this object closes the native handle.
    pub owns_handle: bool,
}

impl ObjFile {
    /// Close the native handle. Idempotent; a second close is a no-op.
    pub fn close(&mut self) {
        if self.owns_handle {
            self.handle.take();
        }
    }
}

/// Compiled function consumed from the compiler collaborator.
#[derive(Debug, Clone)]
pub struct ObjFunction {
    /// Declared parameter count.
    pub arity: u8,
    /// Number of upvalues a closure over this function captures.
    pub upvalue_count: u8,
    /// Bytecode unit.
    pub chunk: Rc<Chunk<Value>>,
    /// Function name, for diagnostics.
    pub name: Option<String>,
    /// Stable id used by the profiler and the JIT entry cache.
    pub id: u32,
}

/// Function bundled with its captured upvalues.
#[derive(Debug, Clone)]
pub struct ObjClosure {
    /// The wrapped function.
    pub function: ObjHandle,
    /// Captured upvalue objects, in capture order.
    pub upvalues: Vec<ObjHandle>,
}

/// Captured variable state.
#[derive(Debug, Clone, Copy)]
pub enum UpvalueState {
    /// Aliases a live register slot by logical id.
    Open(u32),
    /// Owns its value after the slot went out of scope.
    Closed(Value),
}

/// Captured variable reference.
#[derive(Debug, Clone, Copy)]
pub struct ObjUpvalue {
    /// Open or closed state.
    pub state: UpvalueState,
}

impl ObjUpvalue {
    /// The register slot this upvalue aliases while open.
    pub const fn open_slot(&self) -> Option<u32> {
        match self.state {
            UpvalueState::Open(slot) => Some(slot),
            UpvalueState::Closed(_) => None,
        }
    }
}

/// Iterator over `[current, end)`.
#[derive(Debug, Clone, Copy)]
pub struct ObjRangeIter {
    /// Next value to produce.
    pub current: i64,
    /// Exclusive upper bound.
    pub end: i64,
}

/// Iterator over an array by index.
#[derive(Debug, Clone, Copy)]
pub struct ObjArrayIter {
    /// Array being iterated.
    pub array: ObjHandle,
    /// Next element index.
    pub index: usize,
}

/// Payload of a heap object.
#[derive(Debug)]
pub enum ObjData {
    /// UTF-8 string.
    Str(ObjString),
    /// Value array.
    Array(ObjArray),
    /// Byte buffer.
    Bytes(ObjBytes),
    /// Runtime error.
    Error(ObjError),
    /// Enum instance.
    Enum(ObjEnum),
    /// File handle.
    File(ObjFile),
    /// Compiled function.
    Function(ObjFunction),
    /// Closure.
    Closure(ObjClosure),
    /// Upvalue.
    Upvalue(ObjUpvalue),
    /// Range iterator.
    RangeIter(ObjRangeIter),
    /// Array iterator.
    ArrayIter(ObjArrayIter),
}

impl ObjData {
    /// Type tag for this payload.
    pub const fn kind(&self) -> ObjKind {
        match self {
            Self::Str(_) => ObjKind::Str,
            Self::Array(_) => ObjKind::Array,
            Self::Bytes(_) => ObjKind::Bytes,
            Self::Error(_) => ObjKind::Error,
            Self::Enum(_) => ObjKind::Enum,
            Self::File(_) => ObjKind::File,
            Self::Function(_) => ObjKind::Function,
            Self::Closure(_) => ObjKind::Closure,
            Self::Upvalue(_) => ObjKind::Upvalue,
            Self::RangeIter(_) => ObjKind::RangeIter,
            Self::ArrayIter(_) => ObjKind::ArrayIter,
        }
    }

    /// Human-readable kind name for error messages.
    pub const fn kind_name(&self) -> &'static str {
        match self.kind() {
            ObjKind::Str => "string",
            ObjKind::Array => "array",
            ObjKind::Bytes => "bytes",
            ObjKind::Error => "error",
            ObjKind::Enum => "enum",
            ObjKind::File => "file",
            ObjKind::Function => "function",
            ObjKind::Closure => "closure",
            ObjKind::Upvalue => "upvalue",
            ObjKind::RangeIter => "range",
            ObjKind::ArrayIter => "iterator",
        }
    }

    /// Enumerate the heap children of this object for the mark phase.
    pub fn children(&self, out: &mut Vec<ObjHandle>) {
        match self {
            Self::Str(s) => {
                if let StrRepr::Rope { left, right, .. } = s.repr {
                    out.push(left);
                    out.push(right);
                }
            }
            Self::Array(a) => out.extend(a.items.iter().filter_map(Value::as_obj)),
            Self::Enum(e) => {
                out.push(e.type_name);
                out.push(e.variant_name);
                if let Some(payload) = e.payload {
                    out.push(payload);
                }
            }
            Self::Function(f) => out.extend(f.chunk.constants().iter().filter_map(Value::as_obj)),
            Self::Closure(c) => {
                out.push(c.function);
                out.extend(c.upvalues.iter().copied());
            }
            Self::Upvalue(u) => {
                if let UpvalueState::Closed(v) = u.state {
                    out.extend(v.as_obj());
                }
            }
            Self::ArrayIter(it) => out.push(it.array),
            Self::Bytes(_) | Self::Error(_) | Self::File(_) | Self::RangeIter(_) => {}
        }
    }

    /// Shallow heap footprint used for allocation accounting.
    pub fn shallow_size(&self) -> usize {
        let payload = match self {
            Self::Str(s) => match &s.repr {
                StrRepr::Flat(s) => s.len(),
                StrRepr::Rope { .. } => 0,
            },
            Self::Array(a) => a.items.capacity() * mem::size_of::<Value>(),
            Self::Bytes(b) => b.data.capacity(),
            Self::Error(e) => e.message.len(),
            Self::Function(f) => f.chunk.len(),
            Self::Closure(c) => c.upvalues.capacity() * mem::size_of::<ObjHandle>(),
            Self::Enum(_) | Self::File(_) | Self::Upvalue(_) | Self::RangeIter(_) | Self::ArrayIter(_) => 0,
        };

        mem::size_of::<Self>() + payload
    }
}

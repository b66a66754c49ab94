//! Native function boundary
//!
//! Natives receive a read-only view of the argument registers and return a
//! single value. They must not retain references past the call; the context
//! only exposes the heap (for rendering and allocation) and the VM output
//! sink.

use std::fs::File;
use std::io::{Read, Write};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::{ErrorKind, RuntimeError};
use crate::heap::Heap;
use crate::object::{ObjBytes, ObjData, ObjFile};
use crate::value::Value;

/// Call context handed to a native function.
pub struct NativeCtx<'a> {
    /// The VM heap.
    pub heap: &'a mut Heap,
    /// The VM output sink.
    pub output: &'a mut dyn Write,
}

/// Native function signature: argument view in, one value out.
pub type NativeFn = fn(&mut NativeCtx<'_>, &[Value]) -> Result<Value, RuntimeError>;

/// Entry of the native-function table.
#[derive(Clone, Copy)]
pub struct NativeFunction {
    /// Name, for diagnostics and the GC root of its identity.
    pub name: &'static str,
    /// Expected argument count; `None` accepts any.
    pub arity: Option<u8>,
    /// The function pointer.
    pub func: NativeFn,
}

impl core::fmt::Debug for NativeFunction {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "NativeFunction({}, arity={:?})", self.name, self.arity)
    }
}

/// The builtin natives every VM instance starts with.
pub fn default_natives() -> Vec<NativeFunction> {
    vec![
        NativeFunction {
            name: "print",
            arity: None,
            func: native_print,
        },
        NativeFunction {
            name: "timestamp",
            arity: Some(0),
            func: native_timestamp,
        },
        NativeFunction {
            name: "len",
            arity: Some(1),
            func: native_len,
        },
        NativeFunction {
            name: "to_bytes",
            arity: Some(1),
            func: native_to_bytes,
        },
        NativeFunction {
            name: "file_open",
            arity: Some(1),
            func: native_file_open,
        },
        NativeFunction {
            name: "file_read",
            arity: Some(1),
            func: native_file_read,
        },
        NativeFunction {
            name: "file_close",
            arity: Some(1),
            func: native_file_close,
        },
    ]
}

fn native_print(ctx: &mut NativeCtx<'_>, args: &[Value]) -> Result<Value, RuntimeError> {
    let mut rendered = String::new();
    for (i, &arg) in args.iter().enumerate() {
        if i > 0 {
            rendered.push(' ');
        }
        rendered.push_str(&ctx.heap.render_value(arg));
    }
    rendered.push('\n');

    ctx.output
        .write_all(rendered.as_bytes())
        .map_err(|e| RuntimeError::new(ErrorKind::Io, e.to_string()))?;
    Ok(Value::Bool(true))
}

fn native_timestamp(_ctx: &mut NativeCtx<'_>, _args: &[Value]) -> Result<Value, RuntimeError> {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|e| RuntimeError::new(ErrorKind::Os, e.to_string()))?;
    Ok(Value::F64(now.as_secs_f64()))
}

fn native_len(ctx: &mut NativeCtx<'_>, args: &[Value]) -> Result<Value, RuntimeError> {
    let handle = args[0]
        .as_obj()
        .ok_or_else(|| RuntimeError::type_mismatch("string, array or bytes", args[0].kind()))?;

    let len = match ctx.heap.get(handle) {
        Some(ObjData::Str(s)) => s.len(),
        Some(ObjData::Array(a)) => a.items.len(),
        Some(ObjData::Bytes(b)) => b.data.len(),
        Some(other) => {
            return Err(RuntimeError::new(
                ErrorKind::Type,
                format!("len() does not apply to {}", other.kind_name()),
            ))
        }
        None => return Err(RuntimeError::new(ErrorKind::Runtime, "dangling object handle")),
    };

    i32::try_from(len)
        .map(Value::I32)
        .map_err(|_| RuntimeError::new(ErrorKind::Value, "length exceeds i32 range"))
}

fn native_to_bytes(ctx: &mut NativeCtx<'_>, args: &[Value]) -> Result<Value, RuntimeError> {
    let handle = args[0]
        .as_obj()
        .ok_or_else(|| RuntimeError::type_mismatch("string", args[0].kind()))?;

    ctx.heap
        .flatten(handle)
        .ok_or_else(|| RuntimeError::type_mismatch("string", args[0].kind()))?;
    let data = ctx
        .heap
        .flat_str(handle)
        .ok_or_else(|| RuntimeError::type_mismatch("string", args[0].kind()))?
        .as_bytes()
        .to_vec();

    let obj = ctx.heap.alloc(ObjData::Bytes(ObjBytes { data }));
    Ok(Value::Obj(obj))
}

fn native_file_open(ctx: &mut NativeCtx<'_>, args: &[Value]) -> Result<Value, RuntimeError> {
    let handle = args[0]
        .as_obj()
        .ok_or_else(|| RuntimeError::type_mismatch("string path", args[0].kind()))?;

    ctx.heap
        .flatten(handle)
        .ok_or_else(|| RuntimeError::type_mismatch("string path", args[0].kind()))?;
    let path = ctx
        .heap
        .flat_str(handle)
        .ok_or_else(|| RuntimeError::type_mismatch("string path", args[0].kind()))?
        .to_owned();

    let file = File::open(&path).map_err(|e| RuntimeError::new(ErrorKind::Io, format!("{path}: {e}")))?;
    let obj = ctx.heap.alloc(ObjData::File(ObjFile {
        handle: Some(file),
        path,
        owns_handle: true,
    }));
    Ok(Value::Obj(obj))
}

fn native_file_read(ctx: &mut NativeCtx<'_>, args: &[Value]) -> Result<Value, RuntimeError> {
    let handle = args[0]
        .as_obj()
        .ok_or_else(|| RuntimeError::type_mismatch("file", args[0].kind()))?;

    let mut text = String::new();
    match ctx.heap.get_mut(handle) {
        Some(ObjData::File(file)) => match &mut file.handle {
            Some(native) => {
                native
                    .read_to_string(&mut text)
                    .map_err(|e| RuntimeError::new(ErrorKind::Io, e.to_string()))?;
            }
            None => return Err(RuntimeError::new(ErrorKind::Io, "file is closed")),
        },
        _ => return Err(RuntimeError::type_mismatch("file", args[0].kind())),
    }

    Ok(Value::Obj(ctx.heap.alloc_string(&text)))
}

fn native_file_close(ctx: &mut NativeCtx<'_>, args: &[Value]) -> Result<Value, RuntimeError> {
    let handle = args[0]
        .as_obj()
        .ok_or_else(|| RuntimeError::type_mismatch("file", args[0].kind()))?;

    match ctx.heap.get_mut(handle) {
        Some(ObjData::File(file)) => {
            file.close();
            Ok(Value::Bool(true))
        }
        _ => Err(RuntimeError::type_mismatch("file", args[0].kind())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn print_renders_through_the_sink() {
        let mut heap = Heap::default();
        let s = heap.alloc_string("hi");
        let mut out = Vec::new();
        let mut ctx = NativeCtx {
            heap: &mut heap,
            output: &mut out,
        };

        native_print(&mut ctx, &[Value::I32(40), Value::Obj(s)]).unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), "40 hi\n");
    }

    #[test]
    fn len_covers_strings_and_arrays() {
        let mut heap = Heap::default();
        let s = heap.alloc_string("four");
        let mut out = Vec::new();
        let mut ctx = NativeCtx {
            heap: &mut heap,
            output: &mut out,
        };

        assert_eq!(native_len(&mut ctx, &[Value::Obj(s)]).unwrap(), Value::I32(4));
        let err = native_len(&mut ctx, &[Value::I32(1)]).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Type);
    }

    #[test]
    fn to_bytes_copies_string_contents() {
        let mut heap = Heap::default();
        let s = heap.alloc_string("abc");
        let mut out = Vec::new();
        let mut ctx = NativeCtx {
            heap: &mut heap,
            output: &mut out,
        };

        let v = native_to_bytes(&mut ctx, &[Value::Obj(s)]).unwrap();
        let handle = v.as_obj().unwrap();
        match ctx.heap.get(handle) {
            Some(ObjData::Bytes(b)) => assert_eq!(b.data, b"abc"),
            other => panic!("expected bytes, got {other:?}"),
        }
        assert_eq!(native_len(&mut ctx, &[v]).unwrap(), Value::I32(3));
    }

    #[test]
    fn timestamp_is_finite() {
        let mut heap = Heap::default();
        let mut out = Vec::new();
        let mut ctx = NativeCtx {
            heap: &mut heap,
            output: &mut out,
        };

        let v = native_timestamp(&mut ctx, &[]).unwrap();
        assert!(v.as_f64().unwrap().is_finite());
    }
}

//! String operations: ropes, flattening, rendering
//!
//! Concatenation produces a rope node above [`ROPE_THRESHOLD`]; observers
//! that need contiguous bytes flatten lazily through [`Heap::flatten`].

use core::fmt::Write;

use crate::consts::ROPE_THRESHOLD;
use crate::heap::Heap;
use crate::object::{ObjData, ObjString, StrRepr, UpvalueState};
use crate::value::{ObjHandle, Value};

const RENDER_DEPTH_LIMIT: usize = 8;

impl Heap {
    /// Concatenate two strings.
    ///
    /// Short results are flattened eagerly; longer ones become rope nodes
    /// resolved on first observation. Returns `None` when either handle is
    /// not a string.
    pub fn concat_strings(&mut self, left: ObjHandle, right: ObjHandle) -> Option<ObjHandle> {
        let left_len = self.string_len(left)?;
        let right_len = self.string_len(right)?;
        let len = left_len + right_len;

        if len <= ROPE_THRESHOLD {
            let mut text = String::with_capacity(len);
            self.append_flat(left, &mut text)?;
            self.append_flat(right, &mut text)?;
            return Some(self.alloc_string(&text));
        }

        Some(self.alloc(ObjData::Str(ObjString {
            repr: StrRepr::Rope { left, right, len },
            interned: false,
        })))
    }

    /// Byte length of a string without flattening.
    pub fn string_len(&self, handle: ObjHandle) -> Option<usize> {
        match self.get(handle)? {
            ObjData::Str(s) => Some(s.len()),
            _ => None,
        }
    }

    /// Flatten a rope in place so [`Heap::flat_str`] can borrow it.
    ///
    /// Flat strings pass through untouched. Returns `None` when the handle
    /// is not a string.
    pub fn flatten(&mut self, handle: ObjHandle) -> Option<()> {
        match self.get(handle)? {
            ObjData::Str(ObjString {
                repr: StrRepr::Flat(_), ..
            }) => return Some(()),
            ObjData::Str(_) => {}
            _ => return None,
        }

        let mut text = String::with_capacity(self.string_len(handle)?);
        self.append_flat(handle, &mut text)?;

        match self.get_mut(handle)? {
            ObjData::Str(s) => s.repr = StrRepr::Flat(text.into()),
            _ => return None,
        }
        Some(())
    }

    /// Borrow the contiguous bytes of an already-flat string.
    pub fn flat_str(&self, handle: ObjHandle) -> Option<&str> {
        match self.get(handle)? {
            ObjData::Str(ObjString {
                repr: StrRepr::Flat(s), ..
            }) => Some(s),
            _ => None,
        }
    }

    /// Append the full contents of a (possibly rope) string to `out`.
    fn append_flat(&self, handle: ObjHandle, out: &mut String) -> Option<()> {
        // Iterative walk; ropes may nest arbitrarily deep.
        let mut stack = vec![handle];
        while let Some(h) = stack.pop() {
            match self.get(h)? {
                ObjData::Str(ObjString {
                    repr: StrRepr::Flat(s), ..
                }) => out.push_str(s),
                ObjData::Str(ObjString {
                    repr: StrRepr::Rope { left, right, .. },
                    ..
                }) => {
                    stack.push(*right);
                    stack.push(*left);
                }
                _ => return None,
            }
        }
        Some(())
    }

    /// Content equality of two strings; handle equality short-circuits,
    /// which covers all interned pairs.
    pub fn strings_equal(&mut self, a: ObjHandle, b: ObjHandle) -> bool {
        if a == b {
            return true;
        }
        if self.flatten(a).is_none() || self.flatten(b).is_none() {
            return false;
        }

        match (self.flat_str(a), self.flat_str(b)) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        }
    }

    /// Render a value the way `Print` and `ToString` observe it.
    ///
    /// Rendering is an observer: ropes flatten, but no new heap objects are
    /// created.
    pub fn render_value(&mut self, value: Value) -> String {
        let mut out = String::new();
        self.render_into(value, &mut out, 0);
        out
    }

    fn render_into(&mut self, value: Value, out: &mut String, depth: usize) {
        if depth > RENDER_DEPTH_LIMIT {
            out.push_str("...");
            return;
        }

        match value {
            Value::I32(v) => {
                let _ = write!(out, "{v}");
            }
            Value::I64(v) => {
                let _ = write!(out, "{v}");
            }
            Value::U32(v) => {
                let _ = write!(out, "{v}");
            }
            Value::U64(v) => {
                let _ = write!(out, "{v}");
            }
            Value::F64(v) => {
                let _ = write!(out, "{v}");
            }
            Value::Bool(v) => {
                let _ = write!(out, "{v}");
            }
            Value::Obj(handle) => self.render_obj(handle, out, depth),
        }
    }

    fn render_obj(&mut self, handle: ObjHandle, out: &mut String, depth: usize) {
        if self.flatten(handle).is_some() {
            if let Some(s) = self.flat_str(handle) {
                out.push_str(s);
                return;
            }
        }

        enum Step {
            Array(Vec<Value>),
            Enum {
                type_name: ObjHandle,
                variant_name: ObjHandle,
                payload: Option<ObjHandle>,
            },
            Simple(String),
        }

        let step = match self.get(handle) {
            Some(ObjData::Array(a)) => Step::Array(a.items.clone()),
            Some(ObjData::Enum(e)) => Step::Enum {
                type_name: e.type_name,
                variant_name: e.variant_name,
                payload: e.payload,
            },
            Some(ObjData::Bytes(b)) => Step::Simple(format!("bytes[{}]", b.data.len())),
            Some(ObjData::Error(e)) => Step::Simple(format!("{}: {}", e.kind, e.message)),
            Some(ObjData::File(f)) => Step::Simple(format!("<file {}>", f.path)),
            Some(ObjData::Function(f)) => {
                Step::Simple(format!("<fn {}>", f.name.as_deref().unwrap_or("anonymous")))
            }
            Some(ObjData::Closure(c)) => {
                let name = match self.get(c.function) {
                    Some(ObjData::Function(f)) => f.name.clone().unwrap_or_else(|| "anonymous".into()),
                    _ => "anonymous".into(),
                };
                Step::Simple(format!("<fn {name}>"))
            }
            Some(ObjData::Upvalue(u)) => match u.state {
                UpvalueState::Closed(v) => {
                    self.render_into(v, out, depth + 1);
                    return;
                }
                UpvalueState::Open(slot) => Step::Simple(format!("<upvalue r{slot}>")),
            },
            Some(ObjData::RangeIter(r)) => Step::Simple(format!("{}..{}", r.current, r.end)),
            Some(ObjData::ArrayIter(_)) => Step::Simple("<iterator>".into()),
            Some(ObjData::Str(_)) | None => Step::Simple("<invalid>".into()),
        };

        match step {
            Step::Simple(s) => out.push_str(&s),
            Step::Array(items) => {
                out.push('[');
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        out.push_str(", ");
                    }
                    self.render_into(*item, out, depth + 1);
                }
                out.push(']');
            }
            Step::Enum {
                type_name,
                variant_name,
                payload,
            } => {
                self.render_obj(type_name, out, depth + 1);
                out.push('.');
                self.render_obj(variant_name, out, depth + 1);
                if let Some(payload) = payload {
                    let items = match self.get(payload) {
                        Some(ObjData::Array(a)) => a.items.clone(),
                        _ => Vec::new(),
                    };
                    out.push('(');
                    for (i, item) in items.iter().enumerate() {
                        if i > 0 {
                            out.push_str(", ");
                        }
                        self.render_into(*item, out, depth + 1);
                    }
                    out.push(')');
                }
            }
        }
    }
}

use std::io::Write;

use super::Interpreter;
use crate::error::{ErrorKind, RuntimeError};
use crate::object::{ObjArray, ObjArrayIter, ObjData, ObjEnum, ObjKind, ObjRangeIter};
use crate::value::{ObjHandle, Value};

impl Interpreter {
    /* strings */

    /// `Concat dst, a, b`: string concatenation through the rope builder.
    pub(crate) fn concat(&mut self) -> Result<(), RuntimeError> {
        let dst = self.fetch_reg()?;
        let a = self.fetch_reg()?;
        let b = self.fetch_reg()?;

        let left = self.reg_obj(a, "string")?;
        let right = self.reg_obj(b, "string")?;
        self.expect_kind(left, ObjKind::Str, "string")?;
        self.expect_kind(right, ObjKind::Str, "string")?;

        let result = self
            .heap
            .concat_strings(left, right)
            .ok_or_else(|| RuntimeError::new(ErrorKind::Type, "Expected string"))?;
        self.registers.set(dst, Value::Obj(result));
        Ok(())
    }

    /// `ToString dst, src`: render any value with the `Print` formatting.
    pub(crate) fn to_string(&mut self) -> Result<(), RuntimeError> {
        let dst = self.fetch_reg()?;
        let src = self.fetch_reg()?;

        let value = self.reg(src)?;
        let rendered = self.heap.render_value(value);
        let handle = self.heap.alloc_string(&rendered);
        self.registers.set(dst, Value::Obj(handle));
        Ok(())
    }

    /// `Print src`: render a value through the VM output sink.
    pub(crate) fn print(&mut self) -> Result<(), RuntimeError> {
        let src = self.fetch_reg()?;
        let value = self.reg(src)?;

        let mut rendered = self.heap.render_value(value);
        rendered.push('\n');
        self.output
            .write_all(rendered.as_bytes())
            .map_err(|e| RuntimeError::new(ErrorKind::Io, e.to_string()))
    }

    /* arrays */

    /// `MakeArray dst, first, count`: gather a register window.
    pub(crate) fn make_array(&mut self) -> Result<(), RuntimeError> {
        let dst = self.fetch_reg()?;
        let first = self.fetch_reg()?;
        let count = self.fetch_reg()?;

        let mut items = Vec::with_capacity(count as usize);
        for i in 0..count {
            items.push(self.reg(first + i)?);
        }

        let handle = self.heap.alloc(ObjData::Array(ObjArray { items }));
        self.registers.set(dst, Value::Obj(handle));
        Ok(())
    }

    pub(crate) fn array_get(&mut self) -> Result<(), RuntimeError> {
        let dst = self.fetch_reg()?;
        let arr = self.fetch_reg()?;
        let idx = self.fetch_reg()?;

        let array = self.reg_obj(arr, "array")?;
        let index = self.array_index(idx)?;

        let value = match self.obj_data(array)? {
            ObjData::Array(a) => {
                let len = a.items.len();
                *a.items
                    .get(usize::try_from(index).map_err(|_| RuntimeError::index_out_of_bounds(index, len))?)
                    .ok_or_else(|| RuntimeError::index_out_of_bounds(index, len))?
            }
            _ => return Err(RuntimeError::new(ErrorKind::Type, "Expected array")),
        };

        self.registers.set(dst, value);
        Ok(())
    }

    pub(crate) fn array_set(&mut self) -> Result<(), RuntimeError> {
        let arr = self.fetch_reg()?;
        let idx = self.fetch_reg()?;
        let src = self.fetch_reg()?;

        let array = self.reg_obj(arr, "array")?;
        let index = self.array_index(idx)?;
        let value = self.reg(src)?;

        match self.heap.get_mut(array) {
            Some(ObjData::Array(a)) => {
                let len = a.items.len();
                let slot = a
                    .items
                    .get_mut(usize::try_from(index).map_err(|_| RuntimeError::index_out_of_bounds(index, len))?)
                    .ok_or_else(|| RuntimeError::index_out_of_bounds(index, len))?;
                *slot = value;
                Ok(())
            }
            _ => Err(RuntimeError::new(ErrorKind::Type, "Expected array")),
        }
    }

    pub(crate) fn array_len(&mut self) -> Result<(), RuntimeError> {
        let dst = self.fetch_reg()?;
        let arr = self.fetch_reg()?;

        let array = self.reg_obj(arr, "array")?;
        let len = match self.obj_data(array)? {
            ObjData::Array(a) => a.items.len(),
            _ => return Err(RuntimeError::new(ErrorKind::Type, "Expected array")),
        };

        let len = i32::try_from(len).map_err(|_| RuntimeError::new(ErrorKind::Value, "length exceeds i32 range"))?;
        self.registers.store_i32(dst, len);
        Ok(())
    }

    pub(crate) fn array_push(&mut self) -> Result<(), RuntimeError> {
        let arr = self.fetch_reg()?;
        let src = self.fetch_reg()?;

        let array = self.reg_obj(arr, "array")?;
        let value = self.reg(src)?;

        match self.heap.get_mut(array) {
            Some(ObjData::Array(a)) => {
                a.items.push(value);
                Ok(())
            }
            _ => Err(RuntimeError::new(ErrorKind::Type, "Expected array")),
        }
    }

    fn array_index(&mut self, reg: u32) -> Result<i64, RuntimeError> {
        let value = self.reg(reg)?;
        match value {
            Value::I32(v) => Ok(v as i64),
            Value::I64(v) => Ok(v),
            Value::U32(v) => Ok(v as i64),
            Value::U64(v) => i64::try_from(v).map_err(|_| RuntimeError::index_out_of_bounds(i64::MAX, 0)),
            other => Err(RuntimeError::type_mismatch("integer index", other.kind())),
        }
    }

    /* ranges and iterators */

    /// `MakeRange dst, start, end`: a range value iterating `[start, end)`.
    pub(crate) fn make_range(&mut self) -> Result<(), RuntimeError> {
        let dst = self.fetch_reg()?;
        let start_reg = self.fetch_reg()?;
        let end_reg = self.fetch_reg()?;

        let start = self.range_bound(start_reg)?;
        let end = self.range_bound(end_reg)?;

        let handle = self.heap.alloc(ObjData::RangeIter(ObjRangeIter { current: start, end }));
        self.registers.set(dst, Value::Obj(handle));
        Ok(())
    }

    fn range_bound(&mut self, reg: u32) -> Result<i64, RuntimeError> {
        let value = self.reg(reg)?;
        match value {
            Value::I32(v) => Ok(v as i64),
            Value::I64(v) => Ok(v),
            other => Err(RuntimeError::type_mismatch("integer range bound", other.kind())),
        }
    }

    /// `GetIter dst, src`: arrays get an index iterator, ranges iterate
    /// themselves.
    pub(crate) fn get_iter(&mut self) -> Result<(), RuntimeError> {
        let dst = self.fetch_reg()?;
        let src = self.fetch_reg()?;

        let handle = self.reg_obj(src, "iterable")?;
        let kind = self.obj_data(handle)?.kind();
        let iter = match kind {
            ObjKind::Array => self
                .heap
                .alloc(ObjData::ArrayIter(ObjArrayIter { array: handle, index: 0 })),
            ObjKind::RangeIter | ObjKind::ArrayIter => handle,
            _ => {
                let name = self.obj_data(handle)?.kind_name();
                return Err(RuntimeError::new(
                    ErrorKind::Type,
                    format!("{name} is not iterable"),
                ));
            }
        };

        self.registers.set(dst, Value::Obj(iter));
        Ok(())
    }

    /// `IterNext dst, iter, exhaust`: write the next element or take the
    /// exhaustion jump.
    ///
    /// Advancing an iterator invalidates the destination slot's typed view
    /// implicitly through the boxed store.
    pub(crate) fn iter_next(&mut self) -> Result<(), RuntimeError> {
        let dst = self.fetch_reg()?;
        let iter_reg = self.fetch_reg()?;
        let offset = self.fetch_u16()? as usize;

        let iter = self.reg_obj(iter_reg, "iterator")?;

        enum Step {
            Value(Value),
            FromArray(ObjHandle, usize),
            Exhausted,
        }

        let step = match self.heap.get_mut(iter) {
            Some(ObjData::RangeIter(r)) => {
                if r.current < r.end {
                    let v = r.current;
                    r.current += 1;
                    Step::Value(if v >= i32::MIN as i64 && v <= i32::MAX as i64 {
                        Value::I32(v as i32)
                    } else {
                        Value::I64(v)
                    })
                } else {
                    Step::Exhausted
                }
            }
            Some(ObjData::ArrayIter(it)) => {
                let index = it.index;
                it.index += 1;
                Step::FromArray(it.array, index)
            }
            _ => return Err(RuntimeError::new(ErrorKind::Type, "Expected iterator")),
        };

        match step {
            Step::Value(v) => {
                self.registers.set(dst, v);
            }
            Step::FromArray(array, index) => {
                let element = match self.obj_data(array)? {
                    ObjData::Array(a) => a.items.get(index).copied(),
                    _ => return Err(RuntimeError::new(ErrorKind::Type, "iterator over a non-array")),
                };
                match element {
                    Some(v) => self.registers.set(dst, v),
                    None => self.jump_forward(offset),
                }
            }
            Step::Exhausted => self.jump_forward(offset),
        }
        Ok(())
    }

    /* enums */

    /// `MakeEnum dst, type_k, variant_k, idx, first, count`.
    pub(crate) fn make_enum(&mut self) -> Result<(), RuntimeError> {
        let dst = self.fetch_reg()?;
        let type_k = self.fetch_u16()?;
        let variant_k = self.fetch_u16()?;
        let variant_index = self.fetch_u8()?;
        let first = self.fetch_reg()?;
        let count = self.fetch_u8()?;

        let type_name = self.constant_string(type_k)?;
        let variant_name = self.constant_string(variant_k)?;

        let payload = if count > 0 {
            let mut items = Vec::with_capacity(count as usize);
            for i in 0..count as u32 {
                items.push(self.reg(first + i)?);
            }
            Some(self.heap.alloc(ObjData::Array(ObjArray { items })))
        } else {
            None
        };

        let handle = self.heap.alloc(ObjData::Enum(ObjEnum {
            type_name,
            variant_name,
            variant_index,
            payload,
        }));
        self.registers.set(dst, Value::Obj(handle));
        Ok(())
    }

    pub(crate) fn enum_tag(&mut self) -> Result<(), RuntimeError> {
        let dst = self.fetch_reg()?;
        let src = self.fetch_reg()?;

        let handle = self.reg_obj(src, "enum instance")?;
        let index = match self.obj_data(handle)? {
            ObjData::Enum(e) => e.variant_index,
            _ => return Err(RuntimeError::new(ErrorKind::Type, "Expected enum instance")),
        };

        self.registers.store_i32(dst, index as i32);
        Ok(())
    }

    pub(crate) fn enum_payload(&mut self) -> Result<(), RuntimeError> {
        let dst = self.fetch_reg()?;
        let src = self.fetch_reg()?;
        let idx = self.fetch_reg()?;

        let handle = self.reg_obj(src, "enum instance")?;
        let index = self.array_index(idx)?;

        let payload = match self.obj_data(handle)? {
            ObjData::Enum(e) => e.payload,
            _ => return Err(RuntimeError::new(ErrorKind::Type, "Expected enum instance")),
        };

        let payload = payload.ok_or_else(|| {
            RuntimeError::new(ErrorKind::Attribute, "enum variant carries no payload")
        })?;

        let value = match self.obj_data(payload)? {
            ObjData::Array(a) => {
                let len = a.items.len();
                *usize::try_from(index)
                    .ok()
                    .and_then(|i| a.items.get(i))
                    .ok_or_else(|| {
                        RuntimeError::new(
                            ErrorKind::Attribute,
                            format!("enum payload has no element {index} (length {len})"),
                        )
                    })?
            }
            _ => return Err(RuntimeError::new(ErrorKind::Runtime, "corrupt enum payload")),
        };

        self.registers.set(dst, value);
        Ok(())
    }

    fn constant_string(&mut self, index: u16) -> Result<ObjHandle, RuntimeError> {
        let value = *self
            .chunk
            .constant(index as usize)
            .map_err(|e| RuntimeError::new(ErrorKind::Runtime, e.to_string()))?;
        let handle = value
            .as_obj()
            .ok_or_else(|| RuntimeError::type_mismatch("string constant", value.kind()))?;
        self.expect_kind(handle, ObjKind::Str, "string constant")?;
        Ok(handle)
    }

    /* modules */

    /// `SelectModule id`: switch the active module register window.
    pub(crate) fn select_module(&mut self, id: u8) -> Result<(), RuntimeError> {
        if self.active_module == Some(id) {
            return Ok(());
        }
        if self.modules.get(id).is_none() {
            return Err(RuntimeError::new(
                ErrorKind::Import,
                format!("module id {id} is not loaded"),
            ));
        }

        // Write the outgoing window back to its stash.
        match self.active_module {
            Some(prev) => {
                let mut stash = [Value::default(); crate::consts::MODULE_REGISTERS];
                self.registers.save_module_window(&mut stash);
                if let Some(window) = self.modules.window_mut(prev) {
                    *window = stash;
                }
            }
            None => {
                let mut stash = self.script_window;
                self.registers.save_module_window(&mut stash);
                self.script_window = stash;
            }
        }

        // Load the incoming one.
        let incoming = *self
            .modules
            .window_mut(id)
            .expect("module id checked above");
        self.registers.load_module_window(&incoming);
        self.active_module = Some(id);
        Ok(())
    }

    /* spills */

    /// `SpillLoad dst, spill`: copy a spilled value into the window.
    pub(crate) fn spill_load(&mut self) -> Result<(), RuntimeError> {
        let dst = self.fetch_reg()?;
        let spill_id = self.fetch_u24()?;

        let value = self
            .registers
            .spill_manager_mut()
            .get(spill_id)
            .ok_or_else(|| RuntimeError::new(ErrorKind::Runtime, format!("read of unmapped spill register {spill_id}")))?;
        self.registers.set(dst, value);
        Ok(())
    }

    /// `SpillStore spill, src`: copy a window register into spill storage.
    pub(crate) fn spill_store(&mut self) -> Result<(), RuntimeError> {
        let spill_id = self.fetch_u24()?;
        let src = self.fetch_reg()?;

        let value = self.reg(src)?;
        self.registers.spill_manager_mut().set(spill_id, value);
        Ok(())
    }
}

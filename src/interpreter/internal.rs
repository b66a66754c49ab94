use orus_asm::SourcePos;

use super::Interpreter;
use crate::error::{ErrorKind, RuntimeError};
use crate::object::{ObjData, ObjKind};
use crate::value::{ObjHandle, Value, ValueKind};

impl Interpreter {
    /* operand decoding */

    pub(crate) fn fetch_u8(&mut self) -> Result<u8, RuntimeError> {
        let b = self
            .chunk
            .read_u8(self.ip)
            .map_err(|_| Self::truncated_stream())?;
        self.ip += 1;
        Ok(b)
    }

    pub(crate) fn fetch_u16(&mut self) -> Result<u16, RuntimeError> {
        let v = self
            .chunk
            .read_u16(self.ip)
            .map_err(|_| Self::truncated_stream())?;
        self.ip += 2;
        Ok(v)
    }

    pub(crate) fn fetch_u24(&mut self) -> Result<u32, RuntimeError> {
        let v = self
            .chunk
            .read_u24(self.ip)
            .map_err(|_| Self::truncated_stream())?;
        self.ip += 3;
        Ok(v)
    }

    pub(crate) fn fetch_reg(&mut self) -> Result<u32, RuntimeError> {
        self.fetch_u8().map(u32::from)
    }

    fn truncated_stream() -> RuntimeError {
        RuntimeError::new(ErrorKind::Runtime, "truncated instruction stream")
    }

    /* register access */

    pub(crate) fn reg(&mut self, id: u32) -> Result<Value, RuntimeError> {
        self.registers
            .get(id)
            .ok_or_else(|| RuntimeError::new(ErrorKind::Runtime, format!("read of unmapped spill register {id}")))
    }

    pub(crate) fn reg_obj(&mut self, id: u32, expected: &str) -> Result<ObjHandle, RuntimeError> {
        let value = self.reg(id)?;
        value
            .as_obj()
            .ok_or_else(|| RuntimeError::type_mismatch(expected, value.kind()))
    }

    pub(crate) fn read_i32_boxed(&mut self, id: u32) -> Result<i32, RuntimeError> {
        let value = self.reg(id)?;
        value
            .as_i32()
            .ok_or_else(|| RuntimeError::operands_must_be(ValueKind::I32))
    }

    pub(crate) fn read_i64_boxed(&mut self, id: u32) -> Result<i64, RuntimeError> {
        let value = self.reg(id)?;
        value
            .as_i64()
            .ok_or_else(|| RuntimeError::operands_must_be(ValueKind::I64))
    }

    pub(crate) fn read_u32_boxed(&mut self, id: u32) -> Result<u32, RuntimeError> {
        let value = self.reg(id)?;
        value
            .as_u32()
            .ok_or_else(|| RuntimeError::operands_must_be(ValueKind::U32))
    }

    pub(crate) fn read_u64_boxed(&mut self, id: u32) -> Result<u64, RuntimeError> {
        let value = self.reg(id)?;
        value
            .as_u64()
            .ok_or_else(|| RuntimeError::operands_must_be(ValueKind::U64))
    }

    pub(crate) fn read_f64_boxed(&mut self, id: u32) -> Result<f64, RuntimeError> {
        let value = self.reg(id)?;
        value
            .as_f64()
            .ok_or_else(|| RuntimeError::operands_must_be(ValueKind::F64))
    }

    pub(crate) fn read_condition(&mut self, id: u32) -> Result<bool, RuntimeError> {
        if let Some(b) = self.registers.try_read_bool(id) {
            return Ok(b);
        }
        let value = self.reg(id)?;
        value
            .as_bool()
            .ok_or_else(|| RuntimeError::non_boolean_condition(value.kind()))
    }

    /* heap access */

    pub(crate) fn obj_data(&self, handle: ObjHandle) -> Result<&ObjData, RuntimeError> {
        self.heap
            .get(handle)
            .ok_or_else(|| RuntimeError::new(ErrorKind::Runtime, "dangling object handle"))
    }

    pub(crate) fn expect_kind(&self, handle: ObjHandle, kind: ObjKind, expected: &str) -> Result<(), RuntimeError> {
        match self.heap.kind_of(handle) {
            Some(k) if k == kind => Ok(()),
            Some(_) | None => Err(RuntimeError::new(
                ErrorKind::Type,
                format!("Expected {expected}"),
            )),
        }
    }

    /// Resolve a callable register value to `(callee, function)` handles;
    /// `callee` is the closure when one is involved.
    pub(crate) fn resolve_callable(&self, value: Value) -> Result<(ObjHandle, ObjHandle), RuntimeError> {
        let handle = value
            .as_obj()
            .ok_or_else(|| RuntimeError::type_mismatch("function or closure", value.kind()))?;

        match self.heap.get(handle) {
            Some(ObjData::Function(_)) => Ok((handle, handle)),
            Some(ObjData::Closure(c)) => Ok((handle, c.function)),
            Some(other) => Err(RuntimeError::new(
                ErrorKind::Type,
                format!("{} is not callable", other.kind_name()),
            )),
            None => Err(RuntimeError::new(ErrorKind::Runtime, "dangling object handle")),
        }
    }

    /* locations and safepoints */

    /// Source position of the instruction currently executing.
    pub(crate) fn current_location(&self) -> Option<SourcePos> {
        self.chunk.locate(self.op_start)
    }

    /// Logical safepoint: reconcile the typed cache and collect when the
    /// allocation threshold demands it.
    ///
    /// Runs at loop back-edges, function entry and before allocating
    /// opcodes; never inside one.
    pub(crate) fn safepoint(&mut self) {
        if self.heap.should_collect() {
            self.collect_garbage();
        }
    }
}

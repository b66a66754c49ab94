use orus_asm::Opcode;

use crate::error::{ErrorKind, RuntimeError};
use crate::interpreter::alu::{check_f64, div_f64, div_i32, div_i64, mod_i32, mod_i64, NumericOp};
use crate::interpreter::Interpreter;
use crate::params::ProfilingFlags;
use crate::profiler::InstructionLocation;
use crate::state::ExecuteState;
use crate::value::{Value, ValueKind};

impl Interpreter {
    /// Execute one instruction.
    ///
    /// State machine per instruction: decode, run the handler, and either
    /// proceed with the advanced ip or surface a runtime error for the
    /// dispatch loop to unwind.
    pub fn execute(&mut self) -> Result<ExecuteState, RuntimeError> {
        self.op_start = self.ip;
        let op = Opcode::from(self.fetch_u8()?);

        if tracing::enabled!(tracing::Level::TRACE) {
            tracing::trace!("{}", self.chunk.disassemble_at(self.op_start));
        }

        // Allocating opcodes are safepoints; collection may run before the
        // handler holds any intermediate handle.
        if op.may_allocate() {
            self.safepoint();
        }

        if self.params.profiling.contains(ProfilingFlags::INSTRUCTIONS) {
            let location = InstructionLocation::new(self.current_function, self.op_start as u32);
            self.profiler.record_instruction(location);
        }
        if self.params.profiling.contains(ProfilingFlags::HOT_PATHS) {
            if let Ok(next) = self.chunk.next_offset(self.op_start) {
                self.profiler
                    .fusion_mut()
                    .push(op, self.op_start as u32, next as u32);
            }
        }

        self.instruction(op)
    }

    fn instruction(&mut self, op: Opcode) -> Result<ExecuteState, RuntimeError> {
        use Opcode::*;

        match op {
            Nop => {}

            /* constants and loads */
            LoadConst => {
                let dst = self.fetch_reg()?;
                let k = self.fetch_u16()?;
                let value = *self
                    .chunk
                    .constant(k as usize)
                    .map_err(|e| RuntimeError::new(ErrorKind::Runtime, e.to_string()))?;
                self.registers.set(dst, value);
            }
            LoadI32Const => {
                let dst = self.fetch_reg()?;
                let v = self.typed_constant(|v| v.as_i32(), ValueKind::I32)?;
                self.registers.store_i32(dst, v);
            }
            LoadI64Const => {
                let dst = self.fetch_reg()?;
                let v = self.typed_constant(|v| v.as_i64(), ValueKind::I64)?;
                self.registers.store_i64(dst, v);
            }
            LoadU32Const => {
                let dst = self.fetch_reg()?;
                let v = self.typed_constant(|v| v.as_u32(), ValueKind::U32)?;
                self.registers.store_u32(dst, v);
            }
            LoadU64Const => {
                let dst = self.fetch_reg()?;
                let v = self.typed_constant(|v| v.as_u64(), ValueKind::U64)?;
                self.registers.store_u64(dst, v);
            }
            LoadF64Const => {
                let dst = self.fetch_reg()?;
                let v = self.typed_constant(|v| v.as_f64(), ValueKind::F64)?;
                self.registers.store_f64(dst, v);
            }
            LoadTrue => {
                let dst = self.fetch_reg()?;
                self.registers.store_bool(dst, true);
            }
            LoadFalse => {
                let dst = self.fetch_reg()?;
                self.registers.store_bool(dst, false);
            }

            /* moves */
            Move => {
                let dst = self.fetch_reg()?;
                let src = self.fetch_reg()?;
                let value = self.reg(src)?;
                self.registers.set(dst, value);
            }
            MoveI32 => {
                let dst = self.fetch_reg()?;
                let src = self.fetch_reg()?;
                match self.registers.try_read_i32(src) {
                    Some(v) => self.registers.store_i32_hot(dst, v),
                    None => {
                        let v = self.read_i32_boxed(src)?;
                        self.registers.store_i32(dst, v);
                    }
                }
            }
            MoveI64 => {
                let dst = self.fetch_reg()?;
                let src = self.fetch_reg()?;
                match self.registers.try_read_i64(src) {
                    Some(v) => self.registers.store_i64_hot(dst, v),
                    None => {
                        let v = self.read_i64_boxed(src)?;
                        self.registers.store_i64(dst, v);
                    }
                }
            }
            MoveU32 => {
                let dst = self.fetch_reg()?;
                let src = self.fetch_reg()?;
                match self.registers.try_read_u32(src) {
                    Some(v) => self.registers.store_u32_hot(dst, v),
                    None => {
                        let v = self.read_u32_boxed(src)?;
                        self.registers.store_u32(dst, v);
                    }
                }
            }
            MoveU64 => {
                let dst = self.fetch_reg()?;
                let src = self.fetch_reg()?;
                match self.registers.try_read_u64(src) {
                    Some(v) => self.registers.store_u64_hot(dst, v),
                    None => {
                        let v = self.read_u64_boxed(src)?;
                        self.registers.store_u64(dst, v);
                    }
                }
            }
            MoveF64 => {
                let dst = self.fetch_reg()?;
                let src = self.fetch_reg()?;
                match self.registers.try_read_f64(src) {
                    Some(v) => self.registers.store_f64_hot(dst, v),
                    None => {
                        let v = self.read_f64_boxed(src)?;
                        self.registers.store_f64(dst, v);
                    }
                }
            }
            SpillLoad => self.spill_load()?,
            SpillStore => self.spill_store()?,

            /* typed arithmetic */
            AddI32 => {
                let (dst, a, b) = self.fetch_abc()?;
                self.alu_i32(dst, a, b, |x, y| {
                    x.checked_add(y)
                        .ok_or_else(|| RuntimeError::integer_overflow(ValueKind::I32))
                })?;
            }
            SubI32 => {
                let (dst, a, b) = self.fetch_abc()?;
                self.alu_i32(dst, a, b, |x, y| {
                    x.checked_sub(y)
                        .ok_or_else(|| RuntimeError::integer_overflow(ValueKind::I32))
                })?;
            }
            MulI32 => {
                let (dst, a, b) = self.fetch_abc()?;
                self.alu_i32(dst, a, b, |x, y| {
                    x.checked_mul(y)
                        .ok_or_else(|| RuntimeError::integer_overflow(ValueKind::I32))
                })?;
            }
            DivI32 => {
                let (dst, a, b) = self.fetch_abc()?;
                self.alu_i32(dst, a, b, div_i32)?;
            }
            ModI32 => {
                let (dst, a, b) = self.fetch_abc()?;
                self.alu_i32(dst, a, b, mod_i32)?;
            }
            AddI64 => {
                let (dst, a, b) = self.fetch_abc()?;
                self.alu_i64(dst, a, b, |x, y| {
                    x.checked_add(y)
                        .ok_or_else(|| RuntimeError::integer_overflow(ValueKind::I64))
                })?;
            }
            SubI64 => {
                let (dst, a, b) = self.fetch_abc()?;
                self.alu_i64(dst, a, b, |x, y| {
                    x.checked_sub(y)
                        .ok_or_else(|| RuntimeError::integer_overflow(ValueKind::I64))
                })?;
            }
            MulI64 => {
                let (dst, a, b) = self.fetch_abc()?;
                self.alu_i64(dst, a, b, |x, y| {
                    x.checked_mul(y)
                        .ok_or_else(|| RuntimeError::integer_overflow(ValueKind::I64))
                })?;
            }
            DivI64 => {
                let (dst, a, b) = self.fetch_abc()?;
                self.alu_i64(dst, a, b, div_i64)?;
            }
            ModI64 => {
                let (dst, a, b) = self.fetch_abc()?;
                self.alu_i64(dst, a, b, mod_i64)?;
            }
            AddU32 => {
                let (dst, a, b) = self.fetch_abc()?;
                self.alu_u32(dst, a, b, |x, y| {
                    x.checked_add(y)
                        .ok_or_else(|| RuntimeError::integer_overflow(ValueKind::U32))
                })?;
            }
            SubU32 => {
                let (dst, a, b) = self.fetch_abc()?;
                self.alu_u32(dst, a, b, |x, y| {
                    x.checked_sub(y)
                        .ok_or_else(|| RuntimeError::integer_overflow(ValueKind::U32))
                })?;
            }
            MulU32 => {
                let (dst, a, b) = self.fetch_abc()?;
                self.alu_u32(dst, a, b, |x, y| {
                    x.checked_mul(y)
                        .ok_or_else(|| RuntimeError::integer_overflow(ValueKind::U32))
                })?;
            }
            DivU32 => {
                let (dst, a, b) = self.fetch_abc()?;
                self.alu_u32(dst, a, b, |x, y| {
                    if y == 0 {
                        Err(RuntimeError::division_by_zero())
                    } else {
                        Ok(x / y)
                    }
                })?;
            }
            ModU32 => {
                let (dst, a, b) = self.fetch_abc()?;
                self.alu_u32(dst, a, b, |x, y| {
                    if y == 0 {
                        Err(RuntimeError::division_by_zero())
                    } else {
                        Ok(x % y)
                    }
                })?;
            }
            AddU64 => {
                let (dst, a, b) = self.fetch_abc()?;
                self.alu_u64(dst, a, b, |x, y| {
                    x.checked_add(y)
                        .ok_or_else(|| RuntimeError::integer_overflow(ValueKind::U64))
                })?;
            }
            SubU64 => {
                let (dst, a, b) = self.fetch_abc()?;
                self.alu_u64(dst, a, b, |x, y| {
                    x.checked_sub(y)
                        .ok_or_else(|| RuntimeError::integer_overflow(ValueKind::U64))
                })?;
            }
            MulU64 => {
                let (dst, a, b) = self.fetch_abc()?;
                self.alu_u64(dst, a, b, |x, y| {
                    x.checked_mul(y)
                        .ok_or_else(|| RuntimeError::integer_overflow(ValueKind::U64))
                })?;
            }
            DivU64 => {
                let (dst, a, b) = self.fetch_abc()?;
                self.alu_u64(dst, a, b, |x, y| {
                    if y == 0 {
                        Err(RuntimeError::division_by_zero())
                    } else {
                        Ok(x / y)
                    }
                })?;
            }
            ModU64 => {
                let (dst, a, b) = self.fetch_abc()?;
                self.alu_u64(dst, a, b, |x, y| {
                    if y == 0 {
                        Err(RuntimeError::division_by_zero())
                    } else {
                        Ok(x % y)
                    }
                })?;
            }
            AddF64 => {
                let (dst, a, b) = self.fetch_abc()?;
                self.alu_f64(dst, a, b, |x, y| check_f64(x + y))?;
            }
            SubF64 => {
                let (dst, a, b) = self.fetch_abc()?;
                self.alu_f64(dst, a, b, |x, y| check_f64(x - y))?;
            }
            MulF64 => {
                let (dst, a, b) = self.fetch_abc()?;
                self.alu_f64(dst, a, b, |x, y| check_f64(x * y))?;
            }
            DivF64 => {
                let (dst, a, b) = self.fetch_abc()?;
                self.alu_f64(dst, a, b, div_f64)?;
            }
            ModF64 => {
                let (dst, a, b) = self.fetch_abc()?;
                self.alu_f64(dst, a, b, |x, y| {
                    if y == 0.0 {
                        Err(RuntimeError::division_by_zero())
                    } else {
                        check_f64(x % y)
                    }
                })?;
            }

            /* generic arithmetic */
            AddNumeric => {
                let (dst, a, b) = self.fetch_abc()?;
                self.numeric_binary(dst, a, b, NumericOp::Add)?;
            }
            SubNumeric => {
                let (dst, a, b) = self.fetch_abc()?;
                self.numeric_binary(dst, a, b, NumericOp::Sub)?;
            }
            MulNumeric => {
                let (dst, a, b) = self.fetch_abc()?;
                self.numeric_binary(dst, a, b, NumericOp::Mul)?;
            }
            DivNumeric => {
                let (dst, a, b) = self.fetch_abc()?;
                self.numeric_binary(dst, a, b, NumericOp::Div)?;
            }
            ModNumeric => {
                let (dst, a, b) = self.fetch_abc()?;
                self.numeric_binary(dst, a, b, NumericOp::Mod)?;
            }
            Negate => {
                let dst = self.fetch_reg()?;
                let src = self.fetch_reg()?;
                self.negate(dst, src)?;
            }

            /* comparisons */
            LtI32 => {
                let (dst, a, b) = self.fetch_abc()?;
                self.cmp_i32(dst, a, b, |x, y| x < y)?;
            }
            LeI32 => {
                let (dst, a, b) = self.fetch_abc()?;
                self.cmp_i32(dst, a, b, |x, y| x <= y)?;
            }
            GtI32 => {
                let (dst, a, b) = self.fetch_abc()?;
                self.cmp_i32(dst, a, b, |x, y| x > y)?;
            }
            GeI32 => {
                let (dst, a, b) = self.fetch_abc()?;
                self.cmp_i32(dst, a, b, |x, y| x >= y)?;
            }
            LtI64 => {
                let (dst, a, b) = self.fetch_abc()?;
                self.cmp_i64(dst, a, b, |x, y| x < y)?;
            }
            LeI64 => {
                let (dst, a, b) = self.fetch_abc()?;
                self.cmp_i64(dst, a, b, |x, y| x <= y)?;
            }
            GtI64 => {
                let (dst, a, b) = self.fetch_abc()?;
                self.cmp_i64(dst, a, b, |x, y| x > y)?;
            }
            GeI64 => {
                let (dst, a, b) = self.fetch_abc()?;
                self.cmp_i64(dst, a, b, |x, y| x >= y)?;
            }
            LtU32 => {
                let (dst, a, b) = self.fetch_abc()?;
                self.cmp_u32(dst, a, b, |x, y| x < y)?;
            }
            LeU32 => {
                let (dst, a, b) = self.fetch_abc()?;
                self.cmp_u32(dst, a, b, |x, y| x <= y)?;
            }
            GtU32 => {
                let (dst, a, b) = self.fetch_abc()?;
                self.cmp_u32(dst, a, b, |x, y| x > y)?;
            }
            GeU32 => {
                let (dst, a, b) = self.fetch_abc()?;
                self.cmp_u32(dst, a, b, |x, y| x >= y)?;
            }
            LtU64 => {
                let (dst, a, b) = self.fetch_abc()?;
                self.cmp_u64(dst, a, b, |x, y| x < y)?;
            }
            LeU64 => {
                let (dst, a, b) = self.fetch_abc()?;
                self.cmp_u64(dst, a, b, |x, y| x <= y)?;
            }
            GtU64 => {
                let (dst, a, b) = self.fetch_abc()?;
                self.cmp_u64(dst, a, b, |x, y| x > y)?;
            }
            GeU64 => {
                let (dst, a, b) = self.fetch_abc()?;
                self.cmp_u64(dst, a, b, |x, y| x >= y)?;
            }
            LtF64 => {
                let (dst, a, b) = self.fetch_abc()?;
                self.cmp_f64(dst, a, b, |x, y| x < y)?;
            }
            LeF64 => {
                let (dst, a, b) = self.fetch_abc()?;
                self.cmp_f64(dst, a, b, |x, y| x <= y)?;
            }
            GtF64 => {
                let (dst, a, b) = self.fetch_abc()?;
                self.cmp_f64(dst, a, b, |x, y| x > y)?;
            }
            GeF64 => {
                let (dst, a, b) = self.fetch_abc()?;
                self.cmp_f64(dst, a, b, |x, y| x >= y)?;
            }
            Eq => {
                let (dst, a, b) = self.fetch_abc()?;
                let x = self.reg(a)?;
                let y = self.reg(b)?;
                let equal = self.values_equal(x, y);
                self.registers.store_bool(dst, equal);
            }
            Ne => {
                let (dst, a, b) = self.fetch_abc()?;
                let x = self.reg(a)?;
                let y = self.reg(b)?;
                let equal = self.values_equal(x, y);
                self.registers.store_bool(dst, !equal);
            }
            Not => {
                let dst = self.fetch_reg()?;
                let src = self.fetch_reg()?;
                let v = self.read_condition(src)?;
                self.registers.store_bool(dst, !v);
            }
            Convert => {
                let dst = self.fetch_reg()?;
                let src = self.fetch_reg()?;
                let kind = self.fetch_u8()?;
                let target = ValueKind::from_u8(kind)
                    .ok_or_else(|| RuntimeError::new(ErrorKind::Runtime, "invalid conversion target"))?;
                self.convert(dst, src, target)?;
            }

            /* control flow */
            Jump => {
                let offset = self.fetch_u16()? as usize;
                self.jump_forward(offset);
            }
            JumpShort => {
                let offset = self.fetch_u8()? as usize;
                self.jump_forward(offset);
            }
            JumpIfFalse => {
                let cond = self.fetch_reg()?;
                let offset = self.fetch_u16()? as usize;
                let taken = !self.read_condition(cond)?;
                self.profiler.record_branch(
                    InstructionLocation::new(self.current_function, self.op_start as u32),
                    taken,
                );
                if taken {
                    self.jump_forward(offset);
                }
            }
            JumpIfFalseShort => {
                let cond = self.fetch_reg()?;
                let offset = self.fetch_u8()? as usize;
                let taken = !self.read_condition(cond)?;
                self.profiler.record_branch(
                    InstructionLocation::new(self.current_function, self.op_start as u32),
                    taken,
                );
                if taken {
                    self.jump_forward(offset);
                }
            }
            JumpIfTrue => {
                let cond = self.fetch_reg()?;
                let offset = self.fetch_u16()? as usize;
                let taken = self.read_condition(cond)?;
                self.profiler.record_branch(
                    InstructionLocation::new(self.current_function, self.op_start as u32),
                    taken,
                );
                if taken {
                    self.jump_forward(offset);
                }
            }
            Loop => {
                let offset = self.fetch_u16()? as usize;
                self.jump_back(offset)?;
            }
            IncCmpJmp => self.inc_cmp_jmp()?,
            DecCmpJmp => self.dec_cmp_jmp()?,

            /* calls */
            Call => self.call()?,
            CallNative => self.call_native()?,
            TailCall => self.tail_call()?,
            Return => {
                let src = self.fetch_reg()?;
                let value = self.reg(src)?;
                return self.do_return(Some(value));
            }
            ReturnVoid => return self.do_return(None),

            /* closures */
            Closure => self.make_closure()?,
            GetUpvalue => self.get_upvalue()?,
            SetUpvalue => self.set_upvalue()?,
            CloseUpvalue => {
                let slot = self.fetch_reg()?;
                self.close_upvalue_at(slot)?;
            }

            /* exceptions */
            SetupExcept => self.setup_except()?,
            PopExcept => self.pop_except()?,
            Raise => self.raise()?,

            /* GC control */
            GcPause => self.heap.pause(),
            GcResume => self.heap.resume(),

            /* strings, arrays, iterators, enums */
            Concat => self.concat()?,
            ToString => self.to_string()?,
            MakeArray => self.make_array()?,
            ArrayGet => self.array_get()?,
            ArraySet => self.array_set()?,
            ArrayLen => self.array_len()?,
            ArrayPush => self.array_push()?,
            MakeRange => self.make_range()?,
            GetIter => self.get_iter()?,
            IterNext => self.iter_next()?,
            MakeEnum => self.make_enum()?,
            EnumTag => self.enum_tag()?,
            EnumPayload => self.enum_payload()?,

            /* modules */
            SelectModule => {
                let id = self.fetch_u8()?;
                self.select_module(id)?;
            }

            Print => self.print()?,
            Halt => return Ok(ExecuteState::Halt),

            // `Invalid` and any opcode this build does not carry.
            _ => {
                return Err(RuntimeError::new(
                    ErrorKind::Unimplemented,
                    format!("unknown opcode byte at offset {}", self.op_start),
                ))
            }
        }

        Ok(ExecuteState::Proceed)
    }

    fn fetch_abc(&mut self) -> Result<(u32, u32, u32), RuntimeError> {
        Ok((self.fetch_reg()?, self.fetch_reg()?, self.fetch_reg()?))
    }

    fn typed_constant<T>(&mut self, extract: impl Fn(&Value) -> Option<T>, kind: ValueKind) -> Result<T, RuntimeError> {
        let k = self.fetch_u16()?;
        let value = self
            .chunk
            .constant(k as usize)
            .map_err(|e| RuntimeError::new(ErrorKind::Runtime, e.to_string()))?;
        extract(value).ok_or_else(|| RuntimeError::type_mismatch(kind.name(), value.kind()))
    }
}

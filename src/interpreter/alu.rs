use super::Interpreter;
use crate::error::{ErrorKind, RuntimeError};
use crate::object::ObjData;
use crate::value::{Value, ValueKind};

/// Checked `i32` division; `INT32_MIN / -1` overflows.
pub(crate) fn div_i32(x: i32, y: i32) -> Result<i32, RuntimeError> {
    if y == 0 {
        return Err(RuntimeError::division_by_zero());
    }
    x.checked_div(y)
        .ok_or_else(|| RuntimeError::integer_overflow(ValueKind::I32))
}

/// `i32` remainder; `INT32_MIN % -1` yields zero instead of raising.
pub(crate) fn mod_i32(x: i32, y: i32) -> Result<i32, RuntimeError> {
    if y == 0 {
        return Err(RuntimeError::division_by_zero());
    }
    Ok(x.wrapping_rem(y))
}

/// Checked `i64` division; `INT64_MIN / -1` overflows.
pub(crate) fn div_i64(x: i64, y: i64) -> Result<i64, RuntimeError> {
    if y == 0 {
        return Err(RuntimeError::division_by_zero());
    }
    x.checked_div(y)
        .ok_or_else(|| RuntimeError::integer_overflow(ValueKind::I64))
}

/// `i64` remainder; `INT64_MIN % -1` yields zero instead of raising.
pub(crate) fn mod_i64(x: i64, y: i64) -> Result<i64, RuntimeError> {
    if y == 0 {
        return Err(RuntimeError::division_by_zero());
    }
    Ok(x.wrapping_rem(y))
}

/// Float results must stay finite; division by `0.0` raises.
pub(crate) fn check_f64(v: f64) -> Result<f64, RuntimeError> {
    if v.is_finite() {
        Ok(v)
    } else {
        Err(RuntimeError::non_finite_float())
    }
}

pub(crate) fn div_f64(x: f64, y: f64) -> Result<f64, RuntimeError> {
    if y == 0.0 {
        return Err(RuntimeError::division_by_zero());
    }
    check_f64(x / y)
}

impl Interpreter {
    /* typed arithmetic: typed-bank fast path with a boxed fallback that
     * must behave identically */

    pub(crate) fn alu_i32<F>(&mut self, dst: u32, a: u32, b: u32, f: F) -> Result<(), RuntimeError>
    where
        F: FnOnce(i32, i32) -> Result<i32, RuntimeError>,
    {
        let (x, y) = match (self.registers.try_read_i32(a), self.registers.try_read_i32(b)) {
            (Some(x), Some(y)) => (x, y),
            _ => (self.read_i32_boxed(a)?, self.read_i32_boxed(b)?),
        };
        let v = f(x, y)?;
        self.registers.store_i32_hot(dst, v);
        Ok(())
    }

    pub(crate) fn alu_i64<F>(&mut self, dst: u32, a: u32, b: u32, f: F) -> Result<(), RuntimeError>
    where
        F: FnOnce(i64, i64) -> Result<i64, RuntimeError>,
    {
        let (x, y) = match (self.registers.try_read_i64(a), self.registers.try_read_i64(b)) {
            (Some(x), Some(y)) => (x, y),
            _ => (self.read_i64_boxed(a)?, self.read_i64_boxed(b)?),
        };
        let v = f(x, y)?;
        self.registers.store_i64_hot(dst, v);
        Ok(())
    }

    pub(crate) fn alu_u32<F>(&mut self, dst: u32, a: u32, b: u32, f: F) -> Result<(), RuntimeError>
    where
        F: FnOnce(u32, u32) -> Result<u32, RuntimeError>,
    {
        let (x, y) = match (self.registers.try_read_u32(a), self.registers.try_read_u32(b)) {
            (Some(x), Some(y)) => (x, y),
            _ => (self.read_u32_boxed(a)?, self.read_u32_boxed(b)?),
        };
        let v = f(x, y)?;
        self.registers.store_u32_hot(dst, v);
        Ok(())
    }

    pub(crate) fn alu_u64<F>(&mut self, dst: u32, a: u32, b: u32, f: F) -> Result<(), RuntimeError>
    where
        F: FnOnce(u64, u64) -> Result<u64, RuntimeError>,
    {
        let (x, y) = match (self.registers.try_read_u64(a), self.registers.try_read_u64(b)) {
            (Some(x), Some(y)) => (x, y),
            _ => (self.read_u64_boxed(a)?, self.read_u64_boxed(b)?),
        };
        let v = f(x, y)?;
        self.registers.store_u64_hot(dst, v);
        Ok(())
    }

    pub(crate) fn alu_f64<F>(&mut self, dst: u32, a: u32, b: u32, f: F) -> Result<(), RuntimeError>
    where
        F: FnOnce(f64, f64) -> Result<f64, RuntimeError>,
    {
        let (x, y) = match (self.registers.try_read_f64(a), self.registers.try_read_f64(b)) {
            (Some(x), Some(y)) => (x, y),
            _ => (self.read_f64_boxed(a)?, self.read_f64_boxed(b)?),
        };
        let v = f(x, y)?;
        self.registers.store_f64_hot(dst, v);
        Ok(())
    }

    /* typed comparisons */

    pub(crate) fn cmp_i32<F>(&mut self, dst: u32, a: u32, b: u32, f: F) -> Result<(), RuntimeError>
    where
        F: FnOnce(i32, i32) -> bool,
    {
        let (x, y) = match (self.registers.try_read_i32(a), self.registers.try_read_i32(b)) {
            (Some(x), Some(y)) => (x, y),
            _ => (self.read_i32_boxed(a)?, self.read_i32_boxed(b)?),
        };
        self.registers.store_bool_hot(dst, f(x, y));
        Ok(())
    }

    pub(crate) fn cmp_i64<F>(&mut self, dst: u32, a: u32, b: u32, f: F) -> Result<(), RuntimeError>
    where
        F: FnOnce(i64, i64) -> bool,
    {
        let (x, y) = match (self.registers.try_read_i64(a), self.registers.try_read_i64(b)) {
            (Some(x), Some(y)) => (x, y),
            _ => (self.read_i64_boxed(a)?, self.read_i64_boxed(b)?),
        };
        self.registers.store_bool_hot(dst, f(x, y));
        Ok(())
    }

    pub(crate) fn cmp_u32<F>(&mut self, dst: u32, a: u32, b: u32, f: F) -> Result<(), RuntimeError>
    where
        F: FnOnce(u32, u32) -> bool,
    {
        let (x, y) = match (self.registers.try_read_u32(a), self.registers.try_read_u32(b)) {
            (Some(x), Some(y)) => (x, y),
            _ => (self.read_u32_boxed(a)?, self.read_u32_boxed(b)?),
        };
        self.registers.store_bool_hot(dst, f(x, y));
        Ok(())
    }

    pub(crate) fn cmp_u64<F>(&mut self, dst: u32, a: u32, b: u32, f: F) -> Result<(), RuntimeError>
    where
        F: FnOnce(u64, u64) -> bool,
    {
        let (x, y) = match (self.registers.try_read_u64(a), self.registers.try_read_u64(b)) {
            (Some(x), Some(y)) => (x, y),
            _ => (self.read_u64_boxed(a)?, self.read_u64_boxed(b)?),
        };
        self.registers.store_bool_hot(dst, f(x, y));
        Ok(())
    }

    pub(crate) fn cmp_f64<F>(&mut self, dst: u32, a: u32, b: u32, f: F) -> Result<(), RuntimeError>
    where
        F: FnOnce(f64, f64) -> bool,
    {
        let (x, y) = match (self.registers.try_read_f64(a), self.registers.try_read_f64(b)) {
            (Some(x), Some(y)) => (x, y),
            _ => (self.read_f64_boxed(a)?, self.read_f64_boxed(b)?),
        };
        self.registers.store_bool_hot(dst, f(x, y));
        Ok(())
    }

    /* generic numeric arithmetic */

    /// Type-dispatched arithmetic over the boxed operands.
    ///
    /// Same-width signed or unsigned integers compute checked; `i32`/`u32`
    /// addition, subtraction and multiplication promote to the wider type
    /// on overflow. Mixed sign or integer/float operands raise.
    pub(crate) fn numeric_binary(&mut self, dst: u32, a: u32, b: u32, op: NumericOp) -> Result<(), RuntimeError> {
        let x = self.reg(a)?;
        let y = self.reg(b)?;

        let result = match (x, y) {
            (Value::I32(x), Value::I32(y)) => op.apply_i32(x, y)?,
            (Value::I64(x), Value::I64(y)) => Value::I64(op.apply_i64(x, y)?),
            (Value::U32(x), Value::U32(y)) => op.apply_u32(x, y)?,
            (Value::U64(x), Value::U64(y)) => Value::U64(op.apply_u64(x, y)?),
            (Value::F64(x), Value::F64(y)) => Value::F64(op.apply_f64(x, y)?),
            (x, y) if x.kind().is_numeric() && y.kind().is_numeric() => {
                return Err(RuntimeError::mixed_arithmetic(x.kind(), y.kind()))
            }
            (x, y) => {
                let offender = if x.kind().is_numeric() { y } else { x };
                return Err(RuntimeError::type_mismatch("numeric operands", offender.kind()));
            }
        };

        self.registers.set(dst, result);
        Ok(())
    }

    pub(crate) fn negate(&mut self, dst: u32, src: u32) -> Result<(), RuntimeError> {
        let value = self.reg(src)?;
        let result = match value {
            Value::I32(v) => Value::I32(
                v.checked_neg()
                    .ok_or_else(|| RuntimeError::integer_overflow(ValueKind::I32))?,
            ),
            Value::I64(v) => Value::I64(
                v.checked_neg()
                    .ok_or_else(|| RuntimeError::integer_overflow(ValueKind::I64))?,
            ),
            Value::F64(v) => Value::F64(-v),
            other => return Err(RuntimeError::type_mismatch("signed numeric operand", other.kind())),
        };
        self.registers.set(dst, result);
        Ok(())
    }

    /// Numeric conversion to the target kind, checked for range.
    pub(crate) fn convert(&mut self, dst: u32, src: u32, target: ValueKind) -> Result<(), RuntimeError> {
        let value = self.reg(src)?;

        let out_of_range = || RuntimeError::new(ErrorKind::Value, format!("conversion out of {target} range"));

        let as_i64 = |v: Value| -> Option<i64> {
            match v {
                Value::I32(v) => Some(v as i64),
                Value::I64(v) => Some(v),
                Value::U32(v) => Some(v as i64),
                Value::U64(v) => i64::try_from(v).ok(),
                _ => None,
            }
        };

        let result = match (value, target) {
            (v, ValueKind::F64) => match v {
                Value::I32(x) => Value::F64(x as f64),
                Value::I64(x) => Value::F64(x as f64),
                Value::U32(x) => Value::F64(x as f64),
                Value::U64(x) => Value::F64(x as f64),
                Value::F64(x) => Value::F64(x),
                other => return Err(RuntimeError::type_mismatch("numeric operand", other.kind())),
            },
            (Value::F64(x), kind) => {
                if !x.is_finite() {
                    return Err(RuntimeError::non_finite_float());
                }
                let t = x.trunc();
                match kind {
                    ValueKind::I32 => (t >= i32::MIN as f64 && t <= i32::MAX as f64)
                        .then(|| Value::I32(t as i32))
                        .ok_or_else(out_of_range)?,
                    ValueKind::I64 => (t >= i64::MIN as f64 && t < i64::MAX as f64)
                        .then(|| Value::I64(t as i64))
                        .ok_or_else(out_of_range)?,
                    ValueKind::U32 => (t >= 0.0 && t <= u32::MAX as f64)
                        .then(|| Value::U32(t as u32))
                        .ok_or_else(out_of_range)?,
                    ValueKind::U64 => (t >= 0.0 && t < u64::MAX as f64)
                        .then(|| Value::U64(t as u64))
                        .ok_or_else(out_of_range)?,
                    _ => return Err(RuntimeError::type_mismatch("numeric target", ValueKind::F64)),
                }
            }
            (v, ValueKind::I32) => {
                let x = as_i64(v).ok_or_else(|| RuntimeError::type_mismatch("numeric operand", v.kind()))?;
                i32::try_from(x).map(Value::I32).map_err(|_| out_of_range())?
            }
            (v, ValueKind::I64) => {
                let x = as_i64(v).ok_or_else(|| RuntimeError::type_mismatch("numeric operand", v.kind()))?;
                Value::I64(x)
            }
            (v, ValueKind::U32) => {
                let x = as_i64(v).ok_or_else(|| RuntimeError::type_mismatch("numeric operand", v.kind()))?;
                u32::try_from(x).map(Value::U32).map_err(|_| out_of_range())?
            }
            (v, ValueKind::U64) => match v {
                Value::U64(x) => Value::U64(x),
                Value::U32(x) => Value::U64(x as u64),
                Value::I32(x) => u64::try_from(x).map(Value::U64).map_err(|_| out_of_range())?,
                Value::I64(x) => u64::try_from(x).map(Value::U64).map_err(|_| out_of_range())?,
                other => return Err(RuntimeError::type_mismatch("numeric operand", other.kind())),
            },
            (v, ValueKind::Bool | ValueKind::Heap) => {
                return Err(RuntimeError::type_mismatch("numeric target", v.kind()))
            }
        };

        self.registers.set(dst, result);
        Ok(())
    }

    /// Structural equality for `Eq`/`Ne`: primitives by value within the
    /// same kind, strings by content, other objects by identity. Distinct
    /// kinds compare unequal, never raise.
    pub(crate) fn values_equal(&mut self, a: Value, b: Value) -> bool {
        match (a, b) {
            (Value::Obj(x), Value::Obj(y)) => {
                let both_strings = matches!(self.heap.get(x), Some(ObjData::Str(_)))
                    && matches!(self.heap.get(y), Some(ObjData::Str(_)));
                if both_strings {
                    self.heap.strings_equal(x, y)
                } else {
                    x == y
                }
            }
            (a, b) => a == b,
        }
    }
}

/// Generic numeric operation selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum NumericOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
}

impl NumericOp {
    /// `i32` with promotion to `i64` on add/sub/mul overflow.
    fn apply_i32(self, x: i32, y: i32) -> Result<Value, RuntimeError> {
        let promoted = |v: i64| {
            i32::try_from(v)
                .map(Value::I32)
                .unwrap_or(Value::I64(v))
        };
        Ok(match self {
            Self::Add => promoted(x as i64 + y as i64),
            Self::Sub => promoted(x as i64 - y as i64),
            Self::Mul => promoted(x as i64 * y as i64),
            Self::Div => Value::I32(div_i32(x, y)?),
            Self::Mod => Value::I32(mod_i32(x, y)?),
        })
    }

    fn apply_i64(self, x: i64, y: i64) -> Result<i64, RuntimeError> {
        let overflow = || RuntimeError::integer_overflow(ValueKind::I64);
        match self {
            Self::Add => x.checked_add(y).ok_or_else(overflow),
            Self::Sub => x.checked_sub(y).ok_or_else(overflow),
            Self::Mul => x.checked_mul(y).ok_or_else(overflow),
            Self::Div => div_i64(x, y),
            Self::Mod => mod_i64(x, y),
        }
    }

    /// `u32` with promotion to `u64` on add/mul overflow; subtraction
    /// below zero raises.
    fn apply_u32(self, x: u32, y: u32) -> Result<Value, RuntimeError> {
        let promoted = |v: u64| {
            u32::try_from(v)
                .map(Value::U32)
                .unwrap_or(Value::U64(v))
        };
        Ok(match self {
            Self::Add => promoted(x as u64 + y as u64),
            Self::Sub => Value::U32(
                x.checked_sub(y)
                    .ok_or_else(|| RuntimeError::integer_overflow(ValueKind::U32))?,
            ),
            Self::Mul => promoted(x as u64 * y as u64),
            Self::Div => {
                if y == 0 {
                    return Err(RuntimeError::division_by_zero());
                }
                Value::U32(x / y)
            }
            Self::Mod => {
                if y == 0 {
                    return Err(RuntimeError::division_by_zero());
                }
                Value::U32(x % y)
            }
        })
    }

    fn apply_u64(self, x: u64, y: u64) -> Result<u64, RuntimeError> {
        let overflow = || RuntimeError::integer_overflow(ValueKind::U64);
        match self {
            Self::Add => x.checked_add(y).ok_or_else(overflow),
            Self::Sub => x.checked_sub(y).ok_or_else(overflow),
            Self::Mul => x.checked_mul(y).ok_or_else(overflow),
            Self::Div => {
                if y == 0 {
                    return Err(RuntimeError::division_by_zero());
                }
                Ok(x / y)
            }
            Self::Mod => {
                if y == 0 {
                    return Err(RuntimeError::division_by_zero());
                }
                Ok(x % y)
            }
        }
    }

    fn apply_f64(self, x: f64, y: f64) -> Result<f64, RuntimeError> {
        match self {
            Self::Add => check_f64(x + y),
            Self::Sub => check_f64(x - y),
            Self::Mul => check_f64(x * y),
            Self::Div => div_f64(x, y),
            Self::Mod => {
                if y == 0.0 {
                    return Err(RuntimeError::division_by_zero());
                }
                check_f64(x % y)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn int_min_edge_cases() {
        assert!(div_i32(i32::MIN, -1).is_err());
        assert_eq!(mod_i32(i32::MIN, -1).unwrap(), 0);
        assert!(div_i64(i64::MIN, -1).is_err());
        assert_eq!(mod_i64(i64::MIN, -1).unwrap(), 0);
    }

    #[test]
    fn division_by_zero_is_a_value_error() {
        let err = div_i32(7, 0).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Value);
        assert!(err.message.contains("Division by zero"));
    }

    #[test]
    fn float_results_must_be_finite() {
        assert!(check_f64(f64::MAX * 2.0).is_err());
        assert!(div_f64(1.0, 0.0).is_err());
        assert_eq!(div_f64(1.0, 2.0).unwrap(), 0.5);
    }

    #[test]
    fn generic_i32_overflow_promotes() {
        let v = NumericOp::Add.apply_i32(i32::MAX, 1).unwrap();
        assert_eq!(v, Value::I64(i32::MAX as i64 + 1));

        let v = NumericOp::Add.apply_i32(1, 2).unwrap();
        assert_eq!(v, Value::I32(3));
    }

    #[test]
    fn generic_u32_overflow_promotes() {
        let v = NumericOp::Mul.apply_u32(u32::MAX, 2).unwrap();
        assert_eq!(v, Value::U64(u32::MAX as u64 * 2));
    }

    #[test]
    fn wide_integer_overflow_raises() {
        assert!(NumericOp::Add.apply_i64(i64::MAX, 1).is_err());
        assert!(NumericOp::Add.apply_u64(u64::MAX, 1).is_err());
    }
}

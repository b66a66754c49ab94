use super::Interpreter;
use crate::consts::FRAME_REG_START;
use crate::error::{ErrorKind, RuntimeError};
use crate::object::{ObjClosure, ObjData, ObjUpvalue, UpvalueState};
use crate::value::{ObjHandle, Value};

impl Interpreter {
    /// `Closure dst, func_k, n, (is_local, index)*`: bundle a function
    /// with captured upvalues.
    pub(crate) fn make_closure(&mut self) -> Result<(), RuntimeError> {
        let dst = self.fetch_reg()?;
        let func_k = self.fetch_u16()?;
        let count = self.fetch_u8()?;

        let func_value = *self
            .chunk
            .constant(func_k as usize)
            .map_err(|e| RuntimeError::new(ErrorKind::Runtime, e.to_string()))?;
        let function = func_value
            .as_obj()
            .filter(|&h| matches!(self.heap.get(h), Some(ObjData::Function(_))))
            .ok_or_else(|| RuntimeError::type_mismatch("function constant", func_value.kind()))?;

        let mut upvalues = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let is_local = self.fetch_u8()? != 0;
            let index = self.fetch_u8()?;

            let upvalue = if is_local {
                self.capture_upvalue(index as u32)
            } else {
                self.enclosing_upvalue(index)?
            };
            upvalues.push(upvalue);
        }

        let closure = self.heap.alloc(ObjData::Closure(ObjClosure { function, upvalues }));
        self.registers.set(dst, Value::Obj(closure));
        Ok(())
    }

    /// Find or create the open upvalue aliasing a register slot.
    ///
    /// The open list stays strictly descending by slot with at most one
    /// entry per slot.
    fn capture_upvalue(&mut self, slot: u32) -> ObjHandle {
        let mut insert_at = self.open_upvalues.len();
        for (i, &handle) in self.open_upvalues.iter().enumerate() {
            match self.heap.get(handle) {
                Some(ObjData::Upvalue(u)) => match u.open_slot() {
                    Some(s) if s == slot => return handle,
                    Some(s) if s < slot => {
                        insert_at = i;
                        break;
                    }
                    _ => {}
                },
                _ => {}
            }
        }

        let handle = self.heap.alloc(ObjData::Upvalue(ObjUpvalue {
            state: UpvalueState::Open(slot),
        }));
        self.open_upvalues.insert(insert_at, handle);
        self.registers.mark_captured(slot);
        handle
    }

    /// Upvalue inherited from the enclosing closure.
    fn enclosing_upvalue(&mut self, index: u8) -> Result<ObjHandle, RuntimeError> {
        let callee = self
            .registers
            .current_frame()
            .map(|f| f.callee())
            .ok_or_else(|| RuntimeError::new(ErrorKind::Runtime, "no enclosing frame for upvalue capture"))?;

        match self.heap.get(callee) {
            Some(ObjData::Closure(c)) => c
                .upvalues
                .get(index as usize)
                .copied()
                .ok_or_else(|| RuntimeError::new(ErrorKind::Runtime, format!("upvalue index {index} out of range"))),
            _ => Err(RuntimeError::new(
                ErrorKind::Runtime,
                "enclosing callee carries no upvalues",
            )),
        }
    }

    fn current_closure(&self) -> Result<&ObjClosure, RuntimeError> {
        let callee = self
            .registers
            .current_frame()
            .map(|f| f.callee())
            .ok_or_else(|| RuntimeError::new(ErrorKind::Runtime, "upvalue access outside a closure"))?;

        match self.heap.get(callee) {
            Some(ObjData::Closure(c)) => Ok(c),
            _ => Err(RuntimeError::new(ErrorKind::Runtime, "upvalue access outside a closure")),
        }
    }

    /// `GetUpvalue dst, idx`: dereference through the current closure.
    pub(crate) fn get_upvalue(&mut self) -> Result<(), RuntimeError> {
        let dst = self.fetch_reg()?;
        let index = self.fetch_u8()?;

        let handle = self
            .current_closure()?
            .upvalues
            .get(index as usize)
            .copied()
            .ok_or_else(|| RuntimeError::new(ErrorKind::Runtime, format!("upvalue index {index} out of range")))?;

        let state = match self.obj_data(handle)? {
            ObjData::Upvalue(u) => u.state,
            _ => return Err(RuntimeError::new(ErrorKind::Runtime, "corrupt upvalue reference")),
        };
        let value = match state {
            UpvalueState::Open(slot) => self.reg(slot)?,
            UpvalueState::Closed(v) => v,
        };

        self.registers.set(dst, value);
        Ok(())
    }

    /// `SetUpvalue idx, src`: write through the current closure.
    pub(crate) fn set_upvalue(&mut self) -> Result<(), RuntimeError> {
        let index = self.fetch_u8()?;
        let src = self.fetch_reg()?;
        let value = self.reg(src)?;

        let handle = self
            .current_closure()?
            .upvalues
            .get(index as usize)
            .copied()
            .ok_or_else(|| RuntimeError::new(ErrorKind::Runtime, format!("upvalue index {index} out of range")))?;

        let open_slot = match self.obj_data(handle)? {
            ObjData::Upvalue(u) => u.open_slot(),
            _ => return Err(RuntimeError::new(ErrorKind::Runtime, "corrupt upvalue reference")),
        };

        match open_slot {
            Some(slot) => self.registers.set(slot, value),
            None => match self.heap.get_mut(handle) {
                Some(ObjData::Upvalue(u)) => u.state = UpvalueState::Closed(value),
                _ => return Err(RuntimeError::new(ErrorKind::Runtime, "corrupt upvalue reference")),
            },
        }
        Ok(())
    }

    /// `CloseUpvalue slot`: promote the open upvalue at a slot to closed.
    pub(crate) fn close_upvalue_at(&mut self, slot: u32) -> Result<(), RuntimeError> {
        if let Some(pos) = self.find_open(slot) {
            let handle = self.open_upvalues.remove(pos);
            self.close_single(handle, slot)?;
        }
        Ok(())
    }

    /// Close every open upvalue aliasing the frame+temp window; runs
    /// before the window is reused or restored so no upvalue dangles into
    /// another activation's registers.
    pub(crate) fn close_upvalues_in_window(&mut self) {
        let min = FRAME_REG_START as u32;
        while let Some((pos, slot)) = self.first_open_at_or_above(min) {
            let handle = self.open_upvalues.remove(pos);
            // The slot is live here, so the read cannot fail.
            let _ = self.close_single(handle, slot);
        }
    }

    fn first_open_at_or_above(&self, min_slot: u32) -> Option<(usize, u32)> {
        // The list is descending: the first entry at or above the floor is
        // at the front.
        for (i, &handle) in self.open_upvalues.iter().enumerate() {
            if let Some(ObjData::Upvalue(u)) = self.heap.get(handle) {
                match u.open_slot() {
                    Some(slot) if slot >= min_slot => return Some((i, slot)),
                    Some(_) => return None,
                    None => {}
                }
            }
        }
        None
    }

    fn find_open(&self, slot: u32) -> Option<usize> {
        self.open_upvalues.iter().position(|&handle| {
            matches!(
                self.heap.get(handle),
                Some(ObjData::Upvalue(u)) if u.open_slot() == Some(slot)
            )
        })
    }

    fn close_single(&mut self, handle: ObjHandle, slot: u32) -> Result<(), RuntimeError> {
        let value = self.reg(slot)?;
        match self.heap.get_mut(handle) {
            Some(ObjData::Upvalue(u)) => u.state = UpvalueState::Closed(value),
            _ => return Err(RuntimeError::new(ErrorKind::Runtime, "corrupt upvalue reference")),
        }
        self.registers.clear_captured(slot);
        Ok(())
    }

    /// The open-upvalue list invariant: strictly descending slots, no
    /// duplicates. Checked by tests after upvalue traffic.
    #[cfg(test)]
    pub(crate) fn assert_open_list_invariant(&self) {
        let mut previous: Option<u32> = None;
        for &handle in &self.open_upvalues {
            let slot = match self.heap.get(handle) {
                Some(ObjData::Upvalue(u)) => u.open_slot().expect("closed upvalue in open list"),
                _ => panic!("non-upvalue in open list"),
            };
            if let Some(prev) = previous {
                assert!(slot < prev, "open list not strictly descending: {slot} after {prev}");
            }
            previous = Some(slot);
        }
    }
}

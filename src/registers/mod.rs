//! Hierarchical register file
//!
//! Four banks (globals, frame, temp and the active module window) share
//! one 256-slot primary window, with ids past it served by the spill
//! manager. A typed cache mirrors the window for primitive values; every
//! boxed observer goes through accessors that reconcile dirty typed slots
//! first.

mod frame;
mod spill;
mod typed;

pub use frame::CallFrame;
pub use spill::SpillManager;
pub use typed::{TypedRegisters, TypedTag};

pub(crate) use typed::TypedBankPointers;

use orus_asm::Chunk;

use smallvec::SmallVec;
use std::rc::Rc;

use crate::consts::*;
use crate::error::RuntimeError;
use crate::value::{ObjHandle, Value};

/// The register file: primary window, typed mirror, spill overflow and the
/// call-frame stack.
#[derive(Debug)]
pub struct RegisterFile {
    primary: Box<[Value; PRIMARY_REGISTERS]>,
    typed: TypedRegisters,
    spill: SpillManager,
    frames: Vec<CallFrame>,
    captured: Box<[bool; PRIMARY_REGISTERS]>,
}

impl Default for RegisterFile {
    fn default() -> Self {
        Self {
            primary: Box::new([Value::Bool(false); PRIMARY_REGISTERS]),
            typed: TypedRegisters::default(),
            spill: SpillManager::default(),
            frames: Vec::new(),
            captured: Box::new([false; PRIMARY_REGISTERS]),
        }
    }
}

impl RegisterFile {
    /// Read a register by logical id; spill ids consult the spill manager.
    ///
    /// This is a boxed observer: a dirty typed slot is reconciled before
    /// the value is returned.
    pub fn get(&mut self, id: u32) -> Option<Value> {
        let slot = id as usize;
        if slot >= PRIMARY_REGISTERS {
            return self.spill.get(id);
        }

        if let Some(v) = self.typed.flush(slot) {
            self.primary[slot] = v;
        }
        Some(self.primary[slot])
    }

    /// Write a register by logical id, keeping the typed mirror coherent.
    pub fn set(&mut self, id: u32, value: Value) {
        let slot = id as usize;
        if slot >= PRIMARY_REGISTERS {
            self.spill.set(id, value);
            return;
        }

        self.primary[slot] = value;
        self.typed.sync_from_boxed(slot, value);
    }

    /// Branch-cache generation of a primary slot.
    pub fn generation(&self, id: u32) -> u32 {
        let slot = id as usize;
        if slot < PRIMARY_REGISTERS {
            self.typed.generation(slot)
        } else {
            0
        }
    }

    /// Clear the typed tag of a slot, bumping its generation.
    pub fn invalidate(&mut self, id: u32) {
        let slot = id as usize;
        if slot >= PRIMARY_REGISTERS {
            return;
        }
        if let Some(v) = self.typed.flush(slot) {
            self.primary[slot] = v;
        }
        self.typed.invalidate(slot);
    }

    /// Reconcile every dirty typed slot into its boxed register.
    ///
    /// Runs at safepoints; after it returns, the boxed window is
    /// authoritative everywhere and GC may scan it.
    pub fn reconcile_all(&mut self) {
        // Only the frame and temp banks ever defer writes.
        for slot in FRAME_REG_START..MODULE_REG_START {
            if let Some(v) = self.typed.flush(slot) {
                self.primary[slot] = v;
            }
        }
    }

    /// Returns `true` when a hot store to this slot must write through:
    /// cross-bank ids and slots captured by open upvalues.
    fn must_write_through(&self, slot: usize) -> bool {
        slot < FRAME_REG_START || slot >= MODULE_REG_START || self.captured[slot]
    }

    /// Flag a slot as captured by an open upvalue; stores write through
    /// until the capture is released.
    pub fn mark_captured(&mut self, id: u32) {
        let slot = id as usize;
        if slot < PRIMARY_REGISTERS {
            if let Some(v) = self.typed.flush(slot) {
                self.primary[slot] = v;
            }
            self.captured[slot] = true;
        }
    }

    /// Release the capture flag of a slot.
    pub fn clear_captured(&mut self, id: u32) {
        let slot = id as usize;
        if slot < PRIMARY_REGISTERS {
            self.captured[slot] = false;
        }
    }

    /// Direct read-only view of a primary slot without reconciliation;
    /// only tests peek past the accessor discipline.
    #[cfg(test)]
    pub(crate) fn boxed_unchecked(&self, slot: usize) -> Value {
        self.primary[slot]
    }

    /// The typed cache, for diagnostics and the JIT layout view.
    pub(crate) fn typed(&self) -> &TypedRegisters {
        &self.typed
    }

    pub(crate) fn typed_bank_pointers(&mut self) -> TypedBankPointers {
        self.typed.bank_pointers()
    }

    /// The spill manager.
    pub fn spill_manager(&self) -> &SpillManager {
        &self.spill
    }

    /// Mutable spill manager, for the spill transfer opcodes.
    pub(crate) fn spill_manager_mut(&mut self) -> &mut SpillManager {
        &mut self.spill
    }

    /// Move a primary register into spill storage.
    pub fn spill(&mut self, from: u32, spill_id: u32) -> Option<()> {
        let value = self.get(from)?;
        self.spill.spill(spill_id, value);
        Some(())
    }

    /// Move a spilled value back into a primary register.
    pub fn unspill(&mut self, spill_id: u32, into: u32) -> Option<()> {
        let value = self.spill.unspill(spill_id)?;
        self.set(into, value);
        Some(())
    }

    /// Returns `true` once the spill manager exceeds its soft capacity.
    pub fn needs_spilling(&self) -> bool {
        self.spill.needs_spilling()
    }

    /* typed fast paths */

    /// Typed read; adopts from the boxed register on a `None` tag, demotes
    /// the slot on a tag mismatch.
    pub fn try_read_i32(&mut self, id: u32) -> Option<i32> {
        let slot = id as usize;
        if slot >= PRIMARY_REGISTERS {
            return None;
        }
        match self.typed.tag(slot) {
            TypedTag::I32 => self.typed.read_i32(slot),
            TypedTag::None => match self.primary[slot] {
                Value::I32(v) => {
                    self.typed.write_i32(slot, v, false);
                    Some(v)
                }
                _ => None,
            },
            TypedTag::Heap => None,
            _ => {
                self.demote(slot);
                None
            }
        }
    }

    /// See [`RegisterFile::try_read_i32`].
    pub fn try_read_i64(&mut self, id: u32) -> Option<i64> {
        let slot = id as usize;
        if slot >= PRIMARY_REGISTERS {
            return None;
        }
        match self.typed.tag(slot) {
            TypedTag::I64 => self.typed.read_i64(slot),
            TypedTag::None => match self.primary[slot] {
                Value::I64(v) => {
                    self.typed.write_i64(slot, v, false);
                    Some(v)
                }
                _ => None,
            },
            TypedTag::Heap => None,
            _ => {
                self.demote(slot);
                None
            }
        }
    }

    /// See [`RegisterFile::try_read_i32`].
    pub fn try_read_u32(&mut self, id: u32) -> Option<u32> {
        let slot = id as usize;
        if slot >= PRIMARY_REGISTERS {
            return None;
        }
        match self.typed.tag(slot) {
            TypedTag::U32 => self.typed.read_u32(slot),
            TypedTag::None => match self.primary[slot] {
                Value::U32(v) => {
                    self.typed.write_u32(slot, v, false);
                    Some(v)
                }
                _ => None,
            },
            TypedTag::Heap => None,
            _ => {
                self.demote(slot);
                None
            }
        }
    }

    /// See [`RegisterFile::try_read_i32`].
    pub fn try_read_u64(&mut self, id: u32) -> Option<u64> {
        let slot = id as usize;
        if slot >= PRIMARY_REGISTERS {
            return None;
        }
        match self.typed.tag(slot) {
            TypedTag::U64 => self.typed.read_u64(slot),
            TypedTag::None => match self.primary[slot] {
                Value::U64(v) => {
                    self.typed.write_u64(slot, v, false);
                    Some(v)
                }
                _ => None,
            },
            TypedTag::Heap => None,
            _ => {
                self.demote(slot);
                None
            }
        }
    }

    /// See [`RegisterFile::try_read_i32`].
    pub fn try_read_f64(&mut self, id: u32) -> Option<f64> {
        let slot = id as usize;
        if slot >= PRIMARY_REGISTERS {
            return None;
        }
        match self.typed.tag(slot) {
            TypedTag::F64 => self.typed.read_f64(slot),
            TypedTag::None => match self.primary[slot] {
                Value::F64(v) => {
                    self.typed.write_f64(slot, v, false);
                    Some(v)
                }
                _ => None,
            },
            TypedTag::Heap => None,
            _ => {
                self.demote(slot);
                None
            }
        }
    }

    /// See [`RegisterFile::try_read_i32`].
    pub fn try_read_bool(&mut self, id: u32) -> Option<bool> {
        let slot = id as usize;
        if slot >= PRIMARY_REGISTERS {
            return None;
        }
        match self.typed.tag(slot) {
            TypedTag::Bool => self.typed.read_bool(slot),
            TypedTag::None => match self.primary[slot] {
                Value::Bool(v) => {
                    self.typed.write_bool(slot, v, false);
                    Some(v)
                }
                _ => None,
            },
            TypedTag::Heap => None,
            _ => {
                self.demote(slot);
                None
            }
        }
    }

    fn demote(&mut self, slot: usize) {
        if let Some(v) = self.typed.flush(slot) {
            self.primary[slot] = v;
        }
        self.typed.invalidate(slot);
    }

    /* typed stores */

    /// Write-through typed store.
    pub fn store_i32(&mut self, id: u32, v: i32) {
        let slot = id as usize;
        if slot >= PRIMARY_REGISTERS {
            self.spill.set(id, Value::I32(v));
            return;
        }
        self.typed.write_i32(slot, v, false);
        self.primary[slot] = Value::I32(v);
    }

    /// Hot-path typed store; defers the boxed write unless the slot is
    /// captured or cross-bank.
    pub fn store_i32_hot(&mut self, id: u32, v: i32) {
        let slot = id as usize;
        if slot >= PRIMARY_REGISTERS || self.must_write_through(slot) {
            self.store_i32(id, v);
            return;
        }
        self.typed.write_i32(slot, v, true);
    }

    /// Write-through typed store.
    pub fn store_i64(&mut self, id: u32, v: i64) {
        let slot = id as usize;
        if slot >= PRIMARY_REGISTERS {
            self.spill.set(id, Value::I64(v));
            return;
        }
        self.typed.write_i64(slot, v, false);
        self.primary[slot] = Value::I64(v);
    }

    /// Hot-path typed store.
    pub fn store_i64_hot(&mut self, id: u32, v: i64) {
        let slot = id as usize;
        if slot >= PRIMARY_REGISTERS || self.must_write_through(slot) {
            self.store_i64(id, v);
            return;
        }
        self.typed.write_i64(slot, v, true);
    }

    /// Write-through typed store.
    pub fn store_u32(&mut self, id: u32, v: u32) {
        let slot = id as usize;
        if slot >= PRIMARY_REGISTERS {
            self.spill.set(id, Value::U32(v));
            return;
        }
        self.typed.write_u32(slot, v, false);
        self.primary[slot] = Value::U32(v);
    }

    /// Hot-path typed store.
    pub fn store_u32_hot(&mut self, id: u32, v: u32) {
        let slot = id as usize;
        if slot >= PRIMARY_REGISTERS || self.must_write_through(slot) {
            self.store_u32(id, v);
            return;
        }
        self.typed.write_u32(slot, v, true);
    }

    /// Write-through typed store.
    pub fn store_u64(&mut self, id: u32, v: u64) {
        let slot = id as usize;
        if slot >= PRIMARY_REGISTERS {
            self.spill.set(id, Value::U64(v));
            return;
        }
        self.typed.write_u64(slot, v, false);
        self.primary[slot] = Value::U64(v);
    }

    /// Hot-path typed store.
    pub fn store_u64_hot(&mut self, id: u32, v: u64) {
        let slot = id as usize;
        if slot >= PRIMARY_REGISTERS || self.must_write_through(slot) {
            self.store_u64(id, v);
            return;
        }
        self.typed.write_u64(slot, v, true);
    }

    /// Write-through typed store.
    pub fn store_f64(&mut self, id: u32, v: f64) {
        let slot = id as usize;
        if slot >= PRIMARY_REGISTERS {
            self.spill.set(id, Value::F64(v));
            return;
        }
        self.typed.write_f64(slot, v, false);
        self.primary[slot] = Value::F64(v);
    }

    /// Hot-path typed store.
    pub fn store_f64_hot(&mut self, id: u32, v: f64) {
        let slot = id as usize;
        if slot >= PRIMARY_REGISTERS || self.must_write_through(slot) {
            self.store_f64(id, v);
            return;
        }
        self.typed.write_f64(slot, v, true);
    }

    /// Write-through typed store.
    pub fn store_bool(&mut self, id: u32, v: bool) {
        let slot = id as usize;
        if slot >= PRIMARY_REGISTERS {
            self.spill.set(id, Value::Bool(v));
            return;
        }
        self.typed.write_bool(slot, v, false);
        self.primary[slot] = Value::Bool(v);
    }

    /// Hot-path typed store.
    pub fn store_bool_hot(&mut self, id: u32, v: bool) {
        let slot = id as usize;
        if slot >= PRIMARY_REGISTERS || self.must_write_through(slot) {
            self.store_bool(id, v);
            return;
        }
        self.typed.write_bool(slot, v, true);
    }

    /* frames */

    /// Reserve the frame+temp window for a new activation.
    ///
    /// The parent's window is reconciled, saved into the frame and cleared;
    /// parameters land at [`FRAME_REG_START`] regardless of arity.
    #[allow(clippy::too_many_arguments)]
    pub fn allocate_frame(
        &mut self,
        return_chunk: Rc<Chunk<Value>>,
        return_ip: usize,
        result_reg: u16,
        callee: ObjHandle,
        function_id: u32,
        spilled_params: SmallVec<[(u32, Option<Value>); 4]>,
        max_depth: usize,
    ) -> Result<(), RuntimeError> {
        if self.frames.len() >= max_depth {
            return Err(RuntimeError::stack_overflow(max_depth));
        }

        self.reconcile_all();
        let saved: Box<[Value]> = self.primary[FRAME_REG_START..MODULE_REG_START].into();

        for slot in FRAME_REG_START..MODULE_REG_START {
            self.primary[slot] = Value::default();
            self.typed.invalidate(slot);
            self.captured[slot] = false;
        }

        self.frames.push(CallFrame {
            saved,
            return_chunk,
            return_ip,
            result_reg,
            callee,
            function_id,
            spilled_params,
        });

        Ok(())
    }

    /// Pop the current frame, restoring the parent's saved window.
    pub fn deallocate_frame(&mut self) -> Option<CallFrame> {
        let frame = self.frames.pop()?;

        self.reconcile_all();
        for (offset, value) in frame.saved.iter().enumerate() {
            let slot = FRAME_REG_START + offset;
            self.primary[slot] = *value;
            self.typed.sync_from_boxed(slot, *value);
            self.captured[slot] = false;
        }

        for &(id, displaced) in &frame.spilled_params {
            match displaced {
                Some(value) => self.spill.spill(id, value),
                None => {
                    self.spill.unspill(id);
                }
            }
        }

        Some(frame)
    }

    /// Copy the active module window out to a module's stash; the first
    /// half of a `SelectModule` switch.
    pub fn save_module_window(&mut self, stash: &mut [Value; MODULE_REGISTERS]) {
        for (i, slot) in (MODULE_REG_START..PRIMARY_REGISTERS).enumerate() {
            if let Some(v) = self.typed.flush(slot) {
                self.primary[slot] = v;
            }
            stash[i] = self.primary[slot];
        }
    }

    /// Load a module's stashed window into the top of the primary window;
    /// the second half of a `SelectModule` switch.
    pub fn load_module_window(&mut self, stash: &[Value; MODULE_REGISTERS]) {
        for (i, slot) in (MODULE_REG_START..PRIMARY_REGISTERS).enumerate() {
            self.primary[slot] = stash[i];
            self.typed.sync_from_boxed(slot, stash[i]);
        }
    }

    /// Mark a typed slot dirty after JIT-compiled code wrote its bank
    /// directly. The entry generation check guarantees the tag still
    /// matches what the native code wrote.
    pub(crate) fn mark_typed_dirty(&mut self, id: u32) {
        let slot = id as usize;
        if slot < PRIMARY_REGISTERS && !self.must_write_through(slot) {
            self.typed.set_dirty(slot);
        } else if slot < PRIMARY_REGISTERS {
            if let Some(v) = self.typed.unboxed(slot) {
                self.primary[slot] = v;
            }
        }
    }

    /// The active frame, if any.
    pub fn current_frame(&self) -> Option<&CallFrame> {
        self.frames.last()
    }

    /// Mutable access to the active frame; used by tail calls.
    pub(crate) fn current_frame_mut(&mut self) -> Option<&mut CallFrame> {
        self.frames.last_mut()
    }

    /// Active call depth.
    pub fn frame_depth(&self) -> usize {
        self.frames.len()
    }

    /// All live frames, bottom to top.
    pub fn frames(&self) -> &[CallFrame] {
        &self.frames
    }

    /// Collect every heap handle reachable from the register file.
    ///
    /// Must run after reconciliation: the boxed window is scanned as the
    /// authoritative view.
    pub fn roots(&self, out: &mut Vec<ObjHandle>) {
        out.extend(self.primary.iter().filter_map(Value::as_obj));

        for frame in &self.frames {
            out.push(frame.callee);
            out.extend(frame.saved.iter().filter_map(Value::as_obj));
            out.extend(frame.return_chunk.constants().iter().filter_map(Value::as_obj));
        }

        out.extend(self.spill.values().filter_map(Value::as_obj));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::ObjHandle;

    fn empty_chunk() -> Rc<Chunk<Value>> {
        Rc::new(Chunk::new())
    }

    #[test]
    fn typed_store_then_reconciled_read_is_bit_exact() {
        let mut regs = RegisterFile::default();

        regs.store_i32_hot(70, i32::MIN);
        assert_eq!(regs.get(70), Some(Value::I32(i32::MIN)));

        regs.store_f64_hot(71, f64::from_bits(0x7ff0_0000_0000_0001));
        let got = regs.get(71).and_then(|v| v.as_f64()).unwrap();
        assert_eq!(got.to_bits(), 0x7ff0_0000_0000_0001);
    }

    #[test]
    fn mismatched_typed_read_demotes_and_bumps_generation() {
        let mut regs = RegisterFile::default();
        regs.store_i32(80, 1);
        let gen = regs.generation(80);

        assert_eq!(regs.try_read_i64(80), None);
        assert_ne!(regs.generation(80), gen);
        // Boxed value survives the demotion.
        assert_eq!(regs.get(80), Some(Value::I32(1)));
    }

    #[test]
    fn hot_store_to_global_writes_through() {
        let mut regs = RegisterFile::default();
        regs.store_i32_hot(3, 9);
        assert!(!regs.typed().is_dirty(3));
        assert_eq!(regs.boxed_unchecked(3), Value::I32(9));
    }

    #[test]
    fn hot_store_to_captured_slot_writes_through() {
        let mut regs = RegisterFile::default();
        regs.mark_captured(70);
        regs.store_i32_hot(70, 5);
        assert!(!regs.typed().is_dirty(70));

        regs.clear_captured(70);
        regs.store_i32_hot(70, 6);
        assert!(regs.typed().is_dirty(70));
    }

    #[test]
    fn spill_ids_round_trip_through_the_manager() {
        let mut regs = RegisterFile::default();
        regs.set(300, Value::U64(u64::MAX));
        assert_eq!(regs.get(300), Some(Value::U64(u64::MAX)));

        regs.set(10, Value::I32(3));
        regs.spill(10, 400).unwrap();
        regs.unspill(400, 11).unwrap();
        assert_eq!(regs.get(11), Some(Value::I32(3)));
        assert!(regs.spill_manager().is_empty() || regs.spill_manager().len() == 1);
    }

    #[test]
    fn frame_allocation_saves_and_restores_the_window() {
        let mut regs = RegisterFile::default();
        regs.store_i32(64, 11);
        regs.store_i32_hot(65, 22); // left dirty on purpose
        regs.set(0, Value::I32(33)); // global, untouched by frames

        regs.allocate_frame(
            empty_chunk(),
            7,
            66,
            ObjHandle(0),
            0,
            SmallVec::new(),
            VM_MAX_CALL_DEPTH,
        )
        .unwrap();

        // Callee sees a cleared window but the same globals.
        assert_eq!(regs.get(64), Some(Value::default()));
        assert_eq!(regs.get(0), Some(Value::I32(33)));

        regs.store_i32(64, 99);
        let frame = regs.deallocate_frame().unwrap();
        assert_eq!(frame.return_ip, 7);

        assert_eq!(regs.get(64), Some(Value::I32(11)));
        assert_eq!(regs.get(65), Some(Value::I32(22)));
    }

    #[test]
    fn frame_depth_limit_raises_recursion() {
        let mut regs = RegisterFile::default();
        for _ in 0..3 {
            regs.allocate_frame(empty_chunk(), 0, 0, ObjHandle(0), 0, SmallVec::new(), 3)
                .unwrap();
        }
        let err = regs
            .allocate_frame(empty_chunk(), 0, 0, ObjHandle(0), 0, SmallVec::new(), 3)
            .unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::Recursion);
    }

    #[test]
    fn roots_cover_window_frames_and_spills() {
        let mut regs = RegisterFile::default();
        regs.set(1, Value::Obj(ObjHandle(10)));
        regs.set(65, Value::Obj(ObjHandle(11)));
        regs.allocate_frame(
            empty_chunk(),
            0,
            0,
            ObjHandle(12),
            0,
            SmallVec::new(),
            VM_MAX_CALL_DEPTH,
        )
        .unwrap();
        regs.set(400, Value::Obj(ObjHandle(13)));

        let mut roots = Vec::new();
        regs.roots(&mut roots);

        for expected in [10, 11, 12, 13] {
            assert!(
                roots.contains(&ObjHandle(expected)),
                "missing root obj#{expected} in {roots:?}"
            );
        }
    }
}

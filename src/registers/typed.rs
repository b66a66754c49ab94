//! Typed register cache
//!
//! A parallel, unboxed mirror of the primary register window for primitive
//! numerics and booleans. The cache API never exposes a dirty typed view:
//! observers go through [`super::RegisterFile`], which reconciles first.

use crate::consts::PRIMARY_REGISTERS;
use crate::value::{Value, ValueKind};

/// Per-slot tag of the typed cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TypedTag {
    /// Boxed register is authoritative; no typed view.
    #[default]
    None,
    /// Slot holds an unboxed `i32`.
    I32,
    /// Slot holds an unboxed `i64`.
    I64,
    /// Slot holds an unboxed `u32`.
    U32,
    /// Slot holds an unboxed `u64`.
    U64,
    /// Slot holds an unboxed `f64`.
    F64,
    /// Slot holds an unboxed `bool`.
    Bool,
    /// Boxed register holds a heap handle; boxed view is authoritative.
    Heap,
}

impl TypedTag {
    /// The tag mirroring a boxed value kind.
    pub const fn from_kind(kind: ValueKind) -> Self {
        match kind {
            ValueKind::I32 => Self::I32,
            ValueKind::I64 => Self::I64,
            ValueKind::U32 => Self::U32,
            ValueKind::U64 => Self::U64,
            ValueKind::F64 => Self::F64,
            ValueKind::Bool => Self::Bool,
            ValueKind::Heap => Self::Heap,
        }
    }
}

/// Unboxed mirror of the primary register window.
///
/// Invariants, per slot:
/// - `tag = None | Heap`: the boxed register is authoritative.
/// - `tag = T, dirty = false`: boxed and typed views agree.
/// - `tag = T, dirty = true`: the typed view is authoritative and the
///   boxed register is stale until [`TypedRegisters::flush`] runs.
pub struct TypedRegisters {
    i32s: Box<[i32; PRIMARY_REGISTERS]>,
    i64s: Box<[i64; PRIMARY_REGISTERS]>,
    u32s: Box<[u32; PRIMARY_REGISTERS]>,
    u64s: Box<[u64; PRIMARY_REGISTERS]>,
    f64s: Box<[f64; PRIMARY_REGISTERS]>,
    bools: Box<[bool; PRIMARY_REGISTERS]>,
    tags: Box<[TypedTag; PRIMARY_REGISTERS]>,
    dirty: Box<[bool; PRIMARY_REGISTERS]>,
    generations: Box<[u32; PRIMARY_REGISTERS]>,
}

impl Default for TypedRegisters {
    fn default() -> Self {
        Self {
            i32s: Box::new([0; PRIMARY_REGISTERS]),
            i64s: Box::new([0; PRIMARY_REGISTERS]),
            u32s: Box::new([0; PRIMARY_REGISTERS]),
            u64s: Box::new([0; PRIMARY_REGISTERS]),
            f64s: Box::new([0.0; PRIMARY_REGISTERS]),
            bools: Box::new([false; PRIMARY_REGISTERS]),
            tags: Box::new([TypedTag::None; PRIMARY_REGISTERS]),
            dirty: Box::new([false; PRIMARY_REGISTERS]),
            generations: Box::new([0; PRIMARY_REGISTERS]),
        }
    }
}

impl core::fmt::Debug for TypedRegisters {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let live = self
            .tags
            .iter()
            .filter(|t| !matches!(t, TypedTag::None))
            .count();
        write!(f, "TypedRegisters(live={live})")
    }
}

impl TypedRegisters {
    /// Current tag of a slot.
    pub fn tag(&self, slot: usize) -> TypedTag {
        self.tags[slot]
    }

    /// Whether the typed view of a slot is ahead of the boxed one.
    pub fn is_dirty(&self, slot: usize) -> bool {
        self.dirty[slot]
    }

    /// Branch-cache generation of a slot; bumped on every tag change.
    pub fn generation(&self, slot: usize) -> u32 {
        self.generations[slot]
    }

    fn retag(&mut self, slot: usize, tag: TypedTag) {
        if self.tags[slot] != tag {
            self.tags[slot] = tag;
            self.generations[slot] = self.generations[slot].wrapping_add(1);
        }
    }

    /// Read the typed view of a slot, regardless of the dirty bit.
    ///
    /// Returns `None` unless the tag names a primitive.
    pub fn unboxed(&self, slot: usize) -> Option<Value> {
        Some(match self.tags[slot] {
            TypedTag::I32 => Value::I32(self.i32s[slot]),
            TypedTag::I64 => Value::I64(self.i64s[slot]),
            TypedTag::U32 => Value::U32(self.u32s[slot]),
            TypedTag::U64 => Value::U64(self.u64s[slot]),
            TypedTag::F64 => Value::F64(self.f64s[slot]),
            TypedTag::Bool => Value::Bool(self.bools[slot]),
            TypedTag::None | TypedTag::Heap => return None,
        })
    }

    /// Flush a dirty slot into the boxed register it mirrors.
    ///
    /// Returns the authoritative boxed value when a write-back happened.
    pub fn flush(&mut self, slot: usize) -> Option<Value> {
        if !self.dirty[slot] {
            return None;
        }
        self.dirty[slot] = false;
        self.unboxed(slot)
    }

    /// Rewrite the cache for a slot from its boxed value.
    ///
    /// Called when the boxed register was stored directly, and when a typed
    /// miss adopts the boxed value.
    pub fn sync_from_boxed(&mut self, slot: usize, value: Value) {
        self.dirty[slot] = false;
        let tag = TypedTag::from_kind(value.kind());
        self.retag(slot, tag);

        match value {
            Value::I32(v) => self.i32s[slot] = v,
            Value::I64(v) => self.i64s[slot] = v,
            Value::U32(v) => self.u32s[slot] = v,
            Value::U64(v) => self.u64s[slot] = v,
            Value::F64(v) => self.f64s[slot] = v,
            Value::Bool(v) => self.bools[slot] = v,
            Value::Obj(_) => {}
        }
    }

    /// Mark a slot dirty without touching its payload; the typed view
    /// becomes authoritative. Only meaningful for primitive tags.
    pub(crate) fn set_dirty(&mut self, slot: usize) {
        if !matches!(self.tags[slot], TypedTag::None | TypedTag::Heap) {
            self.dirty[slot] = true;
        }
    }

    /// Clear a slot to tag `None`, bumping the generation.
    ///
    /// The caller must have flushed the slot first; demoting a dirty slot
    /// would lose the authoritative value.
    pub fn invalidate(&mut self, slot: usize) {
        debug_assert!(!self.dirty[slot], "invalidating a dirty typed slot");
        self.dirty[slot] = false;
        self.retag(slot, TypedTag::None);
    }

    pub(crate) fn read_i32(&self, slot: usize) -> Option<i32> {
        matches!(self.tags[slot], TypedTag::I32).then(|| self.i32s[slot])
    }

    pub(crate) fn read_i64(&self, slot: usize) -> Option<i64> {
        matches!(self.tags[slot], TypedTag::I64).then(|| self.i64s[slot])
    }

    pub(crate) fn read_u32(&self, slot: usize) -> Option<u32> {
        matches!(self.tags[slot], TypedTag::U32).then(|| self.u32s[slot])
    }

    pub(crate) fn read_u64(&self, slot: usize) -> Option<u64> {
        matches!(self.tags[slot], TypedTag::U64).then(|| self.u64s[slot])
    }

    pub(crate) fn read_f64(&self, slot: usize) -> Option<f64> {
        matches!(self.tags[slot], TypedTag::F64).then(|| self.f64s[slot])
    }

    pub(crate) fn read_bool(&self, slot: usize) -> Option<bool> {
        matches!(self.tags[slot], TypedTag::Bool).then(|| self.bools[slot])
    }

    pub(crate) fn write_i32(&mut self, slot: usize, v: i32, dirty: bool) {
        self.retag(slot, TypedTag::I32);
        self.i32s[slot] = v;
        self.dirty[slot] = dirty;
    }

    pub(crate) fn write_i64(&mut self, slot: usize, v: i64, dirty: bool) {
        self.retag(slot, TypedTag::I64);
        self.i64s[slot] = v;
        self.dirty[slot] = dirty;
    }

    pub(crate) fn write_u32(&mut self, slot: usize, v: u32, dirty: bool) {
        self.retag(slot, TypedTag::U32);
        self.u32s[slot] = v;
        self.dirty[slot] = dirty;
    }

    pub(crate) fn write_u64(&mut self, slot: usize, v: u64, dirty: bool) {
        self.retag(slot, TypedTag::U64);
        self.u64s[slot] = v;
        self.dirty[slot] = dirty;
    }

    pub(crate) fn write_f64(&mut self, slot: usize, v: f64, dirty: bool) {
        self.retag(slot, TypedTag::F64);
        self.f64s[slot] = v;
        self.dirty[slot] = dirty;
    }

    pub(crate) fn write_bool(&mut self, slot: usize, v: bool, dirty: bool) {
        self.retag(slot, TypedTag::Bool);
        self.bools[slot] = v;
        self.dirty[slot] = dirty;
    }

    /// Base pointers of the typed banks, handed to JIT-compiled code.
    pub(crate) fn bank_pointers(&mut self) -> TypedBankPointers {
        TypedBankPointers {
            i32s: self.i32s.as_mut_ptr(),
            i64s: self.i64s.as_mut_ptr(),
            u32s: self.u32s.as_mut_ptr(),
            u64s: self.u64s.as_mut_ptr(),
            f64s: self.f64s.as_mut_ptr(),
            bools: self.bools.as_mut_ptr() as *mut u8,
        }
    }
}

/// Raw typed-bank pointers for the JIT state view.
#[derive(Debug, Clone, Copy)]
pub(crate) struct TypedBankPointers {
    pub i32s: *mut i32,
    pub i64s: *mut i64,
    pub u32s: *mut u32,
    pub u64s: *mut u64,
    pub f64s: *mut f64,
    pub bools: *mut u8,
}

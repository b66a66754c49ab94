//! Spill manager
//!
//! Backing store for register ids past the primary window. Entries are
//! stamped on every access; eviction candidates surface in true LRU order
//! by last access.

use std::collections::HashMap;

use crate::consts::SPILL_SOFT_CAPACITY;
use crate::value::Value;

#[derive(Debug, Clone, Copy)]
struct SpillSlot {
    value: Value,
    last_access: u64,
}

/// Mapping from spill id to boxed value.
#[derive(Debug, Default)]
pub struct SpillManager {
    slots: HashMap<u32, SpillSlot>,
    clock: u64,
}

impl SpillManager {
    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    /// Store a value under a spill id.
    pub fn spill(&mut self, id: u32, value: Value) {
        let stamp = self.tick();
        self.slots.insert(
            id,
            SpillSlot {
                value,
                last_access: stamp,
            },
        );
    }

    /// Remove and return the value under a spill id.
    ///
    /// A spilled value never coexists with a register slot; unspilling is
    /// the only way to move it back.
    pub fn unspill(&mut self, id: u32) -> Option<Value> {
        self.slots.remove(&id).map(|slot| slot.value)
    }

    /// Read a spilled value, stamping its access time.
    pub fn get(&mut self, id: u32) -> Option<Value> {
        let stamp = self.tick();
        self.slots.get_mut(&id).map(|slot| {
            slot.last_access = stamp;
            slot.value
        })
    }

    /// Overwrite a spilled value, stamping its access time.
    pub fn set(&mut self, id: u32, value: Value) {
        self.spill(id, value);
    }

    /// Returns `true` once the soft capacity is exceeded.
    pub fn needs_spilling(&self) -> bool {
        self.slots.len() > SPILL_SOFT_CAPACITY
    }

    /// The least-recently-accessed spill id, if any.
    pub fn lru_candidate(&self) -> Option<u32> {
        self.slots
            .iter()
            .min_by_key(|(_, slot)| slot.last_access)
            .map(|(&id, _)| id)
    }

    /// Number of live spill entries.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Returns `true` with no live entries.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Iterate stored values without stamping accesses; used by GC root
    /// scanning.
    pub fn values(&self) -> impl Iterator<Item = &Value> {
        self.slots.values().map(|slot| &slot.value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spill_unspill_round_trip() {
        let mut spill = SpillManager::default();
        spill.spill(300, Value::I64(i64::MIN));
        spill.spill(301, Value::F64(f64::MIN_POSITIVE));

        assert_eq!(spill.unspill(300), Some(Value::I64(i64::MIN)));
        assert_eq!(spill.unspill(300), None);
        assert_eq!(spill.len(), 1);
    }

    #[test]
    fn lru_follows_last_access() {
        let mut spill = SpillManager::default();
        spill.spill(256, Value::I32(1));
        spill.spill(257, Value::I32(2));
        spill.spill(258, Value::I32(3));

        assert_eq!(spill.lru_candidate(), Some(256));

        spill.get(256);
        assert_eq!(spill.lru_candidate(), Some(257));

        spill.set(257, Value::I32(20));
        assert_eq!(spill.lru_candidate(), Some(258));
    }

    #[test]
    fn value_iteration_does_not_stamp() {
        let mut spill = SpillManager::default();
        spill.spill(256, Value::I32(1));
        spill.spill(257, Value::I32(2));

        let before = spill.lru_candidate();
        let count = spill.values().count();
        assert_eq!(count, 2);
        assert_eq!(spill.lru_candidate(), before);
    }
}

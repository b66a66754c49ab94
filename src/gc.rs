//! Mark-sweep garbage collection
//!
//! A non-moving collector over the slab heap. Collection runs only at
//! safepoints, after the typed register cache has been reconciled, so the
//! boxed register window is the authoritative root set.

use crate::interpreter::Interpreter;
use crate::value::{ObjHandle, Value};

impl Interpreter {
    /// Run one full mark-sweep collection.
    ///
    /// Roots: the register file (active window, saved frame windows,
    /// spills, frame callees), module windows and chunk constant pools,
    /// the open-upvalue list, the function table, the error being unwound
    /// and the current chunk's constants.
    pub fn collect_garbage(&mut self) {
        let bytes_before = self.heap.bytes_allocated();

        // Safepoint contract: no dirty typed slot may be visible to the
        // collector.
        self.registers.reconcile_all();

        let mut worklist: Vec<ObjHandle> = Vec::with_capacity(64);
        self.registers.roots(&mut worklist);
        self.modules.roots(&mut worklist);
        worklist.extend(self.open_upvalues.iter().copied());
        worklist.extend(self.functions.iter().copied());
        worklist.extend(self.last_error);
        worklist.extend(self.chunk.constants().iter().filter_map(Value::as_obj));
        worklist.extend(self.script_window.iter().filter_map(Value::as_obj));

        // Mark phase.
        let mut children = Vec::new();
        while let Some(handle) = worklist.pop() {
            let Some(header) = self.heap.header_mut(handle) else {
                continue;
            };
            if header.marked {
                continue;
            }
            header.marked = true;

            if let Some(data) = self.heap.get(handle) {
                children.clear();
                data.children(&mut children);
                worklist.extend(children.iter().copied());
            }
        }

        // Sweep phase.
        let (freed_objects, freed_bytes) = self.heap.sweep();

        tracing::debug!(
            bytes_before,
            bytes_after = self.heap.bytes_allocated(),
            freed_objects,
            freed_bytes,
            next_threshold = self.heap.threshold(),
            "gc cycle"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::{ObjArray, ObjData};

    #[test]
    fn unreachable_objects_are_swept() {
        let mut vm = Interpreter::new();
        let live = vm.heap.alloc(ObjData::Array(ObjArray::default()));
        vm.registers.set(0, Value::Obj(live));

        for _ in 0..16 {
            vm.heap.alloc(ObjData::Array(ObjArray::default()));
        }
        let before = vm.heap.live_count();

        vm.collect_garbage();

        assert!(vm.heap.live_count() < before);
        assert!(vm.heap.get(live).is_some(), "rooted object survives");
        vm.heap.assert_no_marks();
    }

    #[test]
    fn chains_of_children_survive_through_a_root() {
        let mut vm = Interpreter::new();
        let inner = vm.heap.alloc(ObjData::Array(ObjArray {
            items: vec![Value::I32(1)],
        }));
        let outer = vm.heap.alloc(ObjData::Array(ObjArray {
            items: vec![Value::Obj(inner)],
        }));
        vm.registers.set(70, Value::Obj(outer));

        vm.collect_garbage();

        assert!(vm.heap.get(outer).is_some());
        assert!(vm.heap.get(inner).is_some(), "reachable child survives");
    }

    #[test]
    fn dirty_typed_registers_are_reconciled_before_marking() {
        let mut vm = Interpreter::new();
        let obj = vm.heap.alloc(ObjData::Array(ObjArray::default()));
        vm.registers.set(80, Value::Obj(obj));

        // A hot store elsewhere leaves a dirty slot; collection must not
        // observe it.
        vm.registers.store_i32_hot(81, 7);
        vm.collect_garbage();

        assert!(!vm.registers.typed().is_dirty(81));
        assert_eq!(vm.registers.get(81), Some(Value::I32(7)));
        assert!(vm.heap.get(obj).is_some());
    }

    #[test]
    fn paused_gc_defers_collection() {
        let mut vm = Interpreter::new();
        vm.heap.pause();
        for _ in 0..8 {
            vm.heap.alloc(ObjData::Array(ObjArray::default()));
        }
        let count = vm.heap.live_count();

        // The safepoint consults the pause counter.
        vm.safepoint();
        assert_eq!(vm.heap.live_count(), count);

        vm.heap.resume();
    }
}

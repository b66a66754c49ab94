//! Module records and the bounded module manager
//!
//! The core consumes already-resolved module records: name, compiled chunk
//! and export table. Each module owns a 16-slot register window; the active
//! window is swapped into the top of the primary register file by
//! `SelectModule`.

use orus_asm::{Chunk, UINT8_COUNT};

use std::collections::HashMap;
use std::path::PathBuf;
use std::rc::Rc;
use std::time::SystemTime;

use crate::consts::MODULE_REGISTERS;
use crate::error::VmError;
use crate::value::{ObjHandle, Value};

/// An already-resolved module.
#[derive(Debug, Clone)]
pub struct ModuleRecord {
    /// Module name, as imports refer to it.
    pub name: String,
    /// Compiled module body.
    pub chunk: Rc<Chunk<Value>>,
    /// Export name to module-window slot index.
    pub exports: HashMap<String, u8>,
    /// Names of modules this one imports.
    pub imports: Vec<String>,
    /// Whether the module body already ran.
    pub executed: bool,
    /// On-disk path, when the module came from a file.
    pub path: Option<PathBuf>,
    /// Modification time captured at load.
    pub mtime: Option<SystemTime>,
}

impl ModuleRecord {
    /// A record with just a name and chunk; exports and provenance can be
    /// filled in by the loader collaborator.
    pub fn new(name: impl Into<String>, chunk: Chunk<Value>) -> Self {
        Self {
            name: name.into(),
            chunk: Rc::new(chunk),
            exports: HashMap::new(),
            imports: Vec::new(),
            executed: false,
            path: None,
            mtime: None,
        }
    }
}

/// Bounded registry of loaded modules and their register windows.
#[derive(Debug, Default)]
pub struct ModuleManager {
    records: Vec<ModuleRecord>,
    by_name: HashMap<String, u8>,
    windows: Vec<[Value; MODULE_REGISTERS]>,
}

impl ModuleManager {
    /// Register a module, assigning it the next id.
    pub fn register(&mut self, record: ModuleRecord) -> Result<u8, VmError> {
        if self.records.len() >= UINT8_COUNT {
            return Err(VmError::ModuleLimit {
                name: record.name,
                limit: UINT8_COUNT,
            });
        }

        let id = self.records.len() as u8;
        self.by_name.insert(record.name.clone(), id);
        self.records.push(record);
        self.windows.push([Value::default(); MODULE_REGISTERS]);
        Ok(id)
    }

    /// Resolve a module name to its id.
    pub fn resolve(&self, name: &str) -> Option<u8> {
        self.by_name.get(name).copied()
    }

    /// Module record by id.
    pub fn get(&self, id: u8) -> Option<&ModuleRecord> {
        self.records.get(id as usize)
    }

    /// Mutable module record by id.
    pub fn get_mut(&mut self, id: u8) -> Option<&mut ModuleRecord> {
        self.records.get_mut(id as usize)
    }

    /// The stashed register window of a module.
    pub fn window_mut(&mut self, id: u8) -> Option<&mut [Value; MODULE_REGISTERS]> {
        self.windows.get_mut(id as usize)
    }

    /// Value exported by a module under `name`.
    ///
    /// Reads the module's stashed window; the caller swaps the active
    /// window out before resolving cross-module reads.
    pub fn export_value(&self, id: u8, name: &str) -> Option<Value> {
        let record = self.get(id)?;
        let slot = *record.exports.get(name)? as usize;
        self.windows.get(id as usize)?.get(slot).copied()
    }

    /// Number of registered modules.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Returns `true` with no modules registered.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Collect heap handles reachable from module windows and chunk
    /// constant pools.
    pub fn roots(&self, out: &mut Vec<ObjHandle>) {
        for window in &self.windows {
            out.extend(window.iter().filter_map(Value::as_obj));
        }
        for record in &self.records {
            out.extend(record.chunk.constants().iter().filter_map(Value::as_obj));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registration_assigns_sequential_ids() {
        let mut manager = ModuleManager::default();
        let a = manager.register(ModuleRecord::new("a", Chunk::new())).unwrap();
        let b = manager.register(ModuleRecord::new("b", Chunk::new())).unwrap();

        assert_eq!((a, b), (0, 1));
        assert_eq!(manager.resolve("b"), Some(1));
        assert_eq!(manager.resolve("c"), None);
    }

    #[test]
    fn capacity_is_bounded() {
        let mut manager = ModuleManager::default();
        for i in 0..UINT8_COUNT {
            manager
                .register(ModuleRecord::new(format!("m{i}"), Chunk::new()))
                .unwrap();
        }

        let err = manager
            .register(ModuleRecord::new("overflow", Chunk::new()))
            .unwrap_err();
        assert!(matches!(err, VmError::ModuleLimit { limit, .. } if limit == UINT8_COUNT));
    }

    #[test]
    fn exports_resolve_through_the_window() {
        let mut manager = ModuleManager::default();
        let mut record = ModuleRecord::new("math", Chunk::new());
        record.exports.insert("pi".into(), 2);
        let id = manager.register(record).unwrap();

        manager.window_mut(id).unwrap()[2] = Value::F64(3.14);
        assert_eq!(manager.export_value(id, "pi"), Some(Value::F64(3.14)));
        assert_eq!(manager.export_value(id, "tau"), None);
    }
}

//! VM runtime context definitions

/// Runtime context description.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Context {
    /// Executing a top-level script chunk.
    Script,
    /// Executing a module body.
    Module {
        /// Id of the module being executed.
        id: u8,
    },
    /// Executing under a `Call` frame.
    Call,
    /// Nothing initialized yet.
    NotInitialized,
}

impl Default for Context {
    fn default() -> Self {
        Self::NotInitialized
    }
}

impl Context {
    /// Return `true` while top-level code runs, outside any call frame.
    pub const fn is_top_level(&self) -> bool {
        matches!(self, Self::Script | Self::Module { .. })
    }
}

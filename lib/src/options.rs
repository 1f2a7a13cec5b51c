//! Shared option types that replace boolean flag parameters in the Rust API.

/// Whether reads include inferred statements or only explicit ones.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Default)]
pub enum Inferred {
    /// Return explicit and inferred statements.
    #[default]
    Include,
    /// Return explicit statements only.
    Exclude,
}

impl Inferred {
    pub fn includes_inferred(self) -> bool {
        matches!(self, Inferred::Include)
    }
}

impl From<bool> for Inferred {
    fn from(value: bool) -> Self {
        if value {
            Inferred::Include
        } else {
            Inferred::Exclude
        }
    }
}

impl From<Inferred> for bool {
    fn from(value: Inferred) -> Self {
        value.includes_inferred()
    }
}

/// Durability of writes to the data files.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Default)]
pub enum SyncMode {
    /// fsync data files whenever a commit is made durable.
    Force,
    /// Flush buffers to the OS and leave syncing to it.
    #[default]
    Flush,
}

impl SyncMode {
    pub fn is_force(self) -> bool {
        matches!(self, SyncMode::Force)
    }
}

impl From<bool> for SyncMode {
    fn from(value: bool) -> Self {
        if value {
            SyncMode::Force
        } else {
            SyncMode::Flush
        }
    }
}

impl From<SyncMode> for bool {
    fn from(value: SyncMode) -> Self {
        value.is_force()
    }
}

/// Whether a statement was asserted by a client or derived by inference.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Provenance {
    Explicit,
    Inferred,
}

impl Provenance {
    pub fn is_explicit(self) -> bool {
        matches!(self, Provenance::Explicit)
    }
}

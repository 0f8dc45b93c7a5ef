//! Collection and index creation options.
//!
//! These are passed through to the engine untouched; the engine decides
//! which combinations it accepts.

use serde::{Deserialize, Serialize};

use crate::key::KeyPath;

/// Options for creating a collection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectionOptions {
    /// In-line key location. `None` means keys are supplied out-of-line.
    pub key_path: Option<KeyPath>,
    /// Whether the collection generates integer keys when none is given.
    pub auto_increment: bool,
}

impl CollectionOptions {
    /// Options with out-of-line keys and no key generator.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Store keys in-line at `key_path`.
    #[must_use]
    pub fn with_key_path(mut self, key_path: impl Into<KeyPath>) -> Self {
        self.key_path = Some(key_path.into());
        self
    }

    /// Generate integer keys (starting at 1) for records stored without one.
    #[must_use]
    pub fn with_auto_increment(mut self) -> Self {
        self.auto_increment = true;
        self
    }
}

/// Definition of a secondary index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexSpec {
    /// Index name, unique within its collection.
    pub name: String,
    /// Projection of each record that the index orders by.
    pub key_path: KeyPath,
    /// Reject records whose index key is already taken.
    #[serde(default)]
    pub unique: bool,
    /// Index each element of an array key separately.
    #[serde(default)]
    pub multi_entry: bool,
}

impl IndexSpec {
    /// A non-unique, single-entry index.
    #[must_use]
    pub fn new(name: impl Into<String>, key_path: impl Into<KeyPath>) -> Self {
        Self {
            name: name.into(),
            key_path: key_path.into(),
            unique: false,
            multi_entry: false,
        }
    }

    /// Make the index unique.
    #[must_use]
    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    /// Make the index multi-entry.
    #[must_use]
    pub fn multi_entry(mut self) -> Self {
        self.multi_entry = true;
        self
    }
}

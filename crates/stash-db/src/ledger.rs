//! Schema change ledger.
//!
//! Declaring a collection or index records an intent here instead of
//! touching the engine. The commit pass compares the pending intents with
//! the live schema and only bumps the database version when at least one
//! of them would actually change something.

use std::collections::{BTreeMap, BTreeSet};

use crate::engine::SchemaContext;
use crate::error::EngineResult;
use crate::options::{CollectionOptions, IndexSpec};

/// Applies one change inside a version upgrade.
pub(crate) type SchemaApply =
    Box<dyn FnOnce(&mut dyn SchemaContext) -> EngineResult<()> + Send + Sync>;

/// Whether a change adds or removes its target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ChangeKind {
    Create,
    Delete,
}

/// What a change targets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ChangeScope {
    Collection,
    Index { collection: String },
}

/// One pending schema change.
///
/// The apply function re-checks the live schema before acting, so running
/// a change whose target already converged is harmless.
pub(crate) struct SchemaChange {
    target: String,
    kind: ChangeKind,
    scope: ChangeScope,
    apply: SchemaApply,
}

impl SchemaChange {
    pub(crate) fn new(
        target: impl Into<String>,
        kind: ChangeKind,
        scope: ChangeScope,
        apply: SchemaApply,
    ) -> Self {
        Self {
            target: target.into(),
            kind,
            scope,
            apply,
        }
    }

    pub(crate) fn create_collection(name: &str, options: CollectionOptions) -> Self {
        let target = name.to_owned();
        Self::new(
            name,
            ChangeKind::Create,
            ChangeScope::Collection,
            Box::new(move |schema| {
                if schema.collection_names().contains(&target) {
                    return Ok(());
                }
                schema.create_collection(&target, &options)
            }),
        )
    }

    pub(crate) fn delete_collection(name: &str) -> Self {
        let target = name.to_owned();
        Self::new(
            name,
            ChangeKind::Delete,
            ChangeScope::Collection,
            Box::new(move |schema| {
                if !schema.collection_names().contains(&target) {
                    return Ok(());
                }
                schema.delete_collection(&target)
            }),
        )
    }

    pub(crate) fn create_index(collection: &str, spec: IndexSpec) -> Self {
        let owner = collection.to_owned();
        Self::new(
            spec.name.clone(),
            ChangeKind::Create,
            ChangeScope::Index {
                collection: collection.to_owned(),
            },
            Box::new(move |schema| {
                if schema.index_names(&owner)?.contains(&spec.name) {
                    return Ok(());
                }
                schema.create_index(&owner, &spec)
            }),
        )
    }

    pub(crate) fn delete_index(collection: &str, name: &str) -> Self {
        let owner = collection.to_owned();
        let target = name.to_owned();
        Self::new(
            name,
            ChangeKind::Delete,
            ChangeScope::Index {
                collection: collection.to_owned(),
            },
            Box::new(move |schema| {
                if !schema.collection_names().contains(&owner)
                    || !schema.index_names(&owner)?.contains(&target)
                {
                    return Ok(());
                }
                schema.delete_index(&owner, &target)
            }),
        )
    }

    pub(crate) fn target(&self) -> &str {
        &self.target
    }

    pub(crate) fn kind(&self) -> ChangeKind {
        self.kind
    }

    /// Owning collection of an index change.
    pub(crate) fn owner(&self) -> Option<&str> {
        match &self.scope {
            ChangeScope::Collection => None,
            ChangeScope::Index { collection } => Some(collection),
        }
    }

    /// Whether applying the change against `live` would alter anything.
    pub(crate) fn is_necessary(&self, live: &LiveSchema) -> bool {
        let present = match self.owner() {
            None => live.has_collection(&self.target),
            Some(collection) => live.has_index(collection, &self.target),
        };
        match self.kind {
            ChangeKind::Create => !present,
            ChangeKind::Delete => present,
        }
    }

    pub(crate) fn apply(self, schema: &mut dyn SchemaContext) -> EngineResult<()> {
        (self.apply)(schema)
    }
}

impl std::fmt::Debug for SchemaChange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchemaChange")
            .field("target", &self.target)
            .field("kind", &self.kind)
            .field("scope", &self.scope)
            .finish_non_exhaustive()
    }
}

/// Schema as seen by an open session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct LiveSchema {
    collections: BTreeSet<String>,
    /// Index names per inspected collection.
    indexes: BTreeMap<String, BTreeSet<String>>,
}

impl LiveSchema {
    pub(crate) fn new(collections: impl IntoIterator<Item = String>) -> Self {
        Self {
            collections: collections.into_iter().collect(),
            indexes: BTreeMap::new(),
        }
    }

    pub(crate) fn add_indexes(&mut self, collection: &str, names: impl IntoIterator<Item = String>) {
        self.indexes
            .entry(collection.to_owned())
            .or_default()
            .extend(names);
    }

    pub(crate) fn has_collection(&self, name: &str) -> bool {
        self.collections.contains(name)
    }

    pub(crate) fn has_index(&self, collection: &str, name: &str) -> bool {
        self.indexes
            .get(collection)
            .is_some_and(|names| names.contains(name))
    }

    /// Whether any of `changes` is necessary.
    pub(crate) fn requires_upgrade(&self, changes: &[SchemaChange]) -> bool {
        changes.iter().any(|change| change.is_necessary(self))
    }
}

/// Ordered, append-only list of pending schema changes.
#[derive(Debug, Default)]
pub(crate) struct SchemaLedger {
    changes: Vec<SchemaChange>,
}

impl SchemaLedger {
    pub(crate) fn declare(&mut self, change: SchemaChange) {
        self.changes.push(change);
    }

    pub(crate) fn has_pending(&self) -> bool {
        !self.changes.is_empty()
    }

    /// Remove and return every pending change.
    pub(crate) fn drain(&mut self) -> Vec<SchemaChange> {
        std::mem::take(&mut self.changes)
    }

    pub(crate) fn snapshot(&self) -> &[SchemaChange] {
        &self.changes
    }
}

/// Distinct owning collections of index changes, in first-seen order.
pub(crate) fn index_owners(changes: &[SchemaChange]) -> Vec<String> {
    let mut owners: Vec<String> = Vec::new();
    for owner in changes.iter().filter_map(SchemaChange::owner) {
        if !owners.iter().any(|seen| seen == owner) {
            owners.push(owner.to_owned());
        }
    }
    owners
}

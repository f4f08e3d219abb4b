//! # Batching Entities
//!
//! ## Dirty Set Shape
//!
//! A dirty set is kept minimal: no entry covers another. Each entry carries
//! the sequence number of the last mark that touched it, so confirming a
//! flush only removes entries that were not marked again in the meantime.
//!
//! ```text
//! mark /#4/#5        -> { /#4/#5 }
//! mark /#4/#6        -> { /#4 }          all children of #4 dirty: coalesce
//! mark /#4/#5        -> { /#4 }          covered: sequence bumped only
//! mark /#7/[2]       -> { /#4, /#7/[2] }
//! mark /#7/[3]       -> { /#4, /#7/[2], /#7/[3] }   elements never merge
//! ```

use crate::config::BatchingConfig;
use shared_types::{DataVersion, EncodedPair, TraitInstanceKey};
use wdm_01_property_schema::{ChangeSet, PathElement, PropertyPath, TraitSchema};
use wdm_02_path_codec::VersionTag;

/// How a dictionary element changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElementChange {
    /// A new element was inserted.
    Added,
    /// An element was deleted.
    Removed,
    /// Fields inside an existing element changed.
    Modified,
}

/// Result of marking a path dirty.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkOutcome {
    /// The path was added to the set.
    Added,
    /// An ancestor (or the path itself) was already dirty.
    AlreadyCovered,
    /// The path completed a struct, which replaced its children.
    Coalesced,
    /// The set exceeded its budget and now covers the whole trait.
    Overflowed,
}

/// One dirty path with the sequence of the mark that last touched it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirtyEntry {
    /// Dirty subtree.
    pub path: PropertyPath,
    /// Sequence of the latest mark inside this subtree.
    pub seq: u64,
}

/// Changed paths of one trait instance plus the version they apply to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirtySet {
    base_version: DataVersion,
    entries: Vec<DirtyEntry>,
    next_seq: u64,
}

impl DirtySet {
    /// Empty set against `base_version`.
    pub fn new(base_version: DataVersion) -> Self {
        Self {
            base_version,
            entries: Vec::new(),
            next_seq: 1,
        }
    }

    /// Version captured when the set was created (or last rebased).
    pub fn base_version(&self) -> DataVersion {
        self.base_version
    }

    /// Moves the set onto a newer base after an own update succeeded.
    pub fn rebase(&mut self, version: DataVersion) {
        self.base_version = version;
    }

    /// Current entries.
    pub fn entries(&self) -> &[DirtyEntry] {
        &self.entries
    }

    /// Current paths.
    pub fn paths(&self) -> impl Iterator<Item = &PropertyPath> + '_ {
        self.entries.iter().map(|e| &e.path)
    }

    /// Number of dirty paths.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if nothing is dirty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// True if the whole trait is dirty.
    pub fn is_full(&self) -> bool {
        self.entries.iter().any(|e| e.path.is_root())
    }

    /// True if `path` lies under some dirty path.
    pub fn covers(&self, path: &PropertyPath) -> bool {
        self.entries.iter().any(|e| e.path.covers(path))
    }

    /// Records a change at `path`. The path must already be checked
    /// against `schema`.
    pub fn mark(
        &mut self,
        schema: &TraitSchema,
        path: PropertyPath,
        config: &BatchingConfig,
    ) -> MarkOutcome {
        let seq = self.next_seq;
        self.next_seq += 1;

        if let Some(existing) = self.entries.iter_mut().find(|e| e.path.covers(&path)) {
            existing.seq = seq;
            return MarkOutcome::AlreadyCovered;
        }

        self.entries.retain(|e| !path.covers(&e.path));
        self.entries.push(DirtyEntry {
            path: path.clone(),
            seq,
        });

        let mut outcome = MarkOutcome::Added;
        if config.coalesce_structs {
            let mut current = path;
            while let Some(parent) = self.complete_struct(schema, &current) {
                self.entries.retain(|e| !parent.covers(&e.path));
                self.entries.push(DirtyEntry {
                    path: parent.clone(),
                    seq,
                });
                outcome = MarkOutcome::Coalesced;
                current = parent;
            }
        }

        if self.entries.len() > config.max_dirty_paths {
            self.entries = vec![DirtyEntry {
                path: PropertyPath::root(),
                seq,
            }];
            outcome = MarkOutcome::Overflowed;
        }
        outcome
    }

    /// Parent of `path` if it is a struct whose children are all dirty.
    fn complete_struct(&self, schema: &TraitSchema, path: &PropertyPath) -> Option<PropertyPath> {
        let parent = path.parent()?;
        // A dictionary container's children are elements; those never merge.
        if let Some(PathElement::Property(h)) = parent.last() {
            if schema.is_dictionary(*h) {
                return None;
            }
        }
        let struct_handle = parent.handle();
        let mut children = schema.children(struct_handle).peekable();
        children.peek()?;
        children
            .all(|child| {
                let child_path = parent.child(child);
                self.entries.iter().any(|e| e.path == child_path)
            })
            .then_some(parent)
    }

    /// Removes entries flushed under `flushed` unless re-marked since.
    pub fn remove_flushed(&mut self, flushed: &[DirtyEntry]) {
        self.entries.retain(|e| !flushed.contains(e));
    }
}

/// Identifies one prepared flush.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlushTicket(pub u64);

/// An update ready to hand to the transport.
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedUpdate {
    /// Confirm or abandon with this.
    pub ticket: FlushTicket,
    /// Instance the update targets.
    pub key: TraitInstanceKey,
    /// Version the update was made against.
    pub base_version: DataVersion,
    /// Schema and data version the pairs were encoded with.
    pub version_tag: VersionTag,
    /// Decoded form of the update.
    pub changes: ChangeSet,
    /// Encoded replaced scopes.
    pub scopes: Vec<Vec<u8>>,
    /// Encoded leaf pairs.
    pub pairs: Vec<EncodedPair>,
}

/// Result of a flush.
#[derive(Debug, Clone, PartialEq)]
pub enum FlushOutcome {
    /// Nothing was dirty.
    NoOp,
    /// An update was prepared.
    Prepared(PreparedUpdate),
}

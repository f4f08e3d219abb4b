//! # Update Batcher
//!
//! Per-instance dirty sets and the flush protocol around them.
//!
//! ## Flush Protocol
//!
//! ```text
//! mark_dirty ──→ DirtySet ──flush──→ PreparedUpdate(ticket)
//!                    ↑                    │
//!                    │        ┌───────────┴───────────┐
//!                    │  confirm_handed_off     abandon
//!                    │  (flushed paths out)    (set kept)
//! ```

use crate::config::BatchingConfig;
use crate::domain::{
    BatchError, DirtyEntry, DirtySet, ElementChange, FlushOutcome, FlushTicket, MarkOutcome,
    PreparedUpdate,
};
use shared_types::{DataVersion, ElementKey, SchemaVersion, TraitInstanceKey};
use std::collections::HashMap;
use tracing::{debug, warn};
use wdm_01_property_schema::{ChangeSet, PathValue, PropertyPath, TraitSchema};
use wdm_02_path_codec::{BinaryCodec, PathCodec, VersionTag};
use wdm_03_trait_catalog::{DataError, PropertyReader};

#[derive(Debug)]
struct PendingFlush {
    key: TraitInstanceKey,
    entries: Vec<DirtyEntry>,
}

/// Dirty-set bookkeeping for every instance one writer owns.
#[derive(Debug)]
pub struct UpdateBatcher {
    config: BatchingConfig,
    sets: HashMap<TraitInstanceKey, DirtySet>,
    pending: HashMap<FlushTicket, PendingFlush>,
    next_ticket: u64,
}

impl Default for UpdateBatcher {
    fn default() -> Self {
        Self::new(BatchingConfig::default())
    }
}

impl UpdateBatcher {
    /// Creates an empty batcher.
    pub fn new(config: BatchingConfig) -> Self {
        Self {
            config,
            sets: HashMap::new(),
            pending: HashMap::new(),
            next_ticket: 1,
        }
    }

    // =========================================================================
    // MARKING
    // =========================================================================

    /// Records a change at `path`.
    ///
    /// `base_version` is captured only if the instance has no dirty set yet.
    pub fn mark_dirty(
        &mut self,
        key: TraitInstanceKey,
        schema: &TraitSchema,
        path: PropertyPath,
        base_version: DataVersion,
    ) -> Result<MarkOutcome, BatchError> {
        schema.check_path(&path)?;
        let set = self
            .sets
            .entry(key)
            .or_insert_with(|| DirtySet::new(base_version));
        let outcome = set.mark(schema, path, &self.config);
        if outcome == MarkOutcome::Overflowed {
            wdm_telemetry::DIRTY_SET_OVERFLOWS.inc();
            warn!(
                profile = key.profile.0,
                instance = key.instance.0,
                "Dirty set overflowed, flushing whole trait"
            );
        }
        Ok(outcome)
    }

    /// Records an element change in a dictionary.
    ///
    /// Additions and removals dirty the container; modifications dirty only
    /// the element.
    pub fn mark_element_changed(
        &mut self,
        key: TraitInstanceKey,
        schema: &TraitSchema,
        dictionary: PropertyPath,
        element: ElementKey,
        change: ElementChange,
        base_version: DataVersion,
    ) -> Result<MarkOutcome, BatchError> {
        let path = match change {
            ElementChange::Added | ElementChange::Removed => dictionary,
            ElementChange::Modified => dictionary.element(element),
        };
        self.mark_dirty(key, schema, path, base_version)
    }

    // =========================================================================
    // QUERIES
    // =========================================================================

    /// True if the instance has dirty paths.
    pub fn is_dirty(&self, key: &TraitInstanceKey) -> bool {
        self.sets.get(key).is_some_and(|set| !set.is_empty())
    }

    /// Dirty set of an instance.
    pub fn dirty_set(&self, key: &TraitInstanceKey) -> Option<&DirtySet> {
        self.sets.get(key)
    }

    /// Instances with dirty paths.
    pub fn dirty_instances(&self) -> Vec<TraitInstanceKey> {
        let mut keys: Vec<_> = self
            .sets
            .iter()
            .filter(|(_, set)| !set.is_empty())
            .map(|(key, _)| *key)
            .collect();
        keys.sort();
        keys
    }

    /// True if a prepared flush for the instance is unresolved.
    pub fn has_pending_flush(&self, key: &TraitInstanceKey) -> bool {
        self.pending.values().any(|p| p.key == *key)
    }

    // =========================================================================
    // FLUSH
    // =========================================================================

    /// Expands the instance's dirty paths to leaves, reads and encodes them.
    ///
    /// The dirty set is untouched until the ticket is confirmed.
    pub fn flush<R, C>(
        &mut self,
        key: TraitInstanceKey,
        schema: &TraitSchema,
        schema_version: SchemaVersion,
        reader: &R,
        codec: &PathCodec<C>,
    ) -> Result<FlushOutcome, BatchError>
    where
        R: PropertyReader + ?Sized,
        C: BinaryCodec,
    {
        let set = match self.sets.get(&key) {
            Some(set) if !set.is_empty() => set,
            _ => return Ok(FlushOutcome::NoOp),
        };
        if self.has_pending_flush(&key) {
            return Err(BatchError::FlushInProgress(key));
        }

        let mut values = Vec::new();
        for path in set.paths() {
            let leaves = schema.expand_to_leaves(path, |dict| reader.element_keys(dict))?;
            for leaf in leaves {
                match reader.read_property(&leaf) {
                    Ok(value) => values.push(PathValue { path: leaf, value }),
                    Err(DataError::NotPresent(_)) => {}
                    Err(e) => return Err(e.into()),
                }
            }
        }
        let changes = ChangeSet {
            scopes: set.paths().cloned().collect(),
            values,
        };
        let (scopes, pairs) = codec.encode_change_set(schema, &changes)?;

        let ticket = FlushTicket(self.next_ticket);
        self.next_ticket += 1;
        let base_version = set.base_version();
        self.pending.insert(
            ticket,
            PendingFlush {
                key,
                entries: set.entries().to_vec(),
            },
        );

        debug!(
            profile = key.profile.0,
            instance = key.instance.0,
            ticket = ticket.0,
            scopes = scopes.len(),
            pairs = pairs.len(),
            base_version = base_version.0,
            "Prepared update"
        );
        Ok(FlushOutcome::Prepared(PreparedUpdate {
            ticket,
            key,
            base_version,
            version_tag: VersionTag {
                schema: schema_version,
                data: base_version,
            },
            changes,
            scopes,
            pairs,
        }))
    }

    /// The prepared update reached the transport: drop the flushed paths.
    /// Paths marked after the flush stay dirty.
    pub fn confirm_handed_off(&mut self, ticket: FlushTicket) -> Result<(), BatchError> {
        let pending = self
            .pending
            .remove(&ticket)
            .ok_or(BatchError::UnknownTicket(ticket))?;
        if let Some(set) = self.sets.get_mut(&pending.key) {
            set.remove_flushed(&pending.entries);
            if set.is_empty() {
                self.sets.remove(&pending.key);
            }
        }
        Ok(())
    }

    /// The prepared update never left: keep every dirty path.
    pub fn abandon(&mut self, ticket: FlushTicket) -> Result<(), BatchError> {
        self.pending
            .remove(&ticket)
            .map(|_| ())
            .ok_or(BatchError::UnknownTicket(ticket))
    }

    /// Moves a remaining dirty set onto a newer base version.
    pub fn rebase(&mut self, key: &TraitInstanceKey, version: DataVersion) {
        if let Some(set) = self.sets.get_mut(key) {
            set.rebase(version);
        }
    }

    /// Drops all dirty state of an instance, pending tickets included.
    pub fn clear(&mut self, key: &TraitInstanceKey) {
        self.sets.remove(key);
        self.pending.retain(|_, p| p.key != *key);
    }
}

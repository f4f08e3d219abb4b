//! # Trait Catalog Service
//!
//! Resolves wire-level `(profile, resource, instance)` addresses to live
//! sources and sinks.
//!
//! ## Concurrency
//!
//! One `RwLock` guards every mutation. Iteration copies the occupied slots
//! under the read lock and filters the copy afterwards, so callers never
//! hold the lock while they work through the results.

use crate::config::CatalogConfig;
use crate::domain::{CatalogEntry, CatalogError, CatalogHandle, TraitBinding};
use crate::ports::outbound::{TraitSink, TraitSource};
use parking_lot::RwLock;
use shared_types::TraitInstanceKey;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};
use wdm_01_property_schema::TraitSchema;

#[derive(Debug, Default)]
struct Slot {
    generation: u32,
    entry: Option<CatalogEntry>,
}

#[derive(Debug, Default)]
struct CatalogState {
    slots: Vec<Slot>,
    by_key: HashMap<TraitInstanceKey, u32>,
    free: Vec<u32>,
}

impl CatalogState {
    fn entry(&self, handle: CatalogHandle) -> Result<&CatalogEntry, CatalogError> {
        self.slots
            .get(handle.index())
            .filter(|slot| slot.generation == handle.generation())
            .and_then(|slot| slot.entry.as_ref())
            .ok_or(CatalogError::StaleHandle(handle))
    }
}

/// Registry of live trait instances.
#[derive(Debug)]
pub struct TraitCatalog {
    config: CatalogConfig,
    state: RwLock<CatalogState>,
}

impl Default for TraitCatalog {
    fn default() -> Self {
        Self::new(CatalogConfig::default())
    }
}

impl TraitCatalog {
    /// Creates an empty catalog.
    pub fn new(config: CatalogConfig) -> Self {
        Self {
            config,
            state: RwLock::new(CatalogState::default()),
        }
    }

    /// Registers an instance and returns its handle.
    pub fn register_instance(
        &self,
        key: TraitInstanceKey,
        schema: Arc<TraitSchema>,
        binding: TraitBinding,
    ) -> Result<CatalogHandle, CatalogError> {
        if schema.profile_id() != key.profile {
            return Err(CatalogError::ProfileMismatch {
                key: key.profile,
                schema: schema.profile_id(),
            });
        }
        schema.validate()?;

        let mut state = self.state.write();
        if state.by_key.contains_key(&key) {
            return Err(CatalogError::DuplicateInstance(key));
        }
        if state.by_key.len() >= self.config.max_instances {
            return Err(CatalogError::CatalogFull {
                capacity: self.config.max_instances,
            });
        }

        let kind = binding.kind();
        let entry = CatalogEntry {
            key,
            schema,
            binding,
        };
        let index = match state.free.pop() {
            Some(index) => index,
            None => {
                state.slots.push(Slot::default());
                (state.slots.len() - 1) as u32
            }
        };
        let slot = &mut state.slots[index as usize];
        slot.entry = Some(entry);
        let handle = CatalogHandle::new(index, slot.generation);
        state.by_key.insert(key, index);

        wdm_telemetry::CATALOG_INSTANCES.set(state.by_key.len() as f64);
        wdm_telemetry::log_trait_event!(
            info,
            "wdm-03",
            "Registered trait instance",
            key,
            handle = %handle,
            binding = kind
        );
        Ok(handle)
    }

    /// Handle of a registered instance.
    pub fn lookup(&self, key: &TraitInstanceKey) -> Result<CatalogHandle, CatalogError> {
        let state = self.state.read();
        let index = *state
            .by_key
            .get(key)
            .ok_or(CatalogError::InstanceNotFound(*key))?;
        let generation = state.slots[index as usize].generation;
        Ok(CatalogHandle::new(index, generation))
    }

    /// Removes an instance. The handle, and every copy of it, becomes stale.
    pub fn unregister(&self, handle: CatalogHandle) -> Result<CatalogEntry, CatalogError> {
        let mut state = self.state.write();
        state.entry(handle)?;
        let slot = &mut state.slots[handle.index()];
        let entry = slot.entry.take().ok_or(CatalogError::StaleHandle(handle))?;
        slot.generation = slot.generation.wrapping_add(1);
        state.by_key.remove(&entry.key);
        state.free.push(handle.index() as u32);

        wdm_telemetry::CATALOG_INSTANCES.set(state.by_key.len() as f64);
        info!(
            profile = entry.key.profile.0,
            instance = entry.key.instance.0,
            handle = %handle,
            "Unregistered trait instance"
        );
        Ok(entry)
    }

    /// Registered entry behind a handle.
    pub fn get(&self, handle: CatalogHandle) -> Result<CatalogEntry, CatalogError> {
        self.state.read().entry(handle).cloned()
    }

    /// True if the handle still refers to a registered instance.
    pub fn is_live(&self, handle: CatalogHandle) -> bool {
        self.state.read().entry(handle).is_ok()
    }

    /// Strong reference to the source behind a handle.
    pub fn source(&self, handle: CatalogHandle) -> Result<Arc<dyn TraitSource>, CatalogError> {
        let entry = self.get(handle)?;
        match &entry.binding {
            TraitBinding::Source(weak) => weak
                .upgrade()
                .ok_or(CatalogError::BindingDropped(entry.key)),
            other => Err(CatalogError::WrongBinding {
                key: entry.key,
                actual: other.kind(),
            }),
        }
    }

    /// Strong reference to the sink behind a handle.
    pub fn sink(&self, handle: CatalogHandle) -> Result<Arc<dyn TraitSink>, CatalogError> {
        let entry = self.get(handle)?;
        match &entry.binding {
            TraitBinding::Sink(weak) => weak
                .upgrade()
                .ok_or(CatalogError::BindingDropped(entry.key)),
            other => Err(CatalogError::WrongBinding {
                key: entry.key,
                actual: other.kind(),
            }),
        }
    }

    /// Point-in-time snapshot of every entry matching `predicate`.
    ///
    /// The predicate runs lazily over the copy, so it may call back into
    /// the catalog.
    pub fn iterate<P>(&self, predicate: P) -> CatalogSnapshot<P>
    where
        P: Fn(&CatalogEntry) -> bool,
    {
        let entries: Vec<(CatalogHandle, CatalogEntry)> = {
            let state = self.state.read();
            state
                .slots
                .iter()
                .enumerate()
                .filter_map(|(index, slot)| {
                    slot.entry.as_ref().map(|entry| {
                        (CatalogHandle::new(index as u32, slot.generation), entry.clone())
                    })
                })
                .collect()
        };
        debug!(occupied = entries.len(), "Catalog snapshot taken");
        CatalogSnapshot { entries, predicate }
    }

    /// Number of registered instances.
    pub fn len(&self) -> usize {
        self.state.read().by_key.len()
    }

    /// True if nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Filtered copy of the catalog's occupied slots.
///
/// `iter()` may be called any number of times; each call restarts.
pub struct CatalogSnapshot<P> {
    entries: Vec<(CatalogHandle, CatalogEntry)>,
    predicate: P,
}

impl<P> CatalogSnapshot<P>
where
    P: Fn(&CatalogEntry) -> bool,
{
    /// Matching entries in slot order.
    pub fn iter(&self) -> impl Iterator<Item = (CatalogHandle, &CatalogEntry)> + '_ {
        self.entries
            .iter()
            .filter(|(_, entry)| (self.predicate)(entry))
            .map(|(handle, entry)| (*handle, entry))
    }

    /// First matching entry for a key.
    pub fn find(&self, key: &TraitInstanceKey) -> Option<(CatalogHandle, &CatalogEntry)> {
        self.iter().find(|(_, entry)| entry.key == *key)
    }

    /// Number of matching entries.
    pub fn count(&self) -> usize {
        self.iter().count()
    }
}

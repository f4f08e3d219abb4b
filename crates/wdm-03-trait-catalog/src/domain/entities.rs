//! # Catalog Entities

use crate::ports::outbound::{TraitSink, TraitSource};
use shared_types::TraitInstanceKey;
use std::fmt;
use std::sync::{Arc, Weak};
use wdm_01_property_schema::TraitSchema;

/// Generation-checked reference to a catalog slot.
///
/// A handle stays valid until its instance is unregistered. After that the
/// slot's generation moves on and the handle fails with `StaleHandle`, even
/// if the slot has been reused by another instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CatalogHandle {
    index: u32,
    generation: u32,
}

impl CatalogHandle {
    /// Handle from raw parts.
    pub fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }

    /// Slot index.
    pub fn index(&self) -> usize {
        self.index as usize
    }

    /// Slot generation at registration time.
    pub fn generation(&self) -> u32 {
        self.generation
    }
}

impl fmt::Display for CatalogHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.index, self.generation)
    }
}

/// Non-owning reference to the application object behind an instance.
#[derive(Clone)]
pub enum TraitBinding {
    /// Publisher side: the instance's authoritative data.
    Source(Weak<dyn TraitSource>),
    /// Subscriber side: the local mirror of a remote instance.
    Sink(Weak<dyn TraitSink>),
}

impl TraitBinding {
    /// Binds a source without taking ownership.
    pub fn source<S: TraitSource + 'static>(source: &Arc<S>) -> Self {
        let source: Arc<dyn TraitSource> = source.clone();
        TraitBinding::Source(Arc::downgrade(&source))
    }

    /// Binds a sink without taking ownership.
    pub fn sink<S: TraitSink + 'static>(sink: &Arc<S>) -> Self {
        let sink: Arc<dyn TraitSink> = sink.clone();
        TraitBinding::Sink(Arc::downgrade(&sink))
    }

    /// `"source"` or `"sink"`.
    pub fn kind(&self) -> &'static str {
        match self {
            TraitBinding::Source(_) => "source",
            TraitBinding::Sink(_) => "sink",
        }
    }

    /// True if the bound object has been dropped.
    pub fn is_dropped(&self) -> bool {
        match self {
            TraitBinding::Source(w) => w.strong_count() == 0,
            TraitBinding::Sink(w) => w.strong_count() == 0,
        }
    }
}

impl fmt::Debug for TraitBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TraitBinding")
            .field("kind", &self.kind())
            .field("dropped", &self.is_dropped())
            .finish()
    }
}

/// A registered trait instance.
#[derive(Debug, Clone)]
pub struct CatalogEntry {
    /// Wire address.
    pub key: TraitInstanceKey,
    /// Schema of the instance's trait type.
    pub schema: Arc<TraitSchema>,
    /// Application object.
    pub binding: TraitBinding,
}

//! # Subscription Entities
//!
//! Per-instance bookkeeping on the subscriber side and the FIFO of updates
//! waiting for their response.

use shared_types::{DataVersion, InstanceId, RequestId, TraitInstanceKey, UpdateRequest};
use std::collections::{BTreeMap, VecDeque};
use tokio::time::Instant;
use wdm_03_trait_catalog::CatalogHandle;

/// A subscribed trait instance.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackedInstance {
    /// Catalog handle of the local sink.
    pub handle: CatalogHandle,
    /// Wire address.
    pub key: TraitInstanceKey,
    /// Newest version applied locally.
    pub last_seen: Option<DataVersion>,
    /// A full-state request is outstanding.
    pub reconciling: bool,
}

impl TrackedInstance {
    /// Instance with no reconciliation pending.
    pub fn new(handle: CatalogHandle, key: TraitInstanceKey, last_seen: Option<DataVersion>) -> Self {
        Self {
            handle,
            key,
            last_seen,
            reconciling: false,
        }
    }

    /// Records a version without ever moving backwards.
    pub fn advance(&mut self, version: DataVersion) {
        if self.last_seen.map_or(true, |seen| version > seen) {
            self.last_seen = Some(version);
        }
    }

    /// True if a notify at `version` has nothing new.
    pub fn is_stale(&self, version: DataVersion) -> bool {
        self.last_seen.is_some_and(|seen| version <= seen)
    }
}

/// An update request with its exchange-level retry state.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundUpdate {
    /// Request as sent (resends reuse it, request id included).
    pub request: UpdateRequest,
    /// Resends after a timeout.
    pub retries: u32,
    /// Response deadline; `None` while queued.
    pub deadline: Option<Instant>,
}

impl OutboundUpdate {
    /// Update not yet sent.
    pub fn new(request: UpdateRequest) -> Self {
        Self {
            request,
            retries: 0,
            deadline: None,
        }
    }

    /// Request id.
    pub fn request_id(&self) -> RequestId {
        self.request.request_id
    }

    /// Target instance.
    pub fn instance(&self) -> InstanceId {
        self.request.instance_id
    }

    /// True once handed to the transport.
    pub fn is_in_flight(&self) -> bool {
        self.deadline.is_some()
    }
}

/// Per-instance FIFO of updates. The head of each queue is the only one
/// that may be in flight.
#[derive(Debug, Default)]
pub struct UpdatePipeline {
    queues: BTreeMap<InstanceId, VecDeque<OutboundUpdate>>,
}

impl UpdatePipeline {
    /// Empty pipeline.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an update; true if it is now the head of its queue.
    pub fn enqueue(&mut self, update: OutboundUpdate) -> bool {
        let queue = self.queues.entry(update.instance()).or_default();
        queue.push_back(update);
        queue.len() == 1
    }

    /// Head of an instance's queue.
    pub fn head(&self, instance: InstanceId) -> Option<&OutboundUpdate> {
        self.queues.get(&instance).and_then(VecDeque::front)
    }

    /// Mutable head of an instance's queue.
    pub fn head_mut(&mut self, instance: InstanceId) -> Option<&mut OutboundUpdate> {
        self.queues.get_mut(&instance).and_then(VecDeque::front_mut)
    }

    /// Removes the in-flight head carrying `request_id`.
    pub fn complete(&mut self, request_id: RequestId) -> Option<OutboundUpdate> {
        let instance = self
            .queues
            .iter()
            .find(|(_, q)| q.front().is_some_and(|u| u.request_id() == request_id && u.is_in_flight()))
            .map(|(instance, _)| *instance)?;
        let queue = self.queues.get_mut(&instance)?;
        let done = queue.pop_front();
        if queue.is_empty() {
            self.queues.remove(&instance);
        }
        done
    }

    /// True if any queue holds `request_id`.
    pub fn contains(&self, request_id: RequestId) -> bool {
        self.queues
            .values()
            .flatten()
            .any(|u| u.request_id() == request_id)
    }

    /// Updates currently awaiting a response.
    pub fn in_flight(&self) -> impl Iterator<Item = &OutboundUpdate> + '_ {
        self.queues
            .values()
            .filter_map(VecDeque::front)
            .filter(|u| u.is_in_flight())
    }

    /// Earliest response deadline.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.in_flight().filter_map(|u| u.deadline).min()
    }

    /// Instances whose in-flight head is past its deadline.
    pub fn expired(&self, now: Instant) -> Vec<InstanceId> {
        self.in_flight()
            .filter(|u| u.deadline.is_some_and(|d| d <= now))
            .map(OutboundUpdate::instance)
            .collect()
    }

    /// Removes every update of one instance, in order.
    pub fn drain_instance(&mut self, instance: InstanceId) -> Vec<OutboundUpdate> {
        self.queues
            .remove(&instance)
            .map(Vec::from)
            .unwrap_or_default()
    }

    /// Removes everything, FIFO order kept within each instance.
    pub fn take_all(&mut self) -> Vec<OutboundUpdate> {
        std::mem::take(&mut self.queues)
            .into_values()
            .flatten()
            .map(|mut u| {
                u.deadline = None;
                u
            })
            .collect()
    }

    /// Number of queued or in-flight updates.
    pub fn len(&self) -> usize {
        self.queues.values().map(VecDeque::len).sum()
    }

    /// True if nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.queues.is_empty()
    }
}

//! # Publisher Service
//!
//! Serves subscribe, update and cancel requests for trait instances bound
//! as sources in the catalog, and pushes local changes as diff notifies.
//!
//! ## Update Handling
//!
//! ```text
//! UpdateRequest
//!   ├─ (subscription, request id) in response cache → cached response
//!   ├─ base != current                           → VersionConflict(current)
//!   ├─ decode + validate every pair fails        → SchemaError, nothing applied
//!   └─ write_properties                          → Success(new version)
//!                                                  + diff notify to other subscribers
//! ```

use crate::config::SubscriptionConfig;
use crate::domain::SubscriptionError;
use crate::ports::{MessageHandler, Transport};
use async_trait::async_trait;
use lru::LruCache;
use parking_lot::Mutex;
use shared_types::{
    Cancel, DataVersion, ExchangeHandle, InstanceId, Notify, ProfileId, RejectReason, RequestId,
    ResourceId, SubscribeRequest, SubscribeResponse, SubscribeStatus, SubscriptionId,
    TraitInstanceKey, UpdateRequest, UpdateResponse, UpdateStatus, WdmMessage,
};
use std::collections::{BTreeSet, HashMap};
use std::num::NonZeroUsize;
use std::sync::Arc;
use tracing::{debug, warn};
use wdm_01_property_schema::{ChangeSet, PropertyPath, TraitSchema};
use wdm_02_path_codec::{negotiate_version, version_range, BinaryCodec, BincodeCodec, PathCodec};
use wdm_03_trait_catalog::{CatalogHandle, DataError, TraitCatalog, TraitSource};
use wdm_04_update_batching::{
    check_base_version, BatchError, ElementChange, FlushOutcome, MarkOutcome, UpdateBatcher,
};

const SUBSYSTEM: &str = "wdm-05";

#[derive(Debug)]
struct PublishedSubscription {
    exchange: ExchangeHandle,
    profile: ProfileId,
    resource: ResourceId,
    instances: BTreeSet<InstanceId>,
}

impl PublishedSubscription {
    fn covers(&self, key: &TraitInstanceKey) -> bool {
        self.profile == key.profile
            && self.resource == key.resource
            && self.instances.contains(&key.instance)
    }
}

struct PublisherState {
    subscriptions: HashMap<SubscriptionId, PublishedSubscription>,
    responses: LruCache<(SubscriptionId, RequestId), UpdateResponse>,
    published: HashMap<TraitInstanceKey, DataVersion>,
    batcher: UpdateBatcher,
}

impl PublisherState {
    fn diff_targets(
        &self,
        key: &TraitInstanceKey,
        skip: Option<SubscriptionId>,
    ) -> Vec<(SubscriptionId, ExchangeHandle)> {
        self.subscriptions
            .iter()
            .filter(|(id, sub)| Some(**id) != skip && sub.covers(key))
            .map(|(id, sub)| (*id, sub.exchange))
            .collect()
    }
}

/// Publisher side of WDM.
pub struct PublisherService<C: BinaryCodec = BincodeCodec> {
    config: SubscriptionConfig,
    catalog: Arc<TraitCatalog>,
    transport: Arc<dyn Transport>,
    codec: PathCodec<C>,
    state: Mutex<PublisherState>,
    /// Serializes remote updates; taken before `state`.
    apply_lock: Mutex<()>,
}

impl<C: BinaryCodec> PublisherService<C> {
    /// Create a publisher over a catalog and transport.
    pub fn new(
        config: SubscriptionConfig,
        catalog: Arc<TraitCatalog>,
        transport: Arc<dyn Transport>,
        codec: PathCodec<C>,
    ) -> Self {
        let capacity = NonZeroUsize::new(config.response_cache_size).unwrap_or(NonZeroUsize::MIN);
        let batcher = UpdateBatcher::new(config.batching.clone());
        Self {
            config,
            catalog,
            transport,
            codec,
            apply_lock: Mutex::new(()),
            state: Mutex::new(PublisherState {
                subscriptions: HashMap::new(),
                responses: LruCache::new(capacity),
                published: HashMap::new(),
                batcher,
            }),
        }
    }

    /// Active subscriptions.
    pub fn subscription_count(&self) -> usize {
        self.state.lock().subscriptions.len()
    }

    /// Subscriptions that include `key`.
    pub fn subscribers_of(&self, key: &TraitInstanceKey) -> usize {
        self.state.lock().diff_targets(key, None).len()
    }

    // =========================================================================
    // SUBSCRIBE
    // =========================================================================

    fn handle_subscribe(&self, exchange: ExchangeHandle, request: SubscribeRequest) -> Vec<WdmMessage> {
        match self.accept_subscribe(exchange, &request) {
            Ok(replies) => replies,
            Err(reason) => {
                wdm_telemetry::log_subscription_event!(
                    warn,
                    SUBSYSTEM,
                    "Subscription rejected",
                    request.subscription_id,
                    reason = %reason
                );
                vec![WdmMessage::SubscribeResponse(SubscribeResponse {
                    subscription_id: request.subscription_id,
                    status: SubscribeStatus::Rejected(reason),
                    current_versions: Vec::new(),
                })]
            }
        }
    }

    fn accept_subscribe(
        &self,
        exchange: ExchangeHandle,
        request: &SubscribeRequest,
    ) -> Result<Vec<WdmMessage>, RejectReason> {
        if request.instance_ids.is_empty() {
            return Err(RejectReason::Malformed("no instances".to_string()));
        }
        if !request.last_seen.is_empty() && request.last_seen.len() != request.instance_ids.len() {
            return Err(RejectReason::Malformed("last_seen length mismatch".to_string()));
        }

        let snapshot = self.catalog.iterate(|entry| {
            entry.key.profile == request.profile_id
                && entry.key.resource == request.resource_id
                && entry.binding.kind() == "source"
        });

        let mut resolved = Vec::with_capacity(request.instance_ids.len());
        for instance in &request.instance_ids {
            let key = TraitInstanceKey {
                profile: request.profile_id,
                resource: request.resource_id,
                instance: *instance,
            };
            let (handle, entry) = snapshot
                .find(&key)
                .ok_or(RejectReason::UnknownInstance(*instance))?;
            let range = version_range(&entry.schema);
            negotiate_version(range, request.requested_version).map_err(|_| {
                RejectReason::IncompatibleVersion {
                    requested: request.requested_version,
                    min: range.min,
                    max: range.max,
                }
            })?;
            let source = self
                .catalog
                .source(handle)
                .map_err(|_| RejectReason::UnknownInstance(*instance))?;
            resolved.push((key, Arc::clone(&entry.schema), source));
        }

        {
            let state = self.state.lock();
            if !state.subscriptions.contains_key(&request.subscription_id)
                && state.subscriptions.len() >= self.config.max_subscriptions
            {
                return Err(RejectReason::ResourceExhausted);
            }
        }

        let mut current_versions = Vec::with_capacity(resolved.len());
        let mut notifies = Vec::new();
        for (index, (key, schema, source)) in resolved.iter().enumerate() {
            let current = source.version();
            current_versions.push(current);
            let last_seen = request.last_seen.get(index).copied().flatten();
            if last_seen != Some(current) {
                let notify = self
                    .full_state(request.subscription_id, key, schema, source.as_ref(), current)
                    .map_err(|e| {
                        RejectReason::Malformed(format!("instance {} unreadable: {}", key.instance.0, e))
                    })?;
                notifies.push(WdmMessage::Notify(notify));
            }
        }

        {
            let mut state = self.state.lock();
            let subscription = state
                .subscriptions
                .entry(request.subscription_id)
                .or_insert_with(|| PublishedSubscription {
                    exchange,
                    profile: request.profile_id,
                    resource: request.resource_id,
                    instances: BTreeSet::new(),
                });
            subscription.exchange = exchange;
            subscription.instances.extend(request.instance_ids.iter().copied());
            for ((key, _, _), current) in resolved.iter().zip(&current_versions) {
                state.published.entry(*key).or_insert(*current);
            }
        }

        wdm_telemetry::log_subscription_event!(
            info,
            SUBSYSTEM,
            "Subscription accepted",
            request.subscription_id,
            instances = request.instance_ids.len(),
            full_notifies = notifies.len()
        );

        let mut replies = Vec::with_capacity(notifies.len() + 1);
        replies.push(WdmMessage::SubscribeResponse(SubscribeResponse {
            subscription_id: request.subscription_id,
            status: SubscribeStatus::Accepted,
            current_versions,
        }));
        replies.extend(notifies);
        Ok(replies)
    }

    fn full_state(
        &self,
        subscription_id: SubscriptionId,
        key: &TraitInstanceKey,
        schema: &TraitSchema,
        source: &dyn TraitSource,
        version: DataVersion,
    ) -> Result<Notify, SubscriptionError> {
        let leaves = schema.expand_to_leaves(&PropertyPath::root(), |dict| source.element_keys(dict))?;
        let mut values = Vec::with_capacity(leaves.len());
        for leaf in leaves {
            match source.read_property(&leaf) {
                Ok(value) => values.push(wdm_01_property_schema::PathValue { path: leaf, value }),
                Err(DataError::NotPresent(_)) => {}
                Err(e) => return Err(e.into()),
            }
        }
        let (scopes, pairs) = self
            .codec
            .encode_change_set(schema, &ChangeSet::full_state(values))?;
        Ok(Notify {
            subscription_id,
            instance_id: key.instance,
            base_version: None,
            version,
            full_state: true,
            scopes,
            pairs,
        })
    }

    // =========================================================================
    // UPDATE
    // =========================================================================

    async fn handle_update(&self, request: UpdateRequest) -> Vec<WdmMessage> {
        let (response, fanout) = self.resolve_update(&request);
        for (exchange, notify) in fanout {
            if let Err(e) = self.transport.send(exchange, WdmMessage::Notify(notify)).await {
                warn!(exchange = %exchange, error = %e, "Diff notify not delivered");
            }
        }
        vec![WdmMessage::UpdateResponse(response)]
    }

    /// Answers an update from the response cache or applies it.
    ///
    /// Holds the apply lock from the cache lookup through the write, so the
    /// base version check and the commit are one step for every caller.
    fn resolve_update(&self, request: &UpdateRequest) -> (UpdateResponse, Vec<(ExchangeHandle, Notify)>) {
        let _apply = self.apply_lock.lock();
        let cache_key = (request.subscription_id, request.request_id);
        let cached = self.state.lock().responses.get(&cache_key).cloned();
        if let Some(response) = cached {
            debug!(
                subscription_id = %request.subscription_id,
                request_id = %request.request_id,
                "Duplicate update answered from cache"
            );
            return (response, Vec::new());
        }

        let (status, fanout) = self.apply_update(request);
        if matches!(status, UpdateStatus::SchemaError(_)) {
            wdm_telemetry::metric_inc!(wdm_telemetry::SUBSYSTEM_ERRORS, &[SUBSYSTEM, "update_rejected"]);
        }
        let response = UpdateResponse {
            subscription_id: request.subscription_id,
            request_id: request.request_id,
            status,
        };
        self.state.lock().responses.put(cache_key, response.clone());
        (response, fanout)
    }

    fn apply_update(&self, request: &UpdateRequest) -> (UpdateStatus, Vec<(ExchangeHandle, Notify)>) {
        let key = {
            let state = self.state.lock();
            match state.subscriptions.get(&request.subscription_id) {
                Some(sub) if sub.instances.contains(&request.instance_id) => TraitInstanceKey {
                    profile: sub.profile,
                    resource: sub.resource,
                    instance: request.instance_id,
                },
                Some(_) => {
                    return (
                        UpdateStatus::SchemaError(format!(
                            "instance {} not subscribed",
                            request.instance_id.0
                        )),
                        Vec::new(),
                    )
                }
                None => {
                    return (
                        UpdateStatus::SchemaError(format!(
                            "unknown subscription {}",
                            request.subscription_id
                        )),
                        Vec::new(),
                    )
                }
            }
        };

        let resolved = self.catalog.lookup(&key).and_then(|handle| {
            let entry = self.catalog.get(handle)?;
            let source = self.catalog.source(handle)?;
            Ok((entry.schema, source))
        });
        let (schema, source) = match resolved {
            Ok(resolved) => resolved,
            Err(e) => return (UpdateStatus::SchemaError(e.to_string()), Vec::new()),
        };

        let current = source.version();
        if let Err(BatchError::VersionConflict { current, .. }) =
            check_base_version(request.base_version, current)
        {
            wdm_telemetry::log_trait_event!(
                warn,
                SUBSYSTEM,
                "Update base version is stale",
                key,
                base = request.base_version.0,
                current = current.0
            );
            return (UpdateStatus::VersionConflict(current), Vec::new());
        }

        let changes = match self
            .codec
            .decode_change_set(&schema, &request.scopes, &request.pairs)
        {
            Ok(changes) => changes,
            Err(e) => return (UpdateStatus::SchemaError(e.to_string()), Vec::new()),
        };
        let version = match source.write_properties(&changes) {
            Ok(version) => version,
            Err(e) => return (UpdateStatus::SchemaError(e.to_string()), Vec::new()),
        };

        wdm_telemetry::log_trait_event!(
            info,
            SUBSYSTEM,
            "Update applied",
            key,
            request_id = %request.request_id,
            version = version.0,
            pairs = request.pairs.len()
        );

        let mut state = self.state.lock();
        state.published.insert(key, version);
        let fanout = state
            .diff_targets(&key, Some(request.subscription_id))
            .into_iter()
            .map(|(subscription_id, exchange)| {
                (
                    exchange,
                    Notify {
                        subscription_id,
                        instance_id: key.instance,
                        base_version: Some(current),
                        version,
                        full_state: false,
                        scopes: request.scopes.clone(),
                        pairs: request.pairs.clone(),
                    },
                )
            })
            .collect();
        (UpdateStatus::Success(version), fanout)
    }

    // =========================================================================
    // CANCEL
    // =========================================================================

    fn handle_cancel(&self, cancel: Cancel) {
        let mut state = self.state.lock();
        let emptied = match state.subscriptions.get_mut(&cancel.subscription_id) {
            Some(sub) => {
                if cancel.instance_ids.is_empty() {
                    sub.instances.clear();
                } else {
                    for instance in &cancel.instance_ids {
                        sub.instances.remove(instance);
                    }
                }
                sub.instances.is_empty()
            }
            None => return,
        };
        if emptied {
            state.subscriptions.remove(&cancel.subscription_id);
        }
        wdm_telemetry::log_subscription_event!(
            info,
            SUBSYSTEM,
            "Subscription canceled by peer",
            cancel.subscription_id,
            instances = cancel.instance_ids.len(),
            removed = emptied
        );
    }

    // =========================================================================
    // LOCAL CHANGES
    // =========================================================================

    /// Records a local change to a published instance.
    pub fn mark_dirty(
        &self,
        handle: CatalogHandle,
        path: PropertyPath,
    ) -> Result<MarkOutcome, SubscriptionError> {
        let entry = self.catalog.get(handle)?;
        let source = self.catalog.source(handle)?;
        let mut state = self.state.lock();
        let base = state
            .published
            .get(&entry.key)
            .copied()
            .unwrap_or_else(|| source.version());
        Ok(state
            .batcher
            .mark_dirty(entry.key, &entry.schema, path, base)?)
    }

    /// Records a dictionary element change to a published instance.
    pub fn mark_element_changed(
        &self,
        handle: CatalogHandle,
        dictionary: PropertyPath,
        element: shared_types::ElementKey,
        change: ElementChange,
    ) -> Result<MarkOutcome, SubscriptionError> {
        let path = match change {
            ElementChange::Added | ElementChange::Removed => dictionary,
            ElementChange::Modified => dictionary.element(element),
        };
        self.mark_dirty(handle, path)
    }

    /// Sends every dirty instance's changes as a diff notify to its
    /// subscribers. Returns the number of notifies sent.
    pub async fn notify_dirty(&self) -> Result<usize, SubscriptionError> {
        let mut outgoing = Vec::new();
        {
            let mut state = self.state.lock();
            for key in state.batcher.dirty_instances() {
                let Ok(handle) = self.catalog.lookup(&key) else {
                    state.batcher.clear(&key);
                    continue;
                };
                let entry = self.catalog.get(handle)?;
                let source = self.catalog.source(handle)?;
                let version = source.version();
                let prepared = match state.batcher.flush(
                    key,
                    &entry.schema,
                    entry.schema.max_version(),
                    source.as_ref(),
                    &self.codec,
                )? {
                    FlushOutcome::NoOp => continue,
                    FlushOutcome::Prepared(prepared) => prepared,
                };
                for (subscription_id, exchange) in state.diff_targets(&key, None) {
                    outgoing.push((
                        exchange,
                        Notify {
                            subscription_id,
                            instance_id: key.instance,
                            base_version: Some(prepared.base_version),
                            version,
                            full_state: false,
                            scopes: prepared.scopes.clone(),
                            pairs: prepared.pairs.clone(),
                        },
                    ));
                }
                state.batcher.confirm_handed_off(prepared.ticket)?;
                state.published.insert(key, version);
            }
        }

        let mut sent = 0;
        for (exchange, notify) in outgoing {
            match self.transport.send(exchange, WdmMessage::Notify(notify)).await {
                Ok(()) => sent += 1,
                Err(e) => warn!(exchange = %exchange, error = %e, "Diff notify not delivered"),
            }
        }
        Ok(sent)
    }

    /// Drops instances no longer in the catalog from every subscription and
    /// tells the subscribers. Returns the number of instances dropped.
    pub async fn purge_stale_instances(&self) -> usize {
        let mut cancels = Vec::new();
        let mut removed = 0;
        {
            let mut state = self.state.lock();
            for (subscription_id, sub) in state.subscriptions.iter_mut() {
                let gone: Vec<InstanceId> = sub
                    .instances
                    .iter()
                    .copied()
                    .filter(|instance| {
                        let key = TraitInstanceKey {
                            profile: sub.profile,
                            resource: sub.resource,
                            instance: *instance,
                        };
                        self.catalog.lookup(&key).is_err()
                    })
                    .collect();
                if gone.is_empty() {
                    continue;
                }
                for instance in &gone {
                    sub.instances.remove(instance);
                }
                removed += gone.len();
                cancels.push((
                    sub.exchange,
                    Cancel {
                        subscription_id: *subscription_id,
                        instance_ids: gone,
                    },
                ));
            }
            state.subscriptions.retain(|_, sub| !sub.instances.is_empty());
            let stale: Vec<TraitInstanceKey> = state
                .published
                .keys()
                .filter(|key| self.catalog.lookup(key).is_err())
                .copied()
                .collect();
            for key in stale {
                state.published.remove(&key);
                state.batcher.clear(&key);
            }
        }

        for (exchange, cancel) in cancels {
            if let Err(e) = self.transport.send(exchange, WdmMessage::Cancel(cancel)).await {
                warn!(exchange = %exchange, error = %e, "Cancel not delivered");
            }
        }
        if removed > 0 {
            wdm_telemetry::log_event!(
                info,
                SUBSYSTEM,
                "Purged stale instances from subscriptions",
                removed = removed
            );
        }
        removed
    }
}

#[async_trait]
impl<C: BinaryCodec + 'static> MessageHandler for PublisherService<C> {
    async fn handle_message(&self, exchange: ExchangeHandle, message: WdmMessage) -> Vec<WdmMessage> {
        match message {
            WdmMessage::SubscribeRequest(request) => self.handle_subscribe(exchange, request),
            WdmMessage::UpdateRequest(request) => self.handle_update(request).await,
            WdmMessage::Cancel(cancel) => {
                self.handle_cancel(cancel);
                Vec::new()
            }
            other => {
                debug!(kind = other.kind(), "Publisher ignores message");
                Vec::new()
            }
        }
    }
}

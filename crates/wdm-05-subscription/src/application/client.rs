//! # Subscription Client
//!
//! Subscriber side of WDM: one subscription to any number of instances of a
//! single profile on one resource, held consistent with the publisher across
//! notifies, local updates, conflicts and reconnects.
//!
//! ## Lifecycle
//!
//! ```text
//!  subscribe() ──→ Subscribing ──accept + full state──→ Established ⇄ Notifying
//!      ↑               │ reject / timeout / retries spent        │
//!      │               ↓                                         │ send retries spent,
//!      └──────────── Idle ←── Canceling ←── cancel()             │ exchange or liveness timeout
//!                                                                ↓
//!                                   resubscribe() ←──────── Aborting
//! ```
//!
//! Everything runs on the caller's task through `&mut self`; the only
//! suspension points are transport exchanges and timers.

use crate::config::SubscriptionConfig;
use crate::domain::{
    OutboundUpdate, SubscriptionError, SubscriptionEvent, SubscriptionState,
    SubscriptionStateMachine, SyncStatus, TrackedInstance, TransportError, UpdatePipeline,
};
use crate::ports::Transport;
use shared_types::{
    Cancel, DataVersion, ElementKey, ExchangeHandle, InstanceId, Notify, PeerId, ProfileId,
    RejectReason, RequestId, ResourceId, SubscribeRequest, SubscribeResponse, SubscribeStatus,
    SubscriptionId, UpdateRequest, UpdateResponse, UpdateStatus, WdmMessage,
};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tokio::time::{sleep, sleep_until, timeout_at, Instant};
use tracing::{debug, warn};
use wdm_01_property_schema::{PropertyPath, SchemaError, TraitSchema};
use wdm_02_path_codec::{BinaryCodec, BincodeCodec, PathCodec};
use wdm_03_trait_catalog::{CatalogHandle, TraitCatalog};
use wdm_04_update_batching::{ElementChange, FlushOutcome, MarkOutcome, UpdateBatcher};

const SUBSYSTEM: &str = "wdm-05";

/// Requests cancellation of a subscription from another task.
///
/// Honoured at the next suspension point of the owning client: once the
/// accept/reject resolves while subscribing, or at the next `poll`.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelHandle {
    /// Ask the subscription to cancel.
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    /// True if cancellation was requested and not yet honoured.
    pub fn is_requested(&self) -> bool {
        *self.tx.borrow()
    }
}

enum NotifyOutcome {
    Applied,
    Stale,
    BaseMismatch,
    Untracked,
}

enum Woke {
    Message(Result<WdmMessage, TransportError>),
    Deadline,
    Cancel,
}

/// Subscriber side of WDM.
pub struct SubscriptionClient<C: BinaryCodec = BincodeCodec> {
    config: SubscriptionConfig,
    catalog: Arc<TraitCatalog>,
    transport: Arc<dyn Transport>,
    codec: PathCodec<C>,
    machine: SubscriptionStateMachine,
    subscription_id: SubscriptionId,
    peer: Option<PeerId>,
    exchange: Option<ExchangeHandle>,
    target: Option<(ProfileId, ResourceId)>,
    schema: Option<Arc<TraitSchema>>,
    instances: BTreeMap<InstanceId, TrackedInstance>,
    batcher: UpdateBatcher,
    pipeline: UpdatePipeline,
    retained: Vec<OutboundUpdate>,
    completed: HashMap<RequestId, Result<DataVersion, SubscriptionError>>,
    inbound: VecDeque<WdmMessage>,
    reconciling: VecDeque<Vec<InstanceId>>,
    next_request: u64,
    events: broadcast::Sender<SubscriptionEvent>,
    cancel_tx: Arc<watch::Sender<bool>>,
    cancel_rx: watch::Receiver<bool>,
}

impl<C: BinaryCodec> SubscriptionClient<C> {
    /// Create an idle client.
    pub fn new(
        config: SubscriptionConfig,
        catalog: Arc<TraitCatalog>,
        transport: Arc<dyn Transport>,
        codec: PathCodec<C>,
    ) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let batcher = UpdateBatcher::new(config.batching.clone());
        Self {
            config,
            catalog,
            transport,
            codec,
            machine: SubscriptionStateMachine::new(),
            subscription_id: SubscriptionId::random(),
            peer: None,
            exchange: None,
            target: None,
            schema: None,
            instances: BTreeMap::new(),
            batcher,
            pipeline: UpdatePipeline::new(),
            retained: Vec::new(),
            completed: HashMap::new(),
            inbound: VecDeque::new(),
            reconciling: VecDeque::new(),
            next_request: 1,
            events,
            cancel_tx: Arc::new(cancel_tx),
            cancel_rx,
        }
    }

    // =========================================================================
    // ACCESSORS
    // =========================================================================

    /// Current state.
    pub fn state(&self) -> SubscriptionState {
        self.machine.state()
    }

    /// Externally visible status; `None` while idle or canceling.
    pub fn status(&self) -> Option<SyncStatus> {
        self.machine.status()
    }

    /// Id of the current (or last) subscription.
    pub fn subscription_id(&self) -> SubscriptionId {
        self.subscription_id
    }

    /// New receiver of subscription events.
    pub fn events(&self) -> broadcast::Receiver<SubscriptionEvent> {
        self.events.subscribe()
    }

    /// Handle for canceling from another task.
    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle {
            tx: Arc::clone(&self.cancel_tx),
        }
    }

    /// Last data version applied for a subscribed handle.
    pub fn last_seen(&self, handle: CatalogHandle) -> Option<DataVersion> {
        self.instances
            .values()
            .find(|t| t.handle == handle)
            .and_then(|t| t.last_seen)
    }

    /// True if the handle has local changes not yet flushed.
    pub fn is_dirty(&self, handle: CatalogHandle) -> bool {
        self.instances
            .values()
            .find(|t| t.handle == handle)
            .is_some_and(|t| self.batcher.is_dirty(&t.key))
    }

    /// Updates queued or in flight.
    pub fn pending_updates(&self) -> usize {
        self.pipeline.len()
    }

    /// Updates held while aborting, replayed on resubscribe.
    pub fn retained_updates(&self) -> usize {
        self.retained.len()
    }

    // =========================================================================
    // SUBSCRIBE
    // =========================================================================

    /// Subscribe to the instances behind `handles` on `peer`.
    ///
    /// Returns once the subscription is established and every instance the
    /// publisher reported as changed has been replaced with full state.
    pub async fn subscribe(
        &mut self,
        peer: PeerId,
        handles: &[CatalogHandle],
    ) -> Result<(), SubscriptionError> {
        self.require(SubscriptionState::Idle, "subscribe")?;
        if handles.is_empty() {
            return Err(SubscriptionError::EmptySubscription);
        }

        let mut instances = BTreeMap::new();
        let mut target = None;
        let mut schema = None;
        for &handle in handles {
            let entry = self.catalog.get(handle)?;
            let sink = self.catalog.sink(handle)?;
            let this = (entry.key.profile, entry.key.resource);
            match target {
                None => {
                    target = Some(this);
                    schema = Some(Arc::clone(&entry.schema));
                }
                Some(existing) if existing != this => return Err(SubscriptionError::MixedTargets),
                Some(_) => {}
            }
            instances.insert(
                entry.key.instance,
                TrackedInstance::new(handle, entry.key, sink.applied_version()),
            );
        }

        self.cancel_tx.send_replace(false);
        self.cancel_rx.borrow_and_update();
        self.subscription_id = SubscriptionId::random();
        self.peer = Some(peer);
        self.target = target;
        self.schema = schema;
        self.instances = instances;
        self.set_state(SubscriptionState::Subscribing, None)?;

        let _timer = wdm_telemetry::time_histogram!(wdm_telemetry::SUBSCRIBE_DURATION);
        let ids: Vec<InstanceId> = self.instances.keys().copied().collect();

        let current = match self.subscribe_with_retry(&ids).await {
            Ok(current) => current,
            Err(error) => return Err(self.fail_subscribe(error)),
        };

        if *self.cancel_rx.borrow_and_update() {
            self.send_cancel().await;
            self.drop_exchange();
            self.set_state(SubscriptionState::Canceling, None)?;
            self.reset();
            self.set_state(SubscriptionState::Idle, None)?;
            return Err(SubscriptionError::Canceled);
        }

        if let Err(error) = self.consume_full_state(&ids, &current).await {
            self.send_cancel().await;
            return Err(self.fail_subscribe(error));
        }

        self.machine.touch(Instant::now());
        self.set_state(SubscriptionState::Established, None)?;
        wdm_telemetry::metric_inc!(wdm_telemetry::SUBSCRIPTIONS_ESTABLISHED);
        wdm_telemetry::log_subscription_event!(
            info,
            SUBSYSTEM,
            "Subscription established",
            self.subscription_id,
            peer = %peer,
            instances = ids.len()
        );
        Ok(())
    }

    async fn subscribe_with_retry(
        &mut self,
        ids: &[InstanceId],
    ) -> Result<Vec<DataVersion>, SubscriptionError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.request_subscription(ids).await {
                Err(SubscriptionError::Transport(error)) => {
                    self.drop_exchange();
                    if attempt >= self.config.max_subscribe_attempts {
                        return Err(SubscriptionError::SubscriptionFailed {
                            attempts: attempt,
                            last_error: Box::new(error.into()),
                        });
                    }
                    let delay = self.config.backoff(attempt);
                    wdm_telemetry::log_subscription_event!(
                        warn,
                        SUBSYSTEM,
                        "Subscribe attempt failed, backing off",
                        self.subscription_id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %error
                    );
                    sleep(delay).await;
                }
                other => return other,
            }
        }
    }

    fn fail_subscribe(&mut self, error: SubscriptionError) -> SubscriptionError {
        self.drop_exchange();
        let mut failed = 0;
        for update in self.pipeline.take_all().into_iter().chain(self.retained.drain(..)) {
            self.completed.insert(update.request_id(), Err(error.clone()));
            failed += 1;
        }
        let discarded_dirty = self.batcher.dirty_instances().len();
        self.reset();
        wdm_telemetry::log_subscription_event!(
            warn,
            SUBSYSTEM,
            "Subscription failed",
            self.subscription_id,
            error = %error,
            failed_updates = failed,
            discarded_dirty
        );
        if let Err(e) = self.set_state(SubscriptionState::Idle, Some(error.clone())) {
            debug!(error = %e, "Already idle");
        }
        error
    }

    /// Sends a subscribe request for `ids` and waits for its response,
    /// buffering anything else that arrives first.
    async fn request_subscription(
        &mut self,
        ids: &[InstanceId],
    ) -> Result<Vec<DataVersion>, SubscriptionError> {
        let exchange = self.ensure_exchange().await?;
        let request = self.subscribe_request(ids)?;
        self.transport
            .send(exchange, WdmMessage::SubscribeRequest(request))
            .await?;

        let deadline = Instant::now() + self.config.exchange_timeout();
        loop {
            let message = match timeout_at(deadline, self.transport.on_message(exchange)).await {
                Ok(received) => received?,
                Err(_) => return Err(SubscriptionError::SubscriptionTimeout),
            };
            match message {
                WdmMessage::SubscribeResponse(response)
                    if response.subscription_id == self.subscription_id =>
                {
                    return Self::accepted_versions(response, ids.len());
                }
                other => self.inbound.push_back(other),
            }
        }
    }

    fn accepted_versions(
        response: SubscribeResponse,
        expected: usize,
    ) -> Result<Vec<DataVersion>, SubscriptionError> {
        match response.status {
            SubscribeStatus::Accepted if response.current_versions.len() == expected => {
                Ok(response.current_versions)
            }
            SubscribeStatus::Accepted => Err(SubscriptionError::SubscriptionRejected(
                RejectReason::Malformed(format!(
                    "{} current versions for {} instances",
                    response.current_versions.len(),
                    expected
                )),
            )),
            SubscribeStatus::Rejected(RejectReason::IncompatibleVersion {
                requested,
                min,
                max,
            }) => Err(SchemaError::version_unsupported(requested, min, max).into()),
            SubscribeStatus::Rejected(reason) => {
                Err(SubscriptionError::SubscriptionRejected(reason))
            }
        }
    }

    fn subscribe_request(&self, ids: &[InstanceId]) -> Result<SubscribeRequest, SubscriptionError> {
        let (profile_id, resource_id) = self.target.ok_or(SubscriptionError::InvalidState {
            operation: "subscribe",
            state: self.machine.state(),
        })?;
        let schema = self.schema()?;
        Ok(SubscribeRequest {
            subscription_id: self.subscription_id,
            profile_id,
            resource_id,
            instance_ids: ids.to_vec(),
            requested_version: schema.max_version(),
            last_seen: ids
                .iter()
                .map(|id| self.instances.get(id).and_then(|t| t.last_seen))
                .collect(),
        })
    }

    /// Applies the full-state notifies owed after an accept: one for every
    /// instance whose last-seen version differs from the current one.
    async fn consume_full_state(
        &mut self,
        ids: &[InstanceId],
        current: &[DataVersion],
    ) -> Result<(), SubscriptionError> {
        let mut expected: BTreeSet<InstanceId> = ids
            .iter()
            .zip(current)
            .filter(|(id, version)| {
                self.instances.get(id).and_then(|t| t.last_seen) != Some(**version)
            })
            .map(|(id, _)| *id)
            .collect();

        let mut buffered = std::mem::take(&mut self.inbound);
        let mut deferred = VecDeque::new();
        let deadline = Instant::now() + self.config.exchange_timeout();

        while !expected.is_empty() {
            let message = match buffered.pop_front() {
                Some(message) => message,
                None => {
                    let exchange = self.active_exchange("subscribe")?;
                    match timeout_at(deadline, self.transport.on_message(exchange)).await {
                        Ok(received) => received?,
                        Err(_) => {
                            self.inbound = deferred;
                            return Err(SubscriptionError::SubscriptionTimeout);
                        }
                    }
                }
            };
            match message {
                WdmMessage::Notify(notify)
                    if notify.full_state
                        && notify.subscription_id == self.subscription_id
                        && expected.contains(&notify.instance_id) =>
                {
                    self.apply_notify(&notify)?;
                    expected.remove(&notify.instance_id);
                }
                other => deferred.push_back(other),
            }
        }

        deferred.extend(buffered);
        self.inbound = deferred;
        Ok(())
    }

    // =========================================================================
    // POLL
    // =========================================================================

    /// Handles the next inbound message, expired deadline or cancellation.
    ///
    /// An error that ends only one exchange (a notify that fails schema
    /// validation, a rejected update) is returned while the subscription
    /// stays established. Errors that abort the subscription leave it in
    /// `Aborting`.
    pub async fn poll(&mut self) -> Result<(), SubscriptionError> {
        if !self.machine.state().is_active() {
            return Err(SubscriptionError::InvalidState {
                operation: "poll",
                state: self.machine.state(),
            });
        }
        if self.cancel_rx.has_changed().unwrap_or(false) && *self.cancel_rx.borrow_and_update() {
            return self.cancel().await;
        }
        if let Some(message) = self.inbound.pop_front() {
            return self.dispatch(message).await;
        }

        let exchange = self.active_exchange("poll")?;
        let deadline = self.next_deadline();
        let transport = Arc::clone(&self.transport);
        let mut cancel_rx = self.cancel_rx.clone();

        let woke = tokio::select! {
            received = transport.on_message(exchange) => Woke::Message(received),
            _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => Woke::Deadline,
            Ok(()) = cancel_rx.changed() => Woke::Cancel,
        };

        match woke {
            Woke::Message(Ok(message)) => {
                self.machine.touch(Instant::now());
                self.dispatch(message).await
            }
            Woke::Message(Err(error)) => Err(self.escalate(error.into())),
            Woke::Deadline => self.on_deadline().await,
            Woke::Cancel => {
                self.cancel_rx.borrow_and_update();
                self.cancel().await
            }
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        let liveness = self
            .config
            .liveness_timeout()
            .zip(self.machine.last_exchange())
            .map(|(timeout, last)| last + timeout);
        match (self.pipeline.next_deadline(), liveness) {
            (Some(exchange), Some(liveness)) => Some(exchange.min(liveness)),
            (exchange, liveness) => exchange.or(liveness),
        }
    }

    async fn dispatch(&mut self, message: WdmMessage) -> Result<(), SubscriptionError> {
        if message.subscription_id() != self.subscription_id {
            debug!(
                kind = message.kind(),
                subscription_id = %message.subscription_id(),
                "Message for another subscription dropped"
            );
            return Ok(());
        }
        match message {
            WdmMessage::Notify(notify) => self.on_notify(notify).await,
            WdmMessage::UpdateResponse(response) => self.on_update_response(response).await,
            WdmMessage::SubscribeResponse(response) => self.on_reconcile_response(response),
            WdmMessage::Cancel(cancel) => self.on_remote_cancel(cancel),
            other => {
                debug!(kind = other.kind(), "Subscriber ignores message");
                Ok(())
            }
        }
    }

    async fn on_deadline(&mut self) -> Result<(), SubscriptionError> {
        let now = Instant::now();
        if let (Some(timeout), Some(last)) =
            (self.config.liveness_timeout(), self.machine.last_exchange())
        {
            if last + timeout <= now {
                return Err(self.escalate(SubscriptionError::LivenessTimeout));
            }
        }

        for instance in self.pipeline.expired(now) {
            let Some(head) = self.pipeline.head_mut(instance) else {
                continue;
            };
            if head.retries >= self.config.max_exchange_retries {
                let request_id = head.request_id();
                return Err(self.escalate(SubscriptionError::ExchangeTimeout(request_id)));
            }
            head.retries += 1;
            head.deadline = Some(now + self.config.exchange_timeout());
            let request = head.request.clone();
            let retries = head.retries;

            wdm_telemetry::metric_inc!(wdm_telemetry::EXCHANGE_RETRIES);
            wdm_telemetry::log_subscription_event!(
                warn,
                SUBSYSTEM,
                "Update timed out, resending",
                self.subscription_id,
                request_id = %request.request_id,
                retry = retries
            );
            self.send_with_retry(WdmMessage::UpdateRequest(request)).await?;
        }
        Ok(())
    }

    // =========================================================================
    // NOTIFY
    // =========================================================================

    async fn on_notify(&mut self, notify: Notify) -> Result<(), SubscriptionError> {
        self.machine.transition(SubscriptionState::Notifying)?;
        let outcome = self.apply_notify(&notify);
        self.machine.transition(SubscriptionState::Established)?;

        match outcome {
            Ok(NotifyOutcome::BaseMismatch) => self.reconcile(vec![notify.instance_id]).await,
            Ok(_) => Ok(()),
            Err(error) => {
                wdm_telemetry::log_subscription_event!(
                    warn,
                    SUBSYSTEM,
                    "Notify rejected",
                    self.subscription_id,
                    instance = notify.instance_id.0,
                    version = notify.version.0,
                    error = %error
                );
                self.emit(SubscriptionEvent::Error(error.clone()));
                Err(error)
            }
        }
    }

    /// Validates a whole notify batch, then applies it to the sink.
    fn apply_notify(&mut self, notify: &Notify) -> Result<NotifyOutcome, SubscriptionError> {
        let schema = self.schema()?;
        let Some(tracked) = self.instances.get(&notify.instance_id) else {
            debug!(instance = notify.instance_id.0, "Notify for untracked instance");
            return Ok(NotifyOutcome::Untracked);
        };
        if tracked.is_stale(notify.version) {
            debug!(
                instance = notify.instance_id.0,
                version = notify.version.0,
                "Stale notify ignored"
            );
            return Ok(NotifyOutcome::Stale);
        }
        if !notify.full_state && notify.base_version != tracked.last_seen {
            debug!(
                instance = notify.instance_id.0,
                base = ?notify.base_version,
                last_seen = ?tracked.last_seen,
                "Notify base does not match last seen"
            );
            return Ok(NotifyOutcome::BaseMismatch);
        }

        let sink = self.catalog.sink(tracked.handle)?;
        let changes = self
            .codec
            .decode_change_set(&schema, &notify.scopes, &notify.pairs)?;
        sink.apply_notify(notify.version, &changes)?;

        if let Some(tracked) = self.instances.get_mut(&notify.instance_id) {
            tracked.advance(notify.version);
            if notify.full_state {
                tracked.reconciling = false;
            }
        }
        let kind = if notify.full_state { "full" } else { "diff" };
        wdm_telemetry::metric_inc!(wdm_telemetry::NOTIFIES_APPLIED, &[kind]);
        debug!(
            instance = notify.instance_id.0,
            version = notify.version.0,
            kind,
            pairs = notify.pairs.len(),
            "Notify applied"
        );
        self.emit(SubscriptionEvent::NotifyApplied {
            instance: notify.instance_id,
            version: notify.version,
            full_state: notify.full_state,
        });
        Ok(NotifyOutcome::Applied)
    }

    /// Asks the publisher for full state of instances whose view diverged.
    async fn reconcile(&mut self, ids: Vec<InstanceId>) -> Result<(), SubscriptionError> {
        let ids: Vec<InstanceId> = ids
            .into_iter()
            .filter(|id| self.instances.get(id).is_some_and(|t| !t.reconciling))
            .collect();
        if ids.is_empty() {
            return Ok(());
        }
        for id in &ids {
            if let Some(tracked) = self.instances.get_mut(id) {
                tracked.reconciling = true;
            }
        }
        let request = self.subscribe_request(&ids)?;
        self.reconciling.push_back(ids.clone());
        wdm_telemetry::log_subscription_event!(
            info,
            SUBSYSTEM,
            "Reconciling instances",
            self.subscription_id,
            instances = ?ids
        );
        self.emit(SubscriptionEvent::ReconciliationStarted { instances: ids });
        self.send_with_retry(WdmMessage::SubscribeRequest(request)).await
    }

    fn on_reconcile_response(&mut self, response: SubscribeResponse) -> Result<(), SubscriptionError> {
        let Some(ids) = self.reconciling.pop_front() else {
            debug!("Unsolicited subscribe response dropped");
            return Ok(());
        };
        match Self::accepted_versions(response, ids.len()) {
            Ok(current) => {
                for (id, version) in ids.iter().zip(current) {
                    if let Some(tracked) = self.instances.get_mut(id) {
                        // Otherwise a full-state notify follows and clears the flag.
                        if tracked.last_seen == Some(version) {
                            tracked.reconciling = false;
                        }
                    }
                }
                Ok(())
            }
            Err(error) => {
                for id in &ids {
                    if let Some(tracked) = self.instances.get_mut(id) {
                        tracked.reconciling = false;
                    }
                }
                self.emit(SubscriptionEvent::Error(error.clone()));
                Err(error)
            }
        }
    }

    fn on_remote_cancel(&mut self, cancel: Cancel) -> Result<(), SubscriptionError> {
        let removed: Vec<InstanceId> = if cancel.instance_ids.is_empty() {
            self.instances.keys().copied().collect()
        } else {
            cancel
                .instance_ids
                .into_iter()
                .filter(|id| self.instances.contains_key(id))
                .collect()
        };
        for id in &removed {
            if let Some(tracked) = self.instances.remove(id) {
                self.batcher.clear(&tracked.key);
            }
            for update in self.pipeline.drain_instance(*id) {
                self.completed
                    .insert(update.request_id(), Err(SubscriptionError::Canceled));
            }
            self.emit(SubscriptionEvent::InstanceRemoved(*id));
        }
        wdm_telemetry::log_subscription_event!(
            info,
            SUBSYSTEM,
            "Publisher dropped instances",
            self.subscription_id,
            removed = removed.len(),
            remaining = self.instances.len()
        );

        if self.instances.is_empty() {
            self.drop_exchange();
            self.set_state(SubscriptionState::Canceling, None)?;
            self.reset();
            self.set_state(SubscriptionState::Idle, None)?;
        }
        Ok(())
    }

    // =========================================================================
    // LOCAL UPDATES
    // =========================================================================

    /// Records a local change at `path` of a subscribed instance.
    pub fn mark_dirty(
        &mut self,
        handle: CatalogHandle,
        path: PropertyPath,
    ) -> Result<MarkOutcome, SubscriptionError> {
        self.require_subscribed("mark_dirty")?;
        let instance = self.instance_for(handle)?;
        let schema = self.schema()?;
        let (key, base) = match self.instances.get(&instance) {
            Some(tracked) => (tracked.key, tracked.last_seen.unwrap_or_default()),
            None => return Err(SubscriptionError::NotSubscribed(handle)),
        };
        Ok(self.batcher.mark_dirty(key, &schema, path, base)?)
    }

    /// Records an element insert, removal or modification in a dictionary.
    pub fn mark_element_changed(
        &mut self,
        handle: CatalogHandle,
        dictionary: PropertyPath,
        element: ElementKey,
        change: ElementChange,
    ) -> Result<MarkOutcome, SubscriptionError> {
        self.require_subscribed("mark_element_changed")?;
        let instance = self.instance_for(handle)?;
        let schema = self.schema()?;
        let (key, base) = match self.instances.get(&instance) {
            Some(tracked) => (tracked.key, tracked.last_seen.unwrap_or_default()),
            None => return Err(SubscriptionError::NotSubscribed(handle)),
        };
        Ok(self
            .batcher
            .mark_element_changed(key, &schema, dictionary, element, change, base)?)
    }

    /// Sends the dirty paths of one instance as an update.
    ///
    /// Returns the request id to await, or `None` if nothing was dirty. The
    /// update waits behind any update already in flight for the instance.
    pub async fn flush(&mut self, handle: CatalogHandle) -> Result<Option<RequestId>, SubscriptionError> {
        if !self.machine.state().is_active() {
            return Err(SubscriptionError::InvalidState {
                operation: "flush",
                state: self.machine.state(),
            });
        }
        let instance = self.instance_for(handle)?;
        let schema = self.schema()?;
        let key = match self.instances.get(&instance) {
            Some(tracked) => tracked.key,
            None => return Err(SubscriptionError::NotSubscribed(handle)),
        };
        let sink = self.catalog.sink(handle)?;

        let prepared = match self.batcher.flush(
            key,
            &schema,
            schema.max_version(),
            sink.as_ref(),
            &self.codec,
        )? {
            FlushOutcome::NoOp => return Ok(None),
            FlushOutcome::Prepared(prepared) => prepared,
        };
        // The pipeline owns the update from here, across aborts too.
        self.batcher.confirm_handed_off(prepared.ticket)?;

        let request_id = RequestId(self.next_request);
        self.next_request += 1;
        let update = OutboundUpdate::new(UpdateRequest {
            subscription_id: self.subscription_id,
            request_id,
            instance_id: instance,
            base_version: prepared.base_version,
            scopes: prepared.scopes,
            pairs: prepared.pairs,
        });

        if self.pipeline.enqueue(update) {
            self.dispatch_next(instance, None).await?;
        } else {
            debug!(
                request_id = %request_id,
                instance = instance.0,
                "Update queued behind in-flight update"
            );
        }
        Ok(Some(request_id))
    }

    /// Flushes every dirty instance.
    pub async fn flush_all(&mut self) -> Result<Vec<RequestId>, SubscriptionError> {
        let handles: Vec<CatalogHandle> = self
            .instances
            .values()
            .filter(|t| self.batcher.is_dirty(&t.key))
            .map(|t| t.handle)
            .collect();
        let mut sent = Vec::with_capacity(handles.len());
        for handle in handles {
            if let Some(request_id) = self.flush(handle).await? {
                sent.push(request_id);
            }
        }
        Ok(sent)
    }

    /// Drives `poll` until the update resolves.
    pub async fn await_update(&mut self, request_id: RequestId) -> Result<DataVersion, SubscriptionError> {
        loop {
            if let Some(result) = self.completed.remove(&request_id) {
                return result;
            }
            if self.retained.iter().any(|u| u.request_id() == request_id) {
                return Err(self.machine.abort_cause().cloned().unwrap_or(
                    SubscriptionError::InvalidState {
                        operation: "await_update",
                        state: self.machine.state(),
                    },
                ));
            }
            if !self.pipeline.contains(request_id) {
                return Err(SubscriptionError::UnknownRequest(request_id));
            }
            if let Err(error) = self.poll().await {
                debug!(request_id = %request_id, error = %error, "Poll failed while awaiting update");
            }
        }
    }

    /// Sends the head of an instance's queue, optionally rebased first.
    async fn dispatch_next(
        &mut self,
        instance: InstanceId,
        rebase: Option<DataVersion>,
    ) -> Result<(), SubscriptionError> {
        let deadline = Instant::now() + self.config.exchange_timeout();
        let request = match self.pipeline.head_mut(instance) {
            Some(head) => {
                if let Some(version) = rebase {
                    head.request.base_version = version;
                }
                head.deadline = Some(deadline);
                head.request.clone()
            }
            None => return Ok(()),
        };
        wdm_telemetry::metric_inc!(wdm_telemetry::UPDATES_SENT);
        debug!(
            request_id = %request.request_id,
            instance = instance.0,
            base = request.base_version.0,
            pairs = request.pairs.len(),
            "Sending update"
        );
        self.send_with_retry(WdmMessage::UpdateRequest(request)).await
    }

    async fn on_update_response(&mut self, response: UpdateResponse) -> Result<(), SubscriptionError> {
        let Some(update) = self.pipeline.complete(response.request_id) else {
            debug!(request_id = %response.request_id, "Unknown or duplicate update response");
            return Ok(());
        };
        let instance = update.instance();

        match response.status {
            UpdateStatus::Success(version) => {
                if let Some(tracked) = self.instances.get_mut(&instance) {
                    tracked.advance(version);
                    self.batcher.rebase(&tracked.key, version);
                }
                self.completed.insert(response.request_id, Ok(version));
                debug!(
                    request_id = %response.request_id,
                    instance = instance.0,
                    version = version.0,
                    "Update committed"
                );
                self.emit(SubscriptionEvent::UpdateCommitted {
                    instance,
                    request_id: response.request_id,
                    version,
                });
                self.dispatch_next(instance, Some(version)).await
            }
            UpdateStatus::VersionConflict(current) => {
                self.report_conflict(instance, response.request_id, current);
                // Queued updates were built on top of the discarded one.
                for queued in self.pipeline.drain_instance(instance) {
                    self.report_conflict(instance, queued.request_id(), current);
                }
                self.reconcile(vec![instance]).await
            }
            UpdateStatus::SchemaError(reason) => {
                let error = SubscriptionError::UpdateRejected {
                    request_id: response.request_id,
                    reason,
                };
                warn!(
                    request_id = %response.request_id,
                    instance = instance.0,
                    error = %error,
                    "Update rejected by publisher"
                );
                self.completed.insert(response.request_id, Err(error.clone()));
                self.emit(SubscriptionEvent::Error(error));
                self.dispatch_next(instance, None).await
            }
        }
    }

    fn report_conflict(&mut self, instance: InstanceId, request_id: RequestId, current: DataVersion) {
        wdm_telemetry::metric_inc!(wdm_telemetry::UPDATE_CONFLICTS);
        wdm_telemetry::log_subscription_event!(
            warn,
            SUBSYSTEM,
            "Update discarded on version conflict",
            self.subscription_id,
            request_id = %request_id,
            instance = instance.0,
            current = current.0
        );
        self.completed.insert(
            request_id,
            Err(SubscriptionError::VersionConflict { instance, current }),
        );
        self.emit(SubscriptionEvent::Conflict {
            instance,
            request_id,
            current,
        });
    }

    // =========================================================================
    // ABORT AND RECOVERY
    // =========================================================================

    /// Sends on the subscription's exchange, retrying transport failures
    /// up to `max_exchange_retries` before aborting.
    async fn send_with_retry(&mut self, message: WdmMessage) -> Result<(), SubscriptionError> {
        let exchange = self.active_exchange("send")?;
        let mut failures = 0;
        loop {
            match self.transport.send(exchange, message.clone()).await {
                Ok(()) => return Ok(()),
                Err(error) => {
                    failures += 1;
                    if failures > self.config.max_exchange_retries {
                        return Err(self.escalate(error.into()));
                    }
                    wdm_telemetry::metric_inc!(wdm_telemetry::EXCHANGE_RETRIES);
                    warn!(
                        kind = message.kind(),
                        attempt = failures,
                        error = %error,
                        "Send failed, retrying"
                    );
                    sleep(self.config.backoff(failures)).await;
                }
            }
        }
    }

    /// Moves to `Aborting`, keeping dirty sets and unacknowledged updates.
    fn escalate(&mut self, error: SubscriptionError) -> SubscriptionError {
        let from = match self
            .machine
            .abort(error.clone(), self.config.backoff(1), Instant::now())
        {
            Ok(from) => from,
            Err(e) => {
                debug!(error = %e, "Not aborting");
                return error;
            }
        };
        self.retained.extend(self.pipeline.take_all());
        self.drop_exchange();
        self.inbound.clear();
        self.reconciling.clear();
        for tracked in self.instances.values_mut() {
            tracked.reconciling = false;
        }

        wdm_telemetry::metric_inc!(wdm_telemetry::SUBSCRIPTION_ABORTS, &[error.class().as_str()]);
        wdm_telemetry::log_subscription_event!(
            error,
            SUBSYSTEM,
            "Subscription aborting",
            self.subscription_id,
            from = %from,
            error = %error,
            retained = self.retained.len()
        );
        self.emit(SubscriptionEvent::StateChanged {
            from,
            to: SubscriptionState::Aborting,
            error: Some(error.clone()),
        });
        error
    }

    /// Re-establishes an aborted subscription.
    ///
    /// Waits until the scheduled retry time, resubscribes with every
    /// instance's last-seen version, takes the full state of whatever
    /// changed meanwhile and replays retained updates whose base version
    /// still matches. A failed attempt schedules the next one.
    pub async fn resubscribe(&mut self) -> Result<(), SubscriptionError> {
        self.require(SubscriptionState::Aborting, "resubscribe")?;
        if let Some(at) = self.machine.resubscribe_at() {
            sleep_until(at).await;
        }

        let ids: Vec<InstanceId> = self.instances.keys().copied().collect();
        let current = match self.request_subscription(&ids).await {
            Ok(current) => current,
            Err(error) => return Err(self.resubscribe_failed(error)),
        };
        if let Err(error) = self.consume_full_state(&ids, &current).await {
            return Err(self.resubscribe_failed(error));
        }

        let cause = self.machine.recover(Instant::now())?;
        self.emit(SubscriptionEvent::StateChanged {
            from: SubscriptionState::Aborting,
            to: SubscriptionState::Established,
            error: None,
        });
        wdm_telemetry::metric_inc!(wdm_telemetry::SUBSCRIPTIONS_ESTABLISHED);

        let heads = self.replay_retained();
        if let Some(from) = cause {
            wdm_telemetry::log_subscription_event!(
                info,
                SUBSYSTEM,
                "Subscription recovered",
                self.subscription_id,
                from = %from,
                replayed = self.pipeline.len()
            );
            self.emit(SubscriptionEvent::Recovered { from });
        }
        for instance in heads {
            self.dispatch_next(instance, None).await?;
        }
        Ok(())
    }

    fn resubscribe_failed(&mut self, error: SubscriptionError) -> SubscriptionError {
        self.drop_exchange();
        if !error.is_retryable() {
            return self.fail_subscribe(error);
        }
        let delay = self.config.backoff(self.machine.retry_count() + 2);
        self.machine.retry_failed(error.clone(), delay, Instant::now());
        wdm_telemetry::log_subscription_event!(
            warn,
            SUBSYSTEM,
            "Resubscribe failed",
            self.subscription_id,
            retry_count = self.machine.retry_count(),
            delay_ms = delay.as_millis() as u64,
            error = %error
        );
        error
    }

    /// Re-queues retained updates. Per instance, the oldest must still
    /// match last-seen; otherwise it and everything after it conflict.
    fn replay_retained(&mut self) -> Vec<InstanceId> {
        let mut heads = Vec::new();
        let mut conflicted = BTreeSet::new();
        for mut update in std::mem::take(&mut self.retained) {
            let instance = update.instance();
            let Some(last_seen) = self.instances.get(&instance).map(|t| t.last_seen) else {
                self.completed
                    .insert(update.request_id(), Err(SubscriptionError::Canceled));
                continue;
            };
            let first = self.pipeline.head(instance).is_none();
            if conflicted.contains(&instance)
                || (first && Some(update.request.base_version) != last_seen)
            {
                conflicted.insert(instance);
                self.report_conflict(instance, update.request_id(), last_seen.unwrap_or_default());
                continue;
            }
            update.retries = 0;
            update.deadline = None;
            if self.pipeline.enqueue(update) {
                heads.push(instance);
            }
        }
        heads
    }

    // =========================================================================
    // CANCEL
    // =========================================================================

    /// Ends the subscription.
    ///
    /// Waits for in-flight updates (bounded by the exchange timeout,
    /// results discarded), tells the publisher and closes the exchange.
    pub async fn cancel(&mut self) -> Result<(), SubscriptionError> {
        self.cancel_rx.borrow_and_update();
        let state = self.machine.state();
        match state {
            SubscriptionState::Idle | SubscriptionState::Canceling => {
                return Err(SubscriptionError::InvalidState {
                    operation: "cancel",
                    state,
                })
            }
            SubscriptionState::Aborting => {
                self.set_state(SubscriptionState::Canceling, None)?;
            }
            _ => {
                self.set_state(SubscriptionState::Canceling, None)?;
                self.drain_in_flight().await;
                self.send_cancel().await;
            }
        }

        for update in self.pipeline.take_all().into_iter().chain(self.retained.drain(..)) {
            self.completed
                .insert(update.request_id(), Err(SubscriptionError::Canceled));
        }
        self.drop_exchange();
        self.reset();
        self.set_state(SubscriptionState::Idle, None)?;
        wdm_telemetry::log_subscription_event!(
            info,
            SUBSYSTEM,
            "Subscription canceled",
            self.subscription_id
        );
        Ok(())
    }

    async fn drain_in_flight(&mut self) {
        let Some(exchange) = self.exchange else {
            return;
        };
        let deadline = Instant::now() + self.config.exchange_timeout();
        let mut buffered = std::mem::take(&mut self.inbound);
        while self.pipeline.in_flight().next().is_some() {
            let message = match buffered.pop_front() {
                Some(message) => message,
                None => match timeout_at(deadline, self.transport.on_message(exchange)).await {
                    Ok(Ok(message)) => message,
                    Ok(Err(error)) => {
                        debug!(error = %error, "Exchange ended while draining");
                        return;
                    }
                    Err(_) => {
                        debug!(in_flight = self.pipeline.in_flight().count(), "Drain timed out");
                        return;
                    }
                },
            };
            if let WdmMessage::UpdateResponse(response) = message {
                if let Some(update) = self.pipeline.complete(response.request_id) {
                    self.completed
                        .insert(update.request_id(), Err(SubscriptionError::Canceled));
                }
            }
        }
    }

    async fn send_cancel(&mut self) {
        let Some(exchange) = self.exchange else {
            return;
        };
        let cancel = Cancel {
            subscription_id: self.subscription_id,
            instance_ids: self.instances.keys().copied().collect(),
        };
        if let Err(error) = self.transport.send(exchange, WdmMessage::Cancel(cancel)).await {
            warn!(exchange = %exchange, error = %error, "Cancel not delivered");
        }
    }

    // =========================================================================
    // HELPERS
    // =========================================================================

    fn set_state(
        &mut self,
        next: SubscriptionState,
        error: Option<SubscriptionError>,
    ) -> Result<(), SubscriptionError> {
        let from = self.machine.transition(next)?;
        debug!(
            subscription_id = %self.subscription_id,
            from = %from,
            to = %next,
            "Subscription state changed"
        );
        self.emit(SubscriptionEvent::StateChanged {
            from,
            to: next,
            error,
        });
        Ok(())
    }

    fn emit(&self, event: SubscriptionEvent) {
        // Err only means nobody is listening.
        let _ = self.events.send(event);
    }

    fn require(&self, state: SubscriptionState, operation: &'static str) -> Result<(), SubscriptionError> {
        if self.machine.state() != state {
            return Err(SubscriptionError::InvalidState {
                operation,
                state: self.machine.state(),
            });
        }
        Ok(())
    }

    fn require_subscribed(&self, operation: &'static str) -> Result<(), SubscriptionError> {
        match self.machine.state() {
            SubscriptionState::Established
            | SubscriptionState::Notifying
            | SubscriptionState::Aborting => Ok(()),
            state => Err(SubscriptionError::InvalidState { operation, state }),
        }
    }

    /// Resolves a handle to a subscribed instance. A handle whose catalog
    /// slot was released fails with `StaleHandle` even if the slot is reused.
    fn instance_for(&self, handle: CatalogHandle) -> Result<InstanceId, SubscriptionError> {
        self.catalog.get(handle)?;
        self.instances
            .iter()
            .find(|(_, t)| t.handle == handle)
            .map(|(id, _)| *id)
            .ok_or(SubscriptionError::NotSubscribed(handle))
    }

    fn schema(&self) -> Result<Arc<TraitSchema>, SubscriptionError> {
        self.schema.clone().ok_or(SubscriptionError::InvalidState {
            operation: "resolve schema",
            state: self.machine.state(),
        })
    }

    async fn ensure_exchange(&mut self) -> Result<ExchangeHandle, SubscriptionError> {
        if let Some(exchange) = self.exchange {
            return Ok(exchange);
        }
        let peer = self.peer.ok_or(SubscriptionError::InvalidState {
            operation: "open exchange",
            state: self.machine.state(),
        })?;
        let exchange = self.transport.open_exchange(peer).await?;
        self.exchange = Some(exchange);
        Ok(exchange)
    }

    fn active_exchange(&self, operation: &'static str) -> Result<ExchangeHandle, SubscriptionError> {
        self.exchange.ok_or(SubscriptionError::InvalidState {
            operation,
            state: self.machine.state(),
        })
    }

    fn drop_exchange(&mut self) {
        if let Some(exchange) = self.exchange.take() {
            self.transport.close(exchange);
        }
    }

    fn reset(&mut self) {
        self.peer = None;
        self.target = None;
        self.schema = None;
        self.instances.clear();
        self.batcher = UpdateBatcher::new(self.config.batching.clone());
        self.pipeline = UpdatePipeline::new();
        self.retained.clear();
        self.inbound.clear();
        self.reconciling.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::LoopbackNetwork;
    use crate::application::PublisherService;
    use crate::ports::MessageHandler;
    use shared_types::{PropertyHandle, PropertyValue, TraitInstanceKey};
    use std::time::Duration;
    use wdm_01_property_schema::fixtures::thermostat::{self, *};
    use wdm_01_property_schema::{ChangeSet, PathValue};
    use wdm_03_trait_catalog::{
        CatalogConfig, CatalogError, MemoryTraitData, TraitBinding, TraitSink, TraitSource,
    };

    const PUBLISHER: PeerId = PeerId(1);

    fn key(instance: u64) -> TraitInstanceKey {
        TraitInstanceKey::new(thermostat::PROFILE.0, 1, instance)
    }

    fn top(h: PropertyHandle) -> PropertyPath {
        PropertyPath::root().child(h)
    }

    struct Harness {
        network: Arc<LoopbackNetwork>,
        publisher: Arc<PublisherService>,
        publisher_catalog: Arc<TraitCatalog>,
        source: Arc<MemoryTraitData>,
        source_handle: CatalogHandle,
        catalog: Arc<TraitCatalog>,
        sink: Arc<MemoryTraitData>,
        handle: CatalogHandle,
    }

    impl Harness {
        fn new(version: u64) -> Self {
            Self::with_schema(version, thermostat::schema())
        }

        fn with_schema(version: u64, publisher_schema: TraitSchema) -> Self {
            let network = Arc::new(LoopbackNetwork::new());
            let publisher_catalog = Arc::new(TraitCatalog::new(CatalogConfig::for_testing()));
            let source = Arc::new(MemoryTraitData::with_values(
                DataVersion(version),
                vec![
                    PathValue::new(top(MODE), 1u64),
                    PathValue::new(top(CURRENT_TEMPERATURE), 20.5),
                ],
            ));
            let source_handle = publisher_catalog
                .register_instance(key(1), Arc::new(publisher_schema), TraitBinding::source(&source))
                .unwrap();
            let publisher = Arc::new(PublisherService::new(
                SubscriptionConfig::for_testing(),
                Arc::clone(&publisher_catalog),
                network.clone(),
                PathCodec::new(BincodeCodec::default()),
            ));
            network.register_handler(PUBLISHER, &publisher);

            let catalog = Arc::new(TraitCatalog::new(CatalogConfig::for_testing()));
            let sink = Arc::new(MemoryTraitData::new());
            let handle = catalog
                .register_instance(key(1), Arc::new(thermostat::schema()), TraitBinding::sink(&sink))
                .unwrap();
            Self {
                network,
                publisher,
                publisher_catalog,
                source,
                source_handle,
                catalog,
                sink,
                handle,
            }
        }

        fn client(&self) -> SubscriptionClient {
            self.client_with(SubscriptionConfig::for_testing())
        }

        fn client_with(&self, config: SubscriptionConfig) -> SubscriptionClient {
            SubscriptionClient::new(
                config,
                Arc::clone(&self.catalog),
                self.network.clone(),
                PathCodec::new(BincodeCodec::default()),
            )
        }

        async fn established(&self) -> SubscriptionClient {
            let mut client = self.client();
            client.subscribe(PUBLISHER, &[self.handle]).await.unwrap();
            client
        }
    }

    fn drain(rx: &mut broadcast::Receiver<SubscriptionEvent>) -> Vec<SubscriptionEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn full_notify(client: &SubscriptionClient, version: u64, mode: u64) -> Notify {
        let (scopes, pairs) = PathCodec::new(BincodeCodec::default())
            .encode_change_set(
                &thermostat::schema(),
                &ChangeSet::full_state(vec![PathValue::new(top(MODE), mode)]),
            )
            .unwrap();
        Notify {
            subscription_id: client.subscription_id(),
            instance_id: InstanceId(1),
            base_version: None,
            version: DataVersion(version),
            full_state: true,
            scopes,
            pairs,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscribe_applies_full_state() {
        let h = Harness::new(3);
        let client = h.established().await;

        assert_eq!(client.state(), SubscriptionState::Established);
        assert_eq!(client.last_seen(h.handle), Some(DataVersion(3)));
        assert_eq!(h.sink.get(&top(MODE)), Some(PropertyValue::from(1u64)));
        assert_eq!(h.sink.applied_version(), Some(DataVersion(3)));
        assert!(matches!(client.status(), Some(SyncStatus::Synchronized { .. })));
        assert_eq!(h.publisher.subscription_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_up_to_date_subscriber_gets_no_full_state() {
        let h = Harness::new(5);
        h.sink
            .apply_notify(
                DataVersion(5),
                &ChangeSet::full_state(vec![PathValue::new(top(MODE), 1u64)]),
            )
            .unwrap();
        let mut client = h.client();
        let mut events = client.events();

        client.subscribe(PUBLISHER, &[h.handle]).await.unwrap();

        assert_eq!(client.last_seen(h.handle), Some(DataVersion(5)));
        assert!(!drain(&mut events)
            .iter()
            .any(|e| matches!(e, SubscriptionEvent::NotifyApplied { .. })));
        // Nothing but the temperature the subscriber never held.
        assert_eq!(h.sink.get(&top(CURRENT_TEMPERATURE)), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_instance_rejected() {
        let h = Harness::new(1);
        let other = Arc::new(MemoryTraitData::new());
        let handle = h
            .catalog
            .register_instance(key(2), Arc::new(thermostat::schema()), TraitBinding::sink(&other))
            .unwrap();
        let mut client = h.client();

        let err = client.subscribe(PUBLISHER, &[handle]).await.unwrap_err();
        assert_eq!(
            err,
            SubscriptionError::SubscriptionRejected(RejectReason::UnknownInstance(InstanceId(2)))
        );
        assert_eq!(client.state(), SubscriptionState::Idle);
        assert_eq!(h.network.open_exchanges(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_incompatible_version_is_schema_error() {
        let h = Harness::with_schema(1, thermostat::schema_v1_only());
        let mut client = h.client();

        let err = client.subscribe(PUBLISHER, &[h.handle]).await.unwrap_err();
        assert!(matches!(err, SubscriptionError::Schema(_)));
        assert_eq!(err.class(), crate::domain::ErrorClass::Schema);
        assert_eq!(client.state(), SubscriptionState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_peer_times_out() {
        let h = Harness::new(1);
        let mut client = h.client();

        let err = client.subscribe(PeerId(9), &[h.handle]).await.unwrap_err();
        assert_eq!(err, SubscriptionError::SubscriptionTimeout);
        assert_eq!(client.state(), SubscriptionState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreachable_peer_fails_after_attempts() {
        let h = Harness::new(1);
        h.network.partition(PUBLISHER);
        let mut client = h.client();

        let err = client.subscribe(PUBLISHER, &[h.handle]).await.unwrap_err();
        assert!(matches!(
            err,
            SubscriptionError::SubscriptionFailed { attempts: 3, .. }
        ));
        assert_eq!(client.state(), SubscriptionState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_send_failure_retried() {
        let h = Harness::new(2);
        h.network.fail_next_sends(1);
        let client = h.established().await;
        assert_eq!(client.last_seen(h.handle), Some(DataVersion(2)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscribe_argument_checks() {
        let h = Harness::new(1);
        let mut client = h.client();
        assert_eq!(
            client.subscribe(PUBLISHER, &[]).await,
            Err(SubscriptionError::EmptySubscription)
        );

        let elsewhere = Arc::new(MemoryTraitData::new());
        let other = h
            .catalog
            .register_instance(
                TraitInstanceKey::new(thermostat::PROFILE.0, 2, 1),
                Arc::new(thermostat::schema()),
                TraitBinding::sink(&elsewhere),
            )
            .unwrap();
        assert_eq!(
            client.subscribe(PUBLISHER, &[h.handle, other]).await,
            Err(SubscriptionError::MixedTargets)
        );
        assert_eq!(client.state(), SubscriptionState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_operations_require_subscription() {
        let h = Harness::new(1);
        let mut client = h.client();
        assert!(matches!(
            client.mark_dirty(h.handle, top(MODE)),
            Err(SubscriptionError::InvalidState { .. })
        ));
        assert!(matches!(client.cancel().await, Err(SubscriptionError::InvalidState { .. })));
        assert!(matches!(client.poll().await, Err(SubscriptionError::InvalidState { .. })));

        client.subscribe(PUBLISHER, &[h.handle]).await.unwrap();
        assert!(matches!(
            client.subscribe(PUBLISHER, &[h.handle]).await,
            Err(SubscriptionError::InvalidState { .. })
        ));
        assert!(matches!(
            client.resubscribe().await,
            Err(SubscriptionError::InvalidState { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_update_round_trip() {
        let h = Harness::new(3);
        let mut client = h.established().await;
        let mut events = client.events();

        h.sink.set(top(MODE), 2u64);
        client.mark_dirty(h.handle, top(MODE)).unwrap();
        assert!(client.is_dirty(h.handle));
        let request_id = client.flush(h.handle).await.unwrap().unwrap();
        assert!(!client.is_dirty(h.handle));

        assert_eq!(client.await_update(request_id).await, Ok(DataVersion(4)));
        assert_eq!(h.source.get(&top(MODE)), Some(PropertyValue::from(2u64)));
        assert_eq!(client.last_seen(h.handle), Some(DataVersion(4)));
        assert!(drain(&mut events).contains(&SubscriptionEvent::UpdateCommitted {
            instance: InstanceId(1),
            request_id,
            version: DataVersion(4),
        }));
        assert_eq!(client.flush(h.handle).await, Ok(None));
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_update_waits_then_rebases() {
        let h = Harness::new(3);
        let mut client = h.established().await;
        h.network.drop_next_replies(1);

        h.sink.set(top(MODE), 2u64);
        client.mark_dirty(h.handle, top(MODE)).unwrap();
        let first = client.flush(h.handle).await.unwrap().unwrap();

        h.sink.set(top(CURRENT_TEMPERATURE), 22.0);
        client.mark_dirty(h.handle, top(CURRENT_TEMPERATURE)).unwrap();
        let second = client.flush(h.handle).await.unwrap().unwrap();
        assert_eq!(client.pending_updates(), 2);

        // The first reply is lost; the resend is answered from the
        // publisher's cache and the second update follows on the new base.
        assert_eq!(client.await_update(first).await, Ok(DataVersion(4)));
        assert_eq!(client.await_update(second).await, Ok(DataVersion(5)));
        assert_eq!(h.source.version(), DataVersion(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_conflict_reconciles_instead_of_resending() {
        let h = Harness::new(5);
        let mut client = h.established().await;
        let mut events = client.events();

        // Publisher moves on without telling this subscriber.
        h.source.commit(vec![PathValue::new(top(MODE), 7u64)]);
        h.sink.set(top(MODE), 2u64);
        client.mark_dirty(h.handle, top(MODE)).unwrap();
        let request_id = client.flush(h.handle).await.unwrap().unwrap();

        assert_eq!(
            client.await_update(request_id).await,
            Err(SubscriptionError::VersionConflict {
                instance: InstanceId(1),
                current: DataVersion(6),
            })
        );
        client.poll().await.unwrap();
        client.poll().await.unwrap();

        assert_eq!(client.last_seen(h.handle), Some(DataVersion(6)));
        assert_eq!(h.sink.get(&top(MODE)), Some(PropertyValue::from(7u64)));
        assert_eq!(h.source.version(), DataVersion(6));
        let events = drain(&mut events);
        assert!(events.contains(&SubscriptionEvent::ReconciliationStarted {
            instances: vec![InstanceId(1)],
        }));
        assert!(events.iter().any(|e| matches!(e, SubscriptionEvent::Conflict { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_failures_abort_and_retain_update() {
        let h = Harness::new(3);
        let mut client = h.established().await;

        h.network.fail_next_sends(3);
        h.sink.set(top(MODE), 2u64);
        client.mark_dirty(h.handle, top(MODE)).unwrap();
        let err = client.flush(h.handle).await.unwrap_err();

        assert!(matches!(err, SubscriptionError::Transport(TransportError::SendFailed(_))));
        assert_eq!(client.state(), SubscriptionState::Aborting);
        assert_eq!(client.retained_updates(), 1);
        assert!(matches!(
            client.status(),
            Some(SyncStatus::Reconnecting {
                retry_count: 0,
                last_error: Some(_)
            })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_resubscribe_replays_retained_update() {
        let h = Harness::new(3);
        let mut client = h.established().await;
        let mut events = client.events();

        h.network.fail_next_sends(3);
        h.sink.set(top(MODE), 2u64);
        client.mark_dirty(h.handle, top(MODE)).unwrap();
        let cause = client.flush(h.handle).await.unwrap_err();

        client.resubscribe().await.unwrap();
        assert_eq!(client.state(), SubscriptionState::Established);
        assert_eq!(client.retained_updates(), 0);
        client.poll().await.unwrap();

        assert_eq!(h.source.get(&top(MODE)), Some(PropertyValue::from(2u64)));
        assert_eq!(client.last_seen(h.handle), Some(DataVersion(4)));
        let events = drain(&mut events);
        assert!(events.contains(&SubscriptionEvent::Recovered { from: cause }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_resubscribe_reports_stale_retained_update() {
        let h = Harness::new(3);
        let mut client = h.established().await;
        let mut events = client.events();

        h.network.fail_next_sends(3);
        h.sink.set(top(MODE), 2u64);
        client.mark_dirty(h.handle, top(MODE)).unwrap();
        client.flush(h.handle).await.unwrap_err();
        h.source.commit(vec![PathValue::new(top(MODE), 9u64)]);

        client.resubscribe().await.unwrap();

        assert_eq!(client.last_seen(h.handle), Some(DataVersion(4)));
        assert_eq!(h.sink.get(&top(MODE)), Some(PropertyValue::from(9u64)));
        assert_eq!(client.pending_updates(), 0);
        assert!(drain(&mut events).iter().any(|e| matches!(
            e,
            SubscriptionEvent::Conflict {
                current: DataVersion(4),
                ..
            }
        )));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_resubscribe_counts_retries() {
        let h = Harness::new(3);
        let mut client = h.established().await;
        h.network.fail_next_sends(3);
        h.sink.set(top(MODE), 2u64);
        client.mark_dirty(h.handle, top(MODE)).unwrap();
        client.flush(h.handle).await.unwrap_err();

        h.network.partition(PUBLISHER);
        assert!(client.resubscribe().await.is_err());
        assert!(client.resubscribe().await.is_err());
        assert!(matches!(
            client.status(),
            Some(SyncStatus::Reconnecting { retry_count: 2, .. })
        ));

        h.network.heal(PUBLISHER);
        client.resubscribe().await.unwrap();
        assert_eq!(client.state(), SubscriptionState::Established);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lost_replies_exhaust_exchange_retries() {
        let h = Harness::new(3);
        let mut client = h.established().await;
        h.network.drop_next_replies(3);

        h.sink.set(top(MODE), 2u64);
        client.mark_dirty(h.handle, top(MODE)).unwrap();
        let request_id = client.flush(h.handle).await.unwrap().unwrap();

        assert_eq!(
            client.await_update(request_id).await,
            Err(SubscriptionError::ExchangeTimeout(request_id))
        );
        assert_eq!(client.state(), SubscriptionState::Aborting);
        // Applied once despite three deliveries.
        assert_eq!(h.source.version(), DataVersion(4));
    }

    #[tokio::test(start_paused = true)]
    async fn test_liveness_timeout_aborts() {
        let h = Harness::new(1);
        let mut client = h.client_with(SubscriptionConfig {
            liveness_timeout_ms: Some(200),
            ..SubscriptionConfig::for_testing()
        });
        client.subscribe(PUBLISHER, &[h.handle]).await.unwrap();

        assert_eq!(client.poll().await, Err(SubscriptionError::LivenessTimeout));
        assert_eq!(client.state(), SubscriptionState::Aborting);

        client.resubscribe().await.unwrap();
        assert_eq!(client.state(), SubscriptionState::Established);
    }

    #[tokio::test(start_paused = true)]
    async fn test_replayed_full_state_is_ignored() {
        let h = Harness::new(3);
        let mut client = h.established().await;
        let mut events = client.events();

        let replay = full_notify(&client, 3, 8);
        client.dispatch(WdmMessage::Notify(replay)).await.unwrap();

        assert_eq!(h.sink.get(&top(MODE)), Some(PropertyValue::from(1u64)));
        assert!(drain(&mut events).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_newer_full_state_replaces_view() {
        let h = Harness::new(3);
        let mut client = h.established().await;

        let notify = full_notify(&client, 9, 8);
        client.dispatch(WdmMessage::Notify(notify)).await.unwrap();

        assert_eq!(client.last_seen(h.handle), Some(DataVersion(9)));
        assert_eq!(h.sink.get(&top(MODE)), Some(PropertyValue::from(8u64)));
        assert_eq!(h.sink.get(&top(CURRENT_TEMPERATURE)), None);
        assert_eq!(client.state(), SubscriptionState::Established);
    }

    #[tokio::test(start_paused = true)]
    async fn test_diff_on_unknown_base_reconciles() {
        let h = Harness::new(3);
        let mut client = h.established().await;
        let mut events = client.events();

        let mut diff = full_notify(&client, 9, 8);
        diff.full_state = false;
        diff.base_version = Some(DataVersion(7));
        client.dispatch(WdmMessage::Notify(diff)).await.unwrap();

        assert_eq!(h.sink.get(&top(MODE)), Some(PropertyValue::from(1u64)));
        assert!(drain(&mut events).contains(&SubscriptionEvent::ReconciliationStarted {
            instances: vec![InstanceId(1)],
        }));
        // Publisher is still at 3: the response alone settles it.
        client.poll().await.unwrap();
        assert_eq!(client.last_seen(h.handle), Some(DataVersion(3)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_notify_surfaces_error_and_stays_established() {
        let h = Harness::new(3);
        let mut client = h.established().await;

        let mut notify = full_notify(&client, 4, 8);
        notify.pairs[0].value = vec![0xff, 0xff, 0xff];
        let err = client.dispatch(WdmMessage::Notify(notify)).await.unwrap_err();

        assert_ne!(err.class(), crate::domain::ErrorClass::Transport);
        assert_eq!(client.state(), SubscriptionState::Established);
        assert_eq!(client.last_seen(h.handle), Some(DataVersion(3)));
        assert_eq!(h.sink.get(&top(MODE)), Some(PropertyValue::from(1u64)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_returns_to_idle() {
        let h = Harness::new(1);
        let mut client = h.established().await;

        client.cancel().await.unwrap();

        assert_eq!(client.state(), SubscriptionState::Idle);
        assert_eq!(client.status(), None);
        assert_eq!(h.publisher.subscription_count(), 0);
        assert_eq!(h.network.open_exchanges(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_handle_stops_poll() {
        let h = Harness::new(1);
        let mut client = h.established().await;
        let cancel = client.cancel_handle();

        cancel.cancel();
        assert!(cancel.is_requested());
        client.poll().await.unwrap();

        assert_eq!(client.state(), SubscriptionState::Idle);
        assert_eq!(h.publisher.subscription_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_from_aborting() {
        let h = Harness::new(1);
        let mut client = h.client_with(SubscriptionConfig {
            liveness_timeout_ms: Some(50),
            ..SubscriptionConfig::for_testing()
        });
        client.subscribe(PUBLISHER, &[h.handle]).await.unwrap();
        client.poll().await.unwrap_err();

        client.cancel().await.unwrap();
        assert_eq!(client.state(), SubscriptionState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_handle_after_unregister() {
        let h = Harness::new(1);
        let mut client = h.established().await;

        h.catalog.unregister(h.handle).unwrap();
        let replacement = Arc::new(MemoryTraitData::new());
        h.catalog
            .register_instance(key(5), Arc::new(thermostat::schema()), TraitBinding::sink(&replacement))
            .unwrap();

        assert_eq!(
            client.mark_dirty(h.handle, top(MODE)),
            Err(SubscriptionError::Catalog(CatalogError::StaleHandle(h.handle)))
        );
        assert!(matches!(
            client.flush(h.handle).await,
            Err(SubscriptionError::Catalog(CatalogError::StaleHandle(_)))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_publisher_purge_removes_instance() {
        let h = Harness::new(1);
        let mut client = h.established().await;
        let mut events = client.events();

        h.publisher_catalog.unregister(h.source_handle).unwrap();
        assert_eq!(h.publisher.purge_stale_instances().await, 1);
        client.poll().await.unwrap();

        assert_eq!(client.state(), SubscriptionState::Idle);
        assert!(drain(&mut events).contains(&SubscriptionEvent::InstanceRemoved(InstanceId(1))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_delays_resubscribe() {
        let h = Harness::new(1);
        let mut client = h.client_with(SubscriptionConfig {
            liveness_timeout_ms: Some(50),
            ..SubscriptionConfig::for_testing()
        });
        client.subscribe(PUBLISHER, &[h.handle]).await.unwrap();
        client.poll().await.unwrap_err();

        let start = Instant::now();
        client.resubscribe().await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(10));
    }

    /// Answers like the publisher, after a fixed delay.
    struct SlowPublisher {
        inner: Arc<PublisherService>,
        delay: Duration,
    }

    #[async_trait::async_trait]
    impl MessageHandler for SlowPublisher {
        async fn handle_message(&self, exchange: ExchangeHandle, message: WdmMessage) -> Vec<WdmMessage> {
            sleep(self.delay).await;
            self.inner.handle_message(exchange, message).await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_while_subscribing_withdraws_accepted_subscription() {
        let h = Harness::new(3);
        let slow = Arc::new(SlowPublisher {
            inner: Arc::clone(&h.publisher),
            delay: Duration::from_millis(20),
        });
        h.network.register_handler(PUBLISHER, &slow);
        let mut client = h.client();
        let cancel = client.cancel_handle();
        let canceller = tokio::spawn(async move {
            sleep(Duration::from_millis(5)).await;
            cancel.cancel();
        });

        let err = client.subscribe(PUBLISHER, &[h.handle]).await.unwrap_err();
        canceller.await.unwrap();

        assert_eq!(err, SubscriptionError::Canceled);
        assert_eq!(client.state(), SubscriptionState::Idle);
        assert_eq!(h.publisher.subscription_count(), 0);
        assert_eq!(h.sink.applied_version(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_drains_in_flight_update_and_discards_result() {
        let h = Harness::new(3);
        let mut client = h.established().await;
        h.sink.set(top(MODE), 2u64);
        client.mark_dirty(h.handle, top(MODE)).unwrap();
        let request_id = client.flush(h.handle).await.unwrap().unwrap();
        assert_eq!(client.pending_updates(), 1);

        client.cancel().await.unwrap();

        assert_eq!(client.await_update(request_id).await, Err(SubscriptionError::Canceled));
        // Committed on the publisher; only the result is dropped.
        assert_eq!(h.source.version(), DataVersion(4));
        assert_eq!(client.last_seen(h.handle), None);
        assert_eq!(h.publisher.subscription_count(), 0);
        assert_eq!(client.state(), SubscriptionState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_waits_one_exchange_timeout_for_lost_reply() {
        let h = Harness::new(3);
        let mut client = h.established().await;
        h.network.drop_next_replies(1);
        h.sink.set(top(MODE), 2u64);
        client.mark_dirty(h.handle, top(MODE)).unwrap();
        let request_id = client.flush(h.handle).await.unwrap().unwrap();

        let start = Instant::now();
        client.cancel().await.unwrap();

        assert!(start.elapsed() >= Duration::from_millis(100));
        assert_eq!(client.await_update(request_id).await, Err(SubscriptionError::Canceled));
        assert_eq!(client.state(), SubscriptionState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_resubscribe_fails_retained_updates() {
        let h = Harness::new(3);
        let mut client = h.established().await;
        h.network.fail_next_sends(3);
        h.sink.set(top(MODE), 2u64);
        client.mark_dirty(h.handle, top(MODE)).unwrap();
        client.flush(h.handle).await.unwrap_err();
        assert_eq!(client.retained_updates(), 1);

        h.publisher_catalog.unregister(h.source_handle).unwrap();
        let err = client.resubscribe().await.unwrap_err();

        let rejected = SubscriptionError::SubscriptionRejected(RejectReason::UnknownInstance(InstanceId(1)));
        assert_eq!(err, rejected);
        assert_eq!(client.state(), SubscriptionState::Idle);
        assert_eq!(client.await_update(RequestId(1)).await, Err(rejected));
    }
}

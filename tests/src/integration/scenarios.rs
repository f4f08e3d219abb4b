//! # Protocol Scenarios
//!
//! End-to-end checks of the five reference behaviours, each driven both on
//! the raw wire (a hand-built exchange against the publisher) and, where
//! the subscriber side has its own obligations, through a
//! `SubscriptionClient`.
//!
//! | Scenario | Behaviour |
//! |----------|-----------|
//! | A | ancestor mark absorbs a dirty leaf; one scope, each leaf once |
//! | B | subscriber already current: accepted, no full state |
//! | C | stale base version: `VersionConflict`, reconciliation, no resend |
//! | D | repeated send failure while established: `Aborting`, not `Idle` |
//! | E | handle used after unregister: `StaleHandle` |

#[cfg(test)]
mod tests {
    use crate::fixtures::{key, top, Fabric, PUBLISHER, RESOURCE};
    use shared_types::{
        DataVersion, InstanceId, ProfileId, PropertyHandle, PropertyValue, RequestId, ResourceId,
        SchemaVersion, SubscribeRequest, SubscribeResponse, SubscribeStatus, SubscriptionId,
        TypeTag, UpdateRequest, UpdateResponse, UpdateStatus, WdmMessage,
    };
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::broadcast;
    use tokio::time::timeout;
    use wdm_01_property_schema::fixtures::thermostat::{self, *};
    use wdm_01_property_schema::{ChangeSet, PathValue, PropertyPath, TraitSchema};
    use wdm_02_path_codec::{BincodeCodec, PathCodec};
    use wdm_03_trait_catalog::{CatalogError, MemoryTraitData, TraitBinding, TraitSink, TraitSource};
    use wdm_04_update_batching::{BatchingConfig, FlushOutcome, MarkOutcome, UpdateBatcher};
    use wdm_05_subscription::{
        LoopbackNetwork, SubscriptionError, SubscriptionEvent, SubscriptionState, SyncStatus,
        Transport, TransportError,
    };

    // =============================================================================
    // TEST FIXTURES
    // =============================================================================

    const SUBSCRIPTION: SubscriptionId = SubscriptionId(0x5EED);

    fn codec() -> PathCodec<BincodeCodec> {
        PathCodec::new(BincodeCodec::default())
    }

    fn drain(rx: &mut broadcast::Receiver<SubscriptionEvent>) -> Vec<SubscriptionEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    /// Opens an exchange and subscribes to instance 1 by hand.
    async fn wire_subscribe(
        network: &Arc<LoopbackNetwork>,
        last_seen: Option<DataVersion>,
    ) -> (shared_types::ExchangeHandle, SubscribeResponse) {
        let exchange = network.open_exchange(PUBLISHER).await.unwrap();
        network
            .send(
                exchange,
                WdmMessage::SubscribeRequest(SubscribeRequest {
                    subscription_id: SUBSCRIPTION,
                    profile_id: thermostat::PROFILE,
                    resource_id: ResourceId(RESOURCE),
                    instance_ids: vec![InstanceId(1)],
                    requested_version: SchemaVersion(2),
                    last_seen: vec![last_seen],
                }),
            )
            .await
            .unwrap();
        match network.on_message(exchange).await.unwrap() {
            WdmMessage::SubscribeResponse(response) => (exchange, response),
            other => panic!("expected a subscribe response, got {:?}", other),
        }
    }

    // =============================================================================
    // SCENARIO A: ANCESTOR MARK ABSORBS DIRTY LEAF
    // =============================================================================

    fn two_leaf_schema() -> (TraitSchema, PropertyHandle, PropertyHandle) {
        let mut builder = TraitSchema::builder(ProfileId(0xA0));
        let leaf_a = builder.leaf(PropertyHandle::ROOT, 1, TypeTag::UInt);
        let leaf_b = builder.leaf(PropertyHandle::ROOT, 2, TypeTag::UInt);
        (builder.build().unwrap(), leaf_a, leaf_b)
    }

    #[test]
    fn test_scenario_a_root_mark_flushes_each_leaf_once() {
        let (schema, leaf_a, leaf_b) = two_leaf_schema();
        let key = shared_types::TraitInstanceKey::new(0xA0, 1, 1);
        let data = MemoryTraitData::with_values(
            DataVersion(1),
            vec![
                PathValue::new(top(leaf_a), 10u64),
                PathValue::new(top(leaf_b), 20u64),
            ],
        );
        let mut batcher = UpdateBatcher::new(BatchingConfig::default());

        assert_eq!(
            batcher.mark_dirty(key, &schema, top(leaf_a), DataVersion(1)),
            Ok(MarkOutcome::Added)
        );
        batcher
            .mark_dirty(key, &schema, PropertyPath::root(), DataVersion(1))
            .unwrap();

        let prepared = match batcher
            .flush(key, &schema, schema.max_version(), &data, &codec())
            .unwrap()
        {
            FlushOutcome::Prepared(prepared) => prepared,
            FlushOutcome::NoOp => panic!("root was marked dirty"),
        };
        assert_eq!(prepared.changes.scopes, vec![PropertyPath::root()]);
        assert_eq!(prepared.scopes.len(), 1);
        assert_eq!(prepared.pairs.len(), 2);

        let decoded = codec().decode_change_set(&schema, &prepared.scopes, &prepared.pairs).unwrap();
        let mut paths: Vec<_> = decoded.values.iter().map(|v| v.path.clone()).collect();
        paths.sort();
        assert_eq!(paths, vec![top(leaf_a), top(leaf_b)]);
    }

    // =============================================================================
    // SCENARIO B: CURRENT SUBSCRIBER GETS NO FULL STATE
    // =============================================================================

    #[tokio::test(start_paused = true)]
    async fn test_scenario_b_wire_accepts_without_full_state() {
        let fabric = Fabric::new(&[(1, 5)]);

        let (exchange, response) = wire_subscribe(&fabric.network, Some(DataVersion(5))).await;
        assert_eq!(response.status, SubscribeStatus::Accepted);
        assert_eq!(response.current_versions, vec![DataVersion(5)]);

        // Nothing else is owed to this subscriber.
        let next = timeout(Duration::from_millis(500), fabric.network.on_message(exchange)).await;
        assert!(next.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_scenario_b_client_applies_nothing() {
        let fabric = Fabric::new(&[(1, 5)]);
        let mut node = fabric.subscriber(&[1]);
        node.sinks[0]
            .apply_notify(
                DataVersion(5),
                &ChangeSet::full_state(vec![PathValue::new(top(MODE), 1u64)]),
            )
            .unwrap();
        let mut events = node.client.events();

        node.subscribe().await.unwrap();

        assert_eq!(node.client.last_seen(node.handles[0]), Some(DataVersion(5)));
        assert!(!drain(&mut events)
            .iter()
            .any(|e| matches!(e, SubscriptionEvent::NotifyApplied { .. })));
        assert!(matches!(
            node.client.status(),
            Some(SyncStatus::Synchronized { .. })
        ));
    }

    // =============================================================================
    // SCENARIO C: STALE BASE VERSION
    // =============================================================================

    #[tokio::test(start_paused = true)]
    async fn test_scenario_c_wire_reports_conflict() {
        let fabric = Fabric::new(&[(1, 5)]);
        let (exchange, _) = wire_subscribe(&fabric.network, Some(DataVersion(5))).await;
        assert_eq!(
            fabric.source(0).commit(vec![PathValue::new(top(MODE), 7u64)]),
            DataVersion(6)
        );

        let (scopes, pairs) = codec()
            .encode_change_set(
                &thermostat::schema(),
                &ChangeSet {
                    scopes: vec![top(MODE)],
                    values: vec![PathValue::new(top(MODE), 2u64)],
                },
            )
            .unwrap();
        fabric
            .network
            .send(
                exchange,
                WdmMessage::UpdateRequest(UpdateRequest {
                    subscription_id: SUBSCRIPTION,
                    request_id: RequestId(1),
                    instance_id: InstanceId(1),
                    base_version: DataVersion(5),
                    scopes,
                    pairs,
                }),
            )
            .await
            .unwrap();

        assert_eq!(
            fabric.network.on_message(exchange).await.unwrap(),
            WdmMessage::UpdateResponse(UpdateResponse {
                subscription_id: SUBSCRIPTION,
                request_id: RequestId(1),
                status: UpdateStatus::VersionConflict(DataVersion(6)),
            })
        );
        assert_eq!(fabric.source(0).version(), DataVersion(6));
        assert_eq!(fabric.source(0).get(&top(MODE)), Some(PropertyValue::from(7u64)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_scenario_c_client_reconciles_without_resend() {
        let fabric = Fabric::new(&[(1, 5)]);
        let mut node = fabric.subscriber(&[1]);
        node.subscribe().await.unwrap();
        let handle = node.handles[0];
        let mut events = node.client.events();

        fabric.source(0).commit(vec![PathValue::new(top(MODE), 7u64)]);
        node.sinks[0].set(top(MODE), 2u64);
        node.client.mark_dirty(handle, top(MODE)).unwrap();
        let request_id = node.client.flush(handle).await.unwrap().unwrap();

        assert_eq!(
            node.client.await_update(request_id).await,
            Err(SubscriptionError::VersionConflict {
                instance: InstanceId(1),
                current: DataVersion(6),
            })
        );
        assert_eq!(node.client.pending_updates(), 0);
        node.client.poll().await.unwrap();
        node.client.poll().await.unwrap();

        // The local write was dropped, not retried on the new base.
        assert_eq!(fabric.source(0).version(), DataVersion(6));
        assert_eq!(node.sinks[0].get(&top(MODE)), Some(PropertyValue::from(7u64)));
        assert_eq!(node.client.last_seen(handle), Some(DataVersion(6)));
        assert_eq!(node.client.state(), SubscriptionState::Established);
        assert!(drain(&mut events).contains(&SubscriptionEvent::ReconciliationStarted {
            instances: vec![InstanceId(1)],
        }));
    }

    // =============================================================================
    // SCENARIO D: TRANSPORT FAILURES WHILE ESTABLISHED
    // =============================================================================

    #[tokio::test(start_paused = true)]
    async fn test_scenario_d_repeated_send_failure_aborts() {
        let fabric = Fabric::new(&[(1, 3)]);
        let mut node = fabric.subscriber(&[1]);
        node.subscribe().await.unwrap();
        let handle = node.handles[0];

        fabric.network.fail_next_sends(3);
        node.sinks[0].set(top(MODE), 2u64);
        node.client.mark_dirty(handle, top(MODE)).unwrap();
        let err = node.client.flush(handle).await.unwrap_err();

        assert!(matches!(
            err,
            SubscriptionError::Transport(TransportError::SendFailed(_))
        ));
        assert_eq!(node.client.state(), SubscriptionState::Aborting);
        assert_ne!(node.client.state(), SubscriptionState::Idle);
        assert!(matches!(
            node.client.status(),
            Some(SyncStatus::Reconnecting { .. })
        ));
        assert_eq!(node.client.retained_updates(), 1);

        // Retry scheduling brings it back with the update intact.
        node.client.resubscribe().await.unwrap();
        node.client.poll().await.unwrap();
        assert_eq!(fabric.source(0).get(&top(MODE)), Some(PropertyValue::from(2u64)));
    }

    // =============================================================================
    // SCENARIO E: STALE HANDLES
    // =============================================================================

    #[tokio::test(start_paused = true)]
    async fn test_scenario_e_publisher_rejects_stale_handle() {
        let fabric = Fabric::new(&[(1, 1)]);
        let catalog = &fabric.publisher.catalog;
        let old = fabric.publisher.instances[0].handle;

        catalog.unregister(old).unwrap();
        let replacement = Arc::new(MemoryTraitData::new());
        let reused = catalog
            .register_instance(key(2), Arc::new(thermostat::schema()), TraitBinding::source(&replacement))
            .unwrap();
        assert_eq!(reused.index(), old.index());

        assert_eq!(
            fabric.publisher.service.mark_dirty(old, top(MODE)),
            Err(SubscriptionError::Catalog(CatalogError::StaleHandle(old)))
        );
        assert!(fabric.publisher.service.mark_dirty(reused, top(MODE)).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_scenario_e_client_rejects_stale_handle() {
        let fabric = Fabric::new(&[(1, 1)]);
        let mut node = fabric.subscriber(&[1]);
        node.subscribe().await.unwrap();
        let old = node.handles[0];

        node.catalog.unregister(old).unwrap();
        let replacement = Arc::new(MemoryTraitData::new());
        let reused = node
            .catalog
            .register_instance(key(1), Arc::new(thermostat::schema()), TraitBinding::sink(&replacement))
            .unwrap();
        assert_eq!(reused.index(), old.index());

        assert_eq!(
            node.client.mark_dirty(old, top(MODE)),
            Err(SubscriptionError::Catalog(CatalogError::StaleHandle(old)))
        );
        assert!(matches!(
            node.client.flush(old).await,
            Err(SubscriptionError::Catalog(CatalogError::StaleHandle(_)))
        ));
        // The new registration is not part of the subscription.
        assert_eq!(
            node.client.mark_dirty(reused, top(MODE)),
            Err(SubscriptionError::NotSubscribed(reused))
        );
    }
}

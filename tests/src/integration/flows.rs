//! # Integration Test Flows
//!
//! Several subscribers and one publisher on a shared loopback network,
//! exercising the flows that cross more than one subsystem:
//!
//! 1. **Update fan-out**: a subscriber's committed update reaches every
//!    other subscriber of the instance as a diff notify.
//! 2. **Publisher-side changes**: local marks on the publisher are batched
//!    by WDM-04 and pushed as diffs.
//! 3. **Dictionaries**: element inserts and removals replace the container.
//! 4. **Recovery**: partitions, lost replies and capacity limits.

#[cfg(test)]
mod tests {
    use crate::fixtures::{schedule, top, Fabric};
    use shared_types::{DataVersion, ElementKey, InstanceId, PeerId, PropertyValue, RejectReason};
    use std::time::Duration;
    use tokio::sync::broadcast;
    use tokio::time::timeout;
    use wdm_01_property_schema::fixtures::thermostat::{self, *};
    use wdm_01_property_schema::{ChangeSet, PathValue, PropertyPath};
    use wdm_02_path_codec::{BincodeCodec, PathCodec};
    use wdm_03_trait_catalog::{MemoryTraitData, PropertyReader, TraitSink, TraitSource};
    use wdm_04_update_batching::ElementChange;
    use wdm_05_subscription::{
        SubscriptionError, SubscriptionEvent, SubscriptionState, TransportError,
    };

    // =============================================================================
    // TEST FIXTURES
    // =============================================================================

    fn drain(rx: &mut broadcast::Receiver<SubscriptionEvent>) -> Vec<SubscriptionEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    // =============================================================================
    // FAN-OUT
    // =============================================================================

    #[tokio::test(start_paused = true)]
    async fn test_update_fans_out_to_other_subscribers() {
        let fabric = Fabric::new(&[(1, 3)]);
        let mut writer = fabric.subscriber(&[1]);
        let mut reader = fabric.subscriber(&[1]);
        writer.subscribe().await.unwrap();
        reader.subscribe().await.unwrap();
        assert_eq!(fabric.publisher.service.subscribers_of(&crate::fixtures::key(1)), 2);
        let mut reader_events = reader.client.events();

        writer.sinks[0].set(top(MODE), 2u64);
        writer.client.mark_dirty(writer.handles[0], top(MODE)).unwrap();
        let request_id = writer.client.flush(writer.handles[0]).await.unwrap().unwrap();
        assert_eq!(writer.client.await_update(request_id).await, Ok(DataVersion(4)));

        reader.client.poll().await.unwrap();
        assert_eq!(reader.sinks[0].get(&top(MODE)), Some(PropertyValue::from(2u64)));
        assert_eq!(reader.client.last_seen(reader.handles[0]), Some(DataVersion(4)));
        assert!(drain(&mut reader_events).contains(&SubscriptionEvent::NotifyApplied {
            instance: InstanceId(1),
            version: DataVersion(4),
            full_state: false,
        }));
        // Untouched leaves keep their full-state values.
        assert_eq!(
            reader.sinks[0].get(&top(CURRENT_TEMPERATURE)),
            Some(PropertyValue::from(20.5))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_publisher_change_pushed_as_diff() {
        let fabric = Fabric::new(&[(1, 3), (2, 8)]);
        let mut node = fabric.subscriber(&[1, 2]);
        node.subscribe().await.unwrap();
        let published = &fabric.publisher.instances[0];

        let version = published.source.commit(vec![
            PathValue::new(top(CURRENT_TEMPERATURE), 18.0),
            PathValue::new(top(SETTINGS).child(LABEL), "porch"),
        ]);
        assert_eq!(version, DataVersion(4));
        fabric
            .publisher
            .service
            .mark_dirty(published.handle, top(CURRENT_TEMPERATURE))
            .unwrap();
        fabric
            .publisher
            .service
            .mark_dirty(published.handle, top(SETTINGS).child(LABEL))
            .unwrap();

        assert_eq!(fabric.publisher.service.notify_dirty().await, Ok(1));
        node.client.poll().await.unwrap();

        let sink = &node.sinks[0];
        assert_eq!(sink.get(&top(CURRENT_TEMPERATURE)), Some(PropertyValue::from(18.0)));
        assert_eq!(
            sink.get(&top(SETTINGS).child(LABEL)),
            Some(PropertyValue::from("porch"))
        );
        assert_eq!(node.client.last_seen(node.handles[0]), Some(DataVersion(4)));
        // The other instance is unaffected.
        assert_eq!(node.client.last_seen(node.handles[1]), Some(DataVersion(8)));
        // Nothing left to push.
        assert_eq!(fabric.publisher.service.notify_dirty().await, Ok(0));
    }

    // =============================================================================
    // DICTIONARIES
    // =============================================================================

    #[tokio::test(start_paused = true)]
    async fn test_dictionary_insert_and_remove() {
        let fabric = Fabric::new(&[(1, 3)]);
        let mut node = fabric.subscriber(&[1]);
        node.subscribe().await.unwrap();
        let handle = node.handles[0];
        let sink = node.sinks[0].clone();
        let schedules = top(SCHEDULES);

        sink.set(schedule(2, START), 1_080u64);
        sink.set(schedule(2, SETPOINT), 17.5);
        node.client
            .mark_element_changed(handle, schedules.clone(), ElementKey(2), ElementChange::Added)
            .unwrap();
        sink.remove(&schedule(1, START));
        sink.remove(&schedule(1, SETPOINT));
        node.client
            .mark_element_changed(handle, schedules.clone(), ElementKey(1), ElementChange::Removed)
            .unwrap();

        let request_id = node.client.flush(handle).await.unwrap().unwrap();
        assert_eq!(node.client.await_update(request_id).await, Ok(DataVersion(4)));

        let source = fabric.source(0);
        assert_eq!(source.element_keys(&schedules), vec![ElementKey(2)]);
        assert_eq!(source.get(&schedule(2, START)), Some(PropertyValue::from(1_080u64)));
        assert_eq!(source.get(&schedule(1, START)), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dictionary_element_modification() {
        let fabric = Fabric::new(&[(1, 3)]);
        let mut node = fabric.subscriber(&[1]);
        node.subscribe().await.unwrap();
        let handle = node.handles[0];

        node.sinks[0].set(schedule(1, SETPOINT), 22.5);
        node.client
            .mark_element_changed(handle, top(SCHEDULES), ElementKey(1), ElementChange::Modified)
            .unwrap();
        let request_id = node.client.flush(handle).await.unwrap().unwrap();
        assert_eq!(node.client.await_update(request_id).await, Ok(DataVersion(4)));

        let source = fabric.source(0);
        assert_eq!(source.get(&schedule(1, SETPOINT)), Some(PropertyValue::from(22.5)));
        assert_eq!(source.get(&schedule(1, START)), Some(PropertyValue::from(420u64)));
    }

    // =============================================================================
    // IDEMPOTENCE
    // =============================================================================

    #[test]
    fn test_full_state_replay_is_idempotent() {
        let fabric = Fabric::new(&[(1, 3)]);
        let schema = thermostat::schema();
        let codec = PathCodec::new(BincodeCodec::default());
        let source = fabric.source(0);

        let leaves = schema
            .expand_to_leaves(&PropertyPath::root(), |dict| {
                source.element_keys(dict)
            })
            .unwrap();
        let values = leaves
            .into_iter()
            .filter_map(|path| {
                source
                    .read_property(&path)
                    .ok()
                    .map(|value| PathValue { path, value })
            })
            .collect();
        let (scopes, pairs) = codec
            .encode_change_set(&schema, &ChangeSet::full_state(values))
            .unwrap();
        let changes = codec.decode_change_set(&schema, &scopes, &pairs).unwrap();

        let sink = MemoryTraitData::new();
        sink.set(top(LAST_ERROR), "stale");
        sink.apply_notify(DataVersion(3), &changes).unwrap();
        let first = sink.snapshot();
        sink.apply_notify(DataVersion(3), &changes).unwrap();

        assert_eq!(sink.snapshot(), first);
        assert_eq!(first, source.snapshot());
        assert_eq!(sink.applied_version(), Some(DataVersion(3)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_lost_reply_applies_update_once() {
        let fabric = Fabric::new(&[(1, 3)]);
        let mut writer = fabric.subscriber(&[1]);
        let mut reader = fabric.subscriber(&[1]);
        writer.subscribe().await.unwrap();
        reader.subscribe().await.unwrap();
        let mut reader_events = reader.client.events();

        fabric.network.drop_next_replies(1);
        writer.sinks[0].set(top(MODE), 5u64);
        writer.client.mark_dirty(writer.handles[0], top(MODE)).unwrap();
        let request_id = writer.client.flush(writer.handles[0]).await.unwrap().unwrap();
        assert_eq!(writer.client.await_update(request_id).await, Ok(DataVersion(4)));
        assert_eq!(fabric.source(0).version(), DataVersion(4));

        // One diff for one applied update, despite the resend.
        reader.client.poll().await.unwrap();
        assert!(timeout(Duration::from_millis(500), reader.client.poll())
            .await
            .is_err());
        let applied = drain(&mut reader_events)
            .into_iter()
            .filter(|e| matches!(e, SubscriptionEvent::NotifyApplied { .. }))
            .count();
        assert_eq!(applied, 1);
    }

    // =============================================================================
    // RECOVERY
    // =============================================================================

    #[tokio::test(start_paused = true)]
    async fn test_partition_then_recover() {
        let fabric = Fabric::new(&[(1, 3)]);
        let mut node = fabric.subscriber(&[1]);
        node.subscribe().await.unwrap();
        let handle = node.handles[0];
        let mut events = node.client.events();

        fabric.network.partition(crate::fixtures::PUBLISHER);
        node.sinks[0].set(top(MODE), 4u64);
        node.client.mark_dirty(handle, top(MODE)).unwrap();
        let cause = node.client.flush(handle).await.unwrap_err();
        assert_eq!(
            cause,
            SubscriptionError::Transport(TransportError::Unreachable(crate::fixtures::PUBLISHER))
        );
        assert_eq!(node.client.state(), SubscriptionState::Aborting);
        assert!(node.client.resubscribe().await.is_err());
        assert_eq!(node.client.state(), SubscriptionState::Aborting);

        fabric.network.heal(crate::fixtures::PUBLISHER);
        node.client.resubscribe().await.unwrap();
        node.client.poll().await.unwrap();

        assert_eq!(node.client.state(), SubscriptionState::Established);
        assert_eq!(fabric.source(0).get(&top(MODE)), Some(PropertyValue::from(4u64)));
        assert!(drain(&mut events).contains(&SubscriptionEvent::Recovered { from: cause }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_publisher_capacity_limit() {
        let fabric = Fabric::new(&[(1, 1)]);
        let mut nodes: Vec<_> = (0..4).map(|_| fabric.subscriber(&[1])).collect();
        for node in nodes.iter_mut() {
            node.subscribe().await.unwrap();
        }
        assert_eq!(fabric.publisher.service.subscription_count(), 4);

        let mut late = fabric.subscriber(&[1]);
        assert_eq!(
            late.subscribe().await,
            Err(SubscriptionError::SubscriptionRejected(RejectReason::ResourceExhausted))
        );

        // Canceling one frees a slot.
        nodes[0].client.cancel().await.unwrap();
        assert_eq!(fabric.publisher.service.subscription_count(), 3);
        late.subscribe().await.unwrap();
        assert_eq!(late.client.state(), SubscriptionState::Established);
    }

    #[tokio::test(start_paused = true)]
    async fn test_purge_drops_one_of_several_instances() {
        let fabric = Fabric::new(&[(1, 1), (2, 1)]);
        let mut node = fabric.subscriber(&[1, 2]);
        node.subscribe().await.unwrap();
        let mut events = node.client.events();

        fabric
            .publisher
            .catalog
            .unregister(fabric.publisher.instances[0].handle)
            .unwrap();
        assert_eq!(fabric.publisher.service.purge_stale_instances().await, 1);
        node.client.poll().await.unwrap();

        assert_eq!(node.client.state(), SubscriptionState::Established);
        assert_eq!(node.client.last_seen(node.handles[0]), None);
        assert_eq!(node.client.last_seen(node.handles[1]), Some(DataVersion(1)));
        assert!(drain(&mut events).contains(&SubscriptionEvent::InstanceRemoved(InstanceId(1))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_peer_is_not_published() {
        let fabric = Fabric::new(&[(1, 1)]);
        let mut node = fabric.subscriber(&[1]);
        assert_eq!(
            node.client.subscribe(PeerId(7), &node.handles.clone()).await,
            Err(SubscriptionError::SubscriptionTimeout)
        );
        assert_eq!(node.client.state(), SubscriptionState::Idle);
    }

    // =============================================================================
    // METRICS
    // =============================================================================

    #[tokio::test(start_paused = true)]
    async fn test_metrics_exported() {
        let _ = wdm_telemetry::register_metrics();
        let before = wdm_telemetry::SUBSCRIPTIONS_ESTABLISHED.get();
        let fabric = Fabric::new(&[(1, 3)]);
        let mut node = fabric.subscriber(&[1]);
        node.subscribe().await.unwrap();

        node.sinks[0].set(top(MODE), 3u64);
        node.client.mark_dirty(node.handles[0], top(MODE)).unwrap();
        let request_id = node.client.flush(node.handles[0]).await.unwrap().unwrap();
        node.client.await_update(request_id).await.unwrap();

        assert!(wdm_telemetry::SUBSCRIPTIONS_ESTABLISHED.get() >= before + 1.0);
        assert!(wdm_telemetry::UPDATES_SENT.get() >= 1.0);
        let text = wdm_telemetry::encode_metrics().unwrap();
        assert!(text.contains("wdm_subscriptions_established_total"));
        assert!(text.contains("wdm_updates_sent_total"));
        assert!(text.contains("wdm_notifies_applied_total"));
    }
}

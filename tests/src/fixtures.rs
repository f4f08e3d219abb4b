//! # Test Fabric
//!
//! One publisher node and any number of subscriber nodes sharing a
//! [`LoopbackNetwork`]. Every node has its own catalog; publishers bind
//! sources, subscribers bind sinks, both under the thermostat schema.

use shared_types::{DataVersion, ElementKey, PeerId, PropertyHandle, TraitInstanceKey};
use std::sync::Arc;
use wdm_01_property_schema::fixtures::thermostat::{self, *};
use wdm_01_property_schema::{PathValue, PropertyPath, TraitSchema};
use wdm_02_path_codec::{BincodeCodec, PathCodec};
use wdm_03_trait_catalog::{CatalogConfig, CatalogHandle, MemoryTraitData, TraitBinding, TraitCatalog};
use wdm_05_subscription::{LoopbackNetwork, PublisherService, SubscriptionClient, SubscriptionConfig};

/// Peer id the publisher node answers on.
pub const PUBLISHER: PeerId = PeerId(100);

/// Resource every fixture instance lives on.
pub const RESOURCE: u64 = 1;

/// Thermostat instance key on [`RESOURCE`].
pub fn key(instance: u64) -> TraitInstanceKey {
    TraitInstanceKey::new(thermostat::PROFILE.0, RESOURCE, instance)
}

/// Path to a top-level property.
pub fn top(handle: PropertyHandle) -> PropertyPath {
    PropertyPath::root().child(handle)
}

/// Path to a field of a schedule element.
pub fn schedule(element: u16, field: PropertyHandle) -> PropertyPath {
    top(SCHEDULES).element(ElementKey(element)).child(field)
}

/// Initial publisher data.
pub fn thermostat_values() -> Vec<PathValue> {
    vec![
        PathValue::new(top(CURRENT_TEMPERATURE), 20.5),
        PathValue::new(top(MODE), 1u64),
        PathValue::new(top(SETTINGS).child(ECO), true),
        PathValue::new(top(SETTINGS).child(LABEL), "hall"),
        PathValue::new(schedule(1, START), 420u64),
        PathValue::new(schedule(1, SETPOINT), 21.0),
    ]
}

/// A published instance.
pub struct Published {
    /// Catalog handle on the publisher.
    pub handle: CatalogHandle,
    /// Authoritative data.
    pub source: Arc<MemoryTraitData>,
}

/// The publisher node.
pub struct PublisherNode {
    /// Publisher catalog.
    pub catalog: Arc<TraitCatalog>,
    /// Publisher service registered on the network.
    pub service: Arc<PublisherService>,
    /// Published instances in registration order.
    pub instances: Vec<Published>,
}

/// A subscriber node with its client.
pub struct SubscriberNode {
    /// Subscriber catalog.
    pub catalog: Arc<TraitCatalog>,
    /// Subscription client.
    pub client: SubscriptionClient,
    /// Sink handles in the order requested.
    pub handles: Vec<CatalogHandle>,
    /// Sinks in the order requested.
    pub sinks: Vec<Arc<MemoryTraitData>>,
}

impl SubscriberNode {
    /// Subscribe to every sink of this node.
    pub async fn subscribe(&mut self) -> Result<(), wdm_05_subscription::SubscriptionError> {
        let handles = self.handles.clone();
        self.client.subscribe(PUBLISHER, &handles).await
    }
}

/// Network plus publisher.
pub struct Fabric {
    /// Shared in-process network.
    pub network: Arc<LoopbackNetwork>,
    /// The publisher node.
    pub publisher: PublisherNode,
}

impl Fabric {
    /// Publisher serving `(instance, version)` pairs with thermostat data.
    pub fn new(instances: &[(u64, u64)]) -> Self {
        Self::with_schema(instances, thermostat::schema())
    }

    /// Publisher using a specific schema declaration.
    pub fn with_schema(instances: &[(u64, u64)], schema: TraitSchema) -> Self {
        let network = Arc::new(LoopbackNetwork::new());
        let catalog = Arc::new(TraitCatalog::new(CatalogConfig::for_testing()));
        let schema = Arc::new(schema);
        let instances = instances
            .iter()
            .map(|&(instance, version)| {
                let source = Arc::new(MemoryTraitData::with_values(
                    DataVersion(version),
                    thermostat_values(),
                ));
                let handle = catalog
                    .register_instance(key(instance), Arc::clone(&schema), TraitBinding::source(&source))
                    .expect("fixture instance registers");
                Published { handle, source }
            })
            .collect();
        let service = Arc::new(PublisherService::new(
            SubscriptionConfig::for_testing(),
            Arc::clone(&catalog),
            network.clone(),
            PathCodec::new(BincodeCodec::default()),
        ));
        network.register_handler(PUBLISHER, &service);
        Self {
            network,
            publisher: PublisherNode {
                catalog,
                service,
                instances,
            },
        }
    }

    /// Source of the `index`-th published instance.
    pub fn source(&self, index: usize) -> &Arc<MemoryTraitData> {
        &self.publisher.instances[index].source
    }

    /// Subscriber node with empty sinks for `instances`.
    pub fn subscriber(&self, instances: &[u64]) -> SubscriberNode {
        self.subscriber_with(SubscriptionConfig::for_testing(), instances)
    }

    /// Subscriber node with a custom configuration.
    pub fn subscriber_with(&self, config: SubscriptionConfig, instances: &[u64]) -> SubscriberNode {
        let catalog = Arc::new(TraitCatalog::new(CatalogConfig::for_testing()));
        let schema = Arc::new(thermostat::schema());
        let mut handles = Vec::with_capacity(instances.len());
        let mut sinks = Vec::with_capacity(instances.len());
        for &instance in instances {
            let sink = Arc::new(MemoryTraitData::new());
            let handle = catalog
                .register_instance(key(instance), Arc::clone(&schema), TraitBinding::sink(&sink))
                .expect("fixture sink registers");
            handles.push(handle);
            sinks.push(sink);
        }
        let client = SubscriptionClient::new(
            config,
            Arc::clone(&catalog),
            self.network.clone(),
            PathCodec::new(BincodeCodec::default()),
        );
        SubscriberNode {
            catalog,
            client,
            handles,
            sinks,
        }
    }
}

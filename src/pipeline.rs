// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Wiring between the event bus, the matcher and the dispatcher.
//!
//! [`NotificationPipeline`] is the router of the [`EventBus`]: it receives
//! every event, matches it against the subscription store and hands the
//! matches to the [`NotificationDispatcher`]. Publishers wait while it is
//! behind, so bursts are never dropped on the way to the bus. It also drives the device lifecycle: a
//! connecting device gets its persisted observations re-armed, a
//! disconnecting one has them forgotten.

use std::fmt;
use std::sync::Arc;

use chrono::Utc;
use tokio::task::JoinHandle;

use crate::bus::BusConnector;
use crate::dispatch::NotificationDispatcher;
use crate::error::StoreError;
use crate::event::{EventBus, LifecycleEvent, LifecycleKind, PipelineEvent};
use crate::model::{Client, DefinitionLookup};
use crate::observe::{DeviceTransport, ObservationTracker};
use crate::subscription::{SubscriptionMatcher, SubscriptionStore};

/// Routes pipeline events to subscribers.
///
/// # Examples
///
/// ```no_run
/// use std::sync::Arc;
///
/// use lwm2m_notify::bus::{InMemoryBroker, MessageBus};
/// use lwm2m_notify::config::PipelineConfig;
/// use lwm2m_notify::dispatch::NotificationDispatcher;
/// use lwm2m_notify::event::EventBus;
/// use lwm2m_notify::model::DefinitionRegistry;
/// use lwm2m_notify::pipeline::NotificationPipeline;
/// use lwm2m_notify::subscription::{InMemorySubscriptionStore, SubscriptionMatcher};
///
/// # async fn example() {
/// let config = PipelineConfig::new();
/// let bus = MessageBus::new(InMemoryBroker::new(), config.bus.clone());
/// let pipeline = NotificationPipeline::new(
///     EventBus::with_capacity(config.event_capacity),
///     SubscriptionMatcher::new(Arc::new(InMemorySubscriptionStore::new())),
///     NotificationDispatcher::new(bus, &config.webhook),
///     Arc::new(DefinitionRegistry::new()),
/// );
/// pipeline.start();
/// # }
/// ```
pub struct NotificationPipeline<S: SubscriptionStore, C: BusConnector> {
    events: EventBus,
    matcher: Arc<SubscriptionMatcher<S>>,
    dispatcher: NotificationDispatcher<C>,
    definitions: Arc<dyn DefinitionLookup>,
    task: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl<S: SubscriptionStore, C: BusConnector> fmt::Debug for NotificationPipeline<S, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NotificationPipeline")
            .field("routing_key", &self.dispatcher.routing_key())
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

impl<S: SubscriptionStore, C: BusConnector> NotificationPipeline<S, C> {
    /// Assembles a pipeline. Nothing runs until [`start`](Self::start).
    #[must_use]
    pub fn new(
        events: EventBus,
        matcher: SubscriptionMatcher<S>,
        dispatcher: NotificationDispatcher<C>,
        definitions: Arc<dyn DefinitionLookup>,
    ) -> Self {
        Self {
            events,
            matcher: Arc::new(matcher),
            dispatcher,
            definitions,
            task: parking_lot::Mutex::new(None),
        }
    }

    /// The event bus the pipeline listens on. Trackers publish here.
    #[must_use]
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// The subscription matcher.
    #[must_use]
    pub fn matcher(&self) -> &SubscriptionMatcher<S> {
        &self.matcher
    }

    /// Returns `true` while the routing task runs.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    /// Spawns the routing task. Calling it again while running does nothing.
    pub fn start(&self) {
        let mut task = self.task.lock();
        if task.as_ref().is_some_and(|t| !t.is_finished()) {
            return;
        }

        let mut receiver = self.events.route();
        let matcher = Arc::clone(&self.matcher);
        let dispatcher = self.dispatcher.clone();

        *task = Some(tokio::spawn(async move {
            while let Some(event) = receiver.recv().await {
                route(matcher.as_ref(), &dispatcher, &event).await;
            }
            tracing::debug!("Pipeline routing stopped");
        }));
        tracing::info!(routing_key = %self.dispatcher.routing_key(), "Pipeline started");
    }

    /// Stops the routing task. Events published afterwards are not routed.
    pub fn stop(&self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
            tracing::info!("Pipeline stopped");
        }
    }

    /// Matches and dispatches one event directly, returning the number of
    /// messages published.
    pub async fn process(&self, event: &PipelineEvent) -> usize {
        route(self.matcher.as_ref(), &self.dispatcher, event).await
    }

    // ========================================================================
    // Device lifecycle
    // ========================================================================

    /// Announces a connected device and re-arms its persisted observations.
    ///
    /// Returns how many observations are in place afterwards.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the subscriptions cannot be read.
    pub async fn device_connected<T: DeviceTransport>(
        &self,
        client: &Client,
        tracker: &ObservationTracker<T>,
    ) -> Result<usize, StoreError> {
        self.announce(client, LifecycleKind::Connected).await;
        let armed = self
            .matcher
            .rearm(client.id, tracker, self.definitions.as_ref())
            .await?;
        tracing::info!(client = %client.id, observations = armed, "Device connected");
        Ok(armed)
    }

    /// Announces a registration update.
    pub async fn device_updated(&self, client: &Client) {
        self.announce(client, LifecycleKind::Updated).await;
    }

    /// Forgets the device's observations without contacting it, then
    /// announces the disconnect.
    pub async fn device_disconnected<T: DeviceTransport>(
        &self,
        client: &Client,
        tracker: &ObservationTracker<T>,
    ) {
        let cancelled = tracker.cancel_all(true).await;
        self.announce(client, LifecycleKind::Disconnected).await;
        tracing::info!(client = %client.id, observations = cancelled, "Device disconnected");
    }

    /// Announces that the registration lifetime elapsed.
    pub async fn device_expired(&self, client: &Client) {
        self.announce(client, LifecycleKind::Expired).await;
    }

    async fn announce(&self, client: &Client, kind: LifecycleKind) {
        self.events
            .publish(PipelineEvent::Lifecycle(LifecycleEvent {
                client_id: client.id,
                organisation_id: client.organisation_id,
                kind,
                time: Utc::now(),
            }))
            .await;
    }
}

impl<S: SubscriptionStore, C: BusConnector> Drop for NotificationPipeline<S, C> {
    fn drop(&mut self) {
        if let Some(task) = self.task.get_mut().take() {
            task.abort();
        }
    }
}

async fn route<S: SubscriptionStore, C: BusConnector>(
    matcher: &SubscriptionMatcher<S>,
    dispatcher: &NotificationDispatcher<C>,
    event: &PipelineEvent,
) -> usize {
    let result = match event {
        PipelineEvent::ResourceChanged(change) => match matcher.match_change(change).await {
            Ok(matches) => Ok(dispatcher.dispatch_change(change, &matches).await),
            Err(e) => Err(e),
        },
        PipelineEvent::Lifecycle(lifecycle) => match matcher.match_lifecycle(lifecycle).await {
            Ok(matches) => Ok(dispatcher.dispatch_lifecycle(lifecycle, &matches).await),
            Err(e) => Err(e),
        },
    };

    match result {
        Ok(published) => {
            tracing::debug!(client = %event.client_id(), published, "Event routed");
            published
        }
        Err(e) => {
            tracing::warn!(client = %event.client_id(), error = %e, "Subscription lookup failed, event dropped");
            0
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::time::Duration;

    use parking_lot::Mutex;
    use tokio::sync::mpsc;

    use super::*;
    use crate::bus::{InMemoryBroker, MessageBus, QueueOptions, ServiceEventMessage, handler, params};
    use crate::config::{BusConfig, WebhookConfig};
    use crate::error::ObservationError;
    use crate::model::{
        BindingMode, ClientId, DefinitionRegistry, ObjectDefinition, OrganisationId,
        PropertyDataType, PropertyDefinition, Subscription, SubscriptionType,
    };
    use crate::observe::{CoapMethod, CoapRequest, CoapResponse, ResourcePath, ResponseCode};
    use crate::subscription::InMemorySubscriptionStore;

    #[derive(Clone, Default)]
    struct RecordingTransport {
        sent: Arc<Mutex<Vec<CoapRequest>>>,
        reset: Arc<Mutex<Vec<ResourcePath>>>,
    }

    impl DeviceTransport for RecordingTransport {
        async fn send(&self, request: CoapRequest) -> Result<CoapResponse, ObservationError> {
            self.sent.lock().push(request);
            Ok(CoapResponse::empty(ResponseCode::CONTENT))
        }

        async fn cancel_local(&self, path: ResourcePath) {
            self.reset.lock().push(path);
        }
    }

    struct Fixture {
        pipeline: NotificationPipeline<InMemorySubscriptionStore, InMemoryBroker>,
        store: Arc<InMemorySubscriptionStore>,
        registry: Arc<DefinitionRegistry>,
        delivered: mpsc::UnboundedReceiver<ServiceEventMessage>,
    }

    async fn fixture() -> Fixture {
        fixture_with(EventBus::new()).await
    }

    async fn fixture_with(events: EventBus) -> Fixture {
        let bus = MessageBus::new(InMemoryBroker::new(), BusConfig::new().with_host_name("test"));
        let config = WebhookConfig::new();

        let (tx, delivered) = mpsc::unbounded_channel();
        let consumer = bus.clone();
        bus.subscribe(
            &config.queue_name,
            QueueOptions::durable(),
            Some(&config.routing_key),
            handler(move |message: ServiceEventMessage| {
                let consumer = consumer.clone();
                let tx = tx.clone();
                async move {
                    let _ = consumer.ack_message(&message).await;
                    let _ = tx.send(message);
                }
            }),
        )
        .await
        .unwrap();

        let store = Arc::new(InMemorySubscriptionStore::new());
        let registry = Arc::new(DefinitionRegistry::new());
        let pipeline = NotificationPipeline::new(
            events,
            SubscriptionMatcher::new(Arc::clone(&store)),
            NotificationDispatcher::new(bus, &config),
            Arc::clone(&registry) as Arc<dyn DefinitionLookup>,
        );

        Fixture {
            pipeline,
            store,
            registry,
            delivered,
        }
    }

    fn client(org: OrganisationId) -> Client {
        Client {
            id: ClientId::new(),
            organisation_id: org,
            name: "sensor-1".to_string(),
            lifetime: Utc::now() + chrono::Duration::seconds(60),
            version: "1.0".to_string(),
            binding: BindingMode::Udp,
            supported_types: vec![3303],
            address: "127.0.0.1:5683".parse().unwrap(),
        }
    }

    #[tokio::test]
    async fn lifecycle_event_reaches_subscribers() {
        let mut fx = fixture().await;
        let org = OrganisationId::new(7);
        fx.store
            .save(Subscription::lifecycle(
                org,
                SubscriptionType::ClientUpdated,
                "http://hook/updated",
            ))
            .await
            .unwrap();

        fx.pipeline.start();
        assert!(fx.pipeline.is_running());
        fx.pipeline.device_updated(&client(org)).await;

        let message = tokio::time::timeout(Duration::from_secs(2), fx.delivered.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(message.string(params::SUBSCRIPTION_TYPE), Some("ClientUpdated"));
        assert_eq!(message.string(params::URL), Some("http://hook/updated"));

        fx.pipeline.stop();
        assert!(!fx.pipeline.is_running());
    }

    #[tokio::test]
    async fn burst_beyond_capacity_is_routed_completely() {
        let mut fx = fixture_with(EventBus::with_capacity(2)).await;
        let org = OrganisationId::new(7);
        fx.store
            .save(Subscription::lifecycle(
                org,
                SubscriptionType::ClientUpdated,
                "http://hook/updated",
            ))
            .await
            .unwrap();
        fx.pipeline.start();

        let device = client(org);
        for _ in 0..20 {
            fx.pipeline.device_updated(&device).await;
        }

        for _ in 0..20 {
            tokio::time::timeout(Duration::from_secs(2), fx.delivered.recv())
                .await
                .unwrap()
                .unwrap();
        }
        fx.pipeline.stop();
    }

    #[tokio::test]
    async fn other_organisations_are_not_notified() {
        let fx = fixture().await;
        fx.store
            .save(Subscription::lifecycle(
                OrganisationId::new(1),
                SubscriptionType::ClientConnectionExpired,
                "http://hook",
            ))
            .await
            .unwrap();

        let event = PipelineEvent::Lifecycle(LifecycleEvent {
            client_id: ClientId::new(),
            organisation_id: OrganisationId::new(2),
            kind: LifecycleKind::Expired,
            time: Utc::now(),
        });
        assert_eq!(fx.pipeline.process(&event).await, 0);
    }

    #[tokio::test]
    async fn connect_rearms_and_disconnect_resets() {
        let fx = fixture().await;
        let definition = fx.registry.insert(
            ObjectDefinition::new(3303, "Temperature").with_property(PropertyDefinition::new(
                5700,
                "Sensor Value",
                PropertyDataType::Float,
            )),
        );

        let org = OrganisationId::new(1);
        let device = client(org);
        fx.store
            .save(
                Subscription::observation(org, device.id, definition.id, "http://hook")
                    .with_instance(0),
            )
            .await
            .unwrap();

        let transport = RecordingTransport::default();
        let tracker =
            ObservationTracker::new(device.id, org, transport.clone(), fx.pipeline.events().clone());

        assert_eq!(fx.pipeline.device_connected(&device, &tracker).await.unwrap(), 1);
        let observes: HashMap<String, Option<u32>> = transport
            .sent
            .lock()
            .iter()
            .filter(|r| r.method == CoapMethod::Get)
            .map(|r| (r.path.to_string(), r.observe))
            .collect();
        assert_eq!(observes.get("3303/0"), Some(&Some(0)));

        fx.pipeline.device_disconnected(&device, &tracker).await;
        assert!(tracker.observed_paths().is_empty());
        assert_eq!(transport.reset.lock().len(), 1);
    }
}

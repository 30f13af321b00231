// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Outstanding observations of one client connection.

use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;

use super::metrics::{MetricsSnapshot, TransferMetrics};
use super::path::ResourcePath;
use super::transport::{CoapRequest, CoapResponse, DeviceTransport};
use crate::error::{CodecError, ObservationError};
use crate::event::{ChangeEvent, EventBus, PipelineEvent};
use crate::model::{
    ClientId, NotificationParameters, Object, ObjectDefinition, OrganisationId, PropertyDefinition,
};
use crate::tlv;

/// One tracked observation.
#[derive(Debug, Clone)]
struct ObserveRequest {
    path: ResourcePath,
    definition: Arc<ObjectDefinition>,
    property: Option<PropertyDefinition>,
}

/// Result of [`ObservationTracker::observe`].
#[derive(Debug, Clone, PartialEq)]
pub enum ObserveOutcome {
    /// The path was already observed; nothing was sent.
    AlreadyObserved,
    /// The device accepted the observation.
    Established {
        /// Decoded content of the observe response, if it carried any.
        initial: Option<Object>,
    },
}

/// Tracks the observations of one connected client and turns incoming
/// notifications into [`PipelineEvent::ResourceChanged`] events.
///
/// Paths are tracked exactly: observing `3303/0` and `3303/0/5700` issues
/// two observations.
pub struct ObservationTracker<T: DeviceTransport> {
    client_id: ClientId,
    organisation_id: OrganisationId,
    transport: T,
    events: EventBus,
    requests: Mutex<Vec<ObserveRequest>>,
    metrics: TransferMetrics,
}

impl<T: DeviceTransport> std::fmt::Debug for ObservationTracker<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObservationTracker")
            .field("client_id", &self.client_id)
            .field("observed", &self.requests.lock().len())
            .finish_non_exhaustive()
    }
}

impl<T: DeviceTransport> ObservationTracker<T> {
    /// Creates a tracker for a newly connected client.
    #[must_use]
    pub fn new(
        client_id: ClientId,
        organisation_id: OrganisationId,
        transport: T,
        events: EventBus,
    ) -> Self {
        Self {
            client_id,
            organisation_id,
            transport,
            events,
            requests: Mutex::new(Vec::new()),
            metrics: TransferMetrics::new(),
        }
    }

    /// The tracked client.
    #[must_use]
    pub fn client_id(&self) -> ClientId {
        self.client_id
    }

    /// The client's organisation.
    #[must_use]
    pub fn organisation_id(&self) -> OrganisationId {
        self.organisation_id
    }

    /// The device transport.
    #[must_use]
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Paths currently observed.
    #[must_use]
    pub fn observed_paths(&self) -> Vec<ResourcePath> {
        self.requests.lock().iter().map(|r| r.path).collect()
    }

    /// Returns `true` if exactly this path is observed.
    #[must_use]
    pub fn is_observed(&self, path: &ResourcePath) -> bool {
        self.requests.lock().iter().any(|r| r.path == *path)
    }

    /// Transfer counters of this connection.
    #[must_use]
    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Starts observing `definition[/instance[/property]]`.
    ///
    /// Non-empty `parameters` are written as notification attributes first;
    /// a device that rejects them is still observed with its defaults.
    ///
    /// # Errors
    ///
    /// Returns [`ObservationError`] if the transport fails or the device
    /// rejects the observe. The path is not tracked in that case.
    pub async fn observe(
        &self,
        definition: Arc<ObjectDefinition>,
        instance_id: Option<u16>,
        property: Option<PropertyDefinition>,
        parameters: Option<&NotificationParameters>,
    ) -> Result<ObserveOutcome, ObservationError> {
        let path = ResourcePath::new(
            definition.object_id,
            instance_id,
            property.as_ref().map(|p| p.resource_id),
        );

        {
            let mut requests = self.requests.lock();
            if requests.iter().any(|r| r.path == path) {
                tracing::debug!(client = %self.client_id, path = %path, "Already observed");
                return Ok(ObserveOutcome::AlreadyObserved);
            }
            requests.push(ObserveRequest {
                path,
                definition: Arc::clone(&definition),
                property: property.clone(),
            });
        }

        match self.establish(path, parameters).await {
            Ok(payload) => {
                tracing::debug!(client = %self.client_id, path = %path, "Observation established");
                let initial = if payload.is_empty() {
                    None
                } else {
                    let request = ObserveRequest {
                        path,
                        definition,
                        property,
                    };
                    match decode(&request, &payload) {
                        Ok(objects) => objects.into_iter().next(),
                        Err(e) => {
                            tracing::warn!(
                                client = %self.client_id,
                                path = %path,
                                error = %e,
                                "Undecodable observe response"
                            );
                            None
                        }
                    }
                };
                Ok(ObserveOutcome::Established { initial })
            }
            Err(e) => {
                self.requests.lock().retain(|r| r.path != path);
                tracing::warn!(client = %self.client_id, path = %path, error = %e, "Observe failed");
                Err(e)
            }
        }
    }

    async fn exchange(&self, request: CoapRequest) -> Result<CoapResponse, ObservationError> {
        self.metrics.record_sent(request.encoded_len());
        self.transport.send(request).await
    }

    async fn establish(
        &self,
        path: ResourcePath,
        parameters: Option<&NotificationParameters>,
    ) -> Result<Vec<u8>, ObservationError> {
        if let Some(parameters) = parameters.filter(|p| !p.is_empty()) {
            let query = parameters.to_query();
            let response = self
                .exchange(CoapRequest::write_attributes(path, query))
                .await?;
            self.metrics.record_received(response.payload.len());
            if !response.code.is_success() {
                tracing::warn!(
                    client = %self.client_id,
                    path = %path,
                    code = %response.code,
                    "Notification attributes rejected"
                );
            }
        }

        let response = self.exchange(CoapRequest::observe(path)).await?;
        self.metrics.record_received(response.payload.len());
        if !response.code.is_success() {
            return Err(ObservationError::Rejected {
                path: path.to_string(),
                code: response.code.to_string(),
            });
        }
        Ok(response.payload)
    }

    /// Cancels every observation at or below
    /// `object_type[/instance[/resource]]` and returns how many were removed.
    ///
    /// With `use_reset` the observation is only forgotten locally and the
    /// device's next notification is answered with a reset. Otherwise a
    /// deregistering `GET` is sent.
    ///
    /// # Errors
    ///
    /// Never fails for protocol races; failed deregistrations are logged.
    /// The `Result` is kept for transports that report hard failures.
    pub async fn cancel_observe(
        &self,
        object_type: u16,
        instance_id: Option<u16>,
        resource_id: Option<u16>,
        use_reset: bool,
    ) -> Result<usize, ObservationError> {
        let scope = ResourcePath::new(object_type, instance_id, resource_id);
        let removed: Vec<ResourcePath> = {
            let mut requests = self.requests.lock();
            let removed = requests
                .iter()
                .filter(|r| r.path.is_within(&scope))
                .map(|r| r.path)
                .collect();
            requests.retain(|r| !r.path.is_within(&scope));
            removed
        };
        self.deregister(&removed, use_reset).await;
        Ok(removed.len())
    }

    /// Cancels every observation of this client.
    pub async fn cancel_all(&self, use_reset: bool) -> usize {
        let removed: Vec<ResourcePath> = self.requests.lock().drain(..).map(|r| r.path).collect();
        self.deregister(&removed, use_reset).await;
        if !removed.is_empty() {
            tracing::debug!(client = %self.client_id, count = removed.len(), "Cancelled all observations");
        }
        removed.len()
    }

    async fn deregister(&self, paths: &[ResourcePath], use_reset: bool) {
        for path in paths {
            if use_reset {
                self.transport.cancel_local(*path).await;
                continue;
            }
            match self.exchange(CoapRequest::cancel_observe(*path)).await {
                Ok(response) if response.code.is_success() => {
                    self.metrics.record_received(response.payload.len());
                }
                Ok(response) => {
                    tracing::debug!(
                        client = %self.client_id,
                        path = %path,
                        code = %response.code,
                        "Device refused observe cancel"
                    );
                }
                Err(e) => {
                    tracing::debug!(client = %self.client_id, path = %path, error = %e, "Observe cancel failed");
                }
            }
        }
    }

    /// Handles a notification for `path` and returns the number of change
    /// events published.
    ///
    /// Notifications for untracked paths and undecodable payloads are
    /// logged and dropped.
    pub async fn on_notification(&self, path: &ResourcePath, payload: &[u8]) -> usize {
        let request = self
            .requests
            .lock()
            .iter()
            .find(|r| r.path == *path)
            .cloned();
        let Some(request) = request else {
            tracing::debug!(client = %self.client_id, path = %path, "Notification for unknown observation");
            return 0;
        };
        self.metrics.record_received(payload.len());

        let objects = match decode(&request, payload) {
            Ok(objects) => objects,
            Err(e) => {
                tracing::warn!(client = %self.client_id, path = %path, error = %e, "Dropping undecodable notification");
                return 0;
            }
        };

        let time_triggered = Utc::now();
        let mut published = 0;
        for object in objects {
            let event = ChangeEvent {
                client_id: self.client_id,
                organisation_id: self.organisation_id,
                object_definition_id: request.definition.id,
                object_type: request.definition.object_id,
                instance_id: object.instance_id,
                changed_properties: object.property_definition_ids(),
                object,
                time_triggered,
            };
            tracing::debug!(
                client = %self.client_id,
                path = %path,
                properties = event.changed_properties.len(),
                "Resource changed"
            );
            self.events
                .publish(PipelineEvent::ResourceChanged(event))
                .await;
            published += 1;
        }
        published
    }
}

/// Decodes a payload against the schema of the observation, back-filling
/// the instance ID from the path.
fn decode(request: &ObserveRequest, payload: &[u8]) -> Result<Vec<Object>, CodecError> {
    let definition = &request.definition;
    let instance_id = request.path.instance_id();

    if let Some(property) = &request.property {
        let object = Object::new(definition.id, instance_id);
        return Ok(tlv::decode_property(definition, property, payload)?
            .map(|p| object.with_property(p))
            .into_iter()
            .collect());
    }

    let mut objects = tlv::decode_objects(definition, payload)?;
    if let Some(instance) = instance_id {
        objects.retain(|o| o.instance_id.is_none_or(|i| i == instance));
        for object in &mut objects {
            object.instance_id = Some(instance);
        }
    }
    Ok(objects)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::model::{PropertyContent, PropertyDataType, PropertyValue};
    use crate::observe::{CoapMethod, CoapResponse, ResponseCode};
    use crate::tlv::{TlvKind, TlvWriter};

    #[derive(Debug, Clone, Default)]
    struct MockTransport {
        sent: Arc<Mutex<Vec<CoapRequest>>>,
        reset: Arc<Mutex<Vec<ResourcePath>>>,
        responses: Arc<Mutex<HashMap<String, CoapResponse>>>,
        offline: Arc<Mutex<bool>>,
    }

    impl MockTransport {
        fn respond(&self, path: &str, response: CoapResponse) {
            self.responses.lock().insert(path.to_string(), response);
        }

        fn observes(&self) -> usize {
            self.sent
                .lock()
                .iter()
                .filter(|r| r.method == CoapMethod::Get && r.observe == Some(0))
                .count()
        }
    }

    impl DeviceTransport for MockTransport {
        async fn send(&self, request: CoapRequest) -> Result<CoapResponse, ObservationError> {
            if *self.offline.lock() {
                return Err(ObservationError::Transport("device offline".to_string()));
            }
            let key = request.path.to_string();
            let method = request.method;
            self.sent.lock().push(request);
            if method == CoapMethod::Put {
                return Ok(CoapResponse::empty(ResponseCode::CHANGED));
            }
            Ok(self
                .responses
                .lock()
                .get(&key)
                .cloned()
                .unwrap_or_else(|| CoapResponse::empty(ResponseCode::CONTENT)))
        }

        async fn cancel_local(&self, path: ResourcePath) {
            self.reset.lock().push(path);
        }
    }

    fn temperature() -> Arc<ObjectDefinition> {
        Arc::new(
            ObjectDefinition::new(3303, "Temperature")
                .with_property(PropertyDefinition::new(
                    5700,
                    "Sensor Value",
                    PropertyDataType::Float,
                ))
                .with_property(PropertyDefinition::new(
                    5701,
                    "Sensor Units",
                    PropertyDataType::String,
                )),
        )
    }

    fn reading(value: f64) -> Vec<u8> {
        let mut writer = TlvWriter::new();
        writer
            .write(TlvKind::ResourceWithValue, 5700, &value.to_be_bytes())
            .unwrap();
        writer.into_bytes()
    }

    fn tracker(transport: MockTransport, events: EventBus) -> ObservationTracker<MockTransport> {
        ObservationTracker::new(ClientId::new(), OrganisationId::new(1), transport, events)
    }

    #[tokio::test]
    async fn observe_is_idempotent() {
        let transport = MockTransport::default();
        let tracker = tracker(transport.clone(), EventBus::new());
        let def = temperature();

        let first = tracker
            .observe(Arc::clone(&def), Some(0), None, None)
            .await
            .unwrap();
        let second = tracker
            .observe(Arc::clone(&def), Some(0), None, None)
            .await
            .unwrap();

        assert_eq!(first, ObserveOutcome::Established { initial: None });
        assert_eq!(second, ObserveOutcome::AlreadyObserved);
        assert_eq!(transport.observes(), 1);
        assert_eq!(tracker.observed_paths().len(), 1);
    }

    #[tokio::test]
    async fn different_scopes_observe_separately() {
        let transport = MockTransport::default();
        let tracker = tracker(transport.clone(), EventBus::new());
        let def = temperature();
        let value = def.property(5700).cloned();

        tracker
            .observe(Arc::clone(&def), Some(0), None, None)
            .await
            .unwrap();
        tracker
            .observe(Arc::clone(&def), Some(0), value, None)
            .await
            .unwrap();
        assert_eq!(transport.observes(), 2);
    }

    #[tokio::test]
    async fn initial_content_is_decoded() {
        let transport = MockTransport::default();
        transport.respond("3303/0", CoapResponse::content(reading(19.0)));
        let tracker = tracker(transport, EventBus::new());

        let outcome = tracker
            .observe(temperature(), Some(0), None, None)
            .await
            .unwrap();
        let ObserveOutcome::Established { initial: Some(object) } = outcome else {
            panic!("expected initial content, got {outcome:?}");
        };
        assert_eq!(object.instance_id, Some(0));
        assert_eq!(
            object.property(5700).unwrap().value(),
            Some(&PropertyValue::Float(19.0))
        );
    }

    #[tokio::test]
    async fn failed_observe_is_not_tracked() {
        let transport = MockTransport::default();
        transport.respond("3303/9", CoapResponse::empty(ResponseCode::NOT_FOUND));
        let tracker = tracker(transport.clone(), EventBus::new());

        let err = tracker
            .observe(temperature(), Some(9), None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, ObservationError::Rejected { ref code, .. } if code == "4.04"));
        assert!(tracker.observed_paths().is_empty());

        *transport.offline.lock() = true;
        assert!(matches!(
            tracker.observe(temperature(), Some(0), None, None).await,
            Err(ObservationError::Transport(_))
        ));
        assert!(tracker.observed_paths().is_empty());
    }

    #[tokio::test]
    async fn attributes_are_written_before_observe() {
        let transport = MockTransport::default();
        let tracker = tracker(transport.clone(), EventBus::new());
        let parameters = NotificationParameters {
            minimum_period: Some(10),
            maximum_period: Some(60),
            ..NotificationParameters::default()
        };

        tracker
            .observe(temperature(), Some(0), None, Some(&parameters))
            .await
            .unwrap();

        let sent = transport.sent.lock();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].method, CoapMethod::Put);
        assert_eq!(sent[0].query.as_deref(), Some("pmin=10&pmax=60"));
        assert_eq!(sent[1].observe, Some(0));
    }

    #[tokio::test]
    async fn cancel_removes_scope() {
        let transport = MockTransport::default();
        let tracker = tracker(transport.clone(), EventBus::new());
        let def = temperature();
        let value = def.property(5700).cloned();

        tracker
            .observe(Arc::clone(&def), Some(0), value, None)
            .await
            .unwrap();
        tracker
            .observe(Arc::clone(&def), Some(0), None, None)
            .await
            .unwrap();
        tracker
            .observe(Arc::clone(&def), Some(1), None, None)
            .await
            .unwrap();

        let removed = tracker.cancel_observe(3303, Some(0), None, false).await.unwrap();
        assert_eq!(removed, 2);
        assert_eq!(
            tracker.observed_paths(),
            vec![ResourcePath::object(3303).with_instance(1)]
        );
        let cancels = transport
            .sent
            .lock()
            .iter()
            .filter(|r| r.observe == Some(1))
            .count();
        assert_eq!(cancels, 2);

        assert_eq!(tracker.cancel_all(true).await, 1);
        assert_eq!(transport.reset.lock().len(), 1);
        assert!(tracker.observed_paths().is_empty());
    }

    #[tokio::test]
    async fn notification_backfills_instance() {
        let events = EventBus::new();
        let mut rx = events.subscribe();
        let tracker = tracker(MockTransport::default(), events);
        let def = temperature();
        tracker
            .observe(Arc::clone(&def), Some(0), None, None)
            .await
            .unwrap();

        let path = ResourcePath::object(3303).with_instance(0);
        assert_eq!(tracker.on_notification(&path, &reading(21.5)).await, 1);

        let PipelineEvent::ResourceChanged(change) = rx.recv().await.unwrap() else {
            panic!("expected a change event");
        };
        assert_eq!(change.instance_id, Some(0));
        assert_eq!(change.object_type, 3303);
        assert_eq!(change.object_definition_id, def.id);
        assert_eq!(change.changed_properties, vec![def.property(5700).unwrap().id]);
        assert!(matches!(
            change.object.property(5700).unwrap().content,
            PropertyContent::Single(PropertyValue::Float(v)) if (v - 21.5).abs() < f64::EPSILON
        ));
        assert_eq!(tracker.metrics().transactions, 2);
        // "3303/0" of the observe request
        assert_eq!(tracker.metrics().bytes_sent, 6);
    }

    #[tokio::test]
    async fn unknown_and_malformed_notifications_are_dropped() {
        let events = EventBus::new();
        let mut rx = events.subscribe();
        let tracker = tracker(MockTransport::default(), events);
        tracker
            .observe(temperature(), Some(0), None, None)
            .await
            .unwrap();

        let unknown = ResourcePath::object(3303).with_instance(5);
        assert_eq!(tracker.on_notification(&unknown, &reading(1.0)).await, 0);

        let path = ResourcePath::object(3303).with_instance(0);
        assert_eq!(tracker.on_notification(&path, &[0xC8, 0x14]).await, 0);
        assert!(rx.try_recv().is_err());
    }
}

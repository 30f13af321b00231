// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! MQTT transport for the message bus.
//!
//! Every queue is a topic, `queues/<name>`. A routing-key binding is
//! announced as a retained message on `bindings/<routing key>/<queue>`.
//! Each connection follows `bindings/#` and publishes a routing key to the
//! topic of every queue bound to it, so two queues bound to one key both
//! get a copy.
//!
//! Durable queues are consumed through `$share/<queue>/queues/<queue>` when
//! shared subscriptions are enabled, so instances compete for a queue's
//! messages. Acknowledgement uses manual MQTT acks, so unacked QoS 1
//! messages are redelivered by the broker after a reconnect with a
//! persistent session.
//!
//! Bindings made by other processes are learned asynchronously; a publish
//! issued right after connecting may not see them yet.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use rumqttc::{AsyncClient, EventLoop, MqttOptions, Publish, QoS};
use tokio::sync::{mpsc, oneshot};

use super::message::{DeliveryTag, PublishMode};
use super::transport::{BusConnection, BusConnector, Delivery, QueueSpec, TransportEvent};
use crate::config::MqttBusConfig;
use crate::error::BusError;

const QUEUE_TOPIC_PREFIX: &str = "queues/";
const BINDING_TOPIC_PREFIX: &str = "bindings/";

fn queue_topic(queue: &str) -> String {
    format!("{QUEUE_TOPIC_PREFIX}{queue}")
}

fn binding_topic(routing_key: &str, queue: &str) -> String {
    format!("{BINDING_TOPIC_PREFIX}{routing_key}/{queue}")
}

fn queue_filter(queue: &str, shared: bool) -> String {
    if shared {
        format!("$share/{queue}/{}", queue_topic(queue))
    } else {
        queue_topic(queue)
    }
}

/// Splits `bindings/<routing key>/<queue>`.
fn parse_binding(topic: &str) -> Option<(&str, &str)> {
    topic
        .strip_prefix(BINDING_TOPIC_PREFIX)?
        .rsplit_once('/')
        .filter(|(key, queue)| !key.is_empty() && !queue.is_empty())
}

fn check_queue_name(name: &str) -> Result<(), BusError> {
    if name.is_empty() || name.contains(['/', '+', '#']) {
        return Err(BusError::InvalidQueue(format!(
            "{name:?} is not a single MQTT topic level"
        )));
    }
    Ok(())
}

fn check_routing_key(key: &str) -> Result<(), BusError> {
    if key.is_empty() || key.contains(['+', '#']) {
        return Err(BusError::InvalidQueue(format!(
            "routing key {key:?} is not a plain MQTT topic"
        )));
    }
    Ok(())
}

/// Opens [`MqttConnection`]s to one broker.
#[derive(Debug, Clone)]
pub struct MqttConnector {
    config: MqttBusConfig,
}

impl MqttConnector {
    /// Creates a connector.
    #[must_use]
    pub fn new(config: MqttBusConfig) -> Self {
        Self { config }
    }
}

#[derive(Debug, Default)]
struct Shared {
    /// Routing key to bound queues.
    routes: Mutex<HashMap<String, HashSet<String>>>,
    /// Consumed queue to its subscription filter.
    consumed: Mutex<HashMap<String, String>>,
    /// Retained bindings of temporary queues, cleared on close.
    temporary_bindings: Mutex<HashSet<String>>,
    /// Delivered, not yet acked.
    unacked: Mutex<HashMap<u64, Publish>>,
    next_tag: AtomicU64,
}

impl Shared {
    /// Applies a binding announcement; an empty payload removes it.
    fn learn_binding(&self, topic: &str, payload: &[u8]) {
        let Some((routing_key, queue)) = parse_binding(topic) else {
            tracing::trace!(topic = %topic, "Ignoring malformed binding");
            return;
        };
        let mut routes = self.routes.lock();
        if payload.is_empty() {
            if let Some(queues) = routes.get_mut(routing_key) {
                queues.remove(queue);
                if queues.is_empty() {
                    routes.remove(routing_key);
                }
            }
        } else {
            routes
                .entry(routing_key.to_string())
                .or_default()
                .insert(queue.to_string());
        }
    }

    fn bound_queues(&self, routing_key: &str) -> Vec<String> {
        let mut queues: Vec<String> = self
            .routes
            .lock()
            .get(routing_key)
            .map(|q| q.iter().cloned().collect())
            .unwrap_or_default();
        queues.sort();
        queues
    }

    fn consumed_queue(&self, topic: &str) -> Option<String> {
        let queue = topic.strip_prefix(QUEUE_TOPIC_PREFIX)?;
        self.consumed
            .lock()
            .contains_key(queue)
            .then(|| queue.to_string())
    }
}

impl BusConnector for MqttConnector {
    type Connection = MqttConnection;

    async fn connect(
        &self,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<MqttConnection, BusError> {
        let mut options = MqttOptions::new(&self.config.client_id, &self.config.host, self.config.port);
        options.set_keep_alive(self.config.keep_alive);
        options.set_clean_session(false);
        options.set_manual_acks(true);
        if let Some((ref username, ref password)) = self.config.credentials {
            options.set_credentials(username, password);
        }

        let (client, event_loop) = AsyncClient::new(options, 64);
        let shared = Arc::new(Shared::default());

        let (connack_tx, connack_rx) = oneshot::channel();
        tokio::spawn(handle_events(
            event_loop,
            Arc::clone(&shared),
            events,
            connack_tx,
        ));

        let timeout = self.config.connect_timeout;
        match tokio::time::timeout(timeout, connack_rx).await {
            Ok(Ok(())) => {
                client
                    .subscribe(format!("{BINDING_TOPIC_PREFIX}#"), QoS::AtMostOnce)
                    .await?;
                tracing::info!(
                    host = %self.config.host,
                    port = %self.config.port,
                    "Connected to MQTT bus"
                );
                Ok(MqttConnection {
                    client,
                    shared,
                    shared_subscriptions: self.config.shared_subscriptions,
                })
            }
            Ok(Err(_)) => Err(BusError::ConnectionFailed(format!(
                "MQTT broker {}:{} refused the connection",
                self.config.host, self.config.port
            ))),
            Err(_) => {
                let _ = client.try_disconnect();
                Err(BusError::ConnectionFailed(format!(
                    "MQTT connection timeout after {}s",
                    timeout.as_secs()
                )))
            }
        }
    }
}

async fn handle_events(
    mut event_loop: EventLoop,
    shared: Arc<Shared>,
    events: mpsc::UnboundedSender<TransportEvent>,
    connack_tx: oneshot::Sender<()>,
) {
    use rumqttc::{Event, Packet};

    let mut connack_tx = Some(connack_tx);

    loop {
        match event_loop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(connack))) => {
                tracing::debug!(?connack, "MQTT bus connected");
                if let Some(tx) = connack_tx.take() {
                    let _ = tx.send(());
                }
            }
            Ok(Event::Incoming(Packet::SubAck(suback))) => {
                tracing::debug!(?suback, "MQTT subscription acknowledged");
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                if publish.topic.starts_with(BINDING_TOPIC_PREFIX) {
                    shared.learn_binding(&publish.topic, &publish.payload);
                    continue;
                }
                let Some(queue) = shared.consumed_queue(&publish.topic) else {
                    // left unacked; the broker redelivers it after a reconnect
                    tracing::trace!(topic = %publish.topic, "Message for a queue not consumed");
                    continue;
                };
                let id = shared.next_tag.fetch_add(1, Ordering::Relaxed) + 1;
                let delivery = Delivery {
                    tag: DeliveryTag { id, queue },
                    body: publish.payload.to_vec(),
                };
                shared.unacked.lock().insert(id, publish);
                if events.send(TransportEvent::Delivery(delivery)).is_err() {
                    break;
                }
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                tracing::info!("MQTT bus disconnected by broker");
                let _ = events.send(TransportEvent::ConnectionLost(
                    "broker sent disconnect".to_string(),
                ));
                break;
            }
            Ok(_) => {}
            Err(e) => {
                if connack_tx.is_none() {
                    tracing::warn!(error = %e, "MQTT bus event loop error");
                    let _ = events.send(TransportEvent::ConnectionLost(e.to_string()));
                } else {
                    tracing::debug!(error = %e, "MQTT bus connect failed");
                }
                break;
            }
        }
    }
}

/// A live MQTT bus connection.
#[derive(Debug)]
pub struct MqttConnection {
    client: AsyncClient,
    shared: Arc<Shared>,
    shared_subscriptions: bool,
}

impl BusConnection for MqttConnection {
    async fn consume(&self, spec: &QueueSpec) -> Result<(), BusError> {
        check_queue_name(&spec.name)?;
        if let Some(key) = &spec.routing_key {
            check_routing_key(key)?;
        }

        let filter = queue_filter(&spec.name, self.shared_subscriptions && !spec.temporary);
        self.shared
            .consumed
            .lock()
            .insert(spec.name.clone(), filter.clone());
        self.client.subscribe(filter, QoS::AtLeastOnce).await?;

        if let Some(key) = &spec.routing_key {
            let topic = binding_topic(key, &spec.name);
            self.shared.learn_binding(&topic, spec.name.as_bytes());
            if spec.temporary {
                self.shared.temporary_bindings.lock().insert(topic.clone());
            }
            self.client
                .publish(topic, QoS::AtLeastOnce, true, spec.name.clone().into_bytes())
                .await?;
        }
        tracing::debug!(queue = %spec.name, "MQTT queue consumed");
        Ok(())
    }

    async fn cancel(&self, queue: &str) -> Result<(), BusError> {
        let filter = self.shared.consumed.lock().remove(queue);
        if let Some(filter) = filter {
            self.client.unsubscribe(filter).await?;
        }
        Ok(())
    }

    async fn publish(
        &self,
        routing_key: &str,
        body: Vec<u8>,
        mode: PublishMode,
    ) -> Result<(), BusError> {
        let qos = match mode {
            PublishMode::Direct => QoS::AtMostOnce,
            PublishMode::Persistent | PublishMode::Confirms => QoS::AtLeastOnce,
        };
        let queues = self.shared.bound_queues(routing_key);
        if queues.is_empty() {
            tracing::trace!(routing_key = %routing_key, "Unroutable message dropped");
        }
        for queue in queues {
            self.client
                .publish(queue_topic(&queue), qos, false, body.clone())
                .await?;
        }
        Ok(())
    }

    async fn send_to_queue(&self, queue: &str, body: Vec<u8>) -> Result<(), BusError> {
        self.client
            .publish(queue_topic(queue), QoS::AtLeastOnce, false, body)
            .await?;
        Ok(())
    }

    async fn ack(&self, tag: &DeliveryTag) -> Result<(), BusError> {
        let publish = self.shared.unacked.lock().remove(&tag.id);
        if let Some(publish) = publish {
            self.client.ack(&publish).await?;
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), BusError> {
        let bindings: Vec<String> = self.shared.temporary_bindings.lock().drain().collect();
        for topic in bindings {
            self.client
                .publish(topic, QoS::AtLeastOnce, true, Vec::<u8>::new())
                .await?;
        }
        self.client.disconnect().await?;
        Ok(())
    }
}

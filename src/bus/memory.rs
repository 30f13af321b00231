// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! In-process broker.
//!
//! Queues, routing-key bindings, acknowledgement and redelivery behave like
//! a single-node broker. Used for tests and single-process deployments.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::message::{DeliveryTag, PublishMode};
use super::transport::{BusConnection, BusConnector, Delivery, QueueSpec, TransportEvent};
use crate::error::BusError;

#[derive(Debug, Default)]
struct QueueState {
    durable: bool,
    temporary: bool,
    owner: Option<u64>,
    bindings: HashSet<String>,
    pending: VecDeque<Vec<u8>>,
    consumer: Option<u64>,
    unacked: HashMap<u64, Vec<u8>>,
}

#[derive(Debug)]
struct BrokerState {
    queues: HashMap<String, QueueState>,
    connections: HashMap<u64, mpsc::UnboundedSender<TransportEvent>>,
    next_connection: u64,
    next_tag: u64,
    available: bool,
    connect_count: usize,
}

impl BrokerState {
    /// Hands pending messages of `queue` to its consumer.
    fn flush(&mut self, queue: &str) {
        let Some(state) = self.queues.get_mut(queue) else {
            return;
        };
        let Some(consumer) = state.consumer else {
            return;
        };
        let Some(sender) = self.connections.get(&consumer) else {
            state.consumer = None;
            return;
        };

        while let Some(body) = state.pending.pop_front() {
            self.next_tag += 1;
            let tag = DeliveryTag {
                id: self.next_tag,
                queue: queue.to_string(),
            };
            let delivery = Delivery {
                tag,
                body: body.clone(),
            };
            if sender.send(TransportEvent::Delivery(delivery)).is_err() {
                state.pending.push_front(body);
                state.consumer = None;
                return;
            }
            state.unacked.insert(self.next_tag, body);
        }
    }

    fn requeue_unacked(state: &mut QueueState) {
        let mut tags: Vec<u64> = state.unacked.keys().copied().collect();
        tags.sort_unstable();
        for tag in tags.into_iter().rev() {
            if let Some(body) = state.unacked.remove(&tag) {
                state.pending.push_front(body);
            }
        }
    }

    fn close(&mut self, connection: u64) {
        self.connections.remove(&connection);
        self.queues
            .retain(|_, q| !(q.temporary && q.owner == Some(connection)));
        for queue in self.queues.values_mut() {
            if queue.consumer == Some(connection) {
                queue.consumer = None;
                Self::requeue_unacked(queue);
            }
        }
    }
}

/// In-process broker. Clones share state.
#[derive(Debug, Clone)]
pub struct InMemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl InMemoryBroker {
    /// Creates an empty broker.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(BrokerState {
                queues: HashMap::new(),
                connections: HashMap::new(),
                next_connection: 0,
                next_tag: 0,
                available: true,
                connect_count: 0,
            })),
        }
    }

    /// Drops every connection and every non-durable queue with its
    /// messages, as a broker restart would.
    pub fn disconnect_all(&self) {
        let mut state = self.state.lock();
        let ids: Vec<u64> = state.connections.keys().copied().collect();
        for id in ids {
            if let Some(sender) = state.connections.get(&id) {
                let _ = sender.send(TransportEvent::ConnectionLost(
                    "broker closed the connection".to_string(),
                ));
            }
            state.close(id);
        }
        state.queues.retain(|_, q| q.durable);
        tracing::debug!("In-memory broker dropped all connections");
    }

    /// Makes new connection attempts fail while `false`.
    pub fn set_available(&self, available: bool) {
        self.state.lock().available = available;
    }

    /// Names of declared queues, sorted.
    #[must_use]
    pub fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.state.lock().queues.keys().cloned().collect();
        names.sort();
        names
    }

    /// Number of successful connects so far.
    #[must_use]
    pub fn connect_count(&self) -> usize {
        self.state.lock().connect_count
    }

    /// Number of open connections.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.state.lock().connections.len()
    }

    /// Messages waiting in a queue.
    #[must_use]
    pub fn pending(&self, queue: &str) -> usize {
        self.state
            .lock()
            .queues
            .get(queue)
            .map_or(0, |q| q.pending.len())
    }

    /// Delivered but unacknowledged messages across all queues.
    #[must_use]
    pub fn unacked_count(&self) -> usize {
        self.state
            .lock()
            .queues
            .values()
            .map(|q| q.unacked.len())
            .sum()
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl BusConnector for InMemoryBroker {
    type Connection = MemoryConnection;

    async fn connect(
        &self,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<MemoryConnection, BusError> {
        let mut state = self.state.lock();
        if !state.available {
            return Err(BusError::ConnectionFailed(
                "in-memory broker unavailable".to_string(),
            ));
        }
        state.next_connection += 1;
        let id = state.next_connection;
        state.connections.insert(id, events);
        state.connect_count += 1;
        Ok(MemoryConnection {
            id,
            state: Arc::clone(&self.state),
        })
    }
}

/// A connection to an [`InMemoryBroker`].
#[derive(Debug)]
pub struct MemoryConnection {
    id: u64,
    state: Arc<Mutex<BrokerState>>,
}

impl MemoryConnection {
    fn check_open(&self, state: &BrokerState) -> Result<(), BusError> {
        if state.connections.contains_key(&self.id) {
            Ok(())
        } else {
            Err(BusError::NotConnected)
        }
    }
}

impl BusConnection for MemoryConnection {
    async fn consume(&self, spec: &QueueSpec) -> Result<(), BusError> {
        let mut state = self.state.lock();
        self.check_open(&state)?;

        let queue = state
            .queues
            .entry(spec.name.clone())
            .or_insert_with(|| QueueState {
                durable: spec.durable,
                temporary: spec.temporary,
                owner: spec.temporary.then_some(self.id),
                ..QueueState::default()
            });
        if let Some(key) = &spec.routing_key {
            queue.bindings.insert(key.clone());
        }
        queue.consumer = Some(self.id);
        state.flush(&spec.name);
        Ok(())
    }

    async fn cancel(&self, queue: &str) -> Result<(), BusError> {
        let mut state = self.state.lock();
        self.check_open(&state)?;
        if let Some(q) = state.queues.get_mut(queue)
            && q.consumer == Some(self.id)
        {
            q.consumer = None;
            BrokerState::requeue_unacked(q);
        }
        Ok(())
    }

    async fn publish(
        &self,
        routing_key: &str,
        body: Vec<u8>,
        _mode: PublishMode,
    ) -> Result<(), BusError> {
        let mut state = self.state.lock();
        self.check_open(&state)?;
        let targets: Vec<String> = state
            .queues
            .iter()
            .filter(|(_, q)| q.bindings.contains(routing_key))
            .map(|(name, _)| name.clone())
            .collect();
        if targets.is_empty() {
            tracing::trace!(routing_key = %routing_key, "Unroutable message dropped");
        }
        for name in targets {
            if let Some(q) = state.queues.get_mut(&name) {
                q.pending.push_back(body.clone());
            }
            state.flush(&name);
        }
        Ok(())
    }

    async fn send_to_queue(&self, queue: &str, body: Vec<u8>) -> Result<(), BusError> {
        let mut state = self.state.lock();
        self.check_open(&state)?;
        let q = state
            .queues
            .get_mut(queue)
            .ok_or_else(|| BusError::InvalidQueue(queue.to_string()))?;
        q.pending.push_back(body);
        state.flush(queue);
        Ok(())
    }

    async fn ack(&self, tag: &DeliveryTag) -> Result<(), BusError> {
        let mut state = self.state.lock();
        self.check_open(&state)?;
        if let Some(q) = state.queues.get_mut(&tag.queue) {
            q.unacked.remove(&tag.id);
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), BusError> {
        self.state.lock().close(self.id);
        Ok(())
    }
}

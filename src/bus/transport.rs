// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Broker transport abstraction.
//!
//! A [`BusConnector`] opens connections; a [`BusConnection`] declares and
//! consumes queues, publishes and acknowledges. Deliveries and connection
//! loss are reported through the event channel handed to
//! [`BusConnector::connect`].

use std::future::Future;

use tokio::sync::mpsc;

use super::message::{DeliveryTag, PublishMode};
use crate::error::BusError;

/// Resolved description of a queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSpec {
    /// Broker-level queue name.
    pub name: String,
    /// Survives broker restarts and consumer disconnects.
    pub durable: bool,
    /// Deleted when the owning connection goes away.
    pub temporary: bool,
    /// Routing key bound to the queue.
    pub routing_key: Option<String>,
}

/// A message handed over by the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Ack handle.
    pub tag: DeliveryTag,
    /// Serialized envelope.
    pub body: Vec<u8>,
}

/// Events emitted by a live connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A message arrived on a consumed queue.
    Delivery(Delivery),
    /// The connection is gone; no further events follow.
    ConnectionLost(String),
}

/// Opens broker connections.
pub trait BusConnector: Send + Sync + 'static {
    /// The connection type.
    type Connection: BusConnection;

    /// Connects to the broker. Events of the new connection are sent to
    /// `events`.
    fn connect(
        &self,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> impl Future<Output = Result<Self::Connection, BusError>> + Send;
}

/// A live broker connection.
pub trait BusConnection: Send + Sync + 'static {
    /// Declares the queue if needed, binds its routing key and starts
    /// consuming. Calling it for a queue already consumed is a no-op.
    fn consume(&self, spec: &QueueSpec) -> impl Future<Output = Result<(), BusError>> + Send;

    /// Stops consuming a queue. Unacked messages become available again.
    fn cancel(&self, queue: &str) -> impl Future<Output = Result<(), BusError>> + Send;

    /// Publishes to every queue bound to `routing_key`.
    fn publish(
        &self,
        routing_key: &str,
        body: Vec<u8>,
        mode: PublishMode,
    ) -> impl Future<Output = Result<(), BusError>> + Send;

    /// Sends directly to one queue.
    fn send_to_queue(
        &self,
        queue: &str,
        body: Vec<u8>,
    ) -> impl Future<Output = Result<(), BusError>> + Send;

    /// Acknowledges a delivery.
    fn ack(&self, tag: &DeliveryTag) -> impl Future<Output = Result<(), BusError>> + Send;

    /// Closes the connection.
    fn close(&self) -> impl Future<Output = Result<(), BusError>> + Send;
}

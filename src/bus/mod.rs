// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Resilient message bus.
//!
//! [`MessageBus`] sits on top of a pluggable transport:
//!
//! - [`InMemoryBroker`]: in-process queues, for tests and single-node use
//! - [`MqttConnector`]: an MQTT broker (feature `mqtt`)
//!
//! Handlers receive [`ServiceEventMessage`]s and decide acknowledgement
//! themselves. Subscriptions are replayed after reconnects.

pub mod memory;
pub mod message;
pub mod message_bus;
#[cfg(feature = "mqtt")]
pub mod mqtt;
pub mod transport;

pub use memory::{InMemoryBroker, MemoryConnection};
pub use message::{DeliveryTag, MessageParameter, PublishMode, ServiceEventMessage, params};
pub use message_bus::{
    HandlerFuture, MessageBus, MessageHandler, QueueOptions, current_organisation, handler,
    with_organisation,
};
#[cfg(feature = "mqtt")]
pub use mqtt::{MqttConnection, MqttConnector};
pub use transport::{BusConnection, BusConnector, Delivery, QueueSpec, TransportEvent};

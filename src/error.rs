// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Error types for the notification pipeline.
//!
//! Errors are grouped by the layer they come from: the TLV codec, the message
//! bus, device observations, webhook delivery and the external stores. Most
//! of them never escape the pipeline; the components log them and drop the
//! offending message instead.

use thiserror::Error;

/// The main error type for this library.
#[derive(Debug, Error)]
pub enum Error {
    /// The binary resource payload could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// The message bus failed.
    #[error("bus error: {0}")]
    Bus(#[from] BusError),

    /// A device observation could not be established or cancelled.
    #[error("observation error: {0}")]
    Observation(#[from] ObservationError),

    /// A webhook could not be delivered.
    #[error("delivery error: {0}")]
    Delivery(#[from] DeliveryError),

    /// The subscription or definition store failed.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Configuration is invalid.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// The table-change notification channel failed.
    #[error("change notification error: {0}")]
    ChangeNotification(#[from] ChangeNotificationError),

    /// No object definition is known for the requested type.
    #[error("unknown object definition: {0}")]
    UnknownDefinition(String),
}

/// Errors raised while reading or writing TLV payloads.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// A length prefix points past the end of the buffer.
    #[error("truncated TLV entry at offset {offset}: needed {needed} bytes, {available} available")]
    Truncated {
        /// Offset of the entry header.
        offset: usize,
        /// Bytes required by the header.
        needed: usize,
        /// Bytes left in the buffer.
        available: usize,
    },

    /// A value has a width the data type does not allow.
    #[error("invalid length {length} for {kind} value of resource {resource_id}")]
    InvalidLength {
        /// The resource being decoded.
        resource_id: u16,
        /// Expected value kind.
        kind: &'static str,
        /// The offending length.
        length: usize,
    },

    /// A value could not be interpreted.
    #[error("invalid value for resource {resource_id}: {message}")]
    InvalidValue {
        /// The resource being decoded.
        resource_id: u16,
        /// What went wrong.
        message: String,
    },

    /// A mandatory entity field was not present.
    #[error("missing mandatory field {0}")]
    MissingField(&'static str),

    /// The value does not fit the declared property type.
    #[error("value for resource {resource_id} does not match data type {expected}")]
    TypeMismatch {
        /// The resource being encoded.
        resource_id: u16,
        /// The declared data type.
        expected: &'static str,
    },
}

/// Errors related to the message bus.
#[derive(Debug, Error)]
pub enum BusError {
    /// Connecting to the broker failed.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// The operation needs a live connection and there is none.
    #[error("bus is not connected")]
    NotConnected,

    /// The bus has been stopped.
    #[error("bus has been stopped")]
    Stopped,

    /// The message did not come from a delivery and cannot be acked or nacked.
    #[error("message {0} has no delivery tag")]
    NotDelivered(uuid::Uuid),

    /// A queue name was rejected.
    #[error("invalid queue: {0}")]
    InvalidQueue(String),

    /// The message envelope could not be (de)serialized.
    #[error("envelope serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// MQTT client failure.
    #[cfg(feature = "mqtt")]
    #[error("MQTT error: {0}")]
    Mqtt(#[from] rumqttc::ClientError),

    /// In-flight handlers did not finish in time during shutdown.
    #[error("shutdown timed out after {0} ms")]
    ShutdownTimeout(u64),
}

/// Errors related to device observations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ObservationError {
    /// The device transport failed to carry the request.
    #[error("transport failure: {0}")]
    Transport(String),

    /// The device answered with an error response code.
    #[error("device rejected {path}: {code}")]
    Rejected {
        /// The requested path.
        path: String,
        /// The CoAP response code, in `c.dd` notation.
        code: String,
    },

    /// A resource path could not be parsed.
    #[error("invalid resource path: {0}")]
    InvalidPath(String),
}

/// Errors related to webhook delivery.
#[derive(Debug, Error)]
pub enum DeliveryError {
    /// The HTTP request failed before a response arrived.
    #[cfg(feature = "webhook")]
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The subscriber answered with a non-success status.
    #[error("subscriber answered HTTP {0}")]
    Status(u16),

    /// The payload could not be serialized.
    #[error("payload serialization failed: {0}")]
    Serialization(String),

    /// The dispatched message is missing a required parameter.
    #[error("missing message parameter: {0}")]
    MissingParameter(&'static str),

    /// A message parameter has an unexpected shape.
    #[error("invalid message parameter {name}: {message}")]
    InvalidParameter {
        /// The parameter name.
        name: &'static str,
        /// What went wrong.
        message: String,
    },
}

/// Errors reported by the external stores.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The store is not reachable.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// The stored record is inconsistent.
    #[error("invalid record {id}: {message}")]
    InvalidRecord {
        /// The record identifier.
        id: String,
        /// What is wrong with it.
        message: String,
    },
}

/// Errors of the table-change notification protocol.
#[derive(Debug, Error)]
pub enum ChangeNotificationError {
    /// Socket I/O failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A frame could not be parsed.
    #[error("malformed frame: {0:?}")]
    Malformed(String),

    /// The server has shut down.
    #[error("change notification server is closed")]
    Closed,
}

/// Errors related to configuration.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A mandatory setting is empty.
    #[error("{0} must not be empty")]
    Empty(&'static str),

    /// A setting is out of range.
    #[error("{name} is invalid: {message}")]
    Invalid {
        /// The setting name.
        name: &'static str,
        /// Why it is invalid.
        message: String,
    },
}

/// A specialized Result type for this library.
pub type Result<T> = std::result::Result<T, Error>;

// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The bus envelope.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::BusError;
use crate::model::OrganisationId;

/// Well-known parameter names.
pub mod params {
    /// Number of times the message was requeued.
    pub const REQUEUE_COUNT: &str = "RequeueCount";
    /// Organisation the message belongs to.
    pub const ORGANISATION_ID: &str = "OrganisationID";
    /// Matched subscription.
    pub const SUBSCRIPTION_ID: &str = "SubscriptionID";
    /// Kind of the matched subscription.
    pub const SUBSCRIPTION_TYPE: &str = "SubscriptionType";
    /// Client the event is about.
    pub const CLIENT_ID: &str = "ClientID";
    /// Webhook URL.
    pub const URL: &str = "Url";
    /// Content type the subscriber accepts.
    pub const ACCEPT_CONTENT_TYPE: &str = "AcceptContentType";
    /// When the event was triggered.
    pub const TIME_TRIGGERED: &str = "TimeTriggered";
    /// Changed object, as JSON.
    pub const OBJECT: &str = "Object";
    /// LWM2M object type of the changed object.
    pub const OBJECT_TYPE: &str = "ObjectType";
}

/// Delivery guarantee of a publish.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PublishMode {
    /// Fire and forget.
    Direct,
    /// Stored by the broker.
    #[default]
    Persistent,
    /// Stored and confirmed by the broker (at least once).
    Confirms,
}

/// A parameter value: plain string or structured JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageParameter {
    /// A string value.
    String(String),
    /// A JSON value.
    Object(serde_json::Value),
}

impl From<String> for MessageParameter {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<&str> for MessageParameter {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<serde_json::Value> for MessageParameter {
    fn from(value: serde_json::Value) -> Self {
        Self::Object(value)
    }
}

/// Identifies a delivery so it can be acked or nacked.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeliveryTag {
    /// Transport-assigned tag.
    pub id: u64,
    /// Queue the message was delivered from.
    pub queue: String,
}

/// The bus envelope.
///
/// # Examples
///
/// ```
/// use lwm2m_notify::bus::{ServiceEventMessage, params};
///
/// let message = ServiceEventMessage::new()
///     .with_parameter(params::URL, "http://example.com/hook");
///
/// assert_eq!(message.string(params::URL), Some("http://example.com/hook"));
/// assert_eq!(message.requeue_count(), 0);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ServiceEventMessage {
    /// Unique message ID.
    pub message_id: Uuid,
    /// Named parameters.
    pub parameters: BTreeMap<String, MessageParameter>,
    /// Where replies should be published.
    pub response_routing_key: Option<String>,
    /// When the message was published.
    pub timestamp: DateTime<Utc>,
    /// Delivery guarantee.
    pub publish_mode: PublishMode,
    /// Earliest redelivery time of a delayed requeue.
    pub delayed_requeue_time: Option<DateTime<Utc>>,
    /// Set on messages received from the bus.
    #[serde(skip)]
    pub delivery_tag: Option<DeliveryTag>,
}

impl ServiceEventMessage {
    /// Creates an empty message with a fresh ID.
    #[must_use]
    pub fn new() -> Self {
        Self {
            message_id: Uuid::new_v4(),
            parameters: BTreeMap::new(),
            response_routing_key: None,
            timestamp: Utc::now(),
            publish_mode: PublishMode::default(),
            delayed_requeue_time: None,
            delivery_tag: None,
        }
    }

    /// Adds a parameter.
    #[must_use]
    pub fn with_parameter(
        mut self,
        name: impl Into<String>,
        value: impl Into<MessageParameter>,
    ) -> Self {
        self.set_parameter(name, value);
        self
    }

    /// Sets the reply routing key.
    #[must_use]
    pub fn with_response_routing_key(mut self, key: impl Into<String>) -> Self {
        self.response_routing_key = Some(key.into());
        self
    }

    /// Sets or replaces a parameter.
    pub fn set_parameter(&mut self, name: impl Into<String>, value: impl Into<MessageParameter>) {
        self.parameters.insert(name.into(), value.into());
    }

    /// Returns `true` if the parameter is present.
    #[must_use]
    pub fn has_parameter(&self, name: &str) -> bool {
        self.parameters.contains_key(name)
    }

    /// Returns a string parameter.
    #[must_use]
    pub fn string(&self, name: &str) -> Option<&str> {
        match self.parameters.get(name)? {
            MessageParameter::String(s) => Some(s),
            MessageParameter::Object(_) => None,
        }
    }

    /// Returns a JSON parameter.
    #[must_use]
    pub fn object(&self, name: &str) -> Option<&serde_json::Value> {
        match self.parameters.get(name)? {
            MessageParameter::Object(v) => Some(v),
            MessageParameter::String(_) => None,
        }
    }

    /// Returns the organisation tag, if present and well formed.
    #[must_use]
    pub fn organisation_id(&self) -> Option<OrganisationId> {
        self.string(params::ORGANISATION_ID)?.parse().ok()
    }

    /// Returns how many times the message was requeued.
    #[must_use]
    pub fn requeue_count(&self) -> u32 {
        self.string(params::REQUEUE_COUNT)
            .and_then(|s| s.parse().ok())
            .unwrap_or(0)
    }

    /// Sets the requeue counter.
    pub fn set_requeue_count(&mut self, count: u32) {
        self.set_parameter(params::REQUEUE_COUNT, count.to_string());
    }

    /// Serializes the envelope for the wire.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::Serialization`] on failure.
    pub fn to_bytes(&self) -> Result<Vec<u8>, BusError> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Parses an envelope received from the wire.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::Serialization`] if the bytes are not an envelope.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, BusError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

impl Default for ServiceEventMessage {
    fn default() -> Self {
        Self::new()
    }
}

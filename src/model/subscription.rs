// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Standing subscriptions.
//!
//! A subscription is either an *observation* of a resource scope on one
//! client, or a *lifecycle* subscription to client connect, update,
//! disconnect or expiry events of an organisation.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{ClientId, OrganisationId, SubscriptionId};
use crate::error::StoreError;

/// Kind of subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SubscriptionType {
    /// Resource value changes.
    Observation,
    /// A client registered.
    ClientConnected,
    /// A client deregistered.
    ClientDisconnected,
    /// A client refreshed its registration.
    ClientUpdated,
    /// A client's lifetime elapsed without refresh.
    ClientConnectionExpired,
}

impl SubscriptionType {
    /// Returns `true` for the client lifecycle kinds.
    #[must_use]
    pub fn is_lifecycle(self) -> bool {
        !matches!(self, Self::Observation)
    }

    /// Returns the wire name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Observation => "Observation",
            Self::ClientConnected => "ClientConnected",
            Self::ClientDisconnected => "ClientDisconnected",
            Self::ClientUpdated => "ClientUpdated",
            Self::ClientConnectionExpired => "ClientConnectionExpired",
        }
    }
}

impl fmt::Display for SubscriptionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SubscriptionType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Observation" => Ok(Self::Observation),
            "ClientConnected" => Ok(Self::ClientConnected),
            "ClientDisconnected" => Ok(Self::ClientDisconnected),
            "ClientUpdated" => Ok(Self::ClientUpdated),
            "ClientConnectionExpired" => Ok(Self::ClientConnectionExpired),
            other => Err(format!("unknown subscription type: {other}")),
        }
    }
}

/// Notification attributes sent to the device with an observation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NotificationParameters {
    /// Minimum period between notifications, in seconds.
    pub minimum_period: Option<u32>,
    /// Maximum period between notifications, in seconds.
    pub maximum_period: Option<u32>,
    /// Notify when the value rises above this threshold.
    pub greater_than: Option<f64>,
    /// Notify when the value falls below this threshold.
    pub less_than: Option<f64>,
    /// Notify when the value changes by at least this much.
    pub step: Option<f64>,
}

impl NotificationParameters {
    /// Returns `true` if no attribute is set.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.minimum_period.is_none()
            && self.maximum_period.is_none()
            && self.greater_than.is_none()
            && self.less_than.is_none()
            && self.step.is_none()
    }

    /// Formats the attributes as a CoAP query (`pmin=10&pmax=60`).
    #[must_use]
    pub fn to_query(&self) -> String {
        let mut parts = Vec::new();
        if let Some(v) = self.minimum_period {
            parts.push(format!("pmin={v}"));
        }
        if let Some(v) = self.maximum_period {
            parts.push(format!("pmax={v}"));
        }
        if let Some(v) = self.greater_than {
            parts.push(format!("gt={v}"));
        }
        if let Some(v) = self.less_than {
            parts.push(format!("lt={v}"));
        }
        if let Some(v) = self.step {
            parts.push(format!("st={v}"));
        }
        parts.join("&")
    }
}

/// What a subscription targets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SubscriptionScope {
    /// A resource scope on one client.
    Resource {
        /// The observed client.
        client_id: ClientId,
        /// The object definition.
        object_definition_id: Uuid,
        /// Instance filter; `None` matches any instance.
        instance_id: Option<u16>,
        /// Property filter; `None` matches any property.
        property_definition_id: Option<Uuid>,
    },
    /// Client lifecycle events of an organisation.
    Lifecycle,
}

/// A standing interest in changes or lifecycle events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscription {
    /// Unique ID.
    pub id: SubscriptionId,
    /// Owning organisation.
    pub organisation_id: OrganisationId,
    /// Kind of subscription.
    pub subscription_type: SubscriptionType,
    /// Target scope.
    pub scope: SubscriptionScope,
    /// Webhook URL.
    pub url: String,
    /// Content type the subscriber accepts.
    pub accept_content_type: String,
    /// Optional notification attributes.
    pub parameters: Option<NotificationParameters>,
}

impl Subscription {
    /// Default accepted content type.
    pub const DEFAULT_CONTENT_TYPE: &'static str = "application/vnd.lwm2m.notification+json";

    /// Creates an observation subscription.
    #[must_use]
    pub fn observation(
        organisation_id: OrganisationId,
        client_id: ClientId,
        object_definition_id: Uuid,
        url: impl Into<String>,
    ) -> Self {
        Self {
            id: SubscriptionId::new(),
            organisation_id,
            subscription_type: SubscriptionType::Observation,
            scope: SubscriptionScope::Resource {
                client_id,
                object_definition_id,
                instance_id: None,
                property_definition_id: None,
            },
            url: url.into(),
            accept_content_type: Self::DEFAULT_CONTENT_TYPE.to_string(),
            parameters: None,
        }
    }

    /// Creates a lifecycle subscription.
    #[must_use]
    pub fn lifecycle(
        organisation_id: OrganisationId,
        subscription_type: SubscriptionType,
        url: impl Into<String>,
    ) -> Self {
        Self {
            id: SubscriptionId::new(),
            organisation_id,
            subscription_type,
            scope: SubscriptionScope::Lifecycle,
            url: url.into(),
            accept_content_type: Self::DEFAULT_CONTENT_TYPE.to_string(),
            parameters: None,
        }
    }

    /// Restricts an observation to one instance.
    #[must_use]
    pub fn with_instance(mut self, instance: u16) -> Self {
        if let SubscriptionScope::Resource { instance_id, .. } = &mut self.scope {
            *instance_id = Some(instance);
        }
        self
    }

    /// Restricts an observation to one property.
    #[must_use]
    pub fn with_property(mut self, property: Uuid) -> Self {
        if let SubscriptionScope::Resource {
            property_definition_id,
            ..
        } = &mut self.scope
        {
            *property_definition_id = Some(property);
        }
        self
    }

    /// Sets the accepted content type.
    #[must_use]
    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.accept_content_type = content_type.into();
        self
    }

    /// Sets notification attributes.
    #[must_use]
    pub fn with_parameters(mut self, parameters: NotificationParameters) -> Self {
        self.parameters = Some(parameters);
        self
    }

    /// Returns the observed client for observation subscriptions.
    #[must_use]
    pub fn client_id(&self) -> Option<ClientId> {
        match self.scope {
            SubscriptionScope::Resource { client_id, .. } => Some(client_id),
            SubscriptionScope::Lifecycle => None,
        }
    }

    /// Checks that the scope agrees with the subscription type.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::InvalidRecord`] if an observation carries a
    /// lifecycle scope or the other way around.
    pub fn validate(&self) -> Result<(), StoreError> {
        let consistent = match self.scope {
            SubscriptionScope::Resource { .. } => !self.subscription_type.is_lifecycle(),
            SubscriptionScope::Lifecycle => self.subscription_type.is_lifecycle(),
        };
        if consistent {
            Ok(())
        } else {
            Err(StoreError::InvalidRecord {
                id: self.id.to_string(),
                message: format!("scope does not fit type {}", self.subscription_type),
            })
        }
    }
}

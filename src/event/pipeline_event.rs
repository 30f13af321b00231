// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Pipeline event types.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::model::{ClientId, Object, OrganisationId, SubscriptionType};

/// Events flowing through the notification pipeline.
///
/// # Examples
///
/// ```
/// use chrono::Utc;
/// use lwm2m_notify::event::{LifecycleEvent, LifecycleKind, PipelineEvent};
/// use lwm2m_notify::model::{ClientId, OrganisationId};
///
/// let client_id = ClientId::new();
/// let event = PipelineEvent::Lifecycle(LifecycleEvent {
///     client_id,
///     organisation_id: OrganisationId::new(1),
///     kind: LifecycleKind::Connected,
///     time: Utc::now(),
/// });
///
/// assert_eq!(event.client_id(), client_id);
/// ```
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineEvent {
    /// A device reported new resource values.
    ResourceChanged(ChangeEvent),
    /// A device connected, updated, disconnected or expired.
    Lifecycle(LifecycleEvent),
}

impl PipelineEvent {
    /// Returns the client the event is about.
    #[must_use]
    pub fn client_id(&self) -> ClientId {
        match self {
            Self::ResourceChanged(e) => e.client_id,
            Self::Lifecycle(e) => e.client_id,
        }
    }

    /// Returns the organisation of the client.
    #[must_use]
    pub fn organisation_id(&self) -> OrganisationId {
        match self {
            Self::ResourceChanged(e) => e.organisation_id,
            Self::Lifecycle(e) => e.organisation_id,
        }
    }
}

/// A decoded observe notification.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    /// Reporting client.
    pub client_id: ClientId,
    /// Organisation of the client.
    pub organisation_id: OrganisationId,
    /// Definition of the changed object.
    pub object_definition_id: Uuid,
    /// LWM2M object type, e.g. 3303.
    pub object_type: u16,
    /// Changed instance.
    pub instance_id: Option<u16>,
    /// Definition IDs of the properties present in the notification.
    pub changed_properties: Vec<Uuid>,
    /// The decoded values.
    pub object: Object,
    /// When the notification was received.
    pub time_triggered: DateTime<Utc>,
}

/// Client lifecycle transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleKind {
    /// Registration.
    Connected,
    /// Registration update.
    Updated,
    /// De-registration.
    Disconnected,
    /// Lifetime elapsed without an update.
    Expired,
}

impl LifecycleKind {
    /// Subscription type that listens for this transition.
    #[must_use]
    pub fn subscription_type(self) -> SubscriptionType {
        match self {
            Self::Connected => SubscriptionType::ClientConnected,
            Self::Updated => SubscriptionType::ClientUpdated,
            Self::Disconnected => SubscriptionType::ClientDisconnected,
            Self::Expired => SubscriptionType::ClientConnectionExpired,
        }
    }
}

/// A client lifecycle transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LifecycleEvent {
    /// The client.
    pub client_id: ClientId,
    /// Organisation of the client.
    pub organisation_id: OrganisationId,
    /// What happened.
    pub kind: LifecycleKind,
    /// When it happened.
    pub time: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_kinds_map_to_subscription_types() {
        assert_eq!(
            LifecycleKind::Connected.subscription_type(),
            SubscriptionType::ClientConnected
        );
        assert_eq!(
            LifecycleKind::Expired.subscription_type(),
            SubscriptionType::ClientConnectionExpired
        );
        assert!(LifecycleKind::Updated.subscription_type().is_lifecycle());
    }

    #[test]
    fn accessors_cover_both_variants() {
        let client_id = ClientId::new();
        let change = PipelineEvent::ResourceChanged(ChangeEvent {
            client_id,
            organisation_id: OrganisationId::new(4),
            object_definition_id: Uuid::new_v4(),
            object_type: 3303,
            instance_id: Some(0),
            changed_properties: Vec::new(),
            object: Object::new(Uuid::new_v4(), Some(0)),
            time_triggered: Utc::now(),
        });
        assert_eq!(change.client_id(), client_id);
        assert_eq!(change.organisation_id(), OrganisationId::new(4));
    }
}

// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Typed view of a dispatched notification message.

use chrono::{DateTime, SecondsFormat, Utc};

use crate::bus::{ServiceEventMessage, params};
use crate::error::{BusError, DeliveryError};
use crate::event::{ChangeEvent, LifecycleEvent};
use crate::model::{ClientId, Object, OrganisationId, Subscription, SubscriptionId, SubscriptionType};

/// What the webhook worker needs to deliver one matched event.
///
/// Built by the dispatcher from a subscription and an event, carried as a
/// [`ServiceEventMessage`] and read back by the worker.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchedNotification {
    /// The matched subscription.
    pub subscription_id: SubscriptionId,
    /// Its type.
    pub subscription_type: SubscriptionType,
    /// Organisation of the subscription.
    pub organisation_id: OrganisationId,
    /// Client the event is about.
    pub client_id: ClientId,
    /// Webhook URL.
    pub url: String,
    /// Content type the subscriber accepts.
    pub accept_content_type: String,
    /// When the event happened.
    pub time_triggered: DateTime<Utc>,
    /// LWM2M object type of a change.
    pub object_type: Option<u16>,
    /// Changed values.
    pub object: Option<Object>,
}

impl DispatchedNotification {
    /// Notification for a resource change.
    #[must_use]
    pub fn for_change(subscription: &Subscription, event: &ChangeEvent) -> Self {
        Self {
            object_type: Some(event.object_type),
            object: Some(event.object.clone()),
            ..Self::base(subscription, event.client_id, event.time_triggered)
        }
    }

    /// Notification for a lifecycle transition.
    #[must_use]
    pub fn for_lifecycle(subscription: &Subscription, event: &LifecycleEvent) -> Self {
        Self::base(subscription, event.client_id, event.time)
    }

    fn base(subscription: &Subscription, client_id: ClientId, time: DateTime<Utc>) -> Self {
        Self {
            subscription_id: subscription.id,
            subscription_type: subscription.subscription_type,
            organisation_id: subscription.organisation_id,
            client_id,
            url: subscription.url.clone(),
            accept_content_type: subscription.accept_content_type.clone(),
            time_triggered: time,
            object_type: None,
            object: None,
        }
    }

    /// Builds the bus message.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::Serialization`] if the object cannot be encoded.
    pub fn to_message(&self) -> Result<ServiceEventMessage, BusError> {
        let mut message = ServiceEventMessage::new()
            .with_parameter(params::SUBSCRIPTION_ID, self.subscription_id.to_string())
            .with_parameter(params::SUBSCRIPTION_TYPE, self.subscription_type.as_str())
            .with_parameter(params::ORGANISATION_ID, self.organisation_id.to_string())
            .with_parameter(params::CLIENT_ID, self.client_id.to_string())
            .with_parameter(params::URL, self.url.as_str())
            .with_parameter(params::ACCEPT_CONTENT_TYPE, self.accept_content_type.as_str())
            .with_parameter(
                params::TIME_TRIGGERED,
                self.time_triggered
                    .to_rfc3339_opts(SecondsFormat::Millis, true),
            );
        if let Some(object_type) = self.object_type {
            message.set_parameter(params::OBJECT_TYPE, object_type.to_string());
        }
        if let Some(object) = &self.object {
            message.set_parameter(params::OBJECT, serde_json::to_value(object)?);
        }
        Ok(message)
    }

    /// Reads a notification back from a bus message.
    ///
    /// # Errors
    ///
    /// Returns [`DeliveryError`] if a required parameter is missing or
    /// malformed.
    pub fn from_message(message: &ServiceEventMessage) -> Result<Self, DeliveryError> {
        let subscription_type = required(message, params::SUBSCRIPTION_TYPE)?
            .parse()
            .map_err(|e: String| invalid(params::SUBSCRIPTION_TYPE, e))?;
        let time_triggered = DateTime::parse_from_rfc3339(required(message, params::TIME_TRIGGERED)?)
            .map_err(|e| invalid(params::TIME_TRIGGERED, e.to_string()))?
            .with_timezone(&Utc);
        let object_type = message
            .string(params::OBJECT_TYPE)
            .map(|s| s.parse::<u16>())
            .transpose()
            .map_err(|e| invalid(params::OBJECT_TYPE, e.to_string()))?;
        let object = message
            .object(params::OBJECT)
            .map(|v| serde_json::from_value::<Object>(v.clone()))
            .transpose()
            .map_err(|e| invalid(params::OBJECT, e.to_string()))?;

        Ok(Self {
            subscription_id: parse(message, params::SUBSCRIPTION_ID)?,
            subscription_type,
            organisation_id: parse(message, params::ORGANISATION_ID)?,
            client_id: parse(message, params::CLIENT_ID)?,
            url: required(message, params::URL)?.to_string(),
            accept_content_type: message
                .string(params::ACCEPT_CONTENT_TYPE)
                .unwrap_or(Subscription::DEFAULT_CONTENT_TYPE)
                .to_string(),
            time_triggered,
            object_type,
            object,
        })
    }
}

fn required<'a>(
    message: &'a ServiceEventMessage,
    name: &'static str,
) -> Result<&'a str, DeliveryError> {
    message
        .string(name)
        .ok_or(DeliveryError::MissingParameter(name))
}

fn parse<T>(message: &ServiceEventMessage, name: &'static str) -> Result<T, DeliveryError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    required(message, name)?
        .parse()
        .map_err(|e: T::Err| invalid(name, e.to_string()))
}

fn invalid(name: &'static str, message: String) -> DeliveryError {
    DeliveryError::InvalidParameter { name, message }
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::*;
    use crate::event::LifecycleKind;
    use crate::model::{Property, PropertyValue};

    #[test]
    fn change_survives_the_bus() {
        let client_id = ClientId::new();
        let definition = Uuid::new_v4();
        let subscription =
            Subscription::observation(OrganisationId::new(3), client_id, definition, "http://hook")
                .with_instance(0);
        let object = Object::new(definition, Some(0)).with_property(Property::single(
            5700,
            Some(Uuid::new_v4()),
            PropertyValue::Float(21.5),
        ));
        let event = ChangeEvent {
            client_id,
            organisation_id: OrganisationId::new(3),
            object_definition_id: definition,
            object_type: 3303,
            instance_id: Some(0),
            changed_properties: object.property_definition_ids(),
            object,
            time_triggered: DateTime::parse_from_rfc3339("2024-05-01T10:00:00.250Z")
                .unwrap()
                .with_timezone(&Utc),
        };

        let notification = DispatchedNotification::for_change(&subscription, &event);
        let message = notification.to_message().unwrap();
        assert_eq!(message.string(params::SUBSCRIPTION_TYPE), Some("Observation"));
        assert_eq!(
            message.string(params::TIME_TRIGGERED),
            Some("2024-05-01T10:00:00.250Z")
        );

        let bytes = message.to_bytes().unwrap();
        let back = ServiceEventMessage::from_bytes(&bytes).unwrap();
        assert_eq!(DispatchedNotification::from_message(&back).unwrap(), notification);
    }

    #[test]
    fn lifecycle_has_no_object() {
        let subscription = Subscription::lifecycle(
            OrganisationId::new(1),
            SubscriptionType::ClientDisconnected,
            "http://hook",
        );
        let event = LifecycleEvent {
            client_id: ClientId::new(),
            organisation_id: OrganisationId::new(1),
            kind: LifecycleKind::Disconnected,
            time: Utc::now(),
        };
        let message = DispatchedNotification::for_lifecycle(&subscription, &event)
            .to_message()
            .unwrap();
        assert!(!message.has_parameter(params::OBJECT));

        let back = DispatchedNotification::from_message(&message).unwrap();
        assert_eq!(back.subscription_type, SubscriptionType::ClientDisconnected);
        assert_eq!(back.object, None);
    }

    #[test]
    fn missing_url_is_reported() {
        let mut message = ServiceEventMessage::new();
        message.set_parameter(params::SUBSCRIPTION_TYPE, "Observation");
        message.set_parameter(params::TIME_TRIGGERED, "2024-05-01T10:00:00Z");
        message.set_parameter(params::SUBSCRIPTION_ID, SubscriptionId::new().to_string());
        message.set_parameter(params::ORGANISATION_ID, "1");
        message.set_parameter(params::CLIENT_ID, ClientId::new().to_string());

        assert!(matches!(
            DispatchedNotification::from_message(&message),
            Err(DeliveryError::MissingParameter("Url"))
        ));
    }
}

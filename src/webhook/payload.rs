// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Webhook request bodies.

use chrono::SecondsFormat;
use serde::Serialize;

use crate::dispatch::DispatchedNotification;
use crate::error::DeliveryError;
use crate::model::{Object, PropertyContent};

/// Serialization chosen from the subscriber's accepted content type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadFormat {
    /// `application/...+json` and anything unrecognised.
    Json,
    /// `application/...+xml` and `text/xml`.
    Xml,
}

impl PayloadFormat {
    /// Picks the format for a content type.
    #[must_use]
    pub fn for_content_type(content_type: &str) -> Self {
        let essence = content_type
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();
        if essence.ends_with("+xml") || essence.ends_with("/xml") {
            Self::Xml
        } else {
            Self::Json
        }
    }
}

/// A hypermedia link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Link {
    /// Relation.
    #[serde(rename = "rel")]
    pub rel: String,
    /// Target.
    #[serde(rename = "href")]
    pub href: String,
}

/// One resource of the changed object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ResourceValue {
    /// Resource ID.
    #[serde(rename = "ID")]
    pub id: u16,
    /// Value of a single-valued resource.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    /// Instances of a multi-valued resource.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub values: Option<Vec<InstanceValue>>,
}

/// One instance of a multi-valued resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct InstanceValue {
    /// Resource instance ID.
    #[serde(rename = "ID")]
    pub id: u16,
    /// Value.
    pub value: String,
}

/// The changed object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ObjectValue {
    /// Instance ID, as text.
    #[serde(rename = "InstanceID")]
    pub instance_id: String,
    /// Resources present in the notification.
    pub resources: Vec<ResourceValue>,
}

impl ObjectValue {
    /// Flattens a decoded object into text values.
    #[must_use]
    pub fn from_object(object: &Object) -> Self {
        let resources = object
            .properties
            .iter()
            .map(|property| match &property.content {
                PropertyContent::Single(value) => ResourceValue {
                    id: property.resource_id,
                    value: Some(value.to_string()),
                    values: None,
                },
                PropertyContent::Multiple(instances) => ResourceValue {
                    id: property.resource_id,
                    value: None,
                    values: Some(
                        instances
                            .iter()
                            .map(|i| InstanceValue {
                                id: i.id,
                                value: i.value.to_string(),
                            })
                            .collect(),
                    ),
                },
            })
            .collect();

        Self {
            instance_id: object
                .instance_id
                .map(|i| i.to_string())
                .unwrap_or_default(),
            resources,
        }
    }
}

/// Body POSTed to a subscriber.
///
/// # Examples
///
/// ```
/// use lwm2m_notify::webhook::{ObjectValue, WebhookPayload};
///
/// let payload = WebhookPayload {
///     links: Vec::new(),
///     time_triggered: "2024-05-01T10:00:00.000Z".to_string(),
///     subscription_type: "Observation".to_string(),
///     value: Some(ObjectValue { instance_id: "0".to_string(), resources: Vec::new() }),
/// };
///
/// let json = payload.to_json().unwrap();
/// assert!(json.contains(r#""Value":{"InstanceID":"0","Resources":[]}"#));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct WebhookPayload {
    /// Self links to the subscription, the client and the object.
    pub links: Vec<Link>,
    /// RFC 3339 trigger time.
    pub time_triggered: String,
    /// Subscription type name.
    pub subscription_type: String,
    /// Changed values; absent for lifecycle events.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<ObjectValue>,
}

impl WebhookPayload {
    /// Builds the payload of a dispatched notification. Links are rooted at
    /// `link_base`.
    #[must_use]
    pub fn from_notification(notification: &DispatchedNotification, link_base: &str) -> Self {
        let base = link_base.trim_end_matches('/');
        let client = format!(
            "{base}/clients/{}",
            urlencoding::encode(&notification.client_id.to_string())
        );

        let mut links = vec![
            Link {
                rel: "subscription".to_string(),
                href: format!(
                    "{base}/subscriptions/{}",
                    urlencoding::encode(&notification.subscription_id.to_string())
                ),
            },
            Link {
                rel: "client".to_string(),
                href: client.clone(),
            },
        ];
        if let (Some(object_type), Some(object)) = (notification.object_type, &notification.object)
        {
            let mut href = format!("{client}/objecttypes/{object_type}/instances");
            if let Some(instance) = object.instance_id {
                href = format!("{href}/{instance}");
            }
            links.push(Link {
                rel: "object".to_string(),
                href,
            });
        }

        Self {
            links,
            time_triggered: notification
                .time_triggered
                .to_rfc3339_opts(SecondsFormat::Millis, true),
            subscription_type: notification.subscription_type.to_string(),
            value: notification.object.as_ref().map(ObjectValue::from_object),
        }
    }

    /// Serializes as JSON.
    ///
    /// # Errors
    ///
    /// Returns [`DeliveryError::Serialization`] on failure.
    pub fn to_json(&self) -> Result<String, DeliveryError> {
        serde_json::to_string(self).map_err(|e| DeliveryError::Serialization(e.to_string()))
    }

    /// Serializes as XML with a `Notification` root element.
    ///
    /// # Errors
    ///
    /// Returns [`DeliveryError::Serialization`] on failure.
    pub fn to_xml(&self) -> Result<String, DeliveryError> {
        quick_xml::se::to_string_with_root("Notification", self)
            .map_err(|e| DeliveryError::Serialization(e.to_string()))
    }

    /// Serializes in the given format.
    ///
    /// # Errors
    ///
    /// Returns [`DeliveryError::Serialization`] on failure.
    pub fn render(&self, format: PayloadFormat) -> Result<String, DeliveryError> {
        match format {
            PayloadFormat::Json => self.to_json(),
            PayloadFormat::Xml => self.to_xml(),
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, Utc};
    use uuid::Uuid;

    use super::*;
    use crate::model::{
        ClientId, OrganisationId, Property, PropertyValue, ResourceInstance, SubscriptionId,
        SubscriptionType,
    };

    fn notification(object: Option<Object>) -> DispatchedNotification {
        DispatchedNotification {
            subscription_id: SubscriptionId::new(),
            subscription_type: SubscriptionType::Observation,
            organisation_id: OrganisationId::new(1),
            client_id: ClientId::new(),
            url: "http://hook".to_string(),
            accept_content_type: "application/vnd.lwm2m.notification+json".to_string(),
            time_triggered: DateTime::parse_from_rfc3339("2024-05-01T10:00:00Z")
                .unwrap()
                .with_timezone(&Utc),
            object_type: object.as_ref().map(|_| 3303),
            object,
        }
    }

    fn temperature(value: f64) -> Object {
        Object::new(Uuid::new_v4(), Some(0)).with_property(Property::single(
            5700,
            None,
            PropertyValue::Float(value),
        ))
    }

    #[test]
    fn format_from_content_type() {
        assert_eq!(
            PayloadFormat::for_content_type("application/vnd.lwm2m.notification+xml; charset=utf-8"),
            PayloadFormat::Xml
        );
        assert_eq!(PayloadFormat::for_content_type("text/xml"), PayloadFormat::Xml);
        assert_eq!(
            PayloadFormat::for_content_type("application/vnd.lwm2m.notification+json"),
            PayloadFormat::Json
        );
        assert_eq!(PayloadFormat::for_content_type(""), PayloadFormat::Json);
    }

    #[test]
    fn json_value_shape() {
        let payload =
            WebhookPayload::from_notification(&notification(Some(temperature(21.5))), "https://api");
        let json = payload.to_json().unwrap();
        assert!(json.contains(
            r#""Value":{"InstanceID":"0","Resources":[{"ID":5700,"Value":"21.5"}]}"#
        ));
        assert!(json.contains(r#""SubscriptionType":"Observation""#));
        assert!(json.contains(r#""TimeTriggered":"2024-05-01T10:00:00.000Z""#));

        let rels: Vec<&str> = payload.links.iter().map(|l| l.rel.as_str()).collect();
        assert_eq!(rels, vec!["subscription", "client", "object"]);
        assert!(payload.links[2].href.ends_with("/objecttypes/3303/instances/0"));
        assert!(payload.links[0].href.starts_with("https://api/subscriptions/"));
    }

    #[test]
    fn multi_valued_resources() {
        let object = Object::new(Uuid::new_v4(), Some(1)).with_property(Property::multiple(
            5,
            None,
            vec![
                ResourceInstance {
                    id: 0,
                    value: PropertyValue::Integer(3),
                },
                ResourceInstance {
                    id: 1,
                    value: PropertyValue::Integer(4),
                },
            ],
        ));
        let value = ObjectValue::from_object(&object);
        let json = serde_json::to_string(&value).unwrap();
        assert_eq!(
            json,
            r#"{"InstanceID":"1","Resources":[{"ID":5,"Values":[{"ID":0,"Value":"3"},{"ID":1,"Value":"4"}]}]}"#
        );
    }

    #[test]
    fn lifecycle_payload_has_no_value() {
        let mut n = notification(None);
        n.subscription_type = SubscriptionType::ClientConnected;
        let payload = WebhookPayload::from_notification(&n, "");
        assert_eq!(payload.links.len(), 2);
        assert!(!payload.to_json().unwrap().contains("\"Value\""));
    }

    #[test]
    fn xml_rendering() {
        let payload = WebhookPayload::from_notification(&notification(Some(temperature(21.5))), "");
        let xml = payload.render(PayloadFormat::Xml).unwrap();
        assert!(xml.starts_with("<Notification>"));
        assert!(xml.contains("<InstanceID>0</InstanceID>"));
        assert!(xml.contains("<SubscriptionType>Observation</SubscriptionType>"));
    }
}

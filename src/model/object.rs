// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Decoded object instances.
//!
//! An [`Object`] is one instance of an object definition as read from a
//! device: an optional instance ID and the properties that were present in
//! the payload. Properties hold either one value or a list of resource
//! instances.

use std::fmt;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A single resource value.
///
/// # Examples
///
/// ```
/// use lwm2m_notify::model::PropertyValue;
///
/// assert_eq!(PropertyValue::Float(21.5).to_string(), "21.5");
/// assert_eq!(PropertyValue::Boolean(true).to_string(), "true");
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "Kind", content = "Value")]
pub enum PropertyValue {
    /// Boolean resource.
    Boolean(bool),
    /// Signed integer resource.
    Integer(i64),
    /// Floating point resource.
    Float(f64),
    /// UTF-8 string resource.
    String(String),
    /// Opaque bytes.
    Opaque(Vec<u8>),
    /// Time resource, whole seconds since the Unix epoch on the wire.
    DateTime(DateTime<Utc>),
    /// Reference to another object instance.
    ObjectLink {
        /// Target object type.
        object_id: u16,
        /// Target instance.
        instance_id: u16,
    },
}

impl PropertyValue {
    /// Returns the name of the value kind.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Boolean(_) => "boolean",
            Self::Integer(_) => "integer",
            Self::Float(_) => "float",
            Self::String(_) => "string",
            Self::Opaque(_) => "opaque",
            Self::DateTime(_) => "datetime",
            Self::ObjectLink { .. } => "objlnk",
        }
    }
}

impl fmt::Display for PropertyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Boolean(b) => write!(f, "{b}"),
            Self::Integer(i) => write!(f, "{i}"),
            Self::Float(x) => write!(f, "{x}"),
            Self::String(s) => f.write_str(s),
            Self::Opaque(bytes) => {
                for byte in bytes {
                    write!(f, "{byte:02x}")?;
                }
                Ok(())
            }
            Self::DateTime(dt) => f.write_str(&dt.to_rfc3339_opts(SecondsFormat::Secs, true)),
            Self::ObjectLink {
                object_id,
                instance_id,
            } => write!(f, "{object_id}:{instance_id}"),
        }
    }
}

/// One entry of a multi-valued property.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceInstance {
    /// Resource instance ID.
    pub id: u16,
    /// The value.
    pub value: PropertyValue,
}

/// The values carried by a property.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PropertyContent {
    /// Single-valued resource.
    Single(PropertyValue),
    /// Multi-valued resource.
    Multiple(Vec<ResourceInstance>),
}

/// A decoded resource of an object instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Property {
    /// The LWM2M resource ID.
    pub resource_id: u16,
    /// Schema-level ID of the property definition, when known.
    pub definition_id: Option<Uuid>,
    /// The value or values.
    pub content: PropertyContent,
}

impl Property {
    /// Creates a single-valued property.
    #[must_use]
    pub fn single(resource_id: u16, definition_id: Option<Uuid>, value: PropertyValue) -> Self {
        Self {
            resource_id,
            definition_id,
            content: PropertyContent::Single(value),
        }
    }

    /// Creates a multi-valued property.
    #[must_use]
    pub fn multiple(
        resource_id: u16,
        definition_id: Option<Uuid>,
        values: Vec<ResourceInstance>,
    ) -> Self {
        Self {
            resource_id,
            definition_id,
            content: PropertyContent::Multiple(values),
        }
    }

    /// Returns the value of a single-valued property.
    #[must_use]
    pub fn value(&self) -> Option<&PropertyValue> {
        match &self.content {
            PropertyContent::Single(value) => Some(value),
            PropertyContent::Multiple(_) => None,
        }
    }
}

/// A decoded object instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Object {
    /// ID of the object definition this instance conforms to.
    pub definition_id: Uuid,
    /// Instance ID; devices may omit it for single-instance reads.
    pub instance_id: Option<u16>,
    /// The properties present in the payload.
    pub properties: Vec<Property>,
}

impl Object {
    /// Creates an empty object instance.
    #[must_use]
    pub fn new(definition_id: Uuid, instance_id: Option<u16>) -> Self {
        Self {
            definition_id,
            instance_id,
            properties: Vec::new(),
        }
    }

    /// Adds a property, replacing any property with the same resource ID.
    #[must_use]
    pub fn with_property(mut self, property: Property) -> Self {
        self.properties
            .retain(|p| p.resource_id != property.resource_id);
        self.properties.push(property);
        self
    }

    /// Looks up a property by resource ID.
    #[must_use]
    pub fn property(&self, resource_id: u16) -> Option<&Property> {
        self.properties.iter().find(|p| p.resource_id == resource_id)
    }

    /// Returns the definition IDs of all properties present.
    #[must_use]
    pub fn property_definition_ids(&self) -> Vec<Uuid> {
        self.properties
            .iter()
            .filter_map(|p| p.definition_id)
            .collect()
    }
}

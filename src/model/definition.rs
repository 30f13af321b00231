// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Object and property schemas.
//!
//! Definitions describe the resource types a device exposes. They are loaded
//! once and shared through `Arc`. Organisations may override a definition; a
//! lookup falls back to the global schema when no override exists.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::OrganisationId;

/// Data kind of a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PropertyDataType {
    /// UTF-8 string.
    String,
    /// Signed integer.
    Integer,
    /// IEEE-754 float.
    Float,
    /// Boolean.
    Boolean,
    /// Opaque bytes.
    Opaque,
    /// Seconds since the Unix epoch.
    DateTime,
    /// Object link (`object:instance`).
    ObjectLink,
    /// Executable resource, carries no value.
    None,
}

impl PropertyDataType {
    /// Returns a short name for diagnostics.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Integer => "integer",
            Self::Float => "float",
            Self::Boolean => "boolean",
            Self::Opaque => "opaque",
            Self::DateTime => "datetime",
            Self::ObjectLink => "objlnk",
            Self::None => "none",
        }
    }
}

/// Schema of one resource of an object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertyDefinition {
    /// Schema-level ID.
    pub id: Uuid,
    /// LWM2M resource ID.
    pub resource_id: u16,
    /// Human readable name.
    pub name: String,
    /// Name used when serializing values.
    pub serialisation_name: String,
    /// Value kind.
    pub data_type: PropertyDataType,
    /// Whether the resource holds multiple instances.
    pub is_collection: bool,
}

impl PropertyDefinition {
    /// Creates a single-valued property definition with a random schema ID.
    #[must_use]
    pub fn new(resource_id: u16, name: impl Into<String>, data_type: PropertyDataType) -> Self {
        let name = name.into();
        Self {
            id: Uuid::new_v4(),
            resource_id,
            serialisation_name: name.replace(' ', ""),
            name,
            data_type,
            is_collection: false,
        }
    }

    /// Marks the property as multi-valued.
    #[must_use]
    pub fn collection(mut self) -> Self {
        self.is_collection = true;
        self
    }
}

/// Schema of an object type.
///
/// # Examples
///
/// ```
/// use lwm2m_notify::model::{ObjectDefinition, PropertyDataType, PropertyDefinition};
///
/// let temperature = ObjectDefinition::new(3303, "Temperature")
///     .with_property(PropertyDefinition::new(5700, "Sensor Value", PropertyDataType::Float));
///
/// assert!(temperature.property(5700).is_some());
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectDefinition {
    /// Schema-level ID.
    pub id: Uuid,
    /// LWM2M object ID.
    pub object_id: u16,
    /// Human readable name.
    pub name: String,
    /// Name used when serializing instances.
    pub serialisation_name: String,
    /// Whether the device may expose several instances.
    pub is_multiple_instance: bool,
    /// Resource schemas.
    pub properties: Vec<PropertyDefinition>,
}

impl ObjectDefinition {
    /// Creates a multi-instance definition with a random schema ID.
    #[must_use]
    pub fn new(object_id: u16, name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            id: Uuid::new_v4(),
            object_id,
            serialisation_name: name.replace(' ', ""),
            name,
            is_multiple_instance: true,
            properties: Vec::new(),
        }
    }

    /// Adds a property schema.
    #[must_use]
    pub fn with_property(mut self, property: PropertyDefinition) -> Self {
        self.properties.push(property);
        self
    }

    /// Looks up a property by LWM2M resource ID.
    #[must_use]
    pub fn property(&self, resource_id: u16) -> Option<&PropertyDefinition> {
        self.properties
            .iter()
            .find(|p| p.resource_id == resource_id)
    }

    /// Looks up a property by schema ID.
    #[must_use]
    pub fn property_by_id(&self, id: Uuid) -> Option<&PropertyDefinition> {
        self.properties.iter().find(|p| p.id == id)
    }
}

/// Read access to object definitions.
///
/// Implemented by the persistent schema store; [`DefinitionRegistry`] is the
/// in-memory implementation.
pub trait DefinitionLookup: Send + Sync {
    /// Finds a definition by LWM2M object ID, preferring the organisation's
    /// override.
    fn by_object_id(
        &self,
        organisation: Option<OrganisationId>,
        object_id: u16,
    ) -> Option<Arc<ObjectDefinition>>;

    /// Finds a definition by schema ID, preferring the organisation's override.
    fn by_id(&self, organisation: Option<OrganisationId>, id: Uuid)
    -> Option<Arc<ObjectDefinition>>;
}

/// In-memory definition store with per-organisation overrides.
#[derive(Debug, Default)]
pub struct DefinitionRegistry {
    global: RwLock<HashMap<u16, Arc<ObjectDefinition>>>,
    overrides: RwLock<HashMap<(OrganisationId, u16), Arc<ObjectDefinition>>>,
}

impl DefinitionRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a global definition, replacing any previous one for the
    /// same object ID.
    pub fn insert(&self, definition: ObjectDefinition) -> Arc<ObjectDefinition> {
        let definition = Arc::new(definition);
        self.global
            .write()
            .insert(definition.object_id, Arc::clone(&definition));
        definition
    }

    /// Registers an organisation-specific override.
    pub fn insert_override(
        &self,
        organisation: OrganisationId,
        definition: ObjectDefinition,
    ) -> Arc<ObjectDefinition> {
        let definition = Arc::new(definition);
        self.overrides
            .write()
            .insert((organisation, definition.object_id), Arc::clone(&definition));
        definition
    }

    /// Returns the number of global definitions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.global.read().len()
    }

    /// Returns `true` if no global definition is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.global.read().is_empty()
    }
}

impl DefinitionLookup for DefinitionRegistry {
    fn by_object_id(
        &self,
        organisation: Option<OrganisationId>,
        object_id: u16,
    ) -> Option<Arc<ObjectDefinition>> {
        if let Some(org) = organisation
            && let Some(found) = self.overrides.read().get(&(org, object_id))
        {
            return Some(Arc::clone(found));
        }
        self.global.read().get(&object_id).cloned()
    }

    fn by_id(
        &self,
        organisation: Option<OrganisationId>,
        id: Uuid,
    ) -> Option<Arc<ObjectDefinition>> {
        if let Some(org) = organisation {
            let overrides = self.overrides.read();
            let found = overrides
                .iter()
                .find(|((o, _), def)| *o == org && def.id == id)
                .map(|(_, def)| Arc::clone(def));
            if found.is_some() {
                return found;
            }
        }
        self.global
            .read()
            .values()
            .find(|def| def.id == id)
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temperature() -> ObjectDefinition {
        ObjectDefinition::new(3303, "Temperature").with_property(PropertyDefinition::new(
            5700,
            "Sensor Value",
            PropertyDataType::Float,
        ))
    }

    #[test]
    fn serialisation_name_strips_spaces() {
        let prop = PropertyDefinition::new(5700, "Sensor Value", PropertyDataType::Float);
        assert_eq!(prop.serialisation_name, "SensorValue");
    }

    #[test]
    fn lookup_falls_back_to_global() {
        let registry = DefinitionRegistry::new();
        let global = registry.insert(temperature());

        let found = registry
            .by_object_id(Some(OrganisationId::new(7)), 3303)
            .unwrap();
        assert_eq!(found.id, global.id);
    }

    #[test]
    fn organisation_override_wins() {
        let registry = DefinitionRegistry::new();
        registry.insert(temperature());
        let custom = registry.insert_override(OrganisationId::new(7), temperature());

        let found = registry
            .by_object_id(Some(OrganisationId::new(7)), 3303)
            .unwrap();
        assert_eq!(found.id, custom.id);

        let other = registry
            .by_object_id(Some(OrganisationId::new(8)), 3303)
            .unwrap();
        assert_ne!(other.id, custom.id);
    }

    #[test]
    fn lookup_by_schema_id() {
        let registry = DefinitionRegistry::new();
        let def = registry.insert(temperature());

        assert!(registry.by_id(None, def.id).is_some());
        assert!(registry.by_id(None, Uuid::new_v4()).is_none());
    }

    #[test]
    fn unknown_object_id() {
        let registry = DefinitionRegistry::new();
        assert!(registry.is_empty());
        assert!(registry.by_object_id(None, 1).is_none());
    }
}

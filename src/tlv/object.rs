// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Schema-driven object codec.
//!
//! Decoding needs the [`ObjectDefinition`] of the payload: TLV carries only
//! numeric identifiers, the data kind of each resource comes from the schema.
//! Resources the schema does not know are skipped.

use tracing::trace;

use super::entry::{
    TlvEntry, TlvKind, TlvReader, TlvWriter, decode_bool, decode_datetime, decode_float,
    decode_integer, decode_object_link, decode_string, encode_bool, encode_datetime,
    encode_float, encode_integer, encode_object_link,
};
use crate::error::CodecError;
use crate::model::{
    Object, ObjectDefinition, Property, PropertyContent, PropertyDataType, PropertyDefinition,
    PropertyValue, ResourceInstance,
};

/// Encodes one object instance.
///
/// An instance with an ID is wrapped in an object-instance entry; an instance
/// without one is written as a flat list of resources.
///
/// # Errors
///
/// Returns a [`CodecError`] if a property is not in the schema or a value
/// does not match its declared type.
pub fn encode_object(definition: &ObjectDefinition, object: &Object) -> Result<Vec<u8>, CodecError> {
    let mut writer = TlvWriter::new();
    match object.instance_id {
        Some(instance) => writer.write_nested(TlvKind::ObjectInstance, instance, |inner| {
            write_properties(inner, definition, &object.properties)
        })?,
        None => write_properties(&mut writer, definition, &object.properties)?,
    }
    Ok(writer.into_bytes())
}

/// Encodes several object instances, each wrapped in an object-instance
/// entry. Instances without an ID take their position as ID.
///
/// # Errors
///
/// See [`encode_object`].
pub fn encode_objects(
    definition: &ObjectDefinition,
    objects: &[Object],
) -> Result<Vec<u8>, CodecError> {
    let mut writer = TlvWriter::new();
    for (position, object) in objects.iter().enumerate() {
        let instance = object
            .instance_id
            .unwrap_or_else(|| u16::try_from(position).unwrap_or(u16::MAX));
        writer.write_nested(TlvKind::ObjectInstance, instance, |inner| {
            write_properties(inner, definition, &object.properties)
        })?;
    }
    Ok(writer.into_bytes())
}

/// Decodes every object instance in a payload.
///
/// Object-instance entries become one object each. Resources at the top
/// level (devices omit the wrapper when reading a single instance) are
/// collected into one object without an instance ID.
///
/// # Errors
///
/// Returns a [`CodecError`] for malformed framing or values.
pub fn decode_objects(
    definition: &ObjectDefinition,
    bytes: &[u8],
) -> Result<Vec<Object>, CodecError> {
    let mut objects = Vec::new();
    let mut flat = Object::new(definition.id, None);

    for entry in TlvReader::new(bytes) {
        let entry = entry?;
        match entry.kind {
            TlvKind::ObjectInstance => {
                let mut object = Object::new(definition.id, Some(entry.id));
                for child in entry.children() {
                    if let Some(property) = decode_resource(definition, &child?)? {
                        object.properties.push(property);
                    }
                }
                objects.push(object);
            }
            TlvKind::ResourceWithValue | TlvKind::MultipleResource => {
                if let Some(property) = decode_resource(definition, &entry)? {
                    flat.properties.push(property);
                }
            }
            TlvKind::ResourceInstance => {
                trace!(id = entry.id, "Skipping stray resource instance");
            }
        }
    }

    if !flat.properties.is_empty() {
        objects.push(flat);
    }
    Ok(objects)
}

/// Decodes a payload holding a single object instance.
///
/// Returns an empty object without an instance ID when the payload holds
/// no resources.
///
/// # Errors
///
/// Returns a [`CodecError`] for malformed framing or values.
pub fn decode_object(definition: &ObjectDefinition, bytes: &[u8]) -> Result<Object, CodecError> {
    Ok(decode_objects(definition, bytes)?
        .into_iter()
        .next()
        .unwrap_or_else(|| Object::new(definition.id, None)))
}

/// Decodes a payload holding one resource, as returned for a
/// `type/instance/resource` read or notify.
///
/// Returns `None` if the payload does not carry that resource.
///
/// # Errors
///
/// Returns a [`CodecError`] for malformed framing or values.
pub fn decode_property(
    definition: &ObjectDefinition,
    property: &PropertyDefinition,
    bytes: &[u8],
) -> Result<Option<Property>, CodecError> {
    for entry in TlvReader::new(bytes) {
        let entry = entry?;
        match entry.kind {
            TlvKind::ResourceWithValue | TlvKind::MultipleResource
                if entry.id == property.resource_id =>
            {
                return decode_resource(definition, &entry);
            }
            TlvKind::ObjectInstance => {
                for child in entry.children() {
                    let child = child?;
                    if child.id == property.resource_id && child.kind != TlvKind::ResourceInstance
                    {
                        return decode_resource(definition, &child);
                    }
                }
            }
            _ => {}
        }
    }
    Ok(None)
}

fn write_properties(
    writer: &mut TlvWriter,
    definition: &ObjectDefinition,
    properties: &[Property],
) -> Result<(), CodecError> {
    for property in properties {
        let schema =
            definition
                .property(property.resource_id)
                .ok_or_else(|| CodecError::InvalidValue {
                    resource_id: property.resource_id,
                    message: format!("not defined by object {}", definition.object_id),
                })?;

        match &property.content {
            PropertyContent::Single(value) => {
                let bytes = encode_value(schema, value)?;
                writer.write(TlvKind::ResourceWithValue, property.resource_id, &bytes)?;
            }
            PropertyContent::Multiple(instances) => {
                writer.write_nested(TlvKind::MultipleResource, property.resource_id, |inner| {
                    for instance in instances {
                        let bytes = encode_value(schema, &instance.value)?;
                        inner.write(TlvKind::ResourceInstance, instance.id, &bytes)?;
                    }
                    Ok(())
                })?;
            }
        }
    }
    Ok(())
}

fn decode_resource(
    definition: &ObjectDefinition,
    entry: &TlvEntry<'_>,
) -> Result<Option<Property>, CodecError> {
    let Some(schema) = definition.property(entry.id) else {
        trace!(
            object = definition.object_id,
            resource = entry.id,
            "Skipping unknown resource"
        );
        return Ok(None);
    };

    let content = if entry.kind == TlvKind::MultipleResource {
        let mut instances = Vec::new();
        for child in entry.children() {
            let child = child?;
            if child.kind != TlvKind::ResourceInstance {
                trace!(resource = entry.id, id = child.id, "Skipping unexpected entry");
                continue;
            }
            instances.push(ResourceInstance {
                id: child.id,
                value: decode_value(schema.data_type, schema.resource_id, child.value)?,
            });
        }
        PropertyContent::Multiple(instances)
    } else {
        PropertyContent::Single(decode_value(
            schema.data_type,
            schema.resource_id,
            entry.value,
        )?)
    };

    Ok(Some(Property {
        resource_id: schema.resource_id,
        definition_id: Some(schema.id),
        content,
    }))
}

/// Encodes a value according to the property's declared type.
///
/// # Errors
///
/// Returns [`CodecError::TypeMismatch`] if the value kind does not fit.
pub fn encode_value(
    property: &PropertyDefinition,
    value: &PropertyValue,
) -> Result<Vec<u8>, CodecError> {
    let bytes = match (property.data_type, value) {
        (PropertyDataType::Boolean, PropertyValue::Boolean(b)) => encode_bool(*b),
        (PropertyDataType::Integer, PropertyValue::Integer(i)) => encode_integer(*i),
        (PropertyDataType::Float, PropertyValue::Float(x)) => encode_float(*x),
        #[allow(clippy::cast_precision_loss)]
        (PropertyDataType::Float, PropertyValue::Integer(i)) => encode_float(*i as f64),
        (PropertyDataType::String, PropertyValue::String(s)) => s.as_bytes().to_vec(),
        (PropertyDataType::Opaque | PropertyDataType::None, PropertyValue::Opaque(b)) => b.clone(),
        (PropertyDataType::DateTime, PropertyValue::DateTime(dt)) => encode_datetime(*dt),
        (
            PropertyDataType::ObjectLink,
            PropertyValue::ObjectLink {
                object_id,
                instance_id,
            },
        ) => encode_object_link(*object_id, *instance_id),
        _ => {
            return Err(CodecError::TypeMismatch {
                resource_id: property.resource_id,
                expected: property.data_type.name(),
            });
        }
    };
    Ok(bytes)
}

/// Decodes raw value bytes for a declared data type.
///
/// # Errors
///
/// Returns a [`CodecError`] if the bytes do not form a valid value.
pub fn decode_value(
    data_type: PropertyDataType,
    resource_id: u16,
    bytes: &[u8],
) -> Result<PropertyValue, CodecError> {
    Ok(match data_type {
        PropertyDataType::Boolean => PropertyValue::Boolean(decode_bool(bytes, resource_id)?),
        PropertyDataType::Integer => PropertyValue::Integer(decode_integer(bytes, resource_id)?),
        PropertyDataType::Float => PropertyValue::Float(decode_float(bytes, resource_id)?),
        PropertyDataType::String => PropertyValue::String(decode_string(bytes, resource_id)?),
        PropertyDataType::Opaque | PropertyDataType::None => PropertyValue::Opaque(bytes.to_vec()),
        PropertyDataType::DateTime => {
            PropertyValue::DateTime(decode_datetime(bytes, resource_id)?)
        }
        PropertyDataType::ObjectLink => {
            let (object_id, instance_id) = decode_object_link(bytes, resource_id)?;
            PropertyValue::ObjectLink {
                object_id,
                instance_id,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use chrono::DateTime;

    use super::*;

    fn device_definition() -> ObjectDefinition {
        ObjectDefinition::new(3, "Device")
            .with_property(PropertyDefinition::new(0, "Manufacturer", PropertyDataType::String))
            .with_property(PropertyDefinition::new(
                7,
                "Power Source Voltage",
                PropertyDataType::Integer,
            )
            .collection())
            .with_property(PropertyDefinition::new(13, "Current Time", PropertyDataType::DateTime))
            .with_property(PropertyDefinition::new(99, "Flag", PropertyDataType::Boolean))
            .with_property(PropertyDefinition::new(98, "Link", PropertyDataType::ObjectLink))
            .with_property(PropertyDefinition::new(97, "Blob", PropertyDataType::Opaque))
    }

    fn temperature_definition() -> ObjectDefinition {
        ObjectDefinition::new(3303, "Temperature").with_property(PropertyDefinition::new(
            5700,
            "Sensor Value",
            PropertyDataType::Float,
        ))
    }

    fn prop_id(def: &ObjectDefinition, resource: u16) -> Option<uuid::Uuid> {
        def.property(resource).map(|p| p.id)
    }

    #[test]
    fn object_round_trip_keeps_unset_fields_absent() {
        let def = device_definition();
        let object = Object::new(def.id, Some(0))
            .with_property(Property::single(
                0,
                prop_id(&def, 0),
                PropertyValue::String("Acme".to_string()),
            ))
            .with_property(Property::multiple(
                7,
                prop_id(&def, 7),
                vec![
                    ResourceInstance {
                        id: 0,
                        value: PropertyValue::Integer(3300),
                    },
                    ResourceInstance {
                        id: 1,
                        value: PropertyValue::Integer(-5000),
                    },
                ],
            ))
            .with_property(Property::single(
                13,
                prop_id(&def, 13),
                PropertyValue::DateTime(DateTime::from_timestamp(1_700_000_000, 0).unwrap()),
            ))
            .with_property(Property::single(
                98,
                prop_id(&def, 98),
                PropertyValue::ObjectLink {
                    object_id: 3303,
                    instance_id: 1,
                },
            ))
            .with_property(Property::single(
                97,
                prop_id(&def, 97),
                PropertyValue::Opaque(vec![]),
            ));

        let bytes = encode_object(&def, &object).unwrap();
        let decoded = decode_object(&def, &bytes).unwrap();

        assert_eq!(decoded, object);
        // resource 99 was never set and stays absent
        assert!(decoded.property(99).is_none());
    }

    #[test]
    fn flat_payload_has_no_instance_id() {
        let def = temperature_definition();
        let mut writer = TlvWriter::new();
        writer
            .write(TlvKind::ResourceWithValue, 5700, &encode_float(21.5))
            .unwrap();

        let object = decode_object(&def, &writer.into_bytes()).unwrap();
        assert_eq!(object.instance_id, None);
        assert_eq!(
            object.property(5700).and_then(Property::value),
            Some(&PropertyValue::Float(21.5))
        );
    }

    #[test]
    fn unknown_resources_are_skipped() {
        let def = temperature_definition();
        let mut writer = TlvWriter::new();
        writer
            .write_nested(TlvKind::ObjectInstance, 0, |inner| {
                inner.write(TlvKind::ResourceWithValue, 5701, b"Cel")?;
                inner.write(TlvKind::ResourceWithValue, 5700, &encode_float(20.0))
            })
            .unwrap();

        let object = decode_object(&def, &writer.into_bytes()).unwrap();
        assert_eq!(object.instance_id, Some(0));
        assert_eq!(object.properties.len(), 1);
    }

    #[test]
    fn several_instances() {
        let def = temperature_definition();
        let objects: Vec<Object> = (0..3)
            .map(|i| {
                Object::new(def.id, Some(i)).with_property(Property::single(
                    5700,
                    prop_id(&def, 5700),
                    PropertyValue::Float(f64::from(i)),
                ))
            })
            .collect();

        let bytes = encode_objects(&def, &objects).unwrap();
        assert_eq!(decode_objects(&def, &bytes).unwrap(), objects);
    }

    #[test]
    fn decode_single_property() {
        let def = temperature_definition();
        let schema = def.property(5700).unwrap().clone();
        let object = Object::new(def.id, Some(2)).with_property(Property::single(
            5700,
            Some(schema.id),
            PropertyValue::Float(-1.5),
        ));
        let bytes = encode_object(&def, &object).unwrap();

        let property = decode_property(&def, &schema, &bytes).unwrap().unwrap();
        assert_eq!(property.value(), Some(&PropertyValue::Float(-1.5)));

        let other = PropertyDefinition::new(1, "Other", PropertyDataType::Integer);
        assert!(decode_property(&def, &other, &bytes).unwrap().is_none());
    }

    #[test]
    fn type_mismatch_on_encode() {
        let def = temperature_definition();
        let object = Object::new(def.id, None).with_property(Property::single(
            5700,
            None,
            PropertyValue::String("warm".to_string()),
        ));
        assert_eq!(
            encode_object(&def, &object),
            Err(CodecError::TypeMismatch {
                resource_id: 5700,
                expected: "float"
            })
        );
    }

    #[test]
    fn undefined_property_on_encode() {
        let def = temperature_definition();
        let object = Object::new(def.id, None).with_property(Property::single(
            1,
            None,
            PropertyValue::Integer(1),
        ));
        assert!(matches!(
            encode_object(&def, &object),
            Err(CodecError::InvalidValue { resource_id: 1, .. })
        ));
    }

    #[test]
    fn malformed_length_is_a_decode_fault() {
        let def = temperature_definition();
        // object instance claiming 200 bytes
        let bytes = [0x08, 0x00, 0xC8, 0x01];
        assert!(matches!(
            decode_objects(&def, &bytes),
            Err(CodecError::Truncated { .. })
        ));
    }
}

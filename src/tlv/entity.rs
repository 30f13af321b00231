// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Fixed-layout entities stored as TLV.
//!
//! Server and security definitions are persisted in the same TLV format the
//! devices use. Each entity has its own small resource enumeration; the IDs
//! are only unique within that entity.

use tracing::trace;

use super::entry::{
    TlvKind, TlvReader, TlvWriter, decode_bool, decode_integer, decode_string, decode_u64,
    encode_bool, encode_integer, encode_u64,
};
use crate::error::CodecError;
use crate::model::BindingMode;

/// An entity with a TLV representation.
pub trait TlvEntity: Sized {
    /// Encodes the entity. Unset optional fields are omitted.
    ///
    /// # Errors
    ///
    /// Returns a [`CodecError`] if a field cannot be encoded.
    fn serialize(&self) -> Result<Vec<u8>, CodecError>;

    /// Decodes the entity, skipping unknown entries.
    ///
    /// # Errors
    ///
    /// Returns a [`CodecError`] for malformed framing or values, or
    /// [`CodecError::MissingField`] when a mandatory field is absent.
    fn deserialize(bytes: &[u8]) -> Result<Self, CodecError>;
}

fn int_field<T>(bytes: &[u8], id: u16) -> Result<T, CodecError>
where
    T: TryFrom<i64>,
{
    let raw = decode_integer(bytes, id)?;
    T::try_from(raw).map_err(|_| CodecError::InvalidValue {
        resource_id: id,
        message: format!("{raw} out of range"),
    })
}

// ============================================================================
// Server
// ============================================================================

/// Resource IDs of [`ServerDefinition`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ServerResource {
    /// Short server ID.
    ShortServerId = 0,
    /// Registration lifetime in seconds.
    Lifetime = 1,
    /// Default minimum notification period.
    DefaultMinimumPeriod = 2,
    /// Default maximum notification period.
    DefaultMaximumPeriod = 3,
    /// Disable timeout.
    DisableTimeout = 5,
    /// Whether notifications are stored while offline.
    NotificationStoring = 6,
    /// Transport binding.
    Binding = 7,
}

impl ServerResource {
    fn from_id(id: u16) -> Option<Self> {
        Some(match id {
            0 => Self::ShortServerId,
            1 => Self::Lifetime,
            2 => Self::DefaultMinimumPeriod,
            3 => Self::DefaultMaximumPeriod,
            5 => Self::DisableTimeout,
            6 => Self::NotificationStoring,
            7 => Self::Binding,
            _ => return None,
        })
    }
}

/// Settings the server pushes to a device on bootstrap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerDefinition {
    /// Short server ID.
    pub short_server_id: u16,
    /// Registration lifetime in seconds.
    pub lifetime: u64,
    /// Default minimum notification period, seconds.
    pub default_minimum_period: Option<u32>,
    /// Default maximum notification period, seconds.
    pub default_maximum_period: Option<u32>,
    /// Disable timeout, seconds.
    pub disable_timeout: Option<u32>,
    /// Whether notifications are stored while offline.
    pub notification_storing: bool,
    /// Transport binding.
    pub binding: BindingMode,
}

impl TlvEntity for ServerDefinition {
    fn serialize(&self) -> Result<Vec<u8>, CodecError> {
        let mut w = TlvWriter::new();
        let res = |r: ServerResource| r as u16;
        w.write(
            TlvKind::ResourceWithValue,
            res(ServerResource::ShortServerId),
            &encode_integer(i64::from(self.short_server_id)),
        )?;
        w.write(
            TlvKind::ResourceWithValue,
            res(ServerResource::Lifetime),
            &encode_u64(self.lifetime),
        )?;
        for (resource, value) in [
            (
                ServerResource::DefaultMinimumPeriod,
                self.default_minimum_period,
            ),
            (
                ServerResource::DefaultMaximumPeriod,
                self.default_maximum_period,
            ),
            (ServerResource::DisableTimeout, self.disable_timeout),
        ] {
            if let Some(value) = value {
                w.write(
                    TlvKind::ResourceWithValue,
                    res(resource),
                    &encode_integer(i64::from(value)),
                )?;
            }
        }
        w.write(
            TlvKind::ResourceWithValue,
            res(ServerResource::NotificationStoring),
            &encode_bool(self.notification_storing),
        )?;
        w.write(
            TlvKind::ResourceWithValue,
            res(ServerResource::Binding),
            self.binding.as_str().as_bytes(),
        )?;
        Ok(w.into_bytes())
    }

    fn deserialize(bytes: &[u8]) -> Result<Self, CodecError> {
        let mut short_server_id: Option<u16> = None;
        let mut lifetime = None;
        let mut default_minimum_period: Option<u32> = None;
        let mut default_maximum_period: Option<u32> = None;
        let mut disable_timeout: Option<u32> = None;
        let mut notification_storing = None;
        let mut binding = None;

        for entry in TlvReader::new(bytes) {
            let entry = entry?;
            let Some(resource) = ServerResource::from_id(entry.id) else {
                trace!(id = entry.id, "Skipping unknown server resource");
                continue;
            };
            let (id, value) = (entry.id, entry.value);
            match resource {
                ServerResource::ShortServerId => short_server_id = Some(int_field(value, id)?),
                ServerResource::Lifetime => lifetime = Some(decode_u64(value, id)?),
                ServerResource::DefaultMinimumPeriod => {
                    default_minimum_period = Some(int_field(value, id)?);
                }
                ServerResource::DefaultMaximumPeriod => {
                    default_maximum_period = Some(int_field(value, id)?);
                }
                ServerResource::DisableTimeout => disable_timeout = Some(int_field(value, id)?),
                ServerResource::NotificationStoring => {
                    notification_storing = Some(decode_bool(value, id)?);
                }
                ServerResource::Binding => {
                    let text = decode_string(value, id)?;
                    let mode = text.parse::<BindingMode>().map_err(|message| {
                        CodecError::InvalidValue {
                            resource_id: id,
                            message,
                        }
                    })?;
                    binding = Some(mode);
                }
            }
        }

        Ok(Self {
            short_server_id: short_server_id.ok_or(CodecError::MissingField("ShortServerID"))?,
            lifetime: lifetime.ok_or(CodecError::MissingField("Lifetime"))?,
            default_minimum_period,
            default_maximum_period,
            disable_timeout,
            notification_storing: notification_storing
                .ok_or(CodecError::MissingField("NotificationStoring"))?,
            binding: binding.ok_or(CodecError::MissingField("Binding"))?,
        })
    }
}

// ============================================================================
// Security
// ============================================================================

/// Resource IDs of [`SecurityDefinition`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum SecurityResource {
    /// Server URI.
    ServerUri = 0,
    /// Whether this is the bootstrap server.
    BootstrapServer = 1,
    /// Security mode.
    SecurityMode = 2,
    /// Public key or PSK identity.
    PublicKeyOrIdentity = 3,
    /// Server public key.
    ServerPublicKey = 4,
    /// Secret key.
    SecretKey = 5,
    /// Short server ID.
    ShortServerId = 10,
    /// Client hold-off time in seconds.
    ClientHoldOffTime = 11,
}

impl SecurityResource {
    fn from_id(id: u16) -> Option<Self> {
        Some(match id {
            0 => Self::ServerUri,
            1 => Self::BootstrapServer,
            2 => Self::SecurityMode,
            3 => Self::PublicKeyOrIdentity,
            4 => Self::ServerPublicKey,
            5 => Self::SecretKey,
            10 => Self::ShortServerId,
            11 => Self::ClientHoldOffTime,
            _ => return None,
        })
    }
}

/// DTLS security mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecurityMode {
    /// Pre-shared key.
    PreSharedKey,
    /// Raw public key.
    RawPublicKey,
    /// X.509 certificate.
    Certificate,
    /// No security.
    NoSec,
}

impl SecurityMode {
    fn code(self) -> i64 {
        match self {
            Self::PreSharedKey => 0,
            Self::RawPublicKey => 1,
            Self::Certificate => 2,
            Self::NoSec => 3,
        }
    }

    fn from_code(code: i64, resource_id: u16) -> Result<Self, CodecError> {
        match code {
            0 => Ok(Self::PreSharedKey),
            1 => Ok(Self::RawPublicKey),
            2 => Ok(Self::Certificate),
            3 => Ok(Self::NoSec),
            other => Err(CodecError::InvalidValue {
                resource_id,
                message: format!("unknown security mode {other}"),
            }),
        }
    }
}

/// Credentials of a server account on a device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecurityDefinition {
    /// Server URI.
    pub server_uri: String,
    /// Whether this is the bootstrap server.
    pub bootstrap_server: bool,
    /// Security mode.
    pub security_mode: SecurityMode,
    /// Public key or PSK identity.
    pub public_key_or_identity: Option<Vec<u8>>,
    /// Server public key.
    pub server_public_key: Option<Vec<u8>>,
    /// Secret key.
    pub secret_key: Option<Vec<u8>>,
    /// Short server ID.
    pub short_server_id: Option<u16>,
    /// Client hold-off time in seconds.
    pub client_hold_off_time: Option<u64>,
}

impl TlvEntity for SecurityDefinition {
    fn serialize(&self) -> Result<Vec<u8>, CodecError> {
        let mut w = TlvWriter::new();
        let res = |r: SecurityResource| r as u16;
        w.write(
            TlvKind::ResourceWithValue,
            res(SecurityResource::ServerUri),
            self.server_uri.as_bytes(),
        )?;
        w.write(
            TlvKind::ResourceWithValue,
            res(SecurityResource::BootstrapServer),
            &encode_bool(self.bootstrap_server),
        )?;
        w.write(
            TlvKind::ResourceWithValue,
            res(SecurityResource::SecurityMode),
            &encode_integer(self.security_mode.code()),
        )?;
        for (resource, value) in [
            (
                SecurityResource::PublicKeyOrIdentity,
                &self.public_key_or_identity,
            ),
            (SecurityResource::ServerPublicKey, &self.server_public_key),
            (SecurityResource::SecretKey, &self.secret_key),
        ] {
            if let Some(value) = value {
                w.write(TlvKind::ResourceWithValue, res(resource), value)?;
            }
        }
        if let Some(id) = self.short_server_id {
            w.write(
                TlvKind::ResourceWithValue,
                res(SecurityResource::ShortServerId),
                &encode_integer(i64::from(id)),
            )?;
        }
        if let Some(hold_off) = self.client_hold_off_time {
            w.write(
                TlvKind::ResourceWithValue,
                res(SecurityResource::ClientHoldOffTime),
                &encode_u64(hold_off),
            )?;
        }
        Ok(w.into_bytes())
    }

    fn deserialize(bytes: &[u8]) -> Result<Self, CodecError> {
        let mut server_uri = None;
        let mut bootstrap_server = None;
        let mut security_mode = None;
        let mut public_key_or_identity = None;
        let mut server_public_key = None;
        let mut secret_key = None;
        let mut short_server_id: Option<u16> = None;
        let mut client_hold_off_time = None;

        for entry in TlvReader::new(bytes) {
            let entry = entry?;
            let Some(resource) = SecurityResource::from_id(entry.id) else {
                trace!(id = entry.id, "Skipping unknown security resource");
                continue;
            };
            let (id, value) = (entry.id, entry.value);
            match resource {
                SecurityResource::ServerUri => server_uri = Some(decode_string(value, id)?),
                SecurityResource::BootstrapServer => {
                    bootstrap_server = Some(decode_bool(value, id)?);
                }
                SecurityResource::SecurityMode => {
                    security_mode = Some(SecurityMode::from_code(decode_integer(value, id)?, id)?);
                }
                SecurityResource::PublicKeyOrIdentity => {
                    public_key_or_identity = Some(value.to_vec());
                }
                SecurityResource::ServerPublicKey => server_public_key = Some(value.to_vec()),
                SecurityResource::SecretKey => secret_key = Some(value.to_vec()),
                SecurityResource::ShortServerId => short_server_id = Some(int_field(value, id)?),
                SecurityResource::ClientHoldOffTime => {
                    client_hold_off_time = Some(decode_u64(value, id)?);
                }
            }
        }

        Ok(Self {
            server_uri: server_uri.ok_or(CodecError::MissingField("ServerURI"))?,
            bootstrap_server: bootstrap_server
                .ok_or(CodecError::MissingField("BootstrapServer"))?,
            security_mode: security_mode.ok_or(CodecError::MissingField("SecurityMode"))?,
            public_key_or_identity,
            server_public_key,
            secret_key,
            short_server_id,
            client_hold_off_time,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server() -> ServerDefinition {
        ServerDefinition {
            short_server_id: 101,
            lifetime: 86_400,
            default_minimum_period: Some(1),
            default_maximum_period: None,
            disable_timeout: None,
            notification_storing: true,
            binding: BindingMode::UdpQueued,
        }
    }

    #[test]
    fn server_round_trip() {
        let original = server();
        let bytes = original.serialize().unwrap();
        assert_eq!(ServerDefinition::deserialize(&bytes).unwrap(), original);
    }

    #[test]
    fn unset_fields_are_not_written() {
        let bytes = server().serialize().unwrap();
        let ids: Vec<u16> = TlvReader::new(&bytes).map(|e| e.unwrap().id).collect();
        assert_eq!(ids, vec![0, 1, 2, 6, 7]);
    }

    #[test]
    fn lifetime_is_eight_bytes() {
        let bytes = server().serialize().unwrap();
        let lifetime = TlvReader::new(&bytes)
            .map(Result::unwrap)
            .find(|e| e.id == ServerResource::Lifetime as u16)
            .unwrap();
        assert_eq!(lifetime.value.len(), 8);
    }

    #[test]
    fn missing_mandatory_field() {
        let mut w = TlvWriter::new();
        w.write(TlvKind::ResourceWithValue, 0, &encode_integer(1))
            .unwrap();
        assert_eq!(
            ServerDefinition::deserialize(&w.into_bytes()),
            Err(CodecError::MissingField("Lifetime"))
        );
    }

    #[test]
    fn security_round_trip_with_unknown_entry() {
        let original = SecurityDefinition {
            server_uri: "coaps://lwm2m.example.com:5684".to_string(),
            bootstrap_server: false,
            security_mode: SecurityMode::PreSharedKey,
            public_key_or_identity: Some(b"device-1".to_vec()),
            server_public_key: None,
            secret_key: Some(vec![0xDE, 0xAD, 0xBE, 0xEF]),
            short_server_id: Some(101),
            client_hold_off_time: None,
        };

        let mut bytes = original.serialize().unwrap();
        let mut extra = TlvWriter::new();
        extra
            .write(TlvKind::ResourceWithValue, 42, b"future field")
            .unwrap();
        bytes.extend(extra.into_bytes());

        assert_eq!(SecurityDefinition::deserialize(&bytes).unwrap(), original);
    }

    #[test]
    fn invalid_security_mode() {
        let mut w = TlvWriter::new();
        w.write(TlvKind::ResourceWithValue, 2, &encode_integer(9))
            .unwrap();
        assert!(matches!(
            SecurityDefinition::deserialize(&w.into_bytes()),
            Err(CodecError::InvalidValue { resource_id: 2, .. })
        ));
    }
}

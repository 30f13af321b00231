// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Registered devices.

use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::{ClientId, OrganisationId};

/// Transport binding negotiated at registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BindingMode {
    /// `U`
    Udp,
    /// `UQ`
    UdpQueued,
    /// `S`
    Sms,
    /// `SQ`
    SmsQueued,
    /// `US`
    UdpSms,
    /// `UQS`
    UdpQueuedSms,
}

impl BindingMode {
    /// Returns the registration string (`U`, `UQ`, ...).
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Udp => "U",
            Self::UdpQueued => "UQ",
            Self::Sms => "S",
            Self::SmsQueued => "SQ",
            Self::UdpSms => "US",
            Self::UdpQueuedSms => "UQS",
        }
    }

    /// Returns `true` if the device queues requests while sleeping.
    #[must_use]
    pub fn is_queued(self) -> bool {
        matches!(self, Self::UdpQueued | Self::SmsQueued | Self::UdpQueuedSms)
    }
}

impl fmt::Display for BindingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BindingMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "U" => Ok(Self::Udp),
            "UQ" => Ok(Self::UdpQueued),
            "S" => Ok(Self::Sms),
            "SQ" => Ok(Self::SmsQueued),
            "US" => Ok(Self::UdpSms),
            "UQS" => Ok(Self::UdpQueuedSms),
            other => Err(format!("invalid binding mode: {other}")),
        }
    }
}

/// A registered device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Client {
    /// Unique client ID.
    pub id: ClientId,
    /// Owning organisation.
    pub organisation_id: OrganisationId,
    /// Endpoint name the device registered with.
    pub name: String,
    /// When the registration expires unless refreshed.
    pub lifetime: DateTime<Utc>,
    /// LWM2M protocol version.
    pub version: String,
    /// Transport binding.
    pub binding: BindingMode,
    /// Object types the device advertised.
    pub supported_types: Vec<u16>,
    /// Network endpoint.
    pub address: SocketAddr,
}

impl Client {
    /// Returns `true` once the registration lifetime has elapsed.
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.lifetime
    }

    /// Extends the registration by `lifetime_secs` from `now`.
    pub fn refresh(&mut self, lifetime_secs: u32, now: DateTime<Utc>) {
        self.lifetime = now + Duration::seconds(i64::from(lifetime_secs));
    }

    /// Returns `true` if the device advertised the object type.
    #[must_use]
    pub fn supports(&self, object_id: u16) -> bool {
        self.supported_types.contains(&object_id)
    }
}

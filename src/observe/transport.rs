// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Request/response boundary to the device.
//!
//! The CoAP stack itself lives outside this crate. The tracker only needs to
//! send a request to one device and read the response.

use std::fmt;
use std::future::Future;

use super::ResourcePath;
use crate::error::ObservationError;

/// Request methods used by the tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CoapMethod {
    /// Read, optionally with the Observe option.
    Get,
    /// Write notification attributes.
    Put,
}

/// Observe option value that registers an observation.
pub const OBSERVE_REGISTER: u32 = 0;
/// Observe option value that deregisters an observation.
pub const OBSERVE_DEREGISTER: u32 = 1;

/// A request to a device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoapRequest {
    /// Method.
    pub method: CoapMethod,
    /// Target path.
    pub path: ResourcePath,
    /// Observe option.
    pub observe: Option<u32>,
    /// URI query, without the leading `?`.
    pub query: Option<String>,
}

impl CoapRequest {
    /// `GET path` with `Observe: 0`.
    #[must_use]
    pub fn observe(path: ResourcePath) -> Self {
        Self {
            method: CoapMethod::Get,
            path,
            observe: Some(OBSERVE_REGISTER),
            query: None,
        }
    }

    /// `GET path` with `Observe: 1`.
    #[must_use]
    pub fn cancel_observe(path: ResourcePath) -> Self {
        Self {
            method: CoapMethod::Get,
            path,
            observe: Some(OBSERVE_DEREGISTER),
            query: None,
        }
    }

    /// `PUT path?query` writing notification attributes.
    #[must_use]
    pub fn write_attributes(path: ResourcePath, query: String) -> Self {
        Self {
            method: CoapMethod::Put,
            path,
            observe: None,
            query: Some(query),
        }
    }

    /// Bytes of the URI path and query carried by the request.
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        self.path.to_string().len() + self.query.as_ref().map_or(0, String::len)
    }
}

/// A CoAP response code in `class.detail` form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResponseCode {
    /// Class digit: 2 success, 4 client error, 5 server error.
    pub class: u8,
    /// Detail, two digits.
    pub detail: u8,
}

impl ResponseCode {
    /// 2.04 Changed.
    pub const CHANGED: Self = Self::new(2, 4);
    /// 2.05 Content.
    pub const CONTENT: Self = Self::new(2, 5);
    /// 4.04 Not Found.
    pub const NOT_FOUND: Self = Self::new(4, 4);
    /// 4.05 Method Not Allowed.
    pub const METHOD_NOT_ALLOWED: Self = Self::new(4, 5);

    /// Creates a code.
    #[must_use]
    pub const fn new(class: u8, detail: u8) -> Self {
        Self { class, detail }
    }

    /// Returns `true` for 2.xx codes.
    #[must_use]
    pub const fn is_success(self) -> bool {
        self.class == 2
    }
}

impl fmt::Display for ResponseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:02}", self.class, self.detail)
    }
}

/// A device response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoapResponse {
    /// Response code.
    pub code: ResponseCode,
    /// TLV payload, possibly empty.
    pub payload: Vec<u8>,
}

impl CoapResponse {
    /// A 2.05 response with a payload.
    #[must_use]
    pub fn content(payload: Vec<u8>) -> Self {
        Self {
            code: ResponseCode::CONTENT,
            payload,
        }
    }

    /// An empty response with the given code.
    #[must_use]
    pub fn empty(code: ResponseCode) -> Self {
        Self {
            code,
            payload: Vec::new(),
        }
    }
}

/// Sends requests to one connected device.
pub trait DeviceTransport: Send + Sync + 'static {
    /// Sends a request and waits for the response.
    fn send(
        &self,
        request: CoapRequest,
    ) -> impl Future<Output = Result<CoapResponse, ObservationError>> + Send;

    /// Forgets an observation locally, so the next notification is answered
    /// with a reset. No request is sent.
    fn cancel_local(&self, path: ResourcePath) -> impl Future<Output = ()> + Send;
}

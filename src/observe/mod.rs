// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Device observations.
//!
//! One [`ObservationTracker`] exists per connected client. It issues
//! observe requests through a [`DeviceTransport`], remembers what is
//! observed, and decodes incoming notifications into change events.
//!
//! # Examples
//!
//! ```
//! use std::sync::Arc;
//!
//! use lwm2m_notify::error::ObservationError;
//! use lwm2m_notify::event::EventBus;
//! use lwm2m_notify::model::{ClientId, ObjectDefinition, OrganisationId};
//! use lwm2m_notify::observe::{
//!     CoapRequest, CoapResponse, DeviceTransport, ObservationTracker, ObserveOutcome, ResourcePath,
//!     ResponseCode,
//! };
//!
//! struct Loopback;
//!
//! impl DeviceTransport for Loopback {
//!     async fn send(&self, _request: CoapRequest) -> Result<CoapResponse, ObservationError> {
//!         Ok(CoapResponse::empty(ResponseCode::CONTENT))
//!     }
//!
//!     async fn cancel_local(&self, _path: ResourcePath) {}
//! }
//!
//! # async fn example() -> Result<(), ObservationError> {
//! let tracker = ObservationTracker::new(
//!     ClientId::new(),
//!     OrganisationId::new(1),
//!     Loopback,
//!     EventBus::new(),
//! );
//! let definition = Arc::new(ObjectDefinition::new(3303, "Temperature"));
//!
//! let outcome = tracker.observe(definition, Some(0), None, None).await?;
//! assert!(matches!(outcome, ObserveOutcome::Established { .. }));
//! # Ok(())
//! # }
//! ```

mod metrics;
mod path;
mod tracker;
mod transport;

pub use metrics::{MetricsSnapshot, TransferMetrics};
pub use path::ResourcePath;
pub use tracker::{ObservationTracker, ObserveOutcome};
pub use transport::{
    CoapMethod, CoapRequest, CoapResponse, DeviceTransport, OBSERVE_DEREGISTER, OBSERVE_REGISTER,
    ResponseCode,
};

// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Binary TLV resource codec.
//!
//! - [`entry`]: framing of single entries and primitive value encodings
//! - [`object`]: schema-driven encoding of object instances
//! - [`entity`]: server and security definitions with fixed resource IDs
//!
//! Decode faults surface as [`CodecError`](crate::error::CodecError). On the
//! notification path the caller logs and drops the payload.

pub mod entity;
pub mod entry;
pub mod object;

pub use entity::{
    SecurityDefinition, SecurityMode, SecurityResource, ServerDefinition, ServerResource,
    TlvEntity,
};
pub use entry::{TlvEntry, TlvKind, TlvReader, TlvWriter};
pub use object::{decode_object, decode_objects, decode_property, encode_object, encode_objects};

// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Domain model shared by all pipeline stages.
//!
//! - [`Client`] - a registered device
//! - [`ObjectDefinition`] / [`PropertyDefinition`] - resource schemas
//! - [`Object`] / [`Property`] / [`PropertyValue`] - decoded instances
//! - [`Subscription`] - standing interests in changes or lifecycle events

mod client;
mod definition;
mod ids;
mod object;
mod subscription;

pub use client::{BindingMode, Client};
pub use definition::{
    DefinitionLookup, DefinitionRegistry, ObjectDefinition, PropertyDataType, PropertyDefinition,
};
pub use ids::{ClientId, OrganisationId, SubscriptionId};
pub use object::{Object, Property, PropertyContent, PropertyValue, ResourceInstance};
pub use subscription::{
    NotificationParameters, Subscription, SubscriptionScope, SubscriptionType,
};

// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! HTTP delivery of dispatched notifications.
//!
//! [`WebhookWorker`] consumes the queue fed by
//! [`NotificationDispatcher`](crate::dispatch::NotificationDispatcher) and
//! POSTs a [`WebhookPayload`] to each subscriber, as JSON or XML depending on
//! the content type the subscriber accepts.

mod payload;
mod worker;

pub use payload::{InstanceValue, Link, ObjectValue, PayloadFormat, ResourceValue, WebhookPayload};
pub use worker::{DeliveryOutcome, WebhookWorker};

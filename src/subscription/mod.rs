// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Subscription matching.
//!
//! - [`SubscriptionStore`] - persistence boundary, with an in-memory implementation
//! - [`SubscriptionMatcher`] - finds the subscriptions interested in an event
//!   and re-arms observations when a client reconnects
//!
//! Matches carry no ordering; each one is dispatched independently.

mod matcher;
mod store;

pub use matcher::{SubscriptionMatcher, matches_change};
pub use store::{InMemorySubscriptionStore, SubscriptionStore};

// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Fan-out of matched events.
//!
//! - [`NotificationDispatcher`] publishes one bus message per matched
//!   subscription to the webhook queue.
//! - [`ChangeNotificationServer`] pushes table-change frames to connected
//!   TCP clients; [`ChangeNotificationClient`] is the other end.

mod change_server;
mod dispatcher;
mod frame;
mod notification;

pub use change_server::{ChangeNotificationClient, ChangeNotificationServer, MAX_FRAME};
pub use dispatcher::NotificationDispatcher;
pub use frame::{ChangeFrame, Notification};
pub use notification::DispatchedNotification;

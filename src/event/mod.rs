// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Internal event bus.
//!
//! The [`ObservationTracker`](crate::observe::ObservationTracker) and the
//! lifecycle hooks of [`NotificationPipeline`](crate::pipeline::NotificationPipeline)
//! publish [`PipelineEvent`]s here; the pipeline consumes them and turns
//! matches into bus messages.

mod event_bus;
mod pipeline_event;

pub use event_bus::{DEFAULT_CHANNEL_CAPACITY, EventBus};
pub use pipeline_event::{ChangeEvent, LifecycleEvent, LifecycleKind, PipelineEvent};

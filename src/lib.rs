// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! `lwm2m_notify` - observation and change notification for an LWM2M server.
//!
//! This library covers the notification side of a device management server:
//! it tracks the CoAP observations of connected devices, decodes their TLV
//! payloads, matches the changes against subscriptions and delivers the
//! result reliably over a message bus to HTTP webhooks.
//!
//! # Data Flow
//!
//! ```text
//! device ──notify──▶ ObservationTracker ──▶ EventBus ──▶ NotificationPipeline
//!                                                            │
//!                       SubscriptionMatcher ◀────────────────┤
//!                                                            ▼
//!        WebhookWorker ◀── MessageBus ◀── NotificationDispatcher
//!              │
//!              └──POST──▶ subscriber
//! ```
//!
//! # Modules
//!
//! - [`tlv`]: the LWM2M TLV codec, schema driven
//! - [`bus`]: message bus with reconnect, delayed requeue and an in-memory
//!   or MQTT transport
//! - [`observe`]: per-device observation tracking
//! - [`subscription`]: subscription store and matching
//! - [`dispatch`]: bus fan-out and the table-change TCP broadcast
//! - [`webhook`]: HTTP delivery with retry
//! - [`pipeline`]: wiring of the above
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use lwm2m_notify::bus::{InMemoryBroker, MessageBus};
//! use lwm2m_notify::config::PipelineConfig;
//! use lwm2m_notify::dispatch::NotificationDispatcher;
//! use lwm2m_notify::event::EventBus;
//! use lwm2m_notify::model::DefinitionRegistry;
//! use lwm2m_notify::pipeline::NotificationPipeline;
//! use lwm2m_notify::subscription::{InMemorySubscriptionStore, SubscriptionMatcher};
//! use lwm2m_notify::webhook::WebhookWorker;
//!
//! #[tokio::main]
//! async fn main() -> lwm2m_notify::Result<()> {
//!     let config = PipelineConfig::new();
//!     config.validate()?;
//!
//!     let bus = MessageBus::new(InMemoryBroker::new(), config.bus.clone());
//!     bus.start().await?;
//!
//!     let worker = WebhookWorker::new(bus.clone(), config.webhook.clone())?;
//!     worker.start().await?;
//!
//!     let pipeline = NotificationPipeline::new(
//!         EventBus::with_capacity(config.event_capacity),
//!         SubscriptionMatcher::new(Arc::new(InMemorySubscriptionStore::new())),
//!         NotificationDispatcher::new(bus.clone(), &config.webhook),
//!         Arc::new(DefinitionRegistry::new()),
//!     );
//!     pipeline.start();
//!
//!     // hand pipeline.events() to the trackers of connecting devices
//!
//!     pipeline.stop();
//!     bus.stop().await?;
//!     Ok(())
//! }
//! ```
//!
//! # Features
//!
//! - `webhook` (default): the [`webhook`] module, with reqwest and quick-xml
//! - `mqtt` (default): [`bus::MqttConnector`], with rumqttc

pub mod bus;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod event;
pub mod model;
pub mod observe;
pub mod pipeline;
pub mod subscription;
pub mod tlv;
#[cfg(feature = "webhook")]
pub mod webhook;

pub use error::{Error, Result};

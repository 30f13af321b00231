// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Consumer of the webhook queue.

use std::time::Duration;

use reqwest::{Client, StatusCode, header};

use super::payload::{PayloadFormat, WebhookPayload};
use crate::bus::{BusConnector, MessageBus, QueueOptions, ServiceEventMessage, handler};
use crate::config::WebhookConfig;
use crate::dispatch::DispatchedNotification;
use crate::error::{BusError, DeliveryError};

/// What happened to one delivery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// The subscriber accepted the notification.
    Delivered,
    /// The notification was given up on.
    Dropped,
    /// The notification goes back to the queue after the delay.
    Retry(Duration),
}

/// POSTs dispatched notifications to their subscribers.
///
/// Acknowledgement follows the subscriber's answer: 2xx acks; 400, 401, 404
/// and 405 ack and drop; anything else (including timeouts) nacks with the
/// delay of [`WebhookConfig::retry`] until the attempt cap is reached.
///
/// # Examples
///
/// ```no_run
/// use lwm2m_notify::bus::{InMemoryBroker, MessageBus};
/// use lwm2m_notify::config::{BusConfig, WebhookConfig};
/// use lwm2m_notify::webhook::WebhookWorker;
///
/// # async fn example() -> lwm2m_notify::Result<()> {
/// let bus = MessageBus::new(InMemoryBroker::new(), BusConfig::new());
/// let worker = WebhookWorker::new(bus, WebhookConfig::new())?;
/// worker.start().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct WebhookWorker<C: BusConnector> {
    bus: MessageBus<C>,
    client: Client,
    config: WebhookConfig,
}

impl<C: BusConnector> Clone for WebhookWorker<C> {
    fn clone(&self) -> Self {
        Self {
            bus: self.bus.clone(),
            client: self.client.clone(),
            config: self.config.clone(),
        }
    }
}

impl<C: BusConnector> WebhookWorker<C> {
    /// Creates a worker with an HTTP client using the configured timeout.
    ///
    /// # Errors
    ///
    /// Returns [`DeliveryError::Http`] if the HTTP client cannot be built.
    pub fn new(bus: MessageBus<C>, config: WebhookConfig) -> Result<Self, DeliveryError> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(DeliveryError::Http)?;

        Ok(Self {
            bus,
            client,
            config,
        })
    }

    /// Starts consuming the webhook queue.
    ///
    /// # Errors
    ///
    /// Returns [`BusError`] if the subscription fails.
    pub async fn start(&self) -> Result<String, BusError> {
        let worker = self.clone();
        let queue = self
            .bus
            .subscribe(
                &self.config.queue_name,
                QueueOptions::durable(),
                Some(&self.config.routing_key),
                handler(move |message| {
                    let worker = worker.clone();
                    async move {
                        worker.handle(message).await;
                    }
                }),
            )
            .await?;
        tracing::info!(queue = %queue, "Webhook worker started");
        Ok(queue)
    }

    /// Stops consuming. Messages stay queued.
    ///
    /// # Errors
    ///
    /// Returns [`BusError`] if the broker refuses the cancel.
    pub async fn stop(&self) -> Result<(), BusError> {
        self.bus.unsubscribe(&[&self.config.queue_name]).await
    }

    /// Delivers one message and acks or nacks it.
    pub async fn handle(&self, message: ServiceEventMessage) -> DeliveryOutcome {
        let notification = match DispatchedNotification::from_message(&message) {
            Ok(n) => n,
            Err(e) => {
                tracing::warn!(message = %message.message_id, error = %e, "Dropping malformed notification");
                self.settle(&message, DeliveryOutcome::Dropped).await;
                return DeliveryOutcome::Dropped;
            }
        };

        let result = self.deliver(&notification).await;
        let outcome = self.classify(&result, message.requeue_count());
        match (&result, outcome) {
            (Ok(()), _) => tracing::debug!(
                subscription = %notification.subscription_id,
                url = %notification.url,
                "Webhook delivered"
            ),
            (Err(e), DeliveryOutcome::Retry(delay)) => tracing::debug!(
                subscription = %notification.subscription_id,
                url = %notification.url,
                attempt = message.requeue_count() + 1,
                delay_ms = delay.as_millis(),
                error = %e,
                "Webhook failed, will retry"
            ),
            (Err(e), _) => tracing::warn!(
                subscription = %notification.subscription_id,
                url = %notification.url,
                attempt = message.requeue_count() + 1,
                error = %e,
                "Webhook dropped"
            ),
        }

        self.settle(&message, outcome).await;
        outcome
    }

    /// POSTs the notification once.
    ///
    /// # Errors
    ///
    /// Returns [`DeliveryError::Status`] for a non-2xx answer,
    /// [`DeliveryError::Http`] for a transport failure and
    /// [`DeliveryError::Serialization`] if the body cannot be rendered.
    pub async fn deliver(&self, notification: &DispatchedNotification) -> Result<(), DeliveryError> {
        let format = PayloadFormat::for_content_type(&notification.accept_content_type);
        let body = WebhookPayload::from_notification(notification, &self.config.link_base)
            .render(format)?;

        let response = self
            .client
            .post(&notification.url)
            .header(header::CONTENT_TYPE, &notification.accept_content_type)
            .body(body)
            .send()
            .await
            .map_err(DeliveryError::Http)?;

        if !response.status().is_success() {
            return Err(DeliveryError::Status(response.status().as_u16()));
        }
        Ok(())
    }

    /// Maps a delivery result and the number of previous requeues to an
    /// outcome.
    #[must_use]
    pub fn classify(&self, result: &Result<(), DeliveryError>, requeue_count: u32) -> DeliveryOutcome {
        match result {
            Ok(()) => DeliveryOutcome::Delivered,
            Err(DeliveryError::Status(status)) if is_permanent(*status) => DeliveryOutcome::Dropped,
            Err(DeliveryError::Serialization(_)) => DeliveryOutcome::Dropped,
            Err(_) => {
                // requeue_count + 1 attempts have been made so far
                let next_attempt = requeue_count.saturating_add(2);
                if self.config.retry.allows_attempt(next_attempt) {
                    DeliveryOutcome::Retry(self.config.retry.delay_for_attempt(requeue_count))
                } else {
                    DeliveryOutcome::Dropped
                }
            }
        }
    }

    async fn settle(&self, message: &ServiceEventMessage, outcome: DeliveryOutcome) {
        let result = match outcome {
            DeliveryOutcome::Delivered | DeliveryOutcome::Dropped => {
                self.bus.ack_message(message).await
            }
            DeliveryOutcome::Retry(delay) => self.bus.nack_message(message, Some(delay)).await,
        };
        if let Err(e) = result {
            tracing::error!(message = %message.message_id, error = %e, "Failed to settle webhook message");
        }
    }
}

fn is_permanent(status: u16) -> bool {
    [
        StatusCode::BAD_REQUEST,
        StatusCode::UNAUTHORIZED,
        StatusCode::NOT_FOUND,
        StatusCode::METHOD_NOT_ALLOWED,
    ]
    .iter()
    .any(|s| s.as_u16() == status)
}

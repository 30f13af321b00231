// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Publishing matched events to the webhook queue.

use super::notification::DispatchedNotification;
use crate::bus::{BusConnector, MessageBus, PublishMode};
use crate::config::WebhookConfig;
use crate::error::BusError;
use crate::event::{ChangeEvent, LifecycleEvent};
use crate::model::Subscription;

/// Publishes one bus message per matched subscription.
///
/// Messages use [`PublishMode::Confirms`] so the webhook queue receives each
/// notification at least once. A failed publish is logged and does not
/// prevent the remaining matches from being published.
#[derive(Debug)]
pub struct NotificationDispatcher<C: BusConnector> {
    bus: MessageBus<C>,
    routing_key: String,
}

impl<C: BusConnector> Clone for NotificationDispatcher<C> {
    fn clone(&self) -> Self {
        Self {
            bus: self.bus.clone(),
            routing_key: self.routing_key.clone(),
        }
    }
}

impl<C: BusConnector> NotificationDispatcher<C> {
    /// Creates a dispatcher publishing to `config.routing_key`.
    #[must_use]
    pub fn new(bus: MessageBus<C>, config: &WebhookConfig) -> Self {
        Self {
            bus,
            routing_key: config.routing_key.clone(),
        }
    }

    /// Routing key messages are published to.
    #[must_use]
    pub fn routing_key(&self) -> &str {
        &self.routing_key
    }

    /// Dispatches a resource change to its matches and returns how many
    /// messages were published.
    pub async fn dispatch_change(&self, event: &ChangeEvent, matches: &[Subscription]) -> usize {
        let mut published = 0;
        for subscription in matches {
            let notification = DispatchedNotification::for_change(subscription, event);
            if self.publish(&notification).await {
                published += 1;
            }
        }
        published
    }

    /// Dispatches a lifecycle transition to its matches and returns how many
    /// messages were published.
    pub async fn dispatch_lifecycle(
        &self,
        event: &LifecycleEvent,
        matches: &[Subscription],
    ) -> usize {
        let mut published = 0;
        for subscription in matches {
            let notification = DispatchedNotification::for_lifecycle(subscription, event);
            if self.publish(&notification).await {
                published += 1;
            }
        }
        published
    }

    async fn publish(&self, notification: &DispatchedNotification) -> bool {
        let result: Result<(), BusError> = async {
            let message = notification.to_message()?;
            self.bus
                .publish(&self.routing_key, message, PublishMode::Confirms)
                .await
        }
        .await;

        match result {
            Ok(()) => {
                tracing::debug!(
                    subscription = %notification.subscription_id,
                    client = %notification.client_id,
                    kind = %notification.subscription_type,
                    "Notification dispatched"
                );
                true
            }
            Err(e) => {
                tracing::warn!(
                    subscription = %notification.subscription_id,
                    error = %e,
                    "Failed to dispatch notification"
                );
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::Utc;
    use tokio::sync::mpsc;
    use uuid::Uuid;

    use super::*;
    use crate::bus::{InMemoryBroker, QueueOptions, ServiceEventMessage, handler, params};
    use crate::config::BusConfig;
    use crate::model::{ClientId, Object, OrganisationId};

    #[tokio::test]
    async fn one_message_per_match() {
        let broker = InMemoryBroker::new();
        let bus = MessageBus::new(broker, BusConfig::new().with_host_name("test"));
        let config = WebhookConfig::new();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let consumer = bus.clone();
        bus.subscribe(
            &config.queue_name,
            QueueOptions::durable(),
            Some(&config.routing_key),
            handler(move |message: ServiceEventMessage| {
                let consumer = consumer.clone();
                let tx = tx.clone();
                async move {
                    let _ = consumer.ack_message(&message).await;
                    let _ = tx.send(message);
                }
            }),
        )
        .await
        .unwrap();

        let org = OrganisationId::new(1);
        let client_id = ClientId::new();
        let definition = Uuid::new_v4();
        let matches = vec![
            Subscription::observation(org, client_id, definition, "http://a"),
            Subscription::observation(org, client_id, definition, "http://b"),
        ];
        let event = ChangeEvent {
            client_id,
            organisation_id: org,
            object_definition_id: definition,
            object_type: 3303,
            instance_id: Some(0),
            changed_properties: Vec::new(),
            object: Object::new(definition, Some(0)),
            time_triggered: Utc::now(),
        };

        let dispatcher = NotificationDispatcher::new(bus.clone(), &config);
        assert_eq!(dispatcher.dispatch_change(&event, &matches).await, 2);

        let mut urls = Vec::new();
        for _ in 0..2 {
            let message = tokio::time::timeout(Duration::from_secs(2), rx.recv())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(message.publish_mode, PublishMode::Confirms);
            assert_eq!(message.organisation_id(), Some(org));
            urls.push(message.string(params::URL).unwrap().to_string());
        }
        urls.sort();
        assert_eq!(urls, vec!["http://a", "http://b"]);
    }

    #[tokio::test]
    async fn no_matches_publishes_nothing() {
        let bus = MessageBus::new(InMemoryBroker::new(), BusConfig::new().with_host_name("test"));
        let dispatcher = NotificationDispatcher::new(bus, &WebhookConfig::new());
        let event = LifecycleEvent {
            client_id: ClientId::new(),
            organisation_id: OrganisationId::new(1),
            kind: crate::event::LifecycleKind::Connected,
            time: Utc::now(),
        };
        assert_eq!(dispatcher.dispatch_lifecycle(&event, &[]).await, 0);
    }
}

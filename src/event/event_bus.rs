// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! In-process distribution of pipeline events.

use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::{broadcast, mpsc};

use super::PipelineEvent;

/// Default channel capacity for the event bus.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// Distributes [`PipelineEvent`]s.
///
/// Events go two ways. The router (at most one, normally the
/// notification pipeline) receives every event through a bounded queue;
/// when that queue is full, [`publish`](Self::publish) waits, so a burst
/// slows the publishers down instead of losing events. Observers attached
/// with [`subscribe`](Self::subscribe) get a broadcast copy.
///
/// # Capacity
///
/// An observer that falls more than `capacity` events behind loses the
/// oldest ones and sees `RecvError::Lagged`. The router never loses
/// events.
///
/// # Examples
///
/// ```
/// use lwm2m_notify::event::EventBus;
///
/// let bus = EventBus::new();
/// let _rx = bus.subscribe();
/// assert_eq!(bus.subscriber_count(), 1);
/// ```
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<PipelineEvent>,
    router: Arc<RwLock<Option<mpsc::Sender<PipelineEvent>>>>,
    capacity: usize,
}

impl EventBus {
    /// Creates a bus with the default capacity.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    /// Creates a bus buffering up to `capacity` events per receiver.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            router: Arc::new(RwLock::new(None)),
            capacity,
        }
    }

    /// Subscribes an observer to events published from now on.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.sender.subscribe()
    }

    /// Attaches the router and returns its queue. A previous router is
    /// detached.
    #[must_use]
    pub fn route(&self) -> mpsc::Receiver<PipelineEvent> {
        let (tx, rx) = mpsc::channel(self.capacity);
        *self.router.write() = Some(tx);
        rx
    }

    /// Returns `true` while a router is attached and listening.
    #[must_use]
    pub fn is_routed(&self) -> bool {
        self.router.read().as_ref().is_some_and(|tx| !tx.is_closed())
    }

    /// Number of live observers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Publishes an event, waiting while the router's queue is full.
    ///
    /// Without a router the event only reaches observers; without either
    /// it is discarded.
    pub async fn publish(&self, event: PipelineEvent) {
        let _ = self.sender.send(event.clone());
        let router = self.router.read().clone();
        if let Some(router) = router
            && router.send(event).await.is_err()
        {
            tracing::debug!("Event router gone");
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::event::{LifecycleEvent, LifecycleKind};
    use crate::model::{ClientId, OrganisationId};

    fn connected(client_id: ClientId) -> PipelineEvent {
        PipelineEvent::Lifecycle(LifecycleEvent {
            client_id,
            organisation_id: OrganisationId::new(1),
            kind: LifecycleKind::Connected,
            time: Utc::now(),
        })
    }

    #[test]
    fn drop_subscriber_decrements_count() {
        let bus = EventBus::new();
        let rx = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 1);
        drop(rx);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn publish_delivers_to_multiple_subscribers() {
        let bus = EventBus::new();
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();

        let client_id = ClientId::new();
        bus.publish(connected(client_id)).await;

        assert_eq!(rx1.recv().await.unwrap().client_id(), client_id);
        assert_eq!(rx2.recv().await.unwrap().client_id(), client_id);
    }

    #[tokio::test]
    async fn publish_without_receivers_is_discarded() {
        let bus = EventBus::new();
        bus.publish(connected(ClientId::new())).await;
        assert!(!bus.is_routed());
    }

    #[test]
    fn clone_shares_same_channel() {
        let bus1 = EventBus::new();
        let bus2 = bus1.clone();
        let _rx = bus1.subscribe();
        assert_eq!(bus2.subscriber_count(), 1);
    }

    #[tokio::test]
    async fn slow_subscriber_lags() {
        let bus = EventBus::with_capacity(2);
        let mut rx = bus.subscribe();
        for _ in 0..4 {
            bus.publish(connected(ClientId::new())).await;
        }
        assert!(matches!(
            rx.recv().await,
            Err(broadcast::error::RecvError::Lagged(2))
        ));
    }

    #[tokio::test]
    async fn full_router_queue_holds_publishers_back() {
        let bus = EventBus::with_capacity(2);
        let mut router = bus.route();
        assert!(bus.is_routed());

        let publisher = bus.clone();
        let ids: Vec<ClientId> = (0..10).map(|_| ClientId::new()).collect();
        let sent = ids.clone();
        let task = tokio::spawn(async move {
            for id in sent {
                publisher.publish(connected(id)).await;
            }
        });

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(!task.is_finished());

        let mut received = Vec::new();
        while received.len() < ids.len() {
            received.push(router.recv().await.unwrap().client_id());
        }
        task.await.unwrap();
        assert_eq!(received, ids);
    }

    #[tokio::test]
    async fn dropped_router_does_not_block() {
        let bus = EventBus::with_capacity(1);
        drop(bus.route());
        assert!(!bus.is_routed());
        for _ in 0..3 {
            bus.publish(connected(ClientId::new())).await;
        }
    }
}

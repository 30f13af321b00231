// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Integration tests for webhook delivery using wiremock.

#![cfg(feature = "webhook")]

use std::time::Duration;

use chrono::Utc;
use lwm2m_notify::bus::{InMemoryBroker, MessageBus};
use lwm2m_notify::config::{BusConfig, RetryPolicy, WebhookConfig};
use lwm2m_notify::dispatch::NotificationDispatcher;
use lwm2m_notify::event::{LifecycleEvent, LifecycleKind};
use lwm2m_notify::model::{ClientId, OrganisationId, Subscription, SubscriptionType};
use lwm2m_notify::webhook::WebhookWorker;
use tokio::time::{Instant, sleep};
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

struct Harness {
    broker: InMemoryBroker,
    bus: MessageBus<InMemoryBroker>,
    dispatcher: NotificationDispatcher<InMemoryBroker>,
    queue: String,
}

async fn harness(retry: RetryPolicy) -> Harness {
    let broker = InMemoryBroker::new();
    let bus = MessageBus::new(broker.clone(), BusConfig::new().with_host_name("test"));
    let config = WebhookConfig::new()
        .with_retry(retry)
        .with_request_timeout(Duration::from_secs(2))
        .with_link_base("https://api.example.com");

    let worker = WebhookWorker::new(bus.clone(), config.clone()).unwrap();
    let queue = worker.start().await.unwrap();

    Harness {
        broker,
        dispatcher: NotificationDispatcher::new(bus.clone(), &config),
        bus,
        queue,
    }
}

fn backoff(delay: Duration) -> RetryPolicy {
    RetryPolicy::default()
        .with_initial_delay(delay)
        .with_max_delay(delay)
}

fn disconnected(org: OrganisationId) -> LifecycleEvent {
    LifecycleEvent {
        client_id: ClientId::new(),
        organisation_id: org,
        kind: LifecycleKind::Disconnected,
        time: Utc::now(),
    }
}

/// Waits until the server has seen `count` requests, then a little longer
/// so extra deliveries would show up.
async fn settle(server: &MockServer, count: usize) -> usize {
    for _ in 0..100 {
        if server.received_requests().await.unwrap_or_default().len() >= count {
            break;
        }
        sleep(Duration::from_millis(20)).await;
    }
    sleep(Duration::from_millis(200)).await;
    server.received_requests().await.unwrap_or_default().len()
}

/// Returns when the server has seen `count` requests.
async fn arrival(server: &MockServer, count: usize) -> Instant {
    for _ in 0..200 {
        if server.received_requests().await.unwrap_or_default().len() >= count {
            return Instant::now();
        }
        sleep(Duration::from_millis(10)).await;
    }
    panic!("request {count} never arrived");
}

// ============================================================================
// Outcomes
// ============================================================================

mod outcomes {
    use super::*;

    #[tokio::test]
    async fn success_is_acked() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hook"))
            .and(header(
                "content-type",
                Subscription::DEFAULT_CONTENT_TYPE,
            ))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let h = harness(RetryPolicy::immediate()).await;
        let org = OrganisationId::new(1);
        let subscription = Subscription::lifecycle(
            org,
            SubscriptionType::ClientDisconnected,
            format!("{}/hook", server.uri()),
        );
        let published = h
            .dispatcher
            .dispatch_lifecycle(&disconnected(org), &[subscription])
            .await;
        assert_eq!(published, 1);

        assert_eq!(settle(&server, 1).await, 1);
        assert_eq!(h.broker.unacked_count(), 0);

        let requests = server.received_requests().await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&requests[0].body).unwrap();
        assert_eq!(body["SubscriptionType"], "ClientDisconnected");
        assert!(body.get("Value").is_none());
        assert!(
            body["Links"][0]["href"]
                .as_str()
                .unwrap()
                .starts_with("https://api.example.com/subscriptions/")
        );
    }

    #[tokio::test]
    async fn unavailable_subscriber_is_tried_ten_times() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .expect(10)
            .mount(&server)
            .await;

        let h = harness(RetryPolicy::immediate()).await;
        let org = OrganisationId::new(1);
        let subscription = Subscription::lifecycle(
            org,
            SubscriptionType::ClientDisconnected,
            format!("{}/hook", server.uri()),
        );
        h.dispatcher
            .dispatch_lifecycle(&disconnected(org), &[subscription])
            .await;

        assert_eq!(settle(&server, 10).await, 10);
        assert_eq!(h.broker.unacked_count(), 0);
    }

    #[tokio::test]
    async fn missing_endpoint_is_tried_once() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&server)
            .await;

        let h = harness(RetryPolicy::immediate()).await;
        let org = OrganisationId::new(1);
        let subscription = Subscription::lifecycle(
            org,
            SubscriptionType::ClientDisconnected,
            format!("{}/hook", server.uri()),
        );
        h.dispatcher
            .dispatch_lifecycle(&disconnected(org), &[subscription])
            .await;

        assert_eq!(settle(&server, 1).await, 1);
        assert_eq!(h.broker.unacked_count(), 0);
    }

    #[tokio::test]
    async fn recovers_after_transient_failure() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .up_to_n_times(2)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(204))
            .mount(&server)
            .await;

        let h = harness(RetryPolicy::immediate()).await;
        let org = OrganisationId::new(1);
        let subscription = Subscription::lifecycle(
            org,
            SubscriptionType::ClientDisconnected,
            format!("{}/hook", server.uri()),
        );
        h.dispatcher
            .dispatch_lifecycle(&disconnected(org), &[subscription])
            .await;

        assert_eq!(settle(&server, 3).await, 3);
        let _ = h.bus.stop().await;
    }
}

// ============================================================================
// Content negotiation
// ============================================================================

mod content_type {
    use super::*;

    #[tokio::test]
    async fn xml_subscriber_gets_xml() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(header("content-type", "application/vnd.lwm2m.notification+xml"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let h = harness(RetryPolicy::immediate()).await;
        let org = OrganisationId::new(1);
        let subscription = Subscription::lifecycle(
            org,
            SubscriptionType::ClientDisconnected,
            format!("{}/hook", server.uri()),
        )
        .with_content_type("application/vnd.lwm2m.notification+xml");
        h.dispatcher
            .dispatch_lifecycle(&disconnected(org), &[subscription])
            .await;

        assert_eq!(settle(&server, 1).await, 1);
        let requests = server.received_requests().await.unwrap();
        let body = String::from_utf8(requests[0].body.clone()).unwrap();
        assert!(body.starts_with("<Notification>"), "{body}");
        assert!(body.contains("<SubscriptionType>ClientDisconnected</SubscriptionType>"));
    }
}

// ============================================================================
// Delayed retries
// ============================================================================

mod delayed_retry {
    use super::*;

    #[tokio::test]
    async fn retry_waits_for_the_backoff() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let h = harness(backoff(Duration::from_millis(300))).await;
        let org = OrganisationId::new(1);
        let subscription = Subscription::lifecycle(
            org,
            SubscriptionType::ClientDisconnected,
            format!("{}/hook", server.uri()),
        );
        h.dispatcher
            .dispatch_lifecycle(&disconnected(org), &[subscription])
            .await;

        let first = arrival(&server, 1).await;
        let second = arrival(&server, 2).await;
        assert!(second - first >= Duration::from_millis(250));

        assert_eq!(settle(&server, 2).await, 2);
        assert_eq!(h.broker.unacked_count(), 0);
        assert_eq!(h.broker.pending(&h.queue), 0);
    }

    #[tokio::test]
    async fn pending_retry_survives_shutdown() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let h = harness(backoff(Duration::from_millis(400))).await;
        let org = OrganisationId::new(1);
        let subscription = Subscription::lifecycle(
            org,
            SubscriptionType::ClientDisconnected,
            format!("{}/hook", server.uri()),
        );
        h.dispatcher
            .dispatch_lifecycle(&disconnected(org), &[subscription])
            .await;
        arrival(&server, 1).await;

        h.bus.stop().await.unwrap();
        sleep(Duration::from_millis(600)).await;

        assert_eq!(server.received_requests().await.unwrap().len(), 1);
        assert_eq!(h.broker.pending(&h.queue), 1);
        assert_eq!(h.broker.unacked_count(), 0);
    }
}

// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Resilient publish/subscribe over a [`BusConnector`].
//!
//! The bus keeps a ledger of every successful subscription. When the
//! transport reports a lost connection, a background task reconnects with
//! backoff and replays the ledger, so subscriber intent survives broker
//! restarts without the caller noticing.
//!
//! Every queue has its own worker task fed through an unbounded channel, so
//! a slow handler only holds back its own queue. The broker still owns
//! every message until the handler acks it.
//!
//! # Examples
//!
//! ```
//! use lwm2m_notify::bus::{InMemoryBroker, MessageBus, QueueOptions, ServiceEventMessage, PublishMode, handler};
//! use lwm2m_notify::config::BusConfig;
//!
//! # async fn example() -> lwm2m_notify::Result<()> {
//! let bus = MessageBus::new(InMemoryBroker::new(), BusConfig::new());
//!
//! let consumer = bus.clone();
//! bus.subscribe(
//!     "Audit",
//!     QueueOptions::durable(),
//!     Some("Audit.Events"),
//!     handler(move |message| {
//!         let consumer = consumer.clone();
//!         async move {
//!             let _ = consumer.ack_message(&message).await;
//!         }
//!     }),
//! )
//! .await?;
//!
//! bus.publish("Audit.Events", ServiceEventMessage::new(), PublishMode::Confirms).await?;
//! # bus.stop().await?;
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::{RwLock, mpsc};
use tokio::task::JoinHandle;

use super::message::{PublishMode, ServiceEventMessage, params};
use super::transport::{BusConnection, BusConnector, QueueSpec, TransportEvent};
use crate::config::BusConfig;
use crate::error::BusError;
use crate::model::OrganisationId;

/// Future returned by a [`MessageHandler`].
pub type HandlerFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Callback invoked for each delivered message.
///
/// The handler owns acknowledgement: it must call
/// [`MessageBus::ack_message`] or [`MessageBus::nack_message`].
pub type MessageHandler = Arc<dyn Fn(ServiceEventMessage) -> HandlerFuture + Send + Sync>;

/// Wraps an async closure into a [`MessageHandler`].
pub fn handler<F, Fut>(f: F) -> MessageHandler
where
    F: Fn(ServiceEventMessage) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move |message| Box::pin(f(message)))
}

tokio::task_local! {
    static ORGANISATION: OrganisationId;
}

/// Runs `f` with `organisation` as the ambient organisation.
///
/// Messages published inside the scope are tagged with it unless they
/// already carry an `OrganisationID`.
pub async fn with_organisation<F: Future>(organisation: OrganisationId, f: F) -> F::Output {
    ORGANISATION.scope(organisation, f).await
}

/// Returns the ambient organisation of the current task, if any.
#[must_use]
pub fn current_organisation() -> Option<OrganisationId> {
    ORGANISATION.try_with(|org| *org).ok()
}

/// How a logical queue maps to a broker queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueOptions {
    /// Survives broker restarts.
    pub durable: bool,
    /// One private queue per subscriber instance, removed with its
    /// connection.
    pub temporary: bool,
    /// Prefix the host name so each machine binds its own queue.
    pub machine_scoped: bool,
}

impl QueueOptions {
    /// A durable, shared queue.
    #[must_use]
    pub fn durable() -> Self {
        Self {
            durable: true,
            ..Self::default()
        }
    }

    /// A temporary per-instance queue.
    #[must_use]
    pub fn temporary() -> Self {
        Self {
            temporary: true,
            ..Self::default()
        }
    }

    /// Prefixes the host name.
    #[must_use]
    pub fn machine_scoped(mut self) -> Self {
        self.machine_scoped = true;
        self
    }
}

struct LedgerEntry {
    spec: QueueSpec,
    handler: Arc<parking_lot::RwLock<MessageHandler>>,
    active: bool,
}

struct Worker {
    tx: mpsc::UnboundedSender<ServiceEventMessage>,
    task: JoinHandle<()>,
}

struct Inner<C: BusConnector> {
    connector: C,
    config: BusConfig,
    host_name: String,
    connection: RwLock<Option<Arc<C::Connection>>>,
    /// Keyed by logical name.
    ledger: Mutex<HashMap<String, LedgerEntry>>,
    /// Keyed by broker queue name.
    workers: Mutex<HashMap<String, Worker>>,
    reconnecting: AtomicBool,
    stopped: AtomicBool,
}

/// Message bus handle. Cheap to clone.
pub struct MessageBus<C: BusConnector> {
    inner: Arc<Inner<C>>,
}

impl<C: BusConnector> Clone for MessageBus<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C: BusConnector> fmt::Debug for MessageBus<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageBus")
            .field("host_name", &self.inner.host_name)
            .field("subscriptions", &self.inner.ledger.lock().len())
            .field("stopped", &self.inner.stopped.load(Ordering::Acquire))
            .finish()
    }
}

impl<C: BusConnector> MessageBus<C> {
    /// Creates a bus. No connection is made until first use or
    /// [`start`](Self::start).
    #[must_use]
    pub fn new(connector: C, config: BusConfig) -> Self {
        let host_name = config.resolved_host_name();
        Self {
            inner: Arc::new(Inner {
                connector,
                config,
                host_name,
                connection: RwLock::new(None),
                ledger: Mutex::new(HashMap::new()),
                workers: Mutex::new(HashMap::new()),
                reconnecting: AtomicBool::new(false),
                stopped: AtomicBool::new(false),
            }),
        }
    }

    /// Connects eagerly.
    ///
    /// # Errors
    ///
    /// Returns [`BusError`] if the broker cannot be reached.
    pub async fn start(&self) -> Result<(), BusError> {
        self.connection().await.map(|_| ())
    }

    /// Returns `true` while a connection is held.
    pub async fn is_connected(&self) -> bool {
        self.inner.connection.read().await.is_some()
    }

    /// Returns the broker queue names of all ledger entries.
    #[must_use]
    pub fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .inner
            .ledger
            .lock()
            .values()
            .map(|e| e.spec.name.clone())
            .collect();
        names.sort();
        names
    }

    /// Returns the broker queue name of a logical subscription.
    #[must_use]
    pub fn resolved_queue(&self, logical: &str) -> Option<String> {
        self.inner
            .ledger
            .lock()
            .get(logical)
            .map(|e| e.spec.name.clone())
    }

    // ========================================================================
    // Connection
    // ========================================================================

    async fn connection(&self) -> Result<Arc<C::Connection>, BusError> {
        if self.inner.stopped.load(Ordering::Acquire) {
            return Err(BusError::Stopped);
        }
        if let Some(conn) = self.inner.connection.read().await.as_ref() {
            return Ok(Arc::clone(conn));
        }

        let mut guard = self.inner.connection.write().await;
        if let Some(conn) = guard.as_ref() {
            return Ok(Arc::clone(conn));
        }

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let conn = Arc::new(self.inner.connector.connect(events_tx).await?);
        tracing::info!(host = %self.inner.host_name, "Message bus connected");

        tokio::spawn(route_events(
            Arc::downgrade(&self.inner),
            Arc::downgrade(&conn),
            events_rx,
        ));
        *guard = Some(Arc::clone(&conn));
        Ok(conn)
    }

    async fn current_connection(&self) -> Result<Arc<C::Connection>, BusError> {
        self.inner
            .connection
            .read()
            .await
            .as_ref()
            .map(Arc::clone)
            .ok_or(BusError::NotConnected)
    }

    fn on_connection_lost(&self, reason: &str) {
        tracing::warn!(reason = %reason, "Message bus connection lost");
        if self.inner.stopped.load(Ordering::Acquire) {
            return;
        }
        if self.inner.reconnecting.swap(true, Ordering::AcqRel) {
            return;
        }
        let bus = self.clone();
        tokio::spawn(async move {
            bus.reconnect_loop().await;
            bus.inner.reconnecting.store(false, Ordering::Release);
        });
    }

    async fn reconnect_loop(&self) {
        let policy = self.inner.config.reconnect.clone();
        let mut attempt = 0u32;
        loop {
            if self.inner.stopped.load(Ordering::Acquire) {
                return;
            }
            attempt += 1;
            if !policy.allows_attempt(attempt) {
                tracing::error!(attempts = attempt - 1, "Giving up reconnecting message bus");
                return;
            }
            tokio::time::sleep(policy.delay_for_attempt(attempt - 1)).await;

            match self.connection().await {
                Ok(conn) => match self.replay(&conn).await {
                    Ok(count) => {
                        tracing::info!(attempt, subscriptions = count, "Message bus reconnected");
                        return;
                    }
                    Err(e) => {
                        tracing::warn!(attempt, error = %e, "Subscription replay failed");
                        self.drop_connection(&conn).await;
                    }
                },
                Err(e) => {
                    tracing::warn!(attempt, error = %e, "Message bus reconnect failed");
                }
            }
        }
    }

    async fn replay(&self, conn: &Arc<C::Connection>) -> Result<usize, BusError> {
        let specs: Vec<QueueSpec> = self
            .inner
            .ledger
            .lock()
            .values()
            .filter(|e| e.active)
            .map(|e| e.spec.clone())
            .collect();
        for spec in &specs {
            conn.consume(spec).await?;
            tracing::debug!(queue = %spec.name, "Replayed subscription");
        }
        Ok(specs.len())
    }

    async fn drop_connection(&self, conn: &Arc<C::Connection>) {
        let mut guard = self.inner.connection.write().await;
        if guard.as_ref().is_some_and(|c| Arc::ptr_eq(c, conn)) {
            *guard = None;
        }
    }

    // ========================================================================
    // Subscriptions
    // ========================================================================

    fn resolve_name(&self, logical: &str, options: QueueOptions) -> String {
        let mut name = logical.to_string();
        if options.machine_scoped {
            name = format!("{}.{name}", self.inner.host_name);
        }
        if options.temporary {
            let suffix = uuid::Uuid::new_v4().simple().to_string();
            name = format!("{name}.{}", &suffix[..12]);
        }
        name
    }

    /// Subscribes a handler to a logical queue and returns the broker queue
    /// name.
    ///
    /// Subscribing the same logical name again replaces the handler and
    /// keeps the broker queue.
    ///
    /// # Errors
    ///
    /// Returns [`BusError`] if the name is empty or the broker refuses.
    pub async fn subscribe(
        &self,
        queue_name: &str,
        options: QueueOptions,
        routing_key: Option<&str>,
        handler: MessageHandler,
    ) -> Result<String, BusError> {
        if queue_name.trim().is_empty() {
            return Err(BusError::InvalidQueue("queue name is empty".to_string()));
        }

        let (spec, slot) = {
            let ledger = self.inner.ledger.lock();
            match ledger.get(queue_name) {
                Some(entry) => {
                    *entry.handler.write() = Arc::clone(&handler);
                    (entry.spec.clone(), Arc::clone(&entry.handler))
                }
                None => (
                    QueueSpec {
                        name: self.resolve_name(queue_name, options),
                        durable: options.durable && !options.temporary,
                        temporary: options.temporary,
                        routing_key: routing_key.map(str::to_string),
                    },
                    Arc::new(parking_lot::RwLock::new(handler)),
                ),
            }
        };

        self.ensure_worker(&spec.name, Arc::clone(&slot));

        let result = match self.connection().await {
            Ok(conn) => conn.consume(&spec).await,
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            if !self.inner.ledger.lock().contains_key(queue_name) {
                self.remove_worker(&spec.name);
            }
            return Err(e);
        }

        let name = spec.name.clone();
        self.inner.ledger.lock().insert(
            queue_name.to_string(),
            LedgerEntry {
                spec,
                handler: slot,
                active: true,
            },
        );
        tracing::info!(logical = %queue_name, queue = %name, "Subscribed");
        Ok(name)
    }

    /// Pauses consumption. Ledger entries are kept for
    /// [`resubscribe`](Self::resubscribe).
    ///
    /// # Errors
    ///
    /// Returns [`BusError`] if the broker refuses the cancel.
    pub async fn unsubscribe(&self, names: &[&str]) -> Result<(), BusError> {
        let queues = self.set_active(names, false);
        let Ok(conn) = self.current_connection().await else {
            return Ok(());
        };
        for queue in queues {
            conn.cancel(&queue).await?;
            tracing::info!(queue = %queue, "Unsubscribed");
        }
        Ok(())
    }

    /// Resumes paused subscriptions.
    ///
    /// # Errors
    ///
    /// Returns [`BusError`] if the broker cannot be reached.
    pub async fn resubscribe(&self, names: &[&str]) -> Result<(), BusError> {
        self.set_active(names, true);
        let specs: Vec<QueueSpec> = {
            let ledger = self.inner.ledger.lock();
            names
                .iter()
                .filter_map(|n| ledger.get(*n))
                .map(|e| e.spec.clone())
                .collect()
        };
        let conn = self.connection().await?;
        for spec in specs {
            conn.consume(&spec).await?;
            tracing::info!(queue = %spec.name, "Resubscribed");
        }
        Ok(())
    }

    /// Cancels a subscription and forgets it.
    ///
    /// # Errors
    ///
    /// Returns [`BusError`] if the broker refuses the cancel.
    pub async fn remove_subscription(&self, name: &str) -> Result<(), BusError> {
        let Some(entry) = self.inner.ledger.lock().remove(name) else {
            return Ok(());
        };
        self.remove_worker(&entry.spec.name);
        if let Ok(conn) = self.current_connection().await {
            conn.cancel(&entry.spec.name).await?;
        }
        Ok(())
    }

    fn set_active(&self, names: &[&str], active: bool) -> Vec<String> {
        let mut ledger = self.inner.ledger.lock();
        let mut queues = Vec::with_capacity(names.len());
        for name in names {
            if let Some(entry) = ledger.get_mut(*name) {
                entry.active = active;
                queues.push(entry.spec.name.clone());
            }
        }
        queues
    }

    fn ensure_worker(&self, queue: &str, handler: Arc<parking_lot::RwLock<MessageHandler>>) {
        let mut workers = self.inner.workers.lock();
        if workers.contains_key(queue) {
            return;
        }
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run_worker(queue.to_string(), rx, handler));
        workers.insert(queue.to_string(), Worker { tx, task });
    }

    fn remove_worker(&self, queue: &str) {
        // dropping the sender lets the worker drain and exit
        self.inner.workers.lock().remove(queue);
    }

    // ========================================================================
    // Publish / ack
    // ========================================================================

    /// Publishes a message.
    ///
    /// The message is tagged with the ambient organisation (see
    /// [`with_organisation`]) unless it already carries one.
    ///
    /// # Errors
    ///
    /// Returns [`BusError`] if the broker cannot be reached or refuses.
    pub async fn publish(
        &self,
        routing_key: &str,
        mut message: ServiceEventMessage,
        mode: PublishMode,
    ) -> Result<(), BusError> {
        if !message.has_parameter(params::ORGANISATION_ID)
            && let Some(org) = current_organisation()
        {
            message.set_parameter(params::ORGANISATION_ID, org.to_string());
        }
        message.publish_mode = mode;
        message.timestamp = Utc::now();
        message.delivery_tag = None;

        let body = message.to_bytes()?;
        let conn = self.connection().await?;
        conn.publish(routing_key, body, mode).await?;
        tracing::debug!(routing_key = %routing_key, message = %message.message_id, "Published");
        Ok(())
    }

    /// Acknowledges a delivered message.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::NotDelivered`] for messages not received from the
    /// bus, or [`BusError::NotConnected`] if the connection is gone.
    pub async fn ack_message(&self, message: &ServiceEventMessage) -> Result<(), BusError> {
        let tag = message
            .delivery_tag
            .as_ref()
            .ok_or(BusError::NotDelivered(message.message_id))?;
        self.current_connection().await?.ack(tag).await
    }

    /// Rejects a delivered message and requeues a copy.
    ///
    /// The copy has `RequeueCount` incremented and goes back to the queue it
    /// came from. With a `delay` it carries a `DelayedRequeueTime` and the
    /// consuming bus holds it, unacked, until that time. The original
    /// delivery is acked only once the copy is on the broker, so a stop or
    /// broker outage during the delay leaves the copy queued.
    ///
    /// # Errors
    ///
    /// Returns [`BusError`] if the message was not delivered by the bus or
    /// the requeue fails.
    pub async fn nack_message(
        &self,
        message: &ServiceEventMessage,
        delay: Option<Duration>,
    ) -> Result<(), BusError> {
        let tag = message
            .delivery_tag
            .clone()
            .ok_or(BusError::NotDelivered(message.message_id))?;

        let mut copy = message.clone();
        copy.delivery_tag = None;
        copy.set_requeue_count(message.requeue_count().saturating_add(1));
        let delay = delay.filter(|d| !d.is_zero());
        copy.delayed_requeue_time = delay
            .and_then(|d| chrono::Duration::from_std(d).ok())
            .map(|d| Utc::now() + d);
        let body = copy.to_bytes()?;

        self.connection()
            .await?
            .send_to_queue(&tag.queue, body)
            .await?;

        tracing::debug!(
            queue = %tag.queue,
            message = %message.message_id,
            requeue_count = copy.requeue_count(),
            delay_ms = delay.map_or(0, |d| d.as_millis()),
            "Nacked"
        );
        self.ack_message(message).await
    }

    // ========================================================================
    // Shutdown
    // ========================================================================

    /// Stops consuming, waits for in-flight handlers and closes the
    /// connection.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::ShutdownTimeout`] if handlers did not finish
    /// within the configured timeout; the connection is closed anyway.
    pub async fn stop(&self) -> Result<(), BusError> {
        if self.inner.stopped.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        tracing::info!("Stopping message bus");

        let workers: Vec<Worker> = self.inner.workers.lock().drain().map(|(_, w)| w).collect();
        let aborts: Vec<_> = workers.iter().map(|w| w.task.abort_handle()).collect();
        let tasks: Vec<JoinHandle<()>> = workers.into_iter().map(|w| w.task).collect();

        let timeout = self.inner.config.shutdown_timeout;
        let joined = tokio::time::timeout(timeout, async {
            for task in tasks {
                let _ = task.await;
            }
        })
        .await;

        let conn = self.inner.connection.write().await.take();
        if let Some(conn) = conn
            && let Err(e) = conn.close().await
        {
            tracing::warn!(error = %e, "Closing bus connection failed");
        }

        if joined.is_err() {
            for abort in aborts {
                abort.abort();
            }
            let millis = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
            tracing::warn!(timeout_ms = millis, "Bus handlers did not finish in time");
            return Err(BusError::ShutdownTimeout(millis));
        }
        Ok(())
    }
}

/// Forwards transport events of one connection to the queue workers.
async fn route_events<C: BusConnector>(
    inner: Weak<Inner<C>>,
    conn: Weak<C::Connection>,
    mut events: mpsc::UnboundedReceiver<TransportEvent>,
) {
    while let Some(event) = events.recv().await {
        let Some(inner) = inner.upgrade() else {
            return;
        };
        let bus = MessageBus { inner };

        match event {
            TransportEvent::Delivery(delivery) => {
                let tag = delivery.tag;
                let mut message = match ServiceEventMessage::from_bytes(&delivery.body) {
                    Ok(message) => message,
                    Err(e) => {
                        tracing::warn!(queue = %tag.queue, error = %e, "Dropping malformed message");
                        if let Some(conn) = conn.upgrade() {
                            let _ = conn.ack(&tag).await;
                        }
                        continue;
                    }
                };
                message.delivery_tag = Some(tag);

                if let Some(wait) = time_until_due(&message) {
                    tokio::spawn(hold_until_due(
                        Arc::downgrade(&bus.inner),
                        conn.clone(),
                        message,
                        wait,
                    ));
                    continue;
                }
                hand_to_worker(&bus.inner, message);
            }
            TransportEvent::ConnectionLost(reason) => {
                if let Some(conn) = conn.upgrade() {
                    bus.drop_connection(&conn).await;
                }
                bus.on_connection_lost(&reason);
                return;
            }
        }
    }
}

/// Remaining wait of a message requeued with a delay.
fn time_until_due(message: &ServiceEventMessage) -> Option<Duration> {
    let due = message.delayed_requeue_time?;
    (due - Utc::now()).to_std().ok().filter(|d| !d.is_zero())
}

fn hand_to_worker<C: BusConnector>(inner: &Inner<C>, message: ServiceEventMessage) {
    let Some(queue) = message.delivery_tag.as_ref().map(|t| t.queue.clone()) else {
        return;
    };
    let tx = inner.workers.lock().get(&queue).map(|w| w.tx.clone());
    match tx {
        Some(tx) => {
            if tx.send(message).is_err() {
                tracing::debug!(queue = %queue, "Worker gone, delivery left unacked");
            }
        }
        None => tracing::debug!(queue = %queue, "No worker for delivery"),
    }
}

/// Keeps a delayed delivery unacked until it is due, then hands it to the
/// queue worker.
///
/// If the connection it arrived on is gone by then, the broker has already
/// put it back on the queue and it is left alone.
async fn hold_until_due<C: BusConnector>(
    inner: Weak<Inner<C>>,
    conn: Weak<C::Connection>,
    message: ServiceEventMessage,
    wait: Duration,
) {
    tokio::time::sleep(wait).await;
    let (Some(inner), Some(conn)) = (inner.upgrade(), conn.upgrade()) else {
        return;
    };
    let current = inner
        .connection
        .read()
        .await
        .as_ref()
        .is_some_and(|c| Arc::ptr_eq(c, &conn));
    if !current || inner.stopped.load(Ordering::Acquire) {
        tracing::debug!(message = %message.message_id, "Delayed delivery outlived its connection");
        return;
    }
    hand_to_worker(&inner, message);
}

/// Runs the handler for each message of one queue, one at a time.
async fn run_worker(
    queue: String,
    mut rx: mpsc::UnboundedReceiver<ServiceEventMessage>,
    handler: Arc<parking_lot::RwLock<MessageHandler>>,
) {
    while let Some(message) = rx.recv().await {
        let id = message.message_id;
        let handler = Arc::clone(&handler.read());
        // own task so a panicking handler does not take the worker down
        if let Err(e) = tokio::spawn(handler(message)).await {
            tracing::error!(queue = %queue, message = %id, error = %e, "Message handler failed");
        }
    }
    tracing::debug!(queue = %queue, "Queue worker stopped");
}

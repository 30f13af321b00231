// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Pipeline configuration.
//!
//! A [`PipelineConfig`] is built once at process start and handed to each
//! component constructor. Nothing in the crate reads global state.

use std::net::SocketAddr;
use std::time::Duration;

use crate::error::ConfigError;

/// Routing key the dispatcher publishes webhook work to.
pub const DEFAULT_WEBHOOK_ROUTING_KEY: &str = "Subscription.Webhook";

/// Queue the webhook worker consumes from.
pub const DEFAULT_WEBHOOK_QUEUE: &str = "Subscription.Webhook";

/// Complete configuration of a notification pipeline.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use lwm2m_notify::config::{PipelineConfig, RetryPolicy, WebhookConfig};
///
/// let config = PipelineConfig::new().with_webhook(
///     WebhookConfig::new()
///         .with_request_timeout(Duration::from_secs(5))
///         .with_retry(RetryPolicy::new().with_max_attempts(3)),
/// );
///
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Message bus settings.
    pub bus: BusConfig,
    /// Webhook delivery settings.
    pub webhook: WebhookConfig,
    /// Table-change broadcast settings.
    pub change_notification: ChangeNotificationConfig,
    /// Capacity of the internal event bus.
    pub event_capacity: usize,
}

impl PipelineConfig {
    /// Creates a configuration with default settings.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the message bus settings.
    #[must_use]
    pub fn with_bus(mut self, bus: BusConfig) -> Self {
        self.bus = bus;
        self
    }

    /// Sets the webhook settings.
    #[must_use]
    pub fn with_webhook(mut self, webhook: WebhookConfig) -> Self {
        self.webhook = webhook;
        self
    }

    /// Sets the table-change broadcast settings.
    #[must_use]
    pub fn with_change_notification(mut self, config: ChangeNotificationConfig) -> Self {
        self.change_notification = config;
        self
    }

    /// Sets the internal event bus capacity.
    #[must_use]
    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }

    /// Checks every section.
    ///
    /// # Errors
    ///
    /// Returns the first [`ConfigError`] found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.event_capacity == 0 {
            return Err(ConfigError::Invalid {
                name: "event_capacity",
                message: "must be greater than zero".to_string(),
            });
        }
        self.bus.validate()?;
        self.webhook.validate()?;
        self.change_notification.validate()
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            bus: BusConfig::default(),
            webhook: WebhookConfig::default(),
            change_notification: ChangeNotificationConfig::default(),
            event_capacity: 256,
        }
    }
}

// ============================================================================
// Retry policy
// ============================================================================

/// Exponential backoff schedule.
///
/// Used for bus reconnects and for webhook redelivery delays.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use lwm2m_notify::config::RetryPolicy;
///
/// let policy = RetryPolicy::new()
///     .with_initial_delay(Duration::from_millis(500))
///     .with_max_delay(Duration::from_secs(30));
///
/// assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(500));
/// assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(1));
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Maximum number of attempts (None = infinite).
    pub max_attempts: Option<u32>,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Upper bound of the delay.
    pub max_delay: Duration,
    /// Multiplier applied per attempt.
    pub backoff_multiplier: f32,
}

impl RetryPolicy {
    /// Creates a policy with default settings.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a policy that retries immediately, without delay.
    #[must_use]
    pub fn immediate() -> Self {
        Self {
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            ..Self::default()
        }
    }

    /// Sets the maximum number of attempts.
    #[must_use]
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    /// Retries forever.
    #[must_use]
    pub fn with_infinite_attempts(mut self) -> Self {
        self.max_attempts = None;
        self
    }

    /// Sets the delay before the first retry.
    #[must_use]
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Sets the upper bound of the delay.
    #[must_use]
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Sets the backoff multiplier.
    #[must_use]
    pub fn with_backoff_multiplier(mut self, multiplier: f32) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Calculates the delay for a given retry attempt, starting at 0.
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return self.initial_delay.min(self.max_delay);
        }

        let multiplier = self
            .backoff_multiplier
            .powi(i32::try_from(attempt).unwrap_or(i32::MAX));

        #[allow(clippy::cast_precision_loss)]
        let delay_ms = self.initial_delay.as_millis() as f32 * multiplier;

        // delay_ms is non-negative; saturating cast on overflow
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let delay = Duration::from_millis(delay_ms as u64);

        delay.min(self.max_delay)
    }

    /// Returns true if attempt number `attempt` (1-based) may still run.
    #[must_use]
    pub fn allows_attempt(&self, attempt: u32) -> bool {
        self.max_attempts.is_none_or(|max| attempt <= max)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: Some(10),
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            backoff_multiplier: 2.0,
        }
    }
}

// ============================================================================
// Bus
// ============================================================================

/// Message bus settings.
#[derive(Debug, Clone)]
pub struct BusConfig {
    /// Host name used to prefix machine-scoped queues. Defaults to the
    /// system host name.
    pub host_name: Option<String>,
    /// How long `stop()` waits for in-flight handlers.
    pub shutdown_timeout: Duration,
    /// Reconnect backoff after the broker connection is lost.
    pub reconnect: RetryPolicy,
}

impl BusConfig {
    /// Creates bus settings with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Overrides the host name prefix of machine-scoped queues.
    #[must_use]
    pub fn with_host_name(mut self, host_name: impl Into<String>) -> Self {
        self.host_name = Some(host_name.into());
        self
    }

    /// Sets the shutdown join timeout.
    #[must_use]
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Sets the reconnect policy.
    #[must_use]
    pub fn with_reconnect(mut self, policy: RetryPolicy) -> Self {
        self.reconnect = policy;
        self
    }

    /// Returns the host name prefix, falling back to the system host name.
    #[must_use]
    pub fn resolved_host_name(&self) -> String {
        self.host_name.clone().unwrap_or_else(|| {
            hostname::get()
                .ok()
                .and_then(|h| h.into_string().ok())
                .unwrap_or_else(|| "localhost".to_string())
        })
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.host_name.as_deref().is_some_and(str::is_empty) {
            return Err(ConfigError::Empty("bus.host_name"));
        }
        Ok(())
    }
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            host_name: None,
            shutdown_timeout: Duration::from_secs(10),
            reconnect: RetryPolicy::default()
                .with_infinite_attempts()
                .with_max_delay(Duration::from_secs(30)),
        }
    }
}

// ============================================================================
// Webhook
// ============================================================================

/// Webhook delivery settings.
#[derive(Debug, Clone)]
pub struct WebhookConfig {
    /// Routing key dispatched notifications are published to.
    pub routing_key: String,
    /// Queue the worker consumes from.
    pub queue_name: String,
    /// Timeout of a single POST.
    pub request_timeout: Duration,
    /// Redelivery schedule and attempt cap.
    pub retry: RetryPolicy,
    /// Base URL used to build the self links of a payload.
    pub link_base: String,
}

impl WebhookConfig {
    /// Creates webhook settings with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the routing key and queue name.
    #[must_use]
    pub fn with_queue(mut self, name: impl Into<String>) -> Self {
        let name = name.into();
        self.routing_key.clone_from(&name);
        self.queue_name = name;
        self
    }

    /// Sets the per-request timeout.
    #[must_use]
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Sets the redelivery policy.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the base URL of payload links.
    #[must_use]
    pub fn with_link_base(mut self, base: impl Into<String>) -> Self {
        self.link_base = base.into();
        self
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.queue_name.is_empty() {
            return Err(ConfigError::Empty("webhook.queue_name"));
        }
        if self.routing_key.is_empty() {
            return Err(ConfigError::Empty("webhook.routing_key"));
        }
        if self.retry.max_attempts == Some(0) {
            return Err(ConfigError::Invalid {
                name: "webhook.retry.max_attempts",
                message: "must allow at least one attempt".to_string(),
            });
        }
        Ok(())
    }
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            routing_key: DEFAULT_WEBHOOK_ROUTING_KEY.to_string(),
            queue_name: DEFAULT_WEBHOOK_QUEUE.to_string(),
            request_timeout: Duration::from_secs(30),
            retry: RetryPolicy::default(),
            link_base: String::new(),
        }
    }
}

// ============================================================================
// Change notification
// ============================================================================

/// Table-change broadcast server settings.
#[derive(Debug, Clone)]
pub struct ChangeNotificationConfig {
    /// Address the TCP listener binds to.
    pub bind_address: SocketAddr,
    /// Bound of the notification queue.
    pub queue_capacity: usize,
    /// Interval between heartbeat frames.
    pub heartbeat_interval: Duration,
    /// Connection string announced in heartbeats.
    pub connection_string: String,
}

impl ChangeNotificationConfig {
    /// Creates settings with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the listen address.
    #[must_use]
    pub fn with_bind_address(mut self, address: SocketAddr) -> Self {
        self.bind_address = address;
        self
    }

    /// Sets the queue bound.
    #[must_use]
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    /// Sets the heartbeat interval.
    #[must_use]
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Sets the connection string announced in heartbeats.
    #[must_use]
    pub fn with_connection_string(mut self, connection_string: impl Into<String>) -> Self {
        self.connection_string = connection_string.into();
        self
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.queue_capacity == 0 {
            return Err(ConfigError::Invalid {
                name: "change_notification.queue_capacity",
                message: "must be greater than zero".to_string(),
            });
        }
        if self.heartbeat_interval.is_zero() {
            return Err(ConfigError::Invalid {
                name: "change_notification.heartbeat_interval",
                message: "must be greater than zero".to_string(),
            });
        }
        if self.connection_string.contains(['|', '\n']) {
            return Err(ConfigError::Invalid {
                name: "change_notification.connection_string",
                message: "must not contain frame delimiters".to_string(),
            });
        }
        Ok(())
    }
}

impl Default for ChangeNotificationConfig {
    fn default() -> Self {
        Self {
            bind_address: SocketAddr::from(([127, 0, 0, 1], 14050)),
            queue_capacity: 1024,
            heartbeat_interval: Duration::from_secs(30),
            connection_string: String::new(),
        }
    }
}

// ============================================================================
// MQTT transport
// ============================================================================

/// Connection settings of the MQTT bus transport.
#[derive(Debug, Clone)]
pub struct MqttBusConfig {
    /// Broker host.
    pub host: String,
    /// Broker port.
    pub port: u16,
    /// MQTT client ID.
    pub client_id: String,
    /// Optional (username, password).
    pub credentials: Option<(String, String)>,
    /// Keep-alive interval.
    pub keep_alive: Duration,
    /// How long to wait for the broker's CONNACK.
    pub connect_timeout: Duration,
    /// Consume durable queues through `$share/<queue>/...` subscriptions so
    /// instances compete for messages instead of each receiving a copy.
    /// The broker must support shared subscriptions.
    pub shared_subscriptions: bool,
}

impl MqttBusConfig {
    /// Creates settings for a broker, with a random client ID.
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        let short = uuid::Uuid::new_v4().simple().to_string();
        Self {
            host: host.into(),
            port,
            client_id: format!("lwm2m-bus-{}", &short[..8]),
            credentials: None,
            keep_alive: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            shared_subscriptions: true,
        }
    }

    /// Sets broker credentials.
    #[must_use]
    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.credentials = Some((username.into(), password.into()));
        self
    }

    /// Sets the MQTT client ID.
    #[must_use]
    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = client_id.into();
        self
    }

    /// Sets the CONNACK timeout.
    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Enables or disables shared subscriptions.
    #[must_use]
    pub fn with_shared_subscriptions(mut self, enabled: bool) -> Self {
        self.shared_subscriptions = enabled;
        self
    }
}

// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Per-client transfer counters.

use std::sync::atomic::{AtomicU64, Ordering};

/// Byte and transaction counters of one client connection.
#[derive(Debug, Default)]
pub struct TransferMetrics {
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    transactions: AtomicU64,
}

/// A point-in-time copy of [`TransferMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    /// Payload bytes sent to the device.
    pub bytes_sent: u64,
    /// Payload bytes received from the device.
    pub bytes_received: u64,
    /// Completed request/response exchanges and notifications.
    pub transactions: u64,
}

impl TransferMetrics {
    /// Creates zeroed counters.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records an outgoing payload.
    pub fn record_sent(&self, bytes: usize) {
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Records an incoming payload and counts the transaction.
    pub fn record_received(&self, bytes: usize) {
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
        self.transactions.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns the current values.
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            transactions: self.transactions.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_accumulate() {
        let metrics = TransferMetrics::new();
        metrics.record_sent(3);
        metrics.record_received(10);
        metrics.record_received(0);

        assert_eq!(
            metrics.snapshot(),
            MetricsSnapshot {
                bytes_sent: 3,
                bytes_received: 10,
                transactions: 2,
            }
        );
    }
}

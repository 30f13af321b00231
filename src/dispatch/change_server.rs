// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! TCP fan-out of table-change notifications.
//!
//! Clients connect, register interest in tables with `1,<table>|` frames and
//! receive `2|<table>,<purge>,<id>` for those tables, plus periodic
//! `3|<connectionString>,<online>` heartbeats. All writes go through one
//! bounded queue drained by a single task, so frames reach every socket in
//! the order they were queued. Writes happen outside the peer table lock, so
//! a slow socket never holds back connects or registrations. A socket whose
//! write fails, or that sends a registration frame longer than
//! [`MAX_FRAME`] bytes, is dropped without affecting the others.
//!
//! # Examples
//!
//! ```no_run
//! use lwm2m_notify::config::ChangeNotificationConfig;
//! use lwm2m_notify::dispatch::{ChangeNotificationClient, ChangeNotificationServer, Notification};
//!
//! # async fn example() -> lwm2m_notify::Result<()> {
//! let server = ChangeNotificationServer::start(&ChangeNotificationConfig::new()).await?;
//!
//! let mut client = ChangeNotificationClient::connect(server.local_addr()).await?;
//! client.register("Subscription").await?;
//!
//! server.notify(Notification::new("Subscription", false, 17)).await?;
//! let frame = client.next_frame().await?;
//! # server.shutdown().await;
//! # Ok(())
//! # }
//! ```

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, mpsc};
use tokio::task::{AbortHandle, JoinHandle, JoinSet};

use super::frame::{ChangeFrame, Notification, valid_field};
use crate::config::ChangeNotificationConfig;
use crate::error::ChangeNotificationError;

/// A peer that cannot take a frame within this time is dropped.
const WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// Longest client frame accepted, delimiter included.
pub const MAX_FRAME: usize = 1024;

enum Outbound {
    Frame(ChangeFrame),
    Shutdown,
}

struct Peer {
    address: SocketAddr,
    tables: HashSet<String>,
    writer: Arc<Mutex<OwnedWriteHalf>>,
}

struct Shared {
    peers: Mutex<HashMap<u64, Peer>>,
    online: AtomicBool,
    next_peer: AtomicU64,
}

/// Table-change notification server.
pub struct ChangeNotificationServer {
    local_addr: SocketAddr,
    queue: mpsc::Sender<Outbound>,
    shared: Arc<Shared>,
    background: Vec<AbortHandle>,
    drain: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for ChangeNotificationServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeNotificationServer")
            .field("local_addr", &self.local_addr)
            .field("online", &self.shared.online.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl ChangeNotificationServer {
    /// Binds the listener and starts the accept, drain and heartbeat tasks.
    ///
    /// # Errors
    ///
    /// Returns [`ChangeNotificationError::Io`] if the address cannot be bound.
    pub async fn start(config: &ChangeNotificationConfig) -> Result<Self, ChangeNotificationError> {
        let listener = TcpListener::bind(config.bind_address).await?;
        let local_addr = listener.local_addr()?;
        let (queue, rx) = mpsc::channel(config.queue_capacity.max(1));

        let shared = Arc::new(Shared {
            peers: Mutex::new(HashMap::new()),
            online: AtomicBool::new(true),
            next_peer: AtomicU64::new(0),
        });

        let accept = tokio::spawn(accept_loop(listener, Arc::clone(&shared)));
        let heartbeat = tokio::spawn(heartbeat_loop(
            queue.clone(),
            Arc::clone(&shared),
            config.connection_string.clone(),
            config.heartbeat_interval,
        ));
        let drain = tokio::spawn(drain_queue(rx, Arc::clone(&shared)));

        tracing::info!(address = %local_addr, "Change notification server listening");
        Ok(Self {
            local_addr,
            queue,
            shared,
            background: vec![accept.abort_handle(), heartbeat.abort_handle()],
            drain: Some(drain),
        })
    }

    /// Address the server listens on.
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Sets the online flag reported in heartbeats.
    pub fn set_online(&self, online: bool) {
        self.shared.online.store(online, Ordering::Relaxed);
    }

    /// Queues a notification. Waits while the queue is full.
    ///
    /// # Errors
    ///
    /// Returns [`ChangeNotificationError::Malformed`] if the table name
    /// contains frame delimiters, or [`ChangeNotificationError::Closed`]
    /// after shutdown.
    pub async fn notify(&self, notification: Notification) -> Result<(), ChangeNotificationError> {
        if notification.table.is_empty() || !valid_field(&notification.table) {
            return Err(ChangeNotificationError::Malformed(notification.table));
        }
        self.queue
            .send(Outbound::Frame(ChangeFrame::Notify(notification)))
            .await
            .map_err(|_| ChangeNotificationError::Closed)
    }

    /// Number of connected sockets.
    pub async fn connection_count(&self) -> usize {
        self.shared.peers.lock().await.len()
    }

    /// Number of sockets registered for `table`.
    pub async fn interested_count(&self, table: &str) -> usize {
        self.shared
            .peers
            .lock()
            .await
            .values()
            .filter(|p| p.tables.contains(table))
            .count()
    }

    /// Stops accepting, flushes queued frames and closes every socket.
    pub async fn shutdown(mut self) {
        for task in &self.background {
            task.abort();
        }
        if self.queue.send(Outbound::Shutdown).await.is_ok()
            && let Some(drain) = self.drain.take()
        {
            let _ = drain.await;
        }
        self.shared.peers.lock().await.clear();
        tracing::info!(address = %self.local_addr, "Change notification server stopped");
    }
}

impl Drop for ChangeNotificationServer {
    fn drop(&mut self) {
        for task in &self.background {
            task.abort();
        }
        if let Some(drain) = &self.drain {
            drain.abort();
        }
    }
}

async fn accept_loop(listener: TcpListener, shared: Arc<Shared>) {
    let mut readers = JoinSet::new();
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, address)) => {
                    let (read, writer) = stream.into_split();
                    let id = shared.next_peer.fetch_add(1, Ordering::Relaxed);
                    shared.peers.lock().await.insert(
                        id,
                        Peer {
                            address,
                            tables: HashSet::new(),
                            writer: Arc::new(Mutex::new(writer)),
                        },
                    );
                    tracing::debug!(peer = %address, "Change notification client connected");
                    readers.spawn(read_registrations(id, read, Arc::clone(&shared)));
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Accept failed");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            },
            Some(_) = readers.join_next(), if !readers.is_empty() => {}
        }
    }
}

async fn read_registrations(id: u64, read: OwnedReadHalf, shared: Arc<Shared>) {
    let mut reader = BufReader::new(read);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        let limit = MAX_FRAME as u64 + 1;
        match (&mut reader).take(limit).read_until(b'|', &mut buf).await {
            Ok(0) => break,
            Ok(n) if n > MAX_FRAME => {
                tracing::warn!(peer_id = id, length = n, "Client frame too long, dropping peer");
                break;
            }
            Ok(_) => {
                let text = String::from_utf8_lossy(&buf);
                let text = text.trim_end_matches('|');
                if text.trim().is_empty() {
                    continue;
                }
                match ChangeFrame::parse_client(text) {
                    Ok(ChangeFrame::Register { table }) => {
                        if let Some(peer) = shared.peers.lock().await.get_mut(&id) {
                            tracing::debug!(peer = %peer.address, table = %table, "Interest registered");
                            peer.tables.insert(table);
                        }
                    }
                    Ok(other) => tracing::debug!(frame = ?other, "Unexpected client frame"),
                    Err(e) => tracing::debug!(error = %e, "Ignoring client frame"),
                }
            }
            Err(e) => {
                tracing::debug!(error = %e, "Change notification read failed");
                break;
            }
        }
    }
    if let Some(peer) = shared.peers.lock().await.remove(&id) {
        tracing::debug!(peer = %peer.address, "Change notification client disconnected");
    }
}

async fn heartbeat_loop(
    queue: mpsc::Sender<Outbound>,
    shared: Arc<Shared>,
    connection_string: String,
    interval: Duration,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let frame = ChangeFrame::Heartbeat {
            connection_string: connection_string.clone(),
            online: shared.online.load(Ordering::Relaxed),
        };
        if queue.send(Outbound::Frame(frame)).await.is_err() {
            break;
        }
    }
}

async fn drain_queue(mut rx: mpsc::Receiver<Outbound>, shared: Arc<Shared>) {
    while let Some(outbound) = rx.recv().await {
        let frame = match outbound {
            Outbound::Frame(frame) => frame,
            Outbound::Shutdown => break,
        };
        let bytes = frame.to_string();

        let recipients: Vec<(u64, SocketAddr, Arc<Mutex<OwnedWriteHalf>>)> = shared
            .peers
            .lock()
            .await
            .iter()
            .filter(|(_, peer)| match &frame {
                ChangeFrame::Notify(n) => peer.tables.contains(&n.table),
                _ => true,
            })
            .map(|(id, peer)| (*id, peer.address, Arc::clone(&peer.writer)))
            .collect();

        let mut dead = Vec::new();
        for (id, address, writer) in recipients {
            let mut writer = writer.lock().await;
            match tokio::time::timeout(WRITE_TIMEOUT, writer.write_all(bytes.as_bytes())).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::debug!(peer = %address, error = %e, "Write failed");
                    dead.push(id);
                }
                Err(_) => {
                    tracing::debug!(peer = %address, "Write timed out");
                    dead.push(id);
                }
            }
        }
        if dead.is_empty() {
            continue;
        }
        let mut peers = shared.peers.lock().await;
        for id in dead {
            if let Some(peer) = peers.remove(&id) {
                tracing::warn!(peer = %peer.address, "Dropped change notification client");
            }
        }
    }
}

/// Consumer side of the table-change protocol.
#[derive(Debug)]
pub struct ChangeNotificationClient {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl ChangeNotificationClient {
    /// Connects to a server.
    ///
    /// # Errors
    ///
    /// Returns [`ChangeNotificationError::Io`] if the connection fails.
    pub async fn connect(address: SocketAddr) -> Result<Self, ChangeNotificationError> {
        let stream = TcpStream::connect(address).await?;
        let (read, writer) = stream.into_split();
        Ok(Self {
            reader: BufReader::new(read),
            writer,
        })
    }

    /// Registers interest in a table.
    ///
    /// # Errors
    ///
    /// Returns [`ChangeNotificationError`] if the name is not a valid frame
    /// field or the write fails.
    pub async fn register(&mut self, table: &str) -> Result<(), ChangeNotificationError> {
        if table.is_empty() || !valid_field(table) {
            return Err(ChangeNotificationError::Malformed(table.to_string()));
        }
        let frame = ChangeFrame::Register {
            table: table.to_string(),
        };
        self.writer.write_all(frame.to_string().as_bytes()).await?;
        Ok(())
    }

    /// Reads the next frame. Returns `None` once the server closed the
    /// connection.
    ///
    /// # Errors
    ///
    /// Returns [`ChangeNotificationError`] on I/O failure or a malformed
    /// frame.
    pub async fn next_frame(&mut self) -> Result<Option<ChangeFrame>, ChangeNotificationError> {
        let mut line = String::new();
        if self.reader.read_line(&mut line).await? == 0 {
            return Ok(None);
        }
        ChangeFrame::parse_server(&line).map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ChangeNotificationConfig {
        ChangeNotificationConfig::new()
            .with_bind_address(SocketAddr::from(([127, 0, 0, 1], 0)))
            .with_heartbeat_interval(Duration::from_secs(3600))
            .with_connection_string("db01")
    }

    async fn wait_for_interest(server: &ChangeNotificationServer, table: &str, count: usize) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while server.interested_count(table).await < count {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn only_interested_clients_receive() {
        let server = ChangeNotificationServer::start(&config()).await.unwrap();
        let mut clients_table = ChangeNotificationClient::connect(server.local_addr())
            .await
            .unwrap();
        let mut other_table = ChangeNotificationClient::connect(server.local_addr())
            .await
            .unwrap();
        clients_table.register("Client").await.unwrap();
        other_table.register("Other").await.unwrap();
        wait_for_interest(&server, "Client", 1).await;
        wait_for_interest(&server, "Other", 1).await;

        server
            .notify(Notification::new("Client", false, 5))
            .await
            .unwrap();
        server
            .notify(Notification::new("Other", true, 6))
            .await
            .unwrap();

        assert_eq!(
            clients_table.next_frame().await.unwrap(),
            Some(ChangeFrame::Notify(Notification::new("Client", false, 5)))
        );
        assert_eq!(
            other_table.next_frame().await.unwrap(),
            Some(ChangeFrame::Notify(Notification::new("Other", true, 6)))
        );
        server.shutdown().await;
    }

    #[tokio::test]
    async fn heartbeats_reach_everyone() {
        let server = ChangeNotificationServer::start(
            &config().with_heartbeat_interval(Duration::from_millis(50)),
        )
        .await
        .unwrap();
        server.set_online(false);
        let mut client = ChangeNotificationClient::connect(server.local_addr())
            .await
            .unwrap();

        let frame = tokio::time::timeout(Duration::from_secs(2), client.next_frame())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            frame,
            Some(ChangeFrame::Heartbeat {
                connection_string: "db01".to_string(),
                online: false,
            })
        );
        server.shutdown().await;
    }

    #[tokio::test]
    async fn delimiters_in_table_names_are_rejected() {
        let server = ChangeNotificationServer::start(&config()).await.unwrap();
        assert!(matches!(
            server.notify(Notification::new("a|b", false, 1)).await,
            Err(ChangeNotificationError::Malformed(_))
        ));
        server.shutdown().await;
    }

    #[tokio::test]
    async fn oversized_client_frame_drops_the_peer() {
        let server = ChangeNotificationServer::start(&config()).await.unwrap();
        let mut well_behaved = ChangeNotificationClient::connect(server.local_addr())
            .await
            .unwrap();
        well_behaved.register("Client").await.unwrap();
        wait_for_interest(&server, "Client", 1).await;

        let mut flood = TcpStream::connect(server.local_addr()).await.unwrap();
        flood.write_all(&vec![b'1'; MAX_FRAME * 4]).await.unwrap();

        tokio::time::timeout(Duration::from_secs(2), async {
            while server.connection_count().await > 1 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        let mut rest = Vec::new();
        let end = tokio::time::timeout(Duration::from_secs(2), flood.read_to_end(&mut rest))
            .await
            .unwrap();
        assert!(rest.is_empty() || end.is_err());

        server
            .notify(Notification::new("Client", false, 9))
            .await
            .unwrap();
        assert_eq!(
            well_behaved.next_frame().await.unwrap(),
            Some(ChangeFrame::Notify(Notification::new("Client", false, 9)))
        );
        server.shutdown().await;
    }

    #[tokio::test]
    async fn stalled_reader_does_not_block_registrations() {
        let server = ChangeNotificationServer::start(
            &config()
                .with_connection_string("C".repeat(256 * 1024))
                .with_heartbeat_interval(Duration::from_millis(1)),
        )
        .await
        .unwrap();
        // never reads, so its socket buffers fill and the drain task parks in a write
        let _stalled = ChangeNotificationClient::connect(server.local_addr())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;

        let mut late = ChangeNotificationClient::connect(server.local_addr())
            .await
            .unwrap();
        late.register("Other").await.unwrap();
        wait_for_interest(&server, "Other", 1).await;
        drop(server);
    }

    #[tokio::test]
    async fn shutdown_closes_sockets() {
        let server = ChangeNotificationServer::start(&config()).await.unwrap();
        let mut client = ChangeNotificationClient::connect(server.local_addr())
            .await
            .unwrap();
        client.register("Client").await.unwrap();
        wait_for_interest(&server, "Client", 1).await;

        server.shutdown().await;
        let end = tokio::time::timeout(Duration::from_secs(2), client.next_frame())
            .await
            .unwrap();
        assert!(matches!(end, Ok(None) | Err(ChangeNotificationError::Io(_))));
    }
}

//! Fan-out registry for telemetry connections.
//!
//! Every registered client gets a bounded outbound queue and two tasks: the
//! outbound pump drains the queue onto the connection and pings on a fixed
//! period, the inbound pump answers application-level pings and notices when
//! the client goes away. `broadcast` never waits on a client: a full queue
//! means that client misses the message.

use bytes::Bytes;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tether_common::traits::{DuplexConnection, FrameSink, FrameSource};
use tether_common::Frame;
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::protocol;

static CLIENT_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Identifier handed out by [`Hub::register`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientId(u64);

impl ClientId {
    fn next() -> Self {
        Self(CLIENT_COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "client-{}", self.0)
    }
}

/// Returned by [`Hub::register`]
#[derive(Debug, Clone, Copy)]
pub struct ClientHandle {
    pub id: ClientId,
}

/// Tuning for client queues and liveness
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Messages a client may have queued before broadcasts to it are dropped
    pub queue_capacity: usize,
    /// Period of the keepalive ping, independent of data traffic
    pub keepalive_interval: Duration,
    /// Silence after which the inbound pump gives up on a client
    pub read_timeout: Duration,
    /// Upper bound for a single write to a client
    pub write_timeout: Duration,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 256,
            keepalive_interval: Duration::from_secs(54),
            read_timeout: Duration::from_secs(60),
            write_timeout: Duration::from_secs(10),
        }
    }
}

/// Outcome of one [`Hub::broadcast`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub dropped: usize,
}

struct ClientEntry {
    queue: mpsc::Sender<Frame>,
    cancel: CancellationToken,
}

/// Directory of connected telemetry clients
pub struct Hub {
    clients: RwLock<HashMap<ClientId, ClientEntry>>,
    config: HubConfig,
}

impl Hub {
    pub fn new(config: HubConfig) -> Self {
        Self {
            clients: RwLock::new(HashMap::new()),
            config,
        }
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    /// Add a connection and start its pumps. Returns as soon as the entry is in.
    #[instrument(skip_all)]
    pub async fn register<C: DuplexConnection>(self: &Arc<Self>, conn: C) -> ClientHandle {
        let id = ClientId::next();
        let (queue, rx) = mpsc::channel(self.config.queue_capacity.max(1));
        let cancel = CancellationToken::new();
        let pong_queue = queue.downgrade();

        self.clients.write().await.insert(
            id,
            ClientEntry {
                queue,
                cancel: cancel.clone(),
            },
        );

        let (sink, source) = conn.split();
        tokio::spawn(self.clone().outbound_pump(id, sink, rx, cancel.clone()));
        tokio::spawn(self.clone().inbound_pump(id, source, pong_queue, cancel));

        info!(client = %id, "Telemetry client registered");
        ClientHandle { id }
    }

    /// Remove a client and close its queue. Returns whether it was registered.
    pub async fn unregister(&self, id: ClientId) -> bool {
        let entry = self.clients.write().await.remove(&id);
        match entry {
            Some(entry) => {
                entry.cancel.cancel();
                info!(client = %id, "Telemetry client unregistered");
                true
            }
            None => false,
        }
    }

    /// Offer `message` to every client without waiting on any of them.
    ///
    /// UTF-8 payloads go out as text frames, anything else as binary.
    pub async fn broadcast(&self, message: Bytes) -> BroadcastReport {
        let frame = text_frame(message);
        let clients = self.clients.read().await;
        let mut report = BroadcastReport::default();

        for (id, client) in clients.iter() {
            match client.queue.try_send(frame.clone()) {
                Ok(()) => report.delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    debug!(client = %id, "Queue full, dropping message");
                    report.dropped += 1;
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    // The pumps are already on their way to unregistering it.
                    report.dropped += 1;
                }
            }
        }

        report
    }

    pub async fn client_count(&self) -> usize {
        self.clients.read().await.len()
    }

    pub async fn contains(&self, id: ClientId) -> bool {
        self.clients.read().await.contains_key(&id)
    }

    /// Messages waiting in a client's queue
    pub async fn pending(&self, id: ClientId) -> Option<usize> {
        let clients = self.clients.read().await;
        clients
            .get(&id)
            .map(|c| c.queue.max_capacity() - c.queue.capacity())
    }

    async fn outbound_pump(
        self: Arc<Self>,
        id: ClientId,
        mut sink: Box<dyn FrameSink>,
        mut rx: mpsc::Receiver<Frame>,
        cancel: CancellationToken,
    ) {
        let keepalive_every = self.config.keepalive_interval;
        let mut keepalive = tokio::time::interval_at(tokio::time::Instant::now() + keepalive_every, keepalive_every);
        keepalive.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            let frame = tokio::select! {
                _ = cancel.cancelled() => break,
                frame = rx.recv() => match frame {
                    Some(frame) => frame,
                    None => break,
                },
                _ = keepalive.tick() => Frame::Ping(Vec::new()),
            };

            let sent = tokio::select! {
                _ = cancel.cancelled() => break,
                sent = tokio::time::timeout(self.config.write_timeout, sink.send(frame)) => sent,
            };
            match sent {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    debug!(client = %id, "Write failed: {}", e);
                    break;
                }
                Err(_) => {
                    warn!(client = %id, "Write timed out");
                    break;
                }
            }
        }

        self.unregister(id).await;
        if tokio::time::timeout(self.config.write_timeout, sink.close()).await.is_err() {
            debug!(client = %id, "Close timed out");
        }
    }

    async fn inbound_pump(
        self: Arc<Self>,
        id: ClientId,
        mut source: Box<dyn FrameSource>,
        queue: mpsc::WeakSender<Frame>,
        cancel: CancellationToken,
    ) {
        loop {
            let received = tokio::select! {
                _ = cancel.cancelled() => break,
                received = tokio::time::timeout(self.config.read_timeout, source.receive()) => received,
            };

            let frame = match received {
                Ok(Some(Ok(frame))) => frame,
                Ok(Some(Err(e))) => {
                    debug!(client = %id, "Read failed: {}", e);
                    break;
                }
                Ok(None) => break,
                Err(_) => {
                    info!(client = %id, "No traffic within read timeout");
                    break;
                }
            };

            match frame {
                Frame::Close => break,
                Frame::Text(_) | Frame::Binary(_) => {
                    if is_ping(frame.payload().unwrap_or_default()) {
                        let Some(queue) = queue.upgrade() else { break };
                        if queue.try_send(Frame::Text(protocol::pong())).is_err() {
                            debug!(client = %id, "Queue full, dropping pong");
                        }
                    }
                }
                Frame::Ping(_) | Frame::Pong(_) => {}
            }
        }

        self.unregister(id).await;
    }
}

fn text_frame(message: Bytes) -> Frame {
    match String::from_utf8(message.to_vec()) {
        Ok(text) => Frame::Text(text),
        Err(e) => Frame::Binary(e.into_bytes()),
    }
}

fn is_ping(payload: &[u8]) -> bool {
    #[derive(serde::Deserialize)]
    struct Typed {
        #[serde(rename = "type")]
        kind: Option<String>,
    }

    serde_json::from_slice::<Typed>(payload)
        .map(|t| t.kind.as_deref() == Some("ping"))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests;

//! In-process duplex connection backed by bounded channels.
//!
//! `duplex` returns the server end (a [`DuplexConnection`]) and the client end
//! ([`MemoryPeer`]). The channel capacity bounds how many frames either side can
//! have in flight, so a peer that stops reading eventually blocks the server's
//! `send`, which is how a slow consumer looks to the core.

use crate::error::{Result, TetherError};
use crate::traits::{DuplexConnection, FrameSink, FrameSource};
use crate::types::Frame;
use async_trait::async_trait;
use tokio::sync::mpsc;

/// Create a connected server/client pair
pub fn duplex(capacity: usize) -> (MemoryConnection, MemoryPeer) {
    let (to_peer, from_server) = mpsc::channel(capacity);
    let (to_server, from_peer) = mpsc::channel(capacity);

    let conn = MemoryConnection {
        outbound: to_peer,
        inbound: from_peer,
    };
    let peer = MemoryPeer {
        outbound: Some(to_server),
        inbound: from_server,
    };
    (conn, peer)
}

/// Server end of an in-memory connection
pub struct MemoryConnection {
    outbound: mpsc::Sender<Frame>,
    inbound: mpsc::Receiver<Frame>,
}

impl DuplexConnection for MemoryConnection {
    fn split(self) -> (Box<dyn FrameSink>, Box<dyn FrameSource>) {
        let sink = MemorySink {
            outbound: Some(self.outbound),
        };
        let source = MemorySource {
            inbound: self.inbound,
        };
        (Box::new(sink), Box::new(source))
    }
}

struct MemorySink {
    outbound: Option<mpsc::Sender<Frame>>,
}

#[async_trait]
impl FrameSink for MemorySink {
    async fn send(&mut self, frame: Frame) -> Result<()> {
        let outbound = self.outbound.as_ref().ok_or(TetherError::Closed("connection"))?;
        outbound
            .send(frame)
            .await
            .map_err(|_| TetherError::Connection("peer went away".to_string()))
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(outbound) = self.outbound.take() {
            // Best effort: a full or dropped peer still ends up seeing the channel close.
            let _ = outbound.try_send(Frame::Close);
        }
        Ok(())
    }
}

struct MemorySource {
    inbound: mpsc::Receiver<Frame>,
}

#[async_trait]
impl FrameSource for MemorySource {
    async fn receive(&mut self) -> Option<Result<Frame>> {
        self.inbound.recv().await.map(Ok)
    }
}

/// Client end of an in-memory connection
pub struct MemoryPeer {
    outbound: Option<mpsc::Sender<Frame>>,
    inbound: mpsc::Receiver<Frame>,
}

impl MemoryPeer {
    /// Send a frame to the server
    pub async fn send(&self, frame: Frame) -> Result<()> {
        let outbound = self.outbound.as_ref().ok_or(TetherError::Closed("peer"))?;
        outbound
            .send(frame)
            .await
            .map_err(|_| TetherError::Connection("server went away".to_string()))
    }

    pub async fn send_text(&self, text: impl Into<String>) -> Result<()> {
        self.send(Frame::Text(text.into())).await
    }

    /// Next frame from the server; `None` once the server dropped its end
    pub async fn recv(&mut self) -> Option<Frame> {
        self.inbound.recv().await
    }

    /// Non-blocking variant of [`MemoryPeer::recv`]
    pub fn try_recv(&mut self) -> Option<Frame> {
        self.inbound.try_recv().ok()
    }

    /// Hang up without a close frame, like a dropped network link.
    pub fn disconnect(&mut self) {
        self.outbound = None;
    }
}

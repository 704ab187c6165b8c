use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tether_common::traits::{DuplexConnection, FrameSink, FrameSource};
use tether_common::{Frame, Result, TetherError};
use tracing::debug;

/// An upgraded websocket seen as a [`DuplexConnection`]
pub struct WebSocketConnection {
    socket: WebSocket,
}

impl WebSocketConnection {
    pub fn new(socket: WebSocket) -> Self {
        Self { socket }
    }
}

impl DuplexConnection for WebSocketConnection {
    fn split(self) -> (Box<dyn FrameSink>, Box<dyn FrameSource>) {
        let (sender, receiver) = self.socket.split();
        (
            Box::new(WebSocketSink {
                sender,
                closed: false,
            }),
            Box::new(WebSocketSource { receiver }),
        )
    }
}

struct WebSocketSink {
    sender: SplitSink<WebSocket, Message>,
    closed: bool,
}

#[async_trait]
impl FrameSink for WebSocketSink {
    async fn send(&mut self, frame: Frame) -> Result<()> {
        if self.closed {
            return Err(TetherError::Closed("websocket"));
        }
        self.sender.send(to_message(frame)).await.map_err(connection_error)
    }

    async fn close(&mut self) -> Result<()> {
        if std::mem::replace(&mut self.closed, true) {
            return Ok(());
        }
        // The peer may already be gone; the socket is finished either way.
        if let Err(e) = self.sender.send(Message::Close(None)).await {
            debug!("Close frame not delivered: {}", e);
        }
        self.sender.close().await.map_err(connection_error)
    }
}

struct WebSocketSource {
    receiver: SplitStream<WebSocket>,
}

#[async_trait]
impl FrameSource for WebSocketSource {
    async fn receive(&mut self) -> Option<Result<Frame>> {
        let message = self.receiver.next().await?;
        Some(message.map(from_message).map_err(connection_error))
    }
}

fn to_message(frame: Frame) -> Message {
    match frame {
        Frame::Text(text) => Message::Text(text),
        Frame::Binary(data) => Message::Binary(data),
        Frame::Ping(data) => Message::Ping(data),
        Frame::Pong(data) => Message::Pong(data),
        Frame::Close => Message::Close(None),
    }
}

fn from_message(message: Message) -> Frame {
    match message {
        Message::Text(text) => Frame::Text(text),
        Message::Binary(data) => Frame::Binary(data),
        Message::Ping(data) => Frame::Ping(data),
        Message::Pong(data) => Frame::Pong(data),
        Message::Close(_) => Frame::Close,
    }
}

fn connection_error(e: axum::Error) -> TetherError {
    TetherError::Connection(e.to_string())
}

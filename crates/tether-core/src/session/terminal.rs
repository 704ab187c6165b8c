use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tether_common::traits::{DuplexConnection, FrameSink, FrameSource, TerminalBackend};
use tether_common::{Frame, PtyRead, Result, TetherError};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use super::state::{SessionState, StateCell};
use super::{SessionId, SessionInfo, SessionManager};
use crate::protocol::{self, ControlMessage, ErrorFrame, Utf8Carry};
use crate::pty::{PtyProcess, ShellConfig};

/// How long teardown waits for the peer to take the close frame
const CLOSE_GRACE: Duration = Duration::from_secs(5);

/// What ended a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The shell exited and the PTY reported end of stream
    ProcessExited,
    ReadError,
    WriteError,
    /// The client closed or hung up
    ConnectionClosed,
    ConnectionError,
    /// A pump task died unexpectedly
    Aborted,
}

/// Returned once a session has fully torn down
#[derive(Debug, Clone)]
pub struct SessionSummary {
    pub id: SessionId,
    pub reason: CloseReason,
}

/// One shell bridged to one duplex connection.
///
/// Two tasks run per session: the output pump (PTY -> client) and the input
/// pump (client -> PTY). Either one may start teardown; the state cell makes
/// sure only one of them actually runs it.
pub struct TerminalSession {
    id: SessionId,
    state: StateCell,
    backend: Arc<dyn TerminalBackend>,
    sink: Mutex<Box<dyn FrameSink>>,
    cancel: CancellationToken,
    directory: Arc<SessionManager>,
    reason: StdMutex<Option<CloseReason>>,
}

impl TerminalSession {
    /// Spawn a shell for `conn` and bridge them until either side goes away.
    ///
    /// A spawn failure is reported to the client as an error frame and the
    /// connection is closed; the error is also returned.
    pub async fn serve<C: DuplexConnection>(
        conn: C,
        config: &ShellConfig,
        directory: Arc<SessionManager>,
    ) -> Result<SessionSummary> {
        let shell = config.resolve_program();
        let config = config.clone();
        // openpty and fork/exec block; keep them off the async workers.
        let backend = match tokio::task::spawn_blocking(move || PtyProcess::spawn(&config)).await {
            Ok(spawned) => spawned.map(|pty| Arc::new(pty) as Arc<dyn TerminalBackend>),
            Err(e) => Err(TetherError::Spawn(format!("spawn task failed: {}", e))),
        };
        Self::attach(conn, backend, shell, directory).await
    }

    /// Bridge an already spawned backend (or its spawn error) to `conn`.
    #[instrument(skip_all, fields(shell = %shell))]
    pub async fn attach<C: DuplexConnection>(
        conn: C,
        backend: Result<Arc<dyn TerminalBackend>>,
        shell: String,
        directory: Arc<SessionManager>,
    ) -> Result<SessionSummary> {
        let (mut sink, source) = conn.split();
        let state = StateCell::new();

        let backend = match backend {
            Ok(backend) => backend,
            Err(e) => {
                error!("Failed to create terminal session: {}", e);
                state.begin_close();
                let message = e.to_string();
                if let Err(send_err) = sink.send(Frame::Text(ErrorFrame::new(&message).to_json())).await {
                    debug!("Could not deliver spawn error: {}", send_err);
                }
                let _ = tokio::time::timeout(CLOSE_GRACE, sink.close()).await;
                state.finish_close();
                return Err(e);
            }
        };

        let info = SessionInfo::new(shell, backend.process_id(), backend.size());
        let session = Arc::new(TerminalSession {
            id: info.id,
            state,
            backend,
            sink: Mutex::new(sink),
            cancel: CancellationToken::new(),
            directory: directory.clone(),
            reason: StdMutex::new(None),
        });

        directory.register(info).await;
        session.state.activate();
        info!(session = %session.id, pid = ?session.backend.process_id(), "Terminal session active");

        let output = tokio::spawn(session.clone().output_pump());
        let input = tokio::spawn(session.clone().input_pump(source));
        let (output, input) = tokio::join!(output, input);
        for (pump, result) in [("output", output), ("input", input)] {
            if let Err(e) = result {
                error!(session = %session.id, "{} pump failed: {}", pump, e);
            }
        }
        // Normally a pump has already done this; it covers a panicked pump.
        session.shutdown(CloseReason::Aborted).await;

        Ok(SessionSummary {
            id: session.id,
            reason: session.close_reason().unwrap_or(CloseReason::Aborted),
        })
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.state.get()
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        *self.reason.lock().unwrap_or_else(|p| p.into_inner())
    }

    async fn output_pump(self: Arc<Self>) {
        let mut carry = Utf8Carry::new();
        let reason = loop {
            let read = tokio::select! {
                _ = self.cancel.cancelled() => return,
                read = self.backend.read() => read,
            };

            match read {
                Ok(PtyRead::Data(data)) => {
                    let text = carry.push(&data);
                    if text.is_empty() {
                        continue;
                    }
                    if let Err(e) = self.send(Frame::Text(text)).await {
                        debug!(session = %self.id, "Output send failed: {}", e);
                        break CloseReason::ConnectionError;
                    }
                }
                Ok(PtyRead::Eof) => {
                    let tail = carry.finish();
                    if !tail.is_empty() {
                        if let Err(e) = self.send(Frame::Text(tail)).await {
                            debug!(session = %self.id, "Final output send failed: {}", e);
                        }
                    }
                    break CloseReason::ProcessExited;
                }
                Err(e) => {
                    warn!(session = %self.id, "PTY read failed: {}", e);
                    break CloseReason::ReadError;
                }
            }
        };
        self.shutdown(reason).await;
    }

    async fn input_pump(self: Arc<Self>, mut source: Box<dyn FrameSource>) {
        let reason = loop {
            let frame = tokio::select! {
                _ = self.cancel.cancelled() => return,
                frame = source.receive() => frame,
            };

            let frame = match frame {
                Some(Ok(frame)) => frame,
                Some(Err(e)) => {
                    debug!(session = %self.id, "Connection error: {}", e);
                    break CloseReason::ConnectionError;
                }
                None => break CloseReason::ConnectionClosed,
            };

            let message = match &frame {
                Frame::Close => break CloseReason::ConnectionClosed,
                Frame::Ping(_) | Frame::Pong(_) => continue,
                Frame::Text(_) | Frame::Binary(_) => {
                    ControlMessage::parse(frame.payload().unwrap_or_default())
                }
            };

            if let Err(reason) = self.dispatch(message).await {
                break reason;
            }
        };
        self.shutdown(reason).await;
    }

    async fn dispatch(&self, message: ControlMessage) -> std::result::Result<(), CloseReason> {
        match message {
            ControlMessage::Input(data) | ControlMessage::Unrecognized(data) => {
                if data.is_empty() {
                    return Ok(());
                }
                self.backend.write(&data).await.map_err(|e| {
                    warn!(session = %self.id, "PTY write failed: {}", e);
                    CloseReason::WriteError
                })
            }
            ControlMessage::Resize(size) => {
                if !size.is_valid() {
                    warn!(session = %self.id, "Ignoring resize to {:?}", size);
                    return Ok(());
                }
                match self.backend.resize(size).await {
                    Ok(()) => self.directory.update_size(self.id, size).await,
                    Err(e) => warn!(session = %self.id, "PTY resize failed: {}", e),
                }
                Ok(())
            }
            ControlMessage::Ping => self.send(Frame::Text(protocol::pong())).await.map_err(|e| {
                debug!(session = %self.id, "Pong send failed: {}", e);
                CloseReason::ConnectionError
            }),
            ControlMessage::Unknown(kind) => {
                debug!(session = %self.id, "Ignoring message type {:?}", kind);
                Ok(())
            }
        }
    }

    /// Write one frame to the client.
    ///
    /// Both pumps write through here; the sink lock keeps frames whole. Once
    /// the session has left `Active` nothing more is sent.
    async fn send(&self, frame: Frame) -> Result<()> {
        let mut sink = self.sink.lock().await;
        if !self.state.is_active() {
            return Err(TetherError::Closed("session"));
        }
        tokio::select! {
            _ = self.cancel.cancelled() => Err(TetherError::Closed("session")),
            sent = sink.send(frame) => sent,
        }
    }

    /// Tear the session down. Only the first call does anything.
    pub async fn shutdown(&self, reason: CloseReason) {
        if !self.state.begin_close() {
            return;
        }
        *self.reason.lock().unwrap_or_else(|p| p.into_inner()) = Some(reason);
        info!(session = %self.id, ?reason, "Closing terminal session");

        self.cancel.cancel();
        self.backend.terminate().await;

        {
            let mut sink = self.sink.lock().await;
            match tokio::time::timeout(CLOSE_GRACE, sink.close()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => debug!(session = %self.id, "Close failed: {}", e),
                Err(_) => debug!(session = %self.id, "Peer did not take the close frame"),
            }
        }

        self.directory.remove_session(self.id).await;
        self.state.finish_close();
        info!(session = %self.id, "Terminal session closed");
    }
}

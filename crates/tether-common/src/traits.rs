use crate::error::Result;
use crate::types::{Frame, PtyRead, Size};
use async_trait::async_trait;

/// Writing half of a duplex connection
#[async_trait]
pub trait FrameSink: Send {
    /// Send one frame to the peer
    async fn send(&mut self, frame: Frame) -> Result<()>;

    /// Close the connection. Closing twice is not an error.
    async fn close(&mut self) -> Result<()>;
}

/// Reading half of a duplex connection
#[async_trait]
pub trait FrameSource: Send {
    /// Next frame from the peer, or `None` once the connection has ended
    async fn receive(&mut self) -> Option<Result<Frame>>;
}

/// A full-duplex, message-oriented transport produced by a protocol upgrade.
///
/// The core never looks past this trait: websockets, in-memory pipes and test
/// doubles all plug in here.
pub trait DuplexConnection: Send + 'static {
    fn split(self) -> (Box<dyn FrameSink>, Box<dyn FrameSource>);
}

/// Trait for terminal backends (a child process on a PTY)
///
/// All methods take `&self` so the output pump and the input pump can share one
/// backend; implementations keep the read and write sides behind separate locks.
#[async_trait]
pub trait TerminalBackend: Send + Sync {
    /// Read available output. Only ever called by one task at a time.
    async fn read(&self) -> Result<PtyRead>;

    /// Write data to the process's input
    async fn write(&self, data: &[u8]) -> Result<()>;

    /// Resize the terminal window
    async fn resize(&self, size: Size) -> Result<()>;

    /// Last size applied to the device
    fn size(&self) -> Size;

    /// OS process id of the child, if known
    fn process_id(&self) -> Option<u32>;

    /// Kill the child, reap it and close the device. Idempotent.
    async fn terminate(&self);

    /// Check whether `terminate` has run
    fn is_terminated(&self) -> bool;
}

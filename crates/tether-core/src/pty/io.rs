use portable_pty::MasterPty;
use std::fs::File;
use std::io::{Read, Write};
use std::os::fd::{AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::sync::{Arc, Mutex, MutexGuard};
use tether_common::{PtyRead, Result, TetherError};
use tokio::io::unix::AsyncFd;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

const READ_CHUNK: usize = 8192;

/// Async I/O on the PTY master
///
/// Holds its own non-blocking duplicate of the master descriptor registered
/// with the tokio reactor, so reads are cancel-safe and no thread ever sits in
/// a blocking `read`. `close` drops the descriptor even while a background job
/// still holds the slave side open.
pub struct AsyncPtyIo {
    fd: Mutex<Option<Arc<AsyncFd<File>>>>,
    /// Serializes writers so concurrent writes never interleave
    write_lock: tokio::sync::Mutex<()>,
    closed: CancellationToken,
}

impl AsyncPtyIo {
    /// Must be called from within a tokio runtime.
    pub fn new(master: &dyn MasterPty) -> Result<Self> {
        let raw = master.as_raw_fd().ok_or_else(|| {
            error!("Could not get raw file descriptor from master PTY");
            TetherError::Pty("master PTY has no file descriptor".to_string())
        })?;

        let file = File::from(duplicate(raw)?);
        set_nonblocking(file.as_raw_fd())?;

        let fd = AsyncFd::new(file).map_err(|e| {
            error!("Failed to register PTY with the reactor: {}", e);
            TetherError::Pty(format!("Failed to register PTY: {}", e))
        })?;

        Ok(Self {
            fd: Mutex::new(Some(Arc::new(fd))),
            write_lock: tokio::sync::Mutex::new(()),
            closed: CancellationToken::new(),
        })
    }

    pub async fn read(&self) -> Result<PtyRead> {
        let fd = self.handle("pty reader")?;
        let mut buf = vec![0u8; READ_CHUNK];

        loop {
            let mut ready = tokio::select! {
                _ = self.closed.cancelled() => return Ok(PtyRead::Eof),
                ready = fd.readable() => ready?,
            };

            match ready.try_io(|inner| {
                let mut file = inner.get_ref();
                file.read(&mut buf)
            }) {
                Ok(Ok(0)) => return Ok(PtyRead::Eof),
                Ok(Ok(n)) => {
                    buf.truncate(n);
                    return Ok(PtyRead::Data(buf));
                }
                Ok(Err(e)) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Ok(Err(e)) if is_hangup(&e) => {
                    debug!("PTY hung up: {}", e);
                    return Ok(PtyRead::Eof);
                }
                Ok(Err(e)) => {
                    error!("PTY read error: {}", e);
                    return Err(e.into());
                }
                // Spurious readiness; wait again.
                Err(_would_block) => continue,
            }
        }
    }

    pub async fn write(&self, data: &[u8]) -> Result<()> {
        let _serial = self.write_lock.lock().await;
        let fd = self.handle("pty writer")?;
        let mut written = 0;

        while written < data.len() {
            let mut ready = tokio::select! {
                _ = self.closed.cancelled() => return Err(TetherError::Closed("pty writer")),
                ready = fd.writable() => ready?,
            };

            match ready.try_io(|inner| {
                let mut file = inner.get_ref();
                file.write(&data[written..])
            }) {
                Ok(Ok(0)) => return Err(std::io::Error::from(std::io::ErrorKind::WriteZero).into()),
                Ok(Ok(n)) => written += n,
                Ok(Err(e)) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Ok(Err(e)) => {
                    error!("PTY write error: {}", e);
                    return Err(e.into());
                }
                Err(_would_block) => continue,
            }
        }
        Ok(())
    }

    /// Close the descriptor. Reads and writes in flight return immediately and
    /// release their reference, so the device is gone once they unwind.
    pub fn close(&self) {
        self.closed.cancel();
        lock(&self.fd).take();
    }

    fn handle(&self, what: &'static str) -> Result<Arc<AsyncFd<File>>> {
        lock(&self.fd).clone().ok_or(TetherError::Closed(what))
    }
}

fn duplicate(raw: RawFd) -> Result<OwnedFd> {
    // SAFETY: `raw` belongs to the master, which outlives this call.
    let borrowed = unsafe { BorrowedFd::borrow_raw(raw) };
    borrowed.try_clone_to_owned().map_err(|e| {
        error!("Failed to duplicate PTY master: {}", e);
        TetherError::Pty(format!("Failed to duplicate PTY master: {}", e))
    })
}

fn set_nonblocking(fd: RawFd) -> Result<()> {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL, 0);
        if flags == -1 || libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) == -1 {
            let err = std::io::Error::last_os_error();
            error!("Failed to set non-blocking mode: {}", err);
            return Err(TetherError::Pty(format!("Failed to set non-blocking mode: {}", err)));
        }
    }
    Ok(())
}

/// Linux reports a closed slave side as `EIO` rather than a zero-length read.
fn is_hangup(err: &std::io::Error) -> bool {
    err.raw_os_error() == Some(libc::EIO)
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

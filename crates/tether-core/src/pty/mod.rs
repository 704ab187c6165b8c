use async_trait::async_trait;
use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use std::sync::{Mutex, MutexGuard};
use tether_common::{traits::TerminalBackend, PtyRead, Result, Size, TetherError};
use tokio::sync::OnceCell;
use tracing::{debug, error, info, instrument, warn};

mod io;

use io::AsyncPtyIo;

/// Shell used when neither the configuration nor `$SHELL` names one
pub const DEFAULT_SHELL: &str = "/bin/bash";

/// What to launch for a new terminal session
#[derive(Debug, Clone)]
pub struct ShellConfig {
    pub program: Option<String>,
    pub initial_size: Size,
}

impl ShellConfig {
    pub fn new(program: Option<String>, initial_size: Size) -> Self {
        Self {
            program,
            initial_size,
        }
    }

    /// Configured shell, then `$SHELL`, then [`DEFAULT_SHELL`].
    pub fn resolve_program(&self) -> String {
        self.program
            .clone()
            .filter(|p| !p.is_empty())
            .or_else(|| std::env::var("SHELL").ok().filter(|s| !s.is_empty()))
            .unwrap_or_else(|| DEFAULT_SHELL.to_string())
    }
}

impl Default for ShellConfig {
    fn default() -> Self {
        Self::new(None, Size::default())
    }
}

/// A shell process attached to its own pseudo-terminal.
///
/// Owns the child and the master side of the device exclusively. Everything is
/// released by [`TerminalBackend::terminate`], which runs once no matter how
/// many times or from how many tasks it is called.
pub struct PtyProcess {
    master: Mutex<Option<Box<dyn MasterPty + Send>>>,
    io: AsyncPtyIo,
    child: Mutex<Option<Box<dyn Child + Send + Sync>>>,
    pid: Option<u32>,
    size: Mutex<Size>,
    teardown: OnceCell<()>,
}

impl PtyProcess {
    /// Spawn the configured shell on a fresh PTY.
    ///
    /// Blocks on openpty and fork/exec, and needs a tokio runtime context to
    /// register the master with the reactor.
    #[instrument(skip(config))]
    pub fn spawn(config: &ShellConfig) -> Result<Self> {
        let shell = config.resolve_program();
        let size = config.initial_size;

        let pty_system = native_pty_system();
        debug!("Opening PTY with size {:?}", size);
        let pair = pty_system
            .openpty(pty_size(size))
            .map_err(|e| TetherError::Spawn(format!("failed to allocate pseudo-terminal: {}", e)))?;

        let mut cmd = CommandBuilder::new(&shell);
        cmd.env("TERM", "xterm-256color");
        cmd.env("COLORTERM", "truecolor");

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| TetherError::Spawn(format!("{}: {}", shell, e)))?;
        // The child holds its own copy of the slave; keeping ours open would
        // hide the hangup when the shell exits.
        drop(pair.slave);

        let pid = child.process_id();
        let io = match AsyncPtyIo::new(pair.master.as_ref()) {
            Ok(io) => io,
            Err(e) => {
                reap(child, pid);
                return Err(TetherError::Spawn(e.to_string()));
            }
        };

        info!(?pid, "Spawned shell {} on PTY", shell);
        Ok(Self {
            master: Mutex::new(Some(pair.master)),
            io,
            child: Mutex::new(Some(child)),
            pid,
            size: Mutex::new(size),
            teardown: OnceCell::new(),
        })
    }

    async fn release(&self) {
        let child = lock(&self.child).take();
        if let Some(child) = child {
            let pid = self.pid;
            if let Err(e) = tokio::task::spawn_blocking(move || reap(child, pid)).await {
                error!(?pid, "Reaper task failed: {}", e);
            }
        }
        self.io.close();
        lock(&self.master).take();
        info!(pid = ?self.pid, "PTY released");
    }
}

#[async_trait]
impl TerminalBackend for PtyProcess {
    async fn read(&self) -> Result<PtyRead> {
        if self.is_terminated() {
            return Err(TetherError::Closed("pty"));
        }
        self.io.read().await
    }

    #[instrument(skip(self, data), fields(len = data.len()))]
    async fn write(&self, data: &[u8]) -> Result<()> {
        if self.is_terminated() {
            return Err(TetherError::Closed("pty"));
        }
        self.io.write(data).await
    }

    #[instrument(skip(self))]
    async fn resize(&self, size: Size) -> Result<()> {
        let master = lock(&self.master);
        let master = master.as_ref().ok_or(TetherError::Closed("pty"))?;
        master
            .resize(pty_size(size))
            .map_err(|e| TetherError::Pty(format!("Failed to resize PTY: {}", e)))?;

        *lock(&self.size) = size;
        debug!("PTY resized to {:?}", size);
        Ok(())
    }

    fn size(&self) -> Size {
        *lock(&self.size)
    }

    fn process_id(&self) -> Option<u32> {
        self.pid
    }

    async fn terminate(&self) {
        // Concurrent callers wait for the first teardown to finish.
        self.teardown.get_or_init(|| self.release()).await;
    }

    fn is_terminated(&self) -> bool {
        self.teardown.initialized()
    }
}

impl Drop for PtyProcess {
    fn drop(&mut self) {
        if let Some(child) = lock(&self.child).take() {
            warn!(pid = ?self.pid, "PTY dropped without terminate, reaping inline");
            reap(child, self.pid);
        }
    }
}

fn pty_size(size: Size) -> PtySize {
    PtySize {
        rows: size.rows,
        cols: size.cols,
        pixel_width: 0,
        pixel_height: 0,
    }
}

/// Hang up the child if it is still running and wait for it so no zombie is left.
fn reap(mut child: Box<dyn Child + Send + Sync>, pid: Option<u32>) {
    match child.try_wait() {
        Ok(Some(status)) => {
            debug!(?pid, code = status.exit_code(), "Shell had already exited");
            return;
        }
        Ok(None) => {
            if let Err(e) = child.kill() {
                debug!(?pid, "Kill failed, shell may have just exited: {}", e);
            }
        }
        Err(e) => warn!(?pid, "Failed to poll shell status: {}", e),
    }

    match child.wait() {
        Ok(status) => debug!(?pid, code = status.exit_code(), "Shell reaped"),
        Err(e) => warn!(?pid, "Failed to wait for shell: {}", e),
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

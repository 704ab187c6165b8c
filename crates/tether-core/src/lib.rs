//! Terminal bridge and telemetry hub.
//!
//! [`TerminalSession`] connects one shell on a pseudo-terminal to one duplex
//! connection. [`Hub`] fans telemetry snapshots produced by
//! [`TelemetryProducer`] out to every registered connection.

#[cfg(not(unix))]
compile_error!("tether-core drives the PTY master through the tokio reactor and supports Unix only");

pub mod hub;
pub mod protocol;
pub mod pty;
pub mod session;
pub mod telemetry;

pub use hub::{BroadcastReport, ClientHandle, ClientId, Hub, HubConfig};
pub use pty::{PtyProcess, ShellConfig};
pub use session::{CloseReason, SessionId, SessionInfo, SessionManager, SessionSummary, TerminalSession};
pub use telemetry::{StatsSampler, SysinfoSampler, SystemStats, TelemetryProducer};

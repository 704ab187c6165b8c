use thiserror::Error;

#[derive(Error, Debug)]
pub enum TetherError {
    #[error("Failed to start terminal: {0}")]
    Spawn(String),

    #[error("PTY error: {0}")]
    Pty(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Telemetry error: {0}")]
    Telemetry(String),

    #[error("Configuration error: {0}")]
    Config(String),

    /// The resource was already torn down.
    #[error("{0} is closed")]
    Closed(&'static str),
}

pub type Result<T> = std::result::Result<T, TetherError>;

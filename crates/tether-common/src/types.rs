use serde::{Deserialize, Serialize};

/// Terminal dimensions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Size {
    pub rows: u16,
    pub cols: u16,
}

impl Size {
    pub fn new(rows: u16, cols: u16) -> Self {
        Self { rows, cols }
    }

    /// A PTY window must have at least one row and one column.
    pub fn is_valid(&self) -> bool {
        self.rows > 0 && self.cols > 0
    }
}

impl Default for Size {
    fn default() -> Self {
        Self::new(24, 80)
    }
}

/// A single message on a duplex connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
    Ping(Vec<u8>),
    Pong(Vec<u8>),
    Close,
}

impl Frame {
    /// Payload bytes of a data frame; control frames have none.
    pub fn payload(&self) -> Option<&[u8]> {
        match self {
            Frame::Text(text) => Some(text.as_bytes()),
            Frame::Binary(data) => Some(data),
            _ => None,
        }
    }
}

/// Outcome of a single PTY read
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PtyRead {
    Data(Vec<u8>),
    /// The device reported closure; the child has exited.
    Eof,
}

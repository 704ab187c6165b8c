pub mod error;
pub mod memory;
pub mod traits;
pub mod types;

pub use error::{Result, TetherError};
pub use types::{Frame, PtyRead, Size};

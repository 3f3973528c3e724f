//! Protocol error taxonomy.
//!
//! Setup failures (bind/listen) travel as `anyhow::Error` with context; the
//! errors here describe a single misbehaving peer or datagram and never take
//! the server down.

use thiserror::Error;

/// Framing and validation failures for data read off the wire.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// Fewer bytes than a fixed-size header needs.
    #[error("truncated header: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },

    /// Datagram did not start with the protocol sentinel.
    #[error("bad magic: expected {expected:#06X}, got {got:#06X}")]
    BadMagic { expected: u16, got: u16 },

    /// Declared payload length exceeds the configured maximum.
    #[error("declared size {size} exceeds maximum {max}")]
    Oversized { size: usize, max: usize },

    /// Declared payload length disagrees with the bytes actually received.
    #[error("declared size {declared} but {available} bytes follow the header")]
    LengthMismatch { declared: usize, available: usize },
}

/// Result alias for codec operations.
pub type ProtocolResult<T> = std::result::Result<T, ProtocolError>;

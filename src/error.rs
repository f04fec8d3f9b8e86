use thiserror::Error;

/// All errors produced by the taut transport layer.
#[derive(Debug, Error)]
pub enum TautError {
    #[error("socket bind failed: {0}")]
    BindFailed(#[source] std::io::Error),

    #[error("handshake failed after {attempts} attempts")]
    HandshakeFailed { attempts: u32 },

    #[error("delivery failed: seq {seq} exhausted {retries} transmissions")]
    DeliveryFailed { seq: u32, retries: u32 },

    #[error("connection is closed")]
    ConnectionClosed,

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("operation timed out")]
    TimedOut,

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("payload too large: {size} bytes exceeds maximum {max}")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("frame too short: expected at least {expected} bytes, got {actual}")]
    FrameTooShort { expected: usize, actual: usize },

    #[error("checksum mismatch: header says 0x{expected:08x}, computed 0x{actual:08x}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl TautError {
    /// Decode failures the receive loop recovers from by dropping the
    /// datagram. Never surfaced to the caller.
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            TautError::FrameTooShort { .. } | TautError::ChecksumMismatch { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, TautError>;

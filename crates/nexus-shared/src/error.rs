use thiserror::Error;

/// Framing violations. Every variant is fatal to the connection that
/// produced it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("Payload too large: {len} bytes (max {max})")]
    PayloadTooLarge { len: usize, max: usize },

    #[error("Checksum mismatch on packet {message_id}: header {expected:#010x}, computed {actual:#010x}")]
    ChecksumMismatch {
        message_id: u16,
        expected: u32,
        actual: u32,
    },
}

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("Unexpected packet: expected {expected}, got {actual}")]
    UnexpectedPacket { expected: u16, actual: u16 },
}

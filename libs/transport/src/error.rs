use thiserror::Error;

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The connection failed more often than its ceiling allows.
    #[error("{connection}: gave up reconnecting after {attempts} consecutive failures")]
    RetriesExhausted { connection: String, attempts: u32 },

    /// A connection attempt failed.
    #[error("connect to {connection} failed: {reason}")]
    Connect { connection: String, reason: String },

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransportError {
    /// Returns true if reconnecting has been abandoned.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::RetriesExhausted { .. })
    }
}

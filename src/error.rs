use std::io;

use thiserror::Error;

/// Errors returned by the message engine drivers.
#[derive(Debug, Error)]
pub enum Error {
    /// Fatal transport error from `recv`/`sendv`. `WouldBlock` never
    /// surfaces here — it is success with zero progress.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// Message pool refused an acquire (soft or hard ceiling).
    #[error("message pool exhausted")]
    PoolExhausted,
    /// Malformed frame on a client-plane connection.
    #[error("protocol error")]
    Protocol,
    /// Envelope payload failed authenticated decryption.
    #[error("payload decryption failed")]
    Crypto,
    /// Configuration value out of range.
    #[error("config: {0}")]
    Config(String),
}

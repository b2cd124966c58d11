//! Errors produced by the session state machine (C7)

use crate::connection;

/// Error produced by the session layer
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The connection endpoint beneath this session failed
    #[error(transparent)]
    Connection(#[from] connection::Error),

    /// The value model failed to encode a performative while measuring its
    /// size for fragmentation, or while sending a TRANSFER
    #[error("failed to encode performative: {0}")]
    Encode(#[from] serde_amqp::Error),

    /// `transfer` was called while the session is not `Mapped`
    #[error("session is not in the Mapped state")]
    NotMapped,
}

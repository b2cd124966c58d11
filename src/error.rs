//! The unified error type returned by the public engine API.
//!
//! Each layer defines its own error enum scoped to what can go wrong at
//! that layer; this type just wraps the layer that actually failed so
//! callers driving [`crate::connection::Connection`] and
//! [`crate::session::Session`] have a single `Result` to match on.

use thiserror::Error;

use crate::{amqp, connection, frame, sasl, session};

/// Top-level error for the synchronous AMQP 1.0 engine.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The transport I/O adapter failed.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// The generic frame codec rejected a frame.
    #[error(transparent)]
    Frame(#[from] frame::Error),

    /// The AMQP frame codec failed to decode or encode a performative.
    #[error(transparent)]
    Amqp(#[from] amqp::Error),

    /// The SASL frame codec or negotiation state machine failed.
    #[error(transparent)]
    SaslFrame(#[from] sasl::FrameError),

    /// SASL negotiation was aborted or the peer rejected our credentials.
    #[error(transparent)]
    SaslNegotiation(#[from] sasl::NegotiationError),

    /// The connection state machine failed.
    #[error(transparent)]
    Connection(#[from] connection::Error),

    /// The session state machine failed.
    #[error(transparent)]
    Session(#[from] session::Error),
}

//! Errors produced by the connection state machine (C6)

use fe2o3_amqp_types::definitions;

use crate::{amqp, frame, sasl};

/// Error produced by the connection layer
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The underlying I/O failed
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// The frame codec beneath this layer failed
    #[error(transparent)]
    Frame(#[from] frame::Error),

    /// The AMQP frame codec failed to decode or encode a frame
    #[error(transparent)]
    AmqpFrame(#[from] amqp::Error),

    /// The SASL layer failed while negotiating ahead of this connection
    #[error(transparent)]
    Sasl(#[from] sasl::NegotiationError),

    /// No channel number remains free in `[0, channel_max]`
    #[error("no channel number is free in [0, channel_max]")]
    ChannelsExhausted,

    /// A frame arrived on, or an operation named, a channel with no bound endpoint
    #[error("channel {0} has no bound endpoint")]
    UnknownChannel(u16),

    /// A received protocol header byte mismatched the expected AMQP header at its position
    #[error("protocol header mismatch, received {0:?}")]
    ProtocolHeaderMismatch([u8; 8]),

    /// The operation requires the connection to be in the `Opened` state
    #[error("operation requires the connection to be Opened")]
    NotOpened,

    /// `set_max_frame_size` was called with a value below the 512-octet protocol floor
    #[error("max_frame_size {0} is below the 512-octet protocol floor")]
    MaxFrameSizeTooSmall(u32),

    /// The connection has already transitioned to a terminal state
    #[error("the connection is in a terminal error state")]
    IllegalState,

    /// The remote peer closed the connection, optionally carrying an error
    #[error("remote closed the connection: {0:?}")]
    RemoteClosed(Option<definitions::Error>),
}

//! Errors produced by the SASL frame codec (C3) and SASL I/O layer (C4)

use crate::frame;

/// Error produced while decoding/encoding a SASL frame
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The frame codec beneath this layer failed
    #[error(transparent)]
    Frame(#[from] frame::Error),

    /// The value model rejected the body bytes
    #[error("failed to decode SASL frame: {0}")]
    Decode(#[from] serde_amqp::Error),

    /// A SASL frame body was empty (§4.2: "irrecoverable error")
    #[error("empty SASL frame body")]
    EmptyFrame,

    /// The frame body carried bytes after the described value was fully
    /// decoded (§4.2: "irrecoverable error")
    #[error("trailing bytes after SASL frame value")]
    TrailingBytes,

    /// The frame exceeded MIN-MAX-FRAME-SIZE (512 octets)
    #[error("SASL frame body of {0} bytes exceeds the 512-octet SASL frame limit")]
    TooLarge(u32),
}

/// Error produced by the SASL I/O layer's state machines (§4.4)
#[derive(Debug, thiserror::Error)]
pub enum NegotiationError {
    /// Underlying transport failed
    #[error("IO error {0:?}")]
    Io(#[from] std::io::Error),

    /// The SASL frame codec failed
    #[error(transparent)]
    Frame(#[from] FrameError),

    /// A received protocol header byte mismatched the expected SASL
    /// header at its position
    #[error("protocol header mismatch, received {0:?}")]
    ProtocolHeaderMismatch([u8; 8]),

    /// A SASL frame arrived out of the sequence the negotiation state
    /// machine expects (§4.4.b)
    #[error("unexpected SASL frame for current negotiation state")]
    UnexpectedFrame,

    /// The active mechanism could not answer a SASL-CHALLENGE
    #[error("mechanism {0:?} cannot answer a SASL challenge")]
    ChallengeUnanswerable(fe2o3_amqp_types::primitives::Symbol),

    /// Negotiation completed with a non-`ok` outcome code
    #[error("SASL negotiation failed with code {code:?}")]
    Rejected {
        /// SASL outcome code
        code: fe2o3_amqp_types::sasl::SaslCode,
        /// Optional additional data from the server
        additional_data: Option<fe2o3_amqp_types::primitives::Binary>,
    },

    /// An operation was attempted while the negotiation is in its
    /// terminal error state, or `send` was called before `OutcomeRcvd`
    #[error("illegal SASL I/O state for this operation")]
    IllegalState,
}

//! Errors produced by the AMQP frame codec

use crate::frame;

/// Error produced by the AMQP frame codec
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The frame codec beneath this layer failed
    #[error(transparent)]
    Frame(#[from] frame::Error),

    /// The body did not start with a recognized performative (including an
    /// unrecognized descriptor outside the closed set 0x10..=0x18), or the
    /// value model otherwise rejected the bytes
    #[error("failed to decode AMQP performative: {0}")]
    Decode(#[from] serde_amqp::Error),

    /// A new frame began before the previous frame's body was fully
    /// delivered to this codec
    #[error("a new AMQP frame began before the previous frame's body completed")]
    FrameOverlap,

    /// The `AmqpFrameObserver` reported a failure while processing a
    /// decoded performative or an empty frame
    #[error("AMQP frame observer error: {0}")]
    Observer(Box<dyn std::error::Error + Send + Sync>),
}

//! Errors produced by the frame codec

use std::io;

/// Error produced by the frame codec
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Underlying IO error while sending encoded bytes
    #[error("IO Error {0:?}")]
    Io(#[from] io::Error),

    /// A frame header declared a `size` smaller than the minimum of 8 octets
    #[error("frame size {0} is smaller than the minimum of 8 octets")]
    FrameSizeTooSmall(u32),

    /// A frame header declared a `size` larger than the configured `max_frame_size`
    #[error("frame size {size} exceeds max_frame_size {max}")]
    FrameSizeExceedsMax {
        /// Declared frame size
        size: u32,
        /// Configured maximum
        max: u32,
    },

    /// A frame header declared a `data_offset` smaller than 2
    #[error("data offset {0} is smaller than the minimum of 2")]
    DataOffsetTooSmall(u8),

    /// `set_max_frame_size` was called with a value below the protocol floor
    #[error("max_frame_size {0} is smaller than the minimum of 8")]
    MaxFrameSizeTooSmall(u32),

    /// `set_max_frame_size` was called while a frame already in flight announces a larger size
    #[error("cannot shrink max_frame_size below a size already announced by a frame in flight")]
    MaxFrameSizeBelowInFlight,

    /// `begin_encode_frame`/`encode_frame_bytes` was used out of order
    #[error("a frame is already being encoded; finish it before starting another")]
    EncodeInProgress,

    /// type-specific header exceeds the protocol's representable size
    #[error("type-specific header of {0} bytes exceeds the protocol maximum")]
    TypeSpecificTooLarge(usize),

    /// `encode_frame_bytes` was called with more bytes than declared by `begin_encode_frame`
    #[error("encode_frame_bytes length {given} exceeds remaining body bytes {remaining}")]
    EncodeBodyOverrun {
        /// Bytes the caller attempted to write
        given: usize,
        /// Bytes actually remaining for this frame
        remaining: usize,
    },

    /// No subscription exists for the given frame type
    #[error("unsubscribe called for frame type {0} with no active subscription")]
    NoSubscription(u8),

    /// A frame-type observer reported a failure while processing this
    /// frame's header or body bytes
    #[error("frame observer error: {0}")]
    Observer(Box<dyn std::error::Error + Send + Sync>),

    /// The decoder has already transitioned to a terminal error state
    #[error("frame codec decoder is in a terminal error state")]
    DecoderClosed,

    /// The encoder has already transitioned to a terminal error state
    #[error("frame codec encoder is in a terminal error state")]
    EncoderClosed,
}

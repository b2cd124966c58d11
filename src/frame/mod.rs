//! Frame codec (C2): frames/deframes a length-prefixed binary stream into
//! typed frames and dispatches bodies to per-frame-type subscribers.
//!
//! The decoder is a one-byte-at-a-time state machine rather than a
//! coroutine: [`FrameCodec::receive_bytes`] may be called with any
//! contiguous partitioning of the underlying byte stream and produces the
//! same sequence of [`FrameObserver`] callbacks regardless of how the
//! caller chunked it.

mod error;

pub use error::Error;

use std::collections::HashMap;

/// Type byte of an AMQP frame
pub const FRAME_TYPE_AMQP: u8 = 0x00;

/// Type byte of a SASL frame
pub const FRAME_TYPE_SASL: u8 = 0x01;

/// Minimum frame size any AMQP peer must accept (MIN-MAX-FRAME-SIZE)
pub const MIN_MAX_FRAME_SIZE: u32 = 512;

const HEADER_LEN: usize = 6;

/// Error type returned from [`FrameObserver`] callbacks.
pub type ObserverError = Box<dyn std::error::Error + Send + Sync>;

/// Receives the demultiplexed body of frames of one frame type.
///
/// Exactly one `FrameObserver` may be subscribed per frame type at a
/// time; a second `subscribe` for the same type replaces it.
pub trait FrameObserver {
    /// Invoked once per frame, after the type-specific header has been
    /// fully buffered and before any `on_body_bytes` call for that frame.
    /// A returned error puts the whole decoder into its terminal error
    /// state, same as a malformed header.
    fn on_frame_begin(
        &mut self,
        body_size: u32,
        type_specific: &[u8],
    ) -> Result<(), ObserverError>;

    /// Invoked with successive chunks of the frame body as they arrive.
    /// Never waits for the full body; may be called zero or more times
    /// per frame, and the final call is followed by another
    /// `on_frame_begin` rather than an explicit "end" event.
    fn on_body_bytes(&mut self, bytes: &[u8]) -> Result<(), ObserverError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecodeState {
    Header,
    TypeSpecific,
    Body,
    Error,
}

struct InFlightHeader {
    header: [u8; HEADER_LEN],
    filled: usize,
}

impl InFlightHeader {
    fn new() -> Self {
        Self {
            header: [0u8; HEADER_LEN],
            filled: 0,
        }
    }
}

struct InFlightFrame {
    size: u32,
    data_offset: u8,
    frame_type: u8,
    type_specific: Vec<u8>,
    ts_filled: usize,
    body_remaining: u32,
}

enum Decoding {
    Header(InFlightHeader),
    Frame(InFlightFrame),
}

/// Decodes a stream of frames and encodes frames for transmission.
///
/// A plain Rust value with trait-object subscribers rather than a
/// callback-registration API: `subscribe`/`unsubscribe` replace what would
/// otherwise be a context pointer threaded through free functions.
pub struct FrameCodec {
    max_frame_size: u32,
    subscriptions: HashMap<u8, Box<dyn FrameObserver>>,
    decode_state: DecodeState,
    decoding: Decoding,
    encode_in_progress: Option<u32>,
    encoder_closed: bool,
}

impl FrameCodec {
    /// Creates a new frame codec with the protocol-floor `max_frame_size`.
    pub fn new() -> Self {
        Self {
            max_frame_size: u32::MAX,
            subscriptions: HashMap::new(),
            decode_state: DecodeState::Header,
            decoding: Decoding::Header(InFlightHeader::new()),
            encode_in_progress: None,
            encoder_closed: false,
        }
    }

    /// Current effective `max_frame_size`.
    pub fn max_frame_size(&self) -> u32 {
        self.max_frame_size
    }

    /// Sets `max_frame_size`. Fails if `max < 8`, if a partially-decoded
    /// frame already announces a size larger than `max`, or if the decoder
    /// is in an error state.
    pub fn set_max_frame_size(&mut self, max: u32) -> Result<(), Error> {
        if self.decode_state == DecodeState::Error {
            return Err(Error::DecoderClosed);
        }
        if max < 8 {
            return Err(Error::MaxFrameSizeTooSmall(max));
        }
        if let Decoding::Frame(ref f) = self.decoding {
            if f.size > max {
                return Err(Error::MaxFrameSizeBelowInFlight);
            }
        }
        self.max_frame_size = max;
        Ok(())
    }

    /// Registers (or replaces) the observer for `frame_type`.
    pub fn subscribe(&mut self, frame_type: u8, observer: Box<dyn FrameObserver>) {
        self.subscriptions.insert(frame_type, observer);
    }

    /// Removes the observer for `frame_type`. Fails if none is registered.
    pub fn unsubscribe(&mut self, frame_type: u8) -> Result<(), Error> {
        self.subscriptions
            .remove(&frame_type)
            .map(|_| ())
            .ok_or(Error::NoSubscription(frame_type))
    }

    /// Feeds bytes to the decoder. May be called with any chunking of the
    /// underlying stream; produces the same observer callbacks either way.
    pub fn receive_bytes(&mut self, mut buf: &[u8]) -> Result<(), Error> {
        if self.decode_state == DecodeState::Error {
            return Err(Error::DecoderClosed);
        }
        while !buf.is_empty() {
            match self.step(&mut buf) {
                Ok(()) => {}
                Err(e) => {
                    self.decode_state = DecodeState::Error;
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    fn step(&mut self, buf: &mut &[u8]) -> Result<(), Error> {
        match &mut self.decoding {
            Decoding::Header(h) => {
                let need = HEADER_LEN - h.filled;
                let take = need.min(buf.len());
                h.header[h.filled..h.filled + take].copy_from_slice(&buf[..take]);
                h.filled += take;
                *buf = &buf[take..];
                if h.filled == HEADER_LEN {
                    let header = h.header;
                    let size = u32::from_be_bytes([header[0], header[1], header[2], header[3]]);
                    let data_offset = header[4];
                    let frame_type = header[5];

                    if size < 8 {
                        return Err(Error::FrameSizeTooSmall(size));
                    }
                    if size > self.max_frame_size {
                        return Err(Error::FrameSizeExceedsMax {
                            size,
                            max: self.max_frame_size,
                        });
                    }
                    if data_offset < 2 {
                        return Err(Error::DataOffsetTooSmall(data_offset));
                    }
                    if (size as u64) < (data_offset as u64) * 4 {
                        return Err(Error::FrameSizeTooSmall(size));
                    }

                    let ts_size = data_offset as usize * 4 - HEADER_LEN;
                    self.decoding = Decoding::Frame(InFlightFrame {
                        size,
                        data_offset,
                        frame_type,
                        type_specific: vec![0u8; ts_size],
                        ts_filled: 0,
                        body_remaining: size - data_offset as u32 * 4,
                    });
                    self.decode_state = DecodeState::TypeSpecific;
                }
                Ok(())
            }
            Decoding::Frame(f) => {
                if f.ts_filled < f.type_specific.len() {
                    let need = f.type_specific.len() - f.ts_filled;
                    let take = need.min(buf.len());
                    f.type_specific[f.ts_filled..f.ts_filled + take].copy_from_slice(&buf[..take]);
                    f.ts_filled += take;
                    *buf = &buf[take..];

                    if f.ts_filled == f.type_specific.len() {
                        self.decode_state = DecodeState::Body;
                        if let Some(observer) = self.subscriptions.get_mut(&f.frame_type) {
                            observer
                                .on_frame_begin(f.body_remaining, &f.type_specific)
                                .map_err(Error::Observer)?;
                        }
                        if f.body_remaining == 0 {
                            self.finish_frame();
                        }
                    }
                    return Ok(());
                }

                let take = (f.body_remaining as usize).min(buf.len());
                if take > 0 {
                    let chunk = &buf[..take];
                    if let Some(observer) = self.subscriptions.get_mut(&f.frame_type) {
                        observer.on_body_bytes(chunk).map_err(Error::Observer)?;
                    }
                    f.body_remaining -= take as u32;
                    *buf = &buf[take..];
                }
                if f.body_remaining == 0 {
                    self.finish_frame();
                }
                Ok(())
            }
        }
    }

    fn finish_frame(&mut self) {
        self.decoding = Decoding::Header(InFlightHeader::new());
        self.decode_state = DecodeState::Header;
    }

    /// Begins encoding a new frame: computes and returns the frame header
    /// bytes (including the type-specific region, zero-padded out to the
    /// data offset). The caller must follow with [`Self::encode_frame_bytes`]
    /// calls totalling exactly `body_size` before starting another frame.
    pub fn begin_encode_frame(
        &mut self,
        frame_type: u8,
        body_size: u32,
        type_specific: &[u8],
    ) -> Result<Vec<u8>, Error> {
        if self.encoder_closed {
            return Err(Error::EncoderClosed);
        }
        if self.encode_in_progress.is_some() {
            return Err(Error::EncodeInProgress);
        }
        let ts_len = type_specific.len();
        if ts_len > 255 * 4 - HEADER_LEN {
            return Err(Error::TypeSpecificTooLarge(ts_len));
        }

        let data_offset = ((ts_len + HEADER_LEN) as f64 / 4.0).ceil() as u8;
        let header_len = data_offset as u32 * 4;
        let total_size = header_len + body_size;
        if total_size > self.max_frame_size {
            return Err(Error::FrameSizeExceedsMax {
                size: total_size,
                max: self.max_frame_size,
            });
        }

        let mut out = Vec::with_capacity(header_len as usize);
        out.extend_from_slice(&total_size.to_be_bytes());
        out.push(data_offset);
        out.push(frame_type);
        out.extend_from_slice(type_specific);
        out.resize(header_len as usize, 0);

        self.encode_in_progress = Some(body_size);
        Ok(out)
    }

    /// Supplies the next chunk of body bytes for the frame started by
    /// [`Self::begin_encode_frame`]. Fails if `bytes.len()` would exceed
    /// the declared `body_size`.
    pub fn encode_frame_bytes(&mut self, bytes: &[u8]) -> Result<(), Error> {
        if self.encoder_closed {
            return Err(Error::EncoderClosed);
        }
        let remaining = self
            .encode_in_progress
            .ok_or(Error::EncodeInProgress)?;
        if bytes.len() as u64 > remaining as u64 {
            return Err(Error::EncodeBodyOverrun {
                given: bytes.len(),
                remaining: remaining as usize,
            });
        }
        let left = remaining - bytes.len() as u32;
        if left == 0 {
            self.encode_in_progress = None;
        } else {
            self.encode_in_progress = Some(left);
        }
        Ok(())
    }

    /// Marks the encoder as terminally failed after an I/O error, per §4.7.
    pub fn mark_encoder_error(&mut self) {
        self.encoder_closed = true;
        self.encode_in_progress = None;
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for FrameCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameCodec")
            .field("max_frame_size", &self.max_frame_size)
            .field("decode_state", &self.decode_state)
            .field("encode_in_progress", &self.encode_in_progress)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[derive(Default, Clone)]
    struct Recorder(Rc<RefCell<Vec<(u32, Vec<u8>, Vec<u8>)>>>);

    struct RecordingObserver {
        recorder: Recorder,
        body_size: u32,
        type_specific: Vec<u8>,
        body: Vec<u8>,
    }

    impl FrameObserver for RecordingObserver {
        fn on_frame_begin(
            &mut self,
            body_size: u32,
            type_specific: &[u8],
        ) -> Result<(), ObserverError> {
            self.body_size = body_size;
            self.type_specific = type_specific.to_vec();
            self.body.clear();
            if body_size == 0 {
                self.recorder
                    .0
                    .borrow_mut()
                    .push((0, self.type_specific.clone(), Vec::new()));
            }
            Ok(())
        }

        fn on_body_bytes(&mut self, bytes: &[u8]) -> Result<(), ObserverError> {
            self.body.extend_from_slice(bytes);
            if self.body.len() as u32 == self.body_size {
                self.recorder.0.borrow_mut().push((
                    self.body_size,
                    self.type_specific.clone(),
                    self.body.clone(),
                ));
            }
            Ok(())
        }
    }

    fn frame_bytes(frame_type: u8, type_specific: &[u8], body: &[u8]) -> Vec<u8> {
        let mut codec = FrameCodec::new();
        let header = codec
            .begin_encode_frame(frame_type, body.len() as u32, type_specific)
            .unwrap();
        codec.encode_frame_bytes(body).unwrap();
        let mut out = header;
        out.extend_from_slice(body);
        out
    }

    #[test]
    fn round_trips_a_single_frame_regardless_of_chunking() {
        let wire = frame_bytes(FRAME_TYPE_AMQP, &[0x00, 0x07], b"payload-bytes");

        for chunk_size in [1usize, 2, 3, 5, wire.len()] {
            let recorder = Recorder::default();
            let mut codec = FrameCodec::new();
            codec.subscribe(
                FRAME_TYPE_AMQP,
                Box::new(RecordingObserver {
                    recorder: recorder.clone(),
                    body_size: 0,
                    type_specific: Vec::new(),
                    body: Vec::new(),
                }),
            );

            for chunk in wire.chunks(chunk_size) {
                codec.receive_bytes(chunk).unwrap();
            }

            let got = recorder.0.borrow();
            assert_eq!(got.len(), 1);
            assert_eq!(got[0].0, b"payload-bytes".len() as u32);
            assert_eq!(got[0].1, vec![0x00, 0x07]);
            assert_eq!(got[0].2, b"payload-bytes");
        }
    }

    #[test]
    fn rejects_frame_smaller_than_minimum_size() {
        let mut codec = FrameCodec::new();
        let bytes = [0x00, 0x00, 0x00, 0x04, 0x02, 0x00];
        assert!(matches!(
            codec.receive_bytes(&bytes),
            Err(Error::FrameSizeTooSmall(4))
        ));
        assert!(codec.receive_bytes(&[0x00]).is_err());
    }

    #[test]
    fn rejects_data_offset_below_two() {
        let mut codec = FrameCodec::new();
        let bytes = [0x00, 0x00, 0x00, 0x08, 0x01, 0x00];
        assert!(matches!(
            codec.receive_bytes(&bytes),
            Err(Error::DataOffsetTooSmall(1))
        ));
    }

    #[test]
    fn set_max_frame_size_rejects_values_below_protocol_floor() {
        let mut codec = FrameCodec::new();
        codec.set_max_frame_size(1024).unwrap();
        assert!(codec.set_max_frame_size(4).is_err());
        assert_eq!(codec.max_frame_size(), 1024);
    }

    #[test]
    fn encode_frame_bytes_rejects_overrun() {
        let mut codec = FrameCodec::new();
        codec.begin_encode_frame(FRAME_TYPE_AMQP, 4, &[0, 0]).unwrap();
        assert!(codec.encode_frame_bytes(&[0u8; 5]).is_err());
        codec.encode_frame_bytes(&[0u8; 4]).unwrap();
    }

    #[test]
    fn begin_encode_frame_rejects_overlap() {
        let mut codec = FrameCodec::new();
        codec.begin_encode_frame(FRAME_TYPE_AMQP, 4, &[0, 0]).unwrap();
        assert!(codec.begin_encode_frame(FRAME_TYPE_AMQP, 4, &[0, 0]).is_err());
    }
}

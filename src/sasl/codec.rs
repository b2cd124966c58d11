//! SASL frame codec (C3): decodes/encodes SASL performatives as described
//! AMQP values, layered on top of the frame codec's type-1 frames.

use bytes::{Buf, BufMut, BytesMut};
use serde::{de::Deserialize, ser::Serialize};
use serde_amqp::{de::Deserializer, read::IoReader, ser::Serializer};

use crate::frame::{FrameCodec, FrameObserver, ObserverError, FRAME_TYPE_SASL, MIN_MAX_FRAME_SIZE};

use super::error::FrameError;
use super::frame::Frame;

/// Receives fully-decoded SASL frames.
pub trait SaslFrameObserver {
    /// Invoked once per SASL frame with the decoded value.
    fn on_sasl_frame(&mut self, frame: Frame) -> Result<(), ObserverError>;
}

struct Accumulator {
    body_size: u32,
    received: u32,
    buf: BytesMut,
}

/// Decodes/encodes SASL (type 1) frames on top of a [`FrameCodec`].
///
/// Mirrors [`crate::amqp::AmqpFrameCodec`]'s buffer-then-decode strategy,
/// plus the extra rules §4.2 imposes that do not apply to AMQP frames:
/// an empty body is an irrecoverable error, trailing bytes after the
/// decoded value are an irrecoverable error, and the frame may never
/// exceed [`MIN_MAX_FRAME_SIZE`].
pub struct SaslFrameCodec {
    in_flight: Option<Accumulator>,
    observer: Box<dyn SaslFrameObserver>,
}

impl SaslFrameCodec {
    /// Creates a codec that dispatches decoded frames to `observer`.
    pub fn new(observer: Box<dyn SaslFrameObserver>) -> Self {
        Self {
            in_flight: None,
            observer,
        }
    }

    fn decode_and_dispatch(&mut self, mut buf: BytesMut) -> Result<(), FrameError> {
        if buf.is_empty() {
            return Err(FrameError::EmptyFrame);
        }
        let reader = IoReader::new((&mut buf).reader());
        let mut deserializer = Deserializer::new(reader);
        let frame: Frame = Deserialize::deserialize(&mut deserializer)?;
        if !buf.is_empty() {
            return Err(FrameError::TrailingBytes);
        }
        self.observer
            .on_sasl_frame(frame)
            .map_err(|e| FrameError::Decode(serde_amqp::Error::Message(e.to_string())))?;
        Ok(())
    }

    /// Encodes a SASL frame, returning the bytes to send. Asserts the
    /// encoded body stays within `512 - 8` bytes per §4.2.
    pub fn encode_frame(frame_codec: &mut FrameCodec, frame: &Frame) -> Result<Vec<u8>, FrameError> {
        let mut body = BytesMut::new();
        {
            let mut serializer = Serializer::from((&mut body).writer());
            frame.serialize(&mut serializer)?;
        }
        if body.len() as u32 > MIN_MAX_FRAME_SIZE - 8 {
            return Err(FrameError::TooLarge(body.len() as u32));
        }

        let mut out = frame_codec.begin_encode_frame(FRAME_TYPE_SASL, body.len() as u32, &[0, 0])?;
        frame_codec.encode_frame_bytes(&body)?;
        out.put(body);
        Ok(out)
    }
}

impl FrameObserver for SaslFrameCodec {
    fn on_frame_begin(
        &mut self,
        body_size: u32,
        _type_specific: &[u8],
    ) -> Result<(), ObserverError> {
        if body_size > MIN_MAX_FRAME_SIZE - 8 {
            return Err(Box::new(FrameError::TooLarge(body_size)));
        }
        self.in_flight = Some(Accumulator {
            body_size,
            received: 0,
            buf: BytesMut::with_capacity(body_size as usize),
        });
        if body_size == 0 {
            return Err(Box::new(FrameError::EmptyFrame));
        }
        Ok(())
    }

    fn on_body_bytes(&mut self, bytes: &[u8]) -> Result<(), ObserverError> {
        if let Some(acc) = self.in_flight.as_mut() {
            acc.buf.extend_from_slice(bytes);
            acc.received += bytes.len() as u32;
            if acc.received == acc.body_size {
                let Accumulator { buf, .. } = self.in_flight.take().unwrap();
                return self
                    .decode_and_dispatch(buf)
                    .map_err(|e| Box::new(e) as ObserverError);
            }
        }
        Ok(())
    }
}

//! SASL I/O (C4): layers the SASL protocol-header handshake and client
//! mechanism negotiation on top of the byte I/O and the SASL frame codec,
//! then exposes the same [`IoHandler`]-shaped surface upward so that the
//! AMQP connection built on top is agnostic to whether SASL ran at all.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use fe2o3_amqp_types::sasl::{SaslCode, SaslInit, SaslResponse};

use crate::frame::{FrameCodec, FrameObserver, ObserverError, FRAME_TYPE_SASL};
use crate::io::{IoHandler, IoState};
use crate::transport::protocol_header::{ProtocolHeader, ProtocolId};

use super::codec::{SaslFrameCodec, SaslFrameObserver};
use super::error::NegotiationError;
use super::frame::Frame;
use super::mechanism::SaslMechanism;

/// Transport-level header-exchange state (§4.4.a).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderState {
    /// No header activity yet
    Idle,
    /// Local header sent, awaiting the peer's
    HeaderSent,
    /// Peer's header matched before the local I/O finished opening
    HeaderReceived,
    /// Both headers exchanged; SASL frames may flow
    HeaderExchanged,
    /// Terminal error
    Error,
}

/// Client negotiation state (§4.4.b).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    /// No SASL-MECHANISMS received yet
    NotStarted,
    /// SASL-MECHANISMS received
    MechRcvd,
    /// SASL-INIT sent
    InitSent,
    /// SASL-CHALLENGE received
    ChallengeRcvd,
    /// SASL-RESPONSE sent
    ResponseSent,
    /// SASL-OUTCOME received; negotiation complete
    OutcomeRcvd,
    /// Terminal error
    Error,
}

const SASL_HEADER: [u8; 8] = [b'A', b'M', b'Q', b'P', ProtocolId::Sasl as u8, 1, 0, 0];

struct FrameQueue(Rc<RefCell<VecDeque<Frame>>>);

impl SaslFrameObserver for FrameQueue {
    fn on_sasl_frame(&mut self, frame: Frame) -> Result<(), ObserverError> {
        self.0.borrow_mut().push_back(frame);
        Ok(())
    }
}

/// Drives the SASL handshake over an owned [`IoHandler`], exclusively (§3.6:
/// "the SASL I/O exclusively owns the underlying socket I/O").
#[derive(Debug)]
pub struct SaslIo {
    io: Box<dyn IoHandler>,
    mechanism: Box<dyn SaslMechanism>,
    hostname: Option<String>,
    frame_codec: FrameCodec,
    incoming: Rc<RefCell<VecDeque<Frame>>>,
    header_state: HeaderState,
    negotiation_state: NegotiationState,
    local_header_sent: bool,
    header_recv_buf: [u8; 8],
    header_recv_filled: usize,
    outcome_code: Option<SaslCode>,
}

impl SaslIo {
    /// Creates a new SASL I/O layer around `io`, negotiating with
    /// `mechanism`.
    pub fn new(io: Box<dyn IoHandler>, mechanism: Box<dyn SaslMechanism>, hostname: Option<String>) -> Self {
        let incoming = Rc::new(RefCell::new(VecDeque::new()));
        let mut frame_codec = FrameCodec::new();
        frame_codec.subscribe(
            FRAME_TYPE_SASL,
            Box::new(SaslFrameCodec::new(Box::new(FrameQueue(incoming.clone())))),
        );
        Self {
            io,
            mechanism,
            hostname,
            frame_codec,
            incoming,
            header_state: HeaderState::Idle,
            negotiation_state: NegotiationState::NotStarted,
            local_header_sent: false,
            header_recv_buf: [0u8; 8],
            header_recv_filled: 0,
            outcome_code: None,
        }
    }

    /// Current transport-level header state.
    pub fn header_state(&self) -> HeaderState {
        self.header_state
    }

    /// Current client-negotiation state.
    pub fn negotiation_state(&self) -> NegotiationState {
        self.negotiation_state
    }

    /// Whether the SASL handshake completed with a successful outcome;
    /// bytes from here on pass through to the layer above untouched.
    pub fn is_open(&self) -> bool {
        self.negotiation_state == NegotiationState::OutcomeRcvd
    }

    /// Drives `dowork`, sending the local header once the underlying I/O
    /// reports `Open` (§4.4.a row 1).
    pub fn dowork(&mut self) -> Result<(), NegotiationError> {
        self.io.dowork()?;
        if self.header_state == HeaderState::Idle && self.io.state() == IoState::Open {
            self.send_local_header()?;
            self.header_state = HeaderState::HeaderSent;
        }
        Ok(())
    }

    fn send_local_header(&mut self) -> Result<(), NegotiationError> {
        let bytes: [u8; 8] = ProtocolHeader::sasl().into();
        self.io.send(&bytes)?;
        self.local_header_sent = true;
        Ok(())
    }

    /// Feeds bytes received from the transport. Before `OutcomeRcvd` these
    /// are matched against the SASL protocol header and then the SASL
    /// frame codec; once `OutcomeRcvd`, `pass_through` returns any bytes
    /// that were not consumed by this layer so the caller can forward
    /// them verbatim to the AMQP connection (§4.4.b: "bypassing both
    /// header matching and the SASL frame codec").
    pub fn receive_bytes<'a>(&mut self, mut bytes: &'a [u8]) -> Result<&'a [u8], NegotiationError> {
        if self.header_state == HeaderState::Error || self.negotiation_state == NegotiationState::Error {
            return Err(NegotiationError::IllegalState);
        }
        if self.is_open() {
            return Ok(bytes);
        }

        if self.header_state != HeaderState::HeaderExchanged {
            bytes = self.consume_header_bytes(bytes)?;
            if self.header_state != HeaderState::HeaderExchanged {
                return Ok(&[]);
            }
        }

        if !bytes.is_empty() {
            if let Err(e) = self.frame_codec.receive_bytes(bytes) {
                self.negotiation_state = NegotiationState::Error;
                return Err(NegotiationError::Frame(e.into()));
            }
        }

        while let Some(frame) = self.incoming.borrow_mut().pop_front() {
            self.on_sasl_frame(frame)?;
        }

        Ok(&[])
    }

    fn consume_header_bytes<'a>(&mut self, bytes: &'a [u8]) -> Result<&'a [u8], NegotiationError> {
        let need = 8 - self.header_recv_filled;
        let take = need.min(bytes.len());
        for (i, &b) in bytes[..take].iter().enumerate() {
            let pos = self.header_recv_filled + i;
            if b != SASL_HEADER[pos] {
                self.header_state = HeaderState::Error;
                let mut received = [0u8; 8];
                received[..pos].copy_from_slice(&self.header_recv_buf[..pos]);
                received[pos] = b;
                return Err(NegotiationError::ProtocolHeaderMismatch(received));
            }
            self.header_recv_buf[pos] = b;
        }
        self.header_recv_filled += take;

        if self.header_recv_filled == 8 {
            match self.header_state {
                HeaderState::Idle => {
                    self.header_state = HeaderState::HeaderReceived;
                    self.send_local_header()?;
                    self.header_state = HeaderState::HeaderExchanged;
                }
                HeaderState::HeaderSent => {
                    self.header_state = HeaderState::HeaderExchanged;
                }
                _ => {}
            }
        }

        Ok(&bytes[take..])
    }

    fn on_sasl_frame(&mut self, frame: Frame) -> Result<(), NegotiationError> {
        match (&self.negotiation_state, frame) {
            (NegotiationState::NotStarted, Frame::Mechanisms(_mechanisms)) => {
                self.negotiation_state = NegotiationState::MechRcvd;
                if self.io.state() == IoState::Open {
                    self.send_init()?;
                }
                Ok(())
            }
            (NegotiationState::InitSent | NegotiationState::MechRcvd, Frame::Challenge(challenge)) => {
                self.negotiation_state = NegotiationState::ChallengeRcvd;
                match self.mechanism.respond(challenge.challenge.as_slice()) {
                    Some(response_bytes) => {
                        let response = Frame::Response(SaslResponse {
                            response: response_bytes.into(),
                        });
                        let wire = SaslFrameCodec::encode_frame(&mut self.frame_codec, &response)?;
                        self.io.send(&wire)?;
                        self.negotiation_state = NegotiationState::ResponseSent;
                        Ok(())
                    }
                    None => {
                        self.negotiation_state = NegotiationState::Error;
                        Err(NegotiationError::ChallengeUnanswerable(self.mechanism.name()))
                    }
                }
            }
            (_, Frame::Outcome(outcome)) if self.negotiation_state != NegotiationState::Error => {
                self.negotiation_state = NegotiationState::OutcomeRcvd;
                self.outcome_code = Some(outcome.code.clone());
                match outcome.code {
                    SaslCode::Ok => Ok(()),
                    code => Err(NegotiationError::Rejected {
                        code,
                        additional_data: outcome.additional_data,
                    }),
                }
            }
            _ => {
                self.negotiation_state = NegotiationState::Error;
                Err(NegotiationError::UnexpectedFrame)
            }
        }
    }

    fn send_init(&mut self) -> Result<(), NegotiationError> {
        let init = Frame::Init(SaslInit {
            mechanism: self.mechanism.name(),
            initial_response: self.mechanism.initial_response(),
            hostname: self.hostname.clone(),
        });
        let wire = SaslFrameCodec::encode_frame(&mut self.frame_codec, &init)?;
        self.io.send(&wire)?;
        self.negotiation_state = NegotiationState::InitSent;
        Ok(())
    }

    /// Sends bytes through the underlying transport. Fails unless
    /// negotiation has reached `OutcomeRcvd` (§4.4.b "send semantics").
    pub fn send(&mut self, buf: &[u8]) -> Result<(), NegotiationError> {
        if !self.is_open() {
            return Err(NegotiationError::IllegalState);
        }
        self.io.send(buf)?;
        Ok(())
    }

    /// Releases the underlying transport.
    pub fn close(&mut self) -> std::io::Result<()> {
        self.io.close()
    }
}

/// Exposes the same [`IoHandler`] surface the underlying transport does,
/// so a [`crate::connection::Connection`] can be built directly on top of
/// a negotiating [`SaslIo`] and stays agnostic to whether SASL ran at all
/// (§4.4: "exposes the same interface upward"). `filter_inbound` is where
/// that transparency happens: it runs every inbound slice through
/// [`SaslIo::receive_bytes`], so bytes only reach the connection above
/// once negotiation has reached `OutcomeRcvd`.
impl IoHandler for SaslIo {
    fn send(&mut self, buf: &[u8]) -> std::io::Result<()> {
        self.send(buf)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))
    }

    fn close(&mut self) -> std::io::Result<()> {
        self.close()
    }

    fn dowork(&mut self) -> std::io::Result<()> {
        self.dowork()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))
    }

    fn state(&self) -> IoState {
        if self.header_state == HeaderState::Error || self.negotiation_state == NegotiationState::Error {
            IoState::Error
        } else if self.is_open() {
            IoState::Open
        } else if self.io.state() == IoState::NotOpen {
            IoState::NotOpen
        } else {
            IoState::Opening
        }
    }

    fn filter_inbound<'a>(&mut self, bytes: &'a [u8]) -> std::io::Result<&'a [u8]> {
        self.receive_bytes(bytes)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))
    }
}

impl From<super::error::FrameError> for NegotiationError {
    fn from(e: super::error::FrameError) -> Self {
        NegotiationError::Frame(e)
    }
}

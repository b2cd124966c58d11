//! Connection (C6): the client-role AMQP connection state machine, layered
//! on top of the frame codec (C2) and the AMQP frame codec (C5). Drives the
//! protocol-header handshake, the OPEN/CLOSE exchange, and multiplexes
//! frames to endpoints bound to individual channels (§4.5).

mod error;

pub use error::Error;

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::rc::Rc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use fe2o3_amqp_types::definitions::{self, AmqpError, ChannelMax, MaxFrameSize};
use fe2o3_amqp_types::performatives::{Close, Open, Performative};

use crate::amqp::{AmqpFrameCodec, AmqpFrameObserver};
use crate::error::EngineError;
use crate::frame::{FrameCodec, ObserverError, FRAME_TYPE_AMQP, MIN_MAX_FRAME_SIZE};
use crate::io::{IoHandler, IoState};

const AMQP_HEADER: [u8; 8] = [b'A', b'M', b'Q', b'P', 0x00, 1, 0, 0];

/// Lifecycle state of a client-role connection (§4.5.a).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No header activity yet
    Start,
    /// Local header sent, awaiting the peer's
    HdrSent,
    /// Peer's header matched before the local I/O finished opening
    HdrRcvd,
    /// Both headers exchanged; OPEN has been built and sent
    HdrExch,
    /// Local OPEN sent, awaiting the peer's
    OpenSent,
    /// Both OPEN frames exchanged; the connection is usable
    Opened,
    /// A decode failure forced a CLOSE; consuming bytes until the peer's CLOSE arrives
    Discarding,
    /// Terminal: the I/O has been closed and no further progress will be made
    End,
}

/// An effect an [`EndpointHandler`] asks the owning connection to perform on
/// its behalf, rather than calling back into the connection directly.
///
/// Handlers are invoked while the connection itself is on the call stack
/// (inside [`Connection::receive_bytes`] or [`Connection::create_endpoint`]);
/// returning effects instead of taking `&mut Connection` avoids a handler
/// needing a live reference back into its own owner while that owner is
/// already executing one of the handler's own callbacks.
pub enum Effect {
    /// Encode and send `performative`/`payload` on the handler's own channel.
    SendFrame {
        /// Performative to send
        performative: Performative,
        /// Payload bytes to follow the performative
        payload: Bytes,
    },
}

/// Receives frames and state transitions for one connection-level endpoint
/// (§3.4, §4.5.b). Registered via [`Connection::create_endpoint`].
pub trait EndpointHandler {
    /// A frame addressed to this endpoint's incoming channel was decoded.
    fn on_frame(&mut self, performative: Performative, payload: Bytes) -> Vec<Effect>;

    /// The connection's own state changed. Fired once synchronously from
    /// within [`Connection::create_endpoint`] with `new == previous` so a
    /// freshly-created endpoint observes the connection's current state,
    /// and again on every later transition; handlers must treat both the
    /// same way and react idempotently (§4.6.a: "BEGIN→Mapped is idempotent
    /// on further connection-Opened callbacks").
    fn on_connection_state_changed(&mut self, new: ConnectionState, previous: ConnectionState) -> Vec<Effect>;
}

struct EndpointEntry {
    incoming_channel: Option<u16>,
    handler: Box<dyn EndpointHandler>,
}

struct IncomingFrame {
    channel: u16,
    performative: Performative,
    payload: Bytes,
}

/// Demultiplexes decoded AMQP frames into a queue `Connection` drains after
/// each `receive_bytes` call, mirroring the decoupling `sasl::io::SaslIo`
/// uses between the frame codec and its own state machine.
struct FrameQueue(Rc<RefCell<VecDeque<IncomingFrame>>>);

impl AmqpFrameObserver for FrameQueue {
    fn on_amqp_frame(&mut self, channel: u16, performative: Performative, payload: Bytes) -> Result<(), ObserverError> {
        self.0.borrow_mut().push_back(IncomingFrame {
            channel,
            performative,
            payload,
        });
        Ok(())
    }
}

/// Builds a [`Connection`] with a fluent, chainable setter API (§3.9).
#[derive(Debug)]
pub struct ConnectionBuilder {
    container_id: String,
    hostname: Option<String>,
    max_frame_size: u32,
    channel_max: u16,
    idle_time_out: Option<u32>,
}

impl ConnectionBuilder {
    /// Starts a builder for a connection identifying itself as `container_id`.
    pub fn new(container_id: impl Into<String>) -> Self {
        Self {
            container_id: container_id.into(),
            hostname: None,
            max_frame_size: u32::MAX,
            channel_max: u16::MAX,
            idle_time_out: None,
        }
    }

    /// Sets the hostname advertised in OPEN.
    pub fn with_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = Some(hostname.into());
        self
    }

    /// Sets the advertised `max_frame_size`. Rejected below the 512-octet
    /// floor, in which case the builder is handed back unchanged alongside
    /// the error so a caller can keep chaining other setters on it rather
    /// than losing everything configured so far.
    pub fn with_max_frame_size(mut self, max_frame_size: u32) -> Result<Self, (Self, Error)> {
        if max_frame_size < MIN_MAX_FRAME_SIZE {
            return Err((self, Error::MaxFrameSizeTooSmall(max_frame_size)));
        }
        self.max_frame_size = max_frame_size;
        Ok(self)
    }

    /// Sets the advertised `channel_max`.
    pub fn with_channel_max(mut self, channel_max: u16) -> Self {
        self.channel_max = channel_max;
        self
    }

    /// Sets the advertised `idle_time_out` in milliseconds.
    pub fn with_idle_time_out(mut self, idle_time_out: u32) -> Self {
        self.idle_time_out = Some(idle_time_out);
        self
    }

    /// Consumes the builder, taking ownership of `io`, and starts the
    /// connection in its `Start` state. The protocol header is sent on the
    /// first `dowork` call once `io` reports `Open`. Fails if `io` is
    /// already in its terminal `Error` state, since such a connection could
    /// never make progress.
    pub fn open(self, io: Box<dyn IoHandler>) -> Result<Connection, EngineError> {
        if io.state() == IoState::Error {
            return Err(EngineError::Io(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "IoHandler passed to ConnectionBuilder::open is already in its Error state",
            )));
        }
        let incoming = Rc::new(RefCell::new(VecDeque::new()));
        let mut frame_codec = FrameCodec::new();
        frame_codec.subscribe(
            FRAME_TYPE_AMQP,
            Box::new(AmqpFrameCodec::new(Box::new(FrameQueue(incoming.clone())))),
        );
        Ok(Connection {
            io,
            frame_codec,
            incoming,
            state: ConnectionState::Start,
            container_id: self.container_id,
            hostname: self.hostname,
            max_frame_size: self.max_frame_size,
            channel_max: self.channel_max,
            idle_time_out: self.idle_time_out,
            remote_max_frame_size: MIN_MAX_FRAME_SIZE,
            remote_idle_time_out: None,
            header_recv_buf: [0u8; 8],
            header_recv_filled: 0,
            endpoints: BTreeMap::new(),
            incoming_channel_map: BTreeMap::new(),
            free_channels: BTreeSet::new(),
            next_channel: 0,
            last_frame_instant: Instant::now(),
        })
    }
}

/// Client-role AMQP connection (§3.3, §4.5).
pub struct Connection {
    io: Box<dyn IoHandler>,
    frame_codec: FrameCodec,
    incoming: Rc<RefCell<VecDeque<IncomingFrame>>>,
    state: ConnectionState,
    container_id: String,
    hostname: Option<String>,
    max_frame_size: u32,
    channel_max: u16,
    idle_time_out: Option<u32>,
    remote_max_frame_size: u32,
    remote_idle_time_out: Option<u32>,
    header_recv_buf: [u8; 8],
    header_recv_filled: usize,
    endpoints: BTreeMap<u16, EndpointEntry>,
    incoming_channel_map: BTreeMap<u16, u16>,
    free_channels: BTreeSet<u16>,
    next_channel: u32,
    last_frame_instant: Instant,
}

impl Connection {
    /// Starts a builder for a new connection.
    pub fn builder(container_id: impl Into<String>) -> ConnectionBuilder {
        ConnectionBuilder::new(container_id)
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// The `max_frame_size` negotiated with the peer, or the protocol floor
    /// before OPEN has been exchanged.
    pub fn remote_max_frame_size(&self) -> u32 {
        self.remote_max_frame_size
    }

    /// Time elapsed since the last frame was sent or fully received;
    /// bookkeeping hook for an external idle-timeout timer (§4.5.e).
    pub fn elapsed_since_last_frame_reset(&self) -> Duration {
        self.last_frame_instant.elapsed()
    }

    /// Gives the connection's own I/O a chance to make progress, sending
    /// the protocol header once the I/O reports `Open`, and an empty AMQP
    /// frame once half the peer's advertised `idle_time_out` has elapsed
    /// since the last frame crossed the wire in either direction (§4.5.e,
    /// mirroring the "period = idle_time_out / 2" convention the broker
    /// itself relies on to detect a dead peer before the full interval
    /// lapses twice).
    pub fn dowork(&mut self) -> Result<(), Error> {
        self.io.dowork()?;
        if self.state == ConnectionState::Start && self.io.state() == IoState::Open {
            #[cfg(feature = "tracing")]
            tracing::trace!(sending = "AMQP header");
            #[cfg(feature = "log")]
            log::trace!("sending AMQP header");

            self.io.send(&AMQP_HEADER)?;
            self.last_frame_instant = Instant::now();
            self.set_state(ConnectionState::HdrSent);
        }

        if self.state == ConnectionState::Opened {
            if let Some(period) = self.heartbeat_period() {
                if self.last_frame_instant.elapsed() >= period {
                    #[cfg(feature = "tracing")]
                    tracing::trace!("sending empty frame as idle-timeout keepalive");
                    #[cfg(feature = "log")]
                    log::trace!("sending empty frame as idle-timeout keepalive");

                    let wire = AmqpFrameCodec::encode_empty_frame(&mut self.frame_codec, 0)?;
                    self.io.send(&wire)?;
                    self.last_frame_instant = Instant::now();
                }
            }
        }
        Ok(())
    }

    /// Half the peer's advertised `idle_time_out`, or `None` if the peer
    /// never advertised one (or advertised zero, meaning "no timeout").
    fn heartbeat_period(&self) -> Option<Duration> {
        match self.remote_idle_time_out {
            Some(0) | None => None,
            Some(ms) => Some(Duration::from_millis(ms as u64 / 2)),
        }
    }

    /// Allocates the lowest unused channel in `[0, channel_max]` for a new
    /// endpoint, registering `handler` to receive its frames and state
    /// transitions (§4.5.b).
    pub fn create_endpoint(&mut self, handler: Box<dyn EndpointHandler>) -> Result<u16, Error> {
        let channel = self.allocate_channel()?;
        self.endpoints.insert(
            channel,
            EndpointEntry {
                incoming_channel: None,
                handler,
            },
        );
        let state = self.state;
        let effects = self
            .endpoints
            .get_mut(&channel)
            .expect("just inserted")
            .handler
            .on_connection_state_changed(state, state);
        self.apply_effects(channel, effects)?;
        Ok(channel)
    }

    /// Releases `channel`, making it immediately reusable.
    pub fn destroy_endpoint(&mut self, channel: u16) {
        if let Some(entry) = self.endpoints.remove(&channel) {
            if let Some(incoming) = entry.incoming_channel {
                self.incoming_channel_map.remove(&incoming);
            }
            self.release_channel(channel);
        }
    }

    /// Encodes and sends a frame on `channel`'s behalf. Requires the
    /// connection to be `Opened` (§4.5.c).
    pub fn encode_frame(&mut self, channel: u16, performative: &Performative, payload: &[u8]) -> Result<(), Error> {
        if self.state != ConnectionState::Opened {
            return Err(Error::NotOpened);
        }
        if !self.endpoints.contains_key(&channel) {
            return Err(Error::UnknownChannel(channel));
        }
        let wire = AmqpFrameCodec::encode_frame(&mut self.frame_codec, channel, performative, payload)?;
        self.io.send(&wire)?;
        self.last_frame_instant = Instant::now();
        Ok(())
    }

    /// Feeds bytes received from the transport, driving the header
    /// handshake and then the frame codec, dispatching any decoded frames
    /// to their bound endpoint (§4.5.a).
    pub fn receive_bytes(&mut self, mut bytes: &[u8]) -> Result<(), Error> {
        if self.state == ConnectionState::End {
            return Err(Error::IllegalState);
        }

        bytes = self.io.filter_inbound(bytes)?;
        if bytes.is_empty() {
            return Ok(());
        }

        if self.state == ConnectionState::Start || self.state == ConnectionState::HdrSent || self.state == ConnectionState::HdrRcvd {
            bytes = self.consume_header_bytes(bytes)?;
            if bytes.is_empty() {
                return Ok(());
            }
        }

        match self.frame_codec.receive_bytes(bytes) {
            Ok(()) => {}
            Err(e) if self.state == ConnectionState::Discarding => {
                let _ = e;
                return Ok(());
            }
            Err(e) => {
                // The frame codec is now in its own terminal decode-error
                // state and will reject every future call, so a fresh one
                // is swapped in before entering `Discarding`: otherwise the
                // peer's own CLOSE (sent right after ours, per §4.5.a) could
                // never be decoded and the connection would never reach
                // `End`.
                self.close_with_error(AmqpError::InternalError, Some("frame decode failure".into()))?;
                self.reset_frame_codec();
                return Err(e.into());
            }
        }
        self.last_frame_instant = Instant::now();

        while let Some(frame) = self.incoming.borrow_mut().pop_front() {
            #[cfg(feature = "tracing")]
            tracing::trace!(received_channel = frame.channel);
            #[cfg(feature = "log")]
            log::trace!("received on channel {}", frame.channel);

            self.dispatch(frame)?;
        }
        Ok(())
    }

    fn consume_header_bytes<'a>(&mut self, bytes: &'a [u8]) -> Result<&'a [u8], Error> {
        let need = 8 - self.header_recv_filled;
        let take = need.min(bytes.len());
        for (i, &b) in bytes[..take].iter().enumerate() {
            let pos = self.header_recv_filled + i;
            if b != AMQP_HEADER[pos] {
                let mut received = [0u8; 8];
                received[..pos].copy_from_slice(&self.header_recv_buf[..pos]);
                received[pos] = b;
                let _ = self.io.close();
                self.set_state(ConnectionState::End);
                return Err(Error::ProtocolHeaderMismatch(received));
            }
            self.header_recv_buf[pos] = b;
        }
        self.header_recv_filled += take;

        if self.header_recv_filled == 8 {
            match self.state {
                ConnectionState::Start => {
                    self.set_state(ConnectionState::HdrRcvd);
                    self.io.send(&AMQP_HEADER)?;
                    self.last_frame_instant = Instant::now();
                    self.enter_hdr_exch()?;
                }
                ConnectionState::HdrSent => {
                    self.enter_hdr_exch()?;
                }
                _ => {}
            }
        }

        Ok(&bytes[take..])
    }

    fn enter_hdr_exch(&mut self) -> Result<(), Error> {
        self.set_state(ConnectionState::HdrExch);
        let open = Open {
            container_id: self.container_id.clone(),
            hostname: self.hostname.clone(),
            max_frame_size: MaxFrameSize::from(self.max_frame_size),
            channel_max: ChannelMax::from(self.channel_max),
            idle_time_out: self.idle_time_out,
            outgoing_locales: None,
            incoming_locales: None,
            offered_capabilities: None,
            desired_capabilities: None,
            properties: None,
        };
        self.frame_codec.set_max_frame_size(self.max_frame_size)?;
        let wire = AmqpFrameCodec::encode_frame(&mut self.frame_codec, 0, &Performative::Open(open), &[])?;
        self.io.send(&wire)?;
        self.last_frame_instant = Instant::now();
        self.set_state(ConnectionState::OpenSent);
        Ok(())
    }

    fn dispatch(&mut self, frame: IncomingFrame) -> Result<(), Error> {
        let IncomingFrame {
            channel,
            performative,
            payload,
        } = frame;

        if self.state == ConnectionState::Discarding {
            return match performative {
                Performative::Close(close) => self.on_close(close),
                _ => Ok(()),
            };
        }

        match performative {
            Performative::Open(open) => self.on_open(channel, open),
            Performative::Close(close) => self.on_close(close),
            other => {
                if self.state != ConnectionState::Opened {
                    let _ = self.io.close();
                    self.set_state(ConnectionState::End);
                    return Err(Error::IllegalState);
                }

                let endpoint_channel = self
                    .incoming_channel_map
                    .get(&channel)
                    .copied()
                    .or_else(|| self.bind_if_begin(channel, &other));

                let Some(endpoint_channel) = endpoint_channel else {
                    return self.close_with_error(AmqpError::NotAllowed, Some("frame on unattached channel".into()));
                };

                let Some(entry) = self.endpoints.get_mut(&endpoint_channel) else {
                    return Ok(());
                };
                let effects = entry.handler.on_frame(other, payload);
                self.apply_effects(endpoint_channel, effects)
            }
        }
    }

    fn bind_if_begin(&mut self, wire_channel: u16, performative: &Performative) -> Option<u16> {
        let Performative::Begin(begin) = performative else {
            return None;
        };
        let remote_channel = begin.remote_channel?;
        let entry = self.endpoints.get_mut(&remote_channel)?;
        if entry.incoming_channel.is_some() {
            return None;
        }
        entry.incoming_channel = Some(wire_channel);
        self.incoming_channel_map.insert(wire_channel, remote_channel);
        Some(remote_channel)
    }

    fn on_open(&mut self, channel: u16, open: Open) -> Result<(), Error> {
        if self.state == ConnectionState::Opened {
            return self.close_with_error(AmqpError::IllegalState, Some("OPEN received while Opened".into()));
        }
        if channel != 0 {
            return self.close_with_error(AmqpError::NotAllowed, Some("OPEN received on non-zero channel".into()));
        }
        let remote_max_frame_size: u32 = open.max_frame_size.into();
        if remote_max_frame_size < MIN_MAX_FRAME_SIZE {
            return self.close_with_error(AmqpError::InvalidField, Some("max_frame_size below protocol floor".into()));
        }
        self.remote_max_frame_size = remote_max_frame_size;
        self.remote_idle_time_out = open.idle_time_out;
        self.set_state(ConnectionState::Opened);
        Ok(())
    }

    fn on_close(&mut self, close: Close) -> Result<(), Error> {
        if self.state == ConnectionState::Opened {
            let reply = Close::new(None);
            let wire = AmqpFrameCodec::encode_frame(&mut self.frame_codec, 0, &Performative::Close(reply), &[])?;
            self.io.send(&wire)?;
        }
        let _ = self.io.close();
        self.set_state(ConnectionState::End);
        if let Some(error) = close.error {
            return Err(Error::RemoteClosed(Some(error)));
        }
        Ok(())
    }

    /// Sends a best-effort CLOSE carrying `condition`, then transitions to
    /// `Discarding` to await the peer's own CLOSE (§4.5.a, §7). Failures
    /// sending the CLOSE itself still propagate, since at that point the
    /// transport is assumed unusable.
    fn close_with_error(&mut self, condition: AmqpError, description: Option<String>) -> Result<(), Error> {
        let error = definitions::Error::new(condition, description, None);
        let close = Close::new(Some(error));
        let wire = AmqpFrameCodec::encode_frame(&mut self.frame_codec, 0, &Performative::Close(close), &[])?;
        self.io.send(&wire)?;
        self.last_frame_instant = Instant::now();
        self.set_state(ConnectionState::Discarding);
        Ok(())
    }

    fn set_state(&mut self, new: ConnectionState) {
        let previous = self.state;
        if previous == new {
            return;
        }

        #[cfg(feature = "tracing")]
        tracing::debug!(?previous, ?new, "connection state transition");
        #[cfg(feature = "log")]
        log::debug!("connection state transition {:?} -> {:?}", previous, new);

        self.state = new;
        let channels: Vec<u16> = self.endpoints.keys().copied().collect();
        for channel in channels {
            let Some(entry) = self.endpoints.get_mut(&channel) else {
                continue;
            };
            let effects = entry.handler.on_connection_state_changed(new, previous);
            let _ = self.apply_effects(channel, effects);
        }
    }

    fn apply_effects(&mut self, channel: u16, effects: Vec<Effect>) -> Result<(), Error> {
        for effect in effects {
            match effect {
                Effect::SendFrame { performative, payload } => {
                    self.encode_frame(channel, &performative, &payload)?;
                }
            }
        }
        Ok(())
    }

    /// Swaps in a fresh frame codec after the old one entered its terminal
    /// decode-error state, so bytes received while `Discarding` can still
    /// be parsed for the peer's own CLOSE.
    fn reset_frame_codec(&mut self) {
        let mut frame_codec = FrameCodec::new();
        let _ = frame_codec.set_max_frame_size(self.max_frame_size);
        frame_codec.subscribe(
            FRAME_TYPE_AMQP,
            Box::new(AmqpFrameCodec::new(Box::new(FrameQueue(self.incoming.clone())))),
        );
        self.frame_codec = frame_codec;
    }

    fn allocate_channel(&mut self) -> Result<u16, Error> {
        if let Some(&channel) = self.free_channels.iter().next() {
            self.free_channels.remove(&channel);
            return Ok(channel);
        }
        if self.next_channel > self.channel_max as u32 {
            return Err(Error::ChannelsExhausted);
        }
        let channel = self.next_channel as u16;
        self.next_channel += 1;
        Ok(channel)
    }

    fn release_channel(&mut self, channel: u16) {
        self.free_channels.insert(channel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell as StdRefCell;
    use std::rc::Rc as StdRc;

    #[derive(Debug, Default)]
    struct MockIo {
        sent: StdRc<StdRefCell<Vec<u8>>>,
        state: IoState,
    }

    impl IoHandler for MockIo {
        fn send(&mut self, buf: &[u8]) -> std::io::Result<()> {
            self.sent.borrow_mut().extend_from_slice(buf);
            Ok(())
        }
        fn close(&mut self) -> std::io::Result<()> {
            Ok(())
        }
        fn dowork(&mut self) -> std::io::Result<()> {
            Ok(())
        }
        fn state(&self) -> IoState {
            self.state
        }
    }

    struct NullEndpoint;

    impl EndpointHandler for NullEndpoint {
        fn on_frame(&mut self, _performative: Performative, _payload: Bytes) -> Vec<Effect> {
            Vec::new()
        }
        fn on_connection_state_changed(&mut self, _new: ConnectionState, _previous: ConnectionState) -> Vec<Effect> {
            Vec::new()
        }
    }

    fn open_wire(container_id: &str, hostname: &str) -> (Connection, StdRc<StdRefCell<Vec<u8>>>) {
        let sent = StdRc::new(StdRefCell::new(Vec::new()));
        let io = MockIo {
            sent: sent.clone(),
            state: IoState::Open,
        };
        let connection = Connection::builder(container_id)
            .with_hostname(hostname)
            .open(Box::new(io))
            .unwrap();
        (connection, sent)
    }

    #[test]
    fn clean_handshake_emits_header_then_open() {
        let (mut connection, sent) = open_wire("1234", "testhost");
        connection.dowork().unwrap();
        assert_eq!(&sent.borrow()[..8], &AMQP_HEADER[..]);

        connection.receive_bytes(&AMQP_HEADER).unwrap();
        assert_eq!(connection.state(), ConnectionState::OpenSent);
        assert!(sent.borrow().len() > 8);

        let remote_open = Open {
            container_id: "broker".into(),
            hostname: None,
            max_frame_size: MaxFrameSize::from(4096u32),
            channel_max: ChannelMax::from(65535u16),
            idle_time_out: None,
            outgoing_locales: None,
            incoming_locales: None,
            offered_capabilities: None,
            desired_capabilities: None,
            properties: None,
        };
        let mut side_codec = FrameCodec::new();
        let wire = AmqpFrameCodec::encode_frame(&mut side_codec, 0, &Performative::Open(remote_open), &[]).unwrap();
        connection.receive_bytes(&wire).unwrap();
        assert_eq!(connection.state(), ConnectionState::Opened);
        assert_eq!(connection.remote_max_frame_size(), 4096);
    }

    #[test]
    fn open_rejects_an_io_already_in_error_state() {
        let io = MockIo {
            sent: StdRc::new(StdRefCell::new(Vec::new())),
            state: IoState::Error,
        };
        let err = Connection::builder("1234").open(Box::new(io)).unwrap_err();
        assert!(matches!(err, EngineError::Io(_)));
    }

    #[test]
    fn wrong_minor_version_ends_connection() {
        let (mut connection, _sent) = open_wire("1234", "testhost");
        connection.dowork().unwrap();
        let bogus = [b'A', b'M', b'Q', b'P', 0x00, 1, 0, 1];
        let err = connection.receive_bytes(&bogus).unwrap_err();
        assert!(matches!(err, Error::ProtocolHeaderMismatch(_)));
        assert_eq!(connection.state(), ConnectionState::End);
    }

    #[test]
    fn open_on_wrong_channel_is_closed_not_allowed() {
        let (mut connection, sent) = open_wire("1234", "testhost");
        connection.dowork().unwrap();
        connection.receive_bytes(&AMQP_HEADER).unwrap();
        sent.borrow_mut().clear();

        let open = Open {
            container_id: "broker".into(),
            hostname: None,
            max_frame_size: MaxFrameSize::default(),
            channel_max: ChannelMax::default(),
            idle_time_out: None,
            outgoing_locales: None,
            incoming_locales: None,
            offered_capabilities: None,
            desired_capabilities: None,
            properties: None,
        };
        let mut side_codec = FrameCodec::new();
        let wire = AmqpFrameCodec::encode_frame(&mut side_codec, 1, &Performative::Open(open), &[]).unwrap();
        connection.receive_bytes(&wire).unwrap();
        assert_eq!(connection.state(), ConnectionState::Discarding);
        assert!(!sent.borrow().is_empty());
    }

    #[test]
    fn dowork_emits_empty_frame_after_half_the_remote_idle_time_out() {
        let (mut connection, sent) = open_wire("1234", "testhost");
        connection.dowork().unwrap();
        connection.receive_bytes(&AMQP_HEADER).unwrap();

        let remote_open = Open {
            container_id: "broker".into(),
            hostname: None,
            max_frame_size: MaxFrameSize::from(4096u32),
            channel_max: ChannelMax::from(65535u16),
            idle_time_out: Some(100),
            outgoing_locales: None,
            incoming_locales: None,
            offered_capabilities: None,
            desired_capabilities: None,
            properties: None,
        };
        let mut side_codec = FrameCodec::new();
        let wire = AmqpFrameCodec::encode_frame(&mut side_codec, 0, &Performative::Open(remote_open), &[]).unwrap();
        connection.receive_bytes(&wire).unwrap();
        assert_eq!(connection.state(), ConnectionState::Opened);

        sent.borrow_mut().clear();
        connection.dowork().unwrap();
        assert!(sent.borrow().is_empty(), "no keepalive before half the idle timeout elapses");

        connection.last_frame_instant = Instant::now() - Duration::from_millis(51);
        connection.dowork().unwrap();
        assert!(!sent.borrow().is_empty(), "keepalive expected once half the idle timeout elapses");

        let frame_type_specific_body_size =
            u32::from_be_bytes(sent.borrow()[0..4].try_into().unwrap());
        assert_eq!(frame_type_specific_body_size, 8, "an empty frame is exactly the 8-byte header");
    }

    #[test]
    fn dowork_never_sends_keepalive_without_an_advertised_idle_time_out() {
        let (mut connection, sent) = open_wire("1234", "testhost");
        connection.dowork().unwrap();
        connection.receive_bytes(&AMQP_HEADER).unwrap();

        let remote_open = Open {
            container_id: "broker".into(),
            hostname: None,
            max_frame_size: MaxFrameSize::from(4096u32),
            channel_max: ChannelMax::from(65535u16),
            idle_time_out: None,
            outgoing_locales: None,
            incoming_locales: None,
            offered_capabilities: None,
            desired_capabilities: None,
            properties: None,
        };
        let mut side_codec = FrameCodec::new();
        let wire = AmqpFrameCodec::encode_frame(&mut side_codec, 0, &Performative::Open(remote_open), &[]).unwrap();
        connection.receive_bytes(&wire).unwrap();

        sent.borrow_mut().clear();
        connection.last_frame_instant = Instant::now() - Duration::from_secs(3600);
        connection.dowork().unwrap();
        assert!(sent.borrow().is_empty());
    }

    #[test]
    fn rejected_max_frame_size_preserves_prior_settings() {
        let builder = Connection::builder("1234")
            .with_hostname("testhost")
            .with_max_frame_size(4096)
            .unwrap();

        let (builder, err) = builder.with_max_frame_size(4).unwrap_err();
        assert!(matches!(err, Error::MaxFrameSizeTooSmall(4)));
        assert_eq!(builder.max_frame_size, 4096, "the earlier accepted value must survive a rejected update");
        assert_eq!(builder.hostname.as_deref(), Some("testhost"), "unrelated settings must also survive");

        let io = MockIo {
            sent: StdRc::new(StdRefCell::new(Vec::new())),
            state: IoState::Open,
        };
        let connection = builder.open(Box::new(io)).unwrap();
        assert_eq!(connection.max_frame_size, 4096);
    }

    #[test]
    fn channel_allocation_reuses_lowest_freed_number() {
        let (mut connection, _sent) = open_wire("1234", "testhost");
        let a = connection.create_endpoint(Box::new(NullEndpoint)).unwrap();
        let b = connection.create_endpoint(Box::new(NullEndpoint)).unwrap();
        assert_eq!((a, b), (0, 1));
        connection.destroy_endpoint(a);
        let c = connection.create_endpoint(Box::new(NullEndpoint)).unwrap();
        assert_eq!(c, 0);
    }
}

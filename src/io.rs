//! I/O collaborator interface, consumed, not implemented, by this crate.
//! The byte-oriented transport (TCP socket, TLS session, platform mainloop
//! integration) lives entirely outside this engine; all the core asks of
//! it is this trait.
//!
//! Expressed as a trait object rather than a raw C function-pointer
//! callback triple: the engine owns a `Box<dyn IoHandler>` for its full
//! lifetime.

/// Lifecycle state of the underlying transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IoState {
    /// Not yet opened
    #[default]
    NotOpen,
    /// Open in progress (e.g. TCP connect, TLS handshake)
    Opening,
    /// Ready to send/receive
    Open,
    /// Terminally failed
    Error,
}

/// Capabilities the engine consumes from its underlying byte transport.
///
/// There is no `on_bytes`/`on_state` callback registration here, because
/// the engine does not own a thread or reactor to invoke them from: the
/// driver that owns both the transport and the engine is responsible for
/// calling [`Connection::receive_bytes`](crate::connection::Connection::receive_bytes)
/// whenever new bytes arrive, and for polling [`IoHandler::state`] around
/// calls to [`IoHandler::dowork`]. This keeps the engine itself free of
/// any async runtime or callback-registration machinery: no operation
/// blocks and nothing yields implicitly.
///
/// `Connection::receive_bytes` runs every inbound slice through
/// [`IoHandler::filter_inbound`] before touching it, so a handler that
/// itself speaks a pre-AMQP protocol (SASL) can transparently consume
/// its own bytes without `Connection` ever being aware of it.
pub trait IoHandler: std::fmt::Debug {
    /// Sends `buf` to the transport. Must not block.
    fn send(&mut self, buf: &[u8]) -> std::io::Result<()>;

    /// Closes the transport. Idempotent.
    fn close(&mut self) -> std::io::Result<()>;

    /// Gives the transport a chance to make progress (flush buffers,
    /// advance a handshake, poll a socket). Must not block.
    fn dowork(&mut self) -> std::io::Result<()>;

    /// Current lifecycle state.
    fn state(&self) -> IoState;

    /// Gives this handler a chance to consume inbound bytes before the
    /// layer built on top of it (ordinarily [`crate::connection::Connection`])
    /// sees them, returning whatever remains for that layer to interpret
    /// itself. A plain transport has nothing to intercept and keeps the
    /// default identity pass-through; [`crate::sasl::io::SaslIo`] overrides
    /// this to run its own header-match and negotiation state machines
    /// and only starts returning bytes once negotiation has reached
    /// `OutcomeRcvd`, so `Connection` never needs to know SASL ran at all.
    fn filter_inbound<'a>(&mut self, bytes: &'a [u8]) -> std::io::Result<&'a [u8]> {
        Ok(bytes)
    }
}

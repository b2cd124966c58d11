#![cfg_attr(docsrs, feature(doc_cfg))]
#![deny(missing_docs, missing_debug_implementations)]

//! A synchronous, transport-agnostic implementation of the AMQP 1.0
//! protocol engine: frame codecs, SASL negotiation, and the Connection and
//! Session state machines described in ISO/IEC 19464.
//!
//! This crate owns no socket, thread, or async runtime. It consumes bytes
//! handed to it by a caller-supplied [`io::IoHandler`] and produces bytes
//! (and, for the higher layers, [`connection::Effect`]s) for the caller to
//! write back out. Driving the engine is a matter of:
//!
//! 1. Constructing a [`connection::Connection`] with [`connection::ConnectionBuilder`].
//! 2. Feeding it inbound bytes via [`connection::Connection::receive_bytes`]
//!    as they arrive from the transport.
//! 3. Writing whatever [`connection::Effect::SendFrame`] it emits back out
//!    via the same transport.
//! 4. Calling [`connection::Connection::dowork`] periodically to advance
//!    idle-timeout bookkeeping.
//!
//! A [`session::Session`] is layered on top of an opened connection the
//! same way: [`session::Session::begin`] registers a
//! [`connection::EndpointHandler`] for a freshly allocated channel, and the
//! resulting handle is used to `transfer` messages and to attach link
//! endpoints.
//!
//! # Module map
//!
//! - [`io`] — C1, the transport trait the engine is driven through.
//! - [`frame`] — C2, the generic AMQP frame header/extended-header codec.
//! - [`amqp`] — C5, the AMQP (type 0) frame codec layered on [`frame`].
//! - [`sasl`] — C3/C4, the SASL (type 1) frame codec and negotiation state
//!   machine.
//! - [`connection`] — C6, the Connection state machine.
//! - [`session`] — C7, the Session state machine.
//! - [`error`] — the unified [`error::EngineError`] wrapping every layer's
//!   own error type.

pub mod amqp;
pub mod connection;
pub mod error;
pub mod frame;
pub mod io;
pub mod sasl;
pub mod session;
mod transport;

pub use connection::{Connection, ConnectionBuilder, ConnectionState};
pub use error::EngineError;
pub use session::{Session, SessionState};
pub use transport::protocol_header;

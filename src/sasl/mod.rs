//! SASL client negotiation (C3 + C4): the SASL frame codec and the SASL
//! I/O layer that drives the protocol-header handshake and client
//! mechanism negotiation state machines on top of it (§4.2, §4.4).

pub mod codec;
pub mod error;
pub mod frame;
pub mod io;
pub mod mechanism;

pub use codec::{SaslFrameCodec, SaslFrameObserver};
pub use error::{FrameError, NegotiationError};
pub use frame::Frame;
pub use io::{HeaderState, NegotiationState, SaslIo};
pub use mechanism::{Anonymous, Plain, SaslMechanism};

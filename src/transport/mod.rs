//! Byte-level protocol constants shared by the AMQP and SASL handshakes.
//!
//! The actual framing and negotiation state machines live in
//! [`crate::frame`], [`crate::amqp`], [`crate::sasl`], and
//! [`crate::connection`]; this module keeps only the protocol-header
//! representation those layers build on.

pub mod protocol_header;

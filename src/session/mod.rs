//! Session: maps a session onto a connection endpoint, assigns
//! delivery-ids to outgoing TRANSFER performatives, and multiplexes raw
//! link-level frames (ATTACH/FLOW/TRANSFER/DISPOSITION/DETACH) to
//! link-endpoints by relay rather than by handle-based routing, since the
//! link layer itself is out of scope here.

mod error;

pub use error::Error;

use std::cell::RefCell;
use std::rc::Rc;

use bytes::Bytes;
use fe2o3_amqp_types::definitions::Handle;
use fe2o3_amqp_types::performatives::{Begin, End, Performative, Transfer};
use slab::Slab;

use crate::connection::{Connection, Effect, EndpointHandler};

/// Per-frame overhead a TRANSFER fragment must leave room for: the 8-byte
/// frame header plus the 2-byte channel that precedes the performative.
const FRAME_OVERHEAD: usize = 8;

/// Session lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No BEGIN sent or received yet
    Unmapped,
    /// Local BEGIN sent, awaiting the peer's
    BeginSent,
    /// Both BEGIN frames exchanged; TRANSFER may flow
    Mapped,
    /// Local END sent, awaiting the peer's
    EndSent,
    /// The owning connection endpoint left `Opened`; draining until torn down
    Discarding,
}

/// Receives raw frames and session state transitions for one link-endpoint.
/// The link layer proper is out of scope; this is a plain relay target.
pub trait LinkEndpointHandler {
    /// A non-BEGIN/END performative addressed to this session arrived.
    /// Every link-endpoint sees every such frame; filtering by `handle` is
    /// left to the handler.
    fn on_frame(&mut self, performative: &Performative, payload: &Bytes);

    /// The owning session's state changed.
    fn on_session_state_changed(&mut self, new: SessionState, previous: SessionState);
}

struct SessionShared {
    state: SessionState,
    next_outgoing_id: u32,
    incoming_window: u32,
    outgoing_window: u32,
    handle_max: Handle,
    remote_incoming_window: Option<u32>,
    links: Slab<(String, Box<dyn LinkEndpointHandler>)>,
}

impl SessionShared {
    fn new() -> Self {
        Self {
            state: SessionState::Unmapped,
            next_outgoing_id: 0,
            incoming_window: u32::MAX,
            outgoing_window: u32::MAX,
            handle_max: Handle(u32::MAX),
            remote_incoming_window: None,
            links: Slab::new(),
        }
    }

    fn set_state(&mut self, new: SessionState) {
        let previous = self.state;
        if previous == new {
            return;
        }

        #[cfg(feature = "tracing")]
        tracing::debug!(?previous, ?new, "session state transition");
        #[cfg(feature = "log")]
        log::debug!("session state transition {:?} -> {:?}", previous, new);

        self.state = new;
        for (_, link) in self.links.iter_mut() {
            link.on_session_state_changed(new, previous);
        }
    }
}

/// The [`EndpointHandler`] registered with the owning [`Connection`];
/// mutates the same [`SessionShared`] the application-facing [`Session`]
/// handle reads from, the way [`crate::sasl::io::SaslIo`]'s `FrameQueue`
/// decouples a frame observer from the state it feeds.
struct SessionEndpointAdapter(Rc<RefCell<SessionShared>>);

impl EndpointHandler for SessionEndpointAdapter {
    fn on_connection_state_changed(
        &mut self,
        new: crate::connection::ConnectionState,
        _previous: crate::connection::ConnectionState,
    ) -> Vec<Effect> {
        use crate::connection::ConnectionState;
        let mut shared = self.0.borrow_mut();
        if new == ConnectionState::Opened {
            if shared.state == SessionState::Unmapped {
                let begin = Begin {
                    remote_channel: None,
                    next_outgoing_id: shared.next_outgoing_id,
                    incoming_window: shared.incoming_window,
                    outgoing_window: shared.outgoing_window,
                    handle_max: shared.handle_max.clone(),
                    offered_capabilities: None,
                    desired_capabilities: None,
                    properties: None,
                };
                shared.set_state(SessionState::BeginSent);
                return vec![Effect::SendFrame {
                    performative: Performative::Begin(begin),
                    payload: Bytes::new(),
                }];
            }
        } else if shared.state != SessionState::Unmapped {
            // Only a session that had actually begun mapping needs to be
            // torn down; one created before the connection ever reached
            // Opened should simply keep waiting.
            shared.set_state(SessionState::Discarding);
        }
        Vec::new()
    }

    fn on_frame(&mut self, performative: Performative, payload: Bytes) -> Vec<Effect> {
        let mut shared = self.0.borrow_mut();
        match performative {
            Performative::Begin(begin) => {
                shared.remote_incoming_window = Some(begin.incoming_window);
                shared.set_state(SessionState::Mapped);
                Vec::new()
            }
            Performative::End(_end) => {
                let already_ending = shared.state == SessionState::EndSent;
                shared.set_state(SessionState::Unmapped);
                if already_ending {
                    Vec::new()
                } else {
                    vec![Effect::SendFrame {
                        performative: Performative::End(End { error: None }),
                        payload: Bytes::new(),
                    }]
                }
            }
            other => {
                for (_, link) in shared.links.iter_mut() {
                    link.on_frame(&other, &payload);
                }
                Vec::new()
            }
        }
    }
}

/// Application-facing handle to a session mapped over one connection
/// endpoint.
pub struct Session {
    shared: Rc<RefCell<SessionShared>>,
    channel: u16,
}

impl Session {
    /// Creates an endpoint on `connection` and maps a session onto it. The
    /// initial BEGIN is emitted as soon as `connection` reaches `Opened`,
    /// which may be immediately if it already has.
    pub fn begin(connection: &mut Connection) -> Result<Self, Error> {
        let shared = Rc::new(RefCell::new(SessionShared::new()));
        let adapter = SessionEndpointAdapter(shared.clone());
        let channel = connection.create_endpoint(Box::new(adapter))?;
        Ok(Self { shared, channel })
    }

    /// Current session state.
    pub fn state(&self) -> SessionState {
        self.shared.borrow().state
    }

    /// The outgoing channel number this session is mapped onto.
    pub fn channel(&self) -> u16 {
        self.channel
    }

    /// Registers a link-endpoint under `name`. Duplicate names are
    /// permitted; the returned id is used to destroy it.
    pub fn create_link_endpoint(&mut self, name: impl Into<String>, handler: Box<dyn LinkEndpointHandler>) -> usize {
        self.shared.borrow_mut().links.insert((name.into(), handler))
    }

    /// Removes the link-endpoint registered under `id`.
    pub fn destroy_link_endpoint(&mut self, id: usize) {
        let mut shared = self.shared.borrow_mut();
        if shared.links.contains(id) {
            shared.links.remove(id);
        }
    }

    /// Tears down the session by sending END, releasing its connection
    /// endpoint. Synchronous; does not wait for the peer's reply.
    pub fn end(&mut self, connection: &mut Connection) -> Result<(), Error> {
        {
            let mut shared = self.shared.borrow_mut();
            shared.set_state(SessionState::EndSent);
        }
        connection.encode_frame(self.channel, &Performative::End(End { error: None }), &[])?;
        Ok(())
    }

    /// Sends `transfer`, assigning it the session's next delivery-id.
    /// Requires `Mapped`. If the encoded TRANSFER-plus-payload
    /// would exceed the connection's negotiated `remote_max_frame_size`,
    /// the payload is split across multiple TRANSFER frames with `more =
    /// true` on all but the last; `next_outgoing_id` still advances by
    /// exactly one for the whole call.
    pub fn transfer(&mut self, connection: &mut Connection, mut transfer: Transfer, payload: &[u8]) -> Result<u32, Error> {
        if self.state() != SessionState::Mapped {
            return Err(Error::NotMapped);
        }

        let delivery_id = self.shared.borrow().next_outgoing_id;
        transfer.delivery_id = Some(delivery_id);

        let remote_max_frame_size = connection.remote_max_frame_size() as usize;
        let perf_len = serde_amqp::to_vec(&transfer)?.len();
        let budget = remote_max_frame_size.saturating_sub(FRAME_OVERHEAD).saturating_sub(perf_len);
        let chunk_size = budget.max(1);

        let chunks: Vec<&[u8]> = if payload.is_empty() {
            vec![&[][..]]
        } else {
            payload.chunks(chunk_size).collect()
        };
        let last = chunks.len() - 1;

        for (i, chunk) in chunks.into_iter().enumerate() {
            let mut fragment = transfer.clone();
            fragment.more = i != last;

            #[cfg(feature = "tracing")]
            tracing::trace!(delivery_id, fragment = i, more = fragment.more, "sending transfer");
            #[cfg(feature = "log")]
            log::trace!("sending transfer delivery_id={} fragment={} more={}", delivery_id, i, fragment.more);

            connection.encode_frame(self.channel, &Performative::Transfer(fragment), chunk)?;
        }

        self.shared.borrow_mut().next_outgoing_id = delivery_id.wrapping_add(1);
        Ok(delivery_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{Connection, ConnectionState};
    use crate::io::{IoHandler, IoState};
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

    fn opened_connection() -> (Connection, StdRc<StdRefCell<Vec<u8>>>) {
        let sent = StdRc::new(StdRefCell::new(Vec::new()));
        let io = MockIo {
            sent: sent.clone(),
            state: IoState::Open,
        };
        let mut connection = Connection::builder("1234").open(Box::new(io)).unwrap();
        connection.dowork().unwrap();
        let header = [b'A', b'M', b'Q', b'P', 0x00, 1, 0, 0];
        connection.receive_bytes(&header).unwrap();

        let remote_open = fe2o3_amqp_types::performatives::Open {
            container_id: "broker".into(),
            hostname: None,
            max_frame_size: u32::MAX.into(),
            channel_max: 65535u16.into(),
            idle_time_out: None,
            outgoing_locales: None,
            incoming_locales: None,
            offered_capabilities: None,
            desired_capabilities: None,
            properties: None,
        };
        let mut side_codec = crate::frame::FrameCodec::new();
        let wire = crate::amqp::AmqpFrameCodec::encode_frame(
            &mut side_codec,
            0,
            &Performative::Open(remote_open),
            &[],
        )
        .unwrap();
        connection.receive_bytes(&wire).unwrap();
        assert_eq!(connection.state(), ConnectionState::Opened);
        sent.borrow_mut().clear();
        (connection, sent)
    }

    fn sample_transfer() -> Transfer {
        Transfer {
            handle: 0u32.into(),
            delivery_id: None,
            delivery_tag: None,
            message_format: None,
            settled: None,
            more: false,
            rcv_settle_mode: None,
            state: None,
            resume: false,
            aborted: false,
            batchable: false,
        }
    }

    #[test]
    fn begin_emits_on_opened_connection_and_reaches_mapped() {
        let (mut connection, sent) = opened_connection();
        let session = Session::begin(&mut connection).unwrap();
        assert_eq!(session.state(), SessionState::BeginSent);
        assert!(!sent.borrow().is_empty());

        let remote_begin = Begin {
            remote_channel: Some(session.channel()),
            next_outgoing_id: 0,
            incoming_window: u32::MAX,
            outgoing_window: u32::MAX,
            handle_max: Handle(u32::MAX),
            offered_capabilities: None,
            desired_capabilities: None,
            properties: None,
        };
        let mut side_codec = crate::frame::FrameCodec::new();
        let wire = crate::amqp::AmqpFrameCodec::encode_frame(
            &mut side_codec,
            0,
            &Performative::Begin(remote_begin),
            &[],
        )
        .unwrap();
        connection.receive_bytes(&wire).unwrap();
        assert_eq!(session.state(), SessionState::Mapped);
    }

    #[test]
    fn transfer_assigns_sequential_delivery_ids() {
        let (mut connection, _sent) = opened_connection();
        let mut session = Session::begin(&mut connection).unwrap();

        let remote_begin = Begin {
            remote_channel: Some(session.channel()),
            next_outgoing_id: 0,
            incoming_window: u32::MAX,
            outgoing_window: u32::MAX,
            handle_max: Handle(u32::MAX),
            offered_capabilities: None,
            desired_capabilities: None,
            properties: None,
        };
        let mut side_codec = crate::frame::FrameCodec::new();
        let wire = crate::amqp::AmqpFrameCodec::encode_frame(
            &mut side_codec,
            0,
            &Performative::Begin(remote_begin),
            &[],
        )
        .unwrap();
        connection.receive_bytes(&wire).unwrap();

        let first = session.transfer(&mut connection, sample_transfer(), &[]).unwrap();
        let second = session.transfer(&mut connection, sample_transfer(), &[]).unwrap();
        assert_eq!(first, 0);
        assert_eq!(second, 1);
    }

    #[derive(Default, Clone)]
    struct TransferRecorder(StdRc<StdRefCell<Vec<(bool, u32, usize)>>>);

    impl crate::amqp::AmqpFrameObserver for TransferRecorder {
        fn on_amqp_frame(
            &mut self,
            _channel: u16,
            performative: Performative,
            payload: Bytes,
        ) -> Result<(), crate::frame::ObserverError> {
            if let Performative::Transfer(transfer) = performative {
                self.0.borrow_mut().push((
                    transfer.more,
                    transfer.delivery_id.expect("delivery_id always set by Session::transfer"),
                    payload.len(),
                ));
            }
            Ok(())
        }
    }

    #[test]
    fn transfer_fragments_a_payload_larger_than_one_frame() {
        let (mut connection, sent) = {
            let sent = StdRc::new(StdRefCell::new(Vec::new()));
            let io = MockIo {
                sent: sent.clone(),
                state: IoState::Open,
            };
            let mut connection = Connection::builder("1234").open(Box::new(io)).unwrap();
            connection.dowork().unwrap();
            let header = [b'A', b'M', b'Q', b'P', 0x00, 1, 0, 0];
            connection.receive_bytes(&header).unwrap();

            let remote_open = fe2o3_amqp_types::performatives::Open {
                container_id: "broker".into(),
                hostname: None,
                max_frame_size: 512u32.into(),
                channel_max: 65535u16.into(),
                idle_time_out: None,
                outgoing_locales: None,
                incoming_locales: None,
                offered_capabilities: None,
                desired_capabilities: None,
                properties: None,
            };
            let mut side_codec = crate::frame::FrameCodec::new();
            let wire = crate::amqp::AmqpFrameCodec::encode_frame(
                &mut side_codec,
                0,
                &Performative::Open(remote_open),
                &[],
            )
            .unwrap();
            connection.receive_bytes(&wire).unwrap();
            assert_eq!(connection.remote_max_frame_size(), 512);
            (connection, sent)
        };

        let mut session = Session::begin(&mut connection).unwrap();
        let remote_begin = Begin {
            remote_channel: Some(session.channel()),
            next_outgoing_id: 0,
            incoming_window: u32::MAX,
            outgoing_window: u32::MAX,
            handle_max: Handle(u32::MAX),
            offered_capabilities: None,
            desired_capabilities: None,
            properties: None,
        };
        let mut side_codec = crate::frame::FrameCodec::new();
        let wire = crate::amqp::AmqpFrameCodec::encode_frame(
            &mut side_codec,
            0,
            &Performative::Begin(remote_begin),
            &[],
        )
        .unwrap();
        connection.receive_bytes(&wire).unwrap();
        assert_eq!(session.state(), SessionState::Mapped);

        sent.borrow_mut().clear();
        let payload = vec![0xABu8; 2000];
        let delivery_id = session.transfer(&mut connection, sample_transfer(), &payload).unwrap();

        let recorder = TransferRecorder::default();
        let mut decoder_frame_codec = crate::frame::FrameCodec::new();
        decoder_frame_codec.subscribe(
            crate::frame::FRAME_TYPE_AMQP,
            Box::new(crate::amqp::AmqpFrameCodec::new(Box::new(recorder.clone()))),
        );
        decoder_frame_codec.receive_bytes(&sent.borrow()).unwrap();

        let fragments = recorder.0.borrow();
        assert!(fragments.len() > 1, "a 2000-byte payload over a 512-byte max_frame_size must be split");

        let reassembled: usize = fragments.iter().map(|(_, _, len)| len).sum();
        assert_eq!(reassembled, payload.len());

        let last = fragments.len() - 1;
        for (i, (more, id, _)) in fragments.iter().enumerate() {
            assert_eq!(*id, delivery_id, "every fragment shares the same delivery_id");
            assert_eq!(*more, i != last, "every fragment but the last must set more=true");
        }
    }
}

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use bytes::{Buf, Bytes, BytesMut};
use rustc_hash::FxHashMap;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::channels::handshake::{
    ConnectDisposition, ConnectResult, DisconnectReason, HandshakeAction, HandshakeChannel, HandshakeState,
};
use crate::channels::reliable::ReliableChannel;
use crate::channels::unreliable::UnreliableChannel;
use crate::channels::{Promoted, ReadyMessage};
use crate::config::NodeConfig;
use crate::delivery_trace::DeliveryTrace;
use crate::node::SendMethod;
use crate::send_socket::SendSocket;
use crate::wire;
use crate::wire::{ConnectAcceptedFrame, ConnectFrame, ConnectRejectedFrame, ReliableAck, StreamKind, SystemPacketId, SYSTEM_CHANNEL};

/// Things the node must act on after a peer processed a datagram or a flush tick. They are
///  returned rather than handled in place because they need node-wide context (capacity,
///  password, the event queue) that a peer does not have.
#[derive(Debug)]
pub enum PeerOutcome {
    /// an inbound `Connect` awaits the capacity / password verdict
    ConnectRequested { password: String, initiator_id: u32 },
    /// the handshake resolved, successfully or not
    Connected(ConnectResult),
    /// the connection ended
    Disconnected(DisconnectReason),
}

/// One remote endpoint: the demultiplexer for its inbound datagrams and the owner of its
///  channels.
///
/// A peer exists per remote address, created lazily on first send or first inbound datagram.
///  Reliable channels are created lazily per channel number and live for the peer's
///  lifetime.
pub struct Peer {
    addr: SocketAddr,
    config: Arc<NodeConfig>,
    socket: Arc<dyn SendSocket>,
    handshake: HandshakeChannel,
    unreliable: UnreliableChannel,
    reliable: Mutex<FxHashMap<u8, Arc<ReliableChannel>>>,
    last_received: Mutex<Instant>,
}

impl Peer {
    pub fn new(addr: SocketAddr, config: Arc<NodeConfig>, socket: Arc<dyn SendSocket>) -> Arc<Peer> {
        Arc::new(Peer {
            addr,
            handshake: HandshakeChannel::new(addr, config.clone()),
            unreliable: UnreliableChannel::new(StreamKind::UnreliableData, addr, config.max_frame_size),
            reliable: Mutex::new(FxHashMap::default()),
            last_received: Mutex::new(Instant::now()),
            config,
            socket,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn state(&self) -> HandshakeState {
        self.handshake.state()
    }

    pub fn is_active(&self) -> bool {
        self.handshake.state() == HandshakeState::Active
    }

    pub fn connect_result(&self) -> ConnectResult {
        self.handshake.connect_result()
    }

    pub fn disconnect_reason(&self) -> DisconnectReason {
        self.handshake.disconnect_reason()
    }

    pub fn last_received(&self) -> Instant {
        *self.last_received.lock().unwrap()
    }

    fn reliable_channel(&self, channel: u8) -> Arc<ReliableChannel> {
        self.reliable.lock().unwrap()
            .entry(channel)
            .or_insert_with(|| Arc::new(ReliableChannel::new(channel, self.addr, self.config.clone())))
            .clone()
    }

    pub fn start_connecting(&self, password: &str, now: Instant) -> anyhow::Result<()> {
        self.handshake.start_connecting(password, now)
    }

    pub fn accept_connect(&self, initiator_id: u32, now: Instant) -> Option<ConnectResult> {
        self.handshake.accept_connect(initiator_id, now)
    }

    pub fn reject_connect(&self, initiator_id: u32, result: ConnectResult) {
        self.handshake.reject_connect(initiator_id, result);
    }

    /// Queues a user message. The node has validated type id, channel number and payload
    ///  size already.
    pub fn send(&self, type_id: u8, payload: Bytes, channel: u8, method: SendMethod, trace: Option<&Arc<DeliveryTrace>>) {
        match method {
            SendMethod::Reliable => self.reliable_channel(channel).add_message(type_id, payload, trace),
            SendMethod::Unreliable => self.unreliable.add_message(type_id, false, payload),
        }
    }

    /// Closes the connection after the lost-peer sweep gave up on this peer. Returns false
    ///  if there was no active connection.
    pub fn mark_unreachable(&self) -> bool {
        self.handshake.handle_disconnect(DisconnectReason::Unreachable).is_some()
    }

    /// Closes the connection and queues the goodbye. Returns the trace of the `Disconnect`
    ///  message, or `None` if there was no active connection to close.
    pub fn disconnect(&self, reason: DisconnectReason) -> Option<Arc<DeliveryTrace>> {
        if !self.handshake.request_disconnect(reason) {
            return None;
        }
        let trace = DeliveryTrace::new();
        let payload = Bytes::copy_from_slice(&[disconnect_reason_to_wire(reason)]);
        self.reliable_channel(SYSTEM_CHANNEL)
            .add_message(SystemPacketId::Disconnect.into(), payload, Some(&trace));
        Some(trace)
    }

    /// Entry point of the receive path: demultiplexes one datagram by stream discriminator,
    ///  enforces the connection gate, and sends the resulting ack (if any) once all locks
    ///  are released.
    ///
    /// Malformed datagrams surface as errors to be logged and dropped by the caller; stale
    ///  or misaddressed ones are dropped silently here.
    pub async fn on_datagram(&self, mut buf: Bytes) -> anyhow::Result<Vec<PeerOutcome>> {
        *self.last_received.lock().unwrap() = Instant::now();

        let kind = StreamKind::try_from(buf.try_get_u8()?)
            .map_err(|e| anyhow::anyhow!("unknown stream discriminator {}", e.number))?;
        let conn_id = buf.try_get_u32_le()?;

        if kind == StreamKind::HandshakeData {
            return self.on_handshake_data(conn_id, buf);
        }

        // the connection gate: no data without an established id exchange, and no data from
        // a conn id other than the one recorded at handshake time
        match self.handshake.state() {
            HandshakeState::Active => {}
            HandshakeState::Closed if kind == StreamKind::ReliableAck => {}
            state => {
                debug!("dropping {:?} datagram from {:?} in state {:?}", kind, self.addr, state);
                return Ok(Vec::new());
            }
        }
        if self.handshake.remote_id() != Some(conn_id) {
            debug!("dropping {:?} datagram from {:?}: conn id {} does not match the connection",
                kind, self.addr, conn_id);
            return Ok(Vec::new());
        }

        match kind {
            StreamKind::ReliableData => self.on_reliable_data(buf).await,
            StreamKind::ReliableAck => {
                let channel = buf.try_get_u8()?;
                let ack = ReliableAck::deser(channel, &mut buf)?;
                // no channel means nothing was ever sent on it, so nothing to ack
                let ch = self.reliable.lock().unwrap().get(&channel).cloned();
                if let Some(ch) = ch {
                    ch.receive_ack(ack);
                }
                Ok(Vec::new())
            }
            StreamKind::UnreliableData => {
                for promoted in self.unreliable.receive_data(&mut buf)? {
                    match promoted {
                        Promoted::User(msg) => self.unreliable.push_ready(msg),
                        Promoted::System { id, .. } => {
                            debug!("dropping system message {:?} on the unreliable stream from {:?}", id, self.addr);
                        }
                    }
                }
                Ok(Vec::new())
            }
            StreamKind::HandshakeData => unreachable!(),
        }
    }

    async fn on_reliable_data(&self, mut buf: Bytes) -> anyhow::Result<Vec<PeerOutcome>> {
        let channel = buf.try_get_u8()?;
        let ch = self.reliable_channel(channel);
        let (ack, promoted) = ch.receive_data(&mut buf)?;

        // system messages are handled here, inline, so nothing later in the stream can be
        // seen by the application before their effect
        let mut outcomes = Vec::new();
        for p in promoted {
            match p {
                Promoted::User(msg) => ch.push_ready(msg),
                Promoted::System { id, payload } => {
                    if let Some(outcome) = self.on_system_message(id, payload) {
                        outcomes.push(outcome);
                    }
                }
            }
        }

        // always acked, even if everything was a stale duplicate: our previous ack may have
        // been lost and the sender retransmits until it hears one
        if let Some(ack) = ack {
            let mut out = BytesMut::with_capacity(wire::RELIABLE_DATA_HEADER_LEN + 1);
            ack.ser(&mut out, self.handshake.local_id());
            self.socket.send_datagram(self.addr, &out).await;
        }
        Ok(outcomes)
    }

    fn on_system_message(&self, id: SystemPacketId, payload: Bytes) -> Option<PeerOutcome> {
        match id {
            SystemPacketId::Disconnect => {
                let reason = disconnect_reason_from_wire(payload.first().copied());
                self.handshake.handle_disconnect(reason).map(PeerOutcome::Disconnected)
            }
            SystemPacketId::KeepAlive => {
                // the ack that confirmed this message is the whole point; nothing to do
                trace!("keepalive from {:?}", self.addr);
                None
            }
            SystemPacketId::Rpc => {
                // RPC invocations surface like user messages, on the system channel
                self.reliable_channel(SYSTEM_CHANNEL).push_ready(ReadyMessage {
                    type_id: id.into(),
                    payload,
                    from: self.addr,
                    channel: SYSTEM_CHANNEL,
                });
                None
            }
            SystemPacketId::IdPackRequest | SystemPacketId::IdPackProvide | SystemPacketId::CreateGroup
            | SystemPacketId::DestroyGroup | SystemPacketId::DestroyAllGroups => {
                debug!("dropping message with retired system id {:?} from {:?}", id, self.addr);
                None
            }
            SystemPacketId::Connect | SystemPacketId::ConnectAccepted | SystemPacketId::ConnectInvalidPw
            | SystemPacketId::ConnectMaxUsers => {
                warn!("dropping handshake message {:?} from {:?} outside the handshake stream", id, self.addr);
                None
            }
        }
    }

    fn on_handshake_data(&self, conn_id: u32, mut buf: Bytes) -> anyhow::Result<Vec<PeerOutcome>> {
        let now = Instant::now();
        let mut outcomes = Vec::new();
        for promoted in self.handshake.receive_data(&mut buf)? {
            let Promoted::System { id, payload } = promoted else {
                warn!("dropping non-system message on the handshake stream from {:?}", self.addr);
                continue;
            };
            let mut payload = payload;
            match id {
                SystemPacketId::Connect => {
                    let frame = ConnectFrame::deser(&mut payload)?;
                    match self.handshake.handle_connect(conn_id, frame.password) {
                        ConnectDisposition::NeedsDecision { password, initiator_id } => {
                            outcomes.push(PeerOutcome::ConnectRequested { password, initiator_id });
                        }
                        ConnectDisposition::AlreadyActive | ConnectDisposition::Ignored => {}
                    }
                }
                SystemPacketId::ConnectAccepted => {
                    let frame = ConnectAcceptedFrame::deser(&mut payload)?;
                    if let Some(result) = self.handshake.handle_accepted(frame, now) {
                        outcomes.push(PeerOutcome::Connected(result));
                    }
                }
                SystemPacketId::ConnectInvalidPw | SystemPacketId::ConnectMaxUsers => {
                    let frame = ConnectRejectedFrame::deser(&mut payload)?;
                    let result = if id == SystemPacketId::ConnectInvalidPw {
                        ConnectResult::InvalidPw
                    } else {
                        ConnectResult::MaxUsers
                    };
                    if let Some(result) = self.handshake.handle_rejected(frame, result) {
                        outcomes.push(PeerOutcome::Connected(result));
                    }
                }
                _ => {
                    warn!("dropping unexpected system message {:?} on the handshake stream from {:?}", id, self.addr);
                }
            }
        }
        Ok(outcomes)
    }

    /// One flush tick: run handshake timers, then serialize and transmit everything pending.
    ///  Data channels are only flushed once a connection id exchange fixed the header id;
    ///  in `Closed` state reliable channels keep flushing so a queued `Disconnect` (and its
    ///  retransmissions) still go out during the linger phase.
    pub async fn flush(&self, now: Instant) -> Vec<PeerOutcome> {
        let mut outcomes = Vec::new();
        for action in self.handshake.tick(now) {
            match action {
                HandshakeAction::SendKeepAlive { trace } => {
                    self.reliable_channel(SYSTEM_CHANNEL)
                        .add_message(SystemPacketId::KeepAlive.into(), Bytes::new(), Some(&trace));
                }
                HandshakeAction::ConnectFailed(result) => outcomes.push(PeerOutcome::Connected(result)),
                HandshakeAction::PeerLost => outcomes.push(PeerOutcome::Disconnected(DisconnectReason::Unreachable)),
            }
        }

        if let Some(buf) = self.handshake.serialize_flush() {
            self.socket.send_datagram(self.addr, &buf).await;
        }

        let state = self.handshake.state();
        if state != HandshakeState::Active && state != HandshakeState::Closed {
            return outcomes;
        }
        let conn_id = self.handshake.local_id();

        if state == HandshakeState::Active {
            if let Some(buf) = self.unreliable.serialize_flush(conn_id) {
                self.socket.send_datagram(self.addr, &buf).await;
            }
        }
        let channels: Vec<_> = self.reliable.lock().unwrap().values().cloned().collect();
        for ch in channels {
            if let Some(buf) = ch.serialize_flush(conn_id) {
                self.socket.send_datagram(self.addr, &buf).await;
            }
        }
        outcomes
    }

    /// True while something still awaits (re)transmission, used by teardown to decide how
    ///  long the linger phase needs to be.
    pub fn has_pending_sends(&self) -> bool {
        self.handshake.has_pending_sends()
            || self.unreliable.has_pending_sends()
            || self.reliable.lock().unwrap().values().any(|ch| ch.has_pending_sends())
    }

    /// Empties all inboxes, in per-channel order.
    pub fn drain_inboxes(&self) -> Vec<ReadyMessage> {
        let mut result = self.unreliable.drain_inbox();
        let channels: Vec<_> = self.reliable.lock().unwrap().values().cloned().collect();
        for ch in channels {
            result.extend(ch.drain_inbox());
        }
        result
    }
}

fn disconnect_reason_to_wire(reason: DisconnectReason) -> u8 {
    match reason {
        DisconnectReason::Kicked => 1,
        _ => 0,
    }
}

fn disconnect_reason_from_wire(raw: Option<u8>) -> DisconnectReason {
    match raw {
        Some(1) => DisconnectReason::Kicked,
        _ => DisconnectReason::Requested,
    }
}

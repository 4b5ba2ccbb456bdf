use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use anyhow::bail;
use bytes::BytesMut;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::channels::unreliable::UnreliableChannel;
use crate::channels::Promoted;
use crate::config::NodeConfig;
use crate::delivery_trace::DeliveryTrace;
use crate::wire::{ConnectAcceptedFrame, ConnectFrame, ConnectRejectedFrame, StreamKind, SystemPacketId};

/// Outcome of a connection attempt, reported through the connect callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectResult {
    NotSet,
    Succes,
    MaxUsers,
    InvalidPw,
    TimedOut,
}

/// Why a connection ended, reported through the disconnect callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    NotSet,
    /// one of the two sides asked for the disconnect
    Requested,
    /// keepalive delivery failed or nothing was received for too long
    Unreachable,
    /// the hosting side removed the peer
    Kicked,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    /// initial state of a passively discovered peer
    NotSet,
    /// we sent a `Connect` and are waiting for the verdict
    Initiating,
    /// two-way id exchange completed
    Active,
    /// terminal - no transition leaves this state
    Closed,
}

/// Asked of the owning peer after a `Connect` frame arrived. The capacity / password verdict
///  is not taken here: the handshake channel knows one peer, the decision needs node-wide
///  context and comes back via [`HandshakeChannel::accept_connect`] or
///  [`HandshakeChannel::reject_connect`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectDisposition {
    /// state was `NotSet` or `Initiating`: the node must decide accept or reject
    NeedsDecision { password: String, initiator_id: u32 },
    /// retransmitted `Connect` of the established connection: accept was re-sent, done
    AlreadyActive,
    /// `Connect` that matches no live attempt (wrong id, or the connection is closed)
    Ignored,
}

/// What the flush tick asks the owning peer to do. Queuing keepalive / disconnect messages
///  is the peer's job because they travel on the reliable system channel, which the
///  handshake channel has no access to.
#[derive(Debug, Clone)]
pub enum HandshakeAction {
    SendKeepAlive { trace: Arc<DeliveryTrace> },
    ConnectFailed(ConnectResult),
    PeerLost,
}

/// Connection state machine for one peer, plus the unreliably-framed transport its frames
///  travel on.
///
/// Handshake frames use the same framing as unreliable data but their own stream
///  discriminator, so they are recognizable before any connection state exists, and so the
///  connection id in their header is read as "the sender's claimed id" rather than checked
///  against an established connection.
///
/// Every transition handler re-validates the prior state under the lock, so duplicated or
///  crossed frames (both of which the connect retry loop produces routinely) degrade to
///  no-ops instead of double transitions.
pub struct HandshakeChannel {
    peer_addr: SocketAddr,
    config: Arc<NodeConfig>,
    transport: UnreliableChannel,
    inner: Mutex<Inner>,
}

struct Inner {
    state: HandshakeState,
    local_id: u32,
    remote_id: Option<u32>,
    connect_result: ConnectResult,
    disconnect_reason: DisconnectReason,
    /// set while `Initiating`: what the periodic connect retry re-sends
    connect_password: Option<String>,
    connect_deadline: Option<Instant>,
    next_connect_attempt: Option<Instant>,
    next_keepalive: Option<Instant>,
    keepalive_trace: Option<Arc<DeliveryTrace>>,
}

impl HandshakeChannel {
    pub fn new(peer_addr: SocketAddr, config: Arc<NodeConfig>) -> HandshakeChannel {
        let transport = UnreliableChannel::new(StreamKind::HandshakeData, peer_addr, config.max_frame_size);
        HandshakeChannel {
            peer_addr,
            config,
            transport,
            inner: Mutex::new(Inner {
                state: HandshakeState::NotSet,
                local_id: rand::random(),
                remote_id: None,
                connect_result: ConnectResult::NotSet,
                disconnect_reason: DisconnectReason::NotSet,
                connect_password: None,
                connect_deadline: None,
                next_connect_attempt: None,
                next_keepalive: None,
                keepalive_trace: None,
            }),
        }
    }

    pub fn state(&self) -> HandshakeState {
        self.inner.lock().unwrap().state
    }

    pub fn local_id(&self) -> u32 {
        self.inner.lock().unwrap().local_id
    }

    pub fn remote_id(&self) -> Option<u32> {
        self.inner.lock().unwrap().remote_id
    }

    pub fn connect_result(&self) -> ConnectResult {
        self.inner.lock().unwrap().connect_result
    }

    pub fn disconnect_reason(&self) -> DisconnectReason {
        self.inner.lock().unwrap().disconnect_reason
    }

    /// Starts the active side of the handshake. Legal exactly once, from `NotSet`.
    pub fn start_connecting(&self, password: &str, now: Instant) -> anyhow::Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.state != HandshakeState::NotSet {
            bail!("connect to {:?} in state {:?}: a connection attempt was already made", self.peer_addr, inner.state);
        }
        inner.state = HandshakeState::Initiating;
        inner.connect_password = Some(password.to_string());
        inner.connect_deadline = Some(now + self.config.connect_timeout);
        inner.next_connect_attempt = Some(now + self.config.connect_attempt_interval);

        debug!("initiating connection to {:?} with local id {}", self.peer_addr, inner.local_id);
        self.queue_connect(password);
        Ok(())
    }

    fn queue_connect(&self, password: &str) {
        let mut buf = BytesMut::new();
        ConnectFrame { password: password.to_string() }.ser(&mut buf);
        self.transport.add_message(SystemPacketId::Connect.into(), true, buf.freeze());
    }

    /// A `Connect` frame arrived; `initiator_id` is the connection id from the datagram
    ///  header.
    pub fn handle_connect(&self, initiator_id: u32, password: String) -> ConnectDisposition {
        let inner = self.inner.lock().unwrap();
        match inner.state {
            HandshakeState::NotSet | HandshakeState::Initiating => {
                ConnectDisposition::NeedsDecision { password, initiator_id }
            }
            HandshakeState::Active if inner.remote_id == Some(initiator_id) => {
                // our accept was lost; repeat it
                self.queue_accepted(initiator_id, inner.local_id);
                ConnectDisposition::AlreadyActive
            }
            _ => {
                debug!("ignoring connect frame from {:?} with id {} in state {:?}",
                    self.peer_addr, initiator_id, inner.state);
                ConnectDisposition::Ignored
            }
        }
    }

    /// The node-side verdict on a `Connect` was positive: establish the connection and send
    ///  `ConnectAccepted`. Returns the result to report, or `None` if a racing frame
    ///  resolved the handshake in the meantime.
    pub fn accept_connect(&self, initiator_id: u32, now: Instant) -> Option<ConnectResult> {
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            HandshakeState::NotSet | HandshakeState::Initiating => {
                inner.state = HandshakeState::Active;
                inner.remote_id = Some(initiator_id);
                inner.connect_result = ConnectResult::Succes;
                inner.connect_password = None;
                self.arm_keepalive(&mut inner, now);

                info!("accepted connection from {:?}, local id {}, remote id {}",
                    self.peer_addr, inner.local_id, initiator_id);
                self.queue_accepted(initiator_id, inner.local_id);
                Some(ConnectResult::Succes)
            }
            _ => None,
        }
    }

    /// The node-side verdict on a `Connect` was negative: tell the initiator why. Does not
    ///  transition - a rejected stranger holds no connection state worth keeping.
    pub fn reject_connect(&self, initiator_id: u32, result: ConnectResult) {
        let id = match result {
            ConnectResult::InvalidPw => SystemPacketId::ConnectInvalidPw,
            ConnectResult::MaxUsers => SystemPacketId::ConnectMaxUsers,
            _ => {
                debug_assert!(false, "not a rejection result: {:?}", result);
                return;
            }
        };
        debug!("rejecting connect from {:?}: {:?}", self.peer_addr, result);
        let mut buf = BytesMut::new();
        ConnectRejectedFrame { initiator_id }.ser(&mut buf);
        self.transport.add_message(id.into(), true, buf.freeze());
    }

    fn queue_accepted(&self, initiator_id: u32, acceptor_id: u32) {
        let mut buf = BytesMut::new();
        ConnectAcceptedFrame { initiator_id, acceptor_id }.ser(&mut buf);
        self.transport.add_message(SystemPacketId::ConnectAccepted.into(), true, buf.freeze());
    }

    /// `ConnectAccepted` arrived. Returns the result to report, or `None` for frames that
    ///  match no open attempt.
    pub fn handle_accepted(&self, frame: ConnectAcceptedFrame, now: Instant) -> Option<ConnectResult> {
        let mut inner = self.inner.lock().unwrap();
        if inner.state != HandshakeState::Initiating {
            return None;
        }
        if frame.initiator_id != inner.local_id {
            // crossed reply to a stale attempt from a previous connection at this address
            warn!("accept from {:?} reflects id {} but ours is {} - ignoring",
                self.peer_addr, frame.initiator_id, inner.local_id);
            return None;
        }

        inner.state = HandshakeState::Active;
        inner.remote_id = Some(frame.acceptor_id);
        inner.connect_result = ConnectResult::Succes;
        inner.connect_password = None;
        inner.connect_deadline = None;
        inner.next_connect_attempt = None;
        self.arm_keepalive(&mut inner, now);

        info!("connected to {:?}, local id {}, remote id {}", self.peer_addr, inner.local_id, frame.acceptor_id);
        Some(ConnectResult::Succes)
    }

    /// `ConnectInvalidPw` / `ConnectMaxUsers` arrived. Returns the failure to report, or
    ///  `None` for frames that match no open attempt.
    pub fn handle_rejected(&self, frame: ConnectRejectedFrame, result: ConnectResult) -> Option<ConnectResult> {
        debug_assert!(matches!(result, ConnectResult::InvalidPw | ConnectResult::MaxUsers));
        let mut inner = self.inner.lock().unwrap();
        if inner.state != HandshakeState::Initiating || frame.initiator_id != inner.local_id {
            return None;
        }

        info!("connection to {:?} rejected: {:?}", self.peer_addr, result);
        Self::close(&mut inner, result, DisconnectReason::NotSet);
        Some(result)
    }

    /// An inbound `Disconnect` system message. Returns the reason to report, or `None` if
    ///  the connection was not active.
    pub fn handle_disconnect(&self, reason: DisconnectReason) -> Option<DisconnectReason> {
        let mut inner = self.inner.lock().unwrap();
        if inner.state != HandshakeState::Active {
            return None;
        }
        info!("peer {:?} disconnected: {:?}", self.peer_addr, reason);
        let result = inner.connect_result;
        Self::close(&mut inner, result, reason);
        Some(reason)
    }

    /// A locally requested disconnect (or kick). Returns true if the peer should send a
    ///  `Disconnect` message (i.e. the connection was active and is now closed).
    pub fn request_disconnect(&self, reason: DisconnectReason) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner.state != HandshakeState::Active {
            return false;
        }
        info!("disconnecting from {:?}: {:?}", self.peer_addr, reason);
        let result = inner.connect_result;
        Self::close(&mut inner, result, reason);
        true
    }

    fn close(inner: &mut Inner, result: ConnectResult, reason: DisconnectReason) {
        inner.state = HandshakeState::Closed;
        inner.connect_result = result;
        inner.disconnect_reason = reason;
        inner.connect_password = None;
        inner.connect_deadline = None;
        inner.next_connect_attempt = None;
        inner.next_keepalive = None;
        inner.keepalive_trace = None;
    }

    fn arm_keepalive(&self, inner: &mut Inner, now: Instant) {
        inner.next_keepalive = Some(now + self.config.keepalive_interval);
        inner.keepalive_trace = None;
    }

    /// Timer logic, called from the flush tick before serialization: connect retries and
    ///  timeout while `Initiating`, keepalive scheduling and loss detection while `Active`.
    pub fn tick(&self, now: Instant) -> Vec<HandshakeAction> {
        let mut inner = self.inner.lock().unwrap();
        let mut actions = Vec::new();

        match inner.state {
            HandshakeState::Initiating => {
                if inner.connect_deadline.is_some_and(|deadline| now >= deadline) {
                    info!("connection attempt to {:?} timed out", self.peer_addr);
                    Self::close(&mut inner, ConnectResult::TimedOut, DisconnectReason::NotSet);
                    actions.push(HandshakeAction::ConnectFailed(ConnectResult::TimedOut));
                } else if inner.next_connect_attempt.is_some_and(|at| now >= at) {
                    inner.next_connect_attempt = Some(now + self.config.connect_attempt_interval);
                    if let Some(password) = inner.connect_password.clone() {
                        self.queue_connect(&password);
                    }
                }
            }
            HandshakeState::Active => {
                if inner.next_keepalive.is_some_and(|at| now >= at) {
                    let previous_delivered = inner.keepalive_trace.as_ref()
                        .map_or(true, |t| t.peek_specific(self.peer_addr));
                    if !previous_delivered {
                        warn!("keepalive to {:?} not acknowledged within {:?} - peer is unreachable",
                            self.peer_addr, self.config.keepalive_interval);
                        let result = inner.connect_result;
                        Self::close(&mut inner, result, DisconnectReason::Unreachable);
                        actions.push(HandshakeAction::PeerLost);
                    } else {
                        let trace = DeliveryTrace::new();
                        inner.keepalive_trace = Some(trace.clone());
                        inner.next_keepalive = Some(now + self.config.keepalive_interval);
                        actions.push(HandshakeAction::SendKeepAlive { trace });
                    }
                }
            }
            HandshakeState::NotSet | HandshakeState::Closed => {}
        }

        actions
    }

    pub fn has_pending_sends(&self) -> bool {
        self.transport.has_pending_sends()
    }

    /// Serializes queued handshake frames. The connection id in the header is always our
    ///  own: the receiving side reads it as the sender's claimed identity.
    pub fn serialize_flush(&self) -> Option<BytesMut> {
        let conn_id = self.inner.lock().unwrap().local_id;
        self.transport.serialize_flush(conn_id)
    }

    /// Parses an inbound handshake-framed datagram (after discriminator and conn id).
    pub fn receive_data(&self, buf: &mut impl bytes::Buf) -> anyhow::Result<Vec<Promoted>> {
        self.transport.receive_data(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Buf;
    use std::time::Duration;

    fn addr() -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 9000))
    }

    fn config() -> Arc<NodeConfig> {
        Arc::new(NodeConfig::default_lan())
    }

    fn channel() -> HandshakeChannel {
        HandshakeChannel::new(addr(), config())
    }

    /// parses the single system frame out of a serialized handshake datagram
    fn single_frame(buf: BytesMut) -> (u32, SystemPacketId, bytes::Bytes) {
        let mut buf = buf.freeze();
        assert_eq!(buf.get_u8(), u8::from(StreamKind::HandshakeData));
        let conn_id = buf.get_u32_le();
        let _seq = buf.get_u32_le();
        let type_id = buf.get_u8();
        assert_eq!(buf.get_u8(), 1, "handshake frames are system frames");
        let len = buf.get_u16_le() as usize;
        let payload = buf.copy_to_bytes(len);
        assert!(buf.is_empty());
        (conn_id, SystemPacketId::try_from(type_id).unwrap(), payload)
    }

    #[tokio::test]
    async fn test_start_connecting_queues_connect_frame() {
        let ch = channel();
        ch.start_connecting("pw", Instant::now()).unwrap();
        assert_eq!(ch.state(), HandshakeState::Initiating);

        let (conn_id, id, mut payload) = single_frame(ch.serialize_flush().unwrap());
        assert_eq!(conn_id, ch.local_id());
        assert_eq!(id, SystemPacketId::Connect);
        assert_eq!(ConnectFrame::deser(&mut payload).unwrap().password, "pw");
    }

    #[tokio::test]
    async fn test_start_connecting_twice_rejected() {
        let ch = channel();
        ch.start_connecting("pw", Instant::now()).unwrap();
        assert!(ch.start_connecting("pw", Instant::now()).is_err());
    }

    #[tokio::test]
    async fn test_accept_flow() {
        let initiator = channel();
        let acceptor = channel();
        let now = Instant::now();
        initiator.start_connecting("pw", now).unwrap();

        let disposition = acceptor.handle_connect(initiator.local_id(), "pw".to_string());
        assert_eq!(disposition, ConnectDisposition::NeedsDecision {
            password: "pw".to_string(),
            initiator_id: initiator.local_id(),
        });

        assert_eq!(acceptor.accept_connect(initiator.local_id(), now), Some(ConnectResult::Succes));
        assert_eq!(acceptor.state(), HandshakeState::Active);
        assert_eq!(acceptor.remote_id(), Some(initiator.local_id()));

        let (_, id, mut payload) = single_frame(acceptor.serialize_flush().unwrap());
        assert_eq!(id, SystemPacketId::ConnectAccepted);
        let frame = ConnectAcceptedFrame::deser(&mut payload).unwrap();

        assert_eq!(initiator.handle_accepted(frame, now), Some(ConnectResult::Succes));
        assert_eq!(initiator.state(), HandshakeState::Active);
        assert_eq!(initiator.remote_id(), Some(acceptor.local_id()));
        assert_eq!(initiator.connect_result(), ConnectResult::Succes);
    }

    #[tokio::test]
    async fn test_duplicate_accept_is_noop() {
        let ch = channel();
        let now = Instant::now();
        ch.start_connecting("pw", now).unwrap();
        let frame = ConnectAcceptedFrame { initiator_id: ch.local_id(), acceptor_id: 42 };

        assert!(ch.handle_accepted(frame, now).is_some());
        assert!(ch.handle_accepted(frame, now).is_none());
    }

    #[tokio::test]
    async fn test_accept_with_wrong_reflected_id_ignored() {
        let ch = channel();
        let now = Instant::now();
        ch.start_connecting("pw", now).unwrap();

        let stale_id = ch.local_id().wrapping_add(1);
        let frame = ConnectAcceptedFrame { initiator_id: stale_id, acceptor_id: 42 };
        assert!(ch.handle_accepted(frame, now).is_none());
        assert_eq!(ch.state(), HandshakeState::Initiating);
    }

    #[tokio::test]
    async fn test_rejection_closes_with_result() {
        let ch = channel();
        ch.start_connecting("pw", Instant::now()).unwrap();

        let frame = ConnectRejectedFrame { initiator_id: ch.local_id() };
        assert_eq!(ch.handle_rejected(frame, ConnectResult::InvalidPw), Some(ConnectResult::InvalidPw));
        assert_eq!(ch.state(), HandshakeState::Closed);
        assert_eq!(ch.connect_result(), ConnectResult::InvalidPw);

        // no transition leaves Closed
        assert!(ch.handle_accepted(ConnectAcceptedFrame { initiator_id: ch.local_id(), acceptor_id: 1 }, Instant::now()).is_none());
    }

    #[tokio::test]
    async fn test_simultaneous_connect_resolves_to_active() {
        let a = channel();
        let b = channel();
        let now = Instant::now();
        a.start_connecting("pw", now).unwrap();
        b.start_connecting("pw", now).unwrap();

        // both sides see the other's connect while initiating and both accept
        assert!(matches!(a.handle_connect(b.local_id(), "pw".to_string()), ConnectDisposition::NeedsDecision { .. }));
        assert_eq!(a.accept_connect(b.local_id(), now), Some(ConnectResult::Succes));
        assert_eq!(b.accept_connect(a.local_id(), now), Some(ConnectResult::Succes));

        // the crossed ConnectAccepted replies arrive after the fact and change nothing
        assert!(a.handle_accepted(ConnectAcceptedFrame { initiator_id: a.local_id(), acceptor_id: b.local_id() }, now).is_none());
        assert_eq!(a.state(), HandshakeState::Active);
        assert_eq!(b.state(), HandshakeState::Active);
        assert_eq!(a.remote_id(), Some(b.local_id()));
        assert_eq!(b.remote_id(), Some(a.local_id()));
    }

    #[tokio::test]
    async fn test_retransmitted_connect_repeats_accept() {
        let ch = channel();
        let now = Instant::now();
        ch.accept_connect(77, now);
        ch.serialize_flush();

        assert_eq!(ch.handle_connect(77, "pw".to_string()), ConnectDisposition::AlreadyActive);
        let (_, id, _) = single_frame(ch.serialize_flush().unwrap());
        assert_eq!(id, SystemPacketId::ConnectAccepted);

        // a connect claiming a different id matches no live attempt
        assert_eq!(ch.handle_connect(78, "pw".to_string()), ConnectDisposition::Ignored);
    }

    #[tokio::test]
    async fn test_tick_resends_connect() {
        let ch = channel();
        let now = Instant::now();
        ch.start_connecting("pw", now).unwrap();
        ch.serialize_flush();

        assert!(ch.tick(now + Duration::from_millis(100)).is_empty());
        assert!(!ch.has_pending_sends(), "too early for a retry");

        assert!(ch.tick(now + Duration::from_millis(350)).is_empty());
        let (_, id, _) = single_frame(ch.serialize_flush().unwrap());
        assert_eq!(id, SystemPacketId::Connect);
    }

    #[tokio::test]
    async fn test_tick_times_out_connect() {
        let ch = channel();
        let now = Instant::now();
        ch.start_connecting("pw", now).unwrap();

        let actions = ch.tick(now + ch.config.connect_timeout);
        assert!(matches!(actions.as_slice(), [HandshakeAction::ConnectFailed(ConnectResult::TimedOut)]));
        assert_eq!(ch.state(), HandshakeState::Closed);
        assert_eq!(ch.connect_result(), ConnectResult::TimedOut);
    }

    #[tokio::test]
    async fn test_keepalive_cycle_and_loss_detection() {
        let ch = channel();
        let now = Instant::now();
        ch.accept_connect(77, now);

        let actions = ch.tick(now + ch.config.keepalive_interval);
        let [HandshakeAction::SendKeepAlive { trace }] = actions.as_slice() else {
            panic!("expected a keepalive, got {:?}", actions);
        };

        // delivered in time: the next due keepalive is sent normally. Queueing the
        // keepalive registers the peer as the trace's target, as the owning peer would.
        trace.add_target(addr());
        trace.mark_delivered(addr());
        let actions = ch.tick(now + 2 * ch.config.keepalive_interval);
        assert!(matches!(actions.as_slice(), [HandshakeAction::SendKeepAlive { .. }]));

        // this one is never delivered: the peer is declared lost
        let actions = ch.tick(now + 3 * ch.config.keepalive_interval);
        assert!(matches!(actions.as_slice(), [HandshakeAction::PeerLost]));
        assert_eq!(ch.state(), HandshakeState::Closed);
        assert_eq!(ch.disconnect_reason(), DisconnectReason::Unreachable);
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let ch = channel();
        ch.accept_connect(77, Instant::now());

        assert!(ch.request_disconnect(DisconnectReason::Requested));
        assert_eq!(ch.state(), HandshakeState::Closed);
        assert_eq!(ch.disconnect_reason(), DisconnectReason::Requested);

        assert!(!ch.request_disconnect(DisconnectReason::Requested));
        assert!(ch.handle_disconnect(DisconnectReason::Requested).is_none());
    }
}

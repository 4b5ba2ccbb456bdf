use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use anyhow::bail;
use bytes::Bytes;
use rustc_hash::FxHashMap;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::channels::handshake::{ConnectResult, DisconnectReason, HandshakeState};
use crate::config::NodeConfig;
use crate::delivery_trace::DeliveryTrace;
use crate::events::{EventQueue, NodeEvent, Subscribers};
use crate::listener::Listener;
use crate::peer::{Peer, PeerOutcome};
use crate::wire::{FIRST_USER_TYPE_ID, SYSTEM_CHANNEL};

/// How a message travels: buffered and retransmitted until acknowledged, or sent once and
///  forgotten.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendMethod {
    Reliable,
    Unreliable,
}

struct HostSettings {
    max_peers: usize,
    password: String,
}

/// The application-facing endpoint: the peer table, the listening sockets, the flush loop
///  and the callback surface.
///
/// A node is both server and client material - `host_on` makes it accept inbound
///  connections, `connect_to` initiates outbound ones, and the two can be combined for
///  peer-to-peer topologies.
///
/// I/O runs on background tasks, but user callbacks fire exclusively inside [`Node::sync`],
///  which the application must call on every tick of its own loop.
pub struct Node {
    config: Arc<NodeConfig>,
    peers: Mutex<FxHashMap<SocketAddr, Arc<Peer>>>,
    listeners: Mutex<FxHashMap<u16, Arc<Listener>>>,
    events: EventQueue,
    subscribers: Subscribers,
    hosting: Mutex<Option<HostSettings>>,
    closing: AtomicBool,
    flush_task: Mutex<Option<JoinHandle<()>>>,
}

impl Node {
    pub fn new(config: NodeConfig) -> anyhow::Result<Arc<Node>> {
        config.validate()?;
        let config = Arc::new(config);

        let node = Arc::new(Node {
            config: config.clone(),
            peers: Mutex::new(FxHashMap::default()),
            listeners: Mutex::new(FxHashMap::default()),
            events: EventQueue::default(),
            subscribers: Subscribers::default(),
            hosting: Mutex::new(None),
            closing: AtomicBool::new(false),
            flush_task: Mutex::new(None),
        });

        let task = tokio::spawn(Self::flush_loop(Arc::downgrade(&node), config));
        *node.flush_task.lock().unwrap() = Some(task);
        Ok(node)
    }

    /// The flush loop holds only a weak reference: dropping the last application handle to
    ///  the node ends the loop.
    async fn flush_loop(node: Weak<Node>, config: Arc<NodeConfig>) {
        let mut ticker = tokio::time::interval(config.flush_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut next_maintenance = Instant::now() + config.maintenance_interval;

        loop {
            ticker.tick().await;
            let Some(node) = node.upgrade() else {
                break;
            };

            let now = Instant::now();
            node.flush_tick(now).await;
            if now >= next_maintenance {
                next_maintenance = now + config.maintenance_interval;
                node.maintenance(now);
            }
        }
        debug!("flush loop terminated");
    }

    async fn flush_tick(&self, now: Instant) {
        for peer in self.peer_snapshot() {
            let outcomes = peer.flush(now).await;
            self.apply_outcomes(&peer, outcomes, now);
        }
    }

    /// Sweeps the peer table: active peers gone quiet past the lost timeout are declared
    ///  unreachable and removed, buffers included - retransmitting to a dead address cannot
    ///  succeed. Peers that never completed a handshake age out after the same timeout.
    ///  Other closed peers stay only while a queued goodbye awaits acknowledgement.
    fn maintenance(&self, now: Instant) {
        for peer in self.peer_snapshot() {
            if peer.is_active() && now.duration_since(peer.last_received()) > self.config.lost_timeout {
                warn!("nothing received from {:?} for {:?} - marking lost", peer.addr(), self.config.lost_timeout);
                if peer.mark_unreachable() {
                    self.events.push(NodeEvent::Disconnect(peer.addr(), DisconnectReason::Unreachable));
                }
            }
        }

        self.peers.lock().unwrap().retain(|_, peer| match peer.state() {
            HandshakeState::NotSet => now.duration_since(peer.last_received()) <= self.config.lost_timeout,
            HandshakeState::Closed => {
                peer.disconnect_reason() != DisconnectReason::Unreachable && peer.has_pending_sends()
            }
            HandshakeState::Initiating | HandshakeState::Active => true,
        });
    }

    fn peer_snapshot(&self) -> Vec<Arc<Peer>> {
        self.peers.lock().unwrap().values().cloned().collect()
    }

    fn get_or_create_peer(&self, addr: SocketAddr, listener: &Arc<Listener>) -> Arc<Peer> {
        self.peers.lock().unwrap()
            .entry(addr)
            .or_insert_with(|| {
                debug!("creating peer for {:?}", addr);
                Peer::new(addr, self.config.clone(), Arc::new(listener.socket()))
            })
            .clone()
    }

    /// Starts accepting inbound connections on the given port (0 picks an ephemeral port).
    ///  Returns the actually bound port. Hosting twice is a usage error.
    pub async fn host_on(self: &Arc<Self>, port: u16, max_peers: usize, password: &str) -> anyhow::Result<u16> {
        self.check_open()?;
        {
            let mut hosting = self.hosting.lock().unwrap();
            if hosting.is_some() {
                bail!("this node is already hosting");
            }
            *hosting = Some(HostSettings { max_peers, password: password.to_string() });
        }

        let listener = self.ensure_listener(port).await?;
        info!("hosting on port {} for up to {} peers", listener.port(), max_peers);
        Ok(listener.port())
    }

    /// Initiates a connection. Returns the resolved peer address, under which all further
    ///  events and messages from this peer are reported.
    pub async fn connect_to(self: &Arc<Self>, host: &str, port: u16, password: &str) -> anyhow::Result<SocketAddr> {
        self.check_open()?;
        let addr = tokio::net::lookup_host((host, port)).await?
            .next()
            .ok_or_else(|| anyhow::anyhow!("{}:{} does not resolve to any address", host, port))?;

        let listener = self.default_listener().await?;
        let peer = self.get_or_create_peer(addr, &listener);
        peer.start_connecting(password, Instant::now())?;
        Ok(addr)
    }

    /// Binds an additional listening socket (0 picks an ephemeral port) and returns the
    ///  bound port. Listeners are shared: asking for an already-bound port is a no-op.
    pub async fn add_listener(self: &Arc<Self>, port: u16) -> anyhow::Result<u16> {
        self.check_open()?;
        Ok(self.ensure_listener(port).await?.port())
    }

    /// Registers a peer up front, so sends can target it before any handshake traffic.
    ///  Registering an address twice is a usage error.
    pub async fn add_peer(self: &Arc<Self>, addr: SocketAddr) -> anyhow::Result<()> {
        self.check_open()?;
        let listener = self.default_listener().await?;

        let mut peers = self.peers.lock().unwrap();
        if peers.contains_key(&addr) {
            bail!("a peer at {:?} already exists", addr);
        }
        peers.insert(addr, Peer::new(addr, self.config.clone(), Arc::new(listener.socket())));
        Ok(())
    }

    /// Binds (and starts) a listener on `port` unless one is already bound to it.
    async fn ensure_listener(self: &Arc<Self>, port: u16) -> anyhow::Result<Arc<Listener>> {
        if port != 0 {
            if let Some(listener) = self.listeners.lock().unwrap().get(&port) {
                return Ok(listener.clone());
            }
        }
        let listener = Listener::bind(port).await?;
        listener.start(Arc::downgrade(self));
        self.listeners.lock().unwrap().insert(listener.port(), listener.clone());
        Ok(listener)
    }

    /// Some listener to send from, binding an ephemeral one if none exists yet.
    async fn default_listener(self: &Arc<Self>) -> anyhow::Result<Arc<Listener>> {
        let existing = self.listeners.lock().unwrap().values().next().cloned();
        match existing {
            Some(listener) => Ok(listener),
            None => self.ensure_listener(0).await,
        }
    }

    pub fn send_reliable(&self, type_id: u8, payload: &[u8], channel: u8,
            target: Option<SocketAddr>, except: Option<SocketAddr>) -> anyhow::Result<()> {
        self.send_internal(type_id, payload, channel, SendMethod::Reliable, target, except, None)
    }

    /// Like [`Node::send_reliable`], but returns a trace that resolves once every targeted
    ///  peer acknowledged the message (all fragments included).
    pub fn send_reliable_traced(&self, type_id: u8, payload: &[u8], channel: u8,
            target: Option<SocketAddr>, except: Option<SocketAddr>) -> anyhow::Result<Arc<DeliveryTrace>> {
        let trace = DeliveryTrace::new();
        self.send_internal(type_id, payload, channel, SendMethod::Reliable, target, except, Some(&trace))?;
        Ok(trace)
    }

    pub fn send_unreliable(&self, type_id: u8, payload: &[u8],
            target: Option<SocketAddr>, except: Option<SocketAddr>) -> anyhow::Result<()> {
        self.send_internal(type_id, payload, 0, SendMethod::Unreliable, target, except, None)
    }

    fn send_internal(&self, type_id: u8, payload: &[u8], channel: u8, method: SendMethod,
            target: Option<SocketAddr>, except: Option<SocketAddr>,
            trace: Option<&Arc<DeliveryTrace>>) -> anyhow::Result<()> {
        self.check_open()?;
        if type_id < FIRST_USER_TYPE_ID {
            bail!("type id {} is reserved for protocol-internal messages", type_id);
        }
        if method == SendMethod::Reliable && channel == SYSTEM_CHANNEL {
            bail!("channel {} is reserved for protocol-internal messages", SYSTEM_CHANNEL);
        }
        if method == SendMethod::Unreliable && payload.len() > self.config.max_unreliable_payload() {
            bail!("unreliable payload of {} bytes exceeds the limit of {}",
                payload.len(), self.config.max_unreliable_payload());
        }
        if method == SendMethod::Reliable && payload.len() > self.config.max_reliable_payload() {
            bail!("reliable payload of {} bytes exceeds the limit of {}",
                payload.len(), self.config.max_reliable_payload());
        }

        // one copy, shared by every targeted peer's send buffer; the caller may reuse its
        // buffer the moment this returns
        let payload = Bytes::copy_from_slice(payload);

        let targets = match target {
            Some(addr) => {
                let Some(peer) = self.peers.lock().unwrap().get(&addr).cloned() else {
                    bail!("no peer at {:?}", addr);
                };
                vec![peer]
            }
            None => self.peer_snapshot().into_iter()
                .filter(|p| p.is_active() && Some(p.addr()) != except)
                .collect(),
        };

        for peer in targets {
            peer.send(type_id, payload.clone(), channel, method, trace);
        }
        Ok(())
    }

    /// Closes the connection to `addr` and queues a goodbye message. The returned trace
    ///  resolves once the peer acknowledged the goodbye.
    pub fn disconnect(&self, addr: SocketAddr) -> Option<Arc<DeliveryTrace>> {
        self.disconnect_with_reason(addr, DisconnectReason::Requested)
    }

    /// Host-side removal of a peer; the peer learns it was kicked rather than asked to
    ///  leave.
    pub fn kick(&self, addr: SocketAddr) -> Option<Arc<DeliveryTrace>> {
        self.disconnect_with_reason(addr, DisconnectReason::Kicked)
    }

    fn disconnect_with_reason(&self, addr: SocketAddr, reason: DisconnectReason) -> Option<Arc<DeliveryTrace>> {
        let peer = self.peers.lock().unwrap().get(&addr).cloned()?;
        let trace = peer.disconnect(reason)?;
        self.events.push(NodeEvent::Disconnect(addr, reason));
        Some(trace)
    }

    /// Drains queued events and inbox messages, invoking the subscribed callbacks. This is
    ///  the only place user code runs; call it on every application tick.
    pub fn sync(&self) {
        for event in self.events.drain() {
            self.subscribers.emit(&event);
        }
        for peer in self.peer_snapshot() {
            for msg in peer.drain_inboxes() {
                self.subscribers.emit_message(msg.type_id, &msg.payload, msg.from, msg.channel);
            }
        }
    }

    pub fn on_connect(&self, f: impl Fn(SocketAddr, ConnectResult) + Send + Sync + 'static) {
        self.subscribers.subscribe_connect(Box::new(f));
    }

    pub fn on_disconnect(&self, f: impl Fn(SocketAddr, DisconnectReason) + Send + Sync + 'static) {
        self.subscribers.subscribe_disconnect(Box::new(f));
    }

    /// `(type id, payload, sender address, channel)` for every delivered user message.
    pub fn on_message(&self, f: impl Fn(u8, &[u8], SocketAddr, u8) + Send + Sync + 'static) {
        self.subscribers.subscribe_message(Box::new(f));
    }

    pub fn on_reception_error(&self, f: impl Fn(i32) + Send + Sync + 'static) {
        self.subscribers.subscribe_reception_error(Box::new(f));
    }

    pub fn connected_peers(&self) -> Vec<SocketAddr> {
        self.peers.lock().unwrap().values()
            .filter(|p| p.is_active())
            .map(|p| p.addr())
            .collect()
    }

    pub fn is_connected(&self, addr: SocketAddr) -> bool {
        self.peers.lock().unwrap().get(&addr).is_some_and(|p| p.is_active())
    }

    /// Drop one in `n` inbound datagrams on all listeners, to exercise loss handling.
    pub fn set_simulated_loss(&self, one_in: Option<u32>) {
        for listener in self.listeners.lock().unwrap().values() {
            listener.set_simulated_loss(one_in);
        }
    }

    /// Graceful teardown: disconnects every peer, waits (bounded by the configured linger)
    ///  for the goodbyes to be acknowledged, then stops all background tasks. The node is
    ///  unusable afterwards.
    pub async fn shutdown(&self) {
        if self.closing.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("shutting down");

        let mut traces = Vec::new();
        for peer in self.peer_snapshot() {
            if let Some(trace) = peer.disconnect(DisconnectReason::Requested) {
                self.events.push(NodeEvent::Disconnect(peer.addr(), DisconnectReason::Requested));
                traces.push(trace);
            }
        }

        // the flush task is still running and retransmits the goodbyes until they are
        // acknowledged or the linger budget is spent
        let deadline = Instant::now() + self.config.disconnect_linger;
        for trace in traces {
            trace.wait_all(deadline.duration_since(Instant::now())).await;
        }

        if let Some(task) = self.flush_task.lock().unwrap().take() {
            task.abort();
        }
        for listener in self.listeners.lock().unwrap().values() {
            listener.stop();
        }
        self.peers.lock().unwrap().clear();
    }

    pub(crate) fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    fn check_open(&self) -> anyhow::Result<()> {
        if self.is_closing() {
            bail!("this node is shut down");
        }
        Ok(())
    }

    /// Receive-path entry point, called by a listener for every inbound datagram.
    pub(crate) async fn on_datagram(&self, listener: &Arc<Listener>, from: SocketAddr, buf: Bytes) {
        let peer = self.get_or_create_peer(from, listener);
        match peer.on_datagram(buf).await {
            Ok(outcomes) => self.apply_outcomes(&peer, outcomes, Instant::now()),
            Err(e) => debug!("dropping malformed datagram from {:?}: {}", from, e),
        }
    }

    fn apply_outcomes(&self, peer: &Arc<Peer>, outcomes: Vec<PeerOutcome>, now: Instant) {
        for outcome in outcomes {
            match outcome {
                PeerOutcome::ConnectRequested { password, initiator_id } => {
                    self.decide_connect(peer, &password, initiator_id, now);
                }
                PeerOutcome::Connected(result) => {
                    self.events.push(NodeEvent::Connect(peer.addr(), result));
                }
                PeerOutcome::Disconnected(reason) => {
                    self.events.push(NodeEvent::Disconnect(peer.addr(), reason));
                }
            }
        }
    }

    /// The node-wide verdict on an inbound `Connect`: password and capacity when hosting,
    ///  or the simultaneous-connect case when both sides dialed each other.
    fn decide_connect(&self, peer: &Arc<Peer>, password: &str, initiator_id: u32, now: Instant) {
        let verdict = {
            let hosting = self.hosting.lock().unwrap();
            match &*hosting {
                Some(settings) => {
                    if settings.password != password {
                        Err(ConnectResult::InvalidPw)
                    } else if self.active_peer_count() >= settings.max_peers {
                        Err(ConnectResult::MaxUsers)
                    } else {
                        Ok(())
                    }
                }
                // not hosting: the only legitimate inbound connect crosses our own
                // outbound attempt to the same peer
                None if peer.state() == HandshakeState::Initiating => Ok(()),
                None => {
                    debug!("ignoring connect from {:?}: not hosting and no attempt of our own", peer.addr());
                    return;
                }
            }
        };

        match verdict {
            Ok(()) => {
                if let Some(result) = peer.accept_connect(initiator_id, now) {
                    self.events.push(NodeEvent::Connect(peer.addr(), result));
                }
            }
            Err(result) => peer.reject_connect(initiator_id, result),
        }
    }

    fn active_peer_count(&self) -> usize {
        self.peers.lock().unwrap().values().filter(|p| p.is_active()).count()
    }

    pub(crate) fn report_reception_error(&self, e: &std::io::Error) {
        self.events.push(NodeEvent::ReceptionError(e.raw_os_error().unwrap_or(-1)));
    }
}

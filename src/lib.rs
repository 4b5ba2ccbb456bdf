//! Peerlink is a peer-to-peer datagram transport that layers connection semantics, reliable
//!  ordered delivery and best-effort delivery on top of a raw UDP socket. It is aimed at
//!  low-latency applications (real-time simulation, multiplayer state replication) that want
//!  finer control than a stream transport offers: multiple independent logical channels per
//!  peer, per-message choice of reliability, and an explicit connection lifecycle.
//!
//! ## Design goals
//!
//! * Peer-to-peer without a hard server/client split - every node has a listening UDP socket,
//!   and both sides of a pair may initiate a connection at the same time
//! * The abstraction is sending / receiving *messages* (defined-length chunks of data tagged
//!   with a one-byte type id) rather than byte streams
//! * Per-peer *channels*: each channel number is an independently ordered reliable stream;
//!   nothing is promised across channels
//! * Reliable channels guarantee in-order, exactly-once application of messages regardless of
//!   loss, duplication and reordering on the wire. Retransmission is implicit: every
//!   unacknowledged message is re-sent on every flush tick until a cumulative ack retires it
//! * Messages bigger than one frame are fragmented by the protocol and reassembled on the
//!   receiving side - never by IP-level fragmentation
//! * A handshake bootstraps a pair of random connection ids before any other channel accepts
//!   data, so stale or spoofed traffic from a previous connection at the same address is
//!   rejected
//! * User callbacks run exclusively inside `Node::sync` on the caller's task, giving the
//!   application single-threaded callback semantics despite multi-threaded I/O
//!
//! Explicit non-goals: congestion control, bandwidth estimation, NAT traversal, encryption,
//!  ordering across channels.
//!
//! ## Wire format
//!
//! All integers are little-endian. Every datagram starts with a one-byte stream discriminator
//!  followed by the sender's connection id:
//!
//! ```ascii
//! reliable data (0):
//!  0: discriminator (u8)
//!  1: connection id (u32)
//!  5: channel number (u8)
//!  6: sequence number of the first message in this datagram (u32)
//! 10: repeated, one entry per buffered message in sequence order:
//!      fragment role (u8) - 0 means "already acknowledged, skipped"; the entry ends here
//!      type id (u8)
//!      payload length (u16)
//!      payload bytes
//!
//! reliable ack (1):
//!  0: discriminator (u8)
//!  1: connection id (u32)
//!  5: channel number (u8)
//!  6: first acknowledged sequence number (u32)
//! 10: number of consecutively acknowledged sequences (u8)
//!
//! unreliable data (2) and handshake data (3):
//!  0: discriminator (u8)
//!  1: connection id (u32)
//!  5: sequence number of the first message in this datagram (u32)
//!  9: repeated:
//!      type id (u8)
//!      is-system flag (u8)
//!      payload length (u16)
//!      payload bytes
//! ```
//!
//! A datagram never exceeds the configured frame size (close to one Ethernet MTU), and a
//!  reliable datagram never carries more than 255 entries because the corresponding ack
//!  counts positions with a single byte.
//!
//! ## Connection lifecycle
//!
//! The handshake channel reuses the unreliable framing but is routed by connection state
//!  rather than by channel number. `Connect` carries the initiator's connection id (in the
//!  header) and a password; the acceptor checks capacity and password and answers
//!  `ConnectAccepted` (reflecting the initiator's id next to its own), `ConnectInvalidPw` or
//!  `ConnectMaxUsers`. Connect frames are re-sent periodically until resolved or timed out.
//!  Once `Active`, a traced reliable keepalive doubles as loss detection: if one keepalive
//!  interval passes without the previous keepalive being acknowledged, the peer is declared
//!  unreachable. Disconnects are reliable messages whose delivery can be traced, so teardown
//!  can wait (bounded) until every peer has seen the goodbye.

pub mod config;
pub mod delivery_trace;
pub mod node;

pub(crate) mod channels;
pub(crate) mod events;
pub(crate) mod listener;
pub(crate) mod peer;
pub(crate) mod send_socket;
pub(crate) mod sequence;
pub(crate) mod wire;

pub use channels::handshake::{ConnectResult, DisconnectReason};
pub use config::NodeConfig;
pub use delivery_trace::DeliveryTrace;
pub use node::{Node, SendMethod};
pub use wire::{FIRST_USER_TYPE_ID, SYSTEM_CHANNEL};

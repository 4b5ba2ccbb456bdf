use std::net::SocketAddr;

use bytes::Bytes;

use crate::wire::SystemPacketId;

pub mod handshake;
pub mod reliable;
pub mod unreliable;

/// A fully validated, ordered, reassembled message sitting in a channel's inbox, waiting for
///  the application to drain it via `Node::sync`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadyMessage {
    pub type_id: u8,
    pub payload: Bytes,
    pub from: SocketAddr,
    pub channel: u8,
}

/// One message released by a channel's receive path, in delivery order. System messages must
///  be acted on inline on the receive path (before anything later in the same stream is
///  released), user messages go to the channel inbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Promoted {
    User(ReadyMessage),
    System { id: SystemPacketId, payload: Bytes },
}

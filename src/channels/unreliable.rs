use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Mutex;

use anyhow::bail;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tracing::{debug, warn};

use crate::channels::{Promoted, ReadyMessage};
use crate::sequence::SequenceNr;
use crate::wire;
use crate::wire::{StreamKind, SystemPacketId};

/// Fire-and-forget channel: messages are sent once, with a sequence number so the receiver
///  can discard datagrams that arrive out of order, and are never retransmitted.
///
/// Sequence numbers work on whole datagrams here: a datagram whose first sequence number is
///  older than what the receiver has already seen is discarded in its entirety, and an
///  accepted datagram advances the expectation past all messages it carried. Within one
///  flush the message order is therefore preserved; across flushes, late datagrams are
///  dropped rather than reordered.
///
/// The handshake runs on a second instance of this channel with its own discriminator (see
///  [`StreamKind::HandshakeData`]), so `Connect` traffic is accepted before any connection
///  state exists.
pub struct UnreliableChannel {
    kind: StreamKind,
    peer_addr: SocketAddr,
    max_frame_size: usize,
    send: Mutex<SendState>,
    recv: Mutex<RecvState>,
    inbox: Mutex<VecDeque<ReadyMessage>>,
}

struct SendState {
    next_seq: SequenceNr,
    queue: VecDeque<QueuedMessage>,
}

struct QueuedMessage {
    type_id: u8,
    is_system: bool,
    payload: Bytes,
}

struct RecvState {
    /// the next sequence number we are willing to accept as the start of a datagram
    expected: SequenceNr,
}

impl UnreliableChannel {
    pub fn new(kind: StreamKind, peer_addr: SocketAddr, max_frame_size: usize) -> UnreliableChannel {
        debug_assert!(matches!(kind, StreamKind::UnreliableData | StreamKind::HandshakeData));
        UnreliableChannel {
            kind,
            peer_addr,
            max_frame_size,
            send: Mutex::new(SendState {
                next_seq: SequenceNr::ZERO,
                queue: VecDeque::new(),
            }),
            recv: Mutex::new(RecvState {
                expected: SequenceNr::ZERO,
            }),
            inbox: Mutex::new(VecDeque::new()),
        }
    }

    /// Queues a message for the next flush. The caller has checked the payload against the
    ///  frame size already.
    pub fn add_message(&self, type_id: u8, is_system: bool, payload: Bytes) {
        let mut send = self.send.lock().unwrap();
        send.queue.push_back(QueuedMessage { type_id, is_system, payload });
    }

    pub fn has_pending_sends(&self) -> bool {
        !self.send.lock().unwrap().queue.is_empty()
    }

    /// Serializes queued messages into a single datagram, or `None` if nothing is queued.
    ///  Messages that do not fit the frame are dropped, not carried over: by the next flush
    ///  they would be stale anyway.
    pub fn serialize_flush(&self, conn_id: u32) -> Option<BytesMut> {
        let mut send = self.send.lock().unwrap();
        if send.queue.is_empty() {
            return None;
        }

        let mut buf = BytesMut::with_capacity(self.max_frame_size);
        wire::put_sequenced_data_header(&mut buf, self.kind, conn_id, send.next_seq);

        while let Some(msg) = send.queue.front() {
            if buf.len() + wire::SEQUENCED_ENTRY_OVERHEAD + msg.payload.len() > self.max_frame_size {
                break;
            }
            let msg = send.queue.pop_front().unwrap();
            buf.put_u8(msg.type_id);
            buf.put_u8(msg.is_system as u8);
            buf.put_u16_le(msg.payload.len() as u16);
            buf.put_slice(&msg.payload);
            send.next_seq.fetch_increment();
        }

        if !send.queue.is_empty() {
            debug!("dropping {} unreliable messages for {:?} that did not fit the frame",
                send.queue.len(), self.peer_addr);
            // dropped messages still consume their sequence numbers
            for _ in 0..send.queue.len() {
                send.next_seq.fetch_increment();
            }
            send.queue.clear();
        }

        Some(buf)
    }

    /// Parses a received datagram (after discriminator and conn id). A datagram that starts
    ///  at an already-superseded sequence number is discarded whole; an accepted datagram's
    ///  messages are returned in order.
    pub fn receive_data(&self, buf: &mut impl Buf) -> anyhow::Result<Vec<Promoted>> {
        let mut recv = self.recv.lock().unwrap();

        let first_seq = SequenceNr::from_raw(buf.try_get_u32_le()?);
        let is_fresh = first_seq.is_newer_than(recv.expected);

        let mut promoted = Vec::new();
        let mut count = 0u32;
        while buf.has_remaining() {
            let type_id = buf.try_get_u8()?;
            let is_system = buf.try_get_u8()? != 0;
            let len = buf.try_get_u16_le()? as usize;
            if buf.remaining() < len {
                bail!("truncated message in datagram from {:?}", self.peer_addr);
            }

            if is_fresh {
                let payload = buf.copy_to_bytes(len);
                promoted.push(self.promote(type_id, is_system, payload));
            } else {
                buf.advance(len);
            }
            count += 1;
        }

        if is_fresh {
            recv.expected = first_seq.plus(count);
        } else {
            debug!("discarding stale datagram from {:?}: first seq {} is older than expected {}",
                self.peer_addr, first_seq, recv.expected);
        }
        Ok(promoted)
    }

    fn promote(&self, type_id: u8, is_system: bool, payload: Bytes) -> Promoted {
        if is_system {
            match SystemPacketId::try_from(type_id) {
                Ok(id) => Promoted::System { id, payload },
                Err(_) => {
                    warn!("unknown system packet id {} from {:?} - treating as user message", type_id, self.peer_addr);
                    Promoted::User(self.ready(type_id, payload))
                }
            }
        } else {
            Promoted::User(self.ready(type_id, payload))
        }
    }

    fn ready(&self, type_id: u8, payload: Bytes) -> ReadyMessage {
        ReadyMessage {
            type_id,
            payload,
            from: self.peer_addr,
            // no user channel applies to unreliable deliveries; the reserved number marks that
            channel: wire::SYSTEM_CHANNEL,
        }
    }

    pub fn push_ready(&self, msg: ReadyMessage) {
        self.inbox.lock().unwrap().push_back(msg);
    }

    pub fn drain_inbox(&self) -> Vec<ReadyMessage> {
        self.inbox.lock().unwrap().drain(..).collect()
    }
}

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use anyhow::bail;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use rustc_hash::FxHashMap;
use tracing::{debug, trace, warn};

use crate::channels::{Promoted, ReadyMessage};
use crate::config::NodeConfig;
use crate::delivery_trace::DeliveryTrace;
use crate::sequence::SequenceNr;
use crate::wire;
use crate::wire::{FragmentRole, ReliableAck, SystemPacketId, FRAGMENT_SKIP_MARKER, SYSTEM_CHANNEL};

/// A reliable, ordered channel to one peer.
///
/// The send side keeps every message in a buffer until it is acknowledged, and retransmits
///  the whole unacknowledged window on every flush tick; already-acknowledged messages in the
///  middle of the window are replaced by a one-byte skip marker so the receiver can keep
///  counting sequence numbers without getting the data again.
///
/// The receive side buffers out-of-order messages, acknowledges everything it has (even
///  duplicates, so the sender's retransmission loop terminates), and releases messages
///  strictly in sequence order, reassembling fragmented payloads once all their fragments
///  are buffered.
pub struct ReliableChannel {
    channel: u8,
    peer_addr: SocketAddr,
    config: Arc<NodeConfig>,
    send: Mutex<SendState>,
    recv: Mutex<RecvState>,
    inbox: Mutex<VecDeque<ReadyMessage>>,
}

struct SendState {
    next_seq: SequenceNr,
    /// unacknowledged messages, contiguous by sequence number, front is the oldest
    buffer: VecDeque<PendingSend>,
}

struct PendingSend {
    seq: SequenceNr,
    frag: FragmentRole,
    type_id: u8,
    payload: Bytes,
    trace: Option<Arc<DeliveryTrace>>,
    acked: bool,
}

struct RecvState {
    /// the sequence number the next released message must have
    expected: SequenceNr,
    /// received ahead of order, keyed by raw sequence number
    pending: FxHashMap<u32, PendingRecv>,
}

struct PendingRecv {
    frag: FragmentRole,
    type_id: u8,
    payload: Bytes,
}

/// What a walk over the fragment run starting at the expected sequence number found.
enum FragmentRun {
    /// the sequence number of the run's `End` fragment
    Complete(SequenceNr),
    Incomplete,
    Oversized,
}

impl ReliableChannel {
    pub fn new(channel: u8, peer_addr: SocketAddr, config: Arc<NodeConfig>) -> ReliableChannel {
        ReliableChannel {
            channel,
            peer_addr,
            config,
            send: Mutex::new(SendState {
                next_seq: SequenceNr::ZERO,
                buffer: VecDeque::new(),
            }),
            recv: Mutex::new(RecvState {
                expected: SequenceNr::ZERO,
                pending: FxHashMap::default(),
            }),
            inbox: Mutex::new(VecDeque::new()),
        }
    }

    /// Queues a message for reliable delivery, splitting it into fragments if it exceeds
    ///  what fits into one datagram. With a trace, every fragment gets its own chained trace
    ///  so "delivered" means all fragments were acknowledged.
    pub fn add_message(&self, type_id: u8, payload: Bytes, trace: Option<&Arc<DeliveryTrace>>) {
        let max_fragment = self.config.max_fragment_payload();
        let mut send = self.send.lock().unwrap();

        if payload.len() <= max_fragment {
            let seq = send.next_seq.fetch_increment();
            send.buffer.push_back(PendingSend {
                seq,
                frag: FragmentRole::Whole,
                type_id,
                payload,
                trace: self.target_trace(trace.cloned()),
                acked: false,
            });
            return;
        }

        let mut offset = 0;
        let mut fragment_trace = trace.cloned();
        while offset < payload.len() {
            let end = (offset + max_fragment).min(payload.len());
            let frag = if offset == 0 {
                FragmentRole::Begin
            } else if end == payload.len() {
                FragmentRole::End
            } else {
                FragmentRole::Middle
            };

            let seq = send.next_seq.fetch_increment();
            send.buffer.push_back(PendingSend {
                seq,
                frag,
                type_id,
                payload: payload.slice(offset..end),
                trace: self.target_trace(fragment_trace.clone()),
                acked: false,
            });

            if frag != FragmentRole::End {
                fragment_trace = fragment_trace.map(|t| t.chain_next());
            }
            offset = end;
        }
    }

    fn target_trace(&self, trace: Option<Arc<DeliveryTrace>>) -> Option<Arc<DeliveryTrace>> {
        if let Some(trace) = &trace {
            trace.add_target(self.peer_addr);
        }
        trace
    }

    pub fn has_pending_sends(&self) -> bool {
        !self.send.lock().unwrap().buffer.is_empty()
    }

    /// Serializes the unacknowledged window into one datagram, or `None` if the buffer is
    ///  empty. Acknowledged messages inside the window become skip markers. The datagram is
    ///  capped by the frame size and by the 255 sequence positions one ack can cover.
    pub fn serialize_flush(&self, conn_id: u32) -> Option<BytesMut> {
        let send = self.send.lock().unwrap();
        let first = send.buffer.front()?;
        debug_assert!(!first.acked, "acknowledged messages are retired from the buffer front");

        let mut buf = BytesMut::with_capacity(self.config.max_frame_size);
        wire::put_reliable_data_header(&mut buf, conn_id, self.channel, first.seq);

        let mut count = 0u32;
        for msg in &send.buffer {
            debug_assert_eq!(msg.seq, first.seq.plus(count));
            if count == 255 {
                break;
            }
            let entry_len = if msg.acked {
                1
            } else {
                wire::RELIABLE_ENTRY_OVERHEAD + msg.payload.len()
            };
            if buf.len() + entry_len > self.config.max_frame_size {
                break;
            }

            if msg.acked {
                buf.put_u8(FRAGMENT_SKIP_MARKER);
            } else {
                buf.put_u8(msg.frag.into());
                buf.put_u8(msg.type_id);
                buf.put_u16_le(msg.payload.len() as u16);
                buf.put_slice(&msg.payload);
            }
            count += 1;
        }

        trace!("flushing {} reliable messages on channel {} to {:?}, starting at seq {}",
            count, self.channel, self.peer_addr, first.seq);
        Some(buf)
    }

    /// Parses a received data datagram (after discriminator, conn id and channel number),
    ///  buffers what is new, and releases everything that is now in order.
    ///
    /// The returned ack covers every sequence position the datagram carried - including
    ///  positions that were stale duplicates, because the sender keeps retransmitting until
    ///  it hears an ack.
    pub fn receive_data(&self, buf: &mut impl Buf) -> anyhow::Result<(Option<ReliableAck>, Vec<Promoted>)> {
        let mut recv = self.recv.lock().unwrap();

        let first_seq = SequenceNr::from_raw(buf.try_get_u32_le()?);
        let mut seq = first_seq;
        while buf.has_remaining() {
            let role_byte = buf.try_get_u8()?;
            if role_byte == FRAGMENT_SKIP_MARKER {
                seq.fetch_increment();
                continue;
            }

            let frag = FragmentRole::try_from(role_byte)
                .map_err(|_| anyhow::anyhow!("invalid fragment role {}", role_byte))?;
            let type_id = buf.try_get_u8()?;
            let len = buf.try_get_u16_le()? as usize;
            if buf.remaining() < len {
                bail!("truncated message in datagram from {:?}", self.peer_addr);
            }

            let is_new = seq.is_newer_than(recv.expected) && !recv.pending.contains_key(&seq.to_raw());
            if is_new {
                let payload = buf.copy_to_bytes(len);
                recv.pending.insert(seq.to_raw(), PendingRecv { frag, type_id, payload });
            } else {
                buf.advance(len);
            }
            seq.fetch_increment();
        }

        let count = seq.minus(first_seq);
        if count > 255 {
            bail!("datagram from {:?} covers {} sequence positions, more than one ack can express",
                self.peer_addr, count);
        }
        let ack = (count > 0).then_some(ReliableAck {
            channel: self.channel,
            first_seq,
            count: count as u8,
        });

        let promoted = self.promote_in_order(&mut recv);
        Ok((ack, promoted))
    }

    /// Releases buffered messages starting at `expected`, for as long as the sequence is
    ///  unbroken; fragmented messages are only released once their `End` fragment is
    ///  buffered.
    fn promote_in_order(&self, recv: &mut RecvState) -> Vec<Promoted> {
        let mut promoted = Vec::new();
        loop {
            let Some(head) = recv.pending.get(&recv.expected.to_raw()) else {
                break;
            };

            match head.frag {
                FragmentRole::Whole => {
                    let msg = recv.pending.remove(&recv.expected.to_raw()).unwrap();
                    recv.expected.fetch_increment();
                    promoted.push(self.promote(msg.type_id, msg.payload));
                }
                FragmentRole::Begin => {
                    let end = match self.find_fragment_end(recv) {
                        FragmentRun::Incomplete => break,
                        FragmentRun::Oversized => {
                            warn!("fragment run at seq {} from {:?} on channel {} exceeds {} fragments - discarding",
                                recv.expected, self.peer_addr, self.channel, self.config.max_message_fragments);
                            self.discard_fragment_run(recv);
                            continue;
                        }
                        FragmentRun::Complete(end) => end,
                    };
                    let type_id = head.type_id;
                    let mut payload = BytesMut::new();
                    loop {
                        let seq = recv.expected.fetch_increment();
                        let msg = recv.pending.remove(&seq.to_raw()).unwrap();
                        payload.put_slice(&msg.payload);
                        if seq == end {
                            break;
                        }
                    }
                    promoted.push(self.promote(type_id, payload.freeze()));
                }
                frag @ (FragmentRole::Middle | FragmentRole::End) => {
                    // can only happen with a sender that violates the protocol
                    warn!("dangling {:?} fragment at seq {} from {:?} on channel {} - discarding",
                        frag, recv.expected, self.peer_addr, self.channel);
                    recv.pending.remove(&recv.expected.to_raw());
                    recv.expected.fetch_increment();
                }
            }
        }
        promoted
    }

    /// Looks for the `End` fragment of the fragment run starting at `expected`, giving up
    ///  once the run exceeds the configured fragment cap.
    fn find_fragment_end(&self, recv: &RecvState) -> FragmentRun {
        let mut seq = recv.expected.next();
        for _ in 1..self.config.max_message_fragments {
            match recv.pending.get(&seq.to_raw()) {
                None => return FragmentRun::Incomplete,
                Some(msg) if msg.frag == FragmentRole::End => return FragmentRun::Complete(seq),
                Some(_) => {
                    seq.fetch_increment();
                }
            }
        }
        FragmentRun::Oversized
    }

    /// Drops the buffered fragments of an over-long run, advancing past them. Fragments of
    ///  the run that arrive later become dangling and are discarded one by one.
    fn discard_fragment_run(&self, recv: &mut RecvState) {
        while let Some(msg) = recv.pending.remove(&recv.expected.to_raw()) {
            recv.expected.fetch_increment();
            if msg.frag == FragmentRole::End {
                break;
            }
        }
    }

    fn promote(&self, type_id: u8, payload: Bytes) -> Promoted {
        if self.channel == SYSTEM_CHANNEL {
            match SystemPacketId::try_from(type_id) {
                Ok(id) => return Promoted::System { id, payload },
                Err(_) => {
                    warn!("unknown system packet id {} from {:?} - treating as user message",
                        type_id, self.peer_addr);
                }
            }
        }
        Promoted::User(ReadyMessage {
            type_id,
            payload,
            from: self.peer_addr,
            channel: self.channel,
        })
    }

    /// Marks the acknowledged range and retires the contiguous acknowledged prefix of the
    ///  send buffer, fulfilling delivery traces as messages leave the buffer.
    pub fn receive_ack(&self, ack: ReliableAck) {
        let mut send = self.send.lock().unwrap();
        let Some(front) = send.buffer.front() else {
            return;
        };
        // strictly below the window floor means everything it covers was already retired
        if !ack.first_seq.is_newer_than(front.seq) {
            trace!("stale ack on channel {} from {:?}: first seq {} is below the window at {}",
                self.channel, self.peer_addr, ack.first_seq, front.seq);
            return;
        }

        let offset = ack.first_seq.minus(front.seq) as usize;
        let len = send.buffer.len();
        let upper = (offset + ack.count as usize).min(len);
        for msg in send.buffer.range_mut(offset.min(len)..upper) {
            msg.acked = true;
        }

        while let Some(front) = send.buffer.front() {
            if !front.acked {
                break;
            }
            let msg = send.buffer.pop_front().unwrap();
            if let Some(trace) = msg.trace {
                trace.mark_delivered(self.peer_addr);
            }
        }
        if send.buffer.is_empty() {
            debug!("all reliable messages on channel {} to {:?} acknowledged", self.channel, self.peer_addr);
        }
    }

    pub fn push_ready(&self, msg: ReadyMessage) {
        self.inbox.lock().unwrap().push_back(msg);
    }

    pub fn drain_inbox(&self) -> Vec<ReadyMessage> {
        self.inbox.lock().unwrap().drain(..).collect()
    }
}

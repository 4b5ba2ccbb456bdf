use std::time::Duration;

use anyhow::bail;

use crate::wire;

/// All tunables of a node. [`NodeConfig::default_lan`] is a starting point that works for
///  typical LAN / localhost setups; applications on constrained links should mainly revisit
///  [`NodeConfig::max_frame_size`].
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// The biggest datagram the protocol will hand to the UDP socket. A full Ethernet frame
    ///  carries 1500 bytes; 100 are left as slack for IP/UDP headers and surprises in other
    ///  layers, so the default is 1400. Choosing this too big risks IP-level fragmentation or
    ///  silently dropped packets - the protocol never fragments at the IP level, it fragments
    ///  *messages* itself and keeps every datagram under this limit.
    pub max_frame_size: usize,

    /// Upper bound on how many fragments a single reliable message may be split into, which
    ///  caps the message size at `max_message_fragments * max_fragment_payload()`. Bigger
    ///  sends are rejected at the call; an inbound fragment run exceeding the bound is a
    ///  protocol violation and is discarded.
    pub max_message_fragments: usize,

    /// Interval of the flush loop that serializes and transmits pending data for every peer.
    ///  This is also the implicit retransmission interval of reliable channels: an
    ///  unacknowledged message is re-sent on every tick.
    pub flush_interval: Duration,

    /// How often an unanswered `Connect` frame is re-sent while a connection attempt is in
    ///  flight.
    pub connect_attempt_interval: Duration,

    /// How long a connection attempt may stay unresolved before it fails with a timed-out
    ///  result.
    pub connect_timeout: Duration,

    /// Interval of the traced reliable keepalive sent to every active peer. A keepalive that
    ///  is still unacknowledged when the next one is due marks the peer unreachable - loss
    ///  detection piggybacks on the reliable ack machinery, there is no separate ping
    ///  protocol.
    pub keepalive_interval: Duration,

    /// A peer from which nothing was received for this long is removed and reported
    ///  unreachable.
    pub lost_timeout: Duration,

    /// How often the lost-peer sweep runs at most.
    pub maintenance_interval: Duration,

    /// Upper bound on how long teardown waits for traced `Disconnect` deliveries before
    ///  closing the sockets regardless.
    pub disconnect_linger: Duration,
}

impl NodeConfig {
    pub fn default_lan() -> NodeConfig {
        NodeConfig {
            max_frame_size: 1400,
            max_message_fragments: 64,
            flush_interval: Duration::from_millis(30),
            connect_attempt_interval: Duration::from_millis(300),
            connect_timeout: Duration::from_secs(20),
            keepalive_interval: Duration::from_secs(5),
            lost_timeout: Duration::from_secs(12),
            maintenance_interval: Duration::from_secs(2),
            disconnect_linger: Duration::from_millis(1000),
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_frame_size < 2 * wire::RELIABLE_DATA_HEADER_LEN + 2 * wire::RELIABLE_ENTRY_OVERHEAD {
            bail!("max frame size {} is too small to carry any message", self.max_frame_size);
        }
        if self.max_frame_size > 65507 {
            bail!("max frame size {} exceeds what fits in a UDP datagram", self.max_frame_size);
        }
        if self.max_message_fragments == 0 {
            bail!("a message needs at least one fragment");
        }
        if self.flush_interval.is_zero() {
            bail!("flush interval must be non-zero");
        }
        if self.connect_timeout < self.connect_attempt_interval {
            bail!("connect timeout is shorter than a single connect attempt interval");
        }
        Ok(())
    }

    /// The biggest payload a single reliable message (or message fragment) may carry and
    ///  still fit a datagram together with its headers. Bigger reliable payloads are split
    ///  into fragments of exactly this size (except the last); bigger unreliable payloads
    ///  are rejected.
    pub fn max_fragment_payload(&self) -> usize {
        self.max_frame_size - wire::RELIABLE_DATA_HEADER_LEN - wire::RELIABLE_ENTRY_OVERHEAD
    }

    /// The biggest payload an unreliable message may carry. Unreliable messages are never
    ///  fragmented, so this is a hard limit enforced at the send call.
    pub fn max_unreliable_payload(&self) -> usize {
        self.max_frame_size - wire::SEQUENCED_DATA_HEADER_LEN - wire::SEQUENCED_ENTRY_OVERHEAD
    }

    /// The biggest payload a reliable message may carry across all its fragments.
    pub fn max_reliable_payload(&self) -> usize {
        self.max_message_fragments * self.max_fragment_payload()
    }
}

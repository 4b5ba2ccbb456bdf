use anyhow::bail;
use bytes::{Buf, BufMut, BytesMut};
use bytes_varint::{VarIntSupport, VarIntSupportMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::sequence::SequenceNr;

/// Channel number reserved for protocol-internal traffic. User sends on this channel are
///  rejected.
pub const SYSTEM_CHANNEL: u8 = 255;

/// The lowest type id available to applications; everything below is reserved for
///  [`SystemPacketId`].
pub const FIRST_USER_TYPE_ID: u8 = SystemPacketId::COUNT;

/// First byte of every datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum StreamKind {
    ReliableData = 0,
    ReliableAck = 1,
    UnreliableData = 2,
    /// Same framing as [`StreamKind::UnreliableData`] but accepted before a connection is
    ///  established - this is the only stream a peer in `NotSet`/`Initiating` state listens to.
    HandshakeData = 3,
}

/// Type ids reserved for protocol-internal messages.
///
/// The group-replication ids (`IdPackRequest` .. `DestroyAllGroups`) belong to a retired
///  subsystem; they stay reserved so the id space remains wire-compatible, and inbound frames
///  carrying them are dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum SystemPacketId {
    IdPackRequest = 0,
    IdPackProvide = 1,
    CreateGroup = 2,
    DestroyGroup = 3,
    DestroyAllGroups = 4,
    Connect = 5,
    ConnectInvalidPw = 6,
    ConnectMaxUsers = 7,
    ConnectAccepted = 8,
    Disconnect = 9,
    KeepAlive = 10,
    Rpc = 11,
}
impl SystemPacketId {
    pub const COUNT: u8 = 12;
}

/// Role of one physical message within a logical send. A fragmented payload consumes one
///  sequence number per fragment, so fragment ordering reuses the regular ack machinery.
///
/// The wire value `0` is not a role but the "already acknowledged, skipped" marker written
///  in place of a retransmitted entry (see [`FRAGMENT_SKIP_MARKER`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum FragmentRole {
    Whole = 1,
    Begin = 2,
    Middle = 3,
    End = 4,
}

pub const FRAGMENT_SKIP_MARKER: u8 = 0;

/// discriminator + conn id + channel + first sequence
pub const RELIABLE_DATA_HEADER_LEN: usize = 1 + 4 + 1 + 4;
/// fragment role + type id + payload length
pub const RELIABLE_ENTRY_OVERHEAD: usize = 1 + 1 + 2;
/// discriminator + conn id + first sequence
pub const SEQUENCED_DATA_HEADER_LEN: usize = 1 + 4 + 4;
/// type id + is-system flag + payload length
pub const SEQUENCED_ENTRY_OVERHEAD: usize = 1 + 1 + 2;

pub fn put_reliable_data_header(buf: &mut BytesMut, conn_id: u32, channel: u8, first_seq: SequenceNr) {
    buf.put_u8(StreamKind::ReliableData.into());
    buf.put_u32_le(conn_id);
    buf.put_u8(channel);
    buf.put_u32_le(first_seq.to_raw());
}

pub fn put_sequenced_data_header(buf: &mut BytesMut, kind: StreamKind, conn_id: u32, first_seq: SequenceNr) {
    buf.put_u8(kind.into());
    buf.put_u32_le(conn_id);
    buf.put_u32_le(first_seq.to_raw());
}

/// Cumulative selective acknowledgment for one reliable channel: all sequence positions in
///  `[first_seq, first_seq + count)` are acknowledged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReliableAck {
    pub channel: u8,
    pub first_seq: SequenceNr,
    pub count: u8,
}
impl ReliableAck {
    pub fn ser(&self, buf: &mut BytesMut, conn_id: u32) {
        buf.put_u8(StreamKind::ReliableAck.into());
        buf.put_u32_le(conn_id);
        buf.put_u8(self.channel);
        buf.put_u32_le(self.first_seq.to_raw());
        buf.put_u8(self.count);
    }

    /// Parses the part after discriminator, conn id and channel number.
    pub fn deser(channel: u8, buf: &mut impl Buf) -> anyhow::Result<ReliableAck> {
        let first_seq = SequenceNr::from_raw(buf.try_get_u32_le()?);
        let count = buf.try_get_u8()?;
        if count == 0 {
            bail!("ack with zero count");
        }
        Ok(ReliableAck { channel, first_seq, count })
    }
}

/// Payload of a `Connect` handshake frame. The initiator's connection id travels in the
///  datagram header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectFrame {
    pub password: String,
}
impl ConnectFrame {
    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_usize_varint(self.password.len());
        buf.put_slice(self.password.as_bytes());
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<ConnectFrame> {
        let len = buf.try_get_usize_varint()?;
        if buf.remaining() < len {
            bail!("truncated connect frame");
        }
        let password = String::from_utf8(buf.copy_to_bytes(len).to_vec())?;
        Ok(ConnectFrame { password })
    }
}

/// Payload of a `ConnectAccepted` frame: the initiator's id reflected back (so a crossed
///  reply from a stale attempt can be detected) next to the acceptor's own id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectAcceptedFrame {
    pub initiator_id: u32,
    pub acceptor_id: u32,
}
impl ConnectAcceptedFrame {
    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_u32_le(self.initiator_id);
        buf.put_u32_le(self.acceptor_id);
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<ConnectAcceptedFrame> {
        Ok(ConnectAcceptedFrame {
            initiator_id: buf.try_get_u32_le()?,
            acceptor_id: buf.try_get_u32_le()?,
        })
    }
}

/// Payload of a `ConnectInvalidPw` / `ConnectMaxUsers` frame: just the reflected initiator id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectRejectedFrame {
    pub initiator_id: u32,
}
impl ConnectRejectedFrame {
    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_u32_le(self.initiator_id);
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<ConnectRejectedFrame> {
        Ok(ConnectRejectedFrame {
            initiator_id: buf.try_get_u32_le()?,
        })
    }
}

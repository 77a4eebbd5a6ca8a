use std::fmt::{Debug, Display, Formatter};

use bitflags::bitflags;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use crc::{Crc, CRC_32_ISCSI};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use thiserror::Error;
use tracing::warn;

use crate::seq_no::SeqNo;
use crate::util::safe_converter::{PrecheckedCast, SafeCast};

pub const PROTOCOL_VERSION: u8 = 1;

/// Upper bound for the payload of all packets except [PacketKind::LinkInit]
pub const MAX_PACKET_SIZE: usize = 8192;

/// A link init snapshot contains the unacked data of every live connection, so it is allowed to
///  exceed [MAX_PACKET_SIZE]
pub const MAX_LINK_PAYLOAD_SIZE: usize = 16 * 1024 * 1024;

const CHECKSUM: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

bitflags! {
    #[derive(Debug, PartialEq, Eq, Copy, Clone)]
    pub struct PacketFlags: u8 {
        /// ack sequence and ack window carry a valid acknowledgement
        const ACK = 0b0000_0001;
    }
}

/// The closed set of packet types. The numeric values are part of the wire format.
#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, TryFromPrimitive, IntoPrimitive)]
pub enum PacketKind {
    ConnInit = 1,
    ConnInitAck = 2,
    ConnRejected = 3,
    Data = 4,
    ConnClose = 5,
    Ack = 6,
    ConnShutdown = 7,
    LinkInit = 8,
    ConnAbort = 9,
    ConnOption = 10,
    ListenStateChange = 11,
    NoOp = 12,
    Dummy = 13,
}

impl PacketKind {
    /// Sequenced packets occupy a slot in the send window and are delivered to the receiving
    ///  connection in order, exactly once
    pub fn is_sequenced(self) -> bool {
        matches!(self, PacketKind::Data | PacketKind::ConnClose | PacketKind::ConnOption)
    }

    pub fn max_payload_len(self) -> usize {
        match self {
            PacketKind::LinkInit => MAX_LINK_PAYLOAD_SIZE,
            _ => MAX_PACKET_SIZE,
        }
    }
}

/// Identifies a logical connection on one physical link. [ConnectionId::LINK] is reserved for
///  link-level control packets.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Default, Debug)]
pub struct ConnectionId(u32);

impl Display for ConnectionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl ConnectionId {
    pub const LINK: ConnectionId = ConnectionId(0);

    pub fn from_raw(value: u32) -> ConnectionId {
        ConnectionId(value)
    }

    pub fn to_raw(self) -> u32 {
        self.0
    }

    pub fn is_link(self) -> bool {
        self == Self::LINK
    }
}

#[derive(Error, Debug, Clone, Eq, PartialEq)]
pub enum FrameError {
    #[error("truncated frame: {needed} bytes needed, {available} available")]
    Truncated { needed: usize, available: usize },
    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u8),
    #[error("unknown packet kind {0}")]
    UnknownKind(u8),
    #[error("payload of {len} bytes exceeds the limit for {kind:?}")]
    PayloadTooLarge { kind: PacketKind, len: usize },
    #[error("checksum mismatch")]
    ChecksumMismatch,
}

/// The fixed-size part of a frame. It is parsed separately so that stream readers can learn the
///  payload length before reading the payload.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct FrameHeader {
    pub kind: PacketKind,
    pub flags: PacketFlags,
    pub connection_id: ConnectionId,
    pub sequence: SeqNo,
    pub ack_sequence: SeqNo,
    pub ack_window: u32,
    pub payload_len: usize,
    pub checksum: u32,
}

impl FrameHeader {
    /// version, kind, flags, reserved, connection id, sequence, ack sequence, ack window,
    ///  payload length, checksum
    pub const SERIALIZED_LEN: usize = 4 + 4 + 8 + 8 + 4 + 4 + 4;

    /// number of leading header bytes covered by the checksum
    const CHECKSUMMED_LEN: usize = Self::SERIALIZED_LEN - 4;

    pub fn deser(buf: &mut impl Buf) -> Result<FrameHeader, FrameError> {
        if buf.remaining() < Self::SERIALIZED_LEN {
            return Err(FrameError::Truncated { needed: Self::SERIALIZED_LEN, available: buf.remaining() });
        }

        let version = buf.get_u8();
        if version != PROTOCOL_VERSION {
            return Err(FrameError::UnsupportedVersion(version));
        }
        let raw_kind = buf.get_u8();
        let kind = PacketKind::try_from(raw_kind)
            .map_err(|_| FrameError::UnknownKind(raw_kind))?;
        let flags = PacketFlags::from_bits_truncate(buf.get_u8());
        let _reserved = buf.get_u8();

        let connection_id = ConnectionId(buf.get_u32());
        let sequence = SeqNo::from_raw(buf.get_u64());
        let ack_sequence = SeqNo::from_raw(buf.get_u64());
        let ack_window = buf.get_u32();
        let payload_len: usize = buf.get_u32().safe_cast();
        let checksum = buf.get_u32();

        if payload_len > kind.max_payload_len() {
            return Err(FrameError::PayloadTooLarge { kind, len: payload_len });
        }

        Ok(FrameHeader {
            kind,
            flags,
            connection_id,
            sequence,
            ack_sequence,
            ack_window,
            payload_len,
            checksum,
        })
    }

    fn ser_checksummed_part(&self, buf: &mut impl BufMut) {
        buf.put_u8(PROTOCOL_VERSION);
        buf.put_u8(self.kind.into());
        buf.put_u8(self.flags.bits());
        buf.put_u8(0);
        buf.put_u32(self.connection_id.0);
        buf.put_u64(self.sequence.to_raw());
        buf.put_u64(self.ack_sequence.to_raw());
        buf.put_u32(self.ack_window);
        buf.put_u32(self.payload_len.prechecked_cast());
    }

    fn calc_checksum(&self, payload: &[u8]) -> u32 {
        let mut header_buf = [0u8; Self::CHECKSUMMED_LEN];
        self.ser_checksummed_part(&mut header_buf.as_mut_slice());

        let mut digest = CHECKSUM.digest();
        digest.update(&header_buf);
        digest.update(payload);
        digest.finalize()
    }

    /// combines the header with its payload, verifying the checksum
    pub fn into_packet(self, payload: Bytes) -> Result<Packet, FrameError> {
        if payload.len() != self.payload_len {
            return Err(FrameError::Truncated { needed: self.payload_len, available: payload.len() });
        }
        if self.calc_checksum(&payload) != self.checksum {
            return Err(FrameError::ChecksumMismatch);
        }

        let (ack_sequence, ack_window) = if self.flags.contains(PacketFlags::ACK) {
            (Some(self.ack_sequence), self.ack_window)
        }
        else {
            (None, 0)
        };

        Ok(Packet {
            kind: self.kind,
            connection_id: self.connection_id,
            sequence: self.sequence,
            ack_sequence,
            ack_window,
            payload,
        })
    }
}

/// A tunnel packet. Packets are immutable once they are handed to the outbound path; a
///  retransmission sends a clone of the same packet.
#[derive(Clone, Eq, PartialEq)]
pub struct Packet {
    pub kind: PacketKind,
    pub connection_id: ConnectionId,
    /// only meaningful for sequenced kinds, zero otherwise
    pub sequence: SeqNo,
    /// cumulative ack: everything up to and including this sequence number was received. This
    ///  is always present for [PacketKind::Ack] and may be piggy-backed on sequenced packets.
    pub ack_sequence: Option<SeqNo>,
    /// the acknowledging side's free receive window (in packets)
    pub ack_window: u32,
    pub payload: Bytes,
}

impl Debug for Packet {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "PCKT{{{:?}@{}", self.kind, self.connection_id)?;
        if self.kind.is_sequenced() {
            write!(f, "{:?}", self.sequence)?;
        }
        if let Some(ack) = self.ack_sequence {
            write!(f, " ack{:?}/{}", ack, self.ack_window)?;
        }
        if !self.payload.is_empty() {
            write!(f, " {}b", self.payload.len())?;
        }
        write!(f, "}}")
    }
}

impl Packet {
    pub fn new(kind: PacketKind, connection_id: ConnectionId, payload: Bytes) -> Packet {
        Packet {
            kind,
            connection_id,
            sequence: SeqNo::ZERO,
            ack_sequence: None,
            ack_window: 0,
            payload,
        }
    }

    /// a packet without payload
    pub fn control(kind: PacketKind, connection_id: ConnectionId) -> Packet {
        Self::new(kind, connection_id, Bytes::new())
    }

    pub fn sequenced(kind: PacketKind, connection_id: ConnectionId, sequence: SeqNo, payload: Bytes) -> Packet {
        Packet {
            sequence,
            ..Self::new(kind, connection_id, payload)
        }
    }

    pub fn ack(connection_id: ConnectionId, ack_sequence: SeqNo, ack_window: u32) -> Packet {
        Packet {
            ack_sequence: Some(ack_sequence),
            ack_window,
            ..Self::control(PacketKind::Ack, connection_id)
        }
    }

    pub fn no_op() -> Packet {
        Self::control(PacketKind::NoOp, ConnectionId::LINK)
    }

    pub fn with_ack(mut self, ack_sequence: SeqNo, ack_window: u32) -> Packet {
        self.ack_sequence = Some(ack_sequence);
        self.ack_window = ack_window;
        self
    }

    pub fn encoded_len(&self) -> usize {
        FrameHeader::SERIALIZED_LEN + self.payload.len()
    }

    fn header(&self) -> FrameHeader {
        let flags = if self.ack_sequence.is_some() { PacketFlags::ACK } else { PacketFlags::empty() };
        let mut header = FrameHeader {
            kind: self.kind,
            flags,
            connection_id: self.connection_id,
            sequence: self.sequence,
            ack_sequence: self.ack_sequence.unwrap_or(SeqNo::ZERO),
            ack_window: self.ack_window,
            payload_len: self.payload.len(),
            checksum: 0,
        };
        header.checksum = header.calc_checksum(&self.payload);
        header
    }

    /// Appends the frame to `buf`. The payload must have been checked against
    ///  [PacketKind::max_payload_len] when the packet was built.
    pub fn ser(&self, buf: &mut BytesMut) {
        debug_assert!(self.payload.len() <= self.kind.max_payload_len());

        let header = self.header();
        buf.reserve(self.encoded_len());
        header.ser_checksummed_part(buf);
        buf.put_u32(header.checksum);
        buf.put_slice(&self.payload);
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.ser(&mut buf);
        buf.freeze()
    }

    /// Decodes a single frame from the front of `buf`
    pub fn decode(buf: &mut impl Buf) -> Result<Packet, FrameError> {
        let header = FrameHeader::deser(buf)?;
        if buf.remaining() < header.payload_len {
            return Err(FrameError::Truncated { needed: header.payload_len, available: buf.remaining() });
        }
        let payload = buf.copy_to_bytes(header.payload_len);
        header.into_packet(payload)
    }

    /// Decodes a sequence of concatenated frames, e.g. an HTTP body. Decoding stops at the first
    ///  malformed frame: frames before it are returned, everything after it is discarded.
    pub fn decode_all(mut buf: impl Buf) -> Vec<Packet> {
        let mut result = Vec::new();
        while buf.has_remaining() {
            match Self::decode(&mut buf) {
                Ok(packet) => result.push(packet),
                Err(e) => {
                    warn!("dropping malformed frame data ({} bytes): {}", buf.remaining(), e);
                    break;
                }
            }
        }
        result
    }

    pub fn encode_all<'a>(packets: impl IntoIterator<Item = &'a Packet>) -> Bytes {
        let mut buf = BytesMut::new();
        for p in packets {
            p.ser(&mut buf);
        }
        buf.freeze()
    }
}

//! Payloads of control packets. Each message knows how to `ser` itself into a packet payload and
//!  how to `deser` itself from one; the enclosing [Packet] determines which message to expect.

use std::time::Duration;

use anyhow::{anyhow, bail};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use bytes_varint::{VarIntSupport, VarIntSupportMut};

use crate::connection::ConnectionState;
use crate::packet::{ConnectionId, Packet};
use crate::seq_no::SeqNo;
use crate::util::buf::{put_bool, put_string, try_get_bool, try_get_string};
use crate::util::safe_converter::{SafeCast, SaturatingCast};

/// A pull period of `None` means continuous long-polling. On the wire this is any value <= 0.
pub fn pull_period_to_wire(pull_period: Option<Duration>) -> i32 {
    match pull_period {
        None => -1,
        Some(d) => d.as_secs().saturating_cast(),
    }
}

pub fn pull_period_from_wire(raw: i32) -> Option<Duration> {
    match u64::try_from(raw) {
        Ok(secs) if secs > 0 => Some(Duration::from_secs(secs)),
        _ => None,
    }
}

fn timeout_to_wire(timeout: Duration) -> u32 {
    timeout.as_secs().try_into().unwrap_or(u32::MAX)
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ConnInitMsg {
    pub pull_period: Option<Duration>,
    pub connection_timeout: Duration,
    /// empty for 'the default service'
    pub service_name: String,
    /// the client's address as seen by the relay, empty when sent by the client
    pub remote_address: String,
}
impl ConnInitMsg {
    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_i32(pull_period_to_wire(self.pull_period));
        buf.put_u32(timeout_to_wire(self.connection_timeout));
        put_string(buf, &self.service_name);
        put_string(buf, &self.remote_address);
    }

    pub fn deser(mut buf: &[u8]) -> anyhow::Result<ConnInitMsg> {
        let pull_period = pull_period_from_wire(buf.try_get_i32()?);
        let connection_timeout = Duration::from_secs(buf.try_get_u32()?.safe_cast());
        let service_name = try_get_string(&mut buf)?;
        let remote_address = try_get_string(&mut buf)?;
        Ok(ConnInitMsg {
            pull_period,
            connection_timeout,
            service_name,
            remote_address,
        })
    }

    pub fn to_payload(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.ser(&mut buf);
        buf.freeze()
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ConnRejectedMsg {
    pub reason: String,
}
impl ConnRejectedMsg {
    pub fn ser(&self, buf: &mut BytesMut) {
        put_string(buf, &self.reason);
    }

    pub fn deser(mut buf: &[u8]) -> anyhow::Result<ConnRejectedMsg> {
        Ok(ConnRejectedMsg {
            reason: try_get_string(&mut buf)?,
        })
    }

    pub fn to_payload(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.ser(&mut buf);
        buf.freeze()
    }
}

const ID_PULL_PERIOD: i32 = 1;
const ID_CONNECTION_TIMEOUT: i32 = 2;

/// Renegotiates a connection parameter after the handshake. Options travel as sequenced packets,
///  so they take effect at a well-defined position in the stream.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ConnectionOption {
    PullPeriod(Option<Duration>),
    ConnectionTimeout(Duration),
}
impl ConnectionOption {
    pub fn ser(&self, buf: &mut BytesMut) {
        match self {
            ConnectionOption::PullPeriod(p) => {
                buf.put_i32(ID_PULL_PERIOD);
                buf.put_i32(pull_period_to_wire(*p));
            }
            ConnectionOption::ConnectionTimeout(t) => {
                buf.put_i32(ID_CONNECTION_TIMEOUT);
                buf.put_i32(t.as_secs().saturating_cast());
            }
        }
    }

    pub fn deser(mut buf: &[u8]) -> anyhow::Result<ConnectionOption> {
        let id = buf.try_get_i32()?;
        let value = buf.try_get_i32()?;
        match id {
            ID_PULL_PERIOD => Ok(ConnectionOption::PullPeriod(pull_period_from_wire(value))),
            ID_CONNECTION_TIMEOUT => {
                let secs = u64::try_from(value)
                    .map_err(|_| anyhow!("negative connection timeout {}", value))?;
                Ok(ConnectionOption::ConnectionTimeout(Duration::from_secs(secs)))
            }
            _ => Err(anyhow!("invalid connection option {}", id)),
        }
    }

    pub fn to_payload(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.ser(&mut buf);
        buf.freeze()
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ListenStateMsg {
    pub service_name: String,
    pub listening: bool,
}
impl ListenStateMsg {
    pub fn ser(&self, buf: &mut BytesMut) {
        put_string(buf, &self.service_name);
        put_bool(buf, self.listening);
    }

    pub fn deser(mut buf: &[u8]) -> anyhow::Result<ListenStateMsg> {
        let service_name = try_get_string(&mut buf)?;
        let listening = try_get_bool(&mut buf)?;
        Ok(ListenStateMsg {
            service_name,
            listening,
        })
    }

    pub fn to_payload(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.ser(&mut buf);
        buf.freeze()
    }
}

/// Everything needed to continue a connection after the relay lost its state: the relay
///  re-creates its routing entry and re-queues the unacked data for the client.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ConnectionSnapshot {
    pub id: ConnectionId,
    pub state: ConnectionState,
    /// the client's address as seen by the relay at handshake
    pub peer_address: String,
    pub pull_period: Option<Duration>,
    pub connection_timeout: Duration,
    pub send_base: SeqNo,
    pub send_next: SeqNo,
    pub recv_expected: SeqNo,
    pub peer_window: u32,
    /// sequenced packets sent but not acknowledged, in sequence order
    pub unacked: Vec<Packet>,
}
impl ConnectionSnapshot {
    fn ser(&self, buf: &mut BytesMut) {
        buf.put_u32(self.id.to_raw());
        buf.put_u8(self.state.into());
        put_string(buf, &self.peer_address);
        buf.put_i32(pull_period_to_wire(self.pull_period));
        buf.put_u32(timeout_to_wire(self.connection_timeout));
        buf.put_u64(self.send_base.to_raw());
        buf.put_u64(self.send_next.to_raw());
        buf.put_u64(self.recv_expected.to_raw());
        buf.put_u32(self.peer_window);

        buf.put_usize_varint(self.unacked.len());
        for p in &self.unacked {
            buf.put_usize_varint(p.encoded_len());
            p.ser(buf);
        }
    }

    fn deser(buf: &mut impl Buf) -> anyhow::Result<ConnectionSnapshot> {
        let id = ConnectionId::from_raw(buf.try_get_u32()?);
        let raw_state = buf.try_get_u8()?;
        let state = ConnectionState::try_from(raw_state)
            .map_err(|_| anyhow!("invalid connection state {}", raw_state))?;
        let peer_address = try_get_string(buf)?;
        let pull_period = pull_period_from_wire(buf.try_get_i32()?);
        let connection_timeout = Duration::from_secs(buf.try_get_u32()?.safe_cast());
        let send_base = SeqNo::from_raw(buf.try_get_u64()?);
        let send_next = SeqNo::from_raw(buf.try_get_u64()?);
        let recv_expected = SeqNo::from_raw(buf.try_get_u64()?);
        let peer_window = buf.try_get_u32()?;

        if send_next < send_base {
            bail!("inconsistent snapshot for connection {}: send next {} before send base {}", id, send_next, send_base);
        }

        let num_unacked = buf.try_get_usize_varint()?;
        let mut unacked = Vec::new();
        for _ in 0..num_unacked {
            let len = buf.try_get_usize_varint()?;
            if len > buf.remaining() {
                bail!("unacked packet length {} exceeds remaining buffer", len);
            }
            let mut frame = buf.copy_to_bytes(len);
            let packet = Packet::decode(&mut frame)?;
            if packet.connection_id != id || !packet.kind.is_sequenced() {
                bail!("snapshot for connection {} contains unrelated packet {:?}", id, packet);
            }
            unacked.push(packet);
        }

        Ok(ConnectionSnapshot {
            id,
            state,
            peer_address,
            pull_period,
            connection_timeout,
            send_base,
            send_next,
            recv_expected,
            peer_window,
            unacked,
        })
    }
}

/// Sent by the driver as the first packet on every (re-)established link
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct LinkInitMsg {
    pub service_name: String,
    pub connections: Vec<ConnectionSnapshot>,
}
impl LinkInitMsg {
    pub fn ser(&self, buf: &mut BytesMut) {
        put_string(buf, &self.service_name);
        buf.put_usize_varint(self.connections.len());
        for c in &self.connections {
            c.ser(buf);
        }
    }

    pub fn deser(mut buf: &[u8]) -> anyhow::Result<LinkInitMsg> {
        let service_name = try_get_string(&mut buf)?;
        let num_connections = buf.try_get_usize_varint()?;
        let mut connections = Vec::new();
        for _ in 0..num_connections {
            connections.push(ConnectionSnapshot::deser(&mut buf)?);
        }
        Ok(LinkInitMsg {
            service_name,
            connections,
        })
    }

    pub fn to_payload(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.ser(&mut buf);
        buf.freeze()
    }
}

use std::collections::BTreeMap;

use anyhow::bail;
use bytes::Bytes;
use tokio::time::Instant;
use tracing::trace;

use crate::config::RetransmitConfig;
use crate::packet::{ConnectionId, Packet, PacketKind};
use crate::retransmit::{RetransmitTimer, RtoEstimator};
use crate::seq_no::SeqNo;

#[derive(Debug, Clone)]
pub struct UnackedPacket {
    pub packet: Packet,
    pub timer: RetransmitTimer,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum AckOutcome {
    /// acknowledged `acked` packets that were pending before
    Advanced { acked: usize },
    /// A repetition of the previous ack. Once the configured number of duplicates is reached, the
    ///  oldest unacked packet is returned for immediate retransmission.
    Duplicate { fast_retransmit: Option<Packet> },
    /// same ack sequence as before, but the peer's receive window changed
    WindowUpdate,
    /// an ack that was overtaken by a newer one, or a duplicate that does not count
    Stale,
}

/// The sending half of a connection's sliding window.
///
/// Sequenced packets get consecutive sequence numbers starting at [SeqNo::FIRST]. All packets
///  from `send_base` (inclusive) to `send_next` (exclusive) are unacked and stored with their
///  retransmission timer, so `send_next - send_base` is the number of packets in flight. That
///  number never exceeds the configured window size, and it is kept below the peer's advertised
///  receive window - except for a single probe packet while the advertised window is zero.
#[derive(Debug)]
pub struct SendWindow {
    window_size: u32,
    peer_window: u32,
    send_base: SeqNo,
    send_next: SeqNo,
    unacked: BTreeMap<SeqNo, UnackedPacket>,
    rto: RtoEstimator,
    fast_retransmit_ack_count: u32,
    max_timeout: std::time::Duration,
}

impl SendWindow {
    pub fn new(window_size: u32, config: &RetransmitConfig) -> SendWindow {
        SendWindow {
            window_size,
            peer_window: window_size,
            send_base: SeqNo::FIRST,
            send_next: SeqNo::FIRST,
            unacked: BTreeMap::new(),
            rto: RtoEstimator::new(config),
            fast_retransmit_ack_count: config.fast_retransmit_ack_count,
            max_timeout: config.max_timeout,
        }
    }

    pub fn send_base(&self) -> SeqNo {
        self.send_base
    }

    pub fn send_next(&self) -> SeqNo {
        self.send_next
    }

    pub fn peer_window(&self) -> u32 {
        self.peer_window
    }

    pub fn len(&self) -> usize {
        self.unacked.len()
    }

    pub fn is_empty(&self) -> bool {
        self.unacked.is_empty()
    }

    pub fn rto(&self) -> &RtoEstimator {
        &self.rto
    }

    pub fn get(&self, seq: SeqNo) -> Option<&UnackedPacket> {
        self.unacked.get(&seq)
    }

    pub fn unacked_packets(&self) -> impl Iterator<Item = &Packet> {
        self.unacked.values().map(|u| &u.packet)
    }

    /// the highest retransmit count of any pending packet
    pub fn max_retransmit_count(&self) -> u32 {
        self.unacked.values()
            .map(|u| u.timer.retransmit_count)
            .max()
            .unwrap_or(0)
    }

    /// Is there room for another packet? A zero peer window still allows a single probe packet.
    pub fn has_room(&self) -> bool {
        let limit = self.window_size.min(self.peer_window.max(1));
        self.unacked.len() < limit as usize
    }

    /// Assigns the next sequence number and stores the packet as unacked. The caller must have
    ///  checked [SendWindow::has_room].
    pub fn push(&mut self, kind: PacketKind, connection_id: ConnectionId, payload: Bytes, now: Instant) -> Packet {
        debug_assert!(kind.is_sequenced());
        debug_assert!(self.has_room());

        let seq = self.send_next;
        self.send_next = seq.next();

        let packet = Packet::sequenced(kind, connection_id, seq, payload);
        self.unacked.insert(seq, UnackedPacket {
            packet: packet.clone(),
            timer: RetransmitTimer::start(now, self.rto.timeout()),
        });
        packet
    }

    /// Processes a cumulative ack. Only standalone ack packets (`is_pure_ack`) count as
    ///  duplicates - acks piggy-backed on data repeat the same value naturally.
    ///
    /// An ack for a sequence number that was never sent is a protocol violation.
    pub fn on_ack(&mut self, ack: SeqNo, window: u32, is_pure_ack: bool, now: Instant) -> anyhow::Result<AckOutcome> {
        if ack >= self.send_next {
            bail!("ack {:?} for a packet that was not sent yet (next is {:?})", ack, self.send_next);
        }

        let last_ack = self.send_base.prev();
        if ack < last_ack {
            return Ok(AckOutcome::Stale);
        }

        if ack > last_ack {
            let still_unacked = self.unacked.split_off(&ack.next());
            let acked = std::mem::replace(&mut self.unacked, still_unacked);

            if let Some(rtt) = acked.get(&ack).and_then(|u| u.timer.rtt_sample(now)) {
                self.rto.on_rtt_sample(rtt);
            }

            self.send_base = ack.next();
            self.peer_window = window;
            trace!("ack {:?} advanced send base, {} packets acked, window {}", ack, acked.len(), window);
            return Ok(AckOutcome::Advanced { acked: acked.len() });
        }

        if window != self.peer_window {
            self.peer_window = window;
            return Ok(AckOutcome::WindowUpdate);
        }
        if !is_pure_ack {
            return Ok(AckOutcome::Stale);
        }

        let threshold = self.fast_retransmit_ack_count;
        let max_timeout = self.max_timeout;
        match self.unacked.get_mut(&self.send_base) {
            None => Ok(AckOutcome::Stale),
            Some(oldest) => {
                if oldest.timer.on_dup_ack(threshold) {
                    oldest.timer.on_retransmit(now, false, max_timeout);
                    Ok(AckOutcome::Duplicate { fast_retransmit: Some(oldest.packet.clone()) })
                }
                else {
                    Ok(AckOutcome::Duplicate { fast_retransmit: None })
                }
            }
        }
    }

    /// Restarts the timers of all expired packets with doubled timeouts and returns the packets
    ///  for retransmission, oldest first
    pub fn due_retransmits(&mut self, now: Instant) -> Vec<Packet> {
        let max_timeout = self.max_timeout;
        self.unacked.values_mut()
            .filter(|u| u.timer.is_expired(now))
            .map(|u| {
                u.timer.on_retransmit(now, true, max_timeout);
                u.packet.clone()
            })
            .collect()
    }

    /// the earliest retransmission deadline
    pub fn next_deadline(&self) -> Option<Instant> {
        self.unacked.values()
            .map(|u| u.timer.deadline())
            .min()
    }

    /// Drops all pending packets, e.g. because the peer will not read them anymore
    pub fn discard(&mut self) {
        self.unacked.clear();
        self.send_base = self.send_next;
    }
}

use std::collections::{BTreeMap, VecDeque};

use bytes::Bytes;
use tracing::{debug, trace};

use crate::packet::{Packet, PacketKind};
use crate::seq_no::SeqNo;

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ReceiveOutcome {
    /// The packet was stored. `control` holds the non-data packets (options, close) that became
    ///  deliverable in sequence order as a consequence.
    Accepted { control: Vec<Packet> },
    /// the packet was received before and is not delivered again
    Duplicate,
    /// The packet is beyond the window or there is no buffer space because the application
    ///  does not read. It must be retransmitted later.
    Dropped,
}

/// The receiving half of a connection.
///
/// Packets arriving out of order are kept in a reorder buffer until the gap before them is
///  filled. Data that became contiguous is moved to the 'ready' queue where it waits for the
///  application to read it.
///
/// Invariants:
/// * all sequence numbers in the reorder buffer are > `recv_expected` (the packet for
///   `recv_expected` itself would have been delivered immediately)
/// * the ready queue holds at most `window_size` chunks; each chunk is the payload of one packet
/// * after the close marker was delivered, no further packets are accepted
#[derive(Debug)]
pub struct ReceiveBuffer {
    window_size: u32,
    recv_expected: SeqNo,
    reorder: BTreeMap<SeqNo, Packet>,
    ready: VecDeque<Bytes>,
    close_received: bool,
    advertised_zero: bool,
}

impl ReceiveBuffer {
    pub fn new(window_size: u32) -> ReceiveBuffer {
        Self::starting_at(window_size, SeqNo::FIRST)
    }

    fn starting_at(window_size: u32, recv_expected: SeqNo) -> ReceiveBuffer {
        ReceiveBuffer {
            window_size,
            recv_expected,
            reorder: BTreeMap::new(),
            ready: VecDeque::new(),
            close_received: false,
            advertised_zero: false,
        }
    }

    pub fn recv_expected(&self) -> SeqNo {
        self.recv_expected
    }

    /// the cumulative ack for everything received so far
    pub fn ack_sequence(&self) -> SeqNo {
        self.recv_expected.prev()
    }

    pub fn num_ready(&self) -> usize {
        self.ready.len()
    }

    pub fn num_reordered(&self) -> usize {
        self.reorder.len()
    }

    pub fn close_received(&self) -> bool {
        self.close_received
    }

    /// `true` once the peer closed its sending side and all data before the close was read
    pub fn is_eof(&self) -> bool {
        self.close_received && self.ready.is_empty()
    }

    pub fn has_data(&self) -> bool {
        !self.ready.is_empty()
    }

    /// The number of sequence numbers starting at `recv_expected` that can currently be
    ///  accepted. This is the window to advertise in acks.
    pub fn free_window(&self) -> u32 {
        let used = u32::try_from(self.ready.len()).unwrap_or(u32::MAX);
        self.window_size.saturating_sub(used)
    }

    /// The window for an outgoing ack. Remembers whether a zero window was advertised, so that
    ///  the reopening of the window can be signalled actively.
    pub fn advertise_window(&mut self) -> u32 {
        let window = self.free_window();
        self.advertised_zero = window == 0;
        window
    }

    /// `true` if the last advertised window was zero and reading has opened it since
    pub fn needs_window_update(&self) -> bool {
        self.advertised_zero && self.free_window() > 0
    }

    /// Accepts a sequenced packet. Packets beyond the window (a peer with a larger configured
    ///  window) are dropped and recovered by retransmission.
    pub fn on_packet(&mut self, packet: Packet) -> ReceiveOutcome {
        debug_assert!(packet.kind.is_sequenced());

        let offset = match packet.sequence.distance_from(self.recv_expected) {
            None => return ReceiveOutcome::Duplicate,
            Some(offset) => offset,
        };

        if offset >= self.window_size as u64 {
            debug!("{:?} is beyond the receive window (expected {:?}, window {}) - dropping it", packet.sequence, self.recv_expected, self.window_size);
            return ReceiveOutcome::Dropped;
        }
        if self.close_received {
            trace!("dropping {:?} after close", packet);
            return ReceiveOutcome::Dropped;
        }
        if offset >= self.free_window() as u64 {
            trace!("no buffer space for {:?}", packet);
            return ReceiveOutcome::Dropped;
        }
        if self.reorder.contains_key(&packet.sequence) {
            return ReceiveOutcome::Duplicate;
        }

        self.reorder.insert(packet.sequence, packet);

        let mut control = Vec::new();
        while let Some(p) = self.reorder.remove(&self.recv_expected) {
            self.recv_expected = self.recv_expected.next();
            match p.kind {
                PacketKind::Data => {
                    if !p.payload.is_empty() {
                        self.ready.push_back(p.payload);
                    }
                }
                PacketKind::ConnClose => {
                    self.close_received = true;
                    // packets after the close marker are never delivered
                    self.reorder.clear();
                    control.push(p);
                    break;
                }
                _ => control.push(p),
            }
        }

        ReceiveOutcome::Accepted { control }
    }

    /// Takes up to `max_len` bytes of in-order data, `None` if no data is ready
    pub fn read(&mut self, max_len: usize) -> Option<Bytes> {
        let front = self.ready.front_mut()?;
        if front.len() > max_len {
            return Some(front.split_to(max_len));
        }
        self.ready.pop_front()
    }
}

use std::sync::Mutex;

use crate::connection::PacketSink;
use crate::packet::{Packet, PacketKind};

/// A [PacketSink] that records everything sent through it, for inspection by test code
#[derive(Debug, Default)]
pub struct TrackingPacketSink {
    tracker: Mutex<Vec<Packet>>,
}
impl TrackingPacketSink {
    pub fn new() -> TrackingPacketSink {
        Default::default()
    }

    /// returns sent packets, clearing the internal buffer
    pub fn sent_packets(&self) -> Vec<Packet> {
        let mut lock = self.tracker.lock().unwrap();
        std::mem::take(&mut *lock)
    }

    /// removes the oldest sent packet, asserting its kind
    pub fn assert_packet_sent(&self, kind: PacketKind) -> Packet {
        let mut lock = self.tracker.lock().unwrap();
        if lock.is_empty() {
            panic!("no packet was sent, expected {:?}", kind);
        }
        let packet = lock.remove(0);
        assert_eq!(packet.kind, kind, "unexpected packet {:?}", packet);
        packet
    }

    pub fn assert_no_remaining_packets(&self) {
        let lock = self.tracker.lock().unwrap();
        assert!(lock.is_empty(), "unexpected packets: {:?}", *lock);
    }
}

impl PacketSink for TrackingPacketSink {
    fn send_packet(&self, packet: Packet) {
        self.tracker.lock().unwrap().push(packet);
    }
}

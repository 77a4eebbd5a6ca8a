use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rustc_hash::FxHashSet;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::connection::ConnectionState;
use crate::control_messages::{ConnectionOption, ConnectionSnapshot};
use crate::packet::{ConnectionId, Packet, PacketKind, MAX_PACKET_SIZE};
use crate::seq_no::SeqNo;

/// Packets that end a connection's life at the relay. They stay at the head of the pull queue
///  once they reach it, so every pull sees them.
pub fn is_terminal_kind(kind: PacketKind) -> bool {
    matches!(kind, PacketKind::ConnAbort | PacketKind::ConnShutdown | PacketKind::ConnRejected)
}

struct EntryInner {
    state: ConnectionState,
    pull_period: Option<Duration>,
    connection_timeout: Duration,
    queue: VecDeque<Packet>,
    /// number of pull and push requests currently being processed
    in_use: usize,
    last_request_time: Instant,
    terminal_since: Option<Instant>,
}

/// The relay's routing state for one logical connection: the queue of packets waiting for the
///  client's next pull, and the bookkeeping for the idle timeout.
///
/// The relay holds no window state; reliability is end-to-end between client and driver.
pub struct RelayEntry {
    id: ConnectionId,
    remote_address: String,
    queue_capacity: usize,
    inner: Mutex<EntryInner>,
    queue_changed: Notify,
}

/// Marks an entry as in use while a request for it is processed
pub struct InUseGuard {
    entry: Arc<RelayEntry>,
}

impl Drop for InUseGuard {
    fn drop(&mut self) {
        let mut inner = self.entry.inner.lock().unwrap();
        inner.in_use -= 1;
        inner.last_request_time = Instant::now();
    }
}

impl RelayEntry {
    pub fn new(id: ConnectionId, remote_address: String, pull_period: Option<Duration>, connection_timeout: Duration, queue_capacity: usize) -> RelayEntry {
        RelayEntry {
            id,
            remote_address,
            queue_capacity,
            inner: Mutex::new(EntryInner {
                state: ConnectionState::Init,
                pull_period,
                connection_timeout,
                queue: VecDeque::new(),
                in_use: 0,
                last_request_time: Instant::now(),
                terminal_since: None,
            }),
            queue_changed: Notify::new(),
        }
    }

    /// An entry rebuilt from a driver's link init snapshot, with the driver's unacked packets
    ///  queued for the client
    pub fn from_snapshot(snapshot: &ConnectionSnapshot, queue_capacity: usize) -> RelayEntry {
        let result = RelayEntry::new(snapshot.id, snapshot.peer_address.clone(), snapshot.pull_period, snapshot.connection_timeout, queue_capacity);
        result.update_from_snapshot(snapshot);
        result
    }

    /// Adopts state and options of a snapshot, and queues all of its unacked packets that are
    ///  not queued already
    pub fn update_from_snapshot(&self, snapshot: &ConnectionSnapshot) {
        let mut inner = self.inner.lock().unwrap();
        inner.state = snapshot.state;
        inner.pull_period = snapshot.pull_period;
        inner.connection_timeout = snapshot.connection_timeout;

        let queued: FxHashSet<SeqNo> = inner.queue.iter()
            .filter(|p| p.kind.is_sequenced())
            .map(|p| p.sequence)
            .collect();
        let mut num_seeded = 0;
        for p in &snapshot.unacked {
            if !queued.contains(&p.sequence) {
                inner.queue.push_back(p.clone());
                num_seeded += 1;
            }
        }
        debug!("connection {}: restored in state {:?}, {} unacked packets queued", self.id, snapshot.state, num_seeded);
        drop(inner);
        self.queue_changed.notify_waiters();
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn remote_address(&self) -> &str {
        &self.remote_address
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.lock().unwrap().state
    }

    pub fn pull_period(&self) -> Option<Duration> {
        self.inner.lock().unwrap().pull_period
    }

    pub fn connection_timeout(&self) -> Duration {
        self.inner.lock().unwrap().connection_timeout
    }

    pub fn queue_len(&self) -> usize {
        self.inner.lock().unwrap().queue.len()
    }

    /// a copy of the pull queue's content
    pub fn queued_packets(&self) -> Vec<Packet> {
        self.inner.lock().unwrap().queue.iter().cloned().collect()
    }

    pub fn is_in_use(&self) -> bool {
        self.inner.lock().unwrap().in_use > 0
    }

    pub fn enter(self: &Arc<Self>) -> InUseGuard {
        let mut inner = self.inner.lock().unwrap();
        inner.in_use += 1;
        inner.last_request_time = Instant::now();
        InUseGuard { entry: self.clone() }
    }

    /// Tracks the client's renegotiated options on their way to the driver
    pub fn peek_option(&self, payload: &[u8]) {
        let mut inner = self.inner.lock().unwrap();
        match ConnectionOption::deser(payload) {
            Ok(ConnectionOption::PullPeriod(p)) => inner.pull_period = p,
            Ok(ConnectionOption::ConnectionTimeout(t)) => inner.connection_timeout = t,
            Err(e) => debug!("connection {}: unparsable connection option: {}", self.id, e),
        }
    }

    /// Queues a packet from the driver for the client.
    ///
    /// A terminal packet discards everything queued after the packet it replaces: an abort
    ///  preempts queued data, while a shutdown is queued behind it so the client gets to see the
    ///  data first.
    pub fn enqueue(&self, packet: Packet, now: Instant) {
        let mut inner = self.inner.lock().unwrap();
        if inner.state.is_terminal() && inner.queue.front().map_or(false, |p| is_terminal_kind(p.kind)) {
            trace!("connection {} is terminated - dropping {:?}", self.id, packet);
            return;
        }

        match packet.kind {
            PacketKind::ConnInitAck => {
                if inner.state == ConnectionState::Init {
                    inner.state = ConnectionState::Connected;
                }
                inner.queue.push_back(packet);
            }
            PacketKind::ConnAbort | PacketKind::ConnRejected => {
                inner.queue.clear();
                inner.queue.push_back(packet);
                inner.state = ConnectionState::Aborted;
                inner.terminal_since.get_or_insert(now);
            }
            PacketKind::ConnShutdown => {
                inner.queue.push_back(packet);
                if inner.state != ConnectionState::Aborted {
                    inner.state = ConnectionState::Closed;
                }
                inner.terminal_since.get_or_insert(now);
            }
            _ => {
                if inner.queue.len() >= self.queue_capacity {
                    debug!("pull queue of connection {} is full - dropping {:?}", self.id, packet);
                    return;
                }
                inner.queue.push_back(packet);
            }
        }
        drop(inner);
        self.queue_changed.notify_waiters();
    }

    /// Aborts the connection toward the client. Returns `false` if it was terminated already.
    pub fn abort(&self, now: Instant) -> bool {
        if self.state().is_terminal() {
            return false;
        }
        self.enqueue(Packet::control(PacketKind::ConnAbort, self.id), now);
        true
    }

    /// Marks the entry terminal without anything left to deliver to the client, e.g. because the
    ///  client itself aborted
    pub fn terminate(&self, now: Instant) {
        let mut inner = self.inner.lock().unwrap();
        inner.queue.clear();
        inner.state = ConnectionState::Aborted;
        inner.terminal_since.get_or_insert(now);
        drop(inner);
        self.queue_changed.notify_waiters();
    }

    /// Takes packets for a pull response. In drain mode this takes frames up to
    ///  [MAX_PACKET_SIZE] bytes (at least one), stopping after a handshake ack. Terminal packets
    ///  are returned but stay queued; the second return value signals that one was reached.
    pub fn take_for_pull(&self, one_packet_per_request: bool) -> (Vec<Packet>, bool) {
        let mut inner = self.inner.lock().unwrap();
        let mut result = Vec::new();
        let mut size = 0;

        while let Some(head) = inner.queue.front() {
            if !result.is_empty() && (one_packet_per_request || size + head.encoded_len() > MAX_PACKET_SIZE) {
                break;
            }
            if is_terminal_kind(head.kind) {
                result.push(head.clone());
                return (result, true);
            }

            let Some(packet) = inner.queue.pop_front() else { break };
            size += packet.encoded_len();
            let is_init_ack = packet.kind == PacketKind::ConnInitAck;
            result.push(packet);
            if one_packet_per_request || is_init_ack {
                break;
            }
        }
        (result, false)
    }

    /// Puts packets of a pull response that could not be delivered back at the head of the queue
    pub fn requeue(&self, packets: Vec<Packet>) {
        let mut inner = self.inner.lock().unwrap();
        for p in packets.into_iter().rev() {
            if !is_terminal_kind(p.kind) {
                inner.queue.push_front(p);
            }
        }
        drop(inner);
        self.queue_changed.notify_waiters();
    }

    /// Waits until the queue has something to pull or `deadline` passes. Returns `false` on
    ///  timeout.
    pub async fn wait_for_packets(&self, deadline: Instant) -> bool {
        loop {
            let changed = self.queue_changed.notified();
            if !self.inner.lock().unwrap().queue.is_empty() {
                return true;
            }
            if tokio::time::timeout_at(deadline, changed).await.is_err() {
                return false;
            }
        }
    }

    /// The idle timeout after which the connection is considered dead if no request for it
    ///  arrives: five pull periods in periodic mode, `default_idle_timeout` in continuous mode
    pub fn idle_timeout(&self, default_idle_timeout: Duration) -> Duration {
        match self.pull_period() {
            Some(p) => 5 * p,
            None => default_idle_timeout,
        }
    }

    /// `true` if the client made no request for longer than the idle timeout and none is in
    ///  progress
    pub fn is_idle_expired(&self, now: Instant, default_idle_timeout: Duration) -> bool {
        let timeout = self.idle_timeout(default_idle_timeout);
        let inner = self.inner.lock().unwrap();
        inner.in_use == 0 && !inner.state.is_terminal() && now.saturating_duration_since(inner.last_request_time) > timeout
    }

    /// `true` for an entry that is terminated for long enough that a client which is still
    ///  around had its chance to pull the terminal packet
    pub fn is_stale(&self, now: Instant, default_idle_timeout: Duration) -> bool {
        let timeout = self.idle_timeout(default_idle_timeout);
        let inner = self.inner.lock().unwrap();
        match inner.terminal_since {
            Some(since) => inner.in_use == 0 && now.saturating_duration_since(since) > timeout,
            None => false,
        }
    }

    pub fn debug_state(&self) -> String {
        let inner = self.inner.lock().unwrap();
        format!("{:?} from {}, {} queued, {} requests in progress, pull period {:?}", inner.state, self.remote_address, inner.queue.len(), inner.in_use, inner.pull_period)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use rstest::rstest;

    fn id() -> ConnectionId {
        ConnectionId::from_raw(3)
    }

    fn data(seq: u64, len: usize) -> Packet {
        Packet::sequenced(PacketKind::Data, id(), SeqNo::from_raw(seq), Bytes::from(vec![b'x'; len]))
    }

    fn entry() -> Arc<RelayEntry> {
        Arc::new(RelayEntry::new(id(), "10.0.0.3".to_string(), None, Duration::from_secs(60), 16))
    }

    fn kinds(packets: &[Packet]) -> Vec<PacketKind> {
        packets.iter().map(|p| p.kind).collect()
    }

    #[rstest]
    #[case::one_packet(true, vec![10, 10, 10], vec![1])]
    #[case::drain_small(false, vec![10, 10, 10], vec![3])]
    #[case::drain_up_to_limit(false, vec![4000, 4000, 4000], vec![2, 1])]
    #[case::oversized_first(false, vec![8192, 10], vec![1, 1])]
    fn test_take_for_pull(#[case] one_packet: bool, #[case] sizes: Vec<usize>, #[case] expected_batches: Vec<usize>) {
        let entry = entry();
        for (i, len) in sizes.iter().enumerate() {
            entry.enqueue(data(i as u64 + 1, *len), Instant::now());
        }

        let mut batches = Vec::new();
        loop {
            let (packets, terminal) = entry.take_for_pull(one_packet);
            assert!(!terminal);
            if packets.is_empty() {
                break;
            }
            batches.push(packets.len());
        }
        assert_eq!(&batches[..expected_batches.len()], &expected_batches[..]);
    }

    #[test]
    fn test_pull_stops_after_init_ack() {
        let entry = entry();
        entry.enqueue(Packet::control(PacketKind::ConnInitAck, id()), Instant::now());
        entry.enqueue(data(1, 5), Instant::now());
        assert_eq!(entry.state(), ConnectionState::Connected);

        let (packets, _) = entry.take_for_pull(false);
        assert_eq!(kinds(&packets), vec![PacketKind::ConnInitAck]);
        let (packets, _) = entry.take_for_pull(false);
        assert_eq!(kinds(&packets), vec![PacketKind::Data]);
    }

    #[test]
    fn test_abort_preempts_queue_and_sticks() {
        let entry = entry();
        entry.enqueue(data(1, 5), Instant::now());
        assert!(entry.abort(Instant::now()));
        assert!(!entry.abort(Instant::now()));
        entry.enqueue(data(2, 5), Instant::now());

        for _ in 0..2 {
            let (packets, terminal) = entry.take_for_pull(false);
            assert_eq!(kinds(&packets), vec![PacketKind::ConnAbort]);
            assert!(terminal);
        }
        assert_eq!(entry.state(), ConnectionState::Aborted);
    }

    #[rstest]
    #[case::same_response(5, vec![vec![PacketKind::Data, PacketKind::ConnShutdown]])]
    #[case::next_response(8130, vec![vec![PacketKind::Data], vec![PacketKind::ConnShutdown]])]
    fn test_shutdown_is_delivered_after_data(#[case] data_len: usize, #[case] expected: Vec<Vec<PacketKind>>) {
        let entry = entry();
        entry.enqueue(data(1, data_len), Instant::now());
        entry.enqueue(Packet::control(PacketKind::ConnShutdown, id()), Instant::now());
        assert_eq!(entry.state(), ConnectionState::Closed);

        let mut responses = Vec::new();
        loop {
            let (packets, terminal) = entry.take_for_pull(false);
            assert!(packets.iter().map(Packet::encoded_len).sum::<usize>() <= MAX_PACKET_SIZE);
            responses.push(kinds(&packets));
            if terminal {
                break;
            }
        }
        assert_eq!(responses, expected);
    }

    #[test]
    fn test_requeue_restores_order() {
        let entry = entry();
        for seq in 1..=3 {
            entry.enqueue(data(seq, 5), Instant::now());
        }
        let (packets, _) = entry.take_for_pull(true);
        entry.enqueue(data(4, 5), Instant::now());
        entry.requeue(packets);

        let sequences = entry.queued_packets().iter().map(|p| p.sequence.to_raw()).collect::<Vec<_>>();
        assert_eq!(sequences, vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_full_queue_drops_data() {
        let entry = Arc::new(RelayEntry::new(id(), "x".to_string(), None, Duration::from_secs(60), 2));
        for seq in 1..=3 {
            entry.enqueue(data(seq, 5), Instant::now());
        }
        assert_eq!(entry.queue_len(), 2);
        entry.enqueue(Packet::control(PacketKind::ConnAbort, id()), Instant::now());
        assert_eq!(kinds(&entry.queued_packets()), vec![PacketKind::ConnAbort]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_expiry() {
        let entry = Arc::new(RelayEntry::new(id(), "x".to_string(), Some(Duration::from_secs(10)), Duration::from_secs(60), 16));
        let start = Instant::now();
        assert_eq!(entry.idle_timeout(Duration::from_secs(60)), Duration::from_secs(50));

        {
            let _guard = entry.enter();
            tokio::time::advance(Duration::from_secs(100)).await;
            assert!(!entry.is_idle_expired(Instant::now(), Duration::from_secs(60)));
        }

        assert!(!entry.is_idle_expired(Instant::now() + Duration::from_secs(50), Duration::from_secs(60)));
        assert!(entry.is_idle_expired(Instant::now() + Duration::from_secs(51), Duration::from_secs(60)));
        assert!(start < Instant::now());
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_packets() {
        let entry = entry();
        let deadline = Instant::now() + Duration::from_secs(60);
        assert!(!entry.wait_for_packets(Instant::now() + Duration::from_secs(1)).await);

        let waiting = {
            let entry = entry.clone();
            tokio::spawn(async move { entry.wait_for_packets(deadline).await })
        };
        tokio::time::sleep(Duration::from_secs(5)).await;
        entry.enqueue(data(1, 1), Instant::now());
        assert!(waiting.await.unwrap());
    }
}

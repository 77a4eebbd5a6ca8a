use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
#[cfg(test)] use mockall::automock;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use tokio::sync::{Notify, RwLock};
use tokio::time::{self, Instant};
use tracing::{debug, trace, warn};

use crate::config::{ClosePolicy, TunnelConfig};
use crate::control_messages::{ConnRejectedMsg, ConnectionOption, ConnectionSnapshot};
use crate::error::TunnelError;
use crate::packet::{ConnectionId, Packet, PacketKind};
use crate::receive_buffer::{ReceiveBuffer, ReceiveOutcome};
use crate::send_window::{AckOutcome, SendWindow};
use crate::seq_no::SeqNo;

/// Lifecycle of a logical connection. The numeric values are used in link init snapshots.
#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, TryFromPrimitive, IntoPrimitive)]
pub enum ConnectionState {
    /// handshake sent, waiting for the peer's decision
    Init = 1,
    Connected = 2,
    /// a close marker was sent and is waiting for its ack
    Closing = 3,
    Closed = 4,
    Aborted = 5,
}

impl ConnectionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, ConnectionState::Closed | ConnectionState::Aborted)
    }
}

/// The outbound path of a connection. On the driver side, packets go to the link to the relay; on
///  the client side they go to the push task.
///
/// Sending must not block: implementations queue the packet and may drop it if the queue is full,
///  leaving recovery to retransmission.
#[cfg_attr(test, automock)]
pub trait PacketSink: Send + Sync + 'static {
    fn send_packet(&self, packet: Packet);
}

struct ConnectionInner {
    state: ConnectionState,
    send_window: SendWindow,
    receive_buffer: ReceiveBuffer,
    pull_period: Option<Duration>,
    connection_timeout: Duration,
    /// sequence number of this side's close marker, once `close()` sent it
    close_sequence: Option<SeqNo>,
    close_deadline: Option<Instant>,
    /// when the connection reached [ConnectionState::Closed]
    closed_at: Option<Instant>,
    error: Option<TunnelError>,
    /// something was received that is not acknowledged yet
    ack_pending: bool,
}

impl ConnectionInner {
    /// adds the current cumulative ack to an outgoing sequenced packet
    fn stamp(&mut self, packet: Packet) -> Packet {
        self.ack_pending = false;
        let window = self.receive_buffer.advertise_window();
        packet.with_ack(self.receive_buffer.ack_sequence(), window)
    }

    fn standalone_ack(&mut self, id: ConnectionId) -> Packet {
        self.ack_pending = false;
        let window = self.receive_buffer.advertise_window();
        Packet::ack(id, self.receive_buffer.ack_sequence(), window)
    }

    fn terminal_error(&self) -> TunnelError {
        self.error.clone().unwrap_or(TunnelError::Closed)
    }

    /// `Ok(true)` if a sequenced packet can be sent now, `Ok(false)` if the sender must wait
    fn check_writable(&self) -> Result<bool, TunnelError> {
        match self.state {
            ConnectionState::Init => Ok(false),
            ConnectionState::Connected => Ok(self.send_window.has_room()),
            ConnectionState::Closing | ConnectionState::Closed => {
                if self.receive_buffer.close_received() {
                    Err(TunnelError::ResetByPeer)
                }
                else {
                    Err(TunnelError::Closed)
                }
            }
            ConnectionState::Aborted => Err(self.terminal_error()),
        }
    }
}

/// One logical stream multiplexed over the tunnel. A [Connection] ties a [SendWindow] and a
///  [ReceiveBuffer] together, runs the lifecycle state machine and hands outgoing packets to its
///  [PacketSink].
///
/// Inbound packets are fed by the owning driver through [Connection::on_packet]; retransmission
///  and close timeouts are driven by the driver's shared sweep calling [Connection::on_tick].
///  Application code reads and writes through a [crate::tunnel_handle::TunnelHandle].
pub struct Connection {
    id: ConnectionId,
    peer_address: String,
    config: Arc<TunnelConfig>,
    sink: Arc<dyn PacketSink>,
    inner: RwLock<ConnectionInner>,
    readable: Notify,
    writable: Notify,
    state_changed: Notify,
}

impl Connection {
    pub fn new(
        id: ConnectionId,
        peer_address: String,
        config: Arc<TunnelConfig>,
        sink: Arc<dyn PacketSink>,
        pull_period: Option<Duration>,
        connection_timeout: Duration,
    ) -> Connection {
        let inner = ConnectionInner {
            state: ConnectionState::Init,
            send_window: SendWindow::new(config.window_size, &config.retransmit),
            receive_buffer: ReceiveBuffer::new(config.window_size),
            pull_period,
            connection_timeout,
            close_sequence: None,
            close_deadline: None,
            closed_at: None,
            error: None,
            ack_pending: false,
        };
        Connection {
            id,
            peer_address,
            config,
            sink,
            inner: RwLock::new(inner),
            readable: Notify::new(),
            writable: Notify::new(),
            state_changed: Notify::new(),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer_address(&self) -> &str {
        &self.peer_address
    }

    pub async fn state(&self) -> ConnectionState {
        self.inner.read().await.state
    }

    pub async fn is_terminal(&self) -> bool {
        self.state().await.is_terminal()
    }

    /// `true` once the connection can be forgotten: it was aborted, or it was closed gracefully
    ///  at least `linger` ago. Until then, retransmitted close markers are still acknowledged.
    pub async fn is_removable(&self, now: Instant, linger: Duration) -> bool {
        let inner = self.inner.read().await;
        match inner.state {
            ConnectionState::Aborted => true,
            ConnectionState::Closed => inner.closed_at.map_or(true, |t| now.saturating_duration_since(t) >= linger),
            _ => false,
        }
    }

    pub async fn pull_period(&self) -> Option<Duration> {
        self.inner.read().await.pull_period
    }

    pub async fn connection_timeout(&self) -> Duration {
        self.inner.read().await.connection_timeout
    }

    fn wake_all(&self) {
        self.readable.notify_waiters();
        self.writable.notify_waiters();
        self.state_changed.notify_waiters();
    }

    /// Completes a handshake on the accepting side. Returns `false` if the connection was
    ///  terminated in the meantime.
    pub async fn accept(&self) -> bool {
        let mut inner = self.inner.write().await;
        if inner.state != ConnectionState::Init {
            return false;
        }
        debug!("connection {} accepted", self.id);
        inner.state = ConnectionState::Connected;
        self.wake_all();
        true
    }

    /// Waits for the handshake to complete. Fails if the peer rejected the connection or it was
    ///  aborted before it was established.
    pub async fn wait_connected(&self) -> Result<(), TunnelError> {
        loop {
            let changed = self.state_changed.notified();
            {
                let inner = self.inner.read().await;
                match inner.state {
                    ConnectionState::Init => {}
                    ConnectionState::Aborted => return Err(inner.terminal_error()),
                    _ => return Ok(()),
                }
            }
            changed.await;
        }
    }

    /// Suspends until the send window has room, then sends a sequenced packet. Sending the close
    ///  marker moves the connection to [ConnectionState::Closing].
    async fn send_sequenced(&self, kind: PacketKind, payload: Bytes) -> Result<SeqNo, TunnelError> {
        loop {
            let writable = self.writable.notified();
            {
                let mut inner = self.inner.write().await;
                if inner.check_writable()? {
                    let now = Instant::now();
                    let packet = inner.send_window.push(kind, self.id, payload, now);
                    let seq = packet.sequence;
                    if kind == PacketKind::ConnClose {
                        debug!("connection {} closing at {:?}", self.id, seq);
                        inner.state = ConnectionState::Closing;
                        inner.close_sequence = Some(seq);
                        inner.close_deadline = Some(now + self.config.close_wait_timeout);
                        self.state_changed.notify_waiters();
                    }
                    let packet = inner.stamp(packet);
                    trace!("sending {:?}", packet);
                    self.sink.send_packet(packet);
                    return Ok(seq);
                }
            }
            writable.await;
        }
    }

    /// Writes `data`, split into packets of at most the configured payload length. This suspends
    ///  while the send window is full.
    pub async fn write(&self, data: &[u8]) -> Result<(), TunnelError> {
        for chunk in data.chunks(self.config.max_payload_len) {
            self.send_sequenced(PacketKind::Data, Bytes::copy_from_slice(chunk)).await?;
        }
        Ok(())
    }

    /// Reads up to `max_len` bytes of in-order data, suspending until data is available.
    ///  `Ok(None)` signals that the peer closed the connection and all its data was read.
    pub async fn read(&self, max_len: usize) -> Result<Option<Bytes>, TunnelError> {
        if max_len == 0 {
            return Ok(Some(Bytes::new()));
        }

        loop {
            let readable = self.readable.notified();
            {
                let mut inner = self.inner.write().await;
                if let Some(data) = inner.receive_buffer.read(max_len) {
                    if inner.receive_buffer.needs_window_update() && inner.state != ConnectionState::Aborted {
                        let ack = inner.standalone_ack(self.id);
                        trace!("window reopened, sending {:?}", ack);
                        self.sink.send_packet(ack);
                    }
                    return Ok(Some(data));
                }
                if inner.receive_buffer.is_eof() {
                    return Ok(None);
                }
                match inner.state {
                    ConnectionState::Aborted => return Err(inner.terminal_error()),
                    ConnectionState::Closing | ConnectionState::Closed if inner.close_sequence.is_some() => return Err(TunnelError::Closed),
                    _ => {}
                }
            }
            readable.await;
        }
    }

    /// Closes the connection according to the configured [ClosePolicy]
    pub async fn close(&self) -> Result<(), TunnelError> {
        {
            let mut inner = self.inner.write().await;
            match inner.state {
                ConnectionState::Init => {
                    self.abort_locked(&mut inner, TunnelError::Closed, true);
                    return Ok(());
                }
                ConnectionState::Connected => {}
                ConnectionState::Closing | ConnectionState::Closed | ConnectionState::Aborted => return Ok(()),
            }

            if self.config.close_policy == ClosePolicy::Abandon && !inner.send_window.is_empty() {
                debug!("connection {} closed with {} unacknowledged packets - aborting", self.id, inner.send_window.len());
                self.abort_locked(&mut inner, TunnelError::Closed, true);
                return Ok(());
            }
        }

        let deadline = Instant::now() + self.config.close_wait_timeout;
        match time::timeout_at(deadline, self.send_sequenced(PacketKind::ConnClose, Bytes::new())).await {
            Ok(result) => { result?; }
            Err(_) => {
                self.abort(TunnelError::Timeout, true).await;
                return Err(TunnelError::Timeout);
            }
        }

        if self.config.close_policy == ClosePolicy::Abandon {
            return Ok(());
        }

        loop {
            let changed = self.state_changed.notified();
            {
                let inner = self.inner.read().await;
                match inner.state {
                    ConnectionState::Closed => return Ok(()),
                    ConnectionState::Aborted => return Err(inner.terminal_error()),
                    _ => {}
                }
            }
            if time::timeout_at(deadline, changed).await.is_err() {
                debug!("connection {}: close was not acknowledged in time", self.id);
                self.abort(TunnelError::Timeout, true).await;
                return Err(TunnelError::Timeout);
            }
        }
    }

    /// Terminates the connection immediately, discarding all pending data. Readers and writers
    ///  get `error`. Nothing happens if the connection is terminated already.
    pub async fn abort(&self, error: TunnelError, notify_peer: bool) {
        let mut inner = self.inner.write().await;
        self.abort_locked(&mut inner, error, notify_peer);
    }

    fn abort_locked(&self, inner: &mut ConnectionInner, error: TunnelError, notify_peer: bool) {
        if inner.state.is_terminal() {
            return;
        }
        debug!("aborting connection {}: {}", self.id, error);
        inner.state = ConnectionState::Aborted;
        inner.error = Some(error);
        inner.send_window.discard();
        if notify_peer {
            self.sink.send_packet(Packet::control(PacketKind::ConnAbort, self.id));
        }
        self.wake_all();
    }

    fn protocol_violation(&self, inner: &mut ConnectionInner, e: anyhow::Error) {
        warn!("protocol violation on connection {}: {}", self.id, e);
        self.abort_locked(inner, TunnelError::Aborted(format!("protocol violation: {}", e)), true);
    }

    /// Processes an inbound packet for this connection. `more_data` signals that more packets
    ///  for this connection follow immediately, so the ack can be deferred until the last one.
    pub async fn on_packet(&self, packet: Packet, more_data: bool) {
        let mut inner = self.inner.write().await;
        if inner.state == ConnectionState::Aborted {
            trace!("ignoring {:?} for aborted connection", packet);
            return;
        }

        if let Some(ack) = packet.ack_sequence {
            if !self.on_ack(&mut inner, ack, packet.ack_window, packet.kind == PacketKind::Ack) {
                return;
            }
        }

        match packet.kind {
            PacketKind::Data | PacketKind::ConnClose | PacketKind::ConnOption => self.on_sequenced(&mut inner, packet),
            PacketKind::Ack | PacketKind::NoOp | PacketKind::Dummy => {}
            PacketKind::ConnInitAck => {
                if inner.state == ConnectionState::Init {
                    debug!("connection {} established", self.id);
                    inner.state = ConnectionState::Connected;
                    self.wake_all();
                }
            }
            PacketKind::ConnRejected => {
                if inner.state == ConnectionState::Init {
                    let reason = match ConnRejectedMsg::deser(&packet.payload) {
                        Ok(msg) => msg.reason,
                        Err(e) => format!("unparsable rejection: {}", e),
                    };
                    self.abort_locked(&mut inner, TunnelError::ConnectRejected(reason), false);
                }
            }
            PacketKind::ConnAbort => {
                self.abort_locked(&mut inner, TunnelError::Aborted("aborted by peer".to_string()), false);
            }
            PacketKind::ConnShutdown => {
                if inner.state != ConnectionState::Closed {
                    self.abort_locked(&mut inner, TunnelError::Aborted("connection shut down by peer".to_string()), false);
                }
            }
            PacketKind::ConnInit | PacketKind::LinkInit | PacketKind::ListenStateChange => {
                debug!("unexpected {:?} for connection {} - ignoring", packet, self.id);
            }
        }

        if !more_data && inner.ack_pending && inner.state != ConnectionState::Aborted {
            let ack = inner.standalone_ack(self.id);
            trace!("sending {:?}", ack);
            self.sink.send_packet(ack);
        }
    }

    /// returns `false` if the ack terminated the connection
    fn on_ack(&self, inner: &mut ConnectionInner, ack: SeqNo, window: u32, is_pure_ack: bool) -> bool {
        match inner.send_window.on_ack(ack, window, is_pure_ack, Instant::now()) {
            Err(e) => {
                self.protocol_violation(inner, e);
                false
            }
            Ok(AckOutcome::Advanced { .. }) => {
                if inner.state == ConnectionState::Closing && inner.close_sequence.map_or(false, |s| ack >= s) {
                    debug!("connection {} closed", self.id);
                    inner.state = ConnectionState::Closed;
                    inner.closed_at = Some(Instant::now());
                    self.wake_all();
                }
                self.writable.notify_waiters();
                true
            }
            Ok(AckOutcome::Duplicate { fast_retransmit: Some(packet) }) => {
                debug!("fast retransmit of {:?}", packet);
                let packet = inner.stamp(packet);
                self.sink.send_packet(packet);
                true
            }
            Ok(AckOutcome::WindowUpdate) => {
                self.writable.notify_waiters();
                true
            }
            Ok(_) => true,
        }
    }

    fn on_sequenced(&self, inner: &mut ConnectionInner, packet: Packet) {
        inner.ack_pending = true;
        match inner.receive_buffer.on_packet(packet) {
            ReceiveOutcome::Accepted { control } => {
                for p in control {
                    match p.kind {
                        PacketKind::ConnOption => self.apply_option(inner, &p.payload),
                        PacketKind::ConnClose => self.on_peer_close(inner),
                        _ => {}
                    }
                }
                if inner.receive_buffer.has_data() {
                    self.readable.notify_waiters();
                }
            }
            outcome => trace!("connection {}: {:?}", self.id, outcome),
        }
    }

    fn apply_option(&self, inner: &mut ConnectionInner, payload: &[u8]) {
        match ConnectionOption::deser(payload) {
            Ok(ConnectionOption::PullPeriod(p)) => {
                debug!("connection {}: peer set pull period to {:?}", self.id, p);
                inner.pull_period = p;
            }
            Ok(ConnectionOption::ConnectionTimeout(t)) => {
                debug!("connection {}: peer set connection timeout to {:?}", self.id, t);
                inner.connection_timeout = t;
            }
            Err(e) => warn!("connection {}: ignoring malformed connection option: {}", self.id, e),
        }
    }

    /// The peer reads no more, so pending outbound data is dropped. The close marker is acked
    ///  right away since this connection may be removed before the next ack would go out.
    fn on_peer_close(&self, inner: &mut ConnectionInner) {
        debug!("connection {} closed by peer", self.id);
        inner.send_window.discard();
        inner.state = ConnectionState::Closed;
        inner.closed_at = Some(Instant::now());
        let ack = inner.standalone_ack(self.id);
        self.sink.send_packet(ack);
        self.wake_all();
    }

    /// Called periodically by the owning driver: retransmits packets whose timer expired and
    ///  enforces the close timeout and the retransmission ceiling.
    pub async fn on_tick(&self, now: Instant) {
        let mut inner = self.inner.write().await;
        if inner.state.is_terminal() {
            return;
        }

        if inner.state == ConnectionState::Closing && inner.close_deadline.map_or(false, |d| now >= d) {
            self.abort_locked(&mut inner, TunnelError::Timeout, true);
            return;
        }

        let due = inner.send_window.due_retransmits(now);
        if let Some(max_retransmits) = self.config.retransmit.max_retransmits {
            if inner.send_window.max_retransmit_count() > max_retransmits {
                debug!("connection {}: retransmission limit exceeded", self.id);
                self.abort_locked(&mut inner, TunnelError::Timeout, true);
                return;
            }
        }
        for packet in due {
            debug!("retransmitting {:?}", packet);
            let packet = inner.stamp(packet);
            self.sink.send_packet(packet);
        }
    }

    /// the earliest point in time at which [Connection::on_tick] has work to do
    pub async fn next_deadline(&self) -> Option<Instant> {
        let inner = self.inner.read().await;
        let retransmit = inner.send_window.next_deadline();
        match (retransmit, inner.close_deadline) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Changes the pull period and announces it to the peer
    pub async fn set_pull_period(&self, pull_period: Option<Duration>) -> Result<(), TunnelError> {
        self.send_sequenced(PacketKind::ConnOption, ConnectionOption::PullPeriod(pull_period).to_payload()).await?;
        self.inner.write().await.pull_period = pull_period;
        Ok(())
    }

    /// Changes the connection timeout and announces it to the peer
    pub async fn set_connection_timeout(&self, timeout: Duration) -> Result<(), TunnelError> {
        self.send_sequenced(PacketKind::ConnOption, ConnectionOption::ConnectionTimeout(timeout).to_payload()).await?;
        self.inner.write().await.connection_timeout = timeout;
        Ok(())
    }

    pub async fn snapshot(&self) -> ConnectionSnapshot {
        let inner = self.inner.read().await;
        ConnectionSnapshot {
            id: self.id,
            state: inner.state,
            peer_address: self.peer_address.clone(),
            pull_period: inner.pull_period,
            connection_timeout: inner.connection_timeout,
            send_base: inner.send_window.send_base(),
            send_next: inner.send_window.send_next(),
            recv_expected: inner.receive_buffer.recv_expected(),
            peer_window: inner.send_window.peer_window(),
            unacked: inner.send_window.unacked_packets().cloned().collect(),
        }
    }

    pub async fn debug_state(&self) -> BTreeMap<String, String> {
        let inner = self.inner.read().await;
        let mut result = BTreeMap::new();
        let mut put = |key: &str, value: String| {
            result.insert(key.to_string(), value);
        };

        put("id", self.id.to_string());
        put("peer_address", self.peer_address.clone());
        put("state", format!("{:?}", inner.state));
        put("send_base", inner.send_window.send_base().to_string());
        put("send_next", inner.send_window.send_next().to_string());
        put("unacked", inner.send_window.len().to_string());
        put("peer_window", inner.send_window.peer_window().to_string());
        put("retransmit_timeout_ms", inner.send_window.rto().timeout().as_millis().to_string());
        if let Some(srtt) = inner.send_window.rto().smoothed_rtt() {
            put("smoothed_rtt_ms", srtt.as_millis().to_string());
        }
        put("recv_expected", inner.receive_buffer.recv_expected().to_string());
        put("ready_packets", inner.receive_buffer.num_ready().to_string());
        put("reordered_packets", inner.receive_buffer.num_reordered().to_string());
        put("pull_period", match inner.pull_period {
            None => "continuous".to_string(),
            Some(p) => format!("{}s", p.as_secs()),
        });
        put("connection_timeout", format!("{}s", inner.connection_timeout.as_secs()));
        if let Some(e) = &inner.error {
            put("error", e.to_string());
        }
        result
    }
}

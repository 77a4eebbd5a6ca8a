//! The broker-side end of the tunnel. A [ServerDriver] owns the physical link to the relay, keeps
//!  the authoritative [ConnectionTable] for it and hands accepted connections to the application.
//!
//! The link is re-established when it breaks, and every new link session starts by replaying the
//!  table to the relay so that a restarted relay can pick up all live connections where they were.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::bail;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::select;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::mpsc::OwnedPermit;
use tokio::sync::{mpsc, watch, RwLock};
use tokio::time::{self, Instant};
use tracing::{debug, error, info, instrument, trace, warn};

use crate::config::TunnelConfig;
use crate::connection::{Connection, PacketSink};
use crate::connection_table::ConnectionTable;
use crate::control_messages::{ConnInitMsg, ConnRejectedMsg, ListenStateMsg};
use crate::drain_barrier::DrainBarrier;
use crate::error::TunnelError;
use crate::link::{self, LinkReader, LinkSink};
use crate::packet::{ConnectionId, Packet, PacketKind, MAX_LINK_PAYLOAD_SIZE};
use crate::tunnel_handle::TunnelHandle;

pub struct ServerDriver {
    config: Arc<TunnelConfig>,
    service_name: String,
    table: RwLock<ConnectionTable<Connection>>,
    sink: Arc<LinkSink>,
    listening: AtomicBool,
    /// `None` once the driver is shut down
    accept_queue: Mutex<Option<mpsc::Sender<TunnelHandle>>>,
    accepted: tokio::sync::Mutex<mpsc::Receiver<TunnelHandle>>,
    barrier: Arc<DrainBarrier>,
    shutdown: watch::Sender<bool>,
}

impl ServerDriver {
    pub fn new(config: TunnelConfig, service_name: impl Into<String>) -> anyhow::Result<Arc<ServerDriver>> {
        config.validate()?;
        let (accept_send, accept_recv) = mpsc::channel(config.accept_backlog);
        let (shutdown, _) = watch::channel(false);

        Ok(Arc::new(ServerDriver {
            config: Arc::new(config),
            service_name: service_name.into(),
            table: Default::default(),
            sink: Arc::new(LinkSink::new()),
            listening: AtomicBool::new(true),
            accept_queue: Mutex::new(Some(accept_send)),
            accepted: tokio::sync::Mutex::new(accept_recv),
            barrier: Arc::new(DrainBarrier::new()),
            shutdown,
        }))
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    pub fn is_listening(&self) -> bool {
        self.listening.load(Ordering::Acquire)
    }

    pub async fn num_connections(&self) -> usize {
        self.table.read().await.len()
    }

    /// Waits for the next accepted connection. Fails with [TunnelError::ShuttingDown] once the
    ///  driver is shut down and all previously accepted connections were picked up.
    pub async fn accept(&self) -> Result<TunnelHandle, TunnelError> {
        self.accepted.lock().await
            .recv().await
            .ok_or(TunnelError::ShuttingDown)
    }

    /// Starts or stops accepting handshakes, and tells the relay so it can reject them early
    pub fn set_listening(&self, listening: bool) {
        info!("service {}: listening = {}", self.service_name, listening);
        self.listening.store(listening, Ordering::Release);
        self.sink.send_packet(self.listen_state_packet());
    }

    fn listen_state_packet(&self) -> Packet {
        let msg = ListenStateMsg {
            service_name: self.service_name.clone(),
            listening: self.is_listening(),
        };
        Packet::new(PacketKind::ListenStateChange, ConnectionId::LINK, msg.to_payload())
    }

    /// Keeps the link to the relay at `relay_addr` up until the driver is shut down.
    ///
    /// If the link stays down for [crate::config::LinkConfig::max_retry_wait] in total, all
    ///  connections are aborted; the driver still keeps trying so that new connections can be
    ///  accepted once the relay is back.
    #[instrument(name = "link", skip_all, fields(service = %self.service_name, relay = %relay_addr))]
    pub async fn run_link(self: Arc<Self>, relay_addr: String) {
        let mut shutdown = self.shutdown.subscribe();
        let mut accumulated_wait = Duration::ZERO;

        loop {
            if *shutdown.borrow() {
                break;
            }

            select! {
                stream = TcpStream::connect(&relay_addr) => match stream {
                    Ok(stream) => {
                        if let Err(e) = stream.set_nodelay(true) {
                            debug!("could not set TCP_NODELAY: {}", e);
                        }
                        info!("link to relay is up");
                        accumulated_wait = Duration::ZERO;
                        match self.run_session(stream).await {
                            Ok(()) => info!("link to relay closed"),
                            Err(e) => warn!("link to relay broke: {}", e),
                        }
                    }
                    Err(e) => debug!("connecting to relay failed: {}", e),
                },
                _ = async { shutdown.wait_for(|s| *s).await.map(|_| ()) } => break,
            }

            if accumulated_wait >= self.config.link.max_retry_wait {
                error!("link to relay is down for {:?} - aborting all connections", accumulated_wait);
                self.abort_all(TunnelError::Aborted("link to relay lost".to_string())).await;
                accumulated_wait = Duration::ZERO;
            }

            select! {
                _ = time::sleep(self.config.link.retry_interval) => {}
                _ = async { shutdown.wait_for(|s| *s).await.map(|_| ()) } => break,
            }
            accumulated_wait += self.config.link.retry_interval;
        }
        info!("driver shut down - link loop terminated");
    }

    /// One link session: replays the connection table, then dispatches inbound packets until the
    ///  link breaks or the driver is shut down
    async fn run_session<S>(&self, stream: S) -> anyhow::Result<()>
    where S: AsyncRead + AsyncWrite + Send + 'static
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let (send_queue, recv_queue) = mpsc::channel(self.config.link.send_queue_len);

        let link_init = self.table.read().await
            .snapshot(&self.service_name).await;
        debug!("replaying {} connections to relay", link_init.connections.len());
        let payload = link_init.to_payload();
        if payload.len() > MAX_LINK_PAYLOAD_SIZE {
            bail!("link init snapshot has {} bytes, exceeding the limit of {}", payload.len(), MAX_LINK_PAYLOAD_SIZE);
        }

        let mut writer = tokio::spawn(link::write_loop(write_half, recv_queue));
        send_queue.send(Packet::new(PacketKind::LinkInit, ConnectionId::LINK, payload)).await?;
        send_queue.send(self.listen_state_packet()).await?;
        self.sink.attach(send_queue);

        let mut shutdown = self.shutdown.subscribe();
        let mut reader = LinkReader::new(read_half);

        let result = loop {
            select! {
                packet = reader.read_packet() => match packet {
                    Ok(Some(packet)) => self.on_link_packet(packet).await,
                    Ok(None) => break Ok(()),
                    Err(e) => break Err(e),
                },
                written = &mut writer => break match written {
                    Ok(result) => result,
                    Err(e) => Err(e.into()),
                },
                _ = async { shutdown.wait_for(|s| *s).await.map(|_| ()) } => break Ok(()),
            }
        };

        self.sink.detach();
        writer.abort();
        result
    }

    async fn on_link_packet(&self, packet: Packet) {
        trace!("received {:?}", packet);
        if packet.connection_id.is_link() {
            match packet.kind {
                PacketKind::NoOp | PacketKind::Dummy => {}
                _ => debug!("ignoring unexpected link-level {:?}", packet),
            }
            return;
        }

        let Some(_guard) = self.barrier.try_enter() else {
            if packet.kind == PacketKind::ConnInit {
                self.reject(packet.connection_id, "server is shutting down").await;
            }
            else {
                trace!("shutting down - dropping {:?}", packet);
            }
            return;
        };

        if packet.kind == PacketKind::ConnInit {
            self.on_handshake(packet).await;
            return;
        }

        let conn = self.table.read().await.get(packet.connection_id);
        match conn {
            Some(conn) => conn.on_packet(packet, false).await,
            None if packet.kind.is_sequenced() => {
                debug!("{:?} for unknown connection - aborting it", packet);
                self.sink.send_packet(Packet::control(PacketKind::ConnAbort, packet.connection_id));
            }
            None => trace!("ignoring {:?} for unknown connection", packet),
        }
    }

    async fn on_handshake(&self, packet: Packet) {
        let id = packet.connection_id;
        let msg = match ConnInitMsg::deser(&packet.payload) {
            Ok(msg) => msg,
            Err(e) => {
                warn!("malformed handshake for connection {}: {}", id, e);
                self.reject(id, "malformed handshake").await;
                return;
            }
        };

        let admitted = {
            let mut table = self.table.write().await;
            match self.admit(&table, id) {
                Ok(permit) => {
                    let conn = Arc::new(Connection::new(id, msg.remote_address, self.config.clone(), self.sink.clone(), msg.pull_period, msg.connection_timeout));
                    conn.accept().await;
                    table.put(id, conn.clone());
                    Ok((conn, permit))
                }
                Err(reason) => Err(reason),
            }
        };

        // replies are sent without holding the table lock: they wait for room in the send queue
        match admitted {
            Ok((conn, permit)) => {
                debug!("accepted connection {} from {}", id, conn.peer_address());
                self.sink.send_control(Packet::control(PacketKind::ConnInitAck, id)).await;
                permit.send(TunnelHandle::new(conn));
            }
            Err(reason) => {
                debug!("rejecting handshake for connection {}: {}", id, reason);
                self.reject(id, reason).await;
            }
        }
    }

    /// Reserves a backlog slot for an admissible handshake, so that an acked connection always
    ///  reaches the application
    fn admit(&self, table: &ConnectionTable<Connection>, id: ConnectionId) -> Result<OwnedPermit<TunnelHandle>, &'static str> {
        self.check_admission(table, id)?;

        let accept_queue = self.accept_queue.lock().unwrap().clone();
        match accept_queue.map(|q| q.try_reserve_owned()) {
            None | Some(Err(TrySendError::Closed(_))) => Err("server is shutting down"),
            Some(Err(TrySendError::Full(_))) => Err("accept backlog full"),
            Some(Ok(permit)) => Ok(permit),
        }
    }

    fn check_admission(&self, table: &ConnectionTable<Connection>, id: ConnectionId) -> Result<(), &'static str> {
        if !self.is_listening() {
            return Err("service is not listening");
        }
        if table.contains(id) {
            warn!("protocol violation: handshake for connection {} which is already open", id);
            return Err("connection id already in use");
        }
        if table.len() >= self.config.max_connections {
            return Err("too many connections");
        }
        Ok(())
    }

    async fn reject(&self, id: ConnectionId, reason: &str) {
        let payload = ConnRejectedMsg { reason: reason.to_string() }.to_payload();
        self.sink.send_control(Packet::new(PacketKind::ConnRejected, id, payload)).await;
    }

    /// The shared ticker driving retransmission and close timeouts of all connections, and
    ///  cleaning up terminated ones. Runs until the driver is shut down.
    #[instrument(name = "sweep", skip_all, fields(service = %self.service_name))]
    pub async fn sweep_loop(self: Arc<Self>) {
        let mut shutdown = self.shutdown.subscribe();
        let mut ticks = time::interval(self.config.sweep_interval);
        loop {
            select! {
                _ = ticks.tick() => self.sweep(Instant::now()).await,
                _ = async { shutdown.wait_for(|s| *s).await.map(|_| ()) } => break,
            }
        }
        debug!("sweep terminated");
    }

    async fn sweep(&self, now: Instant) {
        let connections = self.table.read().await.entries();

        let mut terminated = Vec::new();
        for conn in connections {
            conn.on_tick(now).await;
            if conn.is_removable(now, self.config.close_linger).await {
                terminated.push(conn.id());
            }
        }

        if terminated.is_empty() {
            return;
        }
        let mut table = self.table.write().await;
        for id in terminated {
            if table.remove(id).is_some() {
                debug!("removing terminated connection {}", id);
                self.sink.send_packet(Packet::control(PacketKind::ConnShutdown, id));
            }
        }
    }

    async fn abort_all(&self, error: TunnelError) {
        let connections = self.table.write().await.clear();
        for conn in connections {
            conn.abort(error.clone(), true).await;
        }
    }

    /// Stops accepting work, waits up to `timeout` for packet dispatches in flight, and aborts
    ///  all remaining connections. Returns an error if the dispatches did not finish in time;
    ///  the driver is shut down regardless.
    pub async fn shutdown(&self, timeout: Duration) -> anyhow::Result<()> {
        info!("shutting down driver for service {}", self.service_name);
        self.accept_queue.lock().unwrap().take();
        let drained = self.barrier.close_and_drain(timeout, self.config.shutdown_progress_interval).await;

        self.listening.store(false, Ordering::Release);
        self.sink.send_packet(self.listen_state_packet());
        self.abort_all(TunnelError::ShuttingDown).await;
        self.shutdown.send_replace(true);

        info!("driver for service {} shut down", self.service_name);
        drained
    }

    pub async fn debug_state(&self) -> BTreeMap<String, String> {
        let mut result = BTreeMap::new();
        result.insert("service".to_string(), self.service_name.clone());
        result.insert("listening".to_string(), self.is_listening().to_string());
        result.insert("link_up".to_string(), self.sink.is_attached().to_string());
        result.insert("shutting_down".to_string(), self.barrier.is_closed().to_string());
        result.insert("in_flight_dispatches".to_string(), self.barrier.in_flight().to_string());

        let connections = self.table.read().await.entries();
        result.insert("connections".to_string(), connections.len().to_string());
        for conn in connections {
            for (key, value) in conn.debug_state().await {
                result.insert(format!("connection.{}.{}", conn.id(), key), value);
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionState;
    use crate::control_messages::LinkInitMsg;
    use crate::seq_no::SeqNo;
    use bytes::Bytes;
    use rstest::rstest;
    use tokio::io::{DuplexStream, ReadHalf, WriteHalf};

    /// the relay's end of a link session
    struct FakeRelay {
        reader: LinkReader<ReadHalf<DuplexStream>>,
        writer: WriteHalf<DuplexStream>,
    }

    impl FakeRelay {
        async fn recv(&mut self) -> Packet {
            self.reader.read_packet().await.unwrap().unwrap()
        }

        async fn recv_kind(&mut self, kind: PacketKind) -> Packet {
            let packet = self.recv().await;
            assert_eq!(packet.kind, kind, "{:?}", packet);
            packet
        }

        async fn send(&mut self, packet: Packet) {
            link::write_packet(&mut self.writer, &packet).await.unwrap();
        }

        async fn handshake(&mut self, id: u32) -> Packet {
            self.send(conn_init(id)).await;
            self.recv().await
        }
    }

    fn conn_init(id: u32) -> Packet {
        let msg = ConnInitMsg {
            pull_period: Some(Duration::from_secs(5)),
            connection_timeout: Duration::from_secs(120),
            service_name: "broker".to_string(),
            remote_address: format!("10.1.1.{}", id),
        };
        Packet::new(PacketKind::ConnInit, ConnectionId::from_raw(id), msg.to_payload())
    }

    fn driver_with(modify: impl FnOnce(&mut TunnelConfig)) -> Arc<ServerDriver> {
        let mut config = TunnelConfig::default();
        modify(&mut config);
        ServerDriver::new(config, "broker").unwrap()
    }

    async fn start_session(driver: &Arc<ServerDriver>) -> FakeRelay {
        let (driver_side, relay_side) = tokio::io::duplex(64 * 1024);
        let session_driver = driver.clone();
        tokio::spawn(async move { session_driver.run_session(driver_side).await });

        let (read_half, write_half) = tokio::io::split(relay_side);
        FakeRelay {
            reader: LinkReader::new(read_half),
            writer: write_half,
        }
    }

    async fn start_with_link_init(driver: &Arc<ServerDriver>) -> (FakeRelay, LinkInitMsg) {
        let mut relay = start_session(driver).await;
        let link_init = relay.recv_kind(PacketKind::LinkInit).await;
        let listen = relay.recv_kind(PacketKind::ListenStateChange).await;
        assert_eq!(ListenStateMsg::deser(&listen.payload).unwrap(), ListenStateMsg { service_name: "broker".to_string(), listening: true });
        (relay, LinkInitMsg::deser(&link_init.payload).unwrap())
    }

    #[tokio::test]
    async fn test_session_starts_with_link_init() {
        let driver = driver_with(|_| {});
        let (_relay, link_init) = start_with_link_init(&driver).await;
        assert_eq!(link_init.service_name, "broker");
        assert!(link_init.connections.is_empty());
    }

    #[tokio::test]
    async fn test_handshake_and_data() {
        let driver = driver_with(|_| {});
        let (mut relay, _) = start_with_link_init(&driver).await;

        assert_eq!(relay.handshake(7).await.kind, PacketKind::ConnInitAck);
        let handle = driver.accept().await.unwrap();
        assert_eq!(handle.connection_id(), ConnectionId::from_raw(7));
        assert_eq!(handle.peer_address(), "10.1.1.7");
        assert_eq!(handle.pull_period().await, Some(Duration::from_secs(5)));

        relay.send(Packet::sequenced(PacketKind::Data, ConnectionId::from_raw(7), SeqNo::FIRST, Bytes::from_static(b"hello"))).await;
        let ack = relay.recv_kind(PacketKind::Ack).await;
        assert_eq!(ack.ack_sequence, Some(SeqNo::FIRST));
        assert_eq!(handle.read(100).await.unwrap().unwrap().as_ref(), b"hello");

        handle.write(b"world").await.unwrap();
        let data = relay.recv_kind(PacketKind::Data).await;
        assert_eq!(data.payload.as_ref(), b"world");
        assert_eq!(data.connection_id, ConnectionId::from_raw(7));
    }

    #[tokio::test]
    async fn test_duplicate_handshake_is_rejected() {
        let driver = driver_with(|_| {});
        let (mut relay, _) = start_with_link_init(&driver).await;

        assert_eq!(relay.handshake(7).await.kind, PacketKind::ConnInitAck);
        let handle = driver.accept().await.unwrap();

        let rejected = relay.handshake(7).await;
        assert_eq!(rejected.kind, PacketKind::ConnRejected);
        assert_eq!(ConnRejectedMsg::deser(&rejected.payload).unwrap().reason, "connection id already in use");

        assert_eq!(handle.state().await, ConnectionState::Connected);
        handle.write(b"still alive").await.unwrap();
        assert_eq!(relay.recv_kind(PacketKind::Data).await.payload.as_ref(), b"still alive");
    }

    #[rstest]
    #[case::accepted(true, PacketKind::ConnInitAck)]
    #[case::rejected(false, PacketKind::ConnRejected)]
    #[tokio::test(start_paused = true)]
    async fn test_handshake_reply_waits_for_full_send_queue(#[case] listening: bool, #[case] expected: PacketKind) {
        let driver = driver_with(|_| {});
        driver.set_listening(listening);
        let (tx, mut rx) = mpsc::channel(1);
        driver.sink.attach(tx);
        driver.sink.send_packet(Packet::no_op());

        let handshake = {
            let driver = driver.clone();
            tokio::spawn(async move { driver.on_link_packet(conn_init(7)).await })
        };
        time::sleep(Duration::from_millis(10)).await;
        assert!(!handshake.is_finished());

        assert_eq!(rx.recv().await, Some(Packet::no_op()));
        handshake.await.unwrap();
        let reply = rx.recv().await.unwrap();
        assert_eq!(reply.kind, expected);
        assert_eq!(reply.connection_id, ConnectionId::from_raw(7));
        assert_eq!(driver.num_connections().await, usize::from(listening));
    }

    #[tokio::test]
    async fn test_full_backlog_is_rejected() {
        let driver = driver_with(|c| c.accept_backlog = 1);
        let (mut relay, _) = start_with_link_init(&driver).await;

        assert_eq!(relay.handshake(1).await.kind, PacketKind::ConnInitAck);
        let rejected = relay.handshake(2).await;
        assert_eq!(rejected.kind, PacketKind::ConnRejected);
        assert_eq!(ConnRejectedMsg::deser(&rejected.payload).unwrap().reason, "accept backlog full");

        driver.accept().await.unwrap();
        assert_eq!(relay.handshake(3).await.kind, PacketKind::ConnInitAck);
        assert_eq!(driver.num_connections().await, 2);
    }

    #[tokio::test]
    async fn test_not_listening_is_rejected() {
        let driver = driver_with(|_| {});
        let (mut relay, _) = start_with_link_init(&driver).await;

        driver.set_listening(false);
        let listen = relay.recv_kind(PacketKind::ListenStateChange).await;
        assert!(!ListenStateMsg::deser(&listen.payload).unwrap().listening);

        let rejected = relay.handshake(4).await;
        assert_eq!(ConnRejectedMsg::deser(&rejected.payload).unwrap().reason, "service is not listening");
    }

    #[tokio::test]
    async fn test_unknown_connection_is_aborted() {
        let driver = driver_with(|_| {});
        let (mut relay, _) = start_with_link_init(&driver).await;

        relay.send(Packet::ack(ConnectionId::from_raw(99), SeqNo::FIRST, 64)).await;
        relay.send(Packet::sequenced(PacketKind::Data, ConnectionId::from_raw(99), SeqNo::FIRST, Bytes::from_static(b"x"))).await;
        let abort = relay.recv_kind(PacketKind::ConnAbort).await;
        assert_eq!(abort.connection_id, ConnectionId::from_raw(99));
    }

    #[tokio::test]
    async fn test_new_session_replays_connections() {
        let driver = driver_with(|_| {});
        let (mut relay, _) = start_with_link_init(&driver).await;
        relay.handshake(7).await;
        let handle = driver.accept().await.unwrap();
        handle.write(b"unacked").await.unwrap();
        relay.recv_kind(PacketKind::Data).await;
        drop(relay);

        while driver.sink.is_attached() {
            tokio::task::yield_now().await;
        }

        let (_relay, link_init) = start_with_link_init(&driver).await;
        assert_eq!(link_init.connections.len(), 1);
        let snapshot = &link_init.connections[0];
        assert_eq!(snapshot.id, ConnectionId::from_raw(7));
        assert_eq!(snapshot.state, ConnectionState::Connected);
        assert_eq!(snapshot.peer_address, "10.1.1.7");
        assert_eq!(snapshot.unacked.len(), 1);
        assert_eq!(snapshot.unacked[0].payload.as_ref(), b"unacked");
    }

    #[tokio::test]
    async fn test_sweep_removes_terminated_connections() {
        let driver = driver_with(|_| {});
        let (mut relay, _) = start_with_link_init(&driver).await;
        relay.handshake(7).await;
        let _handle = driver.accept().await.unwrap();

        relay.send(Packet::control(PacketKind::ConnAbort, ConnectionId::from_raw(7))).await;
        while !driver.table.read().await.get(ConnectionId::from_raw(7)).unwrap().is_terminal().await {
            tokio::task::yield_now().await;
        }

        driver.sweep(Instant::now()).await;
        assert_eq!(driver.num_connections().await, 0);
        assert_eq!(relay.recv_kind(PacketKind::ConnShutdown).await.connection_id, ConnectionId::from_raw(7));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_times_out_with_stuck_dispatch() {
        let driver = driver_with(|c| c.shutdown_progress_interval = Duration::from_secs(1));
        let _stuck = driver.barrier.try_enter().unwrap();

        let start = Instant::now();
        assert!(driver.shutdown(Duration::from_secs(3)).await.is_err());
        assert_eq!(Instant::now() - start, Duration::from_secs(3));
        assert_eq!(driver.accept().await.unwrap_err(), TunnelError::ShuttingDown);
    }

    #[tokio::test]
    async fn test_shutdown_aborts_connections() {
        let driver = driver_with(|_| {});
        let (mut relay, _) = start_with_link_init(&driver).await;
        relay.handshake(7).await;
        let handle = driver.accept().await.unwrap();

        driver.shutdown(Duration::from_secs(1)).await.unwrap();
        assert_eq!(handle.read(10).await, Err(TunnelError::ShuttingDown));
        assert_eq!(driver.num_connections().await, 0);
        assert!(!driver.is_listening());
    }

    #[tokio::test]
    async fn test_debug_state() {
        let driver = driver_with(|_| {});
        let (mut relay, _) = start_with_link_init(&driver).await;
        relay.handshake(7).await;

        let state = driver.debug_state().await;
        assert_eq!(state.get("link_up").map(String::as_str), Some("true"));
        assert_eq!(state.get("connections").map(String::as_str), Some("1"));
        assert_eq!(state.get("connection.7.state").map(String::as_str), Some("Connected"));
    }
}

//! The client end of the tunnel. Clients can not accept inbound connections, so everything the
//!  relay has for a connection is fetched by polling: each connection runs a pull task that keeps
//!  a pull request outstanding (continuous mode) or polls once per pull period (periodic mode), and
//!  a push task that posts outgoing packets.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rustc_hash::FxHashMap;
use tokio::select;
use tokio::sync::{mpsc, watch, RwLock};
use tokio::time::{self, Instant};
use tracing::{debug, info, instrument, trace, warn};

use crate::config::TunnelConfig;
use crate::connection::Connection;
use crate::control_messages::{ConnInitMsg, ConnRejectedMsg};
use crate::error::TunnelError;
use crate::http_transport::TunnelTransport;
use crate::link::LinkSink;
use crate::packet::{ConnectionId, Packet, PacketKind};
use crate::tunnel_handle::TunnelHandle;

/// upper bound for the number of queued packets combined into a single push request
const MAX_PUSH_BATCH: usize = 32;

/// A connection together with the state of its polling tasks
struct ClientTunnel {
    service_name: String,
    conn: Arc<Connection>,
    sink: Arc<LinkSink>,
    /// time of the last successful exchange with the relay for this connection
    last_success: Mutex<Instant>,
}

impl ClientTunnel {
    fn mark_success(&self) {
        *self.last_success.lock().unwrap() = Instant::now();
    }

    fn since_success(&self) -> Duration {
        self.last_success.lock().unwrap().elapsed()
    }
}

pub struct ClientDriver {
    config: Arc<TunnelConfig>,
    transport: Arc<dyn TunnelTransport>,
    /// Keyed by service and connection id: ids are only unique per service
    connections: RwLock<FxHashMap<(String, ConnectionId), Arc<ClientTunnel>>>,
    shutdown: watch::Sender<bool>,
}

impl ClientDriver {
    pub fn new(config: TunnelConfig, transport: Arc<dyn TunnelTransport>) -> anyhow::Result<Arc<ClientDriver>> {
        config.validate()?;
        let (shutdown, _) = watch::channel(false);
        Ok(Arc::new(ClientDriver {
            config: Arc::new(config),
            transport,
            connections: Default::default(),
            shutdown,
        }))
    }

    pub async fn num_connections(&self) -> usize {
        self.connections.read().await.len()
    }

    /// Opens a connection to `service_name` (empty for the relay's default service) with the
    ///  configured default pull period and connection timeout
    pub async fn open(self: &Arc<Self>, service_name: &str) -> Result<TunnelHandle, TunnelError> {
        let poll = &self.config.poll;
        self.open_with(service_name, poll.default_pull_period, poll.default_connection_timeout).await
    }

    /// Opens a connection, returning once the server accepted it. Fails with
    ///  [TunnelError::ConnectRejected] if the relay or the server refused it, and with
    ///  [TunnelError::ConnectTimeout] if the handshake did not complete within the configured
    ///  connect timeout.
    #[instrument(skip(self))]
    pub async fn open_with(self: &Arc<Self>, service_name: &str, pull_period: Option<Duration>, connection_timeout: Duration) -> Result<TunnelHandle, TunnelError> {
        if *self.shutdown.borrow() {
            return Err(TunnelError::ShuttingDown);
        }
        let deadline = Instant::now() + self.config.poll.connect_timeout;

        let init = ConnInitMsg {
            pull_period,
            connection_timeout,
            service_name: service_name.to_string(),
            remote_address: String::new(),
        };
        let request = Packet::new(PacketKind::ConnInit, ConnectionId::LINK, init.to_payload());
        let response = match time::timeout_at(deadline, self.transport.connect(service_name, request)).await {
            Err(_) => return Err(TunnelError::ConnectTimeout),
            Ok(Err(e)) => return Err(TunnelError::ConnectFailed(e.to_string())),
            Ok(Ok(response)) => response,
        };
        let (id, peer_address) = Self::parse_handshake_response(response)?;
        debug!("relay allocated connection id {} at service {}", id, peer_address);

        let (push_send, push_recv) = mpsc::channel(self.config.window_size as usize * 2);
        let sink = Arc::new(LinkSink::new());
        sink.attach(push_send);
        let conn = Arc::new(Connection::new(id, peer_address, self.config.clone(), sink.clone(), pull_period, connection_timeout));
        let tunnel = Arc::new(ClientTunnel {
            service_name: service_name.to_string(),
            conn: conn.clone(),
            sink,
            last_success: Mutex::new(Instant::now()),
        });
        self.connections.write().await
            .insert((service_name.to_string(), id), tunnel.clone());

        tokio::spawn(self.clone().push_loop(tunnel.clone(), push_recv));
        tokio::spawn(self.clone().pull_loop(tunnel));

        match time::timeout_at(deadline, conn.wait_connected()).await {
            Err(_) => {
                debug!("handshake for connection {} timed out", id);
                conn.abort(TunnelError::ConnectTimeout, true).await;
                Err(TunnelError::ConnectTimeout)
            }
            Ok(Err(e)) => Err(e),
            Ok(Ok(())) => {
                info!("connection {} to service {:?} established", id, service_name);
                Ok(TunnelHandle::new(conn))
            }
        }
    }

    /// Extracts connection id and service name from the relay's answer to a handshake
    fn parse_handshake_response(response: Vec<Packet>) -> Result<(ConnectionId, String), TunnelError> {
        for packet in response {
            match packet.kind {
                PacketKind::ConnRejected => {
                    let reason = ConnRejectedMsg::deser(&packet.payload)
                        .map(|msg| msg.reason)
                        .unwrap_or_else(|e| format!("unparsable rejection: {}", e));
                    return Err(TunnelError::ConnectRejected(reason));
                }
                PacketKind::ConnInit if !packet.connection_id.is_link() => {
                    let msg = ConnInitMsg::deser(&packet.payload)
                        .map_err(|e| TunnelError::ConnectFailed(format!("malformed handshake response: {}", e)))?;
                    return Ok((packet.connection_id, msg.service_name));
                }
                _ => trace!("ignoring {:?} in handshake response", packet),
            }
        }
        Err(TunnelError::ConnectFailed("handshake response without connection id".to_string()))
    }

    #[instrument(name = "pull", skip_all, fields(id = %tunnel.conn.id()))]
    async fn pull_loop(self: Arc<Self>, tunnel: Arc<ClientTunnel>) {
        let id = tunnel.conn.id();
        let mut shutdown = self.shutdown.subscribe();

        while !tunnel.conn.is_removable(Instant::now(), self.config.close_linger).await {
            let result = select! {
                result = self.transport.pull(&tunnel.service_name, id) => result,
                _ = async { shutdown.wait_for(|s| *s).await.map(|_| ()) } => break,
            };

            let pause = match result {
                Ok(packets) => {
                    tunnel.mark_success();
                    let packets = packets.into_iter()
                        .filter(|p| p.kind != PacketKind::NoOp)
                        .collect::<Vec<_>>();
                    if packets.is_empty() {
                        tunnel.conn.pull_period().await
                    }
                    else {
                        // the relay forgot the connection, there is nothing left to pull
                        let relay_done = packets.iter().any(|p| matches!(p.kind, PacketKind::ConnShutdown | PacketKind::ConnAbort | PacketKind::ConnRejected));
                        let num_packets = packets.len();
                        for (i, packet) in packets.into_iter().enumerate() {
                            if packet.connection_id != id {
                                warn!("pull response contains packet for a different connection - ignoring {:?}", packet);
                                continue;
                            }
                            tunnel.conn.on_packet(packet, i + 1 < num_packets).await;
                        }
                        if relay_done {
                            break;
                        }
                        None
                    }
                }
                Err(e) => {
                    debug!("pull failed: {}", e);
                    if tunnel.since_success() >= tunnel.conn.connection_timeout().await {
                        warn!("no successful exchange with the relay for {:?} - aborting", tunnel.since_success());
                        tunnel.conn.abort(TunnelError::Timeout, true).await;
                        break;
                    }
                    Some(self.config.poll.poll_error_backoff)
                }
            };

            if let Some(pause) = pause {
                select! {
                    _ = time::sleep(pause) => {}
                    _ = async { shutdown.wait_for(|s| *s).await.map(|_| ()) } => break,
                }
            }
        }

        // packets queued so far are still pushed, e.g. a final abort
        tunnel.sink.detach();
        debug!("pull task terminated");
    }

    #[instrument(name = "push", skip_all, fields(id = %tunnel.conn.id()))]
    async fn push_loop(self: Arc<Self>, tunnel: Arc<ClientTunnel>, mut queue: mpsc::Receiver<Packet>) {
        while let Some(first) = queue.recv().await {
            let mut batch = vec![first];
            while batch.len() < MAX_PUSH_BATCH {
                match queue.try_recv() {
                    Ok(packet) => batch.push(packet),
                    Err(_) => break,
                }
            }

            trace!("pushing {} packets", batch.len());
            match self.transport.push(&tunnel.service_name, batch).await {
                Ok(()) => tunnel.mark_success(),
                // lost data is retransmitted, lost acks are superseded by later ones
                Err(e) => debug!("push failed: {}", e),
            }
        }
        debug!("push task terminated");
    }

    /// The shared ticker driving retransmission and close timeouts of all connections, and
    ///  forgetting terminated ones. Runs until the driver is shut down.
    #[instrument(name = "sweep", skip_all)]
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
        let tunnels = self.connections.read().await
            .iter()
            .map(|(key, tunnel)| (key.clone(), tunnel.clone()))
            .collect::<Vec<_>>();

        let mut terminated = Vec::new();
        for (key, tunnel) in tunnels {
            tunnel.conn.on_tick(now).await;
            if tunnel.conn.is_removable(now, self.config.close_linger).await {
                terminated.push(key);
            }
        }

        if !terminated.is_empty() {
            let mut connections = self.connections.write().await;
            for key in terminated {
                debug!("forgetting terminated connection {} at service {:?}", key.1, key.0);
                connections.remove(&key);
            }
        }
    }

    /// Aborts all connections and stops their polling tasks. Opening connections fails afterwards.
    pub async fn shutdown(&self) {
        info!("shutting down client driver");
        let tunnels = self.connections.write().await
            .drain()
            .map(|(_, tunnel)| tunnel)
            .collect::<Vec<_>>();
        for tunnel in tunnels {
            tunnel.conn.abort(TunnelError::ShuttingDown, true).await;
        }
        self.shutdown.send_replace(true);
    }

    pub async fn debug_state(&self) -> BTreeMap<String, String> {
        let mut result = BTreeMap::new();
        result.insert("shutting_down".to_string(), self.shutdown.borrow().to_string());

        let tunnels = self.connections.read().await.values().cloned().collect::<Vec<_>>();
        result.insert("connections".to_string(), tunnels.len().to_string());
        for tunnel in tunnels {
            let prefix = format!("connection.{}.{}", tunnel.service_name, tunnel.conn.id());
            result.insert(format!("{}.last_success_ms_ago", prefix), tunnel.since_success().as_millis().to_string());
            for (key, value) in tunnel.conn.debug_state().await {
                result.insert(format!("{}.{}", prefix, key), value);
            }
        }
        result
    }
}

//! The HTTP-facing side of the tunnel. Drivers link to the relay over TCP, one link per service
//!  (broker); clients reach the relay with HTTP exchanges (see [http_service]).
//!
//! The relay holds routing state only: per connection, a queue of packets waiting for the
//!  client's next pull. Everything it knows about live connections can be rebuilt from the link
//!  init snapshot a driver sends when it links, so a restarted relay picks up where the previous
//!  one left off.

pub mod http_service;
pub mod relay_entry;

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, bail};
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::mpsc::error::TrySendError;
use tokio::select;
use tokio::sync::{mpsc, watch, RwLock};
use tokio::time::{self, Instant};
use tracing::{debug, info, instrument, trace, warn};

use crate::config::TunnelConfig;
use crate::connection_table::ConnectionTable;
use crate::control_messages::{ConnInitMsg, ConnRejectedMsg, LinkInitMsg, ListenStateMsg};
use crate::link::{self, LinkReader};
use crate::packet::{ConnectionId, Packet, PacketKind};
use relay_entry::{InUseGuard, RelayEntry};

struct LinkStatus {
    /// the current link session's send queue, `None` while the driver is not linked
    sender: Option<mpsc::Sender<Packet>>,
    session: u64,
    listening: bool,
    down_since: Option<Instant>,
}

/// A service as seen by the relay: the link to its driver and the routing entries of its
///  connections
pub struct ServiceLink {
    name: String,
    table: RwLock<ConnectionTable<RelayEntry>>,
    status: Mutex<LinkStatus>,
}

impl ServiceLink {
    fn new(name: String) -> ServiceLink {
        ServiceLink {
            name,
            table: Default::default(),
            status: Mutex::new(LinkStatus {
                sender: None,
                session: 0,
                listening: false,
                down_since: None,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_up(&self) -> bool {
        self.status.lock().unwrap().sender.is_some()
    }

    pub fn is_listening(&self) -> bool {
        self.status.lock().unwrap().listening
    }

    pub async fn entry(&self, id: ConnectionId) -> Option<Arc<RelayEntry>> {
        self.table.read().await.get(id)
    }

    pub async fn num_connections(&self) -> usize {
        self.table.read().await.len()
    }

    /// Forwards a packet to the driver. Packets are dropped while the link is down or its send
    ///  queue is full; recovery is left to the end points' retransmission.
    fn send_to_driver(&self, packet: Packet) -> bool {
        let status = self.status.lock().unwrap();
        let Some(sender) = &status.sender else {
            trace!("service {} is not linked - dropping {:?}", self.name, packet);
            return false;
        };
        match sender.try_send(packet) {
            Ok(()) => true,
            Err(TrySendError::Full(packet)) => {
                debug!("link send queue of service {} is full - dropping {:?}", self.name, packet);
                false
            }
            Err(TrySendError::Closed(packet)) => {
                trace!("link of service {} is closing - dropping {:?}", self.name, packet);
                false
            }
        }
    }

    /// Removes an entry, provided it was not replaced in the meantime
    async fn remove_entry(&self, entry: &Arc<RelayEntry>) {
        let mut table = self.table.write().await;
        if table.get(entry.id()).map_or(false, |e| Arc::ptr_eq(&e, entry)) {
            debug!("removing connection {} of service {}", entry.id(), self.name);
            table.remove(entry.id());
        }
    }

    /// Reconciles the routing table with a driver's snapshot: entries in the snapshot are created
    ///  or updated, all others are aborted toward their clients
    async fn rebuild(&self, msg: &LinkInitMsg, queue_capacity: usize) -> anyhow::Result<()> {
        let now = Instant::now();
        let mut table = self.table.write().await;

        let mut in_snapshot = FxHashSet::default();
        for snapshot in &msg.connections {
            in_snapshot.insert(snapshot.id);
            match table.get(snapshot.id) {
                Some(entry) => entry.update_from_snapshot(snapshot),
                None => table.insert(snapshot.id, Arc::new(RelayEntry::from_snapshot(snapshot, queue_capacity)))?,
            }
        }

        for entry in table.entries() {
            if !in_snapshot.contains(&entry.id()) && entry.abort(now) {
                debug!("connection {} is unknown to the driver of {} - aborting it", entry.id(), self.name);
            }
        }
        info!("rebuilt routing table of service {} with {} connections", self.name, msg.connections.len());
        Ok(())
    }
}

/// Packets taken from a pull queue for one pull response. If the response can not be delivered,
///  [PulledPackets::requeue] puts them back.
pub struct PulledPackets {
    pub packets: Vec<Packet>,
    entry: Option<Arc<RelayEntry>>,
    /// the pull counts as in progress until its response is delivered
    _in_use: Option<InUseGuard>,
}

impl PulledPackets {
    fn unrouted(packets: Vec<Packet>) -> PulledPackets {
        PulledPackets { packets, entry: None, _in_use: None }
    }

    pub fn requeue(self) {
        if let Some(entry) = self.entry {
            debug!("requeueing {} undelivered packets for connection {}", self.packets.len(), entry.id());
            entry.requeue(self.packets);
        }
    }
}

pub struct Relay {
    config: Arc<TunnelConfig>,
    services: RwLock<FxHashMap<String, Arc<ServiceLink>>>,
    last_timeout_check: Mutex<Option<Instant>>,
    shutdown: watch::Sender<bool>,
}

impl Relay {
    pub fn new(config: TunnelConfig) -> anyhow::Result<Arc<Relay>> {
        config.validate()?;
        let (shutdown, _) = watch::channel(false);
        Ok(Arc::new(Relay {
            config: Arc::new(config),
            services: Default::default(),
            last_timeout_check: Mutex::new(None),
            shutdown,
        }))
    }

    /// Stops accepting links and HTTP connections, and ends all link sessions. Pulls in progress
    ///  finish normally.
    pub fn shutdown(&self) {
        info!("shutting down relay");
        self.shutdown.send_replace(true);
    }

    pub fn is_shut_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    pub(crate) fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    pub fn config(&self) -> &TunnelConfig {
        &self.config
    }

    pub async fn service(&self, name: &str) -> Option<Arc<ServiceLink>> {
        self.services.read().await.get(name).cloned()
    }

    /// Resolves the service a request is addressed to. Without a name, the only linked service
    ///  is the default.
    async fn resolve_service(&self, name: Option<&str>) -> anyhow::Result<Arc<ServiceLink>> {
        let services = self.services.read().await;
        match name.filter(|n| !n.is_empty()) {
            Some(name) => services.get(name).cloned().ok_or_else(|| anyhow!("unknown service {}", name)),
            None => {
                let mut linked = services.values().filter(|s| s.is_up());
                match (linked.next(), linked.next()) {
                    (Some(service), None) => Ok(service.clone()),
                    (None, _) => bail!("no service is linked"),
                    (Some(_), Some(_)) => bail!("several services are linked - a service name is required"),
                }
            }
        }
    }

    /// Accepts driver links until the listener fails or the relay is shut down
    pub async fn accept_links(self: Arc<Self>, listener: TcpListener) -> anyhow::Result<()> {
        info!("accepting driver links on {:?}", listener.local_addr()?);
        let mut shutdown = self.shutdown.subscribe();
        loop {
            let (stream, addr) = select! {
                accepted = listener.accept() => accepted?,
                _ = async { shutdown.wait_for(|s| *s).await.map(|_| ()) } => return Ok(()),
            };
            if let Err(e) = stream.set_nodelay(true) {
                debug!("could not set TCP_NODELAY: {}", e);
            }
            let relay = self.clone();
            tokio::spawn(async move {
                match relay.serve_link(stream, addr.to_string()).await {
                    Ok(()) => info!("driver link from {} closed", addr),
                    Err(e) => warn!("driver link from {} failed: {}", addr, e),
                }
            });
        }
    }

    /// Runs one link session with a driver. The first packet must be the driver's link init.
    #[instrument(name = "relay_link", skip_all, fields(peer = %peer))]
    pub async fn serve_link<S>(&self, stream: S, peer: String) -> anyhow::Result<()>
    where S: AsyncRead + AsyncWrite + Send + 'static
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let mut reader = LinkReader::new(read_half);

        let first = match reader.read_packet().await? {
            Some(p) if p.kind == PacketKind::LinkInit => p,
            Some(p) => bail!("expected link init, got {:?}", p),
            None => return Ok(()),
        };
        let link_init = LinkInitMsg::deser(&first.payload)?;
        let mut shutdown = self.shutdown.subscribe();
        let service = self.services.write().await
            .entry(link_init.service_name.clone())
            .or_insert_with(|| Arc::new(ServiceLink::new(link_init.service_name.clone())))
            .clone();
        service.rebuild(&link_init, self.config.relay.pull_queue_capacity).await?;

        let (sender, receiver) = mpsc::channel(self.config.link.send_queue_len);
        let session = {
            let mut status = service.status.lock().unwrap();
            status.session += 1;
            status.sender = Some(sender);
            status.down_since = None;
            status.session
        };
        info!("service {} linked", service.name);

        let mut writer = tokio::spawn(link::write_loop(write_half, receiver));
        let result = loop {
            select! {
                packet = reader.read_packet() => match packet {
                    Ok(Some(packet)) => self.on_driver_packet(&service, packet).await,
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
        writer.abort();

        let mut status = service.status.lock().unwrap();
        if status.session == session {
            info!("service {} unlinked", service.name);
            status.sender = None;
            status.down_since = Some(Instant::now());
        }
        result
    }

    async fn on_driver_packet(&self, service: &ServiceLink, packet: Packet) {
        trace!("from driver of {}: {:?}", service.name, packet);
        if packet.connection_id.is_link() {
            match packet.kind {
                PacketKind::ListenStateChange => match ListenStateMsg::deser(&packet.payload) {
                    Ok(msg) => {
                        debug!("service {}: listening = {}", service.name, msg.listening);
                        service.status.lock().unwrap().listening = msg.listening;
                    }
                    Err(e) => warn!("malformed listen state from {}: {}", service.name, e),
                },
                PacketKind::LinkInit => match LinkInitMsg::deser(&packet.payload) {
                    Ok(msg) => {
                        if let Err(e) = service.rebuild(&msg, self.config.relay.pull_queue_capacity).await {
                            warn!("rebuilding routing table of {} failed: {}", service.name, e);
                        }
                    }
                    Err(e) => warn!("malformed link init from {}: {}", service.name, e),
                },
                _ => {}
            }
            return;
        }

        let Some(entry) = service.entry(packet.connection_id).await else {
            if packet.kind.is_sequenced() {
                debug!("{:?} for unknown connection - aborting it", packet);
                service.send_to_driver(Packet::control(PacketKind::ConnAbort, packet.connection_id));
            }
            return;
        };

        entry.enqueue(packet, Instant::now());
    }

    /// Handles a client's handshake request, answering with the echoed `ConnInit` carrying the
    ///  allocated connection id, or with `ConnRejected`
    pub async fn connect(&self, service_name: Option<&str>, packets: Vec<Packet>, remote_address: &str) -> Vec<Packet> {
        match self.try_connect(service_name, packets, remote_address).await {
            Ok(response) => vec![response],
            Err(e) => {
                debug!("rejecting handshake from {}: {}", remote_address, e);
                let payload = ConnRejectedMsg { reason: e.to_string() }.to_payload();
                vec![Packet::new(PacketKind::ConnRejected, ConnectionId::LINK, payload)]
            }
        }
    }

    async fn try_connect(&self, service_name: Option<&str>, packets: Vec<Packet>, remote_address: &str) -> anyhow::Result<Packet> {
        let init = packets.into_iter()
            .find(|p| p.kind == PacketKind::ConnInit)
            .ok_or_else(|| anyhow!("handshake request without ConnInit"))?;
        let mut msg = ConnInitMsg::deser(&init.payload)?;

        let service = self.resolve_service(service_name).await?;
        if !service.is_up() {
            bail!("service {} is not available", service.name);
        }
        if !service.is_listening() {
            bail!("service {} is not listening", service.name);
        }

        let entry = {
            let mut table = service.table.write().await;
            let id = table.allocate_id()?;
            let entry = Arc::new(RelayEntry::new(id, remote_address.to_string(), msg.pull_period, msg.connection_timeout, self.config.relay.pull_queue_capacity));
            table.insert(id, entry.clone())?;
            entry
        };

        msg.service_name = service.name.clone();
        msg.remote_address = remote_address.to_string();
        if !service.send_to_driver(Packet::new(PacketKind::ConnInit, entry.id(), msg.to_payload())) {
            service.remove_entry(&entry).await;
            bail!("service {} is not available", service.name);
        }

        debug!("connection {} from {} forwarded to service {}", entry.id(), remote_address, service.name);
        msg.remote_address = String::new();
        Ok(Packet::new(PacketKind::ConnInit, entry.id(), msg.to_payload()))
    }

    /// Forwards packets a client pushed to the driver
    pub async fn push(&self, service_name: Option<&str>, packets: Vec<Packet>) -> anyhow::Result<()> {
        let service = self.resolve_service(service_name).await?;
        for packet in packets {
            let Some(entry) = service.entry(packet.connection_id).await else {
                trace!("push for unknown connection - dropping {:?}", packet);
                continue;
            };
            let _guard = entry.enter();

            match packet.kind {
                PacketKind::ConnOption => entry.peek_option(&packet.payload),
                PacketKind::ConnAbort => {
                    entry.terminate(Instant::now());
                    service.remove_entry(&entry).await;
                }
                _ => {}
            }
            service.send_to_driver(packet);
        }
        Ok(())
    }

    /// Takes the packets for a client's pull. In continuous mode this waits up to the maximum
    ///  pull block period for packets, answering with a no-op packet if none arrived.
    pub async fn pull(&self, service_name: Option<&str>, id: ConnectionId) -> anyhow::Result<PulledPackets> {
        let service = self.resolve_service(service_name).await?;
        let Some(entry) = service.entry(id).await else {
            return Ok(PulledPackets::unrouted(vec![Packet::control(PacketKind::ConnAbort, id)]));
        };
        let guard = entry.enter();
        let deadline = Instant::now() + self.config.relay.max_pull_block;

        loop {
            let (packets, terminal) = entry.take_for_pull(self.config.relay.one_packet_per_request);
            if terminal {
                service.remove_entry(&entry).await;
            }
            if !packets.is_empty() {
                return Ok(self.pulled(packets, entry.clone(), guard));
            }

            if entry.pull_period().is_some() || !entry.wait_for_packets(deadline).await {
                return Ok(self.pulled(vec![Packet::no_op()], entry.clone(), guard));
            }
        }
    }

    fn pulled(&self, packets: Vec<Packet>, entry: Arc<RelayEntry>, guard: InUseGuard) -> PulledPackets {
        PulledPackets {
            packets,
            entry: Some(entry),
            _in_use: Some(guard),
        }
    }

    /// Aborts connections whose clients went away, and those of services whose drivers did not
    ///  re-link in time. Checks run at most once per `timeout_check_interval`.
    pub async fn check_timeouts(&self, now: Instant) {
        {
            let mut last = self.last_timeout_check.lock().unwrap();
            if let Some(last) = *last {
                if now.saturating_duration_since(last) < self.config.relay.timeout_check_interval {
                    return;
                }
            }
            *last = Some(now);
        }

        let relay_config = &self.config.relay;
        let services = self.services.read().await.values().cloned().collect::<Vec<_>>();
        for service in services {
            let grace_expired = {
                let mut status = service.status.lock().unwrap();
                match status.down_since {
                    Some(since) if now.saturating_duration_since(since) >= relay_config.link_down_grace => {
                        status.down_since = None;
                        true
                    }
                    _ => false,
                }
            };
            if grace_expired {
                info!("service {} did not re-link in time - aborting its connections", service.name);
            }

            let mut stale = Vec::new();
            for entry in service.table.read().await.entries() {
                if grace_expired {
                    entry.abort(now);
                }
                else if entry.is_idle_expired(now, relay_config.default_idle_timeout) {
                    debug!("connection {} of service {} timed out", entry.id(), service.name);
                    entry.abort(now);
                    service.send_to_driver(Packet::control(PacketKind::ConnAbort, entry.id()));
                }
                else if entry.is_stale(now, relay_config.default_idle_timeout) {
                    stale.push(entry);
                }
            }
            for entry in stale {
                service.remove_entry(&entry).await;
            }
        }
    }

    /// Runs the idle timeout checks until the relay is shut down
    pub async fn timeout_loop(self: Arc<Self>) {
        let mut shutdown = self.shutdown.subscribe();
        let mut ticks = time::interval(self.config.relay.timeout_check_interval);
        loop {
            select! {
                _ = ticks.tick() => self.check_timeouts(Instant::now()).await,
                _ = async { shutdown.wait_for(|s| *s).await.map(|_| ()) } => break,
            }
        }
    }

    pub async fn debug_state(&self) -> BTreeMap<String, String> {
        let mut result = BTreeMap::new();
        if self.is_shut_down() {
            result.insert("shutting_down".to_string(), "true".to_string());
        }
        let services = self.services.read().await.values().cloned().collect::<Vec<_>>();
        for service in services {
            result.insert(format!("service.{}.linked", service.name), service.is_up().to_string());
            result.insert(format!("service.{}.listening", service.name), service.is_listening().to_string());
            for entry in service.table.read().await.entries() {
                result.insert(format!("service.{}.connection.{}", service.name, entry.id()), entry.debug_state());
            }
        }
        result
    }
}

use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use tracing::trace;

use crate::http_transport::TunnelTransport;
use crate::packet::{ConnectionId, Packet, PacketKind};
use crate::relay::Relay;

fn service(name: &str) -> Option<&str> {
    if name.is_empty() {
        None
    }
    else {
        Some(name)
    }
}

/// A [TunnelTransport] calling a [Relay] directly instead of going through HTTP. The relay can be
///  replaced at runtime to simulate a relay restart.
pub struct InProcessTransport {
    relay: RwLock<Arc<Relay>>,
    remote_address: String,
}

impl InProcessTransport {
    pub fn new(relay: Arc<Relay>) -> InProcessTransport {
        InProcessTransport {
            relay: RwLock::new(relay),
            remote_address: "in-process".to_string(),
        }
    }

    pub fn replace_relay(&self, relay: Arc<Relay>) {
        *self.relay.write().unwrap() = relay;
    }

    fn relay(&self) -> Arc<Relay> {
        self.relay.read().unwrap().clone()
    }
}

#[async_trait]
impl TunnelTransport for InProcessTransport {
    async fn connect(&self, service_name: &str, init: Packet) -> anyhow::Result<Vec<Packet>> {
        Ok(self.relay().connect(service(service_name), vec![init], &self.remote_address).await)
    }

    async fn push(&self, service_name: &str, packets: Vec<Packet>) -> anyhow::Result<()> {
        self.relay().push(service(service_name), packets).await
    }

    async fn pull(&self, service_name: &str, connection_id: ConnectionId) -> anyhow::Result<Vec<Packet>> {
        let pulled = self.relay().pull(service(service_name), connection_id).await?;
        Ok(pulled.packets)
    }
}

/// Wraps a [TunnelTransport], randomly dropping and duplicating data and ack packets in both
///  directions and holding back pushed packets so that they arrive after later ones. Handshake
///  and termination packets are passed through unchanged since nothing retransmits them.
pub struct LossyTransport<T> {
    inner: T,
    loss_rate: f64,
    reorder_rate: f64,
    duplicate_rate: f64,
    held_back: Mutex<Vec<Packet>>,
}

impl<T: TunnelTransport> LossyTransport<T> {
    pub fn new(inner: T, loss_rate: f64, reorder_rate: f64, duplicate_rate: f64) -> LossyTransport<T> {
        LossyTransport {
            inner,
            loss_rate,
            reorder_rate,
            duplicate_rate,
            held_back: Default::default(),
        }
    }

    pub fn inner(&self) -> &T {
        &self.inner
    }

    fn is_droppable(packet: &Packet) -> bool {
        packet.kind.is_sequenced() || packet.kind == PacketKind::Ack
    }

    fn should_drop(&self, packet: &Packet) -> bool {
        let drop = Self::is_droppable(packet) && rand::random::<f64>() < self.loss_rate;
        if drop {
            trace!("losing {:?}", packet);
        }
        drop
    }

    fn should_duplicate(&self, packet: &Packet) -> bool {
        let duplicate = Self::is_droppable(packet) && rand::random::<f64>() < self.duplicate_rate;
        if duplicate {
            trace!("duplicating {:?}", packet);
        }
        duplicate
    }
}

#[async_trait]
impl<T: TunnelTransport> TunnelTransport for LossyTransport<T> {
    async fn connect(&self, service_name: &str, init: Packet) -> anyhow::Result<Vec<Packet>> {
        self.inner.connect(service_name, init).await
    }

    async fn push(&self, service_name: &str, packets: Vec<Packet>) -> anyhow::Result<()> {
        let mut to_send = Vec::new();
        {
            let mut held_back = self.held_back.lock().unwrap();
            // packets held back by the previous push go out after this push's packets
            let released = std::mem::take(&mut *held_back);
            for packet in packets {
                if self.should_drop(&packet) {
                    continue;
                }
                // the copy arrives with the next push, after the original
                if self.should_duplicate(&packet) {
                    held_back.push(packet.clone());
                }
                if Self::is_droppable(&packet) && rand::random::<f64>() < self.reorder_rate {
                    trace!("holding back {:?}", packet);
                    held_back.push(packet);
                    continue;
                }
                to_send.push(packet);
            }
            to_send.extend(released);
        }

        if to_send.is_empty() {
            return Ok(());
        }
        self.inner.push(service_name, to_send).await
    }

    async fn pull(&self, service_name: &str, connection_id: ConnectionId) -> anyhow::Result<Vec<Packet>> {
        let packets = self.inner.pull(service_name, connection_id).await?;

        let mut result = Vec::with_capacity(packets.len());
        for packet in packets {
            if self.should_drop(&packet) {
                continue;
            }
            if self.should_duplicate(&packet) {
                result.push(packet.clone());
            }
            result.push(packet);
        }
        Ok(result)
    }
}

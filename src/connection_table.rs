use std::sync::Arc;

use anyhow::bail;
use rustc_hash::FxHashMap;

use crate::connection::Connection;
use crate::control_messages::LinkInitMsg;
use crate::packet::ConnectionId;

/// The registry of connections on one physical link, keyed by connection id.
///
/// The driver keeps its [Connection]s here, and the relay keeps its routing entries in a table of
///  the same kind per linked service. Ids are allocated from a randomly seeded counter so that ids
///  of a restarted process are unlikely to collide with stale ids still in flight.
pub struct ConnectionTable<T> {
    entries: FxHashMap<ConnectionId, Arc<T>>,
    next_id: u32,
}

impl<T> Default for ConnectionTable<T> {
    fn default() -> Self {
        Self::with_seed(rand::random())
    }
}

impl<T> ConnectionTable<T> {
    pub fn new() -> ConnectionTable<T> {
        Default::default()
    }

    pub fn with_seed(seed: u32) -> ConnectionTable<T> {
        ConnectionTable {
            entries: FxHashMap::default(),
            next_id: seed,
        }
    }

    /// Picks an id that is neither [ConnectionId::LINK] nor currently in use
    pub fn allocate_id(&mut self) -> anyhow::Result<ConnectionId> {
        if self.entries.len() >= u32::MAX as usize - 1 {
            bail!("connection table is full");
        }
        loop {
            let candidate = ConnectionId::from_raw(self.next_id);
            self.next_id = self.next_id.wrapping_add(1);
            if !candidate.is_link() && !self.entries.contains_key(&candidate) {
                return Ok(candidate);
            }
        }
    }

    /// Adds an entry. An id that is in use already is a protocol violation on the peer's side.
    pub fn insert(&mut self, id: ConnectionId, entry: Arc<T>) -> anyhow::Result<()> {
        if id.is_link() {
            bail!("connection id {} is reserved for the link", id);
        }
        if self.entries.contains_key(&id) {
            bail!("connection id {} is already in use", id);
        }
        self.entries.insert(id, entry);
        Ok(())
    }

    /// Adds or replaces an entry, returning the replaced one
    pub fn put(&mut self, id: ConnectionId, entry: Arc<T>) -> Option<Arc<T>> {
        self.entries.insert(id, entry)
    }

    pub fn get(&self, id: ConnectionId) -> Option<Arc<T>> {
        self.entries.get(&id).cloned()
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.entries.contains_key(&id)
    }

    pub fn remove(&mut self, id: ConnectionId) -> Option<Arc<T>> {
        self.entries.remove(&id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// all ids in ascending order
    pub fn ids(&self) -> Vec<ConnectionId> {
        let mut result = self.entries.keys().cloned().collect::<Vec<_>>();
        result.sort();
        result
    }

    /// A copy of all entries, so that they can be processed without holding a lock on the table
    pub fn entries(&self) -> Vec<Arc<T>> {
        self.ids().into_iter()
            .filter_map(|id| self.get(id))
            .collect()
    }

    pub fn clear(&mut self) -> Vec<Arc<T>> {
        let result = self.entries();
        self.entries.clear();
        result
    }
}

impl ConnectionTable<Connection> {
    /// Serializes all live connections into a link init message
    pub async fn snapshot(&self, service_name: &str) -> LinkInitMsg {
        let mut connections = Vec::new();
        for conn in self.entries() {
            if !conn.is_terminal().await {
                connections.push(conn.snapshot().await);
            }
        }
        LinkInitMsg {
            service_name: service_name.to_string(),
            connections,
        }
    }
}

use std::collections::BTreeMap;
use std::fmt::{Debug, Formatter};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use crate::connection::{Connection, ConnectionState};
use crate::error::TunnelError;
use crate::packet::ConnectionId;

/// The application's view of a tunneled connection: a reliable, ordered byte stream.
///
/// Handles are cheap to clone; all clones refer to the same connection. Dropping a handle does
///  not close the connection - call [TunnelHandle::close] for that.
#[derive(Clone)]
pub struct TunnelHandle {
    conn: Arc<Connection>,
}

impl Debug for TunnelHandle {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "TunnelHandle{{{}@{}}}", self.conn.id(), self.conn.peer_address())
    }
}

impl TunnelHandle {
    pub fn new(conn: Arc<Connection>) -> TunnelHandle {
        TunnelHandle { conn }
    }

    /// Reads up to `max_len` bytes, waiting until data is available. Returns `Ok(None)` once the
    ///  peer closed the connection and everything it sent was read.
    pub async fn read(&self, max_len: usize) -> Result<Option<Bytes>, TunnelError> {
        self.conn.read(max_len).await
    }

    /// Writes all of `data`, waiting while the send window is full
    pub async fn write(&self, data: &[u8]) -> Result<(), TunnelError> {
        self.conn.write(data).await
    }

    pub async fn close(&self) -> Result<(), TunnelError> {
        self.conn.close().await
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.conn.id()
    }

    pub fn peer_address(&self) -> &str {
        self.conn.peer_address()
    }

    pub async fn state(&self) -> ConnectionState {
        self.conn.state().await
    }

    /// `None` means continuous long-polling
    pub async fn pull_period(&self) -> Option<Duration> {
        self.conn.pull_period().await
    }

    pub async fn set_pull_period(&self, pull_period: Option<Duration>) -> Result<(), TunnelError> {
        self.conn.set_pull_period(pull_period).await
    }

    pub async fn connection_timeout(&self) -> Duration {
        self.conn.connection_timeout().await
    }

    pub async fn set_connection_timeout(&self, timeout: Duration) -> Result<(), TunnelError> {
        self.conn.set_connection_timeout(timeout).await
    }

    /// A key / value snapshot of the connection's internals for diagnostics
    pub async fn debug_state(&self) -> BTreeMap<String, String> {
        self.conn.debug_state().await
    }
}

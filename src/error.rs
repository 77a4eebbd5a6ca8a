use thiserror::Error;

/// Errors surfaced to code using a [crate::tunnel_handle::TunnelHandle]. Once a connection
///  terminates with an error, every subsequent read and write returns the same error.
#[derive(Error, Debug, Clone, Eq, PartialEq)]
pub enum TunnelError {
    #[error("connection rejected by peer: {0}")]
    ConnectRejected(String),
    #[error("timed out waiting for the connection handshake")]
    ConnectTimeout,
    #[error("connect failed: {0}")]
    ConnectFailed(String),
    #[error("connection aborted: {0}")]
    Aborted(String),
    #[error("connection timed out")]
    Timeout,
    #[error("connection reset by peer")]
    ResetByPeer,
    #[error("connection is closed")]
    Closed,
    #[error("driver is shutting down")]
    ShuttingDown,
}

impl From<TunnelError> for std::io::Error {
    fn from(value: TunnelError) -> Self {
        use std::io::ErrorKind;

        let kind = match &value {
            TunnelError::ConnectRejected(_) => ErrorKind::ConnectionRefused,
            TunnelError::ConnectTimeout | TunnelError::Timeout => ErrorKind::TimedOut,
            TunnelError::ConnectFailed(_) => ErrorKind::NotConnected,
            TunnelError::Aborted(_) => ErrorKind::ConnectionAborted,
            TunnelError::ResetByPeer => ErrorKind::ConnectionReset,
            TunnelError::Closed => ErrorKind::BrokenPipe,
            TunnelError::ShuttingDown => ErrorKind::Other,
        };
        std::io::Error::new(kind, value)
    }
}

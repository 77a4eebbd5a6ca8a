//! Reliable, ordered byte streams between clients and a message broker that can only reach each
//!  other through HTTP.
//!
//! Three parties take part:
//! * the client, which can only make outbound HTTP requests. A [client_driver::ClientDriver]
//!   opens connections by POSTing frames to the relay and fetches everything addressed to it by
//!   polling.
//! * the relay ([relay::Relay]), an HTTP server reachable by clients. It holds a pull queue per
//!   connection and forwards everything else over a persistent TCP link to the broker.
//! * the broker, which runs a [server_driver::ServerDriver]. The driver owns the link, keeps the
//!   authoritative state of every connection and hands accepted connections to the application.
//!
//! Since HTTP exchanges may be lost, duplicated or reordered, every connection runs a sliding
//!  window protocol on top: sequenced packets with cumulative acks, adaptive retransmission
//!  timeouts and flow control by the receiver's advertised window.
//!
//! All frames share this layout (big endian):
//!
//! ```text
//!  0: version (u8), kind (u8), flags (u8), reserved (u8)
//!  4: connection id (u32)
//!  8: sequence (u64)
//! 16: ack sequence (u64)
//! 24: ack window (u32)
//! 28: payload length (u32)
//! 32: checksum (u32), CRC-32C over the preceding header bytes and the payload
//! 36: payload
//! ```
//!
//! Application code works with [tunnel_handle::TunnelHandle]s, which read and write bytes and
//!  surface failures as [error::TunnelError].

pub mod config;
pub mod seq_no;
pub mod packet;
pub mod control_messages;
pub mod retransmit;
pub mod send_window;
pub mod receive_buffer;
pub mod connection;
pub mod connection_table;
pub mod drain_barrier;
pub mod link;
pub mod server_driver;
pub mod client_driver;
pub mod http_transport;
pub mod relay;
pub mod tunnel_handle;
pub mod error;
pub mod util;
pub mod test_util;


#[cfg(test)]
mod test {
    use tracing::Level;

    #[ctor::ctor]
    fn init_test_logging() {
        tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(Level::TRACE)
            .try_init()
            .ok();
    }
}

use std::time::Duration;

use anyhow::bail;

use crate::packet::MAX_PACKET_SIZE;

/// Port on which a relay accepts the server driver's link
pub const DEFAULT_PORT: u16 = 7675;

/// What `close()` does with data that was written but is not acknowledged yet
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ClosePolicy {
    /// Send the close marker after the pending data and wait (up to
    ///  [TunnelConfig::close_wait_timeout]) until the peer acknowledged everything before it
    WaitForDrain,
    /// Discard pending data: if there is any, the connection is aborted rather than closed
    ///  gracefully, since the stream can not be terminated cleanly with a gap in it
    Abandon,
}

#[derive(Debug, Clone)]
pub struct RetransmitConfig {
    /// The retransmission timeout used before the first round trip was measured
    pub initial_timeout: Duration,
    /// Lower bound for the adaptive timeout. Round trip measurements below this value are
    ///  treated as this value.
    pub min_timeout: Duration,
    /// Upper bound for both the adaptive timeout and exponential backoff
    pub max_timeout: Duration,
    /// Number of duplicate acks for the oldest unacked packet that trigger a retransmission
    ///  without waiting for its timer
    pub fast_retransmit_ack_count: u32,
    /// If set, a connection is aborted with a timeout error once any single packet was
    ///  retransmitted more often than this. `None` leaves dead peers to the idle timeouts.
    pub max_retransmits: Option<u32>,
}

impl Default for RetransmitConfig {
    fn default() -> Self {
        RetransmitConfig {
            initial_timeout: Duration::from_millis(15_000),
            min_timeout: Duration::from_millis(1_000),
            max_timeout: Duration::from_millis(180_000),
            fast_retransmit_ack_count: 3,
            max_retransmits: None,
        }
    }
}

/// The physical link between the broker-side driver and the relay
#[derive(Debug, Clone)]
pub struct LinkConfig {
    /// delay between attempts to (re-)establish the link
    pub retry_interval: Duration,
    /// Once the link was down for this long in total, all connections on it are aborted. The
    ///  driver keeps trying to re-establish the link for new connections.
    pub max_retry_wait: Duration,
    /// capacity of the queue of encoded frames waiting to be written to the link
    pub send_queue_len: usize,
}

impl Default for LinkConfig {
    fn default() -> Self {
        LinkConfig {
            retry_interval: Duration::from_millis(5_000),
            max_retry_wait: Duration::from_millis(900_000),
            send_queue_len: 4096,
        }
    }
}

/// Client-side pull scheduling
#[derive(Debug, Clone)]
pub struct PollConfig {
    /// Initial pull period for new connections. `None` selects continuous long-polling, `Some`
    ///  makes the client sleep that long between polls when there is no data.
    pub default_pull_period: Option<Duration>,
    /// If no HTTP exchange for a connection succeeds for this long, the connection is aborted.
    ///  This is also the idle timeout announced to the peer in the handshake.
    pub default_connection_timeout: Duration,
    /// upper bound for waiting on the handshake to complete
    pub connect_timeout: Duration,
    /// pause after a failed pull before the next attempt
    pub poll_error_backoff: Duration,
}

impl Default for PollConfig {
    fn default() -> Self {
        PollConfig {
            default_pull_period: None,
            default_connection_timeout: Duration::from_secs(300),
            connect_timeout: Duration::from_secs(60),
            poll_error_backoff: Duration::from_secs(1),
        }
    }
}

/// The HTTP-facing relay
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// If `true`, each pull response carries at most one packet. Otherwise a pull response
    ///  drains the pull queue up to [MAX_PACKET_SIZE] bytes of frames.
    pub one_packet_per_request: bool,
    /// How long a pull request in continuous mode may be held open waiting for data before it is
    ///  answered with a no-op packet
    pub max_pull_block: Duration,
    /// Idle timeout for connections in continuous mode. In periodic mode, the idle timeout is
    ///  five times the pull period.
    pub default_idle_timeout: Duration,
    /// Bound of each connection's pull queue. Data packets beyond it are dropped and left to
    ///  retransmission.
    pub pull_queue_capacity: usize,
    /// minimum interval between two idle timeout checks
    pub timeout_check_interval: Duration,
    /// How long a service's connections are kept after its driver link dropped, waiting for
    ///  the driver to re-establish the link
    pub link_down_grace: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        RelayConfig {
            one_packet_per_request: false,
            max_pull_block: Duration::from_millis(60_000),
            default_idle_timeout: Duration::from_secs(60),
            pull_queue_capacity: 1024,
            timeout_check_interval: Duration::from_secs(5),
            link_down_grace: Duration::from_millis(900_000),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TunnelConfig {
    /// This is the maximum number of sequenced packets (not bytes) a connection keeps in flight
    ///  without acknowledgement. Writers are suspended while the window is full.
    pub window_size: u32,
    /// Writes are split into packets carrying at most this many bytes
    pub max_payload_len: usize,
    /// Interval of the sweep that drives retransmission timers, close timeouts and cleanup of
    ///  terminated connections
    pub sweep_interval: Duration,
    pub close_policy: ClosePolicy,
    /// upper bound for `close()` waiting for pending data to be acknowledged
    pub close_wait_timeout: Duration,
    /// How long a gracefully closed connection is kept before it is removed. Its peer may
    ///  retransmit the close marker if the ack got lost, and that must be acknowledged rather
    ///  than answered with an abort.
    pub close_linger: Duration,
    /// Number of accepted connections waiting for the application to pick them up. Handshakes
    ///  beyond that are rejected.
    pub accept_backlog: usize,
    /// Number of live connections a driver accepts before rejecting handshakes
    pub max_connections: usize,
    /// interval for logging progress while shutdown waits for in-flight work
    pub shutdown_progress_interval: Duration,

    pub retransmit: RetransmitConfig,
    pub link: LinkConfig,
    pub poll: PollConfig,
    pub relay: RelayConfig,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        TunnelConfig {
            window_size: 64,
            max_payload_len: MAX_PACKET_SIZE,
            sweep_interval: Duration::from_millis(250),
            close_policy: ClosePolicy::WaitForDrain,
            close_wait_timeout: Duration::from_secs(60),
            close_linger: Duration::from_secs(5),
            accept_backlog: 100,
            max_connections: 1024,
            shutdown_progress_interval: Duration::from_secs(5),
            retransmit: RetransmitConfig::default(),
            link: LinkConfig::default(),
            poll: PollConfig::default(),
            relay: RelayConfig::default(),
        }
    }
}

impl TunnelConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.window_size == 0 || self.window_size > 1024 {
            bail!("window size must be in 1..=1024, was {}", self.window_size);
        }
        if self.max_payload_len == 0 || self.max_payload_len > MAX_PACKET_SIZE {
            bail!("max payload length must be in 1..={}, was {}", MAX_PACKET_SIZE, self.max_payload_len);
        }
        if self.sweep_interval.is_zero() {
            bail!("sweep interval must not be zero");
        }

        let r = &self.retransmit;
        if r.min_timeout.is_zero() || r.min_timeout > r.max_timeout {
            bail!("retransmit timeout bounds are inconsistent: [{:?}, {:?}]", r.min_timeout, r.max_timeout);
        }
        if r.initial_timeout < r.min_timeout || r.initial_timeout > r.max_timeout {
            bail!("initial retransmit timeout {:?} is outside [{:?}, {:?}]", r.initial_timeout, r.min_timeout, r.max_timeout);
        }
        if r.fast_retransmit_ack_count == 0 {
            bail!("fast retransmit ack count must be positive");
        }

        if self.link.retry_interval.is_zero() {
            bail!("link retry interval must not be zero");
        }
        if self.link.send_queue_len == 0 {
            bail!("link send queue length must be positive");
        }
        if self.relay.pull_queue_capacity == 0 {
            bail!("pull queue capacity must be positive");
        }
        if self.accept_backlog == 0 {
            bail!("accept backlog must be positive");
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_default_is_valid() {
        let config = TunnelConfig::default();
        config.validate().unwrap();

        assert_eq!(config.window_size, 64);
        assert_eq!(config.max_payload_len, 8192);
        assert_eq!(config.retransmit.initial_timeout, Duration::from_millis(15_000));
        assert_eq!(config.relay.max_pull_block, Duration::from_millis(60_000));
        assert_eq!(config.link.max_retry_wait, Duration::from_millis(900_000));
    }

    #[rstest]
    #[case::window_zero(|c: &mut TunnelConfig| c.window_size = 0)]
    #[case::window_huge(|c: &mut TunnelConfig| c.window_size = 5000)]
    #[case::payload_zero(|c: &mut TunnelConfig| c.max_payload_len = 0)]
    #[case::payload_too_big(|c: &mut TunnelConfig| c.max_payload_len = MAX_PACKET_SIZE + 1)]
    #[case::sweep_zero(|c: &mut TunnelConfig| c.sweep_interval = Duration::ZERO)]
    #[case::min_above_max(|c: &mut TunnelConfig| c.retransmit.min_timeout = Duration::from_secs(200))]
    #[case::initial_below_min(|c: &mut TunnelConfig| c.retransmit.initial_timeout = Duration::from_millis(10))]
    #[case::fast_retransmit_zero(|c: &mut TunnelConfig| c.retransmit.fast_retransmit_ack_count = 0)]
    #[case::retry_zero(|c: &mut TunnelConfig| c.link.retry_interval = Duration::ZERO)]
    #[case::pull_queue_zero(|c: &mut TunnelConfig| c.relay.pull_queue_capacity = 0)]
    #[case::backlog_zero(|c: &mut TunnelConfig| c.accept_backlog = 0)]
    fn test_validate_rejects(#[case] modify: fn(&mut TunnelConfig)) {
        let mut config = TunnelConfig::default();
        modify(&mut config);
        assert!(config.validate().is_err());
    }
}

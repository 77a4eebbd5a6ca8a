use std::time::Duration;

use tokio::time::Instant;

use crate::config::RetransmitConfig;

/// Adaptive retransmission timeout, derived from a smoothed round trip time.
///
/// Each sample is folded into the smoothed RTT with a weight of 1/8, and the timeout is twice the
///  smoothed RTT, clamped to the configured bounds. Samples are only taken from packets that were
///  never retransmitted, since an ack for a retransmitted packet can not be attributed to one
///  particular transmission.
#[derive(Debug, Clone)]
pub struct RtoEstimator {
    smoothed_rtt: Option<Duration>,
    timeout: Duration,
    min_timeout: Duration,
    max_timeout: Duration,
}

impl RtoEstimator {
    pub fn new(config: &RetransmitConfig) -> RtoEstimator {
        RtoEstimator {
            smoothed_rtt: None,
            timeout: config.initial_timeout,
            min_timeout: config.min_timeout,
            max_timeout: config.max_timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn smoothed_rtt(&self) -> Option<Duration> {
        self.smoothed_rtt
    }

    pub fn on_rtt_sample(&mut self, rtt: Duration) {
        let smoothed = match self.smoothed_rtt {
            None => rtt,
            Some(prev) => (prev * 7 + rtt) / 8,
        };
        self.smoothed_rtt = Some(smoothed);
        self.timeout = (smoothed * 2).clamp(self.min_timeout, self.max_timeout);
    }
}

/// The retransmission state of a single unacked packet. The timer is 'destroyed' by dropping it
///  together with the packet when the packet's sequence number is acknowledged.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct RetransmitTimer {
    /// time of the most recent transmission
    pub send_time: Instant,
    pub current_timeout: Duration,
    pub retransmit_count: u32,
    /// duplicate acks received while this packet was the oldest unacked packet
    pub dup_ack_count: u32,
}

impl RetransmitTimer {
    pub fn start(now: Instant, timeout: Duration) -> RetransmitTimer {
        RetransmitTimer {
            send_time: now,
            current_timeout: timeout,
            retransmit_count: 0,
            dup_ack_count: 0,
        }
    }

    pub fn deadline(&self) -> Instant {
        self.send_time + self.current_timeout
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.deadline()
    }

    /// Restarts the timer for a retransmission. Expiry of the timer doubles the timeout up to
    ///  `max_timeout`; a fast retransmission keeps the current timeout.
    pub fn on_retransmit(&mut self, now: Instant, from_timer: bool, max_timeout: Duration) {
        self.retransmit_count += 1;
        self.send_time = now;
        if from_timer {
            self.current_timeout = (self.current_timeout * 2).min(max_timeout);
        }
    }

    /// Counts a duplicate ack and returns `true` exactly when the count reaches `threshold`, so
    ///  a burst of duplicates triggers a single fast retransmit
    #[must_use]
    pub fn on_dup_ack(&mut self, threshold: u32) -> bool {
        self.dup_ack_count += 1;
        self.dup_ack_count == threshold
    }

    /// The round trip time if the ack refers to an unambiguous transmission
    pub fn rtt_sample(&self, now: Instant) -> Option<Duration> {
        if self.retransmit_count == 0 {
            Some(now.saturating_duration_since(self.send_time))
        }
        else {
            None
        }
    }
}

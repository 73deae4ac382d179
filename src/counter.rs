//! Small helpers for measuring throughput and smoothed round-trip time,
//! shared by the peer congestion window (spec.md §4.1), the choke scheduler
//! (§4.4, "sort by recent download/upload rate"), and the adaptive piece
//! selector (§4.2, "measure aggregate download throughput").

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// A sliding-window byte-rate counter. Bytes are recorded with a timestamp;
/// `rate` sums everything within the window and divides by its length.
#[derive(Debug)]
pub(crate) struct ThroughputCounter {
    window: Duration,
    samples: VecDeque<(Instant, u64)>,
    total_in_window: u64,
}

impl ThroughputCounter {
    pub(crate) fn new(window: Duration) -> Self {
        Self {
            window,
            samples: VecDeque::new(),
            total_in_window: 0,
        }
    }

    /// Records `bytes` transferred at `now`.
    pub(crate) fn record(&mut self, now: Instant, bytes: u64) {
        self.samples.push_back((now, bytes));
        self.total_in_window += bytes;
        self.evict(now);
    }

    /// Returns the current rate in bytes/sec, evicting stale samples first.
    pub(crate) fn rate(&mut self, now: Instant) -> f64 {
        self.evict(now);
        if self.window.as_secs_f64() == 0.0 {
            return 0.0;
        }
        self.total_in_window as f64 / self.window.as_secs_f64()
    }

    fn evict(&mut self, now: Instant) {
        while let Some((ts, bytes)) = self.samples.front() {
            if now.saturating_duration_since(*ts) > self.window {
                self.total_in_window -= bytes;
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }
}

/// A smoothed round-trip time estimator (Jacobson/Karels, as used for TCP's
/// RTO), driving the per-peer request timeout in the congestion window
/// (spec.md §4.1: "SRTT, RTTVAR, RTO = SRTT + 4*RTTVAR; on timeout RTO
/// doubles up to a cap").
#[derive(Debug, Clone, Copy)]
pub(crate) struct RttEstimator {
    srtt: Option<Duration>,
    rttvar: Duration,
    rto: Duration,
    rto_cap: Duration,
}

const RTO_FLOOR: Duration = Duration::from_millis(500);

impl RttEstimator {
    pub(crate) fn new(rto_cap: Duration) -> Self {
        Self {
            srtt: None,
            rttvar: Duration::from_secs(0),
            rto: Duration::from_secs(60),
            rto_cap,
        }
    }

    /// Folds a fresh RTT sample into the smoothed estimate.
    pub(crate) fn sample(&mut self, rtt: Duration) {
        match self.srtt {
            None => {
                self.srtt = Some(rtt);
                self.rttvar = rtt / 2;
            }
            Some(srtt) => {
                let delta = if rtt > srtt { rtt - srtt } else { srtt - rtt };
                self.rttvar = (self.rttvar * 3 + delta) / 4;
                self.srtt = Some((srtt * 7 + rtt) / 8);
            }
        }
        let srtt = self.srtt.unwrap();
        self.rto = (srtt + self.rttvar * 4).max(RTO_FLOOR).min(self.rto_cap);
    }

    /// The current retransmission timeout.
    pub(crate) fn rto(&self) -> Duration {
        self.rto
    }

    /// Doubles the RTO after an observed timeout, capped at `rto_cap`.
    pub(crate) fn backoff(&mut self) {
        self.rto = (self.rto * 2).min(self.rto_cap);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_throughput_counter_evicts_stale_samples() {
        let mut counter = ThroughputCounter::new(Duration::from_secs(1));
        let t0 = Instant::now();
        counter.record(t0, 1000);
        assert_eq!(counter.rate(t0), 1000.0);

        let t1 = t0 + Duration::from_secs(2);
        // the t0 sample is now stale and should be evicted
        assert_eq!(counter.rate(t1), 0.0);
    }

    #[test]
    fn test_rtt_estimator_converges() {
        let mut rtt = RttEstimator::new(Duration::from_secs(60));
        for _ in 0..20 {
            rtt.sample(Duration::from_millis(100));
        }
        // after converging on a stable 100ms RTT, RTO should be close to the
        // floor rather than the initial 60s default
        assert!(rtt.rto() < Duration::from_secs(5));
    }

    #[test]
    fn test_rtt_backoff_caps() {
        let cap = Duration::from_secs(10);
        let mut rtt = RttEstimator::new(cap);
        rtt.sample(Duration::from_secs(8));
        for _ in 0..5 {
            rtt.backoff();
        }
        assert_eq!(rtt.rto(), cap);
    }
}

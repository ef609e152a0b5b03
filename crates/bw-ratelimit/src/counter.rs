//! Sliding-window event counters.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

/// Event classes tracked per peer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CounterKind {
    /// HTLC settled downstream.
    Success,

    /// HTLC failed downstream after being forwarded.
    Fail,

    /// HTLC rejected by the admission controller.
    Reject,
}

/// A sliding window of one-second buckets.
///
/// Buckets are stored sparsely (only seconds with activity) and evicted
/// lazily on access. Based on the monotonic clock only, so wall-clock skew
/// cannot distort the window.
pub struct RateCounter {
    window_secs: u64,
    started: Instant,
    buckets: VecDeque<Bucket>,
}

struct Bucket {
    second: u64,
    count: u64,
}

impl RateCounter {
    #[must_use]
    pub fn new(window: Duration) -> Self {
        Self {
            window_secs: window.as_secs().max(1),
            started: Instant::now(),
            buckets: VecDeque::new(),
        }
    }

    /// Add one event to the current second's bucket.
    pub fn incr(&mut self) {
        let second = self.started.elapsed().as_secs();
        self.evict(second);

        match self.buckets.back_mut() {
            Some(bucket) if bucket.second == second => bucket.count += 1,
            _ => self.buckets.push_back(Bucket { second, count: 1 }),
        }
    }

    /// Total events within the window.
    pub fn rate(&mut self) -> u64 {
        self.evict(self.started.elapsed().as_secs());
        self.buckets.iter().map(|b| b.count).sum()
    }

    fn evict(&mut self, now_second: u64) {
        while let Some(front) = self.buckets.front() {
            if front.second + self.window_secs <= now_second {
                self.buckets.pop_front();
            } else {
                break;
            }
        }
    }
}

/// One [`RateCounter`] per event class over a shared interval.
pub struct EventCounters {
    success: RateCounter,
    fail: RateCounter,
    reject: RateCounter,
}

impl EventCounters {
    #[must_use]
    pub fn new(window: Duration) -> Self {
        Self {
            success: RateCounter::new(window),
            fail: RateCounter::new(window),
            reject: RateCounter::new(window),
        }
    }

    pub fn incr(&mut self, kind: CounterKind) {
        match kind {
            CounterKind::Success => self.success.incr(),
            CounterKind::Fail => self.fail.incr(),
            CounterKind::Reject => self.reject.incr(),
        }
    }

    /// Snapshot of all three classes.
    pub fn rates(&mut self) -> RateCounts {
        RateCounts {
            success: self.success.rate(),
            fail: self.fail.rate(),
            reject: self.reject.rate(),
        }
    }
}

/// Point-in-time counter totals.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateCounts {
    pub success: u64,
    pub fail: u64,
    pub reject: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_within_window() {
        let mut counter = RateCounter::new(Duration::from_secs(60));

        assert_eq!(counter.rate(), 0);
        counter.incr();
        counter.incr();
        assert_eq!(counter.rate(), 2);
    }

    #[tokio::test]
    async fn evicts_expired_buckets() {
        let mut counter = RateCounter::new(Duration::from_secs(1));

        counter.incr();
        assert_eq!(counter.rate(), 1);

        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert_eq!(counter.rate(), 0);
    }

    #[test]
    fn classes_are_independent() {
        let mut counters = EventCounters::new(Duration::from_secs(3600));

        counters.incr(CounterKind::Success);
        counters.incr(CounterKind::Success);
        counters.incr(CounterKind::Reject);

        assert_eq!(
            counters.rates(),
            RateCounts {
                success: 2,
                fail: 0,
                reject: 1,
            }
        );
    }
}

//! Token bucket rate limiter with reservations.

use std::time::{Duration, Instant};

use parking_lot::Mutex;

const SECONDS_PER_HOUR: f64 = 3600.0;

/// Token bucket rate limiter.
///
/// Tokens accrue continuously at the configured rate up to the burst
/// capacity; each admission consumes one. An infinite rate disables
/// limiting entirely.
pub struct TokenBucket {
    state: Mutex<BucketState>,
}

struct BucketState {
    /// Tokens added per second. `f64::INFINITY` disables limiting.
    rate: f64,

    /// Bucket capacity.
    burst: f64,

    /// Current balance. Goes negative while reservations are outstanding.
    tokens: f64,

    /// When the balance was last brought up to date.
    updated: Instant,
}

impl BucketState {
    /// Accrue tokens for the time elapsed since the last update.
    fn advance(&mut self, now: Instant) {
        if self.rate.is_infinite() {
            self.tokens = self.burst;
        } else {
            let elapsed = now.saturating_duration_since(self.updated).as_secs_f64();
            self.tokens = (self.tokens + elapsed * self.rate).min(self.burst);
        }
        self.updated = now;
    }
}

impl TokenBucket {
    /// Create a bucket refilled at `max_hourly_rate` tokens per hour. A rate
    /// of zero means unlimited.
    #[must_use]
    pub fn per_hour(max_hourly_rate: i64, burst: u32) -> Self {
        Self::new(hourly_rate(max_hourly_rate), burst)
    }

    /// Create a bucket refilled at `rate` tokens per second, full to start.
    #[must_use]
    pub fn new(rate: f64, burst: u32) -> Self {
        Self {
            state: Mutex::new(BucketState {
                rate,
                burst: f64::from(burst),
                tokens: f64::from(burst),
                updated: Instant::now(),
            }),
        }
    }

    /// Consume one token if available.
    pub fn allow(&self) -> bool {
        let mut state = self.state.lock();
        state.advance(Instant::now());

        if state.rate.is_infinite() {
            return true;
        }
        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Take one token unconditionally and return a reservation carrying the
    /// deadline at which that token has accrued. The reservation cannot be
    /// cancelled; the caller sleeps until [`Reservation::ready_at`] before
    /// acting on it.
    pub fn reserve(&self) -> Reservation {
        let now = Instant::now();
        let mut state = self.state.lock();
        state.advance(now);

        if state.rate.is_infinite() {
            return Reservation { ready_at: now };
        }

        state.tokens -= 1.0;
        let ready_at = if state.tokens >= 0.0 {
            now
        } else {
            now + Duration::from_secs_f64(-state.tokens / state.rate)
        };

        Reservation { ready_at }
    }

    /// Change the refill rate. Takes effect immediately; the accrued balance
    /// is preserved.
    pub fn set_rate_per_hour(&self, max_hourly_rate: i64) {
        let mut state = self.state.lock();
        state.advance(Instant::now());
        state.rate = hourly_rate(max_hourly_rate);
    }

    /// Change the burst capacity. Accrued tokens beyond the new capacity are
    /// dropped.
    pub fn set_burst(&self, burst: u32) {
        let mut state = self.state.lock();
        state.advance(Instant::now());
        state.burst = f64::from(burst);
        state.tokens = state.tokens.min(state.burst);
    }
}

fn hourly_rate(max_hourly_rate: i64) -> f64 {
    if max_hourly_rate == 0 {
        f64::INFINITY
    } else {
        max_hourly_rate as f64 / SECONDS_PER_HOUR
    }
}

/// A claim on one future token.
#[derive(Clone, Copy, Debug)]
pub struct Reservation {
    ready_at: Instant,
}

impl Reservation {
    /// The instant at which the reserved token has accrued.
    #[must_use]
    pub const fn ready_at(&self) -> Instant {
        self.ready_at
    }

    /// Remaining wait, zero if already due.
    #[must_use]
    pub fn delay(&self) -> Duration {
        self.ready_at.saturating_duration_since(Instant::now())
    }
}

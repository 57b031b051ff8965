//! Per-direction bandwidth allowance and rate measurement.
//!
//! [`Allowance`] is a token bucket refilled at the direction's rate cap; a
//! cap of zero means unlimited. [`RateMeter`] keeps an exponentially
//! smoothed bytes-per-second estimate that the balancer uses to hand out
//! caps.

use std::time::{Duration, Instant};

/// How much unused allowance may accumulate, as seconds of the cap
const BURST_SECONDS: f64 = 0.25;

/// Smallest burst in bytes. Packets are written piecewise, so a tiny cap
/// still moves one byte at a time.
const MIN_BURST: f64 = 1.0;

/// Minimum interval between rate samples
const SAMPLE_INTERVAL: Duration = Duration::from_millis(100);

/// Weight of the newest sample in the moving average
const SMOOTHING: f64 = 0.3;

/// Token bucket for one direction.
#[derive(Debug, Clone)]
pub struct Allowance {
    /// Bytes per second, 0 = unlimited
    cap: u64,
    /// Current allowance in bytes
    tokens: f64,
    /// Last refill time
    last_refill: Instant,
}

impl Allowance {
    /// Create an allowance with the given cap, starting full.
    #[must_use]
    pub fn new(cap: u64, now: Instant) -> Self {
        Self {
            cap,
            tokens: Self::burst_for(cap),
            last_refill: now,
        }
    }

    fn burst_for(cap: u64) -> f64 {
        (cap as f64 * BURST_SECONDS).max(MIN_BURST)
    }

    /// Current cap in bytes per second
    #[must_use]
    pub fn cap(&self) -> u64 {
        self.cap
    }

    /// True when no cap applies
    #[must_use]
    pub fn is_unlimited(&self) -> bool {
        self.cap == 0
    }

    /// Change the cap. Accumulated allowance is clipped to the new burst;
    /// leaving unlimited mode starts with a full burst.
    pub fn set_cap(&mut self, cap: u64) {
        let burst = Self::burst_for(cap);
        self.tokens = if self.cap == 0 {
            burst
        } else {
            self.tokens.min(burst)
        };
        self.cap = cap;
    }

    /// Add allowance for the time elapsed since the last refill.
    pub fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill);
        self.last_refill = now;
        if self.cap == 0 {
            return;
        }
        let added = self.cap as f64 * elapsed.as_secs_f64();
        self.tokens = (self.tokens + added).min(Self::burst_for(self.cap));
    }

    /// Bytes that may move now; `usize::MAX` when unlimited.
    #[must_use]
    pub fn available(&self) -> usize {
        if self.cap == 0 {
            usize::MAX
        } else {
            self.tokens as usize
        }
    }

    /// Spend `bytes` of allowance.
    pub fn consume(&mut self, bytes: usize) {
        if self.cap != 0 {
            self.tokens = (self.tokens - bytes as f64).max(0.0);
        }
    }
}

/// Exponentially smoothed throughput estimate.
#[derive(Debug, Clone)]
pub struct RateMeter {
    rate: f64,
    pending: u64,
    last_sample: Instant,
}

impl RateMeter {
    /// Start measuring at `now`.
    #[must_use]
    pub fn new(now: Instant) -> Self {
        Self {
            rate: 0.0,
            pending: 0,
            last_sample: now,
        }
    }

    /// Count bytes moved.
    pub fn record(&mut self, bytes: usize) {
        self.pending += bytes as u64;
    }

    /// Fold pending bytes into the average if a sample interval has passed.
    pub fn sample(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_sample);
        if elapsed < SAMPLE_INTERVAL {
            return;
        }
        let instant = self.pending as f64 / elapsed.as_secs_f64();
        self.rate = SMOOTHING * instant + (1.0 - SMOOTHING) * self.rate;
        self.pending = 0;
        self.last_sample = now;
    }

    /// Smoothed rate in bytes per second
    #[must_use]
    pub fn rate(&self) -> f64 {
        self.rate
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unlimited() {
        let now = Instant::now();
        let mut a = Allowance::new(0, now);
        assert!(a.is_unlimited());
        a.consume(1_000_000);
        assert_eq!(a.available(), usize::MAX);
    }

    #[test]
    fn test_refill_and_consume() {
        let start = Instant::now();
        let mut a = Allowance::new(1000, start);
        // starts with a quarter second of burst
        assert_eq!(a.available(), 250);
        a.consume(250);
        assert_eq!(a.available(), 0);

        a.refill(start + Duration::from_millis(100));
        assert_eq!(a.available(), 100);

        // burst ceiling
        a.refill(start + Duration::from_secs(10));
        assert_eq!(a.available(), 250);

        a.consume(10_000);
        assert_eq!(a.available(), 0);
    }

    #[test]
    fn test_lowering_cap_clips_allowance() {
        let now = Instant::now();
        let mut a = Allowance::new(10_000, now);
        a.set_cap(100);
        assert_eq!(a.available(), 25);
        assert_eq!(a.cap(), 100);
    }

    #[test]
    fn test_capping_unlimited_starts_full() {
        let now = Instant::now();
        let mut a = Allowance::new(0, now);
        a.set_cap(4000);
        assert_eq!(a.available(), 1000);
    }

    #[test]
    fn test_tiny_cap_still_moves() {
        let start = Instant::now();
        let mut a = Allowance::new(1, start);
        assert_eq!(a.available(), 1);
        a.consume(1);
        assert_eq!(a.available(), 0);

        a.refill(start + Duration::from_millis(500));
        assert_eq!(a.available(), 0);
        a.refill(start + Duration::from_secs(1));
        assert_eq!(a.available(), 1);

        // never more than the one byte floor
        a.refill(start + Duration::from_secs(30));
        assert_eq!(a.available(), 1);

        a.set_cap(3);
        assert_eq!(a.available(), 1);
    }

    #[test]
    fn test_rate_meter_converges() {
        let start = Instant::now();
        let mut m = RateMeter::new(start);
        for i in 1..=50u64 {
            m.record(1000);
            m.sample(start + Duration::from_millis(100 * i));
        }
        // 1000 bytes every 100 ms
        assert!((m.rate() - 10_000.0).abs() < 100.0, "rate {}", m.rate());
    }

    #[test]
    fn test_rate_meter_ignores_short_intervals() {
        let start = Instant::now();
        let mut m = RateMeter::new(start);
        m.record(500);
        m.sample(start + Duration::from_millis(10));
        assert_eq!(m.rate(), 0.0);
    }
}

//! Arrival Rate Tracker
//!
//! Counts routed requests and turns the count into a requests/sec figure
//! each time `recompute()` is called.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Sliding counter of routed requests.
///
/// `arrived()` is a single atomic increment so it can sit on the request
/// path. `recompute()` is called periodically and converts the counter
/// delta over the elapsed wall time into a rate, then resets the counter.
#[derive(Debug)]
pub struct ArrivalRate {
    arrivals: AtomicU64,
    window: Mutex<RateWindow>,
}

#[derive(Debug)]
struct RateWindow {
    last_reset: Instant,
    rate: f64,
}

impl ArrivalRate {
    pub fn new() -> Self {
        Self::starting_at(Instant::now())
    }

    fn starting_at(now: Instant) -> Self {
        Self {
            arrivals: AtomicU64::new(0),
            window: Mutex::new(RateWindow {
                last_reset: now,
                rate: 0.0,
            }),
        }
    }

    /// Record one arrival.
    pub fn arrived(&self) {
        self.arrivals.fetch_add(1, Ordering::Relaxed);
    }

    /// Arrivals counted since the last recompute.
    pub fn pending(&self) -> u64 {
        self.arrivals.load(Ordering::Relaxed)
    }

    /// Last computed rate in requests per second.
    pub fn rate(&self) -> f64 {
        self.window.lock().rate
    }

    /// Convert the pending count into a rate and reset the counter.
    pub fn recompute(&self) -> f64 {
        self.recompute_at(Instant::now())
    }

    fn recompute_at(&self, now: Instant) -> f64 {
        let mut window = self.window.lock();
        let elapsed = now.saturating_duration_since(window.last_reset).as_secs_f64();
        if elapsed <= 0.0 {
            return window.rate;
        }
        let count = self.arrivals.swap(0, Ordering::Relaxed);
        window.rate = count as f64 / elapsed;
        window.last_reset = now;
        window.rate
    }
}

impl Default for ArrivalRate {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_new_rate_is_zero() {
        let rate = ArrivalRate::new();
        assert_eq!(rate.rate(), 0.0);
        assert_eq!(rate.pending(), 0);
    }

    #[test]
    fn test_arrived_increments_pending() {
        let rate = ArrivalRate::new();
        rate.arrived();
        rate.arrived();
        assert_eq!(rate.pending(), 2);
    }

    #[test]
    fn test_recompute_converts_to_per_second() {
        let start = Instant::now();
        let rate = ArrivalRate::starting_at(start);
        for _ in 0..20 {
            rate.arrived();
        }

        let computed = rate.recompute_at(start + Duration::from_secs(2));
        assert!((computed - 10.0).abs() < f64::EPSILON);
        assert_eq!(rate.pending(), 0);
        assert!((rate.rate() - 10.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_recompute_resets_window() {
        let start = Instant::now();
        let rate = ArrivalRate::starting_at(start);
        for _ in 0..10 {
            rate.arrived();
        }
        rate.recompute_at(start + Duration::from_secs(1));

        // Quiet second window drops the rate to zero
        let computed = rate.recompute_at(start + Duration::from_secs(2));
        assert_eq!(computed, 0.0);
    }

    #[test]
    fn test_recompute_zero_elapsed_keeps_rate() {
        let start = Instant::now();
        let rate = ArrivalRate::starting_at(start);
        rate.arrived();
        assert_eq!(rate.recompute_at(start), 0.0);
        assert_eq!(rate.pending(), 1);
    }
}

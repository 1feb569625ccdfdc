//! Fixed-interval request pacing.
//!
//! Each client owns one pacer; every attempt (including retries) reserves
//! the next free slot before it is sent.

use std::time::{Duration, Instant};

use parking_lot::Mutex;

pub struct RequestPacer {
    interval: Duration,
    next_slot: Mutex<Option<Instant>>,
}

impl RequestPacer {
    /// Pace to at most `requests_per_second`. Zero or negative disables pacing.
    pub fn per_second(requests_per_second: f64) -> Self {
        let interval = if requests_per_second > 0.0 {
            Duration::from_secs_f64(1.0 / requests_per_second)
        } else {
            Duration::ZERO
        };
        Self {
            interval,
            next_slot: Mutex::new(None),
        }
    }

    pub fn unlimited() -> Self {
        Self::per_second(0.0)
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Claim the next slot at or after `now` and return how long to wait for it.
    pub fn reserve(&self, now: Instant) -> Duration {
        let mut next = self.next_slot.lock();
        let slot = match *next {
            Some(at) if at > now => at,
            _ => now,
        };
        *next = Some(slot + self.interval);
        slot.saturating_duration_since(now)
    }

    pub async fn acquire(&self) {
        if self.interval.is_zero() {
            return;
        }
        let wait = self.reserve(Instant::now());
        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reserve_spaces_requests() {
        let pacer = RequestPacer::per_second(2.0);
        let t0 = Instant::now();
        assert_eq!(pacer.reserve(t0), Duration::ZERO);
        assert_eq!(pacer.reserve(t0), Duration::from_millis(500));
        assert_eq!(pacer.reserve(t0), Duration::from_millis(1000));
    }

    #[test]
    fn test_idle_time_is_not_banked() {
        let pacer = RequestPacer::per_second(1.0);
        let t0 = Instant::now();
        pacer.reserve(t0);
        let later = t0 + Duration::from_secs(10);
        assert_eq!(pacer.reserve(later), Duration::ZERO);
        assert_eq!(pacer.reserve(later), Duration::from_secs(1));
    }

    #[test]
    fn test_unlimited_never_waits() {
        let pacer = RequestPacer::unlimited();
        let t0 = Instant::now();
        for _ in 0..5 {
            assert_eq!(pacer.reserve(t0), Duration::ZERO);
        }
    }

    #[tokio::test]
    async fn test_acquire_waits_for_slot() {
        let pacer = RequestPacer::per_second(20.0);
        let start = Instant::now();
        pacer.acquire().await;
        pacer.acquire().await;
        assert!(start.elapsed() >= Duration::from_millis(45));
    }
}

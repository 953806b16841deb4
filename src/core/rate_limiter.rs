//! Token-bucket rate limiting.
//!
//! One [`RateLimiterPair`] exists process-wide and one per torrent. The
//! download pipeline consumes from both download buckets before crediting a
//! received block; each session writer consumes from both upload buckets
//! before emitting a `piece` frame.
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

/// Sleep bounds for [`TokenBucket::wait_for`]: exponential backoff between
/// polls of `try_consume`.
const WAIT_FLOOR: Duration = Duration::from_millis(10);
const WAIT_CEILING: Duration = Duration::from_millis(100);

#[derive(Debug)]
struct BucketState {
    /// Bytes per second; `0` disables the bucket entirely.
    rate_bps: u64,
    /// Burst capacity, always equal to `rate_bps`.
    capacity: f64,
    tokens: f64,
    last_refill: Instant,
}

/// A token bucket. An unlimited bucket (`rate` of `None` or `0`) admits
/// everything without touching the clock.
#[derive(Debug)]
pub struct TokenBucket {
    state: Mutex<BucketState>,
}

impl TokenBucket {
    #[must_use]
    pub fn new(rate_bps: Option<u64>) -> Self {
        let rate_bps = rate_bps.unwrap_or(0);
        Self {
            state: Mutex::new(BucketState {
                rate_bps,
                capacity: rate_bps as f64,
                tokens: rate_bps as f64,
                last_refill: Instant::now(),
            }),
        }
    }

    #[must_use]
    pub fn is_unlimited(&self) -> bool {
        self.state.lock().expect("bucket lock poisoned").rate_bps == 0
    }

    /// The configured rate, `None` when unlimited.
    #[must_use]
    pub fn rate_bps(&self) -> Option<u64> {
        let state = self.state.lock().expect("bucket lock poisoned");
        (state.rate_bps != 0).then_some(state.rate_bps)
    }

    /// Replace the rate. Tokens reset to the new capacity.
    pub fn set_rate(&self, rate_bps: Option<u64>) {
        let rate_bps = rate_bps.unwrap_or(0);
        let mut state = self.state.lock().expect("bucket lock poisoned");
        state.rate_bps = rate_bps;
        state.capacity = rate_bps as f64;
        state.tokens = rate_bps as f64;
        state.last_refill = Instant::now();
    }

    /// Refill from elapsed time, then either take `n` tokens or take
    /// nothing.
    #[must_use]
    pub fn try_consume(&self, n: u64) -> bool {
        let mut state = self.state.lock().expect("bucket lock poisoned");
        if state.rate_bps == 0 {
            return true;
        }

        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * state.rate_bps as f64).min(state.capacity);
        state.last_refill = now;

        let needed = n as f64;
        if state.tokens >= needed {
            state.tokens -= needed;
            true
        } else {
            false
        }
    }

    /// Poll `try_consume` with exponential backoff until it succeeds or the
    /// token is cancelled. Returns `false` on cancellation.
    pub async fn wait_for(&self, n: u64, cancel: &CancellationToken) -> bool {
        let mut backoff = WAIT_FLOOR;
        loop {
            if self.try_consume(n) {
                return true;
            }
            tokio::select! {
                () = cancel.cancelled() => return false,
                () = tokio::time::sleep(backoff) => {}
            }
            backoff = (backoff * 2).min(WAIT_CEILING);
        }
    }
}

/// The download/upload bucket pair carried at both the process and torrent
/// scopes.
#[derive(Debug)]
pub struct RateLimiterPair {
    pub download: TokenBucket,
    pub upload: TokenBucket,
}

impl RateLimiterPair {
    #[must_use]
    pub fn new(download_bps: Option<u64>, upload_bps: Option<u64>) -> Self {
        Self {
            download: TokenBucket::new(download_bps),
            upload: TokenBucket::new(upload_bps),
        }
    }

    #[must_use]
    pub fn unlimited() -> Self {
        Self::new(None, None)
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use tokio_util::sync::CancellationToken;

    use super::TokenBucket;

    #[test]
    fn unlimited_buckets_always_admit() {
        for bucket in [TokenBucket::new(None), TokenBucket::new(Some(0))] {
            assert!(bucket.is_unlimited());
            for _ in 0..10_000 {
                assert!(bucket.try_consume(u64::MAX / 2));
            }
        }
    }

    #[test]
    fn admissions_stay_under_rate_times_window_plus_capacity() {
        let rate = 1_000_000u64;
        let bucket = TokenBucket::new(Some(rate));

        let start = Instant::now();
        let mut admitted = 0u64;
        while start.elapsed() < Duration::from_millis(100) {
            if bucket.try_consume(10_000) {
                admitted += 10_000;
            }
        }

        let window = start.elapsed().as_secs_f64();
        let ceiling = (rate as f64 * window) as u64 + rate;
        assert!(admitted <= ceiling, "admitted {admitted} over ceiling {ceiling}");
    }

    #[test]
    fn a_drained_bucket_rejects_until_refilled() {
        let bucket = TokenBucket::new(Some(1_000));
        assert!(bucket.try_consume(1_000));
        assert!(!bucket.try_consume(500));

        std::thread::sleep(Duration::from_millis(600));
        assert!(bucket.try_consume(500));
    }

    #[test]
    fn updating_the_rate_resets_tokens_to_the_new_capacity() {
        let bucket = TokenBucket::new(Some(100));
        assert!(bucket.try_consume(100));
        assert!(!bucket.try_consume(100));

        bucket.set_rate(Some(10_000));
        assert!(bucket.try_consume(10_000));

        bucket.set_rate(None);
        assert!(bucket.is_unlimited());
    }

    #[tokio::test]
    async fn wait_for_returns_false_on_cancellation() {
        let bucket = TokenBucket::new(Some(1));
        assert!(bucket.try_consume(1));

        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(!bucket.wait_for(1_000_000, &cancel).await);
    }

    #[tokio::test]
    async fn wait_for_eventually_acquires() {
        let bucket = TokenBucket::new(Some(100_000));
        assert!(bucket.try_consume(100_000));

        let cancel = CancellationToken::new();
        assert!(bucket.wait_for(1_000, &cancel).await);
    }
}

//! C1: monotonic clock and token-bucket rate limiting (§4.1).
//!
//! Grounded on `original_source/src/uart_tcp_client.py`'s `AsyncTokenBucket`:
//! a lock held across the refill-and-check, released before sleeping, and
//! retried — the same shape reproduced here with a `tokio::sync::Mutex`.

use std::time::{Duration, Instant};

use tokio::sync::Mutex;

struct BucketState {
    tokens: u64,
    last_refill: Instant,
}

/// A token bucket with `capacity = 2 * rate` (§3). `rate == 0` means
/// unlimited: `consume` returns immediately without touching the lock.
pub struct TokenBucket {
    rate_per_sec: u64,
    capacity: u64,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    #[must_use]
    pub fn new(rate_per_sec: u64) -> Self {
        let capacity = rate_per_sec.saturating_mul(2);
        Self {
            rate_per_sec,
            capacity,
            state: Mutex::new(BucketState { tokens: capacity, last_refill: Instant::now() }),
        }
    }

    /// Await until `amount` tokens are available, then decrement.
    pub async fn consume(&self, amount: u64) {
        if self.rate_per_sec == 0 {
            return;
        }
        loop {
            let sleep_ms = {
                let mut state = self.state.lock().await;
                self.refill(&mut state);
                if state.tokens >= amount {
                    state.tokens -= amount;
                    return;
                }
                let need = amount - state.tokens;
                ((need * 1000) / self.rate_per_sec).max(1)
            };
            tokio::time::sleep(Duration::from_millis(sleep_ms)).await;
        }
    }

    fn refill(&self, state: &mut BucketState) {
        let elapsed_ms = u64::try_from(state.last_refill.elapsed().as_millis()).unwrap_or(u64::MAX);
        if elapsed_ms == 0 {
            return;
        }
        let add = self.rate_per_sec * elapsed_ms / 1000;
        if add > 0 {
            state.tokens = (state.tokens + add).min(self.capacity);
            state.last_refill = Instant::now();
        }
    }

    #[cfg(test)]
    async fn tokens_available(&self) -> u64 {
        let mut state = self.state.lock().await;
        self.refill(&mut state);
        state.tokens
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unlimited_rate_never_blocks() {
        let bucket = TokenBucket::new(0);
        bucket.consume(1_000_000).await;
    }

    #[tokio::test]
    async fn capacity_is_twice_rate_and_never_exceeded() {
        let bucket = TokenBucket::new(10);
        assert_eq!(bucket.capacity, 20);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(bucket.tokens_available().await <= 20);
    }

    #[tokio::test(start_paused = true)]
    async fn consume_blocks_until_refill() {
        let bucket = TokenBucket::new(10); // capacity 20
        bucket.consume(20).await; // drain fully
        let start = Instant::now();
        bucket.consume(5).await; // needs a refill
        assert!(start.elapsed() >= Duration::from_millis(400));
    }
}

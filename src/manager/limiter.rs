use std::time::Duration;

use tokio::{
    sync::{watch, Mutex},
    time::Instant,
};

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    refilled_at: Instant,
}

impl Bucket {
    fn refill(&mut self, rate: f64, capacity: f64) {
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(self.refilled_at).as_secs_f64();
        self.tokens = (self.tokens + elapsed * rate).min(capacity);
        self.refilled_at = now;
    }
}

/// Per-connection token bucket, `rate` tokens per second, at most `rate` stored.
#[derive(Debug)]
pub(crate) struct RateLimiter {
    rate: f64,
    bucket: Mutex<Bucket>,
    closed: watch::Sender<bool>,
}

impl RateLimiter {
    pub fn new(per_second: u32) -> Self {
        let rate = f64::from(per_second.max(1));
        let (closed, _) = watch::channel(false);

        Self {
            rate,
            bucket: Mutex::new(Bucket {
                tokens: rate,
                refilled_at: Instant::now(),
            }),
            closed,
        }
    }

    /// Take one token, waiting at most `timeout` for a refill.
    ///
    /// Returns false on timeout or when the limiter is closed.
    pub async fn acquire(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut closed = self.closed.subscribe();

        loop {
            if *closed.borrow() {
                return false;
            }

            let wait = {
                let mut bucket = self.bucket.lock().await;
                bucket.refill(self.rate, self.rate);
                if bucket.tokens + 1e-9 >= 1.0 {
                    bucket.tokens = (bucket.tokens - 1.0).max(0.0);
                    return true;
                }
                Duration::from_secs_f64((1.0 - bucket.tokens) / self.rate)
            };

            let now = Instant::now();
            if now >= deadline {
                log::trace!("Rate limiter acquire timeout");
                return false;
            }

            let wake = (now + wait).min(deadline);
            log::trace!("Rate limiter empty, wait {:?}", wake - now);

            tokio::select! {
                biased;

                changed = closed.changed() => {
                    if changed.is_err() || *closed.borrow() {
                        return false;
                    }
                }
                _ = tokio::time::sleep_until(wake) => {}
            }
        }
    }

    /// Release waiters, every later acquire fails
    pub fn close(&self) {
        self.closed.send_replace(true);
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_burst_up_to_capacity() {
        let limiter = RateLimiter::new(3);

        for _ in 0..3 {
            assert!(limiter.acquire(Duration::ZERO).await);
        }
        assert!(!limiter.acquire(Duration::ZERO).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refill_once_per_second() {
        let limiter = RateLimiter::new(1);
        let start = Instant::now();

        assert!(limiter.acquire(Duration::from_secs(1)).await);
        assert!(limiter.acquire(Duration::from_secs(1)).await);

        assert!(start.elapsed() >= Duration::from_secs(1));
        assert!(start.elapsed() < Duration::from_millis(1100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_shorter_than_refill_drops() {
        let limiter = RateLimiter::new(1);

        assert!(limiter.acquire(Duration::from_millis(500)).await);
        assert!(!limiter.acquire(Duration::from_millis(500)).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_wakes_waiter() {
        let limiter = Arc::new(RateLimiter::new(1));
        assert!(limiter.acquire(Duration::ZERO).await);

        let waiter = {
            let limiter = limiter.clone();
            tokio::spawn(async move { limiter.acquire(Duration::from_secs(30)).await })
        };

        tokio::task::yield_now().await;
        limiter.close();

        assert!(!waiter.await.unwrap());
        assert!(!limiter.acquire(Duration::from_secs(30)).await);
    }
}

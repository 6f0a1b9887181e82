//! Process-wide upstream budget: an in-flight ceiling plus a token bucket
//! enforcing minimum spacing between request starts.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tracing::trace;

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

impl Bucket {
    /// Takes one token, going into debt if none is left, and returns how long
    /// the caller must wait before its slot opens.
    fn reserve(&mut self, now: Instant, interval: Duration, burst: f64) -> Duration {
        if !interval.is_zero() {
            let refill = now.duration_since(self.last_refill).as_secs_f64() / interval.as_secs_f64();
            self.tokens = (self.tokens + refill).min(burst);
        } else {
            self.tokens = burst;
        }
        self.last_refill = now;
        self.tokens -= 1.0;

        if self.tokens >= 0.0 {
            Duration::ZERO
        } else {
            interval.mul_f64(-self.tokens)
        }
    }
}

/// Shared across all workers. Waiters on both the semaphore and the bucket
/// are served in FIFO order, so no worker starves.
pub struct RateBudget {
    in_flight: Arc<Semaphore>,
    bucket: Mutex<Bucket>,
    interval: Duration,
    burst: f64,
}

/// Held for the duration of one upstream request.
pub struct BudgetPermit {
    _permit: OwnedSemaphorePermit,
}

impl RateBudget {
    /// `requests_per_second` must be positive; `burst` is clamped to at least 1.
    pub fn new(max_in_flight: usize, requests_per_second: f64, burst: u32) -> Self {
        let burst = f64::from(burst.max(1));
        let interval = if requests_per_second.is_finite() && requests_per_second > 0.0 {
            Duration::from_secs_f64(1.0 / requests_per_second)
        } else {
            Duration::ZERO
        };
        Self {
            in_flight: Arc::new(Semaphore::new(max_in_flight.max(1))),
            bucket: Mutex::new(Bucket {
                tokens: burst,
                last_refill: Instant::now(),
            }),
            interval,
            burst,
        }
    }

    /// Waits for an in-flight slot, then for the next rate slot.
    pub async fn acquire(&self) -> BudgetPermit {
        let permit = self
            .in_flight
            .clone()
            .acquire_owned()
            .await
            .expect("rate budget semaphore is never closed");

        let wait = {
            let mut bucket = self.bucket.lock().await;
            bucket.reserve(Instant::now(), self.interval, self.burst)
        };
        if !wait.is_zero() {
            trace!(wait_ms = wait.as_millis() as u64, "Waiting for rate slot");
            tokio::time::sleep(wait).await;
        }

        BudgetPermit { _permit: permit }
    }

    pub fn available_slots(&self) -> usize {
        self.in_flight.available_permits()
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }
}

//! Shared budget for outbound classifier calls.
//!
//! Two limits apply at once: at most `max_concurrent` calls in flight, and at
//! most `max_per_second` calls started in any trailing one-second window.
//! Concurrency is a counting semaphore; the window is a FIFO of start
//! timestamps guarded by a mutex that is never held across a sleep or a call.

use metrics::counter;
use rand::Rng;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;

use crate::config::RateLimitConfig;

const WINDOW: Duration = Duration::from_secs(1);

pub struct RateLimiter {
    slots: Arc<Semaphore>,
    window: Mutex<VecDeque<Instant>>,
    max_concurrent: usize,
    max_per_second: usize,
    min_jitter: Duration,
    max_jitter: Duration,
}

/// A reserved concurrency slot. Dropping it releases the slot, so every exit
/// path of the guarded call gives the slot back exactly once.
#[derive(Debug)]
pub struct RatePermit {
    _slot: OwnedSemaphorePermit,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        let max_concurrent = config.max_concurrent.max(1);
        let max_per_second = config.max_per_second.max(1);
        Self {
            slots: Arc::new(Semaphore::new(max_concurrent)),
            window: Mutex::new(VecDeque::with_capacity(max_per_second)),
            max_concurrent,
            max_per_second,
            min_jitter: config.min_jitter.min(config.max_jitter),
            max_jitter: config.max_jitter,
        }
    }

    /// Wait until both a concurrency slot and a slot in the per-second window
    /// are available, then reserve them. Never fails.
    pub async fn acquire(&self) -> RatePermit {
        let slot = Arc::clone(&self.slots)
            .acquire_owned()
            .await
            .expect("rate limiter semaphore is never closed");
        self.reserve_window_slot().await;
        RatePermit { _slot: slot }
    }

    /// Calls currently holding a concurrency slot.
    pub fn active_count(&self) -> usize {
        self.max_concurrent - self.slots.available_permits()
    }

    async fn reserve_window_slot(&self) {
        loop {
            let wait = {
                let mut window = self.window.lock().await;
                let now = Instant::now();
                while window
                    .front()
                    .is_some_and(|&oldest| now.duration_since(oldest) >= WINDOW)
                {
                    window.pop_front();
                }

                match window.front() {
                    Some(&oldest) if window.len() >= self.max_per_second => {
                        WINDOW - now.duration_since(oldest)
                    }
                    _ => {
                        window.push_back(now);
                        return;
                    }
                }
            };

            let sleep_for = wait + self.jitter();
            counter!("rate_limiter_window_waits_total").increment(1);
            tracing::debug!(
                sleep_ms = sleep_for.as_millis() as u64,
                "Rate window full, waiting"
            );
            tokio::time::sleep(sleep_for).await;
        }
    }

    fn jitter(&self) -> Duration {
        if self.max_jitter.is_zero() {
            return Duration::ZERO;
        }
        let min = self.min_jitter.as_millis() as u64;
        let max = self.max_jitter.as_millis() as u64;
        Duration::from_millis(rand::thread_rng().gen_range(min..=max))
    }
}

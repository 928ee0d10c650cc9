//! Process-wide request pacing
//!
//! Request starts are spaced by `60 / requests_per_minute` seconds so any
//! rolling 60-second window holds at most the configured budget. A
//! semaphore bounds how many requests are in flight at once. Both limits are
//! shared by every clone of the limiter.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;

use crate::error::{Result, SyncError};

#[derive(Clone)]
pub struct RateLimiter {
    interval: Duration,
    next_slot: Arc<Mutex<Instant>>,
    permits: Arc<Semaphore>,
}

impl RateLimiter {
    pub fn new(requests_per_minute: u32, max_concurrency: usize) -> Self {
        Self {
            interval: Duration::from_secs_f64(60.0 / f64::from(requests_per_minute.max(1))),
            next_slot: Arc::new(Mutex::new(Instant::now())),
            permits: Arc::new(Semaphore::new(max_concurrency.max(1))),
        }
    }

    /// Wait for a concurrency permit and then for the next free start slot.
    ///
    /// Hold the returned permit until the request has completed.
    pub async fn acquire(&self) -> Result<OwnedSemaphorePermit> {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| SyncError::InvalidState("rate limiter closed".into()))?;

        let start = {
            let mut next = self.next_slot.lock().await;
            let start = (*next).max(Instant::now());
            *next = start + self.interval;
            start
        };
        tokio::time::sleep_until(start).await;
        Ok(permit)
    }

    /// Push the next free slot back, used after the marketplace answered 429
    pub async fn penalize(&self, wait: Duration) {
        let mut next = self.next_slot.lock().await;
        let earliest = Instant::now() + wait;
        if *next < earliest {
            *next = earliest;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test(start_paused = true)]
    async fn no_window_exceeds_budget() {
        let limiter = RateLimiter::new(60, 100);
        let origin = Instant::now();
        let mut starts = Vec::new();

        for _ in 0..150 {
            let _permit = limiter.acquire().await.unwrap();
            starts.push(Instant::now() - origin);
        }

        for (i, start) in starts.iter().enumerate() {
            let in_window = starts[i..]
                .iter()
                .take_while(|s| **s < *start + Duration::from_secs(60))
                .count();
            assert!(in_window <= 60, "window at {:?} holds {}", start, in_window);
        }
        assert_eq!(starts[1] - starts[0], Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_callers_share_the_budget() {
        let limiter = RateLimiter::new(120, 4);
        let origin = Instant::now();

        let handles: Vec<_> = (0..20)
            .map(|_| {
                let limiter = limiter.clone();
                tokio::spawn(async move {
                    let _permit = limiter.acquire().await.unwrap();
                    Instant::now() - origin
                })
            })
            .collect();

        let mut starts = Vec::new();
        for handle in handles {
            starts.push(handle.await.unwrap());
        }
        starts.sort();
        for pair in starts.windows(2) {
            assert!(pair[1] - pair[0] >= Duration::from_millis(500));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn in_flight_requests_are_bounded() {
        let limiter = RateLimiter::new(6000, 2);
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..10)
            .map(|_| {
                let limiter = limiter.clone();
                let active = active.clone();
                let peak = peak.clone();
                tokio::spawn(async move {
                    let _permit = limiter.acquire().await.unwrap();
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(peak.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn penalize_delays_next_request() {
        let limiter = RateLimiter::new(600, 1);
        let origin = Instant::now();
        drop(limiter.acquire().await.unwrap());
        limiter.penalize(Duration::from_secs(5)).await;
        drop(limiter.acquire().await.unwrap());
        assert!(Instant::now() - origin >= Duration::from_secs(5));
    }
}

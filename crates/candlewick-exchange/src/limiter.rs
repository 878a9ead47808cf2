//! Weighted per-second rate limiter.
//!
//! The limiter is a token bucket holding `capacity` weight that refills to
//! full once per second. A call is admitted while the reservoir covers its
//! weight and the weight of calls still in flight stays within capacity.
//! When the venue reports that the limit was exceeded, every call is paused
//! until the venue's retry-after instant and the failed call is retried once.

use chrono::Utc;
use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{Notify, broadcast};
use tokio::time::Instant;
use tracing::{debug, warn};

const REFILL_INTERVAL: Duration = Duration::from_secs(1);

/// Venue signal that the rate limit was exceeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitSignal {
    /// How long the venue asks callers to wait.
    pub retry_after: Duration,
}

/// Error returned by a limited call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallError<E> {
    /// The venue rejected the call for exceeding its rate limit.
    RateLimited(RateLimitSignal),
    /// Any other failure.
    Failed(E),
}

/// Emitted when the venue signals that the rate limit was exceeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitExceeded {
    /// Wall-clock instant (UTC milliseconds) until which calls are paused.
    pub wait_until: i64,
    /// Length of the pause.
    pub wait_time: Duration,
}

#[derive(Debug)]
struct Bucket {
    capacity: u32,
    reservoir: u32,
    in_flight: u32,
    refill_at: Instant,
    paused_until: Option<Instant>,
}

impl Bucket {
    fn refill(&mut self, now: Instant) {
        if now < self.refill_at {
            return;
        }
        self.reservoir = self.capacity;
        while self.refill_at <= now {
            self.refill_at += REFILL_INTERVAL;
        }
    }

    const fn try_take(&mut self, weight: u32) -> bool {
        if self.reservoir >= weight && self.in_flight + weight <= self.capacity {
            self.reservoir -= weight;
            self.in_flight += weight;
            true
        } else {
            false
        }
    }
}

/// Weighted token-bucket rate limiter shared by all calls to one venue.
#[derive(Debug)]
pub struct RateLimiter {
    bucket: Mutex<Bucket>,
    released: Notify,
    events: broadcast::Sender<RateLimitExceeded>,
}

struct Permit<'a> {
    limiter: &'a RateLimiter,
    weight: u32,
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        {
            let mut bucket = self.limiter.bucket();
            bucket.in_flight = bucket.in_flight.saturating_sub(self.weight);
        }
        self.limiter.released.notify_waiters();
    }
}

impl RateLimiter {
    /// Creates a limiter admitting `weight_per_second` weight per second.
    /// A capacity of zero is raised to one.
    #[must_use]
    pub fn new(weight_per_second: u32) -> Self {
        let capacity = weight_per_second.max(1);
        let (events, _) = broadcast::channel(16);
        Self {
            bucket: Mutex::new(Bucket {
                capacity,
                reservoir: capacity,
                in_flight: 0,
                refill_at: Instant::now() + REFILL_INTERVAL,
                paused_until: None,
            }),
            released: Notify::new(),
            events,
        }
    }

    /// Returns the per-second capacity.
    #[must_use]
    pub fn capacity(&self) -> u32 {
        self.bucket().capacity
    }

    /// Subscribes to rate-limit notifications.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<RateLimitExceeded> {
        self.events.subscribe()
    }

    /// Returns the instant calls are paused until, if a pause is active.
    #[must_use]
    pub fn paused_until(&self) -> Option<Instant> {
        self.bucket().paused_until.filter(|until| *until > Instant::now())
    }

    /// Runs `f` once admitted for `weight`.
    ///
    /// Weights above capacity are clamped to capacity. If `f` fails with
    /// [`CallError::RateLimited`], all calls are paused for the signalled
    /// duration and `f` is retried exactly once.
    ///
    /// # Errors
    ///
    /// Returns the error of `f`, or the error of the retry.
    pub async fn call<T, E, F, Fut>(&self, weight: u32, mut f: F) -> Result<T, CallError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, CallError<E>>>,
    {
        let first = {
            let _permit = self.acquire(weight).await;
            f().await
        };

        match first {
            Err(CallError::RateLimited(signal)) => {
                self.pause(signal.retry_after);
                let _permit = self.acquire(weight).await;
                f().await
            }
            outcome => outcome,
        }
    }

    async fn acquire(&self, weight: u32) -> Permit<'_> {
        loop {
            let released = self.released.notified();

            let deadline = {
                let mut bucket = self.bucket();
                let weight = weight.min(bucket.capacity);
                let now = Instant::now();

                match bucket.paused_until {
                    Some(until) if until > now => Some(until),
                    _ => {
                        bucket.paused_until = None;
                        bucket.refill(now);
                        if bucket.try_take(weight) {
                            return Permit { limiter: self, weight };
                        }
                        (bucket.reservoir < weight).then_some(bucket.refill_at)
                    }
                }
            };

            match deadline {
                Some(deadline) => {
                    tokio::select! {
                        () = tokio::time::sleep_until(deadline) => {}
                        () = released => {}
                    }
                }
                None => released.await,
            }
        }
    }

    fn pause(&self, wait_time: Duration) {
        let until = Instant::now() + wait_time;
        {
            let mut bucket = self.bucket();
            bucket.paused_until = Some(bucket.paused_until.map_or(until, |current| current.max(until)));
        }

        let wait_until = Utc::now().timestamp_millis() + i64::try_from(wait_time.as_millis()).unwrap_or(i64::MAX);
        warn!(wait_ms = wait_time.as_millis() as u64, wait_until, "rate limit exceeded, pausing calls");

        if self.events.send(RateLimitExceeded { wait_until, wait_time }).is_err() {
            debug!("no rate limit subscribers");
        }
    }

    fn bucket(&self) -> MutexGuard<'_, Bucket> {
        self.bucket.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    async fn ok(limiter: &RateLimiter, weight: u32) {
        limiter.call(weight, || async { Ok::<_, CallError<()>>(()) }).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_eleventh_call_waits_for_refill() {
        let limiter = RateLimiter::new(10);
        let start = Instant::now();

        for _ in 0..10 {
            ok(&limiter, 1).await;
        }
        assert_eq!(start.elapsed(), Duration::ZERO);

        ok(&limiter, 1).await;
        let waited = start.elapsed();
        assert!(waited >= Duration::from_millis(990) && waited <= Duration::from_millis(1010), "{waited:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_weight_is_clamped_to_capacity() {
        let limiter = RateLimiter::new(10);
        let start = Instant::now();
        ok(&limiter, 50).await;
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_in_flight_weight_is_bounded() {
        let limiter = Arc::new(RateLimiter::new(2));
        let start = Instant::now();

        let long = {
            let limiter = Arc::clone(&limiter);
            tokio::spawn(async move {
                limiter
                    .call(2, || async {
                        tokio::time::sleep(Duration::from_secs(3)).await;
                        Ok::<_, CallError<()>>(())
                    })
                    .await
            })
        };
        tokio::task::yield_now().await;

        // The reservoir refills after one second, but the first call still
        // holds the whole capacity until it finishes.
        ok(&limiter, 1).await;
        assert!(start.elapsed() >= Duration::from_secs(3));
        long.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_after_pauses_all_calls() {
        let limiter = Arc::new(RateLimiter::new(10));
        let mut events = limiter.subscribe();
        let attempts = Arc::new(AtomicU32::new(0));
        let start = Instant::now();

        let limited = {
            let limiter = Arc::clone(&limiter);
            let attempts = Arc::clone(&attempts);
            tokio::spawn(async move {
                limiter
                    .call(1, || {
                        let attempt = attempts.fetch_add(1, Ordering::SeqCst);
                        async move {
                            if attempt == 0 {
                                Err(CallError::RateLimited(RateLimitSignal { retry_after: Duration::from_millis(2000) }))
                            } else {
                                Ok::<_, CallError<()>>(Instant::now())
                            }
                        }
                    })
                    .await
            })
        };

        let event = events.recv().await.unwrap();
        assert_eq!(event.wait_time, Duration::from_millis(2000));
        assert!(limiter.paused_until().is_some());

        // An unrelated call issued during the pause waits for it to end.
        ok(&limiter, 1).await;
        assert!(start.elapsed() >= Duration::from_millis(2000));

        let retried_at = limited.await.unwrap().unwrap();
        assert!(retried_at - start >= Duration::from_millis(2000));
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_rate_limit_is_returned() {
        let limiter = RateLimiter::new(10);
        let attempts = AtomicU32::new(0);

        let result = limiter
            .call(1, || {
                attempts.fetch_add(1, Ordering::SeqCst);
                async {
                    Err::<(), _>(CallError::<()>::RateLimited(RateLimitSignal {
                        retry_after: Duration::from_millis(500),
                    }))
                }
            })
            .await;

        assert!(matches!(result, Err(CallError::RateLimited(_))));
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_other_errors_are_not_retried() {
        let limiter = RateLimiter::new(10);
        let attempts = AtomicU32::new(0);

        let result = limiter
            .call(1, || {
                attempts.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(CallError::Failed("boom")) }
            })
            .await;

        assert_eq!(result, Err(CallError::Failed("boom")));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }
}

//! Fixed-interval leaky bucket used to pace requests to a single backend.
//!
//! Admissions are spaced `60s / max_requests_per_minute` apart. Each call to
//! [`RateLimiter::acquire`] reserves the next free slot under a short lock and
//! then sleeps outside the lock until that slot comes due, so waiting callers
//! never block each other. Ordering follows lock acquisition, which is close
//! to but not strictly arrival order.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use core_types::{GatewayError, GatewayResult};
use parking_lot::Mutex;
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::debug;

const WINDOW: Duration = Duration::from_secs(60);

/// A granted permit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Admission {
    /// Instant the permit was scheduled for.
    pub scheduled: Instant,
    /// Time spent suspended before admission.
    pub waited: Duration,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RateLimiterStats {
    pub admitted: u64,
    pub cancelled: u64,
    pub total_wait: Duration,
}

#[derive(Debug)]
pub struct RateLimiter {
    max_requests_per_minute: u32,
    interval: Duration,
    next_permit: Mutex<Instant>,
    admitted: AtomicU64,
    cancelled: AtomicU64,
    total_wait_ms: AtomicU64,
}

impl RateLimiter {
    pub fn new(max_requests_per_minute: u32) -> GatewayResult<Self> {
        if max_requests_per_minute == 0 {
            return Err(GatewayError::InvalidConfiguration(
                "max_requests_per_minute must be greater than zero".to_string(),
            ));
        }

        Ok(Self {
            max_requests_per_minute,
            interval: WINDOW / max_requests_per_minute,
            next_permit: Mutex::new(Instant::now()),
            admitted: AtomicU64::new(0),
            cancelled: AtomicU64::new(0),
            total_wait_ms: AtomicU64::new(0),
        })
    }

    /// Builds a limiter from a signed configuration value, rejecting anything
    /// that is not a positive `u32`.
    pub fn from_config_value(max_requests_per_minute: i64) -> GatewayResult<Self> {
        let value = u32::try_from(max_requests_per_minute).map_err(|_| {
            GatewayError::InvalidConfiguration(format!(
                "max_requests_per_minute must be in 1..={}, got {max_requests_per_minute}",
                u32::MAX
            ))
        })?;
        Self::new(value)
    }

    pub fn max_requests_per_minute(&self) -> u32 {
        self.max_requests_per_minute
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Waits for the next permit.
    ///
    /// Fails with [`GatewayError::Cancelled`] if `cancellation` fires before
    /// the permit comes due. A slot reserved by a cancelled caller is not
    /// handed back.
    pub async fn acquire(&self, cancellation: &CancellationToken) -> GatewayResult<Admission> {
        if cancellation.is_cancelled() {
            self.cancelled.fetch_add(1, Ordering::Relaxed);
            return Err(GatewayError::Cancelled);
        }

        let now = Instant::now();
        let scheduled = self.reserve(now);

        if scheduled <= now {
            self.admitted.fetch_add(1, Ordering::Relaxed);
            return Ok(Admission {
                scheduled,
                waited: Duration::ZERO,
            });
        }

        let wait = scheduled - now;
        debug!(
            wait_ms = wait.as_millis() as u64,
            interval_ms = self.interval.as_millis() as u64,
            "waiting for rate limit permit"
        );

        tokio::select! {
            biased;
            _ = cancellation.cancelled() => {
                self.cancelled.fetch_add(1, Ordering::Relaxed);
                debug!("rate limit wait cancelled");
                Err(GatewayError::Cancelled)
            }
            _ = sleep_until(scheduled) => {
                self.admitted.fetch_add(1, Ordering::Relaxed);
                self.total_wait_ms
                    .fetch_add(wait.as_millis() as u64, Ordering::Relaxed);
                Ok(Admission {
                    scheduled,
                    waited: wait,
                })
            }
        }
    }

    pub fn stats(&self) -> RateLimiterStats {
        RateLimiterStats {
            admitted: self.admitted.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
            total_wait: Duration::from_millis(self.total_wait_ms.load(Ordering::Relaxed)),
        }
    }

    fn reserve(&self, now: Instant) -> Instant {
        let mut next_permit = self.next_permit.lock();
        let scheduled = (*next_permit).max(now);
        *next_permit = scheduled + self.interval;
        scheduled
    }
}

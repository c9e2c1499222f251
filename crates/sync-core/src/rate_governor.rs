use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rand::Rng;

const BASE_BACKOFF_SECS: u64 = 1;
const MAX_BACKOFF_SECS: u64 = 60;

/// Per-resource token-bucket-style limiter plus a global monotonic backoff
/// clock (§4.2). `backoff_until` is stored as a Unix-millis `AtomicI64` so
/// reads never block a writer mid-update, matching §5's "atomic reads".
pub struct RateGovernor {
    backoff_until_ms: AtomicI64,
    consecutive_throttles: AtomicI64,
}

impl RateGovernor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            backoff_until_ms: AtomicI64::new(0),
            consecutive_throttles: AtomicI64::new(0),
        })
    }

    /// Non-blocking: `true` if a planner-mutating call may proceed right
    /// now. Callers that get `false` must re-queue rather than wait inline
    /// (§4.2) — the batch processor halts draining instead of sleeping.
    pub fn acquire(&self) -> bool {
        Utc::now().timestamp_millis() >= self.backoff_until_ms.load(Ordering::Acquire)
    }

    pub fn backoff_until(&self) -> Option<DateTime<Utc>> {
        let ms = self.backoff_until_ms.load(Ordering::Acquire);
        if ms <= 0 {
            None
        } else {
            DateTime::from_timestamp_millis(ms)
        }
    }

    /// Feed back the outcome of a planner HTTP call. `retry_after` is the
    /// `Retry-After` header value, when present, on a 429/503.
    pub fn report_result(&self, throttled: bool, retry_after: Option<std::time::Duration>) {
        if !throttled {
            self.consecutive_throttles.store(0, Ordering::Release);
            return;
        }

        let delay = match retry_after {
            Some(retry_after) => {
                let jitter_ceiling = (retry_after.as_secs_f64() * 0.5).max(0.0);
                let jitter = rand::thread_rng().gen_range(0.0..=jitter_ceiling.max(0.001));
                retry_after.as_secs_f64() + jitter
            }
            None => {
                let n = self.consecutive_throttles.fetch_add(1, Ordering::AcqRel) + 1;
                let base = (BASE_BACKOFF_SECS * 2u64.saturating_pow(n as u32)).min(MAX_BACKOFF_SECS);
                let jitter = rand::thread_rng().gen_range(0.0..=base as f64);
                (base as f64 + jitter).min(MAX_BACKOFF_SECS as f64 * 2.0)
            }
        };

        let new_deadline = Utc::now() + chrono::Duration::milliseconds((delay * 1000.0) as i64);
        let new_ms = new_deadline.timestamp_millis();
        // Never move the deadline backwards if a concurrent report already
        // pushed it further out.
        let mut current = self.backoff_until_ms.load(Ordering::Acquire);
        while new_ms > current {
            match self.backoff_until_ms.compare_exchange_weak(
                current,
                new_ms,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(observed) => current = observed,
            }
        }
    }
}

impl Default for RateGovernor {
    fn default() -> Self {
        Self {
            backoff_until_ms: AtomicI64::new(0),
            consecutive_throttles: AtomicI64::new(0),
        }
    }
}

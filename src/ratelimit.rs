//! Rate limited logging.
//!
//! Each call site of the `ratelimit!` macro owns a static token bucket which holds up to `burst`
//! tokens and refills at `burst` tokens per `interval`. An event which finds the bucket empty is
//! suppressed; the next event which gets through reports how many were suppressed in between.

use std::sync::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug)]
struct Bucket {
    /// Available tokens, scaled by `interval` nanos to keep refill arithmetic in integers.
    available: u128,
    last_refill: Instant,
    suppressed: u64,
}

/// A token bucket guarding one log site.
#[derive(Debug)]
pub struct RateLimiter {
    interval: Duration,
    burst: u32,
    state: Mutex<Option<Bucket>>,
}

impl RateLimiter {
    pub const fn new(interval: Duration, burst: u32) -> Self {
        Self {
            interval,
            burst,
            state: Mutex::new(None),
        }
    }

    /// Take a token, returning the number of events suppressed since the last allowed one, or
    /// `None` if this event is to be suppressed.
    pub fn check(&self) -> Option<u64> {
        self.check_at(Instant::now())
    }

    pub fn check_at(&self, now: Instant) -> Option<u64> {
        if self.burst == 0 {
            return None;
        }
        let scale = self.interval.as_nanos().max(1);
        let capacity = u128::from(self.burst) * scale;
        let mut state = match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        let bucket = state.get_or_insert_with(|| Bucket {
            available: capacity,
            last_refill: now,
            suppressed: 0,
        });

        if now > bucket.last_refill {
            let elapsed = now.duration_since(bucket.last_refill).as_nanos();
            let added = elapsed.saturating_mul(u128::from(self.burst));
            bucket.available = bucket.available.saturating_add(added).min(capacity);
            bucket.last_refill = now;
        }

        if bucket.available >= scale {
            bucket.available -= scale;
            Some(std::mem::take(&mut bucket.suppressed))
        } else {
            bucket.suppressed += 1;
            None
        }
    }
}

/// Emit a `tracing` event at the given level, rate limited per call site.
///
/// ```ignore
/// ratelimit!(info, Duration::from_secs(1), 10, error = ?err, "failed to send STORED");
/// ```
#[macro_export]
macro_rules! ratelimit {
    ($level:ident, $interval:expr, $burst:expr, $($arg:tt)+) => {{
        static LIMITER: $crate::ratelimit::RateLimiter = $crate::ratelimit::RateLimiter::new($interval, $burst);
        if let Some(suppressed) = LIMITER.check() {
            ::tracing::$level!(suppressed = suppressed, $($arg)+);
        }
    }};
}

//! Per-tenant token bucket rate limiting.

use std::sync::Arc;

use data_types::TenantId;
use hashbrown::HashMap;
use tracedb_time::{Time, TimeProvider};

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Time,
}

/// Token bucket per tenant: `rate` tokens (bytes) accrue per second up to
/// `burst`; a push consumes its byte size or is rejected whole.
#[derive(Debug)]
pub(crate) struct TenantLimiter {
    rate: f64,
    burst: f64,
    time: Arc<dyn TimeProvider>,
    buckets: parking_lot::Mutex<HashMap<TenantId, Bucket>>,
}

impl TenantLimiter {
    pub(crate) fn new(rate: f64, burst: f64, time: Arc<dyn TimeProvider>) -> Self {
        Self {
            rate,
            burst,
            time,
            buckets: Default::default(),
        }
    }

    /// Take `bytes` from the tenant's bucket, reporting whether the budget
    /// allowed it. Rejected requests consume nothing.
    pub(crate) fn try_consume(&self, tenant: &TenantId, bytes: usize) -> bool {
        let now = self.time.now();
        let mut buckets = self.buckets.lock();
        let bucket = buckets.entry(tenant.clone()).or_insert(Bucket {
            tokens: self.burst,
            last_refill: now,
        });

        if now > bucket.last_refill {
            let elapsed = now.absolute_difference(bucket.last_refill).as_secs_f64();
            bucket.tokens = (bucket.tokens + elapsed * self.rate).min(self.burst);
        }
        bucket.last_refill = now;

        let want = bytes as f64;
        if bucket.tokens >= want {
            bucket.tokens -= want;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tracedb_time::MockProvider;

    fn tenant(name: &str) -> TenantId {
        TenantId::new(name).unwrap()
    }

    #[test]
    fn burst_then_refill() {
        let time = Arc::new(MockProvider::new(Time::from_timestamp_millis(0)));
        let limiter = TenantLimiter::new(100., 200., Arc::clone(&time) as _);
        let t = tenant("a");

        // Full burst available up front.
        assert!(limiter.try_consume(&t, 200));
        assert!(!limiter.try_consume(&t, 1));

        // Half a second refills 50 tokens.
        time.inc(Duration::from_millis(500));
        assert!(limiter.try_consume(&t, 50));
        assert!(!limiter.try_consume(&t, 1));
    }

    #[test]
    fn tenants_do_not_share_buckets() {
        let time = Arc::new(MockProvider::new(Time::from_timestamp_millis(0)));
        let limiter = TenantLimiter::new(100., 100., Arc::clone(&time) as _);

        assert!(limiter.try_consume(&tenant("a"), 100));
        assert!(limiter.try_consume(&tenant("b"), 100));
        assert!(!limiter.try_consume(&tenant("a"), 1));
    }
}

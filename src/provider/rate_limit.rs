//! Per-provider call pacing and daily-quota enforcement.
//!
//! Each provider gets a bucket holding its minimum inter-call gap and a
//! daily counter that resets at local midnight. `acquire` never blocks and
//! never holds the lock across a network call: it either grants the call,
//! tells the caller how long to sleep, or reports the quota spent.

use chrono::{Local, NaiveDate};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Outcome of asking to make one call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permit {
    /// Proceed now; the call has been counted.
    Ready,
    /// Too soon after the previous call; retry after the given gap.
    RetryAfter(Duration),
    /// The provider's daily quota is spent until local midnight.
    QuotaExhausted,
}

#[derive(Debug)]
struct Bucket {
    min_interval: Duration,
    daily_quota: Option<u32>,
    last_call: Option<Instant>,
    used_today: u32,
    day: NaiveDate,
}

impl Bucket {
    fn new(min_interval: Duration, daily_quota: Option<u32>) -> Self {
        Self {
            min_interval,
            daily_quota,
            last_call: None,
            used_today: 0,
            day: Local::now().date_naive(),
        }
    }

    fn acquire(&mut self, today: NaiveDate) -> Permit {
        if self.day != today {
            self.day = today;
            self.used_today = 0;
        }
        if let Some(quota) = self.daily_quota
            && self.used_today >= quota
        {
            return Permit::QuotaExhausted;
        }
        if let Some(last) = self.last_call {
            let elapsed = last.elapsed();
            if elapsed < self.min_interval {
                return Permit::RetryAfter(self.min_interval - elapsed);
            }
        }
        self.last_call = Some(Instant::now());
        self.used_today += 1;
        Permit::Ready
    }
}

/// Shared limiter; one bucket per provider name.
#[derive(Default)]
pub struct RateLimiter {
    buckets: Mutex<HashMap<String, Bucket>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install (or replace) the bucket for one provider.
    pub fn configure(&self, name: &str, min_interval: Duration, daily_quota: Option<u32>) {
        let mut buckets = self.buckets.lock().expect("limiter lock poisoned");
        buckets.insert(name.to_string(), Bucket::new(min_interval, daily_quota));
    }

    /// Ask to make one call. On [`Permit::Ready`] the call is counted
    /// against both pacing and quota; other outcomes leave state untouched.
    /// Unknown names are unthrottled.
    pub fn acquire(&self, name: &str) -> Permit {
        let today = Local::now().date_naive();
        let mut buckets = self.buckets.lock().expect("limiter lock poisoned");
        match buckets.get_mut(name) {
            Some(bucket) => bucket.acquire(today),
            None => Permit::Ready,
        }
    }

    /// Remaining quota for one provider today, if it has one.
    pub fn remaining_today(&self, name: &str) -> Option<u32> {
        let buckets = self.buckets.lock().expect("limiter lock poisoned");
        let bucket = buckets.get(name)?;
        bucket.daily_quota.map(|q| q.saturating_sub(bucket.used_today))
    }
}

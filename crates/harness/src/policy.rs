//! Expected two-tier admission policy of the system under test.
//!
//! The harness never enforces these limits against real traffic. The model is
//! used to derive expectations for the oracle and to back the simulated
//! gateway used in offline rehearsals and tests.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::time::Instant;

use crate::error::{HarnessError, Result};

/// Per-key token bucket plus global sliding window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitPolicy {
    /// Per-key bucket capacity `C`.
    pub bucket_capacity: u32,
    /// Per-key refill rate `R`, tokens per second.
    pub refill_per_sec: u32,
    /// Global accepted-request limit `G` per window.
    pub global_limit: u32,
    /// Global window length `W`, seconds.
    pub global_window_secs: u64,
    /// Allowed slack when comparing observed counts to the model.
    pub tolerance: u32,
}

impl Default for RateLimitPolicy {
    fn default() -> Self {
        Self {
            bucket_capacity: 100,
            refill_per_sec: 10,
            global_limit: 10_000,
            global_window_secs: 60,
            tolerance: 10,
        }
    }
}

impl RateLimitPolicy {
    pub fn validate(&self) -> Result<()> {
        if self.bucket_capacity == 0 {
            return Err(HarnessError::InvalidPolicy("bucket_capacity must be > 0".into()));
        }
        if self.refill_per_sec == 0 {
            return Err(HarnessError::InvalidPolicy("refill_per_sec must be > 0".into()));
        }
        if self.global_limit == 0 {
            return Err(HarnessError::InvalidPolicy("global_limit must be > 0".into()));
        }
        if self.global_window_secs == 0 {
            return Err(HarnessError::InvalidPolicy("global_window_secs must be > 0".into()));
        }
        Ok(())
    }

    pub fn global_window(&self) -> Duration {
        Duration::from_secs(self.global_window_secs)
    }
}

const MICROS_PER_SECOND: u128 = 1_000_000;

/// Token bucket using integer-only math; tokens are scaled by one million so
/// partial refills survive between calls.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    refill_per_sec: u64,
    capacity: u64,
    tokens: u128,
    last_refill: Instant,
}

impl TokenBucket {
    /// A full bucket.
    pub fn new(capacity: u64, refill_per_sec: u64, now: Instant) -> Self {
        Self {
            refill_per_sec,
            capacity,
            tokens: (capacity as u128) * MICROS_PER_SECOND,
            last_refill: now,
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed_micros = now.saturating_duration_since(self.last_refill).as_micros();
        if elapsed_micros == 0 {
            return;
        }

        // tps * elapsed_micros is already in micro-token scale
        let tokens_to_add = (self.refill_per_sec as u128) * elapsed_micros;
        let max_tokens = (self.capacity as u128) * MICROS_PER_SECOND;
        self.tokens = self.tokens.saturating_add(tokens_to_add).min(max_tokens);
        self.last_refill = now;
    }

    pub fn try_acquire(&mut self, now: Instant) -> bool {
        self.refill(now);
        if self.tokens >= MICROS_PER_SECOND {
            self.tokens -= MICROS_PER_SECOND;
            true
        } else {
            false
        }
    }

    /// Whole tokens currently available.
    pub fn available(&mut self, now: Instant) -> u64 {
        self.refill(now);
        (self.tokens / MICROS_PER_SECOND) as u64
    }
}

/// Exact sliding log: at most `limit` admissions in any trailing `window`.
#[derive(Debug, Clone)]
pub struct SlidingWindow {
    limit: usize,
    window: Duration,
    admitted: VecDeque<Instant>,
}

impl SlidingWindow {
    pub fn new(limit: usize, window: Duration) -> Self {
        Self {
            limit,
            window,
            admitted: VecDeque::new(),
        }
    }

    fn evict(&mut self, now: Instant) {
        while let Some(front) = self.admitted.front() {
            if now.saturating_duration_since(*front) >= self.window {
                self.admitted.pop_front();
            } else {
                break;
            }
        }
    }

    pub fn has_capacity(&mut self, now: Instant) -> bool {
        self.evict(now);
        self.admitted.len() < self.limit
    }

    pub fn record(&mut self, now: Instant) {
        self.admitted.push_back(now);
    }

    pub fn in_window(&mut self, now: Instant) -> usize {
        self.evict(now);
        self.admitted.len()
    }
}

/// Which tier rejected a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Admission {
    Accepted,
    RejectedGlobal,
    RejectedKey,
}

impl Admission {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Admission::Accepted)
    }
}

/// Executable version of [`RateLimitPolicy`]: global window checked first,
/// then the caller's bucket.
#[derive(Debug)]
pub struct PolicyModel {
    policy: RateLimitPolicy,
    buckets: HashMap<String, TokenBucket>,
    global: SlidingWindow,
}

impl PolicyModel {
    pub fn new(policy: RateLimitPolicy) -> Self {
        let global = SlidingWindow::new(policy.global_limit as usize, policy.global_window());
        Self {
            policy,
            buckets: HashMap::new(),
            global,
        }
    }

    pub fn policy(&self) -> &RateLimitPolicy {
        &self.policy
    }

    pub fn admit(&mut self, key: &str, now: Instant) -> Admission {
        if !self.global.has_capacity(now) {
            return Admission::RejectedGlobal;
        }

        let capacity = self.policy.bucket_capacity as u64;
        let refill = self.policy.refill_per_sec as u64;
        let bucket = self
            .buckets
            .entry(key.to_string())
            .or_insert_with(|| TokenBucket::new(capacity, refill, now));

        if !bucket.try_acquire(now) {
            return Admission::RejectedKey;
        }

        self.global.record(now);
        Admission::Accepted
    }

    /// Accepted count for `requests` issued at the given offsets from one key.
    pub fn simulate_single_key(policy: &RateLimitPolicy, offsets: &[Duration]) -> u64 {
        let start = Instant::now();
        let mut model = PolicyModel::new(policy.clone());
        offsets
            .iter()
            .filter(|offset| model.admit("probe", start + **offset).is_accepted())
            .count() as u64
    }
}

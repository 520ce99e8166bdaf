//! Rate-limit oracle.
//!
//! Turns a [`RateLimitPolicy`] into bands of acceptable accepted/rejected
//! counts and checks observed runs against them. Exact equality is never
//! required: requests near the admission boundary can land on either side.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{info, warn};

use crate::aggregate::AggregateReport;
use crate::error::Result;
use crate::outcome::OutcomeClass;
use crate::policy::RateLimitPolicy;

/// Inclusive bands for one check, plus the model's point estimate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Expectation {
    pub requests: u64,
    pub model_accepted: u64,
    pub model_rejected: u64,
    pub accepted_min: u64,
    pub accepted_max: u64,
    pub rejected_min: u64,
    pub rejected_max: u64,
}

impl Expectation {
    fn admits(&self, accepted: u64, rejected: u64) -> bool {
        (self.accepted_min..=self.accepted_max).contains(&accepted)
            && (self.rejected_min..=self.rejected_max).contains(&rejected)
    }
}

/// Pass/fail result of one oracle check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Verdict {
    pub check: String,
    pub passed: bool,
    pub observed_accepted: u64,
    pub observed_rejected: u64,
    pub expected: Expectation,
    /// Observed minus model, accepted.
    pub accepted_delta: i64,
    /// Observed minus model, rejected.
    pub rejected_delta: i64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub notes: Vec<String>,
}

impl Verdict {
    fn new(check: &str, expected: Expectation, accepted: u64, rejected: u64) -> Self {
        Self {
            check: check.to_string(),
            passed: expected.admits(accepted, rejected),
            observed_accepted: accepted,
            observed_rejected: rejected,
            expected,
            accepted_delta: accepted as i64 - expected.model_accepted as i64,
            rejected_delta: rejected as i64 - expected.model_rejected as i64,
            notes: Vec::new(),
        }
    }

    fn note(mut self, note: impl Into<String>) -> Self {
        self.notes.push(note.into());
        self
    }

    fn log(self) -> Self {
        if self.passed {
            info!(
                check = %self.check,
                accepted = self.observed_accepted,
                rejected = self.observed_rejected,
                "rate-limit check passed"
            );
        } else {
            warn!(
                check = %self.check,
                accepted = self.observed_accepted,
                rejected = self.observed_rejected,
                accepted_band = ?(self.expected.accepted_min, self.expected.accepted_max),
                rejected_band = ?(self.expected.rejected_min, self.expected.rejected_max),
                "rate-limit check failed"
            );
        }
        self
    }
}

/// Observations from a bucket-recovery probe against one key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryProbe {
    /// Tokens the key had spent before the probe.
    pub consumed: u64,
    /// Request issued right after exhaustion.
    pub immediate: OutcomeClass,
    #[serde(rename = "waited_ms", with = "crate::report::millis")]
    pub waited: Duration,
    /// Request issued after `waited`.
    pub after_wait: OutcomeClass,
}

#[derive(Debug, Clone)]
pub struct RateLimitOracle {
    policy: RateLimitPolicy,
}

impl RateLimitOracle {
    pub fn new(policy: RateLimitPolicy) -> Result<Self> {
        policy.validate()?;
        Ok(Self { policy })
    }

    pub fn policy(&self) -> &RateLimitPolicy {
        &self.policy
    }

    /// Expected split for `burst` requests from one key issued within
    /// `spread`.
    ///
    /// The bucket hands out `C` tokens up front plus whatever refills during
    /// the burst, so accepted lies in `[min(B, C) - tol, min(B, C + R*d)]`.
    pub fn expect_burst(&self, burst: u64, spread: Duration) -> Expectation {
        let capacity = self.policy.bucket_capacity as u64;
        let tolerance = self.policy.tolerance as u64;
        let refilled = (self.policy.refill_per_sec as u128 * spread.as_micros() / 1_000_000) as u64;

        let model_accepted = burst.min(capacity);
        let accepted_min = model_accepted.saturating_sub(tolerance);
        let accepted_max = burst.min(capacity.saturating_add(refilled));

        Expectation {
            requests: burst,
            model_accepted,
            model_rejected: burst - model_accepted,
            accepted_min,
            accepted_max,
            rejected_min: burst - accepted_max,
            rejected_max: burst - accepted_min,
        }
    }

    /// A burst counts as instantaneous while its issuance spread stays under a
    /// tenth of the full-refill time `C / R`.
    pub fn is_short_burst(&self, spread: Duration) -> bool {
        let refill_horizon_us = self.policy.bucket_capacity as u128 * 1_000_000 / self.policy.refill_per_sec as u128;
        spread.as_micros() * 10 < refill_horizon_us
    }

    /// Validate a single-key burst run. `spread` is the time between the
    /// first and the last request start, not including response latency.
    pub fn validate_burst(&self, report: &AggregateReport, burst: u64, spread: Duration) -> Verdict {
        let expected = self.expect_burst(burst, spread);
        let mut verdict = Verdict::new("burst", expected, report.accepted, report.rate_limited);
        if report.total != burst {
            verdict = verdict.note(format!("{} responses for a burst of {burst}", report.total));
        }
        if !self.is_short_burst(spread) {
            verdict = verdict.note(format!(
                "burst issued over {spread:?}; refill during issuance widens the accepted band"
            ));
        }
        verdict = non_admission_note(verdict, report);
        verdict.log()
    }

    /// Expected split for `requests` spread over distinct keys within
    /// `spread`. Each key stays inside its bucket, so only the global window
    /// can reject.
    pub fn expect_global(&self, requests: u64, spread: Duration) -> Expectation {
        let limit = self.policy.global_limit as u64;
        let tolerance = self.policy.tolerance as u64;
        let window = self.policy.global_window();
        let windows = (spread.as_micros() / window.as_micros().max(1)) as u64 + 1;
        let admissible = limit.saturating_mul(windows);

        let model_accepted = requests.min(admissible);
        let model_rejected = requests - model_accepted;

        Expectation {
            requests,
            model_accepted,
            model_rejected,
            accepted_min: 0,
            accepted_max: requests.min(admissible.saturating_add(tolerance)),
            rejected_min: model_rejected.saturating_sub(tolerance),
            rejected_max: requests,
        }
    }

    /// Validate a run of `requests` across distinct keys issued within
    /// `spread`.
    pub fn validate_global(&self, report: &AggregateReport, requests: u64, spread: Duration) -> Verdict {
        let expected = self.expect_global(requests, spread);
        let verdict = Verdict::new("global_window", expected, report.accepted, report.rate_limited);
        non_admission_note(verdict, report).log()
    }

    /// Wait after which a key that spent `consumed` tokens is fully refilled.
    pub fn required_recovery_wait(&self, consumed: u64) -> Duration {
        let refill = self.policy.refill_per_sec.max(1) as u64;
        Duration::from_millis((consumed.saturating_mul(1_000)).div_ceil(refill))
    }

    /// The immediate probe must be rejected; the delayed one must be accepted
    /// once the wait covers the refill.
    pub fn validate_recovery(&self, probe: &RecoveryProbe) -> Verdict {
        let required = self.required_recovery_wait(probe.consumed);
        let waited_enough = probe.waited >= required;

        let expected = Expectation {
            requests: 2,
            model_accepted: 1,
            model_rejected: 1,
            accepted_min: if waited_enough { 1 } else { 0 },
            accepted_max: 1,
            rejected_min: 1,
            rejected_max: if waited_enough { 1 } else { 2 },
        };

        let immediate_rejected = probe.immediate == OutcomeClass::RateLimited;
        let later_accepted = probe.after_wait == OutcomeClass::Accepted;
        let later_rejected = probe.after_wait == OutcomeClass::RateLimited;
        let accepted = later_accepted as u64;
        let rejected = immediate_rejected as u64 + later_rejected as u64;

        let mut verdict = Verdict::new("recovery", expected, accepted, rejected);
        verdict.passed = immediate_rejected && (later_accepted || !waited_enough);
        if !waited_enough {
            verdict = verdict.note(format!(
                "waited {:?}, refill needs {:?}; delayed probe not judged",
                probe.waited, required
            ));
        }
        verdict.log()
    }
}

fn non_admission_note(verdict: Verdict, report: &AggregateReport) -> Verdict {
    let other = report.server_error + report.transport_error;
    if other == 0 {
        verdict
    } else {
        verdict.note(format!("{other} responses were neither accepted nor rate limited"))
    }
}

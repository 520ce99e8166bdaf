//! In-process stand-in for the ingestion API.
//!
//! Admission follows [`PolicyModel`]; accepted events become visible through
//! [`StatsSource`] after a processing delay, optionally with a fraction lost.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;

use crate::error::Result;
use crate::outcome::{Outcome, Submission};
use crate::policy::{PolicyModel, RateLimitPolicy};
use crate::target::{BoxFuture, IngestTarget, StatsSource};

/// Behaviour knobs for [`SimulatedGateway`].
#[derive(Debug, Clone)]
pub struct SimulatedOptions {
    pub policy: RateLimitPolicy,
    /// Time each request spends "on the wire".
    pub latency: Duration,
    /// Delay between acceptance and visibility in the stats count.
    pub processing_delay: Duration,
    /// Drop every Nth accepted event before it reaches the count.
    pub lose_every: Option<u64>,
    /// Answer every Nth request with a 503.
    pub fail_every: Option<u64>,
    /// Count already present before the run.
    pub baseline: u64,
}

impl Default for SimulatedOptions {
    fn default() -> Self {
        Self {
            policy: RateLimitPolicy::default(),
            latency: Duration::from_millis(5),
            processing_delay: Duration::from_millis(500),
            lose_every: None,
            fail_every: None,
            baseline: 0,
        }
    }
}

#[derive(Debug)]
struct GatewayState {
    model: PolicyModel,
    requests: u64,
    accepted_events: u64,
    /// Visibility times of accepted events not yet counted.
    pending: VecDeque<(Instant, u64)>,
    processed: u64,
}

/// Policy-enforcing mock target. Requests without a source key share the
/// `"local"` bucket.
#[derive(Debug)]
pub struct SimulatedGateway {
    options: SimulatedOptions,
    state: Mutex<GatewayState>,
}

impl SimulatedGateway {
    pub fn new(options: SimulatedOptions) -> Self {
        let model = PolicyModel::new(options.policy.clone());
        Self {
            state: Mutex::new(GatewayState {
                model,
                requests: 0,
                accepted_events: 0,
                pending: VecDeque::new(),
                processed: options.baseline,
            }),
            options,
        }
    }

    /// Requests seen so far.
    pub fn requests(&self) -> u64 {
        self.state.lock().requests
    }

    fn admit(&self, submission: &Submission) -> u16 {
        let now = Instant::now();
        let mut state = self.state.lock();
        state.requests += 1;

        if let Some(n) = self.options.fail_every {
            if n > 0 && state.requests % n == 0 {
                return 503;
            }
        }

        let key = submission.source_key.as_deref().unwrap_or("local");
        if !state.model.admit(key, now).is_accepted() {
            return 429;
        }

        let visible_at = now + self.options.processing_delay;
        for _ in 0..submission.event_count() {
            state.accepted_events += 1;
            let lost = self
                .options
                .lose_every
                .is_some_and(|n| n > 0 && state.accepted_events % n == 0);
            if lost {
                continue;
            }
            let merged = match state.pending.back_mut() {
                Some((at, count)) if *at == visible_at => {
                    *count += 1;
                    true
                }
                _ => false,
            };
            if !merged {
                state.pending.push_back((visible_at, 1));
            }
        }
        202
    }

    fn processed_now(&self) -> u64 {
        let now = Instant::now();
        let mut state = self.state.lock();
        while let Some((at, count)) = state.pending.front().copied() {
            if at > now {
                break;
            }
            state.pending.pop_front();
            state.processed += count;
        }
        state.processed
    }
}

impl IngestTarget for SimulatedGateway {
    fn name(&self) -> &'static str {
        "simulated"
    }

    fn submit<'a>(&'a self, submission: &'a Submission) -> BoxFuture<'a, Outcome> {
        Box::pin(async move {
            let start = Instant::now();
            let status = self.admit(submission);
            tokio::time::sleep(self.options.latency).await;
            Outcome::from_status(
                submission.seq,
                submission.request_id(),
                submission.event_count(),
                status,
                start.elapsed(),
            )
        })
    }
}

impl StatsSource for SimulatedGateway {
    fn total_events(&self) -> BoxFuture<'_, Result<u64>> {
        Box::pin(async move { Ok(self.processed_now()) })
    }
}

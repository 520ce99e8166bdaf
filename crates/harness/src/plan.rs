use serde::Serialize;
use std::time::Duration;

use crate::error::{HarnessError, Result};

/// How the dispatch engine admits new requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "mode")]
pub enum DispatchMode {
    /// Fixed worker pool pulling from a shared queue.
    BoundedQueue,
    /// `rate` dispatches started per one-second slice.
    Paced { rate: u32 },
}

/// Immutable description of one run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TestPlan {
    target_count: u64,
    concurrency: usize,
    target_rate: Option<u32>,
    duration: Option<Duration>,
    request_timeout: Duration,
    progress_interval: Duration,
}

impl TestPlan {
    /// Validate and build a plan.
    ///
    /// With a `target_rate` the run is paced; `target_count == 0` then means
    /// `rate * duration` requests. Without a rate, `duration` acts as a
    /// deadline after which outstanding work is cancelled.
    pub fn new(
        target_count: u64,
        concurrency: usize,
        target_rate: Option<u32>,
        duration: Option<Duration>,
    ) -> Result<Self> {
        if concurrency == 0 {
            return Err(HarnessError::InvalidPlan("concurrency must be > 0".into()));
        }
        if target_rate == Some(0) {
            return Err(HarnessError::InvalidPlan("target rate must be > 0".into()));
        }
        if duration == Some(Duration::ZERO) {
            return Err(HarnessError::InvalidPlan("duration must be > 0".into()));
        }
        if target_rate.is_some() && target_count == 0 && duration.is_none() {
            return Err(HarnessError::InvalidPlan(
                "paced plan needs a target count or a duration".into(),
            ));
        }

        Ok(Self {
            target_count,
            concurrency,
            target_rate,
            duration,
            request_timeout: Duration::from_secs(10),
            progress_interval: Duration::from_secs(1),
        })
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_progress_interval(mut self, interval: Duration) -> Self {
        self.progress_interval = interval;
        self
    }

    pub fn target_count(&self) -> u64 {
        self.target_count
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    pub fn target_rate(&self) -> Option<u32> {
        self.target_rate
    }

    pub fn duration(&self) -> Option<Duration> {
        self.duration
    }

    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    pub fn progress_interval(&self) -> Duration {
        self.progress_interval
    }

    pub fn mode(&self) -> DispatchMode {
        match self.target_rate {
            Some(rate) => DispatchMode::Paced { rate },
            None => DispatchMode::BoundedQueue,
        }
    }

    /// Number of submissions the run intends to dispatch.
    pub fn planned_total(&self) -> u64 {
        match (self.target_rate, self.duration) {
            (Some(rate), Some(duration)) if self.target_count == 0 => {
                (rate as u64).saturating_mul(duration.as_secs().max(1))
            }
            _ => self.target_count,
        }
    }
}

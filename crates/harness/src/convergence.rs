//! Convergence poller.
//!
//! After a load run the backend keeps processing asynchronously. The poller
//! queries the aggregate count on a fixed interval until it reaches
//! `baseline + sent` or the deadline passes. A failed query is recorded and
//! skipped; it never ends the poll.

use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::dispatch::StopSignal;
use crate::error::{HarnessError, Result};
use crate::report::millis;
use crate::target::StatsSource;

#[derive(Debug, Clone, PartialEq)]
pub struct ConvergenceConfig {
    pub poll_interval: Duration,
    pub deadline: Duration,
    /// Upper bound on one stats query.
    pub query_timeout: Duration,
    /// Acceptable stats-query latency.
    pub sla: Duration,
}

impl Default for ConvergenceConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(2),
            deadline: Duration::from_secs(60),
            query_timeout: Duration::from_secs(5),
            sla: Duration::from_millis(50),
        }
    }
}

/// One poll of the stats endpoint.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConvergenceSample {
    /// Time since polling started.
    #[serde(rename = "offset_ms", with = "millis")]
    pub offset: Duration,
    /// `None` when the query failed.
    pub observed: Option<u64>,
    /// Change since the previous successful observation (or the baseline).
    pub delta: Option<i64>,
    #[serde(rename = "query_latency_ms", with = "millis")]
    pub query_latency: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConvergenceState {
    Converged,
    TimedOut,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConvergenceResult {
    pub baseline: u64,
    pub sent: u64,
    pub target: u64,
    pub final_observed: u64,
    #[serde(rename = "elapsed_ms", with = "millis")]
    pub elapsed: Duration,
    pub state: ConvergenceState,
    /// The poll ended on a stop signal rather than the deadline.
    pub interrupted: bool,
    /// Sent events not reflected in the final count.
    pub loss: u64,
    pub loss_pct: f64,
    pub failed_polls: u32,
    #[serde(rename = "max_query_latency_ms", with = "millis")]
    pub max_query_latency: Duration,
    #[serde(rename = "mean_query_latency_ms", with = "millis")]
    pub mean_query_latency: Duration,
    pub sla_met: bool,
    pub samples: Vec<ConvergenceSample>,
}

impl ConvergenceResult {
    pub fn converged(&self) -> bool {
        self.state == ConvergenceState::Converged
    }
}

pub struct ConvergencePoller {
    source: Arc<dyn StatsSource>,
    config: ConvergenceConfig,
}

impl ConvergencePoller {
    pub fn new(source: Arc<dyn StatsSource>, config: ConvergenceConfig) -> Self {
        Self { source, config }
    }

    pub fn config(&self) -> &ConvergenceConfig {
        &self.config
    }

    /// Count before any traffic is sent. Unlike polls, a failure here is a
    /// setup error.
    pub async fn baseline(&self) -> Result<u64> {
        let count = self.query().await?;
        info!(baseline = count, "stats baseline");
        Ok(count)
    }

    async fn query(&self) -> Result<u64> {
        match tokio::time::timeout(self.config.query_timeout, self.source.total_events()).await {
            Ok(result) => result,
            Err(_) => Err(HarnessError::StatsQuery(format!(
                "no answer within {:?}",
                self.config.query_timeout
            ))),
        }
    }

    /// Poll until the count reaches `baseline + sent`, the deadline passes, or
    /// `stop` fires. The first query happens one interval after entry.
    pub async fn poll_until(&self, baseline: u64, sent: u64, mut stop: StopSignal) -> ConvergenceResult {
        let target = baseline.saturating_add(sent);
        let start = Instant::now();
        let deadline = start + self.config.deadline;
        let interval = self.config.poll_interval.max(Duration::from_millis(1));
        let mut ticker = tokio::time::interval_at(start + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(baseline, sent, target, "waiting for convergence");

        let mut samples = Vec::new();
        let mut last_observed = baseline;
        let mut state = ConvergenceState::TimedOut;
        let mut interrupted = false;

        loop {
            tokio::select! {
                biased;
                _ = stop.stopped() => {
                    interrupted = true;
                    break;
                }
                _ = ticker.tick() => {}
                _ = tokio::time::sleep_until(deadline) => break,
            }

            let sample = self.sample(start, last_observed).await;
            if let Some(observed) = sample.observed {
                last_observed = observed;
            }
            let reached = sample.observed.is_some_and(|observed| observed >= target);
            samples.push(sample);

            if reached {
                state = ConvergenceState::Converged;
                break;
            }
            if Instant::now() >= deadline {
                break;
            }
        }

        let result = summarize(
            baseline,
            sent,
            last_observed,
            start.elapsed(),
            state,
            interrupted,
            samples,
            self.config.sla,
        );
        match result.state {
            ConvergenceState::Converged => info!(
                elapsed_ms = result.elapsed.as_millis() as u64,
                observed = result.final_observed,
                "converged"
            ),
            ConvergenceState::TimedOut => warn!(
                elapsed_ms = result.elapsed.as_millis() as u64,
                observed = result.final_observed,
                loss = result.loss,
                loss_pct = result.loss_pct,
                interrupted = result.interrupted,
                "convergence timed out"
            ),
        }
        result
    }

    async fn sample(&self, start: Instant, previous: u64) -> ConvergenceSample {
        let queried = Instant::now();
        let observed = match self.query().await {
            Ok(count) => Some(count),
            Err(err) => {
                warn!(error = %err, "stats poll failed");
                None
            }
        };
        let sample = ConvergenceSample {
            offset: queried.saturating_duration_since(start),
            observed,
            delta: observed.map(|count| count as i64 - previous as i64),
            query_latency: queried.elapsed(),
        };
        debug!(
            offset_ms = sample.offset.as_millis() as u64,
            observed = ?sample.observed,
            delta = ?sample.delta,
            "convergence sample"
        );
        sample
    }
}

#[allow(clippy::too_many_arguments)]
fn summarize(
    baseline: u64,
    sent: u64,
    final_observed: u64,
    elapsed: Duration,
    state: ConvergenceState,
    interrupted: bool,
    samples: Vec<ConvergenceSample>,
    sla: Duration,
) -> ConvergenceResult {
    let delivered = final_observed.saturating_sub(baseline).min(sent);
    let loss = sent - delivered;
    let loss_pct = if sent == 0 {
        0.0
    } else {
        loss as f64 * 100.0 / sent as f64
    };

    let answered: Vec<Duration> = samples
        .iter()
        .filter(|s| s.observed.is_some())
        .map(|s| s.query_latency)
        .collect();
    let failed_polls = (samples.len() - answered.len()) as u32;
    let max_query_latency = answered.iter().copied().max().unwrap_or_default();
    let mean_query_latency = if answered.is_empty() {
        Duration::ZERO
    } else {
        answered.iter().sum::<Duration>() / answered.len() as u32
    };

    ConvergenceResult {
        baseline,
        sent,
        target: baseline.saturating_add(sent),
        final_observed,
        elapsed,
        state,
        interrupted,
        loss,
        loss_pct,
        failed_polls,
        max_query_latency,
        mean_query_latency,
        sla_met: !answered.is_empty() && max_query_latency <= sla,
        samples,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::stop_signal;
    use crate::target::BoxFuture;
    use parking_lot::Mutex;

    /// Returns scripted answers, then repeats the last one.
    struct Scripted(Mutex<Vec<Option<u64>>>);

    impl Scripted {
        fn new(answers: Vec<Option<u64>>) -> Arc<Self> {
            let mut answers = answers;
            answers.reverse();
            Arc::new(Self(Mutex::new(answers)))
        }
    }

    impl StatsSource for Scripted {
        fn total_events(&self) -> BoxFuture<'_, Result<u64>> {
            let mut answers = self.0.lock();
            let next = if answers.len() > 1 {
                answers.pop().flatten()
            } else {
                answers.last().copied().flatten()
            };
            Box::pin(async move {
                next.ok_or_else(|| HarnessError::StatsQuery("scripted failure".into()))
            })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn converges_once_target_reached() {
        let source = Scripted::new(vec![Some(500), Some(1_200), Some(1_500)]);
        let poller = ConvergencePoller::new(source, ConvergenceConfig::default());

        let result = poller.poll_until(500, 1_000, StopSignal::never()).await;

        assert_eq!(result.state, ConvergenceState::Converged);
        assert_eq!(result.final_observed, 1_500);
        assert_eq!(result.loss, 0);
        assert_eq!(result.samples.len(), 3);
        assert_eq!(result.samples[1].delta, Some(700));
        assert!(result.elapsed >= Duration::from_secs(6) && result.elapsed < Duration::from_millis(6_100));
        assert!(result.sla_met);
    }

    #[tokio::test(start_paused = true)]
    async fn times_out_with_loss() {
        let source = Scripted::new(vec![Some(900)]);
        let poller = ConvergencePoller::new(source, ConvergenceConfig::default());

        let result = poller.poll_until(0, 1_000, StopSignal::never()).await;

        assert_eq!(result.state, ConvergenceState::TimedOut);
        assert!(!result.interrupted);
        assert_eq!(result.loss, 100);
        assert!((result.loss_pct - 10.0).abs() < f64::EPSILON);
        // Polls at 2s, 4s, ... 60s.
        assert_eq!(result.samples.len(), 30);
        assert!(result.elapsed >= Duration::from_secs(60) && result.elapsed < Duration::from_millis(60_100));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_polls_are_not_terminal() {
        let source = Scripted::new(vec![None, None, Some(10)]);
        let poller = ConvergencePoller::new(source, ConvergenceConfig::default());

        let result = poller.poll_until(0, 10, StopSignal::never()).await;

        assert!(result.converged());
        assert_eq!(result.failed_polls, 2);
        assert_eq!(result.samples[0].observed, None);
        assert_eq!(result.samples[2].delta, Some(10));
    }

    #[tokio::test(start_paused = true)]
    async fn never_polls_faster_than_interval() {
        let source = Scripted::new(vec![Some(0)]);
        let config = ConvergenceConfig {
            poll_interval: Duration::from_secs(5),
            deadline: Duration::from_secs(21),
            ..ConvergenceConfig::default()
        };
        let result = ConvergencePoller::new(source, config)
            .poll_until(0, 1, StopSignal::never())
            .await;

        let offsets: Vec<u64> = result.samples.iter().map(|s| s.offset.as_secs()).collect();
        assert_eq!(offsets, vec![5, 10, 15, 20]);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_interrupts_polling() {
        let source = Scripted::new(vec![Some(0)]);
        let poller = ConvergencePoller::new(source, ConvergenceConfig::default());
        let (handle, signal) = stop_signal();

        let stopper = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(7)).await;
            handle.stop();
        });
        let result = poller.poll_until(0, 5, signal).await;
        stopper.await.unwrap();

        assert_eq!(result.state, ConvergenceState::TimedOut);
        assert!(result.interrupted);
        assert_eq!(result.samples.len(), 3);
        assert_eq!(result.loss, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn nothing_sent_converges_on_first_poll() {
        let source = Scripted::new(vec![Some(42)]);
        let poller = ConvergencePoller::new(source, ConvergenceConfig::default());
        let baseline = poller.baseline().await.unwrap();
        let result = poller.poll_until(baseline, 0, StopSignal::never()).await;
        assert!(result.converged());
        assert_eq!(result.loss_pct, 0.0);
    }
}

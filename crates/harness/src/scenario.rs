//! Composite runs built from the dispatcher, aggregator, oracle and poller.

use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::info;

use crate::aggregate::{AggregateReport, Aggregator};
use crate::convergence::{ConvergencePoller, ConvergenceResult};
use crate::dispatch::{DispatchSummary, Dispatcher, StopSignal};
use crate::error::Result;
use crate::event::EventSynthesizer;
use crate::oracle::{RateLimitOracle, RecoveryProbe, Verdict};
use crate::outcome::{distinct_source_key, Outcome, OutcomeClass, Submission, TransportErrorKind};
use crate::plan::TestPlan;
use crate::target::IngestTarget;

/// Dispatch summary and aggregate of one load run.
#[derive(Debug, Clone, Serialize)]
pub struct LoadRun {
    pub dispatch: DispatchSummary,
    pub aggregate: AggregateReport,
}

/// One event per submission, variant chosen by index.
pub fn single_events(synth: EventSynthesizer) -> impl Fn(u64) -> Submission + Send + Sync + 'static {
    move |index| Submission::single(index, synth.synthesize(index, None))
}

/// `size` events per submission, posted to the batch endpoint.
pub fn batches(synth: EventSynthesizer, size: usize) -> impl Fn(u64) -> Submission + Send + Sync + 'static {
    let size = size.max(1);
    move |index| Submission::batch(index, synth.synthesize_batch(index * size as u64, size))
}

/// Dispatch a plan while aggregating outcomes as they arrive.
pub async fn run_load<F>(dispatcher: &Dispatcher, plan: &TestPlan, make: F, stop: StopSignal) -> Result<LoadRun>
where
    F: Fn(u64) -> Submission + Send + Sync + 'static,
{
    let aggregator = Aggregator::new()?;
    let (tx, rx) = mpsc::channel(plan.concurrency().saturating_mul(4).max(64));

    let (dispatch, aggregator) = tokio::join!(
        dispatcher.run(plan, make, tx, stop),
        aggregator.consume(rx)
    );
    let aggregate = aggregator.report();

    info!(
        total = aggregate.total,
        accepted = aggregate.accepted,
        rate_limited = aggregate.rate_limited,
        server_error = aggregate.server_error,
        transport_error = aggregate.transport_error,
        rps = format!("{:.1}", aggregate.requests_per_sec),
        p95_ms = format!("{:.2}", aggregate.latency_p95_ms),
        "load run complete"
    );
    Ok(LoadRun { dispatch, aggregate })
}

/// Parameters of the rate-limit scenarios.
#[derive(Debug, Clone)]
pub struct RateLimitScenario {
    /// Requests fired from one key at once.
    pub burst: u64,
    /// Source identity used for the burst and recovery probes.
    pub burst_key: String,
    /// Run the recovery probe after the burst.
    pub recovery: bool,
    /// Requests spread over distinct keys; `None` skips the global check.
    pub global_requests: Option<u64>,
    pub global_concurrency: usize,
    pub request_timeout: Duration,
}

impl Default for RateLimitScenario {
    fn default() -> Self {
        Self {
            burst: 150,
            burst_key: "192.0.2.10".to_string(),
            recovery: true,
            global_requests: None,
            global_concurrency: 64,
            request_timeout: Duration::from_secs(10),
        }
    }
}

/// Everything the rate-limit suite observed.
#[derive(Debug, Clone, Serialize)]
pub struct RateLimitRun {
    pub burst: LoadRun,
    pub recovery: Option<RecoveryProbe>,
    pub global: Option<LoadRun>,
    pub verdicts: Vec<Verdict>,
}

impl RateLimitRun {
    pub fn passed(&self) -> bool {
        self.verdicts.iter().all(|v| v.passed)
    }
}

/// Burst, recovery and global-window scenarios, in that order. The global
/// scenario runs last because it can leave the shared window exhausted.
pub async fn rate_limit_suite(
    target: Arc<dyn IngestTarget>,
    oracle: &RateLimitOracle,
    synth: &EventSynthesizer,
    scenario: &RateLimitScenario,
    stop: StopSignal,
) -> Result<RateLimitRun> {
    let dispatcher = Dispatcher::new(Arc::clone(&target));
    let mut verdicts = Vec::new();

    info!(burst = scenario.burst, key = %scenario.burst_key, "burst scenario");
    let burst_plan = TestPlan::new(scenario.burst, scenario.burst.max(1) as usize, None, None)?
        .with_request_timeout(scenario.request_timeout);
    let key = scenario.burst_key.clone();
    let burst_synth = synth.clone();
    let burst = run_load(
        &dispatcher,
        &burst_plan,
        move |i| Submission::single(i, burst_synth.synthesize(i, None)).from_key(key.clone()),
        stop.clone(),
    )
    .await?;
    verdicts.push(oracle.validate_burst(&burst.aggregate, scenario.burst, burst.dispatch.issue_spread));

    let recovery = if scenario.recovery && !stop.is_stopped() {
        let probe = recovery_probe(target.as_ref(), oracle, synth, scenario, burst.aggregate.accepted, &stop).await;
        verdicts.push(oracle.validate_recovery(&probe));
        Some(probe)
    } else {
        None
    };

    let global = match scenario.global_requests {
        Some(requests) if !stop.is_stopped() => {
            info!(requests, "global window scenario");
            let plan = TestPlan::new(requests, scenario.global_concurrency, None, None)?
                .with_request_timeout(scenario.request_timeout);
            let global_synth = synth.clone();
            let run = run_load(
                &dispatcher,
                &plan,
                move |i| Submission::single(i, global_synth.synthesize(i, None)).from_key(distinct_source_key(i)),
                stop.clone(),
            )
            .await?;
            verdicts.push(oracle.validate_global(&run.aggregate, requests, run.dispatch.issue_spread));
            Some(run)
        }
        Some(_) => None,
        None => {
            info!("global window scenario skipped");
            None
        }
    };

    Ok(RateLimitRun {
        burst,
        recovery,
        global,
        verdicts,
    })
}

async fn recovery_probe(
    target: &dyn IngestTarget,
    oracle: &RateLimitOracle,
    synth: &EventSynthesizer,
    scenario: &RateLimitScenario,
    consumed: u64,
    stop: &StopSignal,
) -> RecoveryProbe {
    let probe = |seq: u64| {
        Submission::single(seq, synth.synthesize(seq, None)).from_key(scenario.burst_key.clone())
    };

    let immediate = target.submit(&probe(scenario.burst)).await.class;

    let wait = oracle.required_recovery_wait(consumed);
    info!(consumed, wait_ms = wait.as_millis() as u64, "waiting for bucket refill");
    let mut stop = stop.clone();
    let waited_from = tokio::time::Instant::now();
    tokio::select! {
        _ = stop.stopped() => {}
        _ = tokio::time::sleep(wait) => {}
    }
    let waited = waited_from.elapsed();

    let after_wait = if stop.is_stopped() {
        OutcomeClass::TransportError(TransportErrorKind::Cancelled)
    } else {
        target.submit(&probe(scenario.burst + 1)).await.class
    };

    RecoveryProbe {
        consumed,
        immediate,
        waited,
        after_wait,
    }
}

/// Take a baseline, run the load, then wait for the accepted events to show
/// up in the stats count.
pub async fn convergence_check<F>(
    dispatcher: &Dispatcher,
    poller: &ConvergencePoller,
    plan: &TestPlan,
    make: F,
    stop: StopSignal,
) -> Result<(LoadRun, ConvergenceResult)>
where
    F: Fn(u64) -> Submission + Send + Sync + 'static,
{
    let baseline = poller.baseline().await?;
    let load = run_load(dispatcher, plan, make, stop.clone()).await?;
    let result = poller
        .poll_until(baseline, load.aggregate.events_accepted, stop)
        .await;
    Ok((load, result))
}

/// Both responses to a repeated event identifier.
#[derive(Debug, Clone, Serialize)]
pub struct DuplicateProbe {
    pub event_id: String,
    pub first: Outcome,
    pub second: Outcome,
}

impl DuplicateProbe {
    /// Each submission got its own admission-layer answer.
    pub fn passed(&self) -> bool {
        self.first.class.is_admission_response() && self.second.class.is_admission_response()
    }
}

/// Submit one event twice under the same identifier. Duplicate detection is
/// the backend's business; only the admission response is checked.
pub async fn duplicate_probe(target: &dyn IngestTarget, synth: &EventSynthesizer, source_key: Option<&str>) -> DuplicateProbe {
    let event = synth.synthesize(0, None);
    let event_id = event.event_id.clone();
    let mut first = Submission::single(0, event.clone());
    let mut second = Submission::single(1, event);
    if let Some(key) = source_key {
        first = first.from_key(key);
        second = second.from_key(key);
    }

    let first = target.submit(&first).await;
    let second = target.submit(&second).await;
    info!(
        event_id = %event_id,
        first = ?first.class,
        second = ?second.class,
        "duplicate probe"
    );
    DuplicateProbe {
        event_id,
        first,
        second,
    }
}

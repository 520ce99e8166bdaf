//! End-to-end runs against the in-process gateway on a paused clock.

use std::sync::Arc;
use std::time::Duration;

use loadcheck_harness::{
    batches, convergence_check, duplicate_probe, rate_limit_suite, run_load, single_events, BoxFuture,
    ConvergenceConfig, ConvergencePoller, ConvergenceState, Dispatcher, EventSynthesizer, IngestTarget, Outcome,
    OutcomeClass, RateLimitOracle, RateLimitPolicy, RateLimitScenario, RunReport, SimulatedGateway,
    SimulatedOptions, StopSignal, Submission, TestPlan,
};

/// Accepts everything, slowly, with no admission control at all.
struct SlowUnlimited(Duration);

impl IngestTarget for SlowUnlimited {
    fn name(&self) -> &'static str {
        "slow-unlimited"
    }

    fn submit<'a>(&'a self, submission: &'a Submission) -> BoxFuture<'a, Outcome> {
        Box::pin(async move {
            tokio::time::sleep(self.0).await;
            Outcome::from_status(submission.seq, submission.request_id(), 1, 202, self.0)
        })
    }
}

fn roomy_policy() -> RateLimitPolicy {
    RateLimitPolicy {
        bucket_capacity: 100_000,
        refill_per_sec: 10_000,
        global_limit: 1_000_000,
        global_window_secs: 60,
        tolerance: 0,
    }
}

fn gateway(options: SimulatedOptions) -> Arc<SimulatedGateway> {
    Arc::new(SimulatedGateway::new(options))
}

#[tokio::test(start_paused = true)]
async fn default_policy_passes_every_check() {
    let policy = RateLimitPolicy {
        global_limit: 300,
        ..RateLimitPolicy::default()
    };
    let gw = gateway(SimulatedOptions {
        policy: policy.clone(),
        ..SimulatedOptions::default()
    });
    let oracle = RateLimitOracle::new(policy).unwrap();
    let scenario = RateLimitScenario {
        burst: 150,
        global_requests: Some(350),
        ..RateLimitScenario::default()
    };

    let run = rate_limit_suite(gw.clone(), &oracle, &EventSynthesizer::default(), &scenario, StopSignal::never())
        .await
        .unwrap();

    assert!(run.passed(), "verdicts: {:#?}", run.verdicts);
    assert_eq!(run.burst.aggregate.accepted, 100);
    assert_eq!(run.burst.aggregate.rate_limited, 50);

    let recovery = run.recovery.as_ref().unwrap();
    assert_eq!(recovery.consumed, 100);
    assert!(recovery.waited >= Duration::from_secs(10));

    // Burst and recovery already used 101 of the 300 global slots.
    let global = run.global.as_ref().unwrap();
    assert_eq!(global.aggregate.accepted, 199);
    assert_eq!(global.aggregate.rate_limited, 151);
}

#[tokio::test(start_paused = true)]
async fn lenient_backend_fails_burst_check() {
    let gw = gateway(SimulatedOptions {
        policy: RateLimitPolicy {
            bucket_capacity: 200,
            ..RateLimitPolicy::default()
        },
        ..SimulatedOptions::default()
    });
    let oracle = RateLimitOracle::new(RateLimitPolicy::default()).unwrap();
    let scenario = RateLimitScenario {
        recovery: false,
        ..RateLimitScenario::default()
    };

    let run = rate_limit_suite(gw, &oracle, &EventSynthesizer::default(), &scenario, StopSignal::never())
        .await
        .unwrap();

    assert!(!run.passed());
    assert_eq!(run.verdicts.len(), 1);
    assert_eq!(run.verdicts[0].observed_accepted, 150);
    assert_eq!(run.verdicts[0].accepted_delta, 50);
}

#[tokio::test(start_paused = true)]
async fn slow_backend_without_limiter_fails_burst_check() {
    let oracle = RateLimitOracle::new(RateLimitPolicy::default()).unwrap();
    let scenario = RateLimitScenario {
        recovery: false,
        ..RateLimitScenario::default()
    };

    let run = rate_limit_suite(
        Arc::new(SlowUnlimited(Duration::from_secs(5))),
        &oracle,
        &EventSynthesizer::default(),
        &scenario,
        StopSignal::never(),
    )
    .await
    .unwrap();

    assert!(run.burst.dispatch.elapsed >= Duration::from_secs(5));
    assert!(run.burst.dispatch.issue_spread < Duration::from_millis(10));
    let verdict = &run.verdicts[0];
    assert_eq!(verdict.observed_accepted, 150);
    assert_eq!(verdict.expected.accepted_max, 100);
    assert_eq!(verdict.expected.rejected_min, 50);
    assert!(!verdict.passed);
    assert!(!run.passed());
}

#[tokio::test(start_paused = true)]
async fn accepted_events_converge() {
    let gw = gateway(SimulatedOptions {
        policy: roomy_policy(),
        baseline: 250,
        processing_delay: Duration::from_secs(3),
        ..SimulatedOptions::default()
    });
    let dispatcher = Dispatcher::new(gw.clone());
    let poller = ConvergencePoller::new(gw.clone(), ConvergenceConfig::default());
    let plan = TestPlan::new(1_000, 50, None, None).unwrap();

    let (load, result) = convergence_check(
        &dispatcher,
        &poller,
        &plan,
        single_events(EventSynthesizer::default()),
        StopSignal::never(),
    )
    .await
    .unwrap();

    assert_eq!(load.aggregate.accepted, 1_000);
    assert_eq!(result.state, ConvergenceState::Converged);
    assert_eq!(result.baseline, 250);
    assert_eq!(result.final_observed, 1_250);
    assert_eq!(result.loss, 0);
    assert!(result.sla_met);

    let report = RunReport::new("converge", "simulated")
        .with_load(load)
        .with_convergence(result)
        .finish();
    assert!(report.passed());
}

#[tokio::test(start_paused = true)]
async fn lost_events_time_out_with_loss() {
    let gw = gateway(SimulatedOptions {
        policy: roomy_policy(),
        lose_every: Some(10),
        ..SimulatedOptions::default()
    });
    let dispatcher = Dispatcher::new(gw.clone());
    let config = ConvergenceConfig {
        deadline: Duration::from_secs(20),
        ..ConvergenceConfig::default()
    };
    let poller = ConvergencePoller::new(gw.clone(), config);
    let plan = TestPlan::new(100, 10, None, None).unwrap();

    let (_, result) = convergence_check(&dispatcher, &poller, &plan, batches(EventSynthesizer::default(), 10), StopSignal::never())
        .await
        .unwrap();

    assert_eq!(result.sent, 1_000);
    assert_eq!(result.state, ConvergenceState::TimedOut);
    assert_eq!(result.final_observed, 900);
    assert_eq!(result.loss, 100);
    assert!((result.loss_pct - 10.0).abs() < 1e-9);
    assert_eq!(result.samples.len(), 10);

    let report = RunReport::new("converge", "simulated").with_convergence(result).finish();
    assert!(!report.passed());
}

#[tokio::test(start_paused = true)]
async fn server_errors_are_counted_not_dropped() {
    let gw = gateway(SimulatedOptions {
        policy: roomy_policy(),
        fail_every: Some(4),
        ..SimulatedOptions::default()
    });
    let dispatcher = Dispatcher::new(gw.clone());
    let plan = TestPlan::new(200, 7, None, None).unwrap();

    let run = run_load(&dispatcher, &plan, single_events(EventSynthesizer::default()), StopSignal::never())
        .await
        .unwrap();

    assert_eq!(run.aggregate.total, 200);
    assert_eq!(run.aggregate.server_error, 50);
    assert_eq!(run.aggregate.accepted, 150);
    assert_eq!(run.aggregate.by_status.get("503"), Some(&50));
    assert!(run.aggregate.is_consistent());
    assert!(run.dispatch.peak_in_flight <= 7);
    assert_eq!(gw.requests(), 200);
}

#[tokio::test(start_paused = true)]
async fn paced_run_follows_rate() {
    let gw = gateway(SimulatedOptions {
        policy: roomy_policy(),
        ..SimulatedOptions::default()
    });
    let dispatcher = Dispatcher::new(gw.clone());
    let plan = TestPlan::new(0, 10, Some(50), Some(Duration::from_secs(4))).unwrap();

    let run = run_load(&dispatcher, &plan, single_events(EventSynthesizer::default()), StopSignal::never())
        .await
        .unwrap();

    assert_eq!(run.aggregate.total, 200);
    assert_eq!(run.dispatch.dispatched, 200);
    assert!(run.aggregate.requests_per_sec <= 70.0);
}

#[tokio::test(start_paused = true)]
async fn duplicate_probe_sees_rate_limit_not_dedup() {
    let gw = gateway(SimulatedOptions {
        policy: RateLimitPolicy {
            bucket_capacity: 1,
            refill_per_sec: 1,
            ..RateLimitPolicy::default()
        },
        ..SimulatedOptions::default()
    });

    let probe = duplicate_probe(gw.as_ref(), &EventSynthesizer::default(), None).await;

    assert!(probe.passed());
    assert_eq!(probe.first.class, OutcomeClass::Accepted);
    assert_eq!(probe.second.class, OutcomeClass::RateLimited);
    assert_eq!(probe.first.request_id, probe.second.request_id);
}

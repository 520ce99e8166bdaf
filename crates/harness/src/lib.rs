//! Loadcheck harness: load generation, rate-limit verification and
//! convergence checking for event ingestion APIs.
//!
//! Submissions are synthesized, dispatched under a bounded concurrency
//! policy and reduced into an aggregate report. The rate-limit oracle judges
//! admission responses against the expected two-tier policy, and the
//! convergence poller waits for accepted events to appear in the backend's
//! stats count.

pub mod aggregate;
pub mod convergence;
pub mod dispatch;
pub mod error;
pub mod event;
pub mod oracle;
pub mod outcome;
pub mod plan;
pub mod policy;
pub mod report;
pub mod scenario;
pub mod settings;
pub mod simulated;
pub mod target;

pub use aggregate::{AggregateReport, Aggregator};
pub use convergence::{ConvergenceConfig, ConvergencePoller, ConvergenceResult, ConvergenceSample, ConvergenceState};
pub use dispatch::{stop_signal, DispatchSummary, Dispatcher, StopHandle, StopSignal};
pub use error::{HarnessError, Result};
pub use event::{Event, EventBody, EventKind, EventSynthesizer, PurchaseItem};
pub use oracle::{Expectation, RateLimitOracle, RecoveryProbe, Verdict};
pub use outcome::{distinct_source_key, Outcome, OutcomeClass, Payload, Submission, TransportErrorKind};
pub use plan::{DispatchMode, TestPlan};
pub use policy::{Admission, PolicyModel, RateLimitPolicy, SlidingWindow, TokenBucket};
pub use report::RunReport;
pub use scenario::{
    batches, convergence_check, duplicate_probe, rate_limit_suite, run_load, single_events, DuplicateProbe, LoadRun,
    RateLimitRun, RateLimitScenario,
};
pub use settings::HarnessConfig;
pub use simulated::{SimulatedGateway, SimulatedOptions};
pub use target::{BoxFuture, HttpTarget, HttpTargetOptions, IngestTarget, StatsSource};

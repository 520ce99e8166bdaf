//! Dispatch engine.
//!
//! Drives submissions against an [`IngestTarget`] in one of two modes:
//!
//! * **Bounded queue**: `concurrency` workers pull from a shared queue until
//!   it is exhausted. Outstanding requests never exceed `concurrency`.
//! * **Paced**: every one-second slice starts exactly `rate` dispatches and
//!   sleeps out the remainder. A slow target can push the number of
//!   outstanding requests above `concurrency` for that slice.
//!
//! Every dispatch yields exactly one [`Outcome`]. Requests still outstanding
//! when the run is stopped resolve to `TransportError(Cancelled)`. Nothing is
//! retried.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::outcome::{Outcome, Submission, TransportErrorKind};
use crate::plan::{DispatchMode, TestPlan};
use crate::target::IngestTarget;

/// Caller side of the stop signal.
#[derive(Debug)]
pub struct StopHandle(watch::Sender<bool>);

impl StopHandle {
    pub fn stop(&self) {
        let _ = self.0.send(true);
    }
}

/// Cloneable receiver side of the stop signal.
#[derive(Debug, Clone)]
pub struct StopSignal(watch::Receiver<bool>);

impl StopSignal {
    /// A signal that never fires.
    pub fn never() -> Self {
        let (_tx, rx) = watch::channel(false);
        StopSignal(rx)
    }

    pub fn is_stopped(&self) -> bool {
        *self.0.borrow()
    }

    /// Resolves once `stop()` has been called.
    pub async fn stopped(&mut self) {
        while !*self.0.borrow_and_update() {
            if self.0.changed().await.is_err() {
                // Handle dropped without stopping: never fires.
                std::future::pending::<()>().await;
            }
        }
    }
}

pub fn stop_signal() -> (StopHandle, StopSignal) {
    let (tx, rx) = watch::channel(false);
    (StopHandle(tx), StopSignal(rx))
}

/// Result of one dispatch run. Outcomes themselves go to the channel.
#[derive(Debug, Clone, Serialize)]
pub struct DispatchSummary {
    pub mode: DispatchMode,
    pub planned: u64,
    pub dispatched: u64,
    pub completed: u64,
    pub peak_in_flight: usize,
    pub cancelled: bool,
    #[serde(rename = "elapsed_ms", with = "crate::report::millis")]
    pub elapsed: Duration,
    /// Time between the first and the last request start. Response latency
    /// is not included.
    #[serde(rename = "issue_spread_ms", with = "crate::report::millis")]
    pub issue_spread: Duration,
}

#[derive(Debug)]
struct Counters {
    started: Instant,
    dispatched: AtomicU64,
    completed: AtomicU64,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
    /// Request start offsets from `started`, microseconds.
    first_start_us: AtomicU64,
    last_start_us: AtomicU64,
}

impl Counters {
    fn new(started: Instant) -> Self {
        Self {
            started,
            dispatched: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
            first_start_us: AtomicU64::new(u64::MAX),
            last_start_us: AtomicU64::new(0),
        }
    }

    fn issue_spread(&self) -> Duration {
        let first = self.first_start_us.load(Ordering::SeqCst);
        let last = self.last_start_us.load(Ordering::SeqCst);
        if first == u64::MAX {
            Duration::ZERO
        } else {
            Duration::from_micros(last.saturating_sub(first))
        }
    }

    fn enter(self: &Arc<Self>) -> InFlightGuard {
        let offset = Instant::now().saturating_duration_since(self.started).as_micros() as u64;
        self.first_start_us.fetch_min(offset, Ordering::SeqCst);
        self.last_start_us.fetch_max(offset, Ordering::SeqCst);
        self.dispatched.fetch_add(1, Ordering::Relaxed);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        InFlightGuard(Arc::clone(self))
    }
}

struct InFlightGuard(Arc<Counters>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.0.completed.fetch_add(1, Ordering::Relaxed);
    }
}

/// Abort conditions shared by every task of a run.
#[derive(Clone)]
struct Halt {
    stop: StopSignal,
    abort_at: Option<Instant>,
}

impl Halt {
    async fn wait(&mut self) {
        tokio::select! {
            _ = self.stop.stopped() => {}
            _ = until(self.abort_at) => {}
        }
    }

    fn fired(&self) -> bool {
        self.stop.is_stopped() || self.abort_at.is_some_and(|at| Instant::now() >= at)
    }
}

async fn until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending::<()>().await,
    }
}

/// Send one submission and classify the result. Always returns an outcome.
async fn dispatch_one(
    target: Arc<dyn IngestTarget>,
    submission: Submission,
    timeout: Duration,
    mut halt: Halt,
    counters: Arc<Counters>,
) -> Outcome {
    let _guard = counters.enter();
    let start = Instant::now();
    let seq = submission.seq;
    let request_id = submission.request_id();
    let events = submission.event_count();

    tokio::select! {
        biased;
        _ = halt.wait() => {
            Outcome::transport(seq, request_id, events, TransportErrorKind::Cancelled, start.elapsed())
        }
        result = tokio::time::timeout(timeout, target.submit(&submission)) => match result {
            Ok(outcome) => outcome,
            Err(_) => Outcome::transport(seq, request_id, events, TransportErrorKind::Timeout, start.elapsed()),
        }
    }
}

/// Issues a [`TestPlan`] against one target.
#[derive(Clone)]
pub struct Dispatcher {
    target: Arc<dyn IngestTarget>,
}

impl Dispatcher {
    pub fn new(target: Arc<dyn IngestTarget>) -> Self {
        Self { target }
    }

    pub fn target_name(&self) -> &'static str {
        self.target.name()
    }

    /// Run the plan, sending each [`Outcome`] to `outcomes` as it completes.
    ///
    /// `make` builds the submission for a dispatch index. `plan.duration()`
    /// closes the issuance window; anything still outstanding one request
    /// timeout later is cancelled, as is everything when `stop` fires.
    pub async fn run<F>(
        &self,
        plan: &TestPlan,
        make: F,
        outcomes: mpsc::Sender<Outcome>,
        stop: StopSignal,
    ) -> DispatchSummary
    where
        F: Fn(u64) -> Submission + Send + Sync + 'static,
    {
        let started = Instant::now();
        let issue_until = plan.duration().map(|d| started + d);
        let halt = Halt {
            stop,
            abort_at: issue_until.map(|at| at + plan.request_timeout()),
        };
        let counters = Arc::new(Counters::new(started));
        let planned = plan.planned_total();

        info!(
            sink = self.target.name(),
            mode = ?plan.mode(),
            planned,
            concurrency = plan.concurrency(),
            "dispatch starting"
        );

        let progress = spawn_progress(Arc::clone(&counters), planned, plan.progress_interval());

        let cancelled = match plan.mode() {
            DispatchMode::BoundedQueue => {
                self.run_bounded(plan, make, outcomes, halt.clone(), issue_until, &counters)
                    .await
            }
            DispatchMode::Paced { rate } => {
                self.run_paced(plan, rate, make, outcomes, halt.clone(), issue_until, &counters)
                    .await
            }
        };

        progress.abort();

        let summary = DispatchSummary {
            mode: plan.mode(),
            planned,
            dispatched: counters.dispatched.load(Ordering::SeqCst),
            completed: counters.completed.load(Ordering::SeqCst),
            peak_in_flight: counters.peak_in_flight.load(Ordering::SeqCst),
            cancelled: cancelled || halt.fired(),
            elapsed: started.elapsed(),
            issue_spread: counters.issue_spread(),
        };
        info!(
            dispatched = summary.dispatched,
            peak_in_flight = summary.peak_in_flight,
            cancelled = summary.cancelled,
            elapsed_ms = summary.elapsed.as_millis() as u64,
            issue_spread_ms = summary.issue_spread.as_millis() as u64,
            "dispatch finished"
        );
        summary
    }

    async fn run_bounded<F>(
        &self,
        plan: &TestPlan,
        make: F,
        outcomes: mpsc::Sender<Outcome>,
        halt: Halt,
        issue_until: Option<Instant>,
        counters: &Arc<Counters>,
    ) -> bool
    where
        F: Fn(u64) -> Submission + Send + Sync + 'static,
    {
        let total = plan.planned_total();
        let workers = plan.concurrency();
        let (queue_tx, queue_rx) = mpsc::channel::<Submission>(workers.saturating_mul(2).max(1));
        let queue_rx = Arc::new(Mutex::new(queue_rx));

        // Producer: fills the queue until exhausted or halted.
        let mut producer_halt = halt.clone();
        let producer = tokio::spawn(async move {
            for index in 0..total {
                let submission = make(index);
                tokio::select! {
                    biased;
                    _ = producer_halt.wait() => return,
                    _ = until(issue_until) => return,
                    sent = queue_tx.send(submission) => {
                        if sent.is_err() {
                            return;
                        }
                    }
                }
            }
        });

        let mut pool = JoinSet::new();
        for _ in 0..workers {
            let target = Arc::clone(&self.target);
            let queue_rx = Arc::clone(&queue_rx);
            let outcomes = outcomes.clone();
            let mut worker_halt = halt.clone();
            let counters = Arc::clone(counters);
            let timeout = plan.request_timeout();
            pool.spawn(async move {
                loop {
                    let next = {
                        let mut guard = queue_rx.lock().await;
                        tokio::select! {
                            biased;
                            _ = worker_halt.wait() => None,
                            _ = until(issue_until) => None,
                            item = guard.recv() => item,
                        }
                    };
                    let Some(submission) = next else { break };

                    let outcome = dispatch_one(
                        Arc::clone(&target),
                        submission,
                        timeout,
                        worker_halt.clone(),
                        Arc::clone(&counters),
                    )
                    .await;
                    if outcomes.send(outcome).await.is_err() {
                        debug!("outcome receiver dropped");
                    }
                }
            });
        }
        drop(outcomes);

        while let Some(res) = pool.join_next().await {
            if let Err(err) = res {
                warn!(error = %err, "dispatch worker failed");
            }
        }
        // Workers are gone; dropping the receiver drains whatever was queued.
        producer.abort();
        let _ = producer.await;
        let undispatched = {
            let mut guard = queue_rx.lock().await;
            guard.close();
            let mut n = 0u64;
            while guard.try_recv().is_ok() {
                n += 1;
            }
            n
        };
        if undispatched > 0 {
            debug!(undispatched, "queue drained without dispatch");
        }

        halt.fired()
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_paced<F>(
        &self,
        plan: &TestPlan,
        rate: u32,
        make: F,
        outcomes: mpsc::Sender<Outcome>,
        mut halt: Halt,
        issue_until: Option<Instant>,
        counters: &Arc<Counters>,
    ) -> bool
    where
        F: Fn(u64) -> Submission + Send + Sync + 'static,
    {
        let total = plan.planned_total();
        let mut in_flight: JoinSet<Outcome> = JoinSet::new();
        let mut slice = tokio::time::interval(Duration::from_secs(1));
        slice.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut next = 0u64;
        let mut cancelled = false;

        while next < total {
            tokio::select! {
                biased;
                _ = halt.wait() => {
                    cancelled = true;
                    break;
                }
                _ = until(issue_until) => break,
                _ = slice.tick() => {}
            }

            let batch = (rate as u64).min(total - next);
            for _ in 0..batch {
                in_flight.spawn(dispatch_one(
                    Arc::clone(&self.target),
                    make(next),
                    plan.request_timeout(),
                    halt.clone(),
                    Arc::clone(counters),
                ));
                next += 1;
            }

            while let Some(res) = in_flight.try_join_next() {
                forward(res, &outcomes).await;
            }
        }

        while let Some(res) = in_flight.join_next().await {
            forward(res, &outcomes).await;
        }

        cancelled || halt.fired()
    }
}

async fn forward(res: Result<Outcome, tokio::task::JoinError>, outcomes: &mpsc::Sender<Outcome>) {
    match res {
        Ok(outcome) => {
            if outcomes.send(outcome).await.is_err() {
                debug!("outcome receiver dropped");
            }
        }
        Err(err) => warn!(error = %err, "dispatch task failed"),
    }
}

fn spawn_progress(
    counters: Arc<Counters>,
    planned: u64,
    every: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every.max(Duration::from_millis(10)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            info!(
                dispatched = counters.dispatched.load(Ordering::Relaxed),
                completed = counters.completed.load(Ordering::Relaxed),
                in_flight = counters.in_flight.load(Ordering::Relaxed),
                planned,
                "progress"
            );
        }
    })
}

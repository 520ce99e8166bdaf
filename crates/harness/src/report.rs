//! End-of-run report.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fs;
use std::path::Path;
use tracing::info;

use crate::convergence::{ConvergenceResult, ConvergenceState};
use crate::error::Result;
use crate::plan::TestPlan;
use crate::scenario::{DuplicateProbe, LoadRun, RateLimitRun};

/// Durations as fractional milliseconds.
pub(crate) mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64() * 1_000.0)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let ms = f64::deserialize(deserializer)?;
        Ok(Duration::from_secs_f64(ms.max(0.0) / 1_000.0))
    }
}

/// Machine-readable record of one harness invocation.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub scenario: String,
    pub target: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plan: Option<TestPlan>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub load: Option<LoadRun>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate_limit: Option<RateLimitRun>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub convergence: Option<ConvergenceResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duplicate: Option<DuplicateProbe>,
    pub passed: bool,
}

impl RunReport {
    pub fn new(scenario: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            scenario: scenario.into(),
            target: target.into(),
            started_at: Utc::now(),
            finished_at: None,
            plan: None,
            load: None,
            rate_limit: None,
            convergence: None,
            duplicate: None,
            passed: true,
        }
    }

    pub fn with_plan(mut self, plan: TestPlan) -> Self {
        self.plan = Some(plan);
        self
    }

    pub fn with_load(mut self, load: LoadRun) -> Self {
        self.load = Some(load);
        self
    }

    pub fn with_rate_limit(mut self, run: RateLimitRun) -> Self {
        self.rate_limit = Some(run);
        self
    }

    pub fn with_convergence(mut self, result: ConvergenceResult) -> Self {
        self.convergence = Some(result);
        self
    }

    pub fn with_duplicate(mut self, probe: DuplicateProbe) -> Self {
        self.duplicate = Some(probe);
        self
    }

    /// Stamp the end time and settle the overall verdict. Load numbers alone
    /// never fail a run; failed oracle checks, a duplicate probe without
    /// admission answers and a convergence timeout do.
    pub fn finish(mut self) -> Self {
        self.finished_at = Some(Utc::now());
        let rate_limit_ok = self.rate_limit.as_ref().map_or(true, RateLimitRun::passed);
        let converged = self.convergence.as_ref().map_or(true, ConvergenceResult::converged);
        let duplicate_ok = self.duplicate.as_ref().map_or(true, DuplicateProbe::passed);
        self.passed = rate_limit_ok && converged && duplicate_ok;
        self
    }

    pub fn passed(&self) -> bool {
        self.passed
    }

    /// Write pretty JSON, creating parent directories as needed.
    pub fn write_json(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let body = serde_json::to_string_pretty(self)?;
        fs::write(path, body)?;
        info!(path = %path.display(), "report written");
        Ok(())
    }

    /// Human-readable summary, one line per fact.
    pub fn summary_lines(&self) -> Vec<String> {
        let mut lines = vec![format!("{} against {}", self.scenario, self.target)];

        if let Some(load) = &self.load {
            let a = &load.aggregate;
            lines.push(format!(
                "requests: {} total, {} accepted, {} rate limited, {} server error, {} transport error",
                a.total, a.accepted, a.rate_limited, a.server_error, a.transport_error
            ));
            lines.push(format!(
                "throughput: {:.1} req/s, {:.1} events/s over {:.2}s (peak in flight {})",
                a.requests_per_sec, a.events_per_sec, a.duration_secs, load.dispatch.peak_in_flight
            ));
            lines.push(format!(
                "latency: avg {:.2}ms, p50 {:.2}ms, p95 {:.2}ms, p99 {:.2}ms, max {:.2}ms",
                a.latency_avg_ms, a.latency_p50_ms, a.latency_p95_ms, a.latency_p99_ms, a.latency_max_ms
            ));
            if load.dispatch.cancelled {
                lines.push("run was cancelled before completion".to_string());
            }
        }

        if let Some(run) = &self.rate_limit {
            for verdict in &run.verdicts {
                lines.push(format!(
                    "{} {}: accepted {} (expected {}..={}), rejected {} (expected {}..={})",
                    if verdict.passed { "PASS" } else { "FAIL" },
                    verdict.check,
                    verdict.observed_accepted,
                    verdict.expected.accepted_min,
                    verdict.expected.accepted_max,
                    verdict.observed_rejected,
                    verdict.expected.rejected_min,
                    verdict.expected.rejected_max,
                ));
                lines.extend(verdict.notes.iter().map(|n| format!("  note: {n}")));
            }
        }

        if let Some(c) = &self.convergence {
            let state = match c.state {
                ConvergenceState::Converged => "converged",
                ConvergenceState::TimedOut => "TIMED OUT",
            };
            lines.push(format!(
                "convergence: {state} after {:.1}s, observed {} of {} (baseline {}, sent {})",
                c.elapsed.as_secs_f64(),
                c.final_observed,
                c.target,
                c.baseline,
                c.sent
            ));
            lines.push(format!(
                "loss: {} events ({:.2}%), {} failed polls",
                c.loss, c.loss_pct, c.failed_polls
            ));
            lines.push(format!(
                "stats query latency: max {:.2}ms, mean {:.2}ms, sla {}",
                c.max_query_latency.as_secs_f64() * 1_000.0,
                c.mean_query_latency.as_secs_f64() * 1_000.0,
                if c.sla_met { "met" } else { "missed" }
            ));
        }

        if let Some(d) = &self.duplicate {
            lines.push(format!(
                "duplicate {}: first {:?} {:?}, second {:?} {:?}",
                d.event_id, d.first.class, d.first.http_status, d.second.class, d.second.http_status
            ));
        }

        lines.push(format!("result: {}", if self.passed { "PASS" } else { "FAIL" }));
        lines
    }
}

use hdrhistogram::Histogram;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::error::Result;
use crate::outcome::{Outcome, OutcomeClass};

/// Summary of every outcome received so far.
///
/// `accepted + rate_limited + server_error + transport_error == total`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateReport {
    pub total: u64,
    pub accepted: u64,
    pub rate_limited: u64,
    pub server_error: u64,
    pub transport_error: u64,
    pub events_sent: u64,
    pub events_accepted: u64,
    pub duration_secs: f64,
    pub requests_per_sec: f64,
    pub events_per_sec: f64,
    pub latency_avg_ms: f64,
    pub latency_p50_ms: f64,
    pub latency_p95_ms: f64,
    pub latency_p99_ms: f64,
    pub latency_max_ms: f64,
    /// Responses keyed by HTTP status code.
    pub by_status: BTreeMap<String, u64>,
    /// Transport failures keyed by kind.
    pub by_transport: BTreeMap<String, u64>,
}

impl AggregateReport {
    pub fn is_consistent(&self) -> bool {
        self.accepted + self.rate_limited + self.server_error + self.transport_error == self.total
    }

    pub fn success_rate(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.accepted as f64 * 100.0 / self.total as f64
        }
    }
}

/// Reduces an outcome stream into an [`AggregateReport`]. Outcomes may
/// arrive in any order.
#[derive(Debug)]
pub struct Aggregator {
    started: Instant,
    last_seen: Option<Instant>,
    total: u64,
    accepted: u64,
    rate_limited: u64,
    server_error: u64,
    transport_error: u64,
    events_sent: u64,
    events_accepted: u64,
    by_status: BTreeMap<String, u64>,
    by_transport: BTreeMap<String, u64>,
    latency_us: Histogram<u64>,
    latency_sum_us: u128,
}

impl Aggregator {
    pub fn new() -> Result<Self> {
        Ok(Self {
            started: Instant::now(),
            last_seen: None,
            total: 0,
            accepted: 0,
            rate_limited: 0,
            server_error: 0,
            transport_error: 0,
            events_sent: 0,
            events_accepted: 0,
            by_status: BTreeMap::new(),
            by_transport: BTreeMap::new(),
            latency_us: Histogram::new(3)?,
            latency_sum_us: 0,
        })
    }

    pub fn record(&mut self, outcome: &Outcome) {
        self.total += 1;
        self.events_sent += outcome.events as u64;
        self.last_seen = Some(Instant::now());

        match outcome.class {
            OutcomeClass::Accepted => {
                self.accepted += 1;
                self.events_accepted += outcome.events as u64;
            }
            OutcomeClass::RateLimited => self.rate_limited += 1,
            OutcomeClass::ServerError => self.server_error += 1,
            OutcomeClass::TransportError(kind) => {
                self.transport_error += 1;
                *self.by_transport.entry(kind.to_string()).or_insert(0) += 1;
            }
        }
        if let Some(status) = outcome.http_status {
            *self.by_status.entry(status.to_string()).or_insert(0) += 1;
        }

        let micros = outcome.latency.as_micros();
        self.latency_sum_us += micros;
        self.latency_us.saturating_record((micros as u64).max(1));
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    /// Snapshot of everything recorded so far; valid for partial runs.
    pub fn report(&self) -> AggregateReport {
        let elapsed = self
            .last_seen
            .map(|at| at.saturating_duration_since(self.started))
            .unwrap_or_default();
        let secs = elapsed.as_secs_f64().max(0.001);

        let quantile_ms = |q: f64| {
            if self.latency_us.is_empty() {
                0.0
            } else {
                self.latency_us.value_at_quantile(q) as f64 / 1_000.0
            }
        };
        let latency_avg_ms = if self.total == 0 {
            0.0
        } else {
            (self.latency_sum_us as f64 / self.total as f64) / 1_000.0
        };

        AggregateReport {
            total: self.total,
            accepted: self.accepted,
            rate_limited: self.rate_limited,
            server_error: self.server_error,
            transport_error: self.transport_error,
            events_sent: self.events_sent,
            events_accepted: self.events_accepted,
            duration_secs: elapsed.as_secs_f64(),
            requests_per_sec: self.total as f64 / secs,
            events_per_sec: self.events_sent as f64 / secs,
            latency_avg_ms,
            latency_p50_ms: quantile_ms(0.50),
            latency_p95_ms: quantile_ms(0.95),
            latency_p99_ms: quantile_ms(0.99),
            latency_max_ms: if self.latency_us.is_empty() {
                0.0
            } else {
                self.latency_us.max() as f64 / 1_000.0
            },
            by_status: self.by_status.clone(),
            by_transport: self.by_transport.clone(),
        }
    }

    /// Drain a channel until every sender is gone.
    pub async fn consume(mut self, mut outcomes: mpsc::Receiver<Outcome>) -> Self {
        while let Some(outcome) = outcomes.recv().await {
            self.record(&outcome);
        }
        self
    }
}

//! Adapters for the system under test.
//!
//! [`IngestTarget`] is the seam the dispatch engine talks to; [`StatsSource`]
//! is the seam the convergence poller reads from. The HTTP implementations
//! share one `reqwest::Client`, so the connection pool is shared by every
//! dispatch task.

use serde::Deserialize;
use std::future::Future;
use std::pin::Pin;
use std::time::{Duration, Instant};
use tracing::debug;
use url::Url;

use crate::error::{HarnessError, Result};
use crate::outcome::{Outcome, Payload, Submission, TransportErrorKind};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Something that accepts ingest submissions and answers with an admission
/// status. Implementations must always return exactly one [`Outcome`].
pub trait IngestTarget: Send + Sync {
    fn name(&self) -> &'static str;

    fn submit<'a>(&'a self, submission: &'a Submission) -> BoxFuture<'a, Outcome>;
}

/// Read access to the backend's aggregate event count.
pub trait StatsSource: Send + Sync {
    fn total_events(&self) -> BoxFuture<'_, Result<u64>>;
}

/// Connection settings for [`HttpTarget`].
#[derive(Debug, Clone)]
pub struct HttpTargetOptions {
    pub base_url: String,
    pub api_key: Option<String>,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    /// Upper bound on pooled idle connections; set to the plan's concurrency.
    pub max_connections: usize,
}

impl HttpTargetOptions {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: None,
            connect_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(10),
            max_connections: 64,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StatsResponse {
    total_events: u64,
}

/// HTTP/JSON client for the ingest and stats endpoints.
#[derive(Debug, Clone)]
pub struct HttpTarget {
    client: reqwest::Client,
    events_url: Url,
    batch_url: Url,
    stats_url: Url,
    api_key: Option<String>,
}

impl HttpTarget {
    pub fn new(options: HttpTargetOptions) -> Result<Self> {
        let base = normalize_base(&options.base_url)?;
        let join = |path: &str| {
            base.join(path).map_err(|source| HarnessError::BaseUrl {
                url: options.base_url.clone(),
                source,
            })
        };

        let client = reqwest::Client::builder()
            .connect_timeout(options.connect_timeout)
            .timeout(options.request_timeout)
            .pool_max_idle_per_host(options.max_connections.max(1))
            .build()?;

        Ok(Self {
            client,
            events_url: join("events")?,
            batch_url: join("events/batch")?,
            stats_url: join("dashboard/stats")?,
            api_key: options.api_key,
        })
    }

    pub fn events_url(&self) -> &Url {
        &self.events_url
    }

    pub fn stats_url(&self) -> &Url {
        &self.stats_url
    }

    async fn send(&self, submission: &Submission) -> Outcome {
        let start = Instant::now();
        let request_id = submission.request_id();
        let events = submission.event_count();

        let mut request = match &submission.payload {
            Payload::Single(event) => self.client.post(self.events_url.clone()).json(event),
            Payload::Batch(batch) => self.client.post(self.batch_url.clone()).json(batch),
        };
        if let Some(key) = &submission.source_key {
            request = request.header("X-Forwarded-For", key);
        }
        if let Some(api_key) = &self.api_key {
            request = request.header("X-Api-Key", api_key);
        }

        match request.send().await {
            Ok(response) => {
                let status = response.status().as_u16();
                // Drain the body so the connection returns to the pool.
                if let Err(err) = response.bytes().await {
                    debug!(seq = submission.seq, status, error = %err, "response body read failed");
                }
                Outcome::from_status(submission.seq, request_id, events, status, start.elapsed())
            }
            Err(err) => {
                let kind = classify_transport_error(&err);
                debug!(seq = submission.seq, %kind, error = %err, "request failed");
                Outcome::transport(submission.seq, request_id, events, kind, start.elapsed())
            }
        }
    }

    async fn fetch_total(&self) -> Result<u64> {
        let mut request = self.client.get(self.stats_url.clone());
        if let Some(api_key) = &self.api_key {
            request = request.header("X-Api-Key", api_key);
        }
        let response = request
            .send()
            .await
            .map_err(|e| HarnessError::StatsQuery(format!("GET {}: {e}", self.stats_url)))?;
        if !response.status().is_success() {
            return Err(HarnessError::StatsQuery(format!(
                "GET {} returned {}",
                self.stats_url,
                response.status()
            )));
        }
        let stats: StatsResponse = response
            .json()
            .await
            .map_err(|e| HarnessError::StatsQuery(format!("parse stats body: {e}")))?;
        Ok(stats.total_events)
    }
}

impl IngestTarget for HttpTarget {
    fn name(&self) -> &'static str {
        "http"
    }

    fn submit<'a>(&'a self, submission: &'a Submission) -> BoxFuture<'a, Outcome> {
        Box::pin(self.send(submission))
    }
}

impl StatsSource for HttpTarget {
    fn total_events(&self) -> BoxFuture<'_, Result<u64>> {
        Box::pin(self.fetch_total())
    }
}

fn classify_transport_error(err: &reqwest::Error) -> TransportErrorKind {
    if err.is_timeout() {
        TransportErrorKind::Timeout
    } else if err.is_connect() {
        TransportErrorKind::Connect
    } else {
        TransportErrorKind::Protocol
    }
}

/// Parse the base URL and make sure relative joins append to its path.
fn normalize_base(raw: &str) -> Result<Url> {
    let trimmed = raw.trim().trim_end_matches('/');
    Url::parse(&format!("{trimmed}/")).map_err(|source| HarnessError::BaseUrl {
        url: raw.to_string(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoints_join_under_base_path() {
        let target = HttpTarget::new(HttpTargetOptions::new("http://127.0.0.1:5000/api/")).unwrap();
        assert_eq!(target.events_url().as_str(), "http://127.0.0.1:5000/api/events");
        assert_eq!(target.batch_url.as_str(), "http://127.0.0.1:5000/api/events/batch");
        assert_eq!(target.stats_url().as_str(), "http://127.0.0.1:5000/api/dashboard/stats");
    }

    #[test]
    fn rejects_garbage_base() {
        let err = HttpTarget::new(HttpTargetOptions::new("not a url")).unwrap_err();
        assert!(matches!(err, HarnessError::BaseUrl { .. }));
    }
}

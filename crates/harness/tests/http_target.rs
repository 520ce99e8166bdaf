//! HTTP adapter tests against an in-process axum ingestion service that
//! enforces the expected admission policy per `X-Forwarded-For`.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use parking_lot::Mutex;
use serde_json::json;
use tokio::net::TcpListener;
use tokio::time::Instant;

use loadcheck_harness::{
    batches, duplicate_probe, rate_limit_suite, run_load, single_events, Dispatcher, Event, EventSynthesizer,
    HarnessError, HttpTarget, HttpTargetOptions, IngestTarget, OutcomeClass, PolicyModel, RateLimitOracle,
    RateLimitPolicy, RateLimitScenario, StatsSource, StopSignal, Submission, TestPlan, TransportErrorKind,
};

#[derive(Clone)]
struct MockIngest {
    state: Arc<Mutex<MockState>>,
    api_key: Option<&'static str>,
    stats_broken: bool,
}

struct MockState {
    model: PolicyModel,
    total_events: u64,
}

impl MockIngest {
    fn new(policy: RateLimitPolicy) -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState {
                model: PolicyModel::new(policy),
                total_events: 0,
            })),
            api_key: None,
            stats_broken: false,
        }
    }

    fn admit(&self, headers: &HeaderMap, events: u64) -> StatusCode {
        if let Some(expected) = self.api_key {
            let presented = headers.get("x-api-key").and_then(|v| v.to_str().ok());
            if presented != Some(expected) {
                return StatusCode::UNAUTHORIZED;
            }
        }
        let key = headers
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("local")
            .to_string();

        let mut state = self.state.lock();
        if state.model.admit(&key, Instant::now()).is_accepted() {
            state.total_events += events;
            StatusCode::ACCEPTED
        } else {
            StatusCode::TOO_MANY_REQUESTS
        }
    }
}

async fn ingest(State(mock): State<MockIngest>, headers: HeaderMap, Json(_event): Json<Event>) -> StatusCode {
    mock.admit(&headers, 1)
}

async fn ingest_batch(State(mock): State<MockIngest>, headers: HeaderMap, Json(events): Json<Vec<Event>>) -> StatusCode {
    mock.admit(&headers, events.len() as u64)
}

async fn stats(State(mock): State<MockIngest>) -> Result<Json<serde_json::Value>, StatusCode> {
    if mock.stats_broken {
        return Err(StatusCode::INTERNAL_SERVER_ERROR);
    }
    let total = mock.state.lock().total_events;
    Ok(Json(json!({ "totalEvents": total, "uniqueUsers": 0 })))
}

async fn serve(mock: MockIngest) -> String {
    let app = Router::new()
        .route("/api/events", post(ingest))
        .route("/api/events/batch", post(ingest_batch))
        .route("/api/dashboard/stats", get(stats))
        .with_state(mock);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}/api")
}

fn generous() -> RateLimitPolicy {
    RateLimitPolicy {
        bucket_capacity: 100_000,
        refill_per_sec: 1_000,
        global_limit: 100_000,
        global_window_secs: 60,
        tolerance: 0,
    }
}

fn target(base_url: &str) -> Arc<HttpTarget> {
    Arc::new(HttpTarget::new(HttpTargetOptions::new(base_url)).unwrap())
}

#[tokio::test]
async fn load_run_is_counted_by_stats_endpoint() {
    let base = serve(MockIngest::new(generous())).await;
    let http = target(&base);
    let dispatcher = Dispatcher::new(http.clone());
    let plan = TestPlan::new(120, 16, None, None).unwrap();

    let run = run_load(&dispatcher, &plan, single_events(EventSynthesizer::default()), StopSignal::never())
        .await
        .unwrap();

    assert_eq!(run.aggregate.total, 120);
    assert_eq!(run.aggregate.accepted, 120);
    assert!(run.aggregate.is_consistent());
    assert_eq!(run.aggregate.by_status.get("202"), Some(&120));
    assert!(run.dispatch.peak_in_flight <= 16);
    assert_eq!(http.total_events().await.unwrap(), 120);
}

#[tokio::test]
async fn batches_post_to_batch_endpoint() {
    let base = serve(MockIngest::new(generous())).await;
    let http = target(&base);
    let dispatcher = Dispatcher::new(http.clone());
    let plan = TestPlan::new(5, 2, None, None).unwrap();

    let run = run_load(&dispatcher, &plan, batches(EventSynthesizer::default(), 10), StopSignal::never())
        .await
        .unwrap();

    assert_eq!(run.aggregate.total, 5);
    assert_eq!(run.aggregate.events_accepted, 50);
    assert_eq!(http.total_events().await.unwrap(), 50);
}

#[tokio::test]
async fn missing_api_key_is_a_server_error() {
    let mut mock = MockIngest::new(generous());
    mock.api_key = Some("s3cret");
    let base = serve(mock).await;

    let synth = EventSynthesizer::default();
    let anonymous = target(&base);
    let outcome = anonymous.submit(&Submission::single(0, synth.synthesize(0, None))).await;
    assert_eq!(outcome.class, OutcomeClass::ServerError);
    assert_eq!(outcome.http_status, Some(401));

    let mut options = HttpTargetOptions::new(base.clone());
    options.api_key = Some("s3cret".to_string());
    let keyed = HttpTarget::new(options).unwrap();
    let outcome = keyed.submit(&Submission::single(1, synth.synthesize(1, None))).await;
    assert_eq!(outcome.class, OutcomeClass::Accepted);
}

#[tokio::test]
async fn refused_connection_is_a_transport_error() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let http = target(&format!("http://{addr}/api"));
    let outcome = http
        .submit(&Submission::single(0, EventSynthesizer::default().synthesize(0, None)))
        .await;
    assert_eq!(outcome.class, OutcomeClass::TransportError(TransportErrorKind::Connect));
    assert_eq!(outcome.http_status, None);
}

/// Answers one request with a 202 status line and a body cut short.
async fn serve_truncated_body() -> String {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut request = Vec::new();
        let mut buf = [0u8; 4096];
        loop {
            let n = socket.read(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            request.extend_from_slice(&buf[..n]);
            let text = String::from_utf8_lossy(&request).to_string();
            if let Some(head_end) = text.find("\r\n\r\n") {
                let length = text[..head_end]
                    .lines()
                    .find_map(|line| {
                        let (name, value) = line.split_once(':')?;
                        name.eq_ignore_ascii_case("content-length")
                            .then(|| value.trim().parse::<usize>().ok())
                            .flatten()
                    })
                    .unwrap_or(0);
                if request.len() >= head_end + 4 + length {
                    break;
                }
            }
        }
        socket
            .write_all(b"HTTP/1.1 202 Accepted\r\nContent-Length: 100\r\n\r\n{\"ok\"")
            .await
            .unwrap();
        socket.shutdown().await.unwrap();
    });
    format!("http://{addr}/api")
}

#[tokio::test]
async fn truncated_body_keeps_status_classification() {
    let base = serve_truncated_body().await;
    let outcome = target(&base)
        .submit(&Submission::single(0, EventSynthesizer::default().synthesize(0, None)))
        .await;

    assert_eq!(outcome.class, OutcomeClass::Accepted);
    assert_eq!(outcome.http_status, Some(202));
}

#[tokio::test]
async fn broken_stats_endpoint_reports_query_error() {
    let mut mock = MockIngest::new(generous());
    mock.stats_broken = true;
    let base = serve(mock).await;

    let err = target(&base).total_events().await.unwrap_err();
    assert!(matches!(err, HarnessError::StatsQuery(_)));
}

#[tokio::test]
async fn rate_limit_suite_against_live_policy() {
    let policy = RateLimitPolicy {
        bucket_capacity: 10,
        refill_per_sec: 4,
        global_limit: 10_000,
        global_window_secs: 60,
        tolerance: 2,
    };
    let base = serve(MockIngest::new(policy.clone())).await;
    let oracle = RateLimitOracle::new(policy).unwrap();
    let scenario = RateLimitScenario {
        burst: 20,
        global_requests: Some(40),
        global_concurrency: 8,
        ..RateLimitScenario::default()
    };

    let run = rate_limit_suite(
        target(&base),
        &oracle,
        &EventSynthesizer::default(),
        &scenario,
        StopSignal::never(),
    )
    .await
    .unwrap();

    assert_eq!(run.verdicts.len(), 3);
    assert!(run.passed(), "verdicts: {:#?}", run.verdicts);
    let recovery = run.recovery.expect("recovery probe ran");
    assert_eq!(recovery.immediate, OutcomeClass::RateLimited);
    assert_eq!(recovery.after_wait, OutcomeClass::Accepted);
    assert!(recovery.waited >= Duration::from_millis(2_400));
}

#[tokio::test]
async fn duplicate_ids_each_get_an_admission_answer() {
    let base = serve(MockIngest::new(generous())).await;
    let http = target(&base);

    let probe = duplicate_probe(http.as_ref(), &EventSynthesizer::default(), Some("198.51.100.7")).await;

    assert!(probe.passed());
    assert_eq!(probe.first.request_id, probe.second.request_id);
    assert_eq!(probe.first.http_status, Some(202));
    assert_eq!(probe.second.http_status, Some(202));
    assert_eq!(http.total_events().await.unwrap(), 2);
}

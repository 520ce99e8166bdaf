use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::event::Event;

/// Why a request never produced an HTTP status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportErrorKind {
    Connect,
    Timeout,
    Protocol,
    /// The run was stopped while the request was outstanding.
    Cancelled,
}

impl fmt::Display for TransportErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TransportErrorKind::Connect => "connect",
            TransportErrorKind::Timeout => "timeout",
            TransportErrorKind::Protocol => "protocol",
            TransportErrorKind::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Terminal classification of one dispatched request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "class", content = "kind", rename_all = "snake_case")]
pub enum OutcomeClass {
    Accepted,
    RateLimited,
    ServerError,
    TransportError(TransportErrorKind),
}

impl OutcomeClass {
    /// 2xx -> accepted, 429 -> rate limited, anything else -> server error.
    pub fn from_status(status: u16) -> Self {
        match status {
            200..=299 => OutcomeClass::Accepted,
            429 => OutcomeClass::RateLimited,
            _ => OutcomeClass::ServerError,
        }
    }

    pub fn is_admission_response(&self) -> bool {
        matches!(self, OutcomeClass::Accepted | OutcomeClass::RateLimited)
    }
}

/// The classified result of one dispatched request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Outcome {
    /// Dispatch sequence number.
    pub seq: u64,
    /// Identifier of the submitted event (first event for batches).
    pub request_id: String,
    pub class: OutcomeClass,
    pub http_status: Option<u16>,
    /// Events carried by the request.
    pub events: u32,
    pub latency: Duration,
    /// Completion time, milliseconds since the Unix epoch.
    pub completed_at_ms: u64,
}

impl Outcome {
    pub fn from_status(seq: u64, request_id: String, events: u32, status: u16, latency: Duration) -> Self {
        Self {
            seq,
            request_id,
            class: OutcomeClass::from_status(status),
            http_status: Some(status),
            events,
            latency,
            completed_at_ms: now_ms(),
        }
    }

    pub fn transport(
        seq: u64,
        request_id: String,
        events: u32,
        kind: TransportErrorKind,
        latency: Duration,
    ) -> Self {
        Self {
            seq,
            request_id,
            class: OutcomeClass::TransportError(kind),
            http_status: None,
            events,
            latency,
            completed_at_ms: now_ms(),
        }
    }
}

/// Request body for one dispatch.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Single(Event),
    Batch(Vec<Event>),
}

/// One unit of work handed to the dispatch engine.
#[derive(Debug, Clone, PartialEq)]
pub struct Submission {
    pub seq: u64,
    pub payload: Payload,
    /// Simulated client identity, sent as `X-Forwarded-For`.
    pub source_key: Option<String>,
}

impl Submission {
    pub fn single(seq: u64, event: Event) -> Self {
        Self {
            seq,
            payload: Payload::Single(event),
            source_key: None,
        }
    }

    pub fn batch(seq: u64, events: Vec<Event>) -> Self {
        Self {
            seq,
            payload: Payload::Batch(events),
            source_key: None,
        }
    }

    pub fn from_key(mut self, key: impl Into<String>) -> Self {
        self.source_key = Some(key.into());
        self
    }

    pub fn event_count(&self) -> u32 {
        match &self.payload {
            Payload::Single(_) => 1,
            Payload::Batch(events) => events.len() as u32,
        }
    }

    pub fn request_id(&self) -> String {
        match &self.payload {
            Payload::Single(event) => event.event_id.clone(),
            Payload::Batch(events) => events
                .first()
                .map(|e| e.event_id.clone())
                .unwrap_or_else(|| format!("batch-{}", self.seq)),
        }
    }
}

/// Distinct per-key identity for index `i`, rotating through `10.x.y.z`.
pub fn distinct_source_key(i: u64) -> String {
    format!("10.{}.{}.{}", (i >> 16) & 0xff, (i >> 8) & 0xff, i & 0xff)
}

pub(crate) fn now_ms() -> u64 {
    Utc::now().timestamp_millis().max(0) as u64
}

use thiserror::Error;

/// Errors raised by the harness itself.
///
/// Per-request failures never surface here: they are captured as
/// [`crate::outcome::Outcome`] values and aggregated. Only setup-time
/// problems and stats queries use this type.
#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("invalid test plan: {0}")]
    InvalidPlan(String),
    #[error("invalid rate-limit policy: {0}")]
    InvalidPolicy(String),
    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),
    #[error("invalid base url {url}: {source}")]
    BaseUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },
    #[error("http client error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("stats query failed: {0}")]
    StatsQuery(String),
    #[error("latency histogram error: {0}")]
    Histogram(#[from] hdrhistogram::CreationError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, HarnessError>;

//! Layered harness configuration.
//!
//! Built-in defaults, then an optional TOML file, then `LOADCHECK_*`
//! environment variables. Nested keys use a double underscore, e.g.
//! `LOADCHECK_LOAD__CONCURRENCY=64` or `LOADCHECK_POLICY__BUCKET_CAPACITY=50`.
//! Command-line flags are applied on top by the binary.

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::convergence::ConvergenceConfig;
use crate::error::Result;
use crate::event::EventSynthesizer;
use crate::plan::TestPlan;
use crate::policy::RateLimitPolicy;
use crate::scenario::RateLimitScenario;
use crate::target::HttpTargetOptions;

pub const ENV_PREFIX: &str = "LOADCHECK";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoadSettings {
    /// Requests to dispatch; 0 with a rate means `rate * duration`.
    pub total: u64,
    pub concurrency: usize,
    /// Requests per second; unset selects the bounded-queue mode.
    pub rate: Option<u32>,
    pub duration_secs: Option<u64>,
    /// Events per request in batch mode.
    pub batch_size: usize,
    pub progress_interval_ms: u64,
}

impl Default for LoadSettings {
    fn default() -> Self {
        Self {
            total: 1_000,
            concurrency: 50,
            rate: None,
            duration_secs: None,
            batch_size: 100,
            progress_interval_ms: 1_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitSettings {
    pub burst: u64,
    pub burst_key: String,
    pub recovery: bool,
    /// Run the global-window check.
    pub global: bool,
    /// Requests for the global-window check; unset means 120% of the
    /// expected global limit.
    pub global_requests: Option<u64>,
    pub global_concurrency: usize,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        let scenario = RateLimitScenario::default();
        Self {
            burst: scenario.burst,
            burst_key: scenario.burst_key,
            recovery: scenario.recovery,
            global: true,
            global_requests: scenario.global_requests,
            global_concurrency: scenario.global_concurrency,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConvergenceSettings {
    pub poll_interval_ms: u64,
    pub deadline_secs: u64,
    pub query_timeout_ms: u64,
    pub sla_ms: u64,
}

impl Default for ConvergenceSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: 2_000,
            deadline_secs: 60,
            query_timeout_ms: 5_000,
            sla_ms: 50,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SynthSettings {
    pub tenants: Vec<String>,
    pub source: String,
    /// Back-date `createdAt` to probe late-arrival handling.
    pub backdate_secs: Option<u64>,
}

impl Default for SynthSettings {
    fn default() -> Self {
        Self {
            tenants: vec!["tenant-loadtest".to_string()],
            source: "loadcheck".to_string(),
            backdate_secs: None,
        }
    }
}

/// Fully resolved configuration. Read-only once loaded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HarnessConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub connect_timeout_ms: u64,
    pub request_timeout_ms: u64,
    pub report_path: Option<PathBuf>,
    pub load: LoadSettings,
    pub policy: RateLimitPolicy,
    pub rate_limit: RateLimitSettings,
    pub convergence: ConvergenceSettings,
    pub synth: SynthSettings,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:3000/api".to_string(),
            api_key: None,
            connect_timeout_ms: 5_000,
            request_timeout_ms: 10_000,
            report_path: None,
            load: LoadSettings::default(),
            policy: RateLimitPolicy::default(),
            rate_limit: RateLimitSettings::default(),
            convergence: ConvergenceSettings::default(),
            synth: SynthSettings::default(),
        }
    }
}

impl HarnessConfig {
    /// Load from defaults, `path` and the process environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        Self::from_sources(path, environment())
    }

    /// Same layering with an explicit environment source.
    pub fn from_sources(path: Option<&Path>, env: Environment) -> Result<Self> {
        let mut builder = Config::builder().add_source(Config::try_from(&HarnessConfig::default())?);
        if let Some(path) = path {
            builder = builder.add_source(File::from(path));
        }
        let config: HarnessConfig = builder.add_source(env).build()?.try_deserialize()?;
        config.policy.validate()?;
        Ok(config)
    }

    pub fn plan(&self) -> Result<TestPlan> {
        Ok(TestPlan::new(
            self.load.total,
            self.load.concurrency,
            self.load.rate,
            self.load.duration_secs.map(Duration::from_secs),
        )?
        .with_request_timeout(Duration::from_millis(self.request_timeout_ms))
        .with_progress_interval(Duration::from_millis(self.load.progress_interval_ms)))
    }

    pub fn http_options(&self) -> HttpTargetOptions {
        let mut options = HttpTargetOptions::new(self.base_url.clone());
        options.api_key = self.api_key.clone();
        options.connect_timeout = Duration::from_millis(self.connect_timeout_ms);
        options.request_timeout = Duration::from_millis(self.request_timeout_ms);
        options.max_connections = self.load.concurrency.max(self.rate_limit.global_concurrency);
        options
    }

    pub fn synthesizer(&self) -> EventSynthesizer {
        let synth = EventSynthesizer::new(self.synth.tenants.clone()).with_source(self.synth.source.clone());
        match self.synth.backdate_secs {
            Some(secs) => synth.with_backdate(Duration::from_secs(secs)),
            None => synth,
        }
    }

    pub fn convergence_config(&self) -> ConvergenceConfig {
        ConvergenceConfig {
            poll_interval: Duration::from_millis(self.convergence.poll_interval_ms),
            deadline: Duration::from_secs(self.convergence.deadline_secs),
            query_timeout: Duration::from_millis(self.convergence.query_timeout_ms),
            sla: Duration::from_millis(self.convergence.sla_ms),
        }
    }

    /// Requests for the global-window check, or `None` when it is disabled.
    pub fn global_requests(&self) -> Option<u64> {
        if !self.rate_limit.global {
            return None;
        }
        let limit = self.policy.global_limit as u64;
        Some(self.rate_limit.global_requests.unwrap_or(limit + limit / 5))
    }

    pub fn rate_limit_scenario(&self) -> RateLimitScenario {
        RateLimitScenario {
            burst: self.rate_limit.burst,
            burst_key: self.rate_limit.burst_key.clone(),
            recovery: self.rate_limit.recovery,
            global_requests: self.global_requests(),
            global_concurrency: self.rate_limit.global_concurrency.max(1),
            request_timeout: Duration::from_millis(self.request_timeout_ms),
        }
    }
}

fn environment() -> Environment {
    Environment::with_prefix(ENV_PREFIX)
        .prefix_separator("_")
        .separator("__")
        .try_parsing(true)
}

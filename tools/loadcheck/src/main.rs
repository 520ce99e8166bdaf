use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use loadcheck_harness::{
    batches, convergence_check, duplicate_probe, rate_limit_suite, run_load, single_events, stop_signal,
    ConvergencePoller, Dispatcher, HarnessConfig, HttpTarget, IngestTarget, RateLimitOracle, RunReport,
    SimulatedGateway, SimulatedOptions, StatsSource, StopSignal,
};

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Cli {
    /// TOML configuration file. `LOADCHECK_*` environment variables override it.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// System under test.
    #[arg(long, global = true, value_enum, default_value_t = TargetKind::Http)]
    target: TargetKind,

    /// Ingestion API base URL (e.g. http://localhost:3000/api).
    #[arg(long, global = true)]
    base_url: Option<String>,

    /// Sent as `X-Api-Key` on every request.
    #[arg(long, global = true)]
    api_key: Option<String>,

    /// Write the JSON report here.
    #[arg(long, global = true)]
    report: Option<PathBuf>,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum TargetKind {
    /// Real ingestion API over HTTP.
    Http,
    /// In-process gateway enforcing the configured policy.
    Simulated,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Single-event load with bounded concurrency, optionally paced.
    Load(LoadArgs),
    /// Batched load against the batch endpoint.
    Batch(BatchArgs),
    /// Burst, recovery and global-window checks against the admission policy.
    RateLimit(RateLimitArgs),
    /// Load followed by polling the stats endpoint until the count converges.
    Converge(ConvergeArgs),
    /// Submit the same event identifier twice.
    Duplicate(DuplicateArgs),
    /// Print the resolved configuration and oracle expectations; sends nothing.
    Plan,
}

#[derive(Debug, Args, Clone)]
struct LoadArgs {
    /// Requests to send (0 with --rate means rate * duration)
    #[arg(long)]
    total: Option<u64>,
    /// Maximum requests in flight
    #[arg(long)]
    concurrency: Option<usize>,
    /// Requests started per second; selects paced mode
    #[arg(long)]
    rate: Option<u32>,
    /// Issue window in seconds
    #[arg(long)]
    duration: Option<u64>,
    /// Back-date createdAt by this many seconds
    #[arg(long)]
    backdate: Option<u64>,
}

#[derive(Debug, Args, Clone)]
struct BatchArgs {
    #[command(flatten)]
    load: LoadArgs,
    /// Events per request
    #[arg(long)]
    batch_size: Option<usize>,
}

#[derive(Debug, Args, Clone)]
struct RateLimitArgs {
    /// Requests fired at once from one key
    #[arg(long)]
    burst: Option<u64>,
    /// Requests across distinct keys for the global-window check
    #[arg(long)]
    global_requests: Option<u64>,
    /// Skip the bucket recovery probe
    #[arg(long)]
    no_recovery: bool,
    /// Skip the global-window check
    #[arg(long)]
    no_global: bool,
    /// Expected per-key bucket capacity
    #[arg(long)]
    capacity: Option<u32>,
    /// Expected per-key refill, tokens per second
    #[arg(long)]
    refill: Option<u32>,
    /// Expected global limit per window
    #[arg(long)]
    global_limit: Option<u32>,
    /// Accepted slack around the model's counts
    #[arg(long)]
    tolerance: Option<u32>,
}

#[derive(Debug, Args, Clone)]
struct ConvergeArgs {
    #[command(flatten)]
    load: LoadArgs,
    /// Send batches of this size instead of single events
    #[arg(long)]
    batch_size: Option<usize>,
    /// Milliseconds between stats polls
    #[arg(long)]
    poll_interval_ms: Option<u64>,
    /// Give up after this many seconds
    #[arg(long)]
    deadline: Option<u64>,
}

#[derive(Debug, Args, Clone)]
struct DuplicateArgs {
    /// Source identity for both submissions
    #[arg(long)]
    key: Option<String>,
}

struct Targets {
    ingest: Arc<dyn IngestTarget>,
    stats: Arc<dyn StatsSource>,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();
}

fn apply_load(config: &mut HarnessConfig, args: &LoadArgs) {
    if let Some(total) = args.total {
        config.load.total = total;
    }
    if let Some(concurrency) = args.concurrency {
        config.load.concurrency = concurrency;
    }
    if args.rate.is_some() {
        config.load.rate = args.rate;
    }
    if args.duration.is_some() {
        config.load.duration_secs = args.duration;
    }
    if args.backdate.is_some() {
        config.synth.backdate_secs = args.backdate;
    }
}

fn apply_rate_limit(config: &mut HarnessConfig, args: &RateLimitArgs) {
    if let Some(burst) = args.burst {
        config.rate_limit.burst = burst;
    }
    if args.global_requests.is_some() {
        config.rate_limit.global_requests = args.global_requests;
    }
    if args.no_recovery {
        config.rate_limit.recovery = false;
    }
    if args.no_global {
        config.rate_limit.global = false;
    }
    if let Some(capacity) = args.capacity {
        config.policy.bucket_capacity = capacity;
    }
    if let Some(refill) = args.refill {
        config.policy.refill_per_sec = refill;
    }
    if let Some(limit) = args.global_limit {
        config.policy.global_limit = limit;
    }
    if let Some(tolerance) = args.tolerance {
        config.policy.tolerance = tolerance;
    }
}

fn resolve(cli: &Cli) -> Result<HarnessConfig> {
    let mut config = HarnessConfig::load(cli.config.as_deref()).context("load configuration")?;
    if let Some(url) = &cli.base_url {
        config.base_url = url.clone();
    }
    if cli.api_key.is_some() {
        config.api_key = cli.api_key.clone();
    }
    if cli.report.is_some() {
        config.report_path = cli.report.clone();
    }

    match &cli.cmd {
        Command::Load(args) => apply_load(&mut config, args),
        Command::Batch(args) => {
            apply_load(&mut config, &args.load);
            if let Some(size) = args.batch_size {
                config.load.batch_size = size;
            }
        }
        Command::RateLimit(args) => apply_rate_limit(&mut config, args),
        Command::Converge(args) => {
            apply_load(&mut config, &args.load);
            if let Some(size) = args.batch_size {
                config.load.batch_size = size;
            }
            if let Some(ms) = args.poll_interval_ms {
                config.convergence.poll_interval_ms = ms;
            }
            if let Some(secs) = args.deadline {
                config.convergence.deadline_secs = secs;
            }
        }
        Command::Duplicate(_) | Command::Plan => {}
    }
    config.policy.validate().context("rate-limit policy")?;
    Ok(config)
}

fn targets(kind: TargetKind, config: &HarnessConfig) -> Result<Targets> {
    match kind {
        TargetKind::Http => {
            let http = Arc::new(HttpTarget::new(config.http_options()).context("build http client")?);
            info!(events = %http.events_url(), stats = %http.stats_url(), "http target");
            Ok(Targets {
                ingest: http.clone(),
                stats: http,
            })
        }
        TargetKind::Simulated => {
            let gateway = Arc::new(SimulatedGateway::new(SimulatedOptions {
                policy: config.policy.clone(),
                ..SimulatedOptions::default()
            }));
            Ok(Targets {
                ingest: gateway.clone(),
                stats: gateway,
            })
        }
    }
}

fn interruptible() -> StopSignal {
    let (handle, signal) = stop_signal();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, cancelling outstanding requests");
            handle.stop();
        }
    });
    signal
}

fn print_plan(config: &HarnessConfig) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(config)?);

    let plan = config.plan()?;
    println!("mode: {:?}, planned requests: {}", plan.mode(), plan.planned_total());

    let oracle = RateLimitOracle::new(config.policy.clone())?;
    let burst = oracle.expect_burst(config.rate_limit.burst, Duration::ZERO);
    println!(
        "burst of {}: accepted {}..={}, rejected {}..={}",
        burst.requests, burst.accepted_min, burst.accepted_max, burst.rejected_min, burst.rejected_max
    );
    println!(
        "recovery wait after {} tokens: {:?}",
        config.policy.bucket_capacity,
        oracle.required_recovery_wait(config.policy.bucket_capacity as u64)
    );
    if let Some(requests) = config.global_requests() {
        let global = oracle.expect_global(requests, Duration::ZERO);
        println!(
            "global window with {} requests: rejected at least {}",
            global.requests, global.rejected_min
        );
    }
    Ok(())
}

async fn execute(cli: &Cli, config: &HarnessConfig) -> Result<RunReport> {
    let targets = targets(cli.target, config)?;
    let target_name = targets.ingest.name();
    let dispatcher = Dispatcher::new(targets.ingest.clone());
    let synth = config.synthesizer();
    let stop = interruptible();

    let report = match &cli.cmd {
        Command::Load(_) => {
            let plan = config.plan()?;
            let load = run_load(&dispatcher, &plan, single_events(synth), stop).await?;
            RunReport::new("load", target_name).with_plan(plan).with_load(load)
        }
        Command::Batch(_) => {
            let plan = config.plan()?;
            let load = run_load(&dispatcher, &plan, batches(synth, config.load.batch_size), stop).await?;
            RunReport::new("batch", target_name).with_plan(plan).with_load(load)
        }
        Command::RateLimit(_) => {
            let oracle = RateLimitOracle::new(config.policy.clone())?;
            let run = rate_limit_suite(
                targets.ingest.clone(),
                &oracle,
                &synth,
                &config.rate_limit_scenario(),
                stop,
            )
            .await?;
            RunReport::new("rate-limit", target_name).with_rate_limit(run)
        }
        Command::Converge(args) => {
            let plan = config.plan()?;
            let poller = ConvergencePoller::new(targets.stats.clone(), config.convergence_config());
            let (load, result) = match args.batch_size {
                Some(size) => convergence_check(&dispatcher, &poller, &plan, batches(synth, size), stop).await?,
                None => convergence_check(&dispatcher, &poller, &plan, single_events(synth), stop).await?,
            };
            RunReport::new("converge", target_name)
                .with_plan(plan)
                .with_load(load)
                .with_convergence(result)
        }
        Command::Duplicate(args) => {
            let probe = duplicate_probe(targets.ingest.as_ref(), &synth, args.key.as_deref()).await;
            RunReport::new("duplicate", target_name).with_duplicate(probe)
        }
        Command::Plan => RunReport::new("plan", target_name),
    };
    Ok(report.finish())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = resolve(&cli)?;

    if matches!(cli.cmd, Command::Plan) {
        return print_plan(&config);
    }

    let report = execute(&cli, &config).await?;
    for line in report.summary_lines() {
        println!("{line}");
    }
    if let Some(path) = &config.report_path {
        report
            .write_json(path)
            .with_context(|| format!("write report to {}", path.display()))?;
    }

    if !report.passed() {
        bail!("{} checks failed", report.scenario);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn flags_override_configuration() {
        let cli = Cli::parse_from([
            "loadcheck",
            "--base-url",
            "http://staging:3000/api",
            "batch",
            "--total",
            "40",
            "--concurrency",
            "4",
            "--batch-size",
            "25",
        ]);
        let config = resolve(&cli).unwrap();
        assert_eq!(config.base_url, "http://staging:3000/api");
        assert_eq!(config.load.total, 40);
        assert_eq!(config.load.concurrency, 4);
        assert_eq!(config.load.batch_size, 25);
    }

    #[test]
    fn rate_limit_flags_reshape_policy() {
        let cli = Cli::parse_from([
            "loadcheck",
            "--target",
            "simulated",
            "rate-limit",
            "--capacity",
            "50",
            "--refill",
            "5",
            "--no-recovery",
        ]);
        let config = resolve(&cli).unwrap();
        assert_eq!(cli.target, TargetKind::Simulated);
        assert_eq!(config.policy.bucket_capacity, 50);
        assert_eq!(config.policy.refill_per_sec, 5);
        assert!(!config.rate_limit.recovery);
    }

    #[test]
    fn global_check_can_be_disabled() {
        let default = resolve(&Cli::parse_from(["loadcheck", "rate-limit", "--global-limit", "200"])).unwrap();
        assert_eq!(default.rate_limit_scenario().global_requests, Some(240));

        let skipped = resolve(&Cli::parse_from(["loadcheck", "rate-limit", "--no-global"])).unwrap();
        assert_eq!(skipped.rate_limit_scenario().global_requests, None);
    }

    #[test]
    fn zero_refill_is_rejected_before_any_traffic() {
        let cli = Cli::parse_from(["loadcheck", "rate-limit", "--refill", "0"]);
        assert!(resolve(&cli).is_err());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn simulated_load_produces_passing_report() {
        let cli = Cli::parse_from(["loadcheck", "--target", "simulated", "load", "--total", "20", "--concurrency", "5"]);
        let config = resolve(&cli).unwrap();
        let report = execute(&cli, &config).await.unwrap();
        assert!(report.passed());
        assert_eq!(report.load.as_ref().map(|l| l.aggregate.total), Some(20));
    }
}

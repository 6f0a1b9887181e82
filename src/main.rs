//! CLI entry point for the rail buffer tool.
//!
//! Provides subcommands for collecting arrival delays from the historical
//! performance service, building the percentile table, querying buffers,
//! and uploading results to S3.

use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use rail_buffer::analyzers::coverage::monotonicity_violations;
use rail_buffer::analyzers::{PercentileEngine, RiskQuery};
use rail_buffer::config::{API_KEY_ENV, CollectorConfig};
use rail_buffer::fetch::auth::ApiKey;
use rail_buffer::fetch::{BasicClient, HspClient, RateBudget, RetryingFetcher};
use rail_buffer::ingest::archive::load_daily_archives;
use rail_buffer::ingest::{
    CollectionState, ErrorBreakdown, IngestError, IngestOrchestrator, KeyStatus, load_slice_logs,
    plan_collection,
};
use rail_buffer::model::{Route, TimeWindow};
use rail_buffer::output::{find_group, load_table, print_json, write_table};
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{
    EnvFilter, Layer,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

#[derive(Parser)]
#[command(name = "rail_buffer")]
#[command(about = "Collects train arrival delays and recommends journey buffers", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Collect delays for every configured (route, date, window)
    Collect {
        /// JSON collector config. Without one, both dates must be given.
        #[arg(short, long)]
        config: Option<String>,

        #[arg(long, required_unless_present = "config")]
        date_start: Option<NaiveDate>,

        #[arg(long, required_unless_present = "config")]
        date_end: Option<NaiveDate>,

        /// Route as ORIGIN,DEST. Repeat to collect several.
        #[arg(long = "route", value_parser = Route::parse)]
        routes: Vec<Route>,

        /// Window as HHMM,HHMM (inclusive). Repeat to collect several.
        #[arg(long = "window", value_parser = TimeWindow::parse_pair)]
        windows: Vec<TimeWindow>,

        #[arg(long)]
        row_cap: Option<usize>,

        /// Services looked up per key; larger listings are sampled
        #[arg(long)]
        rid_cap: Option<usize>,

        /// Record the planned keys as pending and exit without fetching
        #[arg(long, default_value_t = false)]
        plan_only: bool,
    },
    /// Report collection progress, failed keys and slice errors by class
    Status {
        #[arg(short, long)]
        config: String,
    },
    /// Build the percentile table from the per-day archives
    Percentiles {
        #[arg(short, long, default_value = "data/daily")]
        input_dir: PathBuf,

        #[arg(short, long, default_value = "data/route_hour_p80_p90_p95.csv")]
        output: PathBuf,

        #[arg(long, default_value_t = 3)]
        min_observations: usize,
    },
    /// Recommend a buffer for one route, hour and day of week
    Buffer {
        #[arg(short, long, default_value = "data/route_hour_p80_p90_p95.csv")]
        table: PathBuf,

        #[arg(long)]
        origin: String,

        #[arg(long)]
        destination: String,

        #[arg(long, value_parser = clap::value_parser!(u8).range(0..=23))]
        hour: u8,

        /// 0 = Monday .. 6 = Sunday
        #[arg(long, value_parser = clap::value_parser!(u8).range(0..=6))]
        day_of_week: u8,

        /// Risk tolerance as a percentile, 80 to 99
        #[arg(long)]
        risk: f64,

        #[arg(long)]
        floor: Option<f64>,

        #[arg(long)]
        cap: Option<f64>,
    },
    /// Upload per-day archives and the percentile table to S3
    Publish {
        #[arg(short = 'd', long, default_value = "data")]
        output_root: PathBuf,

        /// S3 bucket name to upload to (e.g., "my-bucket")
        #[arg(long)]
        s3_bucket: String,

        /// Key prefix inside the bucket
        #[arg(long, default_value = "")]
        prefix: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok(); // Load .env file

    // Logging setup: colored stderr + JSON rolling log file
    let log_file_path =
        std::env::var("LOG_FILE_PATH").unwrap_or_else(|_| "logs/rail_buffer.log".to_string());
    let log_dir = Path::new(&log_file_path)
        .parent()
        .unwrap_or(Path::new("logs"));
    let log_file_name = Path::new(&log_file_path)
        .file_name()
        .unwrap_or(OsStr::new("rail_buffer.log"));

    let file_appender = tracing_appender::rolling::daily(log_dir, log_file_name);
    let (non_blocking_file, _file_guard) = tracing_appender::non_blocking(file_appender);

    let stderr_layer = fmt::layer()
        .with_target(true)
        .with_span_events(FmtSpan::CLOSE)
        .with_ansi(true)
        .with_writer(std::io::stderr)
        .with_filter(EnvFilter::from_env("RUST_LOG").add_directive("info".parse()?));

    let json_layer = fmt::layer()
        .json()
        .with_current_span(true)
        .with_span_list(true)
        .with_writer(non_blocking_file)
        .with_filter(EnvFilter::from_env("RUST_LOG_JSON").add_directive("debug".parse()?));

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Collect {
            config,
            date_start,
            date_end,
            routes,
            windows,
            row_cap,
            rid_cap,
            plan_only,
        } => {
            let mut config = match (config, date_start, date_end) {
                (Some(path), _, _) => CollectorConfig::load(&path)?,
                (None, Some(start), Some(end)) => CollectorConfig::new(start, end),
                (None, _, _) => anyhow::bail!("--date-start and --date-end are required without --config"),
            };
            if let Some(date) = date_start {
                config.date_start = date;
            }
            if let Some(date) = date_end {
                config.date_end = date;
            }
            if !routes.is_empty() {
                config.routes = routes;
            }
            if !windows.is_empty() {
                config.time_windows = windows;
            }
            if let Some(cap) = row_cap {
                config.row_cap = cap;
            }
            if rid_cap.is_some() {
                config.rid_cap_per_slice = rid_cap;
            }
            config.validate()?;

            if plan_only {
                plan_collection(&config)?;
            } else {
                collect(config).await?;
            }
        }
        Commands::Status { config } => {
            let config = CollectorConfig::load(&config)?;
            status(&config)?;
        }
        Commands::Percentiles {
            input_dir,
            output,
            min_observations,
        } => {
            let records = load_daily_archives(&input_dir)?;
            info!(records = records.len(), input_dir = %input_dir.display(), "Loaded daily archives");

            let groups = PercentileEngine::new(min_observations).build(&records);
            write_table(&output, &groups)?;
            info!(groups = groups.len(), output = %output.display(), "Percentile table written");

            let violations = monotonicity_violations(&groups);
            for group in &violations {
                warn!(
                    route = %group.route(),
                    hour = group.hour,
                    day_of_week = group.day_of_week,
                    p80 = group.p80,
                    p90 = group.p90,
                    p95 = group.p95,
                    "Percentiles out of order"
                );
            }
            if !violations.is_empty() {
                anyhow::bail!("{} percentile group(s) violate p80 <= p90 <= p95", violations.len());
            }
        }
        Commands::Buffer {
            table,
            origin,
            destination,
            hour,
            day_of_week,
            risk,
            floor,
            cap,
        } => {
            let query = RiskQuery::new(risk)?.with_bounds(floor, cap)?;
            let groups = load_table(&table)?;
            let route = Route::new(&origin, &destination);

            let Some(group) = find_group(&groups, &route, hour, day_of_week) else {
                anyhow::bail!(
                    "no percentile group for {route} at hour {hour}, day {day_of_week} in '{}'",
                    table.display()
                );
            };

            let minutes = query.resolve(group);
            info!(
                route = %route,
                hour,
                day_of_week,
                risk,
                observations = group.observation_count,
                minutes,
                "Buffer recommendation"
            );
            println!("{minutes:.1}");
        }
        Commands::Publish {
            output_root,
            s3_bucket,
            prefix,
        } => {
            if s3_bucket.is_empty() {
                info!("S3 bucket not specified, skipping upload");
            } else {
                let aws = aws_config::load_from_env().await;
                let s3 = aws_sdk_s3::Client::new(&aws);
                rail_buffer::publish::publish(&s3, &s3_bucket, &output_root, &prefix).await?;
            }
        }
    }

    Ok(())
}

/// Runs the orchestrator. Fails when any key failed or the coverage check
/// did not pass.
#[tracing::instrument(skip(config), fields(date_start = %config.date_start, date_end = %config.date_end))]
async fn collect(config: CollectorConfig) -> Result<()> {
    let api_key = std::env::var(API_KEY_ENV).with_context(|| format!("{API_KEY_ENV} must be set"))?;

    let http = ApiKey::service_key(BasicClient::new(config.request_timeout())?, &api_key)?;
    let client = HspClient::new(http, &config.base_url, &config.user_agent)?;
    let budget = Arc::new(RateBudget::new(
        config.max_in_flight,
        config.requests_per_second,
        config.burst,
    ));
    let fetcher = RetryingFetcher::new(client, config.retry.clone(), budget);
    let mut orchestrator = IngestOrchestrator::new(config, fetcher)?;

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    let summary = match orchestrator.run(shutdown).await {
        Ok(summary) => summary,
        Err(IngestError::Auth { key, failure }) => {
            anyhow::bail!("upstream rejected credentials (key {key}): {failure}; check {API_KEY_ENV}");
        }
        Err(IngestError::Other(e)) => return Err(e),
    };

    summary.log();
    print_json(&summary)?;

    if summary.cancelled {
        warn!(abandoned = summary.abandoned, "Run interrupted; re-run to resume");
    }
    if !summary.is_clean() {
        anyhow::bail!(
            "collection incomplete: {} failed key(s), coverage passed: {}",
            summary.failed,
            summary.coverage.as_ref().is_some_and(|c| c.passed)
        );
    }
    Ok(())
}

/// Logs per-status key counts and every failed key.
fn status(config: &CollectorConfig) -> Result<()> {
    let state = CollectionState::load(&config.state_path)?;
    let planned = config.fetch_keys();
    let unseen = planned.iter().filter(|k| state.get(k).is_none()).count();

    for (status, count) in state.counts() {
        info!(status = status.as_str(), count, "Keys");
    }
    info!(planned = planned.len(), unseen, "Configured keys");

    let mut failed = 0;
    for (key, record) in state.failed() {
        failed += 1;
        warn!(
            key,
            kind = record.failure_kind.as_deref().unwrap_or("unknown"),
            attempts = record.attempts,
            error = record.last_error.as_deref().unwrap_or(""),
            "Failed key"
        );
    }

    let in_progress = state.counts().get(&KeyStatus::InProgress).copied().unwrap_or(0);
    if failed > 0 || in_progress > 0 {
        info!(failed, in_progress, "Re-run collect to retry these keys");
    }

    let breakdown = ErrorBreakdown::from_logs(&load_slice_logs(&config.slice_log_dir())?);
    info!(
        slices = breakdown.slices,
        ok = breakdown.ok,
        failed = breakdown.failed,
        "Slice logs"
    );
    for (class, count) in &breakdown.by_class {
        warn!(class = %class, count, "Slice errors");
    }
    Ok(())
}

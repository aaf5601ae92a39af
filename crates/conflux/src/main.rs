//! conflux: fuse chart telemetry logs into confluence decisions.
//!
//! Usage:
//!   conflux [OPTIONS] <INPUTS>...
//!
//! Each input is one producer's append-only JSONL log. Inputs are merged
//! into a single time-ordered stream (argument order breaks timestamp
//! ties), synchronized into composite bars, scored, and the resulting
//! derived metrics and decisions are appended to the output log.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use conflux::{EngineConfig, JsonlSource, Pipeline};
use conflux_common::day_fraction_to_utc;

/// CLI arguments for conflux.
#[derive(Parser, Debug)]
#[command(name = "conflux")]
#[command(about = "Fuse chart telemetry logs into confluence decisions")]
#[command(version)]
struct Args {
    /// Input JSONL event logs, one per producer.
    #[arg(required = true)]
    inputs: Vec<PathBuf>,

    /// Config file path.
    #[arg(short, long, default_value = "config/conflux.toml")]
    config: PathBuf,

    /// Output log path ("-" writes to stdout).
    #[arg(short, long, default_value = "unified.jsonl")]
    out: PathBuf,

    /// Target chart id (overrides config).
    #[arg(long)]
    chart: Option<i32>,

    /// Keep polling inputs for appended lines until they go idle.
    #[arg(long)]
    follow: bool,

    /// Copy original events into the output.
    #[arg(long)]
    passthrough: bool,

    /// Logging filter (overrides config), e.g. "debug" or "conflux=trace".
    #[arg(long)]
    log_level: Option<String>,
}

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn run() -> Result<()> {
    let args = Args::parse();

    let mut config = if args.config.exists() {
        EngineConfig::from_file(&args.config)
            .with_context(|| format!("failed to load config from {:?}", args.config))?
    } else {
        EngineConfig::default()
    };
    config.apply_env_overrides();
    config.apply_cli_overrides(args.chart, args.passthrough, args.log_level.clone());
    config.validate().context("invalid configuration")?;

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(config.general.log_level.clone()))
        .with_writer(std::io::stderr)
        .init();

    if !args.config.exists() {
        warn!(path = ?args.config, "config file not found, using defaults");
    }

    let out: Box<dyn Write> = if args.out.as_os_str() == "-" {
        Box::new(std::io::stdout().lock())
    } else {
        let file = File::create(&args.out)
            .with_context(|| format!("failed to create output file {:?}", args.out))?;
        Box::new(BufWriter::new(file))
    };

    let mut pipeline = Pipeline::from_config(&config, out)?;
    for path in &args.inputs {
        let source = if args.follow {
            JsonlSource::open_follow(path, config.follow_config())
        } else {
            JsonlSource::open(path)
        }
        .with_context(|| format!("failed to open input {:?}", path))?;
        pipeline.register_source(Box::new(source));
        info!(path = %path.display(), follow = args.follow, "registered source");
    }

    let (summary, _) = pipeline.run()?;

    if summary.lines_skipped > 0 || summary.unknown_kind_drops > 0 {
        warn!(
            lines_skipped = summary.lines_skipped,
            unknown_kinds = summary.unknown_kind_drops,
            "some input lines were not usable"
        );
    }
    let span = match (summary.first_decision_t, summary.last_decision_t) {
        (Some(first), Some(last)) => format!(
            "{} .. {}",
            day_fraction_to_utc(first).map_or_else(|| first.to_string(), |d| d.to_rfc3339()),
            day_fraction_to_utc(last).map_or_else(|| last.to_string(), |d| d.to_rfc3339()),
        ),
        _ => "no decisions".to_string(),
    };
    info!(
        events = summary.events_processed,
        bars_completed = summary.bars_completed,
        bars_partial = summary.bars_partial,
        decisions = summary.decisions_written,
        dropped_kind = summary.dropped_kind,
        dropped_chart = summary.dropped_chart,
        late_events = summary.late_events,
        span,
        "run complete"
    );

    Ok(())
}

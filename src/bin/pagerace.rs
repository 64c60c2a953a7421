use std::{path::PathBuf, process};

use anyhow::{Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand, value_parser};
use pagerace::{
    Benchmark, ResultsSnapshot,
    checker::{HttpChecker, RetryingChecker},
    config::{BenchSettings, SelectMethod, default_config_path},
    ports::PortAllocator,
    stats::Verdict,
    telemetry,
};
use serde::Serialize;
use tracing::info;

#[derive(Parser, Debug)]
#[command(
    name = "pagerace",
    author,
    version,
    about = "Side-by-side page load benchmarks with recorded traffic replay",
    long_about = None
)]
struct Cli {
    /// Optional configuration file override.
    #[arg(long, value_name = "FILE", value_parser = value_parser!(PathBuf), global = true)]
    config: Option<PathBuf>,

    /// Increase logging verbosity.
    #[arg(long, action = ArgAction::SetTrue, global = true)]
    verbose: bool,

    /// Print results as JSON instead of a summary.
    #[arg(long, action = ArgAction::SetTrue, global = true)]
    json: bool,

    /// Comparison to run (defaults to the first one in the config).
    #[arg(long, value_name = "NAME", global = true)]
    comparison: Option<String>,

    /// Directory receiving archives and proxy logs.
    #[arg(long, value_parser = value_parser!(PathBuf), global = true)]
    output: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Load every site against the live network.
    Live(CycleArgs),
    /// Record traffic archives for every site.
    Record(RecordArgs),
    /// Replay recorded archive pairs side by side.
    Replay(ReplayArgs),
    /// Show the archive pairs a replay would use.
    Pairs(SelectArgs),
}

#[derive(Args, Debug, Default)]
struct CycleArgs {
    /// Successful loads required per site.
    #[arg(long)]
    iterations: Option<usize>,

    /// Concurrent page loads.
    #[arg(long)]
    workers: Option<usize>,
}

#[derive(Args, Debug)]
struct RecordArgs {
    /// Archives to record per site.
    #[arg(long)]
    count: Option<usize>,
}

#[derive(Args, Debug, Default)]
struct SelectArgs {
    /// Pairing strategy.
    #[arg(long, value_enum)]
    method: Option<SelectMethod>,

    /// Maximum number of pairs.
    #[arg(long)]
    count: Option<usize>,
}

#[derive(Args, Debug)]
struct ReplayArgs {
    #[command(flatten)]
    cycle: CycleArgs,

    #[command(flatten)]
    select: SelectArgs,
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    if let Err(err) = run().await {
        eprintln!("pagerace: {err:?}");
        process::exit(1);
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();
    let config_path = match &cli.config {
        Some(path) => path.clone(),
        None => default_config_path()?,
    };
    let mut settings = BenchSettings::load_or_default(&config_path)?;
    telemetry::init_tracing(cli.verbose, &settings.traces)?;
    info!(config = %config_path.display(), "configuration loaded");

    match &cli.command {
        Command::Live(args) => apply_cycle_args(&mut settings, args),
        Command::Record(args) => {
            if let Some(count) = args.count {
                settings.wpr.record_count = count;
            }
        }
        Command::Replay(args) => {
            apply_cycle_args(&mut settings, &args.cycle);
            apply_select_args(&mut settings, &args.select);
        }
        Command::Pairs(args) => apply_select_args(&mut settings, args),
    }
    if let Some(output) = &cli.output {
        settings.output_dir = Some(output.clone());
    }
    settings.validate()?;

    let comparison = settings.comparison(cli.comparison.as_deref())?.clone();
    let attempts = settings.check_attempts;
    let wpr = settings.wpr.clone();
    let bench = Benchmark::from_settings(settings)?;
    info!(
        comparison = %comparison.name,
        run = %bench.run_id(),
        archives = %bench.archive_dir().display(),
        "benchmark ready"
    );

    match &cli.command {
        Command::Live(_) => {
            let checker = RetryingChecker::new(HttpChecker::new()?, attempts);
            let outcome = bench.run_live(&comparison, &checker).await?;
            emit(cli.json, &outcome, || print_snapshot(&outcome.results))?;
        }
        Command::Record(_) => {
            let checker = RetryingChecker::new(HttpChecker::new()?, attempts);
            let mut allocator = PortAllocator::from_settings(&wpr);
            let archives = bench.record(&comparison, &checker, &mut allocator).await?;
            emit(cli.json, &archives, || {
                for archive in &archives {
                    println!(
                        "{:<20} #{:<3} {:>10} bytes  {}",
                        archive.site_name,
                        archive.archive_id,
                        archive.size_bytes,
                        archive.filename.display()
                    );
                }
            })?;
        }
        Command::Replay(_) => {
            let checker = RetryingChecker::new(HttpChecker::new()?, attempts);
            let mut allocator = PortAllocator::from_settings(&wpr);
            let reports = bench.replay(&comparison, &checker, &mut allocator).await?;
            emit(cli.json, &reports, || {
                for report in &reports {
                    println!(
                        "pair a#{} ({} bytes) / b#{} ({} bytes), diff {}",
                        report.pair.a_archive_id,
                        report.pair.a_size,
                        report.pair.b_archive_id,
                        report.pair.b_size,
                        report.pair.diff
                    );
                    print_snapshot(&report.outcome.results);
                }
            })?;
        }
        Command::Pairs(_) => {
            let pairs = bench.pairs(&comparison)?;
            emit(cli.json, &pairs, || {
                if pairs.is_empty() {
                    println!("no archive pairs in {}", bench.archive_dir().display());
                }
                for pair in &pairs {
                    println!(
                        "a#{:<3} {:>10}  b#{:<3} {:>10}  diff {:>+10}",
                        pair.a_archive_id, pair.a_size, pair.b_archive_id, pair.b_size, pair.diff
                    );
                }
            })?;
        }
    }

    if let Some(path) = telemetry::current_trace_file() {
        info!(path = %path.display(), "trace written");
    }
    Ok(())
}

fn apply_cycle_args(settings: &mut BenchSettings, args: &CycleArgs) {
    if let Some(iterations) = args.iterations {
        settings.iterations = iterations;
    }
    if let Some(workers) = args.workers {
        settings.workers = workers;
    }
}

fn apply_select_args(settings: &mut BenchSettings, args: &SelectArgs) {
    if let Some(method) = args.method {
        settings.wpr.select_method = method;
    }
    if let Some(count) = args.count {
        settings.wpr.select_count = count;
    }
}

fn emit<T: Serialize>(json: bool, value: &T, summary: impl FnOnce()) -> Result<()> {
    if json {
        let rendered = serde_json::to_string_pretty(value).context("Failed to encode results")?;
        println!("{rendered}");
    } else {
        summary();
    }
    Ok(())
}

const SUMMARY_STATS: [&str; 4] = ["mean", "p50", "p90", "significance"];

fn print_snapshot(snapshot: &ResultsSnapshot) {
    println!("iterations per site: {}", snapshot.min_iterations);
    for metric in &snapshot.metrics {
        println!("{metric}");
        for (site, name) in snapshot.sites.iter().enumerate() {
            let mut line = format!("  {name:<20}");
            for stat in SUMMARY_STATS {
                let Some(cell) = snapshot.get(site, metric, stat) else {
                    continue;
                };
                line.push_str(&format!("  {stat}={}", format_cell(cell.value, cell.highlight)));
            }
            println!("{line}");
        }
    }
}

fn format_cell(value: Option<f64>, highlight: Verdict) -> String {
    let Some(value) = value else {
        return "-".to_string();
    };
    let marker = match highlight {
        Verdict::Above => "+",
        Verdict::Below => "-",
        Verdict::Neutral => "",
    };
    format!("{value:.2}{marker}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_global_flags_after_subcommand() {
        let cli = Cli::parse_from(["pagerace", "live", "--iterations", "4", "--json"]);
        assert!(cli.json);
        match cli.command {
            Command::Live(args) => assert_eq!(args.iterations, Some(4)),
            _ => panic!("expected live command"),
        }
    }

    #[test]
    fn replay_overrides_selection() {
        let cli = Cli::parse_from([
            "pagerace",
            "--comparison",
            "news",
            "replay",
            "--method",
            "quantile",
            "--count",
            "2",
        ]);
        assert_eq!(cli.comparison.as_deref(), Some("news"));
        let Command::Replay(args) = cli.command else {
            panic!("expected replay command");
        };
        let mut settings = BenchSettings::default();
        apply_select_args(&mut settings, &args.select);
        assert_eq!(settings.wpr.select_method, SelectMethod::Quantile);
        assert_eq!(settings.wpr.select_count, 2);
    }

    #[test]
    fn missing_values_render_as_dash() {
        assert_eq!(format_cell(None, Verdict::Neutral), "-");
        assert_eq!(format_cell(Some(1.5), Verdict::Above), "1.50+");
    }
}

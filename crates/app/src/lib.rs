use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser};
use tracing::{info, warn};
use tracing_subscriber::prelude::*;

use flowseg_core::adapters::backend::InferenceBackend;
use flowseg_core::artifacts::ArtifactWriter;
use flowseg_core::config::{self, config_path, AppConfig, RunOverrides, RunSettings};
use flowseg_core::context::InferenceContext;
use flowseg_core::logging::{
    self, FileSinkPlan, LoggingInitOptions, PanicHookInstallPlan, DEFAULT_LOG_FILTER,
};
use flowseg_core::pipeline::{self, RunSummary};
use flowseg_core::runtime;
use flowseg_core::sampling::BoundaryPolicy;

#[derive(Parser, Debug)]
#[command(
    name = "flowseg",
    about = "Generate warped segmentation training data from key/current frame pairs"
)]
struct Cli {
    #[arg(
        short = 'v',
        long = "verbose",
        action = ArgAction::Count,
        help = "Increase log verbosity (-v: debug, -vv: trace)"
    )]
    verbose: u8,

    #[arg(
        long = "log-filter",
        value_name = "FILTER",
        help = "Explicit tracing filter (overrides RUST_LOG and -v)"
    )]
    log_filter: Option<String>,

    #[arg(
        long,
        value_name = "DIR",
        help = "Home directory holding config.toml, graphs and logs"
    )]
    home: Option<PathBuf>,

    #[arg(
        long,
        value_name = "DIR",
        help = "Dataset root that manifest paths are relative to"
    )]
    data_dir: Option<PathBuf>,

    #[arg(
        long,
        value_name = "FILE",
        help = "Manifest of key, current and aux frame paths"
    )]
    data_list: Option<PathBuf>,

    #[arg(
        long,
        value_name = "DIR",
        help = "Directory searched for the latest checkpoint"
    )]
    restore_from: Option<PathBuf>,

    #[arg(
        long,
        value_name = "DIR",
        help = "Output directory for features and predictions"
    )]
    save_dir: Option<PathBuf>,

    #[arg(long)]
    num_classes: Option<usize>,

    #[arg(long, help = "Number of manifest entries to process")]
    num_steps: Option<usize>,

    #[arg(long, value_parser = parse_backend, help = "cpu, cuda or tensorrt")]
    backend: Option<InferenceBackend>,

    #[arg(
        long,
        value_parser = parse_boundary,
        help = "Out-of-bounds sampling: clamp or zero"
    )]
    boundary: Option<BoundaryPolicy>,

    #[arg(
        long,
        help = "Fail when no checkpoint is found"
    )]
    require_checkpoint: bool,
}

impl Cli {
    fn overrides(&self) -> RunOverrides {
        RunOverrides {
            data_dir: self.data_dir.clone(),
            data_list: self.data_list.clone(),
            restore_from: self.restore_from.clone(),
            save_dir: self.save_dir.clone(),
            num_classes: self.num_classes,
            num_steps: self.num_steps,
            backend: self.backend,
            boundary: self.boundary,
            require_checkpoint: self.require_checkpoint,
        }
    }
}

fn parse_backend(value: &str) -> Result<InferenceBackend, String> {
    Ok(InferenceBackend::from_str_lossy(value))
}

fn parse_boundary(value: &str) -> Result<BoundaryPolicy, String> {
    Ok(BoundaryPolicy::from_str_lossy(value))
}

pub fn run_from_env() -> Result<()> {
    let cli = Cli::parse();
    let home_dir = config::home_dir(cli.home.as_deref());

    let ort_library = runtime::setup_runtime_libs(Some(home_dir.as_path()));
    if let Err(error) = config::initialize_home_dir(&home_dir) {
        eprintln!("Warning: failed to initialize home directory: {error:#}");
    }
    init_logging(
        Some(home_dir.as_path()),
        cli.verbose,
        cli.log_filter.as_deref(),
    );
    runtime::log_runtime_lib_status(&ort_library);
    log_startup_metadata(&home_dir);

    let cfg_path = config_path(&home_dir);
    let app_config = match AppConfig::load_from_path(&cfg_path) {
        Ok(config) => config,
        Err(err) => {
            warn!(error = %err, "Failed to load config file, using defaults");
            AppConfig::default()
        }
    };

    let settings = RunSettings::from_config(&app_config, &home_dir, &cli.overrides());
    settings.validate()?;
    generate(&settings)
}

fn generate(settings: &RunSettings) -> Result<()> {
    info!(
        num_classes = settings.num_classes,
        num_steps = settings.num_steps,
        backend = %settings.backend,
        restore_from = %settings.restore_from.display(),
        "Preparing inference context"
    );
    let mut ctx = InferenceContext::restore(settings)?;
    let writer = ArtifactWriter::new(&settings.save_dir)?;

    let start = Instant::now();
    let summary = pipeline::run_manifest_file(&mut ctx, settings, &writer, |done, total| {
        print_progress(done, total, start.elapsed().as_secs_f64());
    })
    .with_context(|| format!("manifest walk over {} failed", settings.data_list.display()))?;
    eprintln!();

    log_summary(&summary, start.elapsed().as_secs_f64());
    Ok(())
}

fn log_summary(summary: &RunSummary, elapsed: f64) {
    info!(
        pairs = summary.pairs,
        files_written = summary.files_written,
        elapsed = %format_duration(elapsed),
        "Generate prediction testcases finish!"
    );
}

#[cfg(test)]
fn select_log_filter(
    noise_base: &str,
    rust_log_env: Option<&str>,
    verbose: u8,
    cli_log_filter: Option<&str>,
) -> logging::LoggingFilterPlan {
    let options = LoggingInitOptions {
        verbose,
        cli_log_filter: cli_log_filter.map(ToString::to_string),
        rust_log_env: rust_log_env.map(ToString::to_string),
        noise_filter: noise_base.to_string(),
        ..Default::default()
    };

    logging::compose_logging_filters(&options)
}

fn init_logging(home_dir: Option<&Path>, verbose: u8, cli_log_filter: Option<&str>) {
    let panic_hook_plan = logging::install_panic_hook(home_dir);

    let init_plan = logging::compose_logging_init_plan(&LoggingInitOptions {
        home_dir: home_dir.map(Path::to_path_buf),
        verbose,
        cli_log_filter: cli_log_filter.map(ToString::to_string),
        rust_log_env: std::env::var("RUST_LOG").ok(),
        ..Default::default()
    });
    let filters = init_plan.filters;

    let (appender, file_fallback) = match init_plan.file_sink {
        FileSinkPlan::Ready(ready) => (Some(ready.appender), None),
        FileSinkPlan::Fallback(fallback) => (None, Some(fallback)),
    };
    let file_layer = appender.map(|appender| {
        tracing_subscriber::fmt::layer()
            .with_ansi(false)
            .with_writer(appender)
            .with_filter(parse_env_filter_with_fallback(&filters.file_filter, "file"))
    });
    let console_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_filter(parse_env_filter_with_fallback(&filters.console_filter, "console"));

    let subscriber = tracing_subscriber::registry()
        .with(console_layer)
        .with(file_layer);
    if let Err(error) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!(
            "Failed to initialize tracing subscriber: {error}. Continuing without structured tracing."
        );
        return;
    }

    if let Some(fallback) = file_fallback {
        warn!(
            attempted_log_dir = ?fallback.attempted_log_dir,
            reason = %fallback.reason,
            "Persistent file logging unavailable; continuing with console-only logging"
        );
    }
    if let PanicHookInstallPlan::Fallback {
        attempted_crash_dir,
        reason,
    } = panic_hook_plan
    {
        warn!(
            attempted_crash_dir = ?attempted_crash_dir,
            reason = %reason,
            "Panic crash artifact hook unavailable; panics will not be persisted"
        );
    }
}

fn parse_env_filter_with_fallback(filter: &str, sink_name: &str) -> tracing_subscriber::EnvFilter {
    tracing_subscriber::EnvFilter::try_new(filter).unwrap_or_else(|error| {
        eprintln!(
            "Invalid {sink_name} log filter '{filter}': {error}. Falling back to '{DEFAULT_LOG_FILTER}'."
        );
        tracing_subscriber::EnvFilter::new(DEFAULT_LOG_FILTER)
    })
}

fn log_startup_metadata(home_dir: &Path) {
    info!(
        pid = std::process::id(),
        version = env!("CARGO_PKG_VERSION"),
        home_dir = %home_dir.display(),
        config_path = %config_path(home_dir).display(),
        "Runtime startup metadata"
    );
}

fn format_duration(secs: f64) -> String {
    let total = secs.round() as u64;
    let h = total / 3600;
    let m = (total % 3600) / 60;
    let s = total % 60;
    format!("{:02}:{:02}:{:02}", h, m, s)
}

const PROGRESS_BAR_WIDTH: usize = 30;

fn print_progress(done: usize, total: usize, elapsed: f64) {
    eprint!("\r{}    ", progress_line(done, total, elapsed));
}

fn progress_line(done: usize, total: usize, elapsed: f64) -> String {
    let fraction = if total > 0 {
        (done as f64 / total as f64).clamp(0.0, 1.0)
    } else {
        0.0
    };
    let filled = (fraction * PROGRESS_BAR_WIDTH as f64).round() as usize;
    let bar = "█".repeat(filled) + &"░".repeat(PROGRESS_BAR_WIDTH.saturating_sub(filled));

    let rate = pair_rate(done, elapsed);
    let eta = if rate > 0.0 {
        let remaining = total.saturating_sub(done) as f64;
        format!(" | ETA: {}", format_duration(remaining / rate))
    } else {
        String::new()
    };

    format!(
        "[{bar}] {:5.1}% | Pair {done}/{total} | {rate:.2} pairs/s | Elapsed: {}{eta}",
        fraction * 100.0,
        format_duration(elapsed),
    )
}

fn pair_rate(done: usize, elapsed: f64) -> f64 {
    if elapsed <= 0.0 {
        return 0.0;
    }
    done as f64 / elapsed
}

#[cfg(test)]
mod duration_tests {
    use super::*;

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(6595.0), "01:49:55");
        assert_eq!(format_duration(45.0), "00:00:45");
        assert_eq!(format_duration(0.0), "00:00:00");
        assert_eq!(format_duration(86400.0), "24:00:00");
    }
}

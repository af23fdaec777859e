use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use owo_colors::OwoColorize;

use anyhow::Context;
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use tokio_util::sync::CancellationToken;

use pdftext_core::config_file::{self, ConfigFile, ConfigFileError};
use pdftext_core::{
    BatchConfig, CommandTemplate, ConversionResult, ConversionStatus, IgnoreRules, ProgressEvent,
    RunRequest,
};
use pdftext_mupdf::MupdfBackend;

mod output;

use output::ColorMode;

/// Log file used when none is configured.
const DEFAULT_LOG_FILE: &str = "pdf_to_text.log";

/// Exit status after a Ctrl+C interrupted run (128 + SIGINT).
const EXIT_INTERRUPTED: u8 = 130;

/// How long shutdown waits for conversions abandoned after a timeout.
const SHUTDOWN_GRACE: Duration = Duration::from_millis(500);

/// Convert every PDF under a directory tree into plain text files
#[derive(Parser, Debug)]
#[command(name = "pdf-to-text", version, about, long_about = None)]
struct Cli {
    /// Directory searched recursively for PDF files
    input_dir: PathBuf,

    /// Directory the text files are written to
    output_dir: PathBuf,

    /// Mirror the input directory layout under the output directory
    #[arg(long)]
    preserve_structure: bool,

    /// Gzip the text output (<name>.txt.gz)
    #[arg(long)]
    compress: bool,

    /// Write document metadata to a <name>.txt.meta.json sidecar
    #[arg(long)]
    extract_meta: bool,

    /// Replace typographic ligatures (fi, fl, ...) with plain letters
    #[arg(long)]
    expand_ligatures: bool,

    /// Glob patterns of files or directories to skip, relative to the input directory
    #[arg(long, num_args = 1.., value_name = "PATTERN")]
    ignore: Vec<String>,

    /// Command run on each output file; `{}` is replaced by its path
    #[arg(long, value_name = "TEMPLATE")]
    shell_command: Option<String>,

    /// Report what would be converted without writing anything
    #[arg(long)]
    dry_run: bool,

    /// Path to the log file (default: pdf_to_text.log)
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Skip files whose content hash matches the previous run
    #[arg(long)]
    hash_check: bool,

    /// Location of the hash store (default: <OUTPUT_DIR>/.pdf_to_text_hashes.json)
    #[arg(long, value_name = "PATH")]
    hash_store: Option<PathBuf>,

    /// Number of parallel workers (default: available CPUs)
    #[arg(short = 'j', long)]
    workers: Option<usize>,

    /// Per-file timeout in seconds
    #[arg(long, value_name = "SECS")]
    timeout: Option<u64>,

    /// Disable colored output
    #[arg(long)]
    no_color: bool,
}

/// Everything a run needs after merging CLI, environment and config file.
#[derive(Debug)]
struct Settings {
    config: BatchConfig,
    log_file: PathBuf,
    expand_ligatures: bool,
}

/// Resolve configuration: CLI flags > env vars > config file > defaults.
///
/// `env` looks up an environment variable; taking it as a parameter keeps
/// the precedence rules testable.
fn resolve_settings(
    cli: &Cli,
    file: &ConfigFile,
    env: impl Fn(&str) -> Option<String>,
) -> anyhow::Result<Settings> {
    let conversion = file.conversion.clone().unwrap_or_default();
    let concurrency = file.concurrency.clone().unwrap_or_default();

    let env_parse = |key: &str| -> anyhow::Result<Option<u64>> {
        env(key)
            .map(|v| {
                v.trim()
                    .parse::<u64>()
                    .with_context(|| format!("{key} must be a non-negative integer, got {v:?}"))
            })
            .transpose()
    };

    let workers = match cli.workers {
        Some(n) => n,
        None => match env_parse("PDF_TO_TEXT_WORKERS")? {
            Some(n) => n as usize,
            None => concurrency
                .workers
                .unwrap_or_else(pdftext_core::default_workers),
        },
    };

    let timeout_secs = match cli.timeout {
        Some(s) => Some(s),
        None => env_parse("PDF_TO_TEXT_TIMEOUT")?.or(concurrency.timeout_secs),
    };

    let log_file = cli
        .log_file
        .clone()
        .or_else(|| env("PDF_TO_TEXT_LOG_FILE").map(PathBuf::from))
        .or_else(|| {
            file.logging
                .as_ref()
                .and_then(|l| l.log_file.as_ref())
                .map(PathBuf::from)
        })
        .unwrap_or_else(|| PathBuf::from(DEFAULT_LOG_FILE));

    let patterns = if cli.ignore.is_empty() {
        file.ignore
            .as_ref()
            .and_then(|i| i.patterns.clone())
            .unwrap_or_default()
    } else {
        cli.ignore.clone()
    };

    let command = cli
        .shell_command
        .clone()
        .or(conversion.shell_command)
        .map(|t| CommandTemplate::parse(&t))
        .transpose()?;

    let config = BatchConfig {
        preserve_structure: cli.preserve_structure || conversion.preserve_structure.unwrap_or(false),
        compress: cli.compress || conversion.compress.unwrap_or(false),
        extract_metadata: cli.extract_meta || conversion.extract_metadata.unwrap_or(false),
        ignore: IgnoreRules::new(patterns)?,
        command,
        dry_run: cli.dry_run,
        hash_check: cli.hash_check || conversion.hash_check.unwrap_or(false),
        hash_store_path: cli
            .hash_store
            .clone()
            .or_else(|| conversion.hash_store.map(PathBuf::from)),
        workers,
        file_timeout: timeout_secs.filter(|&s| s > 0).map(Duration::from_secs),
    };

    Ok(Settings {
        config,
        log_file,
        expand_ligatures: cli.expand_ligatures || conversion.expand_ligatures.unwrap_or(false),
    })
}

/// Route `tracing` output to the log file. The returned guard flushes the
/// writer on drop and must live until the end of `main`.
fn init_logging(path: &Path) -> anyhow::Result<tracing_appender::non_blocking::WorkerGuard> {
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("cannot open log file {}", path.display()))?;
    let (writer, guard) = tracing_appender::non_blocking(file);

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(writer)
        .with_ansi(false)
        .init();

    Ok(guard)
}

fn progress_bar(color: ColorMode) -> ProgressBar {
    let template = if color.enabled() {
        "{spinner:.green} [{bar:40.cyan/dim}] {pos}/{len} ({eta}) {wide_msg}"
    } else {
        "{spinner} [{bar:40}] {pos}/{len} ({eta}) {wide_msg}"
    };
    let bar = ProgressBar::new(0);
    if let Ok(style) = ProgressStyle::with_template(template) {
        bar.set_style(style.progress_chars("=> "));
    }
    bar.set_message("Scanning for PDF files...");
    bar.enable_steady_tick(Duration::from_millis(120));
    bar
}

/// Warn about config files that were skipped while loading. Logging is not
/// up when they are found, so they go to stderr first and to the log later.
fn print_config_errors(
    w: &mut dyn Write,
    errors: &[ConfigFileError],
    color: ColorMode,
) -> std::io::Result<()> {
    for error in errors {
        if color.enabled() {
            writeln!(w, "{} {}", "WARNING:".yellow(), error)?;
        } else {
            writeln!(w, "WARNING: {}", error)?;
        }
    }
    Ok(())
}

fn build_runtime() -> std::io::Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
}

fn main() -> anyhow::Result<ExitCode> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let color = ColorMode(!cli.no_color);

    let (file_config, config_errors) = config_file::load_config();
    print_config_errors(&mut std::io::stderr(), &config_errors, color)?;

    let settings = resolve_settings(&cli, &file_config, |key| std::env::var(key).ok())?;
    let _log_guard = init_logging(&settings.log_file)?;
    for error in &config_errors {
        tracing::warn!(error = %error, "config file skipped");
    }

    // A timed-out conversion keeps its blocking thread until extraction
    // returns; don't let that hold the process open.
    let runtime = build_runtime().context("cannot start the async runtime")?;
    let outcome = runtime.block_on(run(cli, settings, color));
    runtime.shutdown_timeout(SHUTDOWN_GRACE);
    outcome
}

async fn run(cli: Cli, settings: Settings, color: ColorMode) -> anyhow::Result<ExitCode> {
    let Settings {
        config,
        expand_ligatures,
        ..
    } = settings;
    let dry_run = config.dry_run;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        input = %cli.input_dir.display(),
        output = %cli.output_dir.display(),
        workers = config.workers,
        "starting pdf-to-text"
    );

    let bar = progress_bar(color);
    let problems: Arc<Mutex<Vec<ConversionResult>>> = Arc::new(Mutex::new(Vec::new()));

    let progress_cb = {
        let bar = bar.clone();
        let problems = Arc::clone(&problems);
        move |event: ProgressEvent| match event {
            ProgressEvent::Discovered { to_process, .. } => {
                bar.set_length(to_process as u64);
                bar.set_message("");
            }
            ProgressEvent::DiscoveryError { path, message } => {
                bar.println(output::format_discovery_error(&path, &message, color));
            }
            ProgressEvent::FileStarted { path, .. } => {
                if let Some(name) = path.file_name() {
                    bar.set_message(name.to_string_lossy().into_owned());
                }
            }
            ProgressEvent::FileFinished { result, .. } => {
                if result.status != ConversionStatus::Skipped {
                    bar.inc(1);
                }
                if (result.status == ConversionStatus::Failed || !result.warnings.is_empty())
                    && let Ok(mut p) = problems.lock()
                {
                    p.push(*result);
                }
            }
            ProgressEvent::Interrupted { .. } => {
                bar.set_message("Interrupted, waiting for running conversions...");
            }
            ProgressEvent::HashStoreSaved { .. } => {}
        }
    };

    let cancel = CancellationToken::new();

    // Set up Ctrl+C handler
    let cancel_clone = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel_clone.cancel();
        }
    });

    let request = RunRequest::new(&cli.input_dir, &cli.output_dir, config);
    let result = pdftext_core::convert_tree(
        request,
        Arc::new(MupdfBackend::new().with_ligature_expansion(expand_ligatures)),
        progress_cb,
        cancel,
    )
    .await;
    bar.finish_and_clear();

    let summary = match result {
        Ok(summary) => summary,
        Err(e) => {
            tracing::error!(error = %e, "run aborted");
            return Err(e.into());
        }
    };

    let mut stdout = std::io::stdout();
    let mut problems = problems.lock().map(|p| p.clone()).unwrap_or_default();
    problems.sort_by(|a, b| a.candidate.input_path.cmp(&b.candidate.input_path));
    output::print_problems(&mut stdout, &problems, color)?;
    output::print_summary(&mut stdout, &summary, dry_run, color)?;

    if summary.interrupted {
        return Ok(ExitCode::from(EXIT_INTERRUPTED));
    }
    Ok(ExitCode::SUCCESS)
}

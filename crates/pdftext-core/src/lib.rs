use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;

pub mod backend;
pub mod command;
pub mod config_file;
pub mod discover;
pub mod hash_store;
pub mod mock;
pub mod orchestrator;
pub mod pool;
pub mod worker;

// Re-export for convenience
pub use backend::{BackendError, Metadata, PdfBackend};
pub use command::{CommandError, CommandTemplate};
pub use discover::{Discoverer, DiscoveryError, IgnoreRules, OutputCollision, PathMapper};
pub use hash_store::{HashStore, HashStoreError};
pub use orchestrator::RunRequest;
pub use worker::{ConversionOptions, WorkerContext};

/// Suffix appended to the text output when compressing.
pub const GZIP_SUFFIX: &str = ".gz";
/// Suffix appended to the text output for the metadata sidecar.
pub const METADATA_SUFFIX: &str = ".meta.json";

/// One input file paired with the output it will produce.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub input_path: PathBuf,
    /// Uncompressed text output path.
    pub output_path: PathBuf,
    /// Input path relative to the input root.
    pub relative_path: PathBuf,
}

impl Candidate {
    /// The file that exists after a successful conversion.
    pub fn artifact_path(&self, compress: bool) -> PathBuf {
        if compress {
            append_suffix(&self.output_path, GZIP_SUFFIX)
        } else {
            self.output_path.clone()
        }
    }

    pub fn metadata_path(&self) -> PathBuf {
        append_suffix(&self.output_path, METADATA_SUFFIX)
    }
}

pub(crate) fn append_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut s = path.as_os_str().to_owned();
    s.push(suffix);
    PathBuf::from(s)
}

/// Outcome class of a single file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConversionStatus {
    Converted,
    Skipped,
    Failed,
    DryRun,
}

/// Result of handling one candidate.
#[derive(Debug, Clone)]
pub struct ConversionResult {
    pub candidate: Candidate,
    pub status: ConversionStatus,
    pub error: Option<String>,
    /// Partial failures that did not change the status (metadata, post-command).
    pub warnings: Vec<String>,
    /// Size of the final artifact.
    pub bytes_written: Option<u64>,
    pub elapsed: Duration,
    /// Input fingerprint taken before extraction, when hash checking is on.
    pub fingerprint: Option<String>,
}

impl ConversionResult {
    pub fn converted(
        candidate: Candidate,
        bytes_written: u64,
        warnings: Vec<String>,
        elapsed: Duration,
    ) -> Self {
        Self {
            candidate,
            status: ConversionStatus::Converted,
            error: None,
            warnings,
            bytes_written: Some(bytes_written),
            elapsed,
            fingerprint: None,
        }
    }

    pub fn failed(candidate: Candidate, error: impl std::fmt::Display, elapsed: Duration) -> Self {
        Self {
            candidate,
            status: ConversionStatus::Failed,
            error: Some(error.to_string()),
            warnings: Vec::new(),
            bytes_written: None,
            elapsed,
            fingerprint: None,
        }
    }

    pub fn skipped(candidate: Candidate) -> Self {
        Self {
            candidate,
            status: ConversionStatus::Skipped,
            error: None,
            warnings: Vec::new(),
            bytes_written: None,
            elapsed: Duration::ZERO,
            fingerprint: None,
        }
    }

    pub fn dry_run(candidate: Candidate, elapsed: Duration) -> Self {
        Self {
            candidate,
            status: ConversionStatus::DryRun,
            error: None,
            warnings: Vec::new(),
            bytes_written: None,
            elapsed,
            fingerprint: None,
        }
    }

    pub fn with_fingerprint(mut self, fingerprint: Option<String>) -> Self {
        self.fingerprint = fingerprint;
        self
    }

    pub fn is_success(&self) -> bool {
        self.status == ConversionStatus::Converted
    }
}

/// Aggregate counts for a run. Built only by the orchestrator; the counts do
/// not depend on the order in which results are recorded.
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub total_candidates: usize,
    pub converted: usize,
    pub skipped: usize,
    pub failed: usize,
    pub dry_run: usize,
    /// Dispatchable candidates that never produced a result (interrupted run).
    pub not_started: usize,
    /// Files whose result carried at least one warning.
    pub with_warnings: usize,
    pub ignored: usize,
    pub discovery_errors: usize,
    pub interrupted: bool,
    pub hash_store_error: Option<String>,
    pub elapsed: Duration,
}

impl RunSummary {
    pub fn record(&mut self, result: &ConversionResult) {
        match result.status {
            ConversionStatus::Converted => self.converted += 1,
            ConversionStatus::Skipped => self.skipped += 1,
            ConversionStatus::Failed => self.failed += 1,
            ConversionStatus::DryRun => self.dry_run += 1,
        }
        if !result.warnings.is_empty() {
            self.with_warnings += 1;
        }
    }

    /// Results recorded so far.
    pub fn completed(&self) -> usize {
        self.converted + self.skipped + self.failed + self.dry_run
    }
}

impl std::fmt::Display for RunSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} files: {} converted, {} skipped, {} failed",
            self.total_candidates, self.converted, self.skipped, self.failed
        )?;
        if self.dry_run > 0 {
            write!(f, ", {} would be processed", self.dry_run)?;
        }
        if self.with_warnings > 0 {
            write!(f, ", {} with warnings", self.with_warnings)?;
        }
        if self.ignored > 0 {
            write!(f, ", {} ignored", self.ignored)?;
        }
        if self.not_started > 0 {
            write!(f, ", {} not started", self.not_started)?;
        }
        write!(f, " in {:.1?}", self.elapsed)
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid ignore pattern {pattern:?}: {message}")]
    InvalidPattern { pattern: String, message: String },
    #[error("invalid shell command template {template:?}: {reason}")]
    InvalidTemplate { template: String, reason: String },
    #[error("worker count must be at least 1")]
    NoWorkers,
}

/// Setup-level failures. These abort the run before any file is dispatched.
#[derive(Error, Debug)]
pub enum RunError {
    #[error("input directory {} is not a directory", .0.display())]
    InputNotDirectory(PathBuf),
    #[error("cannot read input directory {}: {source}", .path.display())]
    InputUnreadable {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("output path {} exists and is not a directory", .0.display())]
    OutputNotDirectory(PathBuf),
    #[error("output directory {} is not writable: {source}", .path.display())]
    OutputUnwritable {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("output path collision: {0}")]
    OutputCollision(#[from] OutputCollision),
    #[error("discovery aborted: {0}")]
    DiscoveryAborted(String),
}

/// Per-file failures, captured into [`ConversionResult::error`].
#[derive(Error, Debug)]
pub enum ConversionError {
    #[error("cannot read input {}: {source}", .path.display())]
    InputUnreadable {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("output directory {} is not writable: {reason}", .path.display())]
    OutputUnwritable { path: PathBuf, reason: String },
    #[error("cannot write {}: {source}", .path.display())]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("extraction failed: {0}")]
    Extraction(#[from] BackendError),
    #[error("metadata extraction failed: {0}")]
    Metadata(BackendError),
    #[error("cannot serialize metadata: {0}")]
    MetadataFormat(#[from] serde_json::Error),
    #[error("post-processing command failed: {0}")]
    Command(#[from] CommandError),
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("abandoned after the caller stopped waiting")]
    Abandoned,
    #[error("worker panicked: {0}")]
    Panicked(String),
}

/// Worker count used when none is configured: the host's available parallelism.
pub fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(NonZeroUsize::get)
        .unwrap_or(4)
}

/// Settings for one batch run.
#[derive(Debug, Clone)]
pub struct BatchConfig {
    pub preserve_structure: bool,
    pub compress: bool,
    pub extract_metadata: bool,
    pub ignore: IgnoreRules,
    pub command: Option<CommandTemplate>,
    pub dry_run: bool,
    pub hash_check: bool,
    /// Store location; defaults to [`hash_store::DEFAULT_STORE_FILE`] in the output root.
    pub hash_store_path: Option<PathBuf>,
    pub workers: usize,
    /// Per-file limit after which a conversion is abandoned and recorded failed.
    pub file_timeout: Option<Duration>,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            preserve_structure: false,
            compress: false,
            extract_metadata: false,
            ignore: IgnoreRules::default(),
            command: None,
            dry_run: false,
            hash_check: false,
            hash_store_path: None,
            workers: default_workers(),
            file_timeout: None,
        }
    }
}

impl BatchConfig {
    pub fn hash_store_path(&self, output_root: &Path) -> PathBuf {
        self.hash_store_path
            .clone()
            .unwrap_or_else(|| output_root.join(hash_store::DEFAULT_STORE_FILE))
    }

    pub fn conversion_options(&self) -> ConversionOptions {
        ConversionOptions {
            dry_run: self.dry_run,
            extract_metadata: self.extract_metadata,
            compress: self.compress,
            command: self.command.clone(),
            record_fingerprint: self.hash_check && !self.dry_run,
        }
    }
}

/// Progress events emitted by the orchestrator, always from the orchestrator task.
#[derive(Debug, Clone)]
pub enum ProgressEvent {
    Discovered {
        total: usize,
        to_process: usize,
        skipped: usize,
        ignored: usize,
    },
    DiscoveryError {
        path: PathBuf,
        message: String,
    },
    FileStarted {
        index: usize,
        path: PathBuf,
    },
    FileFinished {
        index: usize,
        result: Box<ConversionResult>,
    },
    /// Cancellation observed; no new work will be dispatched.
    Interrupted {
        pending: usize,
    },
    HashStoreSaved {
        path: PathBuf,
        entries: usize,
    },
}

/// Convert every PDF under `request.input_root`.
///
/// Per-file failures are recorded in the summary; only setup problems
/// return an error. Cancelling `cancel` stops dispatch, lets in-flight files
/// finish and still persists the hash store.
pub async fn convert_tree(
    request: RunRequest,
    backend: Arc<dyn PdfBackend>,
    progress: impl Fn(ProgressEvent) + Send + Sync + 'static,
    cancel: CancellationToken,
) -> Result<RunSummary, RunError> {
    orchestrator::run(request, backend, progress, cancel).await
}

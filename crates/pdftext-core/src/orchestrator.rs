//! Batch orchestration: setup checks, discovery, skip planning, dispatch,
//! result aggregation and hash store persistence.
//!
//! The orchestrator task is the only place that mutates the hash store and
//! the run summary. Workers hand results back over a channel.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::discover::{self, Discoverer};
use crate::hash_store::{self, HashStore};
use crate::pool::{ConversionJob, ConversionPool, PoolEvent};
use crate::worker::{self, WorkerContext};
use crate::{
    BatchConfig, Candidate, ConfigError, ConversionResult, ConversionStatus, PdfBackend,
    ProgressEvent, RunError, RunSummary,
};

/// What to convert and how.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub input_root: PathBuf,
    pub output_root: PathBuf,
    pub config: BatchConfig,
}

impl RunRequest {
    pub fn new(
        input_root: impl Into<PathBuf>,
        output_root: impl Into<PathBuf>,
        config: BatchConfig,
    ) -> Self {
        Self {
            input_root: input_root.into(),
            output_root: output_root.into(),
            config,
        }
    }
}

/// Run a batch to completion (or until cancelled).
pub async fn run(
    request: RunRequest,
    backend: Arc<dyn PdfBackend>,
    progress: impl Fn(ProgressEvent) + Send + Sync + 'static,
    cancel: CancellationToken,
) -> Result<RunSummary, RunError> {
    let started = Instant::now();
    let RunRequest {
        input_root,
        output_root,
        config,
    } = request;

    validate_setup(&input_root, &output_root, &config)?;

    let store = config
        .hash_check
        .then(|| HashStore::load(config.hash_store_path(&output_root)));

    let discoverer = Discoverer::new(
        &input_root,
        &output_root,
        config.preserve_structure,
        config.ignore.clone(),
    );
    let mut discovery = tokio::task::spawn_blocking(move || discoverer.discover())
        .await
        .map_err(|e| RunError::DiscoveryAborted(e.to_string()))?;
    let candidates = std::mem::take(&mut discovery.candidates);

    let mut summary = RunSummary {
        total_candidates: candidates.len(),
        ignored: discovery.ignored,
        discovery_errors: discovery.errors.len(),
        ..Default::default()
    };
    for error in &discovery.errors {
        progress(ProgressEvent::DiscoveryError {
            path: error.path().to_path_buf(),
            message: error.to_string(),
        });
    }

    discover::check_collisions(&candidates)?;

    // Hashing reads every input, so it runs on the blocking pool too
    let (plan, mut store) = {
        let candidates = candidates.clone();
        let compress = config.compress;
        let cancel = cancel.clone();
        tokio::task::spawn_blocking(move || {
            let plan = plan_skips(candidates, store.as_ref(), compress, &cancel);
            (plan, store)
        })
        .await
        .map_err(|e| RunError::DiscoveryAborted(e.to_string()))?
    };
    let Plan { jobs, skipped } = plan;

    tracing::info!(
        input = %input_root.display(),
        output = %output_root.display(),
        total = summary.total_candidates,
        to_process = jobs.len(),
        skipped = skipped.len(),
        ignored = summary.ignored,
        ignore_patterns = ?config.ignore.patterns(),
        dry_run = config.dry_run,
        "discovered PDF files"
    );
    progress(ProgressEvent::Discovered {
        total: summary.total_candidates,
        to_process: jobs.len(),
        skipped: skipped.len(),
        ignored: summary.ignored,
    });

    for (index, candidate) in skipped {
        tracing::info!(input = %candidate.input_path.display(), "skipping (unchanged)");
        let result = ConversionResult::skipped(candidate);
        summary.record(&result);
        progress(ProgressEvent::FileFinished {
            index,
            result: Box::new(result),
        });
    }

    let to_process = jobs.len();
    if to_process > 0 {
        dispatch(
            jobs,
            &config,
            backend,
            &candidates,
            store.as_mut(),
            &mut summary,
            &progress,
            &cancel,
        )
        .await;
    }

    summary.not_started = to_process.saturating_sub(summary.completed() - summary.skipped);
    summary.interrupted = cancel.is_cancelled();

    if let Some(store) = store.as_mut()
        && !config.dry_run
        && store.is_dirty()
    {
        persist(store, &mut summary, &progress);
    }

    summary.elapsed = started.elapsed();
    tracing::info!(interrupted = summary.interrupted, "run finished: {summary}");
    Ok(summary)
}

/// Feed jobs to the pool from a producer task and consume results here.
#[allow(clippy::too_many_arguments)]
async fn dispatch(
    jobs: Vec<ConversionJob>,
    config: &BatchConfig,
    backend: Arc<dyn PdfBackend>,
    candidates: &[Candidate],
    mut store: Option<&mut HashStore>,
    summary: &mut RunSummary,
    progress: &(impl Fn(ProgressEvent) + Send + Sync),
    cancel: &CancellationToken,
) {
    let ctx = WorkerContext::new(backend, config.conversion_options());
    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let pool = ConversionPool::new(
        ctx,
        config.workers,
        config.file_timeout,
        cancel.clone(),
        events_tx,
    );

    let producer_cancel = cancel.clone();
    let producer = tokio::spawn(async move {
        let mut dispatched = 0usize;
        for job in jobs {
            tokio::select! {
                biased;
                _ = producer_cancel.cancelled() => break,
                sent = pool.submit(job) => {
                    if !sent {
                        break;
                    }
                    dispatched += 1;
                }
            }
        }
        pool.shutdown().await;
        dispatched
    });

    let mut finished = 0usize;
    let mut interrupt_seen = false;
    loop {
        tokio::select! {
            event = events_rx.recv() => {
                let Some(event) = event else { break };
                match event {
                    PoolEvent::Started { index } => {
                        let path = candidates
                            .get(index)
                            .map(|c| c.input_path.clone())
                            .unwrap_or_default();
                        progress(ProgressEvent::FileStarted { index, path });
                    }
                    PoolEvent::Finished { index, result } => {
                        finished += 1;
                        log_result(&result);
                        if result.is_success()
                            && let (Some(store), Some(fp)) =
                                (store.as_deref_mut(), result.fingerprint.clone())
                        {
                            store.record(&result.candidate.input_path, fp);
                        }
                        summary.record(&result);
                        progress(ProgressEvent::FileFinished {
                            index,
                            result: Box::new(result),
                        });
                    }
                }
            }
            _ = cancel.cancelled(), if !interrupt_seen => {
                interrupt_seen = true;
                tracing::warn!(finished, "interrupted, waiting for in-flight conversions");
                progress(ProgressEvent::Interrupted {
                    pending: candidates.len().saturating_sub(summary.completed()),
                });
            }
        }
    }

    match producer.await {
        Ok(dispatched) => {
            tracing::debug!(dispatched, finished, "pool drained");
        }
        Err(e) => tracing::error!(error = %e, "dispatch task failed"),
    }
}

fn persist(
    store: &mut HashStore,
    summary: &mut RunSummary,
    progress: &(impl Fn(ProgressEvent) + Send + Sync),
) {
    match store.save() {
        Ok(()) => progress(ProgressEvent::HashStoreSaved {
            path: store.path().to_path_buf(),
            entries: store.len(),
        }),
        Err(e) => {
            tracing::error!(path = %store.path().display(), error = %e, "failed to persist hash store");
            summary.hash_store_error = Some(e.to_string());
        }
    }
}

fn log_result(result: &ConversionResult) {
    let input = result.candidate.input_path.display();
    match result.status {
        ConversionStatus::Converted => {
            tracing::info!(%input, output = %result.candidate.output_path.display(), bytes = result.bytes_written, "processed");
        }
        ConversionStatus::DryRun => tracing::info!(%input, "would process"),
        ConversionStatus::Skipped => tracing::info!(%input, "skipping (unchanged)"),
        ConversionStatus::Failed => {
            tracing::error!(%input, error = result.error.as_deref().unwrap_or("unknown error"), "conversion failed");
        }
    }
    for warning in &result.warnings {
        tracing::warn!(%input, "{warning}");
    }
}

/// Candidates split into work to dispatch and files to skip, both keyed by
/// their position in the run.
struct Plan {
    jobs: Vec<ConversionJob>,
    skipped: Vec<(usize, Candidate)>,
}

/// Partition candidates by the hash store. Once `cancel` fires, the rest
/// are left unhashed as jobs that will never be dispatched.
fn plan_skips(
    candidates: Vec<Candidate>,
    store: Option<&HashStore>,
    compress: bool,
    cancel: &CancellationToken,
) -> Plan {
    let mut plan = Plan {
        jobs: Vec::with_capacity(candidates.len()),
        skipped: Vec::new(),
    };
    for (index, candidate) in candidates.into_iter().enumerate() {
        if !cancel.is_cancelled() && is_unchanged(&candidate, store, compress) {
            plan.skipped.push((index, candidate));
        } else {
            plan.jobs.push(ConversionJob { index, candidate });
        }
    }
    plan
}

/// Skip iff hashing is on, the expected artifact is still there and the
/// input matches its stored fingerprint.
fn is_unchanged(candidate: &Candidate, store: Option<&HashStore>, compress: bool) -> bool {
    let Some(store) = store else {
        return false;
    };
    let Some(stored) = store.get(&candidate.input_path) else {
        return false;
    };
    candidate.artifact_path(compress).exists()
        && !hash_store::has_changed(&candidate.input_path, Some(stored))
}

fn validate_setup(input_root: &Path, output_root: &Path, config: &BatchConfig) -> Result<(), RunError> {
    if config.workers == 0 {
        return Err(ConfigError::NoWorkers.into());
    }

    let meta = std::fs::metadata(input_root).map_err(|source| RunError::InputUnreadable {
        path: input_root.to_path_buf(),
        source,
    })?;
    if !meta.is_dir() {
        return Err(RunError::InputNotDirectory(input_root.to_path_buf()));
    }
    std::fs::read_dir(input_root).map_err(|source| RunError::InputUnreadable {
        path: input_root.to_path_buf(),
        source,
    })?;

    let unwritable = |source: std::io::Error| RunError::OutputUnwritable {
        path: output_root.to_path_buf(),
        source,
    };
    match std::fs::metadata(output_root) {
        Ok(meta) if !meta.is_dir() => Err(RunError::OutputNotDirectory(output_root.to_path_buf())),
        Ok(_) => worker::check_writable(output_root).map_err(unwritable),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            if config.dry_run {
                Ok(())
            } else {
                std::fs::create_dir_all(output_root).map_err(unwritable)
            }
        }
        Err(e) => Err(unwritable(e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn setup_rejects_missing_input() {
        let dir = tempfile::tempdir().unwrap();
        let err = validate_setup(
            &dir.path().join("nope"),
            &dir.path().join("out"),
            &BatchConfig::default(),
        )
        .unwrap_err();
        assert!(matches!(err, RunError::InputUnreadable { .. }));
    }

    #[test]
    fn setup_rejects_file_as_input() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("a.pdf");
        std::fs::write(&file, b"x").unwrap();
        let err = validate_setup(&file, &dir.path().join("out"), &BatchConfig::default())
            .unwrap_err();
        assert!(matches!(err, RunError::InputNotDirectory(_)));
    }

    #[test]
    fn setup_rejects_file_as_output() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("out");
        std::fs::write(&file, b"x").unwrap();
        let err = validate_setup(dir.path(), &file, &BatchConfig::default()).unwrap_err();
        assert!(matches!(err, RunError::OutputNotDirectory(_)));
    }

    #[test]
    fn setup_rejects_zero_workers() {
        let dir = tempfile::tempdir().unwrap();
        let config = BatchConfig {
            workers: 0,
            ..Default::default()
        };
        let err = validate_setup(dir.path(), dir.path(), &config).unwrap_err();
        assert!(matches!(err, RunError::Config(ConfigError::NoWorkers)));
    }

    #[test]
    fn setup_creates_output_root_unless_dry_run() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("a").join("b");

        let dry = BatchConfig {
            dry_run: true,
            ..Default::default()
        };
        validate_setup(dir.path(), &out, &dry).unwrap();
        assert!(!out.exists());

        validate_setup(dir.path(), &out, &BatchConfig::default()).unwrap();
        assert!(out.is_dir());
    }

    #[cfg(unix)]
    #[test]
    fn setup_rejects_read_only_output() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out");
        std::fs::create_dir(&out).unwrap();
        std::fs::set_permissions(&out, std::fs::Permissions::from_mode(0o555)).unwrap();
        // Root ignores permission bits
        if std::fs::write(out.join("x"), b"x").is_ok() {
            return;
        }

        let err = validate_setup(dir.path(), &out, &BatchConfig::default()).unwrap_err();
        assert!(matches!(err, RunError::OutputUnwritable { .. }));
        std::fs::set_permissions(&out, std::fs::Permissions::from_mode(0o755)).unwrap();
    }

    fn recorded(dir: &Path) -> (Candidate, HashStore) {
        let input = dir.join("a.pdf");
        let output = dir.join("a.txt");
        std::fs::write(&input, b"same bytes").unwrap();
        std::fs::write(&output, b"text").unwrap();
        let mut store = HashStore::load(dir.join("store.json"));
        store.record(&input, hash_store::fingerprint(&input).unwrap());
        let candidate = Candidate {
            input_path: input,
            output_path: output,
            relative_path: PathBuf::from("a.pdf"),
        };
        (candidate, store)
    }

    #[test]
    fn unchanged_file_with_artifact_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let (candidate, store) = recorded(dir.path());

        let fresh = CancellationToken::new();
        let plan = plan_skips(vec![candidate.clone()], Some(&store), false, &fresh);
        assert_eq!(plan.skipped.len(), 1);
        assert!(plan.jobs.is_empty());

        // Compressed artifact is missing
        let plan = plan_skips(vec![candidate.clone()], Some(&store), true, &fresh);
        assert_eq!(plan.jobs.len(), 1);

        let plan = plan_skips(vec![candidate], None, false, &fresh);
        assert_eq!(plan.jobs.len(), 1);
    }

    #[test]
    fn planning_stops_hashing_once_cancelled() {
        let dir = tempfile::tempdir().unwrap();
        let (candidate, store) = recorded(dir.path());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let plan = plan_skips(vec![candidate], Some(&store), false, &cancel);
        assert!(plan.skipped.is_empty());
        assert_eq!(plan.jobs.len(), 1);
        assert_eq!(plan.jobs[0].index, 0);
    }
}

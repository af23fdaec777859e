//! Single-file conversion.
//!
//! [`process`] touches only its own candidate's input and outputs and never
//! panics or returns an error past its boundary: every failure is folded
//! into the returned [`ConversionResult`].

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use flate2::Compression;
use flate2::write::GzEncoder;
use tempfile::NamedTempFile;
use tokio_util::sync::CancellationToken;

use crate::hash_store;
use crate::{
    Candidate, CommandTemplate, ConversionError, ConversionResult, GZIP_SUFFIX, PdfBackend,
    append_suffix,
};

/// Per-file behavior switches.
#[derive(Debug, Clone, Default)]
pub struct ConversionOptions {
    pub dry_run: bool,
    pub extract_metadata: bool,
    pub compress: bool,
    pub command: Option<CommandTemplate>,
    /// Fingerprint the input before extraction so the orchestrator can
    /// record what was actually converted.
    pub record_fingerprint: bool,
}

/// What a worker needs to convert a file. Cheap to clone; shared read-only.
#[derive(Clone)]
pub struct WorkerContext {
    pub backend: Arc<dyn PdfBackend>,
    pub options: Arc<ConversionOptions>,
}

impl WorkerContext {
    pub fn new(backend: Arc<dyn PdfBackend>, options: ConversionOptions) -> Self {
        Self {
            backend,
            options: Arc::new(options),
        }
    }
}

impl std::fmt::Debug for WorkerContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerContext")
            .field("backend", &"<dyn PdfBackend>")
            .field("options", &self.options)
            .finish()
    }
}

/// Convert one candidate.
pub fn process(candidate: Candidate, ctx: &WorkerContext) -> ConversionResult {
    process_until(candidate, ctx, &CancellationToken::new())
}

/// Like [`process`], but stops before writing anything once `abandoned`
/// is cancelled (the caller has stopped waiting for this file).
pub fn process_until(
    candidate: Candidate,
    ctx: &WorkerContext,
    abandoned: &CancellationToken,
) -> ConversionResult {
    let start = Instant::now();

    if ctx.options.dry_run {
        return match validate(&candidate) {
            Ok(()) => ConversionResult::dry_run(candidate, start.elapsed()),
            Err(e) => ConversionResult::failed(candidate, e, start.elapsed()),
        };
    }

    match convert(&candidate, ctx, abandoned) {
        Ok(done) => ConversionResult::converted(
            candidate,
            done.bytes_written,
            done.warnings,
            start.elapsed(),
        )
        .with_fingerprint(done.fingerprint),
        Err(e) => ConversionResult::failed(candidate, e, start.elapsed()),
    }
}

struct Converted {
    bytes_written: u64,
    warnings: Vec<String>,
    fingerprint: Option<String>,
}

fn convert(
    candidate: &Candidate,
    ctx: &WorkerContext,
    abandoned: &CancellationToken,
) -> Result<Converted, ConversionError> {
    let options = &ctx.options;
    let input = candidate.input_path.as_path();

    File::open(input).map_err(|source| ConversionError::InputUnreadable {
        path: input.to_path_buf(),
        source,
    })?;

    let fingerprint = if options.record_fingerprint {
        match hash_store::fingerprint(input) {
            Ok(fp) => Some(fp),
            Err(e) => {
                tracing::warn!(error = %e, "hashing failed, result will not be recorded");
                None
            }
        }
    } else {
        None
    };

    let text = ctx.backend.extract_text(input)?;
    if abandoned.is_cancelled() {
        return Err(ConversionError::Abandoned);
    }

    let output = candidate.output_path.as_path();
    let dir = parent_dir(output);
    std::fs::create_dir_all(dir).map_err(|e| ConversionError::OutputUnwritable {
        path: dir.to_path_buf(),
        reason: e.to_string(),
    })?;
    write_atomic(output, text.as_bytes())?;
    tracing::debug!(input = %input.display(), output = %output.display(), chars = text.len(), "wrote text");

    let mut warnings = Vec::new();

    if options.extract_metadata {
        if let Err(e) = write_metadata(candidate, ctx.backend.as_ref()) {
            warnings.push(e.to_string());
        }
    }

    let artifact = if options.compress {
        gzip_replace(output)?
    } else {
        output.to_path_buf()
    };

    let bytes_written = std::fs::metadata(&artifact)
        .map(|m| m.len())
        .map_err(|source| ConversionError::Write {
            path: artifact.clone(),
            source,
        })?;

    if let Some(command) = &options.command {
        match command.run(&artifact) {
            Ok(outcome) => {
                tracing::debug!(
                    command = %command.render(&artifact),
                    stdout = %outcome.stdout.trim(),
                    stderr = %outcome.stderr.trim(),
                    "post-processing command finished"
                );
            }
            Err(e) => warnings.push(ConversionError::Command(e).to_string()),
        }
    }

    Ok(Converted {
        bytes_written,
        warnings,
        fingerprint,
    })
}

fn write_metadata(candidate: &Candidate, backend: &dyn PdfBackend) -> Result<(), ConversionError> {
    let metadata = backend
        .extract_metadata(&candidate.input_path)
        .map_err(ConversionError::Metadata)?;
    let mut json = serde_json::to_string_pretty(&metadata)?;
    json.push('\n');
    write_atomic(&candidate.metadata_path(), json.as_bytes())
}

/// Check what a real conversion would need without changing anything.
fn validate(candidate: &Candidate) -> Result<(), ConversionError> {
    let input = &candidate.input_path;
    File::open(input).map_err(|source| ConversionError::InputUnreadable {
        path: input.clone(),
        source,
    })?;

    let dir = parent_dir(&candidate.output_path);
    let existing = nearest_existing_ancestor(dir);
    let unwritable = |reason: &str| ConversionError::OutputUnwritable {
        path: dir.to_path_buf(),
        reason: reason.to_string(),
    };

    let Some(existing) = existing else {
        return Err(unwritable("no existing ancestor directory"));
    };
    let meta = std::fs::metadata(&existing).map_err(|e| unwritable(&e.to_string()))?;
    if !meta.is_dir() {
        return Err(unwritable(&format!("{} is not a directory", existing.display())));
    }
    check_writable(&existing)
        .map_err(|e| unwritable(&format!("{} is not writable: {e}", existing.display())))
}

/// Whether this process may create entries in `dir`.
#[cfg(unix)]
pub(crate) fn check_writable(dir: &Path) -> std::io::Result<()> {
    use nix::unistd::{AccessFlags, access};
    access(dir, AccessFlags::W_OK | AccessFlags::X_OK).map_err(std::io::Error::from)
}

#[cfg(not(unix))]
pub(crate) fn check_writable(dir: &Path) -> std::io::Result<()> {
    if std::fs::metadata(dir)?.permissions().readonly() {
        return Err(std::io::ErrorKind::PermissionDenied.into());
    }
    Ok(())
}

fn nearest_existing_ancestor(dir: &Path) -> Option<PathBuf> {
    dir.ancestors()
        .find(|p| !p.as_os_str().is_empty() && p.exists())
        .map(Path::to_path_buf)
        .or_else(|| std::env::current_dir().ok())
}

fn parent_dir(path: &Path) -> &Path {
    match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    }
}

fn write_err(path: &Path) -> impl Fn(std::io::Error) -> ConversionError + '_ {
    move |source| ConversionError::Write {
        path: path.to_path_buf(),
        source,
    }
}

/// Write through a temp file in the target directory, then rename into place.
fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), ConversionError> {
    let mut tmp = NamedTempFile::new_in(parent_dir(path)).map_err(write_err(path))?;
    tmp.write_all(bytes).map_err(write_err(path))?;
    tmp.persist(path).map_err(|e| write_err(path)(e.error))?;
    Ok(())
}

/// Gzip `path` to `path.gz` and delete `path` once the archive is in place.
fn gzip_replace(path: &Path) -> Result<PathBuf, ConversionError> {
    let target = append_suffix(path, GZIP_SUFFIX);
    let mut source = File::open(path).map_err(write_err(path))?;

    let tmp = NamedTempFile::new_in(parent_dir(path)).map_err(write_err(&target))?;
    let mut encoder = GzEncoder::new(tmp, Compression::default());
    std::io::copy(&mut source, &mut encoder).map_err(write_err(&target))?;
    let tmp = encoder.finish().map_err(write_err(&target))?;
    tmp.as_file().sync_all().map_err(write_err(&target))?;
    tmp.persist(&target)
        .map_err(|e| write_err(&target)(e.error))?;

    drop(source);
    std::fs::remove_file(path).map_err(write_err(path))?;
    Ok(target)
}

#[cfg(test)]
mod tests {
    use std::io::Read;

    use flate2::read::GzDecoder;

    use super::*;
    use crate::ConversionStatus;
    use crate::mock::MockBackend;

    struct Fixture {
        _dir: tempfile::TempDir,
        input_root: PathBuf,
        output_root: PathBuf,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let input_root = dir.path().join("in");
            let output_root = dir.path().join("out");
            std::fs::create_dir_all(&input_root).unwrap();
            Self {
                _dir: dir,
                input_root,
                output_root,
            }
        }

        fn candidate(&self, rel: &str, content: &str) -> Candidate {
            let input = self.input_root.join(rel);
            std::fs::create_dir_all(input.parent().unwrap()).unwrap();
            std::fs::write(&input, content).unwrap();
            crate::PathMapper::new(&self.input_root, &self.output_root, true).map(&input)
        }
    }

    fn ctx(options: ConversionOptions) -> WorkerContext {
        WorkerContext::new(Arc::new(MockBackend::new()), options)
    }

    #[test]
    fn converts_into_nested_output_dirs() {
        let fx = Fixture::new();
        let c = fx.candidate("deep/er/a.pdf", "hello world\n");

        let result = process(c.clone(), &ctx(ConversionOptions::default()));
        assert_eq!(result.status, ConversionStatus::Converted);
        assert_eq!(std::fs::read_to_string(&c.output_path).unwrap(), "hello world\n");
        assert_eq!(result.bytes_written, Some(12));
        assert!(result.warnings.is_empty());
    }

    #[test]
    fn extraction_failure_is_captured() {
        let fx = Fixture::new();
        let c = fx.candidate("b.pdf", "%ENCRYPTED");

        let result = process(c.clone(), &ctx(ConversionOptions::default()));
        assert_eq!(result.status, ConversionStatus::Failed);
        assert!(result.error.unwrap().contains("encrypted"));
        assert!(!c.output_path.exists());
    }

    #[test]
    fn missing_input_fails() {
        let fx = Fixture::new();
        let c = fx.candidate("gone.pdf", "x");
        std::fs::remove_file(&c.input_path).unwrap();

        let result = process(c, &ctx(ConversionOptions::default()));
        assert_eq!(result.status, ConversionStatus::Failed);
        assert!(result.error.unwrap().starts_with("cannot read input"));
    }

    #[test]
    fn metadata_sidecar_is_written() {
        let fx = Fixture::new();
        let c = fx.candidate("a.pdf", "Quarterly Report\nbody");

        let options = ConversionOptions {
            extract_metadata: true,
            ..Default::default()
        };
        let result = process(c.clone(), &ctx(options));
        assert_eq!(result.status, ConversionStatus::Converted);

        let json: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(c.metadata_path()).unwrap()).unwrap();
        assert_eq!(json["title"], "Quarterly Report");
    }

    #[test]
    fn metadata_failure_keeps_text_output() {
        let fx = Fixture::new();
        let c = fx.candidate("a.pdf", "%NO-META\nstill text");

        let options = ConversionOptions {
            extract_metadata: true,
            ..Default::default()
        };
        let result = process(c.clone(), &ctx(options));
        assert_eq!(result.status, ConversionStatus::Converted);
        assert_eq!(result.warnings.len(), 1);
        assert!(result.warnings[0].starts_with("metadata extraction failed"));
        assert!(c.output_path.exists());
        assert!(!c.metadata_path().exists());
    }

    #[test]
    fn compression_replaces_text_with_gzip() {
        let fx = Fixture::new();
        let c = fx.candidate("a.pdf", "compress me please");

        let options = ConversionOptions {
            compress: true,
            ..Default::default()
        };
        let result = process(c.clone(), &ctx(options));
        assert_eq!(result.status, ConversionStatus::Converted);
        assert!(!c.output_path.exists());

        let gz = c.artifact_path(true);
        let mut decoded = String::new();
        GzDecoder::new(File::open(&gz).unwrap())
            .read_to_string(&mut decoded)
            .unwrap();
        assert_eq!(decoded, "compress me please");
        assert_eq!(result.bytes_written, Some(std::fs::metadata(&gz).unwrap().len()));
    }

    #[test]
    fn dry_run_touches_nothing() {
        let fx = Fixture::new();
        let c = fx.candidate("sub/a.pdf", "text");

        let options = ConversionOptions {
            dry_run: true,
            compress: true,
            extract_metadata: true,
            ..Default::default()
        };
        let backend = Arc::new(MockBackend::new());
        let result = process(c, &WorkerContext::new(backend.clone(), options));
        assert_eq!(result.status, ConversionStatus::DryRun);
        assert!(!fx.output_root.exists());
        assert_eq!(backend.text_calls(), 0);
        assert_eq!(backend.metadata_calls(), 0);
    }

    #[test]
    fn file_in_place_of_output_dir_fails() {
        let fx = Fixture::new();
        let c = fx.candidate("sub/a.pdf", "text");
        std::fs::create_dir_all(&fx.output_root).unwrap();
        std::fs::write(fx.output_root.join("sub"), "not a directory").unwrap();

        let result = process(c.clone(), &ctx(ConversionOptions::default()));
        assert_eq!(result.status, ConversionStatus::Failed);
        assert!(result.error.as_deref().unwrap().contains("not writable"));

        let options = ConversionOptions {
            dry_run: true,
            ..Default::default()
        };
        let result = process(c, &ctx(options));
        assert_eq!(result.status, ConversionStatus::Failed);
        assert!(result.error.as_deref().unwrap().contains("is not a directory"));
    }

    #[cfg(unix)]
    #[test]
    fn read_only_output_dir_fails() {
        use std::os::unix::fs::PermissionsExt;

        let fx = Fixture::new();
        let c = fx.candidate("sub/a.pdf", "text");
        std::fs::create_dir_all(&fx.output_root).unwrap();
        std::fs::set_permissions(&fx.output_root, std::fs::Permissions::from_mode(0o555))
            .unwrap();
        // Root ignores permission bits
        if std::fs::create_dir(fx.output_root.join("writable")).is_ok() {
            return;
        }

        let options = ConversionOptions {
            dry_run: true,
            ..Default::default()
        };
        let result = process(c.clone(), &ctx(options));
        assert_eq!(result.status, ConversionStatus::Failed);
        assert!(result.error.as_deref().unwrap().contains("not writable"));

        let result = process(c.clone(), &ctx(ConversionOptions::default()));
        assert_eq!(result.status, ConversionStatus::Failed);
        assert!(!c.output_path.exists());

        std::fs::set_permissions(&fx.output_root, std::fs::Permissions::from_mode(0o755))
            .unwrap();
    }

    #[test]
    fn writable_dir_passes_access_check() {
        let dir = tempfile::tempdir().unwrap();
        assert!(check_writable(dir.path()).is_ok());
        assert!(check_writable(&dir.path().join("absent")).is_err());
    }

    #[test]
    fn abandoned_conversion_writes_nothing() {
        let fx = Fixture::new();
        let c = fx.candidate("sub/a.pdf", "text");
        let abandoned = CancellationToken::new();
        abandoned.cancel();

        let result = process_until(c.clone(), &ctx(ConversionOptions::default()), &abandoned);
        assert_eq!(result.status, ConversionStatus::Failed);
        assert!(result.error.as_deref().unwrap().contains("abandoned"));
        assert!(!fx.output_root.exists());
    }

    #[test]
    fn fingerprint_is_taken_only_when_requested() {
        let fx = Fixture::new();
        let c = fx.candidate("a.pdf", "text");

        let result = process(c.clone(), &ctx(ConversionOptions::default()));
        assert_eq!(result.fingerprint, None);

        let options = ConversionOptions {
            record_fingerprint: true,
            ..Default::default()
        };
        let result = process(c.clone(), &ctx(options));
        assert_eq!(
            result.fingerprint,
            Some(hash_store::fingerprint(&c.input_path).unwrap())
        );
    }

    #[test]
    fn dry_run_reports_unreadable_input() {
        let fx = Fixture::new();
        let c = fx.candidate("a.pdf", "text");
        std::fs::remove_file(&c.input_path).unwrap();

        let options = ConversionOptions {
            dry_run: true,
            ..Default::default()
        };
        assert_eq!(process(c, &ctx(options)).status, ConversionStatus::Failed);
    }

    #[cfg(unix)]
    #[test]
    fn command_runs_on_final_artifact() {
        let fx = Fixture::new();
        let c = fx.candidate("a.pdf", "text");
        let copy = fx.input_root.join("copied.gz");

        let options = ConversionOptions {
            compress: true,
            command: Some(
                CommandTemplate::parse(&format!("cp {{}} '{}'", copy.display())).unwrap(),
            ),
            ..Default::default()
        };
        let result = process(c.clone(), &ctx(options));
        assert_eq!(result.status, ConversionStatus::Converted);
        assert!(result.warnings.is_empty());
        assert_eq!(
            std::fs::read(&copy).unwrap(),
            std::fs::read(c.artifact_path(true)).unwrap()
        );
    }

    #[cfg(unix)]
    #[test]
    fn failing_command_is_a_warning() {
        let fx = Fixture::new();
        let c = fx.candidate("a.pdf", "text");

        let options = ConversionOptions {
            command: Some(CommandTemplate::parse("false {}").unwrap()),
            ..Default::default()
        };
        let result = process(c.clone(), &ctx(options));
        assert_eq!(result.status, ConversionStatus::Converted);
        assert_eq!(result.warnings.len(), 1);
        assert!(result.warnings[0].starts_with("post-processing command failed"));
        assert!(c.output_path.exists());
    }
}

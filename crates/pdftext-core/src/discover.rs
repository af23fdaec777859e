//! Input tree traversal: ignore rules, output path mapping, candidate walk.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};

use globset::{Glob, GlobSet, GlobSetBuilder};
use thiserror::Error;
use walkdir::{DirEntry, WalkDir};

use crate::{Candidate, ConfigError};

/// Extension (case-insensitive) of files picked up by discovery.
pub const INPUT_EXTENSION: &str = "pdf";
/// Extension of the text outputs.
pub const TEXT_EXTENSION: &str = "txt";

#[derive(Error, Debug)]
pub enum DiscoveryError {
    #[error("cannot list {path}: {message}")]
    Walk { path: PathBuf, message: String },
}

impl DiscoveryError {
    pub fn path(&self) -> &Path {
        match self {
            DiscoveryError::Walk { path, .. } => path,
        }
    }
}

/// Two inputs that would write the same output file.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{} and {} both map to {}", .first.display(), .second.display(), .output.display())]
pub struct OutputCollision {
    pub output: PathBuf,
    pub first: PathBuf,
    pub second: PathBuf,
}

/// Compiled ignore patterns, fixed for the duration of a run.
#[derive(Debug, Clone)]
pub struct IgnoreRules {
    patterns: Vec<String>,
    set: GlobSet,
}

impl Default for IgnoreRules {
    fn default() -> Self {
        Self {
            patterns: Vec::new(),
            set: GlobSet::empty(),
        }
    }
}

impl IgnoreRules {
    /// Compile glob patterns. Matching is case-sensitive.
    pub fn new<I, S>(patterns: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let patterns: Vec<String> = patterns.into_iter().map(Into::into).collect();
        let mut builder = GlobSetBuilder::new();
        for pattern in &patterns {
            let glob = Glob::new(pattern).map_err(|e| ConfigError::InvalidPattern {
                pattern: pattern.clone(),
                message: e.kind().to_string(),
            })?;
            builder.add(glob);
        }
        let set = builder.build().map_err(|e| ConfigError::InvalidPattern {
            pattern: patterns.join(" "),
            message: e.to_string(),
        })?;
        Ok(Self { patterns, set })
    }

    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }

    /// A path (relative to the input root) is ignored when any pattern
    /// matches the whole path or any single segment of it, file name included.
    pub fn is_ignored(&self, relative: &Path) -> bool {
        if self.set.is_empty() {
            return false;
        }
        if self.set.is_match(relative) {
            return true;
        }
        relative.components().any(|c| match c {
            Component::Normal(segment) => self.set.is_match(Path::new(segment)),
            _ => false,
        })
    }
}

/// Pure mapping from input path to output path.
#[derive(Debug, Clone)]
pub struct PathMapper {
    input_root: PathBuf,
    output_root: PathBuf,
    preserve_structure: bool,
}

impl PathMapper {
    pub fn new(
        input_root: impl Into<PathBuf>,
        output_root: impl Into<PathBuf>,
        preserve_structure: bool,
    ) -> Self {
        Self {
            input_root: input_root.into(),
            output_root: output_root.into(),
            preserve_structure,
        }
    }

    /// Build the candidate for `input`, which must live under the input root.
    ///
    /// Preserving structure mirrors the relative path under the output root;
    /// otherwise every output lands directly in the output root.
    pub fn map(&self, input: &Path) -> Candidate {
        let relative = match input.strip_prefix(&self.input_root) {
            Ok(rel) => rel.to_path_buf(),
            Err(_) => PathBuf::from(input.file_name().unwrap_or(input.as_os_str())),
        };

        let output_path = if self.preserve_structure {
            self.output_root.join(relative.with_extension(TEXT_EXTENSION))
        } else {
            let stem = relative
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default();
            self.output_root.join(format!("{stem}.{TEXT_EXTENSION}"))
        };

        Candidate {
            input_path: input.to_path_buf(),
            output_path,
            relative_path: relative,
        }
    }
}

fn is_input_file(entry: &DirEntry) -> bool {
    let is_file = entry.file_type().is_file()
        || (entry.path_is_symlink() && entry.path().is_file());
    is_file
        && entry
            .path()
            .extension()
            .is_some_and(|e| e.eq_ignore_ascii_case(INPUT_EXTENSION))
}

/// Everything a full walk produced.
#[derive(Debug, Default)]
pub struct Discovery {
    pub candidates: Vec<Candidate>,
    pub errors: Vec<DiscoveryError>,
    pub ignored: usize,
}

/// Walks an input root and yields [`Candidate`]s.
#[derive(Debug, Clone)]
pub struct Discoverer {
    input_root: PathBuf,
    mapper: PathMapper,
    rules: IgnoreRules,
    /// Output root relative to the input root, when nested inside it.
    nested_output: Option<PathBuf>,
}

impl Discoverer {
    pub fn new(
        input_root: impl Into<PathBuf>,
        output_root: impl Into<PathBuf>,
        preserve_structure: bool,
        rules: IgnoreRules,
    ) -> Self {
        let input_root = input_root.into();
        let output_root = output_root.into();
        let nested_output = match (
            std::fs::canonicalize(&input_root),
            std::fs::canonicalize(&output_root),
        ) {
            (Ok(input), Ok(output)) if output != input => output
                .strip_prefix(&input)
                .ok()
                .map(Path::to_path_buf),
            _ => None,
        };

        Self {
            mapper: PathMapper::new(&input_root, output_root, preserve_structure),
            input_root,
            rules,
            nested_output,
        }
    }

    /// Start a fresh lazy walk. Each call restarts from the root, and entries
    /// come out sorted by file name so repeated walks agree.
    pub fn iter(&self) -> Candidates<'_> {
        let root = self.input_root.as_path();
        let rules = &self.rules;
        let nested_output = self.nested_output.as_deref();

        let walker = WalkDir::new(root)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(move |entry| {
                if entry.depth() == 0 || !entry.file_type().is_dir() {
                    return true;
                }
                let Ok(relative) = entry.path().strip_prefix(root) else {
                    return true;
                };
                if nested_output == Some(relative) {
                    return false;
                }
                if rules.is_ignored(relative) {
                    tracing::debug!(path = %entry.path().display(), "ignoring directory");
                    return false;
                }
                true
            });

        Candidates {
            discoverer: self,
            inner: Box::new(walker),
            ignored: 0,
        }
    }

    /// Run a complete walk, collecting candidates and per-subtree errors.
    pub fn discover(&self) -> Discovery {
        let mut discovery = Discovery::default();
        let mut walk = self.iter();
        for item in walk.by_ref() {
            match item {
                Ok(candidate) => discovery.candidates.push(candidate),
                Err(e) => {
                    tracing::warn!(error = %e, "discovery error, skipping subtree");
                    discovery.errors.push(e);
                }
            }
        }
        discovery.ignored = walk.ignored();
        discovery
    }
}

/// Lazy candidate sequence returned by [`Discoverer::iter`].
pub struct Candidates<'a> {
    discoverer: &'a Discoverer,
    inner: Box<dyn Iterator<Item = walkdir::Result<DirEntry>> + 'a>,
    ignored: usize,
}

impl Candidates<'_> {
    /// Number of input files dropped by ignore rules so far.
    pub fn ignored(&self) -> usize {
        self.ignored
    }
}

impl Iterator for Candidates<'_> {
    type Item = Result<Candidate, DiscoveryError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let entry = match self.inner.next()? {
                Ok(entry) => entry,
                Err(e) => {
                    let path = e
                        .path()
                        .unwrap_or(self.discoverer.input_root.as_path())
                        .to_path_buf();
                    let message = e
                        .io_error()
                        .map(|io| io.to_string())
                        .unwrap_or_else(|| e.to_string());
                    return Some(Err(DiscoveryError::Walk { path, message }));
                }
            };

            if !is_input_file(&entry) {
                continue;
            }

            let candidate = self.discoverer.mapper.map(entry.path());
            if self.discoverer.rules.is_ignored(&candidate.relative_path) {
                tracing::info!(path = %entry.path().display(), "ignoring file based on ignore patterns");
                self.ignored += 1;
                continue;
            }
            return Some(Ok(candidate));
        }
    }
}

/// Reject candidate lists where two inputs resolve to the same output.
pub fn check_collisions(candidates: &[Candidate]) -> Result<(), OutputCollision> {
    let mut seen: HashMap<&Path, &Path> = HashMap::with_capacity(candidates.len());
    for candidate in candidates {
        if let Some(first) = seen.insert(&candidate.output_path, &candidate.input_path) {
            return Err(OutputCollision {
                output: candidate.output_path.clone(),
                first: first.to_path_buf(),
                second: candidate.input_path.clone(),
            });
        }
    }
    Ok(())
}

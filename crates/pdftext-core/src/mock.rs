//! Mock extraction backend for tests.
//!
//! Input files are plain UTF-8 text standing in for PDFs. A few marker
//! prefixes on the first line steer the outcome:
//!
//! - `%ENCRYPTED` makes text extraction fail with [`BackendError::Encrypted`].
//! - `%NO-META` makes metadata extraction fail.
//! - `%PANIC` makes text extraction panic.
//! - `%SLOW` sleeps for the configured slow delay before extracting.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use crate::backend::{BackendError, Metadata, PdfBackend};

pub struct MockBackend {
    slow_delay: Duration,
    text_calls: AtomicUsize,
    metadata_calls: AtomicUsize,
}

impl Default for MockBackend {
    fn default() -> Self {
        Self {
            slow_delay: Duration::from_millis(500),
            text_calls: AtomicUsize::new(0),
            metadata_calls: AtomicUsize::new(0),
        }
    }
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay applied to files marked `%SLOW`.
    pub fn with_slow_delay(mut self, delay: Duration) -> Self {
        self.slow_delay = delay;
        self
    }

    /// Number of `extract_text` calls so far.
    pub fn text_calls(&self) -> usize {
        self.text_calls.load(Ordering::SeqCst)
    }

    pub fn metadata_calls(&self) -> usize {
        self.metadata_calls.load(Ordering::SeqCst)
    }

    fn read(path: &Path) -> Result<String, BackendError> {
        std::fs::read_to_string(path).map_err(|e| BackendError::OpenError(e.to_string()))
    }
}

impl PdfBackend for MockBackend {
    fn extract_text(&self, path: &Path) -> Result<String, BackendError> {
        self.text_calls.fetch_add(1, Ordering::SeqCst);
        let content = Self::read(path)?;
        if content.starts_with("%ENCRYPTED") {
            return Err(BackendError::Encrypted);
        }
        if content.starts_with("%PANIC") {
            panic!("mock backend asked to panic on {}", path.display());
        }
        if content.starts_with("%SLOW") {
            std::thread::sleep(self.slow_delay);
        }
        Ok(content)
    }

    fn extract_metadata(&self, path: &Path) -> Result<Metadata, BackendError> {
        self.metadata_calls.fetch_add(1, Ordering::SeqCst);
        let content = Self::read(path)?;
        if content.starts_with("%NO-META") || content.starts_with("%ENCRYPTED") {
            return Err(BackendError::MetadataError("no info dictionary".into()));
        }
        let mut meta = Metadata::new();
        let title = content.lines().next().unwrap_or_default().trim();
        if !title.is_empty() {
            meta.insert("title".into(), title.to_string());
        }
        meta.insert("format".into(), "PDF 1.7".into());
        Ok(meta)
    }
}

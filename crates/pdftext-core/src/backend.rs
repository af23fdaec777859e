use std::collections::BTreeMap;
use std::path::Path;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum BackendError {
    #[error("failed to open PDF: {0}")]
    OpenError(String),
    #[error("PDF is encrypted and requires a password")]
    Encrypted,
    #[error("failed to extract text: {0}")]
    ExtractionError(String),
    #[error("failed to read metadata: {0}")]
    MetadataError(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Document metadata as reported by the backend (info dictionary keys).
pub type Metadata = BTreeMap<String, String>;

/// Trait for PDF extraction backends.
///
/// Implementors are called from blocking worker threads, one file per call,
/// and must not keep per-document state between calls.
pub trait PdfBackend: Send + Sync {
    /// Extract the full text content of a PDF file.
    fn extract_text(&self, path: &Path) -> Result<String, BackendError>;

    /// Extract document metadata as a string map.
    fn extract_metadata(&self, path: &Path) -> Result<Metadata, BackendError>;
}

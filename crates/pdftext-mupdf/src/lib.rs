use std::path::Path;

use mupdf::{Document, MetadataName, TextPageFlags};

use pdftext_core::{BackendError, Metadata, PdfBackend};

/// Info dictionary keys copied into the metadata sidecar, in output order.
const METADATA_KEYS: [(&str, MetadataName); 10] = [
    ("format", MetadataName::Format),
    ("encryption", MetadataName::Encryption),
    ("title", MetadataName::Title),
    ("author", MetadataName::Author),
    ("subject", MetadataName::Subject),
    ("keywords", MetadataName::Keywords),
    ("creator", MetadataName::Creator),
    ("producer", MetadataName::Producer),
    ("creation_date", MetadataName::CreationDate),
    ("mod_date", MetadataName::ModDate),
];

/// MuPDF-based implementation of [`PdfBackend`].
///
/// This crate is the sole AGPL island: it isolates the mupdf dependency
/// (which is AGPL-3.0) so that the orchestration engine does not
/// transitively depend on it.
///
/// Pages are emitted in order, each page's lines followed by a newline and
/// pages separated by a blank line. Ligature expansion is off unless
/// configured.
#[derive(Debug, Clone, Default)]
pub struct MupdfBackend {
    expand_ligatures: bool,
}

impl MupdfBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace typographic ligatures (`ﬁ`, `ﬂ`, ...) with plain letters.
    pub fn with_ligature_expansion(mut self, enabled: bool) -> Self {
        self.expand_ligatures = enabled;
        self
    }

    fn open(path: &Path) -> Result<Document, BackendError> {
        let path_str = path
            .to_str()
            .ok_or_else(|| BackendError::OpenError("invalid path encoding".into()))?;
        Document::open(path_str).map_err(|e| BackendError::OpenError(e.to_string()))
    }
}

impl PdfBackend for MupdfBackend {
    fn extract_text(&self, path: &Path) -> Result<String, BackendError> {
        let document = Self::open(path)?;
        if document
            .needs_password()
            .map_err(|e| BackendError::OpenError(e.to_string()))?
        {
            return Err(BackendError::Encrypted);
        }

        let mut pages_text = Vec::new();

        for page_result in document
            .pages()
            .map_err(|e| BackendError::ExtractionError(e.to_string()))?
        {
            let page = page_result.map_err(|e| BackendError::ExtractionError(e.to_string()))?;
            let text_page = page
                .to_text_page(TextPageFlags::empty())
                .map_err(|e| BackendError::ExtractionError(e.to_string()))?;

            let mut page_text = String::new();
            for block in text_page.blocks() {
                for line in block.lines() {
                    page_text.extend(line.chars().map(|c| c.char().unwrap_or('\u{FFFD}')));
                    page_text.push('\n');
                }
            }
            pages_text.push(page_text);
        }

        let text = pages_text.join("\n");
        Ok(if self.expand_ligatures {
            expand_ligatures(&text)
        } else {
            text
        })
    }

    fn extract_metadata(&self, path: &Path) -> Result<Metadata, BackendError> {
        let document = Self::open(path)?;

        let mut metadata = Metadata::new();
        for (key, name) in METADATA_KEYS {
            let value = document
                .metadata(name)
                .map_err(|e| BackendError::MetadataError(e.to_string()))?;
            let value = value.trim();
            if !value.is_empty() {
                metadata.insert(key.to_string(), value.to_string());
            }
        }
        Ok(metadata)
    }
}

/// Expand common typographic ligatures found in PDFs.
pub fn expand_ligatures(text: &str) -> String {
    text.replace('\u{FB00}', "ff")
        .replace('\u{FB01}', "fi")
        .replace('\u{FB02}', "fl")
        .replace('\u{FB03}', "ffi")
        .replace('\u{FB04}', "ffl")
        .replace(['\u{FB05}', '\u{FB06}'], "st")
}

//! Content extraction: raw resource bytes to plain text.
//!
//! Failing to extract one resource is never fatal. Every outcome is an
//! [`Extraction`], and callers skip resources that come back
//! [`Extraction::Skipped`].
//!
//! Rich formats (PDF and the OOXML family) are decoded in-process. HTML is
//! reduced to its visible text. Anything else is treated as plain text when it
//! looks like text, and skipped as unsupported otherwise.

pub mod document;
pub mod html;

use std::path::Path;
use tokio::io::AsyncReadExt;

/// Bytes sniffed when deciding whether an unknown file is text.
const SNIFF_BYTES: usize = 8 * 1024;

/// Extensions that are always read as plain text.
const TEXT_EXTENSIONS: &[&str] = &[
    "txt", "md", "markdown", "rst", "adoc", "org", "csv", "tsv", "log", "json", "yaml", "yml",
    "toml", "ini", "cfg", "conf", "xml", "rs", "py", "js", "ts", "jsx", "tsx", "go", "java", "kt",
    "c", "h", "cpp", "hpp", "cs", "rb", "php", "swift", "scala", "sh", "bash", "zsh", "sql",
    "css", "scss", "tex",
];

/// Why a resource produced no text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// Larger than the configured cap; nothing was read
    TooLarge { size: u64, limit: u64 },
    /// A binary format with no decoder
    Unsupported(String),
    /// The resource could not be read at all
    Unreadable(String),
    /// The decoder rejected the content
    Malformed(String),
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SkipReason::TooLarge { size, limit } => {
                write!(f, "too large ({size} bytes, limit {limit})")
            }
            SkipReason::Unsupported(kind) => write!(f, "unsupported format: {kind}"),
            SkipReason::Unreadable(e) => write!(f, "unreadable: {e}"),
            SkipReason::Malformed(e) => write!(f, "malformed: {e}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Extraction {
    Text(String),
    Skipped(SkipReason),
}

impl Extraction {
    pub fn text(self) -> Option<String> {
        match self {
            Extraction::Text(text) => Some(text),
            Extraction::Skipped(_) => None,
        }
    }
}

/// A resource loaded into memory, ready for hashing and extraction.
#[derive(Debug, Clone)]
pub struct RawResource {
    /// File path or URL
    pub id: String,
    pub bytes: Vec<u8>,
    /// MIME type reported by the origin, if any
    pub content_type: Option<String>,
}

impl RawResource {
    pub fn new(id: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            id: id.into(),
            bytes,
            content_type: None,
        }
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentKind {
    PlainText,
    Html,
    Pdf,
    Docx,
    Pptx,
    Xlsx,
    Binary,
}

impl DocumentKind {
    pub fn detect(id: &str, bytes: &[u8], content_type: Option<&str>) -> Self {
        let mime = content_type
            .map(|ct| ct.split(';').next().unwrap_or(ct).trim().to_ascii_lowercase());
        match mime.as_deref() {
            Some(document::MIME_PDF) => return DocumentKind::Pdf,
            Some(document::MIME_DOCX) => return DocumentKind::Docx,
            Some(document::MIME_PPTX) => return DocumentKind::Pptx,
            Some(document::MIME_XLSX) => return DocumentKind::Xlsx,
            Some("text/html") | Some("application/xhtml+xml") => return DocumentKind::Html,
            _ => {}
        }

        let ext = extension_of(id);
        match ext.as_deref() {
            Some("pdf") => DocumentKind::Pdf,
            Some("docx") => DocumentKind::Docx,
            Some("pptx") => DocumentKind::Pptx,
            Some("xlsx") => DocumentKind::Xlsx,
            Some("html") | Some("htm") | Some("xhtml") => DocumentKind::Html,
            Some(e) if TEXT_EXTENSIONS.contains(&e) => DocumentKind::PlainText,
            _ if mime.as_deref().is_some_and(|m| m.starts_with("text/")) => {
                DocumentKind::PlainText
            }
            _ if looks_like_text(bytes) => DocumentKind::PlainText,
            _ => DocumentKind::Binary,
        }
    }
}

/// Lowercased extension of a path or URL, ignoring any query string.
pub fn extension_of(id: &str) -> Option<String> {
    let trimmed = id.split(['?', '#']).next().unwrap_or(id);
    let name = trimmed.rsplit(['/', '\\']).next().unwrap_or(trimmed);
    let (stem, ext) = name.rsplit_once('.')?;
    (!stem.is_empty() && !ext.is_empty()).then(|| ext.to_ascii_lowercase())
}

/// No NUL bytes in the sniffed prefix and it decodes as UTF-8 (allowing a
/// multi-byte character cut at the sniff boundary).
pub fn looks_like_text(bytes: &[u8]) -> bool {
    let prefix = &bytes[..bytes.len().min(SNIFF_BYTES)];
    if prefix.contains(&0) {
        return false;
    }
    match std::str::from_utf8(prefix) {
        Ok(_) => true,
        Err(e) => e.error_len().is_none() && prefix.len() == SNIFF_BYTES,
    }
}

/// Turns loaded resources into text.
pub trait ContentExtractor: Send + Sync {
    /// Whether line numbers are meaningful for this resource. Rich and binary
    /// formats always report false.
    fn is_text_like(&self, resource: &RawResource) -> bool;

    fn extract(&self, resource: &RawResource) -> Extraction;
}

/// Default extractor covering plain text, HTML, PDF and OOXML.
#[derive(Debug, Clone, Default)]
pub struct DocumentExtractor;

impl DocumentExtractor {
    pub fn new() -> Self {
        Self
    }

    /// Read a file and extract it, refusing files above `max_bytes`.
    pub async fn extract_path(&self, path: &Path, max_bytes: u64) -> Extraction {
        let id = path.to_string_lossy().into_owned();
        match read_bounded(path, max_bytes).await {
            Ok(bytes) => self.extract(&RawResource::new(id, bytes)),
            Err(reason) => Extraction::Skipped(reason),
        }
    }
}

impl ContentExtractor for DocumentExtractor {
    fn is_text_like(&self, resource: &RawResource) -> bool {
        DocumentKind::detect(
            &resource.id,
            &resource.bytes,
            resource.content_type.as_deref(),
        ) == DocumentKind::PlainText
    }

    fn extract(&self, resource: &RawResource) -> Extraction {
        let kind = DocumentKind::detect(
            &resource.id,
            &resource.bytes,
            resource.content_type.as_deref(),
        );
        let bytes = resource.bytes.as_slice();
        let result = match kind {
            DocumentKind::PlainText => Ok(decode_text(bytes)),
            DocumentKind::Html => Ok(html::html_to_text(&decode_text(bytes))),
            DocumentKind::Pdf => document::extract_pdf(bytes),
            DocumentKind::Docx => document::extract_docx(bytes),
            DocumentKind::Pptx => document::extract_pptx(bytes),
            DocumentKind::Xlsx => document::extract_xlsx(bytes),
            DocumentKind::Binary => {
                let label = extension_of(&resource.id).unwrap_or_else(|| "binary".to_string());
                return Extraction::Skipped(SkipReason::Unsupported(label));
            }
        };
        match result {
            Ok(text) => Extraction::Text(text),
            Err(e) => {
                tracing::debug!("Extraction failed for {}: {}", resource.id, e);
                Extraction::Skipped(SkipReason::Malformed(e.to_string()))
            }
        }
    }
}

/// UTF-8 decode with replacement, dropping a leading byte-order mark.
fn decode_text(bytes: &[u8]) -> String {
    let bytes = bytes.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(bytes);
    String::from_utf8_lossy(bytes).into_owned()
}

/// Read a whole file unless it is larger than `max_bytes`.
pub async fn read_bounded(path: &Path, max_bytes: u64) -> Result<Vec<u8>, SkipReason> {
    let metadata = tokio::fs::metadata(path)
        .await
        .map_err(|e| SkipReason::Unreadable(e.to_string()))?;
    if metadata.len() > max_bytes {
        return Err(SkipReason::TooLarge {
            size: metadata.len(),
            limit: max_bytes,
        });
    }

    let file = tokio::fs::File::open(path)
        .await
        .map_err(|e| SkipReason::Unreadable(e.to_string()))?;
    let mut bytes = Vec::with_capacity(metadata.len() as usize);
    // The file may have grown since the metadata call
    file.take(max_bytes + 1)
        .read_to_end(&mut bytes)
        .await
        .map_err(|e| SkipReason::Unreadable(e.to_string()))?;
    if bytes.len() as u64 > max_bytes {
        return Err(SkipReason::TooLarge {
            size: bytes.len() as u64,
            limit: max_bytes,
        });
    }
    Ok(bytes)
}

use lopdf::Document;
use thiserror::Error;

/// Text pulled out of one fetched document.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtractedDocument {
    /// Page texts concatenated in page order.
    pub text: String,
    /// Number of pages seen.
    pub page_count: usize,
    /// 1-based pages whose text could not be decoded.
    pub failed_pages: Vec<u32>,
}

impl ExtractedDocument {
    /// Whether any page yielded text.
    #[must_use]
    pub fn has_text(&self) -> bool {
        !self.text.trim().is_empty()
    }
}

/// Errors raised before any page could be read.
#[derive(Debug, Error)]
pub enum ExtractError {
    /// Bytes are not a readable paginated document.
    #[error("document could not be parsed: {0}")]
    Unreadable(String),
    /// Document is encrypted.
    #[error("document is encrypted")]
    Encrypted,
}

/// Converts document bytes to text. Implementations are CPU-bound and are
/// driven from a blocking task.
pub trait TextExtractor: Send + Sync {
    /// Extracts the text of every page; a failing page contributes nothing.
    fn extract(&self, bytes: &[u8]) -> Result<ExtractedDocument, ExtractError>;
}

/// PDF text extraction backed by `lopdf`.
#[derive(Debug, Clone, Copy, Default)]
pub struct PdfTextExtractor;

impl TextExtractor for PdfTextExtractor {
    fn extract(&self, bytes: &[u8]) -> Result<ExtractedDocument, ExtractError> {
        let document =
            Document::load_mem(bytes).map_err(|err| ExtractError::Unreadable(err.to_string()))?;
        if document.is_encrypted() {
            return Err(ExtractError::Encrypted);
        }
        let pages = document.get_pages();
        let mut extracted = ExtractedDocument {
            page_count: pages.len(),
            ..ExtractedDocument::default()
        };
        // BTreeMap keys keep page order.
        for page in pages.keys() {
            match document.extract_text(&[*page]) {
                Ok(text) => extracted.text.push_str(&text),
                Err(err) => {
                    tracing::debug!(page, error = %err, "page text extraction failed");
                    extracted.failed_pages.push(*page);
                }
            }
        }
        Ok(extracted)
    }
}

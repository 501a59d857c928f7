//! Content Store: the current document's extracted text and metadata.
//!
//! Text extraction from PDFs happens outside the relay. This module accepts
//! the extractor's output (one string per page, or already-joined text) and
//! provides the single lossy prefix cut applied whenever document text
//! enters a prompt.

use serde::{Deserialize, Serialize};

use crate::error::{EruditeError, Result};

/// Maximum accepted size of extracted document text (2 MiB).
pub const MAX_DOCUMENT_SIZE: u64 = 2 * 1024 * 1024;

/// Author recorded when the extractor reports none.
const UNKNOWN_AUTHOR: &str = "Unknown";

/// Marker prefix the extractor writes before each page.
const PAGE_MARKER: &str = "--- Page ";

/// Descriptive metadata for a loaded document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentMetadata {
    /// Document title; the file name when the document has none.
    pub title: String,
    /// Author, or `"Unknown"`.
    pub author: String,
    /// Number of pages.
    pub page_count: usize,
    /// Original file name.
    pub file_name: String,
    /// Human-readable size, e.g. `"1.5 KB"`.
    pub file_size: String,
}

/// A document held by the Content Store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    /// Extracted plain text with page markers.
    pub content: String,
    /// Descriptive metadata.
    pub metadata: DocumentMetadata,
}

impl Document {
    /// Builds a document from per-page extracted text.
    ///
    /// Pages are joined as `--- Page N ---` blocks, numbered from 1, and the
    /// result is trimmed.
    ///
    /// # Errors
    ///
    /// Returns `EruditeError::DocumentTooLarge` if the joined text exceeds
    /// [`MAX_DOCUMENT_SIZE`].
    pub fn from_pages<S: AsRef<str>>(file_name: &str, pages: &[S]) -> Result<Self> {
        let mut content = String::new();
        for (index, page) in pages.iter().enumerate() {
            content.push('\n');
            content.push_str(PAGE_MARKER);
            content.push_str(&(index + 1).to_string());
            content.push_str(" ---\n");
            content.push_str(page.as_ref());
        }
        Self::build(file_name, content.trim().to_string(), pages.len())
    }

    /// Wraps text the extractor has already joined.
    ///
    /// The page count is the number of page markers, or 1 for unmarked text.
    ///
    /// # Errors
    ///
    /// Returns `EruditeError::DocumentTooLarge` if the text exceeds
    /// [`MAX_DOCUMENT_SIZE`].
    pub fn from_text(file_name: &str, content: impl Into<String>) -> Result<Self> {
        let content = content.into().trim().to_string();
        let page_count = if content.is_empty() {
            0
        } else {
            content.matches(PAGE_MARKER).count().max(1)
        };
        Self::build(file_name, content, page_count)
    }

    fn build(file_name: &str, content: String, page_count: usize) -> Result<Self> {
        let size = content.len() as u64;
        if size > MAX_DOCUMENT_SIZE {
            return Err(EruditeError::document_too_large(file_name, size / 1024));
        }

        Ok(Self {
            content,
            metadata: DocumentMetadata {
                title: file_name.to_string(),
                author: UNKNOWN_AUTHOR.to_string(),
                page_count,
                file_name: file_name.to_string(),
                file_size: format_file_size(size),
            },
        })
    }

    /// Returns `true` if the document has no text.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.content.is_empty()
    }
}

/// Returns at most the first `max_chars` characters of `text`.
///
/// The cut is a plain prefix: content past the budget is dropped, never
/// summarized. It never splits a UTF-8 scalar.
#[must_use]
pub fn excerpt(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((byte_index, _)) => &text[..byte_index],
        None => text,
    }
}

/// Returns `true` if `excerpt(text, max_chars)` would drop content.
#[must_use]
pub fn is_truncated(text: &str, max_chars: usize) -> bool {
    text.chars().nth(max_chars).is_some()
}

/// Formats a byte count as `"0 Bytes"`, `"1.5 KB"`, `"2 MB"` and so on.
///
/// Two decimal places, trailing zeros dropped.
#[must_use]
pub fn format_file_size(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["Bytes", "KB", "MB", "GB"];

    if bytes == 0 {
        return "0 Bytes".to_string();
    }

    let mut unit = 0;
    let mut divisor: u64 = 1;
    while unit + 1 < UNITS.len() && bytes >= divisor * 1024 {
        divisor *= 1024;
        unit += 1;
    }

    #[allow(clippy::cast_precision_loss)]
    let value = bytes as f64 / divisor as f64;
    let formatted = format!("{value:.2}");
    let trimmed = formatted.trim_end_matches('0').trim_end_matches('.');
    format!("{trimmed} {}", UNITS[unit])
}

//! Uploaded source documents.

use crate::geometry::{OutOfBoundsError, PageDims};
use crate::storage::BlobKey;
use serde::{Deserialize, Serialize};

/// Facts derived from a document at upload time. The bytes themselves live in
/// the document blob store under `key` and are never modified.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentInfo {
    pub key: BlobKey,
    /// Native dimensions of every page, in page order.
    pub pages: Vec<PageDims>,
}

impl DocumentInfo {
    pub fn new(key: BlobKey, pages: Vec<PageDims>) -> Self {
        Self { key, pages }
    }

    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    /// Dimensions of a page, or an error if the index is out of range.
    pub fn page(&self, page_index: usize) -> Result<&PageDims, OutOfBoundsError> {
        self.pages
            .get(page_index)
            .ok_or(OutOfBoundsError::PageOutOfRange {
                page_index,
                page_count: self.pages.len(),
            })
    }
}

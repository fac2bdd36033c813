//! Native PDF library seam
//!
//! Two views of the same library:
//!
//! - [`SecurityBackend`]: the encryption-aware parser, used to detect
//!   encryption, authenticate passwords and re-save documents without
//!   encryption.
//! - [`RasterBackend`]: the plain renderer. It cannot open encrypted files,
//!   which is why decrypted copies are verified through it before use.
//!
//! [`MuPdfBackend`] implements both with MuPDF.

#[cfg(feature = "mupdf")]
mod mupdf;

#[cfg(feature = "mupdf")]
pub use self::mupdf::MuPdfBackend;

use std::path::Path;

use crate::error::BackendError;
use crate::render::bitmap::Bitmap;

/// Access level granted by a successful authentication
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    /// The document was not protected for opening
    Open,
    /// Opened with a password
    Authenticated,
}

/// Result of authenticating a document
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Unlocked {
    pub page_count: usize,
    pub access: Access,
}

/// How an unencrypted copy is written
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RewriteMode {
    /// Honour owner-level restrictions
    Standard,
    /// Ignore owner-level restrictions; decryption must still succeed
    Permissive,
}

/// Encryption-aware document operations
///
/// A backend that enforces owner restrictions reports them as failures
/// whose message mentions "owner password"; the gate treats those as a
/// recognized credential and retries with [`RewriteMode::Permissive`].
pub trait SecurityBackend: Send + Sync {
    /// Parse without a password and return the page count
    fn probe(&self, path: &Path) -> Result<usize, BackendError>;

    /// Authenticate with one password variant
    fn unlock(&self, path: &Path, password: &[u8]) -> Result<Unlocked, BackendError>;

    /// Write an unencrypted copy of `source` to `dest`, returning its page count
    fn rewrite_unencrypted(
        &self,
        source: &Path,
        password: &[u8],
        dest: &Path,
        mode: RewriteMode,
    ) -> Result<usize, BackendError>;
}

/// Plain page renderer
///
/// Documents and pages are only ever touched by one thread at a time; the
/// renderer keeps them behind a lock.
pub trait RasterBackend: Send + Sync {
    type Document: Send;
    type Page: Send;

    fn open(&self, path: &Path) -> Result<Self::Document, BackendError>;

    fn page_count(&self, document: &Self::Document) -> Result<usize, BackendError>;

    fn load_page(&self, document: &Self::Document, index: usize) -> Result<Self::Page, BackendError>;

    /// Native page size in pixels
    fn page_size(&self, page: &Self::Page) -> Result<(u32, u32), BackendError>;

    /// Rasterize `page` scaled to fill `target`
    fn draw(&self, page: &Self::Page, target: &mut Bitmap) -> Result<(), BackendError>;
}

/// A backend usable for the whole pipeline
pub trait PdfBackend: SecurityBackend + RasterBackend + 'static {}

impl<T> PdfBackend for T where T: SecurityBackend + RasterBackend + 'static {}

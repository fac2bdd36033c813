//! Pipeline error types
//!
//! One taxonomy for every failure the rendering core can surface to a
//! viewer. Each variant maps to exactly one user-facing message via
//! [`PipelineError::user_message`]; the `Display` text carries the
//! internal detail and is meant for logs only.

use thiserror::Error;

/// Unified pipeline error type
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Content reference could not be read after retries
    #[error("Source unreachable: {0}")]
    Unreachable(String),

    /// Source exceeds the configured maximum size
    #[error("Source too large: {size} bytes (limit {limit})")]
    TooLarge { size: u64, limit: u64 },

    /// Source is empty, not a PDF, or has no pages
    #[error("Corrupt or empty document: {0}")]
    CorruptOrEmpty(String),

    /// Document is encrypted and no password was supplied
    #[error("Document is password-protected")]
    PasswordRequired,

    /// No password variant authenticated
    #[error("Wrong password")]
    WrongPassword,

    /// Password authenticated but no usable decrypted copy could be produced
    #[error("Unlock failed: {0}")]
    UnlockFailed(String),

    /// Page index outside `0..page_count`
    #[error("Page {index} out of range (document has {page_count} pages)")]
    OutOfRange { index: i64, page_count: usize },

    /// Bitmap allocation failed; retry with a smaller target
    #[error("Out of memory allocating {width}x{height} bitmap")]
    Oom { width: u32, height: u32 },

    /// Opaque native render failure
    #[error("Render error: {0}")]
    RenderError(String),

    /// Operation on a closed document
    #[error("Document is closed")]
    Closed,

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for pipeline operations
pub type Result<T> = std::result::Result<T, PipelineError>;

impl PipelineError {
    /// Human-readable message for the viewer, one per failure class
    pub fn user_message(&self) -> &'static str {
        match self {
            PipelineError::Unreachable(_) => "The file could not be opened. It may have been moved or deleted.",
            PipelineError::TooLarge { .. } => "This file is too large to open.",
            PipelineError::CorruptOrEmpty(_) => "This file is corrupted or empty.",
            PipelineError::PasswordRequired => {
                "This PDF is password-protected. Please enter the password to unlock and view it."
            }
            PipelineError::WrongPassword => "Incorrect password. Please try again.",
            PipelineError::UnlockFailed(_) => "The document could not be unlocked.",
            PipelineError::OutOfRange { .. } => "This page does not exist.",
            PipelineError::Oom { .. } => "Not enough memory to display this page.",
            PipelineError::RenderError(_) => "This page could not be displayed.",
            PipelineError::Closed => "The document has been closed.",
            PipelineError::Io(_) => "The file could not be read.",
        }
    }

    /// Whether the caller may retry the same operation (with a smaller target)
    pub fn is_recoverable(&self) -> bool {
        matches!(self, PipelineError::Oom { .. })
    }

    /// Whether the error only affects a single page (shown as an error tile)
    pub fn is_page_local(&self) -> bool {
        matches!(
            self,
            PipelineError::Oom { .. } | PipelineError::RenderError(_) | PipelineError::OutOfRange { .. }
        )
    }
}

/// Map a failed blocking task into the pipeline error type
pub(crate) fn join_error(err: tokio::task::JoinError) -> PipelineError {
    PipelineError::Io(std::io::Error::new(
        std::io::ErrorKind::Other,
        format!("Task join error: {}", err),
    ))
}

/// Failure reported by a native backend
///
/// The message is kept verbatim: encryption detection and owner-password
/// handling classify failures by their text.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct BackendError {
    pub message: String,
}

impl BackendError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl From<std::io::Error> for BackendError {
    fn from(err: std::io::Error) -> Self {
        BackendError::new(err.to_string())
    }
}

#[cfg(feature = "mupdf")]
impl From<mupdf::Error> for BackendError {
    fn from(err: mupdf::Error) -> Self {
        BackendError::new(err.to_string())
    }
}

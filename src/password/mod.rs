//! Password-protected document handling
//!
//! Detects encryption, validates candidates and produces an unencrypted
//! re-save the plain renderer can open. All operations block.

pub mod variants;

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tempfile::TempPath;

use crate::backend::{RasterBackend, RewriteMode, SecurityBackend, Unlocked};
use crate::config::PasswordConfig;
use crate::error::{BackendError, PipelineError, Result};

pub use variants::{password_variants, PasswordVariant};

/// Lowercased message fragments that mean a parse failed on encryption
pub const ENCRYPTION_MARKERS: &[&str] = &[
    "password",
    "encrypted",
    "security",
    "authentication",
    "decrypt",
    "bad user password",
    "owner password",
    "user password",
];

/// Whether a native failure message is about encryption
pub fn indicates_encryption(message: &str) -> bool {
    let message = message.to_lowercase();
    ENCRYPTION_MARKERS.iter().any(|marker| message.contains(marker))
}

fn mentions_owner_password(message: &str) -> bool {
    message.to_lowercase().contains("owner password")
}

/// Outcome of validating a candidate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Validation {
    Invalid,
    Valid,
    /// Recognized as the owner credential; the document is still shown
    ValidOwnerOnly,
}

impl Validation {
    pub fn is_usable(self) -> bool {
        !matches!(self, Validation::Invalid)
    }
}

/// Temporary unencrypted copy of a protected document
#[derive(Debug)]
pub struct DecryptedCopy {
    path: PathBuf,
    temp: Option<TempPath>,
    page_count: usize,
    variant: String,
}

impl DecryptedCopy {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn page_count(&self) -> usize {
        self.page_count
    }

    /// Label of the password variant that worked
    pub fn variant_label(&self) -> &str {
        &self.variant
    }

    /// Delete the copy; idempotent
    pub fn close(&mut self) -> io::Result<bool> {
        match self.temp.take() {
            Some(temp) => {
                temp.close()?;
                tracing::debug!("Deleted decrypted copy {}", self.path.display());
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

enum Attempt {
    /// The backend refused the variant
    Rejected(BackendError),
    /// Written, but the plain renderer could not use the result
    Unverified(String),
}

/// Encryption detection, validation and decryption for one backend
pub struct PasswordGate<B> {
    backend: Arc<B>,
    country_codes: Vec<String>,
    temp_dir: Option<PathBuf>,
}

impl<B> Clone for PasswordGate<B> {
    fn clone(&self) -> Self {
        Self {
            backend: Arc::clone(&self.backend),
            country_codes: self.country_codes.clone(),
            temp_dir: self.temp_dir.clone(),
        }
    }
}

impl<B: SecurityBackend + RasterBackend> PasswordGate<B> {
    pub fn new(backend: Arc<B>, config: &PasswordConfig, temp_dir: Option<PathBuf>) -> Self {
        Self {
            backend,
            country_codes: config.country_codes.clone(),
            temp_dir,
        }
    }

    pub fn variants(&self, candidate: &str) -> Vec<PasswordVariant> {
        password_variants(candidate, &self.country_codes)
    }

    /// Whether opening `path` needs a password
    ///
    /// Parse failures unrelated to encryption report `false`; the renderer
    /// surfaces those when it opens the file.
    pub fn is_encrypted(&self, path: &Path) -> bool {
        match self.backend.probe(path) {
            Ok(_) => false,
            Err(e) => {
                let encrypted = indicates_encryption(&e.message);
                tracing::debug!("Password-less parse failed ({}), encrypted: {}", e, encrypted);
                encrypted
            }
        }
    }

    /// Check a candidate against the document
    pub fn validate(&self, path: &Path, candidate: &str) -> Validation {
        for variant in self.variants(candidate) {
            match self.backend.unlock(path, &variant.bytes) {
                Ok(Unlocked { page_count, .. }) if page_count > 0 => {
                    tracing::debug!("Password accepted with {} variant", variant.label);
                    return Validation::Valid;
                }
                Ok(_) => tracing::debug!("Variant {} opened a document without pages", variant.label),
                Err(e) if mentions_owner_password(&e.message) => {
                    tracing::debug!("Owner password detected with {} variant", variant.label);
                    return Validation::ValidOwnerOnly;
                }
                Err(e) => tracing::debug!("Variant {} rejected: {}", variant.label, e),
            }
        }
        Validation::Invalid
    }

    /// Produce a verified unencrypted copy of `path`
    pub fn decrypt(&self, path: &Path, candidate: &str) -> Result<DecryptedCopy> {
        let mut authenticated = false;

        for variant in self.variants(candidate) {
            match self.rewrite(path, &variant, RewriteMode::Standard)? {
                Ok(copy) => return Ok(copy),
                Err(Attempt::Unverified(reason)) => {
                    authenticated = true;
                    tracing::warn!("Decrypted copy failed verification ({}): {}", variant.label, reason);
                }
                Err(Attempt::Rejected(e)) if mentions_owner_password(&e.message) => {
                    authenticated = true;
                    tracing::debug!("Owner restrictions with {} variant, retrying permissively", variant.label);
                    match self.rewrite(path, &variant, RewriteMode::Permissive)? {
                        Ok(copy) => return Ok(copy),
                        Err(Attempt::Unverified(reason)) => {
                            tracing::warn!("Permissive copy failed verification ({}): {}", variant.label, reason)
                        }
                        Err(Attempt::Rejected(e)) => {
                            tracing::debug!("Permissive rewrite failed ({}): {}", variant.label, e)
                        }
                    }
                }
                Err(Attempt::Rejected(e)) => tracing::debug!("Variant {} rejected: {}", variant.label, e),
            }
        }

        if authenticated {
            Err(PipelineError::UnlockFailed(
                "no decrypted copy passed verification".into(),
            ))
        } else {
            Err(PipelineError::WrongPassword)
        }
    }

    /// One rewrite attempt; the outer error is an environment failure
    fn rewrite(
        &self,
        path: &Path,
        variant: &PasswordVariant,
        mode: RewriteMode,
    ) -> Result<std::result::Result<DecryptedCopy, Attempt>> {
        let temp = self.temp_file()?;

        if let Err(e) = self
            .backend
            .rewrite_unencrypted(path, &variant.bytes, &temp, mode)
        {
            return Ok(Err(Attempt::Rejected(e)));
        }

        match self.verify(&temp) {
            Ok(page_count) => {
                tracing::info!(
                    "Unlocked document with {} variant ({} pages, {:?})",
                    variant.label,
                    page_count,
                    mode
                );
                Ok(Ok(DecryptedCopy {
                    path: temp.to_path_buf(),
                    temp: Some(temp),
                    page_count,
                    variant: variant.label.clone(),
                }))
            }
            Err(reason) => {
                if let Err(e) = temp.close() {
                    tracing::warn!("Failed to delete unverified copy: {}", e);
                }
                Ok(Err(Attempt::Unverified(reason)))
            }
        }
    }

    /// Open through the plain renderer and require at least one page
    fn verify(&self, path: &Path) -> std::result::Result<usize, String> {
        let document = self.backend.open(path).map_err(|e| e.message)?;
        match self.backend.page_count(&document) {
            Ok(0) => Err("no pages".to_string()),
            Ok(count) => Ok(count),
            Err(e) => Err(e.message),
        }
    }

    fn temp_file(&self) -> Result<TempPath> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("unlocked_pdf_").suffix(".pdf");
        let file = match &self.temp_dir {
            Some(dir) => builder.tempfile_in(dir),
            None => builder.tempfile(),
        }?;
        Ok(file.into_temp_path())
    }
}

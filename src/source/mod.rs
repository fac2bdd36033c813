//! Local file materialization
//!
//! Turns a content reference into a file the native library can seek in.
//! Local files are used in place; anything else is streamed into a private
//! temporary copy that is deleted when the [`SourceFile`] goes away.

pub mod retry;

use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tempfile::TempPath;
use thiserror::Error;

use crate::config::SourceConfig;
use crate::error::{join_error, PipelineError, Result};

pub use retry::{retry, RetryPolicy};

/// Bytes inspected for the `%PDF` signature
const SIGNATURE_WINDOW: usize = 1024;
const PDF_SIGNATURE: &[u8] = b"%PDF";

/// Display metadata for a reference
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceMetadata {
    pub name: String,
    /// Size hint; may be missing for streamed content
    pub size: Option<u64>,
}

/// Resolves content references; all methods block
pub trait ContentResolver: Send + Sync {
    /// Fails when the reference cannot currently be read
    fn check_accessible(&self, reference: &str) -> io::Result<()>;

    fn metadata(&self, reference: &str) -> io::Result<SourceMetadata>;

    /// A local path with random access, when the reference has one
    fn local_path(&self, reference: &str) -> Option<PathBuf>;

    fn open_stream(&self, reference: &str) -> io::Result<Box<dyn Read + Send>>;
}

/// Resolver for plain paths and `file://` URIs
#[derive(Debug, Default, Clone, Copy)]
pub struct FsResolver;

impl FsResolver {
    /// Filesystem path for a reference
    pub fn resolve(reference: &str) -> PathBuf {
        match reference.strip_prefix("file://") {
            Some(rest) => {
                let rest = rest.strip_prefix("localhost").unwrap_or(rest);
                match urlencoding::decode(rest) {
                    Ok(decoded) => PathBuf::from(decoded.into_owned()),
                    Err(_) => PathBuf::from(rest),
                }
            }
            None => PathBuf::from(reference),
        }
    }
}

impl ContentResolver for FsResolver {
    fn check_accessible(&self, reference: &str) -> io::Result<()> {
        let path = Self::resolve(reference);
        if fs::metadata(&path)?.is_dir() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{} is a directory", path.display()),
            ));
        }
        File::open(&path).map(|_| ())
    }

    fn metadata(&self, reference: &str) -> io::Result<SourceMetadata> {
        let path = Self::resolve(reference);
        let size = fs::metadata(&path)?.len();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| reference.to_string());
        Ok(SourceMetadata {
            name,
            size: Some(size),
        })
    }

    fn local_path(&self, reference: &str) -> Option<PathBuf> {
        let path = Self::resolve(reference);
        path.is_file().then_some(path)
    }

    fn open_stream(&self, reference: &str) -> io::Result<Box<dyn Read + Send>> {
        Ok(Box::new(File::open(Self::resolve(reference))?))
    }
}

/// A locally seekable document file
///
/// Owns its temporary copy, if any; the copy is deleted on close or drop.
#[derive(Debug)]
pub struct SourceFile {
    path: PathBuf,
    temp: Option<TempPath>,
    name: String,
    size_bytes: u64,
}

impl SourceFile {
    fn direct(path: PathBuf, name: String, size_bytes: u64) -> Self {
        Self {
            path,
            temp: None,
            name,
            size_bytes,
        }
    }

    fn temporary(temp: TempPath, name: String, size_bytes: u64) -> Self {
        Self {
            path: temp.to_path_buf(),
            temp: Some(temp),
            name,
            size_bytes,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn size_bytes(&self) -> u64 {
        self.size_bytes
    }

    pub fn is_temporary(&self) -> bool {
        self.temp.is_some()
    }

    /// Delete the temporary copy; returns whether one was deleted
    ///
    /// Idempotent. Direct files are never touched.
    pub fn close(&mut self) -> io::Result<bool> {
        match self.temp.take() {
            Some(temp) => {
                temp.close()?;
                tracing::debug!("Deleted temporary copy {}", self.path.display());
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

#[derive(Debug, Error)]
enum OpenFailure {
    #[error("{0}")]
    Transient(io::Error),
    #[error("{0}")]
    Terminal(PipelineError),
}

impl OpenFailure {
    fn is_transient(&self) -> bool {
        matches!(self, OpenFailure::Transient(_))
    }
}

impl From<PipelineError> for OpenFailure {
    fn from(err: PipelineError) -> Self {
        OpenFailure::Terminal(err)
    }
}

/// Classify an access error; only conditions that may clear up are retried
fn classify(err: io::Error) -> OpenFailure {
    match err.kind() {
        io::ErrorKind::NotFound
        | io::ErrorKind::Interrupted
        | io::ErrorKind::WouldBlock
        | io::ErrorKind::TimedOut => OpenFailure::Transient(err),
        _ => OpenFailure::Terminal(PipelineError::Unreachable(err.to_string())),
    }
}

/// Obtains local files for content references
pub struct DocumentSource {
    resolver: Arc<dyn ContentResolver>,
    config: SourceConfig,
    policy: RetryPolicy,
}

impl DocumentSource {
    pub fn new(resolver: Arc<dyn ContentResolver>, config: SourceConfig) -> Self {
        let policy = RetryPolicy::new(config.retry_backoff());
        Self {
            resolver,
            config,
            policy,
        }
    }

    /// Source over the local filesystem
    pub fn filesystem(config: SourceConfig) -> Self {
        Self::new(Arc::new(FsResolver), config)
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Resolve `reference` into a local file, copying when needed
    pub async fn open(&self, reference: &str) -> Result<SourceFile> {
        let outcome = retry(&self.policy, OpenFailure::is_transient, |_| {
            let resolver = Arc::clone(&self.resolver);
            let config = self.config.clone();
            let reference = reference.to_string();
            async move {
                tokio::task::spawn_blocking(move || materialize(resolver.as_ref(), &reference, &config))
                    .await
                    .unwrap_or_else(|e| Err(OpenFailure::Terminal(join_error(e))))
            }
        })
        .await;

        match outcome {
            Ok(file) => {
                tracing::info!(
                    "Opened source {} ({} bytes{})",
                    file.name(),
                    file.size_bytes(),
                    if file.is_temporary() { ", copied" } else { "" }
                );
                Ok(file)
            }
            Err(OpenFailure::Transient(err)) => {
                tracing::warn!("Source {} unreachable after {} attempts", reference, self.policy.max_attempts());
                Err(PipelineError::Unreachable(err.to_string()))
            }
            Err(OpenFailure::Terminal(err)) => Err(err),
        }
    }
}

fn materialize(
    resolver: &dyn ContentResolver,
    reference: &str,
    config: &SourceConfig,
) -> std::result::Result<SourceFile, OpenFailure> {
    resolver.check_accessible(reference).map_err(classify)?;
    let metadata = resolver.metadata(reference).map_err(classify)?;

    if let Some(path) = resolver.local_path(reference) {
        check_signature(&path)?;
        let size = match metadata.size {
            Some(size) => size,
            None => fs::metadata(&path).map_err(classify)?.len(),
        };
        return Ok(SourceFile::direct(path, metadata.name, size));
    }

    if let Some(size) = metadata.size {
        if size > config.max_source_bytes {
            return Err(PipelineError::TooLarge {
                size,
                limit: config.max_source_bytes,
            }
            .into());
        }
    }

    let stream = resolver.open_stream(reference).map_err(classify)?;
    let (temp, copied) = copy_to_temp(stream, config)?;
    check_signature(&temp)?;
    Ok(SourceFile::temporary(temp, metadata.name, copied))
}

/// Stream `reader` into a fresh temporary file, enforcing the size limit
fn copy_to_temp(
    mut reader: Box<dyn Read + Send>,
    config: &SourceConfig,
) -> std::result::Result<(TempPath, u64), OpenFailure> {
    let mut builder = tempfile::Builder::new();
    builder.prefix("quickpdf_").suffix(".pdf");
    let mut file = match &config.temp_dir {
        Some(dir) => builder.tempfile_in(dir),
        None => builder.tempfile(),
    }
    .map_err(PipelineError::Io)?;

    let mut buffer = vec![0u8; config.copy_buffer_bytes.max(1)];
    let mut total: u64 = 0;
    loop {
        let read = match reader.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(classify(e)),
        };
        total += read as u64;
        if total > config.max_source_bytes {
            return Err(PipelineError::TooLarge {
                size: total,
                limit: config.max_source_bytes,
            }
            .into());
        }
        file.write_all(&buffer[..read]).map_err(PipelineError::Io)?;
    }

    file.flush().map_err(PipelineError::Io)?;
    file.as_file().sync_all().map_err(PipelineError::Io)?;

    if total == 0 {
        return Err(PipelineError::CorruptOrEmpty("source is empty".into()).into());
    }

    tracing::debug!("Copied {} bytes to {}", total, file.path().display());
    Ok((file.into_temp_path(), total))
}

/// Require the `%PDF` signature near the start of the file
fn check_signature(path: &Path) -> std::result::Result<(), OpenFailure> {
    let file = File::open(path).map_err(classify)?;
    let mut head = Vec::with_capacity(SIGNATURE_WINDOW);
    file.take(SIGNATURE_WINDOW as u64)
        .read_to_end(&mut head)
        .map_err(classify)?;

    if head.is_empty() {
        return Err(PipelineError::CorruptOrEmpty("file is empty".into()).into());
    }
    if !head.windows(PDF_SIGNATURE.len()).any(|w| w == PDF_SIGNATURE) {
        return Err(PipelineError::CorruptOrEmpty("missing %PDF signature".into()).into());
    }
    Ok(())
}

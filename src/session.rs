//! Per-document pipeline
//!
//! A [`DocumentSession`] owns everything one open document needs: the
//! local source file, an optional decrypted copy, the renderer, the page
//! cache and the prefetcher. Sessions start from [`DocumentSession::open`],
//! which hands back a [`LockedDocument`] when a password is needed.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::runtime::Handle;

use crate::backend::PdfBackend;
use crate::cache::{CacheEpoch, CacheStats, PageCache};
use crate::config::PipelineConfig;
use crate::error::{join_error, PipelineError, Result};
use crate::memory::{memory_budget, MemoryProbe, SystemMemory};
use crate::password::{DecryptedCopy, PasswordGate, Validation};
use crate::prefetch::{InFlightRegistry, InFlightStats, PageLoader, PagePrefetcher};
use crate::render::{BitmapLimits, PageRenderer, PageSize, RenderedPage};
use crate::source::{ContentResolver, DocumentSource, FsResolver, SourceFile};
use crate::types::{DocumentInfo, FitMode, PageRasterRequest, Viewport};

/// Settings a session is opened with
#[derive(Clone)]
pub struct SessionOptions {
    pub config: PipelineConfig,
    pub fit_mode: FitMode,
    pub viewport: Viewport,
    pub probe: Arc<dyn MemoryProbe>,
}

impl SessionOptions {
    pub fn new(config: PipelineConfig) -> Self {
        Self {
            config,
            fit_mode: FitMode::default(),
            viewport: Viewport::new(1080, 1920),
            probe: Arc::new(SystemMemory),
        }
    }

    pub fn with_view(mut self, fit_mode: FitMode, viewport: Viewport) -> Self {
        self.fit_mode = fit_mode;
        self.viewport = viewport;
        self
    }

    pub fn with_probe(mut self, probe: Arc<dyn MemoryProbe>) -> Self {
        self.probe = probe;
        self
    }

    fn gate<B: PdfBackend>(&self, backend: &Arc<B>) -> PasswordGate<B> {
        PasswordGate::new(
            Arc::clone(backend),
            &self.config.password,
            self.config.source.temp_dir.clone(),
        )
    }
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self::new(PipelineConfig::default())
    }
}

/// Result of opening a document
pub enum Opened<B: PdfBackend> {
    Ready(DocumentSession<B>),
    /// Encrypted; call [`LockedDocument::unlock`] with a password
    Locked(LockedDocument<B>),
}

/// An encrypted document waiting for its password
///
/// Dropping it deletes any temporary copy of the source.
pub struct LockedDocument<B: PdfBackend> {
    backend: Arc<B>,
    source: Option<SourceFile>,
    options: SessionOptions,
}

impl<B: PdfBackend> LockedDocument<B> {
    pub fn name(&self) -> &str {
        self.source.as_ref().map(SourceFile::name).unwrap_or_default()
    }

    /// Check a password without decrypting
    pub async fn validate(&self, password: &str) -> Result<Validation> {
        let source = self.source.as_ref().ok_or(PipelineError::Closed)?;
        let path = source.path().to_path_buf();
        let gate = self.options.gate(&self.backend);
        let password = password.to_string();
        tokio::task::spawn_blocking(move || gate.validate(&path, &password))
            .await
            .map_err(join_error)
    }

    /// Validate, decrypt and open a session over the decrypted copy
    ///
    /// A wrong password leaves the document locked so the caller can retry.
    pub async fn unlock(&mut self, password: &str) -> Result<DocumentSession<B>> {
        let source = self.source.as_ref().ok_or(PipelineError::Closed)?;
        let path = source.path().to_path_buf();
        let gate = self.options.gate(&self.backend);
        let password = password.to_string();

        let copy = tokio::task::spawn_blocking(move || {
            match gate.validate(&path, &password) {
                Validation::Invalid => return Err(PipelineError::WrongPassword),
                Validation::ValidOwnerOnly => {
                    tracing::info!("Owner password supplied, opening with owner access")
                }
                Validation::Valid => {}
            }
            gate.decrypt(&path, &password)
        })
        .await
        .map_err(join_error)??;

        let renderer = open_renderer(&self.backend, copy.path(), &self.options).await?;
        let source = self.source.take().ok_or(PipelineError::Closed)?;
        Ok(DocumentSession::assemble(
            renderer,
            source,
            Some(copy),
            self.options.clone(),
            true,
        ))
    }

    /// Delete temporary files now instead of on drop
    pub fn close(&mut self) {
        if let Some(mut source) = self.source.take() {
            if let Err(e) = source.close() {
                tracing::warn!("Failed to delete temporary copy: {}", e);
            }
        }
    }
}

async fn open_renderer<B: PdfBackend>(
    backend: &Arc<B>,
    path: &Path,
    options: &SessionOptions,
) -> Result<PageRenderer<B>> {
    let backend = Arc::clone(backend);
    let path = path.to_path_buf();
    let limits = BitmapLimits::from(&options.config.render);
    tokio::task::spawn_blocking(move || PageRenderer::open(backend, &path, limits))
        .await
        .map_err(join_error)?
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ViewState {
    fit_mode: FitMode,
    viewport: Viewport,
}

#[derive(Default)]
struct DocumentFiles {
    source: Option<SourceFile>,
    decrypted: Option<DecryptedCopy>,
}

struct SessionCore<B: PdfBackend> {
    renderer: PageRenderer<B>,
    cache: PageCache,
    in_flight: Arc<InFlightRegistry>,
    view: Mutex<ViewState>,
    files: Mutex<DocumentFiles>,
    closed: AtomicBool,
    info: DocumentInfo,
}

impl<B: PdfBackend> SessionCore<B> {
    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(PipelineError::Closed);
        }
        Ok(())
    }

    /// Current view and cache epoch, read together
    ///
    /// `set_view` clears the cache under the view lock, so an old view is
    /// never paired with a newer epoch.
    fn render_target(&self) -> (ViewState, CacheEpoch) {
        let view = self.view.lock();
        (*view, self.cache.epoch())
    }

    /// Render a page at the current view and cache it; blocking
    fn render_into_cache(&self, page: usize) -> Result<Arc<RenderedPage>> {
        self.ensure_open()?;
        if let Some(hit) = self.cache.peek(page) {
            return Ok(hit);
        }
        let (view, epoch) = self.render_target();
        self.render_for(page, view, epoch)
    }

    /// Results rendered before a cache clear are returned but not cached
    fn render_for(&self, page: usize, view: ViewState, epoch: CacheEpoch) -> Result<Arc<RenderedPage>> {
        let request = PageRasterRequest::new(page as i64, view.viewport, view.fit_mode);

        let bitmap = match self.renderer.render(&request) {
            Err(PipelineError::Oom { width, height }) => {
                tracing::warn!(
                    "Out of memory rendering page {} at {}x{}, retrying at half size",
                    page,
                    width,
                    height
                );
                self.cache.trim_to(self.cache.capacity() / 2);
                let reduced = PageRasterRequest::new(page as i64, view.viewport.halved(), view.fit_mode);
                self.renderer.render(&reduced)?
            }
            other => other?,
        };

        let rendered = Arc::new(RenderedPage::new(page, bitmap));
        self.cache.put_in_epoch(epoch, page, Arc::clone(&rendered));
        Ok(rendered)
    }
}

impl<B: PdfBackend> PageLoader for SessionCore<B> {
    fn page_count(&self) -> usize {
        self.renderer.page_count()
    }

    fn is_cached(&self, page: usize) -> bool {
        self.cache.contains(page)
    }

    fn load(&self, page: usize) -> Result<()> {
        self.render_into_cache(page).map(|_| ())
    }
}

/// An open document ready to render
pub struct DocumentSession<B: PdfBackend> {
    core: Arc<SessionCore<B>>,
    prefetcher: PagePrefetcher<SessionCore<B>>,
}

impl<B: PdfBackend> DocumentSession<B> {
    /// Open a filesystem path or `file://` URI
    pub async fn open(backend: Arc<B>, reference: &str, options: SessionOptions) -> Result<Opened<B>> {
        Self::open_with(backend, Arc::new(FsResolver), reference, options).await
    }

    /// Open a reference through a custom resolver
    pub async fn open_with(
        backend: Arc<B>,
        resolver: Arc<dyn ContentResolver>,
        reference: &str,
        options: SessionOptions,
    ) -> Result<Opened<B>> {
        let source = DocumentSource::new(resolver, options.config.source.clone())
            .open(reference)
            .await?;

        let gate = options.gate(&backend);
        let path = source.path().to_path_buf();
        let encrypted = tokio::task::spawn_blocking(move || gate.is_encrypted(&path))
            .await
            .map_err(join_error)?;

        if encrypted {
            tracing::info!("{} is password-protected", source.name());
            return Ok(Opened::Locked(LockedDocument {
                backend,
                source: Some(source),
                options,
            }));
        }

        let renderer = open_renderer(&backend, source.path(), &options).await?;
        Ok(Opened::Ready(Self::assemble(renderer, source, None, options, false)))
    }

    /// Open a document that must not need a password
    pub async fn open_unlocked(backend: Arc<B>, reference: &str, options: SessionOptions) -> Result<Self> {
        match Self::open(backend, reference, options).await? {
            Opened::Ready(session) => Ok(session),
            Opened::Locked(_) => Err(PipelineError::PasswordRequired),
        }
    }

    fn assemble(
        renderer: PageRenderer<B>,
        source: SourceFile,
        decrypted: Option<DecryptedCopy>,
        options: SessionOptions,
        password_protected: bool,
    ) -> Self {
        let config = &options.config;
        let budget = memory_budget(config.cache.memory_budget_bytes, options.probe.as_ref());
        let cache = PageCache::with_budget(budget, config.cache.fraction);

        let info = DocumentInfo {
            name: source.name().to_string(),
            size_bytes: source.size_bytes(),
            last_accessed: Utc::now(),
            page_count: renderer.page_count(),
            password_protected,
        };
        tracing::info!(
            "Opened {} ({} pages, {})",
            info.name,
            info.page_count,
            info.display_size()
        );

        let in_flight = Arc::new(InFlightRegistry::new());
        let core = Arc::new(SessionCore {
            renderer,
            cache,
            in_flight: Arc::clone(&in_flight),
            view: Mutex::new(ViewState {
                fit_mode: options.fit_mode,
                viewport: options.viewport,
            }),
            files: Mutex::new(DocumentFiles {
                source: Some(source),
                decrypted,
            }),
            closed: AtomicBool::new(false),
            info,
        });
        let prefetcher = PagePrefetcher::new(
            Arc::clone(&core),
            in_flight,
            Arc::clone(&options.probe),
            config.prefetch.clone(),
            Handle::current(),
        );

        Self { core, prefetcher }
    }

    pub fn page_count(&self) -> usize {
        self.core.renderer.page_count()
    }

    /// Metadata for the recent-files store
    pub fn info(&self) -> DocumentInfo {
        self.core.info.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.core.closed.load(Ordering::SeqCst)
    }

    pub fn view(&self) -> (FitMode, Viewport) {
        let view = *self.core.view.lock();
        (view.fit_mode, view.viewport)
    }

    /// Change fit mode or viewport; cached pages are dropped on change
    pub fn set_view(&self, fit_mode: FitMode, viewport: Viewport) -> bool {
        let next = ViewState { fit_mode, viewport };
        {
            let mut view = self.core.view.lock();
            if *view == next {
                return false;
            }
            *view = next;
            self.core.cache.clear();
        }
        self.prefetcher.cancel_all();
        tracing::debug!(
            "View changed to {:?} {}x{}",
            fit_mode,
            viewport.width,
            viewport.height
        );
        true
    }

    /// Page at the current view
    pub async fn page_at(&self, index: i64) -> Result<Arc<RenderedPage>> {
        self.core.ensure_open()?;
        let page = self.core.renderer.check_index(index)?;

        let rendered = match self.core.cache.get(page) {
            Some(hit) => hit,
            None => {
                let core = Arc::clone(&self.core);
                tokio::task::spawn_blocking(move || {
                    // A prefetch of this page finishes first and is reused from the cache
                    let _slot = core.in_flight.acquire(page);
                    core.render_into_cache(page)
                })
                .await
                .map_err(join_error)??
            }
        };

        self.prefetcher.on_page_shown(page);
        Ok(rendered)
    }

    /// Page for an explicit request, adopting its view first
    pub async fn page(&self, request: PageRasterRequest) -> Result<Arc<RenderedPage>> {
        self.core.ensure_open()?;
        self.core.renderer.check_index(request.page_index)?;
        self.set_view(request.fit_mode, request.viewport());
        self.page_at(request.page_index).await
    }

    /// Native size of a page
    pub async fn page_size(&self, index: i64) -> Result<PageSize> {
        self.core.ensure_open()?;
        self.core.renderer.check_index(index)?;
        let core = Arc::clone(&self.core);
        tokio::task::spawn_blocking(move || core.renderer.dimensions(index))
            .await
            .map_err(join_error)?
    }

    /// Schedule neighbours of the visible page
    pub fn on_page_shown(&self, page: usize) -> usize {
        if self.is_closed() {
            return 0;
        }
        self.prefetcher.on_page_shown(page)
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.core.cache.stats()
    }

    pub fn in_flight_stats(&self) -> InFlightStats {
        self.core.in_flight.stats()
    }

    /// Release everything the document holds; idempotent
    ///
    /// Waits for a render in progress to finish before the native document
    /// is released.
    pub fn close(&self) {
        if self.core.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        self.prefetcher.cancel_all();
        self.core.renderer.close();
        self.core.cache.clear();

        let mut files = self.core.files.lock();
        if let Some(mut copy) = files.decrypted.take() {
            if let Err(e) = copy.close() {
                tracing::warn!("Failed to delete decrypted copy: {}", e);
            }
        }
        if let Some(mut source) = files.source.take() {
            if let Err(e) = source.close() {
                tracing::warn!("Failed to delete temporary copy: {}", e);
            }
        }

        tracing::info!("Closed {}", self.core.info.name);
    }
}

impl<B: PdfBackend> Drop for DocumentSession<B> {
    fn drop(&mut self) {
        self.close();
    }
}

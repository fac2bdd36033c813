//! Page rasterization
//!
//! One [`PageRenderer`] per open document. The native document, the
//! current-page slot and the memo tables sit behind a single fair mutex so
//! foreground and prefetch work on a document is served in arrival order.

pub mod bitmap;
pub mod sizing;

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use parking_lot::FairMutex;

use crate::backend::RasterBackend;
use crate::error::{PipelineError, Result};
use crate::types::{FitMode, PageRasterRequest, Viewport};

pub use bitmap::{Bitmap, RenderedPage};
pub use sizing::{BitmapLimits, PageSize};

/// Native allocation failures surface as error text
fn is_allocation_failure(message: &str) -> bool {
    let message = message.to_lowercase();
    message.contains("out of memory") || message.contains("malloc")
}

/// Memo key for the fit ratio
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct RatioKey {
    page: PageSize,
    target: Viewport,
}

struct CurrentPage<P> {
    index: usize,
    page: P,
}

struct OpenRenderer<B: RasterBackend> {
    document: B::Document,
    current: Option<CurrentPage<B::Page>>,
    dimensions: Vec<Option<PageSize>>,
    ratios: HashMap<RatioKey, f64>,
}

enum RendererSlot<B: RasterBackend> {
    Open(OpenRenderer<B>),
    Closed,
}

impl<B: RasterBackend> OpenRenderer<B> {
    /// Make `index` the current page, dropping the previous one first
    fn current_page(&mut self, backend: &B, index: usize) -> Result<&B::Page> {
        let reuse = matches!(&self.current, Some(current) if current.index == index);
        if !reuse {
            self.current = None;
            let page = backend
                .load_page(&self.document, index)
                .map_err(|e| PipelineError::RenderError(format!("load page {}: {}", index, e)))?;
            self.current = Some(CurrentPage { index, page });
        }
        match &self.current {
            Some(current) => Ok(&current.page),
            None => Err(PipelineError::RenderError(format!("page {} not loaded", index))),
        }
    }

    fn dimensions(&mut self, backend: &B, index: usize) -> Result<PageSize> {
        if let Some(Some(size)) = self.dimensions.get(index) {
            return Ok(*size);
        }
        let page = self.current_page(backend, index)?;
        let (width, height) = backend
            .page_size(page)
            .map_err(|e| PipelineError::RenderError(format!("page {} size: {}", index, e)))?;
        let size = PageSize::new(width, height);
        if let Some(slot) = self.dimensions.get_mut(index) {
            *slot = Some(size);
        }
        Ok(size)
    }

    fn ratio(&mut self, page: PageSize, target: Viewport) -> f64 {
        *self
            .ratios
            .entry(RatioKey { page, target })
            .or_insert_with(|| sizing::fit_ratio(page, target))
    }
}

/// Rasterizes the pages of one document
pub struct PageRenderer<B: RasterBackend> {
    backend: Arc<B>,
    page_count: usize,
    limits: BitmapLimits,
    slot: FairMutex<RendererSlot<B>>,
}

impl<B: RasterBackend> PageRenderer<B> {
    /// Open the native document; blocking
    pub fn open(backend: Arc<B>, path: &Path, limits: BitmapLimits) -> Result<Self> {
        let document = backend
            .open(path)
            .map_err(|e| PipelineError::CorruptOrEmpty(e.to_string()))?;
        let page_count = backend
            .page_count(&document)
            .map_err(|e| PipelineError::CorruptOrEmpty(e.to_string()))?;
        if page_count == 0 {
            return Err(PipelineError::CorruptOrEmpty("document has no pages".into()));
        }

        tracing::debug!("Opened renderer for {} ({} pages)", path.display(), page_count);

        Ok(Self {
            backend,
            page_count,
            limits,
            slot: FairMutex::new(RendererSlot::Open(OpenRenderer {
                document,
                current: None,
                dimensions: vec![None; page_count],
                ratios: HashMap::new(),
            })),
        })
    }

    pub fn page_count(&self) -> usize {
        self.page_count
    }

    pub fn limits(&self) -> BitmapLimits {
        self.limits
    }

    pub fn is_closed(&self) -> bool {
        matches!(*self.slot.lock(), RendererSlot::Closed)
    }

    /// Validate a page index without taking the document lock
    pub fn check_index(&self, index: i64) -> Result<usize> {
        usize::try_from(index)
            .ok()
            .filter(|&i| i < self.page_count)
            .ok_or(PipelineError::OutOfRange {
                index,
                page_count: self.page_count,
            })
    }

    /// Native pixel size of a page; memoized per document
    pub fn dimensions(&self, index: i64) -> Result<PageSize> {
        let index = self.check_index(index)?;
        let mut slot = self.slot.lock();
        match &mut *slot {
            RendererSlot::Open(open) => open.dimensions(&self.backend, index),
            RendererSlot::Closed => Err(PipelineError::Closed),
        }
    }

    /// Rasterize one page; blocking
    pub fn render(&self, request: &PageRasterRequest) -> Result<Bitmap> {
        let index = self.check_index(request.page_index)?;
        let mut slot = self.slot.lock();
        let open = match &mut *slot {
            RendererSlot::Open(open) => open,
            RendererSlot::Closed => return Err(PipelineError::Closed),
        };

        let page_size = open.dimensions(&self.backend, index)?;
        let target = request.viewport();
        let (width, height) = match request.fit_mode {
            FitMode::OriginalSize => sizing::output_size(page_size, request.fit_mode, self.limits, || 1.0),
            FitMode::FitWidth | FitMode::FitPage => {
                let ratio = open.ratio(page_size, target);
                sizing::output_size(page_size, request.fit_mode, self.limits, || ratio)
            }
        }
        .ok_or_else(|| {
            PipelineError::RenderError(format!(
                "page {} has no area at {}x{}",
                index, target.width, target.height
            ))
        })?;

        let mut bitmap =
            Bitmap::try_new(width, height).map_err(|_| PipelineError::Oom { width, height })?;

        let page = open.current_page(&self.backend, index)?;
        self.backend.draw(page, &mut bitmap).map_err(|e| {
            if is_allocation_failure(&e.message) {
                PipelineError::Oom { width, height }
            } else {
                PipelineError::RenderError(format!("draw page {}: {}", index, e))
            }
        })?;

        tracing::debug!("Rendered page {} at {}x{}", index, width, height);
        Ok(bitmap)
    }

    /// Release the native document; idempotent
    ///
    /// Returns whether the renderer was open.
    pub fn close(&self) -> bool {
        let mut slot = self.slot.lock();
        if let RendererSlot::Open(open) = &mut *slot {
            // Page before document
            open.current = None;
        }
        let was_open = matches!(
            std::mem::replace(&mut *slot, RendererSlot::Closed),
            RendererSlot::Open(_)
        );
        if was_open {
            tracing::debug!("Closed renderer");
        }
        was_open
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeBackend, FakeDoc};
    use std::sync::atomic::Ordering;
    use std::thread;

    fn renderer(backend: &Arc<FakeBackend>, doc: FakeDoc) -> (PageRenderer<FakeBackend>, tempfile::TempPath) {
        let path = doc.write_temp();
        let renderer = PageRenderer::open(Arc::clone(backend), &path, BitmapLimits::default()).unwrap();
        (renderer, path)
    }

    fn request(index: i64, width: u32, height: u32, mode: FitMode) -> PageRasterRequest {
        PageRasterRequest::new(index, Viewport::new(width, height), mode)
    }

    #[test]
    fn test_open_reports_page_count() {
        let backend = Arc::new(FakeBackend::new());
        let (renderer, _path) = renderer(&backend, FakeDoc::pages(3, 600, 800));
        assert_eq!(renderer.page_count(), 3);
    }

    #[test]
    fn test_open_rejects_empty_document() {
        let backend = Arc::new(FakeBackend::new());
        let path = FakeDoc::pages(0, 600, 800).write_temp();
        let err = PageRenderer::open(backend, &path, BitmapLimits::default()).err().unwrap();
        assert!(matches!(err, PipelineError::CorruptOrEmpty(_)));
    }

    #[test]
    fn test_render_fit_width() {
        let backend = Arc::new(FakeBackend::new());
        let (renderer, _path) = renderer(&backend, FakeDoc::pages(2, 600, 800));
        let bitmap = renderer.render(&request(1, 1080, 1920, FitMode::FitWidth)).unwrap();
        assert_eq!((bitmap.width(), bitmap.height()), (1080, 1440));
        // Fake backend paints the page index into red
        assert_eq!(bitmap.pixels()[0], 1);
    }

    #[test]
    fn test_render_is_clamped() {
        let backend = Arc::new(FakeBackend::new());
        let (renderer, _path) = renderer(&backend, FakeDoc::pages(1, 3000, 1500));
        let bitmap = renderer.render(&request(0, 1, 1, FitMode::OriginalSize)).unwrap();
        assert_eq!((bitmap.width(), bitmap.height()), (2048, 1024));
    }

    #[test]
    fn test_out_of_range_does_not_touch_backend() {
        let backend = Arc::new(FakeBackend::new());
        let (renderer, _path) = renderer(&backend, FakeDoc::pages(3, 600, 800));
        for index in [-1, 3, 100] {
            let err = renderer.render(&request(index, 100, 100, FitMode::FitPage)).err().unwrap();
            assert!(matches!(err, PipelineError::OutOfRange { page_count: 3, .. }));
        }
        assert!(matches!(
            renderer.dimensions(-5),
            Err(PipelineError::OutOfRange { .. })
        ));
        assert_eq!(backend.stats.page_loads.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_dimensions_are_memoized() {
        let backend = Arc::new(FakeBackend::new());
        let (renderer, _path) = renderer(&backend, FakeDoc::sized(&[(600, 800), (800, 600)]));
        assert_eq!(renderer.dimensions(1).unwrap(), PageSize::new(800, 600));
        assert_eq!(renderer.dimensions(0).unwrap(), PageSize::new(600, 800));
        assert_eq!(renderer.dimensions(1).unwrap(), PageSize::new(800, 600));
        assert_eq!(backend.stats.page_loads.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_current_page_reused() {
        let backend = Arc::new(FakeBackend::new());
        let (renderer, _path) = renderer(&backend, FakeDoc::pages(3, 600, 800));
        renderer.render(&request(0, 300, 400, FitMode::FitPage)).unwrap();
        renderer.render(&request(0, 600, 800, FitMode::FitPage)).unwrap();
        assert_eq!(backend.stats.page_loads.load(Ordering::SeqCst), 1);
        renderer.render(&request(1, 600, 800, FitMode::FitPage)).unwrap();
        assert_eq!(backend.stats.page_loads.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_draw_failure_is_render_error() {
        let backend = Arc::new(FakeBackend::new());
        let (renderer, _path) = renderer(&backend, FakeDoc::pages(3, 600, 800).failing_page(1));
        let err = renderer.render(&request(1, 300, 400, FitMode::FitPage)).err().unwrap();
        assert!(matches!(err, PipelineError::RenderError(_)));
        // Other pages unaffected
        assert!(renderer.render(&request(2, 300, 400, FitMode::FitPage)).is_ok());
    }

    #[test]
    fn test_native_allocation_failure_is_oom() {
        let backend = Arc::new(FakeBackend::new().with_pixel_limit(10_000));
        let (renderer, _path) = renderer(&backend, FakeDoc::pages(1, 600, 800));
        let err = renderer.render(&request(0, 600, 800, FitMode::FitPage)).err().unwrap();
        assert!(matches!(err, PipelineError::Oom { width: 600, height: 800 }));
        assert!(renderer.render(&request(0, 60, 80, FitMode::FitPage)).is_ok());
    }

    #[test]
    fn test_zero_target_is_render_error() {
        let backend = Arc::new(FakeBackend::new());
        let (renderer, _path) = renderer(&backend, FakeDoc::pages(1, 600, 800));
        let err = renderer.render(&request(0, 0, 400, FitMode::FitWidth)).err().unwrap();
        assert!(matches!(err, PipelineError::RenderError(_)));
    }

    #[test]
    fn test_close_is_idempotent() {
        let backend = Arc::new(FakeBackend::new());
        let (renderer, _path) = renderer(&backend, FakeDoc::pages(2, 600, 800));
        renderer.render(&request(0, 300, 400, FitMode::FitPage)).unwrap();
        assert!(renderer.close());
        assert!(!renderer.close());
        assert!(renderer.is_closed());
        assert_eq!(backend.stats.open_pages.load(Ordering::SeqCst), 0);
        assert!(matches!(
            renderer.render(&request(0, 300, 400, FitMode::FitPage)),
            Err(PipelineError::Closed)
        ));
    }

    #[test]
    fn test_single_current_page_under_contention() {
        let backend = Arc::new(FakeBackend::new());
        let (renderer, _path) = renderer(&backend, FakeDoc::pages(8, 60, 80));
        let renderer = Arc::new(renderer);

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let renderer = Arc::clone(&renderer);
                thread::spawn(move || {
                    for round in 0..5 {
                        let index = ((i + round) % 8) as i64;
                        renderer.render(&request(index, 60, 80, FitMode::FitPage)).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(backend.stats.max_open_pages.load(Ordering::SeqCst), 1);
        assert_eq!(backend.stats.max_concurrent_draws.load(Ordering::SeqCst), 1);
    }
}

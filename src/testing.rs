//! In-process backend for tests
//!
//! Documents are small text files:
//!
//! ```text
//! %PDF-FAKE
//! page 600 800
//! user secret
//! owner boss
//! fail 2
//! broken-rewrite
//! ```
//!
//! Encrypted documents (with a `user` line) cannot be opened by the raster
//! side, mirroring a plain renderer that has no decryption support.

use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempPath;

use crate::backend::{Access, RasterBackend, RewriteMode, SecurityBackend, Unlocked};
use crate::error::BackendError;
use crate::render::bitmap::Bitmap;

const HEADER: &str = "%PDF-FAKE";

/// Description of a fake document
#[derive(Debug, Clone, Default)]
pub struct FakeDoc {
    pub pages: Vec<(u32, u32)>,
    pub user: Option<String>,
    pub owner: Option<String>,
    pub failing: Vec<usize>,
    pub broken_rewrite: bool,
}

impl FakeDoc {
    pub fn pages(count: usize, width: u32, height: u32) -> Self {
        Self {
            pages: vec![(width, height); count],
            ..Self::default()
        }
    }

    pub fn sized(sizes: &[(u32, u32)]) -> Self {
        Self {
            pages: sizes.to_vec(),
            ..Self::default()
        }
    }

    pub fn with_user_password(mut self, password: &str) -> Self {
        self.user = Some(password.to_string());
        self
    }

    pub fn with_owner_password(mut self, password: &str) -> Self {
        self.owner = Some(password.to_string());
        self
    }

    pub fn failing_page(mut self, index: usize) -> Self {
        self.failing.push(index);
        self
    }

    /// Re-saved copies come out unreadable
    pub fn with_broken_rewrite(mut self) -> Self {
        self.broken_rewrite = true;
        self
    }

    pub fn to_text(&self) -> String {
        let mut text = format!("{}\n", HEADER);
        for (width, height) in &self.pages {
            text.push_str(&format!("page {} {}\n", width, height));
        }
        if let Some(user) = &self.user {
            text.push_str(&format!("user {}\n", user));
        }
        if let Some(owner) = &self.owner {
            text.push_str(&format!("owner {}\n", owner));
        }
        for index in &self.failing {
            text.push_str(&format!("fail {}\n", index));
        }
        if self.broken_rewrite {
            text.push_str("broken-rewrite\n");
        }
        text
    }

    /// Write into a temporary file deleted when the path is dropped
    pub fn write_temp(&self) -> TempPath {
        let mut file = tempfile::Builder::new()
            .prefix("fake_")
            .suffix(".pdf")
            .tempfile()
            .unwrap();
        file.write_all(self.to_text().as_bytes()).unwrap();
        file.flush().unwrap();
        file.into_temp_path()
    }

    fn parse(path: &Path) -> Result<FakeDoc, BackendError> {
        let text = std::fs::read_to_string(path)?;
        let mut lines = text.lines();
        if lines.next() != Some(HEADER) {
            return Err(BackendError::new("syntax error: no objects found"));
        }
        let mut doc = FakeDoc::default();
        for line in lines {
            let mut parts = line.split_whitespace();
            match (parts.next(), parts.next(), parts.next()) {
                (Some("page"), Some(w), Some(h)) => {
                    let w = w.parse().map_err(|_| BackendError::new("bad page width"))?;
                    let h = h.parse().map_err(|_| BackendError::new("bad page height"))?;
                    doc.pages.push((w, h));
                }
                (Some("user"), Some(pw), None) => doc.user = Some(pw.to_string()),
                (Some("owner"), Some(pw), None) => doc.owner = Some(pw.to_string()),
                (Some("fail"), Some(i), None) => {
                    doc.failing
                        .push(i.parse().map_err(|_| BackendError::new("bad fail index"))?);
                }
                (Some("broken-rewrite"), None, None) => doc.broken_rewrite = true,
                (None, _, _) => {}
                _ => return Err(BackendError::new(format!("syntax error: {}", line))),
            }
        }
        Ok(doc)
    }

    fn matches_user(&self, password: &[u8]) -> bool {
        self.user.as_deref().map(str::as_bytes) == Some(password)
    }

    fn matches_owner(&self, password: &[u8]) -> bool {
        self.owner.as_deref().map(str::as_bytes) == Some(password)
    }
}

/// Write bytes that are neither a fake document nor parseable
pub fn write_corrupt() -> TempPath {
    let mut file = tempfile::Builder::new().suffix(".pdf").tempfile().unwrap();
    file.write_all(b"%PDF-1.7\ntruncated").unwrap();
    file.into_temp_path()
}

/// Counters observed by tests
#[derive(Debug, Default)]
pub struct FakeStats {
    pub page_loads: AtomicUsize,
    pub open_pages: AtomicUsize,
    pub max_open_pages: AtomicUsize,
    pub draws: AtomicUsize,
    pub active_draws: AtomicUsize,
    pub max_concurrent_draws: AtomicUsize,
    pub rewrites: AtomicUsize,
    pub unlock_attempts: AtomicUsize,
}

fn raise(counter: &AtomicUsize, max: &AtomicUsize) {
    let now = counter.fetch_add(1, Ordering::SeqCst) + 1;
    max.fetch_max(now, Ordering::SeqCst);
}

pub struct FakeDocument {
    doc: FakeDoc,
}

pub struct FakePage {
    index: usize,
    size: (u32, u32),
    fails: bool,
    stats: Arc<FakeStats>,
}

impl Drop for FakePage {
    fn drop(&mut self) {
        self.stats.open_pages.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Backend over [`FakeDoc`] files
#[derive(Default)]
pub struct FakeBackend {
    pub stats: Arc<FakeStats>,
    draw_delay: Option<Duration>,
    pixel_limit: Option<u64>,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleep inside every draw
    pub fn with_draw_delay(mut self, delay: Duration) -> Self {
        self.draw_delay = Some(delay);
        self
    }

    /// Fail draws larger than `pixels` with a native out-of-memory message
    pub fn with_pixel_limit(mut self, pixels: u64) -> Self {
        self.pixel_limit = Some(pixels);
        self
    }
}

impl SecurityBackend for FakeBackend {
    fn probe(&self, path: &Path) -> Result<usize, BackendError> {
        let doc = FakeDoc::parse(path)?;
        if doc.user.is_some() {
            return Err(BackendError::new("Document is encrypted: user password required"));
        }
        Ok(doc.pages.len())
    }

    fn unlock(&self, path: &Path, password: &[u8]) -> Result<Unlocked, BackendError> {
        self.stats.unlock_attempts.fetch_add(1, Ordering::SeqCst);
        let doc = FakeDoc::parse(path)?;
        let page_count = doc.pages.len();
        if doc.user.is_none() {
            return Ok(Unlocked {
                page_count,
                access: Access::Open,
            });
        }
        if doc.matches_user(password) {
            return Ok(Unlocked {
                page_count,
                access: Access::Authenticated,
            });
        }
        if doc.matches_owner(password) {
            return Err(BackendError::new(
                "Owner password supplied: access restricted by permissions",
            ));
        }
        Err(BackendError::new("Bad user password"))
    }

    fn rewrite_unencrypted(
        &self,
        source: &Path,
        password: &[u8],
        dest: &Path,
        mode: RewriteMode,
    ) -> Result<usize, BackendError> {
        let doc = FakeDoc::parse(source)?;
        let allowed = doc.user.is_none()
            || doc.matches_user(password)
            || (doc.matches_owner(password) && mode == RewriteMode::Permissive);
        if !allowed {
            if doc.matches_owner(password) {
                return Err(BackendError::new("Cannot save: owner password restrictions apply"));
            }
            return Err(BackendError::new("Bad user password"));
        }

        self.stats.rewrites.fetch_add(1, Ordering::SeqCst);
        if doc.broken_rewrite {
            std::fs::write(dest, b"\0\0garbage")?;
        } else {
            let plain = FakeDoc {
                user: None,
                owner: None,
                ..doc.clone()
            };
            std::fs::write(dest, plain.to_text())?;
        }
        Ok(doc.pages.len())
    }
}

impl RasterBackend for FakeBackend {
    type Document = FakeDocument;
    type Page = FakePage;

    fn open(&self, path: &Path) -> Result<FakeDocument, BackendError> {
        let doc = FakeDoc::parse(path)?;
        if doc.user.is_some() {
            return Err(BackendError::new("unsupported security handler"));
        }
        Ok(FakeDocument { doc })
    }

    fn page_count(&self, document: &FakeDocument) -> Result<usize, BackendError> {
        Ok(document.doc.pages.len())
    }

    fn load_page(&self, document: &FakeDocument, index: usize) -> Result<FakePage, BackendError> {
        let size = *document
            .doc
            .pages
            .get(index)
            .ok_or_else(|| BackendError::new("invalid page number"))?;
        self.stats.page_loads.fetch_add(1, Ordering::SeqCst);
        raise(&self.stats.open_pages, &self.stats.max_open_pages);
        Ok(FakePage {
            index,
            size,
            fails: document.doc.failing.contains(&index),
            stats: Arc::clone(&self.stats),
        })
    }

    fn page_size(&self, page: &FakePage) -> Result<(u32, u32), BackendError> {
        Ok(page.size)
    }

    fn draw(&self, page: &FakePage, target: &mut Bitmap) -> Result<(), BackendError> {
        raise(&self.stats.active_draws, &self.stats.max_concurrent_draws);
        if let Some(delay) = self.draw_delay {
            std::thread::sleep(delay);
        }

        let pixels = target.width() as u64 * target.height() as u64;
        let result = if page.fails {
            Err(BackendError::new("syntax error in content stream"))
        } else if self.pixel_limit.is_some_and(|limit| pixels > limit) {
            Err(BackendError::new("out of memory"))
        } else {
            let shade = [page.index as u8, 0, 0, 255];
            for chunk in target.pixels_mut().chunks_exact_mut(4) {
                chunk.copy_from_slice(&shade);
            }
            Ok(())
        };

        self.stats.active_draws.fetch_sub(1, Ordering::SeqCst);
        self.stats.draws.fetch_add(1, Ordering::SeqCst);
        result
    }
}

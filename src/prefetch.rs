//! Neighbour page prefetching
//!
//! When a page is shown the next and then the previous page are rendered in
//! the background, unless that would push in-flight renders past the
//! ceiling or the system is under memory pressure.
//!
//! ```text
//! on_page_shown(n) ─┬─ ceiling reached? ── skip
//!                   ├─ memory > threshold? ── skip
//!                   └─ for n+1, n-1: cached / in flight? ── skip
//!                                    try_admit() → InFlightSlot
//!                                    spawn_blocking(load) → drop(slot)
//! ```

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

use crate::config::PrefetchConfig;
use crate::error::Result;
use crate::memory::MemoryProbe;

/// Pages with a render in progress, shared by foreground and prefetch work
#[derive(Debug, Default)]
pub struct InFlightRegistry {
    pages: Mutex<HashSet<usize>>,
    released: Condvar,
    started: AtomicUsize,
    peak: AtomicUsize,
}

/// Outcome of asking for a prefetch slot
#[derive(Debug)]
pub enum Admission {
    Admitted(InFlightSlot),
    AlreadyInFlight,
    AtCeiling,
}

/// Registry statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct InFlightStats {
    /// Renders currently in flight
    pub active: usize,
    /// Highest number in flight at once
    pub peak: usize,
    /// Renders ever registered
    pub started: usize,
}

impl InFlightRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a foreground render; never refused by the ceiling
    ///
    /// Blocks while another render of the same page is in flight.
    pub fn acquire(self: &Arc<Self>, page: usize) -> InFlightSlot {
        let mut pages = self.pages.lock();
        while pages.contains(&page) {
            self.released.wait(&mut pages);
        }
        pages.insert(page);
        self.record_start(pages.len());
        self.slot(page)
    }

    /// Register a prefetch render if it keeps the total within `ceiling`
    pub fn try_admit(self: &Arc<Self>, page: usize, ceiling: usize) -> Admission {
        let mut pages = self.pages.lock();
        if pages.contains(&page) {
            return Admission::AlreadyInFlight;
        }
        if pages.len() >= ceiling {
            return Admission::AtCeiling;
        }
        pages.insert(page);
        self.record_start(pages.len());
        Admission::Admitted(self.slot(page))
    }

    fn slot(self: &Arc<Self>, page: usize) -> InFlightSlot {
        InFlightSlot {
            registry: Arc::clone(self),
            page,
        }
    }

    fn record_start(&self, active: usize) {
        self.started.fetch_add(1, Ordering::Relaxed);
        self.peak.fetch_max(active, Ordering::Relaxed);
    }

    fn release(&self, page: usize) {
        self.pages.lock().remove(&page);
        self.released.notify_all();
    }

    pub fn contains(&self, page: usize) -> bool {
        self.pages.lock().contains(&page)
    }

    pub fn len(&self) -> usize {
        self.pages.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> InFlightStats {
        InFlightStats {
            active: self.len(),
            peak: self.peak.load(Ordering::Relaxed),
            started: self.started.load(Ordering::Relaxed),
        }
    }
}

/// RAII guard - releases the page from the registry on drop
#[derive(Debug)]
pub struct InFlightSlot {
    registry: Arc<InFlightRegistry>,
    page: usize,
}

impl InFlightSlot {
    pub fn page(&self) -> usize {
        self.page
    }
}

impl Drop for InFlightSlot {
    fn drop(&mut self) {
        self.registry.release(self.page);
    }
}

/// What the prefetcher renders pages through
pub trait PageLoader: Send + Sync + 'static {
    fn page_count(&self) -> usize;

    fn is_cached(&self, page: usize) -> bool;

    /// Render `page` and store it in the cache; blocking
    fn load(&self, page: usize) -> Result<()>;
}

/// Prefetch candidates for a shown page, in scheduling order
pub fn neighbours(page: usize, page_count: usize) -> impl Iterator<Item = usize> {
    let next = page.checked_add(1).filter(|&n| n < page_count);
    let previous = page.checked_sub(1).filter(|&p| p < page_count);
    next.into_iter().chain(previous)
}

/// Background renderer for the pages around the visible one
pub struct PagePrefetcher<L: PageLoader> {
    loader: Arc<L>,
    registry: Arc<InFlightRegistry>,
    probe: Arc<dyn MemoryProbe>,
    config: PrefetchConfig,
    runtime: Handle,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl<L: PageLoader> PagePrefetcher<L> {
    pub fn new(
        loader: Arc<L>,
        registry: Arc<InFlightRegistry>,
        probe: Arc<dyn MemoryProbe>,
        config: PrefetchConfig,
        runtime: Handle,
    ) -> Self {
        Self {
            loader,
            registry,
            probe,
            config,
            runtime,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Schedule neighbours of `page`; returns how many renders were started
    pub fn on_page_shown(&self, page: usize) -> usize {
        let page_count = self.loader.page_count();
        if page >= page_count {
            return 0;
        }

        let in_flight = self.registry.len();
        if in_flight >= self.config.ceiling {
            tracing::debug!("Skipping prefetch around page {}: {} renders in flight", page, in_flight);
            return 0;
        }

        if let Some(snapshot) = self.probe.sample() {
            let utilization = snapshot.utilization();
            if utilization > self.config.memory_threshold {
                tracing::debug!(
                    "Skipping prefetch around page {}: memory at {:.0}%",
                    page,
                    utilization * 100.0
                );
                return 0;
            }
        }

        let mut scheduled = 0;
        for candidate in neighbours(page, page_count) {
            if self.loader.is_cached(candidate) {
                continue;
            }
            let slot = match self.registry.try_admit(candidate, self.config.ceiling) {
                Admission::Admitted(slot) => slot,
                Admission::AlreadyInFlight => continue,
                Admission::AtCeiling => break,
            };

            let loader = Arc::clone(&self.loader);
            let handle = self.runtime.spawn_blocking(move || {
                let _slot = slot;
                match loader.load(candidate) {
                    Ok(()) => tracing::debug!("Prefetched page {}", candidate),
                    Err(e) => tracing::debug!("Prefetch of page {} failed: {}", candidate, e),
                }
            });
            self.track(handle);
            scheduled += 1;
        }
        scheduled
    }

    fn track(&self, handle: JoinHandle<()>) {
        let mut tasks = self.tasks.lock();
        tasks.retain(|task| !task.is_finished());
        tasks.push(handle);
    }

    /// Abort prefetches that have not started yet
    ///
    /// Renders already running finish and populate the cache.
    pub fn cancel_all(&self) -> usize {
        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        let pending = tasks.iter().filter(|task| !task.is_finished()).count();
        for task in tasks {
            task.abort();
        }
        if pending > 0 {
            tracing::debug!("Cancelled {} prefetch tasks", pending);
        }
        pending
    }

    /// Renders currently in flight, foreground included
    pub fn in_flight(&self) -> usize {
        self.registry.len()
    }

    pub fn registry(&self) -> &Arc<InFlightRegistry> {
        &self.registry
    }
}

impl<L: PageLoader> Drop for PagePrefetcher<L> {
    fn drop(&mut self) {
        self.cancel_all();
    }
}

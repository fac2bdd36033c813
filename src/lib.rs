//! QuickPDF rendering core
//!
//! Everything between "the user picked a file" and "a bitmap is on screen":
//! materializing the source locally, unlocking encrypted documents,
//! rasterizing pages at a viewport size, caching them under a memory
//! budget and prefetching neighbours while the user reads.
//!
//! # Modules
//!
//! - `source`: Content references to readable local files, with retry
//! - `password`: Encryption detection, password variants, decrypted copies
//! - `render`: Serialized page rasterization and output sizing
//! - `cache`: Byte-bounded LRU of rendered pages
//! - `prefetch`: Neighbour prefetching with in-flight de-duplication
//! - `session`: One open document wiring the above together
//! - `backend`: The PDF engine seam (MuPDF behind the `mupdf` feature)

pub mod backend;
pub mod cache;
pub mod config;
pub mod error;
pub mod memory;
pub mod password;
pub mod prefetch;
pub mod render;
pub mod session;
pub mod source;
pub mod types;

#[cfg(test)]
mod testing;

pub use config::PipelineConfig;
pub use error::{PipelineError, Result};
pub use render::RenderedPage;
pub use session::{DocumentSession, LockedDocument, Opened, SessionOptions};
pub use types::{DocumentInfo, FitMode, PageRasterRequest, Viewport};

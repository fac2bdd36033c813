//! Pipeline data types
//!
//! Requests, view parameters and document metadata shared by the
//! renderer, the cache and the session.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// How a page is scaled into the viewport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FitMode {
    #[default]
    FitWidth,
    FitPage,
    OriginalSize,
}

impl std::str::FromStr for FitMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "fit-width" | "width" => Ok(FitMode::FitWidth),
            "fit-page" | "page" => Ok(FitMode::FitPage),
            "original-size" | "original" => Ok(FitMode::OriginalSize),
            other => Err(format!("unknown fit mode: {}", other)),
        }
    }
}

/// Target surface in pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
}

impl Viewport {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Half-size viewport used for the reduced retry after an allocation failure
    pub fn halved(self) -> Self {
        Self {
            width: (self.width / 2).max(1),
            height: (self.height / 2).max(1),
        }
    }
}

/// Request for rasterizing one page
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageRasterRequest {
    /// Page index (0-indexed); signed so negative positions fail as out of range
    pub page_index: i64,
    pub target_width: u32,
    pub target_height: u32,
    #[serde(default)]
    pub fit_mode: FitMode,
}

impl PageRasterRequest {
    pub fn new(page_index: i64, viewport: Viewport, fit_mode: FitMode) -> Self {
        Self {
            page_index,
            target_width: viewport.width,
            target_height: viewport.height,
            fit_mode,
        }
    }

    pub fn viewport(&self) -> Viewport {
        Viewport::new(self.target_width, self.target_height)
    }
}

/// Metadata handed to the recent-files store when a document opens
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentInfo {
    /// Display name of the file
    pub name: String,
    /// Size of the source in bytes (0 when unknown)
    pub size_bytes: u64,
    /// When the document was opened
    pub last_accessed: DateTime<Utc>,
    /// Total page count
    pub page_count: usize,
    /// Whether a password was needed to open it
    pub password_protected: bool,
}

impl DocumentInfo {
    /// Size formatted for display ("1.5 MB")
    pub fn display_size(&self) -> String {
        format_file_size(self.size_bytes)
    }
}

/// Format a byte count with one decimal and a binary unit
pub fn format_file_size(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KB", "MB", "GB"];
    let mut size = bytes as f64;
    let mut unit = 0;
    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }
    format!("{:.1} {}", size, UNITS[unit])
}

//! Output size computation
//!
//! Pure functions: no document access, no locking. The renderer memoizes
//! the fit ratio per `(page, target)` pair and feeds it back in here.

use crate::types::{FitMode, Viewport};

/// Absorbs float error so exact fits do not lose a pixel to `floor`
const FLOOR_EPSILON: f64 = 1e-9;

/// Native page size in pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PageSize {
    pub width: u32,
    pub height: u32,
}

impl PageSize {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

/// Maximum bitmap dimensions per axis
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BitmapLimits {
    pub max_width: u32,
    pub max_height: u32,
}

impl Default for BitmapLimits {
    fn default() -> Self {
        Self {
            max_width: crate::config::DEFAULT_MAX_BITMAP_DIMENSION,
            max_height: crate::config::DEFAULT_MAX_BITMAP_DIMENSION,
        }
    }
}

impl From<&crate::config::RenderConfig> for BitmapLimits {
    fn from(config: &crate::config::RenderConfig) -> Self {
        Self {
            max_width: config.max_bitmap_width.max(1),
            max_height: config.max_bitmap_height.max(1),
        }
    }
}

/// Scale factor that fits `page` inside `target`
pub fn fit_ratio(page: PageSize, target: Viewport) -> f64 {
    if page.is_empty() {
        return 0.0;
    }
    let width_ratio = target.width as f64 / page.width as f64;
    let height_ratio = target.height as f64 / page.height as f64;
    width_ratio.min(height_ratio)
}

/// Page scaled by `ratio`, rounded down
pub fn scaled(page: PageSize, ratio: f64) -> (u32, u32) {
    (scale_axis(page.width, ratio), scale_axis(page.height, ratio))
}

fn scale_axis(length: u32, factor: f64) -> u32 {
    let scaled = (length as f64 * factor + FLOOR_EPSILON).floor();
    if scaled <= 0.0 {
        0
    } else if scaled >= u32::MAX as f64 {
        u32::MAX
    } else {
        scaled as u32
    }
}

/// Shrink `(width, height)` uniformly until both axes respect `limits`
pub fn clamp_to_limits((width, height): (u32, u32), limits: BitmapLimits) -> (u32, u32) {
    if width <= limits.max_width && height <= limits.max_height {
        return (width, height);
    }
    let factor = (limits.max_width as f64 / width.max(1) as f64)
        .min(limits.max_height as f64 / height.max(1) as f64);
    (
        scale_axis(width, factor).clamp(1, limits.max_width),
        scale_axis(height, factor).clamp(1, limits.max_height),
    )
}

/// Bitmap size for a page; `None` when the result has no area
///
/// `ratio` is only consulted for the fit modes, so callers can pass a
/// memoizing closure.
pub fn output_size<F>(
    page: PageSize,
    mode: FitMode,
    limits: BitmapLimits,
    ratio: F,
) -> Option<(u32, u32)>
where
    F: FnOnce() -> f64,
{
    let raw = match mode {
        FitMode::OriginalSize => (page.width, page.height),
        FitMode::FitWidth | FitMode::FitPage => scaled(page, ratio()),
    };
    if raw.0 == 0 || raw.1 == 0 {
        return None;
    }
    Some(clamp_to_limits(raw, limits))
}

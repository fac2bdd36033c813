//! Bitmaps produced by the renderer

use std::collections::TryReserveError;

use image::RgbaImage;

/// Bytes per RGBA8 pixel
pub const BYTES_PER_PIXEL: u64 = 4;

/// RGBA8 pixel buffer a backend draws into
#[derive(Debug, Clone)]
pub struct Bitmap {
    width: u32,
    height: u32,
    pixels: Vec<u8>,
}

impl Bitmap {
    /// Allocate a white bitmap, reporting allocation failure instead of aborting
    pub fn try_new(width: u32, height: u32) -> Result<Self, TryReserveError> {
        let len = usize::try_from(byte_cost(width, height)).unwrap_or(usize::MAX);
        let mut pixels = Vec::new();
        pixels.try_reserve_exact(len)?;
        pixels.resize(len, 255);
        Ok(Self {
            width,
            height,
            pixels,
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// Raw RGBA rows, `width * 4` bytes each
    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    pub fn pixels_mut(&mut self) -> &mut [u8] {
        &mut self.pixels
    }

    /// Write one pixel; out-of-bounds writes are ignored
    pub fn put_pixel(&mut self, x: u32, y: u32, rgba: [u8; 4]) {
        if x >= self.width || y >= self.height {
            return;
        }
        let offset = ((y as usize * self.width as usize) + x as usize) * 4;
        self.pixels[offset..offset + 4].copy_from_slice(&rgba);
    }

    pub fn byte_cost(&self) -> u64 {
        byte_cost(self.width, self.height)
    }
}

/// Memory cost of a `width x height` RGBA8 bitmap
pub fn byte_cost(width: u32, height: u32) -> u64 {
    (width as u64)
        .saturating_mul(height as u64)
        .saturating_mul(BYTES_PER_PIXEL)
}

/// A rasterized page ready for display
///
/// Consumers hold it behind an `Arc` and only read from it.
#[derive(Debug)]
pub struct RenderedPage {
    page_index: usize,
    image: RgbaImage,
}

impl RenderedPage {
    pub fn new(page_index: usize, bitmap: Bitmap) -> Self {
        let Bitmap {
            width,
            height,
            pixels,
        } = bitmap;
        // Length is width * height * 4 by construction
        let image = RgbaImage::from_raw(width, height, pixels)
            .unwrap_or_else(|| RgbaImage::new(width, height));
        Self { page_index, image }
    }

    pub fn page_index(&self) -> usize {
        self.page_index
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    pub fn image(&self) -> &RgbaImage {
        &self.image
    }

    /// Bytes this page holds in the cache
    pub fn byte_cost(&self) -> u64 {
        byte_cost(self.width(), self.height())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bitmap_allocation() {
        let bitmap = Bitmap::try_new(3, 2).unwrap();
        assert_eq!(bitmap.pixels().len(), 24);
        assert!(bitmap.pixels().iter().all(|b| *b == 255));
        assert_eq!(bitmap.byte_cost(), 24);
    }

    #[test]
    fn test_put_pixel_bounds() {
        let mut bitmap = Bitmap::try_new(2, 2).unwrap();
        bitmap.put_pixel(1, 1, [1, 2, 3, 4]);
        bitmap.put_pixel(5, 5, [9, 9, 9, 9]);
        assert_eq!(&bitmap.pixels()[12..16], &[1, 2, 3, 4]);
    }

    #[test]
    fn test_impossible_allocation_is_reported() {
        assert!(Bitmap::try_new(u32::MAX, u32::MAX).is_err());
    }

    #[test]
    fn test_rendered_page_keeps_pixels() {
        let mut bitmap = Bitmap::try_new(4, 5).unwrap();
        bitmap.put_pixel(0, 0, [10, 20, 30, 255]);
        let page = RenderedPage::new(7, bitmap);
        assert_eq!(page.page_index(), 7);
        assert_eq!((page.width(), page.height()), (4, 5));
        assert_eq!(page.image().get_pixel(0, 0).0, [10, 20, 30, 255]);
        assert_eq!(page.byte_cost(), 80);
    }
}

use image::{Rgba, RgbaImage};
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

/// Bytes per BGRA8 pixel.
pub const BYTES_PER_PIXEL: usize = 4;

// ============================================================================
// PIXEL RECT
// ============================================================================

/// Axis-aligned rectangle in canvas pixel coordinates.
///
/// The origin may be negative (a brush dab hanging off the left edge); use
/// [`PixelRect::clamp_to`] before touching pixels.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PixelRect {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

impl PixelRect {
    pub const EMPTY: PixelRect = PixelRect {
        x: 0,
        y: 0,
        width: 0,
        height: 0,
    };

    pub fn new(x: i32, y: i32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Rect covering a whole `width` x `height` canvas.
    pub fn full(width: u32, height: u32) -> Self {
        Self::new(0, 0, width, height)
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    pub fn right(&self) -> i64 {
        self.x as i64 + self.width as i64
    }

    pub fn bottom(&self) -> i64 {
        self.y as i64 + self.height as i64
    }

    pub fn area(&self) -> usize {
        self.width as usize * self.height as usize
    }

    /// Size of a tightly packed BGRA copy of this rect.
    pub fn byte_len(&self) -> usize {
        self.area() * BYTES_PER_PIXEL
    }

    /// Bounding box of both rects. Empty rects are the identity.
    pub fn union(&self, other: &PixelRect) -> PixelRect {
        if self.is_empty() {
            return *other;
        }
        if other.is_empty() {
            return *self;
        }
        let x0 = self.x.min(other.x);
        let y0 = self.y.min(other.y);
        let x1 = self.right().max(other.right());
        let y1 = self.bottom().max(other.bottom());
        PixelRect::new(x0, y0, (x1 - x0 as i64) as u32, (y1 - y0 as i64) as u32)
    }

    /// Intersect with a `width` x `height` canvas.
    pub fn clamp_to(&self, width: u32, height: u32) -> PixelRect {
        let x0 = (self.x as i64).clamp(0, width as i64);
        let y0 = (self.y as i64).clamp(0, height as i64);
        let x1 = self.right().clamp(0, width as i64);
        let y1 = self.bottom().clamp(0, height as i64);
        if x1 <= x0 || y1 <= y0 {
            return PixelRect::EMPTY;
        }
        PixelRect::new(x0 as i32, y0 as i32, (x1 - x0) as u32, (y1 - y0) as u32)
    }

    pub fn contains(&self, x: i32, y: i32) -> bool {
        let (x, y) = (x as i64, y as i64);
        x >= self.x as i64 && y >= self.y as i64 && x < self.right() && y < self.bottom()
    }
}

// ============================================================================
// RASTER DOCUMENT
// ============================================================================

/// One mutable BGRA8 pixel buffer.
///
/// Rows are `stride` bytes apart; anything past `width * 4` in a row is padding and
/// never compared or exported.
#[derive(Clone, Debug)]
pub struct RasterDocument {
    width: u32,
    height: u32,
    stride: usize,
    pixels: Vec<u8>,
}

impl RasterDocument {
    /// Fully transparent canvas.
    pub fn new(width: u32, height: u32) -> Self {
        Self::filled(width, height, [0, 0, 0, 0])
    }

    pub fn filled(width: u32, height: u32, bgra: [u8; 4]) -> Self {
        let stride = width as usize * BYTES_PER_PIXEL;
        let mut pixels = Vec::with_capacity(stride * height as usize);
        for _ in 0..(width as usize * height as usize) {
            pixels.extend_from_slice(&bgra);
        }
        Self {
            width,
            height,
            stride,
            pixels,
        }
    }

    /// Wrap an existing buffer (for example one handed out by a [`BufferPool`]).
    pub fn from_raw(width: u32, height: u32, stride: usize, pixels: Vec<u8>) -> Result<Self> {
        let row = width as usize * BYTES_PER_PIXEL;
        if stride < row {
            return Err(EngineError::invalid_state(format!(
                "stride {} shorter than row of {} bytes",
                stride, row
            )));
        }
        let needed = stride * height as usize;
        if pixels.len() < needed {
            return Err(EngineError::invalid_state(format!(
                "buffer holds {} bytes, {}x{} with stride {} needs {}",
                pixels.len(),
                width,
                height,
                stride,
                needed
            )));
        }
        Ok(Self {
            width,
            height,
            stride,
            pixels,
        })
    }

    /// Tightly packed buffer (`stride == width * 4`).
    pub fn from_packed(width: u32, height: u32, pixels: Vec<u8>) -> Result<Self> {
        let stride = width as usize * BYTES_PER_PIXEL;
        if pixels.len() != stride * height as usize {
            return Err(EngineError::invalid_state(format!(
                "packed buffer of {} bytes does not match {}x{}",
                pixels.len(),
                width,
                height
            )));
        }
        Self::from_raw(width, height, stride, pixels)
    }

    /// `from_packed` for a buffer already known to be `width * height * 4` bytes.
    pub(crate) fn packed_unchecked(width: u32, height: u32, pixels: Vec<u8>) -> Self {
        Self {
            width,
            height,
            stride: width as usize * BYTES_PER_PIXEL,
            pixels,
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn stride(&self) -> usize {
        self.stride
    }

    pub fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn bounds(&self) -> PixelRect {
        PixelRect::full(self.width, self.height)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.pixels
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.pixels
    }

    /// Heap footprint of the pixel storage.
    pub fn byte_len(&self) -> usize {
        self.pixels.len()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.pixels
    }

    /// Tightly packed bytes, reusing the allocation when there is no row padding.
    pub fn into_packed(self) -> Vec<u8> {
        let packed_len = self.width as usize * self.height as usize * BYTES_PER_PIXEL;
        if self.stride == self.width as usize * BYTES_PER_PIXEL {
            let mut pixels = self.pixels;
            pixels.truncate(packed_len);
            pixels
        } else {
            self.to_packed()
        }
    }

    fn offset(&self, x: u32, y: u32) -> usize {
        y as usize * self.stride + x as usize * BYTES_PER_PIXEL
    }

    pub fn pixel(&self, x: u32, y: u32) -> Option<[u8; 4]> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let o = self.offset(x, y);
        let px = self.pixels.get(o..o + BYTES_PER_PIXEL)?;
        Some([px[0], px[1], px[2], px[3]])
    }

    /// Returns `false` when the coordinate is off-canvas.
    pub fn set_pixel(&mut self, x: u32, y: u32, bgra: [u8; 4]) -> bool {
        if x >= self.width || y >= self.height {
            return false;
        }
        let o = self.offset(x, y);
        match self.pixels.get_mut(o..o + BYTES_PER_PIXEL) {
            Some(px) => {
                px.copy_from_slice(&bgra);
                true
            }
            None => false,
        }
    }

    /// Visible bytes of row `y` (padding excluded).
    pub fn row(&self, y: u32) -> &[u8] {
        let start = y as usize * self.stride;
        &self.pixels[start..start + self.width as usize * BYTES_PER_PIXEL]
    }

    /// Tightly packed copy of `rect` after clamping to the canvas.
    pub fn copy_rect(&self, rect: PixelRect) -> Vec<u8> {
        let rect = rect.clamp_to(self.width, self.height);
        let mut out = Vec::with_capacity(rect.byte_len());
        self.copy_rect_into(rect, &mut out);
        out
    }

    fn copy_rect_into(&self, rect: PixelRect, out: &mut Vec<u8>) {
        let row_bytes = rect.width as usize * BYTES_PER_PIXEL;
        for y in rect.y as u32..rect.y as u32 + rect.height {
            let start = self.offset(rect.x as u32, y);
            out.extend_from_slice(&self.pixels[start..start + row_bytes]);
        }
    }

    /// Write a tightly packed patch back over `rect`. `rect` must already be inside
    /// the canvas (as produced by [`copy_rect`](Self::copy_rect)).
    pub fn write_rect(&mut self, rect: PixelRect, patch: &[u8]) -> Result<()> {
        if rect.clamp_to(self.width, self.height) != rect {
            return Err(EngineError::invalid_state(format!(
                "patch rect {:?} exceeds {}x{} canvas",
                rect, self.width, self.height
            )));
        }
        if patch.len() != rect.byte_len() {
            return Err(EngineError::invalid_state(format!(
                "patch of {} bytes does not cover {:?}",
                patch.len(),
                rect
            )));
        }
        self.blit_rect(rect, patch);
        Ok(())
    }

    /// `write_rect` without the checks. `rect` must lie inside the canvas and
    /// `patch` must hold exactly `rect.byte_len()` bytes.
    pub(crate) fn blit_rect(&mut self, rect: PixelRect, patch: &[u8]) {
        let row_bytes = rect.width as usize * BYTES_PER_PIXEL;
        for (i, src) in patch.chunks_exact(row_bytes.max(1)).enumerate() {
            let start = self.offset(rect.x as u32, rect.y as u32 + i as u32);
            self.pixels[start..start + row_bytes].copy_from_slice(src);
        }
    }

    /// Same dimensions and same visible bytes. Stride padding is ignored.
    pub fn content_eq(&self, other: &RasterDocument) -> bool {
        self.size() == other.size() && (0..self.height).all(|y| self.row(y) == other.row(y))
    }

    /// Tightly packed copy of every visible byte.
    pub fn to_packed(&self) -> Vec<u8> {
        self.copy_rect(self.bounds())
    }

    /// Swap the whole buffer for `other`, returning the previous contents.
    pub fn replace(&mut self, other: RasterDocument) -> RasterDocument {
        std::mem::replace(self, other)
    }

    // -- codec bridge --------------------------------------------------------

    /// Convert from the `image` crate's RGBA layout.
    pub fn from_rgba_image(img: &RgbaImage) -> Self {
        let (width, height) = img.dimensions();
        let mut pixels = Vec::with_capacity(width as usize * height as usize * BYTES_PER_PIXEL);
        for px in img.pixels() {
            let [r, g, b, a] = px.0;
            pixels.extend_from_slice(&[b, g, r, a]);
        }
        Self {
            width,
            height,
            stride: width as usize * BYTES_PER_PIXEL,
            pixels,
        }
    }

    /// Convert to the `image` crate's RGBA layout.
    pub fn to_rgba_image(&self) -> RgbaImage {
        let mut img = RgbaImage::new(self.width, self.height);
        for y in 0..self.height {
            for (x, px) in self.row(y).chunks_exact(BYTES_PER_PIXEL).enumerate() {
                img.put_pixel(x as u32, y, Rgba([px[2], px[1], px[0], px[3]]));
            }
        }
        img
    }
}

impl PartialEq for RasterDocument {
    fn eq(&self, other: &Self) -> bool {
        self.content_eq(other)
    }
}

impl Eq for RasterDocument {}

// ============================================================================
// BUFFER POOL
// ============================================================================

/// Retains large pixel allocations for reuse after a buffer is replaced or an undo
/// entry is dropped.
#[derive(Debug)]
pub struct BufferPool {
    free: Vec<Vec<u8>>,
    capacity: usize,
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new(4)
    }
}

impl BufferPool {
    /// `capacity` is the maximum number of buffers kept around.
    pub fn new(capacity: usize) -> Self {
        Self {
            free: Vec::new(),
            capacity,
        }
    }

    /// Zeroed buffer of exactly `len` bytes, reusing a retained allocation if one is
    /// big enough.
    pub fn take(&mut self, len: usize) -> Vec<u8> {
        match self.free.iter().position(|b| b.capacity() >= len) {
            Some(idx) => {
                let mut buf = self.free.swap_remove(idx);
                buf.clear();
                buf.resize(len, 0);
                buf
            }
            None => vec![0; len],
        }
    }

    /// Buffer filled with a copy of `src`.
    pub fn take_copy(&mut self, src: &[u8]) -> Vec<u8> {
        let mut buf = self.take(0);
        buf.extend_from_slice(src);
        buf
    }

    pub fn release(&mut self, buf: Vec<u8>) {
        if buf.capacity() == 0 {
            return;
        }
        if self.free.len() >= self.capacity {
            // Keep the largest allocations.
            match self
                .free
                .iter()
                .enumerate()
                .min_by_key(|(_, b)| b.capacity())
            {
                Some((idx, smallest)) if smallest.capacity() < buf.capacity() => {
                    self.free[idx] = buf;
                }
                _ => {}
            }
            return;
        }
        self.free.push(buf);
    }

    pub fn retained(&self) -> usize {
        self.free.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn union_is_bounding_box() {
        let a = PixelRect::new(10, 10, 5, 5);
        let b = PixelRect::new(30, 2, 2, 2);
        assert_eq!(a.union(&b), PixelRect::new(10, 2, 22, 13));
        assert_eq!(PixelRect::EMPTY.union(&a), a);
        assert_eq!(a.union(&PixelRect::EMPTY), a);
    }

    #[test]
    fn clamp_drops_offcanvas_parts() {
        let r = PixelRect::new(-3, 8, 6, 6);
        assert_eq!(r.clamp_to(10, 10), PixelRect::new(0, 8, 3, 2));
        assert!(PixelRect::new(20, 20, 4, 4).clamp_to(10, 10).is_empty());
    }

    #[test]
    fn rect_copy_and_write_respect_stride() {
        // 3x2 canvas with 4 bytes of padding per row
        let stride = 3 * BYTES_PER_PIXEL + 4;
        let mut doc = RasterDocument::from_raw(3, 2, stride, vec![0; stride * 2]).unwrap();
        assert!(doc.set_pixel(2, 1, [1, 2, 3, 4]));
        assert!(!doc.set_pixel(3, 0, [9, 9, 9, 9]));

        let patch = doc.copy_rect(PixelRect::new(1, 1, 5, 5));
        assert_eq!(patch, vec![0, 0, 0, 0, 1, 2, 3, 4]);

        doc.write_rect(PixelRect::new(0, 0, 2, 1), &[5, 5, 5, 5, 6, 6, 6, 6])
            .unwrap();
        assert_eq!(doc.pixel(1, 0), Some([6, 6, 6, 6]));
        assert!(doc.write_rect(PixelRect::new(0, 0, 2, 1), &[0; 4]).is_err());

        let packed = RasterDocument::from_packed(3, 2, doc.to_packed()).unwrap();
        assert!(packed.content_eq(&doc));
    }

    #[test]
    fn rgba_bridge_swizzles_channels() {
        let mut doc = RasterDocument::new(2, 1);
        doc.set_pixel(0, 0, [10, 20, 30, 255]);
        let img = doc.to_rgba_image();
        assert_eq!(img.get_pixel(0, 0).0, [30, 20, 10, 255]);
        assert_eq!(RasterDocument::from_rgba_image(&img), doc);
    }

    #[test]
    fn pool_reuses_allocations() {
        let mut pool = BufferPool::new(1);
        let buf = pool.take(1024);
        let ptr = buf.as_ptr();
        pool.release(buf);
        assert_eq!(pool.retained(), 1);
        let again = pool.take(512);
        assert_eq!(again.as_ptr(), ptr);
        assert_eq!(again.len(), 512);
        assert!(again.iter().all(|b| *b == 0));
    }
}

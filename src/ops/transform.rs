// ============================================================================
// TRANSFORM OPERATIONS: resize, watermark stamp, thumbnails
// ============================================================================
//
// Pure functions over RasterDocument: they never touch history or tabs, so the
// batch runner can call them from its per-unit worker threads.

use std::sync::Arc;

use image::imageops;

use crate::canvas::{BYTES_PER_PIXEL, RasterDocument};

/// Interpolation method for resize operations.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum Interpolation {
    Nearest,
    #[default]
    Bilinear,
    Bicubic,
    Lanczos3,
}

impl Interpolation {
    pub fn all() -> &'static [Interpolation] {
        &[
            Interpolation::Nearest,
            Interpolation::Bilinear,
            Interpolation::Bicubic,
            Interpolation::Lanczos3,
        ]
    }

    pub fn name(&self) -> &'static str {
        match self {
            Interpolation::Nearest => "nearest",
            Interpolation::Bilinear => "bilinear",
            Interpolation::Bicubic => "bicubic",
            Interpolation::Lanczos3 => "lanczos3",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::all()
            .iter()
            .copied()
            .find(|i| i.name().eq_ignore_ascii_case(s))
    }

    pub fn to_filter(&self) -> imageops::FilterType {
        match self {
            Interpolation::Nearest => imageops::FilterType::Nearest,
            Interpolation::Bilinear => imageops::FilterType::Triangle,
            Interpolation::Bicubic => imageops::FilterType::CatmullRom,
            Interpolation::Lanczos3 => imageops::FilterType::Lanczos3,
        }
    }
}

/// Resample the whole image to `new_w` x `new_h`.
pub fn resize_image(doc: &RasterDocument, new_w: u32, new_h: u32, interp: Interpolation) -> RasterDocument {
    let new_w = new_w.max(1);
    let new_h = new_h.max(1);
    if doc.size() == (new_w, new_h) {
        return doc.clone();
    }
    let flat = doc.to_rgba_image();
    let resized = imageops::resize(&flat, new_w, new_h, interp.to_filter());
    RasterDocument::from_rgba_image(&resized)
}

// ============================================================================
// WATERMARK
// ============================================================================

/// Where the stamp sits on the target image.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum Anchor {
    TopLeft,
    TopRight,
    BottomLeft,
    #[default]
    BottomRight,
    Center,
}

impl Anchor {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().replace('_', "-").as_str() {
            "top-left" => Some(Anchor::TopLeft),
            "top-right" => Some(Anchor::TopRight),
            "bottom-left" => Some(Anchor::BottomLeft),
            "bottom-right" => Some(Anchor::BottomRight),
            "center" | "centre" => Some(Anchor::Center),
            _ => None,
        }
    }

    /// Top-left corner of a `stamp` sized box inside a `target` sized image.
    fn origin(&self, target: (u32, u32), stamp: (u32, u32), margin: u32) -> (i64, i64) {
        let (tw, th) = (target.0 as i64, target.1 as i64);
        let (sw, sh) = (stamp.0 as i64, stamp.1 as i64);
        let m = margin as i64;
        match self {
            Anchor::TopLeft => (m, m),
            Anchor::TopRight => (tw - sw - m, m),
            Anchor::BottomLeft => (m, th - sh - m),
            Anchor::BottomRight => (tw - sw - m, th - sh - m),
            Anchor::Center => ((tw - sw) / 2, (th - sh) / 2),
        }
    }
}

/// A stamp image blended over every target.
#[derive(Clone, Debug)]
pub struct Watermark {
    pub stamp: Arc<RasterDocument>,
    pub anchor: Anchor,
    /// 0.0 – 1.0, multiplied with the stamp's own alpha.
    pub opacity: f32,
    pub margin: u32,
}

impl Watermark {
    pub fn new(stamp: RasterDocument) -> Self {
        Self {
            stamp: Arc::new(stamp),
            anchor: Anchor::default(),
            opacity: 0.5,
            margin: 16,
        }
    }
}

/// Source-over blend of one BGRA pixel with an extra opacity factor.
fn blend_over(dst: &mut [u8], src: &[u8], opacity: f32) {
    let sa = (src[3] as f32 / 255.0) * opacity;
    if sa <= 0.0 {
        return;
    }
    let da = dst[3] as f32 / 255.0;
    let out_a = sa + da * (1.0 - sa);
    if out_a <= 0.0 {
        dst.copy_from_slice(&[0, 0, 0, 0]);
        return;
    }
    for c in 0..3 {
        let s = src[c] as f32 / 255.0;
        let d = dst[c] as f32 / 255.0;
        let v = (s * sa + d * da * (1.0 - sa)) / out_a;
        dst[c] = (v * 255.0).round().clamp(0.0, 255.0) as u8;
    }
    dst[3] = (out_a * 255.0).round().clamp(0.0, 255.0) as u8;
}

/// Copy of `doc` with the watermark blended in. Stamp pixels falling off the
/// canvas are skipped.
pub fn stamp_watermark(doc: &RasterDocument, watermark: &Watermark) -> RasterDocument {
    let mut out = doc.clone();
    let opacity = watermark.opacity.clamp(0.0, 1.0);
    if opacity <= 0.0 {
        return out;
    }
    let stamp = &watermark.stamp;
    let (ox, oy) = watermark
        .anchor
        .origin(doc.size(), stamp.size(), watermark.margin);
    let stride = out.stride();

    for sy in 0..stamp.height() {
        let ty = oy + sy as i64;
        if ty < 0 || ty >= doc.height() as i64 {
            continue;
        }
        let src_row = stamp.row(sy);
        let row_start = ty as usize * stride;
        let dst_row = &mut out.as_bytes_mut()[row_start..row_start + doc.width() as usize * BYTES_PER_PIXEL];
        for (sx, src) in src_row.chunks_exact(BYTES_PER_PIXEL).enumerate() {
            let tx = ox + sx as i64;
            if tx < 0 || tx >= doc.width() as i64 {
                continue;
            }
            let o = tx as usize * BYTES_PER_PIXEL;
            blend_over(&mut dst_row[o..o + BYTES_PER_PIXEL], src, opacity);
        }
    }
    out
}

// ============================================================================
// THUMBNAILS
// ============================================================================

/// Downscaled copy fitting in `max_dim` x `max_dim`, aspect preserved. Images that
/// already fit are copied as-is.
pub fn make_thumbnail(doc: &RasterDocument, max_dim: u32) -> RasterDocument {
    let max_dim = max_dim.max(1);
    let (w, h) = doc.size();
    if w <= max_dim && h <= max_dim {
        return doc.clone();
    }
    let scale = max_dim as f32 / w.max(h) as f32;
    let tw = ((w as f32 * scale).round() as u32).clamp(1, max_dim);
    let th = ((h as f32 * scale).round() as u32).clamp(1, max_dim);
    let thumb = imageops::thumbnail(&doc.to_rgba_image(), tw, th);
    RasterDocument::from_rgba_image(&thumb)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resize_changes_dimensions() {
        let doc = RasterDocument::filled(40, 20, [10, 20, 30, 255]);
        let out = resize_image(&doc, 8, 6, Interpolation::Nearest);
        assert_eq!(out.size(), (8, 6));
        assert_eq!(out.pixel(4, 3), Some([10, 20, 30, 255]));
    }

    #[test]
    fn opaque_watermark_lands_at_anchor() {
        let doc = RasterDocument::filled(10, 10, [0, 0, 0, 255]);
        let mut wm = Watermark::new(RasterDocument::filled(2, 2, [255, 255, 255, 255]));
        wm.opacity = 1.0;
        wm.margin = 1;
        let out = stamp_watermark(&doc, &wm);
        assert_eq!(out.pixel(7, 7), Some([255, 255, 255, 255]));
        assert_eq!(out.pixel(8, 8), Some([255, 255, 255, 255]));
        assert_eq!(out.pixel(6, 6), Some([0, 0, 0, 255]));
        assert_eq!(out.pixel(9, 9), Some([0, 0, 0, 255]));
    }

    #[test]
    fn oversized_stamp_is_clipped() {
        let doc = RasterDocument::filled(4, 4, [0, 0, 0, 255]);
        let mut wm = Watermark::new(RasterDocument::filled(10, 10, [255, 0, 0, 255]));
        wm.anchor = Anchor::Center;
        wm.opacity = 1.0;
        let out = stamp_watermark(&doc, &wm);
        assert_eq!(out.size(), (4, 4));
        assert_eq!(out.pixel(0, 0), Some([255, 0, 0, 255]));
    }

    #[test]
    fn thumbnail_keeps_aspect() {
        let doc = RasterDocument::new(400, 200);
        assert_eq!(make_thumbnail(&doc, 100).size(), (100, 50));
        assert_eq!(make_thumbnail(&doc, 1000).size(), (400, 200));
    }
}

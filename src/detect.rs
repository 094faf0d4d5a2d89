//! External segment-detector wrapper.
//!
//! Detection itself is a collaborator behind [`SegmentDetector`]; this
//! module handles what surrounds it: downscaling oversized images (with
//! coordinate rescaling), dropping segments below the minimum length,
//! capping the per-view segment count by length, and the opaque per-view
//! cache keyed by camera id and detection resolution.

use crate::reconstructor::EngineOptions;
use crate::types::CameraId;
use crate::view::MIN_LINE_LENGTH_FACTOR;
use log::{debug, warn};
use std::cmp::Ordering;
use std::fs::File;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

/// Borrowed 8-bit grayscale image.
#[derive(Clone, Copy, Debug)]
pub struct ImageU8<'a> {
    pub w: usize,
    pub h: usize,
    /// Bytes between rows.
    pub stride: usize,
    pub data: &'a [u8],
}

impl<'a> ImageU8<'a> {
    #[inline]
    pub fn get(&self, x: usize, y: usize) -> u8 {
        self.data[y * self.stride + x]
    }
}

/// External 2D line-segment detector. Returns endpoint quads
/// `(x1, y1, x2, y2)` in the coordinates of the image it was given.
pub trait SegmentDetector {
    fn detect(&self, image: ImageU8<'_>) -> Vec<[f64; 4]>;
}

/// Run the detector for a view, honoring the engine's size and caching
/// options. `None` when no usable segment survives.
pub(crate) fn detect_segments(
    options: &EngineOptions,
    cam: CameraId,
    image: ImageU8<'_>,
    detector: &dyn SegmentDetector,
) -> Option<Vec<[f64; 4]>> {
    let max_dim = image.w.max(image.h);
    let (detect_w, detect_h) = if options.max_image_width > 0
        && max_dim > options.max_image_width as usize
    {
        let s = options.max_image_width as f64 / max_dim as f64;
        (
            ((image.w as f64 * s).round() as usize).max(1),
            ((image.h as f64 * s).round() as usize).max(1),
        )
    } else {
        (image.w, image.h)
    };

    let cache_path = options
        .segment_cache
        .as_deref()
        .map(|dir| cache_key(dir, cam, detect_w, detect_h));
    if let Some(path) = &cache_path {
        match load_cache(path) {
            Ok(Some(segments)) => {
                debug!("loaded {} cached segments for view [{cam}]", segments.len());
                return Some(segments).filter(|s| !s.is_empty());
            }
            Ok(None) => {}
            Err(err) => warn!("ignoring unreadable segment cache {}: {err}", path.display()),
        }
    }

    let mut detections = if (detect_w, detect_h) == (image.w, image.h) {
        detector.detect(image)
    } else {
        let buffer = downscale_bilinear(image, detect_w, detect_h);
        let small = ImageU8 {
            w: detect_w,
            h: detect_h,
            stride: detect_w,
            data: &buffer,
        };
        let upscale_x = image.w as f64 / detect_w as f64;
        let upscale_y = image.h as f64 / detect_h as f64;
        detector
            .detect(small)
            .into_iter()
            .map(|[x1, y1, x2, y2]| [x1 * upscale_x, y1 * upscale_y, x2 * upscale_x, y2 * upscale_y])
            .collect()
    };

    // Keep the longest segments above the diagonal-relative minimum length.
    let diagonal = ((image.w * image.w + image.h * image.h) as f64).sqrt();
    let min_len = diagonal * MIN_LINE_LENGTH_FACTOR;
    detections.retain(|s| {
        let (dx, dy) = (s[0] - s[2], s[1] - s[3]);
        (dx * dx + dy * dy).sqrt() > min_len
    });
    detections.sort_by(|a, b| {
        let la = (a[0] - a[2]).powi(2) + (a[1] - a[3]).powi(2);
        let lb = (b[0] - b[2]).powi(2) + (b[1] - b[3]).powi(2);
        lb.partial_cmp(&la).unwrap_or(Ordering::Equal)
    });
    detections.truncate(options.max_segments_per_view);

    if detections.is_empty() {
        return None;
    }

    if let Some(path) = &cache_path {
        if let Err(err) = store_cache(path, &detections) {
            warn!("failed to write segment cache {}: {err}", path.display());
        }
    }
    Some(detections)
}

fn cache_key(dir: &Path, cam: CameraId, w: usize, h: usize) -> PathBuf {
    dir.join(format!("segments_{cam}_{w}x{h}.bin"))
}

/// Opaque little-endian dump: segment count followed by endpoint quads.
fn store_cache(path: &Path, segments: &[[f64; 4]]) -> io::Result<()> {
    let mut file = File::create(path)?;
    file.write_all(&(segments.len() as u64).to_le_bytes())?;
    for seg in segments {
        for value in seg {
            file.write_all(&value.to_le_bytes())?;
        }
    }
    Ok(())
}

fn load_cache(path: &Path) -> io::Result<Option<Vec<[f64; 4]>>> {
    if !path.exists() {
        return Ok(None);
    }
    let mut file = File::open(path)?;
    let mut count_buf = [0u8; 8];
    file.read_exact(&mut count_buf)?;
    let count = u64::from_le_bytes(count_buf) as usize;

    let mut segments = Vec::with_capacity(count);
    let mut value_buf = [0u8; 8];
    for _ in 0..count {
        let mut seg = [0.0f64; 4];
        for value in &mut seg {
            file.read_exact(&mut value_buf)?;
            *value = f64::from_le_bytes(value_buf);
        }
        segments.push(seg);
    }
    Ok(Some(segments))
}

/// Bilinear downscale of a grayscale image into an owned buffer.
fn downscale_bilinear(src: ImageU8<'_>, new_w: usize, new_h: usize) -> Vec<u8> {
    let mut out = vec![0u8; new_w * new_h];
    let sx = src.w as f64 / new_w as f64;
    let sy = src.h as f64 / new_h as f64;
    for y in 0..new_h {
        let fy = ((y as f64 + 0.5) * sy - 0.5).clamp(0.0, (src.h - 1) as f64);
        let y0 = fy.floor() as usize;
        let y1 = (y0 + 1).min(src.h - 1);
        let wy = fy - y0 as f64;
        for x in 0..new_w {
            let fx = ((x as f64 + 0.5) * sx - 0.5).clamp(0.0, (src.w - 1) as f64);
            let x0 = fx.floor() as usize;
            let x1 = (x0 + 1).min(src.w - 1);
            let wx = fx - x0 as f64;

            let top = f64::from(src.get(x0, y0)) * (1.0 - wx) + f64::from(src.get(x1, y0)) * wx;
            let bottom = f64::from(src.get(x0, y1)) * (1.0 - wx) + f64::from(src.get(x1, y1)) * wx;
            out[y * new_w + x] = (top * (1.0 - wy) + bottom * wy).round() as u8;
        }
    }
    out
}

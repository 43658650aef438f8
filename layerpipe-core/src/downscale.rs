//! # Downscaling
//!
//! Two resamplers, one per [`Quality`] tier:
//! * [`Quality::Fast`] - nearest neighbor, one source read per output pixel.
//! * [`Quality::Beautiful`] - area average in linear light (gamma 2.2), alpha weighted.
//!
//! Both come in a full flavor (whole output) and a partial flavor that only recomputes output
//! pixels fed by a set of dirty source tiles, so cost tracks the changed area.

use image::RgbaImage;
use rayon::prelude::*;
use std::sync::OnceLock;

use crate::{
    cancel::CancelToken,
    compositor::{RenderError, TilePos},
};

pub const GAMMA: f32 = 2.2;

/// Resampling quality. The discriminants are part of the host cache key, do not reorder!
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Hash,
    Default,
    strum::EnumIter,
    strum::AsRefStr,
    serde::Serialize,
    serde::Deserialize,
)]
#[repr(u8)]
pub enum Quality {
    #[default]
    Beautiful = 0,
    Fast = 1,
}
impl Quality {
    /// Stable numeric code used on the wire and in hashes.
    #[must_use]
    pub fn code(self) -> u8 {
        self as u8
    }
    #[must_use]
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::Beautiful),
            1 => Some(Self::Fast),
            _ => None,
        }
    }
}

/// Size of `src` scaled by `scale`, rounded, and never smaller than 1x1.
#[must_use]
pub fn scaled_size(src: [u32; 2], scale: f64) -> [u32; 2] {
    let dim = |d: u32| -> u32 {
        // Saturating float->int cast, scale is at most 1 anyway.
        let scaled = (f64::from(d) * scale + 0.5) as u32;
        scaled.max(1)
    };
    [dim(src[0]), dim(src[1])]
}

fn to_linear_table() -> &'static [f32; 256] {
    static TABLE: OnceLock<[f32; 256]> = OnceLock::new();
    TABLE.get_or_init(|| {
        let mut table = [0.0; 256];
        for (i, v) in table.iter_mut().enumerate() {
            *v = (i as f32 / 255.0).powf(GAMMA);
        }
        table
    })
}

const FROM_LINEAR_STEPS: usize = 4096;
fn from_linear_table() -> &'static [u8; FROM_LINEAR_STEPS] {
    static TABLE: OnceLock<[u8; FROM_LINEAR_STEPS]> = OnceLock::new();
    TABLE.get_or_init(|| {
        let mut table = [0u8; FROM_LINEAR_STEPS];
        for (i, v) in table.iter_mut().enumerate() {
            let linear = i as f32 / (FROM_LINEAR_STEPS - 1) as f32;
            *v = (linear.powf(1.0 / GAMMA) * 255.0).round().clamp(0.0, 255.0) as u8;
        }
        table
    })
}
#[inline]
fn from_linear(linear: f32) -> u8 {
    let index = (linear.clamp(0.0, 1.0) * (FROM_LINEAR_STEPS - 1) as f32).round() as usize;
    from_linear_table()[index.min(FROM_LINEAR_STEPS - 1)]
}

/// Precomputed source/destination ratios.
#[derive(Clone, Copy)]
struct Ratio {
    src: [u32; 2],
    dst: [u32; 2],
    // src pixels per dst pixel
    step: [f64; 2],
}
impl Ratio {
    fn new(src: &RgbaImage, dst: &RgbaImage) -> Self {
        let src = [src.width(), src.height()];
        let dst = [dst.width(), dst.height()];
        Self {
            src,
            dst,
            step: [
                f64::from(src[0]) / f64::from(dst[0]),
                f64::from(src[1]) / f64::from(dst[1]),
            ],
        }
    }
    /// Destination rect `[x0, y0, x1, y1)` whose pixels read from source rect `rect`.
    fn dst_rect_of(&self, rect: [u32; 4]) -> [u32; 4] {
        let lo = |v: u32, axis: usize| ((f64::from(v) / self.step[axis]).floor() as u32).min(self.dst[axis]);
        let hi = |v: u32, axis: usize| ((f64::from(v) / self.step[axis]).ceil() as u32).min(self.dst[axis]);
        [lo(rect[0], 0), lo(rect[1], 1), hi(rect[2], 0), hi(rect[3], 1)]
    }
}

fn sample_nearest(src: &RgbaImage, ratio: Ratio, dx: u32, dy: u32) -> [u8; 4] {
    let sx = (((f64::from(dx) + 0.5) * ratio.step[0]) as u32).min(ratio.src[0] - 1);
    let sy = (((f64::from(dy) + 0.5) * ratio.step[1]) as u32).min(ratio.src[1] - 1);
    src.get_pixel(sx, sy).0
}

/// Covered source span `[start, end)` of a destination coordinate, and the integer pixels it touches.
fn span(d: u32, step: f64, limit: u32) -> (f64, f64, u32, u32) {
    let start = f64::from(d) * step;
    let end = (f64::from(d + 1) * step).min(f64::from(limit));
    let first = start.floor() as u32;
    let last = (end.ceil() as u32).clamp(first + 1, limit);
    (start, end, first, last)
}

fn sample_gamma(src: &RgbaImage, ratio: Ratio, dx: u32, dy: u32) -> [u8; 4] {
    let lin = to_linear_table();
    let (fx0, fx1, sx0, sx1) = span(dx, ratio.step[0], ratio.src[0]);
    let (fy0, fy1, sy0, sy1) = span(dy, ratio.step[1], ratio.src[1]);

    let mut color = [0.0f64; 3];
    let mut alpha_sum = 0.0f64;
    let mut weight_sum = 0.0f64;
    for sy in sy0..sy1 {
        let wy = fy1.min(f64::from(sy + 1)) - fy0.max(f64::from(sy));
        if wy <= 0.0 {
            continue;
        }
        for sx in sx0..sx1 {
            let wx = fx1.min(f64::from(sx + 1)) - fx0.max(f64::from(sx));
            if wx <= 0.0 {
                continue;
            }
            let w = wx * wy;
            let px = src.get_pixel(sx, sy).0;
            let a = f64::from(px[3]) / 255.0 * w;
            for c in 0..3 {
                color[c] += f64::from(lin[px[c] as usize]) * a;
            }
            alpha_sum += a;
            weight_sum += w;
        }
    }
    if alpha_sum <= 0.0 || weight_sum <= 0.0 {
        return [0; 4];
    }
    [
        from_linear((color[0] / alpha_sum) as f32),
        from_linear((color[1] / alpha_sum) as f32),
        from_linear((color[2] / alpha_sum) as f32),
        (alpha_sum / weight_sum * 255.0).round().clamp(0.0, 255.0) as u8,
    ]
}

fn sampler(quality: Quality) -> fn(&RgbaImage, Ratio, u32, u32) -> [u8; 4] {
    match quality {
        Quality::Fast => sample_nearest,
        Quality::Beautiful => sample_gamma,
    }
}

/// Resample all of `src` into `dst`, using `dst`'s dimensions as the target size.
/// # Errors
/// [`RenderError::Cancelled`] if `cancel` fires, leaving `dst` partially written.
pub fn full(
    quality: Quality,
    dst: &mut RgbaImage,
    src: &RgbaImage,
    cancel: &CancelToken,
) -> Result<(), RenderError> {
    if dst.width() == 0 || dst.height() == 0 || src.width() == 0 || src.height() == 0 {
        return Ok(());
    }
    let ratio = Ratio::new(src, dst);
    let sample = sampler(quality);
    let row_len = dst.width() as usize * 4;
    let dst: &mut [u8] = dst;
    dst.par_chunks_mut(row_len)
        .enumerate()
        .try_for_each(|(dy, row)| -> Result<(), RenderError> {
            cancel.check()?;
            for (dx, px) in row.chunks_exact_mut(4).enumerate() {
                px.copy_from_slice(&sample(src, ratio, dx as u32, dy as u32));
            }
            Ok(())
        })
}

/// Recompute only the pixels of `dst` that read from the given source `tiles`.
/// `dst` must previously hold a full resample of an older `src` of the same size.
/// # Errors
/// [`RenderError::Cancelled`] if `cancel` fires between tiles.
pub fn partial(
    quality: Quality,
    dst: &mut RgbaImage,
    src: &RgbaImage,
    tile_size: u32,
    tiles: &[TilePos],
    cancel: &CancelToken,
) -> Result<(), RenderError> {
    if dst.width() == 0 || dst.height() == 0 || src.width() == 0 || src.height() == 0 {
        return Ok(());
    }
    let ratio = Ratio::new(src, dst);
    let sample = sampler(quality);
    let canvas = [src.width(), src.height()];
    for tile in tiles {
        cancel.check()?;
        let [x0, y0, x1, y1] = ratio.dst_rect_of(tile.pixel_rect(tile_size, canvas));
        for dy in y0..y1 {
            for dx in x0..x1 {
                dst.put_pixel(dx, dy, image::Rgba(sample(src, ratio, dx, dy)));
            }
        }
    }
    Ok(())
}

/// Gamma-correct downscale of `src` to fit within a `max_side` square, keeping aspect ratio.
/// Never upscales.
/// # Errors
/// The downscale itself failed.
pub fn fit_within(src: &RgbaImage, max_side: u32) -> Result<RgbaImage, RenderError> {
    let longest = src.width().max(src.height()).max(1);
    let factor = (f64::from(max_side) / f64::from(longest)).min(1.0);
    let [w, h] = [
        ((f64::from(src.width()) * factor) as u32).max(1),
        ((f64::from(src.height()) * factor) as u32).max(1),
    ];
    let mut out = RgbaImage::new(w, h);
    full(Quality::Beautiful, &mut out, src, &CancelToken::never())?;
    Ok(out)
}

#[cfg(test)]
mod test {
    use super::*;

    fn checker(size: u32) -> RgbaImage {
        RgbaImage::from_fn(size, size, |x, y| {
            if (x + y) % 2 == 0 {
                image::Rgba([255, 255, 255, 255])
            } else {
                image::Rgba([0, 0, 0, 255])
            }
        })
    }

    #[test]
    fn scaled_size_rounds_and_clamps() {
        assert_eq!(scaled_size([100, 50], 0.5), [50, 25]);
        assert_eq!(scaled_size([3, 3], 0.5), [2, 2]);
        assert_eq!(scaled_size([100, 100], 0.00001), [1, 1]);
    }
    #[test]
    fn gamma_average_is_brighter_than_naive() {
        let src = checker(4);
        let mut dst = RgbaImage::new(1, 1);
        full(Quality::Beautiful, &mut dst, &src, &CancelToken::never()).unwrap();
        let px = dst.get_pixel(0, 0).0;
        // Linear-light average of black and white is ~186 in gamma 2.2, not 128.
        assert!((180..=190).contains(&px[0]), "{px:?}");
        assert_eq!(px[3], 255);
    }
    #[test]
    fn transparent_pixels_do_not_darken() {
        let src = RgbaImage::from_fn(2, 1, |x, _| {
            if x == 0 {
                image::Rgba([200, 100, 50, 255])
            } else {
                image::Rgba([0, 0, 0, 0])
            }
        });
        let mut dst = RgbaImage::new(1, 1);
        full(Quality::Beautiful, &mut dst, &src, &CancelToken::never()).unwrap();
        let px = dst.get_pixel(0, 0).0;
        assert_eq!(&px[..3], &[200, 100, 50]);
        assert!((127..=128).contains(&px[3]));
    }
    #[test]
    fn nearest_picks_source_pixels() {
        let src = RgbaImage::from_fn(4, 1, |x, _| image::Rgba([x as u8 * 10, 0, 0, 255]));
        let mut dst = RgbaImage::new(2, 1);
        full(Quality::Fast, &mut dst, &src, &CancelToken::never()).unwrap();
        assert_eq!(dst.get_pixel(0, 0).0[0], 10);
        assert_eq!(dst.get_pixel(1, 0).0[0], 30);
    }
    #[test]
    fn partial_matches_full_after_change() {
        for quality in <Quality as strum::IntoEnumIterator>::iter() {
            let mut src = checker(16);
            let mut cached = RgbaImage::new(6, 6);
            full(quality, &mut cached, &src, &CancelToken::never()).unwrap();

            // Paint over the top-left tile only.
            for y in 0..4 {
                for x in 0..4 {
                    src.put_pixel(x, y, image::Rgba([10, 200, 30, 255]));
                }
            }
            partial(
                quality,
                &mut cached,
                &src,
                4,
                &[TilePos::new(0, 0)],
                &CancelToken::never(),
            )
            .unwrap();

            let mut expected = RgbaImage::new(6, 6);
            full(quality, &mut expected, &src, &CancelToken::never()).unwrap();
            assert_eq!(cached, expected, "{}", quality.as_ref());
        }
    }
    #[test]
    fn cancelled_full_reports() {
        let cancel = CancelToken::new();
        cancel.cancel();
        let mut dst = RgbaImage::new(2, 2);
        assert_eq!(
            full(Quality::Fast, &mut dst, &checker(4), &cancel),
            Err(RenderError::Cancelled)
        );
    }
    #[test]
    fn fit_within_keeps_aspect() {
        let thumb = fit_within(&RgbaImage::new(200, 100), 48).unwrap();
        assert_eq!(thumb.dimensions(), (48, 24));
        // Small images are left alone.
        assert_eq!(
            fit_within(&RgbaImage::new(10, 5), 48).unwrap().dimensions(),
            (10, 5)
        );
    }
    #[test]
    fn fit_within_empty_frame_is_blank() {
        let thumb = fit_within(&RgbaImage::new(0, 0), 48).unwrap();
        assert_eq!(thumb.dimensions(), (1, 1));
        assert_eq!(thumb.get_pixel(0, 0).0, [0; 4]);
    }
}

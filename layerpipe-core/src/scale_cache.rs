//! # Scale cache
//!
//! Downscaled copies of a canvas, one per [`Quality`] tier. Each tier remembers the scale it was
//! produced at and keeps its own backlog of canvas tiles that changed since it was last brought
//! up to date. Changes are pushed into every backlog, but a tier only ever drains its own, so
//! refreshing Fast never hides pending work from Beautiful.

use std::sync::Arc;

use image::RgbaImage;

use crate::{
    cancel::CancelToken,
    compositor::{RenderError, TilePos},
    downscale::{self, Quality},
};

/// How a [`ScaleCache::refresh`] obtained its result.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DownscaleKind {
    /// Cached buffer was up to date.
    Cached,
    /// Cached buffer was patched, covering this many backlog tiles.
    Partial(usize),
    /// Buffer was produced from scratch.
    Full,
}

#[derive(Default, Debug)]
struct Tier {
    buffer: Option<Arc<RgbaImage>>,
    /// Scale `buffer` was produced at. Compared exactly.
    scale: Option<f32>,
    backlog: Vec<TilePos>,
}
impl Tier {
    fn discard(&mut self) {
        self.buffer = None;
        self.scale = None;
        self.backlog.clear();
    }
}

#[derive(Default, Debug)]
pub struct ScaleCache {
    // Indexed by `Quality::code`
    tiers: [Tier; 2],
}
impl ScaleCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
    fn tier(&self, quality: Quality) -> &Tier {
        &self.tiers[usize::from(quality.code())]
    }
    fn tier_mut(&mut self, quality: Quality) -> &mut Tier {
        &mut self.tiers[usize::from(quality.code())]
    }
    /// Drop every tier. Used when the canvas itself is replaced.
    pub fn clear(&mut self) {
        self.tiers.iter_mut().for_each(Tier::discard);
    }
    /// Note canvas tiles that changed. Relevant to every tier regardless of which is asked for next.
    pub fn push_dirty(&mut self, tiles: &[TilePos]) {
        if tiles.is_empty() {
            return;
        }
        for tier in &mut self.tiers {
            tier.backlog.extend_from_slice(tiles);
        }
    }
    #[must_use]
    pub fn backlog_len(&self, quality: Quality) -> usize {
        self.tier(quality).backlog.len()
    }
    #[must_use]
    pub fn cached_scale(&self, quality: Quality) -> Option<f32> {
        self.tier(quality).scale
    }
    /// Bring the `quality` tier up to date with `canvas` at `scale` and return it.
    ///
    /// A tier produced at a different scale is thrown away first, never patched.
    /// # Errors
    /// Cancellation. The tier is left as it was before the call, apart from a partially patched
    /// buffer whose backlog is still intact and will be patched again next time.
    pub fn refresh(
        &mut self,
        canvas: &RgbaImage,
        scale: f32,
        quality: Quality,
        tile_size: u32,
        cancel: &CancelToken,
    ) -> Result<(Arc<RgbaImage>, DownscaleKind), RenderError> {
        let tier = self.tier_mut(quality);
        if tier.scale != Some(scale) {
            if tier.scale.is_some() {
                log::trace!("{} tier scale {:?} -> {scale}, discarding", quality.as_ref(), tier.scale);
            }
            tier.discard();
        }

        match tier.buffer.as_mut() {
            Some(buffer) if !tier.backlog.is_empty() => {
                // Sole owner patches in place, otherwise whoever holds the old one keeps it intact.
                downscale::partial(
                    quality,
                    Arc::make_mut(buffer),
                    canvas,
                    tile_size,
                    &tier.backlog,
                    cancel,
                )?;
                let patched = tier.backlog.len();
                tier.backlog.clear();
                Ok((buffer.clone(), DownscaleKind::Partial(patched)))
            }
            Some(buffer) => Ok((buffer.clone(), DownscaleKind::Cached)),
            None => {
                let [w, h] = downscale::scaled_size(
                    [canvas.width(), canvas.height()],
                    f64::from(scale),
                );
                let mut fresh = RgbaImage::new(w, h);
                downscale::full(quality, &mut fresh, canvas, cancel)?;
                let fresh = Arc::new(fresh);
                tier.buffer = Some(fresh.clone());
                tier.scale = Some(scale);
                tier.backlog.clear();
                Ok((fresh, DownscaleKind::Full))
            }
        }
    }
}

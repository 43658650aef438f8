//! # Compositor
//!
//! The contract between the render pipeline and whatever turns a layer tree into pixels.
//! The pipeline only ever asks for two things: "draw everything into this canvas" and
//! "bring this canvas up to date, telling me which tiles you touched". Tile size is owned by
//! the compositor and treated opaquely by everything downstream.
//!
//! [`LayerCompositor`] is the built-in implementation over a flat stack of RGBA layers.

use std::sync::Arc;

use image::RgbaImage;

use crate::cancel::CancelToken;

/// Index of a tile in the compositor's grid. Tile `(x, y)` covers canvas pixels
/// `[x * tile_size, (x + 1) * tile_size)` horizontally, clipped to the canvas.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TilePos {
    pub x: u32,
    pub y: u32,
}
impl TilePos {
    #[must_use]
    pub fn new(x: u32, y: u32) -> Self {
        Self { x, y }
    }
    /// Pixel rect `[x0, y0, x1, y1)` covered by this tile, clipped to `canvas`.
    #[must_use]
    pub fn pixel_rect(self, tile_size: u32, canvas: [u32; 2]) -> [u32; 4] {
        let x0 = (self.x * tile_size).min(canvas[0]);
        let y0 = (self.y * tile_size).min(canvas[1]);
        let x1 = (x0 + tile_size).min(canvas[0]);
        let y1 = (y0 + tile_size).min(canvas[1]);
        [x0, y0, x1, y1]
    }
}

/// Display info for a single layer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LayerInfo {
    pub name: String,
    /// Visibility the layer has when freshly loaded.
    pub visible: bool,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum RenderError {
    /// A newer request superseded this one. Not a failure as far as the user is concerned.
    #[error("render cancelled")]
    Cancelled,
    #[error("canvas is {got:?}, compositor expects {expected:?}")]
    CanvasMismatch { expected: [u32; 2], got: [u32; 2] },
    #[error("visibility has {got} entries, compositor has {expected} layers")]
    LayerCount { expected: usize, got: usize },
    #[error("compositor failure: {0}")]
    Compositor(String),
}

/// Collaborator that renders a layer tree into a canvas.
pub trait Compositor: Send {
    /// Size of the full resolution canvas, `[width, height]`.
    fn canvas_size(&self) -> [u32; 2];
    fn tile_size(&self) -> u32;
    fn layers(&self) -> &[LayerInfo];
    /// Draw the whole composite into `canvas`, which is of size [`Self::canvas_size`].
    /// # Errors
    /// Cancelled, or any internal failure. The canvas content is unspecified on error.
    fn render_full(
        &mut self,
        canvas: &mut RgbaImage,
        visibility: &[bool],
        cancel: &CancelToken,
    ) -> Result<(), RenderError>;
    /// Update `canvas`, previously produced by this compositor, to reflect `visibility`.
    /// Returns every tile whose pixels may have changed since the last successful render.
    /// # Errors
    /// Cancelled, or any internal failure. The next successful diff must report any tile
    /// that the failed call touched.
    fn render_diff(
        &mut self,
        canvas: &mut RgbaImage,
        visibility: &[bool],
        cancel: &CancelToken,
    ) -> Result<Vec<TilePos>, RenderError>;
}

pub const DEFAULT_TILE_SIZE: u32 = 64;

/// A positioned raster layer.
#[derive(Clone, Debug)]
pub struct Layer {
    pub name: String,
    /// Top-left of the layer in canvas space. May be negative or hang off the canvas.
    pub offset: [i32; 2],
    pub visible: bool,
    pub pixels: Arc<RgbaImage>,
}
impl Layer {
    /// Convenience for a layer of a single flat color.
    #[must_use]
    pub fn solid(name: &str, size: [u32; 2], offset: [i32; 2], color: [u8; 4]) -> Self {
        Self {
            name: name.to_owned(),
            offset,
            visible: true,
            pixels: Arc::new(RgbaImage::from_pixel(size[0], size[1], image::Rgba(color))),
        }
    }
    /// Canvas-space bounds `[x0, y0, x1, y1)` of this layer clipped to `canvas`, or None if it
    /// does not intersect at all.
    fn clipped_bounds(&self, canvas: [u32; 2]) -> Option<[u32; 4]> {
        let clip = |start: i32, len: u32, max: u32| -> Option<(u32, u32)> {
            let start = i64::from(start);
            let end = start + i64::from(len);
            let lo = start.clamp(0, i64::from(max));
            let hi = end.clamp(0, i64::from(max));
            // Values are clamped within `max`, fits in u32.
            (lo < hi).then(|| (lo as u32, hi as u32))
        };
        let (x0, x1) = clip(self.offset[0], self.pixels.width(), canvas[0])?;
        let (y0, y1) = clip(self.offset[1], self.pixels.height(), canvas[1])?;
        Some([x0, y0, x1, y1])
    }
}

/// Tiled compositor over a bottom-to-top stack of layers, blended source-over.
pub struct LayerCompositor {
    size: [u32; 2],
    tile_size: u32,
    layers: Vec<Layer>,
    infos: Vec<LayerInfo>,
    /// Visibility the last successfully rendered canvas reflects.
    reflected: Option<Vec<bool>>,
    /// Tiles touched by an interrupted diff. Their content matches neither state.
    stale: Vec<TilePos>,
}
impl LayerCompositor {
    /// # Panics
    /// if `tile_size` is zero.
    #[must_use]
    pub fn new(size: [u32; 2], tile_size: u32, layers: Vec<Layer>) -> Self {
        assert!(tile_size > 0, "tile size must be non-zero");
        let infos = layers
            .iter()
            .map(|layer| LayerInfo {
                name: layer.name.clone(),
                visible: layer.visible,
            })
            .collect();
        Self {
            size,
            tile_size,
            layers,
            infos,
            reflected: None,
            stale: Vec::new(),
        }
    }
    fn tile_count(&self) -> [u32; 2] {
        [
            self.size[0].div_ceil(self.tile_size),
            self.size[1].div_ceil(self.tile_size),
        ]
    }
    fn all_tiles(&self) -> Vec<TilePos> {
        let [tx, ty] = self.tile_count();
        (0..ty)
            .flat_map(|y| (0..tx).map(move |x| TilePos::new(x, y)))
            .collect()
    }
    /// Tiles touching the pixel rect `[x0, y0, x1, y1)`.
    fn tiles_in(&self, rect: [u32; 4]) -> impl Iterator<Item = TilePos> {
        let ts = self.tile_size;
        let [x0, y0, x1, y1] = rect;
        let (tx0, tx1) = (x0 / ts, x1.div_ceil(ts));
        let (ty0, ty1) = (y0 / ts, y1.div_ceil(ts));
        (ty0..ty1).flat_map(move |y| (tx0..tx1).map(move |x| TilePos::new(x, y)))
    }
    fn validate(&self, canvas: &RgbaImage, visibility: &[bool]) -> Result<(), RenderError> {
        if canvas.dimensions() != (self.size[0], self.size[1]) {
            return Err(RenderError::CanvasMismatch {
                expected: self.size,
                got: [canvas.width(), canvas.height()],
            });
        }
        if visibility.len() != self.layers.len() {
            return Err(RenderError::LayerCount {
                expected: self.layers.len(),
                got: visibility.len(),
            });
        }
        Ok(())
    }
    /// Clear and recomposite a single tile.
    fn composite_tile(&self, canvas: &mut RgbaImage, tile: TilePos, visibility: &[bool]) {
        let [x0, y0, x1, y1] = tile.pixel_rect(self.tile_size, self.size);
        for y in y0..y1 {
            for x in x0..x1 {
                canvas.put_pixel(x, y, image::Rgba([0; 4]));
            }
        }
        for (layer, _) in self
            .layers
            .iter()
            .zip(visibility)
            .filter(|(_, visible)| **visible)
        {
            let Some([lx0, ly0, lx1, ly1]) = layer.clipped_bounds(self.size) else {
                continue;
            };
            let (ix0, iy0) = (x0.max(lx0), y0.max(ly0));
            let (ix1, iy1) = (x1.min(lx1), y1.min(ly1));
            for y in iy0..iy1 {
                for x in ix0..ix1 {
                    // In bounds - intersection is within the layer's clipped extent.
                    let sx = (i64::from(x) - i64::from(layer.offset[0])) as u32;
                    let sy = (i64::from(y) - i64::from(layer.offset[1])) as u32;
                    let src = layer.pixels.get_pixel(sx, sy).0;
                    let dst = canvas.get_pixel_mut(x, y);
                    dst.0 = blend_over(src, dst.0);
                }
            }
        }
    }
    fn composite_tiles(
        &self,
        canvas: &mut RgbaImage,
        tiles: &[TilePos],
        visibility: &[bool],
        cancel: &CancelToken,
    ) -> Result<(), RenderError> {
        for &tile in tiles {
            cancel.check()?;
            self.composite_tile(canvas, tile, visibility);
        }
        Ok(())
    }
}

/// Non-premultiplied source-over.
fn blend_over(src: [u8; 4], dst: [u8; 4]) -> [u8; 4] {
    let sa = f32::from(src[3]) / 255.0;
    if sa >= 1.0 {
        return src;
    }
    if sa <= 0.0 {
        return dst;
    }
    let da = f32::from(dst[3]) / 255.0;
    let out_a = sa + da * (1.0 - sa);
    let mut out = [0u8; 4];
    for c in 0..3 {
        let v = (f32::from(src[c]) * sa + f32::from(dst[c]) * da * (1.0 - sa)) / out_a;
        out[c] = v.round().clamp(0.0, 255.0) as u8;
    }
    out[3] = (out_a * 255.0).round().clamp(0.0, 255.0) as u8;
    out
}

impl Compositor for LayerCompositor {
    fn canvas_size(&self) -> [u32; 2] {
        self.size
    }
    fn tile_size(&self) -> u32 {
        self.tile_size
    }
    fn layers(&self) -> &[LayerInfo] {
        &self.infos
    }
    fn render_full(
        &mut self,
        canvas: &mut RgbaImage,
        visibility: &[bool],
        cancel: &CancelToken,
    ) -> Result<(), RenderError> {
        self.validate(canvas, visibility)?;
        // Forget what the canvas held until this pass completes.
        self.reflected = None;
        self.stale.clear();
        let tiles = self.all_tiles();
        self.composite_tiles(canvas, &tiles, visibility, cancel)?;
        self.reflected = Some(visibility.to_vec());
        Ok(())
    }
    fn render_diff(
        &mut self,
        canvas: &mut RgbaImage,
        visibility: &[bool],
        cancel: &CancelToken,
    ) -> Result<Vec<TilePos>, RenderError> {
        self.validate(canvas, visibility)?;
        let mut dirty = match &self.reflected {
            // Nothing trustworthy on the canvas, everything is dirty.
            None => self.all_tiles(),
            Some(reflected) => {
                let mut dirty: Vec<TilePos> = reflected
                    .iter()
                    .zip(visibility)
                    .zip(&self.layers)
                    .filter(|((old, new), _)| old != new)
                    .filter_map(|(_, layer)| layer.clipped_bounds(self.size))
                    .flat_map(|rect| self.tiles_in(rect))
                    .chain(self.stale.iter().copied())
                    .collect();
                dirty.sort_unstable();
                dirty.dedup();
                dirty
            }
        };
        if dirty.is_empty() {
            return Ok(dirty);
        }
        log::trace!("compositing {} dirty tiles", dirty.len());
        self.stale.clone_from(&dirty);
        self.composite_tiles(canvas, &dirty, visibility, cancel)?;
        self.stale.clear();
        self.reflected = Some(visibility.to_vec());
        dirty.shrink_to_fit();
        Ok(dirty)
    }
}

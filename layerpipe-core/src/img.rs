//! # Image
//!
//! One opened, composited image. Owns the full resolution canvas, the scale cache derived from
//! it, and the view properties a host sets on it (scale, quality, offset, layer state).
//!
//! Rendering is incremental: the first render draws everything, every later one asks the
//! compositor for a diff and forwards the dirty tiles to the scale cache.

use std::{sync::Arc, time::Instant};

use image::RgbaImage;

use crate::{
    cancel::CancelToken,
    compositor::{Compositor, LayerInfo, RenderError},
    downscale::{self, Quality},
    layers::{Flip, LayerState, StateError},
    project::ProjectState,
    result_cache::CacheKey,
    scale_cache::{DownscaleKind, ScaleCache},
};

/// Smallest scale a host may request.
pub const MIN_SCALE: f32 = 0.00001;

/// Host-driven property changes. `None` fields are left alone.
#[derive(Clone, Debug, Default)]
pub struct PropsUpdate {
    /// Layer commands, applied on top of the initial layer state. Empty resets to it.
    pub layer: Option<String>,
    pub scale: Option<f32>,
    pub quality: Option<Quality>,
    pub offset_x: Option<i32>,
    pub offset_y: Option<i32>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PropsOutcome {
    /// Whether the image has changed since it was last rendered.
    pub modified: bool,
    /// Host cache key of the image at its scaled size.
    pub cache_key: u64,
    pub width: u32,
    pub height: u32,
    /// Layer state string after the update.
    pub state: String,
}

/// Shared last-access time of an [`Image`]. Lives outside whatever lock guards the image, so
/// marking it used never waits on a render.
#[derive(Clone, Debug)]
pub struct Toucher(Arc<parking_lot::Mutex<Instant>>);
impl Toucher {
    fn new() -> Self {
        Self(Arc::new(parking_lot::Mutex::new(Instant::now())))
    }
    pub fn touch(&self) {
        *self.0.lock() = Instant::now();
    }
    #[must_use]
    pub fn last_access(&self) -> Instant {
        *self.0.lock()
    }
}

pub struct Image {
    path: String,
    compositor: Box<dyn Compositor>,
    layers: LayerState,
    initial_layer_state: String,
    canvas: Option<Arc<RgbaImage>>,
    scale_cache: ScaleCache,
    last_downscale: Option<DownscaleKind>,
    /// Set by any change that alters rendered output, cleared by rendering.
    pub modified: bool,
    pub scale: f32,
    pub quality: Quality,
    pub offset: [i32; 2],
    /// Opaque per-document data carried through project save/load.
    pub pfv: serde_json::Value,
    toucher: Toucher,
}
impl std::fmt::Debug for Image {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Image")
            .field("path", &self.path)
            .field("layers", &self.layers)
            .field("scale", &self.scale)
            .field("quality", &self.quality)
            .field("offset", &self.offset)
            .field("modified", &self.modified)
            .finish_non_exhaustive()
    }
}
impl Image {
    #[must_use]
    pub fn new(path: impl Into<String>, compositor: Box<dyn Compositor>) -> Self {
        let layers = LayerState::new(compositor.layers());
        Self {
            path: path.into(),
            initial_layer_state: layers.serialize(),
            layers,
            compositor,
            canvas: None,
            scale_cache: ScaleCache::new(),
            last_downscale: None,
            modified: false,
            scale: 1.0,
            quality: Quality::default(),
            offset: [0, 0],
            pfv: serde_json::Value::Null,
            toucher: Toucher::new(),
        }
    }
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }
    #[must_use]
    pub fn layers(&self) -> &[LayerInfo] {
        self.compositor.layers()
    }
    #[must_use]
    pub fn layer_state(&self) -> &LayerState {
        &self.layers
    }
    #[must_use]
    pub fn canvas_size(&self) -> [u32; 2] {
        self.compositor.canvas_size()
    }
    #[must_use]
    pub fn scale_cache(&self) -> &ScaleCache {
        &self.scale_cache
    }
    /// How the last scaled render got its pixels, or None if it was at full scale.
    #[must_use]
    pub fn last_downscale(&self) -> Option<DownscaleKind> {
        self.last_downscale
    }
    pub fn touch(&self) {
        self.toucher.touch();
    }
    #[must_use]
    pub fn last_access(&self) -> Instant {
        self.toucher.last_access()
    }
    /// Handle to this image's last-access time, usable without access to the image itself.
    #[must_use]
    pub fn toucher(&self) -> Toucher {
        self.toucher.clone()
    }
    #[must_use]
    pub fn flip(&self) -> Flip {
        self.layers.flip
    }
    pub fn set_flip_x(&mut self, flip: bool) -> bool {
        let changed = self.layers.set_flip_axis(Flip::X, flip);
        self.modified |= changed;
        changed
    }
    pub fn set_flip_y(&mut self, flip: bool) -> bool {
        let changed = self.layers.set_flip_axis(Flip::Y, flip);
        self.modified |= changed;
        changed
    }
    /// Set a layer's visibility, returning whether it changed.
    /// # Errors
    /// Index out of range.
    pub fn set_visible(&mut self, index: usize, visible: bool) -> Result<bool, StateError> {
        let changed = self.layers.set_visible(index, visible)?;
        self.modified |= changed;
        Ok(changed)
    }
    /// Canvas size at the current scale, rounded, at least one pixel each way.
    #[must_use]
    pub fn scaled_canvas_rect(&self) -> [u32; 2] {
        downscale::scaled_size(self.canvas_size(), f64::from(self.scale))
    }
    /// Render at the image's own scale and quality, flipped.
    /// # Errors
    /// See [`Self::render_with_scale`].
    pub fn render(&mut self, cancel: &CancelToken) -> Result<Arc<RgbaImage>, RenderError> {
        self.render_with_scale(self.scale, self.quality, true, cancel)
    }
    /// Bring the canvas up to date and produce it at `scale`.
    ///
    /// With `apply_flip` false the result is unflipped, for callers that fold the flip into a
    /// transform of their own. Flipped buffers are never cached.
    /// # Errors
    /// Compositor failure or cancellation. A failed first render leaves no canvas behind, a
    /// failed diff leaves the dirty tiles for the compositor to report again.
    pub fn render_with_scale(
        &mut self,
        scale: f32,
        quality: Quality,
        apply_flip: bool,
        cancel: &CancelToken,
    ) -> Result<Arc<RgbaImage>, RenderError> {
        let visibility = self.layers.visibility();
        let canvas = match self.canvas.as_mut() {
            None => {
                let [w, h] = self.compositor.canvas_size();
                let mut fresh = RgbaImage::new(w, h);
                self.compositor.render_full(&mut fresh, visibility, cancel)?;
                self.scale_cache.clear();
                let fresh = Arc::new(fresh);
                self.canvas = Some(fresh.clone());
                fresh
            }
            Some(canvas) => {
                let dirty =
                    self.compositor
                        .render_diff(Arc::make_mut(canvas), visibility, cancel)?;
                if !dirty.is_empty() {
                    log::trace!("{}: {} dirty tiles", self.path, dirty.len());
                }
                self.scale_cache.push_dirty(&dirty);
                canvas.clone()
            }
        };
        let out = if scale < 1.0 {
            let (scaled, kind) = self.scale_cache.refresh(
                &canvas,
                scale,
                quality,
                self.compositor.tile_size(),
                cancel,
            )?;
            self.last_downscale = Some(kind);
            scaled
        } else {
            self.last_downscale = None;
            canvas
        };

        // Only once a frame is certain, a cancelled downscale leaves the image dirty.
        self.modified = false;

        let flip = self.layers.flip;
        if !apply_flip || flip.is_empty() {
            return Ok(out);
        }
        let mut flipped = (*out).clone();
        if flip.contains(Flip::X) {
            image::imageops::flip_horizontal_in_place(&mut flipped);
        }
        if flip.contains(Flip::Y) {
            image::imageops::flip_vertical_in_place(&mut flipped);
        }
        Ok(Arc::new(flipped))
    }
    /// Layer state string, see [`LayerState::serialize`].
    #[must_use]
    pub fn serialize(&self) -> String {
        self.layers.serialize()
    }
    /// Apply layer commands. Returns whether anything changed.
    /// # Errors
    /// Malformed commands, in which case nothing is applied.
    pub fn deserialize(&mut self, state: &str) -> Result<bool, StateError> {
        let changed = self.layers.deserialize(state)?;
        self.modified |= changed;
        Ok(changed)
    }
    #[must_use]
    pub fn initial_layer_state(&self) -> &str {
        &self.initial_layer_state
    }
    #[must_use]
    pub fn cache_key(&self, width: u32, height: u32) -> CacheKey {
        CacheKey {
            path: self.path.clone(),
            width,
            height,
            offset: self.offset,
            scale_bits: self.scale.to_bits(),
            quality: self.quality,
            state: self.serialize(),
        }
    }
    /// Apply a host property update.
    /// # Errors
    /// Malformed layer commands. Nothing is applied in that case.
    pub fn set_props(&mut self, update: PropsUpdate) -> Result<PropsOutcome, StateError> {
        let mut modified = self.modified;
        if let Some(layer) = update.layer {
            let commands = if layer.is_empty() {
                self.initial_layer_state.clone()
            } else {
                format!("{} {layer}", self.initial_layer_state)
            };
            modified |= self.layers.deserialize(&commands)?;
        }
        if let Some(scale) = update.scale {
            let scale = scale.clamp(MIN_SCALE, 1.0);
            if scale != self.scale {
                self.scale = scale;
                modified = true;
            }
        }
        if let Some(quality) = update.quality {
            if quality != self.quality {
                self.quality = quality;
                modified = true;
            }
        }
        for (axis, value) in [update.offset_x, update.offset_y].into_iter().enumerate() {
            if let Some(value) = value {
                if value != self.offset[axis] {
                    self.offset[axis] = value;
                    modified = true;
                }
            }
        }
        self.modified = modified;

        let [width, height] = self.scaled_canvas_rect();
        Ok(PropsOutcome {
            modified,
            cache_key: self.cache_key(width, height).hash64(),
            width,
            height,
            state: self.serialize(),
        })
    }
    /// Persisted form, without view state which belongs to whoever displays the image.
    #[must_use]
    pub fn serialize_project(&self) -> ProjectState {
        ProjectState {
            version: 1,
            file_path: self.path.clone(),
            layer: self.layers.to_map(self.compositor.layers()),
            pfv: self.pfv.clone(),
            view_state: None,
        }
    }
    /// Restore from persisted form. Returns non-fatal warnings, such as layers that no longer
    /// exist in the source.
    pub fn deserialize_project(&mut self, state: &ProjectState) -> Vec<String> {
        let before = self.layers.clone();
        let warnings = self
            .layers
            .apply_map(self.compositor.layers(), &state.layer);
        self.modified |= before != self.layers;
        self.pfv = state.pfv.clone();
        warnings
    }
}

//! # Host API
//!
//! What the host application calls into. Images are opened on first use, keyed by the host's id
//! for them along with their path, and frames come back as BGRA bytes through the shared
//! [`ResultCache`]. Images and cached frames nobody asked for within the TTL are dropped by
//! [`Host::gc`], which [`Host::spawn_gc`] runs on a timer.

use std::{
    sync::{Arc, Weak},
    time::{Duration, Instant},
};

use layerpipe_core::{
    compositor::RenderError,
    img::{PropsOutcome, PropsUpdate, Toucher},
    layers::StateError,
    result_cache::{self, ResultCache, SweepStats},
    source::{ImageSource, LoadError},
    CancelToken,
};

use crate::editing::{Editing, ImageHandle};

#[derive(thiserror::Error, Debug)]
pub enum HostError {
    #[error(transparent)]
    Load(#[from] LoadError),
    #[error(transparent)]
    Render(#[from] RenderError),
    #[error(transparent)]
    State(#[from] StateError),
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct GcStats {
    pub cache: SweepStats,
    pub images_dropped: usize,
    pub images_remaining: usize,
}

type ImageKey = (i32, String);

/// An open image, along with its access time so that can be read without waiting on a render.
struct Stored {
    image: ImageHandle,
    toucher: Toucher,
}

pub struct Host {
    source: Arc<dyn ImageSource>,
    images: parking_lot::Mutex<hashbrown::HashMap<ImageKey, Stored>>,
    cache: Arc<parking_lot::Mutex<ResultCache>>,
    /// Told about tagged state changes, when present.
    editing: Option<Editing>,
}
impl Host {
    #[must_use]
    pub fn new(
        source: Arc<dyn ImageSource>,
        cache: Arc<parking_lot::Mutex<ResultCache>>,
        editing: Option<Editing>,
    ) -> Self {
        Self {
            source,
            images: parking_lot::Mutex::default(),
            cache,
            editing,
        }
    }
    /// The image for `id` and `path`, opening it if needed.
    fn image(&self, id: i32, path: &str) -> Result<ImageHandle, LoadError> {
        let key = (id, path.to_owned());
        if let Some(stored) = self.images.lock().get(&key) {
            stored.toucher.touch();
            return Ok(stored.image.clone());
        }
        // Load without holding the map, it may take a while.
        let image = self.source.load(path)?;
        let toucher = image.toucher();
        let stored = Stored {
            image: Arc::new(parking_lot::Mutex::new(image)),
            toucher,
        };
        Ok(self.images.lock().entry(key).or_insert(stored).image.clone())
    }
    /// BGRA frame of `width` x `height`.
    /// # Errors
    /// The image could not be opened or rendered.
    pub fn draw(
        &self,
        id: i32,
        path: &str,
        width: u32,
        height: u32,
    ) -> Result<Arc<[u8]>, HostError> {
        let image = self.image(id, path)?;
        let mut image = image.lock();
        Ok(result_cache::get_or_render_shared(
            &self.cache,
            &mut image,
            width,
            height,
            &CancelToken::never(),
        )?)
    }
    /// Apply a property update. With a non-zero `tag`, the resulting layer state is forwarded to
    /// the editing actor, opening the image there if it isn't open yet.
    /// # Errors
    /// The image could not be opened, or the layer commands were malformed.
    pub fn set_props(
        &self,
        id: i32,
        path: &str,
        tag: i32,
        update: PropsUpdate,
    ) -> Result<PropsOutcome, HostError> {
        let image = self.image(id, path)?;
        let outcome = image.lock().set_props(update)?;
        if tag != 0 {
            self.forward_tag_state(path, tag, &outcome.state);
        }
        Ok(outcome)
    }
    fn forward_tag_state(&self, path: &str, tag: i32, state: &str) {
        let Some(editing) = self.editing.clone() else {
            return;
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            log::warn!("host: no runtime to forward tag {tag} state on");
            return;
        };
        let (path, state) = (path.to_owned(), state.to_owned());
        runtime.spawn(async move {
            match editing.update_tag_state(&path, tag, &state).await {
                Ok(true) => log::debug!("host: opened {path:?} for tag {tag}"),
                Ok(false) => (),
                Err(err) => log::warn!("host: forwarding tag {tag} state failed: {err}"),
            }
        });
    }
    /// Newline separated full names of the image's layers, bottom first.
    /// # Errors
    /// The image could not be opened.
    pub fn layer_names(&self, id: i32, path: &str) -> Result<String, HostError> {
        let image = self.image(id, path)?;
        let image = image.lock();
        let names: Vec<&str> = image.layers().iter().map(|layer| layer.name.as_str()).collect();
        Ok(names.join("\n"))
    }
    pub fn gc(&self) -> GcStats {
        self.gc_at(Instant::now())
    }
    /// Sweep the result cache and drop images idle for longer than its TTL, as of `now`.
    pub fn gc_at(&self, now: Instant) -> GcStats {
        let (cache, ttl) = {
            let mut cache = self.cache.lock();
            (cache.sweep_at(now), cache.ttl())
        };
        let mut images = self.images.lock();
        let before = images.len();
        images.retain(|(id, path), stored| {
            let keep = now.saturating_duration_since(stored.toucher.last_access()) <= ttl;
            if !keep {
                log::debug!("host: closing idle {path:?} ({id})");
            }
            keep
        });
        GcStats {
            cache,
            images_dropped: before - images.len(),
            images_remaining: images.len(),
        }
    }
    /// Run [`Self::gc`] every `interval` until the host is dropped.
    pub fn spawn_gc(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let host: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // First tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(host) = host.upgrade() else {
                    return;
                };
                let stats = host.gc();
                if stats.cache.evicted > 0 || stats.images_dropped > 0 {
                    log::info!(
                        "gc freed {} of results, closed {} images, {} still open",
                        human_bytes::human_bytes(stats.cache.freed_bytes as f64),
                        stats.images_dropped,
                        stats.images_remaining
                    );
                }
            }
        })
    }
}

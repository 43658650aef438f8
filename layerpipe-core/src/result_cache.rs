//! # Result cache
//!
//! Final, host-ready pixel bytes keyed by everything that determines them. There is no explicit
//! invalidation: any change to the image's observable state changes its serialized state string
//! and thus the key. Entries are dropped only by [`ResultCache::sweep`] once idle for the TTL.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use image::RgbaImage;

use crate::{cancel::CancelToken, compositor::RenderError, downscale::Quality, img::Image};

pub const DEFAULT_TTL: Duration = Duration::from_secs(60);

/// Every input of a host render.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub path: String,
    pub width: u32,
    pub height: u32,
    pub offset: [i32; 2],
    /// `f32::to_bits` of the scale, hashed and compared bitwise.
    pub scale_bits: u32,
    pub quality: Quality,
    pub state: String,
}
impl CacheKey {
    /// 64-bit digest handed to the host, stable across runs and platforms.
    #[must_use]
    pub fn hash64(&self) -> u64 {
        let mut hasher = blake3::Hasher::new();
        hasher.update(self.path.as_bytes());
        hasher.update(&self.width.to_le_bytes());
        hasher.update(&self.height.to_le_bytes());
        hasher.update(&self.offset[0].to_le_bytes());
        hasher.update(&self.offset[1].to_le_bytes());
        hasher.update(&self.scale_bits.to_le_bytes());
        hasher.update(&i32::from(self.quality.code()).to_le_bytes());
        hasher.update(self.state.as_bytes());
        let digest = hasher.finalize();
        let mut head = [0; 8];
        head.copy_from_slice(&digest.as_bytes()[..8]);
        u64::from_le_bytes(head)
    }
}

struct Entry {
    bytes: Arc<[u8]>,
    last_access: Instant,
}

/// Result of a [`ResultCache::sweep`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SweepStats {
    pub evicted: usize,
    pub freed_bytes: usize,
    pub remaining: usize,
}

pub struct ResultCache {
    entries: hashbrown::HashMap<CacheKey, Entry>,
    ttl: Duration,
}
impl Default for ResultCache {
    fn default() -> Self {
        Self::new(DEFAULT_TTL)
    }
}
impl ResultCache {
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: hashbrown::HashMap::new(),
            ttl,
        }
    }
    #[must_use]
    pub fn ttl(&self) -> Duration {
        self.ttl
    }
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
    #[must_use]
    pub fn contains(&self, key: &CacheKey) -> bool {
        self.entries.contains_key(key)
    }
    /// Bytes held by all entries.
    #[must_use]
    pub fn total_bytes(&self) -> usize {
        self.entries.values().map(|entry| entry.bytes.len()).sum()
    }
    /// Cached bytes for `key`, refreshing the entry's idle time.
    ///
    /// A hit clears the image's `modified` flag, the cached bytes already reflect its state.
    pub fn lookup(&mut self, image: &mut Image, key: &CacheKey) -> Option<Arc<[u8]>> {
        let entry = self.entries.get_mut(key)?;
        entry.last_access = Instant::now();
        image.modified = false;
        log::debug!("{}: cached", key.path);
        Some(entry.bytes.clone())
    }
    /// Store freshly rendered bytes, replacing any entry a concurrent render stored first.
    pub fn insert(&mut self, key: CacheKey, bytes: Arc<[u8]>) {
        self.entries.insert(
            key,
            Entry {
                bytes,
                last_access: Instant::now(),
            },
        );
    }
    /// BGRA bytes of `image` rendered into a `width` x `height` frame, from cache if possible.
    /// # Errors
    /// Rendering failures on a miss. Nothing is stored in that case.
    pub fn get_or_render(
        &mut self,
        image: &mut Image,
        width: u32,
        height: u32,
        cancel: &CancelToken,
    ) -> Result<Arc<[u8]>, RenderError> {
        let key = image.cache_key(width, height);
        if let Some(bytes) = self.lookup(image, &key) {
            return Ok(bytes);
        }
        let bytes = render_frame(image, width, height, cancel)?;
        self.insert(key, bytes.clone());
        Ok(bytes)
    }
    /// Evict entries idle for longer than the TTL, as of now.
    pub fn sweep(&mut self) -> SweepStats {
        self.sweep_at(Instant::now())
    }
    /// Evict entries idle for longer than the TTL as of `now`.
    pub fn sweep_at(&mut self, now: Instant) -> SweepStats {
        let ttl = self.ttl;
        let mut stats = SweepStats::default();
        self.entries.retain(|_, entry| {
            let keep = now.saturating_duration_since(entry.last_access) <= ttl;
            if !keep {
                stats.evicted += 1;
                stats.freed_bytes += entry.bytes.len();
            }
            keep
        });
        stats.remaining = self.entries.len();
        if stats.evicted > 0 {
            log::debug!(
                "result cache swept {} entries, freed {}, {} left",
                stats.evicted,
                human_bytes::human_bytes(stats.freed_bytes as f64),
                stats.remaining
            );
        }
        stats
    }
}

/// As [`ResultCache::get_or_render`], but the cache is only locked to look up and to store.
/// Rendering happens with just `image` borrowed, so other images can be served meanwhile.
/// # Errors
/// Rendering failures on a miss. Nothing is stored in that case.
pub fn get_or_render_shared(
    cache: &parking_lot::Mutex<ResultCache>,
    image: &mut Image,
    width: u32,
    height: u32,
    cancel: &CancelToken,
) -> Result<Arc<[u8]>, RenderError> {
    let key = image.cache_key(width, height);
    if let Some(bytes) = cache.lock().lookup(image, &key) {
        return Ok(bytes);
    }
    let bytes = render_frame(image, width, height, cancel)?;
    cache.lock().insert(key, bytes.clone());
    Ok(bytes)
}

/// Render `image` and place it in a `width` x `height` BGRA frame at its offset.
/// # Errors
/// The render failed or was cancelled.
pub fn render_frame(
    image: &mut Image,
    width: u32,
    height: u32,
    cancel: &CancelToken,
) -> Result<Arc<[u8]>, RenderError> {
    let start = Instant::now();
    let rendered = image.render(cancel)?;
    let mut frame = RgbaImage::new(width, height);
    let scale = image.scale;
    let place = |offset: i32| -> i64 { -i64::from((-(offset as f32) * scale) as i32) };
    image::imageops::replace(
        &mut frame,
        &*rendered,
        place(image.offset[0]),
        place(image.offset[1]),
    );
    for px in frame.pixels_mut() {
        px.0.swap(0, 2);
    }
    let bytes: Arc<[u8]> = frame.into_raw().into();
    log::debug!(
        "{}: render {}ms, {}",
        image.path(),
        start.elapsed().as_millis(),
        human_bytes::human_bytes(bytes.len() as f64)
    );
    Ok(bytes)
}

//! Global singletons.

pub mod settings;

use std::sync::Arc;

use layerpipe_core::result_cache::ResultCache;

pub use settings::Settings;

#[must_use]
pub fn settings() -> &'static Settings {
    Settings::get()
}

/// Get the shared global result cache. Lives as long as the process, with entries aging out
/// after the configured TTL.
pub fn result_cache() -> &'static Arc<parking_lot::Mutex<ResultCache>> {
    static CACHE: std::sync::OnceLock<Arc<parking_lot::Mutex<ResultCache>>> =
        std::sync::OnceLock::new();
    CACHE.get_or_init(|| {
        Arc::new(parking_lot::Mutex::new(ResultCache::new(
            settings().cache_ttl(),
        )))
    })
}

use std::time::Duration;

const DOCUMENTATION: &str = r#"# layerpipe settings. You may edit this file, but be aware that formatting and comments will not
# be preserved. Missing keys take their default value.

# thumbnail_size      - Edge of the square thumbnails are fit into, in pixels.
# thumbnail_delay_ms  - Quiet time after the last change before a thumbnail is regenerated.
# capacity            - Maximum number of images open for editing at once.
# cache_ttl_secs      - Rendered results idle for longer than this are dropped.
# gc_interval_secs    - How often idle results and images are swept.
# log_level           - One of "off", "error", "warn", "info", "debug", "trace".

"#;

#[must_use]
pub fn preferences_dir() -> Option<std::path::PathBuf> {
    let mut base_dir = dirs::preference_dir()?;
    base_dir.push(env!("CARGO_PKG_NAME"));
    Some(base_dir)
}

#[derive(serde::Serialize, serde::Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct Settings {
    #[serde(skip)]
    failed_to_load: bool,
    pub thumbnail_size: u32,
    pub thumbnail_delay_ms: u64,
    pub capacity: usize,
    pub cache_ttl_secs: u64,
    pub gc_interval_secs: u64,
    pub log_level: String,
}
impl Default for Settings {
    fn default() -> Self {
        Self {
            failed_to_load: false,
            thumbnail_size: 48,
            thumbnail_delay_ms: 500,
            capacity: 144,
            cache_ttl_secs: 60,
            gc_interval_secs: 60,
            log_level: "debug".to_owned(),
        }
    }
}
impl Settings {
    const FILENAME: &'static str = "settings.toml";
    /// Shared global settings, loaded from user preferences.
    /// (Or defaulted, if unavailable for some reason)
    #[must_use]
    pub fn get() -> &'static Self {
        static GLOBAL_SETTINGS: std::sync::OnceLock<Settings> = std::sync::OnceLock::new();

        GLOBAL_SETTINGS.get_or_init(|| {
            let mut dir = preferences_dir();
            match dir.as_mut() {
                None => Self::no_path(),
                Some(dir) => {
                    dir.push(Self::FILENAME);
                    Self::load_or_default(dir)
                }
            }
        })
    }
    #[must_use]
    fn no_path() -> Self {
        Self {
            failed_to_load: true,
            ..Self::default()
        }
    }
    #[must_use]
    fn load_or_default(path: &std::path::Path) -> Self {
        let settings: anyhow::Result<Settings> = try_block::try_block! {
            let string = std::fs::read_to_string(path)?;
            let settings: Settings = toml::from_str(&string)?;
            Ok(settings)
        };
        settings.unwrap_or_else(|_| Self::no_path())
    }
    /// Return true if loading user's settings failed, in which case defaults are in use.
    /// Logging may not be up while settings are first read, so reporting this is left to the caller.
    #[must_use]
    pub fn did_fail_to_load(&self) -> bool {
        self.failed_to_load
    }
    pub fn save(&self) -> anyhow::Result<()> {
        let mut preferences =
            preferences_dir().ok_or_else(|| anyhow::anyhow!("No preferences dir found"))?;
        // Ignore errors (could already exist). Any real errors will be emitted by file access below.
        let _ = std::fs::DirBuilder::new().create(&preferences);

        preferences.push(Self::FILENAME);
        let mut string = toml::ser::to_string_pretty(self)?;
        string = DOCUMENTATION.to_owned() + &string;
        std::fs::write(preferences, string)?;
        Ok(())
    }
    #[must_use]
    pub fn thumbnail_delay(&self) -> Duration {
        Duration::from_millis(self.thumbnail_delay_ms)
    }
    #[must_use]
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }
    /// Zero would spin the collector, clamped to a second.
    #[must_use]
    pub fn gc_interval(&self) -> Duration {
        Duration::from_secs(self.gc_interval_secs.max(1))
    }
    /// Unrecognized levels fall back to debug.
    #[must_use]
    pub fn log_level_filter(&self) -> log::LevelFilter {
        self.log_level.parse().unwrap_or(log::LevelFilter::Debug)
    }
}

#[cfg(test)]
mod test {
    use super::Settings;

    #[test]
    fn partial_file_fills_defaults() {
        let settings: Settings = toml::from_str("capacity = 10\nlog_level = \"warn\"").unwrap();
        assert_eq!(settings.capacity, 10);
        assert_eq!(settings.thumbnail_size, 48);
        assert_eq!(settings.log_level_filter(), log::LevelFilter::Warn);
        assert!(!settings.did_fail_to_load());
    }
    #[test]
    fn roundtrips_through_toml() {
        let settings = Settings {
            gc_interval_secs: 0,
            log_level: "loud".to_owned(),
            ..Settings::default()
        };
        let text = toml::ser::to_string_pretty(&settings).unwrap();
        let back: Settings = toml::from_str(&text).unwrap();
        assert_eq!(back, settings);
        assert_eq!(back.gc_interval().as_secs(), 1);
        assert_eq!(back.log_level_filter(), log::LevelFilter::Debug);
    }
    #[test]
    fn unreadable_file_defaults() {
        let settings = Settings::load_or_default(std::path::Path::new("/nonexistent/settings.toml"));
        assert!(settings.did_fail_to_load());
        assert_eq!(settings.cache_ttl().as_secs(), 60);
    }
}

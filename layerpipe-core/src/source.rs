//! # Image sources
//!
//! Where [`Image`]s come from. Loading is the only operation, everything after that happens on
//! the image itself.
//!
//! [`ManifestSource`] reads a small JSON description of a layer stack, with each layer stored as a
//! PNG next to it:
//!
//! ```json
//! {"width": 640, "height": 480, "tileSize": 64, "layers": [
//!     {"name": "background", "path": "bg.png"},
//!     {"name": "character/face", "path": "face.png", "x": 120, "y": 40, "visible": false}
//! ]}
//! ```

use std::path::{Path, PathBuf};

use rayon::iter::{IntoParallelRefIterator, ParallelIterator};

use crate::{
    compositor::{Layer, LayerCompositor, DEFAULT_TILE_SIZE},
    img::Image,
};

#[derive(thiserror::Error, Debug)]
pub enum LoadError {
    #[error("no image at {0:?}")]
    NotFound(String),
    #[error("reading {path:?} failed: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("manifest {path:?} is malformed: {source}")]
    Manifest {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("layer {path:?} could not be decoded: {source}")]
    Decode {
        path: PathBuf,
        source: image::ImageError,
    },
    #[error("canvas of {0:?} is empty")]
    EmptyCanvas(String),
}

pub trait ImageSource: Send + Sync {
    /// Open a fresh, unrendered image.
    /// # Errors
    /// The path doesn't name a loadable image.
    fn load(&self, path: &str) -> Result<Image, LoadError>;
}

#[derive(serde::Deserialize)]
#[serde(rename_all = "camelCase")]
struct Manifest {
    width: u32,
    height: u32,
    tile_size: Option<u32>,
    layers: Vec<ManifestLayer>,
}

#[derive(serde::Deserialize)]
struct ManifestLayer {
    name: String,
    path: PathBuf,
    #[serde(default)]
    x: i32,
    #[serde(default)]
    y: i32,
    #[serde(default = "default_visible")]
    visible: bool,
}

fn default_visible() -> bool {
    true
}

/// Loads JSON layer manifests from the filesystem.
#[derive(Clone, Copy, Debug, Default)]
pub struct ManifestSource;

impl ManifestSource {
    fn read_manifest(path: &Path) -> Result<Manifest, LoadError> {
        let text = std::fs::read_to_string(path).map_err(|source| {
            if source.kind() == std::io::ErrorKind::NotFound {
                LoadError::NotFound(path.display().to_string())
            } else {
                LoadError::Io {
                    path: path.to_owned(),
                    source,
                }
            }
        })?;
        serde_json::from_str(&text).map_err(|source| LoadError::Manifest {
            path: path.to_owned(),
            source,
        })
    }
}

impl ImageSource for ManifestSource {
    fn load(&self, path: &str) -> Result<Image, LoadError> {
        let manifest_path = Path::new(path);
        let manifest = Self::read_manifest(manifest_path)?;
        if manifest.width == 0 || manifest.height == 0 {
            return Err(LoadError::EmptyCanvas(path.to_owned()));
        }
        let base = manifest_path.parent().unwrap_or_else(|| Path::new(""));

        let layers = manifest
            .layers
            .par_iter()
            .map(|layer| {
                let layer_path = base.join(&layer.path);
                let pixels = image::open(&layer_path)
                    .map_err(|source| LoadError::Decode {
                        path: layer_path.clone(),
                        source,
                    })?
                    .into_rgba8();
                Ok(Layer {
                    name: layer.name.clone(),
                    offset: [layer.x, layer.y],
                    visible: layer.visible,
                    pixels: pixels.into(),
                })
            })
            .collect::<Result<Vec<_>, LoadError>>()?;

        let bytes: u64 = layers
            .iter()
            .map(|layer| layer.pixels.as_raw().len() as u64)
            .sum();
        log::info!(
            "loaded {path:?}, {}x{} with {} layers ({})",
            manifest.width,
            manifest.height,
            layers.len(),
            human_bytes::human_bytes(bytes as f64)
        );

        let tile_size = manifest.tile_size.unwrap_or(DEFAULT_TILE_SIZE).max(1);
        let compositor = LayerCompositor::new([manifest.width, manifest.height], tile_size, layers);
        Ok(Image::new(path, Box::new(compositor)))
    }
}

#[derive(Clone)]
struct MemoryEntry {
    size: [u32; 2],
    tile_size: u32,
    layers: Vec<Layer>,
}

/// Prebuilt layer stacks, keyed by path. Layer pixels are shared between loads.
#[derive(Default)]
pub struct MemorySource {
    entries: parking_lot::RwLock<hashbrown::HashMap<String, MemoryEntry>>,
}
impl MemorySource {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
    /// Register or replace the stack at `path`.
    pub fn insert(&self, path: impl Into<String>, size: [u32; 2], tile_size: u32, layers: Vec<Layer>) {
        self.entries.write().insert(
            path.into(),
            MemoryEntry {
                size,
                tile_size: tile_size.max(1),
                layers,
            },
        );
    }
    pub fn remove(&self, path: &str) -> bool {
        self.entries.write().remove(path).is_some()
    }
}
impl ImageSource for MemorySource {
    fn load(&self, path: &str) -> Result<Image, LoadError> {
        let entry = self
            .entries
            .read()
            .get(path)
            .cloned()
            .ok_or_else(|| LoadError::NotFound(path.to_owned()))?;
        if entry.size[0] == 0 || entry.size[1] == 0 {
            return Err(LoadError::EmptyCanvas(path.to_owned()));
        }
        let compositor = LayerCompositor::new(entry.size, entry.tile_size, entry.layers);
        Ok(Image::new(path, Box::new(compositor)))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::cancel::CancelToken;

    fn scratch_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("layerpipe-source-{name}-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn manifest_loads_png_layers() {
        let dir = scratch_dir("ok");
        image::RgbaImage::from_pixel(4, 4, image::Rgba([0, 255, 0, 255]))
            .save(dir.join("green.png"))
            .unwrap();
        image::RgbaImage::from_pixel(2, 2, image::Rgba([0, 0, 255, 255]))
            .save(dir.join("blue.png"))
            .unwrap();
        let manifest = dir.join("stack.json");
        std::fs::write(
            &manifest,
            r#"{"width": 4, "height": 4, "tileSize": 2, "layers": [
                {"name": "green", "path": "green.png"},
                {"name": "blue", "path": "blue.png", "x": 2, "y": 2, "visible": false}
            ]}"#,
        )
        .unwrap();

        let path = manifest.to_str().unwrap();
        let mut image = ManifestSource.load(path).unwrap();
        assert_eq!(image.canvas_size(), [4, 4]);
        assert_eq!(image.serialize(), "L.0 V.10");
        let out = image.render(&CancelToken::never()).unwrap();
        assert_eq!(out.get_pixel(3, 3).0, [0, 255, 0, 255]);

        image.deserialize("S.1").unwrap();
        let out = image.render(&CancelToken::never()).unwrap();
        assert_eq!(out.get_pixel(3, 3).0, [0, 0, 255, 255]);
        std::fs::remove_dir_all(dir).unwrap();
    }
    #[test]
    fn manifest_errors() {
        let dir = scratch_dir("bad");
        assert!(matches!(
            ManifestSource.load(dir.join("missing.json").to_str().unwrap()),
            Err(LoadError::NotFound(_))
        ));
        let broken = dir.join("broken.json");
        std::fs::write(&broken, "{").unwrap();
        assert!(matches!(
            ManifestSource.load(broken.to_str().unwrap()),
            Err(LoadError::Manifest { .. })
        ));
        let dangling = dir.join("dangling.json");
        std::fs::write(
            &dangling,
            r#"{"width": 1, "height": 1, "layers": [{"name": "x", "path": "nope.png"}]}"#,
        )
        .unwrap();
        assert!(matches!(
            ManifestSource.load(dangling.to_str().unwrap()),
            Err(LoadError::Decode { .. })
        ));
        std::fs::remove_dir_all(dir).unwrap();
    }
    #[test]
    fn memory_source_shares_layers() {
        let source = MemorySource::new();
        source.insert(
            "mem://a",
            [8, 8],
            4,
            vec![Layer::solid("bg", [8, 8], [0, 0], [1, 2, 3, 255])],
        );
        let a = source.load("mem://a").unwrap();
        let b = source.load("mem://a").unwrap();
        assert_eq!(a.path(), "mem://a");
        assert_eq!(a.layers(), b.layers());
        assert!(matches!(source.load("mem://b"), Err(LoadError::NotFound(_))));
        assert!(source.remove("mem://a"));
        assert!(source.load("mem://a").is_err());
    }
}

//! # Project document
//!
//! The persisted form of an editing session:
//!
//! ```json
//! {"version": 1, "splitterWidth": 480.5, "images": [
//!     {"image": {"version": 1, "filePath": "...", "layer": {...}, "pfv": ..., "viewState": {...}},
//!      "tag": 42, "thumbnail": "<base64 png>"}
//! ]}
//! ```
//!
//! Older sessions were a bare array of image entries, with no version or splitter width. Those
//! still load, as version 0. Field names of the older writer were capitalized, which is accepted
//! too.

use std::collections::BTreeMap;

use image::RgbaImage;

use crate::layers::LayerEntry;

/// Newest document version this crate reads and the one it writes.
pub const CURRENT_VERSION: u32 = 1;

#[derive(thiserror::Error, Debug)]
pub enum SerializationError {
    #[error("malformed document: {0}")]
    Json(#[from] serde_json::Error),
    #[error("document version {0} is newer than supported ({CURRENT_VERSION})")]
    UnsupportedVersion(u64),
    #[error("document must be an object or array")]
    NotADocument,
    #[error("thumbnail encoding failed: {0}")]
    Thumbnail(#[from] image::ImageError),
}

fn is_zero(v: &f64) -> bool {
    *v == 0.0
}

/// Per-image view settings. Scroll is relative, `0.0..=1.0`.
#[derive(Clone, Copy, Debug, Default, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ViewState {
    #[serde(default, skip_serializing_if = "is_zero")]
    pub zoom: f64,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub scroll_x: f64,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub scroll_y: f64,
}

/// Persisted state of one image.
#[derive(Clone, Debug, Default, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectState {
    #[serde(default, alias = "Version")]
    pub version: u32,
    #[serde(alias = "FilePath")]
    pub file_path: String,
    #[serde(default, alias = "Layer")]
    pub layer: BTreeMap<String, LayerEntry>,
    #[serde(default, alias = "PFV")]
    pub pfv: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub view_state: Option<ViewState>,
}

#[derive(Clone, Debug, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct DocumentEntry {
    #[serde(alias = "Image")]
    pub image: ProjectState,
    #[serde(default, alias = "Tag")]
    pub tag: i32,
    /// PNG bytes.
    #[serde(
        default,
        alias = "Thumbnail",
        with = "base64_bytes",
        skip_serializing_if = "Option::is_none"
    )]
    pub thumbnail: Option<Vec<u8>>,
}

#[derive(Clone, Debug, Default, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentRoot {
    pub version: u32,
    #[serde(default, skip_serializing_if = "is_zero_f32")]
    pub splitter_width: f32,
    pub images: Vec<DocumentEntry>,
}

fn is_zero_f32(v: &f32) -> bool {
    *v == 0.0
}

/// A document as read, before any image is loaded from it.
#[derive(Clone, Debug, PartialEq)]
pub struct ParsedDocument {
    /// 0 for legacy documents.
    pub version: u32,
    /// Absent in legacy documents, in which case the current width should be kept.
    pub splitter_width: Option<f32>,
    pub images: Vec<DocumentEntry>,
}

impl DocumentRoot {
    /// # Errors
    /// Serialization failure, which for these plain types does not happen in practice.
    pub fn to_json(&self) -> Result<String, SerializationError> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Parse either document layout.
/// # Errors
/// Malformed JSON, an unexpected shape, or a version newer than [`CURRENT_VERSION`].
pub fn parse_document(text: &str) -> Result<ParsedDocument, SerializationError> {
    let value: serde_json::Value = serde_json::from_str(text)?;
    match value {
        serde_json::Value::Array(_) => Ok(ParsedDocument {
            version: 0,
            splitter_width: None,
            images: serde_json::from_value(value)?,
        }),
        serde_json::Value::Object(mut map) => {
            let version = match map.get("version") {
                None => 0,
                Some(v) => v
                    .as_u64()
                    .ok_or_else(|| <serde_json::Error as serde::de::Error>::custom("bad version"))?,
            };
            if version > u64::from(CURRENT_VERSION) {
                return Err(SerializationError::UnsupportedVersion(version));
            }
            let images = match map.remove("images") {
                Some(images) => serde_json::from_value(images)?,
                None => Vec::new(),
            };
            if version == 0 {
                return Ok(ParsedDocument {
                    version: 0,
                    splitter_width: None,
                    images,
                });
            }
            let splitter_width = match map.get("splitterWidth") {
                Some(width) => serde_json::from_value(width.clone())?,
                None => 0.0,
            };
            Ok(ParsedDocument {
                // Checked against CURRENT_VERSION above.
                version: version as u32,
                splitter_width: Some(splitter_width),
                images,
            })
        }
        _ => Err(SerializationError::NotADocument),
    }
}

/// # Errors
/// PNG encoding failures.
pub fn encode_thumbnail(thumbnail: &RgbaImage) -> Result<Vec<u8>, SerializationError> {
    let mut out = std::io::Cursor::new(Vec::new());
    thumbnail.write_to(&mut out, image::ImageFormat::Png)?;
    Ok(out.into_inner())
}

/// # Errors
/// Bytes are not a PNG.
pub fn decode_thumbnail(png: &[u8]) -> Result<RgbaImage, SerializationError> {
    Ok(image::load_from_memory_with_format(png, image::ImageFormat::Png)?.into_rgba8())
}

/// Bytes as a standard padded base64 string, as the older writer emitted them.
mod base64_bytes {
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &Option<Vec<u8>>, ser: S) -> Result<S::Ok, S::Error> {
        match bytes {
            Some(bytes) => {
                ser.serialize_str(&base64::engine::general_purpose::STANDARD.encode(bytes))
            }
            None => ser.serialize_none(),
        }
    }
    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Option<Vec<u8>>, D::Error> {
        let Some(text) = Option::<String>::deserialize(de)? else {
            return Ok(None);
        };
        if text.is_empty() {
            return Ok(None);
        }
        base64::engine::general_purpose::STANDARD
            .decode(text.as_bytes())
            .map(Some)
            .map_err(serde::de::Error::custom)
    }
}

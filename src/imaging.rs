mod products;
mod thumbnail;
mod unpack;

pub use products::{product_id, ImageProcessor};
pub use thumbnail::{
    browse_path, make_browse_image, make_thumbnail, thumbnail_path, Previews, Thumbnailer,
    BROWSE_SUFFIX, THUMBNAIL_SUFFIX,
};
pub use unpack::{decode, operational_defaults, unpack};

use crate::telemetry::Value;
use chrono::{DateTime, Utc};
use image::DynamicImage;
use std::collections::BTreeMap;

/// Flat header/label fields describing one frame.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ImageMetadata(BTreeMap<String, Value>);

impl ImageMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: Value) -> Option<Value> {
        self.0.insert(key.into(), value)
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.0.remove(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn parameter_name(&self) -> Option<&str> {
        self.get("parameter_name").and_then(Value::as_str)
    }

    /// Capture time from the header's onboard time (`lobt`, epoch seconds),
    /// falling back to the parameter generation time.
    pub fn capture_time(&self) -> Option<DateTime<Utc>> {
        match self.get("lobt") {
            Some(Value::Time(ts)) => return Some(*ts),
            Some(value) => {
                if let Some(ts) = value.as_f64().and_then(crate::time::from_epoch_seconds) {
                    return Some(ts);
                }
            }
            None => {}
        }
        match self.get("parameter_generation_time") {
            Some(Value::Time(ts)) => Some(*ts),
            _ => None,
        }
    }

    /// Instrument name derived from the parameter name
    /// (`.../Navcam_left_icer` -> `navcam_left`), else from `cameraId`.
    pub fn instrument(&self) -> String {
        if let Some(name) = self.parameter_name() {
            let short = name.rsplit('/').next().unwrap_or(name);
            let short = short.strip_suffix("_icer").unwrap_or(short);
            if !short.is_empty() {
                return short.to_lowercase();
            }
        }
        match self.get("cameraId").and_then(Value::as_i64) {
            Some(id) => format!("camera{id}"),
            None => "unknown".to_string(),
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::Value::Object(
            self.0
                .iter()
                .map(|(key, value)| (key.clone(), value.to_json()))
                .collect(),
        )
    }
}

impl FromIterator<(String, Value)> for ImageMetadata {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl Extend<(String, Value)> for ImageMetadata {
    fn extend<I: IntoIterator<Item = (String, Value)>>(&mut self, iter: I) {
        self.0.extend(iter)
    }
}

/// Decoded pixels plus the metadata they were unpacked with.
#[derive(Debug, Clone)]
pub struct DecodedFrame {
    pub pixels: DynamicImage,
    pub metadata: ImageMetadata,
}

impl DecodedFrame {
    pub fn width(&self) -> u32 {
        self.pixels.width()
    }

    pub fn height(&self) -> u32 {
        self.pixels.height()
    }
}

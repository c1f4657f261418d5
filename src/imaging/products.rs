use super::{decode, unpack, DecodedFrame, ImageMetadata};
use crate::error::ImageError;
use crate::sink::FrameRecord;
use crate::telemetry::{TelemetrySample, Value};
use image::{DynamicImage, ImageFormat};
use serde_json::json;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

/// `<instrument>_<capture time, basic ISO 8601 with millis>`
pub fn product_id(metadata: &ImageMetadata) -> String {
    let instrument = metadata.instrument();
    match metadata.capture_time() {
        Some(ts) => format!("{instrument}_{}", ts.format("%Y%m%dT%H%M%S%3f")),
        None => instrument,
    }
}

/// TIFF cannot hold gray+alpha or float samples; widen or narrow them first.
fn storable(image: DynamicImage) -> DynamicImage {
    match image {
        DynamicImage::ImageLumaA8(_) => DynamicImage::ImageRgba8(image.to_rgba8()),
        DynamicImage::ImageLumaA16(_) => DynamicImage::ImageRgba16(image.to_rgba16()),
        DynamicImage::ImageRgb32F(_) | DynamicImage::ImageRgba32F(_) => {
            DynamicImage::ImageRgb16(image.to_rgb16())
        }
        other => other,
    }
}

/// Unpacks imagery samples, decodes them and writes the frame plus its label.
#[derive(Debug, Clone)]
pub struct ImageProcessor {
    product_dir: PathBuf,
    overrides: BTreeMap<String, Value>,
}

impl ImageProcessor {
    pub fn new(product_dir: impl Into<PathBuf>) -> Self {
        Self {
            product_dir: product_dir.into(),
            overrides: BTreeMap::new(),
        }
    }

    pub fn with_overrides(mut self, overrides: BTreeMap<String, Value>) -> Self {
        self.overrides = overrides;
        self
    }

    pub fn decode_sample(&self, sample: &TelemetrySample) -> Result<DecodedFrame, ImageError> {
        let (metadata, data) = unpack(sample, &self.overrides)?;
        let pixels = decode(&data)?;
        Ok(DecodedFrame { pixels, metadata })
    }

    /// Blocking: decodes `sample`, writes `<product_id>.tif` and
    /// `<product_id>.json`, and returns the record describing them.
    pub fn process(&self, sample: &TelemetrySample) -> Result<FrameRecord, ImageError> {
        let frame = self.decode_sample(sample)?;
        self.write(frame)
    }

    pub fn write(&self, frame: DecodedFrame) -> Result<FrameRecord, ImageError> {
        fs::create_dir_all(&self.product_dir)?;
        let product_id = product_id(&frame.metadata);
        let path = self.product_dir.join(format!("{product_id}.tif"));
        let label_path = self.product_dir.join(format!("{product_id}.json"));
        let (width, height) = (frame.width(), frame.height());

        storable(frame.pixels)
            .save_with_format(&path, ImageFormat::Tiff)
            .map_err(|source| ImageError::Encode {
                path: path.clone(),
                source,
            })?;

        let label = json!({
            "product_id": product_id,
            "width": width,
            "height": height,
            "metadata": frame.metadata.to_json(),
        });
        fs::write(&label_path, serde_json::to_vec_pretty(&label)?)?;

        tracing::debug!(product_id = %product_id, path = %path.display(), "wrote frame");
        Ok(FrameRecord {
            product_id,
            parameter: frame
                .metadata
                .parameter_name()
                .unwrap_or_default()
                .to_string(),
            instrument: frame.metadata.instrument(),
            captured_at: frame.metadata.capture_time(),
            width,
            height,
            path,
            label_path,
            metadata: frame.metadata,
        })
    }
}

use super::ImageMetadata;
use crate::error::ImageError;
use crate::telemetry::{TelemetrySample, Value};
use crate::time::{looks_like_date, parse_datetime};
use bytes::Bytes;
use image::DynamicImage;
use std::collections::BTreeMap;

const HEADER_KEY: &str = "imageHeader";
const DATA_KEY: &str = "imageData";
/// Raw time fields that would collide with the authoritative timestamps
/// assigned when the frame is labeled.
const CONFLICTING_KEYS: &[&str] = &["generation_time", "reception_time"];

/// Operational fields the image header does not carry yet.
pub fn operational_defaults() -> Vec<(&'static str, Value)> {
    vec![
        ("bad_pixel_table_id", Value::Int(0)),
        ("hazlight_aft_port_on", Value::Bool(false)),
        ("hazlight_aft_starboard_on", Value::Bool(false)),
        ("hazlight_center_port_on", Value::Bool(false)),
        ("hazlight_center_starboard_on", Value::Bool(false)),
        ("hazlight_fore_port_on", Value::Bool(false)),
        ("hazlight_fore_starboard_on", Value::Bool(false)),
        ("navlight_left_on", Value::Bool(false)),
        ("navlight_right_on", Value::Bool(false)),
        ("mission_phase", Value::from("TEST")),
        ("purpose", Value::from("Navigation")),
    ]
}

/// Splits an imagery sample into label metadata and the encoded pixel payload.
pub fn unpack(
    sample: &TelemetrySample,
    overrides: &BTreeMap<String, Value>,
) -> Result<(ImageMetadata, Bytes), ImageError> {
    let header = sample
        .value
        .get(HEADER_KEY)
        .and_then(Value::as_struct)
        .ok_or_else(|| {
            ImageError::NotAnImagePayload(format!("{}: missing {HEADER_KEY}", sample.name))
        })?;
    let data = sample
        .value
        .get(DATA_KEY)
        .and_then(Value::as_bytes)
        .ok_or_else(|| {
            ImageError::NotAnImagePayload(format!("{}: missing {DATA_KEY}", sample.name))
        })?
        .clone();

    let mut metadata = ImageMetadata::new();
    metadata.insert("parameter_name", Value::from(sample.name.as_str()));
    metadata.insert(
        "parameter_generation_time",
        Value::Time(sample.generation_time),
    );
    metadata.extend(header.iter().map(|(k, v)| (k.clone(), v.clone())));
    for (key, value) in operational_defaults() {
        if !metadata.contains_key(key) {
            metadata.insert(key, value);
        }
    }
    metadata.extend(sample.fields.iter().map(|(k, v)| (k.clone(), v.clone())));
    metadata.extend(overrides.iter().map(|(k, v)| (k.clone(), v.clone())));

    let date_keys: Vec<String> = metadata
        .iter()
        .filter(|(_, value)| matches!(value, Value::Text(text) if looks_like_date(text)))
        .map(|(key, _)| key.clone())
        .collect();
    for key in date_keys {
        let parsed = metadata
            .get(&key)
            .and_then(Value::as_str)
            .and_then(parse_datetime);
        if let Some(ts) = parsed {
            metadata.insert(key, Value::Time(ts));
        }
    }
    for key in CONFLICTING_KEYS {
        metadata.remove(key);
    }

    Ok((metadata, data))
}

pub fn decode(data: &[u8]) -> Result<DynamicImage, ImageError> {
    image::load_from_memory(data).map_err(ImageError::Decode)
}

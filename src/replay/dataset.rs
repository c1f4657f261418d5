use crate::error::ReplayError;
use crate::telemetry::{TelemetrySample, Value};
use crate::time::parse_datetime;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

pub const EVENTS_FILE: &str = "events.csv";
pub const BLOBS_DIR: &str = "blobs";

const ENG_PREFIX: &str = "eng_value";
const RAW_PREFIX: &str = "raw_value";
const PIVOT_COLUMN: &str = "pivot";
const LEGACY_BLOB_PREFIX: &str = "pivot_";
/// Cell values meaning "the value lives in flattened columns or a blob".
const UNNESTED_MARKERS: &[&str] = &["unnested", "None"];

/// One recorded sample, as typed cells. Empty cells are dropped.
#[derive(Debug, Clone)]
pub struct ReplayRow {
    pub index: usize,
    pub name: String,
    pub generation_time: DateTime<Utc>,
    cells: BTreeMap<String, Value>,
}

/// Recorded table of samples plus the blob store for externalized channels.
#[derive(Debug, Clone, Default)]
pub struct ReplayDataset {
    rows: Vec<ReplayRow>,
    blobs: HashMap<(usize, String), PathBuf>,
}

/// Typed reading of a CSV cell. Empty and `nan` cells are null.
pub fn parse_cell(raw: &str) -> Value {
    let trimmed = raw.trim();
    match trimmed {
        "" | "nan" | "NaN" => Value::Null,
        "True" | "true" => Value::Bool(true),
        "False" | "false" => Value::Bool(false),
        _ => {
            if let Ok(int) = trimmed.parse::<i64>() {
                Value::Int(int)
            } else if let Ok(float) = trimmed.parse::<f64>() {
                Value::Float(float)
            } else {
                Value::Text(trimmed.to_string())
            }
        }
    }
}

/// `eng_value_imageHeader_cameraId` -> `("eng_value", ["imageHeader", "cameraId"])`
fn flattened_path(column: &str) -> Option<(&'static str, Vec<&str>)> {
    for prefix in [ENG_PREFIX, RAW_PREFIX] {
        if let Some(rest) = column
            .strip_prefix(prefix)
            .and_then(|rest| rest.strip_prefix('_'))
        {
            if !rest.is_empty() {
                return Some((prefix, rest.split('_').collect()));
            }
        }
    }
    None
}

fn as_time(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::Time(ts) => Some(*ts),
        Value::Text(text) => parse_datetime(text),
        _ => None,
    }
}

fn is_unnested_marker(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => true,
        Some(Value::Text(text)) => UNNESTED_MARKERS.contains(&text.as_str()),
        _ => false,
    }
}

/// `{ix}_{channel}` or `pivot_{ix}_{channel}`
fn parse_blob_name(file_name: &str) -> Option<(usize, String)> {
    let name = file_name
        .strip_prefix(LEGACY_BLOB_PREFIX)
        .unwrap_or(file_name);
    let (index, channel) = name.split_once('_')?;
    let index = index.parse().ok()?;
    if channel.is_empty() {
        return None;
    }
    Some((index, channel.to_string()))
}

impl ReplayDataset {
    /// Loads `<dir>/events.csv` and the blob files under `<dir>/blobs/`.
    pub fn load(dir: &Path) -> Result<Self, ReplayError> {
        let events = fs::File::open(dir.join(EVENTS_FILE))?;
        Self::from_reader(events, &dir.join(BLOBS_DIR))
    }

    pub fn from_reader<R: Read>(reader: R, blobs_dir: &Path) -> Result<Self, ReplayError> {
        let mut csv = csv::Reader::from_reader(reader);
        let headers = csv.headers()?.clone();
        let mut rows = Vec::new();
        for (index, record) in csv.records().enumerate() {
            let record = record?;
            let mut cells = BTreeMap::new();
            for (column, raw) in headers.iter().zip(record.iter()) {
                let value = parse_cell(raw);
                if !value.is_null() {
                    cells.insert(column.to_string(), value);
                }
            }
            let name = match cells.get("name") {
                Some(Value::Text(name)) => name.clone(),
                _ => {
                    return Err(ReplayError::BadRow {
                        row: index,
                        reason: "missing name".to_string(),
                    })
                }
            };
            let generation_time = cells.get("generation_time").and_then(as_time).ok_or_else(|| {
                ReplayError::BadRow {
                    row: index,
                    reason: "missing or unparseable generation_time".to_string(),
                }
            })?;
            rows.push(ReplayRow {
                index,
                name,
                generation_time,
                cells,
            });
        }

        let mut blobs = HashMap::new();
        if blobs_dir.is_dir() {
            for entry in fs::read_dir(blobs_dir)? {
                let entry = entry?;
                if !entry.file_type()?.is_file() {
                    continue;
                }
                let file_name = entry.file_name();
                if let Some(key) = file_name.to_str().and_then(parse_blob_name) {
                    blobs.insert(key, entry.path());
                }
            }
        }
        tracing::debug!(rows = rows.len(), blobs = blobs.len(), "loaded replay dataset");
        Ok(Self { rows, blobs })
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn row(&self, index: usize) -> Option<&ReplayRow> {
        self.rows.get(index)
    }

    pub fn rows(&self) -> impl Iterator<Item = &ReplayRow> {
        self.rows.iter()
    }

    fn blob_channels(&self, row: usize, prefix: &str) -> Vec<(&str, &Path)> {
        let mut channels: Vec<(&str, &Path)> = self
            .blobs
            .iter()
            .filter(|((ix, channel), _)| *ix == row && channel.starts_with(prefix))
            .map(|((_, channel), path)| (channel.as_str(), path.as_path()))
            .collect();
        channels.sort();
        channels
    }

    /// Rebuilds the nested sample for `row`. `overrides` are applied to the
    /// flat record before re-nesting, so they may target flattened columns too.
    pub fn build_sample(
        &self,
        row: &ReplayRow,
        overrides: &BTreeMap<String, Value>,
    ) -> Result<TelemetrySample, ReplayError> {
        let mut record = row.cells.clone();
        record.extend(overrides.iter().map(|(k, v)| (k.clone(), v.clone())));

        let name = match record.get("name") {
            Some(Value::Text(name)) => name.clone(),
            _ => row.name.clone(),
        };
        let generation_time = record
            .get("generation_time")
            .and_then(as_time)
            .unwrap_or(row.generation_time);
        let mut sample = TelemetrySample::new(name, generation_time, Value::empty_struct());
        sample.reception_time = record.get("reception_time").and_then(as_time);

        let mut eng = Value::empty_struct();
        let mut raw = Value::empty_struct();
        for (column, value) in &record {
            if let Some((prefix, path)) = flattened_path(column) {
                let target = if prefix == ENG_PREFIX { &mut eng } else { &mut raw };
                target.insert_path(&path, value.clone());
                continue;
            }
            match column.as_str() {
                "name" | "generation_time" | "reception_time" | PIVOT_COLUMN | ENG_PREFIX
                | RAW_PREFIX => {}
                _ => {
                    sample.fields.insert(column.clone(), value.clone());
                }
            }
        }

        let pivoted = matches!(record.get(PIVOT_COLUMN), Some(Value::Bool(true)));
        for (prefix, target) in [(ENG_PREFIX, &mut eng), (RAW_PREFIX, &mut raw)] {
            let column = record.get(prefix);
            if !is_unnested_marker(column) {
                if let Some(value) = column {
                    *target = value.clone();
                }
            } else if pivoted {
                let channels = self.blob_channels(row.index, prefix);
                if channels.is_empty() && prefix == ENG_PREFIX {
                    return Err(ReplayError::MissingBlob {
                        row: row.index,
                        channel: prefix.to_string(),
                    });
                }
                for (channel, path) in channels {
                    let blob = Value::Bytes(Bytes::from(fs::read(path)?));
                    match flattened_path(channel) {
                        Some((_, nested)) => target.insert_path(&nested, blob),
                        None => *target = blob,
                    }
                }
            }
        }

        sample.value = eng;
        if !matches!(&raw, Value::Struct(fields) if fields.is_empty()) {
            sample.raw_value = Some(raw);
        }
        Ok(sample)
    }
}

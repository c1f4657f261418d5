use super::LightState;
use crate::error::LightStateError;
use crate::time::stringify_utc;
use chrono::{DateTime, Utc};
use std::fs::{self, OpenOptions};
use std::path::PathBuf;

/// Append-only CSV of light state changes: `generation_time,<luminaire...>`.
#[derive(Debug, Clone)]
pub struct LightStateLog {
    path: PathBuf,
    luminaires: Vec<String>,
}

impl LightStateLog {
    pub fn new(path: impl Into<PathBuf>, luminaires: Vec<String>) -> Self {
        Self {
            path: path.into(),
            luminaires,
        }
    }

    pub fn append(&self, at: DateTime<Utc>, state: &LightState) -> Result<(), LightStateError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let needs_header = fs::metadata(&self.path)
            .map(|meta| meta.len() == 0)
            .unwrap_or(true);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(file);

        if needs_header {
            let mut header = vec!["generation_time".to_string()];
            header.extend(self.luminaires.iter().cloned());
            writer.write_record(&header)?;
        }
        let mut row = vec![stringify_utc(at)];
        row.extend(
            self.luminaires
                .iter()
                .map(|luminaire| state.get(luminaire).to_string()),
        );
        writer.write_record(&row)?;
        writer.flush()?;
        Ok(())
    }
}

mod memory;
mod postgres;

pub use memory::MemorySink;
pub use postgres::{build_pool, PgRecordSink};

use crate::error::PersistenceError;
use crate::imaging::ImageMetadata;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LightTransitionRecord {
    pub luminaire: String,
    pub at: DateTime<Utc>,
    pub on: bool,
}

/// Durable description of a decoded, labeled frame.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameRecord {
    pub product_id: String,
    pub parameter: String,
    pub instrument: String,
    pub captured_at: Option<DateTime<Utc>>,
    pub width: u32,
    pub height: u32,
    pub path: PathBuf,
    pub label_path: PathBuf,
    pub metadata: ImageMetadata,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Record {
    LightTransition(LightTransitionRecord),
    Frame(FrameRecord),
}

/// Durable store for emitted records. A batch is written all-or-nothing.
#[async_trait]
pub trait RecordSink: Send + Sync {
    async fn insert_all(&self, records: &[Record]) -> Result<(), PersistenceError>;
}

/// Lookup of persisted light transitions.
#[async_trait]
pub trait LightHistory: Send + Sync {
    /// Latest transition for `luminaire` strictly before `before`, or the latest
    /// overall when `before` is `None`.
    async fn latest_before(
        &self,
        luminaire: &str,
        before: Option<DateTime<Utc>>,
    ) -> Result<Option<LightTransitionRecord>, PersistenceError>;
}

use super::{FrameRecord, LightHistory, LightTransitionRecord, Record, RecordSink};
use crate::error::PersistenceError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

/// In-process sink used for mock runs and tests.
#[derive(Debug, Default)]
pub struct MemorySink {
    records: Mutex<Vec<Record>>,
    unavailable: AtomicBool,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_records(records: Vec<Record>) -> Self {
        Self {
            records: Mutex::new(records),
            unavailable: AtomicBool::new(false),
        }
    }

    /// While set, every insert fails without writing anything.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::Relaxed);
    }

    pub fn records(&self) -> Vec<Record> {
        self.records
            .lock()
            .map(|guard| guard.clone())
            .unwrap_or_default()
    }

    pub fn light_transitions(&self) -> Vec<LightTransitionRecord> {
        self.records()
            .into_iter()
            .filter_map(|record| match record {
                Record::LightTransition(transition) => Some(transition),
                _ => None,
            })
            .collect()
    }

    pub fn frames(&self) -> Vec<FrameRecord> {
        self.records()
            .into_iter()
            .filter_map(|record| match record {
                Record::Frame(frame) => Some(frame),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl RecordSink for MemorySink {
    async fn insert_all(&self, records: &[Record]) -> Result<(), PersistenceError> {
        if self.unavailable.load(Ordering::Relaxed) {
            return Err(PersistenceError::Unavailable(
                "memory sink marked unavailable".to_string(),
            ));
        }
        let mut guard = self
            .records
            .lock()
            .map_err(|_| PersistenceError::Unavailable("memory sink poisoned".to_string()))?;
        guard.extend_from_slice(records);
        Ok(())
    }
}

#[async_trait]
impl LightHistory for MemorySink {
    async fn latest_before(
        &self,
        luminaire: &str,
        before: Option<DateTime<Utc>>,
    ) -> Result<Option<LightTransitionRecord>, PersistenceError> {
        let guard = self
            .records
            .lock()
            .map_err(|_| PersistenceError::Unavailable("memory sink poisoned".to_string()))?;
        let latest = guard
            .iter()
            .filter_map(|record| match record {
                Record::LightTransition(transition) => Some(transition),
                _ => None,
            })
            .filter(|transition| transition.luminaire == luminaire)
            .filter(|transition| before.map(|limit| transition.at < limit).unwrap_or(true))
            .max_by_key(|transition| transition.at)
            .cloned();
        Ok(latest)
    }
}

use crate::dispatch::{DispatchOutcome, Dispatcher, Event};
use crate::error::PersistenceError;
use crate::sink::{Record, RecordSink};
use chrono::Utc;
use std::collections::VecDeque;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Mutex,
};
use std::time::Instant;

#[derive(Debug, Default)]
pub struct PipelineStats {
    pub drained: AtomicU64,
    pub dispatched: AtomicU64,
    pub unmatched: AtomicU64,
    pub failed: AtomicU64,
    pub records_written: AtomicU64,
    pub last_flush_unix_ms: AtomicU64,
    pub average_flush_micros: AtomicU64,
    pub last_error: Mutex<Option<String>>,
}

impl PipelineStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_error(&self, err: impl Into<String>) {
        if let Ok(mut guard) = self.last_error.lock() {
            *guard = Some(err.into());
        }
    }

    pub fn clear_error(&self) {
        if let Ok(mut guard) = self.last_error.lock() {
            *guard = None;
        }
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().ok().and_then(|guard| guard.clone())
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            drained: self.drained.load(Ordering::Relaxed),
            dispatched: self.dispatched.load(Ordering::Relaxed),
            unmatched: self.unmatched.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            records_written: self.records_written.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub drained: u64,
    pub dispatched: u64,
    pub unmatched: u64,
    pub failed: u64,
    pub records_written: u64,
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub dispatched: usize,
    pub unmatched: usize,
    pub failed: usize,
    pub records: usize,
}

/// Runs `events` and everything they spawn through `dispatcher` in FIFO
/// order, then writes the batch's records to `sink` in one call.
///
/// Handler failures are logged and counted; they never stop the batch. The
/// last one stays in `stats` until a batch runs without any failure.
pub async fn process_batch(
    dispatcher: &mut Dispatcher,
    events: Vec<Event>,
    sink: &dyn RecordSink,
    stats: &PipelineStats,
) -> Result<BatchReport, PersistenceError> {
    let mut report = BatchReport::default();
    let mut queue: VecDeque<Event> = events.into();
    let mut records: Vec<Record> = Vec::new();

    while let Some(event) = queue.pop_front() {
        let kind = event.kind();
        match dispatcher.dispatch(event).await {
            Ok(DispatchOutcome::Handled { handler, effects }) => {
                report.dispatched += 1;
                stats.dispatched.fetch_add(1, Ordering::Relaxed);
                tracing::trace!(
                    handler,
                    records = effects.records.len(),
                    events = effects.events.len(),
                    "handled event"
                );
                records.extend(effects.records);
                queue.extend(effects.events);
            }
            Ok(DispatchOutcome::Unmatched) => {
                report.unmatched += 1;
                stats.unmatched.fetch_add(1, Ordering::Relaxed);
                tracing::trace!(kind, "no handler matched");
            }
            Err(err) => {
                report.failed += 1;
                stats.failed.fetch_add(1, Ordering::Relaxed);
                stats.record_error(err.to_string());
                tracing::warn!(kind, error = %err, "handler failed");
            }
        }
    }

    if records.is_empty() {
        if report.failed == 0 {
            stats.clear_error();
        }
        return Ok(report);
    }
    let started = Instant::now();
    if let Err(err) = sink.insert_all(&records).await {
        stats.record_error(err.to_string());
        tracing::error!(error = %err, records = records.len(), "failed to persist records");
        return Err(err);
    }
    report.records = records.len();
    stats
        .records_written
        .fetch_add(records.len() as u64, Ordering::Relaxed);
    stats
        .last_flush_unix_ms
        .store(Utc::now().timestamp_millis() as u64, Ordering::Relaxed);
    let micros = started.elapsed().as_micros() as u64;
    let prev = stats.average_flush_micros.load(Ordering::Relaxed);
    let avg = if prev == 0 { micros } else { (prev + micros) / 2 };
    stats.average_flush_micros.store(avg, Ordering::Relaxed);
    if report.failed == 0 {
        stats.clear_error();
    }
    tracing::debug!(records = records.len(), micros, "persisted record batch");
    Ok(report)
}

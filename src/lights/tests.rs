use super::{LightStateLog, LightStateTracker, LIGHT_STATE_PARAMETER};
use crate::error::LightStateError;
use crate::sink::{LightTransitionRecord, MemorySink, Record, RecordSink};
use crate::telemetry::{TelemetrySample, Value};
use chrono::{DateTime, TimeZone, Utc};
use std::sync::Arc;

fn at(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).unwrap()
}

fn luminaires() -> Vec<String> {
    vec!["navLight1".to_string(), "navLight2".to_string()]
}

fn light_sample(secs: i64, states: &[(&str, &str)]) -> TelemetrySample {
    let mut value = Value::empty_struct();
    for (luminaire, state) in states {
        value.insert_path(&[*luminaire, "measuredState"], Value::from(*state));
    }
    TelemetrySample::new(LIGHT_STATE_PARAMETER, at(secs), value)
}

fn transition(luminaire: &str, secs: i64, on: bool) -> LightTransitionRecord {
    LightTransitionRecord {
        luminaire: luminaire.to_string(),
        at: at(secs),
        on,
    }
}

async fn tracker_over(sink: &Arc<MemorySink>) -> LightStateTracker {
    let mut tracker = LightStateTracker::new(sink.clone(), luminaires());
    tracker.initialize_from_history().await.unwrap();
    tracker
}

#[tokio::test]
async fn uninitialized_tracker_ignores_samples() {
    let sink = Arc::new(MemorySink::new());
    let mut tracker = LightStateTracker::new(sink, luminaires());
    let records = tracker
        .process(&light_sample(10, &[("navLight1", "ON")]))
        .await
        .unwrap();
    assert!(records.is_empty());
    assert!(tracker.memory().is_none());
}

#[tokio::test]
async fn emits_only_changed_luminaires() {
    let sink = Arc::new(MemorySink::new());
    let mut tracker = tracker_over(&sink).await;

    let unchanged = tracker
        .process(&light_sample(10, &[("navLight1", "OFF"), ("navLight2", "OFF")]))
        .await
        .unwrap();
    assert!(unchanged.is_empty());

    let changed = tracker
        .process(&light_sample(20, &[("navLight1", "ON"), ("navLight2", "OFF")]))
        .await
        .unwrap();
    assert_eq!(changed, vec![transition("navLight1", 20, true)]);

    // navLight2 missing from the sample keeps its prior state
    let partial = tracker
        .process(&light_sample(30, &[("navLight1", "ON")]))
        .await
        .unwrap();
    assert!(partial.is_empty());
    let memory = tracker.memory().unwrap();
    assert!(memory.get("navLight1"));
    assert!(!memory.get("navLight2"));
    assert_eq!(memory.as_of(), Some(at(30)));
}

#[tokio::test]
async fn initializes_from_latest_history() {
    let sink = Arc::new(MemorySink::with_records(vec![
        Record::LightTransition(transition("navLight1", 5, true)),
        Record::LightTransition(transition("navLight2", 7, true)),
        Record::LightTransition(transition("navLight2", 9, false)),
    ]));
    let tracker = tracker_over(&sink).await;
    let memory = tracker.memory().unwrap();
    assert!(memory.get("navLight1"));
    assert!(!memory.get("navLight2"));
    assert_eq!(memory.as_of(), Some(at(9)));
}

#[tokio::test]
async fn out_of_order_sample_resyncs_from_history() {
    let sink = Arc::new(MemorySink::with_records(vec![Record::LightTransition(
        transition("navLight1", 10, true),
    )]));
    let mut tracker = tracker_over(&sink).await;

    let first = tracker
        .process(&light_sample(100, &[("navLight1", "OFF")]))
        .await
        .unwrap();
    assert_eq!(first, vec![transition("navLight1", 100, false)]);
    sink.insert_all(&first.iter().cloned().map(Record::LightTransition).collect::<Vec<_>>())
        .await
        .unwrap();

    // compared against history before t=50 (on since t=10), not the t=100 snapshot
    let late = tracker
        .process(&light_sample(50, &[("navLight1", "OFF")]))
        .await
        .unwrap();
    assert_eq!(late, vec![transition("navLight1", 50, false)]);

    let memory = tracker.memory().unwrap();
    assert_eq!(memory.as_of(), Some(at(100)));
    assert!(!memory.get("navLight1"));
}

#[tokio::test]
async fn resync_sees_transitions_not_yet_stored() {
    let sink = Arc::new(MemorySink::new());
    let mut tracker = tracker_over(&sink).await;

    for (secs, state) in [(10, "ON"), (20, "OFF")] {
        tracker
            .process(&light_sample(secs, &[("navLight1", state)]))
            .await
            .unwrap();
    }
    assert!(sink.records().is_empty());

    // on since t=10 according to the unflushed transitions
    let late = tracker
        .process(&light_sample(15, &[("navLight1", "ON")]))
        .await
        .unwrap();
    assert!(late.is_empty());

    let earlier = tracker
        .process(&light_sample(5, &[("navLight1", "ON")]))
        .await
        .unwrap();
    assert_eq!(earlier, vec![transition("navLight1", 5, true)]);
}

#[tokio::test]
async fn bad_measured_state_leaves_memory_untouched() {
    let sink = Arc::new(MemorySink::new());
    let mut tracker = tracker_over(&sink).await;
    let before = tracker.memory().cloned();

    let err = tracker
        .process(&light_sample(10, &[("navLight1", "BLINKING")]))
        .await
        .unwrap_err();
    assert!(matches!(err, LightStateError::BadMeasuredState { .. }));
    assert_eq!(tracker.memory().cloned(), before);

    let not_struct = TelemetrySample::new(LIGHT_STATE_PARAMETER, at(11), Value::Int(3));
    assert!(matches!(
        tracker.process(&not_struct).await,
        Err(LightStateError::NotAStruct)
    ));
}

#[tokio::test]
async fn log_records_only_changes() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("logs").join("lightstate.csv");
    let sink = Arc::new(MemorySink::new());
    let mut tracker = LightStateTracker::new(sink, luminaires())
        .with_log(LightStateLog::new(&path, luminaires()));
    tracker.initialize_from_history().await.unwrap();

    for (secs, state) in [(10, "ON"), (20, "ON"), (30, "OFF")] {
        tracker
            .process(&light_sample(secs, &[("navLight1", state)]))
            .await
            .unwrap();
    }

    let contents = std::fs::read_to_string(&path).unwrap();
    let lines: Vec<&str> = contents.lines().collect();
    assert_eq!(
        lines,
        vec![
            "generation_time,navLight1,navLight2",
            "1970-01-01T00:00:10.000000+00:00,true,false",
            "1970-01-01T00:00:30.000000+00:00,false,false",
        ]
    );
}

#[test]
fn matches_only_the_light_state_parameter() {
    assert!(LightStateTracker::matches(&light_sample(1, &[])));
    let other = TelemetrySample::new("/ViperRover/Other/state", at(1), Value::Null);
    assert!(!LightStateTracker::matches(&other));
}

use super::*;
use crate::replay::{ReplayDataset, SelectionMode, BLOBS_DIR, EVENTS_FILE};
use crate::sink::MemorySink;
use image::{DynamicImage, ImageBuffer, ImageFormat, Luma};
use std::collections::HashMap;
use std::io::Cursor;
use std::path::Path;

const EVENTS: &str = "\
name,generation_time,eng_value,pivot,eng_value_navLight1_measuredState,eng_value_imageHeader_cameraId,eng_value_imageHeader_lobt
/ViperRover/LightsControl/state,2024-01-01T00:00:01Z,unnested,False,ON,,
/ViperGround/Images/ImageData/Navcam_left_icer,2024-01-01T00:00:02Z,unnested,True,,1,1704067202
/ViperRover/LightsControl/state,2024-01-01T00:00:03Z,unnested,False,OFF,,
";

fn png(width: u32, height: u32) -> Vec<u8> {
    let buffer: ImageBuffer<Luma<u16>, Vec<u16>> =
        ImageBuffer::from_fn(width, height, |x, y| Luma([(x * 97 + y * 13) as u16]));
    let mut out = Cursor::new(Vec::new());
    DynamicImage::ImageLuma16(buffer)
        .write_to(&mut out, ImageFormat::Png)
        .unwrap();
    out.into_inner()
}

fn write_dataset(dir: &Path) {
    std::fs::write(dir.join(EVENTS_FILE), EVENTS).unwrap();
    std::fs::create_dir_all(dir.join(BLOBS_DIR)).unwrap();
    std::fs::write(dir.join(BLOBS_DIR).join("1_eng_value_imageData"), png(64, 48)).unwrap();
}

fn mock_config(root: &Path) -> Config {
    let vars: HashMap<&str, String> = HashMap::from([
        ("ROVER_MOCK", "true".to_string()),
        ("ROVER_UPDATE_INTERVAL_MS", "10".to_string()),
        ("ROVER_PRODUCT_DIR", root.join("products").display().to_string()),
        ("ROVER_BROWSE_DIR", root.join("browse").display().to_string()),
        ("ROVER_LIGHT_LOG", root.join("logs/lightstate.csv").display().to_string()),
        ("ROVER_THUMBNAIL_SIZE", "16".to_string()),
    ]);
    Config::from_lookup(|key| vars.get(key).cloned()).unwrap()
}

async fn tick_until(station: &mut Station, sink: &MemorySink, expected: usize) {
    for _ in 0..400 {
        station.tick().await;
        if sink.records().len() >= expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {expected} records");
}

#[tokio::test]
async fn initialize_subscribes_both_watches_in_mock_mode() {
    let root = tempfile::tempdir().unwrap();
    let sink = Arc::new(MemorySink::new());
    let mut station = Station::new(&mock_config(root.path()), sink);
    assert!(station
        .statuses()
        .iter()
        .all(|(_, status)| *status == SubscriptionStatus::Uninitialized));

    station.initialize().await.unwrap();
    assert_eq!(
        station.statuses(),
        vec![
            (IMAGE_WATCHER, SubscriptionStatus::Subscribed),
            (LIGHT_WATCHER, SubscriptionStatus::Subscribed),
        ]
    );
    assert_eq!(
        station.watches()[0].handler_names(),
        vec!["image_check", "image_processor", "thumbnailer"]
    );
    assert_eq!(station.tick().await, BatchReport::default());
    station.close();
}

#[tokio::test]
async fn replayed_samples_become_records_and_files() {
    let root = tempfile::tempdir().unwrap();
    let dataset_dir = root.path().join("dataset");
    std::fs::create_dir_all(&dataset_dir).unwrap();
    write_dataset(&dataset_dir);

    let config = mock_config(root.path());
    let sink = Arc::new(MemorySink::new());
    let mut station = Station::new(&config, sink.clone());
    station.initialize().await.unwrap();

    let mut simulator = ReplaySimulator::new(
        ReplayDataset::load(&dataset_dir).unwrap(),
        SelectionMode::Sequential,
        None,
    );
    let router = station.mock_router();
    let overrides = BTreeMap::new();
    for _ in 0..3 {
        let sample = simulator.serve_one(None, &overrides).unwrap();
        assert_eq!(router.publish(sample), 1);
    }
    assert!(matches!(
        simulator.serve_one(None, &overrides),
        Err(ReplayError::OutOfEvents)
    ));

    tick_until(&mut station, &sink, 3).await;

    let frames = sink.frames();
    assert_eq!(frames.len(), 1);
    assert_eq!((frames[0].width, frames[0].height), (64, 48));
    assert_eq!(frames[0].product_id, "navcam_left_20240101T000002000");
    assert!(frames[0].path.exists());

    let transitions: Vec<bool> = sink.light_transitions().iter().map(|t| t.on).collect();
    assert_eq!(transitions, vec![true, false]);

    let mut previews: Vec<String> = std::fs::read_dir(&config.browse_dir)
        .unwrap()
        .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    previews.sort();
    assert_eq!(
        previews,
        vec![
            "navcam_left_20240101T000002000_browse.jpg",
            "navcam_left_20240101T000002000_thumb.jpg",
        ]
    );
    let log = std::fs::read_to_string(root.path().join("logs/lightstate.csv")).unwrap();
    assert_eq!(log.lines().count(), 3);

    let stats = station.stats().snapshot();
    assert_eq!(stats.drained, 3);
    assert_eq!(stats.records_written, 3);
    station.close();
}

#[tokio::test]
async fn replay_feeder_stops_when_out_of_events() {
    let root = tempfile::tempdir().unwrap();
    let dataset_dir = root.path().join("dataset");
    std::fs::create_dir_all(&dataset_dir).unwrap();
    write_dataset(&dataset_dir);

    let sink = Arc::new(MemorySink::new());
    let mut station = Station::new(&mock_config(root.path()), sink.clone());
    station.initialize().await.unwrap();

    let simulator = ReplaySimulator::new(
        ReplayDataset::load(&dataset_dir).unwrap(),
        SelectionMode::NoReplacement,
        Some(7),
    );
    let feeder = spawn_replay_feeder(
        simulator,
        station.mock_router(),
        Duration::from_millis(1),
        CancellationToken::new(),
    );
    tokio::time::timeout(Duration::from_secs(5), feeder)
        .await
        .unwrap()
        .unwrap();

    for _ in 0..400 {
        station.tick().await;
        if !sink.frames().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(sink.frames().len(), 1);
    station.close();
}

#[tokio::test]
async fn replay_feeder_skips_rows_that_fail_to_build() {
    let root = tempfile::tempdir().unwrap();
    let dataset_dir = root.path().join("dataset");
    std::fs::create_dir_all(&dataset_dir).unwrap();
    std::fs::write(dataset_dir.join(EVENTS_FILE), EVENTS).unwrap();

    let sink = Arc::new(MemorySink::new());
    let mut station = Station::new(&mock_config(root.path()), sink.clone());
    station.initialize().await.unwrap();

    let simulator = ReplaySimulator::new(
        ReplayDataset::load(&dataset_dir).unwrap(),
        SelectionMode::Sequential,
        None,
    );
    let feeder = spawn_replay_feeder(
        simulator,
        station.mock_router(),
        Duration::from_millis(1),
        CancellationToken::new(),
    );
    tokio::time::timeout(Duration::from_secs(5), feeder)
        .await
        .unwrap()
        .unwrap();

    tick_until(&mut station, &sink, 2).await;
    let transitions: Vec<bool> = sink.light_transitions().iter().map(|t| t.on).collect();
    assert_eq!(transitions, vec![true, false]);
    assert!(sink.frames().is_empty());
    station.close();
}

#[tokio::test]
async fn run_exits_on_cancel() {
    let root = tempfile::tempdir().unwrap();
    let mut station = Station::new(&mock_config(root.path()), Arc::new(MemorySink::new()));
    station.initialize().await.unwrap();

    let cancel = CancellationToken::new();
    let handle = tokio::spawn(station.run(cancel.clone()));
    tokio::time::sleep(Duration::from_millis(30)).await;
    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .unwrap()
        .unwrap();
}

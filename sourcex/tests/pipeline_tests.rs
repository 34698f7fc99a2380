use std::sync::Arc;

use common::log_setup::setup_test_logging;
use sourcex::output::{CatalogRow, ColumnValue, CollectingSink, OutputRegistry};
use sourcex::pipeline::measurement;
use sourcex::plugins::{register_default_columns, register_default_plugins};
use sourcex::task::TaskFactoryRegistry;
use sourcex::tile::{MemorySource, PixelKind, TileData, TileStore, TileStoreConfig, TiledImage};
use sourcex::{Config, Error, Extraction, Frame};

const WIDTH: usize = 32;
const HEIGHT: usize = 24;

/// Three detections above the 1.5 threshold:
/// - a 3x3 star centred on (5, 5), peak 20, flux 100
/// - a flat 3x3 star centred on (20, 6), flux 45
/// - an L-shaped arc around the second star, not touching it, flux 56
///
/// plus a hot pixel at (2, 20) too small to pass `min_area`.
fn sky(x: usize, y: usize) -> f64 {
    let (x, y) = (x as i64, y as i64);
    if (x - 5).abs() <= 1 && (y - 5).abs() <= 1 {
        return if x == 5 && y == 5 { 20.0 } else { 10.0 };
    }
    if (x - 20).abs() <= 1 && (y - 6).abs() <= 1 {
        return 5.0;
    }
    if (y == 9 && (17..=24).contains(&x)) || (x == 24 && (3..=8).contains(&y)) {
        return 4.0;
    }
    if x == 2 && y == 20 {
        return 50.0;
    }
    0.0
}

fn small_tiles() -> TileStoreConfig {
    TileStoreConfig {
        tile_width: 8,
        tile_height: 8,
        max_memory_bytes: 4 * 8 * 8 * 4,
    }
}

fn detection_frame(config: &Config) -> Arc<Frame> {
    let store = TileStore::new(config.tiles.clone());
    let data = TileData::from_fn(PixelKind::Float32, WIDTH, HEIGHT, sky);
    let id = store.register(Arc::new(MemorySource::new("sky", data)));
    let image = TiledImage::new(store, id).unwrap();
    Arc::new(Frame::new(image).with_threshold(config.detection.threshold))
}

fn test_config() -> Config {
    setup_test_logging();
    let mut config = Config::default();
    config.tiles = small_tiles();
    config.detection.progress_interval_rows = 2;
    config.pipeline.thread_count = 3;
    config
}

fn extraction(config: Config) -> Extraction {
    let mut registry = TaskFactoryRegistry::new();
    register_default_plugins(&mut registry, Vec::new()).unwrap();
    let mut outputs = OutputRegistry::new();
    register_default_columns(&mut outputs, 0).unwrap();
    Extraction::new(config, registry, &outputs).unwrap()
}

fn int(row: &CatalogRow, column: &str) -> i64 {
    row.get(column)
        .and_then(|value| value.as_i64())
        .unwrap_or_else(|| panic!("{} is not an integer", column))
}

fn float(row: &CatalogRow, column: &str) -> f64 {
    row.get(column)
        .and_then(|value| value.as_f64())
        .unwrap_or_else(|| panic!("{} is not a number", column))
}

fn find_by_npix(rows: &[CatalogRow], npix: i64) -> &CatalogRow {
    rows.iter()
        .find(|row| int(row, "NPIX") == npix)
        .unwrap_or_else(|| panic!("no source with {} pixels", npix))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn extracts_measures_and_orders_sources() {
    let config = test_config();
    let detection = detection_frame(&config);
    let extraction = extraction(config);
    let progress = extraction.progress().clone();
    let sink = CollectingSink::new(extraction.outputs().clone());
    let rows = sink.rows();

    let summary = extraction.run(detection, Box::new(sink)).await.unwrap();

    assert_eq!(summary.sources_detected, 4);
    assert_eq!(summary.sources_emitted, 3, "hot pixel is below min_area");
    assert_eq!(summary.groups_emitted, 2);
    assert_eq!(summary.failures, 0);
    assert!(summary.tile_stats.loads > 0);

    let rows = rows.lock();
    let ids: Vec<i64> = rows.iter().map(|row| int(row, "SOURCE_ID")).collect();
    assert_eq!(ids, [1, 2, 3]);

    let star = rows
        .iter()
        .find(|row| int(row, "NPIX") == 9 && float(row, "FLUX_ISO") > 50.0)
        .unwrap();
    assert!((float(star, "X_IMAGE") - 5.0).abs() < 1e-9);
    assert!((float(star, "Y_IMAGE") - 5.0).abs() < 1e-9);
    assert!((float(star, "FLUX_ISO") - 100.0).abs() < 1e-6);
    assert!((float(star, "FLUX_MAX") - 20.0).abs() < 1e-6);
    assert_eq!(int(star, "FLAGS"), 0);

    let arc = find_by_npix(&rows, 14);
    assert!((float(arc, "FLUX_ISO") - 56.0).abs() < 1e-6);
    assert_eq!(
        (int(arc, "XMIN_IMAGE"), int(arc, "YMIN_IMAGE")),
        (17, 3)
    );
    assert_eq!(
        (int(arc, "XMAX_IMAGE"), int(arc, "YMAX_IMAGE")),
        (24, 9)
    );

    // the flat star sits inside the arc's bounding box
    let flat = rows
        .iter()
        .find(|row| int(row, "NPIX") == 9 && float(row, "FLUX_ISO") < 50.0)
        .unwrap();
    assert_eq!(int(flat, "GROUP_ID"), int(arc, "GROUP_ID"));
    assert_ne!(int(flat, "GROUP_ID"), int(star, "GROUP_ID"));
    assert_eq!(int(flat, "GROUP_XMIN"), 17);
    assert_eq!(int(flat, "GROUP_YMAX"), 9);

    let snapshot = progress.snapshot();
    assert_eq!(snapshot.get(measurement::PROGRESS_LABEL), Some(&(3, -1)));
}

#[tokio::test]
async fn selected_columns_are_written_in_order() {
    let mut config = test_config();
    config.output.columns = vec!["FLUX_ISO".to_string(), "SOURCE_ID".to_string()];
    let detection = detection_frame(&config);
    let extraction = extraction(config);
    assert_eq!(extraction.outputs().column_names(), ["FLUX_ISO", "SOURCE_ID"]);

    let sink = CollectingSink::new(extraction.outputs().clone());
    let rows = sink.rows();
    extraction.run(detection, Box::new(sink)).await.unwrap();

    let rows = rows.lock();
    assert_eq!(rows.len(), 3);
    for row in rows.iter() {
        let names: Vec<&str> = row.values.iter().map(|(name, _)| name.as_str()).collect();
        assert_eq!(names, ["FLUX_ISO", "SOURCE_ID"]);
    }
}

#[test]
fn unknown_column_is_rejected() {
    let mut config = test_config();
    config.output.columns = vec!["NOT_A_COLUMN".to_string()];
    let mut registry = TaskFactoryRegistry::new();
    register_default_plugins(&mut registry, Vec::new()).unwrap();
    let mut outputs = OutputRegistry::new();
    register_default_columns(&mut outputs, 0).unwrap();

    let err = Extraction::new(config, registry, &outputs).err().unwrap();
    assert!(matches!(err, Error::Config(_)));
}

#[tokio::test]
async fn stored_bypass_replays_the_same_catalog() {
    let dir = tempfile::tempdir().unwrap();
    let bypass = dir.path().join("groups.bypass");

    let mut config = test_config();
    config.output.store_bypass = Some(bypass.clone());
    let detection = detection_frame(&config);
    let first = extraction(config);
    let sink = CollectingSink::new(first.outputs().clone());
    let stored_rows = sink.rows();
    first.run(detection.clone(), Box::new(sink)).await.unwrap();
    assert!(bypass.exists());

    let second = extraction(test_config());
    let sink = CollectingSink::new(second.outputs().clone());
    let recovered_rows = sink.rows();
    let summary = second
        .run_recovered(&bypass, detection, Box::new(sink))
        .await
        .unwrap();

    assert_eq!(summary.sources_detected, 3);
    assert_eq!(summary.sources_emitted, 3);
    let stored = stored_rows.lock();
    let recovered = recovered_rows.lock();
    assert_eq!(stored.len(), recovered.len());
    for (a, b) in stored.iter().zip(recovered.iter()) {
        for (name, value) in &a.values {
            let other = b.get(name).unwrap();
            match (value, other) {
                (ColumnValue::Float(x), ColumnValue::Float(y)) => {
                    assert!((x - y).abs() < 1e-9, "{} differs: {} vs {}", name, x, y)
                }
                _ => assert_eq!(*value, other, "{} differs", name),
            }
        }
    }
}

#[tokio::test]
async fn aborted_run_reports_abort() {
    let config = test_config();
    let detection = detection_frame(&config);
    let extraction = extraction(config);
    extraction.abort_signal().abort();

    let sink = CollectingSink::new(extraction.outputs().clone());
    let rows = sink.rows();
    let err = extraction.run(detection, Box::new(sink)).await.unwrap_err();

    assert!(matches!(err, Error::Aborted), "got {:?}", err);
    assert!(rows.lock().is_empty());
}

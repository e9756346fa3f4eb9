use approx::assert_relative_eq;
use chrono::{Duration, NaiveDate, TimeZone, Utc};
use glacierflow::config::PipelineConfig;
use glacierflow::core::{ChainDriver, Stage, UnitState};
use glacierflow::io::boundary::{StaticBoundaryProvider, UnitBoundary};
use glacierflow::io::field_store::{MemoryFieldStore, RawField};
use glacierflow::io::orbit_table;
use glacierflow::io::{ArrayContainer, FieldIdentifier, RasterIo};
use glacierflow::types::{GeoTransform, GridSpec, Period, Source};
use ndarray::Array2;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

const UNIT: &str = "001_alison";

fn grid() -> GridSpec {
    GridSpec {
        geo_transform: GeoTransform::from_gdal([0.0, 100.0, 0.0, 400.0, 0.0, -100.0]),
        rows: 4,
        cols: 4,
        epsg: 3413,
    }
}

/// Ice in the first three columns, rock in the last, no ocean
fn write_masks(mask_dir: &Path, unit: &str) {
    let dir = mask_dir.join(unit);
    std::fs::create_dir_all(&dir).unwrap();
    let ice = Array2::from_shape_fn((4, 4), |(_, c)| u8::from(c < 3));
    let ocean = Array2::<u8>::zeros((4, 4));
    RasterIo::write_mask(dir.join("mask_ice.tif"), &ice, &grid()).unwrap();
    RasterIo::write_mask(dir.join("mask_ocean.tif"), &ocean, &grid()).unwrap();
}

fn boundaries(units: &[&str]) -> StaticBoundaryProvider {
    let mut provider = StaticBoundaryProvider::new();
    for unit in units {
        provider.insert(UnitBoundary {
            unit: unit.to_string(),
            bounding_box: grid().bounding_box(),
            epsg: 3413,
            polygon: None,
        });
    }
    provider
}

fn s2_name(start: NaiveDate, days: i64, orbit1: &str, orbit2: &str) -> String {
    let end = start + Duration::days(days);
    format!(
        "S2A_MSIL2A_{}T120000_N0214_{}__S2B_MSIL2A_{}T120000_N0214_{}",
        start.format("%Y%m%d"),
        orbit1,
        end.format("%Y%m%d"),
        orbit2
    )
}

fn landsat_name(start: NaiveDate, days: i64) -> String {
    let end = start + Duration::days(days);
    let scene = |d: NaiveDate| {
        format!(
            "LC08_L1TP_008011_{}_{}_02_T1",
            d.format("%Y%m%d"),
            (d + Duration::days(6)).format("%Y%m%d")
        )
    };
    format!("{}__{}", scene(start), scene(end))
}

/// Uniform field with `vx`, `vy` everywhere
fn field(name: &str, vx: f32, vy: f32) -> RawField {
    let id = FieldIdentifier::parse(name).unwrap();
    RawField::new(id, Array2::from_elem((4, 4), vx), Array2::from_elem((4, 4), vy), grid()).unwrap()
}

/// Sentinel-2 field from `start` spanning `days`, flowing `vx` east
fn s2_field(start: NaiveDate, days: i64, orbits: (&str, &str), vx: f32) -> RawField {
    field(&s2_name(start, days, orbits.0, orbits.1), vx, 0.5)
}

fn delivered(output: &Path) -> ArrayContainer {
    let path = output.join("delivery").join(format!("{}_v01.1.npz", UNIT));
    ArrayContainer::read(&path).unwrap()
}

fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

fn config(tmp: &TempDir, units: &[&str]) -> PipelineConfig {
    let mut config = PipelineConfig::default();
    config.glaciers = units.iter().map(|u| u.to_string()).collect();
    config.output_dir = tmp.path().join("output");
    config.mask_dir = tmp.path().join("masks");
    config.start_date = date(2020, 1, 1);
    config.end_date = date(2020, 12, 31);
    config.estimation.min_pair_samples = 3;
    config.correction.write_previews = false;
    for unit in units {
        write_masks(&config.mask_dir, unit);
    }
    config
}

fn driver(config: PipelineConfig, store: MemoryFieldStore, units: &[&str]) -> ChainDriver {
    ChainDriver::new(config, Arc::new(store), Arc::new(boundaries(units)))
}

#[test]
fn test_single_source_unit_is_partially_delivered() {
    let _ = env_logger::builder().is_test(true).try_init();
    println!("🧪 Sentinel-2 only unit with an empty Landsat source");

    let tmp = TempDir::new().unwrap();
    let config = config(&tmp, &[UNIT]);
    let mut store = MemoryFieldStore::new();
    for i in 0..40 {
        let name = s2_name(date(2020, 1, 1) + Duration::days(i * 5), 10, "R083", "R083");
        store.insert(UNIT, field(&name, 1.0, 0.5));
    }
    // outside the date range: indexed, never processed
    store.insert(UNIT, s2_field(date(2019, 6, 1), 10, ("R083", "R083"), 1.0));

    let output = config.output_dir.clone();
    let driver = driver(config, store, &[UNIT]);
    let report = driver.run_unit(UNIT);

    println!("   state={} steps={} records={}", report.state, report.steps, report.records);
    assert_eq!(report.state, UnitState::PartiallyDelivered);
    assert_eq!(report.steps, 40);
    assert_eq!(report.coverage.as_deref(), Some("single_source(sentinel2)"));
    assert_eq!(report.missing_sources, vec![(Period::Whole, Source::Landsat)]);
    assert_eq!(report.records, 41);
    assert_eq!(report.out_of_range, 1);
    assert_eq!(report.corrected, 40);

    let table = orbit_table::table_path(&output.join(UNIT).join("orbits"), UNIT);
    let records = orbit_table::read_table(&table).unwrap();
    assert_eq!(records.len(), 41, "every parseable field keeps its orbit-pair record");

    let product = delivered(&output);
    assert_eq!(product.len(), 40);
    assert!(product.steps.iter().all(|s| s.source == Source::Sentinel2));
    assert!(product
        .steps
        .windows(2)
        .all(|w| w[0].midpoint() <= w[1].midpoint()));
    assert_eq!(product.global_attributes["coverage"], "single_source(sentinel2)");
    assert_relative_eq!(product.vx[[0, 0, 0]], 1.0, epsilon = 1e-6);
    assert!(product.vx[[0, 0, 3]].is_nan(), "rock pixels are outside the glacier");

    let entries = driver.failure_log().read_entries().unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].terminal_state, "partially_delivered");
    println!("✅ partially delivered with 40 steps");
}

#[test]
fn test_cross_track_offsets_and_two_source_merge() {
    let _ = env_logger::builder().is_test(true).try_init();
    println!("🧪 Offset correction plus Landsat masking-only merge");

    let tmp = TempDir::new().unwrap();
    let config = config(&tmp, &[UNIT]);
    let mut store = MemoryFieldStore::new();
    for i in 0..5 {
        let name = s2_name(date(2020, 3, 1) + Duration::days(i * 7), 10, "R083", "R083");
        store.insert(UNIT, field(&name, 1.0, 0.5));
    }
    // 3 fields on R040/R083 carry a 2 m displacement bias in x
    for i in 0..3 {
        let name = s2_name(date(2020, 5, 1) + Duration::days(i * 7), 10, "R040", "R083");
        store.insert(UNIT, field(&name, 1.0 + 2.0 / 10.0, 0.5));
    }
    // only 2 fields on R083/R127: below the threshold, uncorrectable
    for i in 0..2 {
        let name = s2_name(date(2020, 7, 1) + Duration::days(i * 7), 10, "R083", "R127");
        store.insert(UNIT, field(&name, 3.0, 0.5));
    }
    for i in 0..2 {
        let name = landsat_name(date(2020, 8, 1) + Duration::days(i * 16), 16);
        store.insert(UNIT, field(&name, 1.0, 0.5));
    }

    let output = config.output_dir.clone();
    let report = driver(config, store, &[UNIT]).run_unit(UNIT);

    println!(
        "   state={} corrected={} excluded={} insufficient={}",
        report.state, report.corrected, report.excluded, report.insufficient_signatures
    );
    assert_eq!(report.state, UnitState::Delivered);
    assert_eq!(report.corrected, 10);
    assert_eq!(report.excluded, 2);
    assert_eq!(report.insufficient_signatures, 1);
    assert_eq!(report.steps, 10);
    assert_eq!(report.coverage.as_deref(), Some("multi_source"));

    let orbits = output.join(UNIT).join("orbits");
    assert!(orbits.join(format!("{}_median_offset_R040_R083_dx.tif", UNIT)).exists());
    assert!(!orbits.join(format!("{}_median_offset_R083_R127_dx.tif", UNIT)).exists());

    let offset_path = orbits.join(format!("{}_median_offset_R040_R083_dx.tif", UNIT));
    let (offset, _) = RasterIo::read_f32(offset_path).unwrap();
    assert_relative_eq!(offset[[1, 1]], 2.0, epsilon = 1e-4);

    let product = delivered(&output);
    assert_eq!(product.len(), 10);
    assert_eq!(product.steps.iter().filter(|s| s.source == Source::Landsat).count(), 2);
    for (i, step) in product.steps.iter().enumerate() {
        if step.offset_signature.is_some() {
            assert_relative_eq!(product.vx[[i, 1, 1]], 1.0, epsilon = 1e-4);
        }
    }
    assert!(product.steps.iter().all(|s| !s.field_id.contains("R127")));
    println!("✅ offsets applied, uncorrectable fields excluded");
}

#[test]
fn test_discontinuity_split_is_reconciled() {
    let _ = env_logger::builder().is_test(true).try_init();
    println!("🧪 Pre/post discontinuity processing");

    let tmp = TempDir::new().unwrap();
    let mut config = config(&tmp, &[UNIT]);
    config.start_date = date(2021, 1, 1);
    config.end_date = date(2021, 12, 31);
    config.sources.landsat.enabled = false;

    let mut store = MemoryFieldStore::new();
    for i in 0..4 {
        let start = date(2021, 3, 1) + Duration::days(i * 20);
        store.insert(UNIT, s2_field(start, 10, ("R083", "R083"), 1.0));
        let start = date(2021, 9, 1) + Duration::days(i * 20);
        store.insert(UNIT, s2_field(start, 10, ("R083", "R083"), 2.0));
    }
    store.insert(UNIT, s2_field(date(2021, 8, 20), 10, ("R083", "R083"), 1.5));

    let output = config.output_dir.clone();
    let report = driver(config, store, &[UNIT]).run_unit(UNIT);

    assert_eq!(report.state, UnitState::Delivered);
    assert_eq!(report.records, 9);
    assert_eq!(report.straddling, 1);
    assert_eq!(report.steps, 8);
    assert!(output.join(UNIT).join("containers").join("pre_discontinuity").is_dir());
    assert!(output.join(UNIT).join("containers").join("post_discontinuity").is_dir());

    let product = delivered(&output);
    let periods: Vec<Period> = product.steps.iter().map(|s| s.period).collect();
    assert_eq!(&periods[..4], &[Period::PreDiscontinuity; 4]);
    assert_eq!(&periods[4..], &[Period::PostDiscontinuity; 4]);
    let boundary = Utc.with_ymd_and_hms(2021, 8, 23, 0, 0, 0).unwrap();
    assert!(product
        .steps
        .iter()
        .all(|s| s.scene_2_datetime < boundary || s.scene_1_datetime >= boundary));
    assert_eq!(product.global_attributes["reconciler"], "concatenate");
    println!("✅ straddling field excluded, periods concatenated");
}

#[test]
fn test_batch_isolates_failed_units() {
    let _ = env_logger::builder().is_test(true).try_init();
    println!("🧪 One unit without a boundary in a two-worker batch");

    let tmp = TempDir::new().unwrap();
    let mut config = config(&tmp, &[UNIT, "002_nobound"]);
    config.workers = 2;
    config.sources.landsat.enabled = false;

    let mut store = MemoryFieldStore::new();
    for unit in [UNIT, "002_nobound"] {
        for i in 0..4 {
            let start = date(2020, 4, 1) + Duration::days(i * 12);
            store.insert(unit, s2_field(start, 10, ("R083", "R083"), 1.0));
        }
    }

    let driver = ChainDriver::new(config, Arc::new(store), Arc::new(boundaries(&[UNIT])));
    let batch = driver.run_batch().unwrap();

    assert_eq!(batch.units.len(), 2);
    assert_eq!(batch.delivered().len(), 1);
    assert_eq!(batch.failed().len(), 1);
    assert_eq!(batch.exit_code(), 1);

    let failed = batch.unit("002_nobound").unwrap();
    assert_eq!(failed.state, UnitState::Failed);
    assert_eq!(failed.history[0].stage, Stage::OrbitIndexing);
    assert_eq!(failed.history[0].state, UnitState::Failed);

    let entries = driver.failure_log().read_entries().unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].unit, "002_nobound");
    assert_eq!(entries[0].terminal_state, "failed");
    assert_eq!(entries[0].stage, "orbit_indexing");
    println!("✅ failure recorded without affecting the healthy unit");
}

#[test]
fn test_no_surviving_stack_fails_unit() {
    let _ = env_logger::builder().is_test(true).try_init();
    println!("🧪 Coverage filter removes every field");

    let tmp = TempDir::new().unwrap();
    let mut config = config(&tmp, &[UNIT]);
    config.sources.landsat.enabled = false;
    config.correction.min_ice_coverage = 1.0;

    let mut store = MemoryFieldStore::new();
    for i in 0..4 {
        let mut raw = s2_field(date(2020, 2, 1) + Duration::days(i * 7), 10, ("R083", "R083"), 1.0);
        raw.dx[[0, 0]] = f32::NAN;
        store.insert(UNIT, raw);
    }

    let driver = driver(config, store, &[UNIT]);
    let report = driver.run_unit(UNIT);

    println!("   state={} excluded={}", report.state, report.excluded);
    assert_eq!(report.state, UnitState::Failed);
    assert_eq!(report.corrected, 0);
    assert_eq!(report.excluded, 4);
    assert_eq!(report.missing_sources, vec![(Period::Whole, Source::Sentinel2)]);
    assert!(report.delivered.is_empty());

    let entries = driver.failure_log().read_entries().unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].stage, "merge");
    println!("✅ unit failed with nothing to merge");
}

#[test]
fn test_critical_failure_in_one_period_fails_unit() {
    let _ = env_logger::builder().is_test(true).try_init();
    println!("🧪 Offset estimation fails before the discontinuity only");

    let tmp = TempDir::new().unwrap();
    let mut config = config(&tmp, &[UNIT]);
    config.start_date = date(2021, 1, 1);
    config.end_date = date(2021, 12, 31);
    config.sources.landsat.enabled = false;

    let mut store = MemoryFieldStore::new();
    // pre: cross-track only, so no reference field exists
    for i in 0..3 {
        let start = date(2021, 3, 1) + Duration::days(i * 20);
        store.insert(UNIT, s2_field(start, 10, ("R040", "R083"), 1.0));
    }
    for i in 0..4 {
        let start = date(2021, 9, 1) + Duration::days(i * 20);
        store.insert(UNIT, s2_field(start, 10, ("R083", "R083"), 1.0));
    }

    let output = config.output_dir.clone();
    let driver = driver(config, store, &[UNIT]);
    let report = driver.run_unit(UNIT);

    println!("   state={} failure={:?}", report.state, report.failure);
    assert_eq!(report.state, UnitState::Failed);
    assert!(report.delivered.is_empty());
    assert!(!output.join("delivery").join(format!("{}_v01.1.npz", UNIT)).exists());
    let (stage, _) = report.failure.clone().unwrap();
    assert_eq!(stage, "offset_estimation");
    assert!(report
        .history
        .iter()
        .all(|h| h.period != Some(Period::PostDiscontinuity)));

    let entries = driver.failure_log().read_entries().unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].terminal_state, "failed");
    assert_eq!(entries[0].stage, "offset_estimation");
    println!("✅ critical failure in one period blocks the unit");
}

#[test]
fn test_source_lost_in_one_period_delivers_single_source() {
    let _ = env_logger::builder().is_test(true).try_init();
    println!("🧪 Landsat present before the discontinuity only");

    let tmp = TempDir::new().unwrap();
    let mut config = config(&tmp, &[UNIT]);
    config.start_date = date(2021, 1, 1);
    config.end_date = date(2021, 12, 31);

    let mut store = MemoryFieldStore::new();
    for i in 0..4 {
        let start = date(2021, 3, 1) + Duration::days(i * 20);
        store.insert(UNIT, s2_field(start, 10, ("R083", "R083"), 1.0));
        let start = date(2021, 9, 1) + Duration::days(i * 20);
        store.insert(UNIT, s2_field(start, 10, ("R083", "R083"), 1.0));
    }
    for i in 0..2 {
        let name = landsat_name(date(2021, 4, 1) + Duration::days(i * 16), 16);
        store.insert(UNIT, field(&name, 1.0, 0.5));
    }

    let output = config.output_dir.clone();
    let driver = driver(config, store, &[UNIT]);
    let report = driver.run_unit(UNIT);

    println!("   state={} coverage={:?}", report.state, report.coverage);
    assert_eq!(report.state, UnitState::PartiallyDelivered);
    assert_eq!(report.missing_sources, vec![(Period::PostDiscontinuity, Source::Landsat)]);
    assert_eq!(report.steps, 10);
    assert_eq!(report.coverage.as_deref(), Some("single_source(sentinel2)"));

    let product = delivered(&output);
    assert_eq!(product.steps.iter().filter(|s| s.source == Source::Landsat).count(), 2);
    assert_eq!(product.global_attributes["coverage"], "single_source(sentinel2)");
    assert_eq!(product.global_attributes["missing"], "post_discontinuity/landsat");

    let entries = driver.failure_log().read_entries().unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].terminal_state, "partially_delivered");
    assert_eq!(entries[0].stage, "stacking");
    println!("✅ partial unit tagged single_source");
}

#[test]
fn test_empty_period_is_missing_not_fatal() {
    let _ = env_logger::builder().is_test(true).try_init();
    println!("🧪 No fields before the discontinuity");

    let tmp = TempDir::new().unwrap();
    let mut config = config(&tmp, &[UNIT]);
    config.start_date = date(2021, 1, 1);
    config.end_date = date(2021, 12, 31);
    config.sources.landsat.enabled = false;

    let mut store = MemoryFieldStore::new();
    for i in 0..4 {
        let start = date(2021, 9, 1) + Duration::days(i * 20);
        store.insert(UNIT, s2_field(start, 10, ("R083", "R083"), 1.0));
    }

    let driver = driver(config, store, &[UNIT]);
    let report = driver.run_unit(UNIT);

    println!("   state={} missing_periods={:?}", report.state, report.missing_periods);
    assert_eq!(report.state, UnitState::PartiallyDelivered);
    assert_eq!(report.missing_periods, vec![Period::PreDiscontinuity]);
    assert!(report.missing_sources.is_empty());
    assert_eq!(report.steps, 4);
    assert_eq!(report.coverage.as_deref(), Some("single_source(sentinel2)"));

    let entries = driver.failure_log().read_entries().unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].stage, "orbit_indexing");
    assert_eq!(entries[0].reason, "missing: pre_discontinuity");
    println!("✅ empty period recorded as missing");
}

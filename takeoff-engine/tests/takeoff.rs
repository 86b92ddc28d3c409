use std::f64::consts::PI;
use std::io::Write;
use std::path::PathBuf;

use takeoff_core::model::{QuantityItem, QuantityUnit};
use takeoff_core::units::{ScaleSource, UnitType};
use takeoff_engine::services::MemoryStore;
use takeoff_engine::{EngineError, TakeoffEngine, TakeoffReport};

fn fixture(name: &str) -> PathBuf {
    let mut path = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    path.push("tests/data");
    path.push(name);
    path
}

fn run(engine: &TakeoffEngine, name: &str) -> TakeoffReport {
    engine.run(&fixture(name)).expect("算量失败")
}

fn item<'a>(report: &'a TakeoffReport, material: &str, unit: QuantityUnit) -> &'a QuantityItem {
    report
        .items
        .iter()
        .find(|item| item.material == material && item.unit == unit)
        .unwrap_or_else(|| panic!("缺少条目 {material} ({unit})"))
}

fn temp_dxf(content: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::Builder::new()
        .suffix(".dxf")
        .tempfile()
        .expect("创建临时文件失败");
    file.write_all(content.as_bytes()).expect("写入临时文件失败");
    file
}

#[test]
fn millimetre_site_plan_produces_sorted_items() {
    let engine = TakeoffEngine::new();
    let report = run(&engine, "site_mm.dxf");

    assert_eq!(report.unit_type, UnitType::Millimeters);
    assert_eq!(report.scale_source, ScaleSource::Header);
    assert!((report.scale_factor - 0.001).abs() < 1e-12);

    let materials: Vec<&str> = report.items.iter().map(|item| item.material.as_str()).collect();
    assert_eq!(materials, vec!["0", "A-WALL", "Doors", "S-COLUMN", "S-SLAB"]);

    assert!((item(&report, "A-WALL", QuantityUnit::Meters).quantity - 7.0).abs() < 1e-9);
    assert_eq!(item(&report, "Doors", QuantityUnit::Pieces).quantity, 2.0);
    assert!((item(&report, "S-SLAB", QuantityUnit::SquareMeters).quantity - 20.0).abs() < 1e-9);
    let column = item(&report, "S-COLUMN", QuantityUnit::SquareMeters).quantity;
    assert!((column - PI * 0.09).abs() < 1e-9);
    assert!((item(&report, "0", QuantityUnit::Meters).quantity - 0.9).abs() < 1e-9);

    assert_eq!(report.stats.processed, 7);
    assert_eq!(report.stats.filtered, 2);
    assert_eq!(report.stats.errors, 0);
}

#[test]
fn block_definition_geometry_can_be_left_out() {
    let engine = TakeoffEngine::builder()
        .include_block_definitions(false)
        .build()
        .expect("构建引擎失败");
    let report = run(&engine, "site_mm.dxf");
    assert!(report.items.iter().all(|item| item.material != "0"));
    assert_eq!(report.stats.processed, 6);
}

#[test]
fn raw_drawing_units_are_kept_when_conversion_is_off() {
    let engine = TakeoffEngine::builder()
        .convert_to_meters(false)
        .build()
        .expect("构建引擎失败");
    let report = run(&engine, "site_mm.dxf");
    assert!((item(&report, "A-WALL", QuantityUnit::Meters).quantity - 7000.0).abs() < 1e-6);
}

#[test]
fn small_circles_and_annotation_layers_are_filtered() {
    let engine = TakeoffEngine::new();
    let report = run(&engine, "meters_plan.dxf");

    assert_eq!(report.unit_type, UnitType::Meters);
    assert_eq!(report.items.len(), 2);
    let pits = item(&report, "PITS", QuantityUnit::SquareMeters);
    assert!((pits.quantity - PI * 0.06 * 0.06).abs() < 1e-9);
    assert!((item(&report, "WALLS", QuantityUnit::Meters).quantity - 10.0).abs() < 1e-9);
    assert!(report.items.iter().all(|item| item.material != "A-ANNO-TEXT"));
    assert_eq!(report.stats.filtered, 2);
}

#[test]
fn drawing_without_entities_yields_empty_report() {
    let engine = TakeoffEngine::new();
    let report = run(&engine, "empty_drawing.dxf");
    assert!(report.is_empty());
    assert_eq!(report.unit_type, UnitType::Millimeters);
    assert_eq!(report.scale_source, ScaleSource::Default);
    assert_eq!(report.stats.processed, 0);
}

#[test]
fn door_block_extent_calibrates_unitless_drawing() {
    let engine = TakeoffEngine::new();
    let report = run(&engine, "unitless_door.dxf");

    assert_eq!(report.scale_source, ScaleSource::Calibration);
    assert_eq!(report.unit_type, UnitType::Centimeters);
    assert!((report.scale_factor - 0.01).abs() < 1e-9);
    assert!((item(&report, "WALL", QuantityUnit::Meters).quantity - 10.0).abs() < 1e-6);
    assert_eq!(item(&report, "Doors", QuantityUnit::Pieces).quantity, 1.0);
}

#[test]
fn explicit_calibration_wins_over_block_extents() {
    let engine = TakeoffEngine::builder()
        .calibration("DOOR", 0.9)
        .build()
        .expect("构建引擎失败");
    let report = run(&engine, "unitless_door.dxf");
    assert_eq!(report.unit_type, UnitType::Meters);
    assert!((report.scale_factor - 1.0).abs() < 1e-9);
}

#[test]
fn scale_callout_multiplies_the_default_unit() {
    let engine = TakeoffEngine::new();
    let report = run(&engine, "scale_callout.dxf");
    assert_eq!(report.scale_source, ScaleSource::TextCallout);
    assert!((report.scale_factor - 0.1).abs() < 1e-12);
    assert!((item(&report, "WALL", QuantityUnit::Meters).quantity - 5.0).abs() < 1e-9);
}

#[test]
fn header_scale_variable_overrides_factor() {
    let file = temp_dxf(
        "0\nSECTION\n2\nHEADER\n9\n$INSUNITS\n70\n4\n9\n$USERR1\n40\n0.5\n0\nENDSEC\n\
         0\nSECTION\n2\nENTITIES\n\
         0\nLINE\n8\nWALL\n10\n0\n20\n0\n11\n10\n21\n0\n\
         0\nENDSEC\n0\nEOF\n",
    );
    let engine = TakeoffEngine::new();
    let report = engine.run(file.path()).expect("算量失败");
    assert_eq!(report.unit_type, UnitType::Millimeters);
    assert!((report.scale_factor - 0.5).abs() < 1e-12);
    assert!((item(&report, "WALL", QuantityUnit::Meters).quantity - 5.0).abs() < 1e-9);
}

#[test]
fn duplicate_entities_are_counted_once_when_dedupe_is_on() {
    let content = "0\nSECTION\n2\nHEADER\n9\n$INSUNITS\n70\n6\n0\nENDSEC\n\
         0\nSECTION\n2\nENTITIES\n\
         0\nLINE\n8\nWALL\n10\n0\n20\n0\n11\n4\n21\n0\n\
         0\nLINE\n8\nWALL\n10\n0\n20\n0\n11\n4\n21\n0\n\
         0\nENDSEC\n0\nEOF\n";
    let file = temp_dxf(content);

    let plain = TakeoffEngine::new().run(file.path()).expect("算量失败");
    assert!((item(&plain, "WALL", QuantityUnit::Meters).quantity - 8.0).abs() < 1e-9);

    let engine = TakeoffEngine::builder()
        .dedupe_entities(true)
        .build()
        .expect("构建引擎失败");
    let report = engine.run(file.path()).expect("算量失败");
    assert!((item(&report, "WALL", QuantityUnit::Meters).quantity - 4.0).abs() < 1e-9);
    assert_eq!(report.stats.duplicates, 1);
}

#[test]
fn custom_exclusion_pattern_drops_layers() {
    let engine = TakeoffEngine::builder()
        .exclude_layers("S-.*")
        .build()
        .expect("构建引擎失败");
    let report = run(&engine, "site_mm.dxf");
    assert!(report.items.iter().all(|item| !item.material.starts_with("S-")));
}

#[test]
fn material_scale_and_overrides_apply() {
    let engine = TakeoffEngine::builder()
        .material_scale("A-WALL", 2.0)
        .block_mapping("DOOR-01", "Entrance Doors")
        .build()
        .expect("构建引擎失败");
    let report = run(&engine, "site_mm.dxf");
    assert!((item(&report, "A-WALL", QuantityUnit::Meters).quantity - 14.0).abs() < 1e-9);
    assert_eq!(item(&report, "Entrance Doors", QuantityUnit::Pieces).quantity, 2.0);
}

#[test]
fn runtime_mapping_updates_affect_later_runs() {
    let engine = TakeoffEngine::new();
    let before = run(&engine, "site_mm.dxf");
    assert!(before.items.iter().any(|item| item.material == "Doors"));

    engine.update_block_mapping("DOOR-01", "Steel Doors");
    let after = run(&engine, "site_mm.dxf");
    assert_eq!(item(&after, "Steel Doors", QuantityUnit::Pieces).quantity, 2.0);
}

#[test]
fn independent_runs_can_share_an_engine() {
    let engine = TakeoffEngine::new();
    let reports: Vec<TakeoffReport> = std::thread::scope(|scope| {
        let handles: Vec<_> = ["site_mm.dxf", "meters_plan.dxf", "site_mm.dxf"]
            .into_iter()
            .map(|name| {
                let engine = &engine;
                scope.spawn(move || run(engine, name))
            })
            .collect();
        handles
            .into_iter()
            .map(|handle| handle.join().expect("线程异常退出"))
            .collect()
    });
    assert_eq!(reports[0].items, reports[2].items);
    assert_eq!(reports[1].items.len(), 2);
}

#[test]
fn missing_file_is_reported_as_io_error() {
    let dir = tempfile::tempdir().expect("创建临时目录失败");
    let err = TakeoffEngine::new()
        .run(&dir.path().join("missing.dxf"))
        .expect_err("缺失文件应当报错");
    assert!(matches!(err, EngineError::Io(_)));
}

#[test]
fn report_serializes_with_unit_symbols() {
    let report = run(&TakeoffEngine::new(), "meters_plan.dxf");
    let json = serde_json::to_value(&report).expect("序列化报告失败");
    assert_eq!(json["unit_type"], "Meters");
    assert_eq!(json["scale_source"], "Header");
    assert_eq!(json["items"][0]["material"], "PITS");
    assert_eq!(json["items"][0]["unit"], "m²");
    assert_eq!(json["stats"]["processed"], 2);
}

#[test]
fn submitted_report_is_stored_with_source_name() {
    let engine = TakeoffEngine::new();
    let report = run(&engine, "site_mm.dxf");
    let store = MemoryStore::new();
    let id = engine
        .submit(&report, "estimator", &store, None)
        .expect("存档失败");
    assert_eq!(id, 1);
    let records = store.records();
    assert_eq!(records[0].source_name, "site_mm.dxf");
    assert_eq!(records[0].items, report.items);
}

#[test]
fn similar_layer_materials_merge_on_request() {
    let content = "0\nSECTION\n2\nHEADER\n9\n$INSUNITS\n70\n6\n0\nENDSEC\n\
         0\nSECTION\n2\nENTITIES\n\
         0\nLINE\n8\nA-WALL\n10\n0\n20\n0\n11\n4\n21\n0\n\
         0\nLINE\n8\nA-2000\n10\n0\n20\n5\n11\n6\n21\n5\n\
         0\nENDSEC\n0\nEOF\n";
    let file = temp_dxf(content);
    let engine = TakeoffEngine::builder()
        .merge_similar_layers(true)
        .build()
        .expect("构建引擎失败");
    let report = engine.run(file.path()).expect("算量失败");
    assert_eq!(report.items.len(), 1);
    assert!((report.items[0].quantity - 10.0).abs() < 1e-9);
}

#[test]
fn distinct_blocks_of_one_material_are_summed() {
    let content = "0\nSECTION\n2\nHEADER\n9\n$INSUNITS\n70\n6\n0\nENDSEC\n\
         0\nSECTION\n2\nENTITIES\n\
         0\nINSERT\n8\nA-DOOR\n2\nDOOR-01\n10\n0\n20\n0\n41\n1\n42\n1\n\
         0\nINSERT\n8\nA-DOOR\n2\nDOOR-02\n10\n5\n20\n0\n41\n1\n42\n1\n\
         0\nENDSEC\n0\nEOF\n";
    let file = temp_dxf(content);
    let report = TakeoffEngine::new().run(file.path()).expect("算量失败");
    assert_eq!(
        report.items,
        vec![QuantityItem::new("Doors", 2.0, QuantityUnit::Pieces)]
    );
    assert_eq!(report.stats.aggregates, 2);
}

#[test]
fn dedupe_keeps_different_blocks_inserted_at_one_point() {
    let content = "0\nSECTION\n2\nHEADER\n9\n$INSUNITS\n70\n6\n0\nENDSEC\n\
         0\nSECTION\n2\nENTITIES\n\
         0\nINSERT\n8\nA-FIXT\n2\nDOOR-01\n10\n0\n20\n0\n41\n1\n42\n1\n\
         0\nINSERT\n8\nA-FIXT\n2\nSINK-01\n10\n0\n20\n0\n41\n1\n42\n1\n\
         0\nINSERT\n8\nA-FIXT\n2\nSINK-01\n10\n0\n20\n0\n41\n1\n42\n1\n\
         0\nENDSEC\n0\nEOF\n";
    let file = temp_dxf(content);
    let engine = TakeoffEngine::builder()
        .dedupe_entities(true)
        .build()
        .expect("构建引擎失败");
    let report = engine.run(file.path()).expect("算量失败");
    assert_eq!(item(&report, "Doors", QuantityUnit::Pieces).quantity, 1.0);
    assert_eq!(item(&report, "Sinks", QuantityUnit::Pieces).quantity, 1.0);
    assert_eq!(report.stats.duplicates, 1);
}

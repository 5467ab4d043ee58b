//! End-to-end tests with the built-in extrusion engine and on-disk packages.

use std::sync::Arc;

use lotgen_core::{AttributeValue, GenerationOptions, InitialShape, ReportValue, ReportVerbosity, Ring};
use lotgen_runtime::{
    EngineLog, ExtrudeEngine, GenerationScheduler, LogLevel, ManifestPackageProvider, PackageRegistry,
    ProcEngineClient, RulePackageProvider, RuntimeConfig, StaticPackageProvider,
};

fn scheduler(provider: impl RulePackageProvider + 'static) -> GenerationScheduler {
    let client = ProcEngineClient::new(Arc::new(ExtrudeEngine::new()), Arc::new(PackageRegistry::new(provider)), 2)
        .unwrap();
    GenerationScheduler::new(Arc::new(client), &RuntimeConfig::default()).unwrap()
}

fn simple_extrude() -> StaticPackageProvider {
    StaticPackageProvider::new().with_package(
        "simple_extrude",
        "Default$Lot",
        [("Default$height".to_owned(), AttributeValue::Float(5.0))],
    )
}

fn triangle() -> InitialShape {
    InitialShape::new(
        Ring::new([[0.0, 0.0, 0.0], [10.0, 0.0, 0.0], [0.0, 10.0, 0.0]]),
        "simple_extrude",
        "Default$Lot",
    )
}

#[test]
fn test_triangle_lot_extrudes_to_height() {
    let scheduler = scheduler(simple_extrude());
    let result = scheduler.generate_blocking(&triangle(), 42, GenerationOptions::default()).unwrap();

    let mesh = result.mesh();
    assert!(!mesh.is_empty());
    assert!(mesh.positions.iter().all(|p| (0.0..=5.0).contains(&p[2])));
    assert!(mesh.positions.iter().any(|p| p[2] == 5.0));
    assert_eq!(result.materials().len(), 1);
    // Three walls and the roof.
    assert_eq!(mesh.faces.len(), 4);
    assert_eq!(result.report("height"), Some(&ReportValue::Float(5.0)));
    assert_eq!(result.report("footprint_area"), Some(&ReportValue::Float(50.0)));
}

#[test]
fn test_isosceles_lot_with_explicit_height() {
    let scheduler = scheduler(simple_extrude());
    let mut lot = InitialShape::new(
        Ring::new([[0.0, 0.0, 0.0], [10.0, 0.0, 0.0], [5.0, 10.0, 0.0]]),
        "simple_extrude",
        "Default$Lot",
    );
    lot.attributes.set_override("Default$height", 5.0).unwrap();

    let result = scheduler.generate_blocking(&lot, 42, GenerationOptions::default()).unwrap();
    let mesh = result.mesh();
    assert!(!mesh.is_empty());
    assert!(mesh.positions.iter().all(|p| (0.0..=5.0).contains(&p[2])));
    let (min, max) = mesh.bounds().unwrap();
    assert_eq!((min[2], max[2]), (0.0, 5.0));
    assert_eq!(result.materials().len(), 1);
    assert_eq!(result.report("height"), Some(&ReportValue::Float(5.0)));
}

#[test]
fn test_override_changes_fingerprint_and_geometry() {
    let scheduler = scheduler(simple_extrude());
    let low = scheduler.generate_blocking(&triangle(), 42, GenerationOptions::default()).unwrap();

    let mut tall = triangle();
    tall.attributes.set_override("Default$height", 12.0).unwrap();
    let high = scheduler.generate_blocking(&tall, 42, GenerationOptions::default()).unwrap();

    assert!(!Arc::ptr_eq(&low, &high));
    let (_, max) = high.mesh().bounds().unwrap();
    assert_eq!(max[2], 12.0);
    assert_eq!(high.report("floor_count"), Some(&ReportValue::Float(4.0)));
}

#[test]
fn test_lot_with_courtyard() {
    let scheduler = scheduler(simple_extrude());
    let lot = InitialShape::new(
        Ring::new([[0.0, 0.0, 0.0], [20.0, 0.0, 0.0], [20.0, 20.0, 0.0], [0.0, 20.0, 0.0]]),
        "simple_extrude",
        "Default$Lot",
    )
    .with_hole(Ring::new([[5.0, 5.0, 0.0], [5.0, 15.0, 0.0], [15.0, 15.0, 0.0], [15.0, 5.0, 0.0]]));

    let result = scheduler.generate_blocking(&lot, 1, GenerationOptions::default()).unwrap();
    // Four outer walls, four courtyard walls and the roof.
    assert_eq!(result.mesh().faces.len(), 9);
    assert_eq!(result.report("footprint_area"), Some(&ReportValue::Float(300.0)));
}

#[test]
fn test_evaluate_attributes() {
    let scheduler = scheduler(simple_extrude());
    let mut shape = triangle();
    shape.attributes.set_override("Default$height", 7.5).unwrap();

    let attributes = scheduler.evaluate_attributes(&shape, 42).unwrap();
    assert_eq!(attributes, vec![("Default$height".to_owned(), AttributeValue::Float(7.5))]);
    assert_eq!(scheduler.stats().client.native_calls, 1);
}

#[test]
fn test_diagnostics_need_verbosity() {
    let scheduler = scheduler(simple_extrude());
    let mut shape = triangle();
    shape.attributes.set_override("Default$height", -1.0).unwrap();

    let quiet = scheduler.generate_blocking(&shape, 1, GenerationOptions::default()).unwrap();
    assert_eq!(quiet.diagnostics(lotgen_core::Severity::Info).count(), 0);

    let options = GenerationOptions {
        report_verbosity: ReportVerbosity::All,
        ..GenerationOptions::default()
    };
    let loud = scheduler.generate_blocking(&shape, 1, options).unwrap();
    assert_eq!(loud.diagnostics(lotgen_core::Severity::Warning).count(), 1);
    assert!(!loud.has_errors());
}

#[test]
fn test_engine_log_collects_messages() {
    let log = Arc::new(EngineLog::with_min_level(16, LogLevel::Debug));
    let client = ProcEngineClient::new(
        Arc::new(ExtrudeEngine::new()),
        Arc::new(PackageRegistry::new(simple_extrude())),
        1,
    )
    .unwrap()
    .with_log(Arc::clone(&log));

    let request = lotgen_core::GenerationRequest::new(&triangle(), 1, GenerationOptions::default());
    client.generate(&request).unwrap();

    let messages = log.pop_messages();
    assert_eq!(messages.len(), 1);
    assert!(messages[0].message.contains("Default$Lot"));
    assert!(log.is_empty());
}

#[test]
fn test_manifest_packages_from_disk() {
    let root = std::env::temp_dir().join(format!("lotgen_manifests_{}", std::process::id()));
    std::fs::create_dir_all(&root).unwrap();
    std::fs::write(
        root.join("tower.toml"),
        r#"
rule_file = "rules/tower.cga"
start_rule = "Default$Lot"

[[attributes]]
name = "Default$height"
type = "float"
default = 30.0

[[attributes]]
name = "Default$window_count"
type = "float"
default = 3.0
"#,
    )
    .unwrap();

    let scheduler = scheduler(ManifestPackageProvider::new(&root));
    let mut shape = triangle();
    shape.package = "tower".into();
    let result = scheduler.generate_blocking(&shape, 3, GenerationOptions::default()).unwrap();

    let (_, max) = result.mesh().bounds().unwrap();
    assert_eq!(max[2], 30.0);
    assert_eq!(result.instances().len(), 3);

    // Editing the manifest shows up after invalidation.
    std::fs::write(
        root.join("tower.toml"),
        "rule_file = \"rules/tower.cga\"\nstart_rule = \"Default$Lot\"\n\n[[attributes]]\nname = \"Default$height\"\ntype = \"float\"\ndefault = 45.0\n",
    )
    .unwrap();
    scheduler.invalidate_rule_package(&shape.package);
    let result = scheduler.generate_blocking(&shape, 3, GenerationOptions::default()).unwrap();
    let (_, max) = result.mesh().bounds().unwrap();
    assert_eq!(max[2], 45.0);

    std::fs::remove_dir_all(&root).ok();
}

#[test]
fn test_unknown_package_is_rule_load_error() {
    let scheduler = scheduler(simple_extrude());
    let mut shape = triangle();
    shape.package = "missing".into();
    let err = scheduler.generate_blocking(&shape, 1, GenerationOptions::default()).unwrap_err();
    assert!(matches!(err, lotgen_core::GenerationError::RuleLoad { .. }));
}

//! Runs driven entirely by YAML configuration.

mod common;

use common::*;
use dataslice::{Config, Orchestrator, SliceError, StorageAdapter};

fn config_yaml(src: &std::path::Path, dst: &std::path::Path, extra_run: &str) -> String {
    format!(
        r#"
source:
  type: csv
  directory: {src}
target:
  type: csv
  directory: {dst}
run:
  check_references: true
{extra_run}
entities:
  - name: Tenant
    fields:
      - {{ name: id, kind: big_int }}
      - {{ name: name, kind: text, nullable: true }}
  - name: Shop
    fields:
      - {{ name: id, kind: big_int }}
      - {{ name: tenant_id, kind: big_int }}
      - {{ name: name, kind: text, nullable: true }}
    relations:
      - {{ field: tenant_id, target: Tenant }}
jobs:
  - entity: Shop
    exclude: [name]
  - entity: Tenant
"#,
        src = src.display(),
        dst = dst.display(),
        extra_run = extra_run,
    )
}

#[tokio::test]
async fn test_yaml_configured_export() {
    init_tracing();
    let src = tempfile::tempdir().unwrap();
    let dst = tempfile::tempdir().unwrap();
    seed_shops(src.path());

    let config = Config::from_yaml(&config_yaml(src.path(), dst.path(), "")).unwrap();
    let registry = config.registry().unwrap();
    let source = config.source.connect().await.unwrap();
    let target = config.target.connect().await.unwrap();
    assert_eq!(source.kind(), "csv");

    let result = Orchestrator::new(&registry)
        .run(&*source, &*target, config.jobs(), config.run_options().unwrap())
        .await
        .unwrap();

    assert_eq!(result.rows_total, 4);
    let (header, _) = read_csv(&dst.path().join("shop.csv"));
    assert_eq!(header, vec!["id", "tenant_id"]);

    let json = result.to_json().unwrap();
    assert!(json.contains("\"status\": \"completed\""));
}

#[tokio::test]
async fn test_yaml_remapping_with_lineage() {
    let src = tempfile::tempdir().unwrap();
    let dst = tempfile::tempdir().unwrap();
    let meta = tempfile::tempdir().unwrap();
    seed_shops(src.path());
    let lineage = meta.path().join("lineage.json");

    let extra = format!(
        "  lineage_path: {}\n  remapping:\n    default: {{ strategy: sequential }}\n",
        lineage.display()
    );
    let config = Config::from_yaml(&config_yaml(src.path(), dst.path(), &extra)).unwrap();
    let registry = config.registry().unwrap();
    let source = config.source.connect().await.unwrap();
    let target = config.target.connect().await.unwrap();

    Orchestrator::new(&registry)
        .run(&*source, &*target, config.jobs(), config.run_options().unwrap())
        .await
        .unwrap();
    assert!(lineage.exists());

    // Lineage seeds presets for the next run.
    let options = config.run_options().unwrap();
    let seeded = options.remapping.unwrap().seeded_mappings();
    assert_eq!(
        seeded.resolve(&"Tenant".into(), "1000"),
        Some("1")
    );
}

#[test]
fn test_invalid_yaml_rejected() {
    let err = Config::from_yaml("source: { type: sqlite }").unwrap_err();
    assert!(matches!(err, SliceError::Yaml(_)));
}

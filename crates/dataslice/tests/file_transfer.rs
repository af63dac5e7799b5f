//! End-to-end transfers between CSV directories.
//!
//! These tests drive the orchestrator against real files in temporary
//! directories: ordering, exports, round trips, idempotence and the
//! failure paths that carry a partial result.

mod common;

use std::sync::{Arc, Mutex};

use common::*;
use dataslice::integrity::tenant_filter;
use dataslice::{
    EntityType, Orchestrator, Progress, RunOptions, RunStatus, SliceError, TransferJob,
};
use tokio_util::sync::CancellationToken;

// =============================================================================
// Ordering and export
// =============================================================================

#[tokio::test]
async fn test_jobs_are_resequenced_by_dependency() {
    init_tracing();
    let registry = shop_registry();
    let src = tempfile::tempdir().unwrap();
    let dst = tempfile::tempdir().unwrap();
    seed_shops(src.path());

    let order = Arc::new(Mutex::new(Vec::new()));
    let seen = order.clone();
    let result = Orchestrator::new(&registry)
        .run(
            &adapter(src.path()),
            &adapter(dst.path()),
            vec![TransferJob::new("Shop"), TransferJob::new("Tenant")],
            RunOptions::default().with_progress(move |p: &Progress| {
                seen.lock().unwrap().push(p.entity.to_string());
            }),
        )
        .await
        .unwrap();

    assert_eq!(*order.lock().unwrap(), vec!["Tenant", "Shop"]);
    let executed: Vec<&str> = result.jobs.iter().map(|j| j.entity.as_str()).collect();
    assert_eq!(executed, vec!["Tenant", "Shop"]);
}

#[tokio::test]
async fn test_export_writes_one_file_per_entity() {
    init_tracing();
    let registry = shop_registry();
    let src = tempfile::tempdir().unwrap();
    let dst = tempfile::tempdir().unwrap();
    seed_shops(src.path());

    let result = Orchestrator::new(&registry)
        .run(
            &adapter(src.path()),
            &adapter(dst.path()),
            vec![TransferJob::new("Tenant"), TransferJob::new("Shop")],
            RunOptions::default(),
        )
        .await
        .unwrap();

    assert!(result.success);
    assert_eq!(result.rows_total, 4);
    assert_eq!(result.job(&EntityType::new("Shop")).unwrap().rows, 3);

    let (tenant_header, tenants) = read_csv(&dst.path().join("tenant.csv"));
    assert_eq!(tenant_header, vec!["id", "name"]);
    assert_eq!(tenants.len(), 1);

    let tenant_id = &tenants[0][0];
    let shop_tenants = column(&dst.path().join("shop.csv"), "tenant_id");
    assert_eq!(shop_tenants.len(), 3);
    assert!(shop_tenants.iter().all(|t| t == tenant_id));

    let names = column(&dst.path().join("shop.csv"), "name");
    assert_eq!(names[2], "East, Annex");
}

#[tokio::test]
async fn test_tenant_filter_exports_one_tenant() {
    let registry = shop_registry();
    let src = tempfile::tempdir().unwrap();
    let dst = tempfile::tempdir().unwrap();
    write_file(src.path(), "tenant.csv", "id,name\n1000,Acme\n2000,Globex\n");
    write_file(
        src.path(),
        "shop.csv",
        "id,tenant_id,name\n1,1000,North\n2,2000,South\n3,1000,East\n",
    );

    let tenant = EntityType::new("Tenant");
    let result = Orchestrator::new(&registry)
        .run(
            &adapter(src.path()),
            &adapter(dst.path()),
            vec![
                TransferJob::new("Tenant").with_selection(dataslice::Selection::Filter(
                    dataslice::Predicate::eq("id", "1000"),
                )),
                TransferJob::new("Shop").with_selection(tenant_filter(&tenant, "1000")),
            ],
            RunOptions::default(),
        )
        .await
        .unwrap();

    assert_eq!(result.rows_total, 3);
    assert_eq!(column(&dst.path().join("shop.csv"), "id"), vec!["1", "3"]);
}

#[tokio::test]
async fn test_null_and_empty_cells_survive() {
    let registry = shop_registry();
    let src = tempfile::tempdir().unwrap();
    let dst = tempfile::tempdir().unwrap();
    write_file(src.path(), "tenant.csv", "id,name\n1,\\N\n2,\n");

    Orchestrator::new(&registry)
        .run(
            &adapter(src.path()),
            &adapter(dst.path()),
            vec![TransferJob::new("Tenant")],
            RunOptions::default(),
        )
        .await
        .unwrap();

    let content = std::fs::read_to_string(dst.path().join("tenant.csv")).unwrap();
    assert_eq!(content, "id,name\n1,\\N\n2,\n");
}

// =============================================================================
// Round trip and idempotence
// =============================================================================

#[tokio::test]
async fn test_round_trip_is_byte_identical() {
    let registry = shop_registry();
    let src = tempfile::tempdir().unwrap();
    let first = tempfile::tempdir().unwrap();
    let second = tempfile::tempdir().unwrap();
    seed_shops(src.path());

    let jobs = || vec![TransferJob::new("Tenant"), TransferJob::new("Shop")];
    let orchestrator = Orchestrator::new(&registry);
    orchestrator
        .run(
            &adapter(src.path()),
            &adapter(first.path()),
            jobs(),
            RunOptions::default(),
        )
        .await
        .unwrap();
    orchestrator
        .run(
            &adapter(first.path()),
            &adapter(second.path()),
            jobs(),
            RunOptions::default(),
        )
        .await
        .unwrap();

    for name in ["tenant.csv", "shop.csv"] {
        let a = std::fs::read(first.path().join(name)).unwrap();
        let b = std::fs::read(second.path().join(name)).unwrap();
        assert_eq!(a, b, "{name} differs after round trip");
    }
}

#[tokio::test]
async fn test_second_run_without_overwrite_fails_and_keeps_files() {
    let registry = shop_registry();
    let src = tempfile::tempdir().unwrap();
    let dst = tempfile::tempdir().unwrap();
    seed_shops(src.path());

    let jobs = || vec![TransferJob::new("Tenant"), TransferJob::new("Shop")];
    let orchestrator = Orchestrator::new(&registry);
    orchestrator
        .run(
            &adapter(src.path()),
            &adapter(dst.path()),
            jobs(),
            RunOptions::default(),
        )
        .await
        .unwrap();
    let before = std::fs::read(dst.path().join("shop.csv")).unwrap();

    write_file(src.path(), "shop.csv", "id,tenant_id,name\n9,1000,Changed\n");
    let err = orchestrator
        .run(
            &adapter(src.path()),
            &adapter(dst.path()),
            jobs(),
            RunOptions::default(),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, SliceError::FileExists(_)), "got {err}");
    assert_eq!(std::fs::read(dst.path().join("shop.csv")).unwrap(), before);
}

#[tokio::test]
async fn test_second_run_with_overwrite_replaces_files() {
    let registry = shop_registry();
    let src = tempfile::tempdir().unwrap();
    let dst = tempfile::tempdir().unwrap();
    seed_shops(src.path());

    let jobs = || vec![TransferJob::new("Tenant"), TransferJob::new("Shop")];
    let orchestrator = Orchestrator::new(&registry);
    orchestrator
        .run(
            &adapter(src.path()),
            &overwriting_adapter(dst.path()),
            jobs(),
            RunOptions::default(),
        )
        .await
        .unwrap();

    write_file(src.path(), "shop.csv", "id,tenant_id,name\n9,1000,Changed\n");
    orchestrator
        .run(
            &adapter(src.path()),
            &overwriting_adapter(dst.path()),
            jobs(),
            RunOptions::default(),
        )
        .await
        .unwrap();

    assert_eq!(
        std::fs::read_to_string(dst.path().join("shop.csv")).unwrap(),
        "id,tenant_id,name\n9,1000,Changed\n"
    );
}

// =============================================================================
// Failure paths
// =============================================================================

#[tokio::test]
async fn test_failure_aborts_with_partial_result() {
    init_tracing();
    let registry = shop_registry();
    let src = tempfile::tempdir().unwrap();
    let dst = tempfile::tempdir().unwrap();
    write_file(src.path(), "tenant.csv", "id,name\n1000,Acme\n");

    let err = Orchestrator::new(&registry)
        .run(
            &adapter(src.path()),
            &adapter(dst.path()),
            vec![TransferJob::new("Tenant"), TransferJob::new("Shop")],
            RunOptions::default(),
        )
        .await
        .unwrap_err();

    match &err {
        SliceError::Aborted { entity, source, .. } => {
            assert_eq!(entity.as_str(), "Shop");
            assert!(matches!(**source, SliceError::SourceNotFound(_)));
        }
        other => panic!("unexpected error: {other}"),
    }
    let partial = err.partial_result().unwrap();
    assert_eq!(partial.status, RunStatus::Failed);
    assert_eq!(partial.jobs_completed(), 1);
    assert_eq!(partial.jobs_total, 2);
    assert!(err.format_detailed().contains("Completed 1 of 2 jobs"));

    assert!(dst.path().join("tenant.csv").exists());
    assert!(!dst.path().join("shop.csv").exists());
    assert!(!dst.path().join("shop.csv.partial").exists());
}

#[tokio::test]
async fn test_missing_dependency_fails_before_writing() {
    let registry = shop_registry();
    let src = tempfile::tempdir().unwrap();
    let dst = tempfile::tempdir().unwrap();
    seed_shops(src.path());

    let err = Orchestrator::new(&registry)
        .run(
            &adapter(src.path()),
            &adapter(dst.path()),
            vec![TransferJob::new("Shop")],
            RunOptions::default(),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, SliceError::UnresolvedDependency { .. }));
    assert!(err.is_validation());
    assert!(!dst.path().join("shop.csv").exists());
}

#[tokio::test]
async fn test_reference_checks_can_be_disabled() {
    let registry = shop_registry();
    let src = tempfile::tempdir().unwrap();
    let dst = tempfile::tempdir().unwrap();
    seed_shops(src.path());

    let result = Orchestrator::new(&registry)
        .run(
            &adapter(src.path()),
            &adapter(dst.path()),
            vec![TransferJob::new("Shop")],
            RunOptions::default().with_reference_checks(false),
        )
        .await
        .unwrap();
    assert_eq!(result.rows_total, 3);
}

#[tokio::test]
async fn test_cancellation_between_jobs() {
    let registry = shop_registry();
    let src = tempfile::tempdir().unwrap();
    let dst = tempfile::tempdir().unwrap();
    seed_shops(src.path());

    let token = CancellationToken::new();
    let trigger = token.clone();
    let err = Orchestrator::new(&registry)
        .run(
            &adapter(src.path()),
            &adapter(dst.path()),
            vec![TransferJob::new("Tenant"), TransferJob::new("Shop")],
            RunOptions::default()
                .with_cancellation(token)
                .with_progress(move |_: &Progress| trigger.cancel()),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, SliceError::Cancelled { .. }));
    let partial = err.partial_result().unwrap();
    assert_eq!(partial.status, RunStatus::Cancelled);
    assert_eq!(partial.jobs_completed(), 1);
    assert!(dst.path().join("tenant.csv").exists());
    assert!(!dst.path().join("shop.csv").exists());
}

#[tokio::test]
async fn test_excluded_field_is_not_written() {
    let registry = shop_registry();
    let src = tempfile::tempdir().unwrap();
    let dst = tempfile::tempdir().unwrap();
    seed_shops(src.path());

    Orchestrator::new(&registry)
        .run(
            &adapter(src.path()),
            &adapter(dst.path()),
            vec![TransferJob::new("Tenant").exclude("name")],
            RunOptions::default(),
        )
        .await
        .unwrap();

    let (header, rows) = read_csv(&dst.path().join("tenant.csv"));
    assert_eq!(header, vec!["id"]);
    assert_eq!(rows, vec![vec!["1000".to_string()]]);
}

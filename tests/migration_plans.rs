use std::sync::Arc;
use std::time::Duration;

use pgperf::catalog::{ColumnInfo, StaticCatalog, TableStat};
use pgperf::config::MigrationConfig;
use pgperf::error::PerfError;
use pgperf::migration::{MigrationOptimizer, RiskLevel};
use tokio_util::sync::CancellationToken;

fn catalog(rows: i64) -> Arc<StaticCatalog> {
    Arc::new(StaticCatalog::new(
        vec![TableStat {
            schema: "public".into(),
            table: "recipes".into(),
            row_estimate: rows,
            total_bytes: 0,
            seq_scans: 0,
            index_scans: 0,
        }],
        Vec::new(),
        vec![ColumnInfo {
            schema: "public".into(),
            table: "recipes".into(),
            column: "rating".into(),
            data_type: "integer".into(),
            nullable: true,
        }],
    ))
}

fn optimizer(catalog: Arc<StaticCatalog>) -> MigrationOptimizer {
    MigrationOptimizer::new(
        catalog,
        &MigrationConfig::default(),
        Duration::from_secs(5),
    )
}

#[tokio::test]
async fn widening_varchar_to_text_is_a_single_statement() {
    let plan = optimizer(catalog(50_000))
        .optimize_change_column_type("recipes", "title", "varchar(255)", "text")
        .await;

    assert!(!plan.is_phased());
    assert_eq!(plan.safety.risk, RiskLevel::Low);
    assert!(!plan.timing.requires_maintenance_window);
    assert_eq!(plan.steps().len(), 1);
}

#[tokio::test]
async fn integer_to_jsonb_needs_four_phases_and_a_window() {
    let plan = optimizer(catalog(12_000_000))
        .optimize_change_column_type("recipes", "rating", "integer", "jsonb")
        .await;

    assert!(plan.is_phased());
    let names: Vec<String> = plan.steps().into_iter().map(|(name, _)| name).collect();
    assert_eq!(
        names,
        ["add_temp_column", "copy_data", "drop_old_column", "rename_column"]
    );
    assert_eq!(plan.safety.risk, RiskLevel::High);
    assert!(plan.timing.requires_maintenance_window);
}

#[tokio::test]
async fn failed_phase_reports_partial_progress() {
    let catalog = catalog(1_000);
    let planner = optimizer(Arc::clone(&catalog));
    let plan = planner
        .optimize_change_column_type("recipes", "rating", "integer", "jsonb")
        .await;

    catalog.fail_on("UPDATE recipes");
    let err = planner
        .execute(&plan, catalog.as_ref(), &CancellationToken::new())
        .await
        .unwrap_err();

    match err {
        PerfError::PartialMigration {
            phase_index,
            completed,
            ..
        } => {
            assert_eq!(phase_index, 2);
            assert_eq!(completed, 1);
        }
        other => panic!("expected partial migration, got {other:?}"),
    }
    assert_eq!(catalog.executed().len(), 1);
}

#[tokio::test]
async fn add_column_runs_to_completion() {
    let catalog = catalog(1_000);
    let planner = optimizer(Arc::clone(&catalog));
    let plan = planner
        .optimize_add_column("recipes", "servings", "integer", true, None)
        .await;

    let report = planner
        .execute(&plan, catalog.as_ref(), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(report.completed_phases.len(), 1);
    assert!(catalog.executed()[0].contains("ADD COLUMN servings integer"));
}

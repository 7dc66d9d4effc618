use std::sync::Arc;
use std::sync::LazyLock;
use std::time::{Duration, Instant};

use regex::Regex;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::catalog::{CatalogSource, SqlExecutor};
use crate::config::MigrationConfig;
use crate::error::{PerfError, with_timeout};
use crate::sql;

const SMALL_TABLE_ROWS: i64 = 100_000;
const MEDIUM_TABLE_ROWS: i64 = 1_000_000;
const MAINTENANCE_WINDOW_ROWS: i64 = 10_000_000;

static BLACKLIST: LazyLock<Vec<(Regex, &'static str)>> = LazyLock::new(|| {
    [
        (r"(?i)\bdrop\s+database\b", "DROP DATABASE is never allowed"),
        (r"(?i)\bdrop\s+schema\b", "DROP SCHEMA is never allowed"),
        (r"(?i)^\s*truncate\b", "TRUNCATE is never allowed"),
    ]
    .into_iter()
    .map(|(pattern, reason)| (Regex::new(pattern).expect("regex"), reason))
    .collect()
});

static WHERE_CLAUSE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bwhere\b").expect("regex"));

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LockLevel {
    /// Non-blocking build; reads and writes continue.
    None,
    /// Blocks writes, allows reads.
    Exclusive,
    /// Blocks everything on the table.
    AccessExclusive,
}

impl LockLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            LockLevel::None => "none",
            LockLevel::Exclusive => "exclusive",
            LockLevel::AccessExclusive => "access_exclusive",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct PerformanceImpact {
    pub lock_type: LockLevel,
    pub estimated_duration_secs: u64,
    pub concurrent_safe: bool,
    pub estimated_rows: i64,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SafetyAssessment {
    pub risk: RiskLevel,
    pub breaking_change: bool,
    pub data_loss: bool,
    pub reversible: bool,
    pub preconditions: Vec<String>,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct MigrationPhase {
    pub name: String,
    pub sql: String,
    pub lock_type: LockLevel,
    pub estimated_duration_secs: u64,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ExecutionTiming {
    pub requires_maintenance_window: bool,
    pub phases: Vec<MigrationPhase>,
}

/// A planned schema change. Either `sql` is set, or `timing.phases` lists the steps.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct OptimizedMigration {
    pub name: String,
    pub sql: Option<String>,
    pub impact: PerformanceImpact,
    pub safety: SafetyAssessment,
    pub timing: ExecutionTiming,
    pub rollback_sql: String,
}

impl OptimizedMigration {
    pub fn is_phased(&self) -> bool {
        !self.timing.phases.is_empty()
    }

    /// Steps in execution order as (name, sql).
    pub fn steps(&self) -> Vec<(String, String)> {
        if self.is_phased() {
            self.timing
                .phases
                .iter()
                .map(|p| (p.name.clone(), p.sql.clone()))
                .collect()
        } else {
            self.sql
                .iter()
                .map(|sql| ("apply".to_string(), sql.clone()))
                .collect()
        }
    }

    /// Operator-facing summary, including the rollback caveats.
    pub fn to_text(&self) -> String {
        let mut out = format!(
            "Migration {}\n  risk: {:?}  lock: {}  est: {}s  maintenance window: {}\n",
            self.name,
            self.safety.risk,
            self.impact.lock_type.as_str(),
            self.impact.estimated_duration_secs,
            if self.timing.requires_maintenance_window {
                "required"
            } else {
                "no"
            }
        );
        for (index, (name, sql)) in self.steps().into_iter().enumerate() {
            out.push_str(&format!("  {}. {}: {}\n", index + 1, name, sql));
        }
        for precondition in &self.safety.preconditions {
            out.push_str(&format!("  precondition: {precondition}\n"));
        }
        for warning in &self.safety.warnings {
            out.push_str(&format!("  WARNING: {warning}\n"));
        }
        if !self.safety.reversible {
            out.push_str("  ROLLBACK IS ADVISORY: data changed by this migration cannot be restored\n");
        }
        out.push_str(&format!("  rollback:\n{}\n", indent(&self.rollback_sql)));
        out
    }
}

fn indent(text: &str) -> String {
    text.lines()
        .map(|line| format!("    {line}"))
        .collect::<Vec<_>>()
        .join("\n")
}

#[derive(Debug, Clone, Serialize)]
pub struct MigrationReport {
    pub name: String,
    pub completed_phases: Vec<String>,
    pub duration_ms: f64,
    pub warnings: Vec<String>,
}

/// Expected duration for a table rewrite or scan at a given size.
pub fn duration_tier(rows: i64) -> Duration {
    if rows < SMALL_TABLE_ROWS {
        Duration::from_secs(5)
    } else if rows < MEDIUM_TABLE_ROWS {
        Duration::from_secs(30)
    } else {
        Duration::from_secs(120)
    }
}

fn needs_maintenance_window(rows: i64) -> bool {
    rows >= MAINTENANCE_WINDOW_ROWS
}

/// Canonical base type: lowercase, aliases folded, length/precision modifiers removed.
pub fn normalize_type(raw: &str) -> String {
    let lower = raw.trim().to_ascii_lowercase();
    let base = lower.split('(').next().unwrap_or("").trim().to_string();
    match base.as_str() {
        "character varying" | "varchar" => "varchar",
        "character" | "char" | "bpchar" => "char",
        "int" | "int4" | "integer" => "integer",
        "int2" | "smallint" => "smallint",
        "int8" | "bigint" => "bigint",
        "float4" | "real" => "real",
        "float8" | "double precision" => "double precision",
        "decimal" | "numeric" => "numeric",
        "timestamp" | "timestamp without time zone" => "timestamp",
        "timestamptz" | "timestamp with time zone" => "timestamptz",
        "bool" | "boolean" => "boolean",
        other => return other.to_string(),
    }
    .to_string()
}

const COMPATIBLE_CHANGES: &[(&str, &str)] = &[
    ("varchar", "text"),
    ("char", "varchar"),
    ("char", "text"),
    ("smallint", "integer"),
    ("smallint", "bigint"),
    ("integer", "bigint"),
    ("real", "double precision"),
    ("integer", "numeric"),
    ("bigint", "numeric"),
    ("timestamp", "timestamptz"),
];

/// Whether a type change can be applied in place with a single ALTER.
pub fn is_compatible_change(from: &str, to: &str) -> bool {
    let from = normalize_type(from);
    let to = normalize_type(to);
    from == to
        || COMPATIBLE_CHANGES
            .iter()
            .any(|(a, b)| *a == from.as_str() && *b == to.as_str())
}

/// Reject statements that must never run unattended. Returns non-blocking warnings otherwise.
pub fn validate_migration(migration: &OptimizedMigration) -> Result<Vec<String>, PerfError> {
    for (phase, statement_block) in migration.steps() {
        for statement in split_statements(&statement_block) {
            for (pattern, reason) in BLACKLIST.iter() {
                if pattern.is_match(&statement) {
                    return Err(PerfError::Validation(format!(
                        "{} ({reason}) in step `{phase}`",
                        migration.name
                    )));
                }
            }
            let kind = sql::statement_kind(&statement);
            let scoped = WHERE_CLAUSE.is_match(&statement);
            if matches!(kind, sql::StatementKind::Update | sql::StatementKind::Delete) && !scoped {
                return Err(PerfError::Validation(format!(
                    "{} (unscoped {} without WHERE) in step `{phase}`",
                    migration.name,
                    kind.as_str().to_ascii_uppercase()
                )));
            }
        }
    }

    let mut warnings = migration.safety.warnings.clone();
    if migration.safety.risk == RiskLevel::High {
        warnings.push("high-risk migration".to_string());
    }
    if migration.timing.requires_maintenance_window {
        warnings.push("requires a maintenance window".to_string());
    }
    if migration.safety.data_loss {
        warnings.push("may lose data; rollback cannot restore it".to_string());
    }
    if migration.safety.breaking_change {
        warnings.push("breaking change for running application code".to_string());
    }
    for warning in &warnings {
        warn!(migration = %migration.name, warning = %warning, "migration warning");
    }
    Ok(warnings)
}

/// Split on `;`, dropping comment lines and empty statements.
fn split_statements(block: &str) -> Vec<String> {
    let without_comments: String = block
        .lines()
        .filter(|line| !line.trim_start().starts_with("--"))
        .collect::<Vec<_>>()
        .join("\n");
    without_comments
        .split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Plans lock-aware schema changes and runs them phase by phase.
pub struct MigrationOptimizer {
    catalog: Arc<dyn CatalogSource>,
    statement_timeout: Duration,
    catalog_timeout: Duration,
}

impl MigrationOptimizer {
    pub fn new(
        catalog: Arc<dyn CatalogSource>,
        config: &MigrationConfig,
        catalog_timeout: Duration,
    ) -> Self {
        Self {
            catalog,
            statement_timeout: config.statement_timeout,
            catalog_timeout,
        }
    }

    /// Planner row estimate for `table`, or 0 when the catalog cannot say.
    pub async fn table_rows(&self, table: &str) -> i64 {
        match with_timeout("table size", self.catalog_timeout, self.catalog.table_stats()).await {
            Ok(tables) => tables
                .iter()
                .find(|t| t.table.eq_ignore_ascii_case(table))
                .map(|t| t.row_estimate)
                .unwrap_or(0),
            Err(err) => {
                warn!(table, error = %err, "row estimate unavailable; assuming small table");
                0
            }
        }
    }

    async fn column_type(&self, table: &str, column: &str) -> Option<String> {
        let columns = with_timeout("schema columns", self.catalog_timeout, self.catalog.columns())
            .await
            .ok()?;
        columns
            .into_iter()
            .find(|c| c.table.eq_ignore_ascii_case(table) && c.column.eq_ignore_ascii_case(column))
            .map(|c| c.data_type)
    }

    pub async fn optimize_add_column(
        &self,
        table: &str,
        column: &str,
        data_type: &str,
        nullable: bool,
        default: Option<&str>,
    ) -> OptimizedMigration {
        let rows = self.table_rows(table).await;
        let mut sql = format!("ALTER TABLE {table} ADD COLUMN {column} {data_type}");
        if let Some(default) = default {
            sql.push_str(&format!(" DEFAULT {default}"));
        }
        if !nullable {
            sql.push_str(" NOT NULL");
        }
        sql.push(';');

        let mut preconditions = Vec::new();
        let mut warnings = Vec::new();
        if !nullable && default.is_none() {
            preconditions.push(format!(
                "{table} must be empty, or a DEFAULT must be supplied for NOT NULL column {column}"
            ));
            warnings.push("NOT NULL column without DEFAULT needs a backfill".to_string());
        }
        let maintenance = needs_maintenance_window(rows);
        if maintenance {
            warnings.push(format!("{table} has ~{rows} rows; schedule during low traffic"));
        }

        OptimizedMigration {
            name: format!("add_column_{table}_{column}"),
            sql: Some(sql),
            impact: PerformanceImpact {
                lock_type: LockLevel::AccessExclusive,
                estimated_duration_secs: duration_tier(rows).as_secs(),
                concurrent_safe: nullable,
                estimated_rows: rows,
            },
            safety: SafetyAssessment {
                risk: if nullable {
                    RiskLevel::Low
                } else {
                    RiskLevel::Medium
                },
                breaking_change: false,
                data_loss: false,
                reversible: true,
                preconditions,
                warnings,
            },
            timing: ExecutionTiming {
                requires_maintenance_window: maintenance,
                phases: Vec::new(),
            },
            rollback_sql: format!("ALTER TABLE {table} DROP COLUMN IF EXISTS {column};"),
        }
    }

    pub async fn optimize_add_index(
        &self,
        table: &str,
        columns: &[&str],
        unique: bool,
    ) -> OptimizedMigration {
        let rows = self.table_rows(table).await;
        let index_name = format!("idx_{}_{}", table, columns.join("_"));
        let column_list = columns.join(", ");
        let sql = format!(
            "CREATE {}INDEX CONCURRENTLY IF NOT EXISTS {index_name} ON {table} ({column_list});",
            if unique { "UNIQUE " } else { "" }
        );

        let mut preconditions = Vec::new();
        if unique {
            preconditions.push(format!(
                "verify existing uniqueness: SELECT {column_list}, count(*) FROM {table} GROUP BY {column_list} HAVING count(*) > 1;"
            ));
        }
        let warnings = vec![
            "a failed concurrent build leaves an INVALID index that must be dropped before retrying"
                .to_string(),
        ];

        OptimizedMigration {
            name: format!("add_index_{index_name}"),
            sql: Some(sql),
            impact: PerformanceImpact {
                lock_type: LockLevel::None,
                estimated_duration_secs: duration_tier(rows).as_secs(),
                concurrent_safe: true,
                estimated_rows: rows,
            },
            safety: SafetyAssessment {
                risk: if unique {
                    RiskLevel::Medium
                } else {
                    RiskLevel::Low
                },
                breaking_change: false,
                data_loss: false,
                reversible: true,
                preconditions,
                warnings,
            },
            timing: ExecutionTiming {
                requires_maintenance_window: false,
                phases: Vec::new(),
            },
            rollback_sql: format!("DROP INDEX CONCURRENTLY IF EXISTS {index_name};"),
        }
    }

    pub async fn optimize_drop_column(&self, table: &str, column: &str) -> OptimizedMigration {
        let rows = self.table_rows(table).await;
        let inferred = self.column_type(table, column).await;
        let phases = vec![
            MigrationPhase {
                name: "drop_not_null".into(),
                sql: format!("ALTER TABLE {table} ALTER COLUMN {column} DROP NOT NULL;"),
                lock_type: LockLevel::AccessExclusive,
                estimated_duration_secs: 1,
            },
            MigrationPhase {
                name: "drop_default".into(),
                sql: format!("ALTER TABLE {table} ALTER COLUMN {column} DROP DEFAULT;"),
                lock_type: LockLevel::AccessExclusive,
                estimated_duration_secs: 1,
            },
            MigrationPhase {
                name: "drop_column".into(),
                sql: format!("ALTER TABLE {table} DROP COLUMN {column};"),
                lock_type: LockLevel::AccessExclusive,
                estimated_duration_secs: duration_tier(rows).as_secs().min(5),
            },
        ];
        let estimated = phases.iter().map(|p| p.estimated_duration_secs).sum();

        let mut warnings = vec![
            format!("dropping {table}.{column} permanently deletes its data"),
            "deploy application code that no longer reads the column before the final phase"
                .to_string(),
        ];
        let rollback_type = match &inferred {
            Some(data_type) => data_type.clone(),
            None => {
                warnings.push(format!(
                    "type of {table}.{column} unknown; rollback re-adds it as text"
                ));
                "text".to_string()
            }
        };

        OptimizedMigration {
            name: format!("drop_column_{table}_{column}"),
            sql: None,
            impact: PerformanceImpact {
                lock_type: LockLevel::AccessExclusive,
                estimated_duration_secs: estimated,
                concurrent_safe: false,
                estimated_rows: rows,
            },
            safety: SafetyAssessment {
                risk: RiskLevel::High,
                breaking_change: true,
                data_loss: true,
                reversible: false,
                preconditions: vec![format!(
                    "no application code or view references {table}.{column}"
                )],
                warnings,
            },
            timing: ExecutionTiming {
                requires_maintenance_window: needs_maintenance_window(rows),
                phases,
            },
            rollback_sql: format!(
                "-- WARNING: re-creates the column only; the dropped data is NOT recoverable\nALTER TABLE {table} ADD COLUMN IF NOT EXISTS {column} {rollback_type};"
            ),
        }
    }

    pub async fn optimize_change_column_type(
        &self,
        table: &str,
        column: &str,
        from: &str,
        to: &str,
    ) -> OptimizedMigration {
        let rows = self.table_rows(table).await;
        let name = format!("change_type_{table}_{column}");

        if is_compatible_change(from, to) {
            return OptimizedMigration {
                name,
                sql: Some(format!("ALTER TABLE {table} ALTER COLUMN {column} TYPE {to};")),
                impact: PerformanceImpact {
                    lock_type: LockLevel::AccessExclusive,
                    estimated_duration_secs: duration_tier(rows).as_secs(),
                    concurrent_safe: false,
                    estimated_rows: rows,
                },
                safety: SafetyAssessment {
                    risk: RiskLevel::Low,
                    breaking_change: false,
                    data_loss: false,
                    reversible: true,
                    preconditions: Vec::new(),
                    warnings: Vec::new(),
                },
                timing: ExecutionTiming {
                    requires_maintenance_window: false,
                    phases: Vec::new(),
                },
                rollback_sql: format!("ALTER TABLE {table} ALTER COLUMN {column} TYPE {from};"),
            };
        }

        let temp = format!("{column}_new");
        let copy_secs = duration_tier(rows).as_secs();
        let phases = vec![
            MigrationPhase {
                name: "add_temp_column".into(),
                sql: format!("ALTER TABLE {table} ADD COLUMN {temp} {to};"),
                lock_type: LockLevel::AccessExclusive,
                estimated_duration_secs: 1,
            },
            MigrationPhase {
                name: "copy_data".into(),
                sql: format!(
                    "LOCK TABLE {table} IN EXCLUSIVE MODE; UPDATE {table} SET {temp} = {column}::{to} WHERE {column} IS NOT NULL;"
                ),
                lock_type: LockLevel::Exclusive,
                estimated_duration_secs: copy_secs,
            },
            MigrationPhase {
                name: "drop_old_column".into(),
                sql: format!("ALTER TABLE {table} DROP COLUMN {column};"),
                lock_type: LockLevel::AccessExclusive,
                estimated_duration_secs: 1,
            },
            MigrationPhase {
                name: "rename_column".into(),
                sql: format!("ALTER TABLE {table} RENAME COLUMN {temp} TO {column};"),
                lock_type: LockLevel::AccessExclusive,
                estimated_duration_secs: 1,
            },
        ];
        let estimated = phases.iter().map(|p| p.estimated_duration_secs).sum();

        OptimizedMigration {
            name,
            sql: None,
            impact: PerformanceImpact {
                lock_type: LockLevel::Exclusive,
                estimated_duration_secs: estimated,
                concurrent_safe: false,
                estimated_rows: rows,
            },
            safety: SafetyAssessment {
                risk: RiskLevel::High,
                breaking_change: true,
                data_loss: true,
                reversible: false,
                preconditions: vec![format!(
                    "every non-null {table}.{column} value casts cleanly from {from} to {to}"
                )],
                warnings: vec![
                    format!("writes to {table} are blocked while data is converted"),
                    format!("{table}.{column} is briefly absent between the drop and rename phases"),
                ],
            },
            timing: ExecutionTiming {
                requires_maintenance_window: true,
                phases,
            },
            rollback_sql: format!(
                "-- WARNING: advisory only; values lost in the {from} -> {to} conversion cannot be restored\nALTER TABLE {table} ALTER COLUMN {column} TYPE {from} USING {column}::{from};"
            ),
        }
    }

    /// Validate, then run each step in order. Stops at the first failure without rolling back.
    pub async fn execute(
        &self,
        migration: &OptimizedMigration,
        executor: &dyn SqlExecutor,
        cancel: &CancellationToken,
    ) -> Result<MigrationReport, PerfError> {
        let warnings = validate_migration(migration)?;
        let steps = migration.steps();
        let phased = migration.is_phased();
        let started = Instant::now();
        let mut completed = Vec::with_capacity(steps.len());

        for (index, (phase_name, statement)) in steps.iter().enumerate() {
            if cancel.is_cancelled() {
                warn!(
                    migration = %migration.name,
                    completed_steps = completed.len(),
                    "migration cancelled between phases"
                );
                return Err(PerfError::Cancelled {
                    operation: format!("migration {}", migration.name),
                    completed_steps: completed.len(),
                });
            }

            let result = with_timeout(
                &format!("migration phase {phase_name}"),
                self.statement_timeout,
                executor.execute(statement),
            )
            .await;

            match result {
                Ok(_) => {
                    info!(migration = %migration.name, phase = %phase_name, "migration phase applied");
                    completed.push(phase_name.clone());
                }
                Err(err) if phased => {
                    error!(
                        migration = %migration.name,
                        phase = %phase_name,
                        completed = completed.len(),
                        error = %err,
                        "migration phase failed; earlier phases remain applied"
                    );
                    return Err(PerfError::PartialMigration {
                        migration: migration.name.clone(),
                        phase_index: index + 1,
                        phase_name: phase_name.clone(),
                        completed: completed.len(),
                        message: err.to_string(),
                    });
                }
                Err(err) => {
                    error!(migration = %migration.name, error = %err, "migration failed");
                    return Err(err);
                }
            }
        }

        Ok(MigrationReport {
            name: migration.name.clone(),
            completed_phases: completed,
            duration_ms: started.elapsed().as_secs_f64() * 1_000.0,
            warnings,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{StaticCatalog, TableStat};

    fn optimizer_with_rows(rows: i64) -> MigrationOptimizer {
        let catalog = StaticCatalog::new(
            vec![TableStat {
                schema: "public".into(),
                table: "recipes".into(),
                row_estimate: rows,
                total_bytes: 0,
                seq_scans: 0,
                index_scans: 0,
            }],
            Vec::new(),
            Vec::new(),
        );
        MigrationOptimizer::new(
            Arc::new(catalog),
            &MigrationConfig::default(),
            Duration::from_secs(1),
        )
    }

    #[test]
    fn type_aliases_fold() {
        assert_eq!(normalize_type("character varying(255)"), "varchar");
        assert_eq!(normalize_type("INT4"), "integer");
        assert!(is_compatible_change("varchar(80)", "text"));
        assert!(is_compatible_change("varchar(80)", "varchar(200)"));
        assert!(!is_compatible_change("text", "integer"));
    }

    #[test]
    fn duration_tiers_follow_table_size() {
        assert_eq!(duration_tier(50_000), Duration::from_secs(5));
        assert_eq!(duration_tier(500_000), Duration::from_secs(30));
        assert_eq!(duration_tier(5_000_000), Duration::from_secs(120));
    }

    #[tokio::test]
    async fn add_column_risk_depends_on_nullability() {
        let optimizer = optimizer_with_rows(500_000);
        let nullable = optimizer
            .optimize_add_column("recipes", "notes", "text", true, None)
            .await;
        assert_eq!(nullable.safety.risk, RiskLevel::Low);
        assert_eq!(nullable.impact.estimated_duration_secs, 30);
        assert!(!nullable.timing.requires_maintenance_window);

        let required = optimizer
            .optimize_add_column("recipes", "servings", "integer", false, None)
            .await;
        assert_eq!(required.safety.risk, RiskLevel::Medium);
        assert!(!required.safety.preconditions.is_empty());
    }

    #[tokio::test]
    async fn very_large_tables_need_a_window() {
        let optimizer = optimizer_with_rows(20_000_000);
        let plan = optimizer
            .optimize_add_column("recipes", "notes", "text", true, None)
            .await;
        assert!(plan.timing.requires_maintenance_window);
        assert_eq!(plan.impact.estimated_duration_secs, 120);
    }

    #[tokio::test]
    async fn unique_index_adds_precondition() {
        let optimizer = optimizer_with_rows(10);
        let plan = optimizer.optimize_add_index("recipes", &["slug"], true).await;
        assert_eq!(plan.impact.lock_type, LockLevel::None);
        assert_eq!(plan.safety.risk, RiskLevel::Medium);
        assert!(plan.safety.preconditions[0].contains("HAVING count(*) > 1"));
        assert!(
            plan.sql
                .as_deref()
                .is_some_and(|sql| sql.contains("UNIQUE INDEX CONCURRENTLY"))
        );
    }

    #[tokio::test]
    async fn drop_column_is_three_irreversible_phases() {
        let optimizer = optimizer_with_rows(10);
        let plan = optimizer.optimize_drop_column("recipes", "legacy_rating").await;
        let names: Vec<_> = plan.timing.phases.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, ["drop_not_null", "drop_default", "drop_column"]);
        assert_eq!(plan.safety.risk, RiskLevel::High);
        assert!(plan.safety.breaking_change && !plan.safety.reversible);
        assert!(plan.rollback_sql.contains("NOT recoverable"));
        assert!(plan.rollback_sql.contains("legacy_rating text"));
    }

    #[test]
    fn blacklist_rejects_destructive_statements() {
        let mut plan = OptimizedMigration {
            name: "bad".into(),
            sql: Some("DROP SCHEMA public CASCADE;".into()),
            impact: PerformanceImpact {
                lock_type: LockLevel::AccessExclusive,
                estimated_duration_secs: 1,
                concurrent_safe: false,
                estimated_rows: 0,
            },
            safety: SafetyAssessment {
                risk: RiskLevel::Low,
                breaking_change: false,
                data_loss: false,
                reversible: true,
                preconditions: Vec::new(),
                warnings: Vec::new(),
            },
            timing: ExecutionTiming {
                requires_maintenance_window: false,
                phases: Vec::new(),
            },
            rollback_sql: String::new(),
        };
        assert!(matches!(validate_migration(&plan), Err(PerfError::Validation(_))));

        plan.sql = Some("UPDATE recipes SET rating = 0;".into());
        assert!(validate_migration(&plan).is_err());
        plan.sql = Some("DELETE FROM recipes".into());
        assert!(validate_migration(&plan).is_err());
        plan.sql = Some("TRUNCATE recipes;".into());
        assert!(validate_migration(&plan).is_err());

        plan.sql = Some("-- TRUNCATE recipes;\nUPDATE recipes SET rating = 0 WHERE id = 1;".into());
        assert!(validate_migration(&plan).expect("scoped").is_empty());
    }

    #[tokio::test]
    async fn execute_reports_the_failing_phase() {
        let optimizer = optimizer_with_rows(10);
        let plan = optimizer
            .optimize_change_column_type("recipes", "rating", "text", "integer")
            .await;
        let executor = StaticCatalog::default();
        executor.fail_on("UPDATE recipes");

        let err = optimizer
            .execute(&plan, &executor, &CancellationToken::new())
            .await
            .expect_err("copy phase fails");
        match err {
            PerfError::PartialMigration {
                phase_index,
                phase_name,
                completed,
                ..
            } => {
                assert_eq!(phase_index, 2);
                assert_eq!(phase_name, "copy_data");
                assert_eq!(completed, 1);
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(executor.executed().len(), 1);
    }

    #[tokio::test]
    async fn cancelled_token_stops_before_first_phase() {
        let optimizer = optimizer_with_rows(10);
        let plan = optimizer.optimize_drop_column("recipes", "legacy").await;
        let executor = StaticCatalog::default();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = optimizer
            .execute(&plan, &executor, &cancel)
            .await
            .expect_err("cancelled");
        assert!(matches!(err, PerfError::Cancelled { completed_steps: 0, .. }));
        assert!(executor.executed().is_empty());
    }
}

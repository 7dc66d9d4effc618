use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::catalog::{
    CatalogSource, ColumnInfo, IndexUsageStat, SqlExecutor, TableStat, columns_by_table,
};
use crate::config::IndexConfig;
use crate::error::{PerfError, with_timeout};

const ANALYSIS_OPERATION: &str = "index analysis";
const OPTIMIZE_OPERATION: &str = "index optimization";
const TARGET_USAGE_RATIO: f64 = 90.0;

/// Priority of a missing-index suggestion
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    Medium,
    High,
}

impl Priority {
    pub fn estimated_gain_pct(self) -> f64 {
        match self {
            Priority::High => 70.0,
            Priority::Medium => 40.0,
            Priority::Low => 20.0,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Priority::High => "high",
            Priority::Medium => "medium",
            Priority::Low => "low",
        }
    }
}

/// Access pattern worth indexing whenever a table carries all of its columns.
struct AccessPattern {
    columns: &'static [&'static str],
    priority: Priority,
    reason: &'static str,
}

const KNOWN_PATTERNS: &[AccessPattern] = &[
    AccessPattern {
        columns: &["status", "created_at"],
        priority: Priority::High,
        reason: "status filters ordered by recency",
    },
    AccessPattern {
        columns: &["author_id", "status"],
        priority: Priority::High,
        reason: "per-author listings filtered by status",
    },
    AccessPattern {
        columns: &["user_id", "status"],
        priority: Priority::High,
        reason: "per-user listings filtered by status",
    },
    AccessPattern {
        columns: &["user_id", "created_at"],
        priority: Priority::Medium,
        reason: "per-user activity feeds ordered by recency",
    },
    AccessPattern {
        columns: &["author_id", "created_at"],
        priority: Priority::Medium,
        reason: "per-author timelines ordered by recency",
    },
    AccessPattern {
        columns: &["category_id", "created_at"],
        priority: Priority::Medium,
        reason: "category browsing ordered by recency",
    },
    AccessPattern {
        columns: &["recipe_id"],
        priority: Priority::Medium,
        reason: "foreign-key lookups and joins",
    },
    AccessPattern {
        columns: &["created_at"],
        priority: Priority::Low,
        reason: "time-range scans",
    },
    AccessPattern {
        columns: &["updated_at"],
        priority: Priority::Low,
        reason: "change-feed polling",
    },
];

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct UnusedIndex {
    pub schema: String,
    pub table: String,
    pub index: String,
    pub size_bytes: i64,
    pub scans: i64,
    pub is_unique: bool,
    pub drop_sql: String,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct MissingIndexSuggestion {
    pub schema: String,
    pub table: String,
    pub columns: Vec<String>,
    pub priority: Priority,
    pub estimated_gain_pct: f64,
    pub reason: String,
    pub create_sql: String,
}

/// Result of one pass over the statistics catalogs.
#[derive(Debug, Clone, Serialize)]
pub struct IndexAnalysis {
    pub analyzed_at: DateTime<Utc>,
    pub tables: Vec<TableStat>,
    pub indexes: Vec<IndexUsageStat>,
    pub unused_indexes: Vec<UnusedIndex>,
    pub missing_indexes: Vec<MissingIndexSuggestion>,
    pub index_usage_ratio: f64,
    pub health_score: f64,
    pub recommendations: Vec<String>,
}

impl IndexAnalysis {
    pub fn high_priority_missing(&self) -> impl Iterator<Item = &MissingIndexSuggestion> {
        self.missing_indexes
            .iter()
            .filter(|s| s.priority == Priority::High)
    }

    /// SQL script for manual review: high-priority builds, the rest, then commented-out drops.
    pub fn optimization_script(&self) -> String {
        let mut script = String::new();
        let _ = writeln!(
            script,
            "-- Index optimization script generated {}",
            self.analyzed_at.to_rfc3339()
        );
        let _ = writeln!(script, "-- Index health score: {:.1}", self.health_score);

        let mut ordered: Vec<&MissingIndexSuggestion> = self.missing_indexes.iter().collect();
        ordered.sort_by(|a, b| b.priority.cmp(&a.priority));

        let (high, rest): (Vec<_>, Vec<_>) = ordered
            .into_iter()
            .partition(|s| s.priority == Priority::High);

        script.push_str("\n-- High priority indexes\n");
        if high.is_empty() {
            script.push_str("-- (none)\n");
        }
        for suggestion in high {
            push_suggestion(&mut script, suggestion);
        }

        script.push_str("\n-- Medium and low priority indexes\n");
        if rest.is_empty() {
            script.push_str("-- (none)\n");
        }
        for suggestion in rest {
            push_suggestion(&mut script, suggestion);
        }

        script.push_str(
            "\n-- Unused indexes: confirm manually before uncommenting, drops are never applied automatically\n",
        );
        if self.unused_indexes.is_empty() {
            script.push_str("-- (none)\n");
        }
        for unused in &self.unused_indexes {
            let _ = writeln!(
                script,
                "-- {}.{}: {} scans, {} bytes{}",
                unused.table,
                unused.index,
                unused.scans,
                unused.size_bytes,
                if unused.is_unique {
                    ", enforces uniqueness"
                } else {
                    ""
                }
            );
            let _ = writeln!(script, "-- {}", unused.drop_sql);
        }
        script
    }
}

fn push_suggestion(script: &mut String, suggestion: &MissingIndexSuggestion) {
    let _ = writeln!(
        script,
        "-- {} ({}): {} (~{:.0}% faster)",
        suggestion.table,
        suggestion.columns.join(", "),
        suggestion.reason,
        suggestion.estimated_gain_pct
    );
    let _ = writeln!(script, "{}", suggestion.create_sql);
}

/// Composite index health in [0, 100].
///
/// Never increases as `unused` or `high_priority_missing` grow, or as the usage ratio drops.
pub fn calculate_index_health(
    unused: usize,
    high_priority_missing: usize,
    index_usage_ratio: f64,
) -> f64 {
    let mut score = 100.0;
    score -= unused as f64 * 5.0;
    score -= high_priority_missing as f64 * 10.0;
    if index_usage_ratio < TARGET_USAGE_RATIO {
        score -= (TARGET_USAGE_RATIO - index_usage_ratio.max(0.0)) * 0.5;
    }
    score.clamp(0.0, 100.0)
}

pub fn find_unused_indexes(indexes: &[IndexUsageStat], scan_threshold: i64) -> Vec<UnusedIndex> {
    let mut unused: Vec<UnusedIndex> = indexes
        .iter()
        .filter(|idx| !idx.is_primary && idx.scans < scan_threshold)
        .map(|idx| UnusedIndex {
            schema: idx.schema.clone(),
            table: idx.table.clone(),
            index: idx.index.clone(),
            size_bytes: idx.size_bytes,
            scans: idx.scans,
            is_unique: idx.is_unique,
            drop_sql: format!(
                "DROP INDEX CONCURRENTLY IF EXISTS {}.{};",
                quote_ident(&idx.schema),
                quote_ident(&idx.index)
            ),
        })
        .collect();
    unused.sort_by(|a, b| b.size_bytes.cmp(&a.size_bytes));
    unused
}

/// Match the known access patterns against the live schema, skipping ones already covered.
pub fn suggest_missing_indexes(
    columns: &[ColumnInfo],
    indexes: &[IndexUsageStat],
) -> Vec<MissingIndexSuggestion> {
    let by_table = columns_by_table(columns);

    let mut existing: HashMap<(&str, &str), Vec<&[String]>> = HashMap::new();
    for idx in indexes {
        existing
            .entry((idx.schema.as_str(), idx.table.as_str()))
            .or_default()
            .push(&idx.columns);
    }

    let mut suggestions = Vec::new();
    for ((schema, table), table_columns) in &by_table {
        let covered = existing.get(&(schema.as_str(), table.as_str()));
        for pattern in KNOWN_PATTERNS {
            // Catalog spelling of each pattern column, if the table has it.
            let Some(matched) = pattern
                .columns
                .iter()
                .map(|c| table_columns.iter().find(|tc| tc.eq_ignore_ascii_case(c)))
                .collect::<Option<Vec<&String>>>()
            else {
                continue;
            };
            let already_indexed = covered.is_some_and(|sets| {
                sets.iter().any(|cols| {
                    cols.len() >= matched.len()
                        && cols.iter().zip(&matched).all(|(a, b)| a.eq_ignore_ascii_case(b))
                })
            });
            if already_indexed {
                continue;
            }
            let index_name = format!(
                "idx_{}_{}",
                table.to_ascii_lowercase(),
                pattern.columns.join("_")
            );
            suggestions.push(MissingIndexSuggestion {
                schema: schema.clone(),
                table: table.clone(),
                columns: matched.iter().map(|c| c.to_string()).collect(),
                priority: pattern.priority,
                estimated_gain_pct: pattern.priority.estimated_gain_pct(),
                reason: pattern.reason.to_string(),
                create_sql: format!(
                    "CREATE INDEX CONCURRENTLY IF NOT EXISTS {} ON {}.{} ({});",
                    quote_ident(&index_name),
                    quote_ident(schema),
                    quote_ident(table),
                    matched
                        .iter()
                        .map(|c| quote_ident(c))
                        .collect::<Vec<_>>()
                        .join(", ")
                ),
            });
        }
    }
    suggestions.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.table.cmp(&b.table)));
    suggestions
}

/// Scan-weighted index usage across all tables.
pub fn overall_usage_ratio(tables: &[TableStat]) -> f64 {
    let (seq, idx) = tables.iter().fold((0_i64, 0_i64), |(seq, idx), t| {
        (seq + t.seq_scans.max(0), idx + t.index_scans.max(0))
    });
    if seq + idx == 0 {
        100.0
    } else {
        idx as f64 / (seq + idx) as f64 * 100.0
    }
}

/// Pure analysis over already-collected catalog rows.
pub fn build_analysis(
    tables: Vec<TableStat>,
    indexes: Vec<IndexUsageStat>,
    columns: &[ColumnInfo],
    scan_threshold: i64,
) -> IndexAnalysis {
    let unused_indexes = find_unused_indexes(&indexes, scan_threshold);
    let missing_indexes = suggest_missing_indexes(columns, &indexes);
    let index_usage_ratio = overall_usage_ratio(&tables);
    let high_missing = missing_indexes
        .iter()
        .filter(|s| s.priority == Priority::High)
        .count();
    let health_score = calculate_index_health(unused_indexes.len(), high_missing, index_usage_ratio);

    let mut recommendations = Vec::new();
    if high_missing > 0 {
        recommendations.push(format!(
            "Create {high_missing} high-priority index(es) with CREATE INDEX CONCURRENTLY"
        ));
    }
    if !unused_indexes.is_empty() {
        recommendations.push(format!(
            "Review {} unused index(es) for removal; each slows writes and wastes space",
            unused_indexes.len()
        ));
    }
    if index_usage_ratio < TARGET_USAGE_RATIO {
        recommendations.push(format!(
            "Index usage is {index_usage_ratio:.1}%; investigate sequential scans on large tables"
        ));
    }

    IndexAnalysis {
        analyzed_at: Utc::now(),
        tables,
        indexes,
        unused_indexes,
        missing_indexes,
        index_usage_ratio,
        health_score,
        recommendations,
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct OptimizationOutcome {
    pub applied: Vec<String>,
    pub failed: Vec<(String, String)>,
}

/// Catalog-driven index advisor.
pub struct IndexOptimizer {
    catalog: Arc<dyn CatalogSource>,
    executor: Arc<dyn SqlExecutor>,
    scan_threshold: i64,
    catalog_timeout: Duration,
    build_timeout: Duration,
    latest: RwLock<Option<IndexAnalysis>>,
}

impl IndexOptimizer {
    pub fn new(
        catalog: Arc<dyn CatalogSource>,
        executor: Arc<dyn SqlExecutor>,
        config: &IndexConfig,
    ) -> Self {
        Self {
            catalog,
            executor,
            scan_threshold: config.unused_scan_threshold,
            catalog_timeout: config.catalog_timeout,
            build_timeout: config.build_timeout,
            latest: RwLock::new(None),
        }
    }

    /// Collect statistics and compute unused/missing indexes and the health score.
    ///
    /// Checks `cancel` between catalog reads; each read is bounded by the catalog timeout.
    pub async fn analyze(&self, cancel: &CancellationToken) -> Result<IndexAnalysis, PerfError> {
        let cancelled = |completed_steps| PerfError::Cancelled {
            operation: ANALYSIS_OPERATION.into(),
            completed_steps,
        };

        if cancel.is_cancelled() {
            return Err(cancelled(0));
        }
        let tables = with_timeout(
            "table statistics",
            self.catalog_timeout,
            self.catalog.table_stats(),
        )
        .await?;
        info!(tables = tables.len(), "collected table statistics");

        if cancel.is_cancelled() {
            warn!(completed_steps = 1, "index analysis cancelled");
            return Err(cancelled(1));
        }
        let indexes = with_timeout(
            "index statistics",
            self.catalog_timeout,
            self.catalog.index_stats(),
        )
        .await?;
        info!(indexes = indexes.len(), "collected index statistics");

        if cancel.is_cancelled() {
            warn!(completed_steps = 2, "index analysis cancelled");
            return Err(cancelled(2));
        }
        let columns = with_timeout("schema columns", self.catalog_timeout, self.catalog.columns())
            .await?;

        let analysis = build_analysis(tables, indexes, &columns, self.scan_threshold);
        info!(
            unused = analysis.unused_indexes.len(),
            missing = analysis.missing_indexes.len(),
            health_score = analysis.health_score,
            "index analysis complete"
        );
        *self.latest.write() = Some(analysis.clone());
        Ok(analysis)
    }

    pub fn latest_analysis(&self) -> Option<IndexAnalysis> {
        self.latest.read().clone()
    }

    /// Build every high-priority suggestion without blocking writes.
    ///
    /// Individual failures are logged and collected; cancellation stops before the next build.
    pub async fn optimize_concurrently(
        &self,
        analysis: &IndexAnalysis,
        cancel: &CancellationToken,
    ) -> Result<OptimizationOutcome, PerfError> {
        let mut outcome = OptimizationOutcome::default();
        for (step, suggestion) in analysis.high_priority_missing().enumerate() {
            if cancel.is_cancelled() {
                warn!(completed_steps = step, "index optimization cancelled");
                return Err(PerfError::Cancelled {
                    operation: OPTIMIZE_OPERATION.into(),
                    completed_steps: step,
                });
            }
            match with_timeout(
                "index build",
                self.build_timeout,
                self.executor.execute(&suggestion.create_sql),
            )
            .await
            {
                Ok(_) => {
                    info!(table = %suggestion.table, columns = ?suggestion.columns, "created index");
                    outcome.applied.push(suggestion.create_sql.clone());
                }
                Err(err) => {
                    warn!(
                        table = %suggestion.table,
                        columns = ?suggestion.columns,
                        error = %err,
                        "index build failed; continuing"
                    );
                    outcome
                        .failed
                        .push((suggestion.create_sql.clone(), err.to_string()));
                }
            }
        }
        Ok(outcome)
    }
}

fn quote_ident(name: &str) -> String {
    let simple = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
        && !name.starts_with(|c: char| c.is_ascii_digit());
    if simple {
        name.to_string()
    } else {
        format!("\"{}\"", name.replace('"', "\"\""))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn column(table: &str, name: &str) -> ColumnInfo {
        ColumnInfo {
            schema: "public".into(),
            table: table.into(),
            column: name.into(),
            data_type: "text".into(),
            nullable: true,
        }
    }

    fn index(table: &str, name: &str, columns: &[&str], scans: i64, primary: bool) -> IndexUsageStat {
        IndexUsageStat {
            schema: "public".into(),
            table: table.into(),
            index: name.into(),
            columns: columns.iter().map(|c| c.to_string()).collect(),
            size_bytes: 8192,
            scans,
            tuples_read: 0,
            tuples_fetched: 0,
            is_primary: primary,
            is_unique: primary,
        }
    }

    #[test]
    fn health_starts_at_hundred_and_clamps() {
        assert_eq!(calculate_index_health(0, 0, 95.0), 100.0);
        assert_eq!(calculate_index_health(2, 1, 95.0), 80.0);
        assert_eq!(calculate_index_health(0, 0, 70.0), 90.0);
        assert_eq!(calculate_index_health(50, 50, 0.0), 0.0);
    }

    #[test]
    fn primary_keys_are_never_unused() {
        let indexes = vec![
            index("recipes", "recipes_pkey", &["id"], 0, true),
            index("recipes", "idx_recipes_title", &["title"], 3, false),
            index("recipes", "idx_recipes_slug", &["slug"], 500, false),
        ];
        let unused = find_unused_indexes(&indexes, 10);
        assert_eq!(unused.len(), 1);
        assert_eq!(unused[0].index, "idx_recipes_title");
        assert_eq!(
            unused[0].drop_sql,
            "DROP INDEX CONCURRENTLY IF EXISTS public.idx_recipes_title;"
        );
    }

    #[test]
    fn suggestions_skip_patterns_covered_by_existing_prefix() {
        let columns = vec![
            column("recipes", "id"),
            column("recipes", "author_id"),
            column("recipes", "status"),
            column("recipes", "created_at"),
        ];
        let indexes = vec![index(
            "recipes",
            "idx_recipes_status_created",
            &["status", "created_at", "id"],
            100,
            false,
        )];
        let suggestions = suggest_missing_indexes(&columns, &indexes);
        assert!(suggestions.iter().all(|s| s.columns != ["status", "created_at"]));
        let author = suggestions
            .iter()
            .find(|s| s.columns == ["author_id", "status"])
            .expect("author+status suggested");
        assert_eq!(author.priority, Priority::High);
        assert_eq!(author.estimated_gain_pct, 70.0);
        assert!(author.create_sql.starts_with("CREATE INDEX CONCURRENTLY"));
    }

    #[test]
    fn script_orders_high_first_and_comments_out_drops() {
        let columns = vec![
            column("recipes", "author_id"),
            column("recipes", "status"),
            column("recipes", "created_at"),
        ];
        let indexes = vec![index("recipes", "idx_old", &["title"], 0, false)];
        let analysis = build_analysis(Vec::new(), indexes, &columns, 10);
        let script = analysis.optimization_script();

        let high = script.find("-- High priority").expect("high section");
        let rest = script.find("-- Medium and low").expect("rest section");
        let drops = script.find("-- Unused indexes").expect("drop section");
        assert!(high < rest && rest < drops);
        assert!(script.contains("-- DROP INDEX CONCURRENTLY IF EXISTS public.idx_old;"));
        assert!(
            !script
                .lines()
                .any(|line| line.trim_start().starts_with("DROP"))
        );
    }

    #[test]
    fn suggestions_keep_schema_and_catalog_spelling() {
        let columns: Vec<ColumnInfo> = ["id", "Status", "created_at"]
            .into_iter()
            .map(|name| ColumnInfo {
                schema: "app".into(),
                ..column("Recipes", name)
            })
            .collect();
        let suggestions = suggest_missing_indexes(&columns, &[]);
        let status = suggestions
            .iter()
            .find(|s| s.priority == Priority::High)
            .expect("status+created_at suggested");
        assert_eq!(status.schema, "app");
        assert_eq!(status.table, "Recipes");
        assert_eq!(status.columns, ["Status", "created_at"]);
        assert_eq!(
            status.create_sql,
            "CREATE INDEX CONCURRENTLY IF NOT EXISTS idx_recipes_status_created_at \
             ON app.\"Recipes\" (\"Status\", created_at);"
        );

        let existing = vec![IndexUsageStat {
            schema: "app".into(),
            ..index("Recipes", "recipes_status", &["status", "created_at"], 40, false)
        }];
        assert!(
            suggest_missing_indexes(&columns, &existing)
                .iter()
                .all(|s| s.columns != ["Status", "created_at"])
        );
        let other_schema = vec![index("Recipes", "recipes_status", &["Status", "created_at"], 40, false)];
        assert!(
            suggest_missing_indexes(&columns, &other_schema)
                .iter()
                .any(|s| s.columns == ["Status", "created_at"])
        );
    }

    #[test]
    fn quoting_handles_mixed_case() {
        assert_eq!(quote_ident("recipes"), "recipes");
        assert_eq!(quote_ident("Recipes"), "\"Recipes\"");
    }
}

use std::collections::BTreeMap;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use sqlx::{PgPool, Row};
use tracing::instrument;

use crate::error::PerfError;

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct TableStat {
    pub schema: String,
    pub table: String,
    pub row_estimate: i64,
    pub total_bytes: i64,
    pub seq_scans: i64,
    pub index_scans: i64,
}

impl TableStat {
    /// Share of scans served by an index, in percent. Untouched tables count as fully indexed.
    pub fn index_usage_ratio(&self) -> f64 {
        let total = self.seq_scans + self.index_scans;
        if total <= 0 {
            100.0
        } else {
            self.index_scans as f64 / total as f64 * 100.0
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct IndexUsageStat {
    pub schema: String,
    pub table: String,
    pub index: String,
    pub columns: Vec<String>,
    pub size_bytes: i64,
    pub scans: i64,
    pub tuples_read: i64,
    pub tuples_fetched: i64,
    pub is_primary: bool,
    pub is_unique: bool,
}

impl IndexUsageStat {
    /// Fetched tuples per tuple read, in percent.
    pub fn effectiveness(&self) -> f64 {
        if self.tuples_read <= 0 {
            0.0
        } else {
            (self.tuples_fetched as f64 / self.tuples_read as f64 * 100.0).min(100.0)
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ColumnInfo {
    pub schema: String,
    pub table: String,
    pub column: String,
    pub data_type: String,
    pub nullable: bool,
}

/// Read access to the engine's statistics and schema catalogs.
#[async_trait]
pub trait CatalogSource: Send + Sync {
    async fn table_stats(&self) -> Result<Vec<TableStat>, PerfError>;

    async fn index_stats(&self) -> Result<Vec<IndexUsageStat>, PerfError>;

    async fn columns(&self) -> Result<Vec<ColumnInfo>, PerfError>;
}

/// Runs DDL and maintenance statements outside of any explicit transaction.
#[async_trait]
pub trait SqlExecutor: Send + Sync {
    async fn execute(&self, statement: &str) -> Result<u64, PerfError>;
}

const TABLE_STATS_SQL: &str = r#"
SELECT
    s.schemaname AS schema_name,
    s.relname AS table_name,
    GREATEST(c.reltuples, 0)::bigint AS row_estimate,
    pg_total_relation_size(s.relid)::bigint AS total_bytes,
    COALESCE(s.seq_scan, 0)::bigint AS seq_scans,
    COALESCE(s.idx_scan, 0)::bigint AS index_scans
FROM pg_stat_user_tables s
JOIN pg_class c ON c.oid = s.relid
ORDER BY total_bytes DESC
"#;

const INDEX_STATS_SQL: &str = r#"
SELECT
    s.schemaname AS schema_name,
    s.relname AS table_name,
    s.indexrelname AS index_name,
    ARRAY(
        SELECT a.attname::text
        FROM unnest(i.indkey) WITH ORDINALITY AS k(attnum, ord)
        JOIN pg_attribute a ON a.attrelid = i.indrelid AND a.attnum = k.attnum
        ORDER BY k.ord
    ) AS columns,
    pg_relation_size(s.indexrelid)::bigint AS size_bytes,
    COALESCE(s.idx_scan, 0)::bigint AS scans,
    COALESCE(s.idx_tup_read, 0)::bigint AS tuples_read,
    COALESCE(s.idx_tup_fetch, 0)::bigint AS tuples_fetched,
    i.indisprimary AS is_primary,
    i.indisunique AS is_unique
FROM pg_stat_user_indexes s
JOIN pg_index i ON i.indexrelid = s.indexrelid
ORDER BY s.relname, s.indexrelname
"#;

const COLUMNS_SQL: &str = r#"
SELECT table_schema::text, table_name::text, column_name::text, data_type::text,
       (is_nullable = 'YES') AS nullable
FROM information_schema.columns
WHERE table_schema = ANY (current_schemas(false))
ORDER BY table_schema, table_name, ordinal_position
"#;

/// Catalog and executor backed by a live Postgres pool.
#[derive(Clone)]
pub struct PgCatalog {
    pool: PgPool,
}

impl PgCatalog {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CatalogSource for PgCatalog {
    #[instrument(skip_all)]
    async fn table_stats(&self) -> Result<Vec<TableStat>, PerfError> {
        let rows = sqlx::query(TABLE_STATS_SQL)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| PerfError::query(TABLE_STATS_SQL, e))?;

        let mut tables = Vec::with_capacity(rows.len());
        for row in rows {
            tables.push(TableStat {
                schema: row.try_get("schema_name").map_err(catalog_err)?,
                table: row.try_get("table_name").map_err(catalog_err)?,
                row_estimate: row.try_get("row_estimate").map_err(catalog_err)?,
                total_bytes: row.try_get("total_bytes").map_err(catalog_err)?,
                seq_scans: row.try_get("seq_scans").map_err(catalog_err)?,
                index_scans: row.try_get("index_scans").map_err(catalog_err)?,
            });
        }
        Ok(tables)
    }

    #[instrument(skip_all)]
    async fn index_stats(&self) -> Result<Vec<IndexUsageStat>, PerfError> {
        let rows = sqlx::query(INDEX_STATS_SQL)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| PerfError::query(INDEX_STATS_SQL, e))?;

        let mut indexes = Vec::with_capacity(rows.len());
        for row in rows {
            indexes.push(IndexUsageStat {
                schema: row.try_get("schema_name").map_err(catalog_err)?,
                table: row.try_get("table_name").map_err(catalog_err)?,
                index: row.try_get("index_name").map_err(catalog_err)?,
                columns: row.try_get("columns").map_err(catalog_err)?,
                size_bytes: row.try_get("size_bytes").map_err(catalog_err)?,
                scans: row.try_get("scans").map_err(catalog_err)?,
                tuples_read: row.try_get("tuples_read").map_err(catalog_err)?,
                tuples_fetched: row.try_get("tuples_fetched").map_err(catalog_err)?,
                is_primary: row.try_get("is_primary").map_err(catalog_err)?,
                is_unique: row.try_get("is_unique").map_err(catalog_err)?,
            });
        }
        Ok(indexes)
    }

    #[instrument(skip_all)]
    async fn columns(&self) -> Result<Vec<ColumnInfo>, PerfError> {
        let rows = sqlx::query(COLUMNS_SQL)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| PerfError::query(COLUMNS_SQL, e))?;

        let mut columns = Vec::with_capacity(rows.len());
        for row in rows {
            columns.push(ColumnInfo {
                schema: row.try_get("table_schema").map_err(catalog_err)?,
                table: row.try_get("table_name").map_err(catalog_err)?,
                column: row.try_get("column_name").map_err(catalog_err)?,
                data_type: row.try_get("data_type").map_err(catalog_err)?,
                nullable: row.try_get("nullable").map_err(catalog_err)?,
            });
        }
        Ok(columns)
    }
}

#[async_trait]
impl SqlExecutor for PgCatalog {
    async fn execute(&self, statement: &str) -> Result<u64, PerfError> {
        let result = sqlx::raw_sql(statement)
            .execute(&self.pool)
            .await
            .map_err(|e| PerfError::query(statement, e))?;
        Ok(result.rows_affected())
    }
}

/// Group column names by `(schema, table)`, preserving catalog order and the names' case.
pub fn columns_by_table(columns: &[ColumnInfo]) -> BTreeMap<(String, String), Vec<String>> {
    let mut by_table: BTreeMap<(String, String), Vec<String>> = BTreeMap::new();
    for column in columns {
        by_table
            .entry((column.schema.clone(), column.table.clone()))
            .or_default()
            .push(column.column.clone());
    }
    by_table
}

fn catalog_err(err: sqlx::Error) -> PerfError {
    PerfError::QueryExecution {
        sql: "catalog row decode".into(),
        message: err.to_string(),
    }
}

/// Fixed catalog contents plus a recording executor.
#[derive(Debug, Default)]
pub struct StaticCatalog {
    pub tables: Vec<TableStat>,
    pub indexes: Vec<IndexUsageStat>,
    pub column_list: Vec<ColumnInfo>,
    executed: Mutex<Vec<String>>,
    failing: Mutex<Vec<String>>,
}

impl StaticCatalog {
    pub fn new(
        tables: Vec<TableStat>,
        indexes: Vec<IndexUsageStat>,
        column_list: Vec<ColumnInfo>,
    ) -> Self {
        Self {
            tables,
            indexes,
            column_list,
            ..Self::default()
        }
    }

    /// Make every statement containing `fragment` fail.
    pub fn fail_on(&self, fragment: &str) {
        self.failing.lock().push(fragment.to_string());
    }

    pub fn executed(&self) -> Vec<String> {
        self.executed.lock().clone()
    }
}

#[async_trait]
impl CatalogSource for StaticCatalog {
    async fn table_stats(&self) -> Result<Vec<TableStat>, PerfError> {
        Ok(self.tables.clone())
    }

    async fn index_stats(&self) -> Result<Vec<IndexUsageStat>, PerfError> {
        Ok(self.indexes.clone())
    }

    async fn columns(&self) -> Result<Vec<ColumnInfo>, PerfError> {
        Ok(self.column_list.clone())
    }
}

#[async_trait]
impl SqlExecutor for StaticCatalog {
    async fn execute(&self, statement: &str) -> Result<u64, PerfError> {
        let failing = self
            .failing
            .lock()
            .iter()
            .any(|fragment| statement.contains(fragment.as_str()));
        if failing {
            return Err(PerfError::query(statement, "simulated failure"));
        }
        self.executed.lock().push(statement.to_string());
        Ok(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usage_ratio_defaults_to_full_for_idle_tables() {
        let table = TableStat {
            schema: "public".into(),
            table: "recipes".into(),
            row_estimate: 0,
            total_bytes: 0,
            seq_scans: 0,
            index_scans: 0,
        };
        assert_eq!(table.index_usage_ratio(), 100.0);
        let busy = TableStat {
            seq_scans: 25,
            index_scans: 75,
            ..table
        };
        assert_eq!(busy.index_usage_ratio(), 75.0);
    }

    #[tokio::test]
    async fn static_executor_records_and_fails_on_request() {
        let catalog = StaticCatalog::default();
        catalog.fail_on("broken");
        catalog.execute("CREATE INDEX ok_idx").await.expect("ok");
        assert!(catalog.execute("CREATE INDEX broken_idx").await.is_err());
        assert_eq!(catalog.executed(), vec!["CREATE INDEX ok_idx".to_string()]);
    }
}

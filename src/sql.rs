//! Lightweight statement inspection shared by the monitor, cache and migration planner.
//!
//! Everything here is heuristic string matching, not parsing. Table detection only
//! looks at `FROM`, `JOIN`, `UPDATE` and `INSERT INTO` clauses, so tables referenced
//! solely inside CTE bodies or sub-selects in unusual positions can be missed.

use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;

pub const MAX_SANITIZED_LEN: usize = 500;

static WHITESPACE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").expect("regex"));
static STRING_LITERAL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"'(?:[^']|'')*'").expect("regex"));
static TABLE_REFERENCE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)\b(?:from|join|update|insert\s+into)\s+(?:only\s+)?([a-z_"][a-z0-9_."]*)"#)
        .expect("regex")
});

// Words that follow FROM/UPDATE without naming a relation (`DO UPDATE SET`, `FOR UPDATE OF`, `EXTRACT(EPOCH FROM now())`).
const NOT_TABLES: &[&str] = &["select", "lateral", "set", "of", "nowait", "skip", "now"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum StatementKind {
    Select,
    Insert,
    Update,
    Delete,
    Ddl,
    Other,
}

impl StatementKind {
    pub fn as_str(self) -> &'static str {
        match self {
            StatementKind::Select => "select",
            StatementKind::Insert => "insert",
            StatementKind::Update => "update",
            StatementKind::Delete => "delete",
            StatementKind::Ddl => "ddl",
            StatementKind::Other => "other",
        }
    }

    pub fn is_read(self) -> bool {
        matches!(self, StatementKind::Select)
    }

    pub fn is_write(self) -> bool {
        matches!(
            self,
            StatementKind::Insert | StatementKind::Update | StatementKind::Delete
        )
    }
}

/// Lowercase and collapse runs of whitespace.
pub fn normalize(sql: &str) -> String {
    WHITESPACE.replace_all(sql.trim(), " ").to_lowercase()
}

/// Replace quoted string literals with `?` and cap the length for logging.
pub fn sanitize(sql: &str) -> String {
    let collapsed = WHITESPACE.replace_all(sql.trim(), " ");
    let redacted = STRING_LITERAL.replace_all(&collapsed, "?");
    truncate(&redacted, MAX_SANITIZED_LEN)
}

fn truncate(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    let mut out: String = value.chars().take(max_chars.saturating_sub(3)).collect();
    out.push_str("...");
    out
}

pub fn statement_kind(sql: &str) -> StatementKind {
    let trimmed = sql.trim_start().trim_start_matches('(');
    let first = trimmed
        .split(|c: char| c.is_whitespace() || c == '(')
        .next()
        .unwrap_or("")
        .to_ascii_lowercase();
    match first.as_str() {
        "select" | "with" | "show" | "explain" | "values" => {
            // A CTE may wrap a write.
            if first == "with" {
                let lower = sql.to_ascii_lowercase();
                if lower.contains(" insert into ") {
                    return StatementKind::Insert;
                }
                if lower.contains(" update ") {
                    return StatementKind::Update;
                }
                if lower.contains(" delete from ") {
                    return StatementKind::Delete;
                }
            }
            StatementKind::Select
        }
        "insert" => StatementKind::Insert,
        "update" => StatementKind::Update,
        "delete" => StatementKind::Delete,
        "create" | "alter" | "drop" | "truncate" | "comment" | "grant" | "revoke" => {
            StatementKind::Ddl
        }
        _ => StatementKind::Other,
    }
}

/// Every table referenced by the statement, deduplicated, in order of appearance.
pub fn referenced_tables(sql: &str) -> Vec<String> {
    let mut tables: Vec<String> = Vec::new();
    for caps in TABLE_REFERENCE.captures_iter(sql) {
        let Some(raw) = caps.get(1) else { continue };
        let name = clean_identifier(raw.as_str());
        if name.is_empty() || NOT_TABLES.contains(&name.as_str()) {
            continue;
        }
        if !tables.contains(&name) {
            tables.push(name);
        }
    }
    tables
}

/// First referenced table, used to namespace cache keys.
pub fn table_hint(sql: &str) -> Option<String> {
    referenced_tables(sql).into_iter().next()
}

fn clean_identifier(raw: &str) -> String {
    let unquoted = raw.trim_end_matches([',', ';', ')']).replace('"', "");
    let last = unquoted.rsplit('.').next().unwrap_or("");
    last.to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_collapses_and_lowercases() {
        assert_eq!(
            normalize("  SELECT *\n\tFROM   Recipes  WHERE id = $1 "),
            "select * from recipes where id = $1"
        );
    }

    #[test]
    fn sanitize_replaces_string_literals() {
        let sql = "SELECT * FROM users WHERE email = 'bob@example.com' AND name = 'O''Brien'";
        assert_eq!(
            sanitize(sql),
            "SELECT * FROM users WHERE email = ? AND name = ?"
        );
    }

    #[test]
    fn sanitize_truncates_long_statements() {
        let sql = format!("SELECT {} FROM t", "a, ".repeat(400));
        let out = sanitize(&sql);
        assert_eq!(out.chars().count(), MAX_SANITIZED_LEN);
        assert!(out.ends_with("..."));
    }

    #[test]
    fn detects_statement_kinds() {
        assert_eq!(statement_kind("select 1"), StatementKind::Select);
        assert_eq!(statement_kind("  INSERT INTO t VALUES (1)"), StatementKind::Insert);
        assert_eq!(statement_kind("Update t set a = 1"), StatementKind::Update);
        assert_eq!(statement_kind("DELETE FROM t"), StatementKind::Delete);
        assert_eq!(statement_kind("ALTER TABLE t ADD c int"), StatementKind::Ddl);
        assert_eq!(
            statement_kind("WITH x AS (SELECT 1) DELETE FROM t USING x"),
            StatementKind::Delete
        );
        assert_eq!(statement_kind("begin"), StatementKind::Other);
    }

    #[test]
    fn extracts_tables_from_common_clauses() {
        assert_eq!(
            referenced_tables(
                "SELECT r.* FROM public.recipes r JOIN \"Users\" u ON u.id = r.author_id"
            ),
            vec!["recipes".to_string(), "users".to_string()]
        );
        assert_eq!(table_hint("UPDATE recipes SET title = $1"), Some("recipes".into()));
        assert_eq!(table_hint("insert into ratings (a) values (1)"), Some("ratings".into()));
        assert_eq!(table_hint("SELECT 1"), None);
    }

    #[test]
    fn upsert_clause_is_not_a_table() {
        assert_eq!(
            referenced_tables(
                "INSERT INTO favorites (user_id, recipe_id) VALUES ($1, $2) ON CONFLICT (user_id, recipe_id) DO UPDATE SET created_at = now()"
            ),
            vec!["favorites".to_string()]
        );
    }

    #[test]
    fn subselect_is_not_a_table() {
        assert_eq!(
            referenced_tables("SELECT * FROM (SELECT id FROM recipes) s"),
            vec!["recipes".to_string()]
        );
    }
}

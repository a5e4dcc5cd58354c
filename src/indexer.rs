//! Best-effort SQLite indexer, driven by an optional `dbschema.json` at a
//! site's root. Never blocks or reverses a successful download: failures are
//! logged and the site's success flag is untouched.
use std::collections::BTreeMap;
use std::path::Path;

use rusqlite::Connection;
use serde::Deserialize;
use serde_json::Value;
use tracing::{info, warn};
use walkdir::WalkDir;

use crate::error::{NodeError, NodeResult};

const SCHEMA_FILE: &str = "dbschema.json";

#[derive(Debug, Deserialize)]
struct IndexSchema {
    db_file: String,
    maps: BTreeMap<String, TableMap>,
}

#[derive(Debug, Deserialize)]
struct TableMap {
    to_table: String,
    /// Column name -> JSON pointer into the source file, e.g. `"/title"`.
    #[serde(default)]
    columns: BTreeMap<String, String>,
}

/// Indexes `site_root` if it carries a `dbschema.json`; a no-op otherwise.
pub fn index_site(site_root: &Path) {
    let schema_path = site_root.join(SCHEMA_FILE);
    if !schema_path.exists() {
        return;
    }
    if let Err(err) = try_index(site_root, &schema_path) {
        warn!(site_root = %site_root.display(), error = %err, "indexing failed");
    }
}

fn try_index(site_root: &Path, schema_path: &Path) -> NodeResult<()> {
    let bytes = std::fs::read(schema_path).map_err(NodeError::Io)?;
    let schema: IndexSchema =
        serde_json::from_slice(&bytes).map_err(|e| NodeError::Indexing(e.to_string()))?;

    let db_path = site_root.join(&schema.db_file);
    let conn = Connection::open(&db_path).map_err(|e| NodeError::Indexing(e.to_string()))?;

    for (glob, table) in &schema.maps {
        ensure_table(&conn, table)?;
        for entry in WalkDir::new(site_root)
            .into_iter()
            .filter_map(Result::ok)
            .filter(|e| e.file_type().is_file())
        {
            let relative = entry
                .path()
                .strip_prefix(site_root)
                .unwrap_or(entry.path())
                .to_string_lossy()
                .replace('\\', "/");
            if !glob_match(glob, &relative) {
                continue;
            }
            if let Ok(bytes) = std::fs::read(entry.path()) {
                if let Ok(value) = serde_json::from_slice::<Value>(&bytes) {
                    upsert_row(&conn, table, &relative, &value)?;
                }
            }
        }
    }
    info!(site_root = %site_root.display(), "site indexed");
    Ok(())
}

fn ensure_table(conn: &Connection, table: &TableMap) -> NodeResult<()> {
    let mut columns = vec!["inner_path TEXT PRIMARY KEY".to_string()];
    for column in table.columns.keys() {
        columns.push(format!("{column} TEXT"));
    }
    let sql = format!(
        "CREATE TABLE IF NOT EXISTS {} ({})",
        table.to_table,
        columns.join(", ")
    );
    conn.execute(&sql, [])
        .map_err(|e| NodeError::Indexing(e.to_string()))?;
    Ok(())
}

fn upsert_row(conn: &Connection, table: &TableMap, inner_path: &str, value: &Value) -> NodeResult<()> {
    let mut names = vec!["inner_path".to_string()];
    let mut values: Vec<String> = vec![inner_path.to_string()];
    for (column, pointer) in &table.columns {
        names.push(column.clone());
        values.push(
            value
                .pointer(pointer)
                .map(value_to_text)
                .unwrap_or_default(),
        );
    }
    let placeholders = vec!["?"; names.len()].join(", ");
    let sql = format!(
        "INSERT OR REPLACE INTO {} ({}) VALUES ({})",
        table.to_table,
        names.join(", "),
        placeholders
    );
    let params: Vec<&dyn rusqlite::ToSql> = values.iter().map(|v| v as &dyn rusqlite::ToSql).collect();
    conn.execute(&sql, params.as_slice())
        .map_err(|e| NodeError::Indexing(e.to_string()))?;
    Ok(())
}

fn value_to_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Runs a read-only `SELECT` against a site's indexed database, rejecting
/// any query that isn't one. Returns each row as a JSON array of column
/// values rendered as text.
pub fn run_select(site_root: &Path, query: &str) -> NodeResult<Vec<Vec<String>>> {
    if !query.trim_start().to_ascii_uppercase().starts_with("SELECT") {
        return Err(NodeError::Indexing("only SELECT queries are allowed".into()));
    }
    let schema_path = site_root.join(SCHEMA_FILE);
    let bytes = std::fs::read(&schema_path).map_err(NodeError::Io)?;
    let schema: IndexSchema =
        serde_json::from_slice(&bytes).map_err(|e| NodeError::Indexing(e.to_string()))?;
    let conn = Connection::open(site_root.join(&schema.db_file))
        .map_err(|e| NodeError::Indexing(e.to_string()))?;

    let mut stmt = conn
        .prepare(query)
        .map_err(|e| NodeError::Indexing(e.to_string()))?;
    let column_count = stmt.column_count();
    let rows = stmt
        .query_map([], |row| {
            (0..column_count)
                .map(|i| row.get::<_, String>(i).or_else(|_| Ok(String::new())))
                .collect::<rusqlite::Result<Vec<String>>>()
        })
        .map_err(|e| NodeError::Indexing(e.to_string()))?;

    rows.collect::<rusqlite::Result<Vec<_>>>()
        .map_err(|e| NodeError::Indexing(e.to_string()))
}

/// Minimal single-`*` glob: `*` matches any run of characters, everything
/// else must match literally.
pub(crate) fn glob_match(pattern: &str, candidate: &str) -> bool {
    match pattern.split_once('*') {
        None => pattern == candidate,
        Some((prefix, suffix)) => {
            candidate.starts_with(prefix)
                && candidate.ends_with(suffix)
                && candidate.len() >= prefix.len() + suffix.len()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn glob_match_handles_single_wildcard() {
        assert!(glob_match("*.json", "data.json"));
        assert!(!glob_match("*.json", "data.txt"));
        assert!(glob_match("data/*", "data/users.json"));
        assert!(glob_match("content.json", "content.json"));
    }

    #[test]
    fn index_site_is_noop_without_schema() {
        let dir = tempfile::tempdir().unwrap();
        index_site(dir.path());
    }

    #[test]
    fn index_site_indexes_matching_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(SCHEMA_FILE),
            br#"{"db_file": "site.db", "maps": {"data/*.json": {"to_table": "posts", "columns": {"title": "/title"}}}}"#,
        )
        .unwrap();
        std::fs::create_dir_all(dir.path().join("data")).unwrap();
        std::fs::write(
            dir.path().join("data/post1.json"),
            br#"{"title": "hello"}"#,
        )
        .unwrap();

        index_site(dir.path());

        let conn = Connection::open(dir.path().join("site.db")).unwrap();
        let title: String = conn
            .query_row(
                "SELECT title FROM posts WHERE inner_path = ?1",
                ["data/post1.json"],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(title, "hello");
    }
}

//! Introspects a user table's columns and validates it is a fit candidate
//! for change tracking.

use rusqlite::Connection;

use crate::error::{CloudsyncError, Result};
use crate::settings::SettingsStore;

pub const KEY_DISABLE_ROWIDONLY_TABLES: &str = "disable_rowidonly_tables";

/// Reserved table-name prefix; no user table may collide with it.
const META_PREFIX: &str = "cloudsync_";

/// Column layout of a table considered for tracking.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSchema {
    pub table: String,
    pub pk_columns: Vec<String>,
    pub non_pk_columns: Vec<String>,
    /// True if the single INTEGER PRIMARY KEY column is a rowid alias.
    pub is_rowid_alias: bool,
}

#[derive(Debug, Clone)]
struct ColumnInfo {
    name: String,
    decl_type: String,
    pk_index: i32, // 0 = not part of pk
}

fn table_columns(conn: &Connection, table: &str) -> Result<Vec<ColumnInfo>> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", quote_ident(table)))?;
    let rows = stmt.query_map([], |row| {
        Ok(ColumnInfo {
            name: row.get(1)?,
            decl_type: row.get::<_, String>(2)?,
            pk_index: row.get(5)?,
        })
    })?;
    let mut out = Vec::new();
    for r in rows {
        out.push(r?);
    }
    Ok(out)
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Validate a table name against the reserved-name and wildcard rules of
/// spec.md §4.4. `"*"` (exactly) is always accepted, meaning "all tables".
pub fn validate_table_name(name: &str) -> Result<()> {
    if name == "*" {
        return Ok(());
    }
    if name.contains('*') {
        return Err(CloudsyncError::Schema(format!(
            "table name '{name}' may not contain '*' unless it is exactly '*'"
        )));
    }
    if name.starts_with(META_PREFIX) {
        return Err(CloudsyncError::Schema(format!(
            "table name '{name}' collides with reserved cloudsync meta objects"
        )));
    }
    Ok(())
}

/// Inspect `table`, returning its primary-key/non-primary-key column split,
/// or a schema error explaining why the table cannot be tracked.
pub fn inspect(conn: &Connection, settings: &SettingsStore, table: &str) -> Result<TableSchema> {
    validate_table_name(table)?;

    let columns = table_columns(conn, table)?;
    if columns.is_empty() {
        return Err(CloudsyncError::Schema(format!("table '{table}' does not exist")));
    }

    let mut pk: Vec<&ColumnInfo> = columns.iter().filter(|c| c.pk_index > 0).collect();
    pk.sort_by_key(|c| c.pk_index);

    if pk.is_empty() {
        return Err(CloudsyncError::Schema(format!(
            "table '{table}' has no primary key"
        )));
    }

    let is_rowid_alias = pk.len() == 1 && pk[0].decl_type.eq_ignore_ascii_case("integer");
    if is_rowid_alias {
        let disabled = settings
            .get_table_string(table, "", KEY_DISABLE_ROWIDONLY_TABLES)?
            .or_else(|| settings.get_string(KEY_DISABLE_ROWIDONLY_TABLES).ok().flatten())
            .map(|v| v != "0")
            .unwrap_or(true);
        if disabled {
            return Err(CloudsyncError::Schema(format!(
                "table '{table}' has a single INTEGER primary key with rowid semantics; \
                 set {KEY_DISABLE_ROWIDONLY_TABLES}=0 to allow it"
            )));
        }
    }

    let pk_columns: Vec<String> = pk.iter().map(|c| c.name.clone()).collect();
    let non_pk_columns: Vec<String> = columns
        .iter()
        .filter(|c| c.pk_index == 0)
        .map(|c| c.name.clone())
        .collect();

    Ok(TableSchema {
        table: table.to_string(),
        pk_columns,
        non_pk_columns,
        is_rowid_alias,
    })
}

/// Expand `"*"` into the concrete names of all tracked user tables (those
/// that are not themselves cloudsync meta objects and are not SQLite
/// internal tables).
pub fn list_user_tables(conn: &Connection) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT name FROM sqlite_master
         WHERE type = 'table'
           AND name NOT LIKE 'sqlite_%'
           AND name NOT LIKE 'cloudsync\\_%' ESCAPE '\\'",
    )?;
    let rows = stmt.query_map([], |r| r.get::<_, String>(0))?;
    let mut out = Vec::new();
    for r in rows {
        out.push(r?);
    }
    Ok(out)
}

/// The literal CREATE TABLE definition text for a table, as stored by
/// SQLite, used as input to the schema hash in spec.md §4.3.
pub fn table_definition(conn: &Connection, table: &str) -> Result<String> {
    conn.query_row(
        "SELECT sql FROM sqlite_master WHERE type='table' AND name = ?1",
        [table],
        |r| r.get(0),
    )
    .map_err(CloudsyncError::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        SettingsStore::new(&conn).init_schema().unwrap();
        conn
    }

    #[test]
    fn rejects_missing_primary_key() {
        let conn = open();
        conn.execute("CREATE TABLE t(a TEXT, b TEXT)", []).unwrap();
        let settings = SettingsStore::new(&conn);
        assert!(inspect(&conn, &settings, "t").is_err());
    }

    #[test]
    fn rejects_reserved_name() {
        assert!(validate_table_name("cloudsync_changes").is_err());
    }

    #[test]
    fn accepts_bare_star() {
        assert!(validate_table_name("*").is_ok());
    }

    #[test]
    fn rejects_partial_wildcard() {
        assert!(validate_table_name("foo*").is_err());
    }

    #[test]
    fn rejects_rowid_alias_by_default() {
        let conn = open();
        conn.execute("CREATE TABLE t(id INTEGER PRIMARY KEY, v TEXT)", [])
            .unwrap();
        let settings = SettingsStore::new(&conn);
        assert!(inspect(&conn, &settings, "t").is_err());
    }

    #[test]
    fn accepts_rowid_alias_when_disabled_flag_cleared() {
        let conn = open();
        conn.execute("CREATE TABLE t(id INTEGER PRIMARY KEY, v TEXT)", [])
            .unwrap();
        let settings = SettingsStore::new(&conn);
        settings
            .set_string(KEY_DISABLE_ROWIDONLY_TABLES, "0")
            .unwrap();
        let schema = inspect(&conn, &settings, "t").unwrap();
        assert_eq!(schema.pk_columns, vec!["id".to_string()]);
    }

    #[test]
    fn splits_composite_primary_key_in_declared_order() {
        let conn = open();
        conn.execute(
            "CREATE TABLE t(b TEXT, a TEXT, v TEXT, PRIMARY KEY(a, b))",
            [],
        )
        .unwrap();
        let settings = SettingsStore::new(&conn);
        let schema = inspect(&conn, &settings, "t").unwrap();
        assert_eq!(schema.pk_columns, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(schema.non_pk_columns, vec!["v".to_string()]);
    }
}

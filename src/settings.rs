//! `cloudsync_settings` / `cloudsync_table_settings`: the per-database and
//! per-table key/value configuration store, plus the schema-hash guard.

use rusqlite::{Connection, OptionalExtension, params};

use crate::error::Result;
use crate::idgen::SiteId;

pub const KEY_VERSION: &str = "version";
pub const KEY_SCHEMA_VERSION: &str = "schemaversion";
pub const KEY_SCHEMA_HASH: &str = "schemahash";
pub const KEY_CHECK_DBVERSION: &str = "check_dbversion";
pub const KEY_CHECK_SEQ: &str = "check_seq";
pub const KEY_SEND_DBVERSION: &str = "send_dbversion";
pub const KEY_SEND_SEQ: &str = "send_seq";
pub const KEY_DEBUG: &str = "debug";
pub const KEY_ALGO: &str = "algo";
/// Highest database version ever allocated locally; advanced by the trigger
/// installer's generated trigger bodies inside the capturing transaction.
pub const KEY_DBVERSION: &str = "dbversion";

pub const LIBRARY_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Thin read/write facade over `cloudsync_settings` and
/// `cloudsync_table_settings`. Mirrors the teacher's key/value `sync_kv`
/// pattern, generalized to database- and table-scoped keys.
pub struct SettingsStore<'c> {
    conn: &'c Connection,
}

impl<'c> SettingsStore<'c> {
    pub fn new(conn: &'c Connection) -> Self {
        Self { conn }
    }

    pub fn init_schema(&self) -> Result<()> {
        self.conn.execute_batch(
            r#"
CREATE TABLE IF NOT EXISTS cloudsync_site_id (
    id INTEGER PRIMARY KEY CHECK (id = 0),
    site_id BLOB NOT NULL
);

CREATE TABLE IF NOT EXISTS cloudsync_settings (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS cloudsync_table_settings (
    table_name TEXT NOT NULL,
    column_name TEXT NOT NULL DEFAULT '',
    key TEXT NOT NULL,
    value TEXT NOT NULL,
    PRIMARY KEY (table_name, column_name, key)
);
"#,
        )?;
        self.set_if_absent(KEY_VERSION, LIBRARY_VERSION)?;
        self.set_if_absent(KEY_SCHEMA_VERSION, "1")?;
        self.set_if_absent(KEY_DEBUG, "0")?;
        self.set_if_absent(KEY_DBVERSION, "0")?;
        self.set_if_absent(KEY_CHECK_DBVERSION, "0")?;
        self.set_if_absent(KEY_CHECK_SEQ, "0")?;
        self.set_if_absent(KEY_SEND_DBVERSION, "0")?;
        self.set_if_absent(KEY_SEND_SEQ, "0")?;
        Ok(())
    }

    fn set_if_absent(&self, key: &str, value: &str) -> Result<()> {
        self.conn.execute(
            "INSERT INTO cloudsync_settings(key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO NOTHING",
            params![key, value],
        )?;
        Ok(())
    }

    /// The site id for this database, generating and persisting a new one
    /// the first time it is requested.
    pub fn site_id(&self) -> Result<SiteId> {
        let existing: Option<Vec<u8>> = self
            .conn
            .query_row("SELECT site_id FROM cloudsync_site_id WHERE id = 0", [], |r| {
                r.get(0)
            })
            .optional()?;
        if let Some(bytes) = existing {
            return SiteId::from_slice(&bytes);
        }
        let id = SiteId::new();
        self.conn.execute(
            "INSERT INTO cloudsync_site_id(id, site_id) VALUES (0, ?1)",
            params![id.as_bytes().to_vec()],
        )?;
        Ok(id)
    }

    pub fn get_string(&self, key: &str) -> Result<Option<String>> {
        let v = self
            .conn
            .query_row("SELECT value FROM cloudsync_settings WHERE key = ?1", params![key], |r| {
                r.get(0)
            })
            .optional()?;
        Ok(v)
    }

    /// Missing integer keys read as 0, per spec.
    pub fn get_int(&self, key: &str) -> Result<i64> {
        Ok(self
            .get_string(key)?
            .and_then(|s| s.parse::<i64>().ok())
            .unwrap_or(0))
    }

    pub fn set_string(&self, key: &str, value: &str) -> Result<()> {
        self.conn.execute(
            "INSERT INTO cloudsync_settings(key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        Ok(())
    }

    pub fn set_int(&self, key: &str, value: i64) -> Result<()> {
        self.set_string(key, &value.to_string())
    }

    /// Table-scoped variant, keyed by `(table, column)`; `column` is `""`
    /// for a table-level (not column-level) override.
    pub fn get_table_string(&self, table: &str, column: &str, key: &str) -> Result<Option<String>> {
        let v = self
            .conn
            .query_row(
                "SELECT value FROM cloudsync_table_settings
                 WHERE table_name = ?1 AND column_name = ?2 AND key = ?3",
                params![table, column, key],
                |r| r.get(0),
            )
            .optional()?;
        Ok(v)
    }

    pub fn set_table_string(&self, table: &str, column: &str, key: &str, value: &str) -> Result<()> {
        self.conn.execute(
            "INSERT INTO cloudsync_table_settings(table_name, column_name, key, value)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(table_name, column_name, key) DO UPDATE SET value = excluded.value",
            params![table, column, key, value],
        )?;
        Ok(())
    }

    pub fn algo_for_table(&self, table: &str) -> Result<Option<String>> {
        self.get_table_string(table, "", KEY_ALGO)
    }

    pub fn set_algo_for_table(&self, table: &str, algo: &str) -> Result<()> {
        self.set_table_string(table, "", KEY_ALGO, algo)
    }

    pub fn is_debug(&self) -> Result<bool> {
        Ok(self.get_int(KEY_DEBUG)? != 0)
    }

    /// Send cursor: `(send_dbversion, send_seq)`.
    pub fn send_cursor(&self) -> Result<(u64, u32)> {
        Ok((
            self.get_int(KEY_SEND_DBVERSION)? as u64,
            self.get_int(KEY_SEND_SEQ)? as u32,
        ))
    }

    pub fn set_send_cursor(&self, db_version: u64, seq: u32) -> Result<()> {
        self.set_int(KEY_SEND_DBVERSION, db_version as i64)?;
        self.set_int(KEY_SEND_SEQ, seq as i64)
    }

    /// Check cursor: `(check_dbversion, check_seq)`.
    pub fn check_cursor(&self) -> Result<(u64, u32)> {
        Ok((
            self.get_int(KEY_CHECK_DBVERSION)? as u64,
            self.get_int(KEY_CHECK_SEQ)? as u32,
        ))
    }

    pub fn set_check_cursor(&self, db_version: u64, seq: u32) -> Result<()> {
        self.set_int(KEY_CHECK_DBVERSION, db_version as i64)?;
        self.set_int(KEY_CHECK_SEQ, seq as i64)
    }

    pub fn reset_check_cursor(&self) -> Result<()> {
        self.set_check_cursor(0, 0)
    }

    pub fn current_db_version(&self) -> Result<u64> {
        Ok(self.get_int(KEY_DBVERSION)? as u64)
    }

    pub fn schema_hash(&self) -> Result<Option<String>> {
        self.get_string(KEY_SCHEMA_HASH)
    }

    pub fn set_schema_hash(&self, hash: &str) -> Result<()> {
        self.set_string(KEY_SCHEMA_HASH, hash)
    }
}

/// FNV-1a-64 over the concatenated CREATE-TABLE definitions of all tracked
/// tables in a stable (sorted) order, per spec.md §4.3.
pub fn schema_hash(table_definitions: &[String]) -> String {
    let mut sorted = table_definitions.to_vec();
    sorted.sort();
    let mut hash: u64 = 0xcbf29ce484222325;
    for def in sorted {
        for byte in def.as_bytes() {
            hash ^= *byte as u64;
            hash = hash.wrapping_mul(0x100000001b3);
        }
        // separator byte so "ab","c" and "a","bc" don't collide
        hash ^= 0x00;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    format!("{hash:016x}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open() -> Connection {
        Connection::open_in_memory().unwrap()
    }

    #[test]
    fn missing_int_key_reads_zero() {
        let conn = open();
        let store = SettingsStore::new(&conn);
        store.init_schema().unwrap();
        assert_eq!(store.get_int("nonexistent").unwrap(), 0);
    }

    #[test]
    fn site_id_persists_across_lookups() {
        let conn = open();
        let store = SettingsStore::new(&conn);
        store.init_schema().unwrap();
        let a = store.site_id().unwrap();
        let b = store.site_id().unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn cursors_round_trip() {
        let conn = open();
        let store = SettingsStore::new(&conn);
        store.init_schema().unwrap();
        store.set_send_cursor(42, 7).unwrap();
        assert_eq!(store.send_cursor().unwrap(), (42, 7));
    }

    #[test]
    fn schema_hash_is_order_independent() {
        let a = schema_hash(&["CREATE TABLE t(a)".into(), "CREATE TABLE u(b)".into()]);
        let b = schema_hash(&["CREATE TABLE u(b)".into(), "CREATE TABLE t(a)".into()]);
        assert_eq!(a, b);
    }
}

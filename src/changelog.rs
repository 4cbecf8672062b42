//! The `cloudsync_changes` store: one row per `(table, pk, column)` change,
//! plus the database-version/sequence packing used as its row id.

use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{Connection, Row, params};

use crate::codec::Value;
use crate::error::{CloudsyncError, Result};
use crate::idgen::SiteId;

/// Sentinel `col_name` meaning "this entry is a row-level causal-length
/// change", not a column value change.
pub const ROW_LEVEL_COLUMN: &str = "";

/// 30 bits: the width of the per-transaction sequence counter.
pub const SEQ_BITS: u32 = 30;
pub const SEQ_MASK: u64 = (1u64 << SEQ_BITS) - 1;

/// Pack `(db_version, seq)` into the change log's row id:
/// `(db_version << 30) | seq`. Errors if either component doesn't fit.
pub fn pack_change_id(db_version: u64, seq: u32) -> Result<i64> {
    if seq as u64 > SEQ_MASK {
        return Err(CloudsyncError::Integrity(format!(
            "sequence {seq} exceeds 30-bit width"
        )));
    }
    let packed = (db_version << SEQ_BITS) | (seq as u64);
    i64::try_from(packed)
        .map_err(|_| CloudsyncError::Integrity("db_version overflowed change id packing".into()))
}

/// Inverse of [`pack_change_id`].
pub fn unpack_change_id(id: i64) -> (u64, u32) {
    let id = id as u64;
    (id >> SEQ_BITS, (id & SEQ_MASK) as u32)
}

/// The CRDT algorithm chosen for a tracked table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Algo {
    /// Grow-Only Set: inserts only, deletes are rejected.
    Gos,
    /// Causal-Length Set: liveness tracked by a strictly-increasing CL.
    Cls,
    /// Delete-Wins Set: a tombstone, once seen, is sticky.
    Dws,
    /// Add-Wins Set: a concurrent insert dominates a concurrent delete.
    Aws,
}

impl Algo {
    pub fn as_str(self) -> &'static str {
        match self {
            Algo::Gos => "gos",
            Algo::Cls => "cls",
            Algo::Dws => "dws",
            Algo::Aws => "aws",
        }
    }

    pub fn parse(s: &str) -> Result<Algo> {
        match s.to_ascii_lowercase().as_str() {
            "gos" => Ok(Algo::Gos),
            "cls" => Ok(Algo::Cls),
            "dws" => Ok(Algo::Dws),
            "aws" => Ok(Algo::Aws),
            other => Err(CloudsyncError::Schema(format!("unknown algorithm '{other}'"))),
        }
    }
}

/// The atomic unit of replication: a single captured or received change.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEntry {
    pub table: String,
    /// Encoded primary key, per the codec's primary-key form.
    pub pk: Vec<u8>,
    /// `None` means this is a row-level (causal-length) change.
    pub column: Option<String>,
    pub value: Value,
    pub col_version: u64,
    pub db_version: u64,
    pub site_id: SiteId,
    pub cl: u64,
    pub seq: u32,
}

impl ChangeEntry {
    pub fn change_id(&self) -> Result<i64> {
        pack_change_id(self.db_version, self.seq)
    }

    pub fn is_row_level(&self) -> bool {
        self.column.is_none()
    }
}

fn value_to_sql(value: &Value) -> SqlValue {
    match value {
        Value::Integer(n) => SqlValue::Integer(*n),
        Value::Float(f) => SqlValue::Real(*f),
        Value::Text(s) => SqlValue::Text(s.clone()),
        Value::Blob(b) => SqlValue::Blob(b.clone()),
        Value::Null => SqlValue::Null,
        Value::Tombstone => SqlValue::Text(crate::codec::TOMBSTONE.to_string()),
        Value::RlsRestricted => SqlValue::Text(crate::codec::RLS_RESTRICTED.to_string()),
    }
}

fn value_from_ref(v: ValueRef<'_>) -> Result<Value> {
    Ok(match v {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(n) => Value::Integer(n),
        ValueRef::Real(f) => Value::Float(f),
        ValueRef::Text(t) => {
            Value::from_raw_text(String::from_utf8_lossy(t).into_owned())
        }
        ValueRef::Blob(b) => Value::Blob(b.to_vec()),
    })
}

fn row_to_entry(row: &Row<'_>) -> rusqlite::Result<ChangeEntry> {
    let table: String = row.get("tbl")?;
    let pk: Vec<u8> = row.get("pk")?;
    let col_name: String = row.get("col_name")?;
    let value_ref = row.get_ref("value")?;
    let value = value_from_ref(value_ref)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Null, Box::new(e)))?;
    let col_version: i64 = row.get("col_version")?;
    let db_version: i64 = row.get("db_version")?;
    let site_id_bytes: Vec<u8> = row.get("site_id")?;
    let site_id = SiteId::from_slice(&site_id_bytes)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Blob, Box::new(e)))?;
    let cl: i64 = row.get("cl")?;
    let seq: i64 = row.get("seq")?;

    Ok(ChangeEntry {
        table,
        pk,
        column: if col_name.is_empty() { None } else { Some(col_name) },
        value,
        col_version: col_version as u64,
        db_version: db_version as u64,
        site_id,
        cl: cl as u64,
        seq: seq as u32,
    })
}

/// Physical storage for the change log, backing the virtual
/// `cloudsync_changes` table described in spec.md §4.7.
pub struct ChangeLog<'c> {
    conn: &'c Connection,
}

impl<'c> ChangeLog<'c> {
    pub fn new(conn: &'c Connection) -> Self {
        Self { conn }
    }

    pub fn init_schema(&self) -> Result<()> {
        self.conn.execute_batch(
            r#"
CREATE TABLE IF NOT EXISTS cloudsync_changes (
    id INTEGER PRIMARY KEY,
    tbl TEXT NOT NULL,
    pk BLOB NOT NULL,
    col_name TEXT NOT NULL DEFAULT '',
    value,
    col_version INTEGER NOT NULL,
    db_version INTEGER NOT NULL,
    site_id BLOB NOT NULL,
    cl INTEGER NOT NULL,
    seq INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_cloudsync_changes_cursor ON cloudsync_changes(db_version, seq);
CREATE INDEX IF NOT EXISTS idx_cloudsync_changes_site ON cloudsync_changes(site_id, db_version, seq);
CREATE INDEX IF NOT EXISTS idx_cloudsync_changes_row ON cloudsync_changes(tbl, pk, col_name);
"#,
        )?;
        Ok(())
    }

    /// Append one entry to the log. The caller (trigger-generated SQL, or
    /// the merge engine applying a foreign change) is responsible for
    /// having already computed a collision-free `(db_version, seq)`.
    pub fn append(&self, entry: &ChangeEntry) -> Result<()> {
        let id = entry.change_id()?;
        self.conn.execute(
            "INSERT INTO cloudsync_changes
                (id, tbl, pk, col_name, value, col_version, db_version, site_id, cl, seq)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                id,
                entry.table,
                entry.pk,
                entry.column.clone().unwrap_or_default(),
                value_to_sql(&entry.value),
                entry.col_version as i64,
                entry.db_version as i64,
                entry.site_id.as_bytes().to_vec(),
                entry.cl as i64,
                entry.seq as i64,
            ],
        )?;
        Ok(())
    }

    /// Current locally stored per-(table,pk,column) entry, if any. Used by
    /// the merge engine to compare a foreign change against local state.
    pub fn current(&self, table: &str, pk: &[u8], column: Option<&str>) -> Result<Option<ChangeEntry>> {
        let col = column.unwrap_or(ROW_LEVEL_COLUMN);
        let entry = self
            .conn
            .query_row(
                "SELECT * FROM cloudsync_changes
                 WHERE tbl = ?1 AND pk = ?2 AND col_name = ?3
                 ORDER BY db_version DESC, seq DESC LIMIT 1",
                params![table, pk, col],
                row_to_entry,
            )
            .optional_none()?;
        Ok(entry)
    }

    /// The local entry for this pk (any column, including the row-level
    /// tombstone slot) carrying the highest causal length seen so far. The
    /// merge engine uses this to gate liveness decisions that span more than
    /// one column, since inserts/updates only ever touch their own column's
    /// slot while deletes write the row-level slot.
    pub fn latest_for_row(&self, table: &str, pk: &[u8]) -> Result<Option<ChangeEntry>> {
        let entry = self
            .conn
            .query_row(
                "SELECT * FROM cloudsync_changes
                 WHERE tbl = ?1 AND pk = ?2
                 ORDER BY cl DESC, db_version DESC, seq DESC LIMIT 1",
                params![table, pk],
                row_to_entry,
            )
            .optional_none()?;
        Ok(entry)
    }

    /// All entries with `(db_version, seq) > cursor`, in order, capped at
    /// `limit` rows. This is the read side of the virtual changes table.
    pub fn changes_since(&self, cursor: (u64, u32), limit: i64) -> Result<Vec<ChangeEntry>> {
        let mut stmt = self.conn.prepare(
            "SELECT * FROM cloudsync_changes
             WHERE db_version > ?1 OR (db_version = ?1 AND seq > ?2)
             ORDER BY db_version ASC, seq ASC
             LIMIT ?3",
        )?;
        let rows = stmt.query_map(params![cursor.0 as i64, cursor.1 as i64, limit], row_to_entry)?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    /// Entries captured locally (by `site_id`) beyond `cursor` — the upload
    /// candidate set for the sync orchestrator.
    pub fn local_changes_since(&self, site_id: &SiteId, cursor: (u64, u32), limit: i64) -> Result<Vec<ChangeEntry>> {
        let mut stmt = self.conn.prepare(
            "SELECT * FROM cloudsync_changes
             WHERE site_id = ?1 AND (db_version > ?2 OR (db_version = ?2 AND seq > ?3))
             ORDER BY db_version ASC, seq ASC
             LIMIT ?4",
        )?;
        let rows = stmt.query_map(
            params![site_id.as_bytes().to_vec(), cursor.0 as i64, cursor.1 as i64, limit],
            row_to_entry,
        )?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }
}

/// Max `(db_version, seq)` across a batch, used to advance cursors.
pub fn max_cursor(entries: &[ChangeEntry]) -> Option<(u64, u32)> {
    entries
        .iter()
        .map(|e| (e.db_version, e.seq))
        .max_by(|a, b| a.0.cmp(&b.0).then(a.1.cmp(&b.1)))
}

trait OptionalNoneExt<T> {
    fn optional_none(self) -> Result<Option<T>>;
}

impl<T> OptionalNoneExt<T> for rusqlite::Result<T> {
    fn optional_none(self) -> Result<Option<T>> {
        match self {
            Ok(v) => Ok(Some(v)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(CloudsyncError::from(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packing_roundtrips() {
        for (db, seq) in [(0u64, 0u32), (1, 1), (1_000_000, 999), (u32::MAX as u64, 0)] {
            let id = pack_change_id(db, seq).unwrap();
            assert_eq!(unpack_change_id(id), (db, seq));
        }
    }

    #[test]
    fn rejects_seq_overflow() {
        assert!(pack_change_id(1, 1 << 30).is_err());
    }

    #[test]
    fn append_and_read_back() {
        let conn = Connection::open_in_memory().unwrap();
        let log = ChangeLog::new(&conn);
        log.init_schema().unwrap();
        let site = SiteId::new();
        let entry = ChangeEntry {
            table: "t".into(),
            pk: vec![1, 42],
            column: Some("v".into()),
            value: Value::Text("a".into()),
            col_version: 1,
            db_version: 1,
            site_id: site,
            cl: 1,
            seq: 0,
        };
        log.append(&entry).unwrap();
        let got = log.current("t", &entry.pk, Some("v")).unwrap().unwrap();
        assert_eq!(got.value, Value::Text("a".into()));
        assert_eq!(got.col_version, 1);

        let since = log.changes_since((0, 0), 10).unwrap();
        assert_eq!(since.len(), 1);
    }

    #[test]
    fn max_cursor_picks_highest_pair() {
        let site = SiteId::new();
        let mk = |db, seq| ChangeEntry {
            table: "t".into(),
            pk: vec![],
            column: None,
            value: Value::Null,
            col_version: 0,
            db_version: db,
            site_id: site,
            cl: 1,
            seq,
        };
        let entries = vec![mk(1, 5), mk(2, 0), mk(2, 3)];
        assert_eq!(max_cursor(&entries), Some((2, 3)));
    }
}

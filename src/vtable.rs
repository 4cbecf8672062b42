//! The `cloudsync_changes` virtual table: SELECT streams the local change
//! log, INSERT hands a foreign change to the merge engine. The host
//! engine's actual virtual-table hooks are an external collaborator (see
//! spec.md §1); this module is the gateway the core exposes for the host
//! to wire up, and it is also what `ffi.rs` calls directly.

use rusqlite::Connection;

use crate::changelog::{Algo, ChangeEntry, ChangeLog};
use crate::error::Result;
use crate::merge::{MergeEngine, MergeObserver, MergeOutcome, NoopObserver};
use crate::schema::TableSchema;

/// Columns of the projected virtual table, in wire/row order — see
/// spec.md §6.
pub const COLUMNS: &[&str] = &[
    "tbl",
    "pk",
    "col_name",
    "col_value",
    "col_version",
    "db_version",
    "site_id",
    "cl",
    "seq",
];

pub struct ChangesTable<'c> {
    conn: &'c Connection,
}

impl<'c> ChangesTable<'c> {
    pub fn new(conn: &'c Connection) -> Self {
        Self { conn }
    }

    /// SELECT side: rows with `(db_version, seq) > cursor`, in order.
    pub fn select_since(&self, cursor: (u64, u32), limit: i64) -> Result<Vec<ChangeEntry>> {
        ChangeLog::new(self.conn).changes_since(cursor, limit)
    }

    /// INSERT side: a peer sent us `entry`; forward it to the merge engine.
    /// Returns the affected-row count (`1` applied, `0` skipped by policy).
    /// Only storage/schema errors propagate as `Err`.
    pub fn insert(&self, entry: &ChangeEntry, algo: Algo, schema: &TableSchema) -> Result<usize> {
        self.insert_with_observer(entry, algo, schema, &mut NoopObserver)
    }

    pub fn insert_with_observer(
        &self,
        entry: &ChangeEntry,
        algo: Algo,
        schema: &TableSchema,
        observer: &mut dyn MergeObserver,
    ) -> Result<usize> {
        let engine = MergeEngine::new(self.conn);
        let outcome = engine.apply_foreign_change(entry, algo, schema, observer)?;
        Ok(if matches!(outcome, MergeOutcome::Applied) { 1 } else { 0 })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Value;
    use crate::idgen::SiteId;
    use crate::settings::SettingsStore;

    fn setup(conn: &Connection) -> TableSchema {
        SettingsStore::new(conn).init_schema().unwrap();
        ChangeLog::new(conn).init_schema().unwrap();
        conn.execute("CREATE TABLE t(id TEXT PRIMARY KEY, v TEXT)", []).unwrap();
        TableSchema {
            table: "t".into(),
            pk_columns: vec!["id".into()],
            non_pk_columns: vec!["v".into()],
            is_rowid_alias: false,
        }
    }

    #[test]
    fn insert_applies_new_row_and_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        let schema = setup(&conn);
        let table = ChangesTable::new(&conn);

        let pk = crate::codec::encode_pk(&[Value::Text("1".into())]).unwrap();
        let entry = ChangeEntry {
            table: "t".into(),
            pk,
            column: Some("v".into()),
            value: Value::Text("hello".into()),
            col_version: 1,
            db_version: 1,
            site_id: SiteId::at(1),
            cl: 1,
            seq: 0,
        };

        let affected = table.insert(&entry, Algo::Cls, &schema).unwrap();
        assert_eq!(affected, 1);

        let v: String = conn
            .query_row("SELECT v FROM t WHERE id = '1'", [], |r| r.get(0))
            .unwrap();
        assert_eq!(v, "hello");

        // Applying the identical change again is a no-op.
        let affected2 = table.insert(&entry, Algo::Cls, &schema).unwrap();
        assert_eq!(affected2, 0);
    }
}

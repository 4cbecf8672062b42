//! Trigger installer: synthesizes the AFTER INSERT/UPDATE/DELETE triggers
//! that capture user-table mutations into the change log, per spec.md §4.5.
//!
//! Per-table meta is kept in `cloudsync_<table>_meta(pk, col_name, version)`:
//! the row where `col_name = ''` carries the row's causal length, every other
//! row carries one tracked column's version counter. A stateless scalar
//! function, `cloudsync_pkenc`, turns the trigger's `NEW`/`OLD` primary-key
//! columns into the codec's primary-key blob without needing a `Connection`
//! handle inside the callback — the rest of the bookkeeping (db_version/seq
//! allocation) is plain generated SQL against a per-connection temp table,
//! so no reentrant FFI access to the connection is ever required.

use rusqlite::functions::FunctionFlags;
use rusqlite::Connection;

use crate::changelog::{Algo, ROW_LEVEL_COLUMN};
use crate::codec::{self, Value};
use crate::error::Result;
use crate::schema::TableSchema;

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn meta_table(table: &str) -> String {
    format!("cloudsync_{table}_meta")
}

/// Registers the `cloudsync_pkenc(v1, v2, ...)` scalar UDF used by
/// generated trigger SQL to encode a row's primary-key columns to the
/// codec's blob form. Variadic (`n_args = -1`) and pure: it touches no
/// connection state, so it is safe to call while a trigger is mid-statement.
pub fn register_pkenc_function(conn: &Connection) -> Result<()> {
    conn.create_scalar_function(
        "cloudsync_pkenc",
        -1,
        FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC,
        |ctx| {
            let mut values = Vec::with_capacity(ctx.len());
            for i in 0..ctx.len() {
                let v = match ctx.get_raw(i) {
                    rusqlite::types::ValueRef::Null => Value::Null,
                    rusqlite::types::ValueRef::Integer(n) => Value::Integer(n),
                    rusqlite::types::ValueRef::Real(f) => Value::Float(f),
                    rusqlite::types::ValueRef::Text(t) => {
                        Value::from_raw_text(String::from_utf8_lossy(t).into_owned())
                    }
                    rusqlite::types::ValueRef::Blob(b) => Value::Blob(b.to_vec()),
                };
                values.push(v);
            }
            codec::encode_pk(&values).map_err(|e| rusqlite::Error::UserFunctionError(Box::new(e)))
        },
    )?;
    Ok(())
}

/// Ensures the per-transaction counter scratch table exists. `dbversion` is
/// allocated once per capturing transaction (every trigger firing within
/// the same transaction shares it); `seq` increments per captured row.
fn ensure_tx_state(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TEMP TABLE IF NOT EXISTS cloudsync_tx_state (
            id INTEGER PRIMARY KEY CHECK (id = 0),
            db_version INTEGER NOT NULL DEFAULT 0,
            seq INTEGER NOT NULL DEFAULT 0,
            active INTEGER NOT NULL DEFAULT 0
         );
         INSERT OR IGNORE INTO cloudsync_tx_state(id, db_version, seq, active) VALUES (0, 0, 0, 0);",
    )?;
    Ok(())
}

/// Expression that allocates (or reuses, within the same transaction) the
/// current `db_version`, bumping `cloudsync_settings.dbversion` the first
/// time it is touched. Embedded into generated trigger bodies as a
/// subquery so no UDF needs a connection handle.
fn alloc_db_version_sql() -> &'static str {
    "(SELECT CASE WHEN active = 0 THEN
        (SELECT value FROM cloudsync_settings WHERE key = 'dbversion') + 1
      ELSE db_version END
      FROM cloudsync_tx_state WHERE id = 0)"
}

/// Marks the per-connection counter scratch table as free for reuse by the
/// next capturing transaction. The host's transaction-begin hook (an
/// external collaborator — whichever mechanism the embedding SQL engine
/// uses to notice `BEGIN`) is expected to call this once per top-level
/// transaction; trigger bodies only ever read and conditionally extend the
/// current allocation, they never reset it themselves; see DESIGN.md.
pub fn reset_tx_scope(conn: &Connection) -> Result<()> {
    ensure_tx_state(conn)?;
    conn.execute("UPDATE cloudsync_tx_state SET active = 0 WHERE id = 0", [])?;
    Ok(())
}

/// Allocates the `(db_version, seq)` pair for one about-to-be-logged change
/// row. `predicate` must be the exact same boolean expression that gates the
/// change-log `INSERT ... WHERE` it precedes (e.g. `NEW.col IS NOT NULL` for
/// an insert, `NEW.col IS NOT OLD.col` for an update), so `seq` only
/// advances for columns that are actually captured — a trigger firing that
/// touches several columns must hand each logged row a distinct `seq`
/// rather than reusing one `seq` for the whole row (which would collide on
/// `cloudsync_changes`'s packed `(db_version << 30) | seq` primary key).
fn begin_or_continue_tx_sql(predicate: &str) -> String {
    format!(
        "UPDATE cloudsync_tx_state SET
            db_version = CASE WHEN active = 0 THEN {alloc} ELSE db_version END,
            seq = CASE
                    WHEN active = 0 THEN 0
                    WHEN {predicate} THEN seq + 1
                    ELSE seq
                  END,
            active = 1
         WHERE id = 0;
         UPDATE cloudsync_settings SET value = (SELECT db_version FROM cloudsync_tx_state WHERE id = 0)
         WHERE key = 'dbversion'
           AND CAST(value AS INTEGER) < (SELECT db_version FROM cloudsync_tx_state WHERE id = 0);",
        alloc = alloc_db_version_sql(),
    )
}

fn new_pk_encoded(schema: &TableSchema, prefix: &str) -> String {
    let args = schema
        .pk_columns
        .iter()
        .map(|c| format!("{prefix}.{}", quote_ident(c)))
        .collect::<Vec<_>>()
        .join(", ");
    format!("cloudsync_pkenc({args})")
}

/// Install meta table + AFTER INSERT/UPDATE/DELETE triggers for `schema`
/// under `algo`. Idempotent: safe to call again after `drop_triggers`.
pub fn install_triggers(conn: &Connection, schema: &TableSchema, algo: Algo, site_id_hex: &str) -> Result<()> {
    ensure_tx_state(conn)?;
    let table = &schema.table;
    let meta = meta_table(table);

    conn.execute_batch(&format!(
        "CREATE TABLE IF NOT EXISTS \"{meta}\" (
            pk BLOB NOT NULL,
            col_name TEXT NOT NULL DEFAULT '',
            version INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (pk, col_name)
         );"
    ))?;

    install_insert_trigger(conn, schema, site_id_hex)?;
    install_update_trigger(conn, schema, site_id_hex)?;
    install_delete_trigger(conn, schema, algo, site_id_hex)?;

    Ok(())
}

fn install_insert_trigger(conn: &Connection, schema: &TableSchema, site_id_hex: &str) -> Result<()> {
    let table = &schema.table;
    let new_pk = new_pk_encoded(schema, "NEW");
    let mut body = String::new();
    body.push_str("BEGIN\n");
    body.push_str(&format!(
        "INSERT INTO \"{meta}\"(pk, col_name, version) VALUES ({new_pk}, '{row_level}', 1)
         ON CONFLICT(pk, col_name) DO UPDATE SET version = \"{meta}\".version + 1;\n",
        meta = meta_table(table),
        row_level = ROW_LEVEL_COLUMN,
    ));
    for col in &schema.non_pk_columns {
        let col_q = quote_ident(col);
        let predicate = format!("NEW.{col_q} IS NOT NULL");
        body.push_str(&format!("{}\n", begin_or_continue_tx_sql(&predicate)));
        body.push_str(&format!(
            "INSERT INTO \"{meta}\"(pk, col_name, version) SELECT {new_pk}, '{col}', 1
             WHERE NEW.{col_q} IS NOT NULL
             ON CONFLICT(pk, col_name) DO UPDATE SET version = \"{meta}\".version + 1;\n",
            meta = meta_table(table),
        ));
        body.push_str(&format!(
            "INSERT INTO cloudsync_changes (id, tbl, pk, col_name, value, col_version, db_version, site_id, cl, seq)
             SELECT
                ((SELECT db_version FROM cloudsync_tx_state WHERE id = 0) << {seq_bits}) | (SELECT seq FROM cloudsync_tx_state WHERE id = 0),
                '{table}', {new_pk}, '{col}', NEW.{col_q},
                (SELECT version FROM \"{meta}\" WHERE pk = {new_pk} AND col_name = '{col}'),
                (SELECT db_version FROM cloudsync_tx_state WHERE id = 0),
                X'{site_id_hex}',
                (SELECT version FROM \"{meta}\" WHERE pk = {new_pk} AND col_name = '{row_level}'),
                (SELECT seq FROM cloudsync_tx_state WHERE id = 0)
             WHERE NEW.{col_q} IS NOT NULL;\n",
            seq_bits = crate::changelog::SEQ_BITS,
            meta = meta_table(table),
            row_level = ROW_LEVEL_COLUMN,
        ));
    }
    body.push_str("END");

    conn.execute_batch(&format!(
        "DROP TRIGGER IF EXISTS \"cloudsync_{table}_insert\";
         CREATE TRIGGER \"cloudsync_{table}_insert\" AFTER INSERT ON \"{table}\"
         {body};"
    ))?;
    Ok(())
}

fn install_update_trigger(conn: &Connection, schema: &TableSchema, site_id_hex: &str) -> Result<()> {
    let table = &schema.table;
    let new_pk = new_pk_encoded(schema, "NEW");
    let mut body = String::new();
    body.push_str("BEGIN\n");
    for col in &schema.non_pk_columns {
        let col_q = quote_ident(col);
        let predicate = format!("NEW.{col_q} IS NOT OLD.{col_q}");
        body.push_str(&format!("{}\n", begin_or_continue_tx_sql(&predicate)));
        body.push_str(&format!(
            "INSERT INTO \"{meta}\"(pk, col_name, version) VALUES ({new_pk}, '{col}', 1)
             ON CONFLICT(pk, col_name) DO UPDATE SET version = \"{meta}\".version + 1
             WHERE NEW.{col_q} IS NOT OLD.{col_q};\n",
            meta = meta_table(table),
        ));
        body.push_str(&format!(
            "INSERT INTO cloudsync_changes (id, tbl, pk, col_name, value, col_version, db_version, site_id, cl, seq)
             SELECT
                ((SELECT db_version FROM cloudsync_tx_state WHERE id = 0) << {seq_bits}) | (SELECT seq FROM cloudsync_tx_state WHERE id = 0),
                '{table}', {new_pk}, '{col}', NEW.{col_q},
                (SELECT version FROM \"{meta}\" WHERE pk = {new_pk} AND col_name = '{col}'),
                (SELECT db_version FROM cloudsync_tx_state WHERE id = 0),
                X'{site_id_hex}',
                (SELECT version FROM \"{meta}\" WHERE pk = {new_pk} AND col_name = '{row_level}'),
                (SELECT seq FROM cloudsync_tx_state WHERE id = 0)
             WHERE NEW.{col_q} IS NOT OLD.{col_q};\n",
            meta = meta_table(table),
            row_level = ROW_LEVEL_COLUMN,
            seq_bits = crate::changelog::SEQ_BITS,
        ));
    }
    body.push_str("END");

    conn.execute_batch(&format!(
        "DROP TRIGGER IF EXISTS \"cloudsync_{table}_update\";
         CREATE TRIGGER \"cloudsync_{table}_update\" AFTER UPDATE ON \"{table}\"
         {body};"
    ))?;
    Ok(())
}

fn install_delete_trigger(conn: &Connection, schema: &TableSchema, algo: Algo, site_id_hex: &str) -> Result<()> {
    let table = &schema.table;
    let old_pk = new_pk_encoded(schema, "OLD");
    let meta = meta_table(table);

    let body = if algo == Algo::Gos {
        "BEGIN
            SELECT RAISE(ABORT, 'cloudsync: deletes are not tracked under the grow-only-set algorithm');
         END"
            .to_string()
    } else {
        format!(
            "BEGIN
             {tx}
             INSERT INTO \"{meta}\"(pk, col_name, version) VALUES ({old_pk}, '{row_level}', 2)
                ON CONFLICT(pk, col_name) DO UPDATE SET
                    version = \"{meta}\".version + (2 - (\"{meta}\".version % 2));
             INSERT INTO cloudsync_changes (id, tbl, pk, col_name, value, col_version, db_version, site_id, cl, seq)
             SELECT
                ((SELECT db_version FROM cloudsync_tx_state WHERE id = 0) << {seq_bits}) | (SELECT seq FROM cloudsync_tx_state WHERE id = 0),
                '{table}', {old_pk}, '{row_level}', '{tombstone}',
                (SELECT version FROM \"{meta}\" WHERE pk = {old_pk} AND col_name = '{row_level}'),
                (SELECT db_version FROM cloudsync_tx_state WHERE id = 0),
                X'{site_id_hex}',
                (SELECT version FROM \"{meta}\" WHERE pk = {old_pk} AND col_name = '{row_level}'),
                (SELECT seq FROM cloudsync_tx_state WHERE id = 0);
             END",
            tx = begin_or_continue_tx_sql("1"),
            row_level = ROW_LEVEL_COLUMN,
            tombstone = codec::TOMBSTONE,
            seq_bits = crate::changelog::SEQ_BITS,
        )
    };

    conn.execute_batch(&format!(
        "DROP TRIGGER IF EXISTS \"cloudsync_{table}_delete\";
         CREATE TRIGGER \"cloudsync_{table}_delete\" AFTER DELETE ON \"{table}\"
         {body};"
    ))?;
    Ok(())
}

/// Drop the three capture triggers for `table`. Meta tables and captured
/// history are left in place, matching spec.md §6's `cloudsync_disable`
/// ("reinstall/drop triggers without losing meta").
pub fn drop_triggers(conn: &Connection, table: &str) -> Result<()> {
    conn.execute_batch(&format!(
        "DROP TRIGGER IF EXISTS \"cloudsync_{table}_insert\";
         DROP TRIGGER IF EXISTS \"cloudsync_{table}_update\";
         DROP TRIGGER IF EXISTS \"cloudsync_{table}_delete\";"
    ))?;
    Ok(())
}

/// Drop triggers and meta table for `table`, the full `cloudsync_cleanup`
/// teardown.
pub fn cleanup_table(conn: &Connection, table: &str) -> Result<()> {
    drop_triggers(conn, table)?;
    conn.execute_batch(&format!("DROP TABLE IF EXISTS \"{}\"", meta_table(table)))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{self};
    use crate::settings::SettingsStore;

    fn setup(conn: &Connection) -> TableSchema {
        SettingsStore::new(conn).init_schema().unwrap();
        crate::changelog::ChangeLog::new(conn).init_schema().unwrap();
        register_pkenc_function(conn).unwrap();
        conn.execute("CREATE TABLE notes(id TEXT PRIMARY KEY, body TEXT)", []).unwrap();
        let settings = SettingsStore::new(conn);
        schema::inspect(conn, &settings, "notes").unwrap()
    }

    #[test]
    fn insert_is_captured_as_column_changes_and_bumps_cl() {
        let conn = Connection::open_in_memory().unwrap();
        let schema = setup(&conn);
        install_triggers(&conn, &schema, Algo::Cls, "00000000000000000000000000000001").unwrap();
        reset_tx_scope(&conn).unwrap();

        conn.execute("INSERT INTO notes(id, body) VALUES ('a', 'hello')", []).unwrap();

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM cloudsync_changes WHERE tbl = 'notes'", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 1, "insert logs only the captured column, not a row-level entry");

        let col_version: i64 = conn
            .query_row(
                "SELECT col_version FROM cloudsync_changes WHERE tbl = 'notes' AND col_name = 'body'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(col_version, 1);
    }

    #[test]
    fn update_only_logs_changed_columns() {
        let conn = Connection::open_in_memory().unwrap();
        let schema = setup(&conn);
        install_triggers(&conn, &schema, Algo::Cls, "00000000000000000000000000000001").unwrap();
        reset_tx_scope(&conn).unwrap();
        conn.execute("INSERT INTO notes(id, body) VALUES ('a', 'hello')", []).unwrap();
        reset_tx_scope(&conn).unwrap();
        conn.execute("UPDATE notes SET body = 'bye' WHERE id = 'a'", []).unwrap();

        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM cloudsync_changes WHERE tbl = 'notes' AND col_name = 'body'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(count, 2, "insert then update of the same column");
    }

    #[test]
    fn delete_writes_tombstone_with_even_cl() {
        let conn = Connection::open_in_memory().unwrap();
        let schema = setup(&conn);
        install_triggers(&conn, &schema, Algo::Cls, "00000000000000000000000000000001").unwrap();
        reset_tx_scope(&conn).unwrap();
        conn.execute("INSERT INTO notes(id, body) VALUES ('a', 'hello')", []).unwrap();
        reset_tx_scope(&conn).unwrap();
        conn.execute("DELETE FROM notes WHERE id = 'a'", []).unwrap();

        let (cl, col_name): (i64, String) = conn
            .query_row(
                "SELECT cl, col_name FROM cloudsync_changes WHERE tbl='notes' ORDER BY id DESC LIMIT 1",
                [],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .unwrap();
        assert_eq!(col_name, "");
        assert_eq!(cl % 2, 0, "tombstone CL must be even");
    }

    #[test]
    fn gos_rejects_delete() {
        let conn = Connection::open_in_memory().unwrap();
        let schema = setup(&conn);
        install_triggers(&conn, &schema, Algo::Gos, "00000000000000000000000000000001").unwrap();
        reset_tx_scope(&conn).unwrap();
        conn.execute("INSERT INTO notes(id, body) VALUES ('a', 'hello')", []).unwrap();
        reset_tx_scope(&conn).unwrap();
        assert!(conn.execute("DELETE FROM notes WHERE id = 'a'", []).is_err());
    }

    #[test]
    fn drop_triggers_stops_capture_but_keeps_meta() {
        let conn = Connection::open_in_memory().unwrap();
        let schema = setup(&conn);
        install_triggers(&conn, &schema, Algo::Cls, "00000000000000000000000000000001").unwrap();
        reset_tx_scope(&conn).unwrap();
        conn.execute("INSERT INTO notes(id, body) VALUES ('a', 'hello')", []).unwrap();
        drop_triggers(&conn, "notes").unwrap();
        reset_tx_scope(&conn).unwrap();
        conn.execute("INSERT INTO notes(id, body) VALUES ('b', 'world')", []).unwrap();

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM cloudsync_changes WHERE tbl = 'notes'", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 1, "only the pre-drop insert was captured");

        let meta_exists: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name = 'cloudsync_notes_meta'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(meta_exists, 1);
    }
}

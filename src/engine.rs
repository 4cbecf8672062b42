//! `CloudsyncEngine`: the facade the SQL surface (`ffi.rs`) calls into.
//! Ties together schema inspection, the trigger installer, settings, and
//! the sync orchestrator behind the operations spec.md §6 lists.

use log::debug;
use rusqlite::Connection;

use crate::changelog::{Algo, ChangeLog};
use crate::conn::ConnectionState;
use crate::error::{CloudsyncError, Result};
use crate::idgen::SiteId;
use crate::network::{NetworkConfig, Transport};
use crate::schema::{self, TableSchema};
use crate::settings::{self, SettingsStore, LIBRARY_VERSION};
use crate::sync::{AlgoResolver, SyncOrchestrator};
use crate::triggers;

const DEFAULT_ALGO: Algo = Algo::Cls;

pub struct CloudsyncEngine<'c> {
    conn: &'c Connection,
    state: ConnectionState,
}

impl<'c> CloudsyncEngine<'c> {
    /// Opens the engine over an already-open connection, creating the
    /// settings/change-log meta tables if this is the first time this
    /// database has seen cloudsync.
    pub fn open(conn: &'c Connection) -> Result<Self> {
        SettingsStore::new(conn).init_schema()?;
        ChangeLog::new(conn).init_schema()?;
        triggers::register_pkenc_function(conn)?;
        Ok(Self {
            conn,
            state: ConnectionState::new(),
        })
    }

    /// Rebuilds the facade around state a caller is holding across calls
    /// (the FFI layer's opaque handle does this, since one `ConnectionState`
    /// must persist across many short-lived `CloudsyncEngine` borrows of
    /// the same connection).
    pub fn with_state(conn: &'c Connection, state: ConnectionState) -> Self {
        Self { conn, state }
    }

    pub fn into_state(self) -> ConnectionState {
        self.state
    }

    pub fn version(&self) -> &'static str {
        LIBRARY_VERSION
    }

    pub fn siteid(&mut self) -> Result<SiteId> {
        self.state.site_id(self.conn)
    }

    pub fn db_version(&self) -> Result<u64> {
        SettingsStore::new(self.conn).current_db_version()
    }

    pub fn db_version_next(&self) -> Result<u64> {
        Ok(self.db_version()? + 1)
    }

    /// `cloudsync_init(name)`: install meta + triggers for `name`, or every
    /// user table when `name == "*"`, choosing `DEFAULT_ALGO` unless the
    /// table already carries an `algo` override in `cloudsync_table_settings`.
    pub fn init(&mut self, name: &str) -> Result<()> {
        for table in self.resolve_tables(name)? {
            self.init_one(&table)?;
        }
        Ok(())
    }

    fn init_one(&mut self, table: &str) -> Result<()> {
        let settings = SettingsStore::new(self.conn);
        let schema = schema::inspect(self.conn, &settings, table)?;
        let algo = match settings.algo_for_table(table)? {
            Some(s) => Algo::parse(&s)?,
            None => {
                settings.set_algo_for_table(table, DEFAULT_ALGO.as_str())?;
                DEFAULT_ALGO
            }
        };
        let site_id = self.state.site_id(self.conn)?;
        triggers::install_triggers(self.conn, &schema, algo, &site_id.to_hex())?;
        settings.set_table_string(table, "", "enabled", "1")?;
        self.state.note_tracked(table, algo);
        debug!("cloudsync_init: tracking '{table}' under {}", algo.as_str());
        Ok(())
    }

    /// `cloudsync_cleanup(name)`: drop triggers and meta tables.
    pub fn cleanup(&mut self, name: &str) -> Result<()> {
        for table in self.resolve_tables(name)? {
            triggers::cleanup_table(self.conn, &table)?;
            self.state.forget_tracked(&table);
        }
        Ok(())
    }

    /// `cloudsync_enable(t)`: reinstall triggers without losing meta state.
    pub fn enable(&mut self, table: &str) -> Result<()> {
        self.init_one(table)?;
        let settings = SettingsStore::new(self.conn);
        settings.set_table_string(table, "", "enabled", "1")
    }

    /// `cloudsync_disable(t)`: drop triggers, keep meta + history.
    pub fn disable(&mut self, table: &str) -> Result<()> {
        triggers::drop_triggers(self.conn, table)?;
        self.state.forget_tracked(table);
        SettingsStore::new(self.conn).set_table_string(table, "", "enabled", "0")
    }

    pub fn is_enabled(&self, table: &str) -> Result<bool> {
        Ok(SettingsStore::new(self.conn)
            .get_table_string(table, "", "enabled")?
            .map(|v| v == "1")
            .unwrap_or(false))
    }

    /// Call before each top-level user transaction, so the trigger
    /// installer's per-transaction counter starts fresh. See
    /// [`ConnectionState::begin_transaction`].
    pub fn begin_transaction(&self) -> Result<()> {
        self.state.begin_transaction(self.conn)
    }

    pub fn network_init(&mut self, connection_string: &str) -> Result<()> {
        let config = NetworkConfig::parse(connection_string)?;
        self.state.set_network(config);
        Ok(())
    }

    pub fn network_reset_check_version(&self) -> Result<()> {
        SettingsStore::new(self.conn).reset_check_cursor()
    }

    pub fn set_apikey(&mut self, key: &str) {
        self.state.set_credential(crate::network::Credential::ApiKey(key.to_string()));
    }

    pub fn set_token(&mut self, token: &str) {
        self.state.set_credential(crate::network::Credential::Token(token.to_string()));
    }

    /// Runs a sync step against `transport`, dispatching to the orchestrator
    /// with this engine as the `AlgoResolver`.
    pub fn send_changes<T: Transport>(&self, transport: T) -> Result<usize> {
        let network = self.require_network()?;
        SyncOrchestrator::new(self.conn, transport, network).send_changes()
    }

    pub fn check_changes<T: Transport>(&self, transport: T) -> Result<usize> {
        let network = self.require_network()?;
        SyncOrchestrator::new(self.conn, transport, network).check_changes(self)
    }

    pub fn check_changes_sync<T: Transport>(&self, transport: T, sleep_ms: u64, max_retries: u32) -> Result<usize> {
        let network = self.require_network()?;
        SyncOrchestrator::new(self.conn, transport, network).check_changes_sync(sleep_ms, max_retries, self)
    }

    pub fn network_sync<T: Transport>(&self, transport: T) -> Result<(usize, usize)> {
        let network = self.require_network()?;
        SyncOrchestrator::new(self.conn, transport, network).sync(self)
    }

    fn require_network(&self) -> Result<NetworkConfig> {
        self.state
            .network()
            .cloned()
            .ok_or(CloudsyncError::State("cloudsync_network_init was never called"))
    }

    /// `cloudsync_terminate`: release connection-scoped state. The
    /// `Connection` itself outlives this call; the host closes it
    /// separately.
    pub fn terminate(&mut self) {
        self.state.terminate();
    }

    fn resolve_tables(&self, name: &str) -> Result<Vec<String>> {
        if name == "*" {
            schema::list_user_tables(self.conn)
        } else {
            schema::validate_table_name(name)?;
            Ok(vec![name.to_string()])
        }
    }

    pub fn schema_hash(&self) -> Result<String> {
        let tables = schema::list_user_tables(self.conn)?;
        let mut defs = Vec::with_capacity(tables.len());
        for t in &tables {
            defs.push(schema::table_definition(self.conn, t)?);
        }
        Ok(settings::schema_hash(&defs))
    }
}

impl<'c> AlgoResolver for CloudsyncEngine<'c> {
    fn algo_for(&self, table: &str) -> Result<Algo> {
        if let Some(algo) = self.state.algo_for(table) {
            return Ok(algo);
        }
        match SettingsStore::new(self.conn).algo_for_table(table)? {
            Some(s) => Algo::parse(&s),
            None => Ok(DEFAULT_ALGO),
        }
    }

    fn schema_for(&self, table: &str) -> Result<TableSchema> {
        schema::inspect(self.conn, &SettingsStore::new(self.conn), table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_then_is_enabled_round_trips() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute("CREATE TABLE notes(id TEXT PRIMARY KEY, body TEXT)", []).unwrap();
        let mut engine = CloudsyncEngine::open(&conn).unwrap();
        engine.init("notes").unwrap();
        assert!(engine.is_enabled("notes").unwrap());

        engine.disable("notes").unwrap();
        assert!(!engine.is_enabled("notes").unwrap());
    }

    #[test]
    fn db_version_next_is_one_ahead() {
        let conn = Connection::open_in_memory().unwrap();
        let engine = CloudsyncEngine::open(&conn).unwrap();
        assert_eq!(engine.db_version_next().unwrap(), engine.db_version().unwrap() + 1);
    }

    #[test]
    fn network_operations_require_init_first() {
        let conn = Connection::open_in_memory().unwrap();
        let engine = CloudsyncEngine::open(&conn).unwrap();
        assert!(engine.require_network().is_err());
    }

    #[test]
    fn wildcard_init_tracks_every_user_table() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute("CREATE TABLE a(id TEXT PRIMARY KEY)", []).unwrap();
        conn.execute("CREATE TABLE b(id TEXT PRIMARY KEY)", []).unwrap();
        let mut engine = CloudsyncEngine::open(&conn).unwrap();
        engine.init("*").unwrap();
        assert!(engine.is_enabled("a").unwrap());
        assert!(engine.is_enabled("b").unwrap());
    }
}

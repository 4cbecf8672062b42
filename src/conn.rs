//! Per-connection scratch state: the site id cache, the credentials handed
//! to `cloudsync_network_init`, and the connection's notion of which tables
//! it currently tracks. Released wholesale on `cloudsync_terminate`
//! (see spec.md §9's "shared resources" paragraph).

use rusqlite::Connection;

use crate::changelog::Algo;
use crate::error::Result;
use crate::idgen::SiteId;
use crate::network::{Credential, NetworkConfig};
use crate::settings::SettingsStore;
use crate::triggers;

/// Mutable state a host keeps alongside one open `Connection`. Not `Sync`:
/// one instance per connection, matching the engine's "not internally
/// parallel" scheduling model (spec.md §5).
pub struct ConnectionState {
    site_id: Option<SiteId>,
    network: Option<NetworkConfig>,
    tracked: Vec<(String, Algo)>,
}

impl ConnectionState {
    pub fn new() -> Self {
        Self {
            site_id: None,
            network: None,
            tracked: Vec::new(),
        }
    }

    /// Lazily resolves and caches the site id for `conn`.
    pub fn site_id(&mut self, conn: &Connection) -> Result<SiteId> {
        if let Some(id) = self.site_id {
            return Ok(id);
        }
        let id = SettingsStore::new(conn).site_id()?;
        self.site_id = Some(id);
        Ok(id)
    }

    pub fn set_network(&mut self, config: NetworkConfig) {
        self.network = Some(config);
    }

    pub fn network(&self) -> Option<&NetworkConfig> {
        self.network.as_ref()
    }

    /// Overrides the credential on an already-parsed network config, for
    /// `cloudsync_set_apikey`/`cloudsync_set_token`.
    pub fn set_credential(&mut self, auth: Credential) {
        if let Some(network) = &mut self.network {
            network.auth = auth;
        }
    }

    pub fn note_tracked(&mut self, table: &str, algo: Algo) {
        self.tracked.retain(|(t, _)| t != table);
        self.tracked.push((table.to_string(), algo));
    }

    pub fn forget_tracked(&mut self, table: &str) {
        self.tracked.retain(|(t, _)| t != table);
    }

    pub fn algo_for(&self, table: &str) -> Option<Algo> {
        self.tracked.iter().find(|(t, _)| t == table).map(|(_, a)| *a)
    }

    pub fn is_tracked(&self, table: &str) -> bool {
        self.tracked.iter().any(|(t, _)| t == table)
    }

    /// Call once before each top-level user transaction begins; see
    /// [`triggers::reset_tx_scope`] for why this can't be driven from
    /// inside the trigger bodies themselves.
    pub fn begin_transaction(&self, conn: &Connection) -> Result<()> {
        triggers::reset_tx_scope(conn)
    }

    /// Drops all cached state. `cloudsync_terminate` calls this; the
    /// underlying `Connection` and on-disk tables are untouched.
    pub fn terminate(&mut self) {
        self.site_id = None;
        self.network = None;
        self.tracked.clear();
    }
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn site_id_is_cached_after_first_lookup() {
        let conn = Connection::open_in_memory().unwrap();
        SettingsStore::new(&conn).init_schema().unwrap();
        let mut state = ConnectionState::new();
        let a = state.site_id(&conn).unwrap();
        let b = state.site_id(&conn).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn tracked_tables_round_trip() {
        let mut state = ConnectionState::new();
        state.note_tracked("notes", Algo::Cls);
        assert!(state.is_tracked("notes"));
        assert_eq!(state.algo_for("notes"), Some(Algo::Cls));
        state.forget_tracked("notes");
        assert!(!state.is_tracked("notes"));
    }

    #[test]
    fn terminate_clears_everything() {
        let conn = Connection::open_in_memory().unwrap();
        SettingsStore::new(&conn).init_schema().unwrap();
        let mut state = ConnectionState::new();
        state.site_id(&conn).unwrap();
        state.note_tracked("notes", Algo::Gos);
        state.terminate();
        assert!(!state.is_tracked("notes"));
        assert!(state.network().is_none());
    }
}

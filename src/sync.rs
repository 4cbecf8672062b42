//! Sync orchestrator: upload-new-changes / check-for-remote-changes cursor
//! management, per spec.md §4.8.

use std::thread::sleep;
use std::time::Duration;

use log::{debug, warn};
use rusqlite::Connection;

use crate::changelog::{max_cursor, Algo, ChangeLog};
use crate::error::Result;
use crate::network::{decode_batch, encode_batch, NetworkConfig, Transport};
use crate::schema::TableSchema;
use crate::settings::SettingsStore;
use crate::vtable::ChangesTable;

/// Resolves which CRDT algorithm and schema shape applies to an incoming
/// change's table. The host already knows this from its own init path, so
/// the orchestrator asks rather than re-deriving it per row.
pub trait AlgoResolver {
    fn algo_for(&self, table: &str) -> Result<Algo>;
    fn schema_for(&self, table: &str) -> Result<TableSchema>;
}

pub struct SyncOrchestrator<'c, T> {
    conn: &'c Connection,
    transport: T,
    network: NetworkConfig,
}

impl<'c, T: Transport> SyncOrchestrator<'c, T> {
    pub fn new(conn: &'c Connection, transport: T, network: NetworkConfig) -> Self {
        Self { conn, transport, network }
    }

    /// Upload all locally captured changes beyond the send cursor. Returns
    /// the number of change-log rows uploaded (0 if there was nothing new).
    pub fn send_changes(&self) -> Result<usize> {
        let settings = SettingsStore::new(self.conn);
        let site_id = settings.site_id()?;
        let cursor = settings.send_cursor()?;

        let changelog = ChangeLog::new(self.conn);
        let pending = changelog.local_changes_since(&site_id, cursor, 10_000)?;
        if pending.is_empty() {
            debug!("send_changes: nothing new beyond cursor {cursor:?}");
            return Ok(0);
        }

        let body = encode_batch(&pending);
        let endpoint = self.network.upload_endpoint(&site_id);
        let bearer = self.network.bearer();

        let upload_url = self.transport.request_upload_url(&endpoint, bearer)?;
        self.transport.put_blob(&upload_url, &body)?;
        self.transport.notify_upload_complete(&endpoint, bearer, &upload_url)?;

        if let Some(new_cursor) = max_cursor(&pending) {
            settings.set_send_cursor(new_cursor.0, new_cursor.1)?;
        }

        Ok(pending.len())
    }

    /// One poll for remote changes. Returns the number of rows applied.
    pub fn check_changes<R: AlgoResolver>(&self, resolver: &R) -> Result<usize> {
        let settings = SettingsStore::new(self.conn);
        let site_id = settings.site_id()?;
        let cursor = settings.check_cursor()?;
        let endpoint = self.network.check_endpoint(&site_id);
        let bearer = self.network.bearer();

        let Some(download_url) = self.transport.request_check_url(&endpoint, bearer, cursor)? else {
            debug!("check_changes: server reports nothing new beyond {cursor:?}");
            return Ok(0);
        };

        let body = self.transport.download(&download_url)?;
        let entries = decode_batch(&body)?;
        if entries.is_empty() {
            return Ok(0);
        }

        let table = ChangesTable::new(self.conn);
        let mut applied = 0usize;
        for entry in &entries {
            let algo = resolver.algo_for(&entry.table)?;
            let schema = resolver.schema_for(&entry.table)?;
            applied += table.insert(entry, algo, &schema)?;
        }

        if let Some(new_cursor) = max_cursor(&entries) {
            settings.set_check_cursor(new_cursor.0, new_cursor.1)?;
        }

        Ok(applied)
    }

    /// Bounded retry wrapper: poll up to `max_retries` times with
    /// `sleep_ms` between attempts, stopping at the first attempt that
    /// applies at least one row.
    pub fn check_changes_sync<R: AlgoResolver>(&self, sleep_ms: u64, max_retries: u32, resolver: &R) -> Result<usize> {
        let mut attempt = 0;
        loop {
            let applied = self.check_changes(resolver)?;
            if applied > 0 {
                return Ok(applied);
            }
            attempt += 1;
            if attempt >= max_retries {
                return Ok(0);
            }
            warn!("check_changes_sync: attempt {attempt}/{max_retries} applied nothing, sleeping {sleep_ms}ms");
            sleep(Duration::from_millis(sleep_ms));
        }
    }

    /// Send then check — the composite `cloudsync_network_sync()` operation.
    pub fn sync<R: AlgoResolver>(&self, resolver: &R) -> Result<(usize, usize)> {
        let sent = self.send_changes()?;
        let applied = self.check_changes(resolver)?;
        Ok((sent, applied))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::changelog::ChangeEntry;
    use crate::codec::Value;
    use crate::idgen::SiteId;
    use std::cell::RefCell;

    struct FakeTransport {
        uploaded: RefCell<Vec<u8>>,
        check_url: Option<String>,
        download_bytes: Vec<u8>,
    }

    impl Transport for FakeTransport {
        fn request_upload_url(&self, _endpoint: &str, _bearer: &str) -> Result<String> {
            Ok("https://upload.example/put".into())
        }
        fn put_blob(&self, _url: &str, body: &[u8]) -> Result<()> {
            *self.uploaded.borrow_mut() = body.to_vec();
            Ok(())
        }
        fn notify_upload_complete(&self, _endpoint: &str, _bearer: &str, _url: &str) -> Result<()> {
            Ok(())
        }
        fn request_check_url(&self, _endpoint: &str, _bearer: &str, _cursor: (u64, u32)) -> Result<Option<String>> {
            Ok(self.check_url.clone())
        }
        fn download(&self, _url: &str) -> Result<Vec<u8>> {
            Ok(self.download_bytes.clone())
        }
    }

    struct FakeResolver;
    impl AlgoResolver for FakeResolver {
        fn algo_for(&self, _table: &str) -> Result<Algo> {
            Ok(Algo::Cls)
        }
        fn schema_for(&self, _table: &str) -> Result<TableSchema> {
            Ok(TableSchema {
                table: "t".into(),
                pk_columns: vec!["id".into()],
                non_pk_columns: vec!["v".into()],
                is_rowid_alias: false,
            })
        }
    }

    fn setup(conn: &Connection) {
        SettingsStore::new(conn).init_schema().unwrap();
        ChangeLog::new(conn).init_schema().unwrap();
        conn.execute("CREATE TABLE t(id TEXT PRIMARY KEY, v TEXT)", []).unwrap();
    }

    #[test]
    fn send_changes_uploads_pending_and_advances_cursor() {
        let conn = Connection::open_in_memory().unwrap();
        setup(&conn);
        let settings = SettingsStore::new(&conn);
        let site = settings.site_id().unwrap();
        let changelog = ChangeLog::new(&conn);
        changelog
            .append(&ChangeEntry {
                table: "t".into(),
                pk: crate::codec::encode_pk(&[Value::Text("1".into())]).unwrap(),
                column: Some("v".into()),
                value: Value::Text("a".into()),
                col_version: 1,
                db_version: 1,
                site_id: site,
                cl: 1,
                seq: 0,
            })
            .unwrap();

        let transport = FakeTransport {
            uploaded: RefCell::new(Vec::new()),
            check_url: None,
            download_bytes: Vec::new(),
        };
        let network = NetworkConfig::parse("sqlitecloud://h/db?apikey=k").unwrap();
        let orch = SyncOrchestrator::new(&conn, transport, network);

        let sent = orch.send_changes().unwrap();
        assert_eq!(sent, 1);
        assert_eq!(settings.send_cursor().unwrap(), (1, 0));

        let sent_again = orch.send_changes().unwrap();
        assert_eq!(sent_again, 0);
    }

    #[test]
    fn check_changes_sync_stops_at_first_successful_attempt() {
        let conn = Connection::open_in_memory().unwrap();
        setup(&conn);

        let entry = ChangeEntry {
            table: "t".into(),
            pk: crate::codec::encode_pk(&[Value::Text("1".into())]).unwrap(),
            column: Some("v".into()),
            value: Value::Text("remote".into()),
            col_version: 1,
            db_version: 1,
            site_id: SiteId::at(99),
            cl: 1,
            seq: 0,
        };
        let bytes = crate::network::encode_batch(&[entry]);

        let transport = FakeTransport {
            uploaded: RefCell::new(Vec::new()),
            check_url: Some("https://download.example/batch".into()),
            download_bytes: bytes,
        };
        let network = NetworkConfig::parse("sqlitecloud://h/db?apikey=k").unwrap();
        let orch = SyncOrchestrator::new(&conn, transport, network);
        let resolver = FakeResolver;

        let applied = orch.check_changes_sync(1, 3, &resolver).unwrap();
        assert_eq!(applied, 1);

        let v: String = conn.query_row("SELECT v FROM t WHERE id = '1'", [], |r| r.get(0)).unwrap();
        assert_eq!(v, "remote");
    }

    #[test]
    fn check_changes_sync_gives_up_after_max_retries() {
        let conn = Connection::open_in_memory().unwrap();
        setup(&conn);

        let transport = FakeTransport {
            uploaded: RefCell::new(Vec::new()),
            check_url: None,
            download_bytes: Vec::new(),
        };
        let network = NetworkConfig::parse("sqlitecloud://h/db?apikey=k").unwrap();
        let orch = SyncOrchestrator::new(&conn, transport, network);
        let resolver = FakeResolver;

        let applied = orch.check_changes_sync(1, 2, &resolver).unwrap();
        assert_eq!(applied, 0);
    }
}

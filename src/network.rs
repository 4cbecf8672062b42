//! Connection-string parsing, the wire batch format, and the `Transport`
//! trait seam. The actual HTTPS client and compression codec are external
//! collaborators (spec.md §1); this module only defines what the core
//! needs from them and how bytes are laid out on the wire.

use crate::changelog::{Algo, ChangeEntry};
use crate::codec::{self, Value};
use crate::error::{CloudsyncError, Result};
use crate::idgen::SiteId;

/// Credential carried by a connection string: either an API key or a
/// bearer token. Opaque beyond that — no further auth scheme per spec.md §1.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credential {
    ApiKey(String),
    Token(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkConfig {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub auth: Credential,
}

impl NetworkConfig {
    /// Parse `sqlitecloud://HOST[:PORT]/DATABASE?apikey=K` or `...?token=T`.
    pub fn parse(connection_string: &str) -> Result<Self> {
        let rest = connection_string
            .strip_prefix("sqlitecloud://")
            .ok_or_else(|| CloudsyncError::Schema("connection string must use sqlitecloud://".into()))?;

        let (authority_and_path, query) = match rest.split_once('?') {
            Some((a, q)) => (a, Some(q)),
            None => (rest, None),
        };
        let (authority, path) = authority_and_path
            .split_once('/')
            .ok_or_else(|| CloudsyncError::Schema("connection string missing /DATABASE".into()))?;
        if path.is_empty() {
            return Err(CloudsyncError::Schema("connection string missing database name".into()));
        }

        let (host, port) = match authority.split_once(':') {
            Some((h, p)) => (
                h.to_string(),
                p.parse::<u16>()
                    .map_err(|_| CloudsyncError::Schema(format!("invalid port '{p}'")))?,
            ),
            None => (authority.to_string(), 443),
        };

        let query = query.ok_or_else(|| CloudsyncError::Schema("connection string missing credential".into()))?;
        let mut apikey = None;
        let mut token = None;
        for pair in query.split('&') {
            if let Some((k, v)) = pair.split_once('=') {
                match k {
                    "apikey" => apikey = Some(v.to_string()),
                    "token" => token = Some(v.to_string()),
                    _ => {}
                }
            }
        }
        let auth = match (apikey, token) {
            (Some(k), _) => Credential::ApiKey(k),
            (None, Some(t)) => Credential::Token(t),
            (None, None) => {
                return Err(CloudsyncError::Schema(
                    "connection string must carry apikey or token".into(),
                ));
            }
        };

        Ok(NetworkConfig {
            host,
            port,
            database: path.to_string(),
            auth,
        })
    }

    /// `https://HOST:PORT/v1/cloudsync/DATABASE/SITEID`
    pub fn check_endpoint(&self, site_id: &SiteId) -> String {
        format!(
            "https://{}:{}/v1/cloudsync/{}/{}",
            self.host,
            self.port,
            self.database,
            site_id.to_hex()
        )
    }

    /// `check_endpoint + "/upload"`
    pub fn upload_endpoint(&self, site_id: &SiteId) -> String {
        format!("{}/upload", self.check_endpoint(site_id))
    }

    pub fn bearer(&self) -> &str {
        match &self.auth {
            Credential::ApiKey(k) => k,
            Credential::Token(t) => t,
        }
    }
}

/// The blocking transport interface the sync orchestrator consumes. An
/// implementation wraps the real HTTPS client, which is out of scope here.
pub trait Transport {
    /// GET the upload endpoint; returns the URL the blob should be PUT to.
    fn request_upload_url(&self, endpoint: &str, bearer: &str) -> Result<String>;
    /// PUT `body` to `url`.
    fn put_blob(&self, url: &str, body: &[u8]) -> Result<()>;
    /// POST `{"url": "..."}` to the upload endpoint to commit.
    fn notify_upload_complete(&self, endpoint: &str, bearer: &str, url: &str) -> Result<()>;
    /// GET `check_endpoint/DBVER/SEQ/check`; returns `Some(url)` to download
    /// the change batch from, or `None` if there is nothing new.
    fn request_check_url(&self, endpoint: &str, bearer: &str, cursor: (u64, u32)) -> Result<Option<String>>;
    /// GET the batch bytes from a URL returned by [`Transport::request_check_url`].
    fn download(&self, url: &str) -> Result<Vec<u8>>;
}

/// Fixed column order of one change tuple on the wire, per spec.md §6.
fn entry_to_tuple(entry: &ChangeEntry) -> Vec<Value> {
    vec![
        Value::Text(entry.table.clone()),
        Value::Blob(entry.pk.clone()),
        Value::Text(entry.column.clone().unwrap_or_default()),
        entry.value.clone(),
        Value::Integer(entry.col_version as i64),
        Value::Integer(entry.db_version as i64),
        Value::Blob(entry.site_id.as_bytes().to_vec()),
        Value::Integer(entry.cl as i64),
        Value::Integer(entry.seq as i64),
    ]
}

fn tuple_to_entry(values: Vec<Value>) -> Result<ChangeEntry> {
    let mut it = values.into_iter();
    let mut next = |what: &'static str| it.next().ok_or(CloudsyncError::Codec(format!("missing {what}")));

    let table = match next("tbl")? {
        Value::Text(s) => s,
        _ => return Err(CloudsyncError::Codec("tbl must be text".into())),
    };
    let pk = match next("pk")? {
        Value::Blob(b) => b,
        _ => return Err(CloudsyncError::Codec("pk must be blob".into())),
    };
    let col_name = match next("col_name")? {
        Value::Text(s) => s,
        _ => return Err(CloudsyncError::Codec("col_name must be text".into())),
    };
    let value = next("col_value")?;
    let col_version = match next("col_version")? {
        Value::Integer(n) => n as u64,
        _ => return Err(CloudsyncError::Codec("col_version must be integer".into())),
    };
    let db_version = match next("db_version")? {
        Value::Integer(n) => n as u64,
        _ => return Err(CloudsyncError::Codec("db_version must be integer".into())),
    };
    let site_id = match next("site_id")? {
        Value::Blob(b) => SiteId::from_slice(&b)?,
        _ => return Err(CloudsyncError::Codec("site_id must be blob".into())),
    };
    let cl = match next("cl")? {
        Value::Integer(n) => n as u64,
        _ => return Err(CloudsyncError::Codec("cl must be integer".into())),
    };
    let seq = match next("seq")? {
        Value::Integer(n) => n as u32,
        _ => return Err(CloudsyncError::Codec("seq must be integer".into())),
    };

    Ok(ChangeEntry {
        table,
        pk,
        column: if col_name.is_empty() { None } else { Some(col_name) },
        value,
        col_version,
        db_version,
        site_id,
        cl,
        seq,
    })
}

/// Encode a batch of change entries as a concatenation of value-row encoded
/// 9-tuples, per spec.md §6.
pub fn encode_batch(entries: &[ChangeEntry]) -> Vec<u8> {
    let mut out = Vec::new();
    for entry in entries {
        out.extend(codec::encode_values(&entry_to_tuple(entry)));
    }
    out
}

/// Decode a downloaded batch back into change entries. Each tuple has a
/// fixed arity of 9, so tuples are delimited implicitly by the codec's
/// self-describing tags — we decode the whole stream then chunk by 9.
pub fn decode_batch(bytes: &[u8]) -> Result<Vec<ChangeEntry>> {
    let values = codec::decode_values(bytes)?;
    if values.len() % 9 != 0 {
        return Err(CloudsyncError::Codec(
            "decoded batch length is not a multiple of the 9-column tuple width".into(),
        ));
    }
    values
        .chunks(9)
        .map(|chunk| tuple_to_entry(chunk.to_vec()))
        .collect()
}

/// Pick the algorithm a CRDT applies to an incoming entry; kept here purely
/// to keep call sites symmetrical with `encode_batch`/`decode_batch`.
pub fn algo_or_default(algo: Option<Algo>) -> Algo {
    algo.unwrap_or(Algo::Cls)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_apikey_connection_string() {
        let cfg = NetworkConfig::parse("sqlitecloud://db.example.com/mydb?apikey=abc123").unwrap();
        assert_eq!(cfg.host, "db.example.com");
        assert_eq!(cfg.port, 443);
        assert_eq!(cfg.database, "mydb");
        assert_eq!(cfg.auth, Credential::ApiKey("abc123".into()));
    }

    #[test]
    fn parses_explicit_port_and_token() {
        let cfg = NetworkConfig::parse("sqlitecloud://db.example.com:8443/mydb?token=tok").unwrap();
        assert_eq!(cfg.port, 8443);
        assert_eq!(cfg.auth, Credential::Token("tok".into()));
    }

    #[test]
    fn derives_check_and_upload_endpoints() {
        let cfg = NetworkConfig::parse("sqlitecloud://h/db?apikey=k").unwrap();
        let site = SiteId::at(1);
        let check = cfg.check_endpoint(&site);
        assert_eq!(check, format!("https://h:443/v1/cloudsync/db/{}", site.to_hex()));
        assert_eq!(cfg.upload_endpoint(&site), format!("{check}/upload"));
    }

    #[test]
    fn rejects_missing_credential() {
        assert!(NetworkConfig::parse("sqlitecloud://h/db").is_err());
    }

    #[test]
    fn batch_roundtrips() {
        let entries = vec![
            ChangeEntry {
                table: "t".into(),
                pk: vec![1, 7],
                column: Some("v".into()),
                value: Value::Text("hi".into()),
                col_version: 1,
                db_version: 1,
                site_id: SiteId::at(1),
                cl: 1,
                seq: 0,
            },
            ChangeEntry {
                table: "t".into(),
                pk: vec![1, 7],
                column: None,
                value: Value::Tombstone,
                col_version: 1,
                db_version: 2,
                site_id: SiteId::at(1),
                cl: 2,
                seq: 0,
            },
        ];
        let bytes = encode_batch(&entries);
        let decoded = decode_batch(&bytes).unwrap();
        assert_eq!(decoded, entries);
    }
}

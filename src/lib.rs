//! cloudsync-core: embeds a CRDT-backed change-log and sync orchestrator
//! into a single-file SQLite database. See `ffi.rs` for the C ABI the SQL
//! extension surface is built on.

pub mod changelog;
pub mod codec;
pub mod conn;
pub mod engine;
pub mod error;
pub mod ffi;
pub mod idgen;
pub mod merge;
pub mod network;
pub mod schema;
pub mod settings;
pub mod sync;
pub mod triggers;
pub mod vtable;

pub use changelog::{Algo, ChangeEntry, ChangeLog};
pub use conn::ConnectionState;
pub use engine::CloudsyncEngine;
pub use error::{CloudsyncError, Result};
pub use idgen::SiteId;
pub use merge::{MergeEngine, MergeObserver, MergeOutcome};
pub use network::{Credential, NetworkConfig, Transport};
pub use sync::{AlgoResolver, SyncOrchestrator};

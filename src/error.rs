use thiserror::Error;

/// Errors surfaced by the core engine: sqlite/codec/schema/integrity/network/
/// state, plus the non-error "policy skip" path which is expressed as
/// `MergeOutcome::Skipped`, not an `Err`.
#[derive(Error, Debug)]
pub enum CloudsyncError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("codec: {0}")]
    Codec(String),

    #[error("schema: {0}")]
    Schema(String),

    #[error("integrity violation: {0}")]
    Integrity(String),

    #[error("network error ({code}): {message}")]
    Network { message: String, code: i32 },

    #[error("invalid state: {0}")]
    State(&'static str),
}

pub type Result<T> = std::result::Result<T, CloudsyncError>;

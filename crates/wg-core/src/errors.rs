use std::path::PathBuf;

/// Core error type for the bridge.
///
/// Adapter crates should map their specific errors into this type so the core
/// can decide consistently what is logged, reported, or treated as fatal.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("config error: {0}")]
    Config(String),

    #[error("security violation: {0}")]
    Security(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid path: {path}: {reason}")]
    InvalidPath { path: PathBuf, reason: String },

    #[error("no local session state at {0}")]
    NoLocalState(PathBuf),

    #[error("remote store is not configured")]
    StoreUnavailable,

    #[error("remote store error: {0}")]
    Store(String),

    #[error("timed out after {secs}s: {op}")]
    Timeout { op: &'static str, secs: u64 },

    #[error("module '{name}' failed: {reason}")]
    Module { name: String, reason: String },

    #[error("external error: {0}")]
    External(String),
}

pub type Result<T> = std::result::Result<T, Error>;

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Failures reported by the remote listing / fetch service.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RemoteError {
    #[error("rate limited: {0}")]
    RateLimited(String),
    #[error("transient remote failure: {0}")]
    Transient(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("remote error: {0}")]
    Other(String),
}

impl RemoteError {
    /// Rate limits and network hiccups are worth another attempt; everything
    /// else is permanent for the id in question.
    pub fn is_retryable(&self) -> bool {
        matches!(self, RemoteError::RateLimited(_) | RemoteError::Transient(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, RemoteError::NotFound(_))
    }
}

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("unsafe message id {0:?}")]
    InvalidId(String),
    #[error("message {0} is not cached")]
    NotCached(String),
    #[error("corrupt cache file {}: {reason}", path.display())]
    Corrupt { path: PathBuf, reason: String },
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Serde(#[from] serde_json::Error),
}

#[derive(Error, Debug)]
pub enum IndexError {
    #[error("index store unavailable")]
    Unavailable,
    #[error("message {0} is not indexed")]
    NotFound(String),
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
    #[error(transparent)]
    Serde(#[from] serde_json::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PatternError {
    #[error("empty pattern")]
    Empty,
    #[error("invalid pattern regex {pattern:?}: {reason}")]
    BadRegex { pattern: String, reason: String },
}

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("invalid sync request: {0}")]
    InvalidArgument(String),
    #[error("remote listing failed: {0}")]
    Listing(RemoteError),
    #[error(transparent)]
    Cache(#[from] CacheError),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("reading config {path}: {source}")]
    Read { path: PathBuf, source: io::Error },
    #[error("parsing config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("writing config {path}: {source}")]
    Write { path: PathBuf, source: io::Error },
    #[error("{var}={value:?} is not a valid value")]
    Env { var: &'static str, value: String },
    #[error("invalid config: {0}")]
    Invalid(String),
    #[error("invalid reply pattern {pattern:?}: {reason}")]
    ReplyPattern { pattern: String, reason: String },
}

/// Any failure surfaced by the mirror facade.
#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Pattern(#[from] PatternError),
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error(transparent)]
    Index(#[from] IndexError),
    #[error(transparent)]
    Sync(#[from] SyncError),
}

//! Incremental local mirror of a remote mail store.
//!
//! Messages are listed and fetched through a [`RemoteService`], normalized by
//! the content parser, persisted one file per message in a pattern-scoped
//! [`FileCache`], and projected into a SQLite full-text index
//! ([`IndexHandle`]) that can always be rebuilt from the cache.

pub mod config;
pub mod core;

pub use crate::config::Config;
pub use crate::core::error::{
    CacheError, ConfigError, Error, IndexError, PatternError, RemoteError, SyncError,
};
pub use crate::core::file_cache::{CachedRecords, FileCache};
pub use crate::core::mirror::{Archive, Mirror, Stats};
pub use crate::core::models::{Attachment, Record, RecordSummary, SyncMode, SyncReport};
pub use crate::core::pattern::Pattern;
pub use crate::core::remote::{ListPage, RawMessage, RemoteService};
pub use crate::core::reply::{extract_latest_reply, ReplyRules};
pub use crate::core::store::IndexHandle;
pub use crate::core::sync::{RetryPolicy, SyncController, SyncOptions};

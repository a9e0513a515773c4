use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

/// A normalized message as persisted in the file cache.
///
/// Everything except `label_ids` is fixed once the id has been fetched, so
/// re-fetching an unchanged message serializes to the same bytes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub id: String,
    pub thread_id: String,
    #[serde(default)]
    pub label_ids: BTreeSet<String>,
    #[serde(default)]
    pub from: String,
    #[serde(default)]
    pub to: Vec<String>,
    #[serde(default)]
    pub cc: Vec<String>,
    #[serde(default)]
    pub subject: String,
    #[serde(default)]
    pub date: String,
    #[serde(default)]
    pub snippet: String,
    #[serde(default)]
    pub body_text: String,
    #[serde(default)]
    pub body_html: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_text: Option<String>,
    /// Milliseconds since the epoch.
    #[serde(default)]
    pub timestamp: i64,
    #[serde(default)]
    pub size_estimate: u64,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parse_warnings: Vec<String>,
}

impl Record {
    pub fn has_attachments(&self) -> bool {
        !self.attachments.is_empty()
    }
}

/// Attachment metadata. The bytes themselves are never cached.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub attachment_id: String,
    pub message_id: String,
    pub filename: String,
    pub mime_type: String,
    pub size: u64,
}

/// Summary of a record for listings and search results (no body).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordSummary {
    pub id: String,
    pub thread_id: String,
    pub from: String,
    pub subject: String,
    pub snippet: String,
    pub timestamp: i64,
    pub has_attachments: bool,
}

/// One entry of a pattern directory's index file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheIndexEntry {
    pub id: String,
    pub timestamp: i64,
    pub from: String,
    pub subject: String,
    /// Record file path, relative to the pattern directory.
    pub path: String,
    /// Size of the record file in bytes.
    pub bytes: u64,
}

/// Aggregate over one pattern directory, computed from the index alone.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub count: usize,
    pub total_size: u64,
    pub oldest: Option<i64>,
    pub newest: Option<i64>,
    pub last_sync: Option<String>,
}

/// How a sync run decides what to fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncMode {
    /// Fetch every listed id, still writing through to the cache.
    Full,
    /// Skip ids already cached at or below the watermark.
    Incremental,
    /// Re-fetch exactly these ids; no listing.
    ForceRefresh(Vec<String>),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedFetch {
    pub id: String,
    pub error: String,
}

/// Outcome of one sync run. Per-id failures land here, never in an `Err`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub listed: usize,
    pub fetched: Vec<String>,
    pub skipped: Vec<String>,
    pub failed: Vec<FailedFetch>,
    /// Ids the remote reported as permanently gone; removed from the cache.
    pub gone: Vec<String>,
    /// Ids never attempted because the deadline expired.
    pub cancelled: Vec<String>,
    /// The listing stopped early on a failed page after at least one page.
    pub listing_truncated: bool,
    pub watermark: Option<i64>,
}

impl SyncReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty() && self.cancelled.is_empty() && !self.listing_truncated
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedEntry {
    pub id: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConsistencyReport {
    /// Indexed ids whose record file is missing or unreadable.
    pub missing_files: Vec<String>,
    /// Record files on disk with no index entry.
    pub unindexed_files: Vec<String>,
}

impl ConsistencyReport {
    pub fn is_consistent(&self) -> bool {
        self.missing_files.is_empty() && self.unindexed_files.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RepairReport {
    pub dropped: Vec<String>,
    pub reindexed: Vec<String>,
    /// Unindexed files that could not be parsed; left on disk untouched.
    pub unreadable: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IngestReport {
    pub inserted: usize,
    pub updated: usize,
    pub failed: Vec<SkippedEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SenderCount {
    pub email: String,
    pub name: String,
    pub count: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DomainCount {
    pub domain: String,
    pub count: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IndexStats {
    pub total: u64,
    pub threads: u64,
    pub unique_domains: u64,
    pub top_senders: Vec<SenderCount>,
    pub top_domains: Vec<DomainCount>,
    pub date_range: Option<(i64, i64)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimelineGrouping {
    Day,
    Week,
    Month,
}

impl std::str::FromStr for TimelineGrouping {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "day" => Ok(TimelineGrouping::Day),
            "week" => Ok(TimelineGrouping::Week),
            "month" => Ok(TimelineGrouping::Month),
            other => Err(format!("unknown grouping {other:?} (day, week or month)")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TimelineBucket {
    pub period: String,
    pub count: u64,
}

/// Attachment row joined with its parent message, for listings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AttachmentListing {
    pub attachment: Attachment,
    pub subject: String,
    pub from: String,
    pub timestamp: i64,
}

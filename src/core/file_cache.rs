//! Per-pattern on-disk record cache.
//!
//! Layout under the storage root:
//!
//! ```text
//! <pattern dir>/index.json          id -> CacheIndexEntry
//! <pattern dir>/sync.json           watermark + last sync time
//! <pattern dir>/messages/<id>.json  one normalized Record per file
//! ```
//!
//! Every file is replaced by write-to-temp + rename, and a record file is
//! always durable before its index entry is written. An index entry without
//! a readable file, or a file without an entry, is an inconsistency that
//! [`PatternDir::repair`] fixes.

use std::collections::HashMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tokio::sync::OwnedMutexGuard;

use crate::core::error::CacheError;
use crate::core::models::{
    CacheIndexEntry, CacheStats, ConsistencyReport, Record, RepairReport, SkippedEntry,
};
use crate::core::pattern::Pattern;

const INDEX_FILE: &str = "index.json";
const SYNC_FILE: &str = "sync.json";
const MESSAGES_DIR: &str = "messages";
const INDEX_VERSION: u32 = 1;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct IndexFile {
    version: u32,
    entries: IndexMap<String, CacheIndexEntry>,
}

/// Per-pattern sync progress, owned by the sync controller's write path.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncState {
    /// Newest timestamp durably persisted by a sync run.
    pub watermark: Option<i64>,
    pub last_sync: Option<String>,
}

/// Root of the file cache; hands out pattern directories and the
/// per-pattern write locks.
pub struct FileCache {
    root: PathBuf,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl FileCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        FileCache {
            root: root.into(),
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn pattern_path(&self, pattern: &Pattern) -> PathBuf {
        self.root.join(pattern.dir_name())
    }

    /// Load the pattern directory and its index. A missing directory or
    /// index is an empty (cold) cache.
    pub fn open(&self, pattern: &Pattern) -> Result<PatternDir, CacheError> {
        PatternDir::open(self.pattern_path(pattern))
    }

    /// Exclusive write access to one pattern. Different patterns never
    /// contend.
    pub async fn lock(&self, pattern: &Pattern) -> OwnedMutexGuard<()> {
        self.lock_dir(&pattern.dir_name()).await
    }

    /// Same lock as [`lock`](Self::lock), keyed by the directory name under
    /// the root.
    pub async fn lock_dir(&self, name: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            locks
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }

    /// Every pattern directory under the root that holds cached records.
    pub fn patterns(&self) -> Result<Vec<PathBuf>, CacheError> {
        let mut dirs = Vec::new();
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(dirs),
            Err(e) => return Err(e.into()),
        };
        for entry in entries {
            let path = entry?.path();
            if path.join(MESSAGES_DIR).is_dir() || path.join(INDEX_FILE).is_file() {
                dirs.push(path);
            }
        }
        dirs.sort();
        Ok(dirs)
    }

    pub fn has(&self, pattern: &Pattern, id: &str) -> Result<bool, CacheError> {
        Ok(self.open(pattern)?.has(id))
    }

    // Writers hold the pattern lock, so they queue behind a running sync
    // instead of racing its in-memory index.

    pub async fn store(
        &self,
        pattern: &Pattern,
        record: &Record,
    ) -> Result<CacheIndexEntry, CacheError> {
        let _guard = self.lock(pattern).await;
        let dir = self.pattern_path(pattern);
        let record = record.clone();
        blocking(move || PatternDir::open(dir)?.store(&record)).await
    }

    pub async fn remove(&self, pattern: &Pattern, id: &str) -> Result<bool, CacheError> {
        let _guard = self.lock(pattern).await;
        let dir = self.pattern_path(pattern);
        let id = id.to_string();
        blocking(move || PatternDir::open(dir)?.remove(&id)).await
    }

    pub async fn repair(&self, pattern: &Pattern) -> Result<RepairReport, CacheError> {
        self.repair_dir(self.pattern_path(pattern)).await
    }

    /// Repair one directory as returned by [`patterns`](Self::patterns).
    pub async fn repair_dir(&self, dir: PathBuf) -> Result<RepairReport, CacheError> {
        let name = dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let _guard = self.lock_dir(&name).await;
        blocking(move || PatternDir::open(dir)?.repair()).await
    }

    pub fn get(&self, pattern: &Pattern, id: &str) -> Result<Record, CacheError> {
        self.open(pattern)?.load(id)
    }

    pub fn load_all(&self, pattern: &Pattern) -> Result<CachedRecords, CacheError> {
        Ok(self.open(pattern)?.records())
    }

    pub fn stats(&self, pattern: &Pattern) -> Result<CacheStats, CacheError> {
        self.open(pattern)?.stats()
    }

    pub fn verify(&self, pattern: &Pattern) -> Result<ConsistencyReport, CacheError> {
        self.open(pattern)?.verify()
    }
}

/// Run filesystem work on the blocking pool.
pub(crate) async fn blocking<T, F>(work: F) -> Result<T, CacheError>
where
    F: FnOnce() -> Result<T, CacheError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| CacheError::Io(io::Error::other(e)))?
}

/// What [`PatternDir::apply_batch`] managed to persist.
#[derive(Debug, Default)]
pub struct BatchOutcome {
    /// Entries now in the index, in input order.
    pub stored: Vec<CacheIndexEntry>,
    /// Records whose file could not be written; their entries are untouched.
    pub failed: Vec<(String, CacheError)>,
    /// Ids that had an entry and no longer do.
    pub removed: Vec<String>,
}

/// One pattern directory with its index loaded in memory.
#[derive(Debug)]
pub struct PatternDir {
    dir: PathBuf,
    index: IndexFile,
}

impl PatternDir {
    pub fn open(dir: PathBuf) -> Result<Self, CacheError> {
        let index_path = dir.join(INDEX_FILE);
        let index = match fs::read(&index_path) {
            Ok(data) => match serde_json::from_slice::<IndexFile>(&data) {
                Ok(index) => index,
                Err(e) => {
                    log::warn!(
                        "Corrupt cache index {}: {}; rebuilding from record files",
                        index_path.display(),
                        e
                    );
                    let mut rebuilt = IndexFile {
                        version: INDEX_VERSION,
                        entries: IndexMap::new(),
                    };
                    for (id, entry) in scan_records(&dir)?.0 {
                        rebuilt.entries.insert(id, entry);
                    }
                    rebuilt
                }
            },
            Err(e) if e.kind() == io::ErrorKind::NotFound => IndexFile {
                version: INDEX_VERSION,
                entries: IndexMap::new(),
            },
            Err(e) => return Err(e.into()),
        };

        Ok(PatternDir { dir, index })
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }

    pub fn len(&self) -> usize {
        self.index.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.entries.is_empty()
    }

    pub fn entry(&self, id: &str) -> Option<&CacheIndexEntry> {
        self.index.entries.get(id)
    }

    /// True iff the id is indexed and its record file can be opened.
    pub fn has(&self, id: &str) -> bool {
        self.index.entries.contains_key(id)
            && validate_id(id).is_ok()
            && fs::File::open(self.record_path(id)).is_ok()
    }

    /// Write the record file, then its index entry. Overwrites replace both.
    pub fn store(&mut self, record: &Record) -> Result<CacheIndexEntry, CacheError> {
        let mut outcome = self.apply_batch(std::slice::from_ref(record), &[])?;
        if let Some((_, e)) = outcome.failed.pop() {
            return Err(e);
        }
        outcome
            .stored
            .pop()
            .ok_or_else(|| CacheError::NotCached(record.id.clone()))
    }

    /// Persist a batch with a single index write: every record file is made
    /// durable first, then the index is written once for all of them and for
    /// the removals, then the removed files are deleted. If the index write
    /// fails nothing in the batch is indexed and the error is returned.
    pub fn apply_batch(
        &mut self,
        records: &[Record],
        removals: &[String],
    ) -> Result<BatchOutcome, CacheError> {
        let mut outcome = BatchOutcome::default();
        if !records.is_empty() {
            fs::create_dir_all(self.dir.join(MESSAGES_DIR))?;
        }

        for record in records {
            match self.write_record(record) {
                Ok(entry) => outcome.stored.push(entry),
                Err(e) => outcome.failed.push((record.id.clone(), e)),
            }
        }

        let mut previous = Vec::new();
        for entry in &outcome.stored {
            let old = self.index.entries.insert(entry.id.clone(), entry.clone());
            previous.push((entry.id.clone(), old));
        }
        for id in removals {
            if validate_id(id).is_err() {
                continue;
            }
            if let Some(old) = self.index.entries.shift_remove(id) {
                previous.push((id.clone(), Some(old)));
                outcome.removed.push(id.clone());
            }
        }

        if previous.is_empty() {
            return Ok(outcome);
        }
        if let Err(e) = self.write_index() {
            for (id, old) in previous.into_iter().rev() {
                match old {
                    Some(old) => {
                        self.index.entries.insert(id, old);
                    }
                    None => {
                        self.index.entries.shift_remove(&id);
                    }
                }
            }
            return Err(e);
        }

        for id in &outcome.removed {
            match fs::remove_file(self.record_path(id)) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => log::warn!("Stale cache file for removed {}: {}", id, e),
            }
        }
        Ok(outcome)
    }

    fn write_record(&self, record: &Record) -> Result<CacheIndexEntry, CacheError> {
        validate_id(&record.id)?;
        let data = serde_json::to_vec_pretty(record)?;
        spit(&self.dir, &self.record_path(&record.id), &data)?;
        Ok(CacheIndexEntry {
            id: record.id.clone(),
            timestamp: record.timestamp,
            from: record.from.clone(),
            subject: record.subject.clone(),
            path: relative_record_path(&record.id),
            bytes: data.len() as u64,
        })
    }

    /// Drop the index entry first, then the file, so the index never names a
    /// file that is already gone.
    pub fn remove(&mut self, id: &str) -> Result<bool, CacheError> {
        validate_id(id)?;
        let Some(old) = self.index.entries.shift_remove(id) else {
            return Ok(false);
        };
        if let Err(e) = self.write_index() {
            self.index.entries.insert(id.to_string(), old);
            return Err(e);
        }
        match fs::remove_file(self.record_path(id)) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        Ok(true)
    }

    pub fn load(&self, id: &str) -> Result<Record, CacheError> {
        validate_id(id)?;
        if !self.index.entries.contains_key(id) {
            return Err(CacheError::NotCached(id.to_string()));
        }
        read_record(&self.record_path(id), id)
    }

    /// Lazy, restartable walk over all cached records, newest first.
    pub fn records(&self) -> CachedRecords {
        let mut entries: Vec<CacheIndexEntry> = self.index.entries.values().cloned().collect();
        entries.sort_by(|a, b| b.timestamp.cmp(&a.timestamp).then_with(|| a.id.cmp(&b.id)));
        CachedRecords {
            dir: self.dir.clone(),
            entries,
            pos: 0,
            skipped: Vec::new(),
            sender: None,
        }
    }

    /// Computed from the index and sync state; record files are not read.
    pub fn stats(&self) -> Result<CacheStats, CacheError> {
        let entries = self.index.entries.values();
        Ok(CacheStats {
            count: self.index.entries.len(),
            total_size: entries.clone().map(|e| e.bytes).sum(),
            oldest: entries.clone().map(|e| e.timestamp).min(),
            newest: entries.map(|e| e.timestamp).max(),
            last_sync: self.sync_state()?.last_sync,
        })
    }

    pub fn sync_state(&self) -> Result<SyncState, CacheError> {
        match fs::read(self.dir.join(SYNC_FILE)) {
            Ok(data) => serde_json::from_slice(&data).or_else(|e| {
                log::warn!(
                    "Corrupt sync state in {}: {}; starting from no watermark",
                    self.dir.display(),
                    e
                );
                Ok(SyncState::default())
            }),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(SyncState::default()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn save_sync_state(&self, state: &SyncState) -> Result<(), CacheError> {
        fs::create_dir_all(&self.dir)?;
        let data = serde_json::to_vec_pretty(state)?;
        spit(&self.dir, &self.dir.join(SYNC_FILE), &data)?;
        Ok(())
    }

    pub fn verify(&self) -> Result<ConsistencyReport, CacheError> {
        let mut report = ConsistencyReport::default();
        for id in self.index.entries.keys() {
            if !self.has(id) {
                report.missing_files.push(id.clone());
            }
        }
        for id in record_file_ids(&self.dir)? {
            if !self.index.entries.contains_key(&id) {
                report.unindexed_files.push(id);
            }
        }
        report.unindexed_files.sort();
        Ok(report)
    }

    /// Re-index: drop entries whose file is missing or unparseable, and
    /// index readable files that have no entry.
    pub fn repair(&mut self) -> Result<RepairReport, CacheError> {
        let mut report = RepairReport::default();

        let ids: Vec<String> = self.index.entries.keys().cloned().collect();
        for id in ids {
            let readable = validate_id(&id).is_ok()
                && read_record(&self.record_path(&id), &id).is_ok();
            if !readable {
                self.index.entries.shift_remove(&id);
                report.dropped.push(id);
            }
        }

        let (found, unreadable) = scan_records(&self.dir)?;
        for (id, entry) in found {
            if !self.index.entries.contains_key(&id) {
                self.index.entries.insert(id.clone(), entry);
                report.reindexed.push(id);
            }
        }
        report.unreadable = unreadable
            .into_iter()
            .filter(|id| !self.index.entries.contains_key(id))
            .collect();

        if !report.dropped.is_empty() || !report.reindexed.is_empty() {
            self.write_index()?;
            log::info!(
                "Repaired cache {}: {} dropped, {} re-indexed",
                self.dir.display(),
                report.dropped.len(),
                report.reindexed.len()
            );
        }
        Ok(report)
    }

    fn record_path(&self, id: &str) -> PathBuf {
        self.dir.join(relative_record_path(id))
    }

    fn write_index(&self) -> Result<(), CacheError> {
        fs::create_dir_all(&self.dir)?;
        let data = serde_json::to_vec_pretty(&self.index)?;
        spit(&self.dir, &self.dir.join(INDEX_FILE), &data)?;
        Ok(())
    }
}

/// Iterator over a snapshot of a pattern's index, loading one record file
/// per step. Unreadable files are skipped and collected in [`skipped`].
///
/// [`skipped`]: CachedRecords::skipped
#[derive(Debug, Clone)]
pub struct CachedRecords {
    dir: PathBuf,
    entries: Vec<CacheIndexEntry>,
    pos: usize,
    skipped: Vec<SkippedEntry>,
    sender: Option<Pattern>,
}

impl CachedRecords {
    /// Only yield records whose sender matches `pattern`.
    pub fn matching(mut self, pattern: &Pattern) -> Self {
        self.sender = Some(pattern.clone());
        self
    }

    pub fn skipped(&self) -> &[SkippedEntry] {
        &self.skipped
    }

    /// Start over from the newest record.
    pub fn rewind(&mut self) {
        self.pos = 0;
        self.skipped.clear();
    }
}

impl Iterator for CachedRecords {
    type Item = Record;

    fn next(&mut self) -> Option<Record> {
        while let Some(entry) = self.entries.get(self.pos) {
            self.pos += 1;
            let result = validate_id(&entry.id)
                .and_then(|_| read_record(&self.dir.join(relative_record_path(&entry.id)), &entry.id));
            match result {
                Ok(record) => {
                    if self.sender.as_ref().map_or(true, |p| p.matches(&record.from)) {
                        return Some(record);
                    }
                }
                Err(e) => {
                    log::warn!("Skipping cached message {}: {}", entry.id, e);
                    self.skipped.push(SkippedEntry {
                        id: entry.id.clone(),
                        reason: e.to_string(),
                    });
                }
            }
        }
        None
    }
}

/// Ids become file names, so only a conservative character set is allowed.
pub fn validate_id(id: &str) -> Result<(), CacheError> {
    let ok = !id.is_empty()
        && !id.starts_with('.')
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'));
    if ok {
        Ok(())
    } else {
        Err(CacheError::InvalidId(id.to_string()))
    }
}

fn relative_record_path(id: &str) -> String {
    format!("{MESSAGES_DIR}/{id}.json")
}

fn read_record(path: &Path, id: &str) -> Result<Record, CacheError> {
    let data = fs::read(path)?;
    let record: Record = serde_json::from_slice(&data).map_err(|e| CacheError::Corrupt {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    if record.id != id {
        return Err(CacheError::Corrupt {
            path: path.to_path_buf(),
            reason: format!("file holds message {}", record.id),
        });
    }
    Ok(record)
}

fn record_file_ids(dir: &Path) -> Result<Vec<String>, CacheError> {
    let entries = match fs::read_dir(dir.join(MESSAGES_DIR)) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let mut ids = Vec::new();
    for entry in entries {
        let path = entry?.path();
        if path.extension().is_some_and(|ext| ext == "json") {
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                ids.push(stem.to_string());
            }
        }
    }
    Ok(ids)
}

/// Index entries for every parseable record file, plus the ids of files that
/// could not be parsed.
fn scan_records(dir: &Path) -> Result<(Vec<(String, CacheIndexEntry)>, Vec<String>), CacheError> {
    let mut ids = record_file_ids(dir)?;
    ids.sort();

    let mut found = Vec::new();
    let mut unreadable = Vec::new();
    for id in ids {
        if validate_id(&id).is_err() {
            unreadable.push(id);
            continue;
        }
        let path = dir.join(relative_record_path(&id));
        match read_record(&path, &id) {
            Ok(record) => {
                let bytes = fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
                found.push((
                    id.clone(),
                    CacheIndexEntry {
                        id,
                        timestamp: record.timestamp,
                        from: record.from,
                        subject: record.subject,
                        path: relative_record_path(&record.id),
                        bytes,
                    },
                ));
            }
            Err(e) => {
                log::warn!("Unreadable cache file for {}: {}", id, e);
                unreadable.push(id);
            }
        }
    }
    Ok((found, unreadable))
}

/// Atomically replace `path` with `data`, staging the temp file in `tmp`.
fn spit(tmp: &Path, path: &Path, data: &[u8]) -> io::Result<()> {
    let mut tf = tempfile::NamedTempFile::new_in(tmp)?;
    tf.as_file_mut().write_all(data)?;
    tf.as_file_mut().sync_all()?;
    tf.persist(path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str, timestamp: i64) -> Record {
        Record {
            id: id.into(),
            thread_id: format!("t-{id}"),
            from: "Alice <alice@example.com>".into(),
            subject: format!("subject {id}"),
            body_text: format!("body of {id}"),
            timestamp,
            ..Default::default()
        }
    }

    fn setup() -> (tempfile::TempDir, FileCache, Pattern) {
        let tmp = tempfile::tempdir().unwrap();
        let cache = FileCache::new(tmp.path().join("emails"));
        (tmp, cache, Pattern::parse("@example.com").unwrap())
    }

    #[test]
    fn missing_index_is_a_cold_cache() {
        let (_tmp, cache, pattern) = setup();
        assert!(!cache.has(&pattern, "nope").unwrap());
        assert_eq!(cache.load_all(&pattern).unwrap().count(), 0);
        assert_eq!(cache.stats(&pattern).unwrap(), CacheStats::default());
        assert!(cache.patterns().unwrap().is_empty());
    }

    #[tokio::test]
    async fn store_then_load_all_round_trips_once() {
        let (_tmp, cache, pattern) = setup();
        let r = record("abc123", 1000);
        cache.store(&pattern, &r).await.unwrap();

        assert!(cache.has(&pattern, "abc123").unwrap());
        let all: Vec<Record> = cache.load_all(&pattern).unwrap().collect();
        assert_eq!(all, vec![r]);
        assert_eq!(cache.patterns().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn overwrite_replaces_file_and_entry() {
        let (_tmp, cache, pattern) = setup();
        let mut r = record("abc123", 1000);
        cache.store(&pattern, &r).await.unwrap();
        r.label_ids.insert("STARRED".into());
        cache.store(&pattern, &r).await.unwrap();

        let dir = cache.open(&pattern).unwrap();
        assert_eq!(dir.len(), 1);
        assert!(dir.load("abc123").unwrap().label_ids.contains("STARRED"));
    }

    #[tokio::test]
    async fn load_all_is_newest_first_and_restartable() {
        let (_tmp, cache, pattern) = setup();
        cache.store(&pattern, &record("a", 10)).await.unwrap();
        cache.store(&pattern, &record("b", 30)).await.unwrap();
        cache.store(&pattern, &record("c", 20)).await.unwrap();

        let mut records = cache.load_all(&pattern).unwrap();
        let first: Vec<String> = records.by_ref().map(|r| r.id).collect();
        assert_eq!(first, vec!["b", "c", "a"]);
        records.rewind();
        assert_eq!(records.count(), 3);
    }

    #[tokio::test]
    async fn matching_filters_by_sender() {
        let (_tmp, cache, pattern) = setup();
        let mut other = record("b", 20);
        other.from = "Mallory <m@evil.example.org>".into();
        cache.store(&pattern, &record("a", 10)).await.unwrap();
        cache.store(&pattern, &other).await.unwrap();

        let ids: Vec<String> = cache
            .load_all(&pattern)
            .unwrap()
            .matching(&pattern)
            .map(|r| r.id)
            .collect();
        assert_eq!(ids, vec!["a"]);
    }

    #[tokio::test]
    async fn deleted_file_is_skipped_and_reported() {
        let (_tmp, cache, pattern) = setup();
        cache.store(&pattern, &record("a", 10)).await.unwrap();
        cache.store(&pattern, &record("b", 20)).await.unwrap();
        let dir = cache.pattern_path(&pattern);
        fs::remove_file(dir.join("messages/a.json")).unwrap();

        assert!(!cache.has(&pattern, "a").unwrap());
        assert!(cache.has(&pattern, "b").unwrap());

        let mut records = cache.load_all(&pattern).unwrap();
        let ids: Vec<String> = records.by_ref().map(|r| r.id).collect();
        assert_eq!(ids, vec!["b"]);
        assert_eq!(records.skipped().len(), 1);
        assert_eq!(records.skipped()[0].id, "a");
    }

    #[tokio::test]
    async fn corrupt_file_is_skipped_not_fatal() {
        let (_tmp, cache, pattern) = setup();
        cache.store(&pattern, &record("a", 10)).await.unwrap();
        cache.store(&pattern, &record("b", 20)).await.unwrap();
        let dir = cache.pattern_path(&pattern);
        fs::write(dir.join("messages/b.json"), b"{ not json").unwrap();

        let mut records = cache.load_all(&pattern).unwrap();
        assert_eq!(records.by_ref().count(), 1);
        assert_eq!(records.skipped()[0].id, "b");
        assert!(matches!(
            cache.get(&pattern, "b"),
            Err(CacheError::Corrupt { .. })
        ));
    }

    #[tokio::test]
    async fn stats_come_from_the_index() {
        let (_tmp, cache, pattern) = setup();
        let e1 = cache.store(&pattern, &record("a", 10)).await.unwrap();
        let e2 = cache.store(&pattern, &record("b", 30)).await.unwrap();
        // Removing the files must not change index-derived stats.
        let dir = cache.pattern_path(&pattern);
        fs::remove_dir_all(dir.join("messages")).unwrap();

        let stats = cache.stats(&pattern).unwrap();
        assert_eq!(stats.count, 2);
        assert_eq!(stats.total_size, e1.bytes + e2.bytes);
        assert_eq!(stats.oldest, Some(10));
        assert_eq!(stats.newest, Some(30));
    }

    #[tokio::test]
    async fn unsafe_ids_are_rejected() {
        let (_tmp, cache, pattern) = setup();
        for bad in ["", "../escape", "a/b", ".hidden"] {
            assert!(matches!(
                cache.store(&pattern, &record(bad, 1)).await,
                Err(CacheError::InvalidId(_))
            ));
        }
    }

    #[tokio::test]
    async fn remove_drops_entry_and_file() {
        let (_tmp, cache, pattern) = setup();
        cache.store(&pattern, &record("a", 10)).await.unwrap();
        assert!(cache.remove(&pattern, "a").await.unwrap());
        assert!(!cache.remove(&pattern, "a").await.unwrap());
        assert!(!cache.pattern_path(&pattern).join("messages/a.json").exists());
        assert!(matches!(
            cache.get(&pattern, "a"),
            Err(CacheError::NotCached(_))
        ));
    }

    #[tokio::test]
    async fn verify_and_repair_reconcile_index_and_files() {
        let (_tmp, cache, pattern) = setup();
        cache.store(&pattern, &record("a", 10)).await.unwrap();
        cache.store(&pattern, &record("b", 20)).await.unwrap();
        let dir = cache.pattern_path(&pattern);

        // An orphan file (interrupted before its index update) and a lost file.
        let orphan = serde_json::to_vec_pretty(&record("c", 30)).unwrap();
        fs::write(dir.join("messages/c.json"), orphan).unwrap();
        fs::write(dir.join("messages/junk.json"), b"garbage").unwrap();
        fs::remove_file(dir.join("messages/a.json")).unwrap();

        let report = cache.verify(&pattern).unwrap();
        assert_eq!(report.missing_files, vec!["a"]);
        assert_eq!(report.unindexed_files, vec!["c", "junk"]);

        let repaired = cache.repair(&pattern).await.unwrap();
        assert_eq!(repaired.dropped, vec!["a"]);
        assert_eq!(repaired.reindexed, vec!["c"]);
        assert_eq!(repaired.unreadable, vec!["junk"]);

        let after = cache.verify(&pattern).unwrap();
        assert!(after.missing_files.is_empty());
        assert_eq!(after.unindexed_files, vec!["junk"]);
        let ids: Vec<String> = cache.load_all(&pattern).unwrap().map(|r| r.id).collect();
        assert_eq!(ids, vec!["c", "b"]);
    }

    #[tokio::test]
    async fn corrupt_index_is_rebuilt_from_files() {
        let (_tmp, cache, pattern) = setup();
        cache.store(&pattern, &record("a", 10)).await.unwrap();
        fs::write(cache.pattern_path(&pattern).join(INDEX_FILE), b"][").unwrap();

        let dir = cache.open(&pattern).unwrap();
        assert!(dir.has("a"));
        assert_eq!(dir.entry("a").unwrap().timestamp, 10);
    }

    #[test]
    fn sync_state_defaults_and_persists() {
        let (_tmp, cache, pattern) = setup();
        let dir = cache.open(&pattern).unwrap();
        assert_eq!(dir.sync_state().unwrap(), SyncState::default());

        let state = SyncState {
            watermark: Some(42),
            last_sync: Some("2026-01-01T00:00:00Z".into()),
        };
        dir.save_sync_state(&state).unwrap();
        assert_eq!(cache.open(&pattern).unwrap().sync_state().unwrap(), state);
        assert_eq!(
            cache.stats(&pattern).unwrap().last_sync.as_deref(),
            Some("2026-01-01T00:00:00Z")
        );
    }

    #[test]
    fn batch_writes_files_then_one_index() {
        let (_tmp, cache, pattern) = setup();
        let mut dir = cache.open(&pattern).unwrap();
        dir.store(&record("old", 5)).unwrap();

        let outcome = dir
            .apply_batch(
                &[record("a", 10), record("../bad", 11), record("b", 20)],
                &["old".to_string(), "never-cached".to_string()],
            )
            .unwrap();
        let stored: Vec<&str> = outcome.stored.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(stored, vec!["a", "b"]);
        assert_eq!(outcome.failed.len(), 1);
        assert!(matches!(outcome.failed[0].1, CacheError::InvalidId(_)));
        assert_eq!(outcome.removed, vec!["old"]);

        let reopened = cache.open(&pattern).unwrap();
        assert_eq!(reopened.len(), 2);
        assert!(reopened.has("a") && reopened.has("b"));
        assert!(!cache.pattern_path(&pattern).join("messages/old.json").exists());
        assert!(reopened.verify().unwrap().is_consistent());
    }

    #[tokio::test(start_paused = true)]
    async fn writers_wait_for_the_pattern_lock() {
        let (_tmp, cache, pattern) = setup();
        let cache = Arc::new(cache);
        let held = cache.lock(&pattern).await;

        let writer = {
            let cache = cache.clone();
            let pattern = pattern.clone();
            tokio::spawn(async move { cache.store(&pattern, &record("a", 10)).await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(!writer.is_finished());
        assert!(!cache.has(&pattern, "a").unwrap());

        drop(held);
        writer.await.unwrap().unwrap();
        assert!(cache.has(&pattern, "a").unwrap());
    }

    #[tokio::test]
    async fn pattern_locks_are_independent() {
        let (_tmp, cache, pattern) = setup();
        let other = Pattern::parse("@other.org").unwrap();
        let _held = cache.lock(&pattern).await;
        // A different pattern is not blocked by the held lock.
        let _other = cache.lock(&other).await;
        let same = cache.locks.lock().unwrap().get(&pattern.dir_name()).cloned().unwrap();
        assert!(same.try_lock().is_err());
    }
}

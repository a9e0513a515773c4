//! Facade over the file cache, the indexed store and the sync controller.
//!
//! [`Archive`] is everything that works offline; [`Mirror`] adds a remote.

use std::path::PathBuf;
use std::sync::Arc;

use crate::config::Config;
use crate::core::error::Error;
use crate::core::file_cache::{CachedRecords, FileCache, PatternDir};
use crate::core::models::{
    CacheStats, ConsistencyReport, IndexStats, IngestReport, RecordSummary, RepairReport,
    SkippedEntry, SyncMode, SyncReport,
};
use crate::core::pattern::Pattern;
use crate::core::remote::RemoteService;
use crate::core::reply::ReplyRules;
use crate::core::store::IndexHandle;
use crate::core::sync::{SyncController, SyncOptions};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Stats {
    Pattern(CacheStats),
    Global(IndexStats),
}

/// Local half of the mirror: cached records and their searchable index.
#[derive(Clone)]
pub struct Archive {
    cache: Arc<FileCache>,
    index: IndexHandle,
    top_n: usize,
}

impl Archive {
    pub fn new(cache: Arc<FileCache>, index: IndexHandle, top_n: usize) -> Self {
        Archive {
            cache,
            index,
            top_n,
        }
    }

    pub fn open(config: &Config) -> Result<Self, Error> {
        let cache = Arc::new(FileCache::new(config.storage_dir.clone()));
        let index = IndexHandle::open(&config.database_path)?;
        Ok(Self::new(cache, index, config.top_n))
    }

    pub fn cache(&self) -> &Arc<FileCache> {
        &self.cache
    }

    pub fn index(&self) -> &IndexHandle {
        &self.index
    }

    /// Cached records for `pattern` whose sender matches it, newest first.
    pub fn load_cached(&self, pattern: &Pattern) -> Result<CachedRecords, Error> {
        Ok(self.cache.load_all(pattern)?.matching(pattern))
    }

    pub async fn search(&self, text: &str, limit: usize) -> Result<Vec<RecordSummary>, Error> {
        Ok(self.index.search(text, limit).await?)
    }

    /// Cache stats for one pattern, or index-wide aggregates.
    pub async fn stats(&self, pattern: Option<&Pattern>) -> Result<Stats, Error> {
        match pattern {
            Some(pattern) => Ok(Stats::Pattern(self.cache.stats(pattern)?)),
            None => Ok(Stats::Global(self.index.stats(self.top_n).await?)),
        }
    }

    /// Ingest every cached record of every pattern into the index.
    pub async fn ingest_cache(&self) -> Result<IngestReport, Error> {
        let mut report = IngestReport::default();
        for dir in self.cache.patterns()? {
            match PatternDir::open(dir.clone()) {
                Ok(pattern_dir) => {
                    let records = pattern_dir.records();
                    self.ingest_records(records, &mut report).await;
                }
                Err(e) => {
                    log::warn!("Skipping cache directory {}: {}", dir.display(), e);
                    report.failed.push(SkippedEntry {
                        id: dir.display().to_string(),
                        reason: e.to_string(),
                    });
                }
            }
        }
        log::info!(
            "Ingested cache: {} inserted, {} updated, {} failed",
            report.inserted,
            report.updated,
            report.failed.len()
        );
        Ok(report)
    }

    /// Ingest one pattern's cache.
    pub async fn ingest_pattern(&self, pattern: &Pattern) -> Result<IngestReport, Error> {
        let mut report = IngestReport::default();
        self.ingest_records(self.cache.load_all(pattern)?, &mut report)
            .await;
        Ok(report)
    }

    /// Drop the index and re-derive it from the file cache.
    pub async fn rebuild(&self) -> Result<IngestReport, Error> {
        self.index.clear().await?;
        self.ingest_cache().await
    }

    pub fn verify(&self) -> Result<Vec<(PathBuf, ConsistencyReport)>, Error> {
        let mut reports = Vec::new();
        for dir in self.cache.patterns()? {
            let report = PatternDir::open(dir.clone())?.verify()?;
            reports.push((dir, report));
        }
        Ok(reports)
    }

    /// Repair every pattern directory, each under its pattern lock.
    pub async fn repair(&self) -> Result<Vec<(PathBuf, RepairReport)>, Error> {
        let mut reports = Vec::new();
        for dir in self.cache.patterns()? {
            let report = self.cache.repair_dir(dir.clone()).await?;
            reports.push((dir, report));
        }
        Ok(reports)
    }

    async fn ingest_records(&self, mut records: CachedRecords, report: &mut IngestReport) {
        for record in records.by_ref() {
            let id = record.id.clone();
            match self.index.ingest(record).await {
                Ok(true) => report.inserted += 1,
                Ok(false) => report.updated += 1,
                Err(e) => {
                    log::error!("Failed to index {}: {}", id, e);
                    report.failed.push(SkippedEntry {
                        id,
                        reason: e.to_string(),
                    });
                }
            }
        }
        report.failed.extend(records.skipped().iter().cloned());
    }
}

pub struct Mirror<R> {
    archive: Archive,
    controller: SyncController<R>,
}

impl<R: RemoteService> Mirror<R> {
    pub fn new(archive: Archive, remote: Arc<R>, rules: ReplyRules, options: SyncOptions) -> Self {
        let controller =
            SyncController::new(remote, archive.cache.clone(), Arc::new(rules), options);
        Mirror {
            archive,
            controller,
        }
    }

    pub fn open(config: &Config, remote: Arc<R>) -> Result<Self, Error> {
        config.validate()?;
        let archive = Archive::open(config)?;
        Ok(Self::new(
            archive,
            remote,
            config.reply_rules()?,
            config.sync_options(),
        ))
    }

    pub fn archive(&self) -> &Archive {
        &self.archive
    }

    pub async fn sync(
        &self,
        pattern: &Pattern,
        max_results: usize,
        mode: SyncMode,
    ) -> Result<SyncReport, Error> {
        Ok(self.controller.sync(pattern, max_results, mode).await?)
    }

    /// Sync, then index whatever the run persisted.
    pub async fn sync_and_index(
        &self,
        pattern: &Pattern,
        max_results: usize,
        mode: SyncMode,
    ) -> Result<(SyncReport, IngestReport), Error> {
        let report = self.sync(pattern, max_results, mode).await?;
        let ingest = self.index_ids(pattern, &report.fetched).await?;
        for id in &report.gone {
            self.archive.index.remove(id).await?;
        }
        Ok((report, ingest))
    }

    /// Re-fetch cached messages of `pattern` whose indexed body is empty.
    pub async fn refresh_missing_bodies(
        &self,
        pattern: &Pattern,
    ) -> Result<(SyncReport, IngestReport), Error> {
        let dir = self.archive.cache.open(pattern)?;
        let ids: Vec<String> = self
            .archive
            .index
            .ids_missing_body()
            .await?
            .into_iter()
            .filter(|id| dir.entry(id).is_some())
            .collect();
        log::info!("{} messages of {} have no body", ids.len(), pattern);
        if ids.is_empty() {
            return Ok((SyncReport::default(), IngestReport::default()));
        }
        self.sync_and_index(pattern, 0, SyncMode::ForceRefresh(ids))
            .await
    }

    pub fn load_cached(&self, pattern: &Pattern) -> Result<CachedRecords, Error> {
        self.archive.load_cached(pattern)
    }

    pub async fn search(&self, text: &str, limit: usize) -> Result<Vec<RecordSummary>, Error> {
        self.archive.search(text, limit).await
    }

    pub async fn stats(&self, pattern: Option<&Pattern>) -> Result<Stats, Error> {
        self.archive.stats(pattern).await
    }

    async fn index_ids(&self, pattern: &Pattern, ids: &[String]) -> Result<IngestReport, Error> {
        let dir = self.archive.cache.open(pattern)?;
        let mut report = IngestReport::default();
        for id in ids {
            let record = match dir.load(id) {
                Ok(record) => record,
                Err(e) => {
                    report.failed.push(SkippedEntry {
                        id: id.clone(),
                        reason: e.to_string(),
                    });
                    continue;
                }
            };
            match self.archive.index.ingest(record).await {
                Ok(true) => report.inserted += 1,
                Ok(false) => report.updated += 1,
                Err(e) => report.failed.push(SkippedEntry {
                    id: id.clone(),
                    reason: e.to_string(),
                }),
            }
        }
        Ok(report)
    }
}

//! Reconciles the remote listing with a pattern's file cache.
//!
//! A run lists ids page by page, decides which ones need a content fetch,
//! fetches them concurrently with retry, and persists each parsed record
//! before advancing the pattern's watermark. Per-id failures end up in the
//! report; only contract violations and a failed first listing page are
//! errors.

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use tokio::time::Instant;

use crate::core::error::{RemoteError, SyncError};
use crate::core::file_cache::{blocking, validate_id, FileCache, PatternDir, SyncState};
use crate::core::mime;
use crate::core::models::{FailedFetch, SyncMode, SyncReport};
use crate::core::pattern::Pattern;
use crate::core::remote::{RawMessage, RemoteService};
use crate::core::reply::ReplyRules;

pub const DEFAULT_PAGE_SIZE: usize = 500;
pub const DEFAULT_CONCURRENCY: usize = 8;

/// Exponential backoff for retryable remote errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total tries per call, including the first.
    pub attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            attempts: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(32),
        }
    }
}

impl RetryPolicy {
    /// Delay after the `attempt`-th failure (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncOptions {
    pub page_size: usize,
    pub concurrency: usize,
    pub retry: RetryPolicy,
    /// Wall-clock bound for a whole run.
    pub deadline: Option<Duration>,
}

impl Default for SyncOptions {
    fn default() -> Self {
        SyncOptions {
            page_size: DEFAULT_PAGE_SIZE,
            concurrency: DEFAULT_CONCURRENCY,
            retry: RetryPolicy::default(),
            deadline: None,
        }
    }
}

pub struct SyncController<R> {
    remote: Arc<R>,
    cache: Arc<FileCache>,
    rules: Arc<ReplyRules>,
    options: SyncOptions,
}

impl<R: RemoteService> SyncController<R> {
    pub fn new(
        remote: Arc<R>,
        cache: Arc<FileCache>,
        rules: Arc<ReplyRules>,
        options: SyncOptions,
    ) -> Self {
        SyncController {
            remote,
            cache,
            rules,
            options,
        }
    }

    /// Mirror up to `max_results` remote messages (0 = unbounded) for
    /// `pattern` into the file cache.
    pub async fn sync(
        &self,
        pattern: &Pattern,
        max_results: usize,
        mode: SyncMode,
    ) -> Result<SyncReport, SyncError> {
        if self.options.page_size == 0 {
            return Err(SyncError::InvalidArgument("page size must be positive".into()));
        }
        if self.options.concurrency == 0 {
            return Err(SyncError::InvalidArgument("concurrency must be positive".into()));
        }
        if let SyncMode::ForceRefresh(ids) = &mode {
            if let Some(bad) = ids.iter().find(|id| validate_id(id).is_err()) {
                return Err(SyncError::InvalidArgument(format!("invalid message id {bad:?}")));
            }
        }

        let deadline = self.options.deadline.map(|d| Instant::now() + d);
        let _guard = self.cache.lock(pattern).await;
        let path = self.cache.pattern_path(pattern);
        let (mut dir, state) = blocking(move || {
            let dir = PatternDir::open(path)?;
            let state = dir.sync_state()?;
            Ok((dir, state))
        })
        .await?;

        log::info!(
            "Sync {} started ({:?}, max {}, watermark {:?})",
            pattern,
            mode,
            max_results,
            state.watermark
        );

        let mut report = SyncReport::default();
        let ids = match &mode {
            SyncMode::ForceRefresh(ids) => {
                let mut ids = dedup(ids.iter().cloned());
                if max_results > 0 {
                    ids.truncate(max_results);
                }
                ids
            }
            SyncMode::Full | SyncMode::Incremental => {
                let query = pattern.remote_query();
                let (ids, truncated) = self.list_ids(query.as_deref(), max_results, deadline).await?;
                report.listing_truncated = truncated;
                ids
            }
        };
        report.listed = ids.len();

        let mut to_fetch = Vec::new();
        for id in ids {
            if validate_id(&id).is_err() {
                log::warn!("Remote listed an unusable id {:?}", id);
                report.failed.push(FailedFetch {
                    id,
                    error: "invalid message id".into(),
                });
                continue;
            }
            let known_current = match (&mode, state.watermark) {
                (SyncMode::Incremental, Some(watermark)) => {
                    dir.has(&id) && dir.entry(&id).is_some_and(|e| e.timestamp <= watermark)
                }
                _ => false,
            };
            if known_current {
                report.skipped.push(id);
            } else {
                to_fetch.push(id);
            }
        }

        let mut pending: HashSet<String> = to_fetch.iter().cloned().collect();
        let mut newest_persisted: Option<i64> = None;
        {
            // Whatever has completed is persisted together, one index write
            // per batch.
            let mut batches = stream::iter(to_fetch.iter().cloned())
                .map(|id| async move {
                    let result = self.fetch_with_retry(&id).await;
                    (id, result)
                })
                .buffer_unordered(self.options.concurrency)
                .ready_chunks(self.options.concurrency);

            loop {
                let Some(next) = with_deadline(deadline, batches.next()).await else {
                    log::warn!(
                        "Sync {} hit its deadline with {} fetches outstanding",
                        pattern,
                        pending.len()
                    );
                    break;
                };
                let Some(batch) = next else { break };

                let mut records = Vec::new();
                let mut removals = Vec::new();
                for (id, result) in batch {
                    pending.remove(&id);
                    match result {
                        Ok(raw) if raw.id != id => {
                            log::warn!("Fetch of {} returned message {}", id, raw.id);
                            report.failed.push(FailedFetch {
                                id,
                                error: format!("remote returned message {}", raw.id),
                            });
                        }
                        Ok(raw) => records.push(mime::parse_message(&raw, &self.rules)),
                        Err(e) if e.is_not_found() => {
                            log::warn!("Message {} is gone from the remote", id);
                            report.gone.push(id.clone());
                            removals.push(id);
                        }
                        Err(e) => {
                            report.failed.push(FailedFetch {
                                id,
                                error: e.to_string(),
                            });
                        }
                    }
                }
                if records.is_empty() && removals.is_empty() {
                    continue;
                }

                let staged: Vec<String> = records.iter().map(|r| r.id.clone()).collect();
                let (returned, outcome) = blocking(move || {
                    let outcome = dir.apply_batch(&records, &removals);
                    Ok((dir, outcome))
                })
                .await?;
                dir = returned;

                match outcome {
                    Ok(outcome) => {
                        for entry in outcome.stored {
                            newest_persisted = newest_persisted.max(Some(entry.timestamp));
                            report.fetched.push(entry.id);
                        }
                        for (id, e) in outcome.failed {
                            log::error!("Failed to cache message {}: {}", id, e);
                            report.failed.push(FailedFetch {
                                id,
                                error: e.to_string(),
                            });
                        }
                    }
                    Err(e) => {
                        log::error!("Failed to write cache index for {}: {}", pattern, e);
                        for id in staged {
                            report.failed.push(FailedFetch {
                                id,
                                error: e.to_string(),
                            });
                        }
                    }
                }
            }
        }

        report.cancelled = to_fetch
            .into_iter()
            .filter(|id| pending.contains(id))
            .collect();

        report.watermark = state.watermark.max(newest_persisted);
        if !report.fetched.is_empty() {
            let state = SyncState {
                watermark: report.watermark,
                last_sync: Some(chrono::Utc::now().to_rfc3339()),
            };
            blocking(move || dir.save_sync_state(&state)).await?;
        }

        log::info!(
            "Sync {} finished: {} listed, {} fetched, {} skipped, {} failed, {} gone, {} cancelled",
            pattern,
            report.listed,
            report.fetched.len(),
            report.skipped.len(),
            report.failed.len(),
            report.gone.len(),
            report.cancelled.len()
        );
        Ok(report)
    }

    /// Page through the listing until it ends or `max_results` ids are in
    /// hand. Spillover from the last page is dropped. The flag is set when
    /// a later page failed or the deadline cut the listing short.
    async fn list_ids(
        &self,
        query: Option<&str>,
        max_results: usize,
        deadline: Option<Instant>,
    ) -> Result<(Vec<String>, bool), SyncError> {
        let mut ids = Vec::new();
        let mut seen = HashSet::new();
        let mut cursor: Option<String> = None;
        let mut pages = 0usize;

        loop {
            let call = self.with_retry("list", || {
                self.remote
                    .list(query, cursor.as_deref(), self.options.page_size)
            });
            let page = match with_deadline(deadline, call).await {
                Some(Ok(page)) => page,
                Some(Err(e)) if pages == 0 => return Err(SyncError::Listing(e)),
                Some(Err(e)) => {
                    log::warn!("Listing page {} failed, continuing with {} ids: {}", pages + 1, ids.len(), e);
                    return Ok((ids, true));
                }
                None => {
                    log::warn!("Deadline reached while listing ({} ids so far)", ids.len());
                    return Ok((ids, true));
                }
            };
            pages += 1;

            for id in page.ids {
                if seen.insert(id.clone()) {
                    ids.push(id);
                }
            }
            if max_results > 0 && ids.len() >= max_results {
                ids.truncate(max_results);
                break;
            }
            match page.next_cursor {
                Some(next) if cursor.as_deref() != Some(next.as_str()) => cursor = Some(next),
                Some(_) => {
                    log::warn!("Listing repeated cursor after {} pages; stopping", pages);
                    break;
                }
                None => break,
            }
        }

        log::debug!("Listed {} ids in {} pages", ids.len(), pages);
        Ok((ids, false))
    }

    async fn fetch_with_retry(&self, id: &str) -> Result<RawMessage, RemoteError> {
        self.with_retry(id, || self.remote.fetch(id)).await
    }

    async fn with_retry<T, F, Fut>(&self, what: &str, mut call: F) -> Result<T, RemoteError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, RemoteError>>,
    {
        let policy = &self.options.retry;
        let mut attempt = 1;
        loop {
            match call().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt < policy.attempts => {
                    let delay = policy.delay_for(attempt);
                    log::debug!(
                        "{} failed (attempt {}/{}): {}; retrying in {:?}",
                        what,
                        attempt,
                        policy.attempts,
                        e,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    if e.is_retryable() {
                        log::warn!("{} failed after {} attempts: {}", what, attempt, e);
                    }
                    return Err(e);
                }
            }
        }
    }
}

/// `None` when the deadline passed before `fut` completed.
async fn with_deadline<F: Future>(deadline: Option<Instant>, fut: F) -> Option<F::Output> {
    match deadline {
        Some(at) => tokio::time::timeout_at(at, fut).await.ok(),
        None => Some(fut.await),
    }
}

fn dedup(ids: impl IntoIterator<Item = String>) -> Vec<String> {
    let mut seen = HashSet::new();
    ids.into_iter().filter(|id| seen.insert(id.clone())).collect()
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::Path;

    use super::*;
    use crate::core::testutil::{raw_message, Failure, FakeRemote};

    fn options() -> SyncOptions {
        SyncOptions {
            page_size: 5,
            concurrency: 3,
            retry: RetryPolicy {
                attempts: 3,
                base_delay: Duration::from_millis(10),
                max_delay: Duration::from_millis(40),
            },
            deadline: None,
        }
    }

    fn setup(
        remote: FakeRemote,
        options: SyncOptions,
    ) -> (tempfile::TempDir, Arc<FakeRemote>, Arc<FileCache>, SyncController<FakeRemote>) {
        let tmp = tempfile::tempdir().unwrap();
        let remote = Arc::new(remote);
        let cache = Arc::new(FileCache::new(tmp.path().join("emails")));
        let controller = SyncController::new(
            remote.clone(),
            cache.clone(),
            Arc::new(ReplyRules::default()),
            options,
        );
        (tmp, remote, cache, controller)
    }

    fn pattern() -> Pattern {
        Pattern::parse("@shop.com").unwrap()
    }

    fn snapshot(dir: &Path) -> Vec<(String, Vec<u8>)> {
        let mut files = Vec::new();
        let mut stack = vec![dir.to_path_buf()];
        while let Some(path) = stack.pop() {
            for entry in fs::read_dir(&path).unwrap() {
                let path = entry.unwrap().path();
                if path.is_dir() {
                    stack.push(path);
                } else {
                    files.push((path.display().to_string(), fs::read(&path).unwrap()));
                }
            }
        }
        files.sort();
        files
    }

    #[test]
    fn backoff_doubles_up_to_the_cap() {
        let policy = RetryPolicy {
            attempts: 10,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(1000),
        };
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(4), Duration::from_millis(800));
        assert_eq!(policy.delay_for(5), Duration::from_millis(1000));
        assert_eq!(policy.delay_for(64), Duration::from_millis(1000));
    }

    #[tokio::test(start_paused = true)]
    async fn second_incremental_run_is_a_no_op() {
        let (_tmp, remote, cache, controller) =
            setup(FakeRemote::with_messages(7, "Shop <orders@shop.com>"), options());
        let p = pattern();

        let first = controller.sync(&p, 0, SyncMode::Incremental).await.unwrap();
        assert_eq!(first.listed, 7);
        assert_eq!(first.fetched.len(), 7);
        assert!(first.is_complete());
        assert_eq!(first.watermark, Some(1_700_000_000_000));
        assert_eq!(remote.fetch_count(), 7);
        assert_eq!(remote.queries.lock().unwrap()[0].as_deref(), Some("from:shop.com"));

        let before = snapshot(&cache.pattern_path(&p));
        let second = controller.sync(&p, 0, SyncMode::Incremental).await.unwrap();
        assert_eq!(remote.fetch_count(), 7);
        assert!(second.fetched.is_empty());
        assert_eq!(second.skipped.len(), 7);
        assert_eq!(second.watermark, first.watermark);
        assert_eq!(snapshot(&cache.pattern_path(&p)), before);
    }

    #[tokio::test(start_paused = true)]
    async fn incremental_fetches_only_new_messages() {
        let (_tmp, remote, cache, controller) =
            setup(FakeRemote::with_messages(4, "orders@shop.com"), options());
        let p = pattern();
        controller.sync(&p, 0, SyncMode::Incremental).await.unwrap();

        remote.push_front(raw_message("new1", "orders@shop.com", "New", "fresh", 1_800_000_000_000));
        let report = controller.sync(&p, 0, SyncMode::Incremental).await.unwrap();
        assert_eq!(report.fetched, vec!["new1"]);
        assert_eq!(report.skipped.len(), 4);
        assert_eq!(report.watermark, Some(1_800_000_000_000));
        assert_eq!(cache.stats(&p).unwrap().count, 5);
    }

    #[tokio::test]
    async fn listing_stops_once_max_results_is_reached() {
        let remote = FakeRemote::with_messages(1500, "orders@shop.com");
        let opts = SyncOptions {
            page_size: 500,
            ..options()
        };
        let (_tmp, remote, _cache, controller) = setup(remote, opts);

        let (ids, truncated) = controller.list_ids(None, 700, None).await.unwrap();
        assert_eq!(remote.list_count(), 2);
        assert_eq!(ids.len(), 700);
        assert_eq!(ids[699], "m699");
        assert!(!truncated);
    }

    #[tokio::test(start_paused = true)]
    async fn spillover_from_the_last_page_is_not_fetched() {
        let (_tmp, remote, _cache, controller) =
            setup(FakeRemote::with_messages(12, "orders@shop.com"), options());

        let report = controller.sync(&pattern(), 7, SyncMode::Incremental).await.unwrap();
        assert_eq!(remote.list_count(), 2);
        assert_eq!(report.listed, 7);
        assert_eq!(report.fetched.len(), 7);
        assert_eq!(remote.fetch_count(), 7);
    }

    #[tokio::test(start_paused = true)]
    async fn one_failing_id_does_not_abort_the_batch() {
        let (_tmp, remote, cache, controller) =
            setup(FakeRemote::with_messages(10, "orders@shop.com"), options());
        let p = pattern();
        // m0 is the newest message.
        remote.fail_fetch("m0", Failure::Always(RemoteError::Transient("timeout".into())));

        let report = controller.sync(&p, 0, SyncMode::Incremental).await.unwrap();
        assert_eq!(report.fetched.len(), 9);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].id, "m0");
        assert!(!report.is_complete());
        // 9 successes plus every attempt on m0.
        assert_eq!(remote.fetch_count(), 9 + 3);
        assert_eq!(report.watermark, Some(1_700_000_000_000 - 1000));
        assert!(!cache.has(&p, "m0").unwrap());

        remote.clear_failures();
        let retry = controller.sync(&p, 0, SyncMode::Incremental).await.unwrap();
        assert_eq!(retry.fetched, vec!["m0"]);
        assert_eq!(retry.skipped.len(), 9);
        assert_eq!(retry.watermark, Some(1_700_000_000_000));
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limits_are_retried() {
        let (_tmp, remote, _cache, controller) =
            setup(FakeRemote::with_messages(1, "orders@shop.com"), options());
        remote.fail_fetch("m0", Failure::Times(2, RemoteError::RateLimited("429".into())));

        let report = controller.sync(&pattern(), 0, SyncMode::Incremental).await.unwrap();
        assert_eq!(report.fetched, vec!["m0"]);
        assert_eq!(remote.fetch_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn gone_messages_leave_the_cache() {
        let (_tmp, remote, cache, controller) =
            setup(FakeRemote::with_messages(3, "orders@shop.com"), options());
        let p = pattern();
        controller.sync(&p, 0, SyncMode::Incremental).await.unwrap();
        assert!(cache.has(&p, "m1").unwrap());

        remote.fail_fetch("m1", Failure::Always(RemoteError::NotFound("m1".into())));
        let report = controller.sync(&p, 0, SyncMode::Full).await.unwrap();
        assert_eq!(report.gone, vec!["m1"]);
        assert_eq!(report.fetched.len(), 2);
        assert!(report.failed.is_empty());
        assert!(!cache.has(&p, "m1").unwrap());
        // Permanent failures are not retried.
        assert_eq!(remote.fetch_count(), 3 + 3);
    }

    #[tokio::test(start_paused = true)]
    async fn full_mode_refetches_cached_messages() {
        let (_tmp, remote, _cache, controller) =
            setup(FakeRemote::with_messages(4, "orders@shop.com"), options());
        let p = pattern();
        controller.sync(&p, 0, SyncMode::Incremental).await.unwrap();
        let report = controller.sync(&p, 0, SyncMode::Full).await.unwrap();
        assert_eq!(report.fetched.len(), 4);
        assert!(report.skipped.is_empty());
        assert_eq!(remote.fetch_count(), 8);
    }

    #[tokio::test(start_paused = true)]
    async fn force_refresh_skips_the_listing() {
        let (_tmp, remote, cache, controller) =
            setup(FakeRemote::with_messages(4, "orders@shop.com"), options());
        let p = pattern();

        let ids = vec!["m2".to_string(), "m2".to_string(), "m3".to_string()];
        let report = controller.sync(&p, 0, SyncMode::ForceRefresh(ids)).await.unwrap();
        assert_eq!(remote.list_count(), 0);
        assert_eq!(report.listed, 2);
        assert_eq!(report.fetched.len(), 2);
        assert!(cache.has(&p, "m2").unwrap());

        let bad = controller
            .sync(&p, 0, SyncMode::ForceRefresh(vec!["../etc".into()]))
            .await;
        assert!(matches!(bad, Err(SyncError::InvalidArgument(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_keeps_persisted_records() {
        let mut remote = FakeRemote::with_messages(6, "orders@shop.com");
        remote.fetch_delay = Some(Duration::from_millis(50));
        let opts = SyncOptions {
            concurrency: 1,
            deadline: Some(Duration::from_millis(120)),
            ..options()
        };
        let (_tmp, _remote, cache, controller) = setup(remote, opts);
        let p = pattern();

        let report = controller.sync(&p, 0, SyncMode::Incremental).await.unwrap();
        assert_eq!(report.fetched, vec!["m0", "m1"]);
        assert_eq!(report.cancelled, vec!["m2", "m3", "m4", "m5"]);
        assert_eq!(report.watermark, Some(1_700_000_000_000));
        assert_eq!(cache.stats(&p).unwrap().count, 2);
        let state = cache.open(&p).unwrap().sync_state().unwrap();
        assert_eq!(state.watermark, Some(1_700_000_000_000));
    }

    #[tokio::test(start_paused = true)]
    async fn listing_failures() {
        let (_tmp, remote, _cache, controller) =
            setup(FakeRemote::with_messages(12, "orders@shop.com"), options());
        let p = pattern();

        remote.fail_list_from_page(0);
        assert!(matches!(
            controller.sync(&p, 0, SyncMode::Incremental).await,
            Err(SyncError::Listing(_))
        ));

        let (_tmp, remote, _cache, controller) =
            setup(FakeRemote::with_messages(12, "orders@shop.com"), options());
        remote.fail_list_from_page(1);
        let report = controller.sync(&p, 0, SyncMode::Incremental).await.unwrap();
        assert!(report.listing_truncated);
        assert_eq!(report.listed, 5);
        assert_eq!(report.fetched.len(), 5);
        assert!(!report.is_complete());
    }

    #[tokio::test(start_paused = true)]
    async fn store_during_a_sync_survives_the_run() {
        let mut remote = FakeRemote::with_messages(4, "orders@shop.com");
        remote.fetch_delay = Some(Duration::from_millis(50));
        let opts = SyncOptions {
            concurrency: 1,
            ..options()
        };
        let (_tmp, _remote, cache, controller) = setup(remote, opts);
        let p = pattern();

        let extra = mime::parse_message(
            &raw_message("x", "orders@shop.com", "Local", "stored by hand", 5),
            &ReplyRules::default(),
        );
        let (report, stored) = tokio::join!(controller.sync(&p, 0, SyncMode::Incremental), async {
            tokio::time::sleep(Duration::from_millis(60)).await;
            cache.store(&p, &extra).await
        });
        assert_eq!(report.unwrap().fetched.len(), 4);
        stored.unwrap();

        assert!(cache.has(&p, "x").unwrap());
        assert_eq!(cache.stats(&p).unwrap().count, 5);
        assert!(cache.verify(&p).unwrap().is_consistent());
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_runs_on_one_pattern_serialize() {
        let (_tmp, remote, _cache, controller) =
            setup(FakeRemote::with_messages(6, "orders@shop.com"), options());
        let p = pattern();

        let (a, b) = tokio::join!(
            controller.sync(&p, 0, SyncMode::Incremental),
            controller.sync(&p, 0, SyncMode::Incremental)
        );
        let (a, b) = (a.unwrap(), b.unwrap());
        assert_eq!(a.fetched.len() + b.fetched.len(), 6);
        assert_eq!(a.skipped.len() + b.skipped.len(), 6);
        assert_eq!(remote.fetch_count(), 6);
    }
}

use crate::config::{ConfigStore, CrawlerConfig};
use crate::document::{DocumentBuilder, epoch_ms_now};
use crate::error::Result;
use crate::extract::ContentExtractor;
use crate::index::IndexGateway;
use crate::patterns::PatternSet;
use crate::pool::{TaskLatch, WorkerPool};
use crate::reconcile;
use crate::stats::CrawlStats;
use crate::types::{CrawlMode, CrawlState, ProgressSnapshot};
use crate::watcher::IndexWatcher;
use ahash::AHashSet;
use ignore::WalkBuilder;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

const WORK_QUEUE_CAPACITY: usize = 10_000;
const COORDINATOR_JOIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Lifecycle of the orchestrator. All transitions run through the state
/// mutex so the variant and the `crawling`/pause flags stay coherent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrawlerState {
    Idle,
    Crawling,
    Paused,
    Watching,
}

pub type ProgressHook = Box<dyn Fn(&ProgressSnapshot) + Send + Sync>;

/// What happened to a single file pushed through the indexing pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FileOutcome {
    Indexed,
    /// Empty after normalization (or zero bytes on disk); any previously
    /// indexed entry for the path was removed.
    Removed,
}

/// Extract, normalize, build and upsert one file. Empty files turn into a
/// delete so stale content never lingers.
pub(crate) fn apply_file(
    gateway: &IndexGateway,
    extractor: &dyn ContentExtractor,
    builder: &DocumentBuilder,
    path: &Path,
) -> Result<FileOutcome> {
    let size = std::fs::metadata(path)?.len();
    if size == 0 {
        gateway.delete(&path.to_string_lossy())?;
        return Ok(FileOutcome::Removed);
    }

    let extracted = extractor.extract(path)?;
    let doc = builder.build(path, &extracted);
    if doc.content.is_empty() {
        gateway.delete(&doc.path)?;
        return Ok(FileOutcome::Removed);
    }

    gateway.upsert(&doc)?;
    Ok(FileOutcome::Indexed)
}

struct OrchestratorInner {
    config: CrawlerConfig,
    store: Arc<ConfigStore>,
    gateway: Arc<IndexGateway>,
    extractor: Arc<dyn ContentExtractor>,
    builder: DocumentBuilder,
    patterns: Arc<PatternSet>,
    stats: Arc<CrawlStats>,
    state: Mutex<CrawlerState>,
    crawling: AtomicBool,
    shutting_down: AtomicBool,
    pause: (Mutex<bool>, Condvar),
    watcher: Mutex<Option<IndexWatcher>>,
    progress_hook: Mutex<Option<ProgressHook>>,
}

/// Drives crawls end to end: mode selection, reconciliation, the bounded
/// worker fan-out, periodic commits, state persistence and the handover to
/// the filesystem watcher.
pub struct CrawlOrchestrator {
    inner: Arc<OrchestratorInner>,
    coordinator: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl CrawlOrchestrator {
    pub fn new(
        config: CrawlerConfig,
        store: Arc<ConfigStore>,
        gateway: Arc<IndexGateway>,
        extractor: Arc<dyn ContentExtractor>,
    ) -> Result<Self> {
        let patterns = Arc::new(PatternSet::new(
            &config.include_patterns,
            &config.exclude_patterns,
        )?);

        Ok(Self {
            inner: Arc::new(OrchestratorInner {
                config,
                store,
                gateway,
                extractor,
                builder: DocumentBuilder,
                patterns,
                stats: Arc::new(CrawlStats::default()),
                state: Mutex::new(CrawlerState::Idle),
                crawling: AtomicBool::new(false),
                shutting_down: AtomicBool::new(false),
                pause: (Mutex::new(false), Condvar::new()),
                watcher: Mutex::new(None),
                progress_hook: Mutex::new(None),
            }),
            coordinator: Mutex::new(None),
        })
    }

    pub fn state(&self) -> CrawlerState {
        self.inner
            .state
            .lock()
            .map(|s| *s)
            .unwrap_or(CrawlerState::Idle)
    }

    pub fn stats(&self) -> Arc<CrawlStats> {
        Arc::clone(&self.inner.stats)
    }

    pub fn gateway(&self) -> Arc<IndexGateway> {
        Arc::clone(&self.inner.gateway)
    }

    pub fn set_progress_hook(&self, hook: impl Fn(&ProgressSnapshot) + Send + Sync + 'static) {
        if let Ok(mut guard) = self.inner.progress_hook.lock() {
            *guard = Some(Box::new(hook));
        }
    }

    /// Start a crawl if `crawl_on_startup` is configured.
    pub fn bootstrap(&self) {
        if self.inner.config.crawl_on_startup {
            self.start_crawl(false);
        }
    }

    /// Kick off a crawl in the background. Returns false (with a warning)
    /// when no directories are configured or a crawl is already running.
    pub fn start_crawl(&self, full_reindex: bool) -> bool {
        let dirs = self.inner.store.directories();
        if dirs.is_empty() {
            warn!("no directories configured, nothing to crawl");
            return false;
        }

        if self
            .inner
            .crawling
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            warn!("crawl already in progress, ignoring start request");
            return false;
        }

        // leaving WATCHING: live updates stop while the crawl rebuilds
        self.inner.stop_watcher();
        self.inner.set_state(CrawlerState::Crawling);

        let inner = Arc::clone(&self.inner);
        let handle = std::thread::Builder::new()
            .name("sift-crawl-coordinator".to_string())
            .spawn(move || run_crawl(inner, full_reindex, dirs));

        match handle {
            Ok(h) => {
                if let Ok(mut guard) = self.coordinator.lock() {
                    // reap a previous, already-finished coordinator
                    if let Some(prev) = guard.take()
                        && prev.is_finished()
                    {
                        let _ = prev.join();
                    }
                    *guard = Some(h);
                }
                true
            }
            Err(e) => {
                error!(error = %e, "failed to spawn crawl coordinator");
                self.inner.set_state(CrawlerState::Idle);
                self.inner.crawling.store(false, Ordering::SeqCst);
                false
            }
        }
    }

    /// Cooperative pause: no new files start, in-flight files complete.
    pub fn pause(&self) -> bool {
        let Ok(mut state) = self.inner.state.lock() else {
            return false;
        };
        if *state != CrawlerState::Crawling {
            warn!(?state, "pause requested outside of a running crawl");
            return false;
        }
        if let Ok(mut paused) = self.inner.pause.0.lock() {
            *paused = true;
        }
        *state = CrawlerState::Paused;
        info!("crawl paused");
        true
    }

    pub fn resume(&self) -> bool {
        let Ok(mut state) = self.inner.state.lock() else {
            return false;
        };
        if *state != CrawlerState::Paused {
            warn!(?state, "resume requested but crawl is not paused");
            return false;
        }
        if let Ok(mut paused) = self.inner.pause.0.lock() {
            *paused = false;
        }
        self.inner.pause.1.notify_all();
        *state = CrawlerState::Crawling;
        info!("crawl resumed");
        true
    }

    /// Stop watchers, let in-flight work drain and return to IDLE. Safe to
    /// call more than once.
    pub fn shutdown(&self) {
        info!("orchestrator shutting down");
        self.inner.shutting_down.store(true, Ordering::SeqCst);
        self.inner.stop_watcher();

        // unblock any worker parked on the pause gate
        if let Ok(mut paused) = self.inner.pause.0.lock() {
            *paused = false;
        }
        self.inner.pause.1.notify_all();

        if let Ok(mut guard) = self.coordinator.lock()
            && let Some(handle) = guard.take()
        {
            let deadline = Instant::now() + COORDINATOR_JOIN_TIMEOUT;
            while !handle.is_finished() && Instant::now() < deadline {
                std::thread::sleep(Duration::from_millis(50));
            }
            if handle.is_finished() {
                let _ = handle.join();
            } else {
                error!("crawl coordinator did not stop in time, detaching");
            }
        }

        self.inner.set_state(CrawlerState::Idle);
        self.inner.crawling.store(false, Ordering::SeqCst);
    }
}

impl Drop for CrawlOrchestrator {
    fn drop(&mut self) {
        if !self.inner.shutting_down.load(Ordering::SeqCst) {
            self.shutdown();
        }
    }
}

impl OrchestratorInner {
    fn set_state(&self, next: CrawlerState) {
        if let Ok(mut state) = self.state.lock() {
            debug!(from = ?*state, to = ?next, "state transition");
            *state = next;
        }
    }

    fn stop_watcher(&self) {
        if let Ok(mut guard) = self.watcher.lock()
            && let Some(watcher) = guard.take()
        {
            watcher.stop();
        }
    }

    /// Block while the crawl is paused. Returns false when shutting down,
    /// in which case the caller skips its work entirely.
    fn wait_if_paused(&self) -> bool {
        let (lock, cv) = &self.pause;
        let Ok(mut paused) = lock.lock() else {
            return true;
        };
        while *paused {
            if self.shutting_down.load(Ordering::Relaxed) {
                return false;
            }
            match cv.wait_timeout(paused, Duration::from_millis(100)) {
                Ok((guard, _)) => paused = guard,
                Err(_) => return true,
            }
        }
        !self.shutting_down.load(Ordering::Relaxed)
    }

    fn emit_progress(&self) {
        let Ok(guard) = self.progress_hook.lock() else {
            return;
        };
        if let Some(hook) = guard.as_ref() {
            let snapshot = self.stats.snapshot();
            if catch_unwind(AssertUnwindSafe(|| hook(&snapshot))).is_err() {
                error!("progress hook panicked");
            }
        }
    }

    /// Terminal bookkeeping shared by all crawl exits. The state variant
    /// and the `crawling` flag flip inside one guarded section so an
    /// observer never sees IDLE/WATCHING while the flag still blocks the
    /// next crawl.
    fn finish(&self, allow_watch: bool) {
        if let Ok(mut paused) = self.pause.0.lock() {
            *paused = false;
        }

        let watch = allow_watch
            && self.config.watch_enabled
            && !self.shutting_down.load(Ordering::SeqCst);

        let mut next_state = CrawlerState::Idle;
        if watch {
            let dirs = self.store.directories();
            match IndexWatcher::start(
                &dirs,
                Arc::clone(&self.gateway),
                Arc::clone(&self.extractor),
                self.builder.clone(),
                Arc::clone(&self.patterns),
                Duration::from_millis(self.config.watch_debounce_ms),
            ) {
                Ok(watcher) => {
                    if let Ok(mut guard) = self.watcher.lock() {
                        *guard = Some(watcher);
                    }
                    next_state = CrawlerState::Watching;
                }
                Err(e) => {
                    error!(error = %e, "failed to start filesystem watchers");
                }
            }
        }

        match self.state.lock() {
            Ok(mut state) => {
                debug!(from = ?*state, to = ?next_state, "state transition");
                *state = next_state;
                self.crawling.store(false, Ordering::SeqCst);
            }
            Err(_) => {
                self.crawling.store(false, Ordering::SeqCst);
            }
        }
    }
}

fn run_crawl(inner: Arc<OrchestratorInner>, full_reindex: bool, dirs: Vec<PathBuf>) {
    let started = Instant::now();
    let schema_upgrade = inner.gateway.schema_upgrade_required();
    if schema_upgrade {
        info!("schema upgrade pending, forcing full crawl");
    }

    let use_incremental =
        !full_reindex && !schema_upgrade && inner.config.reconciliation_enabled;

    let mut filter: Option<AHashSet<PathBuf>> = None;
    let mut orphans_deleted = 0u64;
    let mut effective_full = !use_incremental;

    if use_incremental {
        match reconcile::reconcile(&inner.gateway, &dirs, &inner.patterns) {
            Ok(result) => {
                let deletions: Vec<String> = result
                    .to_delete
                    .iter()
                    .map(|p| p.to_string_lossy().into_owned())
                    .collect();
                match inner.gateway.bulk_delete(&deletions) {
                    Ok(()) => {
                        orphans_deleted = deletions.len() as u64;
                        filter = Some(result.changed_paths());
                    }
                    Err(e) => {
                        warn!(error = %e, "orphan deletion failed, falling back to full crawl");
                        effective_full = true;
                    }
                }
            }
            Err(e) => {
                warn!(error = %e, "reconciliation failed, falling back to full crawl");
                effective_full = true;
            }
        }
    }

    if effective_full {
        filter = None;
        if let Err(e) = inner
            .gateway
            .delete_all()
            .and_then(|_| inner.gateway.commit())
        {
            error!(error = %e, "failed to clear index for full crawl, aborting");
            inner.finish(false);
            return;
        }
    }

    let mode = if effective_full {
        CrawlMode::Full
    } else {
        CrawlMode::Incremental
    };
    inner.stats.reset(mode);
    inner.stats.record_deleted(orphans_deleted);

    let estimate = match &filter {
        Some(f) => f.len() as u64,
        // unknown up front; assume bulk so the slow refresh cadence engages
        None => inner.config.bulk_index_threshold,
    };
    inner.stats.set_total_estimate(estimate);
    info!(%mode, estimate, "crawl started");

    let original_refresh = inner.gateway.refresh_interval_ms();
    let slowed =
        inner.config.bulk_index_threshold > 0 && estimate >= inner.config.bulk_index_threshold;
    if slowed {
        inner
            .gateway
            .set_refresh_interval_ms(inner.config.slow_nrt_refresh_interval_ms);
        debug!(
            from = original_refresh,
            to = inner.config.slow_nrt_refresh_interval_ms,
            "bulk mode, refresh cadence slowed"
        );
    }

    let commit_timer = PeriodicTask::spawn(
        "sift-commit-timer",
        Duration::from_millis(inner.config.batch_timeout_ms),
        {
            let gateway = Arc::clone(&inner.gateway);
            move || {
                if let Err(e) = gateway.commit() {
                    error!(error = %e, "periodic commit failed");
                }
            }
        },
    );
    let progress_timer = PeriodicTask::spawn(
        "sift-progress",
        Duration::from_millis(inner.config.progress_notification_interval_ms),
        {
            let inner = Arc::clone(&inner);
            move || inner.emit_progress()
        },
    );

    let pool = WorkerPool::new(inner.config.thread_pool_size, WORK_QUEUE_CAPACITY);
    let latch = TaskLatch::new();
    let filter = filter.map(Arc::new);

    std::thread::scope(|scope| {
        let pool = &pool;
        for root in &dirs {
            let inner = Arc::clone(&inner);
            let latch = Arc::clone(&latch);
            let filter = filter.clone();
            let root = root.clone();
            scope.spawn(move || {
                walk_root(&inner, pool, &latch, filter.as_deref(), &root);
            });
        }
    });

    latch.wait_while(|| false);
    pool.shutdown();

    commit_timer.stop();
    progress_timer.stop();
    if slowed {
        inner.gateway.set_refresh_interval_ms(original_refresh);
    }

    match inner.gateway.commit() {
        Ok(()) => {
            if effective_full {
                inner.gateway.acknowledge_schema_upgrade();
            }
            let count = inner.gateway.document_count().unwrap_or(0);
            let crawl_state = CrawlState {
                last_completion_time_ms: epoch_ms_now(),
                last_document_count: count,
                last_crawl_mode: mode,
            };
            if let Err(e) = inner.store.save_crawl_state(&crawl_state) {
                error!(error = %e, "failed to persist crawl state");
            }
            info!(
                %mode,
                documents = count,
                processed = inner.stats.processed(),
                failed = inner.stats.failed(),
                elapsed_ms = started.elapsed().as_millis() as u64,
                "crawl complete"
            );
            inner.finish(true);
        }
        Err(e) => {
            error!(error = %e, "terminal commit failed");
            inner.finish(false);
        }
    }

    inner.emit_progress();
}

fn walk_root(
    inner: &Arc<OrchestratorInner>,
    pool: &WorkerPool,
    latch: &Arc<TaskLatch>,
    filter: Option<&AHashSet<PathBuf>>,
    root: &Path,
) {
    if !root.exists() {
        warn!(?root, "configured directory does not exist, skipping");
        return;
    }

    let walker = WalkBuilder::new(root)
        .hidden(false)
        .git_ignore(false)
        .git_global(false)
        .git_exclude(false)
        .ignore(false)
        .follow_links(false)
        .build();

    for entry in walker {
        if inner.shutting_down.load(Ordering::Relaxed) {
            debug!(?root, "walker stopping early for shutdown");
            break;
        }

        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                warn!(error = %e, "walk error, skipping entry");
                continue;
            }
        };
        if !entry.file_type().is_some_and(|ft| ft.is_file()) {
            continue;
        }

        let path = entry.into_path();
        if !inner.patterns.should_include(&path) {
            continue;
        }
        if let Some(filter) = filter
            && !filter.contains(&path)
        {
            continue;
        }

        latch.add(1);
        let inner = Arc::clone(inner);
        let latch = Arc::clone(latch);
        let root = root.to_path_buf();
        pool.submit(Box::new(move || {
            process_file(&inner, &root, &path);
            latch.done();
        }));
    }
}

fn process_file(inner: &OrchestratorInner, root: &Path, path: &Path) {
    if !inner.wait_if_paused() {
        return;
    }

    inner.stats.register_active(path);
    let outcome = apply_file(&inner.gateway, inner.extractor.as_ref(), &inner.builder, path);
    match outcome {
        Ok(FileOutcome::Indexed) => {
            inner.stats.record_processed(root);
            inner.stats.record_indexed();
        }
        Ok(FileOutcome::Removed) => {
            inner.stats.record_processed(root);
        }
        Err(e) => {
            warn!(?path, error = %e, "failed to index file");
            inner.stats.record_failed();
        }
    }
    inner.stats.unregister_active(path);
}

/// Dedicated scheduler thread firing a task at a fixed cadence. A tick that
/// fails or panics is logged and the schedule keeps firing; a silently
/// cancelled repeating task would stall commits for the whole crawl.
struct PeriodicTask {
    stop: Arc<AtomicBool>,
    handle: Option<std::thread::JoinHandle<()>>,
}

impl PeriodicTask {
    fn spawn(name: &str, interval: Duration, task: impl Fn() + Send + 'static) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);

        let handle = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let mut elapsed = Duration::ZERO;
                loop {
                    std::thread::sleep(Duration::from_millis(25));
                    if stop_flag.load(Ordering::Relaxed) {
                        break;
                    }
                    elapsed += Duration::from_millis(25);
                    if elapsed >= interval {
                        elapsed = Duration::ZERO;
                        if catch_unwind(AssertUnwindSafe(&task)).is_err() {
                            error!("periodic task panicked, schedule continues");
                        }
                    }
                }
            })
            .ok();

        if handle.is_none() {
            error!("failed to spawn periodic task thread");
        }

        Self {
            stop,
            handle,
        }
    }

    fn stop(mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extract::{ExtractorOptions, TextExtractor};
    use tempfile::TempDir;

    fn orchestrator(tmp: &TempDir, config: CrawlerConfig) -> CrawlOrchestrator {
        let store = Arc::new(ConfigStore::at(&tmp.path().join("state")));
        let gateway =
            Arc::new(IndexGateway::open(&tmp.path().join("index")).expect("index opens"));
        let extractor = Arc::new(TextExtractor::new(ExtractorOptions::default()));
        CrawlOrchestrator::new(config, store, gateway, extractor).expect("orchestrator builds")
    }

    #[test]
    fn start_without_directories_is_a_noop() {
        let tmp = TempDir::new().unwrap();
        let orch = orchestrator(&tmp, CrawlerConfig::default());
        assert!(!orch.start_crawl(false));
        assert_eq!(orch.state(), CrawlerState::Idle);
    }

    #[test]
    fn pause_outside_crawl_is_rejected() {
        let tmp = TempDir::new().unwrap();
        let orch = orchestrator(&tmp, CrawlerConfig::default());
        assert!(!orch.pause());
        assert!(!orch.resume());
        assert_eq!(orch.state(), CrawlerState::Idle);
    }

    #[test]
    fn shutdown_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let orch = orchestrator(&tmp, CrawlerConfig::default());
        orch.shutdown();
        orch.shutdown();
        assert_eq!(orch.state(), CrawlerState::Idle);
    }

    #[test]
    fn periodic_task_survives_panicking_ticks() {
        let fired = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let task = PeriodicTask::spawn("test-tick", Duration::from_millis(25), {
            let fired = Arc::clone(&fired);
            move || {
                let n = fired.fetch_add(1, Ordering::SeqCst);
                if n == 0 {
                    panic!("first tick explodes");
                }
            }
        });

        // wait for at least two ticks: the panic in the first must not
        // cancel the second
        let deadline = Instant::now() + Duration::from_secs(2);
        while fired.load(Ordering::SeqCst) < 2 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        task.stop();
        assert!(fired.load(Ordering::SeqCst) >= 2, "schedule died after panic");
    }
}

use crate::document::epoch_ms_now;
use crate::types::{CrawlMode, ProgressSnapshot};
use dashmap::DashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

/// Process-wide crawl counters. Numeric fields are atomics, the active-file
/// registry and per-directory counts are concurrent maps; everything is
/// reset at the start of each crawl.
#[derive(Debug)]
pub struct CrawlStats {
    mode: Mutex<CrawlMode>,
    processed: AtomicU64,
    indexed: AtomicU64,
    failed: AtomicU64,
    deleted: AtomicU64,
    total_estimate: AtomicU64,
    started_at_ms: AtomicU64,
    per_directory: DashMap<PathBuf, u64>,
    active: DashMap<PathBuf, i64>,
}

impl Default for CrawlStats {
    fn default() -> Self {
        Self {
            mode: Mutex::new(CrawlMode::Full),
            processed: AtomicU64::new(0),
            indexed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            deleted: AtomicU64::new(0),
            total_estimate: AtomicU64::new(0),
            started_at_ms: AtomicU64::new(0),
            per_directory: DashMap::new(),
            active: DashMap::new(),
        }
    }
}

impl CrawlStats {
    pub fn reset(&self, mode: CrawlMode) {
        if let Ok(mut m) = self.mode.lock() {
            *m = mode;
        }
        self.processed.store(0, Ordering::Relaxed);
        self.indexed.store(0, Ordering::Relaxed);
        self.failed.store(0, Ordering::Relaxed);
        self.deleted.store(0, Ordering::Relaxed);
        self.total_estimate.store(0, Ordering::Relaxed);
        self.started_at_ms
            .store(epoch_ms_now() as u64, Ordering::Relaxed);
        self.per_directory.clear();
        self.active.clear();
    }

    pub fn set_total_estimate(&self, total: u64) {
        self.total_estimate.store(total, Ordering::Relaxed);
    }

    pub fn record_processed(&self, root: &Path) {
        self.processed.fetch_add(1, Ordering::Relaxed);
        *self.per_directory.entry(root.to_path_buf()).or_insert(0) += 1;
    }

    pub fn record_indexed(&self) {
        self.indexed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_deleted(&self, count: u64) {
        self.deleted.fetch_add(count, Ordering::Relaxed);
    }

    pub fn register_active(&self, path: &Path) {
        self.active.insert(path.to_path_buf(), epoch_ms_now());
    }

    pub fn unregister_active(&self, path: &Path) {
        self.active.remove(path);
    }

    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    pub fn indexed(&self) -> u64 {
        self.indexed.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        let now = epoch_ms_now();
        let started = self.started_at_ms.load(Ordering::Relaxed);

        let mut active_files: Vec<(PathBuf, u64)> = self
            .active
            .iter()
            .map(|e| (e.key().clone(), (now - *e.value()).max(0) as u64))
            .collect();
        active_files.sort_by(|a, b| b.1.cmp(&a.1));

        let mut per_directory: Vec<(PathBuf, u64)> = self
            .per_directory
            .iter()
            .map(|e| (e.key().clone(), *e.value()))
            .collect();
        per_directory.sort();

        ProgressSnapshot {
            mode: self.mode.lock().map(|m| *m).unwrap_or(CrawlMode::Full),
            processed: self.processed.load(Ordering::Relaxed),
            indexed: self.indexed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            deleted: self.deleted.load(Ordering::Relaxed),
            total_estimate: self.total_estimate.load(Ordering::Relaxed),
            elapsed_ms: (now as u64).saturating_sub(started),
            active_files,
            per_directory,
        }
    }
}

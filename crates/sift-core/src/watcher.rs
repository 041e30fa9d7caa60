use crate::crawler::{FileOutcome, apply_file};
use crate::document::DocumentBuilder;
use crate::error::Result;
use crate::extract::ContentExtractor;
use crate::index::IndexGateway;
use crate::patterns::PatternSet;
use ahash::AHashSet;
use notify::event::{AccessKind, AccessMode};
use notify::{Config, EventKind, RecursiveMode};
use notify_debouncer_full::{DebounceEventResult, DebouncedEvent, RecommendedCache, new_debouncer_opt};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, error, info, warn};

type Debouncer = notify_debouncer_full::Debouncer<notify::RecommendedWatcher, RecommendedCache>;

/// When a single debounce window touches this many paths, something bulk is
/// going on (branch switch, restore); the flush still runs but is logged
/// loudly since the next reconciliation pass is what reconverges reliably.
const NOISY_BATCH_THRESHOLD: usize = 1024;

struct WatcherDeps {
    gateway: Arc<IndexGateway>,
    extractor: Arc<dyn ContentExtractor>,
    builder: DocumentBuilder,
    patterns: Arc<PatternSet>,
}

/// Debounced filesystem watcher keeping the index live after a crawl.
/// Events are coalesced per path inside the debounce window; one flush
/// applies the collapsed set and commits once.
pub struct IndexWatcher {
    debouncer: Arc<Mutex<Option<Debouncer>>>,
}

impl IndexWatcher {
    pub fn start(
        roots: &[PathBuf],
        gateway: Arc<IndexGateway>,
        extractor: Arc<dyn ContentExtractor>,
        builder: DocumentBuilder,
        patterns: Arc<PatternSet>,
        debounce: Duration,
    ) -> Result<Self> {
        let deps = WatcherDeps {
            gateway,
            extractor,
            builder,
            patterns,
        };

        // do not follow symlinks: link targets outside the configured roots
        // would otherwise generate events for files we never indexed
        let config = Config::default().with_follow_symlinks(false);

        let mut debouncer = new_debouncer_opt(
            debounce,
            Some(debounce / 2),
            move |result: DebounceEventResult| match result {
                Ok(events) => handle_debounced_events(&deps, events),
                Err(errors) => {
                    error!(?errors, "file watcher errors");
                }
            },
            RecommendedCache::new(),
            config,
        )?;

        for root in roots {
            if !root.exists() {
                warn!(?root, "not watching missing directory");
                continue;
            }
            // recursive registration also covers directories created later
            debouncer.watch(root.as_path(), RecursiveMode::Recursive)?;
            info!(?root, "watching for changes");
        }

        Ok(Self {
            debouncer: Arc::new(Mutex::new(Some(debouncer))),
        })
    }

    pub fn stop(&self) {
        if let Ok(Some(debouncer)) = self.debouncer.lock().map(|mut d| d.take()) {
            drop(debouncer);
            info!("filesystem watcher stopped");
        } else {
            error!("failed to stop filesystem watcher");
        }
    }
}

impl Drop for IndexWatcher {
    fn drop(&mut self) {
        if let Ok(mut guard) = self.debouncer.lock() {
            guard.take();
        }
    }
}

fn handle_debounced_events(deps: &WatcherDeps, events: Vec<DebouncedEvent>) {
    let events: Vec<notify::Event> = events.into_iter().map(|e| e.event).collect();
    let collapsed = collapse_paths(&events);
    if collapsed.is_empty() {
        return;
    }
    if collapsed.len() > NOISY_BATCH_THRESHOLD {
        warn!(
            paths = collapsed.len(),
            "very large change batch, next reconciliation will verify the result"
        );
    }

    let mut applied = 0usize;
    for path in &collapsed {
        if !path.exists() {
            // the last event for this path was (effectively) a delete
            if let Err(e) = deps.gateway.delete(&path.to_string_lossy()) {
                error!(?path, error = %e, "failed to delete document for removed file");
            } else {
                debug!(?path, "removed from index");
                applied += 1;
            }
            continue;
        }

        if !path.is_file() {
            continue;
        }
        if !deps.patterns.should_include(path) {
            continue;
        }

        match apply_file(&deps.gateway, deps.extractor.as_ref(), &deps.builder, path) {
            Ok(FileOutcome::Indexed) => {
                debug!(?path, "reindexed after change");
                applied += 1;
            }
            Ok(FileOutcome::Removed) => {
                debug!(?path, "emptied file removed from index");
                applied += 1;
            }
            Err(e) => {
                warn!(?path, error = %e, "failed to apply file change");
            }
        }
    }

    // one commit per flush regardless of how many paths changed
    if let Err(e) = deps.gateway.commit() {
        error!(error = %e, "commit after watch flush failed");
    } else {
        info!(paths = collapsed.len(), applied, "watch flush committed");
    }
}

/// Collapse raw events into at most one entry per path, keeping the order
/// of each path's final event. Access events and overflow markers carry no
/// state change and are dropped.
fn collapse_paths(events: &[notify::Event]) -> Vec<PathBuf> {
    let mut ordered: Vec<&Path> = Vec::new();

    for event in events {
        match event.kind {
            // reads and read-closes fire constantly (previews, editors
            // scanning); reacting to them would loop forever
            EventKind::Access(
                AccessKind::Read
                | AccessKind::Open(_)
                | AccessKind::Close(AccessMode::Read | AccessMode::Execute),
            ) => continue,
            EventKind::Other => {
                debug!("ignoring overflow/other event, reconciliation reconverges");
                continue;
            }
            _ => {}
        }
        for path in &event.paths {
            ordered.push(path.as_path());
        }
    }

    // keep the last occurrence of each path
    let mut seen = AHashSet::new();
    let mut collapsed: Vec<PathBuf> = ordered
        .into_iter()
        .rev()
        .filter(|p| seen.insert(p.to_path_buf()))
        .map(Path::to_path_buf)
        .collect();
    collapsed.reverse();
    collapsed
}

use sift_core::config::{ConfigStore, CrawlerConfig};
use sift_core::crawler::{CrawlOrchestrator, CrawlerState};
use sift_core::extract::{ExtractorOptions, TextExtractor};
use sift_core::index::IndexGateway;
use sift_core::types::CrawlMode;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;

struct Fixture {
    root: TempDir,
    _state_dir: TempDir,
    _index_dir: TempDir,
    store: Arc<ConfigStore>,
    gateway: Arc<IndexGateway>,
    orchestrator: CrawlOrchestrator,
}

fn fixture(config: CrawlerConfig) -> Fixture {
    let root = TempDir::new().unwrap();
    let state_dir = TempDir::new().unwrap();
    let index_dir = TempDir::new().unwrap();

    let store = Arc::new(ConfigStore::at(state_dir.path()));
    store.set_directories(&[root.path()]).unwrap();

    let gateway = Arc::new(IndexGateway::open(index_dir.path()).unwrap());
    let extractor = Arc::new(TextExtractor::new(ExtractorOptions::default()));
    let orchestrator = CrawlOrchestrator::new(
        config,
        Arc::clone(&store),
        Arc::clone(&gateway),
        extractor,
    )
    .unwrap();

    Fixture {
        root,
        _state_dir: state_dir,
        _index_dir: index_dir,
        store,
        gateway,
        orchestrator,
    }
}

fn quick_config() -> CrawlerConfig {
    CrawlerConfig {
        thread_pool_size: 2,
        batch_timeout_ms: 200,
        watch_enabled: false,
        progress_notification_interval_ms: 60_000,
        ..CrawlerConfig::default()
    }
}

fn write(root: &Path, name: &str, content: &str) -> PathBuf {
    let path = root.join(name);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    fs::write(&path, content).unwrap();
    path
}

fn wait_until(timeout: Duration, check: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(25));
    }
    check()
}

fn run_crawl(fx: &Fixture, full: bool) {
    assert!(fx.orchestrator.start_crawl(full), "crawl must start");
    assert!(
        wait_until(Duration::from_secs(30), || {
            matches!(
                fx.orchestrator.state(),
                CrawlerState::Idle | CrawlerState::Watching
            )
        }),
        "crawl did not finish in time"
    );
}

#[test]
fn first_crawl_indexes_every_matching_file() {
    let fx = fixture(quick_config());
    write(fx.root.path(), "a.txt", "alpha document");
    write(fx.root.path(), "sub/b.txt", "beta document");
    write(fx.root.path(), "c.md", "gamma document");

    run_crawl(&fx, false);

    assert_eq!(fx.gateway.document_count().unwrap(), 3);
    let snapshot = fx.gateway.snapshot_all().unwrap();
    assert!(snapshot.contains_key(&fx.root.path().join("a.txt")));
    assert!(snapshot.contains_key(&fx.root.path().join("sub/b.txt")));
}

#[test]
fn include_patterns_limit_the_crawl() {
    let config = CrawlerConfig {
        include_patterns: vec!["*.txt".to_string()],
        ..quick_config()
    };
    let fx = fixture(config);
    write(fx.root.path(), "keep.txt", "kept");
    write(fx.root.path(), "skip.md", "skipped");

    run_crawl(&fx, false);

    let snapshot = fx.gateway.snapshot_all().unwrap();
    assert_eq!(snapshot.len(), 1);
    assert!(snapshot.contains_key(&fx.root.path().join("keep.txt")));
}

#[test]
fn empty_and_whitespace_files_are_not_indexed() {
    let fx = fixture(quick_config());
    write(fx.root.path(), "real.txt", "actual content");
    write(fx.root.path(), "zero.txt", "");
    write(fx.root.path(), "blank.txt", "   \n\t  \n");

    run_crawl(&fx, false);

    let snapshot = fx.gateway.snapshot_all().unwrap();
    assert_eq!(snapshot.len(), 1);
    assert!(snapshot.contains_key(&fx.root.path().join("real.txt")));
}

#[test]
fn emptied_file_is_removed_on_recrawl() {
    let fx = fixture(quick_config());
    let path = write(fx.root.path(), "shrinks.txt", "had content once");

    run_crawl(&fx, false);
    assert_eq!(fx.gateway.document_count().unwrap(), 1);

    std::thread::sleep(Duration::from_millis(30));
    fs::write(&path, "").unwrap();
    run_crawl(&fx, false);

    assert_eq!(fx.gateway.document_count().unwrap(), 0);
}

#[test]
fn incremental_crawl_reindexes_only_the_diff() {
    let fx = fixture(quick_config());
    for i in 0..5 {
        write(fx.root.path(), &format!("doc{i}.txt"), &format!("document number {i}"));
    }

    run_crawl(&fx, false);
    assert_eq!(fx.gateway.document_count().unwrap(), 5);

    // 1 modified, 1 deleted, 2 added, 3 unchanged
    std::thread::sleep(Duration::from_millis(30));
    write(fx.root.path(), "doc0.txt", "document number zero, edited");
    fs::remove_file(fx.root.path().join("doc1.txt")).unwrap();
    write(fx.root.path(), "new-a.txt", "first addition");
    write(fx.root.path(), "new-b.txt", "second addition");

    run_crawl(&fx, false);

    // exactly the changed files went through the pipeline
    let stats = fx.orchestrator.stats();
    assert_eq!(stats.processed(), 3, "only add+update files are processed");
    assert_eq!(fx.gateway.document_count().unwrap(), 6);

    let snapshot = fx.gateway.snapshot_all().unwrap();
    assert!(!snapshot.contains_key(&fx.root.path().join("doc1.txt")));
    assert!(snapshot.contains_key(&fx.root.path().join("new-a.txt")));

    let state = fx.store.load_crawl_state().expect("crawl state persisted");
    assert_eq!(state.last_crawl_mode, CrawlMode::Incremental);
    assert_eq!(state.last_document_count, 6);
}

#[test]
fn full_reindex_records_full_mode() {
    let fx = fixture(quick_config());
    write(fx.root.path(), "a.txt", "content a");
    write(fx.root.path(), "b.txt", "content b");

    run_crawl(&fx, true);

    let state = fx.store.load_crawl_state().expect("crawl state persisted");
    assert_eq!(state.last_crawl_mode, CrawlMode::Full);
    assert_eq!(state.last_document_count, 2);

    // a second full run converges to the same set
    run_crawl(&fx, true);
    assert_eq!(fx.gateway.document_count().unwrap(), 2);
}

#[test]
fn in_sync_incremental_crawl_processes_nothing() {
    let fx = fixture(quick_config());
    write(fx.root.path(), "stable.txt", "unchanging");

    run_crawl(&fx, false);
    run_crawl(&fx, false);

    let stats = fx.orchestrator.stats();
    assert_eq!(stats.processed(), 0);
    assert_eq!(fx.gateway.document_count().unwrap(), 1);
}

#[test]
fn crawl_completion_transitions_to_watching_when_enabled() {
    let config = CrawlerConfig {
        watch_enabled: true,
        watch_debounce_ms: 150,
        ..quick_config()
    };
    let fx = fixture(config);
    write(fx.root.path(), "watched.txt", "initial content");

    run_crawl(&fx, false);
    assert_eq!(fx.orchestrator.state(), CrawlerState::Watching);

    fx.orchestrator.shutdown();
    assert_eq!(fx.orchestrator.state(), CrawlerState::Idle);
}

#[test]
fn watcher_applies_created_files_after_debounce() {
    let config = CrawlerConfig {
        watch_enabled: true,
        watch_debounce_ms: 150,
        ..quick_config()
    };
    let fx = fixture(config);
    write(fx.root.path(), "existing.txt", "already here");

    run_crawl(&fx, false);
    assert_eq!(fx.orchestrator.state(), CrawlerState::Watching);
    assert_eq!(fx.gateway.document_count().unwrap(), 1);

    write(fx.root.path(), "fresh.txt", "created while watching");
    assert!(
        wait_until(Duration::from_secs(10), || {
            fx.gateway.document_count().unwrap_or(0) == 2
        }),
        "watcher did not index the new file"
    );

    fx.orchestrator.shutdown();
}

#[test]
fn watcher_collapses_create_modify_delete_to_nothing() {
    let config = CrawlerConfig {
        watch_enabled: true,
        watch_debounce_ms: 400,
        ..quick_config()
    };
    let fx = fixture(config);
    write(fx.root.path(), "steady.txt", "steady state");

    run_crawl(&fx, false);
    assert_eq!(fx.orchestrator.state(), CrawlerState::Watching);

    // create + modify + delete inside one debounce window: the collapsed
    // application is a single delete of a never-indexed path
    let ghost = write(fx.root.path(), "ghost.txt", "blink");
    fs::write(&ghost, "blink twice").unwrap();
    fs::remove_file(&ghost).unwrap();

    // give the debouncer time to flush, then confirm nothing stuck
    std::thread::sleep(Duration::from_millis(1_200));
    assert_eq!(fx.gateway.document_count().unwrap(), 1);
    let snapshot = fx.gateway.snapshot_all().unwrap();
    assert!(!snapshot.contains_key(&ghost));

    fx.orchestrator.shutdown();
}

#[test]
fn watcher_removes_deleted_files() {
    let config = CrawlerConfig {
        watch_enabled: true,
        watch_debounce_ms: 150,
        ..quick_config()
    };
    let fx = fixture(config);
    let doomed = write(fx.root.path(), "doomed.txt", "short lived");
    write(fx.root.path(), "survivor.txt", "stays");

    run_crawl(&fx, false);
    assert_eq!(fx.gateway.document_count().unwrap(), 2);

    fs::remove_file(&doomed).unwrap();
    assert!(
        wait_until(Duration::from_secs(10), || {
            fx.gateway.document_count().unwrap_or(99) == 1
        }),
        "watcher did not remove the deleted file"
    );

    fx.orchestrator.shutdown();
}

#[test]
fn starting_a_crawl_from_watching_stops_the_watcher() {
    let config = CrawlerConfig {
        watch_enabled: true,
        watch_debounce_ms: 150,
        ..quick_config()
    };
    let fx = fixture(config);
    write(fx.root.path(), "a.txt", "content");

    run_crawl(&fx, false);
    assert_eq!(fx.orchestrator.state(), CrawlerState::Watching);

    // a new crawl takes over and ends back in WATCHING
    run_crawl(&fx, false);
    assert_eq!(fx.orchestrator.state(), CrawlerState::Watching);

    fx.orchestrator.shutdown();
}

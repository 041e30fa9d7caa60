use crate::error::Result;
use crate::index::IndexGateway;
use crate::patterns::PatternSet;
use crate::types::ReconciliationResult;
use ahash::AHashMap;
use ignore::{WalkBuilder, WalkState};
use rayon::prelude::*;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Instant, UNIX_EPOCH};
use tracing::{debug, info, warn};

/// Walk the configured roots and collect `(path, mtime-ms)` for every file
/// passing the pattern matcher. Files whose mtime cannot be read are skipped
/// with a warning.
pub fn walk_directories(dirs: &[PathBuf], patterns: &PatternSet) -> AHashMap<PathBuf, i64> {
    let mut paths: Vec<PathBuf> = Vec::new();

    for root in dirs {
        if !root.exists() {
            warn!(?root, "configured directory does not exist, skipping");
            continue;
        }

        // no gitignore semantics here: the pattern matcher is the only
        // filter deciding what belongs in the index
        let walker = WalkBuilder::new(root)
            .hidden(false)
            .git_ignore(false)
            .git_global(false)
            .git_exclude(false)
            .ignore(false)
            .follow_links(false)
            .build_parallel();

        let collected = Arc::new(Mutex::new(Vec::new()));
        walker.run(|| {
            let collected = Arc::clone(&collected);
            Box::new(move |entry| {
                if let Ok(entry) = entry
                    && entry.file_type().is_some_and(|ft| ft.is_file())
                {
                    if let Ok(mut vec) = collected.lock() {
                        vec.push(entry.into_path());
                    }
                }
                WalkState::Continue
            })
        });

        match Arc::try_unwrap(collected) {
            Ok(mutex) => match mutex.into_inner() {
                Ok(mut vec) => paths.append(&mut vec),
                Err(_) => warn!(?root, "walker result lock poisoned, skipping root"),
            },
            Err(_) => warn!(?root, "walker callbacks still hold results, skipping root"),
        }
    }

    paths.retain(|p| patterns.should_include(p));

    paths
        .par_iter()
        .filter_map(|path| match file_mtime_ms(path) {
            Some(mtime) => Some((path.clone(), mtime)),
            None => {
                warn!(?path, "could not read mtime, skipping file");
                None
            }
        })
        .collect::<Vec<_>>()
        .into_iter()
        .collect()
}

pub(crate) fn file_mtime_ms(path: &Path) -> Option<i64> {
    std::fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_millis() as i64)
}

/// Point-in-time four-way diff between the index and the filesystem.
///
/// Performs no writes; orphan deletion is applied by the orchestrator. A
/// snapshot read failure propagates so the caller can fall back to a full
/// crawl.
pub fn reconcile(
    gateway: &IndexGateway,
    dirs: &[PathBuf],
    patterns: &PatternSet,
) -> Result<ReconciliationResult> {
    let start = Instant::now();

    let indexed = gateway.snapshot_all()?;
    let disk = walk_directories(dirs, patterns);
    let mut result = compute_diff(&indexed, &disk);
    result.elapsed_ms = start.elapsed().as_millis() as u64;

    info!(
        to_delete = result.to_delete.len(),
        to_add = result.to_add.len(),
        to_update = result.to_update.len(),
        unchanged = result.unchanged,
        elapsed_ms = result.elapsed_ms,
        "reconciliation complete"
    );
    Ok(result)
}

fn compute_diff(
    indexed: &AHashMap<PathBuf, i64>,
    disk: &AHashMap<PathBuf, i64>,
) -> ReconciliationResult {
    let mut result = ReconciliationResult::default();

    for path in indexed.keys() {
        if !disk.contains_key(path) {
            result.to_delete.insert(path.clone());
        }
    }

    for (path, disk_mtime) in disk {
        match indexed.get(path) {
            None => {
                result.to_add.insert(path.clone());
            }
            Some(indexed_mtime) if disk_mtime > indexed_mtime => {
                debug!(?path, disk_mtime, indexed_mtime, "stale document");
                result.to_update.insert(path.clone());
            }
            Some(_) => result.unchanged += 1,
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn map(entries: &[(&str, i64)]) -> AHashMap<PathBuf, i64> {
        entries
            .iter()
            .map(|(p, m)| (PathBuf::from(p), *m))
            .collect()
    }

    #[test]
    fn four_way_diff() {
        // index {A:100, B:200, C:300}, disk {A:100, B:250, D:400}
        let indexed = map(&[("/d/A", 100), ("/d/B", 200), ("/d/C", 300)]);
        let disk = map(&[("/d/A", 100), ("/d/B", 250), ("/d/D", 400)]);

        let diff = compute_diff(&indexed, &disk);

        assert_eq!(diff.to_delete, [PathBuf::from("/d/C")].into_iter().collect());
        assert_eq!(diff.to_add, [PathBuf::from("/d/D")].into_iter().collect());
        assert_eq!(diff.to_update, [PathBuf::from("/d/B")].into_iter().collect());
        assert_eq!(diff.unchanged, 1);
    }

    #[test]
    fn in_sync_state_is_a_noop() {
        let indexed = map(&[("/d/A", 1), ("/d/B", 2)]);
        let disk = indexed.clone();

        let diff = compute_diff(&indexed, &disk);
        assert!(diff.is_noop());
        assert_eq!(diff.unchanged, 2);
    }

    #[test]
    fn older_disk_mtime_counts_as_unchanged() {
        // a restored backup can move mtimes backwards; that is not an update
        let indexed = map(&[("/d/A", 500)]);
        let disk = map(&[("/d/A", 400)]);

        let diff = compute_diff(&indexed, &disk);
        assert!(diff.to_update.is_empty());
        assert_eq!(diff.unchanged, 1);
    }

    #[test]
    fn walk_collects_matching_files_with_mtimes() {
        let tmp = TempDir::new().unwrap();
        fs::create_dir_all(tmp.path().join("sub")).unwrap();
        fs::write(tmp.path().join("a.txt"), "one").unwrap();
        fs::write(tmp.path().join("sub/b.txt"), "two").unwrap();
        fs::write(tmp.path().join("sub/skip.log"), "three").unwrap();

        let patterns = PatternSet::new(&["*.txt"], &[]).unwrap();
        let disk = walk_directories(&[tmp.path().to_path_buf()], &patterns);

        assert_eq!(disk.len(), 2);
        assert!(disk.contains_key(&tmp.path().join("a.txt")));
        assert!(disk.contains_key(&tmp.path().join("sub/b.txt")));
        assert!(disk.values().all(|m| *m > 0));
    }

    #[test]
    fn walk_ignores_missing_roots() {
        let tmp = TempDir::new().unwrap();
        let missing = tmp.path().join("not-there");
        let disk = walk_directories(&[missing], &PatternSet::accept_all());
        assert!(disk.is_empty());
    }

    #[test]
    fn walk_applies_exclude_patterns_on_full_paths() {
        let tmp = TempDir::new().unwrap();
        fs::create_dir_all(tmp.path().join("tmp")).unwrap();
        fs::write(tmp.path().join("keep.txt"), "x").unwrap();
        fs::write(tmp.path().join("tmp/drop.txt"), "y").unwrap();

        let patterns = PatternSet::new(&[], &["**/tmp/**"]).unwrap();
        let disk = walk_directories(&[tmp.path().to_path_buf()], &patterns);

        assert_eq!(disk.len(), 1);
        assert!(disk.contains_key(&tmp.path().join("keep.txt")));
    }
}

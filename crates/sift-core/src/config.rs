use crate::error::Result;
use crate::types::CrawlState;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, warn};

/// Environment override for the crawled directories. When set and non-empty
/// it takes precedence over `config.yaml`; writes still land in the file but
/// are not re-read while the variable is active.
pub const ENV_DIRECTORIES: &str = "LUCENE_CRAWLER_DIRECTORIES";

/// Runtime tunables of the crawler and search stack. Field names follow the
/// configuration surface of the service; `batch_size` and
/// `progress_notification_files` are accepted for backward compatibility but
/// have no effect (timer-based behaviors replaced them).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CrawlerConfig {
    pub thread_pool_size: usize,
    pub batch_size: usize,
    pub batch_timeout_ms: u64,
    pub watch_enabled: bool,
    pub watch_poll_interval_ms: u64,
    pub watch_debounce_ms: u64,
    pub bulk_index_threshold: u64,
    pub slow_nrt_refresh_interval_ms: u64,
    /// Extractor cap in characters; zero or negative means unlimited.
    pub max_content_length: i64,
    pub extract_metadata: bool,
    pub detect_language: bool,
    pub crawl_on_startup: bool,
    pub progress_notification_interval_ms: u64,
    pub progress_notification_files: u64,
    pub reconciliation_enabled: bool,
    pub max_passages: usize,
    pub max_passage_char_length: usize,
    pub include_patterns: Vec<String>,
    pub exclude_patterns: Vec<String>,
}

impl Default for CrawlerConfig {
    fn default() -> Self {
        Self {
            thread_pool_size: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            batch_size: 100,
            batch_timeout_ms: 5_000,
            watch_enabled: true,
            watch_poll_interval_ms: 2_000,
            watch_debounce_ms: 500,
            bulk_index_threshold: 1_000,
            slow_nrt_refresh_interval_ms: 5_000,
            max_content_length: -1,
            extract_metadata: true,
            detect_language: true,
            crawl_on_startup: false,
            progress_notification_interval_ms: 2_000,
            progress_notification_files: 0,
            reconciliation_enabled: true,
            max_passages: 5,
            max_passage_char_length: 200,
            include_patterns: Vec::new(),
            exclude_patterns: Vec::new(),
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    lucene: LuceneSection,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct LuceneSection {
    #[serde(default)]
    crawler: CrawlerSection,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct CrawlerSection {
    #[serde(default)]
    directories: Vec<String>,
}

/// Owner of the two persisted documents: `config.yaml` (crawl roots) and
/// `crawl-state.yaml` (last completed crawl). Each file is guarded by its
/// own mutex; reads and writes of one file are mutually exclusive.
#[derive(Debug)]
pub struct ConfigStore {
    config_path: PathBuf,
    state_path: PathBuf,
    config_lock: Mutex<()>,
    state_lock: Mutex<()>,
}

impl ConfigStore {
    /// Store rooted at `~/.sift`.
    pub fn in_home() -> Result<Self> {
        let base = dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".sift");
        Ok(Self::at(&base))
    }

    pub fn at(base: &Path) -> Self {
        Self {
            config_path: base.join("config.yaml"),
            state_path: base.join("crawl-state.yaml"),
            config_lock: Mutex::new(()),
            state_lock: Mutex::new(()),
        }
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    /// Configured crawl roots, with the environment override applied.
    pub fn directories(&self) -> Vec<PathBuf> {
        if let Some(dirs) = env_directories() {
            debug!(count = dirs.len(), "using directories from {ENV_DIRECTORIES}");
            return dirs;
        }
        self.read_config_file()
            .lucene
            .crawler
            .directories
            .into_iter()
            .map(PathBuf::from)
            .collect()
    }

    pub fn set_directories<P: AsRef<Path>>(&self, directories: &[P]) -> Result<()> {
        let _guard = self.config_lock.lock().map_err(|_| poisoned("config.yaml"))?;
        let file = ConfigFile {
            lucene: LuceneSection {
                crawler: CrawlerSection {
                    directories: directories
                        .iter()
                        .map(|p| p.as_ref().to_string_lossy().into_owned())
                        .collect(),
                },
            },
        };
        write_yaml(&self.config_path, &file)
    }

    pub fn add_directory(&self, dir: &Path) -> Result<()> {
        let mut current = self.persisted_directories();
        let dir_str = dir.to_string_lossy().into_owned();
        if !current.contains(&dir_str) {
            current.push(dir_str);
        }
        self.set_directories(&current.iter().map(PathBuf::from).collect::<Vec<_>>())
    }

    pub fn remove_directory(&self, dir: &Path) -> Result<()> {
        let dir_str = dir.to_string_lossy().into_owned();
        let current: Vec<PathBuf> = self
            .persisted_directories()
            .into_iter()
            .filter(|d| *d != dir_str)
            .map(PathBuf::from)
            .collect();
        self.set_directories(&current)
    }

    /// Directories as persisted in the file, ignoring the env override.
    fn persisted_directories(&self) -> Vec<String> {
        self.read_config_file().lucene.crawler.directories
    }

    fn read_config_file(&self) -> ConfigFile {
        let _guard = match self.config_lock.lock() {
            Ok(g) => g,
            Err(_) => {
                warn!("config.yaml lock poisoned, treating config as empty");
                return ConfigFile::default();
            }
        };
        read_yaml(&self.config_path).unwrap_or_default()
    }

    pub fn load_crawl_state(&self) -> Option<CrawlState> {
        let _guard = self.state_lock.lock().ok()?;
        read_yaml(&self.state_path)
    }

    pub fn save_crawl_state(&self, state: &CrawlState) -> Result<()> {
        let _guard = self
            .state_lock
            .lock()
            .map_err(|_| poisoned("crawl-state.yaml"))?;
        write_yaml(&self.state_path, state)
    }
}

fn env_directories() -> Option<Vec<PathBuf>> {
    let raw = std::env::var(ENV_DIRECTORIES).ok()?;
    let dirs: Vec<PathBuf> = raw
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(PathBuf::from)
        .collect();
    if dirs.is_empty() { None } else { Some(dirs) }
}

fn read_yaml<T: serde::de::DeserializeOwned>(path: &Path) -> Option<T> {
    let raw = std::fs::read_to_string(path).ok()?;
    match serde_yaml::from_str(&raw) {
        Ok(v) => Some(v),
        Err(e) => {
            warn!(?path, error = %e, "failed to parse yaml file, ignoring it");
            None
        }
    }
}

fn write_yaml<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let rendered = serde_yaml::to_string(value)?;
    std::fs::write(path, rendered)?;
    Ok(())
}

fn poisoned(which: &'static str) -> crate::Error {
    crate::Error::LockPoisoned(which)
}

#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("index engine error: {0}")]
    Index(#[from] tantivy::TantivyError),

    #[error("failed to open index at {path}: {reason}")]
    IndexOpen { path: std::path::PathBuf, reason: String },

    #[error(
        "index was written by a newer version (schema {stored}, this build supports {supported})"
    )]
    SchemaVersionAhead { stored: u32, supported: u32 },

    #[error("configuration error: {0}")]
    Config(#[from] serde_yaml::Error),

    #[error("invalid glob pattern: {0}")]
    Pattern(#[from] globset::Error),

    #[error("failed to start file system watcher: {0}")]
    Watch(#[from] notify::Error),

    #[error("{0}")]
    QueryParse(#[from] sift_query_parser::ParseError),

    #[error("{0}")]
    FilterInvalid(String),

    #[error("unknown field in query: {0}")]
    UnknownField(String),

    #[error("crawl coordinator thread panicked")]
    ThreadPanic,

    #[error("failed to acquire lock for {0}")]
    LockPoisoned(&'static str),
}

pub type Result<T> = std::result::Result<T, Error>;

use ahash::AHashSet;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// How the last crawl walked the directories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CrawlMode {
    Full,
    Incremental,
}

impl std::fmt::Display for CrawlMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CrawlMode::Full => write!(f, "full"),
            CrawlMode::Incremental => write!(f, "incremental"),
        }
    }
}

/// Persisted marker of the last successfully completed crawl
/// (`crawl-state.yaml`). Written only after the terminal commit succeeds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CrawlState {
    pub last_completion_time_ms: i64,
    pub last_document_count: u64,
    pub last_crawl_mode: CrawlMode,
}

/// Four-way diff between the indexed state and the filesystem.
#[derive(Debug, Default, Clone)]
pub struct ReconciliationResult {
    pub to_delete: AHashSet<PathBuf>,
    pub to_add: AHashSet<PathBuf>,
    pub to_update: AHashSet<PathBuf>,
    pub unchanged: usize,
    pub elapsed_ms: u64,
}

impl ReconciliationResult {
    /// Paths the crawl must push through the indexing pipeline.
    pub fn changed_paths(&self) -> AHashSet<PathBuf> {
        self.to_add.union(&self.to_update).cloned().collect()
    }

    pub fn is_noop(&self) -> bool {
        self.to_delete.is_empty() && self.to_add.is_empty() && self.to_update.is_empty()
    }
}

/// One filter predicate of a search request. `operator` is validated by the
/// executor against the target field's type; see the filter taxonomy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilterPredicate {
    pub field: String,
    pub operator: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub values: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub added_at: Option<i64>,
}

impl FilterPredicate {
    pub fn eq(field: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            operator: "eq".to_string(),
            value: Some(value.into()),
            values: None,
            from: None,
            to: None,
            added_at: None,
        }
    }

    pub fn range(
        field: impl Into<String>,
        from: Option<String>,
        to: Option<String>,
    ) -> Self {
        Self {
            field: field.into(),
            operator: "range".to_string(),
            value: None,
            values: None,
            from,
            to,
            added_at: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    Asc,
    Desc,
}

/// Sort key: `_score` (descending relevance, the default) or a numeric
/// field with an explicit direction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SortSpec {
    pub field: String,
    pub order: SortOrder,
}

#[derive(Debug, Clone, Default)]
pub struct SearchRequest {
    pub query: Option<String>,
    pub filters: Vec<FilterPredicate>,
    pub page: usize,
    pub page_size: usize,
    pub sort: Option<SortSpec>,
}

/// One highlighted passage of a hit. Offsets are byte positions into the
/// stored content; `score` is normalized so the best passage of a hit is 1.0.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Passage {
    pub text: String,
    pub start_offset: usize,
    pub score: f32,
    pub matched_terms: Vec<String>,
    pub term_coverage: f32,
    pub position: f32,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    pub path: String,
    pub file_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    pub file_type: String,
    pub file_extension: String,
    pub file_size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub modified_date: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    pub score: f32,
    pub passages: Vec<Passage>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FacetValue {
    pub value: String,
    pub count: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchResponse {
    pub total_hits: usize,
    pub documents: Vec<SearchHit>,
    /// Per-dimension value counts, computed drill-sideways: filters on the
    /// counted dimension are ignored, filters on other dimensions apply.
    pub facets: BTreeMap<String, Vec<FacetValue>>,
    pub active_filters: Vec<FilterPredicate>,
    pub elapsed_ms: u64,
}

/// Point-in-time view of a running crawl, handed to the progress hook.
#[derive(Debug, Clone)]
pub struct ProgressSnapshot {
    pub mode: CrawlMode,
    pub processed: u64,
    pub indexed: u64,
    pub failed: u64,
    pub deleted: u64,
    pub total_estimate: u64,
    pub elapsed_ms: u64,
    /// Files currently inside the extraction pipeline, with their age in ms.
    pub active_files: Vec<(PathBuf, u64)>,
    pub per_directory: Vec<(PathBuf, u64)>,
}

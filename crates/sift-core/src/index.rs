use crate::analysis::{TOKENIZER_LEMMA_DE, TOKENIZER_LEMMA_EN, TOKENIZER_STANDARD, register_tokenizers};
use crate::document::IndexedDocument;
use crate::error::{Error, Result};
use ahash::AHashMap;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tantivy::schema::{
    FAST, Facet, FacetOptions, Field, INDEXED, IndexRecordOption, STORED, STRING, Schema,
    TextFieldIndexing, TextOptions, Value,
};
use tantivy::{Index, IndexReader, IndexWriter, ReloadPolicy, TantivyDocument, Term};
use tracing::{debug, error, info, warn};

/// Version of the field layout. Bumped whenever the schema changes in a way
/// that requires re-indexing; an index stamped with a lower version forces
/// the next crawl into full mode.
pub const CURRENT_SCHEMA_VERSION: u32 = 3;

const WRITER_HEAP_BYTES: usize = 50_000_000;
const DEFAULT_REFRESH_INTERVAL_MS: u64 = 100;

#[derive(Debug, Clone, Copy)]
pub struct Fields {
    pub path: Field,
    pub file_name: Field,
    pub content: Field,
    pub content_reversed: Field,
    pub content_lemma_de: Field,
    pub content_lemma_en: Field,
    pub content_translit_de: Field,
    pub file_extension: Field,
    pub file_type: Field,
    pub file_size: Field,
    pub created_date: Field,
    pub modified_date: Field,
    pub indexed_date: Field,
    pub title: Field,
    pub author: Field,
    pub creator: Field,
    pub subject: Field,
    pub keywords: Field,
    pub language: Field,
    pub content_hash: Field,
    pub facet_extension: Field,
    pub facet_type: Field,
    pub facet_author: Field,
    pub facet_language: Field,
}

fn build_schema() -> (Schema, Fields) {
    let mut builder = Schema::builder();

    let stored_text = |tokenizer: &str| {
        TextOptions::default().set_stored().set_indexing_options(
            TextFieldIndexing::default()
                .set_tokenizer(tokenizer)
                .set_index_option(IndexRecordOption::WithFreqsAndPositions),
        )
    };
    let shadow_text = |tokenizer: &str| {
        TextOptions::default().set_indexing_options(
            TextFieldIndexing::default()
                .set_tokenizer(tokenizer)
                .set_index_option(IndexRecordOption::WithFreqsAndPositions),
        )
    };

    let fields = Fields {
        path: builder.add_text_field("path", STRING | STORED),
        file_name: builder.add_text_field("file_name", stored_text(TOKENIZER_STANDARD)),
        content: builder.add_text_field("content", stored_text(TOKENIZER_STANDARD)),
        content_reversed: builder
            .add_text_field("content_reversed", shadow_text(TOKENIZER_STANDARD)),
        content_lemma_de: builder
            .add_text_field("content_lemma_de", shadow_text(TOKENIZER_LEMMA_DE)),
        content_lemma_en: builder
            .add_text_field("content_lemma_en", shadow_text(TOKENIZER_LEMMA_EN)),
        content_translit_de: builder
            .add_text_field("content_translit_de", shadow_text(TOKENIZER_STANDARD)),
        file_extension: builder.add_text_field("file_extension", STRING | STORED),
        file_type: builder.add_text_field("file_type", STRING | STORED),
        file_size: builder.add_u64_field("file_size", INDEXED | STORED | FAST),
        created_date: builder.add_i64_field("created_date", INDEXED | STORED | FAST),
        modified_date: builder.add_i64_field("modified_date", INDEXED | STORED | FAST),
        indexed_date: builder.add_i64_field("indexed_date", INDEXED | STORED | FAST),
        title: builder.add_text_field("title", stored_text(TOKENIZER_STANDARD)),
        author: builder.add_text_field("author", stored_text(TOKENIZER_STANDARD)),
        creator: builder.add_text_field("creator", stored_text(TOKENIZER_STANDARD)),
        subject: builder.add_text_field("subject", stored_text(TOKENIZER_STANDARD)),
        keywords: builder.add_text_field("keywords", stored_text(TOKENIZER_STANDARD)),
        language: builder.add_text_field("language", STRING | STORED),
        content_hash: builder.add_text_field("content_hash", STRING | STORED),
        facet_extension: builder.add_facet_field("facet_extension", FacetOptions::default()),
        facet_type: builder.add_facet_field("facet_type", FacetOptions::default()),
        facet_author: builder.add_facet_field("facet_author", FacetOptions::default()),
        facet_language: builder.add_facet_field("facet_language", FacetOptions::default()),
    };

    (builder.build(), fields)
}

/// User metadata stored in the commit payload.
#[derive(Debug, Serialize, Deserialize)]
struct IndexUserData {
    schema_version: u32,
    software_version: String,
}

#[derive(Debug, Clone)]
pub struct IndexStats {
    pub document_count: u64,
    pub segment_count: usize,
    pub size_bytes: u64,
}

/// Transactional facade over the storage engine.
///
/// All writes funnel through the single internal writer (serializable
/// per-key: an upsert is delete-by-term plus add under one lock). Readers
/// observe a consistent point-in-time snapshot between refreshes; a
/// dedicated refresher thread reloads the reader at the configured cadence.
pub struct IndexGateway {
    dir: PathBuf,
    index: Index,
    fields: Fields,
    writer: Mutex<IndexWriter>,
    reader: IndexReader,
    refresh_interval_ms: Arc<AtomicU64>,
    upgrade_required: AtomicBool,
    stored_schema_version: u32,
    refresher_stop: Arc<AtomicBool>,
    refresher: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl IndexGateway {
    /// Open the index at `dir`, creating it when absent. Refuses to open an
    /// index stamped by a newer schema version.
    pub fn open(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let (schema, fields) = build_schema();

        let exists = dir.join("meta.json").exists();
        let index = if exists {
            Index::open_in_dir(dir)?
        } else {
            Index::create_in_dir(dir, schema)?
        };
        register_tokenizers(&index);

        let (stored_schema_version, upgrade_required) =
            read_schema_version(&index, exists)?;

        let writer = index.writer(WRITER_HEAP_BYTES)?;
        let reader = index
            .reader_builder()
            .reload_policy(ReloadPolicy::Manual)
            .try_into()?;

        let gateway = Self {
            dir: dir.to_path_buf(),
            index,
            fields,
            writer: Mutex::new(writer),
            reader,
            refresh_interval_ms: Arc::new(AtomicU64::new(DEFAULT_REFRESH_INTERVAL_MS)),
            upgrade_required: AtomicBool::new(upgrade_required),
            stored_schema_version,
            refresher_stop: Arc::new(AtomicBool::new(false)),
            refresher: Mutex::new(None),
        };
        gateway.spawn_refresher();

        info!(
            ?dir,
            stored_schema_version,
            upgrade_required,
            "index opened"
        );
        Ok(gateway)
    }

    pub fn fields(&self) -> &Fields {
        &self.fields
    }

    pub fn index(&self) -> &Index {
        &self.index
    }

    pub fn searcher(&self) -> tantivy::Searcher {
        self.reader.searcher()
    }

    /// Atomic update-or-insert keyed on `path`.
    pub fn upsert(&self, doc: &IndexedDocument) -> Result<()> {
        let writer = self.writer.lock().map_err(|_| Error::LockPoisoned("index writer"))?;
        writer.delete_term(Term::from_field_text(self.fields.path, &doc.path));
        writer.add_document(self.to_engine_doc(doc))?;
        Ok(())
    }

    /// Idempotent delete; absent paths are a no-op.
    pub fn delete(&self, path: &str) -> Result<()> {
        let writer = self.writer.lock().map_err(|_| Error::LockPoisoned("index writer"))?;
        writer.delete_term(Term::from_field_text(self.fields.path, path));
        Ok(())
    }

    pub fn bulk_delete<I, S>(&self, paths: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let writer = self.writer.lock().map_err(|_| Error::LockPoisoned("index writer"))?;
        let mut count = 0usize;
        for path in paths {
            writer.delete_term(Term::from_field_text(self.fields.path, path.as_ref()));
            count += 1;
        }
        debug!(count, "bulk delete queued");
        Ok(())
    }

    pub fn delete_all(&self) -> Result<()> {
        let writer = self.writer.lock().map_err(|_| Error::LockPoisoned("index writer"))?;
        writer.delete_all_documents()?;
        Ok(())
    }

    /// Durable checkpoint. Stamps the current schema version and software
    /// version into the engine user metadata.
    pub fn commit(&self) -> Result<()> {
        let mut writer = self.writer.lock().map_err(|_| Error::LockPoisoned("index writer"))?;
        let payload = serde_json::to_string(&IndexUserData {
            schema_version: CURRENT_SCHEMA_VERSION,
            software_version: env!("CARGO_PKG_VERSION").to_string(),
        })
        .unwrap_or_default();

        let mut prepared = writer.prepare_commit()?;
        prepared.set_payload(&payload);
        prepared.commit()?;
        Ok(())
    }

    /// Force the near-real-time reader to observe the latest commit.
    pub fn refresh(&self) -> Result<()> {
        self.reader.reload()?;
        Ok(())
    }

    /// Bulk read of `(path, modified_date)` for every live document, as of
    /// the latest commit.
    pub fn snapshot_all(&self) -> Result<AHashMap<PathBuf, i64>> {
        self.reader.reload()?;
        let searcher = self.reader.searcher();
        let mut snapshot = AHashMap::with_capacity(searcher.num_docs() as usize);

        for segment_reader in searcher.segment_readers() {
            let store = segment_reader.get_store_reader(1)?;
            for doc_id in segment_reader.doc_ids_alive() {
                let doc: TantivyDocument = store.get(doc_id)?;
                let Some(path) = doc.get_first(self.fields.path).and_then(|v| v.as_str()) else {
                    warn!(doc_id, "live document without a path field");
                    continue;
                };
                let modified = doc
                    .get_first(self.fields.modified_date)
                    .and_then(|v| v.as_i64())
                    .unwrap_or(0);
                snapshot.insert(PathBuf::from(path), modified);
            }
        }

        Ok(snapshot)
    }

    pub fn document_count(&self) -> Result<u64> {
        self.reader.reload()?;
        Ok(self.reader.searcher().num_docs())
    }

    pub fn stats(&self) -> Result<IndexStats> {
        self.reader.reload()?;
        let searcher = self.reader.searcher();
        let size_bytes = std::fs::read_dir(&self.dir)?
            .filter_map(|e| e.ok())
            .filter_map(|e| e.metadata().ok())
            .map(|m| m.len())
            .sum();
        Ok(IndexStats {
            document_count: searcher.num_docs(),
            segment_count: searcher.segment_readers().len(),
            size_bytes,
        })
    }

    pub fn set_refresh_interval_ms(&self, ms: u64) {
        self.refresh_interval_ms.store(ms.max(1), Ordering::Relaxed);
    }

    pub fn refresh_interval_ms(&self) -> u64 {
        self.refresh_interval_ms.load(Ordering::Relaxed)
    }

    pub fn schema_version(&self) -> u32 {
        self.stored_schema_version
    }

    pub fn schema_upgrade_required(&self) -> bool {
        self.upgrade_required.load(Ordering::Relaxed)
    }

    /// Called by the orchestrator once a full crawl has rewritten every
    /// document under the current schema.
    pub fn acknowledge_schema_upgrade(&self) {
        self.upgrade_required.store(false, Ordering::Relaxed);
    }

    fn spawn_refresher(&self) {
        let reader = self.reader.clone();
        let interval = Arc::clone(&self.refresh_interval_ms);
        let stop = Arc::clone(&self.refresher_stop);

        let handle = std::thread::Builder::new()
            .name("sift-nrt-refresh".to_string())
            .spawn(move || {
                let mut slept = 0u64;
                loop {
                    std::thread::sleep(Duration::from_millis(25));
                    if stop.load(Ordering::Relaxed) {
                        break;
                    }
                    slept += 25;
                    if slept >= interval.load(Ordering::Relaxed) {
                        slept = 0;
                        if let Err(e) = reader.reload() {
                            error!(error = %e, "nrt reader reload failed");
                        }
                    }
                }
            });

        match handle {
            Ok(h) => {
                if let Ok(mut guard) = self.refresher.lock() {
                    *guard = Some(h);
                }
            }
            Err(e) => error!(error = %e, "failed to spawn nrt refresher thread"),
        }
    }

    fn to_engine_doc(&self, doc: &IndexedDocument) -> TantivyDocument {
        let f = &self.fields;
        let mut t = TantivyDocument::new();

        t.add_text(f.path, &doc.path);
        t.add_text(f.file_name, &doc.file_name);
        t.add_text(f.content, &doc.content);
        t.add_text(f.content_reversed, &doc.content_reversed);
        t.add_text(f.content_lemma_de, &doc.content);
        t.add_text(f.content_lemma_en, &doc.content);
        t.add_text(f.content_translit_de, &doc.content_translit_de);
        t.add_text(f.file_extension, &doc.file_extension);
        t.add_text(f.file_type, &doc.file_type);
        t.add_u64(f.file_size, doc.file_size);
        t.add_i64(f.indexed_date, doc.indexed_date);

        if let Some(v) = doc.created_date {
            t.add_i64(f.created_date, v);
        }
        if let Some(v) = doc.modified_date {
            t.add_i64(f.modified_date, v);
        }
        for (field, value) in [
            (f.title, &doc.title),
            (f.author, &doc.author),
            (f.creator, &doc.creator),
            (f.subject, &doc.subject),
            (f.keywords, &doc.keywords),
            (f.language, &doc.language),
            (f.content_hash, &doc.content_hash),
        ] {
            if let Some(v) = value {
                t.add_text(field, v);
            }
        }

        if !doc.file_extension.is_empty() {
            t.add_facet(
                f.facet_extension,
                Facet::from_path(["ext", doc.file_extension.as_str()]),
            );
        }
        t.add_facet(f.facet_type, Facet::from_path(["type", doc.file_type.as_str()]));
        if let Some(author) = &doc.author {
            t.add_facet(f.facet_author, Facet::from_path(["author", author.as_str()]));
        }
        if let Some(lang) = &doc.language {
            t.add_facet(f.facet_language, Facet::from_path(["lang", lang.as_str()]));
        }

        t
    }
}

impl Drop for IndexGateway {
    fn drop(&mut self) {
        self.refresher_stop.store(true, Ordering::Relaxed);
        if let Ok(mut guard) = self.refresher.lock()
            && let Some(handle) = guard.take()
        {
            let _ = handle.join();
        }
    }
}

/// Read the stored schema version from the commit payload. Returns the
/// stored version and whether an upgrade (full re-crawl) is required.
fn read_schema_version(index: &Index, existed: bool) -> Result<(u32, bool)> {
    let payload = index.load_metas()?.payload;

    match payload {
        Some(raw) => {
            let user_data: IndexUserData = serde_json::from_str(&raw).map_err(|e| {
                Error::IndexOpen {
                    path: PathBuf::new(),
                    reason: format!("unreadable user metadata: {e}"),
                }
            })?;
            match user_data.schema_version {
                v if v > CURRENT_SCHEMA_VERSION => Err(Error::SchemaVersionAhead {
                    stored: v,
                    supported: CURRENT_SCHEMA_VERSION,
                }),
                v if v < CURRENT_SCHEMA_VERSION => {
                    warn!(stored = v, current = CURRENT_SCHEMA_VERSION, "schema upgrade required");
                    Ok((v, true))
                }
                v => Ok((v, false)),
            }
        }
        // a pre-versioning legacy index has commits but no payload
        None if existed => Ok((0, true)),
        None => Ok((CURRENT_SCHEMA_VERSION, false)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::DocumentBuilder;
    use crate::extract::ExtractedDocument;
    use std::fs;
    use tempfile::TempDir;

    fn doc_for(tmp: &TempDir, name: &str, content: &str) -> IndexedDocument {
        let path = tmp.path().join(name);
        fs::write(&path, content).unwrap();
        let extracted = ExtractedDocument {
            content: content.to_string(),
            file_type: "text/plain".to_string(),
            file_size: content.len() as u64,
            ..Default::default()
        };
        DocumentBuilder.build(&path, &extracted)
    }

    #[test]
    fn upsert_then_snapshot_contains_path_and_mtime() {
        let tmp = TempDir::new().unwrap();
        let index_dir = TempDir::new().unwrap();
        let gateway = IndexGateway::open(index_dir.path()).unwrap();

        let doc = doc_for(&tmp, "a.txt", "alpha body");
        gateway.upsert(&doc).unwrap();
        gateway.commit().unwrap();

        let snapshot = gateway.snapshot_all().unwrap();
        assert_eq!(snapshot.len(), 1);
        let mtime = snapshot[&PathBuf::from(&doc.path)];
        assert_eq!(Some(mtime), doc.modified_date);
    }

    #[test]
    fn upsert_is_keyed_on_path() {
        let tmp = TempDir::new().unwrap();
        let index_dir = TempDir::new().unwrap();
        let gateway = IndexGateway::open(index_dir.path()).unwrap();

        let doc = doc_for(&tmp, "a.txt", "first version");
        gateway.upsert(&doc).unwrap();
        gateway.upsert(&doc_for(&tmp, "a.txt", "second version")).unwrap();
        gateway.commit().unwrap();

        assert_eq!(gateway.document_count().unwrap(), 1);
    }

    #[test]
    fn delete_absent_path_is_noop() {
        let index_dir = TempDir::new().unwrap();
        let gateway = IndexGateway::open(index_dir.path()).unwrap();
        gateway.delete("/never/indexed.txt").unwrap();
        gateway.commit().unwrap();
        assert_eq!(gateway.document_count().unwrap(), 0);
    }

    #[test]
    fn bulk_delete_removes_only_named_paths() {
        let tmp = TempDir::new().unwrap();
        let index_dir = TempDir::new().unwrap();
        let gateway = IndexGateway::open(index_dir.path()).unwrap();

        let a = doc_for(&tmp, "a.txt", "keep me");
        let b = doc_for(&tmp, "b.txt", "drop me");
        let c = doc_for(&tmp, "c.txt", "drop me too");
        for d in [&a, &b, &c] {
            gateway.upsert(d).unwrap();
        }
        gateway.commit().unwrap();

        gateway.bulk_delete([&b.path, &c.path]).unwrap();
        gateway.commit().unwrap();

        let snapshot = gateway.snapshot_all().unwrap();
        assert_eq!(snapshot.len(), 1);
        assert!(snapshot.contains_key(&PathBuf::from(&a.path)));
    }

    #[test]
    fn fresh_index_is_current_schema() {
        let index_dir = TempDir::new().unwrap();
        let gateway = IndexGateway::open(index_dir.path()).unwrap();
        assert_eq!(gateway.schema_version(), CURRENT_SCHEMA_VERSION);
        assert!(!gateway.schema_upgrade_required());
    }

    #[test]
    fn reopened_index_reads_version_from_payload() {
        let tmp = TempDir::new().unwrap();
        let index_dir = TempDir::new().unwrap();

        {
            let gateway = IndexGateway::open(index_dir.path()).unwrap();
            gateway.upsert(&doc_for(&tmp, "a.txt", "persisted")).unwrap();
            gateway.commit().unwrap();
        }

        let reopened = IndexGateway::open(index_dir.path()).unwrap();
        assert_eq!(reopened.schema_version(), CURRENT_SCHEMA_VERSION);
        assert!(!reopened.schema_upgrade_required());
        assert_eq!(reopened.document_count().unwrap(), 1);
    }

    #[test]
    fn refresh_interval_is_tunable() {
        let index_dir = TempDir::new().unwrap();
        let gateway = IndexGateway::open(index_dir.path()).unwrap();
        assert_eq!(gateway.refresh_interval_ms(), DEFAULT_REFRESH_INTERVAL_MS);
        gateway.set_refresh_interval_ms(5_000);
        assert_eq!(gateway.refresh_interval_ms(), 5_000);
    }

    #[test]
    fn delete_all_empties_the_index() {
        let tmp = TempDir::new().unwrap();
        let index_dir = TempDir::new().unwrap();
        let gateway = IndexGateway::open(index_dir.path()).unwrap();

        gateway.upsert(&doc_for(&tmp, "a.txt", "one")).unwrap();
        gateway.upsert(&doc_for(&tmp, "b.txt", "two")).unwrap();
        gateway.commit().unwrap();
        assert_eq!(gateway.document_count().unwrap(), 2);

        gateway.delete_all().unwrap();
        gateway.commit().unwrap();
        assert_eq!(gateway.document_count().unwrap(), 0);
    }
}

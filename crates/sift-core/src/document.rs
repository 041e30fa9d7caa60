use crate::analysis::word_tokens;
use crate::extract::ExtractedDocument;
use crate::normalize::normalize;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::warn;

/// The typed field set written to the index for one file. The lemma shadow
/// fields are not materialized here; they are the same `content` string run
/// through the language tokenizer pipelines at write time.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexedDocument {
    pub path: String,
    pub file_name: String,
    /// Normalized content.
    pub content: String,
    /// Content with every token's characters reversed, for leading-wildcard
    /// queries.
    pub content_reversed: String,
    /// Content with German digraphs substituted (ae→ä, oe→ö, ue→ü) so that
    /// after folding both spellings land on the same terms.
    pub content_translit_de: String,
    pub file_extension: String,
    pub file_type: String,
    pub file_size: u64,
    pub created_date: Option<i64>,
    pub modified_date: Option<i64>,
    pub indexed_date: i64,
    pub title: Option<String>,
    pub author: Option<String>,
    pub creator: Option<String>,
    pub subject: Option<String>,
    pub keywords: Option<String>,
    pub language: Option<String>,
    /// SHA-256 of the normalized content; absent when content is empty.
    pub content_hash: Option<String>,
}

/// Metadata key priority chains; the first key with a non-empty value wins.
const TITLE_KEYS: &[&str] = &["dc:title", "title", "Title"];
const AUTHOR_KEYS: &[&str] = &["dc:creator", "meta:author", "Author", "author"];
const CREATOR_KEYS: &[&str] = &["xmp:CreatorTool", "creator", "Creator"];
const SUBJECT_KEYS: &[&str] = &["dc:subject", "subject", "Subject"];
const KEYWORD_KEYS: &[&str] = &["meta:keyword", "Keywords", "keywords"];

/// Deterministic transformation of (path, extracted) into the indexable
/// field set. Normalization happens here so every derived field is
/// guaranteed to come from the same cleaned string.
#[derive(Debug, Default, Clone)]
pub struct DocumentBuilder;

impl DocumentBuilder {
    pub fn build(&self, path: &Path, extracted: &ExtractedDocument) -> IndexedDocument {
        let content = normalize(&extracted.content);

        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        let file_extension = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_lowercase)
            .filter(|e| !e.is_empty())
            .unwrap_or_default();

        let (created_date, modified_date) = file_timestamps(path);

        let content_hash = if content.is_empty() {
            None
        } else {
            let mut hasher = Sha256::new();
            hasher.update(content.as_bytes());
            Some(format!("{:x}", hasher.finalize()))
        };

        IndexedDocument {
            path: path.to_string_lossy().into_owned(),
            file_name,
            content_reversed: reverse_tokens(&content),
            content_translit_de: transliterate_german(&content),
            content_hash,
            content,
            file_extension,
            file_type: extracted.file_type.clone(),
            file_size: extracted.file_size,
            created_date,
            modified_date,
            indexed_date: epoch_ms_now(),
            title: pick_metadata(&extracted.metadata, TITLE_KEYS),
            author: pick_metadata(&extracted.metadata, AUTHOR_KEYS),
            creator: pick_metadata(&extracted.metadata, CREATOR_KEYS),
            subject: pick_metadata(&extracted.metadata, SUBJECT_KEYS),
            keywords: pick_metadata(&extracted.metadata, KEYWORD_KEYS),
            language: extracted.language.clone(),
        }
    }
}

fn pick_metadata(metadata: &HashMap<String, String>, keys: &[&str]) -> Option<String> {
    keys.iter()
        .filter_map(|k| metadata.get(*k))
        .map(|v| v.trim())
        .find(|v| !v.is_empty())
        .map(str::to_string)
}

/// (created, modified) as epoch milliseconds. A metadata failure leaves both
/// absent; the document is still indexed.
fn file_timestamps(path: &Path) -> (Option<i64>, Option<i64>) {
    match std::fs::metadata(path) {
        Ok(meta) => (
            meta.created().ok().and_then(to_epoch_ms),
            meta.modified().ok().and_then(to_epoch_ms),
        ),
        Err(e) => {
            warn!(?path, error = %e, "failed to read file timestamps");
            (None, None)
        }
    }
}

fn to_epoch_ms(t: SystemTime) -> Option<i64> {
    t.duration_since(UNIX_EPOCH).ok().map(|d| d.as_millis() as i64)
}

pub(crate) fn epoch_ms_now() -> i64 {
    to_epoch_ms(SystemTime::now()).unwrap_or(0)
}

/// Per-token character reversal, lowercased: "Mietvertrag läuft" becomes
/// "gartrevteim tfuäl". Non-token characters collapse to single spaces.
fn reverse_tokens(content: &str) -> String {
    let mut out = String::with_capacity(content.len());
    for token in word_tokens(content) {
        if !out.is_empty() {
            out.push(' ');
        }
        out.extend(token.to_lowercase().chars().rev());
    }
    out
}

/// Substitute the German umlaut digraphs so "Haendel" and "Händel" index
/// identically once folding runs. 'ue' is left alone after 'q' (Quelle).
pub(crate) fn transliterate_german(content: &str) -> String {
    let chars: Vec<char> = content.chars().collect();
    let mut out = String::with_capacity(content.len());
    let mut i = 0usize;

    while i < chars.len() {
        let c = chars[i];
        let next_is_e = matches!(chars.get(i + 1), Some('e') | Some('E'));
        let prev = if i == 0 { None } else { Some(chars[i - 1]) };

        let substituted = match c {
            'a' if next_is_e => Some('ä'),
            'A' if next_is_e => Some('Ä'),
            'o' if next_is_e => Some('ö'),
            'O' if next_is_e => Some('Ö'),
            'u' | 'U' if next_is_e && !matches!(prev, Some('q') | Some('Q')) => {
                Some(if c == 'u' { 'ü' } else { 'Ü' })
            }
            _ => None,
        };

        match substituted {
            Some(umlaut) => {
                out.push(umlaut);
                i += 2;
            }
            None => {
                out.push(c);
                i += 1;
            }
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extract::ExtractedDocument;
    use std::fs;
    use tempfile::TempDir;

    fn extracted(content: &str) -> ExtractedDocument {
        ExtractedDocument {
            content: content.to_string(),
            file_type: "text/plain".to_string(),
            file_size: content.len() as u64,
            ..Default::default()
        }
    }

    fn build_at(tmp: &TempDir, name: &str, content: &str) -> IndexedDocument {
        let path = tmp.path().join(name);
        fs::write(&path, content).unwrap();
        DocumentBuilder.build(&path, &extracted(content))
    }

    #[test]
    fn derives_extension_and_name() {
        let tmp = TempDir::new().unwrap();
        let doc = build_at(&tmp, "Report.PDF", "text");
        assert_eq!(doc.file_name, "Report.PDF");
        assert_eq!(doc.file_extension, "pdf");

        let doc = build_at(&tmp, "no_extension", "text");
        assert_eq!(doc.file_extension, "");
    }

    #[test]
    fn metadata_priority_chain() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("meta.txt");
        fs::write(&path, "x").unwrap();

        let mut ex = extracted("x");
        ex.metadata.insert("Title".to_string(), "fallback".to_string());
        ex.metadata.insert("dc:title".to_string(), "preferred".to_string());
        ex.metadata.insert("Author".to_string(), "A. Plain".to_string());
        let doc = DocumentBuilder.build(&path, &ex);

        assert_eq!(doc.title.as_deref(), Some("preferred"));
        assert_eq!(doc.author.as_deref(), Some("A. Plain"));
        assert_eq!(doc.subject, None);
    }

    #[test]
    fn empty_metadata_values_are_skipped() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("meta.txt");
        fs::write(&path, "x").unwrap();

        let mut ex = extracted("x");
        ex.metadata.insert("dc:title".to_string(), "  ".to_string());
        ex.metadata.insert("title".to_string(), "real title".to_string());
        let doc = DocumentBuilder.build(&path, &ex);

        assert_eq!(doc.title.as_deref(), Some("real title"));
    }

    #[test]
    fn content_hash_is_stable_and_absent_for_empty() {
        let tmp = TempDir::new().unwrap();
        let a = build_at(&tmp, "a.txt", "same words");
        let b = build_at(&tmp, "b.txt", "same   words");
        let c = build_at(&tmp, "c.txt", "other words");
        let empty = build_at(&tmp, "d.txt", "   \n ");

        // normalization collapses the whitespace difference
        assert_eq!(a.content_hash, b.content_hash);
        assert_ne!(a.content_hash, c.content_hash);
        assert!(empty.content_hash.is_none());
        assert!(empty.content.is_empty());
    }

    #[test]
    fn reversed_shadow_reverses_each_token() {
        let tmp = TempDir::new().unwrap();
        let doc = build_at(&tmp, "v.txt", "Mietvertrag signed");
        assert_eq!(doc.content_reversed, "gartrevteim dengis");
    }

    #[test]
    fn german_transliteration_substitutes_digraphs() {
        assert_eq!(transliterate_german("Haendel"), "Händel");
        assert_eq!(transliterate_german("Moebel"), "Möbel");
        assert_eq!(transliterate_german("Muenchen"), "München");
        assert_eq!(transliterate_german("Uebung"), "Übung");
    }

    #[test]
    fn transliteration_keeps_ue_after_q() {
        assert_eq!(transliterate_german("Quelle"), "Quelle");
        assert_eq!(transliterate_german("quer"), "quer");
    }

    #[test]
    fn timestamps_are_millisecond_epochs() {
        let tmp = TempDir::new().unwrap();
        let doc = build_at(&tmp, "t.txt", "content");
        let modified = doc.modified_date.expect("modified must exist");
        // a fresh file's mtime is close to now and clearly in ms range
        assert!(modified > 1_000_000_000_000, "not milliseconds: {modified}");
        assert!(doc.indexed_date >= modified - 1_000);
    }

    #[test]
    fn missing_file_still_builds_without_timestamps() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("ghost.txt");
        let doc = DocumentBuilder.build(&path, &extracted("body"));
        assert_eq!(doc.created_date, None);
        assert_eq!(doc.modified_date, None);
        assert_eq!(doc.content, "body");
    }

    #[test]
    fn same_content_builds_identical_fields_except_indexed_date() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("stable.txt");
        fs::write(&path, "stable content").unwrap();

        let ex = extracted("stable content");
        let mut first = DocumentBuilder.build(&path, &ex);
        let mut second = DocumentBuilder.build(&path, &ex);
        first.indexed_date = 0;
        second.indexed_date = 0;
        assert_eq!(first, second);
    }
}

use crate::error::Result;
use std::collections::HashMap;
use std::io::{self, Read};
use std::path::Path;
use tracing::trace;

/// Raw output of a format parser, before normalization and field building.
#[derive(Debug, Clone, Default)]
pub struct ExtractedDocument {
    pub content: String,
    pub metadata: HashMap<String, String>,
    /// ISO-639-1 code, present only when detection is enabled and confident.
    pub language: Option<String>,
    /// Detected MIME type.
    pub file_type: String,
    /// Size of the source file in bytes.
    pub file_size: u64,
}

/// The document-format parsing seam. Heavyweight parsers (PDF, Office,
/// OpenDocument) plug in behind this trait; parse failures surface as
/// errors and are counted by the crawler without stopping it.
pub trait ContentExtractor: Send + Sync {
    fn extract(&self, path: &Path) -> Result<ExtractedDocument>;
}

#[derive(Debug, Clone, Copy)]
pub struct ExtractorOptions {
    /// Maximum characters of content to keep; zero or negative = unlimited.
    pub max_content_length: i64,
    pub extract_metadata: bool,
    pub detect_language: bool,
}

impl Default for ExtractorOptions {
    fn default() -> Self {
        Self {
            max_content_length: -1,
            extract_metadata: true,
            detect_language: true,
        }
    }
}

/// Extractor for plain-text and markup files. Binary payloads are rejected
/// as parse failures the same way a corrupt PDF would be.
#[derive(Debug, Clone)]
pub struct TextExtractor {
    opts: ExtractorOptions,
}

impl TextExtractor {
    pub fn new(opts: ExtractorOptions) -> Self {
        Self { opts }
    }
}

impl ContentExtractor for TextExtractor {
    fn extract(&self, path: &Path) -> Result<ExtractedDocument> {
        let meta = std::fs::metadata(path)?;
        let file_size = meta.len();

        let mut file = std::fs::File::open(path)?;
        let mut bytes = Vec::with_capacity(file_size.min(1 << 20) as usize);
        file.read_to_end(&mut bytes)?;

        // NUL in the head means binary; same heuristic git and grep use
        let head = &bytes[..bytes.len().min(512)];
        if head.contains(&0) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("binary content in {}", path.display()),
            )
            .into());
        }

        let mut content = String::from_utf8_lossy(&bytes).into_owned();
        if self.opts.max_content_length > 0 {
            content = truncate_chars(content, self.opts.max_content_length as usize);
        }

        let file_type = mime_guess::from_path(path)
            .first_or_octet_stream()
            .essence_str()
            .to_string();

        let language = if self.opts.detect_language {
            detect_language(&content)
        } else {
            None
        };

        trace!(?path, file_size, ?language, %file_type, "extracted");

        Ok(ExtractedDocument {
            content,
            // plain text carries no embedded metadata; format parsers
            // populate this for PDF/Office documents
            metadata: HashMap::new(),
            language,
            file_type,
            file_size,
        })
    }
}

fn truncate_chars(s: String, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((byte_idx, _)) => s[..byte_idx].to_string(),
        None => s,
    }
}

const GERMAN_STOPWORDS: &[&str] = &[
    "und", "der", "das", "ist", "nicht", "mit", "ein", "eine", "auf", "für", "von", "dem",
    "den", "sich", "auch", "werden", "wird", "bei", "oder", "aus", "zur", "zum", "über",
    "nach", "durch", "wenn", "aber", "sind", "haben", "wir", "ich", "als", "des", "im", "um",
];

const ENGLISH_STOPWORDS: &[&str] = &[
    "the", "and", "is", "of", "to", "that", "it", "for", "with", "was", "are", "this",
    "have", "from", "not", "but", "they", "his", "her", "you", "all", "were", "when",
    "there", "been", "their", "which", "will", "would", "what", "about", "than", "them",
];

/// Cheap stopword-frequency language identification for the two analyzer
/// languages. Returns `None` unless one language is a clear winner.
pub(crate) fn detect_language(content: &str) -> Option<String> {
    let mut de = 0usize;
    let mut en = 0usize;
    let mut total = 0usize;

    for token in content
        .split(|ch: char| !ch.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .take(2_000)
    {
        total += 1;
        let lower = token.to_lowercase();
        if GERMAN_STOPWORDS.contains(&lower.as_str()) {
            de += 1;
        } else if ENGLISH_STOPWORDS.contains(&lower.as_str()) {
            en += 1;
        }
    }

    if total < 8 {
        return None;
    }

    let (winner, hi, lo) = if de > en {
        ("de", de, en)
    } else {
        ("en", en, de)
    };

    // demand a margin, not just a majority
    if hi >= 3 && hi * 2 > lo * 3 {
        Some(winner.to_string())
    } else {
        None
    }
}

//! Tokenizer pipelines registered on the index.
//!
//! Every content shadow is the same normalized string run through a
//! different pipeline: the standard pipeline folds case and diacritics, the
//! lemma pipelines add language-specific stemming, and the reversed /
//! transliterated shadows are materialized by the document builder and then
//! go through the standard pipeline.

use tantivy::Index;
use tantivy::tokenizer::{
    AsciiFoldingFilter, Language, LowerCaser, RemoveLongFilter, SimpleTokenizer, Stemmer,
    TextAnalyzer,
};

pub const TOKENIZER_STANDARD: &str = "sift_std";
pub const TOKENIZER_LEMMA_DE: &str = "sift_lemma_de";
pub const TOKENIZER_LEMMA_EN: &str = "sift_lemma_en";

/// Longest token kept by any pipeline; longer runs are typically junk
/// (base64 blobs, minified payloads).
const MAX_TOKEN_LEN: usize = 64;

pub fn standard_analyzer() -> TextAnalyzer {
    TextAnalyzer::builder(SimpleTokenizer::default())
        .filter(RemoveLongFilter::limit(MAX_TOKEN_LEN))
        .filter(LowerCaser)
        .filter(AsciiFoldingFilter)
        .build()
}

pub fn lemma_analyzer(language: Language) -> TextAnalyzer {
    TextAnalyzer::builder(SimpleTokenizer::default())
        .filter(RemoveLongFilter::limit(MAX_TOKEN_LEN))
        .filter(LowerCaser)
        .filter(Stemmer::new(language))
        .filter(AsciiFoldingFilter)
        .build()
}

/// Register all custom pipelines on a freshly created or opened index.
pub fn register_tokenizers(index: &Index) {
    index
        .tokenizers()
        .register(TOKENIZER_STANDARD, standard_analyzer());
    index
        .tokenizers()
        .register(TOKENIZER_LEMMA_DE, lemma_analyzer(Language::German));
    index
        .tokenizers()
        .register(TOKENIZER_LEMMA_EN, lemma_analyzer(Language::English));
}

/// Run `text` through an analyzer, collecting the emitted token texts.
pub fn analyze(analyzer: &mut TextAnalyzer, text: &str) -> Vec<String> {
    let mut stream = analyzer.token_stream(text);
    let mut out = Vec::new();
    while stream.advance() {
        out.push(stream.token().text.clone());
    }
    out
}

/// Plain word segmentation shared by the shadow materialization and the
/// highlighter: maximal runs of alphanumeric characters.
pub(crate) fn word_tokens(text: &str) -> impl Iterator<Item = &str> {
    text.split(|ch: char| !ch.is_alphanumeric())
        .filter(|t| !t.is_empty())
}

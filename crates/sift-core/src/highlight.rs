use crate::analysis::{analyze, lemma_analyzer, standard_analyzer};
use crate::types::Passage;
use ahash::AHashSet;
use tantivy::tokenizer::{Language, TextAnalyzer};

/// Passage extraction over the stored content of a hit.
///
/// Matching is linguistic, not literal: a content token matches a query
/// term when their folded forms or their German/English stems coincide, so
/// passages line up with what the lemma shadow fields actually matched.
pub(crate) struct Highlighter {
    max_passages: usize,
    max_passage_chars: usize,
    query_terms: Vec<TermForms>,
    standard: TextAnalyzer,
    lemma_de: TextAnalyzer,
    lemma_en: TextAnalyzer,
}

#[derive(Debug, Clone)]
struct TermForms {
    raw: String,
    folded: Option<String>,
    stem_de: Option<String>,
    stem_en: Option<String>,
}

#[derive(Debug, Clone)]
struct TokenMatch {
    start: usize,
    end: usize,
    /// index into `query_terms`
    term: usize,
}

impl Highlighter {
    pub fn new(query_terms: &[String], max_passages: usize, max_passage_chars: usize) -> Self {
        let mut standard = standard_analyzer();
        let mut lemma_de = lemma_analyzer(Language::German);
        let mut lemma_en = lemma_analyzer(Language::English);

        let query_terms = query_terms
            .iter()
            .map(|t| TermForms {
                raw: t.clone(),
                folded: first_token(&mut standard, t),
                stem_de: first_token(&mut lemma_de, t),
                stem_en: first_token(&mut lemma_en, t),
            })
            .collect();

        Self {
            max_passages: max_passages.max(1),
            max_passage_chars: max_passage_chars.max(40),
            query_terms,
            standard,
            lemma_de,
            lemma_en,
        }
    }

    /// Extract up to `max_passages` highlighted passages. Scores are
    /// normalized so the best passage is exactly 1.0.
    pub fn passages(&mut self, content: &str) -> Vec<Passage> {
        if content.is_empty() || self.query_terms.is_empty() {
            return Vec::new();
        }

        let matches = self.find_matches(content);
        if matches.is_empty() {
            return Vec::new();
        }

        let clusters = self.cluster(content, &matches);
        let mut passages: Vec<(f32, Passage)> = clusters
            .into_iter()
            .filter_map(|cluster| self.render(content, cluster))
            .collect();

        // best first, then normalize against the top score
        passages.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        passages.truncate(self.max_passages);

        let best = passages.first().map(|(s, _)| *s).unwrap_or(1.0).max(f32::EPSILON);
        passages
            .into_iter()
            .map(|(raw_score, mut passage)| {
                passage.score = raw_score / best;
                passage
            })
            .collect()
    }

    fn find_matches(&mut self, content: &str) -> Vec<TokenMatch> {
        let mut matches = Vec::new();

        for (start, end, token) in token_spans(content) {
            let folded = first_token(&mut self.standard, token);
            let stem_de = first_token(&mut self.lemma_de, token);
            let stem_en = first_token(&mut self.lemma_en, token);

            for (i, term) in self.query_terms.iter().enumerate() {
                let hit = (term.folded.is_some() && term.folded == folded)
                    || (term.stem_de.is_some() && term.stem_de == stem_de)
                    || (term.stem_en.is_some() && term.stem_en == stem_en);
                if hit {
                    matches.push(TokenMatch { start, end, term: i });
                    break;
                }
            }
        }

        matches
    }

    /// Greedy left-to-right clustering: a passage window opens a little
    /// before its first match and swallows every match that still fits.
    fn cluster(&self, content: &str, matches: &[TokenMatch]) -> Vec<Vec<TokenMatch>> {
        let mut clusters: Vec<Vec<TokenMatch>> = Vec::new();
        let mut current: Vec<TokenMatch> = Vec::new();
        let mut window_end = 0usize;

        for m in matches {
            if current.is_empty() {
                let lead = self.max_passage_chars / 4;
                let window_start = floor_char_boundary(content, m.start.saturating_sub(lead));
                window_end = ceil_char_boundary(
                    content,
                    (window_start + self.max_passage_chars).min(content.len()),
                );
                current.push(m.clone());
                continue;
            }

            if m.end <= window_end {
                current.push(m.clone());
            } else {
                clusters.push(std::mem::take(&mut current));
                let lead = self.max_passage_chars / 4;
                let window_start = floor_char_boundary(content, m.start.saturating_sub(lead));
                window_end = ceil_char_boundary(
                    content,
                    (window_start + self.max_passage_chars).min(content.len()),
                );
                current.push(m.clone());
            }
        }
        if !current.is_empty() {
            clusters.push(current);
        }

        clusters
    }

    fn render(&self, content: &str, cluster: Vec<TokenMatch>) -> Option<(f32, Passage)> {
        let first = cluster.first()?;
        let last = cluster.last()?;

        let lead = self.max_passage_chars / 4;
        let start = floor_char_boundary(content, first.start.saturating_sub(lead));
        let desired_end = (start + self.max_passage_chars).max(last.end);
        let end = ceil_char_boundary(content, desired_end.min(content.len()));

        let mut text = String::with_capacity((end - start) + cluster.len() * 9);
        let mut cursor = start;
        for m in &cluster {
            text.push_str(&content[cursor..m.start]);
            text.push_str("<em>");
            text.push_str(&content[m.start..m.end]);
            text.push_str("</em>");
            cursor = m.end;
        }
        text.push_str(&content[cursor..end]);

        let unique: AHashSet<usize> = cluster.iter().map(|m| m.term).collect();
        let matched_terms: Vec<String> = unique
            .iter()
            .map(|i| self.query_terms[*i].raw.clone())
            .collect();
        let term_coverage = unique.len() as f32 / self.query_terms.len() as f32;

        // density plus diversity: unique terms weigh double
        let raw_score = unique.len() as f32 * 2.0 + cluster.len() as f32;
        let position = start as f32 / content.len().max(1) as f32;

        Some((
            raw_score,
            Passage {
                text,
                start_offset: start,
                score: 0.0,
                matched_terms,
                term_coverage,
                position,
            },
        ))
    }
}

fn first_token(analyzer: &mut TextAnalyzer, text: &str) -> Option<String> {
    analyze(analyzer, text).into_iter().next()
}

/// Byte spans of alphanumeric token runs.
fn token_spans(text: &str) -> Vec<(usize, usize, &str)> {
    let mut spans = Vec::new();
    let mut token_start: Option<usize> = None;

    for (idx, ch) in text.char_indices() {
        if ch.is_alphanumeric() {
            if token_start.is_none() {
                token_start = Some(idx);
            }
        } else if let Some(start) = token_start.take() {
            spans.push((start, idx, &text[start..idx]));
        }
    }
    if let Some(start) = token_start {
        spans.push((start, text.len(), &text[start..]));
    }

    spans
}

fn floor_char_boundary(text: &str, mut idx: usize) -> usize {
    idx = idx.min(text.len());
    while idx > 0 && !text.is_char_boundary(idx) {
        idx -= 1;
    }
    idx
}

fn ceil_char_boundary(text: &str, mut idx: usize) -> usize {
    idx = idx.min(text.len());
    while idx < text.len() && !text.is_char_boundary(idx) {
        idx += 1;
    }
    idx
}

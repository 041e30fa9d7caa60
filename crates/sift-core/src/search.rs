use crate::analysis::{analyze, lemma_analyzer, standard_analyzer};
use crate::config::CrawlerConfig;
use crate::document::transliterate_german;
use crate::error::{Error, Result};
use crate::highlight::Highlighter;
use crate::index::{Fields, IndexGateway};
use crate::types::{
    FacetValue, FilterPredicate, SearchHit, SearchRequest, SearchResponse, SortOrder, SortSpec,
};
use chrono::{DateTime, NaiveDate, NaiveDateTime};
use sift_query_parser::{Occurrence, Parser, ParserOptions, QueryNode};
use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::Arc;
use std::time::Instant;
use tantivy::collector::{Count, FacetCollector, TopDocs};
use tantivy::query::{
    AllQuery, BooleanQuery, BoostQuery, Occur, PhraseQuery, Query, RangeQuery, RegexQuery,
    TermQuery,
};
use tantivy::schema::{Facet, Field, IndexRecordOption, Type, Value};
use tantivy::tokenizer::Language;
use tantivy::{DocAddress, Order, Searcher, TantivyDocument, Term};
use tracing::debug;

/// Facet dimensions served drill-sideways: logical filter field, engine
/// facet field, facet root path.
const FACET_DIMS: &[(&str, &str, &str)] = &[
    ("file_extension", "facet_extension", "/ext"),
    ("file_type", "facet_type", "/type"),
    ("author", "facet_author", "/author"),
    ("language", "facet_language", "/lang"),
];

const MAX_FACET_VALUES: usize = 50;
const DEFAULT_PAGE_SIZE: usize = 10;

/// How a field participates in filtering and sorting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FilterKind {
    Keyword,
    /// keyword dimension filtered through its facet (author)
    FacetKeyword,
    Numeric,
    Date,
    Analyzed,
}

fn filter_kind(field: &str) -> Option<FilterKind> {
    match field {
        "path" | "file_extension" | "file_type" | "language" | "content_hash" => {
            Some(FilterKind::Keyword)
        }
        "author" => Some(FilterKind::FacetKeyword),
        "file_size" => Some(FilterKind::Numeric),
        "created_date" | "modified_date" | "indexed_date" => Some(FilterKind::Date),
        "content" | "title" | "file_name" | "subject" | "keywords" | "creator"
        | "content_reversed" | "content_lemma_de" | "content_lemma_en" | "content_translit_de" => {
            Some(FilterKind::Analyzed)
        }
        _ => None,
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SearchOptions {
    pub max_passages: usize,
    pub max_passage_chars: usize,
    pub parser: ParserOptions,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            max_passages: 5,
            max_passage_chars: 200,
            parser: ParserOptions::default(),
        }
    }
}

impl SearchOptions {
    pub fn from_config(config: &CrawlerConfig) -> Self {
        Self {
            max_passages: config.max_passages,
            max_passage_chars: config.max_passage_char_length,
            parser: ParserOptions::default(),
        }
    }
}

/// Executes parsed queries with filter composition, drill-sideways facet
/// counting and passage highlighting.
pub struct SearchExecutor {
    gateway: Arc<IndexGateway>,
    opts: SearchOptions,
}

impl SearchExecutor {
    pub fn new(gateway: Arc<IndexGateway>, opts: SearchOptions) -> Self {
        Self { gateway, opts }
    }

    pub fn search(&self, req: &SearchRequest) -> Result<SearchResponse> {
        let started = Instant::now();
        let searcher = self.gateway.searcher();
        let fields = self.gateway.fields();

        let parsed = match req.query.as_deref().map(str::trim) {
            Some(text) if !text.is_empty() => Some(Parser::new(self.opts.parser).parse(text)?),
            _ => None,
        };

        let lowerer = QueryLowerer {
            fields,
            searcher: &searcher,
            opts: self.opts.parser,
        };
        let base_query: Box<dyn Query> = match &parsed {
            Some(node) => lowerer.lower(node)?,
            None => Box::new(AllQuery),
        };

        let filters = compile_filters(fields, &req.filters)?;
        let filtered = with_filters(base_query.as_ref(), &filters, None);

        let total_hits = searcher.search(filtered.as_ref(), &Count)?;

        let page_size = if req.page_size == 0 {
            DEFAULT_PAGE_SIZE
        } else {
            req.page_size
        };
        let offset = req.page * page_size;

        let ranked = self.rank(&searcher, filtered.as_ref(), &req.sort, page_size, offset)?;

        let facets = drill_sideways(&searcher, base_query.as_ref(), &filters)?;

        let mut highlighter = parsed.as_ref().map(|node| {
            Highlighter::new(
                &node.positive_terms(),
                self.opts.max_passages,
                self.opts.max_passage_chars,
            )
        });

        let mut documents = Vec::with_capacity(ranked.len());
        for (score, addr) in ranked {
            let doc: TantivyDocument = searcher.doc(addr)?;
            documents.push(self.to_hit(fields, &doc, score, highlighter.as_mut()));
        }

        debug!(
            total_hits,
            returned = documents.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "search executed"
        );

        Ok(SearchResponse {
            total_hits,
            documents,
            facets,
            active_filters: req.filters.clone(),
            elapsed_ms: started.elapsed().as_millis() as u64,
        })
    }

    fn rank(
        &self,
        searcher: &Searcher,
        query: &dyn Query,
        sort: &Option<SortSpec>,
        page_size: usize,
        offset: usize,
    ) -> Result<Vec<(f32, DocAddress)>> {
        match sort {
            None => Ok(searcher.search(query, &TopDocs::with_limit(page_size).and_offset(offset))?),
            Some(spec) if spec.field == "_score" => {
                Ok(searcher.search(query, &TopDocs::with_limit(page_size).and_offset(offset))?)
            }
            Some(spec) => {
                let order = match spec.order {
                    SortOrder::Asc => Order::Asc,
                    SortOrder::Desc => Order::Desc,
                };
                match filter_kind(&spec.field) {
                    Some(FilterKind::Numeric) => {
                        let collector = TopDocs::with_limit(page_size)
                            .and_offset(offset)
                            .order_by_fast_field::<u64>(&spec.field, order);
                        let hits = searcher.search(query, &collector)?;
                        Ok(hits.into_iter().map(|(_, addr)| (0.0, addr)).collect())
                    }
                    Some(FilterKind::Date) => {
                        let collector = TopDocs::with_limit(page_size)
                            .and_offset(offset)
                            .order_by_fast_field::<i64>(&spec.field, order);
                        let hits = searcher.search(query, &collector)?;
                        Ok(hits.into_iter().map(|(_, addr)| (0.0, addr)).collect())
                    }
                    _ => Err(Error::FilterInvalid(format!(
                        "Sort is only supported on _score or numeric fields, not '{}'",
                        spec.field
                    ))),
                }
            }
        }
    }

    fn to_hit(
        &self,
        fields: &Fields,
        doc: &TantivyDocument,
        score: f32,
        highlighter: Option<&mut Highlighter>,
    ) -> SearchHit {
        let content = get_str(doc, fields.content).unwrap_or_default();
        let passages = match highlighter {
            Some(h) => h.passages(&content),
            None => Vec::new(),
        };

        SearchHit {
            path: get_str(doc, fields.path).unwrap_or_default(),
            file_name: get_str(doc, fields.file_name).unwrap_or_default(),
            title: get_str(doc, fields.title),
            author: get_str(doc, fields.author),
            file_type: get_str(doc, fields.file_type).unwrap_or_default(),
            file_extension: get_str(doc, fields.file_extension).unwrap_or_default(),
            file_size: get_u64(doc, fields.file_size).unwrap_or(0),
            modified_date: get_i64(doc, fields.modified_date),
            language: get_str(doc, fields.language),
            score,
            passages,
        }
    }
}

fn get_str(doc: &TantivyDocument, field: Field) -> Option<String> {
    doc.get_first(field)
        .and_then(|v| v.as_str())
        .map(str::to_string)
}

fn get_u64(doc: &TantivyDocument, field: Field) -> Option<u64> {
    doc.get_first(field).and_then(|v| v.as_u64())
}

fn get_i64(doc: &TantivyDocument, field: Field) -> Option<i64> {
    doc.get_first(field).and_then(|v| v.as_i64())
}

struct CompiledFilter {
    field: String,
    occur: Occur,
    query: Box<dyn Query>,
}

/// Validate the filter predicates and compile them into engine queries.
/// Every violation is a synchronous, human-readable error.
fn compile_filters(fields: &Fields, filters: &[FilterPredicate]) -> Result<Vec<CompiledFilter>> {
    filters.iter().map(|f| compile_filter(fields, f)).collect()
}

fn compile_filter(fields: &Fields, filter: &FilterPredicate) -> Result<CompiledFilter> {
    let kind = filter_kind(&filter.field).ok_or_else(|| {
        Error::FilterInvalid(format!("Unknown filter field '{}'", filter.field))
    })?;

    let (occur, query): (Occur, Box<dyn Query>) = match filter.operator.as_str() {
        "eq" | "not" => {
            let value = require_value(filter)?;
            let q = equality_query(fields, &filter.field, kind, value)?;
            let occur = if filter.operator == "eq" {
                Occur::Must
            } else {
                Occur::MustNot
            };
            (occur, q)
        }
        "in" | "not_in" => {
            let values = filter
                .values
                .as_ref()
                .filter(|v| !v.is_empty())
                .ok_or_else(|| {
                    Error::FilterInvalid(format!(
                        "Filter operator '{}' requires non-empty 'values'",
                        filter.operator
                    ))
                })?;
            let subqueries: Vec<Box<dyn Query>> = values
                .iter()
                .map(|v| equality_query(fields, &filter.field, kind, v))
                .collect::<Result<_>>()?;
            let occur = if filter.operator == "in" {
                Occur::Must
            } else {
                Occur::MustNot
            };
            (occur, Box::new(BooleanQuery::union(subqueries)))
        }
        "range" => {
            if filter.from.is_none() && filter.to.is_none() {
                return Err(Error::FilterInvalid(
                    "Range filter requires at least one of 'from' and 'to'".to_string(),
                ));
            }
            (Occur::Must, range_query(fields, &filter.field, kind, filter)?)
        }
        other => {
            return Err(Error::FilterInvalid(format!(
                "Unsupported filter operator '{other}'"
            )));
        }
    };

    Ok(CompiledFilter {
        field: filter.field.clone(),
        occur,
        query,
    })
}

fn require_value(filter: &FilterPredicate) -> Result<&str> {
    filter
        .value
        .as_deref()
        .filter(|v| !v.is_empty())
        .ok_or_else(|| {
            Error::FilterInvalid(format!(
                "Filter operator '{}' requires 'value'",
                filter.operator
            ))
        })
}

fn equality_query(
    fields: &Fields,
    field_name: &str,
    kind: FilterKind,
    value: &str,
) -> Result<Box<dyn Query>> {
    match kind {
        FilterKind::Analyzed => Err(Error::FilterInvalid(format!(
            "Cannot filter on analyzed field '{field_name}'"
        ))),
        FilterKind::Keyword => {
            let field = keyword_field(fields, field_name);
            let normalized = if field_name == "file_extension" {
                value.to_lowercase()
            } else {
                value.to_string()
            };
            Ok(Box::new(TermQuery::new(
                Term::from_field_text(field, &normalized),
                IndexRecordOption::Basic,
            )))
        }
        FilterKind::FacetKeyword => {
            let facet = Facet::from_path(["author", value]);
            Ok(Box::new(TermQuery::new(
                Term::from_facet(fields.facet_author, &facet),
                IndexRecordOption::Basic,
            )))
        }
        FilterKind::Numeric => {
            let parsed: u64 = value.parse().map_err(|_| {
                Error::FilterInvalid(format!("Invalid numeric value '{value}'"))
            })?;
            Ok(Box::new(TermQuery::new(
                Term::from_field_u64(numeric_field(fields, field_name), parsed),
                IndexRecordOption::Basic,
            )))
        }
        FilterKind::Date => {
            let ms = parse_date_ms(value)?;
            Ok(Box::new(TermQuery::new(
                Term::from_field_i64(numeric_field(fields, field_name), ms),
                IndexRecordOption::Basic,
            )))
        }
    }
}

fn range_query(
    fields: &Fields,
    field_name: &str,
    kind: FilterKind,
    filter: &FilterPredicate,
) -> Result<Box<dyn Query>> {
    let field = match kind {
        FilterKind::Numeric | FilterKind::Date => numeric_field(fields, field_name),
        _ => {
            return Err(Error::FilterInvalid(format!(
                "Range filter is only supported on numeric fields, '{field_name}' is not numeric"
            )));
        }
    };

    let bound = |raw: &Option<String>| -> Result<Bound<Term>> {
        match raw {
            None => Ok(Bound::Unbounded),
            Some(v) => {
                let term = match kind {
                    FilterKind::Numeric => {
                        let parsed: u64 = v.parse().map_err(|_| {
                            Error::FilterInvalid(format!("Invalid numeric value '{v}'"))
                        })?;
                        Term::from_field_u64(field, parsed)
                    }
                    _ => Term::from_field_i64(field, parse_date_ms(v)?),
                };
                Ok(Bound::Included(term))
            }
        }
    };

    let value_type = match kind {
        FilterKind::Numeric => Type::U64,
        _ => Type::I64,
    };

    Ok(Box::new(RangeQuery::new_term_bounds(
        field_name.to_string(),
        value_type,
        &bound(&filter.from)?,
        &bound(&filter.to)?,
    )))
}

fn keyword_field(fields: &Fields, name: &str) -> Field {
    match name {
        "path" => fields.path,
        "file_extension" => fields.file_extension,
        "file_type" => fields.file_type,
        "language" => fields.language,
        _ => fields.content_hash,
    }
}

fn numeric_field(fields: &Fields, name: &str) -> Field {
    match name {
        "file_size" => fields.file_size,
        "created_date" => fields.created_date,
        "indexed_date" => fields.indexed_date,
        _ => fields.modified_date,
    }
}

/// Accepted date forms: epoch milliseconds, `YYYY-MM-DDTHH:MM:SSZ`,
/// `YYYY-MM-DDTHH:MM:SS` (UTC assumed), `YYYY-MM-DD` (start of day UTC).
fn parse_date_ms(raw: &str) -> Result<i64> {
    if let Ok(ms) = raw.parse::<i64>() {
        return Ok(ms);
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Ok(dt.timestamp_millis());
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S") {
        return Ok(naive.and_utc().timestamp_millis());
    }
    if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        && let Some(start) = date.and_hms_opt(0, 0, 0)
    {
        return Ok(start.and_utc().timestamp_millis());
    }
    Err(Error::FilterInvalid(format!("Invalid date value '{raw}'")))
}

/// Conjoin the base query with the compiled filters, optionally dropping
/// every filter on one dimension (the drill-sideways move).
fn with_filters(
    base: &dyn Query,
    filters: &[CompiledFilter],
    skip_field: Option<&str>,
) -> Box<dyn Query> {
    let mut clauses: Vec<(Occur, Box<dyn Query>)> = vec![(Occur::Must, base.box_clone())];
    for f in filters {
        if skip_field.is_some_and(|skip| skip == f.field) {
            continue;
        }
        clauses.push((f.occur, f.query.box_clone()));
    }
    if clauses.len() == 1 {
        return base.box_clone();
    }
    Box::new(BooleanQuery::new(clauses))
}

/// Facet counts per dimension with that dimension's own filters removed, so
/// a UI can always offer the sibling values of an active filter.
fn drill_sideways(
    searcher: &Searcher,
    base: &dyn Query,
    filters: &[CompiledFilter],
) -> Result<BTreeMap<String, Vec<FacetValue>>> {
    let mut out = BTreeMap::new();

    for &(logical, facet_field, root) in FACET_DIMS {
        let query = with_filters(base, filters, Some(logical));
        let mut collector = FacetCollector::for_field(facet_field);
        collector.add_facet(root);

        let counts = searcher.search(query.as_ref(), &collector)?;
        let prefix = format!("{root}/");
        let mut values: Vec<FacetValue> = counts
            .get(root)
            .filter_map(|(facet, count)| {
                facet
                    .to_string()
                    .strip_prefix(&prefix)
                    .map(|value| FacetValue {
                        value: value.to_string(),
                        count,
                    })
            })
            .collect();

        values.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.value.cmp(&b.value)));
        values.truncate(MAX_FACET_VALUES);
        out.insert(logical.to_string(), values);
    }

    Ok(out)
}

/// Lowers the parser IR onto engine queries. Unqualified terms and phrases
/// fan out across the content field and its linguistic shadows.
struct QueryLowerer<'a> {
    fields: &'a Fields,
    searcher: &'a Searcher,
    opts: ParserOptions,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pipeline {
    Standard,
    LemmaDe,
    LemmaEn,
    /// German digraph substitution applied before the standard pipeline.
    TranslitDe,
}

impl QueryLowerer<'_> {
    fn lower(&self, node: &QueryNode) -> Result<Box<dyn Query>> {
        match node {
            QueryNode::Term { field: None, text } => self.default_field_term(text),
            QueryNode::Term {
                field: Some(field),
                text,
            } => self.fielded_term(field, text),
            QueryNode::Phrase {
                field,
                terms,
                slop,
                boost,
            } => self.phrase(field.as_deref(), terms, *slop, *boost),
            QueryNode::Prefix {
                field,
                base,
                scored,
            } => {
                let target = match field.as_deref() {
                    None | Some("content") => self.fields.content,
                    Some(name) => self.resolve_text_field(name)?.0,
                };
                self.prefix_on_field(target, base, *scored)
            }
            QueryNode::Wildcard { field, pattern } => {
                let target = match field.as_deref() {
                    None | Some("content") => self.fields.content,
                    Some(name) => self.resolve_text_field(name)?.0,
                };
                let regex = wildcard_to_regex(pattern);
                Ok(Box::new(RegexQuery::from_pattern(&regex, target)?))
            }
            QueryNode::LeadingWildcard { base_reversed } => {
                let scored = base_reversed.chars().count() >= self.opts.scored_prefix_min_len;
                self.prefix_on_field(self.fields.content_reversed, base_reversed, scored)
            }
            QueryNode::Bool { clauses } => {
                let mut lowered: Vec<(Occur, Box<dyn Query>)> = Vec::with_capacity(clauses.len());
                let mut has_positive = false;
                for (occurrence, child) in clauses {
                    let occur = match occurrence {
                        Occurrence::Should => Occur::Should,
                        Occurrence::Must => Occur::Must,
                        Occurrence::MustNot => Occur::MustNot,
                    };
                    if occur != Occur::MustNot {
                        has_positive = true;
                    }
                    lowered.push((occur, self.lower(child)?));
                }
                // a purely negative query needs a positive leg to subtract from
                if !has_positive {
                    lowered.push((Occur::Must, Box::new(AllQuery)));
                }
                Ok(Box::new(BooleanQuery::new(lowered)))
            }
        }
    }

    /// Unqualified term: OR across content, its shadows, file name and title.
    fn default_field_term(&self, text: &str) -> Result<Box<dyn Query>> {
        let f = self.fields;
        let specs = [
            (f.content, Pipeline::Standard),
            (f.file_name, Pipeline::Standard),
            (f.title, Pipeline::Standard),
            (f.content_lemma_de, Pipeline::LemmaDe),
            (f.content_lemma_en, Pipeline::LemmaEn),
            (f.content_translit_de, Pipeline::TranslitDe),
        ];

        let mut clauses: Vec<Box<dyn Query>> = Vec::with_capacity(specs.len());
        for (field, pipeline) in specs {
            if let Some(q) = self.text_query(field, pipeline, text, 0, None) {
                clauses.push(q);
            }
        }
        Ok(Box::new(BooleanQuery::union(clauses)))
    }

    fn fielded_term(&self, field_name: &str, text: &str) -> Result<Box<dyn Query>> {
        match filter_kind(field_name) {
            Some(FilterKind::Keyword) => {
                let field = keyword_field(self.fields, field_name);
                let normalized = if field_name == "file_extension" {
                    text.to_lowercase()
                } else {
                    text.to_string()
                };
                Ok(Box::new(TermQuery::new(
                    Term::from_field_text(field, &normalized),
                    IndexRecordOption::Basic,
                )))
            }
            Some(FilterKind::Numeric) => {
                let parsed: u64 = text.parse().map_err(|_| {
                    Error::FilterInvalid(format!("Invalid numeric value '{text}'"))
                })?;
                Ok(Box::new(TermQuery::new(
                    Term::from_field_u64(numeric_field(self.fields, field_name), parsed),
                    IndexRecordOption::Basic,
                )))
            }
            Some(FilterKind::Date) => {
                let ms = parse_date_ms(text)?;
                Ok(Box::new(TermQuery::new(
                    Term::from_field_i64(numeric_field(self.fields, field_name), ms),
                    IndexRecordOption::Basic,
                )))
            }
            Some(FilterKind::Analyzed) | Some(FilterKind::FacetKeyword) => {
                let (field, pipeline) = self.resolve_text_field(field_name)?;
                match self.text_query(field, pipeline, text, 0, None) {
                    Some(q) => Ok(q),
                    None => Ok(Box::new(BooleanQuery::union(Vec::new()))),
                }
            }
            None => Err(Error::UnknownField(field_name.to_string())),
        }
    }

    fn phrase(
        &self,
        field: Option<&str>,
        terms: &[String],
        slop: u32,
        boost: Option<f32>,
    ) -> Result<Box<dyn Query>> {
        let joined = terms.join(" ");
        let f = self.fields;

        let inner: Box<dyn Query> = match field {
            None => {
                let specs = [
                    (f.content, Pipeline::Standard),
                    (f.content_lemma_de, Pipeline::LemmaDe),
                    (f.content_lemma_en, Pipeline::LemmaEn),
                    (f.content_translit_de, Pipeline::TranslitDe),
                    (f.title, Pipeline::Standard),
                    (f.file_name, Pipeline::Standard),
                ];
                let mut clauses: Vec<Box<dyn Query>> = Vec::with_capacity(specs.len());
                for (field, pipeline) in specs {
                    if let Some(q) = self.text_query(field, pipeline, &joined, slop, None) {
                        clauses.push(q);
                    }
                }
                Box::new(BooleanQuery::union(clauses))
            }
            Some(name) => {
                let (field, pipeline) = self.resolve_text_field(name)?;
                match self.text_query(field, pipeline, &joined, slop, None) {
                    Some(q) => q,
                    None => Box::new(BooleanQuery::union(Vec::new())),
                }
            }
        };

        Ok(match boost {
            Some(b) => Box::new(BoostQuery::new(inner, b)),
            None => inner,
        })
    }

    /// Tokenize `text` through the pipeline of `field` and build a term or
    /// phrase query. Returns `None` when nothing survives tokenization.
    fn text_query(
        &self,
        field: Field,
        pipeline: Pipeline,
        text: &str,
        slop: u32,
        boost: Option<f32>,
    ) -> Option<Box<dyn Query>> {
        let transformed;
        let input = match pipeline {
            Pipeline::TranslitDe => {
                transformed = transliterate_german(text);
                transformed.as_str()
            }
            _ => text,
        };

        let mut analyzer = match pipeline {
            Pipeline::Standard | Pipeline::TranslitDe => standard_analyzer(),
            Pipeline::LemmaDe => lemma_analyzer(Language::German),
            Pipeline::LemmaEn => lemma_analyzer(Language::English),
        };
        let tokens = analyze(&mut analyzer, input);

        let query: Box<dyn Query> = match tokens.len() {
            0 => return None,
            1 => Box::new(TermQuery::new(
                Term::from_field_text(field, &tokens[0]),
                IndexRecordOption::WithFreqsAndPositions,
            )),
            _ => {
                let terms: Vec<Term> = tokens
                    .iter()
                    .map(|t| Term::from_field_text(field, t))
                    .collect();
                let mut phrase = PhraseQuery::new(terms);
                phrase.set_slop(slop);
                Box::new(phrase)
            }
        };

        Some(match boost {
            Some(b) => Box::new(BoostQuery::new(query, b)),
            None => query,
        })
    }

    fn resolve_text_field(&self, name: &str) -> Result<(Field, Pipeline)> {
        let f = self.fields;
        let resolved = match name {
            "content" => (f.content, Pipeline::Standard),
            "title" => (f.title, Pipeline::Standard),
            "file_name" => (f.file_name, Pipeline::Standard),
            "subject" => (f.subject, Pipeline::Standard),
            "keywords" => (f.keywords, Pipeline::Standard),
            "creator" => (f.creator, Pipeline::Standard),
            "author" => (f.author, Pipeline::Standard),
            "content_lemma_de" => (f.content_lemma_de, Pipeline::LemmaDe),
            "content_lemma_en" => (f.content_lemma_en, Pipeline::LemmaEn),
            "content_translit_de" => (f.content_translit_de, Pipeline::TranslitDe),
            "content_reversed" => (f.content_reversed, Pipeline::Standard),
            other => return Err(Error::UnknownField(other.to_string())),
        };
        Ok(resolved)
    }

    /// Trailing-wildcard lowering. The scored variant enumerates matching
    /// terms and blends the most frequent ones into a scoring union; the
    /// constant variant is a plain pattern scan (the performance guard for
    /// short, broad prefixes).
    fn prefix_on_field(&self, field: Field, base: &str, scored: bool) -> Result<Box<dyn Query>> {
        if scored {
            let terms = expand_prefix_terms(
                self.searcher,
                field,
                base,
                self.opts.scored_rewrite_top_n,
            )?;
            let clauses: Vec<Box<dyn Query>> = terms
                .into_iter()
                .map(|t| {
                    Box::new(TermQuery::new(t, IndexRecordOption::WithFreqsAndPositions))
                        as Box<dyn Query>
                })
                .collect();
            Ok(Box::new(BooleanQuery::union(clauses)))
        } else {
            let pattern = format!("{}.*", escape_regex(base));
            Ok(Box::new(RegexQuery::from_pattern(&pattern, field)?))
        }
    }
}

/// Enumerate index terms starting with `base` and keep the `top_n` with the
/// highest document frequency (summed across segments).
fn expand_prefix_terms(
    searcher: &Searcher,
    field: Field,
    base: &str,
    top_n: usize,
) -> Result<Vec<Term>> {
    let mut freqs: HashMap<Vec<u8>, u64> = HashMap::new();

    for segment_reader in searcher.segment_readers() {
        let inverted = segment_reader.inverted_index(field)?;
        let dict = inverted.terms();
        let mut stream = dict.range().ge(base.as_bytes()).into_stream()?;
        while stream.advance() {
            let key = stream.key();
            if !key.starts_with(base.as_bytes()) {
                break;
            }
            *freqs.entry(key.to_vec()).or_insert(0) += u64::from(stream.value().doc_freq);
        }
    }

    let mut ranked: Vec<(Vec<u8>, u64)> = freqs.into_iter().collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    ranked.truncate(top_n);

    Ok(ranked
        .into_iter()
        .filter_map(|(bytes, _)| String::from_utf8(bytes).ok())
        .map(|text| Term::from_field_text(field, &text))
        .collect())
}

fn wildcard_to_regex(pattern: &str) -> String {
    let mut out = String::with_capacity(pattern.len() * 2);
    for ch in pattern.chars() {
        match ch {
            '*' => out.push_str(".*"),
            '?' => out.push('.'),
            c => push_escaped(&mut out, c),
        }
    }
    out
}

fn escape_regex(text: &str) -> String {
    let mut out = String::with_capacity(text.len() * 2);
    for ch in text.chars() {
        push_escaped(&mut out, ch);
    }
    out
}

fn push_escaped(out: &mut String, ch: char) {
    if "\\.+*?()[]{}|^$".contains(ch) {
        out.push('\\');
    }
    out.push(ch);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::DocumentBuilder;
    use crate::extract::ExtractedDocument;
    use tempfile::TempDir;

    fn gateway_with_docs(docs: &[(&str, &str)]) -> (TempDir, TempDir, Arc<IndexGateway>) {
        let files = TempDir::new().unwrap();
        let index_dir = TempDir::new().unwrap();
        let gateway = Arc::new(IndexGateway::open(index_dir.path()).unwrap());

        for (name, content) in docs {
            let path = files.path().join(name);
            std::fs::write(&path, content).unwrap();
            let extracted = ExtractedDocument {
                content: content.to_string(),
                file_type: mime_guess::from_path(&path)
                    .first_or_octet_stream()
                    .essence_str()
                    .to_string(),
                file_size: content.len() as u64,
                ..Default::default()
            };
            let doc = DocumentBuilder.build(&path, &extracted);
            gateway.upsert(&doc).unwrap();
        }
        gateway.commit().unwrap();
        gateway.refresh().unwrap();

        (files, index_dir, gateway)
    }

    fn executor(gateway: Arc<IndexGateway>) -> SearchExecutor {
        SearchExecutor::new(gateway, SearchOptions::default())
    }

    fn query(text: &str) -> SearchRequest {
        SearchRequest {
            query: Some(text.to_string()),
            page_size: 10,
            ..Default::default()
        }
    }

    #[test]
    fn empty_query_without_filters_matches_all() {
        let (_files, _idx, gateway) = gateway_with_docs(&[
            ("a.txt", "first document"),
            ("b.txt", "second document"),
        ]);
        let response = executor(gateway).search(&SearchRequest::default()).unwrap();
        assert_eq!(response.total_hits, 2);
    }

    #[test]
    fn term_query_finds_content() {
        let (_files, _idx, gateway) = gateway_with_docs(&[
            ("a.txt", "the quick brown fox"),
            ("b.txt", "nothing to see"),
        ]);
        let response = executor(gateway).search(&query("quick")).unwrap();
        assert_eq!(response.total_hits, 1);
        assert!(response.documents[0].file_name.contains("a.txt"));
        assert!(!response.documents[0].passages.is_empty());
    }

    #[test]
    fn eq_filter_on_analyzed_field_is_rejected() {
        let (_files, _idx, gateway) = gateway_with_docs(&[("a.txt", "body")]);
        let request = SearchRequest {
            filters: vec![FilterPredicate::eq("content", "foo")],
            ..Default::default()
        };
        let err = executor(gateway).search(&request).unwrap_err();
        assert!(
            err.to_string().contains("Cannot filter on analyzed field"),
            "got: {err}"
        );
    }

    #[test]
    fn range_filter_on_keyword_field_is_rejected() {
        let (_files, _idx, gateway) = gateway_with_docs(&[("a.txt", "body")]);
        let request = SearchRequest {
            filters: vec![FilterPredicate::range(
                "language",
                Some("a".to_string()),
                Some("z".to_string()),
            )],
            ..Default::default()
        };
        let err = executor(gateway).search(&request).unwrap_err();
        assert!(
            err.to_string()
                .contains("Range filter is only supported on numeric"),
            "got: {err}"
        );
    }

    #[test]
    fn unknown_operator_is_rejected() {
        let (_files, _idx, gateway) = gateway_with_docs(&[("a.txt", "body")]);
        let mut filter = FilterPredicate::eq("file_extension", "txt");
        filter.operator = "contains".to_string();
        let request = SearchRequest {
            filters: vec![filter],
            ..Default::default()
        };
        let err = executor(gateway).search(&request).unwrap_err();
        assert!(
            err.to_string().contains("Unsupported filter operator"),
            "got: {err}"
        );
    }

    #[test]
    fn eq_filter_narrows_results() {
        let (_files, _idx, gateway) = gateway_with_docs(&[
            ("report.txt", "shared words"),
            ("report.md", "shared words"),
        ]);
        let request = SearchRequest {
            query: Some("shared".to_string()),
            filters: vec![FilterPredicate::eq("file_extension", "txt")],
            page_size: 10,
            ..Default::default()
        };
        let response = executor(gateway).search(&request).unwrap();
        assert_eq!(response.total_hits, 1);
        assert_eq!(response.documents[0].file_extension, "txt");
    }

    #[test]
    fn in_filter_unions_values_within_field() {
        let (_files, _idx, gateway) = gateway_with_docs(&[
            ("a.txt", "shared words"),
            ("b.md", "shared words"),
            ("c.rst", "shared words"),
        ]);
        let request = SearchRequest {
            filters: vec![FilterPredicate {
                field: "file_extension".to_string(),
                operator: "in".to_string(),
                value: None,
                values: Some(vec!["txt".to_string(), "md".to_string()]),
                from: None,
                to: None,
                added_at: None,
            }],
            ..Default::default()
        };
        let response = executor(gateway).search(&request).unwrap();
        assert_eq!(response.total_hits, 2);
    }

    #[test]
    fn drill_sideways_ignores_own_dimension_filter() {
        let (_files, _idx, gateway) = gateway_with_docs(&[
            ("a.txt", "shared words"),
            ("b.md", "shared words"),
        ]);
        let request = SearchRequest {
            filters: vec![FilterPredicate::eq("file_extension", "txt")],
            ..Default::default()
        };
        let response = executor(gateway).search(&request).unwrap();

        // documents are narrowed, but the extension facet still shows both
        assert_eq!(response.total_hits, 1);
        let ext_facet = &response.facets["file_extension"];
        let values: Vec<&str> = ext_facet.iter().map(|v| v.value.as_str()).collect();
        assert!(values.contains(&"txt"), "facets: {ext_facet:?}");
        assert!(values.contains(&"md"), "facets: {ext_facet:?}");
    }

    #[test]
    fn sort_by_file_size() {
        let (_files, _idx, gateway) = gateway_with_docs(&[
            ("small.txt", "tiny"),
            ("large.txt", "a considerably longer document body"),
        ]);
        let request = SearchRequest {
            sort: Some(SortSpec {
                field: "file_size".to_string(),
                order: SortOrder::Asc,
            }),
            ..Default::default()
        };
        let response = executor(gateway).search(&request).unwrap();
        assert_eq!(response.documents.len(), 2);
        assert!(response.documents[0].file_size <= response.documents[1].file_size);
    }

    #[test]
    fn sort_on_text_field_is_rejected() {
        let (_files, _idx, gateway) = gateway_with_docs(&[("a.txt", "body")]);
        let request = SearchRequest {
            sort: Some(SortSpec {
                field: "title".to_string(),
                order: SortOrder::Desc,
            }),
            ..Default::default()
        };
        assert!(executor(gateway).search(&request).is_err());
    }

    #[test]
    fn date_forms_parse_to_utc_ms() {
        assert_eq!(parse_date_ms("0").unwrap(), 0);
        assert_eq!(parse_date_ms("2024-01-01").unwrap(), 1_704_067_200_000);
        assert_eq!(
            parse_date_ms("2024-01-01T00:00:00").unwrap(),
            1_704_067_200_000
        );
        assert_eq!(
            parse_date_ms("2024-01-01T00:00:00Z").unwrap(),
            1_704_067_200_000
        );
        assert!(parse_date_ms("not a date").is_err());
    }

    #[test]
    fn wildcard_translation_escapes_regex_metachars() {
        assert_eq!(wildcard_to_regex("a*b"), "a.*b");
        assert_eq!(wildcard_to_regex("a?b"), "a.b");
        assert_eq!(wildcard_to_regex("a.b*"), "a\\.b.*");
    }

    #[test]
    fn query_syntax_error_surfaces_to_caller() {
        let (_files, _idx, gateway) = gateway_with_docs(&[("a.txt", "body")]);
        let err = executor(gateway).search(&query("(unclosed")).unwrap_err();
        assert!(matches!(err, Error::QueryParse(_)));
    }
}

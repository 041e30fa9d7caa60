//! sift-query-parser - boolean search grammar for the sift document index
//!
//! Parses the user-facing expression syntax (terms, `AND`/`OR`/`NOT`,
//! parentheses, quoted phrases, `~N` proximity slop, `*`/`?` wildcards and
//! `field:` qualifiers) into a [`QueryNode`] tree and applies the index-side
//! rewrites:
//!
//! - multi-token phrases without an explicit slop expand into a boosted
//!   exact phrase OR'd with a proximity phrase,
//! - leading-wildcard terms are reversed so they can run as a prefix scan
//!   over the reversed-token shadow field,
//! - trailing-wildcard terms carry a scoring hint based on the prefix length.
//!
//! The output tree is storage-agnostic; lowering onto the index engine
//! happens in `sift-core`.

mod lexer;
mod parser;

pub use parser::{ParseError, Parser, ParserOptions};

/// How a clause participates in its enclosing boolean node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Occurrence {
    Should,
    Must,
    MustNot,
}

/// Storage-agnostic query tree produced by the parser.
///
/// `field: None` means "the default content fields"; the executor decides
/// which concrete fields that fans out to.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryNode {
    /// A single term, analyzed per target field at lowering time.
    Term {
        field: Option<String>,
        text: String,
    },
    /// An ordered phrase with a positional slop. `boost` is set only by the
    /// phrase-expansion rewrite.
    Phrase {
        field: Option<String>,
        terms: Vec<String>,
        slop: u32,
        boost: Option<f32>,
    },
    /// Trailing-wildcard term (`base*`). `scored` selects the blended-
    /// frequency rewrite; short prefixes run constant-score.
    Prefix {
        field: Option<String>,
        base: String,
        scored: bool,
    },
    /// General wildcard (`?` anywhere, or `*` not in leading/trailing
    /// position). Pattern is already lowercased.
    Wildcard {
        field: Option<String>,
        pattern: String,
    },
    /// Leading-wildcard rewritten for the reversed-token shadow field:
    /// `*vertrag` becomes a prefix scan for `gartrev`.
    LeadingWildcard { base_reversed: String },
    /// Boolean combination of clauses.
    Bool {
        clauses: Vec<(Occurrence, QueryNode)>,
    },
}

impl QueryNode {
    /// Collect the positive (non-negated) literal terms of the tree, in
    /// encounter order. Used by the snippet highlighter to know which words
    /// to mark.
    pub fn positive_terms(&self) -> Vec<String> {
        let mut out = Vec::new();
        self.walk_positive(&mut out);
        out
    }

    fn walk_positive(&self, out: &mut Vec<String>) {
        match self {
            QueryNode::Term { text, .. } => out.push(text.to_lowercase()),
            QueryNode::Phrase { terms, .. } => {
                for t in terms {
                    let t = t.to_lowercase();
                    if !out.contains(&t) {
                        out.push(t);
                    }
                }
            }
            QueryNode::Prefix { base, .. } => out.push(base.to_lowercase()),
            QueryNode::Wildcard { .. } | QueryNode::LeadingWildcard { .. } => {}
            QueryNode::Bool { clauses } => {
                for (occ, node) in clauses {
                    if *occ != Occurrence::MustNot {
                        node.walk_positive(out);
                    }
                }
            }
        }
    }
}

/// Parse `input` with default options.
pub fn parse(input: &str) -> Result<QueryNode, ParseError> {
    Parser::new(ParserOptions::default()).parse(input)
}

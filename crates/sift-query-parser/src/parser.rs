use crate::lexer::{Spanned, Tok, lex};
use crate::{Occurrence, QueryNode};

/// Tunables for the parser rewrites. The defaults mirror the index defaults:
/// proximity slop 3, exact-phrase boost 2.0, scored prefix rewrite from four
/// characters, blending the top 50 expanded terms.
#[derive(Debug, Clone, Copy)]
pub struct ParserOptions {
    pub default_slop: u32,
    pub exact_phrase_boost: f32,
    pub scored_prefix_min_len: usize,
    pub scored_rewrite_top_n: usize,
}

impl Default for ParserOptions {
    fn default() -> Self {
        Self {
            default_slop: 3,
            exact_phrase_boost: 2.0,
            scored_prefix_min_len: 4,
            scored_rewrite_top_n: 50,
        }
    }
}

/// Syntax error with the byte offset it was detected at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseError {
    pub position: usize,
    pub message: String,
}

impl ParseError {
    pub(crate) fn new(position: usize, message: impl Into<String>) -> Self {
        Self {
            position,
            message: message.into(),
        }
    }

    /// Two-line rendering with a caret under the offending position.
    pub fn caret(&self, input: &str) -> String {
        format!("{input}\n{}^ {}", " ".repeat(self.position), self.message)
    }
}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "syntax error at offset {}: {}", self.position, self.message)
    }
}

impl std::error::Error for ParseError {}

#[derive(Debug)]
enum Clause {
    Pos(QueryNode),
    Neg(QueryNode),
}

pub struct Parser {
    opts: ParserOptions,
}

impl Parser {
    pub fn new(opts: ParserOptions) -> Self {
        Self { opts }
    }

    pub fn options(&self) -> &ParserOptions {
        &self.opts
    }

    pub fn parse(&self, input: &str) -> Result<QueryNode, ParseError> {
        let toks = lex(input)?;
        if toks.is_empty() {
            return Err(ParseError::new(0, "empty query"));
        }

        let mut cursor = Cursor { toks: &toks, i: 0 };
        let node = self.or_expr(&mut cursor)?;
        if let Some(t) = cursor.peek() {
            return Err(ParseError::new(t.pos, "unexpected trailing input"));
        }

        match node {
            Clause::Pos(n) => Ok(n),
            Clause::Neg(n) => Ok(QueryNode::Bool {
                clauses: vec![(Occurrence::MustNot, n)],
            }),
        }
    }

    /// `or_expr := and_expr ((OR)? and_expr)*` — bare adjacency is an
    /// implicit OR, matching the default operator of the search syntax.
    fn or_expr(&self, c: &mut Cursor<'_, '_>) -> Result<Clause, ParseError> {
        let mut clauses = vec![self.and_expr(c)?];

        loop {
            match c.peek().map(|s| &s.tok) {
                Some(Tok::Or) => {
                    c.bump();
                    clauses.push(self.and_expr(c)?);
                }
                Some(Tok::RParen) | None => break,
                Some(_) => clauses.push(self.and_expr(c)?),
            }
        }

        if clauses.len() == 1 {
            return Ok(clauses.pop().unwrap());
        }

        let clauses = clauses
            .into_iter()
            .map(|cl| match cl {
                Clause::Pos(n) => (Occurrence::Should, n),
                Clause::Neg(n) => (Occurrence::MustNot, n),
            })
            .collect();
        Ok(Clause::Pos(QueryNode::Bool { clauses }))
    }

    /// `and_expr := unary (AND unary)*`
    fn and_expr(&self, c: &mut Cursor<'_, '_>) -> Result<Clause, ParseError> {
        let mut clauses = vec![self.unary(c)?];

        while matches!(c.peek().map(|s| &s.tok), Some(Tok::And)) {
            c.bump();
            clauses.push(self.unary(c)?);
        }

        if clauses.len() == 1 {
            return Ok(clauses.pop().unwrap());
        }

        let clauses = clauses
            .into_iter()
            .map(|cl| match cl {
                Clause::Pos(n) => (Occurrence::Must, n),
                Clause::Neg(n) => (Occurrence::MustNot, n),
            })
            .collect();
        Ok(Clause::Pos(QueryNode::Bool { clauses }))
    }

    fn unary(&self, c: &mut Cursor<'_, '_>) -> Result<Clause, ParseError> {
        if matches!(c.peek().map(|s| &s.tok), Some(Tok::Not)) {
            c.bump();
            return match self.unary(c)? {
                Clause::Pos(n) => Ok(Clause::Neg(n)),
                // double negation cancels
                Clause::Neg(n) => Ok(Clause::Pos(n)),
            };
        }
        self.primary(c)
    }

    fn primary(&self, c: &mut Cursor<'_, '_>) -> Result<Clause, ParseError> {
        let Some(spanned) = c.peek().cloned() else {
            return Err(ParseError::new(c.last_pos(), "expected a term"));
        };

        match spanned.tok {
            Tok::LParen => {
                c.bump();
                let inner = self.or_expr(c)?;
                match c.peek().map(|s| &s.tok) {
                    Some(Tok::RParen) => {
                        c.bump();
                        self.reject_slop(c, "proximity slop only applies to phrases")?;
                        Ok(inner)
                    }
                    _ => Err(ParseError::new(spanned.pos, "unclosed '('")),
                }
            }
            Tok::Phrase(content) => {
                c.bump();
                let slop = self.take_slop(c);
                Ok(Clause::Pos(self.phrase_node(
                    None,
                    content,
                    slop,
                    spanned.pos,
                )?))
            }
            Tok::Word(word) => {
                c.bump();
                // `field:` immediately followed by a quoted phrase
                if let Some(field) = word.strip_suffix(':')
                    && let Some(Tok::Phrase(content)) = c.peek().map(|s| s.tok.clone())
                {
                    let phrase_pos = c.peek().map(|s| s.pos).unwrap_or(spanned.pos);
                    c.bump();
                    let slop = self.take_slop(c);
                    return Ok(Clause::Pos(self.phrase_node(
                        Some(field.to_string()),
                        content,
                        slop,
                        phrase_pos,
                    )?));
                }
                self.reject_slop(c, "proximity slop only applies to phrases")?;
                Ok(Clause::Pos(self.word_node(word, spanned.pos)?))
            }
            Tok::RParen => Err(ParseError::new(spanned.pos, "unexpected ')'")),
            Tok::And | Tok::Or => Err(ParseError::new(
                spanned.pos,
                "operator without a left-hand term",
            )),
            Tok::Not => unreachable!("NOT is consumed by unary()"),
            Tok::Slop(_) => Err(ParseError::new(
                spanned.pos,
                "proximity slop only applies to phrases",
            )),
        }
    }

    fn take_slop(&self, c: &mut Cursor<'_, '_>) -> Option<u32> {
        if let Some(Tok::Slop(n)) = c.peek().map(|s| s.tok.clone()) {
            c.bump();
            Some(n)
        } else {
            None
        }
    }

    fn reject_slop(&self, c: &mut Cursor<'_, '_>, message: &str) -> Result<(), ParseError> {
        if let Some(s) = c.peek()
            && matches!(s.tok, Tok::Slop(_))
        {
            return Err(ParseError::new(s.pos, message));
        }
        Ok(())
    }

    /// Phrase construction + the phrase-to-proximity expansion rewrite.
    ///
    /// A multi-token phrase with no user slop becomes
    /// `("t1 t2"^B) OR ("t1 t2"~S)`; a single token or an explicit `~N`
    /// passes through unexpanded.
    fn phrase_node(
        &self,
        field: Option<String>,
        content: &str,
        slop: Option<u32>,
        pos: usize,
    ) -> Result<QueryNode, ParseError> {
        let terms: Vec<String> = content.split_whitespace().map(str::to_string).collect();
        if terms.is_empty() {
            return Err(ParseError::new(pos, "empty phrase"));
        }

        if let Some(user_slop) = slop {
            return Ok(QueryNode::Phrase {
                field,
                terms,
                slop: user_slop,
                boost: None,
            });
        }

        if terms.len() == 1 {
            return Ok(QueryNode::Phrase {
                field,
                terms,
                slop: 0,
                boost: None,
            });
        }

        Ok(QueryNode::Bool {
            clauses: vec![
                (
                    Occurrence::Should,
                    QueryNode::Phrase {
                        field: field.clone(),
                        terms: terms.clone(),
                        slop: 0,
                        boost: Some(self.opts.exact_phrase_boost),
                    },
                ),
                (
                    Occurrence::Should,
                    QueryNode::Phrase {
                        field,
                        terms,
                        slop: self.opts.default_slop,
                        boost: None,
                    },
                ),
            ],
        })
    }

    /// Term / wildcard classification and the wildcard rewrites. The
    /// non-wildcard portion is lowercased up front so it lines up with the
    /// lowercased index terms.
    fn word_node(&self, word: &str, pos: usize) -> Result<QueryNode, ParseError> {
        let (field, text) = split_field(word);
        let text_pos = pos + (word.len() - text.len());

        if text.is_empty() {
            return Err(ParseError::new(pos, "missing term after field qualifier"));
        }

        let has_wildcard = text.contains('*') || text.contains('?');
        if !has_wildcard {
            return Ok(QueryNode::Term {
                field,
                text: text.to_string(),
            });
        }

        if text.chars().all(|ch| matches!(ch, '*' | '?')) {
            return Err(ParseError::new(text_pos, "wildcard-only term is meaningless"));
        }

        if let Some(base) = text.strip_prefix('*') {
            if !base.contains('*') && !base.contains('?') {
                // pure leading wildcard; only the default content fields have
                // a reversed shadow, a qualified field falls through to the
                // generic wildcard path
                if field.is_none() {
                    return Ok(QueryNode::LeadingWildcard {
                        base_reversed: base.to_lowercase().chars().rev().collect(),
                    });
                }
            }
            return Ok(QueryNode::Wildcard {
                field,
                pattern: text.to_lowercase(),
            });
        }

        if let Some(base) = text.strip_suffix('*')
            && !base.contains('*')
            && !base.contains('?')
        {
            let scored = base.chars().count() >= self.opts.scored_prefix_min_len;
            return Ok(QueryNode::Prefix {
                field,
                base: base.to_lowercase(),
                scored,
            });
        }

        Ok(QueryNode::Wildcard {
            field,
            pattern: text.to_lowercase(),
        })
    }
}

/// Split a `field:rest` qualifier off a word. Only simple identifiers are
/// accepted as field names; anything else (e.g. a stray `c:\path`) is left
/// as term text.
fn split_field(word: &str) -> (Option<String>, &str) {
    if let Some(idx) = word.find(':') {
        let field = &word[..idx];
        let rest = &word[idx + 1..];
        let valid = !field.is_empty()
            && field
                .chars()
                .all(|ch| ch.is_ascii_alphanumeric() || ch == '_');
        if valid && !rest.starts_with('\\') {
            return (Some(field.to_string()), rest);
        }
    }
    (None, word)
}

struct Cursor<'a, 'b> {
    toks: &'a [Spanned<'b>],
    i: usize,
}

impl<'a, 'b> Cursor<'a, 'b> {
    fn peek(&self) -> Option<&Spanned<'b>> {
        self.toks.get(self.i)
    }

    fn bump(&mut self) {
        self.i += 1;
    }

    fn last_pos(&self) -> usize {
        self.toks.last().map(|s| s.pos).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(input: &str) -> QueryNode {
        Parser::new(ParserOptions::default())
            .parse(input)
            .expect("should parse")
    }

    fn parse_err(input: &str) -> ParseError {
        Parser::new(ParserOptions::default())
            .parse(input)
            .expect_err("should fail")
    }

    #[test]
    fn single_term() {
        assert_eq!(
            parse("invoice"),
            QueryNode::Term {
                field: None,
                text: "invoice".to_string()
            }
        );
    }

    #[test]
    fn implicit_or_between_terms() {
        let node = parse("alpha beta");
        let QueryNode::Bool { clauses } = node else {
            panic!("expected bool node");
        };
        assert_eq!(clauses.len(), 2);
        assert!(clauses.iter().all(|(occ, _)| *occ == Occurrence::Should));
    }

    #[test]
    fn and_binds_tighter_than_or() {
        let node = parse("a AND b OR c");
        let QueryNode::Bool { clauses } = node else {
            panic!("expected bool node");
        };
        assert_eq!(clauses.len(), 2);
        assert!(matches!(&clauses[0].1, QueryNode::Bool { clauses } if clauses.len() == 2));
        assert!(matches!(&clauses[1].1, QueryNode::Term { .. }));
    }

    #[test]
    fn not_becomes_must_not() {
        let node = parse("report NOT draft");
        let QueryNode::Bool { clauses } = node else {
            panic!("expected bool node");
        };
        assert_eq!(clauses[1].0, Occurrence::MustNot);
    }

    #[test]
    fn phrase_expansion_is_exactly_two_clauses() {
        let node = parse("\"Domain Design\"");
        let QueryNode::Bool { clauses } = node else {
            panic!("expected expansion");
        };
        assert_eq!(clauses.len(), 2);

        let QueryNode::Phrase { slop, boost, .. } = &clauses[0].1 else {
            panic!("expected phrase");
        };
        assert_eq!(*slop, 0);
        assert_eq!(*boost, Some(2.0));

        let QueryNode::Phrase { slop, boost, .. } = &clauses[1].1 else {
            panic!("expected phrase");
        };
        assert_eq!(*slop, 3);
        assert_eq!(*boost, None);
    }

    #[test]
    fn explicit_slop_is_not_expanded() {
        assert_eq!(
            parse("\"Domain Design\"~1"),
            QueryNode::Phrase {
                field: None,
                terms: vec!["Domain".to_string(), "Design".to_string()],
                slop: 1,
                boost: None,
            }
        );
    }

    #[test]
    fn single_token_phrase_is_not_expanded() {
        assert_eq!(
            parse("\"Domain\""),
            QueryNode::Phrase {
                field: None,
                terms: vec!["Domain".to_string()],
                slop: 0,
                boost: None,
            }
        );
    }

    #[test]
    fn leading_wildcard_is_reversed() {
        assert_eq!(
            parse("*vertrag"),
            QueryNode::LeadingWildcard {
                base_reversed: "gartrev".to_string()
            }
        );
    }

    #[test]
    fn leading_wildcard_is_case_folded() {
        assert_eq!(
            parse("*Vertrag"),
            QueryNode::LeadingWildcard {
                base_reversed: "gartrev".to_string()
            }
        );
    }

    #[test]
    fn bare_star_is_rejected() {
        let err = parse_err("*");
        assert!(err.message.contains("meaningless"));
    }

    #[test]
    fn prefix_scoring_threshold_at_four_chars() {
        assert_eq!(
            parse("vert*"),
            QueryNode::Prefix {
                field: None,
                base: "vert".to_string(),
                scored: true,
            }
        );
        assert_eq!(
            parse("ver*"),
            QueryNode::Prefix {
                field: None,
                base: "ver".to_string(),
                scored: false,
            }
        );
    }

    #[test]
    fn prefix_base_is_lowercased() {
        assert_eq!(
            parse("Vertrag*"),
            QueryNode::Prefix {
                field: None,
                base: "vertrag".to_string(),
                scored: true,
            }
        );
    }

    #[test]
    fn infix_wildcard_takes_the_generic_path() {
        assert_eq!(
            parse("*ver*"),
            QueryNode::Wildcard {
                field: None,
                pattern: "*ver*".to_string(),
            }
        );
        assert_eq!(
            parse("v?rtrag"),
            QueryNode::Wildcard {
                field: None,
                pattern: "v?rtrag".to_string(),
            }
        );
    }

    #[test]
    fn field_qualifier() {
        assert_eq!(
            parse("title:report"),
            QueryNode::Term {
                field: Some("title".to_string()),
                text: "report".to_string(),
            }
        );
    }

    #[test]
    fn field_qualified_phrase() {
        let node = parse("title:\"annual report\"~1");
        assert_eq!(
            node,
            QueryNode::Phrase {
                field: Some("title".to_string()),
                terms: vec!["annual".to_string(), "report".to_string()],
                slop: 1,
                boost: None,
            }
        );
    }

    #[test]
    fn parens_group() {
        let node = parse("(a OR b) AND c");
        let QueryNode::Bool { clauses } = node else {
            panic!("expected bool node");
        };
        assert_eq!(clauses.len(), 2);
        assert!(clauses.iter().all(|(occ, _)| *occ == Occurrence::Must));
    }

    #[test]
    fn unclosed_paren_reports_open_position() {
        let err = parse_err("(a OR b");
        assert_eq!(err.position, 0);
        assert!(err.message.contains("unclosed"));
    }

    #[test]
    fn caret_points_at_error() {
        let err = parse_err("a AND ~2");
        let rendered = err.caret("a AND ~2");
        assert!(rendered.contains('^'), "rendered: {rendered}");
        assert_eq!(err.position, 6);
    }

    #[test]
    fn slop_on_bare_term_is_rejected() {
        // lexer splits foo~2 into a word and a slop token
        let err = parse_err("foo~2 bar");
        assert!(err.message.contains("phrases"));
    }

    #[test]
    fn positive_terms_skip_negations() {
        let node = parse("alpha AND NOT beta \"gamma delta\"");
        let terms = node.positive_terms();
        assert!(terms.contains(&"alpha".to_string()));
        assert!(!terms.contains(&"beta".to_string()));
        assert!(terms.contains(&"gamma".to_string()));
        assert!(terms.contains(&"delta".to_string()));
    }

    #[test]
    fn windows_path_is_not_a_field_qualifier() {
        assert_eq!(
            parse("c:\\temp"),
            QueryNode::Term {
                field: None,
                text: "c:\\temp".to_string(),
            }
        );
    }
}

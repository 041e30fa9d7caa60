//! Text normalization applied to every extracted document before indexing.
//!
//! The pipeline runs in a fixed order: HTML entity decoding, percent-encoded
//! UTF-8 decoding, NFKC normalization, control-character stripping,
//! whitespace unification, whitespace collapsing, trim. Malformed escape
//! sequences always pass through literally instead of erroring.

use once_cell::sync::Lazy;
use std::collections::HashMap;
use unicode_normalization::UnicodeNormalization;

/// Closed set of named HTML entities the decoder understands. Anything else
/// passes through untouched.
static NAMED_ENTITIES: Lazy<HashMap<&'static str, char>> = Lazy::new(|| {
    HashMap::from([
        ("amp", '&'),
        ("lt", '<'),
        ("gt", '>'),
        ("quot", '"'),
        ("apos", '\''),
        ("nbsp", '\u{00A0}'),
        ("copy", '\u{00A9}'),
        ("reg", '\u{00AE}'),
        ("trade", '\u{2122}'),
        ("euro", '\u{20AC}'),
        ("pound", '\u{00A3}'),
        ("yen", '\u{00A5}'),
        ("cent", '\u{00A2}'),
        ("mdash", '\u{2014}'),
        ("ndash", '\u{2013}'),
        ("hellip", '\u{2026}'),
        ("lsquo", '\u{2018}'),
        ("rsquo", '\u{2019}'),
        ("ldquo", '\u{201C}'),
        ("rdquo", '\u{201D}'),
        ("laquo", '\u{00AB}'),
        ("raquo", '\u{00BB}'),
        ("bull", '\u{2022}'),
        ("middot", '\u{00B7}'),
        ("deg", '\u{00B0}'),
        ("plusmn", '\u{00B1}'),
        ("times", '\u{00D7}'),
        ("divide", '\u{00F7}'),
        ("frac12", '\u{00BD}'),
        ("frac14", '\u{00BC}'),
        ("frac34", '\u{00BE}'),
        ("para", '\u{00B6}'),
        ("sect", '\u{00A7}'),
        ("dagger", '\u{2020}'),
        ("Dagger", '\u{2021}'),
    ])
});

/// Normalize raw extracted text into the canonical indexed form.
pub fn normalize(raw: &str) -> String {
    // escape sequences can nest ("%2525" decodes to "%25", "&amp;lt;" to
    // "&lt;"), so a single decode pass would leave output that a second
    // normalize call still changes. Decoding to a fixed point keeps
    // normalize(normalize(x)) == normalize(x). Every successful decode
    // strictly shrinks the string, so the loop terminates.
    let mut decoded = raw.to_string();
    loop {
        let next = decode_percent(&decode_entities(&decoded));
        if next == decoded {
            break;
        }
        decoded = next;
    }
    let folded: String = decoded.nfkc().collect();
    let cleaned = strip_controls(&folded);
    collapse_whitespace(&cleaned)
}

fn decode_entities(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(amp) = rest.find('&') {
        out.push_str(&rest[..amp]);
        let candidate = &rest[amp..];

        // entity bodies are short; give up quickly when no terminator is near
        match candidate[1..].find(';').filter(|end| *end <= 10) {
            Some(end) => {
                let body = &candidate[1..end + 1];
                match decode_entity_body(body) {
                    Some(ch) => {
                        out.push(ch);
                        rest = &candidate[end + 2..];
                    }
                    None => {
                        out.push('&');
                        rest = &candidate[1..];
                    }
                }
            }
            None => {
                out.push('&');
                rest = &candidate[1..];
            }
        }
    }

    out.push_str(rest);
    out
}

fn decode_entity_body(body: &str) -> Option<char> {
    if let Some(numeric) = body.strip_prefix('#') {
        let code = if let Some(hex) = numeric.strip_prefix('x').or_else(|| numeric.strip_prefix('X'))
        {
            u32::from_str_radix(hex, 16).ok()?
        } else {
            numeric.parse::<u32>().ok()?
        };
        return char::from_u32(code);
    }
    NAMED_ENTITIES.get(body).copied()
}

fn decode_percent(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = String::with_capacity(input.len());
    let mut i = 0usize;

    while i < bytes.len() {
        if bytes[i] == b'%' {
            // a percent sequence may span multiple %XX groups forming one
            // UTF-8 scalar; decode with lookahead
            if let Some((decoded, consumed)) = decode_percent_scalar(&bytes[i..]) {
                out.push_str(&decoded);
                i += consumed;
                continue;
            }
            out.push('%');
            i += 1;
            continue;
        }

        // pass the full UTF-8 char through untouched
        let ch_len = utf8_len(bytes[i]);
        out.push_str(&input[i..i + ch_len]);
        i += ch_len;
    }

    out
}

fn decode_percent_scalar(bytes: &[u8]) -> Option<(String, usize)> {
    let first = hex_group(bytes, 0)?;
    let needed = utf8_seq_len(first)?;

    let mut buf = vec![first];
    for k in 1..needed {
        buf.push(hex_group(bytes, k * 3)?);
    }

    let s = std::str::from_utf8(&buf).ok()?;
    Some((s.to_string(), needed * 3))
}

fn hex_group(bytes: &[u8], at: usize) -> Option<u8> {
    if bytes.len() < at + 3 || bytes[at] != b'%' {
        return None;
    }
    let hi = (bytes[at + 1] as char).to_digit(16)?;
    let lo = (bytes[at + 2] as char).to_digit(16)?;
    Some((hi * 16 + lo) as u8)
}

fn utf8_seq_len(first: u8) -> Option<usize> {
    match first {
        0x00..=0x7F => Some(1),
        0xC2..=0xDF => Some(2),
        0xE0..=0xEF => Some(3),
        0xF0..=0xF4 => Some(4),
        _ => None,
    }
}

#[inline]
fn utf8_len(first: u8) -> usize {
    match first {
        0x00..=0x7F => 1,
        0xC0..=0xDF => 2,
        0xE0..=0xEF => 3,
        _ => 4,
    }
}

fn strip_controls(input: &str) -> String {
    input
        .chars()
        .filter_map(|ch| match ch {
            '\u{0000}'..='\u{0008}'
            | '\u{000B}'..='\u{000C}'
            | '\u{000E}'..='\u{001F}'
            | '\u{007F}'..='\u{009F}' => None,
            '\u{00A0}'
            | '\u{1680}'
            | '\u{2000}'..='\u{200B}'
            | '\u{202F}'
            | '\u{205F}'
            | '\u{3000}'
            | '\u{FEFF}' => Some(' '),
            _ => Some(ch),
        })
        .collect()
}

/// Collapse runs of tabs/spaces to one space, then runs of newlines (with
/// any surrounding spaces) to one newline, and trim the ends.
fn collapse_whitespace(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut pending_space = false;
    let mut pending_newline = false;

    for ch in input.chars() {
        match ch {
            ' ' | '\t' => pending_space = true,
            '\n' | '\r' => {
                pending_newline = true;
                pending_space = false;
            }
            _ => {
                if pending_newline && !out.is_empty() {
                    out.push('\n');
                } else if pending_space && !out.is_empty() {
                    out.push(' ');
                }
                pending_newline = false;
                pending_space = false;
                out.push(ch);
            }
        }
    }

    out
}

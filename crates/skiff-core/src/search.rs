//! Search predicate shared by the indexed path and the linear-scan fallback.
//!
//! Semantics: the query is split on whitespace into terms; a record matches
//! when its key equals the first term, or when every term appears as a whole
//! word (ASCII case-insensitive) in at least one of the candidate text
//! fields (`text`, `name`, `title`).

use crate::record::Record;

const TEXT_FIELDS: [&[&str]; 3] = [
    &["value", "content", "text"],
    &["value", "content", "name"],
    &["value", "content", "title"],
];

/// Split a query into search terms. Empty fragments are dropped.
pub fn parse_terms(query: &str) -> Vec<String> {
    query
        .split_whitespace()
        .map(|s| s.to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// AND semantics over the record's text fields, with an exact-key escape
/// hatch so pasting a record key finds that record.
pub fn matches_record(terms: &[String], record: &Record) -> bool {
    if terms.is_empty() {
        return false;
    }
    if record.key == terms[0] {
        return true;
    }

    let fields: Vec<&str> = TEXT_FIELDS
        .iter()
        .filter_map(|path| record.field(path).and_then(|v| v.as_str()))
        .collect();
    if fields.is_empty() {
        return false;
    }

    terms
        .iter()
        .all(|term| fields.iter().any(|field| contains_word(field, term)))
}

/// Whole-word containment, ASCII case-insensitive. A word boundary is any
/// non-alphanumeric character or the ends of the text.
pub fn contains_word(text: &str, term: &str) -> bool {
    if term.is_empty() {
        return false;
    }
    let text_chars: Vec<char> = text.chars().collect();
    let term_chars: Vec<char> = term.chars().collect();
    if text_chars.len() < term_chars.len() {
        return false;
    }

    for start in 0..=(text_chars.len() - term_chars.len()) {
        let matched = term_chars
            .iter()
            .enumerate()
            .all(|(i, tc)| text_chars[start + i].eq_ignore_ascii_case(tc));
        if !matched {
            continue;
        }
        let boundary_before = start == 0 || !text_chars[start - 1].is_alphanumeric();
        let end = start + term_chars.len();
        let boundary_after = end == text_chars.len() || !text_chars[end].is_alphanumeric();
        if boundary_before && boundary_after {
            return true;
        }
    }
    false
}

//! Topic → slug normalization.
//!
//! # Responsibility
//! - Derive the canonical topic key used by the article store, lock table and
//!   link extractor.
//!
//! # Invariants
//! - Deterministic and idempotent: `slugify(&slugify(x)) == slugify(x)`.
//! - Output contains only ASCII `a-z`, `0-9`, `-`, `(` and `)`.
//! - Compatibility forms collapse to one key: input is NFKC-normalized, then
//!   folded to ASCII through NFKD (`Über` -> `uber`, fullwidth `Ｃｈｅｅｓｅ` ->
//!   `cheese`). Characters without an ASCII fold are dropped.
//! - Parentheses survive so disambiguated titles keep distinct keys,
//!   e.g. `Mercury (planet)` -> `mercury-(planet)`.

use unicode_normalization::UnicodeNormalization;

const SEPARATORS: &[char] = &['-', '\u{2013}', '\u{2014}', '\u{2212}', '/', '_'];

#[derive(Debug, PartialEq, Eq)]
enum Part {
    Word(String),
    Dash,
    Open,
    Close,
}

/// Converts a user-supplied topic into its canonical slug.
///
/// Returns an empty string when nothing in the input folds to an ASCII alphanumeric.
pub fn slugify(value: &str) -> String {
    let mut parts: Vec<Part> = Vec::new();
    let mut word = String::new();

    for ch in value.nfkc() {
        match ch {
            '(' | ')' => {
                flush_word(&mut word, &mut parts);
                if ch == ')' && parts.last() == Some(&Part::Dash) {
                    parts.pop();
                }
                parts.push(if ch == '(' { Part::Open } else { Part::Close });
            }
            c if c.is_whitespace() || SEPARATORS.contains(&c) => {
                flush_word(&mut word, &mut parts);
                if matches!(parts.last(), Some(Part::Word(_)) | Some(Part::Close)) {
                    parts.push(Part::Dash);
                }
            }
            c => push_ascii_fold(c, &mut word),
        }
    }
    flush_word(&mut word, &mut parts);

    while parts.last() == Some(&Part::Dash) {
        parts.pop();
    }

    let mut slug = String::new();
    for part in parts {
        match part {
            Part::Word(text) => slug.push_str(&text),
            Part::Dash => slug.push('-'),
            Part::Open => slug.push('('),
            Part::Close => slug.push(')'),
        }
    }

    if slug.chars().any(|c| c.is_ascii_alphanumeric()) {
        slug
    } else {
        String::new()
    }
}

/// Appends the lowercase ASCII fold of `ch` to `word`.
fn push_ascii_fold(ch: char, word: &mut String) {
    // Sharp s has no decomposition; fold it the way case-insensitive German does.
    if ch == 'ß' || ch == 'ẞ' {
        word.push_str("ss");
        return;
    }
    word.extend(
        std::iter::once(ch)
            .nfkd()
            .filter(char::is_ascii_alphanumeric)
            .map(|c| c.to_ascii_lowercase()),
    );
}

fn flush_word(word: &mut String, parts: &mut Vec<Part>) {
    if !word.is_empty() {
        parts.push(Part::Word(std::mem::take(word)));
    }
}

/// Turns a slug back into a display title, e.g. `giant-squid` -> `Giant Squid`.
pub fn humanize_slug(slug: &str) -> String {
    let words: Vec<String> = slug
        .split(|c: char| c == '-' || c.is_whitespace())
        .filter(|word| !word.is_empty())
        .map(capitalize)
        .collect();
    if words.is_empty() {
        return "Untitled Entry".to_string();
    }
    words.join(" ")
}

fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect(),
        None => String::new(),
    }
}

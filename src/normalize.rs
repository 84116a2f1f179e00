//! Text normalization for similarity scoring and local index keys.
//!
//! `clean_up_string` is the only normalization the scorer applies. The
//! heavier `index_key` folding is used for equality lookups in the local
//! index, never for scoring.

use any_ascii::any_ascii;
use once_cell::sync::Lazy;
use regex::Regex;
use unicode_normalization::UnicodeNormalization;

/// Any run of whitespace, collapsed to a single space
pub static WHITESPACE_RUN: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").unwrap());

const ARTICLE: &str = "the ";

/// Lower-case, trim and collapse internal whitespace runs.
/// With `strip_article`, a leading "the " is removed as well.
pub fn clean_up_string(s: &str, strip_article: bool) -> String {
    let lowered = s.to_lowercase();
    let out = WHITESPACE_RUN.replace_all(lowered.trim(), " ").into_owned();
    if strip_article {
        if let Some(rest) = out.strip_prefix(ARTICLE) {
            return rest.to_string();
        }
    }
    out
}

/// Check if a character is a Unicode combining mark (diacritical mark).
pub fn is_combining_mark(c: char) -> bool {
    matches!(c as u32, 0x0300..=0x036F | 0x1AB0..=0x1AFF | 0x1DC0..=0x1DFF | 0xFE20..=0xFE2F)
}

/// Fold to lower-case ASCII: NFKD, drop combining marks, transliterate the rest.
/// e.g., "Björk" → "bjork"
pub fn fold_to_ascii(s: &str) -> String {
    let stripped: String = s.nfkd().filter(|c| !is_combining_mark(*c)).collect();
    any_ascii(&stripped).to_lowercase()
}

/// Key used by the local index for structured lookups.
/// "The  Beatles" and "beatles" share a key, as do "Motörhead" and "motorhead".
pub fn index_key(s: &str) -> String {
    let folded = fold_to_ascii(s);
    clean_up_string(&folded, true)
}

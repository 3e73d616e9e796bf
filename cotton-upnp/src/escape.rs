//! Percent-escaping of request targets
//!
//! Letters, digits and `;/?:@=+$-_.*` pass through unchanged; every
//! other byte becomes `%XX`. Unescaping leaves malformed escapes (a
//! `%` not followed by two hex digits) in place literally.

use percent_encoding::{
    percent_decode_str, percent_encode, utf8_percent_encode, AsciiSet,
    NON_ALPHANUMERIC,
};
use std::borrow::Cow;

const TARGET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b';')
    .remove(b'/')
    .remove(b'?')
    .remove(b':')
    .remove(b'@')
    .remove(b'=')
    .remove(b'+')
    .remove(b'$')
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'*');

/// Escape a string for use as a request target
pub fn escape(text: &str) -> String {
    utf8_percent_encode(text, TARGET).to_string()
}

/// Escape arbitrary bytes for use as a request target
pub fn escape_bytes(bytes: &[u8]) -> String {
    percent_encode(bytes, TARGET).to_string()
}

/// Undo [`escape`], yielding raw bytes
pub fn unescape_bytes(text: &str) -> Vec<u8> {
    percent_decode_str(text).collect()
}

/// Undo [`escape`]; invalid UTF-8 in the result is replaced
pub fn unescape(text: &str) -> Cow<'_, str> {
    percent_decode_str(text).decode_utf8_lossy()
}

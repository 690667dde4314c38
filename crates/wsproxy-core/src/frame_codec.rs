//! Text codec for relayed byte chunks.
//!
//! Encoding rules:
//! ```text
//! 0-9  A-Z  a-z  _        → emitted as the literal character   (1 char)
//! every other byte 0xHH   → emitted as `\xHH`, lowercase hex   (4 chars)
//! ```
//!
//! The output never contains quotes, backslashes other than the escape prefix,
//! or line breaks, so it can be embedded verbatim in a single-quoted string
//! literal of a generated replay script.  The fixed passthrough alphabet makes
//! the transform lossless: [`decode`] recovers the exact original bytes.
//!
//! Older logs also carry `:;<=>?@` (0x3A..=0x40) as literals.  [`decode`]
//! accepts them so those logs stay readable; [`encode`] never emits them.

use thiserror::Error;

/// Width of one `\xHH` escape in the encoded output.
pub const ESCAPE_LEN: usize = 4;

const HEX_DIGITS: &[u8; 16] = b"0123456789abcdef";

/// Errors that can occur while decoding an encoded chunk.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    /// A character outside the passthrough alphabet appeared outside an escape.
    #[error("unexpected character {ch:?} at offset {offset}")]
    UnexpectedChar { offset: usize, ch: char },

    /// A `\` was not followed by `x` and two more characters.
    #[error("malformed escape sequence at offset {offset}")]
    MalformedEscape { offset: usize },

    /// An escape carried something other than two lowercase hex digits.
    #[error("invalid hex digit {ch:?} at offset {offset}")]
    InvalidHexDigit { offset: usize, ch: char },
}

/// Returns `true` when `byte` is emitted as its literal character.
#[inline]
pub fn is_passthrough(byte: u8) -> bool {
    byte.is_ascii_digit() || byte.is_ascii_uppercase() || byte.is_ascii_lowercase() || byte == b'_'
}

/// Bytes that older logs wrote literally but [`encode`] escapes.
#[inline]
fn is_legacy_literal(byte: u8) -> bool {
    (b':'..=b'@').contains(&byte)
}

/// Returns the exact length of `encode(bytes)` without allocating.
pub fn encoded_len(bytes: &[u8]) -> usize {
    bytes
        .iter()
        .map(|&b| if is_passthrough(b) { 1 } else { ESCAPE_LEN })
        .sum()
}

/// Encodes `bytes` into the replay-log-safe text form.
///
/// # Examples
///
/// ```rust
/// use wsproxy_core::frame_codec::encode;
///
/// assert_eq!(encode(b"ok_1\x07"), "ok_1\\x07");
/// assert_eq!(encode(&[0xDE, 0xAD]), "\\xde\\xad");
/// ```
pub fn encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(encoded_len(bytes));
    for &byte in bytes {
        if is_passthrough(byte) {
            out.push(byte as char);
        } else {
            out.push('\\');
            out.push('x');
            out.push(HEX_DIGITS[(byte >> 4) as usize] as char);
            out.push(HEX_DIGITS[(byte & 0x0f) as usize] as char);
        }
    }
    out
}

/// Decodes text produced by [`encode`] back into the original bytes.
///
/// # Errors
///
/// Returns [`CodecError`] if `text` contains a character that is neither a
/// passthrough character nor one of the legacy literals `:;<=>?@`, or a
/// malformed `\xHH` escape.
///
/// # Examples
///
/// ```rust
/// use wsproxy_core::frame_codec::{decode, encode};
///
/// let raw = [0x00, b'R', b'F', b'B', b' ', 0xff];
/// assert_eq!(decode(&encode(&raw)).unwrap(), raw);
/// ```
pub fn decode(text: &str) -> Result<Vec<u8>, CodecError> {
    let bytes = text.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;

    while i < bytes.len() {
        let b = bytes[i];
        if is_passthrough(b) || is_legacy_literal(b) {
            out.push(b);
            i += 1;
            continue;
        }

        if b != b'\\' {
            return Err(CodecError::UnexpectedChar {
                offset: i,
                ch: char_at(text, i),
            });
        }

        if i + ESCAPE_LEN > bytes.len() || bytes[i + 1] != b'x' {
            return Err(CodecError::MalformedEscape { offset: i });
        }

        let high = hex_value(bytes[i + 2]).ok_or(CodecError::InvalidHexDigit {
            offset: i + 2,
            ch: char_at(text, i + 2),
        })?;
        let low = hex_value(bytes[i + 3]).ok_or(CodecError::InvalidHexDigit {
            offset: i + 3,
            ch: char_at(text, i + 3),
        })?;
        out.push((high << 4) | low);
        i += ESCAPE_LEN;
    }

    Ok(out)
}

fn hex_value(digit: u8) -> Option<u8> {
    match digit {
        b'0'..=b'9' => Some(digit - b'0'),
        b'a'..=b'f' => Some(digit - b'a' + 10),
        _ => None,
    }
}

// `offset` may land inside a multi-byte character of hostile input.
fn char_at(text: &str, offset: usize) -> char {
    text.get(offset..)
        .and_then(|rest| rest.chars().next())
        .unwrap_or(char::REPLACEMENT_CHARACTER)
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_passthrough_alphabet_is_literal() {
        let input = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz_";
        assert_eq!(encode(input), std::str::from_utf8(input).unwrap());
    }

    #[test]
    fn test_encode_escapes_punctuation_between_digits_and_letters() {
        // 0x3A..=0x40 sit between '9' and 'A' and are not in the alphabet.
        assert_eq!(encode(b":;<=>?@"), "\\x3a\\x3b\\x3c\\x3d\\x3e\\x3f\\x40");
    }

    #[test]
    fn test_encode_uses_lowercase_zero_padded_hex() {
        assert_eq!(encode(&[0x00]), "\\x00");
        assert_eq!(encode(&[0x0a]), "\\x0a");
        assert_eq!(encode(&[0xff]), "\\xff");
    }

    #[test]
    fn test_encode_quote_and_backslash_are_escaped() {
        assert_eq!(encode(b"'\\"), "\\x27\\x5c");
    }

    #[test]
    fn test_encode_empty_input_is_empty() {
        assert_eq!(encode(&[]), "");
        assert_eq!(encoded_len(&[]), 0);
    }

    #[test]
    fn test_encoded_len_matches_encode_for_every_byte() {
        let all: Vec<u8> = (0..=255).collect();
        assert_eq!(encoded_len(&all), encode(&all).len());
        // 63 passthrough bytes, 193 escaped ones.
        assert_eq!(encoded_len(&all), 63 + 193 * ESCAPE_LEN);
    }

    #[test]
    fn test_decode_inverts_encode_for_every_byte() {
        let all: Vec<u8> = (0..=255).collect();
        assert_eq!(decode(&encode(&all)).unwrap(), all);
    }

    #[test]
    fn test_decode_rejects_space() {
        assert_eq!(
            decode("ab c"),
            Err(CodecError::UnexpectedChar { offset: 2, ch: ' ' })
        );
    }

    #[test]
    fn test_decode_accepts_legacy_literal_punctuation() {
        assert_eq!(decode("008:@").unwrap(), b"008:@");
        assert_eq!(decode(":;<=>?@").unwrap(), b":;<=>?@");
    }

    #[test]
    fn test_decode_still_rejects_punctuation_outside_legacy_range() {
        assert_eq!(
            decode("a[b"),
            Err(CodecError::UnexpectedChar { offset: 1, ch: '[' })
        );
    }

    #[test]
    fn test_decode_rejects_malformed_escape() {
        assert_eq!(decode("ok\\x0"), Err(CodecError::MalformedEscape { offset: 2 }));
        assert_eq!(decode("\\y00"), Err(CodecError::MalformedEscape { offset: 0 }));
    }

    #[test]
    fn test_decode_rejects_uppercase_hex() {
        assert_eq!(
            decode("\\xFF"),
            Err(CodecError::InvalidHexDigit { offset: 2, ch: 'F' })
        );
    }

    #[test]
    fn test_decode_reports_non_ascii_characters() {
        assert_eq!(
            decode("a\u{e9}"),
            Err(CodecError::UnexpectedChar {
                offset: 1,
                ch: '\u{e9}'
            })
        );
    }
}

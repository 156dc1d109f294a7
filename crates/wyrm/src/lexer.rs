//! Stateless scanning primitives.
//!
//! The parser drives these directly instead of going through a token stream:
//! each primitive probes at a byte offset, skips filler, and only commits the
//! cursor on a successful match. Failed probes leave the cursor untouched so
//! the caller can try the next alternative.
//!
//! Identifiers are ASCII (`[A-Za-z_][A-Za-z0-9_]*`); string literals pass
//! non-ASCII bytes through untouched.

/// Keywords that are rejected as identifiers.
pub(crate) const KEYWORDS: &[&str] = &[
    "fn", "method", "new", "let", "const", "if", "else", "while", "for", "return",
];

/// A lexical failure at a local byte offset, before source-map rendering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct LexError {
    pub at: usize,
    pub message: &'static str,
}

fn is_alpha(b: u8) -> bool {
    b.is_ascii_alphabetic()
}

fn is_digit(b: u8) -> bool {
    b.is_ascii_digit()
}

/// Skips whitespace and comments, including nested `/* */`.
pub(crate) fn skip_filler(text: &str, at: &mut usize) {
    let bytes = text.as_bytes();
    let mut depth = 0usize;
    while *at < bytes.len() {
        if depth > 0 {
            if bytes[*at..].starts_with(b"*/") {
                depth -= 1;
                *at += 2;
            } else {
                *at += 1;
            }
        } else if bytes[*at..].starts_with(b"/*") {
            depth += 1;
            *at += 2;
        } else if bytes[*at..].starts_with(b"//") {
            while *at < bytes.len() && bytes[*at] != b'\n' {
                *at += 1;
            }
        } else if bytes[*at].is_ascii_whitespace() {
            *at += 1;
        } else {
            break;
        }
    }
}

/// Matches a literal string after filler; commits the cursor only on success.
pub(crate) fn consume_str(text: &str, at: &mut usize, what: &str) -> bool {
    let mut probe = *at;
    skip_filler(text, &mut probe);
    if text[probe..].starts_with(what) {
        *at = probe + what.len();
        true
    } else {
        false
    }
}

/// Parses an identifier, allowing keywords.
pub(crate) fn parse_identifier_raw<'a>(text: &'a str, at: &mut usize) -> Option<&'a str> {
    let bytes = text.as_bytes();
    let mut probe = *at;
    skip_filler(text, &mut probe);
    let start = probe;
    match bytes.get(probe) {
        Some(&b) if is_alpha(b) || b == b'_' => probe += 1,
        _ => return None,
    }
    while let Some(&b) = bytes.get(probe) {
        if is_alpha(b) || is_digit(b) || b == b'_' {
            probe += 1;
        } else {
            break;
        }
    }
    *at = probe;
    Some(&text[start..probe])
}

/// Parses an identifier, rejecting keywords.
pub(crate) fn parse_identifier<'a>(text: &'a str, at: &mut usize) -> Option<&'a str> {
    let mut probe = *at;
    let ident = parse_identifier_raw(text, &mut probe)?;
    if KEYWORDS.contains(&ident) {
        return None;
    }
    *at = probe;
    Some(ident)
}

/// Matches a whole keyword (an identifier-boundary-aware literal).
pub(crate) fn consume_keyword(text: &str, at: &mut usize, keyword: &str) -> bool {
    let mut probe = *at;
    match parse_identifier_raw(text, &mut probe) {
        Some(ident) if ident == keyword => {
            *at = probe;
            true
        }
        _ => false,
    }
}

/// Parses a signed decimal or `0x` hexadecimal integer.
pub(crate) fn parse_integer(text: &str, at: &mut usize) -> Option<i32> {
    let bytes = text.as_bytes();
    let mut probe = *at;
    skip_filler(text, &mut probe);
    let negative = bytes.get(probe) == Some(&b'-');
    if negative {
        probe += 1;
    }
    let (radix, digits_start) = if text[probe..].starts_with("0x") {
        (16, probe + 2)
    } else {
        (10, probe)
    };
    let mut digits_end = digits_start;
    while let Some(&b) = bytes.get(digits_end) {
        let ok = if radix == 16 { b.is_ascii_hexdigit() } else { is_digit(b) };
        if !ok {
            break;
        }
        digits_end += 1;
    }
    if digits_end == digits_start {
        return None;
    }
    // parse via i64 so i32::MIN magnitudes don't overflow before negation
    let magnitude = i64::from_str_radix(&text[digits_start..digits_end], radix).ok()?;
    let value = if negative { -magnitude } else { magnitude };
    *at = digits_end;
    Some(value as i32)
}

/// Parses a signed float; requires a `.` and at least one digit after it.
pub(crate) fn parse_float(text: &str, at: &mut usize) -> Option<f32> {
    let bytes = text.as_bytes();
    let mut probe = *at;
    skip_filler(text, &mut probe);
    let start = probe;
    if bytes.get(probe) == Some(&b'-') {
        probe += 1;
    }
    while probe < bytes.len() && is_digit(bytes[probe]) {
        probe += 1;
    }
    if bytes.get(probe) != Some(&b'.') {
        return None;
    }
    probe += 1;
    let post_dot = probe;
    while probe < bytes.len() && is_digit(bytes[probe]) {
        probe += 1;
    }
    if probe == post_dot {
        return None;
    }
    let value = text[start..probe].parse::<f32>().ok()?;
    *at = probe;
    Some(value)
}

/// Parses a double-quoted string with `\" \\ \n \r \t` escapes.
///
/// Returns `Ok(None)` when the cursor is not at a string, so the caller can
/// try other stems. Unterminated strings and unknown escapes are hard errors.
pub(crate) fn parse_string_literal(text: &str, at: &mut usize) -> Result<Option<String>, LexError> {
    let bytes = text.as_bytes();
    let mut probe = *at;
    skip_filler(text, &mut probe);
    if bytes.get(probe) != Some(&b'"') {
        return Ok(None);
    }
    probe += 1;
    let mut out = String::new();
    loop {
        match bytes.get(probe) {
            None => {
                return Err(LexError {
                    at: probe,
                    message: "expected closing quote mark",
                });
            }
            Some(b'"') => {
                probe += 1;
                break;
            }
            Some(b'\\') => {
                probe += 1;
                let escaped = match bytes.get(probe) {
                    Some(b'"') => '"',
                    Some(b'\\') => '\\',
                    Some(b'n') => '\n',
                    Some(b'r') => '\r',
                    Some(b't') => '\t',
                    None => {
                        return Err(LexError {
                            at: probe,
                            message: "unterminated escape",
                        });
                    }
                    Some(_) => {
                        return Err(LexError {
                            at: probe,
                            message: "unknown escape sequence",
                        });
                    }
                };
                out.push(escaped);
                probe += 1;
            }
            Some(_) => {
                // multi-byte UTF-8 passes through untouched
                let ch = text[probe..].chars().next().expect("probe is on a char boundary");
                out.push(ch);
                probe += ch.len_utf8();
            }
        }
    }
    *at = probe;
    Ok(Some(out))
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn filler_skips_nested_comments() {
        let text = "  /* a /* b */ c */ // line\n  x";
        let mut at = 0;
        skip_filler(text, &mut at);
        assert_eq!(&text[at..], "x");
    }

    #[test]
    fn consume_str_does_not_commit_on_failure() {
        let text = "  ==";
        let mut at = 0;
        assert!(!consume_str(text, &mut at, "!="));
        assert_eq!(at, 0);
        assert!(consume_str(text, &mut at, "=="));
        assert_eq!(at, 4);
    }

    #[test]
    fn identifiers_reject_keywords() {
        let mut at = 0;
        assert_eq!(parse_identifier("while", &mut at), None);
        assert_eq!(at, 0);
        assert_eq!(parse_identifier("whiles", &mut at), Some("whiles"));
    }

    #[test]
    fn keyword_requires_boundary() {
        let mut at = 0;
        assert!(!consume_keyword("newish", &mut at, "new"));
        assert!(consume_keyword("new x", &mut at, "new"));
        assert_eq!(at, 3);
    }

    #[test]
    fn integers_decimal_hex_signed() {
        let mut at = 0;
        assert_eq!(parse_integer("42", &mut at), Some(42));
        at = 0;
        assert_eq!(parse_integer("-7", &mut at), Some(-7));
        at = 0;
        assert_eq!(parse_integer("0x1F", &mut at), Some(31));
        at = 0;
        assert_eq!(parse_integer("-", &mut at), None);
        assert_eq!(at, 0);
    }

    #[test]
    fn floats_require_post_dot_digit() {
        let mut at = 0;
        assert_eq!(parse_float("3.25", &mut at), Some(3.25));
        at = 0;
        assert_eq!(parse_float("3.", &mut at), None);
        at = 0;
        assert_eq!(parse_float("7", &mut at), None);
        at = 0;
        assert_eq!(parse_float("-0.5", &mut at), Some(-0.5));
    }

    #[test]
    fn string_escapes() {
        let mut at = 0;
        let parsed = parse_string_literal(r#""a\tb\"c""#, &mut at).unwrap();
        assert_eq!(parsed.as_deref(), Some("a\tb\"c"));
    }

    #[test]
    fn string_errors() {
        let mut at = 0;
        let err = parse_string_literal("\"abc", &mut at).unwrap_err();
        assert_eq!(err.message, "expected closing quote mark");
        at = 0;
        let err = parse_string_literal(r#""a\qb""#, &mut at).unwrap_err();
        assert_eq!(err.message, "unknown escape sequence");
    }

    #[test]
    fn non_string_returns_none() {
        let mut at = 0;
        assert_eq!(parse_string_literal("123", &mut at), Ok(None));
        assert_eq!(at, 0);
    }
}

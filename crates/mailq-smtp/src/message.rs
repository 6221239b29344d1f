//! Header block and body rendering.
//!
//! Turns an ordered header set plus a plain-text body into the string
//! streamed after `DATA`. Dot-stuffing and the terminator are the
//! client's job, not this module's.

use std::fmt;

use base64::Engine;

use crate::types::*;

/// Longest RFC 2047 encoded-word we emit (RFC 2047 §2).
const MAX_ENCODED_WORD_LEN: usize = 75;
/// `=?UTF-8?B?` + `?=`
const ENCODED_WORD_OVERHEAD: usize = 12;

// ─── Header map ─────────────────────────────────────────────────────

/// Ordered header set with case-insensitive, last-writer-wins names.
///
/// Replacing an existing header keeps its original position but takes the
/// new spelling and value, so an explicit `content-type` overrides a
/// default `Content-Type` instead of producing two of them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderMap {
    entries: Vec<(String, String)>,
}

impl HeaderMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a header. Returns the value it replaced.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) -> Option<String> {
        let name = name.into();
        let value = value.into();
        match self
            .entries
            .iter_mut()
            .find(|(n, _)| n.eq_ignore_ascii_case(&name))
        {
            Some(slot) => {
                let old = std::mem::replace(slot, (name, value));
                Some(old.1)
            }
            None => {
                self.entries.push((name, value));
                None
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    /// Reject names and values that would corrupt the header block.
    pub fn validate(&self) -> SmtpResult<()> {
        for (name, value) in &self.entries {
            if !is_valid_header_name(name) {
                return Err(SmtpError::message(format!("Invalid header name: {:?}", name)));
            }
            if !is_safe_header_value(value) {
                return Err(SmtpError::message(format!(
                    "Header {} contains a bare line break",
                    name
                )));
            }
        }
        Ok(())
    }
}

impl fmt::Display for HeaderMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (name, value) in self.iter() {
            write!(f, "{}: {}\r\n", name, value)?;
        }
        Ok(())
    }
}

/// RFC 5322 field-name: printable ASCII except `:`.
fn is_valid_header_name(name: &str) -> bool {
    !name.is_empty() && name.bytes().all(|b| (33..=126).contains(&b) && b != b':')
}

/// CR and LF may only appear as a fold (`CRLF` followed by space or tab).
fn is_safe_header_value(value: &str) -> bool {
    let bytes = value.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'\r' => {
                let folded = bytes.get(i + 1) == Some(&b'\n')
                    && matches!(bytes.get(i + 2), Some(b' ') | Some(b'\t'));
                if !folded {
                    return false;
                }
                i += 3;
            }
            b'\n' => return false,
            _ => i += 1,
        }
    }
    true
}

// ─── Encoding ───────────────────────────────────────────────────────

/// Content-Transfer-Encoding chosen for a body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferEncoding {
    SevenBit,
    QuotedPrintable,
}

impl fmt::Display for TransferEncoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SevenBit => write!(f, "7bit"),
            Self::QuotedPrintable => write!(f, "quoted-printable"),
        }
    }
}

/// RFC 2047 encode a header value if it contains non-ASCII characters.
///
/// Long values are split on character boundaries into several
/// encoded-words joined by a fold, each at most 75 characters.
pub fn encode_header_value(value: &str) -> String {
    if value.is_ascii() {
        return value.to_string();
    }

    // Every 3 input bytes become 4 base64 characters.
    let max_chunk = (MAX_ENCODED_WORD_LEN - ENCODED_WORD_OVERHEAD) / 4 * 3;
    let mut words = Vec::new();
    let mut start = 0;
    let mut end = 0;
    for (idx, ch) in value.char_indices() {
        let next = idx + ch.len_utf8();
        if next - start > max_chunk {
            words.push(encoded_word(&value[start..end]));
            start = end;
        }
        end = next;
    }
    words.push(encoded_word(&value[start..end]));
    words.join("\r\n ")
}

fn encoded_word(chunk: &str) -> String {
    let encoded = base64::engine::general_purpose::STANDARD.encode(chunk.as_bytes());
    format!("=?UTF-8?B?{}?=", encoded)
}

/// Normalise line endings to CRLF and pick a transfer encoding.
/// ASCII bodies go out as 7bit; anything else as quoted-printable.
pub fn encode_body(text: &str) -> (String, TransferEncoding) {
    let normalised = normalise_line_endings(text);
    if normalised.is_ascii() {
        (normalised, TransferEncoding::SevenBit)
    } else {
        (
            quoted_printable::encode_to_str(normalised.as_bytes()),
            TransferEncoding::QuotedPrintable,
        )
    }
}

fn normalise_line_endings(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + 16);
    let mut lines = text.split('\n').peekable();
    while let Some(line) = lines.next() {
        out.push_str(line.strip_suffix('\r').unwrap_or(line));
        if lines.peek().is_some() {
            out.push_str("\r\n");
        }
    }
    out
}

/// Render the full DATA payload: header block, blank line, body.
pub fn render_message(headers: &HeaderMap, body: &str) -> String {
    let mut out = String::with_capacity(body.len() + headers.len() * 64 + 2);
    out.push_str(&headers.to_string());
    out.push_str("\r\n");
    out.push_str(body);
    out
}

// ─── Tests ──────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_words(value: &str) -> String {
        value
            .split("\r\n ")
            .map(|w| {
                let b64 = w
                    .strip_prefix("=?UTF-8?B?")
                    .and_then(|w| w.strip_suffix("?="))
                    .expect("encoded word");
                String::from_utf8(
                    base64::engine::general_purpose::STANDARD
                        .decode(b64)
                        .unwrap(),
                )
                .unwrap()
            })
            .collect()
    }

    #[test]
    fn insert_overrides_case_insensitively_in_place() {
        let mut h = HeaderMap::new();
        h.insert("Content-Type", "text/plain; charset=\"utf-8\"");
        h.insert("To", "<b@x.com>");
        let old = h.insert("content-type", "text/html");
        assert_eq!(old.as_deref(), Some("text/plain; charset=\"utf-8\""));
        assert_eq!(h.len(), 2);
        assert_eq!(h.get("CONTENT-TYPE"), Some("text/html"));
        let first = h.iter().next().unwrap();
        assert_eq!(first, ("content-type", "text/html"));
    }

    #[test]
    fn display_renders_name_value_lines() {
        let mut h = HeaderMap::new();
        h.insert("From", "<a@x.com>");
        h.insert("Subject", "Hi");
        assert_eq!(h.to_string(), "From: <a@x.com>\r\nSubject: Hi\r\n");
    }

    #[test]
    fn validate_rejects_header_injection() {
        let mut h = HeaderMap::new();
        h.insert("X-Tag", "ok\r\nBcc: victim@example.com");
        assert_eq!(h.validate().unwrap_err().kind, SmtpErrorKind::MessageError);

        let mut h = HeaderMap::new();
        h.insert("X-Tag", "line\nbreak");
        assert!(h.validate().is_err());

        let mut h = HeaderMap::new();
        h.insert("Bad Name", "v");
        assert!(h.validate().is_err());
    }

    #[test]
    fn validate_accepts_folded_values() {
        let mut h = HeaderMap::new();
        h.insert("Subject", encode_header_value(&"ä".repeat(80)));
        h.insert("X-Long", "part one\r\n\tpart two");
        assert!(h.validate().is_ok());
    }

    #[test]
    fn ascii_header_value_untouched() {
        assert_eq!(encode_header_value("Hello World"), "Hello World");
    }

    #[test]
    fn non_ascii_header_value_is_b_encoded() {
        let v = encode_header_value("Grüße");
        assert!(v.starts_with("=?UTF-8?B?"));
        assert!(v.ends_with("?="));
        assert_eq!(decode_words(&v), "Grüße");
    }

    #[test]
    fn long_header_value_splits_into_short_words() {
        let subject = "Überweisungsbestätigung für Ihre Bestellung Nummer 12345 – vielen Dank!";
        let v = encode_header_value(subject);
        assert!(v.contains("\r\n "));
        for word in v.split("\r\n ") {
            assert!(word.len() <= MAX_ENCODED_WORD_LEN, "{} too long", word);
        }
        assert_eq!(decode_words(&v), subject);
    }

    #[test]
    fn ascii_body_is_seven_bit_with_crlf() {
        let (body, cte) = encode_body("line one\nline two\r\nline three");
        assert_eq!(cte, TransferEncoding::SevenBit);
        assert_eq!(body, "line one\r\nline two\r\nline three");
    }

    #[test]
    fn non_ascii_body_is_quoted_printable() {
        let (body, cte) = encode_body("Grüße");
        assert_eq!(cte, TransferEncoding::QuotedPrintable);
        assert_eq!(cte.to_string(), "quoted-printable");
        assert!(body.is_ascii());
        assert!(body.contains("=C3=BC"));
    }

    #[test]
    fn render_separates_headers_and_body() {
        let mut h = HeaderMap::new();
        h.insert("Subject", "Hi");
        assert_eq!(render_message(&h, "Hello"), "Subject: Hi\r\n\r\nHello");
    }
}

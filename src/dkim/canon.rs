//! Message splitting and canonicalization (RFC 6376 §3.4).

use std::borrow::Cow;
use std::collections::HashMap;

use super::signature::CanonicalizationMethod;

/// One header field as it appears on the wire. `value` is everything after
/// the colon, folding CRLFs included, without the terminating CRLF. The
/// bytes are kept verbatim so 8-bit (RFC 6532) fields hash as sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawHeader {
    pub name: String,
    pub value: Vec<u8>,
}

impl RawHeader {
    /// The value as text, for tag-list parsing. Invalid UTF-8 is replaced.
    pub fn value_str(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.value)
    }
}

/// Bare LF becomes CRLF; existing CRLF is left alone.
pub fn normalize_line_endings(input: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(input.len() + input.len() / 32);
    let mut prev = 0u8;
    for &b in input {
        if b == b'\n' && prev != b'\r' {
            out.push(b'\r');
        }
        out.push(b);
        prev = b;
    }
    out
}

/// Split a message into its header fields and body. Lines without a colon
/// are skipped.
pub fn split_message(message: &[u8]) -> (Vec<RawHeader>, Vec<u8>) {
    let normalized = normalize_line_endings(message);
    let (head, body) = match find(&normalized, b"\r\n\r\n") {
        Some(pos) => (&normalized[..pos], normalized[pos + 4..].to_vec()),
        None if normalized.starts_with(b"\r\n") => (&normalized[..0], normalized[2..].to_vec()),
        None => (&normalized[..], Vec::new()),
    };

    let mut headers: Vec<RawHeader> = Vec::new();
    for line in head.split(|&b| b == b'\n') {
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        if line.starts_with(b" ") || line.starts_with(b"\t") {
            if let Some(last) = headers.last_mut() {
                last.value.extend_from_slice(b"\r\n");
                last.value.extend_from_slice(line);
            }
            continue;
        }
        if let Some(colon) = line.iter().position(|&b| b == b':') {
            headers.push(RawHeader {
                name: String::from_utf8_lossy(&line[..colon]).into_owned(),
                value: line[colon + 1..].to_vec(),
            });
        }
    }
    (headers, body)
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// `value` minus every CRLF pair.
fn unfold(value: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(value.len());
    let mut i = 0;
    while i < value.len() {
        if value[i] == b'\r' && value.get(i + 1) == Some(&b'\n') {
            i += 2;
            continue;
        }
        out.push(value[i]);
        i += 1;
    }
    out
}

pub fn canonicalize_header(method: CanonicalizationMethod, name: &str, value: &[u8]) -> Vec<u8> {
    match method {
        CanonicalizationMethod::Simple => {
            let mut out = Vec::with_capacity(name.len() + 1 + value.len());
            out.extend_from_slice(name.as_bytes());
            out.push(b':');
            out.extend_from_slice(value);
            out
        }
        CanonicalizationMethod::Relaxed => {
            let mut out = name.trim_end().to_ascii_lowercase().into_bytes();
            out.push(b':');
            let start = out.len();
            let mut in_wsp = false;
            for b in unfold(value) {
                if b == b' ' || b == b'\t' {
                    in_wsp = true;
                    continue;
                }
                if in_wsp && out.len() > start {
                    out.push(b' ');
                }
                in_wsp = false;
                out.push(b);
            }
            out
        }
    }
}

/// Body lines without their CRLF. Text after the last CRLF counts as a line.
fn body_lines(body: &[u8]) -> Vec<&[u8]> {
    let mut lines = Vec::new();
    let mut start = 0;
    let mut i = 0;
    while i + 1 < body.len() {
        if body[i] == b'\r' && body[i + 1] == b'\n' {
            lines.push(&body[start..i]);
            start = i + 2;
            i += 2;
        } else {
            i += 1;
        }
    }
    if start < body.len() {
        lines.push(&body[start..]);
    }
    lines
}

/// Expects CRLF line endings.
pub fn canonicalize_body(method: CanonicalizationMethod, body: &[u8]) -> Vec<u8> {
    let mut lines: Vec<Vec<u8>> = body_lines(body)
        .into_iter()
        .map(|line| match method {
            CanonicalizationMethod::Simple => line.to_vec(),
            CanonicalizationMethod::Relaxed => {
                let mut out = Vec::with_capacity(line.len());
                let mut in_wsp = false;
                for &b in line {
                    if b == b' ' || b == b'\t' {
                        in_wsp = true;
                        continue;
                    }
                    if in_wsp {
                        out.push(b' ');
                    }
                    in_wsp = false;
                    out.push(b);
                }
                out
            }
        })
        .collect();

    while lines.last().is_some_and(|l| l.is_empty()) {
        lines.pop();
    }
    if lines.is_empty() {
        return match method {
            CanonicalizationMethod::Simple => b"\r\n".to_vec(),
            CanonicalizationMethod::Relaxed => Vec::new(),
        };
    }
    let mut out = Vec::with_capacity(body.len());
    for line in lines {
        out.extend_from_slice(&line);
        out.extend_from_slice(b"\r\n");
    }
    out
}

/// `l=` truncation of the canonical body.
pub fn apply_body_length_limit(body: &[u8], limit: Option<u64>) -> &[u8] {
    match limit {
        Some(l) if (l as usize) < body.len() => &body[..l as usize],
        _ => body,
    }
}

/// Pick the headers named in `h=` bottom-up, one instance per mention.
/// Names mentioned more often than they occur hash as an empty field.
/// Each entry ends with CRLF.
pub fn select_headers(
    method: CanonicalizationMethod,
    signed_headers: &[String],
    headers: &[&RawHeader],
) -> Vec<Vec<u8>> {
    let mut used: HashMap<String, usize> = HashMap::new();
    signed_headers
        .iter()
        .map(|wanted| {
            let wanted = wanted.to_ascii_lowercase();
            let skip = used.entry(wanted.clone()).or_insert(0);
            let found = headers
                .iter()
                .rev()
                .filter(|h| h.name.trim_end().eq_ignore_ascii_case(&wanted))
                .nth(*skip);
            *skip += 1;
            let mut line = match found {
                Some(h) => canonicalize_header(method, &h.name, &h.value),
                None => format!("{wanted}:").into_bytes(),
            };
            line.extend_from_slice(b"\r\n");
            line
        })
        .collect()
}

/// Empty the `b=` value of a DKIM-Signature, leaving `bh=` and the rest intact.
pub fn strip_b_tag_value(value: &str) -> String {
    value
        .split(';')
        .map(|part| match part.split_once('=') {
            Some((name, _)) if name.trim() == "b" => format!("{name}="),
            _ => part.to_string(),
        })
        .collect::<Vec<_>>()
        .join(";")
}

#[cfg(test)]
mod tests {
    use super::*;
    use CanonicalizationMethod::{Relaxed, Simple};

    #[test]
    fn line_endings() {
        assert_eq!(normalize_line_endings(b"a\nb\r\nc\n"), b"a\r\nb\r\nc\r\n");
    }

    #[test]
    fn splits_folded_headers_and_body() {
        let (headers, body) = split_message(b"From: a@example.com\nSubject: hello\n\tworld\n\nbody\n");
        assert_eq!(headers.len(), 2);
        assert_eq!(headers[1].name, "Subject");
        assert_eq!(headers[1].value, b" hello\r\n\tworld");
        assert_eq!(body, b"body\r\n");
    }

    #[test]
    fn eight_bit_header_bytes_survive() {
        let (headers, _) = split_message(b"Subject: caf\xe9 \xc3 au lait\r\n\r\nbody\r\n");
        assert_eq!(headers[0].value, b" caf\xe9 \xc3 au lait");
        assert_eq!(canonicalize_header(Relaxed, &headers[0].name, &headers[0].value), b"subject:caf\xe9 \xc3 au lait");
        assert_eq!(headers[0].value_str(), " caf\u{fffd} \u{fffd} au lait");
    }

    #[test]
    fn header_canonicalization() {
        assert_eq!(canonicalize_header(Simple, "Subject", b" Hi  there "), b"Subject: Hi  there ");
        assert_eq!(
            canonicalize_header(Relaxed, "SubJect ", b" Hi \r\n\t there  "),
            b"subject:Hi there"
        );
    }

    #[test]
    fn body_canonicalization() {
        assert_eq!(canonicalize_body(Simple, b""), b"\r\n");
        assert_eq!(canonicalize_body(Relaxed, b""), b"");
        assert_eq!(canonicalize_body(Simple, b"a \r\n\r\n\r\n"), b"a \r\n");
        assert_eq!(canonicalize_body(Relaxed, b" a \t b  \r\n\r\n"), b" a b\r\n");
        assert_eq!(canonicalize_body(Relaxed, b"x"), b"x\r\n");
        assert_eq!(apply_body_length_limit(b"abcdef", Some(3)), b"abc");
        assert_eq!(apply_body_length_limit(b"ab", Some(3)), b"ab");
    }

    #[test]
    fn selection_is_bottom_up_with_oversigning() {
        let raw = [
            RawHeader { name: "From".into(), value: b" first".to_vec() },
            RawHeader { name: "To".into(), value: b" x".to_vec() },
            RawHeader { name: "from".into(), value: b" second".to_vec() },
        ];
        let refs: Vec<&RawHeader> = raw.iter().collect();
        let signed: Vec<String> = ["from", "from", "from", "cc"].iter().map(|s| s.to_string()).collect();
        let selected = select_headers(Relaxed, &signed, &refs);
        assert_eq!(selected.concat(), b"from:second\r\nfrom:first\r\nfrom:\r\ncc:\r\n");
        assert_eq!(selected.len(), 4);
    }

    #[test]
    fn strips_only_b() {
        assert_eq!(
            strip_b_tag_value(" v=1; bh=abc=; b=sig\r\n\tmore; d=x"),
            " v=1; bh=abc=; b=; d=x"
        );
    }
}

//! `Received:` trace fields (RFC 5321 §4.4).

use std::net::IpAddr;

use chrono::{DateTime, FixedOffset};
use serde::Serialize;

#[derive(Debug, Clone, Default, Serialize)]
pub struct RoutingHop {
    /// Host that wrote this field (`by`), or `from` when `by` is absent.
    pub server: String,
    pub from: String,
    pub by: String,
    pub with: String,
    /// Connecting client address from the `from` clause.
    pub ip: String,
    pub timestamp: String,
    /// Time spent since the previous (older) hop, e.g. `3s`.
    pub delay: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tls_version: Option<String>,
    #[serde(skip)]
    pub received_at: Option<DateTime<FixedOffset>>,
}

impl RoutingHop {
    pub fn ip_addr(&self) -> Option<IpAddr> {
        self.ip.parse().ok()
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Token<'a> {
    Word(&'a str),
    Comment(&'a str),
}

/// Split into words and parenthesised comments (nesting allowed).
fn tokenize(s: &str) -> Vec<Token<'_>> {
    let mut tokens = Vec::new();
    let bytes = s.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b' ' | b'\t' | b'\r' | b'\n' => i += 1,
            b'(' => {
                let start = i + 1;
                let mut depth = 1;
                i += 1;
                while i < bytes.len() && depth > 0 {
                    match bytes[i] {
                        b'(' => depth += 1,
                        b')' => depth -= 1,
                        _ => {}
                    }
                    i += 1;
                }
                let end = if depth == 0 { i - 1 } else { i };
                tokens.push(Token::Comment(&s[start..end]));
            }
            _ => {
                let start = i;
                while i < bytes.len() && !matches!(bytes[i], b' ' | b'\t' | b'\r' | b'\n' | b'(') {
                    i += 1;
                }
                tokens.push(Token::Word(&s[start..i]));
            }
        }
    }
    tokens
}

/// First address literal (`[192.0.2.1]`, `[IPv6:2001:db8::1]`) in `text`.
fn bracketed_ip(text: &str) -> Option<IpAddr> {
    let mut rest = text;
    while let Some(open) = rest.find('[') {
        let after = &rest[open + 1..];
        let close = after.find(']')?;
        let literal = &after[..close];
        let literal = literal
            .strip_prefix("IPv6:")
            .or_else(|| literal.strip_prefix("ipv6:"))
            .unwrap_or(literal);
        if let Ok(ip) = literal.parse() {
            return Some(ip);
        }
        rest = &after[close + 1..];
    }
    None
}

/// `version=TLS1_3` (Gmail/Exim) or `using TLSv1.3` (Postfix).
fn tls_version(comment: &str) -> Option<String> {
    let words: Vec<&str> = comment.split_whitespace().collect();
    words.iter().enumerate().find_map(|(i, w)| {
        if let Some(v) = w.strip_prefix("version=") {
            return Some(v.trim_end_matches([',', ')']).to_string());
        }
        if w.eq_ignore_ascii_case("using") {
            return words.get(i + 1).filter(|n| n.starts_with("TLS")).map(|n| n.to_string());
        }
        None
    })
}

fn strip_comments(s: &str) -> String {
    tokenize(s)
        .into_iter()
        .filter_map(|t| match t {
            Token::Word(w) => Some(w),
            Token::Comment(_) => None,
        })
        .collect::<Vec<_>>()
        .join(" ")
}

pub fn parse_timestamp(s: &str) -> Option<DateTime<FixedOffset>> {
    let cleaned = strip_comments(s);
    DateTime::parse_from_rfc2822(cleaned.trim()).ok()
}

/// Parse one unfolded `Received:` value.
pub fn parse_received(value: &str) -> RoutingHop {
    let (clauses, date) = match value.rfind(';') {
        Some(pos) => (&value[..pos], value[pos + 1..].trim()),
        None => (value, ""),
    };

    let mut hop = RoutingHop::default();
    let mut clause = "";
    let mut from_comments: Vec<&str> = Vec::new();
    for token in tokenize(clauses) {
        match token {
            Token::Word(w) => {
                let lower = w.to_ascii_lowercase();
                if matches!(lower.as_str(), "from" | "by" | "via" | "with" | "id" | "for") {
                    clause = match lower.as_str() {
                        "from" => "from",
                        "by" => "by",
                        "with" => "with",
                        _ => "",
                    };
                    continue;
                }
                let slot = match clause {
                    "from" => &mut hop.from,
                    "by" => &mut hop.by,
                    "with" => &mut hop.with,
                    _ => continue,
                };
                if slot.is_empty() {
                    *slot = w.trim_end_matches(';').to_string();
                }
            }
            Token::Comment(c) => {
                if clause == "from" {
                    from_comments.push(c);
                }
                if hop.tls_version.is_none() {
                    hop.tls_version = tls_version(c);
                }
            }
        }
    }

    hop.ip = from_comments
        .iter()
        .find_map(|c| bracketed_ip(c))
        .or_else(|| bracketed_ip(&hop.from))
        .map(|ip| ip.to_string())
        .unwrap_or_default();
    hop.server = if hop.by.is_empty() { hop.from.clone() } else { hop.by.clone() };
    hop.timestamp = date.to_string();
    hop.received_at = parse_timestamp(date);
    hop
}

/// Set each hop's `delay` from the hop below it (the older one).
pub fn fill_delays(hops: &mut [RoutingHop]) {
    let times: Vec<Option<DateTime<FixedOffset>>> = hops.iter().map(|h| h.received_at).collect();
    for (i, hop) in hops.iter_mut().enumerate() {
        hop.delay = match (times[i], times.get(i + 1).copied().flatten()) {
            (Some(this), Some(older)) => format!("{}s", (this - older).num_seconds()),
            (Some(_), None) if i + 1 == times.len() => "0s".to_string(),
            _ => String::new(),
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn postfix_style_hop() {
        let hop = parse_received(
            "from mail.example.org (mail.example.org [8.8.8.8]) (using TLSv1.3 with cipher \
             TLS_AES_256_GCM_SHA384 (256/256 bits)) by mx.example.com (Postfix) with ESMTPS id 4F1; \
             Tue, 4 Jun 2024 09:15:00 -0700 (PDT)",
        );
        assert_eq!(hop.from, "mail.example.org");
        assert_eq!(hop.by, "mx.example.com");
        assert_eq!(hop.server, "mx.example.com");
        assert_eq!(hop.with, "ESMTPS");
        assert_eq!(hop.ip, "8.8.8.8");
        assert_eq!(hop.tls_version.as_deref(), Some("TLSv1.3"));
        assert_eq!(hop.received_at.unwrap().timestamp(), 1_717_517_700);
    }

    #[test]
    fn ipv6_literal_and_missing_parts() {
        let hop = parse_received("from User-PC ([IPv6:2001:db8::1]) by relay.example with SMTP");
        assert_eq!(hop.ip, "2001:db8::1");
        assert!(hop.received_at.is_none());
        assert_eq!(hop.timestamp, "");

        let hop = parse_received("by localhost with LMTP; garbage date");
        assert_eq!(hop.from, "");
        assert_eq!(hop.server, "localhost");
        assert!(hop.received_at.is_none());
    }

    #[test]
    fn delays_between_hops() {
        let mut hops = vec![
            parse_received("by c; Mon, 03 Jun 2024 10:00:05 +0000"),
            parse_received("by b; Mon, 03 Jun 2024 12:00:02 +0200"),
            parse_received("by a; Mon, 03 Jun 2024 10:00:00 +0000"),
        ];
        fill_delays(&mut hops);
        assert_eq!(hops[0].delay, "3s");
        assert_eq!(hops[1].delay, "2s");
        assert_eq!(hops[2].delay, "0s");
    }
}

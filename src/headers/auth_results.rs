//! `Authentication-Results:` (RFC 8601) and `Received-SPF:` (RFC 7208 §9.1)
//! as claimed by upstream receivers.

use std::collections::BTreeMap;

use serde::Serialize;

use super::parser::HeaderBlock;
use crate::common::domain::domain_from_address;

/// One `method=result` statement.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AuthResultRecord {
    pub method: String,
    pub result: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    /// `ptype.property` to value, e.g. `smtp.mailfrom`.
    pub properties: BTreeMap<String, String>,
    /// Header the record came from.
    pub source: String,
}

impl AuthResultRecord {
    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SpfClaim {
    pub status: String,
    pub details: String,
    pub domain: String,
    pub client_ip: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DkimClaim {
    pub status: String,
    pub selector: String,
    pub domain: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DmarcClaim {
    pub status: String,
    pub policy: String,
    pub alignment: String,
    pub from_domain: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct AuthenticationSummary {
    pub authserv_id: String,
    pub spf: SpfClaim,
    pub dkim: DkimClaim,
    pub dmarc: DmarcClaim,
    pub records: Vec<AuthResultRecord>,
}

/// Split on `sep` outside comments and quoted strings.
fn split_top_level(s: &str, sep: char) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut quoted = false;
    let mut start = 0;
    for (i, c) in s.char_indices() {
        match c {
            '"' => quoted = !quoted,
            '(' if !quoted => depth += 1,
            ')' if !quoted => depth = depth.saturating_sub(1),
            c if c == sep && depth == 0 && !quoted => {
                parts.push(&s[start..i]);
                start = i + c.len_utf8();
            }
            _ => {}
        }
    }
    parts.push(&s[start..]);
    parts
}

/// Separate comment text from the remaining words of a statement.
fn comments_and_words(s: &str) -> (Option<String>, Vec<String>) {
    let mut comments = Vec::new();
    let mut plain = String::new();
    let mut comment = String::new();
    let mut depth = 0usize;
    let mut quoted = false;
    for c in s.chars() {
        match c {
            '"' if depth == 0 => {
                quoted = !quoted;
                plain.push(c);
            }
            '(' if !quoted => {
                if depth > 0 {
                    comment.push(c);
                }
                depth += 1;
            }
            ')' if !quoted && depth > 0 => {
                depth -= 1;
                if depth == 0 {
                    comments.push(comment.trim().to_string());
                    comment.clear();
                    plain.push(' ');
                } else {
                    comment.push(c);
                }
            }
            _ if depth > 0 => comment.push(c),
            _ => plain.push(c),
        }
    }
    let words = split_words(&plain);
    let comment = (!comments.is_empty()).then(|| comments.join("; "));
    (comment, words)
}

/// Whitespace split that keeps quoted values (`reason="a b"`) whole.
fn split_words(s: &str) -> Vec<String> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    for c in s.chars() {
        match c {
            '"' => quoted = !quoted,
            c if c.is_whitespace() && !quoted => {
                if !current.is_empty() {
                    words.push(std::mem::take(&mut current));
                }
            }
            c => current.push(c),
        }
    }
    if !current.is_empty() {
        words.push(current);
    }
    words
}

fn parse_statement(statement: &str, source: &str) -> Option<AuthResultRecord> {
    let (comment, words) = comments_and_words(statement);
    let mut words = words.into_iter();
    let (method, result) = words.next()?.split_once('=').map(|(m, r)| (m.to_string(), r.to_string()))?;
    // method may carry a version: "dkim/1"
    let method = method.split('/').next().unwrap_or_default().trim().to_ascii_lowercase();
    if method.is_empty() {
        return None;
    }
    let mut record = AuthResultRecord {
        method,
        result: result.to_ascii_lowercase(),
        comment,
        source: source.to_string(),
        ..Default::default()
    };
    for word in words {
        let Some((key, value)) = word.split_once('=') else {
            continue;
        };
        if key.eq_ignore_ascii_case("reason") {
            record.reason = Some(value.to_string());
        } else {
            record.properties.insert(key.to_ascii_lowercase(), value.to_string());
        }
    }
    Some(record)
}

/// Parse one `Authentication-Results:` value into its authserv-id and records.
pub fn parse_authentication_results(value: &str) -> (String, Vec<AuthResultRecord>) {
    let mut parts = split_top_level(value, ';').into_iter();
    // authserv-id may be followed by a version number
    let authserv_id = parts
        .next()
        .and_then(|p| comments_and_words(p).1.into_iter().next())
        .unwrap_or_default();
    let records = parts.filter_map(|p| parse_statement(p, "Authentication-Results")).collect();
    (authserv_id, records)
}

/// `Received-SPF: pass (comment) client-ip=192.0.2.1; envelope-from=a@b`.
pub fn parse_received_spf(value: &str) -> Option<AuthResultRecord> {
    let (comment, words) = comments_and_words(value);
    let mut words = words.into_iter();
    let result = words.next()?.trim_end_matches(';').to_ascii_lowercase();
    let mut record = AuthResultRecord {
        method: "spf".to_string(),
        result,
        comment,
        source: "Received-SPF".to_string(),
        ..Default::default()
    };
    for word in words {
        if let Some((key, value)) = word.trim_end_matches(';').split_once('=') {
            record.properties.insert(key.to_ascii_lowercase(), value.to_string());
        }
    }
    Some(record)
}

/// `designates 192.0.2.1 as permitted sender` style comments.
fn ip_in_comment(comment: &str) -> Option<String> {
    comment
        .split(|c: char| c.is_whitespace() || c == ',' || c == ';')
        .find(|w| w.parse::<std::net::IpAddr>().is_ok())
        .map(str::to_string)
}

fn policy_in_comment(comment: &str) -> Option<String> {
    comment
        .split_whitespace()
        .find_map(|w| w.strip_prefix("p=").or_else(|| w.strip_prefix("P=")))
        .map(|p| p.trim_end_matches([',', ';']).to_ascii_lowercase())
}

fn spf_claim(record: &AuthResultRecord) -> SpfClaim {
    let sender = record
        .property("smtp.mailfrom")
        .or_else(|| record.property("envelope-from"))
        .or_else(|| record.property("smtp.helo"))
        .unwrap_or_default();
    let domain = domain_from_address(sender).unwrap_or_else(|| sender.trim_matches(['<', '>']).to_string());
    let client_ip = record
        .property("client-ip")
        .or_else(|| record.property("smtp.remote-ip"))
        .map(str::to_string)
        .or_else(|| record.comment.as_deref().and_then(ip_in_comment))
        .unwrap_or_default();
    let details = record.comment.clone().unwrap_or_else(|| {
        record
            .properties
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(" ")
    });
    SpfClaim {
        status: record.result.clone(),
        details,
        domain,
        client_ip,
    }
}

fn dkim_claim(record: &AuthResultRecord) -> DkimClaim {
    let domain = record
        .property("header.d")
        .map(|d| d.to_ascii_lowercase())
        .or_else(|| record.property("header.i").and_then(domain_from_address))
        .unwrap_or_default();
    DkimClaim {
        status: record.result.clone(),
        selector: record.property("header.s").unwrap_or_default().to_string(),
        domain,
    }
}

fn dmarc_claim(record: &AuthResultRecord) -> DmarcClaim {
    let alignment = match record.result.as_str() {
        "pass" => "aligned",
        "fail" => "not aligned",
        _ => "",
    };
    DmarcClaim {
        status: record.result.clone(),
        policy: record.comment.as_deref().and_then(policy_in_comment).unwrap_or_default(),
        alignment: alignment.to_string(),
        from_domain: record.property("header.from").unwrap_or_default().to_ascii_lowercase(),
    }
}

/// Collect every record and pick the topmost claim per mechanism.
pub fn summarize(block: &HeaderBlock) -> AuthenticationSummary {
    let mut summary = AuthenticationSummary::default();
    for value in block.get_all("Authentication-Results") {
        let (authserv_id, records) = parse_authentication_results(value);
        if summary.authserv_id.is_empty() {
            summary.authserv_id = authserv_id;
        }
        summary.records.extend(records);
    }
    if !summary.records.iter().any(|r| r.method == "spf") {
        summary.records.extend(block.get_all("Received-SPF").filter_map(parse_received_spf));
    }

    if let Some(r) = summary.records.iter().find(|r| r.method == "spf") {
        summary.spf = spf_claim(r);
    }
    if let Some(r) = summary.records.iter().find(|r| r.method == "dkim") {
        summary.dkim = dkim_claim(r);
    }
    if let Some(r) = summary.records.iter().find(|r| r.method == "dmarc") {
        summary.dmarc = dmarc_claim(r);
    }
    summary
}

#[cfg(test)]
mod tests {
    use super::*;

    const GMAIL: &str = "mx.google.com; \
        dkim=pass header.i=@example.com header.s=20230601 header.b=AbCd; \
        spf=pass (google.com: domain of bounce@mail.example.com designates 209.85.220.41 as permitted sender) smtp.mailfrom=bounce@mail.example.com; \
        dmarc=pass (p=REJECT sp=NONE dis=NONE) header.from=example.com";

    #[test]
    fn parses_records_and_authserv_id() {
        let (id, records) = parse_authentication_results(GMAIL);
        assert_eq!(id, "mx.google.com");
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].method, "dkim");
        assert_eq!(records[0].property("header.s"), Some("20230601"));
        assert_eq!(records[1].result, "pass");
        assert!(records[1].comment.as_deref().unwrap().contains("designates"));
        assert_eq!(records[2].property("header.from"), Some("example.com"));
    }

    #[test]
    fn summary_picks_claims() {
        let block = HeaderBlock::parse(&format!("Authentication-Results: {GMAIL}\r\n"));
        let s = summarize(&block);
        assert_eq!(s.spf.status, "pass");
        assert_eq!(s.spf.domain, "mail.example.com");
        assert_eq!(s.spf.client_ip, "209.85.220.41");
        assert_eq!(s.dkim.domain, "example.com");
        assert_eq!(s.dkim.selector, "20230601");
        assert_eq!(s.dmarc.policy, "reject");
        assert_eq!(s.dmarc.alignment, "aligned");
        assert_eq!(s.dmarc.from_domain, "example.com");
    }

    #[test]
    fn reason_and_version_and_none() {
        let (id, records) = parse_authentication_results(
            "example.org 1; dkim/1=fail reason=\"signature verification failed\" header.d=example.net",
        );
        assert_eq!(id, "example.org");
        assert_eq!(records[0].method, "dkim");
        assert_eq!(records[0].result, "fail");
        assert_eq!(records[0].reason.as_deref(), Some("signature verification failed"));

        let (_, records) = parse_authentication_results("example.org; none");
        assert!(records.is_empty());
    }

    #[test]
    fn received_spf_fallback() {
        let block = HeaderBlock::parse(
            "Received-SPF: softfail (example.com: transitioning domain) client-ip=192.0.2.10; envelope-from=\"user@example.com\"; helo=mail.example.com;\r\n",
        );
        let s = summarize(&block);
        assert_eq!(s.records.len(), 1);
        assert_eq!(s.records[0].source, "Received-SPF");
        assert_eq!(s.spf.status, "softfail");
        assert_eq!(s.spf.client_ip, "192.0.2.10");
        assert_eq!(s.spf.domain, "example.com");
        assert_eq!(s.dkim.status, "");
    }
}

//! Raw header block to structured bundle. Never fails: anything missing is
//! left empty.

use std::collections::BTreeMap;

use serde::Serialize;

use super::auth_results::{summarize, AuthenticationSummary};
use super::received::{fill_delays, parse_received, RoutingHop};

/// One unfolded header field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderField {
    pub name: String,
    pub value: String,
}

/// Header fields in the order they appear (top of the block first).
#[derive(Debug, Clone, Default)]
pub struct HeaderBlock {
    pub fields: Vec<HeaderField>,
}

impl HeaderBlock {
    /// Parse a header block. Continuation lines are joined with a single
    /// space; parsing stops at the first empty line so a whole message may
    /// be pasted.
    pub fn parse(raw: &str) -> Self {
        let mut fields: Vec<HeaderField> = Vec::new();
        for line in raw.lines() {
            let line = line.strip_suffix('\r').unwrap_or(line);
            if line.trim().is_empty() {
                if fields.is_empty() {
                    continue;
                }
                break;
            }
            if line.starts_with([' ', '\t']) {
                if let Some(last) = fields.last_mut() {
                    if !last.value.is_empty() {
                        last.value.push(' ');
                    }
                    last.value.push_str(line.trim());
                }
                continue;
            }
            // mbox "From " separator and other junk lines
            let Some((name, value)) = line.split_once(':') else {
                continue;
            };
            if name.is_empty() || name.contains(char::is_whitespace) {
                continue;
            }
            fields.push(HeaderField {
                name: name.to_string(),
                value: value.trim().to_string(),
            });
        }
        Self { fields }
    }

    /// First field named `name`, case-insensitively.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.get_all(name).next()
    }

    pub fn get_all<'a, 'n>(&'a self, name: &'n str) -> impl Iterator<Item = &'a str> + 'n
    where
        'a: 'n,
    {
        self.fields
            .iter()
            .filter(move |f| f.name.eq_ignore_ascii_case(name))
            .map(|f| f.value.as_str())
    }
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EmailSummary {
    pub from: String,
    pub to: String,
    pub subject: String,
    pub date: String,
    pub message_id: String,
    pub return_path: String,
}

/// Which end of `routing` is the newest hop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingOrder {
    /// Header order: each relay prepends its `Received:` line.
    MostRecentFirst,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SecurityMetadata {
    pub tls: bool,
    pub encryption: String,
    pub spam_score: Option<f64>,
    pub virus_scan: String,
    pub phishing_check: String,
}

/// Immutable snapshot of one header parse.
#[derive(Debug, Clone, Serialize)]
pub struct EmailHeaderBundle {
    pub summary: EmailSummary,
    pub routing: Vec<RoutingHop>,
    pub routing_order: RoutingOrder,
    pub authentication: AuthenticationSummary,
    pub security: SecurityMetadata,
    pub metadata: BTreeMap<String, String>,
}

impl EmailHeaderBundle {
    /// Hops oldest first, for path reconstruction.
    pub fn path(&self) -> impl Iterator<Item = &RoutingHop> {
        self.routing.iter().rev()
    }
}

const METADATA_FIELDS: &[&str] = &[
    "User-Agent",
    "X-Mailer",
    "X-Originating-IP",
    "MIME-Version",
    "Content-Type",
    "List-Unsubscribe",
    "X-Priority",
];

fn security(block: &HeaderBlock, hops: &[RoutingHop], auth: &AuthenticationSummary) -> SecurityMetadata {
    let encryption = hops
        .iter()
        .find_map(|h| h.tls_version.clone())
        .or_else(|| {
            hops.iter()
                .any(|h| h.with.to_ascii_uppercase().starts_with("ESMTPS"))
                .then(|| "TLS".to_string())
        });

    let spam_score = block
        .get("X-Spam-Score")
        .and_then(|v| v.split_whitespace().next()?.parse::<f64>().ok())
        .or_else(|| {
            let status = block.get("X-Spam-Status")?;
            let pos = status.find("score=")?;
            let rest = &status[pos + 6..];
            let end = rest.find(|c: char| !(c.is_ascii_digit() || c == '.' || c == '-')).unwrap_or(rest.len());
            rest[..end].parse::<f64>().ok()
        });

    let virus_scan = block
        .get("X-Virus-Status")
        .or_else(|| block.get("X-Virus-Scanned"))
        .map(str::to_string)
        .unwrap_or_else(|| "not scanned".to_string());

    let phishing_check = match auth.dmarc.status.as_str() {
        "pass" => "pass",
        "fail" => "fail",
        _ if auth.spf.status == "fail" || auth.dkim.status == "fail" => "suspicious",
        _ => "not checked",
    }
    .to_string();

    SecurityMetadata {
        tls: encryption.is_some(),
        encryption: encryption.unwrap_or_else(|| "none".to_string()),
        spam_score,
        virus_scan,
        phishing_check,
    }
}

/// Parse a raw header block. Header-only facts: no network access.
pub fn analyze_headers(raw: &str) -> EmailHeaderBundle {
    let block = HeaderBlock::parse(raw);
    let text = |name: &str| block.get(name).unwrap_or_default().to_string();

    let mut routing: Vec<RoutingHop> = block.get_all("Received").map(parse_received).collect();
    fill_delays(&mut routing);
    let authentication = summarize(&block);

    let metadata = METADATA_FIELDS
        .iter()
        .filter_map(|name| block.get(name).map(|v| (name.to_string(), v.to_string())))
        .collect();

    EmailHeaderBundle {
        summary: EmailSummary {
            from: text("From"),
            to: text("To"),
            subject: text("Subject"),
            date: text("Date"),
            message_id: text("Message-ID"),
            return_path: text("Return-Path"),
        },
        security: security(&block, &routing, &authentication),
        routing,
        routing_order: RoutingOrder::MostRecentFirst,
        authentication,
        metadata,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "Received: from mail.sender.example (mail.sender.example [203.0.113.5])\r\n\
        \tby mx.receiver.example with ESMTPS id abc123\r\n\
        \t(version=TLS1_3 cipher=TLS_AES_256_GCM_SHA384);\r\n\
        \tMon, 03 Jun 2024 10:00:05 +0000\r\n\
        Received: from laptop (cpe.example.net [198.51.100.7])\r\n\
        \tby mail.sender.example with ESMTPSA id def456; Mon, 03 Jun 2024 10:00:02 +0000\r\n\
        Received: by laptop with HTTP; Mon, 03 Jun 2024 10:00:00 +0000\r\n\
        FROM: Alice <alice@sender.example>\r\n\
        to: bob@receiver.example\r\n\
        Subject: Quarterly\r\n\
        \treport\r\n\
        Message-ID: <1@sender.example>\r\n\
        X-Mailer: Thunderbird\r\n\
        X-Spam-Status: No, score=-0.1 required=5.0\r\n\
        Authentication-Results: mx.receiver.example;\r\n\
        \tspf=pass smtp.mailfrom=sender.example;\r\n\
        \tdkim=pass header.d=sender.example header.s=s1;\r\n\
        \tdmarc=pass (p=REJECT) header.from=sender.example\r\n\
        \r\n\
        body text: not a header\r\n";

    #[test]
    fn summary_is_case_insensitive_and_unfolded() {
        let bundle = analyze_headers(SAMPLE);
        assert_eq!(bundle.summary.from, "Alice <alice@sender.example>");
        assert_eq!(bundle.summary.to, "bob@receiver.example");
        assert_eq!(bundle.summary.subject, "Quarterly report");
        assert_eq!(bundle.summary.message_id, "<1@sender.example>");
        assert_eq!(bundle.summary.return_path, "");
        assert_eq!(bundle.summary.date, "");
    }

    #[test]
    fn three_received_lines_keep_header_order() {
        let bundle = analyze_headers(SAMPLE);
        assert_eq!(bundle.routing.len(), 3);
        assert_eq!(bundle.routing_order, RoutingOrder::MostRecentFirst);
        assert_eq!(bundle.routing[0].by, "mx.receiver.example");
        assert_eq!(bundle.routing[1].by, "mail.sender.example");
        assert_eq!(bundle.routing[2].by, "laptop");
        let path: Vec<&str> = bundle.path().map(|h| h.by.as_str()).collect();
        assert_eq!(path, vec!["laptop", "mail.sender.example", "mx.receiver.example"]);
        let json = serde_json::to_value(&bundle).unwrap();
        assert_eq!(json["routing_order"], "most_recent_first");
        assert_eq!(json["summary"]["messageId"], "<1@sender.example>");
    }

    #[test]
    fn security_and_metadata() {
        let bundle = analyze_headers(SAMPLE);
        assert!(bundle.security.tls);
        assert_eq!(bundle.security.encryption, "TLS1_3");
        assert_eq!(bundle.security.spam_score, Some(-0.1));
        assert_eq!(bundle.security.phishing_check, "pass");
        assert_eq!(bundle.metadata.get("X-Mailer").map(String::as_str), Some("Thunderbird"));
        assert!(!bundle.metadata.contains_key("body text"));
    }

    #[test]
    fn garbage_input_yields_empty_bundle() {
        let bundle = analyze_headers("this is not a header block\nneither is this");
        assert!(bundle.routing.is_empty());
        assert_eq!(bundle.summary.from, "");
        assert!(!bundle.security.tls);
        assert_eq!(bundle.authentication.spf.status, "");
    }
}

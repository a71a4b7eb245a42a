//! SMTP replies (RFC 5321 §4.2) and EHLO capabilities.

use std::fmt;

use thiserror::Error;

use crate::error::{ErrorKind, InspectError};

pub const MAX_REPLY_LINES: usize = 128;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReplyError {
    #[error("malformed reply line {0:?}")]
    Malformed(String),
    #[error("reply lines carry different codes ({0} then {1})")]
    MixedCodes(u16, u16),
    #[error("empty reply")]
    Empty,
}

impl From<ReplyError> for InspectError {
    fn from(e: ReplyError) -> Self {
        InspectError::new(ErrorKind::ProtocolViolation, e.to_string())
    }
}

/// A complete, possibly multi-line, reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub code: u16,
    /// Text after the code and separator, one entry per line.
    pub lines: Vec<String>,
}

/// True when `line` continues a multi-line reply (`250-...`).
pub fn is_continuation(line: &str) -> bool {
    line.as_bytes().get(3) == Some(&b'-')
}

fn parse_line(line: &str) -> Result<(u16, &str), ReplyError> {
    let bytes = line.as_bytes();
    if bytes.len() < 3 || !bytes[..3].iter().all(u8::is_ascii_digit) {
        return Err(ReplyError::Malformed(line.to_string()));
    }
    let code: u16 = line[..3].parse().map_err(|_| ReplyError::Malformed(line.to_string()))?;
    if !(200..=599).contains(&code) {
        return Err(ReplyError::Malformed(line.to_string()));
    }
    match bytes.get(3) {
        None => Ok((code, "")),
        Some(b' ') | Some(b'-') => Ok((code, &line[4..])),
        Some(_) => Err(ReplyError::Malformed(line.to_string())),
    }
}

impl Reply {
    /// Build a reply from raw lines (CRLF already stripped).
    pub fn parse<S: AsRef<str>>(raw: &[S]) -> Result<Self, ReplyError> {
        let mut code = None;
        let mut lines = Vec::with_capacity(raw.len());
        for line in raw {
            let (c, text) = parse_line(line.as_ref())?;
            match code {
                None => code = Some(c),
                Some(first) if first != c => return Err(ReplyError::MixedCodes(first, c)),
                Some(_) => {}
            }
            lines.push(text.to_string());
        }
        Ok(Self {
            code: code.ok_or(ReplyError::Empty)?,
            lines,
        })
    }

    pub fn is_positive_completion(&self) -> bool {
        (200..300).contains(&self.code)
    }

    pub fn is_intermediate(&self) -> bool {
        (300..400).contains(&self.code)
    }

    pub fn is_transient_failure(&self) -> bool {
        (400..500).contains(&self.code)
    }

    pub fn is_permanent_failure(&self) -> bool {
        (500..600).contains(&self.code)
    }

    /// All text joined with spaces.
    pub fn text(&self) -> String {
        self.lines.join(" ")
    }

    /// Lines as sent by the server, `250-` on all but the last.
    pub fn raw_lines(&self) -> Vec<String> {
        let last = self.lines.len().saturating_sub(1);
        self.lines
            .iter()
            .enumerate()
            .map(|(i, text)| {
                let sep = if i == last { ' ' } else { '-' };
                format!("{}{sep}{text}", self.code)
            })
            .collect()
    }
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.code, self.text())
    }
}

/// Extensions advertised in an EHLO reply.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Capabilities {
    /// First line: the server's greeting name.
    pub domain: String,
    pub starttls: bool,
    pub auth: Vec<String>,
    pub size: Option<u64>,
    /// Every extension keyword, uppercased.
    pub extensions: Vec<String>,
}

impl Capabilities {
    pub fn from_ehlo(reply: &Reply) -> Self {
        let mut caps = Capabilities {
            domain: reply
                .lines
                .first()
                .and_then(|l| l.split_whitespace().next())
                .unwrap_or_default()
                .to_string(),
            ..Default::default()
        };
        for line in reply.lines.iter().skip(1) {
            let mut words = line.split_whitespace();
            let Some(keyword) = words.next() else {
                continue;
            };
            let keyword = keyword.to_ascii_uppercase();
            // pre-RFC 4954 servers advertise "AUTH=PLAIN LOGIN"
            let (keyword, first_arg) = match keyword.split_once('=') {
                Some((k, v)) => (k.to_string(), Some(v.to_string())),
                None => (keyword, None),
            };
            match keyword.as_str() {
                "STARTTLS" => caps.starttls = true,
                "AUTH" => {
                    for mech in first_arg.into_iter().chain(words.map(str::to_string)) {
                        let mech = mech.to_ascii_uppercase();
                        if !caps.auth.contains(&mech) {
                            caps.auth.push(mech);
                        }
                    }
                }
                "SIZE" => caps.size = words.next().and_then(|n| n.parse().ok()),
                _ => {}
            }
            if !caps.extensions.contains(&keyword) {
                caps.extensions.push(keyword);
            }
        }
        caps
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn multiline_reply() {
        let r = Reply::parse(&["250-mx.example.com Hello", "250-SIZE 35882577", "250 STARTTLS"]).unwrap();
        assert_eq!(r.code, 250);
        assert!(r.is_positive_completion());
        assert_eq!(r.lines, vec!["mx.example.com Hello", "SIZE 35882577", "STARTTLS"]);
        assert_eq!(r.raw_lines(), vec!["250-mx.example.com Hello", "250-SIZE 35882577", "250 STARTTLS"]);
        assert_eq!(Reply::parse(&["221"]).unwrap().lines, vec![""]);
    }

    #[test]
    fn malformed_replies() {
        assert_eq!(
            Reply::parse(&["hello there"]),
            Err(ReplyError::Malformed("hello there".into()))
        );
        assert!(matches!(Reply::parse(&["250x"]), Err(ReplyError::Malformed(_))));
        assert!(matches!(Reply::parse(&["099 nope"]), Err(ReplyError::Malformed(_))));
        assert_eq!(Reply::parse(&["250-a", "251 b"]), Err(ReplyError::MixedCodes(250, 251)));
        assert_eq!(Reply::parse::<&str>(&[]), Err(ReplyError::Empty));
        assert!(is_continuation("250-x"));
        assert!(!is_continuation("250 x"));
    }

    #[test]
    fn ehlo_capabilities() {
        let r = Reply::parse(&[
            "250-smtp.example.com at your service",
            "250-SIZE 35882577",
            "250-8BITMIME",
            "250-AUTH LOGIN PLAIN XOAUTH2",
            "250-AUTH=LOGIN",
            "250-starttls",
            "250 PIPELINING",
        ])
        .unwrap();
        let caps = Capabilities::from_ehlo(&r);
        assert_eq!(caps.domain, "smtp.example.com");
        assert!(caps.starttls);
        assert_eq!(caps.size, Some(35_882_577));
        assert_eq!(caps.auth, vec!["LOGIN", "PLAIN", "XOAUTH2"]);
        assert_eq!(caps.extensions, vec!["SIZE", "8BITMIME", "AUTH", "STARTTLS", "PIPELINING"]);
    }
}

//! `tag=value; tag=value` lists shared by DKIM-Signature headers and key
//! records (RFC 6376 §3.2).

use base64::Engine;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DkimParseError {
    #[error("missing required tag: {0}")]
    MissingTag(&'static str),
    #[error("duplicate tag: {0}")]
    DuplicateTag(String),
    #[error("invalid base64 in {0}= tag")]
    InvalidBase64(&'static str),
    #[error("invalid {tag}= value: {value}")]
    InvalidValue { tag: &'static str, value: String },
    #[error("{0}")]
    Malformed(String),
}

/// Parsed tag list. Names are kept in record order; duplicates are rejected.
#[derive(Debug, Clone, Default)]
pub struct TagList {
    tags: Vec<(String, String)>,
}

impl TagList {
    pub fn parse(input: &str) -> Result<Self, DkimParseError> {
        let mut tags: Vec<(String, String)> = Vec::new();
        for part in unfold(input).split(';') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            let Some((name, value)) = part.split_once('=') else {
                return Err(DkimParseError::Malformed(format!("tag without '=': {part}")));
            };
            let name = name.trim();
            if tags.iter().any(|(n, _)| n == name) {
                return Err(DkimParseError::DuplicateTag(name.to_string()));
            }
            tags.push((name.to_string(), value.trim().to_string()));
        }
        Ok(Self { tags })
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn require(&self, name: &'static str) -> Result<&str, DkimParseError> {
        self.get(name).ok_or(DkimParseError::MissingTag(name))
    }

    /// Parse an optional numeric tag.
    pub fn number(&self, name: &'static str) -> Result<Option<u64>, DkimParseError> {
        self.get(name)
            .map(|v| {
                v.parse::<u64>().map_err(|_| DkimParseError::InvalidValue {
                    tag: name,
                    value: v.to_string(),
                })
            })
            .transpose()
    }

    /// Decode a base64 tag, ignoring embedded whitespace.
    pub fn base64(&self, name: &'static str) -> Result<Option<Vec<u8>>, DkimParseError> {
        self.get(name).map(|v| decode_base64(name, v)).transpose()
    }

    /// Colon-separated list tag (`h=`, `s=`, `t=`).
    pub fn list(&self, name: &str) -> Option<Vec<String>> {
        self.get(name).map(|v| {
            v.split(':')
                .map(|p| p.trim().to_string())
                .filter(|p| !p.is_empty())
                .collect()
        })
    }
}

pub fn decode_base64(tag: &'static str, value: &str) -> Result<Vec<u8>, DkimParseError> {
    let cleaned: String = value.chars().filter(|c| !c.is_ascii_whitespace()).collect();
    base64::engine::general_purpose::STANDARD
        .decode(cleaned.as_bytes())
        .map_err(|_| DkimParseError::InvalidBase64(tag))
}

/// Drop CRLF (or bare LF) that precedes folding whitespace.
fn unfold(s: &str) -> String {
    s.replace("\r\n ", " ")
        .replace("\r\n\t", "\t")
        .replace("\n ", " ")
        .replace("\n\t", "\t")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_folded_list() {
        let tags = TagList::parse("v=1; a=rsa-sha256;\r\n\td=example.com; h=from:to ;\r\n s=sel").unwrap();
        assert_eq!(tags.get("d"), Some("example.com"));
        assert_eq!(tags.list("h"), Some(vec!["from".to_string(), "to".to_string()]));
        assert_eq!(tags.get("s"), Some("sel"));
        assert_eq!(tags.get("x"), None);
    }

    #[test]
    fn rejects_duplicates_and_bare_words() {
        assert_eq!(
            TagList::parse("k=rsa; k=ed25519").unwrap_err(),
            DkimParseError::DuplicateTag("k".into())
        );
        assert!(matches!(TagList::parse("v=1; garbage"), Err(DkimParseError::Malformed(_))));
    }

    #[test]
    fn base64_ignores_whitespace() {
        let tags = TagList::parse("p=aGVs bG8=").unwrap();
        assert_eq!(tags.base64("p").unwrap(), Some(b"hello".to_vec()));
        let tags = TagList::parse("p=!!!").unwrap();
        assert_eq!(tags.base64("p"), Err(DkimParseError::InvalidBase64("p")));
    }

    #[test]
    fn numeric_tags() {
        let tags = TagList::parse("t=1700000000; l=abc").unwrap();
        assert_eq!(tags.number("t").unwrap(), Some(1_700_000_000));
        assert!(tags.number("l").is_err());
        assert_eq!(tags.number("x").unwrap(), None);
    }
}

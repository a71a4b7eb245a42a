//! DKIM-Signature header parsing

use serde::Serialize;

use super::key::KeyAlgorithm;
use super::tags::{DkimParseError, TagList};

/// Signing algorithm (`a=`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Algorithm {
    RsaSha1,
    RsaSha256,
    Ed25519Sha256,
}

impl Algorithm {
    pub fn parse(s: &str) -> Result<Self, DkimParseError> {
        match s.to_ascii_lowercase().as_str() {
            "rsa-sha1" => Ok(Algorithm::RsaSha1),
            "rsa-sha256" => Ok(Algorithm::RsaSha256),
            "ed25519-sha256" => Ok(Algorithm::Ed25519Sha256),
            _ => Err(DkimParseError::InvalidValue { tag: "a", value: s.to_string() }),
        }
    }

    pub fn hash(&self) -> HashAlgorithm {
        match self {
            Algorithm::RsaSha1 => HashAlgorithm::Sha1,
            Algorithm::RsaSha256 | Algorithm::Ed25519Sha256 => HashAlgorithm::Sha256,
        }
    }

    pub fn key_algorithm(&self) -> KeyAlgorithm {
        match self {
            Algorithm::RsaSha1 | Algorithm::RsaSha256 => KeyAlgorithm::Rsa,
            Algorithm::Ed25519Sha256 => KeyAlgorithm::Ed25519,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HashAlgorithm {
    Sha1,
    Sha256,
}

impl HashAlgorithm {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "sha1" => Some(HashAlgorithm::Sha1),
            "sha256" => Some(HashAlgorithm::Sha256),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CanonicalizationMethod {
    #[default]
    Simple,
    Relaxed,
}

impl CanonicalizationMethod {
    fn parse(s: &str) -> Result<Self, DkimParseError> {
        match s.to_ascii_lowercase().as_str() {
            "simple" => Ok(CanonicalizationMethod::Simple),
            "relaxed" => Ok(CanonicalizationMethod::Relaxed),
            _ => Err(DkimParseError::InvalidValue { tag: "c", value: s.to_string() }),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CanonicalizationMethod::Simple => "simple",
            CanonicalizationMethod::Relaxed => "relaxed",
        }
    }
}

/// `c=header/body`. A missing body half means `simple`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Canonicalization {
    pub header: CanonicalizationMethod,
    pub body: CanonicalizationMethod,
}

impl Canonicalization {
    pub fn parse(s: &str) -> Result<Self, DkimParseError> {
        let (header, body) = match s.split_once('/') {
            Some((h, b)) => (h, Some(b)),
            None => (s, None),
        };
        Ok(Self {
            header: CanonicalizationMethod::parse(header.trim())?,
            body: body
                .map(|b| CanonicalizationMethod::parse(b.trim()))
                .transpose()?
                .unwrap_or_default(),
        })
    }
}

impl std::fmt::Display for Canonicalization {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.header.as_str(), self.body.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct DkimSignature {
    pub algorithm: Algorithm,
    pub signature: Vec<u8>,
    pub body_hash: Vec<u8>,
    pub canonicalization: Canonicalization,
    pub domain: String,
    /// `h=` names, lowercased, duplicates kept for over-signing.
    pub signed_headers: Vec<String>,
    pub auid: Option<String>,
    pub body_length: Option<u64>,
    pub selector: String,
    pub timestamp: Option<u64>,
    pub expiration: Option<u64>,
}

impl DkimSignature {
    pub fn parse(header_value: &str) -> Result<Self, DkimParseError> {
        let tags = TagList::parse(header_value)?;

        let version = tags.require("v")?;
        if version != "1" {
            return Err(DkimParseError::InvalidValue { tag: "v", value: version.to_string() });
        }
        let algorithm = Algorithm::parse(tags.require("a")?)?;
        let signature = super::tags::decode_base64("b", tags.require("b")?)?;
        let body_hash = super::tags::decode_base64("bh", tags.require("bh")?)?;
        let domain = tags.require("d")?.to_ascii_lowercase();
        let selector = tags.require("s")?.to_string();
        let signed_headers: Vec<String> = tags
            .require("h")?
            .split(':')
            .map(|h| h.trim().to_ascii_lowercase())
            .filter(|h| !h.is_empty())
            .collect();
        if !signed_headers.iter().any(|h| h == "from") {
            return Err(DkimParseError::Malformed("h= must include from".into()));
        }

        let canonicalization = match tags.get("c") {
            Some(c) => Canonicalization::parse(c)?,
            None => Canonicalization::default(),
        };

        let auid = tags.get("i").map(str::to_string);
        if let Some(auid) = &auid {
            let auid_domain = auid.rsplit_once('@').map_or(auid.as_str(), |(_, d)| d).to_ascii_lowercase();
            if auid_domain != domain && !auid_domain.ends_with(&format!(".{domain}")) {
                return Err(DkimParseError::InvalidValue { tag: "i", value: auid.clone() });
            }
        }

        Ok(Self {
            algorithm,
            signature,
            body_hash,
            canonicalization,
            domain,
            signed_headers,
            auid,
            body_length: tags.number("l")?,
            selector,
            timestamp: tags.number("t")?,
            expiration: tags.number("x")?,
        })
    }

    /// Domain part of `i=`, or `d=` when absent.
    pub fn auid_domain(&self) -> &str {
        self.auid
            .as_deref()
            .and_then(|a| a.rsplit_once('@').map(|(_, d)| d))
            .unwrap_or(&self.domain)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SIG: &str = "v=1; a=rsa-sha256; c=relaxed/simple; d=Example.com; s=sel;\r\n\t\
                       h=from:to:subject:from; i=news@mail.example.com; l=42; t=1700000000; x=1700600000;\r\n\t\
                       bh=frcCV1k9oG9oKj3dpUqdJg1PxRT2RSN/XKdLCPjaYaY=; b=aGVs\r\n bG8=";

    #[test]
    fn parses_full_signature() {
        let sig = DkimSignature::parse(SIG).unwrap();
        assert_eq!(sig.algorithm, Algorithm::RsaSha256);
        assert_eq!(sig.domain, "example.com");
        assert_eq!(sig.selector, "sel");
        assert_eq!(sig.signed_headers, vec!["from", "to", "subject", "from"]);
        assert_eq!(sig.canonicalization.header, CanonicalizationMethod::Relaxed);
        assert_eq!(sig.canonicalization.body, CanonicalizationMethod::Simple);
        assert_eq!(sig.body_length, Some(42));
        assert_eq!(sig.expiration, Some(1_700_600_000));
        assert_eq!(sig.signature, b"hello");
        assert_eq!(sig.body_hash.len(), 32);
        assert_eq!(sig.auid_domain(), "mail.example.com");
    }

    #[test]
    fn missing_and_invalid_tags() {
        assert_eq!(
            DkimSignature::parse("v=1; a=rsa-sha256; d=example.com; h=from; bh=; b=").unwrap_err(),
            DkimParseError::MissingTag("s")
        );
        assert!(DkimSignature::parse("v=2; a=rsa-sha256; d=example.com; s=s; h=from; bh=; b=").is_err());
        assert!(DkimSignature::parse("v=1; a=dsa-md5; d=example.com; s=s; h=from; bh=; b=").is_err());
        assert!(matches!(
            DkimSignature::parse("v=1; a=rsa-sha256; d=example.com; s=s; h=to:subject; bh=; b="),
            Err(DkimParseError::Malformed(_))
        ));
    }

    #[test]
    fn auid_must_sit_under_d() {
        let err = DkimSignature::parse("v=1; a=rsa-sha256; d=example.com; s=s; h=from; i=a@evil.com; bh=; b=")
            .unwrap_err();
        assert!(matches!(err, DkimParseError::InvalidValue { tag: "i", .. }));
    }

    #[test]
    fn canonicalization_forms() {
        assert_eq!(
            Canonicalization::parse("relaxed").unwrap(),
            Canonicalization { header: CanonicalizationMethod::Relaxed, body: CanonicalizationMethod::Simple }
        );
        assert_eq!(Canonicalization::parse("relaxed/relaxed").unwrap().to_string(), "relaxed/relaxed");
        assert!(Canonicalization::parse("loose/simple").is_err());
    }
}

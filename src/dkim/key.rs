//! DKIM public key records (RFC 6376 §3.6.1, RFC 8463).
//!
//! The key size is always measured from the decoded key material. A record
//! cannot make a key look bigger than it is.

use chrono::{DateTime, Utc};
use serde::Serialize;
use x509_parser::prelude::FromDer;
use x509_parser::public_key::{PublicKey, RSAPublicKey};
use x509_parser::x509::SubjectPublicKeyInfo;

use super::signature::HashAlgorithm;
use super::tags::{DkimParseError, TagList};
use crate::error::{ErrorKind, InspectError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyAlgorithm {
    Rsa,
    Ed25519,
}

impl KeyAlgorithm {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "rsa" => Some(KeyAlgorithm::Rsa),
            "ed25519" => Some(KeyAlgorithm::Ed25519),
            _ => None,
        }
    }
}

/// How the `p=` bytes were encoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum KeyEncoding {
    /// SubjectPublicKeyInfo DER, the usual form for RSA.
    #[serde(rename = "SPKI")]
    Spki,
    /// Bare PKCS#1 RSAPublicKey DER.
    #[serde(rename = "PKCS1")]
    Pkcs1,
    /// 32 raw bytes (Ed25519).
    #[serde(rename = "raw")]
    Raw,
}

/// Parsed selector record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DkimKeyRecord {
    pub selector: String,
    pub domain: String,
    pub algorithm: KeyAlgorithm,
    pub key_type: KeyEncoding,
    /// Bits measured from the decoded key. 0 for a revoked key.
    pub key_size_bits: usize,
    /// Encoded `p=` bytes as published.
    pub public_key_bytes: Vec<u8>,
    /// Key in the form `ring` verifies with: PKCS#1 for RSA, raw for Ed25519.
    pub verification_key: Vec<u8>,
    /// DNS key records carry no expiry; filled from a signature's `x=`.
    pub expires_at: Option<DateTime<Utc>>,
    pub revoked: bool,
    pub hash_algorithms: Option<Vec<HashAlgorithm>>,
    pub service_types: Option<Vec<String>>,
    pub testing: bool,
    pub strict: bool,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KeyError {
    #[error(transparent)]
    Tags(#[from] DkimParseError),
    #[error("unsupported key version {0}")]
    Version(String),
    #[error("unknown key type k={0}")]
    UnknownKeyType(String),
    #[error("public key material is not a valid {0} key: {1}")]
    BadKey(&'static str, String),
}

impl From<KeyError> for InspectError {
    fn from(e: KeyError) -> Self {
        InspectError::new(ErrorKind::MalformedPublicKey, e.to_string())
    }
}

/// True for TXT strings that look like a DKIM key record.
pub fn is_key_record(txt: &str) -> bool {
    let t = txt.trim_start();
    t.starts_with("v=DKIM1") || t.contains("p=")
}

impl DkimKeyRecord {
    pub fn parse(selector: &str, domain: &str, txt: &str) -> Result<Self, KeyError> {
        let tags = TagList::parse(txt)?;

        if let Some(v) = tags.get("v") {
            if v != "DKIM1" {
                return Err(KeyError::Version(v.to_string()));
            }
        }
        let algorithm = match tags.get("k") {
            Some(k) => KeyAlgorithm::parse(k).ok_or_else(|| KeyError::UnknownKeyType(k.to_string()))?,
            None => KeyAlgorithm::Rsa,
        };
        // required even when empty
        tags.require("p")?;
        let public_key_bytes = tags.base64("p")?.unwrap_or_default();
        let revoked = public_key_bytes.is_empty();

        let (key_type, key_size_bits, verification_key) = if revoked {
            let encoding = match algorithm {
                KeyAlgorithm::Rsa => KeyEncoding::Spki,
                KeyAlgorithm::Ed25519 => KeyEncoding::Raw,
            };
            (encoding, 0, Vec::new())
        } else {
            match algorithm {
                KeyAlgorithm::Rsa => decode_rsa(&public_key_bytes)?,
                KeyAlgorithm::Ed25519 => decode_ed25519(&public_key_bytes)?,
            }
        };

        let hash_algorithms = tags
            .list("h")
            .map(|hs| hs.iter().filter_map(|h| HashAlgorithm::parse(h)).collect::<Vec<_>>())
            .filter(|hs| !hs.is_empty());
        let flags = tags.list("t").unwrap_or_default();

        Ok(Self {
            selector: selector.to_string(),
            domain: domain.to_string(),
            algorithm,
            key_type,
            key_size_bits,
            public_key_bytes,
            verification_key,
            expires_at: None,
            revoked,
            hash_algorithms,
            service_types: tags.list("s"),
            testing: flags.iter().any(|f| f == "y"),
            strict: flags.iter().any(|f| f == "s"),
            notes: tags.get("n").map(str::to_string),
        })
    }

    /// `s=` absent or containing `email` or `*`.
    pub fn allows_email(&self) -> bool {
        self.service_types
            .as_ref()
            .map_or(true, |s| s.iter().any(|t| t == "email" || t == "*"))
    }
}

fn decode_rsa(der: &[u8]) -> Result<(KeyEncoding, usize, Vec<u8>), KeyError> {
    if let Ok((_, spki)) = SubjectPublicKeyInfo::from_der(der) {
        return match spki.parsed() {
            Ok(PublicKey::RSA(rsa)) => {
                let bits = modulus_bits(rsa.modulus);
                Ok((KeyEncoding::Spki, bits, spki.subject_public_key.data.to_vec()))
            }
            Ok(_) => Err(KeyError::BadKey("RSA", "SubjectPublicKeyInfo holds a non-RSA key".into())),
            Err(e) => Err(KeyError::BadKey("RSA", e.to_string())),
        };
    }
    // Some publishers put the bare RSAPublicKey in p=.
    let modulus = pkcs1_modulus(der).ok_or_else(|| KeyError::BadKey("RSA", "not SPKI or PKCS#1 DER".into()))?;
    Ok((KeyEncoding::Pkcs1, modulus_bits(modulus), der.to_vec()))
}

fn decode_ed25519(raw: &[u8]) -> Result<(KeyEncoding, usize, Vec<u8>), KeyError> {
    if raw.len() != 32 {
        return Err(KeyError::BadKey(
            "Ed25519",
            format!("expected 32 bytes, found {}", raw.len()),
        ));
    }
    Ok((KeyEncoding::Raw, 256, raw.to_vec()))
}

/// Bit length of a big-endian unsigned integer.
fn modulus_bits(modulus: &[u8]) -> usize {
    let trimmed: &[u8] = match modulus.iter().position(|b| *b != 0) {
        Some(i) => &modulus[i..],
        None => return 0,
    };
    (trimmed.len() - 1) * 8 + (8 - trimmed[0].leading_zeros() as usize)
}

/// Modulus of a bare PKCS#1 `RSAPublicKey` with nothing after it.
fn pkcs1_modulus(der: &[u8]) -> Option<&[u8]> {
    match RSAPublicKey::from_der(der) {
        Ok((rest, key)) if rest.is_empty() && !key.modulus.is_empty() => Some(key.modulus),
        _ => None,
    }
}

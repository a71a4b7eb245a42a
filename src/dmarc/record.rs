//! DMARC record grammar (RFC 7489 §6.3) and discovery.

use serde::Serialize;
use thiserror::Error;
use tracing::debug;

use crate::common::dns::{fetch_records, DnsError, DnsResolver, DomainRecord, RecordKind};
use crate::common::domain::{domains_equal, organizational_domain};
use crate::error::{ErrorKind, InspectError};

pub const DEFAULT_REPORT_INTERVAL: u32 = 86400;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DmarcParseError {
    #[error("record does not start with v=DMARC1")]
    InvalidVersion,
    #[error("missing required p= tag")]
    MissingPolicy,
    #[error("invalid p= value: {0}")]
    InvalidPolicy(String),
    #[error("invalid report URI: {0}")]
    InvalidUri(String),
}

impl From<DmarcParseError> for InspectError {
    fn from(e: DmarcParseError) -> Self {
        InspectError::new(ErrorKind::InvalidDmarcRecord, e.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Policy {
    None,
    Quarantine,
    Reject,
}

impl Policy {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" => Some(Policy::None),
            "quarantine" => Some(Policy::Quarantine),
            "reject" => Some(Policy::Reject),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Policy::None => "none",
            Policy::Quarantine => "quarantine",
            Policy::Reject => "reject",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AlignmentMode {
    #[default]
    Relaxed,
    Strict,
}

impl AlignmentMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "r" => Some(AlignmentMode::Relaxed),
            "s" => Some(AlignmentMode::Strict),
            _ => None,
        }
    }
}

/// `mailto:` report destination with optional `!size` limit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportUri {
    pub uri: String,
    pub address: String,
    pub max_size: Option<u64>,
}

impl ReportUri {
    pub fn parse(raw: &str) -> Result<Self, DmarcParseError> {
        let raw = raw.trim();
        let Some(rest) = raw.get(..7).filter(|s| s.eq_ignore_ascii_case("mailto:")).map(|_| &raw[7..]) else {
            return Err(DmarcParseError::InvalidUri(raw.to_string()));
        };
        let (address, max_size) = match rest.rsplit_once('!') {
            Some((addr, size)) => (addr, Some(parse_size(size).ok_or_else(|| DmarcParseError::InvalidUri(raw.to_string()))?)),
            None => (rest, None),
        };
        if !address.contains('@') {
            return Err(DmarcParseError::InvalidUri(raw.to_string()));
        }
        let uri = match raw.split_once('!') {
            Some((uri, _)) => uri.to_string(),
            None => raw.to_string(),
        };
        Ok(Self {
            uri,
            address: address.to_string(),
            max_size,
        })
    }
}

/// `123`, `10k`, `5m`, `1g`, `1t` (binary units).
fn parse_size(s: &str) -> Option<u64> {
    let s = s.trim().to_ascii_lowercase();
    let (digits, shift) = match s.chars().last()? {
        'k' => (&s[..s.len() - 1], 10),
        'm' => (&s[..s.len() - 1], 20),
        'g' => (&s[..s.len() - 1], 30),
        't' => (&s[..s.len() - 1], 40),
        _ => (s.as_str(), 0),
    };
    digits.parse::<u64>().ok()?.checked_mul(1u64 << shift)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DmarcRecord {
    pub version: String,
    pub policy: Policy,
    /// Always set: `sp=` when present and valid, `p=` otherwise.
    pub subdomain_policy: Policy,
    pub subdomain_policy_inherited: bool,
    /// `np=` (RFC 9091).
    pub non_existent_policy: Option<Policy>,
    pub dkim_alignment: AlignmentMode,
    pub spf_alignment: AlignmentMode,
    pub percent: u8,
    pub failure_options: Vec<String>,
    pub report_format: String,
    /// Seconds between aggregate reports.
    pub report_interval: u32,
    pub rua: Vec<ReportUri>,
    pub ruf: Vec<ReportUri>,
    /// `rua`/`ruf` entries that could not be used (non-`mailto:` scheme,
    /// no address, bad size suffix). They do not invalidate the record.
    pub ignored_uris: Vec<String>,
}

/// Records are recognised by their first tag.
pub fn is_dmarc_record(txt: &str) -> bool {
    let Some(first) = txt.split(';').next() else {
        return false;
    };
    match first.split_once('=') {
        Some((tag, value)) => tag.trim().eq_ignore_ascii_case("v") && value.trim().eq_ignore_ascii_case("DMARC1"),
        None => false,
    }
}

impl DmarcRecord {
    pub fn parse(txt: &str) -> Result<Self, DmarcParseError> {
        if !is_dmarc_record(txt) {
            return Err(DmarcParseError::InvalidVersion);
        }
        let tags: Vec<(String, &str)> = txt
            .split(';')
            .skip(1)
            .filter_map(|part| part.split_once('='))
            .map(|(t, v)| (t.trim().to_ascii_lowercase(), v.trim()))
            .collect();
        // first occurrence wins; unknown tags are ignored
        let get = |name: &str| tags.iter().find(|(t, _)| t == name).map(|(_, v)| *v);

        let raw_policy = get("p").ok_or(DmarcParseError::MissingPolicy)?;
        let policy = Policy::parse(raw_policy).ok_or_else(|| DmarcParseError::InvalidPolicy(raw_policy.to_string()))?;
        let explicit_sp = get("sp").and_then(Policy::parse);

        let percent = match get("pct").map(str::parse::<i64>) {
            Some(Ok(n)) => n.clamp(0, 100) as u8,
            _ => 100,
        };
        let failure_options: Vec<String> = get("fo")
            .map(|v| {
                v.split(':')
                    .map(|o| o.trim().to_ascii_lowercase())
                    .filter(|o| matches!(o.as_str(), "0" | "1" | "d" | "s"))
                    .collect()
            })
            .filter(|v: &Vec<String>| !v.is_empty())
            .unwrap_or_else(|| vec!["0".to_string()]);
        let mut ignored_uris = Vec::new();
        let mut uris = |name: &str| -> Vec<ReportUri> {
            get(name)
                .into_iter()
                .flat_map(|v| v.split(','))
                .map(str::trim)
                .filter(|u| !u.is_empty())
                .filter_map(|u| match ReportUri::parse(u) {
                    Ok(uri) => Some(uri),
                    Err(e) => {
                        debug!(tag = name, error = %e, "ignoring report URI");
                        ignored_uris.push(u.to_string());
                        None
                    }
                })
                .collect()
        };
        let rua = uris("rua");
        let ruf = uris("ruf");

        Ok(Self {
            version: "DMARC1".to_string(),
            policy,
            subdomain_policy: explicit_sp.unwrap_or(policy),
            subdomain_policy_inherited: explicit_sp.is_none(),
            non_existent_policy: get("np").and_then(Policy::parse),
            dkim_alignment: get("adkim").and_then(AlignmentMode::parse).unwrap_or_default(),
            spf_alignment: get("aspf").and_then(AlignmentMode::parse).unwrap_or_default(),
            percent,
            failure_options,
            report_format: get("rf").unwrap_or("afrf").to_ascii_lowercase(),
            report_interval: get("ri").and_then(|v| v.parse().ok()).unwrap_or(DEFAULT_REPORT_INTERVAL),
            rua,
            ruf,
            ignored_uris,
        })
    }
}

/// A record found by [`discover`].
#[derive(Debug, Clone)]
pub struct DiscoveredRecord {
    pub source: DomainRecord,
    pub record: DmarcRecord,
    /// True when the record came from the organizational domain.
    pub org_fallback: bool,
}

async fn lookup<R: DnsResolver>(resolver: &R, domain: &str) -> Result<Vec<DomainRecord>, InspectError> {
    let name = format!("_dmarc.{domain}");
    match fetch_records(resolver, &name, RecordKind::Dmarc, is_dmarc_record).await {
        Ok(records) => Ok(records),
        Err(DnsError::NxDomain) => Ok(Vec::new()),
        Err(e) => Err(e.into()),
    }
}

/// Find the DMARC record for `domain`, falling back to its organizational
/// domain (RFC 7489 §6.6.3).
pub async fn discover<R: DnsResolver>(resolver: &R, domain: &str) -> Result<DiscoveredRecord, InspectError> {
    let mut records = lookup(resolver, domain).await?;
    let mut org_fallback = false;
    if records.is_empty() {
        let org = organizational_domain(domain);
        if !domains_equal(&org, domain) {
            debug!(%domain, %org, "no DMARC record, trying organizational domain");
            records = lookup(resolver, &org).await?;
            org_fallback = true;
        }
    }
    match records.len() {
        0 => Err(InspectError::new(
            ErrorKind::NoDmarcRecord,
            format!("no DMARC record published at _dmarc.{domain}"),
        )),
        1 => {
            let source = records.remove(0);
            let record = DmarcRecord::parse(&source.raw_text)?;
            Ok(DiscoveredRecord { source, record, org_fallback })
        }
        n => Err(InspectError::new(
            ErrorKind::InvalidDmarcRecord,
            format!("{n} DMARC records published for {domain}; exactly one is allowed"),
        )),
    }
}

//! MX lookup: exchangers for a domain, their addresses and a score.

use std::net::IpAddr;

use serde::Serialize;
use tracing::{debug, instrument, warn};

use crate::common::dns::{fetch_mx, DnsError, DnsResolver};
use crate::common::domain::normalize;
use crate::error::{ErrorKind, InspectError};

const SINGLE_MX_PENALTY: u8 = 20;
const UNRESOLVED_HOST_PENALTY: u8 = 25;
const IP_LITERAL_PENALTY: u8 = 20;
const NO_IPV6_PENALTY: u8 = 5;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MxRecord {
    pub priority: u16,
    pub host: String,
    pub ip_addresses: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MxReport {
    pub domain: String,
    pub mx_records: Vec<MxRecord>,
    pub total_records: usize,
    /// RFC 7505: the domain accepts no mail.
    pub null_mx: bool,
    pub security_score: u8,
    pub recommendations: Vec<String>,
}

/// A and AAAA addresses of `host`. A failed family is only an error when
/// the other family yields nothing either.
async fn addresses<R: DnsResolver>(resolver: &R, host: &str) -> Result<Vec<IpAddr>, DnsError> {
    let (v4, v6) = tokio::join!(resolver.query_a(host), resolver.query_aaaa(host));
    let mut out: Vec<IpAddr> = Vec::new();
    let mut failure = None;
    match v4 {
        Ok(ips) => out.extend(ips.into_iter().map(IpAddr::V4)),
        Err(DnsError::NxDomain) => {}
        Err(e) => failure = Some(e),
    }
    match v6 {
        Ok(ips) => out.extend(ips.into_iter().map(IpAddr::V6)),
        Err(DnsError::NxDomain) => {}
        Err(e) => failure = failure.or(Some(e)),
    }
    match failure {
        Some(e) if out.is_empty() => Err(e),
        _ => Ok(out),
    }
}

fn score(records: &[MxRecord], failed: &[String], recommendations: &mut Vec<String>) -> u8 {
    let mut score: u8 = 100;
    if records.len() == 1 {
        score = score.saturating_sub(SINGLE_MX_PENALTY);
        recommendations.push("Add a backup MX host so mail is queued elsewhere when the primary is down".into());
    }
    for r in records {
        if r.host.parse::<IpAddr>().is_ok() {
            score = score.saturating_sub(IP_LITERAL_PENALTY);
            recommendations.push(format!("MX target {} is an IP address; RFC 5321 requires a host name", r.host));
        } else if r.ip_addresses.is_empty() {
            score = score.saturating_sub(UNRESOLVED_HOST_PENALTY);
            recommendations.push(if failed.contains(&r.host) {
                format!("Address lookup for MX host {} failed; check that its name servers answer", r.host)
            } else {
                format!("MX host {} does not resolve to any address", r.host)
            });
        }
    }
    let any_v6 = records
        .iter()
        .flat_map(|r| &r.ip_addresses)
        .any(|ip| ip.contains(':'));
    if !records.is_empty() && !any_v6 {
        score = score.saturating_sub(NO_IPV6_PENALTY);
        recommendations.push("Publish AAAA records for at least one MX host to accept mail over IPv6".into());
    }
    score
}

/// Look up the MX records of `domain` and resolve each exchanger.
#[instrument(skip(resolver))]
pub async fn lookup_mx<R: DnsResolver>(resolver: &R, domain: &str) -> Result<MxReport, InspectError> {
    let domain = normalize(domain);
    let raw = match fetch_mx(resolver, &domain).await {
        Ok(raw) => raw,
        Err(DnsError::NxDomain) => {
            return Err(InspectError::new(ErrorKind::NxDomain, format!("{domain} does not exist")));
        }
        Err(e) => return Err(e.into()),
    };

    let mut recommendations = Vec::new();

    if let [(0, host)] = raw.as_slice() {
        if normalize(host).is_empty() {
            return Ok(MxReport {
                domain,
                mx_records: vec![MxRecord {
                    priority: 0,
                    host: ".".into(),
                    ip_addresses: Vec::new(),
                }],
                total_records: 1,
                null_mx: true,
                security_score: 100,
                recommendations: vec![
                    "Null MX published: also publish \"v=spf1 -all\" and a DMARC p=reject record so the domain cannot be spoofed".into(),
                ],
            });
        }
    }

    let mut mx_records = Vec::with_capacity(raw.len());
    let mut failed = Vec::new();
    for (priority, host) in raw {
        let host = normalize(&host);
        let ips = if host.parse::<IpAddr>().is_ok() {
            Vec::new()
        } else {
            match addresses(resolver, &host).await {
                Ok(ips) => ips,
                Err(e) => {
                    warn!(%host, error = %e, "MX host address lookup failed");
                    failed.push(host.clone());
                    Vec::new()
                }
            }
        };
        debug!(%host, priority, count = ips.len(), "resolved MX host");
        mx_records.push(MxRecord {
            priority,
            host,
            ip_addresses: ips.iter().map(IpAddr::to_string).collect(),
        });
    }

    if mx_records.is_empty() {
        let implicit = addresses(resolver, &domain).await.unwrap_or_default();
        recommendations.push(if implicit.is_empty() {
            format!("{domain} publishes no MX record and has no address; it cannot receive mail")
        } else {
            format!("{domain} publishes no MX record; senders fall back to its A/AAAA address (RFC 5321 §5.1)")
        });
        return Ok(MxReport {
            domain,
            mx_records,
            total_records: 0,
            null_mx: false,
            security_score: 0,
            recommendations,
        });
    }

    let security_score = score(&mx_records, &failed, &mut recommendations);
    Ok(MxReport {
        domain,
        total_records: mx_records.len(),
        mx_records,
        null_mx: false,
        security_score,
        recommendations,
    })
}

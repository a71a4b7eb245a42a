use crate::common::dns::{fetch_records, DnsResolver, DomainRecord, RecordKind};
use crate::error::{ErrorKind, InspectError};

use super::term::{is_spf_record, parse_record, SpfParseError, SpfTerm};

impl From<SpfParseError> for InspectError {
    fn from(e: SpfParseError) -> Self {
        let kind = match e {
            SpfParseError::UnknownMechanism(_) => ErrorKind::UnknownMechanism,
            _ => ErrorKind::InvalidSpfRecord,
        };
        InspectError::new(kind, e.to_string())
    }
}

/// A published SPF record and its parsed terms.
#[derive(Debug, Clone)]
pub struct SpfRecord {
    pub source: DomainRecord,
    pub terms: Vec<SpfTerm>,
}

/// Pick the single SPF record out of the TXT set at a name.
///
/// More than one `v=spf1` record is a permanent error (RFC 7208 §4.5).
pub fn select_record(domain: &str, mut candidates: Vec<DomainRecord>) -> Result<DomainRecord, InspectError> {
    match candidates.len() {
        0 => Err(InspectError::new(
            ErrorKind::NoSpfRecord,
            format!("no SPF record published at {domain}"),
        )),
        1 => Ok(candidates.remove(0)),
        n => Err(InspectError::new(
            ErrorKind::MultipleSpfRecords,
            format!("{n} SPF records published at {domain}; exactly one is allowed"),
        )),
    }
}

/// Fetch, select and parse the SPF record for `domain`.
pub async fn fetch_spf_record<R: DnsResolver>(resolver: &R, domain: &str) -> Result<SpfRecord, InspectError> {
    let candidates = fetch_records(resolver, domain, RecordKind::Spf, is_spf_record).await?;
    let source = select_record(domain, candidates)?;
    let terms = parse_record(&source.raw_text)?;
    Ok(SpfRecord { source, terms })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::dns::{DnsError, MockResolver};

    #[tokio::test]
    async fn single_record_is_selected_among_other_txt() {
        let resolver = MockResolver::new();
        resolver.add_txt(
            "example.com",
            vec!["ms=123".into(), "v=spf1 ip4:192.0.2.0/24 -all".into()],
        );
        let rec = fetch_spf_record(&resolver, "example.com").await.unwrap();
        assert_eq!(rec.source.raw_text, "v=spf1 ip4:192.0.2.0/24 -all");
        assert_eq!(rec.terms.len(), 3);
    }

    #[tokio::test]
    async fn missing_and_duplicate_records() {
        let resolver = MockResolver::new();
        resolver.add_txt("none.example", vec!["hello".into()]);
        resolver.add_txt("dup.example", vec!["v=spf1 -all".into(), "v=spf1 ~all".into()]);

        let err = fetch_spf_record(&resolver, "none.example").await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::NoSpfRecord);
        let err = fetch_spf_record(&resolver, "dup.example").await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::MultipleSpfRecords);
    }

    #[tokio::test]
    async fn dns_failures_keep_their_kind() {
        let resolver = MockResolver::new();
        resolver.set_nxdomain("gone.example");
        resolver.set_failure("slow.example", DnsError::Timeout);

        let err = fetch_spf_record(&resolver, "gone.example").await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::NxDomain);
        let err = fetch_spf_record(&resolver, "slow.example").await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::DnsTimeout);
    }

    #[tokio::test]
    async fn unknown_mechanism_surfaces_as_its_own_kind() {
        let resolver = MockResolver::new();
        resolver.add_txt("example.com", vec!["v=spf1 foo:bar -all".into()]);
        let err = fetch_spf_record(&resolver, "example.com").await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::UnknownMechanism);
    }
}

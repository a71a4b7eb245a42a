//! Identifier alignment and policy disposition (RFC 7489 §3.1, §6.6).

use rand::Rng;
use serde::Serialize;

use super::record::{AlignmentMode, DmarcRecord, Policy};
use crate::common::domain::{domains_equal, organizational_domain};
use crate::spf::SpfResult;

/// Whether `identifier` aligns with the From domain under `mode`.
pub fn aligned(identifier: &str, from_domain: &str, mode: AlignmentMode) -> bool {
    match mode {
        AlignmentMode::Strict => domains_equal(identifier, from_domain),
        AlignmentMode::Relaxed => domains_equal(&organizational_domain(identifier), &organizational_domain(from_domain)),
    }
}

/// SPF outcome for the MAIL FROM (or HELO) identity.
#[derive(Debug, Clone)]
pub struct SpfIdentity {
    pub domain: String,
    pub result: SpfResult,
}

/// One DKIM signature's `d=` and whether it verified.
#[derive(Debug, Clone)]
pub struct DkimIdentity {
    pub domain: String,
    pub valid: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Disposition {
    Pass,
    None,
    Quarantine,
    Reject,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AlignmentOutcome {
    pub spf_aligned: bool,
    pub dkim_aligned: bool,
    /// Policy that governs this From domain (`sp=` for subdomains).
    pub applied_policy: Policy,
    /// False when `pct=` sampling let a failing message through.
    pub sampled: bool,
    pub disposition: Disposition,
}

/// Evaluate alignment for a message and decide its disposition.
///
/// `is_subdomain` is true when the record was found at the organizational
/// domain rather than at the From domain itself.
pub fn evaluate_alignment(
    record: &DmarcRecord,
    from_domain: &str,
    is_subdomain: bool,
    spf: Option<&SpfIdentity>,
    dkim: &[DkimIdentity],
) -> AlignmentOutcome {
    let roll = rand::thread_rng().gen_range(0..100u8);
    evaluate_with_sample(record, from_domain, is_subdomain, spf, dkim, roll)
}

/// As [`evaluate_alignment`] with a fixed sample in `0..100`. The policy is
/// applied to a failing message when `roll < pct`.
pub fn evaluate_with_sample(
    record: &DmarcRecord,
    from_domain: &str,
    is_subdomain: bool,
    spf: Option<&SpfIdentity>,
    dkim: &[DkimIdentity],
    roll: u8,
) -> AlignmentOutcome {
    let spf_aligned = spf.is_some_and(|s| {
        s.result == SpfResult::Pass && aligned(&s.domain, from_domain, record.spf_alignment)
    });
    let dkim_aligned = dkim
        .iter()
        .any(|d| d.valid && aligned(&d.domain, from_domain, record.dkim_alignment));
    let applied_policy = if is_subdomain {
        record.subdomain_policy
    } else {
        record.policy
    };

    if spf_aligned || dkim_aligned {
        return AlignmentOutcome {
            spf_aligned,
            dkim_aligned,
            applied_policy,
            sampled: true,
            disposition: Disposition::Pass,
        };
    }

    let sampled = roll < record.percent;
    let disposition = match (applied_policy, sampled) {
        (Policy::None, _) => Disposition::None,
        // RFC 7489 §6.6.4: an unsampled reject falls back to quarantine
        (Policy::Reject, false) => Disposition::Quarantine,
        (Policy::Quarantine, false) => Disposition::None,
        (Policy::Quarantine, true) => Disposition::Quarantine,
        (Policy::Reject, true) => Disposition::Reject,
    };
    AlignmentOutcome {
        spf_aligned,
        dkim_aligned,
        applied_policy,
        sampled,
        disposition,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(txt: &str) -> DmarcRecord {
        DmarcRecord::parse(txt).unwrap()
    }

    fn spf(domain: &str, result: SpfResult) -> SpfIdentity {
        SpfIdentity { domain: domain.into(), result }
    }

    fn dkim(domain: &str, valid: bool) -> DkimIdentity {
        DkimIdentity { domain: domain.into(), valid }
    }

    #[test]
    fn relaxed_and_strict_modes() {
        assert!(aligned("mail.example.com", "example.com", AlignmentMode::Relaxed));
        assert!(!aligned("mail.example.com", "example.com", AlignmentMode::Strict));
        assert!(aligned("Example.COM.", "example.com", AlignmentMode::Strict));
        assert!(!aligned("example.net", "example.com", AlignmentMode::Relaxed));
        assert!(aligned("a.example.co.uk", "b.example.co.uk", AlignmentMode::Relaxed));
        assert!(!aligned("example.co.uk", "other.co.uk", AlignmentMode::Relaxed));
    }

    #[test]
    fn dkim_alignment_passes() {
        let r = record("v=DMARC1; p=reject");
        let out = evaluate_with_sample(&r, "example.com", false, Some(&spf("bounce.other.net", SpfResult::Pass)), &[dkim("mail.example.com", true)], 0);
        assert!(out.dkim_aligned);
        assert!(!out.spf_aligned);
        assert_eq!(out.disposition, Disposition::Pass);
    }

    #[test]
    fn invalid_signature_does_not_align() {
        let r = record("v=DMARC1; p=reject; adkim=s");
        let out = evaluate_with_sample(&r, "example.com", false, None, &[dkim("example.com", false)], 0);
        assert!(!out.dkim_aligned);
        assert_eq!(out.disposition, Disposition::Reject);
    }

    #[test]
    fn spf_must_pass_to_align() {
        let r = record("v=DMARC1; p=quarantine");
        let out = evaluate_with_sample(&r, "example.com", false, Some(&spf("example.com", SpfResult::SoftFail)), &[], 0);
        assert!(!out.spf_aligned);
        assert_eq!(out.disposition, Disposition::Quarantine);
    }

    #[test]
    fn pct_only_affects_enforcement() {
        let r = record("v=DMARC1; p=reject; pct=25");
        let hit = evaluate_with_sample(&r, "example.com", false, None, &[], 10);
        assert_eq!(hit.disposition, Disposition::Reject);
        let miss = evaluate_with_sample(&r, "example.com", false, None, &[], 80);
        assert!(!miss.sampled);
        assert_eq!(miss.disposition, Disposition::Quarantine);

        let r = record("v=DMARC1; p=quarantine; pct=0");
        assert_eq!(evaluate_with_sample(&r, "example.com", false, None, &[], 0).disposition, Disposition::None);
    }

    #[test]
    fn subdomains_use_sp() {
        let r = record("v=DMARC1; p=reject; sp=none");
        let out = evaluate_alignment(&r, "news.example.com", true, None, &[]);
        assert_eq!(out.applied_policy, Policy::None);
        assert_eq!(out.disposition, Disposition::None);
    }
}

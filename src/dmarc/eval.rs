use serde::Serialize;

use super::alignment::{evaluate_alignment, AlignmentOutcome, DkimIdentity, SpfIdentity};
use super::record::{discover, AlignmentMode, DiscoveredRecord, DmarcRecord, Policy};
use crate::common::dns::DnsResolver;
use crate::common::domain::normalize;
use crate::error::InspectError;

const SECONDS_PER_DAY: u32 = 86400;

const POINTS_REJECT: f64 = 60.0;
const POINTS_QUARANTINE: f64 = 45.0;
const POINTS_NONE: u32 = 15;
const POINTS_RUA: u32 = 15;
const POINTS_RUF: u32 = 10;
const POINTS_BOTH_REPORTS: u32 = 5;
const POINTS_SP_REJECT: u32 = 10;
const POINTS_SP_QUARANTINE: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckStatus {
    Pass,
    Warning,
    Fail,
}

#[derive(Debug, Clone, Serialize)]
pub struct ValidationCheck {
    pub check: String,
    pub status: CheckStatus,
    pub details: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct AlignmentModes {
    pub dkim: AlignmentMode,
    pub spf: AlignmentMode,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReportingSummary {
    pub aggregate_uri: Vec<String>,
    pub forensic_uri: Vec<String>,
    /// Seconds, as published in `ri=`.
    pub interval: u32,
    /// `interval` in whole days, truncated.
    pub interval_days: u32,
    pub failure_options: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PolicyReport {
    pub version: String,
    pub policy: Policy,
    pub subdomain_policy: Policy,
    pub subdomain_policy_inherited: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub non_existent_policy: Option<Policy>,
    pub percentage: u8,
    pub alignment: AlignmentModes,
    pub reporting: ReportingSummary,
}

#[derive(Debug, Clone, Serialize)]
pub struct ComplianceAnalysis {
    pub overall_score: u8,
    pub policy_strength: String,
    pub reporting_configured: bool,
    pub subdomain_protection: String,
    pub spf_alignment: AlignmentMode,
    pub dkim_alignment: AlignmentMode,
}

#[derive(Debug, Clone, Serialize)]
pub struct SubdomainAnalysis {
    pub explicitly_protected: bool,
    pub inherits_policy: bool,
    pub recommended_policy: Policy,
    pub risk_level: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct AggregateReports {
    pub enabled: bool,
    pub frequency: String,
    pub destinations: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ForensicReports {
    pub enabled: bool,
    pub triggers: Vec<String>,
    pub destinations: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DmarcReport {
    pub domain: String,
    pub record_found: bool,
    pub dmarc_record: String,
    /// Name the record was found at (differs from `_dmarc.{domain}` after
    /// organizational-domain fallback).
    pub record_location: String,
    pub policy: PolicyReport,
    pub compliance_analysis: ComplianceAnalysis,
    pub subdomain_analysis: SubdomainAnalysis,
    pub aggregate_reports: AggregateReports,
    pub forensic_reports: ForensicReports,
    pub validation_checks: Vec<ValidationCheck>,
    pub recommendations: Vec<String>,
}

/// Policy strength, coverage and reporting folded into 0..=100.
pub fn compliance_score(record: &DmarcRecord) -> u8 {
    let coverage = f64::from(record.percent) / 100.0;
    let mut score = match record.policy {
        Policy::Reject => (POINTS_REJECT * coverage).round() as u32,
        Policy::Quarantine => (POINTS_QUARANTINE * coverage).round() as u32,
        Policy::None => POINTS_NONE,
    };
    let rua = !record.rua.is_empty();
    let ruf = !record.ruf.is_empty();
    if rua {
        score += POINTS_RUA;
    }
    if ruf {
        score += POINTS_RUF;
    }
    if rua && ruf {
        score += POINTS_BOTH_REPORTS;
    }
    score += match record.subdomain_policy {
        Policy::Reject => POINTS_SP_REJECT,
        Policy::Quarantine => POINTS_SP_QUARANTINE,
        Policy::None => 0,
    };
    score.min(100) as u8
}

fn strength(policy: Policy) -> &'static str {
    match policy {
        Policy::Reject => "strong",
        Policy::Quarantine => "moderate",
        Policy::None => "weak",
    }
}

fn subdomain_protection(policy: Policy) -> &'static str {
    match policy {
        Policy::Reject => "full",
        Policy::Quarantine => "partial",
        Policy::None => "none",
    }
}

fn frequency(interval: u32) -> String {
    match interval {
        SECONDS_PER_DAY => "Daily".to_string(),
        i if i % SECONDS_PER_DAY == 0 => format!("Every {} days", i / SECONDS_PER_DAY),
        i if i % 3600 == 0 => format!("Every {} hours", i / 3600),
        i => format!("Every {i} seconds"),
    }
}

fn failure_triggers(options: &[String]) -> Vec<String> {
    options
        .iter()
        .map(|o| match o.as_str() {
            "0" => "All mechanisms fail".to_string(),
            "1" => "Any mechanism fails".to_string(),
            "d" => "DKIM failure".to_string(),
            "s" => "SPF failure".to_string(),
            other => other.to_string(),
        })
        .collect()
}

fn checks(found: &DiscoveredRecord) -> Vec<ValidationCheck> {
    use CheckStatus::{Fail, Pass, Warning};
    let r = &found.record;
    let check = |name: &str, status, details: String| ValidationCheck {
        check: name.to_string(),
        status,
        details,
    };

    let mut out = vec![check(
        "DMARC Record Exists",
        Pass,
        if found.org_fallback {
            format!("Valid DMARC record inherited from {}", found.source.domain)
        } else {
            "Valid DMARC record found".to_string()
        },
    )];
    out.push(match r.policy {
        Policy::Reject => check("Policy Configuration", Pass, "Reject policy configured".into()),
        Policy::Quarantine => check("Policy Configuration", Pass, "Quarantine policy configured".into()),
        Policy::None => check("Policy Configuration", Warning, "Monitoring only (p=none): failing mail is delivered".into()),
    });
    out.push(match (r.rua.is_empty(), r.ruf.is_empty()) {
        (false, false) => check("Reporting Setup", Pass, "Both aggregate and forensic reporting configured".into()),
        (false, true) => check("Reporting Setup", Pass, "Aggregate reporting configured".into()),
        (true, false) => check("Reporting Setup", Warning, "Only forensic reporting configured".into()),
        (true, true) => check("Reporting Setup", Fail, "No reporting addresses configured".into()),
    });
    out.extend(r.ignored_uris.iter().map(|u| {
        check(
            "Report URI",
            Warning,
            format!("Ignored unusable report URI {u}; only mailto: addresses with an @ are used"),
        )
    }));
    out.push(if !r.subdomain_policy_inherited {
        check("Subdomain Policy", Pass, format!("Explicit subdomain policy sp={}", r.subdomain_policy.as_str()))
    } else if r.subdomain_policy == Policy::Reject {
        check("Subdomain Policy", Pass, "Subdomains inherit p=reject".into())
    } else {
        check(
            "Subdomain Policy",
            Warning,
            format!("No explicit subdomain policy set; subdomains inherit p={}", r.policy.as_str()),
        )
    });
    let mode = |m: AlignmentMode| match m {
        AlignmentMode::Strict => "strict",
        AlignmentMode::Relaxed => "relaxed",
    };
    out.push(check(
        "Alignment Mode",
        Pass,
        format!("DKIM {} / SPF {}", mode(r.dkim_alignment), mode(r.spf_alignment)),
    ));
    out.push(if r.percent == 100 {
        check("Percentage Coverage", Pass, "100% of emails covered by policy".into())
    } else {
        check("Percentage Coverage", Warning, format!("Policy applies to {}% of failing emails", r.percent))
    });
    out
}

fn recommendations(r: &DmarcRecord) -> Vec<String> {
    let mut out = Vec::new();
    match r.policy {
        Policy::None => out.push("Move from p=none to p=quarantine once reports show legitimate mail aligns".to_string()),
        Policy::Quarantine => out.push("Consider upgrading policy from \"quarantine\" to \"reject\" for maximum protection".to_string()),
        Policy::Reject => {}
    }
    if r.subdomain_policy_inherited && r.policy != Policy::Reject {
        out.push("Add explicit subdomain policy (sp=reject) to protect subdomains".to_string());
    }
    if r.percent < 100 {
        out.push(format!("Raise pct from {} to 100 to cover all failing mail", r.percent));
    }
    if r.rua.is_empty() {
        out.push("Add a rua= address to receive aggregate reports".to_string());
    } else {
        out.push("Monitor aggregate reports regularly for unauthorized sending sources".to_string());
    }
    out
}

pub fn build_report(domain: &str, found: &DiscoveredRecord) -> DmarcReport {
    let r = &found.record;
    let addresses = |uris: &[super::record::ReportUri]| uris.iter().map(|u| u.address.clone()).collect::<Vec<_>>();
    let risk = match r.subdomain_policy {
        Policy::Reject => "low",
        Policy::Quarantine => "medium",
        Policy::None => "high",
    };

    DmarcReport {
        domain: domain.to_string(),
        record_found: true,
        dmarc_record: found.source.raw_text.clone(),
        record_location: found.source.domain.clone(),
        policy: PolicyReport {
            version: r.version.clone(),
            policy: r.policy,
            subdomain_policy: r.subdomain_policy,
            subdomain_policy_inherited: r.subdomain_policy_inherited,
            non_existent_policy: r.non_existent_policy,
            percentage: r.percent,
            alignment: AlignmentModes {
                dkim: r.dkim_alignment,
                spf: r.spf_alignment,
            },
            reporting: ReportingSummary {
                aggregate_uri: r.rua.iter().map(|u| u.uri.clone()).collect(),
                forensic_uri: r.ruf.iter().map(|u| u.uri.clone()).collect(),
                interval: r.report_interval,
                interval_days: r.report_interval / SECONDS_PER_DAY,
                failure_options: r.failure_options.clone(),
            },
        },
        compliance_analysis: ComplianceAnalysis {
            overall_score: compliance_score(r),
            policy_strength: strength(r.policy).to_string(),
            reporting_configured: !r.rua.is_empty(),
            subdomain_protection: subdomain_protection(r.subdomain_policy).to_string(),
            spf_alignment: r.spf_alignment,
            dkim_alignment: r.dkim_alignment,
        },
        subdomain_analysis: SubdomainAnalysis {
            explicitly_protected: !r.subdomain_policy_inherited,
            inherits_policy: r.subdomain_policy_inherited,
            recommended_policy: Policy::Reject,
            risk_level: risk.to_string(),
        },
        aggregate_reports: AggregateReports {
            enabled: !r.rua.is_empty(),
            frequency: frequency(r.report_interval),
            destinations: addresses(&r.rua),
        },
        forensic_reports: ForensicReports {
            enabled: !r.ruf.is_empty(),
            triggers: failure_triggers(&r.failure_options),
            destinations: addresses(&r.ruf),
        },
        validation_checks: checks(found),
        recommendations: recommendations(r),
    }
}

/// Discover and report on the DMARC policy of `domain`.
pub async fn validate_dmarc<R: DnsResolver>(resolver: &R, domain: &str) -> Result<DmarcReport, InspectError> {
    let domain = normalize(domain);
    let found = discover(resolver, &domain).await?;
    Ok(build_report(&domain, &found))
}

/// A message's DMARC evaluation: the governing record and the outcome.
#[derive(Debug, Clone)]
pub struct DmarcEvaluation {
    pub record: DiscoveredRecord,
    pub outcome: AlignmentOutcome,
}

/// Discover the policy for `from_domain` and evaluate a message's SPF and
/// DKIM results against it.
pub async fn evaluate<R: DnsResolver>(
    resolver: &R,
    from_domain: &str,
    spf: Option<&SpfIdentity>,
    dkim: &[DkimIdentity],
) -> Result<DmarcEvaluation, InspectError> {
    let from_domain = normalize(from_domain);
    let record = discover(resolver, &from_domain).await?;
    let outcome = evaluate_alignment(&record.record, &from_domain, record.org_fallback, spf, dkim);
    Ok(DmarcEvaluation { record, outcome })
}

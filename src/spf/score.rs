use serde::Serialize;

use super::eval::{Resolution, SpfNode, SpfOutcome, SpfTree, TermStatus, MAX_DNS_LOOKUPS};
use super::term::{Mechanism, Qualifier, SpfTerm};
use super::SpfResult;

const BASE_HARD_FAIL: i32 = 100;
const BASE_SOFT_FAIL: i32 = 70;
const BASE_WEAK: i32 = 30;
const PENALTY_BROKEN_INCLUDE: i32 = 15;
const PENALTY_NEAR_LIMIT: i32 = 10;
const PENALTY_LIMIT_EXCEEDED: i32 = 40;
const PENALTY_PTR: i32 = 5;
/// Lookup count above which a record is reported as close to the limit.
const NEAR_LIMIT: usize = 8;

#[derive(Debug, Clone, Serialize)]
pub struct SpfReport {
    pub domain: String,
    pub record: String,
    pub valid: bool,
    pub mechanisms: Vec<MechanismReport>,
    pub lookups: LookupSummary,
    pub policy: PolicySummary,
    pub includes: Vec<IncludeReport>,
    pub recommendations: Vec<String>,
    pub matched_qualifier: Qualifier,
    pub result: SpfResult,
    pub security_score: u8,
}

#[derive(Debug, Clone, Serialize)]
pub struct MechanismReport {
    #[serde(rename = "type")]
    pub kind: String,
    pub value: String,
    pub description: String,
    pub status: TermStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LookupSummary {
    pub total: usize,
    pub limit: usize,
    pub warning: bool,
    pub limit_exceeded: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct PolicySummary {
    pub qualifier: String,
    pub action: String,
    pub description: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct IncludeReport {
    pub domain: String,
    pub record: String,
    pub valid: bool,
    pub ip_ranges: Vec<String>,
}

/// Qualifier of the `all` that ends evaluation, following redirects.
fn effective_all(tree: &SpfTree) -> Option<Qualifier> {
    let mut id = 0;
    for _ in 0..tree.nodes.len() {
        let node = tree.nodes.get(id)?;
        if let Some(q) = node
            .terms
            .iter()
            .filter_map(|t| t.term.directive())
            .find(|d| d.mechanism == Mechanism::All)
            .map(|d| d.qualifier)
        {
            return Some(q);
        }
        id = node.terms.iter().find_map(|t| match (&t.term, &t.resolution) {
            (SpfTerm::Redirect(_), Resolution::Child(c)) => Some(*c),
            _ => None,
        })?;
    }
    None
}

fn broken_references(tree: &SpfTree) -> usize {
    tree.nodes
        .iter()
        .flat_map(|n| n.terms.iter())
        .filter(|t| {
            matches!(t.term, SpfTerm::Redirect(_) | SpfTerm::Directive(_))
                && matches!(t.resolution, Resolution::Child(_))
                && t.status == TermStatus::Invalid
        })
        .count()
}

fn uses_ptr(tree: &SpfTree) -> bool {
    tree.nodes.iter().flat_map(|n| n.terms.iter()).any(|t| {
        matches!(t.term.directive(), Some(d) if matches!(d.mechanism, Mechanism::Ptr(_)))
    })
}

/// Deterministic 0..=100 score from the closing qualifier and chain health.
pub fn security_score(tree: &SpfTree) -> u8 {
    let mut score = match effective_all(tree) {
        Some(Qualifier::Fail) => BASE_HARD_FAIL,
        Some(Qualifier::SoftFail) => BASE_SOFT_FAIL,
        _ => BASE_WEAK,
    };
    score -= PENALTY_BROKEN_INCLUDE * broken_references(tree) as i32;
    if tree.lookup_count > NEAR_LIMIT {
        score -= PENALTY_NEAR_LIMIT;
    }
    if tree.lookup_limit_exceeded {
        score -= PENALTY_LIMIT_EXCEEDED;
    }
    if uses_ptr(tree) {
        score -= PENALTY_PTR;
    }
    score.clamp(0, 100) as u8
}

fn describe(term: &SpfTerm) -> String {
    match term {
        SpfTerm::Version => "SPF version 1".to_string(),
        SpfTerm::Directive(d) => match &d.mechanism {
            Mechanism::All => match d.qualifier {
                Qualifier::Fail => "Reject mail from all other sources".to_string(),
                Qualifier::SoftFail => "Soft fail for all other sources".to_string(),
                Qualifier::Neutral => "No policy for other sources".to_string(),
                Qualifier::Pass => "Allow mail from any source".to_string(),
            },
            Mechanism::Include(t) => format!("Include the SPF record of {t}"),
            Mechanism::A { domain, .. } => match domain {
                Some(t) => format!("Authorize the A/AAAA addresses of {t}"),
                None => "Authorize the domain's own A/AAAA addresses".to_string(),
            },
            Mechanism::Mx { domain, .. } => match domain {
                Some(t) => format!("Authorize the mail exchangers of {t}"),
                None => "Authorize the domain's own mail exchangers".to_string(),
            },
            Mechanism::Ptr(_) => "Authorize hosts by reverse DNS name".to_string(),
            Mechanism::Ip4(c) | Mechanism::Ip6(c) => format!("Authorize {c}"),
            Mechanism::Exists(t) => format!("Authorize when {t} resolves"),
        },
        SpfTerm::Redirect(t) => format!("Use the SPF record of {t}"),
        SpfTerm::Explanation(t) => format!("Explanation text published at {t}"),
        SpfTerm::Modifier { name, .. } => format!("Unknown modifier {name}"),
    }
}

fn policy_summary(all: Option<Qualifier>) -> PolicySummary {
    let (qualifier, action, description) = match all {
        Some(Qualifier::Fail) => ("-all", "Reject", "Mail from unlisted sources should be rejected"),
        Some(Qualifier::SoftFail) => (
            "~all",
            "Mark as suspicious",
            "Mail from unlisted sources should be accepted but marked",
        ),
        Some(Qualifier::Neutral) => ("?all", "No action", "The domain makes no assertion about other sources"),
        Some(Qualifier::Pass) => ("+all", "Accept", "Every host on the internet may send for this domain"),
        None => ("none", "No action", "No all mechanism; unlisted sources evaluate to neutral"),
    };
    PolicySummary {
        qualifier: qualifier.to_string(),
        action: action.to_string(),
        description: description.to_string(),
    }
}

fn ip_ranges(node: &SpfNode) -> Vec<String> {
    node.terms
        .iter()
        .filter_map(|t| t.term.directive())
        .filter_map(|d| match &d.mechanism {
            Mechanism::Ip4(c) | Mechanism::Ip6(c) => Some(c.to_string()),
            _ => None,
        })
        .collect()
}

fn recommendations(tree: &SpfTree, all: Option<Qualifier>) -> Vec<String> {
    let mut out = Vec::new();
    match all {
        None => out.push("Add an explicit -all or ~all mechanism to the end of the record".to_string()),
        Some(Qualifier::Pass) => out.push("Replace +all: it authorizes every host on the internet".to_string()),
        Some(Qualifier::Neutral) => out.push("Use ~all or -all instead of ?all to protect the domain".to_string()),
        Some(Qualifier::SoftFail) => {
            out.push("Consider moving from ~all to -all once all senders are listed".to_string())
        }
        Some(Qualifier::Fail) => {}
    }
    if tree.lookup_limit_exceeded {
        out.push(format!(
            "The record needs more than {MAX_DNS_LOOKUPS} DNS lookups; flatten includes or replace them with ip4/ip6 ranges"
        ));
    } else if tree.lookup_count > NEAR_LIMIT {
        out.push(format!(
            "{} of {MAX_DNS_LOOKUPS} DNS lookups used; the record is close to the limit",
            tree.lookup_count
        ));
    }
    if broken_references(tree) > 0 {
        out.push("Remove or fix includes that do not resolve to a valid SPF record".to_string());
    }
    if uses_ptr(tree) {
        out.push("Avoid the ptr mechanism; it is slow and deprecated".to_string());
    }
    out
}

pub fn build_report(tree: &SpfTree, outcome: &SpfOutcome) -> SpfReport {
    let root = &tree.nodes[0];
    let all = effective_all(tree);

    let mechanisms = root
        .terms
        .iter()
        .filter(|t| t.term != SpfTerm::Version)
        .map(|t| MechanismReport {
            kind: t.term.kind().to_string(),
            value: t.term.value(),
            description: describe(&t.term),
            status: t.status,
            detail: t.detail.clone(),
        })
        .collect();

    let includes = tree.nodes[1..]
        .iter()
        .map(|n| IncludeReport {
            domain: n.domain.clone(),
            record: n.record.clone().unwrap_or_default(),
            valid: n.error.is_none()
                && n.terms.iter().all(|t| t.status != TermStatus::Invalid),
            ip_ranges: ip_ranges(n),
        })
        .collect();

    let valid = !tree.lookup_limit_exceeded
        && tree
            .nodes
            .iter()
            .all(|n| n.error.is_none() && n.terms.iter().all(|t| t.status != TermStatus::Invalid));

    SpfReport {
        domain: root.domain.clone(),
        record: root.record.clone().unwrap_or_default(),
        valid,
        mechanisms,
        lookups: LookupSummary {
            total: tree.lookup_count,
            limit: MAX_DNS_LOOKUPS,
            warning: tree.lookup_count > NEAR_LIMIT || tree.lookup_limit_exceeded,
            limit_exceeded: tree.lookup_limit_exceeded,
        },
        policy: policy_summary(all),
        includes,
        recommendations: recommendations(tree, all),
        matched_qualifier: outcome.matched_qualifier,
        result: outcome.result,
        security_score: security_score(tree),
    }
}

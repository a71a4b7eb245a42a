//! SPF evaluator: record selection, term grammar, chain walk and scoring.

mod eval;
mod record;
mod score;
mod term;

pub use eval::{
    fold, EvaluatedTerm, LookupBudget, Resolution, SpfContext, SpfEvaluator, SpfNode, SpfOutcome, SpfTree,
    TermStatus, MAX_DNS_LOOKUPS,
};
pub use record::{fetch_spf_record, select_record, SpfRecord};
pub use score::{build_report, security_score, IncludeReport, LookupSummary, MechanismReport, PolicySummary, SpfReport};
pub use term::{is_spf_record, parse_record, render, Directive, DualCidr, Mechanism, Qualifier, SpfParseError, SpfTerm};

use serde::Serialize;

use crate::common::dns::DnsResolver;
use crate::error::InspectError;

/// check_host() result (RFC 7208 §2.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SpfResult {
    None,
    Neutral,
    Pass,
    Fail,
    SoftFail,
    TempError,
    PermError,
}

impl From<Qualifier> for SpfResult {
    fn from(q: Qualifier) -> Self {
        match q {
            Qualifier::Pass => SpfResult::Pass,
            Qualifier::Fail => SpfResult::Fail,
            Qualifier::SoftFail => SpfResult::SoftFail,
            Qualifier::Neutral => SpfResult::Neutral,
        }
    }
}

impl SpfResult {
    pub fn qualifier(&self) -> Option<Qualifier> {
        match self {
            SpfResult::Pass => Some(Qualifier::Pass),
            SpfResult::Fail => Some(Qualifier::Fail),
            SpfResult::SoftFail => Some(Qualifier::SoftFail),
            SpfResult::Neutral => Some(Qualifier::Neutral),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SpfResult::None => "none",
            SpfResult::Neutral => "neutral",
            SpfResult::Pass => "pass",
            SpfResult::Fail => "fail",
            SpfResult::SoftFail => "softfail",
            SpfResult::TempError => "temperror",
            SpfResult::PermError => "permerror",
        }
    }
}

/// Walk, fold and score the SPF record of `domain`.
pub async fn validate_spf<R: DnsResolver>(
    resolver: &R,
    domain: &str,
    ctx: &SpfContext,
) -> Result<SpfReport, InspectError> {
    let tree = SpfEvaluator::new(resolver.clone()).walk(domain, ctx).await?;
    let outcome = fold(&tree, ctx);
    Ok(build_report(&tree, &outcome))
}

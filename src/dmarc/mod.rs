//! DMARC evaluator (RFC 7489): record discovery, alignment and compliance
//! reporting.

mod alignment;
mod eval;
mod record;

pub use alignment::{
    aligned, evaluate_alignment, evaluate_with_sample, AlignmentOutcome, Disposition, DkimIdentity, SpfIdentity,
};
pub use eval::{
    build_report, compliance_score, evaluate, validate_dmarc, AggregateReports, AlignmentModes, CheckStatus,
    ComplianceAnalysis, DmarcEvaluation, DmarcReport, ForensicReports, PolicyReport, ReportingSummary,
    SubdomainAnalysis, ValidationCheck,
};
pub use record::{
    discover, is_dmarc_record, AlignmentMode, DiscoveredRecord, DmarcParseError, DmarcRecord, Policy, ReportUri,
};

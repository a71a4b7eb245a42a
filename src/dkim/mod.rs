//! DKIM evaluator: selector key records, signature parsing, canonicalization
//! and verification.

mod canon;
mod eval;
mod key;
mod signature;
mod tags;
mod verify;

pub use canon::{canonicalize_body, canonicalize_header, normalize_line_endings, split_message, RawHeader};
pub use eval::{DkimEvaluator, DkimReport, KeySecurity, PublicKeyReport, TestStatus, ValidationTest};
pub use key::{is_key_record, DkimKeyRecord, KeyAlgorithm, KeyEncoding, KeyError};
pub use signature::{Algorithm, Canonicalization, CanonicalizationMethod, DkimSignature, HashAlgorithm};
pub use tags::{DkimParseError, TagList};
pub use verify::{analyze, SignatureAnalysis};

use crate::common::dns::DnsResolver;
use crate::error::InspectError;

/// Validate the key at `{selector}._domainkey.{domain}`, and the matching
/// signature on `message` when one is supplied.
pub async fn validate_dkim<R: DnsResolver>(
    resolver: &R,
    domain: &str,
    selector: &str,
    message: Option<&[u8]>,
    clock_skew_secs: u64,
) -> Result<DkimReport, InspectError> {
    DkimEvaluator::new(resolver.clone())
        .clock_skew(clock_skew_secs)
        .validate(domain, selector, message)
        .await
}

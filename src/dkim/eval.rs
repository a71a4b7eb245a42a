use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;
use tracing::{debug, warn};

use super::canon::split_message;
use super::key::{is_key_record, DkimKeyRecord, KeyAlgorithm, KeyEncoding};
use super::signature::{DkimSignature, HashAlgorithm};
use super::verify::{analyze, SignatureAnalysis};
use crate::common::dns::{fetch_records, DnsError, DnsResolver, DomainRecord, RecordKind};
use crate::common::domain::normalize;
use crate::error::{ErrorKind, InspectError};

const PENALTY_KEY_CRITICAL: i32 = 50;
const PENALTY_KEY_MODERATE: i32 = 20;
const PENALTY_EXPIRED: i32 = 20;
const PENALTY_INVALID_SIGNATURE: i32 = 40;
const PENALTY_SHA1: i32 = 10;
const PENALTY_TESTING: i32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TestStatus {
    Pass,
    Warning,
    Fail,
}

#[derive(Debug, Clone, Serialize)]
pub struct ValidationTest {
    pub test: String,
    pub status: TestStatus,
    pub details: String,
}

impl ValidationTest {
    fn new(test: &str, status: TestStatus, details: impl Into<String>) -> Self {
        Self {
            test: test.to_string(),
            status,
            details: details.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PublicKeyReport {
    pub algorithm: KeyAlgorithm,
    pub key_type: KeyEncoding,
    pub key_size: usize,
    pub valid: bool,
    pub expires: Option<DateTime<Utc>>,
    pub revoked: bool,
    pub testing: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct KeySecurity {
    pub key_strength: String,
    pub recommended_key_size: String,
    pub vulnerabilities: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DkimReport {
    pub domain: String,
    pub selector: String,
    pub record_found: bool,
    pub dkim_record: String,
    pub public_key: PublicKeyReport,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signature_analysis: Option<SignatureAnalysis>,
    pub validation_tests: Vec<ValidationTest>,
    pub security_analysis: KeySecurity,
    pub recommendations: Vec<String>,
    pub security_score: u8,
}

/// Outcome of looking for a signature from this domain/selector in a message.
#[derive(Debug, Clone)]
enum MessageCheck {
    NotSupplied,
    NoSignature,
    Unparseable(String),
    Analysed {
        analysis: SignatureAnalysis,
        expires: Option<DateTime<Utc>>,
        expired: bool,
    },
}

/// Fetches selector keys and checks signatures made with them.
#[derive(Clone)]
pub struct DkimEvaluator<R: DnsResolver> {
    resolver: R,
    clock_skew_secs: u64,
}

impl<R: DnsResolver> DkimEvaluator<R> {
    pub fn new(resolver: R) -> Self {
        Self {
            resolver,
            clock_skew_secs: 300,
        }
    }

    pub fn clock_skew(mut self, secs: u64) -> Self {
        self.clock_skew_secs = secs;
        self
    }

    /// Fetch and parse `{selector}._domainkey.{domain}`.
    pub async fn fetch_key(&self, domain: &str, selector: &str) -> Result<(DomainRecord, DkimKeyRecord), InspectError> {
        let name = format!("{selector}._domainkey.{domain}");
        let records = match fetch_records(&self.resolver, &name, RecordKind::Dkim, is_key_record).await {
            Ok(records) => records,
            Err(DnsError::NxDomain) => Vec::new(),
            Err(e) => return Err(e.into()),
        };
        let Some(record) = records.into_iter().next() else {
            return Err(InspectError::new(
                ErrorKind::NoDkimRecord,
                format!("no DKIM key published at {name}"),
            ));
        };
        let key = DkimKeyRecord::parse(selector, domain, &record.raw_text).map_err(|e| {
            warn!(%name, error = %e, "malformed DKIM key record");
            InspectError::from(e)
        })?;
        debug!(%name, algorithm = ?key.algorithm, bits = key.key_size_bits, "decoded DKIM key");
        Ok((record, key))
    }

    /// Validate the selector record and, when given, the signature it made on `message`.
    pub async fn validate(
        &self,
        domain: &str,
        selector: &str,
        message: Option<&[u8]>,
    ) -> Result<DkimReport, InspectError> {
        let domain = normalize(domain);
        let selector = selector.trim().to_string();
        let (record, key) = self.fetch_key(&domain, &selector).await?;

        let check = match message {
            Some(message) => self.check_message(&domain, &selector, &key, message),
            None => MessageCheck::NotSupplied,
        };
        Ok(build_report(&domain, &selector, &record, &key, &check))
    }

    fn check_message(&self, domain: &str, selector: &str, key: &DkimKeyRecord, message: &[u8]) -> MessageCheck {
        let (headers, body) = split_message(message);
        let mut parse_error = None;
        for header in headers.iter().filter(|h| h.name.trim().eq_ignore_ascii_case("dkim-signature")) {
            let sig = match DkimSignature::parse(&header.value_str()) {
                Ok(sig) => sig,
                Err(e) => {
                    parse_error.get_or_insert(e.to_string());
                    continue;
                }
            };
            if sig.domain != domain || !sig.selector.eq_ignore_ascii_case(selector) {
                continue;
            }
            let analysis = analyze(&sig, key, &headers, header, &body);
            let expires = sig.expiration.and_then(|x| Utc.timestamp_opt(x as i64, 0).single());
            let now = Utc::now().timestamp();
            let expired = sig
                .expiration
                .is_some_and(|x| (x as i64).saturating_add(self.clock_skew_secs as i64) < now);
            return MessageCheck::Analysed { analysis, expires, expired };
        }
        match parse_error {
            Some(e) => MessageCheck::Unparseable(e),
            None => MessageCheck::NoSignature,
        }
    }
}

fn key_strength(key: &DkimKeyRecord) -> (TestStatus, &'static str) {
    match key.algorithm {
        KeyAlgorithm::Ed25519 => (TestStatus::Pass, "Strong"),
        KeyAlgorithm::Rsa if key.key_size_bits >= 2048 => (TestStatus::Pass, "Strong"),
        KeyAlgorithm::Rsa if key.key_size_bits >= 1024 => (TestStatus::Warning, "Moderate"),
        KeyAlgorithm::Rsa => (TestStatus::Fail, "Weak"),
    }
}

fn only_sha1(key: &DkimKeyRecord) -> bool {
    key.hash_algorithms
        .as_ref()
        .is_some_and(|h| h.iter().all(|a| *a == HashAlgorithm::Sha1))
}

/// 100 minus the penalties that apply. A revoked key scores 0.
pub fn security_score(key: &DkimKeyRecord, analysis: Option<&SignatureAnalysis>, expired: bool) -> u8 {
    if key.revoked {
        return 0;
    }
    let mut score = 100;
    score -= match key_strength(key).0 {
        TestStatus::Fail => PENALTY_KEY_CRITICAL,
        TestStatus::Warning => PENALTY_KEY_MODERATE,
        TestStatus::Pass => 0,
    };
    if expired {
        score -= PENALTY_EXPIRED;
    }
    if analysis.is_some_and(|a| !a.signature_valid) {
        score -= PENALTY_INVALID_SIGNATURE;
    }
    if only_sha1(key) || analysis.is_some_and(|a| a.hash_algorithm == HashAlgorithm::Sha1) {
        score -= PENALTY_SHA1;
    }
    if key.testing {
        score -= PENALTY_TESTING;
    }
    score.clamp(0, 100) as u8
}

fn build_report(
    domain: &str,
    selector: &str,
    record: &DomainRecord,
    key: &DkimKeyRecord,
    check: &MessageCheck,
) -> DkimReport {
    use TestStatus::{Fail, Pass, Warning};

    let mut tests = vec![ValidationTest::new(
        "DNS Record",
        Pass,
        format!("Key record published at {selector}._domainkey.{domain}"),
    )];
    let mut vulnerabilities = Vec::new();
    let mut recommendations = Vec::new();

    if key.revoked {
        tests.push(ValidationTest::new("Key Format", Fail, "Key revoked (empty p= tag)"));
        vulnerabilities.push("Selector key is revoked; signatures made with it cannot verify".to_string());
        recommendations.push("Publish a new key or retire this selector".to_string());
    } else {
        tests.push(ValidationTest::new(
            "Key Format",
            Pass,
            format!("{:?} public key decoded ({:?})", key.algorithm, key.key_type),
        ));
        let (status, strength) = key_strength(key);
        tests.push(ValidationTest::new(
            "Key Length",
            status,
            format!("{} bit {:?} key ({strength})", key.key_size_bits, key.algorithm),
        ));
        match status {
            Fail => {
                vulnerabilities.push(format!("{}-bit RSA keys can be factored", key.key_size_bits));
                recommendations.push("Rotate to a 2048-bit RSA or Ed25519 key immediately".to_string());
            }
            Warning => {
                vulnerabilities.push(format!("{}-bit RSA is below current recommendations", key.key_size_bits));
                recommendations.push("Upgrade to a 2048-bit RSA key".to_string());
            }
            Pass => {}
        }
    }

    if key.testing {
        tests.push(ValidationTest::new("Testing Mode", Warning, "t=y: receivers treat failures as unsigned"));
        recommendations.push("Remove t=y once signing is confirmed to work".to_string());
    }
    if !key.allows_email() {
        tests.push(ValidationTest::new("Service Type", Fail, "s= does not include email"));
    }
    if only_sha1(key) {
        tests.push(ValidationTest::new("Hash Algorithms", Warning, "h= only permits SHA-1"));
        vulnerabilities.push("SHA-1 signatures are deprecated (RFC 8301)".to_string());
    }

    let mut analysis = None;
    let mut expires = None;
    let mut expired = false;
    match check {
        MessageCheck::NotSupplied => {}
        MessageCheck::NoSignature => tests.push(ValidationTest::new(
            "Signature Present",
            Fail,
            format!("No DKIM-Signature with d={domain} s={selector} in the message"),
        )),
        MessageCheck::Unparseable(e) => tests.push(ValidationTest::new(
            "Signature Present",
            Fail,
            format!("DKIM-Signature could not be parsed: {e}"),
        )),
        MessageCheck::Analysed { analysis: a, expires: x, expired: e } => {
            let verdict = |ok: bool| if ok { Pass } else { Fail };
            tests.push(ValidationTest::new(
                "Body Hash",
                verdict(a.body_hash_valid),
                if a.body_hash_valid { "bh= matches the canonical body" } else { "Body was modified after signing" },
            ));
            tests.push(ValidationTest::new(
                "Header Hash",
                verdict(a.header_hash_valid),
                if a.header_hash_valid { "Signature verifies over the signed headers" } else { "Signature does not verify over the signed headers" },
            ));
            let detail = match &a.key_constraint {
                Some(c) => c.clone(),
                None if a.signature_valid => "Signature is valid".to_string(),
                None => "Signature is invalid".to_string(),
            };
            tests.push(ValidationTest::new("Signature", verdict(a.signature_valid), detail));
            if *e {
                tests.push(ValidationTest::new("Signature Expiry", Fail, "x= is in the past"));
            }
            if a.hash_algorithm == HashAlgorithm::Sha1 {
                recommendations.push("Sign with rsa-sha256 or ed25519-sha256 instead of rsa-sha1".to_string());
            }
            analysis = Some(a.clone());
            expires = *x;
            expired = *e;
        }
    }

    let (_, strength) = key_strength(key);
    DkimReport {
        domain: domain.to_string(),
        selector: selector.to_string(),
        record_found: true,
        dkim_record: record.raw_text.clone(),
        public_key: PublicKeyReport {
            algorithm: key.algorithm,
            key_type: key.key_type,
            key_size: key.key_size_bits,
            valid: !key.revoked,
            expires,
            revoked: key.revoked,
            testing: key.testing,
        },
        security_score: security_score(key, analysis.as_ref(), expired),
        signature_analysis: analysis,
        validation_tests: tests,
        security_analysis: KeySecurity {
            key_strength: if key.revoked { "Revoked".to_string() } else { strength.to_string() },
            recommended_key_size: "2048-bit RSA or Ed25519".to_string(),
            vulnerabilities,
        },
        recommendations,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::dns::MockResolver;
    use crate::dkim::key::tests::spki_key;
    use crate::dkim::verify::tests::TestSigner;
    use base64::Engine;

    fn rsa_txt(bits: usize) -> String {
        format!(
            "v=DKIM1; k=rsa; p={}",
            base64::engine::general_purpose::STANDARD.encode(spki_key(bits))
        )
    }

    #[tokio::test]
    async fn selector_lookup_without_message() {
        let resolver = MockResolver::new();
        resolver.add_txt("s1._domainkey.example.com", vec![rsa_txt(2048)]);
        let report = DkimEvaluator::new(resolver).validate("Example.com.", "s1", None).await.unwrap();
        assert!(report.record_found);
        assert_eq!(report.public_key.key_size, 2048);
        assert!(report.signature_analysis.is_none());
        assert_eq!(report.security_score, 100);
        assert!(report.validation_tests.iter().all(|t| t.status == TestStatus::Pass));
    }

    #[tokio::test]
    async fn key_size_penalties() {
        let resolver = MockResolver::new();
        resolver.add_txt("weak._domainkey.example.com", vec![rsa_txt(512)]);
        resolver.add_txt("mid._domainkey.example.com", vec![rsa_txt(1024)]);
        let eval = DkimEvaluator::new(resolver);

        let weak = eval.validate("example.com", "weak", None).await.unwrap();
        assert_eq!(weak.security_score, 50);
        assert_eq!(weak.security_analysis.key_strength, "Weak");
        let mid = eval.validate("example.com", "mid", None).await.unwrap();
        assert_eq!(mid.security_score, 80);
    }

    #[tokio::test]
    async fn missing_and_malformed_records() {
        let resolver = MockResolver::new();
        resolver.set_nxdomain("gone._domainkey.example.com");
        resolver.add_txt("bad._domainkey.example.com", vec!["v=DKIM1; k=ed25519; p=AAAA".into()]);
        resolver.add_txt("other._domainkey.example.com", vec!["google-site-verification=xyz".into()]);
        let eval = DkimEvaluator::new(resolver);

        assert_eq!(eval.validate("example.com", "gone", None).await.unwrap_err().kind, ErrorKind::NoDkimRecord);
        assert_eq!(eval.validate("example.com", "other", None).await.unwrap_err().kind, ErrorKind::NoDkimRecord);
        assert_eq!(
            eval.validate("example.com", "bad", None).await.unwrap_err().kind,
            ErrorKind::MalformedPublicKey
        );
    }

    #[tokio::test]
    async fn signed_message_is_verified() {
        let signer = TestSigner::new();
        let resolver = MockResolver::new();
        resolver.add_txt("s1._domainkey.example.com", vec![signer.key_txt()]);
        let msg = signer.sign(
            "example.com",
            "s1",
            "relaxed/relaxed",
            "From: a@example.com\r\nSubject: hi\r\n",
            "hello\r\n",
        );
        let eval = DkimEvaluator::new(resolver);

        let report = eval.validate("example.com", "s1", Some(msg.as_bytes())).await.unwrap();
        let analysis = report.signature_analysis.unwrap();
        assert!(analysis.signature_valid);
        assert_eq!(report.security_score, 100);

        let tampered = msg.replace("hello", "goodbye");
        let report = eval.validate("example.com", "s1", Some(tampered.as_bytes())).await.unwrap();
        assert!(!report.signature_analysis.unwrap().body_hash_valid);
        assert_eq!(report.security_score, 60);
    }

    #[tokio::test]
    async fn message_without_matching_signature() {
        let resolver = MockResolver::new();
        resolver.add_txt("s1._domainkey.example.com", vec![rsa_txt(2048)]);
        let report = DkimEvaluator::new(resolver)
            .validate("example.com", "s1", Some(b"From: a@example.com\r\n\r\nbody"))
            .await
            .unwrap();
        assert!(report.signature_analysis.is_none());
        let test = report.validation_tests.iter().find(|t| t.test == "Signature Present").unwrap();
        assert_eq!(test.status, TestStatus::Fail);
    }

    #[tokio::test]
    async fn revoked_key_scores_zero() {
        let resolver = MockResolver::new();
        resolver.add_txt("old._domainkey.example.com", vec!["v=DKIM1; p=".into()]);
        let report = DkimEvaluator::new(resolver).validate("example.com", "old", None).await.unwrap();
        assert!(report.public_key.revoked);
        assert!(!report.public_key.valid);
        assert_eq!(report.security_score, 0);
    }
}

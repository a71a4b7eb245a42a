//! Body hash, header hash and signature checks for one DKIM-Signature.

use ring::digest;
use ring::signature::{self as ring_sig, UnparsedPublicKey, VerificationAlgorithm};
use serde::Serialize;
use subtle::ConstantTimeEq;

use super::canon::{
    apply_body_length_limit, canonicalize_body, canonicalize_header, select_headers, strip_b_tag_value, RawHeader,
};
use super::key::{DkimKeyRecord, KeyAlgorithm};
use super::signature::{Algorithm, DkimSignature, HashAlgorithm};

/// Verification facts for one signature. Mismatches are `false`, never errors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SignatureAnalysis {
    pub canonicalization: String,
    pub hash_algorithm: HashAlgorithm,
    pub body_hash_valid: bool,
    /// The signature verifies over the recomputed header hash.
    pub header_hash_valid: bool,
    /// Both hashes hold and the key permits this signature.
    pub signature_valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_constraint: Option<String>,
}

pub fn compute_hash(hash: HashAlgorithm, data: &[u8]) -> Vec<u8> {
    let alg = match hash {
        HashAlgorithm::Sha256 => &digest::SHA256,
        HashAlgorithm::Sha1 => &digest::SHA1_FOR_LEGACY_USE_ONLY,
    };
    digest::digest(alg, data).as_ref().to_vec()
}

/// Canonical body hash, truncated to `l=` if present.
pub fn body_hash(sig: &DkimSignature, body: &[u8]) -> Vec<u8> {
    let canonical = canonicalize_body(sig.canonicalization.body, body);
    compute_hash(
        sig.algorithm.hash(),
        apply_body_length_limit(&canonical, sig.body_length),
    )
}

/// Signed header block followed by the signature header itself with `b=`
/// emptied and no trailing CRLF. `sig_header` is excluded from selection.
pub fn header_hash_input(
    sig: &DkimSignature,
    headers: &[RawHeader],
    sig_header: &RawHeader,
) -> Vec<u8> {
    let candidates: Vec<&RawHeader> = headers.iter().filter(|h| !std::ptr::eq(*h, sig_header)).collect();
    let method = sig.canonicalization.header;
    let mut input: Vec<u8> = select_headers(method, &sig.signed_headers, &candidates).concat();
    let stripped = strip_b_tag_value(&sig_header.value_str());
    input.extend_from_slice(&canonicalize_header(method, &sig_header.name, stripped.as_bytes()));
    input
}

/// Why `key` may not be used for `sig`, if anything.
pub fn key_constraint_violation(sig: &DkimSignature, key: &DkimKeyRecord) -> Option<String> {
    if key.revoked {
        return Some("key revoked (empty p=)".into());
    }
    if sig.algorithm.key_algorithm() != key.algorithm {
        return Some(format!("key type {:?} cannot verify {:?}", key.algorithm, sig.algorithm));
    }
    if let Some(hashes) = &key.hash_algorithms {
        if !hashes.contains(&sig.algorithm.hash()) {
            return Some(format!("key h= does not permit {:?}", sig.algorithm.hash()));
        }
    }
    if !key.allows_email() {
        return Some("key s= does not include email".into());
    }
    if key.strict && !sig.auid_domain().eq_ignore_ascii_case(&sig.domain) {
        return Some(format!(
            "strict key requires i= domain {} to equal d= {}",
            sig.auid_domain(),
            sig.domain
        ));
    }
    None
}

/// Check `signature` over `data` with the key's verification material.
pub fn verify_signature(algorithm: Algorithm, key: &DkimKeyRecord, data: &[u8], signature: &[u8]) -> bool {
    if key.verification_key.is_empty() {
        return false;
    }
    let ring_alg: &'static dyn VerificationAlgorithm = match (algorithm, key.algorithm) {
        (Algorithm::RsaSha256, KeyAlgorithm::Rsa) if key.key_size_bits >= 2048 => &ring_sig::RSA_PKCS1_2048_8192_SHA256,
        (Algorithm::RsaSha256, KeyAlgorithm::Rsa) => &ring_sig::RSA_PKCS1_1024_8192_SHA256_FOR_LEGACY_USE_ONLY,
        (Algorithm::RsaSha1, KeyAlgorithm::Rsa) if key.key_size_bits >= 2048 => {
            &ring_sig::RSA_PKCS1_2048_8192_SHA1_FOR_LEGACY_USE_ONLY
        }
        (Algorithm::RsaSha1, KeyAlgorithm::Rsa) => &ring_sig::RSA_PKCS1_1024_8192_SHA1_FOR_LEGACY_USE_ONLY,
        (Algorithm::Ed25519Sha256, KeyAlgorithm::Ed25519) => &ring_sig::ED25519,
        _ => return false,
    };
    // RFC 8463: Ed25519 signs the SHA-256 of the header data
    let message = match algorithm {
        Algorithm::Ed25519Sha256 => compute_hash(HashAlgorithm::Sha256, data),
        _ => data.to_vec(),
    };
    UnparsedPublicKey::new(ring_alg, &key.verification_key)
        .verify(&message, signature)
        .is_ok()
}

/// Run every check for one signature.
pub fn analyze(
    sig: &DkimSignature,
    key: &DkimKeyRecord,
    headers: &[RawHeader],
    sig_header: &RawHeader,
    body: &[u8],
) -> SignatureAnalysis {
    let computed = body_hash(sig, body);
    let body_hash_valid = computed.ct_eq(&sig.body_hash).into();

    let input = header_hash_input(sig, headers, sig_header);
    let header_hash_valid = verify_signature(sig.algorithm, key, &input, &sig.signature);
    let key_constraint = key_constraint_violation(sig, key);

    tracing::debug!(
        domain = %sig.domain,
        selector = %sig.selector,
        body_hash_valid,
        header_hash_valid,
        "dkim signature checked"
    );

    SignatureAnalysis {
        canonicalization: sig.canonicalization.to_string(),
        hash_algorithm: sig.algorithm.hash(),
        body_hash_valid,
        header_hash_valid,
        signature_valid: body_hash_valid && header_hash_valid && key_constraint.is_none(),
        key_constraint,
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::dkim::canon::split_message;
    use base64::Engine;
    use ring::rand::SystemRandom;
    use ring::signature::{Ed25519KeyPair, KeyPair};

    pub(crate) struct TestSigner {
        pub pair: Ed25519KeyPair,
    }

    impl TestSigner {
        pub fn new() -> Self {
            let pkcs8 = Ed25519KeyPair::generate_pkcs8(&SystemRandom::new()).unwrap();
            Self { pair: Ed25519KeyPair::from_pkcs8(pkcs8.as_ref()).unwrap() }
        }

        pub fn key_txt(&self) -> String {
            format!(
                "v=DKIM1; k=ed25519; p={}",
                base64::engine::general_purpose::STANDARD.encode(self.pair.public_key().as_ref())
            )
        }

        /// Sign `headers` + `body` for d=`domain` s=`selector`; returns the full message.
        pub fn sign(&self, domain: &str, selector: &str, canon: &str, headers: &str, body: &str) -> String {
            let b64 = &base64::engine::general_purpose::STANDARD;
            let unsigned = format!("{headers}\r\n{body}");
            let (raw, body_bytes) = split_message(unsigned.as_bytes());
            let draft_value = format!(
                " v=1; a=ed25519-sha256; c={canon}; d={domain}; s={selector}; h=from:subject; bh=; b="
            );
            let draft = DkimSignature::parse(&draft_value).unwrap();
            let bh = b64.encode(body_hash(&draft, &body_bytes));
            let value = format!(
                " v=1; a=ed25519-sha256; c={canon}; d={domain}; s={selector}; h=from:subject; bh={bh}; b="
            );
            let sig = DkimSignature::parse(&value).unwrap();
            let sig_header = RawHeader { name: "DKIM-Signature".into(), value: value.clone().into_bytes() };
            let input = header_hash_input(&sig, &raw, &sig_header);
            let signature = self.pair.sign(&compute_hash(HashAlgorithm::Sha256, &input));
            format!("DKIM-Signature:{value}{}\r\n{unsigned}", b64.encode(signature.as_ref()))
        }
    }

    fn analyze_message(message: &str, key_txt: &str) -> SignatureAnalysis {
        let (headers, body) = split_message(message.as_bytes());
        let sig_header = headers
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case("dkim-signature"))
            .unwrap();
        let sig = DkimSignature::parse(&sig_header.value_str()).unwrap();
        let key = DkimKeyRecord::parse(&sig.selector, &sig.domain, key_txt).unwrap();
        analyze(&sig, &key, &headers, sig_header, &body)
    }

    const HEADERS: &str = "From: Alice <alice@example.com>\r\nSubject: quarterly  report\r\n";
    const BODY: &str = "Numbers attached.\r\n\r\n";

    #[test]
    fn valid_ed25519_signature() {
        let signer = TestSigner::new();
        for canon in ["relaxed/relaxed", "simple/simple"] {
            let msg = signer.sign("example.com", "s1", canon, HEADERS, BODY);
            let analysis = analyze_message(&msg, &signer.key_txt());
            assert!(analysis.body_hash_valid, "{canon}");
            assert!(analysis.header_hash_valid, "{canon}");
            assert!(analysis.signature_valid, "{canon}");
            assert_eq!(analysis.canonicalization, canon);
        }
    }

    #[test]
    fn tampered_body_is_a_fact_not_an_error() {
        let signer = TestSigner::new();
        let msg = signer.sign("example.com", "s1", "relaxed/relaxed", HEADERS, BODY).replace("Numbers", "Letters");
        let analysis = analyze_message(&msg, &signer.key_txt());
        assert!(!analysis.body_hash_valid);
        assert!(analysis.header_hash_valid);
        assert!(!analysis.signature_valid);
    }

    #[test]
    fn tampered_header_breaks_header_hash() {
        let signer = TestSigner::new();
        let msg = signer.sign("example.com", "s1", "relaxed/relaxed", HEADERS, BODY).replace("quarterly", "monthly");
        let analysis = analyze_message(&msg, &signer.key_txt());
        assert!(analysis.body_hash_valid);
        assert!(!analysis.header_hash_valid);
    }

    #[test]
    fn relaxed_survives_whitespace_changes() {
        let signer = TestSigner::new();
        let msg = signer
            .sign("example.com", "s1", "relaxed/relaxed", HEADERS, BODY)
            .replace("quarterly  report", "quarterly report");
        assert!(analyze_message(&msg, &signer.key_txt()).signature_valid);
    }

    #[test]
    fn wrong_key_fails_verification() {
        let signer = TestSigner::new();
        let other = TestSigner::new();
        let msg = signer.sign("example.com", "s1", "relaxed/relaxed", HEADERS, BODY);
        let analysis = analyze_message(&msg, &other.key_txt());
        assert!(analysis.body_hash_valid);
        assert!(!analysis.header_hash_valid);
    }

    #[test]
    fn key_constraints() {
        let signer = TestSigner::new();
        let msg = signer.sign("example.com", "s1", "relaxed/relaxed", HEADERS, BODY);
        let analysis = analyze_message(&msg, &format!("{}; s=other", signer.key_txt()));
        assert!(analysis.header_hash_valid);
        assert!(!analysis.signature_valid);
        assert!(analysis.key_constraint.unwrap().contains("s="));
    }

    #[test]
    fn eight_bit_headers_hash_verbatim() {
        let (headers, _) = split_message(b"From: a@example.com\r\nSubject: caf\xe9\r\n\r\nbody\r\n");
        let value = " v=1; a=ed25519-sha256; c=simple/simple; d=example.com; s=s1; h=from:subject; bh=; b=";
        let sig = DkimSignature::parse(value).unwrap();
        let sig_header = RawHeader { name: "DKIM-Signature".into(), value: value.as_bytes().to_vec() };
        let input = header_hash_input(&sig, &headers, &sig_header);
        let expected = [
            b"From: a@example.com\r\nSubject: caf\xe9\r\n".as_slice(),
            b"DKIM-Signature:".as_slice(),
            value.as_bytes(),
        ]
        .concat();
        assert_eq!(input, expected);
    }

    #[test]
    fn known_empty_body_hash() {
        let hash = compute_hash(HashAlgorithm::Sha256, b"\r\n");
        assert_eq!(
            base64::engine::general_purpose::STANDARD.encode(hash),
            "frcCV1k9oG9oKj3dpUqdJg1PxRT2RSN/XKdLCPjaYaY="
        );
    }
}

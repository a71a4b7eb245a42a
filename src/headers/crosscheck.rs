//! Compare what upstream receivers claimed in the headers with what the
//! domains publish today.

use std::net::IpAddr;

use serde::Serialize;
use tracing::{debug, instrument};

use super::parser::EmailHeaderBundle;
use crate::common::dns::DnsResolver;
use crate::common::domain::{domain_from_address, normalize};
use crate::dkim::DkimEvaluator;
use crate::dmarc::{discover, evaluate_with_sample, DiscoveredRecord, DkimIdentity, SpfIdentity};
use crate::error::{ErrorKind, InspectError};
use crate::spf::{fold, SpfContext, SpfEvaluator, SpfResult};

/// A header claim that today's DNS does not support.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Discrepancy {
    pub mechanism: String,
    pub header_claim: String,
    pub live_result: String,
    pub detail: String,
}

/// Result of one live check. `result` is empty when nothing could be checked.
#[derive(Debug, Clone, Default, Serialize)]
pub struct LiveCheck {
    pub checked: bool,
    pub result: String,
    pub detail: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct CrossCheckReport {
    pub spf: LiveCheck,
    pub dkim: LiveCheck,
    pub dmarc: LiveCheck,
    pub discrepancies: Vec<Discrepancy>,
}

fn error_result(e: &InspectError) -> &'static str {
    match e.kind {
        k if k.is_not_found() => "none",
        ErrorKind::DnsTimeout | ErrorKind::DnsFailure => "temperror",
        _ => "permerror",
    }
}

struct LiveSpf {
    check: LiveCheck,
    identity: Option<SpfIdentity>,
}

async fn live_spf<R: DnsResolver>(resolver: &R, domain: &str, client_ip: Option<IpAddr>) -> LiveSpf {
    if domain.is_empty() {
        return LiveSpf {
            check: LiveCheck {
                detail: "no envelope sender in headers".into(),
                ..Default::default()
            },
            identity: None,
        };
    }
    let ctx = SpfContext { client_ip };
    let (result, detail) = match SpfEvaluator::new(resolver.clone()).walk(domain, &ctx).await {
        Ok(tree) => {
            let outcome = fold(&tree, &ctx);
            let detail = match client_ip {
                Some(ip) => format!("evaluated {domain} for {ip}"),
                None => format!("no client IP in headers; only the {domain} policy qualifier was evaluated"),
            };
            (outcome.result, detail)
        }
        Err(e) => {
            let result = match error_result(&e) {
                "none" => SpfResult::None,
                "temperror" => SpfResult::TempError,
                _ => SpfResult::PermError,
            };
            (result, e.message)
        }
    };
    LiveSpf {
        check: LiveCheck {
            checked: true,
            result: result.as_str().to_string(),
            detail,
        },
        identity: Some(SpfIdentity {
            domain: domain.to_string(),
            result,
        }),
    }
}

async fn live_dkim<R: DnsResolver>(resolver: &R, domain: &str, selector: &str) -> LiveCheck {
    if domain.is_empty() || selector.is_empty() {
        return LiveCheck {
            detail: "no DKIM domain and selector in headers".into(),
            ..Default::default()
        };
    }
    let (result, detail) = match DkimEvaluator::new(resolver.clone()).fetch_key(domain, selector).await {
        Ok((_, key)) if key.revoked => ("key_revoked", format!("{selector}._domainkey.{domain} has an empty p=")),
        Ok((_, key)) => (
            "key_present",
            format!("{:?} key of {} bits", key.algorithm, key.key_size_bits),
        ),
        Err(e) => match e.kind {
            ErrorKind::MalformedPublicKey => ("key_malformed", e.message),
            k if k.is_not_found() => ("no_key", e.message),
            _ => ("temperror", e.message),
        },
    };
    LiveCheck {
        checked: true,
        result: result.to_string(),
        detail,
    }
}

async fn live_dmarc<R: DnsResolver>(resolver: &R, domain: &str) -> Result<DiscoveredRecord, InspectError> {
    discover(resolver, domain).await
}

/// Re-run SPF, DKIM key lookup and DMARC discovery for the identities named
/// in `bundle` and report where the live results disagree with the claims.
#[instrument(skip_all, fields(from = %bundle.summary.from))]
pub async fn cross_check<R: DnsResolver>(resolver: &R, bundle: &EmailHeaderBundle) -> CrossCheckReport {
    let auth = &bundle.authentication;

    let from_domain = if auth.dmarc.from_domain.is_empty() {
        domain_from_address(&bundle.summary.from).unwrap_or_default()
    } else {
        normalize(&auth.dmarc.from_domain)
    };
    let spf_domain = if auth.spf.domain.is_empty() {
        domain_from_address(&bundle.summary.return_path).unwrap_or_default()
    } else {
        normalize(&auth.spf.domain)
    };
    let client_ip = auth
        .spf
        .client_ip
        .parse()
        .ok()
        .or_else(|| bundle.routing.iter().find_map(|h| h.ip_addr()));
    let dkim_domain = normalize(&auth.dkim.domain);

    let (spf, dkim, dmarc) = tokio::join!(
        live_spf(resolver, &spf_domain, client_ip),
        live_dkim(resolver, &dkim_domain, &auth.dkim.selector),
        async {
            if from_domain.is_empty() {
                None
            } else {
                Some(live_dmarc(resolver, &from_domain).await)
            }
        },
    );

    let mut discrepancies = Vec::new();
    let mut flag = |mechanism: &str, claim: &str, live: &str, detail: String| {
        debug!(%mechanism, %claim, %live, "header claim disagrees with live result");
        discrepancies.push(Discrepancy {
            mechanism: mechanism.to_string(),
            header_claim: claim.to_string(),
            live_result: live.to_string(),
            detail,
        });
    };

    if spf.check.checked && !auth.spf.status.is_empty() && auth.spf.status != spf.check.result {
        flag(
            "spf",
            &auth.spf.status,
            &spf.check.result,
            format!("headers claim spf={} but {} now gives {}", auth.spf.status, spf_domain, spf.check.result),
        );
    }

    if dkim.checked && auth.dkim.status == "pass" && dkim.result != "key_present" {
        flag(
            "dkim",
            &auth.dkim.status,
            &dkim.result,
            format!("signature claimed valid but {}", dkim.detail),
        );
    }

    let dmarc_check = match dmarc {
        None => LiveCheck {
            detail: "no From domain in headers".into(),
            ..Default::default()
        },
        Some(Err(e)) => {
            let live = error_result(&e);
            if auth.dmarc.status == "pass" || !auth.dmarc.policy.is_empty() {
                flag("dmarc", &auth.dmarc.status, live, e.message.clone());
            }
            LiveCheck {
                checked: true,
                result: live.to_string(),
                detail: e.message,
            }
        }
        Some(Ok(found)) => {
            let policy = if found.org_fallback {
                found.record.subdomain_policy
            } else {
                found.record.policy
            };
            if !auth.dmarc.policy.is_empty() && auth.dmarc.policy != policy.as_str() {
                flag(
                    "dmarc",
                    &format!("p={}", auth.dmarc.policy),
                    &format!("p={}", policy.as_str()),
                    format!("published policy for {from_domain} changed since delivery"),
                );
            }

            let dkim_identity = DkimIdentity {
                domain: dkim_domain.clone(),
                valid: auth.dkim.status == "pass" && dkim.result == "key_present",
            };
            let dkim_identities: &[DkimIdentity] = if dkim_domain.is_empty() {
                &[]
            } else {
                std::slice::from_ref(&dkim_identity)
            };
            // sampling only affects disposition, not alignment
            let outcome = evaluate_with_sample(
                &found.record,
                &from_domain,
                found.org_fallback,
                spf.identity.as_ref(),
                dkim_identities,
                0,
            );
            let live = if outcome.spf_aligned || outcome.dkim_aligned {
                "pass"
            } else {
                "fail"
            };
            if !auth.dmarc.status.is_empty() && auth.dmarc.status != live {
                flag(
                    "dmarc",
                    &auth.dmarc.status,
                    live,
                    format!(
                        "live alignment for {from_domain}: spf_aligned={} dkim_aligned={}",
                        outcome.spf_aligned, outcome.dkim_aligned
                    ),
                );
            }
            LiveCheck {
                checked: true,
                result: live.to_string(),
                detail: format!("p={} found at {}", policy.as_str(), found.source.domain),
            }
        }
    };

    CrossCheckReport {
        spf: spf.check,
        dkim,
        dmarc: dmarc_check,
        discrepancies,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::dns::MockResolver;
    use crate::headers::analyze_headers;
    use base64::Engine;
    use ring::rand::SystemRandom;
    use ring::signature::{Ed25519KeyPair, KeyPair};

    fn headers(spf: &str, dmarc_comment: &str) -> String {
        format!(
            "Received: from mail.example.com (mail.example.com [192.0.2.25])\r\n\
             \tby mx.receiver.example with ESMTPS; Mon, 03 Jun 2024 10:00:05 +0000\r\n\
             From: <ceo@example.com>\r\n\
             Authentication-Results: mx.receiver.example;\r\n\
             \tspf={spf} smtp.mailfrom=example.com;\r\n\
             \tdkim=pass header.d=example.com header.s=s1;\r\n\
             \tdmarc=pass ({dmarc_comment}) header.from=example.com\r\n"
        )
    }

    fn ed25519_key_txt() -> String {
        let pkcs8 = Ed25519KeyPair::generate_pkcs8(&SystemRandom::new()).unwrap();
        let pair = Ed25519KeyPair::from_pkcs8(pkcs8.as_ref()).unwrap();
        let p = base64::engine::general_purpose::STANDARD.encode(pair.public_key().as_ref());
        format!("v=DKIM1; k=ed25519; p={p}")
    }

    fn resolver() -> MockResolver {
        let r = MockResolver::new();
        r.add_txt("example.com", vec!["v=spf1 ip4:192.0.2.0/24 -all".into()]);
        r.add_txt("_dmarc.example.com", vec!["v=DMARC1; p=reject".into()]);
        r
    }

    #[tokio::test]
    async fn consistent_headers_have_no_discrepancies() {
        let r = resolver();
        r.add_txt("s1._domainkey.example.com", vec![ed25519_key_txt()]);
        let bundle = analyze_headers(&headers("pass", "p=REJECT"));
        let report = cross_check(&r, &bundle).await;
        assert_eq!(report.spf.result, "pass");
        assert_eq!(report.dkim.result, "key_present");
        assert_eq!(report.dmarc.result, "pass");
        assert!(report.discrepancies.is_empty(), "{:?}", report.discrepancies);
    }

    #[tokio::test]
    async fn missing_key_and_changed_policy_are_flagged() {
        let r = resolver();
        let bundle = analyze_headers(&headers("pass", "p=NONE"));
        let report = cross_check(&r, &bundle).await;
        assert_eq!(report.dkim.result, "no_key");
        let mechanisms: Vec<&str> = report.discrepancies.iter().map(|d| d.mechanism.as_str()).collect();
        assert_eq!(mechanisms, vec!["dkim", "dmarc"]);
        assert_eq!(report.discrepancies[1].header_claim, "p=none");
        assert_eq!(report.discrepancies[1].live_result, "p=reject");
        // SPF still aligns, so DMARC itself passes live
        assert_eq!(report.dmarc.result, "pass");
    }

    #[tokio::test]
    async fn spf_claim_contradicted_by_live_record() {
        let r = MockResolver::new();
        r.add_txt("example.com", vec!["v=spf1 ip4:198.51.100.0/24 -all".into()]);
        r.add_txt("_dmarc.example.com", vec!["v=DMARC1; p=reject".into()]);
        let bundle = analyze_headers(&headers("pass", "p=REJECT"));
        let report = cross_check(&r, &bundle).await;
        assert_eq!(report.spf.result, "fail");
        let spf = report.discrepancies.iter().find(|d| d.mechanism == "spf").unwrap();
        assert_eq!(spf.header_claim, "pass");
        assert_eq!(spf.live_result, "fail");
        // neither SPF nor DKIM aligns any more
        assert_eq!(report.dmarc.result, "fail");
    }

    #[tokio::test]
    async fn nothing_to_check() {
        let r = MockResolver::new();
        let bundle = analyze_headers("Subject: hello\r\n");
        let report = cross_check(&r, &bundle).await;
        assert!(!report.spf.checked);
        assert!(!report.dkim.checked);
        assert!(!report.dmarc.checked);
        assert!(report.discrepancies.is_empty());
    }
}

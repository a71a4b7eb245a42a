//! Request/response facade: one async function per route.
//!
//! Routes never return `Err`. A failed evaluation becomes a
//! [`FailureReport`] so callers can render "not found" or "invalid" from
//! the same JSON shape they use for success.

use std::future::Future;
use std::net::IpAddr;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{instrument, warn};

use crate::common::deadline::Deadline;
use crate::common::dns::{DnsResolver, HickoryResolver};
use crate::common::domain::{is_valid_domain, normalize};
use crate::config::InspectorConfig;
use crate::dkim::{self, DkimReport};
use crate::dmarc::{self, DmarcReport};
use crate::error::{ErrorKind, InspectError};
use crate::headers::{analyze_headers, cross_check, CrossCheckReport, EmailHeaderBundle};
use crate::mx::{lookup_mx, MxReport};
use crate::smtp::{Credentials, ProbeOptions, SmtpProbeResult, SmtpProber};
use crate::spf::{self, SpfContext, SpfReport};

#[derive(Debug, Clone, Deserialize)]
pub struct DomainRequest {
    pub domain: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SpfRequest {
    pub domain: String,
    /// Connecting client to evaluate; without it only `all` can match.
    #[serde(default)]
    pub ip: Option<IpAddr>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DkimRequest {
    pub domain: String,
    pub selector: String,
    /// Full message whose signature should be verified.
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HeadersRequest {
    pub headers: String,
    /// Also compare the header claims with live DNS.
    #[serde(default)]
    pub cross_check: bool,
}

#[derive(Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SmtpTestRequest {
    pub server: String,
    pub port: u16,
    #[serde(default)]
    pub test_auth: bool,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

/// Structured failure for any route.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailureReport {
    pub record_found: bool,
    pub valid: bool,
    pub error: ErrorKind,
    pub error_message: String,
}

impl From<InspectError> for FailureReport {
    fn from(e: InspectError) -> Self {
        Self {
            record_found: false,
            valid: false,
            error: e.kind,
            error_message: e.message,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum Response<T> {
    Ok(T),
    Failed(FailureReport),
}

impl<T> Response<T> {
    pub fn is_ok(&self) -> bool {
        matches!(self, Response::Ok(_))
    }
}

impl<T> From<Result<T, InspectError>> for Response<T> {
    fn from(r: Result<T, InspectError>) -> Self {
        match r {
            Ok(v) => Response::Ok(v),
            Err(e) => Response::Failed(e.into()),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HeaderAnalysis {
    #[serde(flatten)]
    pub bundle: EmailHeaderBundle,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cross_check: Option<CrossCheckReport>,
}

/// Errors from [`Inspector::dispatch`]; route failures are not among them.
#[derive(Debug, Error)]
pub enum RouteError {
    #[error("unknown route {0}")]
    UnknownRoute(String),
    #[error("invalid request body: {0}")]
    BadRequest(#[from] serde_json::Error),
}

fn checked_domain(domain: &str) -> Result<String, InspectError> {
    let domain = normalize(domain);
    if is_valid_domain(&domain) {
        Ok(domain)
    } else {
        Err(InspectError::new(
            ErrorKind::NxDomain,
            format!("{domain:?} is not a syntactically valid domain name; no DNS query was made"),
        ))
    }
}

/// Entry point for every route. Stateless between calls.
#[derive(Clone)]
pub struct Inspector<R: DnsResolver = HickoryResolver> {
    resolver: R,
    config: InspectorConfig,
}

impl Inspector<HickoryResolver> {
    pub fn new(config: InspectorConfig) -> Self {
        let resolver = HickoryResolver::new(&config.dns);
        Self { resolver, config }
    }
}

impl<R: DnsResolver> Inspector<R> {
    pub fn with_resolver(resolver: R, config: InspectorConfig) -> Self {
        Self { resolver, config }
    }

    pub fn config(&self) -> &InspectorConfig {
        &self.config
    }

    async fn bounded<T, F>(&self, what: &str, kind: ErrorKind, fut: F) -> Result<T, InspectError>
    where
        F: Future<Output = Result<T, InspectError>>,
    {
        Deadline::after(self.config.deadline()).run(what, kind, fut).await?
    }

    /// `POST /validate-spf`
    #[instrument(skip_all, fields(domain = %req.domain))]
    pub async fn validate_spf(&self, req: &SpfRequest) -> Response<SpfReport> {
        let run = async {
            let domain = checked_domain(&req.domain)?;
            let ctx = SpfContext { client_ip: req.ip };
            self.bounded("SPF validation", ErrorKind::DnsTimeout, spf::validate_spf(&self.resolver, &domain, &ctx))
                .await
        };
        run.await.into()
    }

    /// `POST /validate-dkim`
    #[instrument(skip_all, fields(domain = %req.domain, selector = %req.selector))]
    pub async fn validate_dkim(&self, req: &DkimRequest) -> Response<DkimReport> {
        let run = async {
            let domain = checked_domain(&req.domain)?;
            let selector = req.selector.trim().to_ascii_lowercase();
            if selector.is_empty() {
                return Err(InspectError::new(ErrorKind::NoDkimRecord, "a DKIM selector is required"));
            }
            let message = req.message.as_deref().map(str::as_bytes);
            self.bounded(
                "DKIM validation",
                ErrorKind::DnsTimeout,
                dkim::validate_dkim(&self.resolver, &domain, &selector, message, self.config.dkim.clock_skew_secs),
            )
            .await
        };
        run.await.into()
    }

    /// `POST /validate-dmarc`
    #[instrument(skip_all, fields(domain = %req.domain))]
    pub async fn validate_dmarc(&self, req: &DomainRequest) -> Response<DmarcReport> {
        let run = async {
            let domain = checked_domain(&req.domain)?;
            self.bounded("DMARC validation", ErrorKind::DnsTimeout, dmarc::validate_dmarc(&self.resolver, &domain))
                .await
        };
        run.await.into()
    }

    /// `POST /analyze-headers`. Parsing never fails; only the optional
    /// cross-check touches the network.
    #[instrument(skip_all, fields(cross_check = req.cross_check))]
    pub async fn analyze_headers(&self, req: &HeadersRequest) -> Response<HeaderAnalysis> {
        let bundle = analyze_headers(&req.headers);
        let cross_check = if req.cross_check {
            let check = async { Ok(cross_check(&self.resolver, &bundle).await) };
            match self.bounded("header cross-check", ErrorKind::DnsTimeout, check).await {
                Ok(report) => Some(report),
                Err(e) => {
                    warn!(error = %e, "cross-check abandoned");
                    None
                }
            }
        } else {
            None
        };
        Response::Ok(HeaderAnalysis { bundle, cross_check })
    }

    /// `POST /mx-lookup`
    #[instrument(skip_all, fields(domain = %req.domain))]
    pub async fn mx_lookup(&self, req: &DomainRequest) -> Response<MxReport> {
        let run = async {
            let domain = checked_domain(&req.domain)?;
            self.bounded("MX lookup", ErrorKind::DnsTimeout, lookup_mx(&self.resolver, &domain)).await
        };
        run.await.into()
    }

    /// `POST /smtp-server-test`
    #[instrument(skip_all, fields(server = %req.server, port = req.port))]
    pub async fn smtp_server_test(&self, req: &SmtpTestRequest) -> Response<SmtpProbeResult> {
        let server = req.server.trim();
        if server.is_empty() || req.port == 0 {
            return Response::Failed(
                InspectError::new(ErrorKind::ConnectionRefused, "a server and a non-zero port are required").into(),
            );
        }
        let credentials = match (&req.username, &req.password) {
            (Some(u), Some(p)) if req.test_auth && !u.is_empty() => Some(Credentials::new(u.as_str(), p.as_str())),
            _ => None,
        };
        let options = ProbeOptions {
            test_auth: req.test_auth,
            credentials,
        };
        let prober = SmtpProber::new(self.config.smtp.clone());
        let probe = async { Ok(prober.probe(server, req.port, &options).await) };
        self.bounded("SMTP probe", ErrorKind::Timeout, probe).await.into()
    }

    /// Route by path with a JSON body, returning the JSON response.
    pub async fn dispatch(&self, path: &str, body: &str) -> Result<serde_json::Value, RouteError> {
        let value = match path.trim_start_matches("/api") {
            "/validate-spf" => serde_json::to_value(self.validate_spf(&serde_json::from_str(body)?).await),
            "/validate-dkim" => serde_json::to_value(self.validate_dkim(&serde_json::from_str(body)?).await),
            "/validate-dmarc" => serde_json::to_value(self.validate_dmarc(&serde_json::from_str(body)?).await),
            "/analyze-headers" => serde_json::to_value(self.analyze_headers(&serde_json::from_str(body)?).await),
            "/mx-lookup" => serde_json::to_value(self.mx_lookup(&serde_json::from_str(body)?).await),
            "/smtp-server-test" => serde_json::to_value(self.smtp_server_test(&serde_json::from_str(body)?).await),
            other => return Err(RouteError::UnknownRoute(other.to_string())),
        }?;
        Ok(value)
    }
}

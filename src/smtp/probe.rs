//! The probe state machine:
//! `Disconnected -> Connecting -> Connected -> EhloSent ->
//! [StartTlsNegotiating -> TlsEstablished] -> [AuthProbing] -> Closed`.

use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use super::auth::{authenticate, AuthMechanism, AuthResult, Credentials};
use super::connection::Connection;
use super::reply::{Capabilities, Reply};
use super::tls::{server_name, SecurityAnalysis, TlsClient};
use crate::config::SmtpConfig;
use crate::error::{ErrorKind, InspectError};

/// Port where TLS starts before the banner (RFC 8314).
pub const IMPLICIT_TLS_PORT: u16 = 465;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ProbeState {
    Disconnected,
    Connecting,
    Connected,
    #[serde(rename = "EHLOSent")]
    EhloSent,
    #[serde(rename = "STARTTLSNegotiating")]
    StartTlsNegotiating,
    #[serde(rename = "TLSEstablished")]
    TlsEstablished,
    AuthProbing,
    Closed,
}

/// What to do beyond capability discovery.
#[derive(Debug, Clone, Default)]
pub struct ProbeOptions {
    pub test_auth: bool,
    pub credentials: Option<Credentials>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SmtpProbeResult {
    pub server: String,
    pub port: u16,
    pub connection_successful: bool,
    /// Milliseconds from connect to banner.
    pub response_time: u64,
    pub server_banner: String,
    pub ehlo_response: Vec<String>,
    pub starttls_supported: bool,
    pub starttls_required: bool,
    pub auth_methods: Vec<String>,
    pub size_limit: Option<u64>,
    pub security_analysis: Option<SecurityAnalysis>,
    pub auth_result: Option<AuthResult>,
    pub states: Vec<ProbeState>,
    pub error: Option<ErrorKind>,
    pub error_message: Option<String>,
}

impl SmtpProbeResult {
    fn new(server: &str, port: u16) -> Self {
        Self {
            server: server.to_string(),
            port,
            connection_successful: false,
            response_time: 0,
            server_banner: String::new(),
            ehlo_response: Vec::new(),
            starttls_supported: false,
            starttls_required: false,
            auth_methods: Vec::new(),
            size_limit: None,
            security_analysis: None,
            auth_result: None,
            states: vec![ProbeState::Disconnected],
            error: None,
            error_message: None,
        }
    }

    fn enter(&mut self, state: ProbeState) {
        debug!(?state, "probe state");
        self.states.push(state);
    }

    /// Keep the first error; later ones are usually consequences.
    fn fail(&mut self, e: InspectError) {
        warn!(kind = ?e.kind, message = %e.message, "probe error");
        if self.error.is_none() {
            self.error = Some(e.kind);
            self.error_message = Some(e.message);
        }
    }

    fn apply_ehlo(&mut self, reply: &Reply) {
        let caps = Capabilities::from_ehlo(reply);
        self.ehlo_response = reply.raw_lines();
        // STARTTLS disappears from the post-TLS EHLO
        self.starttls_supported |= caps.starttls;
        self.auth_methods = caps.auth;
        self.size_limit = caps.size;
    }
}

/// Probes one server per call; holds no state between calls.
#[derive(Debug, Clone)]
pub struct SmtpProber {
    config: SmtpConfig,
}

impl SmtpProber {
    pub fn new(config: SmtpConfig) -> Self {
        Self { config }
    }

    /// Probe `server:port`. Failures are reported inside the result.
    #[instrument(skip(self, options), fields(test_auth = options.test_auth))]
    pub async fn probe(&self, server: &str, port: u16, options: &ProbeOptions) -> SmtpProbeResult {
        let mut result = SmtpProbeResult::new(server, port);
        result.enter(ProbeState::Connecting);
        let started = Instant::now();
        let conn = match Connection::connect(
            server,
            port,
            self.config.connect_timeout(),
            self.config.command_timeout(),
        )
        .await
        {
            Ok(conn) => conn,
            Err(e) => {
                result.fail(e);
                result.enter(ProbeState::Closed);
                return result;
            }
        };
        result.connection_successful = true;

        // the connection is consumed on every path, which closes the socket
        if let Some(conn) = self.session(conn, &mut result, started, options).await {
            conn.quit().await;
        }
        result.enter(ProbeState::Closed);
        info!(
            connected = result.connection_successful,
            tls = result.security_analysis.is_some(),
            error = ?result.error,
            "probe finished"
        );
        result
    }

    /// Run the session. Returns the connection when it is still usable for
    /// a clean QUIT.
    async fn session(
        &self,
        mut conn: Connection,
        result: &mut SmtpProbeResult,
        started: Instant,
        options: &ProbeOptions,
    ) -> Option<Connection> {
        let tls = match TlsClient::new(&self.config) {
            Ok(tls) => tls,
            Err(e) => {
                result.fail(e);
                return Some(conn);
            }
        };

        if result.port == IMPLICIT_TLS_PORT {
            result.enter(ProbeState::StartTlsNegotiating);
            conn = match self.handshake(conn, &tls, result).await {
                Ok(conn) => conn,
                Err(e) => {
                    result.fail(e);
                    return None;
                }
            };
        }

        if let Err(e) = self.banner(&mut conn, result, started).await {
            result.fail(e);
            return None;
        }
        result.enter(ProbeState::Connected);

        if let Err(e) = self.ehlo(&mut conn, result).await {
            result.fail(e);
            return Some(conn);
        }

        if !conn.is_tls() && result.starttls_supported {
            if self.config.probe_starttls_required {
                match self.starttls_required(&mut conn).await {
                    Ok(required) => result.starttls_required = required,
                    Err(e) => {
                        result.fail(e);
                        return None;
                    }
                }
            }

            result.enter(ProbeState::StartTlsNegotiating);
            conn = match self.starttls(conn, &tls, result).await {
                Ok(conn) => conn,
                Err(e) => {
                    // no auth over a connection whose upgrade failed
                    result.fail(e);
                    return None;
                }
            };
            if let Err(e) = self.ehlo(&mut conn, result).await {
                result.fail(e);
                return Some(conn);
            }
        }

        if options.test_auth {
            if let Some(credentials) = &options.credentials {
                if let Err(e) = self.auth(&mut conn, credentials, result).await {
                    result.fail(e);
                    return None;
                }
            }
        }
        Some(conn)
    }

    async fn handshake(
        &self,
        conn: Connection,
        tls: &TlsClient,
        result: &mut SmtpProbeResult,
    ) -> Result<Connection, InspectError> {
        let name = server_name(&result.server)?;
        let conn = conn.upgrade(&tls.connector, name).await?;
        if let Some(session) = conn.tls_session() {
            result.security_analysis = Some(tls.analyze(session));
        }
        result.enter(ProbeState::TlsEstablished);
        Ok(conn)
    }

    /// A malformed or unexpected banner is recorded but the probe goes on.
    async fn banner(&self, conn: &mut Connection, result: &mut SmtpProbeResult, started: Instant) -> Result<(), InspectError> {
        let lines = conn.read_lines().await?;
        result.response_time = started.elapsed().as_millis() as u64;
        match Reply::parse(&lines) {
            Ok(reply) if reply.code == 220 => result.server_banner = reply.text(),
            Ok(reply) => {
                result.server_banner = reply.text();
                if reply.is_permanent_failure() || reply.is_transient_failure() {
                    return Err(InspectError::new(
                        ErrorKind::ProtocolViolation,
                        format!("server refused the session: {reply}"),
                    ));
                }
                result.fail(InspectError::new(
                    ErrorKind::ProtocolViolation,
                    format!("unexpected banner code {}", reply.code),
                ));
            }
            Err(e) => {
                result.server_banner = lines.join(" ");
                result.fail(InspectError::new(ErrorKind::ProtocolViolation, format!("malformed banner: {e}")));
            }
        }
        Ok(())
    }

    async fn ehlo(&self, conn: &mut Connection, result: &mut SmtpProbeResult) -> Result<(), InspectError> {
        conn.send(&format!("EHLO {}", self.config.helo_name)).await?;
        result.enter(ProbeState::EhloSent);
        let reply = conn.read_reply().await?;
        if !reply.is_positive_completion() {
            return Err(InspectError::new(
                ErrorKind::ProtocolViolation,
                format!("EHLO rejected: {reply}"),
            ));
        }
        result.apply_ehlo(&reply);
        Ok(())
    }

    /// `MAIL FROM:<>` before TLS: a 530 means the server insists on STARTTLS.
    async fn starttls_required(&self, conn: &mut Connection) -> Result<bool, InspectError> {
        let reply = conn.command("MAIL FROM:<>").await?;
        let required = reply.code == 530;
        // leave no open transaction behind
        conn.command("RSET").await?;
        Ok(required)
    }

    async fn starttls(
        &self,
        mut conn: Connection,
        tls: &TlsClient,
        result: &mut SmtpProbeResult,
    ) -> Result<Connection, InspectError> {
        let reply = conn.command("STARTTLS").await?;
        if reply.code != 220 {
            return Err(InspectError::new(
                ErrorKind::TlsNegotiationFailed,
                format!("STARTTLS refused: {reply}"),
            ));
        }
        self.handshake(conn, tls, result).await
    }

    async fn auth(
        &self,
        conn: &mut Connection,
        credentials: &Credentials,
        result: &mut SmtpProbeResult,
    ) -> Result<(), InspectError> {
        if !conn.is_tls() && !self.config.allow_plaintext_auth {
            result.auth_result = Some(AuthResult {
                mechanism: String::new(),
                success: false,
                detail: "credentials not sent over an unencrypted connection".into(),
            });
            return Ok(());
        }
        let Some(mechanism) = AuthMechanism::choose(&result.auth_methods) else {
            result.auth_result = Some(AuthResult {
                mechanism: String::new(),
                success: false,
                detail: format!("no supported mechanism among [{}]", result.auth_methods.join(", ")),
            });
            return Ok(());
        };
        result.enter(ProbeState::AuthProbing);
        let outcome = authenticate(conn, mechanism, credentials).await?;
        if !outcome.success {
            result.fail(InspectError::new(
                ErrorKind::AuthenticationFailed,
                format!("{} authentication rejected: {}", outcome.mechanism, outcome.detail),
            ));
        }
        result.auth_result = Some(outcome);
        Ok(())
    }
}

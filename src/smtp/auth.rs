//! SMTP AUTH (RFC 4954) with PLAIN and LOGIN.

use std::fmt;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::Serialize;
use tracing::info;

use super::connection::Connection;
use crate::error::{ErrorKind, InspectError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AuthMechanism {
    #[serde(rename = "PLAIN")]
    Plain,
    #[serde(rename = "LOGIN")]
    Login,
}

impl AuthMechanism {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthMechanism::Plain => "PLAIN",
            AuthMechanism::Login => "LOGIN",
        }
    }

    /// Strongest mechanism both sides support, PLAIN before LOGIN.
    pub fn choose(advertised: &[String]) -> Option<Self> {
        [AuthMechanism::Plain, AuthMechanism::Login]
            .into_iter()
            .find(|m| advertised.iter().any(|a| a.eq_ignore_ascii_case(m.as_str())))
    }
}

/// Username and password. `Debug` never shows the password.
#[derive(Clone)]
pub struct Credentials {
    pub username: String,
    password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuthResult {
    pub mechanism: String,
    pub success: bool,
    pub detail: String,
}

fn unexpected(step: &str, code: u16, text: &str) -> InspectError {
    InspectError::new(
        ErrorKind::ProtocolViolation,
        format!("unexpected {code} reply during {step}: {text}"),
    )
}

/// One authentication attempt. A 5xx rejection is a result, not an error;
/// `Err` means the exchange itself broke.
pub async fn authenticate(
    conn: &mut Connection,
    mechanism: AuthMechanism,
    credentials: &Credentials,
) -> Result<AuthResult, InspectError> {
    let final_reply = match mechanism {
        AuthMechanism::Plain => {
            let token = STANDARD.encode(format!("\0{}\0{}", credentials.username, credentials.password));
            conn.send_secret(&format!("AUTH PLAIN {token}")).await?;
            conn.read_reply().await?
        }
        AuthMechanism::Login => {
            let reply = conn.command("AUTH LOGIN").await?;
            if !reply.is_intermediate() {
                return finish(mechanism, &reply.text(), reply.code);
            }
            conn.send_secret(&STANDARD.encode(&credentials.username)).await?;
            let reply = conn.read_reply().await?;
            if !reply.is_intermediate() {
                return finish(mechanism, &reply.text(), reply.code);
            }
            conn.send_secret(&STANDARD.encode(&credentials.password)).await?;
            conn.read_reply().await?
        }
    };
    finish(mechanism, &final_reply.text(), final_reply.code)
}

fn finish(mechanism: AuthMechanism, text: &str, code: u16) -> Result<AuthResult, InspectError> {
    let success = match code {
        235 => true,
        400..=599 => false,
        _ => return Err(unexpected("AUTH", code, text)),
    };
    info!(mechanism = mechanism.as_str(), success, code, "authentication attempted");
    Ok(AuthResult {
        mechanism: mechanism.as_str().to_string(),
        success,
        detail: format!("{code} {text}"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_preferred_over_login() {
        let adv = |v: &[&str]| v.iter().map(|s| s.to_string()).collect::<Vec<_>>();
        assert_eq!(AuthMechanism::choose(&adv(&["LOGIN", "PLAIN"])), Some(AuthMechanism::Plain));
        assert_eq!(AuthMechanism::choose(&adv(&["login", "XOAUTH2"])), Some(AuthMechanism::Login));
        assert_eq!(AuthMechanism::choose(&adv(&["CRAM-MD5"])), None);
    }

    #[test]
    fn debug_hides_password() {
        let c = Credentials::new("user", "hunter2");
        let shown = format!("{c:?}");
        assert!(shown.contains("user"));
        assert!(!shown.contains("hunter2"));
    }

    #[test]
    fn reply_codes() {
        assert!(finish(AuthMechanism::Plain, "ok", 235).unwrap().success);
        let r = finish(AuthMechanism::Login, "bad credentials", 535).unwrap();
        assert!(!r.success);
        assert_eq!(r.detail, "535 bad credentials");
        assert_eq!(finish(AuthMechanism::Plain, "?", 250).unwrap_err().kind, ErrorKind::ProtocolViolation);
    }
}

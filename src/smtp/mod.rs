//! SMTP prober: banner, EHLO capabilities, STARTTLS and AUTH over one
//! connection.

mod auth;
mod connection;
mod probe;
mod reply;
mod tls;

pub use auth::{AuthMechanism, AuthResult, Credentials};
pub use connection::Connection;
pub use probe::{ProbeOptions, ProbeState, SmtpProbeResult, SmtpProber, IMPLICIT_TLS_PORT};
pub use reply::{Capabilities, Reply, ReplyError};
pub use tls::SecurityAnalysis;

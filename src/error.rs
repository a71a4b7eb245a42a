//! Error taxonomy shared by every evaluator and the SMTP prober.

use serde::Serialize;
use thiserror::Error;

use crate::common::dns::DnsError;

/// Closed set of failure kinds surfaced to callers.
///
/// Serialized names are stable and consumed verbatim by front ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ErrorKind {
    #[serde(rename = "DNSTimeout")]
    DnsTimeout,
    #[serde(rename = "NXDOMAIN")]
    NxDomain,
    #[serde(rename = "DNSFailure")]
    DnsFailure,
    #[serde(rename = "NoSPFRecord")]
    NoSpfRecord,
    #[serde(rename = "MultipleSPFRecords")]
    MultipleSpfRecords,
    #[serde(rename = "SPFLoop")]
    SpfLoop,
    #[serde(rename = "InvalidSPFRecord")]
    InvalidSpfRecord,
    UnknownMechanism,
    #[serde(rename = "NoDKIMRecord")]
    NoDkimRecord,
    MalformedPublicKey,
    #[serde(rename = "NoDMARCRecord")]
    NoDmarcRecord,
    #[serde(rename = "InvalidDMARCRecord")]
    InvalidDmarcRecord,
    ConnectionRefused,
    Timeout,
    ProtocolViolation,
    #[serde(rename = "TLSNegotiationFailed")]
    TlsNegotiationFailed,
    AuthenticationFailed,
}

impl ErrorKind {
    /// True for conditions that mean "nothing published" rather than "broken".
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            ErrorKind::NxDomain
                | ErrorKind::NoSpfRecord
                | ErrorKind::NoDkimRecord
                | ErrorKind::NoDmarcRecord
        )
    }
}

/// Error returned by evaluators and the prober.
///
/// `message` is meant for end users: it never carries credentials.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind:?}: {message}")]
pub struct InspectError {
    pub kind: ErrorKind,
    pub message: String,
}

impl InspectError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl From<DnsError> for InspectError {
    fn from(e: DnsError) -> Self {
        let kind = match e {
            DnsError::NxDomain => ErrorKind::NxDomain,
            DnsError::Timeout => ErrorKind::DnsTimeout,
            DnsError::ServFail | DnsError::Other(_) => ErrorKind::DnsFailure,
        };
        InspectError::new(kind, e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, InspectError>;

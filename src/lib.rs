//! Email authentication inspection: SPF, DKIM and DMARC evaluation, header
//! analysis, MX lookup and SMTP capability probing.
//!
//! DNS caching is the caller's responsibility. Every evaluator takes a
//! `DnsResolver`; implement it with caching at the resolver layer.

pub mod common;
pub mod config;
pub mod dkim;
pub mod dmarc;
pub mod error;
pub mod headers;
pub mod inspector;
pub mod mx;
pub mod smtp;
pub mod spf;

pub use common::dns::{DnsResolver, HickoryResolver, MockResolver};
pub use config::InspectorConfig;
pub use error::{ErrorKind, InspectError};
pub use inspector::{FailureReport, Inspector, Response};

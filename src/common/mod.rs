//! Infrastructure shared across the evaluators and the prober.

pub mod cidr;
pub mod deadline;
pub mod dns;
pub mod domain;

pub use deadline::Deadline;
pub use dns::{DnsError, DnsResolver, DomainRecord, HickoryResolver, MockResolver, RecordKind};

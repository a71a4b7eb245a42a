//! Header parser: summary, routing path and authentication claims from a
//! raw header block, plus an optional live cross-check.

mod auth_results;
mod crosscheck;
mod parser;
mod received;

pub use auth_results::{
    parse_authentication_results, parse_received_spf, summarize, AuthResultRecord, AuthenticationSummary,
    DkimClaim, DmarcClaim, SpfClaim,
};
pub use crosscheck::{cross_check, CrossCheckReport, Discrepancy, LiveCheck};
pub use parser::{
    analyze_headers, EmailHeaderBundle, EmailSummary, HeaderBlock, HeaderField, RoutingOrder, SecurityMetadata,
};
pub use received::{fill_delays, parse_received, parse_timestamp, RoutingHop};

//! SPF term grammar (RFC 7208 §4.6, §5, §6).
//!
//! A record parses into an ordered `Vec<SpfTerm>`; rendering the vector
//! reproduces the record with the original term order.

use std::fmt;

use serde::Serialize;

use crate::common::cidr::Cidr;

/// Qualifier prefix on a directive. Defaults to Pass if omitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Qualifier {
    Pass, // +
    #[serde(rename = "HardFail")]
    Fail, // -
    SoftFail, // ~
    Neutral,  // ?
}

impl Qualifier {
    /// Split a qualifier prefix off `s`. No prefix means Pass.
    pub fn parse_prefix(s: &str) -> (Qualifier, &str) {
        match s.as_bytes().first() {
            Some(b'+') => (Qualifier::Pass, &s[1..]),
            Some(b'-') => (Qualifier::Fail, &s[1..]),
            Some(b'~') => (Qualifier::SoftFail, &s[1..]),
            Some(b'?') => (Qualifier::Neutral, &s[1..]),
            _ => (Qualifier::Pass, s),
        }
    }

    pub fn symbol(&self) -> char {
        match self {
            Qualifier::Pass => '+',
            Qualifier::Fail => '-',
            Qualifier::SoftFail => '~',
            Qualifier::Neutral => '?',
        }
    }
}

impl fmt::Display for Qualifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.symbol())
    }
}

/// Prefix lengths applied to addresses found by `a` and `mx`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DualCidr {
    pub v4: u8,
    pub v6: u8,
}

impl Default for DualCidr {
    fn default() -> Self {
        Self { v4: 32, v6: 128 }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mechanism {
    All,
    Include(String),
    A { domain: Option<String>, cidr: DualCidr },
    Mx { domain: Option<String>, cidr: DualCidr },
    Ptr(Option<String>),
    Ip4(Cidr),
    Ip6(Cidr),
    Exists(String),
}

impl Mechanism {
    pub fn name(&self) -> &'static str {
        match self {
            Mechanism::All => "all",
            Mechanism::Include(_) => "include",
            Mechanism::A { .. } => "a",
            Mechanism::Mx { .. } => "mx",
            Mechanism::Ptr(_) => "ptr",
            Mechanism::Ip4(_) => "ip4",
            Mechanism::Ip6(_) => "ip6",
            Mechanism::Exists(_) => "exists",
        }
    }

    /// Mechanisms that cost one DNS lookup (RFC 7208 §4.6.4).
    pub fn needs_lookup(&self) -> bool {
        matches!(
            self,
            Mechanism::Include(_)
                | Mechanism::A { .. }
                | Mechanism::Mx { .. }
                | Mechanism::Ptr(_)
                | Mechanism::Exists(_)
        )
    }
}

/// A directive = qualifier + mechanism.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Directive {
    pub qualifier: Qualifier,
    pub mechanism: Mechanism,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpfTerm {
    Version,
    Directive(Directive),
    Redirect(String),
    Explanation(String),
    /// Unrecognised `name=value`, kept for rendering and ignored otherwise.
    Modifier { name: String, value: String },
}

impl SpfTerm {
    pub fn directive(&self) -> Option<&Directive> {
        match self {
            SpfTerm::Directive(d) => Some(d),
            _ => None,
        }
    }

    pub fn kind(&self) -> &str {
        match self {
            SpfTerm::Version => "version",
            SpfTerm::Directive(d) => d.mechanism.name(),
            SpfTerm::Redirect(_) => "redirect",
            SpfTerm::Explanation(_) => "exp",
            SpfTerm::Modifier { name, .. } => name,
        }
    }

    /// The argument as shown to users: `~all` for `all`, the domain or
    /// network for everything else.
    pub fn value(&self) -> String {
        match self {
            SpfTerm::Version => "spf1".to_string(),
            SpfTerm::Directive(d) => match &d.mechanism {
                Mechanism::All => format!("{}all", d.qualifier),
                Mechanism::Include(t) | Mechanism::Exists(t) => t.clone(),
                Mechanism::A { domain, .. } | Mechanism::Mx { domain, .. } | Mechanism::Ptr(domain) => {
                    domain.clone().unwrap_or_default()
                }
                Mechanism::Ip4(c) | Mechanism::Ip6(c) => c.to_string(),
            },
            SpfTerm::Redirect(t) | SpfTerm::Explanation(t) => t.clone(),
            SpfTerm::Modifier { value, .. } => value.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SpfParseError {
    #[error("invalid SPF version: expected 'v=spf1'")]
    InvalidVersion,
    #[error("unknown mechanism: {0}")]
    UnknownMechanism(String),
    #[error("invalid mechanism argument: {0}")]
    InvalidArgument(String),
    #[error("duplicate modifier: {0}")]
    DuplicateModifier(String),
    #[error("missing required argument for {0}")]
    MissingArgument(String),
    #[error("invalid CIDR prefix: {0}")]
    InvalidCidr(String),
}

/// True for TXT strings that announce themselves as SPF records.
pub fn is_spf_record(txt: &str) -> bool {
    let t = txt.trim_start();
    t.len() >= 6
        && t[..6].eq_ignore_ascii_case("v=spf1")
        && t[6..].chars().next().map_or(true, |c| c == ' ')
}

/// Parse a whole record into its ordered terms, starting with `Version`.
pub fn parse_record(record: &str) -> Result<Vec<SpfTerm>, SpfParseError> {
    let mut tokens = record.split_whitespace();
    match tokens.next() {
        Some(v) if v.eq_ignore_ascii_case("v=spf1") => {}
        _ => return Err(SpfParseError::InvalidVersion),
    }

    let mut terms = vec![SpfTerm::Version];
    let mut seen_redirect = false;
    let mut seen_exp = false;
    for token in tokens {
        if let Some((name, value)) = split_modifier(token) {
            let term = match name.to_ascii_lowercase().as_str() {
                "redirect" => {
                    if std::mem::replace(&mut seen_redirect, true) {
                        return Err(SpfParseError::DuplicateModifier("redirect".into()));
                    }
                    SpfTerm::Redirect(require_domain("redirect", value)?)
                }
                "exp" => {
                    if std::mem::replace(&mut seen_exp, true) {
                        return Err(SpfParseError::DuplicateModifier("exp".into()));
                    }
                    SpfTerm::Explanation(require_domain("exp", value)?)
                }
                _ => SpfTerm::Modifier {
                    name: name.to_string(),
                    value: value.to_string(),
                },
            };
            terms.push(term);
        } else {
            terms.push(SpfTerm::Directive(parse_directive(token)?));
        }
    }
    Ok(terms)
}

/// Render terms back into record text.
pub fn render(terms: &[SpfTerm]) -> String {
    terms
        .iter()
        .map(|t| t.to_string())
        .collect::<Vec<_>>()
        .join(" ")
}

/// `name=value` where name = ALPHA *( ALPHA / DIGIT / "-" / "_" / "." ).
fn split_modifier(token: &str) -> Option<(&str, &str)> {
    let (name, value) = token.split_once('=')?;
    let mut chars = name.chars();
    let first_ok = chars.next().is_some_and(|c| c.is_ascii_alphabetic());
    let rest_ok = chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    (first_ok && rest_ok).then_some((name, value))
}

fn require_domain(what: &str, value: &str) -> Result<String, SpfParseError> {
    if value.is_empty() {
        Err(SpfParseError::MissingArgument(what.into()))
    } else {
        Ok(value.to_string())
    }
}

fn parse_directive(token: &str) -> Result<Directive, SpfParseError> {
    let (qualifier, rest) = Qualifier::parse_prefix(token);
    let split = rest.find([':', '/']).unwrap_or(rest.len());
    let (name, tail) = rest.split_at(split);
    let arg = tail.strip_prefix(':');

    let mechanism = match name.to_ascii_lowercase().as_str() {
        "all" => {
            if !tail.is_empty() {
                return Err(SpfParseError::InvalidArgument("all takes no argument".into()));
            }
            Mechanism::All
        }
        "include" => Mechanism::Include(require_arg("include", arg)?),
        "exists" => Mechanism::Exists(require_arg("exists", arg)?),
        "ptr" => {
            if !tail.is_empty() && arg.is_none() {
                return Err(SpfParseError::InvalidArgument("ptr takes no CIDR".into()));
            }
            Mechanism::Ptr(arg.filter(|a| !a.is_empty()).map(str::to_string))
        }
        "a" => {
            let (domain, cidr) = parse_domain_cidr(arg.unwrap_or(tail))?;
            Mechanism::A { domain, cidr }
        }
        "mx" => {
            let (domain, cidr) = parse_domain_cidr(arg.unwrap_or(tail))?;
            Mechanism::Mx { domain, cidr }
        }
        "ip4" => {
            let raw = require_arg("ip4", arg)?;
            Mechanism::Ip4(Cidr::parse_v4(&raw).ok_or(SpfParseError::InvalidCidr(raw))?)
        }
        "ip6" => {
            let raw = require_arg("ip6", arg)?;
            Mechanism::Ip6(Cidr::parse_v6(&raw).ok_or(SpfParseError::InvalidCidr(raw))?)
        }
        other => return Err(SpfParseError::UnknownMechanism(other.to_string())),
    };
    Ok(Directive { qualifier, mechanism })
}

fn require_arg(what: &str, arg: Option<&str>) -> Result<String, SpfParseError> {
    match arg {
        Some(a) if !a.is_empty() => Ok(a.to_string()),
        _ => Err(SpfParseError::MissingArgument(what.into())),
    }
}

/// Split `[domain][/v4][//v6]`.
fn parse_domain_cidr(s: &str) -> Result<(Option<String>, DualCidr), SpfParseError> {
    let mut cidr = DualCidr::default();
    let (mut rest, v6) = match s.find("//") {
        Some(pos) => (&s[..pos], Some(&s[pos + 2..])),
        None => (s, None),
    };
    if let Some(v6) = v6 {
        cidr.v6 = parse_prefix(v6, 128)?;
    }
    if let Some(pos) = rest.rfind('/') {
        cidr.v4 = parse_prefix(&rest[pos + 1..], 32)?;
        rest = &rest[..pos];
    }
    let domain = (!rest.is_empty()).then(|| rest.to_string());
    Ok((domain, cidr))
}

fn parse_prefix(s: &str, max: u8) -> Result<u8, SpfParseError> {
    match s.parse::<u8>() {
        Ok(p) if p <= max => Ok(p),
        _ => Err(SpfParseError::InvalidCidr(s.to_string())),
    }
}

impl fmt::Display for Mechanism {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mechanism::All => write!(f, "all"),
            Mechanism::Include(d) => write!(f, "include:{d}"),
            Mechanism::Exists(d) => write!(f, "exists:{d}"),
            Mechanism::A { domain, cidr } | Mechanism::Mx { domain, cidr } => {
                write!(f, "{}", self.name())?;
                if let Some(d) = domain {
                    write!(f, ":{d}")?;
                }
                if cidr.v4 != 32 {
                    write!(f, "/{}", cidr.v4)?;
                }
                if cidr.v6 != 128 {
                    write!(f, "//{}", cidr.v6)?;
                }
                Ok(())
            }
            Mechanism::Ptr(d) => match d {
                Some(d) => write!(f, "ptr:{d}"),
                None => write!(f, "ptr"),
            },
            Mechanism::Ip4(c) => write!(f, "ip4:{c}"),
            Mechanism::Ip6(c) => write!(f, "ip6:{c}"),
        }
    }
}

impl fmt::Display for Directive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Pass is the default and is not printed
        if self.qualifier != Qualifier::Pass {
            write!(f, "{}", self.qualifier)?;
        }
        write!(f, "{}", self.mechanism)
    }
}

impl fmt::Display for SpfTerm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SpfTerm::Version => write!(f, "v=spf1"),
            SpfTerm::Directive(d) => write!(f, "{d}"),
            SpfTerm::Redirect(d) => write!(f, "redirect={d}"),
            SpfTerm::Explanation(d) => write!(f, "exp={d}"),
            SpfTerm::Modifier { name, value } => write!(f, "{name}={value}"),
        }
    }
}

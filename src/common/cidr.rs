use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// An address with a prefix length, as written in `ip4:`/`ip6:` terms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cidr {
    V4(Ipv4Addr, u8),
    V6(Ipv6Addr, u8),
}

impl Cidr {
    /// Parse `addr` or `addr/len`. The prefix defaults to the full width.
    pub fn parse_v4(s: &str) -> Option<Self> {
        let (addr, prefix) = split_prefix(s, 32)?;
        Some(Cidr::V4(addr.parse().ok()?, prefix))
    }

    pub fn parse_v6(s: &str) -> Option<Self> {
        let (addr, prefix) = split_prefix(s, 128)?;
        Some(Cidr::V6(addr.parse().ok()?, prefix))
    }

    pub fn prefix(&self) -> u8 {
        match self {
            Cidr::V4(_, p) | Cidr::V6(_, p) => *p,
        }
    }

    pub fn contains(&self, ip: IpAddr) -> bool {
        match (*self, ip) {
            (Cidr::V4(net, prefix), IpAddr::V4(ip)) => ip4_in_network(ip, net, prefix),
            (Cidr::V6(net, prefix), IpAddr::V6(ip)) => ip6_in_network(ip, net, prefix),
            _ => false,
        }
    }
}

impl fmt::Display for Cidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Cidr::V4(a, 32) => write!(f, "{a}"),
            Cidr::V6(a, 128) => write!(f, "{a}"),
            Cidr::V4(a, p) => write!(f, "{a}/{p}"),
            Cidr::V6(a, p) => write!(f, "{a}/{p}"),
        }
    }
}

fn split_prefix(s: &str, max: u8) -> Option<(&str, u8)> {
    match s.split_once('/') {
        Some((addr, len)) => {
            let prefix: u8 = len.parse().ok()?;
            (prefix <= max).then_some((addr, prefix))
        }
        None => Some((s, max)),
    }
}

/// prefix 0 matches everything; a prefix wider than 32 matches nothing.
pub fn ip4_in_network(ip: Ipv4Addr, network: Ipv4Addr, prefix: u8) -> bool {
    match prefix {
        0 => true,
        p if p > 32 => false,
        p => {
            let mask = !0u32 << (32 - p);
            (u32::from(ip) & mask) == (u32::from(network) & mask)
        }
    }
}

pub fn ip6_in_network(ip: Ipv6Addr, network: Ipv6Addr, prefix: u8) -> bool {
    match prefix {
        0 => true,
        p if p > 128 => false,
        p => {
            let mask = !0u128 << (128 - p);
            (u128::from(ip) & mask) == (u128::from(network) & mask)
        }
    }
}

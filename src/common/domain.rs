/// Lowercase and strip a trailing dot.
pub fn normalize(domain: &str) -> String {
    let d = domain.trim().to_ascii_lowercase();
    d.strip_suffix('.').unwrap_or(&d).to_string()
}

pub fn domains_equal(a: &str, b: &str) -> bool {
    normalize(a) == normalize(b)
}

/// Syntax check for a host name typed by a user.
///
/// Labels are 1..=63 bytes of letters, digits, `-` and `_` (the latter shows
/// up in `_dmarc`/`_domainkey` names), and the whole name is at most 253 bytes.
pub fn is_valid_domain(domain: &str) -> bool {
    let d = normalize(domain);
    if d.is_empty() || d.len() > 253 || !d.contains('.') {
        return false;
    }
    d.split('.').all(|label| {
        !label.is_empty()
            && label.len() <= 63
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
    })
}

/// Pull the domain out of an address header value.
///
/// Accepts `user@example.com`, `<user@example.com>` and
/// `"Display Name" <user@example.com>`.
pub fn domain_from_address(value: &str) -> Option<String> {
    let addr = match (value.rfind('<'), value.rfind('>')) {
        (Some(start), Some(end)) if start < end => &value[start + 1..end],
        _ => value.trim(),
    };
    let (_, domain) = addr.rsplit_once('@')?;
    let domain = domain.trim().trim_end_matches('>');
    if domain.is_empty() {
        None
    } else {
        Some(normalize(domain))
    }
}

/// Organizational domain per the Public Suffix List: the public suffix plus
/// one label. Falls back to the normalized input when the PSL has no answer.
pub fn organizational_domain(domain: &str) -> String {
    let normalized = normalize(domain);
    match psl::domain_str(&normalized) {
        Some(org) => org.to_string(),
        None => normalized,
    }
}

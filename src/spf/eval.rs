//! SPF chain evaluation.
//!
//! The include/redirect tree is walked with an explicit stack of frames in
//! document order. Every lookup-costing term draws from one shared
//! [`LookupBudget`]; once the budget is spent the walk stops and every term
//! not yet visited is left `Unevaluated`. Results are then folded bottom-up
//! over the collected nodes, so neither phase recurses.

use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use serde::Serialize;
use tracing::{debug, warn};

use crate::common::cidr::{ip4_in_network, ip6_in_network};
use crate::common::dns::{fetch_mx, DnsError, DnsResolver};
use crate::common::domain::{domains_equal, normalize};
use crate::error::{ErrorKind, InspectError};

use super::record::fetch_spf_record;
use super::term::{DualCidr, Mechanism, Qualifier, SpfTerm};
use super::SpfResult;

pub const MAX_DNS_LOOKUPS: usize = 10;
const MAX_MX_HOSTS: usize = 10;
const MAX_PTR_NAMES: usize = 10;

/// Global lookup counter with check-then-increment semantics.
///
/// Safe to share between concurrently evaluated branches: a lookup is only
/// granted when the counter is below the cap at the moment of the increment.
#[derive(Debug, Default)]
pub struct LookupBudget {
    used: AtomicUsize,
    exceeded: AtomicBool,
}

impl LookupBudget {
    pub fn try_consume(&self) -> bool {
        let granted = self
            .used
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| (n < MAX_DNS_LOOKUPS).then_some(n + 1))
            .is_ok();
        if !granted {
            self.exceeded.store(true, Ordering::SeqCst);
        }
        granted
    }

    pub fn used(&self) -> usize {
        self.used.load(Ordering::SeqCst)
    }

    pub fn exceeded(&self) -> bool {
        self.exceeded.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TermStatus {
    Valid,
    Warning,
    Invalid,
    Unevaluated,
}

/// What a lookup-costing term resolved to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    None,
    Addresses(Vec<IpAddr>),
    Exists(bool),
    /// Validated PTR names matching the target domain.
    PtrNames(Vec<String>),
    /// Index of the node holding the included or redirected record.
    Child(usize),
}

#[derive(Debug, Clone)]
pub struct EvaluatedTerm {
    pub term: SpfTerm,
    pub status: TermStatus,
    pub detail: Option<String>,
    pub resolution: Resolution,
    pub error: Option<ErrorKind>,
}

impl EvaluatedTerm {
    fn new(term: SpfTerm) -> Self {
        Self {
            term,
            status: TermStatus::Unevaluated,
            detail: None,
            resolution: Resolution::None,
            error: None,
        }
    }

    fn set(&mut self, status: TermStatus, detail: impl Into<String>) {
        self.status = status;
        self.detail = Some(detail.into());
    }
}

/// One SPF record in the evaluated tree.
#[derive(Debug, Clone)]
pub struct SpfNode {
    pub domain: String,
    pub record: Option<String>,
    pub terms: Vec<EvaluatedTerm>,
    /// Why the record could not be loaded, for included/redirected nodes.
    pub error: Option<InspectError>,
    pub via_redirect: bool,
}

impl SpfNode {
    pub fn has_all(&self) -> bool {
        self.terms
            .iter()
            .any(|t| matches!(t.term.directive(), Some(d) if d.mechanism == Mechanism::All))
    }
}

/// Evaluated include/redirect tree. Node 0 is the queried domain; a child
/// always has a higher index than its parent.
#[derive(Debug, Clone, Default)]
pub struct SpfTree {
    pub nodes: Vec<SpfNode>,
    pub lookup_count: usize,
    pub lookup_limit_exceeded: bool,
}

/// Optional facts about the connection being checked.
#[derive(Debug, Clone, Copy, Default)]
pub struct SpfContext {
    /// Without a client IP only `all` (directly or via includes) can match.
    pub client_ip: Option<IpAddr>,
}

/// Outcome of folding the tree.
#[derive(Debug, Clone)]
pub struct SpfOutcome {
    pub result: SpfResult,
    pub matched_qualifier: Qualifier,
    /// Index into node 0's terms of the directive that decided the result.
    pub matched_term: Option<usize>,
}

struct Frame {
    node: usize,
    next: usize,
    /// Domains from the root down to this node, for loop detection.
    path: Vec<String>,
}

pub struct SpfEvaluator<R: DnsResolver> {
    resolver: R,
}

impl<R: DnsResolver> SpfEvaluator<R> {
    pub fn new(resolver: R) -> Self {
        Self { resolver }
    }

    /// Fetch the record for `domain` and walk its include/redirect chain.
    ///
    /// Errors are terminal for the whole evaluation: no/multiple records or
    /// a malformed record at `domain` itself, DNS failures at the top level,
    /// and include/redirect cycles anywhere in the chain.
    pub async fn walk(&self, domain: &str, ctx: &SpfContext) -> Result<SpfTree, InspectError> {
        let domain = normalize(domain);
        let root = fetch_spf_record(&self.resolver, &domain).await?;

        let mut tree = SpfTree::default();
        tree.nodes.push(SpfNode {
            domain: domain.clone(),
            record: Some(root.source.raw_text),
            terms: root.terms.into_iter().map(EvaluatedTerm::new).collect(),
            error: None,
            via_redirect: false,
        });

        let budget = LookupBudget::default();
        let mut stack = vec![Frame {
            node: 0,
            next: 0,
            path: vec![domain],
        }];

        while let Some(frame) = stack.last_mut() {
            let node_id = frame.node;
            if frame.next >= tree.nodes[node_id].terms.len() {
                stack.pop();
                continue;
            }
            let idx = frame.next;
            frame.next += 1;
            let path = frame.path.clone();

            if budget.exceeded() {
                continue;
            }

            let term = tree.nodes[node_id].terms[idx].term.clone();
            let current = tree.nodes[node_id].domain.clone();
            match term {
                SpfTerm::Version => {
                    tree.nodes[node_id].terms[idx].status = TermStatus::Valid;
                }
                SpfTerm::Directive(d) => {
                    let target = match &d.mechanism {
                        Mechanism::Include(t) => Some((t.clone(), false)),
                        _ => None,
                    };
                    if d.mechanism.needs_lookup() && !budget.try_consume() {
                        warn!(domain = %current, "SPF lookup limit reached");
                        continue;
                    }
                    if let Some((target, via_redirect)) = target {
                        if let Some(child) = self
                            .descend(&mut tree, node_id, idx, &target, via_redirect, &path)
                            .await?
                        {
                            stack.push(child);
                        }
                    } else {
                        let resolved = self.resolve(&d.mechanism, &current, ctx).await;
                        apply(&mut tree.nodes[node_id].terms[idx], &d.mechanism, d.qualifier, resolved);
                    }
                }
                SpfTerm::Redirect(target) => {
                    if tree.nodes[node_id].has_all() {
                        tree.nodes[node_id].terms[idx]
                            .set(TermStatus::Warning, "ignored because the record has an all mechanism");
                        continue;
                    }
                    if !budget.try_consume() {
                        warn!(domain = %current, "SPF lookup limit reached");
                        continue;
                    }
                    if let Some(child) = self.descend(&mut tree, node_id, idx, &target, true, &path).await? {
                        stack.push(child);
                    }
                }
                SpfTerm::Explanation(_) => {
                    tree.nodes[node_id].terms[idx].status = TermStatus::Valid;
                }
                SpfTerm::Modifier { name, .. } => {
                    tree.nodes[node_id].terms[idx]
                        .set(TermStatus::Warning, format!("unknown modifier '{name}' is ignored"));
                }
            }
        }

        tree.lookup_count = budget.used();
        tree.lookup_limit_exceeded = budget.exceeded();
        debug!(
            nodes = tree.nodes.len(),
            lookups = tree.lookup_count,
            exceeded = tree.lookup_limit_exceeded,
            "SPF walk finished"
        );
        Ok(tree)
    }

    /// Load the record an include/redirect points at and return the frame
    /// to continue with. The lookup has already been charged.
    async fn descend(
        &self,
        tree: &mut SpfTree,
        node_id: usize,
        idx: usize,
        target: &str,
        via_redirect: bool,
        path: &[String],
    ) -> Result<Option<Frame>, InspectError> {
        if target.contains('%') {
            tree.nodes[node_id].terms[idx]
                .set(TermStatus::Warning, "target uses macros and cannot be resolved without a message");
            return Ok(None);
        }
        let target = normalize(target);
        if path.iter().any(|d| d == &target) {
            let chain = path.join(" -> ");
            return Err(InspectError::new(
                ErrorKind::SpfLoop,
                format!("SPF include loop: {chain} -> {target}"),
            ));
        }

        let child_id = tree.nodes.len();
        debug!(from = %tree.nodes[node_id].domain, to = %target, via_redirect, "following SPF reference");
        match fetch_spf_record(&self.resolver, &target).await {
            Ok(rec) => {
                tree.nodes.push(SpfNode {
                    domain: target.clone(),
                    record: Some(rec.source.raw_text),
                    terms: rec.terms.into_iter().map(EvaluatedTerm::new).collect(),
                    error: None,
                    via_redirect,
                });
                let term = &mut tree.nodes[node_id].terms[idx];
                term.status = TermStatus::Valid;
                term.resolution = Resolution::Child(child_id);
                let mut child_path = path.to_vec();
                child_path.push(target);
                Ok(Some(Frame {
                    node: child_id,
                    next: 0,
                    path: child_path,
                }))
            }
            Err(e) => {
                let term = &mut tree.nodes[node_id].terms[idx];
                term.set(TermStatus::Invalid, e.message.clone());
                term.error = Some(e.kind);
                term.resolution = Resolution::Child(child_id);
                tree.nodes.push(SpfNode {
                    domain: target,
                    record: None,
                    terms: Vec::new(),
                    error: Some(e),
                    via_redirect,
                });
                Ok(None)
            }
        }
    }

    /// Resolve an address-producing mechanism. Lookup already charged.
    async fn resolve(
        &self,
        mechanism: &Mechanism,
        current: &str,
        ctx: &SpfContext,
    ) -> Result<Resolution, DnsError> {
        match mechanism {
            Mechanism::A { domain, .. } => {
                let target = domain.as_deref().unwrap_or(current);
                if target.contains('%') {
                    return Ok(Resolution::None);
                }
                Ok(Resolution::Addresses(self.addresses(target).await?))
            }
            Mechanism::Mx { domain, .. } => {
                let target = domain.as_deref().unwrap_or(current);
                if target.contains('%') {
                    return Ok(Resolution::None);
                }
                let hosts = match fetch_mx(&self.resolver, target).await {
                    Ok(h) => h,
                    Err(DnsError::NxDomain) => Vec::new(),
                    Err(e) => return Err(e),
                };
                if hosts.len() > MAX_MX_HOSTS {
                    return Err(DnsError::Other(format!(
                        "{} MX hosts exceed the limit of {MAX_MX_HOSTS}",
                        hosts.len()
                    )));
                }
                let mut addrs = Vec::new();
                for (_, host) in hosts {
                    addrs.extend(self.addresses(&host).await?);
                }
                Ok(Resolution::Addresses(addrs))
            }
            Mechanism::Exists(target) => {
                if target.contains('%') {
                    return Ok(Resolution::None);
                }
                match self.resolver.query_a(target).await {
                    Ok(a) => Ok(Resolution::Exists(!a.is_empty())),
                    Err(DnsError::NxDomain) => Ok(Resolution::Exists(false)),
                    Err(e) => Err(e),
                }
            }
            Mechanism::Ptr(domain) => {
                let Some(ip) = ctx.client_ip else {
                    return Ok(Resolution::None);
                };
                let target = domain.as_deref().unwrap_or(current);
                let names = match self.resolver.query_ptr(ip).await {
                    Ok(n) => n,
                    Err(DnsError::NxDomain) => Vec::new(),
                    Err(e) => return Err(e),
                };
                let mut validated = Vec::new();
                for name in names.into_iter().take(MAX_PTR_NAMES) {
                    let in_target = domains_equal(&name, target)
                        || normalize(&name).ends_with(&format!(".{}", normalize(target)));
                    if in_target && self.addresses(&name).await.unwrap_or_default().contains(&ip) {
                        validated.push(name);
                    }
                }
                Ok(Resolution::PtrNames(validated))
            }
            Mechanism::All | Mechanism::Include(_) | Mechanism::Ip4(_) | Mechanism::Ip6(_) => Ok(Resolution::None),
        }
    }

    /// A and AAAA for one name; NXDOMAIN counts as an empty answer.
    async fn addresses(&self, name: &str) -> Result<Vec<IpAddr>, DnsError> {
        let mut out: Vec<IpAddr> = match self.resolver.query_a(name).await {
            Ok(v4) => v4.into_iter().map(IpAddr::V4).collect(),
            Err(DnsError::NxDomain) => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        match self.resolver.query_aaaa(name).await {
            Ok(v6) => out.extend(v6.into_iter().map(IpAddr::V6)),
            Err(DnsError::NxDomain) => {}
            Err(e) => return Err(e),
        }
        Ok(out)
    }
}

fn apply(
    term: &mut EvaluatedTerm,
    mechanism: &Mechanism,
    qualifier: Qualifier,
    resolved: Result<Resolution, DnsError>,
) {
    match resolved {
        Err(e) => {
            term.error = Some(InspectError::from(e.clone()).kind);
            term.set(TermStatus::Invalid, e.to_string());
        }
        Ok(resolution) => {
            term.status = TermStatus::Valid;
            match (&resolution, mechanism) {
                (Resolution::None, Mechanism::A { .. } | Mechanism::Mx { .. } | Mechanism::Exists(_)) => {
                    term.set(TermStatus::Warning, "target uses macros and cannot be resolved without a message");
                }
                (Resolution::Addresses(a), _) if a.is_empty() => {
                    term.set(TermStatus::Warning, "lookup returned no addresses (void lookup)");
                }
                (_, Mechanism::Ptr(_)) => {
                    term.set(TermStatus::Warning, "ptr is deprecated (RFC 7208 §5.5)");
                }
                (_, Mechanism::All) if qualifier == Qualifier::Pass => {
                    term.set(TermStatus::Warning, "+all authorizes every host on the internet");
                }
                _ => {}
            }
            term.resolution = resolution;
        }
    }
}

fn matches_addr(addrs: &[IpAddr], cidr: DualCidr, client: IpAddr) -> bool {
    addrs.iter().any(|a| match (a, client) {
        (IpAddr::V4(net), IpAddr::V4(ip)) => ip4_in_network(ip, *net, cidr.v4),
        (IpAddr::V6(net), IpAddr::V6(ip)) => ip6_in_network(ip, *net, cidr.v6),
        _ => false,
    })
}

fn error_result(kind: ErrorKind) -> SpfResult {
    match kind {
        ErrorKind::DnsTimeout | ErrorKind::DnsFailure => SpfResult::TempError,
        ErrorKind::NxDomain | ErrorKind::NoSpfRecord => SpfResult::None,
        _ => SpfResult::PermError,
    }
}

/// check_host() result of one node, given the results of its children.
fn node_result(node: &SpfNode, results: &[Option<SpfResult>], ctx: &SpfContext) -> (SpfResult, Option<usize>) {
    if let Some(e) = &node.error {
        return (error_result(e.kind), None);
    }
    let child_result = |r: &Resolution| match r {
        Resolution::Child(id) => results.get(*id).copied().flatten(),
        _ => None,
    };

    for (idx, t) in node.terms.iter().enumerate() {
        let Some(d) = t.term.directive() else { continue };
        if t.status == TermStatus::Unevaluated {
            return (SpfResult::PermError, None);
        }
        let matched = match &d.mechanism {
            Mechanism::All => true,
            Mechanism::Include(_) => match child_result(&t.resolution) {
                Some(SpfResult::Pass) => true,
                Some(SpfResult::Fail | SpfResult::SoftFail | SpfResult::Neutral) => false,
                Some(SpfResult::TempError) => return (SpfResult::TempError, None),
                // an include that yields none is a permanent error (RFC 7208 §5.2)
                Some(SpfResult::None | SpfResult::PermError) => return (SpfResult::PermError, None),
                None => false,
            },
            _ if t.error.is_some() => return (t.error.map(error_result).unwrap_or(SpfResult::PermError), None),
            Mechanism::Ip4(c) | Mechanism::Ip6(c) => ctx.client_ip.is_some_and(|ip| c.contains(ip)),
            Mechanism::A { cidr, .. } | Mechanism::Mx { cidr, .. } => match (&t.resolution, ctx.client_ip) {
                (Resolution::Addresses(a), Some(ip)) => matches_addr(a, *cidr, ip),
                _ => false,
            },
            Mechanism::Exists(_) => ctx.client_ip.is_some() && t.resolution == Resolution::Exists(true),
            Mechanism::Ptr(_) => matches!(&t.resolution, Resolution::PtrNames(n) if !n.is_empty()),
        };
        if matched {
            return (SpfResult::from(d.qualifier), Some(idx));
        }
    }

    if !node.has_all() {
        if let Some(t) = node.terms.iter().find(|t| matches!(t.term, SpfTerm::Redirect(_))) {
            if t.status == TermStatus::Unevaluated {
                return (SpfResult::PermError, None);
            }
            return match child_result(&t.resolution) {
                Some(SpfResult::None) => (SpfResult::PermError, None),
                Some(r) => (r, None),
                None => (SpfResult::Neutral, None),
            };
        }
    }
    (SpfResult::Neutral, None)
}

/// Fold results from the leaves up to the root.
pub fn fold(tree: &SpfTree, ctx: &SpfContext) -> SpfOutcome {
    let mut results: Vec<Option<SpfResult>> = vec![None; tree.nodes.len()];
    let mut root_match = None;
    for id in (0..tree.nodes.len()).rev() {
        let (result, matched) = node_result(&tree.nodes[id], &results, ctx);
        results[id] = Some(result);
        if id == 0 {
            root_match = matched;
        }
    }
    let result = results.first().copied().flatten().unwrap_or(SpfResult::None);
    let matched_qualifier = root_match
        .and_then(|idx| tree.nodes[0].terms[idx].term.directive())
        .map(|d| d.qualifier)
        .or_else(|| result.qualifier())
        .unwrap_or(Qualifier::Neutral);
    SpfOutcome {
        result,
        matched_qualifier,
        matched_term: root_match,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::dns::MockResolver;
    use std::net::Ipv4Addr;

    fn ctx_ip(ip: &str) -> SpfContext {
        SpfContext {
            client_ip: Some(ip.parse().unwrap()),
        }
    }

    #[test]
    fn budget_caps_at_ten() {
        let budget = LookupBudget::default();
        for _ in 0..MAX_DNS_LOOKUPS {
            assert!(budget.try_consume());
        }
        assert!(!budget.try_consume());
        assert_eq!(budget.used(), MAX_DNS_LOOKUPS);
        assert!(budget.exceeded());
    }

    #[tokio::test]
    async fn budget_is_exact_under_contention() {
        let budget = std::sync::Arc::new(LookupBudget::default());
        let mut handles = Vec::new();
        for _ in 0..32 {
            let b = budget.clone();
            handles.push(tokio::spawn(async move { b.try_consume() }));
        }
        let mut granted = 0;
        for h in handles {
            if h.await.unwrap() {
                granted += 1;
            }
        }
        assert_eq!(granted, MAX_DNS_LOOKUPS);
        assert_eq!(budget.used(), MAX_DNS_LOOKUPS);
    }

    #[tokio::test]
    async fn counts_nested_includes() {
        let resolver = MockResolver::new();
        resolver.add_txt("example.com", vec!["v=spf1 include:a.example include:b.example -all".into()]);
        resolver.add_txt("a.example", vec!["v=spf1 include:c.example ~all".into()]);
        resolver.add_txt("b.example", vec!["v=spf1 ip4:192.0.2.0/24 ~all".into()]);
        resolver.add_txt("c.example", vec!["v=spf1 ip4:198.51.100.0/24 ~all".into()]);

        let tree = SpfEvaluator::new(resolver)
            .walk("example.com", &SpfContext::default())
            .await
            .unwrap();
        // two direct includes plus one nested include
        assert_eq!(tree.lookup_count, 3);
        assert!(!tree.lookup_limit_exceeded);
        assert_eq!(tree.nodes.len(), 4);
        assert_eq!(tree.nodes[1].domain, "a.example");
        assert_eq!(tree.nodes[2].domain, "c.example");
        assert_eq!(tree.nodes[3].domain, "b.example");
    }

    #[tokio::test]
    async fn halts_at_tenth_lookup() {
        let resolver = MockResolver::new();
        let includes: Vec<String> = (0..12).map(|i| format!("include:i{i}.example")).collect();
        resolver.add_txt("example.com", vec![format!("v=spf1 {} -all", includes.join(" "))]);
        for i in 0..12 {
            resolver.add_txt(&format!("i{i}.example"), vec!["v=spf1 ~all".into()]);
        }

        let tree = SpfEvaluator::new(resolver.clone())
            .walk("example.com", &SpfContext::default())
            .await
            .unwrap();
        assert_eq!(tree.lookup_count, 10);
        assert!(tree.lookup_limit_exceeded);

        let statuses: Vec<TermStatus> = tree.nodes[0].terms.iter().map(|t| t.status).collect();
        // version + 10 evaluated includes
        assert!(statuses[..11].iter().all(|s| *s == TermStatus::Valid));
        // 11th and 12th include plus -all
        assert!(statuses[11..].iter().all(|s| *s == TermStatus::Unevaluated));
        assert!(!resolver.queries().contains(&"i10.example".to_string()));

        let outcome = fold(&tree, &SpfContext::default());
        assert_eq!(outcome.result, SpfResult::PermError);
    }

    #[tokio::test]
    async fn include_cycle_is_detected() {
        let resolver = MockResolver::new();
        resolver.add_txt("a.example", vec!["v=spf1 include:b.example -all".into()]);
        resolver.add_txt("b.example", vec!["v=spf1 include:a.example -all".into()]);

        let err = SpfEvaluator::new(resolver)
            .walk("a.example", &SpfContext::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::SpfLoop);
        assert!(err.message.contains("a.example -> b.example -> a.example"));
    }

    #[tokio::test]
    async fn diamond_includes_are_not_loops() {
        let resolver = MockResolver::new();
        resolver.add_txt("top.example", vec!["v=spf1 include:l.example include:r.example -all".into()]);
        resolver.add_txt("l.example", vec!["v=spf1 include:shared.example ~all".into()]);
        resolver.add_txt("r.example", vec!["v=spf1 include:shared.example ~all".into()]);
        resolver.add_txt("shared.example", vec!["v=spf1 ip4:192.0.2.1 ~all".into()]);

        let tree = SpfEvaluator::new(resolver)
            .walk("top.example", &SpfContext::default())
            .await
            .unwrap();
        assert_eq!(tree.lookup_count, 4);
    }

    #[tokio::test]
    async fn broken_include_marks_term_invalid() {
        let resolver = MockResolver::new();
        resolver.add_txt("example.com", vec!["v=spf1 include:missing.example ip4:192.0.2.1 -all".into()]);
        resolver.set_nxdomain("missing.example");

        let tree = SpfEvaluator::new(resolver)
            .walk("example.com", &SpfContext::default())
            .await
            .unwrap();
        let include = &tree.nodes[0].terms[1];
        assert_eq!(include.status, TermStatus::Invalid);
        assert_eq!(include.error, Some(ErrorKind::NxDomain));
        assert!(tree.nodes[1].error.is_some());
    }

    #[tokio::test]
    async fn first_matching_mechanism_decides() {
        let resolver = MockResolver::new();
        resolver.add_txt(
            "example.com",
            vec!["v=spf1 a ip4:192.0.2.0/24 include:_spf.example.net ~all".into()],
        );
        resolver.add_a("example.com", vec![Ipv4Addr::new(203, 0, 113, 5)]);
        resolver.add_txt("_spf.example.net", vec!["v=spf1 ip4:198.51.100.0/24 -all".into()]);
        let eval = SpfEvaluator::new(resolver);

        let ctx = ctx_ip("203.0.113.5");
        let tree = eval.walk("example.com", &ctx).await.unwrap();
        let o = fold(&tree, &ctx);
        assert_eq!((o.result, o.matched_term), (SpfResult::Pass, Some(1)));

        let ctx = ctx_ip("198.51.100.7");
        let tree = eval.walk("example.com", &ctx).await.unwrap();
        let o = fold(&tree, &ctx);
        assert_eq!((o.result, o.matched_term), (SpfResult::Pass, Some(3)));

        let ctx = ctx_ip("8.8.8.8");
        let tree = eval.walk("example.com", &ctx).await.unwrap();
        let o = fold(&tree, &ctx);
        assert_eq!(o.result, SpfResult::SoftFail);
        assert_eq!(o.matched_qualifier, Qualifier::SoftFail);
    }

    #[tokio::test]
    async fn without_client_ip_only_all_matches() {
        let resolver = MockResolver::new();
        resolver.add_txt("example.com", vec!["v=spf1 ip4:0.0.0.0/0 -all".into()]);
        let tree = SpfEvaluator::new(resolver)
            .walk("example.com", &SpfContext::default())
            .await
            .unwrap();
        let o = fold(&tree, &SpfContext::default());
        assert_eq!(o.result, SpfResult::Fail);
        assert_eq!(o.matched_qualifier, Qualifier::Fail);
    }

    #[tokio::test]
    async fn no_all_defaults_to_neutral() {
        let resolver = MockResolver::new();
        resolver.add_txt("example.com", vec!["v=spf1 ip4:192.0.2.1".into()]);
        let tree = SpfEvaluator::new(resolver)
            .walk("example.com", &SpfContext::default())
            .await
            .unwrap();
        let o = fold(&tree, &SpfContext::default());
        assert_eq!(o.result, SpfResult::Neutral);
        assert_eq!(o.matched_qualifier, Qualifier::Neutral);
    }

    #[tokio::test]
    async fn redirect_is_followed_only_without_all() {
        let resolver = MockResolver::new();
        resolver.add_txt("example.com", vec!["v=spf1 redirect=_spf.example.com".into()]);
        resolver.add_txt("_spf.example.com", vec!["v=spf1 -all".into()]);
        resolver.add_txt("other.example", vec!["v=spf1 ~all redirect=_spf.example.com".into()]);
        let eval = SpfEvaluator::new(resolver);

        let tree = eval.walk("example.com", &SpfContext::default()).await.unwrap();
        assert_eq!(tree.lookup_count, 1);
        assert!(tree.nodes[1].via_redirect);
        assert_eq!(fold(&tree, &SpfContext::default()).result, SpfResult::Fail);

        let tree = eval.walk("other.example", &SpfContext::default()).await.unwrap();
        assert_eq!(tree.lookup_count, 0);
        assert_eq!(tree.nodes[0].terms[2].status, TermStatus::Warning);
        assert_eq!(fold(&tree, &SpfContext::default()).result, SpfResult::SoftFail);
    }

    #[tokio::test]
    async fn mx_mechanism_resolves_host_addresses() {
        let resolver = MockResolver::new();
        resolver.add_txt("example.com", vec!["v=spf1 mx -all".into()]);
        resolver.add_mx("example.com", vec![(10, "mx1.example.com".into())]);
        resolver.add_a("mx1.example.com", vec![Ipv4Addr::new(192, 0, 2, 25)]);

        let ctx = ctx_ip("192.0.2.25");
        let tree = SpfEvaluator::new(resolver).walk("example.com", &ctx).await.unwrap();
        assert_eq!(tree.lookup_count, 1);
        assert_eq!(fold(&tree, &ctx).result, SpfResult::Pass);
    }

    #[tokio::test]
    async fn include_of_domain_without_record_is_permerror() {
        let resolver = MockResolver::new();
        resolver.add_txt("example.com", vec!["v=spf1 include:empty.example -all".into()]);
        resolver.add_txt("empty.example", vec!["not spf".into()]);

        let tree = SpfEvaluator::new(resolver)
            .walk("example.com", &SpfContext::default())
            .await
            .unwrap();
        assert_eq!(tree.nodes[0].terms[1].error, Some(ErrorKind::NoSpfRecord));
        assert_eq!(fold(&tree, &SpfContext::default()).result, SpfResult::PermError);
    }
}

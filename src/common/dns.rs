use std::collections::HashMap;
use std::future::Future;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use hickory_resolver::config::{ResolverConfig, ResolverOpts};
use hickory_resolver::name_server::TokioConnectionProvider;
use hickory_resolver::{ResolveError, TokioResolver};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::DnsConfig;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DnsError {
    #[error("NXDOMAIN: domain does not exist")]
    NxDomain,
    #[error("SERVFAIL: server failure")]
    ServFail,
    #[error("DNS query timed out")]
    Timeout,
    #[error("DNS error: {0}")]
    Other(String),
}

impl DnsError {
    /// Errors worth another attempt. NXDOMAIN is an authoritative answer.
    fn is_transient(&self) -> bool {
        !matches!(self, DnsError::NxDomain)
    }
}

/// DNS resolver abstraction used by every evaluator.
///
/// An empty answer is `Ok(vec![])`; a name that does not exist is
/// `Err(DnsError::NxDomain)`.
pub trait DnsResolver: Clone + Send + Sync + 'static {
    fn query_txt(&self, domain: &str) -> impl Future<Output = Result<Vec<String>, DnsError>> + Send;
    fn query_a(&self, domain: &str) -> impl Future<Output = Result<Vec<Ipv4Addr>, DnsError>> + Send;
    fn query_aaaa(&self, domain: &str) -> impl Future<Output = Result<Vec<Ipv6Addr>, DnsError>> + Send;
    fn query_mx(&self, domain: &str) -> impl Future<Output = Result<Vec<(u16, String)>, DnsError>> + Send;
    fn query_ptr(&self, ip: IpAddr) -> impl Future<Output = Result<Vec<String>, DnsError>> + Send;
}

/// Timeout and retry policy applied around each hickory lookup.
#[derive(Debug, Clone)]
struct RetryPolicy {
    timeout: Duration,
    retries: u32,
    backoff: Duration,
}

impl RetryPolicy {
    fn delay(&self, attempt: u32) -> Duration {
        self.backoff * (1u32 << attempt.saturating_sub(1).min(16))
    }
}

/// Hickory DNS resolver with bounded timeout and exponential-backoff retry.
#[derive(Clone)]
pub struct HickoryResolver {
    resolver: TokioResolver,
    policy: RetryPolicy,
}

impl HickoryResolver {
    pub fn new(config: &DnsConfig) -> Self {
        Self::with_resolver_config(ResolverConfig::default(), config)
    }

    pub fn with_resolver_config(resolver_config: ResolverConfig, config: &DnsConfig) -> Self {
        let mut opts = ResolverOpts::default();
        // retries are driven here so every attempt gets the same timeout
        opts.attempts = 1;
        opts.timeout = config.timeout();
        let resolver = TokioResolver::builder_with_config(resolver_config, TokioConnectionProvider::default())
            .with_options(opts)
            .build();
        Self {
            resolver,
            policy: RetryPolicy {
                timeout: config.timeout(),
                retries: config.retries(),
                backoff: config.backoff(1),
            },
        }
    }

    fn classify_error<T>(e: &ResolveError) -> Result<Vec<T>, DnsError> {
        if e.is_nx_domain() {
            return Err(DnsError::NxDomain);
        }
        if e.is_no_records_found() {
            return Ok(Vec::new());
        }
        let msg = e.to_string().to_lowercase();
        if msg.contains("timed out") || msg.contains("timeout") {
            Err(DnsError::Timeout)
        } else if msg.contains("servfail") {
            Err(DnsError::ServFail)
        } else {
            Err(DnsError::Other(e.to_string()))
        }
    }
}

/// Run `query` under `policy`: each attempt is bounded by the timeout, and
/// transient failures are retried with exponential backoff. NXDOMAIN is
/// returned after the first attempt.
async fn with_retry<T, F, Fut>(policy: &RetryPolicy, name: &str, query: F) -> Result<Vec<T>, DnsError>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<Vec<T>, DnsError>>,
{
    let mut attempt = 0;
    loop {
        let outcome = match tokio::time::timeout(policy.timeout, query()).await {
            Ok(result) => result,
            Err(_) => Err(DnsError::Timeout),
        };
        match outcome {
            Err(e) if e.is_transient() && attempt < policy.retries => {
                attempt += 1;
                let delay = policy.delay(attempt);
                debug!(%name, error = %e, attempt, ?delay, "retrying DNS query");
                tokio::time::sleep(delay).await;
            }
            Err(e) => {
                if e.is_transient() {
                    warn!(%name, error = %e, "DNS query failed after retries");
                }
                return Err(e);
            }
            Ok(records) => return Ok(records),
        }
    }
}

impl DnsResolver for HickoryResolver {
    async fn query_txt(&self, domain: &str) -> Result<Vec<String>, DnsError> {
        let resolver = &self.resolver;
        with_retry(&self.policy, domain, move || async move {
            match resolver.txt_lookup(domain).await {
                // character-strings of one record are concatenated (RFC 7208 §3.3)
                Ok(lookup) => Ok(lookup
                    .iter()
                    .map(|txt| {
                        txt.txt_data()
                            .iter()
                            .map(|part| String::from_utf8_lossy(part))
                            .collect::<String>()
                    })
                    .collect()),
                Err(e) => Self::classify_error(&e),
            }
        })
        .await
    }

    async fn query_a(&self, domain: &str) -> Result<Vec<Ipv4Addr>, DnsError> {
        let resolver = &self.resolver;
        with_retry(&self.policy, domain, move || async move {
            match resolver.ipv4_lookup(domain).await {
                Ok(lookup) => Ok(lookup.iter().map(|a| a.0).collect()),
                Err(e) => Self::classify_error(&e),
            }
        })
        .await
    }

    async fn query_aaaa(&self, domain: &str) -> Result<Vec<Ipv6Addr>, DnsError> {
        let resolver = &self.resolver;
        with_retry(&self.policy, domain, move || async move {
            match resolver.ipv6_lookup(domain).await {
                Ok(lookup) => Ok(lookup.iter().map(|a| a.0).collect()),
                Err(e) => Self::classify_error(&e),
            }
        })
        .await
    }

    async fn query_mx(&self, domain: &str) -> Result<Vec<(u16, String)>, DnsError> {
        let resolver = &self.resolver;
        with_retry(&self.policy, domain, move || async move {
            match resolver.mx_lookup(domain).await {
                Ok(lookup) => Ok(lookup
                    .iter()
                    .map(|mx| {
                        let host = mx.exchange().to_string();
                        (mx.preference(), host.trim_end_matches('.').to_string())
                    })
                    .collect()),
                Err(e) => Self::classify_error(&e),
            }
        })
        .await
    }

    async fn query_ptr(&self, ip: IpAddr) -> Result<Vec<String>, DnsError> {
        let name = ip.to_string();
        let resolver = &self.resolver;
        with_retry(&self.policy, &name, move || async move {
            match resolver.reverse_lookup(ip).await {
                Ok(lookup) => Ok(lookup
                    .iter()
                    .map(|ptr| ptr.to_string().trim_end_matches('.').to_string())
                    .collect()),
                Err(e) => Self::classify_error(&e),
            }
        })
        .await
    }
}

/// Kind of policy record a TXT answer was fetched for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RecordKind {
    Spf,
    Dkim,
    Dmarc,
}

/// A raw TXT record as fetched, stamped with the fetch time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DomainRecord {
    pub domain: String,
    pub record_type: RecordKind,
    pub raw_text: String,
    pub fetched_at: DateTime<Utc>,
}

/// Fetch all TXT strings published at `name`.
pub async fn fetch_txt<R: DnsResolver>(resolver: &R, name: &str) -> Result<Vec<String>, DnsError> {
    resolver.query_txt(name).await
}

/// Fetch MX records for `domain`, ordered by ascending priority.
pub async fn fetch_mx<R: DnsResolver>(resolver: &R, domain: &str) -> Result<Vec<(u16, String)>, DnsError> {
    let mut records = resolver.query_mx(domain).await?;
    records.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
    Ok(records)
}

/// Fetch TXT records at `name` and keep those accepted by `filter`.
pub async fn fetch_records<R, F>(
    resolver: &R,
    name: &str,
    kind: RecordKind,
    filter: F,
) -> Result<Vec<DomainRecord>, DnsError>
where
    R: DnsResolver,
    F: Fn(&str) -> bool,
{
    let fetched_at = Utc::now();
    let records = fetch_txt(resolver, name).await?;
    debug!(%name, ?kind, count = records.len(), "fetched TXT records");
    Ok(records
        .into_iter()
        .filter(|txt| filter(txt))
        .map(|raw_text| DomainRecord {
            domain: name.to_string(),
            record_type: kind,
            raw_text,
            fetched_at,
        })
        .collect())
}

/// In-memory resolver for tests.
#[derive(Clone, Default)]
pub struct MockResolver {
    txt_records: Arc<Mutex<HashMap<String, Vec<String>>>>,
    a_records: Arc<Mutex<HashMap<String, Vec<Ipv4Addr>>>>,
    aaaa_records: Arc<Mutex<HashMap<String, Vec<Ipv6Addr>>>>,
    mx_records: Arc<Mutex<HashMap<String, Vec<(u16, String)>>>>,
    ptr_records: Arc<Mutex<HashMap<IpAddr, Vec<String>>>>,
    failures: Arc<Mutex<HashMap<String, DnsError>>>,
    queries: Arc<Mutex<Vec<String>>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl MockResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_txt(&self, domain: &str, records: Vec<String>) {
        lock(&self.txt_records).insert(domain.to_lowercase(), records);
    }

    pub fn add_a(&self, domain: &str, addrs: Vec<Ipv4Addr>) {
        lock(&self.a_records).insert(domain.to_lowercase(), addrs);
    }

    pub fn add_aaaa(&self, domain: &str, addrs: Vec<Ipv6Addr>) {
        lock(&self.aaaa_records).insert(domain.to_lowercase(), addrs);
    }

    pub fn add_mx(&self, domain: &str, records: Vec<(u16, String)>) {
        lock(&self.mx_records).insert(domain.to_lowercase(), records);
    }

    pub fn add_ptr(&self, ip: IpAddr, names: Vec<String>) {
        lock(&self.ptr_records).insert(ip, names);
    }

    pub fn set_nxdomain(&self, domain: &str) {
        self.set_failure(domain, DnsError::NxDomain);
    }

    /// Every query for `domain` fails with `error`.
    pub fn set_failure(&self, domain: &str, error: DnsError) {
        lock(&self.failures).insert(domain.to_lowercase(), error);
    }

    /// Names queried so far, in order.
    pub fn queries(&self) -> Vec<String> {
        lock(&self.queries).clone()
    }

    fn lookup<T: Clone>(&self, table: &Mutex<HashMap<String, Vec<T>>>, domain: &str) -> Result<Vec<T>, DnsError> {
        let key = domain.to_lowercase().trim_end_matches('.').to_string();
        lock(&self.queries).push(key.clone());
        if let Some(err) = lock(&self.failures).get(&key) {
            return Err(err.clone());
        }
        Ok(lock(table).get(&key).cloned().unwrap_or_default())
    }
}

impl DnsResolver for MockResolver {
    async fn query_txt(&self, domain: &str) -> Result<Vec<String>, DnsError> {
        self.lookup(&self.txt_records, domain)
    }

    async fn query_a(&self, domain: &str) -> Result<Vec<Ipv4Addr>, DnsError> {
        self.lookup(&self.a_records, domain)
    }

    async fn query_aaaa(&self, domain: &str) -> Result<Vec<Ipv6Addr>, DnsError> {
        self.lookup(&self.aaaa_records, domain)
    }

    async fn query_mx(&self, domain: &str) -> Result<Vec<(u16, String)>, DnsError> {
        self.lookup(&self.mx_records, domain)
    }

    async fn query_ptr(&self, ip: IpAddr) -> Result<Vec<String>, DnsError> {
        lock(&self.queries).push(ip.to_string());
        Ok(lock(&self.ptr_records).get(&ip).cloned().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn mock_resolver_txt() {
        let resolver = MockResolver::new();
        resolver.add_txt("example.com", vec!["v=spf1 -all".to_string()]);

        let result = resolver.query_txt("Example.COM").await.unwrap();
        assert_eq!(result, vec!["v=spf1 -all"]);
    }

    #[tokio::test]
    async fn nxdomain_differs_from_empty_answer() {
        let resolver = MockResolver::new();
        resolver.set_nxdomain("nonexistent.com");

        let missing = resolver.query_txt("nonexistent.com").await;
        assert_eq!(missing, Err(DnsError::NxDomain));
        let empty = resolver.query_txt("exists-but-empty.com").await;
        assert_eq!(empty, Ok(vec![]));
    }

    #[tokio::test]
    async fn fetch_mx_orders_by_priority() {
        let resolver = MockResolver::new();
        resolver.add_mx(
            "example.com",
            vec![(20, "mx2.example.com".into()), (10, "mx1.example.com".into())],
        );
        let mx = fetch_mx(&resolver, "example.com").await.unwrap();
        assert_eq!(mx[0], (10, "mx1.example.com".to_string()));
        assert_eq!(mx[1], (20, "mx2.example.com".to_string()));
    }

    #[tokio::test]
    async fn fetch_records_filters_and_stamps() {
        let resolver = MockResolver::new();
        resolver.add_txt(
            "example.com",
            vec!["google-site-verification=abc".into(), "v=spf1 -all".into()],
        );
        let before = Utc::now();
        let records = fetch_records(&resolver, "example.com", RecordKind::Spf, |t| t.starts_with("v=spf1"))
            .await
            .unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].raw_text, "v=spf1 -all");
        assert_eq!(records[0].record_type, RecordKind::Spf);
        assert!(records[0].fetched_at >= before);
    }

    #[tokio::test]
    async fn injected_timeout_surfaces() {
        let resolver = MockResolver::new();
        resolver.set_failure("slow.example", DnsError::Timeout);
        assert_eq!(resolver.query_mx("slow.example").await, Err(DnsError::Timeout));
    }

    #[test]
    fn retry_delay_doubles() {
        let policy = RetryPolicy {
            timeout: Duration::from_secs(5),
            retries: 2,
            backoff: Duration::from_millis(100),
        };
        assert_eq!(policy.delay(1), Duration::from_millis(100));
        assert_eq!(policy.delay(2), Duration::from_millis(200));
    }

    #[test]
    fn nxdomain_is_final() {
        assert!(!DnsError::NxDomain.is_transient());
        assert!(DnsError::Timeout.is_transient());
        assert!(DnsError::ServFail.is_transient());
    }

    fn default_policy() -> RetryPolicy {
        RetryPolicy {
            timeout: Duration::from_secs(5),
            retries: 2,
            backoff: Duration::from_millis(200),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn hanging_query_times_out_after_three_attempts() {
        let calls = AtomicUsize::new(0);
        let started = tokio::time::Instant::now();
        let result: Result<Vec<String>, DnsError> = with_retry(&default_policy(), "slow.example", || {
            calls.fetch_add(1, Ordering::SeqCst);
            std::future::pending()
        })
        .await;
        assert_eq!(result, Err(DnsError::Timeout));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        // three 5s attempts plus 200ms and 400ms of backoff
        assert!(started.elapsed() >= Duration::from_millis(15_600));
    }

    #[tokio::test(start_paused = true)]
    async fn nxdomain_is_not_retried() {
        let calls = AtomicUsize::new(0);
        let result: Result<Vec<String>, DnsError> = with_retry(&default_policy(), "gone.example", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(DnsError::NxDomain) }
        })
        .await;
        assert_eq!(result, Err(DnsError::NxDomain));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn servfail_recovers_on_retry() {
        let calls = AtomicUsize::new(0);
        let result = with_retry(&default_policy(), "flaky.example", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    Err(DnsError::ServFail)
                } else {
                    Ok(vec!["v=spf1 -all".to_string()])
                }
            }
        })
        .await;
        assert_eq!(result, Ok(vec!["v=spf1 -all".to_string()]));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tracing::warn;

use crate::error::{ErrorKind, InspectError};

/// Absolute point in time after which in-flight work is abandoned.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    at: Instant,
}

impl Deadline {
    pub fn after(budget: Duration) -> Self {
        Self {
            at: Instant::now() + budget,
        }
    }

    pub fn remaining(&self) -> Duration {
        self.at.saturating_duration_since(Instant::now())
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.at
    }

    /// Run `fut` until it finishes or the deadline passes.
    ///
    /// On expiry the future is dropped, which closes any socket it owns.
    pub async fn run<T, F>(&self, what: &str, kind: ErrorKind, fut: F) -> Result<T, InspectError>
    where
        F: Future<Output = T>,
    {
        match tokio::time::timeout_at(self.at, fut).await {
            Ok(v) => Ok(v),
            Err(_) => {
                warn!(%what, "deadline expired");
                Err(InspectError::new(kind, format!("{what} did not complete before the deadline")))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn completes_within_budget() {
        let d = Deadline::after(Duration::from_secs(5));
        let v = d.run("noop", ErrorKind::Timeout, async { 7 }).await.unwrap();
        assert_eq!(v, 7);
        assert!(!d.is_expired());
    }

    #[tokio::test(start_paused = true)]
    async fn expiry_returns_timeout_kind() {
        let d = Deadline::after(Duration::from_millis(50));
        let err = d
            .run("dns lookup", ErrorKind::DnsTimeout, tokio::time::sleep(Duration::from_secs(60)))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::DnsTimeout);
        assert!(err.message.contains("dns lookup"));
    }
}

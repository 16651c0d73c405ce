use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Backoff schedule for retried upstream calls: `base * 2^attempt`, capped.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub base_ms: u64,
    pub cap_ms: u64,
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_ms: 500,
            cap_ms: 15_000,
            max_attempts: 4,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (0-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.min(20);
        Duration::from_millis(self.base_ms.saturating_mul(factor).min(self.cap_ms))
    }
}

/// Endpoint URLs and call behavior for the upstream client. Constructed once
/// at startup and injected; nothing deeper in the stack reads ambient state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    pub update_url: String,
    pub marketplace_url: String,
    pub recommendations_url: String,
    pub malicious_url: String,
    pub timeout_secs: u64,
    pub retry: RetryPolicy,
    /// Editor version advertised in marketplace headers.
    pub client_version: String,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            update_url: "https://update.code.visualstudio.com/api/update".to_owned(),
            marketplace_url:
                "https://marketplace.visualstudio.com/_apis/public/gallery/extensionquery"
                    .to_owned(),
            recommendations_url:
                "https://main.vscode-cdn.net/extensions/workspaceRecommendations.json.gz"
                    .to_owned(),
            malicious_url: "https://main.vscode-cdn.net/extensions/marketplace.json".to_owned(),
            timeout_secs: 12,
            retry: RetryPolicy::default(),
            client_version: "1.100.1".to_owned(),
        }
    }
}

impl UpstreamConfig {
    /// Rebase every endpoint onto one origin; used by tests pointing the
    /// client at a mock server.
    #[must_use]
    pub fn with_base(mut self, base: &str) -> Self {
        let base = base.trim_end_matches('/');
        self.update_url = format!("{base}/api/update");
        self.marketplace_url = format!("{base}/_apis/public/gallery/extensionquery");
        self.recommendations_url = format!("{base}/extensions/workspaceRecommendations.json.gz");
        self.malicious_url = format!("{base}/extensions/marketplace.json");
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_secs = timeout.as_secs().max(1);
        self
    }

    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// User-Agent / client-id value the marketplace expects.
    pub fn user_agent(&self) -> String {
        format!("VSCode {}", self.client_version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        let retry = RetryPolicy {
            base_ms: 100,
            cap_ms: 500,
            max_attempts: 5,
        };
        assert_eq!(retry.backoff(0), Duration::from_millis(100));
        assert_eq!(retry.backoff(1), Duration::from_millis(200));
        assert_eq!(retry.backoff(2), Duration::from_millis(400));
        assert_eq!(retry.backoff(3), Duration::from_millis(500));
        assert_eq!(retry.backoff(10), Duration::from_millis(500));
    }

    #[test]
    fn with_base_rewrites_all_endpoints() {
        let config = UpstreamConfig::default().with_base("http://127.0.0.1:9999/");
        assert_eq!(config.update_url, "http://127.0.0.1:9999/api/update");
        assert!(config.marketplace_url.starts_with("http://127.0.0.1:9999/"));
        assert!(config.recommendations_url.starts_with("http://127.0.0.1:9999/"));
        assert!(config.malicious_url.starts_with("http://127.0.0.1:9999/"));
    }

    #[test]
    fn user_agent_carries_client_version() {
        let config = UpstreamConfig::default();
        assert!(config.user_agent().starts_with("VSCode "));
    }
}

use std::net::SocketAddr;
use std::time::Duration;

/// Bounded polling policy for the verification endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first.
    pub max_attempts: u32,
    /// Fixed delay between attempts.
    pub interval: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            interval: Duration::from_secs(2),
        }
    }
}

/// Where the item source, answer sink and verification endpoint live.
///
/// All three channels share one endpoint and are told apart by the
/// `channel` field of the request body.
#[derive(Debug, Clone, Default)]
pub struct UpstreamConfig {
    pub url: String,
    /// Applied to every upstream request.
    pub timeout: Duration,
    /// Skip the verification poll when false.
    pub verify: bool,
}

#[derive(Debug, Clone)]
pub struct DispatchConfig {
    pub listen_addr: SocketAddr,
    pub upstream: UpstreamConfig,
    pub refresh_interval: Duration,
    pub eviction_interval: Duration,
    /// Queued clients that stop polling for this long lose their place.
    pub queue_timeout: Duration,
    /// Assigned clients that go silent for this long lose their captcha.
    pub assignment_timeout: Duration,
    /// Steps per captcha when the item does not declare its own.
    pub default_steps: u32,
    pub verify_policy: RetryPolicy,
    /// Lifetime of the client token cookie.
    pub token_max_age: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            // SAFETY: This is a hardcoded valid address that will always parse
            listen_addr: "0.0.0.0:3000"
                .parse()
                .expect("default listen address is valid"),
            upstream: UpstreamConfig {
                url: "http://127.0.0.1:8080/api".to_string(),
                timeout: Duration::from_secs(15),
                verify: true,
            },
            refresh_interval: Duration::from_secs(30),
            eviction_interval: Duration::from_secs(10),
            queue_timeout: Duration::from_secs(60),
            assignment_timeout: Duration::from_secs(10 * 60),
            default_steps: 1,
            verify_policy: RetryPolicy::default(),
            token_max_age: Duration::from_secs(7 * 24 * 60 * 60),
        }
    }
}

impl DispatchConfig {
    pub fn new(listen_addr: SocketAddr, upstream_url: impl Into<String>) -> Self {
        let mut config = Self {
            listen_addr,
            ..Default::default()
        };
        config.upstream.url = upstream_url.into();
        config
    }

    pub fn with_queue_timeout(mut self, timeout: Duration) -> Self {
        self.queue_timeout = timeout;
        self
    }

    pub fn with_verify_policy(mut self, policy: RetryPolicy) -> Self {
        self.verify_policy = policy;
        self
    }
}
